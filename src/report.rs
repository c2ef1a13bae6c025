//! Run report - console table and JSON output

use anyhow::{Context, Result};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::collector::{RunSummary, Score};

/// Completed run plus where it was written
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub spreadsheet_url: String,
    pub worksheet_name: String,
    /// When the report was created, UTC RFC 3339
    pub timestamp: String,
    #[serde(flatten)]
    pub summary: RunSummary,
}

impl RunReport {
    pub fn new(spreadsheet_url: String, worksheet_name: String, summary: RunSummary) -> Self {
        Self {
            spreadsheet_url,
            worksheet_name,
            timestamp: chrono::Utc::now().to_rfc3339(),
            summary,
        }
    }

    /// Print the results table to stdout
    pub fn print_summary(&self) {
        let s = &self.summary;
        let scored = s.results.len() - s.failures();

        println!("\n{}", "Summary".yellow().bold());
        println!(
            "  Date: {} | Row: {} | Scored: {} | Errors: {}",
            s.date.white().bold(),
            s.row.to_string().white().bold(),
            scored.to_string().green().bold(),
            if s.failures() > 0 {
                s.failures().to_string().red().bold()
            } else {
                s.failures().to_string().dimmed()
            }
        );

        println!("\n{}", "Results".yellow().bold());
        println!(
            "  {:24} {:10} {:>8}",
            "Site".dimmed(),
            "Device".dimmed(),
            "Score".dimmed()
        );
        println!("  {}", "-".repeat(44).dimmed());

        for result in &s.results {
            let score = match &result.score {
                Score::Value(v) => format!("{:.2}", v).color(score_color(*v)).to_string(),
                Score::Error(_) => "Error".red().to_string(),
            };
            println!(
                "  {:24} {:10} {:>8}",
                truncate(&result.site_name, 24),
                result.device.label(),
                score
            );
        }
    }

    /// Save the report as `<date>-row<row>.json` under `output_dir`
    pub fn save(&self, output_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(output_dir).context("Failed to create output directory")?;

        let path = output_dir.join(self.file_name());
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;

        Ok(path)
    }

    fn file_name(&self) -> String {
        format!("pagespeed-{}-row{}.json", self.summary.date, self.summary.row)
    }
}

/// Lighthouse colour bands: 90+ good, 50-89 needs improvement, below 50 poor
fn score_color(score: f64) -> colored::Color {
    if score >= 90.0 {
        colored::Color::Green
    } else if score >= 50.0 {
        colored::Color::Yellow
    } else {
        colored::Color::Red
    }
}

/// Shorten `s` to at most `max_len` characters, marking the cut with `...`
pub(crate) fn truncate(s: &str, max_len: usize) -> String {
    match s.char_indices().nth(max_len) {
        None => s.to_string(),
        Some(_) => {
            let keep = max_len.saturating_sub(3);
            let end = s.char_indices().nth(keep).map_or(s.len(), |(i, _)| i);
            format!("{}...", &s[..end])
        }
    }
}
