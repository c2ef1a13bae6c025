mod collector;
mod config;
mod google;
mod pagespeed;
mod report;
mod sheets;

pub use collector::{
    spawn_run, Collector, Progress, RunEvent, RunHandle, RunSummary, Score, ScoreResult,
    DEFAULT_REQUEST_DELAY,
};
pub use config::{ConfigStore, LoadedConfig, RunConfiguration, SiteEntry};
pub use google::GoogleSheets;
pub use pagespeed::{PageSpeedClient, ScoreSource, Strategy};
pub use report::RunReport;
pub use sheets::{CellValue, SheetConnector, Worksheet};

use anyhow::Result;
use colored::Colorize;
use std::path::Path;
use std::time::Duration;

/// Run one collection against the live APIs, rendering progress as it arrives
pub fn collect(
    config: RunConfiguration,
    delay: Duration,
    output: Option<&Path>,
) -> Result<RunReport> {
    println!(
        "{} Collecting scores for {} sites into {}",
        ">>".yellow(),
        config.sites.len(),
        config.worksheet_name.cyan().bold()
    );

    let collector = Collector::new(PageSpeedClient::new()?, GoogleSheets::new()?).with_delay(delay);
    let spreadsheet_url = config.spreadsheet_url.clone();
    let worksheet_name = config.worksheet_name.clone();

    let handle = spawn_run(collector, config)?;
    let mut outcome = None;
    for event in handle.events() {
        match event {
            RunEvent::Progress(progress) => print_progress(&progress),
            RunEvent::Finished(summary) => outcome = Some(Ok(summary)),
            RunEvent::Failed(message) => outcome = Some(Err(message)),
        }
    }
    handle.join()?;

    let summary = match outcome {
        Some(Ok(summary)) => summary,
        Some(Err(message)) => anyhow::bail!("Run failed: {}", message),
        None => anyhow::bail!("Run ended without reporting a result"),
    };
    println!("{} Data collection and sheet update complete", "✓".green());

    let report = RunReport::new(spreadsheet_url, worksheet_name, summary);
    if let Some(dir) = output {
        let path = report.save(dir)?;
        println!(
            "  {} Saved: {}",
            "✓".green(),
            path.display().to_string().dimmed()
        );
    }

    Ok(report)
}

fn print_progress(progress: &Progress) {
    match progress {
        Progress::RowPrepared { .. } => println!("{} {}", "📋".yellow(), progress),
        Progress::PairStarted { .. } => println!("{} {}", "▶".cyan(), progress),
        Progress::PairScored { .. } => println!("  {} {}", "✓".green(), progress),
        Progress::PairFailed { .. } => println!("  {} {}", "✗".red(), progress.to_string().red()),
    }
}
