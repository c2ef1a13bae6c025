//! Collection run - scores every configured site and writes one sheet row

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::{RunConfiguration, SiteEntry};
use crate::pagespeed::{ScoreSource, Strategy};
use crate::sheets::{column_index, CellValue, SheetConnector, Worksheet};

/// Pause between consecutive PageSpeed requests
pub const DEFAULT_REQUEST_DELAY: Duration = Duration::from_secs(2);

const DATE_COLUMN: u32 = 1;

/// Score for one (site, strategy) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Score {
    Value(f64),
    Error(String),
}

impl Score {
    pub fn value(&self) -> Option<f64> {
        match self {
            Score::Value(v) => Some(*v),
            Score::Error(_) => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Score::Error(_))
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Score::Value(v) => write!(f, "{:.2}", v),
            Score::Error(_) => f.write_str("Error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub site_name: String,
    pub device: Strategy,
    pub score: Score,
}

/// Outcome of a completed run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Date stamp written into column A
    pub date: String,
    /// Sheet row that received this run's scores
    pub row: u32,
    pub results: Vec<ScoreResult>,
}

impl RunSummary {
    pub fn failures(&self) -> usize {
        self.results.iter().filter(|r| r.score.is_error()).count()
    }
}

/// Progress notification emitted while a run is in flight
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    RowPrepared {
        row: u32,
        date: String,
    },
    PairStarted {
        site: String,
        strategy: Strategy,
    },
    PairScored {
        site: String,
        strategy: Strategy,
        score: f64,
        elapsed: Duration,
    },
    PairFailed {
        site: String,
        strategy: Strategy,
        error: String,
        elapsed: Duration,
    },
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Progress::RowPrepared { row, date } => {
                write!(f, "Writing results for {} to row {}", date, row)
            }
            Progress::PairStarted { site, strategy } => {
                write!(f, "Starting analysis of {} ({})...", site, strategy.as_query())
            }
            Progress::PairScored {
                site,
                strategy,
                score,
                elapsed,
            } => write!(
                f,
                "{} - {}: score {:.2}, took {:.2}s",
                site,
                strategy,
                score,
                elapsed.as_secs_f64()
            ),
            Progress::PairFailed {
                site,
                strategy,
                error,
                elapsed,
            } => write!(
                f,
                "{} ({}) failed: {}, took {:.2}s",
                site,
                strategy,
                error,
                elapsed.as_secs_f64()
            ),
        }
    }
}

/// Runs the sequential site x strategy loop against a score source and a sheet
pub struct Collector<S, C> {
    scores: S,
    sheets: C,
    delay: Duration,
    date: Option<NaiveDate>,
}

impl<S: ScoreSource, C: SheetConnector> Collector<S, C> {
    pub fn new(scores: S, sheets: C) -> Self {
        Self {
            scores,
            sheets,
            delay: DEFAULT_REQUEST_DELAY,
            date: None,
        }
    }

    /// Set the pause between requests
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Pin the date stamp instead of using today's local date
    #[cfg(test)]
    pub fn with_date(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }

    /// Execute one run, reporting progress through `on_progress`.
    ///
    /// Errors returned here abort the whole run; per-pair failures are
    /// recorded as `Score::Error` in the summary instead.
    pub fn run(
        &self,
        config: &RunConfiguration,
        mut on_progress: impl FnMut(Progress),
    ) -> Result<RunSummary> {
        let mut sheet = self
            .sheets
            .connect(config)
            .context("Failed to open worksheet")?;

        let date = self
            .date
            .unwrap_or_else(|| chrono::Local::now().date_naive())
            .format("%Y-%m-%d")
            .to_string();
        let row = next_free_row(sheet.as_ref())?;
        sheet
            .update_cell(row, DATE_COLUMN, CellValue::Text(date.clone()))
            .context("Failed to write date stamp")?;
        tracing::info!(row, date = %date, sites = config.sites.len(), "starting run");
        on_progress(Progress::RowPrepared {
            row,
            date: date.clone(),
        });

        let total = config.sites.len() * Strategy::ALL.len();
        let mut results = Vec::with_capacity(total);

        for site in &config.sites {
            for strategy in Strategy::ALL {
                on_progress(Progress::PairStarted {
                    site: site.name.clone(),
                    strategy,
                });

                let started = Instant::now();
                let outcome = self.score_pair(config, sheet.as_mut(), row, site, strategy);
                let elapsed = started.elapsed();

                let score = match outcome {
                    Ok(score) => {
                        on_progress(Progress::PairScored {
                            site: site.name.clone(),
                            strategy,
                            score,
                            elapsed,
                        });
                        Score::Value(score)
                    }
                    Err(e) => {
                        let error = format!("{:#}", e);
                        tracing::warn!(site = %site.name, strategy = strategy.as_query(), error = %error, "pair failed");
                        on_progress(Progress::PairFailed {
                            site: site.name.clone(),
                            strategy,
                            error: error.clone(),
                            elapsed,
                        });
                        Score::Error(error)
                    }
                };

                results.push(ScoreResult {
                    site_name: site.name.clone(),
                    device: strategy,
                    score,
                });

                if results.len() < total && !self.delay.is_zero() {
                    thread::sleep(self.delay);
                }
            }
        }

        Ok(RunSummary { date, row, results })
    }

    fn score_pair(
        &self,
        config: &RunConfiguration,
        sheet: &mut dyn Worksheet,
        row: u32,
        site: &SiteEntry,
        strategy: Strategy,
    ) -> Result<f64> {
        let score = self.scores.fetch_score(&config.api_key, &site.url, strategy)?;

        let column = match strategy {
            Strategy::Mobile => &site.mobile_column,
            Strategy::Desktop => &site.desktop_column,
        };
        let col = column_index(column)?;
        sheet.update_cell(row, col, CellValue::Number(score))?;

        Ok(score)
    }
}

fn next_free_row(sheet: &dyn Worksheet) -> Result<u32> {
    let filled = sheet
        .col_values(DATE_COLUMN)
        .context("Failed to read date column")?
        .len();
    let row = u32::try_from(filled + 1).context("Worksheet has too many rows")?;
    Ok(row)
}

/// Message delivered from a background run
#[derive(Debug)]
pub enum RunEvent {
    Progress(Progress),
    Finished(RunSummary),
    Failed(String),
}

/// Handle to a run executing on its own thread
pub struct RunHandle {
    events: Receiver<RunEvent>,
    worker: JoinHandle<()>,
}

impl RunHandle {
    /// Events in emission order; ends after the terminal event
    pub fn events(&self) -> impl Iterator<Item = RunEvent> + '_ {
        self.events.iter()
    }

    /// Wait for the worker thread to exit
    pub fn join(self) -> Result<()> {
        self.worker
            .join()
            .map_err(|_| anyhow::anyhow!("Collector thread panicked"))
    }
}

/// Start a run on a worker thread; the collector and configuration move into it
pub fn spawn_run<S, C>(collector: Collector<S, C>, config: RunConfiguration) -> Result<RunHandle>
where
    S: ScoreSource + Send + 'static,
    C: SheetConnector + Send + 'static,
{
    let (tx, rx) = mpsc::channel();

    let worker = thread::Builder::new()
        .name("collector".to_string())
        .spawn(move || {
            let progress_tx = tx.clone();
            let outcome = collector.run(&config, |p| {
                // The receiver may already be gone; the run still completes.
                let _ = progress_tx.send(RunEvent::Progress(p));
            });
            let terminal = match outcome {
                Ok(summary) => RunEvent::Finished(summary),
                Err(e) => RunEvent::Failed(format!("{:#}", e)),
            };
            let _ = tx.send(terminal);
        })
        .context("Failed to spawn collector thread")?;

    Ok(RunHandle { events: rx, worker })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;
    use std::sync::{Arc, Mutex};

    /// Scores keyed by (url, strategy); missing entries fail like an HTTP error
    struct FakeScores {
        scores: HashMap<(String, Strategy), f64>,
        calls: Arc<Mutex<Vec<(String, Strategy)>>>,
    }

    impl FakeScores {
        fn new(entries: &[(&str, Strategy, f64)]) -> Self {
            Self {
                scores: entries
                    .iter()
                    .map(|(u, s, v)| ((u.to_string(), *s), *v))
                    .collect(),
                calls: Arc::new(Mutex::new(vec![])),
            }
        }
    }

    impl ScoreSource for FakeScores {
        fn fetch_score(&self, _api_key: &str, url: &str, strategy: Strategy) -> Result<f64> {
            self.calls.lock().unwrap().push((url.to_string(), strategy));
            // Same scaling as the real client
            match self.scores.get(&(url.to_string(), strategy)) {
                Some(fraction) => Ok(fraction * 100.0),
                None => anyhow::bail!("HTTP 500 for {}", url),
            }
        }
    }

    #[derive(Default)]
    struct SheetState {
        existing_rows: usize,
        writes: Vec<(u32, u32, CellValue)>,
    }

    struct FakeSheet {
        state: Rc<RefCell<SheetState>>,
    }

    impl Worksheet for FakeSheet {
        fn col_values(&self, _col: u32) -> Result<Vec<String>> {
            Ok(vec!["x".to_string(); self.state.borrow().existing_rows])
        }

        fn update_cell(&mut self, row: u32, col: u32, value: CellValue) -> Result<()> {
            self.state.borrow_mut().writes.push((row, col, value));
            Ok(())
        }
    }

    struct FakeConnector {
        state: Rc<RefCell<SheetState>>,
        fail: bool,
    }

    impl FakeConnector {
        fn new(existing_rows: usize) -> (Self, Rc<RefCell<SheetState>>) {
            let state = Rc::new(RefCell::new(SheetState {
                existing_rows,
                writes: vec![],
            }));
            (
                Self {
                    state: state.clone(),
                    fail: false,
                },
                state,
            )
        }
    }

    impl SheetConnector for FakeConnector {
        fn connect(&self, _config: &RunConfiguration) -> Result<Box<dyn Worksheet>> {
            if self.fail {
                anyhow::bail!("Worksheet 'Sheet1' not found");
            }
            Ok(Box::new(FakeSheet {
                state: self.state.clone(),
            }))
        }
    }

    /// Thread-safe connector for spawned runs
    struct SendConnector;

    struct NullSheet;

    impl Worksheet for NullSheet {
        fn col_values(&self, _col: u32) -> Result<Vec<String>> {
            Ok(vec!["Date".to_string()])
        }

        fn update_cell(&mut self, _row: u32, _col: u32, _value: CellValue) -> Result<()> {
            Ok(())
        }
    }

    impl SheetConnector for SendConnector {
        fn connect(&self, _config: &RunConfiguration) -> Result<Box<dyn Worksheet>> {
            Ok(Box::new(NullSheet))
        }
    }

    fn site(name: &str, url: &str, mobile: &str, desktop: &str) -> SiteEntry {
        SiteEntry {
            name: name.to_string(),
            url: url.to_string(),
            mobile_column: mobile.to_string(),
            desktop_column: desktop.to_string(),
        }
    }

    fn config_with(sites: Vec<SiteEntry>) -> RunConfiguration {
        RunConfiguration {
            api_key: "key".to_string(),
            sites,
            ..RunConfiguration::default()
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_single_site_scenario() {
        let scores = FakeScores::new(&[
            ("https://example.com", Strategy::Mobile, 0.55),
            ("https://example.com", Strategy::Desktop, 0.91),
        ]);
        let (connector, state) = FakeConnector::new(3);
        let collector = Collector::new(scores, connector)
            .with_delay(Duration::ZERO)
            .with_date(date());

        let config = config_with(vec![site("Example", "https://example.com", "B", "C")]);
        let summary = collector.run(&config, |_| {}).unwrap();

        assert_eq!(summary.row, 4);
        assert_eq!(summary.date, "2024-05-01");

        let state = state.borrow();
        let writes = &state.writes;
        assert_eq!(writes.len(), 3);
        assert_eq!(writes[0], (4, 1, CellValue::Text("2024-05-01".to_string())));
        assert_eq!((writes[1].0, writes[1].1), (4, 2));
        assert_eq!((writes[2].0, writes[2].1), (4, 3));
        match (&writes[1].2, &writes[2].2) {
            (CellValue::Number(m), CellValue::Number(d)) => {
                assert!(approx(*m, 55.0));
                assert!(approx(*d, 91.0));
            }
            other => panic!("unexpected cell values {:?}", other),
        }

        assert_eq!(summary.results.len(), 2);
        assert_eq!(summary.results[0].site_name, "Example");
        assert_eq!(summary.results[0].device, Strategy::Mobile);
        assert!(approx(summary.results[0].score.value().unwrap(), 55.0));
        assert_eq!(summary.results[1].device, Strategy::Desktop);
        assert!(approx(summary.results[1].score.value().unwrap(), 91.0));
    }

    #[test]
    fn test_scales_fraction_exactly() {
        let scores = FakeScores::new(&[
            ("https://a.test", Strategy::Mobile, 0.87),
            ("https://a.test", Strategy::Desktop, 0.87),
        ]);
        let (connector, _state) = FakeConnector::new(0);
        let collector = Collector::new(scores, connector).with_delay(Duration::ZERO);

        let summary = collector
            .run(&config_with(vec![site("A", "https://a.test", "B", "C")]), |_| {})
            .unwrap();
        assert!(approx(summary.results[0].score.value().unwrap(), 87.0));
    }

    #[test]
    fn test_results_follow_site_then_strategy_order() {
        let scores = FakeScores::new(&[
            ("https://a.test", Strategy::Mobile, 0.1),
            ("https://a.test", Strategy::Desktop, 0.2),
            ("https://b.test", Strategy::Mobile, 0.3),
            ("https://b.test", Strategy::Desktop, 0.4),
            ("https://c.test", Strategy::Mobile, 0.5),
            ("https://c.test", Strategy::Desktop, 0.6),
        ]);
        let calls = scores.calls.clone();
        let (connector, _state) = FakeConnector::new(1);
        let collector = Collector::new(scores, connector).with_delay(Duration::ZERO);

        let config = config_with(vec![
            site("A", "https://a.test", "B", "C"),
            site("B", "https://b.test", "D", "E"),
            site("C", "https://c.test", "F", "G"),
        ]);
        let summary = collector.run(&config, |_| {}).unwrap();

        assert_eq!(summary.results.len(), 6);
        let order: Vec<(&str, Strategy)> = summary
            .results
            .iter()
            .map(|r| (r.site_name.as_str(), r.device))
            .collect();
        assert_eq!(
            order,
            vec![
                ("A", Strategy::Mobile),
                ("A", Strategy::Desktop),
                ("B", Strategy::Mobile),
                ("B", Strategy::Desktop),
                ("C", Strategy::Mobile),
                ("C", Strategy::Desktop),
            ]
        );
        assert_eq!(calls.lock().unwrap().len(), 6);
    }

    #[test]
    fn test_failed_pair_does_not_stop_run() {
        // Mobile for a.test is missing and fails
        let scores = FakeScores::new(&[
            ("https://a.test", Strategy::Desktop, 0.5),
            ("https://b.test", Strategy::Mobile, 0.6),
            ("https://b.test", Strategy::Desktop, 0.7),
        ]);
        let (connector, state) = FakeConnector::new(0);
        let collector = Collector::new(scores, connector).with_delay(Duration::ZERO);

        let config = config_with(vec![
            site("A", "https://a.test", "B", "C"),
            site("B", "https://b.test", "D", "E"),
        ]);
        let mut events = vec![];
        let summary = collector.run(&config, |p| events.push(p)).unwrap();

        assert_eq!(summary.results.len(), 4);
        assert!(summary.results[0].score.is_error());
        assert_eq!(summary.results[0].score.to_string(), "Error");
        assert!(!summary.results[1].score.is_error());
        assert!(!summary.results[2].score.is_error());
        assert!(!summary.results[3].score.is_error());
        assert_eq!(summary.failures(), 1);

        // Date plus three successful scores
        assert_eq!(state.borrow().writes.len(), 4);
        assert!(events
            .iter()
            .any(|e| matches!(e, Progress::PairFailed { site, .. } if site == "A")));
    }

    #[test]
    fn test_invalid_column_fails_only_that_pair() {
        let scores = FakeScores::new(&[
            ("https://a.test", Strategy::Mobile, 0.5),
            ("https://a.test", Strategy::Desktop, 0.6),
        ]);
        let (connector, state) = FakeConnector::new(0);
        let collector = Collector::new(scores, connector).with_delay(Duration::ZERO);

        let config = config_with(vec![site("A", "https://a.test", "", "C")]);
        let summary = collector.run(&config, |_| {}).unwrap();

        assert!(summary.results[0].score.is_error());
        assert!(!summary.results[1].score.is_error());
        assert_eq!(state.borrow().writes.len(), 2);
    }

    #[test]
    fn test_zero_sites_still_writes_date_once() {
        let (connector, state) = FakeConnector::new(7);
        let collector = Collector::new(FakeScores::new(&[]), connector)
            .with_delay(Duration::ZERO)
            .with_date(date());

        let summary = collector.run(&config_with(vec![]), |_| {}).unwrap();

        assert!(summary.results.is_empty());
        assert_eq!(summary.row, 8);
        let state = state.borrow();
        let writes = &state.writes;
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0], (8, 1, CellValue::Text("2024-05-01".to_string())));
    }

    #[test]
    fn test_date_written_once_for_many_sites() {
        let scores = FakeScores::new(&[
            ("https://a.test", Strategy::Mobile, 0.1),
            ("https://a.test", Strategy::Desktop, 0.2),
            ("https://b.test", Strategy::Mobile, 0.3),
            ("https://b.test", Strategy::Desktop, 0.4),
        ]);
        let (connector, state) = FakeConnector::new(2);
        let collector = Collector::new(scores, connector).with_delay(Duration::ZERO);

        let config = config_with(vec![
            site("A", "https://a.test", "B", "C"),
            site("B", "https://b.test", "D", "E"),
        ]);
        collector.run(&config, |_| {}).unwrap();

        let state = state.borrow();
        let writes = &state.writes;
        let date_writes = writes.iter().filter(|(_, col, _)| *col == 1).count();
        assert_eq!(date_writes, 1);
        assert!(writes.iter().all(|(row, _, _)| *row == 3));
    }

    #[test]
    fn test_connection_failure_aborts_run() {
        let scores = FakeScores::new(&[("https://a.test", Strategy::Mobile, 0.5)]);
        let calls = scores.calls.clone();
        let (mut connector, state) = FakeConnector::new(0);
        connector.fail = true;
        let collector = Collector::new(scores, connector).with_delay(Duration::ZERO);

        let mut events = vec![];
        let err = collector
            .run(
                &config_with(vec![site("A", "https://a.test", "B", "C")]),
                |p| events.push(p),
            )
            .unwrap_err();

        assert!(format!("{:#}", err).contains("not found"));
        assert!(events.is_empty());
        assert!(calls.lock().unwrap().is_empty());
        assert!(state.borrow().writes.is_empty());
    }

    #[test]
    fn test_progress_emitted_per_request() {
        let scores = FakeScores::new(&[
            ("https://a.test", Strategy::Mobile, 0.5),
            ("https://a.test", Strategy::Desktop, 0.6),
        ]);
        let (connector, _state) = FakeConnector::new(0);
        let collector = Collector::new(scores, connector).with_delay(Duration::ZERO);

        let mut events = vec![];
        collector
            .run(
                &config_with(vec![site("A", "https://a.test", "B", "C")]),
                |p| events.push(p),
            )
            .unwrap();

        assert_eq!(events.len(), 5);
        assert!(matches!(events[0], Progress::RowPrepared { row: 1, .. }));
        assert!(matches!(
            events[1],
            Progress::PairStarted {
                strategy: Strategy::Mobile,
                ..
            }
        ));
        assert!(matches!(
            events[2],
            Progress::PairScored {
                strategy: Strategy::Mobile,
                ..
            }
        ));
        assert!(matches!(
            events[4],
            Progress::PairScored {
                strategy: Strategy::Desktop,
                ..
            }
        ));
        assert!(events[2].to_string().starts_with("A - Mobile: score 50.00"));
    }

    #[test]
    fn test_spawned_run_streams_events_then_finishes() {
        let scores = FakeScores::new(&[
            ("https://a.test", Strategy::Mobile, 0.5),
            ("https://a.test", Strategy::Desktop, 0.6),
            ("https://b.test", Strategy::Mobile, 0.7),
        ]);
        let collector = Collector::new(scores, SendConnector).with_delay(Duration::ZERO);
        let config = config_with(vec![
            site("A", "https://a.test", "B", "C"),
            site("B", "https://b.test", "D", "E"),
        ]);

        let handle = spawn_run(collector, config).unwrap();
        let events: Vec<RunEvent> = handle.events().collect();
        handle.join().unwrap();

        let (terminal, progress) = events.split_last().unwrap();
        assert!(progress.iter().all(|e| matches!(e, RunEvent::Progress(_))));
        // Row prepared plus start and outcome for each of four pairs
        assert_eq!(progress.len(), 9);
        match terminal {
            RunEvent::Finished(summary) => {
                assert_eq!(summary.row, 2);
                assert_eq!(summary.results.len(), 4);
                assert!(summary.results[3].score.is_error());
            }
            other => panic!("expected Finished, got {:?}", other),
        }
    }

    #[test]
    fn test_spawned_run_reports_aggregate_failure() {
        struct Broken;
        impl SheetConnector for Broken {
            fn connect(&self, _config: &RunConfiguration) -> Result<Box<dyn Worksheet>> {
                anyhow::bail!("credentials file missing")
            }
        }

        let collector = Collector::new(FakeScores::new(&[]), Broken);
        let handle = spawn_run(collector, config_with(vec![])).unwrap();
        let events: Vec<RunEvent> = handle.events().collect();
        handle.join().unwrap();

        assert_eq!(events.len(), 1);
        match &events[0] {
            RunEvent::Failed(msg) => assert!(msg.contains("credentials file missing")),
            other => panic!("expected Failed, got {:?}", other),
        }
    }
}
