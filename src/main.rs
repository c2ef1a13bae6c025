use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::path::PathBuf;
use std::time::Duration;

use pagespeed_sheets::{ConfigStore, RunConfiguration, SiteEntry};

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level);

    let store = ConfigStore::new(cli.config);
    let loaded = store.load();
    if let Some(warning) = &loaded.warning {
        eprintln!("{} {}", "⚠".yellow(), warning.yellow());
    }
    let mut config = loaded.config;

    match cli.command {
        Command::Run { output, delay_secs } => {
            let report = pagespeed_sheets::collect(
                config,
                Duration::from_secs(delay_secs),
                output.as_deref(),
            )?;
            report.print_summary();
        }
        Command::Config { action } => match action {
            ConfigAction::Show => print_config(&store, &config),
            ConfigAction::Set(fields) => {
                fields.apply(&mut config);
                save(&store, &config)?;
            }
        },
        Command::Site { action } => match action {
            SiteAction::List => print_sites(&config),
            SiteAction::Add {
                name,
                url,
                mobile_column,
                desktop_column,
            } => {
                config.add_site(SiteEntry {
                    name,
                    url,
                    mobile_column,
                    desktop_column,
                });
                save(&store, &config)?;
                print_sites(&config);
            }
            SiteAction::Remove { index } => {
                let removed = config.remove_site(index)?;
                save(&store, &config)?;
                println!("{} Removed {}", "✓".green(), removed.name.cyan());
                print_sites(&config);
            }
        },
    }

    Ok(())
}

#[derive(Parser)]
#[command(
    name = "pagespeed-sheets",
    about = "Record PageSpeed Insights scores in a Google Sheets worksheet",
    version
)]
struct Cli {
    /// Configuration file (default: ~/.pagespeed_analyzer_config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true, value_enum, default_value = "warn")]
    log_level: LogLevel,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Score every configured site and append a row to the worksheet
    Run {
        /// Directory to save the JSON report in
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Seconds to wait between PageSpeed requests
        #[arg(long, default_value = "2")]
        delay_secs: u64,
    },
    /// Show or edit the API key and sheet settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Edit the site table
    Site {
        #[command(subcommand)]
        action: SiteAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    Set(ConfigFields),
}

#[derive(Args)]
struct ConfigFields {
    #[arg(long)]
    api_key: Option<String>,
    /// Service account JSON key file
    #[arg(long)]
    credentials: Option<PathBuf>,
    #[arg(long)]
    spreadsheet_url: Option<String>,
    #[arg(long)]
    worksheet: Option<String>,
}

impl ConfigFields {
    fn apply(self, config: &mut RunConfiguration) {
        if let Some(api_key) = self.api_key {
            config.api_key = api_key;
        }
        if let Some(path) = self.credentials {
            config.credentials_path = path.display().to_string();
        }
        if let Some(url) = self.spreadsheet_url {
            config.spreadsheet_url = url;
        }
        if let Some(worksheet) = self.worksheet {
            config.worksheet_name = worksheet;
        }
    }
}

#[derive(Subcommand)]
enum SiteAction {
    List,
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        url: String,
        /// Column letters for the mobile score
        #[arg(long)]
        mobile_column: String,
        /// Column letters for the desktop score
        #[arg(long)]
        desktop_column: String,
    },
    /// Remove the site at INDEX as shown by `site list`
    Remove { index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

fn init_logging(level: LogLevel) {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::from(level))
        .with_writer(std::io::stderr)
        .init();
}

fn save(store: &ConfigStore, config: &RunConfiguration) -> Result<()> {
    store.save(config)?;
    println!(
        "{} Configuration saved to {}",
        "✓".green(),
        store.path().display().to_string().dimmed()
    );
    Ok(())
}

fn print_config(store: &ConfigStore, config: &RunConfiguration) {
    println!("{}", "Configuration".yellow().bold());
    println!("  File:            {}", store.path().display().to_string().dimmed());
    println!("  API key:         {}", mask(&config.api_key));
    println!("  Credentials:     {}", or_unset(&config.credentials_path));
    println!("  Spreadsheet URL: {}", or_unset(&config.spreadsheet_url));
    println!("  Worksheet:       {}", or_unset(&config.worksheet_name));
    println!();
    print_sites(config);
}

fn print_sites(config: &RunConfiguration) {
    println!("{}", "Sites".yellow().bold());
    if config.sites.is_empty() {
        println!("  {}", "(none)".dimmed());
        return;
    }

    println!(
        "  {:>3} {:20} {:40} {:>7} {:>8}",
        "#".dimmed(),
        "Name".dimmed(),
        "URL".dimmed(),
        "Mobile".dimmed(),
        "Desktop".dimmed()
    );
    for (i, site) in config.sites.iter().enumerate() {
        println!(
            "  {:>3} {:20} {:40} {:>7} {:>8}",
            i, site.name, site.url, site.mobile_column, site.desktop_column
        );
    }
}

fn mask(secret: &str) -> String {
    let count = secret.chars().count();
    if count == 0 {
        return "(unset)".dimmed().to_string();
    }
    let tail: String = secret.chars().skip(count.saturating_sub(4)).collect();
    format!("****{}", tail)
}

fn or_unset(value: &str) -> String {
    if value.is_empty() {
        "(unset)".dimmed().to_string()
    } else {
        value.to_string()
    }
}
