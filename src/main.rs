mod browser;
mod catalog;
mod model;
mod parser;
mod report;
mod scraper;
mod settings;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use browser::{ConnectMode, PageClient};
use model::{listing_url, ItemDescriptor, ListType};
use report::CsvReport;
use scraper::Collector;
use settings::{Overrides, Settings};

#[derive(Parser)]
#[command(name = "youpin_scraper", about = "CS2 sell/rent price collector for youpin898")]
struct Cli {
    /// Config file (default: ./youpin.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Item catalog CSV: name, standard_id, premium_id
    #[arg(short, long, global = true)]
    input: Option<PathBuf>,
    /// Directory for result_*.csv files
    #[arg(short, long, global = true)]
    output_dir: Option<PathBuf>,
    /// Items per output file
    #[arg(short = 'b', long, global = true)]
    batch_size: Option<usize>,
    /// Attach to an already running Chrome
    #[arg(long, global = true, conflicts_with = "launch")]
    attach: bool,
    /// Launch Chrome with the debug profile before attaching
    #[arg(long, global = true)]
    launch: bool,
    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect prices for every catalog item (default)
    Run,
    /// Print the catalog and the listing URLs it expands to
    Catalog,
    /// Dump what the price selectors see on one listing page
    Probe {
        template_id: String,
        #[arg(short, long, value_enum, default_value = "sell")]
        list_type: ListType,
    },
}

impl Cli {
    fn overrides(&self) -> Overrides {
        let auto_launch = match (self.attach, self.launch) {
            (true, _) => Some(false),
            (_, true) => Some(true),
            _ => None,
        };
        Overrides {
            input_csv: self.input.clone(),
            output_dir: self.output_dir.clone(),
            batch_size: self.batch_size,
            auto_launch,
            log_level: self.log_level.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref(), &cli.overrides())?;
    let _guard = init_tracing(&settings)?;

    let t0 = Instant::now();
    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&settings).await,
        Commands::Catalog => show_catalog(&settings),
        Commands::Probe {
            template_id,
            list_type,
        } => probe(&settings, &template_id, list_type).await,
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

/// stderr plus an optional plain-text log file. Keep the guard alive until exit.
fn init_tracing(settings: &Settings) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_level));
    let stderr = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let (file_layer, guard) = match &settings.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|d| !d.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let name = path
                .file_name()
                .with_context(|| format!("log_file {:?} has no file name", path))?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log dir {:?}", dir))?;
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file_layer)
        .init();
    Ok(guard)
}

async fn run(settings: &Settings) -> Result<ExitCode> {
    let items = load_items(settings);
    if items.is_empty() {
        println!(
            "No items to collect. Put rows of `name,standard_id,premium_id` in {:?}.",
            settings.input_csv
        );
        return Ok(ExitCode::FAILURE);
    }
    println!("Collecting {} items from {:?}", items.len(), settings.input_csv);

    let client = match connect(settings).await {
        Some(client) => client,
        None => return Ok(ExitCode::FAILURE),
    };

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if watch_interrupts(tokio::signal::ctrl_c, on_ctrl_c).await {
            warn!("Second Ctrl-C, exiting without saving");
            std::process::exit(130);
        }
    });

    let t_run = Instant::now();
    let summary = Collector::new(settings, &client, CsvReport::new(&settings.output_dir), cancel)
        .run(&items)
        .await?;
    let s = &summary.stats;
    println!(
        "Collected {}/{} items ({} failed) in {}",
        s.items,
        items.len(),
        s.items_failed,
        format_duration(t_run.elapsed())
    );
    println!(
        "Pages: {} priced, {} empty, {} failed",
        s.pages_priced, s.pages_empty, s.pages_failed
    );
    if summary.cancelled {
        println!("Run was cancelled; records collected so far were saved.");
    }

    match summary.last_output {
        Some(path) => {
            println!("Wrote {} records to {} file(s). Latest: {}", s.records_written, s.files_written, path.display());
            Ok(ExitCode::SUCCESS)
        }
        None => {
            println!("No data collected.");
            Ok(ExitCode::FAILURE)
        }
    }
}

/// First interrupt cancels the run; returns true when a second one arrives.
async fn watch_interrupts<F, Fut>(mut next: F, cancel: CancellationToken) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    if next().await.is_err() {
        return false;
    }
    warn!("Ctrl-C received, stopping after the current page (press again to quit now)");
    cancel.cancel();
    next().await.is_ok()
}

/// A missing or unreadable catalog counts as empty.
fn load_items(settings: &Settings) -> Vec<ItemDescriptor> {
    match catalog::load(&settings.input_csv) {
        Ok(items) => items,
        Err(e) => {
            error!("{:#}", e);
            Vec::new()
        }
    }
}

/// Connects, or prints how to start Chrome by hand and returns `None`.
async fn connect(settings: &Settings) -> Option<browser::ChromeClient> {
    let mode = ConnectMode::from_settings(settings);
    match browser::connect(settings, mode).await {
        Ok(client) => Some(client),
        Err(e) => {
            error!("Could not connect to Chrome: {}", e);
            println!("Could not connect to Chrome on port {}.", settings.debug_port);
            println!("Start it with remote debugging enabled:\n\n    {}\n", settings.chrome_command_line());
            println!("Then run again with --attach.");
            None
        }
    }
}

fn show_catalog(settings: &Settings) -> Result<ExitCode> {
    let items = catalog::load(&settings.input_csv)?;
    if items.is_empty() {
        println!("No items in {:?}.", settings.input_csv);
        return Ok(ExitCode::FAILURE);
    }

    println!("{:>3} | {:<40} | {:<4} | {:<12}", "#", "Item", "Ver", "Template");
    println!("{}", "-".repeat(68));
    let mut pages = 0;
    for (i, item) in items.iter().enumerate() {
        let name = truncate(&item.name, 40);
        if item.variants().next().is_none() {
            println!("{:>3} | {:<40} | {:<4} | {:<12}", i + 1, name, "-", "-");
            continue;
        }
        for (variant, template_id) in item.variants() {
            println!("{:>3} | {:<40} | {:<4} | {:<12}", i + 1, name, variant, template_id);
            for list_type in ListType::ALL {
                let url = listing_url(&settings.base_url, settings.game_id, template_id, list_type)?;
                println!("    {:<4} {}", list_type, url);
                pages += 1;
            }
        }
    }

    let secs = pages as f64 * (settings.min_delay_secs + settings.max_delay_secs) / 2.0;
    println!(
        "\n{} items | {} pages | ~{} of pacing delay",
        items.len(),
        pages,
        format_duration(std::time::Duration::from_secs_f64(secs))
    );
    Ok(ExitCode::SUCCESS)
}

async fn probe(settings: &Settings, template_id: &str, list_type: ListType) -> Result<ExitCode> {
    let url = listing_url(&settings.base_url, settings.game_id, template_id, list_type)?;
    let client = match connect(settings).await {
        Some(client) => client,
        None => return Ok(ExitCode::FAILURE),
    };

    info!("Probing {}", url);
    client.navigate(url.as_str()).await?;
    let appeared = client
        .wait_for_selector(&settings.price_selector, settings.content_wait())
        .await;
    println!("{} ({} selector {})", url, settings.price_selector, if appeared { "matched" } else { "timed out" });

    let mut selector = settings.price_selector.as_str();
    let mut elements = client.query_all(selector).await?;
    if elements.is_empty() {
        selector = settings.fallback_selector.as_str();
        elements = client.query_all(selector).await?;
    }
    println!("{} elements via {}\n", elements.len(), selector);

    let mut fragments = Vec::new();
    for (i, el) in elements.iter().enumerate() {
        let text = match client.read_text(el).await {
            Ok(text) => text,
            Err(e) => {
                println!("{:>3} | <unreadable: {}>", i + 1, e);
                continue;
            }
        };
        let wear = parser::wear_for_fragment(&text)
            .map(|w| format!("{} ({})", w, w.english()))
            .unwrap_or_else(|| "-".into());
        let price = parser::extract_price(&text)
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "{:>3} | {:<40} | {:<28} | {}",
            i + 1,
            truncate(&text.replace('\n', " / "), 40),
            wear,
            price
        );
        fragments.push(text);
    }

    let prices = parser::extract_prices(&fragments);
    println!("\n{} of 5 wear conditions priced:", prices.found());
    for (wear, price) in prices.iter() {
        let price = price.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
        println!("  {:<14} {}", wear.english(), price);
    }
    Ok(ExitCode::SUCCESS)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
