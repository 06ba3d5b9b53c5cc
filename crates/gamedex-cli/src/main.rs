use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use gamedex_sync::{PipelineConfig, ReferenceSource, ScrapePipeline};

const CRATE_TARGETS: [&str; 4] = [
    "gamedex_cli",
    "gamedex_sync",
    "gamedex_adapters",
    "gamedex_storage",
];

#[derive(Debug, Parser)]
#[command(name = "gamedex-cli")]
#[command(about = "Scrape game metadata and Game Pass availability per console")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once for a console
    Scrape(ScrapeArgs),
    /// Extract a record from a saved game page
    Extract {
        file: PathBuf,
        #[arg(long, default_value = "file://local")]
        url: String,
    },
}

#[derive(Debug, Default, Args)]
struct ScrapeArgs {
    #[arg(long, env = "CONSOLE")]
    console: Option<String>,
    #[arg(long)]
    links_dir: Option<PathBuf>,
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// http(s) URL or local path of the availability CSV
    #[arg(long)]
    reference_source: Option<String>,
    #[arg(long)]
    concurrency: Option<usize>,
}

fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directives = CRATE_TARGETS
            .iter()
            .map(|target| format!("{target}={level}"))
            .collect::<Vec<_>>()
            .join(",");
        EnvFilter::new(directives)
    });

    match cli.log_format {
        LogFormat::Text => fmt().with_env_filter(env_filter).with_target(false).init(),
        LogFormat::Json => fmt().json().with_env_filter(env_filter).init(),
    }
}

fn pipeline_config(args: ScrapeArgs) -> Result<PipelineConfig> {
    let mut config = match args.console {
        Some(console) => PipelineConfig::new(console).with_env_overrides(),
        None => PipelineConfig::from_env().context("pass --console or set CONSOLE")?,
    };
    if let Some(dir) = args.links_dir {
        config.links_dir = dir;
    }
    if let Some(dir) = args.output_dir {
        config.output_dir = dir;
    }
    if let Some(source) = args.reference_source {
        config.reference_source = ReferenceSource::parse(&source);
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    match cli.command.unwrap_or_else(|| Commands::Scrape(ScrapeArgs::default())) {
        Commands::Scrape(args) => {
            let pipeline = ScrapePipeline::new(pipeline_config(args)?)?;
            let summary = pipeline.run_once().await?;
            println!(
                "scrape complete: run_id={} console={} scraped={}/{} failed={} output={} sha256={}",
                summary.run_id,
                summary.console,
                summary.scraped,
                summary.requested,
                summary.failed,
                summary.output_path,
                summary.output_sha256
            );
        }
        Commands::Extract { file, url } => {
            let html = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let document = scraper::Html::parse_document(&html);
            let record = gamedex_adapters::extract_game_record(&document, &url)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
    }

    Ok(())
}
