use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use socmed_archiver::config::Config;
use socmed_archiver::extract::{ExtractOptions, Extractor};
use socmed_archiver::instagram::bootstrap::{Bootstrap, SyncOptions};
use socmed_archiver::instagram::enricher::{EnrichOptions, Enricher};
use socmed_archiver::store::SyncTracker;

#[derive(Parser)]
#[command(name = "socmed-archiver", version, about = "Archive saved Instagram content locally")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enrich archived stub records through the private API
    Enrich {
        #[command(subcommand)]
        command: EnrichCommand,
    },
    /// Extract text from downloaded media (Whisper + OCR)
    Extract {
        #[command(subcommand)]
        command: ExtractCommand,
    },
    /// Ingest everything currently saved, straight from the API
    Bootstrap {
        #[command(subcommand)]
        command: BootstrapCommand,
    },
    /// Show sync cursor status for all pipelines
    Status,
}

#[derive(Subcommand)]
enum EnrichCommand {
    /// Run the enrichment loop
    Run {
        /// Max posts to process (default: all pending)
        #[arg(long)]
        limit: Option<usize>,
        /// Seconds between API requests
        #[arg(long, default_value_t = 3.0)]
        delay: f64,
        /// Save progress every N posts
        #[arg(long, default_value_t = 25)]
        save_every: usize,
        /// Skip media download (metadata only)
        #[arg(long)]
        no_media: bool,
        /// Only enrich posts in this collection (substring match)
        #[arg(long)]
        collection: Option<String>,
    },
    /// Download media for already-enriched posts missing local files
    DownloadMedia {
        /// Max posts to process (default: all)
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show enrichment statistics
    Stats,
    /// Test authentication and media download
    Test,
}

#[derive(Subcommand)]
enum ExtractCommand {
    /// Run the extraction pipeline
    Run {
        /// Only extract from this collection (substring match)
        #[arg(long)]
        collection: Option<String>,
        /// Max posts to process
        #[arg(long)]
        limit: Option<usize>,
        /// Save progress every N posts
        #[arg(long, default_value_t = 10)]
        save_every: usize,
        /// Skip audio transcription (OCR only)
        #[arg(long)]
        skip_whisper: bool,
        /// Skip OCR (audio transcription only)
        #[arg(long)]
        skip_ocr: bool,
    },
    /// Show extraction statistics
    Stats,
    /// Show extraction results for a post
    Sample {
        /// Specific post shortcode
        #[arg(long)]
        post_id: Option<String>,
        /// Show a sample from this collection
        #[arg(long)]
        collection: Option<String>,
    },
}

#[derive(Subcommand)]
enum BootstrapCommand {
    /// Sync saved posts from the API into the archive
    Sync {
        /// Max posts to fetch (default: all)
        #[arg(long)]
        limit: Option<usize>,
        /// Seconds between feed page requests
        #[arg(long, default_value_t = 2.0)]
        delay: f64,
        /// Skip media download
        #[arg(long)]
        no_media: bool,
        /// Only sync posts in this collection (substring match)
        #[arg(long)]
        collection: Option<String>,
    },
    /// List saved collections from the API
    Collections,
    /// Compare API collections against the local archive
    Stats,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing()?;

    let cli = Cli::parse();
    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    match cli.command {
        Commands::Enrich { command } => {
            let enricher = Enricher::new(config)?;
            match command {
                EnrichCommand::Run {
                    limit,
                    delay,
                    save_every,
                    no_media,
                    collection,
                } => {
                    let opts = EnrichOptions {
                        limit,
                        delay,
                        save_every,
                        download_media: !no_media,
                        collection,
                    };
                    enricher.run(&opts).await?;
                }
                EnrichCommand::DownloadMedia { limit } => {
                    enricher.run_media_download(limit).await?;
                }
                EnrichCommand::Stats => println!("{}", enricher.stats().await?),
                EnrichCommand::Test => println!("{}", enricher.self_test().await?),
            }
        }
        Commands::Extract { command } => {
            let extractor = Extractor::new(config);
            match command {
                ExtractCommand::Run {
                    collection,
                    limit,
                    save_every,
                    skip_whisper,
                    skip_ocr,
                } => {
                    let opts = ExtractOptions {
                        collection,
                        limit,
                        save_every,
                        skip_whisper,
                        skip_ocr,
                    };
                    extractor.run(&opts).await?;
                }
                ExtractCommand::Stats => println!("{}", extractor.stats().await?),
                ExtractCommand::Sample {
                    post_id,
                    collection,
                } => println!(
                    "{}",
                    extractor
                        .sample(post_id.as_deref(), collection.as_deref())
                        .await?
                ),
            }
        }
        Commands::Bootstrap { command } => {
            let bootstrap = Bootstrap::new(config)?;
            match command {
                BootstrapCommand::Sync {
                    limit,
                    delay,
                    no_media,
                    collection,
                } => {
                    let opts = SyncOptions {
                        limit,
                        delay,
                        download_media: !no_media,
                        collection,
                    };
                    bootstrap.run_sync(&opts).await?;
                }
                BootstrapCommand::Collections => {
                    println!("{}", bootstrap.collections_report().await?);
                }
                BootstrapCommand::Stats => println!("{}", bootstrap.stats().await?),
            }
        }
        Commands::Status => {
            let tracker = SyncTracker::new(config.sync_state_path());
            println!("{}", tracker.summary()?);
        }
    }

    Ok(())
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,socmed_archiver=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    Ok(())
}
