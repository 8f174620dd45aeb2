use std::path::PathBuf;

use bytesize::ByteSize;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use tracing_subscriber::EnvFilter;

use weightvault::{
    api,
    catalog::Catalog,
    config::Config,
    download::{AssetType, BatchReport, TaskRequest, TaskStatus},
    service::AssetService,
    storage::{ConsumerKind, StorageManager},
    verify::Digest,
};

#[derive(Parser, Debug)]
#[command(name = "weightvault", version, about)]
struct Cli {
    #[clap(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the storage tree and print the cache environment
    Init,

    /// Bind a tool installation to canonical storage with symlinks
    Link {
        /// Root of the tool installation
        root: PathBuf,
        #[clap(long, short)]
        consumer: ConsumerKind,
    },

    /// Remove the symlinks created by `link` and restore backups
    Unlink {
        root: PathBuf,
        #[clap(long, short)]
        consumer: ConsumerKind,
    },

    /// Download a single file into storage
    Fetch {
        url: String,
        #[clap(long = "type", short = 't', default_value = "other")]
        asset_type: AssetType,
        #[clap(long)]
        filename: Option<String>,
        #[clap(long)]
        sha256: Option<Digest>,
        #[clap(long)]
        size: Option<u64>,
        #[clap(long)]
        max_retries: Option<u32>,
    },

    /// Download entries from a JSON catalog (all of them when none are named)
    FetchCatalog {
        catalog: PathBuf,
        names: Vec<String>,
    },

    /// Move a local file into the canonical directory for its type
    Organize {
        file: PathBuf,
        #[clap(long = "type", short = 't')]
        asset_type: AssetType,
    },

    /// Show file counts and sizes per category
    Usage {
        #[clap(long)]
        json: bool,
    },

    /// Remove byte-identical duplicates from storage
    Dedup,

    /// Empty one cache directory (huggingface, torch, pip, downloads)
    ClearCache { cache: String },

    /// Print the cache environment as shell exports
    Env,

    /// Serve the HTTP API
    Serve {
        #[clap(long, env = "WV_HOST", default_value = "127.0.0.1:3000")]
        host: String,
    },
}

fn print_report(report: &BatchReport) {
    for task in &report.tasks {
        match task.status() {
            TaskStatus::Completed if task.skipped => {
                println!("skipped   {} (already present)", task.destination_path().display())
            }
            TaskStatus::Completed => println!("completed {}", task.destination_path().display()),
            status => println!(
                "{status:<9} {} ({})",
                task.filename,
                task.last_error.as_deref().unwrap_or("no error recorded")
            ),
        }
    }
    println!(
        "{} total, {} completed, {} failed, {} cancelled in {:.1}s",
        report.total,
        report.completed,
        report.failed,
        report.cancelled,
        report.elapsed.as_secs_f64()
    );
}

async fn run_batch(service: &AssetService) -> Result<()> {
    let report = service.process().await?;
    print_report(&report);
    if report.failed > 0 {
        return Err(eyre!("{} of {} downloads failed", report.failed, report.total));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = cli.config;
    let storage = StorageManager::new(config.storage.root());

    match cli.command {
        Command::Init => {
            let env = storage.initialize()?;
            tracing::info!("Storage ready at {}", storage.root().display());
            print!("{}", env.shell_exports());
        }
        Command::Env => {
            print!("{}", storage.cache_environment().shell_exports());
        }
        Command::Link { root, consumer } => {
            storage.initialize()?;
            let report = storage.link_consumer(&root, consumer)?;
            for (from, to) in &report.backups {
                println!("backup  {} -> {}", from.display(), to.display());
            }
            for (link, target) in &report.links {
                println!("link    {} -> {}", link.display(), target.display());
            }
        }
        Command::Unlink { root, consumer } => {
            let report = storage.unlink_consumer(&root, consumer)?;
            for (backup, original) in &report.restored {
                println!("restore {} -> {}", backup.display(), original.display());
            }
            println!("{} links removed", report.removed.len());
        }
        Command::Fetch {
            url,
            asset_type,
            filename,
            sha256,
            size,
            max_retries,
        } => {
            let service = AssetService::from_config(&config)?;
            service.submit(TaskRequest {
                url,
                asset_type,
                filename,
                expected_size: size,
                sha256,
                metadata: Default::default(),
                priority: 0,
                max_retries,
            });
            run_batch(&service).await?;
        }
        Command::FetchCatalog { catalog, names } => {
            let catalog = Catalog::load(&catalog)
                .await
                .wrap_err_with(|| format!("reading catalog {}", catalog.display()))?;
            let service = AssetService::from_config(&config)?;
            for request in catalog.requests(&names)? {
                service.submit(request);
            }
            run_batch(&service).await?;
        }
        Command::Organize { file, asset_type } => {
            let placed = storage.organize(&file, asset_type)?;
            println!("{}", placed.display());
        }
        Command::Usage { json } => {
            let usage = storage.usage()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&usage)?);
            } else {
                for (category, stats) in &usage.categories {
                    println!(
                        "{category:<10} {:>6} files {:>12}",
                        stats.total.files,
                        ByteSize::b(stats.total.bytes).to_string()
                    );
                    for (sub, stats) in stats.subcategories.iter().filter(|(_, s)| s.files > 0) {
                        println!(
                            "  {sub:<12} {:>6} files {:>12}",
                            stats.files,
                            ByteSize::b(stats.bytes).to_string()
                        );
                    }
                }
                println!(
                    "total      {:>6} files {:>12}",
                    usage.total.files,
                    ByteSize::b(usage.total.bytes).to_string()
                );
                if let Some(free) = usage.available_bytes {
                    println!("free       {:>25}", ByteSize::b(free).to_string());
                }
            }
        }
        Command::Dedup => {
            let service = AssetService::from_config(&config)?;
            let report = service.deduplicate().await?;
            for duplicate in &report.duplicates {
                println!(
                    "removed {} (same as {})",
                    duplicate.removed.display(),
                    duplicate.kept.display()
                );
            }
            println!(
                "{} duplicates removed, {} freed",
                report.removed_count(),
                ByteSize::b(report.bytes_freed)
            );
        }
        Command::ClearCache { cache } => {
            let removed = storage.clear_cache(&cache)?;
            println!("{removed} entries removed from cache/{cache}");
        }
        Command::Serve { host } => {
            let service = std::sync::Arc::new(AssetService::from_config(&config)?);
            let app = api::create_router(service);
            let listener = tokio::net::TcpListener::bind(&host)
                .await
                .wrap_err_with(|| format!("binding {host}"))?;
            tracing::info!("Listening on: {}", listener.local_addr()?);
            axum::serve(listener, app).await?;
        }
    }

    Ok(())
}
