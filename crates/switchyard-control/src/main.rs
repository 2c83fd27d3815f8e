//! Switchyard control plane CLI.
//!
//! `serve` runs the admin API and background loops. `validate` and `render`
//! work offline on exported snapshot bundles.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use switchyard_control::config::ControlConfig;
use switchyard_control::error::ControlError;
use switchyard_control::snapshot::{check_bundle, SnapshotBundle};
use switchyard_control::{db, server};

#[derive(Parser, Debug)]
#[command(
    name = "switchyard-control",
    about = "Switchyard reverse-proxy configuration control plane",
    version
)]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true, env = "SWITCHYARD_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the control plane HTTP server.
    Serve {
        /// Listen address (overrides the config file).
        #[arg(long, env = "SWITCHYARD_LISTEN")]
        listen: Option<SocketAddr>,

        /// PostgreSQL database URL (overrides the config file).
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,
    },

    /// Check a snapshot bundle for rule errors, conflicts and dangling references.
    Validate {
        /// Exported snapshot bundle (JSON).
        #[arg(long)]
        bundle: PathBuf,
    },

    /// Print the proxy configuration a snapshot bundle renders to.
    Render {
        /// Exported snapshot bundle (JSON).
        #[arg(long)]
        bundle: PathBuf,
    },

    /// Apply database migrations and exit.
    Migrate {
        /// PostgreSQL database URL.
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match ControlConfig::load_or_default(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(3);
        }
    };

    match cli.command {
        Command::Serve {
            listen,
            database_url,
        } => {
            if let Some(listen) = listen {
                config.listen = listen;
            }
            if database_url.is_some() {
                config.database_url = database_url;
            }

            let metrics = match switchyard_telemetry::init(&config.logging, &config.metrics) {
                Ok(metrics) => metrics,
                Err(e) => {
                    eprintln!("error: {e}");
                    return ExitCode::from(1);
                }
            };

            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    eprintln!("error: failed to create runtime: {e}");
                    return ExitCode::from(1);
                }
            };
            rt.block_on(async {
                match server::run(config, metrics).await {
                    Ok(()) => ExitCode::SUCCESS,
                    Err(e) => {
                        eprintln!("error: {e:#}");
                        ExitCode::from(1)
                    }
                }
            })
        }

        Command::Validate { bundle } => {
            let bundle = match read_bundle(&bundle) {
                Ok(bundle) => bundle,
                Err(e) => {
                    eprintln!("error: {e:#}");
                    return ExitCode::from(3);
                }
            };
            match check_bundle(&bundle, &config.render_settings()) {
                Ok((rendered, report)) => {
                    for warning in &report.warnings {
                        eprintln!(
                            "warning[{}]: {} ({} <-> {})",
                            warning.kind.as_str(),
                            warning.message,
                            warning.route_a,
                            warning.route_b
                        );
                    }
                    println!(
                        "Bundle valid: {} route(s), {} router(s) rendered, checksum {}",
                        bundle.config.routes.len(),
                        rendered.routers.len(),
                        rendered.checksum
                    );
                    ExitCode::SUCCESS
                }
                Err(ControlError::Conflict(report)) => {
                    for conflict in &report.errors {
                        eprintln!(
                            "error[{}]: {} ({} <-> {})",
                            conflict.kind.as_str(),
                            conflict.message,
                            conflict.route_a,
                            conflict.route_b
                        );
                    }
                    ExitCode::from(1)
                }
                Err(e) => {
                    eprintln!("error: {e}");
                    ExitCode::from(1)
                }
            }
        }

        Command::Render { bundle } => {
            let result = read_bundle(&bundle).and_then(|bundle| {
                check_bundle(&bundle, &config.render_settings()).map_err(anyhow::Error::from)
            });
            match result {
                Ok((rendered, _)) => {
                    print!("{}", rendered.content);
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("error: {e:#}");
                    ExitCode::from(1)
                }
            }
        }

        Command::Migrate { database_url } => {
            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    eprintln!("error: failed to create runtime: {e}");
                    return ExitCode::from(1);
                }
            };
            rt.block_on(async {
                match migrate(&database_url).await {
                    Ok(()) => {
                        println!("Migrations applied.");
                        ExitCode::SUCCESS
                    }
                    Err(e) => {
                        eprintln!("error: {e:#}");
                        ExitCode::from(1)
                    }
                }
            })
        }
    }
}

fn read_bundle(path: &Path) -> anyhow::Result<SnapshotBundle> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path.display(), e))?;
    serde_json::from_str(&content)
        .map_err(|e| anyhow::anyhow!("invalid bundle {}: {}", path.display(), e))
}

async fn migrate(database_url: &str) -> anyhow::Result<()> {
    let pool = db::create_pool(database_url).await?;
    db::run_migrations(&pool).await?;
    Ok(())
}
