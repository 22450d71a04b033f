//! Library CLI entry for embedders.
//!
//! A binary crate registers its spiders and delegates its `main` here:
//!
//! ```ignore
//! #[tokio::main]
//! async fn main() -> std::process::ExitCode {
//!     let mut registry = SpiderRegistry::new();
//!     registry.register(|| Arc::new(NewsSpider::default()));
//!     trawler_engine::cli::main(registry).await
//! }
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use trawler_common::{init_logging, Config};

use crate::runner::{Runner, SpiderRegistry};

#[derive(Parser)]
#[command(name = "trawler", version, about = "Asynchronous web-crawling framework")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run registered spiders until the crawl quiesces.
    Run {
        /// Spider names to run; default is every registered spider.
        #[arg(long = "spider")]
        spiders: Vec<String>,
    },
}

/// Parse arguments, wire process signals, and run. Exit code 0 means clean
/// quiescence; anything else is an unhandled error or a failed healthcheck.
pub async fn main(registry: SpiderRegistry) -> ExitCode {
    let config = Arc::new(Config::from_env());
    if let Err(e) = init_logging(&config) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }
    config.log_summary();
    let cli = Cli::parse();
    match cli.command {
        Command::Run { spiders } => run(registry, spiders, config).await,
    }
}

async fn run(registry: SpiderRegistry, spiders: Vec<String>, config: Arc<Config>) -> ExitCode {
    let runner = Arc::new(Runner::new(config));
    install_signal_handlers(runner.clone());

    match runner.run_registered(&registry, &spiders).await {
        Ok(reports) => {
            for report in &reports {
                info!(%report, "Crawl report");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Crawl failed");
            ExitCode::FAILURE
        }
    }
}

/// SIGINT/SIGTERM stop the crawl; SIGUSR1 and SIGUSR2 pause and resume it.
fn install_signal_handlers(runner: Arc<Runner>) {
    {
        let runner = runner.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received; stopping all spiders");
                runner.stop_all();
            }
        });
    }

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let stop = runner.clone();
        tokio::spawn(async move {
            let Ok(mut term) = signal(SignalKind::terminate()) else { return };
            if term.recv().await.is_some() {
                info!("SIGTERM received; stopping all spiders");
                stop.stop_all();
            }
        });

        let pause = runner.clone();
        tokio::spawn(async move {
            let Ok(mut usr1) = signal(SignalKind::user_defined1()) else { return };
            while usr1.recv().await.is_some() {
                pause.pause_all();
            }
        });

        let resume = runner;
        tokio::spawn(async move {
            let Ok(mut usr2) = signal(SignalKind::user_defined2()) else { return };
            while usr2.recv().await.is_some() {
                resume.resume_all();
            }
        });
    }
}
