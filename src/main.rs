// src/main.rs

use color_eyre::eyre::{Result, WrapErr};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use scan_warden::app::App;
use scan_warden::cli::{CommandLine, Commands};
use scan_warden::config::Settings;
use scan_warden::logging;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Setup ---
    color_eyre::install()?;
    let commands = CommandLine::parse_args();
    logging::initialize_logging()?;

    let settings = Settings::load(commands.config.as_deref()).wrap_err("loading settings")?;
    let app = App::new(settings).wrap_err("opening the worker database")?;

    // Ctrl-C cancels the run; in-flight tools are killed and no partial
    // results are written.
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling.");
            on_signal.cancel();
        }
    });

    match commands.command {
        Commands::Scan {
            organization,
            scanners,
        } => {
            let summary = app.run_scan(&organization, &scanners, &cancel).await?;
            for report in &summary.reports {
                info!(target = %report.target, source = %report.source, outcome = ?report.outcome, "Result.");
            }
            println!("{summary}");
        }
        Commands::VerifyProxy => {
            let report = app.verify_proxy(&cancel).await?;
            println!("{report}");
        }
    }
    Ok(())
}
