use clap::Parser;
use doppelganger_service::DOPPELGANGER_SHUTDOWN_REASON;
use task_executor::{ShutdownReason, TaskExecutor};
use tracing::{error, info};
use vero::cli::Cli;
use vero::config::Config;
use vero::ProductionValidatorClient;

/// The status code for a doppelganger detection, distinct from ordinary
/// fatal errors so supervisors can refuse to restart the process.
const DOPPELGANGER_EXIT_CODE: i32 = 69;

fn main() {
    let cli = Cli::parse();

    let config = match Config::from_cli(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = logging::init_tracing_subscriber(&config.log_level) {
        eprintln!("Unable to initialise logging: {}", e);
        std::process::exit(1);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Unable to start the async runtime");
            std::process::exit(1);
        }
    };

    let exit_code = runtime.block_on(run(config));
    // Give spawned tasks a moment to observe the exit signal.
    runtime.shutdown_timeout(std::time::Duration::from_secs(2));
    std::process::exit(exit_code);
}

async fn run(config: Config) -> i32 {
    let (exit_tx, exit_rx) = async_channel::bounded::<()>(1);
    let (shutdown_tx, shutdown_rx) = async_channel::bounded::<ShutdownReason>(1);
    let executor = TaskExecutor::new(tokio::runtime::Handle::current(), exit_rx, shutdown_tx);

    let mut client = match ProductionValidatorClient::new(config, executor).await {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "Unable to initialise the validator client");
            return 1;
        }
    };

    if let Err(e) = client.start_services() {
        error!(error = %e, "Unable to start the validator client");
        return 1;
    }

    let reason = wait_for_shutdown(&shutdown_rx).await;

    let exit_code = match reason {
        ShutdownReason::Success(msg) => {
            info!(reason = msg, "Shutting down");
            // The deferred shutdown: imminent proposals and in-flight
            // attester/sync duties are given their budget before tasks are
            // torn down. After the budget the process exits regardless.
            let delay = client.deferred_shutdown_delay();
            if !delay.is_zero() {
                info!(
                    delay_millis = delay.as_millis(),
                    "Delaying shutdown to complete pending duties"
                );
                tokio::time::sleep(delay).await;
            }
            0
        }
        ShutdownReason::Failure(msg) => {
            error!(reason = msg, "Shutting down");
            if msg == DOPPELGANGER_SHUTDOWN_REASON {
                DOPPELGANGER_EXIT_CODE
            } else {
                1
            }
        }
    };

    // Dropping the exit sender stops every spawned task.
    drop(exit_tx);
    exit_code
}

/// Resolves on SIGINT, SIGTERM or an internal shutdown request.
async fn wait_for_shutdown(
    shutdown_rx: &async_channel::Receiver<ShutdownReason>,
) -> ShutdownReason {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "Unable to listen for SIGTERM");
                return ShutdownReason::Failure("signal handler failed");
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => ShutdownReason::Success("SIGINT received"),
            _ = sigterm.recv() => ShutdownReason::Success("SIGTERM received"),
            reason = shutdown_rx.recv() => {
                reason.unwrap_or(ShutdownReason::Failure("shutdown channel closed"))
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => ShutdownReason::Success("SIGINT received"),
            reason = shutdown_rx.recv() => {
                reason.unwrap_or(ShutdownReason::Failure("shutdown channel closed"))
            }
        }
    }
}
