//! Switch Upgrade - Entry Point
//!
//! Upgrades the firmware of one switch over SSH, verifies the new version
//! after reboot and rolls back automatically when verification fails.

use std::collections::HashMap;
use std::env;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use colored::Colorize;
use tokio::sync::watch;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use switch_upgrade::backup::FileBackupStore;
use switch_upgrade::logs::{init_logging, LogLevel, LogOptions};
use switch_upgrade::models::device::{Credentials, Device};
use switch_upgrade::models::request::{UpgradeRequest, DEFAULT_REMOTE_PATH};
use switch_upgrade::session::ssh::SshConnector;
use switch_upgrade::settings::Settings;
use switch_upgrade::upgrade::events::{
    ChannelSink, DiagnosticsSink, FanoutSink, TracingSink, TransitionEvent,
};
use switch_upgrade::upgrade::outcome::Severity;
use switch_upgrade::upgrade::{Orchestrator, UpgradeOutcome, UpgradeReport};
use switch_upgrade::utils::version_info;
use switch_upgrade::vendor::adapter_for_model;

/// Exit code for invalid command line usage
const EXIT_USAGE: i32 = 64;

/// Exit code for internal failures outside the upgrade run
const EXIT_SOFTWARE: i32 = 70;

/// Exit code for unreadable settings
const EXIT_CONFIG: i32 = 78;

const PASSWORD_ENV_VAR: &str = "SWITCH_PASSWORD";

const USAGE: &str = "\
Usage: switch-upgrade --hostname=<name> --ip=<address> --username=<user> --model=<model>
                      --firmware=<path> --target-version=<version> [options]

Options:
  --password=<password>       SSH password (falls back to $SWITCH_PASSWORD, then key-based auth)
  --remote-path=<path>        Remote directory for the image (default: /flash/)
  --retry-count=<n>           Verification attempts after reboot (default: 5)
  --retry-delay=<secs>        Seconds between verification attempts (default: 60)
  --install-timeout=<secs>    Upper bound for the install command (default: 1800)
  --config=<path>             JSON settings file
  --log-level=<level>         trace, debug, info, warn or error
  --json                      Print the final report as JSON
  --events                    Stream state transitions to stdout as JSON lines
  --version                   Print version and exit";

#[tokio::main]
async fn main() {
    let cli_args = parse_cli_args(env::args().skip(1));

    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version_info()) {
            Ok(version) => println!("{}", version),
            Err(e) => eprintln!("{}", e),
        }
        return;
    }

    if cli_args.contains_key("help") || cli_args.contains_key("h") {
        println!("{}", USAGE);
        return;
    }

    let code = run_cli(&cli_args).await;
    std::process::exit(code);
}

/// Collect `--key=value` pairs and bare `--flag`s
fn parse_cli_args(args: impl Iterator<Item = String>) -> HashMap<String, String> {
    let mut cli_args = HashMap::new();
    for arg in args {
        if let Some((key, value)) = arg.split_once('=') {
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with('-') {
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }
    cli_args
}

async fn run_cli(cli_args: &HashMap<String, String>) -> i32 {
    // Retrieve the settings file
    let settings = match cli_args.get("config") {
        Some(path) => match Settings::load(&PathBuf::from(path)).await {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("Unable to read settings file {}: {}", path, e);
                return EXIT_CONFIG;
            }
        },
        None => Settings::default(),
    };

    // Initialize logging. The guard flushes the log file when this function returns.
    let log_level = match cli_args.get("log-level").map(|l| l.parse::<LogLevel>()) {
        Some(Ok(level)) => level,
        Some(Err(e)) => {
            eprintln!("{}", e);
            return EXIT_USAGE;
        }
        None => settings.log_level.clone(),
    };
    let log_options = LogOptions {
        log_level,
        log_dir: Some(settings.log_dir.clone()),
        json_format: settings.log_json,
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    let request = match build_request(cli_args, &settings) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("{}\n\n{}", e, USAGE);
            return EXIT_USAGE;
        }
    };

    if tokio::fs::metadata(&request.firmware).await.is_err() {
        let outcome = UpgradeOutcome::FailedNoChange {
            reason: format!("firmware file {} not found", request.firmware.display()),
        };
        error!("{}", outcome);
        eprintln!("{}", outcome.to_string().red());
        return outcome.exit_code();
    }

    // Cancel at the next step boundary on Ctrl+C / SIGTERM
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        await_shutdown_signal().await;
        let _ = cancel_tx.send(true);
    });

    // The printer ends once the orchestrator, and with it the sender, is dropped
    let mut printer: Option<JoinHandle<()>> = None;
    let sink: Arc<dyn DiagnosticsSink> = if cli_args.contains_key("events") {
        let (channel_sink, events) = ChannelSink::channel();
        printer = Some(tokio::spawn(print_events(events, std::io::stdout())));
        Arc::new(FanoutSink::new().with(TracingSink).with(channel_sink))
    } else {
        Arc::new(TracingSink)
    };

    let orchestrator = Orchestrator::new(
        Arc::new(SshConnector::new(settings.ssh_options())),
        adapter_for_model(&request.device.model),
        Arc::new(FileBackupStore::new(settings.backup_dir.clone())),
        settings.upgrade_config(),
    )
    .with_sink(sink)
    .with_cancellation(cancel_rx);

    info!("Starting firmware upgrade on {}", request.device.hostname);
    let handle = tokio::spawn(async move { orchestrator.run_upgrade(&request).await });

    let report = match handle.await {
        Ok(report) => report,
        Err(e) => {
            error!("Upgrade task failed: {}", e);
            return EXIT_SOFTWARE;
        }
    };

    if let Some(printer) = printer {
        if let Err(e) = printer.await {
            warn!("Event printer failed: {}", e);
        }
    }

    if cli_args.contains_key("json") {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => error!("Failed to serialize report: {}", e),
        }
    } else {
        print_summary(&report);
    }

    report.outcome.exit_code()
}

/// Write each transition as a JSON line until every sender is gone
async fn print_events<W: Write>(mut events: UnboundedReceiver<TransitionEvent>, mut out: W) {
    while let Some(event) = events.recv().await {
        if let Ok(line) = serde_json::to_string(&event) {
            let _ = writeln!(out, "{}", line);
        }
    }
    let _ = out.flush();
}

fn build_request(
    cli_args: &HashMap<String, String>,
    settings: &Settings,
) -> anyhow::Result<UpgradeRequest> {
    let required = |key: &str| {
        cli_args
            .get(key)
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| anyhow!("Missing required argument --{}", key))
    };

    let username = required("username")?;
    let credentials = match cli_args
        .get("password")
        .cloned()
        .or_else(|| env::var(PASSWORD_ENV_VAR).ok())
    {
        Some(password) => Credentials::with_password(username, password),
        None => {
            warn!("No password given; relying on key-based authentication");
            Credentials::key_based(username)
        }
    };

    let device = Device::new(
        required("hostname")?,
        required("ip")?,
        required("model")?,
        credentials,
    );

    let mut request = UpgradeRequest::new(
        device,
        PathBuf::from(required("firmware")?),
        required("target-version")?,
    );
    request.remote_path = cli_args
        .get("remote-path")
        .cloned()
        .unwrap_or_else(|| DEFAULT_REMOTE_PATH.to_string());
    request.max_retries = match cli_args.get("retry-count") {
        Some(v) => v.parse().context("--retry-count must be a number")?,
        None => settings.upgrade.max_retries,
    };
    request.retry_delay = Duration::from_secs(match cli_args.get("retry-delay") {
        Some(v) => v.parse().context("--retry-delay must be a number of seconds")?,
        None => settings.upgrade.retry_delay_secs,
    });
    request.install_timeout = Duration::from_secs(match cli_args.get("install-timeout") {
        Some(v) => v
            .parse()
            .context("--install-timeout must be a number of seconds")?,
        None => settings.upgrade.install_timeout_secs,
    });

    Ok(request)
}

fn print_summary(report: &UpgradeReport) {
    println!();
    println!("Device:     {} ({})", report.device.hostname, report.device.address);
    println!("Target:     {}", report.target_version);
    println!("Attempts:   {}", report.verification_attempts);
    if let Some(backup) = &report.backup {
        println!("Backup:     {}", backup);
    }

    let line = report.outcome.to_string();
    match report.outcome.severity() {
        Severity::Ok => println!("Result:     {}", line.green()),
        Severity::Warning | Severity::Error => println!("Result:     {}", line.yellow()),
        Severity::Critical => {
            println!("Result:     {}", line.red().bold());
            println!("{}", "ACTION REQUIRED: device state is unknown, intervene manually".red().bold());
        }
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, cancelling upgrade...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, cancelling upgrade...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, cancelling upgrade...");
        }
    }
}
