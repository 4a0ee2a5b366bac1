//! Headless taquilla terminal.
//!
//! Reads one command per line from stdin and answers with one JSON object per
//! line on stdout. Sync status broadcasts are printed as `{"event": ...}`.
//!
//! Setup runs as a one-shot command instead of the terminal loop:
//! `taquilla-pos configure '<json>'`, `taquilla-pos credentials` and
//! `taquilla-pos reset`.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use taquilla_pos_lib::diagnostics::{self, DiagnosticsExportOptions};
use taquilla_pos_lib::ledger::{self, DEFAULT_MONTHLY_LIMIT, DEFAULT_WEEKLY_LIMIT};
use taquilla_pos_lib::{
    config, storage, LocalQueueStore, RemoteConfig, SalePayload, SupabaseLedger, SyncConfig,
    SyncEvent, SyncListener, SyncRuntime, SyncStatus, TcpNetworkSignal, DB_FILE_NAME,
};

#[derive(Debug, PartialEq)]
enum Command {
    Record(SalePayload),
    Sync,
    Status,
    Pending,
    Report(Option<NaiveDate>),
    Weekly,
    Monthly,
    Today,
    Diagnostics { dir: PathBuf, redact: bool },
    Auto(bool),
    Quit,
}

fn parse_command(line: &str) -> Result<Command> {
    let line = line.trim();
    if line.starts_with('{') {
        let payload = serde_json::from_str(line).context("invalid sale payload")?;
        return Ok(Command::Record(payload));
    }

    let mut parts = line.split_whitespace();
    let command = match (parts.next(), parts.next()) {
        (Some("sync"), None) => Command::Sync,
        (Some("status"), None) => Command::Status,
        (Some("pending"), None) => Command::Pending,
        (Some("report"), None) => Command::Report(None),
        (Some("report"), Some(date)) => Command::Report(Some(
            NaiveDate::parse_from_str(date, "%Y-%m-%d")
                .with_context(|| format!("invalid date {date}, expected YYYY-MM-DD"))?,
        )),
        (Some("weekly"), None) => Command::Weekly,
        (Some("monthly"), None) => Command::Monthly,
        (Some("today"), None) => Command::Today,
        (Some("diagnostics"), Some(dir)) => Command::Diagnostics {
            dir: PathBuf::from(dir),
            redact: parts.next() == Some("--redact"),
        },
        (Some("auto"), Some("on")) => Command::Auto(true),
        (Some("auto"), Some("off")) => Command::Auto(false),
        (Some("quit" | "exit"), None) => Command::Quit,
        _ => bail!("unknown command: {line}"),
    };
    Ok(command)
}

#[derive(Debug, PartialEq)]
enum Setup {
    Configure(Value),
    Credentials,
    Reset,
}

fn parse_setup(args: &[String]) -> Result<Option<Setup>> {
    let setup = match args {
        [] => return Ok(None),
        [cmd, payload] if cmd == "configure" => Setup::Configure(
            serde_json::from_str(payload).context("invalid credentials payload")?,
        ),
        [cmd] if cmd == "credentials" => Setup::Credentials,
        [cmd] if cmd == "reset" => Setup::Reset,
        _ => bail!("usage: taquilla-pos [configure <json> | credentials | reset]"),
    };
    Ok(Some(setup))
}

/// Credentials live in the OS keyring. Reset clears them and the sync
/// tunables but keeps queued sales.
fn run_setup(setup: Setup, data_dir: &Path) -> Result<Value> {
    match setup {
        Setup::Configure(payload) => {
            storage::update_credentials(&payload).map_err(anyhow::Error::msg)
        }
        Setup::Credentials => Ok(json!({
            "configured": storage::is_configured(),
            "credentials": storage::get_full_config(),
        })),
        Setup::Reset => {
            let queue = LocalQueueStore::open(&data_dir.join(DB_FILE_NAME))
                .context("opening sale queue")?;
            let pending = queue.count()?;
            SyncConfig::reset(&queue)?;
            queue.shutdown();
            if pending > 0 {
                warn!(pending, "Factory reset with unsynced sales still queued");
            }
            let mut reply = storage::factory_reset().map_err(anyhow::Error::msg)?;
            reply["pendingKept"] = json!(pending);
            Ok(reply)
        }
    }
}

async fn execute(runtime: &SyncRuntime, command: Command) -> Result<Value> {
    let ledger = runtime.ledger();
    let value = match command {
        Command::Record(payload) => runtime.record(&payload).await?.to_json(),
        Command::Sync => runtime.sync_now().await.to_json(),
        Command::Status => json!({
            "sync": runtime.status()?,
            "last": runtime.sync_status(),
        }),
        Command::Pending => json!({
            "count": runtime.pending_count()?,
            "records": runtime.list_pending()?,
        }),
        Command::Report(date) => json!({ "success": true, "data": ledger.daily_report(date).await? }),
        Command::Weekly => {
            json!({ "success": true, "data": ledger.weekly_reports(DEFAULT_WEEKLY_LIMIT).await? })
        }
        Command::Monthly => {
            json!({ "success": true, "data": ledger.monthly_reports(DEFAULT_MONTHLY_LIMIT).await? })
        }
        Command::Today => {
            let today = ledger::local_today(runtime.config().utc_offset_hours);
            json!({ "success": true, "data": ledger.sales_for_day(today).await? })
        }
        Command::Diagnostics { dir, redact } => {
            let snapshot = runtime.diagnostics_snapshot()?;
            let log_dir = diagnostics::get_log_dir(&config::data_dir()?);
            let path = diagnostics::export_bundle(
                &dir,
                &snapshot,
                Some(&log_dir),
                DiagnosticsExportOptions {
                    include_logs: true,
                    redact_sensitive: redact,
                },
            )
            .map_err(anyhow::Error::msg)?;
            json!({ "success": true, "path": path })
        }
        Command::Auto(enabled) => {
            runtime.set_auto_sync(enabled);
            json!({ "success": true, "autoSyncEnabled": enabled })
        }
        Command::Quit => json!({ "success": true }),
    };
    Ok(value)
}

#[tokio::main]
async fn main() -> Result<()> {
    let data_dir = config::data_dir()?;
    let _log_guard = taquilla_pos_lib::init_logging(&diagnostics::get_log_dir(&data_dir));
    info!(
        "Starting taquilla v{} ({})",
        env!("CARGO_PKG_VERSION"),
        data_dir.display()
    );

    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Some(setup) = parse_setup(&args)? {
        println!("{}", run_setup(setup, &data_dir)?);
        return Ok(());
    }

    let queue = LocalQueueStore::open(&data_dir.join(DB_FILE_NAME)).context("opening sale queue")?;
    let config = SyncConfig::load(&queue)?;
    let remote = RemoteConfig::load().context("loading ledger credentials")?;
    let ledger = Arc::new(SupabaseLedger::new(config.ledger_config(&remote))?);
    let signal = Arc::new(TcpNetworkSignal::for_url(ledger.base_url())?);
    let grace = config.insert_timeout + config.probe_timeout;

    let runtime = SyncRuntime::start(queue, config, ledger, signal).await?;
    let printer: Arc<dyn SyncListener> =
        Arc::new(|event: &SyncEvent, _: &SyncStatus| -> Result<(), String> {
            println!("{}", json!({ "event": event.to_json() }));
            Ok(())
        });
    runtime.subscribe(printer);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received");
                break;
            }
            line = lines.next_line() => line.context("reading stdin")?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let reply = match parse_command(&line) {
            Ok(Command::Quit) => break,
            Ok(command) => execute(&runtime, command).await,
            Err(e) => Err(e),
        };
        match reply {
            Ok(value) => println!("{value}"),
            Err(e) => {
                warn!(error = %e, "Command failed");
                println!("{}", json!({ "success": false, "error": format!("{e:#}") }));
            }
        }
    }

    if tokio::time::timeout(grace, runtime.shutdown()).await.is_err() {
        warn!("Shutdown did not finish within {}s", grace.as_secs());
    }
    Ok(())
}
