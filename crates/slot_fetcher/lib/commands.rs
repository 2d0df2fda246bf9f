use crate::{
    build_info,
    config::{ConfigError, FetchConfig, Profile},
    fetch_service::{
        ledger::{load_failed_slots, LedgerError},
        rpc_client::{BlockFetchError, HttpBatchRpcClient},
        types::{ScanOrder, Slot, SlotRange},
        Error as FetchError, FetchEngine, RunReport,
    },
    logging::{format_error_report, init_logging, LoggingContext},
    server::{block_summary, setup_server_with_addr},
    state::AppState,
};
use clap::{Args, Parser};
use dotenv::dotenv;
use std::collections::HashMap;
use std::env;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_USAGE: i32 = 2;
pub const EXIT_CANCELLED: i32 = 130;

const SERVICE_NAME: &str = "slot_fetcher";

/// Engine tuning shared by `fetch` and `replay`.
///
/// Unset flags fall back to the matching env var, then to the selected profile.
#[derive(Debug, Args, Clone)]
pub struct EngineArgs {
    #[arg(long = "rpc-url")]
    pub rpc_url: Option<String>,
    #[arg(long)]
    /// default | high-performance | conservative
    pub profile: Option<String>,

    #[arg(long = "batch-size")]
    pub batch_size: Option<usize>,
    #[arg(long = "batches-per-cycle")]
    pub batches_per_cycle: Option<usize>,
    #[arg(long = "workers")]
    pub workers: Option<usize>,
    #[arg(long = "queue-capacity")]
    pub queue_capacity: Option<usize>,
    #[arg(long = "max-rps")]
    /// Sustained batch requests per second. Also re-derives the worker count.
    pub max_rps: Option<u32>,
    #[arg(long = "burst")]
    pub burst: Option<u32>,

    #[arg(long = "retry-attempts")]
    /// Retries after the first attempt; 0 disables retrying.
    pub retry_attempts: Option<u32>,
    #[arg(long = "retry-delay-ms")]
    pub retry_delay_ms: Option<u64>,

    #[arg(long = "scan-order")]
    /// ascending | descending
    pub scan_order: Option<String>,
    #[arg(long = "require-account")]
    /// Forward only transactions that reference this account.
    pub require_account: Option<String>,
    #[arg(long = "no-rewards", default_value_t = false)]
    pub no_rewards: bool,

    #[arg(long = "dispatch-port-start")]
    /// Enables forwarding to local parse servers starting at this port.
    pub dispatch_port_start: Option<u16>,
    #[arg(long = "dispatch-port-count")]
    pub dispatch_port_count: Option<u16>,
    #[arg(long = "dispatch-host")]
    pub dispatch_host: Option<String>,

    #[arg(long = "failure-dir", default_value = ".")]
    pub failure_dir: PathBuf,
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,
    #[arg(long = "metrics-bind")]
    /// Serve /health, /metrics and /block while the run is active.
    pub metrics_bind: Option<String>,
}

#[derive(Debug, Parser, Clone)]
pub struct FetchArgs {
    #[arg(long)]
    pub start: Slot,
    #[arg(long)]
    /// Inclusive.
    pub end: Slot,
    #[command(flatten)]
    pub engine: EngineArgs,
}

#[derive(Debug, Parser, Clone)]
pub struct ReplayArgs {
    #[arg(long)]
    /// Failure file written by an earlier run.
    pub file: PathBuf,
    #[command(flatten)]
    pub engine: EngineArgs,
}

#[derive(Debug, Parser, Clone)]
pub struct BlockArgs {
    #[arg(long)]
    pub slot: Slot,
    #[arg(long, default_value_t = false)]
    /// Print a condensed summary instead of the full block.
    pub summary: bool,
    #[arg(long = "rpc-url")]
    pub rpc_url: Option<String>,
    #[arg(long = "log-level", default_value = "warn")]
    pub log_level: String,
}

enum RunTarget {
    Range(SlotRange),
    Slots(Vec<Slot>),
}

pub fn validate_engine_args(args: &EngineArgs) -> Result<(), String> {
    let positive = [
        ("--batch-size", args.batch_size),
        ("--batches-per-cycle", args.batches_per_cycle),
        ("--workers", args.workers),
        ("--queue-capacity", args.queue_capacity),
        ("--max-rps", args.max_rps.map(|value| value as usize)),
        ("--burst", args.burst.map(|value| value as usize)),
        (
            "--dispatch-port-count",
            args.dispatch_port_count.map(usize::from),
        ),
    ];
    for (flag, value) in positive {
        if value == Some(0) {
            return Err(format!("{flag} must be > 0"));
        }
    }
    if let Some(profile) = &args.profile {
        profile.parse::<Profile>()?;
    }
    if let Some(order) = &args.scan_order {
        ScanOrder::parse(order)?;
    }
    if let Some(account) = &args.require_account {
        if account.trim().is_empty() {
            return Err("--require-account must not be empty".to_string());
        }
    }
    if args.dispatch_port_start.is_none()
        && (args.dispatch_port_count.is_some() || args.dispatch_host.is_some())
    {
        return Err("--dispatch-port-count/--dispatch-host require --dispatch-port-start".to_string());
    }
    if let Some(bind) = &args.metrics_bind {
        bind.parse::<SocketAddr>()
            .map_err(|err| format!("invalid --metrics-bind address `{bind}`: {err}"))?;
    }
    Ok(())
}

pub fn validate_fetch_args(args: &FetchArgs) -> Result<(), String> {
    SlotRange::new(args.start, args.end).map_err(|err| format!("--start/--end: {err}"))?;
    validate_engine_args(&args.engine)
}

/// Maps CLI flags onto the env keys [`FetchConfig::from_lookup`] understands.
fn cli_overrides(args: &EngineArgs) -> HashMap<&'static str, String> {
    let mut overrides = HashMap::new();
    let mut set = |key: &'static str, value: Option<String>| {
        if let Some(value) = value {
            overrides.insert(key, value);
        }
    };

    set("SOLANA_RPC_URL", args.rpc_url.clone());
    set("FETCH_PROFILE", args.profile.clone());
    set("FETCH_MAX_BATCH_SIZE", args.batch_size.map(|v| v.to_string()));
    set("FETCH_BATCHES_PER_CYCLE", args.batches_per_cycle.map(|v| v.to_string()));
    set("FETCH_WORKERS", args.workers.map(|v| v.to_string()));
    set("FETCH_QUEUE_CAPACITY", args.queue_capacity.map(|v| v.to_string()));
    set("FETCH_MAX_RPS", args.max_rps.map(|v| v.to_string()));
    set("FETCH_BURST", args.burst.map(|v| v.to_string()));
    set("FETCH_RETRY_ATTEMPTS", args.retry_attempts.map(|v| v.to_string()));
    set("FETCH_RETRY_DELAY_MS", args.retry_delay_ms.map(|v| v.to_string()));
    set("FETCH_SCAN_ORDER", args.scan_order.clone());
    set("FETCH_REQUIRE_ACCOUNT", args.require_account.clone());
    set("FETCH_INCLUDE_REWARDS", args.no_rewards.then(|| "false".to_string()));
    set("DISPATCH_PORT_START", args.dispatch_port_start.map(|v| v.to_string()));
    set("DISPATCH_PORT_COUNT", args.dispatch_port_count.map(|v| v.to_string()));
    set("DISPATCH_HOST", args.dispatch_host.clone());
    overrides
}

/// CLI flags first, then `env_lookup`, then profile defaults.
pub fn resolve_config_with<F>(args: &EngineArgs, env_lookup: F) -> Result<FetchConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let overrides = cli_overrides(args);
    let config = FetchConfig::from_lookup(|key| {
        overrides.get(key).cloned().or_else(|| env_lookup(key))
    })?;
    config.validate()?;
    Ok(config)
}

pub fn resolve_config(args: &EngineArgs) -> Result<FetchConfig, ConfigError> {
    resolve_config_with(args, |key| env::var(key).ok())
}

/// Human-readable end-of-run summary for stdout.
pub fn format_summary(report: &RunReport) -> String {
    let mut out = String::new();
    let failed = report.failed();
    let resolved = report.succeeded + failed;
    let seconds = report.elapsed.as_secs_f64();
    let throughput = if seconds > f64::EPSILON {
        resolved as f64 / seconds
    } else {
        0.0
    };
    let success_rate = match report.meta.requested {
        0 => 0.0,
        requested => report.succeeded as f64 * 100.0 / requested as f64,
    };

    let _ = writeln!(
        out,
        "{} {}{}",
        report.meta.label,
        report.meta.range,
        if report.cancelled { " (cancelled)" } else { "" }
    );
    let _ = writeln!(out, "  requested:    {}", report.meta.requested);
    let _ = writeln!(out, "  succeeded:    {}", report.succeeded);
    let _ = write!(out, "  failed:       {failed}");
    if failed > 0 {
        let breakdown: Vec<String> = report
            .ledger
            .reason_counts()
            .iter()
            .map(|(label, count)| format!("{label}={count}"))
            .collect();
        let _ = write!(out, " ({})", breakdown.join(", "));
    }
    let _ = writeln!(out);
    if report.forwarded > 0 || report.skipped > 0 {
        let _ = writeln!(
            out,
            "  forwarded:    {} (skipped {} without matching transactions)",
            report.forwarded, report.skipped
        );
    }
    let _ = writeln!(out, "  elapsed:      {seconds:.1}s");
    let _ = writeln!(out, "  throughput:   {throughput:.1} slots/s");
    let _ = writeln!(out, "  success rate: {success_rate:.2}%");
    let _ = writeln!(
        out,
        "  requests:     {} ({} retries, {} transactions fetched)",
        report.stats.counters.attempts,
        report.stats.counters.retries,
        report.stats.counters.transactions
    );
    out
}

fn persist_failures(report: &RunReport, dir: &Path) -> Result<Option<PathBuf>, LedgerError> {
    if report.ledger.is_empty() {
        return Ok(None);
    }
    report.ledger.persist_in_dir(dir, &report.meta).map(Some)
}

async fn wait_for_shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => return "SIGTERM",
                    Ok(()) = tokio::signal::ctrl_c() => return "SIGINT",
                    else => {}
                }
            }
            Err(err) => {
                warn!(
                    event = "signal_handler_registration_failed",
                    signal = "SIGTERM",
                    error = %err,
                    "continuing with SIGINT only"
                );
            }
        }
    }
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
    "SIGINT"
}

/// Cancels `token` on SIGINT or SIGTERM.
async fn cancel_on_signal(token: CancellationToken) {
    let signal = wait_for_shutdown_signal().await;
    warn!(
        event = "shutdown_signal_received",
        signal,
        "cancelling run; unresolved slots will be recorded as cancelled"
    );
    token.cancel();
}

fn enter_run_span(context: &LoggingContext) -> tracing::Span {
    tracing::info_span!(
        "fetch_run",
        service = %context.service,
        mode = %context.mode,
        run_id = %context.run_id,
        build_version = %context.build_version,
        build_commit = %context.build_commit
    )
}

fn report_failure(event: &'static str, message: &str, err: &(dyn std::error::Error + 'static)) {
    let error_report = format_error_report(err);
    error!(
        event,
        error = %err,
        error_debug = ?err,
        error_report = %error_report,
        "{message}"
    );
    eprintln!("{message}: {err}");
    eprintln!("{error_report}");
}

/// Runs one range fetch and returns the process exit code.
pub async fn run_fetch_once(args: FetchArgs, logging_mode: &str) -> i32 {
    dotenv().ok();

    let logging_context = init_logging(SERVICE_NAME, logging_mode, &args.engine.log_level);
    let run_span = enter_run_span(&logging_context);
    let _run_guard = run_span.enter();

    if let Err(err) = validate_fetch_args(&args) {
        eprintln!("{err}");
        return EXIT_USAGE;
    }
    let range = match SlotRange::new(args.start, args.end) {
        Ok(range) => range,
        Err(err) => {
            eprintln!("{err}");
            return EXIT_USAGE;
        }
    };
    let config = match resolve_config(&args.engine) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return EXIT_USAGE;
        }
    };

    execute_run(config, &args.engine, RunTarget::Range(range), logging_mode).await
}

/// Re-fetches the slots of a failure file and returns the process exit code.
pub async fn run_replay_once(args: ReplayArgs, logging_mode: &str) -> i32 {
    dotenv().ok();

    let logging_context = init_logging(SERVICE_NAME, logging_mode, &args.engine.log_level);
    let run_span = enter_run_span(&logging_context);
    let _run_guard = run_span.enter();

    if let Err(err) = validate_engine_args(&args.engine) {
        eprintln!("{err}");
        return EXIT_USAGE;
    }
    let slots = match load_failed_slots(&args.file) {
        Ok(slots) => slots,
        Err(err) => {
            eprintln!("cannot read replay file: {err}");
            return EXIT_USAGE;
        }
    };
    if slots.is_empty() {
        info!(
            event = "replay_nothing_to_do",
            file = %args.file.display(),
            "replay file lists no slots"
        );
        println!("{}: no slots to replay", args.file.display());
        return EXIT_OK;
    }
    let config = match resolve_config(&args.engine) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return EXIT_USAGE;
        }
    };

    info!(
        event = "replay_loaded",
        file = %args.file.display(),
        slots = slots.len(),
        "loaded failed slots for replay"
    );
    execute_run(config, &args.engine, RunTarget::Slots(slots), logging_mode).await
}

async fn execute_run(
    config: FetchConfig,
    args: &EngineArgs,
    target: RunTarget,
    logging_mode: &str,
) -> i32 {
    let status_client = match &args.metrics_bind {
        Some(_) => match HttpBatchRpcClient::new(&config.rpc_client_settings()) {
            Ok(client) => Some(Arc::new(client)),
            Err(err) => {
                report_failure("http_client_build_failed", "failed to build HTTP client", &err);
                return EXIT_FAILURE;
            }
        },
        None => None,
    };

    let engine = match FetchEngine::from_config(config) {
        Ok(engine) => engine,
        Err(err) => {
            report_failure("engine_build_failed", "failed to build fetch engine", &err);
            return match err {
                FetchError::Config(_) => EXIT_USAGE,
                _ => EXIT_FAILURE,
            };
        }
    };

    let server_token = CancellationToken::new();
    let mut server_handle = None;
    if let Some(bind) = &args.metrics_bind {
        let Ok(addr) = bind.parse::<SocketAddr>() else {
            eprintln!("invalid --metrics-bind address `{bind}`");
            return EXIT_USAGE;
        };
        let mut state = AppState::new(server_token.clone());
        if let Some(client) = status_client {
            state = state.with_rpc(client);
        }
        match setup_server_with_addr(Arc::new(state), addr).await {
            Ok(handle) => server_handle = Some(handle),
            Err(err) => {
                report_failure(
                    "metrics_server_start_failed",
                    "failed to start metrics endpoint",
                    &err,
                );
                return EXIT_FAILURE;
            }
        }
    }

    let cancel = CancellationToken::new();
    let signal_handle = tokio::spawn(cancel_on_signal(cancel.clone()));

    info!(
        event = "fetch_command_starting",
        mode = logging_mode,
        version = build_info::VERSION,
        rpc_url = %engine.config().rpc_url,
        profile = ?engine.config().profile,
        dispatch = engine.config().dispatch.is_some(),
        "starting fetch command"
    );

    let result = match target {
        RunTarget::Range(range) => engine.fetch_range(&cancel, range).await,
        RunTarget::Slots(slots) => engine.fetch_slots(&cancel, slots).await,
    };

    signal_handle.abort();
    server_token.cancel();
    if let Some(handle) = server_handle {
        let _ = handle.await;
    }

    match result {
        Ok(report) => finish_run(&report, &args.failure_dir),
        Err(FetchError::ProviderUnreachable { report, .. }) => {
            error!(
                event = "provider_unreachable",
                requested = report.meta.requested,
                "no slot could be fetched; check SOLANA_RPC_URL and provider health"
            );
            eprintln!("RPC provider unreachable: every batch exhausted its retries");
            match finish_run(&report, &args.failure_dir) {
                EXIT_OK => EXIT_FAILURE,
                code => code,
            }
        }
        Err(err) => {
            report_failure("fetch_run_failed", "fetch run failed", &err);
            EXIT_FAILURE
        }
    }
}

/// Persists the ledger, prints the summary and maps the report to an exit code.
fn finish_run(report: &RunReport, failure_dir: &Path) -> i32 {
    print!("{}", format_summary(report));

    match persist_failures(report, failure_dir) {
        Ok(Some(path)) => println!("  failed slots: {}", path.display()),
        Ok(None) => {}
        Err(err) => {
            report_failure(
                "failure_ledger_persist_failed",
                "failed to write failed slot list",
                &err,
            );
            return EXIT_FAILURE;
        }
    }

    if report.cancelled {
        EXIT_CANCELLED
    } else {
        EXIT_OK
    }
}

/// Fetches one block and prints it (or its summary) as JSON.
pub async fn run_block_once(args: BlockArgs, logging_mode: &str) -> i32 {
    dotenv().ok();

    let logging_context = init_logging(SERVICE_NAME, logging_mode, &args.log_level);
    let run_span = enter_run_span(&logging_context);
    let _run_guard = run_span.enter();

    let engine_args = EngineArgs {
        rpc_url: args.rpc_url.clone(),
        ..EngineArgs::parse_defaults()
    };
    let config = match resolve_config(&engine_args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return EXIT_USAGE;
        }
    };
    let client = match HttpBatchRpcClient::new(&config.rpc_client_settings()) {
        Ok(client) => client,
        Err(err) => {
            report_failure("http_client_build_failed", "failed to build HTTP client", &err);
            return EXIT_FAILURE;
        }
    };

    let block = match client.fetch_block(args.slot).await {
        Ok(Some(block)) => block,
        Ok(None) => {
            eprintln!("no block available for slot {}", args.slot);
            return EXIT_FAILURE;
        }
        Err(err @ BlockFetchError::Provider { .. }) => {
            eprintln!("slot {}: {err}", args.slot);
            return EXIT_FAILURE;
        }
        Err(err) => {
            report_failure("block_fetch_failed", "getBlock request failed", &err);
            return EXIT_FAILURE;
        }
    };

    let output = if args.summary {
        block_summary(args.slot, &block)
    } else {
        block
    };
    match serde_json::to_string_pretty(&output) {
        Ok(rendered) => {
            println!("{rendered}");
            EXIT_OK
        }
        Err(err) => {
            report_failure("block_render_failed", "failed to render block JSON", &err);
            EXIT_FAILURE
        }
    }
}

impl EngineArgs {
    /// Flag defaults, as if no engine flag was passed.
    fn parse_defaults() -> Self {
        #[derive(Parser)]
        struct Defaults {
            #[command(flatten)]
            engine: EngineArgs,
        }
        Defaults::parse_from([SERVICE_NAME]).engine
    }
}

#[cfg(test)]
mod tests {
    use super::{
        format_summary, resolve_config_with, validate_engine_args, validate_fetch_args,
        EngineArgs, FetchArgs,
    };
    use crate::config::Profile;
    use crate::fetch_service::ledger::FailureLedger;
    use crate::fetch_service::stats::StatsCollector;
    use crate::fetch_service::types::{FailureReason, RunMeta, ScanOrder, SlotRange};
    use crate::fetch_service::RunReport;
    use clap::Parser;
    use std::collections::HashMap;
    use std::time::Duration;

    fn fetch_args(extra: &[&str]) -> FetchArgs {
        let mut argv = vec!["fetch", "--start", "10", "--end", "20"];
        argv.extend_from_slice(extra);
        FetchArgs::parse_from(argv)
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let values: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| values.get(key).cloned()
    }

    #[test]
    fn cli_flags_take_precedence_over_env() {
        let args = fetch_args(&["--rpc-url", "http://cli.example", "--batch-size", "7"]);
        let config = resolve_config_with(
            &args.engine,
            env(&[
                ("SOLANA_RPC_URL", "http://env.example"),
                ("FETCH_MAX_BATCH_SIZE", "30"),
                ("FETCH_BATCHES_PER_CYCLE", "4"),
            ]),
        )
        .expect("config resolves");

        assert_eq!(config.rpc_url, "http://cli.example");
        assert_eq!(config.max_batch_size, 7);
        assert_eq!(config.batches_per_cycle, 4);
    }

    #[test]
    fn profile_flag_selects_preset_before_overrides() {
        let args = fetch_args(&["--profile", "conservative", "--scan-order", "descending"]);
        let config = resolve_config_with(&args.engine, env(&[("SOLANA_RPC_URL", "http://rpc")]))
            .expect("config resolves");

        assert_eq!(config.profile, Profile::Conservative);
        assert_eq!(config.max_batch_size, 25);
        assert_eq!(config.scan_order, ScanOrder::Descending);
    }

    #[test]
    fn max_rps_flag_rederives_workers() {
        let args = fetch_args(&["--max-rps", "100"]);
        let config = resolve_config_with(&args.engine, env(&[("SOLANA_RPC_URL", "http://rpc")]))
            .expect("config resolves");
        assert_eq!(config.max_requests_per_second, 100);
        assert_eq!(config.max_concurrent_workers, 27);
        assert_eq!(config.queue_capacity, 54);
    }

    #[test]
    fn dispatch_flags_enable_forwarding() {
        let args = fetch_args(&["--dispatch-port-start", "9000", "--dispatch-port-count", "2", "--no-rewards"]);
        let config = resolve_config_with(&args.engine, env(&[("SOLANA_RPC_URL", "http://rpc")]))
            .expect("config resolves");
        let dispatch = config.dispatch.expect("dispatch configured");
        assert_eq!((dispatch.port_start, dispatch.port_count), (9000, 2));
        assert!(!config.include_rewards);
    }

    #[test]
    fn missing_rpc_url_is_a_config_error() {
        let args = fetch_args(&[]);
        let err = resolve_config_with(&args.engine, env(&[])).expect_err("rpc url required");
        assert!(err.to_string().contains("SOLANA_RPC_URL"));
    }

    #[test]
    fn inverted_range_is_rejected() {
        let args = FetchArgs::parse_from(["fetch", "--start", "20", "--end", "10"]);
        assert!(validate_fetch_args(&args).is_err());
        assert!(validate_fetch_args(&fetch_args(&[])).is_ok());
    }

    #[test]
    fn whole_slot_space_is_rejected() {
        let max = u64::MAX.to_string();
        let args = FetchArgs::parse_from(["fetch", "--start", "0", "--end", max.as_str()]);
        let err = validate_fetch_args(&args).expect_err("range too large to count");
        assert!(err.contains("too large"), "{err}");
    }

    #[test]
    fn engine_flag_validation() {
        let parse = |extra: &[&str]| fetch_args(extra).engine;
        assert!(validate_engine_args(&parse(&["--workers", "0"])).is_err());
        assert!(validate_engine_args(&parse(&["--max-rps", "0"])).is_err());
        assert!(validate_engine_args(&parse(&["--profile", "turbo"])).is_err());
        assert!(validate_engine_args(&parse(&["--scan-order", "sideways"])).is_err());
        assert!(validate_engine_args(&parse(&["--metrics-bind", "not-an-addr"])).is_err());
        assert!(validate_engine_args(&parse(&["--dispatch-port-count", "3"])).is_err());
        assert!(validate_engine_args(&parse(&["--retry-attempts", "0"])).is_ok());
        assert!(validate_engine_args(&parse(&["--metrics-bind", "127.0.0.1:3000"])).is_ok());
    }

    #[test]
    fn engine_defaults_match_flag_defaults() {
        let defaults = EngineArgs::parse_defaults();
        assert_eq!(defaults.log_level, "info");
        assert_eq!(defaults.failure_dir.to_str(), Some("."));
        assert!(defaults.rpc_url.is_none());
    }

    #[test]
    fn summary_reports_counts_and_reasons() {
        let range = SlotRange::new(100, 109).expect("valid range");
        let ledger = FailureLedger::new();
        ledger.record(103, FailureReason::NotFound);
        ledger.record(107, FailureReason::NoResponse);
        let report = RunReport {
            meta: RunMeta::for_range(range),
            succeeded: 8,
            forwarded: 0,
            skipped: 0,
            ledger,
            cancelled: false,
            elapsed: Duration::from_secs(2),
            stats: StatsCollector::new().snapshot(),
        };

        let summary = format_summary(&report);
        assert!(summary.starts_with("fetch [100, 109]"));
        assert!(summary.contains("requested:    10"));
        assert!(summary.contains("succeeded:    8"));
        assert!(summary.contains("failed:       2 (no_response=1, not_found=1)"));
        assert!(summary.contains("throughput:   5.0 slots/s"));
        assert!(summary.contains("success rate: 80.00%"));
        assert!(!summary.contains("cancelled"));
    }
}
