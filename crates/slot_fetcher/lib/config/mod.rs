use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::fetch_service::rpc_client::RpcClientSettings;
use crate::fetch_service::types::{RetryPolicy, ScanOrder};

pub const DEFAULT_DISPATCH_HOST: &str = "localhost";
pub const DEFAULT_DISPATCH_PORT_START: u16 = 8000;
pub const DEFAULT_DISPATCH_PORT_COUNT: u16 = 10;
pub const DEFAULT_DISPATCH_PATH: &str = "/api/parse-blockdata";

const ASSUMED_BATCH_LATENCY_MS: u64 = 150;
const WORKER_OVERPROVISION_NUMERATOR: u64 = 9;
const WORKER_OVERPROVISION_DENOMINATOR: u64 = 5;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is required (env var or CLI flag)")]
    Missing(&'static str),
    #[error("invalid value `{value}` for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Named tuning presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Profile {
    #[default]
    Default,
    HighPerformance,
    Conservative,
}

impl FromStr for Profile {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "default" => Ok(Self::Default),
            "high-performance" | "fast" => Ok(Self::HighPerformance),
            "conservative" | "safe" => Ok(Self::Conservative),
            other => Err(format!(
                "unknown profile `{other}` (expected default|high-performance|conservative)"
            )),
        }
    }
}

/// Where fetched blocks are forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    pub host: String,
    pub port_start: u16,
    pub port_count: u16,
    pub path: String,
    pub timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_DISPATCH_HOST.to_string(),
            port_start: DEFAULT_DISPATCH_PORT_START,
            port_count: DEFAULT_DISPATCH_PORT_COUNT,
            path: DEFAULT_DISPATCH_PATH.to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Immutable engine configuration, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchConfig {
    pub rpc_url: String,
    pub profile: Profile,
    pub max_batch_size: usize,
    pub batches_per_cycle: usize,
    pub max_concurrent_workers: usize,
    pub queue_capacity: usize,
    pub max_requests_per_second: u32,
    pub burst_capacity: u32,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    /// HTTP timeout for one batch envelope.
    pub batch_timeout: Duration,
    /// HTTP timeout for a single-slot request.
    pub request_timeout: Duration,
    pub http_pool_size: usize,
    pub include_rewards: bool,
    pub scan_order: ScanOrder,
    /// Forward only transactions that reference this account.
    pub required_account: Option<String>,
    pub dispatch: Option<DispatchConfig>,
}

impl FetchConfig {
    pub fn preset(profile: Profile, rpc_url: impl Into<String>) -> Self {
        let base = Self {
            rpc_url: rpc_url.into(),
            profile,
            max_batch_size: 50,
            batches_per_cycle: 20,
            max_concurrent_workers: 15,
            queue_capacity: 30,
            max_requests_per_second: 100,
            burst_capacity: 20,
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            batch_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            http_pool_size: 100,
            include_rewards: true,
            scan_order: ScanOrder::Ascending,
            required_account: None,
            dispatch: None,
        };

        match profile {
            Profile::Default => base,
            Profile::HighPerformance => Self {
                batches_per_cycle: 60,
                max_concurrent_workers: 30,
                queue_capacity: 60,
                max_requests_per_second: 300,
                burst_capacity: 100,
                retry_delay: Duration::from_millis(300),
                batch_timeout: Duration::from_secs(30),
                request_timeout: Duration::from_secs(15),
                http_pool_size: 300,
                ..base
            },
            Profile::Conservative => Self {
                max_batch_size: 25,
                batches_per_cycle: 16,
                max_concurrent_workers: 8,
                queue_capacity: 16,
                max_requests_per_second: 50,
                burst_capacity: 10,
                retry_attempts: 5,
                retry_delay: Duration::from_secs(2),
                batch_timeout: Duration::from_secs(90),
                request_timeout: Duration::from_secs(60),
                http_pool_size: 50,
                ..base
            },
        }
    }

    /// Reads `SOLANA_RPC_URL`, `FETCH_PROFILE` and `FETCH_*`/`DISPATCH_*` overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let profile = match get("FETCH_PROFILE") {
            Some(raw) => parse_value("FETCH_PROFILE", &raw)?,
            None => Profile::Default,
        };
        let rpc_url = get("SOLANA_RPC_URL").unwrap_or_default();
        let mut config = Self::preset(profile, rpc_url);

        override_from(&get, "FETCH_MAX_BATCH_SIZE", &mut config.max_batch_size)?;
        override_from(&get, "FETCH_BATCHES_PER_CYCLE", &mut config.batches_per_cycle)?;
        override_from(&get, "FETCH_BURST", &mut config.burst_capacity)?;
        override_from(&get, "FETCH_RETRY_ATTEMPTS", &mut config.retry_attempts)?;
        override_from(&get, "FETCH_HTTP_POOL_SIZE", &mut config.http_pool_size)?;
        override_from(&get, "FETCH_INCLUDE_REWARDS", &mut config.include_rewards)?;
        override_millis(&get, "FETCH_RETRY_DELAY_MS", &mut config.retry_delay)?;
        override_millis(&get, "FETCH_BATCH_TIMEOUT_MS", &mut config.batch_timeout)?;
        override_millis(&get, "FETCH_REQUEST_TIMEOUT_MS", &mut config.request_timeout)?;

        if let Some(raw) = get("FETCH_MAX_RPS") {
            config.set_rate(parse_value("FETCH_MAX_RPS", &raw)?);
        }
        override_from(&get, "FETCH_WORKERS", &mut config.max_concurrent_workers)?;
        override_from(&get, "FETCH_QUEUE_CAPACITY", &mut config.queue_capacity)?;

        if let Some(raw) = get("FETCH_SCAN_ORDER") {
            config.scan_order = ScanOrder::parse(&raw).map_err(|reason| ConfigError::InvalidValue {
                key: "FETCH_SCAN_ORDER",
                value: raw.clone(),
                reason,
            })?;
        }
        if let Some(account) = get("FETCH_REQUIRE_ACCOUNT") {
            config.required_account = Some(account.trim().to_string());
        }

        if let Some(raw) = get("DISPATCH_PORT_START") {
            let mut dispatch = DispatchConfig {
                port_start: parse_value("DISPATCH_PORT_START", &raw)?,
                ..DispatchConfig::default()
            };
            override_from(&get, "DISPATCH_PORT_COUNT", &mut dispatch.port_count)?;
            if let Some(host) = get("DISPATCH_HOST") {
                dispatch.host = host;
            }
            config.dispatch = Some(dispatch);
        }

        Ok(config)
    }

    /// Sets the request rate and re-derives the worker count from it.
    pub fn set_rate(&mut self, max_requests_per_second: u32) {
        self.max_requests_per_second = max_requests_per_second;
        self.max_concurrent_workers = derive_worker_count_from_rps(max_requests_per_second);
        self.queue_capacity = self.max_concurrent_workers.saturating_mul(2);
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retry_attempts: self.retry_attempts,
            retry_delay: self.retry_delay,
        }
    }

    pub fn rpc_client_settings(&self) -> RpcClientSettings {
        RpcClientSettings {
            rpc_url: self.rpc_url.clone(),
            batch_timeout: self.batch_timeout,
            request_timeout: self.request_timeout,
            pool_size: self.http_pool_size,
            include_rewards: self.include_rewards,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rpc_url.trim().is_empty() {
            return Err(ConfigError::Missing("SOLANA_RPC_URL"));
        }
        if !(self.rpc_url.starts_with("http://") || self.rpc_url.starts_with("https://")) {
            return Err(ConfigError::InvalidValue {
                key: "SOLANA_RPC_URL",
                value: self.rpc_url.clone(),
                reason: "expected an http(s) URL".to_string(),
            });
        }
        let positive = [
            ("max batch size", self.max_batch_size),
            ("batches per cycle", self.batches_per_cycle),
            ("worker count", self.max_concurrent_workers),
            ("queue capacity", self.queue_capacity),
            ("http pool size", self.http_pool_size),
            ("max requests per second", self.max_requests_per_second as usize),
            ("burst capacity", self.burst_capacity as usize),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be > 0")));
            }
        }
        if self.batch_timeout.is_zero() || self.request_timeout.is_zero() {
            return Err(ConfigError::Invalid("timeouts must be > 0".to_string()));
        }
        if let Some(dispatch) = &self.dispatch {
            if dispatch.port_count == 0 {
                return Err(ConfigError::Invalid("dispatch port count must be > 0".to_string()));
            }
            let last_port = u32::from(dispatch.port_start) + u32::from(dispatch.port_count) - 1;
            if last_port > u32::from(u16::MAX) {
                return Err(ConfigError::Invalid(format!(
                    "dispatch port range {}+{} exceeds 65535",
                    dispatch.port_start, dispatch.port_count
                )));
            }
        }
        Ok(())
    }
}

/// Workers needed to keep `rps` batch requests in flight at the assumed batch latency,
/// over-provisioned by 9/5.
pub fn derive_worker_count_from_rps(rps: u32) -> usize {
    fn ceil_div(numerator: u64, denominator: u64) -> u64 {
        numerator
            .saturating_add(denominator.saturating_sub(1))
            .saturating_div(denominator)
    }

    let in_flight = ceil_div(u64::from(rps).saturating_mul(ASSUMED_BATCH_LATENCY_MS), 1000).max(1);
    let overprovisioned = ceil_div(
        in_flight.saturating_mul(WORKER_OVERPROVISION_NUMERATOR),
        WORKER_OVERPROVISION_DENOMINATOR,
    )
    .max(1);

    usize::try_from(overprovisioned).unwrap_or(usize::MAX)
}

fn parse_value<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|err| ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
        reason: err.to_string(),
    })
}

fn override_from<G, T>(get: &G, key: &'static str, target: &mut T) -> Result<(), ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = get(key) {
        *target = parse_value(key, &raw)?;
    }
    Ok(())
}

fn override_millis<G>(get: &G, key: &'static str, target: &mut Duration) -> Result<(), ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    if let Some(raw) = get(key) {
        *target = Duration::from_millis(parse_value(key, &raw)?);
    }
    Ok(())
}
