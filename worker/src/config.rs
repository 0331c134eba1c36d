use crate::backoff::BackoffPolicy;
use crate::health_monitor::HealthMonitorConfig;
use crate::ingestion::AdmissionPolicy;
use crate::payment_processor::ProcessorClientConfig;
use crate::selector::HealthAwareConfig;
use crate::server::Listen;
use crate::worker_pool::WorkerPoolConfig;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid { var: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing(var) => write!(f, "missing required environment variable {}", var),
            ConfigError::Invalid { var, value } => {
                write!(f, "invalid value for {}: {:?}", var, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorKind {
    Static,
    HealthAware,
}

impl FromStr for SelectorKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "static" | "default" => Ok(SelectorKind::Static),
            "health" | "health-aware" => Ok(SelectorKind::HealthAware),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub listen: Listen,
    pub postgres_url: String,
    pub db_pool_size: usize,
    pub processors: ProcessorClientConfig,
    pub pool: WorkerPoolConfig,
    pub queue_capacity: usize,
    pub admission: AdmissionPolicy,
    pub selector: SelectorKind,
    pub health_aware: HealthAwareConfig,
    /// `None` disables health probing.
    pub health_monitor: Option<HealthMonitorConfig>,
    pub ledger_buffer: usize,
    pub ledger_batch_size: usize,
    pub reset_ledger_on_start: bool,
    pub shutdown_grace: Duration,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let listen = match env.get("LISTEN_PATH") {
            Some(path) => Listen::Unix(PathBuf::from(path)),
            None => Listen::Tcp(env.parse_or::<SocketAddr>("LISTEN_ADDR", ([0, 0, 0, 0], 9999).into())?),
        };

        let defaults = WorkerPoolConfig::default();
        let backoff = BackoffPolicy {
            base: env.millis_or("RETRY_BASE_MS", 1_000)?,
            cap: env.millis_or("RETRY_CAP_MS", 30_000)?,
            jitter_fraction: env.parse_or("RETRY_JITTER", 0.1)?,
            max_attempts: env.parse_or("MAX_ATTEMPTS", 10)?,
        };
        if !(0.0..=1.0).contains(&backoff.jitter_fraction) {
            return Err(env.invalid("RETRY_JITTER"));
        }
        if backoff.max_attempts == 0 {
            return Err(env.invalid("MAX_ATTEMPTS"));
        }

        let pool = WorkerPoolConfig {
            num_workers: env.positive_or("NUM_WORKERS", defaults.num_workers)?,
            retry_workers: env.positive_or("RETRY_WORKERS", defaults.retry_workers)?,
            max_concurrency: env.positive_or("MAX_CONCURRENCY", defaults.max_concurrency)?,
            request_timeout: env.millis_or("HTTP_TIMEOUT_MS", 3_000)?,
            backoff,
        };

        let admission = match env.parse_or::<u64>("ADMISSION_TIMEOUT_MS", 0)? {
            0 => AdmissionPolicy::RejectWhenFull,
            ms => AdmissionPolicy::WaitForSpace(Duration::from_millis(ms)),
        };

        let probe_interval = env.millis_or("HEALTH_PROBE_INTERVAL_MS", 5_000)?;
        let health_monitor = (!probe_interval.is_zero()).then_some(HealthMonitorConfig {
            interval: probe_interval,
            probe_timeout: pool.request_timeout,
            max_acceptable_response_time: env.millis_or("MAX_ACCEPTABLE_RESPONSE_MS", 50)?,
        });

        Ok(Self {
            listen,
            postgres_url: env.require("POSTGRES_URL")?,
            db_pool_size: env.positive_or("DB_POOL_SIZE", 8)?,
            processors: ProcessorClientConfig {
                default_url: env.require("DEFAULT_PROCESSOR_URL")?,
                fallback_url: env.require("FALLBACK_PROCESSOR_URL")?,
                connect_timeout: env.millis_or("CONNECT_TIMEOUT_MS", 2_000)?,
                pool_max_idle_per_host: env.parse_or("POOL_MAX_IDLE_PER_HOST", 50)?,
                pool_idle_timeout: Duration::from_secs(env.parse_or("POOL_IDLE_TIMEOUT_SECS", 120)?),
            },
            pool,
            queue_capacity: env.positive_or("QUEUE_CAPACITY", 10_000)?,
            admission,
            selector: env.parse_or("SELECTOR", SelectorKind::HealthAware)?,
            health_aware: HealthAwareConfig {
                failure_threshold: env.positive_or("FAILURE_THRESHOLD", 3)?,
                cooldown: env.millis_or("FAILOVER_COOLDOWN_MS", 5_000)?,
            },
            health_monitor,
            ledger_buffer: env.positive_or("LEDGER_BUFFER", 16 * 1024)?,
            ledger_batch_size: env.positive_or("LEDGER_BATCH_SIZE", 256)?,
            reset_ledger_on_start: env.parse_or("LEDGER_RESET_ON_START", false)?,
            shutdown_grace: env.millis_or("SHUTDOWN_GRACE_MS", 5_000)?,
        })
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.trim().is_empty())
    }

    fn require(&self, name: &'static str) -> Result<String, ConfigError> {
        self.get(name).ok_or(ConfigError::Missing(name))
    }

    fn invalid(&self, name: &'static str) -> ConfigError {
        ConfigError::Invalid {
            var: name,
            value: self.get(name).unwrap_or_default(),
        }
    }

    fn parse_or<T: FromStr>(&self, name: &'static str, default: T) -> Result<T, ConfigError> {
        match self.get(name) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
                var: name,
                value: raw,
            }),
        }
    }

    fn positive_or<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr + PartialOrd + Default,
    {
        let value = self.parse_or(name, default)?;
        if value <= T::default() {
            return Err(self.invalid(name));
        }
        Ok(value)
    }

    fn millis_or(&self, name: &'static str, default_ms: u64) -> Result<Duration, ConfigError> {
        self.parse_or(name, default_ms).map(Duration::from_millis)
    }
}
