//! Configuration types.
//!
//! Every component config has a `Default` carrying the production constants
//! and a `from_env()` that applies `CONTACT_FLOW_*` overrides on top.

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Inbound coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Identical payloads from one contact inside this window are duplicates.
    pub duplicate_window: Duration,
    /// Trailing window used to measure a contact's message rate.
    pub rate_window: Duration,
    /// Messages per `rate_window` at which admission switches to batching.
    pub batch_threshold: usize,
    /// A batch flushes immediately once it holds this many payloads.
    pub batch_max_size: usize,
    /// A non-full batch flushes after this long.
    pub batch_timeout: Duration,
    /// Hard cap on items per contact queue. The oldest item is evicted past it.
    pub max_queue_size: usize,
    /// Hard cap on live contact queues. Exceeding it flushes every queue.
    pub max_contacts: usize,
    /// Empty, idle queues older than this are swept.
    pub inactivity_timeout: Duration,
    pub queue_sweep_interval: Duration,
    pub duplicate_sweep_interval: Duration,
    /// How long a dequeued item may be held before its lease is reclaimed.
    pub processing_lease_ttl: Duration,
    pub lease_sweep_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            duplicate_window: Duration::from_secs(1),
            rate_window: Duration::from_secs(60),
            batch_threshold: 3,
            batch_max_size: 5,
            batch_timeout: Duration::from_secs(2),
            max_queue_size: 50,
            max_contacts: 1000,
            inactivity_timeout: Duration::from_secs(300), // 5 minutes
            queue_sweep_interval: Duration::from_secs(60),
            duplicate_sweep_interval: Duration::from_secs(5),
            processing_lease_ttl: Duration::from_secs(120),
            lease_sweep_interval: Duration::from_secs(30),
        }
    }
}

impl CoordinatorConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let config = Self {
            duplicate_window: env_millis("CONTACT_FLOW_DUPLICATE_WINDOW_MS", d.duplicate_window)?,
            rate_window: env_millis("CONTACT_FLOW_RATE_WINDOW_MS", d.rate_window)?,
            batch_threshold: env_or("CONTACT_FLOW_BATCH_THRESHOLD", d.batch_threshold)?,
            batch_max_size: env_or("CONTACT_FLOW_BATCH_MAX_SIZE", d.batch_max_size)?,
            batch_timeout: env_millis("CONTACT_FLOW_BATCH_TIMEOUT_MS", d.batch_timeout)?,
            max_queue_size: env_or("CONTACT_FLOW_MAX_QUEUE_SIZE", d.max_queue_size)?,
            max_contacts: env_or("CONTACT_FLOW_MAX_CONTACTS", d.max_contacts)?,
            inactivity_timeout: env_millis(
                "CONTACT_FLOW_INACTIVITY_TIMEOUT_MS",
                d.inactivity_timeout,
            )?,
            queue_sweep_interval: env_millis(
                "CONTACT_FLOW_QUEUE_SWEEP_MS",
                d.queue_sweep_interval,
            )?,
            duplicate_sweep_interval: env_millis(
                "CONTACT_FLOW_DUPLICATE_SWEEP_MS",
                d.duplicate_sweep_interval,
            )?,
            processing_lease_ttl: env_millis(
                "CONTACT_FLOW_PROCESSING_LEASE_MS",
                d.processing_lease_ttl,
            )?,
            lease_sweep_interval: env_millis(
                "CONTACT_FLOW_LEASE_SWEEP_MS",
                d.lease_sweep_interval,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would disable a bound entirely.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("batch_threshold", self.batch_threshold)?;
        require_positive("batch_max_size", self.batch_max_size)?;
        require_positive("max_queue_size", self.max_queue_size)?;
        require_positive("max_contacts", self.max_contacts)?;
        Ok(())
    }
}

/// Outbound deliverer configuration.
#[derive(Debug, Clone)]
pub struct DelivererConfig {
    /// A matching sent record inside this window blocks a send.
    pub dedup_window: Duration,
    /// Width of the time bucket folded into the send hash.
    pub time_bucket: Duration,
    /// Total transport attempts per send.
    pub max_attempts: u32,
    /// Hard timeout on each transport attempt.
    pub attempt_timeout: Duration,
    /// Backoff before attempt `n + 1` is `base_backoff * 2^(n - 1)`.
    pub base_backoff: Duration,
    pub cleanup_interval: Duration,
}

impl Default for DelivererConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_secs(5),
            time_bucket: Duration::from_secs(5),
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(10),
            base_backoff: Duration::from_secs(1),
            cleanup_interval: Duration::from_secs(30),
        }
    }
}

impl DelivererConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let config = Self {
            dedup_window: env_millis("CONTACT_FLOW_SEND_DEDUP_WINDOW_MS", d.dedup_window)?,
            time_bucket: env_millis("CONTACT_FLOW_SEND_BUCKET_MS", d.time_bucket)?,
            max_attempts: env_or("CONTACT_FLOW_SEND_MAX_ATTEMPTS", d.max_attempts)?,
            attempt_timeout: env_millis("CONTACT_FLOW_SEND_TIMEOUT_MS", d.attempt_timeout)?,
            base_backoff: env_millis("CONTACT_FLOW_SEND_BACKOFF_MS", d.base_backoff)?,
            cleanup_interval: env_millis("CONTACT_FLOW_SEND_CLEANUP_MS", d.cleanup_interval)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("max_attempts", self.max_attempts as usize)?;
        require_nonzero_duration("time_bucket", self.time_bucket)?;
        Ok(())
    }
}

/// Persistence ledger configuration.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Bundles pulled from the write-behind queue per drain batch.
    pub batch_size: usize,
    /// Pause between drain batches.
    pub batch_pause: Duration,
    /// Retries after the first failed write. The bundle is dropped past this.
    pub max_retries: u32,
    /// A bundle id leaves the pending set after this, whatever happened to it.
    pub pending_ttl: Duration,
    /// Width of the time bucket folded into the exchange id.
    pub time_bucket: Duration,
    /// Characters of each text that feed the exchange id.
    pub dedup_prefix_len: usize,
    /// Stored text fields are capped at this many characters.
    pub max_text_len: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_pause: Duration::from_millis(100),
            max_retries: 3,
            pending_ttl: Duration::from_secs(30),
            time_bucket: Duration::from_secs(5),
            dedup_prefix_len: 100,
            max_text_len: 4000,
        }
    }
}

impl LedgerConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let config = Self {
            batch_size: env_or("CONTACT_FLOW_PERSIST_BATCH_SIZE", d.batch_size)?,
            batch_pause: env_millis("CONTACT_FLOW_PERSIST_PAUSE_MS", d.batch_pause)?,
            max_retries: env_or("CONTACT_FLOW_PERSIST_MAX_RETRIES", d.max_retries)?,
            pending_ttl: env_millis("CONTACT_FLOW_PERSIST_PENDING_TTL_MS", d.pending_ttl)?,
            time_bucket: env_millis("CONTACT_FLOW_PERSIST_BUCKET_MS", d.time_bucket)?,
            dedup_prefix_len: env_or("CONTACT_FLOW_PERSIST_DEDUP_PREFIX", d.dedup_prefix_len)?,
            max_text_len: env_or("CONTACT_FLOW_PERSIST_MAX_TEXT", d.max_text_len)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("batch_size", self.batch_size)?;
        require_positive("max_text_len", self.max_text_len)?;
        require_nonzero_duration("time_bucket", self.time_bucket)?;
        Ok(())
    }
}

/// Default reply when a response cannot be produced or delivered.
pub const DEFAULT_FALLBACK_MESSAGE: &str =
    "Sorry, something went wrong on our side. Please try again in a moment.";

/// Process-wide configuration assembled at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub coordinator: CoordinatorConfig,
    pub deliverer: DelivererConfig,
    pub ledger: LedgerConfig,
    /// libSQL database file.
    pub db_path: PathBuf,
    /// Port for the admin HTTP surface.
    pub admin_port: u16,
    /// Sent to the contact when generation or delivery fails.
    pub fallback_message: String,
    /// Enables the Telegram transport when set.
    pub telegram_bot_token: Option<SecretString>,
    /// Enables daily rolling file logs when set.
    pub log_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            coordinator: CoordinatorConfig::default(),
            deliverer: DelivererConfig::default(),
            ledger: LedgerConfig::default(),
            db_path: PathBuf::from("./data/contact-flow.db"),
            admin_port: 8080,
            fallback_message: DEFAULT_FALLBACK_MESSAGE.to_string(),
            telegram_bot_token: None,
            log_dir: None,
        }
    }
}

impl AppConfig {
    /// Build the full config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            coordinator: CoordinatorConfig::from_env()?,
            deliverer: DelivererConfig::from_env()?,
            ledger: LedgerConfig::from_env()?,
            db_path: std::env::var("CONTACT_FLOW_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(d.db_path),
            admin_port: env_or("CONTACT_FLOW_ADMIN_PORT", d.admin_port)?,
            fallback_message: std::env::var("CONTACT_FLOW_FALLBACK_MESSAGE")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(d.fallback_message),
            telegram_bot_token: std::env::var("TELEGRAM_BOT_TOKEN")
                .ok()
                .filter(|s| !s.is_empty())
                .map(SecretString::from),
            log_dir: std::env::var("CONTACT_FLOW_LOG_DIR").ok().map(PathBuf::from),
        })
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::ParseError(format!("{key}={raw}: {e}"))),
        _ => Ok(default),
    }
}

fn env_millis(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    let millis = env_or(key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}

fn require_positive(key: &str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

fn require_nonzero_duration(key: &str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "duration must be non-zero".to_string(),
        });
    }
    Ok(())
}
