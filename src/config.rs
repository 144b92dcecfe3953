//! Configuration types.
//!
//! Every section has a `Default` and a `from_env()` constructor. Optional
//! collaborators (messaging, calendar, email) return `None` when their
//! primary variable is unset, which disables them.

use std::str::FromStr;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use secrecy::SecretString;

use crate::error::ConfigError;

/// Top-level configuration for the automator binary.
#[derive(Debug, Clone)]
pub struct AutomatorConfig {
    /// Path to the libSQL database file.
    pub db_path: String,
    /// Port for the webhook front door.
    pub webhook_port: u16,
    /// Directory for rolling log files (stderr only when unset).
    pub log_dir: Option<String>,
    pub worker: WorkerConfig,
    pub executor: ExecutorConfig,
    pub extraction: ExtractionConfig,
    pub messaging: Option<MessagingConfig>,
    pub calendar: Option<CalendarConfig>,
    pub email: Option<EmailConfig>,
}

impl AutomatorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let log_dir = std::env::var("AUTOMATOR_LOG_DIR").ok();
        if let Some(dir) = &log_dir {
            std::fs::create_dir_all(dir)?;
        }
        Ok(Self {
            db_path: std::env::var("AUTOMATOR_DB_PATH")
                .unwrap_or_else(|_| "./data/automator.db".to_string()),
            webhook_port: env_or("AUTOMATOR_WEBHOOK_PORT", 8080)?,
            log_dir,
            worker: WorkerConfig::from_env()?,
            executor: ExecutorConfig::from_env()?,
            extraction: ExtractionConfig::from_env()?,
            messaging: MessagingConfig::from_env()?,
            calendar: CalendarConfig::from_env(),
            email: EmailConfig::from_env()?,
        })
    }
}

/// Worker pool and queue settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of independent poll loops.
    pub workers: usize,
    /// Maximum items claimed per poll.
    pub batch_size: usize,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Upper bound on a single claim transaction.
    pub claim_timeout: Duration,
    /// Attempts granted to newly enqueued items.
    pub max_attempts: u32,
    /// Claims older than this are considered abandoned.
    pub lease: Duration,
    /// How often abandoned claims are swept.
    pub reaper_interval: Duration,
    /// How often schedule-triggered rules are checked.
    pub schedule_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_size: 10,
            poll_interval: Duration::from_millis(1000),
            claim_timeout: Duration::from_secs(5),
            max_attempts: 3,
            lease: Duration::from_secs(300),
            reaper_interval: Duration::from_secs(60),
            schedule_interval: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    /// Time a handler may run on one item. Stays under the lease so the
    /// reaper never hands a live claim to another worker.
    pub fn handler_budget(&self) -> Duration {
        self.lease.mul_f64(0.8)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            workers: env_or("AUTOMATOR_WORKERS", d.workers)?,
            batch_size: env_or("AUTOMATOR_BATCH_SIZE", d.batch_size)?,
            poll_interval: Duration::from_millis(env_or(
                "AUTOMATOR_POLL_INTERVAL_MS",
                d.poll_interval.as_millis() as u64,
            )?),
            claim_timeout: d.claim_timeout,
            max_attempts: env_or("AUTOMATOR_MAX_ATTEMPTS", d.max_attempts)?,
            lease: Duration::from_secs(env_or("AUTOMATOR_LEASE_SECS", d.lease.as_secs())?),
            reaper_interval: d.reaper_interval,
            schedule_interval: Duration::from_secs(env_or(
                "AUTOMATOR_SCHEDULE_INTERVAL_SECS",
                d.schedule_interval.as_secs(),
            )?),
        })
    }
}

/// Action executor settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Budget for a whole rule run; remaining actions are abandoned after it.
    pub run_timeout: Duration,
    /// Budget for a single collaborator call.
    pub call_timeout: Duration,
    /// First retry delay; doubles per attempt.
    pub backoff_base: Duration,
    /// Retry delay ceiling.
    pub backoff_max: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            run_timeout: Duration::from_secs(60),
            call_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_millis(250),
            backoff_max: Duration::from_secs(5),
        }
    }
}

impl ExecutorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            run_timeout: Duration::from_secs(env_or(
                "AUTOMATOR_RUN_TIMEOUT_SECS",
                d.run_timeout.as_secs(),
            )?),
            call_timeout: Duration::from_secs(env_or(
                "AUTOMATOR_CALL_TIMEOUT_SECS",
                d.call_timeout.as_secs(),
            )?),
            backoff_base: d.backoff_base,
            backoff_max: d.backoff_max,
        })
    }
}

/// NLP extraction settings.
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    /// Entities below this confidence go to the clarification fallback.
    pub min_confidence: f32,
    /// Offset used to resolve "today", "3pm" and friends.
    pub utc_offset: FixedOffset,
    /// Currency assumed when an amount carries none (or only `$`).
    pub default_currency: String,
    /// Event length when the text names no duration.
    pub default_event_minutes: i64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            utc_offset: Utc.fix(),
            default_currency: "CLP".to_string(),
            default_event_minutes: 60,
        }
    }
}

impl ExtractionConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let utc_offset = match std::env::var("AUTOMATOR_UTC_OFFSET") {
            Ok(raw) => parse_utc_offset(&raw).ok_or_else(|| ConfigError::InvalidValue {
                key: "AUTOMATOR_UTC_OFFSET".into(),
                message: format!("expected +HH:MM or -HH:MM, got '{raw}'"),
            })?,
            Err(_) => d.utc_offset,
        };
        let min_confidence: f32 = env_or("AUTOMATOR_MIN_CONFIDENCE", d.min_confidence)?;
        if !(0.0..=1.0).contains(&min_confidence) {
            return Err(ConfigError::InvalidValue {
                key: "AUTOMATOR_MIN_CONFIDENCE".into(),
                message: "must be within [0, 1]".into(),
            });
        }
        Ok(Self {
            min_confidence,
            utc_offset,
            default_currency: std::env::var("AUTOMATOR_DEFAULT_CURRENCY")
                .unwrap_or(d.default_currency),
            default_event_minutes: env_or(
                "AUTOMATOR_DEFAULT_EVENT_MINUTES",
                d.default_event_minutes,
            )?,
        })
    }
}

/// Messaging provider HTTP API.
#[derive(Debug, Clone)]
pub struct MessagingConfig {
    pub api_url: String,
    pub token: SecretString,
}

impl MessagingConfig {
    /// Returns `Ok(None)` if `MESSAGING_API_URL` is not set. The token is
    /// required once the URL is.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let Ok(api_url) = std::env::var("MESSAGING_API_URL") else {
            return Ok(None);
        };
        let token = std::env::var("MESSAGING_API_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("MESSAGING_API_TOKEN".to_string()))?;
        Ok(Some(Self {
            api_url,
            token: SecretString::from(token),
        }))
    }
}

/// Calendar provider settings. Token refresh happens outside this process.
#[derive(Debug, Clone)]
pub struct CalendarConfig {
    pub api_url: String,
    pub calendar_id: String,
    pub token: SecretString,
}

impl CalendarConfig {
    /// Returns `None` if `CALENDAR_API_TOKEN` is not set.
    pub fn from_env() -> Option<Self> {
        let token = std::env::var("CALENDAR_API_TOKEN").ok()?;
        Some(Self {
            api_url: std::env::var("CALENDAR_API_URL")
                .unwrap_or_else(|_| "https://www.googleapis.com/calendar/v3".to_string()),
            calendar_id: std::env::var("CALENDAR_ID").unwrap_or_else(|_| "primary".to_string()),
            token: SecretString::from(token),
        })
    }
}

/// SMTP settings for the send-email action.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl EmailConfig {
    /// Returns `Ok(None)` if `EMAIL_SMTP_HOST` is not set.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let Ok(smtp_host) = std::env::var("EMAIL_SMTP_HOST") else {
            return Ok(None);
        };
        let username = std::env::var("EMAIL_USERNAME").unwrap_or_default();
        Ok(Some(Self {
            smtp_host,
            smtp_port: env_or("EMAIL_SMTP_PORT", 587)?,
            password: SecretString::from(std::env::var("EMAIL_PASSWORD").unwrap_or_default()),
            from_address: std::env::var("EMAIL_FROM_ADDRESS").unwrap_or_else(|_| username.clone()),
            username,
        }))
    }
}

/// Read and parse an env var, falling back to `default` when unset.
fn env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// Parse `+HH:MM`, `-HH:MM`, `-HH` or `Z`.
pub fn parse_utc_offset(raw: &str) -> Option<FixedOffset> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("z") || raw.eq_ignore_ascii_case("utc") {
        return Some(Utc.fix());
    }
    let (sign, rest) = match raw.as_bytes().first()? {
        b'+' => (1, &raw[1..]),
        b'-' => (-1, &raw[1..]),
        _ => (1, raw),
    };
    let mut parts = rest.splitn(2, ':');
    let hours: i32 = parts.next()?.parse().ok()?;
    let minutes: i32 = match parts.next() {
        Some(m) => m.parse().ok()?,
        None => 0,
    };
    if hours > 14 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_defaults() {
        let c = WorkerConfig::default();
        assert_eq!(c.max_attempts, 3);
        assert!(c.workers > 0);
        assert!(c.batch_size > 0);
    }

    #[test]
    fn parses_negative_offset() {
        let off = parse_utc_offset("-04:00").unwrap();
        assert_eq!(off.local_minus_utc(), -4 * 3600);
    }

    #[test]
    fn parses_offset_without_minutes() {
        let off = parse_utc_offset("+5").unwrap();
        assert_eq!(off.local_minus_utc(), 5 * 3600);
    }

    #[test]
    fn rejects_garbage_offset() {
        assert!(parse_utc_offset("banana").is_none());
        assert!(parse_utc_offset("+25:00").is_none());
    }

    #[test]
    fn extraction_defaults() {
        let c = ExtractionConfig::default();
        assert_eq!(c.min_confidence, 0.5);
        assert_eq!(c.utc_offset.local_minus_utc(), 0);
    }
}
