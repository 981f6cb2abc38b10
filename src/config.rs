//! Configuration types.
//!
//! Everything is environment-driven: `EngineConfig::from_env()` reads the
//! `OUTREACH_*` variables and falls back to defaults that are safe for a
//! single-operator deployment. Channel configs live next to their adapters
//! and gate on their own variables.

use std::time::Duration;

/// Per-organization quota defaults, applied when no explicit policy row
/// exists for an organization.
#[derive(Debug, Clone, Copy)]
pub struct QuotaDefaults {
    /// Maximum contacts per organization per rolling day.
    pub max_per_day: u32,
    /// Maximum contacts per organization per rolling week.
    pub max_per_week: u32,
    /// Maximum contacts per organization, ever.
    pub max_lifetime: u32,
}

impl Default for QuotaDefaults {
    fn default() -> Self {
        Self {
            max_per_day: 2,
            max_per_week: 5,
            max_lifetime: 10,
        }
    }
}

/// Cooldown durations applied by the feedback classifier, keyed by cause.
#[derive(Debug, Clone, Copy)]
pub struct CooldownDurations {
    /// After an explicit rejection reply.
    pub rejection: Duration,
    /// After a transient delivery failure (mailbox full, greylisting).
    pub bounce_soft: Duration,
    /// After a permanent delivery failure. The target also goes to
    /// do-not-contact, so this mostly shields the rest of the organization.
    pub bounce_hard: Duration,
    /// After a delivery failure of indeterminate permanence.
    pub bounce_unknown: Duration,
}

impl Default for CooldownDurations {
    fn default() -> Self {
        Self {
            rejection: Duration::from_secs(90 * 24 * 3600),
            bounce_soft: Duration::from_secs(3 * 24 * 3600),
            bounce_hard: Duration::from_secs(365 * 24 * 3600),
            bounce_unknown: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path of the local libSQL database file.
    pub db_path: String,
    /// Directory for the daily-rolling audit log. `None` disables file logging.
    pub log_dir: Option<String>,
    /// Hard ceiling on attempts started per dispatch batch.
    pub batch_ceiling: usize,
    /// Maximum number of organizations dispatched concurrently.
    pub org_concurrency: usize,
    /// Base delay between any two sends, process-wide.
    pub pace_interval: Duration,
    /// Random extra delay added on top of `pace_interval` per send.
    pub pace_jitter: Duration,
    /// Age after which an unresolved pending/sent attempt is swept to
    /// no-response and stops blocking its target.
    pub attempt_grace: Duration,
    /// Quota defaults for organizations without an explicit policy.
    pub quotas: QuotaDefaults,
    /// Classifier cooldown durations.
    pub cooldowns: CooldownDurations,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: "./data/outreach.db".to_string(),
            log_dir: None,
            batch_ceiling: 25,
            org_concurrency: 4,
            pace_interval: Duration::from_secs(45),
            pace_jitter: Duration::from_secs(30),
            attempt_grace: Duration::from_secs(14 * 24 * 3600),
            quotas: QuotaDefaults::default(),
            cooldowns: CooldownDurations::default(),
        }
    }
}

impl EngineConfig {
    /// Build config from environment variables, falling back to defaults
    /// for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let db_path =
            std::env::var("OUTREACH_DB_PATH").unwrap_or(defaults.db_path);
        let log_dir = std::env::var("OUTREACH_LOG_DIR").ok();

        let batch_ceiling = env_parse("OUTREACH_BATCH_CEILING", defaults.batch_ceiling);
        let org_concurrency = env_parse("OUTREACH_ORG_CONCURRENCY", defaults.org_concurrency)
            .max(1);

        let pace_interval = env_secs("OUTREACH_PACE_SECS", defaults.pace_interval);
        let pace_jitter = env_secs("OUTREACH_PACE_JITTER_SECS", defaults.pace_jitter);
        let attempt_grace = env_days("OUTREACH_ATTEMPT_GRACE_DAYS", defaults.attempt_grace);

        let quotas = QuotaDefaults {
            max_per_day: env_parse("OUTREACH_MAX_PER_DAY", defaults.quotas.max_per_day),
            max_per_week: env_parse("OUTREACH_MAX_PER_WEEK", defaults.quotas.max_per_week),
            max_lifetime: env_parse("OUTREACH_MAX_LIFETIME", defaults.quotas.max_lifetime),
        };

        let cooldowns = CooldownDurations {
            rejection: env_days("OUTREACH_COOLDOWN_REJECTION_DAYS", defaults.cooldowns.rejection),
            bounce_soft: env_days(
                "OUTREACH_COOLDOWN_BOUNCE_SOFT_DAYS",
                defaults.cooldowns.bounce_soft,
            ),
            bounce_hard: env_days(
                "OUTREACH_COOLDOWN_BOUNCE_HARD_DAYS",
                defaults.cooldowns.bounce_hard,
            ),
            bounce_unknown: env_days(
                "OUTREACH_COOLDOWN_BOUNCE_UNKNOWN_DAYS",
                defaults.cooldowns.bounce_unknown,
            ),
        };

        Self {
            db_path,
            log_dir,
            batch_ceiling,
            org_concurrency,
            pace_interval,
            pace_jitter,
            attempt_grace,
            quotas,
            cooldowns,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_days(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(|d| Duration::from_secs(d * 24 * 3600))
        .unwrap_or(default)
}
