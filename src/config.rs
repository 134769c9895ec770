use std::path::PathBuf;
use std::str::FromStr;

/// Whether an active cooldown marker blocks new bookings.
///
/// The marker is always computed and stored; only the gate is switchable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CooldownPolicy {
    #[default]
    Disabled,
    Enforced,
}

impl FromStr for CooldownPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disabled" | "off" | "false" => Ok(Self::Disabled),
            "enforced" | "on" | "true" => Ok(Self::Enforced),
            other => Err(format!("unknown cooldown policy: {other}")),
        }
    }
}

/// Which surviving candidates the suggestion engine keeps before sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SuggestionRanking {
    /// Candidates closest to the requested start.
    ///
    /// This is the default because the alternatives must sit next to the
    /// rejected request: after 14:00–15:00 is booked, a 14:00 two-hour
    /// request is answered with 13:00–14:00 and 15:00–16:00, which taking
    /// the first five free slots of the day would never reach.
    #[default]
    Nearest,
    /// The first `max_suggestions` candidates of the day, by start time.
    Earliest,
}

impl FromStr for SuggestionRanking {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nearest" => Ok(Self::Nearest),
            "earliest" => Ok(Self::Earliest),
            other => Err(format!("unknown suggestion ranking: {other}")),
        }
    }
}

/// Business constants of the scheduling core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulingConfig {
    /// First hour of the display grid and earliest bookable start.
    pub window_start_hour: u32,
    /// Last hour shown on the display grid (inclusive).
    pub window_end_hour: u32,
    /// Latest hour a booking may start at.
    pub last_start_hour: u32,
    /// First-pass gate: 2-hour bookings are not offered from this hour on.
    pub two_hour_gate_hour: u32,
    /// Bookings must finish by this hour.
    pub latest_end_hour: u32,
    pub allowed_durations: Vec<u8>,
    pub default_cooldown_days: u32,
    pub max_suggestions: usize,
    pub booking_horizon_days: u32,
    pub cooldown_policy: CooldownPolicy,
    pub suggestion_ranking: SuggestionRanking,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            window_start_hour: 9,
            window_end_hour: 22,
            last_start_hour: 20,
            two_hour_gate_hour: 20,
            latest_end_hour: 21,
            allowed_durations: vec![1, 2],
            default_cooldown_days: 2,
            max_suggestions: 5,
            booking_horizon_days: 30,
            cooldown_policy: CooldownPolicy::Disabled,
            suggestion_ranking: SuggestionRanking::Nearest,
        }
    }
}

/// Process configuration, read once from `CITYSTAGE_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: String,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub scheduling: SchedulingConfig,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = SchedulingConfig::default();
        let scheduling = SchedulingConfig {
            default_cooldown_days: env_parse("CITYSTAGE_DEFAULT_COOLDOWN_DAYS")
                .unwrap_or(defaults.default_cooldown_days),
            booking_horizon_days: env_parse("CITYSTAGE_BOOKING_HORIZON_DAYS")
                .unwrap_or(defaults.booking_horizon_days),
            cooldown_policy: env_parse("CITYSTAGE_COOLDOWN_POLICY")
                .unwrap_or(defaults.cooldown_policy),
            suggestion_ranking: env_parse("CITYSTAGE_SUGGESTION_RANKING")
                .unwrap_or(defaults.suggestion_ranking),
            ..defaults
        };

        Self {
            port: std::env::var("CITYSTAGE_PORT").unwrap_or_else(|_| "5433".into()),
            bind: std::env::var("CITYSTAGE_BIND").unwrap_or_else(|_| "0.0.0.0".into()),
            data_dir: std::env::var("CITYSTAGE_DATA_DIR")
                .unwrap_or_else(|_| "./data".into())
                .into(),
            password: std::env::var("CITYSTAGE_PASSWORD").unwrap_or_else(|_| "citystage".into()),
            max_connections: env_parse("CITYSTAGE_MAX_CONNECTIONS").unwrap_or(256),
            compact_threshold: env_parse("CITYSTAGE_COMPACT_THRESHOLD").unwrap_or(1000),
            metrics_port: env_parse("CITYSTAGE_METRICS_PORT"),
            tls_cert: std::env::var("CITYSTAGE_TLS_CERT").ok(),
            tls_key: std::env::var("CITYSTAGE_TLS_KEY").ok(),
            scheduling,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring unparseable {key}={raw}");
            None
        }
    }
}
