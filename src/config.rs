// =============================================================================
// config.rs - THE CONTROL PANEL
// =============================================================================
//
// Every knob the gateway has lives here: per-endpoint timeouts, breaker
// thresholds and cool-downs, rate limits, cache TTLs, plus the gateway-wide
// settings for retries, the shared token counter, health probing and alerting.
//
// All values can be overridden with GRIDIRON_* environment variables (a .env
// file is honored). Per-endpoint fields use GRIDIRON_<ENDPOINT>_<FIELD>, for
// example GRIDIRON_LIVE_GAME_STATS_TIMEOUT_SECS=3.
//
// Defaults follow what the stats provider's free tier tolerates: thirty calls
// a minute, and not one more.
// =============================================================================

use std::collections::HashSet;
use std::env;
use std::time::Duration;
use thiserror::Error;

use crate::models::DataCategory;

/// Provider subscription tier. Each tier caps calls per minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ApiTier {
    Free,
    Starter,
    Paid,
}

impl ApiTier {
    pub fn limit_per_minute(self) -> u32 {
        match self {
            ApiTier::Free => 30,
            ApiTier::Starter => 60,
            ApiTier::Paid => 600,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "free" => Some(ApiTier::Free),
            "starter" => Some(ApiTier::Starter),
            "paid" => Some(ApiTier::Paid),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("endpoint {0}: failure_threshold must be at least 1")]
    ZeroFailureThreshold(String),
    #[error("endpoint {0}: rate_limit_per_minute must be at least 1")]
    ZeroRateLimit(String),
    #[error("endpoint {0}: max_cool_down is shorter than cool_down")]
    CoolDownCeilingTooLow(String),
    #[error("endpoint {0} is defined more than once")]
    DuplicateEndpoint(String),
    #[error("endpoint {endpoint}: secondary {secondary} is not a configured endpoint")]
    UnknownSecondary { endpoint: String, secondary: String },
    #[error("endpoint {0} names itself as its secondary")]
    SelfSecondary(String),
    #[error("instance_count must be at least 1")]
    ZeroInstances,
}

/// Immutable configuration of one upstream operation.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub name: String,
    /// URL template; `{key}` is replaced by the URL-encoded request key.
    pub target: String,
    /// Lightweight URL the health prober hits.
    pub probe_target: String,
    pub category: DataCategory,
    pub timeout: Duration,
    pub failure_threshold: u32,
    pub cool_down: Duration,
    pub max_cool_down: Duration,
    pub rate_limit_per_minute: u32,
    pub cache_ttl: Duration,
    /// After this long, cached finalized data stops expiring.
    pub stale_correction_window: Option<Duration>,
    /// Endpoint consulted when this one cannot answer.
    pub secondary: Option<String>,
    /// Serve fresh cache entries before spending a token.
    pub read_through: bool,
}

impl EndpointConfig {
    pub fn new(name: impl Into<String>, target: impl Into<String>, category: DataCategory) -> Self {
        let target = target.into();
        Self {
            name: name.into(),
            probe_target: target.replace("{key}", ""),
            target,
            category,
            timeout: Duration::from_secs(10),
            failure_threshold: 5,
            cool_down: Duration::from_secs(60),
            max_cool_down: Duration::from_secs(600),
            rate_limit_per_minute: 30,
            cache_ttl: default_ttl(category),
            stale_correction_window: None,
            secondary: None,
            read_through: false,
        }
    }

    /// Apply GRIDIRON_<NAME>_* overrides on top of `self`.
    fn with_env_overrides(mut self) -> Self {
        let prefix = format!("GRIDIRON_{}_", self.name.to_ascii_uppercase());
        let var = |field: &str| env::var(format!("{prefix}{field}")).ok();

        if let Some(v) = var("TARGET") {
            self.target = v;
        }
        if let Some(v) = var("PROBE_TARGET") {
            self.probe_target = v;
        }
        if let Some(c) = var("CATEGORY").as_deref().and_then(DataCategory::parse) {
            self.category = c;
        }
        if let Some(s) = var("TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.timeout = Duration::from_secs(s);
        }
        if let Some(n) = var("FAILURE_THRESHOLD").and_then(|v| v.parse().ok()) {
            self.failure_threshold = n;
        }
        if let Some(s) = var("COOL_DOWN_SECS").and_then(|v| v.parse().ok()) {
            self.cool_down = Duration::from_secs(s);
        }
        if let Some(s) = var("MAX_COOL_DOWN_SECS").and_then(|v| v.parse().ok()) {
            self.max_cool_down = Duration::from_secs(s);
        }
        if let Some(n) = var("RATE_LIMIT_PER_MINUTE").and_then(|v| v.parse().ok()) {
            self.rate_limit_per_minute = n;
        }
        if let Some(s) = var("CACHE_TTL_SECS").and_then(|v| v.parse().ok()) {
            self.cache_ttl = Duration::from_secs(s);
        }
        if let Some(h) = var("STALE_CORRECTION_WINDOW_HOURS").and_then(|v| v.parse::<u64>().ok()) {
            self.stale_correction_window = Some(Duration::from_secs(h.saturating_mul(3600)));
        }
        if let Some(v) = var("SECONDARY") {
            self.secondary = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(b) = var("READ_THROUGH").and_then(|v| v.parse().ok()) {
            self.read_through = b;
        }
        self
    }
}

/// TTL policy tuned to how quickly each category of data goes bad.
pub fn default_ttl(category: DataCategory) -> Duration {
    match category {
        DataCategory::LiveStats => Duration::from_secs(30),
        DataCategory::FinalStats => Duration::from_secs(3600),
        DataCategory::News => Duration::from_secs(300),
        DataCategory::Schedule => Duration::from_secs(24 * 3600),
        DataCategory::Profile => Duration::from_secs(3600),
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    /// Jitter added on top of the exponential delay, as a fraction of it.
    /// Clamped to [0, 1] so delays stay non-decreasing.
    pub jitter_ratio: f64,
    /// Each retry gets the previous attempt's timeout times this.
    pub timeout_growth: f64,
    /// No single attempt waits longer than this.
    pub max_call_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
            jitter_ratio: 0.5,
            timeout_growth: 2.0,
            max_call_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdaptiveConfig {
    /// How long the halved rate is held after a provider 429.
    pub cool_down: Duration,
    /// Percentage of the ceiling restored per `restore_interval` after cool-down.
    pub restore_step_percent: f64,
    pub restore_interval: Duration,
    /// Rolling window in which provider 429s are counted.
    pub violation_window: Duration,
    /// Violations inside the window that trigger a permanent reduction.
    pub permanent_reduction_threshold: u32,
    /// New ceiling as a percentage of the old one.
    pub permanent_reduction_percent: f64,
    /// The rate never drops below this fraction of the ceiling.
    pub min_rate_factor: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            cool_down: Duration::from_secs(60),
            restore_step_percent: 10.0,
            restore_interval: Duration::from_secs(30),
            violation_window: Duration::from_secs(3600),
            permanent_reduction_threshold: 3,
            permanent_reduction_percent: 80.0,
            min_rate_factor: 0.05,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub tier: ApiTier,
    /// One bucket shared by every endpoint, sized at the tier limit.
    pub global_pool: bool,
    pub distributed: bool,
    pub instance_count: u32,
    pub store_timeout: Duration,
    pub queue_enabled: bool,
    pub max_queue_size: usize,
    pub max_queue_wait: Duration,
    /// Alert when usage crosses this percentage of capacity.
    pub alert_threshold_percent: f64,
    pub adaptive: AdaptiveConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tier: ApiTier::Free,
            global_pool: false,
            distributed: false,
            instance_count: 1,
            store_timeout: Duration::from_millis(250),
            queue_enabled: true,
            max_queue_size: 100,
            max_queue_wait: Duration::from_secs(5),
            alert_threshold_percent: 80.0,
            adaptive: AdaptiveConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub probe_interval: Duration,
    /// N: consecutive probe failures that declare an endpoint unhealthy.
    pub unhealthy_threshold: u32,
    /// M: consecutive probe successes that restore it.
    pub healthy_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            unhealthy_threshold: 3,
            healthy_threshold: 2,
        }
    }
}

/// Rolling operator counters and the error-rate alarm built on them.
#[derive(Debug, Clone)]
pub struct StatsConfig {
    /// Width of the rolling window behind the "recent" counters.
    pub window: Duration,
    /// Alert when failed upstream attempts exceed this share of the window.
    pub error_rate_alert_percent: f64,
    /// Attempts needed in the window before the error rate means anything.
    pub error_rate_min_samples: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(300),
            error_rate_alert_percent: 50.0,
            error_rate_min_samples: 10,
        }
    }
}

/// The whole gateway's configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub endpoints: Vec<EndpointConfig>,
    pub retry: RetryConfig,
    pub rate_limit: RateLimitConfig,
    pub health: HealthConfig,
    pub stats: StatsConfig,
    /// A repeated breaker open within this window keeps the grown cool-down.
    pub breaker_monitoring_window: Duration,
    pub cache_capacity: usize,
    pub stale_marker: String,

    pub redis_url: String,
    pub redis_alert_channel: String,
    pub redis_alert_history: String,
    pub metrics_port: u16,
    pub api_key: Option<String>,
    pub user_agent: String,
    /// (endpoint, key) pairs fetched at low priority on startup.
    pub warm_keys: Vec<(String, String)>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            health: HealthConfig::default(),
            stats: StatsConfig::default(),
            breaker_monitoring_window: Duration::from_secs(600),
            cache_capacity: 10_000,
            stale_marker: "Data may be outdated".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            redis_alert_channel: "gridiron:alerts".to_string(),
            redis_alert_history: "gridiron:alerts:history".to_string(),
            metrics_port: 9090,
            api_key: None,
            user_agent: "GridironGateway/0.1".to_string(),
            warm_keys: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from the environment with defaults for everything.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let d = GatewayConfig::default();

        let retry = RetryConfig {
            base_delay: Duration::from_millis(env_parse("GRIDIRON_RETRY_BASE_MS", 200)),
            max_delay: Duration::from_millis(env_parse("GRIDIRON_RETRY_MAX_DELAY_MS", 10_000)),
            max_attempts: env_parse("GRIDIRON_RETRY_MAX_ATTEMPTS", 5),
            jitter_ratio: env_parse("GRIDIRON_RETRY_JITTER_RATIO", 0.5),
            timeout_growth: env_parse("GRIDIRON_RETRY_TIMEOUT_GROWTH", 2.0),
            max_call_timeout: Duration::from_secs(env_parse(
                "GRIDIRON_RETRY_MAX_CALL_TIMEOUT_SECS",
                60,
            )),
        };

        let adaptive = AdaptiveConfig {
            cool_down: Duration::from_secs(env_parse("GRIDIRON_ADAPTIVE_COOL_DOWN_SECS", 60)),
            restore_step_percent: env_parse("GRIDIRON_ADAPTIVE_RESTORE_STEP_PERCENT", 10.0),
            restore_interval: Duration::from_secs(env_parse(
                "GRIDIRON_ADAPTIVE_RESTORE_INTERVAL_SECS",
                30,
            )),
            violation_window: Duration::from_secs(env_parse(
                "GRIDIRON_ADAPTIVE_VIOLATION_WINDOW_SECS",
                3600,
            )),
            permanent_reduction_threshold: env_parse("GRIDIRON_PERMANENT_REDUCTION_THRESHOLD", 3),
            permanent_reduction_percent: env_parse("GRIDIRON_PERMANENT_REDUCTION_PERCENT", 80.0),
            min_rate_factor: AdaptiveConfig::default().min_rate_factor,
        };

        let rate_limit = RateLimitConfig {
            tier: ApiTier::parse(&env_or_default("GRIDIRON_API_TIER", "free"))
                .unwrap_or(ApiTier::Free),
            global_pool: env_parse("GRIDIRON_GLOBAL_POOL", false),
            distributed: env_parse("GRIDIRON_DISTRIBUTED_RATE_LIMIT", false),
            instance_count: env_parse("GRIDIRON_INSTANCE_COUNT", 1),
            store_timeout: Duration::from_millis(env_parse("GRIDIRON_STORE_TIMEOUT_MS", 250)),
            queue_enabled: env_parse("GRIDIRON_QUEUE_ENABLED", true),
            max_queue_size: env_parse("GRIDIRON_MAX_QUEUE_SIZE", 100),
            max_queue_wait: Duration::from_millis(env_parse("GRIDIRON_MAX_QUEUE_WAIT_MS", 5_000)),
            alert_threshold_percent: env_parse("GRIDIRON_ALERT_THRESHOLD_PERCENT", 80.0),
            adaptive,
        };

        let health = HealthConfig {
            probe_interval: Duration::from_secs(env_parse("GRIDIRON_PROBE_INTERVAL_SECS", 30)),
            unhealthy_threshold: env_parse("GRIDIRON_PROBE_UNHEALTHY_THRESHOLD", 3),
            healthy_threshold: env_parse("GRIDIRON_PROBE_HEALTHY_THRESHOLD", 2),
        };

        let stats = StatsConfig {
            window: Duration::from_secs(env_parse("GRIDIRON_STATS_WINDOW_SECS", 300)),
            error_rate_alert_percent: env_parse("GRIDIRON_ERROR_RATE_ALERT_PERCENT", 50.0),
            error_rate_min_samples: env_parse("GRIDIRON_ERROR_RATE_MIN_SAMPLES", 10),
        };

        GatewayConfig {
            endpoints: d
                .endpoints
                .into_iter()
                .map(EndpointConfig::with_env_overrides)
                .collect(),
            retry,
            rate_limit,
            health,
            stats,
            breaker_monitoring_window: Duration::from_secs(env_parse(
                "GRIDIRON_BREAKER_MONITORING_WINDOW_SECS",
                600,
            )),
            cache_capacity: env_parse("GRIDIRON_CACHE_CAPACITY", 10_000),
            stale_marker: env_or_default("GRIDIRON_STALE_MARKER", &d.stale_marker),
            redis_url: env_or_default("GRIDIRON_REDIS_URL", &d.redis_url),
            redis_alert_channel: env_or_default("GRIDIRON_REDIS_ALERT_CHANNEL", &d.redis_alert_channel),
            redis_alert_history: env_or_default("GRIDIRON_REDIS_ALERT_HISTORY", &d.redis_alert_history),
            metrics_port: env_parse("GRIDIRON_METRICS_PORT", 9090),
            api_key: env::var("GRIDIRON_API_KEY").ok().filter(|k| !k.is_empty()),
            user_agent: env_or_default("GRIDIRON_USER_AGENT", &d.user_agent),
            warm_keys: parse_warm_keys(&env_or_default("GRIDIRON_WARM_KEYS", "")),
        }
    }

    pub fn endpoint(&self, name: &str) -> Option<&EndpointConfig> {
        self.endpoints.iter().find(|e| e.name == name)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limit.instance_count == 0 {
            return Err(ConfigError::ZeroInstances);
        }

        let mut seen = HashSet::new();
        for ep in &self.endpoints {
            if !seen.insert(ep.name.as_str()) {
                return Err(ConfigError::DuplicateEndpoint(ep.name.clone()));
            }
            if ep.failure_threshold == 0 {
                return Err(ConfigError::ZeroFailureThreshold(ep.name.clone()));
            }
            if ep.rate_limit_per_minute == 0 {
                return Err(ConfigError::ZeroRateLimit(ep.name.clone()));
            }
            if ep.max_cool_down < ep.cool_down {
                return Err(ConfigError::CoolDownCeilingTooLow(ep.name.clone()));
            }
        }

        for ep in &self.endpoints {
            if let Some(secondary) = &ep.secondary {
                if secondary == &ep.name {
                    return Err(ConfigError::SelfSecondary(ep.name.clone()));
                }
                if !seen.contains(secondary.as_str()) {
                    return Err(ConfigError::UnknownSecondary {
                        endpoint: ep.name.clone(),
                        secondary: secondary.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// The five upstream operations the platform calls out of the box.
fn default_endpoints() -> Vec<EndpointConfig> {
    let base = "https://api.sportsdata.io/v3/nfl";

    let mut live = EndpointConfig::new(
        "live_game_stats",
        format!("{base}/stats/json/BoxScoreByScoreIDV3/{{key}}"),
        DataCategory::LiveStats,
    );
    live.timeout = Duration::from_secs(5);
    live.cool_down = Duration::from_secs(30);

    let mut weekly = EndpointConfig::new(
        "weekly_player_stats",
        format!("{base}/stats/json/PlayerGameStatsByWeek/{{key}}"),
        DataCategory::FinalStats,
    );
    weekly.stale_correction_window = Some(Duration::from_secs(72 * 3600));

    let news = EndpointConfig::new(
        "player_news",
        format!("{base}/scores/json/NewsByPlayerID/{{key}}"),
        DataCategory::News,
    );

    let schedule = EndpointConfig::new(
        "schedule",
        format!("{base}/scores/json/Schedules/{{key}}"),
        DataCategory::Schedule,
    );

    let mut profile = EndpointConfig::new(
        "player_profile",
        format!("{base}/scores/json/Player/{{key}}"),
        DataCategory::Profile,
    );
    profile.read_through = true;

    vec![live, weekly, news, schedule, profile]
}

/// Parse "endpoint:key,endpoint:key" into pairs. Malformed items are skipped.
fn parse_warm_keys(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|item| {
            let (endpoint, key) = item.trim().split_once(':')?;
            if endpoint.is_empty() || key.is_empty() {
                return None;
            }
            Some((endpoint.to_string(), key.to_string()))
        })
        .collect()
}

fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = GatewayConfig::default();
        assert_eq!(config.endpoints.len(), 5);
        assert!(config.validate().is_ok());
        assert_eq!(config.rate_limit.max_queue_size, 100);
        assert_eq!(config.rate_limit.tier, ApiTier::Free);
        assert!(!config.rate_limit.distributed);
    }

    #[test]
    fn test_tier_limits() {
        assert_eq!(ApiTier::Free.limit_per_minute(), 30);
        assert_eq!(ApiTier::Starter.limit_per_minute(), 60);
        assert_eq!(ApiTier::Paid.limit_per_minute(), 600);
        assert_eq!(ApiTier::parse("PAID"), Some(ApiTier::Paid));
        assert_eq!(ApiTier::parse("platinum"), None);
    }

    #[test]
    fn test_ttl_policy_follows_volatility() {
        assert!(default_ttl(DataCategory::LiveStats) < default_ttl(DataCategory::News));
        assert!(default_ttl(DataCategory::News) < default_ttl(DataCategory::Profile));
        assert!(default_ttl(DataCategory::Profile) < default_ttl(DataCategory::Schedule));
    }

    #[test]
    fn test_rejects_unknown_secondary() {
        let mut config = GatewayConfig::default();
        config.endpoints[0].secondary = Some("nope".to_string());
        assert_eq!(
            config.validate(),
            Err(ConfigError::UnknownSecondary {
                endpoint: "live_game_stats".to_string(),
                secondary: "nope".to_string(),
            })
        );
    }

    #[test]
    fn test_rejects_self_secondary_and_duplicates() {
        let mut config = GatewayConfig::default();
        config.endpoints[1].secondary = Some("weekly_player_stats".to_string());
        assert_eq!(
            config.validate(),
            Err(ConfigError::SelfSecondary("weekly_player_stats".to_string()))
        );

        let mut config = GatewayConfig::default();
        let dup = config.endpoints[0].clone();
        config.endpoints.push(dup);
        assert!(matches!(config.validate(), Err(ConfigError::DuplicateEndpoint(_))));
    }

    #[test]
    fn test_rejects_bad_cool_down_ceiling() {
        let mut config = GatewayConfig::default();
        config.endpoints[2].max_cool_down = Duration::from_secs(1);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::CoolDownCeilingTooLow(_))
        ));
    }

    #[test]
    fn test_huge_correction_window_saturates() {
        env::set_var(
            "GRIDIRON_FOREVER_FINAL_STALE_CORRECTION_WINDOW_HOURS",
            u64::MAX.to_string(),
        );
        let ep = EndpointConfig::new("forever_final", "https://x.test/{key}", DataCategory::FinalStats)
            .with_env_overrides();
        assert_eq!(ep.stale_correction_window, Some(Duration::from_secs(u64::MAX)));
    }

    #[test]
    fn test_parse_warm_keys() {
        let keys = parse_warm_keys("schedule:2024, player_profile:18890 ,broken,:x");
        assert_eq!(
            keys,
            vec![
                ("schedule".to_string(), "2024".to_string()),
                ("player_profile".to_string(), "18890".to_string()),
            ]
        );
    }
}
