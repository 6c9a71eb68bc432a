use std::{env, path::PathBuf, str::FromStr, time::Duration};

use tracing::warn;

pub const DEFAULT_OSRM_URL: &str = "https://router.project-osrm.org";
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(15);
/// Cached routes are good for a day.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60 * 60 * 24);
pub const DEFAULT_DEVIATION_THRESHOLD_M: f64 = 100.;
pub const DEFAULT_SAMPLE_STRIDE: usize = 5;
pub const DEFAULT_VOICE_ALERT_M: f64 = 500.;
/// Tracking is considered complete within 1% of the total distance.
pub const DEFAULT_COMPLETION_EPSILON: f64 = 0.01;
pub const BREADCRUMB_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct Config {
    pub osrm_url: String,
    pub osrm_profile: String,
    pub alternatives: bool,
    pub provider_timeout: Duration,
    pub cache_ttl: Duration,
    pub db_path: PathBuf,
    pub sample_stride: usize,
    pub tracker: TrackerConfig,
    /// Position fixes closer together than this are dropped.
    pub position_interval: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct TrackerConfig {
    pub deviation_threshold_m: f64,
    pub completion_epsilon: f64,
    pub voice_alert_m: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            deviation_threshold_m: DEFAULT_DEVIATION_THRESHOLD_M,
            completion_epsilon: DEFAULT_COMPLETION_EPSILON,
            voice_alert_m: DEFAULT_VOICE_ALERT_M,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            osrm_url: DEFAULT_OSRM_URL.to_string(),
            osrm_profile: "driving".to_string(),
            alternatives: true,
            provider_timeout: DEFAULT_PROVIDER_TIMEOUT,
            cache_ttl: DEFAULT_CACHE_TTL,
            db_path: PathBuf::from("./cache"),
            sample_stride: DEFAULT_SAMPLE_STRIDE,
            tracker: TrackerConfig::default(),
            position_interval: Duration::from_secs(1),
        }
    }
}

impl Config {
    /// The defaults, overridden by any `HACIENDA_*` environment variables
    /// that are set.
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(url) = env::var("HACIENDA_OSRM_URL") {
            config.osrm_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(profile) = env::var("HACIENDA_OSRM_PROFILE") {
            config.osrm_profile = profile;
        }
        if let Ok(path) = env::var("HACIENDA_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(alternatives) = parse_var("HACIENDA_ALTERNATIVES") {
            config.alternatives = alternatives;
        }
        if let Some(secs) = parse_var::<u64>("HACIENDA_PROVIDER_TIMEOUT_SECS") {
            config.provider_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("HACIENDA_CACHE_TTL_SECS") {
            config.cache_ttl = Duration::from_secs(secs);
        }
        if let Some(stride) = parse_var::<usize>("HACIENDA_SAMPLE_STRIDE") {
            config.sample_stride = stride.max(1);
        }
        if let Some(meters) = parse_var("HACIENDA_DEVIATION_M") {
            config.tracker.deviation_threshold_m = meters;
        }
        if let Some(meters) = parse_var("HACIENDA_VOICE_ALERT_M") {
            config.tracker.voice_alert_m = meters;
        }

        config
    }
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    let value = env::var(name).ok()?;
    match value.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring invalid value for {name}: {value:?}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.provider_timeout, Duration::from_secs(15));
        assert_eq!(config.sample_stride, 5);
        assert_eq!(config.tracker.deviation_threshold_m, 100.);
        assert_eq!(config.cache_ttl, Duration::from_secs(86_400));
    }

    #[test]
    fn test_parse_var_ignores_garbage() {
        // SAFETY: no other test touches this variable.
        unsafe { env::set_var("HACIENDA_TEST_GARBAGE", "not a number") };
        assert_eq!(parse_var::<u64>("HACIENDA_TEST_GARBAGE"), None);
        unsafe { env::set_var("HACIENDA_TEST_GARBAGE", " 42 ") };
        assert_eq!(parse_var::<u64>("HACIENDA_TEST_GARBAGE"), Some(42));
        unsafe { env::remove_var("HACIENDA_TEST_GARBAGE") };
    }
}
