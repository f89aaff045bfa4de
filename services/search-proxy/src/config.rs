//! Configuration types and loading
//!
//! Config precedence: CLI `--config` > `CONFIG_PATH` env var > default file.
//! Provider secrets never live in the TOML; they are pooled keys in the store.

use chrono::{TimeDelta, Utc};
use key_pool::QuotaPolicy;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub provider: ProviderConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub users: UsersConfig,
}

/// Listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Admin API listener. Keep it off the public interface.
    #[serde(default = "default_admin_addr")]
    pub admin_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    /// JSON file holding keys, users, recent usage records and sweep markers
    pub path: PathBuf,
    /// How long usage records stay in the store file before moving to the
    /// archive. At least 24 so the whole current day is always countable.
    #[serde(default = "default_usage_retention_hours")]
    pub usage_retention_hours: i64,
}

/// Search provider and proxy endpoints
#[derive(Debug, Deserialize)]
pub struct ProviderConfig {
    pub search_endpoint: String,
    pub proxy_endpoint: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Number of matches requested per search; only the top one is rendered
    #[serde(default = "default_results")]
    pub results: u32,
}

#[derive(Debug, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

/// Overrides for the quota tiers. Anything left out keeps its default.
#[derive(Debug, Default, Deserialize)]
pub struct QuotaConfig {
    pub search_quota: Option<u32>,
    pub proxy_standard_quota: Option<u32>,
    pub proxy_fresh_quota: Option<u32>,
    pub fresh_window_months: Option<u32>,
    pub search_grace_hours: Option<i64>,
    pub rate_limit_delay_secs: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SweepConfig {
    /// In-process sweep interval. 0 leaves sweeping to an external scheduler
    /// calling `POST /admin/sweep`.
    #[serde(default)]
    pub interval_secs: u64,
}

/// Per-user limits
#[derive(Debug, Deserialize)]
pub struct UsersConfig {
    /// Searches per UTC day for ORDINARY users
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
}

impl Default for UsersConfig {
    fn default() -> Self {
        Self {
            daily_limit: default_daily_limit(),
        }
    }
}

fn default_admin_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_max_connections() -> usize {
    1000
}

fn default_timeout() -> u64 {
    10
}

fn default_results() -> u32 {
    1
}

fn default_max_attempts() -> u32 {
    3
}

fn default_daily_limit() -> u32 {
    7
}

fn default_usage_retention_hours() -> i64 {
    key_store::file::DEFAULT_USAGE_RETENTION_HOURS
}

/// Parse an override into a non-negative window that can be added to the
/// current time without overflowing.
fn window(field: &'static str, delta: Option<TimeDelta>) -> common::Result<TimeDelta> {
    delta
        .filter(|d| *d >= TimeDelta::zero())
        .filter(|d| Utc::now().checked_add_signed(*d).is_some())
        .ok_or_else(|| common::Error::invalid(field, "out of range"))
}

fn require_http(field: &'static str, value: &str) -> common::Result<()> {
    if value.starts_with("http://") || value.starts_with("https://") {
        Ok(())
    } else {
        Err(common::Error::invalid(
            field,
            format!("must start with http:// or https://, got: {value}"),
        ))
    }
}

impl Config {
    /// Load configuration from a TOML file and validate it.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        require_http("provider.search_endpoint", &self.provider.search_endpoint)?;
        require_http("provider.proxy_endpoint", &self.provider.proxy_endpoint)?;

        if self.provider.timeout_secs == 0 {
            return Err(common::Error::invalid(
                "provider.timeout_secs",
                "must be greater than 0",
            ));
        }
        if self.provider.results == 0 {
            return Err(common::Error::invalid(
                "provider.results",
                "must be greater than 0",
            ));
        }
        if self.search.max_attempts == 0 {
            return Err(common::Error::invalid(
                "search.max_attempts",
                "must be greater than 0",
            ));
        }
        if self.server.max_connections == 0 {
            return Err(common::Error::invalid(
                "server.max_connections",
                "must be greater than 0",
            ));
        }
        if self.server.listen_addr == self.server.admin_addr {
            return Err(common::Error::Config(
                "server.admin_addr must differ from server.listen_addr".into(),
            ));
        }
        if self.store.path.as_os_str().is_empty() {
            return Err(common::Error::invalid("store.path", "must not be empty"));
        }
        if self.users.daily_limit == 0 {
            return Err(common::Error::invalid(
                "users.daily_limit",
                "must be greater than 0",
            ));
        }
        self.usage_retention()?;

        // Surface bad durations at load time rather than at first use
        self.quota_policy()?;
        Ok(())
    }

    /// Quota policy with the configured overrides applied.
    pub fn quota_policy(&self) -> common::Result<QuotaPolicy> {
        let mut policy = QuotaPolicy::default();
        let quota = &self.quota;

        if let Some(v) = quota.search_quota {
            policy.search_quota = v;
        }
        if let Some(v) = quota.proxy_standard_quota {
            policy.proxy_standard_quota = v;
        }
        if let Some(v) = quota.proxy_fresh_quota {
            policy.proxy_fresh_quota = v;
        }
        if let Some(v) = quota.fresh_window_months {
            policy.fresh_window_months = v;
        }
        if let Some(hours) = quota.search_grace_hours {
            policy.search_grace = window("quota.search_grace_hours", TimeDelta::try_hours(hours))?;
        }
        if let Some(secs) = quota.rate_limit_delay_secs {
            policy.rate_limit_delay =
                window("quota.rate_limit_delay_secs", TimeDelta::try_seconds(secs))?;
        }
        Ok(policy)
    }

    /// Live usage window of the store file.
    pub fn usage_retention(&self) -> common::Result<TimeDelta> {
        let retention = window(
            "store.usage_retention_hours",
            TimeDelta::try_hours(self.store.usage_retention_hours),
        )?;
        if retention < TimeDelta::hours(24) {
            return Err(common::Error::invalid(
                "store.usage_retention_hours",
                "must be at least 24",
            ));
        }
        Ok(retention)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider.timeout_secs)
    }

    /// In-process sweep interval, if one is configured.
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep.interval_secs > 0).then(|| Duration::from_secs(self.sweep.interval_secs))
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("search-proxy.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that mutate environment variables.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn minimal_toml() -> &'static str {
        r#"
[server]
listen_addr = "127.0.0.1:8080"

[store]
path = "/var/lib/search-proxy/keys.json"

[provider]
search_endpoint = "https://saucenao.com/search.php"
proxy_endpoint = "https://api.scraperapi.com/"
"#
    }

    fn load_str(name: &str, contents: &str) -> common::Result<Config> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        Config::load(&path)
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config = load_str("minimal.toml", minimal_toml()).unwrap();

        assert_eq!(config.server.admin_addr, default_admin_addr());
        assert_eq!(config.server.max_connections, 1000);
        assert_eq!(config.provider.timeout_secs, 10);
        assert_eq!(config.provider.results, 1);
        assert_eq!(config.search.max_attempts, 3);
        assert_eq!(config.users.daily_limit, 7);
        assert_eq!(config.usage_retention().unwrap(), TimeDelta::hours(48));
        assert_eq!(config.sweep_interval(), None);
        assert_eq!(config.provider_timeout(), Duration::from_secs(10));

        let policy = config.quota_policy().unwrap();
        assert_eq!(policy.search_quota, 100);
        assert_eq!(policy.proxy_fresh_quota, 5000);
        assert_eq!(policy.search_grace, TimeDelta::hours(24));
    }

    #[test]
    fn full_config_overrides() {
        let toml = r#"
[server]
listen_addr = "0.0.0.0:8080"
admin_addr = "127.0.0.1:9191"
max_connections = 64

[store]
path = "keys.json"
usage_retention_hours = 72

[provider]
search_endpoint = "http://localhost:1/search"
proxy_endpoint = "http://localhost:2/"
timeout_secs = 4
results = 5

[search]
max_attempts = 5

[quota]
search_quota = 200
proxy_fresh_quota = 7000
search_grace_hours = 12
rate_limit_delay_secs = 90

[sweep]
interval_secs = 300

[users]
daily_limit = 20
"#;
        let config = load_str("full.toml", toml).unwrap();
        assert_eq!(config.server.admin_addr.port(), 9191);
        assert_eq!(config.server.max_connections, 64);
        assert_eq!(config.provider.results, 5);
        assert_eq!(config.search.max_attempts, 5);
        assert_eq!(config.sweep_interval(), Some(Duration::from_secs(300)));
        assert_eq!(config.users.daily_limit, 20);
        assert_eq!(config.usage_retention().unwrap(), TimeDelta::hours(72));

        let policy = config.quota_policy().unwrap();
        assert_eq!(policy.search_quota, 200);
        assert_eq!(policy.proxy_standard_quota, 1000);
        assert_eq!(policy.proxy_fresh_quota, 7000);
        assert_eq!(policy.search_grace, TimeDelta::hours(12));
        assert_eq!(policy.rate_limit_delay, TimeDelta::seconds(90));
    }

    #[test]
    fn missing_file_fails() {
        assert!(Config::load(Path::new("/nonexistent/path/config.toml")).is_err());
    }

    #[test]
    fn invalid_toml_fails() {
        assert!(load_str("bad.toml", "not valid {{{{ toml").is_err());
    }

    #[test]
    fn endpoint_without_scheme_is_rejected() {
        let toml = minimal_toml().replace("https://api.scraperapi.com/", "api.scraperapi.com");
        let err = load_str("scheme.toml", &toml).unwrap_err().to_string();
        assert!(
            err.contains("provider.proxy_endpoint"),
            "error should name the field, got: {err}"
        );
    }

    #[test]
    fn zero_values_are_rejected() {
        let cases = [
            ("[provider]", "[provider]\ntimeout_secs = 0"),
            ("[provider]", "[provider]\nresults = 0"),
            ("[server]", "[server]\nmax_connections = 0"),
        ];
        for (section, replacement) in cases {
            let toml = minimal_toml().replace(section, replacement);
            assert!(load_str("zero.toml", &toml).is_err(), "{replacement}");
        }

        let toml = format!("{}\n[search]\nmax_attempts = 0\n", minimal_toml());
        assert!(load_str("attempts.toml", &toml).is_err());

        let toml = format!("{}\n[users]\ndaily_limit = 0\n", minimal_toml());
        assert!(load_str("limit.toml", &toml).is_err());
    }

    #[test]
    fn usage_retention_must_cover_a_day() {
        let toml = minimal_toml().replace(
            "[store]",
            "[store]\nusage_retention_hours = 12",
        );
        let err = load_str("retention.toml", &toml).unwrap_err().to_string();
        assert!(err.contains("usage_retention_hours"), "got: {err}");
    }

    #[test]
    fn windows_past_the_calendar_range_are_rejected() {
        // Representable as a TimeDelta, but now + window overflows
        let toml = format!(
            "{}\n[quota]\nsearch_grace_hours = 2500000000\n",
            minimal_toml()
        );
        let err = load_str("grace.toml", &toml).unwrap_err().to_string();
        assert!(err.contains("search_grace_hours"), "got: {err}");

        let toml = format!(
            "{}\n[quota]\nrate_limit_delay_secs = 9000000000000\n",
            minimal_toml()
        );
        let err = load_str("delay.toml", &toml).unwrap_err().to_string();
        assert!(err.contains("rate_limit_delay_secs"), "got: {err}");
    }

    #[test]
    fn shared_listener_address_is_rejected() {
        let toml = minimal_toml().replace(
            "[server]",
            "[server]\nadmin_addr = \"127.0.0.1:8080\"",
        );
        assert!(load_str("shared.toml", &toml).is_err());
    }

    #[test]
    fn negative_durations_are_rejected() {
        let toml = format!("{}\n[quota]\nrate_limit_delay_secs = -5\n", minimal_toml());
        let err = load_str("negative.toml", &toml).unwrap_err().to_string();
        assert!(err.contains("rate_limit_delay_secs"), "got: {err}");
    }

    #[test]
    fn resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("/env/path.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }

    #[test]
    fn resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("search-proxy.toml"));
    }

    #[test]
    fn resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/should-lose.toml") };
        let path = Config::resolve_path(Some("/cli/wins.toml"));
        assert_eq!(
            path,
            PathBuf::from("/cli/wins.toml"),
            "CLI arg must take precedence over CONFIG_PATH env var"
        );
        unsafe { remove_env("CONFIG_PATH") };
    }
}
