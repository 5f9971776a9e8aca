//! Runtime configuration. The HTTP surface and process bootstrap live
//! outside this crate; what remains here is the handful of knobs the core
//! needs to construct a [`crate::coordinator::Coordinator`].
//!
//! Connection parameters are plain fields rather than a bootstrap framework.

use std::env;
use std::time::Duration;

use crate::client::DEFAULT_QUERY_ROWS;

/// The two environment values spec.md §6 names: where the backends live,
/// and what this proxy calls itself in backend-facing settings.
#[derive(Debug, Clone)]
pub struct Config {
    pub base_url: String,
    pub app_origin: String,
    pub query_rows: usize,
    pub cache_ttl: Duration,
}

impl Config {
    /// Reads `API_URL` / `APP_ORIGIN` from the environment; tunables stay
    /// code-governed defaults unless overridden.
    pub fn from_env() -> Result<Config, env::VarError> {
        Ok(Config {
            base_url: env::var("API_URL")?,
            app_origin: env::var("APP_ORIGIN").unwrap_or_default(),
            query_rows: DEFAULT_QUERY_ROWS,
            cache_ttl: Duration::from_secs(60 * 60),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // env::set_var/remove_var are process-global; run both cases in one
    // test so they can't race against each other under a parallel test runner.
    #[test]
    fn from_env_reads_api_url_and_defaults_app_origin() {
        env::remove_var("API_URL");
        assert!(Config::from_env().is_err());

        env::set_var("API_URL", "http://localhost:8983/solr/");
        env::remove_var("APP_ORIGIN");
        let config = Config::from_env().unwrap();
        assert_eq!(config.base_url, "http://localhost:8983/solr/");
        assert_eq!(config.app_origin, "");
        assert_eq!(config.query_rows, DEFAULT_QUERY_ROWS);
        env::remove_var("API_URL");
    }
}
