use std::time::Duration;

/// Default number of runs shown in the job list.
const DEFAULT_JOB_LIST_LIMIT: usize = 20;

/// Client configuration loaded from environment variables.
///
/// All fields have defaults suitable for a local collection service.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// HTTP base URL of the collection service.
    pub api_url: String,
    /// WebSocket base URL of the event stream.
    pub ws_url: String,
    /// Bounded wait for start/stop commands and HTTP requests.
    pub request_timeout: Duration,
    /// Status polling interval (the push-independent backstop).
    pub poll_interval: Duration,
    /// Fixed delay between transport reconnect attempts.
    pub reconnect_delay: Duration,
    /// How many runs the job list fetches.
    pub job_list_limit: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} has invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl Default for SyncConfig {
    fn default() -> Self {
        let api_url = "http://localhost:8000".to_string();
        Self {
            ws_url: derive_ws_url(&api_url),
            api_url,
            request_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(2000),
            reconnect_delay: Duration::from_secs(3),
            job_list_limit: DEFAULT_JOB_LIST_LIMIT,
        }
    }
}

impl SyncConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                | Default                       |
    /// |------------------------|-------------------------------|
    /// | `NEWSDESK_API_URL`     | `http://localhost:8000`       |
    /// | `NEWSDESK_WS_URL`      | API URL with `http` -> `ws`   |
    /// | `REQUEST_TIMEOUT_SECS` | `30`                          |
    /// | `POLL_INTERVAL_MS`     | `2000`                        |
    /// | `RECONNECT_DELAY_SECS` | `3`                           |
    /// | `JOB_LIST_LIMIT`       | `20`                          |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let api_url = lookup("NEWSDESK_API_URL")
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .unwrap_or(defaults.api_url);
        if !(api_url.starts_with("http://") || api_url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                var: "NEWSDESK_API_URL",
                value: api_url,
                reason: "must start with http:// or https://".into(),
            });
        }

        let ws_url = lookup("NEWSDESK_WS_URL")
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .unwrap_or_else(|| derive_ws_url(&api_url));

        let request_timeout = parse_positive(&lookup, "REQUEST_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.request_timeout);
        let poll_interval = parse_positive(&lookup, "POLL_INTERVAL_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);
        let reconnect_delay = parse_positive(&lookup, "RECONNECT_DELAY_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.reconnect_delay);
        let job_list_limit = parse_positive(&lookup, "JOB_LIST_LIMIT")?
            .map(|v| v as usize)
            .unwrap_or(defaults.job_list_limit);

        Ok(Self {
            api_url,
            ws_url,
            request_timeout,
            poll_interval,
            reconnect_delay,
            job_list_limit,
        })
    }
}

/// `http://host` -> `ws://host`, `https://host` -> `wss://host`.
fn derive_ws_url(api_url: &str) -> String {
    if let Some(rest) = api_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = api_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        api_url.to_string()
    }
}

fn parse_positive<F>(lookup: &F, var: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    match raw.trim().parse::<u64>() {
        Ok(0) => Err(ConfigError::Invalid {
            var,
            value: raw,
            reason: "must be greater than zero".into(),
        }),
        Ok(value) => Ok(Some(value)),
        Err(e) => Err(ConfigError::Invalid {
            var,
            value: raw,
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = SyncConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.api_url, "http://localhost:8000");
        assert_eq!(config.ws_url, "ws://localhost:8000");
        assert_eq!(config.poll_interval, Duration::from_millis(2000));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.job_list_limit, 20);
    }

    #[test]
    fn ws_url_follows_https_api_url() {
        let config =
            SyncConfig::from_lookup(lookup(&[("NEWSDESK_API_URL", "https://news.example.com/")]))
                .unwrap();
        assert_eq!(config.api_url, "https://news.example.com");
        assert_eq!(config.ws_url, "wss://news.example.com");
    }

    #[test]
    fn explicit_ws_url_wins() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("NEWSDESK_API_URL", "http://api:8000"),
            ("NEWSDESK_WS_URL", "ws://events:9000"),
        ]))
        .unwrap();
        assert_eq!(config.ws_url, "ws://events:9000");
    }

    #[test]
    fn overrides_are_parsed() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("REQUEST_TIMEOUT_SECS", "5"),
            ("POLL_INTERVAL_MS", "500"),
            ("JOB_LIST_LIMIT", "50"),
        ]))
        .unwrap();
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.job_list_limit, 50);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let result = SyncConfig::from_lookup(lookup(&[("POLL_INTERVAL_MS", "0")]));
        assert_matches!(
            result,
            Err(ConfigError::Invalid {
                var: "POLL_INTERVAL_MS",
                ..
            })
        );
    }

    #[test]
    fn non_numeric_timeout_is_rejected() {
        let result = SyncConfig::from_lookup(lookup(&[("REQUEST_TIMEOUT_SECS", "soon")]));
        assert_matches!(result, Err(ConfigError::Invalid { .. }));
    }

    #[test]
    fn non_http_api_url_is_rejected() {
        let result = SyncConfig::from_lookup(lookup(&[("NEWSDESK_API_URL", "ftp://x")]));
        assert_matches!(
            result,
            Err(ConfigError::Invalid {
                var: "NEWSDESK_API_URL",
                ..
            })
        );
    }
}
