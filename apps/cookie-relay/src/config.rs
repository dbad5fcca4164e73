use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub console_logging: bool,
    /// Port for the collaborator's sign-in proxy; 0 lets it choose.
    #[serde(default)]
    pub proxy_port: u16,
    #[serde(default = "default_provider_url")]
    pub provider_url: String,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_refresh_retention_secs")]
    pub refresh_retention_secs: u64,
    #[serde(default = "default_live_channel_delay_ms")]
    pub live_channel_delay_ms: u64,
}

impl AppConfig {
    /// Layer the optional JSON file under `COOKIE_RELAY_*` environment variables.
    pub fn load(path: &Path) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Json)
                    .required(false),
            )
            .add_source(config::Environment::with_prefix("COOKIE_RELAY"))
            .build()
            .and_then(|c| c.try_deserialize::<AppConfig>())
            .map(AppConfig::normalize)
    }

    pub fn with_port_override(mut self, port: Option<u16>) -> Self {
        if let Some(port) = port {
            self.port = port;
        }
        self
    }

    pub fn auth_enabled(&self) -> bool {
        self.username.is_some()
    }

    pub fn refresh_retention(&self) -> Duration {
        Duration::from_secs(self.refresh_retention_secs)
    }

    pub fn live_channel_delay(&self) -> Duration {
        Duration::from_millis(self.live_channel_delay_ms)
    }

    fn normalize(mut self) -> Self {
        self.username = Self::normalize_opt(self.username.take());
        // Passwords are compared byte for byte; only an empty one means unset.
        self.password = self.password.take().filter(|p| !p.is_empty());
        self.redis_url = Self::normalize_opt(self.redis_url.take());
        self.provider_url = self.provider_url.trim().trim_end_matches('/').to_string();
        if self.provider_url.is_empty() {
            self.provider_url = default_provider_url();
        }
        self
    }

    fn normalize_opt(value: Option<String>) -> Option<String> {
        value.and_then(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            username: None,
            password: None,
            console_logging: false,
            proxy_port: 0,
            provider_url: default_provider_url(),
            redis_url: None,
            refresh_retention_secs: default_refresh_retention_secs(),
            live_channel_delay_ms: default_live_channel_delay_ms(),
        }
    }
}

fn default_port() -> u16 {
    3000
}

fn default_provider_url() -> String {
    "http://127.0.0.1:3456".to_string()
}

fn default_refresh_retention_secs() -> u64 {
    300
}

fn default_live_channel_delay_ms() -> u64 {
    2_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.port, 3000);
        assert!(!config.auth_enabled());
        assert_eq!(config.refresh_retention(), Duration::from_secs(300));
        assert_eq!(config.live_channel_delay(), Duration::from_secs(2));
    }

    #[test]
    fn json_file_is_read_and_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{
                "port": 8123,
                "username": "  ",
                "password": "secret",
                "console_logging": true,
                "proxy_port": 3457,
                "provider_url": "http://sidecar:9000/",
                "redis_url": ""
            }}"#
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.port, 8123);
        assert_eq!(config.username, None);
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert!(config.console_logging);
        assert_eq!(config.proxy_port, 3457);
        assert_eq!(config.provider_url, "http://sidecar:9000");
        assert_eq!(config.redis_url, None);
    }

    #[test]
    fn password_keeps_surrounding_spaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"username": " admin ", "password": " pw "}"#).unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.username.as_deref(), Some("admin"));
        assert_eq!(config.password.as_deref(), Some(" pw "));

        std::fs::write(&path, r#"{"username": "admin", "password": ""}"#).unwrap();
        assert_eq!(AppConfig::load(&path).unwrap().password, None);
    }

    #[test]
    fn port_override_wins() {
        let config = AppConfig::default().with_port_override(Some(9999));
        assert_eq!(config.port, 9999);
        let config = AppConfig::default().with_port_override(None);
        assert_eq!(config.port, 3000);
    }
}
