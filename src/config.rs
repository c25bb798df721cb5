//! Process configuration: a TOML file plus environment overrides.
//!
//! Token secrets may live in the file or in `MARQUEE_ACCESS_SECRET` /
//! `MARQUEE_REFRESH_SECRET`; the environment wins. A missing secret is a
//! fatal startup condition; the process refuses to serve without both.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Environment variable overriding `[auth].access_secret`.
pub const ACCESS_SECRET_ENV: &str = "MARQUEE_ACCESS_SECRET";

/// Environment variable overriding `[auth].refresh_secret`.
pub const REFRESH_SECRET_ENV: &str = "MARQUEE_REFRESH_SECRET";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Marks session cookies `Secure`. Leave on everywhere except local
    /// plain-HTTP development.
    pub cookie_secure: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8321,
            cookie_secure: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "marquee.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub access_secret: String,
    pub refresh_secret: String,
}

impl Config {
    /// Load configuration. With no path, start from defaults; either way the
    /// secret environment variables override whatever the file said.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("Failed to read config file {}", p.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("Failed to parse config file {}", p.display()))?
            }
            None => Config::default(),
        };

        if let Ok(secret) = std::env::var(ACCESS_SECRET_ENV) {
            config.auth.access_secret = secret;
        }
        if let Ok(secret) = std::env::var(REFRESH_SECRET_ENV) {
            config.auth.refresh_secret = secret;
        }

        Ok(config)
    }

    /// Reject configurations the server cannot safely run with.
    pub fn validate(&self) -> Result<()> {
        if self.auth.access_secret.trim().is_empty() {
            bail!(
                "Access token secret is not configured (set [auth].access_secret or {ACCESS_SECRET_ENV})"
            );
        }
        if self.auth.refresh_secret.trim().is_empty() {
            bail!(
                "Refresh token secret is not configured (set [auth].refresh_secret or {REFRESH_SECRET_ENV})"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_bind_loopback() {
        let config = Config::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8321);
        assert!(config.server.cookie_secure);
        assert_eq!(config.store.path, "marquee.db");
    }

    #[test]
    fn parses_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 9000
            cookie_secure = false

            [auth]
            access_secret = "a-secret"
            refresh_secret = "r-secret"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert!(!config.server.cookie_secure);
        assert_eq!(config.auth.access_secret, "a-secret");
    }

    #[test]
    fn validate_requires_both_secrets() {
        let mut config = Config::default();
        assert!(config.validate().is_err());

        config.auth.access_secret = "only-access".to_string();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("Refresh token secret"));

        config.auth.refresh_secret = "and-refresh".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_reads_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("marquee.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[store]\npath = \"catalog.db\"\n[auth]\naccess_secret = \"x\"\nrefresh_secret = \"y\""
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.store.path, "catalog.db");
    }

    #[test]
    fn load_rejects_bad_toml() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("broken.toml");
        std::fs::write(&path, "[server\nport = not-a-number").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }
}
