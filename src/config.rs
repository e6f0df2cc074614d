use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use config::{Config as ConfigBuilder, Environment};
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    // Host used in preview URLs
    #[serde(default = "default_public_host")]
    pub public_host: String,
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,
    // Port every preview container listens on internally
    #[serde(default = "default_container_port")]
    pub container_port: u16,
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,
    // Optional JSON snapshot of the record store
    pub store_path: Option<PathBuf>,
    #[serde(default = "default_git_url_template")]
    pub git_url_template: String,
    #[serde(default = "default_git_bin")]
    pub git_bin: String,
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,
    #[serde(default = "default_dockerfile")]
    pub dockerfile: String,
    // "user=token,user2=token2"
    #[serde(default)]
    pub api_tokens: String,
    // HMAC secret for GitHub webhook signatures
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub webhook_secret: Option<SecretString>,
    // Slack Incoming Webhook URL for build alerts
    pub slack_webhook_url: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_public_host() -> String {
    "localhost".to_string()
}

fn default_port_range_start() -> u16 {
    5000
}

fn default_port_range_end() -> u16 {
    5999
}

fn default_container_port() -> u16 {
    3000
}

fn default_workspace_dir() -> PathBuf {
    std::env::temp_dir().join("previewd")
}

fn default_git_url_template() -> String {
    "https://github.com/{owner}/{repo}.git".to_string()
}

fn default_git_bin() -> String {
    "git".to_string()
}

fn default_docker_bin() -> String {
    "docker".to_string()
}

fn default_dockerfile() -> String {
    "Dockerfile".to_string()
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.filter(|s| !s.is_empty()).map(SecretString::from))
}

impl Config {
    pub fn load() -> Result<Self> {
        #[cfg(debug_assertions)]
        let _ = dotenvy::from_filename(".env.local");

        Self::from_environment(Environment::default().separator("__"))
    }

    pub(crate) fn from_environment(source: Environment) -> Result<Self> {
        let config: Config = ConfigBuilder::builder()
            .add_source(source)
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.port_range_start > self.port_range_end {
            bail!(
                "port_range_start ({}) must not exceed port_range_end ({})",
                self.port_range_start,
                self.port_range_end
            );
        }
        self.token_owners()?;
        Ok(())
    }

    pub fn port_range(&self) -> RangeInclusive<u16> {
        self.port_range_start..=self.port_range_end
    }

    /// Maps each API token to the user it authenticates.
    pub fn token_owners(&self) -> Result<HashMap<String, String>> {
        let mut owners = HashMap::new();
        for pair in self.api_tokens.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((user, token)) = pair.split_once('=') else {
                bail!("api_tokens entry '{}' is not of the form user=token", pair);
            };
            let (user, token) = (user.trim(), token.trim());
            if user.is_empty() || token.is_empty() {
                bail!("api_tokens entry '{}' has an empty user or token", pair);
            }
            owners.insert(token.to_string(), user.to_string());
        }
        Ok(owners)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let source = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        Config::from_environment(Environment::default().source(Some(source)))
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = load(&[]).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.port_range(), 5000..=5999);
        assert_eq!(config.container_port, 3000);
        assert_eq!(config.dockerfile, "Dockerfile");
        assert!(config.webhook_secret.is_none());
        assert!(config.store_path.is_none());
        assert!(config.token_owners().unwrap().is_empty());
    }

    #[test]
    fn reads_values_from_environment() {
        let config = load(&[
            ("PORT_RANGE_START", "7000"),
            ("PORT_RANGE_END", "7010"),
            ("PUBLIC_HOST", "previews.example.com"),
            ("WEBHOOK_SECRET", "s3cret"),
            ("API_TOKENS", "alice=tok-a, bob=tok-b"),
        ])
        .unwrap();
        assert_eq!(config.port_range(), 7000..=7010);
        assert_eq!(config.public_host, "previews.example.com");
        assert_eq!(
            config.webhook_secret.as_ref().unwrap().expose_secret(),
            "s3cret"
        );
        let owners = config.token_owners().unwrap();
        assert_eq!(owners.get("tok-a").map(String::as_str), Some("alice"));
        assert_eq!(owners.get("tok-b").map(String::as_str), Some("bob"));
    }

    #[test]
    fn rejects_inverted_port_range() {
        let err = load(&[("PORT_RANGE_START", "6000"), ("PORT_RANGE_END", "5000")]).unwrap_err();
        assert!(err.to_string().contains("port_range_start"));
    }

    #[test]
    fn rejects_malformed_tokens() {
        assert!(load(&[("API_TOKENS", "alice")]).is_err());
        assert!(load(&[("API_TOKENS", "=tok")]).is_err());
    }
}
