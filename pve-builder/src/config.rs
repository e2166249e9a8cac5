use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Builder configuration, loaded once and shared read-only between steps.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Proxmox API base URL, e.g. `https://pve.local:8006/api2/json`
    #[serde(default)]
    pub proxmox_url: String,
    /// `user@realm` for password auth, `user@realm!tokenid` for token auth
    #[serde(default)]
    pub username: String,
    pub password: Option<String>,
    pub token: Option<String>,
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
    pub proxy_server: Option<String>,
    #[serde(default)]
    pub http_headers: BTreeMap<String, String>,
    #[serde(default = "default_task_timeout")]
    pub task_timeout: u64,
    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub iso_urls: Vec<String>,
    pub iso_checksum: Option<String>,
    /// ISO already present on Proxmox storage (`<pool>:iso/<name>`); disables upload
    #[serde(default)]
    pub iso_file: String,
    #[serde(default = "default_iso_storage_pool")]
    pub iso_storage_pool: String,
    /// Bytes per streamed frame; zero or negative uploads in a single body
    #[serde(default, deserialize_with = "deserialize_size")]
    pub iso_upload_chunk_size: i64,
    #[serde(default = "default_iso_cache_dir")]
    pub iso_cache_dir: PathBuf,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Fill unset connection fields from `PROXMOX_*` variables.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if self.proxmox_url.is_empty() {
            if let Some(url) = lookup("PROXMOX_URL") {
                self.proxmox_url = url;
            }
        }
        if self.username.is_empty() {
            if let Some(username) = lookup("PROXMOX_USERNAME") {
                self.username = username;
            }
        }
        if self.password.is_none() {
            self.password = lookup("PROXMOX_PASSWORD");
        }
        if self.token.is_none() {
            self.token = lookup("PROXMOX_TOKEN");
        }
    }

    /// Validate the configuration, reporting every problem at once.
    pub fn prepare(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.proxmox_url.is_empty() {
            errors.push("proxmox_url must be specified".to_string());
        } else if let Err(e) = Url::parse(&self.proxmox_url) {
            errors.push(format!("could not parse proxmox_url: {}", e));
        }
        if self.username.is_empty() {
            errors.push("username must be specified".to_string());
        }
        if self.token().is_none() && self.password().is_none() {
            errors.push("password or token must be specified".to_string());
        }
        if self.node.is_empty() {
            errors.push("node must be specified".to_string());
        }
        if self.task_timeout == 0 {
            errors.push("task_timeout must be greater than zero".to_string());
        }
        if self.should_upload_iso() {
            if self.iso_urls.is_empty() {
                errors.push("one of iso_file or iso_urls must be specified".to_string());
            }
            if self.iso_storage_pool.is_empty() {
                errors.push("iso_storage_pool must be set when uploading an ISO".to_string());
            }
        }

        if !errors.is_empty() {
            bail!("Invalid configuration:\n  - {}", errors.join("\n  - "));
        }
        Ok(())
    }

    /// An ISO has to be uploaded unless one already on storage is referenced.
    pub fn should_upload_iso(&self) -> bool {
        self.iso_file.is_empty()
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref().filter(|t| !t.is_empty())
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref().filter(|p| !p.is_empty())
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SizeValue {
    Bytes(i64),
    Human(String),
}

/// Accept either a plain byte count or a human size such as `"64MiB"`.
fn deserialize_size<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match SizeValue::deserialize(deserializer)? {
        SizeValue::Bytes(bytes) => Ok(bytes),
        SizeValue::Human(text) => {
            let bytes = parse_size::parse_size(text.trim()).map_err(serde::de::Error::custom)?;
            i64::try_from(bytes).map_err(serde::de::Error::custom)
        }
    }
}

// Default functions
fn default_task_timeout() -> u64 {
    60
}

fn default_iso_storage_pool() -> String {
    "local".to_string()
}

fn default_iso_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("pve-builder")
        .join("iso")
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        proxmox_url: "https://pve.local:8006/api2/json".to_string(),
        username: "root@pam".to_string(),
        password: Some("secret".to_string()),
        token: None,
        insecure_skip_tls_verify: false,
        proxy_server: None,
        http_headers: BTreeMap::new(),
        task_timeout: default_task_timeout(),
        debug: false,
        node: "pve1".to_string(),
        iso_urls: vec!["https://releases.example.org/my%20disk.iso".to_string()],
        iso_checksum: None,
        iso_file: String::new(),
        iso_storage_pool: default_iso_storage_pool(),
        iso_upload_chunk_size: 0,
        iso_cache_dir: std::env::temp_dir(),
    }
}
