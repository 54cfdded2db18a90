use crate::error::SessionError;
use crate::mqtt::config::{
    generate_client_id, ConnectionConfig, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_KEEP_ALIVE_SECS,
    DEFAULT_PORT, DEFAULT_ROOT_TOPIC,
};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = ".config/blowcontrol";
const CONFIG_FILE: &str = "config.toml";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Top-level settings file
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub device: DeviceConfig,
    pub session: SessionSettings,
}

/// Where and how to reach the appliance
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    pub host: String,
    pub port: u16,
    pub serial_number: String,
    pub password: String,
    pub root_topic: String,
    /// Generated per process when absent
    pub client_id: Option<String>,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            serial_number: String::new(),
            password: String::new(),
            root_topic: DEFAULT_ROOT_TOPIC.to_string(),
            client_id: None,
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SessionSettings {
    pub request_timeout_secs: u64,
    pub refresh_interval_secs: Option<u64>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            refresh_interval_secs: None,
        }
    }
}

impl AppConfig {
    /// Loads the settings file and applies environment overrides
    ///
    /// Without an explicit path the default location is tried and a missing
    /// file falls back to defaults. An explicit path must exist.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path).await?,
            None => {
                let path = default_config_path();
                if tokio::fs::try_exists(&path)
                    .await
                    .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
                {
                    Self::from_file(&path).await?
                } else {
                    debug!("No config file at {}, using defaults", path.display());
                    Self::default()
                }
            }
        };

        config.apply_env()?;
        Ok(config)
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        info!("Loading config from {}", path.display());
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

        toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Overrides device settings from `DEVICE_IP`, `MQTT_PORT`,
    /// `MQTT_PASSWORD`, `ROOT_TOPIC`, `SERIAL_NUMBER` and `MQTT_CLIENT_ID`
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let device = &mut self.device;
        if let Some(host) = lookup("DEVICE_IP") {
            device.host = host;
        }
        if let Some(port) = lookup("MQTT_PORT") {
            device.port = port
                .trim()
                .parse()
                .map_err(|e| eyre!("Invalid MQTT_PORT '{}': {}", port, e))?;
        }
        if let Some(password) = lookup("MQTT_PASSWORD") {
            device.password = password;
        }
        if let Some(root_topic) = lookup("ROOT_TOPIC") {
            device.root_topic = root_topic;
        }
        if let Some(serial_number) = lookup("SERIAL_NUMBER") {
            device.serial_number = serial_number;
        }
        if let Some(client_id) = lookup("MQTT_CLIENT_ID") {
            device.client_id = Some(client_id);
        }
        Ok(())
    }

    /// Validated connection parameters for a new session
    pub fn connection_config(&self) -> Result<ConnectionConfig, SessionError> {
        let device = &self.device;
        let client_id = match &device.client_id {
            Some(client_id) => client_id.clone(),
            None => generate_client_id(),
        };

        let mut config = ConnectionConfig::new(
            device.host.clone(),
            device.serial_number.clone(),
            device.password.clone(),
        )
        .with_port(device.port)
        .with_root_topic(device.root_topic.clone())
        .with_client_id(client_id);
        config.keep_alive = Duration::from_secs(device.keep_alive_secs);
        config.connect_timeout = Duration::from_secs(device.connect_timeout_secs);

        config.validate()?;
        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.session.request_timeout_secs)
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        self.session
            .refresh_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

pub fn default_config_path() -> PathBuf {
    let mut path = get_home_dir();
    path.push(CONFIG_DIR);
    path.push(CONFIG_FILE);
    path
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}
