use crate::error::SessionError;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_ROOT_TOPIC: &str = "438M";
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

const CLIENT_ID_PREFIX: &str = "blowcontrol";

/// Validated broker connection parameters for one appliance
///
/// The appliance's serial number doubles as the MQTT username. The client id
/// must be unique per running process, otherwise the broker drops the older
/// session holding the same id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub serial_number: String,
    pub password: String,
    pub root_topic: String,
    pub client_id: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
}

impl ConnectionConfig {
    /// Builds a config with defaults for everything but the credentials and a fresh client id
    pub fn new(
        host: impl Into<String>,
        serial_number: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            serial_number: serial_number.into(),
            password: password.into(),
            root_topic: DEFAULT_ROOT_TOPIC.to_string(),
            client_id: generate_client_id(),
            keep_alive: Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_root_topic(mut self, root_topic: impl Into<String>) -> Self {
        self.root_topic = root_topic.into();
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Checks every required field, reporting all problems at once
    pub fn validate(&self) -> Result<(), SessionError> {
        let mut problems = Vec::new();

        if self.host.trim().is_empty() {
            problems.push("device host is required".to_string());
        }
        if self.port == 0 {
            problems.push("port must be non-zero".to_string());
        }
        if self.serial_number.trim().is_empty() {
            problems.push("serial number is required".to_string());
        } else if !is_topic_segment(&self.serial_number) {
            problems.push(format!(
                "serial number '{}' must not contain '/', '#' or '+'",
                self.serial_number
            ));
        }
        if self.password.is_empty() {
            problems.push("password is required".to_string());
        }
        if self.root_topic.trim().is_empty() {
            problems.push("root topic is required".to_string());
        } else if !is_topic_segment(&self.root_topic) {
            problems.push(format!(
                "root topic '{}' must not contain '/', '#' or '+'",
                self.root_topic
            ));
        }
        if self.client_id.trim().is_empty() {
            problems.push("client id must not be empty".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(SessionError::Config(problems.join("; ")))
        }
    }

    pub fn topics(&self) -> TopicSet {
        TopicSet::new(&self.root_topic, &self.serial_number)
    }
}

/// Command and status topics derived from root topic and serial number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSet {
    pub command: String,
    pub status: String,
}

impl TopicSet {
    pub fn new(root_topic: &str, serial_number: &str) -> Self {
        let base = format!("{}/{}", root_topic, serial_number);
        Self {
            command: format!("{}/command", base),
            status: format!("{}/status/#", base),
        }
    }
}

/// Generates `blowcontrol-xxxxxxxx` with eight random lowercase alphanumerics
pub fn generate_client_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("{}-{}", CLIENT_ID_PREFIX, suffix)
}

fn is_topic_segment(value: &str) -> bool {
    !value.contains(['/', '#', '+'])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ConnectionConfig {
        ConnectionConfig::new("192.168.1.100", "9RJ-EU-ABC1234A", "secret")
    }

    #[test]
    fn test_topics_are_derived_from_root_and_serial() {
        let topics = valid().topics();
        assert_eq!(topics.command, "438M/9RJ-EU-ABC1234A/command");
        assert_eq!(topics.status, "438M/9RJ-EU-ABC1234A/status/#");
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_missing_fields_are_all_reported() {
        let config = ConnectionConfig::new("", "", "");
        match config.validate() {
            Err(SessionError::Config(msg)) => {
                assert!(msg.contains("host"));
                assert!(msg.contains("serial number"));
                assert!(msg.contains("password"));
            }
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_wildcards_in_root_topic_are_rejected() {
        let config = valid().with_root_topic("438M/#");
        assert!(matches!(config.validate(), Err(SessionError::Config(_))));
    }

    #[test]
    fn test_zero_port_is_rejected() {
        assert!(valid().with_port(0).validate().is_err());
    }

    #[test]
    fn test_generated_client_ids_are_unique() {
        let a = generate_client_id();
        let b = generate_client_id();
        assert!(a.starts_with("blowcontrol-"));
        assert_eq!(a.len(), "blowcontrol-".len() + 8);
        assert!(a
            .chars()
            .skip("blowcontrol-".len())
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_ne!(a, b);
    }
}
