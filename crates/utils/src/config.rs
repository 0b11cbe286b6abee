use std::{fmt::Display, fs, path::Path};

use serde::Deserialize;

/// Name of the variable holding the primary destination address.
pub const FORWARD_EMAIL: &str = "FORWARD_EMAIL";

/// Name of the variable holding the fallback destination address.
pub const FALLBACK_EMAIL: &str = "FALLBACK_EMAIL";

/// Loosely-typed forwarding settings as found in the process environment.
///
/// Both values are optional here, call [`validate`](Self::validate) to
/// obtain a [`ForwardingConfig`] where they are guaranteed to be present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    pub forward_email: Option<String>,
    pub fallback_email: Option<String>,
}

impl Environment {
    pub fn new(forward_email: Option<&str>, fallback_email: Option<&str>) -> Self {
        Self {
            forward_email: forward_email.map(str::to_string),
            fallback_email: fallback_email.map(str::to_string),
        }
    }

    /// Reads `FORWARD_EMAIL` and `FALLBACK_EMAIL` from the process environment.
    pub fn from_env() -> Self {
        Self {
            forward_email: std::env::var(FORWARD_EMAIL).ok(),
            fallback_email: std::env::var(FALLBACK_EMAIL).ok(),
        }
    }

    /// Narrows the settings into a [`ForwardingConfig`].
    ///
    /// Absent, empty and whitespace-only values are all reported, the error
    /// names every missing key rather than only the first one.
    pub fn validate(&self) -> Result<ForwardingConfig, ConfigError> {
        let forward = present(&self.forward_email);
        let fallback = present(&self.fallback_email);
        match (forward, fallback) {
            (Some(primary_address), Some(fallback_address)) => Ok(ForwardingConfig {
                primary_address: primary_address.to_string(),
                fallback_address: fallback_address.to_string(),
            }),
            (forward, fallback) => {
                let mut missing = Vec::with_capacity(2);
                if forward.is_none() {
                    missing.push(FORWARD_EMAIL);
                }
                if fallback.is_none() {
                    missing.push(FALLBACK_EMAIL);
                }
                Err(ConfigError::MissingKeys(missing))
            }
        }
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Position of an address in the forwarding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Primary,
    Fallback,
}

impl Destination {
    /// Capitalized name, as used at the start of a log message.
    pub fn title(&self) -> &'static str {
        match self {
            Destination::Primary => "Primary",
            Destination::Fallback => "Fallback",
        }
    }
}

impl Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::Primary => write!(f, "primary"),
            Destination::Fallback => write!(f, "fallback"),
        }
    }
}

/// Validated forwarding destinations, both guaranteed non-empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingConfig {
    primary_address: String,
    fallback_address: String,
}

impl ForwardingConfig {
    pub fn new(primary_address: &str, fallback_address: &str) -> Result<Self, ConfigError> {
        Environment::new(Some(primary_address), Some(fallback_address)).validate()
    }

    pub fn primary_address(&self) -> &str {
        &self.primary_address
    }

    pub fn fallback_address(&self) -> &str {
        &self.fallback_address
    }

    /// Returns the destinations in the order they are tried.
    pub fn destinations(&self) -> [(Destination, &str); 2] {
        [
            (Destination::Primary, &self.primary_address),
            (Destination::Fallback, &self.fallback_address),
        ]
    }
}

/// Top-level configuration for the Mailrelay process.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,
}

/// Inbound SMTP listener configuration.
#[derive(Debug, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Name presented in the greeting and EHLO replies.
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Enables STARTTLS when present.
    pub tls: Option<TlsConfig>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            hostname: default_hostname(),
            tls: None,
        }
    }
}

/// TLS certificate configuration.
#[derive(Debug, Deserialize)]
pub struct TlsConfig {
    #[serde(default = "default_cert")]
    pub cert: String,

    #[serde(default = "default_key")]
    pub key: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert: default_cert(),
            key: default_key(),
        }
    }
}

/// Liveness HTTP endpoint configuration.
#[derive(Debug, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_http_port(),
        }
    }
}

/// Upstream SMTP server used to forward messages.
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_host")]
    pub host: String,

    #[serde(default = "default_upstream_port")]
    pub port: u16,

    #[serde(default)]
    pub tls: UpstreamTls,

    pub username: Option<String>,

    pub password: Option<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: default_upstream_host(),
            port: default_upstream_port(),
            tls: UpstreamTls::default(),
            username: None,
            password: None,
        }
    }
}

/// How the connection to the upstream server is secured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamTls {
    /// Plain-text connection.
    #[default]
    None,
    /// Plain connection upgraded with `STARTTLS`.
    Starttls,
    /// TLS from the first byte (SMTPS).
    Wrapper,
}

/// Loads configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
    toml::from_str(&content).map_err(ConfigError::Parse)
}

/// Loads configuration from a TOML file, using defaults when it does not exist.
pub fn load_config_or_default(path: &Path) -> Result<Config, ConfigError> {
    if path.exists() {
        load_config(path)
    } else {
        Ok(Config::default())
    }
}

/// Errors that can occur while loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Required forwarding keys are absent or empty.
    MissingKeys(Vec<&'static str>),
    /// An I/O error occurred reading the file.
    Io(std::io::Error),
    /// A parse error occurred deserializing TOML.
    Parse(toml::de::Error),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingKeys(_) => write!(f, "Email configuration is missing"),
            ConfigError::Io(e) => write!(f, "Config I/O error: {e}"),
            ConfigError::Parse(e) => write!(f, "Config parse error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    2525
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_http_port() -> u16 {
    8787
}

fn default_cert() -> String {
    "certs/server.cert.pem".to_string()
}

fn default_key() -> String {
    "certs/server.key.pem".to_string()
}

fn default_upstream_host() -> String {
    "localhost".to_string()
}

fn default_upstream_port() -> u16 {
    25
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn test_validate_complete_environment() {
        let env = Environment::new(Some("forward@example.com"), Some("fallback@example.com"));
        let config = env.validate().unwrap();
        assert_eq!(config.primary_address(), "forward@example.com");
        assert_eq!(config.fallback_address(), "fallback@example.com");
    }

    #[test]
    fn test_validate_empty_environment() {
        let error = Environment::default().validate().unwrap_err();
        assert_eq!(error.to_string(), "Email configuration is missing");
        match error {
            ConfigError::MissingKeys(keys) => assert_eq!(keys, vec![FORWARD_EMAIL, FALLBACK_EMAIL]),
            _ => panic!("Expected MissingKeys error"),
        }
    }

    #[test]
    fn test_validate_single_missing_key() {
        let env = Environment::new(Some("forward@example.com"), None);
        match env.validate() {
            Err(ConfigError::MissingKeys(keys)) => assert_eq!(keys, vec![FALLBACK_EMAIL]),
            other => panic!("Expected MissingKeys error, got {other:?}"),
        }

        let env = Environment::new(None, Some("fallback@example.com"));
        match env.validate() {
            Err(ConfigError::MissingKeys(keys)) => assert_eq!(keys, vec![FORWARD_EMAIL]),
            other => panic!("Expected MissingKeys error, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_empty_values() {
        let env = Environment::new(Some(""), Some("   "));
        match env.validate() {
            Err(ConfigError::MissingKeys(keys)) => assert_eq!(keys.len(), 2),
            other => panic!("Expected MissingKeys error, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_trims_values() {
        let config = ForwardingConfig::new(" forward@example.com ", "fallback@example.com\n").unwrap();
        assert_eq!(config.primary_address(), "forward@example.com");
        assert_eq!(config.fallback_address(), "fallback@example.com");
    }

    #[test]
    fn test_destinations_order() {
        let config = ForwardingConfig::new("forward@example.com", "fallback@example.com").unwrap();

        assert_eq!(
            config.destinations(),
            [
                (Destination::Primary, "forward@example.com"),
                (Destination::Fallback, "fallback@example.com"),
            ]
        );
        assert_eq!(Destination::Primary.to_string(), "primary");
        assert_eq!(Destination::Fallback.title(), "Fallback");
    }

    #[test]
    fn test_parse_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.relay.host, "127.0.0.1");
        assert_eq!(config.relay.port, 2525);
        assert_eq!(config.relay.hostname, "localhost");
        assert!(config.relay.tls.is_none());
        assert_eq!(config.http.port, 8787);
        assert_eq!(config.upstream.host, "localhost");
        assert_eq!(config.upstream.port, 25);
        assert_eq!(config.upstream.tls, UpstreamTls::None);
        assert!(config.upstream.username.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[relay]
host = "0.0.0.0"
port = 25
hostname = "mx.example.com"

[relay.tls]
cert = "my/cert.pem"

[http]
host = "0.0.0.0"
port = 8080

[upstream]
host = "smtp.example.com"
port = 587
tls = "starttls"
username = "relay"
password = "secret"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.relay.host, "0.0.0.0");
        assert_eq!(config.relay.port, 25);
        assert_eq!(config.relay.hostname, "mx.example.com");
        let tls = config.relay.tls.as_ref().unwrap();
        assert_eq!(tls.cert, "my/cert.pem");
        assert_eq!(tls.key, "certs/server.key.pem");
        assert_eq!(config.http.port, 8080);
        assert_eq!(config.upstream.host, "smtp.example.com");
        assert_eq!(config.upstream.port, 587);
        assert_eq!(config.upstream.tls, UpstreamTls::Starttls);
        assert_eq!(config.upstream.username.as_deref(), Some("relay"));
        assert_eq!(config.upstream.password.as_deref(), Some("secret"));
    }

    #[test]
    fn test_parse_invalid_tls_mode() {
        let result = toml::from_str::<Config>("[upstream]\ntls = \"sometimes\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[upstream]\ntls = \"wrapper\"\nport = 465").unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.upstream.tls, UpstreamTls::Wrapper);
        assert_eq!(config.upstream.port, 465);
    }

    #[test]
    fn test_load_config_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[relay\nport = ").unwrap();

        let error = load_config(file.path()).unwrap_err();
        assert!(matches!(error, ConfigError::Parse(_)));
        assert!(error.to_string().starts_with("Config parse error"));
    }

    #[test]
    fn test_load_config_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.relay.port, 2525);

        let error = load_config(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(error, ConfigError::Io(_)));
    }
}
