use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:443";
const DEFAULT_CLIENT_HELLO_TIMEOUT: u64 = 5;
const DEFAULT_UPSTREAM_TIMEOUT: u64 = 10;
const DEFAULT_METRICS_ADDR: &str = "127.0.0.1:9000";

/// Errors raised while loading or validating configuration.
///
/// Every variant is fatal at startup: the proxy never binds a listener with an
/// invalid configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),
    #[error("missing required setting `{0}`")]
    MissingField(&'static str),
    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// sniforward configuration loaded from YAML or the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Addresses to accept TLS clients on (e.g., "0.0.0.0:443", "[::]:443")
    #[serde(default = "default_listen_addrs")]
    pub listen_addrs: Vec<String>,
    /// Timeout configuration for the handshake peek
    #[serde(default)]
    pub timeouts: Timeouts,
    /// Upstream transport every routed connection is forwarded into
    pub upstream: UpstreamConfig,
    /// Prometheus metrics configuration
    #[serde(default)]
    pub metrics: Metrics,
    /// Optional list of allowed SNI hostnames (supports wildcards like "*.example.com")
    #[serde(default)]
    pub allowlist: Option<Vec<String>>,
    /// Maximum number of concurrent connections (unbounded if not specified)
    #[serde(default)]
    pub max_connections: Option<usize>,
    /// Graceful shutdown timeout in seconds (default: 30 if not specified)
    #[serde(default)]
    pub shutdown_timeout: Option<u64>,
}

fn default_listen_addrs() -> Vec<String> {
    vec![DEFAULT_LISTEN_ADDR.to_string()]
}

fn default_client_hello_timeout() -> u64 {
    DEFAULT_CLIENT_HELLO_TIMEOUT
}

fn default_upstream_timeout() -> u64 {
    DEFAULT_UPSTREAM_TIMEOUT
}

fn default_metrics_address() -> String {
    DEFAULT_METRICS_ADDR.to_string()
}

/// Timeout settings for the client side (all values in seconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    /// Maximum time to receive the TLS ClientHello (default: 5s)
    #[serde(default = "default_client_hello_timeout")]
    pub client_hello: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            client_hello: default_client_hello_timeout(),
        }
    }
}

/// Prometheus metrics server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    /// Whether to enable metrics collection
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind metrics HTTP server (e.g., "127.0.0.1:9000")
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

/// Upstream transport selection. Chosen once at startup; every connection
/// uses the same variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UpstreamConfig {
    HttpProxy(HttpProxyConfig),
    Ssh(SshConfig),
}

impl UpstreamConfig {
    /// Label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamConfig::HttpProxy(_) => "http-proxy",
            UpstreamConfig::Ssh(_) => "ssh",
        }
    }
}

/// HTTP proxy reached with `CONNECT` and Basic authentication.
#[derive(Clone, Serialize, Deserialize)]
pub struct HttpProxyConfig {
    /// Proxy address as `host:port`
    pub address: String,
    pub username: String,
    pub password: String,
    /// Dial and CONNECT response timeout in seconds (default: 10s)
    #[serde(default = "default_upstream_timeout")]
    pub timeout: u64,
}

impl fmt::Debug for HttpProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpProxyConfig")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// SSH server used as a jump host through `direct-tcpip` channels.
#[derive(Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// SSH server address as `host:port`
    pub address: String,
    pub username: String,
    /// Base64 encoding of an OpenSSH private key
    pub private_key: String,
    /// How the server's host key is checked
    #[serde(default)]
    pub host_key: HostKeyPolicy,
    /// Applied separately to the SSH handshake and to each channel open (default: 10s)
    #[serde(default = "default_upstream_timeout")]
    pub timeout: u64,
}

impl fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConfig")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("private_key", &"<redacted>")
            .field("host_key", &self.host_key)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// SSH host key verification policy.
///
/// `AcceptAny` trusts whatever key the server presents and is open to
/// man-in-the-middle attacks on the SSH hop. It is the default so existing
/// deployments keep working; the proxy logs a warning when it is in effect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    #[default]
    AcceptAny,
    /// Require the server key's SHA-256 fingerprint (`SHA256:...` as printed by `ssh-keygen -l`)
    Fingerprint { sha256: String },
}

impl Config {
    /// Loads and validates configuration from a YAML file.
    ///
    /// ```no_run
    /// use sniforward_config::Config;
    /// use std::path::Path;
    ///
    /// let config = Config::from_file(Path::new("config.yaml")).unwrap();
    /// ```
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parses and validates configuration from a YAML string.
    ///
    /// ```
    /// use sniforward_config::Config;
    ///
    /// let yaml = r#"
    /// listen_addrs:
    ///   - "0.0.0.0:443"
    /// upstream:
    ///   type: http-proxy
    ///   address: "proxy.internal:3128"
    ///   username: "user"
    ///   password: "secret"
    /// "#;
    ///
    /// let config = Config::parse(yaml).unwrap();
    /// assert_eq!(config.listen_addrs[0], "0.0.0.0:443");
    /// assert_eq!(config.timeouts.client_hello, 5);
    /// ```
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml_ng::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Builds configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds configuration from a key lookup, using the same variable names
    /// as [`Config::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let optional = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let required = |key: &'static str| optional(key).ok_or(ConfigError::MissingField(key));
        let number = |key: &'static str| -> Result<Option<u64>, ConfigError> {
            optional(key)
                .map(|value| {
                    value
                        .trim()
                        .parse::<u64>()
                        .map_err(|_| ConfigError::InvalidValue {
                            field: key,
                            reason: format!("expected a whole number, got {value:?}"),
                        })
                })
                .transpose()
        };

        let upstream_type = optional("UPSTREAM_TYPE").unwrap_or_else(|| "http-proxy".to_string());
        let upstream = match upstream_type.trim() {
            "http-proxy" => UpstreamConfig::HttpProxy(HttpProxyConfig {
                address: required("HTTP_PROXY_ADDRESS")?,
                username: required("HTTP_PROXY_USERNAME")?,
                password: required("HTTP_PROXY_PASSWORD")?,
                timeout: number("HTTP_PROXY_TIMEOUT")?.unwrap_or(DEFAULT_UPSTREAM_TIMEOUT),
            }),
            "ssh" => UpstreamConfig::Ssh(SshConfig {
                address: required("SSH_ADDRESS")?,
                username: required("SSH_USER")?,
                private_key: required("SSH_PRIVATE_KEY")?,
                host_key: match optional("SSH_HOST_KEY_FINGERPRINT") {
                    Some(sha256) => HostKeyPolicy::Fingerprint { sha256 },
                    None => HostKeyPolicy::AcceptAny,
                },
                timeout: number("SSH_TIMEOUT")?.unwrap_or(DEFAULT_UPSTREAM_TIMEOUT),
            }),
            other => {
                return Err(ConfigError::InvalidValue {
                    field: "UPSTREAM_TYPE",
                    reason: format!("unknown upstream type {other:?}, expected http-proxy or ssh"),
                });
            }
        };

        let metrics = match optional("METRICS_ADDRESS") {
            Some(address) => Metrics {
                enabled: true,
                address,
            },
            None => Metrics::default(),
        };

        let max_connections = number("MAX_CONNECTIONS")?
            .map(|n| {
                usize::try_from(n).map_err(|_| ConfigError::InvalidValue {
                    field: "MAX_CONNECTIONS",
                    reason: format!("{n} does not fit in usize"),
                })
            })
            .transpose()?;

        let config = Config {
            listen_addrs: vec![optional("LISTEN_ADDRESS").unwrap_or_else(|| ":443".to_string())],
            timeouts: Timeouts {
                client_hello: number("CLIENT_HELLO_TIMEOUT")?
                    .unwrap_or(DEFAULT_CLIENT_HELLO_TIMEOUT),
            },
            upstream,
            metrics,
            allowlist: None,
            max_connections,
            shutdown_timeout: number("SHUTDOWN_TIMEOUT")?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Resolves `listen_addrs` to socket addresses. A bare `:port` binds all
    /// IPv4 interfaces.
    pub fn listen_socket_addrs(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        self.listen_addrs
            .iter()
            .map(|addr| {
                let normalized = if addr.starts_with(':') {
                    format!("0.0.0.0{addr}")
                } else {
                    addr.clone()
                };
                normalized
                    .parse::<SocketAddr>()
                    .map_err(|e| ConfigError::InvalidValue {
                        field: "listen_addrs",
                        reason: format!("{addr:?}: {e}"),
                    })
            })
            .collect()
    }

    /// Checks every value the proxy relies on at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_addrs.is_empty() {
            return Err(ConfigError::MissingField("listen_addrs"));
        }
        self.listen_socket_addrs()?;

        if self.timeouts.client_hello == 0 {
            return Err(ConfigError::InvalidValue {
                field: "timeouts.client_hello",
                reason: "must be at least 1 second".to_string(),
            });
        }

        match &self.upstream {
            UpstreamConfig::HttpProxy(http) => {
                non_empty("upstream.address", &http.address)?;
                non_empty("upstream.username", &http.username)?;
                non_empty("upstream.password", &http.password)?;
                positive("upstream.timeout", http.timeout)?;
            }
            UpstreamConfig::Ssh(ssh) => {
                non_empty("upstream.address", &ssh.address)?;
                non_empty("upstream.username", &ssh.username)?;
                non_empty("upstream.private_key", &ssh.private_key)?;
                positive("upstream.timeout", ssh.timeout)?;
                if let HostKeyPolicy::Fingerprint { sha256 } = &ssh.host_key {
                    non_empty("upstream.host_key.sha256", sha256)?;
                }
            }
        }

        if self.metrics.enabled {
            self.metrics
                .address
                .parse::<SocketAddr>()
                .map_err(|e| ConfigError::InvalidValue {
                    field: "metrics.address",
                    reason: format!("{:?}: {e}", self.metrics.address),
                })?;
        }

        if self.max_connections == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "max_connections",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(())
    }
}

fn non_empty(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        Err(ConfigError::MissingField(field))
    } else {
        Ok(())
    }
}

fn positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::InvalidValue {
            field,
            reason: "must be at least 1 second".to_string(),
        })
    } else {
        Ok(())
    }
}

/// Checks if a hostname matches an allowlist pattern.
///
/// Supports wildcard patterns for flexible domain matching:
/// - Exact match: `"example.com"` matches only `"example.com"`
/// - Subdomain wildcard: `"*.example.com"` matches `"api.example.com"`, `"www.example.com"`, and `"example.com"`
/// - Suffix wildcard: `"*api.com"` matches `"api.com"`, `"testapi.com"`, etc.
///
/// ```
/// use sniforward_config::matches_allowlist_pattern;
///
/// assert!(matches_allowlist_pattern("example.com", "example.com"));
/// assert!(matches_allowlist_pattern("api.example.com", "*.example.com"));
/// assert!(matches_allowlist_pattern("example.com", "*.example.com"));
/// assert!(matches_allowlist_pattern("myapi.com", "*api.com"));
/// ```
pub fn matches_allowlist_pattern(hostname: &str, pattern: &str) -> bool {
    if pattern == hostname {
        return true;
    }

    if let Some(domain) = pattern.strip_prefix("*.") {
        hostname
            .strip_suffix(domain)
            .is_some_and(|rest| rest.is_empty() || rest.ends_with('.'))
    } else if let Some(suffix) = pattern.strip_prefix('*') {
        hostname.ends_with(suffix)
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const HTTP_PROXY_YAML: &str = r#"
listen_addrs:
  - "0.0.0.0:8443"
  - "[::]:8443"
timeouts:
  client_hello: 3
upstream:
  type: http-proxy
  address: "proxy.internal:3128"
  username: "alice"
  password: "hunter2"
  timeout: 7
metrics:
  enabled: true
  address: "127.0.0.1:9000"
allowlist:
  - "example.com"
  - "*.example.com"
"#;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_valid_config_parsing() {
        let config = Config::parse(HTTP_PROXY_YAML).unwrap();
        assert_eq!(config.listen_addrs.len(), 2);
        assert_eq!(config.listen_addrs[0], "0.0.0.0:8443");
        assert_eq!(config.timeouts.client_hello, 3);
        assert!(config.metrics.enabled);
        assert_eq!(config.upstream.kind(), "http-proxy");
        match &config.upstream {
            UpstreamConfig::HttpProxy(http) => {
                assert_eq!(http.address, "proxy.internal:3128");
                assert_eq!(http.username, "alice");
                assert_eq!(http.password, "hunter2");
                assert_eq!(http.timeout, 7);
            }
            other => panic!("expected http-proxy upstream, got {other:?}"),
        }
        assert_eq!(config.allowlist.unwrap().len(), 2);
    }

    #[test]
    fn test_defaults_applied() {
        let yaml = r#"
upstream:
  type: ssh
  address: "bastion.internal:22"
  username: "tunnel"
  private_key: "AAAA"
"#;
        let config = Config::parse(yaml).unwrap();
        assert_eq!(config.listen_addrs, vec!["0.0.0.0:443".to_string()]);
        assert_eq!(config.timeouts.client_hello, 5);
        assert!(!config.metrics.enabled);
        assert!(config.allowlist.is_none());
        assert!(config.max_connections.is_none());
        match config.upstream {
            UpstreamConfig::Ssh(ssh) => {
                assert_eq!(ssh.timeout, 10);
                assert_eq!(ssh.host_key, HostKeyPolicy::AcceptAny);
            }
            other => panic!("expected ssh upstream, got {other:?}"),
        }
    }

    #[test]
    fn test_fingerprint_policy() {
        let yaml = r#"
upstream:
  type: ssh
  address: "bastion.internal:22"
  username: "tunnel"
  private_key: "AAAA"
  host_key:
    policy: fingerprint
    sha256: "SHA256:abc"
"#;
        let config = Config::parse(yaml).unwrap();
        match config.upstream {
            UpstreamConfig::Ssh(ssh) => assert_eq!(
                ssh.host_key,
                HostKeyPolicy::Fingerprint {
                    sha256: "SHA256:abc".to_string()
                }
            ),
            other => panic!("expected ssh upstream, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_upstream() {
        let yaml = r#"
listen_addrs:
  - "0.0.0.0:443"
"#;
        assert!(matches!(Config::parse(yaml), Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn test_unknown_upstream_type() {
        let yaml = r#"
upstream:
  type: vless
  address: "x:1"
"#;
        assert!(Config::parse(yaml).is_err());
    }

    #[test]
    fn test_empty_credentials_rejected() {
        let yaml = r#"
upstream:
  type: http-proxy
  address: "proxy.internal:3128"
  username: "alice"
  password: ""
"#;
        match Config::parse(yaml) {
            Err(ConfigError::MissingField(field)) => assert_eq!(field, "upstream.password"),
            other => panic!("expected missing password, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let yaml = r#"
timeouts:
  client_hello: 0
upstream:
  type: http-proxy
  address: "proxy.internal:3128"
  username: "alice"
  password: "pw"
"#;
        assert!(matches!(
            Config::parse(yaml),
            Err(ConfigError::InvalidValue {
                field: "timeouts.client_hello",
                ..
            })
        ));
    }

    #[test]
    fn test_invalid_listen_address() {
        let yaml = r#"
listen_addrs:
  - "not-an-address"
upstream:
  type: http-proxy
  address: "proxy.internal:3128"
  username: "alice"
  password: "pw"
"#;
        assert!(matches!(
            Config::parse(yaml),
            Err(ConfigError::InvalidValue {
                field: "listen_addrs",
                ..
            })
        ));
    }

    #[test]
    fn test_invalid_yaml() {
        let yaml = "invalid: yaml: content: ::::";
        assert!(Config::parse(yaml).is_err());
    }

    #[test]
    fn test_empty_config() {
        assert!(Config::parse("").is_err());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = Config::parse(HTTP_PROXY_YAML).unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_env_http_proxy() {
        let config = Config::from_lookup(lookup_from(&[
            ("HTTP_PROXY_ADDRESS", "proxy.internal:3128"),
            ("HTTP_PROXY_USERNAME", "alice"),
            ("HTTP_PROXY_PASSWORD", "pw"),
        ]))
        .unwrap();
        assert_eq!(config.listen_addrs, vec![":443".to_string()]);
        assert_eq!(
            config.listen_socket_addrs().unwrap()[0],
            "0.0.0.0:443".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(config.timeouts.client_hello, 5);
        assert_eq!(config.upstream.kind(), "http-proxy");
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn test_env_ssh_with_fingerprint() {
        let config = Config::from_lookup(lookup_from(&[
            ("LISTEN_ADDRESS", "127.0.0.1:8443"),
            ("CLIENT_HELLO_TIMEOUT", "2"),
            ("UPSTREAM_TYPE", "ssh"),
            ("SSH_ADDRESS", "bastion:22"),
            ("SSH_USER", "tunnel"),
            ("SSH_PRIVATE_KEY", "AAAA"),
            ("SSH_HOST_KEY_FINGERPRINT", "SHA256:abc"),
            ("METRICS_ADDRESS", "127.0.0.1:9100"),
            ("MAX_CONNECTIONS", "64"),
        ]))
        .unwrap();
        assert_eq!(config.timeouts.client_hello, 2);
        assert!(config.metrics.enabled);
        assert_eq!(config.max_connections, Some(64));
        match config.upstream {
            UpstreamConfig::Ssh(ssh) => {
                assert_eq!(ssh.username, "tunnel");
                assert!(matches!(ssh.host_key, HostKeyPolicy::Fingerprint { .. }));
            }
            other => panic!("expected ssh upstream, got {other:?}"),
        }
    }

    #[test]
    fn test_env_missing_required() {
        let result = Config::from_lookup(lookup_from(&[
            ("HTTP_PROXY_ADDRESS", "proxy.internal:3128"),
            ("HTTP_PROXY_USERNAME", "alice"),
        ]));
        match result {
            Err(ConfigError::MissingField(field)) => assert_eq!(field, "HTTP_PROXY_PASSWORD"),
            other => panic!("expected missing password, got {other:?}"),
        }
    }

    #[test]
    fn test_env_bad_number() {
        let result = Config::from_lookup(lookup_from(&[
            ("CLIENT_HELLO_TIMEOUT", "five"),
            ("HTTP_PROXY_ADDRESS", "proxy.internal:3128"),
            ("HTTP_PROXY_USERNAME", "alice"),
            ("HTTP_PROXY_PASSWORD", "pw"),
        ]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue {
                field: "CLIENT_HELLO_TIMEOUT",
                ..
            })
        ));
    }

    #[test]
    fn test_allowlist_exact_match() {
        assert!(matches_allowlist_pattern("example.com", "example.com"));
        assert!(!matches_allowlist_pattern("other.com", "example.com"));
    }

    #[test]
    fn test_allowlist_wildcard_subdomain() {
        assert!(matches_allowlist_pattern("sub.example.com", "*.example.com"));
        assert!(matches_allowlist_pattern(
            "deep.sub.example.com",
            "*.example.com"
        ));
        assert!(matches_allowlist_pattern("example.com", "*.example.com"));
        assert!(!matches_allowlist_pattern(
            "example.com.evil.com",
            "*.example.com"
        ));
        assert!(!matches_allowlist_pattern("notexample.com", "*.example.com"));
    }

    #[test]
    fn test_allowlist_wildcard_suffix() {
        assert!(matches_allowlist_pattern("test.com", "*test.com"));
        assert!(matches_allowlist_pattern("mytest.com", "*test.com"));
        assert!(!matches_allowlist_pattern("test.org", "*test.com"));
    }
}
