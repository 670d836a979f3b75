//! Proxy configuration.
//!
//! A [`DhruvaConfig`] is read from YAML. Every field has a default, an empty
//! document gives a proxy listening on UDP `0.0.0.0:5060`.
//!
//! ```yaml
//! listen_points:
//!   - name: internal
//!     host_ip_address: 10.0.0.1
//!     transport: TCP
//!     port: 5060
//! proxy:
//!   routes:
//!     - pattern: "sip:.*@example\\.com"
//!       destination: sbc.example.com
//!       transport: tls_and_tcp
//! ```

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::resolver::LookupType;
use crate::transport::revocation::RevocationPolicy;
use crate::transport::{ListenPoint, TransportType, DEFAULT_MAX_FRAME_SIZE};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhruvaConfig {
    pub listen_points: Vec<ListenPoint>,
    pub network: NetworkConfig,
    pub dns: DnsConfig,
    pub sessions: SessionConfig,
    pub proxy: ProxyConfig,
}

impl Default for DhruvaConfig {
    fn default() -> Self {
        Self {
            listen_points: vec![ListenPoint::default()],
            network: NetworkConfig::default(),
            dns: DnsConfig::default(),
            sessions: SessionConfig::default(),
            proxy: ProxyConfig::default(),
        }
    }
}

impl DhruvaConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: DhruvaConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("cannot read '{}': {}", path.display(), err)))?;
        Self::from_yaml_str(&yaml)
    }

    /// Rejects configurations the proxy cannot start with.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for lp in &self.listen_points {
            if !seen.insert((lp.host_ip_address, lp.port, lp.transport)) {
                return Err(Error::Config(format!(
                    "duplicate listen point {}:{} {}",
                    lp.host_ip_address, lp.port, lp.transport
                )));
            }
            if lp.transport == TransportType::Tls {
                let tls = &self.network.tls;
                if tls.certificate.is_none() || tls.private_key.is_none() {
                    return Err(Error::Config(format!(
                        "TLS listen point '{}' requires certificate and private_key",
                        lp.name
                    )));
                }
                let auth = lp.tls_auth.unwrap_or(tls.client_auth);
                if auth != ClientAuth::None && tls.trust_store.is_none() {
                    return Err(Error::Config(format!(
                        "TLS listen point '{}' authenticates clients without trust_store",
                        lp.name
                    )));
                }
            }
        }
        if self.network.max_frame_size == 0 {
            return Err(Error::Config("max_frame_size must not be zero".into()));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub max_frame_size: usize,
    pub connection_idle_timeout_secs: u64,
    pub connection_sweep_interval_secs: u64,
    /// Threads of the runtime, the number of cores when absent.
    pub worker_threads: Option<usize>,
    pub tls: TlsConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            connection_idle_timeout_secs: 14400,
            connection_sweep_interval_secs: 3600,
            worker_threads: None,
            tls: TlsConfig::default(),
        }
    }
}

/// Client certificate policy of TLS listen points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientAuth {
    None,
    Optional,
    Required,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM certificate chain.
    pub certificate: Option<PathBuf>,
    /// PEM private key.
    pub private_key: Option<PathBuf>,
    /// PEM certificates trusted to sign peer certificates.
    pub trust_store: Option<PathBuf>,
    pub client_auth: ClientAuth,
    pub handshake_timeout_ms: u64,
    /// `TLSv1.2` and `TLSv1.3`.
    pub protocols: Vec<String>,
    /// IANA names of the allowed suites, all when empty.
    pub cipher_suites: Vec<String>,
    pub revocation_soft_fail: bool,
}

impl TlsConfig {
    /// Whether any TLS material is given.
    pub fn is_configured(&self) -> bool {
        self.certificate.is_some() || self.trust_store.is_some()
    }

    pub fn revocation_policy(&self) -> RevocationPolicy {
        if self.revocation_soft_fail {
            RevocationPolicy::SoftFail
        } else {
            RevocationPolicy::HardFail
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            certificate: None,
            private_key: None,
            trust_store: None,
            client_auth: ClientAuth::Required,
            handshake_timeout_ms: 5000,
            protocols: vec!["TLSv1.2".to_string()],
            cipher_suites: Vec::new(),
            revocation_soft_fail: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub timeout_ms: u64,
    pub cache_size: usize,
    pub retention_secs: u64,
    /// Name servers used instead of the system ones.
    pub servers: Option<Vec<IpAddr>>,
}

impl DnsConfig {
    pub fn options(&self) -> util::DnsOptions {
        util::DnsOptions {
            timeout: Duration::from_millis(self.timeout_ms),
            cache_size: self.cache_size,
            retention: Duration::from_secs(self.retention_secs),
            servers: self.servers.clone().unwrap_or_default(),
        }
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            cache_size: 1000,
            retention_secs: 3600,
            servers: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub tracking_enabled: bool,
    /// Raised to 5 when lower.
    pub timeout_minutes: u64,
    /// How many finished sessions are kept for diagnostics.
    pub recent_capacity: usize,
}

impl SessionConfig {
    pub const MIN_TIMEOUT_MINUTES: u64 = 5;

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes.max(Self::MIN_TIMEOUT_MINUTES) * 60)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tracking_enabled: true,
            timeout_minutes: 720,
            recent_capacity: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub request_timeout_ms: u64,
    /// Concurrent sessions allowed per destination, unlimited when absent.
    pub max_sessions_per_endpoint: Option<usize>,
    pub routes: Vec<RouteConfig>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 32000,
            max_sessions_per_endpoint: None,
            routes: Vec::new(),
        }
    }
}

/// A static route: requests whose URI matches `pattern` go to `destination`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Regular expression matched against the Request-URI.
    pub pattern: String,
    /// `host` or `host:port`.
    pub destination: String,
    #[serde(default = "default_lookup")]
    pub transport: LookupType,
}

fn default_lookup() -> LookupType {
    LookupType::Udp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_gives_defaults() {
        let config = DhruvaConfig::from_yaml_str("{}").unwrap();

        assert_eq!(config, DhruvaConfig::default());
        assert_eq!(config.listen_points.len(), 1);
        assert_eq!(config.listen_points[0].addr().to_string(), "0.0.0.0:5060");
        assert_eq!(config.listen_points[0].transport, TransportType::Udp);
        assert_eq!(config.network.max_frame_size, 1048576);
        assert_eq!(config.network.tls.client_auth, ClientAuth::Required);
        assert_eq!(config.proxy.request_timeout_ms, 32000);
    }

    #[test]
    fn test_full_document() {
        let yaml = r#"
listen_points:
  - name: udp
    host_ip_address: 127.0.0.1
    transport: udp
    port: 5060
  - name: tcp
    host_ip_address: 127.0.0.1
    transport: TCP
    port: 5060
    record_route: false
sessions:
  timeout_minutes: 1
dns:
  servers: [8.8.8.8]
proxy:
  max_sessions_per_endpoint: 10
  routes:
    - pattern: "sip:.*@example\\.com"
      destination: "sbc.example.com:5070"
      transport: TCP_AND_TLS
"#;
        let config = DhruvaConfig::from_yaml_str(yaml).unwrap();

        assert_eq!(config.listen_points.len(), 2);
        assert!(!config.listen_points[1].record_route);
        assert_eq!(config.sessions.timeout(), Duration::from_secs(300));
        assert_eq!(config.dns.options().servers.len(), 1);
        assert_eq!(config.proxy.max_sessions_per_endpoint, Some(10));
        assert_eq!(config.proxy.routes[0].transport, LookupType::TcpAndTls);
    }

    #[test]
    fn test_validate_rejects() {
        let duplicate = "listen_points: [{port: 5060}, {port: 5060}]";
        assert_matches!(DhruvaConfig::from_yaml_str(duplicate), Err(Error::Config(_)));

        let tls_without_cert = "listen_points: [{transport: TLS, port: 5061}]";
        assert_matches!(DhruvaConfig::from_yaml_str(tls_without_cert), Err(Error::Config(_)));

        let zero_frame = "network: {max_frame_size: 0}";
        assert_matches!(DhruvaConfig::from_yaml_str(zero_frame), Err(Error::Config(_)));

        assert_matches!(DhruvaConfig::from_yaml_str("listen_points: 3"), Err(Error::Config(_)));
    }
}
