//! Server location.
//!
//! [`ServerLocator::locate`] turns a destination name into an ordered list of
//! [`Hop`]s, following SRV records for the preferred transports and then the
//! A/AAAA records of each target. Answers injected in the
//! [`DnsInjectionService`] are merged into the live ones.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::message::{Host, Scheme, Uri};
use crate::transport::TransportType;

pub mod injection;
pub mod lookup;

pub use injection::{DnsInjectionService, InjectAction, InjectedA, InjectedSrv};
pub use lookup::{DnsLookup, HickoryLookup, MeteredLookup};

use injection::add_trailing_period;

/// The transports to look for, in order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LookupType {
    #[serde(alias = "udp")]
    Udp,
    #[serde(alias = "tcp")]
    Tcp,
    #[serde(alias = "tls")]
    Tls,
    /// TLS first, TCP when no TLS service exists.
    #[serde(alias = "tls_and_tcp")]
    TlsAndTcp,
    /// TCP first, TLS when no TCP service exists.
    #[serde(alias = "tcp_and_tls")]
    TcpAndTls,
}

impl LookupType {
    pub fn transports(&self) -> &'static [TransportType] {
        match self {
            LookupType::Udp => &[TransportType::Udp],
            LookupType::Tcp => &[TransportType::Tcp],
            LookupType::Tls => &[TransportType::Tls],
            LookupType::TlsAndTcp => &[TransportType::Tls, TransportType::Tcp],
            LookupType::TcpAndTls => &[TransportType::Tcp, TransportType::Tls],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LookupType::Udp => "UDP",
            LookupType::Tcp => "TCP",
            LookupType::Tls => "TLS",
            LookupType::TlsAndTcp => "TLS_AND_TCP",
            LookupType::TcpAndTls => "TCP_AND_TLS",
        }
    }

    /// The transport used to reach an explicit `port` without SRV records.
    fn transport_for_port(&self, port: Option<u16>) -> TransportType {
        match self {
            LookupType::Udp => TransportType::Udp,
            LookupType::Tcp => TransportType::Tcp,
            LookupType::Tls => TransportType::Tls,
            LookupType::TlsAndTcp | LookupType::TcpAndTls => match port {
                None | Some(5060) => TransportType::Tcp,
                Some(_) => TransportType::Tls,
            },
        }
    }
}

impl From<TransportType> for LookupType {
    fn from(transport: TransportType) -> Self {
        match transport {
            TransportType::Udp => LookupType::Udp,
            TransportType::Tcp => LookupType::Tcp,
            TransportType::Tls => LookupType::Tls,
        }
    }
}

impl FromStr for LookupType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "UDP" => Ok(LookupType::Udp),
            "TCP" => Ok(LookupType::Tcp),
            "TLS" => Ok(LookupType::Tls),
            "TLS_AND_TCP" => Ok(LookupType::TlsAndTcp),
            "TCP_AND_TLS" => Ok(LookupType::TcpAndTls),
            other => Err(Error::Config(format!("unknown lookup type '{other}'"))),
        }
    }
}

impl fmt::Display for LookupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a hop comes from. Live answers sort before injected ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HopSource {
    Dns,
    Injected,
}

/// One candidate destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Hop {
    /// The name the address was resolved from, `None` for IP literals.
    pub hostname: Option<String>,
    pub host: IpAddr,
    pub port: u16,
    pub transport: TransportType,
    pub priority: u16,
    pub source: HopSource,
}

impl Hop {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transport, self.addr())?;
        if let Some(hostname) = &self.hostname {
            write!(f, " ({hostname})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrvRecord {
    pub name: String,
    #[serde(default)]
    pub ttl: u32,
    pub priority: u16,
    #[serde(default)]
    pub weight: u16,
    pub port: u16,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ARecord {
    pub name: String,
    #[serde(default)]
    pub ttl: u32,
    pub address: IpAddr,
}

/// How the hops of a [`LocateResponse`] were found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResponseKind {
    #[default]
    Unknown,
    /// The name is an IP literal.
    Ip,
    /// A/AAAA records of the name itself.
    Hostname,
    /// SRV records and the A/AAAA records of their targets.
    Srv,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocateResponse {
    pub hops: Vec<Hop>,
    pub srv_records: Vec<SrvRecord>,
    pub a_records: Vec<ARecord>,
    pub kind: ResponseKind,
    /// The last DNS failure met on the way, if any.
    pub error: Option<String>,
}

impl LocateResponse {
    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    fn record_error(&mut self, err: Error) {
        log::warn!("DNS query failed: {}", err);
        self.error = Some(err.to_string());
    }
}

/// Resolves destinations into hops.
pub struct ServerLocator {
    lookup: Arc<dyn DnsLookup>,
    injection: Arc<DnsInjectionService>,
}

impl ServerLocator {
    pub fn new(lookup: Arc<dyn DnsLookup>, injection: Arc<DnsInjectionService>) -> Self {
        Self { lookup, injection }
    }

    pub fn injection(&self) -> &Arc<DnsInjectionService> {
        &self.injection
    }

    /// Finds the hops for `name`.
    ///
    /// An empty hop list means there is no route. DNS failures do not make
    /// the call fail, they are recorded in [`LocateResponse::error`].
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn locate(
        &self,
        name: &str,
        lookup_type: LookupType,
        port: Option<u16>,
        user_id: Option<&str>,
    ) -> LocateResponse {
        let mut response = LocateResponse::default();
        let literal = name.trim_start_matches('[').trim_end_matches(']');

        if let Ok(ip) = literal.parse::<IpAddr>() {
            let transport = lookup_type.transport_for_port(port);
            response.kind = ResponseKind::Ip;
            response.hops.push(Hop {
                hostname: None,
                host: ip,
                port: port.unwrap_or_else(|| transport.default_port()),
                transport,
                priority: 0,
                source: HopSource::Dns,
            });
            return response;
        }

        if let Some(port) = port {
            let transport = lookup_type.transport_for_port(Some(port));
            self.locate_host(name, transport, port, user_id, &mut response).await;
        } else {
            for transport in lookup_type.transports() {
                self.locate_srv(name, *transport, user_id, &mut response).await;
                if !response.srv_records.is_empty() {
                    break;
                }
            }
            if response.srv_records.is_empty() {
                let transport = lookup_type.transports()[0];
                self.locate_host(name, transport, transport.default_port(), user_id, &mut response)
                    .await;
            }
        }

        response.hops.sort_by_key(|hop| (hop.priority, hop.source));
        log::debug!("Located {} hops for {} ({:?})", response.hops.len(), name, response.kind);

        response
    }

    async fn locate_host(
        &self,
        name: &str,
        transport: TransportType,
        port: u16,
        user_id: Option<&str>,
        response: &mut LocateResponse,
    ) {
        response.kind = ResponseKind::Hostname;
        let hostname = name.trim_end_matches('.');
        for (record, source) in self.query_a(name, user_id, response).await {
            response.hops.push(Hop {
                hostname: Some(hostname.to_string()),
                host: record.address,
                port,
                transport,
                priority: 0,
                source,
            });
            response.a_records.push(record);
        }
    }

    async fn locate_srv(
        &self,
        name: &str,
        transport: TransportType,
        user_id: Option<&str>,
        response: &mut LocateResponse,
    ) {
        let query = srv_name(name, transport);
        let injected = self.injection.srv_for(user_id, &query);
        let mut records: Vec<(SrvRecord, HopSource)> = injected
            .records
            .into_iter()
            .map(|record| (record, HopSource::Injected))
            .collect();
        if !injected.replace {
            match self.lookup.srv(&query).await {
                Ok(live) => records.extend(live.into_iter().map(|record| (record, HopSource::Dns))),
                Err(err) => response.record_error(err),
            }
        }
        if records.is_empty() {
            return;
        }

        response.kind = ResponseKind::Srv;
        for (srv, srv_source) in records {
            let hostname = srv.target.trim_end_matches('.').to_string();
            for (record, a_source) in self.query_a(&srv.target, user_id, response).await {
                response.hops.push(Hop {
                    hostname: Some(hostname.clone()),
                    host: record.address,
                    port: srv.port,
                    transport,
                    priority: srv.priority,
                    source: srv_source.max(a_source),
                });
                response.a_records.push(record);
            }
            response.srv_records.push(srv);
        }
    }

    async fn query_a(
        &self,
        name: &str,
        user_id: Option<&str>,
        response: &mut LocateResponse,
    ) -> Vec<(ARecord, HopSource)> {
        let query = add_trailing_period(name);
        let injected = self.injection.a_for(user_id, &query);
        let mut records: Vec<(ARecord, HopSource)> = injected
            .records
            .into_iter()
            .map(|record| (record, HopSource::Injected))
            .collect();
        if !injected.replace {
            match self.lookup.a(&query).await {
                Ok(live) => records.extend(live.into_iter().map(|record| (record, HopSource::Dns))),
                Err(err) => response.record_error(err),
            }
        }
        records
    }
}

fn srv_name(name: &str, transport: TransportType) -> String {
    let prefix = match transport {
        TransportType::Tls => "_sips._tcp",
        TransportType::Tcp => "_sip._tcp",
        TransportType::Udp => "_sip._udp",
    };
    add_trailing_period(&format!("{prefix}.{name}"))
}

/// Whether `host` needs to be resolved. Only an IP literal with both the
/// port and the transport known can be used as is.
pub fn should_search(host: &str, port: Option<u16>, transport: Option<TransportType>) -> bool {
    let literal = host.trim_start_matches('[').trim_end_matches(']');
    !(literal.parse::<IpAddr>().is_ok() && port.is_some() && transport.is_some())
}

/// [`should_search`] for a URI, `sips:` implies the transport.
pub fn should_search_uri(uri: &Uri) -> bool {
    let has_transport = uri.scheme == Scheme::Sips || uri.transport_param().is_some();
    !(matches!(uri.host(), Host::IpAddr(_)) && has_transport && uri.port().is_some())
}
