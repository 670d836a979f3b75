//! Transport layer.
//!
//! This module owns the sockets the proxy listens on and the connections it
//! opens, and moves SIP messages between them and the upper layers.
//!
//! All transports implement the [`SipTransport`] trait. The [`Transport`]
//! struct is a cheap clonable handle to any of them.
//!
//! # Available Transports
//!
//! - [`udp`]: SIP over UDP, one datagram per message.
//! - [`tcp`]: SIP over TCP, framed by `Content-Length`.
//! - [`tls`]: SIP over TLS, framed as TCP after the handshake.
//!
//! Received messages, new connections and closed connections are reported as
//! [`TransportEvent`]s on a channel.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::Deref;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::try_join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{ClientAuth, NetworkConfig};
use crate::error::{Error, Result};
use crate::metrics::{Metric, MetricName, MetricsSink};
use crate::resolver::Hop;

pub mod cache;
mod decoder;
pub mod revocation;
pub mod tcp;
pub mod tls;
pub mod udp;

pub use cache::{ConnectionCache, ConnectionKey};
pub use decoder::{FrameDecoder, DEFAULT_MAX_FRAME_SIZE};

use revocation::RevocationChecker;
use tcp::TcpServer;
use tls::TlsContext;
use udp::UdpTransport;

/// Sender half of the transport event channel.
pub type TransportTx = mpsc::Sender<TransportEvent>;
/// Receiver half of the transport event channel.
pub type TransportRx = mpsc::Receiver<TransportEvent>;

/// The transport protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransportType {
    #[serde(alias = "udp", alias = "Udp")]
    Udp,
    #[serde(alias = "tcp", alias = "Tcp")]
    Tcp,
    #[serde(alias = "tls", alias = "Tls")]
    Tls,
}

impl TransportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportType::Udp => "UDP",
            TransportType::Tcp => "TCP",
            TransportType::Tls => "TLS",
        }
    }

    pub fn is_reliable(&self) -> bool {
        !matches!(self, TransportType::Udp)
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, TransportType::Tls)
    }

    /// Port used when none is given.
    pub fn default_port(&self) -> u16 {
        match self {
            TransportType::Tls => 5061,
            TransportType::Udp | TransportType::Tcp => 5060,
        }
    }
}

impl FromStr for TransportType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("udp") {
            Ok(TransportType::Udp)
        } else if s.eq_ignore_ascii_case("tcp") {
            Ok(TransportType::Tcp)
        } else if s.eq_ignore_ascii_case("tls") {
            Ok(TransportType::Tls)
        } else {
            Err(Error::Transport(format!("unknown transport '{s}'")))
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A SIP transport: a UDP socket or a stream connection.
#[async_trait]
pub trait SipTransport: Send + Sync + 'static {
    /// Sends `buf` to `addr`. Stream transports ignore `addr`.
    async fn send(&self, buf: &[u8], addr: &SocketAddr) -> Result<usize>;

    fn transport_type(&self) -> TransportType;

    fn local_addr(&self) -> SocketAddr;

    /// The peer of a connection, `None` for datagram transports.
    fn remote_addr(&self) -> Option<SocketAddr>;

    fn is_reliable(&self) -> bool {
        self.transport_type().is_reliable()
    }

    fn is_secure(&self) -> bool {
        self.transport_type().is_secure()
    }

    fn key(&self) -> ConnectionKey {
        let remote = self
            .remote_addr()
            .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
        ConnectionKey::new(self.transport_type(), self.local_addr(), remote)
    }

    /// Time since the last read or write.
    fn idle_for(&self) -> Duration {
        Duration::ZERO
    }

    fn is_closed(&self) -> bool {
        false
    }

    /// Closes the transport. Pending reads stop.
    async fn close(&self) {}
}

/// A handle to a shared transport.
#[derive(Clone)]
pub struct Transport(Arc<dyn SipTransport>);

impl Transport {
    pub fn new(transport: impl SipTransport) -> Self {
        Transport(Arc::new(transport))
    }
}

impl Deref for Transport {
    type Target = dyn SipTransport;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Transport").field(&self.key().to_string()).finish()
    }
}

/// Raw bytes received from the network.
#[derive(Debug, Clone)]
pub struct Packet {
    pub data: Bytes,
    /// Where the bytes came from.
    pub source: SocketAddr,
    pub time: SystemTime,
}

/// A packet and the transport it arrived on.
#[derive(Debug, Clone)]
pub struct IncomingPacket {
    pub transport: Transport,
    pub packet: Packet,
}

#[derive(Debug)]
pub enum TransportEvent {
    /// A listener or a connection is up.
    Created(Transport),
    /// A whole message arrived.
    Received(IncomingPacket),
    /// A connection went down.
    Closed(ConnectionKey),
}

/// A socket the proxy listens on, as configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenPoint {
    pub name: String,
    pub host_ip_address: IpAddr,
    pub transport: TransportType,
    pub port: u16,
    /// Insert a `Record-Route` for requests received on this point.
    pub record_route: bool,
    /// Client certificate policy of a TLS point, overrides the network one.
    pub tls_auth: Option<ClientAuth>,
}

impl ListenPoint {
    pub fn new(name: impl Into<String>, addr: SocketAddr, transport: TransportType) -> Self {
        Self {
            name: name.into(),
            host_ip_address: addr.ip(),
            transport,
            port: addr.port(),
            record_route: true,
            tls_auth: None,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host_ip_address, self.port)
    }
}

impl Default for ListenPoint {
    fn default() -> Self {
        Self::new(
            "default",
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 5060),
            TransportType::Udp,
        )
    }
}

/// A listen point once bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPoint {
    pub name: String,
    /// Address advertised in `Via` and `Record-Route`.
    pub host: IpAddr,
    pub port: u16,
    pub transport: TransportType,
    pub record_route: bool,
}

/// Outbound side of the transport layer, as seen by the proxy controller.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Sends `data` to `hop`, connecting first when needed.
    async fn send_to_hop(&self, data: Bytes, hop: &Hop) -> Result<()>;

    /// Sends `data` on an existing transport, as a response goes back on
    /// the transport its request came in on.
    async fn send_on(&self, data: Bytes, transport: &Transport, addr: SocketAddr) -> Result<()>;

    /// The local point used to reach peers over `transport`.
    fn local_point(&self, transport: TransportType) -> Option<LocalPoint>;
}

/// Owner of every listener and connection.
pub struct TransportLayer {
    listen_points: Vec<ListenPoint>,
    max_frame_size: usize,
    cache: Arc<ConnectionCache>,
    tls: Option<TlsContext>,
    local_points: ArcSwap<Vec<LocalPoint>>,
    udp: ArcSwap<Vec<UdpTransport>>,
    events: TransportTx,
    metrics: Arc<dyn MetricsSink>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct Listening {
    local: LocalPoint,
    udp: Option<UdpTransport>,
    task: Option<JoinHandle<()>>,
}

impl Drop for Listening {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl TransportLayer {
    pub fn new(
        listen_points: Vec<ListenPoint>,
        network: &NetworkConfig,
        revocation: Arc<RevocationChecker>,
        events: TransportTx,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        let tls = if network.tls.is_configured() {
            Some(TlsContext::new(&network.tls, revocation)?)
        } else {
            None
        };
        let cache = ConnectionCache::new(Duration::from_secs(network.connection_idle_timeout_secs));

        Ok(Self {
            listen_points,
            max_frame_size: network.max_frame_size,
            cache: Arc::new(cache),
            tls,
            local_points: ArcSwap::from_pointee(Vec::new()),
            udp: ArcSwap::from_pointee(Vec::new()),
            events,
            metrics,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn cache(&self) -> &Arc<ConnectionCache> {
        &self.cache
    }

    /// Binds every listen point concurrently.
    ///
    /// Fails as soon as one of them fails, the ones already bound are
    /// stopped.
    pub async fn start_listening(&self) -> Result<()> {
        let bound = try_join_all(self.listen_points.iter().map(|lp| self.listen(lp))).await?;

        let mut local_points = Vec::with_capacity(bound.len());
        let mut udp = Vec::new();
        let mut tasks = self.tasks.lock().map_err(|_| Error::PoisonedLock)?;
        for mut listening in bound {
            log::info!(
                "SIP {} transport '{}' listening on {}:{}",
                listening.local.transport,
                listening.local.name,
                listening.local.host,
                listening.local.port
            );
            local_points.push(listening.local.clone());
            udp.extend(listening.udp.take());
            tasks.extend(listening.task.take());
        }
        self.local_points.store(Arc::new(local_points));
        self.udp.store(Arc::new(udp));

        Ok(())
    }

    async fn listen(&self, lp: &ListenPoint) -> Result<Listening> {
        let (addr, udp, task) = match lp.transport {
            TransportType::Udp => {
                let udp = UdpTransport::bind(lp.addr()).await?;
                let task = udp.spawn_receiver(self.events.clone());
                self.events.send(TransportEvent::Created(Transport::new(udp.clone()))).await?;
                (udp.local_addr(), Some(udp), task)
            }
            TransportType::Tcp => {
                let server = TcpServer::bind(lp.addr()).await?;
                let addr = server.local_addr();
                let task = tokio::spawn(server.serve(None, self.max_frame_size, self.events.clone()));
                (addr, None, task)
            }
            TransportType::Tls => {
                let tls = self.tls.as_ref().ok_or_else(|| {
                    Error::Config(format!("TLS listen point '{}' without TLS configuration", lp.name))
                })?;
                let handshake = tls.server(lp.tls_auth)?;
                let server = TcpServer::bind(lp.addr()).await?;
                let addr = server.local_addr();
                let task = tokio::spawn(server.serve(Some(handshake), self.max_frame_size, self.events.clone()));
                (addr, None, task)
            }
        };

        Ok(Listening {
            local: LocalPoint {
                name: lp.name.clone(),
                host: advertised_ip(addr.ip()),
                port: addr.port(),
                transport: lp.transport,
                record_route: lp.record_route,
            },
            udp,
            task: Some(task),
        })
    }

    /// The bound listen points.
    pub fn local_points(&self) -> Arc<Vec<LocalPoint>> {
        self.local_points.load_full()
    }

    /// Returns a cached connection to `addr`, or opens one.
    pub async fn connect(
        &self,
        transport: TransportType,
        addr: SocketAddr,
        server_name: Option<&str>,
    ) -> Result<Transport> {
        let key = ConnectionKey::for_remote(transport, addr);
        let connect = async {
            match transport {
                TransportType::Tcp => tcp::connect(addr, self.max_frame_size, self.events.clone()).await,
                TransportType::Tls => {
                    let tls = self
                        .tls
                        .as_ref()
                        .ok_or_else(|| Error::Transport("TLS is not configured".into()))?;
                    tls.connect(addr, server_name, self.max_frame_size, self.events.clone())
                        .await
                }
                TransportType::Udp => Err(Error::Transport("UDP is connectionless".into())),
            }
        };
        let transport = self.cache.get_or_connect(&key, connect).await?;

        Ok(transport)
    }

    fn udp_for(&self, addr: &SocketAddr) -> Result<UdpTransport> {
        self.udp
            .load()
            .iter()
            .find(|udp| udp.local_addr().is_ipv4() == addr.is_ipv4())
            .cloned()
            .ok_or_else(|| Error::Transport(format!("no UDP listen point to reach {addr}")))
    }

    fn message_sent(&self, transport: TransportType, len: usize) {
        self.metrics.emit(
            Metric::new(MetricName::SipMessage)
                .tag("transport", transport)
                .tag("direction", "out")
                .field("bytes", len),
        );
    }

    /// Stops the listeners and closes every connection.
    pub async fn shutdown(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        self.cache.clear().await;
    }
}

#[async_trait]
impl MessageSender for TransportLayer {
    async fn send_to_hop(&self, data: Bytes, hop: &Hop) -> Result<()> {
        let addr = hop.addr();
        match hop.transport {
            TransportType::Udp => {
                let udp = self.udp_for(&addr)?;
                udp.send(&data, &addr)
                    .await
                    .map_err(|err| Error::Transport(format!("send to {addr} failed: {err}")))?;
            }
            TransportType::Tcp | TransportType::Tls => {
                let transport = self
                    .connect(hop.transport, addr, hop.hostname.as_deref())
                    .await
                    .map_err(|err| Error::Transport(format!("connect to {addr} failed: {err}")))?;
                if let Err(err) = transport.send(&data, &addr).await {
                    self.cache.remove(&transport.key()).await;
                    return Err(Error::Transport(format!("send to {addr} failed: {err}")));
                }
            }
        }
        self.message_sent(hop.transport, data.len());

        Ok(())
    }

    async fn send_on(&self, data: Bytes, transport: &Transport, addr: SocketAddr) -> Result<()> {
        if let Err(err) = transport.send(&data, &addr).await {
            if transport.is_reliable() {
                self.cache.remove(&transport.key()).await;
            }
            return Err(Error::Transport(format!("send to {addr} failed: {err}")));
        }
        self.message_sent(transport.transport_type(), data.len());

        Ok(())
    }

    fn local_point(&self, transport: TransportType) -> Option<LocalPoint> {
        self.local_points
            .load()
            .iter()
            .find(|lp| lp.transport == transport)
            .cloned()
    }
}

/// The address to advertise for a socket bound to `ip`.
pub(crate) fn advertised_ip(ip: IpAddr) -> IpAddr {
    if ip.is_unspecified() {
        local_ip_address::local_ip().unwrap_or(ip)
    } else {
        ip
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DhruvaConfig;
    use crate::metrics::NoopSink;
    use crate::resolver::HopSource;
    use crate::transport::revocation::{RevocationCache, RevocationPolicy};

    fn layer(listen_points: Vec<ListenPoint>) -> (TransportLayer, TransportRx) {
        let (tx, rx) = mpsc::channel(16);
        let config = DhruvaConfig::default();
        let checker = RevocationChecker::new(Arc::new(RevocationCache::default()), RevocationPolicy::SoftFail);
        let layer = TransportLayer::new(
            listen_points,
            &config.network,
            Arc::new(checker),
            tx,
            Arc::new(NoopSink),
        )
        .unwrap();
        (layer, rx)
    }

    #[test]
    fn test_transport_type_names() {
        assert_eq!("tls".parse::<TransportType>().unwrap(), TransportType::Tls);
        assert_eq!("Udp".parse::<TransportType>().unwrap(), TransportType::Udp);
        assert!("sctp".parse::<TransportType>().is_err());
        assert_eq!(TransportType::Tcp.to_string(), "TCP");
        assert_eq!(TransportType::Tls.default_port(), 5061);
    }

    #[tokio::test]
    async fn test_start_listening_is_fail_fast() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken_addr = taken.local_addr().unwrap();
        let (layer, _rx) = layer(vec![
            ListenPoint::new("udp", "127.0.0.1:0".parse().unwrap(), TransportType::Udp),
            ListenPoint::new("tcp", taken_addr, TransportType::Tcp),
        ]);

        assert_matches!(layer.start_listening().await, Err(Error::Io(_)));
    }

    #[tokio::test]
    async fn test_tcp_round_trip_through_layer() {
        let (server, mut server_rx) = layer(vec![ListenPoint::new(
            "tcp",
            "127.0.0.1:0".parse().unwrap(),
            TransportType::Tcp,
        )]);
        server.start_listening().await.unwrap();
        let local = server.local_point(TransportType::Tcp).unwrap();
        assert_ne!(local.port, 0);
        assert!(server.local_point(TransportType::Udp).is_none());
        assert!(server.local_point(TransportType::Tls).is_none());

        let (client, _client_rx) = layer(vec![]);
        let hop = Hop {
            hostname: None,
            host: "127.0.0.1".parse().unwrap(),
            port: local.port,
            transport: TransportType::Tcp,
            priority: 0,
            source: HopSource::Dns,
        };
        client
            .send_to_hop(Bytes::from_static(tcp::tests::MSG_TEST), &hop)
            .await
            .unwrap();
        assert_eq!(client.cache().count(TransportType::Tcp), 1);

        assert_matches!(server_rx.recv().await, Some(TransportEvent::Created(_)));
        let Some(TransportEvent::Received(incoming)) = server_rx.recv().await else {
            unreachable!();
        };
        assert_eq!(&incoming.packet.data[..], tcp::tests::MSG_TEST);
    }
}
