use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use crate::message::SipMessage;
use crate::parser::Parser;
use crate::resolver::Hop;
use crate::transport::{LocalPoint, MessageSender, SipTransport, Transport, TransportType};
use crate::{Error, Result};

struct MockInner {
    sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
    local: SocketAddr,
    remote: Option<SocketAddr>,
    tp_type: TransportType,
    fail_at: Option<usize>,
    idle: Mutex<Duration>,
    closed: AtomicBool,
}

/// A mock transport, for testing purposes
#[derive(Clone)]
pub struct MockTransport(Arc<MockInner>);

impl MockTransport {
    fn build(tp_type: TransportType, remote: Option<SocketAddr>, fail_at: Option<usize>) -> Self {
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        Self(Arc::new(MockInner {
            sent: Default::default(),
            local: SocketAddr::new(ip, tp_type.default_port()),
            remote,
            tp_type,
            fail_at,
            idle: Mutex::new(Duration::ZERO),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn with_transport_type(tp_type: TransportType) -> Self {
        Self::build(tp_type, None, None)
    }

    pub fn new_udp() -> Self {
        Self::with_transport_type(TransportType::Udp)
    }

    /// A connection to `remote`.
    pub fn connected(tp_type: TransportType, remote: SocketAddr) -> Self {
        Self::build(tp_type, Some(remote), None)
    }

    /// Fails the `n`th send, counting from 1.
    pub fn failing_at(tp_type: TransportType, n: usize) -> Self {
        Self::build(tp_type, None, Some(n))
    }

    pub fn set_idle(&self, idle: Duration) {
        *self.0.idle.lock().unwrap() = idle;
    }

    pub fn sent_count(&self) -> usize {
        self.0.sent.lock().unwrap().len()
    }

    pub fn last_buffer(&self) -> Option<Vec<u8>> {
        let guard = self.0.sent.lock().unwrap();
        guard.last().map(|(buff, _)| buff).cloned()
    }

    pub fn last_sip_msg(&self) -> Option<SipMessage> {
        self.last_buffer().map(|b| Parser::parse(&Bytes::from(b)).unwrap())
    }
}

impl From<MockTransport> for Transport {
    fn from(mock: MockTransport) -> Self {
        Transport::new(mock)
    }
}

#[async_trait::async_trait]
impl SipTransport for MockTransport {
    async fn send(&self, buf: &[u8], address: &SocketAddr) -> Result<usize> {
        let count = {
            let mut guard = self.0.sent.lock().unwrap();
            guard.push((buf.to_vec(), *address));
            guard.len()
        };

        if self.0.fail_at == Some(count) {
            return Err(Error::Transport("Simulated failure".into()));
        }

        Ok(buf.len())
    }

    fn transport_type(&self) -> TransportType {
        self.0.tp_type
    }

    fn local_addr(&self) -> SocketAddr {
        self.0.local
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.0.remote
    }

    fn idle_for(&self) -> Duration {
        *self.0.idle.lock().unwrap()
    }

    fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::Relaxed)
    }

    async fn close(&self) {
        self.0.closed.store(true, Ordering::Relaxed);
    }
}

/// Where a [`MockSender`] was asked to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentTo {
    Hop(Hop),
    Peer(SocketAddr),
}

/// A [`MessageSender`] that records everything and fails the first sends
/// to hops.
#[derive(Default)]
pub struct MockSender {
    sent: Mutex<Vec<(Bytes, SentTo)>>,
    fail_first: AtomicUsize,
}

impl MockSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(n: usize) -> Self {
        let sender = Self::default();
        sender.fail_first.store(n, Ordering::Relaxed);
        sender
    }

    pub fn sent(&self) -> Vec<(Bytes, SentTo)> {
        self.sent.lock().unwrap().clone()
    }

    /// Messages sent to hops, including the failed attempts.
    pub fn hop_attempts(&self) -> Vec<(SipMessage, Hop)> {
        self.sent()
            .into_iter()
            .filter_map(|(data, to)| match to {
                SentTo::Hop(hop) => Some((Parser::parse(&data).unwrap(), hop)),
                SentTo::Peer(_) => None,
            })
            .collect()
    }

    /// Messages sent back on inbound transports.
    pub fn peer_messages(&self) -> Vec<(SipMessage, SocketAddr)> {
        self.sent()
            .into_iter()
            .filter_map(|(data, to)| match to {
                SentTo::Peer(addr) => Some((Parser::parse(&data).unwrap(), addr)),
                SentTo::Hop(_) => None,
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl MessageSender for MockSender {
    async fn send_to_hop(&self, data: Bytes, hop: &Hop) -> Result<()> {
        self.sent.lock().unwrap().push((data, SentTo::Hop(hop.clone())));
        let failing = self
            .fail_first
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Transport(format!("send to {} failed", hop.addr())));
        }
        Ok(())
    }

    async fn send_on(&self, data: Bytes, _transport: &Transport, addr: SocketAddr) -> Result<()> {
        self.sent.lock().unwrap().push((data, SentTo::Peer(addr)));
        Ok(())
    }

    fn local_point(&self, transport: TransportType) -> Option<LocalPoint> {
        Some(LocalPoint {
            name: "default".to_string(),
            host: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 100)),
            port: transport.default_port(),
            transport,
            record_route: true,
        })
    }
}
