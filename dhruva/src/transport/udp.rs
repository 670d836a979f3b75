//! SIP UDP Transport.
//!
//! Every datagram is one whole message, no framing is needed. Outbound
//! datagrams leave from the listening socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::task::JoinHandle;

use super::{IncomingPacket, Packet, SipTransport, Transport, TransportEvent, TransportTx, TransportType};
use crate::error::Result;

const MAX_DATAGRAM: usize = 65535;

#[derive(Debug)]
struct Inner {
    sock: UdpSocket,
    addr: SocketAddr,
}

#[derive(Debug, Clone)]
/// UDP transport implementation.
pub struct UdpTransport(Arc<Inner>);

impl UdpTransport {
    /// Binds a UDP transport to the specified address.
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let sock = UdpSocket::bind(addr).await?;
        let addr = sock.local_addr()?;

        Ok(Self(Arc::new(Inner { sock, addr })))
    }

    /// Reads datagrams into `events` until the task is aborted or the
    /// channel closes.
    pub fn spawn_receiver(&self, events: TransportTx) -> JoinHandle<()> {
        let udp = self.clone();
        tokio::spawn(async move { udp.recv_loop(events).await })
    }

    async fn recv_loop(self, events: TransportTx) {
        let transport = Transport::new(self.clone());
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let (len, source) = match self.0.sock.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    log::warn!("UDP receive on {} failed: {}", self.0.addr, err);
                    continue;
                }
            };
            if buf[..len].iter().all(u8::is_ascii_whitespace) {
                log::trace!("Keep-alive from {}", source);
                continue;
            }

            let packet = Packet {
                data: Bytes::copy_from_slice(&buf[..len]),
                source,
                time: SystemTime::now(),
            };
            let incoming = IncomingPacket {
                transport: transport.clone(),
                packet,
            };
            if events.send(TransportEvent::Received(incoming)).await.is_err() {
                log::debug!("UDP receiver on {} stopped", self.0.addr);
                return;
            }
        }
    }
}

#[async_trait::async_trait]
impl SipTransport for UdpTransport {
    async fn send(&self, buf: &[u8], addr: &SocketAddr) -> Result<usize> {
        Ok(self.0.sock.send_to(buf, addr).await?)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Udp
    }

    fn local_addr(&self) -> SocketAddr {
        self.0.addr
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
}
