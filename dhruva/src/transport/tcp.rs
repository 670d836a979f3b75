//! SIP over stream connections.
//!
//! [`StreamTransport`] runs over any byte stream, a plain TCP socket or a TLS
//! session. Reads go through the [`FrameDecoder`], writes are serialized by a
//! lock.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use super::tls::ServerHandshake;
use super::{
    FrameDecoder, IncomingPacket, Packet, SipTransport, Transport, TransportEvent, TransportTx,
    TransportType,
};
use crate::error::{Error, FramingError, Result};

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

struct Inner {
    transport_type: TransportType,
    local: SocketAddr,
    remote: SocketAddr,
    writer: tokio::sync::Mutex<Writer>,
    last_activity: Mutex<Instant>,
    cancel: CancellationToken,
}

impl Inner {
    fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }
}

/// A connection carrying SIP messages.
#[derive(Clone)]
pub struct StreamTransport(Arc<Inner>);

impl StreamTransport {
    /// Wraps `stream`, reports it as created and starts reading from it.
    pub async fn start<S>(
        stream: S,
        transport_type: TransportType,
        local: SocketAddr,
        remote: SocketAddr,
        max_frame_size: usize,
        events: TransportTx,
    ) -> Result<Transport>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = split(stream);
        let inner = Arc::new(Inner {
            transport_type,
            local,
            remote,
            writer: tokio::sync::Mutex::new(Box::new(write)),
            last_activity: Mutex::new(Instant::now()),
            cancel: CancellationToken::new(),
        });
        let transport = Transport::new(StreamTransport(inner.clone()));

        events.send(TransportEvent::Created(transport.clone())).await?;

        let reader = FramedRead::new(read, FrameDecoder::new(max_frame_size));
        tokio::spawn(read_loop(reader, transport.clone(), inner, events));

        Ok(transport)
    }
}

async fn read_loop<R>(mut reader: FramedRead<R, FrameDecoder>, transport: Transport, inner: Arc<Inner>, events: TransportTx)
where
    R: AsyncRead + Unpin,
{
    let key = transport.key();
    log::debug!("Reading from connection {}", key);

    loop {
        let frame = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            frame = reader.next() => frame,
        };
        match frame {
            Some(Ok(data)) => {
                inner.touch();
                let packet = Packet {
                    data,
                    source: inner.remote,
                    time: SystemTime::now(),
                };
                let incoming = IncomingPacket {
                    transport: transport.clone(),
                    packet,
                };
                if events.send(TransportEvent::Received(incoming)).await.is_err() {
                    break;
                }
            }
            Some(Err(FramingError::Io(err))) => {
                log::debug!("Connection {} read failed: {}", key, err);
                break;
            }
            Some(Err(FramingError::Oversize { unread, max, snapshot, .. })) => {
                log::error!(
                    "Closing connection {}: {} unread bytes over the {} bytes limit, buffer: {:?}",
                    key,
                    unread,
                    max,
                    snapshot
                );
                break;
            }
            Some(Err(err)) => {
                log::warn!("Closing connection {}: {}", key, err);
                break;
            }
            None => {
                log::debug!("Connection {} closed by peer", key);
                break;
            }
        }
    }

    inner.cancel.cancel();
    if events.send(TransportEvent::Closed(key)).await.is_err() {
        log::trace!("Closed event for {} dropped", key);
    }
}

#[async_trait::async_trait]
impl SipTransport for StreamTransport {
    async fn send(&self, buf: &[u8], _: &SocketAddr) -> Result<usize> {
        if self.0.cancel.is_cancelled() {
            return Err(Error::Transport(format!("connection to {} is closed", self.0.remote)));
        }
        let mut writer = self.0.writer.lock().await;

        writer.write_all(buf).await?;
        writer.flush().await?;
        self.0.touch();

        Ok(buf.len())
    }

    fn transport_type(&self) -> TransportType {
        self.0.transport_type
    }

    fn local_addr(&self) -> SocketAddr {
        self.0.local
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.0.remote)
    }

    fn idle_for(&self) -> Duration {
        self.0
            .last_activity
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }

    fn is_closed(&self) -> bool {
        self.0.cancel.is_cancelled()
    }

    async fn close(&self) {
        self.0.cancel.cancel();
        let mut writer = self.0.writer.lock().await;
        if let Err(err) = writer.shutdown().await {
            log::trace!("Shutdown of {} failed: {}", self.0.remote, err);
        }
    }
}

/// Opens a TCP connection to `addr`.
pub async fn connect(addr: SocketAddr, max_frame_size: usize, events: TransportTx) -> Result<Transport> {
    let stream = TcpStream::connect(addr).await?;
    let local = stream.local_addr()?;
    log::debug!("Connected to {} from {}", addr, local);

    StreamTransport::start(stream, TransportType::Tcp, local, addr, max_frame_size, events).await
}

/// Accepts TCP connections, and runs the TLS handshake on them when given.
pub struct TcpServer {
    sock: TcpListener,
    addr: SocketAddr,
}

impl TcpServer {
    pub async fn bind<A>(addr: A) -> Result<Self>
    where
        A: ToSocketAddrs,
    {
        let sock = TcpListener::bind(addr).await?;
        let addr = sock.local_addr()?;

        Ok(Self { sock, addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accepts connections until the task is aborted.
    pub async fn serve(self, tls: Option<ServerHandshake>, max_frame_size: usize, events: TransportTx) {
        loop {
            let (stream, remote) = match self.sock.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    log::error!("Failed to accept connection on {}: {:#}", self.addr, err);
                    continue;
                }
            };
            log::debug!("Got incoming connection from {} on {}", remote, self.addr);

            let tls = tls.clone();
            let events = events.clone();
            tokio::spawn(async move {
                if let Err(err) = on_accept(stream, remote, tls, max_frame_size, events).await {
                    log::warn!("Dropping connection from {}: {}", remote, err);
                }
            });
        }
    }
}

async fn on_accept(
    stream: TcpStream,
    remote: SocketAddr,
    tls: Option<ServerHandshake>,
    max_frame_size: usize,
    events: TransportTx,
) -> Result<()> {
    let local = stream.local_addr()?;
    match tls {
        None => {
            StreamTransport::start(stream, TransportType::Tcp, local, remote, max_frame_size, events).await?;
        }
        Some(handshake) => {
            let stream = handshake.accept(stream).await?;
            StreamTransport::start(stream, TransportType::Tls, local, remote, max_frame_size, events).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use tokio::net::TcpSocket;

    use super::*;

    pub(crate) const MSG_TEST: &[u8] = b"REGISTER sip:registrar.biloxi.com SIP/2.0\r\n\
    Via: SIP/2.0/TCP bobspc.biloxi.com:5060;branch=z9hG4bKnashds7\r\n\
    Max-Forwards: 70\r\n\
    To: Bob <sip:bob@biloxi.com>\r\n\
    From: Bob <sip:bob@biloxi.com>;tag=456248\r\n\
    Call-ID: 843817637684230@998sdasdh09\r\n\
    CSeq: 1826 REGISTER\r\n\
    Contact: <sip:bob@192.0.2.4>\r\n\
    Expires: 7200\r\n\
    Content-Length: 0\r\n\r\n";

    #[tokio::test]
    async fn smoke() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let server = TcpServer::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr();
        tokio::spawn(server.serve(None, 1024, tx));

        let mut client = TcpSocket::new_v4().unwrap().connect(server_addr).await.unwrap();
        assert_matches!(rx.recv().await, Some(TransportEvent::Created(_)));

        client.write_all(b"\r\n\r\n").await.unwrap();
        client.write_all(&MSG_TEST[..40]).await.unwrap();
        client.flush().await.unwrap();
        client.write_all(&MSG_TEST[40..]).await.unwrap();
        client.flush().await.unwrap();

        let Some(TransportEvent::Received(IncomingPacket { packet, transport })) = rx.recv().await else {
            unreachable!();
        };
        assert_eq!(packet.data.as_ref(), MSG_TEST);
        assert_eq!(transport.transport_type(), TransportType::Tcp);
        assert_eq!(transport.remote_addr(), Some(client.local_addr().unwrap()));
    }

    #[tokio::test]
    async fn test_oversize_frame_closes_connection() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let server = TcpServer::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr();
        tokio::spawn(server.serve(None, 64, tx));

        let mut client = TcpStream::connect(server_addr).await.unwrap();
        let Some(TransportEvent::Created(transport)) = rx.recv().await else {
            unreachable!();
        };

        client.write_all(MSG_TEST).await.unwrap();

        assert_matches!(rx.recv().await, Some(TransportEvent::Closed(key)) if key == transport.key());
        assert!(transport.is_closed());
    }
}
