//! The proxy process.
//!
//! An [`Engine`] owns every shared table of the proxy: connections, DNS
//! overrides, sessions and routes. Nothing is global, two engines in one
//! process do not see each other.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use itertools::Itertools;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::DhruvaConfig;
use crate::controller::{DhruvaMessage, ProxyController, RoutingTable};
use crate::error::{Error, Result};
use crate::message::SipMessage;
use crate::metrics::{Metric, MetricName, MetricsSink};
use crate::resolver::{DnsInjectionService, ServerLocator};
use crate::session::SessionTracker;
use crate::transport::revocation::RevocationCache;
use crate::transport::{
    ConnectionCache, ConnectionKey, IncomingPacket, LocalPoint, TransportEvent, TransportLayer, TransportRx,
};

mod builder;

pub use builder::EngineBuilder;

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const SNAPSHOT_LEN: usize = 100;
const LANE_IDLE: Duration = Duration::from_secs(30);
const LANE_PRUNE_EVERY: usize = 256;

pub struct Engine {
    config: DhruvaConfig,
    transport: Arc<TransportLayer>,
    events: Mutex<Option<TransportRx>>,
    injection: Arc<DnsInjectionService>,
    locator: Arc<ServerLocator>,
    sessions: Arc<SessionTracker>,
    routes: Arc<RoutingTable>,
    revocation: Arc<RevocationCache>,
    metrics: Arc<dyn MetricsSink>,
    controller: Arc<ProxyController>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn builder(config: DhruvaConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &DhruvaConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<TransportLayer> {
        &self.transport
    }

    pub fn injection(&self) -> &Arc<DnsInjectionService> {
        &self.injection
    }

    pub fn locator(&self) -> &Arc<ServerLocator> {
        &self.locator
    }

    pub fn sessions(&self) -> &Arc<SessionTracker> {
        &self.sessions
    }

    /// The static routes, new ones may be added while running.
    pub fn routes(&self) -> &Arc<RoutingTable> {
        &self.routes
    }

    /// Revoked certificates, refreshed by the owner of the engine.
    pub fn revocation(&self) -> &Arc<RevocationCache> {
        &self.revocation
    }

    pub fn controller(&self) -> &Arc<ProxyController> {
        &self.controller
    }

    /// The bound listen points, empty before [`Engine::start`].
    pub fn local_points(&self) -> Arc<Vec<LocalPoint>> {
        self.transport.local_points()
    }

    /// Binds every listen point then starts the sweepers and the dispatch
    /// of inbound messages.
    ///
    /// Fails when a listen point cannot be bound, nothing keeps running then.
    pub async fn start(&self) -> Result<()> {
        let events = self
            .events
            .lock()
            .map_err(|_| Error::PoisonedLock)?
            .take()
            .ok_or_else(|| Error::Config("engine already started".into()))?;

        if let Err(err) = self.transport.start_listening().await {
            log::error!("Failed to start listening: {}", err);
            self.transport.shutdown().await;
            return Err(err);
        }

        let sweep = Duration::from_secs(self.config.network.connection_sweep_interval_secs);
        let cache_sweeper = self.transport.cache().clone().spawn_sweeper(sweep, self.metrics.clone());
        let session_sweeper = self.sessions.clone().spawn_sweeper();
        let dispatcher = tokio::spawn(dispatch(
            events,
            self.transport.cache().clone(),
            self.controller.clone(),
            self.metrics.clone(),
        ));

        let mut tasks = self.tasks.lock().map_err(|_| Error::PoisonedLock)?;
        tasks.extend([cache_sweeper, session_sweeper, dispatcher]);
        log::info!(
            "Proxy started on {}",
            self.local_points()
                .iter()
                .map(|lp| format!("{}:{}:{}", lp.transport, lp.host, lp.port))
                .join(", ")
        );

        Ok(())
    }

    /// Stops the background tasks and closes every connection.
    pub async fn shutdown(&self) {
        log::info!("Shutting down the proxy");
        self.controller.shutdown();
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        self.transport.shutdown().await;
        self.sessions.reset_active_sessions();
    }
}

/// Messages of one peer on one transport, handled in arrival order.
type Lane = mpsc::UnboundedSender<IncomingPacket>;

async fn dispatch(
    mut events: TransportRx,
    cache: Arc<ConnectionCache>,
    controller: Arc<ProxyController>,
    metrics: Arc<dyn MetricsSink>,
) {
    let mut lanes: HashMap<(ConnectionKey, SocketAddr), Lane> = HashMap::new();
    let mut opened = 0usize;
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Created(transport) => {
                log::debug!("Transport {} created", transport.key());
                if transport.is_reliable() {
                    cache.insert(transport);
                }
            }
            TransportEvent::Closed(key) => {
                log::debug!("Transport {} closed", key);
                cache.forget(&key);
                lanes.retain(|(lane, _), _| *lane != key);
            }
            TransportEvent::Received(incoming) => {
                let peer = (incoming.transport.key(), incoming.packet.source);
                let incoming = match lanes.get(&peer) {
                    Some(lane) => match lane.send(incoming) {
                        Ok(()) => continue,
                        Err(mpsc::error::SendError(incoming)) => incoming,
                    },
                    None => incoming,
                };

                opened += 1;
                if opened % LANE_PRUNE_EVERY == 0 {
                    lanes.retain(|_, lane| !lane.is_closed());
                }
                let (lane, rx) = mpsc::unbounded_channel();
                if lane.send(incoming).is_err() {
                    continue;
                }
                lanes.insert(peer, lane);
                tokio::spawn(run_lane(rx, cache.clone(), controller.clone(), metrics.clone()));
            }
        }
    }
    log::debug!("Transport events closed");
}

/// Handles the messages of a lane one at a time, until the lane stays idle.
async fn run_lane(
    mut rx: mpsc::UnboundedReceiver<IncomingPacket>,
    cache: Arc<ConnectionCache>,
    controller: Arc<ProxyController>,
    metrics: Arc<dyn MetricsSink>,
) {
    loop {
        match tokio::time::timeout(LANE_IDLE, rx.recv()).await {
            Ok(Some(incoming)) => on_received(incoming, &cache, &controller, metrics.as_ref()).await,
            Ok(None) => return,
            Err(_) => break,
        }
    }
    // Whatever got in before the close is still ours.
    rx.close();
    while let Ok(incoming) = rx.try_recv() {
        on_received(incoming, &cache, &controller, metrics.as_ref()).await;
    }
}

#[tracing::instrument(level = "trace", skip_all, fields(source = %incoming.packet.source))]
async fn on_received(
    incoming: IncomingPacket,
    cache: &ConnectionCache,
    controller: &ProxyController,
    metrics: &dyn MetricsSink,
) {
    let message = match DhruvaMessage::from_packet(&incoming) {
        Ok(message) => message,
        Err(err) => {
            let data = &incoming.packet.data;
            log::warn!(
                "Dropping unparsable message from {}: {} [{}]",
                incoming.packet.source,
                err,
                String::from_utf8_lossy(&data[..data.len().min(SNAPSHOT_LEN)])
            );
            if incoming.transport.is_reliable() {
                let key = incoming.transport.key();
                log::warn!("Closing connection {}", key);
                incoming.transport.close().await;
                cache.forget(&key);
            }
            return;
        }
    };

    let metric = Metric::new(MetricName::SipMessage)
        .tag("transport", incoming.transport.transport_type())
        .tag("direction", "in")
        .field("bytes", incoming.packet.data.len());
    let metric = match &message.message {
        SipMessage::Request(request) => metric.tag("method", request.method()),
        SipMessage::Response(response) => metric.tag("responseCode", response.code()),
    };
    metrics.emit(metric);

    if let Err(err) = controller.on_message(message).await {
        log::error!("Failed to process message from {}: {}", incoming.packet.source, err);
    }
}
