use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use util::DnsResolver;

use super::{Engine, EVENT_CHANNEL_CAPACITY};
use crate::config::DhruvaConfig;
use crate::controller::{ProxyController, RoutingTable};
use crate::error::Result;
use crate::metrics::{MetricsSink, NoopSink};
use crate::resolver::{DnsInjectionService, DnsLookup, HickoryLookup, MeteredLookup, ServerLocator};
use crate::service::{RoutingService, StaticRouting};
use crate::session::SessionTracker;
use crate::transport::revocation::{RevocationCache, RevocationChecker};
use crate::transport::TransportLayer;

/// EngineBuilder for creating a new proxy [`Engine`].
pub struct EngineBuilder {
    config: DhruvaConfig,
    metrics: Option<Arc<dyn MetricsSink>>,
    lookup: Option<Arc<dyn DnsLookup>>,
    routing: Option<Arc<dyn RoutingService>>,
    revocation: Option<Arc<RevocationCache>>,
}

impl EngineBuilder {
    /// Creates a builder for an engine running `config`.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use dhruva::config::DhruvaConfig;
    /// # use dhruva::engine::EngineBuilder;
    /// let engine = EngineBuilder::new(DhruvaConfig::default())
    ///     .build()
    ///     .unwrap();
    /// ```
    pub fn new(config: DhruvaConfig) -> Self {
        Self {
            config,
            metrics: None,
            lookup: None,
            routing: None,
            revocation: None,
        }
    }

    /// Sets where metrics go, they are dropped otherwise.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);

        self
    }

    /// Replaces the DNS client built from the `dns` configuration.
    pub fn with_lookup(mut self, lookup: Arc<dyn DnsLookup>) -> Self {
        self.lookup = Some(lookup);

        self
    }

    /// Replaces the routing of the configured static routes.
    pub fn with_routing(mut self, routing: Arc<dyn RoutingService>) -> Self {
        self.routing = Some(routing);

        self
    }

    /// Shares the revoked certificates list with whoever refreshes it.
    pub fn with_revocation(mut self, revocation: Arc<RevocationCache>) -> Self {
        self.revocation = Some(revocation);

        self
    }

    /// Finalize the builder into an [`Engine`].
    ///
    /// Fails on an invalid configuration, a route that does not compile or
    /// unreadable TLS material. Nothing is bound until [`Engine::start`].
    pub fn build(self) -> Result<Engine> {
        let config = self.config;
        config.validate()?;

        let metrics = self.metrics.unwrap_or_else(|| Arc::new(NoopSink));
        let lookup = match self.lookup {
            Some(lookup) => lookup,
            None => {
                let resolver = DnsResolver::with_options(&config.dns.options())?;
                Arc::new(HickoryLookup::new(resolver))
            }
        };
        let lookup: Arc<dyn DnsLookup> = Arc::new(MeteredLookup::new(lookup, metrics.clone()));
        let injection = Arc::new(DnsInjectionService::new());
        let locator = Arc::new(ServerLocator::new(lookup, injection.clone()));

        let sessions = Arc::new(SessionTracker::new(&config.sessions));
        let routes = Arc::new(RoutingTable::from_config(&config.proxy.routes)?);
        let routing = self
            .routing
            .unwrap_or_else(|| Arc::new(StaticRouting::new(routes.clone())));
        log::debug!("Routing with {} ({} static routes)", routing.name(), routes.len());

        let revocation = self.revocation.unwrap_or_default();
        let checker = RevocationChecker::new(revocation.clone(), config.network.tls.revocation_policy());
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let transport = Arc::new(TransportLayer::new(
            config.listen_points.clone(),
            &config.network,
            Arc::new(checker),
            tx,
            metrics.clone(),
        )?);

        let controller = ProxyController::new(
            transport.clone(),
            locator.clone(),
            sessions.clone(),
            routing,
            &config.proxy,
        );

        Ok(Engine {
            config,
            transport,
            events: Mutex::new(Some(rx)),
            injection,
            locator,
            sessions,
            routes,
            revocation,
            metrics,
            controller,
            tasks: Mutex::new(Vec::new()),
        })
    }
}
