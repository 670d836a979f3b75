//! Stateful forwarding.
//!
//! The [`ProxyController`] routes an inbound request, resolves the route into
//! hops and sends the request to the first hop that takes it. Its own `Via`
//! carries the correlation id of the request [`ExecutionContext`] in the
//! branch, which is how a response finds its way back to the client.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use util::WireStr;

use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::message::{
    CSeq, Header, HeaderName, Host, HostPort, Method, NameAddr, Request, Response, SipMessage,
    StatusCode, TypedValue, Uri, Via,
};
use crate::resolver::{Hop, ServerLocator};
use crate::service::RoutingService;
use crate::session::{Endpoint, SessionEvent, SessionState, SessionTracker};
use crate::transport::{LocalPoint, MessageSender, TransportType};

mod context;
mod envelope;
mod router;

pub use context::{ContextValue, ExecutionContext};
pub use envelope::{CallType, DhruvaMessage, MessageSource};
pub use router::{Destination, RoutePattern, RoutingTable};

/// The magic cookie of RFC 3261 branches.
pub const BRANCH_PREFIX: &str = "z9hG4bK";

const DEFAULT_MAX_FORWARDS: u32 = 70;

/// How long a finished transaction still absorbs retransmissions.
const LINGER: Duration = Duration::from_secs(32);

/// Receives the responses of a forwarded request.
#[async_trait]
pub trait ResponseHandler: Send + Sync {
    async fn respond(&self, response: DhruvaMessage) -> Result<()>;
}

struct Branch {
    hop: Hop,
    request: Request,
}

/// A request forwarded by the proxy, from the first hop attempt until its
/// final response.
pub struct Location {
    correlation_id: String,
    call_id: Option<String>,
    request: Request,
    source: MessageSource,
    initial_invite: bool,
    active: ArcSwapOption<Branch>,
    final_code: AtomicU16,
    /// The final response was generated by the proxy.
    answered_here: AtomicBool,
    progress: Notify,
    done: CancellationToken,
    controller: Weak<ProxyController>,
}

impl Location {
    fn new(
        context: &ExecutionContext,
        request: Request,
        source: MessageSource,
        initial_invite: bool,
        controller: Weak<ProxyController>,
    ) -> Self {
        Self {
            correlation_id: context.correlation_id().to_string(),
            call_id: context.call_id().map(str::to_string),
            request,
            source,
            initial_invite,
            active: ArcSwapOption::empty(),
            final_code: AtomicU16::new(0),
            answered_here: AtomicBool::new(false),
            progress: Notify::new(),
            done: CancellationToken::new(),
            controller,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// The request as received from the client.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The hop the request was last sent to.
    pub fn active_hop(&self) -> Option<Hop> {
        self.active.load().as_ref().map(|branch| branch.hop.clone())
    }

    /// The final response sent to the client, forwarded or our own.
    pub fn final_code(&self) -> Option<StatusCode> {
        StatusCode::new(self.final_code.load(Ordering::Acquire))
    }

    pub fn is_completed(&self) -> bool {
        self.final_code().is_some()
    }

    /// Records the final response, `false` when there already was one.
    fn complete(&self, code: StatusCode) -> bool {
        let first = self
            .final_code
            .compare_exchange(0, code.as_u16(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.done.cancel();
        }
        first
    }
}

#[async_trait]
impl ResponseHandler for Location {
    async fn respond(&self, message: DhruvaMessage) -> Result<()> {
        let controller = self.controller.upgrade().ok_or(Error::ControllerMissing)?;
        match message.message {
            SipMessage::Response(response) => controller.forward_response(self, response).await,
            SipMessage::Request(request) => {
                log::debug!("Ignoring {} handed over as a response", request.method());
                Ok(())
            }
        }
    }
}

/// Forwards requests and correlates their responses.
pub struct ProxyController {
    me: Weak<ProxyController>,
    sender: Arc<dyn MessageSender>,
    locator: Arc<ServerLocator>,
    sessions: Arc<SessionTracker>,
    routing: Arc<dyn RoutingService>,
    request_timeout: Duration,
    max_sessions_per_endpoint: Option<usize>,
    /// Pending contexts by correlation id.
    contexts: DashMap<String, ExecutionContext>,
    /// Pending requests by the branch of the client.
    branches: DashMap<String, Arc<Location>>,
    shutdown: CancellationToken,
}

impl ProxyController {
    pub fn new(
        sender: Arc<dyn MessageSender>,
        locator: Arc<ServerLocator>,
        sessions: Arc<SessionTracker>,
        routing: Arc<dyn RoutingService>,
        config: &ProxyConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            sender,
            locator,
            sessions,
            routing,
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            max_sessions_per_endpoint: config.max_sessions_per_endpoint,
            contexts: DashMap::new(),
            branches: DashMap::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn sessions(&self) -> &Arc<SessionTracker> {
        &self.sessions
    }

    /// Requests and responses still correlated.
    pub fn pending(&self) -> usize {
        self.contexts.len()
    }

    /// Stops the timers of the pending requests.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn on_message(&self, message: DhruvaMessage) -> Result<()> {
        let DhruvaMessage {
            context,
            message,
            source,
            ..
        } = message;
        match message {
            SipMessage::Request(request) => {
                let source =
                    source.ok_or_else(|| Error::Transport("request without a source".into()))?;
                self.on_request(context, request, source).await
            }
            SipMessage::Response(response) => self.on_response(response).await,
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(method = %request.method(), correlation_id = context.correlation_id()))]
    async fn on_request(
        &self,
        mut context: ExecutionContext,
        mut request: Request,
        source: MessageSource,
    ) -> Result<()> {
        let method = request.method().clone();
        let initial_invite =
            method.is_invite() && request.headers.to_hdr().is_some_and(|to| to.tag().is_none());
        let location = match method {
            Method::Cancel => return self.on_cancel(&request, &source).await,
            Method::Ack if self.absorb_ack(&request) => return Ok(()),
            Method::Ack => None,
            _ => {
                let location = Arc::new(Location::new(
                    &context,
                    request.clone(),
                    source.clone(),
                    initial_invite,
                    self.me.clone(),
                ));
                // The branch is taken before anything is awaited, a
                // retransmission arriving meanwhile finds it.
                if let Some(branch) = client_branch(&request) {
                    let pending = match self.branches.entry(branch) {
                        Entry::Occupied(entry) => Some(entry.get().clone()),
                        Entry::Vacant(entry) => {
                            entry.insert(location.clone());
                            None
                        }
                    };
                    if let Some(pending) = pending {
                        return self.on_retransmission(&pending).await;
                    }
                }
                Some(location)
            }
        };

        let result = self
            .forward_request(&mut context, &mut request, &source, location.as_ref(), initial_invite)
            .await;
        let Some(location) = location else {
            return result.map(|_| ());
        };
        match result {
            Ok(None) => {
                self.watch(location);
                Ok(())
            }
            Ok(Some(code)) => self.finish(location, code).await,
            Err(err) => {
                log::error!("Failed to forward {} {}: {}", method, request.uri(), err);
                if let Err(reply_err) = self.finish(location, StatusCode::SERVER_INTERNAL_ERROR).await {
                    log::warn!("Failed to answer {} {}: {}", method, request.uri(), reply_err);
                }
                Err(err)
            }
        }
    }

    /// Routes `request` and sends it to the first hop taking it.
    ///
    /// Returns the final response the proxy owes the client when the request
    /// could not be forwarded, `None` otherwise.
    async fn forward_request(
        &self,
        context: &mut ExecutionContext,
        request: &mut Request,
        source: &MessageSource,
        location: Option<&Arc<Location>>,
        initial_invite: bool,
    ) -> Result<Option<StatusCode>> {
        let method = request.method().clone();
        let max_forwards = request
            .headers
            .max_forwards()
            .unwrap_or(DEFAULT_MAX_FORWARDS);
        if max_forwards == 0 {
            log::info!("Max-Forwards exhausted for {} {}", method, request.uri());
            return Ok(Some(StatusCode::TOO_MANY_HOPS));
        }

        let call_id = context.call_id().map(str::to_string);
        if initial_invite {
            self.sessions.get_or_create(request)?;
        } else if let Some(call_id) = &call_id {
            self.sessions.activity(call_id, &method)?;
            if method == Method::Bye {
                self.end_session(call_id);
            }
        }

        self.strip_own_route(request);

        let started = Instant::now();
        let destination = match self.routing.route(request, context).await {
            Ok(destination) => destination,
            Err(err) => {
                log::error!("{} failed on {}: {}", self.routing.name(), request.uri(), err);
                context.set_error(&err);
                return Ok(Some(StatusCode::SERVER_INTERNAL_ERROR));
            }
        };
        let Some(destination) = destination else {
            context.add_execution(self.routing.name(), "NO_ROUTE", started.elapsed().as_millis());
            log::info!("No route for {}", request.uri());
            return Ok(Some(StatusCode::NOT_FOUND));
        };
        context.add_execution(self.routing.name(), "SUCCESS", started.elapsed().as_millis());

        let started = Instant::now();
        let located = self
            .locator
            .locate(&destination.host, destination.lookup, destination.port, context.user_id())
            .await;
        if located.is_empty() {
            context.add_execution("locate", "FAILED", started.elapsed().as_millis());
            log::info!(
                "No hop for {}: {}",
                destination,
                located.error.as_deref().unwrap_or("no records")
            );
            return Ok(Some(StatusCode::NOT_FOUND));
        }
        context.add_execution("locate", "SUCCESS", started.elapsed().as_millis());

        let mut outbound = request.clone();
        outbound
            .headers
            .set(Header::number(HeaderName::MaxForwards, max_forwards - 1));

        let correlation_id = context.correlation_id().to_string();
        if let Some(location) = location {
            context.set_handler(location.clone());
            self.contexts.insert(correlation_id.clone(), context.clone());
        }

        let record_route = self
            .sender
            .local_point(source.transport.transport_type())
            .is_some_and(|lp| lp.record_route);
        let mut cac_rejected = false;
        for hop in &located.hops {
            if location.is_some_and(|location| location.is_completed()) {
                log::debug!("{} {} finished while forwarding", method, request.uri());
                return Ok(None);
            }
            let Some(local) = self.sender.local_point(hop.transport) else {
                log::warn!("No {} listen point to reach {}", hop.transport, hop);
                continue;
            };
            if initial_invite {
                if let Some(call_id) = &call_id {
                    let endpoint =
                        Endpoint::new(local.name.clone(), hop.host.to_string(), hop.port, hop.transport);
                    if let Some(limit) = self.max_sessions_per_endpoint {
                        if !self.sessions.check_active_usage_limit(&endpoint, limit) {
                            log::warn!("Call limit of {} reached on {}", limit, endpoint);
                            cac_rejected = true;
                            continue;
                        }
                    }
                    self.sessions.set_destination(call_id, endpoint)?;
                }
            }

            let branch = branch_request(&outbound, &local, hop, &correlation_id, record_route);
            let data = SipMessage::Request(branch.clone()).to_bytes()?;
            if let Some(location) = location {
                location.active.store(Some(Arc::new(Branch {
                    hop: hop.clone(),
                    request: branch,
                })));
            }
            match self.sender.send_to_hop(data, hop).await {
                Ok(()) => {
                    log::debug!("Forwarded {} to {}", method, hop);
                    return Ok(None);
                }
                Err(err) => log::warn!("Failed to forward {} to {}: {}", method, hop, err),
            }
        }

        if location.is_none() {
            log::warn!("ACK for {} dropped, no hop took it", request.uri());
            return Ok(None);
        }
        if cac_rejected && initial_invite {
            if let Some(call_id) = &call_id {
                self.sessions.license_failure(call_id)?;
            }
        }
        Ok(Some(StatusCode::SERVICE_UNAVAILABLE))
    }

    /// Answers a request the proxy did not forward, the request still
    /// absorbs its retransmissions for a while.
    async fn finish(&self, location: Arc<Location>, code: StatusCode) -> Result<()> {
        self.contexts.remove(&location.correlation_id);
        if !location.complete(code) {
            self.watch(location);
            return Ok(());
        }
        location.answered_here.store(true, Ordering::Release);
        if location.initial_invite {
            self.fail_session(location.call_id.as_deref(), code);
        }
        let result = self.reply(&location.request, &location.source, code).await;
        self.watch(location);
        result
    }

    /// A request seen again on the same client branch. Our own final
    /// response is sent again, anything else is absorbed.
    async fn on_retransmission(&self, location: &Location) -> Result<()> {
        log::debug!(
            "Absorbing retransmitted {} {}",
            location.request.method(),
            location.request.uri()
        );
        match location.final_code() {
            Some(code) if location.answered_here.load(Ordering::Acquire) => {
                self.reply(&location.request, &location.source, code).await
            }
            _ => Ok(()),
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(code = %response.code()))]
    async fn on_response(&self, response: Response) -> Result<()> {
        let correlation_id = response
            .headers
            .top_via()
            .and_then(|via| via.branch())
            .and_then(|branch| branch.as_str())
            .and_then(|branch| branch.strip_prefix(BRANCH_PREFIX))
            .map(str::to_string);
        let Some(correlation_id) = correlation_id else {
            log::debug!("Dropping {} response without a branch of ours", response.code());
            return Ok(());
        };
        let pending = self.contexts.get(&correlation_id).map(|entry| entry.value().clone());
        let Some(context) = pending else {
            log::debug!("Dropping {} response, no request for {}", response.code(), correlation_id);
            return Ok(());
        };

        let handler = context.handler().cloned().ok_or(Error::ControllerMissing)?;
        handler.respond(DhruvaMessage::new(context, response.into())).await
    }

    /// Gives up on a forwarded request.
    ///
    /// The client gets a `408` when `timed_out`, a `487` otherwise, and an
    /// INVITE is cancelled on the hop it was sent to. Does nothing once the
    /// request has a final response.
    pub async fn cancel(&self, location: &Location, timed_out: bool) -> Result<()> {
        let code = if timed_out {
            StatusCode::REQUEST_TIMEOUT
        } else {
            StatusCode::REQUEST_TERMINATED
        };
        if !location.complete(code) {
            return Ok(());
        }
        location.answered_here.store(true, Ordering::Release);
        if timed_out {
            log::warn!("{} {} timed out", location.request.method(), location.request.uri());
        } else {
            log::info!("{} {} cancelled", location.request.method(), location.request.uri());
        }

        if location.request.method().is_invite() {
            if let Some(branch) = location.active.load_full() {
                if let Err(err) = self.send_hop_request(&branch, Method::Cancel, None).await {
                    log::warn!("Failed to send CANCEL to {}: {}", branch.hop, err);
                }
            }
        }
        if location.initial_invite {
            self.fail_session(location.call_id.as_deref(), code);
        }

        self.reply(&location.request, &location.source, code).await
    }

    async fn forward_response(&self, location: &Location, mut response: Response) -> Result<()> {
        let code = response.code();
        let is_invite = location.request.method().is_invite();

        let session = if code.is_final() {
            let first = location.complete(code);
            if is_invite && !code.is_success() {
                if let Some(branch) = location.active.load_full() {
                    let to = response.headers.get(&HeaderName::To);
                    if let Err(err) = self.send_hop_request(&branch, Method::Ack, to).await {
                        log::warn!("Failed to ACK {} on {}: {}", code, branch.hop, err);
                    }
                }
            }
            // 2xx retransmissions to an INVITE still reach the client.
            if !first && !(is_invite && code.is_success()) {
                log::debug!("Absorbing {} of completed {}", code, location.correlation_id);
                return Ok(());
            }
            if first {
                self.session_event(location, code)
            } else {
                Ok(())
            }
        } else {
            if location.is_completed() {
                log::debug!("Absorbing {} of completed {}", code, location.correlation_id);
                return Ok(());
            }
            location.progress.notify_one();
            self.session_event(location, code)
        };

        response.headers.remove_first(&HeaderName::Via);
        let data = SipMessage::Response(response).to_bytes()?;
        self.sender
            .send_on(data, &location.source.transport, location.source.addr)
            .await?;

        session
    }

    async fn on_cancel(&self, request: &Request, source: &MessageSource) -> Result<()> {
        let location = client_branch(request)
            .and_then(|branch| self.branches.get(&branch).map(|entry| entry.value().clone()));
        let Some(location) = location else {
            log::info!("CANCEL for {} matches no pending request", request.uri());
            return self
                .reply(request, source, StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST)
                .await;
        };

        self.reply(request, source, StatusCode::OK).await?;
        self.cancel(&location, false).await
    }

    /// The ACK of a non 2xx final response stays here.
    fn absorb_ack(&self, request: &Request) -> bool {
        let location = client_branch(request)
            .and_then(|branch| self.branches.get(&branch).map(|entry| entry.value().clone()));
        match location.and_then(|location| location.final_code()) {
            Some(code) if !code.is_success() => {
                log::debug!("Absorbing ACK of {}", code);
                true
            }
            _ => false,
        }
    }

    fn watch(&self, location: Arc<Location>) {
        let Some(controller) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let timed_out = loop {
                tokio::select! {
                    _ = location.done.cancelled() => break false,
                    _ = controller.shutdown.cancelled() => return,
                    _ = location.progress.notified() => continue,
                    _ = tokio::time::sleep(controller.request_timeout) => break true,
                }
            };
            if timed_out {
                if let Err(err) = controller.cancel(&location, true).await {
                    log::warn!("Failed to time out {}: {}", location.correlation_id, err);
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(LINGER) => {}
                _ = controller.shutdown.cancelled() => {}
            }
            controller.forget(&location);
        });
    }

    fn forget(&self, location: &Arc<Location>) {
        self.contexts.remove(&location.correlation_id);
        if let Some(branch) = client_branch(&location.request) {
            self.branches
                .remove_if(&branch, |_, pending| Arc::ptr_eq(pending, location));
        }
    }

    async fn send_hop_request(&self, branch: &Branch, method: Method, to: Option<&Header>) -> Result<()> {
        let request = hop_request(&branch.request, method, to)?;
        let data = SipMessage::Request(request).to_bytes()?;
        self.sender.send_to_hop(data, &branch.hop).await
    }

    async fn reply(&self, request: &Request, source: &MessageSource, code: StatusCode) -> Result<()> {
        if request.method().is_ack() {
            return Ok(());
        }
        let response = Response::from_request(request, code, None)?;
        let data = SipMessage::Response(response).to_bytes()?;
        self.sender.send_on(data, &source.transport, source.addr).await
    }

    fn session_event(&self, location: &Location, code: StatusCode) -> Result<()> {
        let Some(call_id) = location.call_id.as_deref().filter(|_| location.initial_invite) else {
            return Ok(());
        };
        if self.sessions.get(call_id).is_none() {
            return Ok(());
        }
        let event = if code.is_provisional() {
            SessionEvent::Provisional(code)
        } else if code.is_success() {
            SessionEvent::Accepted(code)
        } else if code.is_redirect() {
            SessionEvent::Redirected(code)
        } else {
            SessionEvent::Failed(failure_reason(code))
        };
        self.sessions.transition(call_id, event)?;
        Ok(())
    }

    fn fail_session(&self, call_id: Option<&str>, code: StatusCode) {
        let Some(call_id) = call_id else {
            return;
        };
        if self.sessions.get(call_id).is_some() {
            // Errors are logged by the tracker.
            let _ = self
                .sessions
                .transition(call_id, SessionEvent::Failed(failure_reason(code)));
        }
    }

    fn end_session(&self, call_id: &str) {
        let accepted = self
            .sessions
            .get(call_id)
            .is_some_and(|session| session.lock().is_ok_and(|s| s.state() == SessionState::Accepted));
        if accepted {
            let _ = self.sessions.transition(call_id, SessionEvent::Terminated);
        }
    }

    /// Drops the top `Route` when it points at one of our listen points.
    fn strip_own_route(&self, request: &mut Request) {
        let own = request
            .headers
            .get(&HeaderName::Route)
            .and_then(|route| route.as_name_addr())
            .is_some_and(|route| self.is_local(&route.uri));
        if own {
            request.headers.remove_first(&HeaderName::Route);
        }
    }

    fn is_local(&self, uri: &Uri) -> bool {
        let Some(ip) = uri.host().ip_addr() else {
            return false;
        };
        [TransportType::Udp, TransportType::Tcp, TransportType::Tls]
            .into_iter()
            .filter_map(|transport| self.sender.local_point(transport))
            .any(|lp| lp.host == ip && uri.port().unwrap_or_else(|| lp.transport.default_port()) == lp.port)
    }
}

fn failure_reason(code: StatusCode) -> String {
    format!("{} {}", code, code.reason())
}

fn client_branch(request: &Request) -> Option<String> {
    request
        .headers
        .top_via()
        .and_then(|via| via.branch())
        .and_then(|branch| branch.as_str())
        .map(str::to_string)
}

/// The copy of `outbound` sent to `hop`, with our `Via` on top.
fn branch_request(
    outbound: &Request,
    local: &LocalPoint,
    hop: &Hop,
    correlation_id: &str,
    record_route: bool,
) -> Request {
    let mut request = outbound.clone();
    let sent_by = HostPort::new(Host::IpAddr(local.host), Some(local.port));
    let branch = WireStr::from(format!("{BRANCH_PREFIX}{correlation_id}"));

    if record_route && request.method().can_establish_a_dialog() {
        let mut uri = Uri::new(sent_by.clone());
        uri.params.push(
            WireStr::from_static("transport"),
            Some(WireStr::from(hop.transport.as_str().to_ascii_lowercase())),
        );
        uri.params.push(WireStr::from_static("lr"), None);
        request
            .headers
            .push_front(Header::name_addr(HeaderName::RecordRoute, NameAddr::new(uri)));
    }
    request.headers.push_front(Header::via(Via::new(
        WireStr::from_static(hop.transport.as_str()),
        sent_by,
        branch,
    )));

    request
}

/// A CANCEL or ACK for the request sent on a branch, as a proxy builds them
/// for the hop it talks to.
fn hop_request(forwarded: &Request, method: Method, to: Option<&Header>) -> Result<Request> {
    let headers = &forwarded.headers;
    let mut request = Request::new(method.clone(), forwarded.uri().clone());

    let via = headers.get(&HeaderName::Via).ok_or(Error::MissingRequiredHeader("Via"))?;
    request.headers.push(via.clone());
    request
        .headers
        .push(Header::number(HeaderName::MaxForwards, DEFAULT_MAX_FORWARDS));
    for route in headers.get_all(&HeaderName::Route) {
        request.headers.push(route.clone());
    }
    let from = headers.get(&HeaderName::From).ok_or(Error::MissingRequiredHeader("From"))?;
    request.headers.push(from.clone());
    let to = match to {
        Some(to) => to,
        None => headers.get(&HeaderName::To).ok_or(Error::MissingRequiredHeader("To"))?,
    };
    request.headers.push(to.clone());
    let call_id = headers
        .get(&HeaderName::CallId)
        .ok_or(Error::MissingRequiredHeader("Call-ID"))?;
    request.headers.push(call_id.clone());
    let seq = headers.cseq().ok_or(Error::MissingRequiredHeader("CSeq"))?.seq;
    request
        .headers
        .push(Header::typed(HeaderName::CSeq, TypedValue::CSeq(CSeq { seq, method })));

    Ok(request)
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::config::SessionConfig;
    use crate::error::SessionStateError;
    use crate::resolver::{DnsInjectionService, LookupType};
    use crate::service::StaticRouting;
    use crate::test_utils::{incoming, invite, MockLookup, MockSender, CLIENT_BRANCH, INVITE};

    const CLIENT: &str = "192.0.2.4:5060";

    struct Harness {
        controller: Arc<ProxyController>,
        sender: Arc<MockSender>,
        sessions: Arc<SessionTracker>,
    }

    /// Evicts every session while routing, as an administrator would.
    struct EvictingRouting {
        sessions: Arc<SessionTracker>,
        inner: StaticRouting,
    }

    #[async_trait]
    impl RoutingService for EvictingRouting {
        fn name(&self) -> &str {
            "evicting"
        }

        async fn route(&self, request: &Request, context: &ExecutionContext) -> Result<Option<Destination>> {
            self.sessions.reset_active_sessions();
            self.inner.route(request, context).await
        }
    }

    fn harness(sender: MockSender, lookup: MockLookup, table: RoutingTable, config: ProxyConfig) -> Harness {
        let table = Arc::new(table);
        harness_with(sender, lookup, config, |_| Arc::new(StaticRouting::new(table)))
    }

    fn harness_with<F>(sender: MockSender, lookup: MockLookup, config: ProxyConfig, routing: F) -> Harness
    where
        F: FnOnce(Arc<SessionTracker>) -> Arc<dyn RoutingService>,
    {
        let sender = Arc::new(sender);
        let locator = Arc::new(ServerLocator::new(
            Arc::new(lookup),
            Arc::new(DnsInjectionService::new()),
        ));
        let sessions = Arc::new(SessionTracker::new(&SessionConfig::default()));
        let routing = routing(sessions.clone());
        let controller = ProxyController::new(sender.clone(), locator, sessions.clone(), routing, &config);
        Harness {
            controller,
            sender,
            sessions,
        }
    }

    fn codes(to_client: &[(SipMessage, SocketAddr)]) -> Vec<StatusCode> {
        to_client
            .iter()
            .map(|(message, _)| message.as_response().unwrap().code())
            .collect()
    }

    fn example_com() -> (MockLookup, RoutingTable) {
        let lookup = MockLookup::default();
        lookup.add_srv(
            "_sip._tcp.example.com.",
            &[(10, 5060, "a.example.com."), (20, 5060, "b.example.com.")],
        );
        lookup.add_a("a.example.com.", &["10.0.0.1"]);
        lookup.add_a("b.example.com.", &["10.0.0.2"]);

        let table = RoutingTable::new();
        table
            .add(
                "^sip:alice@example\\.com",
                Destination::parse("example.com", LookupType::Tcp).unwrap(),
            )
            .unwrap();
        (lookup, table)
    }

    async fn receive(harness: &Harness, data: &str) -> Result<()> {
        let message = DhruvaMessage::from_packet(&incoming(data, CLIENT)).unwrap();
        harness.controller.on_message(message).await
    }

    async fn answer(harness: &Harness, forwarded: &SipMessage, code: StatusCode) -> Result<()> {
        let request = forwarded.as_request().unwrap();
        let response = Response::from_request(request, code, None).unwrap();
        let message = DhruvaMessage::new(ExecutionContext::new(), response.into());
        harness.controller.on_message(message).await
    }

    fn client_addr() -> SocketAddr {
        CLIENT.parse().unwrap()
    }

    #[tokio::test]
    async fn test_failover_and_response_correlation() {
        let (lookup, table) = example_com();
        let harness = harness(MockSender::failing_first(1), lookup, table, ProxyConfig::default());

        receive(&harness, INVITE).await.unwrap();

        let attempts = harness.sender.hop_attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].1.addr().to_string(), "10.0.0.1:5060");
        assert_eq!(attempts[1].1.addr().to_string(), "10.0.0.2:5060");
        assert_eq!(attempts[1].1.transport, TransportType::Tcp);

        let forwarded = &attempts[1].0;
        let headers = forwarded.headers();
        let top_via = headers.top_via().unwrap();
        assert!(top_via.branch().unwrap().as_str().unwrap().starts_with(BRANCH_PREFIX));
        assert_eq!(top_via.transport, "TCP");
        assert_eq!(headers.get_all(&HeaderName::Via).count(), 2);
        assert_eq!(headers.max_forwards(), Some(69));
        assert!(headers.get(&HeaderName::RecordRoute).is_some());

        let session = harness.sessions.get("a84b4c76e66710@pc33.atlanta.com").unwrap();
        let destination = session.lock().unwrap().last_destination().cloned().unwrap();
        assert_eq!(destination.host, "10.0.0.2");

        answer(&harness, forwarded, StatusCode::TRYING).await.unwrap();

        let to_client = harness.sender.peer_messages();
        assert_eq!(to_client.len(), 1);
        let (response, addr) = &to_client[0];
        assert_eq!(*addr, client_addr());
        assert_eq!(response.as_response().unwrap().code(), StatusCode::TRYING);
        let vias: Vec<_> = response.headers().get_all(&HeaderName::Via).collect();
        assert_eq!(vias.len(), 1);
        assert_eq!(vias[0].as_via().unwrap().branch().unwrap(), CLIENT_BRANCH);
        assert_eq!(session.lock().unwrap().state(), SessionState::Provisional);

        answer(&harness, forwarded, StatusCode::OK).await.unwrap();

        assert_eq!(harness.sender.peer_messages().len(), 2);
        assert_eq!(session.lock().unwrap().state(), SessionState::Accepted);
    }

    #[tokio::test]
    async fn test_no_route_is_not_found() {
        let (lookup, _) = example_com();
        let harness = harness(MockSender::new(), lookup, RoutingTable::new(), ProxyConfig::default());

        receive(&harness, INVITE).await.unwrap();

        assert!(harness.sender.hop_attempts().is_empty());
        let to_client = harness.sender.peer_messages();
        assert_eq!(to_client[0].0.as_response().unwrap().code(), StatusCode::NOT_FOUND);
        assert!(harness.sessions.is_empty());
        assert_eq!(harness.sessions.total_failed(), 1);
    }

    #[tokio::test]
    async fn test_unresolved_route_is_not_found() {
        let (_, table) = example_com();
        let harness = harness(MockSender::new(), MockLookup::default(), table, ProxyConfig::default());

        receive(&harness, INVITE).await.unwrap();

        let to_client = harness.sender.peer_messages();
        assert_eq!(to_client[0].0.as_response().unwrap().code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_every_hop_failing_is_unavailable() {
        let (lookup, table) = example_com();
        let harness = harness(MockSender::failing_first(2), lookup, table, ProxyConfig::default());

        receive(&harness, INVITE).await.unwrap();

        assert_eq!(harness.sender.hop_attempts().len(), 2);
        let to_client = harness.sender.peer_messages();
        assert_eq!(to_client.len(), 1);
        assert_eq!(
            to_client[0].0.as_response().unwrap().code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(harness.controller.pending(), 0);
    }

    #[tokio::test]
    async fn test_max_forwards_exhausted() {
        let (lookup, table) = example_com();
        let harness = harness(MockSender::new(), lookup, table, ProxyConfig::default());

        receive(&harness, &INVITE.replace("Max-Forwards: 70", "Max-Forwards: 0"))
            .await
            .unwrap();

        assert!(harness.sender.hop_attempts().is_empty());
        let to_client = harness.sender.peer_messages();
        assert_eq!(to_client[0].0.as_response().unwrap().code(), StatusCode::TOO_MANY_HOPS);
    }

    #[tokio::test]
    async fn test_call_limit_per_endpoint() {
        let table = RoutingTable::new();
        table
            .add("example\\.com", Destination::parse("10.0.0.1:5060", LookupType::Udp).unwrap())
            .unwrap();
        let config = ProxyConfig {
            max_sessions_per_endpoint: Some(1),
            ..Default::default()
        };
        let harness = harness(MockSender::new(), MockLookup::default(), table, config);

        receive(&harness, &invite("first@192.0.2.4")).await.unwrap();
        receive(&harness, &invite("second@192.0.2.4")).await.unwrap();

        assert_eq!(harness.sender.hop_attempts().len(), 1);
        let to_client = harness.sender.peer_messages();
        assert_eq!(to_client.len(), 1);
        assert_eq!(
            to_client[0].0.as_response().unwrap().code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        let recent = harness.sessions.recent().unwrap();
        assert_eq!(recent[0].call_id(), "second@192.0.2.4");
        assert_eq!(recent[0].state(), SessionState::Failed);
        assert_eq!(recent[0].reason(), Some(crate::session::LICENSE_EXCEEDED));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout() {
        let (lookup, table) = example_com();
        let harness = harness(MockSender::new(), lookup, table, ProxyConfig::default());

        receive(&harness, INVITE).await.unwrap();
        tokio::time::sleep(Duration::from_millis(32500)).await;

        let to_client = harness.sender.peer_messages();
        assert_eq!(to_client.len(), 1);
        assert_eq!(
            to_client[0].0.as_response().unwrap().code(),
            StatusCode::REQUEST_TIMEOUT
        );
        let attempts = harness.sender.hop_attempts();
        assert_eq!(attempts.len(), 2);
        let cancel = attempts[1].0.as_request().unwrap();
        assert_eq!(*cancel.method(), Method::Cancel);
        assert_eq!(
            cancel.headers.top_via().unwrap().branch(),
            attempts[0].0.headers().top_via().unwrap().branch()
        );
        assert_eq!(harness.sessions.total_failed(), 1);

        tokio::time::sleep(LINGER).await;
        assert_eq!(harness.controller.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provisional_response_restarts_timer() {
        let (lookup, table) = example_com();
        let harness = harness(MockSender::new(), lookup, table, ProxyConfig::default());

        receive(&harness, INVITE).await.unwrap();
        let forwarded = harness.sender.hop_attempts()[0].0.clone();
        tokio::time::sleep(Duration::from_secs(20)).await;
        answer(&harness, &forwarded, StatusCode::RINGING).await.unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;

        assert_eq!(harness.sender.peer_messages().len(), 1);
        assert_eq!(harness.sender.hop_attempts().len(), 1);
    }

    #[tokio::test]
    async fn test_retransmission_absorbed() {
        let (lookup, table) = example_com();
        let harness = harness(MockSender::new(), lookup, table, ProxyConfig::default());

        receive(&harness, INVITE).await.unwrap();
        receive(&harness, INVITE).await.unwrap();

        assert_eq!(harness.sender.hop_attempts().len(), 1);
        assert_eq!(harness.sessions.total_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmission_during_lookup() {
        let (lookup, table) = example_com();
        lookup.delay(Duration::from_millis(50));
        let harness = harness(MockSender::new(), lookup, table, ProxyConfig::default());

        let (first, second) = tokio::join!(receive(&harness, INVITE), receive(&harness, INVITE));
        first.unwrap();
        second.unwrap();

        assert_eq!(harness.sender.hop_attempts().len(), 1);
        assert_eq!(harness.controller.pending(), 1);
        assert_eq!(harness.sessions.total_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_lookup() {
        let (lookup, table) = example_com();
        lookup.delay(Duration::from_millis(50));
        let harness = harness(MockSender::new(), lookup, table, ProxyConfig::default());
        let cancel = INVITE
            .replace("INVITE sip:", "CANCEL sip:")
            .replace("314159 INVITE", "314159 CANCEL");

        let (invite, cancelled) = tokio::join!(receive(&harness, INVITE), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            receive(&harness, &cancel).await
        });
        invite.unwrap();
        cancelled.unwrap();

        assert!(harness.sender.hop_attempts().is_empty());
        assert_eq!(
            codes(&harness.sender.peer_messages()),
            [StatusCode::OK, StatusCode::REQUEST_TERMINATED]
        );
        assert_eq!(harness.sessions.total_failed(), 1);
    }

    #[tokio::test]
    async fn test_long_call_id_is_forwarded() {
        let (lookup, table) = example_com();
        let harness = harness(MockSender::new(), lookup, table, ProxyConfig::default());
        let call_id = format!("{}@192.0.2.4", "a".repeat(600));

        receive(&harness, &invite(&call_id)).await.unwrap();

        assert_eq!(harness.sender.hop_attempts().len(), 1);
        assert!(harness.sender.peer_messages().is_empty());
        assert_eq!(harness.controller.pending(), 1);
        let session = harness.sessions.get(&call_id).unwrap();
        assert!(session.lock().unwrap().last_destination().is_some());
    }

    #[tokio::test]
    async fn test_failure_while_forwarding_is_answered() {
        let (lookup, table) = example_com();
        let table = Arc::new(table);
        let harness = harness_with(MockSender::new(), lookup, ProxyConfig::default(), |sessions| {
            Arc::new(EvictingRouting {
                sessions,
                inner: StaticRouting::new(table),
            })
        });

        let result = receive(&harness, INVITE).await;

        assert_matches!(result, Err(Error::SessionState(SessionStateError::Closed)));
        assert!(harness.sender.hop_attempts().is_empty());
        assert_eq!(harness.controller.pending(), 0);
        assert_eq!(
            codes(&harness.sender.peer_messages()),
            [StatusCode::SERVER_INTERNAL_ERROR]
        );

        // A retransmission gets the same answer and is not routed again.
        receive(&harness, INVITE).await.unwrap();
        assert_eq!(
            codes(&harness.sender.peer_messages()),
            [StatusCode::SERVER_INTERNAL_ERROR, StatusCode::SERVER_INTERNAL_ERROR]
        );
        assert!(harness.sender.hop_attempts().is_empty());
    }

    #[tokio::test]
    async fn test_client_cancel() {
        let (lookup, table) = example_com();
        let harness = harness(MockSender::new(), lookup, table, ProxyConfig::default());

        receive(&harness, INVITE).await.unwrap();
        let cancel = INVITE
            .replace("INVITE sip:", "CANCEL sip:")
            .replace("314159 INVITE", "314159 CANCEL");
        receive(&harness, &cancel).await.unwrap();

        let to_client = harness.sender.peer_messages();
        let codes: Vec<_> = to_client
            .iter()
            .map(|(m, _)| m.as_response().unwrap().code())
            .collect();
        assert_eq!(codes, [StatusCode::OK, StatusCode::REQUEST_TERMINATED]);
        let attempts = harness.sender.hop_attempts();
        assert_eq!(*attempts[1].0.as_request().unwrap().method(), Method::Cancel);

        // The 487 of the hop is acknowledged and not sent twice.
        let forwarded = attempts[0].0.clone();
        answer(&harness, &forwarded, StatusCode::REQUEST_TERMINATED)
            .await
            .unwrap();
        let attempts = harness.sender.hop_attempts();
        assert_eq!(*attempts[2].0.as_request().unwrap().method(), Method::Ack);
        assert_eq!(harness.sender.peer_messages().len(), 2);

        // The ACK of the client stops here.
        let ack = INVITE
            .replace("INVITE sip:", "ACK sip:")
            .replace("314159 INVITE", "314159 ACK");
        receive(&harness, &ack).await.unwrap();
        assert_eq!(harness.sender.hop_attempts().len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_cancel() {
        let (lookup, table) = example_com();
        let harness = harness(MockSender::new(), lookup, table, ProxyConfig::default());

        let cancel = INVITE
            .replace("INVITE sip:", "CANCEL sip:")
            .replace("314159 INVITE", "314159 CANCEL");
        receive(&harness, &cancel).await.unwrap();

        let to_client = harness.sender.peer_messages();
        assert_eq!(
            to_client[0].0.as_response().unwrap().code(),
            StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST
        );
    }

    #[tokio::test]
    async fn test_context_without_handler() {
        let (lookup, table) = example_com();
        let harness = harness(MockSender::new(), lookup, table, ProxyConfig::default());
        harness
            .controller
            .contexts
            .insert("deadbeef".to_string(), ExecutionContext::with_correlation_id("deadbeef"));

        let mut request = crate::parser::Parser::parse(&bytes::Bytes::from_static(INVITE.as_bytes()))
            .unwrap()
            .into_request()
            .unwrap();
        let via = Via::new(
            WireStr::from_static("UDP"),
            HostPort::new(Host::IpAddr("10.0.0.100".parse().unwrap()), Some(5060)),
            WireStr::from_static("z9hG4bKdeadbeef"),
        );
        request.headers.push_front(Header::via(via));
        let response = Response::from_request(&request, StatusCode::OK, None).unwrap();

        let result = harness
            .controller
            .on_message(DhruvaMessage::new(ExecutionContext::new(), response.into()))
            .await;
        assert_matches!(result, Err(Error::ControllerMissing));
    }

    #[tokio::test]
    async fn test_stray_response_dropped() {
        let (lookup, table) = example_com();
        let harness = harness(MockSender::new(), lookup, table, ProxyConfig::default());
        let request = crate::parser::Parser::parse(&bytes::Bytes::from_static(INVITE.as_bytes()))
            .unwrap();

        answer(&harness, &request, StatusCode::OK).await.unwrap();

        assert!(harness.sender.sent().is_empty());
    }

    #[test]
    fn test_hop_request() {
        let forwarded = crate::parser::Parser::parse(&bytes::Bytes::from_static(INVITE.as_bytes()))
            .unwrap()
            .into_request()
            .unwrap();

        let cancel = hop_request(&forwarded, Method::Cancel, None).unwrap();

        assert_eq!(*cancel.method(), Method::Cancel);
        assert_eq!(cancel.uri(), forwarded.uri());
        assert_eq!(cancel.headers.cseq().unwrap().seq, 314159);
        assert_eq!(cancel.headers.cseq().unwrap().method, Method::Cancel);
        assert_eq!(cancel.headers.top_via(), forwarded.headers.top_via());
    }
}
