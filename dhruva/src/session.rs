//! SIP sessions and call admission control.
//!
//! A [`SipSession`] follows one call, keyed by its Call-ID, through the
//! states below. Every transition is written to the session history.
//!
//! ```text
//! INITIAL -> PROVISIONAL -> ACCEPTED -> TERMINATED
//! INITIAL -> PROVISIONAL -> REDIRECTED
//! INITIAL | PROVISIONAL -> FAILED
//! INITIAL | PROVISIONAL | ACCEPTED -> TIMED_OUT
//! any -> FORCED_REMOVE
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use tokio::time::{Duration, Instant};

use crate::error::{Error, Result, SessionStateError};
use crate::message::{HeaderName, Method, Request, StatusCode};
use crate::transport::TransportType;

mod tracker;

pub use tracker::{Session, SessionTracker};

/// Longest identifier or history entry kept, in characters.
pub const MAX_STR_LEN: usize = 512;

pub const SESSION_TIMEOUT: &str = "Time Out";
pub const SESSION_FORCED_REMOVE: &str = "Forced Remove";
pub const LICENSE_EXCEEDED: &str = "License Exceeded";

const SESSION_CREATED: &str = "Created at ";
const SESSION_PROVISIONAL: &str = "Provisional, response=";
const SESSION_ACCEPTED: &str = "Accepted, response=";
const SESSION_REDIRECTED: &str = "Redirected, response=";
const SESSION_FAILED: &str = "Failed, response=";
const SESSION_TERMINATED: &str = "Terminated at ";
const SESSION_TIMED_OUT: &str = "Timed Out at ";
const SESSION_ACTIVITY: &str = "Activity=";
const DESTINATION: &str = "Destination=";
const SERVER_GROUP: &str = "ServerGroup=";
const ROUTE_POLICY: &str = "RoutePolicy=";
const ROUTE: &str = "Route=";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    Initial,
    Provisional,
    Accepted,
    Redirected,
    Failed,
    Terminated,
    TimedOut,
    ForcedRemove,
}

impl SessionState {
    /// Whether the session is over.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            SessionState::Initial | SessionState::Provisional | SessionState::Accepted
        )
    }

    fn can_become(&self, next: SessionState) -> bool {
        use SessionState::*;

        match next {
            Initial => false,
            Provisional | Redirected | Failed => matches!(self, Initial | Provisional),
            Accepted => matches!(self, Initial | Provisional),
            Terminated => *self == Accepted,
            TimedOut => matches!(self, Initial | Provisional | Accepted),
            ForcedRemove => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Initial => "INITIAL",
            SessionState::Provisional => "PROVISIONAL",
            SessionState::Accepted => "ACCEPTED",
            SessionState::Redirected => "REDIRECTED",
            SessionState::Failed => "FAILED",
            SessionState::Terminated => "TERMINATED",
            SessionState::TimedOut => "TIMED_OUT",
            SessionState::ForcedRemove => "FORCED_REMOVE",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Provisional(StatusCode),
    Accepted(StatusCode),
    Redirected(StatusCode),
    /// Failed with a status code or a reason phrase.
    Failed(String),
    Terminated,
    TimedOut,
    ForcedRemove,
}

impl SessionEvent {
    pub fn target(&self) -> SessionState {
        match self {
            SessionEvent::Provisional(_) => SessionState::Provisional,
            SessionEvent::Accepted(_) => SessionState::Accepted,
            SessionEvent::Redirected(_) => SessionState::Redirected,
            SessionEvent::Failed(_) => SessionState::Failed,
            SessionEvent::Terminated => SessionState::Terminated,
            SessionEvent::TimedOut => SessionState::TimedOut,
            SessionEvent::ForcedRemove => SessionState::ForcedRemove,
        }
    }
}

/// A destination counted by call admission control.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Name of the listen point the call leaves through.
    pub network: String,
    pub host: String,
    pub port: u16,
    pub transport: TransportType,
}

impl Endpoint {
    pub fn new(network: impl Into<String>, host: impl Into<String>, port: u16, transport: TransportType) -> Self {
        Self {
            network: network.into(),
            host: host.into(),
            port,
            transport,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.network, self.host, self.port, self.transport)
    }
}

/// The state of one call.
#[derive(Debug, Clone)]
pub struct SipSession {
    call_id: String,
    caller: String,
    callee: String,
    state: SessionState,
    reason: Option<String>,
    last_destination: Option<Endpoint>,
    history: Vec<String>,
    setup_time: DateTime<Utc>,
    expires_at: Instant,
    license_exceeded: bool,
}

impl SipSession {
    pub fn new(call_id: &str, caller: &str, callee: &str, timeout: Duration) -> Self {
        let setup_time = Utc::now();

        Self {
            call_id: sanitize(call_id),
            caller: sanitize(caller),
            callee: sanitize(callee),
            state: SessionState::Initial,
            reason: None,
            last_destination: None,
            history: vec![sanitize(&format!("{SESSION_CREATED}{setup_time}"))],
            setup_time,
            expires_at: Instant::now() + timeout,
            license_exceeded: false,
        }
    }

    /// A session for the call `request` starts.
    pub fn from_request(request: &Request, timeout: Duration) -> Result<Self> {
        let headers = &request.headers;
        let call_id = headers
            .call_id()
            .ok_or(Error::MissingRequiredHeader("Call-ID"))?;
        let caller = headers
            .get(&HeaderName::From)
            .map(|from| from.value().to_string())
            .unwrap_or_default();

        Ok(Self::new(
            &call_id.to_string(),
            &caller,
            &request.uri().to_string(),
            timeout,
        ))
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn caller(&self) -> &str {
        &self.caller
    }

    pub fn callee(&self) -> &str {
        &self.callee
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }

    pub fn setup_time(&self) -> DateTime<Utc> {
        self.setup_time
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn last_destination(&self) -> Option<&Endpoint> {
        self.last_destination.as_ref()
    }

    /// Moves the session to the state of `event`.
    ///
    /// The session is left untouched when the transition is illegal.
    pub fn apply(&mut self, event: SessionEvent) -> std::result::Result<(), SessionStateError> {
        let target = event.target();
        if self.state.is_terminal() && target != SessionState::ForcedRemove {
            return Err(SessionStateError::Closed);
        }
        if !self.state.can_become(target) {
            return Err(SessionStateError::IllegalTransition {
                from: self.state,
                to: target,
            });
        }

        let entry = match event {
            SessionEvent::Provisional(code) => format!("{SESSION_PROVISIONAL}{}", code.as_u16()),
            SessionEvent::Accepted(code) => format!("{SESSION_ACCEPTED}{}", code.as_u16()),
            SessionEvent::Redirected(code) => format!("{SESSION_REDIRECTED}{}", code.as_u16()),
            SessionEvent::Failed(reason) if self.license_exceeded => {
                self.reason = Some(LICENSE_EXCEEDED.to_string());
                format!("{SESSION_FAILED}{reason} ({LICENSE_EXCEEDED})")
            }
            SessionEvent::Failed(reason) => {
                let entry = format!("{SESSION_FAILED}{reason}");
                self.reason = Some(reason);
                entry
            }
            SessionEvent::Terminated => format!("{SESSION_TERMINATED}{}", Utc::now()),
            SessionEvent::TimedOut => {
                self.reason = Some(SESSION_TIMEOUT.to_string());
                format!("{SESSION_TIMED_OUT}{}", Utc::now())
            }
            SessionEvent::ForcedRemove => {
                self.reason = Some(SESSION_FORCED_REMOVE.to_string());
                SESSION_FORCED_REMOVE.to_string()
            }
        };
        log::trace!("Session {} {} -> {}", self.call_id, self.state, target);
        self.state = target;
        self.push_history(entry);

        Ok(())
    }

    pub fn provisional(&mut self, code: StatusCode) -> std::result::Result<(), SessionStateError> {
        self.apply(SessionEvent::Provisional(code))
    }

    pub fn accepted(&mut self, code: StatusCode) -> std::result::Result<(), SessionStateError> {
        self.apply(SessionEvent::Accepted(code))
    }

    pub fn redirected(&mut self, code: StatusCode) -> std::result::Result<(), SessionStateError> {
        self.apply(SessionEvent::Redirected(code))
    }

    pub fn failed(&mut self, reason: impl Into<String>) -> std::result::Result<(), SessionStateError> {
        self.apply(SessionEvent::Failed(reason.into()))
    }

    pub fn terminated(&mut self) -> std::result::Result<(), SessionStateError> {
        self.apply(SessionEvent::Terminated)
    }

    pub fn timed_out(&mut self) -> std::result::Result<(), SessionStateError> {
        self.apply(SessionEvent::TimedOut)
    }

    pub fn forced_remove(&mut self) {
        // ForcedRemove is legal from every state.
        let _ = self.apply(SessionEvent::ForcedRemove);
    }

    /// Marks the call as refused for lack of capacity, reported by the
    /// next failure.
    pub fn license_failure(&mut self) {
        self.license_exceeded = true;
    }

    pub fn set_server_group(&mut self, server_group: &str) {
        self.push_history(format!("{SERVER_GROUP}{server_group}"));
    }

    pub fn set_route_policy(&mut self, route_policy: &str) {
        self.push_history(format!("{ROUTE_POLICY}{route_policy}"));
    }

    pub fn set_route(&mut self, route: &str) {
        self.push_history(format!("{ROUTE}{route}"));
    }

    /// A request of the call went through, the deadline moves.
    pub fn activity(&mut self, method: &Method, timeout: Duration) {
        self.push_history(format!("{SESSION_ACTIVITY}{method}"));
        self.touch(timeout);
    }

    pub fn touch(&mut self, timeout: Duration) {
        self.expires_at = Instant::now() + timeout;
    }

    fn set_destination(&mut self, destination: Endpoint) -> Option<Endpoint> {
        self.push_history(format!("{DESTINATION}{destination}"));
        self.last_destination.replace(destination)
    }

    fn push_history(&mut self, entry: String) {
        self.history.push(sanitize(&entry));
    }
}

fn sanitize(value: &str) -> String {
    match value.char_indices().nth(MAX_STR_LEN) {
        Some((end, _)) => value[..end].to_string(),
        None => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SipSession {
        SipSession::new("a84b4c76e66710", "<sip:bob@biloxi.com>;tag=1", "sip:alice@example.com", Duration::from_secs(300))
    }

    #[test]
    fn test_call_flow_history() {
        let mut session = session();

        session.provisional(StatusCode::RINGING).unwrap();
        session.provisional(StatusCode::new(183).unwrap()).unwrap();
        session.accepted(StatusCode::OK).unwrap();
        session.terminated().unwrap();

        assert_eq!(session.state(), SessionState::Terminated);
        let history = session.history();
        assert!(history[0].starts_with("Created at "));
        assert_eq!(history[1], "Provisional, response=180");
        assert_eq!(history[3], "Accepted, response=200");
        assert!(history[4].starts_with("Terminated at "));
    }

    #[test]
    fn test_accepted_twice_is_illegal() {
        let mut session = session();
        session.accepted(StatusCode::OK).unwrap();

        assert_matches!(
            session.accepted(StatusCode::OK),
            Err(SessionStateError::IllegalTransition {
                from: SessionState::Accepted,
                to: SessionState::Accepted
            })
        );
        assert_eq!(session.history().len(), 2);
    }

    #[test]
    fn test_closed_session_rejects_transitions() {
        let mut session = session();
        session.failed("486").unwrap();

        assert_matches!(session.timed_out(), Err(SessionStateError::Closed));
        assert_matches!(session.provisional(StatusCode::RINGING), Err(SessionStateError::Closed));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(session.reason(), Some("486"));
    }

    #[test]
    fn test_illegal_transitions_leave_state() {
        let mut session = session();
        assert_matches!(session.terminated(), Err(SessionStateError::IllegalTransition { .. }));

        session.accepted(StatusCode::OK).unwrap();
        assert_matches!(session.failed("500"), Err(SessionStateError::IllegalTransition { .. }));
        assert_matches!(
            session.redirected(StatusCode::MOVED_TEMPORARILY),
            Err(SessionStateError::IllegalTransition { .. })
        );
        assert_eq!(session.state(), SessionState::Accepted);

        session.timed_out().unwrap();
        assert_eq!(session.reason(), Some(SESSION_TIMEOUT));
    }

    #[test]
    fn test_forced_remove_always_legal() {
        let mut session = session();
        session.failed("503").unwrap();
        session.forced_remove();

        assert_eq!(session.state(), SessionState::ForcedRemove);
        assert!(session.state().is_terminal());
        assert_eq!(session.history().last().map(String::as_str), Some(SESSION_FORCED_REMOVE));
    }

    #[test]
    fn test_license_failure_reason() {
        let mut session = session();
        session.license_failure();
        session.failed("503").unwrap();

        assert_eq!(session.reason(), Some(LICENSE_EXCEEDED));
        assert_eq!(session.history()[1], "Failed, response=503 (License Exceeded)");
    }

    #[test]
    fn test_long_strings_are_truncated() {
        let long = "x".repeat(2000);
        let mut session = SipSession::new(&long, "", "", Duration::from_secs(300));
        session.set_route(&long);

        assert_eq!(session.call_id().len(), MAX_STR_LEN);
        assert_eq!(session.history()[1].len(), MAX_STR_LEN);
        assert!(session.history()[1].starts_with("Route=x"));
    }
}
