use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use super::{Endpoint, SessionEvent, SessionState, SipSession};
use crate::config::SessionConfig;
use crate::error::{Error, Result, SessionStateError};
use crate::message::{Method, Request};

/// A session shared between the tracker and the call processing.
pub type Session = Arc<Mutex<SipSession>>;

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// The active sessions, by Call-ID and by destination.
pub struct SessionTracker {
    sessions: DashMap<String, Session>,
    by_endpoint: DashMap<Endpoint, HashSet<String>>,
    recent: Mutex<VecDeque<SipSession>>,
    recent_capacity: usize,
    tracking: AtomicBool,
    timeout: Duration,
    total_calls: AtomicU64,
    total_failed: AtomicU64,
    total_timed_out: AtomicU64,
}

impl SessionTracker {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            by_endpoint: DashMap::new(),
            recent: Mutex::new(VecDeque::with_capacity(config.recent_capacity)),
            recent_capacity: config.recent_capacity,
            tracking: AtomicBool::new(config.tracking_enabled),
            timeout: config.timeout(),
            total_calls: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
            total_timed_out: AtomicU64::new(0),
        }
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking.load(Ordering::Relaxed)
    }

    /// Turning tracking on starts counting from scratch.
    pub fn set_tracking(&self, enabled: bool) {
        if enabled && !self.tracking.swap(true, Ordering::Relaxed) {
            self.reset_all_counts();
        } else if !enabled {
            self.tracking.store(false, Ordering::Relaxed);
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Expired sessions are looked for every hour, or every half timeout
    /// when the timeout is shorter.
    pub fn sweep_interval(&self) -> Duration {
        if self.timeout < DEFAULT_SWEEP_INTERVAL {
            self.timeout / 2
        } else {
            DEFAULT_SWEEP_INTERVAL
        }
    }

    /// The session of the call `request` belongs to, created when new.
    pub fn get_or_create(&self, request: &Request) -> Result<Session> {
        let call_id = request
            .headers
            .call_id()
            .ok_or(Error::MissingRequiredHeader("Call-ID"))?
            .to_string();
        if let Some(session) = self.get(&call_id) {
            return Ok(session);
        }

        // Keyed by the whole Call-ID, the session keeps a truncated copy.
        let session = SipSession::from_request(request, self.timeout)?;
        let session = self
            .sessions
            .entry(call_id)
            .or_insert_with(|| {
                if *request.method() != Method::Options {
                    self.total_calls.fetch_add(1, Ordering::Relaxed);
                }
                log::debug!("New SIP session {}", session.call_id());
                Arc::new(Mutex::new(session))
            })
            .clone();

        Ok(session)
    }

    pub fn get(&self, call_id: &str) -> Option<Session> {
        self.sessions.get(call_id).map(|s| s.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Counts the call against `endpoint`, instead of its previous one.
    pub fn set_destination(&self, call_id: &str, endpoint: Endpoint) -> Result<()> {
        let session = self.get(call_id).ok_or(SessionStateError::Closed)?;
        let previous = lock(&session)?.set_destination(endpoint.clone());

        if let Some(previous) = previous.filter(|p| *p != endpoint) {
            self.forget_at(&previous, call_id);
        }
        self.by_endpoint
            .entry(endpoint)
            .or_default()
            .insert(call_id.to_string());

        Ok(())
    }

    /// Applies `event` to the session of `call_id`.
    ///
    /// Finished sessions leave the tracker. An accepted one stays with a
    /// fresh deadline when tracking, and leaves otherwise.
    pub fn transition(&self, call_id: &str, event: SessionEvent) -> Result<SessionState> {
        let session = self.get(call_id).ok_or(SessionStateError::Closed)?;
        let state = {
            let mut session = lock(&session)?;
            if let Err(err) = session.apply(event) {
                log::error!("Session {}: {}", call_id, err);
                return Err(err.into());
            }
            if session.state() == SessionState::Accepted && self.is_tracking() {
                session.touch(self.timeout);
            }
            session.state()
        };

        if state.is_terminal() || (state == SessionState::Accepted && !self.is_tracking()) {
            self.remove(call_id)?;
        }

        Ok(state)
    }

    /// A request of an established call went through.
    pub fn activity(&self, call_id: &str, method: &Method) -> Result<()> {
        if let Some(session) = self.get(call_id) {
            lock(&session)?.activity(method, self.timeout);
        }
        Ok(())
    }

    /// Marks the session of `call_id` as refused by the call limits.
    pub fn license_failure(&self, call_id: &str) -> Result<()> {
        if let Some(session) = self.get(call_id) {
            lock(&session)?.license_failure();
        }
        Ok(())
    }

    /// Whether a new call may go to `endpoint`.
    pub fn check_active_usage_limit(&self, endpoint: &Endpoint, limit: usize) -> bool {
        !self.is_tracking() || self.active_count(endpoint) < limit
    }

    pub fn active_count(&self, endpoint: &Endpoint) -> usize {
        self.by_endpoint.get(endpoint).map_or(0, |calls| calls.len())
    }

    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::Relaxed)
    }

    pub fn total_failed(&self) -> u64 {
        self.total_failed.load(Ordering::Relaxed)
    }

    pub fn total_timed_out(&self) -> u64 {
        self.total_timed_out.load(Ordering::Relaxed)
    }

    /// Recently finished sessions, oldest first.
    pub fn recent(&self) -> Result<Vec<SipSession>> {
        let recent = self.recent.lock().map_err(|_| Error::PoisonedLock)?;
        Ok(recent.iter().cloned().collect())
    }

    /// Times out the sessions past their deadline.
    pub fn expire(&self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().lock().is_ok_and(|s| s.expires_at() <= now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut count = 0;
        for call_id in expired {
            match self.transition(&call_id, SessionEvent::TimedOut) {
                Ok(_) => count += 1,
                Err(err) => log::warn!("Failed to expire session {}: {}", call_id, err),
            }
        }
        count
    }

    /// Force removes every active session.
    pub fn reset_active_sessions(&self) {
        let call_ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for call_id in call_ids {
            if let Err(err) = self.transition(&call_id, SessionEvent::ForcedRemove) {
                log::warn!("Failed to remove session {}: {}", call_id, err);
            }
        }
    }

    pub fn reset_all_counts(&self) {
        self.reset_active_sessions();
        self.total_calls.store(0, Ordering::Relaxed);
        self.total_failed.store(0, Ordering::Relaxed);
        self.total_timed_out.store(0, Ordering::Relaxed);
    }

    pub fn spawn_sweeper(self: Arc<Self>) -> JoinHandle<()> {
        let period = self.sweep_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                let expired = self.expire(Instant::now());
                if expired > 0 {
                    log::info!("{} SIP sessions timed out", expired);
                }
            }
        })
    }

    fn remove(&self, call_id: &str) -> Result<()> {
        let Some((_, session)) = self.sessions.remove(call_id) else {
            return Ok(());
        };
        let session = lock(&session)?.clone();
        if let Some(endpoint) = session.last_destination() {
            self.forget_at(endpoint, call_id);
        }
        match session.state() {
            SessionState::Failed => self.total_failed.fetch_add(1, Ordering::Relaxed),
            SessionState::TimedOut => self.total_timed_out.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
        log::debug!("Removed SIP session {} ({})", session.call_id(), session.state());

        if self.recent_capacity > 0 {
            let mut recent = self.recent.lock().map_err(|_| Error::PoisonedLock)?;
            if recent.len() == self.recent_capacity {
                recent.pop_front();
            }
            recent.push_back(session);
        }

        Ok(())
    }

    fn forget_at(&self, endpoint: &Endpoint, call_id: &str) {
        self.by_endpoint.remove_if_mut(endpoint, |_, calls| {
            calls.remove(call_id);
            calls.is_empty()
        });
    }
}

fn lock(session: &Session) -> Result<std::sync::MutexGuard<'_, SipSession>> {
    session.lock().map_err(|_| Error::PoisonedLock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Header, HeaderName, StatusCode, Uri};
    use crate::transport::TransportType;

    fn request(method: Method, call_id: &str) -> Request {
        let uri: Uri = "sip:alice@example.com".parse().unwrap();
        let mut request = Request::new(method, uri);
        request
            .headers
            .push(Header::new(HeaderName::From, "<sip:bob@biloxi.com>;tag=a6c85cf".into()));
        request
            .headers
            .push(Header::new(HeaderName::CallId, call_id.to_string().into()));
        request
    }

    fn tracker(tracking: bool) -> SessionTracker {
        SessionTracker::new(&SessionConfig {
            tracking_enabled: tracking,
            timeout_minutes: 10,
            recent_capacity: 2,
        })
    }

    fn sbc() -> Endpoint {
        Endpoint::new("default", "10.0.0.1", 5060, TransportType::Udp)
    }

    #[test]
    fn test_call_admission_limit() {
        let tracker = tracker(true);
        for n in 0..2 {
            let call_id = format!("call-{n}");
            tracker.get_or_create(&request(Method::Invite, &call_id)).unwrap();
            assert!(tracker.check_active_usage_limit(&sbc(), 2));
            tracker.set_destination(&call_id, sbc()).unwrap();
        }

        assert_eq!(tracker.active_count(&sbc()), 2);
        assert!(!tracker.check_active_usage_limit(&sbc(), 2));

        tracker.transition("call-0", SessionEvent::Failed("486".into())).unwrap();
        assert_eq!(tracker.active_count(&sbc()), 1);
        assert!(tracker.check_active_usage_limit(&sbc(), 2));
        assert_eq!(tracker.total_failed(), 1);
        assert_eq!(tracker.total_calls(), 2);
    }

    #[test]
    fn test_untracked_admits_everything() {
        let tracker = tracker(false);
        tracker.get_or_create(&request(Method::Invite, "call-1")).unwrap();
        tracker.set_destination("call-1", sbc()).unwrap();

        assert!(tracker.check_active_usage_limit(&sbc(), 0));

        let state = tracker.transition("call-1", SessionEvent::Accepted(StatusCode::OK)).unwrap();
        assert_eq!(state, SessionState::Accepted);
        assert!(tracker.get("call-1").is_none());
    }

    #[test]
    fn test_accepted_stays_when_tracking() {
        let tracker = tracker(true);
        tracker.get_or_create(&request(Method::Invite, "call-1")).unwrap();

        tracker.transition("call-1", SessionEvent::Accepted(StatusCode::OK)).unwrap();
        assert!(tracker.get("call-1").is_some());

        let err = tracker.transition("call-1", SessionEvent::Accepted(StatusCode::OK));
        assert_matches!(err, Err(Error::SessionState(SessionStateError::IllegalTransition { .. })));

        tracker.transition("call-1", SessionEvent::Terminated).unwrap();
        assert!(tracker.is_empty());
        assert_matches!(
            tracker.transition("call-1", SessionEvent::Terminated),
            Err(Error::SessionState(SessionStateError::Closed))
        );
    }

    #[test]
    fn test_failover_moves_destination() {
        let tracker = tracker(true);
        let other = Endpoint::new("default", "10.0.0.2", 5060, TransportType::Udp);
        tracker.get_or_create(&request(Method::Invite, "call-1")).unwrap();

        tracker.set_destination("call-1", sbc()).unwrap();
        tracker.set_destination("call-1", other.clone()).unwrap();

        assert_eq!(tracker.active_count(&sbc()), 0);
        assert_eq!(tracker.active_count(&other), 1);
    }

    #[test]
    fn test_long_call_id() {
        let tracker = tracker(true);
        let call_id = "c".repeat(600);
        tracker.get_or_create(&request(Method::Invite, &call_id)).unwrap();

        assert!(tracker.get(&call_id).is_some());
        tracker.set_destination(&call_id, sbc()).unwrap();
        assert_eq!(tracker.active_count(&sbc()), 1);

        tracker.transition(&call_id, SessionEvent::Failed("486".into())).unwrap();
        assert!(tracker.is_empty());
        assert_eq!(tracker.active_count(&sbc()), 0);
    }

    #[test]
    fn test_options_not_counted() {
        let tracker = tracker(true);
        tracker.get_or_create(&request(Method::Options, "ping")).unwrap();
        tracker.get_or_create(&request(Method::Invite, "call-1")).unwrap();
        tracker.get_or_create(&request(Method::Invite, "call-1")).unwrap();

        assert_eq!(tracker.total_calls(), 1);
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn test_recent_sessions_bounded() {
        let tracker = tracker(true);
        for n in 0..3 {
            let call_id = format!("call-{n}");
            tracker.get_or_create(&request(Method::Invite, &call_id)).unwrap();
        }
        tracker.reset_active_sessions();

        let recent = tracker.recent().unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent.iter().all(|s| s.state() == SessionState::ForcedRemove));
        assert!(tracker.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_times_out_sessions() {
        let tracker = Arc::new(tracker(true));
        assert_eq!(tracker.sweep_interval(), Duration::from_secs(300));
        tracker.get_or_create(&request(Method::Invite, "call-1")).unwrap();
        let sweeper = tracker.clone().spawn_sweeper();

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(tracker.len(), 1);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(tracker.is_empty());
        assert_eq!(tracker.total_timed_out(), 1);
        sweeper.abort();
    }
}
