use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

use super::store::TokenStore;
use super::types::{SessionInvalidHook, Tokens, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};
use crate::error::{ClientError, Result, SessionInvalidReason};

type RefreshOutcome = std::result::Result<String, SessionInvalidReason>;

/// Shared session state
///
/// Owns the credential store, the refresh-in-progress flag and the FIFO queue
/// of requests waiting on the in-flight refresh. All three are only touched
/// while `state` is locked, so at most one refresh exchange can be in flight
/// no matter how many tasks hit a 401 at once.
pub struct Session {
    /// Persisted credentials
    store: Arc<dyn TokenStore>,

    /// Refresh flag and pending queue
    state: Mutex<RefreshState>,

    /// Host reaction to an unrecoverable session
    on_invalid: Option<SessionInvalidHook>,

    /// Upper bound for the refresh exchange and for waiting on it
    refresh_timeout: Option<Duration>,
}

#[derive(Default)]
struct RefreshState {
    in_progress: bool,
    pending: VecDeque<PendingRequest>,
    next_ticket: u64,
}

/// A request parked until the in-flight refresh settles
struct PendingRequest {
    ticket: u64,
    tx: oneshot::Sender<RefreshOutcome>,
}

/// What a request that got a 401 should do next
pub enum RefreshTicket<'a> {
    /// The stored token already changed since the request was sent
    Replay(String),

    /// Another request is refreshing, wait for it
    Wait(Waiter),

    /// This request performs the refresh exchange
    Lead(RefreshLease<'a>),
}

/// Handle on a queued pending request
pub struct Waiter {
    ticket: u64,
    rx: oneshot::Receiver<RefreshOutcome>,
}

impl Waiter {
    /// Position of this request in the pending queue
    pub fn ticket(&self) -> u64 {
        self.ticket
    }
}

/// Exclusive right to run the refresh exchange
///
/// Must be settled with [`RefreshLease::succeed`] or [`RefreshLease::fail`].
/// Dropping it unsettled releases the waiters with
/// [`SessionInvalidReason::RefreshAbandoned`] and leaves credentials alone.
pub struct RefreshLease<'a> {
    session: &'a Session,
    refresh_token: String,
    settled: bool,
}

/// Result of a successful refresh
#[derive(Debug)]
pub struct Settlement {
    /// The new access token
    pub access: String,

    /// Tickets of the pending requests released, in release order
    pub released: Vec<u64>,
}

impl Session {
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self {
            store,
            state: Mutex::new(RefreshState::default()),
            on_invalid: None,
            refresh_timeout: None,
        }
    }

    /// Register the session-invalid hook
    pub fn with_invalid_hook(mut self, hook: SessionInvalidHook) -> Self {
        self.on_invalid = Some(hook);
        self
    }

    /// Bound the refresh exchange and the wait for it. `None` waits forever.
    pub fn with_refresh_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    pub fn refresh_timeout(&self) -> Option<Duration> {
        self.refresh_timeout
    }

    fn state(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current access token
    pub fn access_token(&self) -> Result<Option<String>> {
        let _state = self.state();
        Ok(self.store.load(ACCESS_TOKEN_KEY)?)
    }

    /// Current refresh token
    pub fn refresh_token(&self) -> Result<Option<String>> {
        let _state = self.state();
        Ok(self.store.load(REFRESH_TOKEN_KEY)?)
    }

    /// Store a new token pair, keeping the old refresh token if none is given
    pub fn set_tokens(&self, tokens: &Tokens) -> Result<()> {
        let _state = self.state();
        self.save_tokens(tokens)
    }

    /// Remove both tokens
    pub fn clear_tokens(&self) -> Result<()> {
        let _state = self.state();
        self.remove_tokens()
    }

    pub fn is_refreshing(&self) -> bool {
        self.state().in_progress
    }

    /// Number of requests waiting on the in-flight refresh
    pub fn pending_len(&self) -> usize {
        self.state().pending.len()
    }

    fn save_tokens(&self, tokens: &Tokens) -> Result<()> {
        self.store.save(ACCESS_TOKEN_KEY, &tokens.access)?;
        if let Some(ref refresh) = tokens.refresh {
            self.store.save(REFRESH_TOKEN_KEY, refresh)?;
        }
        Ok(())
    }

    fn remove_tokens(&self) -> Result<()> {
        self.store.remove(ACCESS_TOKEN_KEY)?;
        self.store.remove(REFRESH_TOKEN_KEY)?;
        Ok(())
    }

    fn notify_invalid(&self, reason: &SessionInvalidReason) {
        tracing::warn!(reason = %reason, "Session invalidated");
        if let Some(ref hook) = self.on_invalid {
            hook(reason);
        }
    }

    /// Decide how a request that was sent with `sent` and got a 401 recovers
    pub fn on_unauthorized(&self, sent: Option<&str>) -> Result<RefreshTicket<'_>> {
        let mut state = self.state();

        // The stored token may be the expired one being refreshed, so any
        // 401 during a refresh waits for it
        if state.in_progress {
            let (tx, rx) = oneshot::channel();
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.pending.push_back(PendingRequest { ticket, tx });
            tracing::debug!(
                ticket,
                queued = state.pending.len(),
                "Refresh in progress, queueing request"
            );
            return Ok(RefreshTicket::Wait(Waiter { ticket, rx }));
        }

        match (self.store.load(ACCESS_TOKEN_KEY)?, sent) {
            (Some(current), sent) if Some(current.as_str()) != sent => {
                tracing::debug!("Access token changed since request was sent, replaying");
                return Ok(RefreshTicket::Replay(current));
            }
            (None, Some(_)) => {
                tracing::debug!("Session cleared while request was in flight");
                return Err(SessionInvalidReason::SessionCleared.into());
            }
            _ => {}
        }

        match self.store.load(REFRESH_TOKEN_KEY)? {
            Some(refresh_token) => {
                state.in_progress = true;
                Ok(RefreshTicket::Lead(RefreshLease {
                    session: self,
                    refresh_token,
                    settled: false,
                }))
            }
            None => {
                let reason = SessionInvalidReason::MissingRefreshToken;
                if let Err(e) = self.remove_tokens() {
                    tracing::error!("Failed to clear credentials: {}", e);
                }
                drop(state);
                self.notify_invalid(&reason);
                Err(reason.into())
            }
        }
    }

    /// Wait for the in-flight refresh to hand over a token
    pub async fn await_refresh(&self, waiter: Waiter) -> Result<String> {
        let ticket = waiter.ticket;
        let outcome = match self.refresh_timeout {
            Some(limit) => tokio::time::timeout(limit, waiter.rx)
                .await
                .map_err(|_| ClientError::RefreshTimeout(limit))?,
            None => waiter.rx.await,
        };

        match outcome {
            Ok(Ok(token)) => {
                tracing::debug!(ticket, "Pending request resumed with new token");
                Ok(token)
            }
            Ok(Err(reason)) => Err(reason.into()),
            Err(_) => Err(SessionInvalidReason::RefreshAbandoned.into()),
        }
    }

    /// Terminal failure for a request sent with `sent`
    ///
    /// Credentials are cleared and the hook fires only when `sent` is still
    /// the stored token; otherwise another request already moved the session
    /// on and this one just reports the failure.
    pub fn invalidate(&self, sent: Option<&str>, reason: SessionInvalidReason) -> ClientError {
        let state = self.state();
        let current = match self.store.load(ACCESS_TOKEN_KEY) {
            Ok(current) => current,
            Err(e) => {
                tracing::error!("Failed to read credentials: {}", e);
                sent.map(str::to_string)
            }
        };

        if current.as_deref() == sent {
            if let Err(e) = self.remove_tokens() {
                tracing::error!("Failed to clear credentials: {}", e);
            }
            drop(state);
            self.notify_invalid(&reason);
        }

        reason.into()
    }

    /// Clear credentials and fire the hook unconditionally
    pub fn terminate(&self, reason: SessionInvalidReason) -> ClientError {
        let state = self.state();
        if let Err(e) = self.remove_tokens() {
            tracing::error!("Failed to clear credentials: {}", e);
        }
        drop(state);
        self.notify_invalid(&reason);
        reason.into()
    }

    /// Release every pending request with `outcome`, oldest first
    fn drain_pending(state: &mut RefreshState, outcome: &RefreshOutcome) -> Vec<u64> {
        state.in_progress = false;
        state
            .pending
            .drain(..)
            .map(|pending| {
                // A waiter that timed out has dropped its receiver
                let _ = pending.tx.send(outcome.clone());
                pending.ticket
            })
            .collect()
    }

    fn settle_success(&self, tokens: Tokens) -> Result<Settlement> {
        let mut state = self.state();

        if let Err(e) = self.save_tokens(&tokens) {
            let reason = SessionInvalidReason::RefreshFailed(e.to_string());
            Self::drain_pending(&mut state, &Err(reason));
            return Err(e);
        }

        let released = Self::drain_pending(&mut state, &Ok(tokens.access.clone()));
        tracing::info!(
            released = released.len(),
            rotated = tokens.refresh.is_some(),
            "Access token refreshed"
        );

        Ok(Settlement {
            access: tokens.access,
            released,
        })
    }

    fn settle_failure(&self, reason: SessionInvalidReason) -> Vec<u64> {
        let mut state = self.state();
        let rejected = Self::drain_pending(&mut state, &Err(reason.clone()));
        if let Err(e) = self.remove_tokens() {
            tracing::error!("Failed to clear credentials: {}", e);
        }
        drop(state);

        tracing::error!(
            rejected = rejected.len(),
            reason = %reason,
            "Token refresh failed"
        );
        self.notify_invalid(&reason);
        rejected
    }

    fn settle_abandoned(&self) {
        let mut state = self.state();
        let rejected = Self::drain_pending(
            &mut state,
            &Err(SessionInvalidReason::RefreshAbandoned),
        );
        tracing::warn!(rejected = rejected.len(), "Token refresh abandoned");
    }
}

impl RefreshLease<'_> {
    /// Refresh token to send in the exchange
    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }

    /// Store the new tokens and release the queue with the new access token
    pub fn succeed(mut self, tokens: Tokens) -> Result<Settlement> {
        self.settled = true;
        self.session.settle_success(tokens)
    }

    /// Reject the queue, clear credentials and fire the hook once
    pub fn fail(mut self, reason: SessionInvalidReason) -> Vec<u64> {
        self.settled = true;
        self.session.settle_failure(reason)
    }
}

impl Drop for RefreshLease<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.session.settle_abandoned();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::store::MemoryTokenStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn session_with(access: Option<&str>, refresh: Option<&str>) -> Session {
        let store = Arc::new(MemoryTokenStore::new());
        if let Some(a) = access {
            store.save(ACCESS_TOKEN_KEY, a).unwrap();
        }
        if let Some(r) = refresh {
            store.save(REFRESH_TOKEN_KEY, r).unwrap();
        }
        Session::new(store)
    }

    fn counting_hook() -> (SessionInvalidHook, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let hook: SessionInvalidHook = Arc::new(move |_: &SessionInvalidReason| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (hook, count)
    }

    fn expect_lead(ticket: RefreshTicket<'_>) -> RefreshLease<'_> {
        match ticket {
            RefreshTicket::Lead(lease) => lease,
            _ => panic!("expected to lead the refresh"),
        }
    }

    fn expect_wait(ticket: RefreshTicket<'_>) -> Waiter {
        match ticket {
            RefreshTicket::Wait(waiter) => waiter,
            _ => panic!("expected to wait for the refresh"),
        }
    }

    #[tokio::test]
    async fn test_single_leader_and_fifo_release() {
        let session = session_with(Some("A1"), Some("R1"));

        let lease = expect_lead(session.on_unauthorized(Some("A1")).unwrap());
        assert_eq!(lease.refresh_token(), "R1");
        assert!(session.is_refreshing());

        let b = expect_wait(session.on_unauthorized(Some("A1")).unwrap());
        let c = expect_wait(session.on_unauthorized(Some("A1")).unwrap());
        assert_eq!(session.pending_len(), 2);

        let (b_ticket, c_ticket) = (b.ticket(), c.ticket());
        let settlement = lease.succeed(Tokens {
            access: "A2".to_string(),
            refresh: None,
        })
        .unwrap();

        assert_eq!(settlement.access, "A2");
        assert_eq!(settlement.released, vec![b_ticket, c_ticket]);
        assert!(!session.is_refreshing());
        assert_eq!(session.pending_len(), 0);

        assert_eq!(session.await_refresh(b).await.unwrap(), "A2");
        assert_eq!(session.await_refresh(c).await.unwrap(), "A2");
        assert_eq!(session.access_token().unwrap().as_deref(), Some("A2"));
        assert_eq!(session.refresh_token().unwrap().as_deref(), Some("R1"));
    }

    #[tokio::test]
    async fn test_request_with_older_token_waits_during_refresh() {
        let (hook, count) = counting_hook();
        let session = session_with(Some("A1"), Some("R1")).with_invalid_hook(hook);

        let lease = expect_lead(session.on_unauthorized(Some("A1")).unwrap());

        // Sent before A1 was stored; A1 is just as expired, so no replay
        let late = expect_wait(session.on_unauthorized(Some("A0")).unwrap());
        let late_ticket = late.ticket();
        assert_eq!(session.pending_len(), 1);

        let settlement = lease.succeed(Tokens {
            access: "A2".to_string(),
            refresh: None,
        })
        .unwrap();

        assert_eq!(settlement.released, vec![late_ticket]);
        assert_eq!(session.await_refresh(late).await.unwrap(), "A2");
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(session.refresh_token().unwrap().as_deref(), Some("R1"));
    }

    #[test]
    fn test_unauthenticated_request_waits_during_refresh() {
        let session = session_with(Some("A1"), Some("R1"));
        let _lease = expect_lead(session.on_unauthorized(Some("A1")).unwrap());

        expect_wait(session.on_unauthorized(None).unwrap());
        assert_eq!(session.pending_len(), 1);
    }

    #[test]
    fn test_rotated_refresh_token_is_stored() {
        let session = session_with(Some("A1"), Some("R1"));
        let lease = expect_lead(session.on_unauthorized(Some("A1")).unwrap());
        lease.succeed(Tokens::new("A2", "R2")).unwrap();

        assert_eq!(session.refresh_token().unwrap().as_deref(), Some("R2"));
    }

    #[test]
    fn test_replay_when_token_already_changed() {
        let session = session_with(Some("A2"), Some("R1"));
        match session.on_unauthorized(Some("A1")).unwrap() {
            RefreshTicket::Replay(token) => assert_eq!(token, "A2"),
            _ => panic!("expected replay"),
        }
        assert!(!session.is_refreshing());
    }

    #[test]
    fn test_missing_refresh_token_is_terminal() {
        let (hook, count) = counting_hook();
        let session = session_with(Some("A1"), None).with_invalid_hook(hook);

        let err = match session.on_unauthorized(Some("A1")) {
            Err(e) => e,
            Ok(_) => panic!("expected terminal failure"),
        };
        assert!(matches!(
            err,
            ClientError::SessionInvalid(SessionInvalidReason::MissingRefreshToken)
        ));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(session.access_token().unwrap(), None);
        assert!(!session.is_refreshing());
    }

    #[tokio::test]
    async fn test_failure_rejects_queue_and_fires_hook_once() {
        let (hook, count) = counting_hook();
        let session = session_with(Some("A1"), Some("R1")).with_invalid_hook(hook);

        let lease = expect_lead(session.on_unauthorized(Some("A1")).unwrap());
        let b = expect_wait(session.on_unauthorized(Some("A1")).unwrap());
        let c = expect_wait(session.on_unauthorized(Some("A1")).unwrap());

        let rejected = lease.fail(SessionInvalidReason::RefreshRejected);
        assert_eq!(rejected.len(), 2);

        for waiter in [b, c] {
            let err = session.await_refresh(waiter).await.unwrap_err();
            assert!(matches!(
                err,
                ClientError::SessionInvalid(SessionInvalidReason::RefreshRejected)
            ));
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(session.access_token().unwrap(), None);
        assert_eq!(session.refresh_token().unwrap(), None);

        // Stragglers from the old session do not fire the hook again
        let err = match session.on_unauthorized(Some("A1")) {
            Err(e) => e,
            Ok(_) => panic!("expected terminal failure"),
        };
        assert!(matches!(
            err,
            ClientError::SessionInvalid(SessionInvalidReason::SessionCleared)
        ));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_lease_releases_waiters() {
        let (hook, count) = counting_hook();
        let session = session_with(Some("A1"), Some("R1")).with_invalid_hook(hook);

        let lease = expect_lead(session.on_unauthorized(Some("A1")).unwrap());
        let waiter = expect_wait(session.on_unauthorized(Some("A1")).unwrap());
        drop(lease);

        let err = session.await_refresh(waiter).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::SessionInvalid(SessionInvalidReason::RefreshAbandoned)
        ));
        assert!(!session.is_refreshing());
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(session.refresh_token().unwrap().as_deref(), Some("R1"));
    }

    #[tokio::test]
    async fn test_waiter_timeout() {
        let session = session_with(Some("A1"), Some("R1"))
            .with_refresh_timeout(Some(Duration::from_millis(20)));

        let _lease = expect_lead(session.on_unauthorized(Some("A1")).unwrap());
        let waiter = expect_wait(session.on_unauthorized(Some("A1")).unwrap());

        let err = session.await_refresh(waiter).await.unwrap_err();
        assert!(matches!(err, ClientError::RefreshTimeout(_)));
    }

    #[test]
    fn test_invalidate_only_fires_for_current_token() {
        let (hook, count) = counting_hook();
        let session = session_with(Some("A2"), Some("R1")).with_invalid_hook(hook);

        // Stale token: session already moved on
        let err = session.invalidate(Some("A1"), SessionInvalidReason::RetryRejected);
        assert!(err.is_session_invalid());
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(session.access_token().unwrap().as_deref(), Some("A2"));

        session.invalidate(Some("A2"), SessionInvalidReason::RetryRejected);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(session.access_token().unwrap(), None);
    }
}
