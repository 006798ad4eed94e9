//! Logical sessions.
use std::{
    collections::VecDeque,
    sync::Mutex,
    time::{Duration, Instant},
};

use uuid::Uuid;

use crate::bson::Timestamp;

mod clock;

pub use clock::{ClusterClock, ClusterTime};

/// Sessions within a minute of the server timeout are not reused.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Most lsids one `endSessions` command may carry.
const END_SESSIONS_BATCH: usize = 10_000;

/// A logical session identity.
///
/// Implicit sessions are checked out silently per operation and returned
/// on completion; explicit ones live as long as the caller keeps them.
#[derive(Debug)]
pub struct Session {
    lsid: Uuid,
    last_use: Instant,
    txn_number: i64,
    operation_time: Option<Timestamp>,
    implicit: bool,
    causal_consistency: bool,
}

impl Session {
    fn fresh(implicit: bool) -> Session {
        Session {
            lsid: Uuid::new_v4(),
            last_use: Instant::now(),
            txn_number: 0,
            operation_time: None,
            implicit,
            causal_consistency: false,
        }
    }

    pub fn lsid(&self) -> Uuid {
        self.lsid
    }

    pub fn is_implicit(&self) -> bool {
        self.implicit
    }

    /// Turn on causal consistency: reads carry `afterClusterTime` from
    /// the session's operation time.
    pub fn set_causal_consistency(&mut self, value: bool) {
        self.causal_consistency = value;
    }

    pub fn causal_consistency(&self) -> bool {
        self.causal_consistency
    }

    pub fn operation_time(&self) -> Option<Timestamp> {
        self.operation_time
    }

    /// Advance the session's operation time from a reply.
    pub(crate) fn advance_operation_time(&mut self, observed: Timestamp) {
        if self.operation_time.is_none_or(|current| current < observed) {
            self.operation_time = Some(observed);
        }
    }

    /// Transaction number for one retryable write, incremented once per
    /// logical write regardless of retry attempts.
    pub(crate) fn next_txn_number(&mut self) -> i64 {
        self.txn_number += 1;
        self.txn_number
    }

    pub(crate) fn touch(&mut self) {
        self.last_use = Instant::now();
    }
}

/// Pool of reusable server sessions.
///
/// Check-out prefers the most recently used session that still has more
/// than a minute of life; check-in returns to the front. Discarded ids
/// accumulate for a batched `endSessions`.
#[derive(Debug, Default)]
pub struct SessionPool {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    idle: VecDeque<Session>,
    ended: Vec<Uuid>,
}

impl SessionPool {
    pub fn new() -> SessionPool {
        SessionPool::default()
    }

    /// Check out a session, discarding ones too close to expiry.
    ///
    /// `timeout_minutes` is the deployment's advertised session lifetime;
    /// `None` means sessions are unsupported and a throwaway identity is
    /// returned.
    pub fn checkout(&self, timeout_minutes: Option<i64>, implicit: bool) -> Session {
        let mut inner = self.inner.lock().unwrap();
        if let Some(timeout) = timeout_minutes {
            let timeout = Duration::from_secs(timeout.max(1) as u64 * 60);
            let budget = timeout.saturating_sub(EXPIRY_MARGIN);
            while let Some(session) = inner.idle.pop_front() {
                if session.last_use.elapsed() < budget {
                    let mut session = session;
                    session.implicit = implicit;
                    session.causal_consistency = false;
                    return session;
                }
                inner.ended.push(session.lsid);
            }
        }
        Session::fresh(implicit)
    }

    /// Return a session for reuse.
    pub fn checkin(&self, mut session: Session) {
        session.touch();
        self.inner.lock().unwrap().idle.push_front(session);
    }

    /// Drain ended ids, at most one `endSessions` batch.
    pub fn drain_ended(&self) -> Vec<Uuid> {
        let mut inner = self.inner.lock().unwrap();
        let take = inner.ended.len().min(END_SESSIONS_BATCH);
        inner.ended.drain(..take).collect()
    }

    /// Move every idle session to the ended list, for client close.
    pub fn drain_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        let ids = inner.idle.drain(..).map(|s| s.lsid).collect::<Vec<_>>();
        inner.ended.extend(ids);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn checkout_reuses_most_recent() {
        let pool = SessionPool::new();
        let a = pool.checkout(Some(30), true);
        let b = pool.checkout(Some(30), true);
        let (a_id, b_id) = (a.lsid(), b.lsid());
        assert_ne!(a_id, b_id);

        pool.checkin(a);
        pool.checkin(b);
        // b went in last, comes out first
        assert_eq!(pool.checkout(Some(30), true).lsid(), b_id);
        assert_eq!(pool.checkout(Some(30), true).lsid(), a_id);
    }

    #[test]
    fn expired_sessions_are_ended_not_reused() {
        let pool = SessionPool::new();
        let session = pool.checkout(Some(30), true);
        let id = session.lsid();
        pool.checkin(session);

        // a one minute lifetime leaves no budget after the expiry margin
        assert_ne!(pool.checkout(Some(1), true).lsid(), id);
        assert_eq!(pool.drain_ended(), [id]);
    }

    #[test]
    fn txn_number_increments_once_per_write() {
        let mut session = Session::fresh(false);
        assert_eq!(session.next_txn_number(), 1);
        assert_eq!(session.next_txn_number(), 2);
    }

    #[test]
    fn operation_time_is_monotone() {
        let mut session = Session::fresh(false);
        session.advance_operation_time(Timestamp { time: 5, increment: 0 });
        session.advance_operation_time(Timestamp { time: 3, increment: 0 });
        assert_eq!(session.operation_time(), Some(Timestamp { time: 5, increment: 0 }));
    }
}
