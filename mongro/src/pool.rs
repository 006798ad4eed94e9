//! Per-server connection pooling.
use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc::UnboundedSender, oneshot},
    time::Instant,
};

use crate::{Connection, Error, Result, config::Address, config::Config};

mod worker;

/// Handle to one server's pool.
///
/// Cheap to clone; the owning worker task exits when every handle is gone.
#[derive(Clone, Debug)]
pub struct Pool {
    send: UnboundedSender<worker::PoolMessage>,
}

impl Pool {
    /// Spawn the pool worker for `address`.
    pub(crate) fn new(address: Address, config: Arc<Config>) -> Pool {
        let (send, recv) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(worker::run(address, config, recv));
        Pool { send }
    }

    /// Check out a connection before `deadline`.
    ///
    /// An idle socket is reused when its generation and idle time allow;
    /// otherwise a dial starts if capacity remains, else the caller queues
    /// for the next release. Expiry fails with pool timeout.
    pub(crate) async fn acquire(&self, deadline: Option<Instant>) -> Result<PooledConnection> {
        let (tx, rx) = oneshot::channel();
        if self.send.send(worker::PoolMessage::Acquire(tx)).is_err() {
            return Err(Error::pool_timeout());
        }

        let conn = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, rx).await {
                Ok(result) => result,
                Err(_) => return Err(Error::pool_timeout()),
            },
            None => rx.await,
        };

        match conn {
            Ok(Ok(conn)) => Ok(PooledConnection { conn: Some(conn), pool: self.clone() }),
            Ok(Err(err)) => Err(err),
            // worker dropped the sender without replying
            Err(_) => Err(Error::pool_timeout()),
        }
    }

    /// Acquire with the configured wait queue timeout.
    pub(crate) async fn acquire_default(&self, wait_queue_timeout: Duration) -> Result<PooledConnection> {
        self.acquire(Some(Instant::now() + wait_queue_timeout)).await
    }

    /// Bump the pool generation: idle sockets close, in-use sockets are
    /// discarded on release.
    pub(crate) fn clear(&self) {
        let _ = self.send.send(worker::PoolMessage::Clear);
    }

    fn release(&self, conn: Connection) {
        let _ = self.send.send(worker::PoolMessage::Release(conn));
    }

    fn discard(&self) {
        let _ = self.send.send(worker::PoolMessage::Discard);
    }
}

/// A checked out connection.
///
/// Dropping the guard without [`release`][PooledConnection::release]
/// counts the socket as dead: a cancelled operation must not hand a
/// half-used socket back to the queue.
#[derive(Debug)]
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Pool,
}

impl PooledConnection {
    /// Return the socket to the pool after a clean exchange.
    pub(crate) fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection taken")
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection taken")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.conn.take().is_some() {
            // socket drops closed; the worker only needs the count back
            self.pool.discard();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Acquire against a dead address: every caller gets an error or a
    /// pool timeout within its deadline, never a hang.
    #[tokio::test(start_paused = true)]
    async fn acquire_deadline_on_dead_server() {
        let config = Arc::new(Config::default().set_max_pool_size(2));
        let pool = Pool::new(Address::new("192.0.2.1", 27017), config);

        let result = pool
            .acquire(Some(Instant::now() + Duration::from_millis(50)))
            .await;
        assert!(result.is_err());
    }

    /// `maxPoolSize` bounds concurrent dial attempts: a third acquirer
    /// queues instead of dialing and times out on deadline.
    #[tokio::test(start_paused = true)]
    async fn waiters_time_out() {
        let config = Arc::new(Config::default().set_max_pool_size(1));
        let pool = Pool::new(Address::new("192.0.2.1", 27017), config);

        let mut waiters = tokio::task::JoinSet::new();
        for _ in 0..4 {
            let pool = pool.clone();
            waiters.spawn(async move {
                pool.acquire(Some(Instant::now() + Duration::from_millis(20))).await
            });
        }
        while let Some(result) = waiters.join_next().await {
            assert!(result.unwrap().is_err());
        }
    }
}
