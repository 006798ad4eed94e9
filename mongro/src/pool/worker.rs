//! Pool worker task.
//!
//! Owns one server's sockets. All lifecycle transitions happen in this
//! task; handles talk to it over an unbounded channel, so no lock is ever
//! held across a dial or a close. The task exits once every handle is
//! dropped.
use std::{collections::VecDeque, sync::Arc, time::Duration};

use tokio::sync::{
    mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    oneshot,
};

use crate::{
    Connection, Result,
    common::verbose,
    config::{Address, Config},
};

const MAINTAIN_INTERVAL: Duration = Duration::from_secs(10);

pub(super) type AcquireSend = oneshot::Sender<Result<Connection>>;

pub(super) enum PoolMessage {
    Acquire(AcquireSend),
    Release(Connection),
    /// A checked out socket died with its guard.
    Discard,
    /// Bump the generation, closing idle sockets.
    Clear,
}

struct Worker {
    address: Address,
    config: Arc<Config>,
    dial_tx: UnboundedSender<Result<Connection>>,

    /// Front holds the most recently used socket.
    idle: VecDeque<Connection>,
    /// Sockets alive or being dialed, bounded by `max_pool_size`.
    actives: usize,
    connecting: bool,
    generation: u64,
    queue: VecDeque<AcquireSend>,
    next_id: u32,
}

pub(super) async fn run(
    address: Address,
    config: Arc<Config>,
    mut recv: UnboundedReceiver<PoolMessage>,
) {
    let (dial_tx, mut dial_rx) = unbounded_channel();
    let mut worker = Worker {
        address,
        config,
        dial_tx,
        idle: VecDeque::new(),
        actives: 0,
        connecting: false,
        generation: 0,
        queue: VecDeque::new(),
        next_id: 0,
    };
    let mut maintain = tokio::time::interval(MAINTAIN_INTERVAL);
    maintain.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = recv.recv() => {
                let Some(msg) = msg else { break };
                worker.handle(msg);
            }
            result = dial_rx.recv() => {
                // the worker owns a sender, recv cannot fail
                worker.connected(result.unwrap());
            }
            _ = maintain.tick() => {
                worker.prune();
            }
        }
        worker.fulfill();
        worker.maybe_dial();
    }

    for conn in worker.idle.drain(..) {
        tokio::spawn(conn.close());
    }
}

impl Worker {
    fn handle(&mut self, msg: PoolMessage) {
        match msg {
            PoolMessage::Acquire(tx) => {
                self.queue.push_back(tx);
                verbose!(target: "pool", "acquire queued: {}", self.address);
            }
            PoolMessage::Release(conn) => {
                if conn.generation != self.generation || conn.pending_reply {
                    self.close(conn);
                } else {
                    self.idle.push_front(conn);
                }
            }
            PoolMessage::Discard => self.actives -= 1,
            PoolMessage::Clear => {
                self.generation += 1;
                verbose!(target: "pool", "cleared: {} gen={}", self.address, self.generation);
                while let Some(conn) = self.idle.pop_front() {
                    self.close(conn);
                }
            }
        }
    }

    fn connected(&mut self, result: Result<Connection>) {
        self.connecting = false;
        match result {
            Ok(conn) if conn.generation == self.generation => {
                self.idle.push_front(conn);
            }
            // cleared while dialing
            Ok(conn) => self.close(conn),
            Err(err) => {
                self.actives -= 1;
                if let Some(tx) = self.queue.pop_front() {
                    let _ = tx.send(Err(err));
                }
            }
        }
    }

    /// Hand idle sockets to waiters, pruning stale ones on the way.
    fn fulfill(&mut self) {
        while !self.queue.is_empty() {
            let Some(conn) = self.next_idle() else { break };
            let tx = self.queue.pop_front().unwrap();
            if let Err(Ok(conn)) = tx.send(Ok(conn)) {
                // waiter gave up, keep the socket fresh
                self.idle.push_front(conn);
            }
        }
    }

    /// Most recent idle socket that survives the acquisition scan.
    fn next_idle(&mut self) -> Option<Connection> {
        while let Some(conn) = self.idle.pop_front() {
            let stale = self
                .config
                .max_idle_time
                .is_some_and(|max| conn.last_used_at.elapsed() > max);
            if stale {
                self.close(conn);
                continue;
            }
            return Some(conn);
        }
        None
    }

    /// Start one dial when waiters or the floor demand it and capacity
    /// remains.
    fn maybe_dial(&mut self) {
        let wanted = !self.queue.is_empty() || self.actives < self.config.min_pool_size;
        if !wanted || self.connecting || self.actives >= self.config.max_pool_size {
            return;
        }
        self.connecting = true;
        self.actives += 1;
        self.next_id += 1;

        let address = self.address.clone();
        let config = self.config.clone();
        let generation = self.generation;
        let id = self.next_id;
        let send = self.dial_tx.clone();
        tokio::spawn(async move {
            let result = Connection::connect(&address, &config, generation, id).await;
            let _ = send.send(result);
        });
    }

    /// Drop idle sockets past their idle deadline.
    fn prune(&mut self) {
        if let Some(max) = self.config.max_idle_time {
            while let Some(conn) = self.idle.back() {
                if conn.last_used_at.elapsed() <= max {
                    break;
                }
                let conn = self.idle.pop_back().unwrap();
                self.close(conn);
            }
        }
    }

    fn close(&mut self, conn: Connection) {
        self.actives -= 1;
        tokio::spawn(conn.close());
    }
}
