//! Per-server monitoring task.
//!
//! Each known address gets its own task and a dedicated socket, never
//! shared with the operation pools. The task re-checks on a heartbeat
//! cadence, or immediately on request, and switches to awaitable hello
//! streaming when the server advertises a topology version.
use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{sync::Notify, time::Instant};

use crate::{
    Connection, Result,
    bson::{Document, doc},
    common::verbose,
    config::{Address, Config},
    connection::HelloResponse,
    wire::OpMsg,
};

use super::{Shared, Topology, description::ServerDescription, select::MIN_HEARTBEAT_FREQUENCY};

/// Cap on one non-awaited check round trip.
const CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Server-side wait of a streamed hello.
const STREAM_AWAIT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub(super) struct MonitorHandle {
    request: Arc<Notify>,
    stopped: Arc<AtomicBool>,
}

impl MonitorHandle {
    pub(super) fn request_check(&self) {
        self.request.notify_one();
    }

    pub(super) fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        self.request.notify_one();
    }
}

pub(super) fn spawn(address: Address, config: Arc<Config>, shared: Weak<Shared>) -> MonitorHandle {
    let request = Arc::new(Notify::new());
    let stopped = Arc::new(AtomicBool::new(false));
    tokio::spawn(run(address, config, shared, request.clone(), stopped.clone()));
    MonitorHandle { request, stopped }
}

struct Monitor {
    address: Address,
    config: Arc<Config>,
    conn: Option<Connection>,
    topology_version: Option<Document>,
    previous_rtt: Option<Duration>,
}

async fn run(
    address: Address,
    config: Arc<Config>,
    shared: Weak<Shared>,
    request: Arc<Notify>,
    stopped: Arc<AtomicBool>,
) {
    let mut monitor = Monitor {
        address,
        config,
        conn: None,
        topology_version: None,
        previous_rtt: None,
    };

    loop {
        if stopped.load(Ordering::Relaxed) {
            break;
        }

        let started = Instant::now();
        let streamed = monitor.topology_version.is_some();
        let result = monitor.check().await;

        let Some(shared) = shared.upgrade() else { break };
        let topology = Topology::from_shared(shared);
        match result {
            Ok(hello) => {
                if let Some(cluster_time) = &hello.cluster_time {
                    topology.clock().advance_raw(cluster_time);
                }
                // an awaited reply measures server wait, not the wire
                let sample = match streamed {
                    true => monitor.previous_rtt.unwrap_or_else(|| started.elapsed()),
                    false => started.elapsed(),
                };
                let desc = ServerDescription::from_hello(
                    monitor.address.clone(),
                    &hello,
                    sample,
                    monitor.previous_rtt,
                );
                monitor.previous_rtt = desc.average_rtt;
                verbose!(target: "monitor", "checked {}: {:?}", monitor.address, desc.kind);
                topology.apply(desc);
            }
            Err(err) => {
                monitor.conn = None;
                monitor.topology_version = None;
                monitor.previous_rtt = None;
                topology.mark_unknown(monitor.address.clone(), err.to_string());
            }
        }
        drop(topology);

        if monitor.topology_version.is_some() {
            // streaming mode: the next hello blocks server-side, change
            // latency is one round trip
            continue;
        }

        let heartbeat = monitor.config.heartbeat_frequency;
        tokio::select! {
            _ = tokio::time::sleep(heartbeat) => {}
            _ = request.notified() => {
                // a requested check still honors the floor
                let elapsed = started.elapsed();
                if elapsed < MIN_HEARTBEAT_FREQUENCY {
                    tokio::time::sleep(MIN_HEARTBEAT_FREQUENCY - elapsed).await;
                }
            }
        }
    }
}

impl Monitor {
    /// One check: dial on a fresh socket, or re-issue hello on the held
    /// one, awaitable when the server streams.
    async fn check(&mut self) -> Result<HelloResponse> {
        match &mut self.conn {
            None => {
                let dial = Connection::dial(&self.address, &self.config, 0, 0);
                let (conn, hello) = tokio::time::timeout(CHECK_TIMEOUT, dial)
                    .await
                    .map_err(|_| crate::Error::timeout())??;
                self.conn = Some(conn);
                self.topology_version = hello.topology_version.clone();
                Ok(hello)
            }
            Some(conn) => {
                let mut cmd = doc! { "hello": 1, "$db": "admin" };
                let mut budget = CHECK_TIMEOUT;
                if let Some(tv) = &self.topology_version {
                    cmd.insert("topologyVersion", tv.clone());
                    cmd.insert("maxAwaitTimeMS", STREAM_AWAIT.as_millis() as i64);
                    budget += STREAM_AWAIT;
                }

                let round_trip = conn.round_trip_plain(OpMsg::new(cmd.to_bytes()?));
                let reply = tokio::time::timeout(budget, round_trip)
                    .await
                    .map_err(|_| crate::Error::timeout())??;
                let hello = HelloResponse::parse(&reply.document()?);
                self.topology_version = hello.topology_version.clone();
                Ok(hello)
            }
        }
    }
}
