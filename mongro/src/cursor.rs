//! Server-side cursor streaming.
use std::{
    collections::VecDeque,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures_core::Stream;

use crate::{
    Error, Result,
    bson::{Document, doc},
    command::{self, Operation},
    config::Address,
    dispatch::{self, Reply},
    session::{Session, SessionPool},
    topology::{Topology, select::Criteria, select::ReadPreference},
};

type GetMoreFuture =
    Pin<Box<dyn Future<Output = (Option<Session>, Result<Batch>)> + Send + 'static>>;

struct Batch {
    id: i64,
    documents: VecDeque<Document>,
}

/// A streaming result set.
///
/// Batches come from the server that answered the initial command; every
/// continuation is pinned there, holding the session the command ran
/// under. A tailable-await cursor blocks server side up to
/// `maxAwaitTimeMS` per continuation, so an empty poll costs one round
/// trip, not a busy loop.
#[must_use = "streams do nothing unless polled"]
pub struct Cursor {
    topology: Topology,
    sessions: Arc<SessionPool>,
    db: String,
    collection: String,
    address: Address,
    id: i64,
    batch: VecDeque<Document>,
    batch_size: Option<i32>,
    max_await_time: Option<Duration>,
    session: Option<Session>,
    closed: bool,
    pending: Option<GetMoreFuture>,
}

impl Cursor {
    /// Build from an initial reply carrying `{cursor: {id, ns, firstBatch}}`.
    pub(crate) fn new(
        topology: Topology,
        sessions: Arc<SessionPool>,
        reply: &Reply,
        address: Address,
        session: Option<Session>,
        batch_size: Option<i32>,
        max_await_time: Option<Duration>,
    ) -> Result<Cursor> {
        let cursor = reply
            .doc
            .get_document("cursor")
            .ok_or_else(|| Error::cursor_closed())?;
        let id = cursor.get_int("id").unwrap_or_default();
        let namespace = cursor.get_str("ns").unwrap_or_default();
        let (db, collection) = namespace.split_once('.').unwrap_or((namespace, ""));
        let batch = cursor
            .get_array("firstBatch")
            .or_else(|| cursor.get_array("nextBatch"))
            .unwrap_or_default()
            .iter()
            .filter_map(|item| item.as_document().cloned())
            .collect();

        Ok(Cursor {
            topology,
            sessions,
            db: db.into(),
            collection: collection.into(),
            address,
            id,
            batch,
            batch_size,
            max_await_time,
            session,
            closed: false,
            pending: None,
        })
    }

    /// Server-side cursor id; `0` once the server exhausted it.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Next document, end of iteration, or failure.
    pub async fn next(&mut self) -> Option<Result<Document>> {
        std::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }

    /// Collect the remainder.
    pub async fn try_collect(mut self) -> Result<Vec<Document>> {
        let mut out = Vec::new();
        while let Some(doc) = self.next().await {
            out.push(doc?);
        }
        Ok(out)
    }

    /// Release the cursor.
    ///
    /// Sends a best-effort `killCursors` when server state remains;
    /// closing twice is a no-op.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pending = None;

        if self.id != 0 {
            kill_cursors(
                &self.topology,
                &self.address,
                &self.db,
                &self.collection,
                self.id,
                self.session.as_ref(),
            )
            .await;
            self.id = 0;
        }
        if let Some(session) = self.session.take() {
            self.sessions.checkin(session);
        }
    }

    fn finish(&mut self) {
        self.closed = true;
        if let Some(session) = self.session.take() {
            self.sessions.checkin(session);
        }
    }
}

impl Stream for Cursor {
    type Item = Result<Document>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let me = self.get_mut();

        loop {
            if let Some(doc) = me.batch.pop_front() {
                return Poll::Ready(Some(Ok(doc)));
            }
            if me.closed {
                return Poll::Ready(None);
            }
            if me.id == 0 {
                me.finish();
                return Poll::Ready(None);
            }

            if me.pending.is_none() {
                me.pending = Some(Box::pin(get_more(
                    me.topology.clone(),
                    me.address.clone(),
                    me.db.clone(),
                    me.collection.clone(),
                    me.id,
                    me.batch_size,
                    me.max_await_time,
                    me.session.take(),
                )));
            }

            match me.pending.as_mut().unwrap().as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready((session, result)) => {
                    me.pending = None;
                    me.session = session;
                    match result {
                        Ok(batch) => {
                            me.id = batch.id;
                            me.batch = batch.documents;
                            // an empty batch with a live id loops into the
                            // next continuation; tailable-await waits on
                            // the server side
                        }
                        Err(err) => {
                            me.finish();
                            return Poll::Ready(Some(Err(err)));
                        }
                    }
                }
            }
        }
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.sessions.checkin(session);
        }
        if self.closed || self.id == 0 {
            return;
        }
        // fire-and-forget release of the server-side state
        let topology = self.topology.clone();
        let address = self.address.clone();
        let db = std::mem::take(&mut self.db);
        let collection = std::mem::take(&mut self.collection);
        let id = self.id;
        tokio::spawn(async move {
            kill_cursors(&topology, &address, &db, &collection, id, None).await;
        });
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("ns", &format_args!("{}.{}", self.db, self.collection))
            .field("id", &self.id)
            .field("buffered", &self.batch.len())
            .field("server", &self.address)
            .finish()
    }
}

/// One `getMore` continuation on the pinned server.
#[allow(clippy::too_many_arguments, reason = "moved into a boxed future")]
async fn get_more(
    topology: Topology,
    address: Address,
    db: String,
    collection: String,
    id: i64,
    batch_size: Option<i32>,
    max_await_time: Option<Duration>,
    mut session: Option<Session>,
) -> (Option<Session>, Result<Batch>) {
    let result = async {
        let config = topology.config();
        let pool = topology
            .pool(&address)
            .ok_or_else(|| Error::selection_timeout("cursor server no longer known"))?;
        let mut conn = pool.acquire_default(config.wait_queue_timeout).await?;

        let mut cmd = doc! { "getMore": (id), "collection": (collection.as_str()) };
        if let Some(batch_size) = batch_size {
            cmd.insert("batchSize", batch_size);
        }
        if let Some(await_time) = max_await_time {
            // the await budget rides `maxTimeMS`, only ever on getMore
            cmd.insert("maxTimeMS", await_time.as_millis() as i64);
        }

        let op = Operation::plain(db, cmd, Criteria::Read(ReadPreference::primary()));
        let msg = command::assemble(&op, session.as_ref(), None, topology.clock().get().as_ref())?;

        let reply = match conn.round_trip(msg).await {
            Ok(reply) => reply,
            Err(err) => {
                if err.is_network() {
                    topology.mark_unknown(address.clone(), err.to_string());
                }
                return Err(err);
            }
        };
        conn.release();

        let reply = dispatch::digest(&topology, reply, session.as_mut())?;
        let cursor = reply
            .doc
            .get_document("cursor")
            .ok_or_else(Error::cursor_closed)?;
        let documents = cursor
            .get_array("nextBatch")
            .unwrap_or_default()
            .iter()
            .filter_map(|item| item.as_document().cloned())
            .collect();
        Ok(Batch { id: cursor.get_int("id").unwrap_or_default(), documents })
    }
    .await;

    (session, result)
}

/// Best-effort server-side release.
async fn kill_cursors(
    topology: &Topology,
    address: &Address,
    db: &str,
    collection: &str,
    id: i64,
    session: Option<&Session>,
) {
    let Some(pool) = topology.pool(address) else { return };
    let Ok(mut conn) = pool.acquire_default(topology.config().wait_queue_timeout).await else {
        return;
    };
    let cmd = doc! { "killCursors": (collection), "cursors": [(id)] };
    let op = Operation::plain(db.to_string(), cmd, Criteria::Read(ReadPreference::primary()));
    if let Ok(msg) = command::assemble(&op, session, None, topology.clock().get().as_ref()) {
        let _ = conn.round_trip(msg).await;
        conn.release();
    }
}
