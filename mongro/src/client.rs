//! Client handle and the thin command surface.
use std::{sync::Arc, time::Duration};

use bytes::Bytes;

use crate::{
    Result,
    bson::{Binary, Bson, Document, doc, encode::Encode},
    command::Operation,
    config::Config,
    cursor::Cursor,
    dispatch::{self, Executed},
    session::{ClusterClock, Session, SessionPool},
    topology::{
        Topology,
        select::{Criteria, ReadMode, ReadPreference, select_server},
    },
};

/// Driver entry point.
///
/// Cheap to clone; owns the topology, the session pool and the cluster
/// clock.
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    config: Arc<Config>,
    topology: Topology,
    sessions: Arc<SessionPool>,
}

impl Client {
    /// Connect and wait for a first reachable server.
    pub async fn connect(url: &str) -> Result<Client> {
        Self::connect_with(Config::parse(url)?).await
    }

    /// Connect using `MONGODB_URI`.
    ///
    /// See [`Config::from_env`] for more details on env.
    pub async fn connect_env() -> Result<Client> {
        Self::connect_with(Config::from_env()).await
    }

    /// Connect and wait for a first reachable server.
    pub async fn connect_with(config: Config) -> Result<Client> {
        let client = Self::connect_lazy_with(config);
        let criteria = Criteria::Read(ReadPreference::mode(ReadMode::Nearest));
        select_server(&client.inner.topology, &criteria).await?;
        Ok(client)
    }

    /// Create the client without waiting for the deployment.
    pub fn connect_lazy(url: &str) -> Result<Client> {
        Ok(Self::connect_lazy_with(Config::parse(url)?))
    }

    /// Create the client without waiting for the deployment.
    pub fn connect_lazy_with(config: Config) -> Client {
        let config = Arc::new(config);
        let topology = Topology::new(config.clone(), Arc::new(ClusterClock::new()));
        Client {
            inner: Arc::new(ClientInner {
                config,
                topology,
                sessions: Arc::new(SessionPool::new()),
            }),
        }
    }

    pub fn database(&self, name: impl Into<String>) -> Database {
        Database { client: self.clone(), name: name.into() }
    }

    /// Database named in the connection string, if any.
    pub fn default_database(&self) -> Option<Database> {
        self.inner.config.database().map(|name| self.database(name))
    }

    /// Latest cluster time observed across the deployment.
    pub fn cluster_time(&self) -> Option<crate::session::ClusterTime> {
        self.inner.topology.clock().get()
    }

    /// Check out an explicit session.
    pub fn start_session(&self) -> Session {
        self.inner
            .sessions
            .checkout(self.inner.topology.session_timeout_minutes(), false)
    }

    /// Return an explicit session for reuse.
    pub fn end_session(&self, session: Session) {
        self.inner.sessions.checkin(session);
    }

    pub(crate) fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    pub(crate) async fn run_operation(
        &self,
        op: Operation,
        session: Option<&mut Session>,
        hold_session: bool,
    ) -> Result<Executed> {
        dispatch::execute_operation(
            &self.inner.topology,
            &self.inner.sessions,
            op,
            session,
            hold_session,
        )
        .await
    }

    /// Flush pooled session ids and stop monitoring.
    pub async fn shutdown(self) {
        self.inner.sessions.drain_all();
        loop {
            let ids = self.inner.sessions.drain_ended();
            if ids.is_empty() {
                break;
            }
            let lsids = ids
                .into_iter()
                .map(|id| {
                    let mut doc = Document::new();
                    doc.insert("id", Binary {
                        subtype: Binary::SUBTYPE_UUID,
                        bytes: Bytes::copy_from_slice(id.as_bytes()),
                    });
                    Bson::Document(doc)
                })
                .collect::<Vec<_>>();
            let mut cmd = Document::new();
            cmd.insert("endSessions", lsids);
            let op = Operation::plain(
                "admin",
                cmd,
                Criteria::Read(ReadPreference::mode(ReadMode::PrimaryPreferred)),
            );
            if self.run_operation(op, None, false).await.is_err() {
                break;
            }
        }
        self.inner.topology.close();
    }
}

/// Handle to one database.
#[derive(Clone, Debug)]
pub struct Database {
    client: Client,
    name: String,
}

impl Database {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collection(&self, name: impl Into<String>) -> Collection {
        Collection { database: self.clone(), name: name.into() }
    }

    /// Run an arbitrary command, primary routed.
    pub async fn run_command(&self, command: Document) -> Result<Document> {
        let op = Operation::plain(
            self.name.clone(),
            command,
            Criteria::Read(ReadPreference::primary()),
        );
        let executed = self.client.run_operation(op, None, false).await?;
        Ok(executed.reply.doc)
    }

    /// Run a command inside an explicit session.
    pub async fn run_command_with(&self, command: Document, session: &mut Session) -> Result<Document> {
        let op = Operation::plain(
            self.name.clone(),
            command,
            Criteria::Read(ReadPreference::primary()),
        );
        let executed = self.client.run_operation(op, Some(session), false).await?;
        Ok(executed.reply.doc)
    }
}

/// Cursor behavior of a `find`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CursorType {
    #[default]
    NonTailable,
    Tailable,
    /// Tailable, and continuations block server side for new data.
    TailableAwait,
}

/// Options of a `find` command.
#[derive(Clone, Debug, Default)]
pub struct FindOptions {
    pub filter: Option<Document>,
    pub batch_size: Option<i32>,
    pub limit: Option<i64>,
    pub skip: Option<i64>,
    pub sort: Option<Document>,
    pub projection: Option<Document>,
    pub cursor_type: CursorType,
    /// Server-side wait per continuation of a tailable-await cursor.
    /// Never sent on the initial command.
    pub max_await_time: Option<Duration>,
    /// Server-side cap on the initial command.
    pub max_time: Option<Duration>,
    pub read_preference: Option<ReadPreference>,
}

/// Result of an acknowledged insert.
#[derive(Clone, Copy, Debug)]
pub struct InsertResult {
    pub inserted: i64,
}

/// Handle to one collection.
#[derive(Clone, Debug)]
pub struct Collection {
    database: Database,
    name: String,
}

impl Collection {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Issue a query, returning its cursor.
    pub async fn find(&self, options: FindOptions) -> Result<Cursor> {
        let client = &self.database.client;
        let cmd = find_command(&self.name, &options);
        let pref = options
            .read_preference
            .clone()
            .unwrap_or_else(|| client.inner.config.read_preference.clone());

        let mut op = Operation::read(self.database.name.clone(), cmd, Criteria::Read(pref));
        op.read_concern = Some(client.inner.config.read_concern.clone());

        let executed = client.run_operation(op, None, true).await?;
        let max_await = match options.cursor_type {
            CursorType::TailableAwait => options.max_await_time,
            _ => None,
        };
        Cursor::new(
            client.topology().clone(),
            client.inner.sessions.clone(),
            &executed.reply,
            executed.address,
            executed.session,
            options.batch_size,
            max_await,
        )
    }

    /// Insert one encodable record.
    pub async fn insert_one<T: Encode>(&self, document: &T) -> Result<InsertResult> {
        self.insert_raw(vec![crate::bson::encode::to_bytes(document)?]).await
    }

    /// Insert a batch, streamed as a document sequence.
    pub async fn insert_many<T: Encode>(&self, documents: &[T]) -> Result<InsertResult> {
        let mut encoded = Vec::with_capacity(documents.len());
        for document in documents {
            encoded.push(crate::bson::encode::to_bytes(document)?);
        }
        self.insert_raw(encoded).await
    }

    async fn insert_raw(&self, documents: Vec<Bytes>) -> Result<InsertResult> {
        let client = &self.database.client;
        let cmd = doc! { "insert": (self.name.as_str()) };

        let mut op = Operation::write(self.database.name.clone(), cmd);
        op.sequences.push(("documents".into(), documents));
        op.write_concern = Some(client.inner.config.write_concern.clone());

        let executed = client.run_operation(op, None, false).await?;
        if let Some(err) = executed.reply.write_concern_error() {
            return Err(err.into());
        }
        Ok(InsertResult { inserted: executed.reply.doc.get_int("n").unwrap_or_default() })
    }
}

/// Build the `find` command document.
fn find_command(collection: &str, options: &FindOptions) -> Document {
    let mut cmd = doc! { "find": (collection) };
    if let Some(filter) = &options.filter {
        cmd.insert("filter", filter.clone());
    }
    if let Some(sort) = &options.sort {
        cmd.insert("sort", sort.clone());
    }
    if let Some(projection) = &options.projection {
        cmd.insert("projection", projection.clone());
    }
    if let Some(skip) = options.skip {
        cmd.insert("skip", skip);
    }
    if let Some(limit) = options.limit {
        cmd.insert("limit", limit);
    }
    if let Some(batch_size) = options.batch_size {
        cmd.insert("batchSize", batch_size);
    }
    match options.cursor_type {
        CursorType::NonTailable => {}
        CursorType::Tailable => {
            cmd.insert("tailable", true);
        }
        CursorType::TailableAwait => {
            cmd.insert("tailable", true);
            cmd.insert("awaitData", true);
        }
    }
    // max_await_time belongs to getMore; only max_time caps the initial
    // command
    if let Some(max_time) = options.max_time {
        cmd.insert("maxTimeMS", max_time.as_millis() as i64);
    }
    cmd
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tailable_await_find_shape() {
        let options = FindOptions {
            filter: Some(doc! { "topic": "events" }),
            cursor_type: CursorType::TailableAwait,
            max_await_time: Some(Duration::from_secs(2)),
            ..FindOptions::default()
        };
        let cmd = find_command("feed", &options);
        assert_eq!(cmd.get_str("find"), Some("feed"));
        assert_eq!(cmd.get_bool("tailable"), Some(true));
        assert_eq!(cmd.get_bool("awaitData"), Some(true));
        // the await budget never rides the initial command
        assert!(!cmd.contains_key("maxTimeMS"));
        assert!(!cmd.contains_key("maxAwaitTimeMS"));
    }

    #[test]
    fn plain_find_shape() {
        let options = FindOptions {
            batch_size: Some(10),
            limit: Some(100),
            max_time: Some(Duration::from_millis(500)),
            ..FindOptions::default()
        };
        let cmd = find_command("users", &options);
        assert_eq!(cmd.get_i32("batchSize"), Some(10));
        assert_eq!(cmd.get_i64("limit"), Some(100));
        assert_eq!(cmd.get_i64("maxTimeMS"), Some(500));
        assert!(!cmd.contains_key("tailable"));
    }

    #[tokio::test]
    async fn lazy_client_wiring() {
        let client = Client::connect_lazy("mongodb://localhost:27017/app").unwrap();
        let db = client.default_database().unwrap();
        assert_eq!(db.name(), "app");
        let coll = db.collection("users");
        assert_eq!(coll.name(), "users");
        client.shutdown().await;
    }
}
