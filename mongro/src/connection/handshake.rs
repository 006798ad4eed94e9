//! Initial connection handshake.
//!
//! A single legacy `isMaster`/`hello` query opens every socket; it is the
//! only place `OP_QUERY` is used. The reply seeds the server description,
//! negotiates compression and advertises size limits.
use crate::{
    Result,
    bson::{Document, Timestamp, doc},
    config::{Address, Config},
    wire::{Compressor, OpQuery},
};

use super::Connection;

/// Driver identity sent with the handshake.
pub(crate) fn client_metadata(config: &Config) -> Document {
    let mut client = Document::new();
    if let Some(app_name) = &config.app_name {
        client.insert("application", doc! { "name": (app_name.as_str()) });
    }
    client.insert("driver", doc! {
        "name": "mongro",
        "version": (env!("CARGO_PKG_VERSION")),
    });
    client.insert("os", doc! {
        "type": (std::env::consts::OS),
        "architecture": (std::env::consts::ARCH),
    });
    client.insert("platform", format!("rust {}", env!("CARGO_PKG_NAME")));
    client
}

/// Parsed `hello` reply.
///
/// Every field is optional on the wire; absence keeps the lenient default
/// so topology code can reason over partial replies.
#[derive(Clone, Debug, Default)]
pub struct HelloResponse {
    pub ok: bool,
    pub is_writable_primary: bool,
    pub secondary: bool,
    pub arbiter_only: bool,
    pub hidden: bool,
    /// Member of a replica set that is still initializing.
    pub is_replica_set_ghost: bool,
    /// `"isdbgrid"` marks a router.
    pub msg: Option<String>,
    pub set_name: Option<String>,
    pub set_version: Option<i64>,
    pub election_id: Option<crate::bson::ObjectId>,
    pub primary: Option<Address>,
    pub me: Option<Address>,
    pub hosts: Vec<Address>,
    pub passives: Vec<Address>,
    pub arbiters: Vec<Address>,
    pub tags: Vec<(String, String)>,
    pub min_wire_version: i32,
    pub max_wire_version: i32,
    pub max_bson_object_size: Option<i64>,
    pub max_message_size_bytes: Option<i64>,
    pub max_write_batch_size: Option<i64>,
    pub logical_session_timeout_minutes: Option<i64>,
    pub compression: Vec<String>,
    pub sasl_supported_mechs: Vec<String>,
    /// Present when the server supports awaitable hello streaming.
    pub topology_version: Option<Document>,
    pub last_write_date: Option<crate::bson::DateTime>,
    pub cluster_time: Option<Document>,
    pub operation_time: Option<Timestamp>,
    pub service_id: Option<crate::bson::ObjectId>,
}

impl HelloResponse {
    pub fn parse(doc: &Document) -> HelloResponse {
        let addresses = |key: &str| -> Vec<Address> {
            doc.get_array(key)
                .unwrap_or_default()
                .iter()
                .filter_map(|v| v.as_str())
                .filter_map(|s| Address::parse(s).ok())
                .collect()
        };
        let address = |key: &str| doc.get_str(key).and_then(|s| Address::parse(s).ok());
        let strings = |key: &str| -> Vec<String> {
            doc.get_array(key)
                .unwrap_or_default()
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        };

        HelloResponse {
            ok: doc.get_f64("ok").unwrap_or_default() == 1.0
                || doc.get_int("ok") == Some(1),
            is_writable_primary: doc
                .get_bool("isWritablePrimary")
                .or_else(|| doc.get_bool("ismaster"))
                .unwrap_or_default(),
            secondary: doc.get_bool("secondary").unwrap_or_default(),
            arbiter_only: doc.get_bool("arbiterOnly").unwrap_or_default(),
            hidden: doc.get_bool("hidden").unwrap_or_default(),
            is_replica_set_ghost: doc.get_bool("isreplicaset").unwrap_or_default(),
            msg: doc.get_str("msg").map(String::from),
            set_name: doc.get_str("setName").map(String::from),
            set_version: doc.get_int("setVersion"),
            election_id: doc.get("electionId").and_then(|v| v.as_object_id()),
            primary: address("primary"),
            me: address("me"),
            hosts: addresses("hosts"),
            passives: addresses("passives"),
            arbiters: addresses("arbiters"),
            tags: doc
                .get_document("tags")
                .map(|tags| {
                    tags.iter()
                        .filter_map(|(k, v)| v.as_str().map(|v| (k.to_string(), v.to_string())))
                        .collect()
                })
                .unwrap_or_default(),
            min_wire_version: doc.get_int("minWireVersion").unwrap_or_default() as i32,
            max_wire_version: doc.get_int("maxWireVersion").unwrap_or_default() as i32,
            max_bson_object_size: doc.get_int("maxBsonObjectSize"),
            max_message_size_bytes: doc.get_int("maxMessageSizeBytes"),
            max_write_batch_size: doc.get_int("maxWriteBatchSize"),
            logical_session_timeout_minutes: doc.get_int("logicalSessionTimeoutMinutes"),
            compression: strings("compression"),
            sasl_supported_mechs: strings("saslSupportedMechs"),
            topology_version: doc.get_document("topologyVersion").cloned(),
            last_write_date: doc
                .get_document("lastWrite")
                .and_then(|lw| lw.get("lastWriteDate"))
                .and_then(|v| match v {
                    crate::bson::Bson::DateTime(dt) => Some(*dt),
                    _ => None,
                }),
            cluster_time: doc.get_document("$clusterTime").cloned(),
            operation_time: doc.get_timestamp("operationTime"),
            service_id: doc.get("serviceId").and_then(|v| v.as_object_id()),
        }
    }

    /// Whether the deployment behind this server supports sessions.
    pub fn supports_sessions(&self) -> bool {
        self.logical_session_timeout_minutes.is_some()
    }
}

/// Build the handshake command.
pub(crate) fn handshake_command(config: &Config) -> Document {
    let mut cmd = doc! { "isMaster": 1, "helloOk": true };
    cmd.insert("client", client_metadata(config));
    if !config.compressors.is_empty() {
        let names = config
            .compressors
            .iter()
            .map(|c| crate::bson::Bson::String(c.name().into()))
            .collect::<Vec<_>>();
        cmd.insert("compression", names);
    }
    if let (Some(user), None) = (&config.user, &config.auth_mechanism) {
        // ask the server which mechanisms apply to this account
        cmd.insert(
            "saslSupportedMechs",
            format!("{}.{}", config.auth_database(), user),
        );
    }
    cmd
}

/// Run the handshake on a fresh socket.
pub(crate) async fn initial_handshake(
    conn: &mut Connection,
    config: &Config,
) -> Result<HelloResponse> {
    let query = handshake_command(config).to_bytes()?;
    let reply = conn
        .round_trip_query(OpQuery {
            flags: OpQuery::SLAVE_OK,
            full_collection_name: "admin.$cmd",
            number_to_skip: 0,
            number_to_return: -1,
            query,
        })
        .await?;

    let doc = reply.into_document()?;
    let hello = HelloResponse::parse(&doc);

    if let Some(size) = hello.max_bson_object_size {
        conn.limits.max_bson_object_size = size as usize;
    }
    if let Some(size) = hello.max_message_size_bytes {
        conn.limits.max_message_size_bytes = size as usize;
    }
    if let Some(size) = hello.max_write_batch_size {
        conn.limits.max_write_batch_size = size as usize;
    }
    conn.compressor = Compressor::negotiate(&config.compressors, &hello.compression);

    Ok(hello)
}
