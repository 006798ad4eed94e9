//! Command dispatch.
//!
//! One operation runs the select → acquire → send → receive → decode
//! pipeline; a failure in the retryable set re-runs it once against a
//! freshly selected server, reusing the session identity of the first
//! attempt.
use std::{fmt, sync::Arc};

use crate::{
    Error, Result,
    bson::{Bson, Document, doc},
    command::{self, Operation, Retryability},
    common::verbose,
    config::Address,
    error::ErrorKind,
    session::{Session, SessionPool},
    topology::{Topology, select},
    wire::OpMsg,
};

/// Server-side failure, `ok: 0`.
pub struct ServerError {
    pub code: i32,
    pub code_name: String,
    pub message: String,
    pub labels: Vec<String>,
    /// The whole reply document.
    pub raw: Document,
}

impl ServerError {
    pub(crate) fn from_reply(doc: Document) -> ServerError {
        ServerError {
            code: doc.get_int("code").unwrap_or_default() as i32,
            code_name: doc.get_str("codeName").unwrap_or_default().into(),
            message: doc.get_str("errmsg").unwrap_or("command failed").into(),
            labels: doc
                .get_array("errorLabels")
                .unwrap_or_default()
                .iter()
                .filter_map(|l| l.as_str().map(String::from))
                .collect(),
            raw: doc,
        }
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    /// Codes that mean the server went away or stepped down mid-flight.
    pub fn is_state_change(&self) -> bool {
        matches!(
            self.code,
            6       // HostUnreachable
            | 7     // HostNotFound
            | 89    // NetworkTimeout
            | 91    // ShutdownInProgress
            | 189   // PrimarySteppedDown
            | 9001  // SocketException
            | 10107 // NotWritablePrimary
            | 11600 // InterruptedAtShutdown
            | 11602 // InterruptedDueToReplStateChange
            | 13435 // NotPrimaryNoSecondaryOk
            | 13436 // NotPrimaryOrSecondary
        )
    }
}

impl std::error::Error for ServerError { }

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server error {}", self.code)?;
        if !self.code_name.is_empty() {
            write!(f, " ({})", self.code_name)?;
        }
        write!(f, ": {}", self.message)
    }
}

impl fmt::Debug for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// Cluster-acknowledged failure of the requested write concern.
pub struct WriteConcernError {
    pub code: i32,
    pub code_name: String,
    pub message: String,
}

impl std::error::Error for WriteConcernError { }

impl fmt::Display for WriteConcernError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "write concern error {}: {}", self.code, self.message)
    }
}

impl fmt::Debug for WriteConcernError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// A decoded, acknowledged reply.
#[derive(Debug)]
pub(crate) struct Reply {
    pub doc: Document,
}

impl Reply {
    /// The `writeConcernError` subcase arrives on an otherwise ok reply.
    pub fn write_concern_error(&self) -> Option<WriteConcernError> {
        let doc = self.doc.get_document("writeConcernError")?;
        Some(WriteConcernError {
            code: doc.get_int("code").unwrap_or_default() as i32,
            code_name: doc.get_str("codeName").unwrap_or_default().into(),
            message: doc.get_str("errmsg").unwrap_or_default().into(),
        })
    }
}

/// Everything an executed operation leaves behind.
pub(crate) struct Executed {
    pub reply: Reply,
    pub address: Address,
    /// The implicit session, when the caller asked to keep it pinned
    /// instead of returning it to the pool.
    pub session: Option<Session>,
}

/// Run one operation to completion, retrying at most once.
pub(crate) async fn execute_operation(
    topology: &Topology,
    sessions: &Arc<SessionPool>,
    op: Operation,
    mut explicit: Option<&mut Session>,
    hold_session: bool,
) -> Result<Executed> {
    let config = topology.config();

    // implicit session, unless the deployment lacks session support or
    // the write will not be acknowledged
    let mut implicit = match explicit {
        None if topology.supports_sessions() && !op.is_unacknowledged() => {
            Some(sessions.checkout(topology.session_timeout_minutes(), true))
        }
        _ => None,
    };

    let retryable = match op.retryability {
        Retryability::Write => {
            config.retry_writes && !op.is_unacknowledged()
                && (implicit.is_some() || explicit.is_some())
        }
        Retryability::Read => config.retry_reads,
        Retryability::None => false,
    };

    // one number per logical write, not per attempt
    let txn_number = match (op.retryability, retryable) {
        (Retryability::Write, true) => {
            let session = explicit.as_deref_mut().or(implicit.as_mut()).unwrap();
            Some(session.next_txn_number())
        }
        _ => None,
    };

    let mut attempts = 0;
    let result = loop {
        attempts += 1;
        let session = explicit.as_deref_mut().or(implicit.as_mut());
        let result = match op.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, attempt(topology, &op, session, txn_number)).await {
                Ok(result) => result,
                Err(_) => Err(Error::timeout()),
            },
            None => attempt(topology, &op, session, txn_number).await,
        };

        match result {
            Ok(executed) => break Ok(executed),
            Err(err) if attempts < 2 && retryable && retryable_error(&err, op.retryability) => {
                verbose!(target: "dispatch", "retrying after: {err}");
                continue;
            }
            Err(err) => break Err(err),
        }
    };

    match result {
        Ok((reply, address)) => {
            let session = match (implicit, hold_session) {
                (Some(session), true) => Some(session),
                (Some(session), false) => {
                    sessions.checkin(session);
                    None
                }
                (None, _) => None,
            };
            Ok(Executed { reply, address, session })
        }
        Err(err) => {
            if let Some(session) = implicit {
                sessions.checkin(session);
            }
            Err(err)
        }
    }
}

/// One wire attempt: select, acquire, send, receive, decode.
async fn attempt(
    topology: &Topology,
    op: &Operation,
    mut session: Option<&mut Session>,
    txn_number: Option<i64>,
) -> Result<(Reply, Address)> {
    let config = topology.config();

    let address = select::select_server(topology, &op.criteria).await?;
    let pool = topology
        .pool(&address)
        .ok_or_else(|| Error::selection_timeout("selected server disappeared"))?;
    let mut conn = pool.acquire_default(config.wait_queue_timeout).await?;

    let msg = command::assemble(
        op,
        session.as_deref(),
        txn_number,
        topology.clock().get().as_ref(),
    )?;

    if op.is_unacknowledged() {
        // the caller never observes remote failures past this point
        conn.send_only(msg).await.inspect_err(|err| {
            if err.is_network() {
                topology.mark_unknown(address.clone(), err.to_string());
            }
        })?;
        conn.release();
        return Ok((Reply { doc: doc! { "ok": 1 } }, address));
    }

    let reply = match conn.round_trip(msg).await {
        Ok(reply) => reply,
        Err(err) => {
            // the guard drop discards the socket; a network fault also
            // resets the server and clears its pool
            if err.is_network() {
                topology.mark_unknown(address.clone(), err.to_string());
            }
            return Err(err);
        }
    };
    conn.release();

    let reply = digest(topology, reply, session.as_deref_mut())?;
    Ok((reply, address))
}

/// Observe clocks, then split `ok: 0` into a server error.
pub(crate) fn digest(topology: &Topology, msg: OpMsg, session: Option<&mut Session>) -> Result<Reply> {
    let doc = msg.document()?;

    if let Some(cluster_time) = doc.get_document("$clusterTime") {
        topology.clock().advance_raw(cluster_time);
    }
    if let (Some(session), Some(observed)) = (session, doc.get_timestamp("operationTime")) {
        session.advance_operation_time(observed);
    }

    let ok = match doc.get("ok") {
        Some(Bson::Double(v)) => *v == 1.0,
        Some(value) => value.as_int() == Some(1),
        None => false,
    };
    if !ok {
        return Err(ServerError::from_reply(doc).into());
    }
    Ok(Reply { doc })
}

/// The retryable-error set: network faults, state-change server codes,
/// and replies labelled retryable.
fn retryable_error(err: &Error, retryability: Retryability) -> bool {
    match err.kind() {
        ErrorKind::Io(_) => true,
        ErrorKind::Server(server) => match retryability {
            Retryability::Write => {
                server.has_label("RetryableWriteError") || server.is_state_change()
            }
            Retryability::Read => server.is_state_change(),
            Retryability::None => false,
        },
        ErrorKind::PoolTimeout => false,
        _ => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn server_error(code: i32, labels: &[&str]) -> Error {
        let mut doc = doc! { "ok": 0.0f64, "code": (code), "errmsg": "boom" };
        let labels = labels.iter().map(|l| Bson::String(l.to_string())).collect::<Vec<_>>();
        doc.insert("errorLabels", labels);
        ServerError::from_reply(doc).into()
    }

    #[test]
    fn not_writable_primary_is_retryable() {
        let err = server_error(10107, &["RetryableWriteError"]);
        assert!(retryable_error(&err, Retryability::Write));
        assert!(retryable_error(&err, Retryability::Read));
    }

    /// The whole state-change family retries, labelled or not: the
    /// stepdown/shutdown codes plus the host/network ones the server
    /// reports on behalf of an unreachable member.
    #[test]
    fn state_change_codes_retry_without_label() {
        for code in [6, 7, 89, 91, 189, 9001, 10107, 11600, 11602, 13435, 13436] {
            let err = server_error(code, &[]);
            assert!(retryable_error(&err, Retryability::Write), "code {code}");
            assert!(retryable_error(&err, Retryability::Read), "code {code}");
        }
    }

    #[test]
    fn label_alone_retries_writes_only() {
        let err = server_error(8000, &["RetryableWriteError"]);
        assert!(retryable_error(&err, Retryability::Write));
        assert!(!retryable_error(&err, Retryability::Read));
    }

    #[test]
    fn ordinary_failure_is_terminal() {
        let err = server_error(11000, &[]); // DuplicateKey
        assert!(!retryable_error(&err, Retryability::Write));
        assert!(!retryable_error(&err, Retryability::None));
    }

    #[test]
    fn network_errors_always_retry() {
        let err: Error = std::io::Error::from(std::io::ErrorKind::ConnectionReset).into();
        assert!(retryable_error(&err, Retryability::Write));
        assert!(retryable_error(&err, Retryability::Read));
    }

    #[test]
    fn server_error_fields() {
        let doc = doc! {
            "ok": 0.0f64,
            "code": 10107,
            "codeName": "NotWritablePrimary",
            "errmsg": "not primary",
            "errorLabels": ["RetryableWriteError"],
        };
        let err = ServerError::from_reply(doc);
        assert_eq!(err.code, 10107);
        assert_eq!(err.code_name, "NotWritablePrimary");
        assert!(err.has_label("RetryableWriteError"));
        assert!(err.is_state_change());
    }
}
