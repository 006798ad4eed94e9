//! Command assembly.
//!
//! Every command leaves here as an `OP_MSG` body with the session,
//! cluster time and concern fields attached by policy: unacknowledged
//! writes carry no session identity at all, reads under causal
//! consistency carry `afterClusterTime`.
use bytes::Bytes;

use crate::{
    Result,
    bson::{Binary, Bson, Document},
    config::{Acknowledgment, ReadConcern, WriteConcern},
    session::{ClusterTime, Session},
    topology::select::Criteria,
    wire::OpMsg,
};

/// Whether the dispatcher may retry a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Retryability {
    Write,
    Read,
    None,
}

/// One command ready for dispatch.
#[derive(Debug)]
pub(crate) struct Operation {
    pub db: String,
    pub body: Document,
    /// Batches streamed as document sequence sections.
    pub sequences: Vec<(String, Vec<Bytes>)>,
    pub criteria: Criteria,
    pub retryability: Retryability,
    pub write_concern: Option<WriteConcern>,
    pub read_concern: Option<ReadConcern>,
    pub timeout: Option<std::time::Duration>,
}

impl Operation {
    pub fn read(db: impl Into<String>, body: Document, criteria: Criteria) -> Operation {
        Operation {
            db: db.into(),
            body,
            sequences: Vec::new(),
            criteria,
            retryability: Retryability::Read,
            write_concern: None,
            read_concern: None,
            timeout: None,
        }
    }

    pub fn write(db: impl Into<String>, body: Document) -> Operation {
        Operation {
            db: db.into(),
            body,
            sequences: Vec::new(),
            criteria: Criteria::Write,
            retryability: Retryability::Write,
            write_concern: None,
            read_concern: None,
            timeout: None,
        }
    }

    /// A command that must not be retried.
    pub fn plain(db: impl Into<String>, body: Document, criteria: Criteria) -> Operation {
        Operation {
            db: db.into(),
            body,
            sequences: Vec::new(),
            criteria,
            retryability: Retryability::None,
            write_concern: None,
            read_concern: None,
            timeout: None,
        }
    }

    /// Whether the caller asked for a fire-and-forget write.
    pub fn is_unacknowledged(&self) -> bool {
        self.write_concern
            .as_ref()
            .is_some_and(WriteConcern::is_unacknowledged)
    }
}

fn write_concern_document(concern: &WriteConcern) -> Document {
    let mut doc = Document::new();
    match &concern.w {
        Acknowledgment::Default => {}
        Acknowledgment::Nodes(n) => {
            doc.insert("w", *n);
        }
        Acknowledgment::Majority => {
            doc.insert("w", "majority");
        }
        Acknowledgment::Custom(name) => {
            doc.insert("w", name.as_str());
        }
    }
    if let Some(wtimeout) = concern.wtimeout {
        doc.insert("wtimeout", wtimeout.as_millis() as i64);
    }
    if let Some(journal) = concern.journal {
        doc.insert("j", journal);
    }
    doc
}

/// Assemble the final command message.
///
/// `txn_number` is attached verbatim so a retry reuses the number of the
/// first attempt.
pub(crate) fn assemble(
    op: &Operation,
    session: Option<&Session>,
    txn_number: Option<i64>,
    cluster_time: Option<&ClusterTime>,
) -> Result<OpMsg> {
    let unacknowledged = op.is_unacknowledged();
    let mut cmd = op.body.clone();
    cmd.insert("$db", op.db.as_str());

    if let Criteria::Read(pref) = &op.criteria {
        if !pref.is_default() {
            let mut pref_doc = Document::new();
            pref_doc.insert("mode", pref.mode.name());
            if !pref.tag_sets.is_empty() {
                let sets = pref
                    .tag_sets
                    .iter()
                    .map(|set| {
                        let mut doc = Document::new();
                        for (k, v) in set {
                            doc.insert(k.as_str(), v.as_str());
                        }
                        Bson::Document(doc)
                    })
                    .collect::<Vec<_>>();
                pref_doc.insert("tags", sets);
            }
            if let Some(staleness) = pref.max_staleness {
                pref_doc.insert("maxStalenessSeconds", staleness.as_secs() as i64);
            }
            cmd.insert("$readPreference", pref_doc);
        }
    }

    // no session identity travels with a write the server will not
    // acknowledge
    if let (Some(session), false) = (session, unacknowledged) {
        let mut lsid = Document::new();
        lsid.insert("id", Binary {
            subtype: Binary::SUBTYPE_UUID,
            bytes: Bytes::copy_from_slice(session.lsid().as_bytes()),
        });
        cmd.insert("lsid", lsid);

        if let Some(txn_number) = txn_number {
            cmd.insert("txnNumber", txn_number);
        }
    }

    if let (Some(cluster_time), false) = (cluster_time, unacknowledged) {
        cmd.insert("$clusterTime", cluster_time.raw.clone());
    }

    let after_cluster_time = session
        .filter(|s| s.causal_consistency() && !unacknowledged)
        .and_then(Session::operation_time);
    let level = op.read_concern.as_ref().and_then(|rc| rc.level.clone());
    if level.is_some() || after_cluster_time.is_some() {
        let mut read_concern = Document::new();
        if let Some(level) = level {
            read_concern.insert("level", level);
        }
        if let Some(after) = after_cluster_time {
            read_concern.insert("afterClusterTime", after);
        }
        cmd.insert("readConcern", read_concern);
    }

    if let Some(concern) = &op.write_concern {
        let doc = write_concern_document(concern);
        if !doc.is_empty() {
            cmd.insert("writeConcern", doc);
        }
    }

    let mut msg = OpMsg::new(cmd.to_bytes()?);
    if unacknowledged {
        msg = msg.with_flags(OpMsg::MORE_TO_COME);
    }
    for (identifier, documents) in &op.sequences {
        msg = msg.with_sequence(identifier.clone(), documents.clone());
    }
    Ok(msg)
}
