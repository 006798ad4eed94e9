//! Connection authentication.
//!
//! The handshake advertises which mechanisms the server accepts; the
//! SCRAM-SHA-256 conversation is implemented here, everything else is
//! recognized but deferred.
use std::fmt;

use bytes::Bytes;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::{
    Result,
    bson::{Binary, Document, doc, encode},
    config::Config,
    wire::OpMsg,
};

use super::{Connection, HelloResponse};

type HmacSha256 = Hmac<Sha256>;

/// Authentication mechanisms a server may advertise.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthMechanism {
    ScramSha1,
    ScramSha256,
    X509,
    Plain,
    MongodbAws,
}

impl AuthMechanism {
    pub fn from_name(name: &str) -> Option<AuthMechanism> {
        Some(match name {
            "SCRAM-SHA-1" => Self::ScramSha1,
            "SCRAM-SHA-256" => Self::ScramSha256,
            "MONGODB-X509" => Self::X509,
            "PLAIN" => Self::Plain,
            "MONGODB-AWS" => Self::MongodbAws,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ScramSha1 => "SCRAM-SHA-1",
            Self::ScramSha256 => "SCRAM-SHA-256",
            Self::X509 => "MONGODB-X509",
            Self::Plain => "PLAIN",
            Self::MongodbAws => "MONGODB-AWS",
        }
    }
}

/// Authentication conversation failure.
pub enum AuthError {
    /// Mechanism has no conversation implemented here.
    Unsupported(AuthMechanism),
    /// Server payload violates the conversation grammar.
    Malformed(&'static str),
    /// Server proof does not match, or the server rejected ours.
    Failed(String),
}

impl std::error::Error for AuthError { }

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported(mechanism) => {
                write!(f, "auth mechanism {} not supported", mechanism.name())
            }
            Self::Malformed(what) => write!(f, "malformed auth payload: {what}"),
            Self::Failed(why) => write!(f, "authentication failed: {why}"),
        }
    }
}

impl fmt::Debug for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// Authenticate a freshly dialed socket, when credentials are configured.
pub(crate) async fn authenticate(
    conn: &mut Connection,
    config: &Config,
    hello: &HelloResponse,
) -> Result<()> {
    let Some(user) = &config.user else {
        return Ok(());
    };
    let pass = config.pass.as_deref().unwrap_or_default();

    let mechanism = match config.auth_mechanism {
        Some(mechanism) => mechanism,
        None => {
            // prefer the strongest advertised mechanism for the account
            let advertised = |name| hello.sasl_supported_mechs.iter().any(|m| m == name);
            if advertised("SCRAM-SHA-256") || hello.sasl_supported_mechs.is_empty() {
                AuthMechanism::ScramSha256
            } else {
                AuthMechanism::ScramSha1
            }
        }
    };

    match mechanism {
        AuthMechanism::ScramSha256 => {
            scram_sha256(conn, config.auth_database(), user, pass).await
        }
        other => Err(AuthError::Unsupported(other).into()),
    }
}

/// One `saslStart`/`saslContinue` round trip.
async fn sasl_round_trip(conn: &mut Connection, db: &str, cmd: &Document) -> Result<Document> {
    let mut cmd = cmd.clone();
    cmd.insert("$db", db);
    let reply = conn.round_trip_plain(OpMsg::new(encode::to_bytes(&cmd)?)).await?;
    let doc = reply.document()?;
    if doc.get_f64("ok").unwrap_or_default() != 1.0 && doc.get_int("ok") != Some(1) {
        let why = doc.get_str("errmsg").unwrap_or("server rejected sasl message");
        return Err(AuthError::Failed(why.into()).into());
    }
    Ok(doc)
}

fn sasl_payload(doc: &Document) -> Result<Bytes, AuthError> {
    match doc.get("payload") {
        Some(crate::bson::Bson::Binary(binary)) => Ok(binary.bytes.clone()),
        _ => Err(AuthError::Malformed("missing payload")),
    }
}

/// Attribute value out of a `k=v,...` SCRAM payload.
fn scram_field<'a>(payload: &'a str, key: char) -> Result<&'a str, AuthError> {
    payload
        .split(',')
        .find_map(|part| {
            let mut chars = part.chars();
            (chars.next() == Some(key) && chars.next() == Some('=')).then(|| &part[2..])
        })
        .ok_or(AuthError::Malformed("missing scram attribute"))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// PBKDF2 with HMAC-SHA-256, the SCRAM `Hi` function.
fn salted_password(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut block = Vec::with_capacity(salt.len() + 4);
    block.extend_from_slice(salt);
    block.extend_from_slice(&1u32.to_be_bytes());

    let mut u = hmac_sha256(password.as_bytes(), &block);
    let mut out = u;
    for _ in 1..iterations {
        u = hmac_sha256(password.as_bytes(), &u);
        for (o, b) in out.iter_mut().zip(u) {
            *o ^= b;
        }
    }
    out
}

async fn scram_sha256(conn: &mut Connection, db: &str, user: &str, pass: &str) -> Result<()> {
    use base64::Engine;
    let b64 = base64::engine::general_purpose::STANDARD;

    let nonce = b64.encode(rand::random::<[u8; 24]>());
    let first_bare = format!("n={},r={}", user.replace('=', "=3D").replace(',', "=2C"), nonce);

    let start = doc! {
        "saslStart": 1,
        "mechanism": "SCRAM-SHA-256",
        "payload": (Binary {
            subtype: Binary::SUBTYPE_GENERIC,
            bytes: Bytes::from(format!("n,,{first_bare}")),
        }),
        "options": { "skipEmptyExchange": true },
    };
    let reply = sasl_round_trip(conn, db, &start).await?;
    let conversation_id = reply.get_int("conversationId").unwrap_or_default();

    let payload = sasl_payload(&reply)?;
    let server_first = std::str::from_utf8(&payload)
        .map_err(|_| AuthError::Malformed("server first message not utf8"))?
        .to_string();

    let server_nonce = scram_field(&server_first, 'r')?;
    if !server_nonce.starts_with(&nonce) {
        return Err(AuthError::Failed("server nonce does not extend ours".into()).into());
    }
    let salt = b64
        .decode(scram_field(&server_first, 's')?)
        .map_err(|_| AuthError::Malformed("salt is not base64"))?;
    let iterations: u32 = scram_field(&server_first, 'i')?
        .parse()
        .map_err(|_| AuthError::Malformed("iteration count"))?;
    if iterations < 4096 {
        return Err(AuthError::Failed("iteration count below minimum".into()).into());
    }

    let salted = salted_password(pass, &salt, iterations);
    let client_key = hmac_sha256(&salted, b"Client Key");
    let stored_key: [u8; 32] = Sha256::digest(client_key).into();
    let server_key = hmac_sha256(&salted, b"Server Key");

    let without_proof = format!("c=biws,r={server_nonce}");
    let auth_message = format!("{first_bare},{server_first},{without_proof}");

    let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
    let mut proof = client_key;
    for (p, s) in proof.iter_mut().zip(client_signature) {
        *p ^= s;
    }

    let client_final = format!("{without_proof},p={}", b64.encode(proof));
    let cont = doc! {
        "saslContinue": 1,
        "conversationId": (conversation_id),
        "payload": (Binary {
            subtype: Binary::SUBTYPE_GENERIC,
            bytes: Bytes::from(client_final),
        }),
    };
    let mut reply = sasl_round_trip(conn, db, &cont).await?;

    let payload = sasl_payload(&reply)?;
    let server_final = std::str::from_utf8(&payload)
        .map_err(|_| AuthError::Malformed("server final message not utf8"))?;
    let verifier = b64
        .decode(scram_field(server_final, 'v')?)
        .map_err(|_| AuthError::Malformed("server signature is not base64"))?;
    let expected = hmac_sha256(&server_key, auth_message.as_bytes());
    if verifier != expected {
        return Err(AuthError::Failed("server signature missmatch".into()).into());
    }

    // servers without skipEmptyExchange close with one empty round
    while reply.get_bool("done") != Some(true) {
        let finish = doc! {
            "saslContinue": 1,
            "conversationId": (conversation_id),
            "payload": (Binary { subtype: Binary::SUBTYPE_GENERIC, bytes: Bytes::new() }),
        };
        reply = sasl_round_trip(conn, db, &finish).await?;
    }

    Ok(())
}
