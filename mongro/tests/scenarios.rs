//! Wire-level scenarios against a scripted in-process server.
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::{Buf, BufMut, BytesMut};
use mongro::{
    Client, CursorType, FindOptions,
    bson::{Bson, Document, Timestamp, doc},
    wire::{BackendMessage, HEADER_LEN, MessageHeader, OP_MSG, OP_QUERY, OP_REPLY, OpMsg},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

/// Replies produced by the script; `None` suppresses the reply, for
/// fire-and-forget writes.
type Script = Arc<dyn Fn(&Document) -> Option<Document> + Send + Sync>;

struct MockServer {
    addr: SocketAddr,
    /// Commands received over `OP_MSG`, hello traffic excluded.
    requests: Arc<Mutex<Vec<Document>>>,
}

fn hello_reply() -> Document {
    doc! {
        "ok": 1.0f64,
        "isWritablePrimary": true,
        "minWireVersion": 6,
        "maxWireVersion": 17,
        "maxBsonObjectSize": 16777216,
        "maxMessageSizeBytes": 48000000,
        "logicalSessionTimeoutMinutes": 30,
    }
}

impl MockServer {
    async fn start(script: Script) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let log = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else { break };
                tokio::spawn(serve(socket, script.clone(), log.clone()));
            }
        });

        MockServer { addr, requests }
    }

    fn url(&self) -> String {
        format!("mongodb://{}/app", self.addr)
    }

    fn requests(&self) -> Vec<Document> {
        self.requests.lock().unwrap().clone()
    }

    fn requests_named(&self, command: &str) -> Vec<Document> {
        self.requests()
            .into_iter()
            .filter(|doc| doc.contains_key(command))
            .collect()
    }
}

async fn serve(mut socket: TcpStream, script: Script, log: Arc<Mutex<Vec<Document>>>) {
    let mut buf = BytesMut::new();
    loop {
        let frame = match read_frame(&mut socket, &mut buf).await {
            Some(frame) => frame,
            None => return,
        };
        let header = MessageHeader::decode(&frame);
        let body = frame.slice(HEADER_LEN..);

        match header.opcode {
            OP_QUERY => {
                // flags + "admin.$cmd" cstring + skip/return prelude
                let mut rest = body.slice(4..);
                let nul = rest.iter().position(|b| *b == 0).unwrap();
                rest.advance(nul + 1 + 8);
                let _query = Document::from_bytes(rest).unwrap();
                write_reply(&mut socket, header.request_id, &hello_reply()).await;
            }
            OP_MSG => {
                let msg = OpMsg::decode(&header, body).unwrap();
                let mut cmd = msg.document().unwrap();
                // fold sequences back in so scripts see whole commands
                for sequence in &msg.sequences {
                    let docs = sequence
                        .documents
                        .iter()
                        .map(|d| Bson::Document(Document::from_bytes(d.clone()).unwrap()))
                        .collect::<Vec<_>>();
                    cmd.insert(sequence.identifier.as_str(), docs);
                }

                let reply = if cmd.contains_key("hello") || cmd.contains_key("isMaster") {
                    Some(hello_reply())
                } else if cmd.contains_key("endSessions") {
                    Some(doc! { "ok": 1.0f64 })
                } else {
                    log.lock().unwrap().push(cmd.clone());
                    script(&cmd)
                };
                if let Some(reply) = reply {
                    write_msg(&mut socket, header.request_id, &reply).await;
                }
            }
            opcode => panic!("mock server got opcode {opcode}"),
        }
    }
}

async fn read_frame(socket: &mut TcpStream, buf: &mut BytesMut) -> Option<bytes::Bytes> {
    loop {
        if buf.len() >= 4 {
            let len = (&buf[..4]).get_i32_le() as usize;
            if buf.len() >= len {
                return Some(buf.split_to(len).freeze());
            }
        }
        buf.reserve(8 * 1024);
        match socket.read_buf(buf).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

async fn write_reply(socket: &mut TcpStream, response_to: i32, doc: &Document) {
    let doc = doc.to_bytes().unwrap();
    let mut out = BytesMut::new();
    MessageHeader {
        length: (HEADER_LEN + 20 + doc.len()) as i32,
        request_id: 1,
        response_to,
        opcode: OP_REPLY,
    }
    .encode(&mut out);
    out.put_i32_le(0); // flags
    out.put_i64_le(0); // cursor id
    out.put_i32_le(0); // starting from
    out.put_i32_le(1); // number returned
    out.put_slice(&doc);
    socket.write_all(&out).await.unwrap();
}

async fn write_msg(socket: &mut TcpStream, response_to: i32, doc: &Document) {
    let doc = doc.to_bytes().unwrap();
    let mut out = BytesMut::new();
    MessageHeader {
        length: (HEADER_LEN + 5 + doc.len()) as i32,
        request_id: 1,
        response_to,
        opcode: OP_MSG,
    }
    .encode(&mut out);
    out.put_u32_le(0); // flags
    out.put_u8(0); // body section
    out.put_slice(&doc);
    socket.write_all(&out).await.unwrap();
}

#[tokio::test]
async fn retryable_write_reruns_once_with_same_identity() {
    let attempts = Arc::new(Mutex::new(0));
    let counter = attempts.clone();
    let server = MockServer::start(Arc::new(move |cmd| {
        assert!(cmd.contains_key("insert"));
        let mut attempts = counter.lock().unwrap();
        *attempts += 1;
        Some(match *attempts {
            1 => doc! {
                "ok": 0.0f64,
                "code": 10107,
                "codeName": "NotWritablePrimary",
                "errmsg": "node is recovering",
                "errorLabels": ["RetryableWriteError"],
            },
            _ => doc! { "ok": 1.0f64, "n": 1 },
        })
    }))
    .await;

    let client = Client::connect(&server.url()).await.unwrap();
    let users = client.database("app").collection("users");

    let result = users.insert_one(&doc! { "name": "ada" }).await.unwrap();
    assert_eq!(result.inserted, 1);

    // exactly two wire attempts, same lsid and txnNumber on both
    let inserts = server.requests_named("insert");
    assert_eq!(inserts.len(), 2);
    assert_eq!(inserts[0].get_i64("txnNumber"), Some(1));
    assert_eq!(inserts[1].get_i64("txnNumber"), Some(1));
    let first_lsid = inserts[0].get_document("lsid").expect("lsid attached");
    assert_eq!(Some(first_lsid), inserts[1].get_document("lsid"));

    client.shutdown().await;
}

#[tokio::test]
async fn cluster_clock_merges_monotonically() {
    let times = Arc::new(Mutex::new(vec![5u32, 3, 7]));
    let feed = times.clone();
    let server = MockServer::start(Arc::new(move |_| {
        let time = feed.lock().unwrap().remove(0);
        Some(doc! {
            "ok": 1.0f64,
            "$clusterTime": { "clusterTime": (Timestamp { time, increment: 0 }) },
        })
    }))
    .await;

    let client = Client::connect(&server.url()).await.unwrap();
    let db = client.database("app");
    for _ in 0..3 {
        db.run_command(doc! { "ping": 1 }).await.unwrap();
    }

    let observed = client.cluster_time().expect("clock advanced");
    assert_eq!(observed.timestamp, Timestamp { time: 7, increment: 0 });

    client.shutdown().await;
}

#[tokio::test]
async fn tailable_await_cursor_streams_transparently() {
    let get_mores = Arc::new(Mutex::new(0));
    let counter = get_mores.clone();
    let server = MockServer::start(Arc::new(move |cmd| {
        if cmd.contains_key("find") {
            // tailable-await flags ride the find; the await budget not
            assert_eq!(cmd.get_bool("tailable"), Some(true));
            assert_eq!(cmd.get_bool("awaitData"), Some(true));
            assert!(!cmd.contains_key("maxTimeMS"));
            assert!(!cmd.contains_key("maxAwaitTimeMS"));
            return Some(doc! {
                "ok": 1.0f64,
                "cursor": {
                    "id": 42i64,
                    "ns": "app.feed",
                    "firstBatch": [{ "seq": 1 }],
                },
            });
        }
        if cmd.contains_key("getMore") {
            assert_eq!(cmd.get_i64("getMore"), Some(42));
            assert_eq!(cmd.get_str("collection"), Some("feed"));
            assert_eq!(cmd.get_i64("maxTimeMS"), Some(1500));
            let mut count = counter.lock().unwrap();
            *count += 1;
            return Some(match *count {
                // an await round that timed out empty server-side
                1 => doc! {
                    "ok": 1.0f64,
                    "cursor": { "id": 42i64, "ns": "app.feed", "nextBatch": [] },
                },
                _ => doc! {
                    "ok": 1.0f64,
                    "cursor": { "id": 42i64, "ns": "app.feed", "nextBatch": [{ "seq": 2 }] },
                },
            });
        }
        if cmd.contains_key("killCursors") {
            return Some(doc! { "ok": 1.0f64, "cursorsKilled": [42i64] });
        }
        Some(doc! { "ok": 1.0f64 })
    }))
    .await;

    let client = Client::connect(&server.url()).await.unwrap();
    let feed = client.database("app").collection("feed");

    let mut cursor = feed
        .find(FindOptions {
            cursor_type: CursorType::TailableAwait,
            max_await_time: Some(Duration::from_millis(1500)),
            ..FindOptions::default()
        })
        .await
        .unwrap();

    let first = cursor.next().await.unwrap().unwrap();
    assert_eq!(first.get_i32("seq"), Some(1));

    // the empty await round is retried without surfacing to the caller
    let second = cursor.next().await.unwrap().unwrap();
    assert_eq!(second.get_i32("seq"), Some(2));
    assert_eq!(*get_mores.lock().unwrap(), 2);

    cursor.close().await;
    assert_eq!(server.requests_named("killCursors").len(), 1);

    client.shutdown().await;
}

#[tokio::test]
async fn unacknowledged_write_sends_without_reading() {
    let server = MockServer::start(Arc::new(|cmd| {
        assert!(cmd.contains_key("insert"));
        // no session identity travels with w:0
        assert!(!cmd.contains_key("lsid"));
        assert!(!cmd.contains_key("txnNumber"));
        assert_eq!(cmd.get_document("writeConcern").unwrap().get_i32("w"), Some(0));
        None
    }))
    .await;

    let url = format!("{}?w=0", server.url());
    let client = Client::connect(&url).await.unwrap();
    let users = client.database("app").collection("users");

    let result = users.insert_one(&doc! { "name": "ghost" }).await.unwrap();
    assert_eq!(result.inserted, 0);
    assert_eq!(server.requests_named("insert").len(), 1);

    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_cap_bounds_concurrency() {
    let in_flight = Arc::new(Mutex::new((0i32, 0i32))); // (current, peak)
    let gauge = in_flight.clone();
    let server = MockServer::start(Arc::new(move |cmd| {
        assert!(cmd.contains_key("ping"));
        let mut gauge = gauge.lock().unwrap();
        gauge.0 += 1;
        gauge.1 = gauge.1.max(gauge.0);
        // a command occupies its socket until the reply is written, so
        // the gauge can only exceed the pool cap if the cap leaks
        std::thread::sleep(Duration::from_millis(5));
        gauge.0 -= 1;
        Some(doc! { "ok": 1.0f64 })
    }))
    .await;

    let url = format!("{}?maxPoolSize=2", server.url());
    let client = Client::connect(&url).await.unwrap();

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..16 {
        let db = client.database("app");
        tasks.spawn(async move { db.run_command(doc! { "ping": 1 }).await });
    }
    while let Some(result) = tasks.join_next().await {
        result.unwrap().unwrap();
    }

    assert_eq!(server.requests_named("ping").len(), 16);
    assert!(in_flight.lock().unwrap().1 <= 2, "pool cap leaked");

    client.shutdown().await;
}

#[tokio::test]
async fn document_sequence_streams_batches() {
    let server = MockServer::start(Arc::new(|cmd| {
        assert!(cmd.contains_key("insert"));
        let docs = cmd.get_array("documents").unwrap();
        Some(doc! { "ok": 1.0f64, "n": (docs.len() as i64) })
    }))
    .await;

    let client = Client::connect(&server.url()).await.unwrap();
    let users = client.database("app").collection("users");

    let batch = (0..25).map(|n| doc! { "n": (n) }).collect::<Vec<_>>();
    let result = users.insert_many(&batch).await.unwrap();
    assert_eq!(result.inserted, 25);

    client.shutdown().await;
}
