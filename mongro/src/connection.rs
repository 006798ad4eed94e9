//! Buffered server connection.
use bytes::{Buf, Bytes, BytesMut};
use std::{
    io,
    task::{Context, Poll, ready},
    time::Instant,
};
use tokio::net::TcpStream;

use crate::{
    Result,
    common::verbose,
    config::{Address, Config},
    wire::{
        self, BackendMessage, Compressor, FrontendMessage, HEADER_LEN, MessageHeader, OpMsg,
        OpQuery, OpReply, ProtocolError, compress,
    },
};

pub mod auth;
mod handshake;

pub use handshake::HelloResponse;

const DEFAULT_BUF_CAPACITY: usize = 1024;

/// Default limits before the server advertises its own.
const DEFAULT_MAX_BSON_OBJECT_SIZE: usize = 16 * 1024 * 1024;
const DEFAULT_MAX_MESSAGE_SIZE: usize = 48_000_000;

/// Size limits advertised at handshake.
#[derive(Clone, Copy, Debug)]
pub struct Limits {
    pub max_bson_object_size: usize,
    pub max_message_size_bytes: usize,
    pub max_write_batch_size: usize,
}

impl Default for Limits {
    fn default() -> Limits {
        Limits {
            max_bson_object_size: DEFAULT_MAX_BSON_OBJECT_SIZE,
            max_message_size_bytes: DEFAULT_MAX_MESSAGE_SIZE,
            max_write_batch_size: 100_000,
        }
    }
}

/// A single authenticated socket with read/write buffering.
///
/// One request is in flight at a time; replies are matched to the request
/// id of the last send.
pub struct Connection {
    pub(crate) id: u32,
    pub(crate) address: Address,
    socket: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,

    /// Pool generation this socket was dialed under.
    pub(crate) generation: u64,
    pub(crate) opened_at: Instant,
    pub(crate) last_used_at: Instant,
    /// A reply was left unread, the socket cannot be reused.
    pub(crate) pending_reply: bool,

    pub(crate) limits: Limits,
    pub(crate) compressor: Option<Compressor>,
}

impl Connection {
    /// Dial and run the handshake, without authenticating.
    ///
    /// Monitoring sockets stop here.
    pub(crate) async fn dial(
        address: &Address,
        config: &Config,
        generation: u64,
        id: u32,
    ) -> Result<(Connection, HelloResponse)> {
        let socket = TcpStream::connect((address.host.as_str(), address.port)).await?;
        socket.set_nodelay(true)?;
        let mut conn = Connection {
            id,
            address: address.clone(),
            socket,
            read_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            write_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            generation,
            opened_at: Instant::now(),
            last_used_at: Instant::now(),
            pending_reply: false,
            limits: Limits::default(),
            compressor: None,
        };
        let hello = handshake::initial_handshake(&mut conn, config).await?;
        Ok((conn, hello))
    }

    /// Dial, handshake and authenticate; the pool path.
    pub(crate) async fn connect(
        address: &Address,
        config: &Config,
        generation: u64,
        id: u32,
    ) -> Result<Connection> {
        let (mut conn, hello) = Self::dial(address, config, generation, id).await?;
        auth::authenticate(&mut conn, config, &hello).await?;
        Ok(conn)
    }

    /// Buffer a message, returns its request id.
    pub(crate) fn send<F: FrontendMessage>(&mut self, msg: F) -> Result<i32> {
        let size = HEADER_LEN + msg.size_hint();
        if size > self.limits.max_message_size_bytes {
            return Err(crate::Error::message_too_large(size, self.limits.max_message_size_bytes));
        }
        Ok(wire::write(msg, &mut self.write_buf))
    }

    /// Buffer a command message, compressing when negotiated.
    pub(crate) fn send_command(&mut self, msg: OpMsg) -> Result<i32> {
        match self.compressor {
            Some(compressor) => {
                let wrapped = compress::OpCompressed::wrap(msg, compressor)?;
                self.send(wrapped)
            }
            None => self.send(msg),
        }
    }

    pub(crate) fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        crate::io::poll_write_all(&mut self.socket, &mut self.write_buf, cx)
    }

    pub(crate) async fn flush(&mut self) -> io::Result<()> {
        std::future::poll_fn(|cx| self.poll_flush(cx)).await
    }

    fn poll_recv(&mut self, cx: &mut Context) -> Poll<Result<(MessageHeader, Bytes)>> {
        loop {
            if self.read_buf.len() >= 4 {
                let len = (&self.read_buf[..4]).get_i32_le();
                if (len as usize) < HEADER_LEN {
                    Err(ProtocolError::Truncated("message length below header size"))?;
                }
                let len = len as usize;
                if self.read_buf.len() >= len {
                    let frame = self.read_buf.split_to(len).freeze();
                    let header = MessageHeader::decode(&frame);
                    self.pending_reply = false;
                    verbose!(target: "connection", "(B) opcode={} len={len}", header.opcode);
                    return Poll::Ready(Ok((header, frame.slice(HEADER_LEN..))));
                }
                self.read_buf.reserve(len - self.read_buf.len());
            } else {
                self.read_buf.reserve(DEFAULT_BUF_CAPACITY);
            }
            ready!(crate::io::poll_read(&mut self.socket, &mut self.read_buf, cx)?);
        }
    }

    /// Full round trip of a command message.
    pub(crate) async fn round_trip(&mut self, msg: OpMsg) -> Result<OpMsg> {
        let request_id = self.send_command(msg)?;
        self.round_trip_reply(request_id).await
    }

    /// Round trip that bypasses compression.
    ///
    /// Monitoring and authentication commands always travel plain.
    pub(crate) async fn round_trip_plain(&mut self, msg: OpMsg) -> Result<OpMsg> {
        let request_id = self.send(msg)?;
        self.round_trip_reply(request_id).await
    }

    async fn round_trip_reply(&mut self, request_id: i32) -> Result<OpMsg> {
        self.pending_reply = true;
        self.flush().await?;
        let (header, body) = std::future::poll_fn(|cx| self.poll_recv(cx)).await?;
        let (header, body) = compress::unwrap_message(header, body)?;
        if header.response_to != request_id {
            Err(ProtocolError::Truncated("reply does not match request"))?;
        }
        self.last_used_at = Instant::now();
        Ok(OpMsg::decode(&header, body)?)
    }

    /// Fire-and-forget send for unacknowledged writes.
    ///
    /// The message must carry the `moreToCome` flag; the server will not
    /// reply and the socket stays reusable.
    pub(crate) async fn send_only(&mut self, msg: OpMsg) -> Result<()> {
        debug_assert_ne!(msg.flags & OpMsg::MORE_TO_COME, 0);
        self.send_command(msg)?;
        self.flush().await?;
        self.last_used_at = Instant::now();
        Ok(())
    }

    /// Handshake round trip over the legacy message pair.
    pub(crate) async fn round_trip_query(&mut self, query: OpQuery<'_>) -> Result<OpReply> {
        let request_id = self.send(query)?;
        self.pending_reply = true;
        self.flush().await?;
        let (header, body) = std::future::poll_fn(|cx| self.poll_recv(cx)).await?;
        if header.response_to != request_id {
            Err(ProtocolError::Truncated("reply does not match request"))?;
        }
        self.last_used_at = Instant::now();
        Ok(OpReply::decode(&header, body)?)
    }

    /// Gracefully close the socket.
    pub(crate) async fn close(mut self) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;
        self.socket.shutdown().await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("generation", &self.generation)
            .field("age", &self.opened_at.elapsed())
            .field("compressor", &self.compressor)
            .finish()
    }
}
