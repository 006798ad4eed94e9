use bytes::{Buf, BytesMut};
use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Read once into the spare capacity of `buf`.
///
/// A clean remote close surfaces as `UnexpectedEof`.
pub fn poll_read<S>(socket: &mut S, buf: &mut BytesMut, cx: &mut Context) -> Poll<io::Result<()>>
where
    S: AsyncRead + Unpin,
{
    let mut read_buf = ReadBuf::uninit(buf.spare_capacity_mut());
    ready!(Pin::new(socket).poll_read(cx, &mut read_buf)?);
    let n = read_buf.filled().len();
    if n == 0 {
        return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
    }
    // SAFETY: `poll_read` initialized `n` bytes of the spare capacity
    unsafe { buf.set_len(buf.len() + n) };
    Poll::Ready(Ok(()))
}

/// Write `buf` out entirely and flush.
pub fn poll_write_all<S>(
    socket: &mut S,
    buf: &mut BytesMut,
    cx: &mut Context,
) -> Poll<io::Result<()>>
where
    S: AsyncWrite + Unpin,
{
    while !buf.is_empty() {
        let n = ready!(Pin::new(&mut *socket).poll_write(cx, buf)?);
        if n == 0 {
            return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
        }
        buf.advance(n);
    }
    ready!(Pin::new(socket).poll_flush(cx)?);
    Poll::Ready(Ok(()))
}
