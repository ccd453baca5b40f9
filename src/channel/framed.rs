// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Length-prefixed framing over one TCP socket.
//!
//! One channel owns one socket. The receive side reads exact frames into
//! pooled buffers and hands them out as leases; the send side serializes
//! writers behind a mutex so concurrent senders interleave whole frames,
//! never bytes. Closing is one-shot: peer FIN, cancellation, benign socket
//! errors and explicit disposal all funnel into the same latch.

use std::sync::atomic::{AtomicBool, Ordering};

use std::io;
use std::sync::Arc;

use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{
    buffer::{lease::BufferLease, pool::BufferPool},
    packet::header::{FRAME_PREFIX_LEN, MAX_FRAME_LEN},
};

/// Payloads at or below this size are framed on the stack; larger ones go
/// through a pooled buffer.
const STACK_SEND_LIMIT: usize = 510;

/// Initial rent for the receive path; grows when the prefix announces a
/// bigger frame.
const INITIAL_RECV_HINT: usize = 256;

/// Outcome classification for channel I/O.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Orderly end of stream: peer FIN or an already-closed channel.
    #[error("connection closed")]
    Closed,
    /// The channel's cancellation token fired mid-operation.
    #[error("operation cancelled")]
    Cancelled,
    /// The peer violated the framing contract; the connection must close.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// Caller error surfaced immediately, before any I/O.
    #[error("send rejected: {0}")]
    Rejected(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Socket error kinds that mean orderly or peer-initiated termination
/// rather than a fault.
pub fn is_benign_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::Interrupted
    )
}

impl ChannelError {
    /// True when this error is a normal close path, not a fault.
    pub fn is_benign(&self) -> bool {
        match self {
            Self::Closed | Self::Cancelled => true,
            Self::Io(e) => is_benign_disconnect(e),
            Self::Protocol(_) | Self::Rejected(_) => false,
        }
    }
}

/// Framed byte channel over one TCP socket.
pub struct FramedChannel {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    pool: Arc<BufferPool>,
    /// Child of the listener token: cancelling either side stops this
    /// channel; cancelling this channel leaves siblings untouched.
    cancel: CancellationToken,
    close_signaled: AtomicBool,
}

impl FramedChannel {
    /// Wrap a connected socket. `parent` is the listener-scoped token; the
    /// channel derives its own child token from it.
    pub fn new(
        stream: TcpStream,
        pool: Arc<BufferPool>,
        parent: &CancellationToken,
    ) -> Self {
        let (r, w) = stream.into_split();
        Self {
            reader: Mutex::new(r),
            writer: Mutex::new(w),
            pool,
            cancel: parent.child_token(),
            close_signaled: AtomicBool::new(false),
        }
    }

    /// Read one complete frame and lease its packet bytes (prefix
    /// excluded).
    ///
    /// Exactly one task may own the receive side; the reader mutex only
    /// guards against misuse.
    pub async fn read_frame(&self) -> Result<BufferLease, ChannelError> {
        if self.close_signaled.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }

        let mut buf = self.pool.rent(INITIAL_RECV_HINT);

        if let Err(e) = self.read_exact_cancellable(&mut buf[..FRAME_PREFIX_LEN]).await
        {
            self.pool.give_back(buf);
            return Err(e);
        }

        let total = u16::from_le_bytes([buf[0], buf[1]]) as usize;
        if total < FRAME_PREFIX_LEN || total > MAX_FRAME_LEN {
            self.pool.give_back(buf);
            return Err(ChannelError::Protocol(format!(
                "frame length {total} outside [{FRAME_PREFIX_LEN}, {MAX_FRAME_LEN}]"
            )));
        }

        if buf.len() < total {
            // Grow: the prefix survives into the replacement buffer.
            let mut bigger = self.pool.rent(total);
            bigger[..FRAME_PREFIX_LEN].copy_from_slice(&buf[..FRAME_PREFIX_LEN]);
            self.pool.give_back(buf);
            buf = bigger;
        }

        if total > FRAME_PREFIX_LEN
            && let Err(e) =
                self.read_exact_cancellable(&mut buf[FRAME_PREFIX_LEN..total]).await
        {
            self.pool.give_back(buf);
            return Err(e);
        }

        trace!(total, "frame received");
        Ok(BufferLease::take_ownership(
            &self.pool,
            buf,
            FRAME_PREFIX_LEN,
            total - FRAME_PREFIX_LEN,
        ))
    }

    /// Send `bytes` as one frame: `u16 total_le ‖ bytes`, written as a
    /// single logical emission. Partial writes are retried until the frame
    /// is fully on the wire or the socket reports close.
    pub async fn send(&self, bytes: &[u8]) -> Result<(), ChannelError> {
        if bytes.is_empty() {
            return Err(ChannelError::Rejected("empty payload"));
        }
        if bytes.len() > MAX_FRAME_LEN - FRAME_PREFIX_LEN {
            return Err(ChannelError::Rejected("payload exceeds frame limit"));
        }
        if self.close_signaled.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }

        let total = (FRAME_PREFIX_LEN + bytes.len()) as u16;
        let prefix = total.to_le_bytes();

        let mut w = self.writer.lock().await;
        if bytes.len() <= STACK_SEND_LIMIT {
            let mut tmp = [0u8; FRAME_PREFIX_LEN + STACK_SEND_LIMIT];
            tmp[..FRAME_PREFIX_LEN].copy_from_slice(&prefix);
            tmp[FRAME_PREFIX_LEN..total as usize].copy_from_slice(bytes);
            self.write_all_cancellable(&mut w, &tmp[..total as usize]).await
        } else {
            let mut buf = self.pool.rent(total as usize);
            buf[..FRAME_PREFIX_LEN].copy_from_slice(&prefix);
            buf[FRAME_PREFIX_LEN..total as usize].copy_from_slice(bytes);
            let res = self.write_all_cancellable(&mut w, &buf[..total as usize]).await;
            self.pool.give_back(buf);
            res
        }
    }

    /// Trigger the internal cancellation source. Idempotent; an in-flight
    /// `read_exact` fails with [`ChannelError::Cancelled`] and the receive
    /// loop unwinds into the close path.
    pub fn cancel_receive(&self) {
        self.cancel.cancel();
    }

    /// Transition to closed. Returns `true` exactly once, for the caller
    /// that owns firing the close callback.
    pub fn dispose(&self) -> bool {
        let first = !self.close_signaled.swap(true, Ordering::AcqRel);
        if first {
            self.cancel.cancel();
        }
        first
    }

    pub fn is_closed(&self) -> bool {
        self.close_signaled.load(Ordering::Acquire)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    async fn read_exact_cancellable(&self, out: &mut [u8]) -> Result<(), ChannelError> {
        let mut r = self.reader.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ChannelError::Cancelled),
            res = r.read_exact(out) => match res {
                Ok(_) => Ok(()),
                // Zero read on a frame boundary or mid-frame: peer FIN.
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    Err(ChannelError::Closed)
                },
                Err(e) => Err(ChannelError::Io(e)),
            },
        }
    }

    async fn write_all_cancellable(
        &self,
        w: &mut OwnedWriteHalf,
        bytes: &[u8],
    ) -> Result<(), ChannelError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ChannelError::Cancelled),
            res = w.write_all(bytes) => match res {
                Ok(()) => Ok(()),
                // write_all maps a 0-byte write to WriteZero: socket closed.
                Err(e) if e.kind() == io::ErrorKind::WriteZero => {
                    Err(ChannelError::Closed)
                },
                Err(e) => Err(ChannelError::Io(e)),
            },
        }
    }
}

impl std::fmt::Debug for FramedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedChannel")
            .field("closed", &self.is_closed())
            .finish()
    }
}
