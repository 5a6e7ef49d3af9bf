//! Deferred upstream UDP connection
//!
//! Resolving a domain and opening the upstream socket can take hundreds of
//! milliseconds; the receive loop must never wait on it. A
//! [`FutureUdpConn`] accepts writes immediately: while the dial runs in the
//! background, datagrams are copied into a bounded backlog; once it
//! resolves, the backlog is drained to the socket in arrival order and
//! subsequent writes go straight through.
//!
//! Writers hold the mode lock shared so concurrent datagrams buffer in
//! parallel; the completion path takes it exclusive to flip the mode and
//! drain exactly once. A datagram arriving into a full backlog is dropped
//! with [`UdpError::BacklogOverflow`] — UDP semantics tolerate that.

use std::future::Future;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, warn};

use crate::error::UdpError;

/// Default number of datagrams buffered while the dial resolves
pub const DEFAULT_BACKLOG: usize = 256;

enum Mode {
    /// Dial in flight; writes go to the backlog.
    Pending(mpsc::Sender<Bytes>),
    /// Dial resolved; writes go to the socket.
    Direct(Arc<UdpSocket>),
    /// Dial failed; the handle is terminally unusable.
    Failed(String),
}

/// Upstream connection handle whose write path is usable immediately.
pub struct FutureUdpConn {
    mode: RwLock<Mode>,
    resolved: watch::Receiver<bool>,
}

impl FutureUdpConn {
    /// Start `dial` in the background and return a handle that buffers up
    /// to `backlog` datagrams until it resolves.
    pub fn connect<F>(dial: F, backlog: usize) -> Arc<Self>
    where
        F: Future<Output = io::Result<UdpSocket>> + Send + 'static,
    {
        let (backlog_tx, backlog_rx) = mpsc::channel(backlog.max(1));
        let (resolved_tx, resolved_rx) = watch::channel(false);

        let conn = Arc::new(Self {
            mode: RwLock::new(Mode::Pending(backlog_tx)),
            resolved: resolved_rx,
        });

        tokio::spawn(background_dial(Arc::clone(&conn), dial, backlog_rx, resolved_tx));

        conn
    }

    /// Send a datagram: buffered while the dial is pending, direct after.
    ///
    /// Returns the number of bytes accepted.
    pub async fn send(&self, buf: &[u8]) -> Result<usize, UdpError> {
        let mode = self.mode.read().await;
        match &*mode {
            Mode::Pending(backlog) => match backlog.try_send(Bytes::copy_from_slice(buf)) {
                Ok(()) => Ok(buf.len()),
                Err(TrySendError::Full(_)) => Err(UdpError::BacklogOverflow),
                Err(TrySendError::Closed(_)) => {
                    Err(UdpError::DialFailed("connection lost before resolve".into()))
                }
            },
            Mode::Direct(socket) => socket.send(buf).await.map_err(UdpError::Io),
            Mode::Failed(reason) => Err(UdpError::DialFailed(reason.clone())),
        }
    }

    /// Receive from the upstream, waiting for the dial to resolve first.
    ///
    /// The reply pump is the sole caller. A failed dial surfaces here as an
    /// error so the pump reaps the flow.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.wait_resolved().await?;

        let socket = {
            let mode = self.mode.read().await;
            match &*mode {
                Mode::Direct(socket) => Arc::clone(socket),
                Mode::Failed(reason) => {
                    return Err(io::Error::other(format!("upstream dial failed: {reason}")))
                }
                Mode::Pending(_) => {
                    return Err(io::Error::other("resolved without a connection"))
                }
            }
        };

        socket.recv(buf).await
    }

    /// Whether the background dial has finished, either way.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        *self.resolved.borrow()
    }

    async fn wait_resolved(&self) -> io::Result<()> {
        let mut resolved = self.resolved.clone();
        while !*resolved.borrow() {
            resolved
                .changed()
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "dial task gone"))?;
        }
        Ok(())
    }
}

async fn background_dial<F>(
    conn: Arc<FutureUdpConn>,
    dial: F,
    mut backlog_rx: mpsc::Receiver<Bytes>,
    resolved_tx: watch::Sender<bool>,
) where
    F: Future<Output = io::Result<UdpSocket>> + Send,
{
    match dial.await {
        Ok(socket) => {
            let socket = Arc::new(socket);
            let mut mode = conn.mode.write().await;
            // Replacing Pending drops the sender, so try_recv below sees
            // exactly the datagrams buffered before the flip.
            *mode = Mode::Direct(Arc::clone(&socket));

            let mut drained = 0usize;
            while let Ok(datagram) = backlog_rx.try_recv() {
                if let Err(err) = socket.send(&datagram).await {
                    warn!(error = %err, "backlog replay write failed");
                } else {
                    drained += 1;
                }
            }
            drop(mode);
            if drained > 0 {
                debug!(drained, "drained deferred-dial backlog");
            }
        }
        Err(err) => {
            warn!(error = %err, "upstream dial failed");
            let mut mode = conn.mode.write().await;
            *mode = Mode::Failed(err.to_string());
        }
    }

    let _ = resolved_tx.send(true);
}
