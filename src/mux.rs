//! Stream multiplexing over a single transport socket.
//!
//! Wraps a [`yamux::Connection`] behind a task-owned driver so the rest of
//! the crate sees three plain capabilities: open a sub-stream, accept
//! sub-streams, and a closed notification. Sub-streams are ordinary
//! bidirectional byte streams; closing one never affects the session.
//! Session close is idempotent.

use std::collections::VecDeque;
use std::future::poll_fn;
use std::task::Poll;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::TokioAsyncReadCompatExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use yamux::Stream as SubStream;

#[derive(Debug, Error)]
pub enum MuxError {
    /// The session is closed; no further sub-streams can be opened.
    #[error("mux session closed")]
    Closed,

    #[error(transparent)]
    Connection(#[from] yamux::ConnectionError),
}

enum Command {
    Open(oneshot::Sender<Result<SubStream, MuxError>>),
}

/// Cloneable handle to a live multiplexed session.
///
/// All clones refer to the same underlying connection; the driver shuts the
/// connection down when [`close`](MuxSession::close) is called, when every
/// handle and the acceptor have been dropped, or when the transport dies.
#[derive(Clone)]
pub struct MuxSession {
    cmd_tx: mpsc::Sender<Command>,
    closed: CancellationToken,
}

/// Receiver side for sub-streams opened by the remote peer.
pub struct IncomingStreams {
    rx: mpsc::UnboundedReceiver<SubStream>,
}

impl IncomingStreams {
    /// Next inbound sub-stream; `None` once the session is closed.
    pub async fn next(&mut self) -> Option<SubStream> {
        self.rx.recv().await
    }
}

impl MuxSession {
    /// Wraps the dialing side of a transport connection.
    pub fn client<T>(io: T) -> (Self, IncomingStreams)
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::spawn(io, yamux::Mode::Client)
    }

    /// Wraps the accepting side of a transport connection.
    pub fn server<T>(io: T) -> (Self, IncomingStreams)
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::spawn(io, yamux::Mode::Server)
    }

    fn spawn<T>(io: T, mode: yamux::Mode) -> (Self, IncomingStreams)
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let connection = yamux::Connection::new(io.compat(), yamux::Config::default(), mode);
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        tokio::spawn(drive(connection, cmd_rx, inbound_tx, closed.clone()));
        (
            Self { cmd_tx, closed },
            IncomingStreams { rx: inbound_rx },
        )
    }

    /// Opens a fresh sub-stream towards the remote peer.
    pub async fn open_stream(&self) -> Result<SubStream, MuxError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Open(tx))
            .await
            .map_err(|_| MuxError::Closed)?;
        rx.await.map_err(|_| MuxError::Closed)?
    }

    /// Requests an orderly shutdown of the session and its transport.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Resolves once the session is closed, locally or by the transport.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Owns the yamux connection: services open requests, forwards inbound
/// sub-streams, and performs the close handshake. yamux makes progress only
/// while `poll_next_inbound` is being polled, so everything runs inside one
/// poll loop.
async fn drive<T>(
    mut connection: yamux::Connection<T>,
    mut cmd_rx: mpsc::Receiver<Command>,
    inbound_tx: mpsc::UnboundedSender<SubStream>,
    closed: CancellationToken,
) where
    T: futures::AsyncRead + futures::AsyncWrite + Unpin,
{
    let mut pending_opens: VecDeque<oneshot::Sender<Result<SubStream, MuxError>>> =
        VecDeque::new();
    let mut shutdown = std::pin::pin!(closed.clone().cancelled_owned());
    let mut closing = false;
    let mut cmds_done = false;

    poll_fn(|cx| {
        if !closing && std::future::Future::poll(shutdown.as_mut(), cx).is_ready() {
            closing = true;
        }

        if closing {
            return connection.poll_close(cx).map(|_| ());
        }

        while !cmds_done {
            match cmd_rx.poll_recv(cx) {
                Poll::Ready(Some(Command::Open(reply))) => pending_opens.push_back(reply),
                Poll::Ready(None) => cmds_done = true,
                Poll::Pending => break,
            }
        }

        // Every handle is gone and nothing is waiting: shut the session down.
        if cmds_done && pending_opens.is_empty() && inbound_tx.is_closed() {
            closing = true;
            return connection.poll_close(cx).map(|_| ());
        }

        while !pending_opens.is_empty() {
            match connection.poll_new_outbound(cx) {
                Poll::Ready(Ok(stream)) => {
                    let reply = pending_opens.pop_front().expect("queue checked non-empty");
                    let _ = reply.send(Ok(stream));
                }
                Poll::Ready(Err(err)) => {
                    debug!("outbound open failed, session is dead: {err}");
                    if let Some(reply) = pending_opens.pop_front() {
                        let _ = reply.send(Err(err.into()));
                    }
                    for reply in pending_opens.drain(..) {
                        let _ = reply.send(Err(MuxError::Closed));
                    }
                    return Poll::Ready(());
                }
                Poll::Pending => break,
            }
        }

        loop {
            match connection.poll_next_inbound(cx) {
                Poll::Ready(Some(Ok(stream))) => {
                    // Receiver may be gone; the stream is then dropped, which
                    // resets it without affecting the session.
                    let _ = inbound_tx.send(stream);
                }
                Poll::Ready(Some(Err(err))) => {
                    debug!("mux connection error: {err}");
                    return Poll::Ready(());
                }
                Poll::Ready(None) => {
                    debug!("mux connection closed by remote");
                    return Poll::Ready(());
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    })
    .await;

    for reply in pending_opens.drain(..) {
        let _ = reply.send(Err(MuxError::Closed));
    }
    closed.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{read_frame, write_frame};
    use std::time::Duration;
    use tokio::time::timeout;

    fn pair() -> ((MuxSession, IncomingStreams), (MuxSession, IncomingStreams)) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        (MuxSession::client(a), MuxSession::server(b))
    }

    #[tokio::test]
    async fn opens_accepts_and_transfers_frames() {
        let ((client, _), (_server, mut incoming)) = pair();

        let mut out = client.open_stream().await.unwrap();
        write_frame(&mut out, b"ping").await.unwrap();

        let mut inc = timeout(Duration::from_secs(5), incoming.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read_frame(&mut inc).await.unwrap(), b"ping");

        write_frame(&mut inc, b"pong").await.unwrap();
        assert_eq!(read_frame(&mut out).await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn concurrent_streams_do_not_interfere() {
        let ((client, _), (_server, mut incoming)) = pair();

        let mut first = client.open_stream().await.unwrap();
        let mut second = client.open_stream().await.unwrap();
        write_frame(&mut second, b"two").await.unwrap();
        write_frame(&mut first, b"one").await.unwrap();

        let mut payloads = Vec::new();
        for _ in 0..2 {
            let mut stream = timeout(Duration::from_secs(5), incoming.next())
                .await
                .unwrap()
                .unwrap();
            payloads.push(read_frame(&mut stream).await.unwrap());
        }
        payloads.sort();
        assert_eq!(payloads, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[tokio::test]
    async fn close_notifies_both_sides() {
        let ((client, _client_in), (server, mut incoming)) = pair();

        client.close();
        timeout(Duration::from_secs(5), client.closed())
            .await
            .unwrap();
        timeout(Duration::from_secs(5), server.closed())
            .await
            .unwrap();
        assert!(timeout(Duration::from_secs(5), incoming.next())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn open_after_close_fails() {
        let ((client, _a), (_server, _b)) = pair();
        client.close();
        client.closed().await;
        assert!(matches!(
            client.open_stream().await,
            Err(MuxError::Closed) | Err(MuxError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let ((client, _a), (_server, _b)) = pair();
        client.close();
        client.close();
        timeout(Duration::from_secs(5), client.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dropping_all_handles_closes_the_session() {
        let ((client, client_in), (server, _server_in)) = pair();
        drop(client);
        drop(client_in);
        timeout(Duration::from_secs(5), server.closed())
            .await
            .unwrap();
    }
}
