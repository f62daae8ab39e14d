//! Caller side of a connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::engine::{Command, Dispatcher};
use crate::error::{RpcError, RpcResult};
use crate::lifecycle::{Lifecycle, PumpState};
use crate::reader::MessageReader;
use crate::types::{Request, Response};
use crate::value::Value;
use crate::writer::MessageWriter;

/// Observable state of a [`Client`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Running,
    /// `stop_serving` was called; pumps may still be releasing resources
    Stopping,
    Stopped,
}

/// Issues calls over a byte stream pair and correlates their replies.
///
/// Calls are written to `sink`, replies are read from `source`. A single
/// dispatch task owns the table of pending calls, so `call` can be invoked
/// concurrently through a shared reference.
pub struct Client {
    commands: mpsc::Sender<Command>,
    reader: Arc<Lifecycle>,
    writer: Arc<Lifecycle>,
    shutdown: CancellationToken,
    stopping: AtomicBool,
}

impl Client {
    /// Start a client with default queue sizes. Must be called within a
    /// tokio runtime.
    pub fn new<R, W>(source: R, sink: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::with_config(source, sink, ClientConfig::default())
    }

    pub fn with_config<R, W>(source: R, sink: W, config: ClientConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, replies, reader_errors) =
            MessageReader::<Response>::new(source, config.reader).into_parts();
        let (queue, writer_errors) = MessageWriter::<Request>::new(sink, config.writer).into_parts();
        let writer = queue.lifecycle();

        let (commands, command_rx) = mpsc::channel(config.scheduling_capacity.max(1));
        let shutdown = CancellationToken::new();

        let dispatcher = Dispatcher::new(
            command_rx,
            shutdown.clone(),
            queue,
            writer_errors,
            replies,
            reader_errors,
        );
        tokio::spawn(dispatcher.run_main_loop());

        Self {
            commands,
            reader,
            writer,
            shutdown,
            stopping: AtomicBool::new(false),
        }
    }

    /// Invoke `method` and wait for its reply.
    ///
    /// An `id` of zero sends a notification: the call returns `Null` as soon
    /// as it has been queued for writing. There is no built-in deadline; wrap
    /// the call in `tokio::time::timeout` when one is needed.
    pub async fn call(
        &self,
        id: i64,
        method: impl Into<String>,
        params: Vec<Value>,
    ) -> RpcResult<Value> {
        // 停止後はスケジューリングキューに触れない
        if self.state() != ClientState::Running {
            return Err(RpcError::TransportEnded);
        }

        let (waiter, outcome) = oneshot::channel();
        let command = Command::Call {
            request: Request::new(id, method, params),
            waiter,
        };
        self.commands.try_send(command).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => RpcError::Backpressure("Client"),
            mpsc::error::TrySendError::Closed(_) => RpcError::TransportEnded,
        })?;

        outcome.await.map_err(|_| RpcError::TransportEnded)?
    }

    /// Send a call that expects no reply.
    pub async fn notify(&self, method: impl Into<String>, params: Vec<Value>) -> RpcResult<()> {
        self.call(0, method, params).await.map(|_| ())
    }

    pub fn state(&self) -> ClientState {
        if !self.stopping.load(Ordering::Acquire) {
            ClientState::Running
        } else if self.reader.state() == PumpState::Stopped
            && self.writer.state() == PumpState::Stopped
        {
            ClientState::Stopped
        } else {
            ClientState::Stopping
        }
    }

    /// Stop both pumps concurrently, then close the dispatch loop for good.
    ///
    /// Returns `ShutdownTimeout` if either pump did not stop within
    /// `max_wait`; the client is closed to new calls either way.
    pub async fn stop_serving(&self, max_wait: Duration) -> RpcResult<()> {
        if !self.stopping.swap(true, Ordering::AcqRel) {
            debug!("client: stopping");
        }

        let (reader, writer) = tokio::join!(
            self.reader.stop_serving(max_wait),
            self.writer.stop_serving(max_wait),
        );
        self.shutdown.cancel();

        reader.and(writer)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.request_stop();
        self.writer.request_stop();
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_notify_writes_without_id() {
        let (_reply_peer, source) = tokio::io::duplex(1024);
        let (sink, mut call_peer) = tokio::io::duplex(1024);
        let client = Client::new(source, sink);

        client.notify("log", vec!["hello".into()]).await.unwrap();

        let expected = b"{\"method\":\"log\",\"params\":[\"hello\"]}\n";
        let mut written = vec![0u8; expected.len()];
        call_peer.read_exact(&mut written).await.unwrap();
        assert_eq!(&written[..], &expected[..]);
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let (mut reply_peer, source) = tokio::io::duplex(1024);
        let (sink, _call_peer) = tokio::io::duplex(1024);
        let client = Client::new(source, sink);
        assert_eq!(client.state(), ClientState::Running);

        reply_peer.shutdown().await.unwrap();
        client.stop_serving(Duration::from_secs(1)).await.unwrap();
        assert_eq!(client.state(), ClientState::Stopped);

        let err = client.call(1, "late", vec![]).await.unwrap_err();
        assert!(err.is_transport_ended());
    }
}
