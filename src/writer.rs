//! Writing pump: serializes queued messages onto a byte sink, one at a time.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;

use crate::codec::encode;
use crate::config::PumpConfig;
use crate::error::{RpcError, RpcResult};
use crate::lifecycle::{Lifecycle, PumpState};
use crate::types::WireMessage;

/// Non-blocking handle for queueing writes on a [`MessageWriter`].
pub struct WriteQueue<M: WireMessage> {
    queue: mpsc::Sender<M>,
    lifecycle: Arc<Lifecycle>,
}

impl<M: WireMessage> Clone for WriteQueue<M> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            lifecycle: self.lifecycle.clone(),
        }
    }
}

impl<M: WireMessage> WriteQueue<M> {
    /// Queue `message` for writing without waiting.
    ///
    /// Fails with `Backpressure` if the queue is full and with
    /// `TransportEnded` once the pump is stopping or stopped.
    pub fn enqueue(&self, message: M) -> RpcResult<()> {
        if self.lifecycle.is_closing() {
            return Err(RpcError::TransportEnded);
        }

        self.queue.try_send(message).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => RpcError::Backpressure(M::WRITER),
            mpsc::error::TrySendError::Closed(_) => RpcError::TransportEnded,
        })
    }

    /// Queue `message`, waiting for room if the queue is full.
    pub(crate) async fn enqueue_wait(&self, message: M) -> RpcResult<()> {
        if self.lifecycle.is_closing() {
            return Err(RpcError::TransportEnded);
        }

        tokio::select! {
            biased;
            _ = self.lifecycle.stop_requested() => Err(RpcError::TransportEnded),
            sent = self.queue.send(message) => sent.map_err(|_| RpcError::TransportEnded),
        }
    }

    pub fn state(&self) -> PumpState {
        self.lifecycle.state()
    }

    pub fn lifecycle(&self) -> Arc<Lifecycle> {
        self.lifecycle.clone()
    }
}

/// Encoding pump for one message kind.
///
/// A single drain task owns the sink and writes queued messages in FIFO
/// order, so writes never interleave. Encode failures are reported on the
/// error queue and the task moves on to the next message. Stopping closes the
/// command queue and the error queue.
pub struct MessageWriter<M: WireMessage> {
    queue: WriteQueue<M>,
    errors: mpsc::Receiver<RpcError>,
}

impl<M: WireMessage> MessageWriter<M> {
    /// Start writing to `sink`. Must be called within a tokio runtime.
    pub fn new<W>(sink: W, config: PumpConfig) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let lifecycle = Arc::new(Lifecycle::new(M::WRITER));
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity());
        let (error_tx, errors) = mpsc::channel(config.queue_capacity());

        tokio::spawn(drain(sink, queue_rx, error_tx, lifecycle.clone()));

        Self {
            queue: WriteQueue {
                queue: queue_tx,
                lifecycle,
            },
            errors,
        }
    }

    pub fn enqueue(&self, message: M) -> RpcResult<()> {
        self.queue.enqueue(message)
    }

    /// Encode failures, in the order they happened.
    pub fn errors(&mut self) -> &mut mpsc::Receiver<RpcError> {
        &mut self.errors
    }

    pub fn queue(&self) -> &WriteQueue<M> {
        &self.queue
    }

    pub fn state(&self) -> PumpState {
        self.queue.state()
    }

    pub async fn stop_serving(&self, max_wait: Duration) -> RpcResult<()> {
        self.queue.lifecycle.stop_serving(max_wait).await
    }

    /// Splits the writer into its queue handle and its error queue.
    pub fn into_parts(self) -> (WriteQueue<M>, mpsc::Receiver<RpcError>) {
        (self.queue, self.errors)
    }
}

async fn drain<W, M>(
    mut sink: W,
    mut queue: mpsc::Receiver<M>,
    errors: mpsc::Sender<RpcError>,
    lifecycle: Arc<Lifecycle>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
    M: WireMessage,
{
    debug!("{}: drain task started", M::WRITER);

    loop {
        let message = tokio::select! {
            biased;
            _ = lifecycle.stop_requested() => break,
            next = queue.recv() => match next {
                Some(message) => message,
                None => {
                    debug!("{}: every queue handle dropped", M::WRITER);
                    break;
                }
            },
        };

        let id = message.id();
        // 書き込み中でも停止要求を優先する
        let written = tokio::select! {
            biased;
            _ = lifecycle.stop_requested() => break,
            written = encode(&mut sink, &message) => written,
        };

        if let Err(err) = written {
            warn!("{}: failed to write message id={}: {}", M::WRITER, id, err);
            // エラーキューが満杯でも drain タスクは止めない
            if let Err(mpsc::error::TrySendError::Full(err)) = errors.try_send(err) {
                warn!("{}: error queue full, dropping: {}", M::WRITER, err);
            }
        }
    }

    queue.close();
    drop(queue);
    drop(errors);
    drop(sink);
    lifecycle.mark_stopped();
    debug!("{}: drain task stopped", M::WRITER);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Request, Response};
    use crate::value::Value;
    use std::io;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::task::{Context, Poll};
    use tokio::io::AsyncReadExt;

    const WAIT: Duration = Duration::from_secs(1);

    /// Sink that fails the first `failures` writes, then records everything.
    struct FlakySink {
        failures: usize,
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl AsyncWrite for FlakySink {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.failures > 0 {
                self.failures -= 1;
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "disk full")));
            }
            self.written.lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn call(id: i64) -> Request {
        Request::new(id, "system.info", vec!["cpu".into(), "mem".into()])
    }

    #[test]
    fn test_drain_task_is_send() {
        fn assert_send<T: Send>(_: &T) {}

        let (sink, _peer) = tokio::io::duplex(64);
        let (_queue, queue_rx) = mpsc::channel::<Response>(1);
        let (error_tx, _errors) = mpsc::channel(1);
        let task = drain(sink, queue_rx, error_tx, Arc::new(Lifecycle::new("test")));
        assert_send(&task);
    }

    #[tokio::test]
    async fn test_writes_in_enqueue_order() {
        let (sink, mut peer) = tokio::io::duplex(4096);
        let writer = MessageWriter::new(sink, PumpConfig::default());

        for id in 1..=3 {
            writer.enqueue(call(id)).unwrap();
        }

        let expected = concat!(
            r#"{"id":1,"method":"system.info","params":["cpu","mem"]}"#, "\n",
            r#"{"id":2,"method":"system.info","params":["cpu","mem"]}"#, "\n",
            r#"{"id":3,"method":"system.info","params":["cpu","mem"]}"#, "\n",
        );
        let mut received = vec![0u8; expected.len()];
        peer.read_exact(&mut received).await.unwrap();
        assert_eq!(String::from_utf8(received).unwrap(), expected);

        writer.stop_serving(WAIT).await.unwrap();
    }

    #[tokio::test]
    async fn test_full_queue_reports_backpressure() {
        let (sink, _peer) = tokio::io::duplex(4096);
        let writer = MessageWriter::new(sink, PumpConfig::default().with_capacity(2));

        // 間に yield が無いので drain タスクはまだ動いていない
        writer.enqueue(call(1)).unwrap();
        writer.enqueue(call(2)).unwrap();
        let err = writer.enqueue(call(3)).unwrap_err();
        assert!(matches!(err, RpcError::Backpressure("MethodWriter")), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_enqueue_after_stop_is_end_of_stream() {
        let (sink, _peer) = tokio::io::duplex(4096);
        let mut writer = MessageWriter::new(sink, PumpConfig::default());

        writer.stop_serving(WAIT).await.unwrap();
        assert_eq!(writer.state(), PumpState::Stopped);

        let err = writer.enqueue(call(1)).unwrap_err();
        assert!(err.is_transport_ended());
        assert!(writer.errors().recv().await.is_none());
    }

    #[tokio::test]
    async fn test_zero_wait_stop_reports_timeout() {
        let (sink, _peer) = tokio::io::duplex(4096);
        let writer = MessageWriter::new(sink, PumpConfig::default());

        let result = writer.stop_serving(Duration::ZERO).await;
        assert!(matches!(result, Err(RpcError::ShutdownTimeout("MethodWriter"))));
        assert!(writer.enqueue(call(1)).unwrap_err().is_transport_ended());
    }

    #[tokio::test]
    async fn test_encode_failure_is_reported_and_draining_continues() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let sink = FlakySink {
            failures: 1,
            written: written.clone(),
        };
        let mut writer = MessageWriter::<Response>::new(sink, PumpConfig::default());

        writer.enqueue(Response::success(1, Value::from("lost"))).unwrap();
        writer.enqueue(Response::success(2, Value::from("kept"))).unwrap();

        let err = tokio::time::timeout(WAIT, writer.errors().recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, RpcError::Io(_)), "got {:?}", err);

        writer.stop_serving(WAIT).await.unwrap();
        let written = String::from_utf8(written.lock().unwrap().clone()).unwrap();
        assert_eq!(written, "{\"id\":2,\"result\":\"kept\"}\n");
    }

    #[tokio::test]
    async fn test_dropping_queue_writes_backlog_then_stops() {
        let (sink, mut peer) = tokio::io::duplex(16);
        let (queue, _errors) = MessageWriter::new(sink, PumpConfig::default()).into_parts();
        let lifecycle = queue.lifecycle();

        for id in 1..=3 {
            queue.enqueue(Response::success(id, Value::from(id))).unwrap();
        }
        drop(queue);

        let mut written = String::new();
        peer.read_to_string(&mut written).await.unwrap();
        assert_eq!(
            written,
            "{\"id\":1,\"result\":1}\n{\"id\":2,\"result\":2}\n{\"id\":3,\"result\":3}\n"
        );
        lifecycle.wait_stopped(WAIT).await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_peer_reports_end_of_stream() {
        let (sink, peer) = tokio::io::duplex(64);
        let mut writer = MessageWriter::new(sink, PumpConfig::default());
        drop(peer);

        writer.enqueue(call(1)).unwrap();
        let err = tokio::time::timeout(WAIT, writer.errors().recv())
            .await
            .unwrap()
            .unwrap();
        assert!(err.is_transport_ended());
    }
}
