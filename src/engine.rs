//! Caller-side dispatch loop.
//!
//! One task owns the waiter table and the end-of-stream flag. It schedules
//! outgoing calls, matches decoded replies to their waiters by id, and cancels
//! every pending waiter once the reply stream ends.

use std::collections::HashMap;

use log::{debug, trace, warn};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{RpcError, RpcResult};
use crate::types::{Request, Response};
use crate::value::Value;
use crate::writer::WriteQueue;

pub(crate) type Waiter = oneshot::Sender<RpcResult<Value>>;

/// Work handed to the dispatch loop
pub(crate) enum Command {
    Call { request: Request, waiter: Waiter },
}

pub(crate) struct Dispatcher {
    commands: mpsc::Receiver<Command>,
    shutdown: CancellationToken,
    writer: WriteQueue<Request>,
    replies: Option<mpsc::Receiver<Response>>,
    reader_errors: Option<mpsc::Receiver<RpcError>>,
    writer_errors: Option<mpsc::Receiver<RpcError>>,
    waiters: HashMap<i64, Waiter>,
    ended: bool,
}

impl Dispatcher {
    pub(crate) fn new(
        commands: mpsc::Receiver<Command>,
        shutdown: CancellationToken,
        writer: WriteQueue<Request>,
        writer_errors: mpsc::Receiver<RpcError>,
        replies: mpsc::Receiver<Response>,
        reader_errors: mpsc::Receiver<RpcError>,
    ) -> Self {
        Self {
            commands,
            shutdown,
            writer,
            replies: Some(replies),
            reader_errors: Some(reader_errors),
            writer_errors: Some(writer_errors),
            waiters: HashMap::new(),
            ended: false,
        }
    }

    pub(crate) async fn run_main_loop(mut self) {
        debug!("dispatch loop started");

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                // EOF より先に届いた応答を取りこぼさないよう応答を優先
                reply = recv_or_pending(&mut self.replies) => match reply {
                    Some(reply) => self.resolve(reply),
                    None => {
                        self.replies = None;
                        self.end_of_stream();
                    }
                },
                err = recv_or_pending(&mut self.reader_errors) => match err {
                    Some(err) => self.on_reader_error(err),
                    None => {
                        self.reader_errors = None;
                        self.end_of_stream();
                    }
                },
                // 呼び出しのスケジューリング
                command = self.commands.recv() => match command {
                    Some(command) => self.schedule(command),
                    None => break,
                },
                // 書き込みエラーはログに残すだけ
                err = recv_or_pending(&mut self.writer_errors) => match err {
                    Some(err) => warn!("call could not be written: {}", err),
                    None => self.writer_errors = None,
                },
            }
        }

        self.close();
        debug!("dispatch loop stopped");
    }

    fn schedule(&mut self, command: Command) {
        match command {
            Command::Call { request, waiter } => self.schedule_call(request, waiter),
        }
    }

    fn schedule_call(&mut self, request: Request, waiter: Waiter) {
        let id = request.id;
        // 同じIDの呼び出しが応答待ちなら書き込まずに拒否
        if id != 0 && self.waiters.contains_key(&id) {
            let _ = waiter.send(Err(RpcError::DuplicateId(id)));
            return;
        }

        trace!("scheduling call id={} method={}", id, request.method);
        if let Err(err) = self.writer.enqueue(request) {
            let _ = waiter.send(Err(err));
            return;
        }

        if id == 0 {
            let _ = waiter.send(Ok(Value::Null));
            return;
        }

        self.waiters.insert(id, waiter);
        // 既に EOF を受信済みなら即座に取り消す
        if self.ended {
            self.cancel_waiters();
        }
    }

    fn resolve(&mut self, reply: Response) {
        match self.waiters.remove(&reply.id) {
            Some(waiter) => {
                trace!("resolving call id={}", reply.id);
                let _ = waiter.send(reply.into_outcome());
            }
            None => debug!("discarding reply for unknown id={}", reply.id),
        }
    }

    fn on_reader_error(&mut self, err: RpcError) {
        match err {
            RpcError::TransportEnded => self.end_of_stream(),
            err => debug!("reply stream: {}", err),
        }
    }

    fn end_of_stream(&mut self) {
        if !self.ended {
            debug!("reply stream ended, {} call(s) pending", self.waiters.len());
        }
        self.ended = true;
        self.cancel_waiters();
    }

    fn cancel_waiters(&mut self) {
        for (_, waiter) in self.waiters.drain() {
            let _ = waiter.send(Err(RpcError::TransportEnded));
        }
    }

    fn close(&mut self) {
        self.commands.close();
        while let Ok(Command::Call { waiter, .. }) = self.commands.try_recv() {
            let _ = waiter.send(Err(RpcError::TransportEnded));
        }
        self.cancel_waiters();
    }
}

async fn recv_or_pending<T>(queue: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match queue {
        Some(queue) => queue.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PumpConfig;
    use crate::writer::MessageWriter;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    const WAIT: Duration = Duration::from_secs(1);

    struct Harness {
        commands: mpsc::Sender<Command>,
        replies: mpsc::Sender<Response>,
        reader_errors: mpsc::Sender<RpcError>,
        shutdown: CancellationToken,
        wire: tokio::io::DuplexStream,
    }

    fn start() -> Harness {
        let (sink, wire) = tokio::io::duplex(4096);
        let (queue, writer_errors) =
            MessageWriter::<Request>::new(sink, PumpConfig::default()).into_parts();
        let (commands, command_rx) = mpsc::channel(10);
        let (replies, reply_rx) = mpsc::channel(10);
        let (reader_errors, reader_error_rx) = mpsc::channel(10);
        let shutdown = CancellationToken::new();

        let dispatcher = Dispatcher::new(
            command_rx,
            shutdown.clone(),
            queue,
            writer_errors,
            reply_rx,
            reader_error_rx,
        );
        tokio::spawn(dispatcher.run_main_loop());

        Harness {
            commands,
            replies,
            reader_errors,
            shutdown,
            wire,
        }
    }

    async fn submit(
        harness: &Harness,
        id: i64,
        method: &str,
    ) -> oneshot::Receiver<RpcResult<Value>> {
        let (waiter, outcome) = oneshot::channel();
        harness
            .commands
            .send(Command::Call {
                request: Request::new(id, method, vec![]),
                waiter,
            })
            .await
            .unwrap();
        outcome
    }

    #[tokio::test]
    async fn test_reply_resolves_waiter() {
        let mut harness = start();
        let outcome = submit(&harness, 7, "ping").await;

        let expected = b"{\"id\":7,\"method\":\"ping\",\"params\":[]}\n";
        let mut written = vec![0u8; expected.len()];
        harness.wire.read_exact(&mut written).await.unwrap();
        assert_eq!(&written[..], &expected[..]);

        harness
            .replies
            .send(Response::success(7, Value::from("pong")))
            .await
            .unwrap();

        let result = tokio::time::timeout(WAIT, outcome).await.unwrap().unwrap();
        assert_eq!(result.unwrap(), Value::from("pong"));
    }

    #[tokio::test]
    async fn test_unknown_reply_is_discarded() {
        let mut harness = start();
        let outcome = submit(&harness, 1, "slow").await;

        // 書き込まれた時点で待機者は登録済み
        let expected = b"{\"id\":1,\"method\":\"slow\",\"params\":[]}\n";
        let mut written = vec![0u8; expected.len()];
        harness.wire.read_exact(&mut written).await.unwrap();

        harness
            .replies
            .send(Response::success(99, Value::Null))
            .await
            .unwrap();
        harness
            .replies
            .send(Response::success(1, Value::from(true)))
            .await
            .unwrap();

        let result = tokio::time::timeout(WAIT, outcome).await.unwrap().unwrap();
        assert_eq!(result.unwrap(), Value::Bool(true));
    }

    #[tokio::test]
    async fn test_notification_resolves_once_written() {
        let harness = start();
        let outcome = submit(&harness, 0, "log").await;

        let result = tokio::time::timeout(WAIT, outcome).await.unwrap().unwrap();
        assert_eq!(result.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_end_of_stream_cancels_pending_and_later_calls() {
        let harness = start();
        let first = submit(&harness, 1, "a").await;
        let second = submit(&harness, 2, "b").await;

        harness
            .reader_errors
            .send(RpcError::TransportEnded)
            .await
            .unwrap();

        for outcome in [first, second] {
            let result = tokio::time::timeout(WAIT, outcome).await.unwrap().unwrap();
            assert!(result.unwrap_err().is_transport_ended());
        }

        let late = submit(&harness, 3, "c").await;
        let result = tokio::time::timeout(WAIT, late).await.unwrap().unwrap();
        assert!(result.unwrap_err().is_transport_ended());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_pending_waiters() {
        let harness = start();
        let outcome = submit(&harness, 4, "never").await;

        harness.shutdown.cancel();

        let result = tokio::time::timeout(WAIT, outcome).await.unwrap().unwrap();
        assert!(result.unwrap_err().is_transport_ended());
        assert!(harness.commands.send(Command::Call {
            request: Request::new(5, "late", vec![]),
            waiter: oneshot::channel().0,
        })
        .await
        .is_err());
    }
}
