//! Responder side of a connection.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::config::ServerConfig;
use crate::error::{RpcError, RpcResult};
use crate::handler::CallHandler;
use crate::lifecycle::Lifecycle;
use crate::reader::MessageReader;
use crate::types::{ErrorObject, Request, Response};
use crate::value::Value;
use crate::writer::{MessageWriter, WriteQueue};

/// Decodes incoming calls from `source` and writes replies to `sink`.
pub struct Server {
    reader: Arc<Lifecycle>,
    calls: mpsc::Receiver<Request>,
    errors: mpsc::Receiver<RpcError>,
    replies: WriteQueue<Response>,
    write_errors: mpsc::Receiver<RpcError>,
}

impl Server {
    /// Start a server with default queue sizes. Must be called within a
    /// tokio runtime.
    pub fn new<R, W>(source: R, sink: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::with_config(source, sink, ServerConfig::default())
    }

    pub fn with_config<R, W>(source: R, sink: W, config: ServerConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, calls, errors) =
            MessageReader::<Request>::new(source, config.reader).into_parts();
        let (replies, write_errors) =
            MessageWriter::<Response>::new(sink, config.writer).into_parts();

        Self {
            reader,
            calls,
            errors,
            replies,
            write_errors,
        }
    }

    /// Decoded calls, in stream order.
    pub fn calls(&mut self) -> &mut mpsc::Receiver<Request> {
        &mut self.calls
    }

    /// Decode errors, ending with `TransportEnded`.
    pub fn errors(&mut self) -> &mut mpsc::Receiver<RpcError> {
        &mut self.errors
    }

    /// Failures writing replies.
    pub fn write_errors(&mut self) -> &mut mpsc::Receiver<RpcError> {
        &mut self.write_errors
    }

    /// Queue a reply to call `id`. An error object, when given, replaces the
    /// result on the wire.
    pub fn respond(&self, id: i64, error: Option<ErrorObject>, result: Value) -> RpcResult<()> {
        let reply = match error {
            Some(error) => Response::error(id, error),
            None => Response::success(id, result),
        };
        self.replies.enqueue(reply)
    }

    /// Answer every incoming call with `handler` until the call stream ends.
    ///
    /// Notifications are handled but not answered. Malformed calls are logged
    /// and skipped. Replies wait for room in the write queue rather than
    /// failing with backpressure.
    pub async fn serve<H: CallHandler>(&mut self, handler: &mut H) -> RpcResult<()> {
        debug!("server: serving calls");

        loop {
            tokio::select! {
                biased;
                call = self.calls.recv() => {
                    let Some(call) = call else { break };
                    let id = call.id;
                    let notification = call.is_notification();
                    let outcome = handler.on_call(call).await;
                    if notification {
                        continue;
                    }

                    let reply = match outcome {
                        Ok(result) => Response::success(id, result),
                        Err(error) => Response::error(id, error),
                    };
                    match self.replies.enqueue_wait(reply).await {
                        Ok(()) => {}
                        Err(RpcError::TransportEnded) => break,
                        Err(err) => return Err(err),
                    }
                }
                err = self.errors.recv() => match err {
                    Some(RpcError::TransportEnded) | None => break,
                    Some(RpcError::MalformedMessage(reason)) => {
                        warn!("server: skipping malformed call: {}", reason);
                    }
                    Some(err) => warn!("server: {}", err),
                },
                Some(err) = self.write_errors.recv() => {
                    warn!("server: reply could not be written: {}", err);
                }
            }
        }

        debug!("server: call stream ended");
        Ok(())
    }

    /// Stop reading, write out every reply already queued, then wait up to
    /// `max_wait` for both pumps to stop.
    ///
    /// Unlike [`stop_serving`](Self::stop_serving), queued replies are not
    /// discarded: the writer stops once its queue is empty.
    pub async fn finish(self, max_wait: Duration) -> RpcResult<()> {
        let reader = self.reader.clone();
        let writer = self.replies.lifecycle();
        // 送信側ハンドルを手放すと writer はキューを書き切ってから停止する
        drop(self);

        let (reader, writer) = tokio::join!(
            reader.stop_serving(max_wait),
            writer.wait_stopped(max_wait),
        );
        reader.and(writer)
    }

    /// Stop both pumps concurrently and wait up to `max_wait` for each.
    ///
    /// Replies still queued when the writer stops are discarded.
    pub async fn stop_serving(&self, max_wait: Duration) -> RpcResult<()> {
        let writer = self.replies.lifecycle();
        let (reader, writer) = tokio::join!(
            self.reader.stop_serving(max_wait),
            writer.stop_serving(max_wait),
        );
        reader.and(writer)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        // writer はキューが閉じた時点で残りを書き切って自然に停止する
        self.reader.request_stop();
    }
}
