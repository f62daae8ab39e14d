//! Reading pump: decodes messages from a byte source into a bounded queue.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::codec::StreamDecoder;
use crate::config::PumpConfig;
use crate::error::{is_disconnect, RpcError, RpcResult};
use crate::lifecycle::{Lifecycle, PumpState};
use crate::types::WireMessage;

/// Decoding pump for one message kind.
///
/// Two tasks back each reader. The decode task owns the source and publishes
/// every decoded message, blocking while the consumer lags. End-of-stream is
/// published once on the error queue and ends decoding for good; malformed
/// input is published there too but decoding carries on. The stop task waits
/// for a stop request, closes the source and reports completion as soon as the
/// source is released, whether or not anyone drains the queues.
pub struct MessageReader<M: WireMessage> {
    lifecycle: Arc<Lifecycle>,
    messages: mpsc::Receiver<M>,
    errors: mpsc::Receiver<RpcError>,
}

impl<M: WireMessage> MessageReader<M> {
    /// Start reading from `source`. Must be called within a tokio runtime.
    pub fn new<R>(source: R, config: PumpConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let lifecycle = Arc::new(Lifecycle::new(M::READER));
        let (message_tx, messages) = mpsc::channel(config.queue_capacity());
        let (error_tx, errors) = mpsc::channel(config.queue_capacity());
        let closed = CancellationToken::new();
        let released = CancellationToken::new();

        let decoder = DecodeTask::<R, M> {
            source,
            decoder: StreamDecoder::new(),
            read_buffer: config.read_buffer_size(),
            closed: closed.clone(),
            released: released.clone(),
            messages: message_tx,
            errors: error_tx,
            _kind: PhantomData,
        };
        tokio::spawn(decoder.run());

        let stop_lifecycle = lifecycle.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = stop_lifecycle.stop_requested() => {
                    debug!("{}: closing source", stop_lifecycle.name());
                    closed.cancel();
                    // ソースの解放だけを待つ（キューの消費者には依存しない）
                    released.cancelled().await;
                }
                _ = released.cancelled() => {
                    debug!("{}: source ended before stop was requested", stop_lifecycle.name());
                }
            }
            stop_lifecycle.mark_stopped();
        });

        Self {
            lifecycle,
            messages,
            errors,
        }
    }

    /// Decoded messages, in stream order.
    pub fn messages(&mut self) -> &mut mpsc::Receiver<M> {
        &mut self.messages
    }

    /// Decode errors, ending with `TransportEnded`.
    ///
    /// If the queue is full when a stop is requested, the sentinel is dropped
    /// and the queue simply closes.
    pub fn errors(&mut self) -> &mut mpsc::Receiver<RpcError> {
        &mut self.errors
    }

    pub fn state(&self) -> PumpState {
        self.lifecycle.state()
    }

    pub fn lifecycle(&self) -> Arc<Lifecycle> {
        self.lifecycle.clone()
    }

    pub async fn stop_serving(&self, max_wait: Duration) -> RpcResult<()> {
        self.lifecycle.stop_serving(max_wait).await
    }

    /// Splits the reader into its stop handle and its two queues.
    pub fn into_parts(
        self,
    ) -> (
        Arc<Lifecycle>,
        mpsc::Receiver<M>,
        mpsc::Receiver<RpcError>,
    ) {
        (self.lifecycle, self.messages, self.errors)
    }
}

struct DecodeTask<R, M> {
    source: R,
    decoder: StreamDecoder,
    read_buffer: usize,
    closed: CancellationToken,
    released: CancellationToken,
    messages: mpsc::Sender<M>,
    errors: mpsc::Sender<RpcError>,
    _kind: PhantomData<fn() -> M>,
}

/// Why decoding stopped.
enum Halt {
    /// Source closed, reset, or closed by a stop request
    EndOfStream,
    /// Nobody is listening anymore
    ConsumerGone,
}

impl<R, M> DecodeTask<R, M>
where
    R: AsyncRead + Unpin + Send + 'static,
    M: WireMessage,
{
    async fn run(mut self) {
        debug!("{}: decode task started", M::READER);

        let halt = self.pump().await;
        // EOF を通知する前にソースを解放する
        let DecodeTask {
            source,
            closed,
            released,
            errors,
            ..
        } = self;
        drop(source);
        released.cancel();

        if let Halt::EndOfStream = halt {
            if closed.is_cancelled() {
                // 停止要求後は消費者を待たない
                match errors.try_send(RpcError::TransportEnded) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!("{}: error queue full, end of stream left implicit", M::READER);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        trace!("{}: nobody left to observe end of stream", M::READER);
                    }
                }
            } else if errors.send(RpcError::TransportEnded).await.is_err() {
                trace!("{}: nobody left to observe end of stream", M::READER);
            }
        }

        debug!("{}: decode task stopped", M::READER);
    }

    async fn pump(&mut self) -> Halt {
        let mut chunk = vec![0u8; self.read_buffer];

        loop {
            while let Some(decoded) = self.decoder.next_value() {
                let outcome = decoded.and_then(|value| {
                    serde_json::from_value::<M>(value)
                        .map_err(|err| RpcError::MalformedMessage(err.to_string()))
                });

                let halt = match outcome {
                    Ok(message) => self.publish(message).await,
                    Err(err) => self.report(err).await,
                };
                if let Some(halt) = halt {
                    return halt;
                }
            }

            let read = tokio::select! {
                biased;
                _ = self.closed.cancelled() => return Halt::EndOfStream,
                read = self.source.read(&mut chunk) => read,
            };

            match read {
                Ok(0) => {
                    if self.decoder.has_partial() {
                        debug!("{}: stream closed in the middle of a message", M::READER);
                    }
                    return Halt::EndOfStream;
                }
                Ok(n) => self.decoder.extend(&chunk[..n]),
                Err(err) if is_disconnect(&err) => return Halt::EndOfStream,
                Err(err) => {
                    warn!("{}: read failed: {}", M::READER, err);
                    let _ = self.report(RpcError::Io(err)).await;
                    return Halt::EndOfStream;
                }
            }
        }
    }

    async fn publish(&mut self, message: M) -> Option<Halt> {
        trace!("{}: decoded message id={}", M::READER, message.id());
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Some(Halt::EndOfStream),
            sent = self.messages.send(message) => match sent {
                Ok(()) => None,
                Err(_) => Some(Halt::ConsumerGone),
            },
        }
    }

    async fn report(&mut self, err: RpcError) -> Option<Halt> {
        debug!("{}: {}", M::READER, err);
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Some(Halt::EndOfStream),
            sent = self.errors.send(err) => match sent {
                Ok(()) => None,
                Err(_) => Some(Halt::ConsumerGone),
            },
        }
    }
}
