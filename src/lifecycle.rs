//! Two-phase stop protocol shared by every pump.
//!
//! A pump moves `Running -> Draining -> Stopped`. Stopping is requested at
//! most once through an idempotent guard, and completion is broadcast through
//! a cancellation token so any number of callers can wait on it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::debug;
use tokio_util::sync::CancellationToken;

use crate::error::{RpcError, RpcResult};

/// Observable state of a pump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    Running,
    /// A stop was requested but resources are not yet released
    Draining,
    Stopped,
}

#[derive(Debug)]
pub struct Lifecycle {
    name: &'static str,
    stop_requested: AtomicBool,
    requested: CancellationToken,
    stopped: CancellationToken,
}

impl Lifecycle {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            stop_requested: AtomicBool::new(false),
            requested: CancellationToken::new(),
            stopped: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> PumpState {
        if self.stopped.is_cancelled() {
            PumpState::Stopped
        } else if self.requested.is_cancelled() {
            PumpState::Draining
        } else {
            PumpState::Running
        }
    }

    /// True once a stop was requested or the pump already stopped on its own.
    pub fn is_closing(&self) -> bool {
        self.state() != PumpState::Running
    }

    /// Signals "stop requested". Returns false if it had already been signalled.
    pub fn request_stop(&self) -> bool {
        if self.stop_requested.swap(true, Ordering::AcqRel) {
            return false;
        }
        debug!("{}: stop requested", self.name);
        self.requested.cancel();
        true
    }

    /// Signals "stop complete". Called by the worker owning the pump's resources
    /// once they have been released.
    pub fn mark_stopped(&self) {
        if !self.stopped.is_cancelled() {
            debug!("{}: stopped", self.name);
        }
        self.stopped.cancel();
    }

    /// Resolves once a stop has been requested.
    pub async fn stop_requested(&self) {
        self.requested.cancelled().await
    }

    /// Resolves once the pump has stopped.
    pub async fn stopped(&self) {
        self.stopped.cancelled().await
    }

    /// Request a stop and wait up to `max_wait` for it to complete.
    ///
    /// A zero `max_wait` never waits: it succeeds if the pump has already
    /// stopped, otherwise it requests the stop and reports a timeout. A timed
    /// out stop still completes in the background.
    pub async fn stop_serving(&self, max_wait: Duration) -> RpcResult<()> {
        if max_wait.is_zero() {
            if self.stopped.is_cancelled() {
                return Ok(());
            }
            self.request_stop();
            return Err(RpcError::ShutdownTimeout(self.name));
        }

        self.request_stop();
        self.wait_stopped(max_wait).await
    }

    /// Wait up to `max_wait` for the pump to stop without requesting it.
    pub async fn wait_stopped(&self, max_wait: Duration) -> RpcResult<()> {
        match tokio::time::timeout(max_wait, self.stopped.cancelled()).await {
            Ok(()) => Ok(()),
            Err(_) => {
                debug!("{}: stop did not complete within {:?}", self.name, max_wait);
                Err(RpcError::ShutdownTimeout(self.name))
            }
        }
    }
}
