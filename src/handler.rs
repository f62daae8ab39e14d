use async_trait::async_trait;

use crate::types::{ErrorObject, Request};
use crate::value::Value;

/// Answers calls for [`Server::serve`](crate::Server::serve).
#[async_trait]
pub trait CallHandler: Send {
    /// Handle one decoded call. The outcome is written back unless the call
    /// is a notification.
    async fn on_call(&mut self, request: Request) -> Result<Value, ErrorObject>;
}
