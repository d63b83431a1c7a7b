// src/network/handler.rs
// Application side of a protocol: decides how each accepted request is answered.

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use super::message::{Message, ResponseType};
use super::ranking::PeerId;

/// Response type and payload chosen by a handler
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerResponse {
    pub response: ResponseType,
    pub data: Value,
}

impl HandlerResponse {
    pub fn ack(data: Value) -> Self {
        Self {
            response: ResponseType::Ack,
            data,
        }
    }

    pub fn nack() -> Self {
        Self::empty(ResponseType::Nack)
    }

    pub fn busy() -> Self {
        Self::empty(ResponseType::Busy)
    }

    fn empty(response: ResponseType) -> Self {
        Self {
            response,
            data: Value::Object(Default::default()),
        }
    }
}

/// Returning an error answers the request with NACK and ends the session.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message, remote: PeerId) -> anyhow::Result<HandlerResponse>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message, PeerId) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<HandlerResponse>> + Send + 'static,
{
    async fn handle(&self, message: Message, remote: PeerId) -> anyhow::Result<HandlerResponse> {
        (self.0)(message, remote).await
    }
}

/// Wrap an async closure as a handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message, PeerId) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<HandlerResponse>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Answers every ping with ACK and echoes the payload back.
pub struct PingHandler;

#[async_trait]
impl MessageHandler for PingHandler {
    async fn handle(&self, message: Message, remote: PeerId) -> anyhow::Result<HandlerResponse> {
        tracing::debug!(peer = %remote, "ping");
        Ok(HandlerResponse::ack(message.data))
    }
}
