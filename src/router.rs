//! Command registry and dispatch
//!
//! The router decodes command envelopes, looks the command up in a registry
//! built once at construction and turns whatever the handler returns into
//! outbound messages. Admission rules live in the handlers.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::handlers::{self, DeviceContext};
use crate::protocol::{CommandEnvelope, ItemStream, OutboundMessage, ResponseEnvelope};
use crate::{MctError, Result};

/// What a handler produced
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Single response
    Done(ResponseEnvelope),
    /// List result, chunked when it does not fit one message
    Stream(ItemStream),
    /// A worker sends the response later
    Deferred,
}

#[async_trait::async_trait]
pub trait CommandHandler: Send + Sync {
    /// Wire name of the command
    fn name(&self) -> &'static str;

    async fn handle(&self, ctx: &Arc<DeviceContext>, params: &Value) -> Result<Reply>;
}

/// Response for a failed command
pub fn error_response(command: &str, err: &MctError) -> ResponseEnvelope {
    match err {
        MctError::Busy(message) => ResponseEnvelope::busy(command, message.as_str()),
        MctError::Timeout(message) => ResponseEnvelope::timeout(command, message.as_str()),
        MctError::InvalidParameter(message)
        | MctError::Protocol(message)
        | MctError::Capture(message)
        | MctError::Storage(message) => ResponseEnvelope::error(command, message.as_str()),
        other => ResponseEnvelope::error(command, other.to_string()),
    }
}

/// Encode one response into a reply message
pub fn reply(envelope: &ResponseEnvelope) -> Option<OutboundMessage> {
    match envelope.encode() {
        Ok(bytes) => Some(OutboundMessage::Reply(bytes)),
        Err(e) => {
            log::error!("Failed to encode {} response: {}", envelope.command, e);
            None
        }
    }
}

/// Command router
pub struct CommandRouter {
    handlers: HashMap<&'static str, Arc<dyn CommandHandler>>,
    ctx: Arc<DeviceContext>,
}

impl std::fmt::Debug for CommandRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRouter")
            .field("commands", &self.commands())
            .finish()
    }
}

impl CommandRouter {
    pub fn new(ctx: Arc<DeviceContext>, handlers: Vec<Arc<dyn CommandHandler>>) -> Self {
        let handlers = handlers
            .into_iter()
            .map(|handler| (handler.name(), handler))
            .collect();
        Self { handlers, ctx }
    }

    /// Router with every built-in command registered
    pub fn with_default_handlers(ctx: Arc<DeviceContext>) -> Self {
        Self::new(ctx, handlers::default_handlers())
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    /// Registered command names, sorted
    pub fn commands(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Decode and dispatch one inbound message
    pub async fn route(&self, bytes: &[u8]) -> Vec<OutboundMessage> {
        match CommandEnvelope::decode(bytes) {
            Ok(envelope) => self.dispatch(&envelope).await,
            Err(e) => {
                log::warn!("Rejected command: {}", e);
                reply(&ResponseEnvelope::error("", e.to_string()))
                    .into_iter()
                    .collect()
            }
        }
    }

    pub async fn dispatch(&self, envelope: &CommandEnvelope) -> Vec<OutboundMessage> {
        let command = envelope.command.as_str();
        let handler = match self.handlers.get(command) {
            Some(handler) => handler,
            None => {
                log::warn!("Unknown command: {}", command);
                return reply(&ResponseEnvelope::invalid_command(command))
                    .into_iter()
                    .collect();
            }
        };

        log::debug!("Processing command: {}", command);
        match handler.handle(&self.ctx, &envelope.params).await {
            Ok(Reply::Done(response)) => reply(&response).into_iter().collect(),
            Ok(Reply::Stream(stream)) => {
                let ceiling = self.ctx.config.transport.max_message_size;
                match stream.encode(command, ceiling) {
                    Ok(messages) => messages.into_iter().map(OutboundMessage::Reply).collect(),
                    Err(e) => reply(&error_response(command, &e)).into_iter().collect(),
                }
            }
            Ok(Reply::Deferred) => Vec::new(),
            Err(e) => {
                log::info!("{} failed: {}", command, e);
                reply(&error_response(command, &e)).into_iter().collect()
            }
        }
    }
}
