mod channel;
mod stream;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{BridgeError, RpcRequest};

pub use channel::{ChannelEndpoint, ChannelTransport};
pub use stream::{EngineCommand, StreamTransport};

/// Receives every inbound message the transport decodes, in arrival order.
pub type InboundHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Told about a request that was accepted by `send` but could not be
/// delivered afterwards.
pub type DeliveryFailureHandler = Arc<dyn Fn(u64, BridgeError) + Send + Sync>;

/// Callbacks a transport reports into once started.
#[derive(Clone)]
pub struct TransportHandlers {
    pub on_message: InboundHandler,
    pub on_delivery_failure: DeliveryFailureHandler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Whole messages arrive as discrete values.
    Channel,
    /// Newline-delimited JSON over a byte stream (child process stdio).
    Stream,
}

/// One way of moving requests out and responses in. The bridge owns exactly
/// one, chosen at construction.
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Begins delivering inbound messages to `handlers`. Must be called
    /// from inside a tokio runtime.
    fn start(&mut self, handlers: TransportHandlers) -> Result<(), BridgeError>;

    /// Queues one request. Fails without blocking if the channel is down.
    /// A write that fails later is reported through
    /// `TransportHandlers::on_delivery_failure` with the request's id.
    fn send(&self, request: &RpcRequest) -> Result<(), BridgeError>;

    /// Releases the channel. Later `send` calls fail with `NotRunning`.
    fn stop(&mut self);

    fn is_running(&self) -> bool;
}
