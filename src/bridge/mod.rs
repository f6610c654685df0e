//! Request/response bridge to the out-of-process signal engine.

mod client;
mod error;
mod framing;
mod protocol;
mod transport;

pub use client::{RpcBridge, DEFAULT_CALL_TIMEOUT};
pub use error::BridgeError;
pub use framing::{encode_line, LineFramer};
pub use protocol::{EngineMethod, RpcRequest, RpcResponse};
pub use transport::{
    ChannelEndpoint, ChannelTransport, DeliveryFailureHandler, EngineCommand, InboundHandler,
    StreamTransport, Transport, TransportHandlers, TransportKind,
};
