use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use serde_json::Value;
use tokio::{runtime::Handle, sync::mpsc, task::JoinHandle};

use super::{Transport, TransportHandlers, TransportKind};
use crate::bridge::{BridgeError, RpcRequest};

/// Far side of a [`ChannelTransport`]: whatever serves the engine reads
/// requests here and answers on `responses`.
pub struct ChannelEndpoint {
    pub requests: mpsc::UnboundedReceiver<RpcRequest>,
    pub responses: mpsc::UnboundedSender<Value>,
}

/// Structured message channel. No framing; each response is already a
/// decoded JSON value.
pub struct ChannelTransport {
    requests: mpsc::UnboundedSender<RpcRequest>,
    responses: Option<mpsc::UnboundedReceiver<Value>>,
    running: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
}

impl ChannelTransport {
    pub fn pair() -> (Self, ChannelEndpoint) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();

        let transport = Self {
            requests: request_tx,
            responses: Some(response_rx),
            running: Arc::new(AtomicBool::new(false)),
            pump: None,
        };
        let endpoint = ChannelEndpoint {
            requests: request_rx,
            responses: response_tx,
        };
        (transport, endpoint)
    }
}

impl Transport for ChannelTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Channel
    }

    /// Sends are synchronous here, so delivery failures surface from `send`
    /// and the failure handler is never needed.
    fn start(&mut self, handlers: TransportHandlers) -> Result<(), BridgeError> {
        let mut responses = self.responses.take().ok_or(BridgeError::AlreadyStarted)?;
        let runtime = Handle::try_current()
            .map_err(|err| BridgeError::Transport(format!("no async runtime: {err}")))?;

        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);
        let on_message = handlers.on_message;

        self.pump = Some(runtime.spawn(async move {
            while let Some(message) = responses.recv().await {
                on_message(message);
            }
            running.store(false, Ordering::SeqCst);
            log::info!("Engine channel closed by the far side");
        }));
        Ok(())
    }

    fn send(&self, request: &RpcRequest) -> Result<(), BridgeError> {
        if !self.is_running() {
            return Err(BridgeError::NotRunning);
        }
        self.requests
            .send(request.clone())
            .map_err(|_| BridgeError::NotRunning)
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.requests.is_closed()
    }
}
