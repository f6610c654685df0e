use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use serde_json::Value;
use tokio::{sync::oneshot, time};

use super::{
    transport::{Transport, TransportHandlers, TransportKind},
    BridgeError, EngineMethod, RpcRequest, RpcResponse,
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(30_000);

type Resolver = oneshot::Sender<Result<Value, BridgeError>>;
type PendingMap = Arc<Mutex<HashMap<u64, Resolver>>>;

/// Correlation-id request/response channel to the processing engine.
///
/// Any number of calls may be in flight; each resolves from the response
/// carrying its id, in whatever order responses arrive.
pub struct RpcBridge {
    transport: Mutex<Box<dyn Transport>>,
    pending: PendingMap,
    next_id: AtomicU64,
    timeout: Duration,
}

impl RpcBridge {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport: Mutex::new(transport),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.lock_transport().kind()
    }

    pub fn start(&self) -> Result<(), BridgeError> {
        let handlers = TransportHandlers {
            on_message: {
                let pending = self.pending.clone();
                Arc::new(move |message| dispatch(&pending, message))
            },
            on_delivery_failure: {
                let pending = self.pending.clone();
                Arc::new(move |id, error| reject(&pending, id, error))
            },
        };

        let mut transport = self.lock_transport();
        transport.start(handlers)?;
        log_info!("Engine bridge started ({:?} transport)", transport.kind());
        Ok(())
    }

    /// Releases the transport. Calls already waiting keep their timeouts and
    /// expire normally.
    pub fn stop(&self) {
        let mut transport = self.lock_transport();
        if transport.is_running() {
            log_info!("Stopping engine bridge");
        }
        transport.stop();
    }

    pub fn is_running(&self) -> bool {
        self.lock_transport().is_running()
    }

    pub fn pending_count(&self) -> usize {
        lock_pending(&self.pending).len()
    }

    /// Validates `method` against the whitelist, then calls it. Rejections
    /// for a bad method or a stopped channel happen before anything is sent.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        let method: EngineMethod = method.parse()?;
        self.call_method(method, params).await
    }

    pub async fn call_method(
        &self,
        method: EngineMethod,
        params: Value,
    ) -> Result<Value, BridgeError> {
        let (id, receiver) = self.submit(method, params)?;
        let _cleanup = PendingGuard {
            pending: &self.pending,
            id,
        };

        match time::timeout(self.timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::NotRunning),
            Err(_) => {
                log_warn!(
                    "Engine call '{method}' (id {id}) timed out after {}ms",
                    self.timeout.as_millis()
                );
                Err(BridgeError::Timeout {
                    method: method.to_string(),
                    id,
                    after: self.timeout,
                })
            }
        }
    }

    fn submit(
        &self,
        method: EngineMethod,
        params: Value,
    ) -> Result<(u64, oneshot::Receiver<Result<Value, BridgeError>>), BridgeError> {
        let transport = self.lock_transport();
        if !transport.is_running() {
            return Err(BridgeError::NotRunning);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (resolver, receiver) = oneshot::channel();
        lock_pending(&self.pending).insert(id, resolver);

        let request = RpcRequest {
            id,
            method: method.to_string(),
            params,
        };
        if let Err(err) = transport.send(&request) {
            lock_pending(&self.pending).remove(&id);
            return Err(err);
        }
        Ok((id, receiver))
    }

    fn lock_transport(&self) -> MutexGuard<'_, Box<dyn Transport>> {
        match self.transport.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Drops the pending entry when the awaiting call ends for any reason, so a
/// response arriving afterwards finds nothing to resolve.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock_pending(self.pending).remove(&self.id);
    }
}

fn lock_pending(pending: &PendingMap) -> MutexGuard<'_, HashMap<u64, Resolver>> {
    match pending.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn dispatch(pending: &PendingMap, message: Value) {
    let Some(response) = RpcResponse::from_value(&message) else {
        log_warn!("Dropping engine message without a usable id: {message}");
        return;
    };

    let resolver = lock_pending(pending).remove(&response.id);
    match resolver {
        Some(resolver) => {
            let _ = resolver.send(response.into_result());
        }
        None => log_warn!("Dropping engine response for unknown call id {}", response.id),
    }
}

fn reject(pending: &PendingMap, id: u64, error: BridgeError) {
    log_warn!("Engine call {id} was not delivered: {error}");
    if let Some(resolver) = lock_pending(pending).remove(&id) {
        let _ = resolver.send(Err(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{ChannelEndpoint, ChannelTransport};
    use serde_json::json;

    fn started_bridge() -> (Arc<RpcBridge>, ChannelEndpoint) {
        let (transport, endpoint) = ChannelTransport::pair();
        let bridge = Arc::new(RpcBridge::new(Box::new(transport)));
        bridge.start().unwrap();
        (bridge, endpoint)
    }

    #[tokio::test]
    async fn rejects_before_start() {
        let (transport, mut endpoint) = ChannelTransport::pair();
        let bridge = RpcBridge::new(Box::new(transport));

        let err = bridge.call("find_peaks", json!({})).await.unwrap_err();
        assert_eq!(err, BridgeError::NotRunning);
        assert_eq!(bridge.pending_count(), 0);
        assert!(endpoint.requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn unlisted_method_never_reaches_the_engine() {
        let (bridge, mut endpoint) = started_bridge();

        let err = bridge.call("eval", json!({"code": "1"})).await.unwrap_err();
        assert_eq!(err, BridgeError::MethodNotAllowed("eval".into()));
        assert!(endpoint.requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn concurrent_calls_resolve_by_id() {
        let (bridge, mut endpoint) = started_bridge();

        let first = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.call("get_segment", json!({"segment_index": 1})).await }
        });
        let second = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.call("get_segment", json!({"segment_index": 2})).await }
        });

        let a = endpoint.requests.recv().await.unwrap();
        let b = endpoint.requests.recv().await.unwrap();
        assert_ne!(a.id, b.id);

        // Answer in reverse order, echoing each request's params.
        for request in [b, a] {
            endpoint
                .responses
                .send(json!({"id": request.id, "result": request.params["segment_index"]}))
                .unwrap();
        }

        assert_eq!(first.await.unwrap(), Ok(json!(1)));
        assert_eq!(second.await.unwrap(), Ok(json!(2)));
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn engine_error_rejects_the_call() {
        let (bridge, mut endpoint) = started_bridge();
        let call = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.call("load_patient_file", json!({"filename": "x.h5"})).await }
        });

        let request = endpoint.requests.recv().await.unwrap();
        endpoint
            .responses
            .send(json!({"id": request.id, "error": "File not found"}))
            .unwrap();

        assert_eq!(
            call.await.unwrap(),
            Err(BridgeError::Remote("File not found".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_rejects_and_late_reply_is_ignored() {
        let (transport, mut endpoint) = ChannelTransport::pair();
        let bridge = Arc::new(
            RpcBridge::new(Box::new(transport)).with_timeout(Duration::from_millis(500)),
        );
        bridge.start().unwrap();

        let slow = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.call("find_peaks", json!({})).await }
        });
        let request = endpoint.requests.recv().await.unwrap();

        let err = slow.await.unwrap().unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(bridge.pending_count(), 0);

        endpoint
            .responses
            .send(json!({"id": request.id, "result": "late"}))
            .unwrap();
        tokio::task::yield_now().await;
        assert_eq!(bridge.pending_count(), 0);
        assert!(bridge.is_running());
    }

    #[tokio::test]
    async fn stray_messages_are_dropped() {
        let (bridge, mut endpoint) = started_bridge();
        endpoint.responses.send(json!({"result": 1})).unwrap();
        endpoint.responses.send(json!({"id": 999, "result": 1})).unwrap();
        endpoint.responses.send(json!("noise")).unwrap();

        let call = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.call("get_csv_files", json!({"folder": "."})).await }
        });
        let request = endpoint.requests.recv().await.unwrap();
        endpoint
            .responses
            .send(json!({"id": request.id, "result": ["a.h5"]}))
            .unwrap();

        assert_eq!(call.await.unwrap(), Ok(json!(["a.h5"])));
    }

    #[tokio::test]
    async fn stop_blocks_new_calls() {
        let (bridge, _endpoint) = started_bridge();
        bridge.stop();

        assert!(!bridge.is_running());
        assert_eq!(
            bridge.call("get_csv_files", json!({})).await,
            Err(BridgeError::NotRunning)
        );
    }
}
