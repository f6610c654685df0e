//! Bridge over a newline-delimited byte stream, with a scripted engine on
//! the far end of an in-memory duplex pipe.

use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use labeler_lib::bridge::{BridgeError, RpcBridge, RpcRequest, StreamTransport};
use serde_json::{json, Value};
use tokio::io::{
    AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf,
};

struct FakeEngine {
    requests: Lines<BufReader<ReadHalf<DuplexStream>>>,
    output: WriteHalf<DuplexStream>,
}

impl FakeEngine {
    async fn next_request(&mut self) -> RpcRequest {
        let line = self.requests.next_line().await.unwrap().expect("request line");
        serde_json::from_str(&line).unwrap()
    }

    async fn write(&mut self, bytes: &[u8]) {
        self.output.write_all(bytes).await.unwrap();
        self.output.flush().await.unwrap();
    }

    async fn respond(&mut self, message: Value) {
        let mut line = serde_json::to_vec(&message).unwrap();
        line.push(b'\n');
        self.write(&line).await;
    }
}

fn connect(timeout: Duration) -> (Arc<RpcBridge>, FakeEngine) {
    let (ours, theirs) = tokio::io::duplex(4096);
    let (our_read, our_write) = tokio::io::split(ours);
    let (their_read, their_write) = tokio::io::split(theirs);

    let bridge = Arc::new(
        RpcBridge::new(Box::new(StreamTransport::from_io(our_read, our_write)))
            .with_timeout(timeout),
    );
    bridge.start().unwrap();

    let engine = FakeEngine {
        requests: BufReader::new(their_read).lines(),
        output: their_write,
    };
    (bridge, engine)
}

#[tokio::test]
async fn reordered_and_fragmented_responses_resolve_by_id() {
    let (bridge, mut engine) = connect(Duration::from_secs(5));

    let first = tokio::spawn({
        let bridge = bridge.clone();
        async move { bridge.call("find_peaks", json!({"segment_index": 0})).await }
    });
    let a = engine.next_request().await;
    let second = tokio::spawn({
        let bridge = bridge.clone();
        async move { bridge.call("find_peaks", json!({"segment_index": 1})).await }
    });
    let b = engine.next_request().await;

    assert_eq!(a.method, "find_peaks");
    assert_eq!(a.params, json!({"segment_index": 0}));
    assert_ne!(a.id, b.id);

    // Second answer first, split mid-object, with a junk line in between.
    let reply_b = format!("{{\"id\": {}, \"result\": {{\"systolic\": [1]}}}}\n", b.id);
    let (head, tail) = reply_b.split_at(9);
    engine.write(head.as_bytes()).await;
    engine.write(tail.as_bytes()).await;
    engine.write(b"this is not json\n\n").await;

    let second = second.await.unwrap();
    assert_eq!(second, Ok(json!({"systolic": [1]})));
    assert!(!first.is_finished());

    engine
        .respond(json!({"id": a.id, "result": {"systolic": [0]}}))
        .await;
    assert_eq!(first.await.unwrap(), Ok(json!({"systolic": [0]})));
    assert_eq!(bridge.pending_count(), 0);
    assert!(bridge.is_running());
}

#[tokio::test]
async fn late_response_after_timeout_is_ignored() {
    let (bridge, mut engine) = connect(Duration::from_millis(100));

    let call = bridge.call("calculate_derivative", json!({"signal_data": [1, 2, 3]}));
    let (result, request) = tokio::join!(call, engine.next_request());
    assert_eq!(request.method, "calculate_derivative");
    let stale_id = request.id;
    let error = result.unwrap_err();
    assert!(error.is_timeout());

    engine.respond(json!({"id": stale_id, "result": [9]})).await;

    // The channel is still usable and the stale reply is not delivered to
    // the next call.
    let next = tokio::spawn({
        let bridge = bridge.clone();
        async move { bridge.call("get_csv_files", json!({"folder": "."})).await }
    });
    let request = engine.next_request().await;
    assert_ne!(request.id, stale_id);
    engine
        .respond(json!({"id": request.id, "result": ["a.h5"]}))
        .await;
    assert_eq!(next.await.unwrap(), Ok(json!(["a.h5"])));
}

#[tokio::test]
async fn engine_error_and_closed_stream() {
    let (bridge, mut engine) = connect(Duration::from_secs(5));

    let call = tokio::spawn({
        let bridge = bridge.clone();
        async move { bridge.call("load_patient_file", json!({"filename": "x.h5"})).await }
    });
    let request = engine.next_request().await;
    engine
        .respond(json!({"id": request.id, "error": "No such file"}))
        .await;
    assert_eq!(
        call.await.unwrap(),
        Err(BridgeError::Remote("No such file".into()))
    );

    drop(engine);
    for _ in 0..100 {
        if !bridge.is_running() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!bridge.is_running());
    assert_eq!(
        bridge.call("get_csv_files", json!({})).await,
        Err(BridgeError::NotRunning)
    );
}

#[tokio::test]
async fn stop_rejects_new_calls_but_pending_ones_time_out() {
    let (bridge, mut engine) = connect(Duration::from_millis(150));

    let pending = tokio::spawn({
        let bridge = bridge.clone();
        async move { bridge.call("find_upslope", json!({})).await }
    });
    engine.next_request().await;

    bridge.stop();
    assert_eq!(
        bridge.call("find_upslope", json!({})).await,
        Err(BridgeError::NotRunning)
    );
    assert!(pending.await.unwrap().unwrap_err().is_timeout());
}

/// An engine stdin that has already gone away.
struct ClosedPipe;

impl AsyncWrite for ClosedPipe {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[tokio::test]
async fn write_failure_rejects_the_call_immediately() {
    let (ours, _theirs) = tokio::io::duplex(64);
    let bridge = RpcBridge::new(Box::new(StreamTransport::from_io(ours, ClosedPipe)))
        .with_timeout(Duration::from_secs(5));
    bridge.start().unwrap();

    let started = Instant::now();
    let result = bridge.call("get_csv_files", json!({"folder": "."})).await;

    assert!(matches!(result, Err(BridgeError::Transport(ref reason)) if reason.contains("write")));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(bridge.pending_count(), 0);
    assert!(!bridge.is_running());
    assert_eq!(
        bridge.call("get_csv_files", json!({})).await,
        Err(BridgeError::NotRunning)
    );
}
