use std::{
    path::PathBuf,
    process::Stdio,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    process::{Child, ChildStderr, Command},
    runtime::Handle,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

use super::{DeliveryFailureHandler, InboundHandler, Transport, TransportHandlers, TransportKind};
use crate::bridge::{framing, BridgeError, LineFramer, RpcRequest};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

const READ_CHUNK: usize = 8 * 1024;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One encoded request line, tagged with its call id.
type Outbound = (u64, Vec<u8>);

/// How to launch the external engine process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl EngineCommand {
    /// Splits a whitespace-separated command line. `None` if it is blank.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
            working_dir: None,
        })
    }
}

struct PendingIo {
    reader: BoxedReader,
    writer: BoxedWriter,
    stderr: Option<ChildStderr>,
}

/// Newline-delimited JSON over a byte stream, normally a child process's
/// stdin/stdout.
pub struct StreamTransport {
    io: Option<PendingIo>,
    child: Option<Child>,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl StreamTransport {
    pub fn spawn_process(command: &EngineCommand) -> Result<Self, BridgeError> {
        let mut builder = Command::new(&command.program);
        builder
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.working_dir {
            builder.current_dir(dir);
        }

        let mut child = builder.spawn().map_err(|err| {
            BridgeError::Transport(format!("failed to spawn '{}': {err}", command.program))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Transport("engine stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Transport("engine stdout unavailable".into()))?;
        let stderr = child.stderr.take();

        log_info!("Spawned engine process: {} {:?}", command.program, command.args);

        let mut transport = Self::from_io(stdout, stdin);
        transport.child = Some(child);
        if let Some(io) = transport.io.as_mut() {
            io.stderr = stderr;
        }
        Ok(transport)
    }

    /// Wraps an already-connected byte stream pair.
    pub fn from_io<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            io: Some(PendingIo {
                reader: Box::new(reader),
                writer: Box::new(writer),
                stderr: None,
            }),
            child: None,
            outbound: None,
            running: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        }
    }
}

impl Transport for StreamTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn start(&mut self, handlers: TransportHandlers) -> Result<(), BridgeError> {
        let io = self.io.take().ok_or(BridgeError::AlreadyStarted)?;
        let runtime = Handle::try_current()
            .map_err(|err| BridgeError::Transport(format!("no async runtime: {err}")))?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        self.outbound = Some(outbound_tx);
        self.running.store(true, Ordering::SeqCst);

        runtime.spawn(write_loop(
            io.writer,
            outbound_rx,
            handlers.on_delivery_failure,
            self.running.clone(),
            self.cancel.clone(),
        ));
        runtime.spawn(read_loop(
            io.reader,
            handlers.on_message,
            self.running.clone(),
            self.cancel.clone(),
        ));
        if let Some(stderr) = io.stderr {
            runtime.spawn(forward_stderr(stderr, self.cancel.clone()));
        }
        Ok(())
    }

    fn send(&self, request: &RpcRequest) -> Result<(), BridgeError> {
        if !self.is_running() {
            return Err(BridgeError::NotRunning);
        }
        let line = framing::encode_line(request)?;
        let outbound = self.outbound.as_ref().ok_or(BridgeError::NotRunning)?;
        outbound
            .send((request.id, line))
            .map_err(|_| BridgeError::NotRunning)
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.outbound = None;
        self.cancel.cancel();
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.start_kill() {
                log_warn!("Failed to kill engine process: {err}");
            }
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

async fn write_loop(
    mut writer: BoxedWriter,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    on_failure: DeliveryFailureHandler,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    loop {
        let (id, line) = tokio::select! {
            _ = cancel.cancelled() => break,
            next = outbound.recv() => match next {
                Some(next) => next,
                None => break,
            },
        };

        let written = async {
            writer.write_all(&line).await?;
            writer.flush().await
        };
        if let Err(err) = written.await {
            log_warn!("Engine write failed, closing channel: {err}");
            running.store(false, Ordering::SeqCst);

            let reason = format!("engine write failed: {err}");
            on_failure(id, BridgeError::Transport(reason.clone()));
            // Nothing queued behind the failed line will be written either.
            outbound.close();
            while let Ok((queued, _)) = outbound.try_recv() {
                on_failure(queued, BridgeError::Transport(reason.clone()));
            }
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(
    mut reader: BoxedReader,
    on_message: InboundHandler,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut framer = LineFramer::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read(&mut chunk) => read,
        };

        let count = match read {
            Ok(0) => {
                log_info!("Engine closed its output stream");
                break;
            }
            Ok(count) => count,
            Err(err) => {
                log_warn!("Engine read failed: {err}");
                break;
            }
        };

        for line in framer.push(&chunk[..count]) {
            match serde_json::from_str::<Value>(&line) {
                Ok(message) => {
                    log_debug!("engine -> {line}");
                    on_message(message)
                }
                Err(err) => log_warn!("Dropping unparsable engine line ({err}): {line}"),
            }
        }
    }

    running.store(false, Ordering::SeqCst);
}

async fn forward_stderr(stderr: ChildStderr, cancel: CancellationToken) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = lines.next_line() => match next {
                Ok(Some(line)) => log::warn!("[engine] {line}"),
                _ => break,
            },
        }
    }
}
