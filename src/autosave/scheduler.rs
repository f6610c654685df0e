use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use serde::Serialize;
use tokio::{runtime::Handle, task::JoinHandle, time};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(2000);

pub type FlushFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Persists the current label state. Injected so the scheduler never knows
/// where or how labels are written.
pub type FlushFn = Arc<dyn Fn() -> FlushFuture + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "message", rename_all = "camelCase")]
pub enum FlushOutcome {
    /// Nothing was dirty.
    Clean,
    Flushed,
    /// The flush ran and failed; the dirty flag is still set.
    Failed(String),
}

#[derive(Default)]
struct SchedulerState {
    dirty: bool,
    /// Bumped on every `mark_dirty`; a flush only clears `dirty` if no new
    /// mutation arrived while it was writing.
    generation: u64,
    /// Bumped whenever the open file changes; a timer scheduled under an old
    /// context never flushes.
    context: u64,
    attached: bool,
    timer: Option<JoinHandle<()>>,
}

struct SchedulerInner {
    state: Mutex<SchedulerState>,
    flush_lock: tokio::sync::Mutex<()>,
    delay: Duration,
    flush: FlushFn,
}

#[derive(Clone)]
pub struct AutoSaveScheduler {
    inner: Arc<SchedulerInner>,
}

impl AutoSaveScheduler {
    pub fn new(delay: Duration, flush: FlushFn) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                state: Mutex::new(SchedulerState::default()),
                flush_lock: tokio::sync::Mutex::new(()),
                delay,
                flush,
            }),
        }
    }

    pub fn delay(&self) -> Duration {
        self.inner.delay
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.lock_state().dirty
    }

    /// A new file is open. Any timer from the previous file is cancelled and
    /// the dirty flag starts clean.
    pub fn attach(&self) {
        let mut state = self.inner.lock_state();
        cancel_timer(&mut state);
        state.context = state.context.wrapping_add(1);
        state.attached = true;
        state.dirty = false;
    }

    pub fn detach(&self) {
        let mut state = self.inner.lock_state();
        cancel_timer(&mut state);
        state.context = state.context.wrapping_add(1);
        state.attached = false;
        state.dirty = false;
    }

    /// Marks the open file dirty and restarts the debounce timer.
    pub fn mark_dirty(&self) {
        let mut state = self.inner.lock_state();
        state.dirty = true;
        state.generation = state.generation.wrapping_add(1);
        cancel_timer(&mut state);

        if !state.attached {
            return;
        }

        let Ok(runtime) = Handle::try_current() else {
            log_warn!("No async runtime; auto-save deferred to the next explicit flush");
            return;
        };

        let context = state.context;
        let inner = self.inner.clone();
        state.timer = Some(runtime.spawn(async move {
            time::sleep(inner.delay).await;
            inner.fire(context).await;
        }));
    }

    /// Cancels any pending timer and, if dirty, flushes now. Never returns an
    /// error; a failure is reported in the outcome and leaves the file dirty.
    pub async fn flush_if_dirty(&self) -> FlushOutcome {
        {
            let mut state = self.inner.lock_state();
            cancel_timer(&mut state);
        }
        self.inner.flush_now(None).await
    }
}

impl SchedulerInner {
    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn fire(&self, context: u64) {
        {
            let mut state = self.lock_state();
            if state.context != context || !state.attached || !state.dirty {
                return;
            }
            // This task is the timer; drop the handle so a concurrent
            // `flush_if_dirty` waits on the flush lock instead of aborting us.
            state.timer = None;
        }

        match self.flush_now(Some(context)).await {
            FlushOutcome::Failed(message) => {
                log_error!("Auto-save failed, will retry on next change: {message}")
            }
            FlushOutcome::Flushed => log_info!("Auto-saved labels"),
            FlushOutcome::Clean => {}
        }
    }

    /// `context` is set when a timer flushes; the file may have changed
    /// while it waited for the lock.
    async fn flush_now(&self, context: Option<u64>) -> FlushOutcome {
        let _serialized = self.flush_lock.lock().await;

        let generation = {
            let state = self.lock_state();
            if !state.dirty || !state.attached {
                return FlushOutcome::Clean;
            }
            if context.is_some_and(|context| context != state.context) {
                return FlushOutcome::Clean;
            }
            state.generation
        };

        match (self.flush)().await {
            Ok(()) => {
                let mut state = self.lock_state();
                if state.generation == generation {
                    state.dirty = false;
                }
                FlushOutcome::Flushed
            }
            Err(err) => FlushOutcome::Failed(format!("{err:#}")),
        }
    }
}

fn cancel_timer(state: &mut SchedulerState) {
    if let Some(handle) = state.timer.take() {
        handle.abort();
    }
}
