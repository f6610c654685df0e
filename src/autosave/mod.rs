pub mod scheduler;

pub use scheduler::{AutoSaveScheduler, FlushFn, FlushFuture, FlushOutcome, DEFAULT_DEBOUNCE};
