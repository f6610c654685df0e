use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::autosave::FlushFn;
use crate::events::{SessionEvent, SharedSink};
use crate::labels::LabelStore;
use crate::persistence::LabelRepository;

pub(crate) fn lock_store(store: &Mutex<LabelStore>) -> MutexGuard<'_, LabelStore> {
    match store.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Everything a save needs, detached from the session so the debounce timer
/// can run it on its own.
#[derive(Clone)]
pub(crate) struct LabelWriter {
    pub store: Arc<Mutex<LabelStore>>,
    pub repository: Arc<dyn LabelRepository>,
    pub events: SharedSink,
    pub session_id: Uuid,
    pub labeler_name: String,
    pub version: String,
}

impl LabelWriter {
    fn audit(&self) -> Map<String, Value> {
        let audit = json!({
            "labeler": self.labeler_name,
            "last_saved": Utc::now().to_rfc3339(),
            "session_id": self.session_id.to_string(),
            "version": self.version,
            "app_version": env!("CARGO_PKG_VERSION"),
        });
        match audit {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    pub async fn save(&self) -> Result<()> {
        // Snapshot under the lock, write without it.
        let snapshot = lock_store(&self.store).export(&self.audit());
        let Some((file, labels)) = snapshot else {
            return Ok(());
        };

        let saved = self
            .repository
            .save_labels(&file, &labels)
            .await
            .with_context(|| format!("Failed to save labels for {file}"));

        match &saved {
            Ok(()) => self.events.emit(SessionEvent::Saved { file }),
            Err(err) => self.events.emit(SessionEvent::SaveFailed {
                file,
                message: format!("{err:#}"),
            }),
        }
        saved
    }

    pub fn into_flush_fn(self) -> FlushFn {
        Arc::new(move || {
            let writer = self.clone();
            Box::pin(async move { writer.save().await })
        })
    }
}
