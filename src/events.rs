//! Notifications for whatever renders the session (chart, file list, toasts).

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::editing::EditMode;
use crate::models::LoadReport;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SessionEvent {
    FileOpened {
        file: String,
        segments: u32,
    },
    LoadReport {
        file: String,
        report: LoadReport,
    },
    MarkersChanged {
        segment: u32,
    },
    RegionPending {
        segment: u32,
        start: u32,
    },
    ModeChanged {
        mode: EditMode,
    },
    Saved {
        file: String,
    },
    SaveFailed {
        file: String,
        message: String,
    },
    FileMarkersChanged {
        done: Vec<String>,
        review: Vec<String>,
    },
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::FileOpened { .. } => "file-opened",
            SessionEvent::LoadReport { .. } => "load-report",
            SessionEvent::MarkersChanged { .. } => "markers-changed",
            SessionEvent::RegionPending { .. } => "region-pending",
            SessionEvent::ModeChanged { .. } => "mode-changed",
            SessionEvent::Saved { .. } => "labels-saved",
            SessionEvent::SaveFailed { .. } => "labels-save-failed",
            SessionEvent::FileMarkersChanged { .. } => "file-markers-changed",
        }
    }
}

/// Envelope written to the outer surface.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope<'a> {
    pub event: &'static str,
    pub payload: &'a SessionEvent,
}

impl<'a> From<&'a SessionEvent> for EventEnvelope<'a> {
    fn from(event: &'a SessionEvent) -> Self {
        Self {
            event: event.name(),
            payload: event,
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: SessionEvent);
}

pub type SharedSink = Arc<dyn EventSink>;

/// Writes events to the log only.
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn emit(&self, event: SessionEvent) {
        match &event {
            SessionEvent::SaveFailed { file, message } => {
                log::error!("Saving labels for {file} failed: {message}")
            }
            other => log::debug!("{} {:?}", other.name(), other),
        }
    }
}

/// Forwards events to a receiver; a dropped receiver silently discards them.
pub struct ChannelEventSink {
    sender: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: SessionEvent) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_carries_kebab_name_and_flat_payload() {
        let event = SessionEvent::RegionPending {
            segment: 3,
            start: 120,
        };
        let value = serde_json::to_value(EventEnvelope::from(&event)).unwrap();
        assert_eq!(
            value,
            json!({"event": "region-pending", "payload": {"segment": 3, "start": 120}})
        );
    }

    #[test]
    fn log_sink_accepts_every_event_kind() {
        let sink: SharedSink = Arc::new(LogEventSink);
        sink.emit(SessionEvent::SaveFailed {
            file: "a.h5".into(),
            message: "disk full".into(),
        });
        sink.emit(SessionEvent::Saved { file: "a.h5".into() });
    }

    #[test]
    fn channel_sink_survives_dropped_receiver() {
        let (sink, receiver) = ChannelEventSink::new();
        drop(receiver);
        sink.emit(SessionEvent::MarkersChanged { segment: 0 });
    }
}
