//! The annotation session: one open file, one editing controller, one
//! auto-save scheduler, all wired together.

mod flush;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use uuid::Uuid;

use crate::autosave::{AutoSaveScheduler, FlushOutcome, DEFAULT_DEBOUNCE};
use crate::editing::{
    EditMode, EditOutcome, EditingConfig, EditingController, PointerButton, PointerContext,
    ViewWindow,
};
use crate::engine::{EngineClient, OnsetParams, UpslopeParams};
use crate::events::{SessionEvent, SharedSink};
use crate::labels::{FileMarkers, LabelStore};
use crate::models::{
    FileAnnotationState, LabelFamily, LabelType, NoteField, Recording, SegmentLabels,
    SegmentLayout,
};
use crate::persistence::{validate_filename, DoneToggle, LabelRepository};
use crate::settings::AppConfig;

use flush::{lock_store, LabelWriter};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub editing: EditingConfig,
    pub autosave_delay: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            editing: EditingConfig::default(),
            autosave_delay: DEFAULT_DEBOUNCE,
        }
    }
}

struct OpenFile {
    name: String,
    recording: Recording,
    layout: SegmentLayout,
}

/// What the display needs to redraw the current segment.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentSnapshot {
    pub file: String,
    pub segment: u32,
    pub segment_count: u32,
    pub duration_secs: f64,
    pub mode: EditMode,
    pub label_type: LabelType,
    pub family: LabelFamily,
    pub labels: SegmentLabels,
    pub done: bool,
    pub in_review: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DetectionSummary {
    pub label_type: LabelType,
    pub accepted: usize,
    pub dropped: usize,
}

/// Identifies one opening of one file in one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OpenToken {
    session: Uuid,
    generation: u64,
}

/// The engine and folder recordings are listed and loaded from, usable
/// without holding the session.
#[derive(Clone)]
pub struct RecordingSource {
    engine: EngineClient,
    folder: String,
}

impl RecordingSource {
    pub async fn list(&self) -> Result<Vec<String>> {
        self.engine
            .list_files(&self.folder)
            .await
            .context("Failed to list recordings")
    }

    pub async fn load(&self, filename: &str) -> Result<Recording> {
        validate_filename(filename)?;
        self.engine
            .load_patient_file(filename, &self.folder)
            .await
            .with_context(|| format!("Failed to load {filename}"))
    }
}

enum DetectionKind {
    Peaks(LabelFamily),
    Onsets {
        target: LabelType,
        anchors: Vec<u32>,
        params: OnsetParams,
    },
    Upslopes {
        target: LabelType,
        anchors: Vec<u32>,
        params: UpslopeParams,
    },
}

/// Everything one detection run needs, copied out of the session so the
/// engine call does not hold it.
pub struct DetectionJob {
    engine: EngineClient,
    token: OpenToken,
    segment: u32,
    signal: Vec<f64>,
    layout: SegmentLayout,
    kind: DetectionKind,
}

impl DetectionJob {
    pub async fn run(self) -> Result<DetectionResult> {
        let points = match self.kind {
            DetectionKind::Peaks(family) => {
                let peaks = self
                    .engine
                    .find_peaks(&self.signal, self.segment)
                    .await
                    .context("Peak detection failed")?;
                vec![
                    (family.systolic(), peaks.systolic),
                    (family.diastolic(), peaks.diastolic),
                ]
            }
            DetectionKind::Onsets {
                target,
                anchors,
                params,
            } => {
                let onsets = self
                    .engine
                    .find_onset_compression(&self.signal, &anchors, params)
                    .await
                    .context("Onset detection failed")?;
                vec![(target, onsets)]
            }
            DetectionKind::Upslopes {
                target,
                anchors,
                params,
            } => {
                let upslopes = self
                    .engine
                    .find_upslope(&self.signal, &anchors, params)
                    .await
                    .context("Upslope detection failed")?;
                vec![(target, upslopes)]
            }
        };
        Ok(DetectionResult {
            token: self.token,
            segment: self.segment,
            layout: self.layout,
            points,
        })
    }
}

/// Engine output waiting to be merged into the segment it was computed for.
pub struct DetectionResult {
    token: OpenToken,
    segment: u32,
    layout: SegmentLayout,
    points: Vec<(LabelType, Vec<i64>)>,
}

pub struct AnnotationSession {
    id: Uuid,
    config: AppConfig,
    store: Arc<Mutex<LabelStore>>,
    editor: EditingController,
    autosave: AutoSaveScheduler,
    repository: Arc<dyn LabelRepository>,
    engine: EngineClient,
    markers: FileMarkers,
    events: SharedSink,
    file: Option<OpenFile>,
    /// Bumped on every open and close.
    generation: u64,
    segment: u32,
    view: Option<ViewWindow>,
}

impl AnnotationSession {
    pub fn new(
        config: AppConfig,
        engine: EngineClient,
        repository: Arc<dyn LabelRepository>,
        events: SharedSink,
        options: SessionOptions,
    ) -> Self {
        let id = Uuid::new_v4();
        let store = Arc::new(Mutex::new(LabelStore::new()));

        let writer = LabelWriter {
            store: store.clone(),
            repository: repository.clone(),
            events: events.clone(),
            session_id: id,
            labeler_name: config.labeler_name.clone(),
            version: config.version.clone(),
        };
        let autosave = AutoSaveScheduler::new(options.autosave_delay, writer.into_flush_fn());

        Self {
            id,
            config,
            store,
            editor: EditingController::new(options.editing),
            autosave,
            repository,
            engine,
            markers: FileMarkers::new(),
            events,
            file: None,
            generation: 0,
            segment: 0,
            view: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn engine(&self) -> &EngineClient {
        &self.engine
    }

    pub fn current_file(&self) -> Option<&str> {
        self.file.as_ref().map(|open| open.name.as_str())
    }

    pub fn current_segment(&self) -> u32 {
        self.segment
    }

    pub fn mode(&self) -> EditMode {
        self.editor.mode()
    }

    pub fn is_dirty(&self) -> bool {
        self.autosave.is_dirty()
    }

    pub fn markers(&self) -> &FileMarkers {
        &self.markers
    }

    /// Points of one type in the current segment.
    pub fn points(&self, label_type: LabelType) -> Vec<u32> {
        lock_store(&self.store).points(self.segment, label_type)
    }

    pub fn recording_source(&self) -> RecordingSource {
        RecordingSource {
            engine: self.engine.clone(),
            folder: self.config.data_folder.clone(),
        }
    }

    pub fn repository(&self) -> Arc<dyn LabelRepository> {
        self.repository.clone()
    }

    /// Opens an already-loaded recording. Pending edits on the previous file
    /// are flushed first; if that flush fails the previous file stays open.
    pub async fn open_recording(
        &mut self,
        filename: &str,
        recording: Recording,
    ) -> Result<SegmentSnapshot> {
        validate_filename(filename)?;
        self.flush_before_leaving().await?;

        let layout = recording.layout();
        if layout.segment_length == 0 {
            bail!("{filename} has a zero chunk size");
        }

        let raw = self.repository.load_labels(filename).await?;
        let (state, report) = FileAnnotationState::from_json(&raw, layout.segment_length)
            .with_context(|| format!("Label file for {filename} is malformed"))?;

        let in_review = state.has_review();
        lock_store(&self.store).hydrate(filename, state);
        self.autosave.attach();
        self.editor.reset_for_navigation();
        self.markers.set_in_review(filename, in_review);
        self.generation = self.generation.wrapping_add(1);
        self.segment = 0;
        self.view = None;
        self.file = Some(OpenFile {
            name: filename.to_string(),
            recording,
            layout,
        });

        log_info!(
            "Opened {filename}: {} segments of {} samples",
            layout.segment_count(),
            layout.segment_length
        );
        self.events.emit(SessionEvent::FileOpened {
            file: filename.to_string(),
            segments: layout.segment_count(),
        });
        if !report.is_clean() {
            log_warn!("Normalized label file for {filename}: {report:?}");
            self.events.emit(SessionEvent::LoadReport {
                file: filename.to_string(),
                report,
            });
        }
        self.snapshot()
    }

    /// Saves pending edits and switches segment. A failed save is reported
    /// and left dirty for the next attempt; navigation still happens.
    pub async fn go_to_segment(&mut self, segment: u32) -> Result<SegmentSnapshot> {
        let open = self.open_file_ref()?;
        if !open.layout.contains_segment(segment) {
            bail!(
                "segment {segment} is out of range (file has {})",
                open.layout.segment_count()
            );
        }

        if let FlushOutcome::Failed(message) = self.autosave.flush_if_dirty().await {
            log_warn!("Leaving segment {} with unsaved edits: {message}", self.segment);
        }

        let before = self.editor.mode();
        self.editor.reset_for_navigation();
        self.emit_mode_change(before);
        self.segment = segment;
        self.snapshot()
    }

    pub fn set_view(&mut self, view: ViewWindow) {
        self.view = Some(view);
    }

    pub fn set_label_type(&mut self, label_type: LabelType) {
        self.editor.set_label_type(label_type);
    }

    pub fn set_modifier(&mut self, held: bool) {
        let before = self.editor.mode();
        self.editor.set_modifier(held);
        self.emit_mode_change(before);
    }

    pub fn toggle_region_select(&mut self) -> EditMode {
        let before = self.editor.mode();
        let mode = self.editor.toggle_region_select();
        self.emit_mode_change(before);
        mode
    }

    /// Without an open file or a known view there is nothing to hit, and
    /// the event is ignored.
    pub fn pointer_down(&mut self, pixel_x: f64, button: PointerButton) -> EditOutcome {
        let Some(ctx) = self.pointer_context() else {
            return EditOutcome::Ignored;
        };
        let before = self.editor.mode();
        let outcome = {
            let mut store = lock_store(&self.store);
            self.editor.pointer_down(&mut store, &ctx, pixel_x, button)
        };
        self.after_edit(outcome, before);
        outcome
    }

    pub fn pointer_move(&mut self, pixel_x: f64) -> EditOutcome {
        let Some(ctx) = self.pointer_context() else {
            return EditOutcome::Ignored;
        };
        let before = self.editor.mode();
        let outcome = {
            let mut store = lock_store(&self.store);
            self.editor.pointer_move(&mut store, &ctx, pixel_x)
        };
        self.after_edit(outcome, before);
        outcome
    }

    pub fn pointer_up(&mut self) {
        let before = self.editor.mode();
        self.editor.pointer_up();
        self.emit_mode_change(before);
    }

    /// Flags or clears review on the current segment. Flagging is refused
    /// while the file is marked done.
    pub fn set_review(&mut self, value: bool) -> Result<()> {
        let file = self.open_file_ref()?.name.clone();
        self.markers.check_set_review(&file, value)?;

        let in_review = {
            let mut store = lock_store(&self.store);
            store.set_review(self.segment, value);
            store.has_review()
        };
        self.markers.set_in_review(&file, in_review);
        self.mark_changed();
        self.emit_file_markers();
        Ok(())
    }

    pub fn set_note(&mut self, field: NoteField, text: &str) -> Result<()> {
        self.open_file_ref()?;
        lock_store(&self.store).set_note(self.segment, field, text);
        self.mark_changed();
        Ok(())
    }

    pub fn clear_regions(&mut self) -> Result<usize> {
        self.open_file_ref()?;
        let cleared = lock_store(&self.store).clear_regions(self.segment);
        self.mark_changed();
        Ok(cleared)
    }

    pub fn clear_type(&mut self, label_type: LabelType) -> Result<()> {
        self.open_file_ref()?;
        lock_store(&self.store).set_points_for_type(self.segment, label_type, std::iter::empty());
        self.mark_changed();
        Ok(())
    }

    /// Reloads the done list and review scan from the repository.
    pub async fn refresh_markers(&mut self) -> Result<()> {
        let done = self.repository.load_done_files().await?;
        let review = self.repository.load_review_files().await?;
        self.apply_markers(done, review);
        Ok(())
    }

    /// Replaces the done and review markers with freshly loaded lists. The
    /// open file's review state comes from its in-memory labels.
    pub fn apply_markers(&mut self, done: Vec<String>, review: Vec<String>) {
        self.markers.replace_done(done);
        self.markers.replace_review(review);
        if let Some(file) = self.current_file().map(str::to_string) {
            let in_review = lock_store(&self.store).has_review();
            self.markers.set_in_review(&file, in_review);
        }
        self.emit_file_markers();
    }

    /// Flips the done marker of `filename`, or of the open file when `None`.
    /// A file with segments flagged for review cannot be marked done.
    pub async fn toggle_done(&mut self, filename: Option<&str>) -> Result<DoneToggle> {
        let file = self.done_target(filename)?;
        let toggled = self.repository.toggle_done_file(&file).await?;
        self.apply_done_toggle(&toggled);
        Ok(toggled)
    }

    /// Resolves and checks the file a done toggle applies to.
    pub fn done_target(&self, filename: Option<&str>) -> Result<String> {
        let file = match filename {
            Some(name) => name.to_string(),
            None => self.open_file_ref()?.name.clone(),
        };
        validate_filename(&file)?;
        self.markers.check_toggle_done(&file)?;
        Ok(file)
    }

    pub fn apply_done_toggle(&mut self, toggled: &DoneToggle) {
        self.markers.replace_done(toggled.done_files.iter().cloned());
        self.emit_file_markers();
    }

    /// Runs peak detection on the current segment and replaces the systolic
    /// and diastolic points of `family` (by default the family the
    /// recording's CPR flags give this segment).
    pub async fn detect_peaks(
        &mut self,
        family: Option<LabelFamily>,
    ) -> Result<[DetectionSummary; 2]> {
        let result = self.peaks_job(family)?.run().await?;
        let summaries = self.apply_detection(result)?;
        <[DetectionSummary; 2]>::try_from(summaries)
            .map_err(|_| anyhow!("peak detection must yield systolic and diastolic points"))
    }

    /// Onset detection anchored on the current segment's systolic points of
    /// `target`'s family; replaces `target`.
    pub async fn detect_onsets(
        &mut self,
        target: LabelType,
        params: OnsetParams,
    ) -> Result<DetectionSummary> {
        let result = self.onsets_job(target, params)?.run().await?;
        single(self.apply_detection(result)?)
    }

    pub async fn detect_upslopes(
        &mut self,
        target: LabelType,
        params: UpslopeParams,
    ) -> Result<DetectionSummary> {
        let result = self.upslopes_job(target, params)?.run().await?;
        single(self.apply_detection(result)?)
    }

    pub fn peaks_job(&self, family: Option<LabelFamily>) -> Result<DetectionJob> {
        let (signal, layout, default_family) = self.segment_input()?;
        let kind = DetectionKind::Peaks(family.unwrap_or(default_family));
        Ok(self.job(signal, layout, kind))
    }

    pub fn onsets_job(&self, target: LabelType, params: OnsetParams) -> Result<DetectionJob> {
        let (signal, layout, _) = self.segment_input()?;
        let kind = DetectionKind::Onsets {
            target,
            anchors: self.points(target.family().systolic()),
            params,
        };
        Ok(self.job(signal, layout, kind))
    }

    pub fn upslopes_job(&self, target: LabelType, params: UpslopeParams) -> Result<DetectionJob> {
        let (signal, layout, _) = self.segment_input()?;
        let kind = DetectionKind::Upslopes {
            target,
            anchors: self.points(target.family().systolic()),
            params,
        };
        Ok(self.job(signal, layout, kind))
    }

    /// Merges a finished detection run. Refused when the file or segment it
    /// was computed for is no longer the one shown.
    pub fn apply_detection(&mut self, result: DetectionResult) -> Result<Vec<DetectionSummary>> {
        if result.token != self.open_token() || result.segment != self.segment {
            bail!(
                "Detection for segment {} discarded: the view moved on while it ran",
                result.segment
            );
        }
        let mut summaries = Vec::with_capacity(result.points.len());
        for (label_type, indices) in &result.points {
            summaries.push(self.replace_points(*label_type, indices, &result.layout));
        }
        Ok(summaries)
    }

    pub async fn flush(&self) -> FlushOutcome {
        self.autosave.flush_if_dirty().await
    }

    /// Flushes and forgets the open file.
    pub async fn close(&mut self) -> FlushOutcome {
        let outcome = self.autosave.flush_if_dirty().await;
        if let FlushOutcome::Failed(message) = &outcome {
            log_warn!("Closing with unsaved edits: {message}");
        }
        self.autosave.detach();
        lock_store(&self.store).clear();
        self.generation = self.generation.wrapping_add(1);
        self.file = None;
        self.view = None;
        self.segment = 0;
        outcome
    }

    /// Final flush, then stops the engine bridge.
    pub async fn shutdown(&mut self) -> FlushOutcome {
        let outcome = self.close().await;
        self.engine.bridge().stop();
        outcome
    }

    pub fn snapshot(&self) -> Result<SegmentSnapshot> {
        let open = self.open_file_ref()?;
        let labels = lock_store(&self.store)
            .segment(self.segment)
            .cloned()
            .unwrap_or_default();

        Ok(SegmentSnapshot {
            file: open.name.clone(),
            segment: self.segment,
            segment_count: open.layout.segment_count(),
            duration_secs: open.layout.duration_secs(),
            mode: self.editor.mode(),
            label_type: self.editor.label_type(),
            family: open.recording.family_for_segment(self.segment),
            labels,
            done: self.markers.is_done(&open.name),
            in_review: self.markers.in_review(&open.name),
        })
    }

    fn open_file_ref(&self) -> Result<&OpenFile> {
        self.file.as_ref().ok_or_else(|| anyhow!("no file is open"))
    }

    fn open_token(&self) -> OpenToken {
        OpenToken {
            session: self.id,
            generation: self.generation,
        }
    }

    fn job(&self, signal: Vec<f64>, layout: SegmentLayout, kind: DetectionKind) -> DetectionJob {
        DetectionJob {
            engine: self.engine.clone(),
            token: self.open_token(),
            segment: self.segment,
            signal,
            layout,
            kind,
        }
    }

    fn pointer_context(&self) -> Option<PointerContext> {
        let open = self.file.as_ref()?;
        Some(PointerContext {
            segment: self.segment,
            layout: open.layout,
            view: self.view?,
        })
    }

    fn segment_input(&self) -> Result<(Vec<f64>, SegmentLayout, LabelFamily)> {
        let open = self.open_file_ref()?;
        let signal = open
            .recording
            .segment_signal(self.segment)
            .ok_or_else(|| anyhow!("segment {} has no signal data", self.segment))?;
        Ok((
            signal,
            open.layout,
            open.recording.family_for_segment(self.segment),
        ))
    }

    fn replace_points(
        &mut self,
        label_type: LabelType,
        indices: &[i64],
        layout: &SegmentLayout,
    ) -> DetectionSummary {
        let accepted: Vec<u32> = indices
            .iter()
            .filter_map(|index| layout.offset(*index))
            .collect();
        let summary = DetectionSummary {
            label_type,
            accepted: accepted.len(),
            dropped: indices.len() - accepted.len(),
        };
        if summary.dropped > 0 {
            log_warn!("Dropped {} out-of-range {label_type} indices", summary.dropped);
        }

        lock_store(&self.store).set_points_for_type(self.segment, label_type, accepted);
        self.mark_changed();
        summary
    }

    async fn flush_before_leaving(&mut self) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        match self.autosave.flush_if_dirty().await {
            FlushOutcome::Failed(message) => {
                bail!("Unsaved edits could not be saved, staying on the current file: {message}")
            }
            FlushOutcome::Clean | FlushOutcome::Flushed => Ok(()),
        }
    }

    fn after_edit(&mut self, outcome: EditOutcome, before: EditMode) {
        if outcome.mutated() {
            self.mark_changed();
        }
        if let EditOutcome::RegionStarted { start } = outcome {
            self.events.emit(SessionEvent::RegionPending {
                segment: self.segment,
                start,
            });
        }
        self.emit_mode_change(before);
    }

    fn mark_changed(&self) {
        self.autosave.mark_dirty();
        self.events.emit(SessionEvent::MarkersChanged {
            segment: self.segment,
        });
    }

    fn emit_mode_change(&self, before: EditMode) {
        let mode = self.editor.mode();
        if mode != before {
            self.events.emit(SessionEvent::ModeChanged { mode });
        }
    }

    fn emit_file_markers(&self) {
        self.events.emit(SessionEvent::FileMarkersChanged {
            done: self.markers.done_files().map(str::to_string).collect(),
            review: self.markers.review_files().map(str::to_string).collect(),
        });
    }
}

fn single(summaries: Vec<DetectionSummary>) -> Result<DetectionSummary> {
    summaries
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("detection produced no result"))
}
