use crate::{
    autosave::FlushOutcome,
    engine::{OnsetParams, UpslopeParams},
    models::{LabelFamily, LabelType, NoteField},
    persistence::DoneToggle,
    session::{DetectionJob, DetectionSummary, SegmentSnapshot},
    settings::AppConfig,
    AppState,
};

// Commands that wait on the engine copy what they need out of the session,
// release it for the call, and lock again only to merge the answer.

pub async fn list_files(state: &AppState) -> Result<Vec<String>, String> {
    let source = state.session.lock().await.recording_source();
    source.list().await.map_err(|e| format!("{e:#}"))
}

pub async fn open_file(state: &AppState, filename: String) -> Result<SegmentSnapshot, String> {
    let source = state.session.lock().await.recording_source();
    let recording = source.load(&filename).await.map_err(|e| format!("{e:#}"))?;

    let mut session = state.session.lock().await;
    session
        .open_recording(&filename, recording)
        .await
        .map_err(|e| format!("{e:#}"))
}

pub async fn go_to_segment(state: &AppState, segment: u32) -> Result<SegmentSnapshot, String> {
    let mut session = state.session.lock().await;
    session
        .go_to_segment(segment)
        .await
        .map_err(|e| format!("{e:#}"))
}

pub async fn get_segment(state: &AppState) -> Result<SegmentSnapshot, String> {
    let session = state.session.lock().await;
    session.snapshot().map_err(|e| e.to_string())
}

pub async fn set_review(state: &AppState, value: bool) -> Result<SegmentSnapshot, String> {
    let mut session = state.session.lock().await;
    session.set_review(value).map_err(|e| e.to_string())?;
    session.snapshot().map_err(|e| e.to_string())
}

pub async fn set_note(state: &AppState, field: NoteField, text: String) -> Result<(), String> {
    let mut session = state.session.lock().await;
    session.set_note(field, &text).map_err(|e| e.to_string())
}

pub async fn clear_regions(state: &AppState) -> Result<usize, String> {
    let mut session = state.session.lock().await;
    session.clear_regions().map_err(|e| e.to_string())
}

pub async fn clear_type(state: &AppState, label_type: LabelType) -> Result<(), String> {
    let mut session = state.session.lock().await;
    session.clear_type(label_type).map_err(|e| e.to_string())
}

pub async fn toggle_done(state: &AppState, filename: Option<String>) -> Result<DoneToggle, String> {
    let (file, repository) = {
        let session = state.session.lock().await;
        let file = session
            .done_target(filename.as_deref())
            .map_err(|e| e.to_string())?;
        (file, session.repository())
    };
    let toggled = repository
        .toggle_done_file(&file)
        .await
        .map_err(|e| format!("{e:#}"))?;

    state.session.lock().await.apply_done_toggle(&toggled);
    Ok(toggled)
}

pub async fn refresh_markers(state: &AppState) -> Result<(), String> {
    let repository = state.session.lock().await.repository();
    let done = repository
        .load_done_files()
        .await
        .map_err(|e| format!("{e:#}"))?;
    let review = repository
        .load_review_files()
        .await
        .map_err(|e| format!("{e:#}"))?;

    state.session.lock().await.apply_markers(done, review);
    Ok(())
}

async fn run_detection(
    state: &AppState,
    job: Result<DetectionJob, anyhow::Error>,
) -> Result<Vec<DetectionSummary>, String> {
    let result = job
        .map_err(|e| e.to_string())?
        .run()
        .await
        .map_err(|e| format!("{e:#}"))?;
    state
        .session
        .lock()
        .await
        .apply_detection(result)
        .map_err(|e| e.to_string())
}

pub async fn detect_peaks(
    state: &AppState,
    family: Option<LabelFamily>,
) -> Result<Vec<DetectionSummary>, String> {
    let job = state.session.lock().await.peaks_job(family);
    run_detection(state, job).await
}

pub async fn detect_onsets(
    state: &AppState,
    target: LabelType,
    params: OnsetParams,
) -> Result<DetectionSummary, String> {
    let job = state.session.lock().await.onsets_job(target, params);
    let mut summaries = run_detection(state, job).await?;
    summaries
        .pop()
        .ok_or_else(|| "detection produced no result".to_string())
}

pub async fn detect_upslopes(
    state: &AppState,
    target: LabelType,
    params: UpslopeParams,
) -> Result<DetectionSummary, String> {
    let job = state.session.lock().await.upslopes_job(target, params);
    let mut summaries = run_detection(state, job).await?;
    summaries
        .pop()
        .ok_or_else(|| "detection produced no result".to_string())
}

pub async fn flush_labels(state: &AppState) -> Result<FlushOutcome, String> {
    let session = state.session.lock().await;
    Ok(session.flush().await)
}

pub async fn get_config(state: &AppState) -> Result<AppConfig, String> {
    Ok(state.settings.config())
}

/// Persists a new config and reopens the session under it.
pub async fn update_config(state: &AppState, config: AppConfig) -> Result<AppConfig, String> {
    state
        .settings
        .update(config.clone())
        .map_err(|e| e.to_string())?;
    state
        .rebuild_session(config.clone())
        .await
        .map_err(|e| format!("{e:#}"))?;
    Ok(config)
}
