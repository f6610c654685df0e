pub mod autosave;
pub mod bridge;
pub mod editing;
pub mod engine;
pub mod events;
pub mod labels;
pub mod models;
pub mod persistence;
pub mod session;
pub mod settings;
mod utils;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::{mpsc, Mutex},
    task::JoinSet,
};

use bridge::{RpcBridge, StreamTransport};
use editing::commands as edit_cmd;
use engine::EngineClient;
use events::{ChannelEventSink, EventEnvelope, EventSink, LogEventSink, SharedSink};
use labels::commands as label_cmd;
use persistence::{EngineLabelRepository, FsLabelRepository, LabelRepository};
use session::{AnnotationSession, SessionOptions};
use settings::{AppConfig, EngineSettings, SettingsStore, StorageBackend, CONFIG_FILE_NAME};

pub struct AppState {
    pub(crate) session: Mutex<AnnotationSession>,
    pub(crate) settings: SettingsStore,
    engine: EngineClient,
    engine_settings: EngineSettings,
    events: SharedSink,
}

impl AppState {
    pub fn new(
        settings: SettingsStore,
        engine: EngineClient,
        engine_settings: EngineSettings,
        events: SharedSink,
    ) -> Result<Self> {
        let session = build_session(settings.config(), &engine, &engine_settings, &events)?;
        Ok(Self {
            session: Mutex::new(session),
            settings,
            engine,
            engine_settings,
            events,
        })
    }

    /// Closes the current session (flushing it) and starts a fresh one
    /// under `config`. The engine bridge is shared and keeps running.
    pub(crate) async fn rebuild_session(&self, config: AppConfig) -> Result<()> {
        let fresh = build_session(config, &self.engine, &self.engine_settings, &self.events)?;
        let mut session = self.session.lock().await;
        session.close().await;
        *session = fresh;
        session.refresh_markers().await
    }

    pub async fn shutdown(&self) {
        let outcome = self.session.lock().await.shutdown().await;
        log::info!("Session closed ({outcome:?})");
    }
}

fn build_session(
    config: AppConfig,
    engine: &EngineClient,
    engine_settings: &EngineSettings,
    events: &SharedSink,
) -> Result<AnnotationSession> {
    let repository: Arc<dyn LabelRepository> = match engine_settings.storage {
        StorageBackend::Engine => Arc::new(EngineLabelRepository::new(
            engine.clone(),
            &config.labeler_name,
            &config.labels_directory,
        )?),
        StorageBackend::Fs => Arc::new(FsLabelRepository::new(
            &config.labels_directory,
            &config.labeler_name,
        )?),
    };
    let options = SessionOptions {
        autosave_delay: engine_settings.autosave_delay,
        ..SessionOptions::default()
    };
    Ok(AnnotationSession::new(
        config,
        engine.clone(),
        repository,
        events.clone(),
        options,
    ))
}

/// One line on stdin.
#[derive(Debug, Deserialize)]
struct CommandRequest {
    #[serde(default)]
    id: Option<Value>,
    command: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum CommandReply {
    Success { id: Option<Value>, ok: Value },
    Failure { id: Option<Value>, error: String },
}

fn arg<T: DeserializeOwned>(args: &Value, key: &str) -> Result<T, String> {
    let value = args
        .get(key)
        .cloned()
        .ok_or_else(|| format!("missing argument '{key}'"))?;
    serde_json::from_value(value).map_err(|e| format!("invalid argument '{key}': {e}"))
}

fn opt_arg<T: DeserializeOwned>(args: &Value, key: &str) -> Result<Option<T>, String> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => arg(args, key).map(Some),
    }
}

fn reply<T: Serialize>(result: Result<T, String>) -> Result<Value, String> {
    result.and_then(|value| serde_json::to_value(value).map_err(|e| e.to_string()))
}

/// Runs one named command against the app state.
pub async fn invoke(state: &AppState, command: &str, args: &Value) -> Result<Value, String> {
    match command {
        "list_files" => reply(label_cmd::list_files(state).await),
        "open_file" => reply(label_cmd::open_file(state, arg(args, "filename")?).await),
        "go_to_segment" => reply(label_cmd::go_to_segment(state, arg(args, "segment")?).await),
        "get_segment" => reply(label_cmd::get_segment(state).await),
        "set_review" => reply(label_cmd::set_review(state, arg(args, "value")?).await),
        "set_note" => {
            reply(label_cmd::set_note(state, arg(args, "field")?, arg(args, "text")?).await)
        }
        "clear_regions" => reply(label_cmd::clear_regions(state).await),
        "clear_type" => reply(label_cmd::clear_type(state, arg(args, "label_type")?).await),
        "toggle_done" => reply(label_cmd::toggle_done(state, opt_arg(args, "filename")?).await),
        "refresh_markers" => reply(label_cmd::refresh_markers(state).await),
        "detect_peaks" => reply(label_cmd::detect_peaks(state, opt_arg(args, "family")?).await),
        "detect_onsets" => reply(
            label_cmd::detect_onsets(
                state,
                arg(args, "target")?,
                opt_arg(args, "params")?.unwrap_or_default(),
            )
            .await,
        ),
        "detect_upslopes" => reply(
            label_cmd::detect_upslopes(
                state,
                arg(args, "target")?,
                opt_arg(args, "params")?.unwrap_or_default(),
            )
            .await,
        ),
        "flush_labels" => reply(label_cmd::flush_labels(state).await),
        "get_config" => reply(label_cmd::get_config(state).await),
        "update_config" => reply(label_cmd::update_config(state, arg(args, "config")?).await),
        "set_view" => reply(edit_cmd::set_view(state, arg(args, "view")?).await),
        "pointer_down" => reply(
            edit_cmd::pointer_down(
                state,
                arg(args, "x")?,
                opt_arg(args, "secondary")?.unwrap_or(false),
            )
            .await,
        ),
        "pointer_move" => reply(edit_cmd::pointer_move(state, arg(args, "x")?).await),
        "pointer_up" => reply(edit_cmd::pointer_up(state).await),
        "set_modifier" => reply(edit_cmd::set_modifier(state, arg(args, "held")?).await),
        "toggle_region_select" => reply(edit_cmd::toggle_region_select(state).await),
        "set_label_type" => {
            reply(edit_cmd::set_label_type(state, arg(args, "label_type")?).await)
        }
        other => Err(format!("unknown command '{other}'")),
    }
}

/// Commands whose reply waits on the engine. They run as their own tasks so
/// pointer input keeps flowing; everything else is handled in arrival order.
fn waits_on_engine(command: &str) -> bool {
    matches!(
        command,
        "list_files"
            | "open_file"
            | "toggle_done"
            | "refresh_markers"
            | "detect_peaks"
            | "detect_onsets"
            | "detect_upslopes"
    )
}

fn parse_request(line: &str) -> Result<CommandRequest, CommandReply> {
    serde_json::from_str(line).map_err(|err| CommandReply::Failure {
        id: None,
        error: format!("invalid command: {err}"),
    })
}

async fn respond(state: &AppState, request: CommandRequest) -> CommandReply {
    match invoke(state, &request.command, &request.args).await {
        Ok(ok) => CommandReply::Success { id: request.id, ok },
        Err(error) => {
            log::warn!("Command '{}' failed: {error}", request.command);
            CommandReply::Failure {
                id: request.id,
                error,
            }
        }
    }
}

async fn serve() -> Result<()> {
    let config_path = std::env::var_os("LABELER_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
    let settings = SettingsStore::new(config_path)?;
    let engine_settings = EngineSettings::from_env();

    let transport = StreamTransport::spawn_process(&engine_settings.command)
        .context("Failed to launch the processing engine")?;
    let bridge = Arc::new(
        RpcBridge::new(Box::new(transport)).with_timeout(engine_settings.call_timeout),
    );
    bridge.start()?;

    let (sink, mut events) = ChannelEventSink::new();
    let state = Arc::new(AppState::new(
        settings,
        EngineClient::new(bridge),
        engine_settings,
        Arc::new(sink),
    )?);
    if let Err(err) = state.session.lock().await.refresh_markers().await {
        log::warn!("Could not load done/review markers: {err:#}");
    }

    // Replies and events share stdout; one writer keeps lines whole.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            let written = async {
                stdout.write_all(line.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await
            };
            if let Err(err) = written.await {
                log::error!("stdout closed: {err}");
                break;
            }
        }
    });
    let forwarder = tokio::spawn({
        let out_tx = out_tx.clone();
        async move {
            while let Some(event) = events.recv().await {
                LogEventSink.emit(event.clone());
                match serde_json::to_string(&EventEnvelope::from(&event)) {
                    Ok(line) => {
                        let _ = out_tx.send(line);
                    }
                    Err(err) => log::warn!("Could not encode {} event: {err}", event.name()),
                }
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut detached = JoinSet::new();
    loop {
        tokio::select! {
            Some(_) = detached.join_next(), if !detached.is_empty() => {}
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_request(&line) {
                    Err(reply) => send_reply(&out_tx, &reply),
                    Ok(request) if waits_on_engine(&request.command) => {
                        let state = state.clone();
                        let out_tx = out_tx.clone();
                        detached.spawn(async move {
                            send_reply(&out_tx, &respond(&state, request).await);
                        });
                    }
                    Ok(request) => send_reply(&out_tx, &respond(&state, request).await),
                }
            }
        }
    }

    log::info!("stdin closed, shutting down");
    // Each engine call is bounded by the bridge timeout.
    while detached.join_next().await.is_some() {}
    state.shutdown().await;
    drop(state);
    // Events emitted during shutdown are still written if they arrive soon.
    let _ = tokio::time::timeout(Duration::from_secs(1), forwarder).await;
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

fn send_reply(out: &mpsc::UnboundedSender<String>, reply: &CommandReply) {
    let encoded = serde_json::to_string(reply).unwrap_or_else(|err| {
        json!({ "error": format!("could not encode reply: {err}") }).to_string()
    });
    let _ = out.send(encoded);
}

pub fn run() {
    utils::logging::init();
    log::info!("Waveform labeler starting up...");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("error while building the tokio runtime");

    if let Err(err) = runtime.block_on(serve()) {
        log::error!("{err:#}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_are_typed_and_optional_ones_accept_null() {
        let args = json!({"segment": 3, "family": null, "field": "region"});

        assert_eq!(arg::<u32>(&args, "segment"), Ok(3));
        assert!(arg::<u32>(&args, "missing").unwrap_err().contains("missing argument"));
        assert!(arg::<String>(&args, "segment").unwrap_err().contains("invalid argument"));
        assert_eq!(opt_arg::<models::LabelFamily>(&args, "family"), Ok(None));
        assert_eq!(
            opt_arg::<models::NoteField>(&args, "field"),
            Ok(Some(models::NoteField::Region))
        );
    }

    fn app(dir: &std::path::Path) -> (Arc<AppState>, bridge::ChannelEndpoint) {
        let config_path = dir.join(CONFIG_FILE_NAME);
        let config = AppConfig {
            labels_directory: dir.to_string_lossy().into_owned(),
            ..AppConfig::default()
        };
        std::fs::write(&config_path, serde_json::to_string(&config).unwrap()).unwrap();

        let (transport, endpoint) = bridge::ChannelTransport::pair();
        let bridge = Arc::new(
            RpcBridge::new(Box::new(transport)).with_timeout(Duration::from_secs(3)),
        );
        bridge.start().unwrap();
        let engine_settings = EngineSettings {
            storage: StorageBackend::Fs,
            ..EngineSettings::default()
        };
        let state = AppState::new(
            SettingsStore::new(config_path).unwrap(),
            EngineClient::new(bridge),
            engine_settings,
            Arc::new(LogEventSink),
        )
        .unwrap();
        (Arc::new(state), endpoint)
    }

    #[tokio::test(start_paused = true)]
    async fn pointer_input_does_not_wait_for_the_engine() {
        let dir = tempfile::tempdir().unwrap();
        let (state, mut endpoint) = app(dir.path());

        let listing = tokio::spawn({
            let state = state.clone();
            async move { invoke(&state, "list_files", &json!({})).await }
        });
        let request = endpoint.requests.recv().await.unwrap();
        assert_eq!(request.method, "get_csv_files");

        let pointer = tokio::time::timeout(
            Duration::from_millis(100),
            invoke(&state, "pointer_up", &json!({})),
        )
        .await
        .expect("pointer_up waited on the engine call");
        assert!(pointer.is_ok());

        endpoint
            .responses
            .send(json!({"id": request.id, "result": ["a.h5"]}))
            .unwrap();
        assert_eq!(listing.await.unwrap(), Ok(json!(["a.h5"])));
    }

    #[test]
    fn engine_bound_commands_run_detached() {
        assert!(waits_on_engine("detect_peaks"));
        assert!(waits_on_engine("list_files"));
        assert!(!waits_on_engine("pointer_down"));
        assert!(!waits_on_engine("go_to_segment"));
    }

    #[test]
    fn replies_carry_the_request_id() {
        let reply = CommandReply::Failure {
            id: Some(json!(7)),
            error: "no file is open".into(),
        };
        assert_eq!(
            serde_json::to_value(reply).unwrap(),
            json!({"id": 7, "error": "no file is open"})
        );
    }
}
