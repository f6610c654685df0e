use crate::{
    editing::{EditMode, EditOutcome, PointerButton, ViewWindow},
    models::LabelType,
    AppState,
};

pub async fn set_view(state: &AppState, view: ViewWindow) -> Result<(), String> {
    state.session.lock().await.set_view(view);
    Ok(())
}

pub async fn pointer_down(
    state: &AppState,
    x: f64,
    secondary: bool,
) -> Result<EditOutcome, String> {
    let button = if secondary {
        PointerButton::Secondary
    } else {
        PointerButton::Primary
    };
    Ok(state.session.lock().await.pointer_down(x, button))
}

pub async fn pointer_move(state: &AppState, x: f64) -> Result<EditOutcome, String> {
    Ok(state.session.lock().await.pointer_move(x))
}

pub async fn pointer_up(state: &AppState) -> Result<EditMode, String> {
    let mut session = state.session.lock().await;
    session.pointer_up();
    Ok(session.mode())
}

pub async fn set_modifier(state: &AppState, held: bool) -> Result<EditMode, String> {
    let mut session = state.session.lock().await;
    session.set_modifier(held);
    Ok(session.mode())
}

pub async fn toggle_region_select(state: &AppState) -> Result<EditMode, String> {
    Ok(state.session.lock().await.toggle_region_select())
}

pub async fn set_label_type(state: &AppState, label_type: String) -> Result<LabelType, String> {
    let label_type: LabelType = label_type.parse().map_err(|e: anyhow::Error| e.to_string())?;
    state.session.lock().await.set_label_type(label_type);
    Ok(label_type)
}
