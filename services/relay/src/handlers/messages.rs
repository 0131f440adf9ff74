use axum::{
    body::Bytes,
    extract::{RawQuery, State},
    http::{HeaderMap, StatusCode},
};
use tracing::info;
use types::event::{Action, DebugMessage};

use crate::error::AppError;
use crate::handlers::open_form;
use crate::state::AppState;

/// `POST /messages`: publish one debug message to every console.
pub async fn post_message(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let fields = open_form(&state, &headers, query.as_deref(), &body)?;
    let message = DebugMessage::new(Action::Message, &fields)?;
    let file_display = message.file_display.clone();

    let event = state
        .channel
        .publish(message.into_event().map_err(anyhow::Error::from)?);

    info!(
        sequence = event.sequence,
        topic = %event.topic,
        file = %file_display,
        "Message"
    );
    Ok(StatusCode::OK)
}
