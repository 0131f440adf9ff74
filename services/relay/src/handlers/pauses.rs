use axum::{
    body::Bytes,
    extract::{Path, RawQuery, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use tracing::info;
use types::event::{Action, DebugMessage};
use types::ids::LockId;
use types::lock::LockRecord;

use crate::error::AppError;
use crate::handlers::{open_form, verify_query};
use crate::locks;
use crate::state::AppState;

/// `POST /pauses`: a debugged process pauses itself at a call site.
///
/// The record is stored before the pause is announced, so consoles only see
/// pauses that can be acted on.
pub async fn post_pause(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let fields = open_form(&state, &headers, query.as_deref(), &body)?;
    let id = fields.lock_id()?;
    let message = DebugMessage::new(Action::Pause, &fields)?;
    let file_display = message.file_display.clone();

    let record = LockRecord::paused();
    state.locks.replace(&id, record).await?;

    let event = state
        .channel
        .publish(message.into_event().map_err(anyhow::Error::from)?);
    info!(lock_id = %id, sequence = event.sequence, file = %file_display, "Pause");

    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, format!("/pauses/{}", id))],
        Json(record),
    ))
}

/// `GET /pauses/{id}`: polled by the paused process, so it is signed like
/// the ingest routes. The signed fields are the query string.
pub async fn get_pause(
    State(state): State<AppState>,
    Path(id): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Result<Json<LockRecord>, AppError> {
    verify_query(&state, &headers, query.as_deref())?;
    let id = LockId::new(id)?;
    state
        .locks
        .get(&id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("lock {}", id)))
}

/// `PATCH /pauses/{id}`: hold the call site and tell it to stop.
pub async fn patch_pause(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<LockRecord>, AppError> {
    let id = LockId::new(id)?;
    let record = locks::acquire(state.locks.as_ref(), &id).await?;
    Ok(Json(record))
}

/// `DELETE /pauses/{id}`: release the call site.
pub async fn delete_pause(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let id = LockId::new(id)?;
    if state.locks.remove(&id).await? {
        info!(lock_id = %id, "Continue");
    }
    Ok(StatusCode::NO_CONTENT)
}
