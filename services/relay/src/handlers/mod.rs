pub mod health;
pub mod messages;
pub mod pauses;
pub mod stream;

use axum::http::HeaderMap;
use tracing::warn;
use types::event::MessageFields;

use crate::crypto::{parse_form, Rejection, SIGNATURE_HEADER};
use crate::error::AppError;
use crate::state::AppState;

fn signature_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
}

fn log_rejection(rejection: Rejection, body_len: usize) -> Rejection {
    warn!(reason = rejection.as_str(), body_len, "Rejected inbound request");
    rejection
}

/// Run an inbound body through the crypto gate and decode the resulting
/// form, followed by any query fields. Rejected bodies are logged and never
/// decoded.
pub(crate) fn open_form(
    state: &AppState,
    headers: &HeaderMap,
    query: Option<&str>,
    body: &[u8],
) -> Result<MessageFields, AppError> {
    let pairs = state
        .gate
        .open_form(body, query, signature_header(headers))
        .map_err(|rejection| log_rejection(rejection, body.len()))?;
    Ok(MessageFields::from_pairs(pairs))
}

/// Signature check for bodiless requests signed over their query fields.
pub(crate) fn verify_query(
    state: &AppState,
    headers: &HeaderMap,
    query: Option<&str>,
) -> Result<(), AppError> {
    let pairs = parse_form(query.unwrap_or_default().as_bytes());
    state
        .gate
        .verify_form(&pairs, signature_header(headers))
        .map_err(|rejection| log_rejection(rejection, 0))?;
    Ok(())
}
