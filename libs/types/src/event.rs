//! Broadcast event types
//!
//! A `DebugEvent` is what the broadcast channel retains and fans out. Its
//! payload is opaque to the channel; for relayed debug calls it carries the
//! JSON encoding of a `DebugMessage`.

use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::MessageError;
use crate::ids::LockId;

/// Topic used when a debug call does not name one.
pub const DEFAULT_TOPIC: &str = "message";

/// A published unit of the broadcast stream.
///
/// `sequence` is zero until the channel assigns it at publish time; after
/// that the event is only ever cloned, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugEvent {
    /// Unique event ID (UUID v7, time-sortable)
    pub event_id: Uuid,
    /// Monotonic arrival sequence assigned by the channel (starts at 1)
    pub sequence: u64,
    /// Logical topic of the event
    pub topic: String,
    /// Opaque payload bytes
    pub payload: Arc<[u8]>,
    /// Wall-clock time the event was published
    pub published_at: Option<DateTime<Utc>>,
}

impl DebugEvent {
    /// Create an unpublished event.
    pub fn new(topic: impl Into<String>, payload: impl Into<Arc<[u8]>>) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            sequence: 0,
            topic: topic.into(),
            payload: payload.into(),
            published_at: None,
        }
    }

    /// Stamp the event with its publish sequence and time.
    pub fn sequenced(mut self, sequence: u64, published_at: DateTime<Utc>) -> Self {
        self.sequence = sequence;
        self.published_at = Some(published_at);
        self
    }

    /// Whether the channel has assigned a sequence number.
    pub fn is_published(&self) -> bool {
        self.published_at.is_some()
    }

    /// Payload as text, replacing invalid UTF-8.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Kind of debug call that produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Message,
    Pause,
}

/// Raw fields of a debug call as submitted by a debugged process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFields {
    pub body: String,
    pub file_path: String,
    pub file_line: String,
    pub emote: String,
    pub topic: String,
    pub id: String,
    /// Number of fields present in the submitted form, known or not.
    pub field_count: usize,
}

impl MessageFields {
    /// Collect fields from decoded key/value pairs; unknown keys are counted
    /// but otherwise ignored. Later duplicates lose to the first value.
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: AsRef<str>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut fields = Self::default();
        for (key, value) in pairs {
            fields.field_count += 1;
            let slot = match key.as_ref() {
                "body" => &mut fields.body,
                "file_path" => &mut fields.file_path,
                "file_line" => &mut fields.file_line,
                "emote" => &mut fields.emote,
                "topic" => &mut fields.topic,
                "id" => &mut fields.id,
                _ => continue,
            };
            if slot.is_empty() {
                *slot = value.into();
            }
        }
        fields
    }

    /// The submitted `id` as a validated lock identifier.
    pub fn lock_id(&self) -> Result<LockId, MessageError> {
        if self.id.is_empty() {
            return Err(MessageError::MissingField("id"));
        }
        Ok(LockId::new(self.id.clone())?)
    }
}

/// Debug message document delivered to consoles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugMessage {
    pub action: Action,
    pub message: String,
    pub file_path: String,
    pub file_line: String,
    pub file_display: String,
    pub file_display_short: String,
    pub emote: String,
    pub topic: String,
    pub id: String,
}

impl DebugMessage {
    /// Build a message from submitted fields.
    ///
    /// Fails on an empty form. Script tags are stripped from the body.
    pub fn new(action: Action, fields: &MessageFields) -> Result<Self, MessageError> {
        if fields.field_count == 0 {
            return Err(MessageError::EmptyForm);
        }

        let mut file_display = clean_path(&fields.file_path);
        let mut file_display_short = base_name(&file_display).to_string();
        if !fields.file_line.is_empty() {
            file_display = format!("{}:{}", file_display, fields.file_line);
            file_display_short = format!("{}:{}", file_display_short, fields.file_line);
        }

        Ok(Self {
            action,
            message: strip_script_tags(&fields.body),
            file_path: fields.file_path.clone(),
            file_line: fields.file_line.clone(),
            file_display,
            file_display_short,
            emote: fields.emote.clone(),
            topic: fields.topic.clone(),
            id: fields.id.clone(),
        })
    }

    /// Topic the resulting event is published under.
    pub fn event_topic(&self) -> &str {
        if self.topic.is_empty() {
            DEFAULT_TOPIC
        } else {
            &self.topic
        }
    }

    /// Wrap this message as an unpublished broadcast event.
    pub fn into_event(self) -> Result<DebugEvent, serde_json::Error> {
        let payload = serde_json::to_vec(&self)?;
        Ok(DebugEvent::new(self.event_topic(), payload))
    }
}

fn script_tag_regex() -> &'static Regex {
    static SCRIPT_TAG: OnceLock<Regex> = OnceLock::new();
    SCRIPT_TAG.get_or_init(|| {
        Regex::new(r"(?is)<script.*?>.*?</script>").expect("script tag pattern is valid")
    })
}

/// Remove `<script>...</script>` blocks, case-insensitively. Blocks may
/// span lines.
pub fn strip_script_tags(input: &str) -> String {
    script_tag_regex().replace_all(input, "").into_owned()
}

/// Lexically clean a slash-separated path: collapse separators, drop `.`
/// segments and resolve `..` where a parent segment exists.
pub fn clean_path(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|last| *last != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

fn base_name(path: &str) -> &str {
    match path.rsplit('/').next() {
        Some("") | None => path,
        Some(name) => name,
    }
}
