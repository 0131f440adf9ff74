//! Types library for the debug relay
//!
//! This library provides the core type definitions shared by the relay
//! service and its tests, keeping wire shapes in one place.
//!
//! # Modules
//! - `ids`: Identifiers (LockId, SubscriberId)
//! - `event`: Broadcast events and debug message documents
//! - `lock`: Pause lock records and their wire shape
//! - `errors`: Error taxonomy

pub mod ids;
pub mod event;
pub mod lock;
pub mod errors;
