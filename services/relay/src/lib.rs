//! Debug Relay Service
//!
//! Lets debugged application instances emit debug snapshots over the
//! network, fans them out in real time to connected developer consoles,
//! and lets an operator hold a debugged call site until it is released.
//!
//! # Architecture
//!
//! ```text
//!  debugged process                       developer consoles
//!        │ POST /messages, /pauses                 ▲ GET /stream (SSE)
//!   ┌────▼──────┐                                  │
//!   │ CryptoGate│  ← verify signature, decrypt      │
//!   └────┬──────┘                                  │
//!        │ plaintext                               │
//!   ┌────▼─────────────────────────────────────────┴──┐
//!   │ BroadcastChannel  (bounded backlog + fan-out)   │
//!   └─────────────────────────────────────────────────┘
//!
//!  debugged process ── GET/PATCH/DELETE /pauses/{id} ──► LockStore
//! ```

pub mod broadcast;
pub mod config;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod locks;
pub mod router;
pub mod server;
pub mod state;

pub const SERVICE_NAME: &str = "debug-relay";
pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");
