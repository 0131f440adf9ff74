use std::sync::Arc;

use crate::broadcast::BroadcastChannel;
use crate::crypto::CryptoGate;
use crate::locks::LockStore;

/// Everything a handler needs, built once at startup and shared by reference.
#[derive(Clone)]
pub struct AppState {
    pub channel: BroadcastChannel,
    pub gate: Arc<CryptoGate>,
    pub locks: Arc<dyn LockStore>,
}

impl AppState {
    pub fn new(channel: BroadcastChannel, gate: CryptoGate, locks: Arc<dyn LockStore>) -> Self {
        Self {
            channel,
            gate: Arc::new(gate),
            locks,
        }
    }
}
