// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Progress and lifecycle notifications
//!
//! Sessions and transfers push into a [`TransferObserver`]; sinks fan the
//! events out to whatever the host wires up (websockets, persistence).
//! Implementations must not block the session thread: buffer or drop.

use super::error::Diag;
use super::state::State;

pub trait TransferObserver: Send + Sync {
    /// Byte progress, monotonically non-decreasing per transfer id.
    fn on_bytes(&self, transfer_id: u32, bytes: u64, file_size: Option<u64>, sync_point: u32) {
        let _ = (transfer_id, bytes, file_size, sync_point);
    }

    /// State-machine transition of one session.
    fn on_state(&self, session_id: u64, old: State, new: State) {
        let _ = (session_id, old, new);
    }

    fn on_complete(&self, transfer_id: u32, bytes: u64, millis: u64) {
        let _ = (transfer_id, bytes, millis);
    }

    fn on_failed(&self, transfer_id: u32, diag: Diag, message: &str) {
        let _ = (transfer_id, diag, message);
    }
}

/// Discards everything.
pub struct NullObserver;

impl TransferObserver for NullObserver {}

/// Writes every event to the `log` facade.
pub struct LogObserver;

impl TransferObserver for LogObserver {
    fn on_bytes(&self, transfer_id: u32, bytes: u64, file_size: Option<u64>, sync_point: u32) {
        match file_size {
            Some(total) => log::debug!(
                "transfer {}: {}/{} bytes, sync point {}",
                transfer_id,
                bytes,
                total,
                sync_point
            ),
            None => log::debug!(
                "transfer {}: {} bytes, sync point {}",
                transfer_id,
                bytes,
                sync_point
            ),
        }
    }

    fn on_state(&self, session_id: u64, old: State, new: State) {
        log::debug!("session {}: {} -> {}", session_id, old, new);
    }

    fn on_complete(&self, transfer_id: u32, bytes: u64, millis: u64) {
        log::info!(
            "transfer {} complete: {} bytes in {} ms",
            transfer_id,
            bytes,
            millis
        );
    }

    fn on_failed(&self, transfer_id: u32, diag: Diag, message: &str) {
        log::warn!("transfer {} failed: {} ({})", transfer_id, diag, message);
    }
}
