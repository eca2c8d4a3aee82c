// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Transfer journal: checkpoints and outcomes that survive a transfer
//!
//! Both roles write here. The responder answers ACK_WRITE restart points
//! from it, the initiator decides resume eligibility with it. Durable
//! storage is the host's concern behind the trait; the in-memory
//! implementation covers tests and single-process deployments.

use std::collections::HashMap;
use std::sync::Mutex;

/// A transfer is identified across sessions by who moved which file under
/// which 24-bit transfer id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JournalKey {
    pub partner: String,
    pub virtual_file: String,
    pub transfer_id: u32,
}

impl JournalKey {
    pub fn new(partner: &str, virtual_file: &str, transfer_id: u32) -> JournalKey {
        JournalKey {
            partner: partner.to_string(),
            virtual_file: virtual_file.to_string(),
            transfer_id,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
    Cancelled,
}

/// Last acknowledged sync point and the byte offset it covers.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Checkpoint {
    pub sync_point: u32,
    pub bytes: u64,
}

pub trait TransferJournal: Send + Sync {
    /// Called after every acknowledged sync point. `bytes` never decreases
    /// for a given key.
    fn record_sync(&self, key: &JournalKey, sync_point: u32, bytes: u64);

    /// Checkpoint a restarted transfer may continue from.
    fn restart_point(&self, key: &JournalKey) -> Option<Checkpoint>;

    fn record_outcome(&self, key: &JournalKey, outcome: Outcome);

    fn outcome(&self, key: &JournalKey) -> Option<Outcome>;
}

#[derive(Default)]
struct Entry {
    checkpoint: Option<Checkpoint>,
    outcome: Option<Outcome>,
}

pub struct MemoryJournal {
    entries: Mutex<HashMap<JournalKey, Entry>>,
}

impl MemoryJournal {
    pub fn new() -> MemoryJournal {
        MemoryJournal {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryJournal {
    fn default() -> MemoryJournal {
        MemoryJournal::new()
    }
}

impl TransferJournal for MemoryJournal {
    fn record_sync(&self, key: &JournalKey, sync_point: u32, bytes: u64) {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(key.clone()).or_default();
        entry.checkpoint = Some(Checkpoint { sync_point, bytes });
    }

    fn restart_point(&self, key: &JournalKey) -> Option<Checkpoint> {
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .and_then(|e| e.checkpoint)
    }

    fn record_outcome(&self, key: &JournalKey, outcome: Outcome) {
        let mut entries = self.entries.lock().unwrap();
        entries.entry(key.clone()).or_default().outcome = Some(outcome);
    }

    fn outcome(&self, key: &JournalKey) -> Option<Outcome> {
        self.entries.lock().unwrap().get(key).and_then(|e| e.outcome)
    }
}
