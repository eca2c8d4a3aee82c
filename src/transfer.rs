// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Transfer bookkeeping shared by both roles: identifiers, checkpoint
//! policy, adaptive timeouts and cooperative cancellation.

use super::config::Direction;
use super::constant::{MAX_RECEIVE_TIMEOUT_SECS, TRANSFER_ID_MODULUS};
use super::error::Error;
use super::journal::{Checkpoint, Outcome};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

static SEED: Once = Once::new();
static COUNTER: AtomicU32 = AtomicU32::new(0);

/// Process-wide transfer id: monotonic modulo 2^24, seeded from the clock
/// at first use so restarts do not replay the same ids.
pub fn next_transfer_id() -> u32 {
    SEED.call_once(|| {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        COUNTER.store(nanos % TRANSFER_ID_MODULUS, Ordering::Relaxed);
    });
    COUNTER.fetch_add(1, Ordering::Relaxed) % TRANSFER_ID_MODULUS
}

/// Checkpoint interval in KiB when the caller did not pin one:
/// small files skip checkpointing, large ones spread it out.
pub fn sync_interval_for(file_size: Option<u64>) -> u16 {
    const MIB: u64 = 1024 * 1024;
    match file_size {
        None => 1024,
        Some(size) if size < MIB => 0,
        Some(size) if size < 10 * MIB => 256,
        Some(size) if size < 100 * MIB => 1024,
        Some(_) => 5 * 1024,
    }
}

/// Receive timeout scaled to the file: one extra minute per 50 MiB on top
/// of the base, never above 30 minutes and never below the base.
pub fn receive_timeout(base: Duration, file_size: u64) -> Duration {
    const CHUNK: u64 = 50 * 1024 * 1024;
    let extra_secs = (file_size / CHUNK) as u128 * 60;
    if extra_secs == 0 {
        return base;
    }
    let total = base.as_secs() as u128 + extra_secs;
    let capped = total.min(MAX_RECEIVE_TIMEOUT_SECS as u128) as u64;
    Duration::from_secs(capped.max(base.as_secs()))
}

/// Shared cancel flag, polled between DTF chunks. The only mutable state
/// a transfer shares with the outside.
#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

impl Default for CancelToken {
    fn default() -> CancelToken {
        CancelToken::new()
    }
}

/// State of one running transfer, nested in the session for its duration.
pub struct TransferContext {
    pub direction: Direction,
    pub virtual_file_id: String,
    pub transfer_id: u32,
    pub file_size: Option<u64>,
    pub bytes_transferred: u64,
    pub records_transferred: u64,
    pub restart_point: u64,
    pub sync_point: u32,
    pub bytes_at_last_sync: u64,
    /// Rolling fingerprint over every article, for completion records.
    pub checksum: u32,
    pub cancel: CancelToken,
    started: Instant,
}

impl TransferContext {
    pub fn new(direction: Direction, virtual_file_id: &str, transfer_id: u32) -> TransferContext {
        TransferContext {
            direction,
            virtual_file_id: virtual_file_id.to_string(),
            transfer_id,
            file_size: None,
            bytes_transferred: 0,
            records_transferred: 0,
            restart_point: 0,
            sync_point: 0,
            bytes_at_last_sync: 0,
            checksum: 0,
            cancel: CancelToken::new(),
            started: Instant::now(),
        }
    }

    /// Accounts one article.
    pub(crate) fn account(&mut self, chunk: &[u8]) {
        self.bytes_transferred += chunk.len() as u64;
        self.records_transferred += 1;
        for &b in chunk {
            self.checksum = self.checksum.rotate_left(1) ^ b as u32;
        }
    }

    pub fn elapsed_millis(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Outcome summary handed back by the engine entry points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub transfer_id: u32,
    pub bytes_transferred: u64,
    pub records_transferred: u64,
    pub sync_points: u32,
    pub duration_millis: u64,
}

/// A transfer can restart only from a recorded checkpoint of a transfer
/// that did not complete.
pub(crate) fn resume_checkpoint(
    outcome: Option<Outcome>,
    checkpoint: Option<Checkpoint>,
) -> Result<Checkpoint, Error> {
    match outcome {
        Some(Outcome::Failed) | Some(Outcome::Cancelled) => {}
        Some(Outcome::Completed) => {
            return Err(Error::ResumeIneligible("transfer already completed"))
        }
        None => return Err(Error::ResumeIneligible("transfer is unknown")),
    }
    let checkpoint =
        checkpoint.ok_or(Error::ResumeIneligible("no sync points were negotiated"))?;
    if checkpoint.sync_point == 0 {
        return Err(Error::ResumeIneligible("no sync point was ever acknowledged"));
    }
    Ok(checkpoint)
}
