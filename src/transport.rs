// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Transport definition for PeSIT sessions

use super::error::Error;
use std::time::Duration;

/// Default receive timeout while a session is idle between transfers
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// an abstract byte-stream transport used by sessions to exchange frames
///
/// ## How can I implement `Channel`?
///
/// Implementations own the socket exclusively; a session never shares its
/// channel. `read_exact` must either fill the whole buffer or fail, and a
/// timed-out read must not leave a partially consumed frame behind — the
/// session always reads the two length bytes and the body through the same
/// call sequence, so returning an error before any byte arrived is enough.
pub trait Channel: Send {
    /// fills `buf` completely from the peer or fails with a typed I/O error.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error>;
    /// writes the whole buffer.
    fn write_all(&mut self, buf: &[u8]) -> Result<(), Error>;
    /// bounds every subsequent read.
    fn set_receive_timeout(&mut self, timeout: Duration) -> Result<(), Error>;
    /// orderly shutdown; further operations fail.
    fn close(&mut self) -> Result<(), Error>;
    /// peer address for log records.
    fn peer_label(&self) -> String;
}
