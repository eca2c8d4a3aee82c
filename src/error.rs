// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Error and diagnostic types

use std::fmt;
use std::io::Error as IOError;
use thiserror::Error;

/// PeSIT diagnostic carried in PI 2 as three bytes: class, code high, code low.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Diag {
    pub class: u8,
    pub code: u16,
}

/// Success
pub const D0_000: Diag = Diag { class: 0, code: 0 };
/// File unknown or disabled
pub const D2_205: Diag = Diag { class: 2, code: 205 };
/// Transfer direction or file permission refused
pub const D2_226: Diag = Diag { class: 2, code: 226 };
/// Congestion, window overrun or local stop
pub const D3_300: Diag = Diag { class: 3, code: 300 };
/// Unexpected FPDU or unknown identifier
pub const D3_301: Diag = Diag { class: 3, code: 301 };
/// Partner authentication or authorisation failure
pub const D3_304: Diag = Diag { class: 3, code: 304 };
/// Protocol version not supported
pub const D3_308: Diag = Diag { class: 3, code: 308 };

impl Diag {
    pub fn new(class: u8, code: u16) -> Diag {
        Diag { class, code }
    }

    pub fn is_success(&self) -> bool {
        *self == D0_000
    }

    /// Wire form, high byte of the code first.
    pub fn to_bytes(&self) -> [u8; 3] {
        [self.class, (self.code >> 8) as u8, (self.code & 0xFF) as u8]
    }

    pub fn from_bytes(b: &[u8]) -> Option<Diag> {
        if b.len() != 3 {
            return None;
        }
        Some(Diag {
            class: b[0],
            code: ((b[1] as u16) << 8) | b[2] as u16,
        })
    }

    pub fn text(&self) -> &'static str {
        diag_text(*self)
    }
}

impl fmt::Display for Diag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "D{}_{:03} {}", self.class, self.code, self.text())
    }
}

//DiagText returns a string for a diagnostic code
fn diag_text(diag: Diag) -> &'static str {
    match diag {
        D0_000 => "OK",
        D2_205 => "FILE : unknown or disabled virtual file",
        D2_226 => "FILE : transfer direction not permitted",
        D3_300 => "PROT : congestion or checkpoint window exceeded",
        D3_301 => "PROT : unexpected FPDU or unknown identifier",
        D3_304 => "AUTH : partner authentication refused",
        D3_308 => "PROT : protocol version not supported",
        _ => "unknown diagnostic",
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("connection error: {0}")]
    Connect(String),
    #[error("IO error: {0}")]
    Io(#[from] IOError),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("truncated frame: {0} bytes")]
    TruncatedFrame(usize),
    #[error("parameter {id} overruns its frame")]
    TruncatedParameter { id: u8 },
    #[error("unknown PI {0}")]
    UnknownPi(u8),
    #[error("unknown PGI {0}")]
    UnknownPgi(u8),
    #[error("unknown FPDU ({phase:#04x}, {fpdu_type:#04x})")]
    UnknownFpdu { phase: u8, fpdu_type: u8 },
    #[error("parameter {id} value of {len} bytes does not fit a TLV entry")]
    ParameterTooLong { id: u8, len: usize },
    #[error("frame body of {0} bytes exceeds the 16 bit length prefix")]
    FrameTooLong(usize),
    #[error("{0} cannot carry a data payload")]
    UnexpectedPayload(&'static str),
    #[error("string is not representable in ISO-8859-1: {0:?}")]
    BadString(char),
    #[error("missing parameter PI {0}")]
    MissingParameter(u8),
    #[error("malformed parameter PI {id}: {reason}")]
    MalformedParameter { id: u8, reason: &'static str },
    #[error("protocol error {diag}: {message}")]
    Protocol { diag: Diag, message: String },
    #[error("peer aborted the session: {diag}")]
    RemoteAbort { diag: Diag },
    #[error("connection rejected by peer: {diag}")]
    Rejected { diag: Diag },
    #[error("transfer cancelled")]
    Cancelled,
    #[error("transfer cannot be resumed: {0}")]
    ResumeIneligible(&'static str),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("session is closed")]
    Closed,
}

impl Error {
    /// Builds the protocol-error variant with the diagnostic's canonical text.
    pub(crate) fn protocol(diag: Diag) -> Error {
        Error::Protocol {
            diag,
            message: diag.text().to_string(),
        }
    }

    /// Diagnostic this error maps to when the session must be torn down.
    pub fn diag(&self) -> Diag {
        match self {
            Error::Protocol { diag, .. } => *diag,
            Error::RemoteAbort { diag } => *diag,
            Error::Rejected { diag } => *diag,
            Error::Cancelled => D3_300,
            _ => D3_301,
        }
    }
}
