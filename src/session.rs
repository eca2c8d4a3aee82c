// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! One session: a channel, a context and strictly serial FPDU exchange

use super::codec;
use super::config::{PartnerConfig, VirtualFileConfig};
use super::error::{Diag, Error, D3_301};
use super::fpdu::{Fpdu, FpduKind, Param};
use super::observer::{NullObserver, TransferObserver};
use super::state::{self, Role, State};
use super::transfer::TransferContext;
use super::transport::Channel;
use byteorder::{BigEndian, ByteOrder};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-connection state shared by both roles. Created when the socket is
/// accepted (responder) or connected (initiator), destroyed with it.
pub struct SessionContext {
    pub role: Role,
    pub state: State,
    pub local_conn_id: u16,
    pub peer_conn_id: u16,
    pub protocol_version: u8,
    /// Requested PI 22 value for this session.
    pub access_type: u8,
    /// Negotiated PI 25.
    pub max_entity_size: u16,
    /// Negotiated article size (PI 32).
    pub article_size: u16,
    /// Negotiated checkpoint interval; 0 disables sync points.
    pub sync_interval_kb: u16,
    pub sync_window: u8,
    pub partner_id: String,
    pub server_id: String,
    pub partner: Option<Arc<PartnerConfig>>,
    pub file: Option<Arc<VirtualFileConfig>>,
    pub transfer: Option<TransferContext>,
    pub aborted: bool,
    pub last_activity: Instant,
}

impl SessionContext {
    pub fn new(role: Role) -> SessionContext {
        SessionContext {
            role,
            state: State::Cn01Idle,
            local_conn_id: 0,
            peer_conn_id: 0,
            protocol_version: crate::constant::PROTOCOL_VERSION,
            access_type: crate::constant::ACCESS_WRITE,
            max_entity_size: 0,
            article_size: crate::constant::DEFAULT_RECORD_LENGTH,
            sync_interval_kb: 0,
            sync_window: crate::constant::DEFAULT_SYNC_WINDOW,
            partner_id: String::new(),
            server_id: String::new(),
            partner: None,
            file: None,
            transfer: None,
            aborted: false,
            last_activity: Instant::now(),
        }
    }

    pub fn sync_enabled(&self) -> bool {
        self.sync_interval_kb > 0
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

pub struct Session {
    channel: Box<dyn Channel>,
    pub ctx: SessionContext,
    session_id: u64,
    strict: bool,
    observer: Arc<dyn TransferObserver>,
}

impl Session {
    pub fn new(channel: Box<dyn Channel>, role: Role) -> Session {
        Session::with_observer(channel, role, 0, Arc::new(NullObserver))
    }

    pub fn with_observer(
        channel: Box<dyn Channel>,
        role: Role,
        session_id: u64,
        observer: Arc<dyn TransferObserver>,
    ) -> Session {
        Session {
            channel,
            ctx: SessionContext::new(role),
            session_id,
            strict: true,
            observer,
        }
    }

    /// Lax parsing keeps unknown parameters instead of failing the frame.
    pub fn set_strict(&mut self, strict: bool) {
        self.strict = strict;
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn peer_label(&self) -> String {
        self.channel.peer_label()
    }

    pub fn set_receive_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.channel.set_receive_timeout(timeout)
    }

    /// Encodes and writes one FPDU.
    pub fn send_fpdu(&mut self, fpdu: &Fpdu) -> Result<(), Error> {
        let frame = codec::encode(fpdu)?;
        log::debug!("session {}: -> {}", self.session_id, fpdu);
        self.channel.write_all(&frame)?;
        self.ctx.touch();
        Ok(())
    }

    /// Sends a DTF-family FPDU with its payload inside the frame.
    pub fn send_fpdu_with_data(&mut self, fpdu: Fpdu, data: Vec<u8>) -> Result<(), Error> {
        self.send_fpdu(&fpdu.with_data(data))
    }

    /// Writes `fpdu` and blocks on the next inbound FPDU. An inbound ABORT
    /// surfaces as [`Error::RemoteAbort`] with the peer's diagnostic.
    pub fn send_fpdu_with_ack(&mut self, fpdu: &Fpdu) -> Result<Fpdu, Error> {
        self.send_fpdu(fpdu)?;
        let ack = self.receive_fpdu()?;
        if ack.kind() == FpduKind::Abort {
            self.ctx.aborted = true;
            self.set_state(State::Terminal);
            return Err(Error::RemoteAbort {
                diag: ack.diag().unwrap_or(D3_301),
            });
        }
        Ok(ack)
    }

    /// Blocking read of one framed FPDU.
    pub fn receive_fpdu(&mut self) -> Result<Fpdu, Error> {
        let body = self.read_frame()?;
        let fpdu = codec::decode_body(&body, self.strict)?;
        log::debug!("session {}: <- {}", self.session_id, fpdu);
        Ok(fpdu)
    }

    /// Blocking read of one frame's body bytes, header included. The data
    /// phase uses this to lift DTF payloads out without re-parsing.
    pub fn receive_raw_fpdu(&mut self) -> Result<Vec<u8>, Error> {
        self.read_frame()
    }

    fn read_frame(&mut self) -> Result<Vec<u8>, Error> {
        let mut prefix = [0u8; 2];
        self.channel.read_exact(&mut prefix)?;
        let len = BigEndian::read_u16(&prefix) as usize;
        let mut body = vec![0u8; len];
        self.channel.read_exact(&mut body)?;
        self.ctx.touch();
        Ok(body)
    }

    /// Runs an inbound FPDU kind through the transition table. A rejected
    /// kind aborts the session with the table's diagnostic.
    pub(crate) fn gate(&mut self, kind: FpduKind) -> Result<(), Error> {
        match state::on_receive(self.ctx.role, self.ctx.state, kind) {
            Ok(next) => {
                self.set_state(next);
                Ok(())
            }
            Err(diag) => {
                log::warn!(
                    "session {}: {} not legal in {}",
                    self.session_id,
                    kind,
                    self.ctx.state
                );
                self.abort(diag);
                Err(Error::protocol(diag))
            }
        }
    }

    pub(crate) fn set_state(&mut self, new: State) {
        if self.ctx.state != new {
            self.observer.on_state(self.session_id, self.ctx.state, new);
            self.ctx.state = new;
        }
    }

    /// Best-effort ABORT carrying the diagnostic, then terminal state. The
    /// socket may already be gone; that is not an error here.
    pub fn abort(&mut self, diag: Diag) {
        if self.ctx.aborted || self.ctx.state == State::Terminal {
            self.set_state(State::Terminal);
            return;
        }
        self.ctx.aborted = true;
        let fpdu = Fpdu::new(FpduKind::Abort, self.ctx.local_conn_id, self.ctx.peer_conn_id)
            .with_param(Param::diag(diag));
        if let Err(e) = self.send_fpdu(&fpdu) {
            log::debug!("session {}: abort not delivered: {}", self.session_id, e);
        }
        self.set_state(State::Terminal);
    }

    pub fn close(&mut self) -> Result<(), Error> {
        self.set_state(State::Terminal);
        self.channel.close()
    }
}
