// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Responder side: answers one connection until it reaches terminal state
//!
//! The supervisor hands every accepted socket to [`serve_connection`]. The
//! loop receives one FPDU at a time, gates it through the state table and
//! answers; the data phase switches to raw frames so DTF payloads are
//! lifted out without a second parse.

use super::codec;
use super::config::{Direction, PartnerConfig, ServerConfig, VirtualFileConfig};
use super::constant::*;
use super::error::{Error, D2_205, D3_300, D3_301};
use super::fpdu::{latin1_decode, parse_sync_points, sync_points_param, Fpdu, FpduKind, Param};
use super::journal::{JournalKey, Outcome, TransferJournal};
use super::observer::TransferObserver;
use super::session::Session;
use super::state::{Role, State};
use super::stream::{ByteSink, ByteSource, FileStore, ResolveContext};
use super::transfer::{receive_timeout, TransferContext};
use super::transport::Channel;
use byteorder::{BigEndian, ByteOrder};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const PROGRESS_INTERVAL: u64 = 1024 * 1024;

/// Counts live sessions per partner so `max_connections` holds across the
/// whole process.
pub struct PartnerSlots {
    counts: Mutex<HashMap<String, usize>>,
}

impl PartnerSlots {
    pub fn new() -> PartnerSlots {
        PartnerSlots {
            counts: Mutex::new(HashMap::new()),
        }
    }

    fn claim(&self, partner: &str, max: Option<usize>) -> bool {
        let mut counts = self.counts.lock().unwrap();
        let count = counts.entry(partner.to_string()).or_insert(0);
        if let Some(max) = max {
            if *count >= max {
                return false;
            }
        }
        *count += 1;
        true
    }

    fn release(&self, partner: &str) {
        let mut counts = self.counts.lock().unwrap();
        if let Some(count) = counts.get_mut(partner) {
            *count = count.saturating_sub(1);
        }
    }
}

impl Default for PartnerSlots {
    fn default() -> PartnerSlots {
        PartnerSlots::new()
    }
}

/// Everything a responder session borrows from its server.
#[derive(Clone)]
pub struct Shared {
    pub config: Arc<ServerConfig>,
    pub store: Arc<dyn FileStore>,
    pub journal: Arc<dyn TransferJournal>,
    pub observer: Arc<dyn TransferObserver>,
    pub slots: Arc<PartnerSlots>,
    pub stop: Arc<AtomicBool>,
}

/// Runs one responder session to completion. Returns Ok even when the
/// session ended in an ABORT it sent itself; only transport-level faults
/// surface as errors.
pub fn serve_connection(
    channel: Box<dyn Channel>,
    session_id: u64,
    shared: Shared,
) -> Result<(), Error> {
    let mut responder = Responder::new(channel, session_id, shared);
    let result = responder.run();
    responder.cleanup();
    result
}

/// Streams attached to the transfer in flight.
struct OpenFile {
    file: VirtualFileConfig,
    source: Option<Box<dyn ByteSource>>,
    sink: Option<Box<dyn ByteSink>>,
}

struct Responder {
    session: Session,
    shared: Shared,
    partner: Option<PartnerConfig>,
    claimed: bool,
    open_file: Option<OpenFile>,
    message: Option<Vec<u8>>,
}

impl Responder {
    fn new(channel: Box<dyn Channel>, session_id: u64, shared: Shared) -> Responder {
        let mut session = Session::with_observer(
            channel,
            Role::Responder,
            session_id,
            shared.observer.clone(),
        );
        session.ctx.local_conn_id = (session_id & 0x7FFF) as u16 | 0x8000;
        session.ctx.server_id = shared.config.server_id.clone();
        session.set_strict(shared.config.strict);
        Responder {
            session,
            shared,
            partner: None,
            claimed: false,
            open_file: None,
            message: None,
        }
    }

    fn base_timeout(&self) -> Duration {
        Duration::from_secs(self.shared.config.base_timeout_secs)
    }

    fn run(&mut self) -> Result<(), Error> {
        self.session.set_receive_timeout(self.base_timeout())?;
        while self.session.ctx.state != State::Terminal {
            if self.shared.stop.load(Ordering::Relaxed) {
                log::info!(
                    "session {}: draining for shutdown",
                    self.session.session_id()
                );
                self.fail_transfer(D3_300, "server shutting down");
                self.session.abort(D3_300);
                break;
            }
            if self.session.ctx.state == State::Tde02bReceivingData {
                match self.receive_data_round() {
                    Ok(()) => continue,
                    Err(e) => return self.fatal(e),
                }
            }
            let fpdu = match self.session.receive_fpdu() {
                Ok(fpdu) => fpdu,
                Err(e) => return self.fatal(e),
            };
            if !self.check_addressing(fpdu.kind(), fpdu.id_dst()) {
                continue;
            }
            if self.session.gate(fpdu.kind()).is_err() {
                continue; // gate sent the ABORT and reached terminal
            }
            if let Err(e) = self.dispatch(fpdu) {
                return self.fatal(e);
            }
        }
        let _ = self.session.close();
        Ok(())
    }

    /// After ACONNECT every inbound FPDU must address our connection id.
    fn check_addressing(&mut self, kind: FpduKind, id_dst: u16) -> bool {
        if self.session.ctx.state == State::Cn01Idle || kind == FpduKind::Abort {
            return true;
        }
        if id_dst != self.session.ctx.local_conn_id {
            log::warn!(
                "session {}: {} addressed to {} instead of {}",
                self.session.session_id(),
                kind,
                id_dst,
                self.session.ctx.local_conn_id
            );
            self.fail_transfer(D3_301, "misaddressed FPDU");
            self.session.abort(D3_301);
            return false;
        }
        true
    }

    fn fatal(&mut self, e: Error) -> Result<(), Error> {
        match e {
            // protocol refusals already answered on the wire
            Error::Protocol { .. } | Error::RemoteAbort { .. } => {
                self.fail_transfer(e.diag(), &e.to_string());
                let _ = self.session.close();
                Ok(())
            }
            e => {
                self.fail_transfer(e.diag(), &e.to_string());
                self.session.abort(D3_300);
                let _ = self.session.close();
                Err(e)
            }
        }
    }

    /// Rolls a transfer in flight to failed and closes its streams without
    /// committing anything past the last completed article.
    fn fail_transfer(&mut self, diag: crate::error::Diag, message: &str) {
        if let Some(ctx) = self.session.ctx.transfer.take() {
            let key = self.journal_key(&ctx);
            self.shared.journal.record_outcome(&key, Outcome::Failed);
            self.shared
                .observer
                .on_failed(ctx.transfer_id, diag, message);
        }
        if let Some(mut open) = self.open_file.take() {
            if let Some(mut sink) = open.sink.take() {
                let _ = sink.close();
            }
        }
    }

    fn journal_key(&self, ctx: &TransferContext) -> JournalKey {
        JournalKey::new(
            &self.session.ctx.partner_id,
            &ctx.virtual_file_id,
            ctx.transfer_id,
        )
    }

    fn dispatch(&mut self, fpdu: Fpdu) -> Result<(), Error> {
        match fpdu.kind() {
            FpduKind::Connect => self.on_connect(fpdu),
            FpduKind::Create => self.on_create(fpdu),
            FpduKind::Select => self.on_select(fpdu),
            FpduKind::Open => self.on_open(),
            FpduKind::Close => self.on_close(),
            FpduKind::Write => self.on_write(fpdu),
            FpduKind::Read => self.on_read(fpdu),
            FpduKind::TransEnd => self.on_trans_end(),
            FpduKind::Deselect => self.on_deselect(),
            FpduKind::Release => self.on_release(),
            FpduKind::Abort => {
                self.fail_transfer(
                    fpdu.diag().unwrap_or(D3_300),
                    "peer aborted the session",
                );
                Ok(())
            }
            FpduKind::Msg => self.on_msg(fpdu),
            FpduKind::Msgdm => self.on_msg_segment(fpdu, true, false),
            FpduKind::Msgmm => self.on_msg_segment(fpdu, false, false),
            FpduKind::Msgfm => self.on_msg_segment(fpdu, false, true),
            other => {
                // legal per the table but meaningless outside the data phase
                log::warn!(
                    "session {}: no handler for {}",
                    self.session.session_id(),
                    other
                );
                self.session.abort(D3_301);
                Ok(())
            }
        }
    }

    fn on_connect(&mut self, fpdu: Fpdu) -> Result<(), Error> {
        let grant = match crate::validator::validate_connect(&self.shared.config, &fpdu) {
            Ok(grant) => grant,
            Err(diag) => {
                log::warn!(
                    "session {}: CONNECT from {} refused: {}",
                    self.session.session_id(),
                    fpdu.string(PI_03_DEMANDEUR).unwrap_or_default(),
                    diag
                );
                let rconnect = Fpdu::new(
                    FpduKind::Rconnect,
                    self.session.ctx.local_conn_id,
                    fpdu.id_src(),
                )
                .with_param(Param::diag(diag));
                self.session.send_fpdu(&rconnect)?;
                self.session.set_state(State::Terminal);
                return Ok(());
            }
        };

        let max = grant.partner.as_ref().and_then(|p| p.max_connections);
        if !self.shared.slots.claim(&grant.partner_id, max) {
            log::warn!(
                "session {}: partner {} is at its connection cap",
                self.session.session_id(),
                grant.partner_id
            );
            let rconnect = Fpdu::new(
                FpduKind::Rconnect,
                self.session.ctx.local_conn_id,
                fpdu.id_src(),
            )
            .with_param(Param::diag(D3_300));
            self.session.send_fpdu(&rconnect)?;
            self.session.set_state(State::Terminal);
            return Ok(());
        }
        self.claimed = true;

        self.session.ctx.peer_conn_id = fpdu.id_src();
        self.session.ctx.partner_id = grant.partner_id.clone();
        self.session.ctx.access_type = grant.access_type;
        self.session.ctx.protocol_version = grant.version.min(PROTOCOL_VERSION);
        self.session.ctx.partner = grant.partner.clone().map(Arc::new);
        self.partner = grant.partner;

        // the initiator's offer, bent to our own policy; zero turns
        // checkpointing off for the whole session
        let offered = fpdu.pi(PI_07_SYNC_POINTS).and_then(parse_sync_points);
        let (interval, window) = match (offered, self.shared.config.sync_interval_kb) {
            (Some((theirs, window)), None) => (theirs, window),
            (Some((theirs, window)), Some(ours)) => (theirs.min(ours), window),
            (None, _) => (0, 0),
        };
        self.session.ctx.sync_interval_kb = interval;
        if window > 0 {
            self.session.ctx.sync_window = window;
        }

        if let Some(text) = fpdu.string(PI_99_FREE_MESSAGE) {
            log::info!(
                "session {}: message from {}: {}",
                self.session.session_id(),
                grant.partner_id,
                text
            );
        }

        let mut aconnect = Fpdu::new(
            FpduKind::Aconnect,
            self.session.ctx.local_conn_id,
            self.session.ctx.peer_conn_id,
        )
        .with_param(Param::byte(PI_06_VERSION, self.session.ctx.protocol_version));
        if offered.is_some() {
            aconnect = aconnect.with_param(sync_points_param(interval, window));
        }
        self.session.send_fpdu(&aconnect)?;
        log::info!(
            "session {}: partner {} connected ({})",
            self.session.session_id(),
            self.session.ctx.partner_id,
            self.session.peer_label()
        );
        Ok(())
    }

    /// Resolves the file phase target, or aborts with the check's diag.
    fn select_file(&mut self, fpdu: &Fpdu, direction: Direction) -> Result<Option<VirtualFileConfig>, Error> {
        let name = match fpdu.string(PI_12_FILE_NAME) {
            Some(name) if !name.is_empty() => name,
            _ => {
                self.session.abort(D2_205);
                return Ok(None);
            }
        };
        match crate::validator::validate_file(
            &self.shared.config,
            self.partner.as_ref(),
            &name,
            direction,
        ) {
            Ok(file) => Ok(Some(file)),
            Err(diag) => {
                log::warn!(
                    "session {}: {} refused for {}: {}",
                    self.session.session_id(),
                    name,
                    self.session.ctx.partner_id,
                    diag
                );
                self.session.abort(diag);
                Ok(None)
            }
        }
    }

    fn resolve_ctx<'a>(&'a self, file: &'a VirtualFileConfig, direction: Direction) -> ResolveContext<'a> {
        ResolveContext {
            virtual_file: &file.id,
            partner: &self.session.ctx.partner_id,
            server: &self.session.ctx.server_id,
            direction,
            template: file.physical_path_template.as_deref(),
        }
    }

    fn on_create(&mut self, fpdu: Fpdu) -> Result<(), Error> {
        let file = match self.select_file(&fpdu, Direction::Receive)? {
            Some(file) => file,
            None => return Ok(()),
        };
        let transfer_id = fpdu.num(PI_13_TRANSFER_ID).unwrap_or(0) as u32;

        let peer_article = fpdu
            .num(PI_32_RECORD_LENGTH)
            .or_else(|| fpdu.num(PI_25_MAX_ENTITY_SIZE).map(|m| m.saturating_sub(FPDU_HEADER_SIZE as u64)))
            .unwrap_or(DEFAULT_RECORD_LENGTH as u64);
        let article = (file.record_length as u64).min(peer_article).max(1) as u16;
        self.session.ctx.article_size = article;
        self.session.ctx.max_entity_size = article + FPDU_HEADER_SIZE as u16;

        if let Some(kb) = fpdu.num(PI_42_MAX_RESERVATION) {
            let timeout = receive_timeout(self.base_timeout(), kb.saturating_mul(1024));
            self.session.set_receive_timeout(timeout)?;
        }

        let sink = match self.shared.store.open_sink(&self.resolve_ctx(&file, Direction::Receive)) {
            Ok(sink) => sink,
            Err(e) => {
                log::error!(
                    "session {}: cannot open sink for {}: {}",
                    self.session.session_id(),
                    file.id,
                    e
                );
                self.session.abort(D2_205);
                return Ok(());
            }
        };

        let mut ctx = TransferContext::new(Direction::Receive, &file.id, transfer_id);
        ctx.file_size = fpdu.num(PI_42_MAX_RESERVATION).map(|kb| kb * 1024);
        self.session.ctx.transfer = Some(ctx);
        self.session.ctx.file = Some(Arc::new(file.clone()));
        self.open_file = Some(OpenFile {
            file,
            source: None,
            sink: Some(sink),
        });

        let ack = Fpdu::new(
            FpduKind::AckCreate,
            self.session.ctx.local_conn_id,
            self.session.ctx.peer_conn_id,
        )
        .with_param(Param::num(
            PI_25_MAX_ENTITY_SIZE,
            self.session.ctx.max_entity_size as u64,
            2,
        ));
        self.session.send_fpdu(&ack)
    }

    fn on_select(&mut self, fpdu: Fpdu) -> Result<(), Error> {
        let file = match self.select_file(&fpdu, Direction::Send)? {
            Some(file) => file,
            None => return Ok(()),
        };
        let transfer_id = fpdu.num(PI_13_TRANSFER_ID).unwrap_or(0) as u32;

        let peer_article = fpdu
            .num(PI_25_MAX_ENTITY_SIZE)
            .map(|m| m.saturating_sub(FPDU_HEADER_SIZE as u64))
            .unwrap_or(DEFAULT_RECORD_LENGTH as u64);
        let article = (file.record_length as u64).min(peer_article).max(1) as u16;
        self.session.ctx.article_size = article;
        self.session.ctx.max_entity_size = article + FPDU_HEADER_SIZE as u16;

        let source = match self.shared.store.open_source(&self.resolve_ctx(&file, Direction::Send)) {
            Ok(source) => source,
            Err(e) => {
                log::warn!(
                    "session {}: cannot open source for {}: {}",
                    self.session.session_id(),
                    file.id,
                    e
                );
                self.session.abort(D2_205);
                return Ok(());
            }
        };
        let size = source.size_hint();

        let mut ctx = TransferContext::new(Direction::Send, &file.id, transfer_id);
        ctx.file_size = size;
        self.session.ctx.transfer = Some(ctx);
        self.session.ctx.file = Some(Arc::new(file.clone()));
        self.open_file = Some(OpenFile {
            file,
            source: Some(source),
            sink: None,
        });

        let mut ack = Fpdu::new(
            FpduKind::AckSelect,
            self.session.ctx.local_conn_id,
            self.session.ctx.peer_conn_id,
        )
        .with_param(Param::num(
            PI_25_MAX_ENTITY_SIZE,
            self.session.ctx.max_entity_size as u64,
            2,
        ));
        if let Some(size) = size {
            ack = ack.with_param(Param::group(
                PGI_40_PHYSICAL_ATTRIBUTES,
                vec![Param::num(PI_42_MAX_RESERVATION, (size + 1023) / 1024, 4)],
            ));
        }
        self.session.send_fpdu(&ack)
    }

    fn on_open(&mut self) -> Result<(), Error> {
        let ack = Fpdu::new(
            FpduKind::AckOpen,
            self.session.ctx.local_conn_id,
            self.session.ctx.peer_conn_id,
        )
        .with_param(Param::byte(PI_21_COMPRESSION, 0));
        self.session.send_fpdu(&ack)
    }

    fn on_close(&mut self) -> Result<(), Error> {
        let ack = Fpdu::new(
            FpduKind::AckClose,
            self.session.ctx.local_conn_id,
            self.session.ctx.peer_conn_id,
        );
        self.session.send_fpdu(&ack)
    }

    fn on_write(&mut self, fpdu: Fpdu) -> Result<(), Error> {
        let proposal = fpdu.num(PI_18_RESTART_POINT);
        let restart = match &self.session.ctx.transfer {
            Some(ctx) => {
                let key = self.journal_key(ctx);
                match proposal {
                    // a restart never reaches past what either side saw
                    Some(offset) => self
                        .shared
                        .journal
                        .restart_point(&key)
                        .map(|cp| cp.bytes.min(offset))
                        .unwrap_or(offset),
                    None => 0,
                }
            }
            None => 0,
        };

        if let Some(ctx) = self.session.ctx.transfer.as_mut() {
            ctx.restart_point = restart;
            ctx.bytes_transferred = restart;
            ctx.bytes_at_last_sync = restart;
        }
        if restart > 0 {
            if let Some(ctx) = self.session.ctx.transfer.as_ref() {
                let key = self.journal_key(ctx);
                if let Some(cp) = self.shared.journal.restart_point(&key) {
                    if let Some(ctx) = self.session.ctx.transfer.as_mut() {
                        ctx.sync_point = cp.sync_point;
                    }
                }
            }
        }
        if let Some(open) = self.open_file.as_mut() {
            if let Some(sink) = open.sink.as_mut() {
                sink.truncate(restart)?;
            }
        }

        let ack = Fpdu::new(
            FpduKind::AckWrite,
            self.session.ctx.local_conn_id,
            self.session.ctx.peer_conn_id,
        )
        .with_param(Param::num(PI_18_RESTART_POINT, restart, 4));
        self.session.send_fpdu(&ack)
    }

    /// One round of the data phase: a raw frame in, possibly an ack out.
    fn receive_data_round(&mut self) -> Result<(), Error> {
        let body = self.session.receive_raw_fpdu()?;
        let kind = codec::body_kind(&body)?;
        if body.len() >= 4 && !self.check_addressing(kind, BigEndian::read_u16(&body[2..4])) {
            return Ok(());
        }
        if self.session.gate(kind).is_err() {
            return Ok(());
        }
        match kind {
            k if k.is_data() => {
                let payload = &body[FPDU_HEADER_SIZE..];
                if payload.len() > self.session.ctx.article_size as usize {
                    self.fail_transfer(D3_300, "article larger than negotiated");
                    self.session.abort(D3_300);
                    return Ok(());
                }
                if let Some(open) = self.open_file.as_mut() {
                    if let Some(sink) = open.sink.as_mut() {
                        sink.write(payload)?;
                    }
                }
                if let Some(ctx) = self.session.ctx.transfer.as_mut() {
                    ctx.account(payload);
                    let (id, bytes, size, sync) = (
                        ctx.transfer_id,
                        ctx.bytes_transferred,
                        ctx.file_size,
                        ctx.sync_point,
                    );
                    if bytes / PROGRESS_INTERVAL != (bytes - payload.len() as u64) / PROGRESS_INTERVAL {
                        self.shared.observer.on_bytes(id, bytes, size, sync);
                    }
                }
                Ok(())
            }
            FpduKind::Syn => {
                let syn = codec::decode_body(&body, false)?;
                let number = syn.num(PI_20_SYNC_NUM).unwrap_or(0);
                let expected = self
                    .session
                    .ctx
                    .transfer
                    .as_ref()
                    .map(|c| c.sync_point as u64 + 1)
                    .unwrap_or(1);
                if number != expected {
                    self.fail_transfer(D3_300, "sync point out of sequence");
                    self.session.abort(D3_300);
                    return Ok(());
                }
                if let Some(ctx) = self.session.ctx.transfer.as_mut() {
                    ctx.sync_point = number as u32;
                    ctx.bytes_at_last_sync = ctx.bytes_transferred;
                }
                if let Some(ctx) = self.session.ctx.transfer.as_ref() {
                    let key = self.journal_key(ctx);
                    self.shared
                        .journal
                        .record_sync(&key, ctx.sync_point, ctx.bytes_transferred);
                    self.shared.observer.on_bytes(
                        ctx.transfer_id,
                        ctx.bytes_transferred,
                        ctx.file_size,
                        ctx.sync_point,
                    );
                }
                let ack = Fpdu::new(
                    FpduKind::AckSyn,
                    self.session.ctx.local_conn_id,
                    self.session.ctx.peer_conn_id,
                )
                .with_param(Param::num(PI_20_SYNC_NUM, number, 3));
                self.session.send_fpdu(&ack)
            }
            FpduKind::DtfEnd => Ok(()), // state moved on, TRANS_END comes next
            FpduKind::Idt => {
                self.fail_transfer(D3_300, "transfer interrupted by peer");
                let ack = Fpdu::new(
                    FpduKind::AckIdt,
                    self.session.ctx.local_conn_id,
                    self.session.ctx.peer_conn_id,
                );
                self.session.send_fpdu(&ack)
            }
            FpduKind::Abort => {
                let abort = codec::decode_body(&body, false)?;
                self.fail_transfer(
                    abort.diag().unwrap_or(D3_300),
                    "peer aborted during data phase",
                );
                Ok(())
            }
            other => {
                log::warn!(
                    "session {}: {} not expected in the data phase",
                    self.session.session_id(),
                    other
                );
                self.session.abort(D3_301);
                Ok(())
            }
        }
    }

    fn on_read(&mut self, fpdu: Fpdu) -> Result<(), Error> {
        let restart = fpdu.num(PI_18_RESTART_POINT).unwrap_or(0);
        let ack = Fpdu::new(
            FpduKind::AckRead,
            self.session.ctx.local_conn_id,
            self.session.ctx.peer_conn_id,
        )
        .with_param(Param::num(PI_18_RESTART_POINT, restart, 4));
        self.session.send_fpdu(&ack)?;
        self.send_data(restart)
    }

    /// Streams the selected source as DTF articles, checkpointing at the
    /// negotiated interval and pausing on the window.
    fn send_data(&mut self, restart: u64) -> Result<(), Error> {
        let mut source = match self.open_file.as_mut().and_then(|o| o.source.take()) {
            Some(source) => source,
            None => {
                self.session.abort(D2_205);
                return Ok(());
            }
        };
        if restart > 0 {
            source.skip(restart)?;
        }
        if let Some(ctx) = self.session.ctx.transfer.as_mut() {
            ctx.restart_point = restart;
            ctx.bytes_transferred = restart;
            ctx.bytes_at_last_sync = restart;
        }

        let src = self.session.ctx.local_conn_id;
        let dst = self.session.ctx.peer_conn_id;
        let article = self.session.ctx.article_size as usize;
        let interval_bytes = self.session.ctx.sync_interval_kb as u64 * 1024;
        let mut since_sync = 0u64;
        let mut since_progress = 0u64;
        let mut buf = vec![0u8; article.max(1)];

        loop {
            if self.shared.stop.load(Ordering::Relaxed) {
                self.fail_transfer(D3_300, "server shutting down");
                self.session.abort(D3_300);
                return Ok(());
            }
            let n = source.read(&mut buf)?;
            if n == 0 {
                break;
            }
            self.session
                .send_fpdu_with_data(Fpdu::new(FpduKind::Dtf, src, dst), buf[..n].to_vec())?;
            since_sync += n as u64;
            since_progress += n as u64;
            let mut emitted = None;
            if let Some(ctx) = self.session.ctx.transfer.as_mut() {
                ctx.account(&buf[..n]);
                emitted = Some((ctx.transfer_id, ctx.bytes_transferred, ctx.file_size));
            }

            if interval_bytes > 0 && since_sync >= interval_bytes {
                let number = self
                    .session
                    .ctx
                    .transfer
                    .as_ref()
                    .map(|c| c.sync_point as u64 + 1)
                    .unwrap_or(1);
                let syn = Fpdu::new(FpduKind::Syn, src, dst)
                    .with_param(Param::num(PI_20_SYNC_NUM, number, 3));
                let ack = self.session.send_fpdu_with_ack(&syn)?;
                self.session.gate(ack.kind())?;
                if ack.kind() != FpduKind::AckSyn
                    || ack.num(PI_20_SYNC_NUM) != Some(number)
                {
                    self.fail_transfer(D3_300, "sync point not acknowledged in order");
                    self.session.abort(D3_300);
                    return Ok(());
                }
                if let Some(ctx) = self.session.ctx.transfer.as_mut() {
                    ctx.sync_point = number as u32;
                    ctx.bytes_at_last_sync = ctx.bytes_transferred;
                }
                if let Some(ctx) = self.session.ctx.transfer.as_ref() {
                    let key = self.journal_key(ctx);
                    self.shared
                        .journal
                        .record_sync(&key, ctx.sync_point, ctx.bytes_transferred);
                    self.shared.observer.on_bytes(
                        ctx.transfer_id,
                        ctx.bytes_transferred,
                        ctx.file_size,
                        ctx.sync_point,
                    );
                }
                since_sync = 0;
                since_progress = 0;
            } else if since_progress >= PROGRESS_INTERVAL {
                if let Some((id, bytes, size)) = emitted {
                    let sync = self
                        .session
                        .ctx
                        .transfer
                        .as_ref()
                        .map(|c| c.sync_point)
                        .unwrap_or(0);
                    self.shared.observer.on_bytes(id, bytes, size, sync);
                }
                since_progress = 0;
            }
        }

        self.session
            .send_fpdu(&Fpdu::new(FpduKind::DtfEnd, src, dst))
        // the initiator answers with TRANS_END, handled by the main loop
    }

    fn on_trans_end(&mut self) -> Result<(), Error> {
        if let Some(mut open) = self.open_file.take() {
            if let Some(mut sink) = open.sink.take() {
                sink.close()?;
            }
            self.open_file = Some(open);
        }
        if let Some(ctx) = self.session.ctx.transfer.as_ref() {
            let key = self.journal_key(ctx);
            self.shared.journal.record_outcome(&key, Outcome::Completed);
            self.shared.observer.on_complete(
                ctx.transfer_id,
                ctx.bytes_transferred,
                ctx.elapsed_millis(),
            );
            log::info!(
                "session {}: transfer {} of {} done, {} bytes",
                self.session.session_id(),
                ctx.transfer_id,
                ctx.virtual_file_id,
                ctx.bytes_transferred
            );
        }
        let ack = Fpdu::new(
            FpduKind::AckTransEnd,
            self.session.ctx.local_conn_id,
            self.session.ctx.peer_conn_id,
        );
        self.session.send_fpdu(&ack)
    }

    fn on_deselect(&mut self) -> Result<(), Error> {
        self.session.ctx.transfer = None;
        self.session.ctx.file = None;
        self.open_file = None;
        let ack = Fpdu::new(
            FpduKind::AckDeselect,
            self.session.ctx.local_conn_id,
            self.session.ctx.peer_conn_id,
        );
        self.session.send_fpdu(&ack)
    }

    fn on_release(&mut self) -> Result<(), Error> {
        let relconf = Fpdu::new(
            FpduKind::Relconf,
            self.session.ctx.local_conn_id,
            self.session.ctx.peer_conn_id,
        );
        self.session.send_fpdu(&relconf)
    }

    fn on_msg(&mut self, fpdu: Fpdu) -> Result<(), Error> {
        if let Some(text) = fpdu.string(PI_91_MESSAGE).or_else(|| fpdu.string(PI_99_FREE_MESSAGE)) {
            log::info!(
                "session {}: message from {}: {}",
                self.session.session_id(),
                self.session.ctx.partner_id,
                text
            );
        }
        let ack = Fpdu::new(
            FpduKind::AckMsg,
            self.session.ctx.local_conn_id,
            self.session.ctx.peer_conn_id,
        );
        self.session.send_fpdu(&ack)
    }

    /// MSGDM opens the reassembly buffer, MSGMM extends it, MSGFM closes it
    /// and acknowledges. The buffer is bounded; overruns abort the session.
    fn on_msg_segment(&mut self, fpdu: Fpdu, first: bool, last: bool) -> Result<(), Error> {
        if first {
            self.message = Some(Vec::new());
        }
        let buffer = match self.message.as_mut() {
            Some(buffer) => buffer,
            None => {
                self.session.abort(D3_301);
                return Ok(());
            }
        };
        if let Some(part) = fpdu.pi(PI_91_MESSAGE).and_then(|p| p.as_bytes()) {
            if buffer.len() + part.len() > MAX_MESSAGE_SIZE {
                self.message = None;
                self.session.abort(D3_300);
                return Ok(());
            }
            buffer.extend_from_slice(part);
        }
        if last {
            let assembled = self.message.take().unwrap_or_default();
            log::info!(
                "session {}: segmented message from {}: {}",
                self.session.session_id(),
                self.session.ctx.partner_id,
                latin1_decode(&assembled)
            );
            let ack = Fpdu::new(
                FpduKind::AckMsg,
                self.session.ctx.local_conn_id,
                self.session.ctx.peer_conn_id,
            );
            self.session.send_fpdu(&ack)?;
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        if self.claimed {
            self.shared.slots.release(&self.session.ctx.partner_id);
            self.claimed = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partner_slots_enforce_cap() {
        let slots = PartnerSlots::new();
        assert!(slots.claim("P1", Some(2)));
        assert!(slots.claim("P1", Some(2)));
        assert!(!slots.claim("P1", Some(2)));
        slots.release("P1");
        assert!(slots.claim("P1", Some(2)));
        // unbounded partner
        for _ in 0..10 {
            assert!(slots.claim("P2", None));
        }
    }
}
