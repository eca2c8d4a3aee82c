// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Initiator side: connects to a partner and drives whole transfers
//!
//! One [`Client`] owns one session. `send_file`, `receive_file` and the
//! message operations run the complete exchange from CONNECT to RELEASE
//! and consume the client, mirroring the protocol's one-transfer flow.
//! Resume continues a failed or cancelled transfer from its last
//! acknowledged sync point; replay is simply a fresh `send_file`.

use super::codec;
use super::config::Direction;
use super::constant::*;
use super::error::{Error, D0_000, D3_300};
use super::fpdu::{parse_sync_points, ConnectBuilder, CreateBuilder, Fpdu, FpduKind, Param};
use super::journal::{JournalKey, MemoryJournal, Outcome, TransferJournal};
use super::observer::{NullObserver, TransferObserver};
use super::session::Session;
use super::state::Role;
use super::stream::{ByteSink, ByteSource};
use super::transfer::{
    self, next_transfer_id, receive_timeout, sync_interval_for, CancelToken, TransferContext,
    TransferReport,
};
use super::transport::Channel;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Emit a progress event at least every this many bytes.
const PROGRESS_INTERVAL: u64 = 1024 * 1024;

static CONN_ID: AtomicU16 = AtomicU16::new(1);

/// Checkpoint request advertised in the CONNECT.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyncPreference {
    /// Pick an interval from the file size.
    Auto,
    Disabled,
    Fixed { interval_kb: u16, window: u8 },
}

/// a set of options for one client session
#[derive(Debug, Clone)]
pub struct Options {
    pub partner_id: String,
    pub server_id: String,
    pub password: Option<String>,
    pub sync: SyncPreference,
    pub base_timeout: Duration,
    pub record_length: u16,
    pub priority: u8,
    /// Free-text rider attached to the CONNECT (PI 99).
    pub connect_message: Option<String>,
}

impl Options {
    pub fn new(partner_id: &str, server_id: &str) -> Options {
        Options {
            partner_id: partner_id.to_string(),
            server_id: server_id.to_string(),
            password: None,
            sync: SyncPreference::Auto,
            base_timeout: Duration::from_secs(30),
            record_length: DEFAULT_RECORD_LENGTH,
            priority: 0,
            connect_message: None,
        }
    }
}

pub struct Client {
    session: Session,
    options: Options,
    journal: Arc<dyn TransferJournal>,
    observer: Arc<dyn TransferObserver>,
}

impl Client {
    pub fn new(channel: Box<dyn Channel>, options: Options) -> Client {
        Client::with_collaborators(
            channel,
            options,
            Arc::new(MemoryJournal::new()),
            Arc::new(NullObserver),
        )
    }

    /// Wires in a shared journal (required for resume across clients) and
    /// an observer for progress events.
    pub fn with_collaborators(
        channel: Box<dyn Channel>,
        options: Options,
        journal: Arc<dyn TransferJournal>,
        observer: Arc<dyn TransferObserver>,
    ) -> Client {
        let conn_id = CONN_ID.fetch_add(1, Ordering::Relaxed);
        let mut session =
            Session::with_observer(channel, Role::Initiator, conn_id as u64, observer.clone());
        session.ctx.local_conn_id = conn_id;
        Client {
            session,
            options,
            journal,
            observer,
        }
    }

    /// Pushes a whole file to the partner.
    pub fn send_file(
        mut self,
        virtual_file: &str,
        source: &mut dyn ByteSource,
        cancel: &CancelToken,
    ) -> Result<TransferReport, Error> {
        let transfer_id = next_transfer_id();
        let key = JournalKey::new(&self.options.partner_id, virtual_file, transfer_id);
        match self.run_send(virtual_file, transfer_id, None, source, cancel) {
            Ok(report) => {
                self.journal.record_outcome(&key, Outcome::Completed);
                Ok(report)
            }
            Err(e) => Err(self.fail(&key, transfer_id, e)),
        }
    }

    /// Continues a failed or cancelled send from its last acknowledged
    /// sync point, under the same transfer id.
    pub fn resume_send(
        mut self,
        virtual_file: &str,
        transfer_id: u32,
        source: &mut dyn ByteSource,
        cancel: &CancelToken,
    ) -> Result<TransferReport, Error> {
        let key = JournalKey::new(&self.options.partner_id, virtual_file, transfer_id);
        let checkpoint = transfer::resume_checkpoint(
            self.journal.outcome(&key),
            self.journal.restart_point(&key),
        )?;
        match self.run_send(virtual_file, transfer_id, Some(checkpoint), source, cancel) {
            Ok(report) => {
                self.journal.record_outcome(&key, Outcome::Completed);
                Ok(report)
            }
            Err(e) => Err(self.fail(&key, transfer_id, e)),
        }
    }

    /// Fetches a whole file from the partner.
    pub fn receive_file(
        mut self,
        virtual_file: &str,
        sink: &mut dyn ByteSink,
        cancel: &CancelToken,
    ) -> Result<TransferReport, Error> {
        let transfer_id = next_transfer_id();
        let key = JournalKey::new(&self.options.partner_id, virtual_file, transfer_id);
        match self.run_receive(virtual_file, transfer_id, sink, cancel) {
            Ok(report) => {
                self.journal.record_outcome(&key, Outcome::Completed);
                Ok(report)
            }
            Err(e) => Err(self.fail(&key, transfer_id, e)),
        }
    }

    /// Delivers a message without moving a file. Short texts travel as one
    /// MSG, longer ones are segmented into MSGDM/MSGMM/MSGFM; the single
    /// ACK_MSG arrives after the last segment. A message can also ride a
    /// CONNECT via [`Options::connect_message`], or be shipped as a small
    /// file through `send_file` with an in-memory source.
    pub fn send_message(mut self, text: &str) -> Result<(), Error> {
        self.connect(None, SyncPreference::Disabled)?;
        let src = self.session.ctx.local_conn_id;
        let dst = self.session.ctx.peer_conn_id;

        if text.len() <= MAX_FREE_MESSAGE {
            let msg = Fpdu::new(FpduKind::Msg, src, dst)
                .with_param(Param::string(PI_91_MESSAGE, text)?);
            let ack = self.session.send_fpdu_with_ack(&msg)?;
            self.session.gate(ack.kind())?;
            if ack.kind() != FpduKind::AckMsg {
                self.session.abort(D3_300);
                return Err(Error::protocol(D3_300));
            }
        } else {
            let encoded = crate::fpdu::latin1_encode(text)?;
            let chunks: Vec<&[u8]> = encoded.chunks(MAX_FREE_MESSAGE).collect();
            for (i, chunk) in chunks.iter().enumerate() {
                let kind = if i == 0 {
                    FpduKind::Msgdm
                } else if i + 1 == chunks.len() {
                    FpduKind::Msgfm
                } else {
                    FpduKind::Msgmm
                };
                let fpdu = Fpdu::new(kind, src, dst)
                    .with_param(Param::pi(PI_91_MESSAGE, chunk.to_vec()));
                if kind == FpduKind::Msgfm {
                    let ack = self.session.send_fpdu_with_ack(&fpdu)?;
                    self.session.gate(ack.kind())?;
                    if ack.kind() != FpduKind::AckMsg {
                        self.session.abort(D3_300);
                        return Err(Error::protocol(D3_300));
                    }
                } else {
                    self.session.send_fpdu(&fpdu)?;
                }
            }
        }
        self.release()
    }

    fn fail(&mut self, key: &JournalKey, transfer_id: u32, e: Error) -> Error {
        let outcome = match e {
            Error::Cancelled => Outcome::Cancelled,
            _ => Outcome::Failed,
        };
        self.journal.record_outcome(key, outcome);
        self.observer
            .on_failed(transfer_id, e.diag(), &e.to_string());
        if !matches!(e, Error::Cancelled | Error::RemoteAbort { .. } | Error::Rejected { .. }) {
            // the socket may still be writable; tell the peer before leaving
            self.session.abort(e.diag());
        }
        let _ = self.session.close();
        e
    }

    /// CONNECT/ACONNECT preamble. `sync` carries the effective preference
    /// for this operation; the responder's answer is authoritative and a
    /// returned interval of zero disables checkpointing outright.
    fn connect(&mut self, file_size: Option<u64>, sync: SyncPreference) -> Result<(), Error> {
        let requested = match sync {
            SyncPreference::Auto => {
                let interval = sync_interval_for(file_size);
                if interval == 0 {
                    None
                } else {
                    Some((interval, DEFAULT_SYNC_WINDOW))
                }
            }
            SyncPreference::Disabled => None,
            SyncPreference::Fixed { interval_kb, window } => Some((interval_kb, window)),
        };

        let mut builder = ConnectBuilder::new(&self.options.partner_id, &self.options.server_id)
            .version(PROTOCOL_VERSION)
            .access_type(self.session.ctx.access_type);
        if let Some(password) = &self.options.password {
            builder = builder.password(password);
        }
        if let Some((interval_kb, window)) = requested {
            builder = builder.sync_points(interval_kb, window);
        }
        if let Some(text) = &self.options.connect_message {
            builder = builder.free_message(text);
        }
        let connect = builder.build(self.session.ctx.local_conn_id)?;

        self.session
            .set_receive_timeout(receive_timeout(self.options.base_timeout, file_size.unwrap_or(0)))?;
        let ack = self.session.send_fpdu_with_ack(&connect)?;
        self.session.gate(ack.kind())?;
        match ack.kind() {
            FpduKind::Aconnect => {}
            FpduKind::Rconnect => {
                return Err(Error::Rejected {
                    diag: ack.diag().unwrap_or(D3_300),
                });
            }
            other => {
                self.session.abort(D3_300);
                return Err(Error::Protocol {
                    diag: D3_300,
                    message: format!("expected ACONNECT, got {}", other),
                });
            }
        }

        self.session.ctx.peer_conn_id = ack.id_src();
        if let Some(version) = ack.num(PI_06_VERSION) {
            self.session.ctx.protocol_version = PROTOCOL_VERSION.min(version as u8);
        }
        let negotiated = ack.pi(PI_07_SYNC_POINTS).and_then(parse_sync_points);
        match negotiated {
            Some((interval_kb, window)) if interval_kb > 0 && requested.is_some() => {
                self.session.ctx.sync_interval_kb = interval_kb;
                self.session.ctx.sync_window = window;
            }
            _ => {
                self.session.ctx.sync_interval_kb = 0;
            }
        }
        log::info!(
            "session {}: connected to {} as {}, sync interval {} KiB",
            self.session.session_id(),
            self.session.peer_label(),
            self.options.partner_id,
            self.session.ctx.sync_interval_kb
        );
        Ok(())
    }

    fn run_send(
        &mut self,
        virtual_file: &str,
        transfer_id: u32,
        resume: Option<crate::journal::Checkpoint>,
        source: &mut dyn ByteSource,
        cancel: &CancelToken,
    ) -> Result<TransferReport, Error> {
        let file_size = source.size_hint();
        self.session.ctx.access_type = ACCESS_WRITE;
        self.connect(file_size, self.options.sync)?;
        if resume.is_some() && !self.session.ctx.sync_enabled() {
            log::warn!(
                "session {}: peer disabled sync points on a resumed transfer",
                self.session.session_id()
            );
        }

        let src = self.session.ctx.local_conn_id;
        let dst = self.session.ctx.peer_conn_id;

        // file selection
        let mut create = CreateBuilder::new(virtual_file, transfer_id)
            .record_length(self.options.record_length)
            .priority(self.options.priority);
        if let Some(size) = file_size {
            create = create.reservation(size);
        }
        let ack = self.session.send_fpdu_with_ack(&create.build(src, dst)?)?;
        self.session.gate(ack.kind())?;
        expect(&ack, FpduKind::AckCreate)?;
        let chunk_size = match ack.num(PI_25_MAX_ENTITY_SIZE) {
            Some(peer_max) => {
                let peer_article = peer_max.saturating_sub(FPDU_HEADER_SIZE as u64);
                (self.options.record_length as u64).min(peer_article) as usize
            }
            None => self.options.record_length as usize,
        };
        if chunk_size == 0 {
            self.session.abort(D3_300);
            return Err(Error::protocol(D3_300));
        }
        self.session.ctx.article_size = chunk_size as u16;
        self.session.ctx.max_entity_size = (chunk_size + FPDU_HEADER_SIZE) as u16;

        let ack = self
            .session
            .send_fpdu_with_ack(&Fpdu::new(FpduKind::Open, src, dst))?;
        self.session.gate(ack.kind())?;
        expect(&ack, FpduKind::AckOpen)?;
        // v2 core never offers compression, an accepting peer is ignored

        let mut write = Fpdu::new(FpduKind::Write, src, dst);
        if let Some(cp) = resume {
            write = write.with_param(Param::num(PI_18_RESTART_POINT, cp.bytes, 4));
        }
        let ack = self.session.send_fpdu_with_ack(&write)?;
        self.session.gate(ack.kind())?;
        expect(&ack, FpduKind::AckWrite)?;
        let restart = match ack.num(PI_18_RESTART_POINT) {
            Some(offset) => offset,
            None => resume.map(|cp| cp.bytes).unwrap_or(0),
        };

        let mut ctx = TransferContext::new(Direction::Send, virtual_file, transfer_id);
        ctx.file_size = file_size;
        ctx.cancel = cancel.clone();
        if restart > 0 {
            source.skip(restart)?;
            ctx.restart_point = restart;
            ctx.bytes_transferred = restart;
            ctx.bytes_at_last_sync = restart;
        }
        if let Some(cp) = resume {
            ctx.sync_point = cp.sync_point;
        }

        let key = JournalKey::new(&self.options.partner_id, virtual_file, transfer_id);
        let interval_bytes = self.session.ctx.sync_interval_kb as u64 * 1024;
        let mut since_sync = 0u64;
        let mut since_progress = 0u64;
        let mut buf = vec![0u8; chunk_size];

        loop {
            if ctx.cancel.is_cancelled() {
                self.session.abort(D3_300);
                self.session.ctx.transfer = Some(ctx);
                return Err(Error::Cancelled);
            }
            let n = source.read(&mut buf)?;
            if n == 0 {
                break;
            }
            self.session.send_fpdu_with_data(
                Fpdu::new(FpduKind::Dtf, src, dst),
                buf[..n].to_vec(),
            )?;
            ctx.account(&buf[..n]);
            since_sync += n as u64;
            since_progress += n as u64;

            if interval_bytes > 0 && since_sync >= interval_bytes {
                ctx.sync_point += 1;
                let syn = Fpdu::new(FpduKind::Syn, src, dst)
                    .with_param(Param::num(PI_20_SYNC_NUM, ctx.sync_point as u64, 3));
                let ack = self.session.send_fpdu_with_ack(&syn)?;
                self.session.gate(ack.kind())?;
                expect(&ack, FpduKind::AckSyn)?;
                if ack.num(PI_20_SYNC_NUM) != Some(ctx.sync_point as u64) {
                    self.session.abort(D3_300);
                    return Err(Error::protocol(D3_300));
                }
                ctx.bytes_at_last_sync = ctx.bytes_transferred;
                self.journal
                    .record_sync(&key, ctx.sync_point, ctx.bytes_transferred);
                self.observer.on_bytes(
                    transfer_id,
                    ctx.bytes_transferred,
                    ctx.file_size,
                    ctx.sync_point,
                );
                since_sync = 0;
                since_progress = 0;
            } else if since_progress >= PROGRESS_INTERVAL {
                self.observer.on_bytes(
                    transfer_id,
                    ctx.bytes_transferred,
                    ctx.file_size,
                    ctx.sync_point,
                );
                since_progress = 0;
            }
        }

        self.session
            .send_fpdu(&Fpdu::new(FpduKind::DtfEnd, src, dst))?;
        let ack = self
            .session
            .send_fpdu_with_ack(&Fpdu::new(FpduKind::TransEnd, src, dst))?;
        self.session.gate(ack.kind())?;
        expect(&ack, FpduKind::AckTransEnd)?;

        self.teardown(src, dst)?;

        self.observer
            .on_complete(transfer_id, ctx.bytes_transferred, ctx.elapsed_millis());
        log::info!(
            "transfer {}: sent {} bytes of {} in {} articles",
            transfer_id,
            ctx.bytes_transferred,
            virtual_file,
            ctx.records_transferred
        );
        Ok(TransferReport {
            transfer_id,
            bytes_transferred: ctx.bytes_transferred,
            records_transferred: ctx.records_transferred,
            sync_points: ctx.sync_point,
            duration_millis: ctx.elapsed_millis(),
        })
    }

    fn run_receive(
        &mut self,
        virtual_file: &str,
        transfer_id: u32,
        sink: &mut dyn ByteSink,
        cancel: &CancelToken,
    ) -> Result<TransferReport, Error> {
        self.session.ctx.access_type = ACCESS_READ;
        self.connect(None, self.options.sync)?;

        let src = self.session.ctx.local_conn_id;
        let dst = self.session.ctx.peer_conn_id;

        let select = Fpdu::new(FpduKind::Select, src, dst)
            .with_param(Param::group(
                PGI_09_FILE_ID,
                vec![
                    Param::byte(PI_11_FILE_TYPE, FILE_TYPE_BINARY),
                    Param::string(PI_12_FILE_NAME, virtual_file)?,
                ],
            ))
            .with_param(Param::num(PI_13_TRANSFER_ID, transfer_id as u64, 3))
            .with_param(Param::byte(PI_14_REQUESTED_ATTRIBUTES, 0))
            .with_param(Param::byte(PI_17_PRIORITY, self.options.priority))
            .with_param(Param::num(
                PI_25_MAX_ENTITY_SIZE,
                self.options.record_length as u64 + FPDU_HEADER_SIZE as u64,
                2,
            ));
        let ack = self.session.send_fpdu_with_ack(&select)?;
        self.session.gate(ack.kind())?;
        expect(&ack, FpduKind::AckSelect)?;
        let file_size = ack.num(PI_42_MAX_RESERVATION).map(|kb| kb * 1024);
        let article = ack
            .num(PI_25_MAX_ENTITY_SIZE)
            .map(|m| m.saturating_sub(FPDU_HEADER_SIZE as u64) as u16)
            .unwrap_or(self.options.record_length);
        self.session.ctx.article_size = article;
        self.session
            .set_receive_timeout(receive_timeout(self.options.base_timeout, file_size.unwrap_or(0)))?;

        let ack = self
            .session
            .send_fpdu_with_ack(&Fpdu::new(FpduKind::Open, src, dst))?;
        self.session.gate(ack.kind())?;
        expect(&ack, FpduKind::AckOpen)?;

        let read = Fpdu::new(FpduKind::Read, src, dst)
            .with_param(Param::num(PI_18_RESTART_POINT, 0, 4));
        let ack = self.session.send_fpdu_with_ack(&read)?;
        self.session.gate(ack.kind())?;
        expect(&ack, FpduKind::AckRead)?;

        let mut ctx = TransferContext::new(Direction::Receive, virtual_file, transfer_id);
        ctx.file_size = file_size;
        ctx.cancel = cancel.clone();
        let key = JournalKey::new(&self.options.partner_id, virtual_file, transfer_id);
        let mut since_progress = 0u64;
        let mut last_sync = 0u64;

        loop {
            if ctx.cancel.is_cancelled() {
                self.session.abort(D3_300);
                return Err(Error::Cancelled);
            }
            let body = self.session.receive_raw_fpdu()?;
            let kind = codec::body_kind(&body)?;
            self.session.gate(kind)?;
            if kind.is_data() {
                let payload = &body[FPDU_HEADER_SIZE..];
                if article > 0 && payload.len() > article as usize {
                    self.session.abort(D3_300);
                    return Err(Error::protocol(D3_300));
                }
                sink.write(payload)?;
                ctx.account(payload);
                since_progress += payload.len() as u64;
                if since_progress >= PROGRESS_INTERVAL {
                    self.observer.on_bytes(
                        transfer_id,
                        ctx.bytes_transferred,
                        ctx.file_size,
                        ctx.sync_point,
                    );
                    since_progress = 0;
                }
                continue;
            }
            match kind {
                FpduKind::Syn => {
                    let syn = codec::decode_body(&body, false)?;
                    let number = syn.num(PI_20_SYNC_NUM).unwrap_or(0);
                    if number != last_sync + 1 {
                        self.session.abort(D3_300);
                        return Err(Error::protocol(D3_300));
                    }
                    last_sync = number;
                    ctx.sync_point = number as u32;
                    ctx.bytes_at_last_sync = ctx.bytes_transferred;
                    self.session.send_fpdu(
                        &Fpdu::new(FpduKind::AckSyn, src, dst)
                            .with_param(Param::num(PI_20_SYNC_NUM, number, 3)),
                    )?;
                    self.journal
                        .record_sync(&key, ctx.sync_point, ctx.bytes_transferred);
                    self.observer.on_bytes(
                        transfer_id,
                        ctx.bytes_transferred,
                        ctx.file_size,
                        ctx.sync_point,
                    );
                }
                FpduKind::DtfEnd => break,
                FpduKind::Abort => {
                    let abort = codec::decode_body(&body, false)?;
                    return Err(Error::RemoteAbort {
                        diag: abort.diag().unwrap_or(D3_300),
                    });
                }
                other => {
                    // gate admitted it but the receive loop has no use for it
                    self.session.abort(D3_300);
                    return Err(Error::Protocol {
                        diag: D3_300,
                        message: format!("unexpected {} in data phase", other),
                    });
                }
            }
        }

        sink.close()?;
        let ack = self
            .session
            .send_fpdu_with_ack(&Fpdu::new(FpduKind::TransEnd, src, dst))?;
        self.session.gate(ack.kind())?;
        expect(&ack, FpduKind::AckTransEnd)?;

        self.teardown(src, dst)?;

        self.observer
            .on_complete(transfer_id, ctx.bytes_transferred, ctx.elapsed_millis());
        log::info!(
            "transfer {}: received {} bytes of {}",
            transfer_id,
            ctx.bytes_transferred,
            virtual_file
        );
        Ok(TransferReport {
            transfer_id,
            bytes_transferred: ctx.bytes_transferred,
            records_transferred: ctx.records_transferred,
            sync_points: ctx.sync_point,
            duration_millis: ctx.elapsed_millis(),
        })
    }

    /// CLOSE, DESELECT, RELEASE, socket close.
    fn teardown(&mut self, src: u16, dst: u16) -> Result<(), Error> {
        let close = Fpdu::new(FpduKind::Close, src, dst).with_param(Param::diag(D0_000));
        let ack = self.session.send_fpdu_with_ack(&close)?;
        self.session.gate(ack.kind())?;
        expect(&ack, FpduKind::AckClose)?;

        let ack = self
            .session
            .send_fpdu_with_ack(&Fpdu::new(FpduKind::Deselect, src, dst))?;
        self.session.gate(ack.kind())?;
        expect(&ack, FpduKind::AckDeselect)?;

        self.release()
    }

    fn release(&mut self) -> Result<(), Error> {
        let src = self.session.ctx.local_conn_id;
        let dst = self.session.ctx.peer_conn_id;
        let ack = self
            .session
            .send_fpdu_with_ack(&Fpdu::new(FpduKind::Release, src, dst))?;
        self.session.gate(ack.kind())?;
        expect(&ack, FpduKind::Relconf)?;
        self.session.close()
    }
}

fn expect(fpdu: &Fpdu, kind: FpduKind) -> Result<(), Error> {
    if fpdu.kind() == kind {
        Ok(())
    } else {
        Err(Error::Protocol {
            diag: D3_300,
            message: format!("expected {}, got {}", kind, fpdu.kind()),
        })
    }
}
