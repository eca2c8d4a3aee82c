// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Typed FPDU model: kinds, parameters and ordered builders

use super::constant::*;
use super::error::{Diag, Error};
use byteorder::{BigEndian, ByteOrder};
use chrono::Utc;
use std::fmt;

/// Closed set of FPDU kinds, keyed on the wire by the (phase, type) byte pair.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FpduKind {
    // session
    Connect,
    Aconnect,
    Rconnect,
    Release,
    Relconf,
    Abort,
    // file scope
    Create,
    AckCreate,
    Select,
    AckSelect,
    Deselect,
    AckDeselect,
    Open,
    AckOpen,
    Close,
    AckClose,
    // transfer control
    Read,
    AckRead,
    Write,
    AckWrite,
    TransEnd,
    AckTransEnd,
    // data
    Dtf,
    Dtfda,
    Dtfma,
    Dtffa,
    DtfEnd,
    // checkpoints
    Syn,
    AckSyn,
    Resyn,
    Idt,
    AckIdt,
    // messaging
    Msg,
    Msgdm,
    Msgmm,
    Msgfm,
    AckMsg,
}

impl FpduKind {
    /// All kinds, for exhaustive table tests.
    pub const ALL: [FpduKind; 37] = [
        FpduKind::Connect,
        FpduKind::Aconnect,
        FpduKind::Rconnect,
        FpduKind::Release,
        FpduKind::Relconf,
        FpduKind::Abort,
        FpduKind::Create,
        FpduKind::AckCreate,
        FpduKind::Select,
        FpduKind::AckSelect,
        FpduKind::Deselect,
        FpduKind::AckDeselect,
        FpduKind::Open,
        FpduKind::AckOpen,
        FpduKind::Close,
        FpduKind::AckClose,
        FpduKind::Read,
        FpduKind::AckRead,
        FpduKind::Write,
        FpduKind::AckWrite,
        FpduKind::TransEnd,
        FpduKind::AckTransEnd,
        FpduKind::Dtf,
        FpduKind::Dtfda,
        FpduKind::Dtfma,
        FpduKind::Dtffa,
        FpduKind::DtfEnd,
        FpduKind::Syn,
        FpduKind::AckSyn,
        FpduKind::Resyn,
        FpduKind::Idt,
        FpduKind::AckIdt,
        FpduKind::Msg,
        FpduKind::Msgdm,
        FpduKind::Msgmm,
        FpduKind::Msgfm,
        FpduKind::AckMsg,
    ];

    pub(crate) fn code(self) -> (u8, u8) {
        match self {
            FpduKind::Connect => (PHASE_SESSION, TYPE_CONNECT),
            FpduKind::Aconnect => (PHASE_SESSION, TYPE_ACONNECT),
            FpduKind::Rconnect => (PHASE_SESSION, TYPE_RCONNECT),
            FpduKind::Release => (PHASE_SESSION, TYPE_RELEASE),
            FpduKind::Relconf => (PHASE_SESSION, TYPE_RELCONF),
            FpduKind::Abort => (PHASE_SESSION, TYPE_ABORT),
            FpduKind::Create => (PHASE_FILE, TYPE_CREATE),
            FpduKind::AckCreate => (PHASE_FILE, TYPE_ACK_CREATE),
            FpduKind::Select => (PHASE_FILE, TYPE_SELECT),
            FpduKind::AckSelect => (PHASE_FILE, TYPE_ACK_SELECT),
            FpduKind::Deselect => (PHASE_FILE, TYPE_DESELECT),
            FpduKind::AckDeselect => (PHASE_FILE, TYPE_ACK_DESELECT),
            FpduKind::Open => (PHASE_FILE, TYPE_OPEN),
            FpduKind::AckOpen => (PHASE_FILE, TYPE_ACK_OPEN),
            FpduKind::Close => (PHASE_FILE, TYPE_CLOSE),
            FpduKind::AckClose => (PHASE_FILE, TYPE_ACK_CLOSE),
            FpduKind::Read => (PHASE_TRANSFER, TYPE_READ),
            FpduKind::AckRead => (PHASE_TRANSFER, TYPE_ACK_READ),
            FpduKind::Write => (PHASE_TRANSFER, TYPE_WRITE),
            FpduKind::AckWrite => (PHASE_TRANSFER, TYPE_ACK_WRITE),
            FpduKind::TransEnd => (PHASE_TRANSFER, TYPE_TRANS_END),
            FpduKind::AckTransEnd => (PHASE_TRANSFER, TYPE_ACK_TRANS_END),
            FpduKind::Dtf => (PHASE_DATA, TYPE_DTF),
            FpduKind::Dtfda => (PHASE_DATA, TYPE_DTFDA),
            FpduKind::Dtfma => (PHASE_DATA, TYPE_DTFMA),
            FpduKind::Dtffa => (PHASE_DATA, TYPE_DTFFA),
            FpduKind::DtfEnd => (PHASE_DATA, TYPE_DTF_END),
            FpduKind::Syn => (PHASE_CHECKPOINT, TYPE_SYN),
            FpduKind::AckSyn => (PHASE_CHECKPOINT, TYPE_ACK_SYN),
            FpduKind::Resyn => (PHASE_CHECKPOINT, TYPE_RESYN),
            FpduKind::Idt => (PHASE_CHECKPOINT, TYPE_IDT),
            FpduKind::AckIdt => (PHASE_CHECKPOINT, TYPE_ACK_IDT),
            FpduKind::Msg => (PHASE_MESSAGE, TYPE_MSG),
            FpduKind::Msgdm => (PHASE_MESSAGE, TYPE_MSGDM),
            FpduKind::Msgmm => (PHASE_MESSAGE, TYPE_MSGMM),
            FpduKind::Msgfm => (PHASE_MESSAGE, TYPE_MSGFM),
            FpduKind::AckMsg => (PHASE_MESSAGE, TYPE_ACK_MSG),
        }
    }

    pub(crate) fn from_code(phase: u8, fpdu_type: u8) -> Option<FpduKind> {
        FpduKind::ALL
            .iter()
            .copied()
            .find(|k| k.code() == (phase, fpdu_type))
    }

    /// DTF family FPDUs carry a raw payload instead of a parameter area.
    /// The four variants are accounted identically.
    pub fn is_data(self) -> bool {
        matches!(
            self,
            FpduKind::Dtf | FpduKind::Dtfda | FpduKind::Dtfma | FpduKind::Dtffa
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            FpduKind::Connect => "CONNECT",
            FpduKind::Aconnect => "ACONNECT",
            FpduKind::Rconnect => "RCONNECT",
            FpduKind::Release => "RELEASE",
            FpduKind::Relconf => "RELCONF",
            FpduKind::Abort => "ABORT",
            FpduKind::Create => "CREATE",
            FpduKind::AckCreate => "ACK_CREATE",
            FpduKind::Select => "SELECT",
            FpduKind::AckSelect => "ACK_SELECT",
            FpduKind::Deselect => "DESELECT",
            FpduKind::AckDeselect => "ACK_DESELECT",
            FpduKind::Open => "OPEN",
            FpduKind::AckOpen => "ACK_OPEN",
            FpduKind::Close => "CLOSE",
            FpduKind::AckClose => "ACK_CLOSE",
            FpduKind::Read => "READ",
            FpduKind::AckRead => "ACK_READ",
            FpduKind::Write => "WRITE",
            FpduKind::AckWrite => "ACK_WRITE",
            FpduKind::TransEnd => "TRANS_END",
            FpduKind::AckTransEnd => "ACK_TRANS_END",
            FpduKind::Dtf => "DTF",
            FpduKind::Dtfda => "DTFDA",
            FpduKind::Dtfma => "DTFMA",
            FpduKind::Dtffa => "DTFFA",
            FpduKind::DtfEnd => "DTF_END",
            FpduKind::Syn => "SYN",
            FpduKind::AckSyn => "ACK_SYN",
            FpduKind::Resyn => "RESYN",
            FpduKind::Idt => "IDT",
            FpduKind::AckIdt => "ACK_IDT",
            FpduKind::Msg => "MSG",
            FpduKind::Msgdm => "MSGDM",
            FpduKind::Msgmm => "MSGMM",
            FpduKind::Msgfm => "MSGFM",
            FpduKind::AckMsg => "ACK_MSG",
        }
    }
}

impl fmt::Display for FpduKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One TLV entry: either an atomic PI or a PGI group nesting further PIs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    Pi { id: u8, value: Vec<u8> },
    Group { id: u8, params: Vec<Param> },
}

impl Param {
    pub fn pi(id: u8, value: Vec<u8>) -> Param {
        Param::Pi { id, value }
    }

    /// Numeric PI, big endian, `width` bytes (1 to 4).
    pub fn num(id: u8, value: u64, width: usize) -> Param {
        let mut buf = [0u8; 8];
        BigEndian::write_u64(&mut buf, value);
        Param::Pi {
            id,
            value: buf[8 - width..].to_vec(),
        }
    }

    pub fn byte(id: u8, value: u8) -> Param {
        Param::Pi {
            id,
            value: vec![value],
        }
    }

    /// String PI, ISO-8859-1.
    pub fn string(id: u8, value: &str) -> Result<Param, Error> {
        Ok(Param::Pi {
            id,
            value: latin1_encode(value)?,
        })
    }

    pub fn group(id: u8, params: Vec<Param>) -> Param {
        Param::Group { id, params }
    }

    /// PI 2 diagnostic in its three-byte wire form.
    pub fn diag(diag: Diag) -> Param {
        Param::Pi {
            id: PI_02_DIAG,
            value: diag.to_bytes().to_vec(),
        }
    }

    pub fn id(&self) -> u8 {
        match self {
            Param::Pi { id, .. } => *id,
            Param::Group { id, .. } => *id,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Param::Pi { value, .. } => Some(value),
            Param::Group { .. } => None,
        }
    }

    /// Big-endian numeric reading of an atomic value, any width up to 8.
    pub fn as_num(&self) -> Option<u64> {
        let value = self.as_bytes()?;
        if value.is_empty() || value.len() > 8 {
            return None;
        }
        Some(BigEndian::read_uint(value, value.len()))
    }

    pub fn as_string(&self) -> Option<String> {
        self.as_bytes().map(latin1_decode)
    }

    /// Finds a nested PI inside a group.
    pub fn find(&self, id: u8) -> Option<&Param> {
        match self {
            Param::Group { params, .. } => params.iter().find(|p| p.id() == id),
            Param::Pi { .. } => None,
        }
    }
}

/// Encodes to ISO-8859-1, refusing characters outside U+0000..U+00FF.
pub(crate) fn latin1_encode(s: &str) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(s.len());
    for c in s.chars() {
        let n = c as u32;
        if n > 0xFF {
            return Err(Error::BadString(c));
        }
        out.push(n as u8);
    }
    Ok(out)
}

/// ISO-8859-1 bytes map one to one onto U+0000..U+00FF.
pub(crate) fn latin1_decode(b: &[u8]) -> String {
    b.iter().map(|&x| x as char).collect()
}

/// One protocol data unit. Immutable after build; the data payload is only
/// legal on the DTF family and is bounded by the negotiated article size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fpdu {
    kind: FpduKind,
    id_src: u16,
    id_dst: u16,
    params: Vec<Param>,
    data: Option<Vec<u8>>,
}

impl Fpdu {
    pub fn new(kind: FpduKind, id_src: u16, id_dst: u16) -> Fpdu {
        Fpdu {
            kind,
            id_src,
            id_dst,
            params: Vec::new(),
            data: None,
        }
    }

    pub fn with_param(mut self, param: Param) -> Fpdu {
        self.params.push(param);
        self
    }

    pub fn with_params(mut self, params: Vec<Param>) -> Fpdu {
        self.params.extend(params);
        self
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Fpdu {
        self.data = Some(data);
        self
    }

    pub(crate) fn from_parts(
        kind: FpduKind,
        id_src: u16,
        id_dst: u16,
        params: Vec<Param>,
        data: Option<Vec<u8>>,
    ) -> Fpdu {
        Fpdu {
            kind,
            id_src,
            id_dst,
            params,
            data,
        }
    }

    pub fn kind(&self) -> FpduKind {
        self.kind
    }

    pub fn id_src(&self) -> u16 {
        self.id_src
    }

    pub fn id_dst(&self) -> u16 {
        self.id_dst
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    /// Top-level parameter by id.
    pub fn param(&self, id: u8) -> Option<&Param> {
        self.params.iter().find(|p| p.id() == id)
    }

    /// Atomic PI by id, looked up at the top level and inside every group.
    pub fn pi(&self, id: u8) -> Option<&Param> {
        for p in &self.params {
            match p {
                Param::Pi { .. } if p.id() == id => return Some(p),
                Param::Group { .. } => {
                    if let Some(inner) = p.find(id) {
                        return Some(inner);
                    }
                }
                _ => {}
            }
        }
        None
    }

    pub fn num(&self, id: u8) -> Option<u64> {
        self.pi(id).and_then(Param::as_num)
    }

    pub fn string(&self, id: u8) -> Option<String> {
        self.pi(id).and_then(|p| p.as_string())
    }

    /// Diagnostic from PI 2, when present.
    pub fn diag(&self) -> Option<Diag> {
        self.pi(PI_02_DIAG)
            .and_then(|p| p.as_bytes())
            .and_then(Diag::from_bytes)
    }
}

impl fmt::Display for Fpdu {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}[{}->{}]", self.kind, self.id_src, self.id_dst)
    }
}

/// Builds a CONNECT with its parameters in the mandated order:
/// PI 3, PI 4, optional PI 5, PI 6, optional PI 7, PI 22, message PIs.
/// Emission order is fixed by `build`; callers cannot reorder it.
pub struct ConnectBuilder {
    demandeur: String,
    serveur: String,
    password: Option<String>,
    version: u8,
    sync: Option<(u16, u8)>,
    access: u8,
    message: Option<String>,
    free_message: Option<String>,
}

impl ConnectBuilder {
    pub fn new(demandeur: &str, serveur: &str) -> ConnectBuilder {
        ConnectBuilder {
            demandeur: demandeur.to_string(),
            serveur: serveur.to_string(),
            password: None,
            version: PROTOCOL_VERSION,
            sync: None,
            access: ACCESS_WRITE,
            message: None,
            free_message: None,
        }
    }

    pub fn password(mut self, password: &str) -> ConnectBuilder {
        self.password = Some(password.to_string());
        self
    }

    pub fn version(mut self, version: u8) -> ConnectBuilder {
        self.version = version;
        self
    }

    /// Advertise checkpointing: interval in KiB plus acknowledgement window.
    pub fn sync_points(mut self, interval_kb: u16, window: u8) -> ConnectBuilder {
        self.sync = Some((interval_kb, window));
        self
    }

    /// PI 22: `ACCESS_WRITE` (0) to send, `ACCESS_READ` (1) to fetch.
    pub fn access_type(mut self, access: u8) -> ConnectBuilder {
        self.access = access;
        self
    }

    /// Structured message rider (PI 91).
    pub fn message(mut self, text: &str) -> ConnectBuilder {
        self.message = Some(text.to_string());
        self
    }

    /// Free-text rider (PI 99), capped at 254 characters.
    pub fn free_message(mut self, text: &str) -> ConnectBuilder {
        self.free_message = Some(text.to_string());
        self
    }

    pub fn build(self, id_src: u16) -> Result<Fpdu, Error> {
        if let Some(free) = &self.free_message {
            if free.len() > MAX_FREE_MESSAGE {
                return Err(Error::ParameterTooLong {
                    id: PI_99_FREE_MESSAGE,
                    len: free.len(),
                });
            }
        }
        let mut params = vec![
            Param::string(PI_03_DEMANDEUR, &self.demandeur)?,
            Param::string(PI_04_SERVEUR, &self.serveur)?,
        ];
        if let Some(password) = &self.password {
            params.push(Param::string(PI_05_ACCESS_CONTROL, password)?);
        }
        params.push(Param::byte(PI_06_VERSION, self.version));
        if let Some((interval_kb, window)) = self.sync {
            params.push(sync_points_param(interval_kb, window));
        }
        params.push(Param::byte(PI_22_ACCESS_TYPE, self.access));
        if let Some(message) = &self.message {
            params.push(Param::string(PI_91_MESSAGE, message)?);
        }
        if let Some(free) = &self.free_message {
            params.push(Param::string(PI_99_FREE_MESSAGE, free)?);
        }
        Ok(Fpdu::from_parts(FpduKind::Connect, id_src, 0, params, None))
    }
}

/// PI 7 value: interval KiB high, interval KiB low, acknowledgement window.
pub(crate) fn sync_points_param(interval_kb: u16, window: u8) -> Param {
    Param::pi(
        PI_07_SYNC_POINTS,
        vec![(interval_kb >> 8) as u8, (interval_kb & 0xFF) as u8, window],
    )
}

/// Splits a PI 7 value back into (interval KiB, window).
pub(crate) fn parse_sync_points(param: &Param) -> Option<(u16, u8)> {
    let v = param.as_bytes()?;
    if v.len() != 3 {
        return None;
    }
    Some((((v[0] as u16) << 8) | v[1] as u16, v[2]))
}

/// Builds a CREATE: PGI 9 (PI 11, PI 12), PI 13, PI 17, PI 25,
/// PGI 30 (PI 32), PGI 40 (PI 42), PGI 50 (PI 51), in that order.
pub struct CreateBuilder {
    file_name: String,
    file_type: u8,
    transfer_id: u32,
    priority: u8,
    record_length: u16,
    reservation_kb: Option<u64>,
    creation_date: Option<String>,
}

impl CreateBuilder {
    pub fn new(file_name: &str, transfer_id: u32) -> CreateBuilder {
        CreateBuilder {
            file_name: file_name.to_string(),
            file_type: FILE_TYPE_BINARY,
            transfer_id,
            priority: 0,
            record_length: DEFAULT_RECORD_LENGTH,
            reservation_kb: None,
            creation_date: None,
        }
    }

    pub fn file_type(mut self, file_type: u8) -> CreateBuilder {
        self.file_type = file_type;
        self
    }

    pub fn priority(mut self, priority: u8) -> CreateBuilder {
        self.priority = priority;
        self
    }

    /// Article size; PI 25 is derived from it as `record_length + 6`.
    pub fn record_length(mut self, record_length: u16) -> CreateBuilder {
        self.record_length = record_length;
        self
    }

    /// Expected file size, advertised in PGI 40 as KiB rounded up.
    pub fn reservation(mut self, file_size: u64) -> CreateBuilder {
        self.reservation_kb = Some((file_size + 1023) / 1024);
        self
    }

    pub fn creation_date(mut self, date: &str) -> CreateBuilder {
        self.creation_date = Some(date.to_string());
        self
    }

    pub fn build(self, id_src: u16, id_dst: u16) -> Result<Fpdu, Error> {
        let date = match self.creation_date {
            Some(date) => date,
            None => Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        };
        let max_entity = self.record_length as u64 + FPDU_HEADER_SIZE as u64;
        let mut params = vec![
            Param::group(
                PGI_09_FILE_ID,
                vec![
                    Param::byte(PI_11_FILE_TYPE, self.file_type),
                    Param::string(PI_12_FILE_NAME, &self.file_name)?,
                ],
            ),
            Param::num(PI_13_TRANSFER_ID, self.transfer_id as u64, 3),
            Param::byte(PI_17_PRIORITY, self.priority),
            Param::num(PI_25_MAX_ENTITY_SIZE, max_entity, 2),
            Param::group(
                PGI_30_LOGICAL_ATTRIBUTES,
                vec![Param::num(PI_32_RECORD_LENGTH, self.record_length as u64, 2)],
            ),
        ];
        if let Some(kb) = self.reservation_kb {
            params.push(Param::group(
                PGI_40_PHYSICAL_ATTRIBUTES,
                vec![Param::num(PI_42_MAX_RESERVATION, kb, 4)],
            ));
        }
        params.push(Param::group(
            PGI_50_HISTORICAL,
            vec![Param::string(PI_51_CREATION_DATE, &date)?],
        ));
        Ok(Fpdu::from_parts(FpduKind::Create, id_src, id_dst, params, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_codes_are_unique() {
        for a in FpduKind::ALL.iter() {
            for b in FpduKind::ALL.iter() {
                if a != b {
                    assert_ne!(a.code(), b.code(), "{} vs {}", a, b);
                }
            }
        }
    }

    #[test]
    fn kind_code_round_trip() {
        for k in FpduKind::ALL.iter() {
            let (phase, t) = k.code();
            assert_eq!(FpduKind::from_code(phase, t), Some(*k));
        }
    }

    #[test]
    fn dtf_end_code_is_fixed() {
        assert_eq!(FpduKind::DtfEnd.code(), (0xC0, 0x22));
        assert!(!FpduKind::DtfEnd.is_data());
        assert!(FpduKind::Dtf.is_data());
    }

    #[test]
    fn numeric_param_widths() {
        let p = Param::num(PI_13_TRANSFER_ID, 0xABCDEF, 3);
        assert_eq!(p.as_bytes().unwrap(), &[0xAB, 0xCD, 0xEF]);
        assert_eq!(p.as_num(), Some(0xABCDEF));

        let p = Param::num(PI_18_RESTART_POINT, 7_340_032, 4);
        assert_eq!(p.as_num(), Some(7_340_032));
    }

    #[test]
    fn latin1_round_trip() {
        let s = "PARTNER-1 àé";
        let bytes = latin1_encode(s).unwrap();
        assert_eq!(latin1_decode(&bytes), s);
        assert!(matches!(
            latin1_encode("日本"),
            Err(Error::BadString(_))
        ));
    }

    #[test]
    fn connect_builder_orders_parameters() {
        let fpdu = ConnectBuilder::new("P1", "SRV")
            .password("x")
            .sync_points(256, 4)
            .access_type(ACCESS_READ)
            .free_message("hello")
            .build(7)
            .unwrap();
        let ids: Vec<u8> = fpdu.params().iter().map(|p| p.id()).collect();
        assert_eq!(
            ids,
            vec![
                PI_03_DEMANDEUR,
                PI_04_SERVEUR,
                PI_05_ACCESS_CONTROL,
                PI_06_VERSION,
                PI_07_SYNC_POINTS,
                PI_22_ACCESS_TYPE,
                PI_99_FREE_MESSAGE,
            ]
        );
        assert_eq!(fpdu.num(PI_06_VERSION), Some(2));
        assert_eq!(
            parse_sync_points(fpdu.pi(PI_07_SYNC_POINTS).unwrap()),
            Some((256, 4))
        );
    }

    #[test]
    fn connect_builder_skips_optional_parameters() {
        let fpdu = ConnectBuilder::new("P1", "").build(1).unwrap();
        let ids: Vec<u8> = fpdu.params().iter().map(|p| p.id()).collect();
        assert_eq!(
            ids,
            vec![PI_03_DEMANDEUR, PI_04_SERVEUR, PI_06_VERSION, PI_22_ACCESS_TYPE]
        );
    }

    #[test]
    fn create_builder_groups() {
        let fpdu = CreateBuilder::new("VF1", 42)
            .record_length(1024)
            .reservation(3000)
            .creation_date("2024-01-01T00:00:00Z")
            .build(1, 2)
            .unwrap();
        assert_eq!(fpdu.string(PI_12_FILE_NAME).unwrap(), "VF1");
        assert_eq!(fpdu.num(PI_13_TRANSFER_ID), Some(42));
        assert_eq!(fpdu.num(PI_25_MAX_ENTITY_SIZE), Some(1030));
        assert_eq!(fpdu.num(PI_32_RECORD_LENGTH), Some(1024));
        // 3000 bytes round up to 3 KiB
        assert_eq!(fpdu.num(PI_42_MAX_RESERVATION), Some(3));
        assert!(fpdu.param(PGI_09_FILE_ID).is_some());
        assert!(fpdu.pi(PI_51_CREATION_DATE).is_some());
    }

    #[test]
    fn free_message_cap() {
        let long = "x".repeat(255);
        assert!(ConnectBuilder::new("P", "S")
            .free_message(&long)
            .build(1)
            .is_err());
    }
}
