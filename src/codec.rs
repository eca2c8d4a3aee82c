// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! FPDU wire codec: length-prefix framing and TLV parameter encoding.
//!
//! The codec is pure. `encode` turns an [`Fpdu`] into the full wire frame
//! (u16 big-endian length prefix plus body) and `decode` reverses it; the
//! session layer reads the prefix itself and hands the body to
//! [`decode_body`]. Malformed input never panics, every failure is a typed
//! [`Error`].

use super::constant::*;
use super::error::Error;
use super::fpdu::{Fpdu, FpduKind, Param};
use byteorder::{BigEndian, ByteOrder};

/// Encodes an FPDU into a complete frame, length prefix included.
pub fn encode(fpdu: &Fpdu) -> Result<Vec<u8>, Error> {
    let mut body = Vec::with_capacity(FPDU_HEADER_SIZE + 64);
    let mut header = [0u8; FPDU_HEADER_SIZE];
    BigEndian::write_u16(&mut header[0..2], fpdu.id_src());
    BigEndian::write_u16(&mut header[2..4], fpdu.id_dst());
    let (phase, fpdu_type) = fpdu.kind().code();
    header[4] = phase;
    header[5] = fpdu_type;
    body.extend_from_slice(&header);

    if fpdu.kind().is_data() {
        if let Some(first) = fpdu.params().first() {
            return Err(Error::MalformedParameter {
                id: first.id(),
                reason: "data FPDUs carry no parameter area",
            });
        }
        if let Some(data) = fpdu.data() {
            body.extend_from_slice(data);
        }
    } else {
        if fpdu.data().is_some() {
            return Err(Error::UnexpectedPayload(fpdu.kind().name()));
        }
        for param in fpdu.params() {
            encode_param(param, &mut body)?;
        }
    }

    if body.len() > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLong(body.len()));
    }
    let mut frame = Vec::with_capacity(2 + body.len());
    frame.push((body.len() >> 8) as u8);
    frame.push((body.len() & 0xFF) as u8);
    frame.extend_from_slice(&body);
    Ok(frame)
}

fn encode_param(param: &Param, out: &mut Vec<u8>) -> Result<(), Error> {
    match param {
        Param::Pi { id, value } => {
            if value.len() > MAX_PARAM_SIZE {
                return Err(Error::ParameterTooLong {
                    id: *id,
                    len: value.len(),
                });
            }
            out.push(*id);
            out.push(value.len() as u8);
            out.extend_from_slice(value);
        }
        Param::Group { id, params } => {
            let mut nested = Vec::new();
            for inner in params {
                if let Param::Group { id: inner_id, .. } = inner {
                    return Err(Error::MalformedParameter {
                        id: *inner_id,
                        reason: "groups cannot nest further groups",
                    });
                }
                encode_param(inner, &mut nested)?;
            }
            if nested.len() > MAX_PARAM_SIZE {
                return Err(Error::ParameterTooLong {
                    id: *id,
                    len: nested.len(),
                });
            }
            out.push(*id);
            out.push(nested.len() as u8);
            out.extend_from_slice(&nested);
        }
    }
    Ok(())
}

/// Decodes a complete frame, checking the length prefix against the payload.
pub fn decode(frame: &[u8]) -> Result<Fpdu, Error> {
    if frame.len() < 2 {
        return Err(Error::TruncatedFrame(frame.len()));
    }
    let declared = BigEndian::read_u16(&frame[0..2]) as usize;
    let body = &frame[2..];
    if declared > body.len() {
        return Err(Error::TruncatedFrame(frame.len()));
    }
    if declared < body.len() {
        return Err(Error::FrameTooLong(frame.len()));
    }
    decode_body(body, true)
}

/// Decodes a frame body (everything after the length prefix).
///
/// `strict` fails on unknown PI/PGI identifiers; lax mode keeps the raw
/// bytes so the parameter survives a re-encode untouched. Unknown FPDU
/// kinds fail in either mode.
pub fn decode_body(body: &[u8], strict: bool) -> Result<Fpdu, Error> {
    if body.len() < FPDU_HEADER_SIZE {
        return Err(Error::TruncatedFrame(body.len()));
    }
    let id_src = BigEndian::read_u16(&body[0..2]);
    let id_dst = BigEndian::read_u16(&body[2..4]);
    let phase = body[4];
    let fpdu_type = body[5];
    let kind = FpduKind::from_code(phase, fpdu_type).ok_or(Error::UnknownFpdu {
        phase,
        fpdu_type,
    })?;
    let rest = &body[FPDU_HEADER_SIZE..];

    if kind.is_data() {
        return Ok(Fpdu::from_parts(
            kind,
            id_src,
            id_dst,
            Vec::new(),
            Some(rest.to_vec()),
        ));
    }

    let params = decode_params(rest, strict, true)?;
    Ok(Fpdu::from_parts(kind, id_src, id_dst, params, None))
}

/// Kind of a raw frame body without parsing the parameter area. The data
/// phase peeks here and only fully decodes non-DTF frames.
pub(crate) fn body_kind(body: &[u8]) -> Result<FpduKind, Error> {
    if body.len() < FPDU_HEADER_SIZE {
        return Err(Error::TruncatedFrame(body.len()));
    }
    FpduKind::from_code(body[4], body[5]).ok_or(Error::UnknownFpdu {
        phase: body[4],
        fpdu_type: body[5],
    })
}

fn decode_params(mut bytes: &[u8], strict: bool, top_level: bool) -> Result<Vec<Param>, Error> {
    let mut params = Vec::new();
    while !bytes.is_empty() {
        if bytes.len() < 2 {
            return Err(Error::TruncatedParameter { id: bytes[0] });
        }
        let id = bytes[0];
        let len = bytes[1] as usize;
        if bytes.len() < 2 + len {
            return Err(Error::TruncatedParameter { id });
        }
        let value = &bytes[2..2 + len];
        if is_pgi(id) {
            if !top_level {
                return Err(Error::UnknownPgi(id));
            }
            let nested = decode_params(value, strict, false)?;
            params.push(Param::group(id, nested));
        } else {
            if strict && !is_known_pi(id) {
                return Err(Error::UnknownPi(id));
            }
            params.push(Param::pi(id, value.to_vec()));
        }
        bytes = &bytes[2 + len..];
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::D3_304;
    use crate::fpdu::{ConnectBuilder, CreateBuilder};

    fn round_trip(fpdu: &Fpdu) {
        let frame = encode(fpdu).unwrap();
        let decoded = decode(&frame).unwrap();
        assert_eq!(&decoded, fpdu);
    }

    #[test]
    fn frame_length_law() {
        let fpdu = ConnectBuilder::new("P1", "SRV").password("x").build(3).unwrap();
        let frame = encode(&fpdu).unwrap();
        let declared = ((frame[0] as usize) << 8) | frame[1] as usize;
        assert_eq!(declared, frame.len() - 2);
    }

    #[test]
    fn connect_round_trip() {
        let fpdu = ConnectBuilder::new("P1", "SRV")
            .password("secret")
            .sync_points(1024, 4)
            .build(3)
            .unwrap();
        round_trip(&fpdu);
    }

    #[test]
    fn create_round_trip_preserves_order() {
        let fpdu = CreateBuilder::new("VF1", 0x010203)
            .record_length(512)
            .reservation(10 * 1024)
            .creation_date("2024-06-01T12:00:00Z")
            .build(1, 2)
            .unwrap();
        let frame = encode(&fpdu).unwrap();
        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded, fpdu);
        let ids: Vec<u8> = decoded.params().iter().map(|p| p.id()).collect();
        let expected: Vec<u8> = fpdu.params().iter().map(|p| p.id()).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn dtf_payload_round_trip() {
        let fpdu = Fpdu::new(FpduKind::Dtf, 7, 9).with_data(b"hello world".to_vec());
        let frame = encode(&fpdu).unwrap();
        // data length is frame length minus prefix and header
        assert_eq!(frame.len() - 2 - FPDU_HEADER_SIZE, 11);
        round_trip(&fpdu);
    }

    #[test]
    fn abort_with_diag_round_trip() {
        let fpdu = Fpdu::new(FpduKind::Abort, 1, 2)
            .with_param(Param::pi(PI_02_DIAG, D3_304.to_bytes().to_vec()));
        round_trip(&fpdu);
        let frame = encode(&fpdu).unwrap();
        assert_eq!(decode(&frame).unwrap().diag(), Some(D3_304));
    }

    #[test]
    fn connection_ids_survive_any_value() {
        let fpdu = Fpdu::new(FpduKind::Release, 0xBEEF, 0x0102);
        let frame = encode(&fpdu).unwrap();
        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded.id_src(), 0xBEEF);
        assert_eq!(decoded.id_dst(), 0x0102);
    }

    #[test]
    fn truncated_frame() {
        assert!(matches!(
            decode_body(&[0, 1, 0, 2, 0x80], true),
            Err(Error::TruncatedFrame(5))
        ));
    }

    #[test]
    fn truncated_parameter() {
        // CONNECT header followed by a TLV declaring 10 bytes with 1 present
        let mut body = vec![0, 1, 0, 0, 0x80, 0x10];
        body.extend_from_slice(&[PI_06_VERSION, 10, 2]);
        assert!(matches!(
            decode_body(&body, true),
            Err(Error::TruncatedParameter { id: PI_06_VERSION })
        ));
    }

    #[test]
    fn unknown_fpdu_kind_always_fails() {
        let body = vec![0, 1, 0, 2, 0x42, 0x42];
        assert!(matches!(
            decode_body(&body, false),
            Err(Error::UnknownFpdu { phase: 0x42, fpdu_type: 0x42 })
        ));
    }

    #[test]
    fn unknown_pi_strict_vs_lax() {
        let mut body = vec![0, 1, 0, 0, 0x80, 0x10];
        body.extend_from_slice(&[200, 1, 0xAA]);
        assert!(matches!(decode_body(&body, true), Err(Error::UnknownPi(200))));

        let fpdu = decode_body(&body, false).unwrap();
        assert_eq!(fpdu.param(200).unwrap().as_bytes().unwrap(), &[0xAA]);
        // the raw parameter survives a re-encode
        let frame = encode(&fpdu).unwrap();
        assert_eq!(decode_body(&frame[2..], false).unwrap(), fpdu);
    }

    #[test]
    fn parameter_area_forbidden_on_data() {
        let fpdu = Fpdu::new(FpduKind::Dtf, 1, 2).with_param(Param::byte(PI_17_PRIORITY, 0));
        assert!(matches!(
            encode(&fpdu),
            Err(Error::MalformedParameter { id: PI_17_PRIORITY, .. })
        ));
    }

    #[test]
    fn payload_forbidden_outside_data() {
        let fpdu = Fpdu::new(FpduKind::Open, 1, 2).with_data(vec![1, 2, 3]);
        assert!(matches!(encode(&fpdu), Err(Error::UnexpectedPayload(_))));
    }

    #[test]
    fn nested_groups_rejected() {
        let fpdu = Fpdu::new(FpduKind::Create, 1, 2).with_param(Param::group(
            PGI_09_FILE_ID,
            vec![Param::group(PGI_30_LOGICAL_ATTRIBUTES, vec![])],
        ));
        assert!(encode(&fpdu).is_err());

        // and on the wire: a PGI inside a PGI value
        let mut body = vec![0, 1, 0, 0, 0x90, 0x10];
        body.extend_from_slice(&[PGI_09_FILE_ID, 2, PGI_30_LOGICAL_ATTRIBUTES, 0]);
        assert!(matches!(
            decode_body(&body, true),
            Err(Error::UnknownPgi(PGI_30_LOGICAL_ATTRIBUTES))
        ));
    }

    #[test]
    fn oversized_parameter_rejected() {
        let fpdu = Fpdu::new(FpduKind::Msg, 1, 2)
            .with_param(Param::pi(PI_91_MESSAGE, vec![0u8; 300]));
        assert!(matches!(
            encode(&fpdu),
            Err(Error::ParameterTooLong { id: PI_91_MESSAGE, len: 300 })
        ));
    }

    #[test]
    fn length_prefix_mismatches() {
        let fpdu = Fpdu::new(FpduKind::Release, 1, 2);
        let mut frame = encode(&fpdu).unwrap();
        frame.push(0); // trailing garbage
        assert!(matches!(decode(&frame), Err(Error::FrameTooLong(_))));

        let fpdu = Fpdu::new(FpduKind::Release, 1, 2);
        let frame = encode(&fpdu).unwrap();
        assert!(matches!(
            decode(&frame[..frame.len() - 1]),
            Err(Error::TruncatedFrame(_))
        ));
    }
}
