// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Responder-side authorization: partner, version and file checks
//!
//! Every refusal maps to one specific diagnostic; the caller answers with
//! RCONNECT (connection phase) or ABORT (file phase) carrying it in PI 2.

use super::config::{Direction, PartnerConfig, ServerConfig, VirtualFileConfig};
use super::constant::*;
use super::error::{Diag, D2_205, D2_226, D3_301, D3_304, D3_308};
use super::fpdu::Fpdu;

/// What a validated CONNECT established.
pub struct ConnectGrant {
    pub partner_id: String,
    pub access_type: u8,
    pub version: u8,
    /// Absent when an unknown partner was admitted in lax mode.
    pub partner: Option<PartnerConfig>,
}

/// Checks a CONNECT in the mandated order; the first failing check decides
/// the diagnostic.
pub fn validate_connect(cfg: &ServerConfig, connect: &Fpdu) -> Result<ConnectGrant, Diag> {
    let serveur = connect.string(PI_04_SERVEUR).unwrap_or_default();
    if !cfg.server_id.is_empty()
        && !serveur.is_empty()
        && !serveur.eq_ignore_ascii_case(&cfg.server_id)
    {
        return Err(D3_301);
    }

    let version = match connect.num(PI_06_VERSION) {
        Some(v) => v as u8,
        None => return Err(D3_308),
    };
    if version > PROTOCOL_VERSION {
        return Err(D3_308);
    }

    let partner_id = match connect.string(PI_03_DEMANDEUR) {
        Some(id) if !id.is_empty() => id,
        _ => return Err(D3_301),
    };
    let access_type = match connect.num(PI_22_ACCESS_TYPE) {
        Some(a) => a,
        None => return Err(D3_301),
    };

    let partner = match cfg.partner(&partner_id) {
        Some(partner) => partner,
        None if cfg.strict => return Err(D3_301),
        None => {
            return Ok(ConnectGrant {
                partner_id,
                access_type: access_type as u8,
                version,
                partner: None,
            })
        }
    };
    if !partner.enabled {
        return Err(D3_304);
    }
    if let Some(secret) = &partner.secret {
        let offered = connect.string(PI_05_ACCESS_CONTROL).unwrap_or_default();
        if offered != *secret {
            return Err(D3_304);
        }
    }
    if !partner.access_type.permits(access_type) {
        return Err(D3_304);
    }

    Ok(ConnectGrant {
        partner_id,
        access_type: access_type as u8,
        version,
        partner: Some(partner.clone()),
    })
}

/// Checks a CREATE/SELECT target. `direction` is what the responder would
/// do with the file: `Send` for SELECT, `Receive` for CREATE.
pub fn validate_file(
    cfg: &ServerConfig,
    partner: Option<&PartnerConfig>,
    file_id: &str,
    direction: Direction,
) -> Result<VirtualFileConfig, Diag> {
    let file = match cfg.file(file_id) {
        Some(file) => file.clone(),
        None if cfg.strict => return Err(D2_205),
        None => VirtualFileConfig {
            id: file_id.to_string(),
            enabled: true,
            direction: Direction::Both,
            physical_path_template: None,
            record_length: DEFAULT_RECORD_LENGTH,
        },
    };
    if !file.enabled {
        return Err(D2_205);
    }
    if !file.direction.allows(direction) {
        return Err(D2_226);
    }
    if let Some(partner) = partner {
        if !partner.allowed_file_patterns.is_empty()
            && !partner
                .allowed_file_patterns
                .iter()
                .any(|p| wildcard_match(p, file_id))
        {
            return Err(D2_226);
        }
    }
    Ok(file)
}

/// `*` matches any run, `?` one character. Case sensitive.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccessType;
    use crate::fpdu::ConnectBuilder;

    fn config() -> ServerConfig {
        serde_json::from_str(
            r#"{
                "server_id": "SRV",
                "port": 5100,
                "partners": [
                    {"id": "P1", "secret": "x", "access_type": "both"},
                    {"id": "P2", "enabled": false},
                    {"id": "P3", "secret": "y", "access_type": "read",
                     "allowed_file_patterns": ["VF*", "REPORT-?"]}
                ],
                "files": [
                    {"id": "VF1", "direction": "both"},
                    {"id": "VF2", "direction": "send"},
                    {"id": "OLD", "direction": "both", "enabled": false}
                ]
            }"#,
        )
        .unwrap()
    }

    fn connect(partner: &str, server: &str, password: Option<&str>) -> Fpdu {
        let mut b = ConnectBuilder::new(partner, server);
        if let Some(p) = password {
            b = b.password(p);
        }
        b.build(1).unwrap()
    }

    #[test]
    fn accepts_known_partner() {
        let grant = validate_connect(&config(), &connect("P1", "SRV", Some("x"))).unwrap();
        assert_eq!(grant.partner_id, "P1");
        assert_eq!(grant.version, PROTOCOL_VERSION);
        assert_eq!(grant.partner.unwrap().access_type, AccessType::Both);
    }

    #[test]
    fn server_id_is_case_insensitive_and_optional() {
        assert!(validate_connect(&config(), &connect("P1", "srv", Some("x"))).is_ok());
        assert!(validate_connect(&config(), &connect("P1", "", Some("x"))).is_ok());
        assert_eq!(
            validate_connect(&config(), &connect("P1", "OTHER", Some("x"))).err(),
            Some(D3_301)
        );
    }

    #[test]
    fn version_above_ours_is_refused() {
        let fpdu = ConnectBuilder::new("P1", "SRV")
            .password("x")
            .version(3)
            .build(1)
            .unwrap();
        assert_eq!(validate_connect(&config(), &fpdu).err(), Some(D3_308));
    }

    #[test]
    fn unknown_partner_strict_vs_lax() {
        assert_eq!(
            validate_connect(&config(), &connect("GHOST", "SRV", None)).err(),
            Some(D3_301)
        );
        let mut lax = config();
        lax.strict = false;
        let grant = validate_connect(&lax, &connect("GHOST", "SRV", None)).unwrap();
        assert!(grant.partner.is_none());
    }

    #[test]
    fn disabled_partner_and_bad_password() {
        assert_eq!(
            validate_connect(&config(), &connect("P2", "SRV", None)).err(),
            Some(D3_304)
        );
        assert_eq!(
            validate_connect(&config(), &connect("P1", "SRV", Some("bad"))).err(),
            Some(D3_304)
        );
        assert_eq!(
            validate_connect(&config(), &connect("P1", "SRV", None)).err(),
            Some(D3_304)
        );
    }

    #[test]
    fn access_type_forbids_direction() {
        // P3 may only read; a write CONNECT is refused
        let fpdu = ConnectBuilder::new("P3", "SRV")
            .password("y")
            .access_type(ACCESS_WRITE)
            .build(1)
            .unwrap();
        assert_eq!(validate_connect(&config(), &fpdu).err(), Some(D3_304));
        let fpdu = ConnectBuilder::new("P3", "SRV")
            .password("y")
            .access_type(ACCESS_READ)
            .build(1)
            .unwrap();
        assert!(validate_connect(&config(), &fpdu).is_ok());
    }

    #[test]
    fn file_checks() {
        let cfg = config();
        assert!(validate_file(&cfg, None, "VF1", Direction::Receive).is_ok());
        assert_eq!(
            validate_file(&cfg, None, "GHOST", Direction::Send).err(),
            Some(D2_205)
        );
        assert_eq!(
            validate_file(&cfg, None, "OLD", Direction::Send).err(),
            Some(D2_205)
        );
        // VF2 is send-only on this side
        assert_eq!(
            validate_file(&cfg, None, "VF2", Direction::Receive).err(),
            Some(D2_226)
        );
    }

    #[test]
    fn allowlist_globbing() {
        let cfg = config();
        let p3 = cfg.partner("P3").cloned();
        assert!(validate_file(&cfg, p3.as_ref(), "VF1", Direction::Send).is_ok());
        let mut cfg2 = cfg.clone();
        cfg2.files.push(VirtualFileConfig {
            id: "SECRET".to_string(),
            enabled: true,
            direction: Direction::Both,
            physical_path_template: None,
            record_length: DEFAULT_RECORD_LENGTH,
        });
        assert_eq!(
            validate_file(&cfg2, p3.as_ref(), "SECRET", Direction::Send).err(),
            Some(D2_226)
        );
    }

    #[test]
    fn wildcard_semantics() {
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("VF*", "VF1"));
        assert!(wildcard_match("VF*", "VF"));
        assert!(!wildcard_match("VF*", "XVF"));
        assert!(wildcard_match("REPORT-?", "REPORT-1"));
        assert!(!wildcard_match("REPORT-?", "REPORT-12"));
        assert!(wildcard_match("a*b*c", "axxbyyc"));
        assert!(!wildcard_match("a*b*c", "axxbyy"));
        assert!(!wildcard_match("vf*", "VF1"));
    }
}
