//! Validation of user-supplied target, prefix and probes files
//!
//! A measurement's input file is validated before any probing starts; a
//! malformed file rejects the round without side effects.

use std::collections::HashMap;
use std::net::IpAddr;

use ipnet::IpNet;

use crate::types::{Protocol, ValidationError};

/// Object-store metadata key carrying the target file type.
pub const TYPE_METADATA_KEY: &str = "type";
/// Object-store metadata key marking a pre-computed probes file.
pub const PROBES_METADATA_KEY: &str = "is_probes_file";

/// Kind of a user-uploaded target specification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetFileKind {
    /// One destination per row, probed at /32 with a single flow.
    TargetsList,
    /// One prefix per row, split at /24 and fanned out across flows.
    PrefixesList,
    /// Pre-computed probes, validated per-row only.
    Probes,
}

impl TargetFileKind {
    /// Resolve the kind from object metadata. A missing `type` defaults to
    /// `targets-list`; an unknown `type` is a hard error.
    pub fn from_metadata(metadata: &HashMap<String, String>) -> Result<Self, ValidationError> {
        if metadata
            .get(PROBES_METADATA_KEY)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
        {
            return Ok(TargetFileKind::Probes);
        }
        match metadata.get(TYPE_METADATA_KEY).map(String::as_str) {
            None | Some("targets-list") => Ok(TargetFileKind::TargetsList),
            Some("prefixes-list") => Ok(TargetFileKind::PrefixesList),
            Some(other) => Err(ValidationError::UnknownTargetType(other.to_string())),
        }
    }
}

/// One validated target row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRow {
    pub prefix: IpNet,
    pub protocol: Protocol,
    pub min_ttl: u8,
    pub max_ttl: u8,
}

/// One validated probes-file row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRow {
    pub destination: IpAddr,
    pub source_port: u16,
    pub destination_port: u16,
    pub ttl: u8,
    pub protocol: Protocol,
}

/// Split the file body into rows, permitting at most one trailing blank
/// line. Interior blank lines are rejected.
fn body_lines(content: &str) -> Result<Vec<&str>, ValidationError> {
    if content.is_empty() {
        return Err(ValidationError::EmptyFile);
    }
    let mut lines: Vec<&str> = content.split('\n').collect();
    if lines.last() == Some(&"") {
        lines.pop();
    }
    if lines.iter().all(|l| l.is_empty()) {
        return Err(ValidationError::EmptyFile);
    }
    if lines.last() == Some(&"") {
        return Err(ValidationError::TrailingBlankLines);
    }
    if let Some(position) = lines.iter().position(|l| l.is_empty()) {
        return Err(ValidationError::InvalidRow {
            line: position + 1,
            reason: "blank line".to_string(),
        });
    }
    Ok(lines)
}

fn parse_ttl(field: &str, line: usize) -> Result<u8, ValidationError> {
    let ttl: u16 = field.parse().map_err(|_| ValidationError::InvalidRow {
        line,
        reason: format!("non-integer ttl `{field}`"),
    })?;
    if !(1..=255).contains(&ttl) {
        return Err(ValidationError::InvalidRow {
            line,
            reason: format!("ttl {ttl} out of [1,255]"),
        });
    }
    Ok(ttl as u8)
}

fn parse_target_row(row: &str, line: usize, kind: TargetFileKind) -> Result<TargetRow, ValidationError> {
    let fields: Vec<&str> = row.split(',').collect();
    if fields.len() != 4 {
        return Err(ValidationError::InvalidRow {
            line,
            reason: format!("expected 4 fields, got {}", fields.len()),
        });
    }

    let prefix = match fields[0].parse::<IpNet>() {
        Ok(net) => net,
        // A targets list may name a single destination without a length.
        Err(_) if kind == TargetFileKind::TargetsList => fields[0]
            .parse::<IpAddr>()
            .map(IpNet::from)
            .map_err(|_| ValidationError::InvalidRow {
                line,
                reason: format!("`{}` is not a CIDR prefix", fields[0]),
            })?,
        Err(_) => {
            return Err(ValidationError::InvalidRow {
                line,
                reason: format!("`{}` is not a CIDR prefix", fields[0]),
            })
        }
    };

    let protocol: Protocol = fields[1].parse().map_err(|_| ValidationError::InvalidRow {
        line,
        reason: format!("unknown protocol `{}`", fields[1]),
    })?;
    let min_ttl = parse_ttl(fields[2], line)?;
    let max_ttl = parse_ttl(fields[3], line)?;
    if min_ttl > max_ttl {
        return Err(ValidationError::InvalidRow {
            line,
            reason: format!("min_ttl {min_ttl} > max_ttl {max_ttl}"),
        });
    }

    Ok(TargetRow {
        prefix,
        protocol,
        min_ttl,
        max_ttl,
    })
}

/// Validate a `targets-list` or `prefixes-list` body and return its rows.
pub fn validate_target_file(
    content: &str,
    kind: TargetFileKind,
) -> Result<Vec<TargetRow>, ValidationError> {
    match kind {
        TargetFileKind::TargetsList | TargetFileKind::PrefixesList => {}
        TargetFileKind::Probes => {
            return Err(ValidationError::UnknownTargetType("probes".to_string()))
        }
    }
    body_lines(content)?
        .iter()
        .enumerate()
        .map(|(i, row)| parse_target_row(row, i + 1, kind))
        .collect()
}

fn parse_probe_row(row: &str, line: usize) -> Result<ProbeRow, ValidationError> {
    let fields: Vec<&str> = row.split(',').collect();
    if fields.len() != 5 {
        return Err(ValidationError::InvalidRow {
            line,
            reason: format!("expected 5 fields, got {}", fields.len()),
        });
    }
    let destination: IpAddr = fields[0].parse().map_err(|_| ValidationError::InvalidRow {
        line,
        reason: format!("`{}` is not an address", fields[0]),
    })?;
    let source_port: u16 = fields[1].parse().map_err(|_| ValidationError::InvalidRow {
        line,
        reason: format!("non-integer source port `{}`", fields[1]),
    })?;
    let destination_port: u16 = fields[2].parse().map_err(|_| ValidationError::InvalidRow {
        line,
        reason: format!("non-integer destination port `{}`", fields[2]),
    })?;
    if destination_port == 0 {
        return Err(ValidationError::InvalidRow {
            line,
            reason: "destination port must be >= 1".to_string(),
        });
    }
    let ttl = parse_ttl(fields[3], line)?;
    let protocol: Protocol = fields[4].parse().map_err(|_| ValidationError::InvalidRow {
        line,
        reason: format!("unknown protocol `{}`", fields[4]),
    })?;

    Ok(ProbeRow {
        destination,
        source_port,
        destination_port,
        ttl,
        protocol,
    })
}

/// Validate a probes file: per-row syntax only.
pub fn validate_probes_file(content: &str) -> Result<Vec<ProbeRow>, ValidationError> {
    body_lines(content)?
        .iter()
        .enumerate()
        .map(|(i, row)| parse_probe_row(row, i + 1))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = "1.1.1.0/24,icmp,2,32\n2.2.2.0/24,udp,5,20";

    #[test]
    fn accepts_valid_targets_list() {
        let rows = validate_target_file(VALID, TargetFileKind::TargetsList).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].protocol, Protocol::Icmp);
        assert_eq!(rows[1].min_ttl, 5);
    }

    #[test]
    fn accepts_exactly_one_trailing_newline() {
        let content = format!("{VALID}\n");
        assert!(validate_target_file(&content, TargetFileKind::TargetsList).is_ok());
    }

    #[test]
    fn rejects_two_trailing_blank_lines() {
        let content = format!("{VALID}\n\n");
        assert_eq!(
            validate_target_file(&content, TargetFileKind::TargetsList),
            Err(ValidationError::TrailingBlankLines)
        );
    }

    #[test]
    fn rejects_empty_input() {
        assert_eq!(
            validate_target_file("", TargetFileKind::TargetsList),
            Err(ValidationError::EmptyFile)
        );
        assert_eq!(
            validate_target_file("\n", TargetFileKind::TargetsList),
            Err(ValidationError::EmptyFile)
        );
    }

    #[test]
    fn rejects_non_cidr_tokens() {
        let err =
            validate_target_file("test,icmp,2,32", TargetFileKind::PrefixesList).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidRow { line: 1, .. }));
    }

    #[test]
    fn rejects_unknown_protocol() {
        let err = validate_target_file("1.1.1.0/24,tcp,2,32", TargetFileKind::TargetsList)
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidRow { .. }));
    }

    #[test]
    fn rejects_out_of_range_and_inverted_ttls() {
        for content in [
            "1.1.1.0/24,icmp,0,32",
            "1.1.1.0/24,icmp,2,300",
            "1.1.1.0/24,icmp,30,2",
            "1.1.1.0/24,icmp,x,32",
        ] {
            assert!(validate_target_file(content, TargetFileKind::TargetsList).is_err());
        }
    }

    #[test]
    fn rejects_rows_with_missing_fields() {
        // Bare destinations without protocol and ttls are not rows.
        let err = validate_target_file(
            "1.1.1.1\ntest\n2.2.2.0/24",
            TargetFileKind::TargetsList,
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidRow { line: 1, .. }));
    }

    #[test]
    fn targets_list_accepts_bare_destination_with_fields() {
        let rows =
            validate_target_file("8.8.8.8,icmp,1,32", TargetFileKind::TargetsList).unwrap();
        assert_eq!(rows[0].prefix.prefix_len(), 32);
    }

    #[test]
    fn accepts_valid_probe_row() {
        let rows = validate_probes_file("8.8.8.8,24000,33434,32,icmp").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].source_port, 24000);
    }

    #[test]
    fn rejects_malformed_probe_rows() {
        assert!(validate_probes_file("8.8.453.8,24000,33434,32,icmp").is_err());
        assert!(validate_probes_file("8.8.8.8,24000,0,32,icmp").is_err());
        assert!(validate_probes_file("8.8.8.8,24000,33434,32,icmt").is_err());
    }

    #[test]
    fn metadata_resolution() {
        let mut meta = HashMap::new();
        assert_eq!(
            TargetFileKind::from_metadata(&meta).unwrap(),
            TargetFileKind::TargetsList
        );
        meta.insert("type".to_string(), "prefixes-list".to_string());
        assert_eq!(
            TargetFileKind::from_metadata(&meta).unwrap(),
            TargetFileKind::PrefixesList
        );
        meta.insert("type".to_string(), "subnets".to_string());
        assert!(TargetFileKind::from_metadata(&meta).is_err());
        let mut probes = HashMap::new();
        probes.insert("is_probes_file".to_string(), "True".to_string());
        assert_eq!(
            TargetFileKind::from_metadata(&probes).unwrap(),
            TargetFileKind::Probes
        );
    }
}
