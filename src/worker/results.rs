//! Result-file parsing
//!
//! The prober emits one CSV row per reply plus trailing `#`-prefixed
//! lines carrying `key=value` statistics. Addresses appear either as
//! integers or in their textual form; both are normalized to the 128-bit
//! storage representation.

use std::net::IpAddr;

use crate::types::{ip_to_u128, PipelineError, ProbingStatistics, Protocol, ResultRow};

const RESULT_FIELDS: usize = 16;

fn malformed(key: &str, reason: impl Into<String>) -> PipelineError {
    PipelineError::MalformedResults {
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn parse_addr(field: &str) -> Result<u128, String> {
    if let Ok(value) = field.parse::<u128>() {
        return Ok(value);
    }
    field
        .parse::<IpAddr>()
        .map(ip_to_u128)
        .map_err(|_| format!("`{field}` is neither an integer nor an address"))
}

fn parse_number<T: std::str::FromStr>(field: &str, what: &str) -> Result<T, String> {
    field
        .parse()
        .map_err(|_| format!("`{field}` is not a valid {what}"))
}

fn parse_record(record: &csv::StringRecord, key: &str) -> Result<ResultRow, PipelineError> {
    if record.len() != RESULT_FIELDS {
        return Err(malformed(
            key,
            format!("expected {RESULT_FIELDS} fields, got {}", record.len()),
        ));
    }
    let field = |i: usize| record.get(i).unwrap_or_default();
    let row = (|| -> Result<ResultRow, String> {
        let protocol = field(4);
        protocol
            .parse::<Protocol>()
            .map_err(|_| format!("unknown protocol `{protocol}`"))?;
        Ok(ResultRow {
            source_ip: parse_addr(field(0))?,
            destination_prefix: parse_addr(field(1))?,
            destination_ip: parse_addr(field(2))?,
            reply_ip: parse_addr(field(3))?,
            protocol: protocol.to_string(),
            source_port: parse_number(field(5), "port")?,
            destination_port: parse_number(field(6), "port")?,
            ttl: parse_number(field(7), "ttl")?,
            ttl_check: parse_number(field(8), "ttl")?,
            icmp_type: parse_number(field(9), "icmp type")?,
            icmp_code: parse_number(field(10), "icmp code")?,
            rtt: parse_number(field(11), "rtt")?,
            reply_ttl: parse_number(field(12), "ttl")?,
            reply_size: parse_number(field(13), "size")?,
            round: parse_number(field(14), "round")?,
            snapshot: parse_number(field(15), "snapshot")?,
        })
    })()
    .map_err(|reason| malformed(key, reason))?;
    Ok(row)
}

/// Parse the trailing `#` summary lines into per-round statistics.
fn parse_statistics(content: &str) -> ProbingStatistics {
    let mut statistics = ProbingStatistics::default();
    for line in content.lines() {
        let Some(rest) = line.strip_prefix('#') else {
            continue;
        };
        for token in rest.split_whitespace() {
            let Some((name, value)) = token.split_once('=') else {
                continue;
            };
            let Ok(value) = value.parse::<u64>() else {
                continue;
            };
            match name {
                "probes_sent" => statistics.probes_sent = value,
                "replies_received" => statistics.replies_received = value,
                "filtered_low_ttl" => statistics.filtered_low_ttl = value,
                "filtered_high_ttl" => statistics.filtered_high_ttl = value,
                "filtered_prefix_excluded" => statistics.filtered_prefix_excluded = value,
                "duration_ms" => statistics.duration_ms = value,
                "peak_memory_bytes" => statistics.peak_memory_bytes = value,
                _ => {}
            }
        }
    }
    statistics
}

/// Parse a result file into rows and statistics.
///
/// An empty file parses to zero rows and default statistics; the caller
/// decides what that means for the run.
pub fn parse_result_file(
    content: &str,
    key: &str,
) -> Result<(Vec<ResultRow>, ProbingStatistics), PipelineError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .from_reader(content.as_bytes());
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| malformed(key, e.to_string()))?;
        if record.len() == 1 && record.get(0).unwrap_or_default().is_empty() {
            continue;
        }
        rows.push(parse_record(&record, key)?);
    }
    Ok((rows, parse_statistics(content)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROW: &str = "1.2.3.4,10.20.30.0,10.20.30.40,8.8.8.8,udp,17000,33434,5,5,11,0,32.4,56,46,1,1";

    #[test]
    fn parses_textual_addresses() {
        let (rows, _) = parse_result_file(ROW, "r.csv").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].source_ip & 0xffff_ffff, 0x0102_0304);
        assert_eq!(rows[0].protocol, "udp");
        assert_eq!(rows[0].source_port, 17000);
        assert!((rows[0].rtt - 32.4).abs() < f64::EPSILON);
    }

    #[test]
    fn parses_integer_addresses() {
        let line = "16909060,169090560,169090600,134744072,udp,17000,33434,5,5,11,0,32.4,56,46,1,1";
        let (rows, _) = parse_result_file(line, "r.csv").unwrap();
        assert_eq!(rows[0].source_ip, 16909060);
        assert_eq!(rows[0].reply_ip, 134744072);
    }

    #[test]
    fn parses_trailing_statistics() {
        let content = format!(
            "{ROW}\n# probes_sent=100 replies_received=42\n# duration_ms=1200 peak_memory_bytes=65536\n"
        );
        let (rows, stats) = parse_result_file(&content, "r.csv").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(stats.probes_sent, 100);
        assert_eq!(stats.replies_received, 42);
        assert_eq!(stats.duration_ms, 1200);
        assert_eq!(stats.peak_memory_bytes, 65536);
    }

    #[test]
    fn empty_file_parses_to_nothing() {
        let (rows, stats) = parse_result_file("", "r.csv").unwrap();
        assert!(rows.is_empty());
        assert_eq!(stats, ProbingStatistics::default());
    }

    #[test]
    fn rejects_bad_rows() {
        assert!(parse_result_file("not,a,row", "r.csv").is_err());
        let bad_protocol = ROW.replace("udp", "gre");
        assert!(parse_result_file(&bad_protocol, "r.csv").is_err());
    }

}
