//! Diagnostic Trouble Code canonicalization and the service-0x19 response parser.

use std::collections::HashMap;

use serde::Deserialize;

/// Severity classification attached to a DTC entry in the configured lookup table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Informational only.
    Info,
    /// Should be investigated but does not need immediate attention.
    Warning,
    /// Requires immediate attention; triggers the monitor's alert log line.
    Critical,
    /// No table entry exists for this code.
    Unknown,
}

impl Default for Severity {
    fn default() -> Self {
        Self::Unknown
    }
}

/// One entry in the configured DTC lookup table.
#[derive(Debug, Clone, Deserialize)]
pub struct DtcInfo {
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Severity classification.
    #[serde(default)]
    pub severity: Severity,
    /// Subsystem this code belongs to (engine, transmission, ...).
    #[serde(default)]
    pub component: String,
    /// Whether this code should be surfaced as an alert when observed.
    #[serde(default)]
    pub alert: bool,
}

impl Default for DtcInfo {
    fn default() -> Self {
        Self {
            description: String::new(),
            severity: Severity::Unknown,
            component: String::new(),
            alert: false,
        }
    }
}

/// A single decoded DTC: canonical code plus whatever the lookup table knew about it.
#[derive(Debug, Clone)]
pub struct DtcEntry {
    /// Canonical 5-character code, e.g. `P20F9`.
    pub code: String,
    /// Raw ISO 14229-1 status byte that accompanied this code.
    pub status_byte: u8,
    /// Lookup table entry, or a default `Unknown` entry if the code wasn't recognized.
    pub info: DtcInfo,
}

/// Maps canonical DTC codes to their description/severity/component/alert metadata.
#[derive(Debug, Clone, Default)]
pub struct DtcTable(HashMap<String, DtcInfo>);

impl DtcTable {
    /// Builds a table from a `code -> info` map, as loaded from the monitor configuration.
    pub fn new(entries: HashMap<String, DtcInfo>) -> Self {
        Self(entries)
    }

    /// Looks up a canonical code, returning an `Unknown` placeholder if it's not present.
    pub fn lookup(&self, code: &str) -> DtcInfo {
        self.0.get(code).cloned().unwrap_or_default()
    }
}

/// Converts the two raw ISO 14229-1 DTC bytes into a canonical `Pxxxx`/`Cxxxx`/`Bxxxx`/`Uxxxx`
/// code: the top two bits of `high` select the letter, the remaining 14 bits (6 from `high`, 8
/// from `mid`) are rendered as four hex digits. The third record byte is a status byte, not part
/// of the canonical code, and is carried separately as [`DtcEntry::status_byte`].
pub fn canonicalize(high: u8, mid: u8) -> String {
    let letter = match (high >> 6) & 0b11 {
        0 => 'P',
        1 => 'C',
        2 => 'B',
        _ => 'U',
    };
    let value = (((high & 0x3F) as u32) << 8) | mid as u32;
    format!("{letter}{:04X}", value)
}

/// Parses a ReadDTCByStatusMask (service `0x19`, sub-function `0x02`) positive response.
///
/// Expected shape: `0x59 0x02 <count> (<3 code bytes> <1 status byte>){count}`. Unrecognized
/// codes are not an error: they're returned with severity `Unknown` and `alert = false`.
pub fn parse_read_dtc_response(payload: &[u8], table: &DtcTable) -> Result<Vec<DtcEntry>, String> {
    if payload.len() < 3 || payload[0] != 0x59 || payload[1] != 0x02 {
        return Err("payload is not a ReadDTCByStatusMask response".to_string());
    }
    let count = payload[2] as usize;
    let records = &payload[3..];
    if records.len() < count * 4 {
        return Err(format!(
            "expected {} DTC records ({} bytes), got {} bytes",
            count,
            count * 4,
            records.len()
        ));
    }
    let mut out = Vec::with_capacity(count);
    for chunk in records.chunks_exact(4).take(count) {
        let code = canonicalize(chunk[0], chunk[1]);
        let info = table.lookup(&code);
        out.push(DtcEntry {
            code,
            status_byte: chunk[3],
            info,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_powertrain_codes() {
        assert_eq!(canonicalize(0x20, 0xF9), "P20F9");
        assert_eq!(canonicalize(0x05, 0x8D), "P058D");
    }

    #[test]
    fn canonicalize_selects_letter_from_top_bits() {
        assert_eq!(&canonicalize(0x00, 0x01)[..1], "P");
        assert_eq!(&canonicalize(0x40, 0x01)[..1], "C");
        assert_eq!(&canonicalize(0x80, 0x01)[..1], "B");
        assert_eq!(&canonicalize(0xC0, 0x01)[..1], "U");
    }

    #[test]
    fn parse_response_with_alerting_and_unknown_codes() {
        let mut entries = HashMap::new();
        entries.insert(
            "P20F9".to_string(),
            DtcInfo {
                description: "Cylinder 10 misfire".to_string(),
                severity: Severity::Critical,
                component: "engine".to_string(),
                alert: true,
            },
        );
        let table = DtcTable::new(entries);

        let payload = [
            0x59, 0x02, 0x02, 0x20, 0xF9, 0x00, 0x40, 0x05, 0x8D, 0x00, 0x40,
        ];
        let dtcs = parse_read_dtc_response(&payload, &table).unwrap();
        assert_eq!(dtcs.len(), 2);
        assert_eq!(dtcs[0].code, "P20F9");
        assert!(dtcs[0].info.alert);
        assert!(matches!(dtcs[0].info.severity, Severity::Critical));
        assert_eq!(dtcs[1].code, "P058D");
        assert!(!dtcs[1].info.alert);
        assert!(matches!(dtcs[1].info.severity, Severity::Unknown));
    }

    #[test]
    fn parse_rejects_wrong_service() {
        let table = DtcTable::default();
        let err = parse_read_dtc_response(&[0x7F, 0x19, 0x31], &table).unwrap_err();
        assert!(err.contains("not a ReadDTCByStatusMask"));
    }
}
