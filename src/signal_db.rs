//! Signal database decode interface: the external collaborator that turns raw CAN payloads
//! into named signal values.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{ConfigError, DecodeError};

/// Decoded signal values for one frame, keyed by signal name.
pub type DecodedSignals = HashMap<String, Value>;

/// Opaque decode interface. A real deployment would back this with a DBC-file parser; this
/// crate ships only [`JsonSignalDatabase`], a minimal implementation enough to exercise the
/// monitor pipeline end-to-end.
pub trait SignalDatabase {
    /// Decodes `bytes` received on arbitration ID `id`.
    fn decode(&self, id: u32, bytes: &[u8]) -> Result<DecodedSignals, DecodeError>;
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(flatten)]
    signals: HashMap<String, Value>,
}

/// A [`SignalDatabase`] backed by a JSON map of `"<id-hex>": {"signal": ...}}`.
///
/// This does not decode bit-packed signals from raw bytes the way a DBC file would; it exists
/// as the smallest concrete adapter behind the [`SignalDatabase`] trait so the monitor pipeline
/// has something real to decode against in tests, and so a DBC-backed implementation can be
/// substituted later without touching the monitor.
#[derive(Debug, Default)]
pub struct JsonSignalDatabase {
    entries: HashMap<u32, RawEntry>,
}

impl JsonSignalDatabase {
    /// Loads the database from a JSON file, e.g. `{"0x7e8": {"name": "ecu_response"}}`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let raw: HashMap<String, RawEntry> = serde_json::from_str(&text)?;
        let mut entries = HashMap::with_capacity(raw.len());
        for (key, value) in raw {
            let id = parse_id(&key)
                .ok_or_else(|| ConfigError::Invalid(format!("invalid CAN ID key: {key}")))?;
            entries.insert(id, value);
        }
        Ok(Self { entries })
    }
}

fn parse_id(key: &str) -> Option<u32> {
    if let Some(hex) = key.strip_prefix("0x").or_else(|| key.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        key.parse().ok()
    }
}

impl SignalDatabase for JsonSignalDatabase {
    fn decode(&self, id: u32, _bytes: &[u8]) -> Result<DecodedSignals, DecodeError> {
        self.entries
            .get(&id)
            .map(|e| e.signals.clone())
            .ok_or(DecodeError::NotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn decodes_known_id_and_reports_unknown() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(br#"{"0x100": {"rpm": 4200}}"#).unwrap();
        let db = JsonSignalDatabase::load(f.path()).unwrap();
        let decoded = db.decode(0x100, &[]).unwrap();
        assert_eq!(decoded["rpm"], 4200);
        assert!(matches!(db.decode(0x200, &[]), Err(DecodeError::NotFound(0x200))));
    }
}
