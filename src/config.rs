//! JSON configuration loading for the monitor pipeline.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::dtc::DtcInfo;
use crate::error::ConfigError;

fn default_bitrate() -> u32 {
    500_000
}

fn default_interface() -> String {
    "can0".to_string()
}

fn default_block_size() -> u8 {
    8
}

fn default_st_min_ms() -> u64 {
    0
}

/// Top-level monitor configuration, loaded from a JSON file passed via `--config`.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Logging verbosity, e.g. `"info"`, `"debug"`. Overridden by `--log-level` if given.
    #[serde(default)]
    pub log_level: Option<String>,
    /// CAN bitrate, used when the monitor brings the interface up itself.
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    /// CAN interface name.
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Named replay bundles: a CAN ID/payload/response/timeout/retry tuple a caller can drive
    /// through the UDS client, e.g. for a scripted diagnostic routine.
    #[serde(default)]
    pub patches: HashMap<String, PatchConfig>,
    /// UDS/ISO-TP configuration for the passive reassembler. `None` disables passive UDS
    /// reassembly (the monitor then only decodes ordinary signal frames).
    #[serde(default)]
    pub uds: Option<UdsConfig>,
    /// Path to a [`crate::signal_db::JsonSignalDatabase`] file. `None` means no ordinary-frame
    /// decoding is configured; the monitor still passively reassembles UDS responses if `uds`
    /// is set.
    #[serde(default)]
    pub signal_db: Option<String>,
}

/// One named request/response bundle under `patches`.
#[derive(Debug, Clone, Deserialize)]
pub struct PatchConfig {
    /// Arbitration ID to transmit on.
    pub can_id: u32,
    /// Request payload, as a hex string (e.g. `"22F190"`).
    pub payload: String,
    /// Arbitration ID the response is expected on.
    pub response_id: u32,
    /// Per-attempt timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Number of send attempts before giving up.
    #[serde(default = "default_retries")]
    pub retries: u32,
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_retries() -> u32 {
    3
}

impl PatchConfig {
    /// Decodes `payload` from its configured hex-string form into raw bytes.
    pub fn payload_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        decode_hex(&self.payload)
            .map_err(|e| ConfigError::Invalid(format!("patch payload is not valid hex: {e}")))
    }
}

fn decode_hex(s: &str) -> Result<Vec<u8>, String> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        return Err("odd number of hex digits".to_string());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| e.to_string()))
        .collect()
}

/// Passive UDS reassembly configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UdsConfig {
    /// Arbitration ID requests are sent on (used to reply with flow control).
    pub ecu_request_id: u32,
    /// Arbitration ID ECU responses arrive on; the reassembler listens here.
    pub ecu_response_id: u32,
    /// Flow-control parameters this side advertises.
    #[serde(default)]
    pub flow_control: FlowControlConfig,
    /// DTC code -> description/severity/component/alert lookup table.
    #[serde(default)]
    pub dtcs: HashMap<String, DtcInfo>,
}

/// Flow-control parameters advertised in this side's outgoing FC frames.
#[derive(Debug, Clone, Deserialize)]
pub struct FlowControlConfig {
    /// BlockSize advertised to the peer. `0` means "no further FC needed mid-stream".
    #[serde(default = "default_block_size")]
    pub block_size: u8,
    /// STmin advertised to the peer, in milliseconds.
    #[serde(default = "default_st_min_ms")]
    pub st_min_ms: u64,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            st_min_ms: default_st_min_ms(),
        }
    }
}

impl MonitorConfig {
    /// Loads and validates a configuration file from `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let cfg: MonitorConfig = serde_json::from_str(&text)?;
        if let Some(uds) = &cfg.uds {
            if uds.ecu_request_id == uds.ecu_response_id {
                return Err(ConfigError::Invalid(
                    "uds.ecu_request_id and uds.ecu_response_id must differ".to_string(),
                ));
            }
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_full_document() {
        let json = r#"{
            "log_level": "debug",
            "interface": "vcan0",
            "patches": {
                "unlock": {"can_id": 2016, "payload": "2701", "response_id": 2024, "timeout_ms": 500, "retries": 2}
            },
            "uds": {
                "ecu_request_id": 2016,
                "ecu_response_id": 2024,
                "flow_control": {"block_size": 1, "st_min_ms": 5},
                "dtcs": {
                    "P20F9": {"description": "misfire", "severity": "CRITICAL", "component": "engine", "alert": true}
                }
            }
        }"#;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(json.as_bytes()).unwrap();
        let cfg = MonitorConfig::load(f.path()).unwrap();
        assert_eq!(cfg.interface, "vcan0");
        assert_eq!(cfg.patches["unlock"].payload_bytes().unwrap(), vec![0x27, 0x01]);
        let uds = cfg.uds.unwrap();
        assert_eq!(uds.flow_control.block_size, 1);
        assert!(uds.dtcs["P20F9"].alert);
    }

    #[test]
    fn missing_required_key_is_config_error() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(br#"{"uds": {"ecu_response_id": 100}}"#).unwrap();
        assert!(MonitorConfig::load(f.path()).is_err());
    }

    #[test]
    fn defaults_apply_when_sections_absent() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"{}").unwrap();
        let cfg = MonitorConfig::load(f.path()).unwrap();
        assert_eq!(cfg.bitrate, 500_000);
        assert_eq!(cfg.interface, "can0");
        assert!(cfg.uds.is_none());
    }
}
