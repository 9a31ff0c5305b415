//! The externally visible image record (`spec.md` §3 "Image record", §6
//! "File format").

use serde::{Deserialize, Serialize};

use crate::buffers::{ThermalFrame, VisualBuffer};
use crate::store::GainModeSetting;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargeState {
    #[serde(rename = "OFF")]
    Off,
    #[serde(rename = "ON")]
    On,
    #[serde(rename = "FAULT")]
    Fault,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(rename = "Camera")]
    pub camera: String,
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Sequence Number")]
    pub sequence_number: u32,
    #[serde(rename = "Time")]
    pub time: String,
    #[serde(rename = "Date")]
    pub date: String,
    #[serde(rename = "Battery")]
    pub battery_volts: f32,
    #[serde(rename = "Charge")]
    pub charge: ChargeState,
    #[serde(rename = "FPA Temp")]
    pub fpa_temp_c: Option<f32>,
    #[serde(rename = "AUX Temp")]
    pub aux_temp_c: Option<f32>,
    #[serde(rename = "Lens Temp")]
    pub lens_temp_c: Option<f32>,
    #[serde(rename = "Lepton Gain Mode")]
    pub lepton_gain_mode: String,
    #[serde(rename = "Lepton Resolution")]
    pub lepton_resolution: String,
}

/// The composite unit written to disk or returned over the wire
/// (`spec.md` §3 "Image record", §6 "File format"). The metadata object is
/// always present; the three payloads are individually presence-flagged
/// and, when absent, omitted from the serialized JSON entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    pub metadata: Metadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jpeg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub radiometric: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<String>,
}

impl ImageRecord {
    /// Base64-encode the optional payloads at construction time. The
    /// encode scratch is scoped to this call and dropped immediately after
    /// (`spec.md` §5 "No dynamic allocation in the hot path": the only
    /// exception is this one-shot encode).
    pub fn new(
        metadata: Metadata,
        visual: Option<&VisualBuffer>,
        thermal: Option<&ThermalFrame>,
    ) -> Self {
        let jpeg = visual.map(|v| base64::encode(v.jpeg_bytes()));
        let radiometric = thermal.map(|t| base64::encode(t.as_bytes_big_endian()));
        let telemetry = thermal.map(|t| base64::encode(t.telemetry_bytes_big_endian()));
        Self {
            metadata,
            jpeg,
            radiometric,
            telemetry,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

pub fn gain_mode_label(mode: GainModeSetting, unknown_if_disabled: bool) -> String {
    if unknown_if_disabled {
        return "UNKNOWN".to_string();
    }
    match mode {
        GainModeSetting::High => "HIGH".to_string(),
        GainModeSetting::Low => "LOW".to_string(),
        GainModeSetting::Auto => "HIGH".to_string(), // AUTO resolves to the sensor's current effective mode, reported elsewhere
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metadata() -> Metadata {
        Metadata {
            camera: "firecam-ab12".to_string(),
            version: "1.0.0".to_string(),
            sequence_number: 1,
            time: "13:05:09".to_string(),
            date: "7/26/26".to_string(),
            battery_volts: 3.9,
            charge: ChargeState::Off,
            fpa_temp_c: None,
            aux_temp_c: None,
            lens_temp_c: None,
            lepton_gain_mode: "UNKNOWN".to_string(),
            lepton_resolution: "0.01".to_string(),
        }
    }

    #[test]
    fn omits_absent_payloads() {
        let record = ImageRecord::new(sample_metadata(), None, None);
        let json = record.to_json().unwrap();
        assert!(!json.contains("jpeg"));
        assert!(!json.contains("radiometric"));
        assert!(!json.contains("telemetry"));
        assert!(json.contains("\"Sequence Number\":1"));
    }

    #[test]
    fn includes_present_payloads() {
        let mut visual = VisualBuffer::default();
        visual.data[0] = 0xFF;
        visual.data[1] = 0xD8;
        visual.len = 2;
        let thermal = ThermalFrame::default();
        let record = ImageRecord::new(sample_metadata(), Some(&visual), Some(&thermal));
        let json = record.to_json().unwrap();
        assert!(json.contains("\"jpeg\""));
        assert!(json.contains("\"radiometric\""));
        assert!(json.contains("\"telemetry\""));
    }
}
