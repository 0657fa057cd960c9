//! Speech-to-text contracts: partial and final transcriptions, plus the
//! audio FFT stream consumed by visualizers.

use serde::{Deserialize, Serialize};

use super::{ContractError, EventPayload};

/// A low-latency partial transcription. Forwarded to UIs; never changes
/// router state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SttPartial {
    pub text: String,
    pub utt_id: String,
}

impl EventPayload for SttPartial {
    const EVENT_TYPE: &'static str = "stt.partial";
}

/// The final transcription of one utterance. Opens the LLM leg of a turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SttFinal {
    pub text: String,
    pub utt_id: String,
    /// Recognizer confidence in `[0, 1]`, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    /// BCP-47 language tag, when the recognizer detects one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
}

impl EventPayload for SttFinal {
    const EVENT_TYPE: &'static str = "stt.final";

    fn validate(&self) -> Result<(), ContractError> {
        if let Some(c) = self.confidence {
            if !(0.0..=1.0).contains(&c) {
                return Err(ContractError::OutOfRange {
                    field: "confidence",
                    value: f64::from(c),
                    range: "[0, 1]",
                });
            }
        }
        Ok(())
    }
}

/// FFT magnitudes of the live microphone signal, base64-encoded.
///
/// `format` declares the element encoding (`f32le`) and `bins` the element
/// count, so consumers can decode without sniffing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AudioFft {
    /// Base64 (standard alphabet) little-endian f32 magnitudes.
    pub data: String,
    pub format: String,
    pub bins: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
}

impl AudioFft {
    /// Encode raw magnitudes into the wire form.
    pub fn from_magnitudes(magnitudes: &[f32], sample_rate: u32) -> Self {
        use base64::Engine as _;
        let mut raw = Vec::with_capacity(magnitudes.len() * 4);
        for m in magnitudes {
            raw.extend_from_slice(&m.to_le_bytes());
        }
        Self {
            data: base64::engine::general_purpose::STANDARD.encode(raw),
            format: "f32le".to_owned(),
            bins: magnitudes.len() as u32,
            sample_rate: Some(sample_rate),
        }
    }

    /// Decode the magnitudes back out, checking the declared dimensions.
    pub fn magnitudes(&self) -> Result<Vec<f32>, ContractError> {
        use base64::Engine as _;
        if self.format != "f32le" {
            return Err(ContractError::Invalid(format!(
                "unsupported FFT format {:?}",
                self.format
            )));
        }
        let raw = base64::engine::general_purpose::STANDARD
            .decode(&self.data)
            .map_err(|e| ContractError::Invalid(format!("bad FFT base64: {e}")))?;
        if raw.len() != self.bins as usize * 4 {
            return Err(ContractError::Invalid(format!(
                "FFT payload is {} bytes, declared {} bins",
                raw.len(),
                self.bins
            )));
        }
        Ok(raw
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

impl EventPayload for AudioFft {
    const EVENT_TYPE: &'static str = "stt.audio_fft";

    fn validate(&self) -> Result<(), ContractError> {
        if self.format != "f32le" {
            return Err(ContractError::Invalid(format!(
                "unsupported FFT format {:?}",
                self.format
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fft_roundtrip() {
        let mags = vec![0.0_f32, 0.5, 1.0, 0.25];
        let fft = AudioFft::from_magnitudes(&mags, 16_000);
        assert_eq!(fft.bins, 4);
        assert_eq!(fft.magnitudes().unwrap(), mags);
    }

    #[test]
    fn fft_dimension_mismatch_rejected() {
        let mut fft = AudioFft::from_magnitudes(&[1.0, 2.0], 16_000);
        fft.bins = 7;
        assert!(fft.magnitudes().is_err());
    }

    #[test]
    fn final_confidence_validated() {
        let bad = SttFinal {
            text: "hi".into(),
            utt_id: "u1".into(),
            confidence: Some(1.5),
            lang: None,
        };
        assert!(bad.validate().is_err());
    }
}
