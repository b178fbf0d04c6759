//! Structured soundfont payloads
//!
//! A payload is a JSON document mapping note names to encoded samples. It is
//! deserialized into a typed value; sample data is passed through untouched
//! for the audio engine.

use crate::error::LoadError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

fn default_format() -> String {
    "mp3".to_string()
}

/// Decoded soundfont document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Soundfont {
    pub instrument: String,
    #[serde(default = "default_format")]
    pub format: String,
    /// Note name (e.g. "A0", "Bb3") to encoded sample
    pub notes: BTreeMap<String, String>,
}

/// A ready-to-use soundfont keyed by resource key
#[derive(Debug, Clone)]
pub struct Payload {
    key: String,
    bytes: Arc<[u8]>,
    soundfont: Arc<Soundfont>,
}

impl Payload {
    pub fn decode(key: &str, bytes: Vec<u8>) -> Result<Self, LoadError> {
        let soundfont: Soundfont =
            serde_json::from_slice(&bytes).map_err(|e| LoadError::Decode {
                key: key.to_string(),
                message: e.to_string(),
            })?;

        if soundfont.notes.is_empty() {
            return Err(LoadError::Decode {
                key: key.to_string(),
                message: "soundfont has no notes".to_string(),
            });
        }

        Ok(Self {
            key: key.to_string(),
            bytes: Arc::from(bytes),
            soundfont: Arc::new(soundfont),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Raw bytes as stored in the persistent tiers
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn soundfont(&self) -> &Soundfont {
        &self.soundfont
    }

    pub fn size_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn sample(&self, note: &str) -> Option<&str> {
        self.soundfont.notes.get(note).map(String::as_str)
    }
}

#[cfg(test)]
pub(crate) fn sample_document(instrument: &str) -> Vec<u8> {
    serde_json::json!({
        "instrument": instrument,
        "format": "ogg",
        "notes": {
            "A0": "data:audio/ogg;base64,T2dnUw==",
            "C4": "data:audio/ogg;base64,T2dnUwI="
        }
    })
    .to_string()
    .into_bytes()
}
