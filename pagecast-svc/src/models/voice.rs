//! Voice selection for narration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Narrator voice gender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceGender {
    #[default]
    Female,
    Male,
}

impl VoiceGender {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoiceGender::Female => "female",
            VoiceGender::Male => "male",
        }
    }
}

impl fmt::Display for VoiceGender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VoiceGender {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "female" => Ok(VoiceGender::Female),
            "male" => Ok(VoiceGender::Male),
            other => Err(format!("unknown voice gender '{}'", other)),
        }
    }
}

/// Voice passed to the narrator: the book's language plus the configured gender
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceConfig {
    pub language: String,
    pub gender: VoiceGender,
}

impl VoiceConfig {
    pub fn new(language: impl Into<String>, gender: VoiceGender) -> Self {
        Self {
            language: language.into(),
            gender,
        }
    }
}
