use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ValidationError;

/// ASCII token a feeder identifies itself with; always `[A-Za-z0-9]+`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DeviceIdentifier(String);

impl DeviceIdentifier {
    pub fn new(text: &str) -> Result<Self, ValidationError> {
        if text.is_empty() || !text.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(ValidationError::InvalidIdentifier(text.to_string()));
        }
        Ok(Self(text.to_string()))
    }

    /// Decode the raw identifier bytes of a device frame
    pub fn from_bytes(raw: &[u8]) -> Result<Self, ValidationError> {
        if raw.is_empty() || !raw.iter().all(u8::is_ascii_alphanumeric) {
            return Err(ValidationError::InvalidIdentifier(
                String::from_utf8_lossy(raw).into_owned(),
            ));
        }
        // All bytes are ASCII alphanumerics at this point
        Ok(Self(raw.iter().map(|&b| b as char).collect()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for DeviceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DeviceIdentifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for DeviceIdentifier {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for DeviceIdentifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::new(&text).map_err(serde::de::Error::custom)
    }
}
