use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Meal amount in grams, bounded to what the hopper can dispense
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "u16")]
pub struct QuantityValue(u16);

impl QuantityValue {
    pub const MIN: u16 = 5;
    pub const MAX: u16 = 150;

    /// Amount the service falls back to for a freshly registered feeder
    pub const DEFAULT: QuantityValue = QuantityValue(5);

    pub fn new(grams: u16) -> Result<Self, ValidationError> {
        if !(Self::MIN..=Self::MAX).contains(&grams) {
            return Err(ValidationError::QuantityOutOfRange(i64::from(grams)));
        }
        Ok(Self(grams))
    }

    /// Floors fractional amounts before the bounds check
    pub fn from_f64(grams: f64) -> Result<Self, ValidationError> {
        if !grams.is_finite() {
            return Err(ValidationError::InvalidQuantity(grams.to_string()));
        }
        let floored = grams.floor();
        if floored < f64::from(Self::MIN) || floored > f64::from(Self::MAX) {
            return Err(ValidationError::QuantityOutOfRange(floored as i64));
        }
        Ok(Self(floored as u16))
    }

    pub fn parse(text: &str) -> Result<Self, ValidationError> {
        let grams = text
            .trim()
            .parse::<f64>()
            .map_err(|_| ValidationError::InvalidQuantity(text.to_string()))?;
        Self::from_f64(grams)
    }

    pub fn grams(&self) -> u16 {
        self.0
    }

    /// Big-endian `(0x00, amount)`
    pub fn encode(&self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    pub fn decode(raw: [u8; 2]) -> Result<Self, ValidationError> {
        Self::new(u16::from_be_bytes(raw))
    }
}

impl TryFrom<f64> for QuantityValue {
    type Error = ValidationError;

    fn try_from(grams: f64) -> Result<Self, Self::Error> {
        Self::from_f64(grams)
    }
}

impl From<QuantityValue> for u16 {
    fn from(quantity: QuantityValue) -> Self {
        quantity.0
    }
}

impl fmt::Display for QuantityValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}g", self.0)
    }
}
