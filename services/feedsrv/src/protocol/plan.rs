//! Meal slots and meal plans
//!
//! Disabled slots stay in the plan for persistence but never reach the
//! device: they are skipped by the encoding and by every total.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::quantity::QuantityValue;
use super::time::{TimeOffset, TimeValue};
use crate::error::ValidationError;

fn enabled_by_default() -> bool {
    true
}

/// One scheduled meal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MealSlot {
    pub time: TimeValue,
    pub quantity: QuantityValue,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

impl MealSlot {
    pub fn from_components(time: TimeValue, quantity: QuantityValue, enabled: bool) -> Self {
        Self {
            time,
            quantity,
            enabled,
        }
    }

    /// Validate plain numbers from the control surface
    pub fn from_raw(
        hours: i64,
        minutes: i64,
        grams: f64,
        enabled: bool,
    ) -> Result<Self, ValidationError> {
        Ok(Self {
            time: TimeValue::new(hours, minutes)?,
            quantity: QuantityValue::from_f64(grams)?,
            enabled,
        })
    }

    /// `time ++ quantity`, four bytes
    pub fn encode_with_offset(&self, offset: TimeOffset) -> [u8; 4] {
        let [t0, t1] = self.time.encode_with_offset(offset);
        let [q0, q1] = self.quantity.encode();
        [t0, t1, q0, q1]
    }
}

/// Ordered feeding schedule
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MealPlan {
    slots: Vec<MealSlot>,
}

impl MealPlan {
    pub fn new(slots: Vec<MealSlot>) -> Self {
        Self { slots }
    }

    pub fn slots(&self) -> &[MealSlot] {
        &self.slots
    }

    pub fn enabled_slots(&self) -> impl Iterator<Item = &MealSlot> {
        self.slots.iter().filter(|slot| slot.enabled)
    }

    pub fn enabled_count(&self) -> usize {
        self.enabled_slots().count()
    }

    /// Grams per day over enabled slots
    pub fn total_quantity(&self) -> u32 {
        self.enabled_slots()
            .map(|slot| u32::from(slot.quantity.grams()))
            .sum()
    }

    /// Count byte, then each enabled slot in schedule order
    pub fn encode_with_offset(&self, offset: TimeOffset) -> Result<Bytes, ValidationError> {
        let count = self.enabled_count();
        let count_byte =
            u8::try_from(count).map_err(|_| ValidationError::TooManyMeals(count))?;

        let mut buf = BytesMut::with_capacity(1 + count * 4);
        buf.put_u8(count_byte);
        for slot in self.enabled_slots() {
            buf.put_slice(&slot.encode_with_offset(offset));
        }
        Ok(buf.freeze())
    }

    pub fn encode(&self) -> Result<Bytes, ValidationError> {
        self.encode_with_offset(TimeOffset::DEFAULT)
    }
}

impl FromIterator<MealSlot> for MealPlan {
    fn from_iter<I: IntoIterator<Item = MealSlot>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
