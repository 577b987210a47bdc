//! Feeder frame codec
//!
//! Server→device frames are built from [`Command`] values. Device→server
//! frames are `9D A1 14 <identifier> <5-byte tail>` and are classified by
//! their tail, most specific pattern first:
//!
//! | Tail              | Event                         |
//! |-------------------|-------------------------------|
//! | `01 D0 01 00 00`  | identification                |
//! | `21 03 84 QQ QQ`  | manual meal                   |
//! | `XX D0 A1 00 00`  | acknowledgement of action XX  |
//! | `21 TT TT QQ QQ`  | empty hopper alert            |

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use super::constants::*;
use super::identifier::DeviceIdentifier;
use super::plan::MealPlan;
use super::quantity::QuantityValue;
use super::time::{TimeOffset, TimeValue};
use crate::error::{FeedSrvError, Result};

/// Device action confirmed by an acknowledgement frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    ChangeDefaultQuantity,
    ChangePlanning,
    FeedNow,
}

impl Action {
    pub fn opcode(&self) -> u8 {
        match self {
            Action::ChangeDefaultQuantity => OPCODE_DEFAULT_QUANTITY,
            Action::ChangePlanning => OPCODE_PLANNING,
            Action::FeedNow => OPCODE_FEED_NOW,
        }
    }

    pub fn from_opcode(opcode: u8) -> Option<Self> {
        match opcode {
            OPCODE_DEFAULT_QUANTITY => Some(Action::ChangeDefaultQuantity),
            OPCODE_PLANNING => Some(Action::ChangePlanning),
            OPCODE_FEED_NOW => Some(Action::FeedNow),
            _ => None,
        }
    }
}

/// Server→device command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    TimeBroadcast(TimeValue),
    SetDefaultQuantity(QuantityValue),
    SetPlanning(MealPlan),
    FeedNow(QuantityValue),
}

impl Command {
    /// Action acknowledged by the device; the time broadcast has none
    pub fn action(&self) -> Option<Action> {
        match self {
            Command::TimeBroadcast(_) => None,
            Command::SetDefaultQuantity(_) => Some(Action::ChangeDefaultQuantity),
            Command::SetPlanning(_) => Some(Action::ChangePlanning),
            Command::FeedNow(_) => Some(Action::FeedNow),
        }
    }

    /// Exact bytes of the acknowledgement `identifier` sends back
    pub fn expected_ack(&self, identifier: &DeviceIdentifier) -> Option<Bytes> {
        self.action()
            .map(|action| acknowledgement_frame(identifier, action))
    }
}

/// Device→server event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Identification {
        identifier: DeviceIdentifier,
    },
    ManualMeal {
        identifier: DeviceIdentifier,
        quantity: QuantityValue,
    },
    EmptyFeeder {
        identifier: DeviceIdentifier,
        time: TimeValue,
        quantity: QuantityValue,
    },
    /// Acknowledgement; only meaningful to a pending expectation
    Expectation {
        identifier: DeviceIdentifier,
        action: Action,
    },
}

impl Event {
    pub fn identifier(&self) -> &DeviceIdentifier {
        match self {
            Event::Identification { identifier }
            | Event::ManualMeal { identifier, .. }
            | Event::EmptyFeeder { identifier, .. }
            | Event::Expectation { identifier, .. } => identifier,
        }
    }

    /// Short name used in logs and unknown-data records
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Identification { .. } => "identification",
            Event::ManualMeal { .. } => "manual_meal",
            Event::EmptyFeeder { .. } => "empty_feeder",
            Event::Expectation { .. } => "expectation",
        }
    }
}

/// Encode a command into its wire frame
pub fn encode(command: &Command, offset: TimeOffset) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(8);
    match command {
        Command::TimeBroadcast(time) => {
            buf.put_slice(&TIME_BROADCAST_HEADER);
            buf.put_slice(&time.encode_with_offset(offset));
        },
        Command::SetDefaultQuantity(quantity) => {
            buf.put_slice(&DEFAULT_QUANTITY_HEADER);
            buf.put_slice(&quantity.encode());
        },
        Command::SetPlanning(plan) => {
            let body = plan.encode_with_offset(offset)?;
            buf.reserve(body.len());
            buf.put_slice(&PLANNING_HEADER);
            buf.put_slice(&body);
        },
        Command::FeedNow(quantity) => {
            buf.put_slice(&FEED_NOW_HEADER);
            buf.put_slice(&quantity.encode());
        },
    }
    Ok(buf.freeze())
}

/// Classify one device frame
///
/// Unmatched layouts fail with `ProtocolError::UnknownFrame`; a matched
/// layout with an invalid identifier, time or quantity fails validation.
pub fn recognize(frame: &[u8], offset: TimeOffset) -> Result<Event> {
    let frame = collapse_repeated_identification(frame);

    if frame.len() < DEVICE_HEADER.len() + 1 + DEVICE_TAIL_LEN || !frame.starts_with(&DEVICE_HEADER)
    {
        return Err(FeedSrvError::unknown_frame(frame));
    }

    let tail_start = frame.len() - DEVICE_TAIL_LEN;
    let raw_identifier = &frame[DEVICE_HEADER.len()..tail_start];
    let tail = &frame[tail_start..];

    if tail == IDENTIFICATION_TAIL {
        let identifier = DeviceIdentifier::from_bytes(raw_identifier)?;
        return Ok(Event::Identification { identifier });
    }

    if tail.starts_with(&MANUAL_MEAL_PREFIX) {
        let identifier = DeviceIdentifier::from_bytes(raw_identifier)?;
        let quantity = QuantityValue::decode([tail[3], tail[4]])?;
        return Ok(Event::ManualMeal {
            identifier,
            quantity,
        });
    }

    if tail[1..] == ACK_SUFFIX {
        if let Some(action) = Action::from_opcode(tail[0]) {
            let identifier = DeviceIdentifier::from_bytes(raw_identifier)?;
            return Ok(Event::Expectation { identifier, action });
        }
    }

    if tail[0] == ALERT_OPCODE {
        let identifier = DeviceIdentifier::from_bytes(raw_identifier)?;
        let time = TimeValue::decode_with_offset([tail[1], tail[2]], offset)?;
        let quantity = QuantityValue::decode([tail[3], tail[4]])?;
        return Ok(Event::EmptyFeeder {
            identifier,
            time,
            quantity,
        });
    }

    Err(FeedSrvError::unknown_frame(frame))
}

/// Reduce `N >= 2` back-to-back copies of one identification frame to a single copy
fn collapse_repeated_identification(frame: &[u8]) -> &[u8] {
    if !frame.ends_with(&IDENTIFICATION_TAIL) {
        return frame;
    }
    let min_len = DEVICE_HEADER.len() + 1 + DEVICE_TAIL_LEN;
    for copies in 2..=frame.len() / min_len {
        if frame.len() % copies != 0 {
            continue;
        }
        let unit = &frame[..frame.len() / copies];
        if unit.starts_with(&DEVICE_HEADER)
            && unit.ends_with(&IDENTIFICATION_TAIL)
            && frame.chunks_exact(unit.len()).all(|chunk| chunk == unit)
        {
            return unit;
        }
    }
    frame
}

// ============================================================================
// Device-side frame builders
// ============================================================================

fn device_frame(identifier: &DeviceIdentifier, tail: [u8; DEVICE_TAIL_LEN]) -> Bytes {
    let mut buf =
        BytesMut::with_capacity(DEVICE_HEADER.len() + identifier.as_bytes().len() + DEVICE_TAIL_LEN);
    buf.put_slice(&DEVICE_HEADER);
    buf.put_slice(identifier.as_bytes());
    buf.put_slice(&tail);
    buf.freeze()
}

pub fn identification_frame(identifier: &DeviceIdentifier) -> Bytes {
    device_frame(identifier, IDENTIFICATION_TAIL)
}

pub fn manual_meal_frame(identifier: &DeviceIdentifier, quantity: QuantityValue) -> Bytes {
    let [q0, q1] = quantity.encode();
    let [p0, p1, p2] = MANUAL_MEAL_PREFIX;
    device_frame(identifier, [p0, p1, p2, q0, q1])
}

pub fn empty_feeder_frame(
    identifier: &DeviceIdentifier,
    time: TimeValue,
    quantity: QuantityValue,
    offset: TimeOffset,
) -> Bytes {
    let [t0, t1] = time.encode_with_offset(offset);
    let [q0, q1] = quantity.encode();
    device_frame(identifier, [ALERT_OPCODE, t0, t1, q0, q1])
}

pub fn acknowledgement_frame(identifier: &DeviceIdentifier, action: Action) -> Bytes {
    let [s0, s1, s2, s3] = ACK_SUFFIX;
    device_frame(identifier, [action.opcode(), s0, s1, s2, s3])
}
