//! Feeder wire protocol
//!
//! Validated domain values, the command/event codec and the frame
//! reassembler used on device sockets.

pub mod codec;
pub mod constants;
pub mod framing;
pub mod identifier;
pub mod plan;
pub mod quantity;
pub mod time;

pub use codec::{encode, recognize, Action, Command, Event};
pub use framing::FeederFrameCodec;
pub use identifier::DeviceIdentifier;
pub use plan::{MealPlan, MealSlot};
pub use quantity::QuantityValue;
pub use time::{TimeOffset, TimeValue};
