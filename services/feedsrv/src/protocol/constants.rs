//! Fixed byte patterns of the feeder wire protocol

/// Every frame starts with this marker
pub const FRAME_MARKER: [u8; 2] = [0x9D, 0xA1];

/// Header of device→server frames (marker + 0x14), followed by the identifier
pub const DEVICE_HEADER: [u8; 3] = [0x9D, 0xA1, 0x14];

/// Length of the fixed tail following the identifier in device frames
pub const DEVICE_TAIL_LEN: usize = 5;

/// Longest identifier accepted by the frame reassembler
pub const MAX_IDENTIFIER_LEN: usize = 64;

// ============================================================================
// Device→server tails
// ============================================================================

/// Identification / handshake
pub const IDENTIFICATION_TAIL: [u8; DEVICE_TAIL_LEN] = [0x01, 0xD0, 0x01, 0x00, 0x00];

/// Alert opcode, followed by a 2-byte time and a 2-byte quantity
pub const ALERT_OPCODE: u8 = 0x21;

/// Manual meal: alert opcode with the fixed time word 0x0384
pub const MANUAL_MEAL_PREFIX: [u8; 3] = [0x21, 0x03, 0x84];

/// Common suffix of every acknowledgement tail, after the action opcode
pub const ACK_SUFFIX: [u8; 4] = [0xD0, 0xA1, 0x00, 0x00];

// ============================================================================
// Server→device headers
// ============================================================================

/// Time broadcast sent in reply to an identification
pub const TIME_BROADCAST_HEADER: [u8; 4] = [0x9D, 0xA1, 0x06, 0x01];

/// Set default quantity
pub const DEFAULT_QUANTITY_HEADER: [u8; 4] = [0x9D, 0xA1, 0x06, 0xC3];

/// Set meal plan; followed by the count byte and the slot bytes
pub const PLANNING_HEADER: [u8; 4] = [0x9D, 0xA1, 0x2D, 0xC4];

/// Feed now
pub const FEED_NOW_HEADER: [u8; 4] = [0x9D, 0xA1, 0x06, 0xA2];

// Action opcodes shared by commands and their acknowledgements
pub const OPCODE_DEFAULT_QUANTITY: u8 = 0xC3;
pub const OPCODE_PLANNING: u8 = 0xC4;
pub const OPCODE_FEED_NOW: u8 = 0xA2;

/// Port the feeders dial by default
pub const DEFAULT_PORT: u16 = 9999;
