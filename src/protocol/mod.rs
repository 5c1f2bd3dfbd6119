pub mod frame;

pub use frame::{Frame, FrameCodec, FrameError};

/// Size of the big-endian length prefix.
pub const LENGTH_FIELD_LEN: usize = 4;

/// Length prefix plus the one-byte type tag.
pub const HEADER_LEN: usize = LENGTH_FIELD_LEN + 1;

/// The single application frame type carried by the relay.
pub const MESSAGE_TYPE: u8 = 1;

/// Default upper bound for a whole frame, header included.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;
