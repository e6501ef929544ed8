#![forbid(unsafe_code)]

pub mod checksum;
pub mod framing;
pub mod layout;
pub mod message;

pub use checksum::{compute_checksum, verify_checksum};
pub use framing::{DEFAULT_MAX_FRAME_SIZE, Trailer, encode_frame, resend_request, try_split_frame};
pub use layout::{FixedField, fixed_layout};
pub use message::{FixedValue, FrameError, MalformedKind, Message, VariableField, parse};

/// Wire constants shared by requests and responses.
pub mod wire {
	/// Tag introducing the sequence digit.
	pub const SEQUENCE_TAG: &[u8; 2] = b"AY";
	/// Tag introducing the four hex digit checksum.
	pub const CHECKSUM_TAG: &[u8; 2] = b"AZ";
	/// ACS → SC request asking the terminal to retransmit.
	pub const REQUEST_SC_RESEND: &str = "96";
	/// Sequence numbers cycle over `0..SEQUENCE_MODULUS`.
	pub const SEQUENCE_MODULUS: u8 = 10;
	/// Default variable field terminator.
	pub const DEFAULT_FIELD_DELIMITER: u8 = b'|';
	/// Default message terminator.
	pub const DEFAULT_MESSAGE_DELIMITER: u8 = b'\r';
}
