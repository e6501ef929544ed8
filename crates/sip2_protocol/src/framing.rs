#![forbid(unsafe_code)]

use bytes::{Bytes, BytesMut};

use crate::checksum::compute_checksum;
use crate::message::FrameError;
use crate::wire::{CHECKSUM_TAG, REQUEST_SC_RESEND, SEQUENCE_TAG};

/// Default maximum frame size (SIP2 messages are small; terminals rarely exceed 2 KiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024;

/// Error-detection trailer appended to an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trailer {
	None,
	Checksum,
	SequenceAndChecksum(u8),
}

/// Try to split one delimiter-terminated frame off the front of `buf`.
///
/// Leading `\n` bytes (the tail of a CRLF terminator) and empty frames are skipped.
/// Returns `Ok(None)` until a full frame is buffered.
pub fn try_split_frame(buf: &mut BytesMut, message_delimiter: u8, max_frame_size: usize) -> Result<Option<Bytes>, FrameError> {
	loop {
		let skip = buf
			.iter()
			.take_while(|b| **b == b'\n' || **b == message_delimiter)
			.count();
		if skip > 0 {
			let _ = buf.split_to(skip);
		}

		let Some(pos) = buf.iter().position(|b| *b == message_delimiter) else {
			if buf.len() > max_frame_size {
				return Err(FrameError::FrameTooLarge {
					len: buf.len(),
					max: max_frame_size,
				});
			}
			return Ok(None);
		};

		if pos > max_frame_size {
			return Err(FrameError::FrameTooLarge {
				len: pos,
				max: max_frame_size,
			});
		}

		let mut frame = buf.split_to(pos + 1);
		frame.truncate(pos);
		if frame.is_empty() {
			continue;
		}
		return Ok(Some(frame.freeze()));
	}
}

/// Append the error-detection trailer and message delimiter to a rendered body.
pub fn encode_frame(body: &str, trailer: Trailer, message_delimiter: u8) -> Vec<u8> {
	let mut out = Vec::with_capacity(body.len() + 10);
	out.extend_from_slice(body.as_bytes());

	match trailer {
		Trailer::None => {}
		Trailer::Checksum => {
			out.extend_from_slice(CHECKSUM_TAG);
			let checksum = compute_checksum(&out);
			out.extend_from_slice(checksum.as_bytes());
		}
		Trailer::SequenceAndChecksum(seq) => {
			out.extend_from_slice(SEQUENCE_TAG);
			out.push(b'0' + (seq % 10));
			out.extend_from_slice(CHECKSUM_TAG);
			let checksum = compute_checksum(&out);
			out.extend_from_slice(checksum.as_bytes());
		}
	}

	out.push(message_delimiter);
	out
}

/// Build the ACS → SC "please resend" message.
pub fn resend_request(error_detection: bool, message_delimiter: u8) -> Vec<u8> {
	let trailer = if error_detection { Trailer::Checksum } else { Trailer::None };
	encode_frame(REQUEST_SC_RESEND, trailer, message_delimiter)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::message::parse;

	#[test]
	fn split_waits_for_delimiter() {
		let mut buf = BytesMut::from(&b"9900302.00"[..]);
		assert!(try_split_frame(&mut buf, b'\r', DEFAULT_MAX_FRAME_SIZE).expect("ok").is_none());

		buf.extend_from_slice(b"AY1AZFCA5\r\n97AZFEF5\r");
		let first = try_split_frame(&mut buf, b'\r', DEFAULT_MAX_FRAME_SIZE)
			.expect("ok")
			.expect("some");
		assert_eq!(&first[..], b"9900302.00AY1AZFCA5");

		let second = try_split_frame(&mut buf, b'\r', DEFAULT_MAX_FRAME_SIZE)
			.expect("ok")
			.expect("some");
		assert_eq!(&second[..], b"97AZFEF5");
		assert!(buf.is_empty());
	}

	#[test]
	fn split_rejects_oversized_partial_frame() {
		let mut buf = BytesMut::from(&b"x".repeat(64)[..]);
		let err = try_split_frame(&mut buf, b'\r', 32).unwrap_err();
		assert!(matches!(err, FrameError::FrameTooLarge { .. }));
	}

	#[test]
	fn encoded_frame_parses_back_with_sequence() {
		let wire = encode_frame("9300CNuser|", Trailer::SequenceAndChecksum(4), b'\r');
		assert_eq!(wire.last(), Some(&b'\r'));
		assert!(wire.starts_with(b"9300CNuser|AY4AZ"));

		let msg = parse(&wire, b'|').expect("parse");
		assert_eq!(msg.code, "93");
		assert_eq!(msg.field("CN"), Some("user"));
		assert_eq!(msg.sequence, Some(4));
	}

	#[test]
	fn resend_request_shapes() {
		assert_eq!(resend_request(false, b'\r'), b"96\r".to_vec());
		assert_eq!(resend_request(true, b'\r'), b"96AZFEF6\r".to_vec());
	}
}
