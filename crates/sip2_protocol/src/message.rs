#![forbid(unsafe_code)]

use sip2_domain::Command;
use thiserror::Error;

use crate::checksum::{compute_checksum, verify_checksum};
use crate::layout::fixed_layout;
use crate::wire::{CHECKSUM_TAG, SEQUENCE_TAG};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("truncated field {field}: need={need} have={have}")]
	TruncatedField {
		field: &'static str,
		need: usize,
		have: usize,
	},

	#[error("variable field {tag:?} is not delimiter-terminated")]
	MissingDelimiter {
		tag: String,
	},

	#[error("checksum mismatch: expected={expected} received={received}")]
	BadChecksum {
		expected: String,
		received: String,
	},

	#[error("invalid sequence number: {0:?}")]
	InvalidSequence(char),
}

/// Separately countable malformed-message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MalformedKind {
	FrameTooLarge,
	TruncatedField,
	MissingDelimiter,
	BadChecksum,
	InvalidSequence,
}

impl MalformedKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			MalformedKind::FrameTooLarge => "frame_too_large",
			MalformedKind::TruncatedField => "truncated_field",
			MalformedKind::MissingDelimiter => "missing_delimiter",
			MalformedKind::BadChecksum => "bad_checksum",
			MalformedKind::InvalidSequence => "invalid_sequence",
		}
	}
}

impl FrameError {
	pub fn kind(&self) -> MalformedKind {
		match self {
			FrameError::FrameTooLarge { .. } => MalformedKind::FrameTooLarge,
			FrameError::TruncatedField { .. } => MalformedKind::TruncatedField,
			FrameError::MissingDelimiter { .. } => MalformedKind::MissingDelimiter,
			FrameError::BadChecksum { .. } => MalformedKind::BadChecksum,
			FrameError::InvalidSequence(_) => MalformedKind::InvalidSequence,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FixedValue {
	pub name: &'static str,
	pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct VariableField {
	pub tag: String,
	pub value: String,
}

/// One parsed SIP2 request.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Message {
	/// Raw two-character code, kept even when the command is unknown.
	pub code: String,
	pub command: Option<Command>,
	pub fixed: Vec<FixedValue>,
	pub variable: Vec<VariableField>,
	pub sequence: Option<u8>,
	pub checksum: Option<String>,
}

impl Message {
	/// First value for `tag`.
	pub fn field(&self, tag: &str) -> Option<&str> {
		self.variable.iter().find(|f| f.tag == tag).map(|f| f.value.as_str())
	}

	/// Every value for a repeatable `tag`, in wire order.
	pub fn fields<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a str> + 'a {
		self.variable.iter().filter(move |f| f.tag == tag).map(|f| f.value.as_str())
	}

	pub fn fixed(&self, name: &str) -> Option<&str> {
		self.fixed.iter().find(|f| f.name == name).map(|f| f.value.as_str())
	}
}

fn lossy(bytes: &[u8]) -> String {
	String::from_utf8_lossy(bytes).into_owned()
}

fn trim_terminators(mut raw: &[u8]) -> &[u8] {
	while let [rest @ .., b'\r' | b'\n'] = raw {
		raw = rest;
	}
	raw
}

struct SplitTrailer<'a> {
	body: &'a [u8],
	sequence: Option<u8>,
	checksum: Option<String>,
}

/// Strip and validate `AY<digit>AZ<hex4>` from the end of a frame.
///
/// The sequence is only recognized in front of a checksum.
fn split_trailer(raw: &[u8]) -> Result<SplitTrailer<'_>, FrameError> {
	let len = raw.len();
	if len < 2 + 6 || &raw[len - 6..len - 4] != CHECKSUM_TAG || !raw[len - 4..].iter().all(u8::is_ascii_hexdigit) {
		return Ok(SplitTrailer {
			body: raw,
			sequence: None,
			checksum: None,
		});
	}

	let covered = &raw[..len - 4];
	let received = lossy(&raw[len - 4..]);
	if !verify_checksum(covered, &received) {
		return Err(FrameError::BadChecksum {
			expected: compute_checksum(covered),
			received,
		});
	}

	let mut body = &raw[..len - 6];
	let mut sequence = None;
	let blen = body.len();
	if blen >= 2 + 3 && &body[blen - 3..blen - 1] == SEQUENCE_TAG {
		let digit = body[blen - 1];
		if !digit.is_ascii_digit() {
			return Err(FrameError::InvalidSequence(char::from(digit)));
		}
		sequence = Some(digit - b'0');
		body = &body[..blen - 3];
	}

	Ok(SplitTrailer {
		body,
		sequence,
		checksum: Some(received.to_ascii_uppercase()),
	})
}

fn parse_variable_fields(mut rest: &[u8], field_delimiter: u8) -> Result<Vec<VariableField>, FrameError> {
	let mut out = Vec::new();
	while !rest.is_empty() {
		if rest.len() < 2 {
			return Err(FrameError::MissingDelimiter { tag: lossy(rest) });
		}

		let tag = lossy(&rest[..2]);
		let Some(pos) = rest[2..].iter().position(|b| *b == field_delimiter) else {
			return Err(FrameError::MissingDelimiter { tag });
		};

		out.push(VariableField {
			tag,
			value: lossy(&rest[2..2 + pos]),
		});
		rest = &rest[2 + pos + 1..];
	}
	Ok(out)
}

/// Parse one frame (message delimiter optional) into a `Message`.
pub fn parse(raw: &[u8], field_delimiter: u8) -> Result<Message, FrameError> {
	let raw = trim_terminators(raw);
	if raw.len() < 2 {
		return Err(FrameError::TruncatedField {
			field: "command_code",
			need: 2,
			have: raw.len(),
		});
	}

	let trailer = split_trailer(raw)?;
	let code = lossy(&raw[..2]);
	let command = Command::from_code(&code);

	let mut rest = &trailer.body[2..];
	let layout = command.map(fixed_layout).unwrap_or(&[]);
	let mut fixed = Vec::with_capacity(layout.len());
	for field in layout {
		if rest.len() < field.width {
			return Err(FrameError::TruncatedField {
				field: field.name,
				need: field.width,
				have: rest.len(),
			});
		}
		fixed.push(FixedValue {
			name: field.name,
			value: lossy(&rest[..field.width]),
		});
		rest = &rest[field.width..];
	}

	let variable = parse_variable_fields(rest, field_delimiter)?;

	Ok(Message {
		code,
		command,
		fixed,
		variable,
		sequence: trailer.sequence,
		checksum: trailer.checksum,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_login_with_trailer() {
		let msg = parse(b"9300CNuser|COpass|CPloc|AY0AZF5F1\r", b'|').expect("parse");
		assert_eq!(msg.command, Some(Command::Login));
		assert_eq!(msg.fixed("uid_algorithm"), Some("0"));
		assert_eq!(msg.field("CN"), Some("user"));
		assert_eq!(msg.field("CO"), Some("pass"));
		assert_eq!(msg.field("CP"), Some("loc"));
		assert_eq!(msg.sequence, Some(0));
		assert_eq!(msg.checksum.as_deref(), Some("F5F1"));
	}

	#[test]
	fn parses_sc_status_fixed_only() {
		let msg = parse(b"9900302.00AY1AZFCA5", b'|').expect("parse");
		assert_eq!(msg.command, Some(Command::ScStatus));
		assert_eq!(msg.fixed("max_print_width"), Some("030"));
		assert_eq!(msg.fixed("protocol_version"), Some("2.00"));
		assert!(msg.variable.is_empty());
		assert_eq!(msg.sequence, Some(1));
	}

	#[test]
	fn parses_without_error_detection() {
		let msg = parse(b"9300CNuser|COpass|", b'|').expect("parse");
		assert_eq!(msg.sequence, None);
		assert_eq!(msg.checksum, None);
		assert_eq!(msg.variable.len(), 2);
	}

	#[test]
	fn rejects_unterminated_field() {
		let err = parse(b"9300CNuser|COpass", b'|').unwrap_err();
		assert_eq!(err, FrameError::MissingDelimiter { tag: "CO".to_string() });
		assert_eq!(err.kind(), MalformedKind::MissingDelimiter);
	}

	#[test]
	fn rejects_bad_checksum() {
		let err = parse(b"9900302.00AY1AZFCA6", b'|').unwrap_err();
		assert_eq!(err.kind(), MalformedKind::BadChecksum);
	}

	#[test]
	fn rejects_truncated_fixed_field() {
		let err = parse(b"99003", b'|').unwrap_err();
		match err {
			FrameError::TruncatedField { field, .. } => assert_eq!(field, "max_print_width"),
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[test]
	fn unknown_code_parses_without_fixed_fields() {
		let msg = parse(b"XXAAfoo|", b'|').expect("parse");
		assert_eq!(msg.command, None);
		assert_eq!(msg.code, "XX");
		assert_eq!(msg.field("AA"), Some("foo"));
	}

	#[test]
	fn repeated_tags_keep_wire_order() {
		let msg = parse(b"9300CNa|CNb|", b'|').expect("parse");
		assert_eq!(msg.fields("CN").collect::<Vec<_>>(), vec!["a", "b"]);
		assert_eq!(msg.field("CN"), Some("a"));
	}
}
