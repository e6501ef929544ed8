#![forbid(unsafe_code)]

/// Two's complement of the 16-bit byte sum, rendered as four uppercase hex digits.
pub fn compute_checksum(bytes: &[u8]) -> String {
	let sum = bytes.iter().fold(0u16, |acc, b| acc.wrapping_add(u16::from(*b)));
	format!("{:04X}", 0u16.wrapping_sub(sum))
}

/// Compare a received checksum against the bytes it covers.
pub fn verify_checksum(covered: &[u8], received: &str) -> bool {
	compute_checksum(covered).eq_ignore_ascii_case(received)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn known_sc_status_vector() {
		assert_eq!(compute_checksum(b"9900302.00AY1AZ"), "FCA5");
	}

	#[test]
	fn verify_is_case_insensitive() {
		assert!(verify_checksum(b"9900302.00AY1AZ", "fca5"));
		assert!(!verify_checksum(b"9900302.00AY2AZ", "FCA5"));
	}

	#[test]
	fn empty_input_is_zero() {
		assert_eq!(compute_checksum(b""), "0000");
	}
}
