#![forbid(unsafe_code)]

pub mod policy;

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use policy::{
	AcsTenantConfig, AcsTenantConfigInput, ScStationConfig, SessionSettings, SupportedMessageFlag, TenantConfigDocument,
	TenantProfile, invalid_checkin_statuses_list, supported_messages,
};

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown command: {0}")]
	UnknownCommand(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Tenant (library organization) identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
	/// Create a non-empty `TenantId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		let trimmed = id.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if trimmed.len() != id.len() {
			return Ok(Self(trimmed.to_string()));
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for TenantId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for TenantId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		TenantId::new(s.to_string())
	}
}

impl TryFrom<String> for TenantId {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		TenantId::new(value)
	}
}

impl From<TenantId> for String {
	fn from(value: TenantId) -> Self {
		value.0
	}
}

/// Gateway-assigned session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// SIP2 request messages understood by the gateway (SC → ACS).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
	BlockPatron,
	Checkin,
	Checkout,
	EndPatronSession,
	FeePaid,
	Hold,
	ItemInformation,
	ItemStatusUpdate,
	Login,
	PatronEnable,
	PatronInformation,
	PatronStatusRequest,
	Renew,
	RenewAll,
	RequestAcsResend,
	ScStatus,
}

impl Command {
	pub const ALL: [Command; 16] = [
		Command::BlockPatron,
		Command::Checkin,
		Command::Checkout,
		Command::EndPatronSession,
		Command::FeePaid,
		Command::Hold,
		Command::ItemInformation,
		Command::ItemStatusUpdate,
		Command::Login,
		Command::PatronEnable,
		Command::PatronInformation,
		Command::PatronStatusRequest,
		Command::Renew,
		Command::RenewAll,
		Command::RequestAcsResend,
		Command::ScStatus,
	];

	/// Two-character wire code of the request.
	pub const fn code(self) -> &'static str {
		match self {
			Command::BlockPatron => "01",
			Command::Checkin => "09",
			Command::Checkout => "11",
			Command::EndPatronSession => "35",
			Command::FeePaid => "37",
			Command::Hold => "15",
			Command::ItemInformation => "17",
			Command::ItemStatusUpdate => "19",
			Command::Login => "93",
			Command::PatronEnable => "25",
			Command::PatronInformation => "63",
			Command::PatronStatusRequest => "23",
			Command::Renew => "29",
			Command::RenewAll => "65",
			Command::RequestAcsResend => "97",
			Command::ScStatus => "99",
		}
	}

	/// Two-character wire code of the ACS answer, if the command has one.
	pub const fn response_code(self) -> Option<&'static str> {
		match self {
			Command::BlockPatron | Command::PatronStatusRequest => Some("24"),
			Command::Checkin => Some("10"),
			Command::Checkout => Some("12"),
			Command::EndPatronSession => Some("36"),
			Command::FeePaid => Some("38"),
			Command::Hold => Some("16"),
			Command::ItemInformation => Some("18"),
			Command::ItemStatusUpdate => Some("20"),
			Command::Login => Some("94"),
			Command::PatronEnable => Some("26"),
			Command::PatronInformation => Some("64"),
			Command::Renew => Some("30"),
			Command::RenewAll => Some("66"),
			Command::RequestAcsResend => None,
			Command::ScStatus => Some("98"),
		}
	}

	/// Stable configuration name (e.g. `PATRON_INFORMATION`).
	pub const fn as_str(self) -> &'static str {
		match self {
			Command::BlockPatron => "BLOCK_PATRON",
			Command::Checkin => "CHECKIN",
			Command::Checkout => "CHECKOUT",
			Command::EndPatronSession => "END_PATRON_SESSION",
			Command::FeePaid => "FEE_PAID",
			Command::Hold => "HOLD",
			Command::ItemInformation => "ITEM_INFORMATION",
			Command::ItemStatusUpdate => "ITEM_STATUS_UPDATE",
			Command::Login => "LOGIN",
			Command::PatronEnable => "PATRON_ENABLE",
			Command::PatronInformation => "PATRON_INFORMATION",
			Command::PatronStatusRequest => "PATRON_STATUS_REQUEST",
			Command::Renew => "RENEW",
			Command::RenewAll => "RENEW_ALL",
			Command::RequestAcsResend => "REQUEST_ACS_RESEND",
			Command::ScStatus => "SC_STATUS",
		}
	}

	/// Look up a command by its two-character wire code.
	pub fn from_code(code: &str) -> Option<Self> {
		Self::ALL.into_iter().find(|c| c.code() == code)
	}

	/// Commands that drive the session itself and are never gated by tenant policy.
	pub const fn is_session_control(self) -> bool {
		matches!(self, Command::Login | Command::ScStatus | Command::RequestAcsResend)
	}
}

impl fmt::Display for Command {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Command {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let upper = s.to_ascii_uppercase();
		Self::ALL
			.into_iter()
			.find(|c| c.as_str() == upper)
			.ok_or(ParseIdError::UnknownCommand(s.to_string()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn command_codes_roundtrip() {
		for c in Command::ALL {
			assert_eq!(Command::from_code(c.code()), Some(c));
		}
		assert_eq!(Command::from_code("XX"), None);
	}

	#[test]
	fn command_parse_and_display() {
		assert_eq!("checkout".parse::<Command>().unwrap(), Command::Checkout);
		assert_eq!("PATRON_INFORMATION".parse::<Command>().unwrap(), Command::PatronInformation);
		assert_eq!(Command::ScStatus.to_string(), "SC_STATUS");
		assert!(matches!("NOPE".parse::<Command>(), Err(ParseIdError::UnknownCommand(_))));
	}

	#[test]
	fn resend_request_has_no_response_code() {
		assert_eq!(Command::RequestAcsResend.response_code(), None);
		assert_eq!(Command::BlockPatron.response_code(), Some("24"));
	}

	#[test]
	fn rejects_empty_tenant_ids() {
		assert!(TenantId::new("").is_err());
		assert!("   ".parse::<TenantId>().is_err());
		assert_eq!(TenantId::new(" diku ").unwrap().as_str(), "diku");
	}

	#[test]
	fn tenant_id_deserializes_as_map_key() {
		let map: std::collections::BTreeMap<TenantId, u8> = serde_json::from_str(r#"{"diku": 1}"#).unwrap();
		assert_eq!(map.get(&TenantId::new("diku").unwrap()), Some(&1));
	}
}
