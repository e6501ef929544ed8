#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{Command, TenantId};

/// One `{messageName, isSupported}` pair from a tenant document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedMessageFlag {
	pub message_name: String,
	pub is_supported: String,
}

impl SupportedMessageFlag {
	pub fn new(message_name: impl Into<String>, is_supported: impl Into<String>) -> Self {
		Self {
			message_name: message_name.into(),
			is_supported: is_supported.into(),
		}
	}
}

fn is_affirmative(v: &str) -> bool {
	matches!(v.trim().to_ascii_lowercase().as_str(), "y" | "yes" | "true" | "1")
}

/// Reduce `{name, flag}` pairs to the set of commands flagged as supported.
///
/// Unknown message names are skipped with a warning.
pub fn supported_messages(input: Option<&[SupportedMessageFlag]>) -> BTreeSet<Command> {
	let Some(input) = input else {
		return BTreeSet::new();
	};

	input
		.iter()
		.filter(|m| is_affirmative(&m.is_supported))
		.filter_map(|m| match m.message_name.parse::<Command>() {
			Ok(c) => Some(c),
			Err(e) => {
				warn!(name = %m.message_name, error = %e, "ignoring unknown supported message");
				None
			}
		})
		.collect()
}

/// Split a comma-separated status list, preserving order.
pub fn invalid_checkin_statuses_list(input: Option<&str>) -> Vec<String> {
	let Some(input) = input else {
		return Vec::new();
	};

	input
		.split(',')
		.map(str::trim)
		.filter(|s| !s.is_empty())
		.map(str::to_string)
		.collect()
}

/// ACS policy as it appears in the tenant document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AcsTenantConfigInput {
	pub status_update_ok: bool,
	pub offline_ok: bool,
	pub always_check_patron_password: bool,
	pub use_pin_for_patron_verification: bool,
	pub patron_password_verification_required: bool,
	pub invalid_checkin_statuses: Option<String>,
	pub supported_messages: Option<Vec<SupportedMessageFlag>>,
}

/// Per-tenant ACS policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcsTenantConfig {
	pub status_update_ok: bool,
	pub offline_ok: bool,
	pub always_check_patron_password: bool,
	pub use_pin_for_patron_verification: bool,
	pub patron_password_verification_required: bool,
	pub invalid_checkin_statuses: Vec<String>,
	pub supported_messages: BTreeSet<Command>,
}

impl AcsTenantConfig {
	pub fn from_input(input: &AcsTenantConfigInput) -> Self {
		Self {
			status_update_ok: input.status_update_ok,
			offline_ok: input.offline_ok,
			always_check_patron_password: input.always_check_patron_password,
			use_pin_for_patron_verification: input.use_pin_for_patron_verification,
			patron_password_verification_required: input.patron_password_verification_required,
			invalid_checkin_statuses: invalid_checkin_statuses_list(input.invalid_checkin_statuses.as_deref()),
			supported_messages: supported_messages(input.supported_messages.as_deref()),
		}
	}

	pub fn supports(&self, command: Command) -> bool {
		self.supported_messages.contains(&command)
	}
}

impl<'de> Deserialize<'de> for AcsTenantConfig {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let input = AcsTenantConfigInput::deserialize(deserializer)?;
		Ok(Self::from_input(&input))
	}
}

/// Self-check station settings reported in the ACS status answer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScStationConfig {
	pub retries_allowed: u16,
	/// Tenths of a second; `0` means no timeout.
	pub timeout_period: u16,
	pub checkin_ok: bool,
	pub checkout_ok: bool,
	pub acs_renewal_policy: bool,
	pub library_name: String,
	pub terminal_location: String,
}

impl Default for ScStationConfig {
	fn default() -> Self {
		Self {
			retries_allowed: 3,
			timeout_period: 100,
			checkin_ok: true,
			checkout_ok: true,
			acs_renewal_policy: false,
			library_name: String::new(),
			terminal_location: String::new(),
		}
	}
}

/// Wire-level settings applied once a tenant is bound to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
	pub error_detection_enabled: bool,
	pub field_delimiter: char,
	pub message_delimiter: char,
	pub close_on_end_session: bool,
}

impl Default for SessionSettings {
	fn default() -> Self {
		Self {
			error_detection_enabled: true,
			field_delimiter: '|',
			message_delimiter: '\r',
			close_on_end_session: false,
		}
	}
}

/// Everything the gateway knows about one tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TenantProfile {
	pub acs: AcsTenantConfig,
	/// Overrides the gateway's station defaults when present.
	pub station: Option<ScStationConfig>,
	pub session: SessionSettings,
}

impl TenantProfile {
	/// Shared empty profile returned for unknown tenants.
	pub fn empty() -> &'static TenantProfile {
		static EMPTY: OnceLock<TenantProfile> = OnceLock::new();
		EMPTY.get_or_init(TenantProfile::default)
	}
}

/// Process-wide snapshot of tenant policy, keyed by tenant id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TenantConfigDocument {
	pub tenants: BTreeMap<TenantId, TenantProfile>,
}

impl TenantConfigDocument {
	pub fn is_empty(&self) -> bool {
		self.tenants.is_empty()
	}

	pub fn contains(&self, tenant: &TenantId) -> bool {
		self.tenants.contains_key(tenant)
	}

	/// Profile for `tenant`, or the empty profile when the tenant is unknown.
	pub fn profile(&self, tenant: &TenantId) -> &TenantProfile {
		self.tenants.get(tenant).unwrap_or_else(|| TenantProfile::empty())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn supported_messages_absent_or_empty_is_empty_set() {
		assert!(supported_messages(None).is_empty());
		assert!(supported_messages(Some(&[][..])).is_empty());
	}

	#[test]
	fn supported_messages_keeps_only_affirmative() {
		let input = vec![
			SupportedMessageFlag::new("CHECKOUT", "Y"),
			SupportedMessageFlag::new("PATRON_INFORMATION", "N"),
		];
		let set = supported_messages(Some(input.as_slice()));
		assert_eq!(set, BTreeSet::from([Command::Checkout]));
	}

	#[test]
	fn supported_messages_skips_unknown_names() {
		let input = vec![
			SupportedMessageFlag::new("TELEPORT", "Y"),
			SupportedMessageFlag::new("checkin", "y"),
		];
		assert_eq!(supported_messages(Some(input.as_slice())), BTreeSet::from([Command::Checkin]));
	}

	#[test]
	fn invalid_checkin_statuses_parsing() {
		assert!(invalid_checkin_statuses_list(None).is_empty());
		assert!(invalid_checkin_statuses_list(Some("")).is_empty());
		assert_eq!(
			invalid_checkin_statuses_list(Some("status1,status2")),
			vec!["status1".to_string(), "status2".to_string()]
		);
	}

	#[test]
	fn tenant_document_parses_and_defaults() {
		let json = r#"{
			"tenants": {
				"diku": {
					"acs": {
						"statusUpdateOk": true,
						"invalidCheckinStatuses": "Lost,Missing",
						"supportedMessages": [
							{"messageName": "CHECKOUT", "isSupported": "Y"},
							{"messageName": "CHECKIN", "isSupported": "N"}
						]
					},
					"session": {"errorDetectionEnabled": false}
				}
			}
		}"#;

		let doc: TenantConfigDocument = serde_json::from_str(json).unwrap();
		let diku = TenantId::new("diku").unwrap();
		let profile = doc.profile(&diku);
		assert!(profile.acs.status_update_ok);
		assert_eq!(profile.acs.invalid_checkin_statuses, vec!["Lost", "Missing"]);
		assert!(profile.acs.supports(Command::Checkout));
		assert!(!profile.acs.supports(Command::Checkin));
		assert!(!profile.session.error_detection_enabled);
		assert_eq!(profile.session.field_delimiter, '|');
		assert!(profile.station.is_none());

		let unknown = TenantId::new("nobody").unwrap();
		assert_eq!(doc.profile(&unknown), TenantProfile::empty());
	}

	#[test]
	fn station_configs_compare_structurally() {
		let a = ScStationConfig {
			library_name: "Main".to_string(),
			..ScStationConfig::default()
		};
		let b = ScStationConfig {
			library_name: "Main".to_string(),
			..ScStationConfig::default()
		};
		assert_eq!(a, b);
	}
}
