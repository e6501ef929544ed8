#![forbid(unsafe_code)]

use sip2_domain::Command;

/// Positional field preceding the variable fields of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedField {
	pub name: &'static str,
	pub width: usize,
}

const fn f(name: &'static str, width: usize) -> FixedField {
	FixedField { name, width }
}

const TRANSACTION_DATE: FixedField = f("transaction_date", 18);

const BLOCK_PATRON: &[FixedField] = &[f("card_retained", 1), TRANSACTION_DATE];
const CHECKIN: &[FixedField] = &[f("no_block", 1), TRANSACTION_DATE, f("return_date", 18)];
const CHECKOUT: &[FixedField] = &[
	f("sc_renewal_policy", 1),
	f("no_block", 1),
	TRANSACTION_DATE,
	f("nb_due_date", 18),
];
const FEE_PAID: &[FixedField] = &[
	TRANSACTION_DATE,
	f("fee_type", 2),
	f("payment_type", 2),
	f("currency_type", 3),
];
const HOLD: &[FixedField] = &[f("hold_mode", 1), TRANSACTION_DATE];
const DATE_ONLY: &[FixedField] = &[TRANSACTION_DATE];
const LOGIN: &[FixedField] = &[f("uid_algorithm", 1), f("pwd_algorithm", 1)];
const PATRON_INFORMATION: &[FixedField] = &[f("language", 3), TRANSACTION_DATE, f("summary", 10)];
const PATRON_STATUS: &[FixedField] = &[f("language", 3), TRANSACTION_DATE];
const RENEW: &[FixedField] = &[
	f("third_party_allowed", 1),
	f("no_block", 1),
	TRANSACTION_DATE,
	f("nb_due_date", 18),
];
const SC_STATUS: &[FixedField] = &[f("status_code", 1), f("max_print_width", 3), f("protocol_version", 4)];

/// Fixed fields of a request, in wire order.
pub fn fixed_layout(command: Command) -> &'static [FixedField] {
	match command {
		Command::BlockPatron => BLOCK_PATRON,
		Command::Checkin => CHECKIN,
		Command::Checkout => CHECKOUT,
		Command::EndPatronSession
		| Command::ItemInformation
		| Command::ItemStatusUpdate
		| Command::PatronEnable
		| Command::RenewAll => DATE_ONLY,
		Command::FeePaid => FEE_PAID,
		Command::Hold => HOLD,
		Command::Login => LOGIN,
		Command::PatronInformation => PATRON_INFORMATION,
		Command::PatronStatusRequest => PATRON_STATUS,
		Command::Renew => RENEW,
		Command::RequestAcsResend => &[],
		Command::ScStatus => SC_STATUS,
	}
}
