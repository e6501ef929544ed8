#![forbid(unsafe_code)]

pub mod endpoint {
	use std::net::SocketAddr;

	/// Socket address for a `tcp://ip:port` (or bare `ip:port`) listen setting.
	///
	/// The host must be an IP literal; port 0 is refused.
	pub fn parse_listen_addr(raw: &str) -> Result<SocketAddr, String> {
		let raw = raw.trim();
		let addr = match raw.split_once("://") {
			Some(("tcp", addr)) => addr,
			Some((scheme, _)) => return Err(format!("listen {raw:?}: only tcp:// is supported, got {scheme}://")),
			None => raw,
		};

		let addr: SocketAddr = addr
			.parse()
			.map_err(|_| format!("listen {raw:?}: expected tcp://<ip>:<port>, e.g. tcp://0.0.0.0:6443 or tcp://[::1]:6443"))?;
		if addr.port() == 0 {
			return Err(format!("listen {raw:?}: port must be 1..=65535"));
		}
		Ok(addr)
	}

}

pub mod cidr {
	use std::net::IpAddr;
	use std::str::FromStr;

	/// IPv4 or IPv6 network in `addr/prefix` notation.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
	pub struct Cidr {
		network: IpAddr,
		prefix: u8,
	}

	impl Cidr {
		pub fn prefix(&self) -> u8 {
			self.prefix
		}

		pub fn contains(&self, addr: IpAddr) -> bool {
			let addr = match addr {
				IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
				v4 => v4,
			};

			match (self.network, addr) {
				(IpAddr::V4(net), IpAddr::V4(a)) => {
					let mask = mask_u32(self.prefix);
					u32::from(net) & mask == u32::from(a) & mask
				}
				(IpAddr::V6(net), IpAddr::V6(a)) => {
					let mask = mask_u128(self.prefix);
					u128::from(net) & mask == u128::from(a) & mask
				}
				_ => false,
			}
		}
	}

	fn mask_u32(prefix: u8) -> u32 {
		if prefix == 0 { 0 } else { u32::MAX << (32 - u32::from(prefix)) }
	}

	fn mask_u128(prefix: u8) -> u128 {
		if prefix == 0 { 0 } else { u128::MAX << (128 - u32::from(prefix)) }
	}

	impl FromStr for Cidr {
		type Err = String;

		fn from_str(s: &str) -> Result<Self, Self::Err> {
			let s = s.trim();
			let (addr_s, prefix_s) = match s.split_once('/') {
				Some((a, p)) => (a, Some(p)),
				None => (s, None),
			};

			let network: IpAddr = addr_s.parse().map_err(|_| format!("invalid network address: {s}"))?;
			let max = if network.is_ipv4() { 32 } else { 128 };
			let prefix = match prefix_s {
				Some(p) => p.trim().parse::<u8>().map_err(|_| format!("invalid prefix length: {s}"))?,
				None => max,
			};
			if prefix > max {
				return Err(format!("prefix length exceeds {max}: {s}"));
			}

			Ok(Self { network, prefix })
		}
	}

}
