// https://www.iana.org/assignments/protocol-numbers/protocol-numbers.xhtml
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum Protocol {
	ICMP,
	IGMP,
	IPv4,
	TCP,
	UDP,
	TRUNK1,
	TRUNK2,
	IPv6ICMP,
	IPv6NoNxt,
	IPv6Opts,
	IPv6Route,
	IPv6Frag,
	IPv6,
	UnSupport(u8)
}


impl From<u8> for Protocol {
	fn from(data: u8) -> Self {
		use Protocol::*;
		match data {
			1 => ICMP,
			2 => IGMP,
			4 => IPv4,
			6 => TCP,
			17 => UDP,
			23 => TRUNK1,
			24 => TRUNK2,
			43 => IPv6Route,
			44 => IPv6Frag,
			58 => IPv6ICMP,
			59 => IPv6NoNxt,
			60 => IPv6Opts,
			other => UnSupport(other)
		}
	}
}