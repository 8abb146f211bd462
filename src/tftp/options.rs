use std::time::Duration;

use crate::tftp::consts;
use crate::tftp::error::OptionError;

/// An ordered, case-insensitive (on lookup) name/value list, exactly what a
/// request/OACK packet carries on the wire. Insertion keeps first-wins
/// semantics for a duplicate name, matching RFC 2347's "ill-formed" note.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options(Vec<(String, String)>);

impl Options {
	pub fn new() -> Self {
		Options(Vec::new())
	}

	pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
		let name = name.into();
		if self.get(&name).is_none() {
			self.0.push((name, value.into()));
		}
	}

	pub fn get(&self, name: &str) -> Option<&str> {
		self.0
			.iter()
			.find(|(k, _)| k.eq_ignore_ascii_case(name))
			.map(|(_, v)| v.as_str())
	}

	pub fn remove(&mut self, name: &str) -> Option<String> {
		let idx = self.0.iter().position(|(k, _)| k.eq_ignore_ascii_case(name))?;
		Some(self.0.remove(idx).1)
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
		self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
	}
}

/// Outcome of decoding one known option out of a raw `Options` map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionDecode<T> {
	/// The option was not present at all.
	Absent,
	/// The option was present but its value did not parse.
	Invalid,
	Present(T),
}

pub fn decode_block_size(opts: &Options) -> OptionDecode<u16> {
	match opts.get(consts::OPT_BLOCKSIZE_IDENT) {
		None => OptionDecode::Absent,
		Some(raw) => match raw.parse::<u16>() {
			Ok(v) if (consts::BLOCK_SIZE_MIN..=consts::BLOCK_SIZE_MAX).contains(&v) => OptionDecode::Present(v),
			_ => OptionDecode::Invalid,
		},
	}
}

pub fn decode_timeout(opts: &Options) -> OptionDecode<u8> {
	match opts.get(consts::OPT_TIMEOUT_IDENT) {
		None => OptionDecode::Absent,
		Some(raw) => match raw.parse::<u8>() {
			Ok(v) if (consts::TIMEOUT_MIN_SECS..=consts::TIMEOUT_MAX_SECS).contains(&v) => OptionDecode::Present(v),
			_ => OptionDecode::Invalid,
		},
	}
}

pub fn decode_transfer_size(opts: &Options) -> OptionDecode<u64> {
	match opts.get(consts::OPT_TRANSFERSIZE_IDENT) {
		None => OptionDecode::Absent,
		Some(raw) => match raw.parse::<u64>() {
			Ok(v) => OptionDecode::Present(v),
			Err(_) => OptionDecode::Invalid,
		},
	}
}

/// What an operation is configured to negotiate. `block_size`/`timeout` are
/// treated as ceilings when acting as a responder (the echoed value is the
/// smaller of what was proposed and this configured value) and as the value
/// to propose when acting as a requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionsPolicy {
	pub block_size: Option<u16>,
	pub timeout: Option<u8>,
	pub handle_transfer_size: bool,
}

impl Default for OptionsPolicy {
	fn default() -> Self {
		OptionsPolicy {
			block_size: None,
			timeout: None,
			handle_transfer_size: false,
		}
	}
}

/// The values an operation settles on after negotiation, independent of
/// whether they came from a default, a proposal, or an OACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedOptions {
	pub block_size: u16,
	pub timeout_secs: u8,
	pub transfer_size: Option<u64>,
}

impl Default for NegotiatedOptions {
	fn default() -> Self {
		NegotiatedOptions {
			block_size: consts::DEFAULT_BLOCK_SIZE,
			timeout_secs: consts::DEFAULT_TIMEOUT_SECS,
			transfer_size: None,
		}
	}
}

impl NegotiatedOptions {
	pub fn timeout(&self) -> Duration {
		Duration::from_secs(self.timeout_secs as u64)
	}
}

/// Builds the options a requester proposes in its RRQ/WRQ, per its policy.
/// `transfer_size_to_propose` is `Some(0)` for a read (ask the responder to
/// report the size) or `Some(actual_size)` for a write.
pub fn propose(policy: &OptionsPolicy, transfer_size_to_propose: Option<u64>) -> Options {
	let mut options = Options::new();
	if let Some(block_size) = policy.block_size {
		options.insert(consts::OPT_BLOCKSIZE_IDENT, block_size.to_string());
	}
	if let Some(timeout) = policy.timeout {
		options.insert(consts::OPT_TIMEOUT_IDENT, timeout.to_string());
	}
	if policy.handle_transfer_size {
		if let Some(size) = transfer_size_to_propose {
			options.insert(consts::OPT_TRANSFERSIZE_IDENT, size.to_string());
		}
	}
	options
}

/// Responder-side negotiation: decide the block size to echo, treating the
/// policy value as a ceiling. `None` means omit the option from the OACK.
pub fn negotiate_block_size(policy_max: Option<u16>, requested: OptionDecode<u16>) -> Option<u16> {
	match (policy_max, requested) {
		(Some(max), OptionDecode::Present(v)) => Some(v.min(max)),
		_ => None,
	}
}

/// Responder-side negotiation: echo the client's proposed timeout verbatim
/// only if it's within the configured ceiling.
pub fn negotiate_timeout(policy_ceiling: Option<u8>, requested: OptionDecode<u8>) -> Option<u8> {
	match (policy_ceiling, requested) {
		(Some(ceiling), OptionDecode::Present(v)) if v <= ceiling => Some(v),
		_ => None,
	}
}

/// Requester-side validation of an echoed block size: any echoed value that
/// wasn't proposed, or exceeds what was proposed, is a refusal.
pub fn validate_block_size_echo(proposed: Option<u16>, echoed: OptionDecode<u16>) -> Result<Option<u16>, OptionError> {
	match echoed {
		OptionDecode::Absent => Ok(None),
		OptionDecode::Invalid => Err(OptionError::InvalidValue(consts::OPT_BLOCKSIZE_IDENT.to_string())),
		OptionDecode::Present(v) => match proposed {
			None => Err(OptionError::Refused("blksize was not proposed".into())),
			Some(p) if v > p => Err(OptionError::Refused("blksize larger than proposed".into())),
			Some(_) => Ok(Some(v)),
		},
	}
}

/// Requester-side validation of an echoed timeout: the responder must echo
/// exactly the proposed value.
pub fn validate_timeout_echo(proposed: Option<u8>, echoed: OptionDecode<u8>) -> Result<Option<u8>, OptionError> {
	match echoed {
		OptionDecode::Absent => Ok(None),
		OptionDecode::Invalid => Err(OptionError::InvalidValue(consts::OPT_TIMEOUT_IDENT.to_string())),
		OptionDecode::Present(v) => match proposed {
			Some(p) if v == p => Ok(Some(v)),
			_ => Err(OptionError::Refused("timeout echoed value did not match proposal".into())),
		},
	}
}

/// Read-direction `tsize` validation: the client proposed 0 and accepts
/// whatever size the responder reports.
pub fn validate_transfer_size_echo_for_read(
	proposed: Option<u64>,
	echoed: OptionDecode<u64>,
) -> Result<Option<u64>, OptionError> {
	match echoed {
		OptionDecode::Absent => Ok(None),
		OptionDecode::Invalid => Err(OptionError::InvalidValue(consts::OPT_TRANSFERSIZE_IDENT.to_string())),
		OptionDecode::Present(v) => match proposed {
			None => Err(OptionError::Refused("tsize was not proposed".into())),
			Some(_) => Ok(Some(v)),
		},
	}
}

/// Write-direction `tsize` validation: the responder must echo exactly the
/// size the client proposed to send.
pub fn validate_transfer_size_echo_for_write(
	proposed: Option<u64>,
	echoed: OptionDecode<u64>,
) -> Result<Option<u64>, OptionError> {
	match echoed {
		OptionDecode::Absent => Ok(None),
		OptionDecode::Invalid => Err(OptionError::InvalidValue(consts::OPT_TRANSFERSIZE_IDENT.to_string())),
		OptionDecode::Present(v) => match proposed {
			Some(p) if v == p => Ok(Some(v)),
			_ => Err(OptionError::Refused("tsize echoed value did not match proposal".into())),
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn first_insert_wins_on_duplicate_name() {
		let mut opts = Options::new();
		opts.insert("blksize", "512");
		opts.insert("BLKSIZE", "9000");
		assert_eq!(opts.get("blksize"), Some("512"));
		assert_eq!(opts.len(), 1);
	}

	#[test]
	fn decode_block_size_rejects_out_of_range() {
		let mut opts = Options::new();
		opts.insert("blksize", "4");
		assert_eq!(decode_block_size(&opts), OptionDecode::Invalid);
	}

	#[test]
	fn negotiate_block_size_picks_the_smaller_value() {
		assert_eq!(negotiate_block_size(Some(1024), OptionDecode::Present(4096)), Some(1024));
		assert_eq!(negotiate_block_size(Some(4096), OptionDecode::Present(1024)), Some(1024));
		assert_eq!(negotiate_block_size(None, OptionDecode::Present(1024)), None);
	}

	#[test]
	fn negotiate_timeout_respects_ceiling() {
		assert_eq!(negotiate_timeout(Some(5), OptionDecode::Present(5)), Some(5));
		assert_eq!(negotiate_timeout(Some(5), OptionDecode::Present(6)), None);
	}

	#[test]
	fn validate_block_size_echo_rejects_unproposed_option() {
		assert!(validate_block_size_echo(None, OptionDecode::Present(1024)).is_err());
	}

	#[test]
	fn validate_block_size_echo_rejects_value_above_proposed() {
		assert!(validate_block_size_echo(Some(512), OptionDecode::Present(1024)).is_err());
	}

	#[test]
	fn validate_timeout_echo_requires_exact_match() {
		assert!(validate_timeout_echo(Some(3), OptionDecode::Present(4)).is_err());
		assert_eq!(validate_timeout_echo(Some(3), OptionDecode::Present(3)), Ok(Some(3)));
	}

	#[test]
	fn write_transfer_size_echo_must_match_exactly() {
		assert!(validate_transfer_size_echo_for_write(Some(100), OptionDecode::Present(99)).is_err());
		assert_eq!(
			validate_transfer_size_echo_for_write(Some(100), OptionDecode::Present(100)),
			Ok(Some(100))
		);
	}

	#[test]
	fn read_transfer_size_echo_accepts_any_reported_size() {
		assert_eq!(
			validate_transfer_size_echo_for_read(Some(0), OptionDecode::Present(123456)),
			Ok(Some(123456))
		);
	}
}
