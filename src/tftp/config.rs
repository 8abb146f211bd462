use std::time::Duration;

use crate::tftp::consts;
use crate::tftp::options::OptionsPolicy;

/// How many times, and how often, an operation retransmits its last packet
/// before giving up with `TransferStatus::CommunicationError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
	pub timeout: Duration,
	pub retries: u16,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		RetryPolicy {
			timeout: Duration::from_secs(consts::DEFAULT_TIMEOUT_SECS as u64),
			retries: consts::DEFAULT_RETRIES,
		}
	}
}

/// Everything an `Operation` needs to know before it starts, independent of
/// which of the four roles it plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationConfig {
	pub retry: RetryPolicy,
	/// Whether a client-read or server-write lingers for 2x the (possibly
	/// renegotiated) retry timeout after its final ACK, absorbing one more
	/// retransmit of the peer's last DATA before reporting success.
	pub dally: bool,
	pub options: OptionsPolicy,
}

impl Default for OperationConfig {
	fn default() -> Self {
		OperationConfig {
			retry: RetryPolicy::default(),
			dally: false,
			options: OptionsPolicy::default(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn dally_is_disabled_by_default() {
		let cfg = OperationConfig::default();
		assert!(!cfg.dally);
	}
}
