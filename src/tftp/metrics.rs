use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::tftp::packet::PacketKind;

/// An optional, injectable observer of packet traffic. The default is to not
/// install one; every call site treats its absence as a no-op.
pub trait PacketSink: Send + Sync {
	fn on_sent(&self, kind: PacketKind);
	fn on_received(&self, kind: PacketKind);
	fn on_retransmit(&self);
}

pub type SharedPacketSink = Arc<dyn PacketSink>;

/// A plain in-process counter set, grounded on the original's packet
/// statistics singleton but never held as global state here — callers hand
/// an `Arc<PacketCounters>` to whichever operations or listener they want
/// counted.
#[derive(Debug, Default)]
pub struct PacketCounters {
	sent: [AtomicU64; 5],
	received: [AtomicU64; 5],
	retransmits: AtomicU64,
}

fn slot(kind: PacketKind) -> usize {
	match kind {
		PacketKind::Request => 0,
		PacketKind::Data => 1,
		PacketKind::Ack => 2,
		PacketKind::Error => 3,
		PacketKind::OAck => 4,
	}
}

impl PacketCounters {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn sent(&self, kind: PacketKind) -> u64 {
		self.sent[slot(kind)].load(Ordering::Relaxed)
	}

	pub fn received(&self, kind: PacketKind) -> u64 {
		self.received[slot(kind)].load(Ordering::Relaxed)
	}

	pub fn retransmits(&self) -> u64 {
		self.retransmits.load(Ordering::Relaxed)
	}
}

impl PacketSink for PacketCounters {
	fn on_sent(&self, kind: PacketKind) {
		self.sent[slot(kind)].fetch_add(1, Ordering::Relaxed);
	}

	fn on_received(&self, kind: PacketKind) {
		self.received[slot(kind)].fetch_add(1, Ordering::Relaxed);
	}

	fn on_retransmit(&self) {
		self.retransmits.fetch_add(1, Ordering::Relaxed);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn counts_are_tracked_per_kind() {
		let counters = PacketCounters::new();
		counters.on_sent(PacketKind::Data);
		counters.on_sent(PacketKind::Data);
		counters.on_received(PacketKind::Ack);
		counters.on_retransmit();

		assert_eq!(counters.sent(PacketKind::Data), 2);
		assert_eq!(counters.sent(PacketKind::Ack), 0);
		assert_eq!(counters.received(PacketKind::Ack), 1);
		assert_eq!(counters.retransmits(), 1);
	}
}
