//! The transfer operation engine (client-read, client-write, server-read,
//! server-write). All four share one `Transport` (send/retry/TID-locking)
//! and the option-negotiation helpers below; what differs per role is only
//! the direction data flows and who speaks first, which is why this stays
//! one family of functions instead of four parallel class hierarchies.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, trace, warn};
use tokio::net::UdpSocket;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::tftp::config::{OperationConfig, RetryPolicy};
use crate::tftp::consts;
use crate::tftp::error::{OperationError, OptionError};
use crate::tftp::metrics::SharedPacketSink;
use crate::tftp::options::{self, NegotiatedOptions, OptionDecode, Options, OptionsPolicy};
use crate::tftp::packet::Packet;
use crate::tftp::{BlockNumber, ErrorCode, Mode, RequestKind};

/// How a completed (or aborted) operation is reported to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
	Successful,
	CommunicationError,
	RequestError,
	OptionNegotiationError,
	TransferError,
	Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorInfo {
	pub code: Option<ErrorCode>,
	pub message: String,
}

impl ErrorInfo {
	fn new(code: Option<ErrorCode>, message: impl Into<String>) -> Self {
		ErrorInfo {
			code,
			message: message.into(),
		}
	}
}

pub type Outcome = (TransferStatus, ErrorInfo);

/// Supplies outbound bytes for a client-write or server-read operation.
pub trait DataSource: Send {
	fn start(&mut self) -> io::Result<()> {
		Ok(())
	}
	fn send_data(&mut self, max_bytes: usize) -> io::Result<Vec<u8>>;
	fn requested_transfer_size(&mut self) -> Option<u64> {
		None
	}
	fn finished(&mut self, _status: TransferStatus) {}
}

/// Consumes inbound bytes for a client-read or server-write operation.
pub trait DataSink: Send {
	fn start(&mut self) -> io::Result<()> {
		Ok(())
	}
	fn received_data(&mut self, bytes: &[u8]) -> io::Result<()>;
	fn received_transfer_size(&mut self, _size: u64) -> bool {
		true
	}
	fn finished(&mut self, _status: TransferStatus) {}
}

/// Lets an application veto option negotiation after the known options have
/// been applied, inspecting whatever the peer sent (non-empty only if the
/// peer proposed options this crate doesn't otherwise recognize).
pub type OptionNegotiationHandler = Box<dyn FnMut(&Options) -> bool + Send>;

/// Cooperative cancellation for a running operation, shared between the
/// caller-facing `OperationHandle` and the spawned task.
#[derive(Clone)]
struct AbortHandle {
	token: CancellationToken,
	graceful: Arc<Mutex<Option<(ErrorCode, String)>>>,
}

impl AbortHandle {
	fn new() -> Self {
		AbortHandle {
			token: CancellationToken::new(),
			graceful: Arc::new(Mutex::new(None)),
		}
	}

	fn abort(&self) {
		self.token.cancel();
	}

	fn graceful_abort(&self, code: ErrorCode, message: String) {
		*self.graceful.lock().unwrap() = Some((code, message));
		self.token.cancel();
	}

	fn take_graceful(&self) -> Option<(ErrorCode, String)> {
		self.graceful.lock().unwrap().take()
	}
}

/// One UDP socket plus the transfer-identifier lock and retry/retransmit
/// bookkeeping that every role needs identically.
struct Transport {
	socket: UdpSocket,
	peer: Option<SocketAddr>,
}

impl Transport {
	fn new_unlocked(socket: UdpSocket) -> Self {
		Transport { socket, peer: None }
	}

	fn new_locked(socket: UdpSocket, peer: SocketAddr) -> Self {
		Transport {
			socket,
			peer: Some(peer),
		}
	}

	fn peer(&self) -> Option<SocketAddr> {
		self.peer
	}

	async fn send_raw(&self, pkt: &Packet, dest: SocketAddr, metrics: Option<&SharedPacketSink>) -> io::Result<()> {
		self.socket.send_to(&pkt.encode(), dest).await?;
		if let Some(m) = metrics {
			m.on_sent(pkt.kind());
		}
		Ok(())
	}

	/// Packets from an address other than the locked peer get an
	/// `UnknownTransferId` ERROR back and are otherwise ignored; packets
	/// that fail to decode are silently dropped. The peer locks to the
	/// source address of the first packet that decodes successfully.
	async fn receive_one(&mut self, buf: &mut [u8], metrics: Option<&SharedPacketSink>) -> io::Result<Packet> {
		loop {
			let (n, from) = self.socket.recv_from(buf).await?;
			if let Some(peer) = self.peer {
				if peer != from {
					let stray = Packet::error(ErrorCode::UnknownTransferId, "unknown transfer ID");
					let _ = self.send_raw(&stray, from, None).await;
					continue;
				}
			}
			match Packet::decode(&buf[..n]) {
				Ok(pkt) => {
					self.peer.get_or_insert(from);
					if let Some(m) = metrics {
						m.on_received(pkt.kind());
					}
					return Ok(pkt);
				}
				Err(_) => continue,
			}
		}
	}

	async fn send_and_wait(
		&mut self,
		pkt: &Packet,
		fallback_target: SocketAddr,
		retry: RetryPolicy,
		metrics: Option<&SharedPacketSink>,
	) -> Result<Packet, OperationError> {
		let dest = self.peer.unwrap_or(fallback_target);
		self.send_raw(pkt, dest, metrics).await?;
		self.wait_and_retry(pkt, fallback_target, retry, metrics).await
	}

	/// Waits for a reply, retransmitting `retransmit_pkt` on every timeout
	/// up to the retry budget. Used both by `send_and_wait` (where the
	/// first transmission already happened) and by the Sorcerer's
	/// Apprentice re-arm paths, where the caller deliberately sent nothing
	/// new but still owes a retransmit of its last packet if the peer
	/// never saw it.
	async fn wait_and_retry(
		&mut self,
		retransmit_pkt: &Packet,
		fallback_target: SocketAddr,
		retry: RetryPolicy,
		metrics: Option<&SharedPacketSink>,
	) -> Result<Packet, OperationError> {
		let dest = self.peer.unwrap_or(fallback_target);
		let mut buf = vec![0u8; consts::MAX_DATAGRAM_SIZE];
		let mut transmitted: u16 = 1;
		loop {
			match time::timeout(retry.timeout, self.receive_one(&mut buf, metrics)).await {
				Ok(Ok(reply)) => return Ok(reply),
				Ok(Err(e)) => return Err(e.into()),
				Err(_elapsed) => {
					if transmitted > retry.retries {
						warn!("giving up on {} after {} attempts", dest, transmitted);
						return Err(OperationError::RetriesExhausted);
					}
					trace!("timeout waiting on {}, retransmitting (attempt {})", dest, transmitted + 1);
					if let Some(m) = metrics {
						m.on_retransmit();
					}
					let dest = self.peer.unwrap_or(fallback_target);
					self.send_raw(retransmit_pkt, dest, metrics).await?;
					transmitted += 1;
				}
			}
		}
	}

	async fn send_only(&self, pkt: &Packet, fallback_target: SocketAddr, metrics: Option<&SharedPacketSink>) -> io::Result<()> {
		let dest = self.peer.unwrap_or(fallback_target);
		self.send_raw(pkt, dest, metrics).await
	}

	/// Waits out the post-transfer quiet period. Anything that arrives is
	/// almost always the peer's final DATA retransmitted because it never
	/// saw our last ACK; re-send that ACK and re-enter the wait. Silence
	/// for the whole window means the peer saw the last reply.
	async fn dally(&mut self, duration: Duration, last_ack: &Packet, fallback_target: SocketAddr, metrics: Option<&SharedPacketSink>) {
		let mut buf = vec![0u8; consts::MAX_DATAGRAM_SIZE];
		loop {
			match time::timeout(duration, self.receive_one(&mut buf, metrics)).await {
				Ok(Ok(_pkt)) => {
					let dest = self.peer.unwrap_or(fallback_target);
					let _ = self.send_raw(last_ack, dest, metrics).await;
				}
				_ => return,
			}
		}
	}
}

enum Interrupted {
	Aborted,
	Failed(OperationError),
}

async fn exchange(
	transport: &mut Transport,
	pkt: &Packet,
	remote: SocketAddr,
	retry: RetryPolicy,
	metrics: Option<&SharedPacketSink>,
	abort: &AbortHandle,
) -> Result<Packet, Interrupted> {
	tokio::select! {
		biased;
		_ = abort.token.cancelled() => Err(Interrupted::Aborted),
		res = transport.send_and_wait(pkt, remote, retry, metrics) => res.map_err(Interrupted::Failed),
	}
}

async fn on_aborted(transport: &Transport, remote: SocketAddr, abort: &AbortHandle, metrics: Option<&SharedPacketSink>) -> Outcome {
	match abort.take_graceful() {
		Some((code, message)) => {
			if transport.peer().is_some() {
				debug!("graceful abort of transfer with {}: {} ({})", remote, code, message);
				let pkt = Packet::error(code, message.clone());
				let _ = transport.send_only(&pkt, remote, metrics).await;
			} else {
				debug!("abort of transfer with {} before any packet was observed, not sending ERROR", remote);
			}
			(TransferStatus::Aborted, ErrorInfo::new(Some(code), message))
		}
		None => {
			debug!("hard abort of transfer with {}", remote);
			(TransferStatus::Aborted, ErrorInfo::default())
		}
	}
}

async fn refuse(transport: &Transport, remote: SocketAddr, code: ErrorCode, message: &str, metrics: Option<&SharedPacketSink>) {
	let pkt = Packet::error(code, message);
	let _ = transport.send_only(&pkt, remote, metrics).await;
}

/// Requester-side validation of an OACK: applies the three known options
/// and rejects anything the responder echoed that wasn't proposed.
fn validate_oack_as_requester(
	policy: &OptionsPolicy,
	responded: &Options,
	transfer_size_proposed: Option<u64>,
	direction_is_read: bool,
) -> Result<NegotiatedOptions, OptionError> {
	let mut negotiated = NegotiatedOptions::default();

	if let Some(bs) = options::validate_block_size_echo(policy.block_size, options::decode_block_size(responded))? {
		negotiated.block_size = bs;
	}
	if let Some(t) = options::validate_timeout_echo(policy.timeout, options::decode_timeout(responded))? {
		negotiated.timeout_secs = t;
	}

	let tsize_echo = options::decode_transfer_size(responded);
	negotiated.transfer_size = if direction_is_read {
		options::validate_transfer_size_echo_for_read(transfer_size_proposed, tsize_echo)?
	} else {
		options::validate_transfer_size_echo_for_write(transfer_size_proposed, tsize_echo)?
	};

	let mut remaining = responded.clone();
	remaining.remove(consts::OPT_BLOCKSIZE_IDENT);
	remaining.remove(consts::OPT_TIMEOUT_IDENT);
	remaining.remove(consts::OPT_TRANSFERSIZE_IDENT);
	if !remaining.is_empty() {
		return Err(OptionError::Refused(
			"responder's option acknowledgement named an option that was never proposed".into(),
		));
	}

	Ok(negotiated)
}

/// Responder-side negotiation of block size and timeout; `tsize` is left to
/// the caller since its handling differs between read and write.
fn negotiate_known_options(policy: &OptionsPolicy, requested: &Options) -> (Options, NegotiatedOptions) {
	let mut oack = Options::new();
	let mut negotiated = NegotiatedOptions::default();

	if let Some(bs) = options::negotiate_block_size(policy.block_size, options::decode_block_size(requested)) {
		oack.insert(consts::OPT_BLOCKSIZE_IDENT, bs.to_string());
		negotiated.block_size = bs;
	}
	if let Some(t) = options::negotiate_timeout(policy.timeout, options::decode_timeout(requested)) {
		oack.insert(consts::OPT_TIMEOUT_IDENT, t.to_string());
		negotiated.timeout_secs = t;
	}

	(oack, negotiated)
}

fn decode_requested_transfer_size(policy: &OptionsPolicy, requested: &Options) -> OptionDecode<u64> {
	if policy.handle_transfer_size {
		options::decode_transfer_size(requested)
	} else {
		OptionDecode::Absent
	}
}

// ---------------------------------------------------------------------
// client-read (RRQ)
// ---------------------------------------------------------------------

/// Drives a client-side read: the client receives DATA into `sink`.
pub async fn run_client_read(
	socket: UdpSocket,
	remote: SocketAddr,
	filename: String,
	mode: Mode,
	config: OperationConfig,
	mut sink: Box<dyn DataSink>,
	mut option_handler: Option<OptionNegotiationHandler>,
	abort: AbortHandleToken,
	metrics: Option<SharedPacketSink>,
) -> Outcome {
	let abort = abort.0;
	if let Err(e) = sink.start() {
		return (TransferStatus::RequestError, ErrorInfo::new(None, e.to_string()));
	}

	let proposed = options::propose(&config.options, config.options.handle_transfer_size.then_some(0));
	let request = Packet::request(RequestKind::Rrq, filename, mode, proposed);
	let mut transport = Transport::new_unlocked(socket);
	let mut negotiated = NegotiatedOptions::default();
	let mut retry = config.retry;
	let mut oack_received = false;
	let mut last_block = BlockNumber::ZERO;

	macro_rules! finish {
		($status:expr, $info:expr) => {{
			let status = $status;
			sink.finished(status);
			return (status, $info);
		}};
	}

	let mut pending = match exchange(&mut transport, &request, remote, retry, metrics.as_ref(), &abort).await {
		Ok(p) => p,
		Err(Interrupted::Aborted) => {
			let outcome = on_aborted(&transport, remote, &abort, metrics.as_ref()).await;
			finish!(outcome.0, outcome.1);
		}
		Err(Interrupted::Failed(e)) => finish!(TransferStatus::CommunicationError, ErrorInfo::new(None, e.to_string())),
	};

	loop {
		match pending {
			Packet::OAck(oack) => {
				if oack_received || last_block != BlockNumber::ZERO {
					refuse(&transport, remote, ErrorCode::IllegalTftpOperation, "option acknowledgement not expected", metrics.as_ref()).await;
					finish!(
						TransferStatus::TransferError,
						ErrorInfo::new(Some(ErrorCode::IllegalTftpOperation), "option acknowledgement not expected")
					);
				}
				if oack.options.is_empty() {
					refuse(&transport, remote, ErrorCode::IllegalTftpOperation, "empty option acknowledgement", metrics.as_ref()).await;
					finish!(
						TransferStatus::TransferError,
						ErrorInfo::new(Some(ErrorCode::IllegalTftpOperation), "empty option acknowledgement")
					);
				}
				match validate_oack_as_requester(&config.options, &oack.options, Some(0), true) {
					Ok(n) => negotiated = n,
					Err(e) => {
						refuse(&transport, remote, ErrorCode::TftpOptionRefused, &e.to_string(), metrics.as_ref()).await;
						finish!(TransferStatus::OptionNegotiationError, ErrorInfo::new(Some(ErrorCode::TftpOptionRefused), e.to_string()));
					}
				}
				if let Some(handler) = option_handler.as_mut() {
					if !handler(&oack.options) {
						refuse(&transport, remote, ErrorCode::TftpOptionRefused, "rejected by application", metrics.as_ref()).await;
						finish!(
							TransferStatus::OptionNegotiationError,
							ErrorInfo::new(Some(ErrorCode::TftpOptionRefused), "rejected by application")
						);
					}
				}
				if let Some(size) = negotiated.transfer_size {
					if !sink.received_transfer_size(size) {
						refuse(&transport, remote, ErrorCode::DiskFullOrAllocationExceeds, "transfer size refused", metrics.as_ref()).await;
						finish!(
							TransferStatus::TransferError,
							ErrorInfo::new(Some(ErrorCode::DiskFullOrAllocationExceeds), "transfer size refused")
						);
					}
				}
				retry.timeout = Duration::from_secs(negotiated.timeout_secs as u64);
				oack_received = true;
				let ack0 = Packet::ack(BlockNumber::ZERO);
				pending = match exchange(&mut transport, &ack0, remote, retry, metrics.as_ref(), &abort).await {
					Ok(p) => p,
					Err(Interrupted::Aborted) => {
						let outcome = on_aborted(&transport, remote, &abort, metrics.as_ref()).await;
						finish!(outcome.0, outcome.1);
					}
					Err(Interrupted::Failed(e)) => finish!(TransferStatus::CommunicationError, ErrorInfo::new(None, e.to_string())),
				};
			}
			Packet::Data(data) => {
				if data.block == last_block && last_block != BlockNumber::ZERO {
					let ack = Packet::ack(last_block);
					pending = match exchange(&mut transport, &ack, remote, retry, metrics.as_ref(), &abort).await {
						Ok(p) => p,
						Err(Interrupted::Aborted) => {
							let outcome = on_aborted(&transport, remote, &abort, metrics.as_ref()).await;
							finish!(outcome.0, outcome.1);
						}
						Err(Interrupted::Failed(e)) => finish!(TransferStatus::CommunicationError, ErrorInfo::new(None, e.to_string())),
					};
					continue;
				}
				if data.block != last_block.next() {
					refuse(&transport, remote, ErrorCode::IllegalTftpOperation, "block number not expected", metrics.as_ref()).await;
					finish!(
						TransferStatus::TransferError,
						ErrorInfo::new(Some(ErrorCode::IllegalTftpOperation), "block number not expected")
					);
				}
				if data.data.len() > negotiated.block_size as usize {
					refuse(&transport, remote, ErrorCode::IllegalTftpOperation, "too much data", metrics.as_ref()).await;
					finish!(TransferStatus::TransferError, ErrorInfo::new(Some(ErrorCode::IllegalTftpOperation), "too much data"));
				}
				if data.block == BlockNumber::new(1) && !oack_received {
					if let Some(handler) = option_handler.as_mut() {
						if !handler(&Options::new()) {
							refuse(&transport, remote, ErrorCode::TftpOptionRefused, "rejected by application", metrics.as_ref()).await;
							finish!(
								TransferStatus::OptionNegotiationError,
								ErrorInfo::new(Some(ErrorCode::TftpOptionRefused), "rejected by application")
							);
						}
					}
				}
				let short = data.data.len() < negotiated.block_size as usize;
				if let Err(e) = sink.received_data(&data.data) {
					refuse(&transport, remote, ErrorCode::AccessViolation, &e.to_string(), metrics.as_ref()).await;
					finish!(TransferStatus::TransferError, ErrorInfo::new(Some(ErrorCode::AccessViolation), e.to_string()));
				}
				last_block = data.block;
				let ack = Packet::ack(last_block);
				if short {
					let _ = transport.send_only(&ack, remote, metrics.as_ref()).await;
					if config.dally {
						transport.dally(retry.timeout * 2, &ack, remote, metrics.as_ref()).await;
					}
					finish!(TransferStatus::Successful, ErrorInfo::default());
				}
				pending = match exchange(&mut transport, &ack, remote, retry, metrics.as_ref(), &abort).await {
					Ok(p) => p,
					Err(Interrupted::Aborted) => {
						let outcome = on_aborted(&transport, remote, &abort, metrics.as_ref()).await;
						finish!(outcome.0, outcome.1);
					}
					Err(Interrupted::Failed(e)) => finish!(TransferStatus::CommunicationError, ErrorInfo::new(None, e.to_string())),
				};
			}
			Packet::Ack(_) => {
				refuse(&transport, remote, ErrorCode::IllegalTftpOperation, "ACK not expected", metrics.as_ref()).await;
				finish!(TransferStatus::TransferError, ErrorInfo::new(Some(ErrorCode::IllegalTftpOperation), "ACK not expected"));
			}
			Packet::Error(err) => {
				finish!(TransferStatus::TransferError, ErrorInfo::new(Some(err.code), err.message));
			}
			Packet::Request(_) => {
				refuse(&transport, remote, ErrorCode::IllegalTftpOperation, "request not expected", metrics.as_ref()).await;
				finish!(TransferStatus::TransferError, ErrorInfo::new(Some(ErrorCode::IllegalTftpOperation), "request not expected"));
			}
		}
	}
}

/// Re-arms a receive after a Sorcerer's Apprentice Syndrome duplicate was
/// deliberately not answered with fresh data: nothing new was sent, but the
/// peer may still be waiting on a reply it never received, so a timeout
/// here retransmits `retransmit_pkt` (the last packet genuinely sent) up to
/// the normal retry budget rather than failing on the first missed timer.
async fn exchange_retransmitting(
	transport: &mut Transport,
	retransmit_pkt: &Packet,
	remote: SocketAddr,
	retry: RetryPolicy,
	metrics: Option<&SharedPacketSink>,
	abort: &AbortHandle,
) -> Result<Packet, Interrupted> {
	tokio::select! {
		biased;
		_ = abort.token.cancelled() => Err(Interrupted::Aborted),
		res = transport.wait_and_retry(retransmit_pkt, remote, retry, metrics) => res.map_err(Interrupted::Failed),
	}
}

// ---------------------------------------------------------------------
// client-write (WRQ)
// ---------------------------------------------------------------------

/// Drives a client-side write: the client sends DATA pulled from `source`.
pub async fn run_client_write(
	socket: UdpSocket,
	remote: SocketAddr,
	filename: String,
	mode: Mode,
	config: OperationConfig,
	mut source: Box<dyn DataSource>,
	mut option_handler: Option<OptionNegotiationHandler>,
	abort: AbortHandleToken,
	metrics: Option<SharedPacketSink>,
) -> Outcome {
	let abort = abort.0;
	if let Err(e) = source.start() {
		return (TransferStatus::RequestError, ErrorInfo::new(None, e.to_string()));
	}

	let transfer_size = if config.options.handle_transfer_size { source.requested_transfer_size() } else { None };
	let proposed = options::propose(&config.options, transfer_size);
	let request = Packet::request(RequestKind::Wrq, filename, mode, proposed);
	let mut transport = Transport::new_unlocked(socket);
	let mut negotiated = NegotiatedOptions::default();
	let mut retry = config.retry;
	let mut last_sent_block = BlockNumber::ZERO;
	let mut last_acked_block: Option<BlockNumber> = None;
	let mut last_block_was_short = false;
	let mut last_sent_packet: Packet;

	macro_rules! finish {
		($status:expr, $info:expr) => {{
			let status = $status;
			source.finished(status);
			return (status, $info);
		}};
	}
	macro_rules! send_and_wait_or_finish {
		($pkt:expr) => {{
			let outgoing = $pkt;
			last_sent_packet = outgoing.clone();
			match exchange(&mut transport, &outgoing, remote, retry, metrics.as_ref(), &abort).await {
				Ok(p) => p,
				Err(Interrupted::Aborted) => {
					let outcome = on_aborted(&transport, remote, &abort, metrics.as_ref()).await;
					finish!(outcome.0, outcome.1);
				}
				Err(Interrupted::Failed(e)) => finish!(TransferStatus::CommunicationError, ErrorInfo::new(None, e.to_string())),
			}
		}};
	}

	let mut pending = send_and_wait_or_finish!(request);
	let mut oack_received = false;

	loop {
		match pending {
			Packet::OAck(oack) => {
				if oack_received || last_acked_block.is_some() {
					refuse(&transport, remote, ErrorCode::IllegalTftpOperation, "option acknowledgement not expected", metrics.as_ref()).await;
					finish!(
						TransferStatus::TransferError,
						ErrorInfo::new(Some(ErrorCode::IllegalTftpOperation), "option acknowledgement not expected")
					);
				}
				if oack.options.is_empty() {
					refuse(&transport, remote, ErrorCode::IllegalTftpOperation, "empty option acknowledgement", metrics.as_ref()).await;
					finish!(
						TransferStatus::TransferError,
						ErrorInfo::new(Some(ErrorCode::IllegalTftpOperation), "empty option acknowledgement")
					);
				}
				match validate_oack_as_requester(&config.options, &oack.options, transfer_size, false) {
					Ok(n) => negotiated = n,
					Err(e) => {
						refuse(&transport, remote, ErrorCode::TftpOptionRefused, &e.to_string(), metrics.as_ref()).await;
						finish!(TransferStatus::OptionNegotiationError, ErrorInfo::new(Some(ErrorCode::TftpOptionRefused), e.to_string()));
					}
				}
				if let Some(handler) = option_handler.as_mut() {
					if !handler(&oack.options) {
						refuse(&transport, remote, ErrorCode::TftpOptionRefused, "rejected by application", metrics.as_ref()).await;
						finish!(
							TransferStatus::OptionNegotiationError,
							ErrorInfo::new(Some(ErrorCode::TftpOptionRefused), "rejected by application")
						);
					}
				}
				retry.timeout = Duration::from_secs(negotiated.timeout_secs as u64);
				oack_received = true;
				last_acked_block = Some(BlockNumber::ZERO);
				last_sent_block = BlockNumber::ZERO;
				let (next_pkt, short) = match build_data_packet(&mut *source, last_sent_block.next(), negotiated.block_size) {
					Ok(r) => r,
					Err(e) => {
						refuse(&transport, remote, ErrorCode::AccessViolation, &e.to_string(), metrics.as_ref()).await;
						finish!(TransferStatus::TransferError, ErrorInfo::new(Some(ErrorCode::AccessViolation), e.to_string()));
					}
				};
				last_sent_block = last_sent_block.next();
				last_block_was_short = short;
				pending = send_and_wait_or_finish!(next_pkt);
			}
			Packet::Ack(ack) => {
				if last_acked_block == Some(ack.block) {
					// Sorcerer's Apprentice Syndrome: do not resend new data,
					// but the peer may still be waiting on the last packet
					// we sent, so a further timeout here still retransmits it.
					pending = match exchange_retransmitting(&mut transport, &last_sent_packet, remote, retry, metrics.as_ref(), &abort).await {
						Ok(p) => p,
						Err(Interrupted::Aborted) => {
							let outcome = on_aborted(&transport, remote, &abort, metrics.as_ref()).await;
							finish!(outcome.0, outcome.1);
						}
						Err(Interrupted::Failed(e)) => finish!(TransferStatus::CommunicationError, ErrorInfo::new(None, e.to_string())),
					};
					continue;
				}
				if ack.block != last_sent_block {
					refuse(&transport, remote, ErrorCode::IllegalTftpOperation, "wrong block number", metrics.as_ref()).await;
					finish!(TransferStatus::TransferError, ErrorInfo::new(Some(ErrorCode::IllegalTftpOperation), "wrong block number"));
				}
				last_acked_block = Some(ack.block);
				if ack.block == BlockNumber::ZERO && !oack_received {
					if let Some(handler) = option_handler.as_mut() {
						if !handler(&Options::new()) {
							refuse(&transport, remote, ErrorCode::TftpOptionRefused, "rejected by application", metrics.as_ref()).await;
							finish!(
								TransferStatus::OptionNegotiationError,
								ErrorInfo::new(Some(ErrorCode::TftpOptionRefused), "rejected by application")
							);
						}
					}
				}
				if last_block_was_short {
					finish!(TransferStatus::Successful, ErrorInfo::default());
				}
				let (next_pkt, short) = match build_data_packet(&mut *source, last_sent_block.next(), negotiated.block_size) {
					Ok(r) => r,
					Err(e) => {
						refuse(&transport, remote, ErrorCode::AccessViolation, &e.to_string(), metrics.as_ref()).await;
						finish!(TransferStatus::TransferError, ErrorInfo::new(Some(ErrorCode::AccessViolation), e.to_string()));
					}
				};
				last_sent_block = last_sent_block.next();
				last_block_was_short = short;
				pending = send_and_wait_or_finish!(next_pkt);
			}
			Packet::Data(_) => {
				refuse(&transport, remote, ErrorCode::IllegalTftpOperation, "DATA not expected", metrics.as_ref()).await;
				finish!(TransferStatus::TransferError, ErrorInfo::new(Some(ErrorCode::IllegalTftpOperation), "DATA not expected"));
			}
			Packet::Error(err) => {
				finish!(TransferStatus::TransferError, ErrorInfo::new(Some(err.code), err.message));
			}
			Packet::Request(_) => {
				refuse(&transport, remote, ErrorCode::IllegalTftpOperation, "request not expected", metrics.as_ref()).await;
				finish!(TransferStatus::TransferError, ErrorInfo::new(Some(ErrorCode::IllegalTftpOperation), "request not expected"));
			}
		}
	}
}

fn build_data_packet(source: &mut dyn DataSource, block: BlockNumber, block_size: u16) -> io::Result<(Packet, bool)> {
	let bytes = source.send_data(block_size as usize)?;
	let short = bytes.len() < block_size as usize;
	Ok((Packet::data(block, bytes), short))
}

// ---------------------------------------------------------------------
// server-read (responds to RRQ)
// ---------------------------------------------------------------------

/// Drives a server-side read: the server sends DATA pulled from `source`.
/// `requested` is the RRQ already decoded by the listener; `socket` is a
/// fresh, unbound-to-any-fixed-port socket dedicated to this transfer.
pub async fn run_server_read(
	socket: UdpSocket,
	client: SocketAddr,
	requested: Options,
	config: OperationConfig,
	mut source: Box<dyn DataSource>,
	abort: AbortHandleToken,
	metrics: Option<SharedPacketSink>,
) -> Outcome {
	let abort = abort.0;
	if let Err(e) = source.start() {
		return (TransferStatus::RequestError, ErrorInfo::new(None, e.to_string()));
	}

	let mut transport = Transport::new_locked(socket, client);
	let (mut oack, mut negotiated) = negotiate_known_options(&config.options, &requested);
	match decode_requested_transfer_size(&config.options, &requested) {
		OptionDecode::Present(_) => {
			if let Some(size) = source.requested_transfer_size() {
				oack.insert(consts::OPT_TRANSFERSIZE_IDENT, size.to_string());
				negotiated.transfer_size = Some(size);
			}
		}
		OptionDecode::Invalid | OptionDecode::Absent => {}
	}
	let mut retry = config.retry;
	retry.timeout = Duration::from_secs(negotiated.timeout_secs as u64);

	macro_rules! finish {
		($status:expr, $info:expr) => {{
			let status = $status;
			source.finished(status);
			return (status, $info);
		}};
	}

	let mut last_acked_block: Option<BlockNumber> = None;
	let mut pending;
	if oack.is_empty() {
		let (first, short) = match build_data_packet(&mut *source, BlockNumber::new(1), negotiated.block_size) {
			Ok(r) => r,
			Err(e) => {
				refuse(&transport, client, ErrorCode::AccessViolation, &e.to_string(), metrics.as_ref()).await;
				finish!(TransferStatus::TransferError, ErrorInfo::new(Some(ErrorCode::AccessViolation), e.to_string()));
			}
		};
		let mut last_short = short;
		let mut last_sent_packet = first.clone();
		pending = match exchange(&mut transport, &first, client, retry, metrics.as_ref(), &abort).await {
			Ok(p) => p,
			Err(Interrupted::Aborted) => {
				let outcome = on_aborted(&transport, client, &abort, metrics.as_ref()).await;
				finish!(outcome.0, outcome.1);
			}
			Err(Interrupted::Failed(e)) => finish!(TransferStatus::CommunicationError, ErrorInfo::new(None, e.to_string())),
		};
		let mut last_sent = BlockNumber::new(1);
		loop {
			match pending {
				Packet::Ack(ack) => {
					if Some(ack.block) == last_acked_block {
						pending = match exchange_retransmitting(&mut transport, &last_sent_packet, client, retry, metrics.as_ref(), &abort).await {
							Ok(p) => p,
							Err(Interrupted::Aborted) => {
								let outcome = on_aborted(&transport, client, &abort, metrics.as_ref()).await;
								finish!(outcome.0, outcome.1);
							}
							Err(Interrupted::Failed(e)) => finish!(TransferStatus::CommunicationError, ErrorInfo::new(None, e.to_string())),
						};
						continue;
					}
					if ack.block != last_sent {
						refuse(&transport, client, ErrorCode::IllegalTftpOperation, "wrong block number", metrics.as_ref()).await;
						finish!(TransferStatus::TransferError, ErrorInfo::new(Some(ErrorCode::IllegalTftpOperation), "wrong block number"));
					}
					last_acked_block = Some(ack.block);
					if last_short {
						finish!(TransferStatus::Successful, ErrorInfo::default());
					}
					let (next, short) = match build_data_packet(&mut *source, last_sent.next(), negotiated.block_size) {
						Ok(r) => r,
						Err(e) => {
							refuse(&transport, client, ErrorCode::AccessViolation, &e.to_string(), metrics.as_ref()).await;
							finish!(TransferStatus::TransferError, ErrorInfo::new(Some(ErrorCode::AccessViolation), e.to_string()));
						}
					};
					last_sent = last_sent.next();
					last_short = short;
					last_sent_packet = next.clone();
					pending = match exchange(&mut transport, &next, client, retry, metrics.as_ref(), &abort).await {
						Ok(p) => p,
						Err(Interrupted::Aborted) => {
							let outcome = on_aborted(&transport, client, &abort, metrics.as_ref()).await;
							finish!(outcome.0, outcome.1);
						}
						Err(Interrupted::Failed(e)) => finish!(TransferStatus::CommunicationError, ErrorInfo::new(None, e.to_string())),
					};
				}
				Packet::Data(_) => {
					refuse(&transport, client, ErrorCode::IllegalTftpOperation, "DATA not expected", metrics.as_ref()).await;
					finish!(TransferStatus::TransferError, ErrorInfo::new(Some(ErrorCode::IllegalTftpOperation), "DATA not expected"));
				}
				Packet::Error(err) => finish!(TransferStatus::TransferError, ErrorInfo::new(Some(err.code), err.message)),
				_ => {
					refuse(&transport, client, ErrorCode::IllegalTftpOperation, "unexpected packet", metrics.as_ref()).await;
					finish!(TransferStatus::TransferError, ErrorInfo::new(Some(ErrorCode::IllegalTftpOperation), "unexpected packet"));
				}
			}
		}
	} else {
		let oack_pkt = Packet::oack(oack);
		let mut last_sent_packet = oack_pkt.clone();
		pending = match exchange(&mut transport, &oack_pkt, client, retry, metrics.as_ref(), &abort).await {
			Ok(p) => p,
			Err(Interrupted::Aborted) => {
				let outcome = on_aborted(&transport, client, &abort, metrics.as_ref()).await;
				finish!(outcome.0, outcome.1);
			}
			Err(Interrupted::Failed(e)) => finish!(TransferStatus::CommunicationError, ErrorInfo::new(None, e.to_string())),
		};
		let mut last_sent = BlockNumber::ZERO;
		let mut last_short = false;
		loop {
			match pending {
				Packet::Ack(ack) => {
					if Some(ack.block) == last_acked_block {
						pending = match exchange_retransmitting(&mut transport, &last_sent_packet, client, retry, metrics.as_ref(), &abort).await {
							Ok(p) => p,
							Err(Interrupted::Aborted) => {
								let outcome = on_aborted(&transport, client, &abort, metrics.as_ref()).await;
								finish!(outcome.0, outcome.1);
							}
							Err(Interrupted::Failed(e)) => finish!(TransferStatus::CommunicationError, ErrorInfo::new(None, e.to_string())),
						};
						continue;
					}
					if ack.block != last_sent {
						refuse(&transport, client, ErrorCode::IllegalTftpOperation, "wrong block number", metrics.as_ref()).await;
						finish!(TransferStatus::TransferError, ErrorInfo::new(Some(ErrorCode::IllegalTftpOperation), "wrong block number"));
					}
					last_acked_block = Some(ack.block);
					if last_short {
						finish!(TransferStatus::Successful, ErrorInfo::default());
					}
					let (next, short) = match build_data_packet(&mut *source, last_sent.next(), negotiated.block_size) {
						Ok(r) => r,
						Err(e) => {
							refuse(&transport, client, ErrorCode::AccessViolation, &e.to_string(), metrics.as_ref()).await;
							finish!(TransferStatus::TransferError, ErrorInfo::new(Some(ErrorCode::AccessViolation), e.to_string()));
						}
					};
					last_sent = last_sent.next();
					last_short = short;
					last_sent_packet = next.clone();
					pending = match exchange(&mut transport, &next, client, retry, metrics.as_ref(), &abort).await {
						Ok(p) => p,
						Err(Interrupted::Aborted) => {
							let outcome = on_aborted(&transport, client, &abort, metrics.as_ref()).await;
							finish!(outcome.0, outcome.1);
						}
						Err(Interrupted::Failed(e)) => finish!(TransferStatus::CommunicationError, ErrorInfo::new(None, e.to_string())),
					};
				}
				Packet::Data(_) => {
					refuse(&transport, client, ErrorCode::IllegalTftpOperation, "DATA not expected", metrics.as_ref()).await;
					finish!(TransferStatus::TransferError, ErrorInfo::new(Some(ErrorCode::IllegalTftpOperation), "DATA not expected"));
				}
				Packet::Error(err) => finish!(TransferStatus::TransferError, ErrorInfo::new(Some(err.code), err.message)),
				_ => {
					refuse(&transport, client, ErrorCode::IllegalTftpOperation, "unexpected packet", metrics.as_ref()).await;
					finish!(TransferStatus::TransferError, ErrorInfo::new(Some(ErrorCode::IllegalTftpOperation), "unexpected packet"));
				}
			}
		}
	}
}

// ---------------------------------------------------------------------
// server-write (responds to WRQ)
// ---------------------------------------------------------------------

/// Drives a server-side write: the server receives DATA into `sink`.
pub async fn run_server_write(
	socket: UdpSocket,
	client: SocketAddr,
	requested: Options,
	config: OperationConfig,
	mut sink: Box<dyn DataSink>,
	abort: AbortHandleToken,
	metrics: Option<SharedPacketSink>,
) -> Outcome {
	let abort = abort.0;
	if let Err(e) = sink.start() {
		return (TransferStatus::RequestError, ErrorInfo::new(None, e.to_string()));
	}

	let mut transport = Transport::new_locked(socket, client);
	let (mut oack, negotiated) = negotiate_known_options(&config.options, &requested);
	let mut retry = config.retry;
	retry.timeout = Duration::from_secs(negotiated.timeout_secs as u64);
	let mut transfer_size_refused = None;
	if let OptionDecode::Present(size) = decode_requested_transfer_size(&config.options, &requested) {
		if sink.received_transfer_size(size) {
			oack.insert(consts::OPT_TRANSFERSIZE_IDENT, size.to_string());
		} else {
			transfer_size_refused = Some(size);
		}
	}

	macro_rules! finish {
		($status:expr, $info:expr) => {{
			let status = $status;
			sink.finished(status);
			return (status, $info);
		}};
	}

	if let Some(_size) = transfer_size_refused {
		refuse(&transport, client, ErrorCode::DiskFullOrAllocationExceeds, "file too big", metrics.as_ref()).await;
		finish!(TransferStatus::TransferError, ErrorInfo::new(Some(ErrorCode::DiskFullOrAllocationExceeds), "file too big"));
	}

	let first_ack = if oack.is_empty() { Packet::ack(BlockNumber::ZERO) } else { Packet::oack(oack) };
	let mut last_acked = BlockNumber::ZERO;

	let mut pending = match exchange(&mut transport, &first_ack, client, retry, metrics.as_ref(), &abort).await {
		Ok(p) => p,
		Err(Interrupted::Aborted) => {
			let outcome = on_aborted(&transport, client, &abort, metrics.as_ref()).await;
			finish!(outcome.0, outcome.1);
		}
		Err(Interrupted::Failed(e)) => finish!(TransferStatus::CommunicationError, ErrorInfo::new(None, e.to_string())),
	};

	loop {
		match pending {
			Packet::Data(data) => {
				if data.block == last_acked && last_acked != BlockNumber::ZERO {
					let ack = Packet::ack(last_acked);
					pending = match exchange(&mut transport, &ack, client, retry, metrics.as_ref(), &abort).await {
						Ok(p) => p,
						Err(Interrupted::Aborted) => {
							let outcome = on_aborted(&transport, client, &abort, metrics.as_ref()).await;
							finish!(outcome.0, outcome.1);
						}
						Err(Interrupted::Failed(e)) => finish!(TransferStatus::CommunicationError, ErrorInfo::new(None, e.to_string())),
					};
					continue;
				}
				if data.block != last_acked.next() {
					refuse(&transport, client, ErrorCode::IllegalTftpOperation, "wrong block number", metrics.as_ref()).await;
					finish!(TransferStatus::TransferError, ErrorInfo::new(Some(ErrorCode::IllegalTftpOperation), "wrong block number"));
				}
				if data.data.len() > negotiated.block_size as usize {
					refuse(&transport, client, ErrorCode::IllegalTftpOperation, "too much data", metrics.as_ref()).await;
					finish!(TransferStatus::TransferError, ErrorInfo::new(Some(ErrorCode::IllegalTftpOperation), "too much data"));
				}
				let short = data.data.len() < negotiated.block_size as usize;
				if let Err(e) = sink.received_data(&data.data) {
					refuse(&transport, client, ErrorCode::AccessViolation, &e.to_string(), metrics.as_ref()).await;
					finish!(TransferStatus::TransferError, ErrorInfo::new(Some(ErrorCode::AccessViolation), e.to_string()));
				}
				last_acked = data.block;
				let ack = Packet::ack(last_acked);
				if short {
					let _ = transport.send_only(&ack, client, metrics.as_ref()).await;
					if config.dally {
						transport.dally(retry.timeout * 2, &ack, client, metrics.as_ref()).await;
					}
					finish!(TransferStatus::Successful, ErrorInfo::default());
				}
				pending = match exchange(&mut transport, &ack, client, retry, metrics.as_ref(), &abort).await {
					Ok(p) => p,
					Err(Interrupted::Aborted) => {
						let outcome = on_aborted(&transport, client, &abort, metrics.as_ref()).await;
						finish!(outcome.0, outcome.1);
					}
					Err(Interrupted::Failed(e)) => finish!(TransferStatus::CommunicationError, ErrorInfo::new(None, e.to_string())),
				};
			}
			Packet::Ack(_) => {
				refuse(&transport, client, ErrorCode::IllegalTftpOperation, "ACK not expected", metrics.as_ref()).await;
				finish!(TransferStatus::TransferError, ErrorInfo::new(Some(ErrorCode::IllegalTftpOperation), "ACK not expected"));
			}
			Packet::Error(err) => finish!(TransferStatus::TransferError, ErrorInfo::new(Some(err.code), err.message)),
			_ => {
				refuse(&transport, client, ErrorCode::IllegalTftpOperation, "unexpected packet", metrics.as_ref()).await;
				finish!(TransferStatus::TransferError, ErrorInfo::new(Some(ErrorCode::IllegalTftpOperation), "unexpected packet"));
			}
		}
	}
}

// ---------------------------------------------------------------------
// public contract surface
// ---------------------------------------------------------------------

/// Opaque wrapper so the four `run_*` functions don't need `AbortHandle`
/// to be `pub`.
pub struct AbortHandleToken(AbortHandle);

/// A handle to a running (or finished) operation: lets a caller cancel it
/// and, once it finishes, read back its status and error detail.
pub struct OperationHandle {
	abort: AbortHandle,
	result: Arc<Mutex<Option<Outcome>>>,
	join: tokio::task::JoinHandle<()>,
}

impl OperationHandle {
	/// Cancels the operation without attempting to notify the peer.
	pub fn abort(&self) {
		self.abort.abort();
	}

	/// Cancels the operation, sending an ERROR packet to the peer first if
	/// a peer has already been established.
	pub fn graceful_abort(&self, code: ErrorCode, message: impl Into<String>) {
		self.abort.graceful_abort(code, message.into());
	}

	/// The status of the finished operation, or `None` while still running.
	pub fn status(&self) -> Option<TransferStatus> {
		self.result.lock().unwrap().as_ref().map(|(s, _)| *s)
	}

	/// The error detail of the finished operation, or `None` while still
	/// running.
	pub fn error_info(&self) -> Option<ErrorInfo> {
		self.result.lock().unwrap().as_ref().map(|(_, i)| i.clone())
	}

	/// Waits for the operation to finish and returns its outcome.
	pub async fn join(self) -> Outcome {
		let _ = self.join.await;
		self.result.lock().unwrap().clone().unwrap_or((TransferStatus::Aborted, ErrorInfo::default()))
	}
}

/// Builder for a client-initiated operation (RRQ or WRQ).
pub struct ClientOperationBuilder {
	remote: SocketAddr,
	filename: String,
	mode: Mode,
	config: OperationConfig,
	option_handler: Option<OptionNegotiationHandler>,
	metrics: Option<SharedPacketSink>,
}

impl ClientOperationBuilder {
	pub fn new(remote: SocketAddr, filename: impl Into<String>, mode: Mode) -> Self {
		ClientOperationBuilder {
			remote,
			filename: filename.into(),
			mode,
			config: OperationConfig::default(),
			option_handler: None,
			metrics: None,
		}
	}

	pub fn config(mut self, config: OperationConfig) -> Self {
		self.config = config;
		self
	}

	pub fn option_negotiation_handler(mut self, handler: OptionNegotiationHandler) -> Self {
		self.option_handler = Some(handler);
		self
	}

	pub fn metrics(mut self, metrics: SharedPacketSink) -> Self {
		self.metrics = Some(metrics);
		self
	}

	/// Starts a read: `socket` should already be bound to an ephemeral
	/// local port.
	pub fn start_read(self, socket: UdpSocket, sink: Box<dyn DataSink>) -> OperationHandle {
		let abort = AbortHandle::new();
		let result: Arc<Mutex<Option<Outcome>>> = Arc::new(Mutex::new(None));
		let result_writer = result.clone();
		let token = AbortHandleToken(abort.clone());
		let ClientOperationBuilder {
			remote,
			filename,
			mode,
			config,
			option_handler,
			metrics,
		} = self;
		let join = tokio::spawn(async move {
			let outcome = run_client_read(socket, remote, filename, mode, config, sink, option_handler, token, metrics).await;
			*result_writer.lock().unwrap() = Some(outcome);
		});
		OperationHandle { abort, result, join }
	}

	/// Starts a write: `socket` should already be bound to an ephemeral
	/// local port.
	pub fn start_write(self, socket: UdpSocket, source: Box<dyn DataSource>) -> OperationHandle {
		let abort = AbortHandle::new();
		let result: Arc<Mutex<Option<Outcome>>> = Arc::new(Mutex::new(None));
		let result_writer = result.clone();
		let token = AbortHandleToken(abort.clone());
		let ClientOperationBuilder {
			remote,
			filename,
			mode,
			config,
			option_handler,
			metrics,
		} = self;
		let join = tokio::spawn(async move {
			let outcome = run_client_write(socket, remote, filename, mode, config, source, option_handler, token, metrics).await;
			*result_writer.lock().unwrap() = Some(outcome);
		});
		OperationHandle { abort, result, join }
	}
}

/// Spawns a server-side operation in response to an already-decoded
/// RRQ/WRQ; used by `tftp::listener`.
pub fn spawn_server_read(
	socket: UdpSocket,
	client: SocketAddr,
	requested: Options,
	config: OperationConfig,
	source: Box<dyn DataSource>,
	metrics: Option<SharedPacketSink>,
) -> OperationHandle {
	let abort = AbortHandle::new();
	let result: Arc<Mutex<Option<Outcome>>> = Arc::new(Mutex::new(None));
	let result_writer = result.clone();
	let token = AbortHandleToken(abort.clone());
	let join = tokio::spawn(async move {
		let outcome = run_server_read(socket, client, requested, config, source, token, metrics).await;
		*result_writer.lock().unwrap() = Some(outcome);
	});
	OperationHandle { abort, result, join }
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn negotiate_known_options_picks_smaller_block_size_and_echoes_timeout() {
		let policy = OptionsPolicy {
			block_size: Some(1024),
			timeout: Some(5),
			handle_transfer_size: false,
		};
		let mut requested = Options::new();
		requested.insert("blksize", "4096");
		requested.insert("timeout", "3");

		let (oack, negotiated) = negotiate_known_options(&policy, &requested);
		assert_eq!(oack.get("blksize"), Some("1024"));
		assert_eq!(oack.get("timeout"), Some("3"));
		assert_eq!(negotiated.block_size, 1024);
		assert_eq!(negotiated.timeout_secs, 3);
	}

	#[test]
	fn negotiate_known_options_omits_unrequested_options() {
		let policy = OptionsPolicy::default();
		let requested = Options::new();
		let (oack, negotiated) = negotiate_known_options(&policy, &requested);
		assert!(oack.is_empty());
		assert_eq!(negotiated.block_size, consts::DEFAULT_BLOCK_SIZE);
	}

	#[test]
	fn validate_oack_as_requester_rejects_unproposed_option() {
		let policy = OptionsPolicy::default();
		let mut responded = Options::new();
		responded.insert("blksize", "1024");
		assert!(validate_oack_as_requester(&policy, &responded, None, true).is_err());
	}

	#[test]
	fn validate_oack_as_requester_accepts_matching_echo() {
		let policy = OptionsPolicy {
			block_size: Some(1024),
			timeout: None,
			handle_transfer_size: true,
		};
		let mut responded = Options::new();
		responded.insert("blksize", "1024");
		responded.insert("tsize", "42");
		let negotiated = validate_oack_as_requester(&policy, &responded, Some(0), true).unwrap();
		assert_eq!(negotiated.block_size, 1024);
		assert_eq!(negotiated.transfer_size, Some(42));
	}

	#[test]
	fn build_data_packet_flags_short_final_block() {
		struct Fixed(Vec<u8>);
		impl DataSource for Fixed {
			fn send_data(&mut self, max_bytes: usize) -> io::Result<Vec<u8>> {
				let n = max_bytes.min(self.0.len());
				Ok(self.0.drain(..n).collect())
			}
		}
		let mut src = Fixed(vec![1, 2, 3]);
		let (pkt, short) = build_data_packet(&mut src, BlockNumber::new(1), 512).unwrap();
		assert!(short);
		match pkt {
			Packet::Data(d) => assert_eq!(d.data, vec![1, 2, 3]),
			_ => panic!("expected a DATA packet"),
		}
	}

	struct VecSource(Vec<u8>, usize);
	impl DataSource for VecSource {
		fn send_data(&mut self, max_bytes: usize) -> io::Result<Vec<u8>> {
			let end = (self.1 + max_bytes).min(self.0.len());
			let chunk = self.0[self.1..end].to_vec();
			self.1 = end;
			Ok(chunk)
		}
		fn requested_transfer_size(&mut self) -> Option<u64> {
			Some(self.0.len() as u64)
		}
	}

	struct VecSink(Arc<Mutex<Vec<u8>>>);
	impl DataSink for VecSink {
		fn received_data(&mut self, bytes: &[u8]) -> io::Result<()> {
			self.0.lock().unwrap().extend_from_slice(bytes);
			Ok(())
		}
	}

	async fn udp(addr: &str) -> UdpSocket {
		UdpSocket::bind(addr).await.unwrap()
	}

	/// E6-shaped scenario: a WRQ with `tsize` the sink refuses ends in
	/// `TransferError` with `DiskFullOrAllocationExceeds`, and no byte of
	/// the oversize upload reaches the sink.
	#[tokio::test]
	async fn server_write_refuses_oversize_transfer_size() {
		struct RefusingSink;
		impl DataSink for RefusingSink {
			fn received_data(&mut self, _bytes: &[u8]) -> io::Result<()> {
				panic!("should never be called once tsize is refused");
			}
			fn received_transfer_size(&mut self, _size: u64) -> bool {
				false
			}
		}

		let server_socket = udp("127.0.0.1:0").await;
		let client_addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
		let mut policy = OptionsPolicy::default();
		policy.handle_transfer_size = true;
		let mut requested = Options::new();
		requested.insert("tsize", "10000000");
		let config = OperationConfig {
			options: policy,
			..OperationConfig::default()
		};

		let (status, info) = run_server_write(
			server_socket,
			client_addr,
			requested,
			config,
			Box::new(RefusingSink),
			AbortHandleToken(AbortHandle::new()),
			None,
		)
		.await;

		assert_eq!(status, TransferStatus::TransferError);
		assert_eq!(info.code, Some(ErrorCode::DiskFullOrAllocationExceeds));
	}

	/// E2-shaped scenario: client and server negotiate a non-default block
	/// size and the full byte stream survives the round trip unmodified.
	#[tokio::test]
	async fn client_read_and_server_read_negotiate_block_size_and_transfer_bytes() {
		let client_socket = udp("127.0.0.1:0").await;
		let server_socket = udp("127.0.0.1:0").await;
		let server_addr = server_socket.local_addr().unwrap();
		let client_addr = client_socket.local_addr().unwrap();

		let payload: Vec<u8> = (0..1124u32).map(|i| (i % 251) as u8).collect();
		let mut requested = Options::new();
		requested.insert("blksize", "1024");

		let server_config = OperationConfig {
			options: OptionsPolicy {
				block_size: Some(1024),
				timeout: None,
				handle_transfer_size: false,
			},
			..OperationConfig::default()
		};
		let server_task = tokio::spawn(run_server_read(
			server_socket,
			client_addr,
			requested,
			server_config,
			Box::new(VecSource(payload.clone(), 0)),
			AbortHandleToken(AbortHandle::new()),
			None,
		));

		let received = Arc::new(Mutex::new(Vec::new()));
		let client_config = OperationConfig {
			options: OptionsPolicy {
				block_size: Some(1024),
				timeout: None,
				handle_transfer_size: false,
			},
			..OperationConfig::default()
		};
		let (status, _) = run_client_read(
			client_socket,
			server_addr,
			"x".to_string(),
			Mode::Octet,
			client_config,
			Box::new(VecSink(received.clone())),
			None,
			AbortHandleToken(AbortHandle::new()),
			None,
		)
		.await;

		assert_eq!(status, TransferStatus::Successful);
		assert_eq!(&received.lock().unwrap()[..], &payload[..]);
		let (server_status, _) = server_task.await.unwrap();
		assert_eq!(server_status, TransferStatus::Successful);
	}

	/// Invariant #6/E5: a datagram from an address other than the locked
	/// peer gets `UnknownTransferId` and never reaches the data handler;
	/// the genuine peer's packet is still delivered.
	#[tokio::test]
	async fn transport_rejects_packets_from_a_stray_sender() {
		let under_test = udp("127.0.0.1:0").await;
		let peer = udp("127.0.0.1:0").await;
		let stray = udp("127.0.0.1:0").await;
		let under_test_addr = under_test.local_addr().unwrap();
		let peer_addr = peer.local_addr().unwrap();

		let mut transport = Transport::new_unlocked(under_test);
		peer.send_to(&Packet::ack(BlockNumber::new(1)).encode(), under_test_addr).await.unwrap();
		let mut buf = vec![0u8; consts::MAX_DATAGRAM_SIZE];
		let first = transport.receive_one(&mut buf, None).await.unwrap();
		assert_eq!(first, Packet::ack(BlockNumber::new(1)));
		assert_eq!(transport.peer(), Some(peer_addr));

		stray
			.send_to(&Packet::ack(BlockNumber::new(6)).encode(), under_test_addr)
			.await
			.unwrap();
		peer.send_to(&Packet::ack(BlockNumber::new(2)).encode(), under_test_addr).await.unwrap();

		let next = transport.receive_one(&mut buf, None).await.unwrap();
		assert_eq!(next, Packet::ack(BlockNumber::new(2)));

		let mut stray_buf = [0u8; 64];
		let (n, _) = stray.recv_from(&mut stray_buf).await.unwrap();
		let reply = Packet::decode(&stray_buf[..n]).unwrap();
		match reply {
			Packet::Error(e) => assert_eq!(e.code, ErrorCode::UnknownTransferId),
			other => panic!("expected an ERROR reply to the stray sender, got {:?}", other),
		}
	}
}

pub fn spawn_server_write(
	socket: UdpSocket,
	client: SocketAddr,
	requested: Options,
	config: OperationConfig,
	sink: Box<dyn DataSink>,
	metrics: Option<SharedPacketSink>,
) -> OperationHandle {
	let abort = AbortHandle::new();
	let result: Arc<Mutex<Option<Outcome>>> = Arc::new(Mutex::new(None));
	let result_writer = result.clone();
	let token = AbortHandleToken(abort.clone());
	let join = tokio::spawn(async move {
		let outcome = run_server_write(socket, client, requested, config, sink, token, metrics).await;
		*result_writer.lock().unwrap() = Some(outcome);
	});
	OperationHandle { abort, result, join }
}
