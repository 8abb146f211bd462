use std::collections::HashMap;
use std::ffi::CStr;

use crate::tftp::error::PacketError;
use crate::tftp::options::Options;
use crate::tftp::{consts, BlockNumber, ErrorCode, Mode, RequestKind};

/// A well-formed request (RRQ or WRQ), decoded into owned parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPacket {
	pub kind: RequestKind,
	pub filename: String,
	pub mode: Mode,
	pub options: Options,
}

/// A DATA packet. `data.len()` may be less than the negotiated block size,
/// which is what signals the last block of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
	pub block: BlockNumber,
	pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPacket {
	pub block: BlockNumber,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPacket {
	pub code: ErrorCode,
	pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAckPacket {
	pub options: Options,
}

/// Any packet this crate can send or receive, decoded into one owned value
/// so it can cross an `.await` point without borrowing the receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
	Request(RequestPacket),
	Data(DataPacket),
	Ack(AckPacket),
	Error(ErrorPacket),
	OAck(OAckPacket),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
	Request,
	Data,
	Ack,
	Error,
	OAck,
}

impl Packet {
	pub fn kind(&self) -> PacketKind {
		match self {
			Packet::Request(_) => PacketKind::Request,
			Packet::Data(_) => PacketKind::Data,
			Packet::Ack(_) => PacketKind::Ack,
			Packet::Error(_) => PacketKind::Error,
			Packet::OAck(_) => PacketKind::OAck,
		}
	}

	/// Decodes one datagram. The buffer is the exact contents of a single
	/// received UDP payload (TFTP frames one packet per datagram).
	pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
		if buf.len() < 2 {
			return Err(PacketError::UnexpectedEof);
		}
		let opcode = u16::from_be_bytes([buf[0], buf[1]]);
		match opcode {
			consts::OPCODE_RRQ => Ok(Packet::Request(decode_request(RequestKind::Rrq, buf)?)),
			consts::OPCODE_WRQ => Ok(Packet::Request(decode_request(RequestKind::Wrq, buf)?)),
			consts::OPCODE_DATA => Ok(Packet::Data(decode_data(buf)?)),
			consts::OPCODE_ACK => Ok(Packet::Ack(decode_ack(buf)?)),
			consts::OPCODE_ERROR => Ok(Packet::Error(decode_error(buf)?)),
			consts::OPCODE_OACK => Ok(Packet::OAck(decode_oack(buf)?)),
			_ => Err(PacketError::InvalidOpcode),
		}
	}

	pub fn encode(&self) -> Vec<u8> {
		match self {
			Packet::Request(req) => encode_request(req),
			Packet::Data(data) => encode_data(data),
			Packet::Ack(ack) => encode_ack(ack.block),
			Packet::Error(err) => encode_error(err.code, &err.message),
			Packet::OAck(oack) => encode_oack(&oack.options),
		}
	}
}

fn cstr_at(buf: &[u8], start: usize) -> Result<(&str, usize), PacketError> {
	let c = CStr::from_bytes_until_nul(&buf[start..]).map_err(|_| PacketError::NotNullTerminated)?;
	let s = c.to_str().map_err(|_| PacketError::InvalidCharacters)?;
	Ok((s, start + s.len() + 1))
}

fn decode_request(kind: RequestKind, buf: &[u8]) -> Result<RequestPacket, PacketError> {
	if buf.len() < 4 {
		return Err(PacketError::UnexpectedEof);
	}
	let (filename, after_filename) = cstr_at(buf, 2)?;
	let (mode_str, after_mode) = cstr_at(buf, after_filename)?;
	let mode: Mode = mode_str.parse().map_err(|_| PacketError::UnknownTxMode)?;

	let mut options = Options::new();
	let mut pos = after_mode;
	while pos < buf.len() {
		let (name, after_name) = cstr_at(buf, pos)?;
		let (value, after_value) = cstr_at(buf, after_name)?;
		options.insert(name, value);
		pos = after_value;
	}

	Ok(RequestPacket {
		kind,
		filename: filename.to_string(),
		mode,
		options,
	})
}

fn encode_request(req: &RequestPacket) -> Vec<u8> {
	let opcode = match req.kind {
		RequestKind::Rrq => consts::OPCODE_RRQ,
		RequestKind::Wrq => consts::OPCODE_WRQ,
	};
	let mut buf = Vec::with_capacity(32);
	buf.extend_from_slice(&opcode.to_be_bytes());
	buf.extend_from_slice(req.filename.as_bytes());
	buf.push(0);
	buf.extend_from_slice(req.mode.as_str().as_bytes());
	buf.push(0);
	for (name, value) in req.options.iter() {
		buf.extend_from_slice(name.as_bytes());
		buf.push(0);
		buf.extend_from_slice(value.as_bytes());
		buf.push(0);
	}
	buf
}

fn decode_data(buf: &[u8]) -> Result<DataPacket, PacketError> {
	if buf.len() < 4 {
		return Err(PacketError::UnexpectedEof);
	}
	let block = BlockNumber::new(u16::from_be_bytes([buf[2], buf[3]]));
	Ok(DataPacket {
		block,
		data: buf[4..].to_vec(),
	})
}

fn encode_data(data: &DataPacket) -> Vec<u8> {
	let mut buf = Vec::with_capacity(4 + data.data.len());
	buf.extend_from_slice(&consts::OPCODE_DATA.to_be_bytes());
	buf.extend_from_slice(&data.block.get().to_be_bytes());
	buf.extend_from_slice(&data.data);
	buf
}

fn decode_ack(buf: &[u8]) -> Result<AckPacket, PacketError> {
	if buf.len() != 4 {
		return Err(PacketError::MalformedPacket);
	}
	Ok(AckPacket {
		block: BlockNumber::new(u16::from_be_bytes([buf[2], buf[3]])),
	})
}

fn encode_ack(block: BlockNumber) -> Vec<u8> {
	let mut buf = Vec::with_capacity(4);
	buf.extend_from_slice(&consts::OPCODE_ACK.to_be_bytes());
	buf.extend_from_slice(&block.get().to_be_bytes());
	buf
}

fn decode_error(buf: &[u8]) -> Result<ErrorPacket, PacketError> {
	if buf.len() < 5 {
		return Err(PacketError::UnexpectedEof);
	}
	let code = ErrorCode::try_from(u16::from_be_bytes([buf[2], buf[3]]))?;
	let (message, _) = cstr_at(buf, 4)?;
	Ok(ErrorPacket {
		code,
		message: message.to_string(),
	})
}

fn encode_error(code: ErrorCode, message: &str) -> Vec<u8> {
	let mut buf = Vec::with_capacity(5 + message.len());
	buf.extend_from_slice(&consts::OPCODE_ERROR.to_be_bytes());
	buf.extend_from_slice(&code.code().to_be_bytes());
	buf.extend_from_slice(message.as_bytes());
	buf.push(0);
	buf
}

fn decode_oack(buf: &[u8]) -> Result<OAckPacket, PacketError> {
	let mut options = Options::new();
	let mut pos = 2;
	while pos < buf.len() {
		let (name, after_name) = cstr_at(buf, pos)?;
		let (value, after_value) = cstr_at(buf, after_name)?;
		options.insert(name, value);
		pos = after_value;
	}
	Ok(OAckPacket { options })
}

fn encode_oack(options: &Options) -> Vec<u8> {
	let mut buf = Vec::with_capacity(16);
	buf.extend_from_slice(&consts::OPCODE_OACK.to_be_bytes());
	for (name, value) in options.iter() {
		buf.extend_from_slice(name.as_bytes());
		buf.push(0);
		buf.extend_from_slice(value.as_bytes());
		buf.push(0);
	}
	buf
}

/// Convenience constructors mirroring how each role of `Operation` builds
/// its outbound packets.
impl Packet {
	pub fn request(kind: RequestKind, filename: impl Into<String>, mode: Mode, options: Options) -> Self {
		Packet::Request(RequestPacket {
			kind,
			filename: filename.into(),
			mode,
			options,
		})
	}

	pub fn data(block: BlockNumber, data: Vec<u8>) -> Self {
		Packet::Data(DataPacket { block, data })
	}

	pub fn ack(block: BlockNumber) -> Self {
		Packet::Ack(AckPacket { block })
	}

	pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
		Packet::Error(ErrorPacket {
			code,
			message: message.into(),
		})
	}

	pub fn oack(options: Options) -> Self {
		Packet::OAck(OAckPacket { options })
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::tftp::options::Options;

	#[test]
	fn round_trips_a_read_request_with_options() {
		let mut options = Options::new();
		options.insert("blksize", "1024");
		options.insert("tsize", "0");
		let req = Packet::request(RequestKind::Rrq, "boot.img", Mode::Octet, options);
		let encoded = req.encode();
		let decoded = Packet::decode(&encoded).unwrap();
		assert_eq!(decoded, req);
	}

	#[test]
	fn round_trips_data_with_a_short_final_block() {
		let pkt = Packet::data(BlockNumber::new(7), vec![1, 2, 3]);
		let encoded = pkt.encode();
		assert_eq!(encoded.len(), 7);
		assert_eq!(Packet::decode(&encoded).unwrap(), pkt);
	}

	#[test]
	fn round_trips_ack() {
		let pkt = Packet::ack(BlockNumber::new(65535));
		assert_eq!(Packet::decode(&pkt.encode()).unwrap(), pkt);
	}

	#[test]
	fn round_trips_error() {
		let pkt = Packet::error(ErrorCode::FileNotFound, "nope");
		assert_eq!(Packet::decode(&pkt.encode()).unwrap(), pkt);
	}

	#[test]
	fn round_trips_oack_with_no_options() {
		let pkt = Packet::oack(Options::new());
		assert_eq!(Packet::decode(&pkt.encode()).unwrap(), pkt);
	}

	#[test]
	fn rejects_truncated_ack() {
		let buf = consts::OPCODE_ACK.to_be_bytes();
		assert_eq!(Packet::decode(&buf).unwrap_err(), PacketError::MalformedPacket);
	}

	#[test]
	fn rejects_request_missing_mode_terminator() {
		let mut buf = consts::OPCODE_RRQ.to_be_bytes().to_vec();
		buf.extend_from_slice(b"file.bin\0octet");
		assert_eq!(Packet::decode(&buf).unwrap_err(), PacketError::NotNullTerminated);
	}

	#[test]
	fn rejects_unknown_opcode() {
		let buf = 0xFFFFu16.to_be_bytes();
		assert_eq!(Packet::decode(&buf).unwrap_err(), PacketError::InvalidOpcode);
	}
}
