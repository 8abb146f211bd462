pub mod config;
pub mod error;
pub mod listener;
pub mod metrics;
pub mod operation;
pub mod options;
pub mod packet;

use std::fmt;

/// Well-known constants from RFC 1350 / RFC 2347 / RFC 2348 / RFC 2349.
pub mod consts {
	pub const TFTP_LISTEN_PORT: u16 = 69;

	pub const DEFAULT_BLOCK_SIZE: u16 = 512;
	pub const BLOCK_SIZE_MIN: u16 = 8;
	pub const BLOCK_SIZE_MAX: u16 = 65464;

	pub const TIMEOUT_MIN_SECS: u8 = 1;
	pub const TIMEOUT_MAX_SECS: u8 = 255;
	pub const DEFAULT_TIMEOUT_SECS: u8 = 2;

	pub const DEFAULT_RETRIES: u16 = 1;

	/// Largest possible UDP payload this crate will ever need to receive
	/// into (max negotiated block size + 4-byte DATA header, rounded up).
	pub const MAX_DATAGRAM_SIZE: usize = 65535;

	pub const OPT_BLOCKSIZE_IDENT: &str = "blksize";
	pub const OPT_TIMEOUT_IDENT: &str = "timeout";
	pub const OPT_TRANSFERSIZE_IDENT: &str = "tsize";

	pub const OPCODE_RRQ: u16 = 1;
	pub const OPCODE_WRQ: u16 = 2;
	pub const OPCODE_DATA: u16 = 3;
	pub const OPCODE_ACK: u16 = 4;
	pub const OPCODE_ERROR: u16 = 5;
	pub const OPCODE_OACK: u16 = 6;
}

/// Whether a request asks to read from, or write to, the responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
	Rrq,
	Wrq,
}

impl fmt::Display for RequestKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			RequestKind::Rrq => "RRQ",
			RequestKind::Wrq => "WRQ",
		})
	}
}

/// Transfer mode carried by a request packet. `Mail` parses so a
/// well-formed request isn't misread as malformed, but it is not a
/// supported transfer mode (see Non-goals).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
	Netascii,
	Octet,
	Mail,
}

impl Mode {
	pub fn as_str(&self) -> &'static str {
		match self {
			Mode::Netascii => "netascii",
			Mode::Octet => "octet",
			Mode::Mail => "mail",
		}
	}
}

impl fmt::Display for Mode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl std::str::FromStr for Mode {
	type Err = error::ParseModeError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"netascii" => Ok(Mode::Netascii),
			"octet" => Ok(Mode::Octet),
			"mail" => Ok(Mode::Mail),
			other => Err(error::ParseModeError(other.to_string())),
		}
	}
}

/// TFTP error codes, RFC 1350 §5 plus the RFC 2347 addition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
	NotDefined = 0,
	FileNotFound = 1,
	AccessViolation = 2,
	DiskFullOrAllocationExceeds = 3,
	IllegalTftpOperation = 4,
	UnknownTransferId = 5,
	FileAlreadyExists = 6,
	NoSuchUser = 7,
	TftpOptionRefused = 8,
}

impl ErrorCode {
	pub fn code(self) -> u16 {
		self as u16
	}
}

impl TryFrom<u16> for ErrorCode {
	type Error = error::PacketError;

	fn try_from(value: u16) -> Result<Self, Self::Error> {
		Ok(match value {
			0 => ErrorCode::NotDefined,
			1 => ErrorCode::FileNotFound,
			2 => ErrorCode::AccessViolation,
			3 => ErrorCode::DiskFullOrAllocationExceeds,
			4 => ErrorCode::IllegalTftpOperation,
			5 => ErrorCode::UnknownTransferId,
			6 => ErrorCode::FileAlreadyExists,
			7 => ErrorCode::NoSuchUser,
			8 => ErrorCode::TftpOptionRefused,
			_ => return Err(error::PacketError::MalformedPacket),
		})
	}
}

impl fmt::Display for ErrorCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let msg = match self {
			ErrorCode::NotDefined => "not defined",
			ErrorCode::FileNotFound => "file not found",
			ErrorCode::AccessViolation => "access violation",
			ErrorCode::DiskFullOrAllocationExceeds => "disk full or allocation exceeded",
			ErrorCode::IllegalTftpOperation => "illegal TFTP operation",
			ErrorCode::UnknownTransferId => "unknown transfer ID",
			ErrorCode::FileAlreadyExists => "file already exists",
			ErrorCode::NoSuchUser => "no such user",
			ErrorCode::TftpOptionRefused => "TFTP option refused",
		};
		f.write_str(msg)
	}
}

/// A DATA/ACK block number. Wraps at 16 bits per RFC 1350; block 0 is only
/// ever seen as the ACK that follows option negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BlockNumber(u16);

impl BlockNumber {
	pub const ZERO: BlockNumber = BlockNumber(0);

	pub fn new(value: u16) -> Self {
		BlockNumber(value)
	}

	pub fn get(self) -> u16 {
		self.0
	}

	pub fn next(self) -> Self {
		BlockNumber(self.0.wrapping_add(1))
	}
}

impl From<u16> for BlockNumber {
	fn from(value: u16) -> Self {
		BlockNumber(value)
	}
}

impl fmt::Display for BlockNumber {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}
