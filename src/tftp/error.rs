use thiserror::Error;

/// Errors raised while decoding or encoding a packet on the wire.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
	#[error("unexpected end of packet")]
	UnexpectedEof,
	#[error("malformed packet")]
	MalformedPacket,
	#[error("invalid opcode")]
	InvalidOpcode,
	#[error("string field is missing its NUL terminator")]
	NotNullTerminated,
	#[error("string field contains invalid characters")]
	InvalidCharacters,
	#[error("unknown transfer mode")]
	UnknownTxMode,
}

/// A request's mode string did not name a mode this crate recognizes.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown transfer mode {0:?}")]
pub struct ParseModeError(pub String);

/// Errors raised while parsing or negotiating RFC 2347-family options.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OptionError {
	#[error("option {0:?} has a value that could not be decoded")]
	InvalidValue(String),
	#[error("option negotiation refused: {0}")]
	Refused(String),
}

/// Errors at the transport layer, surfaced to an operation as
/// `TransferStatus::CommunicationError`.
#[derive(Debug, Error)]
pub enum OperationError {
	#[error(transparent)]
	Io(#[from] std::io::Error),
	#[error("peer did not respond within the retry budget")]
	RetriesExhausted,
}
