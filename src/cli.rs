use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use clap::{arg, command, ValueEnum, Args};
use clap::{Parser, Subcommand};

use simple_logger::SimpleLogger;

use crate::tftp::config::{OperationConfig, RetryPolicy};
use crate::tftp::options::OptionsPolicy;

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Options {
	#[arg(value_enum, short, long,
		default_value_t = DebugLevel::Warn,
		help = "Debug level to determine which messages are printed", global = true
	)]
	pub debug: DebugLevel,

	#[arg(short = 'r', long = "root", global = true)]
	pub root_dir: Option<PathBuf>,

	#[command(subcommand)]
	pub run_mode: RunMode,
}

#[derive(Debug, Clone, ValueEnum, Default)]
pub enum DebugLevel {
	Off = 0,
	Error,

	#[default]
	Warn,
	Info,
	Debug,
	Trace
}
impl From<DebugLevel> for log::LevelFilter {
	fn from(value: DebugLevel) -> Self {
		match value {
			DebugLevel::Off => Self::Off,
			DebugLevel::Error => Self::Error,
			DebugLevel::Warn => Self::Warn,
			DebugLevel::Info => Self::Info,
			DebugLevel::Debug => Self::Debug,
			DebugLevel::Trace => Self::Trace,
		}
	}
}

#[derive(Debug, Args, Clone)]
pub struct ClientOpts {
	#[arg(short, long, default_value_t = crate::tftp::consts::DEFAULT_BLOCK_SIZE)]
	pub blocksize: u16,

	#[arg(short, long, default_value_t = crate::tftp::consts::DEFAULT_TIMEOUT_SECS)]
	pub timeout: u8,

	#[arg(
		short = 'T', long, default_value_t = false,
		help = "Request (for RRQ) or hand over (for WRQ) the size of the file"
	)]
	pub transfer_size: bool,

	#[arg(long, default_value_t = crate::tftp::consts::DEFAULT_RETRIES,
		help = "How many times to retransmit an unacknowledged packet before giving up")]
	pub retries: u16,

	#[arg(long, default_value_t = false,
		help = "Linger after the final ACK to absorb a retransmitted last DATA")]
	pub dally: bool,
}

impl ClientOpts {
	pub fn into_config(self) -> OperationConfig {
		let retry = RetryPolicy {
			timeout: std::time::Duration::from_secs(self.timeout as u64),
			retries: self.retries,
		};
		OperationConfig {
			dally: self.dally,
			retry,
			options: OptionsPolicy {
				block_size: Some(self.blocksize),
				timeout: Some(self.timeout),
				handle_transfer_size: self.transfer_size,
			},
		}
	}
}

#[derive(Debug, Args, Clone)]
pub struct ServerOpts {
	#[arg(long, help = "Ceiling on the block size the server will negotiate down to")]
	pub server_blocksize: Option<u16>,

	#[arg(long, help = "Ceiling on the timeout the server will accept from a client")]
	pub server_timeout: Option<u8>,

	#[arg(long, default_value_t = false, help = "Whether the server negotiates the tsize option")]
	pub server_tsize: bool,

	#[arg(long, default_value_t = crate::tftp::consts::DEFAULT_RETRIES)]
	pub retries: u16,

	#[arg(long, default_value_t = false,
		help = "Linger after the final ACK/DATA exchange to absorb a retransmit")]
	pub dally: bool,
}

impl ServerOpts {
	pub fn into_config(self) -> OperationConfig {
		let retry = RetryPolicy {
			timeout: std::time::Duration::from_secs(crate::tftp::consts::DEFAULT_TIMEOUT_SECS as u64),
			retries: self.retries,
		};
		OperationConfig {
			dally: self.dally,
			retry,
			options: OptionsPolicy {
				block_size: self.server_blocksize,
				timeout: self.server_timeout,
				handle_transfer_size: self.server_tsize,
			},
		}
	}
}

#[derive(Subcommand, Debug)]
pub enum RunMode {
	Server {
		#[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
		bind: IpAddr,

		#[arg(short, long, default_value_t = crate::tftp::consts::TFTP_LISTEN_PORT)]
		port: u16,

		#[command(flatten)]
		server_opts: ServerOpts,
	},
	Client {
		#[command(flatten)]
		client_opts: ClientOpts,

		#[command(subcommand)]
		action: ClientAction
	}
}

#[derive(Debug, Args, Clone)]
pub struct ClientActionOpts {
	pub file: PathBuf,

	#[arg(help = "The remote server to connect to.")]
	pub server: IpAddr,

	#[arg(
		default_value_t = crate::tftp::consts::TFTP_LISTEN_PORT,
		help = "(optional) The remote port to connect to."
	)]
	pub port: u16,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ClientAction {
	Get {
		#[command(flatten)]
		opts: ClientActionOpts,
	},
	Put {
		#[command(flatten)]
		opts: ClientActionOpts,
	}
}

impl ClientAction {
	pub fn opts(&self) -> &ClientActionOpts {
		match self {
			ClientAction::Get { opts } => opts,
			ClientAction::Put { opts } => opts,
		}
	}

	pub fn as_req_kind(&self) -> crate::tftp::RequestKind {
		match self {
			ClientAction::Get { .. } => crate::tftp::RequestKind::Rrq,
			ClientAction::Put { .. } => crate::tftp::RequestKind::Wrq,
		}
	}
}

pub fn init_logger(debug_level: DebugLevel) {
	SimpleLogger::new()
		.with_level(debug_level.into())
		.env()
		.init()
		.unwrap();
}
