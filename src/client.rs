use std::fs::{File, OpenOptions};
use std::io::{self, Read as _, Seek, SeekFrom, Write as _};
use std::net::SocketAddr;
use std::path::PathBuf;

use tokio::net::UdpSocket;

#[allow(unused)]
use log::{info, warn, error, debug, trace};

use crate::cli;
use crate::tftp::config::OperationConfig;
use crate::tftp::operation::{ClientOperationBuilder, DataSink, DataSource, TransferStatus};
use crate::tftp::{Mode, RequestKind};

/// Streams a file's contents out in fixed-size chunks for a client-write
/// (PUT) operation.
struct FileSource {
	file: File,
	size: u64,
}

impl FileSource {
	fn new(file: File) -> io::Result<Self> {
		let size = file.metadata()?.len();
		Ok(FileSource { file, size })
	}
}

impl DataSource for FileSource {
	fn send_data(&mut self, max_bytes: usize) -> io::Result<Vec<u8>> {
		let mut buf = vec![0u8; max_bytes];
		let n = self.file.read(&mut buf)?;
		buf.truncate(n);
		Ok(buf)
	}

	fn requested_transfer_size(&mut self) -> Option<u64> {
		Some(self.size)
	}

	fn finished(&mut self, status: TransferStatus) {
		debug!("PUT finished: {:?}", status);
	}
}

/// Writes inbound bytes to a file for a client-read (GET) operation.
struct FileSink {
	file: File,
	path: PathBuf,
}

impl DataSink for FileSink {
	fn received_data(&mut self, bytes: &[u8]) -> io::Result<()> {
		self.file.write_all(bytes)
	}

	fn finished(&mut self, status: TransferStatus) {
		if status != TransferStatus::Successful {
			// Don't leave a truncated file behind after a failed GET.
			let _ = std::fs::remove_file(&self.path);
		}
		debug!("GET finished: {:?}", status);
	}
}

pub async fn run_client(action: cli::ClientAction, opts: cli::ClientOpts, server: SocketAddr, file: PathBuf) -> Result<(), String> {
	let config: OperationConfig = opts.into_config();
	let bind_addr: SocketAddr = match server {
		SocketAddr::V4(_) => (std::net::Ipv4Addr::UNSPECIFIED, 0).into(),
		SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
	};
	let socket = UdpSocket::bind(bind_addr).await.map_err(|e| e.to_string())?;

	let filename = file
		.file_name()
		.ok_or_else(|| "no filename in path".to_string())?
		.to_string_lossy()
		.to_string();

	let builder = ClientOperationBuilder::new(server, filename, Mode::Octet).config(config);

	let outcome = match action.as_req_kind() {
		RequestKind::Rrq => {
			let out_file = OpenOptions::new()
				.create(true)
				.write(true)
				.truncate(true)
				.open(&file)
				.map_err(|e| e.to_string())?;
			let sink: Box<dyn DataSink> = Box::new(FileSink { file: out_file, path: file.clone() });
			builder.start_read(socket, sink).join().await
		}
		RequestKind::Wrq => {
			let mut in_file = OpenOptions::new().read(true).open(&file).map_err(|e| e.to_string())?;
			in_file.seek(SeekFrom::Start(0)).map_err(|e| e.to_string())?;
			let source: Box<dyn DataSource> = Box::new(FileSource::new(in_file).map_err(|e| e.to_string())?);
			builder.start_write(socket, source).join().await
		}
	};

	let (status, info) = outcome;
	if status == TransferStatus::Successful {
		info!("transfer with {} finished: {:?}", server, status);
		Ok(())
	} else {
		Err(format!("transfer with {} failed: {:?} ({})", server, status, info.message))
	}
}
