use std::fs::OpenOptions;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[allow(unused)]
use log::{info, warn, error, debug, trace};

use tokio_util::sync::CancellationToken;

use crate::tftp::config::OperationConfig;
use crate::tftp::listener::{RequestHandler, ServerListener};
use crate::tftp::operation::{DataSink, DataSource, TransferStatus};
use crate::tftp::{ErrorCode, Mode};

struct FileSource {
	file: std::fs::File,
	size: u64,
}

impl DataSource for FileSource {
	fn send_data(&mut self, max_bytes: usize) -> io::Result<Vec<u8>> {
		use std::io::Read;
		let mut buf = vec![0u8; max_bytes];
		let n = self.file.read(&mut buf)?;
		buf.truncate(n);
		Ok(buf)
	}

	fn requested_transfer_size(&mut self) -> Option<u64> {
		Some(self.size)
	}

	fn finished(&mut self, status: TransferStatus) {
		debug!("RRQ finished: {:?}", status);
	}
}

struct FileSink {
	file: std::fs::File,
}

impl DataSink for FileSink {
	fn received_data(&mut self, bytes: &[u8]) -> io::Result<()> {
		use std::io::Write;
		self.file.write_all(bytes)
	}

	fn finished(&mut self, status: TransferStatus) {
		debug!("WRQ finished: {:?}", status);
	}
}

/// Confines every request to `root`, rejecting `..` traversal and absolute
/// paths the way a real TFTP server must, since the protocol itself carries
/// no other access control.
fn resolve_within_root(root: &Path, requested: &str) -> Option<PathBuf> {
	let requested = Path::new(requested);
	if requested.is_absolute() || requested.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
		return None;
	}
	Some(root.join(requested))
}

pub struct FilesystemRequestHandler {
	root: PathBuf,
}

impl FilesystemRequestHandler {
	pub fn new(root: PathBuf) -> Self {
		FilesystemRequestHandler { root }
	}
}

impl RequestHandler for FilesystemRequestHandler {
	fn open_read(&self, filename: &str, _mode: Mode, client: SocketAddr) -> Result<Box<dyn DataSource>, ErrorCode> {
		let path = resolve_within_root(&self.root, filename).ok_or(ErrorCode::AccessViolation)?;
		let file = OpenOptions::new().read(true).open(&path).map_err(|e| match e.kind() {
			io::ErrorKind::NotFound => ErrorCode::FileNotFound,
			io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
			_ => ErrorCode::NotDefined,
		})?;
		let size = file.metadata().map_err(|_| ErrorCode::NotDefined)?.len();
		info!("RRQ {:?} from {}", path, client);
		Ok(Box::new(FileSource { file, size }))
	}

	fn open_write(&self, filename: &str, _mode: Mode, client: SocketAddr) -> Result<Box<dyn DataSink>, ErrorCode> {
		let path = resolve_within_root(&self.root, filename).ok_or(ErrorCode::AccessViolation)?;
		let file = OpenOptions::new()
			.create_new(true)
			.write(true)
			.open(&path)
			.map_err(|e| match e.kind() {
				io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
				io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
				_ => ErrorCode::NotDefined,
			})?;
		info!("WRQ {:?} from {}", path, client);
		Ok(Box::new(FileSink { file }))
	}
}

pub async fn server_task(
	listen_addr: SocketAddr,
	root: PathBuf,
	config: OperationConfig,
	cancel_token: CancellationToken,
) -> Result<(), String> {
	let handler: Arc<dyn RequestHandler> = Arc::new(FilesystemRequestHandler::new(root));
	let listener = ServerListener::bind(listen_addr, handler, config).await.map_err(|e| e.to_string())?;
	info!("listening on {}", listen_addr);
	listener.run(cancel_token).await.map_err(|e| e.to_string())
}
