//! The server-side request listener: owns the well-known port, decodes
//! inbound RRQ/WRQ, and hands each off to its own ephemeral-port operation.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::tftp::config::OperationConfig;
use crate::tftp::consts;
use crate::tftp::metrics::SharedPacketSink;
use crate::tftp::operation::{self, DataSink, DataSource, OperationHandle};
use crate::tftp::packet::Packet;
use crate::tftp::{ErrorCode, Mode, RequestKind};

/// What a listener asks its application for once it has decoded a request.
/// A `Err(ErrorCode)` return causes an ERROR reply with no operation spawned.
pub trait RequestHandler: Send + Sync {
	fn open_read(&self, filename: &str, mode: Mode, client: SocketAddr) -> Result<Box<dyn DataSource>, ErrorCode>;
	fn open_write(&self, filename: &str, mode: Mode, client: SocketAddr) -> Result<Box<dyn DataSink>, ErrorCode>;
}

pub type SharedRequestHandler = Arc<dyn RequestHandler>;

/// Owns the well-known (or configured) listening socket. Each accepted
/// request spawns its own `Operation` on a fresh ephemeral-port socket, so
/// the listener itself never blocks on a transfer in progress. No handler
/// installed means every inbound request is refused with `FileNotFound`.
pub struct ServerListener {
	socket: UdpSocket,
	bind_ip: IpAddr,
	handler: Option<SharedRequestHandler>,
	config: OperationConfig,
	metrics: Option<SharedPacketSink>,
}

impl ServerListener {
	pub async fn bind(addr: SocketAddr, handler: SharedRequestHandler, config: OperationConfig) -> io::Result<Self> {
		Self::bind_with(addr, Some(handler), config).await
	}

	/// Binds the listener with no handler installed yet; every request is
	/// refused with `FileNotFound` until `with_handler` installs one.
	pub async fn bind_unhandled(addr: SocketAddr, config: OperationConfig) -> io::Result<Self> {
		Self::bind_with(addr, None, config).await
	}

	async fn bind_with(addr: SocketAddr, handler: Option<SharedRequestHandler>, config: OperationConfig) -> io::Result<Self> {
		let socket = UdpSocket::bind(addr).await?;
		Ok(ServerListener {
			socket,
			bind_ip: addr.ip(),
			handler,
			config,
			metrics: None,
		})
	}

	pub fn with_handler(mut self, handler: SharedRequestHandler) -> Self {
		self.handler = Some(handler);
		self
	}

	pub fn with_metrics(mut self, metrics: SharedPacketSink) -> Self {
		self.metrics = Some(metrics);
		self
	}

	pub fn local_addr(&self) -> io::Result<SocketAddr> {
		self.socket.local_addr()
	}

	/// Runs until `cancel` fires. Each dispatched request gets its own
	/// `OperationHandle`; the listener does not wait on them, matching the
	/// original server's one-thread-per-transfer design.
	pub async fn run(&self, cancel: CancellationToken) -> io::Result<()> {
		let mut buf = vec![0u8; consts::MAX_DATAGRAM_SIZE];
		loop {
			let (n, from) = tokio::select! {
				_ = cancel.cancelled() => return Ok(()),
				res = self.socket.recv_from(&mut buf) => res?,
			};

			let pkt = match Packet::decode(&buf[..n]) {
				Ok(pkt) => pkt,
				Err(_) => continue,
			};

			let request = match pkt {
				Packet::Request(req) => req,
				_ => {
					let reply = Packet::error(ErrorCode::IllegalTftpOperation, "expected RRQ or WRQ");
					if let Ok(transient) = UdpSocket::bind(SocketAddr::new(self.bind_ip, 0)).await {
						let _ = transient.send_to(&reply.encode(), from).await;
					}
					continue;
				}
			};

			debug!("{} from {} for {:?}", request.kind, from, request.filename);

			if request.mode != Mode::Octet {
				warn!("{} from {} named unsupported transfer mode {}", request.kind, from, request.mode);
				let reply = Packet::error(ErrorCode::IllegalTftpOperation, "wrong transfer mode");
				let _ = self.socket.send_to(&reply.encode(), from).await;
				continue;
			}

			let Some(handler) = self.handler.as_ref() else {
				warn!("no request handler registered, refusing {} from {}", request.kind, from);
				let reply = Packet::error(ErrorCode::FileNotFound, "no handler registered");
				let _ = self.socket.send_to(&reply.encode(), from).await;
				continue;
			};

			let transfer_socket = match UdpSocket::bind(SocketAddr::new(self.bind_ip, 0)).await {
				Ok(s) => s,
				Err(e) => {
					warn!("could not open transfer socket for {}: {}", from, e);
					continue;
				}
			};

			let handle: Option<OperationHandle> = match request.kind {
				RequestKind::Rrq => match handler.open_read(&request.filename, request.mode, from) {
					Ok(source) => Some(operation::spawn_server_read(
						transfer_socket,
						from,
						request.options,
						self.config,
						source,
						self.metrics.clone(),
					)),
					Err(code) => {
						let reply = Packet::error(code, code.to_string());
						let _ = transfer_socket.send_to(&reply.encode(), from).await;
						None
					}
				},
				RequestKind::Wrq => match handler.open_write(&request.filename, request.mode, from) {
					Ok(sink) => Some(operation::spawn_server_write(
						transfer_socket,
						from,
						request.options,
						self.config,
						sink,
						self.metrics.clone(),
					)),
					Err(code) => {
						let reply = Packet::error(code, code.to_string());
						let _ = transfer_socket.send_to(&reply.encode(), from).await;
						None
					}
				},
			};

			if let Some(handle) = handle {
				info!("{} {} started for {}", request.kind, request.filename, from);
				tokio::spawn(async move {
					let (status, info) = handle.join().await;
					if status == operation::TransferStatus::Successful {
						info!("transfer with {} finished: {:?}", from, status);
					} else {
						warn!("transfer with {} finished: {:?} ({})", from, status, info.message);
					}
				});
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;
	use std::sync::Mutex as StdMutex;

	use crate::tftp::config::OperationConfig;
	use crate::tftp::operation::{ClientOperationBuilder, TransferStatus};
	use crate::tftp::Mode;

	struct InMemoryStore {
		files: Arc<StdMutex<HashMap<String, Vec<u8>>>>,
	}

	struct VecSource {
		data: Vec<u8>,
		pos: usize,
	}

	impl DataSource for VecSource {
		fn send_data(&mut self, max_bytes: usize) -> io::Result<Vec<u8>> {
			let end = (self.pos + max_bytes).min(self.data.len());
			let chunk = self.data[self.pos..end].to_vec();
			self.pos = end;
			Ok(chunk)
		}

		fn requested_transfer_size(&mut self) -> Option<u64> {
			Some(self.data.len() as u64)
		}
	}

	struct VecSink {
		name: String,
		buf: Vec<u8>,
		files: Arc<StdMutex<HashMap<String, Vec<u8>>>>,
	}

	impl DataSink for VecSink {
		fn received_data(&mut self, bytes: &[u8]) -> io::Result<()> {
			self.buf.extend_from_slice(bytes);
			Ok(())
		}

		fn finished(&mut self, status: TransferStatus) {
			if status == TransferStatus::Successful {
				self.files.lock().unwrap().insert(self.name.clone(), std::mem::take(&mut self.buf));
			}
		}
	}

	impl RequestHandler for InMemoryStore {
		fn open_read(&self, filename: &str, _mode: Mode, _client: SocketAddr) -> Result<Box<dyn DataSource>, ErrorCode> {
			let data = self.files.lock().unwrap().get(filename).cloned().ok_or(ErrorCode::FileNotFound)?;
			Ok(Box::new(VecSource { data, pos: 0 }))
		}

		fn open_write(&self, filename: &str, _mode: Mode, _client: SocketAddr) -> Result<Box<dyn DataSink>, ErrorCode> {
			Ok(Box::new(VecSink {
				name: filename.to_string(),
				buf: Vec::new(),
				files: self.files.clone(),
			}))
		}
	}

	#[tokio::test]
	async fn get_transfers_a_previously_stored_file() {
		let files = Arc::new(StdMutex::new(HashMap::new()));
		files.lock().unwrap().insert("greeting.txt".to_string(), b"hello, tftp".to_vec());
		let handler: SharedRequestHandler = Arc::new(InMemoryStore { files });

		let listener = ServerListener::bind("127.0.0.1:0".parse().unwrap(), handler, OperationConfig::default())
			.await
			.unwrap();
		let server_addr = listener.local_addr().unwrap();
		let cancel = CancellationToken::new();
		let listener_cancel = cancel.clone();
		let listener_task = tokio::spawn(async move {
			let _ = listener.run(listener_cancel).await;
		});

		let client_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let received = Arc::new(StdMutex::new(Vec::new()));
		struct CollectSink(Arc<StdMutex<Vec<u8>>>);
		impl DataSink for CollectSink {
			fn received_data(&mut self, bytes: &[u8]) -> io::Result<()> {
				self.0.lock().unwrap().extend_from_slice(bytes);
				Ok(())
			}
		}
		let sink: Box<dyn DataSink> = Box::new(CollectSink(received.clone()));

		let (status, _) = ClientOperationBuilder::new(server_addr, "greeting.txt", Mode::Octet)
			.start_read(client_socket, sink)
			.join()
			.await;

		assert_eq!(status, TransferStatus::Successful);
		assert_eq!(&received.lock().unwrap()[..], b"hello, tftp");

		cancel.cancel();
		let _ = listener_task.await;
	}
}
