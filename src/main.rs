pub mod cli;
pub mod tftp;
pub mod server;
pub mod client;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::OnceLock;
use tokio_util::sync::CancellationToken;

use log::{info, debug, error};
use clap::Parser;

static WORKING_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Shortcut used to get the working dir without needing to check or unwrap
/// everywhere. Initialized in early main; if init fails the program stops,
/// so it's safe to just unwrap it from here on.
fn working_dir<'a>() -> &'a PathBuf {
	WORKING_DIR.get().unwrap()
}

#[tokio::main]
async fn main() {
	let options = cli::Options::parse();

	cli::init_logger(options.debug);

	if let Some(root_dir) = options.root_dir {
		let expanded = PathBuf::from(shellexpand::tilde(&root_dir.to_string_lossy()).into_owned());
		match expanded.try_exists() {
			Ok(true) => WORKING_DIR.set(expanded).unwrap_or(()),
			_ => {
				error!("Cannot find/access specified root path!");
				std::process::exit(1);
			}
		}
	} else if let Err(e) = WORKING_DIR.get_or_try_init(std::env::current_dir) {
		error!("Cannot access current working dir: {}!", e);
		std::process::exit(1);
	}

	debug!("working dir '{}'", working_dir().display());

	let cancel_token: CancellationToken = CancellationToken::new();
	let sigint_token = cancel_token.clone();

	ctrlc::set_handler(move || {
		info!("Received SIGINT");
		sigint_token.cancel();
	}).unwrap();

	let res = match options.run_mode {
		cli::RunMode::Server { bind, port, server_opts } => {
			let listen_addr = SocketAddr::from((bind, port));
			let config = server_opts.into_config();
			server::server_task(listen_addr, working_dir().clone(), config, cancel_token).await
		},
		cli::RunMode::Client { client_opts, action } => {
			let opts = action.opts().clone();
			let server = SocketAddr::from((opts.server, opts.port));
			let mut file = working_dir().clone();
			file.push(&opts.file);
			client::run_client(action, client_opts, server, file).await
		}
	};

	if let Err(e) = res {
		error!("{}", e);
		std::process::exit(1);
	}
}
