//! Host side of capability transfer: a per-session rendezvous socket and the
//! thread that hands surface descriptors to the remote through it.

use pane_protocol::CapabilityGrant;
use pane_protocol::capability::{CapabilityError, send_capability};
use std::os::fd::OwnedFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;

/// Rendezvous point the remote connects to, once per surface generation.
#[derive(Debug)]
pub struct CapabilityServer {
	path: PathBuf,
	listener: UnixListener,
	destroyed: AtomicBool,
}

impl CapabilityServer {
	/// Bind a fresh service socket under `$XDG_RUNTIME_DIR`, or the temp dir.
	pub fn create() -> Result<Self, CapabilityError> {
		let dir = std::env::var_os("XDG_RUNTIME_DIR")
			.map(PathBuf::from)
			.filter(|d| d.is_dir())
			.unwrap_or_else(std::env::temp_dir);
		Self::create_in(&dir)
	}

	pub fn create_in(dir: &Path) -> Result<Self, CapabilityError> {
		let name = format!(
			"{}-{}-{:08x}.sock",
			pane_protocol::PROTOCOL_NAME,
			std::process::id(),
			rand::random::<u32>()
		);
		let path = dir.join(name);
		let listener = UnixListener::bind(&path)?;
		tracing::debug!(path = %path.display(), "capability service bound");
		Ok(Self {
			path,
			listener,
			destroyed: AtomicBool::new(false),
		})
	}

	/// The name the remote is told on its command line.
	pub fn service_name(&self) -> &Path {
		&self.path
	}

	pub fn is_destroyed(&self) -> bool {
		self.destroyed.load(Ordering::Acquire)
	}

	/// Block until a remote connects.
	pub fn accept(&self) -> Result<UnixStream, CapabilityError> {
		if self.is_destroyed() {
			return Err(CapabilityError::Destroyed);
		}
		let (stream, _) = self.listener.accept()?;
		if self.is_destroyed() {
			return Err(CapabilityError::Destroyed);
		}
		Ok(stream)
	}

	/// Block until a remote connects, then hand it `descriptor`.
	pub fn send_port(&self, grant: &CapabilityGrant, descriptor: &OwnedFd) -> Result<(), CapabilityError> {
		let stream = self.accept()?;
		send_capability(&stream, grant, descriptor)
	}

	/// Tear down the rendezvous point and wake a blocked [`Self::accept`].
	/// Idempotent.
	pub fn destroy(&self) {
		if self.destroyed.swap(true, Ordering::AcqRel) {
			return;
		}
		// accept() only returns on a connection; make one.
		if let Err(e) = UnixStream::connect(&self.path) {
			tracing::trace!("capability wake connect: {e}");
		}
		if let Err(e) = std::fs::remove_file(&self.path) {
			tracing::debug!(path = %self.path.display(), "removing capability socket: {e}");
		}
	}
}

impl Drop for CapabilityServer {
	fn drop(&mut self) {
		self.destroy();
	}
}

struct Offer {
	grant: CapabilityGrant,
	descriptor: OwnedFd,
}

/// Dedicated thread that serves queued grants. When several generations
/// queue up before the remote connects, only the newest is handed off.
#[derive(Debug)]
pub struct CapabilityTransfer {
	server: Arc<CapabilityServer>,
	tx: Option<mpsc::Sender<Offer>>,
	thread: Option<JoinHandle<()>>,
}

impl CapabilityTransfer {
	pub fn start(server: Arc<CapabilityServer>) -> std::io::Result<Self> {
		let (tx, rx) = mpsc::channel();
		let thread_server = server.clone();
		let thread = std::thread::Builder::new()
			.name("pane-capability".into())
			.spawn(move || serve(&thread_server, rx))?;
		Ok(Self {
			server,
			tx: Some(tx),
			thread: Some(thread),
		})
	}

	pub fn service_name(&self) -> &Path {
		self.server.service_name()
	}

	pub fn offer(&self, grant: CapabilityGrant, descriptor: OwnedFd) {
		let Some(tx) = &self.tx else {
			return;
		};
		if tx.send(Offer { grant, descriptor }).is_err() {
			tracing::debug!(generation = grant.generation, "capability thread gone, dropping offer");
		}
	}

	/// Destroy the server and join the thread. Idempotent.
	pub fn shutdown(&mut self) {
		self.server.destroy();
		self.tx.take();
		if let Some(thread) = self.thread.take() {
			if thread.join().is_err() {
				tracing::error!("capability thread panicked");
			}
		}
	}
}

impl Drop for CapabilityTransfer {
	fn drop(&mut self) {
		self.shutdown();
	}
}

fn newest(rx: &mpsc::Receiver<Offer>, mut offer: Offer) -> Offer {
	while let Ok(newer) = rx.try_recv() {
		offer = newer;
	}
	offer
}

fn serve(server: &CapabilityServer, rx: mpsc::Receiver<Offer>) {
	while let Ok(offer) = rx.recv() {
		let stream = match server.accept() {
			Ok(stream) => stream,
			Err(CapabilityError::Destroyed) => break,
			Err(e) => {
				tracing::warn!(generation = offer.grant.generation, "capability accept failed: {e}");
				continue;
			}
		};
		// Resizes may have queued newer generations while we waited.
		let offer = newest(&rx, offer);
		match send_capability(&stream, &offer.grant, &offer.descriptor) {
			Ok(()) => tracing::debug!(generation = offer.grant.generation, "capability handed off"),
			Err(e) => tracing::warn!(generation = offer.grant.generation, "capability send failed: {e}"),
		}
	}
	tracing::trace!("capability thread exiting");
}

#[cfg(test)]
mod tests {
	use super::*;
	use pane_protocol::capability::request_capability;
	use std::io::{Read, Write};

	fn pipe_offer(generation: u32) -> (CapabilityGrant, OwnedFd, std::io::PipeReader) {
		let (reader, writer) = std::io::pipe().unwrap();
		let grant = CapabilityGrant {
			generation,
			width: 10,
			height: 10,
		};
		(grant, writer.into(), reader)
	}

	#[test]
	fn send_port_hands_descriptor_to_client() {
		let server = Arc::new(CapabilityServer::create().unwrap());
		let path = server.service_name().to_path_buf();
		let (grant, fd, mut reader) = pipe_offer(1);
		let sender = {
			let server = server.clone();
			std::thread::spawn(move || server.send_port(&grant, &fd))
		};
		let (received, fd) = request_capability(&path).unwrap();
		assert_eq!(received.generation, 1);
		sender.join().unwrap().unwrap();

		std::fs::File::from(fd).write_all(b"ok").unwrap();
		let mut buf = [0u8; 2];
		reader.read_exact(&mut buf).unwrap();
		assert_eq!(&buf, b"ok");
	}

	#[test]
	fn destroy_unblocks_send_port_and_removes_socket() {
		let server = Arc::new(CapabilityServer::create().unwrap());
		let path = server.service_name().to_path_buf();
		let (grant, fd, _reader) = pipe_offer(1);
		let sender = {
			let server = server.clone();
			std::thread::spawn(move || server.send_port(&grant, &fd))
		};
		std::thread::sleep(std::time::Duration::from_millis(20));
		server.destroy();
		server.destroy();
		assert!(matches!(sender.join().unwrap(), Err(CapabilityError::Destroyed)));
		assert!(!path.exists());
	}

	#[test]
	fn transfer_sends_newest_queued_generation() {
		let server = Arc::new(CapabilityServer::create().unwrap());
		let path = server.service_name().to_path_buf();
		let mut transfer = CapabilityTransfer::start(server).unwrap();
		let mut readers = Vec::new();
		for generation in 1..=3 {
			let (grant, fd, reader) = pipe_offer(generation);
			readers.push(reader);
			transfer.offer(grant, fd);
		}
		// Connection is made after all three are queued.
		std::thread::sleep(std::time::Duration::from_millis(20));
		let (received, _) = request_capability(&path).unwrap();
		assert_eq!(received.generation, 3);
		transfer.shutdown();
		transfer.shutdown();
	}
}
