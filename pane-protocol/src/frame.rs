use nix::errno::Errno;
use nix::sys::socket::{MsgFlags, send};
use std::io::{self, ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Largest payload a single frame may carry.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;
/// Size of the little-endian length prefix.
pub const HEADER_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum FrameError {
	#[error("transport closed")]
	Closed,
	#[error("end of stream")]
	Eof,
	#[error("invalid frame length {0}")]
	InvalidLength(u32),
	#[error("io error: {0}")]
	Io(#[from] io::Error),
	#[error("nix error: {0}")]
	Nix(#[from] nix::Error),
}

impl FrameError {
	/// Protocol violations end the read loop; they are never retried.
	pub fn is_protocol_violation(&self) -> bool {
		matches!(self, Self::InvalidLength(_))
	}
}

pub fn check_len(len: u32) -> Result<usize, FrameError> {
	if len == 0 || len > MAX_FRAME_LEN {
		return Err(FrameError::InvalidLength(len));
	}
	Ok(len as usize)
}

/// Header and payload laid out in one buffer so a frame is written in a single call.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
	let len = u32::try_from(payload.len()).map_err(|_| FrameError::InvalidLength(u32::MAX))?;
	check_len(len)?;
	let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
	out.extend_from_slice(&len.to_le_bytes());
	out.extend_from_slice(payload);
	Ok(out)
}

pub fn write_frame(sink: &mut impl Write, payload: &[u8]) -> Result<(), FrameError> {
	let encoded = encode_frame(payload)?;
	sink.write_all(&encoded).map_err(map_write_err)?;
	sink.flush().map_err(map_write_err)
}

/// Read one frame, blocking until it is complete.
///
/// A stream that ends before or inside a frame reports [`FrameError::Eof`];
/// a header outside `1..=MAX_FRAME_LEN` reports [`FrameError::InvalidLength`]
/// without allocating the claimed size.
pub fn read_frame(source: &mut impl Read) -> Result<Vec<u8>, FrameError> {
	let mut header = [0u8; HEADER_LEN];
	read_exact_or_eof(source, &mut header)?;
	let len = check_len(u32::from_le_bytes(header))?;
	let mut payload = vec![0u8; len];
	read_exact_or_eof(source, &mut payload)?;
	Ok(payload)
}

fn read_exact_or_eof(source: &mut impl Read, buf: &mut [u8]) -> Result<(), FrameError> {
	match source.read_exact(buf) {
		Ok(()) => Ok(()),
		Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(FrameError::Eof),
		Err(e) => Err(FrameError::Io(e)),
	}
}

fn map_write_err(err: io::Error) -> FrameError {
	match err.kind() {
		ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::NotConnected => {
			FrameError::Closed
		}
		_ => FrameError::Io(err),
	}
}

/// Async counterpart of [`read_frame`].
#[cfg(feature = "async")]
pub async fn read_frame_async<R>(source: &mut R) -> Result<Vec<u8>, FrameError>
where
	R: tokio::io::AsyncRead + Unpin,
{
	use tokio::io::AsyncReadExt;
	let mut header = [0u8; HEADER_LEN];
	match source.read_exact(&mut header).await {
		Ok(_) => {}
		Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(FrameError::Eof),
		Err(e) => return Err(e.into()),
	}
	let len = check_len(u32::from_le_bytes(header))?;
	let mut payload = vec![0u8; len];
	match source.read_exact(&mut payload).await {
		Ok(_) => Ok(payload),
		Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(FrameError::Eof),
		Err(e) => Err(e.into()),
	}
}

/// Async counterpart of [`write_frame`].
#[cfg(feature = "async")]
pub async fn write_frame_async<W>(sink: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
	W: tokio::io::AsyncWrite + Unpin,
{
	use tokio::io::AsyncWriteExt;
	let encoded = encode_frame(payload)?;
	sink.write_all(&encoded).await.map_err(map_write_err)?;
	sink.flush().await.map_err(map_write_err)
}

/// Parent side of a duplex byte channel, before it is split into halves.
#[derive(Debug)]
pub enum Endpoint {
	/// One bidirectional socket.
	Socket(UnixStream),
	/// Two unidirectional pipes. Writing after the reader is gone raises
	/// SIGPIPE unless the process ignores it.
	Pipes {
		reader: io::PipeReader,
		writer: io::PipeWriter,
	},
}

impl Endpoint {
	pub fn split(self) -> io::Result<(FrameReader, FrameWriter)> {
		match self {
			Endpoint::Socket(stream) => {
				let read_half = stream.try_clone()?;
				let shutdown = stream.try_clone()?;
				Ok((
					FrameReader {
						source: Box::new(read_half),
						interrupt: Some(shutdown.try_clone()?),
					},
					FrameWriter::new(Sink::Socket(stream), Some(shutdown)),
				))
			}
			Endpoint::Pipes { reader, writer } => Ok((
				FrameReader {
					source: Box::new(reader),
					interrupt: None,
				},
				FrameWriter::new(Sink::Pipe(Box::new(writer)), None),
			)),
		}
	}
}

/// Blocking inbound half, owned by a single reader thread.
pub struct FrameReader {
	source: Box<dyn Read + Send>,
	interrupt: Option<UnixStream>,
}

impl std::fmt::Debug for FrameReader {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("FrameReader")
			.field("interruptible", &self.interrupt.is_some())
			.finish()
	}
}

impl FrameReader {
	pub fn from_reader(source: impl Read + Send + 'static) -> Self {
		Self {
			source: Box::new(source),
			interrupt: None,
		}
	}

	pub fn read_frame(&mut self) -> Result<Vec<u8>, FrameError> {
		read_frame(&mut self.source)
	}

	/// Handle that can wake a blocked [`FrameReader::read_frame`] from another thread.
	/// Pipe transports have none; their reader ends when the peer closes its end.
	pub fn interrupter(&self) -> Option<FrameInterrupter> {
		self.interrupt
			.as_ref()
			.and_then(|s| s.try_clone().ok())
			.map(FrameInterrupter)
	}
}

#[derive(Debug)]
pub struct FrameInterrupter(UnixStream);

impl FrameInterrupter {
	pub fn interrupt(&self) {
		if let Err(e) = self.0.shutdown(Shutdown::Read) {
			tracing::trace!("reader interrupt: {e}");
		}
	}
}

enum Sink {
	Socket(UnixStream),
	Pipe(Box<dyn Write + Send>),
}

impl Sink {
	fn send(&mut self, payload: &[u8]) -> Result<(), FrameError> {
		match self {
			Sink::Socket(stream) => {
				let encoded = encode_frame(payload)?;
				send_all_nosignal(stream, &encoded)
			}
			Sink::Pipe(w) => write_frame(w, payload),
		}
	}
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: MsgFlags = MsgFlags::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: MsgFlags = MsgFlags::empty();

fn send_all_nosignal(stream: &UnixStream, mut buf: &[u8]) -> Result<(), FrameError> {
	while !buf.is_empty() {
		match send(stream.as_raw_fd(), buf, SEND_FLAGS) {
			Ok(0) => return Err(FrameError::Closed),
			Ok(n) => buf = &buf[n..],
			Err(Errno::EINTR) => continue,
			Err(Errno::EPIPE | Errno::ECONNRESET | Errno::ENOTCONN) => {
				return Err(FrameError::Closed);
			}
			Err(errno) => return Err(FrameError::Nix(errno)),
		}
	}
	Ok(())
}

/// Outbound half, shareable between threads.
///
/// [`FrameWriter::close`] is the graceful-shutdown signal: the peer sees end
/// of input. Writes after it fail with [`FrameError::Closed`] instead of blocking.
pub struct FrameWriter {
	sink: Mutex<Option<Sink>>,
	closed: AtomicBool,
	shutdown: Option<UnixStream>,
}

impl std::fmt::Debug for FrameWriter {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("FrameWriter")
			.field("closed", &self.is_closed())
			.finish()
	}
}

impl FrameWriter {
	fn new(sink: Sink, shutdown: Option<UnixStream>) -> Self {
		Self {
			sink: Mutex::new(Some(sink)),
			closed: AtomicBool::new(false),
			shutdown,
		}
	}

	pub fn from_writer(sink: impl Write + Send + 'static) -> Self {
		Self::new(Sink::Pipe(Box::new(sink)), None)
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}

	#[tracing::instrument(level = "trace", skip_all, fields(len = payload.len()))]
	pub fn write_frame(&self, payload: &[u8]) -> Result<(), FrameError> {
		if self.is_closed() {
			return Err(FrameError::Closed);
		}
		let mut guard = self.sink.lock().map_err(|_| FrameError::Closed)?;
		let sink = guard.as_mut().ok_or(FrameError::Closed)?;
		let result = sink.send(payload);
		// close() could not take the sink while this write held it.
		if self.is_closed() {
			guard.take();
		}
		result
	}

	/// Half-close the outbound direction. Idempotent, and never waits on a
	/// writer that is blocked mid-frame.
	pub fn close(&self) {
		if self.closed.swap(true, Ordering::AcqRel) {
			return;
		}
		if let Some(stream) = &self.shutdown {
			if let Err(e) = stream.shutdown(Shutdown::Write) {
				tracing::trace!("outbound shutdown: {e}");
			}
		}
		if let Ok(mut guard) = self.sink.try_lock() {
			guard.take();
		}
	}
}
