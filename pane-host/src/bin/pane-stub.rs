//! Minimal remote UI: maps the shared surface, paints it, reports ready and
//! echoes `param` messages back to the host.
//!
//! Pass `--ignore-eof` to keep running after the host closes the transport.

use pane_protocol::capability::{CapabilityError, request_capability};
use pane_protocol::surface::lookup;
use pane_protocol::{
	EventKind, FrameError, HostPacket, LaunchArgs, MessageError, RemoteChannel, RemoteError, StructuredMessage,
	SurfaceArg, SurfaceError, SurfaceId, SurfaceLocator, SurfaceRef,
};
use std::process::ExitCode;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
enum StubError {
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
	#[error(transparent)]
	Frame(#[from] FrameError),
	#[error(transparent)]
	Message(#[from] MessageError),
	#[error(transparent)]
	Surface(#[from] SurfaceError),
	#[error(transparent)]
	Capability(#[from] CapabilityError),
	#[error("blocking task failed: {0}")]
	Join(#[from] tokio::task::JoinError),
}

struct Canvas {
	source: SurfaceArg,
	tag: u32,
	view: Option<SurfaceRef>,
}

impl Canvas {
	fn new(source: SurfaceArg) -> Self {
		Self {
			source,
			tag: 0,
			view: None,
		}
	}

	/// Switch to the generation named by `tag`; 0 means the launch surface.
	/// A generation the host already retired is skipped; a later Resize
	/// names its successor.
	async fn attach(&mut self, tag: u32) -> Result<(), StubError> {
		match &self.source {
			SurfaceArg::None => return Ok(()),
			SurfaceArg::Id(initial) => {
				let id = if tag == 0 { *initial } else { SurfaceId(tag) };
				if self.view.is_some() && id.0 == self.tag {
					return Ok(());
				}
				match lookup(SurfaceLocator::Global(id)) {
					Ok(view) => {
						self.view = Some(view);
						self.tag = id.0;
					}
					Err(SurfaceError::UnknownSurface(id)) if self.view.is_some() => {
						tracing::debug!(%id, "generation already retired, keeping current mapping");
						return Ok(());
					}
					Err(e) => return Err(e.into()),
				}
			}
			SurfaceArg::Service(path) => {
				if self.view.is_some() && tag <= self.tag {
					return Ok(());
				}
				loop {
					let path = path.clone();
					let (grant, fd) = tokio::task::spawn_blocking(move || request_capability(&path)).await??;
					self.view = Some(lookup(SurfaceLocator::Capability(fd))?);
					self.tag = grant.generation;
					tracing::debug!(generation = grant.generation, width = grant.width, height = grant.height, "surface mapped");
					if grant.generation >= tag {
						break;
					}
				}
			}
		}
		self.paint();
		Ok(())
	}

	fn paint(&mut self) {
		let shade = (self.tag.wrapping_mul(40) & 0xFF) as u8;
		if let Some(view) = &mut self.view {
			for px in view.pixels_mut().chunks_exact_mut(4) {
				px.copy_from_slice(&[0x20, 0x80, shade, 0xFF]);
			}
		}
	}
}

fn spawn_reader(mut channel: RemoteChannel, tx: mpsc::Sender<Result<HostPacket, FrameError>>) -> std::io::Result<()> {
	std::thread::Builder::new()
		.name("pane-stub-reader".into())
		.spawn(move || {
			loop {
				match channel.recv() {
					Ok(packet) => {
						if tx.blocking_send(Ok(packet)).is_err() {
							break;
						}
					}
					Err(e @ (RemoteError::Packet(_) | RemoteError::Message(_))) => {
						tracing::warn!("dropping packet: {e}")
					}
					Err(RemoteError::Frame(e)) => {
						let _ = tx.blocking_send(Err(e));
						break;
					}
				}
			}
		})?;
	Ok(())
}

async fn run(args: LaunchArgs, ignore_eof: bool) -> Result<(), StubError> {
	let channel = RemoteChannel::open(args.transport)?;
	let writer = channel.writer();
	let (tx, mut rx) = mpsc::channel(64);
	spawn_reader(channel, tx)?;

	let mut canvas = Canvas::new(args.surface.clone());
	canvas.attach(0).await?;
	writer.write_frame(&StructuredMessage::ready().encode()?)?;
	tracing::info!(protocol = pane_protocol::PROTOCOL_VERSION, scale = args.scale, "stub ready");

	while let Some(packet) = rx.recv().await {
		match packet {
			Ok(HostPacket::Message(message)) => {
				if message.as_param().is_some() {
					writer.write_frame(&message.encode()?)?;
				} else {
					tracing::debug!(tag = message.tag(), "ignoring message");
				}
			}
			Ok(HostPacket::Input(event)) if event.kind == EventKind::Resize => {
				let tag = event.generation().unwrap_or_default();
				tracing::debug!(tag, size = ?event.size(), "resize");
				canvas.attach(tag).await?;
			}
			Ok(HostPacket::Input(event)) => tracing::trace!(?event, "input"),
			Err(FrameError::Eof | FrameError::Closed) => {
				tracing::info!("host closed the transport");
				if ignore_eof {
					std::future::pending::<()>().await;
				}
				break;
			}
			Err(e) => return Err(e.into()),
		}
	}
	Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.with_writer(std::io::stderr)
		.with_ansi(false)
		.init();

	let args = match LaunchArgs::parse(std::env::args().skip(1)) {
		Ok(args) => args,
		Err(e) => {
			tracing::error!("bad arguments: {e}");
			return ExitCode::from(2);
		}
	};
	let ignore_eof = args.extra.iter().any(|a| a == "--ignore-eof");
	match run(args, ignore_eof).await {
		Ok(()) => ExitCode::SUCCESS,
		Err(e) => {
			tracing::error!("stub failed: {e}");
			ExitCode::FAILURE
		}
	}
}
