//! One hosted remote UI: surface, child process, transport, dispatcher and
//! capability channel wired together behind a small control surface.

use pane_protocol::capability::CapabilityError;
use pane_protocol::{
	CapabilityGrant, FrameError, FrameWriter, HostFraming, HostPacket, InputEvent, PacketError, SharedSurface,
	StructuredMessage, SurfaceArg, SurfaceBackend, SurfaceError, SurfaceId, SurfaceRef,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use crate::capability::{CapabilityServer, CapabilityTransfer};
use crate::config::HostConfig;
use crate::consumer::ConsumerContext;
use crate::dispatcher::{ClosedHandler, DispatchHandlers, Dispatcher, MessageHandler, SignalHandler};
use crate::params::{self, ParamModel};
use crate::supervisor::{LaunchCommand, LaunchError, StopOutcome, Supervisor};

#[derive(Debug, Error)]
pub enum SessionError {
	#[error("session is not running")]
	NotRunning,
	#[error("invalid size {width}x{height}")]
	InvalidSize { width: u32, height: u32 },
	#[error("structured messages are not supported on the pipe transport")]
	MessagesUnsupported,
	#[error(transparent)]
	Launch(#[from] LaunchError),
	#[error(transparent)]
	Surface(#[from] SurfaceError),
	#[error(transparent)]
	Capability(#[from] CapabilityError),
	#[error(transparent)]
	Frame(#[from] FrameError),
	#[error(transparent)]
	Packet(PacketError),
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}

impl From<PacketError> for SessionError {
	fn from(e: PacketError) -> Self {
		match e {
			PacketError::MessagesUnsupported => Self::MessagesUnsupported,
			other => Self::Packet(other),
		}
	}
}

/// What the view layer needs to find the current surface generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceInfo {
	pub generation: u32,
	/// Pixels, i.e. logical size times scale.
	pub width: u32,
	pub height: u32,
	pub backend: SurfaceBackend,
	/// Set for the global backend.
	pub id: Option<SurfaceId>,
}

impl SurfaceInfo {
	fn of(surface: &SharedSurface) -> Option<Self> {
		let (width, height) = surface.size()?;
		Some(Self {
			generation: surface.generation()?,
			width,
			height,
			backend: surface.backend(),
			id: surface.id(),
		})
	}
}

pub type SurfaceHandler = Arc<dyn Fn(SurfaceInfo) + Send + Sync>;

pub struct SessionBuilder {
	executable: PathBuf,
	context: Arc<dyn ConsumerContext>,
	config: HostConfig,
	on_message: Option<MessageHandler>,
	on_ready: Option<SignalHandler>,
	on_closed: Option<ClosedHandler>,
	on_surface: Option<SurfaceHandler>,
	param_model: Option<Arc<dyn ParamModel>>,
}

impl SessionBuilder {
	pub fn config(mut self, config: HostConfig) -> Self {
		self.config = config;
		self
	}

	pub fn on_message(mut self, f: impl Fn(StructuredMessage) + Send + Sync + 'static) -> Self {
		self.on_message = Some(Arc::new(f));
		self
	}

	pub fn on_ready(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
		self.on_ready = Some(Arc::new(f));
		self
	}

	pub fn on_closed(mut self, f: impl Fn(crate::dispatcher::CloseReason) + Send + Sync + 'static) -> Self {
		self.on_closed = Some(Arc::new(f));
		self
	}

	/// Called on the consumer context after every resize; switch painting
	/// to the new generation, then call [`Session::surface_adopted`].
	pub fn on_surface(mut self, f: impl Fn(SurfaceInfo) + Send + Sync + 'static) -> Self {
		self.on_surface = Some(Arc::new(f));
		self
	}

	pub fn param_model(mut self, model: Arc<dyn ParamModel>) -> Self {
		self.param_model = Some(model);
		self
	}

	pub fn build(self) -> Session {
		// Inbound params reach the model before the host's own callback.
		let on_message = match (self.param_model.clone(), self.on_message) {
			(Some(model), user) => {
				let forward: MessageHandler = Arc::new(move |message: StructuredMessage| {
					params::apply_param(model.as_ref(), &message);
					if let Some(user) = &user {
						user(message);
					}
				});
				Some(forward)
			}
			(None, user) => user,
		};
		Session {
			supervisor: Supervisor::new(self.config.supervisor.clone()),
			executable: self.executable,
			context: self.context,
			config: self.config,
			handlers: DispatchHandlers {
				on_message,
				on_ready: self.on_ready,
				on_closed: self.on_closed,
			},
			on_surface: self.on_surface,
			param_model: self.param_model,
			link: Mutex::new(None),
			running: Mutex::new(None),
		}
	}
}

#[derive(Clone)]
struct Link {
	writer: Arc<FrameWriter>,
	framing: HostFraming,
}

struct Running {
	surface: SharedSurface,
	dispatcher: Dispatcher,
	capability: Option<CapabilityTransfer>,
}

pub struct Session {
	executable: PathBuf,
	config: HostConfig,
	context: Arc<dyn ConsumerContext>,
	handlers: DispatchHandlers,
	on_surface: Option<SurfaceHandler>,
	param_model: Option<Arc<dyn ParamModel>>,
	supervisor: Supervisor,
	link: Mutex<Option<Link>>,
	running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for Session {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Session")
			.field("executable", &self.executable)
			.field("supervisor", &self.supervisor)
			.field("surface", &self.surface())
			.finish_non_exhaustive()
	}
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn grant_for(surface: &SharedSurface) -> Option<CapabilityGrant> {
	let (width, height) = surface.size()?;
	Some(CapabilityGrant {
		generation: surface.generation()?,
		width,
		height,
	})
}

impl Session {
	pub fn builder(executable: impl Into<PathBuf>, context: Arc<dyn ConsumerContext>) -> SessionBuilder {
		SessionBuilder {
			executable: executable.into(),
			context,
			config: HostConfig::default(),
			on_message: None,
			on_ready: None,
			on_closed: None,
			on_surface: None,
			param_model: None,
		}
	}

	pub fn config(&self) -> &HostConfig {
		&self.config
	}

	/// Surface generation 1, child process, dispatcher, then capability
	/// hand-off. Anything acquired before a failure is released again.
	#[tracing::instrument(level = "debug", skip(self), fields(executable = %self.executable.display()))]
	pub fn launch(&self, width: u32, height: u32) -> Result<(), SessionError> {
		if width == 0 || height == 0 {
			return Err(SessionError::InvalidSize { width, height });
		}
		let mut running = lock(&self.running);
		if running.is_some() {
			return Err(LaunchError::AlreadyRunning.into());
		}
		let (pixel_width, pixel_height) = self.config.pixel_size(width, height);
		let (surface, server) = self.allocate_surface(pixel_width, pixel_height)?;

		let surface_arg = match (&server, surface.id()) {
			(Some(server), _) => SurfaceArg::Service(server.service_name().to_path_buf()),
			(None, Some(id)) => SurfaceArg::Id(id),
			(None, None) => return Err(SurfaceError::NotCreated.into()),
		};
		let command = LaunchCommand {
			executable: self.executable.clone(),
			transport: self.config.transport,
			scale: self.config.scale,
			surface: surface_arg,
			extra_args: self.config.extra_args.clone(),
			working_dir: self.config.working_dir.clone(),
		};
		if let Err(e) = self.supervisor.launch(&command) {
			drop(surface);
			drop(server);
			return Err(e.into());
		}

		let started = self.start_channels(&surface, server);
		let (link, dispatcher, capability) = match started {
			Ok(parts) => parts,
			Err(e) => {
				self.supervisor.stop();
				drop(surface);
				return Err(e);
			}
		};

		let tag = surface.generation_tag().unwrap_or_default();
		*running = Some(Running {
			surface,
			dispatcher,
			capability,
		});
		drop(running);
		*lock(&self.link) = Some(link);

		// Tells the remote its logical size and the first generation.
		if let Err(e) = self.send_input(InputEvent::resize(width, height, self.config.scale, tag)) {
			tracing::warn!("initial resize not delivered: {e}");
		}
		tracing::info!(pid = self.supervisor.pid(), width, height, "session launched");
		Ok(())
	}

	fn allocate_surface(
		&self,
		width: u32,
		height: u32,
	) -> Result<(SharedSurface, Option<CapabilityServer>), SessionError> {
		if self.config.surface.backend() == SurfaceBackend::Capability {
			let mut surface = SharedSurface::new(SurfaceBackend::Capability);
			match surface.create(width, height) {
				Ok(()) => match CapabilityServer::create() {
					Ok(server) => return Ok((surface, Some(server))),
					Err(e) => tracing::warn!("capability service unavailable, using global surface ids: {e}"),
				},
				Err(SurfaceError::Unsupported) => {
					tracing::warn!("capability surfaces unsupported, using global surface ids");
				}
				Err(e) => return Err(e.into()),
			}
		}
		let mut surface = SharedSurface::new(SurfaceBackend::Global);
		surface.create(width, height)?;
		Ok((surface, None))
	}

	fn start_channels(
		&self,
		surface: &SharedSurface,
		server: Option<CapabilityServer>,
	) -> Result<(Link, Dispatcher, Option<CapabilityTransfer>), SessionError> {
		let writer = self.supervisor.writer().ok_or(SessionError::NotRunning)?;
		let reader = self.supervisor.take_reader().ok_or(SessionError::NotRunning)?;
		let link = Link {
			writer,
			framing: self.supervisor.framing(),
		};
		let dispatcher = Dispatcher::start(
			reader,
			self.context.clone(),
			self.handlers.clone(),
			self.config.dispatcher.clone(),
		)?;
		let capability = match server {
			Some(server) => {
				let transfer = CapabilityTransfer::start(Arc::new(server))?;
				let grant = grant_for(surface).ok_or(SurfaceError::NotCreated)?;
				transfer.offer(grant, surface.create_capability()?);
				Some(transfer)
			}
			None => None,
		};
		Ok((link, dispatcher, capability))
	}

	/// Tear down in order: capability channel, child, dispatcher, surface.
	/// Safe to call repeatedly and concurrently with sends or resizes.
	pub fn stop(&self) -> StopOutcome {
		let running = lock(&self.running).take();
		if let Some(running) = &running {
			running.dispatcher.mark_stopping();
		}
		// Writers blocked on a full transport fail fast from here on.
		if let Some(link) = lock(&self.link).take() {
			link.writer.close();
		}
		let Some(mut running) = running else {
			return self.supervisor.stop();
		};
		if let Some(mut capability) = running.capability.take() {
			capability.shutdown();
		}
		let outcome = self.supervisor.stop();
		running.dispatcher.stop();
		running.surface.release();
		tracing::info!(?outcome, "session stopped");
		outcome
	}

	pub fn is_running(&self) -> bool {
		self.supervisor.is_running()
	}

	fn link(&self) -> Result<Link, SessionError> {
		lock(&self.link).clone().ok_or(SessionError::NotRunning)
	}

	#[tracing::instrument(level = "trace", skip(self))]
	pub fn send_input(&self, event: InputEvent) -> Result<(), SessionError> {
		let link = self.link()?;
		let payload = HostPacket::Input(event).encode(link.framing)?;
		link.writer.write_frame(&payload)?;
		Ok(())
	}

	pub fn send_message(&self, message: &StructuredMessage) -> Result<(), SessionError> {
		let link = self.link()?;
		if link.framing == HostFraming::InputOnly {
			return Err(SessionError::MessagesUnsupported);
		}
		let payload = HostPacket::Message(message.clone()).encode(link.framing)?;
		link.writer.write_frame(&payload)?;
		tracing::trace!(tag = message.tag(), "message sent");
		Ok(())
	}

	/// Push every current parameter value to the remote.
	pub fn publish_params(&self) -> Result<usize, SessionError> {
		let Some(model) = &self.param_model else {
			return Ok(0);
		};
		let messages = params::snapshot(model.as_ref());
		for message in &messages {
			self.send_message(message)?;
		}
		Ok(messages.len())
	}

	/// New surface generation at the given logical size. The remote learns
	/// about it through a Resize event; the view layer through `on_surface`.
	/// On failure the previous generation stays current.
	#[tracing::instrument(level = "debug", skip(self))]
	pub fn resize(&self, width: u32, height: u32) -> Result<u32, SessionError> {
		if width == 0 || height == 0 {
			return Err(SessionError::InvalidSize { width, height });
		}
		let (pixel_width, pixel_height) = self.config.pixel_size(width, height);
		let (generation, tag, info) = {
			let mut running = lock(&self.running);
			let running = running.as_mut().ok_or(SessionError::NotRunning)?;
			let generation = running.surface.resize(pixel_width, pixel_height)?;
			if let Some(capability) = &running.capability {
				let grant = CapabilityGrant {
					generation,
					width: pixel_width,
					height: pixel_height,
				};
				capability.offer(grant, running.surface.create_capability()?);
			}
			(
				generation,
				running.surface.generation_tag().unwrap_or(generation),
				SurfaceInfo::of(&running.surface),
			)
		};
		self.send_input(InputEvent::resize(width, height, self.config.scale, tag))?;
		if let (Some(on_surface), Some(info)) = (self.on_surface.clone(), info) {
			self.context.schedule(Box::new(move || on_surface(info)));
		}
		Ok(generation)
	}

	/// The view layer now paints from `generation`; older ones are freed.
	pub fn surface_adopted(&self, generation: u32) -> usize {
		let mut running = lock(&self.running);
		match running.as_mut() {
			Some(running) if running.surface.generation() == Some(generation) => {
				let retired = running.surface.retire_superseded();
				if retired > 0 {
					tracing::debug!(generation, retired, "retired superseded surfaces");
				}
				retired
			}
			_ => 0,
		}
	}

	pub fn surface(&self) -> Option<SurfaceInfo> {
		lock(&self.running).as_ref().and_then(|r| SurfaceInfo::of(&r.surface))
	}

	/// Host-side mapping of the current generation, for painting.
	pub fn map_surface(&self) -> Result<SurfaceRef, SessionError> {
		let running = lock(&self.running);
		let running = running.as_ref().ok_or(SessionError::NotRunning)?;
		Ok(running.surface.map_current()?)
	}
}

impl Drop for Session {
	fn drop(&mut self) {
		self.stop();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::consumer::QueueContext;

	fn session(executable: &str) -> Session {
		Session::builder(executable, Arc::new(QueueContext::new())).build()
	}

	#[test]
	fn missing_executable_leaves_nothing_behind() {
		let session = session("/nonexistent/pane-remote");
		let err = session.launch(10, 10).unwrap_err();
		assert!(matches!(err, SessionError::Launch(LaunchError::ExecutableMissing(_))));
		assert!(session.surface().is_none());
		assert!(!session.is_running());
		assert_eq!(session.stop(), StopOutcome::NotRunning);
	}

	#[test]
	fn calls_before_launch_report_not_running() {
		let session = session("/bin/sh");
		assert!(matches!(session.send_input(InputEvent::focus(true)), Err(SessionError::NotRunning)));
		assert!(matches!(
			session.send_message(&StructuredMessage::ready()),
			Err(SessionError::NotRunning)
		));
		assert!(matches!(session.resize(5, 5), Err(SessionError::NotRunning)));
		assert!(matches!(session.map_surface(), Err(SessionError::NotRunning)));
		assert_eq!(session.surface_adopted(1), 0);
	}

	#[test]
	fn zero_size_is_rejected() {
		let session = session("/bin/sh");
		assert!(matches!(
			session.launch(0, 10),
			Err(SessionError::InvalidSize { width: 0, height: 10 })
		));
	}

	#[test]
	fn packet_errors_map_to_session_errors() {
		assert!(matches!(
			SessionError::from(PacketError::MessagesUnsupported),
			SessionError::MessagesUnsupported
		));
		assert!(matches!(SessionError::from(PacketError::Empty), SessionError::Packet(_)));
	}
}
