//! Spawns the remote executable and owns its lifetime.
//!
//! `NotStarted -> Running -> Stopping -> Stopped`. Stopping closes the
//! outbound half of the transport (the remote sees end of input), waits a
//! bounded grace period, then kills. It never reports failure.

use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::unistd::dup2;
use pane_protocol::launch::CHILD_SOCKET_FD;
use pane_protocol::{Endpoint, FrameReader, FrameWriter, HostFraming, LaunchArgs, SurfaceArg, TransportArg};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use thiserror::Error;

use crate::config::{SupervisorConfig, TransportMode};

#[derive(Debug, Error)]
pub enum LaunchError {
	#[error("executable not found: {}", .0.display())]
	ExecutableMissing(PathBuf),
	#[error("could not create transport: {0}")]
	Ipc(#[source] io::Error),
	#[error("could not spawn {}: {source}", .path.display())]
	Spawn {
		path: PathBuf,
		#[source]
		source: io::Error,
	},
	#[error("remote process is already running")]
	AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
	NotStarted,
	Running,
	Stopping,
	Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
	/// Nothing was running.
	NotRunning,
	/// Exited on its own within the grace period.
	Exited(ExitStatus),
	/// Killed after the grace period.
	Killed(ExitStatus),
	/// Killed but not reaped in time; reaped later when possible.
	Abandoned,
}

/// What to run and how to connect to it.
#[derive(Debug, Clone)]
pub struct LaunchCommand {
	pub executable: PathBuf,
	pub transport: TransportMode,
	pub scale: f32,
	pub surface: SurfaceArg,
	pub extra_args: Vec<String>,
	pub working_dir: Option<PathBuf>,
}

impl LaunchCommand {
	pub fn new(executable: impl Into<PathBuf>, transport: TransportMode) -> Self {
		Self {
			executable: executable.into(),
			transport,
			scale: 1.0,
			surface: SurfaceArg::None,
			extra_args: Vec::new(),
			working_dir: None,
		}
	}

	fn launch_args(&self) -> LaunchArgs {
		LaunchArgs {
			transport: match self.transport {
				TransportMode::Socket => TransportArg::SocketFd(CHILD_SOCKET_FD),
				TransportMode::Pipes => TransportArg::Pipes,
			},
			scale: self.scale,
			surface: self.surface.clone(),
			extra: self.extra_args.clone(),
		}
	}
}

struct Inner {
	state: SupervisorState,
	child: Option<Child>,
	writer: Option<Arc<FrameWriter>>,
	reader: Option<FrameReader>,
	framing: HostFraming,
}

pub struct Supervisor {
	config: SupervisorConfig,
	inner: Mutex<Inner>,
}

impl std::fmt::Debug for Supervisor {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let inner = self.inner();
		f.debug_struct("Supervisor")
			.field("state", &inner.state)
			.field("pid", &inner.child.as_ref().map(Child::id))
			.finish()
	}
}

impl Supervisor {
	pub fn new(config: SupervisorConfig) -> Self {
		Self {
			config,
			inner: Mutex::new(Inner {
				state: SupervisorState::NotStarted,
				child: None,
				writer: None,
				reader: None,
				framing: HostFraming::Tagged,
			}),
		}
	}

	fn inner(&self) -> MutexGuard<'_, Inner> {
		self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	pub fn state(&self) -> SupervisorState {
		self.inner().state
	}

	pub fn pid(&self) -> Option<u32> {
		self.inner().child.as_ref().map(Child::id)
	}

	/// Spawn the remote. Transport endpoints exist before the child does,
	/// so nothing it writes early can be lost.
	#[tracing::instrument(level = "debug", skip_all, fields(executable = %command.executable.display()))]
	pub fn launch(&self, command: &LaunchCommand) -> Result<u32, LaunchError> {
		let mut inner = self.inner();
		if matches!(inner.state, SupervisorState::Running | SupervisorState::Stopping) {
			return Err(LaunchError::AlreadyRunning);
		}
		if !command.executable.is_file() {
			return Err(LaunchError::ExecutableMissing(command.executable.clone()));
		}

		let mut cmd = Command::new(&command.executable);
		cmd.args(command.launch_args().to_args()).stderr(Stdio::inherit());
		if let Some(dir) = &command.working_dir {
			cmd.current_dir(dir);
		}

		// Child ends are held until spawn returns, then dropped with `cmd`.
		let (endpoint, framing, child_socket) = match command.transport {
			TransportMode::Socket => {
				let (parent, child) = UnixStream::pair().map_err(LaunchError::Ipc)?;
				let child_fd = child.as_raw_fd();
				cmd.stdin(Stdio::null());
				// SAFETY: only dup2/fcntl run between fork and exec.
				unsafe {
					cmd.pre_exec(move || {
						if child_fd == CHILD_SOCKET_FD {
							fcntl(child_fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
						} else {
							dup2(child_fd, CHILD_SOCKET_FD)?;
						}
						Ok(())
					});
				}
				(Endpoint::Socket(parent), HostFraming::Tagged, Some(child))
			}
			TransportMode::Pipes => {
				// The child sees plain stdin/stdout; the host end stays a socket so
				// writes to a dead child fail with EPIPE instead of raising SIGPIPE.
				let (parent, child) = UnixStream::pair().map_err(LaunchError::Ipc)?;
				let child_stdout = child.try_clone().map_err(LaunchError::Ipc)?;
				cmd.stdin(OwnedFd::from(child)).stdout(OwnedFd::from(child_stdout));
				(Endpoint::Socket(parent), HostFraming::InputOnly, None)
			}
		};

		let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
			path: command.executable.clone(),
			source,
		})?;
		drop(cmd);
		drop(child_socket);

		let (reader, writer) = match endpoint.split() {
			Ok(halves) => halves,
			Err(e) => {
				let _ = child.kill();
				let _ = child.wait();
				return Err(LaunchError::Ipc(e));
			}
		};

		let pid = child.id();
		inner.state = SupervisorState::Running;
		inner.child = Some(child);
		inner.writer = Some(Arc::new(writer));
		inner.reader = Some(reader);
		inner.framing = framing;
		tracing::info!(pid, transport = ?command.transport, "remote process launched");
		Ok(pid)
	}

	/// Inbound half, for the dispatcher. Available once per launch.
	pub fn take_reader(&self) -> Option<FrameReader> {
		self.inner().reader.take()
	}

	pub fn writer(&self) -> Option<Arc<FrameWriter>> {
		self.inner().writer.clone()
	}

	pub fn framing(&self) -> HostFraming {
		self.inner().framing
	}

	/// Non-blocking liveness check.
	pub fn is_running(&self) -> bool {
		let mut inner = self.inner();
		if !matches!(inner.state, SupervisorState::Running | SupervisorState::Stopping) {
			return false;
		}
		match inner.child.as_mut().map(Child::try_wait) {
			Some(Ok(None)) => true,
			Some(Ok(Some(_))) | None => false,
			Some(Err(e)) => {
				tracing::debug!("liveness check failed: {e}");
				false
			}
		}
	}

	fn try_reap(&self) -> Option<ExitStatus> {
		let mut inner = self.inner();
		match inner.child.as_mut()?.try_wait() {
			Ok(status) => status,
			Err(e) => {
				tracing::debug!("try_wait failed: {e}");
				None
			}
		}
	}

	fn wait_until(&self, deadline: Instant) -> Option<ExitStatus> {
		loop {
			if let Some(status) = self.try_reap() {
				return Some(status);
			}
			let now = Instant::now();
			if now >= deadline {
				return None;
			}
			std::thread::sleep(self.config.poll_interval().min(deadline - now));
		}
	}

	/// Graceful stop, then kill. Always ends in `Stopped`.
	#[tracing::instrument(level = "debug", skip(self))]
	pub fn stop(&self) -> StopOutcome {
		let (writer, pid) = {
			let mut inner = self.inner();
			if inner.state != SupervisorState::Running {
				return StopOutcome::NotRunning;
			}
			inner.state = SupervisorState::Stopping;
			(inner.writer.clone(), inner.child.as_ref().map(Child::id))
		};
		if let Some(writer) = writer {
			writer.close();
		}

		let outcome = match self.wait_until(Instant::now() + self.config.grace_period()) {
			Some(status) => {
				tracing::info!(pid, %status, "remote process exited");
				StopOutcome::Exited(status)
			}
			None => {
				tracing::warn!(pid, "remote process ignored shutdown, killing");
				if let Some(child) = self.inner().child.as_mut() {
					if let Err(e) = child.kill() {
						tracing::debug!(pid, "kill: {e}");
					}
				}
				match self.wait_until(Instant::now() + self.config.reap_timeout()) {
					Some(status) => StopOutcome::Killed(status),
					None => {
						tracing::warn!(pid, "killed process not reaped yet");
						StopOutcome::Abandoned
					}
				}
			}
		};

		let mut inner = self.inner();
		inner.state = SupervisorState::Stopped;
		inner.writer = None;
		inner.reader = None;
		if outcome != StopOutcome::Abandoned {
			inner.child = None;
		}
		outcome
	}
}

impl Drop for Supervisor {
	fn drop(&mut self) {
		self.stop();
		if let Some(mut child) = self.inner().child.take() {
			// Last chance to reap an abandoned child.
			let _ = child.try_wait();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn launch_args_follow_transport() {
		let mut command = LaunchCommand::new("/bin/true", TransportMode::Socket);
		command.extra_args = vec!["-x".into()];
		command.scale = 2.0;
		assert_eq!(command.launch_args().to_args(), ["-x", "--socket-fd=3", "--scale=2"]);
		command.transport = TransportMode::Pipes;
		assert_eq!(command.launch_args().transport, TransportArg::Pipes);
	}

	#[test]
	fn stop_before_launch_is_a_no_op() {
		let supervisor = Supervisor::new(SupervisorConfig::default());
		assert_eq!(supervisor.stop(), StopOutcome::NotRunning);
		assert_eq!(supervisor.state(), SupervisorState::NotStarted);
		assert!(!supervisor.is_running());
	}
}
