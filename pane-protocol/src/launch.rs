//! Command line contract between the host and the remote executable.
//!
//! The host appends these flags after any caller-supplied arguments; the
//! remote parses them back with [`LaunchArgs::parse`]. Unrecognised arguments
//! are kept in [`LaunchArgs::extra`] so the remote can add its own flags.

use std::os::fd::RawFd;
use std::path::PathBuf;
use thiserror::Error;

use crate::surface::SurfaceId;

/// Descriptor number the socket end is installed at in the child.
pub const CHILD_SOCKET_FD: RawFd = 3;

const SOCKET_FD: &str = "--socket-fd=";
const PIPES: &str = "--pipes";
const SCALE: &str = "--scale=";
const SURFACE_ID: &str = "--surface-id=";
const CAPABILITY_SERVICE: &str = "--capability-service=";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LaunchArgsError {
	#[error("no transport flag (--socket-fd or --pipes)")]
	MissingTransport,
	#[error("more than one transport flag")]
	ConflictingTransport,
	#[error("more than one surface flag")]
	ConflictingSurface,
	#[error("invalid value {value:?} for {flag}")]
	InvalidValue { flag: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportArg {
	/// Bidirectional socket inherited at this descriptor.
	SocketFd(RawFd),
	/// Input on stdin, messages out on stdout.
	Pipes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceArg {
	None,
	Id(SurfaceId),
	Service(PathBuf),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaunchArgs {
	pub transport: TransportArg,
	pub scale: f32,
	pub surface: SurfaceArg,
	pub extra: Vec<String>,
}

impl LaunchArgs {
	pub fn new(transport: TransportArg) -> Self {
		Self {
			transport,
			scale: 1.0,
			surface: SurfaceArg::None,
			extra: Vec::new(),
		}
	}

	pub fn to_args(&self) -> Vec<String> {
		let mut args = self.extra.clone();
		args.push(match self.transport {
			TransportArg::SocketFd(fd) => format!("{SOCKET_FD}{fd}"),
			TransportArg::Pipes => PIPES.to_string(),
		});
		args.push(format!("{SCALE}{}", self.scale));
		match &self.surface {
			SurfaceArg::None => {}
			SurfaceArg::Id(id) => args.push(format!("{SURFACE_ID}{id}")),
			SurfaceArg::Service(path) => args.push(format!("{CAPABILITY_SERVICE}{}", path.display())),
		}
		args
	}

	/// Parse arguments, excluding the program name.
	pub fn parse<I, S>(args: I) -> Result<Self, LaunchArgsError>
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		let mut transport = None;
		let mut surface = SurfaceArg::None;
		let mut scale = 1.0;
		let mut extra = Vec::new();

		for arg in args {
			let arg: String = arg.into();
			if let Some(value) = arg.strip_prefix(SOCKET_FD) {
				let fd = value.parse().map_err(|_| invalid(SOCKET_FD, value))?;
				set_transport(&mut transport, TransportArg::SocketFd(fd))?;
			} else if arg == PIPES {
				set_transport(&mut transport, TransportArg::Pipes)?;
			} else if let Some(value) = arg.strip_prefix(SCALE) {
				scale = value
					.parse::<f32>()
					.ok()
					.filter(|s| s.is_finite() && *s > 0.0)
					.ok_or_else(|| invalid(SCALE, value))?;
			} else if let Some(value) = arg.strip_prefix(SURFACE_ID) {
				let id = value.parse().map_err(|_| invalid(SURFACE_ID, value))?;
				set_surface(&mut surface, SurfaceArg::Id(SurfaceId(id)))?;
			} else if let Some(value) = arg.strip_prefix(CAPABILITY_SERVICE) {
				if value.is_empty() {
					return Err(invalid(CAPABILITY_SERVICE, value));
				}
				set_surface(&mut surface, SurfaceArg::Service(PathBuf::from(value)))?;
			} else {
				extra.push(arg);
			}
		}

		Ok(Self {
			transport: transport.ok_or(LaunchArgsError::MissingTransport)?,
			scale,
			surface,
			extra,
		})
	}
}

fn invalid(flag: &'static str, value: &str) -> LaunchArgsError {
	LaunchArgsError::InvalidValue {
		flag: flag.trim_end_matches('='),
		value: value.to_string(),
	}
}

fn set_transport(slot: &mut Option<TransportArg>, value: TransportArg) -> Result<(), LaunchArgsError> {
	if slot.replace(value).is_some() {
		return Err(LaunchArgsError::ConflictingTransport);
	}
	Ok(())
}

fn set_surface(slot: &mut SurfaceArg, value: SurfaceArg) -> Result<(), LaunchArgsError> {
	if *slot != SurfaceArg::None {
		return Err(LaunchArgsError::ConflictingSurface);
	}
	*slot = value;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn socket_launch_args() {
		let mut args = LaunchArgs::new(TransportArg::SocketFd(CHILD_SOCKET_FD));
		args.scale = 2.0;
		args.surface = SurfaceArg::Service(PathBuf::from("/tmp/pane-cap.sock"));
		args.extra = vec!["--theme=dark".into()];
		assert_eq!(
			args.to_args(),
			[
				"--theme=dark",
				"--socket-fd=3",
				"--scale=2",
				"--capability-service=/tmp/pane-cap.sock"
			]
		);
		assert_eq!(LaunchArgs::parse(args.to_args()).unwrap(), args);
	}

	#[test]
	fn pipe_launch_args() {
		let mut args = LaunchArgs::new(TransportArg::Pipes);
		args.scale = 1.25;
		args.surface = SurfaceArg::Id(SurfaceId(77));
		assert_eq!(args.to_args(), ["--pipes", "--scale=1.25", "--surface-id=77"]);
		assert_eq!(LaunchArgs::parse(args.to_args()).unwrap(), args);
	}

	#[test]
	fn unknown_flags_are_kept_in_order() {
		let parsed = LaunchArgs::parse(["-v", "--pipes", "positional"]).unwrap();
		assert_eq!(parsed.extra, ["-v", "positional"]);
		assert_eq!(parsed.scale, 1.0);
		assert_eq!(parsed.surface, SurfaceArg::None);
	}

	#[test]
	fn rejects_bad_combinations() {
		assert_eq!(LaunchArgs::parse(["--scale=2"]), Err(LaunchArgsError::MissingTransport));
		assert_eq!(
			LaunchArgs::parse(["--pipes", "--socket-fd=3"]),
			Err(LaunchArgsError::ConflictingTransport)
		);
		assert_eq!(
			LaunchArgs::parse(["--pipes", "--surface-id=1", "--capability-service=/x"]),
			Err(LaunchArgsError::ConflictingSurface)
		);
		assert_eq!(
			LaunchArgs::parse(["--socket-fd=three"]),
			Err(LaunchArgsError::InvalidValue {
				flag: "--socket-fd",
				value: "three".into()
			})
		);
		assert!(LaunchArgs::parse(["--pipes", "--scale=-1"]).is_err());
	}
}
