//! Transferable surface capabilities.
//!
//! A grant is a 12 byte record (generation, width, height as u32 LE) sent in
//! one datagram-like `sendmsg` together with exactly one descriptor in
//! `SCM_RIGHTS`. The host side serves one grant per connection; the remote
//! connects to the service path once per surface generation.

use nix::errno::Errno;
use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use thiserror::Error;

pub const GRANT_LEN: usize = 12;

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: MsgFlags = MsgFlags::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: MsgFlags = MsgFlags::empty();

#[derive(Debug, Error)]
pub enum CapabilityError {
	#[error("capability grant must be {GRANT_LEN} bytes, got {0}")]
	BadLength(usize),
	#[error("capability message carried no descriptor")]
	MissingDescriptor,
	#[error("capability service closed the connection")]
	Closed,
	#[error("capability service was destroyed")]
	Destroyed,
	#[error("nix error: {0}")]
	Nix(#[from] nix::Error),
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}

/// Metadata sent alongside a surface descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityGrant {
	pub generation: u32,
	pub width: u32,
	pub height: u32,
}

impl CapabilityGrant {
	pub fn encode(&self) -> [u8; GRANT_LEN] {
		let mut out = [0u8; GRANT_LEN];
		out[0..4].copy_from_slice(&self.generation.to_le_bytes());
		out[4..8].copy_from_slice(&self.width.to_le_bytes());
		out[8..12].copy_from_slice(&self.height.to_le_bytes());
		out
	}

	pub fn decode(bytes: &[u8]) -> Result<Self, CapabilityError> {
		if bytes.len() != GRANT_LEN {
			return Err(CapabilityError::BadLength(bytes.len()));
		}
		let u32_at = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
		Ok(Self {
			generation: u32_at(0),
			width: u32_at(4),
			height: u32_at(8),
		})
	}
}

/// Send one grant and its descriptor over a connected stream.
pub fn send_capability(
	stream: &impl AsRawFd,
	grant: &CapabilityGrant,
	descriptor: &impl AsRawFd,
) -> Result<(), CapabilityError> {
	let encoded = grant.encode();
	let iov = [IoSlice::new(&encoded)];
	let fds = [descriptor.as_raw_fd()];
	let cmsg = [ControlMessage::ScmRights(&fds)];
	loop {
		match sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None) {
			Err(Errno::EINTR) => continue,
			Err(e) => return Err(e.into()),
			Ok(sent) if sent != GRANT_LEN => return Err(CapabilityError::BadLength(sent)),
			Ok(_) => return Ok(()),
		}
	}
}

/// Receive one grant. Descriptors beyond the first are closed.
pub fn receive_capability(stream: &impl AsRawFd) -> Result<(CapabilityGrant, OwnedFd), CapabilityError> {
	let mut buf = [0u8; GRANT_LEN];
	let mut cmsg_space = nix::cmsg_space!([RawFd; 4]);
	let mut iov = [IoSliceMut::new(&mut buf)];

	let (bytes, received) = loop {
		match recvmsg::<()>(stream.as_raw_fd(), &mut iov, Some(&mut cmsg_space), RECV_FLAGS) {
			Err(Errno::EINTR) => continue,
			Err(e) => return Err(e.into()),
			Ok(msg) => {
				let mut received: Vec<OwnedFd> = Vec::new();
				for cmsg in msg.cmsgs()? {
					if let ControlMessageOwned::ScmRights(rights) = cmsg {
						// SAFETY: the kernel installed these descriptors for us.
						received.extend(rights.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
					}
				}
				break (msg.bytes, received);
			}
		}
	};

	let mut received = received.into_iter();
	let descriptor = received.next();
	if received.len() > 0 {
		tracing::warn!(extra = received.len(), "closing unexpected descriptors in capability message");
	}
	if bytes == 0 && descriptor.is_none() {
		return Err(CapabilityError::Closed);
	}
	let grant = CapabilityGrant::decode(&buf[..bytes])?;
	let descriptor = descriptor.ok_or(CapabilityError::MissingDescriptor)?;
	Ok((grant, descriptor))
}

/// Connect to a capability service and take the grant it offers.
#[tracing::instrument(level = "debug")]
pub fn request_capability(service: &Path) -> Result<(CapabilityGrant, OwnedFd), CapabilityError> {
	let stream = UnixStream::connect(service)?;
	receive_capability(&stream)
}
