//! Remote (child process) side of the transport.

use nix::fcntl::{FcntlArg, fcntl};
use std::io;
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use thiserror::Error;

use crate::frame::{Endpoint, FrameError, FrameReader, FrameWriter};
use crate::launch::TransportArg;
use crate::message::{MessageError, StructuredMessage};
use crate::packet::{HostFraming, HostPacket, PacketError};

#[derive(Debug, Error)]
pub enum RemoteError {
	#[error(transparent)]
	Frame(#[from] FrameError),
	#[error(transparent)]
	Packet(#[from] PacketError),
	#[error(transparent)]
	Message(#[from] MessageError),
}

/// Take ownership of the socket the host installed at `fd`.
pub fn socket_from_fd(fd: RawFd) -> io::Result<UnixStream> {
	fcntl(fd, FcntlArg::F_GETFD).map_err(io::Error::from)?;
	// SAFETY: the descriptor is open and was handed to this process for exclusive use.
	Ok(unsafe { UnixStream::from_raw_fd(fd) })
}

pub struct RemoteChannel {
	reader: FrameReader,
	writer: Arc<FrameWriter>,
	framing: HostFraming,
}

impl std::fmt::Debug for RemoteChannel {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RemoteChannel")
			.field("framing", &self.framing)
			.finish_non_exhaustive()
	}
}

impl RemoteChannel {
	/// Open the transport named on the command line. Pipe mode reads stdin
	/// and writes stdout.
	pub fn open(transport: TransportArg) -> io::Result<Self> {
		match transport {
			TransportArg::SocketFd(fd) => {
				Self::from_endpoint(Endpoint::Socket(socket_from_fd(fd)?), HostFraming::Tagged)
			}
			TransportArg::Pipes => Ok(Self {
				reader: FrameReader::from_reader(io::stdin()),
				writer: Arc::new(FrameWriter::from_writer(io::stdout())),
				framing: HostFraming::InputOnly,
			}),
		}
	}

	pub fn from_endpoint(endpoint: Endpoint, framing: HostFraming) -> io::Result<Self> {
		let (reader, writer) = endpoint.split()?;
		Ok(Self {
			reader,
			writer: Arc::new(writer),
			framing,
		})
	}

	pub fn framing(&self) -> HostFraming {
		self.framing
	}

	pub fn writer(&self) -> Arc<FrameWriter> {
		self.writer.clone()
	}

	/// Block for the next host packet. A malformed payload is reported as
	/// [`RemoteError::Packet`] and leaves the channel usable.
	pub fn recv(&mut self) -> Result<HostPacket, RemoteError> {
		let payload = self.reader.read_frame()?;
		Ok(HostPacket::decode(&payload, self.framing)?)
	}

	pub fn send(&self, message: &StructuredMessage) -> Result<(), RemoteError> {
		self.writer.write_frame(&message.encode()?)?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::input::InputEvent;
	use std::os::fd::IntoRawFd;

	#[test]
	fn socket_channel_roundtrip() {
		let (host, remote) = UnixStream::pair().unwrap();
		let (mut host_reader, host_writer) = Endpoint::Socket(host).split().unwrap();
		let mut channel = RemoteChannel::open(TransportArg::SocketFd(remote.into_raw_fd())).unwrap();
		assert_eq!(channel.framing(), HostFraming::Tagged);

		let event = InputEvent::focus(true);
		host_writer
			.write_frame(&HostPacket::Input(event).encode(HostFraming::Tagged).unwrap())
			.unwrap();
		assert_eq!(channel.recv().unwrap(), HostPacket::Input(event));

		channel.send(&StructuredMessage::ready()).unwrap();
		let reply = StructuredMessage::decode(&host_reader.read_frame().unwrap()).unwrap();
		assert!(reply.is(crate::message::READY_TAG));

		host_writer.write_frame(&[0x7F]).unwrap();
		assert!(matches!(channel.recv(), Err(RemoteError::Packet(_))));
		host_writer.close();
		assert!(matches!(channel.recv(), Err(RemoteError::Frame(FrameError::Eof))));
	}

	#[test]
	fn pipe_channel_is_input_only() {
		let (remote_reader, host_writer) = io::pipe().unwrap();
		let (host_reader, remote_writer) = io::pipe().unwrap();
		let mut channel = RemoteChannel::from_endpoint(
			Endpoint::Pipes {
				reader: remote_reader,
				writer: remote_writer,
			},
			HostFraming::InputOnly,
		)
		.unwrap();
		let (_, host) = Endpoint::Pipes {
			reader: host_reader,
			writer: host_writer,
		}
		.split()
		.unwrap();
		let event = InputEvent::resize(10, 20, 1.0, 1);
		host.write_frame(&event.encode()).unwrap();
		assert_eq!(channel.recv().unwrap(), HostPacket::Input(event));
	}

	#[test]
	fn closed_descriptor_is_rejected() {
		assert!(socket_from_fd(9999).is_err());
	}
}
