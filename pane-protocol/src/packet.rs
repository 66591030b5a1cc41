use thiserror::Error;

use crate::input::{InputEvent, InputEventError};
use crate::message::{MessageError, StructuredMessage};

const TAG_INPUT: u8 = 0x01;
const TAG_MESSAGE: u8 = 0x02;

/// How host to remote payloads are told apart on a given transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostFraming {
	/// Pipe transport: every payload is a bare input event.
	InputOnly,
	/// Socket transport: a leading discriminant byte selects the payload kind.
	Tagged,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
	#[error("structured messages cannot be sent on an input-only channel")]
	MessagesUnsupported,
	#[error("empty packet")]
	Empty,
	#[error("unknown packet discriminant {0:#04x}")]
	UnknownDiscriminant(u8),
	#[error(transparent)]
	Input(#[from] InputEventError),
	#[error(transparent)]
	Message(#[from] MessageError),
}

/// One host to remote payload.
#[derive(Debug, Clone, PartialEq)]
pub enum HostPacket {
	Input(InputEvent),
	Message(StructuredMessage),
}

impl HostPacket {
	pub fn encode(&self, framing: HostFraming) -> Result<Vec<u8>, PacketError> {
		match (framing, self) {
			(HostFraming::InputOnly, HostPacket::Input(event)) => Ok(event.encode().to_vec()),
			(HostFraming::InputOnly, HostPacket::Message(_)) => Err(PacketError::MessagesUnsupported),
			(HostFraming::Tagged, HostPacket::Input(event)) => {
				let mut out = Vec::with_capacity(1 + crate::input::INPUT_EVENT_LEN);
				out.push(TAG_INPUT);
				out.extend_from_slice(&event.encode());
				Ok(out)
			}
			(HostFraming::Tagged, HostPacket::Message(message)) => {
				let mut out = vec![TAG_MESSAGE];
				out.extend(message.encode()?);
				Ok(out)
			}
		}
	}

	pub fn decode(payload: &[u8], framing: HostFraming) -> Result<Self, PacketError> {
		match framing {
			HostFraming::InputOnly => Ok(HostPacket::Input(InputEvent::decode(payload)?)),
			HostFraming::Tagged => {
				let (&tag, body) = payload.split_first().ok_or(PacketError::Empty)?;
				match tag {
					TAG_INPUT => Ok(HostPacket::Input(InputEvent::decode(body)?)),
					TAG_MESSAGE => Ok(HostPacket::Message(StructuredMessage::decode(body)?)),
					other => Err(PacketError::UnknownDiscriminant(other)),
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn input_only_framing_is_bare_event() {
		let event = InputEvent::focus(true);
		let bytes = HostPacket::Input(event).encode(HostFraming::InputOnly).unwrap();
		assert_eq!(bytes, event.encode());
		assert_eq!(
			HostPacket::decode(&bytes, HostFraming::InputOnly).unwrap(),
			HostPacket::Input(event)
		);
	}

	#[test]
	fn input_only_framing_refuses_messages() {
		let packet = HostPacket::Message(StructuredMessage::ready());
		assert_eq!(
			packet.encode(HostFraming::InputOnly),
			Err(PacketError::MessagesUnsupported)
		);
	}

	#[test]
	fn tagged_framing_disambiguates() {
		let event = HostPacket::Input(InputEvent::resize(10, 20, 2.0, 3));
		let message = HostPacket::Message(StructuredMessage::param(7, 0.5));
		for packet in [event, message] {
			let bytes = packet.encode(HostFraming::Tagged).unwrap();
			assert_eq!(HostPacket::decode(&bytes, HostFraming::Tagged).unwrap(), packet);
		}
		assert_eq!(
			HostPacket::decode(&[0x7F, 0], HostFraming::Tagged),
			Err(PacketError::UnknownDiscriminant(0x7F))
		);
		assert_eq!(HostPacket::decode(&[], HostFraming::Tagged), Err(PacketError::Empty));
	}

	#[test]
	fn unencodable_message_is_refused() {
		let packet = HostPacket::Message(StructuredMessage::new(""));
		assert_eq!(
			packet.encode(HostFraming::Tagged),
			Err(PacketError::Message(MessageError::EmptyName))
		);
	}
}
