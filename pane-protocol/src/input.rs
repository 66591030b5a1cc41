//! Fixed-size input records sent from the host to the remote UI.
//!
//! Layout (16 bytes, little-endian):
//!
//! | offset | size | field |
//! |---|---|---|
//! | 0 | 1 | kind |
//! | 1 | 1 | action |
//! | 2 | 1 | button |
//! | 3 | 1 | modifiers |
//! | 4 | 2 | x |
//! | 6 | 2 | y |
//! | 8 | 2 | data1 |
//! | 10 | 2 | data2 |
//! | 12 | 4 | timestamp |
//!
//! Field meaning depends on the kind; use the constructors rather than
//! filling fields by hand. `Resize` reuses `timestamp` for the surface
//! generation tag.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const INPUT_EVENT_LEN: usize = 16;

/// Scroll deltas travel as fixed point with this many steps per unit.
pub const SCROLL_SCALE: f32 = 10_000.0;
/// Resize scale factor travels as fixed point with this many steps per unit.
pub const DISPLAY_SCALE: f32 = 100.0;

pub mod modifiers {
	pub const SHIFT: u8 = 1 << 0;
	pub const CONTROL: u8 = 1 << 1;
	pub const ALT: u8 = 1 << 2;
	pub const META: u8 = 1 << 3;
}

pub mod buttons {
	pub const LEFT: u8 = 1;
	pub const RIGHT: u8 = 2;
	pub const MIDDLE: u8 = 3;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InputEventError {
	#[error("input event must be {INPUT_EVENT_LEN} bytes, got {0}")]
	BadLength(usize),
	#[error("unknown event kind {0}")]
	UnknownKind(u8),
	#[error("unknown event action {0}")]
	UnknownAction(u8),
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
	Mouse = 1,
	Key = 2,
	Focus = 3,
	Resize = 4,
}

impl TryFrom<u8> for EventKind {
	type Error = InputEventError;
	fn try_from(value: u8) -> Result<Self, Self::Error> {
		Ok(match value {
			1 => Self::Mouse,
			2 => Self::Key,
			3 => Self::Focus,
			4 => Self::Resize,
			other => return Err(InputEventError::UnknownKind(other)),
		})
	}
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventAction {
	/// Focus and Resize carry no action.
	None = 0,
	Press = 1,
	Release = 2,
	Move = 3,
	Scroll = 4,
}

impl TryFrom<u8> for EventAction {
	type Error = InputEventError;
	fn try_from(value: u8) -> Result<Self, Self::Error> {
		Ok(match value {
			0 => Self::None,
			1 => Self::Press,
			2 => Self::Release,
			3 => Self::Move,
			4 => Self::Scroll,
			other => return Err(InputEventError::UnknownAction(other)),
		})
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputEvent {
	pub kind: EventKind,
	pub action: EventAction,
	pub button: u8,
	pub modifiers: u8,
	pub x: i16,
	pub y: i16,
	pub data1: i16,
	pub data2: i16,
	pub timestamp: u32,
}

fn clamp_i16(value: i32) -> i16 {
	value.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

impl InputEvent {
	const fn blank(kind: EventKind) -> Self {
		Self {
			kind,
			action: EventAction::None,
			button: 0,
			modifiers: 0,
			x: 0,
			y: 0,
			data1: 0,
			data2: 0,
			timestamp: 0,
		}
	}

	pub fn mouse_move(x: i32, y: i32, modifiers: u8) -> Self {
		Self {
			action: EventAction::Move,
			modifiers,
			x: clamp_i16(x),
			y: clamp_i16(y),
			..Self::blank(EventKind::Mouse)
		}
	}

	pub fn mouse_button(x: i32, y: i32, button: u8, pressed: bool, modifiers: u8) -> Self {
		Self {
			action: if pressed {
				EventAction::Press
			} else {
				EventAction::Release
			},
			button,
			modifiers,
			x: clamp_i16(x),
			y: clamp_i16(y),
			..Self::blank(EventKind::Mouse)
		}
	}

	/// Deltas are clamped to roughly ±3.27 units by the fixed-point encoding.
	pub fn mouse_scroll(x: i32, y: i32, delta_x: f32, delta_y: f32, modifiers: u8) -> Self {
		Self {
			action: EventAction::Scroll,
			modifiers,
			x: clamp_i16(x),
			y: clamp_i16(y),
			data1: (delta_x * SCROLL_SCALE) as i16,
			data2: (delta_y * SCROLL_SCALE) as i16,
			..Self::blank(EventKind::Mouse)
		}
	}

	pub fn key(key_code: i32, codepoint: u32, pressed: bool, modifiers: u8) -> Self {
		Self {
			action: if pressed {
				EventAction::Press
			} else {
				EventAction::Release
			},
			modifiers,
			x: clamp_i16(key_code),
			data1: (codepoint & 0xFFFF) as u16 as i16,
			data2: (codepoint >> 16) as u16 as i16,
			..Self::blank(EventKind::Key)
		}
	}

	pub fn focus(focused: bool) -> Self {
		Self {
			data1: i16::from(focused),
			..Self::blank(EventKind::Focus)
		}
	}

	/// `generation` is the surface generation tag the remote must switch to:
	/// the global surface id, or the capability generation counter.
	pub fn resize(width: u32, height: u32, scale: f32, generation: u32) -> Self {
		Self {
			x: clamp_i16(width.min(i16::MAX as u32) as i32),
			y: clamp_i16(height.min(i16::MAX as u32) as i32),
			data1: (scale * DISPLAY_SCALE).round() as i16,
			timestamp: generation,
			..Self::blank(EventKind::Resize)
		}
	}

	pub fn scroll_delta(&self) -> Option<(f32, f32)> {
		(self.kind == EventKind::Mouse && self.action == EventAction::Scroll).then(|| {
			(
				f32::from(self.data1) / SCROLL_SCALE,
				f32::from(self.data2) / SCROLL_SCALE,
			)
		})
	}

	pub fn codepoint(&self) -> Option<u32> {
		(self.kind == EventKind::Key)
			.then(|| u32::from(self.data1 as u16) | (u32::from(self.data2 as u16) << 16))
	}

	pub fn is_pressed(&self) -> bool {
		self.action == EventAction::Press
	}

	pub fn is_focused(&self) -> Option<bool> {
		(self.kind == EventKind::Focus).then_some(self.data1 != 0)
	}

	pub fn scale(&self) -> Option<f32> {
		(self.kind == EventKind::Resize).then(|| f32::from(self.data1) / DISPLAY_SCALE)
	}

	pub fn generation(&self) -> Option<u32> {
		(self.kind == EventKind::Resize).then_some(self.timestamp)
	}

	pub fn size(&self) -> Option<(u32, u32)> {
		(self.kind == EventKind::Resize).then(|| (self.x.max(0) as u32, self.y.max(0) as u32))
	}

	pub fn encode(&self) -> [u8; INPUT_EVENT_LEN] {
		let mut out = [0u8; INPUT_EVENT_LEN];
		out[0] = self.kind as u8;
		out[1] = self.action as u8;
		out[2] = self.button;
		out[3] = self.modifiers;
		out[4..6].copy_from_slice(&self.x.to_le_bytes());
		out[6..8].copy_from_slice(&self.y.to_le_bytes());
		out[8..10].copy_from_slice(&self.data1.to_le_bytes());
		out[10..12].copy_from_slice(&self.data2.to_le_bytes());
		out[12..16].copy_from_slice(&self.timestamp.to_le_bytes());
		out
	}

	pub fn decode(bytes: &[u8]) -> Result<Self, InputEventError> {
		let bytes: &[u8; INPUT_EVENT_LEN] = bytes
			.try_into()
			.map_err(|_| InputEventError::BadLength(bytes.len()))?;
		let i16_at = |at: usize| i16::from_le_bytes([bytes[at], bytes[at + 1]]);
		Ok(Self {
			kind: EventKind::try_from(bytes[0])?,
			action: EventAction::try_from(bytes[1])?,
			button: bytes[2],
			modifiers: bytes[3],
			x: i16_at(4),
			y: i16_at(6),
			data1: i16_at(8),
			data2: i16_at(10),
			timestamp: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn roundtrip(event: InputEvent) {
		assert_eq!(InputEvent::decode(&event.encode()).unwrap(), event);
	}

	#[test]
	fn every_factory_roundtrips() {
		roundtrip(InputEvent::mouse_move(10, -20, modifiers::SHIFT));
		roundtrip(InputEvent::mouse_button(5, 6, buttons::LEFT, true, 0));
		roundtrip(InputEvent::mouse_button(5, 6, buttons::RIGHT, false, modifiers::ALT));
		roundtrip(InputEvent::mouse_scroll(1, 2, 0.25, -1.5, 0));
		roundtrip(InputEvent::key(65, 'a' as u32, true, modifiers::CONTROL));
		roundtrip(InputEvent::key(0, 0x1F600, false, 0));
		roundtrip(InputEvent::focus(true));
		roundtrip(InputEvent::focus(false));
		roundtrip(InputEvent::resize(800, 600, 2.0, 0xDEAD_BEEF));
	}

	#[test]
	fn byte_layout_is_fixed() {
		let bytes = InputEvent::mouse_button(0x0102, -2, 3, true, 9).encode();
		assert_eq!(bytes[..4], [1, EventAction::Press as u8, 3, 9]);
		assert_eq!(bytes[4..6], [0x02, 0x01]);
		assert_eq!(bytes[6..8], [0xFE, 0xFF]);
		assert_eq!(bytes[12..], [0, 0, 0, 0]);
		let resize = InputEvent::resize(1, 1, 1.0, 0x0403_0201).encode();
		assert_eq!(resize[12..], [1, 2, 3, 4]);
	}

	#[test]
	fn kind_specific_fields() {
		let scroll = InputEvent::mouse_scroll(0, 0, 0.5, -0.25, 0);
		assert_eq!(scroll.data1, 5000);
		assert_eq!(scroll.data2, -2500);
		assert_eq!(scroll.scroll_delta(), Some((0.5, -0.25)));

		let key = InputEvent::key(13, 0x1F600, true, 0);
		assert_eq!(key.x, 13);
		assert_eq!(key.codepoint(), Some(0x1F600));
		assert!(key.is_pressed());

		assert_eq!(InputEvent::focus(true).is_focused(), Some(true));
		assert_eq!(InputEvent::focus(false).data1, 0);

		let resize = InputEvent::resize(1024, 768, 1.5, 7);
		assert_eq!(resize.size(), Some((1024, 768)));
		assert_eq!(resize.data1, 150);
		assert_eq!(resize.scale(), Some(1.5));
		assert_eq!(resize.generation(), Some(7));
		assert_eq!(InputEvent::focus(true).generation(), None);
	}

	#[test]
	fn out_of_range_positions_saturate() {
		let e = InputEvent::mouse_move(100_000, -100_000, 0);
		assert_eq!((e.x, e.y), (i16::MAX, i16::MIN));
	}

	#[test]
	fn decode_rejects_bad_input() {
		assert_eq!(InputEvent::decode(&[0; 15]), Err(InputEventError::BadLength(15)));
		let mut bytes = InputEvent::focus(true).encode();
		bytes[0] = 99;
		assert_eq!(InputEvent::decode(&bytes), Err(InputEventError::UnknownKind(99)));
		bytes[0] = 1;
		bytes[1] = 42;
		assert_eq!(InputEvent::decode(&bytes), Err(InputEventError::UnknownAction(42)));
	}
}
