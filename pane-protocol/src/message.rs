//! Tree-shaped messages exchanged outside the input hot path.
//!
//! The binary form is the JUCE `ValueTree` stream layout, so remote UIs that
//! already speak it interoperate unchanged:
//!
//! ```text
//! tree  := type '\0' cint(props) (name '\0' var)* cint(children) tree*
//! var   := cint(size) marker body     (size counts marker + body; 0 = void)
//! cint  := len|sign<<7 le_bytes[len]  (len <= 4)
//! ```
//!
//! Names and string values are NUL-terminated on the wire, so a tag or
//! property name must be non-empty and none of them may contain NUL;
//! [`StructuredMessage::encode`] refuses messages that break this.

use std::fmt;
use thiserror::Error;

pub const PARAM_TAG: &str = "param";
pub const PARAM_ID: &str = "id";
pub const PARAM_VALUE: &str = "value";
pub const READY_TAG: &str = "ready";

const MAX_DEPTH: usize = 64;

const MARKER_INT: u8 = 1;
const MARKER_BOOL_TRUE: u8 = 2;
const MARKER_BOOL_FALSE: u8 = 3;
const MARKER_DOUBLE: u8 = 4;
const MARKER_STRING: u8 = 5;
const MARKER_INT64: u8 = 6;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
	#[error("message truncated")]
	Truncated,
	#[error("empty type tag or property name")]
	EmptyName,
	#[error("embedded NUL in {0:?}")]
	EmbeddedNul(String),
	#[error("invalid utf-8 in message")]
	InvalidUtf8,
	#[error("compressed int wider than 4 bytes")]
	CompressedIntTooWide,
	#[error("negative count {0}")]
	NegativeCount(i32),
	#[error("value of kind {marker} has size {size}")]
	BadValueSize { marker: u8, size: usize },
	#[error("message nested deeper than {MAX_DEPTH}")]
	TooDeep,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
	Void,
	Int(i32),
	Int64(i64),
	Double(f64),
	Bool(bool),
	String(String),
}

impl Value {
	pub fn as_i64(&self) -> Option<i64> {
		match self {
			Value::Int(v) => Some(i64::from(*v)),
			Value::Int64(v) => Some(*v),
			Value::Double(v) if v.fract() == 0.0 => Some(*v as i64),
			Value::Bool(b) => Some(i64::from(*b)),
			Value::String(s) => s.trim().parse().ok(),
			Value::Void => None,
			Value::Double(_) => None,
		}
	}

	pub fn as_f64(&self) -> Option<f64> {
		match self {
			Value::Int(v) => Some(f64::from(*v)),
			Value::Int64(v) => Some(*v as f64),
			Value::Double(v) => Some(*v),
			Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
			Value::String(s) => s.trim().parse().ok(),
			Value::Void => None,
		}
	}

	pub fn as_bool(&self) -> Option<bool> {
		match self {
			Value::Bool(b) => Some(*b),
			Value::Void | Value::String(_) => None,
			other => other.as_f64().map(|v| v != 0.0),
		}
	}

	pub fn as_str(&self) -> Option<&str> {
		match self {
			Value::String(s) => Some(s),
			_ => None,
		}
	}
}

impl fmt::Display for Value {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Value::Void => Ok(()),
			Value::Int(v) => write!(f, "{v}"),
			Value::Int64(v) => write!(f, "{v}"),
			Value::Double(v) => write!(f, "{v}"),
			Value::Bool(v) => write!(f, "{v}"),
			Value::String(v) => f.write_str(v),
		}
	}
}

macro_rules! value_from {
	($($ty:ty => $variant:ident),* $(,)?) => {
		$(impl From<$ty> for Value {
			fn from(v: $ty) -> Self {
				Value::$variant(v.into())
			}
		})*
	};
}

value_from!(i32 => Int, i64 => Int64, f64 => Double, f32 => Double, bool => Bool, String => String, &str => String);

#[derive(Debug, Clone, PartialEq)]
pub struct StructuredMessage {
	tag: String,
	properties: Vec<(String, Value)>,
	children: Vec<StructuredMessage>,
}

impl StructuredMessage {
	pub fn new(tag: impl Into<String>) -> Self {
		Self {
			tag: tag.into(),
			properties: Vec::new(),
			children: Vec::new(),
		}
	}

	/// Parameter change, valid in both directions.
	pub fn param(id: i32, value: f64) -> Self {
		Self::new(PARAM_TAG).with(PARAM_ID, id).with(PARAM_VALUE, value)
	}

	/// Sent once by the remote after its first rendered frame.
	pub fn ready() -> Self {
		Self::new(READY_TAG)
	}

	pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
		self.set(name, value);
		self
	}

	pub fn with_child(mut self, child: StructuredMessage) -> Self {
		self.children.push(child);
		self
	}

	/// Replaces an existing property in place, keeping property order stable.
	pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
		let name = name.into();
		let value = value.into();
		match self.properties.iter_mut().find(|(n, _)| *n == name) {
			Some((_, slot)) => *slot = value,
			None => self.properties.push((name, value)),
		}
	}

	pub fn tag(&self) -> &str {
		&self.tag
	}

	pub fn is(&self, tag: &str) -> bool {
		self.tag == tag
	}

	pub fn get(&self, name: &str) -> Option<&Value> {
		self.properties
			.iter()
			.find_map(|(n, v)| (n == name).then_some(v))
	}

	pub fn properties(&self) -> impl Iterator<Item = (&str, &Value)> {
		self.properties.iter().map(|(n, v)| (n.as_str(), v))
	}

	pub fn children(&self) -> &[StructuredMessage] {
		&self.children
	}

	/// `(id, value)` of a well-formed `param` message.
	pub fn as_param(&self) -> Option<(i64, f64)> {
		if !self.is(PARAM_TAG) {
			return None;
		}
		let id = self.get(PARAM_ID)?.as_i64()?;
		let value = self.get(PARAM_VALUE)?.as_f64()?;
		Some((id, value))
	}

	/// Fails on an empty tag or property name, or NUL inside any name or
	/// string value; nothing is written in that case.
	pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
		let mut out = Vec::with_capacity(64);
		self.write_to(&mut out)?;
		Ok(out)
	}

	fn write_to(&self, out: &mut Vec<u8>) -> Result<(), MessageError> {
		write_name(out, &self.tag)?;
		write_compressed_int(out, self.properties.len() as i32);
		for (name, value) in &self.properties {
			write_name(out, name)?;
			write_value(out, value)?;
		}
		write_compressed_int(out, self.children.len() as i32);
		for child in &self.children {
			child.write_to(out)?;
		}
		Ok(())
	}

	/// Bytes after the root tree are ignored.
	pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
		let mut reader = ByteReader { bytes, at: 0 };
		read_tree(&mut reader, 0)
	}
}

fn write_cstr(out: &mut Vec<u8>, s: &str) -> Result<(), MessageError> {
	if s.contains('\0') {
		return Err(MessageError::EmbeddedNul(s.to_owned()));
	}
	out.extend_from_slice(s.as_bytes());
	out.push(0);
	Ok(())
}

fn write_name(out: &mut Vec<u8>, name: &str) -> Result<(), MessageError> {
	if name.is_empty() {
		return Err(MessageError::EmptyName);
	}
	write_cstr(out, name)
}

fn write_compressed_int(out: &mut Vec<u8>, value: i32) {
	let magnitude = value.unsigned_abs();
	let bytes = magnitude.to_le_bytes();
	let len = 4 - (magnitude.leading_zeros() / 8) as usize;
	let sign = if value < 0 { 0x80 } else { 0 };
	out.push(len as u8 | sign);
	out.extend_from_slice(&bytes[..len]);
}

fn write_value(out: &mut Vec<u8>, value: &Value) -> Result<(), MessageError> {
	match value {
		Value::Void => write_compressed_int(out, 0),
		Value::Int(v) => {
			write_compressed_int(out, 5);
			out.push(MARKER_INT);
			out.extend_from_slice(&v.to_le_bytes());
		}
		Value::Int64(v) => {
			write_compressed_int(out, 9);
			out.push(MARKER_INT64);
			out.extend_from_slice(&v.to_le_bytes());
		}
		Value::Double(v) => {
			write_compressed_int(out, 9);
			out.push(MARKER_DOUBLE);
			out.extend_from_slice(&v.to_le_bytes());
		}
		Value::Bool(b) => {
			write_compressed_int(out, 1);
			out.push(if *b { MARKER_BOOL_TRUE } else { MARKER_BOOL_FALSE });
		}
		Value::String(s) => {
			// marker + utf-8 + terminator
			write_compressed_int(out, (s.len() + 2) as i32);
			out.push(MARKER_STRING);
			write_cstr(out, s)?;
		}
	}
	Ok(())
}

struct ByteReader<'a> {
	bytes: &'a [u8],
	at: usize,
}

impl<'a> ByteReader<'a> {
	fn take(&mut self, n: usize) -> Result<&'a [u8], MessageError> {
		let end = self.at.checked_add(n).ok_or(MessageError::Truncated)?;
		let slice = self.bytes.get(self.at..end).ok_or(MessageError::Truncated)?;
		self.at = end;
		Ok(slice)
	}

	fn byte(&mut self) -> Result<u8, MessageError> {
		Ok(self.take(1)?[0])
	}

	fn cstr(&mut self) -> Result<String, MessageError> {
		let rest = &self.bytes[self.at..];
		let nul = rest
			.iter()
			.position(|b| *b == 0)
			.ok_or(MessageError::Truncated)?;
		let s = std::str::from_utf8(&rest[..nul]).map_err(|_| MessageError::InvalidUtf8)?;
		self.at += nul + 1;
		Ok(s.to_owned())
	}

	fn compressed_int(&mut self) -> Result<i32, MessageError> {
		let head = self.byte()?;
		let len = (head & 0x7F) as usize;
		if len > 4 {
			return Err(MessageError::CompressedIntTooWide);
		}
		let mut buf = [0u8; 4];
		buf[..len].copy_from_slice(self.take(len)?);
		let magnitude = u32::from_le_bytes(buf) as i32;
		Ok(if head & 0x80 != 0 {
			magnitude.wrapping_neg()
		} else {
			magnitude
		})
	}

	fn count(&mut self) -> Result<usize, MessageError> {
		let n = self.compressed_int()?;
		usize::try_from(n).map_err(|_| MessageError::NegativeCount(n))
	}
}

fn read_tree(reader: &mut ByteReader<'_>, depth: usize) -> Result<StructuredMessage, MessageError> {
	if depth > MAX_DEPTH {
		return Err(MessageError::TooDeep);
	}
	let tag = reader.cstr()?;
	if tag.is_empty() {
		return Err(MessageError::EmptyName);
	}
	let mut message = StructuredMessage::new(tag);
	let props = reader.count()?;
	for _ in 0..props {
		let name = reader.cstr()?;
		if name.is_empty() {
			return Err(MessageError::EmptyName);
		}
		if let Some(value) = read_value(reader)? {
			message.set(name, value);
		}
	}
	let children = reader.count()?;
	for _ in 0..children {
		message.children.push(read_tree(reader, depth + 1)?);
	}
	Ok(message)
}

/// `None` for kinds without a scalar mapping (arrays, binary blobs, objects);
/// their bytes are skipped and the property is dropped.
fn read_value(reader: &mut ByteReader<'_>) -> Result<Option<Value>, MessageError> {
	let size = reader.count()?;
	if size == 0 {
		return Ok(Some(Value::Void));
	}
	let body = reader.take(size)?;
	let (marker, data) = (body[0], &body[1..]);
	let bad_size = || MessageError::BadValueSize { marker, size };
	let value = match marker {
		MARKER_INT => Value::Int(i32::from_le_bytes(data.try_into().map_err(|_| bad_size())?)),
		MARKER_INT64 => Value::Int64(i64::from_le_bytes(data.try_into().map_err(|_| bad_size())?)),
		MARKER_DOUBLE => Value::Double(f64::from_le_bytes(data.try_into().map_err(|_| bad_size())?)),
		MARKER_BOOL_TRUE => Value::Bool(true),
		MARKER_BOOL_FALSE => Value::Bool(false),
		MARKER_STRING => {
			let text = data.split(|b| *b == 0).next().unwrap_or_default();
			Value::String(
				std::str::from_utf8(text)
					.map_err(|_| MessageError::InvalidUtf8)?
					.to_owned(),
			)
		}
		other => {
			tracing::trace!(marker = other, size, "skipping non-scalar property");
			return Ok(None);
		}
	};
	Ok(Some(value))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn param_matches_juce_bytes() {
		let bytes = StructuredMessage::new("param")
			.with("id", 3)
			.with("value", 0.5)
			.encode()
			.unwrap();
		let mut expected = b"param\0".to_vec();
		expected.extend([1, 2]); // two properties
		expected.extend(b"id\0");
		expected.extend([1, 5, MARKER_INT, 3, 0, 0, 0]);
		expected.extend(b"value\0");
		expected.extend([1, 9, MARKER_DOUBLE]);
		expected.extend(0.5f64.to_le_bytes());
		expected.extend([0]); // no children
		assert_eq!(bytes, expected);
	}

	#[test]
	fn ready_is_tag_only() {
		assert_eq!(StructuredMessage::ready().encode().unwrap(), b"ready\0\0\0");
	}

	#[test]
	fn roundtrip_preserves_tag_and_properties() {
		let message = StructuredMessage::new("state")
			.with("int", -42)
			.with("big", i64::MAX)
			.with("ratio", 0.125)
			.with("on", true)
			.with("off", false)
			.with("name", "gain ü")
			.with("nothing", Value::Void)
			.with_child(StructuredMessage::new("child").with("k", 1));
		let decoded = StructuredMessage::decode(&message.encode().unwrap()).unwrap();
		assert_eq!(decoded, message);
		assert_eq!(decoded.tag(), "state");
		assert_eq!(decoded.children()[0].get("k"), Some(&Value::Int(1)));
	}

	#[test]
	fn compressed_ints() {
		for (value, bytes) in [
			(0, vec![0]),
			(1, vec![1, 1]),
			(300, vec![2, 0x2C, 0x01]),
			(-1, vec![0x81, 1]),
			(i32::MIN, vec![0x84, 0, 0, 0, 0x80]),
		] {
			let mut out = Vec::new();
			write_compressed_int(&mut out, value);
			assert_eq!(out, bytes, "encoding {value}");
			let mut reader = ByteReader { bytes: &out, at: 0 };
			assert_eq!(reader.compressed_int().unwrap(), value);
		}
	}

	#[test]
	fn set_replaces_in_place() {
		let mut message = StructuredMessage::param(1, 0.1);
		message.set("id", 9);
		assert_eq!(message.as_param(), Some((9, 0.1)));
		assert_eq!(message.properties().count(), 2);
	}

	#[test]
	fn as_param_accepts_loose_scalar_kinds() {
		let message = StructuredMessage::new("param")
			.with("id", "4")
			.with("value", 1);
		assert_eq!(message.as_param(), Some((4, 1.0)));
		assert_eq!(StructuredMessage::new("param").as_param(), None);
		assert_eq!(StructuredMessage::new("other").with("id", 1).with("value", 1.0).as_param(), None);
	}

	#[test]
	fn truncated_bytes_are_malformed() {
		let bytes = StructuredMessage::param(7, 0.5).encode().unwrap();
		for cut in 0..bytes.len() {
			assert!(
				StructuredMessage::decode(&bytes[..cut]).is_err(),
				"prefix of {cut} bytes decoded"
			);
		}
	}

	#[test]
	fn type_mismatched_value_is_malformed() {
		let mut bytes = b"param\0\x01\x01id\0".to_vec();
		bytes.extend([1, 3, MARKER_INT, 1, 2]);
		bytes.push(0);
		assert_eq!(
			StructuredMessage::decode(&bytes),
			Err(MessageError::BadValueSize { marker: MARKER_INT, size: 3 })
		);
	}

	#[test]
	fn unencodable_names_are_refused() {
		assert_eq!(StructuredMessage::new("").encode(), Err(MessageError::EmptyName));
		assert_eq!(
			StructuredMessage::new("state").with("", 1).encode(),
			Err(MessageError::EmptyName)
		);
		assert_eq!(
			StructuredMessage::new("a\0b").encode(),
			Err(MessageError::EmbeddedNul("a\0b".into()))
		);
		assert!(matches!(
			StructuredMessage::new("state").with("name", "x\0y").encode(),
			Err(MessageError::EmbeddedNul(_))
		));
		let nested = StructuredMessage::new("state").with_child(StructuredMessage::new(""));
		assert_eq!(nested.encode(), Err(MessageError::EmptyName));
	}

	#[test]
	fn empty_tag_is_malformed() {
		assert_eq!(StructuredMessage::decode(b"\0\0\0"), Err(MessageError::EmptyName));
	}

	#[test]
	fn non_scalar_properties_are_skipped() {
		let mut bytes = b"blob\0\x01\x02".to_vec();
		bytes.extend(b"data\0");
		bytes.extend([1, 4, 8, 0xAA, 0xBB, 0xCC]); // binary marker, 3 bytes
		bytes.extend(b"id\0");
		bytes.extend([1, 5, MARKER_INT, 2, 0, 0, 0]);
		bytes.push(0);
		let decoded = StructuredMessage::decode(&bytes).unwrap();
		assert_eq!(decoded.get("data"), None);
		assert_eq!(decoded.get("id"), Some(&Value::Int(2)));
	}

	#[test]
	fn runaway_nesting_is_rejected() {
		let mut message = StructuredMessage::new("leaf");
		for _ in 0..=MAX_DEPTH {
			message = StructuredMessage::new("node").with_child(message);
		}
		assert_eq!(StructuredMessage::decode(&message.encode().unwrap()), Err(MessageError::TooDeep));
	}
}
