//! Reader thread that turns inbound frames into coalesced callbacks.
//!
//! Messages are keyed by tag (plus an entity id for tags listed in
//! [`DispatcherConfig::entity_keys`]). A key has at most one delivery
//! scheduled on the consumer context at a time; a newer message for the same
//! key replaces the pending one, so the callback always sees the latest value.

use pane_protocol::frame::FrameInterrupter;
use pane_protocol::{FrameError, FrameReader, StructuredMessage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::DispatcherConfig;
use crate::consumer::ConsumerContext;

pub type MessageHandler = Arc<dyn Fn(StructuredMessage) + Send + Sync>;
pub type SignalHandler = Arc<dyn Fn() + Send + Sync>;
pub type ClosedHandler = Arc<dyn Fn(CloseReason) + Send + Sync>;

/// How long `stop` waits for a reader that cannot be interrupted.
const UNINTERRUPTIBLE_JOIN: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CoalesceKey {
	pub tag: String,
	pub entity: Option<i64>,
}

impl CoalesceKey {
	pub fn for_message(message: &StructuredMessage, entity_keys: &HashMap<String, String>) -> Self {
		let entity = entity_keys
			.get(message.tag())
			.and_then(|property| message.get(property))
			.and_then(|value| value.as_i64());
		Self {
			tag: message.tag().to_string(),
			entity,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
	/// The remote closed its end.
	EndOfStream,
	/// Bad frame length, or too many undecodable frames in a row.
	ProtocolViolation,
	Io(String),
}

/// Latest undelivered message per key. A key is present exactly while a
/// delivery for it is scheduled.
#[derive(Debug, Default)]
pub struct PendingDispatchTable {
	pending: Mutex<HashMap<CoalesceKey, StructuredMessage>>,
}

impl PendingDispatchTable {
	fn pending(&self) -> MutexGuard<'_, HashMap<CoalesceKey, StructuredMessage>> {
		self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	/// Store `message` under `key`. Returns true when the caller must
	/// schedule a delivery, i.e. none was pending for this key.
	pub fn insert(&self, key: CoalesceKey, message: StructuredMessage) -> bool {
		self.pending().insert(key, message).is_none()
	}

	/// Remove and return the current value for `key`.
	pub fn take(&self, key: &CoalesceKey) -> Option<StructuredMessage> {
		self.pending().remove(key)
	}

	pub fn len(&self) -> usize {
		self.pending().len()
	}

	pub fn is_empty(&self) -> bool {
		self.pending().is_empty()
	}
}

#[derive(Clone, Default)]
pub struct DispatchHandlers {
	pub on_message: Option<MessageHandler>,
	pub on_ready: Option<SignalHandler>,
	pub on_closed: Option<ClosedHandler>,
}

struct Shared {
	table: PendingDispatchTable,
	handlers: DispatchHandlers,
	context: Arc<dyn ConsumerContext>,
	config: DispatcherConfig,
	ready_fired: AtomicBool,
	stopping: AtomicBool,
}

impl Shared {
	fn accept(self: &Arc<Self>, message: StructuredMessage) {
		if self.stopping.load(Ordering::Acquire) {
			return;
		}
		let is_ready = message.is(&self.config.ready_tag);
		if (is_ready || self.config.ready_on_first_message) && !self.ready_fired.swap(true, Ordering::AcqRel) {
			tracing::info!("remote ready");
			if let Some(on_ready) = self.handlers.on_ready.clone() {
				let shared = self.clone();
				self.context.schedule(Box::new(move || {
					if !shared.stopping.load(Ordering::Acquire) {
						on_ready();
					}
				}));
			}
		}
		if is_ready {
			return;
		}

		let key = CoalesceKey::for_message(&message, &self.config.entity_keys);
		if self.table.insert(key.clone(), message) {
			let shared = self.clone();
			self.context.schedule(Box::new(move || shared.deliver(&key)));
		} else {
			tracing::trace!(tag = %key.tag, entity = ?key.entity, "coalesced");
		}
	}

	fn deliver(&self, key: &CoalesceKey) {
		let Some(message) = self.table.take(key) else {
			return;
		};
		if self.stopping.load(Ordering::Acquire) {
			return;
		}
		if let Some(on_message) = &self.handlers.on_message {
			on_message(message);
		}
	}

	fn closed(self: &Arc<Self>, reason: CloseReason) {
		if self.stopping.load(Ordering::Acquire) {
			tracing::debug!(?reason, "reader finished during stop");
			return;
		}
		tracing::info!(?reason, "connection closed");
		if let Some(on_closed) = self.handlers.on_closed.clone() {
			let shared = self.clone();
			self.context.schedule(Box::new(move || {
				if !shared.stopping.load(Ordering::Acquire) {
					on_closed(reason);
				}
			}));
		}
	}
}

fn read_loop(mut reader: FrameReader, shared: Arc<Shared>) {
	let max_violations = shared.config.max_consecutive_violations.max(1);
	let mut violations = 0u32;
	let reason = loop {
		match reader.read_frame() {
			Ok(payload) => match StructuredMessage::decode(&payload) {
				Ok(message) => {
					violations = 0;
					tracing::trace!(tag = message.tag(), len = payload.len(), "frame");
					shared.accept(message);
				}
				Err(e) => {
					violations += 1;
					tracing::warn!(violations, len = payload.len(), "dropping undecodable frame: {e}");
					if violations >= max_violations {
						break CloseReason::ProtocolViolation;
					}
				}
			},
			Err(FrameError::Eof | FrameError::Closed) => break CloseReason::EndOfStream,
			Err(e) if e.is_protocol_violation() => {
				tracing::warn!("closing connection: {e}");
				break CloseReason::ProtocolViolation;
			}
			Err(e) => {
				tracing::error!("read failed: {e}");
				break CloseReason::Io(e.to_string());
			}
		}
	};
	shared.closed(reason);
}

pub struct Dispatcher {
	shared: Arc<Shared>,
	interrupter: Option<FrameInterrupter>,
	thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Dispatcher {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Dispatcher")
			.field("pending", &self.shared.table.len())
			.field("finished", &self.is_finished())
			.finish()
	}
}

impl Dispatcher {
	pub fn start(
		reader: FrameReader,
		context: Arc<dyn ConsumerContext>,
		handlers: DispatchHandlers,
		config: DispatcherConfig,
	) -> std::io::Result<Self> {
		let interrupter = reader.interrupter();
		let shared = Arc::new(Shared {
			table: PendingDispatchTable::default(),
			handlers,
			context,
			config,
			ready_fired: AtomicBool::new(false),
			stopping: AtomicBool::new(false),
		});
		let thread_shared = shared.clone();
		let thread = std::thread::Builder::new()
			.name("pane-reader".into())
			.spawn(move || read_loop(reader, thread_shared))?;
		Ok(Self {
			shared,
			interrupter,
			thread: Some(thread),
		})
	}

	pub fn is_ready(&self) -> bool {
		self.shared.ready_fired.load(Ordering::Acquire)
	}

	pub fn is_finished(&self) -> bool {
		self.thread.as_ref().is_none_or(JoinHandle::is_finished)
	}

	/// Suppress every callback from now on, including the closed signal.
	pub fn mark_stopping(&self) {
		self.shared.stopping.store(true, Ordering::Release);
	}

	/// Stop delivering and join the reader. A reader without an interrupter
	/// cannot be woken; if it has not seen end of stream shortly it is left to
	/// finish alone.
	pub fn stop(&mut self) {
		self.mark_stopping();
		if let Some(interrupter) = &self.interrupter {
			interrupter.interrupt();
		}
		let Some(thread) = self.thread.take() else {
			return;
		};
		if self.interrupter.is_none() {
			let deadline = Instant::now() + UNINTERRUPTIBLE_JOIN;
			while !thread.is_finished() && Instant::now() < deadline {
				std::thread::sleep(Duration::from_millis(5));
			}
			if !thread.is_finished() {
				tracing::debug!("detaching uninterruptible reader");
				return;
			}
		}
		if thread.join().is_err() {
			tracing::error!("reader thread panicked");
		}
	}
}

impl Drop for Dispatcher {
	fn drop(&mut self) {
		self.stop();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::consumer::QueueContext;
	use pane_protocol::Endpoint;
	use pane_protocol::message::Value;
	use std::io::Write;
	use std::os::unix::net::UnixStream;
	use std::sync::atomic::AtomicUsize;

	struct Harness {
		ctx: Arc<QueueContext>,
		remote: pane_protocol::FrameWriter,
		dispatcher: Dispatcher,
		messages: Arc<Mutex<Vec<StructuredMessage>>>,
		ready: Arc<AtomicUsize>,
		closed: Arc<Mutex<Vec<CloseReason>>>,
	}

	impl Harness {
		fn new(config: DispatcherConfig) -> Self {
			let (host, remote) = UnixStream::pair().unwrap();
			let (reader, _host_writer) = Endpoint::Socket(host).split().unwrap();
			let (_remote_reader, remote) = Endpoint::Socket(remote).split().unwrap();
			let ctx = Arc::new(QueueContext::new());
			let messages = Arc::new(Mutex::new(Vec::new()));
			let ready = Arc::new(AtomicUsize::new(0));
			let closed = Arc::new(Mutex::new(Vec::new()));
			let handlers = DispatchHandlers {
				on_message: Some({
					let messages = messages.clone();
					Arc::new(move |m: StructuredMessage| messages.lock().unwrap().push(m))
				}),
				on_ready: Some({
					let ready = ready.clone();
					Arc::new(move || {
						ready.fetch_add(1, Ordering::SeqCst);
					})
				}),
				on_closed: Some({
					let closed = closed.clone();
					Arc::new(move |r: CloseReason| closed.lock().unwrap().push(r))
				}),
			};
			let dispatcher = Dispatcher::start(reader, ctx.clone(), handlers, config).unwrap();
			Self {
				ctx,
				remote,
				dispatcher,
				messages,
				ready,
				closed,
			}
		}

		fn send(&self, message: &StructuredMessage) {
			self.remote.write_frame(&message.encode().unwrap()).unwrap();
		}

		/// Wait until the reader has consumed everything written so far.
		fn settle(&self) {
			self.send(&StructuredMessage::new("fence"));
			let deadline = Instant::now() + Duration::from_secs(5);
			while self.dispatcher.shared.table.take(&fence_key()).is_none() {
				assert!(Instant::now() < deadline, "reader stalled");
				std::thread::sleep(Duration::from_millis(2));
			}
		}

		fn wait_closed(&self) -> CloseReason {
			let deadline = Instant::now() + Duration::from_secs(5);
			loop {
				self.ctx.wait_and_run(Duration::from_millis(10));
				if let Some(reason) = self.closed.lock().unwrap().first() {
					return reason.clone();
				}
				assert!(Instant::now() < deadline, "never closed");
			}
		}
	}

	fn fence_key() -> CoalesceKey {
		CoalesceKey {
			tag: "fence".into(),
			entity: None,
		}
	}

	fn param_values(messages: &[StructuredMessage]) -> Vec<(i64, f64)> {
		messages.iter().filter_map(StructuredMessage::as_param).collect()
	}

	#[test]
	fn table_schedules_once_per_key() {
		let table = PendingDispatchTable::default();
		let key = CoalesceKey {
			tag: "param".into(),
			entity: Some(0),
		};
		assert!(table.insert(key.clone(), StructuredMessage::param(0, 0.1)));
		assert!(!table.insert(key.clone(), StructuredMessage::param(0, 0.2)));
		assert_eq!(table.take(&key).unwrap().as_param(), Some((0, 0.2)));
		assert!(table.take(&key).is_none());
		assert!(table.insert(key, StructuredMessage::param(0, 0.3)));
	}

	#[test]
	fn key_uses_entity_property_for_listed_tags() {
		let keys = DispatcherConfig::default().entity_keys;
		let param = CoalesceKey::for_message(&StructuredMessage::param(4, 1.0), &keys);
		assert_eq!(param.entity, Some(4));
		let other = CoalesceKey::for_message(&StructuredMessage::new("meter").with("id", 4), &keys);
		assert_eq!(other.entity, None);
		let missing = CoalesceKey::for_message(&StructuredMessage::new("param"), &keys);
		assert_eq!(missing.entity, None);
	}

	#[test]
	fn burst_on_one_key_delivers_last_value_once() {
		let h = Harness::new(DispatcherConfig::default());
		for i in 0..8 {
			h.send(&StructuredMessage::param(0, f64::from(i) / 10.0));
		}
		h.settle();
		h.ctx.run_pending();
		assert_eq!(param_values(&h.messages.lock().unwrap()), [(0, 0.7)]);
	}

	#[test]
	fn distinct_keys_are_all_delivered_in_order() {
		let h = Harness::new(DispatcherConfig::default());
		for i in 0..5 {
			h.send(&StructuredMessage::param(0, f64::from(i)));
			h.send(&StructuredMessage::param(1, f64::from(i) + 100.0));
		}
		h.send(&StructuredMessage::new("meter").with("level", Value::Double(0.5)));
		h.settle();
		h.ctx.run_pending();
		let messages = h.messages.lock().unwrap();
		assert_eq!(param_values(&messages), [(0, 4.0), (1, 104.0)]);
		assert!(messages.last().unwrap().is("meter"));
	}

	#[test]
	fn ready_fires_once_and_is_not_forwarded() {
		let h = Harness::new(DispatcherConfig::default());
		h.send(&StructuredMessage::ready());
		h.send(&StructuredMessage::ready());
		h.settle();
		h.ctx.run_pending();
		assert_eq!(h.ready.load(Ordering::SeqCst), 1);
		assert!(h.messages.lock().unwrap().is_empty());
		assert!(h.dispatcher.is_ready());
	}

	#[test]
	fn first_message_can_signal_ready() {
		let config = DispatcherConfig {
			ready_on_first_message: true,
			..DispatcherConfig::default()
		};
		let h = Harness::new(config);
		h.send(&StructuredMessage::param(2, 1.0));
		h.send(&StructuredMessage::param(3, 1.0));
		h.settle();
		h.ctx.run_pending();
		assert_eq!(h.ready.load(Ordering::SeqCst), 1);
		assert_eq!(param_values(&h.messages.lock().unwrap()).len(), 2);
	}

	#[test]
	fn sporadic_garbage_is_dropped() {
		let h = Harness::new(DispatcherConfig::default());
		h.remote.write_frame(b"\xff").unwrap();
		h.remote.write_frame(b"\xff").unwrap();
		h.send(&StructuredMessage::param(1, 0.5));
		h.remote.write_frame(b"\xff").unwrap();
		h.settle();
		h.ctx.run_pending();
		assert_eq!(param_values(&h.messages.lock().unwrap()), [(1, 0.5)]);
		assert!(h.closed.lock().unwrap().is_empty());
	}

	#[test]
	fn consecutive_garbage_closes_connection() {
		let h = Harness::new(DispatcherConfig::default());
		for _ in 0..3 {
			h.remote.write_frame(b"\xff").unwrap();
		}
		assert_eq!(h.wait_closed(), CloseReason::ProtocolViolation);
	}

	#[test]
	fn oversized_header_closes_connection() {
		let (host, mut remote) = UnixStream::pair().unwrap();
		let (reader, _writer) = Endpoint::Socket(host).split().unwrap();
		let ctx = Arc::new(QueueContext::new());
		let closed = Arc::new(Mutex::new(None));
		let handlers = DispatchHandlers {
			on_closed: Some({
				let closed = closed.clone();
				Arc::new(move |r: CloseReason| *closed.lock().unwrap() = Some(r))
			}),
			..DispatchHandlers::default()
		};
		let _dispatcher = Dispatcher::start(reader, ctx.clone(), handlers, DispatcherConfig::default()).unwrap();
		remote
			.write_all(&(pane_protocol::MAX_FRAME_LEN + 1).to_le_bytes())
			.unwrap();
		let deadline = Instant::now() + Duration::from_secs(5);
		while closed.lock().unwrap().is_none() {
			ctx.wait_and_run(Duration::from_millis(10));
			assert!(Instant::now() < deadline);
		}
		assert_eq!(*closed.lock().unwrap(), Some(CloseReason::ProtocolViolation));
	}

	#[test]
	fn remote_close_is_end_of_stream() {
		let h = Harness::new(DispatcherConfig::default());
		h.remote.close();
		assert_eq!(h.wait_closed(), CloseReason::EndOfStream);
	}

	#[test]
	fn stop_suppresses_callbacks() {
		let mut h = Harness::new(DispatcherConfig::default());
		h.send(&StructuredMessage::param(0, 1.0));
		h.settle();
		h.dispatcher.stop();
		assert!(h.dispatcher.is_finished());
		h.ctx.run_pending();
		assert!(h.messages.lock().unwrap().is_empty());
		assert!(h.closed.lock().unwrap().is_empty());
	}
}
