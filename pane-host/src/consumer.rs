//! Where dispatcher callbacks run.
//!
//! The host supplies one [`ConsumerContext`] per session. Every callback is
//! scheduled onto it as a [`Task`]; implementations must run tasks one at a
//! time in the order they were scheduled.

use std::sync::Mutex;
use std::sync::mpsc;
use std::time::Duration;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait ConsumerContext: Send + Sync {
	fn schedule(&self, task: Task);
}

impl<F> ConsumerContext for F
where
	F: Fn(Task) + Send + Sync,
{
	fn schedule(&self, task: Task) {
		self(task)
	}
}

/// Queue drained by the host on its UI thread.
pub struct QueueContext {
	tx: mpsc::Sender<Task>,
	rx: Mutex<mpsc::Receiver<Task>>,
}

impl std::fmt::Debug for QueueContext {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("QueueContext").finish_non_exhaustive()
	}
}

impl Default for QueueContext {
	fn default() -> Self {
		Self::new()
	}
}

impl QueueContext {
	pub fn new() -> Self {
		let (tx, rx) = mpsc::channel();
		Self {
			tx,
			rx: Mutex::new(rx),
		}
	}

	/// Run every task queued so far. Must not be called from inside a task.
	pub fn run_pending(&self) -> usize {
		let rx = match self.rx.lock() {
			Ok(rx) => rx,
			Err(poisoned) => poisoned.into_inner(),
		};
		let mut ran = 0;
		while let Ok(task) = rx.try_recv() {
			task();
			ran += 1;
		}
		ran
	}

	/// Wait up to `timeout` for a task, then run everything queued.
	pub fn wait_and_run(&self, timeout: Duration) -> usize {
		let rx = match self.rx.lock() {
			Ok(rx) => rx,
			Err(poisoned) => poisoned.into_inner(),
		};
		let Ok(first) = rx.recv_timeout(timeout) else {
			return 0;
		};
		first();
		let mut ran = 1;
		while let Ok(task) = rx.try_recv() {
			task();
			ran += 1;
		}
		ran
	}
}

impl ConsumerContext for QueueContext {
	fn schedule(&self, task: Task) {
		// The receiver lives in self, so the channel cannot be disconnected.
		let _ = self.tx.send(task);
	}
}

/// Serial delivery on a tokio task.
#[cfg(feature = "async")]
#[derive(Debug, Clone)]
pub struct TokioContext {
	tx: tokio::sync::mpsc::UnboundedSender<Task>,
}

#[cfg(feature = "async")]
impl TokioContext {
	pub fn spawn(handle: &tokio::runtime::Handle) -> Self {
		let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Task>();
		handle.spawn(async move {
			while let Some(task) = rx.recv().await {
				task();
			}
			tracing::trace!("consumer task finished");
		});
		Self { tx }
	}
}

#[cfg(feature = "async")]
impl ConsumerContext for TokioContext {
	fn schedule(&self, task: Task) {
		if self.tx.send(task).is_err() {
			tracing::debug!("consumer runtime gone, dropping task");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;
	use std::sync::atomic::{AtomicUsize, Ordering};

	#[test]
	fn queue_runs_in_order_on_drain() {
		let ctx = QueueContext::new();
		let seen = Arc::new(Mutex::new(Vec::new()));
		for i in 0..3 {
			let seen = seen.clone();
			ctx.schedule(Box::new(move || seen.lock().unwrap().push(i)));
		}
		assert!(seen.lock().unwrap().is_empty());
		assert_eq!(ctx.run_pending(), 3);
		assert_eq!(*seen.lock().unwrap(), [0, 1, 2]);
		assert_eq!(ctx.run_pending(), 0);
	}

	#[test]
	fn wait_and_run_times_out_empty() {
		let ctx = QueueContext::new();
		assert_eq!(ctx.wait_and_run(Duration::from_millis(5)), 0);
	}

	#[test]
	fn closures_are_contexts() {
		let count = Arc::new(AtomicUsize::new(0));
		let inline = |task: Task| task();
		let c = count.clone();
		inline.schedule(Box::new(move || {
			c.fetch_add(1, Ordering::SeqCst);
		}));
		assert_eq!(count.load(Ordering::SeqCst), 1);
	}

	#[cfg(feature = "async")]
	#[tokio::test]
	async fn tokio_context_delivers_serially() {
		let ctx = TokioContext::spawn(&tokio::runtime::Handle::current());
		let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
		for i in 0..4 {
			let done_tx = done_tx.clone();
			ctx.schedule(Box::new(move || {
				let _ = done_tx.send(i);
			}));
		}
		let mut got = Vec::new();
		for _ in 0..4 {
			got.push(done_rx.recv().await.unwrap());
		}
		assert_eq!(got, [0, 1, 2, 3]);
	}
}
