//! Bridge between `param` messages and the host's parameter model.

use pane_protocol::StructuredMessage;

/// The host's parameter store, indexed by the `id` carried in `param` messages.
pub trait ParamModel: Send + Sync {
	fn param_count(&self) -> usize;
	fn value(&self, index: usize) -> f64;
	/// Set and notify the host's listeners.
	fn set_value_notifying(&self, index: usize, value: f64);
}

/// Apply an inbound `param` message. Returns false for anything else or for
/// ids outside the model.
pub fn apply_param(model: &dyn ParamModel, message: &StructuredMessage) -> bool {
	let Some((id, value)) = message.as_param() else {
		return false;
	};
	match usize::try_from(id) {
		Ok(index) if index < model.param_count() => {
			model.set_value_notifying(index, value);
			true
		}
		_ => {
			tracing::debug!(id, "param id outside model");
			false
		}
	}
}

/// One `param` message per parameter, carrying its current value.
pub fn snapshot(model: &dyn ParamModel) -> Vec<StructuredMessage> {
	(0..model.param_count())
		.filter_map(|index| {
			let id = i32::try_from(index).ok()?;
			Some(StructuredMessage::param(id, model.value(index)))
		})
		.collect()
}
