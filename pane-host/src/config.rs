use pane_protocol::SurfaceBackend;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("invalid config json: {0}")]
	Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
	/// One socket pair; the remote end is installed at fd 3.
	#[default]
	Socket,
	/// stdin/stdout of the child. Host to remote carries input events only.
	Pipes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SurfaceMode {
	#[default]
	Auto,
	Global,
	Capability,
}

impl SurfaceMode {
	pub fn backend(self) -> SurfaceBackend {
		match self {
			SurfaceMode::Auto => SurfaceBackend::detect(),
			SurfaceMode::Global => SurfaceBackend::Global,
			SurfaceMode::Capability => SurfaceBackend::Capability,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
	pub grace_period_ms: u64,
	pub poll_interval_ms: u64,
	pub reap_timeout_ms: u64,
}

impl Default for SupervisorConfig {
	fn default() -> Self {
		Self {
			grace_period_ms: 200,
			poll_interval_ms: 10,
			reap_timeout_ms: 1000,
		}
	}
}

impl SupervisorConfig {
	pub fn grace_period(&self) -> Duration {
		Duration::from_millis(self.grace_period_ms)
	}

	pub fn poll_interval(&self) -> Duration {
		Duration::from_millis(self.poll_interval_ms.max(1))
	}

	pub fn reap_timeout(&self) -> Duration {
		Duration::from_millis(self.reap_timeout_ms)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
	/// Message tag -> integer property that identifies the entity an update
	/// belongs to. Tags listed here coalesce per entity instead of per tag.
	pub entity_keys: HashMap<String, String>,
	pub ready_tag: String,
	/// Treat the first decoded message of any tag as the ready signal.
	pub ready_on_first_message: bool,
	pub max_consecutive_violations: u32,
}

impl Default for DispatcherConfig {
	fn default() -> Self {
		Self {
			entity_keys: HashMap::from([(
				pane_protocol::message::PARAM_TAG.to_string(),
				pane_protocol::message::PARAM_ID.to_string(),
			)]),
			ready_tag: pane_protocol::message::READY_TAG.to_string(),
			ready_on_first_message: false,
			max_consecutive_violations: 3,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HostConfig {
	pub transport: TransportMode,
	pub surface: SurfaceMode,
	pub supervisor: SupervisorConfig,
	pub dispatcher: DispatcherConfig,
	/// Pixels per logical unit.
	pub scale: f32,
	pub working_dir: Option<PathBuf>,
	/// Passed to the remote before the launch flags.
	pub extra_args: Vec<String>,
}

impl Default for HostConfig {
	fn default() -> Self {
		Self {
			transport: TransportMode::default(),
			surface: SurfaceMode::default(),
			supervisor: SupervisorConfig::default(),
			dispatcher: DispatcherConfig::default(),
			scale: 1.0,
			working_dir: None,
			extra_args: Vec::new(),
		}
	}
}

impl HostConfig {
	pub fn from_json(json: &str) -> Result<Self, ConfigError> {
		Ok(serde_json::from_str(json)?)
	}

	/// Defaults with `PANE_*` environment overrides applied.
	pub fn from_env() -> Self {
		let mut config = Self::default();
		config.apply_overrides(|name| std::env::var(name).ok());
		config
	}

	pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
		if let Some(v) = var("PANE_TRANSPORT") {
			match v.trim().to_ascii_lowercase().as_str() {
				"socket" => self.transport = TransportMode::Socket,
				"pipes" | "pipe" => self.transport = TransportMode::Pipes,
				other => tracing::warn!(value = other, "ignoring invalid PANE_TRANSPORT"),
			}
		}
		if let Some(v) = var("PANE_SURFACE") {
			match v.trim().to_ascii_lowercase().as_str() {
				"auto" => self.surface = SurfaceMode::Auto,
				"global" => self.surface = SurfaceMode::Global,
				"capability" => self.surface = SurfaceMode::Capability,
				other => tracing::warn!(value = other, "ignoring invalid PANE_SURFACE"),
			}
		}
		if let Some(v) = var("PANE_GRACE_MS") {
			match v.trim().parse() {
				Ok(ms) => self.supervisor.grace_period_ms = ms,
				Err(_) => tracing::warn!(value = %v, "ignoring invalid PANE_GRACE_MS"),
			}
		}
		if let Some(v) = var("PANE_SCALE") {
			match v.trim().parse::<f32>() {
				Ok(scale) if scale.is_finite() && scale > 0.0 => self.scale = scale,
				_ => tracing::warn!(value = %v, "ignoring invalid PANE_SCALE"),
			}
		}
	}

	/// Logical size to surface pixels.
	pub fn pixel_size(&self, width: u32, height: u32) -> (u32, u32) {
		let scale = |v: u32| ((v as f32) * self.scale).round().max(1.0) as u32;
		(scale(width), scale(height))
	}
}
