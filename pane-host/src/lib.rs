//! Host side of a remote UI process.
//!
//! A [`Session`] spawns the remote executable under a [`supervisor`], shares
//! a pixel surface with it, forwards input and structured messages over the
//! framed transport, and delivers the remote's messages through the
//! coalescing [`dispatcher`] onto a host supplied [`ConsumerContext`].

pub mod capability;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod params;
pub mod session;
pub mod supervisor;

pub use capability::{CapabilityServer, CapabilityTransfer};
pub use config::{ConfigError, DispatcherConfig, HostConfig, SupervisorConfig, SurfaceMode, TransportMode};
#[cfg(feature = "async")]
pub use consumer::TokioContext;
pub use consumer::{ConsumerContext, QueueContext, Task};
pub use dispatcher::{CloseReason, CoalesceKey, DispatchHandlers, Dispatcher, PendingDispatchTable};
pub use params::ParamModel;
pub use session::{Session, SessionBuilder, SessionError, SurfaceInfo};
pub use supervisor::{LaunchCommand, LaunchError, StopOutcome, Supervisor, SupervisorState};
