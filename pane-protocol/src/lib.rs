//! Wire-level pieces shared by the host and the remote UI process.
//!
//! Every message crosses the process boundary as one length-prefixed
//! [`frame`]. Host to remote frames carry [`input::InputEvent`] records (and,
//! on a socket transport, [`message::StructuredMessage`] trees behind a
//! [`packet`] discriminant); remote to host frames always carry structured
//! messages. Pixels never travel over the transport: both sides map the same
//! [`surface`] memory, located either by a global identifier or by a file
//! descriptor handed over through [`capability`].

pub mod capability;
pub mod frame;
pub mod input;
pub mod launch;
pub mod message;
pub mod packet;
pub mod remote;
pub mod surface;

pub use capability::{CapabilityError, CapabilityGrant};
pub use frame::{Endpoint, FrameError, FrameReader, FrameWriter, MAX_FRAME_LEN};
pub use input::{EventAction, EventKind, InputEvent, InputEventError};
pub use launch::{LaunchArgs, LaunchArgsError, SurfaceArg, TransportArg};
pub use message::{MessageError, StructuredMessage, Value};
pub use packet::{HostFraming, HostPacket, PacketError};
pub use remote::{RemoteChannel, RemoteError};
pub use surface::{SharedSurface, SurfaceBackend, SurfaceError, SurfaceId, SurfaceLocator, SurfaceRef};

pub const PROTOCOL_NAME: &str = "pane";
pub const PROTOCOL_MAJOR: &str = "1";
pub const PROTOCOL_VERSION: &str = const_str::concat!(PROTOCOL_NAME, "/", PROTOCOL_MAJOR);
