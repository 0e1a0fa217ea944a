//! Bridge between a stdio LSP client and an IPC-mode ETS language server.
//!
//! ```text
//! editor stdin -> FrameParser -> [initialize interception] -> IPC -> backend
//! backend -> IPC -> FrameWriter -> editor stdout
//! ```

pub mod bridge;
pub mod codec;
pub mod protocol;
pub mod types;

#[cfg(unix)]
pub mod backend;
#[cfg(unix)]
pub mod ipc;

#[cfg(unix)]
pub use backend::{Backend, BackendProcess};
#[cfg(unix)]
pub use bridge::Bridge;
pub use bridge::{BridgeState, StopReason, relay};
pub use codec::{FrameParser, FrameWriter, encode_frame};
pub use types::{BACKEND_ARGS, BackendConfig, BackendError, BackendLink};
