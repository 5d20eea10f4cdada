//! # rffmpeg-proto
//!
//! Shared types for the rffmpeg dispatcher.
//!
//! This crate provides:
//! - Host records and the selector's target type
//! - The line-oriented state record format and the derived load view
//! - Tool personalities and invocations
//! - The base64 argument payload carried to remote hosts

mod error;
mod host;
mod invocation;
mod payload;
mod state;

pub use error::ProtoError;
pub use host::{HostRecord, LOCAL_CLAIM, SelectedTarget};
pub use invocation::{INFORMATIONAL_FLAGS, Personality, ToolInvocation};
pub use payload::{ArgPayload, DECODE_FAILURE_EXIT_CODE, command_line, shell_quote};
pub use state::{HostLoad, LoadView, StateLine};
