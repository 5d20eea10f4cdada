//! # rffmpeg-core
//!
//! Host selection and dispatch engine for rffmpeg.
//!
//! This crate provides:
//! - Configuration loading and the host catalog built from it
//! - Load tracking through per-process state records
//! - Weighted least-loaded host selection with local fallback
//! - Local and ssh command construction and execution
//! - State record lifecycle tied to process exit and termination signals

pub mod catalog;
pub mod config;
pub mod dispatcher;
pub mod lifecycle;
pub mod logging;
pub mod selector;
pub mod session;
pub mod tracker;

pub use catalog::HostCatalog;
pub use config::{
    CONFIG_ENV, ConfigError, DEFAULT_CONFIG_PATH, GlobalConfig, HostSection, RffmpegConfig,
    config_path,
};
pub use dispatcher::{DispatchCommand, DispatchError, Dispatcher, SshSettings, StdoutRoute};
pub use lifecycle::{Outcome, Registration, SignalListener, Termination, run_until_terminated};
pub use selector::{Candidate, rank, select};
pub use session::{Phase, dispatch};
pub use tracker::{
    DirectoryTracker, LoadTracker, MemoryTracker, RecordId, RecordPattern, TrackerError,
};
