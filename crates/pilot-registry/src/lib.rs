//! # pilot-registry
//!
//! Tracks the phantom threads of every dry run and ties them to records in
//! an external coordination service, so that a dry run can be torn down
//! from any process.
//!
//! ## Node layout
//!
//! ```text
//! /pilot/<id>                      persistent, one per dry run
//! /pilot/<id>/<host>-<thread>      ephemeral, one per phantom thread
//! /pilot_result/<id>               present only if the dry run failed
//! ```
//!
//! Deleting `/pilot/<id>` (by `wait_until_pilot_finished`, an operator, or
//! an abort on another host) interrupts every local phantom thread of that
//! pilot, cancels its scheduled tasks and runs the pilot-end hooks, which
//! is where a [`ShadowWorkspace`](pilot_fs::ShadowWorkspace) drops the
//! pilot's shadow files.

pub mod coord;
pub mod pilot;
pub mod registry;
pub mod task;

pub use coord::{
    CoordinationService, CoordinatorSession, CreateMode, InMemoryCoordinator, WatchCallback,
    WatchEvent,
};
pub use pilot::{PilotState, PilotStatus};
pub use registry::{PhantomThreadRegistry, RegistrySettings};
pub use task::PhantomTask;

use pilot_context::Interrupted;
use std::io;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    #[error("coordination service unavailable: {0}")]
    Unavailable(String),

    #[error("no node: {0}")]
    NoNode(String),

    #[error("node exists: {0}")]
    NodeExists(String),

    #[error("node has children: {0}")]
    NotEmpty(String),

    #[error("invalid node path: {0}")]
    InvalidPath(String),
}

pub type CoordResult<T> = std::result::Result<T, CoordinationError>;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    #[error(transparent)]
    Interrupted(#[from] Interrupted),

    #[error("failed to spawn phantom thread: {0}")]
    Spawn(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, RegistryError>;
