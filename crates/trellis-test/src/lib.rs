//! Trellis Test - Shared test utilities for the trellis runtime.
//!
//! This crate provides scripted bundles, recording doubles and fixtures
//! that can be used across trellis crates as a dev-dependency.
//!
//! # Usage
//!
//! ```rust,ignore
//! use trellis_test::{AppScript, BackendScript, Journal, ScriptedLoader, StaticResolver};
//!
//! let journal = Journal::default();
//! let loader = ScriptedLoader::new(journal.clone())
//!     .with_engine("tk-desktop", BackendScript::default())
//!     .with_app("tk-multi-publish", AppScript::new().with_commands(&["Publish..."]))
//!     .build();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod fixtures;
pub mod harness;
pub mod mocks;

pub use fixtures::*;
pub use harness::*;
pub use mocks::*;
