// src/config/mod.rs

//! Manifest loading and validation for the `dagsched` binary.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a manifest from disk (`loader.rs`).
//! - Validate it before anything is scheduled (`validate.rs`).
//!
//! The scheduler library itself never reads configuration; the manifest is
//! turned into [`TaskSpec`](crate::engine::TaskSpec)s and
//! [`SchedulerOptions`](crate::engine::SchedulerOptions) by the host.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_and_validate, load_from_path};
pub use model::{Manifest, RawManifest, SchedulerSection, TaskEntry};
pub use validate::validate_manifest;
