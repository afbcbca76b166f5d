//! Subcommands of the `keystone` binary.

pub mod config;
pub mod describe;
pub mod routes;
pub mod scope;
pub mod validate;

use anyhow::{Context, Result};
use keystone_core::manifest::{CompiledManifest, Manifest};
use std::path::Path;

/// Load and compile a manifest, attaching the path to any error.
pub fn compile(path: &Path) -> Result<CompiledManifest> {
    let manifest =
        Manifest::load(path).with_context(|| format!("Failed to load {}", path.display()))?;
    manifest
        .compile()
        .with_context(|| format!("Invalid manifest {}", path.display()))
}
