//! Materialization of the embedded Python bridge.
//!
//! The bridge source is baked into the binary at compile time so a single
//! executable can run from any location. At runtime it is written to
//! `~/.pylon/shim/{version}/pylon_bridge.py` with an atomic rename; the
//! version segment retires stale copies when the shim changes.

use anyhow::{Context, Result};
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, info};

/// Embedded bridge source.
pub const BRIDGE_SOURCE: &str = include_str!("../shim/pylon_bridge.py");

/// Crate version for shim cache path versioning.
const CRATE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Write the bridge shim to its cache path if needed and return the path.
///
/// Idempotent: an existing file with matching content is reused. Concurrent
/// callers race benignly through the atomic rename.
pub fn materialize_bridge_shim() -> Result<PathBuf> {
    let shim_dir = pylon_home().join("shim").join(CRATE_VERSION);
    let shim_path = shim_dir.join("pylon_bridge.py");

    let cached = shim_path.exists()
        && matches!(
            std::fs::read_to_string(&shim_path),
            Ok(existing) if existing == BRIDGE_SOURCE
        );
    if cached {
        debug!("Using cached bridge shim: {}", shim_path.display());
        return Ok(shim_path);
    }

    std::fs::create_dir_all(&shim_dir)
        .with_context(|| format!("Failed to create shim directory: {}", shim_dir.display()))?;

    let unique_id = format!(
        "{}.{:?}",
        std::process::id(),
        std::thread::current().id()
    );
    let temp_path = shim_dir.join(format!(".pylon_bridge.py.{}.tmp", unique_id));

    let mut file = std::fs::File::create(&temp_path)
        .with_context(|| format!("Failed to create temp file: {}", temp_path.display()))?;
    file.write_all(BRIDGE_SOURCE.as_bytes())
        .with_context(|| format!("Failed to write shim to: {}", temp_path.display()))?;
    file.sync_all().context("Failed to sync shim to disk")?;
    drop(file);

    match std::fs::rename(&temp_path, &shim_path) {
        Ok(()) => {
            info!("Materialized bridge shim v{}: {}", CRATE_VERSION, shim_path.display());
        }
        Err(e) => {
            let _ = std::fs::remove_file(&temp_path);
            if !shim_path.exists() {
                return Err(e).with_context(|| {
                    format!("Failed to rename shim into place: {}", shim_path.display())
                });
            }
            debug!("Another process materialized the shim, using existing");
        }
    }

    Ok(shim_path)
}

fn pylon_home() -> PathBuf {
    pylon_protocol::config::pylon_home()
}
