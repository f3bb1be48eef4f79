//! Python interpreter discovery.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::info;

/// Resolve the Python executable to spawn workers with.
///
/// Order: explicit configuration, `PYLON_PYTHON`, then `python3`/`python`
/// on PATH. The chosen interpreter is probed with `--version` so a broken
/// path fails at boot rather than on the first request.
pub fn detect_interpreter(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        verify_interpreter(path)?;
        return Ok(path.to_path_buf());
    }

    if let Ok(env_path) = std::env::var("PYLON_PYTHON") {
        let path = PathBuf::from(env_path);
        verify_interpreter(&path)?;
        return Ok(path);
    }

    for candidate in ["python3", "python"] {
        if let Ok(path) = which::which(candidate) {
            verify_interpreter(&path)?;
            return Ok(path);
        }
    }

    anyhow::bail!(
        "No Python interpreter found. Set interpreter.path or PYLON_PYTHON, \
        or install python3 on PATH."
    )
}

fn verify_interpreter(path: &Path) -> Result<()> {
    let output = Command::new(path)
        .arg("--version")
        .output()
        .with_context(|| format!("Failed to run {} --version", path.display()))?;
    if !output.status.success() {
        anyhow::bail!(
            "{} --version exited with {}",
            path.display(),
            output.status
        );
    }
    // `--version` historically printed to stderr; accept either stream.
    let version = if output.stdout.is_empty() {
        String::from_utf8_lossy(&output.stderr).trim().to_string()
    } else {
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    };
    if !version.starts_with("Python 3") {
        anyhow::bail!("{} is not a Python 3 interpreter: {}", path.display(), version);
    }
    info!("Using interpreter {} ({})", path.display(), version);
    Ok(())
}
