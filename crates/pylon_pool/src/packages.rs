//! Package manager interface for the worker environment.
//!
//! An external component may install or query Python packages; the core
//! consumes this only at boot, to make sure the completion engine is
//! available. Install failures degrade to fallback completion inside the
//! bridge, they never block startup.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::Command;
use tracing::{info, warn};

/// The completion engine the bridge prefers when importable.
pub const COMPLETION_ENGINE: &str = "jedi";

/// Queries and installs Python packages in the worker environment.
pub trait PackageManager: Send + Sync {
    fn is_installed(&self, name: &str) -> Result<bool>;
    fn install(&self, name: &str) -> Result<()>;
}

/// pip-backed implementation, driven through the configured interpreter so
/// packages land in the same environment the workers run in.
pub struct PipPackageManager {
    interpreter: PathBuf,
}

impl PipPackageManager {
    pub fn new(interpreter: PathBuf) -> Self {
        Self { interpreter }
    }
}

impl PackageManager for PipPackageManager {
    fn is_installed(&self, name: &str) -> Result<bool> {
        let output = Command::new(&self.interpreter)
            .args(["-m", "pip", "show", name])
            .output()
            .with_context(|| format!("Failed to run pip show {}", name))?;
        Ok(output.status.success())
    }

    fn install(&self, name: &str) -> Result<()> {
        info!("Installing {} via pip", name);
        let output = Command::new(&self.interpreter)
            .args(["-m", "pip", "install", "--quiet", name])
            .output()
            .with_context(|| format!("Failed to run pip install {}", name))?;
        if !output.status.success() {
            anyhow::bail!(
                "pip install {} failed: {}",
                name,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Make sure the completion engine is present. Returns whether it is
/// available after the attempt.
pub fn ensure_completion_engine(manager: &dyn PackageManager) -> bool {
    match manager.is_installed(COMPLETION_ENGINE) {
        Ok(true) => true,
        Ok(false) => match manager.install(COMPLETION_ENGINE) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "Could not install {}; completions fall back to the builtin matcher: {}",
                    COMPLETION_ENGINE, e
                );
                false
            }
        },
        Err(e) => {
            warn!("Could not query pip for {}: {}", COMPLETION_ENGINE, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeManager {
        installed: AtomicBool,
        install_fails: bool,
    }

    impl PackageManager for FakeManager {
        fn is_installed(&self, _name: &str) -> Result<bool> {
            Ok(self.installed.load(Ordering::SeqCst))
        }

        fn install(&self, _name: &str) -> Result<()> {
            if self.install_fails {
                anyhow::bail!("no network");
            }
            self.installed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_already_installed() {
        let manager = FakeManager {
            installed: AtomicBool::new(true),
            install_fails: true,
        };
        assert!(ensure_completion_engine(&manager));
    }

    #[test]
    fn test_installs_when_missing() {
        let manager = FakeManager {
            installed: AtomicBool::new(false),
            install_fails: false,
        };
        assert!(ensure_completion_engine(&manager));
        assert!(manager.installed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_install_failure_degrades() {
        let manager = FakeManager {
            installed: AtomicBool::new(false),
            install_fails: true,
        };
        assert!(!ensure_completion_engine(&manager));
    }
}
