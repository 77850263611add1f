//! Policy hot-reload.
//!
//! Watches `maestro.toml` and, after a debounce window, swaps the installed
//! policy set for the file's `[[policies]]` section. Other sections need a
//! restart.

use maestro_coordinator::{Policy, PolicyEngine};
use maestro_core::{MaestroError, MaestroResult};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The part of the config file that is re-read on change.
///
/// An absent `policies` key leaves the installed set alone; an explicit
/// empty list clears it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReloadableConfig {
    #[serde(default)]
    pub policies: Option<Vec<Policy>>,
}

impl ReloadableConfig {
    /// Install the reloaded policies. Returns how many are now active.
    pub fn apply(self, engine: &PolicyEngine) -> Option<usize> {
        let policies = self.policies?;
        let count = policies.len();
        engine.replace_all(policies);
        Some(count)
    }
}

/// Keeps the file watch alive; dropping it stops reloading.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Watch `config_path` and replace the policies in `engine` on every change.
    pub fn watch_policies(
        config_path: PathBuf,
        debounce: Duration,
        engine: Arc<PolicyEngine>,
    ) -> MaestroResult<Self> {
        Self::start(config_path, debounce, move |config| {
            if let Some(count) = config.apply(&engine) {
                tracing::info!(count, "Policies reloaded");
            }
        })
    }

    /// Call `on_reload` on a background thread after each debounced modification
    /// that parses. Parse errors are logged and skipped.
    pub fn start<F>(config_path: PathBuf, debounce: Duration, on_reload: F) -> MaestroResult<Self>
    where
        F: Fn(ReloadableConfig) + Send + 'static,
    {
        let (tx, rx) = std_mpsc::channel();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    let _ = tx.send(());
                }
            }
        })
        .map_err(|e| MaestroError::Config(format!("Failed to create file watcher: {e}")))?;

        watcher
            .watch(&config_path, RecursiveMode::NonRecursive)
            .map_err(|e| MaestroError::Config(format!("Failed to watch config file: {e}")))?;

        let path = config_path.clone();
        std::thread::spawn(move || {
            let mut last_reload = Instant::now();
            while rx.recv().is_ok() {
                // Editors often write in several steps; wait out the burst.
                let since = last_reload.elapsed();
                if since < debounce {
                    std::thread::sleep(debounce - since);
                }
                while rx.try_recv().is_ok() {}
                last_reload = Instant::now();

                match parse_config(&path) {
                    Ok(config) => on_reload(config),
                    Err(e) => tracing::warn!(error = %e, "Ignoring config change"),
                }
            }
            tracing::debug!("Config watcher thread exiting");
        });

        tracing::info!(path = %config_path.display(), "Watching config for policy changes");
        Ok(Self { _watcher: watcher })
    }
}

/// Read the reloadable sections of a TOML config file.
pub fn parse_config(path: &Path) -> MaestroResult<ReloadableConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        MaestroError::Config(format!("Failed to read config '{}': {e}", path.display()))
    })?;
    toml::from_str(&content).map_err(|e| {
        MaestroError::Config(format!("Failed to parse config '{}': {e}", path.display()))
    })
}
