use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use arc_swap::ArcSwap;
use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, error, info, warn};

use crate::config;
use crate::matcher::RuntimeConfig;

const RELOAD_ATTEMPTS: usize = 3;

pub fn spawn(path: PathBuf, runtime: Arc<ArcSwap<RuntimeConfig>>) {
    // the watcher lives on a plain thread; notify delivers over a std channel
    thread::spawn(move || {
        if let Err(err) = run_watcher(path, runtime) {
            error!(target = "watcher", error = %err, "config watcher exited with error");
        }
    });
}

/// Load, open stores and compile; swap only when everything succeeded.
pub fn reload(path: &Path, runtime: &ArcSwap<RuntimeConfig>) -> anyhow::Result<()> {
    let cfg = config::load_config(path)?;
    let compiled = RuntimeConfig::from_config(cfg)
        .with_context(|| format!("compile config: {}", path.display()))?;
    info!(
        target = "watcher",
        path = %path.display(),
        rules = compiled.rules.len(),
        stores = compiled.stores.len(),
        "config reloaded"
    );
    runtime.store(Arc::new(compiled));
    Ok(())
}

fn run_watcher(path: PathBuf, runtime: Arc<ArcSwap<RuntimeConfig>>) -> notify::Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher: RecommendedWatcher = Watcher::new(tx, Config::default())?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;

    info!(target = "watcher", path = %path.display(), "config watcher started");

    for res in rx {
        match res {
            Ok(event) if matches!(event.kind, EventKind::Access(_)) => {
                debug!(target = "watcher", kind = ?event.kind, "ignoring access event");
            }
            Ok(_event) => {
                // retry to ride out truncate-then-write editors
                for attempt in 1..=RELOAD_ATTEMPTS {
                    match reload(&path, &runtime) {
                        Ok(()) => break,
                        Err(err) if attempt == RELOAD_ATTEMPTS => {
                            warn!(target = "watcher", path = %path.display(), error = %format!("{err:#}"), "config reload failed, keeping old config");
                        }
                        Err(_) => thread::sleep(Duration::from_millis(50)),
                    }
                }
            }
            Err(err) => {
                warn!(target = "watcher", error = %err, "watcher event error");
            }
        }
    }
    Ok(())
}
