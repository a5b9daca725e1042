use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{error, info, warn};

use crate::config;
use crate::middleware::RuntimeAffinity;

const RELOAD_ATTEMPTS: u32 = 3;

/// Watch `path` and swap in a freshly built table whenever it changes.
pub fn spawn(path: PathBuf, runtime: Arc<ArcSwap<RuntimeAffinity>>) {
    // The watcher lives on its own blocking thread.
    thread::spawn(move || {
        if let Err(err) = run_watcher(&path, runtime) {
            error!(target = "watcher", error = %err, "config watcher exited with error");
        }
    });
}

fn run_watcher(path: &Path, runtime: Arc<ArcSwap<RuntimeAffinity>>) -> notify::Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher: RecommendedWatcher = Watcher::new(tx, Config::default())?;
    watcher.watch(path, RecursiveMode::NonRecursive)?;

    info!(target = "watcher", path = %path.display(), "config watcher started");

    for res in rx {
        match res {
            Ok(_event) => reload(path, &runtime),
            Err(err) => warn!(target = "watcher", error = %err, "watcher event error"),
        }
    }
    Ok(())
}

/// Editors often truncate then write, so a failed parse gets a couple of retries.
fn reload(path: &Path, runtime: &ArcSwap<RuntimeAffinity>) {
    for attempt in 1..=RELOAD_ATTEMPTS {
        match load_runtime(path) {
            Ok(fresh) => {
                let subnets = fresh.table.len();
                runtime.store(Arc::new(fresh));
                info!(target = "watcher", path = %path.display(), subnets, "affinity table reloaded");
                return;
            }
            Err(err) if attempt == RELOAD_ATTEMPTS => {
                let detail = format!("{err:#}");
                warn!(
                    target = "watcher",
                    path = %path.display(),
                    error = %detail,
                    "config reload failed, keeping old table"
                );
            }
            Err(_) => thread::sleep(Duration::from_millis(50)),
        }
    }
}

fn load_runtime(path: &Path) -> anyhow::Result<RuntimeAffinity> {
    let cfg = config::load_config(path)?;
    Ok(RuntimeAffinity::from_config(&cfg)?)
}
