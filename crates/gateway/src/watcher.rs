//! Change notifications for the store file, using notify-debouncer-full.
//!
//! `hublink pair` and `hublink auth logout` write the store from their own
//! processes. The server follows the file so those writes reach the webhook
//! registrar and the drivers.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use {
    anyhow::{Context, Result},
    notify_debouncer_full::{
        DebounceEventResult, Debouncer, RecommendedCache, new_debouncer,
        notify::{EventKind, RecommendedWatcher, RecursiveMode},
    },
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
};

/// Watches the directory holding the store file. Writes replace the file by
/// rename, so the directory is watched rather than the file itself.
pub struct StoreWatcher {
    _debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
}

impl StoreWatcher {
    /// Start watching `path`. The receiver yields once per debounced batch of
    /// events touching the file.
    pub fn start(path: &Path, debounce: Duration) -> Result<(Self, mpsc::UnboundedReceiver<()>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating store directory {}", dir.display()))?;
        let file_name = path.file_name().map(|name| name.to_os_string());

        let mut debouncer = new_debouncer(debounce, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    let touched = events.iter().any(|event| {
                        !matches!(event.kind, EventKind::Access(_))
                            && event
                                .paths
                                .iter()
                                .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name)
                    });
                    if touched {
                        debug!("store file changed");
                        let _ = tx.send(());
                    }
                },
                Err(errors) => {
                    for e in errors {
                        warn!(error = %e, "store watcher error");
                    }
                },
            }
        })?;
        debouncer.watch(&dir, RecursiveMode::NonRecursive)?;
        info!(path = %path.display(), "watching store file");

        Ok((Self { _debouncer: debouncer }, rx))
    }
}
