//! Filesystem watching, wired into engine invalidation.

use std::time::Duration;

use camino::Utf8PathBuf;
use notify::{EventKind, RecursiveMode};
use notify_debouncer_full::new_debouncer;

use crate::error::WatchError;
use crate::scheduler::Engine;

/// Watches `roots` and feeds debounced changes into
/// [`Engine::invalidate`]. After each invalidation batch `on_change` runs
/// with the changed paths, typically to re-issue requests. Blocks the
/// calling thread until the watcher channel closes.
pub fn watch<F>(engine: &Engine, roots: &[Utf8PathBuf], mut on_change: F) -> Result<(), WatchError>
where
    F: FnMut(&Engine, &[Utf8PathBuf]),
{
    let cwd = std::env::current_dir()?;
    let (tx, rx) = std::sync::mpsc::channel();
    let mut debouncer = new_debouncer(Duration::from_millis(250), None, tx)?;

    for root in roots {
        debouncer.watch(root.as_std_path(), RecursiveMode::Recursive)?;
    }

    loop {
        let events = match rx.recv()? {
            Ok(events) => events,
            Err(errors) => {
                for error in errors {
                    tracing::error!("watch error: {error}");
                }
                continue;
            }
        };

        let mut changed: Vec<Utf8PathBuf> = events
            .iter()
            .filter(|event| {
                matches!(
                    event.kind,
                    EventKind::Create(..) | EventKind::Modify(..) | EventKind::Remove(..)
                )
            })
            .flat_map(|event| event.paths.iter())
            .filter_map(|path| {
                let rel = path.strip_prefix(&cwd).unwrap_or(path);
                Utf8PathBuf::from_path_buf(rel.to_path_buf()).ok()
            })
            .collect();
        changed.sort();
        changed.dedup();

        if changed.is_empty() {
            continue;
        }

        let evicted = engine.invalidate(&changed);
        tracing::debug!(?changed, evicted, "filesystem change");
        on_change(engine, &changed);
    }
}
