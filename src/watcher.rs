//! Package events - file system watcher over the app directory
//!
//! Watches the app directory and turns manifest changes into install,
//! update and uninstall events for discovery.

use notify_debouncer_mini::{new_debouncer, notify::RecursiveMode, DebouncedEvent};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::apps::{PackageEvent, PackageWatch, MANIFEST_FILE};

const DEBOUNCE: Duration = Duration::from_millis(500);

/// File watcher that reports package events
pub struct AppWatcher {
    apps_dir: PathBuf,
    events: broadcast::Sender<PackageEvent>,
}

type DebounceResult = Result<Vec<DebouncedEvent>, notify_debouncer_mini::notify::Error>;

impl AppWatcher {
    pub fn new(apps_dir: PathBuf, events: broadcast::Sender<PackageEvent>) -> Self {
        Self { apps_dir, events }
    }

    /// Start watching. Dropping the returned handle stops the watcher and
    /// ends the event thread.
    pub fn start(self) -> anyhow::Result<PackageWatch> {
        let (tx, rx) = std::sync::mpsc::channel();

        let mut debouncer = new_debouncer(DEBOUNCE, tx)?;
        debouncer
            .watcher()
            .watch(&self.apps_dir, RecursiveMode::Recursive)?;

        info!(dir = %self.apps_dir.display(), "watching app directory for package changes");

        let apps_dir = self.apps_dir;
        let events = self.events;
        std::thread::Builder::new()
            .name("flint-app-watcher".to_string())
            .spawn(move || Self::event_loop(rx, &apps_dir, &events))?;

        Ok(PackageWatch::new(debouncer))
    }

    fn event_loop(
        rx: std::sync::mpsc::Receiver<DebounceResult>,
        apps_dir: &Path,
        events: &broadcast::Sender<PackageEvent>,
    ) {
        // Ends when the debouncer (and with it the sender) is dropped.
        while let Ok(batch) = rx.recv() {
            match batch {
                Ok(batch) => {
                    for event in batch {
                        if let Some(package_event) = Self::process_event(&event, apps_dir) {
                            debug!(?package_event, "package event");
                            let _ = events.send(package_event);
                        }
                    }
                }
                Err(e) => {
                    let _ = events.send(PackageEvent::Error(e.to_string()));
                }
            }
        }
        debug!("app watcher stopped");
    }

    /// Map one file system event to a package event.
    ///
    /// The package is named by the first path component below the app
    /// directory; the manifest inside it carries the real package id, but the
    /// registrar rescans everything anyway so the directory name suffices.
    pub(crate) fn process_event(event: &DebouncedEvent, apps_dir: &Path) -> Option<PackageEvent> {
        let path = &event.path;
        let rel_path = path.strip_prefix(apps_dir).ok()?;
        let app_name = rel_path.components().next()?.as_os_str().to_str()?.to_string();

        if app_name.starts_with('.') || app_name.starts_with('_') {
            return None;
        }

        let app_dir = apps_dir.join(&app_name);
        if !app_dir.exists() {
            return Some(PackageEvent::Removed(app_name));
        }

        let file_name = path.file_name()?.to_str()?;
        if file_name == MANIFEST_FILE {
            Some(PackageEvent::Changed(app_name))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify_debouncer_mini::DebouncedEventKind;

    fn event(path: PathBuf) -> DebouncedEvent {
        DebouncedEvent {
            path,
            kind: DebouncedEventKind::Any,
        }
    }

    #[test]
    fn test_process_event_filters_hidden() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".hidden")).unwrap();

        let hidden = event(dir.path().join(".hidden").join(MANIFEST_FILE));
        assert!(AppWatcher::process_event(&hidden, dir.path()).is_none());

        let temp = event(dir.path().join("_temp").join(MANIFEST_FILE));
        assert!(AppWatcher::process_event(&temp, dir.path()).is_none());
    }

    #[test]
    fn test_process_event_manifest_change() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("music")).unwrap();

        let changed = event(dir.path().join("music").join(MANIFEST_FILE));
        assert_eq!(
            AppWatcher::process_event(&changed, dir.path()),
            Some(PackageEvent::Changed("music".to_string()))
        );

        // Provider scripts changing is not a package event
        let script = event(dir.path().join("music").join("provider.py"));
        assert!(AppWatcher::process_event(&script, dir.path()).is_none());
    }

    #[test]
    fn test_process_event_removed_dir() {
        let dir = tempfile::tempdir().unwrap();
        let gone = event(dir.path().join("gone").join(MANIFEST_FILE));
        assert_eq!(
            AppWatcher::process_event(&gone, dir.path()),
            Some(PackageEvent::Removed("gone".to_string()))
        );
    }

    #[test]
    fn test_process_event_outside_dir() {
        let dir = tempfile::tempdir().unwrap();
        let outside = event(PathBuf::from("/elsewhere/app.toml"));
        assert!(AppWatcher::process_event(&outside, dir.path()).is_none());
    }
}
