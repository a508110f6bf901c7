//! Debounced watcher over the external message root. A change to any message
//! file triggers a sync run; a run already in flight is left alone and the
//! next debounce window picks the change up again.

use notify_debouncer_full::notify::RecursiveMode;
use notify_debouncer_full::{new_debouncer, DebounceEventResult};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::core::error::AppError;
use crate::core::sync::{SyncEngine, SyncStart};

pub struct SourceWatcher {
    stop_tx: mpsc::Sender<()>,
    join_handle: Option<JoinHandle<()>>,
}

fn is_message_file(root: &Path, path: &Path) -> bool {
    if path.strip_prefix(root).is_err() {
        return false;
    }
    path.extension()
        .and_then(|value| value.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

impl SourceWatcher {
    pub(crate) fn spawn(
        message_root: PathBuf,
        debounce: Duration,
        engine: SyncEngine,
    ) -> Result<Self, AppError> {
        if !message_root.is_dir() {
            return Err(AppError::configuration(
                format!("cannot watch missing directory {}", message_root.display()),
                std::io::Error::from(std::io::ErrorKind::NotFound),
            ));
        }

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let join_handle = std::thread::Builder::new()
            .name("trellis-watcher".to_string())
            .spawn(move || {
                let (events_tx, events_rx) = mpsc::channel::<DebounceEventResult>();
                let mut debouncer =
                    match new_debouncer(debounce, Some(Duration::from_millis(500)), events_tx) {
                        Ok(value) => value,
                        Err(error) => {
                            log::error!("Failed to create source watcher: {}", error);
                            return;
                        }
                    };

                if let Err(error) = debouncer.watch(&message_root, RecursiveMode::Recursive) {
                    log::error!(
                        "Failed to watch source '{}': {}",
                        message_root.display(),
                        error
                    );
                    return;
                }

                loop {
                    if stop_rx.try_recv().is_ok() {
                        break;
                    }

                    match events_rx.recv_timeout(Duration::from_millis(500)) {
                        Ok(result) => match result {
                            Ok(events) => {
                                let has_message_change = events.iter().any(|event| {
                                    event
                                        .paths
                                        .iter()
                                        .any(|path| is_message_file(&message_root, path))
                                });
                                if !has_message_change {
                                    continue;
                                }

                                if engine.start() == SyncStart::AlreadyRunning {
                                    log::debug!("Source changed while a sync is running");
                                }
                            }
                            Err(errors) => {
                                for error in errors {
                                    log::warn!("Source watcher event error: {}", error);
                                }
                            }
                        },
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                        Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .map_err(|error| {
                AppError::internal(format!("failed to spawn watcher thread: {error}"))
            })?;

        Ok(Self {
            stop_tx,
            join_handle: Some(join_handle),
        })
    }
}

impl Drop for SourceWatcher {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_json_files_under_the_root_count_as_message_changes() {
        let root = Path::new("/data/opencode/storage/message");
        assert!(is_message_file(root, Path::new("/data/opencode/storage/message/ses_a/m1.json")));
        assert!(is_message_file(root, Path::new("/data/opencode/storage/message/ses_a/M1.JSON")));
        assert!(!is_message_file(root, Path::new("/data/opencode/storage/message/ses_a/notes.txt")));
        assert!(!is_message_file(root, Path::new("/elsewhere/m1.json")));
        assert!(!is_message_file(root, Path::new("/data/opencode/storage/message/ses_a")));
    }
}
