//! Filesystem watch over the input directories.
//!
//! Files are reported only after they have been quiet for a settle period, so a CSV that is
//! still being written is not read half-way.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::orchestrator::intake::{classify, InputFile};

pub const SETTLE: Duration = Duration::from_millis(750);
const TICK: Duration = Duration::from_millis(250);

fn is_arrival(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Name(_))
            | EventKind::Modify(ModifyKind::Any)
    )
}

/// Tracks paths that changed recently and releases them once they stop changing.
#[derive(Debug, Default)]
pub struct Settler {
    last_seen: HashMap<PathBuf, Instant>,
}

impl Settler {
    pub fn touch(&mut self, path: PathBuf, now: Instant) {
        self.last_seen.insert(path, now);
    }

    /// Paths quiet for at least `settle`, removed from tracking, in name order.
    pub fn settled(&mut self, now: Instant, settle: Duration) -> Vec<PathBuf> {
        let mut ready: Vec<PathBuf> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) >= settle)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &ready {
            self.last_seen.remove(path);
        }
        ready.sort();
        ready
    }
}

/// Holds the OS watcher alive; dropping it stops the watch.
pub struct InputWatcher {
    _watcher: RecommendedWatcher,
    raw: mpsc::Receiver<PathBuf>,
    jd_dir: PathBuf,
    resume_dir: PathBuf,
}

impl InputWatcher {
    pub fn start(jd_dir: &Path, resume_dir: &Path) -> notify::Result<Self> {
        let (tx, raw) = mpsc::channel::<PathBuf>(256);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if is_arrival(&event.kind) => {
                for path in event.paths {
                    // The receiver is gone once the orchestrator shuts down.
                    let _ = tx.blocking_send(path);
                }
            }
            Ok(_) => {}
            Err(e) => error!("Watch error: {e}"),
        })?;

        watcher.watch(jd_dir, RecursiveMode::NonRecursive)?;
        watcher.watch(resume_dir, RecursiveMode::NonRecursive)?;
        info!(
            "Watching {} and {} for new input",
            jd_dir.display(),
            resume_dir.display()
        );

        Ok(Self {
            _watcher: watcher,
            raw,
            jd_dir: jd_dir.to_path_buf(),
            resume_dir: resume_dir.to_path_buf(),
        })
    }

    /// Forwards settled input files to `out` until cancelled.
    pub async fn run(mut self, out: mpsc::Sender<InputFile>, cancel: CancellationToken) {
        let mut settler = Settler::default();
        let mut tick = tokio::time::interval(TICK);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(path) = self.raw.recv() => {
                    debug!("Change detected: {}", path.display());
                    settler.touch(path, Instant::now());
                }
                _ = tick.tick() => {
                    for path in settler.settled(Instant::now(), SETTLE) {
                        if !path.is_file() {
                            continue;
                        }
                        if let Some(input) = classify(&path, &self.jd_dir, &self.resume_dir) {
                            if out.send(input).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
        debug!("Input watcher stopped");
    }
}
