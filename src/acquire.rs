use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};
use url::Url;

use crate::error::HarvestError;
use crate::poll::{is_complete_download, purge_dir, wait_for_file};
use crate::session::{DownloadSession, SessionFactory};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    /// No stable file appeared before the deadline.
    Timeout,
    /// The session could not be launched or rejected the request.
    Session(String),
    /// The scratch directory could not be cleared.
    Scratch(String),
    /// The target is not an absolute URL; no attempt can succeed.
    InvalidUrl(String),
}

impl FetchFailure {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchFailure::Timeout | FetchFailure::Session(_))
    }
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchFailure::Timeout => write!(f, "download timeout"),
            FetchFailure::Session(message) => write!(f, "session error: {message}"),
            FetchFailure::Scratch(message) => write!(f, "scratch directory error: {message}"),
            FetchFailure::InvalidUrl(message) => write!(f, "invalid url: {message}"),
        }
    }
}

/// Fetches one URL at a time into a private scratch directory.
///
/// The acquirer owns at most one live session. Each fetch first probes the
/// session and replaces it when the probe fails, so a crashed session costs
/// at most the record that was in flight.
pub struct Acquirer<'f, F: SessionFactory> {
    factory: &'f F,
    scratch: PathBuf,
    session: Option<F::Session>,
    poll_interval: Duration,
    timeout: Duration,
    launches: usize,
}

impl<'f, F: SessionFactory> Acquirer<'f, F> {
    pub fn new(factory: &'f F, scratch: &Path, poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            factory,
            scratch: scratch.to_path_buf(),
            session: None,
            poll_interval,
            timeout,
            launches: 0,
        }
    }

    pub fn scratch(&self) -> &Path {
        &self.scratch
    }

    /// Number of sessions launched so far, recoveries included.
    pub fn launches(&self) -> usize {
        self.launches
    }

    pub fn fetch(&mut self, url: &str) -> Result<PathBuf, FetchFailure> {
        Url::parse(url).map_err(|err| FetchFailure::InvalidUrl(format!("{url}: {err}")))?;
        purge_dir(&self.scratch).map_err(|err| FetchFailure::Scratch(err.to_string()))?;

        let session = self.live_session()?;
        if let Err(err) = session.navigate(url) {
            warn!(url, error = %err, "navigation failed");
            self.recycle_if_dead();
            return Err(match err {
                HarvestError::InvalidUrl { url, message } => {
                    FetchFailure::InvalidUrl(format!("{url}: {message}"))
                }
                other => FetchFailure::Session(other.to_string()),
            });
        }

        match wait_for_file(
            &self.scratch,
            is_complete_download,
            self.poll_interval,
            self.timeout,
        ) {
            Some(path) => {
                debug!(path = %path.display(), "download complete");
                Ok(path)
            }
            None => {
                if let Some(session) = self.session.as_mut() {
                    session.cancel();
                }
                if let Err(err) = purge_dir(&self.scratch) {
                    warn!(error = %err, "failed to clear scratch after timeout");
                }
                self.recycle_if_dead();
                Err(FetchFailure::Timeout)
            }
        }
    }

    pub fn shutdown(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.shutdown();
        }
    }

    fn live_session(&mut self) -> Result<&mut F::Session, FetchFailure> {
        let alive = self
            .session
            .as_mut()
            .map(|session| session.is_alive())
            .unwrap_or(false);
        if !alive {
            if let Some(mut dead) = self.session.take() {
                info!(scratch = %self.scratch.display(), "restarting download session");
                dead.shutdown();
            }
            let fresh = self
                .factory
                .launch(&self.scratch)
                .map_err(|err| FetchFailure::Session(err.to_string()))?;
            self.launches += 1;
            self.session = Some(fresh);
        }
        self.session
            .as_mut()
            .ok_or_else(|| FetchFailure::Session("no session available".to_string()))
    }

    fn recycle_if_dead(&mut self) {
        let dead = self
            .session
            .as_mut()
            .map(|session| !session.is_alive())
            .unwrap_or(false);
        if dead {
            if let Some(mut session) = self.session.take() {
                warn!(scratch = %self.scratch.display(), "download session died");
                session.shutdown();
            }
        }
    }
}

impl<F: SessionFactory> Drop for Acquirer<'_, F> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use assert_matches::assert_matches;

    use super::*;
    use crate::poll::is_empty_dir;

    const TICK: Duration = Duration::from_millis(10);

    /// Writes `<last url segment>` on navigate, or only a partial file for
    /// URLs containing "stall". URLs containing "crash" kill the session.
    struct ScriptedSession {
        dir: PathBuf,
        alive: bool,
    }

    impl DownloadSession for ScriptedSession {
        fn navigate(&mut self, url: &str) -> Result<(), HarvestError> {
            if url.contains("crash") {
                self.alive = false;
                return Err(HarvestError::Session("renderer crashed".into()));
            }
            let name = url.rsplit('/').next().unwrap_or("file.pdf");
            if url.contains("stall") {
                fs::write(self.dir.join(format!("{name}.crdownload")), b"%PD").unwrap();
            } else {
                fs::write(self.dir.join(name), b"%PDF-1.4").unwrap();
            }
            Ok(())
        }

        fn is_alive(&mut self) -> bool {
            self.alive
        }

        fn cancel(&mut self) {}

        fn shutdown(&mut self) {
            self.alive = false;
        }
    }

    #[derive(Default)]
    struct ScriptedFactory {
        launched: AtomicUsize,
        refuse: AtomicBool,
    }

    impl SessionFactory for ScriptedFactory {
        type Session = ScriptedSession;

        fn launch(&self, dir: &Path) -> Result<ScriptedSession, HarvestError> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(HarvestError::Session("browser unavailable".into()));
            }
            self.launched.fetch_add(1, Ordering::SeqCst);
            Ok(ScriptedSession {
                dir: dir.to_path_buf(),
                alive: true,
            })
        }
    }

    #[test]
    fn fetch_returns_completed_file() {
        let temp = tempfile::tempdir().unwrap();
        let factory = ScriptedFactory::default();
        let mut acquirer = Acquirer::new(&factory, temp.path(), TICK, TICK * 20);
        let path = acquirer.fetch("https://pub.example/a1.pdf").unwrap();
        assert_eq!(path, temp.path().join("a1.pdf"));
    }

    #[test]
    fn stale_files_are_purged_first() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("aaa-stale.pdf"), b"old").unwrap();
        let factory = ScriptedFactory::default();
        let mut acquirer = Acquirer::new(&factory, temp.path(), TICK, TICK * 20);
        let path = acquirer.fetch("https://pub.example/zz.pdf").unwrap();
        assert_eq!(path, temp.path().join("zz.pdf"));
        assert!(!temp.path().join("aaa-stale.pdf").exists());
    }

    #[test]
    fn stalled_download_times_out_and_leaves_scratch_empty() {
        let temp = tempfile::tempdir().unwrap();
        let factory = ScriptedFactory::default();
        let mut acquirer = Acquirer::new(&factory, temp.path(), TICK, TICK * 5);
        let err = acquirer.fetch("https://pub.example/stall.pdf").unwrap_err();
        assert_eq!(err, FetchFailure::Timeout);
        assert_eq!(err.to_string(), "download timeout");
        assert!(is_empty_dir(temp.path()));
    }

    #[test]
    fn crashed_session_is_replaced_before_next_fetch() {
        let temp = tempfile::tempdir().unwrap();
        let factory = ScriptedFactory::default();
        let mut acquirer = Acquirer::new(&factory, temp.path(), TICK, TICK * 20);

        acquirer.fetch("https://pub.example/a1.pdf").unwrap();
        let err = acquirer.fetch("https://pub.example/crash").unwrap_err();
        assert_matches!(err, FetchFailure::Session(_));

        acquirer.fetch("https://pub.example/a2.pdf").unwrap();
        assert_eq!(factory.launched.load(Ordering::SeqCst), 2);
        assert_eq!(acquirer.launches(), 2);
    }

    #[test]
    fn launch_failure_is_a_session_failure() {
        let temp = tempfile::tempdir().unwrap();
        let factory = ScriptedFactory::default();
        factory.refuse.store(true, Ordering::SeqCst);
        let mut acquirer = Acquirer::new(&factory, temp.path(), TICK, TICK * 5);
        let err = acquirer.fetch("https://pub.example/a1.pdf").unwrap_err();
        assert_matches!(err, FetchFailure::Session(_));
        assert!(err.is_retryable());
    }

    #[test]
    fn malformed_url_fails_without_launching() {
        let temp = tempfile::tempdir().unwrap();
        let factory = ScriptedFactory::default();
        let mut acquirer = Acquirer::new(&factory, temp.path(), TICK, TICK * 5);
        let err = acquirer.fetch("pub.example/no-scheme.pdf").unwrap_err();
        assert_matches!(err, FetchFailure::InvalidUrl(_));
        assert!(!err.is_retryable());
        assert_eq!(factory.launched.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn shared_factory_across_acquirers() {
        let factory = Arc::new(ScriptedFactory::default());
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let mut first = Acquirer::new(factory.as_ref(), a.path(), TICK, TICK * 20);
        let mut second = Acquirer::new(factory.as_ref(), b.path(), TICK, TICK * 20);
        first.fetch("https://pub.example/a1.pdf").unwrap();
        second.fetch("https://pub.example/a2.pdf").unwrap();
        assert!(!b.path().join("a1.pdf").exists());
        assert_eq!(factory.launched.load(Ordering::SeqCst), 2);
    }
}
