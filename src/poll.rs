//! Bounded directory polling.
//!
//! Download triggers give no completion callback, so completion is observed
//! by watching the scratch directory for a file that is no longer marked as
//! in progress.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

/// Extensions browsers and the HTTP session use while a transfer is running.
pub const PARTIAL_EXTENSIONS: [&str; 3] = ["crdownload", "part", "tmp"];

pub fn is_partial_download(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            PARTIAL_EXTENSIONS
                .iter()
                .any(|partial| ext.eq_ignore_ascii_case(partial))
        })
        .unwrap_or(false)
}

pub fn is_complete_download(path: &Path) -> bool {
    path.is_file() && !is_partial_download(path)
}

/// Polls `dir` every `interval` until a file satisfying `ready` appears or
/// `timeout` elapses. A hit is confirmed after one more interval so the
/// writer has a chance to finish.
pub fn wait_for_file<P>(
    dir: &Path,
    ready: P,
    interval: Duration,
    timeout: Duration,
) -> Option<PathBuf>
where
    P: Fn(&Path) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(found) = first_match(dir, &ready) {
            thread::sleep(interval);
            if ready(&found) {
                return Some(found);
            }
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        thread::sleep(interval.min(deadline - now));
    }
}

fn first_match<P>(dir: &Path, ready: &P) -> Option<PathBuf>
where
    P: Fn(&Path) -> bool,
{
    let entries = fs::read_dir(dir).ok()?;
    let mut candidates = entries
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| ready(path))
        .collect::<Vec<_>>();
    candidates.sort();
    candidates.into_iter().next()
}

/// Removes every entry inside `dir`, keeping `dir` itself.
pub fn purge_dir(dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match result {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

pub fn is_empty_dir(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_millis(10);

    #[test]
    fn partial_markers() {
        assert!(is_partial_download(Path::new("a1.pdf.crdownload")));
        assert!(is_partial_download(Path::new("a1.PART")));
        assert!(is_partial_download(Path::new("x.tmp")));
        assert!(!is_partial_download(Path::new("a1.pdf")));
        assert!(!is_partial_download(Path::new("download")));
    }

    #[test]
    fn finds_existing_file() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("a1.pdf"), b"%PDF").unwrap();
        let found = wait_for_file(temp.path(), is_complete_download, TICK, TICK * 5);
        assert_eq!(found, Some(temp.path().join("a1.pdf")));
    }

    #[test]
    fn ignores_partial_and_times_out() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("a1.pdf.crdownload"), b"%PD").unwrap();
        let start = Instant::now();
        let found = wait_for_file(temp.path(), is_complete_download, TICK, TICK * 5);
        assert_eq!(found, None);
        assert!(start.elapsed() >= TICK * 5);
    }

    #[test]
    fn sees_file_that_appears_later() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().to_path_buf();
        let writer = {
            let dir = dir.clone();
            thread::spawn(move || {
                thread::sleep(TICK * 3);
                fs::write(dir.join("late.pdf.crdownload"), b"%PDF").unwrap();
                fs::rename(dir.join("late.pdf.crdownload"), dir.join("late.pdf")).unwrap();
            })
        };
        let found = wait_for_file(&dir, is_complete_download, TICK, Duration::from_secs(2));
        writer.join().unwrap();
        assert_eq!(found, Some(dir.join("late.pdf")));
    }

    #[test]
    fn purge_keeps_directory() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("stale.pdf"), b"old").unwrap();
        fs::create_dir(temp.path().join("nested")).unwrap();
        purge_dir(temp.path()).unwrap();
        assert!(temp.path().exists());
        assert!(is_empty_dir(temp.path()));
    }
}
