use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use tracing::{debug, warn};
use url::Url;

use crate::error::HarvestError;
use crate::landing::extract_pdf_link;

const TRANSFER_TIMEOUT: Duration = Duration::from_secs(120);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const CHUNK_SIZE: usize = 64 * 1024;
const MAX_LANDING_BYTES: u64 = 4 * 1024 * 1024;
const IN_PROGRESS_SUFFIX: &str = "crdownload";

/// A handle that can be pointed at a URL and drops whatever it downloads
/// into its download directory. Completion is not reported; callers watch
/// the directory.
pub trait DownloadSession: Send {
    fn navigate(&mut self, url: &str) -> Result<(), HarvestError>;

    /// Cheap status check; `false` means the session must be replaced.
    fn is_alive(&mut self) -> bool;

    /// Abandons any in-flight transfer.
    fn cancel(&mut self);

    fn shutdown(&mut self);
}

pub trait SessionFactory: Send + Sync {
    type Session: DownloadSession;

    fn launch(&self, download_dir: &Path) -> Result<Self::Session, HarvestError>;
}

#[derive(Debug, Clone)]
pub struct HttpSessionFactory {
    client: Client,
}

impl HttpSessionFactory {
    pub fn new(user_agent: &str) -> Result<Self, HarvestError> {
        let client = Client::builder()
            .timeout(TRANSFER_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(user_agent)
            .build()
            .map_err(|err| HarvestError::Session(err.to_string()))?;
        Ok(Self { client })
    }
}

impl SessionFactory for HttpSessionFactory {
    type Session = HttpSession;

    fn launch(&self, download_dir: &Path) -> Result<HttpSession, HarvestError> {
        if !download_dir.is_dir() {
            return Err(HarvestError::Session(format!(
                "download directory {} does not exist",
                download_dir.display()
            )));
        }
        Ok(HttpSession {
            client: self.client.clone(),
            download_dir: download_dir.to_path_buf(),
            transfer: None,
            closed: false,
            crashed: false,
        })
    }
}

struct Transfer {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Background-thread HTTP downloader that mimics a browser download: bytes
/// go to `<name>.crdownload`, renamed to `<name>` once complete.
pub struct HttpSession {
    client: Client,
    download_dir: PathBuf,
    transfer: Option<Transfer>,
    closed: bool,
    crashed: bool,
}

impl HttpSession {
    /// Flags the running transfer and detaches it. The thread notices the
    /// flag at its next chunk and removes its partial file; blocking here
    /// would stall the worker for up to the transfer timeout.
    fn stop_transfer(&mut self) {
        if let Some(transfer) = self.transfer.take() {
            transfer.cancel.store(true, Ordering::SeqCst);
            if transfer.handle.is_finished() && transfer.handle.join().is_err() {
                self.crashed = true;
            }
        }
    }
}

impl DownloadSession for HttpSession {
    fn navigate(&mut self, url: &str) -> Result<(), HarvestError> {
        if self.closed {
            return Err(HarvestError::Session("session already shut down".to_string()));
        }
        let parsed = Url::parse(url)
            .map_err(|err| HarvestError::InvalidUrl {
                url: url.to_string(),
                message: err.to_string(),
            })?;
        self.stop_transfer();

        let cancel = Arc::new(AtomicBool::new(false));
        let client = self.client.clone();
        let dir = self.download_dir.clone();
        let flag = Arc::clone(&cancel);
        let handle = thread::Builder::new()
            .name("http-transfer".to_string())
            .spawn(move || {
                if let Err(err) = run_transfer(&client, parsed, &dir, &flag) {
                    debug!(error = %err, "transfer ended without a file");
                }
            })
            .map_err(|err| HarvestError::Session(err.to_string()))?;
        self.transfer = Some(Transfer { cancel, handle });
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        if self.closed || self.crashed {
            return false;
        }
        let finished = self
            .transfer
            .as_ref()
            .map(|transfer| transfer.handle.is_finished())
            .unwrap_or(false);
        if finished {
            if let Some(transfer) = self.transfer.take() {
                if transfer.handle.join().is_err() {
                    warn!("transfer thread panicked");
                    self.crashed = true;
                }
            }
        }
        !self.crashed
    }

    fn cancel(&mut self) {
        self.stop_transfer();
    }

    fn shutdown(&mut self) {
        self.stop_transfer();
        self.closed = true;
    }
}

impl Drop for HttpSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_transfer(
    client: &Client,
    url: Url,
    dir: &Path,
    cancel: &AtomicBool,
) -> Result<(), HarvestError> {
    let response = get(client, url.as_str())?;
    if !is_html(&response) {
        return save(response, dir, cancel);
    }

    let page_url = response.url().to_string();
    let mut bytes = Vec::new();
    response
        .take(MAX_LANDING_BYTES)
        .read_to_end(&mut bytes)
        .map_err(|err| HarvestError::DownloadHttp(err.to_string()))?;
    let body = String::from_utf8_lossy(&bytes);
    let Some(link) = extract_pdf_link(&page_url, &body) else {
        debug!(url = %page_url, "landing page has no pdf link");
        return Ok(());
    };
    if cancel.load(Ordering::SeqCst) {
        return Ok(());
    }
    debug!(from = %page_url, to = link.url(), "following landing page link");
    let response = get(client, link.url())?;
    if is_html(&response) {
        debug!(url = link.url(), "landing link did not lead to a file");
        return Ok(());
    }
    save(response, dir, cancel)
}

fn get(client: &Client, url: &str) -> Result<Response, HarvestError> {
    let response = client
        .get(url)
        .send()
        .map_err(|err| HarvestError::DownloadHttp(err.to_string()))?;
    if !response.status().is_success() {
        return Err(HarvestError::DownloadStatus {
            status: response.status().as_u16(),
            url: url.to_string(),
        });
    }
    Ok(response)
}

fn is_html(response: &Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_ascii_lowercase().contains("text/html"))
        .unwrap_or(false)
}

fn save(mut response: Response, dir: &Path, cancel: &AtomicBool) -> Result<(), HarvestError> {
    let name = download_name(&response);
    let final_path = dir.join(&name);
    let partial_path = dir.join(format!("{name}.{IN_PROGRESS_SUFFIX}"));

    let mut file = File::create(&partial_path)
        .map_err(|err| HarvestError::Filesystem(format!("{}: {err}", partial_path.display())))?;
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        if cancel.load(Ordering::SeqCst) {
            drop(file);
            let _ = fs::remove_file(&partial_path);
            return Ok(());
        }
        let read = match response.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) => {
                drop(file);
                let _ = fs::remove_file(&partial_path);
                return Err(HarvestError::DownloadHttp(err.to_string()));
            }
        };
        file.write_all(&buffer[..read])
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    }
    file.sync_all()
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    drop(file);
    if cancel.load(Ordering::SeqCst) {
        let _ = fs::remove_file(&partial_path);
        return Ok(());
    }
    fs::rename(&partial_path, &final_path)
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    Ok(())
}

fn download_name(response: &Response) -> String {
    let from_header = response
        .headers()
        .get(CONTENT_DISPOSITION)
        .and_then(|value| value.to_str().ok())
        .and_then(disposition_filename);
    let from_url = || {
        response
            .url()
            .path_segments()
            .and_then(|segments| segments.last().map(str::to_string))
            .filter(|segment| !segment.is_empty())
    };
    let raw = from_header.or_else(from_url).unwrap_or_else(|| "download.pdf".to_string());
    let cleaned = sanitize_file_name(&raw);
    if cleaned.is_empty() || cleaned.starts_with('.') {
        "download.pdf".to_string()
    } else {
        cleaned
    }
}

pub fn disposition_filename(header: &str) -> Option<String> {
    header.split(';').map(str::trim).find_map(|part| {
        let (key, value) = part.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("filename") {
            return None;
        }
        let value = value.trim().trim_matches('"').trim();
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// Replaces characters that are unsafe in a single path component.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|ch| match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            ch if ch.is_control() => '_',
            ch => ch,
        })
        .collect::<String>()
        .trim()
        .to_string()
}
