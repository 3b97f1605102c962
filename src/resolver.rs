use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::domain::{Record, ResolvedTarget, TargetSource};
use crate::error::HarvestError;
use crate::rate_limit::RateLimiter;

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Open-access location lookup by DOI. Implementations return `None` for
/// every kind of miss, including transport failures.
pub trait OaLookup: Send + Sync {
    fn best_pdf_url(&self, doi: &str) -> Option<String>;
}

#[derive(Debug, Clone)]
pub struct UnpaywallClient {
    client: Client,
    base_url: String,
    email: String,
    limiter: Arc<RateLimiter>,
}

impl UnpaywallClient {
    pub fn new(
        base_url: &str,
        email: &str,
        user_agent: &str,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self, HarvestError> {
        let client = Client::builder()
            .timeout(LOOKUP_TIMEOUT)
            .user_agent(user_agent)
            .build()
            .map_err(|err| HarvestError::MetadataHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            email: email.to_string(),
            limiter,
        })
    }

    fn fetch(&self, doi: &str) -> Result<Option<String>, HarvestError> {
        self.limiter.acquire();
        let url = format!("{}/v2/{}", self.base_url, doi);
        let response = self
            .client
            .get(&url)
            .query(&[("email", self.email.as_str())])
            .send()
            .map_err(|err| HarvestError::MetadataHttp(err.to_string()))?;
        let status = response.status();
        if status.as_u16() != 200 {
            debug!(doi, status = status.as_u16(), "no metadata record");
            return Ok(None);
        }
        let payload: UnpaywallResponse = response
            .json()
            .map_err(|err| HarvestError::MetadataHttp(err.to_string()))?;
        Ok(payload.best_pdf_url())
    }
}

impl OaLookup for UnpaywallClient {
    fn best_pdf_url(&self, doi: &str) -> Option<String> {
        match self.fetch(doi) {
            Ok(url) => url,
            Err(err) => {
                warn!(doi, error = %err, "metadata lookup failed");
                None
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct UnpaywallResponse {
    #[serde(default)]
    best_oa_location: Option<OaLocation>,
}

#[derive(Debug, Default, Deserialize)]
struct OaLocation {
    #[serde(default)]
    url_for_pdf: Option<String>,
}

impl UnpaywallResponse {
    pub fn best_pdf_url(&self) -> Option<String> {
        self.best_oa_location
            .as_ref()
            .and_then(|location| location.url_for_pdf.as_deref())
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string)
    }
}

/// Picks one download URL per record: metadata service, then the input URL,
/// then the DOI resolver.
#[derive(Debug, Clone)]
pub struct Resolver<L: OaLookup> {
    lookup: L,
}

impl<L: OaLookup> Resolver<L> {
    pub fn new(lookup: L) -> Self {
        Self { lookup }
    }

    pub fn resolve(&self, record: &Record) -> Option<ResolvedTarget> {
        let target = |url: String, source: TargetSource| ResolvedTarget {
            id: record.id.clone(),
            url,
            source,
        };

        if let Some(doi) = record.lookup_doi() {
            if let Some(url) = self.lookup.best_pdf_url(&doi) {
                return Some(target(url, TargetSource::MetadataService));
            }
        }
        if let Some(url) = &record.url {
            return Some(target(url.clone(), TargetSource::InputUrl));
        }
        record
            .doi_resolver_url()
            .map(|url| target(url, TargetSource::ConstructedFromDoi))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    use super::*;

    struct MapLookup(HashMap<String, String>);

    impl OaLookup for MapLookup {
        fn best_pdf_url(&self, doi: &str) -> Option<String> {
            self.0.get(doi).cloned()
        }
    }

    fn resolver() -> Resolver<MapLookup> {
        let mut map = HashMap::new();
        map.insert("10.1/x".to_string(), "https://pub.example/a1.pdf".to_string());
        Resolver::new(MapLookup(map))
    }

    #[test]
    fn metadata_service_wins() {
        let record = Record::new(
            "A1",
            Some("10.1/x".into()),
            Some("https://other.example/x".into()),
            0,
        );
        let target = resolver().resolve(&record).unwrap();
        assert_eq!(target.url, "https://pub.example/a1.pdf");
        assert_eq!(target.source, TargetSource::MetadataService);
    }

    #[test]
    fn input_url_without_doi() {
        let record = Record::new("A2", None, Some("https://pub.example/a2.pdf".into()), 1);
        let target = resolver().resolve(&record).unwrap();
        assert_eq!(target.url, "https://pub.example/a2.pdf");
        assert_eq!(target.source, TargetSource::InputUrl);
    }

    #[test]
    fn constructs_doi_url_on_miss() {
        let record = Record::new("A3", Some("10.1/z".into()), None, 2);
        let target = resolver().resolve(&record).unwrap();
        assert_eq!(target.url, "https://doi.org/10.1/z");
        assert_eq!(target.source, TargetSource::ConstructedFromDoi);
    }

    #[test]
    fn constructs_doi_url_for_loose_doi_cells() {
        for (cell, expected) in [
            ("10.1234", "https://doi.org/10.1234"),
            ("10.12/", "https://doi.org/10.12/"),
            ("10.1/a b", "https://doi.org/10.1/a b"),
            (" doi:10.5555/q ", "https://doi.org/10.5555/q"),
        ] {
            let record = Record::new("A4", Some(cell.into()), None, 2);
            let target = resolver().resolve(&record).unwrap();
            assert_eq!(target.url, expected, "cell {cell:?}");
            assert_eq!(target.source, TargetSource::ConstructedFromDoi);
        }
    }

    #[test]
    fn nothing_usable() {
        let record = Record::new("A5", Some("pmid:1234".into()), None, 3);
        assert_eq!(resolver().resolve(&record), None);
        let record = Record::new("A6", None, None, 4);
        assert_eq!(resolver().resolve(&record), None);
    }

    #[test]
    fn parse_best_location() {
        let body = r#"{"doi":"10.1/x","best_oa_location":{"url_for_pdf":"https://pub.example/a1.pdf","version":"publishedVersion"}}"#;
        let parsed: UnpaywallResponse = serde_json::from_str(body).unwrap();
        assert_eq!(
            parsed.best_pdf_url().as_deref(),
            Some("https://pub.example/a1.pdf")
        );
    }

    #[test]
    fn parse_missing_or_empty_location() {
        let parsed: UnpaywallResponse =
            serde_json::from_str(r#"{"best_oa_location":null}"#).unwrap();
        assert_eq!(parsed.best_pdf_url(), None);
        let parsed: UnpaywallResponse =
            serde_json::from_str(r#"{"best_oa_location":{"url_for_pdf":"  "}}"#).unwrap();
        assert_eq!(parsed.best_pdf_url(), None);
    }

    /// Answers a single request with the given status line and JSON body.
    fn serve_once(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut request = [0u8; 4096];
                let _ = stream.read(&mut request);
                let response = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: application/json\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{addr}")
    }

    fn client(base_url: &str) -> UnpaywallClient {
        UnpaywallClient::new(
            base_url,
            "research@example.org",
            "paper-fetch-test",
            Arc::new(RateLimiter::disabled()),
        )
        .unwrap()
    }

    #[test]
    fn served_location_is_returned() {
        let base = serve_once(
            "200 OK",
            r#"{"best_oa_location":{"url_for_pdf":"https://pub.example/a1.pdf"}}"#,
        );
        assert_eq!(
            client(&base).best_pdf_url("10.1/x").as_deref(),
            Some("https://pub.example/a1.pdf")
        );
    }

    #[test]
    fn not_found_status_is_a_miss() {
        let base = serve_once("404 Not Found", r#"{"error":true,"message":"not found"}"#);
        assert_eq!(client(&base).best_pdf_url("10.1/missing"), None);
    }

    #[test]
    fn malformed_body_is_a_miss() {
        let base = serve_once("200 OK", r#"{"best_oa_location": [unterminated"#);
        assert_eq!(client(&base).best_pdf_url("10.1/x"), None);
    }

    #[test]
    fn unreachable_service_is_a_miss() {
        let client = UnpaywallClient::new(
            "http://127.0.0.1:9",
            "research@example.org",
            "paper-fetch-test",
            Arc::new(RateLimiter::disabled()),
        )
        .unwrap();
        assert_eq!(client.best_pdf_url("10.1/x"), None);
    }
}
