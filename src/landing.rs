//! One-hop PDF link extraction for HTML landing pages.
//!
//! Publisher links and DOI redirects often land on an article page rather than
//! the PDF itself. A browser with PDF auto-download would still end up with
//! the file; this module finds the single link that gets there.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use url::Url;

static META_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<meta\b[^>]*>").unwrap());
static ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)([a-z_:-]+)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))"#).unwrap()
});
static REFRESH_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)^\s*\d*\s*;?\s*url\s*=\s*['"]?([^'"]+)['"]?"#).unwrap());
static PII: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:/|%2[Ff])pii(?:/|%2[Ff])(S[0-9A-Z]+)").unwrap());

const SCIENCEDIRECT_PDF: &str = "https://www.sciencedirect.com/science/article/pii";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LandingLink {
    CitationPdf(String),
    ScienceDirect(String),
    Refresh(String),
}

impl LandingLink {
    pub fn url(&self) -> &str {
        match self {
            LandingLink::CitationPdf(url)
            | LandingLink::ScienceDirect(url)
            | LandingLink::Refresh(url) => url,
        }
    }
}

pub fn extract_pdf_link(page_url: &str, html: &str) -> Option<LandingLink> {
    let metas = META_TAG
        .find_iter(html)
        .map(|tag| attributes(tag.as_str()))
        .collect::<Vec<_>>();

    let citation = metas.iter().find_map(|attrs| {
        let is_citation = attrs
            .get("name")
            .map(|name| name.eq_ignore_ascii_case("citation_pdf_url"))
            .unwrap_or(false);
        is_citation
            .then(|| attrs.get("content").cloned())
            .flatten()
            .filter(|url| !url.trim().is_empty())
    });
    if let Some(url) = citation {
        return Some(LandingLink::CitationPdf(absolute(page_url, url.trim())));
    }

    let refresh = metas.iter().find_map(|attrs| {
        let is_refresh = attrs
            .get("http-equiv")
            .map(|value| value.eq_ignore_ascii_case("refresh"))
            .unwrap_or(false);
        if !is_refresh {
            return None;
        }
        let content = attrs.get("content")?;
        REFRESH_URL
            .captures(content)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_string())
    });

    let pii = sciencedirect_pii(page_url)
        .or_else(|| refresh.as_deref().and_then(sciencedirect_pii));
    if let Some(pii) = pii {
        return Some(LandingLink::ScienceDirect(sciencedirect_pdf_url(&pii)));
    }

    refresh.map(|target| LandingLink::Refresh(absolute(page_url, &target)))
}

pub fn sciencedirect_pii(text: &str) -> Option<String> {
    PII.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn sciencedirect_pdf_url(pii: &str) -> String {
    format!("{SCIENCEDIRECT_PDF}/{pii}/pdfft?isDTMRedir=true&download=true")
}

fn attributes(tag: &str) -> HashMap<String, String> {
    ATTRIBUTE
        .captures_iter(tag)
        .filter_map(|caps| {
            let key = caps.get(1)?.as_str().to_ascii_lowercase();
            let value = caps.get(2).or(caps.get(3)).or(caps.get(4))?.as_str();
            Some((key, decode_entities(value)))
        })
        .collect()
}

fn decode_entities(value: &str) -> String {
    value
        .replace("&amp;", "&")
        .replace("&#x2F;", "/")
        .replace("&#47;", "/")
        .replace("&quot;", "\"")
}

fn absolute(base: &str, target: &str) -> String {
    Url::parse(base)
        .and_then(|base| base.join(target))
        .map(|url| url.to_string())
        .unwrap_or_else(|_| target.to_string())
}
