//! Fetches uploaded documents from object storage and pulls plain text out
//! of them.

use anyhow::bail;
use cm_core::config as env_config;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::redirect;
use reqwest::Url;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOC: &str = "application/msword";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_TEXT: &str = "text/plain";

pub const SUPPORTED_UPLOAD_TYPES: &[&str] = &[MIME_PDF, MIME_DOC, MIME_DOCX, MIME_TEXT];

/// Uploads are capped at 10 MiB; anything larger at fetch time is refused.
pub const MAX_DOCUMENT_BYTES: usize = 10 * 1024 * 1024;
const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("document fetch failed with status {0}")]
    FetchStatus(u16),
    #[error("document exceeds {MAX_DOCUMENT_BYTES} bytes")]
    TooLarge,
    #[error("text extraction is not supported for {0}")]
    Unsupported(String),
    #[error("document is not valid UTF-8 text")]
    InvalidText,
    #[error("pdf could not be read: {0}")]
    Pdf(String),
    #[error("document contains no extractable text")]
    Empty,
    #[error("storage url is outside the allowed storage origins: {0}")]
    DisallowedOrigin(String),
    #[error("storage host {0} does not resolve to a public address")]
    NonPublicAddress(String),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// Where uploaded documents may be fetched from. Only urls on one of the
/// configured origins are accepted, and unless private hosts are allowed the
/// host has to be a public address, both as written and after resolution.
#[derive(Debug, Clone)]
pub struct StoragePolicy {
    origins: Vec<String>,
    allow_private_hosts: bool,
}

impl StoragePolicy {
    pub fn new<S: AsRef<str>>(origins: &[S]) -> Result<Self, ExtractError> {
        let origins = origins
            .iter()
            .map(|origin| {
                let origin = origin.as_ref().trim();
                parse_http_url(origin)
                    .map(|url| url.origin().ascii_serialization())
                    .ok_or_else(|| ExtractError::DisallowedOrigin(origin.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            origins,
            allow_private_hosts: false,
        })
    }

    /// Reads `STORAGE_ALLOWED_ORIGINS` and `STORAGE_ALLOW_PRIVATE_HOSTS`.
    pub fn from_env() -> anyhow::Result<Self> {
        let origins = env_config::list_env("STORAGE_ALLOWED_ORIGINS");
        if origins.is_empty() {
            bail!("STORAGE_ALLOWED_ORIGINS must name at least one storage origin");
        }
        Ok(Self::new(&origins)?
            .allow_private_hosts(env_config::bool_env("STORAGE_ALLOW_PRIVATE_HOSTS", false)))
    }

    pub fn allow_private_hosts(mut self, allow: bool) -> Self {
        self.allow_private_hosts = allow;
        self
    }

    pub fn check(&self, raw: &str) -> Result<Url, ExtractError> {
        let url = parse_http_url(raw).ok_or_else(|| ExtractError::DisallowedOrigin(raw.to_string()))?;
        if !self.origins.contains(&url.origin().ascii_serialization()) {
            return Err(ExtractError::DisallowedOrigin(raw.to_string()));
        }
        if !self.allow_private_hosts {
            let host = url.host_str().unwrap_or_default();
            let literal = host.trim_start_matches('[').trim_end_matches(']');
            if let Ok(ip) = literal.parse::<IpAddr>() {
                if !is_public_ip(ip) {
                    return Err(ExtractError::NonPublicAddress(host.to_string()));
                }
            }
        }
        Ok(url)
    }
}

fn parse_http_url(raw: &str) -> Option<Url> {
    Url::parse(raw)
        .ok()
        .filter(|url| matches!(url.scheme(), "http" | "https") && url.host_str().is_some())
}

pub fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_multicast()
                || v4.is_documentation()
                || a == 0
                // carrier-grade NAT, 100.64.0.0/10
                || (a == 100 && (b & 0xc0) == 64))
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_public_ip(IpAddr::V4(mapped));
            }
            let first = v6.segments()[0];
            !(v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                // unique local fc00::/7 and link local fe80::/10
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80)
        }
    }
}

/// Drops non-public addresses at connect time so a storage hostname cannot
/// be pointed at the internal network after the url was accepted.
struct PublicAddressResolver;

impl Resolve for PublicAddressResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(resolve_public(name.as_str().to_string()))
    }
}

async fn resolve_public(host: String) -> Result<Addrs, Box<dyn std::error::Error + Send + Sync>> {
    let public: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0))
        .await?
        .filter(|addr| is_public_ip(addr.ip()))
        .collect();
    if public.is_empty() {
        return Err(Box::new(ExtractError::NonPublicAddress(host)));
    }
    Ok(Box::new(public.into_iter()))
}

#[derive(Clone)]
pub struct DocumentFetcher {
    http: reqwest::Client,
    policy: StoragePolicy,
}

impl DocumentFetcher {
    pub fn new(policy: StoragePolicy) -> Result<Self, ExtractError> {
        let mut builder = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .redirect(redirect::Policy::none());
        if !policy.allow_private_hosts {
            builder = builder.dns_resolver(Arc::new(PublicAddressResolver));
        }
        Ok(Self {
            http: builder.build()?,
            policy,
        })
    }

    /// Redirects are not followed; a 3xx surfaces as [`ExtractError::FetchStatus`].
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, ExtractError> {
        let url = self.policy.check(url)?;
        let mut response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(ExtractError::FetchStatus(response.status().as_u16()));
        }
        if response
            .content_length()
            .map(|length| length as usize > MAX_DOCUMENT_BYTES)
            .unwrap_or(false)
        {
            return Err(ExtractError::TooLarge);
        }
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if bytes.len() + chunk.len() > MAX_DOCUMENT_BYTES {
                return Err(ExtractError::TooLarge);
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok(bytes)
    }
}

fn base_mime(mime_type: &str) -> String {
    mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

pub fn extract_text(bytes: &[u8], mime_type: &str) -> Result<String, ExtractError> {
    let text = match base_mime(mime_type).as_str() {
        MIME_TEXT => String::from_utf8(bytes.to_vec()).map_err(|_| ExtractError::InvalidText)?,
        MIME_PDF => extract_pdf_text(bytes)?,
        other => return Err(ExtractError::Unsupported(other.to_string())),
    };
    let text = text.trim().to_string();
    if text.is_empty() {
        return Err(ExtractError::Empty);
    }
    Ok(text)
}

fn extract_pdf_text(bytes: &[u8]) -> Result<String, ExtractError> {
    let document =
        lopdf::Document::load_mem(bytes).map_err(|err| ExtractError::Pdf(err.to_string()))?;
    let pages: Vec<u32> = document.get_pages().keys().copied().collect();
    if pages.is_empty() {
        return Err(ExtractError::Empty);
    }
    document
        .extract_text(&pages)
        .map_err(|err| ExtractError::Pdf(err.to_string()))
}

/// Cuts on a character boundary so multi-byte Arabic text stays valid.
pub fn truncate_chars(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((index, _)) => value[..index].to_string(),
        None => value.to_string(),
    }
}
