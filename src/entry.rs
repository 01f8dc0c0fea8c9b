//! Proxy entries: one routing rule per domain (and optional path prefix)

use crate::error::EntryError;
use serde::{Deserialize, Serialize};
use url::Url;

/// Loosely shaped entry record as it arrives from the admin API or the store
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EntrySpec {
    /// Domain, optionally followed by `/path`
    pub domain: String,
    pub path: Option<String>,
    pub target: Option<String>,
    pub redirect_url: Option<String>,
    pub redirect: bool,
    pub cors: bool,
}

/// A validated routing rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "EntrySpec", into = "EntrySpec")]
pub struct ProxyEntry {
    domain: String,
    path: String,
    target: Option<Url>,
    redirect_url: Option<String>,
    redirect: bool,
    cors: bool,
}

impl ProxyEntry {
    /// Entry forwarding `domain` to the backend base URL `target`
    pub fn forward(domain: &str, target: &str) -> Result<Self, EntryError> {
        Self::try_from(EntrySpec {
            domain: domain.to_string(),
            target: Some(target.to_string()),
            ..Default::default()
        })
    }

    /// Entry redirecting every request for `domain` to `url`
    pub fn redirect_to(domain: &str, url: &str) -> Result<Self, EntryError> {
        Self::try_from(EntrySpec {
            domain: domain.to_string(),
            redirect_url: Some(url.to_string()),
            ..Default::default()
        })
    }

    /// Upgrade plaintext requests to HTTPS before forwarding
    pub fn with_https_redirect(mut self, redirect: bool) -> Self {
        self.redirect = redirect;
        self
    }

    pub fn with_cors(mut self, cors: bool) -> Self {
        self.cors = cors;
        self
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Path prefix without leading/trailing slashes; empty covers the whole domain
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn target(&self) -> Option<&Url> {
        self.target.as_ref()
    }

    pub fn redirect_url(&self) -> Option<&str> {
        self.redirect_url.as_deref()
    }

    pub fn redirect(&self) -> bool {
        self.redirect
    }

    pub fn cors(&self) -> bool {
        self.cors
    }

    /// `domain` or `domain/path`, the form operators type
    pub fn host_key(&self) -> String {
        if self.path.is_empty() {
            self.domain.clone()
        } else {
            format!("{}/{}", self.domain, self.path)
        }
    }
}

impl ProxyEntry {
    /// Build from a stored record
    ///
    /// Unlike [`TryFrom`], a record carrying both a target and a redirect URL is
    /// accepted; the redirect takes priority when requests are dispatched.
    pub fn from_record(spec: EntrySpec) -> Result<Self, EntryError> {
        Self::build(spec, false)
    }

    fn build(spec: EntrySpec, exclusive: bool) -> Result<Self, EntryError> {
        let (domain, inline_path) = split_host(&spec.domain);
        if domain.is_empty() {
            return Err(EntryError::MissingDomain);
        }

        let path = normalize_path(spec.path.as_deref().unwrap_or(inline_path))?;

        let target = non_empty(spec.target);
        let redirect_url = non_empty(spec.redirect_url);

        let target = match (target, &redirect_url) {
            (None, None) => return Err(EntryError::MissingTarget),
            (Some(_), Some(_)) if exclusive => return Err(EntryError::AmbiguousTarget(domain)),
            (Some(raw), Some(_)) => parse_target(&raw).ok(),
            (Some(raw), None) => Some(parse_target(&raw)?),
            (None, Some(_)) => None,
        };

        Ok(Self {
            domain,
            path,
            target,
            redirect_url,
            redirect: spec.redirect,
            cors: spec.cors,
        })
    }
}

impl TryFrom<EntrySpec> for ProxyEntry {
    type Error = EntryError;

    /// Validate a new entry: exactly one of target and redirect URL
    fn try_from(spec: EntrySpec) -> Result<Self, Self::Error> {
        Self::build(spec, true)
    }
}

impl From<ProxyEntry> for EntrySpec {
    fn from(entry: ProxyEntry) -> Self {
        Self {
            domain: entry.domain,
            path: (!entry.path.is_empty()).then_some(entry.path),
            target: entry.target.map(String::from),
            redirect_url: entry.redirect_url,
            redirect: entry.redirect,
            cors: entry.cors,
        }
    }
}

/// Split `example.com/api` into (`example.com`, `api`)
pub fn split_host(host: &str) -> (String, &str) {
    let host = host.trim();
    let (domain, path) = host.split_once('/').unwrap_or((host, ""));
    (domain.trim_end_matches('.').to_ascii_lowercase(), path)
}

/// Strip leading/trailing slashes and reject dot segments
pub fn normalize_path(path: &str) -> Result<String, EntryError> {
    let path = path.trim().trim_matches('/');
    if path.split('/').any(|s| (s.is_empty() && !path.is_empty()) || s == "." || s == "..") {
        return Err(EntryError::InvalidPath(path.to_string()));
    }
    Ok(path.to_string())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_target(raw: &str) -> Result<Url, EntryError> {
    let invalid = |reason: &str| EntryError::InvalidTarget {
        url: raw.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(invalid("scheme must be http or https"));
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host"));
    }
    Ok(url)
}
