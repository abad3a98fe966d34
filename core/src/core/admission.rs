//! Admission filter: decides whether a captured request is worth testing.
//!
//! Every predicate is a pure function of a [`FilterConfig`] snapshot and the
//! request. Snapshots are published whole through [`FilterHandle`]; readers
//! never observe a half-updated configuration.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use reqwest::Method;
use serde::{Deserialize, Serialize};

use crate::core::mutator::{
    extract_form_parameters, extract_json_parameters, extract_query_parameters,
    extract_xml_parameters, Parameter,
};
use crate::http::HttpRequest;

const DEFAULT_ILLEGAL_EXTENSIONS: &[&str] = &[
    "js", "css", "png", "jpg", "jpeg", "gif", "ico", "svg", "bmp", "webp", "woff", "woff2",
    "ttf", "eot", "otf", "mp3", "mp4", "avi", "webm", "map",
];

/// Digit-only names or values at least this long are cache busters.
const TIMESTAMP_MIN_DIGITS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilterConfig {
    pub whitelist_domains: Vec<String>,
    pub blacklist_domains: Vec<String>,
    pub blacklist_paths: Vec<String>,
    pub blacklist_params: Vec<String>,
    pub illegal_extensions: Vec<String>,
    /// Cap for manually submitted requests, in bytes.
    pub max_request_bytes: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            whitelist_domains: Vec::new(),
            blacklist_domains: Vec::new(),
            blacklist_paths: Vec::new(),
            blacklist_params: Vec::new(),
            illegal_extensions: DEFAULT_ILLEGAL_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            max_request_bytes: 1024 * 1024,
        }
    }
}

fn clean_entry(raw: &str) -> String {
    raw.replace(['\r', '\n'], "").trim().to_string()
}

impl FilterConfig {
    /// Canonical form: trimmed, lowercased where matching is case-insensitive,
    /// empty entries dropped.
    pub fn normalized(mut self) -> Self {
        fn domains(list: Vec<String>) -> Vec<String> {
            list.iter()
                .map(|d| clean_entry(d).to_ascii_lowercase())
                .map(|d| d.trim_start_matches("*.").trim_start_matches('.').to_string())
                .filter(|d| !d.is_empty())
                .collect()
        }
        self.whitelist_domains = domains(self.whitelist_domains);
        self.blacklist_domains = domains(self.blacklist_domains);
        self.blacklist_paths = self
            .blacklist_paths
            .iter()
            .map(|p| clean_entry(p))
            .filter(|p| !p.is_empty())
            .collect();
        self.blacklist_params = self
            .blacklist_params
            .iter()
            .map(|p| clean_entry(p).to_ascii_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        self.illegal_extensions = self
            .illegal_extensions
            .iter()
            .map(|e| clean_entry(e).trim_start_matches('.').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        self
    }
}

/// Publishes configuration snapshots. Updates replace the whole snapshot.
#[derive(Debug)]
pub struct FilterHandle {
    current: RwLock<Arc<FilterConfig>>,
}

impl FilterHandle {
    pub fn new(config: FilterConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config.normalized())),
        }
    }

    pub fn snapshot(&self) -> Arc<FilterConfig> {
        Arc::clone(&self.current.read())
    }

    pub fn publish(&self, config: FilterConfig) {
        *self.current.write() = Arc::new(config.normalized());
    }
}

impl Default for FilterHandle {
    fn default() -> Self {
        Self::new(FilterConfig::default())
    }
}

/// Why a request was not admitted. Expected outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    NotWhitelisted,
    BlacklistedDomain,
    UnsupportedMethod(String),
    IllegalExtension(String),
    BlacklistedPath,
    NoUsefulParameters,
    EmptyBody,
    TooLarge(usize),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::NotWhitelisted => write!(f, "host not in whitelist"),
            Rejection::BlacklistedDomain => write!(f, "host is blacklisted"),
            Rejection::UnsupportedMethod(m) => write!(f, "method {} is not tested", m),
            Rejection::IllegalExtension(e) => write!(f, "static extension .{}", e),
            Rejection::BlacklistedPath => write!(f, "path is blacklisted"),
            Rejection::NoUsefulParameters => write!(f, "no testable parameters"),
            Rejection::EmptyBody => write!(f, "empty JSON body"),
            Rejection::TooLarge(n) => write!(f, "request is {} bytes", n),
        }
    }
}

/// `host == pattern` or `host` ends with `"." + pattern`.
pub fn domain_matches(host: &str, pattern: &str) -> bool {
    let host = host.to_ascii_lowercase();
    let pattern = pattern.to_ascii_lowercase();
    host == pattern
        || (host.len() > pattern.len()
            && host.ends_with(&pattern)
            && host.as_bytes()[host.len() - pattern.len() - 1] == b'.')
}

pub fn check_whitelist(cfg: &FilterConfig, host: &str) -> bool {
    cfg.whitelist_domains.is_empty()
        || cfg.whitelist_domains.iter().any(|p| domain_matches(host, p))
}

pub fn check_blacklist(cfg: &FilterConfig, host: &str) -> bool {
    !cfg.blacklist_domains.iter().any(|p| domain_matches(host, p))
}

pub fn check_method(method: &Method) -> bool {
    *method == Method::GET || *method == Method::POST || *method == Method::PUT
}

/// Lowercased extension of the last path segment, if any.
pub fn file_extension(path: &str) -> Option<String> {
    let segment = path.rsplit('/').next().unwrap_or("");
    let (stem, ext) = segment.rsplit_once('.')?;
    if stem.is_empty() && ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

pub fn check_extension(cfg: &FilterConfig, path: &str) -> Result<(), Rejection> {
    match file_extension(path) {
        Some(ext) if cfg.illegal_extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext)) => {
            Err(Rejection::IllegalExtension(ext))
        }
        _ => Ok(()),
    }
}

pub fn check_path(cfg: &FilterConfig, path: &str) -> bool {
    let path = path.split('?').next().unwrap_or("");
    !cfg
        .blacklist_paths
        .iter()
        .any(|entry| clean_entry(entry) == path)
}

fn is_long_digits(s: &str) -> bool {
    s.len() >= TIMESTAMP_MIN_DIGITS && s.bytes().all(|b| b.is_ascii_digit())
}

fn is_blacklisted_param(cfg: &FilterConfig, param: &Parameter) -> bool {
    let full = param.name.to_ascii_lowercase();
    let leaf = full.rsplit('.').next().unwrap_or(&full);
    let leaf = leaf.split('[').next().unwrap_or(leaf);
    cfg.blacklist_params.iter().any(|b| *b == full || b == leaf)
}

fn has_useful_param(cfg: &FilterConfig, params: &[Parameter]) -> bool {
    params.iter().any(|p| !is_blacklisted_param(cfg, p))
}

pub fn check_get_params(cfg: &FilterConfig, params: &[Parameter]) -> bool {
    if let [only] = params {
        if only.name == only.value || is_long_digits(&only.name) || is_long_digits(&only.value) {
            return false;
        }
    }
    has_useful_param(cfg, params)
}

pub fn check_body_params(cfg: &FilterConfig, req: &HttpRequest) -> Result<(), Rejection> {
    let stripped: String = req.body.chars().filter(|c| !c.is_whitespace()).collect();
    if stripped == "{}" || stripped == "[]" {
        return Err(Rejection::EmptyBody);
    }
    let useful = has_useful_param(cfg, &extract_form_parameters(req))
        || has_useful_param(cfg, &extract_json_parameters(req))
        || has_useful_param(cfg, &extract_xml_parameters(req));
    if useful {
        Ok(())
    } else {
        Err(Rejection::NoUsefulParameters)
    }
}

/// Runs the ordered admission chain for proxied traffic.
pub fn admit(cfg: &FilterConfig, req: &HttpRequest) -> Result<(), Rejection> {
    let host = req.host();
    if !check_whitelist(cfg, host) {
        return Err(Rejection::NotWhitelisted);
    }
    if !check_blacklist(cfg, host) {
        return Err(Rejection::BlacklistedDomain);
    }
    if !check_method(&req.method) {
        return Err(Rejection::UnsupportedMethod(req.method.to_string()));
    }
    check_extension(cfg, req.path())?;
    if !check_path(cfg, req.path()) {
        return Err(Rejection::BlacklistedPath);
    }
    if req.method == Method::GET {
        if !check_get_params(cfg, &extract_query_parameters(req)) {
            return Err(Rejection::NoUsefulParameters);
        }
    } else {
        check_body_params(cfg, req)?;
    }
    Ok(())
}

/// Admission for manually submitted requests: the regular chain plus the size cap.
pub fn admit_manual(cfg: &FilterConfig, req: &HttpRequest) -> Result<(), Rejection> {
    admit(cfg, req)?;
    let size = req.byte_size();
    if size > cfg.max_request_bytes {
        return Err(Rejection::TooLarge(size));
    }
    Ok(())
}
