use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;

use crate::core::StrategyTag;
use crate::http::{Exchange, HttpRequest, HttpResponse};

pub const DEFAULT_INDEX_CAPACITY: usize = 10_000;
pub const DEFAULT_EXCHANGE_CACHE: usize = 512;
pub const PREVIEW_CHARS: usize = 500;

/// Small facts about the exchange, copied when the finding is created so they
/// outlive the exchange itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExchangeMeta {
    pub url: String,
    pub method: String,
    pub preview: String,
}

impl ExchangeMeta {
    pub fn capture(request: &HttpRequest, response: &HttpResponse) -> Self {
        Self {
            url: request.url.to_string(),
            method: request.method.to_string(),
            preview: response.body.chars().take(PREVIEW_CHARS).collect(),
        }
    }
}

/// A confirmed divergence from the baseline. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub signature: String,
    pub parameter: String,
    pub param_index: usize,
    pub payload: String,
    pub strategy: StrategyTag,
    pub confidence: f64,
    /// Matched error signature, delay or similarity note.
    pub evidence: Option<String>,
    pub response_len: usize,
    pub status_code: u16,
    pub elapsed_ms: u128,
    pub found_at_ms: u64,
    pub meta: ExchangeMeta,
    #[serde(skip)]
    exchange: Weak<Exchange>,
}

pub struct FindingBuilder {
    finding: Finding,
}

impl Finding {
    pub fn builder(
        signature: &str,
        parameter: &str,
        param_index: usize,
        payload: &str,
        strategy: StrategyTag,
    ) -> FindingBuilder {
        FindingBuilder {
            finding: Finding {
                signature: signature.to_string(),
                parameter: parameter.to_string(),
                param_index,
                payload: payload.to_string(),
                strategy,
                confidence: 0.0,
                evidence: None,
                response_len: 0,
                status_code: 0,
                elapsed_ms: 0,
                found_at_ms: now_ms(),
                meta: ExchangeMeta {
                    url: String::new(),
                    method: String::new(),
                    preview: String::new(),
                },
                exchange: Weak::new(),
            },
        }
    }

    /// The full exchange, if it is still cached.
    pub fn exchange(&self) -> Option<Arc<Exchange>> {
        self.exchange.upgrade()
    }

    /// Builds a curl command that reproduces the mutated request.
    pub fn to_curl(&self) -> String {
        let mut parts = vec![format!("curl -X {} '{}'", self.meta.method, self.meta.url)];
        if let Some(exchange) = self.exchange() {
            for (k, v) in exchange.request.headers.iter() {
                parts.push(format!("-H '{}: {}'", k, v.to_str().unwrap_or("")));
            }
            if !exchange.request.body.is_empty() {
                parts.push(format!("-d '{}'", exchange.request.body));
            }
        }
        parts.push("--insecure".to_string());
        parts.join(" ")
    }
}

impl FindingBuilder {
    pub fn confidence(mut self, confidence: f64) -> Self {
        self.finding.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn evidence(mut self, evidence: impl Into<String>) -> Self {
        self.finding.evidence = Some(evidence.into());
        self
    }

    /// Records response facts and copies the exchange metadata.
    pub fn response(mut self, request: &HttpRequest, response: &HttpResponse) -> Self {
        self.finding.response_len = response.len();
        self.finding.status_code = response.status;
        self.finding.elapsed_ms = response.elapsed.as_millis();
        self.finding.meta = ExchangeMeta::capture(request, response);
        self
    }

    pub fn exchange(mut self, exchange: Weak<Exchange>) -> Self {
        self.finding.exchange = exchange;
        self
    }

    pub fn build(self) -> Finding {
        self.finding
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Keeps recent exchanges alive for findings that reference them weakly.
pub struct ExchangeCache {
    next_id: AtomicU64,
    entries: Mutex<LruCache<u64, Arc<Exchange>>>,
}

impl ExchangeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            next_id: AtomicU64::new(0),
            entries: Mutex::new(LruCache::new(non_zero(capacity))),
        }
    }

    /// Caches the exchange and returns a weak handle to it. The oldest entry
    /// is released once the cache is full.
    pub fn retain(&self, exchange: Exchange) -> Weak<Exchange> {
        let exchange = Arc::new(exchange);
        let weak = Arc::downgrade(&exchange);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push(id, exchange);
        weak
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Default for ExchangeCache {
    fn default() -> Self {
        Self::new(DEFAULT_EXCHANGE_CACHE)
    }
}

fn non_zero(capacity: usize) -> NonZeroUsize {
    NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)
}

/// Signature → findings, bounded by signature count with least-recently-touched
/// eviction. Appending to a signature touches it; reads do not.
pub struct AttackIndex {
    entries: Mutex<LruCache<String, Vec<Arc<Finding>>>>,
}

impl AttackIndex {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(non_zero(capacity))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }

    /// Appends a finding under its signature and returns the shared handle.
    pub fn append(&self, finding: Finding) -> Arc<Finding> {
        let finding = Arc::new(finding);
        let mut entries = self.entries.lock();
        if let Some(findings) = entries.get_mut(&finding.signature) {
            findings.push(Arc::clone(&finding));
            return finding;
        }
        if let Some((evicted, _)) = entries.push(finding.signature.clone(), vec![Arc::clone(&finding)]) {
            debug!("attack index full, evicted {}", evicted);
        }
        finding
    }

    pub fn get(&self, signature: &str) -> Vec<Arc<Finding>> {
        self.entries.lock().peek(signature).cloned().unwrap_or_default()
    }

    pub fn contains(&self, signature: &str) -> bool {
        self.entries.lock().contains(signature)
    }

    /// Signatures ordered from least to most recently touched.
    pub fn signatures(&self) -> Vec<String> {
        self.entries.lock().iter().rev().map(|(signature, _)| signature.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn total_findings(&self) -> usize {
        self.entries.lock().iter().map(|(_, findings)| findings.len()).sum()
    }

    pub fn remove(&self, signature: &str) -> Option<Vec<Arc<Finding>>> {
        self.entries.lock().pop(signature)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Default for AttackIndex {
    fn default() -> Self {
        Self::new(DEFAULT_INDEX_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use url::Url;

    fn finding(signature: &str, payload: &str) -> Finding {
        Finding::builder(signature, "id", 0, payload, StrategyTag::Error).build()
    }

    #[test]
    fn test_capacity_and_lru_eviction() {
        let index = AttackIndex::new(3);
        index.append(finding("a", "1"));
        index.append(finding("b", "1"));
        index.append(finding("c", "1"));
        index.append(finding("a", "2"));
        index.append(finding("d", "1"));

        assert_eq!(index.len(), 3);
        assert!(!index.contains("b"));
        assert_eq!(index.signatures(), vec!["c", "a", "d"]);
        assert_eq!(index.get("a").len(), 2);
    }

    #[test]
    fn test_reads_do_not_promote() {
        let index = AttackIndex::new(2);
        index.append(finding("a", "1"));
        index.append(finding("b", "1"));
        let _ = index.get("a");
        index.append(finding("c", "1"));
        assert!(!index.contains("a"));
        assert!(index.contains("b"));
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let index = AttackIndex::new(10);
        for i in 0..1000 {
            index.append(finding(&format!("sig-{}", i % 37), "x"));
            assert!(index.len() <= 10);
        }
    }

    #[test]
    fn test_remove_and_clear() {
        let index = AttackIndex::default();
        assert_eq!(index.capacity(), DEFAULT_INDEX_CAPACITY);
        index.append(finding("a", "1"));
        index.append(finding("b", "1"));

        let removed = index.remove("a").unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(index.signatures(), vec!["b"]);
        assert!(index.remove("a").is_none());

        index.clear();
        assert!(index.is_empty());
        assert!(index.signatures().is_empty());
        index.append(finding("c", "1"));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_concurrent_appends_same_signature() {
        let index = Arc::new(AttackIndex::new(100));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let index = Arc::clone(&index);
                std::thread::spawn(move || {
                    for i in 0..250 {
                        index.append(finding("shared", &format!("{}-{}", t, i)));
                        index.append(finding(&format!("own-{}", t), "x"));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(index.get("shared").len(), 2000);
        assert_eq!(index.total_findings(), 4000);
        assert_eq!(index.len(), 9);
    }

    #[test]
    fn test_exchange_cache_releases_oldest() {
        let cache = ExchangeCache::new(2);
        let request = HttpRequest::get(Url::parse("http://example.com/?id=1").unwrap());
        let first = cache.retain(Exchange::new(request.clone(), None));
        let second = cache.retain(Exchange::new(request.clone(), None));
        let third = cache.retain(Exchange::new(request, None));

        assert_eq!(cache.len(), 2);
        assert!(first.upgrade().is_none());
        assert!(second.upgrade().is_some());
        assert!(third.upgrade().is_some());

        cache.clear();
        assert!(cache.is_empty());
        assert!(third.upgrade().is_none());
    }

    #[test]
    fn test_zero_capacity_keeps_one() {
        let index = AttackIndex::new(0);
        assert_eq!(index.capacity(), 1);
        index.append(finding("a", "1"));
        index.append(finding("b", "1"));
        assert_eq!(index.signatures(), vec!["b"]);
    }

    #[test]
    fn test_metadata_survives_exchange_release() {
        let request = HttpRequest::get(Url::parse("http://example.com/item?id=1").unwrap());
        let response = HttpResponse::new(500, "é".repeat(800), Duration::from_millis(12));
        let cache = ExchangeCache::new(1);
        let weak = cache.retain(Exchange::new(request.clone(), Some(response.clone())));

        let f = Finding::builder("sig", "id", 0, "'", StrategyTag::Error)
            .confidence(1.5)
            .response(&request, &response)
            .exchange(weak)
            .build();
        assert!(f.exchange().is_some());
        assert_eq!(f.confidence, 1.0);
        assert_eq!(f.meta.preview.chars().count(), PREVIEW_CHARS);
        assert_eq!(f.status_code, 500);
        assert_eq!(f.elapsed_ms, 12);

        cache.retain(Exchange::new(request, None));
        assert!(f.exchange().is_none());
        assert_eq!(f.meta.method, "GET");
        assert_eq!(f.meta.url, "http://example.com/item?id=1");
        assert!(f.to_curl().starts_with("curl -X GET 'http://example.com/item?id=1'"));
    }
}
