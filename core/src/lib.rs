pub mod core;
pub mod error;
pub mod http;
pub mod utils;

use log::warn;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use crate::core::admission::{FilterConfig, FilterHandle, Rejection};
pub use crate::core::compare::Metric;
pub use crate::core::engine::{ScanPipeline, Submission};
pub use crate::core::result_store::{AttackIndex, Finding};
pub use crate::core::state::{ScanPhase, ScanTask, StatsSnapshot};
pub use crate::core::StrategyTag;
pub use crate::error::{ComparisonError, DetectionError, TransportError};
pub use crate::http::{HttpClient, HttpRequest, HttpResponse, HttpTransport};
pub use crate::utils::payload_loader::PayloadLoader;
pub use crate::utils::read_lines;

/// Tuning for the detection strategies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DetectionConfig {
    pub error_enabled: bool,
    pub string_enabled: bool,
    pub numeric_enabled: bool,
    pub order_enabled: bool,
    pub boolean_enabled: bool,
    pub diy_enabled: bool,
    pub metric: Metric,
    /// Remove reflected payloads before scoring.
    pub html_aware: bool,
    /// Scores at or above this count as "same page".
    pub similarity_threshold: f64,
    pub diy_payloads: Vec<String>,
    pub diy_patterns: Vec<String>,
    /// 0 disables delay-based DIY detection.
    pub diy_delay_threshold_ms: u64,
    pub diy_similarity_check: bool,
    pub attempt_timeout_ms: u64,
    pub regex_budget_ms: u64,
    /// Fixed pause before every mutated request.
    pub request_delay_ms: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            error_enabled: true,
            string_enabled: true,
            numeric_enabled: true,
            order_enabled: true,
            boolean_enabled: true,
            diy_enabled: true,
            metric: Metric::Levenshtein,
            html_aware: true,
            similarity_threshold: 0.9,
            diy_payloads: Vec::new(),
            diy_patterns: Vec::new(),
            diy_delay_threshold_ms: 0,
            diy_similarity_check: false,
            attempt_timeout_ms: 10_000,
            regex_budget_ms: 500,
            request_delay_ms: 0,
        }
    }
}

impl DetectionConfig {
    pub fn is_enabled(&self, tag: StrategyTag) -> bool {
        match tag {
            StrategyTag::Error => self.error_enabled,
            StrategyTag::String => self.string_enabled,
            StrategyTag::Numeric => self.numeric_enabled,
            StrategyTag::Order => self.order_enabled,
            StrategyTag::Boolean => self.boolean_enabled,
            StrategyTag::Diy => self.diy_enabled,
        }
    }

    /// Replaces out-of-range values with their defaults. Never fails.
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if !self.similarity_threshold.is_finite()
            || self.similarity_threshold <= 0.0
            || self.similarity_threshold > 1.0
        {
            warn!(
                "similarity threshold {} out of range, using {}",
                self.similarity_threshold, defaults.similarity_threshold
            );
            self.similarity_threshold = defaults.similarity_threshold;
        }
        if self.attempt_timeout_ms == 0 {
            warn!("attempt timeout of 0ms, using {}ms", defaults.attempt_timeout_ms);
            self.attempt_timeout_ms = defaults.attempt_timeout_ms;
        }
        if self.regex_budget_ms == 0 {
            warn!("regex budget of 0ms, using {}ms", defaults.regex_budget_ms);
            self.regex_budget_ms = defaults.regex_budget_ms;
        }
        self.diy_payloads.retain(|p| !p.trim().is_empty());
        self.diy_patterns.retain(|p| !p.trim().is_empty());
        self
    }
}

/// Everything needed to stand up a [`ScanPipeline`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub filter: FilterConfig,
    pub detection: DetectionConfig,
    /// Transport timeout in seconds.
    pub timeout: u64,
    pub proxy: String,
    /// `Name: value` pairs separated by `;`.
    pub headers: String,
    pub store_capacity: usize,
    pub exchange_cache: usize,
    /// Hardware concurrency used to size the pools; 0 = detect.
    pub parallelism: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            filter: FilterConfig::default(),
            detection: DetectionConfig::default(),
            timeout: 10,
            proxy: String::new(),
            headers: String::new(),
            store_capacity: crate::core::result_store::DEFAULT_INDEX_CAPACITY,
            exchange_cache: crate::core::result_store::DEFAULT_EXCHANGE_CACHE,
            parallelism: 0,
        }
    }
}

impl EngineConfig {
    pub fn header_list(&self) -> Vec<String> {
        if self.headers.is_empty() {
            Vec::new()
        } else {
            self.headers
                .split(';')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        }
    }

    pub fn parsed_headers(&self) -> Vec<(String, String)> {
        parse_custom_headers(&self.header_list())
    }

    pub fn proxy_ref(&self) -> Option<&str> {
        if self.proxy.is_empty() { None } else { Some(&self.proxy) }
    }

    pub fn effective_parallelism(&self) -> usize {
        if self.parallelism == 0 {
            crate::core::pool::available_parallelism()
        } else {
            self.parallelism
        }
    }
}

pub fn parse_custom_headers(raw: &[String]) -> Vec<(String, String)> {
    raw.iter().filter_map(|h| {
        let mut parts = h.splitn(2, ':');
        let key = parts.next()?.trim().to_string();
        let val = parts.next().unwrap_or("").trim().to_string();
        if key.is_empty() { return None; }
        Some((key, val))
    }).collect()
}

/// Output abstraction for the scan pipeline.
pub trait ScanEventSink: Send + Sync {
    fn on_log(&self, level: &str, message: &str);
    fn on_finding(&self, finding: &Finding);
    fn on_progress(&self, phase: &str, current: usize, total: usize);

    /// A request reached a terminal phase; `markers` pairs each tested
    /// parameter with its result marker.
    fn on_scan_finished(&self, _task: &ScanTask, _markers: &[(String, String)]) {}
}

pub type SinkRef = Arc<dyn ScanEventSink>;

/// Terminal output sink for CLI usage.
pub struct ConsoleSink;

impl ConsoleSink {
    pub fn new_ref() -> SinkRef {
        Arc::new(Self)
    }
}

impl ScanEventSink for ConsoleSink {
    fn on_log(&self, level: &str, message: &str) {
        use colored::*;
        use std::io::Write;
        let colored = match level {
            "success" => message.green().to_string(),
            "error"   => message.red().to_string(),
            "warn"    => message.yellow().to_string(),
            "phase"   => message.bright_cyan().bold().to_string(),
            _         => message.to_string(),
        };
        print!("{}\r\n", colored);
        std::io::stdout().flush().ok();
    }

    fn on_finding(&self, finding: &Finding) {
        use colored::*;
        use std::io::Write;
        let out = |text: &str| {
            print!("{}\r\n", text);
            std::io::stdout().flush().ok();
        };
        out(&format!(
            "\n{} {} in parameter {}",
            "[+]".green().bold(),
            finding.strategy.to_string().red().bold(),
            finding.parameter.bright_white().bold()
        ));
        out(&format!("    Target:   {}", finding.meta.url.white()));
        out(&format!("    Payload:  {}", finding.payload.bright_yellow()));
        if let Some(ref evidence) = finding.evidence {
            out(&format!("    Evidence: {}", evidence));
        }
        out(&format!(
            "    Info:     Status [{}] | Length [{}] | Time [{}ms] | Confidence [{}]",
            finding.status_code.to_string().cyan(),
            finding.response_len.to_string().blue(),
            finding.elapsed_ms.to_string().dimmed(),
            crate::core::compare::format_percent(finding.confidence)
        ));
        out(&format!("    curl:     {}", finding.to_curl().dimmed()));
        out(&"──────────────────────────────────────────".dimmed().to_string());
    }

    fn on_progress(&self, phase: &str, current: usize, total: usize) {
        use colored::*;
        use std::io::Write;
        if total > 0 {
            print!("{}\r\n", format!("[*] {} ({}/{})", phase, current, total).bright_cyan());
        } else {
            print!("{}\r\n", format!("[*] {}", phase).bright_cyan());
        }
        std::io::stdout().flush().ok();
    }

    fn on_scan_finished(&self, task: &ScanTask, markers: &[(String, String)]) {
        use colored::*;
        use std::io::Write;
        let flagged: Vec<String> = markers
            .iter()
            .filter(|(_, marker)| !marker.is_empty())
            .map(|(name, marker)| format!("{}{}", name, marker))
            .collect();
        let summary = if flagged.is_empty() {
            "clean".dimmed().to_string()
        } else {
            flagged.join(" ").red().to_string()
        };
        print!(
            "{}\r\n",
            format!("[*] {} {} -> {:?} {}", task.method, task.url, task.phase(), summary)
        );
        std::io::stdout().flush().ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_config_sanitized() {
        let config = DetectionConfig {
            similarity_threshold: f64::NAN,
            attempt_timeout_ms: 0,
            regex_budget_ms: 0,
            diy_payloads: vec!["  ".into(), "' OR 1=1".into()],
            ..DetectionConfig::default()
        }
        .sanitized();
        assert_eq!(config.similarity_threshold, 0.9);
        assert_eq!(config.attempt_timeout_ms, 10_000);
        assert_eq!(config.regex_budget_ms, 500);
        assert_eq!(config.diy_payloads, vec!["' OR 1=1"]);

        let too_high = DetectionConfig { similarity_threshold: 1.5, ..DetectionConfig::default() };
        assert_eq!(too_high.sanitized().similarity_threshold, 0.9);
    }

    #[test]
    fn test_detection_config_camel_case_with_defaults() {
        let config: DetectionConfig =
            serde_json::from_str(r#"{"orderEnabled":false,"metric":"jaccard","diyDelayThresholdMs":3000}"#)
                .unwrap();
        assert!(!config.order_enabled);
        assert!(config.error_enabled);
        assert_eq!(config.metric, Metric::Jaccard);
        assert_eq!(config.diy_delay_threshold_ms, 3000);
        assert!(!config.is_enabled(StrategyTag::Order));
    }

    #[test]
    fn test_engine_config_headers() {
        let config = EngineConfig {
            headers: "Cookie: a=1; X-Test:yes;;".into(),
            ..EngineConfig::default()
        };
        assert_eq!(
            config.parsed_headers(),
            vec![
                ("Cookie".to_string(), "a=1".to_string()),
                ("X-Test".to_string(), "yes".to_string())
            ]
        );
        assert!(config.proxy_ref().is_none());
        assert_eq!(config.store_capacity, 10_000);
    }

    #[test]
    fn test_parse_custom_headers_skips_empty_keys() {
        let raw = vec![": nothing".to_string(), "Authorization: Bearer x:y".to_string()];
        assert_eq!(
            parse_custom_headers(&raw),
            vec![("Authorization".to_string(), "Bearer x:y".to_string())]
        );
    }
}
