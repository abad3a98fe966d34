use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use url::Url;

use sqlprobe_core::core::engine::request_signature;
use sqlprobe_core::core::mutator::extract_parameters;
use sqlprobe_core::http::Exchange;
use sqlprobe_core::{
    DetectionConfig, EngineConfig, Finding, HttpRequest, HttpResponse, HttpTransport,
    ScanEventSink, ScanPhase, ScanPipeline, ScanTask, StrategyTag, Submission, TransportError,
};

const SQL_ERROR: &str =
    "You have an error in your SQL syntax; check the manual that corresponds to your MySQL server version";

/// In-memory shop whose `id` (query or JSON `filter.id`) and `sort` inputs
/// are concatenated into SQL.
struct VulnerableShop {
    slow_marker: Option<(&'static str, Duration)>,
    latency: Duration,
    requests: Mutex<usize>,
}

impl VulnerableShop {
    fn new() -> Self {
        Self {
            slow_marker: None,
            latency: Duration::from_millis(1),
            requests: Mutex::new(0),
        }
    }

    fn rows(id: &str) -> Option<&'static str> {
        match id {
            "5" | "5''" | "5-0" | "5' AND '1'='1" | "5 AND 1=1" => {
                Some("<tr><td>record 5</td><td>owner alice</td></tr>")
            }
            "5-1" => Some("<tr><td>record 4</td><td>owner bob from accounting</td></tr>"),
            "5'" | "5\"" | "5\\" | "5')" | "5\")" | "5'))" | "5`" => None,
            _ => Some(""),
        }
    }

    fn listing(sort: &str) -> &'static str {
        match sort {
            "name" | "name,1" => "<ul><li>apple</li><li>banana</li><li>cherry</li></ul>",
            _ => "<p>Unknown column in order clause</p>",
        }
    }

    fn render(id: Option<&str>, sort: Option<&str>) -> String {
        let rows = match id {
            Some(id) => match Self::rows(id) {
                Some(rows) => rows,
                None => return SQL_ERROR.to_string(),
            },
            None => "",
        };
        let listing = sort.map(Self::listing).unwrap_or("");
        format!(
            "<html><head><title>Shop</title></head><body><table>{}</table>{}\
             <footer>static footer text that pads every page to a stable size</footer></body></html>",
            rows, listing
        )
    }
}

#[async_trait]
impl HttpTransport for VulnerableShop {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        *self.requests.lock() += 1;
        let mut id = None;
        let mut sort = None;
        for (k, v) in request.url.query_pairs() {
            match k.as_ref() {
                "id" => id = Some(v.into_owned()),
                "sort" => sort = Some(v.into_owned()),
                _ => {}
            }
        }
        if request.method == Method::POST {
            let json: serde_json::Value = serde_json::from_str(&request.body)
                .map_err(|e| TransportError::Request(e.to_string()))?;
            id = json["filter"]["id"].as_str().map(str::to_string);
        }

        let mut latency = self.latency;
        if let (Some((marker, delay)), Some(id)) = (self.slow_marker, id.as_deref()) {
            if id.contains(marker) {
                latency = delay;
            }
        }
        tokio::time::sleep(latency).await;

        let body = Self::render(id.as_deref(), sort.as_deref());
        Ok(HttpResponse::new(200, body, latency))
    }
}

#[derive(Default)]
struct RecordingSink {
    findings: Mutex<Vec<String>>,
    progress: Mutex<Vec<(String, usize, usize)>>,
    finished: Mutex<Vec<(ScanPhase, Vec<(String, String)>)>>,
}

impl ScanEventSink for RecordingSink {
    fn on_log(&self, _level: &str, _message: &str) {}

    fn on_finding(&self, finding: &Finding) {
        self.findings.lock().push(finding.parameter.clone());
    }

    fn on_progress(&self, phase: &str, current: usize, total: usize) {
        self.progress.lock().push((phase.to_string(), current, total));
    }

    fn on_scan_finished(&self, task: &ScanTask, markers: &[(String, String)]) {
        self.finished.lock().push((task.phase(), markers.to_vec()));
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn engine_config() -> EngineConfig {
    EngineConfig {
        parallelism: 2,
        ..EngineConfig::default()
    }
}

fn get(url: &str) -> Exchange {
    Exchange::new(HttpRequest::get(Url::parse(url).unwrap()), None)
}

#[tokio::test]
async fn test_vulnerable_parameters_get_markers_and_findings() {
    init_logging();
    let sink = Arc::new(RecordingSink::default());
    let pipeline = ScanPipeline::new(
        &engine_config(),
        Arc::new(VulnerableShop::new()),
        Some(sink.clone()),
    );

    let outcome = pipeline
        .on_exchange(get("http://shop.test/items?id=5&sort=name&q=shoes"))
        .await;
    let task = outcome.task().cloned().expect("admitted");
    pipeline.wait_idle().await;

    assert_eq!(task.phase(), ScanPhase::Completed);
    assert_eq!(
        task.markers(),
        vec![
            ("id".to_string(), "-errsql-stringsql-numsql-boolsql".to_string()),
            ("sort".to_string(), "-ordersql".to_string()),
            ("q".to_string(), String::new()),
        ]
    );

    let findings = pipeline.findings(&task.signature);
    assert_eq!(findings.len(), 5);
    let mut tags: Vec<StrategyTag> = findings.iter().map(|f| f.strategy).collect();
    tags.sort();
    assert_eq!(
        tags,
        vec![
            StrategyTag::Error,
            StrategyTag::String,
            StrategyTag::Numeric,
            StrategyTag::Order,
            StrategyTag::Boolean
        ]
    );
    for finding in &findings {
        assert_eq!(finding.signature, "GET|shop.test|/items|id,q,sort");
        assert!(finding.meta.url.starts_with("http://shop.test/items?"));
        assert_eq!(finding.meta.method, "GET");
        assert!(finding.meta.preview.chars().count() <= 500);
        assert!((0.0..=1.0).contains(&finding.confidence));
    }
    let order = findings.iter().find(|f| f.strategy == StrategyTag::Order).unwrap();
    assert_eq!(order.parameter, "sort");
    assert_eq!(order.param_index, 1);
    assert_eq!(order.payload, "name,99999");

    let stats = pipeline.stats();
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.vulnerable, 1);
    assert_eq!(sink.findings.lock().len(), 5);
    let progress = sink.progress.lock();
    assert_eq!(progress.len(), 5);
    assert_eq!(progress.last().cloned(), Some((format!("scan #{} strategies", task.id), 5, 5)));
    drop(progress);
    let finished = sink.finished.lock();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].0, ScanPhase::Completed);
    assert_eq!(finished[0].1, task.markers());
}

#[tokio::test]
async fn test_json_body_param_is_addressed_by_original_index() {
    let pipeline = ScanPipeline::new(&engine_config(), Arc::new(VulnerableShop::new()), None);

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    let request = HttpRequest::new(
        Method::POST,
        Url::parse("http://shop.test/api/items?lang=en").unwrap(),
        headers,
        r#"{"filter":{"id":"5"},"page":1}"#.to_string(),
    );
    let outcome = pipeline.submit_manual(request).await;
    let task = outcome.task().cloned().expect("admitted");
    pipeline.wait_idle().await;

    let markers = task.markers();
    assert_eq!(markers.len(), 3);
    assert_eq!(markers[0], ("lang".to_string(), String::new()));
    assert_eq!(markers[1].0, "filter.id");
    assert!(markers[1].1.contains("-errsql"));
    assert!(markers[1].1.contains("-boolsql"));
    assert_eq!(markers[2], ("page".to_string(), String::new()));

    for finding in pipeline.findings(&task.signature) {
        assert_eq!(finding.parameter, "filter.id");
        assert_eq!(finding.param_index, 1);
        let exchange = finding.exchange().expect("exchange still cached");
        assert!(exchange.request.body.contains("\"page\":1"));
        assert_eq!(exchange.request.url.query(), Some("lang=en"));
    }
}

#[tokio::test]
async fn test_exchange_cache_keeps_only_recent_exchanges() {
    let config = EngineConfig {
        exchange_cache: 1,
        ..engine_config()
    };
    let pipeline = ScanPipeline::new(&config, Arc::new(VulnerableShop::new()), None);
    let task = pipeline
        .on_exchange(get("http://shop.test/items?id=5"))
        .await
        .task()
        .cloned()
        .unwrap();
    pipeline.wait_idle().await;

    let findings = pipeline.findings(&task.signature);
    assert_eq!(findings.len(), 4);
    let live = findings.iter().filter(|f| f.exchange().is_some()).count();
    assert_eq!(live, 1);
    assert!(findings.iter().all(|f| !f.meta.url.is_empty()));
}

#[tokio::test]
async fn test_store_capacity_evicts_oldest_signature() {
    let config = EngineConfig {
        store_capacity: 1,
        ..engine_config()
    };
    let pipeline = ScanPipeline::new(&config, Arc::new(VulnerableShop::new()), None);

    pipeline.on_exchange(get("http://shop.test/items?id=5")).await;
    pipeline.wait_idle().await;
    pipeline.on_exchange(get("http://shop.test/archive?id=5")).await;
    pipeline.wait_idle().await;

    let index = pipeline.index();
    assert_eq!(index.len(), 1);
    assert_eq!(index.signatures(), vec!["GET|shop.test|/archive|id".to_string()]);
}

#[tokio::test]
async fn test_stop_ends_scan_as_manually_stopped() {
    init_logging();
    let shop = VulnerableShop {
        latency: Duration::from_millis(100),
        ..VulnerableShop::new()
    };
    let pipeline = ScanPipeline::new(&engine_config(), Arc::new(shop), None);

    let task = pipeline
        .on_exchange(get("http://shop.test/items?id=5&sort=name"))
        .await
        .task()
        .cloned()
        .unwrap();
    assert!(pipeline.stop(task.id));
    pipeline.wait_idle().await;

    assert_eq!(task.phase(), ScanPhase::ManuallyStopped);
    assert_eq!(pipeline.stats().stopped, 1);
    assert!(!pipeline.stop(task.id));
}

#[tokio::test]
async fn test_delay_based_diy_payload() {
    init_logging();
    let shop = VulnerableShop {
        slow_marker: Some(("SLEEP", Duration::from_millis(400))),
        ..VulnerableShop::new()
    };
    let detection = DetectionConfig {
        error_enabled: false,
        string_enabled: false,
        numeric_enabled: false,
        order_enabled: false,
        boolean_enabled: false,
        diy_payloads: vec![" AND SLEEP(1)".to_string()],
        diy_delay_threshold_ms: 200,
        ..DetectionConfig::default()
    };
    let config = EngineConfig {
        detection,
        ..engine_config()
    };
    let pipeline = ScanPipeline::new(&config, Arc::new(shop), None);

    let task = pipeline
        .on_exchange(get("http://shop.test/items?id=5"))
        .await
        .task()
        .cloned()
        .unwrap();
    pipeline.wait_idle().await;

    let findings = pipeline.findings(&task.signature);
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].strategy, StrategyTag::Diy);
    assert_eq!(findings[0].payload, "5 AND SLEEP(1)");
    assert!(findings[0].evidence.as_deref().unwrap_or("").contains("answered in"));
    assert_eq!(task.markers(), vec![("id".to_string(), "-diypoc".to_string())]);
}

#[tokio::test]
async fn test_dry_signature_matches_pipeline_signature() {
    let request = HttpRequest::get(Url::parse("http://shop.test/user/42?b=1&a=2&_t=99").unwrap());
    let params = extract_parameters(&request);
    assert_eq!(request_signature(&request, &params), "GET|shop.test|/user/{int}|a,b");

    let pipeline = ScanPipeline::new(&engine_config(), Arc::new(VulnerableShop::new()), None);
    let outcome = pipeline.on_exchange(Exchange::new(request, None)).await;
    match outcome {
        Submission::Accepted(task) => assert_eq!(task.signature, "GET|shop.test|/user/{int}|a,b"),
        other => panic!("unexpected {:?}", other),
    }
    pipeline.wait_idle().await;
}
