use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::core::admission::{self, FilterConfig, FilterHandle, Rejection};
use crate::core::mutator::{extract_parameters, Parameter};
use crate::core::pool::{PoolSizing, WorkerPool};
use crate::core::result_store::{AttackIndex, ExchangeCache, Finding};
use crate::core::signature;
use crate::core::state::{ScanPhase, ScanStats, ScanTask, StatsSnapshot};
use crate::core::strategies::{enabled_strategies, run_strategy, Hit, ProbeContext};
use crate::core::target_manager::TargetManager;
use crate::core::throttle::Throttle;
use crate::http::{Exchange, HttpRequest, HttpResponse, HttpTransport};
use crate::utils::detector::SignatureBank;
use crate::{DetectionConfig, EngineConfig, SinkRef};

/// Outcome of handing a request to the pipeline.
#[derive(Debug, Clone)]
pub enum Submission {
    Accepted(Arc<ScanTask>),
    Rejected(Rejection),
    /// The request's family was already scanned; carries its signature.
    Duplicate(String),
}

impl Submission {
    pub fn task(&self) -> Option<&Arc<ScanTask>> {
        match self {
            Submission::Accepted(task) => Some(task),
            _ => None,
        }
    }
}

/// Structural signature of a request, over its full parameter list.
pub fn request_signature(request: &HttpRequest, params: &[Parameter]) -> String {
    let names: Vec<&str> = params.iter().map(|p| p.name.as_str()).collect();
    signature::generate(request.method.as_str(), request.host(), request.path(), &names)
}

struct Shared {
    transport: Arc<dyn HttpTransport>,
    filters: Arc<FilterHandle>,
    detection: RwLock<Arc<DetectionConfig>>,
    diy_bank: RwLock<Arc<SignatureBank>>,
    error_bank: Arc<SignatureBank>,
    index: Arc<AttackIndex>,
    exchanges: ExchangeCache,
    families: TargetManager,
    stats: ScanStats,
    receive_pool: WorkerPool,
    scan_pool: WorkerPool,
    throttle: Arc<Throttle>,
    sink: Option<SinkRef>,
    next_id: AtomicU64,
    active: Mutex<HashMap<u64, Arc<ScanTask>>>,
    idle: Notify,
}

/// Two-tier scan pipeline.
///
/// Admitted requests get a receive-pool job that captures the baseline and
/// fans out one scan-pool job per enabled strategy. A watcher moves the task
/// to its terminal phase once every strategy job has ended.
#[derive(Clone)]
pub struct ScanPipeline {
    shared: Arc<Shared>,
}

impl ScanPipeline {
    /// Must be called from within a tokio runtime.
    pub fn new(config: &EngineConfig, transport: Arc<dyn HttpTransport>, sink: Option<SinkRef>) -> Self {
        let parallelism = config.effective_parallelism();
        let detection = config.detection.clone().sanitized();
        let diy_bank = Arc::new(SignatureBank::from_patterns(&detection.diy_patterns));
        let throttle = Arc::new(Throttle::new(detection.request_delay_ms));

        Self {
            shared: Arc::new(Shared {
                transport,
                filters: Arc::new(FilterHandle::new(config.filter.clone())),
                detection: RwLock::new(Arc::new(detection)),
                diy_bank: RwLock::new(diy_bank),
                error_bank: SignatureBank::builtin(),
                index: Arc::new(AttackIndex::new(config.store_capacity)),
                exchanges: ExchangeCache::new(config.exchange_cache),
                families: TargetManager::new(),
                stats: ScanStats::default(),
                receive_pool: WorkerPool::new("receive", PoolSizing::receive(parallelism)),
                scan_pool: WorkerPool::new("scan", PoolSizing::scan(parallelism)),
                throttle,
                sink,
                next_id: AtomicU64::new(0),
                active: Mutex::new(HashMap::new()),
                idle: Notify::new(),
            }),
        }
    }

    pub fn filters(&self) -> Arc<FilterHandle> {
        Arc::clone(&self.shared.filters)
    }

    pub fn publish_filters(&self, config: FilterConfig) {
        self.shared.filters.publish(config);
    }

    pub fn detection(&self) -> Arc<DetectionConfig> {
        Arc::clone(&self.shared.detection.read())
    }

    /// Replaces the detection snapshot. Scans already running keep the one
    /// they started with.
    pub fn publish_detection(&self, config: DetectionConfig) {
        let config = config.sanitized();
        let bank = Arc::new(SignatureBank::from_patterns(&config.diy_patterns));
        self.shared.throttle.set_fixed_delay(config.request_delay_ms);
        *self.shared.diy_bank.write() = bank;
        *self.shared.detection.write() = Arc::new(config);
    }

    pub fn pool_sizing(&self) -> (PoolSizing, PoolSizing) {
        (self.shared.receive_pool.sizing(), self.shared.scan_pool.sizing())
    }

    /// Automatic path: captured traffic. Each request family is scanned once.
    pub async fn on_exchange(&self, exchange: Exchange) -> Submission {
        let Exchange { request, response } = exchange;
        let config = self.shared.filters.snapshot();
        if let Err(rejection) = admission::admit(&config, &request) {
            self.shared.stats.record_rejected();
            debug!("skipping {} {}: {}", request.method, request.url, rejection);
            return Submission::Rejected(rejection);
        }

        let params = extract_parameters(&request);
        let signature = request_signature(&request, &params);
        if !self.shared.families.insert_if_new(&signature) {
            debug!("family {} already scanned", signature);
            return Submission::Duplicate(signature);
        }
        Submission::Accepted(self.dispatch(request, params, signature, response).await)
    }

    /// Manual path: always scanned, subject to the size cap.
    pub async fn submit_manual(&self, request: HttpRequest) -> Submission {
        let config = self.shared.filters.snapshot();
        if let Err(rejection) = admission::admit_manual(&config, &request) {
            self.shared.stats.record_rejected();
            debug!("manual {} {} rejected: {}", request.method, request.url, rejection);
            return Submission::Rejected(rejection);
        }

        let params = extract_parameters(&request);
        let signature = request_signature(&request, &params);
        self.shared.families.insert_if_new(&signature);
        Submission::Accepted(self.dispatch(request, params, signature, None).await)
    }

    async fn dispatch(
        &self,
        request: HttpRequest,
        params: Vec<Parameter>,
        signature: String,
        captured: Option<HttpResponse>,
    ) -> Arc<ScanTask> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let task = Arc::new(ScanTask::new(
            id,
            signature,
            request.url.to_string(),
            request.method.to_string(),
        ));
        self.shared.active.lock().insert(id, Arc::clone(&task));
        debug!("scan #{} admitted: {}", id, task.signature);

        let shared = Arc::clone(&self.shared);
        let job_task = Arc::clone(&task);
        let handle = self
            .shared
            .receive_pool
            .execute(async move { shared.prepare(job_task, request, params, captured).await })
            .await;

        let shared = Arc::clone(&self.shared);
        let guard_task = Arc::clone(&task);
        tokio::spawn(async move {
            if !handle.wait().await {
                error!("scan #{}: baseline task panicked", guard_task.id);
                shared.log("error", &format!("[!] scan #{}: baseline task crashed", guard_task.id));
                shared.finish(&guard_task, ScanPhase::Error);
            }
        });
        task
    }

    /// Asks a running scan to stop between attempts.
    pub fn stop(&self, id: u64) -> bool {
        match self.shared.active.lock().get(&id) {
            Some(task) => {
                task.stop();
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        for task in self.shared.active.lock().values() {
            task.stop();
        }
    }

    pub fn active_scans(&self) -> Vec<Arc<ScanTask>> {
        self.shared.active.lock().values().cloned().collect()
    }

    /// Resolves once no scan is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            let idle = self.shared.active.lock().is_empty();
            if idle {
                return;
            }
            notified.await;
        }
    }

    pub fn index(&self) -> Arc<AttackIndex> {
        Arc::clone(&self.shared.index)
    }

    pub fn findings(&self, signature: &str) -> Vec<Arc<Finding>> {
        self.shared.index.get(signature)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Forgets stored findings, cached exchanges and scanned families.
    pub fn clear_history(&self) {
        self.shared.index.clear();
        self.shared.exchanges.clear();
        self.shared.families.clear();
        info!("scan history cleared");
    }
}

impl Shared {
    async fn prepare(
        self: Arc<Self>,
        task: Arc<ScanTask>,
        request: HttpRequest,
        params: Vec<Parameter>,
        captured: Option<HttpResponse>,
    ) {
        let config = Arc::clone(&self.detection.read());
        let diy_bank = Arc::clone(&self.diy_bank.read());

        let Some(baseline) = self.capture_baseline(&task, &request, captured, &config).await else {
            self.log("error", &format!("[!] {} {}: no baseline response, giving up", task.method, task.url));
            self.finish(&task, ScanPhase::Error);
            return;
        };
        if task.is_cancelled() {
            self.finish(&task, ScanPhase::ManuallyStopped);
            return;
        }
        task.advance(ScanPhase::BaselineCaptured);

        let budget = Duration::from_millis(config.regex_budget_ms);
        let body: Arc<str> = Arc::from(baseline.body.as_str());
        let baseline_has_error = config.error_enabled
            && self.error_bank.find_within(Arc::clone(&body), budget).await.is_some();
        let baseline_has_diy_match = diy_bank.find_within(body, budget).await.is_some();
        if baseline_has_error {
            debug!("scan #{}: baseline already shows a database error", task.id);
        }

        let strategies = enabled_strategies(&config);
        let ctx = Arc::new(ProbeContext {
            task: Arc::clone(&task),
            request,
            params,
            baseline,
            config,
            transport: Arc::clone(&self.transport),
            throttle: Arc::clone(&self.throttle),
            error_bank: Arc::clone(&self.error_bank),
            diy_bank,
            baseline_has_error,
            baseline_has_diy_match,
        });

        task.advance(ScanPhase::StrategiesDispatched);
        let mut handles = Vec::with_capacity(strategies.len());
        for strategy in strategies {
            let ctx = Arc::clone(&ctx);
            let shared = Arc::clone(&self);
            let handle = self
                .scan_pool
                .execute(async move {
                    let record = |hit: Hit| shared.record_hit(&ctx.task, hit);
                    run_strategy(strategy.as_ref(), &ctx, &record).await;
                })
                .await;
            handles.push(handle);
        }

        tokio::spawn(async move {
            let total = handles.len();
            let phase_label = format!("scan #{} strategies", task.id);
            let mut failed = 0;
            for (done, handle) in handles.into_iter().enumerate() {
                if !handle.wait().await {
                    failed += 1;
                }
                if let Some(sink) = &self.sink {
                    sink.on_progress(&phase_label, done + 1, total);
                }
            }
            if failed > 0 {
                error!("scan #{}: {} of {} strategies panicked", task.id, failed, total);
                self.log("error", &format!("[!] scan #{}: {} of {} strategies crashed", task.id, failed, total));
            }
            let phase = if task.is_cancelled() {
                ScanPhase::ManuallyStopped
            } else if total > 0 && failed == total {
                ScanPhase::Error
            } else {
                ScanPhase::Completed
            };
            self.finish(&task, phase);
        });
    }

    /// Replays the untouched request; falls back to the captured response.
    async fn capture_baseline(
        &self,
        task: &ScanTask,
        request: &HttpRequest,
        captured: Option<HttpResponse>,
        config: &DetectionConfig,
    ) -> Option<HttpResponse> {
        let budget = Duration::from_millis(config.attempt_timeout_ms);
        match tokio::time::timeout(budget, self.transport.send(request)).await {
            Ok(Ok(response)) => {
                self.throttle.record_status(response.status);
                Some(response)
            }
            Ok(Err(e)) => {
                warn!("scan #{}: baseline request failed: {}", task.id, e);
                self.log("warn", &format!("[!] {} {}: baseline request failed: {}", task.method, task.url, e));
                captured
            }
            Err(_) => {
                warn!("scan #{}: baseline request exceeded {:?}", task.id, budget);
                self.log("warn", &format!("[!] {} {}: baseline request timed out", task.method, task.url));
                captured
            }
        }
    }

    fn log(&self, level: &str, message: &str) {
        if let Some(sink) = &self.sink {
            sink.on_log(level, message);
        }
    }

    fn record_hit(&self, task: &ScanTask, hit: Hit) {
        let builder = Finding::builder(
            &task.signature,
            &hit.parameter,
            hit.param_index,
            &hit.payload,
            hit.tag,
        )
        .confidence(hit.confidence)
        .evidence(hit.evidence)
        .response(&hit.request, &hit.response);
        let exchange = self.exchanges.retain(Exchange::new(hit.request, Some(hit.response)));
        let stored = self.index.append(builder.exchange(exchange).build());

        task.record_finding(hit.param_index, &hit.parameter, hit.tag);
        info!(
            "{} in parameter {} of {} {} (payload {:?})",
            hit.tag, hit.parameter, task.method, task.url, hit.payload
        );
        if let Some(sink) = &self.sink {
            sink.on_finding(&stored);
        }
    }

    /// Moves a task to its terminal phase exactly once.
    fn finish(&self, task: &Arc<ScanTask>, phase: ScanPhase) {
        if self.active.lock().remove(&task.id).is_none() {
            return;
        }
        task.advance(phase);
        if task.phase() == ScanPhase::Error {
            // let the family be picked up again by later traffic
            self.families.forget(&task.signature);
        }
        self.stats.record_finished(task);

        let markers = task.markers();
        info!(
            "scan #{} {} {} finished: {:?}, {} finding(s)",
            task.id,
            task.method,
            task.url,
            task.phase(),
            task.finding_count()
        );
        if let Some(sink) = &self.sink {
            sink.on_scan_finished(task, &markers);
        }
        self.idle.notify_waiters();
    }
}
