//! Differential detection strategies.
//!
//! Each strategy mutates one parameter at a time (addressed by its index in
//! the request's original parameter list), replays the request and compares
//! the answer against the untouched baseline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::core::compare::format_percent;
use crate::core::mutator::{mutate_request, Parameter};
use crate::core::state::ScanTask;
use crate::core::throttle::Throttle;
use crate::core::{is_numeric, StrategyTag};
use crate::error::DetectionError;
use crate::http::{HttpRequest, HttpResponse, HttpTransport};
use crate::utils::detector::SignatureBank;
use crate::utils::payload_loader::{
    BOOLEAN_PAIRS, ERROR_SUFFIXES, NUMERIC_PAIR, ORDER_PAIR, STRING_PAIR,
};
use crate::DetectionConfig;

static SORT_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^[a-z_][a-z0-9_.]*(\s+(asc|desc))?$").unwrap());

/// Placeholder a DIY payload may use to embed the original value.
pub const VALUE_PLACEHOLDER: &str = "{value}";

/// A confirmed divergence, before it is turned into a stored finding.
#[derive(Debug, Clone)]
pub struct Hit {
    pub param_index: usize,
    pub parameter: String,
    pub payload: String,
    pub tag: StrategyTag,
    pub confidence: f64,
    pub evidence: String,
    pub request: HttpRequest,
    pub response: HttpResponse,
}

/// Everything a strategy needs to probe one admitted request.
pub struct ProbeContext {
    pub task: Arc<ScanTask>,
    pub request: HttpRequest,
    pub params: Vec<Parameter>,
    pub baseline: HttpResponse,
    pub config: Arc<DetectionConfig>,
    pub transport: Arc<dyn HttpTransport>,
    pub throttle: Arc<Throttle>,
    pub error_bank: Arc<SignatureBank>,
    pub diy_bank: Arc<SignatureBank>,
    /// The baseline already shows a database error; error probing is moot.
    pub baseline_has_error: bool,
    /// The baseline already matches a DIY pattern.
    pub baseline_has_diy_match: bool,
}

impl ProbeContext {
    pub fn attempt_budget(&self) -> Duration {
        Duration::from_millis(self.config.attempt_timeout_ms)
    }

    pub fn regex_budget(&self) -> Duration {
        Duration::from_millis(self.config.regex_budget_ms)
    }

    fn param(&self, index: usize) -> Result<&Parameter, DetectionError> {
        self.params.get(index).ok_or(DetectionError::ParameterIndex(index))
    }

    /// Sends one mutated request, paced by the throttle and bounded by the
    /// attempt budget.
    pub async fn attempt(
        &self,
        index: usize,
        value: &str,
    ) -> Result<(HttpRequest, HttpResponse), DetectionError> {
        if self.task.is_cancelled() {
            return Err(DetectionError::Cancelled);
        }
        let mutated = mutate_request(&self.request, &self.params, index, value)
            .ok_or(DetectionError::ParameterIndex(index))?;

        self.throttle.pace().await;
        let budget = self.attempt_budget();
        let response = tokio::time::timeout(budget, self.transport.send(&mutated))
            .await
            .map_err(|_| DetectionError::AttemptTimeout(budget))??;
        self.throttle.record_status(response.status);
        Ok((mutated, response))
    }

    /// Like [`attempt`](Self::attempt), but a failed attempt is logged and
    /// skipped. Only cancellation propagates.
    async fn attempt_or_skip(
        &self,
        tag: StrategyTag,
        index: usize,
        value: &str,
    ) -> Result<Option<(HttpRequest, HttpResponse)>, DetectionError> {
        match self.attempt(index, value).await {
            Ok(exchange) => Ok(Some(exchange)),
            Err(DetectionError::Cancelled) => Err(DetectionError::Cancelled),
            Err(e) => {
                let name = self.params.get(index).map_or("?", |p| p.name.as_str());
                warn!("scan #{} {:?} on {}: attempt skipped: {}", self.task.id, tag, name, e);
                Ok(None)
            }
        }
    }

    /// Similarity of two bodies; `None` when the pair cannot be scored.
    fn similar(&self, a: &str, b: &str, pocs: (&str, &str)) -> Option<f64> {
        match self
            .config
            .metric
            .average_similarity(a, b, Some(pocs), self.config.html_aware)
        {
            Ok(score) => Some(score),
            Err(e) => {
                let e = DetectionError::from(e);
                warn!("scan #{}: scored as not vulnerable: {}", self.task.id, e);
                None
            }
        }
    }

    fn is_similar(&self, score: f64) -> bool {
        score >= self.config.similarity_threshold
    }

    /// Runs a `(control, probe)` pair and flags when the control matches the
    /// baseline while the probe diverges from it.
    async fn differential_pair(
        &self,
        tag: StrategyTag,
        index: usize,
        control_suffix: &str,
        probe_suffix: &str,
    ) -> Result<Option<Hit>, DetectionError> {
        let param = self.param(index)?;
        let control_value = format!("{}{}", param.value, control_suffix);
        let probe_value = format!("{}{}", param.value, probe_suffix);

        let Some((_, control)) = self.attempt_or_skip(tag, index, &control_value).await? else {
            return Ok(None);
        };
        let Some((probe_req, probe)) = self.attempt_or_skip(tag, index, &probe_value).await? else {
            return Ok(None);
        };

        let body = &self.baseline.body;
        let Some(control_score) = self.similar(body, &control.body, ("", control_suffix)) else {
            return Ok(None);
        };
        let Some(probe_score) = self.similar(body, &probe.body, ("", probe_suffix)) else {
            return Ok(None);
        };
        debug!(
            "scan #{} {:?} {}: control {} probe {}",
            self.task.id, tag, param.name, control_score, probe_score
        );

        if self.is_similar(control_score) && !self.is_similar(probe_score) {
            return Ok(Some(Hit {
                param_index: index,
                parameter: param.name.clone(),
                payload: probe_value,
                tag,
                confidence: control_score - probe_score,
                evidence: format!(
                    "{:?} keeps {} of the baseline, {:?} keeps {}",
                    control_suffix,
                    format_percent(control_score),
                    probe_suffix,
                    format_percent(probe_score)
                ),
                request: probe_req,
                response: probe,
            }));
        }
        Ok(None)
    }
}

#[async_trait]
pub trait DetectionStrategy: Send + Sync {
    fn tag(&self) -> StrategyTag;

    /// Whether the parameter is worth probing with this strategy.
    fn applies_to(&self, _param: &Parameter) -> bool {
        true
    }

    /// Probes the parameter at `index`; at most one hit per parameter.
    async fn probe(&self, ctx: &ProbeContext, index: usize) -> Result<Option<Hit>, DetectionError>;
}

/// Syntax breakers matched against the vendor error bank.
pub struct ErrorBased;

#[async_trait]
impl DetectionStrategy for ErrorBased {
    fn tag(&self) -> StrategyTag {
        StrategyTag::Error
    }

    async fn probe(&self, ctx: &ProbeContext, index: usize) -> Result<Option<Hit>, DetectionError> {
        if ctx.baseline_has_error {
            return Ok(None);
        }
        let param = ctx.param(index)?;
        for suffix in ERROR_SUFFIXES {
            let payload = format!("{}{}", param.value, suffix);
            let Some((request, response)) = ctx.attempt_or_skip(self.tag(), index, &payload).await?
            else {
                continue;
            };
            let body: Arc<str> = Arc::from(response.body.as_str());
            if let Some(found) = ctx.error_bank.find_within(body, ctx.regex_budget()).await {
                return Ok(Some(Hit {
                    param_index: index,
                    parameter: param.name.clone(),
                    payload,
                    tag: self.tag(),
                    confidence: 0.95,
                    evidence: format!("{} error: {}", found.label, found.snippet),
                    request,
                    response,
                }));
            }
        }
        Ok(None)
    }
}

/// A lone quote breaks the page, an escaped quote restores it.
pub struct StringBased;

#[async_trait]
impl DetectionStrategy for StringBased {
    fn tag(&self) -> StrategyTag {
        StrategyTag::String
    }

    async fn probe(&self, ctx: &ProbeContext, index: usize) -> Result<Option<Hit>, DetectionError> {
        let (breaks, repairs) = STRING_PAIR;
        ctx.differential_pair(self.tag(), index, repairs, breaks).await
    }
}

/// `v-0` evaluates to the same row, `v-1` to another.
pub struct NumericBased;

#[async_trait]
impl DetectionStrategy for NumericBased {
    fn tag(&self) -> StrategyTag {
        StrategyTag::Numeric
    }

    fn applies_to(&self, param: &Parameter) -> bool {
        is_numeric(&param.value)
    }

    async fn probe(&self, ctx: &ProbeContext, index: usize) -> Result<Option<Hit>, DetectionError> {
        let (neutral, shifting) = NUMERIC_PAIR;
        ctx.differential_pair(self.tag(), index, neutral, shifting).await
    }
}

/// An extra valid sort column is harmless, an out-of-range one is not.
pub struct OrderBased;

#[async_trait]
impl DetectionStrategy for OrderBased {
    fn tag(&self) -> StrategyTag {
        StrategyTag::Order
    }

    fn applies_to(&self, param: &Parameter) -> bool {
        SORT_KEY.is_match(&param.value) || is_numeric(&param.value)
    }

    async fn probe(&self, ctx: &ProbeContext, index: usize) -> Result<Option<Hit>, DetectionError> {
        let (valid, invalid) = ORDER_PAIR;
        ctx.differential_pair(self.tag(), index, valid, invalid).await
    }
}

/// A true condition matches the baseline, a false one diverges from the true one.
pub struct BooleanBased;

#[async_trait]
impl DetectionStrategy for BooleanBased {
    fn tag(&self) -> StrategyTag {
        StrategyTag::Boolean
    }

    async fn probe(&self, ctx: &ProbeContext, index: usize) -> Result<Option<Hit>, DetectionError> {
        let param = ctx.param(index)?;
        for (i, (truthy, falsy)) in BOOLEAN_PAIRS.iter().enumerate() {
            // the unquoted pair only makes sense in a numeric context
            if i > 0 && !is_numeric(&param.value) {
                continue;
            }
            let true_value = format!("{}{}", param.value, truthy);
            let false_value = format!("{}{}", param.value, falsy);

            let Some((true_req, true_resp)) =
                ctx.attempt_or_skip(self.tag(), index, &true_value).await?
            else {
                continue;
            };
            let Some((_, false_resp)) = ctx.attempt_or_skip(self.tag(), index, &false_value).await?
            else {
                continue;
            };

            let Some(true_score) = ctx.similar(&ctx.baseline.body, &true_resp.body, ("", truthy))
            else {
                continue;
            };
            let Some(split_score) = ctx.similar(&true_resp.body, &false_resp.body, (truthy, falsy))
            else {
                continue;
            };

            if ctx.is_similar(true_score) && !ctx.is_similar(split_score) {
                return Ok(Some(Hit {
                    param_index: index,
                    parameter: param.name.clone(),
                    payload: true_value,
                    tag: self.tag(),
                    confidence: true_score - split_score,
                    evidence: format!(
                        "true condition keeps {} of the baseline, false condition keeps {} of the true one",
                        format_percent(true_score),
                        format_percent(split_score)
                    ),
                    request: true_req,
                    response: true_resp,
                }));
            }
        }
        Ok(None)
    }
}

/// User payloads, flagged by a custom pattern, a delay, or a similarity drop.
pub struct DiyBased;

impl DiyBased {
    pub fn render(payload: &str, original: &str) -> String {
        if payload.contains(VALUE_PLACEHOLDER) {
            payload.replace(VALUE_PLACEHOLDER, original)
        } else {
            format!("{}{}", original, payload)
        }
    }

    async fn judge(
        &self,
        ctx: &ProbeContext,
        index: usize,
        payload: &str,
        response: &HttpResponse,
    ) -> Result<Option<(f64, String)>, DetectionError> {
        let config = &ctx.config;

        if !ctx.baseline_has_diy_match {
            let body: Arc<str> = Arc::from(response.body.as_str());
            if let Some(found) = ctx.diy_bank.find_within(body, ctx.regex_budget()).await {
                return Ok(Some((0.9, format!("pattern {} matched: {}", found.pattern, found.snippet))));
            }
        }

        if config.diy_delay_threshold_ms > 0 {
            let limit = ctx.baseline.elapsed + Duration::from_millis(config.diy_delay_threshold_ms);
            if response.elapsed > limit {
                // one slow answer can be jitter; require the delay twice
                if let Some((_, again)) = ctx.attempt_or_skip(self.tag(), index, payload).await? {
                    if again.elapsed > limit {
                        return Ok(Some((
                            0.85,
                            format!(
                                "answered in {}ms and {}ms against a {}ms baseline",
                                response.elapsed.as_millis(),
                                again.elapsed.as_millis(),
                                ctx.baseline.elapsed.as_millis()
                            ),
                        )));
                    }
                }
            }
        }

        if config.diy_similarity_check {
            let injected = payload.strip_prefix(ctx.param(index)?.value.as_str()).unwrap_or(payload);
            if let Some(score) = ctx.similar(&ctx.baseline.body, &response.body, ("", injected)) {
                if !ctx.is_similar(score) {
                    return Ok(Some((
                        1.0 - score,
                        format!("response keeps {} of the baseline", format_percent(score)),
                    )));
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl DetectionStrategy for DiyBased {
    fn tag(&self) -> StrategyTag {
        StrategyTag::Diy
    }

    async fn probe(&self, ctx: &ProbeContext, index: usize) -> Result<Option<Hit>, DetectionError> {
        let param = ctx.param(index)?;
        for raw in &ctx.config.diy_payloads {
            let payload = Self::render(raw, &param.value);
            let Some((request, response)) = ctx.attempt_or_skip(self.tag(), index, &payload).await?
            else {
                continue;
            };
            if let Some((confidence, evidence)) = self.judge(ctx, index, &payload, &response).await? {
                return Ok(Some(Hit {
                    param_index: index,
                    parameter: param.name.clone(),
                    payload,
                    tag: self.tag(),
                    confidence,
                    evidence,
                    request,
                    response,
                }));
            }
        }
        Ok(None)
    }
}

/// Strategies switched on in `config`, in marker order.
pub fn enabled_strategies(config: &DetectionConfig) -> Vec<Arc<dyn DetectionStrategy>> {
    let mut strategies: Vec<Arc<dyn DetectionStrategy>> = Vec::new();
    for tag in StrategyTag::ALL {
        if !config.is_enabled(tag) {
            continue;
        }
        let strategy: Arc<dyn DetectionStrategy> = match tag {
            StrategyTag::Error => Arc::new(ErrorBased),
            StrategyTag::String => Arc::new(StringBased),
            StrategyTag::Numeric => Arc::new(NumericBased),
            StrategyTag::Order => Arc::new(OrderBased),
            StrategyTag::Boolean => Arc::new(BooleanBased),
            StrategyTag::Diy => {
                if config.diy_payloads.is_empty() {
                    continue;
                }
                Arc::new(DiyBased)
            }
        };
        strategies.push(strategy);
    }
    strategies
}

/// Runs one strategy over every applicable parameter, handing hits to
/// `on_hit` as they are confirmed. Errors stay contained to the parameter
/// they happened on; cancellation ends the run.
pub async fn run_strategy(
    strategy: &dyn DetectionStrategy,
    ctx: &ProbeContext,
    on_hit: &(dyn Fn(Hit) + Send + Sync),
) {
    for (index, param) in ctx.params.iter().enumerate() {
        if ctx.task.is_cancelled() {
            debug!("scan #{} {:?}: stopped", ctx.task.id, strategy.tag());
            return;
        }
        if !strategy.applies_to(param) {
            continue;
        }
        ctx.task.mark_tested(index, &param.name);
        match strategy.probe(ctx, index).await {
            Ok(Some(hit)) => on_hit(hit),
            Ok(None) => {}
            Err(DetectionError::Cancelled) => {
                debug!("scan #{} {:?}: stopped", ctx.task.id, strategy.tag());
                return;
            }
            Err(e) => warn!(
                "scan #{} {:?} on {}: {}",
                ctx.task.id,
                strategy.tag(),
                param.name,
                e
            ),
        }
    }
}
