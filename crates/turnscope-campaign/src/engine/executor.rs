//! Turn execution
//!
//! One turn: send the message to the target with a fresh trace id, have the
//! judge score the exchange, and diagnose every failing metric against the
//! turn's trace. The executor never returns an error; whatever goes wrong is
//! recorded on the returned turn.

use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use turnscope_trace::{analyze, correlate, CorrelationConfig, EvaluationOutcome, TraceAnalysis};
use uuid::Uuid;

use super::cache::TraceCache;
use crate::client::{
    generate_trace_id, ClientError, EvaluationRequest, Judge, TargetClient, TargetReply, TargetRequest,
    TraceStore,
};
use crate::config::EngineConfig;
use crate::contracts::{Campaign, CampaignKind, Turn, TurnStatus};
use crate::telemetry::CampaignMetricsRegistry;

/// Trace id used when the target never echoed one
const UNTRACED: &str = "untraced";

/// Retry settings for the target and the tracing store
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub trace_fetch_max_attempts: u32,
    pub trace_fetch_initial_backoff: Duration,
    pub trace_fetch_max_backoff: Duration,
    pub trace_fetch_backoff_multiplier: f64,
    pub target_max_retries: u32,
    pub target_retry_backoff: Duration,
}

impl From<&EngineConfig> for RetryPolicy {
    fn from(config: &EngineConfig) -> Self {
        Self {
            trace_fetch_max_attempts: config.trace_fetch_max_attempts.max(1),
            trace_fetch_initial_backoff: Duration::from_millis(config.trace_fetch_initial_backoff_ms),
            trace_fetch_max_backoff: Duration::from_millis(config.trace_fetch_max_backoff_ms),
            trace_fetch_backoff_multiplier: config.trace_fetch_backoff_multiplier,
            target_max_retries: config.target_max_retries,
            target_retry_backoff: Duration::from_millis(config.target_retry_backoff_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl RetryPolicy {
    /// Delay before trace fetch attempt `attempt` (1-based)
    fn trace_backoff(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = self
            .trace_fetch_backoff_multiplier
            .max(1.0)
            .powi(attempt.saturating_sub(2) as i32);
        let millis = self.trace_fetch_initial_backoff.as_millis() as f64 * factor;
        Duration::from_millis(millis as u64).min(self.trace_fetch_max_backoff)
    }
}

/// What a turn needs to know about its campaign
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub campaign_id: Uuid,
    pub kind: CampaignKind,
    pub persona_type: Option<String>,
    pub attack_type: Option<String>,
    pub target_url: String,
    pub session_id: Option<String>,
    pub turn_timeout: Duration,
    /// Correlation settings current when the turn was scheduled
    pub correlation: Arc<CorrelationConfig>,
}

impl TurnContext {
    pub fn for_campaign(campaign: &Campaign, correlation: Arc<CorrelationConfig>) -> Self {
        Self {
            campaign_id: campaign.id,
            kind: campaign.kind,
            persona_type: campaign.persona_type.clone(),
            attack_type: campaign.attack_type.clone(),
            target_url: campaign.target_url.clone(),
            session_id: Some(campaign.session_id.clone()),
            turn_timeout: Duration::from_secs(campaign.config.turn_timeout_seconds),
            correlation,
        }
    }
}

/// Runs single turns against the collaborators
pub struct TurnExecutor {
    target: Arc<dyn TargetClient>,
    trace_store: Arc<dyn TraceStore>,
    judge: Arc<dyn Judge>,
    cache: Arc<TraceCache>,
    policy: RetryPolicy,
    metrics: Arc<CampaignMetricsRegistry>,
}

impl TurnExecutor {
    pub fn new(
        target: Arc<dyn TargetClient>,
        trace_store: Arc<dyn TraceStore>,
        judge: Arc<dyn Judge>,
        cache: Arc<TraceCache>,
        policy: RetryPolicy,
        metrics: Arc<CampaignMetricsRegistry>,
    ) -> Self {
        Self {
            target,
            trace_store,
            judge,
            cache,
            policy,
            metrics,
        }
    }

    pub fn cache(&self) -> &Arc<TraceCache> {
        &self.cache
    }

    /// Drive a pending or running turn to a terminal status
    pub async fn execute(&self, mut turn: Turn, ctx: &TurnContext) -> Turn {
        let metrics = self.metrics.campaign();
        let _timer = metrics.start_turn(ctx.kind.as_str());

        // the orchestrator hands over turns it already marked running
        if turn.status != TurnStatus::Running {
            if let Err(e) = turn.start() {
                warn!(
                    campaign_id = %ctx.campaign_id,
                    turn_number = turn.turn_number,
                    error = %e,
                    "Turn could not be started"
                );
                return turn;
            }
        }
        debug!(campaign_id = %ctx.campaign_id, turn_number = turn.turn_number, "Turn started");

        self.run(&mut turn, ctx).await;

        metrics.record_turn(ctx.kind.as_str(), turn.status.as_str());
        info!(
            campaign_id = %ctx.campaign_id,
            turn_number = turn.turn_number,
            status = turn.status.as_str(),
            trace_id = turn.trace_id.as_deref().unwrap_or(""),
            retries = turn.retry_count,
            "Turn finished"
        );
        turn
    }

    async fn run(&self, turn: &mut Turn, ctx: &TurnContext) {
        let request = TargetRequest {
            target_url: ctx.target_url.clone(),
            message: turn.user_message.clone(),
            session_id: ctx.session_id.clone(),
            trace_id: generate_trace_id(),
        };

        let retries = AtomicU32::new(0);
        let exchange = tokio::time::timeout(ctx.turn_timeout, self.exchange(&request, &retries)).await;
        turn.retry_count = retries.load(Ordering::Relaxed);

        let reply = match exchange {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                warn!(turn_number = turn.turn_number, error = %e, "Target request failed");
                settle(turn.fail(format!("target request failed: {}", e)));
                return;
            }
            Err(_) => {
                warn!(
                    turn_number = turn.turn_number,
                    timeout_secs = ctx.turn_timeout.as_secs(),
                    "Target did not answer in time"
                );
                settle(turn.time_out(format!(
                    "target did not answer within {}s",
                    ctx.turn_timeout.as_secs()
                )));
                return;
            }
        };

        turn.system_response = Some(reply.text.clone());
        turn.trace_id = reply.trace_id.clone();

        let evaluation = EvaluationRequest {
            turn_reference: turn.reference(),
            user_message: turn.user_message.clone(),
            system_response: reply.text,
            context: json!({
                "campaign_id": ctx.campaign_id,
                "turn_number": turn.turn_number,
                "campaign_kind": ctx.kind.as_str(),
                "persona_type": ctx.persona_type,
                "attack_type": ctx.attack_type,
                "trace_id": turn.trace_id,
            }),
        };

        let mut outcomes = match self.judge.evaluate(&evaluation).await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                warn!(turn_number = turn.turn_number, error = %e, "Judge evaluation failed");
                settle(turn.fail(format!("judge evaluation failed: {}", e)));
                return;
            }
        };
        let reference = turn.reference();
        for outcome in &mut outcomes {
            outcome.turn_reference = reference.clone();
        }

        let failing: Vec<&EvaluationOutcome> = outcomes.iter().filter(|o| !o.passed).collect();
        if failing.is_empty() {
            settle(turn.complete(outcomes));
            return;
        }

        let analysis = self.analysis_for(turn.trace_id.as_deref()).await;
        let metrics = self.metrics.campaign();
        let root_causes: Vec<_> = failing
            .into_iter()
            .map(|outcome| {
                let root_cause = correlate(outcome, &analysis, &ctx.correlation);
                metrics.record_root_cause(
                    root_cause.primary.correlation_type.as_str(),
                    root_cause.primary.confidence,
                );
                debug!(
                    turn_number = turn.turn_number,
                    metric = %outcome.metric_name,
                    primary = %root_cause.primary.correlation_type,
                    confidence = root_cause.primary.confidence,
                    "Root cause diagnosed"
                );
                root_cause
            })
            .collect();

        settle(turn.fail_evaluation(outcomes, root_causes));
    }

    /// Send with retries on transient errors
    async fn exchange(&self, request: &TargetRequest, retries: &AtomicU32) -> Result<TargetReply, ClientError> {
        let mut attempt = 0u32;
        loop {
            match self.target.send(request).await {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_transient() && attempt < self.policy.target_max_retries => {
                    attempt += 1;
                    retries.store(attempt, Ordering::Relaxed);
                    debug!(attempt, error = %e, "Retrying target request");
                    tokio::time::sleep(self.policy.target_retry_backoff * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Analysis of the turn's trace, or an empty one when the trace cannot be had
    async fn analysis_for(&self, trace_id: Option<&str>) -> Arc<TraceAnalysis> {
        let Some(trace_id) = trace_id else {
            debug!("Target echoed no trace id, diagnosing without spans");
            return Arc::new(TraceAnalysis::empty(UNTRACED));
        };

        match self
            .cache
            .get_or_fetch(trace_id, || self.fetch_analysis(trace_id))
            .await
        {
            Some(analysis) => analysis,
            None => {
                warn!(trace_id, "Trace unavailable, diagnosing without spans");
                Arc::new(TraceAnalysis::empty(trace_id))
            }
        }
    }

    async fn fetch_analysis(&self, trace_id: &str) -> Option<TraceAnalysis> {
        let metrics = self.metrics.campaign();
        let attempts = self.policy.trace_fetch_max_attempts;

        for attempt in 1..=attempts {
            let delay = self.policy.trace_backoff(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match self.trace_store.fetch_trace(trace_id).await {
                Ok(Some(segments)) => match analyze(trace_id, &segments) {
                    Ok(analysis) => {
                        metrics.record_trace_fetch("found");
                        return Some(analysis);
                    }
                    Err(e) => {
                        metrics.record_trace_fetch("not_found");
                        debug!(trace_id, attempt, error = %e, "Trace has no usable spans yet");
                    }
                },
                Ok(None) => {
                    metrics.record_trace_fetch("not_found");
                    debug!(trace_id, attempt, "Trace not yet available");
                }
                Err(e) if e.is_transient() => {
                    metrics.record_trace_fetch("error");
                    debug!(trace_id, attempt, error = %e, "Trace fetch failed");
                }
                Err(e) => {
                    metrics.record_trace_fetch("error");
                    warn!(trace_id, error = %e, "Trace fetch rejected");
                    return None;
                }
            }
        }
        None
    }
}

/// Terminal transitions only fail on a turn that was never started
fn settle(result: crate::error::Result<()>) {
    if let Err(e) = result {
        warn!(error = %e, "Turn transition rejected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MockJudge, MockTraceStore};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use turnscope_trace::{CorrelationType, RawSegment};

    const TRACE_ID: &str = "1-5f84c7a1-0123456789abcdef01234567";

    /// Replays a fixed sequence of replies
    struct ScriptedTarget {
        replies: Mutex<Vec<Result<TargetReply, ClientError>>>,
        delay: Duration,
    }

    impl ScriptedTarget {
        fn new(replies: Vec<Result<TargetReply, ClientError>>) -> Self {
            Self {
                replies: Mutex::new(replies),
                delay: Duration::ZERO,
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                replies: Mutex::new(vec![Ok(reply(Some(TRACE_ID)))]),
                delay,
            }
        }
    }

    #[async_trait]
    impl TargetClient for ScriptedTarget {
        async fn send(&self, _request: &TargetRequest) -> Result<TargetReply, ClientError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let mut replies = self.replies.lock().unwrap();
            if replies.len() > 1 {
                replies.remove(0)
            } else {
                replies[0].clone()
            }
        }
    }

    fn reply(trace_id: Option<&str>) -> TargetReply {
        TargetReply {
            text: "Your order ships tomorrow.".to_string(),
            trace_id: trace_id.map(str::to_string),
        }
    }

    fn context() -> TurnContext {
        TurnContext {
            campaign_id: Uuid::new_v4(),
            kind: CampaignKind::Persona,
            persona_type: Some("impatient".to_string()),
            attack_type: None,
            target_url: "http://target.local/chat".to_string(),
            session_id: Some("s-1".to_string()),
            turn_timeout: Duration::from_secs(5),
            correlation: Arc::new(CorrelationConfig::default()),
        }
    }

    fn pending(ctx: &TurnContext) -> Turn {
        Turn::pending(ctx.campaign_id, 1, "where is my order?")
    }

    fn outcome(metric: &str, score: f64) -> EvaluationOutcome {
        let mut outcome = EvaluationOutcome::failing("", metric, score, 0.5, "judge says so");
        outcome.passed = score >= 0.5;
        outcome
    }

    fn slow_tool_trace() -> Vec<RawSegment> {
        vec![RawSegment::new(json!({
            "id": "root",
            "name": "api",
            "start_time": 0.0,
            "end_time": 1.0,
            "subsegments": [
                {"id": "tool", "name": "inventory_tool", "start_time": 0.05, "end_time": 1.0}
            ]
        }))]
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            trace_fetch_max_attempts: 3,
            trace_fetch_initial_backoff: Duration::from_millis(10),
            trace_fetch_max_backoff: Duration::from_millis(40),
            trace_fetch_backoff_multiplier: 2.0,
            target_max_retries: 1,
            target_retry_backoff: Duration::from_millis(10),
        }
    }

    fn executor(target: ScriptedTarget, store: MockTraceStore, judge: MockJudge) -> TurnExecutor {
        TurnExecutor::new(
            Arc::new(target),
            Arc::new(store),
            Arc::new(judge),
            Arc::new(TraceCache::new(16)),
            policy(),
            Arc::new(CampaignMetricsRegistry::new().unwrap()),
        )
    }

    #[tokio::test]
    async fn test_passing_turn_completes_without_fetching_trace() {
        let mut store = MockTraceStore::new();
        store.expect_fetch_trace().never();
        let mut judge = MockJudge::new();
        judge
            .expect_evaluate()
            .times(1)
            .returning(|_| Ok(vec![outcome("accuracy", 0.9)]));

        let ctx = context();
        let executor = executor(ScriptedTarget::new(vec![Ok(reply(Some(TRACE_ID)))]), store, judge);
        let turn = executor.execute(pending(&ctx), &ctx).await;

        assert_eq!(turn.status, TurnStatus::Completed);
        assert_eq!(turn.trace_id.as_deref(), Some(TRACE_ID));
        assert_eq!(turn.system_response.as_deref(), Some("Your order ships tomorrow."));
        assert_eq!(turn.evaluations[0].turn_reference, turn.reference());
        assert!(turn.root_causes.is_empty());
    }

    #[tokio::test]
    async fn test_failing_metric_is_diagnosed_from_trace() {
        let mut store = MockTraceStore::new();
        store
            .expect_fetch_trace()
            .withf(|id| id == TRACE_ID)
            .times(1)
            .returning(|_| Ok(Some(slow_tool_trace())));
        let mut judge = MockJudge::new();
        judge
            .expect_evaluate()
            .returning(|_| Ok(vec![outcome("accuracy", 0.9), outcome("latency_score", 0.2)]));

        let ctx = context();
        let executor = executor(ScriptedTarget::new(vec![Ok(reply(Some(TRACE_ID)))]), store, judge);
        let turn = executor.execute(pending(&ctx), &ctx).await;

        assert_eq!(turn.status, TurnStatus::Failed);
        assert_eq!(turn.evaluations.len(), 2);
        assert_eq!(turn.root_causes.len(), 1);
        let primary = &turn.root_causes[0].primary;
        assert_eq!(primary.correlation_type, CorrelationType::LatencyBottleneck);
        assert_eq!(primary.evidence_span_ids, vec!["tool".to_string()]);
        // 95% of the trace
        assert!((primary.confidence - 0.89375).abs() < 1e-6);
        assert!(executor.cache().get(TRACE_ID).is_some());
    }

    #[tokio::test]
    async fn test_running_turn_is_not_restarted() {
        let mut judge = MockJudge::new();
        judge
            .expect_evaluate()
            .times(1)
            .returning(|_| Ok(vec![outcome("accuracy", 0.9)]));

        let ctx = context();
        let executor = executor(ScriptedTarget::new(vec![Ok(reply(Some(TRACE_ID)))]), MockTraceStore::new(), judge);
        let mut running = pending(&ctx);
        running.start().unwrap();
        let started_at = running.started_at;

        let turn = executor.execute(running, &ctx).await;
        assert_eq!(turn.status, TurnStatus::Completed);
        assert_eq!(turn.started_at, started_at);
    }

    #[tokio::test]
    async fn test_finished_turn_is_returned_untouched() {
        let mut judge = MockJudge::new();
        judge.expect_evaluate().never();

        let ctx = context();
        let executor = executor(ScriptedTarget::new(vec![]), MockTraceStore::new(), judge);
        let mut finished = pending(&ctx);
        finished.start().unwrap();
        finished.fail("earlier failure").unwrap();

        let turn = executor.execute(finished.clone(), &ctx).await;
        assert_eq!(turn, finished);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trace_fetch_retries_until_available() {
        let mut store = MockTraceStore::new();
        let mut seq = mockall::Sequence::new();
        store
            .expect_fetch_trace()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Ok(None));
        store
            .expect_fetch_trace()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(slow_tool_trace())));
        let mut judge = MockJudge::new();
        judge
            .expect_evaluate()
            .returning(|_| Ok(vec![outcome("latency_score", 0.1)]));

        let ctx = context();
        let executor = executor(ScriptedTarget::new(vec![Ok(reply(Some(TRACE_ID)))]), store, judge);
        let turn = executor.execute(pending(&ctx), &ctx).await;

        assert_eq!(
            turn.root_causes[0].primary.correlation_type,
            CorrelationType::LatencyBottleneck
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_trace_yields_insufficient_evidence() {
        let mut store = MockTraceStore::new();
        store.expect_fetch_trace().times(3).returning(|_| Ok(None));
        let mut judge = MockJudge::new();
        judge
            .expect_evaluate()
            .returning(|_| Ok(vec![outcome("helpfulness", 0.2)]));

        let ctx = context();
        let executor = executor(ScriptedTarget::new(vec![Ok(reply(Some(TRACE_ID)))]), store, judge);
        let turn = executor.execute(pending(&ctx), &ctx).await;

        assert_eq!(turn.status, TurnStatus::Failed);
        assert!(turn.root_causes[0].insufficient_evidence());
        assert!(executor.cache().get(TRACE_ID).is_none());
    }

    #[tokio::test]
    async fn test_missing_trace_id_skips_store() {
        let mut store = MockTraceStore::new();
        store.expect_fetch_trace().never();
        let mut judge = MockJudge::new();
        judge
            .expect_evaluate()
            .returning(|_| Ok(vec![outcome("helpfulness", 0.2)]));

        let ctx = context();
        let executor = executor(ScriptedTarget::new(vec![Ok(reply(None))]), store, judge);
        let turn = executor.execute(pending(&ctx), &ctx).await;

        assert_eq!(turn.trace_id, None);
        assert_eq!(
            turn.root_causes[0].primary.correlation_type,
            CorrelationType::Unknown
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_target_error_is_retried() {
        let mut judge = MockJudge::new();
        judge.expect_evaluate().returning(|_| Ok(Vec::new()));

        let ctx = context();
        let target = ScriptedTarget::new(vec![
            Err(ClientError::Server {
                status: 503,
                message: "busy".to_string(),
            }),
            Ok(reply(None)),
        ]);
        let executor = executor(target, MockTraceStore::new(), judge);
        let turn = executor.execute(pending(&ctx), &ctx).await;

        assert_eq!(turn.status, TurnStatus::Completed);
        assert_eq!(turn.retry_count, 1);
    }

    #[tokio::test]
    async fn test_permanent_target_error_fails_turn() {
        let mut judge = MockJudge::new();
        judge.expect_evaluate().never();

        let ctx = context();
        let target = ScriptedTarget::new(vec![Err(ClientError::Server {
            status: 400,
            message: "bad request".to_string(),
        })]);
        let executor = executor(target, MockTraceStore::new(), judge);
        let turn = executor.execute(pending(&ctx), &ctx).await;

        assert_eq!(turn.status, TurnStatus::Failed);
        assert_eq!(turn.retry_count, 0);
        assert!(turn.error.as_deref().unwrap().contains("target request failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_target_times_out() {
        let mut judge = MockJudge::new();
        judge.expect_evaluate().never();

        let ctx = context();
        let executor = executor(
            ScriptedTarget::slow(Duration::from_secs(60)),
            MockTraceStore::new(),
            judge,
        );
        let turn = executor.execute(pending(&ctx), &ctx).await;

        assert_eq!(turn.status, TurnStatus::TimedOut);
        assert!(turn.error.is_some());
        assert!(turn.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_judge_failure_fails_turn() {
        let mut judge = MockJudge::new();
        judge
            .expect_evaluate()
            .returning(|_| Err(ClientError::Network("connection refused".to_string())));

        let ctx = context();
        let executor = executor(
            ScriptedTarget::new(vec![Ok(reply(Some(TRACE_ID)))]),
            MockTraceStore::new(),
            judge,
        );
        let turn = executor.execute(pending(&ctx), &ctx).await;

        assert_eq!(turn.status, TurnStatus::Failed);
        assert!(turn.error.as_deref().unwrap().contains("judge"));
        assert_eq!(turn.system_response.as_deref(), Some("Your order ships tomorrow."));
    }

    #[test]
    fn test_trace_backoff_is_capped() {
        let policy = policy();
        assert_eq!(policy.trace_backoff(1), Duration::ZERO);
        assert_eq!(policy.trace_backoff(2), Duration::from_millis(10));
        assert_eq!(policy.trace_backoff(3), Duration::from_millis(20));
        assert_eq!(policy.trace_backoff(5), Duration::from_millis(40));
    }
}
