//! Campaign orchestration
//!
//! One driver task per running campaign keeps up to `max_concurrent_turns`
//! turns in flight. Turn results come back to the driver over a `JoinSet`, so
//! the campaign counters have a single writer. Every change is persisted
//! before the next decision is made.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use turnscope_trace::CorrelationConfig;
use uuid::Uuid;

use super::executor::{RetryPolicy, TurnContext, TurnExecutor};
use super::{MessageSource, NeverStop, ScriptedMessages, StopCondition, StopOnFailures, TraceCache};
use crate::client::{Judge, TargetClient, TraceStore};
use crate::config::{EngineConfig, Snapshot};
use crate::contracts::{Campaign, CampaignReport, CampaignRequest, CampaignStatus, Turn};
use crate::error::{CampaignError, Result};
use crate::store::{CampaignStore, MemoryStore, StoreError};
use crate::telemetry::CampaignMetricsRegistry;

type DriverFuture = Shared<BoxFuture<'static, Result<Campaign>>>;

/// State shared between a campaign's driver runs
struct RunControl {
    pause_requested: AtomicBool,
    /// Number the next scheduled turn receives
    next_turn: AtomicU32,
    source: StdMutex<Box<dyn MessageSource>>,
    stop: Box<dyn StopCondition>,
    /// Unused part of the campaign timeout, carried across pauses
    remaining: StdMutex<Duration>,
}

struct RunHandle {
    control: Arc<RunControl>,
    driver: Option<DriverFuture>,
}

/// Why the driver stopped scheduling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    Exhausted,
    Stopped,
    Paused,
    TimedOut,
}

enum Next {
    Turn(Turn),
    Finish(Finish),
}

struct Inner {
    config: EngineConfig,
    store: Arc<dyn CampaignStore>,
    executor: Arc<TurnExecutor>,
    correlation: Snapshot<CorrelationConfig>,
    admission: Arc<Semaphore>,
    runs: Mutex<HashMap<Uuid, RunHandle>>,
    metrics: Arc<CampaignMetricsRegistry>,
}

/// Creates, runs, pauses and reports on campaigns
#[derive(Clone)]
pub struct CampaignOrchestrator {
    inner: Arc<Inner>,
}

impl CampaignOrchestrator {
    pub fn builder(config: EngineConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> Arc<CampaignMetricsRegistry> {
        Arc::clone(&self.inner.metrics)
    }

    /// Register a campaign whose turns use the request's scripted messages
    pub async fn create_campaign(&self, request: CampaignRequest) -> Result<Campaign> {
        let source = Box::new(ScriptedMessages::new(request.messages.clone()));
        let stop: Box<dyn StopCondition> = match request.stop_after_failures {
            Some(failures) => Box::new(StopOnFailures(failures)),
            None => Box::new(NeverStop),
        };
        self.create_campaign_with(request, source, stop).await
    }

    /// Register a campaign with its own message source and stop rule
    pub async fn create_campaign_with(
        &self,
        request: CampaignRequest,
        source: Box<dyn MessageSource>,
        stop: Box<dyn StopCondition>,
    ) -> Result<Campaign> {
        request.validate()?;
        let config = request
            .config
            .clone()
            .unwrap_or_else(|| self.inner.config.default_campaign_config());
        config.validate()?;

        let campaign = Campaign::from_request(&request, config);
        self.inner.store.save_campaign(&campaign).await?;

        let control = Arc::new(RunControl {
            pause_requested: AtomicBool::new(false),
            next_turn: AtomicU32::new(1),
            source: StdMutex::new(source),
            stop,
            remaining: StdMutex::new(self.inner.config.campaign_timeout()),
        });
        self.inner.runs.lock().await.insert(
            campaign.id,
            RunHandle {
                control,
                driver: None,
            },
        );

        info!(
            campaign_id = %campaign.id,
            kind = campaign.kind.as_str(),
            max_turns = campaign.config.max_turns,
            "Campaign created"
        );
        Ok(campaign)
    }

    /// Begin running a created campaign; returns once it is `running`
    pub async fn start(&self, id: Uuid) -> Result<Campaign> {
        self.launch(id, CampaignStatus::Created).await
    }

    /// Continue a paused campaign; turn numbering carries on
    pub async fn resume(&self, id: Uuid) -> Result<Campaign> {
        self.launch(id, CampaignStatus::Paused).await
    }

    /// Stop scheduling, let in-flight turns finish and return the paused campaign
    pub async fn pause(&self, id: Uuid) -> Result<Campaign> {
        let driver = {
            let runs = self.inner.runs.lock().await;
            let run = runs.get(&id).ok_or(CampaignError::NotFound(id))?;
            let campaign = self.load(id).await?;
            if campaign.status != CampaignStatus::Running {
                return Err(CampaignError::invalid_transition(
                    campaign.status,
                    CampaignStatus::Paused,
                ));
            }
            run.control.pause_requested.store(true, Ordering::SeqCst);
            run.driver.clone()
        };
        info!(campaign_id = %id, "Pause requested");

        match driver {
            Some(driver) => driver.await,
            None => self.load(id).await,
        }
    }

    /// Wait for the current run to stop and return the campaign
    pub async fn wait(&self, id: Uuid) -> Result<Campaign> {
        let driver = {
            let runs = self.inner.runs.lock().await;
            let run = runs.get(&id).ok_or(CampaignError::NotFound(id))?;
            run.driver.clone()
        };
        match driver {
            Some(driver) => driver.await,
            None => self.load(id).await,
        }
    }

    pub async fn campaign(&self, id: Uuid) -> Result<Campaign> {
        self.load(id).await
    }

    /// Turns recorded so far, by turn number
    pub async fn turns(&self, id: Uuid) -> Result<Vec<Turn>> {
        self.load(id).await?;
        Ok(self.inner.store.list_turns(id).await?)
    }

    pub async fn report(&self, id: Uuid) -> Result<CampaignReport> {
        let campaign = self.load(id).await?;
        let turns = self.inner.store.list_turns(id).await?;
        Ok(CampaignReport::build(campaign, &turns))
    }

    /// Publish new correlation settings; turns already running keep theirs
    pub fn reload_correlation_config(&self, config: CorrelationConfig) {
        info!(
            reporting_threshold = config.reporting_threshold,
            "Correlation configuration reloaded"
        );
        self.inner.correlation.store(config);
    }

    pub fn correlation_config(&self) -> Arc<CorrelationConfig> {
        self.inner.correlation.load()
    }

    async fn load(&self, id: Uuid) -> Result<Campaign> {
        match self.inner.store.load_campaign(id).await {
            Ok(campaign) => Ok(campaign),
            Err(StoreError::NotFound(_)) => Err(CampaignError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn launch(&self, id: Uuid, expected: CampaignStatus) -> Result<Campaign> {
        let mut runs = self.inner.runs.lock().await;
        let run = runs.get_mut(&id).ok_or(CampaignError::NotFound(id))?;

        let mut campaign = self.load(id).await?;
        if campaign.status != expected {
            return Err(CampaignError::invalid_transition(
                campaign.status,
                CampaignStatus::Running,
            ));
        }

        let permit = Arc::clone(&self.inner.admission)
            .try_acquire_owned()
            .map_err(|_| {
                CampaignError::AdmissionRejected(format!(
                    "{} campaigns already running",
                    self.inner.config.max_concurrent_campaigns
                ))
            })?;

        campaign.transition(CampaignStatus::Running)?;
        self.inner.store.save_campaign(&campaign).await?;
        run.control.pause_requested.store(false, Ordering::SeqCst);

        let handle = tokio::spawn(drive(
            Arc::clone(&self.inner),
            campaign.clone(),
            Arc::clone(&run.control),
            permit,
        ));
        let driver: DriverFuture = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(CampaignError::internal(format!("campaign driver aborted: {}", e))),
            }
        }
        .boxed()
        .shared();
        run.driver = Some(driver);

        info!(campaign_id = %id, from = expected.as_str(), "Campaign running");
        Ok(campaign)
    }
}

async fn drive(
    inner: Arc<Inner>,
    mut campaign: Campaign,
    control: Arc<RunControl>,
    permit: OwnedSemaphorePermit,
) -> Result<Campaign> {
    let metrics = Arc::clone(&inner.metrics);
    metrics.campaign().inc_campaigns_active();

    let result = run_turns(&inner, &mut campaign, &control).await;

    metrics.campaign().dec_campaigns_active();
    drop(permit);
    result
}

async fn run_turns(inner: &Inner, campaign: &mut Campaign, control: &RunControl) -> Result<Campaign> {
    let budget = *control.remaining.lock().unwrap_or_else(|e| e.into_inner());
    let started = tokio::time::Instant::now();
    let deadline = started + budget;
    let max_in_flight = campaign.config.max_concurrent_turns.max(1);

    let mut in_flight: JoinSet<Turn> = JoinSet::new();
    let mut finish: Option<Finish> = None;
    let mut storage_error: Option<StoreError> = None;

    loop {
        while finish.is_none() && storage_error.is_none() && in_flight.len() < max_in_flight {
            let mut turn = match next_turn(campaign, control) {
                Next::Turn(turn) => turn,
                Next::Finish(reason) => {
                    finish = Some(reason);
                    break;
                }
            };
            if let Err(e) = inner.store.save_turn(&turn).await {
                storage_error = Some(e);
                break;
            }
            campaign.stats.turns_total += 1;
            turn.start()?;
            if let Err(e) = inner.store.save_turn(&turn).await {
                storage_error = Some(e);
                break;
            }
            debug!(campaign_id = %campaign.id, turn_number = turn.turn_number, "Turn scheduled");

            let ctx = TurnContext::for_campaign(campaign, inner.correlation.load());
            let executor = Arc::clone(&inner.executor);
            in_flight.spawn(async move { executor.execute(turn, &ctx).await });
        }

        if in_flight.is_empty() {
            break;
        }

        tokio::select! {
            joined = in_flight.join_next() => match joined {
                Some(Ok(turn)) => {
                    campaign.stats.record(&turn);
                    campaign.updated_at = chrono::Utc::now();
                    let saved = match inner.store.save_turn(&turn).await {
                        Ok(()) => inner.store.save_campaign(campaign).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = saved {
                        storage_error.get_or_insert(e);
                    }
                }
                Some(Err(e)) => {
                    error!(campaign_id = %campaign.id, error = %e, "Turn task aborted");
                    campaign.stats.turns_failed += 1;
                }
                None => {}
            },
            _ = tokio::time::sleep_until(deadline), if finish != Some(Finish::TimedOut) => {
                warn!(campaign_id = %campaign.id, "Campaign timeout reached, draining in-flight turns");
                finish = Some(Finish::TimedOut);
            }
        }
    }

    {
        let mut remaining = control.remaining.lock().unwrap_or_else(|e| e.into_inner());
        *remaining = budget.saturating_sub(started.elapsed());
    }

    if let Some(e) = storage_error {
        error!(campaign_id = %campaign.id, error = %e, "Campaign storage failed");
        campaign.fail(format!("storage failure: {}", e))?;
        if let Err(save_error) = inner.store.save_campaign(campaign).await {
            warn!(campaign_id = %campaign.id, error = %save_error, "Could not persist failed campaign");
        }
        return Err(CampaignError::Storage(e));
    }

    match finish {
        Some(Finish::Paused) => campaign.transition(CampaignStatus::Paused)?,
        Some(Finish::TimedOut) => campaign.fail("campaign timed out")?,
        Some(Finish::Exhausted) | Some(Finish::Stopped) | None => {
            campaign.transition(CampaignStatus::Completed)?
        }
    }
    inner.store.save_campaign(campaign).await?;

    info!(
        campaign_id = %campaign.id,
        status = campaign.status.as_str(),
        reason = ?finish,
        turns_total = campaign.stats.turns_total,
        turns_completed = campaign.stats.turns_completed,
        turns_failed = campaign.stats.turns_failed,
        "Campaign run ended"
    );
    Ok(campaign.clone())
}

fn next_turn(campaign: &Campaign, control: &RunControl) -> Next {
    if control.pause_requested.load(Ordering::SeqCst) {
        return Next::Finish(Finish::Paused);
    }
    let number = control.next_turn.load(Ordering::SeqCst);
    if number > campaign.config.max_turns {
        return Next::Finish(Finish::Exhausted);
    }
    if control.stop.should_stop(&campaign.stats) {
        return Next::Finish(Finish::Stopped);
    }
    let message = {
        let mut source = control.source.lock().unwrap_or_else(|e| e.into_inner());
        source.next_message(number)
    };
    match message {
        Some(message) => {
            control.next_turn.store(number + 1, Ordering::SeqCst);
            Next::Turn(Turn::pending(campaign.id, number, message))
        }
        None => Next::Finish(Finish::Exhausted),
    }
}

/// Builder for `CampaignOrchestrator`
pub struct OrchestratorBuilder {
    config: EngineConfig,
    target: Option<Arc<dyn TargetClient>>,
    trace_store: Option<Arc<dyn TraceStore>>,
    judge: Option<Arc<dyn Judge>>,
    store: Option<Arc<dyn CampaignStore>>,
    metrics: Option<Arc<CampaignMetricsRegistry>>,
}

impl OrchestratorBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            target: None,
            trace_store: None,
            judge: None,
            store: None,
            metrics: None,
        }
    }

    pub fn target(mut self, target: Arc<dyn TargetClient>) -> Self {
        self.target = Some(target);
        self
    }

    pub fn trace_store(mut self, trace_store: Arc<dyn TraceStore>) -> Self {
        self.trace_store = Some(trace_store);
        self
    }

    pub fn judge(mut self, judge: Arc<dyn Judge>) -> Self {
        self.judge = Some(judge);
        self
    }

    /// Defaults to an in-memory store
    pub fn store(mut self, store: Arc<dyn CampaignStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn metrics(mut self, metrics: Arc<CampaignMetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<CampaignOrchestrator> {
        self.config.validate()?;
        let target = self
            .target
            .ok_or_else(|| CampaignError::invalid_config("a target client is required"))?;
        let trace_store = self
            .trace_store
            .ok_or_else(|| CampaignError::invalid_config("a trace store is required"))?;
        let judge = self
            .judge
            .ok_or_else(|| CampaignError::invalid_config("a judge is required"))?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn CampaignStore>);
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(CampaignMetricsRegistry::new()?),
        };

        let executor = TurnExecutor::new(
            target,
            trace_store,
            judge,
            Arc::new(TraceCache::new(self.config.trace_cache_capacity)),
            RetryPolicy::from(&self.config),
            Arc::clone(&metrics),
        );

        Ok(CampaignOrchestrator {
            inner: Arc::new(Inner {
                correlation: Snapshot::new(self.config.correlation_config()),
                admission: Arc::new(Semaphore::new(self.config.max_concurrent_campaigns)),
                config: self.config,
                store,
                executor: Arc::new(executor),
                runs: Mutex::new(HashMap::new()),
                metrics,
            }),
        })
    }
}
