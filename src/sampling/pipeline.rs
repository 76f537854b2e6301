//! Count, sample and analyze orchestration
//!
//! A [`SamplingPipeline`] owns at most one live run. Each run counts the
//! namespace, opens a sample stream piped into the analyzer, and turns the
//! resulting events into [`SamplingState`] transitions. Every event carries
//! the id of the run it was issued for; events for a run that is no longer
//! live are dropped, so a stopped run can never touch the state of the next
//! one.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use super::config::{DEFAULT_MAX_TIME_MS, DEFAULT_SAMPLE_SIZE, SamplingConfig};
use super::error::{ErrorInfo, FailureKind, SamplingError, SamplingResult};
use super::progress::{ProgressTracker, compute_percent, format_elapsed, number_of_samples};
use super::state::{Progress, SamplingPhase, SamplingState};
use crate::inference::{Schema, SchemaAnalyzer};
use crate::store::{CountOptions, DataStore, Filter, Namespace, ReadPreference, SampleOptions};
use crate::stream::StreamCloser;

/// Parameters of one sampling run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplingRequest {
    pub namespace: Namespace,
    pub filter: Filter,
    pub max_time_ms: u64,
    pub sample_size: u64,
    pub read_preference: ReadPreference,
}

impl SamplingRequest {
    /// Request for every record of `namespace` with default limits
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            filter: serde_json::json!({}),
            max_time_ms: DEFAULT_MAX_TIME_MS,
            sample_size: DEFAULT_SAMPLE_SIZE,
            read_preference: ReadPreference::default(),
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_max_time_ms(mut self, max_time_ms: u64) -> Self {
        self.max_time_ms = max_time_ms;
        self
    }

    pub fn with_sample_size(mut self, sample_size: u64) -> Self {
        self.sample_size = sample_size;
        self
    }

    pub fn with_read_preference(mut self, read_preference: ReadPreference) -> Self {
        self.read_preference = read_preference;
        self
    }

    /// Check the request can be issued
    pub fn validate(&self) -> SamplingResult<()> {
        if self.sample_size == 0 {
            return Err(SamplingError::InvalidArgument(
                "sample size must be greater than zero".to_string(),
            ));
        }
        if !self.namespace.has_collection() {
            return Err(SamplingError::InvalidNamespace(format!(
                "'{}' does not name a collection",
                self.namespace
            )));
        }
        Ok(())
    }
}

/// The currently live count/sample/analyze chain
struct RunHandle {
    id: Uuid,
    tracker: ProgressTracker,
    num_samples: u64,
    sample_count: u64,
    schema: Option<Schema>,
    stream: Option<StreamCloser>,
    tasks: Vec<AbortHandle>,
}

impl RunHandle {
    fn new(id: Uuid) -> Self {
        Self {
            id,
            tracker: ProgressTracker::start(),
            num_samples: 0,
            sample_count: 0,
            schema: None,
            stream: None,
            tasks: Vec::new(),
        }
    }

    fn teardown(self) {
        debug!(run_id = %self.id, tasks = self.tasks.len(), "Tearing down sampling run");
        if let Some(stream) = self.stream {
            stream.close();
        }
        for task in self.tasks {
            task.abort();
        }
    }
}

struct Shared {
    state: SamplingState,
    run: Option<RunHandle>,
    max_time_ms: u64,
}

impl Shared {
    fn live_run(&mut self, run_id: Uuid) -> Option<&mut RunHandle> {
        self.run.as_mut().filter(|run| run.id == run_id)
    }
}

struct Inner {
    store: Arc<dyn DataStore>,
    analyzer: Arc<dyn SchemaAnalyzer>,
    config: SamplingConfig,
    shared: Mutex<Shared>,
    updates: broadcast::Sender<SamplingState>,
}

/// Sampling subsystem for one data store
///
/// Cloning yields another handle to the same pipeline. Dropping the last
/// handle tears down any live run.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use schema_sampler::inference::DocumentAnalyzer;
/// use schema_sampler::sampling::{SamplingConfig, SamplingPhase, SamplingPipeline};
/// use schema_sampler::store::{MemoryStore, Namespace};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = MemoryStore::new();
/// let ns = Namespace::new("shop", "orders");
/// store.insert(&ns, vec![serde_json::json!({"total": 12})]);
///
/// let pipeline = SamplingPipeline::new(
///     Arc::new(store),
///     Arc::new(DocumentAnalyzer::new()),
///     SamplingConfig::default(),
/// );
/// let mut updates = pipeline.subscribe();
/// pipeline.start(pipeline.request(ns));
///
/// while let Ok(state) = updates.recv().await {
///     if state.phase.is_terminal() {
///         assert_eq!(state.phase, SamplingPhase::Complete);
///         break;
///     }
/// }
/// # }
/// ```
#[derive(Clone)]
pub struct SamplingPipeline {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SamplingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SamplingPipeline")
            .field("state", &self.state())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl SamplingPipeline {
    /// Create an idle pipeline
    ///
    /// Zero sizes and intervals in `config` are raised to 1, the same way
    /// [`SamplingConfigBuilder`](super::config::SamplingConfigBuilder) clamps them.
    pub fn new(
        store: Arc<dyn DataStore>,
        analyzer: Arc<dyn SchemaAnalyzer>,
        config: SamplingConfig,
    ) -> Self {
        if let Err(e) = config.validate() {
            warn!(error = %e, hint = %e.user_message(), "Clamping sampling config");
        }
        let config = config.clamped();
        let (updates, _) = broadcast::channel(config.channel_capacity);
        let shared = Shared {
            state: SamplingState::initial(config.max_time_ms),
            run: None,
            max_time_ms: config.max_time_ms,
        };
        Self {
            inner: Arc::new(Inner {
                store,
                analyzer,
                config,
                shared: Mutex::new(shared),
                updates,
            }),
        }
    }

    /// Start a run for `request`
    ///
    /// Ignored while a run is in flight. Starting after a run has finished
    /// or been stopped first returns to `initial`. Returns immediately; the
    /// outcome is observed through [`state`](Self::state) or
    /// [`subscribe`](Self::subscribe). Must be called within a tokio runtime.
    pub fn start(&self, request: SamplingRequest) {
        if let Err(e) = request.validate() {
            warn!(error = %e, hint = %e.user_message(), "Ignoring invalid sampling request");
            return;
        }

        let run_id = Uuid::new_v4();
        let span = info_span!("sampling_run", run_id = %run_id, namespace = %request.namespace);
        let _enter = span.enter();

        let stale = {
            let mut shared = self.inner.lock();
            if shared.run.is_some() && shared.state.phase.is_active() {
                debug!(phase = %shared.state.phase, "Sampling already in progress, ignoring start");
                return;
            }
            let stale = shared.run.take();
            if shared.state.phase != SamplingPhase::Initial {
                let initial = SamplingState::initial(shared.max_time_ms);
                self.inner.publish(&mut shared, initial);
            }
            let advanced = self.inner.advance(&mut shared, SamplingPhase::Counting, |state| {
                state.progress = Progress::Indeterminate;
                state.elapsed_ms = 0;
                state.error = None;
                state.run_id = Some(run_id);
                state.started_at = Some(Utc::now());
            });
            if advanced {
                shared.run = Some(RunHandle::new(run_id));
            }
            stale
        };
        // closing waits for in-flight handlers, which take the shared lock
        if let Some(run) = stale {
            run.teardown();
        }
        if self.inner.lock().run.as_ref().map(|run| run.id) != Some(run_id) {
            return;
        }

        info!(
            sample_size = request.sample_size,
            max_time_ms = request.max_time_ms,
            "Sampling started"
        );

        let ticker = tokio::spawn(
            tick(
                Arc::downgrade(&self.inner),
                run_id,
                self.inner.config.tick_interval(),
            )
            .instrument(span.clone()),
        );
        self.inner.attach_task(run_id, ticker.abort_handle());

        let count = tokio::spawn(
            count_then_sample(
                Arc::downgrade(&self.inner),
                Arc::clone(&self.inner.store),
                run_id,
                request,
            )
            .instrument(span.clone()),
        );
        self.inner.attach_task(run_id, count.abort_handle());
    }

    /// Tear down the live run, leaving the phase as it is
    pub fn stop(&self) {
        let stale = {
            let mut shared = self.inner.lock();
            let run = shared.run.take();
            if let Some(run) = &run {
                info!(run_id = %run.id, phase = %shared.state.phase, "Sampling stopped");
            }
            run
        };
        if let Some(run) = stale {
            run.teardown();
        }
    }

    /// Stop and return to `initial`
    pub fn reset(&self) {
        let stale = {
            let mut shared = self.inner.lock();
            let run = shared.run.take();
            if let Some(run) = &run {
                info!(run_id = %run.id, phase = %shared.state.phase, "Sampling reset");
            }
            let initial = SamplingState::initial(shared.max_time_ms);
            if shared.state != initial {
                self.inner.publish(&mut shared, initial);
            }
            run
        };
        if let Some(run) = stale {
            run.teardown();
        }
    }

    /// Set the server-side time limit used by subsequent requests
    pub fn set_max_time_ms(&self, max_time_ms: u64) {
        let mut shared = self.inner.lock();
        shared.max_time_ms = max_time_ms;
        if shared.state.max_time_ms != max_time_ms {
            let mut state = shared.state.clone();
            state.max_time_ms = max_time_ms;
            self.inner.publish(&mut shared, state);
        }
    }

    /// Restore the configured time limit
    pub fn reset_max_time_ms(&self) {
        self.set_max_time_ms(self.inner.config.max_time_ms);
    }

    /// Request for `namespace` using the pipeline's current settings
    pub fn request(&self, namespace: Namespace) -> SamplingRequest {
        let max_time_ms = self.inner.lock().max_time_ms;
        SamplingRequest::new(namespace)
            .with_max_time_ms(max_time_ms)
            .with_sample_size(self.inner.config.sample_size)
            .with_read_preference(self.inner.config.read_preference)
    }

    /// React to the selected namespace changing
    ///
    /// Any live run is discarded. When `namespace` names a collection, a new
    /// run starts for it; a database-only namespace leaves the pipeline in
    /// `initial`.
    pub fn on_namespace_changed(&self, namespace: &str, filter: Filter) -> SamplingResult<()> {
        let namespace = Namespace::parse(namespace)?;
        if !namespace.has_collection() {
            debug!(namespace = %namespace, "Namespace has no collection, not sampling");
            return Ok(());
        }
        self.reset();
        self.start(self.request(namespace).with_filter(filter));
        Ok(())
    }

    /// Current state snapshot
    pub fn state(&self) -> SamplingState {
        self.inner.lock().state.clone()
    }

    /// Receive every subsequent state, in order
    ///
    /// A receiver that falls more than `channel_capacity` updates behind
    /// skips ahead; [`state`](Self::state) always has the latest value.
    pub fn subscribe(&self) -> broadcast::Receiver<SamplingState> {
        self.inner.updates.subscribe()
    }

    /// A run is live
    pub fn is_running(&self) -> bool {
        self.inner.lock().run.is_some()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        match self.shared.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Replace the state and notify subscribers
    fn publish(&self, shared: &mut Shared, state: SamplingState) {
        shared.state = state.clone();
        // no subscribers is fine
        let _ = self.updates.send(state);
    }

    /// Move to `next` if the phase machine allows it
    fn advance(
        &self,
        shared: &mut Shared,
        next: SamplingPhase,
        update: impl FnOnce(&mut SamplingState),
    ) -> bool {
        match shared.state.transition(next) {
            Ok(mut state) => {
                update(&mut state);
                self.publish(shared, state);
                true
            }
            Err(e) => {
                warn!(error = %e, "Refusing sampling state transition");
                false
            }
        }
    }

    fn attach_task(&self, run_id: Uuid, task: AbortHandle) {
        let mut shared = self.lock();
        match shared.live_run(run_id) {
            Some(run) => run.tasks.push(task),
            None => task.abort(),
        }
    }

    fn attach_stream(&self, run_id: Uuid, stream: StreamCloser) {
        let stale = {
            let mut shared = self.lock();
            match shared.live_run(run_id) {
                Some(run) => {
                    run.stream = Some(stream);
                    None
                }
                None => Some(stream),
            }
        };
        if let Some(stream) = stale {
            stream.close();
        }
    }

    /// Publish the elapsed time; `false` once the run is gone
    fn on_tick(&self, run_id: Uuid) -> bool {
        let mut shared = self.lock();
        let Some(run) = shared.live_run(run_id) else {
            return false;
        };
        let elapsed_ms = run.tracker.elapsed_ms();
        if shared.state.phase.is_active() && shared.state.elapsed_ms != elapsed_ms {
            let mut state = shared.state.clone();
            state.elapsed_ms = elapsed_ms;
            self.publish(&mut shared, state);
        }
        true
    }

    fn on_counted(self: &Arc<Self>, run_id: Uuid, request: &SamplingRequest, count: u64) {
        {
            let mut shared = self.lock();
            let Some(run) = shared.live_run(run_id) else {
                debug!(%run_id, "Ignoring count for stale run");
                return;
            };
            let num_samples = number_of_samples(count, request.sample_size);
            run.num_samples = num_samples;
            let elapsed_ms = run.tracker.elapsed_ms();
            debug!(count, num_samples, "Count resolved");

            let advanced = self.advance(&mut shared, SamplingPhase::Sampling, |state| {
                state.progress = Progress::Percent(0);
                state.elapsed_ms = elapsed_ms;
            });
            if !advanced {
                return;
            }
        }

        match self.open_streams(run_id, request) {
            Ok(stream) => self.attach_stream(run_id, stream),
            Err(e) => self.fail(run_id, FailureKind::SampleStreamFailure, e.to_string()),
        }
    }

    /// Open the sample stream, pipe it into the analyzer and drive it
    fn open_streams(
        self: &Arc<Self>,
        run_id: Uuid,
        request: &SamplingRequest,
    ) -> SamplingResult<StreamCloser> {
        let options = SampleOptions {
            max_time_ms: request.max_time_ms,
            filter: request.filter.clone(),
            size: request.sample_size,
            read_preference: request.read_preference,
        };
        let mut samples = self.store.sample(&request.namespace, &options);
        let inner = Arc::downgrade(self);
        samples.on_error(move |e| {
            if let Some(inner) = inner.upgrade() {
                inner.fail(run_id, FailureKind::SampleStreamFailure, e.to_string());
            }
        })?;

        let mut analysis = samples.pipe(self.analyzer.as_ref(), self.config.channel_capacity);
        let inner = Arc::downgrade(self);
        analysis.on_progress(move || {
            if let Some(inner) = inner.upgrade() {
                inner.on_analyzer_progress(run_id);
            }
        })?;
        let inner = Arc::downgrade(self);
        analysis.on_data(move |schema| {
            if let Some(inner) = inner.upgrade() {
                inner.on_analyzer_data(run_id, schema);
            }
        })?;
        let inner = Arc::downgrade(self);
        analysis.on_error(move |e| {
            if let Some(inner) = inner.upgrade() {
                inner.fail(run_id, FailureKind::AnalysisFailure, e.to_string());
            }
        })?;
        let inner = Arc::downgrade(self);
        analysis.on_end(move || {
            if let Some(inner) = inner.upgrade() {
                inner.on_analyzer_end(run_id);
            }
        })?;
        Ok(analysis.spawn())
    }

    fn on_analyzer_progress(&self, run_id: Uuid) {
        let mut shared = self.lock();
        let Some(run) = shared.live_run(run_id) else {
            debug!(%run_id, "Ignoring analyzer progress for stale run");
            return;
        };
        run.sample_count += 1;
        let processed = i64::try_from(run.sample_count).unwrap_or(i64::MAX);
        let wanted = i64::try_from(run.num_samples).unwrap_or(i64::MAX);
        let elapsed_ms = run.tracker.elapsed_ms();

        let percent = match compute_percent(processed, wanted) {
            Ok(percent) => Progress::Percent(percent),
            Err(e) => {
                warn!(error = %e, "Could not compute sampling progress");
                return;
            }
        };

        let phase = shared.state.phase;
        match phase {
            SamplingPhase::Sampling => {
                self.advance(&mut shared, SamplingPhase::Analyzing, |state| {
                    state.progress = state.progress.max(percent);
                    state.elapsed_ms = elapsed_ms;
                });
            }
            SamplingPhase::Analyzing if percent > shared.state.progress => {
                let mut state = shared.state.clone();
                state.progress = percent;
                state.elapsed_ms = elapsed_ms;
                self.publish(&mut shared, state);
            }
            _ => {}
        }
    }

    fn on_analyzer_data(&self, run_id: Uuid, schema: Schema) {
        let mut shared = self.lock();
        match shared.live_run(run_id) {
            Some(run) => run.schema = Some(schema),
            None => debug!(%run_id, "Ignoring schema for stale run"),
        }
    }

    fn on_analyzer_end(&self, run_id: Uuid) {
        let mut shared = self.lock();
        if shared.state.phase == SamplingPhase::Error {
            return;
        }
        let Some(run) = shared.live_run(run_id) else {
            debug!(%run_id, "Ignoring end of stale run");
            return;
        };

        if run.num_samples > 0 && run.sample_count == 0 {
            let num_samples = run.num_samples;
            drop(shared);
            self.fail(
                run_id,
                FailureKind::EmptyResultAnomaly,
                format!("sample stream ended without records, expected {num_samples}"),
            );
            return;
        }

        let schema = run.schema.take().unwrap_or_default();
        let elapsed_ms = run.tracker.elapsed_ms();
        let sample_count = run.sample_count;
        self.advance(&mut shared, SamplingPhase::Complete, |state| {
            state.progress = Progress::Percent(100);
            state.elapsed_ms = elapsed_ms;
            state.schema = Some(schema);
        });
        info!(
            %run_id,
            sample_count,
            elapsed = %format_elapsed(elapsed_ms),
            "Sampling completed"
        );
        let finished = shared.run.take();
        drop(shared);
        if let Some(run) = finished {
            run.teardown();
        }
    }

    /// End the run in the `error` phase
    fn fail(&self, run_id: Uuid, kind: FailureKind, message: String) {
        let mut shared = self.lock();
        let Some(run) = shared.live_run(run_id) else {
            debug!(%run_id, kind = %kind, "Ignoring failure of stale run");
            return;
        };
        let elapsed_ms = run.tracker.elapsed_ms();
        error!(
            %run_id,
            kind = %kind,
            error = %message,
            elapsed = %format_elapsed(elapsed_ms),
            "Sampling failed"
        );
        self.advance(&mut shared, SamplingPhase::Error, |state| {
            state.elapsed_ms = elapsed_ms;
            state.error = Some(ErrorInfo::new(kind, message));
        });
        let failed = shared.run.take();
        drop(shared);
        if let Some(run) = failed {
            run.teardown();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let shared = match self.shared.get_mut() {
            Ok(shared) => shared,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(run) = shared.run.take() {
            run.teardown();
        }
    }
}

async fn tick(inner: Weak<Inner>, run_id: Uuid, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if !inner.on_tick(run_id) {
            return;
        }
    }
}

async fn count_then_sample(
    inner: Weak<Inner>,
    store: Arc<dyn DataStore>,
    run_id: Uuid,
    request: SamplingRequest,
) {
    let options = CountOptions {
        max_time_ms: request.max_time_ms,
        read_preference: request.read_preference,
    };
    let counted = store
        .count(&request.namespace, &request.filter, &options)
        .await;
    let Some(inner) = inner.upgrade() else {
        return;
    };
    match counted {
        Ok(count) => inner.on_counted(run_id, &request, count),
        Err(e) => inner.fail(run_id, FailureKind::CountFailure, e.to_string()),
    }
}
