//! Sampling pipeline tests

use std::sync::{Arc, Mutex};
use std::time::Duration;

use schema_sampler::inference::{DocumentAnalyzer, Schema, SchemaAnalyzer};
use schema_sampler::sampling::{
    FailureKind, Progress, SamplingConfig, SamplingPhase, SamplingPipeline, SamplingState,
};
use schema_sampler::store::{
    CountOptions, DataStore, Filter, MemoryStore, Namespace, Record, SampleOptions, StoreError,
};
use schema_sampler::stream::{CancellableStream, StreamEvent, StreamSender};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};

fn orders() -> Namespace {
    Namespace::new("shop", "orders")
}

fn config() -> SamplingConfig {
    SamplingConfig::builder()
        .sample_size(1000)
        .channel_capacity(4096)
        .build()
}

fn memory_store(records: usize) -> MemoryStore {
    let store = MemoryStore::new();
    store.insert(
        &orders(),
        (0..records).map(|i| json!({"_id": i, "total": i * 10, "paid": i % 3 == 0})),
    );
    store
}

fn pipeline_with(
    store: impl DataStore + 'static,
    analyzer: impl SchemaAnalyzer + 'static,
) -> SamplingPipeline {
    SamplingPipeline::new(Arc::new(store), Arc::new(analyzer), config())
}

/// Collect published states until a terminal phase
async fn run_to_end(updates: &mut broadcast::Receiver<SamplingState>) -> Vec<SamplingState> {
    let mut states = Vec::new();
    loop {
        let state = tokio::time::timeout(Duration::from_secs(30), updates.recv())
            .await
            .expect("run did not finish")
            .expect("update channel closed");
        let terminal = state.phase.is_terminal();
        states.push(state);
        if terminal {
            return states;
        }
    }
}

async fn wait_for(
    updates: &mut broadcast::Receiver<SamplingState>,
    phase: SamplingPhase,
) -> SamplingState {
    loop {
        let state = tokio::time::timeout(Duration::from_secs(30), updates.recv())
            .await
            .expect("phase never reached")
            .expect("update channel closed");
        if state.phase == phase {
            return state;
        }
    }
}

fn phases(states: &[SamplingState]) -> Vec<SamplingPhase> {
    let mut phases: Vec<SamplingPhase> = states.iter().map(|s| s.phase).collect();
    phases.dedup();
    phases
}

/// Store with a fixed count and a scripted sample stream
struct ScriptedStore {
    count: Result<u64, StoreError>,
    events: Vec<StreamEvent<Record>>,
}

#[async_trait::async_trait]
impl DataStore for ScriptedStore {
    async fn count(
        &self,
        _namespace: &Namespace,
        _filter: &Filter,
        _options: &CountOptions,
    ) -> Result<u64, StoreError> {
        self.count.clone()
    }

    fn sample(&self, _namespace: &Namespace, _options: &SampleOptions) -> CancellableStream<Record> {
        CancellableStream::from_events(self.events.clone())
    }
}

/// Analyzer whose events are sent by the test
#[derive(Default)]
struct ManualAnalyzer {
    senders: Mutex<Vec<StreamSender<Schema>>>,
    // held open so forwarding never fails
    inputs: Mutex<Vec<mpsc::Receiver<Record>>>,
}

impl ManualAnalyzer {
    fn sender(&self, run: usize) -> StreamSender<Schema> {
        self.senders.lock().unwrap()[run].clone()
    }

    fn runs(&self) -> usize {
        self.senders.lock().unwrap().len()
    }
}

impl SchemaAnalyzer for ManualAnalyzer {
    fn analyze(&self, records: mpsc::Receiver<Record>) -> CancellableStream<Schema> {
        let (sender, stream) = CancellableStream::channel(16);
        self.senders.lock().unwrap().push(sender);
        self.inputs.lock().unwrap().push(records);
        stream
    }
}

async fn wait_for_analyzer(analyzer: &ManualAnalyzer, runs: usize) {
    for _ in 0..1000 {
        if analyzer.runs() >= runs {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("analyzer was never opened");
}

mod completion_tests {
    use super::*;

    #[tokio::test]
    async fn test_fewer_records_than_requested() {
        let pipeline = pipeline_with(memory_store(500), DocumentAnalyzer::new());
        let mut updates = pipeline.subscribe();

        pipeline.start(pipeline.request(orders()));
        let states = run_to_end(&mut updates).await;

        assert_eq!(
            phases(&states),
            vec![
                SamplingPhase::Counting,
                SamplingPhase::Sampling,
                SamplingPhase::Analyzing,
                SamplingPhase::Complete,
            ]
        );
        let last = states.last().unwrap();
        assert_eq!(last.progress, Progress::Percent(100));
        let schema = last.schema.as_ref().unwrap();
        assert_eq!(schema.count, 500);
        assert_eq!(schema.field("total").unwrap().probability, 1.0);
        assert!(!pipeline.is_running());
    }

    #[tokio::test]
    async fn test_progress_never_decreases() {
        let pipeline = pipeline_with(memory_store(300), DocumentAnalyzer::new());
        let mut updates = pipeline.subscribe();

        pipeline.start(pipeline.request(orders()).with_sample_size(200));
        let states = run_to_end(&mut updates).await;

        let progress: Vec<Progress> = states
            .iter()
            .filter(|s| s.phase != SamplingPhase::Counting)
            .map(|s| s.progress)
            .collect();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
        assert_eq!(states[0].progress, Progress::Indeterminate);
        assert_eq!(states.last().unwrap().schema.as_ref().unwrap().count, 200);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_progress_strictly_increases() {
        let pipeline = pipeline_with(memory_store(2000), DocumentAnalyzer::new());
        let mut updates = pipeline.subscribe();

        pipeline.start(pipeline.request(orders()).with_sample_size(1000));
        let states = run_to_end(&mut updates).await;

        let analyzing: Vec<&SamplingState> = states
            .iter()
            .filter(|s| s.phase == SamplingPhase::Analyzing)
            .collect();
        assert!(!analyzing.is_empty());
        for pair in analyzing.windows(2) {
            assert!(
                pair[0].progress < pair[1].progress || pair[0].elapsed_ms != pair[1].elapsed_ms,
                "{:?} then {:?}",
                pair[0].progress,
                pair[1].progress
            );
        }
        let last = states.last().unwrap();
        assert_eq!(last.phase, SamplingPhase::Complete);
        assert_eq!(last.schema.as_ref().unwrap().count, 1000);
    }

    #[tokio::test]
    async fn test_empty_collection_completes() {
        let pipeline = pipeline_with(memory_store(0), DocumentAnalyzer::new());
        let mut updates = pipeline.subscribe();

        pipeline.start(pipeline.request(orders()));
        let states = run_to_end(&mut updates).await;

        assert_eq!(
            phases(&states),
            vec![
                SamplingPhase::Counting,
                SamplingPhase::Sampling,
                SamplingPhase::Complete,
            ]
        );
        let last = states.last().unwrap();
        assert_eq!(last.progress, Progress::Percent(100));
        assert_eq!(last.schema, Some(Schema::default()));
    }

    #[tokio::test]
    async fn test_filter_restricts_sample() {
        let pipeline = pipeline_with(memory_store(30), DocumentAnalyzer::new());
        let mut updates = pipeline.subscribe();

        pipeline.start(pipeline.request(orders()).with_filter(json!({"paid": true})));
        let states = run_to_end(&mut updates).await;

        let schema = states.last().unwrap().schema.clone().unwrap();
        assert_eq!(schema.count, 10);
    }

    #[tokio::test]
    async fn test_schema_only_in_complete_state() {
        let pipeline = pipeline_with(memory_store(20), DocumentAnalyzer::new());
        let mut updates = pipeline.subscribe();

        pipeline.start(pipeline.request(orders()));
        let states = run_to_end(&mut updates).await;

        for state in &states {
            assert_eq!(
                state.schema.is_some(),
                state.phase == SamplingPhase::Complete,
                "{:?}",
                state.phase
            );
        }
    }
}

mod failure_tests {
    use super::*;

    #[tokio::test]
    async fn test_count_failure() {
        let store = memory_store(10);
        store.fail_count(StoreError::Network("connection refused".to_string()));
        let pipeline = pipeline_with(store, DocumentAnalyzer::new());
        let mut updates = pipeline.subscribe();

        pipeline.start(pipeline.request(orders()));
        let states = run_to_end(&mut updates).await;

        assert_eq!(
            phases(&states),
            vec![SamplingPhase::Counting, SamplingPhase::Error]
        );
        let error = states.last().unwrap().error.clone().unwrap();
        assert_eq!(error.kind, FailureKind::CountFailure);
        assert!(error.message.contains("connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_count_timeout() {
        let store = memory_store(10).with_count_delay(Duration::from_secs(60));
        let pipeline = pipeline_with(store, DocumentAnalyzer::new());
        let mut updates = pipeline.subscribe();

        pipeline.start(pipeline.request(orders()).with_max_time_ms(100));
        let states = run_to_end(&mut updates).await;

        let error = states.last().unwrap().error.clone().unwrap();
        assert_eq!(error.kind, FailureKind::CountFailure);
        assert_eq!(error.message, StoreError::Timeout(100).to_string());
    }

    #[tokio::test]
    async fn test_sample_error_skips_analyzing() {
        let store = memory_store(10);
        store.fail_sample_after(0, StoreError::Cursor("cursor killed".to_string()));
        let pipeline = pipeline_with(store, DocumentAnalyzer::new());
        let mut updates = pipeline.subscribe();

        pipeline.start(pipeline.request(orders()));
        let states = run_to_end(&mut updates).await;

        assert_eq!(
            phases(&states),
            vec![
                SamplingPhase::Counting,
                SamplingPhase::Sampling,
                SamplingPhase::Error,
            ]
        );
        let error = states.last().unwrap().error.clone().unwrap();
        assert_eq!(error.kind, FailureKind::SampleStreamFailure);
        assert!(error.message.contains("cursor killed"));
    }

    #[tokio::test]
    async fn test_sample_error_mid_stream() {
        let store = memory_store(50);
        store.fail_sample_after(20, StoreError::Cursor("cursor killed".to_string()));
        let pipeline = pipeline_with(store, DocumentAnalyzer::new());
        let mut updates = pipeline.subscribe();

        pipeline.start(pipeline.request(orders()));
        let states = run_to_end(&mut updates).await;

        let last = states.last().unwrap();
        assert_eq!(last.phase, SamplingPhase::Error);
        assert_eq!(last.error.as_ref().unwrap().kind, FailureKind::SampleStreamFailure);

        // later analyzer events for the failed run change nothing
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pipeline.state(), *last);
    }

    #[tokio::test]
    async fn test_stream_ended_without_samples() {
        let store = ScriptedStore {
            count: Ok(10),
            events: Vec::new(),
        };
        let pipeline = pipeline_with(store, DocumentAnalyzer::new());
        let mut updates = pipeline.subscribe();

        pipeline.start(pipeline.request(orders()));
        let states = run_to_end(&mut updates).await;

        assert_eq!(
            phases(&states),
            vec![
                SamplingPhase::Counting,
                SamplingPhase::Sampling,
                SamplingPhase::Error,
            ]
        );
        let error = states.last().unwrap().error.clone().unwrap();
        assert_eq!(error.kind, FailureKind::EmptyResultAnomaly);
    }

    #[tokio::test]
    async fn test_analyzer_failure() {
        let store = ScriptedStore {
            count: Ok(2),
            events: vec![
                StreamEvent::Data(json!({"a": 1})),
                StreamEvent::Data(json!("not a document")),
            ],
        };
        let pipeline = pipeline_with(store, DocumentAnalyzer::new());
        let mut updates = pipeline.subscribe();

        pipeline.start(pipeline.request(orders()));
        let states = run_to_end(&mut updates).await;

        let last = states.last().unwrap();
        assert_eq!(last.phase, SamplingPhase::Error);
        assert_eq!(last.error.as_ref().unwrap().kind, FailureKind::AnalysisFailure);
        assert!(last.schema.is_none());
    }
}

mod lifecycle_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_start_while_busy_is_ignored() {
        let store = memory_store(10).with_count_delay(Duration::from_secs(5));
        let pipeline = pipeline_with(store, DocumentAnalyzer::new());
        let mut updates = pipeline.subscribe();

        pipeline.start(pipeline.request(orders()));
        let before = pipeline.state();
        assert_eq!(before.phase, SamplingPhase::Counting);

        pipeline.start(pipeline.request(Namespace::new("shop", "customers")));
        assert_eq!(pipeline.state(), before);

        let states = run_to_end(&mut updates).await;
        let counting = states
            .iter()
            .filter(|s| s.phase == SamplingPhase::Counting && s.elapsed_ms == 0)
            .count();
        assert_eq!(counting, 1);
        assert_eq!(states.last().unwrap().phase, SamplingPhase::Complete);
        assert_eq!(states.last().unwrap().run_id, before.run_id);
    }

    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let pipeline = pipeline_with(memory_store(5), DocumentAnalyzer::new());
        let mut updates = pipeline.subscribe();
        pipeline.start(pipeline.request(orders()));
        run_to_end(&mut updates).await;

        pipeline.reset();
        let once = pipeline.state();
        pipeline.reset();
        assert_eq!(pipeline.state(), once);
        assert_eq!(once.phase, SamplingPhase::Initial);
        assert!(once.schema.is_none());

        assert_eq!(updates.recv().await.unwrap().phase, SamplingPhase::Initial);
        assert!(matches!(
            updates.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_restart_after_complete() {
        let pipeline = pipeline_with(memory_store(5), DocumentAnalyzer::new());
        let mut updates = pipeline.subscribe();

        pipeline.start(pipeline.request(orders()));
        let first = run_to_end(&mut updates).await;

        pipeline.start(pipeline.request(orders()));
        let second = run_to_end(&mut updates).await;

        assert_eq!(second[0].phase, SamplingPhase::Initial);
        assert_eq!(second[1].phase, SamplingPhase::Counting);
        assert_eq!(second.last().unwrap().phase, SamplingPhase::Complete);
        assert_ne!(first.last().unwrap().run_id, second.last().unwrap().run_id);
    }

    #[tokio::test]
    async fn test_stop_ignores_late_events() {
        let analyzer = Arc::new(ManualAnalyzer::default());
        let store = ScriptedStore {
            count: Ok(3),
            events: vec![StreamEvent::Data(json!({"a": 1}))],
        };
        let pipeline = SamplingPipeline::new(Arc::new(store), analyzer.clone(), config());
        let mut updates = pipeline.subscribe();

        pipeline.start(pipeline.request(orders()));
        wait_for(&mut updates, SamplingPhase::Sampling).await;
        wait_for_analyzer(&analyzer, 1).await;

        let stale = analyzer.sender(0);
        assert!(stale.progress().await);
        let analyzing = wait_for(&mut updates, SamplingPhase::Analyzing).await;
        assert_eq!(analyzing.progress, Progress::Percent(34));

        pipeline.stop();
        assert!(!pipeline.is_running());
        let stopped = pipeline.state();
        assert_eq!(stopped.phase, SamplingPhase::Analyzing);

        // the torn-down stream may already refuse these
        let _ = stale.progress().await;
        let _ = stale.data(Schema::default()).await;
        drop(stale);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pipeline.state(), stopped);

        // a fresh run is unaffected by the stopped one
        pipeline.start(pipeline.request(orders()));
        assert_eq!(pipeline.state().phase, SamplingPhase::Counting);
        assert_ne!(pipeline.state().run_id, stopped.run_id);
        wait_for_analyzer(&analyzer, 2).await;

        let fresh = analyzer.sender(1);
        for _ in 0..3 {
            assert!(fresh.progress().await);
        }
        assert!(fresh.data(Schema { count: 3, fields: Vec::new() }).await);
        drop(fresh);
        analyzer.senders.lock().unwrap().clear();

        let complete = wait_for(&mut updates, SamplingPhase::Complete).await;
        assert_eq!(complete.progress, Progress::Percent(100));
        assert_eq!(complete.schema.unwrap().count, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_races_in_flight_events() {
        let pipeline = pipeline_with(memory_store(2000), DocumentAnalyzer::new());

        for i in 0..40u64 {
            pipeline.start(pipeline.request(orders()));
            tokio::time::sleep(Duration::from_micros(i * 50)).await;
            pipeline.stop();
            assert!(!pipeline.is_running());

            let stopped = pipeline.state();
            tokio::time::sleep(Duration::from_millis(2)).await;
            assert_eq!(pipeline.state(), stopped, "state changed after stop in round {i}");
        }

        pipeline.reset();
        assert_eq!(pipeline.state().phase, SamplingPhase::Initial);
        let mut updates = pipeline.subscribe();
        pipeline.start(pipeline.request(orders()));
        let states = run_to_end(&mut updates).await;

        assert_eq!(states[0].phase, SamplingPhase::Counting);
        let last = states.last().unwrap();
        assert_eq!(last.phase, SamplingPhase::Complete);
        assert_eq!(last.progress, Progress::Percent(100));
        assert_eq!(last.schema.as_ref().unwrap().count, 1000);
        assert!(states.iter().all(|s| s.run_id == last.run_id));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let pipeline = pipeline_with(memory_store(5), DocumentAnalyzer::new());
        pipeline.stop();
        pipeline.stop();
        assert_eq!(pipeline.state().phase, SamplingPhase::Initial);
        assert!(!pipeline.is_running());
    }

    #[tokio::test]
    async fn test_namespace_change_starts_run() {
        let pipeline = pipeline_with(memory_store(8), DocumentAnalyzer::new());
        let mut updates = pipeline.subscribe();

        pipeline.on_namespace_changed("shop", json!({})).unwrap();
        assert_eq!(pipeline.state().phase, SamplingPhase::Initial);

        pipeline.on_namespace_changed("shop.orders", json!({})).unwrap();
        let states = run_to_end(&mut updates).await;
        assert_eq!(states.last().unwrap().phase, SamplingPhase::Complete);
        assert_eq!(states.last().unwrap().schema.as_ref().unwrap().count, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_namespace_change_replaces_live_run() {
        let store = memory_store(4).with_record_delay(Duration::from_millis(100));
        let pipeline = pipeline_with(store, DocumentAnalyzer::new());
        let mut updates = pipeline.subscribe();

        pipeline.on_namespace_changed("shop.orders", json!({})).unwrap();
        let first = wait_for(&mut updates, SamplingPhase::Sampling).await;

        pipeline.on_namespace_changed("shop.orders", json!({"paid": true})).unwrap();
        let states = run_to_end(&mut updates).await;

        let last = states.last().unwrap();
        assert_eq!(last.phase, SamplingPhase::Complete);
        assert_ne!(last.run_id, first.run_id);
        // ids 0 and 3 are paid
        assert_eq!(last.schema.as_ref().unwrap().count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_time_ticks() {
        let store = memory_store(3).with_count_delay(Duration::from_millis(3500));
        let pipeline = SamplingPipeline::new(
            Arc::new(store),
            Arc::new(DocumentAnalyzer::new()),
            SamplingConfig::builder().tick_interval_ms(1000).build(),
        );
        let mut updates = pipeline.subscribe();

        pipeline.start(pipeline.request(orders()));
        let states = run_to_end(&mut updates).await;
        let elapsed: Vec<u64> = states.iter().map(|s| s.elapsed_ms).collect();
        assert!(elapsed.windows(2).all(|w| w[0] <= w[1]), "{elapsed:?}");
        assert!(
            states
                .iter()
                .any(|s| s.phase == SamplingPhase::Counting && s.elapsed_ms >= 3000),
            "{elapsed:?}"
        );
    }
}
