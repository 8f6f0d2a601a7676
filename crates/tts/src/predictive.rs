//! Predictive pre-generation
//!
//! Walks a call-flow graph ahead of the current step and synthesizes the
//! phrases a caller is likely to hear next, so the live path hits the
//! cache instead of a provider. Tasks run on a small worker pool fed by a
//! priority queue; duplicates for a key already in flight are dropped.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use voxcall_core::{Result, TtsEventKind};

use crate::cache::{CacheKey, TieredCache};
use crate::provider::SynthesisRequest;

/// Priority assigned by distance from the current step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PredictionPriority {
    High = 0,
    Medium = 1,
    Low = 2,
}

impl PredictionPriority {
    fn for_depth(depth: usize) -> Self {
        match depth {
            0 => PredictionPriority::High,
            1 => PredictionPriority::Medium,
            _ => PredictionPriority::Low,
        }
    }
}

/// One dialog step in a call flow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallFlowStep {
    #[serde(default)]
    pub phrases: Vec<String>,
    /// condition -> next step id
    #[serde(default)]
    pub transitions: HashMap<String, String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl CallFlowStep {
    pub fn next_step_ids(&self) -> Vec<&String> {
        let mut ids: Vec<&String> = self.transitions.values().collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// A directed graph of dialog steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallFlow {
    pub name: String,
    pub entry_step: String,
    pub steps: HashMap<String, CallFlowStep>,
}

impl CallFlow {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| voxcall_core::Error::InvalidInput(format!("call flow: {e}")))
    }
}

/// Synthesis defaults for one call, set at `start_call`.
#[derive(Debug, Clone)]
pub struct CallSynthesisDefaults {
    pub provider: String,
    pub voice: Option<String>,
    pub speed: f32,
}

#[derive(Debug, Clone)]
struct CallState {
    flow_id: String,
    current_step: String,
    history: Vec<String>,
    defaults: CallSynthesisDefaults,
}

struct QueuedTask {
    priority: PredictionPriority,
    seq: u64,
    call_id: String,
    phrase: String,
    key: CacheKey,
    request: SynthesisRequest,
    provider: String,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so High (0) pops first and
        // earlier tasks break ties.
        other
            .priority
            .cmp(&self.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Backend used for background synthesis. Implemented by the facade so
/// predictive generation flows through the same provider selection as
/// live requests.
#[async_trait]
pub trait BackgroundSynthesizer: Send + Sync + 'static {
    async fn synthesize_for_cache(
        &self,
        provider: &str,
        request: &SynthesisRequest,
    ) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, Default)]
pub struct PredictiveStats {
    pub tasks_generated: u64,
    pub cache_hits: u64,
    pub successful_predictions: u64,
    pub failed_predictions: u64,
    pub total_predictions: u64,
    pub avg_generation_ms: f64,
    pub active_calls: usize,
    pub queued_tasks: usize,
}

struct StatsInner {
    tasks_generated: u64,
    cache_hits: u64,
    successful_predictions: u64,
    failed_predictions: u64,
    total_predictions: u64,
    generation_ms: VecDeque<f64>,
}

/// Pre-synthesizes likely phrases into the cache.
pub struct PredictiveGenerator {
    flows: DashMap<String, CallFlow>,
    calls: DashMap<String, CallState>,
    cache: Arc<TieredCache>,
    synthesizer: Arc<dyn BackgroundSynthesizer>,
    events: voxcall_core::EventBus,

    queue: Mutex<BinaryHeap<QueuedTask>>,
    queue_notify: Notify,
    seq: Mutex<u64>,
    in_flight: DashMap<String, ()>,

    depth: Mutex<usize>,
    enabled: Mutex<bool>,
    stats: Mutex<StatsInner>,

    stop_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PredictiveGenerator {
    /// Create the generator and spawn `workers` background tasks.
    pub fn new(
        cache: Arc<TieredCache>,
        synthesizer: Arc<dyn BackgroundSynthesizer>,
        events: voxcall_core::EventBus,
        depth: usize,
        workers: usize,
        enabled: bool,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        let generator = Arc::new(Self {
            flows: DashMap::new(),
            calls: DashMap::new(),
            cache,
            synthesizer,
            events,
            queue: Mutex::new(BinaryHeap::new()),
            queue_notify: Notify::new(),
            seq: Mutex::new(0),
            in_flight: DashMap::new(),
            depth: Mutex::new(depth.clamp(1, 5)),
            enabled: Mutex::new(enabled),
            stats: Mutex::new(StatsInner {
                tasks_generated: 0,
                cache_hits: 0,
                successful_predictions: 0,
                failed_predictions: 0,
                total_predictions: 0,
                generation_ms: VecDeque::new(),
            }),
            stop_tx,
            workers: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::with_capacity(workers.max(1));
        for worker_id in 0..workers.max(1) {
            let generator = Arc::clone(&generator);
            let stop = generator.stop_tx.subscribe();
            handles.push(tokio::spawn(async move {
                generator.worker_loop(worker_id, stop).await;
            }));
        }
        *generator.workers.lock() = handles;

        generator
    }

    /// Register a flow; replaces any flow with the same name.
    pub fn register_flow(&self, flow: CallFlow) -> Result<String> {
        if !flow.steps.contains_key(&flow.entry_step) {
            return Err(voxcall_core::Error::InvalidInput(format!(
                "flow {} entry step {} not among steps",
                flow.name, flow.entry_step
            )));
        }
        let name = flow.name.clone();
        self.flows.insert(name.clone(), flow);
        Ok(name)
    }

    /// Begin tracking a call at its flow's entry step and kick off the
    /// first prediction round.
    pub async fn start_call(
        &self,
        call_id: &str,
        flow_id: &str,
        defaults: CallSynthesisDefaults,
    ) -> Result<Vec<String>> {
        let entry = self
            .flows
            .get(flow_id)
            .map(|flow| flow.entry_step.clone())
            .ok_or_else(|| {
                voxcall_core::Error::InvalidInput(format!("unknown call flow {flow_id}"))
            })?;

        self.calls.insert(
            call_id.to_string(),
            CallState {
                flow_id: flow_id.to_string(),
                current_step: entry,
                history: Vec::new(),
                defaults,
            },
        );

        Ok(self.predict_next_phrases(call_id).await)
    }

    /// Move a call to a new step and re-run prediction.
    pub async fn update_step(&self, call_id: &str, step_id: &str) -> Result<Vec<String>> {
        {
            let mut state = self.calls.get_mut(call_id).ok_or_else(|| {
                voxcall_core::Error::InvalidInput(format!("unknown call {call_id}"))
            })?;
            let previous = std::mem::replace(&mut state.current_step, step_id.to_string());
            state.history.push(previous);
        }
        Ok(self.predict_next_phrases(call_id).await)
    }

    pub fn end_call(&self, call_id: &str) {
        self.calls.remove(call_id);
    }

    /// Depth-limited DFS from the call's current step; queues every
    /// not-yet-cached phrase. Returns the queued phrases.
    pub async fn predict_next_phrases(&self, call_id: &str) -> Vec<String> {
        if !*self.enabled.lock() {
            return Vec::new();
        }

        let Some(state) = self.calls.get(call_id).map(|s| s.clone()) else {
            return Vec::new();
        };
        let Some(flow) = self.flows.get(&state.flow_id).map(|f| f.clone()) else {
            return Vec::new();
        };

        let max_depth = *self.depth.lock();
        let mut queued = Vec::new();
        let mut visited = HashSet::new();

        // Iterative DFS; each step is visited once per prediction round.
        let mut stack = vec![(state.current_step.clone(), 0usize)];
        while let Some((step_id, depth)) = stack.pop() {
            if depth > max_depth || !visited.insert(step_id.clone()) {
                continue;
            }
            let Some(step) = flow.steps.get(&step_id) else {
                continue;
            };

            let priority = PredictionPriority::for_depth(depth);
            for phrase in &step.phrases {
                if self.enqueue(call_id, &state, phrase, priority).await {
                    queued.push(phrase.clone());
                }
            }

            for next_id in step.next_step_ids() {
                stack.push((next_id.clone(), depth + 1));
            }
        }
        queued
    }

    /// Queue one phrase unless cached or already in flight.
    async fn enqueue(
        &self,
        call_id: &str,
        state: &CallState,
        phrase: &str,
        priority: PredictionPriority,
    ) -> bool {
        let mut request = SynthesisRequest::new(phrase).with_speed(state.defaults.speed);
        request.voice = state.defaults.voice.clone();

        let key = CacheKey::compute(
            phrase,
            &state.defaults.provider,
            request.voice.as_deref(),
            request.speed,
            &request.extras,
        );

        if self.cache.get(&key).await.is_some() {
            self.stats.lock().cache_hits += 1;
            return false;
        }
        if self.in_flight.contains_key(key.as_hex()) {
            return false;
        }
        self.in_flight.insert(key.as_hex().to_string(), ());

        let seq = {
            let mut seq = self.seq.lock();
            *seq += 1;
            *seq
        };

        {
            let mut stats = self.stats.lock();
            stats.total_predictions += 1;
            stats.tasks_generated += 1;
        }

        self.queue.lock().push(QueuedTask {
            priority,
            seq,
            call_id: call_id.to_string(),
            phrase: phrase.to_string(),
            provider: state.defaults.provider.clone(),
            key,
            request,
        });
        self.queue_notify.notify_one();
        true
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, stop: watch::Receiver<bool>) {
        tracing::debug!(worker_id, "prediction worker started");

        loop {
            if *stop.borrow() {
                break;
            }

            let task = self.queue.lock().pop();
            let Some(task) = task else {
                let mut stop = stop.clone();
                tokio::select! {
                    _ = self.queue_notify.notified() => continue,
                    result = stop.changed() => {
                        if result.is_err() || *stop.borrow() {
                            break;
                        }
                        continue;
                    }
                }
            };

            self.process(task).await;
        }

        tracing::debug!(worker_id, "prediction worker stopped");
    }

    async fn process(&self, task: QueuedTask) {
        // The call may have ended, or a live request may have filled the
        // cache since queueing.
        if !self.calls.contains_key(&task.call_id) {
            self.in_flight.remove(task.key.as_hex());
            return;
        }
        if self.cache.get(&task.key).await.is_some() {
            self.stats.lock().cache_hits += 1;
            self.in_flight.remove(task.key.as_hex());
            return;
        }

        let started = Instant::now();
        let result = self
            .synthesizer
            .synthesize_for_cache(&task.provider, &task.request)
            .await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(audio) => {
                self.cache.set(&task.key, &audio).await;
                let mut stats = self.stats.lock();
                stats.successful_predictions += 1;
                stats.generation_ms.push_back(elapsed_ms);
                if stats.generation_ms.len() > 100 {
                    stats.generation_ms.pop_front();
                }
                drop(stats);
                self.events.emit(
                    TtsEventKind::LatencyMeasured {
                        operation: "predictive_generation".into(),
                        latency_ms: elapsed_ms,
                    },
                    Some(voxcall_core::CallId::new(task.call_id.clone())),
                );
            }
            Err(e) => {
                // Not retried here; the live path will synthesize on miss.
                self.stats.lock().failed_predictions += 1;
                tracing::warn!(
                    call_id = %task.call_id,
                    phrase = %task.phrase,
                    error = %e,
                    "predictive generation failed"
                );
            }
        }

        self.in_flight.remove(task.key.as_hex());
    }

    pub fn set_depth(&self, depth: usize) {
        *self.depth.lock() = depth.clamp(1, 5);
    }

    pub fn enable(&self) {
        *self.enabled.lock() = true;
    }

    pub fn disable(&self) {
        *self.enabled.lock() = false;
    }

    pub fn stats(&self) -> PredictiveStats {
        let stats = self.stats.lock();
        let avg = if stats.generation_ms.is_empty() {
            0.0
        } else {
            stats.generation_ms.iter().sum::<f64>() / stats.generation_ms.len() as f64
        };
        PredictiveStats {
            tasks_generated: stats.tasks_generated,
            cache_hits: stats.cache_hits,
            successful_predictions: stats.successful_predictions,
            failed_predictions: stats.failed_predictions,
            total_predictions: stats.total_predictions,
            avg_generation_ms: avg,
            active_calls: self.calls.len(),
            queued_tasks: self.queue.lock().len(),
        }
    }

    /// Stop the worker pool. Queued tasks are dropped.
    pub fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
        self.queue_notify.notify_waiters();
        self.workers.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;

    use voxcall_core::EventBus;

    use crate::cache::MemoryTier;
    use crate::provider::{NullTtsProvider, TtsProvider};

    /// Counts invocations so tests can prove cached phrases skip it.
    struct CountingSynthesizer {
        provider: NullTtsProvider,
        invocations: AtomicUsize,
    }

    #[async_trait]
    impl BackgroundSynthesizer for CountingSynthesizer {
        async fn synthesize_for_cache(
            &self,
            _provider: &str,
            request: &SynthesisRequest,
        ) -> Result<Vec<u8>> {
            self.invocations.fetch_add(1, AtomicOrdering::SeqCst);
            self.provider.synthesize(request).await
        }
    }

    fn branching_flow() -> CallFlow {
        let mut steps = HashMap::new();
        steps.insert(
            "s0".to_string(),
            CallFlowStep {
                phrases: vec!["welcome".into()],
                transitions: HashMap::from([
                    ("yes".to_string(), "s1".to_string()),
                    ("no".to_string(), "s2".to_string()),
                ]),
                metadata: HashMap::new(),
            },
        );
        steps.insert(
            "s1".to_string(),
            CallFlowStep {
                phrases: vec!["left".into()],
                ..Default::default()
            },
        );
        steps.insert(
            "s2".to_string(),
            CallFlowStep {
                phrases: vec!["right".into()],
                ..Default::default()
            },
        );
        CallFlow {
            name: "greeting".into(),
            entry_step: "s0".into(),
            steps,
        }
    }

    fn defaults() -> CallSynthesisDefaults {
        CallSynthesisDefaults {
            provider: "offline".into(),
            voice: None,
            speed: 1.0,
        }
    }

    fn setup() -> (Arc<PredictiveGenerator>, Arc<TieredCache>, Arc<CountingSynthesizer>) {
        let cache = Arc::new(TieredCache::new(vec![Arc::new(MemoryTier::new(
            100,
            Duration::from_secs(60),
        ))]));
        let synthesizer = Arc::new(CountingSynthesizer {
            provider: NullTtsProvider::new("offline"),
            invocations: AtomicUsize::new(0),
        });
        let generator = PredictiveGenerator::new(
            Arc::clone(&cache),
            synthesizer.clone() as Arc<dyn BackgroundSynthesizer>,
            EventBus::new(),
            1,
            2,
            true,
        );
        (generator, cache, synthesizer)
    }

    async fn wait_for(
        generator: &PredictiveGenerator,
        successes: u64,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if generator.stats().successful_predictions >= successes {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    // All three phrases land in the cache shortly after start_call,
    // and later gets never touch the provider again.
    #[tokio::test]
    async fn start_call_prefills_cache() {
        let (generator, cache, synthesizer) = setup();
        generator.register_flow(branching_flow()).unwrap();

        let queued = generator
            .start_call("c1", "greeting", defaults())
            .await
            .unwrap();
        assert_eq!(queued.len(), 3);

        assert!(wait_for(&generator, 3, Duration::from_secs(3)).await);
        assert_eq!(synthesizer.invocations.load(AtomicOrdering::SeqCst), 3);

        for phrase in ["welcome", "left", "right"] {
            let key = CacheKey::compute(phrase, "offline", None, 1.0, &BTreeMap::new());
            assert!(cache.get(&key).await.is_some(), "missing {phrase}");
        }

        // Cached phrases never re-invoke the synthesizer.
        generator.predict_next_phrases("c1").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(synthesizer.invocations.load(AtomicOrdering::SeqCst), 3);

        generator.shutdown();
    }

    #[tokio::test]
    async fn depth_zero_step_only() {
        let (generator, _cache, _synth) = setup();
        generator.set_depth(1);
        generator.register_flow(branching_flow()).unwrap();

        // Depth clamps to 1..=5, so even a request for 0 keeps neighbours.
        generator.set_depth(0);
        let queued = generator
            .start_call("c1", "greeting", defaults())
            .await
            .unwrap();
        assert_eq!(queued.len(), 3);
        generator.shutdown();
    }

    #[tokio::test]
    async fn update_step_records_history_and_repredicts() {
        let (generator, _cache, _synth) = setup();
        generator.register_flow(branching_flow()).unwrap();
        generator
            .start_call("c1", "greeting", defaults())
            .await
            .unwrap();

        let queued = generator.update_step("c1", "s1").await.unwrap();
        // "left" is already in flight or cached; nothing new to queue.
        assert!(queued.is_empty());

        let state = generator.calls.get("c1").unwrap().clone();
        assert_eq!(state.current_step, "s1");
        assert_eq!(state.history, vec!["s0".to_string()]);
        generator.shutdown();
    }

    #[tokio::test]
    async fn disabled_generator_queues_nothing() {
        let (generator, _cache, synthesizer) = setup();
        generator.disable();
        generator.register_flow(branching_flow()).unwrap();

        let queued = generator
            .start_call("c1", "greeting", defaults())
            .await
            .unwrap();
        assert!(queued.is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(synthesizer.invocations.load(AtomicOrdering::SeqCst), 0);
        generator.shutdown();
    }

    #[tokio::test]
    async fn unknown_flow_is_invalid_input() {
        let (generator, _cache, _synth) = setup();
        let err = generator
            .start_call("c1", "missing", defaults())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        generator.shutdown();
    }

    #[tokio::test]
    async fn ended_call_tasks_are_skipped() {
        let (generator, _cache, synthesizer) = setup();
        generator.register_flow(branching_flow()).unwrap();
        generator
            .start_call("c1", "greeting", defaults())
            .await
            .unwrap();
        generator.end_call("c1");

        // Workers may have started some tasks before end_call landed, but
        // the queue drains without synthesizing everything.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(synthesizer.invocations.load(AtomicOrdering::SeqCst) <= 3);
        generator.shutdown();
    }

    #[test]
    fn flow_json_round_trip() {
        let flow = branching_flow();
        let json = serde_json::to_string(&flow).unwrap();
        let parsed = CallFlow::from_json(&json).unwrap();
        assert_eq!(parsed.name, "greeting");
        assert_eq!(parsed.steps.len(), 3);
    }

    #[test]
    fn queue_orders_by_priority_then_sequence() {
        let mut heap = BinaryHeap::new();
        let key = CacheKey::compute("x", "p", None, 1.0, &BTreeMap::new());
        for (priority, seq) in [
            (PredictionPriority::Low, 1),
            (PredictionPriority::High, 2),
            (PredictionPriority::Medium, 3),
            (PredictionPriority::High, 4),
        ] {
            heap.push(QueuedTask {
                priority,
                seq,
                call_id: "c".into(),
                phrase: "x".into(),
                provider: "p".into(),
                key: key.clone(),
                request: SynthesisRequest::new("x"),
            });
        }

        let order: Vec<(PredictionPriority, u64)> = std::iter::from_fn(|| heap.pop())
            .map(|t| (t.priority, t.seq))
            .collect();
        assert_eq!(
            order,
            vec![
                (PredictionPriority::High, 2),
                (PredictionPriority::High, 4),
                (PredictionPriority::Medium, 3),
                (PredictionPriority::Low, 1),
            ]
        );
    }
}
