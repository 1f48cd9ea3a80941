//! The mediation core between many session requests and one backend.
//!
//! Per request: cache lookup, then either follow an identical in-flight call
//! or lead one. A leader takes one of `max_concurrent` execution slots,
//! waiting in a bounded FIFO queue when none is free. A full queue rejects
//! immediately and a queued request whose deadline passes is rejected
//! without ever taking a slot. The same deadline bounds how long a
//! follower waits on its leader.
//!
//! Dropping a `dispatch` future cancels the request. A queued request gives
//! its queue place back and an executing one abandons its HTTP call.
//! Followers of a cancelled leader start over.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError, watch};
use tokio::time::Instant;
use tracing::{debug, warn};
use crate::audit::{AuditOutcome, AuditRecord, AuditSink, Decision};
use crate::backend::Backend;
use crate::cache::{Fingerprint, ResponseCache};
use crate::error::GatewayError;
use crate::metrics::{
    CACHE_HITS, CACHE_MISSES, DEDUP_FOLLOWERS, EXECUTING, QUEUE_DEPTH, REJECTED_TOTAL, REQUEST_LATENCY,
};
use crate::models::{BackendCall, Generation};

/// One admitted backend invocation.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: String,
    pub session_id: String,
    pub tool: String,
    pub call: BackendCall,
    pub fingerprint: Fingerprint,
    pub submitted_at: DateTime<Utc>,
    // latest moment the request may still be waiting for a slot or a leader
    pub deadline: Option<Instant>,
}

impl Request {
    pub fn new(
        id: impl Into<String>,
        session_id: impl Into<String>,
        tool: impl Into<String>,
        call: BackendCall,
        deadline: Option<Instant>,
    ) -> Self {
        let tool = tool.into();
        let fingerprint = Fingerprint::compute(&tool, &call);
        Self {
            id: id.into(),
            session_id: session_id.into(),
            tool,
            call,
            fingerprint,
            submitted_at: Utc::now(),
            deadline,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServedBy {
    Backend,
    Cache,
    Follower,
    // turned away by backpressure, the backend was never called
    Rejected,
}

impl ServedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServedBy::Backend => "backend",
            ServedBy::Cache => "cache",
            ServedBy::Follower => "follower",
            ServedBy::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub outcome: Result<Arc<Generation>, GatewayError>,
    pub retries: u32,
    pub latency: Duration,
    pub served_by: ServedBy,
}

impl DispatchResult {
    fn rejected(err: GatewayError, started: Instant) -> Self {
        Self {
            outcome: Err(err),
            retries: 0,
            latency: started.elapsed(),
            served_by: ServedBy::Rejected,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_concurrent: usize,
    pub queue_capacity: usize,
    pub timeout: Duration,
}

type Pending = watch::Receiver<Option<DispatchResult>>;

enum Role {
    Hit(Arc<Generation>),
    Follower(Pending),
    Leader(watch::Sender<Option<DispatchResult>>),
}

pub struct Dispatcher {
    backend: Arc<dyn Backend>,
    cache: Option<Arc<ResponseCache>>,
    audit: Arc<dyn AuditSink>,
    inflight: Mutex<HashMap<Fingerprint, Pending>>,
    slots: Arc<Semaphore>,
    queued: AtomicUsize,
    executing: AtomicUsize,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        backend: Arc<dyn Backend>,
        cache: Option<Arc<ResponseCache>>,
        audit: Arc<dyn AuditSink>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            backend,
            cache,
            audit,
            inflight: Mutex::new(HashMap::new()),
            slots: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            queued: AtomicUsize::new(0),
            executing: AtomicUsize::new(0),
            config,
        }
    }

    pub fn cache(&self) -> Option<&Arc<ResponseCache>> {
        self.cache.as_ref()
    }

    // requests currently waiting for a slot
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn executing(&self) -> usize {
        self.executing.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub async fn dispatch(&self, request: Request) -> DispatchResult {
        let started = Instant::now();
        let mut audit = TerminalAudit {
            sink: self.audit.as_ref(),
            request: &request,
            done: false,
        };

        let result = loop {
            match self.join(&request.fingerprint) {
                Role::Hit(generation) => {
                    break DispatchResult {
                        outcome: Ok(generation),
                        retries: 0,
                        latency: started.elapsed(),
                        served_by: ServedBy::Cache,
                    };
                }
                Role::Follower(mut pending) => {
                    DEDUP_FOLLOWERS.inc();
                    let published = match request.deadline {
                        Some(deadline) => {
                            let waiting_since = Instant::now();
                            match tokio::time::timeout_at(deadline, leader_result(&mut pending)).await {
                                Ok(published) => published,
                                Err(_) => {
                                    let err = GatewayError::DeadlineExceeded {
                                        waited_ms: waiting_since.elapsed().as_millis() as u64,
                                    };
                                    warn!(request_id = %request.id, error = %err, "follower gave up on its leader");
                                    REJECTED_TOTAL.with_label_values(&[err.kind()]).inc();
                                    break DispatchResult::rejected(err, started);
                                }
                            }
                        }
                        None => leader_result(&mut pending).await,
                    };
                    match published {
                        Some(mut result) => {
                            result.served_by = ServedBy::Follower;
                            result.latency = started.elapsed();
                            break result;
                        }
                        None => {
                            // leader was cancelled before finishing
                            debug!(request_id = %request.id, fingerprint = %request.fingerprint, "leader went away, retrying");
                            continue;
                        }
                    }
                }
                Role::Leader(publisher) => {
                    let leader = Leader {
                        dispatcher: self,
                        fingerprint: &request.fingerprint,
                        publisher: Some(publisher),
                    };
                    let result = self.execute(&request, started).await;
                    leader.publish(result.clone());
                    break result;
                }
            }
        };

        REQUEST_LATENCY.observe(result.latency.as_secs_f64());
        audit.finish(&result);
        result
    }

    fn lock_inflight(&self) -> MutexGuard<'_, HashMap<Fingerprint, Pending>> {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner())
    }

    // Cache check and leader registration happen under one lock, so a
    // request cannot miss both a fresh cache entry and the call producing it
    fn join(&self, fingerprint: &Fingerprint) -> Role {
        let mut inflight = self.lock_inflight();

        if let Some(cache) = &self.cache {
            if let Some(generation) = cache.get(fingerprint) {
                CACHE_HITS.inc();
                return Role::Hit(generation);
            }
            CACHE_MISSES.inc();
        }

        if let Some(pending) = inflight.get(fingerprint) {
            return Role::Follower(pending.clone());
        }

        let (publisher, pending) = watch::channel(None);
        inflight.insert(fingerprint.clone(), pending);
        Role::Leader(publisher)
    }

    async fn execute(&self, request: &Request, started: Instant) -> DispatchResult {
        let permit = match self.acquire_slot(request).await {
            Ok(permit) => permit,
            Err(err) => {
                warn!(request_id = %request.id, error = %err, "request rejected by dispatcher");
                REJECTED_TOTAL.with_label_values(&[err.kind()]).inc();
                return DispatchResult::rejected(err, started);
            }
        };

        let running = Running::start(&self.executing);
        debug!(request_id = %request.id, tool = %request.tool, fingerprint = %request.fingerprint, "calling backend");
        let outcome = self.backend.call(&request.call, self.config.timeout).await;
        drop(running);

        let result = match outcome {
            Ok(completion) => {
                let generation = Arc::new(completion.generation);
                if let Some(cache) = &self.cache {
                    cache.put(request.fingerprint.clone(), Arc::clone(&generation));
                }
                DispatchResult {
                    outcome: Ok(generation),
                    retries: completion.retries,
                    latency: started.elapsed(),
                    served_by: ServedBy::Backend,
                }
            }
            Err(err) => {
                warn!(request_id = %request.id, error = %err, "backend call failed");
                let retries = match &err {
                    GatewayError::BackendUnavailable { attempts, .. } => attempts.saturating_sub(1),
                    _ => 0,
                };
                DispatchResult {
                    outcome: Err(err),
                    retries,
                    latency: started.elapsed(),
                    served_by: ServedBy::Backend,
                }
            }
        };

        drop(permit);
        result
    }

    async fn acquire_slot(&self, request: &Request) -> Result<OwnedSemaphorePermit, GatewayError> {
        match Arc::clone(&self.slots).try_acquire_owned() {
            Ok(permit) => return Ok(permit),
            Err(TryAcquireError::Closed) => return Err(closed()),
            Err(TryAcquireError::NoPermits) => {}
        }

        let capacity = self.config.queue_capacity;
        if self
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < capacity).then_some(n + 1))
            .is_err()
        {
            return Err(GatewayError::QueueFull { capacity });
        }
        let _ticket = QueueTicket::new(&self.queued);

        let waiting_since = Instant::now();
        let acquire = Arc::clone(&self.slots).acquire_owned();
        let permit = match request.deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, acquire).await {
                Ok(permit) => permit,
                Err(_) => {
                    return Err(GatewayError::DeadlineExceeded {
                        waited_ms: waiting_since.elapsed().as_millis() as u64,
                    });
                }
            },
            None => acquire.await,
        };
        permit.map_err(|_| closed())
    }
}

// Waits for the leader's result; `None` means the leader went away without one
async fn leader_result(pending: &mut Pending) -> Option<DispatchResult> {
    match pending.wait_for(Option::is_some).await {
        Ok(value) => (*value).clone(),
        Err(_) => None,
    }
}

fn closed() -> GatewayError {
    GatewayError::BackendUnavailable {
        attempts: 0,
        last_error: "dispatcher is shut down".to_string(),
    }
}

// Publishes the leader's result to followers. If dropped without publishing
// (the leader was cancelled) it unregisters, which wakes followers empty-handed
struct Leader<'a> {
    dispatcher: &'a Dispatcher,
    fingerprint: &'a Fingerprint,
    publisher: Option<watch::Sender<Option<DispatchResult>>>,
}

impl Leader<'_> {
    // Unregister before publishing so nothing can join a finished call
    fn publish(mut self, result: DispatchResult) {
        self.dispatcher.lock_inflight().remove(self.fingerprint);
        if let Some(publisher) = self.publisher.take() {
            publisher.send_replace(Some(result));
        }
    }
}

impl Drop for Leader<'_> {
    fn drop(&mut self) {
        if self.publisher.is_some() {
            self.dispatcher.lock_inflight().remove(self.fingerprint);
        }
    }
}

struct QueueTicket<'a> {
    queued: &'a AtomicUsize,
}

impl<'a> QueueTicket<'a> {
    fn new(queued: &'a AtomicUsize) -> Self {
        QUEUE_DEPTH.inc();
        Self { queued }
    }
}

impl Drop for QueueTicket<'_> {
    fn drop(&mut self) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
        QUEUE_DEPTH.dec();
    }
}

struct Running<'a> {
    executing: &'a AtomicUsize,
}

impl<'a> Running<'a> {
    fn start(executing: &'a AtomicUsize) -> Self {
        executing.fetch_add(1, Ordering::SeqCst);
        EXECUTING.inc();
        Self { executing }
    }
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.executing.fetch_sub(1, Ordering::SeqCst);
        EXECUTING.dec();
    }
}

// Writes the terminal audit record; a request dropped mid-flight is "cancelled"
struct TerminalAudit<'a> {
    sink: &'a dyn AuditSink,
    request: &'a Request,
    done: bool,
}

impl TerminalAudit<'_> {
    fn finish(&mut self, result: &DispatchResult) {
        let (decision, reason) = match (&result.served_by, &result.outcome) {
            (ServedBy::Cache, _) => (Decision::Cached, "served from cache".to_string()),
            (ServedBy::Follower, _) => (
                Decision::Followed,
                "joined identical in-flight call".to_string(),
            ),
            (ServedBy::Rejected, Err(err)) => (Decision::Rejected, err.to_string()),
            (ServedBy::Rejected, Ok(_)) => (Decision::Rejected, String::new()),
            (ServedBy::Backend, Ok(_)) => (
                Decision::Executed,
                format!("backend call succeeded after {} retries", result.retries),
            ),
            (ServedBy::Backend, Err(err)) => (Decision::Executed, err.to_string()),
        };
        let outcome = match &result.outcome {
            Ok(_) => AuditOutcome::Success,
            Err(err) => AuditOutcome::Failure(err.kind().to_string()),
        };
        self.write(decision, reason, outcome);
        self.done = true;
    }

    fn write(&self, decision: Decision, reason: String, outcome: AuditOutcome) {
        self.sink.record(AuditRecord::new(
            &self.request.id,
            &self.request.session_id,
            &self.request.tool,
            decision,
            reason,
            outcome,
        ));
    }
}

impl Drop for TerminalAudit<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.write(
                Decision::Cancelled,
                "caller abandoned the request".to_string(),
                AuditOutcome::Failure(GatewayError::Cancelled.kind().to_string()),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::backend::Completion;
    use crate::clock::SystemClock;
    use crate::models::{Endpoint, GenerateParams};
    use async_trait::async_trait;
    use futures::future::join_all;

    #[derive(Default)]
    struct FakeBackend {
        delay: Duration,
        calls: AtomicUsize,
        active: AtomicUsize,
        peak: AtomicUsize,
        failure: Option<GatewayError>,
    }

    impl FakeBackend {
        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Backend for FakeBackend {
        async fn call(&self, call: &BackendCall, _timeout: Duration) -> Result<Completion, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if let Some(err) = &self.failure {
                return Err(err.clone());
            }
            let prompt = match call {
                BackendCall::Generate(p) => p.prompt.clone(),
                BackendCall::Chat(p) => p.messages[0].content.clone(),
            };
            Ok(Completion {
                generation: Generation {
                    text: format!("echo: {prompt}"),
                    tokens_generated: 2,
                    finish_reason: "stop".into(),
                    endpoint: Endpoint::Native,
                },
                retries: 0,
            })
        }
    }

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        backend: Arc<FakeBackend>,
        audit: Arc<MemoryAuditSink>,
    }

    fn harness(backend: FakeBackend, max_concurrent: usize, queue_capacity: usize) -> Harness {
        let backend = Arc::new(backend);
        let audit = Arc::new(MemoryAuditSink::new());
        let cache = Arc::new(ResponseCache::new(
            Duration::from_secs(300),
            1 << 20,
            Arc::new(SystemClock),
        ));
        let dispatcher = Dispatcher::new(
            backend.clone(),
            Some(cache),
            audit.clone(),
            DispatcherConfig {
                max_concurrent,
                queue_capacity,
                timeout: Duration::from_secs(30),
            },
        );
        Harness {
            dispatcher: Arc::new(dispatcher),
            backend,
            audit,
        }
    }

    fn request(id: &str, prompt: &str) -> Request {
        Request::new(
            id,
            "session",
            "generate_text",
            BackendCall::Generate(GenerateParams::new(prompt)),
            None,
        )
    }

    fn decisions(audit: &MemoryAuditSink, id: &str) -> Vec<Decision> {
        audit.for_request(id).iter().map(|r| r.decision).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn second_identical_request_is_served_from_cache() {
        let h = harness(FakeBackend::slow(Duration::from_millis(100)), 2, 4);

        let first = h.dispatcher.dispatch(request("1", "hello")).await;
        let second = h.dispatcher.dispatch(request("2", "hello")).await;

        assert_eq!(first.served_by, ServedBy::Backend);
        assert_eq!(second.served_by, ServedBy::Cache);
        assert!(Arc::ptr_eq(first.outcome.as_ref().unwrap(), second.outcome.as_ref().unwrap()));
        assert_eq!(h.backend.calls(), 1);
        assert_eq!(decisions(&h.audit, "1"), vec![Decision::Executed]);
        assert_eq!(decisions(&h.audit, "2"), vec![Decision::Cached]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_identical_requests_share_one_backend_call() {
        let h = harness(FakeBackend::slow(Duration::from_millis(500)), 4, 4);

        let results = join_all((0..5).map(|i| h.dispatcher.dispatch(request(&i.to_string(), "same")))).await;

        assert_eq!(h.backend.calls(), 1);
        let leader = results[0].outcome.as_ref().unwrap();
        for result in &results {
            assert!(Arc::ptr_eq(leader, result.outcome.as_ref().unwrap()));
        }
        let followers = results.iter().filter(|r| r.served_by == ServedBy::Follower).count();
        assert_eq!(followers, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn request_arriving_during_flight_is_recorded_as_followed() {
        let h = harness(FakeBackend::slow(Duration::from_millis(500)), 2, 4);

        let dispatcher = h.dispatcher.clone();
        let first = tokio::spawn(async move { dispatcher.dispatch(request("first", "story")).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = h.dispatcher.dispatch(request("second", "story")).await;
        let first = first.await.unwrap();

        assert_eq!(h.backend.calls(), 1);
        assert_eq!(first.served_by, ServedBy::Backend);
        assert_eq!(second.served_by, ServedBy::Follower);
        assert_eq!(decisions(&h.audit, "second"), vec![Decision::Followed]);
    }

    #[tokio::test(start_paused = true)]
    async fn executing_requests_never_exceed_the_slot_count() {
        let h = harness(FakeBackend::slow(Duration::from_millis(50)), 2, 16);

        let results = join_all((0..8).map(|i| h.dispatcher.dispatch(request(&i.to_string(), &format!("p{i}"))))).await;

        assert!(results.iter().all(|r| r.outcome.is_ok()));
        assert_eq!(h.backend.calls(), 8);
        assert_eq!(h.backend.peak.load(Ordering::SeqCst), 2);
        assert_eq!(h.dispatcher.executing(), 0);
        assert_eq!(h.dispatcher.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_queue_rejects_fast() {
        let (max_concurrent, queue_capacity) = (1, 2);
        let h = harness(FakeBackend::slow(Duration::from_millis(100)), max_concurrent, queue_capacity);

        let total = max_concurrent + queue_capacity + 1;
        let results = join_all((0..total).map(|i| h.dispatcher.dispatch(request(&i.to_string(), &format!("p{i}"))))).await;

        let full: Vec<&DispatchResult> = results
            .iter()
            .filter(|r| matches!(r.outcome, Err(GatewayError::QueueFull { .. })))
            .collect();
        assert_eq!(full.len(), 1);
        assert_eq!(full[0].served_by, ServedBy::Rejected);
        assert_eq!(h.backend.calls(), 3);
        assert_eq!(decisions(&h.audit, "3"), vec![Decision::Rejected]);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_request_past_its_deadline_is_rejected_without_a_slot() {
        let h = harness(FakeBackend::slow(Duration::from_secs(1)), 1, 4);

        let dispatcher = h.dispatcher.clone();
        let long = tokio::spawn(async move { dispatcher.dispatch(request("long", "slow job")).await });
        tokio::time::sleep(Duration::from_millis(1)).await;

        let mut hurried = request("hurried", "quick job");
        hurried.deadline = Some(Instant::now() + Duration::from_millis(50));
        let result = h.dispatcher.dispatch(hurried).await;

        assert!(matches!(result.outcome, Err(GatewayError::DeadlineExceeded { waited_ms: 50 })));
        assert_eq!(h.dispatcher.queued(), 0);
        assert!(long.await.unwrap().outcome.is_ok());
        assert_eq!(h.backend.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn follower_past_its_deadline_is_rejected_while_its_leader_queues() {
        let h = harness(FakeBackend::slow(Duration::from_secs(1)), 1, 4);

        let dispatcher = h.dispatcher.clone();
        let long = tokio::spawn(async move { dispatcher.dispatch(request("long", "slow job")).await });
        tokio::time::sleep(Duration::from_millis(1)).await;

        let dispatcher = h.dispatcher.clone();
        let leader = tokio::spawn(async move { dispatcher.dispatch(request("leader", "same")).await });
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(h.dispatcher.queued(), 1);

        let mut hurried = request("hurried", "same");
        hurried.deadline = Some(Instant::now() + Duration::from_millis(50));
        let result = h.dispatcher.dispatch(hurried).await;

        assert!(matches!(result.outcome, Err(GatewayError::DeadlineExceeded { waited_ms: 50 })));
        assert_eq!(result.served_by, ServedBy::Rejected);
        assert_eq!(decisions(&h.audit, "hurried"), vec![Decision::Rejected]);

        // the leader it gave up on still completes normally
        assert!(long.await.unwrap().outcome.is_ok());
        let leader = leader.await.unwrap();
        assert_eq!(leader.served_by, ServedBy::Backend);
        assert!(leader.outcome.is_ok());
        assert_eq!(h.backend.calls(), 2);
    }

    #[tokio::test]
    async fn woken_follower_cannot_rejoin_a_published_call() {
        let h = harness(FakeBackend::default(), 1, 1);
        let fingerprint = request("1", "flaky").fingerprint;

        let Role::Leader(publisher) = h.dispatcher.join(&fingerprint) else {
            panic!("first arrival should lead");
        };
        let Role::Follower(mut pending) = h.dispatcher.join(&fingerprint) else {
            panic!("second arrival should follow");
        };

        // a thread that arrives the instant the result is visible
        let dispatcher = h.dispatcher.clone();
        let arrival_fingerprint = fingerprint.clone();
        let arrival = std::thread::spawn(move || {
            futures::executor::block_on(pending.changed()).unwrap();
            matches!(dispatcher.join(&arrival_fingerprint), Role::Leader(_))
        });

        let leader = Leader {
            dispatcher: &h.dispatcher,
            fingerprint: &fingerprint,
            publisher: Some(publisher),
        };
        leader.publish(DispatchResult::rejected(
            GatewayError::BackendUnavailable {
                attempts: 1,
                last_error: "HTTP 500".into(),
            },
            Instant::now(),
        ));

        assert!(arrival.join().unwrap(), "late arrival joined an already published failure");
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_not_cached() {
        let backend = FakeBackend {
            failure: Some(GatewayError::BackendUnavailable {
                attempts: 4,
                last_error: "HTTP 503".into(),
            }),
            ..FakeBackend::default()
        };
        let h = harness(backend, 1, 1);

        let first = h.dispatcher.dispatch(request("1", "x")).await;
        let second = h.dispatcher.dispatch(request("2", "x")).await;

        assert_eq!(first.retries, 3);
        assert!(first.outcome.is_err() && second.outcome.is_err());
        assert_eq!(h.backend.calls(), 2);
        assert!(h.dispatcher.cache().unwrap().is_empty());
        assert_eq!(h.audit.for_request("1")[0].outcome, AuditOutcome::Failure("backend_unavailable".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_a_queued_request_frees_its_place() {
        let h = harness(FakeBackend::slow(Duration::from_secs(1)), 1, 1);

        let dispatcher = h.dispatcher.clone();
        let running = tokio::spawn(async move { dispatcher.dispatch(request("running", "a")).await });
        tokio::time::sleep(Duration::from_millis(1)).await;

        let dispatcher = h.dispatcher.clone();
        let queued = tokio::spawn(async move { dispatcher.dispatch(request("queued", "b")).await });
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(h.dispatcher.queued(), 1);

        queued.abort();
        assert!(queued.await.unwrap_err().is_cancelled());
        assert_eq!(h.dispatcher.queued(), 0);
        assert_eq!(decisions(&h.audit, "queued"), vec![Decision::Cancelled]);

        // the freed place is usable again
        let dispatcher = h.dispatcher.clone();
        let next = tokio::spawn(async move { dispatcher.dispatch(request("next", "c")).await });
        assert!(running.await.unwrap().outcome.is_ok());
        assert!(next.await.unwrap().outcome.is_ok());
        assert_eq!(h.backend.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn followers_take_over_when_the_leader_is_cancelled() {
        let h = harness(FakeBackend::slow(Duration::from_millis(500)), 2, 2);

        let dispatcher = h.dispatcher.clone();
        let leader = tokio::spawn(async move { dispatcher.dispatch(request("leader", "shared")).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let dispatcher = h.dispatcher.clone();
        let follower = tokio::spawn(async move { dispatcher.dispatch(request("follower", "shared")).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        leader.abort();
        let result = follower.await.unwrap();

        assert!(result.outcome.is_ok());
        assert_eq!(result.served_by, ServedBy::Backend);
        assert_eq!(h.backend.calls(), 2);
        assert_eq!(decisions(&h.audit, "leader"), vec![Decision::Cancelled]);
    }
}
