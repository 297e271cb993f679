//! Per-frame buffer lifecycle tracking.
//!
//! The tracker owns the four category buffer maps and the per-node status
//! sets for one frame. Node threads report releases through
//! [`mark_user_status`](BufferLifecycleTracker::mark_user_status) and acquire
//! buffers lazily through
//! [`acquire_buffer`](BufferLifecycleTracker::acquire_buffer); the tracker
//! turns those into drain milestones, partial results, exactly-once buffer
//! returns, and the final frame-released notification.
//!
//! Locking is fine-grained: one mutex per category map, one for the status
//! sets, one for the observer list. Events and results are never delivered
//! under the data locks; they are appended to an ordered outbox while the
//! status lock is held and drained by a single emitter at a time, so
//! observers see milestones in the order they were resolved and the
//! frame-released notification strictly last.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use obscura_graph::NodeId;
use parking_lot::Mutex;

use crate::actor::{BufferProvider, LifecycleObserver, PartialResult, ResultSink};
use crate::error::{PipelineError, Result};
use crate::lifecycle::buffer_map::{AcquireState, BufferCategory, BufferMap};
use crate::lifecycle::status::{DrainedSet, NodeStatus};
use crate::lifecycle::users::{Fence, MarkOutcome, ReleaseState, UserRole, UsersManager};
use crate::stream::{BufferHandle, StreamId, StreamInfo};

/// Buffer-lifecycle milestones delivered to observers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Every metadata output buffer of the node has been released.
    AllOutMetaBuffersReleased(NodeId),
    /// Every image output buffer of the node has been released.
    AllOutImageBuffersReleased(NodeId),
    /// Every buffer of the frame has been released; fired at most once.
    FrameReleased,
}

/// One deliverable queued on the outbox, in resolution order.
enum Outbound {
    Event(LifecycleEvent),
    Result(PartialResult),
}

/// Ownership and release tracking for every buffer one frame touches.
pub struct BufferLifecycleTracker {
    request_no: u64,
    frame_no: u64,
    user_id: u32,
    category_of: HashMap<StreamId, BufferCategory>,
    maps: [Mutex<BufferMap>; 4],
    status: Mutex<HashMap<NodeId, NodeStatus>>,
    released: AtomicBool,
    provider: Weak<dyn BufferProvider>,
    sink: Weak<dyn ResultSink>,
    observers: Mutex<Vec<Weak<dyn LifecycleObserver>>>,
    // Deliveries in resolution order; see `drain_outbox`.
    outbox: Mutex<VecDeque<Outbound>>,
    emit_lock: Mutex<()>,
}

impl BufferLifecycleTracker {
    /// Builds the user graphs and node status sets for one frame.
    ///
    /// `streams` lists every stream the frame touches; `role_of` assigns
    /// each (node, stream) pair its role from the frame's resolved I/O maps.
    /// The user list of every buffer is the full topological order, with
    /// non-touching nodes pre-resolved.
    pub fn new(
        request_no: u64,
        frame_no: u64,
        user_id: u32,
        topo: &[NodeId],
        streams: &[Arc<StreamInfo>],
        role_of: impl Fn(NodeId, StreamId) -> UserRole,
        provider: Weak<dyn BufferProvider>,
        sink: Weak<dyn ResultSink>,
    ) -> Self {
        let mut category_of = HashMap::new();
        let mut maps = [
            Mutex::new(BufferMap::new(BufferCategory::AppImage)),
            Mutex::new(BufferMap::new(BufferCategory::InternalImage)),
            Mutex::new(BufferMap::new(BufferCategory::AppMeta)),
            Mutex::new(BufferMap::new(BufferCategory::InternalMeta)),
        ];
        let mut status: HashMap<NodeId, NodeStatus> =
            topo.iter().map(|&n| (n, NodeStatus::default())).collect();

        for info in streams {
            let cat = BufferCategory::of(info);
            category_of.insert(info.id, cat);
            let users = UsersManager::new(topo, |n| role_of(n, info.id));
            for user in users.users() {
                if user.role != UserRole::None
                    && let Some(ns) = status.get_mut(&user.node)
                {
                    ns.seed(cat, user.role, info.id);
                }
            }
            maps[cat.index()].get_mut().insert(Arc::clone(info), users);
        }

        Self {
            request_no,
            frame_no,
            user_id,
            category_of,
            maps,
            status: Mutex::new(status),
            released: AtomicBool::new(false),
            provider,
            sink,
            observers: Mutex::new(Vec::new()),
            outbox: Mutex::new(VecDeque::new()),
            emit_lock: Mutex::new(()),
        }
    }

    /// Subscribes an observer to this frame's lifecycle milestones.
    pub fn register_observer(&self, observer: Weak<dyn LifecycleObserver>) {
        self.observers.lock().push(observer);
    }

    /// Request sequence number of the owning frame.
    pub fn request_no(&self) -> u64 {
        self.request_no
    }

    /// Allocator-assigned frame number of the owning frame.
    pub fn frame_no(&self) -> u64 {
        self.frame_no
    }

    /// Returns whether the frame-released milestone has fired.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    fn category(&self, stream: StreamId) -> Result<BufferCategory> {
        self.category_of
            .get(&stream)
            .copied()
            .ok_or(PipelineError::StreamNotFound(stream))
    }

    // --- Release marking ---

    /// Updates one user's release state for one buffer and re-evaluates
    /// completion.
    ///
    /// On the buffer's final resolution the physical handle (if acquired) is
    /// returned to the provider exactly once. Drained node milestones fire
    /// idempotently; the frame-released notification fires at most once.
    pub fn mark_user_status(
        &self,
        stream: StreamId,
        node: NodeId,
        state: ReleaseState,
    ) -> Result<()> {
        let cat = self.category(stream)?;
        let mut to_return = None;
        let outcome = {
            let mut map = self.maps[cat.index()].lock();
            let item = map.get_mut(stream)?;
            let outcome = item.users.mark(node, state)?;
            if outcome.newly_resolved && !item.returned {
                item.returned = true;
                if let AcquireState::Acquired(handle) = &item.state {
                    to_return = Some(handle.clone());
                }
            }
            outcome
        };

        if let Some(handle) = to_return {
            tracing::debug!("buffer_return: stream {stream} frame {}", self.frame_no);
            if let Some(provider) = self.provider.upgrade() {
                provider.release_buffer(self.request_no, stream, handle);
            } else {
                tracing::warn!("buffer_return: provider gone for stream {stream}");
            }
        }

        self.settle_release(stream, cat, node, outcome, false);
        Ok(())
    }

    // --- Lazy acquisition ---

    /// Acquires the physical buffer for a stream on behalf of a node.
    ///
    /// The provider is invoked at most once per stream per frame; a failure
    /// is sticky and force-releases the requesting user so downstream
    /// accounting still drains. Fails closed with
    /// [`PipelineError::BufferUnavailable`] when the buffer has already been
    /// fully released, when an earlier-ordered user still holds it, or after
    /// a sticky failure.
    pub fn acquire_buffer(&self, stream: StreamId, node: NodeId) -> Result<BufferHandle> {
        let cat = self.category(stream)?;
        let failure_outcome = {
            let mut map = self.maps[cat.index()].lock();
            let item = map.get_mut(stream)?;

            if item.users.all_resolved() || item.users.state_of(node)? == ReleaseState::Released {
                return Err(PipelineError::BufferUnavailable(stream));
            }
            // Strict in-order handoff: everyone ahead of us must be done.
            if !item.users.predecessors_resolved(node)? {
                return Err(PipelineError::BufferUnavailable(stream));
            }

            match item.state.clone() {
                AcquireState::Failed => return Err(PipelineError::BufferUnavailable(stream)),
                AcquireState::Acquired(handle) => return Ok(handle),
                AcquireState::NotAcquired => {
                    let provider = self
                        .provider
                        .upgrade()
                        .ok_or(PipelineError::DeadObject("buffer provider"))?;
                    match provider.acquire_buffer(self.request_no, &item.info) {
                        Ok(handle) => {
                            tracing::debug!(
                                "buffer_acquire: stream {stream} frame {} by {node}",
                                self.frame_no
                            );
                            item.state = AcquireState::Acquired(handle.clone());
                            return Ok(handle);
                        }
                        Err(err) => {
                            tracing::warn!(
                                "buffer_acquire: stream {stream} failed for {node}: {err}"
                            );
                            item.state = AcquireState::Failed;
                            let outcome = item.users.force_release(node)?;
                            if outcome.newly_resolved {
                                // Nothing physical to return; just close out.
                                item.returned = true;
                            }
                            outcome
                        }
                    }
                }
            }
        };

        self.settle_release(stream, cat, node, failure_outcome, true);
        Err(PipelineError::BufferUnavailable(stream))
    }

    /// Returns the release fence of one user of one buffer.
    pub fn fence(&self, stream: StreamId, node: NodeId) -> Result<Arc<Fence>> {
        let cat = self.category(stream)?;
        let map = self.maps[cat.index()].lock();
        map.get(stream)?.users.fence_of(node)
    }

    /// Re-evaluates frame completion; fires the frame-released milestone if
    /// the frame tracks no unresolved buffers at all. Called once after
    /// binding so empty frames still complete.
    pub fn evaluate_completion(&self) {
        self.maybe_finish();
        self.drain_outbox();
    }

    // --- Internal bookkeeping ---

    /// Applies status-set bookkeeping for one settled release, queues any
    /// resulting milestones/results on the outbox, re-checks frame
    /// completion, and drains the outbox. `report_failure` additionally
    /// reports the stream as a failed acquisition through the result sink.
    ///
    /// Milestones are queued while the status lock is held, so the
    /// frame-released check (which takes the same lock) can only queue its
    /// notification behind every milestone the drain depends on.
    fn settle_release(
        &self,
        stream: StreamId,
        cat: BufferCategory,
        node: NodeId,
        outcome: MarkOutcome,
        report_failure: bool,
    ) {
        if outcome.newly_released {
            let mut statuses = self.status.lock();
            let milestone = statuses
                .get_mut(&node)
                .and_then(|ns| ns.resolve(cat, outcome.role, stream));
            match milestone {
                Some(DrainedSet::OutMeta) => {
                    let produced: Vec<StreamId> = statuses
                        .get(&node)
                        .map(|ns| ns.out_meta.seeded.iter().copied().collect())
                        .unwrap_or_default();
                    let outstanding = statuses
                        .values()
                        .filter(|s| s.out_meta.is_seeded() && !s.out_meta.notified)
                        .count();
                    let mut outbox = self.outbox.lock();
                    outbox.push_back(Outbound::Event(
                        LifecycleEvent::AllOutMetaBuffersReleased(node),
                    ));
                    outbox.push_back(Outbound::Result(PartialResult {
                        produced_meta: produced,
                        outstanding_meta: outstanding,
                        ..PartialResult::default()
                    }));
                }
                Some(DrainedSet::OutImage) => {
                    self.outbox.lock().push_back(Outbound::Event(
                        LifecycleEvent::AllOutImageBuffersReleased(node),
                    ));
                }
                _ => {}
            }
        }

        if report_failure {
            self.outbox.lock().push_back(Outbound::Result(PartialResult {
                failed_streams: vec![stream],
                ..PartialResult::default()
            }));
        }

        self.maybe_finish();
        self.drain_outbox();
    }

    /// Queues the frame-released notification and end-of-frame result once
    /// every status set is drained and every map resolved. Holds the status
    /// lock across the check and the queueing, ordering the notification
    /// after every milestone already resolved.
    fn maybe_finish(&self) {
        let statuses = self.status.lock();
        if !statuses.values().all(|s| s.is_drained()) {
            return;
        }
        for cat in BufferCategory::ALL {
            if !self.maps[cat.index()].lock().all_resolved() {
                return;
            }
        }
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("frame_released: frame {}", self.frame_no);
        let mut outbox = self.outbox.lock();
        outbox.push_back(Outbound::Event(LifecycleEvent::FrameReleased));
        outbox.push_back(Outbound::Result(PartialResult {
            frame_end: true,
            ..PartialResult::default()
        }));
        drop(outbox);
        drop(statuses);
    }

    /// Delivers queued events and results in order, one emitter at a time.
    ///
    /// If another thread already holds the emit lock, it is responsible for
    /// everything queued so far and this call returns; after a drain, a
    /// non-empty recheck catches entries queued while the lock was being
    /// released.
    fn drain_outbox(&self) {
        loop {
            let Some(guard) = self.emit_lock.try_lock() else {
                return;
            };
            loop {
                let item = self.outbox.lock().pop_front();
                match item {
                    Some(Outbound::Event(event)) => self.deliver_event(event),
                    Some(Outbound::Result(result)) => self.deliver_result(result),
                    None => break,
                }
            }
            drop(guard);
            if self.outbox.lock().is_empty() {
                return;
            }
        }
    }

    fn deliver_event(&self, event: LifecycleEvent) {
        tracing::trace!("lifecycle_event: frame {} {event:?}", self.frame_no);
        let observers = self.observers.lock().clone();
        for observer in &observers {
            if let Some(observer) = observer.upgrade() {
                observer.on_lifecycle_event(self.frame_no, event);
            }
        }
    }

    fn deliver_result(&self, result: PartialResult) {
        if let Some(sink) = self.sink.upgrade() {
            sink.on_result(self.request_no, self.user_id, result);
        } else {
            tracing::warn!("result_sink gone for request {}", self.request_no);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{StreamOrigin, StreamKind};
    use parking_lot::Mutex as PlMutex;

    struct MockProvider {
        acquired: PlMutex<Vec<StreamId>>,
        released: PlMutex<Vec<StreamId>>,
        fail: bool,
    }

    impl MockProvider {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                acquired: PlMutex::new(Vec::new()),
                released: PlMutex::new(Vec::new()),
                fail,
            })
        }
    }

    impl BufferProvider for MockProvider {
        fn acquire_buffer(&self, _request_no: u64, info: &StreamInfo) -> Result<BufferHandle> {
            if self.fail {
                return Err(PipelineError::BufferUnavailable(info.id));
            }
            self.acquired.lock().push(info.id);
            Ok(BufferHandle { raw: info.id.0 })
        }

        fn release_buffer(&self, _request_no: u64, stream: StreamId, _buffer: BufferHandle) {
            self.released.lock().push(stream);
        }
    }

    #[derive(Default)]
    struct MockSink {
        results: PlMutex<Vec<PartialResult>>,
    }

    impl ResultSink for MockSink {
        fn on_result(&self, _request_no: u64, _user_id: u32, result: PartialResult) {
            self.results.lock().push(result);
        }
    }

    #[derive(Default)]
    struct MockObserver {
        events: PlMutex<Vec<LifecycleEvent>>,
    }

    impl LifecycleObserver for MockObserver {
        fn on_lifecycle_event(&self, _frame_no: u64, event: LifecycleEvent) {
            self.events.lock().push(event);
        }
    }

    /// Stream 100: producer node 2, consumers nodes 3 and 5, topo 2,3,5.
    fn tracker(
        provider: &Arc<MockProvider>,
        sink: &Arc<MockSink>,
    ) -> BufferLifecycleTracker {
        let topo = [NodeId(2), NodeId(3), NodeId(5)];
        let stream = Arc::new(StreamInfo::image(StreamId(100), StreamOrigin::Internal, 64, 64, 0));
        let provider_weak: Weak<dyn BufferProvider> =
            Arc::downgrade(provider) as Weak<dyn BufferProvider>;
        let sink_weak: Weak<dyn ResultSink> = Arc::downgrade(sink) as Weak<dyn ResultSink>;
        BufferLifecycleTracker::new(
            7,
            1,
            0,
            &topo,
            &[stream],
            |node, _| match node.0 {
                2 => UserRole::Producer,
                _ => UserRole::Consumer,
            },
            provider_weak,
            sink_weak,
        )
    }

    #[test]
    fn test_release_ordering_and_single_return() {
        let provider = MockProvider::new(false);
        let sink = Arc::new(MockSink::default());
        let t = tracker(&provider, &sink);

        t.acquire_buffer(StreamId(100), NodeId(2)).unwrap();

        t.mark_user_status(StreamId(100), NodeId(2), ReleaseState::Released)
            .unwrap();
        assert!(provider.released.lock().is_empty());

        t.mark_user_status(StreamId(100), NodeId(3), ReleaseState::Released)
            .unwrap();
        assert!(provider.released.lock().is_empty());

        t.mark_user_status(StreamId(100), NodeId(5), ReleaseState::Released)
            .unwrap();
        assert_eq!(provider.released.lock().as_slice(), &[StreamId(100)]);

        // Re-marking never returns the buffer a second time.
        t.mark_user_status(StreamId(100), NodeId(5), ReleaseState::Released)
            .unwrap();
        assert_eq!(provider.released.lock().len(), 1);
    }

    #[test]
    fn test_in_order_handoff() {
        let provider = MockProvider::new(false);
        let sink = Arc::new(MockSink::default());
        let t = tracker(&provider, &sink);

        // Node 5 cannot acquire while nodes 2 and 3 still hold the buffer.
        let early = t.acquire_buffer(StreamId(100), NodeId(5));
        assert!(matches!(early, Err(PipelineError::BufferUnavailable(_))));

        t.acquire_buffer(StreamId(100), NodeId(2)).unwrap();
        t.mark_user_status(StreamId(100), NodeId(2), ReleaseState::PreReleased)
            .unwrap();

        // Node 3 may now take over; node 5 still may not.
        t.acquire_buffer(StreamId(100), NodeId(3)).unwrap();
        assert!(t.acquire_buffer(StreamId(100), NodeId(5)).is_err());

        t.mark_user_status(StreamId(100), NodeId(3), ReleaseState::Released)
            .unwrap();
        t.acquire_buffer(StreamId(100), NodeId(5)).unwrap();

        // Acquisition happened exactly once despite three successful gets.
        assert_eq!(provider.acquired.lock().len(), 1);
    }

    #[test]
    fn test_sticky_acquire_failure_still_drains() {
        let provider = MockProvider::new(true);
        let sink = Arc::new(MockSink::default());
        let observer = Arc::new(MockObserver::default());
        let t = tracker(&provider, &sink);
        t.register_observer(
            Arc::downgrade(&observer) as Weak<dyn LifecycleObserver>
        );

        let result = t.acquire_buffer(StreamId(100), NodeId(2));
        assert!(matches!(result, Err(PipelineError::BufferUnavailable(_))));

        // The failure was reported through the sink exactly once.
        let failures: usize = sink
            .results
            .lock()
            .iter()
            .map(|r| r.failed_streams.len())
            .sum();
        assert_eq!(failures, 1);

        // The requesting user was force-released; the rest still drain.
        t.mark_user_status(StreamId(100), NodeId(3), ReleaseState::Released)
            .unwrap();
        t.mark_user_status(StreamId(100), NodeId(5), ReleaseState::Released)
            .unwrap();

        assert!(t.is_released());
        let events = observer.events.lock();
        assert_eq!(
            events
                .iter()
                .filter(|e| **e == LifecycleEvent::FrameReleased)
                .count(),
            1
        );
        // Nothing physical was ever acquired, so nothing is returned.
        assert!(provider.released.lock().is_empty());
    }

    #[test]
    fn test_frame_released_exactly_once_with_milestones_first() {
        let provider = MockProvider::new(false);
        let sink = Arc::new(MockSink::default());
        let observer = Arc::new(MockObserver::default());
        let t = tracker(&provider, &sink);
        t.register_observer(
            Arc::downgrade(&observer) as Weak<dyn LifecycleObserver>
        );

        for node in [2, 3, 5] {
            t.mark_user_status(StreamId(100), NodeId(node), ReleaseState::Released)
                .unwrap();
        }

        let events = observer.events.lock();
        let released_pos = events
            .iter()
            .position(|e| *e == LifecycleEvent::FrameReleased)
            .unwrap();
        let image_pos = events
            .iter()
            .position(|e| *e == LifecycleEvent::AllOutImageBuffersReleased(NodeId(2)))
            .unwrap();
        assert!(image_pos < released_pos);
        assert_eq!(
            events
                .iter()
                .filter(|e| **e == LifecycleEvent::FrameReleased)
                .count(),
            1
        );

        // Exactly one frame-end result.
        let ends = sink.results.lock().iter().filter(|r| r.frame_end).count();
        assert_eq!(ends, 1);
    }

    #[test]
    fn test_meta_milestone_reports_partial_result() {
        let provider = MockProvider::new(false);
        let sink = Arc::new(MockSink::default());
        let topo = [NodeId(1), NodeId(2)];
        let meta = Arc::new(StreamInfo::metadata(StreamId(200), StreamOrigin::App));
        let t = BufferLifecycleTracker::new(
            9,
            4,
            0,
            &topo,
            &[meta],
            |node, _| {
                if node.0 == 1 {
                    UserRole::Producer
                } else {
                    UserRole::Consumer
                }
            },
            Arc::downgrade(&provider) as Weak<dyn BufferProvider>,
            Arc::downgrade(&sink) as Weak<dyn ResultSink>,
        );

        t.mark_user_status(StreamId(200), NodeId(1), ReleaseState::Released)
            .unwrap();
        let results = sink.results.lock();
        let partial = results
            .iter()
            .find(|r| !r.produced_meta.is_empty())
            .expect("meta milestone result");
        assert_eq!(partial.produced_meta, vec![StreamId(200)]);
        assert_eq!(partial.outstanding_meta, 0);
        assert!(!partial.frame_end);
        assert_eq!(StreamKind::Metadata, BufferCategory::AppMeta.kind());
    }
}
