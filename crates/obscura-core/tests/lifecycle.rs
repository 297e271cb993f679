//! End-to-end buffer lifecycle behavior over bound frames.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use obscura_core::{
    BufferHandle, BufferProvider, BufferUsage, Frame, FrameRequest, InFlightRegistry,
    LifecycleEvent, LifecycleObserver, NodeRegistry, PartialResult, PipelineError, ReleaseState,
    Result, ResultSink, StreamId, StreamInfo, StreamOrigin,
};
use obscura_graph::{Graph, NodeId};
use parking_lot::Mutex;

struct CountingProvider {
    acquired: Mutex<Vec<StreamId>>,
    released: Mutex<Vec<StreamId>>,
}

impl CountingProvider {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            acquired: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
        })
    }
}

impl BufferProvider for CountingProvider {
    fn acquire_buffer(&self, _request_no: u64, info: &StreamInfo) -> Result<BufferHandle> {
        self.acquired.lock().push(info.id);
        Ok(BufferHandle { raw: info.id.0 })
    }

    fn release_buffer(&self, _request_no: u64, stream: StreamId, _buffer: BufferHandle) {
        self.released.lock().push(stream);
    }
}

#[derive(Default)]
struct CollectingSink {
    results: Mutex<Vec<PartialResult>>,
}

impl ResultSink for CollectingSink {
    fn on_result(&self, _request_no: u64, _user_id: u32, result: PartialResult) {
        self.results.lock().push(result);
    }
}

#[derive(Default)]
struct CollectingObserver {
    events: Mutex<Vec<(u64, LifecycleEvent)>>,
}

impl LifecycleObserver for CollectingObserver {
    fn on_lifecycle_event(&self, frame_no: u64, event: LifecycleEvent) {
        self.events.lock().push((frame_no, event));
    }
}

/// Chain 2 → 3 → 5. Node 2 produces image stream 100; nodes 3 and 5
/// consume it. Node 3 additionally produces metadata stream 200, which
/// node 5 consumes.
fn pipeline() -> (Graph, NodeRegistry) {
    let mut graph = Graph::new();
    for id in [2, 3, 5] {
        graph.add_node(NodeId(id), 0).unwrap();
    }
    graph.add_edge(NodeId(2), NodeId(3)).unwrap();
    graph.add_edge(NodeId(3), NodeId(5)).unwrap();
    graph.set_root_nodes(&[NodeId(2)]).unwrap();

    let mut registry = NodeRegistry::new();
    registry
        .register_stream(Arc::new(StreamInfo::image(
            StreamId(100),
            StreamOrigin::Internal,
            1920,
            1080,
            0,
        )))
        .unwrap();
    registry
        .register_stream(Arc::new(StreamInfo::metadata(
            StreamId(200),
            StreamOrigin::App,
        )))
        .unwrap();
    registry
        .register_node_io(
            NodeId(2),
            BTreeSet::new(),
            BTreeSet::from([StreamId(100)]),
            BufferUsage::default(),
        )
        .unwrap();
    registry
        .register_node_io(
            NodeId(3),
            BTreeSet::from([StreamId(100)]),
            BTreeSet::from([StreamId(200)]),
            BufferUsage::default(),
        )
        .unwrap();
    registry
        .register_node_io(
            NodeId(5),
            BTreeSet::from([StreamId(100), StreamId(200)]),
            BTreeSet::new(),
            BufferUsage::default(),
        )
        .unwrap();

    (graph, registry)
}

fn bind(
    provider: &Arc<CountingProvider>,
    sink: &Arc<CollectingSink>,
) -> Arc<Frame> {
    let (graph, registry) = pipeline();
    Frame::bind(
        &FrameRequest {
            request_no: 42,
            ..FrameRequest::default()
        },
        1,
        0,
        &graph,
        &registry,
        Arc::downgrade(provider) as Weak<dyn BufferProvider>,
        Arc::downgrade(sink) as Weak<dyn ResultSink>,
    )
    .unwrap()
}

fn release_all(frame: &Frame) {
    frame
        .mark_user_status(StreamId(100), NodeId(2), ReleaseState::Released)
        .unwrap();
    frame
        .mark_user_status(StreamId(100), NodeId(3), ReleaseState::Released)
        .unwrap();
    frame
        .mark_user_status(StreamId(200), NodeId(3), ReleaseState::Released)
        .unwrap();
    frame
        .mark_user_status(StreamId(100), NodeId(5), ReleaseState::Released)
        .unwrap();
    frame
        .mark_user_status(StreamId(200), NodeId(5), ReleaseState::Released)
        .unwrap();
}

#[test]
fn stream_returned_only_after_last_user_releases() {
    let provider = CountingProvider::new();
    let sink = Arc::new(CollectingSink::default());
    let frame = bind(&provider, &sink);

    frame.get_image_buffer(StreamId(100), NodeId(2)).unwrap();

    frame
        .mark_user_status(StreamId(100), NodeId(2), ReleaseState::Released)
        .unwrap();
    assert!(provider.released.lock().is_empty(), "producer release alone must not return");

    frame
        .mark_user_status(StreamId(100), NodeId(3), ReleaseState::Released)
        .unwrap();
    assert!(provider.released.lock().is_empty(), "one consumer outstanding");

    frame
        .mark_user_status(StreamId(100), NodeId(5), ReleaseState::Released)
        .unwrap();
    assert_eq!(provider.released.lock().as_slice(), &[StreamId(100)]);
}

#[test]
fn handoff_is_strictly_in_topological_order() {
    let provider = CountingProvider::new();
    let sink = Arc::new(CollectingSink::default());
    let frame = bind(&provider, &sink);

    // Node 5 cannot take stream 100 while nodes 2 and 3 hold it.
    assert!(matches!(
        frame.get_image_buffer(StreamId(100), NodeId(5)),
        Err(PipelineError::BufferUnavailable(_))
    ));

    frame.get_image_buffer(StreamId(100), NodeId(2)).unwrap();
    frame
        .mark_user_status(StreamId(100), NodeId(2), ReleaseState::PreReleased)
        .unwrap();

    frame.get_image_buffer(StreamId(100), NodeId(3)).unwrap();
    frame
        .mark_user_status(StreamId(100), NodeId(3), ReleaseState::Released)
        .unwrap();

    frame.get_image_buffer(StreamId(100), NodeId(5)).unwrap();
    // Lazy acquisition: exactly one physical acquire for three handoffs.
    assert_eq!(provider.acquired.lock().len(), 1);
}

#[test]
fn frame_released_fires_once_and_last() {
    let provider = CountingProvider::new();
    let sink = Arc::new(CollectingSink::default());
    let frame = bind(&provider, &sink);
    let observer = Arc::new(CollectingObserver::default());
    frame.register_observer(Arc::downgrade(&observer) as Weak<dyn LifecycleObserver>);

    release_all(&frame);

    let events = observer.events.lock();
    let released: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, (_, e))| *e == LifecycleEvent::FrameReleased)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(released.len(), 1, "FrameReleased must fire exactly once");
    assert_eq!(released[0], events.len() - 1, "FrameReleased must fire last");

    // Both per-node output milestones preceded it.
    assert!(events.iter().any(|(_, e)| matches!(
        e,
        LifecycleEvent::AllOutImageBuffersReleased(NodeId(2))
    )));
    assert!(events.iter().any(|(_, e)| matches!(
        e,
        LifecycleEvent::AllOutMetaBuffersReleased(NodeId(3))
    )));

    // Exactly one frame-end result delivery.
    let ends = sink.results.lock().iter().filter(|r| r.frame_end).count();
    assert_eq!(ends, 1);
}

#[test]
fn frame_released_waits_for_stalled_milestone_delivery() {
    /// Stalls inside the metadata milestone delivery and records the order
    /// in which events actually arrive.
    struct StallingObserver {
        events: Mutex<Vec<LifecycleEvent>>,
    }

    impl LifecycleObserver for StallingObserver {
        fn on_lifecycle_event(&self, _frame_no: u64, event: LifecycleEvent) {
            if matches!(event, LifecycleEvent::AllOutMetaBuffersReleased(_)) {
                std::thread::sleep(std::time::Duration::from_millis(150));
            }
            self.events.lock().push(event);
        }
    }

    // Two independent producers: node 1 emits image stream 100, node 2
    // emits metadata stream 200. Their final releases race on two threads.
    let mut graph = Graph::new();
    graph.add_node(NodeId(1), 0).unwrap();
    graph.add_node(NodeId(2), 0).unwrap();
    graph.add_edge(NodeId(1), NodeId(2)).unwrap();
    graph.set_root_nodes(&[NodeId(1)]).unwrap();

    let mut registry = NodeRegistry::new();
    registry
        .register_stream(Arc::new(StreamInfo::image(
            StreamId(100),
            StreamOrigin::Internal,
            640,
            480,
            0,
        )))
        .unwrap();
    registry
        .register_stream(Arc::new(StreamInfo::metadata(
            StreamId(200),
            StreamOrigin::App,
        )))
        .unwrap();
    registry
        .register_node_io(
            NodeId(1),
            BTreeSet::new(),
            BTreeSet::from([StreamId(100)]),
            BufferUsage::default(),
        )
        .unwrap();
    registry
        .register_node_io(
            NodeId(2),
            BTreeSet::new(),
            BTreeSet::from([StreamId(200)]),
            BufferUsage::default(),
        )
        .unwrap();

    let provider = CountingProvider::new();
    let sink = Arc::new(CollectingSink::default());
    let frame = Frame::bind(
        &FrameRequest::default(),
        1,
        0,
        &graph,
        &registry,
        Arc::downgrade(&provider) as Weak<dyn BufferProvider>,
        Arc::downgrade(&sink) as Weak<dyn ResultSink>,
    )
    .unwrap();
    let observer = Arc::new(StallingObserver {
        events: Mutex::new(Vec::new()),
    });
    frame.register_observer(Arc::downgrade(&observer) as Weak<dyn LifecycleObserver>);

    // The metadata milestone delivery stalls on this thread while the final
    // image release lands on the main thread.
    let meta_release = {
        let frame = Arc::clone(&frame);
        std::thread::spawn(move || {
            frame
                .mark_user_status(StreamId(200), NodeId(2), ReleaseState::Released)
                .unwrap();
        })
    };
    std::thread::sleep(std::time::Duration::from_millis(30));
    frame
        .mark_user_status(StreamId(100), NodeId(1), ReleaseState::Released)
        .unwrap();
    meta_release.join().unwrap();

    let events = observer.events.lock();
    let released = events
        .iter()
        .position(|e| *e == LifecycleEvent::FrameReleased)
        .unwrap();
    let meta = events
        .iter()
        .position(|e| *e == LifecycleEvent::AllOutMetaBuffersReleased(NodeId(2)))
        .unwrap();
    assert_eq!(
        released,
        events.len() - 1,
        "FrameReleased must arrive after every milestone delivery"
    );
    assert!(meta < released);
    assert_eq!(
        events
            .iter()
            .filter(|e| **e == LifecycleEvent::FrameReleased)
            .count(),
        1
    );
}

#[test]
fn acquire_failure_reports_once_and_frame_still_drains() {
    struct FailingProvider;
    impl BufferProvider for FailingProvider {
        fn acquire_buffer(&self, _request_no: u64, info: &StreamInfo) -> Result<BufferHandle> {
            Err(PipelineError::BufferUnavailable(info.id))
        }
        fn release_buffer(&self, _request_no: u64, _stream: StreamId, _buffer: BufferHandle) {}
    }

    let provider = Arc::new(FailingProvider);
    let sink = Arc::new(CollectingSink::default());
    let (graph, registry) = pipeline();
    let frame = Frame::bind(
        &FrameRequest {
            request_no: 1,
            ..FrameRequest::default()
        },
        1,
        0,
        &graph,
        &registry,
        Arc::downgrade(&provider) as Weak<dyn BufferProvider>,
        Arc::downgrade(&sink) as Weak<dyn ResultSink>,
    )
    .unwrap();

    // First failure is reported; the retry is refused without re-asking the
    // provider.
    assert!(frame.get_image_buffer(StreamId(100), NodeId(2)).is_err());
    assert!(frame.get_image_buffer(StreamId(100), NodeId(2)).is_err());
    let failures: usize = sink
        .results
        .lock()
        .iter()
        .map(|r| r.failed_streams.len())
        .sum();
    assert_eq!(failures, 1);

    // The force-released producer no longer blocks the rest of the frame.
    frame
        .mark_user_status(StreamId(100), NodeId(3), ReleaseState::Released)
        .unwrap();
    frame
        .mark_user_status(StreamId(200), NodeId(3), ReleaseState::Released)
        .unwrap();
    frame
        .mark_user_status(StreamId(100), NodeId(5), ReleaseState::Released)
        .unwrap();
    frame
        .mark_user_status(StreamId(200), NodeId(5), ReleaseState::Released)
        .unwrap();
    assert!(frame.tracker().is_released());
}

mod release_order_properties {
    use super::*;
    use proptest::prelude::*;

    /// Chain 1 → 2 → … → n; node 1 produces image stream 100, everyone
    /// else consumes it.
    fn chain_frame(n: u64, provider: &Arc<CountingProvider>, sink: &Arc<CollectingSink>) -> Arc<Frame> {
        let mut graph = Graph::new();
        for id in 1..=n {
            graph.add_node(NodeId(id), 0).unwrap();
        }
        for id in 1..n {
            graph.add_edge(NodeId(id), NodeId(id + 1)).unwrap();
        }
        graph.set_root_nodes(&[NodeId(1)]).unwrap();

        let mut registry = NodeRegistry::new();
        registry
            .register_stream(Arc::new(StreamInfo::image(
                StreamId(100),
                StreamOrigin::Internal,
                640,
                480,
                0,
            )))
            .unwrap();
        for id in 1..=n {
            let (inputs, outputs) = if id == 1 {
                (BTreeSet::new(), BTreeSet::from([StreamId(100)]))
            } else {
                (BTreeSet::from([StreamId(100)]), BTreeSet::new())
            };
            registry
                .register_node_io(NodeId(id), inputs, outputs, BufferUsage::default())
                .unwrap();
        }

        Frame::bind(
            &FrameRequest::default(),
            0,
            0,
            &graph,
            &registry,
            Arc::downgrade(provider) as Weak<dyn BufferProvider>,
            Arc::downgrade(sink) as Weak<dyn ResultSink>,
        )
        .unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Whatever order the users release in, the buffer goes back to the
        /// provider exactly once, only after the last release, and the
        /// frame ends up fully released.
        #[test]
        fn returned_once_after_final_release(
            (n, order) in (2u64..7).prop_flat_map(|n| {
                (Just(n), Just((1..=n).collect::<Vec<u64>>()).prop_shuffle())
            }),
        ) {
            let provider = CountingProvider::new();
            let sink = Arc::new(CollectingSink::default());
            let frame = chain_frame(n, &provider, &sink);
            frame.get_image_buffer(StreamId(100), NodeId(1)).unwrap();

            for (i, &node) in order.iter().enumerate() {
                frame
                    .mark_user_status(StreamId(100), NodeId(node), ReleaseState::Released)
                    .unwrap();
                if i + 1 < order.len() {
                    prop_assert!(provider.released.lock().is_empty());
                }
            }
            prop_assert_eq!(provider.released.lock().len(), 1);
            prop_assert!(frame.tracker().is_released());
        }
    }
}

#[test]
fn inflight_waiters_wake_on_drain() {
    let provider = CountingProvider::new();
    let sink = Arc::new(CollectingSink::default());
    let frame = bind(&provider, &sink);

    let inflight = Arc::new(InFlightRegistry::new());
    frame.register_observer(Arc::downgrade(&inflight) as Weak<dyn LifecycleObserver>);
    inflight.register_request(&frame);
    assert_eq!(inflight.pending_count(), 1);

    let waiter = {
        let inflight = Arc::clone(&inflight);
        std::thread::spawn(move || {
            inflight.wait_until_node_drained(NodeId(3));
            inflight.wait_until_drained();
        })
    };

    std::thread::sleep(std::time::Duration::from_millis(20));
    release_all(&frame);

    waiter.join().unwrap();
    assert!(inflight.is_drained());
}
