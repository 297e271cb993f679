//! The pipeline context: configuration, queuing, and flush orchestration.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use crossbeam_channel::{Receiver, Sender, bounded};
use obscura_graph::{Graph, NodeId};
use parking_lot::{Mutex, RwLock};

use crate::actor::{
    BufferProvider, FrameDispatcher, LifecycleObserver, PipelineNode, ResultSink,
};
use crate::config::SchedulerConfig;
use crate::error::{PipelineError, Result};
use crate::frame::{Frame, FrameNumberAllocator, FrameRequest};
use crate::inflight::InFlightRegistry;
use crate::registry::NodeRegistry;
use crate::scheduler::dispatcher::FanInDispatcher;
use crate::stream::{BufferUsage, StreamId, StreamInfo};

/// Lifecycle of one context generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextState {
    /// Freshly created; configuration has not begun.
    Created,
    /// Between `begin_configure` and a successful `end_configure`.
    Configuring,
    /// Accepting frames.
    Configured,
    /// A flush is in progress.
    Flushing,
    /// Fully drained and retired; only readable.
    Drained,
}

/// One generation's configuration: the graph, the registry, and the actor
/// table the graph's node values index into.
#[derive(Default)]
struct Generation {
    graph: Graph,
    registry: NodeRegistry,
    actors: Vec<Arc<dyn PipelineNode>>,
    // Nodes adopted from the previous generation; skipped at init.
    reused: BTreeSet<NodeId>,
}

impl Generation {
    fn actor(&self, graph: &Graph, id: NodeId) -> Result<Arc<dyn PipelineNode>> {
        let index = graph.node(id)?.value;
        self.actors
            .get(index)
            .cloned()
            .ok_or(PipelineError::DeadObject("node actor table"))
    }
}

/// The scheduler: owns one configuration generation, binds requests into
/// frames, enqueues them to root nodes with backpressure retry, and drives
/// flush and drain.
///
/// Configuration mutations take the writer lock; per-frame work takes the
/// reader lock so concurrent frames schedule in parallel. The flush flag
/// lives under its own reader-writer lock: every root delivery pass holds
/// the read side, and `begin_flush` sets the flag under the write side, so
/// a flush either waits out an in-progress enqueue or is observed by it —
/// a pass can never race past a flush that already started walking nodes.
pub struct PipelineContext {
    config: SchedulerConfig,
    inner: RwLock<Generation>,
    state: Mutex<ContextState>,
    flushing: RwLock<bool>,
    previous: Mutex<Option<Arc<PipelineContext>>>,
    last_frame: Mutex<Option<Arc<Frame>>>,
    allocator: FrameNumberAllocator,
    inflight: Arc<InFlightRegistry>,
    dispatcher: RwLock<Option<Arc<dyn FrameDispatcher>>>,
    provider: Weak<dyn BufferProvider>,
    sink: Weak<dyn ResultSink>,
    // Authoritative "ready to enqueue" wakeup; the retry timeout is only a
    // safety net.
    ready_tx: Sender<()>,
    ready_rx: Receiver<()>,
}

impl PipelineContext {
    /// Creates an unconfigured context.
    pub fn new(
        config: SchedulerConfig,
        provider: Weak<dyn BufferProvider>,
        sink: Weak<dyn ResultSink>,
    ) -> Arc<Self> {
        let (ready_tx, ready_rx) = bounded(config.ready_channel_capacity);
        Arc::new(Self {
            config,
            inner: RwLock::new(Generation::default()),
            state: Mutex::new(ContextState::Created),
            flushing: RwLock::new(false),
            previous: Mutex::new(None),
            last_frame: Mutex::new(None),
            allocator: FrameNumberAllocator::new(),
            inflight: Arc::new(InFlightRegistry::new()),
            dispatcher: RwLock::new(None),
            provider,
            sink,
            ready_tx,
            ready_rx,
        })
    }

    /// Current generation state.
    pub fn state(&self) -> ContextState {
        *self.state.lock()
    }

    fn require_configuring(&self) -> Result<()> {
        match self.state() {
            ContextState::Configuring => Ok(()),
            ContextState::Created => Err(PipelineError::NotInitialized),
            _ => Err(PipelineError::InvalidOperation(
                "configuration is closed for this generation",
            )),
        }
    }

    // --- Configuration ---

    /// Opens configuration, optionally adopting a previous generation for
    /// node/stream reuse.
    ///
    /// Blocks until the previous generation is fully drained. Passing the
    /// context itself as its own previous generation is an
    /// `InvalidOperation`.
    pub fn begin_configure(&self, previous: Option<&Arc<PipelineContext>>) -> Result<()> {
        if *self.state.lock() != ContextState::Created {
            return Err(PipelineError::InvalidOperation(
                "configuration already began",
            ));
        }
        if let Some(prev) = previous {
            if core::ptr::eq(Arc::as_ptr(prev), self) {
                return Err(PipelineError::InvalidOperation(
                    "previous generation is this context",
                ));
            }
            tracing::debug!("configure: waiting for previous generation to drain");
            prev.wait_until_drained();
            *prev.state.lock() = ContextState::Drained;
            *self.previous.lock() = Some(Arc::clone(prev));
        }
        *self.state.lock() = ContextState::Configuring;
        Ok(())
    }

    /// Adds a node backed by an actor.
    pub fn add_node(&self, id: NodeId, actor: Arc<dyn PipelineNode>) -> Result<()> {
        self.require_configuring()?;
        let mut inner = self.inner.write();
        let index = inner.actors.len();
        inner.graph.add_node(id, index)?;
        inner.actors.push(actor);
        Ok(())
    }

    /// Registers a stream descriptor.
    pub fn add_stream(&self, info: Arc<StreamInfo>) -> Result<()> {
        self.require_configuring()?;
        self.inner.write().registry.register_stream(info)
    }

    /// Declares a node's stream I/O.
    pub fn set_node_io(
        &self,
        node: NodeId,
        inputs: BTreeSet<StreamId>,
        outputs: BTreeSet<StreamId>,
        usage: BufferUsage,
    ) -> Result<()> {
        self.require_configuring()?;
        let mut inner = self.inner.write();
        if !inner.graph.contains(node) {
            return Err(PipelineError::NodeNotFound(node));
        }
        inner.registry.register_node_io(node, inputs, outputs, usage)
    }

    /// Adds an edge between two existing nodes. Adding the same edge twice
    /// is a no-op.
    pub fn add_edge(&self, src: NodeId, dst: NodeId) -> Result<()> {
        self.require_configuring()?;
        Ok(self.inner.write().graph.add_edge(src, dst)?)
    }

    /// Removes an edge.
    pub fn remove_edge(&self, src: NodeId, dst: NodeId) -> Result<()> {
        self.require_configuring()?;
        Ok(self.inner.write().graph.remove_edge(src, dst)?)
    }

    /// Declares the root set.
    pub fn set_root_nodes(&self, ids: &[NodeId]) -> Result<()> {
        self.require_configuring()?;
        Ok(self.inner.write().graph.set_root_nodes(ids)?)
    }

    fn previous_generation(&self) -> Result<Arc<PipelineContext>> {
        self.previous
            .lock()
            .clone()
            .ok_or(PipelineError::InvalidOperation("no previous generation"))
    }

    /// Adopts a node (and its actor and I/O declaration) from the previous
    /// generation verbatim, skipping reinitialization.
    ///
    /// Streams the node's declaration references must already be present;
    /// reuse them first with [`reuse_stream`](Self::reuse_stream).
    pub fn reuse_node(&self, id: NodeId) -> Result<()> {
        self.require_configuring()?;
        let prev = self.previous_generation()?;
        let prev_inner = prev.inner.read();
        let actor = prev_inner.actor(&prev_inner.graph, id)?;
        let io = prev_inner.registry.node_io(id).ok().cloned();
        drop(prev_inner);

        let mut inner = self.inner.write();
        let index = inner.actors.len();
        inner.graph.add_node(id, index)?;
        inner.actors.push(actor);
        inner.reused.insert(id);
        if let Some(io) = io {
            inner
                .registry
                .register_node_io(id, io.inputs, io.outputs, io.usage)?;
        }
        tracing::debug!("configure: reused node {id}");
        Ok(())
    }

    /// Adopts a stream descriptor from the previous generation verbatim.
    pub fn reuse_stream(&self, id: StreamId) -> Result<()> {
        self.require_configuring()?;
        let prev = self.previous_generation()?;
        let info = prev.inner.read().registry.stream(id)?;
        self.inner.write().registry.register_stream(info)
    }

    /// Reconnects orphaned reused nodes back to the graph under
    /// construction.
    ///
    /// For every orphan, a minimal connecting path is derived from the
    /// previous generation's graph; every node pulled in along the way is
    /// adopted (actor, I/O declaration, and any streams it references) as if
    /// reused explicitly.
    pub fn adopt_orphans(&self, orphans: &[NodeId]) -> Result<()> {
        self.require_configuring()?;
        let prev = self.previous_generation()?;
        let prev_inner = prev.inner.read();

        let mut inner = self.inner.write();
        let known: BTreeSet<NodeId> = inner.graph.node_ids().collect();
        prev_inner
            .graph
            .derive_paths_for_orphans(orphans, &mut inner.graph)?;

        let added: Vec<NodeId> = inner
            .graph
            .node_ids()
            .filter(|id| !known.contains(id))
            .collect();
        for id in added {
            let actor = prev_inner.actor(&prev_inner.graph, id)?;
            let index = inner.actors.len();
            inner.actors.push(actor);
            inner.graph.set_value(id, index)?;
            inner.reused.insert(id);
            if let Ok(io) = prev_inner.registry.node_io(id).cloned() {
                for stream in io.inputs.iter().chain(io.outputs.iter()) {
                    if !inner.registry.contains_stream(*stream) {
                        let info = prev_inner.registry.stream(*stream)?;
                        inner.registry.register_stream(info)?;
                    }
                }
                inner
                    .registry
                    .register_node_io(id, io.inputs, io.outputs, io.usage)?;
            }
            tracing::debug!("configure: adopted {id} for orphan path");
        }
        Ok(())
    }

    /// Closes configuration: validates the graph, initializes every
    /// newly added actor (`init` then `config`, optionally in parallel),
    /// and installs the default fan-in dispatcher if none was supplied.
    ///
    /// On failure the generation stays in `Configuring`; no partial graph is
    /// ever installed.
    pub fn end_configure(&self, parallel: bool) -> Result<()> {
        self.require_configuring()?;

        let (actors, fresh) = {
            let mut inner = self.inner.write();
            if inner.graph.roots().is_empty() {
                return Err(PipelineError::BadValue("empty root set".into()));
            }
            let order = inner.graph.toposort()?;
            tracing::debug!("configure: toposort {order:?}");

            let fresh: Vec<Arc<dyn PipelineNode>> = order
                .iter()
                .filter(|&&id| !inner.reused.contains(&id))
                .map(|&id| inner.actor(&inner.graph, id))
                .collect::<Result<_>>()?;
            (inner.actors.clone(), fresh)
        };

        if parallel {
            std::thread::scope(|scope| {
                let handles: Vec<_> = fresh
                    .iter()
                    .map(|actor| scope.spawn(move || actor.init().and_then(|()| actor.config())))
                    .collect();
                for handle in handles {
                    handle
                        .join()
                        .map_err(|_| {
                            PipelineError::InvalidOperation("node initialization panicked")
                        })??;
                }
                Ok::<(), PipelineError>(())
            })?;
        } else {
            for actor in &fresh {
                actor.init()?;
                actor.config()?;
            }
        }

        {
            let mut dispatcher = self.dispatcher.write();
            if dispatcher.is_none() {
                *dispatcher = Some(Arc::new(FanInDispatcher::new(actors)));
            }
        }

        *self.state.lock() = ContextState::Configured;
        tracing::info!("configure: generation ready");
        Ok(())
    }

    /// Replaces the inter-node dispatcher.
    pub fn set_dispatcher(&self, dispatcher: Arc<dyn FrameDispatcher>) {
        *self.dispatcher.write() = Some(dispatcher);
    }

    // --- Queuing ---

    /// Signals that a previously backpressured node is ready to enqueue;
    /// wakes any frame blocked in queue retry.
    pub fn on_node_ready(&self) {
        let _ = self.ready_tx.try_send(());
    }

    /// Binds a request to the current generation and hands the frame to its
    /// root nodes.
    ///
    /// A root returning [`PipelineError::Backpressure`] is retried on the
    /// ready wakeup (with a bounded timed wait as a safety net) until it
    /// accepts; delivery to the other roots is never duplicated. A flush
    /// beginning while the frame is blocked here reroutes the remaining
    /// roots through their flush path instead. A root failing with any
    /// other error aborts the frame: it is removed from the in-flight
    /// registry before the error propagates, so drain waits cannot hang on
    /// a frame no node will ever release.
    pub fn queue(&self, request: &FrameRequest) -> Result<Arc<Frame>> {
        match self.state() {
            ContextState::Configured | ContextState::Flushing => {}
            ContextState::Created | ContextState::Configuring => {
                return Err(PipelineError::NotInitialized);
            }
            ContextState::Drained => {
                return Err(PipelineError::InvalidOperation(
                    "context is drained",
                ));
            }
        }

        let (frame, mut pending) = {
            let inner = self.inner.read();
            let frame = Frame::bind(
                request,
                self.allocator.next(),
                self.config.user_id,
                &inner.graph,
                &inner.registry,
                self.provider.clone(),
                self.sink.clone(),
            )?;
            let mut roots = Vec::new();
            for &root in frame.graph().roots() {
                roots.push((root, inner.actor(frame.graph(), root)?));
            }
            (frame, roots)
        };

        frame.register_observer(
            Arc::downgrade(&self.inflight) as Weak<dyn LifecycleObserver>
        );
        self.inflight.register_request(&frame);
        *self.last_frame.lock() = Some(Arc::clone(&frame));
        // An empty frame has nothing to drain; complete it immediately.
        frame.tracker().evaluate_completion();

        loop {
            // The read guard spans the whole delivery pass: a flush that
            // begins mid-pass blocks on the write side until every enqueue
            // of the pass has landed, instead of walking flush paths under
            // a half-delivered frame.
            let flushing = self.flushing.read();
            if *flushing {
                tracing::debug!(
                    "queue: frame {} rerouted to flush path",
                    frame.frame_no()
                );
                for (root, actor) in &pending {
                    tracing::trace!("queue: flush_frame {} at {root}", frame.frame_no());
                    if let Err(err) = actor.flush_frame(&frame) {
                        drop(flushing);
                        self.abandon(&frame, &err);
                        return Err(err);
                    }
                }
                return Ok(frame);
            }

            let mut backpressured = Vec::new();
            for (root, actor) in pending {
                match actor.queue(&frame) {
                    Ok(()) => {
                        tracing::trace!("queue: frame {} accepted by {root}", frame.frame_no());
                    }
                    Err(PipelineError::Backpressure) => backpressured.push((root, actor)),
                    Err(err) => {
                        tracing::warn!(
                            "queue: frame {} hard-failed at {root}: {err}",
                            frame.frame_no()
                        );
                        drop(flushing);
                        self.abandon(&frame, &err);
                        return Err(err);
                    }
                }
            }
            drop(flushing);
            if backpressured.is_empty() {
                return Ok(frame);
            }
            pending = backpressured;
            let _ = self.ready_rx.recv_timeout(self.config.retry_interval());
        }
    }

    /// Drops a frame whose root delivery hard-failed from the in-flight
    /// registry, so drain waits never hang on a frame no node ever saw.
    fn abandon(&self, frame: &Frame, err: &PipelineError) {
        tracing::warn!(
            "queue: abandoning frame {} after root failure: {err}",
            frame.frame_no()
        );
        self.inflight.discard(frame.frame_no());
    }

    /// Forwards a finished frame along its out-edges via the installed
    /// dispatcher.
    pub fn dispatch(&self, frame: &Arc<Frame>, from: NodeId) -> Result<()> {
        let dispatcher = self
            .dispatcher
            .read()
            .clone()
            .ok_or(PipelineError::NotInitialized)?;
        dispatcher.on_dispatch_frame(frame, from)
    }

    // --- Flush & drain ---

    /// Flushes the context: kicks and flushes every node, then blocks until
    /// everything in flight has drained.
    pub fn flush(&self) -> Result<()> {
        self.begin_flush()?;
        self.wait_until_drained();
        self.end_flush()
    }

    /// Marks the context flushing, kicks the most recent frame's holders,
    /// and runs every node's flush path. Double-flush is an
    /// `InvalidOperation`.
    pub fn begin_flush(&self) -> Result<()> {
        {
            // Blocks until no root delivery pass holds the read side.
            let mut flushing = self.flushing.write();
            if *flushing {
                return Err(PipelineError::InvalidOperation("flush already in progress"));
            }
            *flushing = true;
        }
        *self.state.lock() = ContextState::Flushing;
        // Wake any frame blocked in queue retry so it sees the flag.
        let _ = self.ready_tx.try_send(());

        let actors = self.inner.read().actors.clone();
        let last = self.last_frame.lock().clone();
        if let Some(frame) = last {
            tracing::debug!("flush: kicking holders of frame {}", frame.frame_no());
            for actor in &actors {
                actor.kick();
            }
        }
        for actor in &actors {
            if let Err(err) = actor.flush() {
                tracing::warn!("flush: node flush failed: {err}");
            }
        }
        Ok(())
    }

    /// Clears the flushing flag and returns the context to `Configured`.
    pub fn end_flush(&self) -> Result<()> {
        let mut flushing = self.flushing.write();
        if !*flushing {
            return Err(PipelineError::InvalidOperation("no flush in progress"));
        }
        *flushing = false;
        *self.state.lock() = ContextState::Configured;
        Ok(())
    }

    /// Blocks until no frame is in flight.
    pub fn wait_until_drained(&self) {
        self.inflight.wait_until_drained();
    }

    /// Blocks until a node has released all its output buffers.
    pub fn wait_until_node_drained(&self, node: NodeId) {
        self.inflight.wait_until_node_drained(node);
    }

    /// The in-flight registry of this generation.
    pub fn inflight(&self) -> &Arc<InFlightRegistry> {
        &self.inflight
    }

    /// Resets the frame-number sequence. Control action; never implicit.
    pub fn reset_frame_numbers(&self) {
        self.allocator.reset();
    }
}
