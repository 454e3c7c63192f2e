use std::sync::Arc;

use slotmap::{SecondaryMap, SlotMap};

use crate::{
    Backend, FrameContext, FrameReport, GraphConfig, GraphError, Node, NodeId, SubmitDescriptor,
    SyncPrimitive, Task, WaitEntry,
    execute::{Job, scatter},
    report::{FailureStage, NodeFailure},
    sort::{self, SortError},
    sync::{QueueFences, SyncAllocator},
};

///Scope of a graph. Decides how edges are synchronised, and how the execution order is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphKind {
    ///All nodes on one queue. Edges are backed by the producer's event.
    SingleQueue,
    ///Nodes on any number of queues. Edges crossing a queue are backed by a semaphore, all others by the producer's event.
    MultiQueue,
    ///Render pass local graph on a single queue. Layered breadth first, every edge is backed by a semaphore. Has no fences.
    Subpass,
}

impl GraphKind {
    fn uses_fences(&self) -> bool {
        !matches!(self, GraphKind::Subpass)
    }

    fn uses_events(&self) -> bool {
        !matches!(self, GraphKind::Subpass)
    }

    fn edge_uses_semaphore(&self, same_queue: bool) -> bool {
        match self {
            GraphKind::SingleQueue => false,
            GraphKind::MultiQueue => !same_queue,
            GraphKind::Subpass => true,
        }
    }
}

///Step of the frame protocol a graph is currently in. See [Graph::execute].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    Idle,
    Began,
    Recorded,
    Submitted,
}

///Consecutive nodes of one queue that are submitted in a single call.
struct Batch<B: Backend> {
    queue: B::Queue,
    members: Vec<usize>,
}

///Everything [Graph::bake] produces. All vectors are index aligned with `order`.
struct Baked<B: Backend> {
    version: u64,
    order: Vec<NodeId>,
    index_of: SecondaryMap<NodeId, usize>,
    layers: Vec<Vec<NodeId>>,
    descriptors: Vec<SubmitDescriptor<B>>,
    events: Vec<B::Event>,
    event_waits: Vec<Vec<(B::Event, B::Stage)>>,
    edge_semaphores: Vec<B::Semaphore>,
    batches: Vec<Batch<B>>,
}

impl<B: Backend> Baked<B> {
    fn new(
        version: u64,
        order: Vec<NodeId>,
        index_of: SecondaryMap<NodeId, usize>,
        layers: Vec<Vec<NodeId>>,
    ) -> Self {
        let count = order.len();
        Baked {
            version,
            order,
            index_of,
            layers,
            descriptors: Vec::with_capacity(count),
            events: Vec::with_capacity(count),
            event_waits: Vec::with_capacity(count),
            edge_semaphores: Vec::new(),
            batches: Vec::new(),
        }
    }

    fn recycle_into(self, sync: &mut SyncAllocator<B>) {
        for event in self.events {
            sync.recycle_event(event);
        }
        for sem in self.edge_semaphores {
            sync.recycle_semaphore(sem);
        }
    }
}

///Baked frame graph.
///
/// Nodes are registered with [add_node](Graph::add_node) and connected via [add_input](Graph::add_input). Once the topology
/// is complete it has to be [baked](Graph::bake). After that [execute](Graph::execute) runs a whole frame.
///
/// A frame can also be driven step by step via [begin_frame](Graph::begin_frame), [record](Graph::record),
/// [submit](Graph::submit) and [end_frame](Graph::end_frame). Calling them out of order fails with
/// [OutOfOrder](GraphError::OutOfOrder). If one of them fails, the frame has to be ended via
/// [abort_frame](Graph::abort_frame).
///
/// Changing the topology marks the bake as stale. Depending on [GraphConfig::auto_rebake] the next frame either re-bakes,
/// or fails.
///
/// The graph must be [shut down](Graph::shutdown) before the backend's device is destroyed. If that does not happen, the
/// graph's drop implementation waits for the device to become idle.
pub struct Graph<B: Backend> {
    backend: Arc<B>,
    kind: GraphKind,
    config: GraphConfig,
    nodes: SlotMap<NodeId, Node<B>>,
    registration: Vec<NodeId>,
    ///Bumped on every topology change.
    version: u64,
    baked: Option<Baked<B>>,
    sync: SyncAllocator<B>,
    fences: QueueFences<B>,
    phase: FramePhase,
    frame: u64,
    in_flight: bool,
    report: FrameReport,
    is_shut_down: bool,
}

impl<B: Backend> Graph<B> {
    pub fn new(backend: Arc<B>, kind: GraphKind) -> Self {
        Self::with_config(backend, kind, GraphConfig::default())
    }

    pub fn with_config(backend: Arc<B>, kind: GraphKind, config: GraphConfig) -> Self {
        Graph {
            backend,
            kind,
            config,
            nodes: SlotMap::with_key(),
            registration: Vec::new(),
            version: 0,
            baked: None,
            sync: SyncAllocator::new(),
            fences: QueueFences::new(),
            phase: FramePhase::Idle,
            frame: 0,
            in_flight: false,
            report: FrameReport::default(),
            is_shut_down: false,
        }
    }

    pub fn kind(&self) -> GraphKind {
        self.kind
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    ///Index of the next frame that will be executed.
    pub fn frame_index(&self) -> u64 {
        self.frame
    }

    pub fn len(&self) -> usize {
        self.registration.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registration.is_empty()
    }

    ///Version of the topology. Increases whenever a node or an edge changes.
    pub fn topology_version(&self) -> u64 {
        self.version
    }

    ///True if the graph was never baked, or the topology changed since the last bake.
    pub fn is_dirty(&self) -> bool {
        self.baked
            .as_ref()
            .map(|b| b.version != self.version)
            .unwrap_or(true)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node<B>> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node<B>> {
        self.nodes.get_mut(id)
    }

    ///Iterates all nodes in registration order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node<B>)> + '_ {
        self.registration
            .iter()
            .filter_map(|id| self.nodes.get(*id).map(|n| (*id, n)))
    }

    ///Execution order of the last successful bake.
    pub fn execution_order(&self) -> Option<&[NodeId]> {
        self.baked.as_ref().map(|b| b.order.as_slice())
    }

    ///Breadth first layers of the last bake. Only subpass graphs are layered, for all other kinds this is empty.
    pub fn layers(&self) -> Option<&[Vec<NodeId>]> {
        self.baked.as_ref().map(|b| b.layers.as_slice())
    }

    ///Position of `id` in the baked execution order.
    pub fn execution_index(&self, id: NodeId) -> Option<usize> {
        self.baked
            .as_ref()
            .and_then(|b| b.index_of.get(id).copied())
    }

    ///Submission descriptor of `id` as of the last bake, including the command buffers of the last recorded frame.
    pub fn descriptor(&self, id: NodeId) -> Option<&SubmitDescriptor<B>> {
        let baked = self.baked.as_ref()?;
        baked
            .index_of
            .get(id)
            .map(|idx| &baked.descriptors[*idx])
    }

    ///The event `id` signals on completion.
    pub fn event_of(&self, id: NodeId) -> Option<B::Event> {
        let baked = self.baked.as_ref()?;
        baked.index_of.get(id).map(|idx| baked.events[*idx])
    }

    ///Fence that paces `queue`, if the graph uses fences and the queue is part of the last bake.
    pub fn fence(&self, queue: B::Queue) -> Option<B::Fence> {
        self.fences.fence_for(queue)
    }

    ///Submission calls of a frame in the order they happen, each with the nodes that are part of it.
    pub fn batches(&self) -> Vec<(B::Queue, Vec<NodeId>)> {
        match &self.baked {
            Some(baked) => baked
                .batches
                .iter()
                .map(|b| {
                    (
                        b.queue,
                        b.members.iter().map(|idx| baked.order[*idx]).collect(),
                    )
                })
                .collect(),
            None => Vec::new(),
        }
    }

    fn touch(&mut self) {
        self.version += 1;
    }

    fn ensure_idle(&self) -> Result<(), GraphError> {
        if self.phase == FramePhase::Idle {
            Ok(())
        } else {
            Err(GraphError::MidFrame)
        }
    }

    fn ensure_alive(&self) -> Result<(), GraphError> {
        if self.is_shut_down {
            Err(GraphError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn expect_phase(&self, expected: FramePhase, requested: FramePhase) -> Result<(), GraphError> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(GraphError::OutOfOrder {
                current: self.phase,
                requested,
            })
        }
    }

    fn contains(&self, id: NodeId) -> Result<(), GraphError> {
        if self.nodes.contains_key(id) {
            Ok(())
        } else {
            Err(GraphError::UnknownNode(id))
        }
    }

    ///Registers a new node that submits to `queue`. Its consumers wait for `signal_stage`.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        queue: B::Queue,
        signal_stage: B::Stage,
        task: impl Task<B> + 'static,
    ) -> NodeId {
        let id = self
            .nodes
            .insert(Node::new(name.into(), queue, signal_stage, Box::new(task)));
        self.registration.push(id);
        self.touch();
        id
    }

    ///Removes the node and all edges to it. The node's task is handed back, so any resources it owns can be
    /// reclaimed by the caller.
    pub fn remove_node(&mut self, id: NodeId) -> Result<Box<dyn Task<B>>, GraphError> {
        self.ensure_idle()?;
        let node = self.nodes.remove(id).ok_or(GraphError::UnknownNode(id))?;
        for producer in node.inputs.iter() {
            if let Some(p) = self.nodes.get_mut(*producer) {
                p.outputs.retain(|o| *o != id);
            }
        }
        for consumer in node.outputs.iter() {
            if let Some(c) = self.nodes.get_mut(*consumer) {
                c.inputs.retain(|i| *i != id);
            }
        }
        self.registration.retain(|r| *r != id);
        self.touch();

        #[cfg(feature = "logging")]
        log::trace!("Removed node \"{}\"", node.name);

        Ok(node.task)
    }

    ///Declares that `consumer` depends on `producer`. Returns false if the edge already existed.
    ///
    /// Self edges are accepted here, but make the next [bake](Graph::bake) fail.
    pub fn add_input(&mut self, consumer: NodeId, producer: NodeId) -> Result<bool, GraphError> {
        self.ensure_idle()?;
        self.contains(consumer)?;
        self.contains(producer)?;

        if self.nodes[consumer].inputs.contains(&producer) {
            return Ok(false);
        }
        self.nodes[consumer].inputs.push(producer);
        self.nodes[producer].outputs.push(consumer);
        self.touch();
        Ok(true)
    }

    ///Removes the edge `producer -> consumer`. Returns false if there was none.
    pub fn remove_input(&mut self, consumer: NodeId, producer: NodeId) -> Result<bool, GraphError> {
        self.ensure_idle()?;
        self.contains(consumer)?;
        self.contains(producer)?;

        let Some(pos) = self.nodes[consumer]
            .inputs
            .iter()
            .position(|i| *i == producer)
        else {
            return Ok(false);
        };
        self.nodes[consumer].inputs.remove(pos);
        if let Some(pos) = self.nodes[producer]
            .outputs
            .iter()
            .position(|o| *o == consumer)
        {
            self.nodes[producer].outputs.remove(pos);
        }
        self.touch();
        Ok(true)
    }

    ///Lets `node` wait for a primitive that is not owned by the graph, for instance a swapchain's acquire semaphore.
    /// `stage` is the stage at which the wait happens. Returns false if `node` already waits for `primitive`.
    ///
    /// Semaphores are waited on at submission. Events are handed to the node via [FrameContext::event_waits].
    pub fn add_extra_input(
        &mut self,
        node: NodeId,
        primitive: SyncPrimitive<B>,
        stage: B::Stage,
    ) -> Result<bool, GraphError> {
        self.ensure_idle()?;
        let node = self
            .nodes
            .get_mut(node)
            .ok_or(GraphError::UnknownNode(node))?;
        let added = node.push_extra_input(WaitEntry { primitive, stage });
        if added {
            self.touch();
        }
        Ok(added)
    }

    ///Lets `node` signal a primitive that is not owned by the graph, for instance a present semaphore. Returns false if
    /// `node` already signals `primitive`.
    pub fn add_extra_output(
        &mut self,
        node: NodeId,
        primitive: SyncPrimitive<B>,
    ) -> Result<bool, GraphError> {
        self.ensure_idle()?;
        let node = self
            .nodes
            .get_mut(node)
            .ok_or(GraphError::UnknownNode(node))?;
        let added = node.push_extra_output(primitive);
        if added {
            self.touch();
        }
        Ok(added)
    }

    pub fn remove_extra_input(
        &mut self,
        node: NodeId,
        primitive: SyncPrimitive<B>,
    ) -> Result<bool, GraphError> {
        self.ensure_idle()?;
        let node = self
            .nodes
            .get_mut(node)
            .ok_or(GraphError::UnknownNode(node))?;
        let before = node.extra_inputs.len();
        node.extra_inputs.retain(|e| e.primitive != primitive);
        let removed = node.extra_inputs.len() != before;
        if removed {
            self.touch();
        }
        Ok(removed)
    }

    pub fn remove_extra_output(
        &mut self,
        node: NodeId,
        primitive: SyncPrimitive<B>,
    ) -> Result<bool, GraphError> {
        self.ensure_idle()?;
        let node = self
            .nodes
            .get_mut(node)
            .ok_or(GraphError::UnknownNode(node))?;
        let before = node.extra_outputs.len();
        node.extra_outputs.retain(|e| *e != primitive);
        let removed = node.extra_outputs.len() != before;
        if removed {
            self.touch();
        }
        Ok(removed)
    }

    ///Validates the topology, fixes the execution order and (re)allocates all synchronisation primitives.
    ///
    /// If the topology is invalid the previously baked state stays untouched. Otherwise in-flight work is waited on,
    /// before the primitives of the previous bake are recycled.
    pub fn bake(&mut self) -> Result<(), GraphError> {
        #[cfg(feature = "profiling")]
        puffin::profile_function!();

        self.ensure_alive()?;
        self.ensure_idle()?;

        let count = self.registration.len();
        let mut registration_index: SecondaryMap<NodeId, usize> = SecondaryMap::with_capacity(count);
        for (idx, id) in self.registration.iter().enumerate() {
            registration_index.insert(*id, idx);
        }

        let mut outputs = Vec::with_capacity(count);
        let mut queues: Vec<B::Queue> = Vec::new();
        for id in self.registration.iter() {
            let node = self.nodes.get(*id).ok_or(GraphError::UnknownNode(*id))?;
            if let Some(stale) = node
                .inputs
                .iter()
                .find(|p| !registration_index.contains_key(**p))
            {
                return Err(GraphError::UnknownNode(*stale));
            }
            let mut outs = Vec::with_capacity(node.outputs.len());
            for consumer in node.outputs.iter() {
                outs.push(
                    *registration_index
                        .get(*consumer)
                        .ok_or(GraphError::UnknownNode(*consumer))?,
                );
            }
            outputs.push(outs);

            if !queues.contains(&node.queue) {
                queues.push(node.queue);
            }
        }

        if self.kind != GraphKind::MultiQueue && queues.len() > 1 {
            return Err(GraphError::MixedQueues {
                kind: self.kind,
                count: queues.len(),
            });
        }

        let sorted = match self.kind {
            GraphKind::Subpass => sort::breadth_first(&outputs).map(|layers| (layers.concat(), layers)),
            GraphKind::SingleQueue | GraphKind::MultiQueue => {
                sort::depth_first(&outputs).map(|order| (order, Vec::new()))
            }
        };
        let (sorted, layers) = sorted.map_err(|SortError::Cycle { node }| {
            let name = self.nodes[self.registration[node]].name.clone();
            #[cfg(feature = "logging")]
            log::error!("Graph contains a cycle through node \"{}\"", name);
            GraphError::Cycle(name)
        })?;

        let order: Vec<NodeId> = sorted.iter().map(|idx| self.registration[*idx]).collect();
        let layers: Vec<Vec<NodeId>> = layers
            .iter()
            .map(|layer| layer.iter().map(|idx| self.registration[*idx]).collect())
            .collect();
        let mut index_of = SecondaryMap::with_capacity(order.len());
        for (idx, id) in order.iter().enumerate() {
            index_of.insert(*id, idx);
        }

        #[cfg(feature = "log_reasoning")]
        log::trace!(
            "Execution order: {:?}",
            order
                .iter()
                .map(|id| self.nodes[*id].name.as_str())
                .collect::<Vec<_>>()
        );

        //Topology is valid. From here on the previous bake is replaced.
        self.drain_in_flight()?;
        if let Some(old) = self.baked.take() {
            old.recycle_into(&mut self.sync);
        }

        let mut baked = Baked::new(self.version, order, index_of, layers);
        let wired = wire(
            self.kind,
            &self.nodes,
            &mut self.sync,
            &*self.backend,
            &mut baked,
        )
        .and_then(|_| {
            if self.kind.uses_fences() {
                self.fences.assign(&queues, &*self.backend)
            } else {
                Ok(())
            }
        });
        if let Err(e) = wired {
            baked.recycle_into(&mut self.sync);
            self.sync.release(&*self.backend);
            return Err(e);
        }
        baked.batches = split_batches(&self.nodes, &baked.order, &baked.index_of);

        //Everything that was not handed out again is orphaned
        self.sync.release(&*self.backend);

        #[cfg(feature = "logging")]
        log::info!(
            "Baked {:?} graph: {} nodes, {} batches, {} edge semaphores",
            self.kind,
            baked.order.len(),
            baked.batches.len(),
            baked.edge_semaphores.len()
        );

        self.baked = Some(baked);
        Ok(())
    }

    ///Blocks until all submitted work has finished.
    fn drain_in_flight(&mut self) -> Result<(), GraphError> {
        if !self.in_flight {
            return Ok(());
        }

        if self.fences.is_empty() {
            self.backend.wait_idle().map_err(GraphError::backend)?;
        } else {
            self.fences
                .wait_all(&*self.backend, self.config.fence_timeout)?;
        }
        self.in_flight = false;
        Ok(())
    }

    ///Executes a whole frame: [begin_frame](Graph::begin_frame), [record](Graph::record), [submit](Graph::submit) and
    /// [end_frame](Graph::end_frame).
    ///
    /// Failures of single nodes do not fail the frame, they are collected in the returned [FrameReport].
    pub fn execute(&mut self) -> Result<FrameReport, GraphError> {
        #[cfg(feature = "profiling")]
        puffin::profile_function!();

        if self.phase != FramePhase::Idle {
            return Err(GraphError::OutOfOrder {
                current: self.phase,
                requested: FramePhase::Began,
            });
        }

        let result = self.run_frame();
        if result.is_err() {
            if let Err(_e) = self.abort_frame() {
                #[cfg(feature = "logging")]
                log::error!("Failed to abort frame {}: {}", self.frame, _e);
            }
        }
        result
    }

    fn run_frame(&mut self) -> Result<FrameReport, GraphError> {
        self.begin_frame()?;
        self.record()?;
        self.submit()?;
        self.end_frame()
    }

    ///Starts a frame. Re-bakes if needed, waits for the previous frame of each queue, resets all node events and calls
    /// every node's [pre_submit](Task::pre_submit) hook in execution order.
    pub fn begin_frame(&mut self) -> Result<(), GraphError> {
        #[cfg(feature = "profiling")]
        puffin::profile_function!();

        self.ensure_alive()?;
        self.expect_phase(FramePhase::Idle, FramePhase::Began)?;
        if self.baked.is_none() {
            return Err(GraphError::NotBaked);
        }
        if self.is_dirty() {
            if self.config.auto_rebake {
                #[cfg(feature = "logging")]
                log::info!("Topology changed since last bake, re-baking");
                self.bake()?;
            } else {
                return Err(GraphError::StaleBake);
            }
        }

        self.fences
            .wait_all(&*self.backend, self.config.fence_timeout)?;
        if !self.fences.is_empty() {
            self.in_flight = false;
        }

        let baked = self.baked.as_ref().ok_or(GraphError::NotBaked)?;
        if self.kind.uses_events() {
            for event in baked.events.iter() {
                self.backend
                    .reset_event(*event)
                    .map_err(GraphError::backend)?;
            }
        }

        self.report = FrameReport::new(self.frame);
        for id in baked.order.iter() {
            let node = &mut self.nodes[*id];
            if let Err(e) = node.task.pre_submit(&*self.backend) {
                record_failure(
                    &mut self.report,
                    *id,
                    &node.name,
                    FailureStage::PreSubmit,
                    e,
                );
            }
        }

        self.phase = FramePhase::Began;
        Ok(())
    }

    ///Collects every node's command buffers. Generation is fanned out over the configured worker threads.
    ///
    /// A node that fails (or panics) submits no commands this frame. Its semaphores are still signaled by the empty
    /// submission and its event is set from the host, so consumers never wait forever. The same happens for nodes that
    /// return no command buffers.
    pub fn record(&mut self) -> Result<(), GraphError> {
        #[cfg(feature = "profiling")]
        puffin::profile_function!();

        self.expect_phase(FramePhase::Began, FramePhase::Recorded)?;

        let workers = self.config.effective_workers();
        let threshold = self.config.parallel_threshold;
        let kind = self.kind;
        let frame = self.frame;
        let backend: &B = &self.backend;
        let Baked {
            order,
            index_of,
            descriptors,
            events,
            event_waits,
            ..
        } = self.baked.as_mut().ok_or(GraphError::NotBaked)?;

        let mut slots: Vec<Option<&mut Node<B>>> = Vec::with_capacity(order.len());
        slots.resize_with(order.len(), || None);
        for (id, node) in self.nodes.iter_mut() {
            if let Some(idx) = index_of.get(id) {
                slots[*idx] = Some(node);
            }
        }

        let mut jobs = Vec::with_capacity(order.len());
        for (idx, slot) in slots.into_iter().enumerate() {
            let Some(Node {
                name,
                task,
                signal_stage,
                ..
            }) = slot
            else {
                continue;
            };
            jobs.push(Job {
                index: idx,
                name: name.as_str(),
                task: task.as_mut(),
                context: FrameContext {
                    backend,
                    frame,
                    node: order[idx],
                    index: idx,
                    event_waits: &event_waits[idx],
                    own_event: if kind.uses_events() {
                        Some(events[idx])
                    } else {
                        None
                    },
                    signal_stage: *signal_stage,
                },
                result: None,
            });
        }

        scatter(&mut jobs, workers, threshold);

        for job in jobs {
            let Job {
                index,
                name,
                context,
                result,
                ..
            } = job;
            let result = result.unwrap_or_else(|| Err(anyhow::anyhow!("command generation never ran")));
            match result {
                Ok(commands) => {
                    //nothing on the device sets the event of a node without commands
                    if commands.is_empty() {
                        if let Some(event) = context.own_event {
                            backend.set_event(event).map_err(GraphError::backend)?;
                        }
                    }
                    descriptors[index].commands = commands;
                }
                Err(error) => {
                    descriptors[index].commands.clear();
                    record_failure(
                        &mut self.report,
                        context.node,
                        name,
                        FailureStage::Commands,
                        error,
                    );
                    //same-queue consumers wait for this event within their command buffers
                    if let Some(event) = context.own_event {
                        backend.set_event(event).map_err(GraphError::backend)?;
                    }
                }
            }
        }

        self.phase = FramePhase::Recorded;
        Ok(())
    }

    ///Submits all batches in order. The last batch of each queue signals that queue's fence.
    ///
    /// If a submission fails, the fences that were reset but never submitted are replaced by signaled ones. The frame
    /// has to be [aborted](Graph::abort_frame) afterwards.
    pub fn submit(&mut self) -> Result<(), GraphError> {
        #[cfg(feature = "profiling")]
        puffin::profile_function!();

        self.expect_phase(FramePhase::Recorded, FramePhase::Submitted)?;
        let baked = self.baked.as_ref().ok_or(GraphError::NotBaked)?;

        let mut fenced: Vec<B::Queue> = Vec::new();
        let mut result = self.fences.reset_all(&*self.backend);
        let mut submissions: Vec<&SubmitDescriptor<B>> = Vec::new();
        for (run, batch) in baked.batches.iter().enumerate() {
            if result.is_err() {
                break;
            }
            submissions.clear();
            submissions.extend(batch.members.iter().map(|idx| &baked.descriptors[*idx]));

            let is_last = !baked.batches[run + 1..]
                .iter()
                .any(|later| later.queue == batch.queue);
            let fence = if is_last {
                self.fences.fence_for(batch.queue)
            } else {
                None
            };

            #[cfg(feature = "log_reasoning")]
            log::trace!(
                "Submitting batch {} on {:?}: {} submissions, fence: {:?}",
                run,
                batch.queue,
                submissions.len(),
                fence
            );

            if let Err(e) = self.backend.submit(batch.queue, &submissions, fence) {
                #[cfg(feature = "logging")]
                log::error!("Submitting batch {} on {:?} failed: {}", run, batch.queue, e);
                result = Err(GraphError::backend(e));
                break;
            }
            if fence.is_some() {
                fenced.push(batch.queue);
            }
            self.in_flight = true;
            self.report.batches += 1;
            self.report.submissions += submissions.len();
        }

        if let Err(e) = result {
            let unfenced = self
                .fences
                .queues()
                .filter(|q| !fenced.contains(q))
                .collect::<Vec<_>>();
            if let Err(_renew) = self.fences.renew(&unfenced, &*self.backend) {
                #[cfg(feature = "logging")]
                log::error!("Failed to renew fences after failed submission: {}", _renew);
            }
            return Err(e);
        }

        self.phase = FramePhase::Submitted;
        Ok(())
    }

    ///Calls every node's [post_submit](Task::post_submit) hook in execution order and finishes the frame.
    pub fn end_frame(&mut self) -> Result<FrameReport, GraphError> {
        #[cfg(feature = "profiling")]
        puffin::profile_function!();

        self.expect_phase(FramePhase::Submitted, FramePhase::Idle)?;
        let baked = self.baked.as_ref().ok_or(GraphError::NotBaked)?;
        for id in baked.order.iter() {
            let node = &mut self.nodes[*id];
            if let Err(e) = node.task.post_submit(&*self.backend) {
                record_failure(
                    &mut self.report,
                    *id,
                    &node.name,
                    FailureStage::PostSubmit,
                    e,
                );
            }
        }

        self.phase = FramePhase::Idle;
        self.frame += 1;
        Ok(std::mem::take(&mut self.report))
    }

    ///Abandons the current frame after one of the frame steps failed, and returns the graph to [FramePhase::Idle].
    /// Does nothing if no frame is running.
    ///
    /// No [post_submit](Task::post_submit) hooks are called and the frame index is not advanced. If the frame was only
    /// submitted partially, some of its semaphores might stay signaled. In that case the graph waits for the device to
    /// become idle and drops its bake, so it has to be [baked](Graph::bake) again before the next frame.
    pub fn abort_frame(&mut self) -> Result<(), GraphError> {
        if self.phase == FramePhase::Idle {
            return Ok(());
        }

        let partial = self.phase == FramePhase::Recorded && self.report.batches > 0;
        #[cfg(feature = "logging")]
        log::warn!("Aborting frame {} in phase {:?}", self.frame, self.phase);

        self.phase = FramePhase::Idle;
        self.report = FrameReport::default();
        if let Some(baked) = self.baked.as_mut() {
            for desc in baked.descriptors.iter_mut() {
                desc.commands.clear();
            }
        }

        if partial {
            self.backend.wait_idle().map_err(GraphError::backend)?;
            self.in_flight = false;
            if let Some(Baked {
                events,
                edge_semaphores,
                ..
            }) = self.baked.take()
            {
                for event in events {
                    self.sync.recycle_event(event);
                }
                for sem in edge_semaphores {
                    self.backend.destroy_semaphore(sem);
                }
            }
            #[cfg(feature = "logging")]
            log::warn!("Frame {} was submitted partially, graph has to be baked again", self.frame);
        }
        Ok(())
    }

    ///Waits for the device to become idle, then destroys every primitive the graph owns. Nodes (and their tasks) are
    /// kept. Afterwards the graph can't be baked or executed anymore.
    pub fn shutdown(&mut self) -> Result<(), GraphError> {
        if self.is_shut_down {
            return Ok(());
        }

        self.backend.wait_idle().map_err(GraphError::backend)?;
        self.in_flight = false;
        if let Some(baked) = self.baked.take() {
            baked.recycle_into(&mut self.sync);
        }
        self.sync.release(&*self.backend);
        self.fences.release(&*self.backend);
        self.phase = FramePhase::Idle;
        self.is_shut_down = true;

        #[cfg(feature = "logging")]
        log::trace!("Graph shut down");
        Ok(())
    }
}

impl<B: Backend> Drop for Graph<B> {
    fn drop(&mut self) {
        if !self.is_shut_down {
            #[cfg(feature = "logging")]
            log::warn!("Graph dropped without shutdown, waiting for device idle in drop!");

            if let Err(_e) = self.shutdown() {
                #[cfg(feature = "logging")]
                log::error!("Failed to shut down graph: {}", _e);
            }
        }
    }
}

fn record_failure(
    report: &mut FrameReport,
    node: NodeId,
    name: &str,
    stage: FailureStage,
    error: anyhow::Error,
) {
    #[cfg(feature = "logging")]
    log::error!("Node \"{}\" failed in {:?}: {:#}", name, stage, error);

    report.failures.push(NodeFailure {
        node,
        name: name.to_owned(),
        stage,
        message: format!("{:#}", error),
    });
}

///Allocates the primitives of `baked` and builds all submission descriptors.
fn wire<B: Backend>(
    kind: GraphKind,
    nodes: &SlotMap<NodeId, Node<B>>,
    sync: &mut SyncAllocator<B>,
    backend: &B,
    baked: &mut Baked<B>,
) -> Result<(), GraphError> {
    for _ in 0..baked.order.len() {
        let event = sync.event(backend)?;
        baked.events.push(event);
        let mut descriptor = SubmitDescriptor::new();
        descriptor.signals.push(SyncPrimitive::Event(event));
        baked.descriptors.push(descriptor);
        baked.event_waits.push(Vec::new());
    }

    for (consumer_idx, consumer_id) in baked.order.iter().enumerate() {
        let consumer = &nodes[*consumer_id];
        for producer_id in consumer.inputs.iter() {
            let producer = &nodes[*producer_id];
            let producer_idx = baked.index_of[*producer_id];
            let stage = producer.signal_stage;

            let primitive = if kind.edge_uses_semaphore(producer.queue == consumer.queue) {
                let sem = sync.semaphore(backend)?;
                baked.edge_semaphores.push(sem);
                baked.descriptors[producer_idx]
                    .signals
                    .push(SyncPrimitive::Semaphore(sem));
                SyncPrimitive::Semaphore(sem)
            } else {
                let event = baked.events[producer_idx];
                baked.event_waits[consumer_idx].push((event, stage));
                SyncPrimitive::Event(event)
            };

            #[cfg(feature = "log_reasoning")]
            log::trace!(
                "Edge \"{}\" -> \"{}\" uses {:?} at {:?}",
                producer.name,
                consumer.name,
                primitive,
                stage
            );

            baked.descriptors[consumer_idx]
                .waits
                .push(WaitEntry { primitive, stage });
        }

        for extra in consumer.extra_inputs.iter() {
            if let SyncPrimitive::Event(event) = extra.primitive {
                baked.event_waits[consumer_idx].push((event, extra.stage));
            }
            baked.descriptors[consumer_idx].waits.push(*extra);
        }
    }

    for (idx, id) in baked.order.iter().enumerate() {
        baked.descriptors[idx]
            .signals
            .extend(nodes[*id].extra_outputs.iter().copied());
    }

    Ok(())
}

///Groups the execution order into submission calls.
///
/// A node joins the latest batch of its queue as long as all its cross-queue producers are part of an earlier batch.
/// Otherwise it starts a new one. That way every semaphore signal is submitted before its wait.
fn split_batches<B: Backend>(
    nodes: &SlotMap<NodeId, Node<B>>,
    order: &[NodeId],
    index_of: &SecondaryMap<NodeId, usize>,
) -> Vec<Batch<B>> {
    let mut batches: Vec<Batch<B>> = Vec::new();
    let mut batch_of = vec![0usize; order.len()];

    for (idx, id) in order.iter().enumerate() {
        let node = &nodes[*id];
        let latest = batches.iter().rposition(|b| b.queue == node.queue);
        let needed = node
            .inputs
            .iter()
            .filter(|p| nodes[**p].queue != node.queue)
            .map(|p| batch_of[index_of[*p]])
            .max();

        let batch = match (latest, needed) {
            (Some(latest), None) => latest,
            (Some(latest), Some(needed)) if needed < latest => latest,
            _ => {
                batches.push(Batch {
                    queue: node.queue,
                    members: Vec::new(),
                });
                batches.len() - 1
            }
        };
        batches[batch].members.push(idx);
        batch_of[idx] = batch;
    }

    #[cfg(feature = "log_reasoning")]
    for (i, b) in batches.iter().enumerate() {
        log::trace!("Batch {} on {:?}: {:?}", i, b.queue, b.members);
    }

    batches
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use smallvec::smallvec;
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::{
        Commands,
        host::{HostBackend, HostCall, HostCommandBuffer, HostQueue, HostSemaphore, HostStage},
    };

    const Q0: HostQueue = HostQueue(0);
    const Q1: HostQueue = HostQueue(1);

    ///Records its command buffer like a well behaved node: wait for producers, then signal.
    struct Emit {
        cb: HostCommandBuffer,
    }

    impl Task<HostBackend> for Emit {
        fn commands(
            &mut self,
            frame: &FrameContext<'_, HostBackend>,
        ) -> Result<Commands<HostBackend>, anyhow::Error> {
            frame.record_waits(self.cb);
            frame.record_signal(self.cb);
            Ok(smallvec![self.cb])
        }
    }

    struct Fail;

    impl Task<HostBackend> for Fail {
        fn commands(
            &mut self,
            _frame: &FrameContext<'_, HostBackend>,
        ) -> Result<Commands<HostBackend>, anyhow::Error> {
            anyhow::bail!("pipeline missing")
        }
    }

    struct Panic;

    impl Task<HostBackend> for Panic {
        fn commands(
            &mut self,
            _frame: &FrameContext<'_, HostBackend>,
        ) -> Result<Commands<HostBackend>, anyhow::Error> {
            panic!("device lost in node")
        }
    }

    ///Logs every hook call into a shared trace.
    struct Hooked {
        name: &'static str,
        trace: Arc<Mutex<Vec<String>>>,
    }

    impl Task<HostBackend> for Hooked {
        fn pre_submit(&mut self, _backend: &HostBackend) -> Result<(), anyhow::Error> {
            self.trace.lock().unwrap().push(format!("pre {}", self.name));
            Ok(())
        }

        fn commands(
            &mut self,
            _frame: &FrameContext<'_, HostBackend>,
        ) -> Result<Commands<HostBackend>, anyhow::Error> {
            Ok(Commands::<HostBackend>::new())
        }

        fn post_submit(&mut self, _backend: &HostBackend) -> Result<(), anyhow::Error> {
            self.trace.lock().unwrap().push(format!("post {}", self.name));
            Ok(())
        }
    }

    fn graph(kind: GraphKind) -> (Arc<HostBackend>, Graph<HostBackend>) {
        let _ = simple_logger::SimpleLogger::new()
            .with_level(log::LevelFilter::Warn)
            .init();
        let backend = Arc::new(HostBackend::new());
        let graph = Graph::new(backend.clone(), kind);
        (backend, graph)
    }

    fn emit(backend: &HostBackend) -> Emit {
        Emit {
            cb: backend.allocate_command_buffer(),
        }
    }

    fn submit_calls(backend: &HostBackend) -> Vec<HostCall> {
        backend
            .calls()
            .into_iter()
            .filter(|c| matches!(c, HostCall::Submit { .. }))
            .collect()
    }

    fn assert_edges_ordered(graph: &Graph<HostBackend>) {
        for (id, node) in graph.nodes() {
            for input in node.inputs() {
                assert!(graph.execution_index(*input).unwrap() < graph.execution_index(id).unwrap());
            }
        }
    }

    #[test]
    fn impl_send_sync() {
        assert_impl_all!(Graph<HostBackend>: Send);
        assert_impl_all!(SubmitDescriptor<HostBackend>: Send, Sync);
    }

    #[test]
    fn chain() {
        let (backend, mut graph) = graph(GraphKind::SingleQueue);
        let a = graph.add_node("a", Q0, HostStage::COMPUTE, emit(&backend));
        let b = graph.add_node("b", Q0, HostStage::COMPUTE, emit(&backend));
        let c = graph.add_node("c", Q0, HostStage::FRAGMENT, emit(&backend));
        graph.add_input(b, a).unwrap();
        graph.add_input(c, b).unwrap();
        graph.bake().unwrap();
        assert_eq!(graph.execution_order().unwrap(), &[a, b, c]);
    }

    #[test]
    fn chain_registered_backwards() {
        let (backend, mut graph) = graph(GraphKind::SingleQueue);
        let c = graph.add_node("c", Q0, HostStage::FRAGMENT, emit(&backend));
        let b = graph.add_node("b", Q0, HostStage::COMPUTE, emit(&backend));
        let a = graph.add_node("a", Q0, HostStage::COMPUTE, emit(&backend));
        graph.add_input(b, a).unwrap();
        graph.add_input(c, b).unwrap();
        graph.bake().unwrap();
        assert_eq!(graph.execution_order().unwrap(), &[a, b, c]);
    }

    #[test]
    fn diamond() {
        let (backend, mut graph) = graph(GraphKind::SingleQueue);
        let a = graph.add_node("a", Q0, HostStage::TRANSFER, emit(&backend));
        let b = graph.add_node("b", Q0, HostStage::COMPUTE, emit(&backend));
        let c = graph.add_node("c", Q0, HostStage::VERTEX, emit(&backend));
        let d = graph.add_node("d", Q0, HostStage::FRAGMENT, emit(&backend));
        graph.add_input(b, a).unwrap();
        graph.add_input(c, a).unwrap();
        graph.add_input(d, b).unwrap();
        graph.add_input(d, c).unwrap();
        graph.bake().unwrap();

        let order = graph.execution_order().unwrap();
        assert_eq!(order.first(), Some(&a));
        assert_eq!(order.last(), Some(&d));
        assert_edges_ordered(&graph);

        let waits = graph.descriptor(d).unwrap().waits();
        assert_eq!(waits.len(), 2);
        assert_eq!(waits[0].stage, HostStage::COMPUTE);
        assert_eq!(waits[1].stage, HostStage::VERTEX);
        assert_eq!(
            waits[0].primitive,
            SyncPrimitive::Event(graph.event_of(b).unwrap())
        );
    }

    #[test]
    fn disconnected_nodes_keep_registration_order() {
        let (backend, mut graph) = graph(GraphKind::SingleQueue);
        let ids: Vec<NodeId> = (0..5)
            .map(|i| graph.add_node(format!("n{}", i), Q0, HostStage::ALL, emit(&backend)))
            .collect();
        graph.bake().unwrap();
        assert_eq!(graph.execution_order().unwrap(), ids.as_slice());

        let report = graph.execute().unwrap();
        assert_eq!(report.submissions, 5);
        assert_eq!(report.batches, 1);
    }

    #[test]
    fn cross_queue_edge_uses_semaphore() {
        let (backend, mut graph) = graph(GraphKind::MultiQueue);
        let p = graph.add_node("producer", Q0, HostStage::COMPUTE, emit(&backend));
        let c = graph.add_node("consumer", Q1, HostStage::FRAGMENT, emit(&backend));
        graph.add_input(c, p).unwrap();
        graph.bake().unwrap();

        let signaled: Vec<HostSemaphore> = graph.descriptor(p).unwrap().signal_semaphores().collect();
        assert_eq!(signaled.len(), 1);
        let waits: Vec<_> = graph.descriptor(c).unwrap().wait_semaphores().collect();
        assert_eq!(waits, vec![(signaled[0], HostStage::COMPUTE)]);
        assert!(graph.descriptor(c).unwrap().wait_events().next().is_none());

        for _ in 0..3 {
            graph.execute().unwrap();
        }
        assert!(backend.violations().is_empty(), "{:?}", backend.violations());

        let submits = submit_calls(&backend);
        assert_eq!(submits.len(), 6);
        assert!(matches!(submits[0], HostCall::Submit { queue: Q0, .. }));
        assert!(matches!(submits[1], HostCall::Submit { queue: Q1, .. }));
    }

    #[test]
    fn same_queue_edge_in_multi_queue_uses_event() {
        let (backend, mut graph) = graph(GraphKind::MultiQueue);
        let a = graph.add_node("a", Q0, HostStage::COMPUTE, emit(&backend));
        let b = graph.add_node("b", Q0, HostStage::FRAGMENT, emit(&backend));
        let c = graph.add_node("c", Q1, HostStage::TRANSFER, emit(&backend));
        graph.add_input(b, a).unwrap();
        graph.add_input(c, b).unwrap();
        graph.bake().unwrap();

        assert_eq!(
            graph.descriptor(b).unwrap().waits()[0].primitive,
            SyncPrimitive::Event(graph.event_of(a).unwrap())
        );
        assert_eq!(graph.descriptor(c).unwrap().wait_semaphores().count(), 1);
        assert_eq!(graph.batches(), vec![(Q0, vec![a, b]), (Q1, vec![c])]);
    }

    #[test]
    fn ping_pong_splits_batches() {
        let (backend, mut graph) = graph(GraphKind::MultiQueue);
        let a = graph.add_node("a", Q0, HostStage::COMPUTE, emit(&backend));
        let b = graph.add_node("b", Q1, HostStage::COMPUTE, emit(&backend));
        let c = graph.add_node("c", Q0, HostStage::FRAGMENT, emit(&backend));
        graph.add_input(b, a).unwrap();
        graph.add_input(c, b).unwrap();
        graph.bake().unwrap();
        assert_eq!(
            graph.batches(),
            vec![(Q0, vec![a]), (Q1, vec![b]), (Q0, vec![c])]
        );

        graph.execute().unwrap();
        graph.execute().unwrap();
        assert!(backend.violations().is_empty(), "{:?}", backend.violations());

        let fence = graph.fence(Q0).unwrap();
        let fences: Vec<Option<_>> = submit_calls(&backend)
            .into_iter()
            .take(3)
            .map(|c| match c {
                HostCall::Submit { fence, .. } => fence,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(fences, vec![None, graph.fence(Q1), Some(fence)]);
    }

    #[test]
    fn cycle_fails_and_keeps_previous_bake() {
        let (backend, mut graph) = graph(GraphKind::SingleQueue);
        let a = graph.add_node("a", Q0, HostStage::ALL, emit(&backend));
        let b = graph.add_node("b", Q0, HostStage::ALL, emit(&backend));
        graph.add_input(b, a).unwrap();
        graph.bake().unwrap();
        let descriptor = graph.descriptor(b).unwrap().waits().to_vec();

        graph.add_input(a, b).unwrap();
        assert!(matches!(graph.bake(), Err(GraphError::Cycle(_))));
        assert_eq!(graph.execution_order().unwrap(), &[a, b]);
        assert_eq!(graph.descriptor(b).unwrap().waits(), descriptor.as_slice());
        assert!(graph.is_dirty());
    }

    #[test]
    fn self_edge_is_cycle() {
        let (backend, mut graph) = graph(GraphKind::MultiQueue);
        let _a = graph.add_node("a", Q0, HostStage::ALL, emit(&backend));
        let b = graph.add_node("b", Q0, HostStage::ALL, emit(&backend));
        graph.add_input(b, b).unwrap();
        match graph.bake() {
            Err(GraphError::Cycle(name)) => assert_eq!(name, "b"),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn mixed_queues_are_rejected() {
        let (backend, mut graph) = graph(GraphKind::SingleQueue);
        graph.add_node("a", Q0, HostStage::ALL, emit(&backend));
        graph.add_node("b", Q1, HostStage::ALL, emit(&backend));
        assert!(matches!(
            graph.bake(),
            Err(GraphError::MixedQueues { count: 2, .. })
        ));
    }

    #[test]
    fn wait_list_matches_inputs() {
        let (backend, mut graph) = graph(GraphKind::MultiQueue);
        let a = graph.add_node("a", Q0, HostStage::TRANSFER, emit(&backend));
        let b = graph.add_node("b", Q1, HostStage::COMPUTE, emit(&backend));
        let c = graph.add_node("c", Q0, HostStage::FRAGMENT, emit(&backend));
        graph.add_input(c, a).unwrap();
        graph.add_input(c, b).unwrap();
        let acquire = SyncPrimitive::Semaphore(HostSemaphore(9000));
        graph
            .add_extra_input(c, acquire, HostStage::COLOR_OUTPUT)
            .unwrap();
        let present = SyncPrimitive::Semaphore(HostSemaphore(9001));
        graph.add_extra_output(c, present).unwrap();
        graph.bake().unwrap();

        let desc = graph.descriptor(c).unwrap();
        assert_eq!(desc.waits().len(), 3);
        assert_eq!(desc.waits()[0].stage, HostStage::TRANSFER);
        assert_eq!(desc.waits()[1].stage, HostStage::COMPUTE);
        assert_eq!(
            desc.waits()[2],
            WaitEntry {
                primitive: acquire,
                stage: HostStage::COLOR_OUTPUT
            }
        );
        assert_eq!(
            desc.signals().first(),
            Some(&SyncPrimitive::Event(graph.event_of(c).unwrap()))
        );
        assert_eq!(desc.signals().last(), Some(&present));
    }

    #[test]
    fn extra_io_is_idempotent() {
        let (backend, mut graph) = graph(GraphKind::SingleQueue);
        let a = graph.add_node("a", Q0, HostStage::ALL, emit(&backend));
        let sem = SyncPrimitive::Semaphore(HostSemaphore(77));
        assert!(graph.add_extra_input(a, sem, HostStage::TOP_OF_PIPE).unwrap());
        assert!(!graph.add_extra_input(a, sem, HostStage::FRAGMENT).unwrap());
        assert!(graph.add_extra_output(a, sem).unwrap());
        assert!(!graph.add_extra_output(a, sem).unwrap());
        graph.bake().unwrap();
        assert_eq!(graph.descriptor(a).unwrap().waits().len(), 1);
        assert_eq!(graph.descriptor(a).unwrap().signals().len(), 2);

        assert!(graph.remove_extra_input(a, sem).unwrap());
        assert!(!graph.remove_extra_input(a, sem).unwrap());
        assert!(graph.remove_extra_output(a, sem).unwrap());
        assert!(graph.is_dirty());
        graph.bake().unwrap();
        assert!(graph.descriptor(a).unwrap().waits().is_empty());
    }

    #[test]
    fn bake_is_idempotent() {
        let (backend, mut graph) = graph(GraphKind::MultiQueue);
        let a = graph.add_node("a", Q0, HostStage::ALL, emit(&backend));
        let b = graph.add_node("b", Q1, HostStage::ALL, emit(&backend));
        let c = graph.add_node("c", Q0, HostStage::ALL, emit(&backend));
        graph.add_input(b, a).unwrap();
        graph.add_input(c, b).unwrap();
        graph.bake().unwrap();
        graph.execute().unwrap();

        let order = graph.execution_order().unwrap().to_vec();
        let waits: Vec<_> = order
            .iter()
            .map(|id| graph.descriptor(*id).unwrap().waits().to_vec())
            .collect();
        let live = backend.live_objects();

        graph.bake().unwrap();
        assert_eq!(graph.execution_order().unwrap(), order.as_slice());
        for (id, w) in order.iter().zip(waits.iter()) {
            assert_eq!(graph.descriptor(*id).unwrap().waits(), w.as_slice());
        }
        assert_eq!(backend.live_objects(), live);
        graph.execute().unwrap();
        assert!(backend.violations().is_empty(), "{:?}", backend.violations());
    }

    #[test]
    fn fence_waited_and_reset_before_submit() {
        let (backend, mut graph) = graph(GraphKind::MultiQueue);
        let a = graph.add_node("a", Q0, HostStage::ALL, emit(&backend));
        let b = graph.add_node("b", Q1, HostStage::ALL, emit(&backend));
        graph.add_input(b, a).unwrap();
        graph.bake().unwrap();
        let fence = graph.fence(Q1).unwrap();

        for _ in 0..3 {
            backend.take_calls();
            graph.execute().unwrap();
            let calls = backend.calls();
            let wait = calls
                .iter()
                .position(|c| matches!(c, HostCall::WaitFences(f) if f.contains(&fence)))
                .unwrap();
            let reset = calls
                .iter()
                .position(|c| matches!(c, HostCall::ResetFences(f) if f.contains(&fence)))
                .unwrap();
            let submit = calls
                .iter()
                .position(|c| matches!(c, HostCall::Submit { queue: Q1, .. }))
                .unwrap();
            assert!(wait < reset && reset < submit);
        }
        assert!(backend.violations().is_empty(), "{:?}", backend.violations());
    }

    #[test]
    fn events_reset_each_frame() {
        let (backend, mut graph) = graph(GraphKind::SingleQueue);
        let a = graph.add_node("a", Q0, HostStage::ALL, emit(&backend));
        let b = graph.add_node("b", Q0, HostStage::ALL, emit(&backend));
        graph.add_input(b, a).unwrap();
        graph.bake().unwrap();
        backend.take_calls();
        graph.execute().unwrap();

        let calls = backend.calls();
        let event = graph.event_of(a).unwrap();
        let reset = calls
            .iter()
            .position(|c| *c == HostCall::ResetEvent(event))
            .unwrap();
        let set = calls
            .iter()
            .position(|c| matches!(c, HostCall::CmdSetEvent { event: e, .. } if *e == event))
            .unwrap();
        let waited = calls
            .iter()
            .position(|c| matches!(c, HostCall::CmdWaitEvents { events, .. } if events.contains(&event)))
            .unwrap();
        assert!(reset < set);
        assert!(reset < waited);
        //single queue graphs pace the host too
        assert!(graph.fence(Q0).is_some());
    }

    #[test]
    fn failing_node_does_not_fail_frame() {
        let (backend, mut graph) = graph(GraphKind::SingleQueue);
        let a = graph.add_node("a", Q0, HostStage::ALL, emit(&backend));
        let b = graph.add_node("b", Q0, HostStage::ALL, Fail);
        let c = graph.add_node("c", Q0, HostStage::ALL, emit(&backend));
        graph.add_input(b, a).unwrap();
        graph.add_input(c, b).unwrap();
        graph.bake().unwrap();

        let report = graph.execute().unwrap();
        assert!(report.failed(b));
        assert!(!report.failed(a));
        assert_eq!(report.failures[0].stage, FailureStage::Commands);
        assert_eq!(report.failures[0].name, "b");
        assert_eq!(report.submissions, 3);
        assert!(graph.descriptor(b).unwrap().commands().is_empty());
        assert_eq!(graph.descriptor(c).unwrap().commands().len(), 1);
        assert_eq!(backend.is_event_set(graph.event_of(b).unwrap()), Some(true));
        assert_eq!(graph.phase(), FramePhase::Idle);
    }

    #[test]
    fn node_without_commands_sets_its_event() {
        let (backend, mut graph) = graph(GraphKind::SingleQueue);
        let trace = Arc::new(Mutex::new(Vec::new()));
        let a = graph.add_node(
            "a",
            Q0,
            HostStage::ALL,
            Hooked {
                name: "a",
                trace: trace.clone(),
            },
        );
        let b = graph.add_node("b", Q0, HostStage::ALL, emit(&backend));
        graph.add_input(b, a).unwrap();
        graph.bake().unwrap();

        let a_event = graph.event_of(a).unwrap();
        backend.take_calls();
        let report = graph.execute().unwrap();
        assert!(report.failures.is_empty());
        assert!(graph.descriptor(a).unwrap().commands().is_empty());

        let calls = backend.calls();
        assert!(calls.iter().any(|c| matches!(
            c,
            HostCall::CmdWaitEvents { events, .. } if events.contains(&a_event)
        )));
        assert!(calls.contains(&HostCall::SetEvent(a_event)));
        assert_eq!(backend.is_event_set(a_event), Some(true));
    }

    #[test]
    fn panicking_node_on_worker_thread() {
        let backend = Arc::new(HostBackend::new());
        let mut graph = Graph::with_config(
            backend.clone(),
            GraphKind::MultiQueue,
            GraphConfig::default()
                .with_worker_threads(4)
                .with_parallel_threshold(1),
        );
        let mut ids = Vec::new();
        for i in 0..8 {
            ids.push(graph.add_node(format!("n{}", i), Q0, HostStage::ALL, emit(&backend)));
        }
        let broken = graph.add_node("broken", Q1, HostStage::ALL, Panic);
        graph.add_input(broken, ids[0]).unwrap();
        graph.bake().unwrap();

        let report = graph.execute().unwrap();
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].message.contains("device lost in node"));
        assert_eq!(report.submissions, 9);
        assert!(graph.descriptor(broken).unwrap().commands().is_empty());
        for id in ids {
            assert_eq!(graph.descriptor(id).unwrap().commands().len(), 1);
        }
        assert!(backend.violations().is_empty(), "{:?}", backend.violations());
    }

    #[test]
    fn parallel_results_stay_index_aligned() {
        let backend = Arc::new(HostBackend::new());
        let mut graph = Graph::with_config(
            backend.clone(),
            GraphKind::SingleQueue,
            GraphConfig::default()
                .with_worker_threads(3)
                .with_parallel_threshold(2),
        );
        let mut expected = Vec::new();
        let mut prev: Option<NodeId> = None;
        for i in 0..16 {
            let task = emit(&backend);
            let cb = task.cb;
            let id = graph.add_node(format!("n{}", i), Q0, HostStage::ALL, task);
            if let Some(p) = prev.filter(|_| i % 2 == 1) {
                graph.add_input(id, p).unwrap();
            }
            prev = Some(id);
            expected.push((id, cb));
        }
        graph.bake().unwrap();
        graph.execute().unwrap();
        for (id, cb) in expected {
            assert_eq!(graph.descriptor(id).unwrap().commands(), &[cb]);
        }
    }

    #[test]
    fn hooks_run_in_execution_order() {
        let (_backend, mut graph) = graph(GraphKind::SingleQueue);
        let trace = Arc::new(Mutex::new(Vec::new()));
        let second = graph.add_node(
            "second",
            Q0,
            HostStage::ALL,
            Hooked {
                name: "second",
                trace: trace.clone(),
            },
        );
        let first = graph.add_node(
            "first",
            Q0,
            HostStage::ALL,
            Hooked {
                name: "first",
                trace: trace.clone(),
            },
        );
        graph.add_input(second, first).unwrap();
        graph.bake().unwrap();
        graph.execute().unwrap();
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["pre first", "pre second", "post first", "post second"]
        );
    }

    #[test]
    fn remove_node_hands_back_task() {
        let (backend, mut graph) = graph(GraphKind::SingleQueue);
        let a = graph.add_node("a", Q0, HostStage::ALL, emit(&backend));
        let b = graph.add_node("b", Q0, HostStage::ALL, emit(&backend));
        let c = graph.add_node("c", Q0, HostStage::ALL, emit(&backend));
        graph.add_input(b, a).unwrap();
        graph.add_input(c, b).unwrap();
        graph.bake().unwrap();
        graph.execute().unwrap();
        let live = backend.live_objects();

        let _task = graph.remove_node(b).unwrap();
        assert!(graph.node(b).is_none());
        assert!(graph.node(a).unwrap().outputs().is_empty());
        assert!(graph.node(c).unwrap().inputs().is_empty());
        assert!(matches!(graph.add_input(c, b), Err(GraphError::UnknownNode(id)) if id == b));
        assert!(matches!(graph.remove_node(b), Err(GraphError::UnknownNode(_))));

        //re-baked on the next frame
        graph.execute().unwrap();
        assert_eq!(graph.execution_order().unwrap(), &[a, c]);
        assert!(backend.live_objects() < live);
        assert!(backend.violations().is_empty(), "{:?}", backend.violations());
    }

    #[test]
    fn execute_before_bake() {
        let (backend, mut graph) = graph(GraphKind::SingleQueue);
        graph.add_node("a", Q0, HostStage::ALL, emit(&backend));
        assert!(matches!(graph.execute(), Err(GraphError::NotBaked)));
        assert_eq!(graph.phase(), FramePhase::Idle);
    }

    #[test]
    fn stale_bake_without_auto_rebake() {
        let backend = Arc::new(HostBackend::new());
        let mut graph = Graph::with_config(
            backend.clone(),
            GraphKind::SingleQueue,
            GraphConfig::default().with_auto_rebake(false),
        );
        let a = graph.add_node("a", Q0, HostStage::ALL, emit(&backend));
        graph.bake().unwrap();
        graph.execute().unwrap();

        let b = graph.add_node("b", Q0, HostStage::ALL, emit(&backend));
        graph.add_input(b, a).unwrap();
        assert!(matches!(graph.execute(), Err(GraphError::StaleBake)));
        graph.bake().unwrap();
        assert_eq!(graph.execute().unwrap().submissions, 2);
    }

    #[test]
    fn topology_change_rebakes() {
        let (backend, mut graph) = graph(GraphKind::SingleQueue);
        let a = graph.add_node("a", Q0, HostStage::ALL, emit(&backend));
        graph.bake().unwrap();
        let version = graph.topology_version();
        let b = graph.add_node("b", Q0, HostStage::ALL, emit(&backend));
        assert!(graph.topology_version() > version);
        assert!(graph.is_dirty());

        let report = graph.execute().unwrap();
        assert!(!graph.is_dirty());
        assert_eq!(report.submissions, 2);
        assert_eq!(graph.execution_order().unwrap(), &[a, b]);
    }

    #[test]
    fn stalled_queue_times_out() {
        let backend = Arc::new(HostBackend::new());
        let mut graph = Graph::with_config(
            backend.clone(),
            GraphKind::SingleQueue,
            GraphConfig::default().with_fence_timeout(Duration::from_millis(10)),
        );
        graph.add_node("a", Q0, HostStage::ALL, emit(&backend));
        graph.bake().unwrap();
        graph.execute().unwrap();

        backend.stall_queue(Q0);
        graph.execute().unwrap();
        let err = graph.execute().unwrap_err();
        assert!(matches!(err, GraphError::DeviceStalled { .. }));
        assert!(!err.is_structural());
        assert_eq!(graph.phase(), FramePhase::Idle);

        backend.resume_queue(Q0);
        graph.execute().unwrap();
        assert_eq!(graph.frame_index(), 3);
    }

    #[test]
    fn out_of_order_steps() {
        let (backend, mut graph) = graph(GraphKind::SingleQueue);
        let a = graph.add_node("a", Q0, HostStage::ALL, emit(&backend));
        graph.bake().unwrap();

        assert!(matches!(
            graph.record(),
            Err(GraphError::OutOfOrder {
                current: FramePhase::Idle,
                requested: FramePhase::Recorded
            })
        ));

        graph.begin_frame().unwrap();
        assert!(matches!(graph.submit(), Err(GraphError::OutOfOrder { .. })));
        assert!(matches!(graph.remove_node(a), Err(GraphError::MidFrame)));
        assert!(matches!(graph.bake(), Err(GraphError::MidFrame)));
        assert!(matches!(graph.execute(), Err(GraphError::OutOfOrder { .. })));
        graph.record().unwrap();
        graph.submit().unwrap();
        let report = graph.end_frame().unwrap();
        assert_eq!(report.frame, 0);
        assert_eq!(graph.frame_index(), 1);
    }

    #[test]
    fn subpass_layers_and_semaphores() {
        let (backend, mut graph) = graph(GraphKind::Subpass);
        let a = graph.add_node("a", Q0, HostStage::COLOR_OUTPUT, emit(&backend));
        let b = graph.add_node("b", Q0, HostStage::FRAGMENT, emit(&backend));
        let c = graph.add_node("c", Q0, HostStage::FRAGMENT, emit(&backend));
        let d = graph.add_node("d", Q0, HostStage::COLOR_OUTPUT, emit(&backend));
        graph.add_input(b, a).unwrap();
        graph.add_input(c, a).unwrap();
        graph.add_input(d, b).unwrap();
        graph.add_input(d, c).unwrap();
        graph.bake().unwrap();

        assert_eq!(
            graph.layers().unwrap(),
            &[vec![a], vec![b, c], vec![d]]
        );
        assert_eq!(graph.execution_order().unwrap(), &[a, b, c, d]);
        assert_eq!(graph.descriptor(a).unwrap().signal_semaphores().count(), 2);
        assert_eq!(graph.descriptor(d).unwrap().wait_semaphores().count(), 2);
        assert!(graph.fence(Q0).is_none());

        backend.take_calls();
        graph.execute().unwrap();
        graph.execute().unwrap();
        let calls = backend.calls();
        assert!(!calls.iter().any(|c| matches!(
            c,
            HostCall::ResetEvent(_) | HostCall::CmdSetEvent { .. } | HostCall::CmdWaitEvents { .. }
        )));
        assert!(backend.violations().is_empty(), "{:?}", backend.violations());
    }

    #[test]
    fn subpass_rebake_drains_via_wait_idle() {
        let (backend, mut graph) = graph(GraphKind::Subpass);
        let a = graph.add_node("a", Q0, HostStage::ALL, emit(&backend));
        graph.bake().unwrap();
        graph.execute().unwrap();
        backend.take_calls();

        let b = graph.add_node("b", Q0, HostStage::ALL, emit(&backend));
        graph.add_input(b, a).unwrap();
        graph.bake().unwrap();
        assert!(backend.calls().contains(&HostCall::WaitIdle));
    }

    #[test]
    fn exhaustion_is_a_resource_error() {
        let backend = Arc::new(HostBackend::with_object_limit(2));
        let mut graph = Graph::new(backend.clone(), GraphKind::SingleQueue);
        for i in 0..3 {
            graph.add_node(format!("n{}", i), Q0, HostStage::ALL, emit(&backend));
        }
        let err = graph.bake().unwrap_err();
        assert!(matches!(err, GraphError::Backend(_)));
        assert!(!err.is_structural());
        assert_eq!(backend.live_objects(), 0);
    }

    #[test]
    fn failed_fence_creation_keeps_existing_fences() {
        let backend = Arc::new(HostBackend::with_object_limit(3));
        let mut graph = Graph::new(backend.clone(), GraphKind::MultiQueue);
        graph.add_node("a", Q0, HostStage::ALL, emit(&backend));
        graph.bake().unwrap();
        let q0_fence = graph.fence(Q0).unwrap();

        //events of a and b, plus the fence of Q0 reach the limit
        graph.add_node("b", Q1, HostStage::ALL, emit(&backend));
        let err = graph.bake().unwrap_err();
        assert!(matches!(err, GraphError::Backend(_)));
        assert_eq!(graph.fence(Q0), Some(q0_fence));
        assert!(graph.fence(Q1).is_none());
        assert_eq!(backend.live_objects(), 1);

        graph.shutdown().unwrap();
        assert_eq!(backend.live_objects(), 0);
        assert!(backend.violations().is_empty(), "{:?}", backend.violations());
    }

    #[test]
    fn failed_submit_can_be_aborted() {
        let (backend, mut graph) = graph(GraphKind::SingleQueue);
        graph.add_node("a", Q0, HostStage::ALL, emit(&backend));
        graph.bake().unwrap();
        graph.execute().unwrap();

        backend.lose_queue(Q0);
        graph.begin_frame().unwrap();
        graph.record().unwrap();
        assert!(matches!(graph.submit(), Err(GraphError::Backend(_))));
        assert_eq!(graph.phase(), FramePhase::Recorded);
        assert!(matches!(graph.begin_frame(), Err(GraphError::OutOfOrder { .. })));

        //the reset fence was never submitted, so it was replaced
        let fence = graph.fence(Q0).unwrap();
        assert_eq!(backend.is_fence_signaled(fence), Some(true));

        graph.abort_frame().unwrap();
        assert_eq!(graph.phase(), FramePhase::Idle);
        assert_eq!(graph.frame_index(), 1);
        //nothing was submitted, so the bake is kept
        assert!(graph.execution_order().is_some());
        graph.abort_frame().unwrap();

        backend.restore_queue(Q0);
        let report = graph.execute().unwrap();
        assert_eq!(report.frame, 1);
        assert!(backend.violations().is_empty(), "{:?}", backend.violations());
    }

    #[test]
    fn partial_submission_drops_bake() {
        let (backend, mut graph) = graph(GraphKind::MultiQueue);
        let a = graph.add_node("a", Q0, HostStage::ALL, emit(&backend));
        let b = graph.add_node("b", Q1, HostStage::ALL, emit(&backend));
        graph.add_input(b, a).unwrap();
        graph.bake().unwrap();

        backend.lose_queue(Q1);
        let err = graph.execute().unwrap_err();
        assert!(matches!(err, GraphError::Backend(_)));
        assert!(!err.is_structural());
        assert_eq!(graph.phase(), FramePhase::Idle);
        assert!(graph.execution_order().is_none());
        assert!(backend.calls().contains(&HostCall::WaitIdle));
        assert_eq!(backend.is_fence_signaled(graph.fence(Q1).unwrap()), Some(true));
        assert!(matches!(graph.execute(), Err(GraphError::NotBaked)));

        backend.restore_queue(Q1);
        graph.bake().unwrap();
        let report = graph.execute().unwrap();
        assert_eq!(report.submissions, 2);
        assert!(backend.violations().is_empty(), "{:?}", backend.violations());
    }

    #[test]
    fn shutdown_releases_primitives() {
        let (backend, mut graph) = graph(GraphKind::MultiQueue);
        let a = graph.add_node("a", Q0, HostStage::ALL, emit(&backend));
        let b = graph.add_node("b", Q1, HostStage::ALL, emit(&backend));
        graph.add_input(b, a).unwrap();
        graph.bake().unwrap();
        graph.execute().unwrap();
        assert!(backend.live_objects() > 0);

        graph.shutdown().unwrap();
        assert_eq!(backend.live_objects(), 0);
        assert!(backend.calls().contains(&HostCall::WaitIdle));
        assert!(matches!(graph.execute(), Err(GraphError::ShutDown)));
        assert!(matches!(graph.bake(), Err(GraphError::ShutDown)));
        //nodes are kept
        assert_eq!(graph.len(), 2);
        drop(graph);
        assert!(backend.violations().is_empty(), "{:?}", backend.violations());
    }

    #[test]
    fn drop_shuts_down() {
        let (backend, mut graph) = graph(GraphKind::SingleQueue);
        graph.add_node("a", Q0, HostStage::ALL, emit(&backend));
        graph.bake().unwrap();
        graph.execute().unwrap();
        drop(graph);
        assert_eq!(backend.live_objects(), 0);
    }
}
