use smallvec::SmallVec;

use crate::{Backend, SyncPrimitive, Task, WaitEntry};

slotmap::new_key_type! {
    ///Identifies a node within its [Graph](crate::Graph). Keys of removed nodes are never handed out again.
    pub struct NodeId;
}

///Single node in the graph. Edges are stored on both ends: a node knows its producers (`inputs`) and its
/// consumers (`outputs`).
pub struct Node<B: Backend> {
    pub(crate) name: String,
    pub(crate) queue: B::Queue,
    pub(crate) signal_stage: B::Stage,
    pub(crate) inputs: SmallVec<[NodeId; 4]>,
    pub(crate) outputs: SmallVec<[NodeId; 4]>,
    pub(crate) extra_inputs: Vec<WaitEntry<B>>,
    pub(crate) extra_outputs: Vec<SyncPrimitive<B>>,
    pub(crate) task: Box<dyn Task<B>>,
}

impl<B: Backend> Node<B> {
    pub(crate) fn new(
        name: String,
        queue: B::Queue,
        signal_stage: B::Stage,
        task: Box<dyn Task<B>>,
    ) -> Self {
        Node {
            name,
            queue,
            signal_stage,
            inputs: SmallVec::new(),
            outputs: SmallVec::new(),
            extra_inputs: Vec::new(),
            extra_outputs: Vec::new(),
            task,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    ///Queue this node's work is submitted to.
    pub fn queue(&self) -> B::Queue {
        self.queue
    }

    ///Stage at which this node's work becomes observable to its consumers.
    pub fn signal_stage(&self) -> B::Stage {
        self.signal_stage
    }

    ///Producers this node depends on, in declaration order.
    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    ///Consumers that depend on this node, in declaration order.
    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    pub fn extra_inputs(&self) -> &[WaitEntry<B>] {
        &self.extra_inputs
    }

    pub fn extra_outputs(&self) -> &[SyncPrimitive<B>] {
        &self.extra_outputs
    }

    pub fn task(&self) -> &dyn Task<B> {
        self.task.as_ref()
    }

    pub fn task_mut(&mut self) -> &mut dyn Task<B> {
        self.task.as_mut()
    }

    ///Adds `extra` as an external wait. Returns false if the primitive was already waited on.
    pub(crate) fn push_extra_input(&mut self, extra: WaitEntry<B>) -> bool {
        if self
            .extra_inputs
            .iter()
            .any(|e| e.primitive == extra.primitive)
        {
            false
        } else {
            self.extra_inputs.push(extra);
            true
        }
    }

    ///Adds `extra` as an external signal. Returns false if the primitive was already signaled.
    pub(crate) fn push_extra_output(&mut self, extra: SyncPrimitive<B>) -> bool {
        if self.extra_outputs.contains(&extra) {
            false
        } else {
            self.extra_outputs.push(extra);
            true
        }
    }
}
