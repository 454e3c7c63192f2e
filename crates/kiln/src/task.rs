use smallvec::SmallVec;

use crate::{Backend, NodeId};

///Command buffers a node hands to the graph for the current frame.
pub type Commands<B> = SmallVec<[<B as Backend>::CommandBuffer; 2]>;

///Content side of a graph node. Produces the command buffers of a node each frame.
///
/// [commands](Task::commands) might be called from a worker thread. An implementation must only touch state it exclusively
/// owns (usually its command pool and the resources it records).
pub trait Task<B: Backend>: Send {
    ///Called on the orchestrating thread before command generation starts. Nodes are called in execution order.
    fn pre_submit(&mut self, _backend: &B) -> Result<(), anyhow::Error> {
        Ok(())
    }

    ///Records and returns this frame's command buffers.
    ///
    /// Nodes of single or multi queue graphs that depend on same-queue producers have to call
    /// [record_waits](FrameContext::record_waits) at the start, and [record_signal](FrameContext::record_signal) at the end
    /// of their recording.
    fn commands(&mut self, frame: &FrameContext<'_, B>) -> Result<Commands<B>, anyhow::Error>;

    ///Called on the orchestrating thread after all batches of the frame have been submitted. Nodes are called in execution order.
    fn post_submit(&mut self, _backend: &B) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

///Per node view of the frame that is currently being recorded.
pub struct FrameContext<'a, B: Backend> {
    pub(crate) backend: &'a B,
    pub(crate) frame: u64,
    pub(crate) node: NodeId,
    pub(crate) index: usize,
    pub(crate) event_waits: &'a [(B::Event, B::Stage)],
    pub(crate) own_event: Option<B::Event>,
    pub(crate) signal_stage: B::Stage,
}

impl<'a, B: Backend> FrameContext<'a, B> {
    pub fn backend(&self) -> &'a B {
        self.backend
    }

    ///Index of the frame that is being recorded. Starts at 0 and increases by one per executed frame.
    pub fn frame_index(&self) -> u64 {
        self.frame
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    ///Position of this node in the baked execution order.
    pub fn execution_index(&self) -> usize {
        self.index
    }

    ///Events of same-queue producers, and the stage they signal at.
    pub fn event_waits(&self) -> &'a [(B::Event, B::Stage)] {
        self.event_waits
    }

    ///Records the wait for all same-queue producers into `command_buffer`. Does nothing if there are none.
    pub fn record_waits(&self, command_buffer: B::CommandBuffer) {
        if !self.event_waits.is_empty() {
            self.backend
                .cmd_wait_events(command_buffer, self.event_waits);
        }
    }

    ///Records setting this node's event at its signal stage. Does nothing within subpass graphs, since the render pass
    /// takes care of ordering there.
    pub fn record_signal(&self, command_buffer: B::CommandBuffer) {
        if let Some(event) = self.own_event {
            self.backend
                .cmd_set_event(command_buffer, event, self.signal_stage);
        }
    }
}
