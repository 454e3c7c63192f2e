use crate::NodeId;

///Frame step in which a node failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    PreSubmit,
    Commands,
    PostSubmit,
}

///A node's failure within a frame. The frame itself continued.
#[derive(Debug, Clone)]
pub struct NodeFailure {
    pub node: NodeId,
    pub name: String,
    pub stage: FailureStage,
    pub message: String,
}

///Outcome of a single executed frame.
#[derive(Debug, Clone, Default)]
pub struct FrameReport {
    pub frame: u64,
    ///Number of submission calls, one per queue batch.
    pub batches: usize,
    ///Number of node submissions within all batches.
    pub submissions: usize,
    pub failures: Vec<NodeFailure>,
}

impl FrameReport {
    pub(crate) fn new(frame: u64) -> Self {
        FrameReport {
            frame,
            ..Default::default()
        }
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    ///Returns true if `node` failed during any step of the frame.
    pub fn failed(&self, node: NodeId) -> bool {
        self.failures.iter().any(|f| f.node == node)
    }
}
