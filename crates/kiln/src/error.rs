use std::time::Duration;

use thiserror::Error;

use crate::{FramePhase, GraphKind, NodeId};

///Errors of a [Graph](crate::Graph).
///
/// Everything but [Backend](GraphError::Backend) and [DeviceStalled](GraphError::DeviceStalled) is a structural error:
/// the graph was configured or driven incorrectly. Those abort the operation and leave the previously baked state intact.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Dependency cycle through node \"{0}\"")]
    Cycle(String),
    #[error("Node {0:?} is not part of this graph (removed, or from another graph)")]
    UnknownNode(NodeId),
    #[error("Graph was executed before it was baked")]
    NotBaked,
    #[error("Topology changed since the last bake, and automatic re-baking is disabled")]
    StaleBake,
    #[error("{kind:?} graph requires all nodes to use the same queue, found {count} queues")]
    MixedQueues { kind: GraphKind, count: usize },
    #[error("Frame step {requested:?} is not allowed while in phase {current:?}")]
    OutOfOrder {
        current: FramePhase,
        requested: FramePhase,
    },
    #[error("Topology can't be changed while a frame is being executed")]
    MidFrame,
    #[error("Graph was already shut down")]
    ShutDown,
    #[error("Fence of queue {queue} did not signal within {timeout:?}. The device is stalled or lost")]
    DeviceStalled { queue: String, timeout: Duration },
    #[error("Backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl GraphError {
    pub(crate) fn backend(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        GraphError::Backend(Box::new(error))
    }

    ///True if the error was caused by wrong usage of the graph, rather than by the device.
    pub fn is_structural(&self) -> bool {
        !matches!(
            self,
            GraphError::Backend(_) | GraphError::DeviceStalled { .. }
        )
    }
}
