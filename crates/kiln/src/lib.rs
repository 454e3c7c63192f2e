//! # Kiln
//!
//! Baked frame graphs. Kiln takes units of GPU work ([Task]s wrapped into graph nodes), orders them by their declared
//! dependencies and wires the synchronisation primitives needed to execute them correctly every frame.
//!
//! The workflow is always the same:
//!
//! 1. Register nodes via [Graph::add_node] and connect them via [Graph::add_input]. Primitives that are not owned by the graph
//!    (for instance a swapchain's acquire semaphore) are wired via [Graph::add_extra_input] and [Graph::add_extra_output].
//! 2. [Graph::bake] the topology. This validates that the graph is acyclic, fixes the execution order and allocates
//!    semaphores, events and fences. Baking only has to happen again if the topology changes.
//! 3. Call [Graph::execute] once per frame. Command buffer generation is fanned out over worker threads, submission happens
//!    in execution order.
//!
//! # Graph kinds
//!
//! - [GraphKind::SingleQueue]: every node runs on the same queue. Dependencies are expressed via events that nodes record into
//!   their own command buffers (see [FrameContext::record_waits] and [FrameContext::record_signal]).
//! - [GraphKind::MultiQueue]: nodes span several queues. Edges that cross a queue boundary are backed by semaphores, edges on the
//!   same queue by events. Each queue gets a fence that paces the host.
//! - [GraphKind::Subpass]: render pass local graph. Ordered by breadth-first layering, every edge is backed by a semaphore, no fences.
//!
//! # Backends
//!
//! The graph never talks to a graphics API directly. Everything goes through the [Backend] trait. The `kiln-vk` crate implements
//! it for Vulkan via ash, the [host] module contains a CPU only implementation that is used for dry-runs and testing.

mod backend;
pub use backend::{Backend, FenceStatus};

///Allocation contract of the GPU memory allocator as consumed by the graph's collaborators.
pub mod allocator;

mod config;
pub use config::GraphConfig;

mod error;
pub use error::GraphError;

mod execute;

mod graph;
pub use graph::{FramePhase, Graph, GraphKind};

///CPU only backend that records every call. Used for dry runs of a graph and in tests.
pub mod host;

mod node;
pub use node::{Node, NodeId};

mod report;
pub use report::{FailureStage, FrameReport, NodeFailure};

mod sort;

mod submit;
pub use submit::{SubmitDescriptor, SyncPrimitive, WaitEntry};

mod sync;

mod task;
pub use task::{Commands, FrameContext, Task};
