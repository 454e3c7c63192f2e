//! # Kiln-vk
//!
//! Vulkan implementation of kiln's [Backend](kiln::Backend), based on [ash].
//!
//! Device and instance creation is left to the application. The already created [ash::Device] is handed to [Device]
//! together with the queues that should be usable by graphs. After that a [VkBackend] can be created and passed to
//! a [Graph](kiln::Graph).
//!
//! Nodes usually own a [NodeCommandPool] to record their command buffers. [RecordTask] bundles a pool with a recording
//! closure and takes care of the event waits and signals a node has to record.

pub use ash;

mod backend;
pub use backend::{VkBackend, VkBackendError};

mod device;
pub use device::{Device, Queue};

mod pool;
pub use pool::{NodeCommandPool, RecordTask};

///Owned synchronisation primitives for wiring external work into a graph.
pub mod sync;

#[cfg(feature = "default_allocator")]
mod allocator;
#[cfg(feature = "default_allocator")]
pub use allocator::{GpuAllocator, GpuAllocatorError};
