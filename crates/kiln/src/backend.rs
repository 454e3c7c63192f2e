use std::{fmt::Debug, hash::Hash, ops::BitOr, time::Duration};

use crate::submit::SubmitDescriptor;

///Result of a bounded fence wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    ///All fences have been signaled.
    Signaled,
    ///The timeout elapsed before all fences were signaled.
    Timeout,
}

///Graphics API layer the graph is executed on.
///
/// All primitives are plain handles. The graph decides when they are created and destroyed, the backend only has to
/// forward the calls to the API. Command buffers are never created by the graph. They are owned by the nodes' [Task](crate::Task)s.
///
/// # Safety contract
///
/// The graph guarantees that a primitive is only destroyed after all submissions that use it have finished (either
/// after waiting for the queue's fence or after [wait_idle](Backend::wait_idle)).
pub trait Backend: Send + Sync + Sized + 'static {
    ///Binary semaphore used to order work across queue submissions.
    type Semaphore: Copy + Eq + Hash + Debug + Send + Sync;
    ///Event used to order work within a single queue.
    type Event: Copy + Eq + Hash + Debug + Send + Sync;
    ///Fence used to pace the host.
    type Fence: Copy + Eq + Hash + Debug + Send + Sync;
    type CommandBuffer: Copy + Debug + Send + Sync;
    ///Identifies a hardware queue.
    type Queue: Copy + Eq + Hash + Debug + Send + Sync;
    ///Pipeline stage mask.
    type Stage: Copy + Eq + Debug + Send + Sync + BitOr<Output = Self::Stage>;
    type Error: std::error::Error + Send + Sync + 'static;

    fn create_semaphore(&self) -> Result<Self::Semaphore, Self::Error>;
    fn destroy_semaphore(&self, semaphore: Self::Semaphore);

    fn create_event(&self) -> Result<Self::Event, Self::Error>;
    fn destroy_event(&self, event: Self::Event);
    ///Sets the event from the host.
    fn set_event(&self, event: Self::Event) -> Result<(), Self::Error>;
    ///Resets the event from the host.
    fn reset_event(&self, event: Self::Event) -> Result<(), Self::Error>;

    ///Creates a fence, possibly in the signaled state.
    fn create_fence(&self, signaled: bool) -> Result<Self::Fence, Self::Error>;
    fn destroy_fence(&self, fence: Self::Fence);
    ///Blocks until all `fences` are signaled, or `timeout` elapsed.
    fn wait_fences(
        &self,
        fences: &[Self::Fence],
        timeout: Duration,
    ) -> Result<FenceStatus, Self::Error>;
    fn reset_fences(&self, fences: &[Self::Fence]) -> Result<(), Self::Error>;

    ///Submits `batch` to `queue` in a single call. Only the semaphore entries of each descriptor take part in the
    /// submission, event entries are recorded by the nodes themselves. If given, `fence` is signaled once the whole
    /// batch has finished.
    fn submit(
        &self,
        queue: Self::Queue,
        batch: &[&SubmitDescriptor<Self>],
        fence: Option<Self::Fence>,
    ) -> Result<(), Self::Error>;

    ///Records a wait for all `waits` into `command_buffer`. Each entry carries the stage at which the event's producer
    /// signals.
    fn cmd_wait_events(
        &self,
        command_buffer: Self::CommandBuffer,
        waits: &[(Self::Event, Self::Stage)],
    );
    ///Records setting `event` once `stage` has completed.
    fn cmd_set_event(&self, command_buffer: Self::CommandBuffer, event: Self::Event, stage: Self::Stage);

    ///Blocks until the device has finished all submitted work.
    fn wait_idle(&self) -> Result<(), Self::Error>;
}
