//! The host backend never touches a GPU. Every primitive is a plain counter, every call is appended to a call log that
//! can be inspected afterwards. Submitted work "finishes" immediately, unless its queue was stalled via
//! [HostBackend::stall_queue].
//!
//! While recording, the backend validates the usage rules of binary semaphores and fences, and collects
//! [violations](HostBackend::violations):
//!
//! - a semaphore can only be waited on if a signal was submitted before,
//! - a semaphore can only be signaled if it is unsignaled,
//! - a fence must be unsignaled when it is submitted,
//! - primitives are destroyed exactly once.

use std::{
    ops::BitOr,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use ahash::{AHashMap, AHashSet};
use thiserror::Error;

use crate::{Backend, FenceStatus, SubmitDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostSemaphore(pub u32);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostEvent(pub u32);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostFence(pub u32);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostCommandBuffer(pub u32);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostQueue(pub u32);

///Pipeline stage mask of the host backend. Mirrors the coarse stages of a graphics pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HostStage(pub u32);

impl HostStage {
    pub const NONE: Self = HostStage(0);
    pub const TOP_OF_PIPE: Self = HostStage(1);
    pub const TRANSFER: Self = HostStage(1 << 1);
    pub const COMPUTE: Self = HostStage(1 << 2);
    pub const VERTEX: Self = HostStage(1 << 3);
    pub const FRAGMENT: Self = HostStage(1 << 4);
    pub const COLOR_OUTPUT: Self = HostStage(1 << 5);
    pub const BOTTOM_OF_PIPE: Self = HostStage(1 << 6);
    pub const ALL: Self = HostStage(0x7f);

    pub fn contains(self, other: HostStage) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for HostStage {
    type Output = HostStage;
    fn bitor(self, rhs: Self) -> Self::Output {
        HostStage(self.0 | rhs.0)
    }
}

///Semaphore part of a single submission, as seen by the host backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSubmission {
    pub commands: Vec<HostCommandBuffer>,
    pub waits: Vec<(HostSemaphore, HostStage)>,
    pub signals: Vec<HostSemaphore>,
}

///Single recorded backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    CreateSemaphore(HostSemaphore),
    DestroySemaphore(HostSemaphore),
    CreateEvent(HostEvent),
    DestroyEvent(HostEvent),
    SetEvent(HostEvent),
    ResetEvent(HostEvent),
    CreateFence {
        fence: HostFence,
        signaled: bool,
    },
    DestroyFence(HostFence),
    WaitFences(Vec<HostFence>),
    ResetFences(Vec<HostFence>),
    Submit {
        queue: HostQueue,
        submissions: Vec<HostSubmission>,
        fence: Option<HostFence>,
    },
    CmdWaitEvents {
        command_buffer: HostCommandBuffer,
        events: Vec<HostEvent>,
    },
    CmdSetEvent {
        command_buffer: HostCommandBuffer,
        event: HostEvent,
    },
    WaitIdle,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("Limit of {0} live primitives reached")]
    Exhausted(usize),
    #[error("Fence {0:?} does not exist")]
    UnknownFence(HostFence),
    #[error("Queue {0:?} is lost")]
    QueueLost(HostQueue),
}

#[derive(Default)]
struct HostState {
    next_handle: u32,
    calls: Vec<HostCall>,
    //signaled state of each live primitive
    semaphores: AHashMap<HostSemaphore, bool>,
    events: AHashMap<HostEvent, bool>,
    fences: AHashMap<HostFence, bool>,
    stalled: AHashSet<HostQueue>,
    lost: AHashSet<HostQueue>,
    //fences of stalled queues that will be signaled once the queue resumes
    pending: Vec<(HostQueue, HostFence)>,
    object_limit: Option<usize>,
    violations: Vec<String>,
}

impl HostState {
    fn next(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    fn live(&self) -> usize {
        self.semaphores.len() + self.events.len() + self.fences.len()
    }

    fn check_limit(&self) -> Result<(), HostError> {
        match self.object_limit {
            Some(limit) if self.live() >= limit => Err(HostError::Exhausted(limit)),
            _ => Ok(()),
        }
    }
}

///CPU only [Backend]. See the [module](self) documentation.
#[derive(Default)]
pub struct HostBackend {
    state: Mutex<HostState>,
}

impl HostBackend {
    pub fn new() -> Self {
        Self::default()
    }

    ///Creates a backend that fails to create more than `limit` live semaphores, events and fences combined.
    pub fn with_object_limit(limit: usize) -> Self {
        let backend = Self::default();
        backend.state().object_limit = Some(limit);
        backend
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    ///Hands out a new command buffer handle. Stands in for a node's command pool.
    pub fn allocate_command_buffer(&self) -> HostCommandBuffer {
        HostCommandBuffer(self.state().next())
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.state().calls.clone()
    }

    ///Returns the call log and clears it.
    pub fn take_calls(&self) -> Vec<HostCall> {
        std::mem::take(&mut self.state().calls)
    }

    ///All usage rule violations recorded so far.
    pub fn violations(&self) -> Vec<String> {
        self.state().violations.clone()
    }

    ///Number of live semaphores, events and fences.
    pub fn live_objects(&self) -> usize {
        self.state().live()
    }

    ///Work submitted to `queue` from now on won't finish until [resume_queue](HostBackend::resume_queue) is called.
    pub fn stall_queue(&self, queue: HostQueue) {
        self.state().stalled.insert(queue);
    }

    ///Every submission to `queue` fails with [QueueLost](HostError::QueueLost) until [restore_queue](HostBackend::restore_queue)
    /// is called.
    pub fn lose_queue(&self, queue: HostQueue) {
        self.state().lost.insert(queue);
    }

    pub fn restore_queue(&self, queue: HostQueue) {
        self.state().lost.remove(&queue);
    }

    pub fn resume_queue(&self, queue: HostQueue) {
        let mut state = self.state();
        state.stalled.remove(&queue);
        let pending = std::mem::take(&mut state.pending);
        for (q, fence) in pending {
            if q == queue {
                if let Some(signaled) = state.fences.get_mut(&fence) {
                    *signaled = true;
                }
            } else {
                state.pending.push((q, fence));
            }
        }
    }

    pub fn is_event_set(&self, event: HostEvent) -> Option<bool> {
        self.state().events.get(&event).copied()
    }

    pub fn is_fence_signaled(&self, fence: HostFence) -> Option<bool> {
        self.state().fences.get(&fence).copied()
    }
}

impl Backend for HostBackend {
    type Semaphore = HostSemaphore;
    type Event = HostEvent;
    type Fence = HostFence;
    type CommandBuffer = HostCommandBuffer;
    type Queue = HostQueue;
    type Stage = HostStage;
    type Error = HostError;

    fn create_semaphore(&self) -> Result<Self::Semaphore, Self::Error> {
        let mut state = self.state();
        state.check_limit()?;
        let sem = HostSemaphore(state.next());
        state.semaphores.insert(sem, false);
        state.calls.push(HostCall::CreateSemaphore(sem));
        Ok(sem)
    }

    fn destroy_semaphore(&self, semaphore: Self::Semaphore) {
        let mut state = self.state();
        if state.semaphores.remove(&semaphore).is_none() {
            state
                .violations
                .push(format!("{:?} destroyed twice", semaphore));
        }
        state.calls.push(HostCall::DestroySemaphore(semaphore));
    }

    fn create_event(&self) -> Result<Self::Event, Self::Error> {
        let mut state = self.state();
        state.check_limit()?;
        let event = HostEvent(state.next());
        state.events.insert(event, false);
        state.calls.push(HostCall::CreateEvent(event));
        Ok(event)
    }

    fn destroy_event(&self, event: Self::Event) {
        let mut state = self.state();
        if state.events.remove(&event).is_none() {
            state.violations.push(format!("{:?} destroyed twice", event));
        }
        state.calls.push(HostCall::DestroyEvent(event));
    }

    fn set_event(&self, event: Self::Event) -> Result<(), Self::Error> {
        let mut state = self.state();
        match state.events.get_mut(&event) {
            Some(set) => *set = true,
            None => state.violations.push(format!("set of dead {:?}", event)),
        }
        state.calls.push(HostCall::SetEvent(event));
        Ok(())
    }

    fn reset_event(&self, event: Self::Event) -> Result<(), Self::Error> {
        let mut state = self.state();
        match state.events.get_mut(&event) {
            Some(set) => *set = false,
            None => state.violations.push(format!("reset of dead {:?}", event)),
        }
        state.calls.push(HostCall::ResetEvent(event));
        Ok(())
    }

    fn create_fence(&self, signaled: bool) -> Result<Self::Fence, Self::Error> {
        let mut state = self.state();
        state.check_limit()?;
        let fence = HostFence(state.next());
        state.fences.insert(fence, signaled);
        state.calls.push(HostCall::CreateFence { fence, signaled });
        Ok(fence)
    }

    fn destroy_fence(&self, fence: Self::Fence) {
        let mut state = self.state();
        if state.fences.remove(&fence).is_none() {
            state.violations.push(format!("{:?} destroyed twice", fence));
        }
        state.pending.retain(|(_, f)| *f != fence);
        state.calls.push(HostCall::DestroyFence(fence));
    }

    fn wait_fences(
        &self,
        fences: &[Self::Fence],
        _timeout: Duration,
    ) -> Result<FenceStatus, Self::Error> {
        let mut state = self.state();
        state.calls.push(HostCall::WaitFences(fences.to_vec()));
        let mut all_signaled = true;
        for fence in fences {
            match state.fences.get(fence) {
                Some(signaled) => all_signaled &= *signaled,
                None => return Err(HostError::UnknownFence(*fence)),
            }
        }

        //work never finishes while waiting on the host, so a timeout is reported immediately
        if all_signaled {
            Ok(FenceStatus::Signaled)
        } else {
            Ok(FenceStatus::Timeout)
        }
    }

    fn reset_fences(&self, fences: &[Self::Fence]) -> Result<(), Self::Error> {
        let mut state = self.state();
        state.calls.push(HostCall::ResetFences(fences.to_vec()));
        for fence in fences {
            match state.fences.get_mut(fence) {
                Some(signaled) => *signaled = false,
                None => return Err(HostError::UnknownFence(*fence)),
            }
        }
        Ok(())
    }

    fn submit(
        &self,
        queue: Self::Queue,
        batch: &[&SubmitDescriptor<Self>],
        fence: Option<Self::Fence>,
    ) -> Result<(), Self::Error> {
        let mut state = self.state();
        if state.lost.contains(&queue) {
            return Err(HostError::QueueLost(queue));
        }
        let submissions: Vec<HostSubmission> = batch
            .iter()
            .map(|desc| HostSubmission {
                commands: desc.commands().to_vec(),
                waits: desc.wait_semaphores().collect(),
                signals: desc.signal_semaphores().collect(),
            })
            .collect();

        for sub in submissions.iter() {
            for (sem, _stage) in sub.waits.iter() {
                match state.semaphores.get_mut(sem) {
                    Some(signaled) if *signaled => *signaled = false,
                    Some(_) => state
                        .violations
                        .push(format!("wait on {:?} without pending signal", sem)),
                    None => state.violations.push(format!("wait on dead {:?}", sem)),
                }
            }
            for sem in sub.signals.iter() {
                match state.semaphores.get_mut(sem) {
                    Some(signaled) if !*signaled => *signaled = true,
                    Some(_) => state
                        .violations
                        .push(format!("signal of already signaled {:?}", sem)),
                    None => state.violations.push(format!("signal of dead {:?}", sem)),
                }
            }
        }

        if let Some(fence) = fence {
            match state.fences.get(&fence).copied() {
                Some(true) => state
                    .violations
                    .push(format!("{:?} submitted while signaled", fence)),
                Some(false) => {}
                None => return Err(HostError::UnknownFence(fence)),
            }

            if state.stalled.contains(&queue) {
                state.pending.push((queue, fence));
            } else if let Some(signaled) = state.fences.get_mut(&fence) {
                *signaled = true;
            }
        }

        state.calls.push(HostCall::Submit {
            queue,
            submissions,
            fence,
        });
        Ok(())
    }

    fn cmd_wait_events(
        &self,
        command_buffer: Self::CommandBuffer,
        waits: &[(Self::Event, Self::Stage)],
    ) {
        self.state().calls.push(HostCall::CmdWaitEvents {
            command_buffer,
            events: waits.iter().map(|(e, _)| *e).collect(),
        });
    }

    fn cmd_set_event(&self, command_buffer: Self::CommandBuffer, event: Self::Event, _stage: Self::Stage) {
        self.state().calls.push(HostCall::CmdSetEvent {
            command_buffer,
            event,
        });
    }

    fn wait_idle(&self) -> Result<(), Self::Error> {
        let mut state = self.state();
        if !state.stalled.is_empty() {
            state
                .violations
                .push("waited for idle while a queue is stalled".to_owned());
        }
        state.calls.push(HostCall::WaitIdle);
        Ok(())
    }
}
