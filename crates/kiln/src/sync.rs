//! Pooled synchronisation primitives of a graph.

use std::{collections::VecDeque, time::Duration};

use crate::{Backend, FenceStatus, GraphError};

///Hands out semaphores and events. Primitives of a previous bake are recycled into the pool and handed out again
/// before new ones are created.
pub(crate) struct SyncAllocator<B: Backend> {
    free_semaphores: VecDeque<B::Semaphore>,
    free_events: VecDeque<B::Event>,
}

impl<B: Backend> SyncAllocator<B> {
    pub(crate) fn new() -> Self {
        SyncAllocator {
            free_semaphores: VecDeque::new(),
            free_events: VecDeque::new(),
        }
    }

    pub(crate) fn semaphore(&mut self, backend: &B) -> Result<B::Semaphore, GraphError> {
        if let Some(sem) = self.free_semaphores.pop_front() {
            Ok(sem)
        } else {
            backend.create_semaphore().map_err(GraphError::backend)
        }
    }

    pub(crate) fn event(&mut self, backend: &B) -> Result<B::Event, GraphError> {
        if let Some(event) = self.free_events.pop_front() {
            Ok(event)
        } else {
            backend.create_event().map_err(GraphError::backend)
        }
    }

    ///Returns `semaphore` to the pool. The caller must make sure no pending submission still uses it.
    pub(crate) fn recycle_semaphore(&mut self, semaphore: B::Semaphore) {
        self.free_semaphores.push_back(semaphore);
    }

    ///Returns `event` to the pool. The caller must make sure no pending submission still uses it.
    pub(crate) fn recycle_event(&mut self, event: B::Event) {
        self.free_events.push_back(event);
    }

    ///Destroys all pooled primitives.
    pub(crate) fn release(&mut self, backend: &B) {
        #[cfg(feature = "logging")]
        if !self.free_semaphores.is_empty() || !self.free_events.is_empty() {
            log::trace!(
                "Releasing {} semaphores and {} events",
                self.free_semaphores.len(),
                self.free_events.len()
            );
        }

        for sem in self.free_semaphores.drain(..) {
            backend.destroy_semaphore(sem);
        }
        for event in self.free_events.drain(..) {
            backend.destroy_event(event);
        }
    }
}

///One fence per queue. Fences are created in the signaled state, so the first frame does not block.
pub(crate) struct QueueFences<B: Backend> {
    fences: Vec<(B::Queue, B::Fence)>,
}

impl<B: Backend> QueueFences<B> {
    pub(crate) fn new() -> Self {
        QueueFences { fences: Vec::new() }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.fences.is_empty()
    }

    pub(crate) fn fence_for(&self, queue: B::Queue) -> Option<B::Fence> {
        self.fences
            .iter()
            .find(|(q, _)| *q == queue)
            .map(|(_, f)| *f)
    }

    ///Makes sure that exactly the `queues` have a fence. Fences of queues that are still in use are kept.
    ///
    /// Missing fences are created before anything is destroyed. If that fails, the current fences stay untouched.
    ///
    /// Must only be called while no submission is pending.
    pub(crate) fn assign(&mut self, queues: &[B::Queue], backend: &B) -> Result<(), GraphError> {
        let mut created: Vec<(B::Queue, B::Fence)> = Vec::new();
        for queue in queues {
            if self.fence_for(*queue).is_some() || created.iter().any(|(q, _)| q == queue) {
                continue;
            }

            #[cfg(feature = "logging")]
            log::info!("No fence for queue {:?} yet, creating one!", queue);
            match backend.create_fence(true) {
                Ok(fence) => created.push((*queue, fence)),
                Err(e) => {
                    for (_queue, fence) in created {
                        backend.destroy_fence(fence);
                    }
                    return Err(GraphError::backend(e));
                }
            }
        }

        let mut previous = std::mem::take(&mut self.fences);
        for queue in queues {
            if let Some(idx) = previous.iter().position(|(q, _)| q == queue) {
                self.fences.push(previous.swap_remove(idx));
            } else if let Some(idx) = created.iter().position(|(q, _)| q == queue) {
                self.fences.push(created.swap_remove(idx));
            }
        }
        for (_queue, fence) in previous {
            backend.destroy_fence(fence);
        }
        Ok(())
    }

    ///Replaces the fences of `queues` with new, signaled ones. Only valid for fences that were reset but never submitted.
    ///
    /// If a fence can't be created the queue is left without one until the next bake.
    pub(crate) fn renew(&mut self, queues: &[B::Queue], backend: &B) -> Result<(), GraphError> {
        for queue in queues {
            let Some(idx) = self.fences.iter().position(|(q, _)| q == queue) else {
                continue;
            };
            let (_queue, stale) = self.fences.remove(idx);
            backend.destroy_fence(stale);
            let fence = backend.create_fence(true).map_err(GraphError::backend)?;
            self.fences.insert(idx, (*queue, fence));
        }
        Ok(())
    }

    pub(crate) fn queues(&self) -> impl Iterator<Item = B::Queue> + '_ {
        self.fences.iter().map(|(q, _)| *q)
    }

    ///Waits for every queue's fence, each bound by `timeout`.
    pub(crate) fn wait_all(&self, backend: &B, timeout: Duration) -> Result<(), GraphError> {
        for (queue, fence) in self.fences.iter() {
            match backend
                .wait_fences(core::slice::from_ref(fence), timeout)
                .map_err(GraphError::backend)?
            {
                FenceStatus::Signaled => {}
                FenceStatus::Timeout => {
                    #[cfg(feature = "logging")]
                    log::error!(
                        "Fence of queue {:?} did not signal within {:?}",
                        queue,
                        timeout
                    );
                    return Err(GraphError::DeviceStalled {
                        queue: format!("{:?}", queue),
                        timeout,
                    });
                }
            }
        }
        Ok(())
    }

    pub(crate) fn reset_all(&self, backend: &B) -> Result<(), GraphError> {
        if self.fences.is_empty() {
            return Ok(());
        }
        let fences = self.fences.iter().map(|(_, f)| *f).collect::<Vec<_>>();
        backend.reset_fences(&fences).map_err(GraphError::backend)
    }

    ///Destroys all fences. Must only be called while no submission is pending.
    pub(crate) fn release(&mut self, backend: &B) {
        for (_queue, fence) in self.fences.drain(..) {
            backend.destroy_fence(fence);
        }
    }
}
