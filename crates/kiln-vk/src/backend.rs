use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use ash::vk;
use kiln::{Backend, FenceStatus, SubmitDescriptor};
use smallvec::SmallVec;
use thiserror::Error;

use crate::Device;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VkBackendError {
    #[error("Vulkan error: {0}")]
    Vk(#[from] vk::Result),
    #[error("Queue {0:?} does not belong to the device")]
    UnknownQueue(vk::Queue),
}

///Flattened semaphore and command buffer lists of a single submission. `vk::SubmitInfo` only borrows them.
#[derive(Default)]
struct SubmitStorage {
    waits: SmallVec<[vk::Semaphore; 4]>,
    stages: SmallVec<[vk::PipelineStageFlags; 4]>,
    commands: SmallVec<[vk::CommandBuffer; 2]>,
    signals: SmallVec<[vk::Semaphore; 4]>,
}

impl SubmitStorage {
    fn from_descriptor(desc: &SubmitDescriptor<VkBackend>) -> Self {
        let mut storage = SubmitStorage::default();
        for (sem, stage) in desc.wait_semaphores() {
            storage.waits.push(sem);
            storage.stages.push(stage);
        }
        storage.commands.extend_from_slice(desc.commands());
        storage.signals.extend(desc.signal_semaphores());
        storage
    }

    fn as_info(&self) -> vk::SubmitInfo<'_> {
        vk::SubmitInfo::default()
            .wait_semaphores(&self.waits)
            .wait_dst_stage_mask(&self.stages)
            .command_buffers(&self.commands)
            .signal_semaphores(&self.signals)
    }
}

///Vulkan backend. Uses binary semaphores, events and fences of the wrapped [Device].
pub struct VkBackend {
    pub device: Arc<Device>,
    ///Queue submission has to be externally synchronised.
    submit_lock: Mutex<()>,
}

impl VkBackend {
    pub fn new(device: Arc<Device>) -> Self {
        VkBackend {
            device,
            submit_lock: Mutex::new(()),
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

fn timeout_nanos(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}

///Source stages of an event wait. Any waited event might be set from the host, either for a failed node or as an
/// extra input.
fn wait_src_stage(waits: &[(vk::Event, vk::PipelineStageFlags)]) -> vk::PipelineStageFlags {
    waits
        .iter()
        .fold(vk::PipelineStageFlags::HOST, |acc, (_, s)| acc | *s)
}

impl Backend for VkBackend {
    type Semaphore = vk::Semaphore;
    type Event = vk::Event;
    type Fence = vk::Fence;
    type CommandBuffer = vk::CommandBuffer;
    type Queue = vk::Queue;
    type Stage = vk::PipelineStageFlags;
    type Error = VkBackendError;

    fn create_semaphore(&self) -> Result<Self::Semaphore, Self::Error> {
        let ci = vk::SemaphoreCreateInfo::default();
        Ok(unsafe { self.device.inner.create_semaphore(&ci, None)? })
    }

    fn destroy_semaphore(&self, semaphore: Self::Semaphore) {
        unsafe { self.device.inner.destroy_semaphore(semaphore, None) }
    }

    fn create_event(&self) -> Result<Self::Event, Self::Error> {
        let ci = vk::EventCreateInfo::default();
        Ok(unsafe { self.device.inner.create_event(&ci, None)? })
    }

    fn destroy_event(&self, event: Self::Event) {
        unsafe { self.device.inner.destroy_event(event, None) }
    }

    fn set_event(&self, event: Self::Event) -> Result<(), Self::Error> {
        Ok(unsafe { self.device.inner.set_event(event)? })
    }

    fn reset_event(&self, event: Self::Event) -> Result<(), Self::Error> {
        Ok(unsafe { self.device.inner.reset_event(event)? })
    }

    fn create_fence(&self, signaled: bool) -> Result<Self::Fence, Self::Error> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let ci = vk::FenceCreateInfo::default().flags(flags);
        Ok(unsafe { self.device.inner.create_fence(&ci, None)? })
    }

    fn destroy_fence(&self, fence: Self::Fence) {
        unsafe { self.device.inner.destroy_fence(fence, None) }
    }

    fn wait_fences(
        &self,
        fences: &[Self::Fence],
        timeout: Duration,
    ) -> Result<FenceStatus, Self::Error> {
        if fences.is_empty() {
            return Ok(FenceStatus::Signaled);
        }

        match unsafe {
            self.device
                .inner
                .wait_for_fences(fences, true, timeout_nanos(timeout))
        } {
            Ok(()) => Ok(FenceStatus::Signaled),
            Err(vk::Result::TIMEOUT) => Ok(FenceStatus::Timeout),
            Err(e) => Err(e.into()),
        }
    }

    fn reset_fences(&self, fences: &[Self::Fence]) -> Result<(), Self::Error> {
        Ok(unsafe { self.device.inner.reset_fences(fences)? })
    }

    fn submit(
        &self,
        queue: Self::Queue,
        batch: &[&SubmitDescriptor<Self>],
        fence: Option<Self::Fence>,
    ) -> Result<(), Self::Error> {
        if self.device.family_of(queue).is_none() {
            return Err(VkBackendError::UnknownQueue(queue));
        }

        let storage: SmallVec<[SubmitStorage; 8]> = batch
            .iter()
            .map(|desc| SubmitStorage::from_descriptor(desc))
            .collect();
        let infos: SmallVec<[vk::SubmitInfo; 8]> = storage.iter().map(|s| s.as_info()).collect();

        let _guard = self
            .submit_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        unsafe {
            self.device
                .inner
                .queue_submit(queue, &infos, fence.unwrap_or(vk::Fence::null()))?
        };
        Ok(())
    }

    fn cmd_wait_events(
        &self,
        command_buffer: Self::CommandBuffer,
        waits: &[(Self::Event, Self::Stage)],
    ) {
        let events: SmallVec<[vk::Event; 4]> = waits.iter().map(|(e, _)| *e).collect();
        let src_stage = wait_src_stage(waits);
        //the consumer's stages are unknown at this point, so everything waits
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
            .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE);

        unsafe {
            self.device.inner.cmd_wait_events(
                command_buffer,
                &events,
                src_stage,
                vk::PipelineStageFlags::ALL_COMMANDS,
                core::slice::from_ref(&barrier),
                &[],
                &[],
            )
        }
    }

    fn cmd_set_event(&self, command_buffer: Self::CommandBuffer, event: Self::Event, stage: Self::Stage) {
        unsafe { self.device.inner.cmd_set_event(command_buffer, event, stage) }
    }

    fn wait_idle(&self) -> Result<(), Self::Error> {
        Ok(unsafe { self.device.inner.device_wait_idle()? })
    }
}
