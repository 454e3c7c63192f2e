use std::sync::Arc;

use ash::vk;
use kiln::{Commands, FrameContext, Task};
use smallvec::smallvec;

use crate::{Device, VkBackend, VkBackendError};

///Command pool owned by a single node. Holds one primary command buffer that is re-recorded every frame.
///
/// Re-recording is safe since a graph only starts recording a frame after the queue's previous frame finished.
pub struct NodeCommandPool {
    ///Device this pool was created on.
    pub device: Arc<Device>,
    ///The queue family this pool's buffer can be used on.
    pub queue_family: u32,
    ///the raw vulkan handle.
    pub inner: vk::CommandPool,
    buffer: vk::CommandBuffer,
}

impl NodeCommandPool {
    pub fn new(device: &Arc<Device>, queue_family: u32) -> Result<Self, VkBackendError> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(queue_family);
        let pool = unsafe { device.inner.create_command_pool(&create_info, None)? };

        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .command_buffer_count(1)
            .level(vk::CommandBufferLevel::PRIMARY);
        let buffer = match unsafe { device.inner.allocate_command_buffers(&allocate_info) } {
            Ok(buffers) if !buffers.is_empty() => buffers[0],
            Ok(_) => {
                unsafe { device.inner.destroy_command_pool(pool, None) };
                return Err(VkBackendError::Vk(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
            }
            Err(e) => {
                unsafe { device.inner.destroy_command_pool(pool, None) };
                return Err(e.into());
            }
        };

        Ok(NodeCommandPool {
            device: device.clone(),
            queue_family,
            inner: pool,
            buffer,
        })
    }

    ///Resets the pool and begins recording the buffer.
    pub fn begin(&mut self) -> Result<vk::CommandBuffer, VkBackendError> {
        unsafe {
            self.device
                .inner
                .reset_command_pool(self.inner, vk::CommandPoolResetFlags::empty())?;
            self.device.inner.begin_command_buffer(
                self.buffer,
                &vk::CommandBufferBeginInfo::default()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?;
        }
        Ok(self.buffer)
    }

    pub fn end(&mut self) -> Result<vk::CommandBuffer, VkBackendError> {
        unsafe { self.device.inner.end_command_buffer(self.buffer)? };
        Ok(self.buffer)
    }
}

impl Drop for NodeCommandPool {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_command_pool(self.inner, None) }
    }
}

///[Task] that records a single command buffer via `record`.
///
/// The event waits of same-queue producers are recorded before, and the node's own event after `record`.
pub struct RecordTask<F> {
    pool: NodeCommandPool,
    record: F,
}

impl<F> RecordTask<F>
where
    F: FnMut(&ash::Device, vk::CommandBuffer, u64) -> Result<(), anyhow::Error> + Send,
{
    pub fn new(pool: NodeCommandPool, record: F) -> Self {
        RecordTask { pool, record }
    }

    ///Hands back the pool, for instance after the node was removed from its graph.
    pub fn into_pool(self) -> NodeCommandPool {
        self.pool
    }
}

impl<F> Task<VkBackend> for RecordTask<F>
where
    F: FnMut(&ash::Device, vk::CommandBuffer, u64) -> Result<(), anyhow::Error> + Send,
{
    fn commands(
        &mut self,
        frame: &FrameContext<'_, VkBackend>,
    ) -> Result<Commands<VkBackend>, anyhow::Error> {
        let cb = self.pool.begin()?;
        frame.record_waits(cb);
        (self.record)(&self.pool.device.inner, cb, frame.frame_index())?;
        frame.record_signal(cb);
        let cb = self.pool.end()?;
        Ok(smallvec![cb])
    }
}
