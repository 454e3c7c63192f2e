use ahash::AHashMap;
use ash::vk;
use gpu_allocator::{
    MemoryLocation,
    vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc},
};
use kiln::allocator::{self, AllocRequest, MemoryAllocator, MemoryProperties};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GpuAllocatorError {
    #[error("Allocation failed: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),
    #[error("Allocation at offset {offset} of {memory:?} is not known to the allocator")]
    UnknownAllocation { memory: vk::DeviceMemory, offset: u64 },
}

///Picks the location that fits the requested properties best.
pub(crate) fn properties_to_location(properties: MemoryProperties) -> MemoryLocation {
    if properties.contains(MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_CACHED) {
        MemoryLocation::GpuToCpu
    } else if properties.contains(MemoryProperties::HOST_VISIBLE) {
        MemoryLocation::CpuToGpu
    } else if properties.contains(MemoryProperties::DEVICE_LOCAL) {
        MemoryLocation::GpuOnly
    } else {
        MemoryLocation::Unknown
    }
}

///Adapter of [gpu_allocator]'s vulkan allocator to kiln's [MemoryAllocator] contract.
///
/// gpu-allocator frees by value, so live allocations are kept here and looked up by memory and offset.
pub struct GpuAllocator {
    inner: Allocator,
    live: AHashMap<(vk::DeviceMemory, u64), Allocation>,
}

impl GpuAllocator {
    pub fn new(desc: &AllocatorCreateDesc) -> Result<Self, GpuAllocatorError> {
        Ok(GpuAllocator {
            inner: Allocator::new(desc)?,
            live: AHashMap::default(),
        })
    }

    pub fn live_allocations(&self) -> usize {
        self.live.len()
    }
}

impl MemoryAllocator for GpuAllocator {
    type Handle = vk::DeviceMemory;
    type Error = GpuAllocatorError;

    fn alloc(
        &mut self,
        request: &AllocRequest,
    ) -> Result<allocator::Allocation<vk::DeviceMemory>, GpuAllocatorError> {
        let requirements = vk::MemoryRequirements {
            size: request.size,
            alignment: request.alignment,
            memory_type_bits: request.memory_type_bits,
        };
        let desc = AllocationCreateDesc {
            name: "kiln allocation",
            requirements,
            location: properties_to_location(request.properties),
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        };

        let allocation = self.inner.allocate(&desc)?;
        let memory = unsafe { allocation.memory() };
        let offset = allocation.offset();
        let size = allocation.size();
        self.live.insert((memory, offset), allocation);

        Ok(allocator::Allocation {
            handle: memory,
            offset,
            size,
        })
    }

    fn free(
        &mut self,
        allocation: allocator::Allocation<vk::DeviceMemory>,
    ) -> Result<(), GpuAllocatorError> {
        let Some(inner) = self.live.remove(&(allocation.handle, allocation.offset)) else {
            #[cfg(feature = "logging")]
            log::error!(
                "Tried to free unknown allocation at {} of {:?}",
                allocation.offset,
                allocation.handle
            );
            return Err(GpuAllocatorError::UnknownAllocation {
                memory: allocation.handle,
                offset: allocation.offset,
            });
        };
        self.inner.free(inner)?;
        Ok(())
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        #[cfg(feature = "logging")]
        if !self.live.is_empty() {
            log::warn!(
                "Dropping allocator with {} live allocations, freeing them",
                self.live.len()
            );
        }

        for (_key, allocation) in self.live.drain() {
            if let Err(_e) = self.inner.free(allocation) {
                #[cfg(feature = "logging")]
                log::error!("Freeing allocation failed with: {}", _e);
            }
        }
    }
}
