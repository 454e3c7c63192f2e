//! Memory allocation contract.
//!
//! The graph itself never allocates memory. Tasks do, usually through a sub-allocator that implements [MemoryAllocator].
//! `kiln-vk` implements the trait for `gpu-allocator`, [HostAllocator] is a simple first-fit implementation that can be
//! used for testing, or to plan memory usage up front.

use std::{fmt::Debug, ops::BitOr};

use thiserror::Error;

///Memory property flags. The bit values match Vulkan's `VkMemoryPropertyFlags`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MemoryProperties(pub u32);

impl MemoryProperties {
    pub const NONE: Self = MemoryProperties(0);
    pub const DEVICE_LOCAL: Self = MemoryProperties(0x1);
    pub const HOST_VISIBLE: Self = MemoryProperties(0x2);
    pub const HOST_COHERENT: Self = MemoryProperties(0x4);
    pub const HOST_CACHED: Self = MemoryProperties(0x8);

    pub fn contains(self, other: MemoryProperties) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for MemoryProperties {
    type Output = MemoryProperties;
    fn bitor(self, rhs: Self) -> Self::Output {
        MemoryProperties(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocRequest {
    pub size: u64,
    ///Must be a power of two.
    pub alignment: u64,
    ///Bit `i` is set if memory type `i` is allowed.
    pub memory_type_bits: u32,
    ///Properties the memory type must have.
    pub properties: MemoryProperties,
}

///A range of memory on `handle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Allocation<H> {
    pub handle: H,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("Out of memory while allocating {size} bytes")]
    OutOfMemory { size: u64 },
    #[error("Alignment {0} is not a power of two")]
    InvalidAlignment(u64),
    #[error("No memory type in {bits:#b} has properties {properties:?}")]
    NoMemoryType {
        bits: u32,
        properties: MemoryProperties,
    },
    #[error("Allocation at offset {offset} of memory {handle} is not known to the allocator")]
    UnknownAllocation { handle: u64, offset: u64 },
    #[error("Allocation of zero bytes")]
    ZeroSized,
}

///Anything that can sub-allocate device memory.
pub trait MemoryAllocator {
    ///Handle to the memory object an allocation lives in.
    type Handle: Copy + Eq + Debug + Send + Sync;
    type Error: std::error::Error + Send + Sync + 'static;

    fn alloc(&mut self, request: &AllocRequest) -> Result<Allocation<Self::Handle>, Self::Error>;
    fn free(&mut self, allocation: Allocation<Self::Handle>) -> Result<(), Self::Error>;
}

fn align_up(value: u64, alignment: u64) -> Option<u64> {
    Some(value.checked_add(alignment - 1)? & !(alignment - 1))
}

struct Block {
    handle: u64,
    memory_type: usize,
    size: u64,
    ///Free ranges as (offset, size), sorted by offset and never adjacent.
    free: Vec<(u64, u64)>,
}

impl Block {
    fn new(handle: u64, memory_type: usize, size: u64) -> Self {
        Block {
            handle,
            memory_type,
            size,
            free: vec![(0, size)],
        }
    }

    ///First fit. Returns the aligned offset.
    fn take(&mut self, size: u64, alignment: u64) -> Option<u64> {
        let (idx, offset) = self.free.iter().enumerate().find_map(|(idx, (start, len))| {
            let aligned = align_up(*start, alignment)?;
            if aligned.checked_add(size)? <= start + len {
                Some((idx, aligned))
            } else {
                None
            }
        })?;

        let (start, len) = self.free.remove(idx);
        let end = start + len;
        let mut insert = idx;
        if offset > start {
            self.free.insert(insert, (start, offset - start));
            insert += 1;
        }
        if offset + size < end {
            self.free.insert(insert, (offset + size, end - offset - size));
        }
        Some(offset)
    }

    fn give_back(&mut self, offset: u64, size: u64) -> bool {
        match offset.checked_add(size) {
            Some(end) if end <= self.size => {}
            _ => return false,
        }

        let idx = self.free.partition_point(|(start, _)| *start < offset);
        //overlap with a free neighbour means double free
        if idx > 0 {
            let (start, len) = self.free[idx - 1];
            if start + len > offset {
                return false;
            }
        }
        if let Some((start, _)) = self.free.get(idx) {
            if offset + size > *start {
                return false;
            }
        }

        self.free.insert(idx, (offset, size));
        //merge with successor, then predecessor
        if idx + 1 < self.free.len() && self.free[idx].0 + self.free[idx].1 == self.free[idx + 1].0 {
            self.free[idx].1 += self.free[idx + 1].1;
            self.free.remove(idx + 1);
        }
        if idx > 0 && self.free[idx - 1].0 + self.free[idx - 1].1 == self.free[idx].0 {
            self.free[idx - 1].1 += self.free[idx].1;
            self.free.remove(idx);
        }
        true
    }

    fn is_unused(&self) -> bool {
        self.free.len() == 1 && self.free[0] == (0, self.size)
    }
}

///First-fit free list allocator over plain numeric memory handles.
///
/// Memory is grouped into blocks of `block_size` bytes per memory type. Requests that are bigger than a block get a
/// dedicated block. Blocks are released once their last allocation is freed.
pub struct HostAllocator {
    memory_types: Vec<MemoryProperties>,
    block_size: u64,
    ///Upper bound of memory (in bytes) that is handed out by blocks. `None` is unbounded.
    budget: Option<u64>,
    blocks: Vec<Block>,
    next_handle: u64,
}

impl HostAllocator {
    ///Creates an allocator for the given memory types. The index of a type in `memory_types` is its bit in
    /// [AllocRequest::memory_type_bits].
    pub fn new(memory_types: Vec<MemoryProperties>, block_size: u64) -> Self {
        HostAllocator {
            memory_types,
            block_size: block_size.max(1),
            budget: None,
            blocks: Vec::new(),
            next_handle: 0,
        }
    }

    pub fn with_budget(mut self, budget: u64) -> Self {
        self.budget = Some(budget);
        self
    }

    ///Number of bytes currently reserved by blocks.
    pub fn reserved(&self) -> u64 {
        self.blocks
            .iter()
            .fold(0u64, |acc, b| acc.saturating_add(b.size))
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    fn memory_type(&self, request: &AllocRequest) -> Result<usize, AllocError> {
        self.memory_types
            .iter()
            .enumerate()
            .find(|(idx, props)| {
                *idx < 32 && request.memory_type_bits & (1 << idx) != 0 && props.contains(request.properties)
            })
            .map(|(idx, _)| idx)
            .ok_or(AllocError::NoMemoryType {
                bits: request.memory_type_bits,
                properties: request.properties,
            })
    }
}

impl MemoryAllocator for HostAllocator {
    type Handle = u64;
    type Error = AllocError;

    fn alloc(&mut self, request: &AllocRequest) -> Result<Allocation<u64>, AllocError> {
        if request.size == 0 {
            return Err(AllocError::ZeroSized);
        }
        if !request.alignment.is_power_of_two() {
            return Err(AllocError::InvalidAlignment(request.alignment));
        }
        let memory_type = self.memory_type(request)?;

        for block in self.blocks.iter_mut().filter(|b| b.memory_type == memory_type) {
            if let Some(offset) = block.take(request.size, request.alignment) {
                return Ok(Allocation {
                    handle: block.handle,
                    offset,
                    size: request.size,
                });
            }
        }

        let size = request.size.max(self.block_size);
        if let Some(budget) = self.budget {
            if self.reserved().checked_add(size).is_none_or(|total| total > budget) {
                #[cfg(feature = "logging")]
                log::warn!(
                    "Allocation of {} bytes exceeds budget of {} bytes",
                    request.size,
                    budget
                );
                return Err(AllocError::OutOfMemory { size: request.size });
            }
        }

        self.next_handle += 1;
        let mut block = Block::new(self.next_handle, memory_type, size);
        let offset = block
            .take(request.size, request.alignment)
            .ok_or(AllocError::OutOfMemory { size: request.size })?;
        let handle = block.handle;
        self.blocks.push(block);

        Ok(Allocation {
            handle,
            offset,
            size: request.size,
        })
    }

    fn free(&mut self, allocation: Allocation<u64>) -> Result<(), AllocError> {
        let unknown = AllocError::UnknownAllocation {
            handle: allocation.handle,
            offset: allocation.offset,
        };
        let idx = self
            .blocks
            .iter()
            .position(|b| b.handle == allocation.handle)
            .ok_or(unknown.clone())?;

        if !self.blocks[idx].give_back(allocation.offset, allocation.size) {
            return Err(unknown);
        }
        if self.blocks[idx].is_unused() {
            self.blocks.swap_remove(idx);
        }
        Ok(())
    }
}
