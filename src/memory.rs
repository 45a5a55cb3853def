//! GPU and host memory bookkeeping.
//!
//! Device memory is carved out of chunks of at least 32 MiB, with one ledger
//! bit per 64-byte block; chunks whose last block is freed are returned to
//! the driver. Host allocations made by the driver go through a
//! `vk::AllocationCallbacks` table so every live allocation is accounted for
//! and released at teardown. The memory manager also owns the object pools
//! for every resource kind and the staging buffer used for uploads.

use std::alloc::Layout;
use std::os::raw::c_void;
use std::sync::Mutex;

use ash::vk;
use fxhash::FxHashMap;
use log::debug;

use crate::buffer::{Buffer, BufferInfo};
use crate::command_buffer::CommandBuffer;
use crate::device::Device;
use crate::framebuffer::Framebuffer;
use crate::pipeline::Pipeline;
use crate::pool::ObjectPool;
use crate::program::Program;
use crate::render_pass::RenderPass;
use crate::sampler::Sampler;
use crate::texture::Texture;
use crate::utils;

pub const MEMORY_BLOCK_SIZE: u64 = 64;
pub const DEFAULT_CHUNK_SIZE: u64 = 32 * 1024 * 1024;
pub const STAGING_BUFFER_SIZE: u64 = 16 * 1024 * 1024;

//--------------------------------------------------------------------------
// Host allocation callbacks

type HostLedger = Mutex<FxHashMap<usize, Layout>>;

fn lock(ledger: &HostLedger) -> std::sync::MutexGuard<'_, FxHashMap<usize, Layout>> {
    ledger.lock().unwrap_or_else(|e| e.into_inner())
}

unsafe extern "system" fn host_alloc(
    user_data: *mut c_void,
    size: usize,
    alignment: usize,
    _scope: vk::SystemAllocationScope,
) -> *mut c_void {
    if size == 0 {
        return std::ptr::null_mut();
    }
    let layout = match Layout::from_size_align(size, alignment.max(1)) {
        Ok(layout) => layout,
        Err(_) => return std::ptr::null_mut(),
    };
    let ptr = std::alloc::alloc(layout);
    if !ptr.is_null() {
        let ledger = &*(user_data as *const HostLedger);
        lock(ledger).insert(ptr as usize, layout);
    }
    ptr as *mut c_void
}

unsafe extern "system" fn host_realloc(
    user_data: *mut c_void,
    original: *mut c_void,
    size: usize,
    alignment: usize,
    scope: vk::SystemAllocationScope,
) -> *mut c_void {
    if original.is_null() {
        return host_alloc(user_data, size, alignment, scope);
    }
    if size == 0 {
        host_free(user_data, original);
        return std::ptr::null_mut();
    }
    let ledger = &*(user_data as *const HostLedger);
    let old_layout = match lock(ledger).get(&(original as usize)).copied() {
        Some(layout) => layout,
        None => return std::ptr::null_mut(),
    };
    let new_ptr = host_alloc(user_data, size, alignment, scope);
    if new_ptr.is_null() {
        return std::ptr::null_mut();
    }
    std::ptr::copy_nonoverlapping(
        original as *const u8,
        new_ptr as *mut u8,
        old_layout.size().min(size),
    );
    lock(ledger).remove(&(original as usize));
    std::alloc::dealloc(original as *mut u8, old_layout);
    new_ptr
}

unsafe extern "system" fn host_free(user_data: *mut c_void, memory: *mut c_void) {
    if memory.is_null() {
        return;
    }
    let ledger = &*(user_data as *const HostLedger);
    if let Some(layout) = lock(ledger).remove(&(memory as usize)) {
        std::alloc::dealloc(memory as *mut u8, layout);
    }
}

/// Driver-facing allocation callbacks backed by the global allocator, with a
/// ledger of every live allocation.
pub struct HostAllocationTable {
    ledger: *mut HostLedger,
    callbacks: vk::AllocationCallbacks,
}

impl HostAllocationTable {
    pub fn new() -> HostAllocationTable {
        let ledger = Box::into_raw(Box::new(Mutex::new(FxHashMap::default())));
        let callbacks = vk::AllocationCallbacks {
            p_user_data: ledger as *mut c_void,
            pfn_allocation: Some(host_alloc),
            pfn_reallocation: Some(host_realloc),
            pfn_free: Some(host_free),
            pfn_internal_allocation: None,
            pfn_internal_free: None,
        };
        HostAllocationTable { ledger, callbacks }
    }

    pub fn callbacks(&self) -> &vk::AllocationCallbacks {
        &self.callbacks
    }

    pub fn live_allocations(&self) -> usize {
        lock(unsafe { &*self.ledger }).len()
    }
}

impl Default for HostAllocationTable {
    fn default() -> Self {
        HostAllocationTable::new()
    }
}

impl Drop for HostAllocationTable {
    fn drop(&mut self) {
        // the driver must have freed everything through pfn_free by now;
        // release whatever it leaked so teardown stays clean
        let ledger = unsafe { Box::from_raw(self.ledger) };
        let map = ledger.into_inner().unwrap_or_else(|e| e.into_inner());
        if !map.is_empty() {
            debug!("driver leaked {} host allocations", map.len());
        }
        for (ptr, layout) in map {
            unsafe { std::alloc::dealloc(ptr as *mut u8, layout) };
        }
    }
}

//--------------------------------------------------------------------------
// GPU allocator

/// A sub-range of a chunk's device memory. `mapped` is non-null only for
/// host-visible chunks.
#[derive(Copy, Clone, Debug)]
pub struct GpuAllocation {
    pub memory: vk::DeviceMemory,
    pub offset: u64,
    pub size: u64,
    pub mapped: *mut u8,
}

#[derive(Copy, Clone, Debug)]
pub struct GpuAllocationRequest {
    pub size: u64,
    pub alignment: u64,
    pub memory_type_bits: u32,
    pub properties: vk::MemoryPropertyFlags,
}

struct GpuMemoryChunk {
    memory: vk::DeviceMemory,
    mapped: *mut u8,
    ledger: Vec<u8>,
    used: u64,
    size: u64,
    memory_type_index: u32,
}

/// Scans the occupancy ledger for `required_blocks` consecutive free blocks
/// whose byte offset satisfies `alignment`. Returns the start block.
pub(crate) fn find_free_blocks(
    ledger: &[u8],
    required_blocks: usize,
    alignment: u64,
) -> Option<usize> {
    let mut free_count = 0usize;
    let mut start_block = 0usize;
    let mut current_block = 0usize;
    for (ledger_it, &byte) in ledger.iter().enumerate() {
        if byte == 0xff {
            free_count = 0;
            current_block += 8;
            continue;
        }
        for bit in 0..8 {
            if byte & (1 << bit) != 0 {
                free_count = 0;
            } else if free_count == 0 {
                let offset_bytes = ((ledger_it * 8 + bit) as u64) * MEMORY_BLOCK_SIZE;
                if offset_bytes % alignment == 0 {
                    start_block = current_block;
                    free_count = 1;
                }
            } else {
                free_count += 1;
            }
            current_block += 1;
            if free_count == required_blocks {
                return Some(start_block);
            }
        }
    }
    None
}

fn set_blocks(chunk: &mut GpuMemoryChunk, start_block: usize, num_blocks: usize, in_use: bool) {
    for it in 0..num_blocks {
        let byte = &mut chunk.ledger[(start_block + it) / 8];
        let bit = 1u8 << ((start_block + it) % 8);
        if in_use {
            *byte |= bit;
        } else {
            *byte &= !bit;
        }
    }
    let delta = (num_blocks as u64) * MEMORY_BLOCK_SIZE;
    if in_use {
        chunk.used += delta;
    } else {
        chunk.used -= delta;
    }
    assert!(chunk.used <= chunk.size);
}

pub struct GpuAllocator {
    chunks: Vec<GpuMemoryChunk>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl GpuAllocator {
    pub fn new(memory_properties: vk::PhysicalDeviceMemoryProperties) -> GpuAllocator {
        GpuAllocator {
            chunks: Vec::new(),
            memory_properties,
        }
    }

    pub fn allocate(&mut self, device: &Device, request: GpuAllocationRequest) -> GpuAllocation {
        assert!(request.size > 0);
        let required_blocks = (1 + (request.size - 1) / MEMORY_BLOCK_SIZE) as usize;
        let memory_type_index = utils::memory_type_index(
            &self.memory_properties,
            request.memory_type_bits,
            request.properties,
        )
        .expect("unable to find a compatible memory type");
        let alignment = request.alignment.max(1);

        // serve from an existing chunk if one has room
        for chunk in &mut self.chunks {
            if chunk.memory_type_index != memory_type_index {
                continue;
            }
            if chunk.size - chunk.used < request.size {
                continue;
            }
            if let Some(start_block) = find_free_blocks(&chunk.ledger, required_blocks, alignment)
            {
                set_blocks(chunk, start_block, required_blocks, true);
                return allocation_in_chunk(chunk, start_block, required_blocks);
            }
        }

        // allocate a new chunk; block count is 8-aligned so each ledger
        // byte covers exactly 8 blocks
        let chunk_blocks = if request.size > DEFAULT_CHUNK_SIZE {
            let blocks = required_blocks as u64;
            blocks + (8 - blocks % 8) % 8 + 8
        } else {
            DEFAULT_CHUNK_SIZE / MEMORY_BLOCK_SIZE
        };
        let chunk_size = chunk_blocks * MEMORY_BLOCK_SIZE;
        let allocate_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(chunk_size)
            .memory_type_index(memory_type_index);
        let memory = unsafe {
            device
                .raw()
                .allocate_memory(&allocate_info, device.callbacks())
                .expect("vkAllocateMemory failed")
        };
        let mapped = if request
            .properties
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
        {
            unsafe {
                device
                    .raw()
                    .map_memory(memory, 0, chunk_size, vk::MemoryMapFlags::empty())
                    .expect("vkMapMemory failed") as *mut u8
            }
        } else {
            std::ptr::null_mut()
        };
        debug!(
            "new gpu chunk: {} bytes, memory type {}",
            chunk_size, memory_type_index
        );
        self.chunks.push(GpuMemoryChunk {
            memory,
            mapped,
            ledger: vec![0u8; (chunk_blocks / 8) as usize],
            used: 0,
            size: chunk_size,
            memory_type_index,
        });

        let chunk = self.chunks.last_mut().unwrap();
        let start_block = find_free_blocks(&chunk.ledger, required_blocks, alignment)
            .expect("fresh chunk cannot satisfy the allocation");
        set_blocks(chunk, start_block, required_blocks, true);
        allocation_in_chunk(chunk, start_block, required_blocks)
    }

    pub fn deallocate(&mut self, device: &Device, allocation: GpuAllocation) {
        let index = self
            .chunks
            .iter()
            .position(|chunk| chunk.memory == allocation.memory)
            .expect("deallocating memory from an unknown chunk");
        let chunk = &mut self.chunks[index];
        let start_block = (allocation.offset / MEMORY_BLOCK_SIZE) as usize;
        let num_blocks = (allocation.size / MEMORY_BLOCK_SIZE) as usize;
        set_blocks(chunk, start_block, num_blocks, false);
        if chunk.used == 0 {
            let chunk = self.chunks.remove(index);
            unsafe { device.raw().free_memory(chunk.memory, device.callbacks()) };
        }
    }

    /// Releases every chunk. Valid only at device teardown, after all
    /// resources are gone.
    pub fn free_all(&mut self, device: &Device) {
        for chunk in self.chunks.drain(..) {
            unsafe { device.raw().free_memory(chunk.memory, device.callbacks()) };
        }
    }
}

fn allocation_in_chunk(
    chunk: &GpuMemoryChunk,
    start_block: usize,
    num_blocks: usize,
) -> GpuAllocation {
    let offset = (start_block as u64) * MEMORY_BLOCK_SIZE;
    GpuAllocation {
        memory: chunk.memory,
        offset,
        size: (num_blocks as u64) * MEMORY_BLOCK_SIZE,
        mapped: if chunk.mapped.is_null() {
            std::ptr::null_mut()
        } else {
            unsafe { chunk.mapped.add(offset as usize) }
        },
    }
}

//--------------------------------------------------------------------------
// Object pools + staging

#[derive(Default)]
pub struct Pools {
    pub programs: ObjectPool<Program>,
    pub textures: ObjectPool<Texture>,
    pub samplers: ObjectPool<Sampler>,
    pub buffers: ObjectPool<Buffer>,
    pub render_passes: ObjectPool<RenderPass>,
    pub framebuffers: ObjectPool<Framebuffer>,
    pub pipelines: ObjectPool<Pipeline>,
    pub command_buffers: ObjectPool<CommandBuffer>,
}

pub struct MemoryManager {
    pub gpu: GpuAllocator,
    pub pools: Pools,
    staging: Option<Buffer>,
}

impl MemoryManager {
    pub fn new(device: &Device) -> MemoryManager {
        let mut gpu = GpuAllocator::new(device.memory_properties());
        let staging = Buffer::new(
            device,
            &mut gpu,
            &BufferInfo {
                size: STAGING_BUFFER_SIZE,
                usage: vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
                visibility: vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT,
            },
        );
        MemoryManager {
            gpu,
            pools: Pools::default(),
            staging: Some(staging),
        }
    }

    pub fn staging(&self) -> &Buffer {
        self.staging.as_ref().expect("staging buffer is gone")
    }

    pub(crate) fn take_staging(&mut self) -> Buffer {
        self.staging.take().expect("staging buffer is gone")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_space_in_empty_ledger() {
        let ledger = vec![0u8; 8];
        assert_eq!(find_free_blocks(&ledger, 4, 1), Some(0));
        assert_eq!(find_free_blocks(&ledger, 64, 1), Some(0));
        assert_eq!(find_free_blocks(&ledger, 65, 1), None);
    }

    #[test]
    fn skips_occupied_blocks() {
        // blocks 0..8 occupied
        let mut ledger = vec![0u8; 8];
        ledger[0] = 0xff;
        assert_eq!(find_free_blocks(&ledger, 4, 1), Some(8));
    }

    #[test]
    fn respects_alignment() {
        // block 0 occupied; a 128-byte-aligned run must start at block 2
        let mut ledger = vec![0u8; 8];
        ledger[0] = 0b0000_0001;
        assert_eq!(find_free_blocks(&ledger, 2, 128), Some(2));
        assert_eq!(find_free_blocks(&ledger, 2, 1), Some(1));
    }

    #[test]
    fn run_must_be_contiguous() {
        // free, occupied, free, free...
        let mut ledger = vec![0u8; 1];
        ledger[0] = 0b0000_0010;
        assert_eq!(find_free_blocks(&ledger, 2, 1), Some(2));
        assert_eq!(find_free_blocks(&ledger, 7, 1), None);
    }

    #[test]
    fn host_table_tracks_allocations() {
        let table = HostAllocationTable::new();
        let callbacks = table.callbacks();
        let alloc = callbacks.pfn_allocation.unwrap();
        let free = callbacks.pfn_free.unwrap();
        unsafe {
            let ptr = alloc(
                callbacks.p_user_data,
                128,
                8,
                vk::SystemAllocationScope::OBJECT,
            );
            assert!(!ptr.is_null());
            assert_eq!(table.live_allocations(), 1);
            free(callbacks.p_user_data, ptr);
            assert_eq!(table.live_allocations(), 0);
        }
    }
}
