//! A device that keeps every buffer in host memory.
//!
//! It follows the same upload rules as the Vulkan device (device local
//! buffers are only written through a staging step, host visible ones are
//! written in place) and records the binds and draws it is asked to
//! issue, which makes it the device used by tests and headless tools.

use std::{
    cell::{Cell, Ref, RefCell},
    mem,
    rc::Rc,
    sync::Arc,
};

use bytemuck::Pod;
use log::trace;
use parking_lot::Mutex;

use crate::{
    device::{check_write_range, BackendError, GpuDevice, SharedQueue},
    gpu_structs::*,
};

#[derive(Clone)]
pub struct HostBuffer {
    data: Rc<RefCell<Vec<u8>>>,
    pub desc: GPUBufferDesc,
}

impl HostBuffer {
    pub fn bytes(&self) -> Ref<'_, [u8]> {
        Ref::map(self.data.borrow(), |data| data.as_slice())
    }

    /// Reads `count` values of `T` starting at byte `offset`.
    pub fn read<T: Pod>(&self, offset: usize, count: usize) -> Vec<T> {
        let size = mem::size_of::<T>();
        let bytes = self.bytes();
        bytes[offset..offset + count * size]
            .chunks_exact(size)
            .map(bytemuck::pod_read_unaligned)
            .collect()
    }
}

impl AsRef<GPUBufferDesc> for HostBuffer {
    fn as_ref(&self) -> &GPUBufferDesc {
        &self.desc
    }
}

impl PartialEq for HostBuffer {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.data, &other.data)
    }
}

impl std::fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBuffer")
            .field("name", &self.desc.name)
            .field("size", &self.desc.size)
            .finish()
    }
}

/// An indirect draw as the device saw it, including the commands it read.
#[derive(Clone, Debug, PartialEq)]
pub struct IndirectDraw {
    pub cmd: Cmd,
    pub indirect_buffer: String,
    pub vertex_buffer: Option<String>,
    pub index_buffer: Option<String>,
    pub offset: u64,
    pub draw_count: u32,
    pub stride: u32,
    pub commands: Vec<DrawIndexedIndirectCommand>,
}

/// A direct indexed draw and the buffers bound when it was issued.
#[derive(Clone, Debug, PartialEq)]
pub struct DirectDraw {
    pub cmd: Cmd,
    pub vertex_buffer: Option<String>,
    pub index_buffer: Option<String>,
    pub command: DrawIndexedIndirectCommand,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HostStats {
    pub buffers_created: usize,
    pub staged_copies: usize,
    pub staged_bytes: u64,
    pub mapped_bytes: u64,
    pub flushes: usize,
}

pub struct HostDevice {
    stats: Cell<HostStats>,
    pending_copies: Cell<usize>,
    bound_vertex: RefCell<Option<HostBuffer>>,
    bound_index: RefCell<Option<HostBuffer>>,
    draws: RefCell<Vec<IndirectDraw>>,
    direct_draws: RefCell<Vec<DirectDraw>>,
    queue: SharedQueue<u64>,
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDevice {
    pub fn new() -> Self {
        HostDevice {
            stats: Cell::new(HostStats::default()),
            pending_copies: Cell::new(0),
            bound_vertex: RefCell::new(None),
            bound_index: RefCell::new(None),
            draws: RefCell::new(Vec::new()),
            direct_draws: RefCell::new(Vec::new()),
            queue: Arc::new(Mutex::new(0)),
        }
    }

    pub fn stats(&self) -> HostStats {
        self.stats.get()
    }

    /// Copies that were staged but not flushed yet.
    pub fn pending_copies(&self) -> usize {
        self.pending_copies.get()
    }

    /// The submission counter, shared the way a real queue would be.
    pub fn queue(&self) -> SharedQueue<u64> {
        self.queue.clone()
    }

    pub fn draws(&self) -> Vec<IndirectDraw> {
        self.draws.borrow().clone()
    }

    /// Returns the recorded draws and starts a new recording.
    pub fn take_draws(&self) -> Vec<IndirectDraw> {
        mem::take(&mut *self.draws.borrow_mut())
    }

    pub fn direct_draws(&self) -> Vec<DirectDraw> {
        self.direct_draws.borrow().clone()
    }

    pub fn take_direct_draws(&self) -> Vec<DirectDraw> {
        mem::take(&mut *self.direct_draws.borrow_mut())
    }

    fn bound_names(&self) -> (Option<String>, Option<String>) {
        let name = |bound: &RefCell<Option<HostBuffer>>| {
            bound.borrow().as_ref().map(|b| b.desc.name.clone())
        };
        (name(&self.bound_vertex), name(&self.bound_index))
    }

    fn update_stats(&self, f: impl FnOnce(&mut HostStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }
}

impl GpuDevice for HostDevice {
    type Buffer = HostBuffer;

    fn create_buffer(&self, desc: &GPUBufferDesc) -> Result<HostBuffer, BackendError> {
        if desc.size == 0 {
            return Err(BackendError::Allocation {
                buffer: desc.name.clone(),
                reason: "zero sized buffer".into(),
            });
        }
        self.update_stats(|stats| stats.buffers_created += 1);
        trace!("host buffer '{}' ({} bytes)", desc.name, desc.size);

        Ok(HostBuffer {
            data: Rc::new(RefCell::new(vec![0u8; desc.size])),
            desc: desc.clone(),
        })
    }

    fn copy_to_buffer(
        &self,
        buffer: &HostBuffer,
        dst_offset: u64,
        data: &[u8],
    ) -> Result<(), BackendError> {
        check_write_range(&buffer.desc, dst_offset, data.len())?;

        let start = dst_offset as usize;
        let end = start + data.len();
        buffer.data.borrow_mut()[start..end].copy_from_slice(data);

        if buffer.desc.memory_location.is_host_visible() {
            self.update_stats(|stats| stats.mapped_bytes += data.len() as u64);
        } else {
            self.pending_copies.set(self.pending_copies.get() + 1);
            self.update_stats(|stats| {
                stats.staged_copies += 1;
                stats.staged_bytes += data.len() as u64;
            });
        }
        Ok(())
    }

    fn flush_uploads(&self) -> Result<(), BackendError> {
        if self.pending_copies.get() == 0 {
            return Ok(());
        }
        *self.queue.lock() += 1;
        self.pending_copies.set(0);
        self.update_stats(|stats| stats.flushes += 1);
        Ok(())
    }

    fn bind_vertex_buffer(&self, _cmd: Cmd, buffer: &HostBuffer, _offset: u64) {
        *self.bound_vertex.borrow_mut() = Some(buffer.clone());
    }

    fn bind_index_buffer(
        &self,
        _cmd: Cmd,
        buffer: &HostBuffer,
        _offset: u64,
        _index_type: GPUIndexedBufferType,
    ) {
        *self.bound_index.borrow_mut() = Some(buffer.clone());
    }

    fn draw_indexed(
        &self,
        cmd: Cmd,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        let (vertex_buffer, index_buffer) = self.bound_names();
        self.direct_draws.borrow_mut().push(DirectDraw {
            cmd,
            vertex_buffer,
            index_buffer,
            command: DrawIndexedIndirectCommand {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            },
        });
    }

    fn draw_indexed_indirect(
        &self,
        cmd: Cmd,
        buffer: &HostBuffer,
        offset: u64,
        draw_count: u32,
        stride: u32,
    ) {
        let commands = (0..draw_count as usize)
            .map(|i| {
                let at = offset as usize + i * stride as usize;
                buffer.read::<DrawIndexedIndirectCommand>(at, 1)[0]
            })
            .collect();

        let (vertex_buffer, index_buffer) = self.bound_names();
        self.draws.borrow_mut().push(IndirectDraw {
            cmd,
            indirect_buffer: buffer.desc.name.clone(),
            vertex_buffer,
            index_buffer,
            offset,
            draw_count,
            stride,
            commands,
        });
    }

    fn wait_for_gpu(&self) -> Result<(), BackendError> {
        self.flush_uploads()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(device: &HostDevice, memory_location: MemLoc) -> HostBuffer {
        device
            .create_buffer(&GPUBufferDesc {
                memory_location,
                size: 16,
                usage: GPUBufferUsage::STORAGE_BUFFER | GPUBufferUsage::TRANSFER_DST,
                name: "test_buffer".into(),
                ..Default::default()
            })
            .unwrap()
    }

    #[test]
    fn device_local_writes_are_staged_until_flush() {
        let device = HostDevice::new();
        let buf = buffer(&device, MemLoc::GpuOnly);

        device.copy_to_buffer(&buf, 4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(device.pending_copies(), 1);
        assert_eq!(&buf.bytes()[4..8], &[1, 2, 3, 4]);

        device.flush_uploads().unwrap();
        assert_eq!(device.pending_copies(), 0);
        assert_eq!(*device.queue().lock(), 1);
        assert_eq!(device.stats().staged_bytes, 4);
    }

    #[test]
    fn mapped_writes_skip_the_queue() {
        let device = HostDevice::new();
        let buf = buffer(&device, MemLoc::CpuToGpu);

        device.copy_to_buffer(&buf, 0, &[7; 16]).unwrap();
        device.flush_uploads().unwrap();

        assert_eq!(*device.queue().lock(), 0);
        assert_eq!(device.stats().mapped_bytes, 16);
    }

    #[test]
    fn overrun_is_rejected() {
        let device = HostDevice::new();
        let buf = buffer(&device, MemLoc::CpuToGpu);

        let err = device.copy_to_buffer(&buf, 12, &[0; 8]);
        assert!(matches!(err, Err(BackendError::OutOfBounds { .. })));
        assert!(buf.bytes().iter().all(|b| *b == 0));
    }

    #[test]
    fn draw_snapshots_the_commands() {
        let device = HostDevice::new();
        let buf = device
            .create_buffer(&GPUBufferDesc {
                memory_location: MemLoc::CpuToGpu,
                size: 2 * DrawIndexedIndirectCommand::STRIDE as usize,
                usage: GPUBufferUsage::INDIRECT_BUFFER,
                name: "indirect".into(),
                ..Default::default()
            })
            .unwrap();
        let cmds = [
            DrawIndexedIndirectCommand {
                index_count: 3,
                instance_count: 1,
                ..Default::default()
            },
            DrawIndexedIndirectCommand {
                index_count: 6,
                instance_count: 1,
                first_index: 3,
                first_instance: 1,
                ..Default::default()
            },
        ];
        device
            .copy_to_buffer(&buf, 0, bytemuck::cast_slice(&cmds))
            .unwrap();

        device.draw_indexed_indirect(Cmd(0), &buf, 0, 2, DrawIndexedIndirectCommand::STRIDE);

        let draws = device.take_draws();
        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].commands, cmds.to_vec());
        assert!(device.draws().is_empty());
    }

    #[test]
    fn direct_draws_remember_the_bound_buffers() {
        let device = HostDevice::new();
        let vertices = buffer(&device, MemLoc::GpuOnly);

        device.bind_vertex_buffer(Cmd(1), &vertices, 0);
        device.draw_indexed(Cmd(1), 3, 1, 6, 0, 4);

        let draws = device.take_direct_draws();
        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].vertex_buffer.as_deref(), Some("test_buffer"));
        assert_eq!(draws[0].index_buffer, None);
        assert_eq!(draws[0].command.first_index, 6);
        assert_eq!(draws[0].command.first_instance, 4);
        assert!(device.draws().is_empty());
    }
}
