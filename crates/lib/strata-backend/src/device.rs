use std::sync::Arc;

use custom_error::custom_error;
use parking_lot::Mutex;

use crate::gpu_structs::*;

custom_error! {pub BackendError
    Vulkan{call: String, reason: String} = "{call} failed: {reason}",
    Allocation{buffer: String, reason: String} = "allocating '{buffer}' failed: {reason}",
    Loader{reason: String} = "could not load the vulkan library: {reason}",
    NoSuitableDevice = "no physical device exposes a graphics queue",
    OutOfBounds{buffer: String, offset: u64, len: u64, size: u64} = "write of {len} bytes at offset {offset} overruns '{buffer}' ({size} bytes)",
    NotHostVisible{buffer: String} = "'{buffer}' is not host visible",
    InvalidState{reason: String} = "{reason}",
}

/// Queue handle shared by every subsystem that submits to the same device
/// queue. Only submission takes the lock.
pub type SharedQueue<Q> = Arc<Mutex<Q>>;

/// The slice of a GPU device the geometry core drives.
///
/// Buffers are reference counted handles; dropping the last clone releases
/// the allocation.
pub trait GpuDevice {
    type Buffer: Clone + AsRef<GPUBufferDesc>;

    fn create_buffer(&self, desc: &GPUBufferDesc) -> Result<Self::Buffer, BackendError>;

    /// Writes `data` at `dst_offset`.
    ///
    /// Host visible buffers are written through their mapping. Device local
    /// buffers are written into a staging buffer first and copied on the
    /// device when uploads are flushed.
    fn copy_to_buffer(
        &self,
        buffer: &Self::Buffer,
        dst_offset: u64,
        data: &[u8],
    ) -> Result<(), BackendError>;

    /// Submits pending staging copies and waits for them to land.
    fn flush_uploads(&self) -> Result<(), BackendError>;

    fn bind_vertex_buffer(&self, cmd: Cmd, buffer: &Self::Buffer, offset: u64);

    fn bind_index_buffer(
        &self,
        cmd: Cmd,
        buffer: &Self::Buffer,
        offset: u64,
        index_type: GPUIndexedBufferType,
    );

    fn draw_indexed(
        &self,
        cmd: Cmd,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );

    fn draw_indexed_indirect(
        &self,
        cmd: Cmd,
        buffer: &Self::Buffer,
        offset: u64,
        draw_count: u32,
        stride: u32,
    );

    fn wait_for_gpu(&self) -> Result<(), BackendError>;
}

/// Bounds check shared by the backends before any byte is written.
pub fn check_write_range(
    desc: &GPUBufferDesc,
    offset: u64,
    len: usize,
) -> Result<(), BackendError> {
    let size = desc.size as u64;
    let len = len as u64;
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(BackendError::OutOfBounds {
            buffer: desc.name.clone(),
            offset,
            len,
            size,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(size: usize) -> GPUBufferDesc {
        GPUBufferDesc {
            size,
            name: "scratch".into(),
            ..Default::default()
        }
    }

    #[test]
    fn write_range() {
        assert!(check_write_range(&desc(16), 0, 16).is_ok());
        assert!(check_write_range(&desc(16), 12, 4).is_ok());
        assert!(check_write_range(&desc(16), 12, 5).is_err());
        assert!(check_write_range(&desc(16), u64::MAX, 1).is_err());
    }

    #[test]
    fn error_names_the_buffer() {
        let err = check_write_range(&desc(8), 4, 8).unwrap_err();
        assert_eq!(
            err.to_string(),
            "write of 8 bytes at offset 4 overruns 'scratch' (8 bytes)"
        );
    }
}
