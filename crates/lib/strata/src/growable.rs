use log::debug;
use strata_backend::{GPUBufferDesc, GPUBufferUsage, GpuDevice, MemLoc};

use crate::error::RenderError;

/// A host visible buffer that is only ever recreated larger.
///
/// Writes always start at byte 0. When a write does not fit, the buffer is
/// replaced by one sized to the next power of two; earlier contents are not
/// carried over.
pub struct GrowableBuffer<D: GpuDevice> {
    name: String,
    usage: GPUBufferUsage,
    buffer: Option<D::Buffer>,
}

impl<D: GpuDevice> GrowableBuffer<D> {
    const MIN_BYTES: u64 = 256;

    pub fn new(name: impl Into<String>, usage: GPUBufferUsage) -> Self {
        GrowableBuffer {
            name: name.into(),
            usage,
            buffer: None,
        }
    }

    pub fn buffer(&self) -> Option<&D::Buffer> {
        self.buffer.as_ref()
    }

    pub fn capacity(&self) -> u64 {
        self.buffer
            .as_ref()
            .map_or(0, |buffer| buffer.as_ref().size as u64)
    }

    /// Makes room for `size` bytes. Returns true when the buffer was
    /// (re)created.
    pub fn reserve(&mut self, device: &D, size: u64) -> Result<bool, RenderError> {
        if size <= self.capacity() {
            return Ok(false);
        }

        let new_size = size.next_power_of_two().max(Self::MIN_BYTES);
        debug!(
            "growing '{}' from {} to {} bytes",
            self.name,
            self.capacity(),
            new_size
        );
        self.buffer = Some(device.create_buffer(&GPUBufferDesc {
            memory_location: MemLoc::CpuToGpu,
            size: new_size as usize,
            usage: self.usage,
            index_buffer_type: None,
            name: self.name.clone(),
        })?);
        Ok(true)
    }

    /// Copies `data` to the front of the buffer, growing it first if needed.
    pub fn write(&mut self, device: &D, data: &[u8]) -> Result<(), RenderError> {
        if data.is_empty() {
            return Ok(());
        }
        self.reserve(device, data.len() as u64)?;
        if let Some(buffer) = &self.buffer {
            device.copy_to_buffer(buffer, 0, data)?;
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.buffer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_backend::host::HostDevice;

    #[test]
    fn grows_only_when_a_write_does_not_fit() {
        let device = HostDevice::new();
        let mut buffer =
            GrowableBuffer::<HostDevice>::new("objects(0)", GPUBufferUsage::STORAGE_BUFFER);
        assert_eq!(buffer.capacity(), 0);

        buffer.write(&device, &[7; 100]).unwrap();
        assert_eq!(buffer.capacity(), 256);

        buffer.write(&device, &[1; 200]).unwrap();
        assert_eq!(device.stats().buffers_created, 1);

        buffer.write(&device, &[2; 300]).unwrap();
        assert_eq!(buffer.capacity(), 512);
        assert_eq!(device.stats().buffers_created, 2);

        let written = buffer.buffer().unwrap();
        assert_eq!(written.desc.memory_location, MemLoc::CpuToGpu);
        assert_eq!(&written.bytes()[..300], vec![2u8; 300].as_slice());
    }

    #[test]
    fn empty_writes_allocate_nothing() {
        let device = HostDevice::new();
        let mut buffer =
            GrowableBuffer::<HostDevice>::new("joints(0)", GPUBufferUsage::STORAGE_BUFFER);
        buffer.write(&device, &[]).unwrap();
        assert!(buffer.buffer().is_none());
        assert_eq!(device.stats().buffers_created, 0);
    }
}
