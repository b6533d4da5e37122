use std::fmt;

use log::info;
use strata_backend::{GPUBufferDesc, GPUBufferUsage, GPUIndexedBufferType, GpuDevice, MemLoc};

use crate::{error::RenderError, flatten::StreamKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageRegion {
    Vertex,
    Index,
}

impl fmt::Display for PageRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageRegion::Vertex => write!(f, "vertex"),
            PageRegion::Index => write!(f, "index"),
        }
    }
}

/// One device local buffer of a page and how much of it is filled.
pub struct PageBuffer<B> {
    buffer: B,
    capacity: u64,
    used: u64,
}

impl<B> PageBuffer<B> {
    pub fn buffer(&self) -> &B {
        &self.buffer
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        self.used
    }
}

/// A vertex buffer and an index buffer filled side by side.
pub struct BufferPage<B> {
    pub vertex: PageBuffer<B>,
    pub index: PageBuffer<B>,
}

impl<B> BufferPage<B> {
    pub fn region(&self, region: PageRegion) -> &PageBuffer<B> {
        match region {
            PageRegion::Vertex => &self.vertex,
            PageRegion::Index => &self.index,
        }
    }

    fn region_mut(&mut self, region: PageRegion) -> &mut PageBuffer<B> {
        match region {
            PageRegion::Vertex => &mut self.vertex,
            PageRegion::Index => &mut self.index,
        }
    }
}

/// Fixed capacity pages for one geometry stream.
///
/// Pages are only ever appended to. Once an append no longer fits, the
/// caller opens a new page and restarts its running offsets at zero, so
/// offsets handed out earlier stay valid until the pool is cleared.
pub struct BufferPool<D: GpuDevice> {
    stream: StreamKind,
    vertex_capacity: u64,
    index_capacity: u64,
    pages: Vec<BufferPage<D::Buffer>>,
}

impl<D: GpuDevice> BufferPool<D> {
    pub fn new(stream: StreamKind, vertex_capacity: u64, index_capacity: u64) -> Self {
        BufferPool {
            stream,
            vertex_capacity,
            index_capacity,
            pages: Vec::new(),
        }
    }

    pub fn capacity(&self, region: PageRegion) -> u64 {
        match region {
            PageRegion::Vertex => self.vertex_capacity,
            PageRegion::Index => self.index_capacity,
        }
    }

    pub fn can_append(
        &self,
        page: usize,
        region: PageRegion,
        byte_size: u64,
        bytes_used_so_far: u64,
    ) -> bool {
        page < self.pages.len()
            && bytes_used_so_far
                .checked_add(byte_size)
                .map_or(false, |end| end <= self.capacity(region))
    }

    /// Uploads `data` at `bytes_used_so_far` and returns that offset.
    ///
    /// Pages are device local, so the bytes travel through the device's
    /// staging path and land once uploads are flushed.
    pub fn append(
        &mut self,
        device: &D,
        page: usize,
        region: PageRegion,
        data: &[u8],
        bytes_used_so_far: u64,
    ) -> Result<u64, RenderError> {
        let byte_size = data.len() as u64;
        if !self.can_append(page, region, byte_size, bytes_used_so_far) {
            return Err(RenderError::PageFull {
                page,
                region,
                requested: byte_size,
                used: bytes_used_so_far,
                capacity: self.capacity(region),
            });
        }

        let target = self.pages[page].region_mut(region);
        device.copy_to_buffer(&target.buffer, bytes_used_so_far, data)?;
        target.used = target.used.max(bytes_used_so_far + byte_size);

        Ok(bytes_used_so_far)
    }

    pub fn open_new_page(&mut self, device: &D) -> Result<usize, RenderError> {
        let page = self.pages.len();

        let vertex = device.create_buffer(&GPUBufferDesc {
            memory_location: MemLoc::GpuOnly,
            size: self.vertex_capacity as usize,
            usage: GPUBufferUsage::VERTEX_BUFFER
                | GPUBufferUsage::STORAGE_BUFFER
                | GPUBufferUsage::TRANSFER_DST,
            index_buffer_type: None,
            name: format!("{}_vertices({})", self.stream, page),
        })?;

        let index = device.create_buffer(&GPUBufferDesc {
            memory_location: MemLoc::GpuOnly,
            size: self.index_capacity as usize,
            usage: GPUBufferUsage::INDEX_BUFFER | GPUBufferUsage::TRANSFER_DST,
            index_buffer_type: Some(GPUIndexedBufferType::U32),
            name: format!("{}_indices({})", self.stream, page),
        })?;

        self.pages.push(BufferPage {
            vertex: PageBuffer {
                buffer: vertex,
                capacity: self.vertex_capacity,
                used: 0,
            },
            index: PageBuffer {
                buffer: index,
                capacity: self.index_capacity,
                used: 0,
            },
        });

        info!(
            "opened {} page {} ({} vertex bytes, {} index bytes)",
            self.stream, page, self.vertex_capacity, self.index_capacity
        );
        Ok(page)
    }

    pub fn page(&self, page: usize) -> Option<&BufferPage<D::Buffer>> {
        self.pages.get(page)
    }

    pub fn pages(&self) -> &[BufferPage<D::Buffer>] {
        &self.pages
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Drops every page. Offsets handed out so far become invalid.
    pub fn clear(&mut self) {
        self.pages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_backend::host::HostDevice;

    fn pool(capacity: u64) -> BufferPool<HostDevice> {
        BufferPool::new(StreamKind::Static, capacity, capacity)
    }

    #[test]
    fn can_append_checks_the_sum_against_capacity() {
        let device = HostDevice::new();
        let mut pool = pool(1000);

        assert!(!pool.can_append(0, PageRegion::Vertex, 1, 0));
        pool.open_new_page(&device).unwrap();

        assert!(pool.can_append(0, PageRegion::Vertex, 1000, 0));
        assert!(pool.can_append(0, PageRegion::Vertex, 400, 600));
        assert!(!pool.can_append(0, PageRegion::Vertex, 401, 600));
        assert!(!pool.can_append(0, PageRegion::Index, 1, u64::MAX));
    }

    #[test]
    fn third_mesh_of_400_bytes_opens_a_second_page() {
        let device = HostDevice::new();
        let mut pool = pool(1000);
        let mesh = [0xabu8; 400];

        let mut page = pool.open_new_page(&device).unwrap();
        let mut used = 0;
        let mut placed = Vec::new();
        for _ in 0..3 {
            if !pool.can_append(page, PageRegion::Vertex, mesh.len() as u64, used) {
                page = pool.open_new_page(&device).unwrap();
                used = 0;
            }
            let offset = pool
                .append(&device, page, PageRegion::Vertex, &mesh, used)
                .unwrap();
            used += mesh.len() as u64;
            placed.push((page, offset));
        }

        assert_eq!(pool.page_count(), 2);
        assert_eq!(placed, vec![(0, 0), (0, 400), (1, 0)]);
        for page in pool.pages() {
            assert!(page.vertex.used() <= page.vertex.capacity());
            assert!(page.index.used() <= page.index.capacity());
        }
        assert_eq!(pool.page(0).unwrap().vertex.used(), 800);
    }

    #[test]
    fn append_past_capacity_is_refused() {
        let device = HostDevice::new();
        let mut pool = pool(16);
        pool.open_new_page(&device).unwrap();

        let err = pool.append(&device, 0, PageRegion::Index, &[0; 8], 12);
        assert!(matches!(err, Err(RenderError::PageFull { page: 0, .. })));
        assert_eq!(pool.page(0).unwrap().index.used(), 0);
    }

    #[test]
    fn pages_are_device_local_and_staged() {
        let device = HostDevice::new();
        let mut pool = pool(64);
        pool.open_new_page(&device).unwrap();

        pool.append(&device, 0, PageRegion::Vertex, &[1, 2, 3, 4], 8)
            .unwrap();

        let page = pool.page(0).unwrap();
        assert_eq!(page.vertex.buffer().desc.memory_location, MemLoc::GpuOnly);
        assert_eq!(&page.vertex.buffer().bytes()[8..12], &[1, 2, 3, 4]);
        assert_eq!(device.pending_copies(), 1);
        assert_eq!(page.index.buffer().desc.name, "static_indices(0)");
    }
}
