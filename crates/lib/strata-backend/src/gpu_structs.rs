use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

bitflags! {
   pub struct  GPUBufferUsage:u32 {
        #[doc = "Can be used as a source of transfer operations"]
        const TRANSFER_SRC = 0b1;
        #[doc = "Can be used as a destination of transfer operations"]
        const TRANSFER_DST = 0b10;
        #[doc = "Can be used as UBO"]
        const UNIFORM_BUFFER = 0b1_0000;
        #[doc = "Can be used as SSBO"]
        const STORAGE_BUFFER = 0b10_0000;
        #[doc = "Can be used as source of fixed-function index fetch (index buffer)"]
        const INDEX_BUFFER = 0b100_0000;
        #[doc = "Can be used as source of fixed-function vertex fetch (VBO)"]
        const VERTEX_BUFFER = 0b1000_0000;
        #[doc = "Can be the source of indirect parameters (e.g. indirect buffer, parameter buffer)"]
        const INDIRECT_BUFFER = 0b1_0000_0000;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemLoc {
    /// The allocated resource is stored at an unknown memory location; let the driver decide what's the best location
    Unknown,
    /// Store the allocation in GPU only accessible memory - typically this is the faster GPU resource and this should be
    /// where most of the allocations live.
    GpuOnly,
    /// Memory useful for uploading data to the GPU and potentially for constant buffers
    CpuToGpu,
    /// Memory useful for CPU readback of data
    GpuToCpu,
}

impl MemLoc {
    /// Whether the CPU can write the allocation through a mapped pointer.
    pub fn is_host_visible(&self) -> bool {
        matches!(self, MemLoc::CpuToGpu | MemLoc::GpuToCpu)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GPUIndexedBufferType {
    U32,
    U16,
}

impl GPUIndexedBufferType {
    pub fn size(&self) -> u64 {
        match self {
            GPUIndexedBufferType::U32 => 4,
            GPUIndexedBufferType::U16 => 2,
        }
    }
}

#[derive(Clone, Debug)]
pub struct GPUBufferDesc {
    pub memory_location: MemLoc,
    pub size: usize,
    pub usage: GPUBufferUsage,
    pub index_buffer_type: Option<GPUIndexedBufferType>,
    pub name: String,
}

impl Default for GPUBufferDesc {
    fn default() -> Self {
        GPUBufferDesc {
            memory_location: MemLoc::Unknown,
            size: 0,
            usage: GPUBufferUsage::VERTEX_BUFFER,
            index_buffer_type: None,
            name: String::default(),
        }
    }
}

/// Handle to a command buffer being recorded for the current frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cmd(pub usize);

/// One indexed draw read by `vkCmdDrawIndexedIndirect`.
///
/// Same layout as `VkDrawIndexedIndirectCommand` so a slice of these can be
/// copied into an indirect buffer byte for byte.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrawIndexedIndirectCommand {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
}

impl DrawIndexedIndirectCommand {
    pub const STRIDE: u32 = std::mem::size_of::<DrawIndexedIndirectCommand>() as u32;
}
