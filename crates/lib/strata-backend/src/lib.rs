mod device;
pub mod gpu_structs;
pub mod host;
#[cfg(feature = "vulkan")]
pub mod vulkan;

pub use device::*;
pub use gpu_structs::*;

#[cfg(feature = "vulkan")]
pub use ash;
pub use bytemuck;
