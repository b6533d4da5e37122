pub mod device;

pub use device::{CommandBuffer, Device, DeviceDesc, GPUBuffer, VulkanBuffer};
