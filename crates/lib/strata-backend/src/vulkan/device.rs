use std::{
    cell::{Cell, RefCell},
    ffi::{CStr, CString},
    fmt::Display,
    mem::ManuallyDrop,
    ops::Deref,
    rc::Rc,
    sync::Arc,
};

use ash::{
    extensions::ext::DebugUtils,
    vk::{self, Handle},
    Entry,
};
use gpu_allocator::vulkan::*;
use parking_lot::Mutex;

use crate::{
    device::{check_write_range, BackendError, GpuDevice, SharedQueue},
    gpu_structs::*,
};

pub type Alloc = Rc<RefCell<ManuallyDrop<Allocator>>>;

fn vk_err(call: &str, err: impl Display) -> BackendError {
    BackendError::Vulkan {
        call: call.into(),
        reason: err.to_string(),
    }
}

unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::os::raw::c_void,
) -> vk::Bool32 {
    let callback_data = *p_callback_data;

    let message_id_name = if callback_data.p_message_id_name.is_null() {
        std::borrow::Cow::from("")
    } else {
        CStr::from_ptr(callback_data.p_message_id_name).to_string_lossy()
    };

    let message = if callback_data.p_message.is_null() {
        std::borrow::Cow::from("")
    } else {
        CStr::from_ptr(callback_data.p_message).to_string_lossy()
    };

    if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("{:?} [{}] : {}", message_type, message_id_name, message);
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("{:?} [{}] : {}", message_type, message_id_name, message);
    }

    vk::FALSE
}

pub struct VulkanBuffer {
    pub allocation: ManuallyDrop<Allocation>,
    pub allocator: Alloc,
    pub device: ash::Device,
    pub buffer: vk::Buffer,
}

impl Drop for VulkanBuffer {
    fn drop(&mut self) {
        unsafe {
            let allocation = ManuallyDrop::take(&mut self.allocation);
            if let Err(err) = self.allocator.deref().borrow_mut().free(allocation) {
                log::error!("failed to free buffer allocation: {err}");
            }
            self.device.destroy_buffer(self.buffer, None);
        }
    }
}

/// Buffer handle. Every clone refers to the same allocation, which is
/// released with the last clone. All handles must be dropped before the
/// `Device` that created them.
#[derive(Clone)]
pub struct GPUBuffer {
    pub internal: Rc<RefCell<VulkanBuffer>>,
    pub desc: GPUBufferDesc,
}

impl PartialEq for GPUBuffer {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.internal, &other.internal)
    }
}

impl AsRef<GPUBufferDesc> for GPUBuffer {
    fn as_ref(&self) -> &GPUBufferDesc {
        &self.desc
    }
}

impl GPUBuffer {
    fn raw(&self) -> vk::Buffer {
        self.internal.deref().borrow().buffer
    }

    fn write_mapped(&self, dst_offset: u64, data: &[u8]) -> Result<(), BackendError> {
        let mut internal = self.internal.deref().borrow_mut();
        let mapped = internal
            .allocation
            .mapped_slice_mut()
            .ok_or_else(|| BackendError::NotHostVisible {
                buffer: self.desc.name.clone(),
            })?;

        let start = dst_offset as usize;
        mapped[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

#[derive(Default)]
pub struct CommandBuffer {
    pub cmd: vk::CommandBuffer,
    pub command_pool: vk::CommandPool,
}

impl CommandBuffer {
    fn new(device: &ash::Device, queue_family_index: u32) -> Result<Self, BackendError> {
        unsafe {
            let ci = vk::CommandPoolCreateInfo::builder()
                .flags(vk::CommandPoolCreateFlags::TRANSIENT)
                .queue_family_index(queue_family_index);
            let command_pool = device
                .create_command_pool(&ci, None)
                .map_err(|err| vk_err("vkCreateCommandPool", err))?;

            let ci = vk::CommandBufferAllocateInfo::builder()
                .command_buffer_count(1)
                .command_pool(command_pool)
                .level(vk::CommandBufferLevel::PRIMARY);

            let cmd = device
                .allocate_command_buffers(&ci)
                .map_err(|err| vk_err("vkAllocateCommandBuffers", err))?[0];

            Ok(CommandBuffer { cmd, command_pool })
        }
    }
}

#[derive(Clone, Debug)]
pub struct DeviceDesc {
    pub app_name: String,
    /// Enables `VK_LAYER_KHRONOS_validation` and routes its messages to `log`.
    pub validation: bool,
}

impl Default for DeviceDesc {
    fn default() -> Self {
        DeviceDesc {
            app_name: "Strata".into(),
            validation: cfg!(debug_assertions),
        }
    }
}

/// Headless Vulkan device: one graphics queue, one command buffer per frame
/// in flight and a staging copy manager for device local uploads.
pub struct Device {
    _entry: Entry,
    pub instance: ash::Instance,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    pub pdevice: vk::PhysicalDevice,
    pub device: ash::Device,
    device_properties: vk::PhysicalDeviceProperties,

    pub allocator: Alloc,
    graphics_queue: SharedQueue<vk::Queue>,
    pub graphics_queue_index: u32,

    // Frame data
    command_buffers: Vec<CommandBuffer>,
    release_fences: Vec<vk::Fence>, //once it's signaled the frame's cmd can be reused again
    frame_count: Cell<usize>,
    recording: Cell<bool>,
    //
    copy_manager: ManuallyDrop<RefCell<CopyManager>>,
}

impl Device {
    const VK_API_VERSION: u32 = vk::make_api_version(0, 1, 2, 0);
    pub const FRAME_MAX_COUNT: usize = 2;

    pub fn new(desc: &DeviceDesc) -> Result<Self, BackendError> {
        unsafe {
            let entry = Entry::load().map_err(|err| BackendError::Loader {
                reason: err.to_string(),
            })?;

            let app_name = CString::new(desc.app_name.as_str()).unwrap_or_default();

            let layer_names = [CString::new("VK_LAYER_KHRONOS_validation").unwrap_or_default()];
            let layers_names_raw: Vec<*const std::os::raw::c_char> = if desc.validation {
                layer_names.iter().map(|name| name.as_ptr()).collect()
            } else {
                Vec::new()
            };

            let mut extension_names_raw = Vec::new();
            if desc.validation {
                extension_names_raw.push(DebugUtils::name().as_ptr());
            }

            let appinfo = vk::ApplicationInfo::builder()
                .application_name(&app_name)
                .application_version(0)
                .engine_name(&app_name)
                .engine_version(0)
                .api_version(Self::VK_API_VERSION);

            let create_info = vk::InstanceCreateInfo::builder()
                .application_info(&appinfo)
                .enabled_layer_names(&layers_names_raw)
                .enabled_extension_names(&extension_names_raw);

            let instance = entry
                .create_instance(&create_info, None)
                .map_err(|err| vk_err("vkCreateInstance", err))?;

            let debug_utils = if desc.validation {
                let debug_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
                    .message_severity(
                        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
                    )
                    .message_type(
                        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                    )
                    .pfn_user_callback(Some(vulkan_debug_callback));

                let loader = DebugUtils::new(&entry, &instance);
                let messenger = loader
                    .create_debug_utils_messenger(&debug_info, None)
                    .map_err(|err| vk_err("vkCreateDebugUtilsMessengerEXT", err))?;
                Some((loader, messenger))
            } else {
                None
            };

            let (pdevice, graphics_queue_index, device_properties) =
                Device::pick_physical_device(&instance)?;

            let priorities = [1.0];
            let queue_info = [vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(graphics_queue_index)
                .queue_priorities(&priorities)
                .build()];

            let ci = vk::DeviceCreateInfo::builder().queue_create_infos(&queue_info);

            let device = instance
                .create_device(pdevice, &ci, None)
                .map_err(|err| vk_err("vkCreateDevice", err))?;

            let graphics_queue = device.get_device_queue(graphics_queue_index, 0);

            let allocator = Allocator::new(&AllocatorCreateDesc {
                instance: instance.clone(),
                device: device.clone(),
                physical_device: pdevice,
                debug_settings: Default::default(),
                buffer_device_address: false,
            })
            .map_err(|err| BackendError::Allocation {
                buffer: "allocator".into(),
                reason: err.to_string(),
            })?;

            let mut command_buffers = Vec::with_capacity(Self::FRAME_MAX_COUNT);
            let mut release_fences = Vec::with_capacity(Self::FRAME_MAX_COUNT);
            for _ in 0..Self::FRAME_MAX_COUNT {
                command_buffers.push(CommandBuffer::new(&device, graphics_queue_index)?);
                release_fences.push(
                    device
                        .create_fence(&vk::FenceCreateInfo::default(), None)
                        .map_err(|err| vk_err("vkCreateFence", err))?,
                );
            }

            let copy_manager = ManuallyDrop::new(RefCell::new(CopyManager::new(
                graphics_queue_index,
                &device,
            )?));

            Ok(Self {
                _entry: entry,
                instance,
                debug_utils,
                pdevice,
                device,
                device_properties,
                allocator: Rc::new(RefCell::new(ManuallyDrop::new(allocator))),
                graphics_queue: Arc::new(Mutex::new(graphics_queue)),
                graphics_queue_index,
                command_buffers,
                release_fences,
                frame_count: Cell::new(0),
                recording: Cell::new(false),
                copy_manager,
            })
        }
    }

    fn pick_physical_device(
        instance: &ash::Instance,
    ) -> Result<(vk::PhysicalDevice, u32, vk::PhysicalDeviceProperties), BackendError> {
        unsafe {
            let pdevices = instance
                .enumerate_physical_devices()
                .map_err(|err| vk_err("vkEnumeratePhysicalDevices", err))?;

            let possible_devices: Vec<(vk::PhysicalDevice, u32, vk::PhysicalDeviceProperties)> =
                pdevices
                    .iter()
                    .filter_map(|pdevice| {
                        instance
                            .get_physical_device_queue_family_properties(*pdevice)
                            .iter()
                            .position(|info| info.queue_flags.contains(vk::QueueFlags::GRAPHICS))
                            .map(|queue_family_index| {
                                (
                                    *pdevice,
                                    queue_family_index as u32,
                                    instance.get_physical_device_properties(*pdevice),
                                )
                            })
                    })
                    .collect();

            for x in &possible_devices {
                log::debug!(
                    "device available {:?} , {:?}",
                    CStr::from_ptr(x.2.device_name.as_ptr()),
                    x.2.device_type
                );
            }

            let picked = possible_devices
                .iter()
                .find(|d| d.2.device_type == vk::PhysicalDeviceType::DISCRETE_GPU)
                .or_else(|| possible_devices.first())
                .copied()
                .ok_or(BackendError::NoSuitableDevice)?;

            log::info!(
                "Picked :{:?} , type:{:?}",
                CStr::from_ptr(picked.2.device_name.as_ptr()),
                picked.2.device_type
            );

            Ok(picked)
        }
    }

    pub fn device_name(&self) -> String {
        unsafe {
            CStr::from_ptr(self.device_properties.device_name.as_ptr())
                .to_string_lossy()
                .into_owned()
        }
    }

    /// The queue lock, for other subsystems submitting to the same queue.
    pub fn submit_queue(&self) -> SharedQueue<vk::Queue> {
        self.graphics_queue.clone()
    }

    fn get_current_frame_index(&self) -> usize {
        self.frame_count.get() % Device::FRAME_MAX_COUNT
    }

    fn get_cmd(&self, cmd: Cmd) -> vk::CommandBuffer {
        self.command_buffers[cmd.0].cmd
    }

    pub fn begin_command_buffer(&self) -> Result<Cmd, BackendError> {
        if self.recording.get() {
            return Err(BackendError::InvalidState {
                reason: "frame command buffer already recording".into(),
            });
        }

        let frame = self.get_current_frame_index();
        let command_buffer_begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            self.device
                .begin_command_buffer(self.command_buffers[frame].cmd, &command_buffer_begin_info)
                .map_err(|err| vk_err("vkBeginCommandBuffer", err))?;
        }
        self.recording.set(true);

        Ok(Cmd(frame))
    }

    /// Ends the frame's command buffer and submits it after any pending
    /// uploads, then waits for the frame's fence.
    pub fn end_command_buffers(&self) -> Result<(), BackendError> {
        if !self.recording.get() {
            return Ok(());
        }
        self.flush_uploads()?;

        let frame = self.get_current_frame_index();
        let cmd = &self.command_buffers[frame];
        let release_fence = self.release_fences[frame];

        unsafe {
            self.device
                .end_command_buffer(cmd.cmd)
                .map_err(|err| vk_err("vkEndCommandBuffer", err))?;

            let command_buffers = [cmd.cmd];
            let submit_info = vk::SubmitInfo::builder()
                .command_buffers(&command_buffers)
                .build();

            {
                let queue = self.graphics_queue.lock();
                self.device
                    .queue_submit(*queue, &[submit_info], release_fence)
                    .map_err(|err| vk_err("vkQueueSubmit", err))?;
            }

            self.device
                .wait_for_fences(&[release_fence], true, u64::MAX)
                .map_err(|err| vk_err("vkWaitForFences", err))?;
            self.device
                .reset_fences(&[release_fence])
                .map_err(|err| vk_err("vkResetFences", err))?;
            self.device
                .reset_command_pool(cmd.command_pool, vk::CommandPoolResetFlags::empty())
                .map_err(|err| vk_err("vkResetCommandPool", err))?;
        }

        self.recording.set(false);
        self.frame_count.set(self.frame_count.get() + 1);
        Ok(())
    }

    fn set_vk_object_label(&self, obj: u64, ty: vk::ObjectType, label: &str) {
        let Some((loader, _)) = &self.debug_utils else {
            return;
        };
        let Ok(label) = CString::new(label) else {
            return;
        };
        let name_info = vk::DebugUtilsObjectNameInfoEXT::builder()
            .object_handle(obj)
            .object_name(&label)
            .object_type(ty);
        unsafe {
            if let Err(err) = loader.debug_utils_set_object_name(self.device.handle(), &name_info) {
                log::warn!("object name setting failed: {err}");
            }
        }
    }

    fn to_vk_usage(usage: GPUBufferUsage) -> vk::BufferUsageFlags {
        let mut flags = vk::BufferUsageFlags::default();
        if usage.contains(GPUBufferUsage::TRANSFER_SRC) {
            flags |= vk::BufferUsageFlags::TRANSFER_SRC;
        }
        if usage.contains(GPUBufferUsage::TRANSFER_DST) {
            flags |= vk::BufferUsageFlags::TRANSFER_DST;
        }
        if usage.contains(GPUBufferUsage::UNIFORM_BUFFER) {
            flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
        }
        if usage.contains(GPUBufferUsage::STORAGE_BUFFER) {
            flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
        }
        if usage.contains(GPUBufferUsage::INDEX_BUFFER) {
            flags |= vk::BufferUsageFlags::INDEX_BUFFER;
        }
        if usage.contains(GPUBufferUsage::VERTEX_BUFFER) {
            flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
        }
        if usage.contains(GPUBufferUsage::INDIRECT_BUFFER) {
            flags |= vk::BufferUsageFlags::INDIRECT_BUFFER;
        }
        flags
    }
}

impl GpuDevice for Device {
    type Buffer = GPUBuffer;

    fn create_buffer(&self, desc: &GPUBufferDesc) -> Result<GPUBuffer, BackendError> {
        let location = match desc.memory_location {
            MemLoc::CpuToGpu => gpu_allocator::MemoryLocation::CpuToGpu,
            MemLoc::GpuToCpu => gpu_allocator::MemoryLocation::GpuToCpu,
            MemLoc::GpuOnly => gpu_allocator::MemoryLocation::GpuOnly,
            MemLoc::Unknown => gpu_allocator::MemoryLocation::Unknown,
        };

        let info = vk::BufferCreateInfo::builder()
            .size(desc.size as u64)
            .usage(Device::to_vk_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        unsafe {
            let buffer = self
                .device
                .create_buffer(&info, None)
                .map_err(|err| vk_err("vkCreateBuffer", err))?;
            let requirements = self.device.get_buffer_memory_requirements(buffer);

            let allocation = (*self.allocator)
                .borrow_mut()
                .allocate(&AllocationCreateDesc {
                    name: &desc.name,
                    requirements,
                    location,
                    linear: true,
                });
            let allocation = match allocation {
                Ok(allocation) => allocation,
                Err(err) => {
                    self.device.destroy_buffer(buffer, None);
                    return Err(BackendError::Allocation {
                        buffer: desc.name.clone(),
                        reason: err.to_string(),
                    });
                }
            };

            // from here on the buffer is released by VulkanBuffer::drop
            let gpu_buffer = GPUBuffer {
                internal: Rc::new(RefCell::new(VulkanBuffer {
                    allocation: ManuallyDrop::new(allocation),
                    allocator: self.allocator.clone(),
                    buffer,
                    device: self.device.clone(),
                })),
                desc: desc.clone(),
            };

            {
                let internal = gpu_buffer.internal.deref().borrow();
                self.device
                    .bind_buffer_memory(
                        buffer,
                        internal.allocation.memory(),
                        internal.allocation.offset(),
                    )
                    .map_err(|err| vk_err("vkBindBufferMemory", err))?;
            }

            self.set_vk_object_label(buffer.as_raw(), vk::ObjectType::BUFFER, &desc.name);

            Ok(gpu_buffer)
        }
    }

    fn copy_to_buffer(
        &self,
        buffer: &GPUBuffer,
        dst_offset: u64,
        data: &[u8],
    ) -> Result<(), BackendError> {
        check_write_range(&buffer.desc, dst_offset, data.len())?;
        if data.is_empty() {
            return Ok(());
        }

        match buffer.desc.memory_location {
            MemLoc::CpuToGpu | MemLoc::GpuToCpu => buffer.write_mapped(dst_offset, data),
            MemLoc::GpuOnly | MemLoc::Unknown => {
                let region = vk::BufferCopy {
                    dst_offset,
                    size: data.len() as u64,
                    src_offset: 0,
                };

                self.copy_manager
                    .borrow_mut()
                    .copy_buffer(self, buffer, data, region)
            }
        }
    }

    fn flush_uploads(&self) -> Result<(), BackendError> {
        self.copy_manager
            .borrow_mut()
            .flush(self, &self.graphics_queue)
    }

    fn bind_vertex_buffer(&self, cmd: Cmd, buffer: &GPUBuffer, offset: u64) {
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(self.get_cmd(cmd), 0, &[buffer.raw()], &[offset]);
        }
    }

    fn bind_index_buffer(
        &self,
        cmd: Cmd,
        buffer: &GPUBuffer,
        offset: u64,
        index_type: GPUIndexedBufferType,
    ) {
        let index_type = match index_type {
            GPUIndexedBufferType::U32 => vk::IndexType::UINT32,
            GPUIndexedBufferType::U16 => vk::IndexType::UINT16,
        };
        unsafe {
            self.device
                .cmd_bind_index_buffer(self.get_cmd(cmd), buffer.raw(), offset, index_type);
        }
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
        unsafe {
            self.device.cmd_draw_indexed(
                self.get_cmd(cmd),
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
    }

    fn draw_indexed_indirect(
        &self,
        cmd: Cmd,
        buffer: &GPUBuffer,
        offset: u64,
        draw_count: u32,
        stride: u32,
    ) {
        unsafe {
            self.device.cmd_draw_indexed_indirect(
                self.get_cmd(cmd),
                buffer.raw(),
                offset,
                draw_count,
                stride,
            );
        }
    }

    fn wait_for_gpu(&self) -> Result<(), BackendError> {
        unsafe {
            self.device
                .device_wait_idle()
                .map_err(|err| vk_err("vkDeviceWaitIdle", err))
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            log::debug!("Destroying vulkan device");
            if let Err(err) = self.device.device_wait_idle() {
                log::error!("device_wait_idle failed: {err}");
            }

            for cmd in &self.command_buffers {
                self.device.destroy_command_pool(cmd.command_pool, None);
            }
            for fence in &self.release_fences {
                self.device.destroy_fence(*fence, None);
            }

            //free copy manager before the allocator goes
            ManuallyDrop::drop(&mut self.copy_manager);
            let allocator = &mut *(*self.allocator).borrow_mut();
            ManuallyDrop::drop(allocator);

            self.device.destroy_device(None);
            if let Some((loader, messenger)) = self.debug_utils.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Records host to device copies through host visible staging buffers and
/// submits them in one batch.
struct CopyManager {
    free_buffers: Vec<GPUBuffer>,
    used_buffers: Vec<GPUBuffer>,
    // destinations of recorded copies, kept alive until the batch lands
    targets: Vec<GPUBuffer>,
    //needs to be dropped
    cmd: CommandBuffer,
    //needs to be dropped
    fence: vk::Fence,
    recording: bool,
    device: ash::Device,
}

impl CopyManager {
    const BUFFERS_COUNT: usize = 10;

    fn new(transfer_queue_index: u32, device: &ash::Device) -> Result<Self, BackendError> {
        let cmd = CommandBuffer::new(device, transfer_queue_index)?;
        let fence = unsafe {
            device
                .create_fence(&vk::FenceCreateInfo::default(), None)
                .map_err(|err| vk_err("vkCreateFence", err))?
        };

        Ok(CopyManager {
            free_buffers: Vec::with_capacity(Self::BUFFERS_COUNT),
            used_buffers: Vec::with_capacity(Self::BUFFERS_COUNT),
            targets: Vec::new(),
            cmd,
            fence,
            recording: false,
            device: device.clone(),
        })
    }

    fn pick_staging_buffer(
        &mut self,
        size: usize,
        gfx: &Device,
    ) -> Result<GPUBuffer, BackendError> {
        let free = self
            .free_buffers
            .iter()
            .position(|buffer| buffer.desc.size >= size);

        let buffer = match free {
            Some(i) => self.free_buffers.swap_remove(i),
            None => {
                let desc = GPUBufferDesc {
                    index_buffer_type: None,
                    size,
                    memory_location: MemLoc::CpuToGpu,
                    usage: GPUBufferUsage::TRANSFER_SRC,
                    name: format!("staging-buffer({})", self.used_buffers.len()),
                };
                gfx.create_buffer(&desc)?
            }
        };
        self.used_buffers.push(buffer.clone());
        Ok(buffer)
    }

    fn begin(&mut self) -> Result<(), BackendError> {
        if self.recording {
            return Ok(());
        }
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .begin_command_buffer(self.cmd.cmd, &begin_info)
                .map_err(|err| vk_err("vkBeginCommandBuffer", err))?;
        }
        self.recording = true;
        Ok(())
    }

    fn copy_buffer(
        &mut self,
        gfx: &Device,
        buffer: &GPUBuffer,
        data: &[u8],
        region: vk::BufferCopy,
    ) -> Result<(), BackendError> {
        self.begin()?;

        // copy data to staging buffer
        let staging = self.pick_staging_buffer(data.len(), gfx)?;
        staging.write_mapped(0, data)?;

        // copy from staging buffer to GPU buffer
        unsafe {
            gfx.device
                .cmd_copy_buffer(self.cmd.cmd, staging.raw(), buffer.raw(), &[region]);
        }
        if !self.targets.contains(buffer) {
            self.targets.push(buffer.clone());
        }
        Ok(())
    }

    fn flush(&mut self, gfx: &Device, queue: &SharedQueue<vk::Queue>) -> Result<(), BackendError> {
        if !self.recording {
            return Ok(());
        }

        let barrier = vk::MemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(
                vk::AccessFlags::VERTEX_ATTRIBUTE_READ
                    | vk::AccessFlags::INDEX_READ
                    | vk::AccessFlags::INDIRECT_COMMAND_READ
                    | vk::AccessFlags::SHADER_READ,
            )
            .build();

        unsafe {
            gfx.device.cmd_pipeline_barrier(
                self.cmd.cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::ALL_GRAPHICS,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
            gfx.device
                .end_command_buffer(self.cmd.cmd)
                .map_err(|err| vk_err("vkEndCommandBuffer", err))?;

            let cmds = [self.cmd.cmd];
            let submit_info = vk::SubmitInfo::builder().command_buffers(&cmds).build();
            {
                let queue = queue.lock();
                gfx.device
                    .queue_submit(*queue, &[submit_info], self.fence)
                    .map_err(|err| vk_err("vkQueueSubmit", err))?;
            }

            gfx.device
                .wait_for_fences(&[self.fence], true, u64::MAX)
                .map_err(|err| vk_err("vkWaitForFences", err))?;
            gfx.device
                .reset_fences(&[self.fence])
                .map_err(|err| vk_err("vkResetFences", err))?;
            gfx.device
                .reset_command_pool(self.cmd.command_pool, vk::CommandPoolResetFlags::empty())
                .map_err(|err| vk_err("vkResetCommandPool", err))?;
        }

        self.recording = false;
        self.free_buffers.append(&mut self.used_buffers);
        self.targets.clear();
        Ok(())
    }
}

impl Drop for CopyManager {
    fn drop(&mut self) {
        self.free_buffers.clear();
        self.used_buffers.clear();
        self.targets.clear();
        unsafe {
            self.device.destroy_command_pool(self.cmd.command_pool, None);
            self.device.destroy_fence(self.fence, None);
        }
    }
}
