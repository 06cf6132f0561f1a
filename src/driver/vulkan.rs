//! [`Driver`] backend over an application-provided _Ash_ device.
//!
//! The device must support Vulkan 1.3 with the `synchronization2`, `dynamicRendering`, and
//! `timelineSemaphore` features enabled. Memory is sub-allocated with _gpu-allocator_.

use {
    super::{
        format_aspect_mask, BufferInfo, ClearValue, ComputePipelineDesc, DescriptorResource,
        DescriptorSetLayoutBinding, DescriptorWrite, Dependency, Driver, DriverError,
        GraphicPipelineDesc, ImageInfo, ImageViewInfo, QueueId, RenderingAttachment,
        RenderingInfo, SamplerDesc, ShaderCode, Submission,
    },
    ash::vk,
    gpu_allocator::{
        vulkan::{
            Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
        },
        AllocationError, AllocationSizes, AllocatorDebugSettings, MemoryLocation,
    },
    log::{trace, warn},
    parking_lot::Mutex,
    std::{
        collections::HashMap,
        ffi::CStr,
        fmt::{Debug, Formatter},
    },
};

const ENTRY_POINT: &CStr = c"main";

fn driver_error(err: vk::Result) -> DriverError {
    warn!("{err}");

    match err {
        vk::Result::ERROR_OUT_OF_HOST_MEMORY
        | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
        | vk::Result::ERROR_OUT_OF_POOL_MEMORY
        | vk::Result::ERROR_FRAGMENTED_POOL => DriverError::OutOfMemory,
        vk::Result::ERROR_FORMAT_NOT_SUPPORTED
        | vk::Result::ERROR_FEATURE_NOT_PRESENT
        | vk::Result::ERROR_EXTENSION_NOT_PRESENT => DriverError::Unsupported,
        _ => DriverError::InvalidData,
    }
}

fn allocation_error(err: AllocationError) -> DriverError {
    warn!("{err}");

    match err {
        AllocationError::OutOfMemory => DriverError::OutOfMemory,
        _ => DriverError::Unsupported,
    }
}

fn clear_value(value: ClearValue) -> vk::ClearValue {
    match value {
        ClearValue::Color(float32) => vk::ClearValue {
            color: vk::ClearColorValue { float32 },
        },
        ClearValue::DepthStencil(depth, stencil) => vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
        },
    }
}

fn rendering_attachment(attachment: &RenderingAttachment) -> vk::RenderingAttachmentInfo<'static> {
    let mut res = vk::RenderingAttachmentInfo::default()
        .image_view(attachment.view)
        .image_layout(attachment.layout)
        .load_op(attachment.load_op)
        .store_op(attachment.store_op);

    if let Some(value) = attachment.clear_value {
        res = res.clear_value(clear_value(value));
    }

    res
}

/// Implements [`Driver`] for an _Ash_ device.
///
/// The device and instance remain owned by the application and must outlive this driver.
pub struct VulkanDriver {
    allocator: Mutex<Allocator>,
    buffers: Mutex<HashMap<vk::Buffer, Allocation>>,
    cmd_pools: Mutex<HashMap<vk::CommandBuffer, vk::CommandPool>>,
    descriptor_pools: Mutex<HashMap<vk::DescriptorSet, vk::DescriptorPool>>,
    device: ash::Device,
    images: Mutex<HashMap<vk::Image, Allocation>>,
    limits: vk::PhysicalDeviceLimits,
}

impl VulkanDriver {
    /// Creates a driver for `device`, which was created from `physical_device` of `instance`.
    #[profiling::function]
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Self, DriverError> {
        trace!("new");

        let limits = unsafe { instance.get_physical_device_properties(physical_device) }.limits;
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: AllocatorDebugSettings {
                log_leaks_on_shutdown: cfg!(debug_assertions),
                ..Default::default()
            },
            buffer_device_address: false,
            allocation_sizes: AllocationSizes::default(),
        })
        .map_err(allocation_error)?;

        Ok(Self {
            allocator: Mutex::new(allocator),
            buffers: Default::default(),
            cmd_pools: Default::default(),
            descriptor_pools: Default::default(),
            device: device.clone(),
            images: Default::default(),
            limits,
        })
    }

    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation, DriverError> {
        self.allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(allocation_error)
    }

    fn free(&self, allocation: Allocation) {
        if let Err(err) = self.allocator.lock().free(allocation) {
            warn!("unable to free allocation: {err}");
        }
    }

    fn create_shader_module(&self, shader: &ShaderCode) -> Result<vk::ShaderModule, DriverError> {
        unsafe {
            self.device.create_shader_module(
                &vk::ShaderModuleCreateInfo::default().code(&shader.spirv),
                None,
            )
        }
        .map_err(driver_error)
    }

    fn destroy_shader_modules(&self, modules: &[vk::ShaderModule]) {
        for &module in modules {
            unsafe {
                self.device.destroy_shader_module(module, None);
            }
        }
    }
}

impl Debug for VulkanDriver {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanDriver")
            .field("device", &self.device.handle())
            .finish()
    }
}

impl Driver for VulkanDriver {
    fn min_uniform_buffer_offset_alignment(&self) -> vk::DeviceSize {
        self.limits.min_uniform_buffer_offset_alignment
    }

    fn create_command_buffer(
        &self,
        queue_family_index: u32,
    ) -> Result<vk::CommandBuffer, DriverError> {
        // One pool per command buffer; pools are externally synchronized
        let pool = unsafe {
            self.device.create_command_pool(
                &vk::CommandPoolCreateInfo::default()
                    .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                    .queue_family_index(queue_family_index),
                None,
            )
        }
        .map_err(driver_error)?;
        let cmd_buf = unsafe {
            self.device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::default()
                    .command_pool(pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1),
            )
        }
        .map_err(|err| {
            unsafe {
                self.device.destroy_command_pool(pool, None);
            }

            driver_error(err)
        })?[0];

        self.cmd_pools.lock().insert(cmd_buf, pool);

        Ok(cmd_buf)
    }

    fn destroy_command_buffer(&self, cmd_buf: vk::CommandBuffer) {
        if let Some(pool) = self.cmd_pools.lock().remove(&cmd_buf) {
            unsafe {
                self.device.destroy_command_pool(pool, None);
            }
        }
    }

    fn begin_command_buffer(&self, cmd_buf: vk::CommandBuffer) -> Result<(), DriverError> {
        unsafe {
            self.device.begin_command_buffer(
                cmd_buf,
                &vk::CommandBufferBeginInfo::default()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )
        }
        .map_err(driver_error)
    }

    fn end_command_buffer(&self, cmd_buf: vk::CommandBuffer) -> Result<(), DriverError> {
        unsafe { self.device.end_command_buffer(cmd_buf) }.map_err(driver_error)
    }

    #[profiling::function]
    fn cmd_pipeline_barrier(&self, cmd_buf: vk::CommandBuffer, dependency: &Dependency) {
        let memory_barriers = dependency
            .memory_barriers
            .iter()
            .map(|barrier| {
                vk::MemoryBarrier2::default()
                    .src_stage_mask(barrier.src_stages)
                    .src_access_mask(barrier.src_access)
                    .dst_stage_mask(barrier.dst_stages)
                    .dst_access_mask(barrier.dst_access)
            })
            .collect::<Vec<_>>();
        let buffer_barriers = dependency
            .buffer_barriers
            .iter()
            .map(|barrier| {
                vk::BufferMemoryBarrier2::default()
                    .src_stage_mask(barrier.src_stages)
                    .src_access_mask(barrier.src_access)
                    .dst_stage_mask(barrier.dst_stages)
                    .dst_access_mask(barrier.dst_access)
                    .src_queue_family_index(barrier.src_queue_family)
                    .dst_queue_family_index(barrier.dst_queue_family)
                    .buffer(barrier.buffer)
                    .offset(barrier.offset)
                    .size(barrier.size)
            })
            .collect::<Vec<_>>();
        let image_barriers = dependency
            .image_barriers
            .iter()
            .map(|barrier| {
                vk::ImageMemoryBarrier2::default()
                    .src_stage_mask(barrier.src_stages)
                    .src_access_mask(barrier.src_access)
                    .dst_stage_mask(barrier.dst_stages)
                    .dst_access_mask(barrier.dst_access)
                    .old_layout(barrier.old_layout)
                    .new_layout(barrier.new_layout)
                    .src_queue_family_index(barrier.src_queue_family)
                    .dst_queue_family_index(barrier.dst_queue_family)
                    .image(barrier.image)
                    .subresource_range(barrier.slice.into())
            })
            .collect::<Vec<_>>();

        unsafe {
            self.device.cmd_pipeline_barrier2(
                cmd_buf,
                &vk::DependencyInfo::default()
                    .memory_barriers(&memory_barriers)
                    .buffer_memory_barriers(&buffer_barriers)
                    .image_memory_barriers(&image_barriers),
            );
        }
    }

    fn cmd_begin_rendering(&self, cmd_buf: vk::CommandBuffer, info: &RenderingInfo) {
        let color_attachments = info
            .color_attachments
            .iter()
            .map(rendering_attachment)
            .collect::<Vec<_>>();
        let depth_attachment = info.depth_attachment.as_ref().map(rendering_attachment);
        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(info.render_area)
            .layer_count(1)
            .color_attachments(&color_attachments);

        if let Some(depth_attachment) = &depth_attachment {
            rendering_info = rendering_info.depth_attachment(depth_attachment);
        }

        let area = info.render_area;

        unsafe {
            self.device.cmd_begin_rendering(cmd_buf, &rendering_info);

            // Viewport and scissor are dynamic in every pipeline and always cover the render area
            self.device.cmd_set_viewport(
                cmd_buf,
                0,
                &[vk::Viewport {
                    x: area.offset.x as _,
                    y: area.offset.y as _,
                    width: area.extent.width as _,
                    height: area.extent.height as _,
                    min_depth: 0.0,
                    max_depth: 1.0,
                }],
            );
            self.device.cmd_set_scissor(cmd_buf, 0, &[area]);
        }
    }

    fn cmd_end_rendering(&self, cmd_buf: vk::CommandBuffer) {
        unsafe {
            self.device.cmd_end_rendering(cmd_buf);
        }
    }

    fn cmd_bind_pipeline(
        &self,
        cmd_buf: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        unsafe {
            self.device.cmd_bind_pipeline(cmd_buf, bind_point, pipeline);
        }
    }

    fn cmd_bind_descriptor_sets(
        &self,
        cmd_buf: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        unsafe {
            self.device
                .cmd_bind_descriptor_sets(cmd_buf, bind_point, layout, first_set, sets, &[]);
        }
    }

    fn cmd_bind_vertex_buffer(
        &self,
        cmd_buf: vk::CommandBuffer,
        binding: u32,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
    ) {
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(cmd_buf, binding, &[buffer], &[offset]);
        }
    }

    fn cmd_bind_index_buffer(
        &self,
        cmd_buf: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_ty: vk::IndexType,
    ) {
        unsafe {
            self.device
                .cmd_bind_index_buffer(cmd_buf, buffer, offset, index_ty);
        }
    }

    fn cmd_draw(
        &self,
        cmd_buf: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw(
                cmd_buf,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            );
        }
    }

    fn cmd_draw_indexed(
        &self,
        cmd_buf: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw_indexed(
                cmd_buf,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
    }

    fn cmd_dispatch(&self, cmd_buf: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        unsafe {
            self.device.cmd_dispatch(cmd_buf, x, y, z);
        }
    }

    fn cmd_blit_image(
        &self,
        cmd_buf: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    ) {
        unsafe {
            self.device
                .cmd_blit_image(cmd_buf, src, src_layout, dst, dst_layout, regions, filter);
        }
    }

    fn cmd_copy_buffer(
        &self,
        cmd_buf: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        unsafe {
            self.device.cmd_copy_buffer(cmd_buf, src, dst, regions);
        }
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd_buf: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device
                .cmd_copy_buffer_to_image(cmd_buf, src, dst, dst_layout, regions);
        }
    }

    fn cmd_copy_image(
        &self,
        cmd_buf: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    ) {
        unsafe {
            self.device
                .cmd_copy_image(cmd_buf, src, src_layout, dst, dst_layout, regions);
        }
    }

    fn create_timeline_semaphore(&self, initial_value: u64) -> Result<vk::Semaphore, DriverError> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);

        unsafe {
            self.device.create_semaphore(
                &vk::SemaphoreCreateInfo::default().push_next(&mut type_info),
                None,
            )
        }
        .map_err(driver_error)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe {
            self.device.destroy_semaphore(semaphore, None);
        }
    }

    fn semaphore_value(&self, semaphore: vk::Semaphore) -> Result<u64, DriverError> {
        unsafe { self.device.get_semaphore_counter_value(semaphore) }.map_err(driver_error)
    }

    #[profiling::function]
    fn wait_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> Result<(), DriverError> {
        let semaphores = [semaphore];
        let values = [value];

        unsafe {
            self.device.wait_semaphores(
                &vk::SemaphoreWaitInfo::default()
                    .semaphores(&semaphores)
                    .values(&values),
                u64::MAX,
            )
        }
        .map_err(driver_error)
    }

    #[profiling::function]
    fn queue_submit(&self, queue: QueueId, submission: &Submission) -> Result<(), DriverError> {
        trace!(
            "submit {queue:?}: {} command buffers, {} waits",
            submission.command_buffers.len(),
            submission.waits.len()
        );

        let waits = submission
            .waits
            .iter()
            .map(|wait| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(wait.semaphore)
                    .value(wait.value)
                    .stage_mask(wait.stages)
            })
            .collect::<Vec<_>>();
        let command_buffers = submission
            .command_buffers
            .iter()
            .map(|&cmd_buf| vk::CommandBufferSubmitInfo::default().command_buffer(cmd_buf))
            .collect::<Vec<_>>();
        let signals = [vk::SemaphoreSubmitInfo::default()
            .semaphore(submission.signal_semaphore)
            .value(submission.signal_value)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];

        // Queues are externally synchronized by the execution queue which owns them
        unsafe {
            let vk_queue = self
                .device
                .get_device_queue(queue.family_index, queue.queue_index);

            self.device.queue_submit2(
                vk_queue,
                &[vk::SubmitInfo2::default()
                    .wait_semaphore_infos(&waits)
                    .command_buffer_infos(&command_buffers)
                    .signal_semaphore_infos(&signals)],
                vk::Fence::null(),
            )
        }
        .map_err(driver_error)
    }

    #[profiling::function]
    fn create_image(&self, info: &ImageInfo) -> Result<vk::Image, DriverError> {
        let image = unsafe {
            self.device.create_image(
                &vk::ImageCreateInfo::default()
                    .flags(info.flags)
                    .image_type(info.ty)
                    .format(info.fmt)
                    .extent(vk::Extent3D {
                        width: info.width,
                        height: info.height,
                        depth: info.depth,
                    })
                    .mip_levels(info.mip_level_count)
                    .array_layers(info.array_layer_count)
                    .samples(info.sample_count.into())
                    .tiling(info.tiling)
                    .usage(info.usage)
                    .sharing_mode(vk::SharingMode::EXCLUSIVE)
                    .initial_layout(vk::ImageLayout::UNDEFINED),
                None,
            )
        }
        .map_err(driver_error)?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let allocation = self
            .allocate(
                "image",
                requirements,
                MemoryLocation::GpuOnly,
                info.tiling == vk::ImageTiling::LINEAR,
            )
            .inspect_err(|_| unsafe {
                self.device.destroy_image(image, None);
            })?;

        if let Err(err) = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        } {
            self.free(allocation);

            unsafe {
                self.device.destroy_image(image, None);
            }

            return Err(driver_error(err));
        }

        self.images.lock().insert(image, allocation);

        Ok(image)
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe {
            self.device.destroy_image(image, None);
        }

        if let Some(allocation) = self.images.lock().remove(&image) {
            self.free(allocation);
        }
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        info: &ImageViewInfo,
    ) -> Result<vk::ImageView, DriverError> {
        unsafe {
            self.device.create_image_view(
                &vk::ImageViewCreateInfo::default()
                    .image(image)
                    .view_type(info.ty)
                    .format(info.fmt)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: info.aspect_mask,
                        base_mip_level: info.base_mip_level,
                        level_count: info.mip_level_count,
                        base_array_layer: info.base_array_layer,
                        layer_count: info.array_layer_count,
                    }),
                None,
            )
        }
        .map_err(driver_error)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe {
            self.device.destroy_image_view(view, None);
        }
    }

    #[profiling::function]
    fn create_buffer(&self, info: &BufferInfo) -> Result<vk::Buffer, DriverError> {
        let buffer = unsafe {
            self.device.create_buffer(
                &vk::BufferCreateInfo::default()
                    .size(info.size)
                    .usage(info.usage)
                    .sharing_mode(vk::SharingMode::EXCLUSIVE),
                None,
            )
        }
        .map_err(driver_error)?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let location = if info.mappable {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuOnly
        };
        let allocation = self
            .allocate("buffer", requirements, location, true)
            .inspect_err(|_| unsafe {
                self.device.destroy_buffer(buffer, None);
            })?;

        if let Err(err) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            self.free(allocation);

            unsafe {
                self.device.destroy_buffer(buffer, None);
            }

            return Err(driver_error(err));
        }

        self.buffers.lock().insert(buffer, allocation);

        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe {
            self.device.destroy_buffer(buffer, None);
        }

        if let Some(allocation) = self.buffers.lock().remove(&buffer) {
            self.free(allocation);
        }
    }

    fn write_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> Result<(), DriverError> {
        let mut buffers = self.buffers.lock();
        let mapped = buffers
            .get_mut(&buffer)
            .and_then(Allocation::mapped_slice_mut)
            .ok_or(DriverError::InvalidData)?;
        let start = offset as usize;

        mapped
            .get_mut(start..start + data.len())
            .ok_or(DriverError::InvalidData)?
            .copy_from_slice(data);

        Ok(())
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<vk::Sampler, DriverError> {
        unsafe {
            self.device.create_sampler(
                &vk::SamplerCreateInfo::default()
                    .mag_filter(desc.texel_filter)
                    .min_filter(desc.texel_filter)
                    .mipmap_mode(desc.mipmap_mode)
                    .address_mode_u(desc.address_modes)
                    .address_mode_v(desc.address_modes)
                    .address_mode_w(desc.address_modes)
                    .max_lod(vk::LOD_CLAMP_NONE),
                None,
            )
        }
        .map_err(driver_error)
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe {
            self.device.destroy_sampler(sampler, None);
        }
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorSetLayoutBinding],
    ) -> Result<vk::DescriptorSetLayout, DriverError> {
        let bindings = bindings
            .iter()
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding.binding)
                    .descriptor_type(binding.ty)
                    .descriptor_count(binding.count)
                    .stage_flags(binding.stages)
            })
            .collect::<Vec<_>>();

        unsafe {
            self.device.create_descriptor_set_layout(
                &vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings),
                None,
            )
        }
        .map_err(driver_error)
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe {
            self.device.destroy_descriptor_set_layout(layout, None);
        }
    }

    fn allocate_descriptor_set(
        &self,
        layout: vk::DescriptorSetLayout,
        bindings: &[DescriptorSetLayoutBinding],
    ) -> Result<vk::DescriptorSet, DriverError> {
        let mut pool_sizes = Vec::<vk::DescriptorPoolSize>::with_capacity(bindings.len());

        for binding in bindings {
            match pool_sizes.iter_mut().find(|size| size.ty == binding.ty) {
                Some(size) => size.descriptor_count += binding.count,
                None => pool_sizes.push(vk::DescriptorPoolSize {
                    ty: binding.ty,
                    descriptor_count: binding.count,
                }),
            }
        }

        // Pools may not be empty
        if pool_sizes.is_empty() {
            pool_sizes.push(vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLER,
                descriptor_count: 1,
            });
        }

        let pool = unsafe {
            self.device.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::default()
                    .max_sets(1)
                    .pool_sizes(&pool_sizes),
                None,
            )
        }
        .map_err(driver_error)?;
        let layouts = [layout];
        let set = unsafe {
            self.device.allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::default()
                    .descriptor_pool(pool)
                    .set_layouts(&layouts),
            )
        }
        .map_err(|err| {
            unsafe {
                self.device.destroy_descriptor_pool(pool, None);
            }

            driver_error(err)
        })?[0];

        self.descriptor_pools.lock().insert(set, pool);

        Ok(set)
    }

    fn free_descriptor_set(&self, set: vk::DescriptorSet) {
        if let Some(pool) = self.descriptor_pools.lock().remove(&set) {
            unsafe {
                self.device.destroy_descriptor_pool(pool, None);
            }
        }
    }

    #[profiling::function]
    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        let mut buffer_infos = Vec::with_capacity(writes.len());
        let mut image_infos = Vec::with_capacity(writes.len());

        for write in writes {
            match write.resource {
                DescriptorResource::Buffer {
                    buffer,
                    offset,
                    range,
                } => buffer_infos.push([vk::DescriptorBufferInfo {
                    buffer,
                    offset,
                    range,
                }]),
                DescriptorResource::Image { view, layout } => {
                    image_infos.push([vk::DescriptorImageInfo {
                        sampler: vk::Sampler::null(),
                        image_view: view,
                        image_layout: layout,
                    }])
                }
                DescriptorResource::CombinedImageSampler {
                    view,
                    layout,
                    sampler,
                } => image_infos.push([vk::DescriptorImageInfo {
                    sampler,
                    image_view: view,
                    image_layout: layout,
                }]),
                DescriptorResource::Sampler(sampler) => {
                    image_infos.push([vk::DescriptorImageInfo {
                        sampler,
                        ..Default::default()
                    }])
                }
            }
        }

        let mut buffer_infos = buffer_infos.iter();
        let mut image_infos = image_infos.iter();
        let writes = writes
            .iter()
            .filter_map(|write| {
                let res = vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(write.binding)
                    .dst_array_element(write.array_element)
                    .descriptor_type(write.ty);

                Some(match write.resource {
                    DescriptorResource::Buffer { .. } => res.buffer_info(buffer_infos.next()?),
                    _ => res.image_info(image_infos.next()?),
                })
            })
            .collect::<Vec<_>>();

        unsafe {
            self.device.update_descriptor_sets(&writes, &[]);
        }
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> Result<vk::PipelineLayout, DriverError> {
        unsafe {
            self.device.create_pipeline_layout(
                &vk::PipelineLayoutCreateInfo::default().set_layouts(set_layouts),
                None,
            )
        }
        .map_err(driver_error)
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe {
            self.device.destroy_pipeline_layout(layout, None);
        }
    }

    #[profiling::function]
    fn create_graphic_pipeline(
        &self,
        desc: &GraphicPipelineDesc,
    ) -> Result<vk::Pipeline, DriverError> {
        let mut modules = Vec::with_capacity(desc.shaders.len());

        for shader in &desc.shaders {
            match self.create_shader_module(shader) {
                Ok(module) => modules.push(module),
                Err(err) => {
                    self.destroy_shader_modules(&modules);

                    return Err(err);
                }
            }
        }

        let stages = desc
            .shaders
            .iter()
            .zip(&modules)
            .map(|(shader, &module)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(shader.stage)
                    .module(module)
                    .name(ENTRY_POINT)
            })
            .collect::<Vec<_>>();
        let state = &desc.state;
        let vertex_bindings = state
            .vertex_input
            .bindings
            .iter()
            .copied()
            .map(Into::into)
            .collect::<Vec<vk::VertexInputBindingDescription>>();
        let vertex_attributes = state
            .vertex_input
            .attributes
            .iter()
            .copied()
            .map(Into::into)
            .collect::<Vec<vk::VertexInputAttributeDescription>>();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(&vertex_attributes);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(state.raster.topology);
        let viewport = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let mut rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(state.raster.polygon_mode)
            .cull_mode(state.raster.cull_mode)
            .front_face(state.raster.front_face)
            .line_width(1.0);

        if let Some(bias) = state.raster.depth_bias {
            rasterization = rasterization
                .depth_bias_enable(true)
                .depth_bias_constant_factor(bias.constant_factor.into_inner())
                .depth_bias_slope_factor(bias.slope_factor.into_inner());
        }

        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(state.raster.samples.into());
        let depth_stencil = state.depth.map(vk::PipelineDepthStencilStateCreateInfo::from);
        let blend_attachments = state
            .color_formats
            .iter()
            .map(|_| state.blend.into())
            .collect::<Vec<vk::PipelineColorBlendAttachmentState>>();
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);
        let depth_format = state.depth_format.unwrap_or(vk::Format::UNDEFINED);
        let stencil_format = if format_aspect_mask(depth_format).contains(vk::ImageAspectFlags::STENCIL)
        {
            depth_format
        } else {
            vk::Format::UNDEFINED
        };
        let mut rendering = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&state.color_formats)
            .depth_attachment_format(depth_format)
            .stencil_attachment_format(stencil_format);
        let mut info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(desc.layout)
            .push_next(&mut rendering);

        if let Some(depth_stencil) = &depth_stencil {
            info = info.depth_stencil_state(depth_stencil);
        }

        let res = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
        };

        self.destroy_shader_modules(&modules);

        res.map(|pipelines| pipelines[0])
            .map_err(|(_, err)| driver_error(err))
    }

    #[profiling::function]
    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc,
    ) -> Result<vk::Pipeline, DriverError> {
        let module = self.create_shader_module(&desc.shader)?;
        let info = vk::ComputePipelineCreateInfo::default()
            .stage(
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(vk::ShaderStageFlags::COMPUTE)
                    .module(module)
                    .name(ENTRY_POINT),
            )
            .layout(desc.layout);
        let res = unsafe {
            self.device
                .create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
        };

        self.destroy_shader_modules(&[module]);

        res.map(|pipelines| pipelines[0])
            .map_err(|(_, err)| driver_error(err))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe {
            self.device.destroy_pipeline(pipeline, None);
        }
    }
}
