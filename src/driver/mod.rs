//! Low-level driver seam and the resource types tracked by the synchronization engine.
//!
//! Everything above this module talks to the GPU through the object-safe [`Driver`] trait using
//! plain [`vk`] handles. The [`vulkan`] backend (feature `vulkan`) implements it over an
//! application-provided _Ash_ device; the [`mock`] backend (feature `mock-driver`) records calls
//! for tests.

pub mod access;
pub mod buffer;
pub mod cmd_buf;
pub mod descriptor_set;
pub mod graphic;
pub mod image;
pub mod sampler;

#[cfg(any(test, feature = "mock-driver"))]
pub mod mock;

#[cfg(feature = "vulkan")]
pub mod vulkan;

pub use {
    self::{
        access::{
            need_barrier, AccessHistory, ImageAccess, ImageSliceAccess, LayoutState,
            LayoutTransition, LayoutTranslation, MemoryAccess, MAX_IMAGE_ACCESS_SLICES,
        },
        buffer::{Buffer, BufferInfo, BufferInfoBuilder},
        cmd_buf::CommandBuffer,
        descriptor_set::DescriptorSet,
        graphic::{
            BlendMode, DepthBias, DepthMode, GraphicState, RasterMode, RasterModeBuilder,
            VertexAttribute, VertexBinding, VertexInputState,
        },
        image::{
            Image, ImageInfo, ImageInfoBuilder, ImageSlice, ImageViewInfo, ImageViewInfoBuilder,
            SampleCount,
        },
        sampler::Sampler,
    },
    ash::{self, vk},
};

use {
    log::error,
    std::{
        error::Error,
        fmt::{Debug, Display, Formatter},
        process::abort,
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
    },
};

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_resource_id() -> u64 {
    NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Logs an unrecoverable driver failure and aborts the process.
///
/// Used where a partially-applied driver operation leaves no safe state to unwind to, such as a
/// rejected queue submission or the second half of a queue family ownership transfer.
#[cold]
pub(crate) fn fatal(err: impl Display) -> ! {
    error!("unrecoverable driver failure: {err}");

    abort()
}

pub const fn format_aspect_mask(fmt: vk::Format) -> vk::ImageAspectFlags {
    match fmt {
        vk::Format::D16_UNORM => vk::ImageAspectFlags::DEPTH,
        vk::Format::X8_D24_UNORM_PACK32 => vk::ImageAspectFlags::DEPTH,
        vk::Format::D32_SFLOAT => vk::ImageAspectFlags::DEPTH,
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        vk::Format::D16_UNORM_S8_UINT => vk::ImageAspectFlags::from_raw(
            vk::ImageAspectFlags::DEPTH.as_raw() | vk::ImageAspectFlags::STENCIL.as_raw(),
        ),
        vk::Format::D24_UNORM_S8_UINT => vk::ImageAspectFlags::from_raw(
            vk::ImageAspectFlags::DEPTH.as_raw() | vk::ImageAspectFlags::STENCIL.as_raw(),
        ),
        vk::Format::D32_SFLOAT_S8_UINT => vk::ImageAspectFlags::from_raw(
            vk::ImageAspectFlags::DEPTH.as_raw() | vk::ImageAspectFlags::STENCIL.as_raw(),
        ),
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Identifies one hardware queue of a device.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct QueueId {
    pub family_index: u32,
    pub queue_index: u32,
}

/// A global memory dependency.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct MemoryBarrier {
    pub src_stages: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stages: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

impl MemoryBarrier {
    /// Orders all previously submitted work before all subsequent work, making every write
    /// available and visible.
    pub const FULL: Self = Self {
        src_stages: vk::PipelineStageFlags2::ALL_COMMANDS,
        src_access: vk::AccessFlags2::from_raw(
            vk::AccessFlags2::MEMORY_READ.as_raw() | vk::AccessFlags2::MEMORY_WRITE.as_raw(),
        ),
        dst_stages: vk::PipelineStageFlags2::ALL_COMMANDS,
        dst_access: vk::AccessFlags2::from_raw(
            vk::AccessFlags2::MEMORY_READ.as_raw() | vk::AccessFlags2::MEMORY_WRITE.as_raw(),
        ),
    };

    pub fn new(prev: MemoryAccess, next: MemoryAccess) -> Self {
        Self {
            src_stages: prev.stages(),
            src_access: prev.write_access,
            dst_stages: next.stages(),
            dst_access: next.accesses(),
        }
    }

    pub fn is_full(&self) -> bool {
        *self == Self::FULL
    }
}

/// A memory dependency, layout transition, or queue family ownership transfer of one image slice.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub slice: ImageSlice,
    pub src_stages: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stages: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
}

impl ImageBarrier {
    /// Returns `true` if this barrier is one half of a queue family ownership transfer.
    pub fn is_queue_transfer(&self) -> bool {
        self.src_queue_family != self.dst_queue_family
    }
}

/// A memory dependency or queue family ownership transfer of a buffer range.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct BufferBarrier {
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub src_stages: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stages: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
}

impl BufferBarrier {
    /// Returns `true` if this barrier is one half of a queue family ownership transfer.
    pub fn is_queue_transfer(&self) -> bool {
        self.src_queue_family != self.dst_queue_family
    }
}

/// The contents of one pipeline barrier command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Dependency {
    pub memory_barriers: Vec<MemoryBarrier>,
    pub buffer_barriers: Vec<BufferBarrier>,
    pub image_barriers: Vec<ImageBarrier>,
}

impl Dependency {
    pub fn is_empty(&self) -> bool {
        self.memory_barriers.is_empty()
            && self.buffer_barriers.is_empty()
            && self.image_barriers.is_empty()
    }

    pub fn append(&mut self, other: &mut Self) {
        self.memory_barriers.append(&mut other.memory_barriers);
        self.buffer_barriers.append(&mut other.buffer_barriers);
        self.image_barriers.append(&mut other.image_barriers);
    }

    pub fn clear(&mut self) {
        self.memory_barriers.clear();
        self.buffer_barriers.clear();
        self.image_barriers.clear();
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil(f32, u32),
}

#[derive(Clone, Copy, Debug)]
pub struct RenderingAttachment {
    pub view: vk::ImageView,
    pub layout: vk::ImageLayout,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub clear_value: Option<ClearValue>,
}

/// Begins a dynamic rendering instance.
#[derive(Clone, Debug)]
pub struct RenderingInfo {
    pub render_area: vk::Rect2D,
    pub color_attachments: Vec<RenderingAttachment>,
    pub depth_attachment: Option<RenderingAttachment>,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SemaphoreWait {
    pub semaphore: vk::Semaphore,
    pub value: u64,
    pub stages: vk::PipelineStageFlags2,
}

/// One atomic batch of work for a queue, signalling a timeline semaphore when complete.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Submission {
    pub waits: Vec<SemaphoreWait>,
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub signal_semaphore: vk::Semaphore,
    pub signal_value: u64,
}

#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SamplerDesc {
    pub texel_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_modes: vk::SamplerAddressMode,
}

impl SamplerDesc {
    pub const LINEAR_REPEAT: Self = Self {
        texel_filter: vk::Filter::LINEAR,
        mipmap_mode: vk::SamplerMipmapMode::LINEAR,
        address_modes: vk::SamplerAddressMode::REPEAT,
    };

    pub const NEAREST_CLAMP: Self = Self {
        texel_filter: vk::Filter::NEAREST,
        mipmap_mode: vk::SamplerMipmapMode::NEAREST,
        address_modes: vk::SamplerAddressMode::CLAMP_TO_EDGE,
    };
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct DescriptorSetLayoutBinding {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum DescriptorResource {
    Buffer {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    },
    Image {
        view: vk::ImageView,
        layout: vk::ImageLayout,
    },
    CombinedImageSampler {
        view: vk::ImageView,
        layout: vk::ImageLayout,
        sampler: vk::Sampler,
    },
    Sampler(vk::Sampler),
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub array_element: u32,
    pub ty: vk::DescriptorType,
    pub resource: DescriptorResource,
}

/// SPIR-V code for one pipeline stage; the entry point is always `main`.
#[derive(Clone, Debug)]
pub struct ShaderCode {
    pub stage: vk::ShaderStageFlags,
    pub spirv: Arc<[u32]>,
}

#[derive(Clone, Debug)]
pub struct GraphicPipelineDesc {
    pub layout: vk::PipelineLayout,
    pub shaders: Vec<ShaderCode>,
    pub state: GraphicState,
}

#[derive(Clone, Debug)]
pub struct ComputePipelineDesc {
    pub layout: vk::PipelineLayout,
    pub shader: ShaderCode,
}

/// The operations this crate requires from a graphics driver.
///
/// Recording functions (`cmd_*`) cannot fail; every other fallible operation reports a
/// [`DriverError`]. Implementations must be safe to call from multiple threads, although a single
/// command buffer is only ever recorded by one thread at a time.
pub trait Driver: Debug + Send + Sync {
    fn min_uniform_buffer_offset_alignment(&self) -> vk::DeviceSize;

    fn create_command_buffer(
        &self,
        queue_family_index: u32,
    ) -> Result<vk::CommandBuffer, DriverError>;

    fn destroy_command_buffer(&self, cmd_buf: vk::CommandBuffer);

    /// Begins one-time recording; any previous contents are discarded.
    fn begin_command_buffer(&self, cmd_buf: vk::CommandBuffer) -> Result<(), DriverError>;

    fn end_command_buffer(&self, cmd_buf: vk::CommandBuffer) -> Result<(), DriverError>;

    fn cmd_pipeline_barrier(&self, cmd_buf: vk::CommandBuffer, dependency: &Dependency);

    fn cmd_begin_rendering(&self, cmd_buf: vk::CommandBuffer, info: &RenderingInfo);

    fn cmd_end_rendering(&self, cmd_buf: vk::CommandBuffer);

    fn cmd_bind_pipeline(
        &self,
        cmd_buf: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    );

    fn cmd_bind_descriptor_sets(
        &self,
        cmd_buf: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    );

    fn cmd_bind_vertex_buffer(
        &self,
        cmd_buf: vk::CommandBuffer,
        binding: u32,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
    );

    fn cmd_bind_index_buffer(
        &self,
        cmd_buf: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_ty: vk::IndexType,
    );

    fn cmd_draw(
        &self,
        cmd_buf: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );

    fn cmd_draw_indexed(
        &self,
        cmd_buf: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );

    fn cmd_dispatch(&self, cmd_buf: vk::CommandBuffer, x: u32, y: u32, z: u32);

    #[allow(clippy::too_many_arguments)]
    fn cmd_blit_image(
        &self,
        cmd_buf: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    );

    fn cmd_copy_buffer(
        &self,
        cmd_buf: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );

    fn cmd_copy_buffer_to_image(
        &self,
        cmd_buf: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );

    fn cmd_copy_image(
        &self,
        cmd_buf: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    );

    fn create_timeline_semaphore(&self, initial_value: u64) -> Result<vk::Semaphore, DriverError>;

    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    fn semaphore_value(&self, semaphore: vk::Semaphore) -> Result<u64, DriverError>;

    /// Blocks the calling thread until `semaphore` reaches `value`.
    fn wait_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> Result<(), DriverError>;

    fn queue_submit(&self, queue: QueueId, submission: &Submission) -> Result<(), DriverError>;

    fn create_image(&self, info: &ImageInfo) -> Result<vk::Image, DriverError>;

    fn destroy_image(&self, image: vk::Image);

    fn create_image_view(
        &self,
        image: vk::Image,
        info: &ImageViewInfo,
    ) -> Result<vk::ImageView, DriverError>;

    fn destroy_image_view(&self, view: vk::ImageView);

    fn create_buffer(&self, info: &BufferInfo) -> Result<vk::Buffer, DriverError>;

    fn destroy_buffer(&self, buffer: vk::Buffer);

    /// Copies `data` into a mappable buffer.
    fn write_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> Result<(), DriverError>;

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<vk::Sampler, DriverError>;

    fn destroy_sampler(&self, sampler: vk::Sampler);

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorSetLayoutBinding],
    ) -> Result<vk::DescriptorSetLayout, DriverError>;

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);

    fn allocate_descriptor_set(
        &self,
        layout: vk::DescriptorSetLayout,
        bindings: &[DescriptorSetLayoutBinding],
    ) -> Result<vk::DescriptorSet, DriverError>;

    fn free_descriptor_set(&self, set: vk::DescriptorSet);

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]);

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> Result<vk::PipelineLayout, DriverError>;

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);

    fn create_graphic_pipeline(
        &self,
        desc: &GraphicPipelineDesc,
    ) -> Result<vk::Pipeline, DriverError>;

    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc,
    ) -> Result<vk::Pipeline, DriverError>;

    fn destroy_pipeline(&self, pipeline: vk::Pipeline);
}

// TODO: Carry the underlying vk::Result so callers can tell device loss from exhaustion
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum DriverError {
    InvalidData,
    Unsupported,
    OutOfMemory,
}

impl Display for DriverError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Error for DriverError {}
