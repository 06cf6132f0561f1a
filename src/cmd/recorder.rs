use {
    super::{queue::QueueInner, uniform::UniformSession, ExecutionQueue},
    crate::{
        driver::{
            fatal, need_barrier, next_resource_id, AccessHistory, Buffer, BufferBarrier, ClearValue, CommandBuffer,
            Dependency, Driver, Image, ImageAccess, ImageBarrier, ImageSlice, ImageViewInfo,
            LayoutState, MemoryAccess, MemoryBarrier, RenderingAttachment, RenderingInfo,
        },
        pool::Lease,
    },
    arrayvec::ArrayVec,
    ash::vk,
    log::{error, trace},
    std::{any::Any, collections::HashMap, sync::Arc, thread::panicking},
};

pub(crate) type KeepAlive = Box<dyn Any + Send>;

/// How an attachment is initialized when a render pass begins.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AttachmentLoad {
    Clear(ClearValue),
    DontCare,
    Load,
}

/// One image rendered to by a [`RenderPass`].
#[derive(Clone, Debug)]
pub struct Attachment {
    pub image: Arc<Image>,
    pub load: AttachmentLoad,

    /// When `false` the contents are discarded after the render pass.
    pub store: bool,

    /// The view rendered to; a single mip level.
    pub view_info: ImageViewInfo,
}

impl Attachment {
    /// Renders to the first mip level of every layer of `image`, preserving its contents.
    pub fn new(image: &Arc<Image>) -> Self {
        let mut view_info = image.info.default_view_info();
        view_info.mip_level_count = 1;

        Self {
            image: Arc::clone(image),
            load: AttachmentLoad::Load,
            store: true,
            view_info,
        }
    }

    pub fn clear(image: &Arc<Image>, value: ClearValue) -> Self {
        Self {
            load: AttachmentLoad::Clear(value),
            ..Self::new(image)
        }
    }

    pub fn with_load(mut self, load: AttachmentLoad) -> Self {
        self.load = load;
        self
    }

    pub fn with_store(mut self, store: bool) -> Self {
        self.store = store;
        self
    }

    pub fn with_view_info(mut self, view_info: ImageViewInfo) -> Self {
        self.view_info = view_info;
        self
    }

    fn is_depth_stencil(&self) -> bool {
        self.view_info
            .aspect_mask
            .intersects(vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL)
    }

    fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: (self.image.info.width >> self.view_info.base_mip_level).max(1),
            height: (self.image.info.height >> self.view_info.base_mip_level).max(1),
        }
    }
}

/// Attachments of one dynamic rendering instance.
#[derive(Clone, Debug, Default)]
pub struct RenderPass {
    pub color_attachments: Vec<Attachment>,
    pub depth_attachment: Option<Attachment>,

    /// Defaults to the extent of the first attachment.
    pub render_area: Option<vk::Rect2D>,
}

impl RenderPass {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_color(mut self, attachment: Attachment) -> Self {
        self.color_attachments.push(attachment);
        self
    }

    pub fn with_depth(mut self, attachment: Attachment) -> Self {
        self.depth_attachment = Some(attachment);
        self
    }

    pub fn with_render_area(mut self, render_area: vk::Rect2D) -> Self {
        self.render_area = Some(render_area);
        self
    }
}

pub(super) struct ImageTrack {
    pub all_access: MemoryAccess,
    pub history: AccessHistory,
    pub image: Arc<Image>,

    /// The layout state this recorder expects when its first command runs.
    pub initial: Option<LayoutState>,

    /// The layout state after the last recorded command.
    pub state: Option<LayoutState>,

    render_pass: Option<u64>,
}

pub(super) struct BufferTrack {
    pub all_access: MemoryAccess,
    pub buffer: Arc<Buffer>,

    /// Accesses since the last barrier.
    pub last: MemoryAccess,

    render_pass: Option<u64>,
}

/// Everything a finalized recorder hands to its queue.
pub(super) struct RecordedWork {
    pub buffers: Vec<BufferTrack>,
    pub images: Vec<ImageTrack>,
    pub keep_alive: Vec<KeepAlive>,
    pub segments: Vec<Lease<CommandBuffer>>,
}

impl RecordedWork {
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty() && self.images.is_empty() && self.buffers.is_empty()
    }

    pub fn into_resources(self) -> impl Iterator<Item = KeepAlive> {
        self.segments
            .into_iter()
            .map(|segment| Box::new(segment) as KeepAlive)
            .chain(
                self.images
                    .into_iter()
                    .map(|track| Box::new(track.image) as KeepAlive),
            )
            .chain(
                self.buffers
                    .into_iter()
                    .map(|track| Box::new(track.buffer) as KeepAlive),
            )
            .chain(self.keep_alive)
    }
}

/// Records the work of one submission.
///
/// Commands are recorded into an ordered list of command buffers ("segments"). Each declared
/// resource access is checked against the previous accesses of this recorder and any required
/// barrier is recorded before the command which needs it. Inside a render pass those barriers go
/// into the segment preceding the render pass instead.
///
/// Differences between the state a recorder expects and the state left behind by earlier
/// submissions are reconciled by the queue when the recorder is submitted.
pub struct CommandRecorder {
    buffer_ids: HashMap<u64, usize>,
    buffers: Vec<BufferTrack>,
    finalized: bool,
    id: u64,
    image_ids: HashMap<u64, usize>,
    images: Vec<ImageTrack>,
    keep_alive: Vec<KeepAlive>,
    open: bool,
    queue: ExecutionQueue,
    render_pass: Option<u64>,
    render_pass_count: u64,
    segments: Vec<Lease<CommandBuffer>>,
    session: Option<UniformSession>,
    submitted: bool,
}

impl CommandRecorder {
    pub(super) fn new(queue: ExecutionQueue) -> Self {
        let session = queue.inner.uniforms.session();

        Self {
            buffer_ids: HashMap::new(),
            buffers: vec![],
            finalized: false,
            id: next_resource_id(),
            image_ids: HashMap::new(),
            images: vec![],
            keep_alive: vec![],
            open: false,
            queue,
            render_pass: None,
            render_pass_count: 0,
            segments: vec![],
            session: Some(session),
            submitted: false,
        }
    }

    /// Identifies this recorder among every recorder of the process.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn queue(&self) -> &ExecutionQueue {
        &self.queue
    }

    pub(crate) fn driver(&self) -> &Arc<dyn Driver> {
        &self.queue.inner.driver
    }

    pub fn is_in_render_pass(&self) -> bool {
        self.render_pass.is_some()
    }

    pub(super) fn is_recorded_for(&self, queue: &Arc<QueueInner>) -> bool {
        Arc::ptr_eq(&self.queue.inner, queue)
    }

    pub(super) fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// The uniform allocation session of this recorder.
    pub fn uniform_session(&mut self) -> &mut UniformSession {
        assert!(!self.finalized, "command recorder already finalized");

        let queue = &self.queue;

        self.session
            .get_or_insert_with(|| queue.inner.uniforms.session())
    }

    /// Keeps `thing` alive until the GPU has finished the submission of this recorder.
    pub fn keep_alive(&mut self, thing: impl Any + Send) {
        self.keep_alive.push(Box::new(thing));
    }

    /// The open segment, beginning a new one if needed.
    fn get_or_create_buffer(&mut self) -> vk::CommandBuffer {
        if self.open {
            if let Some(segment) = self.segments.last() {
                return ***segment;
            }
        }

        let cmd_buf = self.queue.inner.lease_command_buffer();
        let res = **cmd_buf;

        trace!("segment {}: {:?}", self.segments.len(), res);

        self.segments.push(cmd_buf);
        self.open = true;

        res
    }

    /// The segment barriers are recorded into.
    ///
    /// Inside a render pass this is the segment before the render pass, which is always the last
    /// segment.
    fn preparation_buffer(&mut self) -> vk::CommandBuffer {
        if self.render_pass.is_none() {
            return self.get_or_create_buffer();
        }

        let len = self.segments.len();

        if len < 2 {
            let cmd_buf = self.queue.inner.lease_command_buffer();
            let res = **cmd_buf;

            trace!("preparation segment: {:?}", res);

            self.segments.insert(0, cmd_buf);

            return res;
        }

        **self.segments[len - 2]
    }

    fn record_barrier(&mut self, dependency: &Dependency) {
        let cmd_buf = self.preparation_buffer();

        trace!(
            "barrier: {} memory, {} buffer, {} image",
            dependency.memory_barriers.len(),
            dependency.buffer_barriers.len(),
            dependency.image_barriers.len()
        );

        self.driver().cmd_pipeline_barrier(cmd_buf, dependency);
    }

    /// Records `dependency` as-is into the open segment, without any tracking.
    pub(crate) fn pipeline_barrier(&mut self, dependency: &Dependency) {
        let cmd_buf = self.get_or_create_buffer();

        self.driver().cmd_pipeline_barrier(cmd_buf, dependency);
    }

    /// Declares that the next command uses `image` as described by `access`.
    ///
    /// # Panics
    ///
    /// Panics if the access needs two different layout exceptions, if the image is owned by
    /// another queue, or if a barrier is needed inside a render pass which already used the image.
    #[profiling::function]
    pub fn image_access(&mut self, image: &Arc<Image>, access: &ImageAccess) {
        assert!(!self.finalized, "command recorder already finalized");

        let mut resolved = ImageAccess::new();

        for slice in access.iter() {
            resolved.push(slice.slice.resolve(&image.info), slice.layout, slice.access);
        }

        if resolved.is_empty() {
            return;
        }

        let access = resolved;
        let requests = access.layout_requests();
        let next = access.union();
        let generation = self.render_pass;

        let Some(&idx) = self.image_ids.get(&Image::id(image)) else {
            self.track_image(image, &access);

            return;
        };

        let track = &mut self.images[idx];
        let mut dependency = Dependency::default();

        if let Some(state) = track.state.as_mut() {
            for &(slice, layout) in &requests {
                let translation = state.apply(slice, layout);

                for transition in [translation.collapse, translation.transition]
                    .into_iter()
                    .flatten()
                {
                    let prior = track.history.prior(&transition.slice);
                    let (src_stages, src_access) = if prior.is_empty() {
                        // Chains with the reconciliation barrier, which waits for every access
                        (next.stages(), vk::AccessFlags2::NONE)
                    } else {
                        (prior.stages(), prior.write_access)
                    };

                    dependency.image_barriers.push(ImageBarrier {
                        image: ***image,
                        slice: transition.slice,
                        src_stages,
                        src_access,
                        dst_stages: next.stages(),
                        dst_access: next.accesses(),
                        old_layout: transition.old_layout,
                        new_layout: transition.new_layout,
                        src_queue_family: vk::QUEUE_FAMILY_IGNORED,
                        dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
                    });
                    track
                        .history
                        .record_transition(transition.slice, next.stages());
                }
            }

            assert_layouts(state, &access);
        }

        let mut hazard = None;
        let mut resolved = ArrayVec::<bool, { crate::driver::MAX_IMAGE_ACCESS_SLICES }>::new();

        for slice in access.iter() {
            let prior = track.history.hazard(&slice.slice, &slice.access);

            if let Some(prior) = prior {
                *hazard.get_or_insert(MemoryAccess::NONE) |= prior;
            }

            resolved.push(prior.is_some());
        }

        if let Some(prior) = hazard {
            dependency
                .memory_barriers
                .push(MemoryBarrier::new(prior, next));
        }

        for (slice, resolved) in access.iter().zip(resolved) {
            track.history.record(slice.slice, slice.access, resolved);
        }

        track.all_access |= next;

        let used_by_render_pass = generation.is_some() && track.render_pass == generation;

        if generation.is_some() {
            track.render_pass = generation;
        }

        if !dependency.is_empty() {
            assert!(
                !used_by_render_pass,
                "{image:?} needs a barrier inside a render pass which already uses it"
            );

            self.record_barrier(&dependency);
        }
    }

    fn track_image(&mut self, image: &Arc<Image>, access: &ImageAccess) {
        let whole = Image::whole(image);
        let tracked = {
            let state = Image::state(image);

            assert!(
                state.owner.allows(&self.queue.inner),
                "{image:?} is owned by another queue"
            );

            state.layout
        };

        // The first access needs no barrier here; the queue converts whatever state the image is
        // in when this recorder is submitted
        let initial = image.info.automatic_layout.then(|| {
            let mut layout =
                tracked.unwrap_or_else(|| LayoutState::new(whole, image.info.default_layout));

            for (slice, request) in access.layout_requests() {
                layout.apply(slice, request);
            }

            assert_layouts(&layout, access);

            layout
        });

        let mut history = AccessHistory::new(whole);

        for slice in access.iter() {
            history.record(slice.slice, slice.access, false);
        }

        self.image_ids.insert(Image::id(image), self.images.len());
        self.images.push(ImageTrack {
            all_access: access.union(),
            history,
            image: Arc::clone(image),
            initial,
            state: initial,
            render_pass: self.render_pass,
        });
    }

    /// Declares that the next command uses `buffer` with the given `access`.
    #[profiling::function]
    pub fn buffer_access(&mut self, buffer: &Arc<Buffer>, access: MemoryAccess) {
        assert!(!self.finalized, "command recorder already finalized");

        let generation = self.render_pass;

        let Some(&idx) = self.buffer_ids.get(&Buffer::id(buffer)) else {
            assert!(
                Buffer::state(buffer).owner.allows(&self.queue.inner),
                "{buffer:?} is owned by another queue"
            );

            self.buffer_ids.insert(Buffer::id(buffer), self.buffers.len());
            self.buffers.push(BufferTrack {
                all_access: access,
                buffer: Arc::clone(buffer),
                last: access,
                render_pass: generation,
            });

            return;
        };

        let track = &mut self.buffers[idx];
        let used_by_render_pass = generation.is_some() && track.render_pass == generation;

        if generation.is_some() {
            track.render_pass = generation;
        }

        track.all_access |= access;

        if track.last.is_empty() || !need_barrier(&track.last, &access) {
            track.last |= access;

            return;
        }

        let barrier = BufferBarrier {
            buffer: ***buffer,
            offset: 0,
            size: vk::WHOLE_SIZE,
            src_stages: track.last.stages(),
            src_access: track.last.write_access,
            dst_stages: access.stages(),
            dst_access: access.accesses(),
            src_queue_family: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
        };
        track.last = access;

        assert!(
            !used_by_render_pass,
            "{buffer:?} needs a barrier inside a render pass which already uses it"
        );

        self.record_barrier(&Dependency {
            buffer_barriers: vec![barrier],
            ..Default::default()
        });
    }

    /// Places `slice` of `image` into `layout` for a following use described by `access`.
    pub fn image_barrier(
        &mut self,
        image: &Arc<Image>,
        slice: ImageSlice,
        layout: vk::ImageLayout,
        access: MemoryAccess,
    ) {
        self.image_access(image, &ImageAccess::single(slice, layout, access));
    }

    /// Records a barrier between all previous and all following work of the queue.
    pub fn memory_barrier(&mut self) {
        assert!(
            self.render_pass.is_none(),
            "memory barrier inside a render pass"
        );

        self.pipeline_barrier(&Dependency {
            memory_barriers: vec![MemoryBarrier::FULL],
            ..Default::default()
        });

        for track in &mut self.images {
            track.history.clear();
        }

        for track in &mut self.buffers {
            track.last = MemoryAccess::NONE;
        }
    }

    /// Begins dynamic rendering to the attachments of `render_pass`.
    ///
    /// Barriers required by resources declared before [`Self::end_render_pass`] are recorded
    /// before the render pass begins.
    #[profiling::function]
    pub fn begin_render_pass(&mut self, render_pass: &RenderPass) {
        assert!(self.render_pass.is_none(), "render pass already begun");

        let mut color_attachments = Vec::with_capacity(render_pass.color_attachments.len());
        let mut depth_attachment = None;

        for attachment in render_pass
            .color_attachments
            .iter()
            .chain(render_pass.depth_attachment.iter())
        {
            let is_depth_stencil = attachment.is_depth_stencil();
            let (layout, mut access) = if is_depth_stencil {
                (
                    vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                    MemoryAccess::DEPTH_STENCIL_ATTACHMENT_WRITE,
                )
            } else {
                (
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    MemoryAccess::COLOR_ATTACHMENT_WRITE,
                )
            };

            if attachment.load == AttachmentLoad::Load {
                access |= if is_depth_stencil {
                    MemoryAccess::DEPTH_STENCIL_ATTACHMENT_READ
                } else {
                    MemoryAccess::COLOR_ATTACHMENT_READ
                };
            }

            let layout = attachment.image.info.layout_for(layout);
            let slice = ImageSlice::from(attachment.view_info);

            self.image_access(
                &attachment.image,
                &ImageAccess::single(slice, layout, access),
            );

            let view = Image::view(&attachment.image, attachment.view_info)
                .unwrap_or_else(|err| fatal(err));
            let (load_op, clear_value) = match attachment.load {
                AttachmentLoad::Clear(value) => (vk::AttachmentLoadOp::CLEAR, Some(value)),
                AttachmentLoad::DontCare => (vk::AttachmentLoadOp::DONT_CARE, None),
                AttachmentLoad::Load => (vk::AttachmentLoadOp::LOAD, None),
            };
            let rendering_attachment = RenderingAttachment {
                view,
                layout,
                load_op,
                store_op: if attachment.store {
                    vk::AttachmentStoreOp::STORE
                } else {
                    vk::AttachmentStoreOp::DONT_CARE
                },
                clear_value,
            };

            if is_depth_stencil {
                depth_attachment = Some(rendering_attachment);
            } else {
                color_attachments.push(rendering_attachment);
            }
        }

        let render_area = render_pass.render_area.unwrap_or_else(|| {
            let extent = render_pass
                .color_attachments
                .first()
                .or(render_pass.depth_attachment.as_ref())
                .map(Attachment::extent)
                .unwrap_or_default();

            vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            }
        });

        self.open = false;

        let cmd_buf = self.get_or_create_buffer();

        self.render_pass_count += 1;
        self.render_pass = Some(self.render_pass_count);

        for attachment in render_pass
            .color_attachments
            .iter()
            .chain(render_pass.depth_attachment.iter())
        {
            if let Some(&idx) = self.image_ids.get(&Image::id(&attachment.image)) {
                self.images[idx].render_pass = self.render_pass;
            }
        }

        self.driver().cmd_begin_rendering(
            cmd_buf,
            &RenderingInfo {
                render_area,
                color_attachments,
                depth_attachment,
            },
        );
    }

    pub fn end_render_pass(&mut self) {
        assert!(self.render_pass.is_some(), "no render pass to end");

        let cmd_buf = self.get_or_create_buffer();

        self.driver().cmd_end_rendering(cmd_buf);
        self.render_pass = None;
        self.open = false;
    }

    pub fn bind_pipeline(&mut self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        let cmd_buf = self.get_or_create_buffer();

        self.driver().cmd_bind_pipeline(cmd_buf, bind_point, pipeline);
    }

    pub fn bind_descriptor_sets(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        if sets.is_empty() {
            return;
        }

        let cmd_buf = self.get_or_create_buffer();

        self.driver()
            .cmd_bind_descriptor_sets(cmd_buf, bind_point, layout, first_set, sets);
    }

    pub fn bind_vertex_buffer(
        &mut self,
        binding: u32,
        buffer: &Arc<Buffer>,
        offset: vk::DeviceSize,
    ) {
        self.buffer_access(buffer, MemoryAccess::VERTEX_ATTRIBUTE_READ);

        let cmd_buf = self.get_or_create_buffer();

        self.driver()
            .cmd_bind_vertex_buffer(cmd_buf, binding, ***buffer, offset);
    }

    pub fn bind_index_buffer(
        &mut self,
        buffer: &Arc<Buffer>,
        offset: vk::DeviceSize,
        index_ty: vk::IndexType,
    ) {
        self.buffer_access(buffer, MemoryAccess::INDEX_READ);

        let cmd_buf = self.get_or_create_buffer();

        self.driver()
            .cmd_bind_index_buffer(cmd_buf, ***buffer, offset, index_ty);
    }

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        assert!(self.render_pass.is_some(), "draw outside a render pass");

        let cmd_buf = self.get_or_create_buffer();

        self.driver().cmd_draw(
            cmd_buf,
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        );
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        assert!(self.render_pass.is_some(), "draw outside a render pass");

        let cmd_buf = self.get_or_create_buffer();

        self.driver().cmd_draw_indexed(
            cmd_buf,
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        );
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        assert!(self.render_pass.is_none(), "dispatch inside a render pass");

        let cmd_buf = self.get_or_create_buffer();

        self.driver().cmd_dispatch(cmd_buf, x, y, z);
    }

    /// Copies regions of `src` into `dst`, which may be the same image.
    #[profiling::function]
    pub fn blit_image(
        &mut self,
        src: &Arc<Image>,
        dst: &Arc<Image>,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    ) {
        assert!(self.render_pass.is_none(), "blit inside a render pass");

        let (Some(src_slice), Some(dst_slice)) = (
            bounding_slice(regions.iter().map(|region| region.src_subresource)),
            bounding_slice(regions.iter().map(|region| region.dst_subresource)),
        ) else {
            return;
        };

        let (src_layout, dst_layout) = self.declare_copy(src, src_slice, dst, dst_slice);
        let cmd_buf = self.get_or_create_buffer();

        self.driver().cmd_blit_image(
            cmd_buf, ***src, src_layout, ***dst, dst_layout, regions, filter,
        );
    }

    pub fn copy_buffer(&mut self, src: &Arc<Buffer>, dst: &Arc<Buffer>, regions: &[vk::BufferCopy]) {
        assert!(self.render_pass.is_none(), "copy inside a render pass");

        if regions.is_empty() {
            return;
        }

        if Arc::ptr_eq(src, dst) {
            self.buffer_access(src, MemoryAccess::TRANSFER_READ | MemoryAccess::TRANSFER_WRITE);
        } else {
            self.buffer_access(src, MemoryAccess::TRANSFER_READ);
            self.buffer_access(dst, MemoryAccess::TRANSFER_WRITE);
        }

        let cmd_buf = self.get_or_create_buffer();

        self.driver()
            .cmd_copy_buffer(cmd_buf, ***src, ***dst, regions);
    }

    pub fn copy_buffer_to_image(
        &mut self,
        src: &Arc<Buffer>,
        dst: &Arc<Image>,
        regions: &[vk::BufferImageCopy],
    ) {
        assert!(self.render_pass.is_none(), "copy inside a render pass");

        let Some(dst_slice) = bounding_slice(regions.iter().map(|region| region.image_subresource))
        else {
            return;
        };

        let dst_layout = dst
            .info
            .layout_for(vk::ImageLayout::TRANSFER_DST_OPTIMAL);

        self.buffer_access(src, MemoryAccess::TRANSFER_READ);
        self.image_access(
            dst,
            &ImageAccess::single(dst_slice, dst_layout, MemoryAccess::TRANSFER_WRITE),
        );

        let cmd_buf = self.get_or_create_buffer();

        self.driver()
            .cmd_copy_buffer_to_image(cmd_buf, ***src, ***dst, dst_layout, regions);
    }

    pub fn copy_image(&mut self, src: &Arc<Image>, dst: &Arc<Image>, regions: &[vk::ImageCopy]) {
        assert!(self.render_pass.is_none(), "copy inside a render pass");

        let (Some(src_slice), Some(dst_slice)) = (
            bounding_slice(regions.iter().map(|region| region.src_subresource)),
            bounding_slice(regions.iter().map(|region| region.dst_subresource)),
        ) else {
            return;
        };

        let (src_layout, dst_layout) = self.declare_copy(src, src_slice, dst, dst_slice);
        let cmd_buf = self.get_or_create_buffer();

        self.driver()
            .cmd_copy_image(cmd_buf, ***src, src_layout, ***dst, dst_layout, regions);
    }

    /// Declares the accesses of an image-to-image transfer, returning the layouts to record it
    /// with.
    fn declare_copy(
        &mut self,
        src: &Arc<Image>,
        src_slice: ImageSlice,
        dst: &Arc<Image>,
        dst_slice: ImageSlice,
    ) -> (vk::ImageLayout, vk::ImageLayout) {
        if Arc::ptr_eq(src, dst) {
            let layout = src.info.layout_for(vk::ImageLayout::GENERAL);
            let mut access = ImageAccess::new();
            access.push(src_slice, layout, MemoryAccess::TRANSFER_READ);
            access.push(dst_slice, layout, MemoryAccess::TRANSFER_WRITE);

            self.image_access(src, &access);

            (layout, layout)
        } else {
            let src_layout = src.info.layout_for(vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
            let dst_layout = dst.info.layout_for(vk::ImageLayout::TRANSFER_DST_OPTIMAL);

            self.image_access(
                src,
                &ImageAccess::single(src_slice, src_layout, MemoryAccess::TRANSFER_READ),
            );
            self.image_access(
                dst,
                &ImageAccess::single(dst_slice, dst_layout, MemoryAccess::TRANSFER_WRITE),
            );

            (src_layout, dst_layout)
        }
    }

    /// Ends recording and releases the uniform session.
    ///
    /// Returns `false` if nothing was recorded. Called by [`ExecutionQueue::submit_commands`] when
    /// it has not been called already.
    ///
    /// # Panics
    ///
    /// Panics if called twice or inside a render pass.
    #[profiling::function]
    pub fn finalize(&mut self) -> bool {
        assert!(!self.finalized, "command recorder finalized twice");
        assert!(self.render_pass.is_none(), "render pass was not ended");

        self.finalized = true;
        self.open = false;

        for segment in &self.segments {
            CommandBuffer::end(segment).unwrap_or_else(|err| fatal(err));
        }

        if let Some(session) = self.session.take() {
            self.keep_alive.push(Box::new(session));
        }

        !(self.segments.is_empty() && self.images.is_empty() && self.buffers.is_empty())
    }

    pub(super) fn take_work(&mut self) -> RecordedWork {
        self.submitted = true;
        self.buffer_ids.clear();
        self.image_ids.clear();

        RecordedWork {
            buffers: std::mem::take(&mut self.buffers),
            images: std::mem::take(&mut self.images),
            keep_alive: std::mem::take(&mut self.keep_alive),
            segments: std::mem::take(&mut self.segments),
        }
    }
}

impl Drop for CommandRecorder {
    fn drop(&mut self) {
        if panicking() || self.submitted {
            return;
        }

        error!("command recorder dropped without being submitted");

        if self.render_pass.is_some() {
            self.end_render_pass();
        }

        let queue = self.queue.clone();
        queue.submit(self);
    }
}

/// Panics unless every slice of `access` is in its requested layout.
fn assert_layouts(state: &LayoutState, access: &ImageAccess) {
    for slice in access.iter() {
        assert!(
            state.layout_of(&slice.slice) == Some(slice.layout),
            "image access needs more than one layout exception"
        );
    }
}

fn bounding_slice(
    mut layers: impl Iterator<Item = vk::ImageSubresourceLayers>,
) -> Option<ImageSlice> {
    let slice = |layers: vk::ImageSubresourceLayers| {
        ImageSlice::new(
            layers.aspect_mask,
            layers.mip_level,
            1,
            layers.base_array_layer,
            layers.layer_count,
        )
    };
    let first = slice(layers.next()?);

    Some(layers.fold(first, |res, layers| res.bounding(&slice(layers))))
}
