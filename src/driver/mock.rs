//! A driver which records every call instead of talking to a GPU.
//!
//! Handles are unique counters. Timeline semaphores complete as soon as they are signalled unless
//! the driver is switched into deferred mode, which holds submitted work until
//! [`MockDriver::complete_all`] or a blocking wait.

use {
    super::{
        BufferInfo, ComputePipelineDesc, Dependency, DescriptorSetLayoutBinding,
        DescriptorWrite, Driver, DriverError, GraphicPipelineDesc, ImageInfo, ImageViewInfo,
        QueueId, RenderingInfo, SamplerDesc, Submission,
    },
    ash::vk::{self, Handle},
    log::trace,
    parking_lot::Mutex,
    std::{
        collections::HashMap,
        sync::atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

/// One recorded driver call.
#[derive(Clone, Debug)]
pub enum MockCall {
    BeginCommandBuffer(vk::CommandBuffer),
    EndCommandBuffer(vk::CommandBuffer),
    PipelineBarrier(vk::CommandBuffer, Dependency),
    BeginRendering(vk::CommandBuffer, RenderingInfo),
    EndRendering(vk::CommandBuffer),
    BindPipeline(vk::CommandBuffer, vk::PipelineBindPoint, vk::Pipeline),
    BindDescriptorSets {
        cmd_buf: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: Vec<vk::DescriptorSet>,
    },
    BindVertexBuffer(vk::CommandBuffer, vk::Buffer),
    BindIndexBuffer(vk::CommandBuffer, vk::Buffer),
    Draw(vk::CommandBuffer, u32),
    DrawIndexed(vk::CommandBuffer, u32),
    Dispatch(vk::CommandBuffer, u32, u32, u32),
    BlitImage(vk::CommandBuffer, vk::Image, vk::Image),
    CopyBuffer(vk::CommandBuffer, vk::Buffer, vk::Buffer),
    CopyBufferToImage(vk::CommandBuffer, vk::Buffer, vk::Image),
    CopyImage(vk::CommandBuffer, vk::Image, vk::Image),
    Submit(QueueId, Submission),
    UpdateDescriptorSet(vk::DescriptorSet, Vec<DescriptorWrite>),
    CreateGraphicPipeline(vk::Pipeline, GraphicPipelineDesc),
    CreateComputePipeline(vk::Pipeline, ComputePipelineDesc),
    CreateSampler(vk::Sampler, SamplerDesc),
    CreateDescriptorSetLayout(vk::DescriptorSetLayout, Vec<DescriptorSetLayoutBinding>),
}

impl MockCall {
    pub fn cmd_buf(&self) -> Option<vk::CommandBuffer> {
        Some(match self {
            Self::BeginCommandBuffer(cmd_buf)
            | Self::EndCommandBuffer(cmd_buf)
            | Self::PipelineBarrier(cmd_buf, _)
            | Self::BeginRendering(cmd_buf, _)
            | Self::EndRendering(cmd_buf)
            | Self::BindPipeline(cmd_buf, ..)
            | Self::BindDescriptorSets { cmd_buf, .. }
            | Self::BindVertexBuffer(cmd_buf, _)
            | Self::BindIndexBuffer(cmd_buf, _)
            | Self::Draw(cmd_buf, _)
            | Self::DrawIndexed(cmd_buf, _)
            | Self::Dispatch(cmd_buf, ..)
            | Self::BlitImage(cmd_buf, ..)
            | Self::CopyBuffer(cmd_buf, ..)
            | Self::CopyBufferToImage(cmd_buf, ..)
            | Self::CopyImage(cmd_buf, ..) => *cmd_buf,
            _ => return None,
        })
    }
}

#[derive(Debug, Default)]
pub struct MockDriver {
    buffers: Mutex<HashMap<vk::Buffer, Vec<u8>>>,
    calls: Mutex<Vec<MockCall>>,
    deferred: AtomicBool,
    fail_pipelines: AtomicBool,
    fail_submissions: AtomicBool,
    live_objects: AtomicU64,
    next_handle: AtomicU64,
    pending: Mutex<Vec<(vk::Semaphore, u64)>>,
    semaphores: Mutex<HashMap<vk::Semaphore, u64>>,
}

impl MockDriver {
    fn handle<T: Handle>(&self) -> T {
        T::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn create<T: Handle>(&self) -> T {
        self.live_objects.fetch_add(1, Ordering::Relaxed);
        self.handle()
    }

    fn destroy(&self) {
        self.live_objects.fetch_sub(1, Ordering::Relaxed);
    }

    fn record(&self, call: MockCall) {
        trace!("{call:?}");

        self.calls.lock().push(call);
    }

    /// Returns a copy of every call recorded so far.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Every pipeline barrier recorded so far, in recording order.
    pub fn barriers(&self) -> Vec<Dependency> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                MockCall::PipelineBarrier(_, dependency) => Some(dependency.clone()),
                _ => None,
            })
            .collect()
    }

    /// Every queue submission made so far, in submission order.
    pub fn submissions(&self) -> Vec<(QueueId, Submission)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                MockCall::Submit(queue, submission) => Some((*queue, submission.clone())),
                _ => None,
            })
            .collect()
    }

    /// The calls recorded into `cmd_buf`, excluding begin and end.
    pub fn commands(&self, cmd_buf: vk::CommandBuffer) -> Vec<MockCall> {
        self.calls
            .lock()
            .iter()
            .filter(|call| {
                call.cmd_buf() == Some(cmd_buf)
                    && !matches!(
                        call,
                        MockCall::BeginCommandBuffer(_) | MockCall::EndCommandBuffer(_)
                    )
            })
            .cloned()
            .collect()
    }

    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Vec<u8> {
        self.buffers
            .lock()
            .get(&buffer)
            .cloned()
            .unwrap_or_default()
    }

    /// The number of created objects which have not been destroyed.
    pub fn live_objects(&self) -> u64 {
        self.live_objects.load(Ordering::Relaxed)
    }

    /// When `true`, submitted work does not complete until waited on or [`Self::complete_all`].
    pub fn set_deferred(&self, deferred: bool) {
        self.deferred.store(deferred, Ordering::Relaxed);
    }

    pub fn set_fail_pipelines(&self, fail: bool) {
        self.fail_pipelines.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_submissions(&self, fail: bool) {
        self.fail_submissions.store(fail, Ordering::Relaxed);
    }

    /// Completes all deferred work.
    pub fn complete_all(&self) {
        let pending = std::mem::take(&mut *self.pending.lock());
        let mut semaphores = self.semaphores.lock();

        for (semaphore, value) in pending {
            let current = semaphores.entry(semaphore).or_default();
            *current = (*current).max(value);
        }
    }

    fn complete_until(&self, semaphore: vk::Semaphore, value: u64) {
        let mut pending = self.pending.lock();
        let mut semaphores = self.semaphores.lock();

        pending.retain(|&(pending_semaphore, pending_value)| {
            if pending_semaphore == semaphore && pending_value <= value {
                let current = semaphores.entry(semaphore).or_default();
                *current = (*current).max(pending_value);

                false
            } else {
                true
            }
        });
    }
}

impl Driver for MockDriver {
    fn min_uniform_buffer_offset_alignment(&self) -> vk::DeviceSize {
        256
    }

    fn create_command_buffer(
        &self,
        _queue_family_index: u32,
    ) -> Result<vk::CommandBuffer, DriverError> {
        Ok(self.create())
    }

    fn destroy_command_buffer(&self, _cmd_buf: vk::CommandBuffer) {
        self.destroy();
    }

    fn begin_command_buffer(&self, cmd_buf: vk::CommandBuffer) -> Result<(), DriverError> {
        self.record(MockCall::BeginCommandBuffer(cmd_buf));

        Ok(())
    }

    fn end_command_buffer(&self, cmd_buf: vk::CommandBuffer) -> Result<(), DriverError> {
        self.record(MockCall::EndCommandBuffer(cmd_buf));

        Ok(())
    }

    fn cmd_pipeline_barrier(&self, cmd_buf: vk::CommandBuffer, dependency: &Dependency) {
        self.record(MockCall::PipelineBarrier(cmd_buf, dependency.clone()));
    }

    fn cmd_begin_rendering(&self, cmd_buf: vk::CommandBuffer, info: &RenderingInfo) {
        self.record(MockCall::BeginRendering(cmd_buf, info.clone()));
    }

    fn cmd_end_rendering(&self, cmd_buf: vk::CommandBuffer) {
        self.record(MockCall::EndRendering(cmd_buf));
    }

    fn cmd_bind_pipeline(
        &self,
        cmd_buf: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        self.record(MockCall::BindPipeline(cmd_buf, bind_point, pipeline));
    }

    fn cmd_bind_descriptor_sets(
        &self,
        cmd_buf: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        self.record(MockCall::BindDescriptorSets {
            cmd_buf,
            bind_point,
            layout,
            first_set,
            sets: sets.to_vec(),
        });
    }

    fn cmd_bind_vertex_buffer(
        &self,
        cmd_buf: vk::CommandBuffer,
        _binding: u32,
        buffer: vk::Buffer,
        _offset: vk::DeviceSize,
    ) {
        self.record(MockCall::BindVertexBuffer(cmd_buf, buffer));
    }

    fn cmd_bind_index_buffer(
        &self,
        cmd_buf: vk::CommandBuffer,
        buffer: vk::Buffer,
        _offset: vk::DeviceSize,
        _index_ty: vk::IndexType,
    ) {
        self.record(MockCall::BindIndexBuffer(cmd_buf, buffer));
    }

    fn cmd_draw(
        &self,
        cmd_buf: vk::CommandBuffer,
        vertex_count: u32,
        _instance_count: u32,
        _first_vertex: u32,
        _first_instance: u32,
    ) {
        self.record(MockCall::Draw(cmd_buf, vertex_count));
    }

    fn cmd_draw_indexed(
        &self,
        cmd_buf: vk::CommandBuffer,
        index_count: u32,
        _instance_count: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.record(MockCall::DrawIndexed(cmd_buf, index_count));
    }

    fn cmd_dispatch(&self, cmd_buf: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        self.record(MockCall::Dispatch(cmd_buf, x, y, z));
    }

    fn cmd_blit_image(
        &self,
        cmd_buf: vk::CommandBuffer,
        src: vk::Image,
        _src_layout: vk::ImageLayout,
        dst: vk::Image,
        _dst_layout: vk::ImageLayout,
        _regions: &[vk::ImageBlit],
        _filter: vk::Filter,
    ) {
        self.record(MockCall::BlitImage(cmd_buf, src, dst));
    }

    fn cmd_copy_buffer(
        &self,
        cmd_buf: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        _regions: &[vk::BufferCopy],
    ) {
        self.record(MockCall::CopyBuffer(cmd_buf, src, dst));
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd_buf: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        _dst_layout: vk::ImageLayout,
        _regions: &[vk::BufferImageCopy],
    ) {
        self.record(MockCall::CopyBufferToImage(cmd_buf, src, dst));
    }

    fn cmd_copy_image(
        &self,
        cmd_buf: vk::CommandBuffer,
        src: vk::Image,
        _src_layout: vk::ImageLayout,
        dst: vk::Image,
        _dst_layout: vk::ImageLayout,
        _regions: &[vk::ImageCopy],
    ) {
        self.record(MockCall::CopyImage(cmd_buf, src, dst));
    }

    fn create_timeline_semaphore(&self, initial_value: u64) -> Result<vk::Semaphore, DriverError> {
        let semaphore = self.create();
        self.semaphores.lock().insert(semaphore, initial_value);

        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.semaphores.lock().remove(&semaphore);
        self.destroy();
    }

    fn semaphore_value(&self, semaphore: vk::Semaphore) -> Result<u64, DriverError> {
        self.semaphores
            .lock()
            .get(&semaphore)
            .copied()
            .ok_or(DriverError::InvalidData)
    }

    fn wait_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> Result<(), DriverError> {
        self.complete_until(semaphore, value);

        if self.semaphore_value(semaphore)? >= value {
            Ok(())
        } else {
            // Nothing pending will ever signal this value
            Err(DriverError::InvalidData)
        }
    }

    fn queue_submit(&self, queue: QueueId, submission: &Submission) -> Result<(), DriverError> {
        if self.fail_submissions.load(Ordering::Relaxed) {
            return Err(DriverError::InvalidData);
        }

        self.record(MockCall::Submit(queue, submission.clone()));

        if self.deferred.load(Ordering::Relaxed) {
            self.pending
                .lock()
                .push((submission.signal_semaphore, submission.signal_value));
        } else {
            let mut semaphores = self.semaphores.lock();
            let current = semaphores.entry(submission.signal_semaphore).or_default();
            *current = (*current).max(submission.signal_value);
        }

        Ok(())
    }

    fn create_image(&self, _info: &ImageInfo) -> Result<vk::Image, DriverError> {
        Ok(self.create())
    }

    fn destroy_image(&self, _image: vk::Image) {
        self.destroy();
    }

    fn create_image_view(
        &self,
        _image: vk::Image,
        _info: &ImageViewInfo,
    ) -> Result<vk::ImageView, DriverError> {
        Ok(self.create())
    }

    fn destroy_image_view(&self, _view: vk::ImageView) {
        self.destroy();
    }

    fn create_buffer(&self, info: &BufferInfo) -> Result<vk::Buffer, DriverError> {
        let buffer = self.create();

        if info.mappable {
            self.buffers
                .lock()
                .insert(buffer, vec![0; info.size as usize]);
        }

        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.buffers.lock().remove(&buffer);
        self.destroy();
    }

    fn write_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> Result<(), DriverError> {
        let mut buffers = self.buffers.lock();
        let contents = buffers.get_mut(&buffer).ok_or(DriverError::InvalidData)?;
        let start = offset as usize;
        let end = start + data.len();

        if end > contents.len() {
            return Err(DriverError::InvalidData);
        }

        contents[start..end].copy_from_slice(data);

        Ok(())
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<vk::Sampler, DriverError> {
        let sampler = self.create();
        self.record(MockCall::CreateSampler(sampler, *desc));

        Ok(sampler)
    }

    fn destroy_sampler(&self, _sampler: vk::Sampler) {
        self.destroy();
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorSetLayoutBinding],
    ) -> Result<vk::DescriptorSetLayout, DriverError> {
        let layout = self.create();
        self.record(MockCall::CreateDescriptorSetLayout(layout, bindings.to_vec()));

        Ok(layout)
    }

    fn destroy_descriptor_set_layout(&self, _layout: vk::DescriptorSetLayout) {
        self.destroy();
    }

    fn allocate_descriptor_set(
        &self,
        _layout: vk::DescriptorSetLayout,
        _bindings: &[DescriptorSetLayoutBinding],
    ) -> Result<vk::DescriptorSet, DriverError> {
        Ok(self.create())
    }

    fn free_descriptor_set(&self, _set: vk::DescriptorSet) {
        self.destroy();
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        self.record(MockCall::UpdateDescriptorSet(set, writes.to_vec()));
    }

    fn create_pipeline_layout(
        &self,
        _set_layouts: &[vk::DescriptorSetLayout],
    ) -> Result<vk::PipelineLayout, DriverError> {
        Ok(self.create())
    }

    fn destroy_pipeline_layout(&self, _layout: vk::PipelineLayout) {
        self.destroy();
    }

    fn create_graphic_pipeline(
        &self,
        desc: &GraphicPipelineDesc,
    ) -> Result<vk::Pipeline, DriverError> {
        if self.fail_pipelines.load(Ordering::Relaxed) {
            return Err(DriverError::Unsupported);
        }

        let pipeline = self.create();
        self.record(MockCall::CreateGraphicPipeline(pipeline, desc.clone()));

        Ok(pipeline)
    }

    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc,
    ) -> Result<vk::Pipeline, DriverError> {
        if self.fail_pipelines.load(Ordering::Relaxed) {
            return Err(DriverError::Unsupported);
        }

        let pipeline = self.create();
        self.record(MockCall::CreateComputePipeline(pipeline, desc.clone()));

        Ok(pipeline)
    }

    fn destroy_pipeline(&self, _pipeline: vk::Pipeline) {
        self.destroy();
    }
}
