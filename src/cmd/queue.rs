use {
    super::{
        recorder::{CommandRecorder, KeepAlive},
        uniform::{UniformPool, UniformPoolInfo},
        Ownership,
    },
    crate::{
        driver::{
            fatal, need_barrier, next_resource_id, Buffer, BufferBarrier, CommandBuffer,
            Dependency, Driver, DriverError, Image, ImageBarrier, LayoutState, MemoryAccess,
            MemoryBarrier, QueueId, SemaphoreWait, Submission,
        },
        pool::{lease, new_cache, Cache},
    },
    ash::vk,
    derive_builder::{Builder, UninitializedFieldError},
    log::{debug, trace, warn},
    parking_lot::ReentrantMutex,
    std::{
        cell::RefCell,
        collections::VecDeque,
        fmt::{Debug, Formatter},
        mem::take,
        sync::{Arc, Weak},
        thread::panicking,
    },
};

/// Information used to create an [`ExecutionQueue`] instance.
#[derive(Builder, Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[builder(
    build_fn(private, name = "fallible_build", error = "QueueInfoBuilderError"),
    derive(Clone, Copy, Debug),
    pattern = "owned"
)]
#[non_exhaustive]
pub struct QueueInfo {
    /// The queue family of the hardware queue.
    pub family_index: u32,

    /// A name for debugging purposes.
    #[builder(default, setter(strip_option))]
    pub name: Option<&'static str>,

    /// Index of the hardware queue within its family.
    #[builder(default)]
    pub queue_index: u32,

    /// Sizing of the uniform buffers leased by recorders of this queue.
    #[builder(default)]
    pub uniform_pool: UniformPoolInfo,
}

impl QueueInfo {
    /// Specifies the queue at `queue_index` within `family_index`.
    #[inline(always)]
    pub const fn new(family_index: u32, queue_index: u32) -> Self {
        Self {
            family_index,
            name: None,
            queue_index,
            uniform_pool: UniformPoolInfo::new(64 * 1024),
        }
    }

    pub fn id(&self) -> QueueId {
        QueueId {
            family_index: self.family_index,
            queue_index: self.queue_index,
        }
    }

    #[inline(always)]
    pub fn to_builder(self) -> QueueInfoBuilder {
        QueueInfoBuilder {
            family_index: Some(self.family_index),
            name: Some(self.name),
            queue_index: Some(self.queue_index),
            uniform_pool: Some(self.uniform_pool),
        }
    }
}

impl QueueInfoBuilder {
    /// Builds a new `QueueInfo`.
    ///
    /// # Panics
    ///
    /// If any of the following values have not been set this function will panic:
    ///
    /// * `family_index`
    #[inline(always)]
    pub fn build(self) -> QueueInfo {
        match self.fallible_build() {
            Err(QueueInfoBuilderError(err)) => panic!("{err}"),
            Ok(info) => info,
        }
    }
}

impl From<QueueInfoBuilder> for QueueInfo {
    fn from(info: QueueInfoBuilder) -> Self {
        info.build()
    }
}

#[derive(Debug)]
struct QueueInfoBuilderError(UninitializedFieldError);

impl From<UninitializedFieldError> for QueueInfoBuilderError {
    fn from(err: UninitializedFieldError) -> Self {
        Self(err)
    }
}

/// A resource whose ownership may move between queues.
#[derive(Clone, Debug)]
pub enum Resource {
    Buffer(Arc<Buffer>),
    Image(Arc<Image>),
}

impl Resource {
    fn owner(&self) -> Ownership {
        match self {
            Self::Buffer(buffer) => Buffer::state(buffer).owner.clone(),
            Self::Image(image) => Image::state(image).owner.clone(),
        }
    }

    fn set_owner(&self, owner: Ownership) {
        match self {
            Self::Buffer(buffer) => Buffer::state(buffer).owner = owner,
            Self::Image(image) => Image::state(image).owner = owner,
        }
    }

    fn clear_history(&self) {
        match self {
            Self::Buffer(buffer) => Buffer::state(buffer).last_access = MemoryAccess::NONE,
            Self::Image(image) => Image::state(image).last_access.clear(),
        }
    }

    /// Returns the barriers which release this resource from `src_family`, collapsing any layout
    /// exception first, and the acquire barrier which must follow on `dst_family`.
    fn release(&self, src_family: u32, dst_family: u32) -> (Dependency, Dependency, Dependency) {
        let mut collapse = Dependency::default();
        let mut release = Dependency::default();
        let mut acquire = Dependency::default();

        match self {
            Self::Buffer(buffer) => {
                let mut state = Buffer::state(buffer);
                let prior = state.last_access;

                release.buffer_barriers.push(BufferBarrier {
                    buffer: ***buffer,
                    offset: 0,
                    size: vk::WHOLE_SIZE,
                    src_stages: prior.stages(),
                    src_access: prior.write_access,
                    dst_stages: vk::PipelineStageFlags2::NONE,
                    dst_access: vk::AccessFlags2::NONE,
                    src_queue_family: src_family,
                    dst_queue_family: dst_family,
                });
                acquire.buffer_barriers.push(BufferBarrier {
                    buffer: ***buffer,
                    offset: 0,
                    size: vk::WHOLE_SIZE,
                    src_stages: vk::PipelineStageFlags2::NONE,
                    src_access: vk::AccessFlags2::NONE,
                    dst_stages: MemoryBarrier::FULL.dst_stages,
                    dst_access: MemoryBarrier::FULL.dst_access,
                    src_queue_family: src_family,
                    dst_queue_family: dst_family,
                });

                state.last_access = MemoryAccess::NONE;
            }
            Self::Image(image) => {
                let mut state = Image::state(image);
                let whole = Image::whole(image);
                let prior = state.last_access.union();
                let mut src_stages = prior.stages();
                let layout = match state.layout {
                    Some(layout) => {
                        if let Some((slice, exception)) = layout.exception() {
                            let prior = state.last_access.prior(&slice);

                            collapse.image_barriers.push(ImageBarrier {
                                image: ***image,
                                slice,
                                src_stages: prior.stages(),
                                src_access: prior.write_access,
                                dst_stages: vk::PipelineStageFlags2::ALL_COMMANDS,
                                dst_access: MemoryBarrier::FULL.dst_access,
                                old_layout: exception,
                                new_layout: layout.primary(),
                                src_queue_family: vk::QUEUE_FAMILY_IGNORED,
                                dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
                            });
                            src_stages = vk::PipelineStageFlags2::ALL_COMMANDS;
                        }

                        state.layout = Some(LayoutState::new(whole, layout.primary()));

                        layout.primary()
                    }
                    None => image.info.default_layout,
                };

                release.image_barriers.push(ImageBarrier {
                    image: ***image,
                    slice: whole,
                    src_stages,
                    src_access: prior.write_access,
                    dst_stages: vk::PipelineStageFlags2::NONE,
                    dst_access: vk::AccessFlags2::NONE,
                    old_layout: layout,
                    new_layout: layout,
                    src_queue_family: src_family,
                    dst_queue_family: dst_family,
                });
                acquire.image_barriers.push(ImageBarrier {
                    image: ***image,
                    slice: whole,
                    src_stages: vk::PipelineStageFlags2::NONE,
                    src_access: vk::AccessFlags2::NONE,
                    dst_stages: MemoryBarrier::FULL.dst_stages,
                    dst_access: MemoryBarrier::FULL.dst_access,
                    old_layout: layout,
                    new_layout: layout,
                    src_queue_family: src_family,
                    dst_queue_family: dst_family,
                });

                state.last_access.clear();
            }
        }

        (collapse, release, acquire)
    }
}

impl From<Arc<Buffer>> for Resource {
    fn from(buffer: Arc<Buffer>) -> Self {
        Self::Buffer(buffer)
    }
}

impl From<&Arc<Buffer>> for Resource {
    fn from(buffer: &Arc<Buffer>) -> Self {
        Self::Buffer(Arc::clone(buffer))
    }
}

impl From<Arc<Image>> for Resource {
    fn from(image: Arc<Image>) -> Self {
        Self::Image(image)
    }
}

impl From<&Arc<Image>> for Resource {
    fn from(image: &Arc<Image>) -> Self {
        Self::Image(Arc::clone(image))
    }
}

struct InFlight {
    resources: Vec<KeepAlive>,
    value: u64,
}

struct PendingWait {
    queue: Arc<QueueInner>,
    wait: SemaphoreWait,
}

#[derive(Default)]
struct QueueState {
    counter: u64,
    in_flight: VecDeque<InFlight>,
    waits: Vec<PendingWait>,
}

pub(crate) struct QueueInner {
    pub(super) cmd_bufs: Cache<CommandBuffer>,
    pub(crate) driver: Arc<dyn Driver>,
    id: u64,
    pub(crate) info: QueueInfo,
    semaphore: vk::Semaphore,
    state: ReentrantMutex<RefCell<QueueState>>,
    pub(super) uniforms: UniformPool,
}

impl QueueInner {
    fn sync_point(self: &Arc<Self>, value: u64) -> SyncPoint {
        SyncPoint {
            queue: Arc::downgrade(self),
            semaphore: self.semaphore,
            value,
        }
    }

    /// Drops the resources of every submission up to and including `completed`.
    fn reclaim(&self, completed: u64) {
        let state = self.state.lock();
        let done = {
            let mut state = state.borrow_mut();
            let mut done = vec![];

            while state
                .in_flight
                .front()
                .is_some_and(|in_flight| in_flight.value <= completed)
            {
                done.extend(state.in_flight.pop_front());
            }

            done
        };

        if !done.is_empty() {
            trace!("reclaimed {} submission(s)", done.len());
        }
    }

    fn poll(&self) -> Result<(), DriverError> {
        let completed = self.driver.semaphore_value(self.semaphore)?;
        self.reclaim(completed);

        Ok(())
    }

    /// Submits `command_buffers` signalling the next counter value.
    ///
    /// The caller must hold the queue lock.
    fn queue_submit(
        self: &Arc<Self>,
        command_buffers: Vec<vk::CommandBuffer>,
        mut resources: Vec<KeepAlive>,
    ) -> SyncPoint {
        let state = self.state.lock();
        let (waits, value) = {
            let mut state = state.borrow_mut();

            (take(&mut state.waits), state.counter + 1)
        };
        let submission = Submission {
            waits: waits.iter().map(|pending| pending.wait).collect(),
            command_buffers,
            signal_semaphore: self.semaphore,
            signal_value: value,
        };

        trace!(
            "submit {:?}: {} command buffer(s), value {value}",
            self.info.id(),
            submission.command_buffers.len()
        );

        if let Err(err) = self.driver.queue_submit(self.info.id(), &submission) {
            fatal(err);
        }

        resources.extend(
            waits
                .into_iter()
                .map(|pending| Box::new(pending.queue) as KeepAlive),
        );

        {
            let mut state = state.borrow_mut();
            state.counter = value;
            state.in_flight.push_back(InFlight { resources, value });
        }

        self.sync_point(value)
    }

    pub(super) fn lease_command_buffer(&self) -> crate::pool::Lease<CommandBuffer> {
        let cmd_buf = lease(&self.cmd_bufs, || {
            CommandBuffer::create(&self.driver, self.info.family_index)
        })
        .unwrap_or_else(|err| fatal(err));

        CommandBuffer::begin(&cmd_buf).unwrap_or_else(|err| fatal(err));

        cmd_buf
    }
}

impl Drop for QueueInner {
    #[profiling::function]
    fn drop(&mut self) {
        if panicking() {
            return;
        }

        let state = self.state.get_mut().get_mut();

        if let Err(err) = self.driver.wait_semaphore(self.semaphore, state.counter) {
            warn!("unable to wait for idle queue: {err}");
        }

        state.waits.clear();
        state.in_flight.clear();

        self.driver.destroy_semaphore(self.semaphore);
    }
}

/// A hardware queue and the completion counter of the work submitted to it.
///
/// Cloning is cheap; every clone refers to the same queue.
#[derive(Clone)]
pub struct ExecutionQueue {
    pub(super) inner: Arc<QueueInner>,
}

impl ExecutionQueue {
    #[profiling::function]
    pub fn new(driver: &Arc<dyn Driver>, info: impl Into<QueueInfo>) -> Result<Self, DriverError> {
        let info: QueueInfo = info.into();

        trace!("create: {:?}", info);

        let semaphore = driver.create_timeline_semaphore(0)?;

        Ok(Self {
            inner: Arc::new(QueueInner {
                cmd_bufs: new_cache(),
                driver: Arc::clone(driver),
                id: next_resource_id(),
                info,
                semaphore,
                state: ReentrantMutex::new(RefCell::new(QueueState::default())),
                uniforms: UniformPool::new(driver, info.uniform_pool),
            }),
        })
    }

    pub fn info(&self) -> QueueInfo {
        self.inner.info
    }

    /// The counter value of the most recent submission.
    pub fn submitted_value(&self) -> u64 {
        self.inner.state.lock().borrow().counter
    }

    /// A sync point which is reached once all work submitted so far has completed.
    pub fn current_sync_point(&self) -> SyncPoint {
        let value = self.submitted_value();

        self.inner.sync_point(value)
    }

    /// Starts recording new work for this queue.
    ///
    /// Resources of completed submissions are reclaimed first.
    #[profiling::function]
    pub fn start_commands(&self) -> Result<CommandRecorder, DriverError> {
        let _lock = self.inner.state.lock();

        self.inner.poll()?;

        Ok(CommandRecorder::new(self.clone()))
    }

    /// Finalizes and submits `recorder`, returning the point at which its work has completed.
    ///
    /// A recorder with no work submits nothing and returns the current sync point.
    pub fn submit_commands(&self, mut recorder: CommandRecorder) -> SyncPoint {
        self.submit(&mut recorder)
    }

    #[profiling::function]
    pub(super) fn submit(&self, recorder: &mut CommandRecorder) -> SyncPoint {
        assert!(
            recorder.is_recorded_for(&self.inner),
            "command recorder belongs to another queue"
        );

        let _lock = self.inner.state.lock();

        if !recorder.is_finalized() {
            recorder.finalize();
        }

        let work = recorder.take_work();

        if work.is_empty() {
            return self.current_sync_point();
        }

        let mut dependency = Dependency::default();
        let mut hazard_src = MemoryAccess::NONE;
        let mut hazard_dst = MemoryAccess::NONE;
        let mut resolved_images = Vec::with_capacity(work.images.len());
        let mut resolved_buffers = Vec::with_capacity(work.buffers.len());

        {
            profiling::scope!("reconcile");

            for track in &work.images {
                let state = Image::state(&track.image);

                assert!(
                    state.owner.allows(&self.inner),
                    "{:?} is owned by another queue",
                    track.image
                );

                if let Some(initial) = &track.initial {
                    let (current, first_use) = match state.layout {
                        Some(layout) => (layout, false),
                        None => (
                            LayoutState::new(initial.whole(), vk::ImageLayout::UNDEFINED),
                            true,
                        ),
                    };

                    for transition in current.conversion_to(initial) {
                        let prior = if first_use {
                            MemoryAccess::NONE
                        } else {
                            state.last_access.prior(&transition.slice)
                        };

                        dependency.image_barriers.push(ImageBarrier {
                            image: **track.image,
                            slice: transition.slice,
                            src_stages: prior.stages(),
                            src_access: prior.write_access,
                            dst_stages: track.all_access.stages(),
                            dst_access: track.all_access.accesses(),
                            old_layout: transition.old_layout,
                            new_layout: transition.new_layout,
                            src_queue_family: vk::QUEUE_FAMILY_IGNORED,
                            dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
                        });
                    }
                }

                let prior = state.last_access.union();
                let resolved = !prior.is_empty() && need_barrier(&prior, &track.all_access);

                if resolved {
                    hazard_src |= prior;
                    hazard_dst |= track.all_access;
                }

                resolved_images.push(resolved);
            }

            for track in &work.buffers {
                let state = Buffer::state(&track.buffer);

                assert!(
                    state.owner.allows(&self.inner),
                    "{:?} is owned by another queue",
                    track.buffer
                );

                let prior = state.last_access;
                let resolved = !prior.is_empty() && need_barrier(&prior, &track.all_access);

                if resolved {
                    hazard_src |= prior;
                    hazard_dst |= track.all_access;
                }

                resolved_buffers.push(resolved);
            }
        }

        if !hazard_src.is_empty() {
            dependency
                .memory_barriers
                .push(MemoryBarrier::new(hazard_src, hazard_dst));
        }

        let mut command_buffers = Vec::with_capacity(work.segments.len() + 1);
        let mut resources: Vec<KeepAlive> = vec![];

        if !dependency.is_empty() {
            trace!(
                "reconcile: {} image barrier(s), {} memory barrier(s)",
                dependency.image_barriers.len(),
                dependency.memory_barriers.len()
            );

            let cmd_buf = self.inner.lease_command_buffer();

            self.inner.driver.cmd_pipeline_barrier(**cmd_buf, &dependency);
            CommandBuffer::end(&cmd_buf).unwrap_or_else(|err| fatal(err));

            command_buffers.push(**cmd_buf);
            resources.push(Box::new(cmd_buf));
        }

        command_buffers.extend(work.segments.iter().map(|segment| ***segment));

        // Commit before anything else can observe the new counter value
        for (track, resolved) in work.images.iter().zip(resolved_images) {
            let mut state = Image::state(&track.image);

            if track.state.is_some() {
                state.layout = track.state;
            }

            if resolved {
                state.last_access = track.history.clone();
            } else {
                state.last_access.extend(&track.history);
            }

            state.owner = Ownership::owned_by(&self.inner);
        }

        for (track, resolved) in work.buffers.iter().zip(resolved_buffers) {
            let mut state = Buffer::state(&track.buffer);

            if resolved {
                state.last_access = track.last;
            } else {
                state.last_access |= track.last;
            }

            state.owner = Ownership::owned_by(&self.inner);
        }

        resources.extend(work.into_resources());

        self.inner.queue_submit(command_buffers, resources)
    }

    /// Submits no work, returning a new sync point which is reached once all previously
    /// submitted work has completed.
    #[profiling::function]
    pub fn create_sync_point(&self) -> SyncPoint {
        let _lock = self.inner.state.lock();

        self.inner.queue_submit(vec![], vec![])
    }

    /// Makes the next submission to this queue wait until `sync_point` is reached.
    ///
    /// Sync points of this queue are ignored; submissions to one queue are already ordered.
    pub fn wait_for(&self, sync_point: &SyncPoint) {
        let Some(queue) = sync_point.queue.upgrade() else {
            return;
        };

        if Arc::ptr_eq(&queue, &self.inner) {
            return;
        }

        let state = self.inner.state.lock();
        state.borrow_mut().waits.push(PendingWait {
            queue,
            wait: SemaphoreWait {
                semaphore: sync_point.semaphore,
                value: sync_point.value,
                stages: vk::PipelineStageFlags2::ALL_COMMANDS,
            },
        });
    }

    /// Blocks until all submitted work has completed, then reclaims its resources.
    #[profiling::function]
    pub fn wait_idle(&self) -> Result<(), DriverError> {
        let value = self.submitted_value();

        self.inner
            .driver
            .wait_semaphore(self.inner.semaphore, value)?;
        self.inner.reclaim(value);

        Ok(())
    }

    /// Moves ownership of `resource` from `old` to `new`.
    ///
    /// Work submitted to `new` after this call may use the resource once the returned sync point
    /// is reached; `new` already waits on it. Queues of the same family only need an execution
    /// dependency. Queues of different families release and then acquire the resource; a failure
    /// between those two halves aborts the process.
    ///
    /// # Panics
    ///
    /// Panics if the resource is owned by a queue other than `old`, or is already in transfer.
    #[profiling::function]
    pub fn ownership_transfer(
        old: &Self,
        new: &Self,
        resource: impl Into<Resource>,
    ) -> Result<SyncPoint, DriverError> {
        let resource = resource.into();

        let (first, second) = if old.inner.id < new.inner.id {
            (old, new)
        } else {
            (new, old)
        };
        let _first = first.inner.state.lock();
        let _second = second.inner.state.lock();

        let owner = resource.owner();

        assert!(
            !owner.is_in_transfer(),
            "{resource:?} is already in transfer"
        );
        assert!(
            owner.allows(&old.inner),
            "{resource:?} is not owned by the releasing queue"
        );

        if owner.queue().is_none() {
            debug!("transfer of unowned {resource:?}");

            resource.set_owner(Ownership::owned_by(&new.inner));

            return Ok(new.current_sync_point());
        }

        if Arc::ptr_eq(&old.inner, &new.inner) {
            return Ok(old.current_sync_point());
        }

        if old.inner.info.family_index == new.inner.info.family_index {
            let mut recorder = old.start_commands()?;
            recorder.memory_barrier();
            recorder.keep_alive(resource.clone());

            let sync_point = old.submit_commands(recorder);
            new.wait_for(&sync_point);

            resource.clear_history();
            resource.set_owner(Ownership::owned_by(&new.inner));

            return Ok(sync_point);
        }

        let src_family = old.inner.info.family_index;
        let dst_family = new.inner.info.family_index;

        debug!("release {resource:?}: family {src_family} -> {dst_family}");

        let mut recorder = old.start_commands()?;
        let (collapse, release, acquire) = resource.release(src_family, dst_family);

        if !collapse.is_empty() {
            recorder.pipeline_barrier(&collapse);
        }

        recorder.pipeline_barrier(&release);
        recorder.keep_alive(resource.clone());

        let released = old.submit_commands(recorder);
        resource.set_owner(Ownership::InTransfer);

        new.wait_for(&released);

        let mut recorder = new.start_commands().unwrap_or_else(|err| fatal(err));
        recorder.pipeline_barrier(&acquire);
        recorder.keep_alive(resource.clone());

        let acquired = new.submit_commands(recorder);
        resource.set_owner(Ownership::owned_by(&new.inner));

        Ok(acquired)
    }
}

impl Debug for ExecutionQueue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(name) = self.inner.info.name {
            write!(f, "{} ({:?})", name, self.inner.info.id())
        } else {
            write!(f, "{:?}", self.inner.info.id())
        }
    }
}

/// A point in the execution of one queue.
///
/// A sync point of a queue which no longer exists is always ready.
#[derive(Clone, Debug)]
pub struct SyncPoint {
    queue: Weak<QueueInner>,
    semaphore: vk::Semaphore,
    value: u64,
}

impl SyncPoint {
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Returns `true` once all work up to this point has completed.
    pub fn is_ready(&self) -> bool {
        let Some(queue) = self.queue.upgrade() else {
            return true;
        };

        match queue.driver.semaphore_value(self.semaphore) {
            Ok(value) => value >= self.value,
            Err(err) => {
                warn!("unable to poll sync point: {err}");

                false
            }
        }
    }

    /// Blocks until all work up to this point has completed.
    #[profiling::function]
    pub fn wait_for_ready(&self) -> Result<(), DriverError> {
        let Some(queue) = self.queue.upgrade() else {
            return Ok(());
        };

        queue.driver.wait_semaphore(self.semaphore, self.value)?;
        queue.reclaim(self.value);

        Ok(())
    }
}
