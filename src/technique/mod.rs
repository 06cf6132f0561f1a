//! Shader techniques: configuration from reflection and binding at draw time.
//!
//! A [`Configurator`] compiles a [`TechniqueDesc`] into an immutable [`TechniqueConfiguration`]
//! holding one pipeline per pass and selection combination. A [`Technique`] holds the values
//! attached by name and binds a pass into a [`CommandRecorder`]:
//!
//! ```no_run
//! # use {std::sync::Arc, vellum::prelude::*};
//! # fn draw(configurator: &Arc<Configurator>, recorder: &mut CommandRecorder, image: &Arc<Image>) {
//! let technique = Technique::new(configurator, "sprite");
//! let pass = technique.get_or_create_pass("main");
//!
//! technique.get_or_create_resource_binding("image").set_image(image);
//! technique.get_or_create_uniform("Transform.scale").set(2.0f32);
//!
//! if technique.bind_graphics(recorder, &pass, None) {
//!     recorder.draw(6, 1, 0, 0);
//! }
//! # }
//! ```

mod binding;
mod config;
mod desc;
mod reflect;
mod variants;

pub use self::{
    binding::{Pass, ResourceBinding, Selection, UniformValue, UniformVariable},
    config::{
        ConfigurationError, ConfigurationMetadata, Configurator, PassMetadata, PipelineKind,
        ResourceDesc, SelectionMetadata, SetRole, TechniqueConfiguration, UniformBufferDesc,
        UniformVariableDesc,
    },
    desc::{PassDesc, PassDescBuilder, SamplerBindingDesc, SelectionDesc, ShaderDesc, TechniqueDesc},
    reflect::{
        BindingReflection, CompiledShader, DescriptorCount, ReflectedType, ScalarKind,
        ShaderCompiler, ShaderReflection, StructMember, StructType,
    },
    variants::{variant_count, variant_index, weights, Variants},
};

use {
    self::binding::{ResourceSlot, ResourceValue, SelectionSlot, UniformSlot},
    crate::{
        cmd::{CommandRecorder, UniformSession},
        driver::{
            Buffer, DescriptorResource, DescriptorSet, DescriptorWrite, Driver, DriverError, Image,
            ImageAccess, ImageSlice, MemoryAccess, Sampler,
        },
    },
    ash::vk,
    log::{debug, trace, warn},
    parking_lot::Mutex,
    std::{
        collections::HashMap,
        fmt::{Debug, Formatter},
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
    },
};

/// A descriptor set filled from attached values, plus everything it references.
struct BuiltSet {
    buffers: Vec<(Arc<Buffer>, MemoryAccess)>,
    images: Vec<(Arc<Image>, ImageAccess)>,
    owned_buffers: Vec<Arc<Buffer>>,
    samplers: Vec<Arc<Sampler>>,
    set: DescriptorSet,
}

impl BuiltSet {
    fn declare_accesses(&self, recorder: &mut CommandRecorder) {
        for (image, access) in &self.images {
            recorder.image_access(image, access);
        }

        for (buffer, access) in &self.buffers {
            recorder.buffer_access(buffer, *access);
        }
    }
}

/// The Common and Static sets, valid while the technique revision and configuration match.
struct CachedSets {
    configuration: Arc<TechniqueConfiguration>,
    revision: u64,
    sets: Vec<BuiltSet>,
}

/// Where uniform block data of a set is stored.
enum UniformTarget<'a> {
    /// Dedicated buffers owned by the set; used by cached sets.
    Owned,
    Session(&'a mut UniformSession),
}

/// A volatile set built once and bound by many draws of one recorder.
///
/// Values attached after creation are not seen by draws using the context. Its uniform data lives
/// in the uniform session of the recorder it was created with, so other recorders rebuild the set
/// instead of binding it.
#[derive(Clone)]
pub struct VolatileContext {
    configuration: Arc<TechniqueConfiguration>,
    recorder: u64,
    set: Arc<BuiltSet>,
}

impl Debug for VolatileContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("VolatileContext").field(&self.set.set).finish()
    }
}

#[derive(Default)]
struct TechniqueState {
    configuration: Option<Arc<TechniqueConfiguration>>,
    configurator_revision: Option<u64>,
    passes: HashMap<String, Pass>,
    resources: HashMap<String, Arc<ResourceSlot>>,
    selections: HashMap<String, Arc<SelectionSlot>>,
    uniforms: HashMap<String, Arc<UniformSlot>>,
}

pub(crate) struct TechniqueInner {
    cache: Mutex<Option<Arc<CachedSets>>>,
    configurator: Arc<Configurator>,
    name: String,
    revision: AtomicU64,
    state: Mutex<TechniqueState>,
}

impl TechniqueInner {
    fn driver(&self) -> &Arc<dyn Driver> {
        self.configurator.driver()
    }

    /// Re-points to the latest configuration if the configurator revision moved.
    fn poll(&self) {
        let (revision, configuration) = self.configurator.snapshot();
        let mut state = self.state.lock();

        if state.configurator_revision == Some(revision) {
            return;
        }

        debug!(
            "{}: configuration revision {revision} ({})",
            self.name,
            if configuration.is_some() { "ready" } else { "not configured" }
        );

        state.configuration = configuration;
        state.configurator_revision = Some(revision);
        self.revision.fetch_add(1, Ordering::AcqRel);
    }

    fn configuration(&self) -> Option<Arc<TechniqueConfiguration>> {
        self.poll();
        self.state.lock().configuration.clone()
    }

    fn touch(&self, role: Option<SetRole>) {
        if role != Some(SetRole::Volatile) {
            self.revision.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub(super) fn touch_resource(&self, name: &str) {
        let role = self
            .state
            .lock()
            .configuration
            .as_ref()
            .and_then(|configuration| configuration.metadata.role_of(name));

        self.touch(role);
    }

    pub(super) fn touch_uniform(&self, name: &str) {
        let role = self
            .state
            .lock()
            .configuration
            .as_ref()
            .and_then(|configuration| configuration.metadata.uniform_variable(name))
            .map(|(block, _)| block.role);

        self.touch(role);
    }

    fn resource_value(&self, name: &str) -> ResourceValue {
        self.state
            .lock()
            .resources
            .get(name)
            .map(|slot| slot.value.lock().clone())
            .unwrap_or_default()
    }

    fn is_populated(&self, configuration: &TechniqueConfiguration) -> bool {
        let state = self.state.lock();
        let metadata = &configuration.metadata;

        for resource in &metadata.resources {
            let value = state
                .resources
                .get(&resource.name)
                .map(|slot| slot.value.lock().clone())
                .unwrap_or_default();
            let has_sampler =
                value.sampler.is_some() || configuration.default_sampler(&resource.name).is_some();
            let populated = match resource.ty {
                vk::DescriptorType::SAMPLER => has_sampler,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER => value.image.is_some() && has_sampler,
                vk::DescriptorType::SAMPLED_IMAGE
                | vk::DescriptorType::STORAGE_IMAGE
                | vk::DescriptorType::INPUT_ATTACHMENT => value.image.is_some(),
                _ => value.buffer.is_some(),
            };

            if !populated {
                trace!("{}: `{}` has no value", self.name, resource.name);

                return false;
            }
        }

        for block in &metadata.uniform_buffers {
            let has_buffer = state
                .resources
                .get(&block.name)
                .is_some_and(|slot| slot.value.lock().buffer.is_some());
            let has_variable = block.variables.iter().any(|variable| {
                state
                    .uniforms
                    .get(&variable.name)
                    .is_some_and(|slot| slot.value.lock().is_some())
            });

            if !has_buffer && !has_variable {
                trace!("{}: uniform block `{}` has no value", self.name, block.name);

                return false;
            }
        }

        true
    }

    /// Allocates and writes the set `role` of `configuration` from the attached values.
    #[profiling::function]
    fn build_set(
        &self,
        configuration: &TechniqueConfiguration,
        role: SetRole,
        mut uniforms: UniformTarget<'_>,
    ) -> Result<BuiltSet, DriverError> {
        let metadata = &configuration.metadata;
        let bindings = metadata.sets.get(&role).map(Vec::as_slice).unwrap_or_default();
        let layout = configuration.set_layouts()[role.set() as usize];
        let mut res = BuiltSet {
            buffers: vec![],
            images: vec![],
            owned_buffers: vec![],
            samplers: vec![],
            set: DescriptorSet::allocate(self.driver(), layout, bindings)?,
        };
        let mut writes = vec![];

        for resource in metadata.resources.iter().filter(|resource| resource.role == role) {
            let value = self.resource_value(&resource.name);
            let stages = pipeline_stages(resource.stages);
            let sampler = value
                .sampler
                .as_ref()
                .or_else(|| configuration.default_sampler(&resource.name))
                .cloned();
            let descriptor = match resource.ty {
                vk::DescriptorType::SAMPLER => sampler.as_ref().map(|sampler| {
                    DescriptorResource::Sampler(***sampler)
                }),
                vk::DescriptorType::UNIFORM_BUFFER
                | vk::DescriptorType::STORAGE_BUFFER
                | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
                | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC => {
                    value.buffer.as_ref().map(|(buffer, offset, range)| {
                        let access = match resource.ty {
                            vk::DescriptorType::UNIFORM_BUFFER
                            | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC => {
                                MemoryAccess::read(stages, vk::AccessFlags2::UNIFORM_READ)
                            }
                            _ if resource.writable => MemoryAccess::shader_read_write(stages),
                            _ => MemoryAccess::shader_read(stages),
                        };

                        res.buffers.push((Arc::clone(buffer), access));

                        DescriptorResource::Buffer {
                            buffer: ***buffer,
                            offset: *offset,
                            range: *range,
                        }
                    })
                }
                _ => match &value.image {
                    Some((image, view_info)) => {
                        let (layout, access) = if resource.ty == vk::DescriptorType::STORAGE_IMAGE {
                            (
                                vk::ImageLayout::GENERAL,
                                if resource.writable {
                                    MemoryAccess::shader_read_write(stages)
                                } else {
                                    MemoryAccess::shader_read(stages)
                                },
                            )
                        } else {
                            (
                                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                                MemoryAccess::shader_read(stages),
                            )
                        };
                        let layout = image.info.layout_for(layout);
                        let view = Image::view(image, *view_info)?;

                        res.images.push((
                            Arc::clone(image),
                            ImageAccess::single(ImageSlice::from(*view_info), layout, access),
                        ));

                        if resource.ty == vk::DescriptorType::COMBINED_IMAGE_SAMPLER {
                            sampler.as_ref().map(|sampler| {
                                DescriptorResource::CombinedImageSampler {
                                    view,
                                    layout,
                                    sampler: ***sampler,
                                }
                            })
                        } else {
                            Some(DescriptorResource::Image { view, layout })
                        }
                    }
                    None => None,
                },
            };

            let Some(descriptor) = descriptor else {
                continue;
            };

            if let Some(sampler) = sampler {
                res.samplers.push(sampler);
            }

            writes.extend((0..resource.count).map(|array_element| DescriptorWrite {
                binding: resource.binding,
                array_element,
                ty: resource.ty,
                resource: descriptor,
            }));
        }

        for block in metadata
            .uniform_buffers
            .iter()
            .filter(|block| block.role == role)
        {
            let descriptor = if let Some((buffer, offset, range)) = self.resource_value(&block.name).buffer {
                let access =
                    MemoryAccess::read(pipeline_stages(block.stages), vk::AccessFlags2::UNIFORM_READ);
                let descriptor = DescriptorResource::Buffer {
                    buffer: **buffer,
                    offset,
                    range,
                };

                res.buffers.push((buffer, access));

                descriptor
            } else {
                let data = self.uniform_data(block);

                match &mut uniforms {
                    UniformTarget::Owned => {
                        let buffer = Arc::new(Buffer::create_from_slice(
                            self.driver(),
                            vk::BufferUsageFlags::UNIFORM_BUFFER,
                            &data,
                        )?);
                        let descriptor = DescriptorResource::Buffer {
                            buffer: **buffer,
                            offset: 0,
                            range: data.len() as _,
                        };

                        res.owned_buffers.push(buffer);

                        descriptor
                    }
                    UniformTarget::Session(session) => {
                        let allocation = session.allocate(&data)?;

                        allocation.descriptor()
                    }
                }
            };

            writes.push(DescriptorWrite {
                binding: block.binding,
                array_element: 0,
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                resource: descriptor,
            });
        }

        DescriptorSet::write(&res.set, &writes);

        Ok(res)
    }

    /// The bytes of `block` with every attached variable written in.
    fn uniform_data(&self, block: &UniformBufferDesc) -> Vec<u8> {
        let state = self.state.lock();
        let mut res = vec![0; block.size.max(1) as usize];

        for variable in &block.variables {
            let Some(slot) = state.uniforms.get(&variable.name) else {
                continue;
            };

            if let Some(value) = slot.value.lock().as_ref() {
                if !value.write(variable, &mut res) {
                    warn!("{}: `{}` has an incompatible value", self.name, variable.name);
                }
            }
        }

        res
    }

    fn cached_sets(
        &self,
        configuration: &Arc<TechniqueConfiguration>,
    ) -> Result<Arc<CachedSets>, DriverError> {
        let mut cache = self.cache.lock();

        // Loaded before any value is read
        let revision = self.revision.load(Ordering::Acquire);

        if let Some(cached) = cache.as_ref() {
            if cached.revision == revision && Arc::ptr_eq(&cached.configuration, configuration) {
                return Ok(Arc::clone(cached));
            }
        }

        debug!("{}: building cached sets at revision {revision}", self.name);

        let set_count = configuration.set_layouts().len().min(SetRole::Volatile.set() as usize);
        let mut sets = Vec::with_capacity(set_count);

        for role in SetRole::ALL.into_iter().take(set_count) {
            sets.push(self.build_set(configuration, role, UniformTarget::Owned)?);
        }

        let res = Arc::new(CachedSets {
            configuration: Arc::clone(configuration),
            revision,
            sets,
        });
        *cache = Some(Arc::clone(&res));

        Ok(res)
    }
}

fn pipeline_stages(stages: vk::ShaderStageFlags) -> vk::PipelineStageFlags2 {
    [
        (vk::ShaderStageFlags::VERTEX, vk::PipelineStageFlags2::VERTEX_SHADER),
        (
            vk::ShaderStageFlags::TESSELLATION_CONTROL,
            vk::PipelineStageFlags2::TESSELLATION_CONTROL_SHADER,
        ),
        (
            vk::ShaderStageFlags::TESSELLATION_EVALUATION,
            vk::PipelineStageFlags2::TESSELLATION_EVALUATION_SHADER,
        ),
        (vk::ShaderStageFlags::GEOMETRY, vk::PipelineStageFlags2::GEOMETRY_SHADER),
        (vk::ShaderStageFlags::FRAGMENT, vk::PipelineStageFlags2::FRAGMENT_SHADER),
        (vk::ShaderStageFlags::COMPUTE, vk::PipelineStageFlags2::COMPUTE_SHADER),
    ]
    .into_iter()
    .filter(|(shader, _)| stages.contains(*shader))
    .fold(vk::PipelineStageFlags2::NONE, |res, (_, pipeline)| res | pipeline)
}

/// The runtime face of a technique: values attached by name, bound into recorders by pass.
///
/// Cloning is cheap; clones share values. Values survive configuration rebuilds and are
/// re-applied by name.
#[derive(Clone)]
pub struct Technique {
    inner: Arc<TechniqueInner>,
}

impl Technique {
    pub fn new(configurator: &Arc<Configurator>, name: impl Into<String>) -> Self {
        let inner = Arc::new(TechniqueInner {
            cache: Mutex::new(None),
            configurator: Arc::clone(configurator),
            name: name.into(),
            revision: AtomicU64::new(0),
            state: Mutex::new(TechniqueState::default()),
        });
        inner.poll();

        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The configuration draws currently use, if the last build succeeded.
    pub fn configuration(&self) -> Option<Arc<TechniqueConfiguration>> {
        self.inner.configuration()
    }

    /// Strictly increases on every change which invalidates the cached sets.
    pub fn revision(&self) -> u64 {
        self.inner.revision.load(Ordering::Acquire)
    }

    pub fn get_or_create_uniform(&self, name: &str) -> UniformVariable {
        let mut state = self.inner.state.lock();
        let slot = state.uniforms.entry(name.to_owned()).or_insert_with(|| {
            Arc::new(UniformSlot {
                name: name.to_owned(),
                value: Mutex::new(None),
            })
        });

        UniformVariable::new(&self.inner, slot)
    }

    pub fn get_or_create_resource_binding(&self, name: &str) -> ResourceBinding {
        let mut state = self.inner.state.lock();
        let slot = state.resources.entry(name.to_owned()).or_insert_with(|| {
            Arc::new(ResourceSlot {
                name: name.to_owned(),
                value: Mutex::new(ResourceValue::default()),
            })
        });

        ResourceBinding::new(&self.inner, slot)
    }

    pub fn get_or_create_selection(&self, name: &str) -> Selection {
        let mut state = self.inner.state.lock();
        let slot = state.selections.entry(name.to_owned()).or_insert_with(|| {
            Arc::new(SelectionSlot {
                name: name.to_owned(),
                value: Default::default(),
            })
        });

        Selection::new(&self.inner, slot)
    }

    pub fn get_or_create_pass(&self, name: &str) -> Pass {
        self.inner
            .state
            .lock()
            .passes
            .entry(name.to_owned())
            .or_insert_with(|| Pass::new(name))
            .clone()
    }

    /// Returns `true` if the technique is configured and every binding of every set has a value.
    ///
    /// Never builds descriptor sets.
    pub fn is_ready(&self) -> bool {
        self.inner
            .configuration()
            .is_some_and(|configuration| self.inner.is_populated(&configuration))
    }

    /// Binds `pass` for graphics work; returns `false`, logging why, if it cannot be bound.
    pub fn bind_graphics(
        &self,
        recorder: &mut CommandRecorder,
        pass: &Pass,
        volatile: Option<&VolatileContext>,
    ) -> bool {
        self.bind(recorder, pass, volatile, PipelineKind::Graphics)
    }

    /// Binds `pass` for compute work; returns `false`, logging why, if it cannot be bound.
    pub fn bind_compute(
        &self,
        recorder: &mut CommandRecorder,
        pass: &Pass,
        volatile: Option<&VolatileContext>,
    ) -> bool {
        self.bind(recorder, pass, volatile, PipelineKind::Compute)
    }

    #[profiling::function]
    fn bind(
        &self,
        recorder: &mut CommandRecorder,
        pass: &Pass,
        volatile: Option<&VolatileContext>,
        kind: PipelineKind,
    ) -> bool {
        let name = &self.inner.name;
        let Some(configuration) = self.inner.configuration() else {
            warn!("{name}: not configured");

            return false;
        };

        let metadata = &configuration.metadata;
        let Some((pass_index, pass_metadata)) = metadata.pass(pass.name()) else {
            warn!("{name}: no pass `{}`", pass.name());

            return false;
        };

        if pass_metadata.kind != kind {
            warn!("{name}: pass `{}` is not a {kind:?} pass", pass.name());

            return false;
        }

        if !self.inner.is_populated(&configuration) {
            warn!("{name}: not ready");

            return false;
        }

        let mut values = Vec::with_capacity(pass_metadata.selections.len());

        for (selection, weight) in pass_metadata.selections.iter().zip(&pass_metadata.weights) {
            let value = self
                .inner
                .state
                .lock()
                .selections
                .get(selection)
                .map(|slot| slot.value.load(Ordering::Acquire))
                .unwrap_or_default();
            let count = metadata
                .selection(selection)
                .map(|selection| selection.variants.len())
                .unwrap_or_default();

            if value >= count {
                warn!("{name}: selection `{selection}` value {value} out of range");

                return false;
            }

            values.push(value * weight);
        }

        let variant: usize = values.iter().sum();
        let Some(pipeline) = configuration.pipeline(pass_index, variant) else {
            warn!("{name}: pass `{}` has no variant {variant}", pass.name());

            return false;
        };

        trace!("{name}: bind {} variant {variant}", pass.name());

        let cached = match self.inner.cached_sets(&configuration) {
            Ok(cached) => cached,
            Err(err) => {
                warn!("{name}: unable to build cached sets: {err}");

                return false;
            }
        };

        let volatile = if configuration.set_layouts().len() > SetRole::Volatile.set() as usize {
            match volatile {
                Some(context)
                    if Arc::ptr_eq(&context.configuration, &configuration)
                        && context.recorder == recorder.id() =>
                {
                    Some(Arc::clone(&context.set))
                }
                _ => {
                    if let Some(context) = volatile {
                        if context.recorder != recorder.id() {
                            debug!("{name}: volatile context belongs to another recorder");
                        } else {
                            debug!("{name}: volatile context is out of date");
                        }
                    }

                    match self.inner.build_set(
                        &configuration,
                        SetRole::Volatile,
                        UniformTarget::Session(recorder.uniform_session()),
                    ) {
                        Ok(set) => Some(Arc::new(set)),
                        Err(err) => {
                            warn!("{name}: unable to build volatile set: {err}");

                            return false;
                        }
                    }
                }
            }
        } else {
            None
        };

        for set in cached.sets.iter().chain(volatile.as_deref()) {
            set.declare_accesses(recorder);
        }

        let bind_point = kind.bind_point();
        let sets = cached
            .sets
            .iter()
            .chain(volatile.as_deref())
            .map(|set| *set.set)
            .collect::<Vec<_>>();

        recorder.bind_pipeline(bind_point, pipeline);
        recorder.bind_descriptor_sets(bind_point, configuration.pipeline_layout(), 0, &sets);
        recorder.keep_alive(cached);

        if let Some(volatile) = volatile {
            recorder.keep_alive(volatile);
        }

        recorder.keep_alive(configuration);

        true
    }

    /// Builds the volatile set now, for reuse by many draws recorded into `recorder`.
    ///
    /// Returns `None` if the technique is not ready or has no volatile set.
    pub fn create_volatile_context(
        &self,
        recorder: &mut CommandRecorder,
    ) -> Option<VolatileContext> {
        let configuration = self.inner.configuration()?;

        if configuration.set_layouts().len() <= SetRole::Volatile.set() as usize {
            debug!("{}: no volatile set", self.inner.name);

            return None;
        }

        if !self.inner.is_populated(&configuration) {
            warn!("{}: not ready", self.inner.name);

            return None;
        }

        let set = self
            .inner
            .build_set(
                &configuration,
                SetRole::Volatile,
                UniformTarget::Session(recorder.uniform_session()),
            )
            .map_err(|err| warn!("{}: unable to build volatile set: {err}", self.inner.name))
            .ok()?;

        Some(VolatileContext {
            configuration,
            recorder: recorder.id(),
            set: Arc::new(set),
        })
    }
}

impl Debug for Technique {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Technique")
            .field("name", &self.inner.name)
            .field("revision", &self.revision())
            .finish()
    }
}
