//! Reflection-driven technique configuration.

use {
    super::{
        desc::{PassDesc, TechniqueDesc},
        reflect::{
            BindingReflection, DescriptorCount, ReflectedType, ScalarKind, ShaderCompiler,
            StructType,
        },
        variants::{variant_count, weights, Variants},
    },
    crate::driver::{
        ComputePipelineDesc, DescriptorSetLayoutBinding, Driver, DriverError,
        GraphicPipelineDesc, Sampler, SamplerDesc, ShaderCode,
    },
    ash::vk,
    log::{debug, trace, warn},
    parking_lot::RwLock,
    std::{
        collections::{BTreeMap, HashMap},
        error::Error,
        fmt::{Debug, Display, Formatter},
        sync::Arc,
        thread::panicking,
    },
};

/// The purpose of a descriptor set, which is also its set index.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum SetRole {
    /// Shared by techniques; cached like [`SetRole::Static`].
    Common = 0,

    /// Resources which rarely change; cached until the technique revision moves.
    Static = 1,

    /// Resources which change per draw.
    Volatile = 2,
}

impl SetRole {
    pub const ALL: [Self; 3] = [Self::Common, Self::Static, Self::Volatile];

    pub fn from_set(set: u32) -> Option<Self> {
        Self::ALL.get(set as usize).copied()
    }

    pub fn set(self) -> u32 {
        self as u32
    }

    pub fn is_cached(self) -> bool {
        !matches!(self, Self::Volatile)
    }
}

/// A non-uniform-block descriptor binding.
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceDesc {
    pub name: String,
    pub role: SetRole,
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub stages: vk::ShaderStageFlags,
    pub writable: bool,
    pub count: u32,
    pub default_sampler: Option<SamplerDesc>,
}

/// A uniform block and its flattened variables.
#[derive(Clone, Debug, PartialEq)]
pub struct UniformBufferDesc {
    pub name: String,
    pub role: SetRole,
    pub binding: u32,
    pub stages: vk::ShaderStageFlags,
    pub size: u32,
    pub variables: Vec<UniformVariableDesc>,
}

/// One leaf variable of a uniform block, such as `Lights.items[2].color`.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct UniformVariableDesc {
    pub name: String,
    pub offset: u32,
    pub size: u32,
    pub kind: ScalarKind,

    /// Components per column; `1` for scalars.
    pub rows: u32,

    /// `1` for scalars and vectors.
    pub columns: u32,

    /// Byte distance between matrix columns.
    pub matrix_stride: u32,

    /// `0` when not an array.
    pub array_len: u32,
    pub array_stride: u32,

    /// `false` for shapes which cannot be set, such as multi-dimensional arrays.
    pub supported: bool,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum PipelineKind {
    Graphics,
    Compute,
}

impl PipelineKind {
    pub fn bind_point(self) -> vk::PipelineBindPoint {
        match self {
            Self::Graphics => vk::PipelineBindPoint::GRAPHICS,
            Self::Compute => vk::PipelineBindPoint::COMPUTE,
        }
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct PassMetadata {
    pub name: String,
    pub kind: PipelineKind,

    /// The selections this pass uses, in technique declaration order.
    pub selections: Vec<String>,
    pub weights: Vec<usize>,
    pub variant_count: usize,
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SelectionMetadata {
    pub name: String,
    pub variants: Vec<String>,
}

impl SelectionMetadata {
    pub fn index_of(&self, variant: &str) -> Option<usize> {
        self.variants.iter().position(|name| name == variant)
    }
}

/// Everything about a configuration except driver objects.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigurationMetadata {
    pub name: String,
    pub passes: Vec<PassMetadata>,
    pub resources: Vec<ResourceDesc>,
    pub selections: Vec<SelectionMetadata>,

    /// Descriptor set layout bindings per role, sorted by binding.
    pub sets: BTreeMap<SetRole, Vec<DescriptorSetLayoutBinding>>,
    pub uniform_buffers: Vec<UniformBufferDesc>,
}

impl ConfigurationMetadata {
    pub fn pass(&self, name: &str) -> Option<(usize, &PassMetadata)> {
        self.passes
            .iter()
            .enumerate()
            .find(|(_, pass)| pass.name == name)
    }

    pub fn resource(&self, name: &str) -> Option<&ResourceDesc> {
        self.resources.iter().find(|resource| resource.name == name)
    }

    pub fn selection(&self, name: &str) -> Option<&SelectionMetadata> {
        self.selections
            .iter()
            .find(|selection| selection.name == name)
    }

    pub fn uniform_buffer(&self, name: &str) -> Option<&UniformBufferDesc> {
        self.uniform_buffers.iter().find(|block| block.name == name)
    }

    /// The variable named `name` and the block holding it.
    pub fn uniform_variable(&self, name: &str) -> Option<(&UniformBufferDesc, &UniformVariableDesc)> {
        self.uniform_buffers.iter().find_map(|block| {
            block
                .variables
                .iter()
                .find(|variable| variable.name == name)
                .map(|variable| (block, variable))
        })
    }

    /// The role of the resource or uniform block named `name`, if any.
    pub fn role_of(&self, name: &str) -> Option<SetRole> {
        self.resource(name)
            .map(|resource| resource.role)
            .or_else(|| self.uniform_buffer(name).map(|block| block.role))
    }
}

/// An immutable, built technique: metadata plus layouts, pipelines and default samplers.
pub struct TechniqueConfiguration {
    default_samplers: HashMap<String, Arc<Sampler>>,
    driver: Arc<dyn Driver>,
    pipeline_layout: vk::PipelineLayout,
    pipelines: Vec<Vec<vk::Pipeline>>,
    set_layouts: Vec<vk::DescriptorSetLayout>,

    pub metadata: ConfigurationMetadata,
}

impl TechniqueConfiguration {
    fn new(driver: &Arc<dyn Driver>, metadata: ConfigurationMetadata) -> Self {
        Self {
            default_samplers: HashMap::new(),
            driver: Arc::clone(driver),
            pipeline_layout: vk::PipelineLayout::null(),
            pipelines: vec![],
            set_layouts: vec![],
            metadata,
        }
    }

    pub fn default_sampler(&self, resource: &str) -> Option<&Arc<Sampler>> {
        self.default_samplers.get(resource)
    }

    pub fn pipeline(&self, pass: usize, variant: usize) -> Option<vk::Pipeline> {
        self.pipelines.get(pass)?.get(variant).copied()
    }

    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }

    /// Layouts of sets `0..n`; roles without bindings have an empty layout when a higher set is
    /// used.
    pub fn set_layouts(&self) -> &[vk::DescriptorSetLayout] {
        &self.set_layouts
    }

    pub fn variant_count(&self, pass: usize) -> usize {
        self.pipelines.get(pass).map(Vec::len).unwrap_or_default()
    }
}

impl Debug for TechniqueConfiguration {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TechniqueConfiguration")
            .field("name", &self.metadata.name)
            .field("pipeline_layout", &self.pipeline_layout)
            .finish()
    }
}

impl Drop for TechniqueConfiguration {
    #[profiling::function]
    fn drop(&mut self) {
        if panicking() {
            return;
        }

        for pipeline in self.pipelines.drain(..).flatten() {
            self.driver.destroy_pipeline(pipeline);
        }

        if self.pipeline_layout != vk::PipelineLayout::null() {
            self.driver.destroy_pipeline_layout(self.pipeline_layout);
        }

        for layout in self.set_layouts.drain(..) {
            self.driver.destroy_descriptor_set_layout(layout);
        }
    }
}

#[derive(Debug)]
pub enum ConfigurationError {
    /// A pass has no shaders, or a graphics pass has no vertex shader.
    MissingShaderStage { technique: String, pass: String },

    /// A pass mixes compute with other stages or repeats a stage.
    InvalidShaderStages {
        technique: String,
        pass: String,
        file: String,
    },

    /// Two shaders disagree about a descriptor binding.
    BindingMismatch {
        technique: String,
        pass: String,
        file: String,
        set: u32,
        binding: u32,
    },

    /// A runtime-sized array or descriptor array.
    UnsupportedResource {
        technique: String,
        pass: String,
        file: String,
        name: String,
    },

    UnsupportedSet {
        technique: String,
        pass: String,
        file: String,
        set: u32,
    },

    DuplicateSelection { technique: String, selection: String },

    /// A pass uses a selection the technique does not declare.
    UnknownSelection {
        technique: String,
        pass: String,
        selection: String,
    },

    /// A selection without variants.
    EmptySelection { technique: String, selection: String },

    DuplicatePass { technique: String, pass: String },

    Compile {
        technique: String,
        pass: String,
        file: String,
        source: Box<dyn Error + Send + Sync>,
    },

    Driver {
        technique: String,
        pass: String,
        source: DriverError,
    },
}

impl Display for ConfigurationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingShaderStage { technique, pass } => {
                write!(f, "{technique}/{pass}: missing shader stage")
            }
            Self::InvalidShaderStages {
                technique,
                pass,
                file,
            } => write!(f, "{technique}/{pass} ({file}): invalid shader stages"),
            Self::BindingMismatch {
                technique,
                pass,
                file,
                set,
                binding,
            } => write!(
                f,
                "{technique}/{pass} ({file}): binding {set}.{binding} does not match other shaders"
            ),
            Self::UnsupportedResource {
                technique,
                pass,
                file,
                name,
            } => write!(f, "{technique}/{pass} ({file}): unsupported resource `{name}`"),
            Self::UnsupportedSet {
                technique,
                pass,
                file,
                set,
            } => write!(f, "{technique}/{pass} ({file}): unsupported descriptor set {set}"),
            Self::DuplicateSelection {
                technique,
                selection,
            } => write!(f, "{technique}: duplicate selection `{selection}`"),
            Self::UnknownSelection {
                technique,
                pass,
                selection,
            } => write!(f, "{technique}/{pass}: unknown selection `{selection}`"),
            Self::EmptySelection {
                technique,
                selection,
            } => write!(f, "{technique}: selection `{selection}` has no variants"),
            Self::DuplicatePass { technique, pass } => {
                write!(f, "{technique}/{pass}: duplicate pass")
            }
            Self::Compile {
                technique,
                pass,
                file,
                source,
            } => write!(f, "{technique}/{pass} ({file}): {source}"),
            Self::Driver {
                technique,
                pass,
                source,
            } => write!(f, "{technique}/{pass}: {source}"),
        }
    }
}

impl Error for ConfigurationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Compile { source, .. } => Some(source.as_ref()),
            Self::Driver { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Builds technique configurations and publishes the latest one.
///
/// Techniques poll [`Configurator::revision`] and re-point to the new configuration when it
/// moves. A failed build publishes no configuration, which techniques treat as "not ready".
pub struct Configurator {
    compiler: Arc<dyn ShaderCompiler>,
    driver: Arc<dyn Driver>,
    slot: RwLock<(u64, Option<Arc<TechniqueConfiguration>>)>,
}

impl Configurator {
    pub fn new(driver: &Arc<dyn Driver>, compiler: Arc<dyn ShaderCompiler>) -> Arc<Self> {
        Arc::new(Self {
            compiler,
            driver: Arc::clone(driver),
            slot: RwLock::new((0, None)),
        })
    }

    pub fn configuration(&self) -> Option<Arc<TechniqueConfiguration>> {
        self.slot.read().1.clone()
    }

    /// Incremented by every call to [`Self::rebuild`].
    pub fn revision(&self) -> u64 {
        self.slot.read().0
    }

    pub(super) fn snapshot(&self) -> (u64, Option<Arc<TechniqueConfiguration>>) {
        self.slot.read().clone()
    }

    pub(crate) fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Compiles every variant of `desc` and publishes the result.
    #[profiling::function]
    pub fn rebuild(
        &self,
        desc: &TechniqueDesc,
    ) -> Result<Arc<TechniqueConfiguration>, ConfigurationError> {
        debug!("building technique {}", desc.name);

        let res = build(&self.driver, self.compiler.as_ref(), desc).map(Arc::new);
        let mut slot = self.slot.write();
        slot.0 += 1;

        match &res {
            Ok(configuration) => {
                debug!(
                    "built technique {}: {} pipelines",
                    desc.name,
                    configuration.pipelines.iter().map(Vec::len).sum::<usize>()
                );

                slot.1 = Some(Arc::clone(configuration));
            }
            Err(err) => {
                warn!("{err}");

                slot.1 = None;
            }
        }

        res
    }
}

impl Debug for Configurator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Configurator")
            .field("revision", &self.revision())
            .finish()
    }
}

/// A binding merged across every shader which uses it.
struct MergedBinding {
    block: Option<(u32, Vec<UniformVariableDesc>)>,
    reflection: BindingReflection,
    stages: vk::ShaderStageFlags,
}

fn build(
    driver: &Arc<dyn Driver>,
    compiler: &dyn ShaderCompiler,
    desc: &TechniqueDesc,
) -> Result<TechniqueConfiguration, ConfigurationError> {
    let technique = || desc.name.clone();

    let mut selections = Vec::with_capacity(desc.selections.len());

    for selection in &desc.selections {
        if selections
            .iter()
            .any(|other: &SelectionMetadata| other.name == selection.name)
        {
            return Err(ConfigurationError::DuplicateSelection {
                technique: technique(),
                selection: selection.name.clone(),
            });
        }

        if selection.variants.is_empty() {
            return Err(ConfigurationError::EmptySelection {
                technique: technique(),
                selection: selection.name.clone(),
            });
        }

        selections.push(SelectionMetadata {
            name: selection.name.clone(),
            variants: selection.variants.clone(),
        });
    }

    let mut passes = Vec::with_capacity(desc.passes.len());

    for pass in &desc.passes {
        if passes
            .iter()
            .any(|other: &PassMetadata| other.name == pass.name)
        {
            return Err(ConfigurationError::DuplicatePass {
                technique: technique(),
                pass: pass.name.clone(),
            });
        }

        for name in &pass.selections {
            if !selections.iter().any(|selection| &selection.name == name) {
                return Err(ConfigurationError::UnknownSelection {
                    technique: technique(),
                    pass: pass.name.clone(),
                    selection: name.clone(),
                });
            }
        }

        let used = selections
            .iter()
            .filter(|selection| pass.selections.contains(&selection.name))
            .collect::<Vec<_>>();
        let counts = used
            .iter()
            .map(|selection| selection.variants.len())
            .collect::<Vec<_>>();

        passes.push(PassMetadata {
            name: pass.name.clone(),
            kind: pipeline_kind(&desc.name, pass)?,
            selections: used.iter().map(|selection| selection.name.clone()).collect(),
            weights: weights(&counts),
            variant_count: variant_count(&counts),
        });
    }

    // Compile every variant of every pass, merging reflected bindings
    let mut bindings = BTreeMap::<(u32, u32), MergedBinding>::new();
    let mut shaders = Vec::with_capacity(passes.len());

    for (pass, metadata) in desc.passes.iter().zip(&passes) {
        profiling::scope!("compile pass");

        let used = metadata
            .selections
            .iter()
            .filter_map(|name| selections.iter().find(|selection| &selection.name == name))
            .collect::<Vec<_>>();
        let counts = used
            .iter()
            .map(|selection| selection.variants.len())
            .collect::<Vec<_>>();
        let mut pass_shaders = Vec::with_capacity(metadata.variant_count);

        for values in Variants::new(&counts) {
            let mut defines = pass.defines.clone();

            for (selection, &value) in used.iter().zip(&values) {
                for (index, variant) in selection.variants.iter().enumerate() {
                    defines.push((variant.clone(), index.to_string()));
                }

                defines.push((selection.name.clone(), value.to_string()));
            }

            let mut variant_shaders = Vec::with_capacity(pass.shaders.len());

            for shader in &pass.shaders {
                trace!("compile {} {:?} {:?}", shader.file, shader.stage, values);

                let compiled = compiler
                    .compile(&shader.file, shader.stage, &defines)
                    .map_err(|source| ConfigurationError::Compile {
                        technique: technique(),
                        pass: pass.name.clone(),
                        file: shader.file.clone(),
                        source,
                    })?;

                for binding in compiled.reflection.bindings {
                    merge_binding(
                        &mut bindings,
                        binding,
                        shader.stage,
                        |err| err.into_error(technique(), pass.name.clone(), shader.file.clone()),
                    )?;
                }

                variant_shaders.push(ShaderCode {
                    stage: shader.stage,
                    spirv: compiled.spirv,
                });
            }

            pass_shaders.push(variant_shaders);
        }

        shaders.push(pass_shaders);
    }

    // Split merged bindings into resources and uniform blocks
    let mut resources = vec![];
    let mut sets = BTreeMap::<SetRole, Vec<DescriptorSetLayoutBinding>>::new();
    let mut uniform_buffers = vec![];

    for ((set, binding), merged) in bindings {
        let role = SetRole::from_set(set).unwrap_or(SetRole::Volatile);
        let count = merged.reflection.count.len().unwrap_or(1);

        sets.entry(role)
            .or_default()
            .push(DescriptorSetLayoutBinding {
                binding,
                ty: merged.reflection.ty,
                count,
                stages: merged.stages,
            });

        match merged.block {
            Some((size, variables)) if merged.reflection.ty == vk::DescriptorType::UNIFORM_BUFFER => {
                uniform_buffers.push(UniformBufferDesc {
                    name: merged.reflection.name,
                    role,
                    binding,
                    stages: merged.stages,
                    size,
                    variables,
                })
            }
            _ => resources.push(ResourceDesc {
                name: merged.reflection.name,
                role,
                binding,
                ty: merged.reflection.ty,
                stages: merged.stages,
                writable: merged.reflection.writable,
                count,
                default_sampler: None,
            }),
        }
    }

    for sampler in &desc.samplers {
        match resources
            .iter_mut()
            .find(|resource| resource.name == sampler.resource)
        {
            Some(resource) => resource.default_sampler = Some(sampler.sampler),
            None => warn!(
                "{}: default sampler for unknown resource `{}`",
                desc.name, sampler.resource
            ),
        }
    }

    let metadata = ConfigurationMetadata {
        name: desc.name.clone(),
        passes,
        resources,
        selections,
        sets,
        uniform_buffers,
    };

    // Driver objects; anything created before an error is destroyed when `res` drops
    let mut res = TechniqueConfiguration::new(driver, metadata);
    let driver_error = |pass: &str| {
        let pass = pass.to_owned();

        move |source| ConfigurationError::Driver {
            technique: technique(),
            pass,
            source,
        }
    };
    let first_pass = desc
        .passes
        .first()
        .map(|pass| pass.name.as_str())
        .unwrap_or_default();

    for resource in &res.metadata.resources {
        if let Some(desc) = resource.default_sampler {
            let sampler = Sampler::create(driver, desc).map_err(driver_error(first_pass))?;
            res.default_samplers
                .insert(resource.name.clone(), Arc::new(sampler));
        }
    }

    let set_count = res
        .metadata
        .sets
        .keys()
        .last()
        .map(|role| role.set() + 1)
        .unwrap_or_default();

    for set in 0..set_count {
        let bindings = SetRole::from_set(set)
            .and_then(|role| res.metadata.sets.get(&role))
            .map(Vec::as_slice)
            .unwrap_or_default();
        let layout = driver
            .create_descriptor_set_layout(bindings)
            .map_err(driver_error(first_pass))?;

        res.set_layouts.push(layout);
    }

    res.pipeline_layout = driver
        .create_pipeline_layout(&res.set_layouts)
        .map_err(driver_error(first_pass))?;

    for ((pass, metadata), pass_shaders) in desc.passes.iter().zip(&res.metadata.passes).zip(shaders) {
        profiling::scope!("create pipelines");

        let mut pipelines = Vec::with_capacity(pass_shaders.len());

        // Pipelines are created into `res` as they succeed so that a failure destroys them
        res.pipelines.push(vec![]);

        for shaders in pass_shaders {
            let pipeline = match metadata.kind {
                PipelineKind::Compute => {
                    let shader = shaders
                        .into_iter()
                        .next()
                        .ok_or_else(|| ConfigurationError::MissingShaderStage {
                            technique: technique(),
                            pass: pass.name.clone(),
                        })?;

                    driver.create_compute_pipeline(&ComputePipelineDesc {
                        layout: res.pipeline_layout,
                        shader,
                    })
                }
                PipelineKind::Graphics => driver.create_graphic_pipeline(&GraphicPipelineDesc {
                    layout: res.pipeline_layout,
                    shaders,
                    state: pass.state.clone(),
                }),
            };

            match pipeline {
                Ok(pipeline) => pipelines.push(pipeline),
                Err(err) => {
                    if let Some(created) = res.pipelines.last_mut() {
                        created.append(&mut pipelines);
                    }

                    return Err(driver_error(&pass.name)(err));
                }
            }
        }

        if let Some(created) = res.pipelines.last_mut() {
            *created = pipelines;
        }
    }

    Ok(res)
}

fn pipeline_kind(technique: &str, pass: &PassDesc) -> Result<PipelineKind, ConfigurationError> {
    let missing = || ConfigurationError::MissingShaderStage {
        technique: technique.to_owned(),
        pass: pass.name.clone(),
    };
    let invalid = |file: &str| ConfigurationError::InvalidShaderStages {
        technique: technique.to_owned(),
        pass: pass.name.clone(),
        file: file.to_owned(),
    };

    if pass.shaders.is_empty() {
        return Err(missing());
    }

    let mut stages = vk::ShaderStageFlags::empty();

    for shader in &pass.shaders {
        if shader.stage.as_raw().count_ones() != 1 || stages.intersects(shader.stage) {
            return Err(invalid(&shader.file));
        }

        stages |= shader.stage;
    }

    if stages.contains(vk::ShaderStageFlags::COMPUTE) {
        if stages != vk::ShaderStageFlags::COMPUTE {
            return Err(invalid(&pass.shaders[0].file));
        }

        Ok(PipelineKind::Compute)
    } else if stages.contains(vk::ShaderStageFlags::VERTEX) {
        Ok(PipelineKind::Graphics)
    } else {
        Err(missing())
    }
}

/// A binding problem found before the offending pass and file are attached.
enum BindingError {
    Mismatch { set: u32, binding: u32 },
    Unsupported(String),
    Set(u32),
}

impl BindingError {
    fn into_error(self, technique: String, pass: String, file: String) -> ConfigurationError {
        match self {
            Self::Mismatch { set, binding } => ConfigurationError::BindingMismatch {
                technique,
                pass,
                file,
                set,
                binding,
            },
            Self::Unsupported(name) => ConfigurationError::UnsupportedResource {
                technique,
                pass,
                file,
                name,
            },
            Self::Set(set) => ConfigurationError::UnsupportedSet {
                technique,
                pass,
                file,
                set,
            },
        }
    }
}

fn merge_binding(
    bindings: &mut BTreeMap<(u32, u32), MergedBinding>,
    reflection: BindingReflection,
    stage: vk::ShaderStageFlags,
    err: impl FnOnce(BindingError) -> ConfigurationError,
) -> Result<(), ConfigurationError> {
    if SetRole::from_set(reflection.set).is_none() {
        return Err(err(BindingError::Set(reflection.set)));
    }

    if reflection.count == DescriptorCount::Unsized {
        return Err(err(BindingError::Unsupported(reflection.name)));
    }

    let key = (reflection.set, reflection.binding);

    if let Some(merged) = bindings.get_mut(&key) {
        if merged.reflection != reflection {
            return Err(err(BindingError::Mismatch {
                set: key.0,
                binding: key.1,
            }));
        }

        merged.stages |= stage;

        return Ok(());
    }

    let block = match &reflection.block {
        Some(block) if reflection.ty == vk::DescriptorType::UNIFORM_BUFFER => {
            let mut variables = vec![];

            flatten_struct(&reflection.name, 0, block, &mut variables)
                .map_err(|name| err(BindingError::Unsupported(name)))?;

            Some((block.size, variables))
        }
        _ => None,
    };

    bindings.insert(
        key,
        MergedBinding {
            block,
            reflection,
            stages: stage,
        },
    );

    Ok(())
}

/// Appends the leaf variables of `ty` named `prefix.member`; returns the name of a runtime-sized
/// member on failure.
fn flatten_struct(
    prefix: &str,
    base: u32,
    ty: &StructType,
    variables: &mut Vec<UniformVariableDesc>,
) -> Result<(), String> {
    for member in &ty.members {
        let name = format!("{prefix}.{}", member.name);

        flatten(name, base + member.offset, &member.ty, variables)?;
    }

    Ok(())
}

fn flatten(
    name: String,
    offset: u32,
    ty: &ReflectedType,
    variables: &mut Vec<UniformVariableDesc>,
) -> Result<(), String> {
    let Some(size) = ty.size() else {
        return Err(name);
    };

    let leaf = |kind: ScalarKind, rows: u32, columns: u32, matrix_stride: u32| UniformVariableDesc {
        name: name.clone(),
        offset,
        size,
        kind,
        rows,
        columns,
        matrix_stride,
        array_len: 0,
        array_stride: 0,
        supported: true,
    };

    match ty {
        ReflectedType::Scalar(kind) => variables.push(leaf(*kind, 1, 1, 0)),
        ReflectedType::Vector { kind, len } => variables.push(leaf(*kind, *len, 1, 0)),
        &ReflectedType::Matrix {
            kind,
            columns,
            rows,
            stride,
        } => variables.push(leaf(kind, rows, columns, stride)),
        ReflectedType::Struct(ty) => flatten_struct(&name, offset, ty, variables)?,
        ReflectedType::Array {
            element,
            len,
            stride,
        } => {
            let len = len.unwrap_or_default();

            match element.as_ref() {
                ReflectedType::Struct(ty) => {
                    for index in 0..len {
                        flatten_struct(
                            &format!("{name}[{index}]"),
                            offset + index * stride,
                            ty,
                            variables,
                        )?;
                    }
                }
                ReflectedType::Array { .. } => {
                    // Multi-dimensional arrays are kept as an opaque blob
                    element.size().ok_or_else(|| name.clone())?;

                    variables.push(UniformVariableDesc {
                        array_len: len,
                        array_stride: *stride,
                        supported: false,
                        ..leaf(ScalarKind::Float, 1, 1, 0)
                    });
                }
                element => {
                    let mut variable = Vec::with_capacity(1);

                    flatten(name.clone(), offset, element, &mut variable)?;

                    for variable in variable {
                        variables.push(UniformVariableDesc {
                            size,
                            array_len: len,
                            array_stride: *stride,
                            ..variable
                        });
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            driver::mock::{MockCall, MockDriver},
            technique::{
                desc::ShaderDesc,
                reflect::{CompiledShader, ShaderReflection, StructMember},
            },
        },
        parking_lot::Mutex,
    };

    /// Returns fixed reflection per file and records every compile.
    #[derive(Default)]
    struct TestCompiler {
        calls: Mutex<Vec<(String, Vec<(String, String)>)>>,
        reflections: HashMap<String, ShaderReflection>,
    }

    impl TestCompiler {
        fn with(mut self, file: &str, bindings: Vec<BindingReflection>) -> Self {
            self.reflections
                .insert(file.to_owned(), ShaderReflection { bindings });
            self
        }
    }

    impl ShaderCompiler for TestCompiler {
        fn compile(
            &self,
            file: &str,
            _stage: vk::ShaderStageFlags,
            defines: &[(String, String)],
        ) -> Result<CompiledShader, Box<dyn Error + Send + Sync>> {
            self.calls.lock().push((file.to_owned(), defines.to_vec()));

            let reflection = self
                .reflections
                .get(file)
                .cloned()
                .ok_or_else(|| format!("{file} not found"))?;

            Ok(CompiledShader {
                spirv: Arc::from([0x0723_0203u32]),
                reflection,
            })
        }
    }

    fn texture(set: u32, binding: u32, name: &str) -> BindingReflection {
        BindingReflection {
            set,
            binding,
            name: name.to_owned(),
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            count: DescriptorCount::Single,
            writable: false,
            block: None,
        }
    }

    fn block(set: u32, binding: u32, name: &str, members: Vec<StructMember>) -> BindingReflection {
        let size = members
            .iter()
            .map(|member| member.offset + member.ty.size().unwrap_or_default())
            .max()
            .unwrap_or_default();

        BindingReflection {
            set,
            binding,
            name: name.to_owned(),
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            count: DescriptorCount::Single,
            writable: false,
            block: Some(StructType { size, members }),
        }
    }

    fn member(name: &str, offset: u32, ty: ReflectedType) -> StructMember {
        StructMember {
            name: name.to_owned(),
            offset,
            ty,
        }
    }

    fn configurator(compiler: TestCompiler) -> (Arc<MockDriver>, Arc<Configurator>) {
        let mock = Arc::new(MockDriver::default());
        let driver: Arc<dyn Driver> = mock.clone();

        (mock, Configurator::new(&driver, Arc::new(compiler)))
    }

    fn sprite_compiler() -> TestCompiler {
        TestCompiler::default()
            .with(
                "sprite.vert",
                vec![block(
                    1,
                    0,
                    "Transform",
                    vec![member("world", 0, ReflectedType::mat(4, 4))],
                )],
            )
            .with("sprite.frag", vec![texture(1, 1, "image")])
    }

    #[test]
    pub fn selection_grid() {
        let (mock, configurator) = configurator(sprite_compiler());
        let desc = TechniqueDesc::new("sprite")
            .with_selection("a", ["a0", "a1"])
            .with_selection("b", ["b0", "b1", "b2"])
            .with_pass(
                PassDesc::graphics("main", "sprite.vert", "sprite.frag")
                    .selection("b")
                    .selection("a"),
            );

        let configuration = configurator.rebuild(&desc).unwrap();
        let (index, pass) = configuration.metadata.pass("main").unwrap();

        assert_eq!(pass.selections, vec!["a".to_owned(), "b".to_owned()]);
        assert_eq!(pass.weights, vec![1, 2]);
        assert_eq!(pass.variant_count, 6);
        assert_eq!(configuration.variant_count(index), 6);
        assert!(configuration.pipeline(index, 5).is_some());
        assert!(configuration.pipeline(index, 6).is_none());
        assert_eq!(
            mock.calls()
                .iter()
                .filter(|call| matches!(call, MockCall::CreateGraphicPipeline(..)))
                .count(),
            6
        );
        assert_eq!(configurator.revision(), 1);
    }

    #[test]
    pub fn selection_defines() {
        let compiler = Arc::new(
            TestCompiler::default().with("blur.comp", vec![texture(2, 0, "image")]),
        );
        let mock = Arc::new(MockDriver::default());
        let driver: Arc<dyn Driver> = mock;
        let configurator = Configurator::new(&driver, compiler.clone());

        configurator
            .rebuild(
                &TechniqueDesc::new("blur")
                    .with_selection("radius", ["SMALL", "LARGE"])
                    .with_pass(
                        PassDesc::compute("main", "blur.comp")
                            .selection("radius")
                            .define("TAPS", "9"),
                    ),
            )
            .unwrap();

        let calls = compiler.calls.lock();
        let define = |name: &str, value: &str| (name.to_owned(), value.to_owned());

        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[1].1,
            vec![
                define("TAPS", "9"),
                define("SMALL", "0"),
                define("LARGE", "1"),
                define("radius", "1"),
            ]
        );
    }

    #[test]
    pub fn bindings_merge_stages() {
        let compiler = sprite_compiler().with(
            "sprite.frag",
            vec![
                texture(1, 1, "image"),
                block(
                    1,
                    0,
                    "Transform",
                    vec![member("world", 0, ReflectedType::mat(4, 4))],
                ),
            ],
        );
        let (_, configurator) = configurator(compiler);
        let configuration = configurator
            .rebuild(
                &TechniqueDesc::new("sprite")
                    .with_pass(PassDesc::graphics("main", "sprite.vert", "sprite.frag")),
            )
            .unwrap();
        let metadata = &configuration.metadata;

        assert_eq!(
            metadata.uniform_buffer("Transform").unwrap().stages,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
        assert_eq!(metadata.role_of("image"), Some(SetRole::Static));
        assert_eq!(metadata.sets[&SetRole::Static].len(), 2);

        // Common is empty but still has a layout because set 1 is used
        assert_eq!(configuration.set_layouts().len(), 2);
    }

    #[test]
    pub fn binding_mismatch() {
        let compiler = sprite_compiler().with(
            "sprite.frag",
            vec![BindingReflection {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                ..texture(1, 0, "Transform")
            }],
        );
        let (mock, configurator) = configurator(compiler);
        let err = configurator
            .rebuild(
                &TechniqueDesc::new("sprite")
                    .with_pass(PassDesc::graphics("main", "sprite.vert", "sprite.frag")),
            )
            .unwrap_err();

        assert!(matches!(
            err,
            ConfigurationError::BindingMismatch {
                set: 1,
                binding: 0,
                ..
            }
        ));
        assert_eq!(
            err.to_string(),
            "sprite/main (sprite.frag): binding 1.0 does not match other shaders"
        );
        assert!(configurator.configuration().is_none());
        assert_eq!(configurator.revision(), 1);
        assert_eq!(mock.live_objects(), 0);
    }

    #[test]
    pub fn unsupported_set() {
        let compiler = TestCompiler::default().with("blur.comp", vec![texture(3, 0, "image")]);
        let (_, configurator) = configurator(compiler);
        let err = configurator
            .rebuild(&TechniqueDesc::new("blur").with_pass(PassDesc::compute("main", "blur.comp")))
            .unwrap_err();

        assert!(matches!(err, ConfigurationError::UnsupportedSet { set: 3, .. }));
    }

    #[test]
    pub fn unsized_arrays_unsupported() {
        let compiler = TestCompiler::default().with(
            "blur.comp",
            vec![BindingReflection {
                count: DescriptorCount::Unsized,
                ..texture(1, 0, "images")
            }],
        );
        let (_, configurator) = configurator(compiler);
        let err = configurator
            .rebuild(&TechniqueDesc::new("blur").with_pass(PassDesc::compute("main", "blur.comp")))
            .unwrap_err();

        assert!(
            matches!(err, ConfigurationError::UnsupportedResource { ref name, .. } if name == "images")
        );
    }

    #[test]
    pub fn shader_stage_errors() {
        let (_, configurator) = configurator(sprite_compiler());
        let rebuild = |pass: PassDesc| {
            configurator
                .rebuild(&TechniqueDesc::new("t").with_pass(pass))
                .unwrap_err()
        };

        assert!(matches!(
            rebuild(PassDesc::new("p").shaders(vec![]).build()),
            ConfigurationError::MissingShaderStage { .. }
        ));
        assert!(matches!(
            rebuild(
                PassDesc::new("p")
                    .shaders(vec![ShaderDesc::fragment("sprite.frag")])
                    .build()
            ),
            ConfigurationError::MissingShaderStage { .. }
        ));
        assert!(matches!(
            rebuild(
                PassDesc::new("p")
                    .shaders(vec![
                        ShaderDesc::compute("a.comp"),
                        ShaderDesc::vertex("sprite.vert"),
                    ])
                    .build()
            ),
            ConfigurationError::InvalidShaderStages { .. }
        ));
    }

    #[test]
    pub fn selection_errors() {
        let (_, configurator) = configurator(sprite_compiler());
        let pass = || PassDesc::graphics("main", "sprite.vert", "sprite.frag");

        assert!(matches!(
            configurator
                .rebuild(
                    &TechniqueDesc::new("t")
                        .with_selection("a", ["x"])
                        .with_selection("a", ["y"])
                        .with_pass(pass())
                )
                .unwrap_err(),
            ConfigurationError::DuplicateSelection { .. }
        ));
        assert!(matches!(
            configurator
                .rebuild(
                    &TechniqueDesc::new("t")
                        .with_selection("a", Vec::<String>::new())
                        .with_pass(pass())
                )
                .unwrap_err(),
            ConfigurationError::EmptySelection { .. }
        ));
        assert!(matches!(
            configurator
                .rebuild(&TechniqueDesc::new("t").with_pass(pass().selection("missing")))
                .unwrap_err(),
            ConfigurationError::UnknownSelection { .. }
        ));
        assert!(matches!(
            configurator
                .rebuild(&TechniqueDesc::new("t").with_pass(pass()).with_pass(pass()))
                .unwrap_err(),
            ConfigurationError::DuplicatePass { .. }
        ));
    }

    #[test]
    pub fn compile_error() {
        let (_, configurator) = configurator(TestCompiler::default());
        let err = configurator
            .rebuild(&TechniqueDesc::new("blur").with_pass(PassDesc::compute("main", "blur.comp")))
            .unwrap_err();

        assert_eq!(err.to_string(), "blur/main (blur.comp): blur.comp not found");
        assert!(err.source().is_some());
    }

    #[test]
    pub fn failed_pipelines_are_destroyed() {
        let (mock, configurator) = configurator(sprite_compiler());

        mock.set_fail_pipelines(true);

        let err = configurator
            .rebuild(
                &TechniqueDesc::new("sprite")
                    .with_sampler("image", SamplerDesc::LINEAR_REPEAT)
                    .with_pass(PassDesc::graphics("main", "sprite.vert", "sprite.frag")),
            )
            .unwrap_err();

        assert!(matches!(err, ConfigurationError::Driver { .. }));
        assert_eq!(mock.live_objects(), 0);
    }

    #[test]
    pub fn configuration_drop_destroys_objects() {
        let (mock, configurator) = configurator(sprite_compiler());
        let desc = TechniqueDesc::new("sprite")
            .with_sampler("image", SamplerDesc::LINEAR_REPEAT)
            .with_pass(PassDesc::graphics("main", "sprite.vert", "sprite.frag"));
        let configuration = configurator.rebuild(&desc).unwrap();

        assert!(configuration.default_sampler("image").is_some());
        assert_eq!(
            configuration.metadata.resource("image").unwrap().default_sampler,
            Some(SamplerDesc::LINEAR_REPEAT)
        );

        configurator.rebuild(&desc.clone().with_pass(PassDesc::new("broken").shaders(vec![]).build()))
            .unwrap_err();
        drop(configuration);

        assert_eq!(mock.live_objects(), 0);
    }

    #[test]
    pub fn rebuild_is_idempotent() {
        let (_, configurator) = configurator(sprite_compiler());
        let desc = TechniqueDesc::new("sprite")
            .with_selection("a", ["a0", "a1"])
            .with_pass(PassDesc::graphics("main", "sprite.vert", "sprite.frag").selection("a"));

        let first = configurator.rebuild(&desc).unwrap();
        let second = configurator.rebuild(&desc).unwrap();

        assert_eq!(first.metadata, second.metadata);
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(configurator.revision(), 2);
    }

    #[test]
    pub fn uniform_flattening() {
        let light = StructType {
            size: 32,
            members: vec![
                member("color", 0, ReflectedType::vec(3)),
                member("radius", 12, ReflectedType::Scalar(ScalarKind::Float)),
                member("position", 16, ReflectedType::vec(4)),
            ],
        };
        let compiler = TestCompiler::default().with(
            "lit.comp",
            vec![block(
                0,
                0,
                "Scene",
                vec![
                    member("count", 0, ReflectedType::Scalar(ScalarKind::Uint)),
                    member(
                        "weights",
                        16,
                        ReflectedType::array(ReflectedType::Scalar(ScalarKind::Float), 4, 16),
                    ),
                    member(
                        "lights",
                        80,
                        ReflectedType::array(ReflectedType::Struct(light), 2, 32),
                    ),
                    member(
                        "grid",
                        144,
                        ReflectedType::array(
                            ReflectedType::array(ReflectedType::vec(4), 2, 16),
                            2,
                            32,
                        ),
                    ),
                ],
            )],
        );
        let (_, configurator) = configurator(compiler);
        let configuration = configurator
            .rebuild(&TechniqueDesc::new("lit").with_pass(PassDesc::compute("main", "lit.comp")))
            .unwrap();
        let metadata = &configuration.metadata;
        let names = metadata.uniform_buffers[0]
            .variables
            .iter()
            .map(|variable| variable.name.as_str())
            .collect::<Vec<_>>();

        assert_eq!(
            names,
            vec![
                "Scene.count",
                "Scene.weights",
                "Scene.lights[0].color",
                "Scene.lights[0].radius",
                "Scene.lights[0].position",
                "Scene.lights[1].color",
                "Scene.lights[1].radius",
                "Scene.lights[1].position",
                "Scene.grid",
            ]
        );

        let (block, weights) = metadata.uniform_variable("Scene.weights").unwrap();

        assert_eq!(block.role, SetRole::Common);
        assert_eq!(weights.array_len, 4);
        assert_eq!(weights.array_stride, 16);
        assert_eq!(weights.size, 64);

        let (_, position) = metadata.uniform_variable("Scene.lights[1].position").unwrap();

        assert_eq!(position.offset, 128);
        assert_eq!(position.rows, 4);

        let (_, grid) = metadata.uniform_variable("Scene.grid").unwrap();

        assert!(!grid.supported);
        assert_eq!(grid.size, 64);
    }

    #[test]
    pub fn unsized_member_unsupported() {
        let compiler = TestCompiler::default().with(
            "lit.comp",
            vec![block(
                0,
                0,
                "Scene",
                vec![member(
                    "items",
                    0,
                    ReflectedType::Array {
                        element: Box::new(ReflectedType::vec(4)),
                        len: None,
                        stride: 16,
                    },
                )],
            )],
        );
        let (_, configurator) = configurator(compiler);
        let err = configurator
            .rebuild(&TechniqueDesc::new("lit").with_pass(PassDesc::compute("main", "lit.comp")))
            .unwrap_err();

        assert!(
            matches!(err, ConfigurationError::UnsupportedResource { ref name, .. } if name == "Scene.items")
        );
    }
}
