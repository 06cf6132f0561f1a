//! Technique definitions, as supplied by a definition loader.

use {
    crate::driver::{GraphicState, SamplerDesc},
    ash::vk,
    derive_builder::{Builder, UninitializedFieldError},
};

/// Everything needed to build a technique configuration.
#[derive(Clone, Debug, Default)]
pub struct TechniqueDesc {
    pub name: String,
    pub passes: Vec<PassDesc>,

    /// Default samplers, attached by resource name.
    pub samplers: Vec<SamplerBindingDesc>,

    /// Declaration order decides the weight of each selection.
    pub selections: Vec<SelectionDesc>,
}

impl TechniqueDesc {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_pass(mut self, pass: impl Into<PassDesc>) -> Self {
        self.passes.push(pass.into());
        self
    }

    pub fn with_sampler(mut self, resource: impl Into<String>, sampler: SamplerDesc) -> Self {
        self.samplers.push(SamplerBindingDesc {
            resource: resource.into(),
            sampler,
        });
        self
    }

    pub fn with_selection<S>(mut self, name: impl Into<String>, variants: impl IntoIterator<Item = S>) -> Self
    where
        S: Into<String>,
    {
        self.selections.push(SelectionDesc {
            name: name.into(),
            variants: variants.into_iter().map(Into::into).collect(),
        });
        self
    }
}

/// A named compile-time enumeration.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SelectionDesc {
    pub name: String,

    /// Variant names; each is defined to its index when compiling.
    pub variants: Vec<String>,
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SamplerBindingDesc {
    pub resource: String,
    pub sampler: SamplerDesc,
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ShaderDesc {
    pub file: String,
    pub stage: vk::ShaderStageFlags,
}

impl ShaderDesc {
    pub fn new(stage: vk::ShaderStageFlags, file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            stage,
        }
    }

    pub fn vertex(file: impl Into<String>) -> Self {
        Self::new(vk::ShaderStageFlags::VERTEX, file)
    }

    pub fn fragment(file: impl Into<String>) -> Self {
        Self::new(vk::ShaderStageFlags::FRAGMENT, file)
    }

    pub fn compute(file: impl Into<String>) -> Self {
        Self::new(vk::ShaderStageFlags::COMPUTE, file)
    }
}

/// One named pass of a technique.
///
/// A pass with a compute shader is a compute pass and must have no other stage; any other pass
/// is a graphics pass and needs a vertex shader.
#[derive(Builder, Clone, Debug, PartialEq)]
#[builder(
    build_fn(private, name = "fallible_build", error = "PassDescBuilderError"),
    derive(Clone, Debug),
    pattern = "owned"
)]
#[non_exhaustive]
pub struct PassDesc {
    /// Extra `(name, value)` preprocessor definitions.
    #[builder(default)]
    pub defines: Vec<(String, String)>,

    #[builder(setter(into))]
    pub name: String,

    /// Names of the technique selections this pass is compiled against.
    #[builder(default)]
    pub selections: Vec<String>,

    pub shaders: Vec<ShaderDesc>,

    /// Fixed-function state of graphics passes.
    #[builder(default)]
    pub state: GraphicState,
}

impl PassDesc {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(name: impl Into<String>) -> PassDescBuilder {
        PassDescBuilder::default().name(name)
    }

    pub fn graphics(
        name: impl Into<String>,
        vertex: impl Into<String>,
        fragment: impl Into<String>,
    ) -> PassDescBuilder {
        Self::new(name).shaders(vec![ShaderDesc::vertex(vertex), ShaderDesc::fragment(fragment)])
    }

    pub fn compute(name: impl Into<String>, file: impl Into<String>) -> PassDescBuilder {
        Self::new(name).shaders(vec![ShaderDesc::compute(file)])
    }

    #[inline(always)]
    pub fn to_builder(self) -> PassDescBuilder {
        PassDescBuilder {
            defines: Some(self.defines),
            name: Some(self.name),
            selections: Some(self.selections),
            shaders: Some(self.shaders),
            state: Some(self.state),
        }
    }
}

impl From<PassDescBuilder> for PassDesc {
    fn from(desc: PassDescBuilder) -> Self {
        desc.build()
    }
}

impl PassDescBuilder {
    /// Builds a new `PassDesc`.
    ///
    /// # Panics
    ///
    /// If any of the following functions have not been called this function will panic:
    ///
    /// * `name`
    /// * `shaders`
    #[inline(always)]
    pub fn build(self) -> PassDesc {
        match self.fallible_build() {
            Err(PassDescBuilderError(err)) => panic!("{err}"),
            Ok(desc) => desc,
        }
    }

    pub fn define(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.defines
            .get_or_insert_with(Vec::new)
            .push((name.into(), value.into()));
        self
    }

    pub fn selection(mut self, name: impl Into<String>) -> Self {
        self.selections
            .get_or_insert_with(Vec::new)
            .push(name.into());
        self
    }
}

#[derive(Debug)]
struct PassDescBuilderError(UninitializedFieldError);

impl From<UninitializedFieldError> for PassDescBuilderError {
    fn from(err: UninitializedFieldError) -> Self {
        Self(err)
    }
}
