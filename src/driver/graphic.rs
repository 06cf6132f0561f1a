//! Fixed-function state of graphics passes

use {
    super::image::SampleCount,
    ash::vk,
    derive_builder::{Builder, UninitializedFieldError},
    ordered_float::OrderedFloat,
};

const RGBA: vk::ColorComponentFlags = vk::ColorComponentFlags::from_raw(
    vk::ColorComponentFlags::R.as_raw()
        | vk::ColorComponentFlags::G.as_raw()
        | vk::ColorComponentFlags::B.as_raw()
        | vk::ColorComponentFlags::A.as_raw(),
);

/// How a pass combines its output with the contents of every color attachment.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum BlendMode {
    /// Output replaces the attachment contents.
    #[default]
    Opaque,

    /// `src * src.a + dst * (1 - src.a)`
    Alpha,

    /// Color output already multiplied by its alpha: `src + dst * (1 - src.a)`
    PremultipliedAlpha,

    /// `src + dst`
    Additive,
}

impl From<BlendMode> for vk::PipelineColorBlendAttachmentState {
    fn from(mode: BlendMode) -> Self {
        let (src_color, dst_color) = match mode {
            BlendMode::Opaque => {
                return Self {
                    color_write_mask: RGBA,
                    ..Default::default()
                }
            }
            BlendMode::Alpha => (vk::BlendFactor::SRC_ALPHA, vk::BlendFactor::ONE_MINUS_SRC_ALPHA),
            BlendMode::PremultipliedAlpha => {
                (vk::BlendFactor::ONE, vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            }
            BlendMode::Additive => (vk::BlendFactor::ONE, vk::BlendFactor::ONE),
        };

        Self {
            blend_enable: vk::TRUE,
            src_color_blend_factor: src_color,
            dst_color_blend_factor: dst_color,
            color_blend_op: vk::BlendOp::ADD,
            src_alpha_blend_factor: vk::BlendFactor::ONE,
            dst_alpha_blend_factor: dst_color,
            alpha_blend_op: vk::BlendOp::ADD,
            color_write_mask: RGBA,
        }
    }
}

/// Depth test of a pass. Passes without one neither test nor write depth.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct DepthMode {
    pub compare_op: vk::CompareOp,
    pub write: bool,
}

impl DepthMode {
    /// Tests against depth left by earlier passes without changing it.
    pub const TEST: Self = Self {
        compare_op: vk::CompareOp::LESS_OR_EQUAL,
        write: false,
    };

    /// Tests and writes depth, as opaque geometry does.
    pub const WRITE: Self = Self {
        compare_op: vk::CompareOp::LESS,
        write: true,
    };
}

impl From<DepthMode> for vk::PipelineDepthStencilStateCreateInfo<'_> {
    fn from(mode: DepthMode) -> Self {
        Self::default()
            .depth_test_enable(true)
            .depth_write_enable(mode.write)
            .depth_compare_op(mode.compare_op)
    }
}

/// Constant and slope-scaled depth offsets, as used by shadow casters and decals.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct DepthBias {
    pub constant_factor: OrderedFloat<f32>,
    pub slope_factor: OrderedFloat<f32>,
}

impl DepthBias {
    pub fn new(constant_factor: f32, slope_factor: f32) -> Self {
        Self {
            constant_factor: OrderedFloat(constant_factor),
            slope_factor: OrderedFloat(slope_factor),
        }
    }
}

/// Specifies rasterization and input assembly state.
#[derive(Builder, Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[builder(
    build_fn(private, name = "fallible_build", error = "RasterModeBuilderError"),
    derive(Clone, Copy, Debug),
    pattern = "owned"
)]
#[non_exhaustive]
pub struct RasterMode {
    #[builder(default = "vk::CullModeFlags::BACK")]
    pub cull_mode: vk::CullModeFlags,

    /// Offsets applied to the depth of every fragment.
    #[builder(default, setter(strip_option))]
    pub depth_bias: Option<DepthBias>,

    #[builder(default = "vk::FrontFace::COUNTER_CLOCKWISE")]
    pub front_face: vk::FrontFace,

    #[builder(default = "vk::PolygonMode::FILL")]
    pub polygon_mode: vk::PolygonMode,

    /// Must match the sample count of the attachments rendered to.
    #[builder(default)]
    pub samples: SampleCount,

    #[builder(default = "vk::PrimitiveTopology::TRIANGLE_LIST")]
    pub topology: vk::PrimitiveTopology,
}

impl RasterMode {
    /// Back-face culled, filled, single-sampled triangle lists.
    pub const DEFAULT: Self = Self {
        cull_mode: vk::CullModeFlags::BACK,
        depth_bias: None,
        front_face: vk::FrontFace::COUNTER_CLOCKWISE,
        polygon_mode: vk::PolygonMode::FILL,
        samples: SampleCount::Type1,
        topology: vk::PrimitiveTopology::TRIANGLE_LIST,
    };

    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> RasterModeBuilder {
        RasterModeBuilder::default()
    }
}

impl Default for RasterMode {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl RasterModeBuilder {
    /// Builds a new `RasterMode`.
    #[inline(always)]
    pub fn build(self) -> RasterMode {
        match self.fallible_build() {
            Err(RasterModeBuilderError(err)) => panic!("{err}"),
            Ok(mode) => mode,
        }
    }
}

#[derive(Debug)]
struct RasterModeBuilderError(UninitializedFieldError);

impl From<UninitializedFieldError> for RasterModeBuilderError {
    fn from(err: UninitializedFieldError) -> Self {
        Self(err)
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct VertexBinding {
    pub binding: u32,
    pub stride: u32,
    pub input_rate: vk::VertexInputRate,
}

impl From<VertexBinding> for vk::VertexInputBindingDescription {
    fn from(binding: VertexBinding) -> Self {
        Self {
            binding: binding.binding,
            stride: binding.stride,
            input_rate: binding.input_rate,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub fmt: vk::Format,
    pub offset: u32,
}

impl From<VertexAttribute> for vk::VertexInputAttributeDescription {
    fn from(attribute: VertexAttribute) -> Self {
        Self {
            location: attribute.location,
            binding: attribute.binding,
            format: attribute.fmt,
            offset: attribute.offset,
        }
    }
}

#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct VertexInputState {
    pub bindings: Vec<VertexBinding>,
    pub attributes: Vec<VertexAttribute>,
}

impl VertexInputState {
    /// Adds a per-vertex buffer binding whose attributes are tightly packed in the given order.
    pub fn with_interleaved(mut self, binding: u32, formats: &[(u32, vk::Format)]) -> Self {
        let mut offset = 0;

        for &(location, fmt) in formats {
            self.attributes.push(VertexAttribute {
                location,
                binding,
                fmt,
                offset,
            });
            offset += format_size(fmt);
        }

        self.bindings.push(VertexBinding {
            binding,
            stride: offset,
            input_rate: vk::VertexInputRate::VERTEX,
        });
        self
    }
}

fn format_size(fmt: vk::Format) -> u32 {
    match fmt {
        vk::Format::R32_SFLOAT | vk::Format::R32_UINT | vk::Format::R8G8B8A8_UNORM => 4,
        vk::Format::R32G32_SFLOAT | vk::Format::R32G32_UINT => 8,
        vk::Format::R32G32B32_SFLOAT | vk::Format::R32G32B32_UINT => 12,
        vk::Format::R32G32B32A32_SFLOAT | vk::Format::R32G32B32A32_UINT => 16,
        _ => panic!("unsupported vertex format {fmt:?}"),
    }
}

/// Everything about a graphics pipeline other than its shaders and layout.
///
/// Pipelines render with dynamic rendering, so attachment formats are part of this state while
/// viewport and scissor are always dynamic.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct GraphicState {
    pub blend: BlendMode,
    pub color_formats: Vec<vk::Format>,
    pub depth: Option<DepthMode>,
    pub depth_format: Option<vk::Format>,
    pub raster: RasterMode,
    pub vertex_input: VertexInputState,
}

impl GraphicState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blend(mut self, blend: BlendMode) -> Self {
        self.blend = blend;
        self
    }

    pub fn with_color(mut self, fmt: vk::Format) -> Self {
        self.color_formats.push(fmt);
        self
    }

    pub fn with_depth(mut self, fmt: vk::Format, mode: DepthMode) -> Self {
        self.depth = Some(mode);
        self.depth_format = Some(fmt);
        self
    }

    pub fn with_raster(mut self, raster: RasterMode) -> Self {
        self.raster = raster;
        self
    }

    pub fn with_vertex_input(mut self, vertex_input: VertexInputState) -> Self {
        self.vertex_input = vertex_input;
        self
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::collections::HashSet};

    #[test]
    pub fn blend_mode_attachment_state() {
        let opaque = vk::PipelineColorBlendAttachmentState::from(BlendMode::Opaque);

        assert_eq!(opaque.blend_enable, vk::FALSE);
        assert_eq!(opaque.color_write_mask, RGBA);

        let alpha = vk::PipelineColorBlendAttachmentState::from(BlendMode::Alpha);

        assert_eq!(alpha.blend_enable, vk::TRUE);
        assert_eq!(alpha.src_color_blend_factor, vk::BlendFactor::SRC_ALPHA);
        assert_eq!(
            alpha.dst_color_blend_factor,
            vk::BlendFactor::ONE_MINUS_SRC_ALPHA
        );

        let premultiplied =
            vk::PipelineColorBlendAttachmentState::from(BlendMode::PremultipliedAlpha);

        assert_eq!(premultiplied.src_color_blend_factor, vk::BlendFactor::ONE);

        let additive = vk::PipelineColorBlendAttachmentState::from(BlendMode::Additive);

        assert_eq!(additive.dst_color_blend_factor, vk::BlendFactor::ONE);
        assert_eq!(additive.dst_alpha_blend_factor, vk::BlendFactor::ONE);
    }

    #[test]
    pub fn depth_mode_state() {
        let state = vk::PipelineDepthStencilStateCreateInfo::from(DepthMode::TEST);

        assert_eq!(state.depth_test_enable, vk::TRUE);
        assert_eq!(state.depth_write_enable, vk::FALSE);
        assert_eq!(state.depth_compare_op, vk::CompareOp::LESS_OR_EQUAL);
        assert_eq!(state.stencil_test_enable, vk::FALSE);
    }

    #[test]
    pub fn raster_mode_builder() {
        assert_eq!(RasterMode::new().build(), RasterMode::DEFAULT);

        let mode = RasterMode::new()
            .cull_mode(vk::CullModeFlags::NONE)
            .depth_bias(DepthBias::new(1.25, 1.75))
            .build();

        assert_eq!(mode.cull_mode, vk::CullModeFlags::NONE);
        assert_eq!(mode.depth_bias.map(|bias| bias.slope_factor.0), Some(1.75));
        assert_eq!(mode.polygon_mode, vk::PolygonMode::FILL);
    }

    #[test]
    pub fn interleaved_vertex_input() {
        let input = VertexInputState::default().with_interleaved(
            0,
            &[
                (0, vk::Format::R32G32B32_SFLOAT),
                (1, vk::Format::R32G32_SFLOAT),
                (2, vk::Format::R8G8B8A8_UNORM),
            ],
        );

        assert_eq!(input.bindings[0].stride, 24);
        assert_eq!(
            input
                .attributes
                .iter()
                .map(|attribute| attribute.offset)
                .collect::<Vec<_>>(),
            vec![0, 12, 20]
        );
    }

    #[test]
    pub fn graphic_state_keys_pipelines() {
        let opaque = GraphicState::new()
            .with_color(vk::Format::R8G8B8A8_UNORM)
            .with_depth(vk::Format::D32_SFLOAT, DepthMode::WRITE);
        let blended = opaque.clone().with_blend(BlendMode::Alpha);
        let biased = opaque
            .clone()
            .with_raster(RasterMode::new().depth_bias(DepthBias::new(1.0, 1.0)).build());

        let states = [opaque.clone(), blended, biased, opaque]
            .into_iter()
            .collect::<HashSet<_>>();

        assert_eq!(states.len(), 3);
    }
}
