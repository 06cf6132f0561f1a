//! Image resource types

use {
    super::{
        access::{AccessHistory, LayoutState},
        format_aspect_mask, next_resource_id, Driver, DriverError,
    },
    crate::cmd::Ownership,
    ash::vk,
    derive_builder::{Builder, UninitializedFieldError},
    log::trace,
    parking_lot::{Mutex, MutexGuard},
    std::{
        collections::{hash_map::Entry, HashMap},
        fmt::{Debug, Formatter},
        ops::Deref,
        sync::Arc,
        thread::panicking,
    },
};

#[cfg(debug_assertions)]
fn assert_aspect_mask_supported(aspect_mask: vk::ImageAspectFlags) {
    use vk::ImageAspectFlags as A;

    const COLOR: A = A::COLOR;
    const DEPTH: A = A::DEPTH;
    const DEPTH_STENCIL: A = A::from_raw(A::DEPTH.as_raw() | A::STENCIL.as_raw());
    const STENCIL: A = A::STENCIL;

    assert!(matches!(
        aspect_mask,
        COLOR | DEPTH | DEPTH_STENCIL | STENCIL
    ));
}

/// A rectangular sub-range of an image: a set of aspects over a contiguous range of mip levels
/// and array layers.
///
/// Slices with a zero level or layer count, or no aspects, are empty. An empty slice is contained
/// by every slice and intersects none.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct ImageSlice {
    pub aspect_mask: vk::ImageAspectFlags,
    pub base_mip_level: u32,
    pub level_count: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
}

impl ImageSlice {
    pub const fn new(
        aspect_mask: vk::ImageAspectFlags,
        base_mip_level: u32,
        level_count: u32,
        base_array_layer: u32,
        layer_count: u32,
    ) -> Self {
        Self {
            aspect_mask,
            base_mip_level,
            level_count,
            base_array_layer,
            layer_count,
        }
    }

    /// Specifies every subresource of an image created with `info`.
    pub const fn whole(info: &ImageInfo) -> Self {
        Self::new(
            format_aspect_mask(info.fmt),
            0,
            info.mip_level_count,
            0,
            info.array_layer_count,
        )
    }

    /// Returns this slice narrowed to a single mip level.
    pub const fn level(self, mip_level: u32) -> Self {
        Self {
            base_mip_level: mip_level,
            level_count: 1,
            ..self
        }
    }

    pub fn is_empty(&self) -> bool {
        self.level_count == 0 || self.layer_count == 0 || self.aspect_mask.is_empty()
    }

    /// Returns `true` if every subresource of `other` is also part of this slice.
    pub fn contains(&self, other: &Self) -> bool {
        if other.is_empty() {
            return true;
        }

        self.aspect_mask.contains(other.aspect_mask)
            && self.base_array_layer <= other.base_array_layer
            && self.base_array_layer + self.layer_count
                >= other.base_array_layer + other.layer_count
            && self.base_mip_level <= other.base_mip_level
            && self.base_mip_level + self.level_count >= other.base_mip_level + other.level_count
    }

    /// Returns `true` if this slice and `other` share at least one subresource.
    pub fn intersects(&self, other: &Self) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }

        self.aspect_mask.intersects(other.aspect_mask)
            && self.base_array_layer < other.base_array_layer + other.layer_count
            && self.base_array_layer + self.layer_count > other.base_array_layer
            && self.base_mip_level < other.base_mip_level + other.level_count
            && self.base_mip_level + self.level_count > other.base_mip_level
    }

    /// Returns the smallest slice containing both this slice and `other`.
    pub fn bounding(&self, other: &Self) -> Self {
        if self.is_empty() {
            return *other;
        } else if other.is_empty() {
            return *self;
        }

        let base_mip_level = self.base_mip_level.min(other.base_mip_level);
        let end_mip_level = (self.base_mip_level + self.level_count)
            .max(other.base_mip_level + other.level_count);
        let base_array_layer = self.base_array_layer.min(other.base_array_layer);
        let end_array_layer = (self.base_array_layer + self.layer_count)
            .max(other.base_array_layer + other.layer_count);

        Self {
            aspect_mask: self.aspect_mask | other.aspect_mask,
            base_mip_level,
            level_count: end_mip_level - base_mip_level,
            base_array_layer,
            layer_count: end_array_layer - base_array_layer,
        }
    }

    /// Replaces `vk::REMAINING_MIP_LEVELS` and `vk::REMAINING_ARRAY_LAYERS` with concrete counts.
    pub fn resolve(mut self, info: &ImageInfo) -> Self {
        if self.level_count == vk::REMAINING_MIP_LEVELS {
            debug_assert!(self.base_mip_level < info.mip_level_count);

            self.level_count = info.mip_level_count - self.base_mip_level;
        }

        if self.layer_count == vk::REMAINING_ARRAY_LAYERS {
            debug_assert!(self.base_array_layer < info.array_layer_count);

            self.layer_count = info.array_layer_count - self.base_array_layer;
        }

        debug_assert!(self.base_mip_level + self.level_count <= info.mip_level_count);
        debug_assert!(self.base_array_layer + self.layer_count <= info.array_layer_count);

        self
    }
}

impl From<ImageSlice> for vk::ImageSubresourceRange {
    fn from(slice: ImageSlice) -> Self {
        Self {
            aspect_mask: slice.aspect_mask,
            base_mip_level: slice.base_mip_level,
            level_count: slice.level_count,
            base_array_layer: slice.base_array_layer,
            layer_count: slice.layer_count,
        }
    }
}

impl From<vk::ImageSubresourceRange> for ImageSlice {
    fn from(range: vk::ImageSubresourceRange) -> Self {
        Self {
            aspect_mask: range.aspect_mask,
            base_mip_level: range.base_mip_level,
            level_count: range.level_count,
            base_array_layer: range.base_array_layer,
            layer_count: range.layer_count,
        }
    }
}

impl From<ImageViewInfo> for ImageSlice {
    fn from(info: ImageViewInfo) -> Self {
        Self {
            aspect_mask: info.aspect_mask,
            base_mip_level: info.base_mip_level,
            level_count: info.mip_level_count,
            base_array_layer: info.base_array_layer,
            layer_count: info.array_layer_count,
        }
    }
}

/// Synchronization state of an image as of the last submission that used it.
#[derive(Debug)]
pub(crate) struct ImageState {
    pub owner: Ownership,

    /// `None` until the image has been used by a submission.
    pub layout: Option<LayoutState>,

    pub last_access: AccessHistory,
}

/// Smart pointer handle to an image object.
///
/// Also contains information about the object.
///
/// ## `Deref` behavior
///
/// `Image` automatically dereferences to [`vk::Image`] (via the [`Deref`] trait). The methods of
/// `Image` itself are associated functions, called using fully qualified syntax.
pub struct Image {
    driver: Arc<dyn Driver>,
    id: u64,
    image: vk::Image,
    image_view_cache: Mutex<HashMap<ImageViewInfo, vk::ImageView>>,
    owned: bool,
    state: Mutex<ImageState>,

    /// Information used to create this object.
    pub info: ImageInfo,

    /// A name for debugging purposes.
    pub name: Option<String>,
}

impl Image {
    /// Creates a new image using the given driver.
    #[profiling::function]
    pub fn create(
        driver: &Arc<dyn Driver>,
        info: impl Into<ImageInfo>,
    ) -> Result<Self, DriverError> {
        let info: ImageInfo = info.into();

        trace!("create");

        assert!(
            !info.usage.is_empty(),
            "Unspecified image usage {:?}",
            info.usage
        );

        let image = driver.create_image(&info)?;

        debug_assert_ne!(image, vk::Image::null());

        Ok(Self::new(driver, image, info, true))
    }

    /// Wraps an image created by some other library.
    ///
    /// Every subresource must be in `info.default_layout`; the first use transitions from there
    /// and keeps the contents. The image is not destroyed on drop, unlike images created through
    /// [`Image::create`].
    #[profiling::function]
    pub fn from_raw(
        driver: &Arc<dyn Driver>,
        image: vk::Image,
        info: impl Into<ImageInfo>,
    ) -> Self {
        Self::new(driver, image, info.into(), false)
    }

    fn new(driver: &Arc<dyn Driver>, image: vk::Image, info: ImageInfo, owned: bool) -> Self {
        #[cfg(debug_assertions)]
        assert_aspect_mask_supported(format_aspect_mask(info.fmt));

        Self {
            driver: Arc::clone(driver),
            id: next_resource_id(),
            image,
            image_view_cache: Mutex::new(Default::default()),
            owned,
            state: Mutex::new(ImageState {
                owner: Ownership::Unowned,
                // Imported images may hold contents, so they start out in their default layout
                layout: (!owned)
                    .then(|| LayoutState::new(ImageSlice::whole(&info), info.default_layout)),
                last_access: AccessHistory::new(ImageSlice::whole(&info)),
            }),
            info,
            name: None,
        }
    }

    pub(crate) fn id(this: &Self) -> u64 {
        this.id
    }

    /// Returns the layout tracked for `slice` as of the last submission which used this image.
    ///
    /// Returns `None` if an image created by this crate has not been used yet or if `slice` does
    /// not have a single layout.
    pub fn layout(this: &Self, slice: ImageSlice) -> Option<vk::ImageLayout> {
        this.state
            .lock()
            .layout
            .as_ref()
            .and_then(|layout| layout.layout_of(&slice))
    }

    pub(crate) fn state(this: &Self) -> MutexGuard<'_, ImageState> {
        this.state.lock()
    }

    /// Returns a view of this image, creating it on first request.
    #[profiling::function]
    pub fn view(
        this: &Self,
        info: impl Into<ImageViewInfo>,
    ) -> Result<vk::ImageView, DriverError> {
        let mut info: ImageViewInfo = info.into();

        if info.mip_level_count == vk::REMAINING_MIP_LEVELS {
            info.mip_level_count = this.info.mip_level_count - info.base_mip_level;
        }

        if info.array_layer_count == vk::REMAINING_ARRAY_LAYERS {
            info.array_layer_count = this.info.array_layer_count - info.base_array_layer;
        }

        let mut image_view_cache = this.image_view_cache.lock();

        Ok(match image_view_cache.entry(info) {
            Entry::Occupied(entry) => *entry.get(),
            Entry::Vacant(entry) => {
                *entry.insert(this.driver.create_image_view(this.image, &info)?)
            }
        })
    }

    pub fn whole(this: &Self) -> ImageSlice {
        ImageSlice::whole(&this.info)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl Debug for Image {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(name) = &self.name {
            write!(f, "{} ({:?})", name, self.image)
        } else {
            write!(f, "{:?}", self.image)
        }
    }
}

impl Deref for Image {
    type Target = vk::Image;

    fn deref(&self) -> &Self::Target {
        &self.image
    }
}

impl Drop for Image {
    #[profiling::function]
    fn drop(&mut self) {
        if panicking() {
            return;
        }

        for (_, view) in self.image_view_cache.get_mut().drain() {
            self.driver.destroy_image_view(view);
        }

        // Images from some other library are not ours to destroy
        if self.owned {
            self.driver.destroy_image(self.image);
        }
    }
}

/// Information used to create an [`Image`] instance.
#[derive(Builder, Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[builder(
    build_fn(private, name = "fallible_build", error = "ImageInfoBuilderError"),
    derive(Copy, Clone, Debug),
    pattern = "owned"
)]
#[non_exhaustive]
pub struct ImageInfo {
    /// The number of layers in the image.
    #[builder(default = "1", setter(strip_option))]
    pub array_layer_count: u32,

    /// When `true` (the default) layouts are chosen by the access tracker; otherwise the image is
    /// always used in `default_layout` and only memory dependencies are tracked.
    #[builder(default = "true")]
    pub automatic_layout: bool,

    /// The layout untouched subresources are kept in between uses.
    ///
    /// The default value is [`vk::ImageLayout::GENERAL`].
    #[builder(default = "vk::ImageLayout::GENERAL")]
    pub default_layout: vk::ImageLayout,

    /// Image extent of the Z axis, when describing a three dimensional image.
    #[builder(setter(strip_option))]
    pub depth: u32,

    /// A bitmask of describing additional parameters of the image.
    #[builder(default, setter(strip_option))]
    pub flags: vk::ImageCreateFlags,

    /// The format and type of the texel blocks that will be contained in the image.
    #[builder(setter(strip_option))]
    pub fmt: vk::Format,

    /// Image extent of the Y axis, when describing a two or three dimensional image.
    #[builder(setter(strip_option))]
    pub height: u32,

    /// The number of levels of detail available for minified sampling of the image.
    #[builder(default = "1", setter(strip_option))]
    pub mip_level_count: u32,

    /// Specifies the number of samples per texel.
    #[builder(default = "SampleCount::Type1", setter(strip_option))]
    pub sample_count: SampleCount,

    /// Specifies the tiling arrangement of the texel blocks in memory.
    ///
    /// The default value is [`vk::ImageTiling::OPTIMAL`].
    #[builder(default = "vk::ImageTiling::OPTIMAL", setter(strip_option))]
    pub tiling: vk::ImageTiling,

    /// The basic dimensionality of the image.
    ///
    /// Layers in array textures do not count as a dimension for the purposes of the image type.
    #[builder(setter(strip_option))]
    pub ty: vk::ImageType,

    /// A bitmask of describing the intended usage of the image.
    #[builder(default, setter(strip_option))]
    pub usage: vk::ImageUsageFlags,

    /// Image extent of the X axis.
    #[builder(setter(strip_option))]
    pub width: u32,
}

impl ImageInfo {
    /// A single-level, single-layer two-dimensional image using automatic layouts.
    pub const fn image_2d(
        width: u32,
        height: u32,
        fmt: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> ImageInfo {
        Self {
            array_layer_count: 1,
            automatic_layout: true,
            default_layout: vk::ImageLayout::GENERAL,
            depth: 1,
            flags: vk::ImageCreateFlags::empty(),
            fmt,
            height,
            mip_level_count: 1,
            sample_count: SampleCount::Type1,
            tiling: vk::ImageTiling::OPTIMAL,
            ty: vk::ImageType::TYPE_2D,
            usage,
            width,
        }
    }

    /// Provides an `ImageViewInfo` for this format, type, aspect, array elements, and mip levels.
    pub fn default_view_info(self) -> ImageViewInfo {
        self.into()
    }

    /// The layout an operation preferring `layout` uses this image in.
    pub fn layout_for(self, layout: vk::ImageLayout) -> vk::ImageLayout {
        if self.automatic_layout {
            layout
        } else {
            self.default_layout
        }
    }

    /// Converts an `ImageInfo` into an `ImageInfoBuilder`.
    #[inline(always)]
    pub fn to_builder(self) -> ImageInfoBuilder {
        ImageInfoBuilder {
            array_layer_count: Some(self.array_layer_count),
            automatic_layout: Some(self.automatic_layout),
            default_layout: Some(self.default_layout),
            depth: Some(self.depth),
            flags: Some(self.flags),
            fmt: Some(self.fmt),
            height: Some(self.height),
            mip_level_count: Some(self.mip_level_count),
            sample_count: Some(self.sample_count),
            tiling: Some(self.tiling),
            ty: Some(self.ty),
            usage: Some(self.usage),
            width: Some(self.width),
        }
    }
}

impl From<ImageInfoBuilder> for ImageInfo {
    fn from(info: ImageInfoBuilder) -> Self {
        info.build()
    }
}

impl ImageInfoBuilder {
    /// Builds a new `ImageInfo`.
    ///
    /// # Panics
    ///
    /// If any of the following functions have not been called this function will panic:
    ///
    /// * `ty`
    /// * `fmt`
    /// * `width`
    /// * `height`
    /// * `depth`
    #[inline(always)]
    pub fn build(self) -> ImageInfo {
        match self.fallible_build() {
            Err(ImageInfoBuilderError(err)) => panic!("{err}"),
            Ok(info) => info,
        }
    }
}

#[derive(Debug)]
struct ImageInfoBuilderError(UninitializedFieldError);

impl From<UninitializedFieldError> for ImageInfoBuilderError {
    fn from(err: UninitializedFieldError) -> Self {
        Self(err)
    }
}

/// Information used to reinterpret an existing [`Image`] instance.
#[derive(Builder, Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[builder(
    build_fn(private, name = "fallible_build", error = "ImageViewInfoBuilderError"),
    derive(Clone, Copy, Debug),
    pattern = "owned"
)]
#[non_exhaustive]
pub struct ImageViewInfo {
    /// The number of layers that will be contained in the view.
    ///
    /// The default value is `vk::REMAINING_ARRAY_LAYERS`.
    #[builder(default = "vk::REMAINING_ARRAY_LAYERS")]
    pub array_layer_count: u32,

    /// The portion of the image that will be contained in the view.
    pub aspect_mask: vk::ImageAspectFlags,

    /// The first array layer that will be contained in the view.
    #[builder(default)]
    pub base_array_layer: u32,

    /// The first mip level that will be contained in the view.
    #[builder(default)]
    pub base_mip_level: u32,

    /// The format and type of the texel blocks that will be contained in the view.
    pub fmt: vk::Format,

    /// The number of mip levels that will be contained in the view.
    ///
    /// The default value is `vk::REMAINING_MIP_LEVELS`.
    #[builder(default = "vk::REMAINING_MIP_LEVELS")]
    pub mip_level_count: u32,

    /// The basic dimensionality of the view.
    pub ty: vk::ImageViewType,
}

impl ImageViewInfo {
    /// Specifies a default view with the given `fmt` and `ty` values.
    ///
    /// # Note
    ///
    /// Automatically sets [`aspect_mask`](Self::aspect_mask) to a suggested value.
    #[inline(always)]
    pub const fn new(fmt: vk::Format, ty: vk::ImageViewType) -> ImageViewInfo {
        Self {
            array_layer_count: vk::REMAINING_ARRAY_LAYERS,
            aspect_mask: format_aspect_mask(fmt),
            base_array_layer: 0,
            base_mip_level: 0,
            fmt,
            mip_level_count: vk::REMAINING_MIP_LEVELS,
            ty,
        }
    }

    /// Converts a `ImageViewInfo` into a `ImageViewInfoBuilder`.
    #[inline(always)]
    pub fn to_builder(self) -> ImageViewInfoBuilder {
        ImageViewInfoBuilder {
            array_layer_count: Some(self.array_layer_count),
            aspect_mask: Some(self.aspect_mask),
            base_array_layer: Some(self.base_array_layer),
            base_mip_level: Some(self.base_mip_level),
            fmt: Some(self.fmt),
            mip_level_count: Some(self.mip_level_count),
            ty: Some(self.ty),
        }
    }
}

impl From<ImageInfo> for ImageViewInfo {
    fn from(info: ImageInfo) -> Self {
        Self {
            array_layer_count: info.array_layer_count,
            aspect_mask: format_aspect_mask(info.fmt),
            base_array_layer: 0,
            base_mip_level: 0,
            fmt: info.fmt,
            mip_level_count: info.mip_level_count,
            ty: match (info.ty, info.array_layer_count) {
                (vk::ImageType::TYPE_1D, 1) => vk::ImageViewType::TYPE_1D,
                (vk::ImageType::TYPE_1D, _) => vk::ImageViewType::TYPE_1D_ARRAY,
                (vk::ImageType::TYPE_2D, 1) => vk::ImageViewType::TYPE_2D,
                (vk::ImageType::TYPE_2D, 6)
                    if info.flags.contains(vk::ImageCreateFlags::CUBE_COMPATIBLE) =>
                {
                    vk::ImageViewType::CUBE
                }
                (vk::ImageType::TYPE_2D, _)
                    if info.flags.contains(vk::ImageCreateFlags::CUBE_COMPATIBLE)
                        && info.array_layer_count > 6 =>
                {
                    vk::ImageViewType::CUBE_ARRAY
                }
                (vk::ImageType::TYPE_2D, _) => vk::ImageViewType::TYPE_2D_ARRAY,
                _ => vk::ImageViewType::TYPE_3D,
            },
        }
    }
}

impl From<ImageViewInfoBuilder> for ImageViewInfo {
    fn from(info: ImageViewInfoBuilder) -> Self {
        info.build()
    }
}

impl ImageViewInfoBuilder {
    /// Builds a new 'ImageViewInfo'.
    ///
    /// # Panics
    ///
    /// If any of the following values have not been set this function will panic:
    ///
    /// * `ty`
    /// * `fmt`
    /// * `aspect_mask`
    #[inline(always)]
    pub fn build(self) -> ImageViewInfo {
        match self.fallible_build() {
            Err(ImageViewInfoBuilderError(err)) => panic!("{err}"),
            Ok(info) => info,
        }
    }
}

#[derive(Debug)]
struct ImageViewInfoBuilderError(UninitializedFieldError);

impl From<UninitializedFieldError> for ImageViewInfoBuilderError {
    fn from(err: UninitializedFieldError) -> Self {
        Self(err)
    }
}

/// Specifies sample counts supported for an image used for storage operation.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum SampleCount {
    /// Single image sample. This is the usual mode.
    #[default]
    Type1,

    /// Multiple image samples.
    Type2,

    /// Multiple image samples.
    Type4,

    /// Multiple image samples.
    Type8,

    /// Multiple image samples.
    Type16,

    /// Multiple image samples.
    Type32,

    /// Multiple image samples.
    Type64,
}

impl SampleCount {
    /// Returns `true` when the value represents a single sample mode.
    pub fn is_single(self) -> bool {
        matches!(self, Self::Type1)
    }
}

impl From<SampleCount> for vk::SampleCountFlags {
    fn from(sample_count: SampleCount) -> Self {
        match sample_count {
            SampleCount::Type1 => Self::TYPE_1,
            SampleCount::Type2 => Self::TYPE_2,
            SampleCount::Type4 => Self::TYPE_4,
            SampleCount::Type8 => Self::TYPE_8,
            SampleCount::Type16 => Self::TYPE_16,
            SampleCount::Type32 => Self::TYPE_32,
            SampleCount::Type64 => Self::TYPE_64,
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::driver::mock::MockDriver, std::ops::Range};

    fn slice(
        aspect_mask: vk::ImageAspectFlags,
        array_layers: Range<u32>,
        mip_levels: Range<u32>,
    ) -> ImageSlice {
        ImageSlice::new(
            aspect_mask,
            mip_levels.start,
            mip_levels.len() as _,
            array_layers.start,
            array_layers.len() as _,
        )
    }

    #[test]
    pub fn image_info_defaults() {
        let info = ImageInfo::image_2d(
            4,
            4,
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::SAMPLED,
        );

        assert!(info.automatic_layout);
        assert_eq!(info.default_layout, vk::ImageLayout::GENERAL);
        assert_eq!(info, info.to_builder().build());
    }

    #[test]
    pub fn image_info_view_types() {
        let info = ImageInfo::image_2d(
            42,
            42,
            vk::Format::R32_SFLOAT,
            vk::ImageUsageFlags::SAMPLED,
        );

        assert_eq!(info.default_view_info().ty, vk::ImageViewType::TYPE_2D);

        let layers = info.to_builder().array_layer_count(3).build();

        assert_eq!(layers.default_view_info().ty, vk::ImageViewType::TYPE_2D_ARRAY);

        let cube = info
            .to_builder()
            .array_layer_count(6)
            .flags(vk::ImageCreateFlags::CUBE_COMPATIBLE)
            .build();

        assert_eq!(cube.default_view_info().ty, vk::ImageViewType::CUBE);
        assert_eq!(cube.default_view_info().array_layer_count, 6);
    }

    #[test]
    pub fn image_info_builder() {
        let info = ImageInfo::image_2d(
            23,
            64,
            vk::Format::R32_SFLOAT,
            vk::ImageUsageFlags::SAMPLED,
        );
        let builder = ImageInfoBuilder::default()
            .ty(vk::ImageType::TYPE_2D)
            .fmt(vk::Format::R32_SFLOAT)
            .width(23)
            .height(64)
            .depth(1)
            .usage(vk::ImageUsageFlags::SAMPLED)
            .build();

        assert_eq!(info, builder);
    }

    #[test]
    #[should_panic(expected = "Field not initialized: depth")]
    pub fn image_info_builder_uninit_depth() {
        ImageInfoBuilder::default().build();
    }

    #[test]
    #[should_panic(expected = "Field not initialized: fmt")]
    pub fn image_info_builder_uninit_fmt() {
        ImageInfoBuilder::default().depth(1).build();
    }

    #[test]
    #[should_panic(expected = "Field not initialized: ty")]
    pub fn image_info_builder_uninit_ty() {
        ImageInfoBuilder::default()
            .depth(1)
            .fmt(vk::Format::default())
            .height(2)
            .build();
    }

    #[test]
    pub fn image_slice_contains() {
        use {slice as i, vk::ImageAspectFlags as A};

        assert!(i(A::COLOR, 0..1, 0..1).contains(&i(A::COLOR, 0..1, 0..1)));
        assert!(i(A::COLOR, 0..2, 0..1).contains(&i(A::COLOR, 0..1, 0..1)));
        assert!(i(A::COLOR, 0..1, 0..2).contains(&i(A::COLOR, 0..1, 0..1)));
        assert!(i(A::COLOR, 0..2, 0..2).contains(&i(A::COLOR, 0..1, 0..1)));
        assert!(!i(A::COLOR, 0..1, 1..3).contains(&i(A::COLOR, 0..1, 0..1)));
        assert!(!i(A::COLOR, 1..3, 0..1).contains(&i(A::COLOR, 0..1, 0..1)));
        assert!(!i(A::COLOR, 0..1, 1..3).contains(&i(A::COLOR, 0..1, 0..2)));
        assert!(!i(A::COLOR, 1..3, 0..1).contains(&i(A::COLOR, 0..2, 0..1)));
        assert!(!i(A::DEPTH, 0..1, 0..1).contains(&i(A::DEPTH | A::STENCIL, 0..1, 0..1)));
    }

    #[test]
    pub fn image_slice_intersects() {
        use {slice as i, vk::ImageAspectFlags as A};

        assert!(i(A::COLOR, 0..1, 0..1).intersects(&i(A::COLOR, 0..1, 0..1)));
        assert!(!i(A::COLOR, 0..1, 0..1).intersects(&i(A::DEPTH, 0..1, 0..1)));

        assert!(!i(A::COLOR, 0..1, 0..1).intersects(&i(A::COLOR, 1..2, 0..1)));
        assert!(!i(A::COLOR, 0..1, 0..1).intersects(&i(A::COLOR, 0..1, 1..2)));
        assert!(!i(A::COLOR, 1..2, 1..2).intersects(&i(A::COLOR, 0..1, 0..1)));

        assert!(i(A::DEPTH | A::STENCIL, 2..3, 3..5).intersects(&i(A::DEPTH, 2..3, 2..4)));
        assert!(i(A::DEPTH | A::STENCIL, 2..3, 3..5).intersects(&i(A::DEPTH, 2..3, 4..6)));
        assert!(!i(A::DEPTH | A::STENCIL, 2..3, 3..5).intersects(&i(A::DEPTH, 2..3, 2..3)));
        assert!(!i(A::DEPTH | A::STENCIL, 2..3, 3..5).intersects(&i(A::DEPTH, 2..3, 5..6)));
    }

    #[test]
    pub fn image_slice_empty() {
        use {slice as i, vk::ImageAspectFlags as A};

        let empty = i(A::COLOR, 0..0, 0..1);
        let other = i(A::COLOR, 0..4, 0..4);

        assert!(empty.is_empty());
        assert!(other.contains(&empty));
        assert!(!other.intersects(&empty));
        assert!(!empty.intersects(&other));
        assert!(!empty.intersects(&empty));
        assert!(!i(A::empty(), 0..1, 0..1).intersects(&other));
    }

    #[test]
    pub fn image_slice_bounding() {
        use {slice as i, vk::ImageAspectFlags as A};

        assert_eq!(
            i(A::COLOR, 0..1, 2..3).bounding(&i(A::COLOR, 3..4, 0..1)),
            i(A::COLOR, 0..4, 0..3)
        );
        assert_eq!(
            i(A::COLOR, 0..0, 0..0).bounding(&i(A::COLOR, 1..2, 1..2)),
            i(A::COLOR, 1..2, 1..2)
        );
    }

    #[test]
    pub fn image_slice_resolve() {
        let info = ImageInfo::image_2d(8, 8, vk::Format::R8_UNORM, vk::ImageUsageFlags::SAMPLED)
            .to_builder()
            .array_layer_count(3)
            .mip_level_count(4)
            .build();
        let slice = ImageSlice::new(
            vk::ImageAspectFlags::COLOR,
            1,
            vk::REMAINING_MIP_LEVELS,
            1,
            vk::REMAINING_ARRAY_LAYERS,
        )
        .resolve(&info);

        assert_eq!(slice.level_count, 3);
        assert_eq!(slice.layer_count, 2);
    }

    #[test]
    pub fn image_view_cache() {
        let driver: Arc<dyn Driver> = Arc::new(MockDriver::default());
        let image = Image::create(
            &driver,
            ImageInfo::image_2d(
                8,
                8,
                vk::Format::R8G8B8A8_UNORM,
                vk::ImageUsageFlags::SAMPLED,
            ),
        )
        .unwrap();

        let a = Image::view(&image, image.info).unwrap();
        let b = Image::view(&image, image.info).unwrap();

        assert_eq!(a, b);
        assert!(Image::layout(&image, Image::whole(&image)).is_none());
    }

    #[test]
    pub fn image_view_info() {
        let info = ImageViewInfo::new(vk::Format::default(), vk::ImageViewType::TYPE_1D);
        let builder = info.to_builder().build();

        assert_eq!(info, builder);
    }

    #[test]
    #[should_panic(expected = "Field not initialized: aspect_mask")]
    pub fn image_view_info_builder_uninit_aspect_mask() {
        ImageViewInfoBuilder::default().build();
    }
}
