//! Named runtime handles of a technique.

use {
    super::{config::UniformVariableDesc, reflect::ScalarKind, TechniqueInner},
    crate::driver::{Buffer, Image, ImageViewInfo, Sampler},
    ash::vk,
    glam::{IVec2, IVec3, IVec4, Mat2, Mat3, Mat4, UVec2, UVec3, UVec4, Vec2, Vec3, Vec4},
    log::warn,
    parking_lot::Mutex,
    std::{
        fmt::{Debug, Formatter},
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    },
};

/// A value which can be written into a uniform block variable.
///
/// Values are packed tightly, column-major; matrix columns are re-strided when written.
pub trait UniformValue {
    const KIND: ScalarKind;

    /// Components per column.
    const ROWS: u32;
    const COLUMNS: u32;

    fn to_bytes(&self) -> Vec<u8>;
}

macro_rules! uniform_value {
    ($($ty:ty => $kind:ident, $rows:literal, $columns:literal;)*) => {
        $(
            impl UniformValue for $ty {
                const KIND: ScalarKind = ScalarKind::$kind;
                const ROWS: u32 = $rows;
                const COLUMNS: u32 = $columns;

                fn to_bytes(&self) -> Vec<u8> {
                    bytemuck::bytes_of(self).to_vec()
                }
            }
        )*
    };
}

uniform_value! {
    f32 => Float, 1, 1;
    f64 => Double, 1, 1;
    i32 => Int, 1, 1;
    u32 => Uint, 1, 1;
    [f32; 2] => Float, 2, 1;
    [f32; 3] => Float, 3, 1;
    [f32; 4] => Float, 4, 1;
    Vec2 => Float, 2, 1;
    Vec3 => Float, 3, 1;
    Vec4 => Float, 4, 1;
    IVec2 => Int, 2, 1;
    IVec3 => Int, 3, 1;
    IVec4 => Int, 4, 1;
    UVec2 => Uint, 2, 1;
    UVec3 => Uint, 3, 1;
    UVec4 => Uint, 4, 1;
    Mat2 => Float, 2, 2;
    Mat3 => Float, 3, 3;
    Mat4 => Float, 4, 4;
}

impl UniformValue for bool {
    const KIND: ScalarKind = ScalarKind::Bool;
    const ROWS: u32 = 1;
    const COLUMNS: u32 = 1;

    fn to_bytes(&self) -> Vec<u8> {
        u32::from(*self).to_ne_bytes().to_vec()
    }
}

/// The value of one uniform variable; one element unless set as an array.
#[derive(Clone, Debug, PartialEq)]
pub(super) struct UniformData {
    columns: u32,
    elements: Vec<Vec<u8>>,
    kind: ScalarKind,
    rows: u32,
}

impl UniformData {
    fn new<T: UniformValue>(values: &[T]) -> Self {
        Self {
            columns: T::COLUMNS,
            elements: values.iter().map(T::to_bytes).collect(),
            kind: T::KIND,
            rows: T::ROWS,
        }
    }

    /// Writes this value into the block bytes `out`; returns `false` if the shapes differ.
    pub fn write(&self, desc: &UniformVariableDesc, out: &mut [u8]) -> bool {
        if !desc.supported
            || desc.kind != self.kind
            || desc.rows != self.rows
            || desc.columns != self.columns
        {
            return false;
        }

        let element_count = desc.array_len.max(1) as usize;
        let column_size = (desc.rows * desc.kind.size()) as usize;
        let column_stride = if desc.columns > 1 {
            desc.matrix_stride as usize
        } else {
            column_size
        };

        for (index, element) in self.elements.iter().take(element_count).enumerate() {
            let base = desc.offset as usize + index * desc.array_stride as usize;

            for (column, src) in element.chunks_exact(column_size).enumerate() {
                let start = base + column * column_stride;

                if let Some(dst) = out.get_mut(start..start + column_size) {
                    dst.copy_from_slice(src);
                }
            }
        }

        true
    }
}

#[derive(Debug)]
pub(super) struct UniformSlot {
    pub name: String,
    pub value: Mutex<Option<UniformData>>,
}

/// A uniform block variable of a technique, such as `Material.color`.
#[derive(Clone)]
pub struct UniformVariable {
    slot: Arc<UniformSlot>,
    technique: Arc<TechniqueInner>,
}

impl UniformVariable {
    pub(super) fn new(technique: &Arc<TechniqueInner>, slot: &Arc<UniformSlot>) -> Self {
        Self {
            slot: Arc::clone(slot),
            technique: Arc::clone(technique),
        }
    }

    pub fn name(&self) -> &str {
        &self.slot.name
    }

    pub fn is_set(&self) -> bool {
        self.slot.value.lock().is_some()
    }

    pub fn set<T: UniformValue>(&self, value: T) {
        self.replace(Some(UniformData::new(&[value])));
    }

    /// Sets the leading elements of an array variable.
    pub fn set_array<T: UniformValue>(&self, values: &[T]) {
        self.replace(Some(UniformData::new(values)));
    }

    pub fn clear(&self) {
        self.replace(None);
    }

    fn replace(&self, value: Option<UniformData>) {
        *self.slot.value.lock() = value;
        self.technique.touch_uniform(&self.slot.name);
    }
}

impl Debug for UniformVariable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("UniformVariable").field(&self.slot.name).finish()
    }
}

/// The value attached to a resource binding.
#[derive(Clone, Debug, Default)]
pub(super) struct ResourceValue {
    pub buffer: Option<(Arc<Buffer>, vk::DeviceSize, vk::DeviceSize)>,
    pub image: Option<(Arc<Image>, ImageViewInfo)>,
    pub sampler: Option<Arc<Sampler>>,
}

#[derive(Debug)]
pub(super) struct ResourceSlot {
    pub name: String,
    pub value: Mutex<ResourceValue>,
}

/// A named image, buffer, or sampler binding of a technique.
///
/// Uniform blocks may also be bound to a buffer by block name, replacing their variables.
/// Descriptor arrays are filled with the attached value.
#[derive(Clone)]
pub struct ResourceBinding {
    slot: Arc<ResourceSlot>,
    technique: Arc<TechniqueInner>,
}

impl ResourceBinding {
    pub(super) fn new(technique: &Arc<TechniqueInner>, slot: &Arc<ResourceSlot>) -> Self {
        Self {
            slot: Arc::clone(slot),
            technique: Arc::clone(technique),
        }
    }

    pub fn name(&self) -> &str {
        &self.slot.name
    }

    /// Binds every mip level and layer of `image`.
    pub fn set_image(&self, image: &Arc<Image>) {
        self.set_image_view(image, image.info.default_view_info());
    }

    pub fn set_image_view(&self, image: &Arc<Image>, view_info: impl Into<ImageViewInfo>) {
        self.update(|value| {
            value.buffer = None;
            value.image = Some((Arc::clone(image), view_info.into()));
        });
    }

    pub fn set_buffer(&self, buffer: &Arc<Buffer>) {
        self.set_buffer_range(buffer, 0, vk::WHOLE_SIZE);
    }

    pub fn set_buffer_range(
        &self,
        buffer: &Arc<Buffer>,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) {
        self.update(|value| {
            value.buffer = Some((Arc::clone(buffer), offset, range));
            value.image = None;
        });
    }

    /// Sets the sampler of sampler and combined image sampler bindings, replacing any default.
    pub fn set_sampler(&self, sampler: &Arc<Sampler>) {
        self.update(|value| value.sampler = Some(Arc::clone(sampler)));
    }

    pub fn clear(&self) {
        self.update(|value| *value = ResourceValue::default());
    }

    fn update(&self, f: impl FnOnce(&mut ResourceValue)) {
        f(&mut self.slot.value.lock());
        self.technique.touch_resource(&self.slot.name);
    }
}

impl Debug for ResourceBinding {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ResourceBinding").field(&self.slot.name).finish()
    }
}

#[derive(Debug)]
pub(super) struct SelectionSlot {
    pub name: String,
    pub value: AtomicUsize,
}

/// The current value of a named technique selection.
#[derive(Clone)]
pub struct Selection {
    slot: Arc<SelectionSlot>,
    technique: Arc<TechniqueInner>,
}

impl Selection {
    pub(super) fn new(technique: &Arc<TechniqueInner>, slot: &Arc<SelectionSlot>) -> Self {
        Self {
            slot: Arc::clone(slot),
            technique: Arc::clone(technique),
        }
    }

    pub fn name(&self) -> &str {
        &self.slot.name
    }

    /// Selects the variant named `variant`.
    ///
    /// Returns `false`, keeping the current value, if the technique is not configured or has no
    /// such variant.
    pub fn set(&self, variant: &str) -> bool {
        let index = self.technique.configuration().and_then(|configuration| {
            configuration
                .metadata
                .selection(&self.slot.name)
                .and_then(|selection| selection.index_of(variant))
        });

        match index {
            Some(index) => {
                self.set_index(index);

                true
            }
            None => {
                warn!("{}: unknown variant `{variant}`", self.slot.name);

                false
            }
        }
    }

    /// Selects a variant by index; out of range values refuse to bind.
    pub fn set_index(&self, index: usize) {
        self.slot.value.store(index, Ordering::Release);
    }

    pub fn value(&self) -> usize {
        self.slot.value.load(Ordering::Acquire)
    }
}

impl Debug for Selection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selection")
            .field("name", &self.slot.name)
            .field("value", &self.value())
            .finish()
    }
}

/// A named pass of a technique.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Pass {
    name: Arc<str>,
}

impl Pass {
    pub(super) fn new(name: &str) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
