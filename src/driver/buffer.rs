//! Buffer resource types

use {
    super::{access::MemoryAccess, next_resource_id, Driver, DriverError},
    crate::cmd::Ownership,
    ash::vk,
    derive_builder::{Builder, UninitializedFieldError},
    log::trace,
    parking_lot::{Mutex, MutexGuard},
    std::{
        fmt::{Debug, Formatter},
        ops::Deref,
        sync::Arc,
        thread::panicking,
    },
};

/// Synchronization state of a buffer as of the last submission that used it.
#[derive(Debug)]
pub(crate) struct BufferState {
    pub owner: Ownership,
    pub last_access: MemoryAccess,
}

/// Smart pointer handle to a buffer object.
///
/// Buffers are tracked as a whole; accesses to disjoint ranges are still ordered.
pub struct Buffer {
    buffer: vk::Buffer,
    driver: Arc<dyn Driver>,
    id: u64,
    state: Mutex<BufferState>,

    /// Information used to create this object.
    pub info: BufferInfo,

    /// A name for debugging purposes.
    pub name: Option<String>,
}

impl Buffer {
    /// Creates a new buffer using the given driver.
    #[profiling::function]
    pub fn create(
        driver: &Arc<dyn Driver>,
        info: impl Into<BufferInfo>,
    ) -> Result<Self, DriverError> {
        let info = info.into();

        trace!("create: {:?}", info);

        debug_assert_ne!(info.size, 0, "Size must be non-zero");

        let buffer = driver.create_buffer(&info)?;

        Ok(Self {
            buffer,
            driver: Arc::clone(driver),
            id: next_resource_id(),
            state: Mutex::new(BufferState {
                owner: Ownership::Unowned,
                last_access: MemoryAccess::NONE,
            }),
            info,
            name: None,
        })
    }

    /// Creates a new mappable buffer holding `data`.
    #[profiling::function]
    pub fn create_from_slice(
        driver: &Arc<dyn Driver>,
        usage: vk::BufferUsageFlags,
        data: impl AsRef<[u8]>,
    ) -> Result<Self, DriverError> {
        let data = data.as_ref();
        let buffer = Self::create(
            driver,
            BufferInfo::new_mappable(data.len() as _, usage),
        )?;

        Self::write(&buffer, 0, data)?;

        Ok(buffer)
    }

    pub(crate) fn id(this: &Self) -> u64 {
        this.id
    }

    pub(crate) fn state(this: &Self) -> MutexGuard<'_, BufferState> {
        this.state.lock()
    }

    /// Copies `data` into this buffer from the host.
    ///
    /// The caller must make sure no pending GPU work uses the written range.
    ///
    /// # Panics
    ///
    /// Panics if the buffer was not created with [`BufferInfo::mappable`] or if the range does not
    /// fit.
    #[profiling::function]
    pub fn write(this: &Self, offset: vk::DeviceSize, data: &[u8]) -> Result<(), DriverError> {
        assert!(this.info.mappable, "Buffer is not mappable");
        assert!(
            offset + data.len() as vk::DeviceSize <= this.info.size,
            "Write out of bounds"
        );

        this.driver.write_buffer(this.buffer, offset, data)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl Debug for Buffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(name) = &self.name {
            write!(f, "{} ({:?})", name, self.buffer)
        } else {
            write!(f, "{:?}", self.buffer)
        }
    }
}

impl Deref for Buffer {
    type Target = vk::Buffer;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl Drop for Buffer {
    #[profiling::function]
    fn drop(&mut self) {
        if panicking() {
            return;
        }

        self.driver.destroy_buffer(self.buffer);
    }
}

/// Information used to create a [`Buffer`] instance.
#[derive(Builder, Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[builder(
    build_fn(private, name = "fallible_build", error = "BufferInfoBuilderError"),
    derive(Clone, Copy, Debug),
    pattern = "owned"
)]
#[non_exhaustive]
pub struct BufferInfo {
    /// Specifies a buffer whose memory is host visible and may be written with [`Buffer::write`].
    #[builder(default)]
    pub mappable: bool,

    /// Size in bytes of the buffer to be created.
    pub size: vk::DeviceSize,

    /// A bitmask specifying allowed usages of the buffer.
    pub usage: vk::BufferUsageFlags,
}

impl BufferInfo {
    /// Specifies a non-mappable buffer with the given `size` and `usage` values.
    #[inline(always)]
    pub const fn new(size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> BufferInfo {
        BufferInfo {
            mappable: false,
            size,
            usage,
        }
    }

    /// Specifies a mappable buffer with the given `size` and `usage` values.
    #[inline(always)]
    pub const fn new_mappable(size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> BufferInfo {
        BufferInfo {
            mappable: true,
            size,
            usage,
        }
    }

    /// Converts a `BufferInfo` into a `BufferInfoBuilder`.
    #[inline(always)]
    pub fn to_builder(self) -> BufferInfoBuilder {
        BufferInfoBuilder {
            mappable: Some(self.mappable),
            size: Some(self.size),
            usage: Some(self.usage),
        }
    }
}

impl BufferInfoBuilder {
    /// Builds a new `BufferInfo`.
    ///
    /// # Panics
    ///
    /// If any of the following values have not been set this function will panic:
    ///
    /// * `size`
    /// * `usage`
    #[inline(always)]
    pub fn build(self) -> BufferInfo {
        match self.fallible_build() {
            Err(BufferInfoBuilderError(err)) => panic!("{err}"),
            Ok(info) => info,
        }
    }
}

impl From<BufferInfoBuilder> for BufferInfo {
    fn from(info: BufferInfoBuilder) -> Self {
        info.build()
    }
}

#[derive(Debug)]
struct BufferInfoBuilderError(UninitializedFieldError);

impl From<UninitializedFieldError> for BufferInfoBuilderError {
    fn from(err: UninitializedFieldError) -> Self {
        Self(err)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::driver::mock::MockDriver};

    #[test]
    pub fn buffer_info() {
        let info = BufferInfo::new(0, vk::BufferUsageFlags::empty());
        let builder = info.to_builder().build();

        assert_eq!(info, builder);
    }

    #[test]
    pub fn buffer_info_builder() {
        let info = BufferInfo::new_mappable(42, vk::BufferUsageFlags::UNIFORM_BUFFER);
        let builder = BufferInfoBuilder::default()
            .size(42)
            .usage(vk::BufferUsageFlags::UNIFORM_BUFFER)
            .mappable(true)
            .build();

        assert_eq!(info, builder);
    }

    #[test]
    #[should_panic(expected = "Field not initialized: size")]
    pub fn buffer_info_builder_uninit_size() {
        BufferInfoBuilder::default().build();
    }

    #[test]
    #[should_panic(expected = "Field not initialized: usage")]
    pub fn buffer_info_builder_uninit_usage() {
        BufferInfoBuilder::default().size(1).build();
    }

    #[test]
    pub fn buffer_write() {
        let mock = Arc::new(MockDriver::default());
        let driver: Arc<dyn Driver> = mock.clone();
        let buffer =
            Buffer::create_from_slice(&driver, vk::BufferUsageFlags::UNIFORM_BUFFER, [1u8, 2, 3])
                .unwrap();

        Buffer::write(&buffer, 1, &[9]).unwrap();

        assert_eq!(mock.buffer_contents(*buffer), vec![1, 9, 3]);
    }

    #[test]
    #[should_panic(expected = "Buffer is not mappable")]
    pub fn buffer_write_unmappable() {
        let driver: Arc<dyn Driver> = Arc::new(MockDriver::default());
        let buffer = Buffer::create(
            &driver,
            BufferInfo::new(4, vk::BufferUsageFlags::STORAGE_BUFFER),
        )
        .unwrap();

        Buffer::write(&buffer, 0, &[0]).unwrap();
    }
}
