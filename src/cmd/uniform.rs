//! Linear allocation of per-submission uniform data.

use {
    crate::{
        driver::{Buffer, BufferInfo, DescriptorResource, Driver, DriverError},
        pool::{lease, new_cache, Cache, Lease},
    },
    ash::vk,
    derive_builder::{Builder, UninitializedFieldError},
    log::trace,
    std::sync::Arc,
};

/// Information used to create a [`UniformPool`] instance.
#[derive(Builder, Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[builder(
    build_fn(private, name = "fallible_build", error = "UniformPoolInfoBuilderError"),
    derive(Clone, Copy, Debug),
    pattern = "owned"
)]
#[non_exhaustive]
pub struct UniformPoolInfo {
    /// Size in bytes of each pooled buffer.
    ///
    /// Allocations larger than this get a dedicated buffer. The default value is 64 KiB.
    #[builder(default = "64 * 1024")]
    pub chunk_size: vk::DeviceSize,
}

impl UniformPoolInfo {
    pub const fn new(chunk_size: vk::DeviceSize) -> Self {
        Self { chunk_size }
    }

    #[inline(always)]
    pub fn to_builder(self) -> UniformPoolInfoBuilder {
        UniformPoolInfoBuilder {
            chunk_size: Some(self.chunk_size),
        }
    }
}

impl Default for UniformPoolInfo {
    fn default() -> Self {
        UniformPoolInfoBuilder::default().build()
    }
}

impl UniformPoolInfoBuilder {
    /// Builds a new `UniformPoolInfo`.
    #[inline(always)]
    pub fn build(self) -> UniformPoolInfo {
        match self.fallible_build() {
            Err(UniformPoolInfoBuilderError(err)) => panic!("{err}"),
            Ok(info) => info,
        }
    }
}

impl From<UniformPoolInfoBuilder> for UniformPoolInfo {
    fn from(info: UniformPoolInfoBuilder) -> Self {
        info.build()
    }
}

#[derive(Debug)]
struct UniformPoolInfoBuilderError(UninitializedFieldError);

impl From<UninitializedFieldError> for UniformPoolInfoBuilderError {
    fn from(err: UninitializedFieldError) -> Self {
        Self(err)
    }
}

/// Mappable uniform buffers shared by every session of one queue.
#[derive(Debug)]
pub struct UniformPool {
    alignment: vk::DeviceSize,
    cache: Cache<Arc<Buffer>>,
    driver: Arc<dyn Driver>,

    pub info: UniformPoolInfo,
}

impl UniformPool {
    pub fn new(driver: &Arc<dyn Driver>, info: impl Into<UniformPoolInfo>) -> Self {
        Self {
            alignment: driver.min_uniform_buffer_offset_alignment().max(1),
            cache: new_cache(),
            driver: Arc::clone(driver),
            info: info.into(),
        }
    }

    /// Opens an allocation session.
    ///
    /// Buffers leased by the session return to this pool when the session drops.
    pub fn session(&self) -> UniformSession {
        UniformSession {
            alignment: self.alignment,
            cache: Arc::clone(&self.cache),
            chunk_size: self.info.chunk_size,
            chunks: vec![],
            current: None,
            dedicated: vec![],
            driver: Arc::clone(&self.driver),
            offset: 0,
        }
    }

    /// The number of idle buffers.
    pub fn idle_len(&self) -> usize {
        self.cache.lock().len()
    }
}

/// A region of a uniform buffer holding data written by [`UniformSession::allocate`].
#[derive(Clone, Debug)]
pub struct UniformAllocation {
    pub buffer: Arc<Buffer>,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

impl UniformAllocation {
    pub fn descriptor(&self) -> DescriptorResource {
        DescriptorResource::Buffer {
            buffer: **self.buffer,
            offset: self.offset,
            range: self.size,
        }
    }
}

/// Bump allocator over leased uniform buffers, owned by one command recorder.
///
/// Nothing is reused until the session drops, which the queue delays until the GPU has finished
/// the submission that used it.
#[derive(Debug)]
pub struct UniformSession {
    alignment: vk::DeviceSize,
    cache: Cache<Arc<Buffer>>,
    chunk_size: vk::DeviceSize,
    chunks: Vec<Lease<Arc<Buffer>>>,
    current: Option<Arc<Buffer>>,
    dedicated: Vec<Arc<Buffer>>,
    driver: Arc<dyn Driver>,
    offset: vk::DeviceSize,
}

impl UniformSession {
    /// Copies `data` into uniform memory.
    #[profiling::function]
    pub fn allocate(&mut self, data: &[u8]) -> Result<UniformAllocation, DriverError> {
        debug_assert!(!data.is_empty());

        let size = data.len() as vk::DeviceSize;

        if size > self.chunk_size {
            trace!("dedicated uniform buffer: {size} bytes");

            let buffer = Arc::new(Buffer::create_from_slice(
                &self.driver,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                data,
            )?);
            self.dedicated.push(Arc::clone(&buffer));

            return Ok(UniformAllocation {
                buffer,
                offset: 0,
                size,
            });
        }

        let mut offset = self.offset.next_multiple_of(self.alignment);
        let chunk = match &self.current {
            Some(chunk) if offset + size <= self.chunk_size => Arc::clone(chunk),
            _ => {
                let driver = &self.driver;
                let chunk_size = self.chunk_size;
                let chunk = lease(&self.cache, || {
                    Buffer::create(
                        driver,
                        BufferInfo::new_mappable(
                            chunk_size,
                            vk::BufferUsageFlags::UNIFORM_BUFFER,
                        ),
                    )
                    .map(Arc::new)
                })?;
                let current = Arc::clone(&*chunk);

                self.chunks.push(chunk);
                self.current = Some(Arc::clone(&current));
                offset = 0;

                current
            }
        };

        Buffer::write(&chunk, offset, data)?;
        self.offset = offset + size;

        Ok(UniformAllocation {
            buffer: chunk,
            offset,
            size,
        })
    }
}
