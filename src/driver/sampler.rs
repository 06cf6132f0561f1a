use {
    super::{Driver, DriverError, SamplerDesc},
    ash::vk,
    log::trace,
    std::{
        fmt::{Debug, Formatter},
        ops::Deref,
        sync::Arc,
        thread::panicking,
    },
};

/// A sampler object, destroyed when dropped.
pub struct Sampler {
    driver: Arc<dyn Driver>,
    sampler: vk::Sampler,

    pub desc: SamplerDesc,
}

impl Sampler {
    pub fn create(driver: &Arc<dyn Driver>, desc: SamplerDesc) -> Result<Self, DriverError> {
        trace!("create: {:?}", desc);

        let sampler = driver.create_sampler(&desc)?;

        Ok(Self {
            driver: Arc::clone(driver),
            sampler,
            desc,
        })
    }
}

impl Debug for Sampler {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.sampler)
    }
}

impl Deref for Sampler {
    type Target = vk::Sampler;

    fn deref(&self) -> &Self::Target {
        &self.sampler
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        if panicking() {
            return;
        }

        self.driver.destroy_sampler(self.sampler);
    }
}
