use {
    super::{DescriptorSetLayoutBinding, DescriptorWrite, Driver, DriverError},
    ash::vk,
    log::trace,
    std::{
        fmt::{Debug, Formatter},
        ops::Deref,
        sync::Arc,
        thread::panicking,
    },
};

/// A descriptor set which is freed on drop.
///
/// Sets are never updated after they have been bound by a submitted command buffer; a changed set
/// is allocated again instead.
pub struct DescriptorSet {
    driver: Arc<dyn Driver>,
    set: vk::DescriptorSet,
}

impl DescriptorSet {
    #[profiling::function]
    pub fn allocate(
        driver: &Arc<dyn Driver>,
        layout: vk::DescriptorSetLayout,
        bindings: &[DescriptorSetLayoutBinding],
    ) -> Result<Self, DriverError> {
        trace!("allocate");

        let set = driver.allocate_descriptor_set(layout, bindings)?;

        Ok(Self {
            driver: Arc::clone(driver),
            set,
        })
    }

    pub fn write(this: &Self, writes: &[DescriptorWrite]) {
        if !writes.is_empty() {
            this.driver.update_descriptor_set(this.set, writes);
        }
    }
}

impl Debug for DescriptorSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.set)
    }
}

impl Deref for DescriptorSet {
    type Target = vk::DescriptorSet;

    fn deref(&self) -> &Self::Target {
        &self.set
    }
}

impl Drop for DescriptorSet {
    #[profiling::function]
    fn drop(&mut self) {
        if panicking() {
            return;
        }

        self.driver.free_descriptor_set(self.set);
    }
}
