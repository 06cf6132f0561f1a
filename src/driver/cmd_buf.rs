use {
    super::{Driver, DriverError},
    ash::vk,
    log::trace,
    std::{
        fmt::{Debug, Formatter},
        ops::Deref,
        sync::Arc,
        thread::panicking,
    },
};

/// A primary command buffer allocated for one queue family.
///
/// Command buffers are leased from their queue; lifetime of the work recorded into them is
/// tracked by the queue's timeline semaphore, not by the command buffer itself.
pub struct CommandBuffer {
    cmd_buf: vk::CommandBuffer,
    driver: Arc<dyn Driver>,

    pub queue_family_index: u32,
}

impl CommandBuffer {
    #[profiling::function]
    pub(crate) fn create(
        driver: &Arc<dyn Driver>,
        queue_family_index: u32,
    ) -> Result<Self, DriverError> {
        trace!("create: queue family {queue_family_index}");

        let cmd_buf = driver.create_command_buffer(queue_family_index)?;

        Ok(Self {
            cmd_buf,
            driver: Arc::clone(driver),
            queue_family_index,
        })
    }

    /// Discards previous contents and begins one-time recording.
    pub(crate) fn begin(this: &Self) -> Result<(), DriverError> {
        this.driver.begin_command_buffer(this.cmd_buf)
    }

    pub(crate) fn end(this: &Self) -> Result<(), DriverError> {
        this.driver.end_command_buffer(this.cmd_buf)
    }
}

impl Debug for CommandBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.cmd_buf)
    }
}

impl Deref for CommandBuffer {
    type Target = vk::CommandBuffer;

    fn deref(&self) -> &Self::Target {
        &self.cmd_buf
    }
}

impl Drop for CommandBuffer {
    #[profiling::function]
    fn drop(&mut self) {
        if panicking() {
            return;
        }

        self.driver.destroy_command_buffer(self.cmd_buf);
    }
}
