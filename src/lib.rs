//! _vellum_ keeps GPU work correctly ordered without hand-written barriers, and binds precompiled
//! shader variants by name.
//!
//! Work is recorded into a [`CommandRecorder`](cmd::CommandRecorder) started from an
//! [`ExecutionQueue`](cmd::ExecutionQueue). Every command declares the images and buffers it uses
//! and the recorder inserts the smallest set of pipeline barriers and layout transitions needed
//! between them. When the recorder is submitted the queue reconciles what it recorded with what
//! earlier submissions left behind, then advances a timeline semaphore which callers wait on
//! through [`SyncPoint`](cmd::SyncPoint) tokens.
//!
//! Shaders are organized as [`Technique`](technique::Technique)s: named passes compiled once for
//! every combination of selection values. Values are attached to a technique by name and bound
//! into a recorder with a single call:
//!
//! ```no_run
//! # use {std::sync::Arc, vellum::prelude::*};
//! # fn run(driver: &Arc<dyn Driver>, compiler: Arc<dyn ShaderCompiler>, image: &Arc<Image>)
//! # -> Result<(), Box<dyn std::error::Error>> {
//! let queue = ExecutionQueue::new(driver, QueueInfo::new(0, 0))?;
//! let configurator = Configurator::new(driver, compiler);
//!
//! configurator.rebuild(
//!     &TechniqueDesc::new("blur")
//!         .with_selection("radius", ["SMALL", "LARGE"])
//!         .with_pass(PassDesc::compute("main", "blur.comp").selection("radius")),
//! )?;
//!
//! let technique = Technique::new(&configurator, "blur");
//! let pass = technique.get_or_create_pass("main");
//!
//! technique.get_or_create_resource_binding("image").set_image(image);
//! technique.get_or_create_selection("radius").set("LARGE");
//!
//! let mut recorder = queue.start_commands()?;
//!
//! if technique.bind_compute(&mut recorder, &pass, None) {
//!     recorder.dispatch(64, 64, 1);
//! }
//!
//! queue.submit_commands(recorder).wait_for_ready()?;
//! # Ok(()) }
//! ```
//!
//! The GPU is reached only through the [`Driver`](driver::Driver) trait; enable the `vulkan`
//! feature for the _Ash_ backend.

pub mod cmd;
pub mod driver;
pub mod pool;
pub mod technique;

/// Things which are used in almost every program.
pub mod prelude {
    pub use super::{
        cmd::{
            Attachment, AttachmentLoad, CommandRecorder, ExecutionQueue, QueueInfo, RenderPass,
            Resource, SyncPoint,
        },
        driver::{
            vk, Buffer, BufferInfo, ClearValue, Driver, DriverError, Image, ImageAccess, ImageInfo,
            ImageSlice, ImageViewInfo, MemoryAccess, Sampler, SamplerDesc,
        },
        technique::{
            Configurator, PassDesc, ResourceBinding, Selection, ShaderCompiler, Technique,
            TechniqueDesc, UniformVariable, VolatileContext,
        },
    };
}
