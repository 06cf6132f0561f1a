//! Command recording, submission, and cross-queue synchronization.

mod queue;
mod recorder;
mod uniform;

pub use self::{
    queue::{ExecutionQueue, QueueInfo, QueueInfoBuilder, Resource, SyncPoint},
    recorder::{Attachment, AttachmentLoad, CommandRecorder, RenderPass},
    uniform::{UniformAllocation, UniformPool, UniformPoolInfo, UniformPoolInfoBuilder, UniformSession},
};

use {
    self::queue::QueueInner,
    std::sync::{Arc, Weak},
};

/// Which queue may currently use a resource.
#[derive(Clone, Debug, Default)]
pub(crate) enum Ownership {
    /// Never submitted.
    #[default]
    Unowned,

    /// Submitted to a queue; a queue which no longer exists owns nothing.
    Owned(Weak<QueueInner>),

    /// Released by one queue family but not yet acquired by another.
    InTransfer,
}

impl Ownership {
    pub fn owned_by(queue: &Arc<QueueInner>) -> Self {
        Self::Owned(Arc::downgrade(queue))
    }

    pub fn is_in_transfer(&self) -> bool {
        matches!(self, Self::InTransfer)
    }

    /// Returns `true` if `queue` may record work using the resource.
    pub fn allows(&self, queue: &Arc<QueueInner>) -> bool {
        match self {
            Self::Unowned => true,
            Self::Owned(owner) => owner.strong_count() == 0 || owner.as_ptr() == Arc::as_ptr(queue),
            Self::InTransfer => false,
        }
    }

    /// The live owning queue, if any.
    pub fn queue(&self) -> Option<Arc<QueueInner>> {
        match self {
            Self::Owned(owner) => owner.upgrade(),
            _ => None,
        }
    }
}
