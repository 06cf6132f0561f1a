//! Leasing of reusable driver objects.
//!
//! A [`Cache`] is a queue of idle items. Leasing pops an idle item (or creates one) and wraps it
//! in a [`Lease`], which returns the item to its cache when dropped. Items whose cache has since
//! been dropped are destroyed instead.

use {
    crate::driver::DriverError,
    log::trace,
    parking_lot::Mutex,
    std::{
        collections::VecDeque,
        fmt::{Debug, Formatter},
        mem::ManuallyDrop,
        ops::{Deref, DerefMut},
        sync::{Arc, Weak},
        thread::panicking,
    },
};

pub type Cache<T> = Arc<Mutex<VecDeque<T>>>;

pub fn new_cache<T>() -> Cache<T> {
    Arc::new(Mutex::new(VecDeque::new()))
}

/// Leases an idle item from `cache`, or creates a new one.
#[profiling::function]
pub fn lease<T>(
    cache: &Cache<T>,
    create: impl FnOnce() -> Result<T, DriverError>,
) -> Result<Lease<T>, DriverError> {
    let item = cache.lock().pop_front();
    let item = match item {
        Some(item) => item,
        None => {
            trace!("cache miss");

            create()?
        }
    };

    Ok(Lease::new(Arc::downgrade(cache), item))
}

/// An item on loan from a [`Cache`].
pub struct Lease<T> {
    cache: Option<Weak<Mutex<VecDeque<T>>>>,
    item: ManuallyDrop<T>,
}

impl<T> Lease<T> {
    fn new(cache: Weak<Mutex<VecDeque<T>>>, item: T) -> Self {
        Self {
            cache: Some(cache),
            item: ManuallyDrop::new(item),
        }
    }

    /// Wraps an item which is destroyed instead of returned when the lease drops.
    pub fn unpooled(item: T) -> Self {
        Self {
            cache: None,
            item: ManuallyDrop::new(item),
        }
    }
}

impl<T> Debug for Lease<T>
where
    T: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        (*self.item).fmt(f)
    }
}

impl<T> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.item
    }
}

impl<T> DerefMut for Lease<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.item
    }
}

impl<T> Drop for Lease<T> {
    fn drop(&mut self) {
        // SAFETY: `item` is never touched again
        let item = unsafe { ManuallyDrop::take(&mut self.item) };

        if panicking() {
            return;
        }

        if let Some(cache) = self.cache.as_ref().and_then(Weak::upgrade) {
            cache.lock().push_back(item);
        }
    }
}
