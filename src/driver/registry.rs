use crate::driver::DeviceChannel;
use crate::error::{CxlError, CxlResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Identifier handed out by [`DeviceRegistry::register`]. Never reused by the same registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Dynamically sized table of attached devices.
pub struct DeviceRegistry<T: ?Sized = dyn DeviceChannel> {
    entries: RwLock<BTreeMap<DeviceId, Arc<T>>>,
    next_id: AtomicU32,
}

impl<T: ?Sized> Default for DeviceRegistry<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            next_id: AtomicU32::new(0),
        }
    }
}

impl<T: ?Sized> fmt::Debug for DeviceRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("ids", &self.ids())
            .finish()
    }
}

impl<T: ?Sized> DeviceRegistry<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `device` and returns its id.
    ///
    /// # Errors
    /// `InvalidArgument` once the 32-bit id space is used up.
    pub fn register(&self, device: Arc<T>) -> CxlResult<DeviceId> {
        let raw = self
            .next_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| id.checked_add(1))
            .map_err(|_| CxlError::InvalidArgument("device id space exhausted".into()))?;
        let id = DeviceId(raw);

        self.entries.write().insert(id, device);
        tracing::debug!("registered device {id}");
        Ok(id)
    }

    /// Removes the device and hands it back to the caller.
    ///
    /// # Errors
    /// `UnknownDevice` if `id` is not registered.
    pub fn unregister(&self, id: DeviceId) -> CxlResult<Arc<T>> {
        let device = self
            .entries
            .write()
            .remove(&id)
            .ok_or(CxlError::UnknownDevice { id: id.0 })?;
        tracing::debug!("unregistered device {id}");
        Ok(device)
    }

    #[must_use]
    pub fn get(&self, id: DeviceId) -> Option<Arc<T>> {
        self.entries.read().get(&id).cloned()
    }

    #[must_use]
    pub fn ids(&self) -> Vec<DeviceId> {
        self.entries.read().keys().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Removes every entry, returning them in id order.
    pub fn drain(&self) -> Vec<(DeviceId, Arc<T>)> {
        std::mem::take(&mut *self.entries.write())
            .into_iter()
            .collect()
    }
}
