//! Scoped open/close of device resources
//!
//! Every descriptor the updater opens (AT TTY, BHI node, config-db client)
//! goes through a [`DeviceLocker`]: constructing it opens the resource and
//! dropping it closes the resource, on every exit path. Callers that care
//! about close failures use [`DeviceLocker::close`] to surface them; an
//! implicit close on drop only logs.

use std::ops::{Deref, DerefMut};

use tracing::{debug, warn};

use crate::error::Result;

/// A resource with explicit open and close steps
pub trait Lockable {
    /// Short description used in log lines
    fn describe(&self) -> String;

    fn open(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// Holds a [`Lockable`] open for the lifetime of the locker
#[derive(Debug)]
pub struct DeviceLocker<'a, T: Lockable> {
    inner: &'a mut T,
    open: bool,
}

impl<'a, T: Lockable> DeviceLocker<'a, T> {
    /// Open `inner`; on failure nothing is left open
    pub fn new(inner: &'a mut T) -> Result<Self> {
        inner.open()?;
        debug!("opened {}", inner.describe());
        Ok(Self { inner, open: true })
    }

    /// Close the resource now and report the outcome
    pub fn close(mut self) -> Result<()> {
        self.open = false;
        let result = self.inner.close();
        debug!("closed {}", self.inner.describe());
        result
    }
}

impl<T: Lockable> Deref for DeviceLocker<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.inner
    }
}

impl<T: Lockable> DerefMut for DeviceLocker<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.inner
    }
}

impl<T: Lockable> Drop for DeviceLocker<'_, T> {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        if let Err(e) = self.inner.close() {
            warn!("failed to close {}: {}", self.inner.describe(), e);
        } else {
            debug!("closed {}", self.inner.describe());
        }
    }
}
