//! Version Tracking
//!
//! Every resource the pipeline caches GPU state for (materials, geometry,
//! textures) carries a monotonically increasing version. Consumers store the
//! version they last synchronised against and re-upload only when it moved.

/// Monotonic version counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ChangeTracker {
    version: u64,
}

impl ChangeTracker {
    #[must_use]
    pub fn new() -> Self {
        Self { version: 0 }
    }

    /// Marks the owner as modified.
    pub fn changed(&mut self) {
        self.version = self.version.wrapping_add(1);
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Hands out a guard that bumps the version when it goes out of scope.
    pub fn guard<'a, T>(&'a mut self, data: &'a mut T) -> MutGuard<'a, T> {
        MutGuard::new(data, &mut self.version)
    }
}

/// Mutable access guard. Dropping it bumps the tracked version, so every
/// mutation through the guard is observed by the caches.
pub struct MutGuard<'a, T> {
    data: &'a mut T,
    version: &'a mut u64,
}

impl<'a, T> MutGuard<'a, T> {
    pub fn new(data: &'a mut T, version: &'a mut u64) -> Self {
        Self { data, version }
    }
}

impl<T> std::ops::Deref for MutGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.data
    }
}

impl<T> std::ops::DerefMut for MutGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data
    }
}

impl<T> Drop for MutGuard<'_, T> {
    fn drop(&mut self) {
        *self.version = self.version.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_bumps_version_on_drop() {
        let mut tracker = ChangeTracker::new();
        let mut value = 1.0f32;
        {
            let mut guard = tracker.guard(&mut value);
            *guard = 2.0;
        }
        assert_eq!(tracker.version(), 1);
        assert_eq!(value, 2.0);
    }

    #[test]
    fn changed_wraps_instead_of_overflowing() {
        let mut tracker = ChangeTracker { version: u64::MAX };
        tracker.changed();
        assert_eq!(tracker.version(), 0);
    }
}
