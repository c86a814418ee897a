//! What the allocator needs to know about a candidate.

use sandgrid_core::{ResourceLimits, Task};

/// A pending unit of work the allocator can admit.
pub trait Schedulable {
    /// Limits as declared by the submitter.
    fn limits(&self) -> &ResourceLimits;
    /// Tags a machine must carry.
    fn requires(&self) -> &[String];
    /// Whether the task must run alone.
    fn exclusive(&self) -> bool;
    /// Container image, used to share image disk cost.
    fn image(&self) -> Option<&str>;
}

impl Schedulable for Task {
    fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    fn requires(&self) -> &[String] {
        &self.requires
    }

    fn exclusive(&self) -> bool {
        self.exclusive
    }

    fn image(&self) -> Option<&str> {
        self.image.as_deref()
    }
}

impl<T: Schedulable> Schedulable for &T {
    fn limits(&self) -> &ResourceLimits {
        (*self).limits()
    }

    fn requires(&self) -> &[String] {
        (*self).requires()
    }

    fn exclusive(&self) -> bool {
        (*self).exclusive()
    }

    fn image(&self) -> Option<&str> {
        (*self).image()
    }
}
