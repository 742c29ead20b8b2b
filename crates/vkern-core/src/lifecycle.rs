//! Lifecycle capability shared by kernel-owned resources.

/// A resource owned by the kernel.
///
/// Releasing GPU-side handles is done by each resource's own `destroy`
/// method (it needs the driver, and sometimes the allocator). Releasing the
/// host-side object is dropping it. Kernel teardown always destroys first,
/// then drops.
pub trait KernelObject {
    /// All GPU handles this object needs are present.
    fn is_ready(&self) -> bool;

    /// The object is ready and fully configured for use.
    ///
    /// Defaults to [`KernelObject::is_ready`].
    fn is_complete(&self) -> bool {
        self.is_ready()
    }
}
