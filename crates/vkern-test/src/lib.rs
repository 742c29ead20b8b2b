//! Test harness for the vkern rendering kernel.
//!
//! Provides a mock driver that tracks every GPU object it hands out, and
//! fixtures that bring a kernel up on top of it.

pub mod harness;
pub mod mock;

pub use harness::{mock_surface, KernelFixture, RecordingHooks};
pub use mock::{default_adapter, MockAllocator, MockDriver, ObjectKind};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("GPU error: {0}")]
    Gpu(#[from] vkern_gpu::GpuError),
    #[error("{count} {kind:?} object(s) still alive")]
    Leak { kind: ObjectKind, count: usize },
}

pub type Result<T> = std::result::Result<T, TestError>;
