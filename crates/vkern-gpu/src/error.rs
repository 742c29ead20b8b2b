//! GPU error types.

use std::fmt;

use ash::vk;
use thiserror::Error;

/// Bring-up stage or kernel operation a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    PreInit,
    Init,
    PostInit,
    Resize,
    FrameBuffers,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PreInit => "PreInit",
            Self::Init => "Init",
            Self::PostInit => "PostInit",
            Self::Resize => "ResizeWindow",
            Self::FrameBuffers => "ReCreateFrameBuffers",
        })
    }
}

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// Failed to load the Vulkan loader library.
    #[error("Failed to load Vulkan: {0}")]
    Loading(String),

    /// No adapter supports the requested extensions and presentation.
    #[error("No suitable GPU found (requested extensions: {extensions:?})")]
    NoSuitableDevice { extensions: Vec<String> },

    /// Queue families for graphics and present could not both be found.
    #[error("Queue families incomplete")]
    IncompleteQueueFamilies,

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Multisampling requested with a sample count the adapter lacks.
    #[error("Unsupported sample count: {0:?}")]
    UnsupportedSampleCount(vk::SampleCountFlags),

    /// Descriptor pool or set failure.
    #[error("Descriptor error: {0}")]
    Descriptor(String),

    /// Invalid state, including out-of-order kernel calls.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A bring-up stage step failed.
    #[error("{stage}: {step}: {source}")]
    Stage {
        stage: Stage,
        step: &'static str,
        #[source]
        source: Box<GpuError>,
    },
}

impl GpuError {
    /// Wrap this error with the stage and step it happened in.
    pub fn at(self, stage: Stage, step: &'static str) -> Self {
        Self::Stage {
            stage,
            step,
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through stage wrappers.
    pub fn root(&self) -> &Self {
        match self {
            Self::Stage { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_wrapping_keeps_root() {
        let err = GpuError::from(vk::Result::ERROR_INITIALIZATION_FAILED)
            .at(Stage::PreInit, "create instance");

        assert!(matches!(
            err.root(),
            GpuError::Vulkan(vk::Result::ERROR_INITIALIZATION_FAILED)
        ));
        assert!(err.to_string().starts_with("PreInit: create instance:"));
    }
}
