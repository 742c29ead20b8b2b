//! Vulkan instance and validation messenger creation.

use crate::driver::InstanceDesc;
use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::{c_void, CStr, CString};

/// Khronos validation layer, used when validation is on and no layer was named.
pub const DEFAULT_VALIDATION_LAYER: &str = "VK_LAYER_KHRONOS_validation";

/// Instance extensions needed to present on this platform.
pub fn platform_instance_extensions() -> Vec<&'static CStr> {
    vec![
        ash::khr::surface::NAME,
        #[cfg(target_os = "windows")]
        ash::khr::win32_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::xlib_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::xcb_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::wayland_surface::NAME,
        #[cfg(target_os = "macos")]
        ash::ext::metal_surface::NAME,
        #[cfg(target_os = "macos")]
        ash::khr::portability_enumeration::NAME,
    ]
}

/// Convert names to C strings, rejecting interior NULs.
pub fn to_cstrings(names: &[String]) -> Result<Vec<CString>> {
    names
        .iter()
        .map(|name| {
            CString::new(name.as_str())
                .map_err(|e| GpuError::InvalidState(format!("invalid name {name:?}: {e}")))
        })
        .collect()
}

/// Create a Vulkan instance.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(entry: &ash::Entry, desc: &InstanceDesc<'_>) -> Result<ash::Instance> {
    let app_name = CString::new(desc.app_name)
        .map_err(|e| GpuError::InvalidState(format!("invalid application name: {e}")))?;
    let engine_name = CString::new(desc.engine_name)
        .map_err(|e| GpuError::InvalidState(format!("invalid engine name: {e}")))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(&engine_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(desc.api_version);

    let extensions = to_cstrings(desc.extensions)?;
    let extension_names: Vec<*const std::ffi::c_char> =
        extensions.iter().map(|ext| ext.as_ptr()).collect();

    let layers = to_cstrings(desc.layers)?;

    // Missing layers make instance creation fail; say which one
    let available_layers = entry.enumerate_instance_layer_properties()?;
    for layer in &layers {
        let found = available_layers
            .iter()
            .any(|props| props.layer_name_as_c_str().is_ok_and(|name| name == layer.as_c_str()));
        if !found {
            tracing::warn!("Validation layer {} not available", layer.to_string_lossy());
        }
    }

    let layer_names: Vec<*const std::ffi::c_char> = layers.iter().map(|l| l.as_ptr()).collect();

    // Required for MoltenVK on macOS
    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    let instance = entry.create_instance(&create_info, None)?;

    Ok(instance)
}

/// Install [`debug_callback`] for warnings and errors (and verbose output in debug builds).
///
/// # Safety
/// The loader's instance must be valid and created with `VK_EXT_debug_utils`.
pub unsafe fn create_debug_messenger(
    loader: &ash::ext::debug_utils::Instance,
) -> Result<vk::DebugUtilsMessengerEXT> {
    let mut severity = vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR;
    if cfg!(debug_assertions) {
        severity |= vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
            | vk::DebugUtilsMessageSeverityFlagsEXT::INFO;
    }

    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(severity)
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));

    let messenger = loader.create_debug_utils_messenger(&create_info, None)?;
    Ok(messenger)
}

/// Forwards validation messages to `tracing` by severity.
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() {
        return vk::FALSE;
    }
    let message = unsafe { (*data).message_as_c_str() }
        .map_or_else(|| "<no message>".into(), CStr::to_string_lossy);

    if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        tracing::error!("({message_type:?}) Validation Layer: {message}");
    } else if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        tracing::warn!("({message_type:?}) Validation Layer: {message}");
    } else if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::INFO {
        tracing::debug!("({message_type:?}) Validation Layer: {message}");
    } else {
        tracing::trace!("({message_type:?}) Validation Layer: {message}");
    }
    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_extensions_include_surface() {
        assert!(platform_instance_extensions().contains(&ash::khr::surface::NAME));
    }

    #[test]
    fn interior_nul_is_rejected() {
        assert!(to_cstrings(&["ok".to_string()]).is_ok());
        assert!(to_cstrings(&["bad\0name".to_string()]).is_err());
    }
}
