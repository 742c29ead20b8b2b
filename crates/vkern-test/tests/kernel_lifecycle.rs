//! Staged bring-up and teardown on the mock driver.

use ash::vk;
use vkern_core::LogChannel;
use vkern_gpu::instance::DEFAULT_VALIDATION_LAYER;
use vkern_gpu::{GpuError, InitInfo, KernelState, NoHooks, Stage};
use vkern_test::{mock_surface, KernelFixture, ObjectKind, RecordingHooks};

#[test]
fn pre_init_without_validation_creates_no_messenger() {
    let mut f = KernelFixture::new();
    f.pre_init().unwrap();

    assert!(f.kernel.is_pre_initialized());
    assert!(!f.kernel.is_initialized());
    assert_eq!(f.kernel.debug_messenger(), vk::DebugUtilsMessengerEXT::null());
    assert_eq!(f.driver.created(ObjectKind::DebugMessenger), 0);
    assert!(f.driver.instance_layers().is_empty());

    let extensions = f.driver.instance_extensions();
    assert!(extensions.iter().any(|e| e == "VK_KHR_surface"));
    assert!(!extensions.iter().any(|e| e == "VK_EXT_debug_utils"));
    assert_eq!(f.kernel.app_name(), "vkern-test");
    assert_eq!(f.kernel.shader_compiler().to_str(), Some("glslc"));
}

#[test]
fn validation_adds_debug_utils_and_default_layer() {
    let mut f = KernelFixture::with(|b| b.validation(true));
    f.pre_init().unwrap();

    assert_ne!(f.kernel.debug_messenger(), vk::DebugUtilsMessengerEXT::null());
    assert_eq!(f.driver.live(ObjectKind::DebugMessenger), 1);
    assert_eq!(
        f.driver.instance_layers(),
        vec![DEFAULT_VALIDATION_LAYER.to_string()]
    );
    assert!(f
        .driver
        .instance_extensions()
        .iter()
        .any(|e| e == "VK_EXT_debug_utils"));
}

#[test]
fn messenger_failure_destroys_instance() {
    let mut f = KernelFixture::with(|b| b.validation(true));
    f.driver.fail_next("create_debug_messenger");

    let err = f.pre_init().unwrap_err();
    assert!(err.to_string().contains("PreInit"));

    assert!(!f.kernel.is_pre_initialized());
    assert_eq!(f.kernel.failed_stage(), Some(Stage::PreInit));
    assert!(f.kernel.has_errors());
    assert_eq!(f.kernel.instance(), vk::Instance::null());
    assert_eq!(f.driver.live(ObjectKind::Instance), 0);
    assert_eq!(f.log.count_containing("failed to setup debug messenger"), 1);
}

#[test]
fn out_of_order_stages_are_rejected() {
    let mut f = KernelFixture::new();

    let err = f.kernel.init(mock_surface, InitInfo::default()).unwrap_err();
    assert!(matches!(err.root(), GpuError::InvalidState(_)));
    let err = f.kernel.post_init(&mut NoHooks).unwrap_err();
    assert!(matches!(err.root(), GpuError::InvalidState(_)));

    // Rejected calls do not poison the kernel
    assert_eq!(f.kernel.failed_stage(), None);
    f.pre_init().unwrap();
    assert!(f.kernel.pre_init(Default::default()).is_err());
    f.init().unwrap();
    assert!(f.kernel.is_initialized());
}

#[test]
fn full_bring_up_and_destroy_leaves_nothing_alive() {
    let mut f = KernelFixture::new().bring_up().unwrap();

    assert!(f.kernel.is_post_initialized());
    assert_eq!(f.kernel.state(), KernelState::PostInitialized);
    assert_eq!(f.kernel.frame_buffers().len(), 3);
    assert_eq!(f.kernel.draw_command_buffers().len(), 3);
    assert_eq!(f.kernel.wait_fences().len(), 3);
    assert_ne!(f.kernel.pipeline_cache(), vk::PipelineCache::null());
    assert_eq!(f.kernel.render_pass().attachment_count, 2);
    assert!(f.kernel.submit_template().is_some());
    assert_eq!(f.kernel.extent().width, 1280);
    assert!(f.kernel.allocated_memory() > 0);
    assert!(!f.kernel.has_errors());

    f.kernel.destroy();
    assert_eq!(f.kernel.state(), KernelState::Destroyed);
    f.driver.check_no_leaks().unwrap();

    f.kernel.destroy();
    f.driver.check_no_leaks().unwrap();
    assert_eq!(f.log.count_containing("all resources has been freed"), 1);
}

#[test]
fn dropping_the_kernel_releases_everything() {
    let f = KernelFixture::new().bring_up().unwrap();
    let driver = f.driver.clone();
    drop(f);
    driver.check_no_leaks().unwrap();
}

#[test]
fn destroy_after_failed_init_is_clean() {
    for op in [
        "create_surface",
        "enumerate_adapters",
        "create_device",
        "create_allocator",
        "create_command_pool",
        "create_swapchain",
        "create_image_view",
    ] {
        let mut f = KernelFixture::new();
        f.pre_init().unwrap();
        f.driver.fail_next(op);

        assert!(f.init().is_err(), "{op} should fail init");
        assert_eq!(f.kernel.failed_stage(), Some(Stage::Init), "{op}");

        let err = f.kernel.post_init(&mut NoHooks).unwrap_err();
        assert!(matches!(err.root(), GpuError::InvalidState(_)));

        f.kernel.destroy();
        f.driver.check_no_leaks().unwrap();
    }
}

#[test]
fn destroy_after_failed_post_init_is_clean() {
    for op in [
        "allocate_command_buffers",
        "create_fence",
        "allocate_image",
        "create_render_pass",
        "create_semaphore",
        "create_pipeline_cache",
        "create_framebuffer",
    ] {
        let mut f = KernelFixture::new();
        f.pre_init().unwrap();
        f.init().unwrap();
        f.driver.fail_next(op);

        assert!(f.post_init(&mut NoHooks).is_err(), "{op} should fail post_init");
        assert_eq!(f.kernel.failed_stage(), Some(Stage::PostInit), "{op}");

        f.kernel.destroy();
        f.driver.check_no_leaks().unwrap();
    }
}

#[test]
fn no_suitable_adapter_fails_init() {
    let mut f = KernelFixture::new();
    f.driver.set_supported_extensions(Vec::new());
    f.pre_init().unwrap();

    let err = f.init().unwrap_err();
    assert!(err.to_string().contains("No suitable GPU"));
    assert!(!f.log.messages(LogChannel::Warn).is_empty());

    f.kernel.destroy();
    f.driver.check_no_leaks().unwrap();
}

#[test]
fn on_complete_runs_once_and_its_failure_fails_post_init() {
    let mut f = KernelFixture::new();
    f.pre_init().unwrap();
    f.init().unwrap();

    let mut hooks = RecordingHooks {
        fail_on_complete: true,
        ..Default::default()
    };
    assert!(f.post_init(&mut hooks).is_err());
    assert_eq!(hooks.completed, 1);
    assert_eq!(f.kernel.failed_stage(), Some(Stage::PostInit));
    assert!(f.kernel.next_frame().is_error());

    f.kernel.destroy();
    f.driver.check_no_leaks().unwrap();
}

#[test]
fn stage_progress_is_logged() {
    let f = KernelFixture::new().bring_up().unwrap();
    assert_eq!(f.log.count_containing("kernel successfully initialized"), 1);
    assert_eq!(f.log.count_containing("kernel successfully post-initialized"), 1);
    assert_eq!(f.log.count_containing("count MSAA samples is 1"), 1);
    assert!(f.log.messages(LogChannel::Error).is_empty());
}
