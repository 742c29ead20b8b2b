//! MultisampleTarget resource accounting.

use ash::vk::{self, Handle};
use vkern_core::{CaptureSink, KernelObject, LogChannel};
use vkern_gpu::{
    Device, Driver, FamilyQueues, GpuError, ImageAllocator, MultisampleTarget,
};
use vkern_test::{default_adapter, KernelFixture, MockDriver, ObjectKind};

const DEPTH: vk::Format = vk::Format::D32_SFLOAT_S8_UINT;
const FORMATS: [vk::Format; 2] = [vk::Format::B8G8R8A8_SRGB, vk::Format::R16G16B16A16_SFLOAT];

fn device(samples: u32) -> Device {
    let adapter = default_adapter();
    let mut queues = FamilyQueues::from_indices(adapter.queue_families).unwrap();
    queues.graphics_queue = vk::Queue::from_raw(1);
    Device::new(&adapter, vk::Device::from_raw(1), queues, samples, false)
}

#[test]
fn recreate_keeps_exactly_one_set_of_images() {
    let mut driver = MockDriver::new();
    let mut allocator = driver.create_allocator().unwrap();
    let device = device(4);

    let mut target = MultisampleTarget::create(
        &driver,
        &mut allocator,
        &device,
        DEPTH,
        100,
        100,
        &FORMATS,
        true,
        CaptureSink::shared(),
    )
    .unwrap();
    assert!(target.is_ready());

    target.recreate(&driver, &mut allocator, 200, 100).unwrap();
    target.recreate(&driver, &mut allocator, 300, 200).unwrap();

    assert_eq!(driver.live(ObjectKind::Image), FORMATS.len() + 1);
    assert_eq!(driver.live(ObjectKind::ImageView), FORMATS.len() + 1);
    assert_eq!(target.extent().width, 300);
    assert_eq!(target.resolves().len(), FORMATS.len());

    target.destroy(&driver, &mut allocator).unwrap();
    target.destroy(&driver, &mut allocator).unwrap();
    assert!(driver.leaks().is_empty());
    assert_eq!(allocator.allocated_bytes(), 0);
}

#[test]
fn images_use_the_device_sample_count() {
    let mut driver = MockDriver::new();
    let mut allocator = driver.create_allocator().unwrap();

    let target = MultisampleTarget::create(
        &driver,
        &mut allocator,
        &device(4),
        DEPTH,
        100,
        100,
        &FORMATS,
        true,
        CaptureSink::shared(),
    )
    .unwrap();

    // Three images of 100x100 at four samples, four bytes each
    assert_eq!(allocator.allocated_bytes(), 3 * 100 * 100 * 4 * 4);
    assert_eq!(target.samples(), vk::SampleCountFlags::TYPE_4);
}

#[test]
fn single_sampled_when_multisampling_is_off() {
    let mut driver = MockDriver::new();
    let mut allocator = driver.create_allocator().unwrap();

    let target = MultisampleTarget::create(
        &driver,
        &mut allocator,
        &device(4),
        DEPTH,
        10,
        10,
        &FORMATS[..1],
        false,
        CaptureSink::shared(),
    )
    .unwrap();

    assert_eq!(allocator.allocated_bytes(), 2 * 10 * 10 * 4);
    assert!(!target.multisampling());
}

#[test]
fn unsupported_sample_count_is_rejected() {
    let mut driver = MockDriver::new();
    let mut allocator = driver.create_allocator().unwrap();
    let mut device = device(1);
    device.sample_count = vk::SampleCountFlags::TYPE_64;

    let err = MultisampleTarget::create(
        &driver,
        &mut allocator,
        &device,
        DEPTH,
        64,
        64,
        &FORMATS,
        true,
        CaptureSink::shared(),
    )
    .unwrap_err();

    assert!(matches!(err, GpuError::UnsupportedSampleCount(_)));
    assert!(driver.leaks().is_empty());
}

#[test]
fn unsupported_sample_count_is_logged_to_the_sink() {
    let mut driver = MockDriver::new();
    let mut allocator = driver.create_allocator().unwrap();
    let mut device = device(1);
    device.sample_count = vk::SampleCountFlags::TYPE_64;
    let log = CaptureSink::shared();

    let result = MultisampleTarget::create(
        &driver,
        &mut allocator,
        &device,
        DEPTH,
        64,
        64,
        &FORMATS,
        true,
        log.clone(),
    );

    assert!(result.is_err());
    assert_eq!(log.count_containing("unsupported"), 1);
    assert_eq!(log.count_containing("failed to re-create multisample"), 1);
    assert_eq!(log.messages(LogChannel::Error).len(), 2);
}

#[test]
fn destroy_releases_every_attachment_despite_a_failed_free() {
    let mut driver = MockDriver::new();
    let mut allocator = driver.create_allocator().unwrap();
    let log = CaptureSink::shared();

    let mut target = MultisampleTarget::create(
        &driver,
        &mut allocator,
        &device(4),
        DEPTH,
        32,
        32,
        &FORMATS,
        true,
        log.clone(),
    )
    .unwrap();
    driver.fail_always("free_image");

    let err = target.destroy(&driver, &mut allocator).unwrap_err();
    assert!(matches!(err, GpuError::AllocationFailed(_)));
    assert!(driver.leaks().is_empty());
    assert_eq!(allocator.allocated_bytes(), 0);
    assert!(!target.is_ready());

    // The first failure is returned, the other two are logged
    assert_eq!(log.count_containing("failed to free image"), FORMATS.len());
}

#[test]
fn partial_failure_during_create_leaks_nothing() {
    let mut driver = MockDriver::new();
    let mut allocator = driver.create_allocator().unwrap();
    driver.fail_next("create_image_view");

    let result = MultisampleTarget::create(
        &driver,
        &mut allocator,
        &device(2),
        DEPTH,
        64,
        64,
        &FORMATS,
        true,
        CaptureSink::shared(),
    );

    assert!(result.is_err());
    assert!(driver.leaks().is_empty());
    assert_eq!(allocator.allocated_bytes(), 0);
}

#[test]
fn kernel_uses_three_attachments_with_msaa() {
    let f = KernelFixture::with(|b| b.multisampling(4)).bring_up().unwrap();

    let device = f.kernel.device().unwrap();
    assert_eq!(device.sample_count, vk::SampleCountFlags::TYPE_4);
    assert_eq!(f.kernel.render_pass().attachment_count, 3);
    assert!(f
        .driver
        .framebuffer_attachments()
        .iter()
        .all(|&count| count == 3));
    assert!(f.kernel.multisample().unwrap().multisampling());
}

#[test]
fn requested_samples_are_clamped_to_the_adapter() {
    let f = KernelFixture::with(|b| b.multisampling(16)).bring_up().unwrap();
    assert_eq!(
        f.kernel.device().unwrap().sample_count,
        vk::SampleCountFlags::TYPE_8
    );
    assert_eq!(f.log.count_containing("count MSAA samples is 8"), 1);
}
