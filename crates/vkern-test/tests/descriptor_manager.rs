//! DescriptorManager pooling on the mock driver.

use std::sync::Arc;

use ash::vk;
use vkern_core::{CaptureSink, LogChannel};
use vkern_gpu::{DescriptorManager, DescriptorTypes, GpuError, PoolPolicy};
use vkern_test::{KernelFixture, MockDriver, ObjectKind};

const LAYOUT: vk::DescriptorSetLayout = vk::DescriptorSetLayout::null();

fn pooled(max_sets: u32) -> (DescriptorManager, Arc<CaptureSink>) {
    let log = CaptureSink::shared();
    let manager = DescriptorManager::new(PoolPolicy::default().with_max_sets(max_sets), log.clone());
    (manager, log)
}

#[test]
fn distinct_type_sets_never_share_pools() {
    let driver = MockDriver::new();
    let (mut manager, _) = pooled(4);

    let uniform = manager
        .allocate_descriptor_sets(&driver, LAYOUT, DescriptorTypes::UNIFORM_BUFFER)
        .unwrap();
    let sampler = manager
        .allocate_descriptor_sets(&driver, LAYOUT, DescriptorTypes::COMBINED_IMAGE_SAMPLER)
        .unwrap();
    let both = manager
        .allocate_descriptor_sets(
            &driver,
            LAYOUT,
            DescriptorTypes::UNIFORM_BUFFER | DescriptorTypes::COMBINED_IMAGE_SAMPLER,
        )
        .unwrap();

    assert_ne!(uniform.pool, sampler.pool);
    assert_ne!(both.pool, uniform.pool);
    assert_ne!(both.pool, sampler.pool);
    assert_eq!(manager.pool_count(), 3);

    let again = manager
        .allocate_descriptor_sets(&driver, LAYOUT, DescriptorTypes::UNIFORM_BUFFER)
        .unwrap();
    assert_eq!(again.pool, uniform.pool);
}

#[test]
fn full_pool_triggers_a_new_one() {
    let driver = MockDriver::new();
    let (mut manager, log) = pooled(2);
    let types = DescriptorTypes::STORAGE_BUFFER;

    let sets: Vec<_> = (0..3)
        .map(|_| manager.allocate_descriptor_sets(&driver, LAYOUT, types).unwrap())
        .collect();

    assert_eq!(manager.pool_count(), 2);
    assert_eq!(manager.allocated_sets(), 3);
    assert_eq!(sets[0].pool, sets[1].pool);
    assert_ne!(sets[1].pool, sets[2].pool);
    assert_eq!(log.count_containing("create new descriptor pool"), 2);
}

#[test]
fn default_capacity_overflow_adds_a_second_pool() {
    let driver = MockDriver::new();
    let log = CaptureSink::shared();
    let mut manager = DescriptorManager::new(PoolPolicy::default(), log.clone());
    let types = DescriptorTypes::UNIFORM_BUFFER;

    let sets: Vec<_> = (0..1001)
        .map(|_| manager.allocate_descriptor_sets(&driver, LAYOUT, types).unwrap())
        .collect();

    assert_eq!(manager.pool_count(), 2);
    assert_eq!(manager.allocated_sets(), 1001);
    assert_eq!(manager.pools()[0].used(), 1000);
    assert_eq!(sets[0].pool, sets[999].pool);
    assert_ne!(sets[999].pool, sets[1000].pool);
    assert_eq!(driver.live(ObjectKind::DescriptorPool), 2);
}

#[test]
fn freed_slot_is_reused() {
    let driver = MockDriver::new();
    let (mut manager, _) = pooled(2);
    let types = DescriptorTypes::SAMPLED_IMAGE;

    let a = manager.allocate_descriptor_sets(&driver, LAYOUT, types).unwrap();
    let _b = manager.allocate_descriptor_sets(&driver, LAYOUT, types).unwrap();
    manager.free_descriptor_set(&driver, a).unwrap();
    let c = manager.allocate_descriptor_sets(&driver, LAYOUT, types).unwrap();

    assert_eq!(c.pool, a.pool);
    assert_eq!(manager.pool_count(), 1);
    assert_eq!(manager.allocated_sets(), 2);
}

#[test]
fn double_free_is_rejected() {
    let driver = MockDriver::new();
    let (mut manager, _) = pooled(4);

    let set = manager
        .allocate_descriptor_sets(&driver, LAYOUT, DescriptorTypes::UNIFORM_BUFFER)
        .unwrap();
    manager.free_descriptor_set(&driver, set).unwrap();

    let err = manager.free_descriptor_set(&driver, set).unwrap_err();
    assert!(matches!(err, GpuError::InvalidState(_)));
    assert_eq!(manager.allocated_sets(), 0);
}

#[test]
fn set_from_a_foreign_pool_is_rejected() {
    let driver = MockDriver::new();
    let (mut manager, _) = pooled(4);
    let (mut other, _) = pooled(4);

    let foreign = other
        .allocate_descriptor_sets(&driver, LAYOUT, DescriptorTypes::UNIFORM_BUFFER)
        .unwrap();
    let err = manager.free_descriptor_set(&driver, foreign).unwrap_err();
    assert!(matches!(err, GpuError::InvalidState(_)));
}

#[test]
fn exhausted_pool_falls_back_to_a_new_pool() {
    let driver = MockDriver::new();
    let (mut manager, log) = pooled(8);
    let types = DescriptorTypes::STORAGE_IMAGE;

    let first = manager.allocate_descriptor_sets(&driver, LAYOUT, types).unwrap();
    driver.fail_next("allocate_descriptor_set");
    let second = manager.allocate_descriptor_sets(&driver, LAYOUT, types).unwrap();

    assert_ne!(first.pool, second.pool);
    assert_eq!(manager.pool_count(), 2);
    assert!(manager.pools()[0].is_exhausted());
    assert_eq!(log.messages(LogChannel::Warn).len(), 1);

    // Freeing into the exhausted pool makes it usable again
    manager.free_descriptor_set(&driver, first).unwrap();
    assert!(!manager.pools()[0].is_exhausted());
}

#[test]
fn empty_type_set_is_an_error() {
    let driver = MockDriver::new();
    let (mut manager, log) = pooled(4);

    let err = manager
        .allocate_descriptor_sets(&driver, LAYOUT, DescriptorTypes::empty())
        .unwrap_err();
    assert!(matches!(err, GpuError::Descriptor(_)));
    assert_eq!(manager.pool_count(), 0);
    assert_eq!(log.messages(LogChannel::Error).len(), 1);
}

#[test]
fn reset_destroys_every_pool() {
    let driver = MockDriver::new();
    let (mut manager, _) = pooled(1);

    for types in [
        DescriptorTypes::UNIFORM_BUFFER,
        DescriptorTypes::UNIFORM_BUFFER,
        DescriptorTypes::STORAGE_BUFFER,
    ] {
        manager.allocate_descriptor_sets(&driver, LAYOUT, types).unwrap();
    }
    assert_eq!(driver.live(ObjectKind::DescriptorPool), 3);

    manager.reset(&driver);
    assert_eq!(manager.pool_count(), 0);
    assert_eq!(driver.live(ObjectKind::DescriptorPool), 0);
    assert_eq!(driver.live(ObjectKind::DescriptorSet), 0);
}

#[test]
fn kernel_descriptor_sets_are_released_on_destroy() {
    let mut f = KernelFixture::new().bring_up().unwrap();
    let types = DescriptorTypes::from_types([
        vk::DescriptorType::UNIFORM_BUFFER,
        vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
    ])
    .unwrap();

    let kept = f.kernel.allocate_descriptor_sets(LAYOUT, types).unwrap();
    let freed = f.kernel.allocate_descriptor_sets(LAYOUT, types).unwrap();
    f.kernel.free_descriptor_set(freed).unwrap();
    assert_eq!(kept.pool, freed.pool);
    assert_eq!(f.kernel.descriptor_manager().unwrap().allocated_sets(), 1);

    f.kernel.destroy();
    f.driver.check_no_leaks().unwrap();
}

#[test]
fn descriptor_sets_need_an_initialized_kernel() {
    let mut f = KernelFixture::new();
    let err = f
        .kernel
        .allocate_descriptor_sets(LAYOUT, DescriptorTypes::UNIFORM_BUFFER)
        .unwrap_err();
    assert!(matches!(err, GpuError::InvalidState(_)));
}
