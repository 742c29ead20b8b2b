//! Descriptor pools sized by a per-type weight table.

use crate::driver::Driver;
use crate::error::{GpuError, Result};
use ash::vk;
use bitflags::bitflags;
use vkern_core::KernelObject;

bitflags! {
    /// Set of descriptor types a pool is built for.
    ///
    /// Compared by value, so the order types were requested in is irrelevant.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DescriptorTypes: u16 {
        const SAMPLER = 1 << 0;
        const COMBINED_IMAGE_SAMPLER = 1 << 1;
        const SAMPLED_IMAGE = 1 << 2;
        const STORAGE_IMAGE = 1 << 3;
        const UNIFORM_TEXEL_BUFFER = 1 << 4;
        const STORAGE_TEXEL_BUFFER = 1 << 5;
        const UNIFORM_BUFFER = 1 << 6;
        const STORAGE_BUFFER = 1 << 7;
        const UNIFORM_BUFFER_DYNAMIC = 1 << 8;
        const STORAGE_BUFFER_DYNAMIC = 1 << 9;
        const INPUT_ATTACHMENT = 1 << 10;
    }
}

impl DescriptorTypes {
    /// Flag for a single core descriptor type.
    ///
    /// The core types have raw values 0..=10, matching the bit positions.
    pub fn from_vk(ty: vk::DescriptorType) -> Option<Self> {
        u32::try_from(ty.as_raw())
            .ok()
            .filter(|&raw| raw <= 10)
            .and_then(|raw| Self::from_bits(1 << raw))
    }

    /// Collect requested types, rejecting anything outside the core set.
    pub fn from_types<I>(types: I) -> Result<Self>
    where
        I: IntoIterator<Item = vk::DescriptorType>,
    {
        types.into_iter().try_fold(Self::empty(), |acc, ty| {
            Self::from_vk(ty)
                .map(|flag| acc | flag)
                .ok_or_else(|| GpuError::Descriptor(format!("unsupported descriptor type {ty:?}")))
        })
    }

    /// The `vk::DescriptorType` of every member, in raw value order.
    pub fn to_vk(self) -> Vec<vk::DescriptorType> {
        self.iter()
            .map(|flag| vk::DescriptorType::from_raw(flag.bits().trailing_zeros() as i32))
            .collect()
    }

    pub fn contains_vk(self, ty: vk::DescriptorType) -> bool {
        Self::from_vk(ty).is_some_and(|flag| self.contains(flag))
    }
}

/// Descriptor pool sizing policy.
///
/// Each pool holds `max_sets` sets; a requested type with weight `w` gets
/// `floor(w * max_sets)` descriptors, at least one.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolPolicy {
    pub max_sets: u32,
    pub weights: Vec<(vk::DescriptorType, f32)>,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            max_sets: 1000,
            weights: vec![
                (vk::DescriptorType::SAMPLER, 0.5),
                (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 4.0),
                (vk::DescriptorType::SAMPLED_IMAGE, 4.0),
                (vk::DescriptorType::STORAGE_IMAGE, 1.0),
                (vk::DescriptorType::UNIFORM_TEXEL_BUFFER, 1.0),
                (vk::DescriptorType::STORAGE_TEXEL_BUFFER, 1.0),
                (vk::DescriptorType::UNIFORM_BUFFER, 2.0),
                (vk::DescriptorType::STORAGE_BUFFER, 2.0),
                (vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, 1.0),
                (vk::DescriptorType::STORAGE_BUFFER_DYNAMIC, 1.0),
                (vk::DescriptorType::INPUT_ATTACHMENT, 0.5),
            ],
        }
    }
}

impl PoolPolicy {
    pub fn with_max_sets(mut self, max_sets: u32) -> Self {
        self.max_sets = max_sets;
        self
    }

    /// Weight of `ty`; types missing from the table weigh 1.
    pub fn weight(&self, ty: vk::DescriptorType) -> f32 {
        self.weights
            .iter()
            .find(|(t, _)| *t == ty)
            .map_or(1.0, |(_, w)| *w)
    }

    /// Pool sizes for a pool serving `types`.
    pub fn pool_sizes(&self, types: DescriptorTypes) -> Vec<vk::DescriptorPoolSize> {
        types
            .to_vk()
            .into_iter()
            .map(|ty| {
                let count = (self.weight(ty) * self.max_sets as f32).floor() as u32;
                vk::DescriptorPoolSize {
                    ty,
                    descriptor_count: count.max(1),
                }
            })
            .collect()
    }
}

/// A descriptor set together with the pool it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorSet {
    pub pool: vk::DescriptorPool,
    pub set: vk::DescriptorSet,
}

/// Fixed-capacity slot table over one API descriptor pool.
#[derive(Debug)]
pub struct DescriptorPool {
    handle: vk::DescriptorPool,
    types: DescriptorTypes,
    slots: Vec<Option<vk::DescriptorSet>>,
    used: usize,
    exhausted: bool,
}

impl DescriptorPool {
    /// Create a pool for `types` sized by `policy`.
    pub fn create<D: Driver>(driver: &D, types: DescriptorTypes, policy: &PoolPolicy) -> Result<Self> {
        if types.is_empty() {
            return Err(GpuError::Descriptor(
                "no descriptor types requested".to_string(),
            ));
        }
        if policy.max_sets == 0 {
            return Err(GpuError::Descriptor("pool capacity is zero".to_string()));
        }

        let sizes = policy.pool_sizes(types);
        let handle = driver.create_descriptor_pool(&sizes, policy.max_sets)?;

        Ok(Self {
            handle,
            types,
            slots: vec![None; policy.max_sets as usize],
            used: 0,
            exhausted: false,
        })
    }

    pub fn handle(&self) -> vk::DescriptorPool {
        self.handle
    }

    pub fn types(&self) -> DescriptorTypes {
        self.types
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    /// The API refused an allocation although slots were free.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// First free slot, if any.
    pub fn find_free(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }

    /// Whether this pool can take a request for `types`.
    pub fn accepts(&self, types: DescriptorTypes) -> bool {
        self.types == types && !self.exhausted
    }

    /// Allocate one set into the first free slot.
    ///
    /// `Ok(None)` means the pool cannot serve the request: it is full, or
    /// the API ran out of pool memory (the pool is then marked exhausted).
    pub fn allocate<D: Driver>(
        &mut self,
        driver: &D,
        layout: vk::DescriptorSetLayout,
    ) -> Result<Option<DescriptorSet>> {
        let Some(slot) = self.find_free() else {
            return Ok(None);
        };

        match driver.allocate_descriptor_set(self.handle, layout) {
            Ok(set) => {
                self.slots[slot] = Some(set);
                self.used += 1;
                Ok(Some(DescriptorSet {
                    pool: self.handle,
                    set,
                }))
            }
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => {
                self.exhausted = true;
                Ok(None)
            }
            Err(e) => Err(GpuError::from(e)),
        }
    }

    /// Return `set` to the pool. Fails if the set is not allocated here.
    pub fn free<D: Driver>(&mut self, driver: &D, set: vk::DescriptorSet) -> Result<()> {
        let slot = self
            .slots
            .iter()
            .position(|s| *s == Some(set))
            .ok_or_else(|| {
                GpuError::InvalidState(format!("descriptor set {set:?} is not allocated"))
            })?;

        driver.free_descriptor_set(self.handle, set)?;
        self.slots[slot] = None;
        self.used -= 1;
        self.exhausted = false;
        Ok(())
    }

    /// Destroy the API pool, which frees every set in it.
    pub fn destroy<D: Driver>(&mut self, driver: &D) {
        if self.handle != vk::DescriptorPool::null() {
            driver.destroy_descriptor_pool(self.handle);
            self.handle = vk::DescriptorPool::null();
        }
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.used = 0;
    }
}

impl KernelObject for DescriptorPool {
    fn is_ready(&self) -> bool {
        self.handle != vk::DescriptorPool::null()
    }

    fn is_complete(&self) -> bool {
        self.is_ready() && !self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_sets_ignore_request_order() {
        let a = DescriptorTypes::from_types([
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        ])
        .unwrap();
        let b = DescriptorTypes::from_types([
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::DescriptorType::UNIFORM_BUFFER,
        ])
        .unwrap();
        let c = DescriptorTypes::from_types([vk::DescriptorType::UNIFORM_BUFFER]).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn vk_conversion_covers_core_types() {
        let all: Vec<_> = (0..=10).map(vk::DescriptorType::from_raw).collect();
        let types = DescriptorTypes::from_types(all.iter().copied()).unwrap();
        assert_eq!(types, DescriptorTypes::all());
        assert_eq!(types.to_vk(), all);
        assert!(types.contains_vk(vk::DescriptorType::INPUT_ATTACHMENT));
    }

    #[test]
    fn extension_types_are_rejected() {
        let err = DescriptorTypes::from_types([vk::DescriptorType::ACCELERATION_STRUCTURE_KHR])
            .unwrap_err();
        assert!(matches!(err, GpuError::Descriptor(_)));
    }

    #[test]
    fn default_policy_matches_weight_table() {
        let policy = PoolPolicy::default();
        let types = DescriptorTypes::SAMPLER
            | DescriptorTypes::UNIFORM_BUFFER
            | DescriptorTypes::COMBINED_IMAGE_SAMPLER;

        let sizes = policy.pool_sizes(types);
        let count = |ty| {
            sizes
                .iter()
                .find(|s| s.ty == ty)
                .map(|s| s.descriptor_count)
        };

        assert_eq!(sizes.len(), 3);
        assert_eq!(count(vk::DescriptorType::SAMPLER), Some(500));
        assert_eq!(count(vk::DescriptorType::COMBINED_IMAGE_SAMPLER), Some(4000));
        assert_eq!(count(vk::DescriptorType::UNIFORM_BUFFER), Some(2000));
        assert_eq!(count(vk::DescriptorType::STORAGE_BUFFER), None);
    }

    #[test]
    fn small_pools_keep_at_least_one_descriptor() {
        let policy = PoolPolicy::default().with_max_sets(1);
        let sizes = policy.pool_sizes(DescriptorTypes::INPUT_ATTACHMENT);
        assert_eq!(sizes[0].descriptor_count, 1);
    }

    #[test]
    fn missing_weight_defaults_to_one() {
        let policy = PoolPolicy {
            max_sets: 8,
            weights: Vec::new(),
        };
        let sizes = policy.pool_sizes(DescriptorTypes::STORAGE_IMAGE);
        assert_eq!(sizes[0].descriptor_count, 8);
    }
}
