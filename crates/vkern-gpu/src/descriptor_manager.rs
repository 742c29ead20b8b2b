//! Descriptor set allocation across a growing list of pools.

use std::sync::Arc;

use ash::vk;
use vkern_core::{KernelObject, LogSink};

use crate::descriptors::{DescriptorPool, DescriptorSet, DescriptorTypes, PoolPolicy};
use crate::driver::Driver;
use crate::error::{GpuError, Result};

/// Routes descriptor set requests to a pool built for the same type set.
///
/// Pools are scanned in creation order. When every matching pool is full a
/// new one is appended, so two pools may serve the same type set. Not
/// internally synchronized.
pub struct DescriptorManager {
    pools: Vec<DescriptorPool>,
    policy: PoolPolicy,
    log: Arc<dyn LogSink>,
}

impl DescriptorManager {
    pub fn new(policy: PoolPolicy, log: Arc<dyn LogSink>) -> Self {
        Self {
            pools: Vec::new(),
            policy,
            log,
        }
    }

    pub fn policy(&self) -> &PoolPolicy {
        &self.policy
    }

    /// Allocate a set with `layout` from a pool serving exactly `types`.
    pub fn allocate_descriptor_sets<D: Driver>(
        &mut self,
        driver: &D,
        layout: vk::DescriptorSetLayout,
        types: DescriptorTypes,
    ) -> Result<DescriptorSet> {
        for pool in self.pools.iter_mut().filter(|p| p.accepts(types)) {
            if let Some(set) = pool.allocate(driver, layout)? {
                return Ok(set);
            }
            if pool.is_exhausted() {
                self.log.warn(&format!(
                    "DescriptorManager: pool {:?} is out of descriptors with {} of {} sets used",
                    pool.handle(),
                    pool.used(),
                    pool.capacity()
                ));
            }
        }

        self.log.graph(&format!(
            "DescriptorManager: create new descriptor pool for {types:?}"
        ));

        let mut pool = DescriptorPool::create(driver, types, &self.policy).map_err(|e| {
            self.log.error(&format!(
                "DescriptorManager: failed to create descriptor pool: {e}"
            ));
            e
        })?;

        let set = match pool.allocate(driver, layout) {
            Ok(Some(set)) => set,
            Ok(None) => {
                pool.destroy(driver);
                self.log
                    .error("DescriptorManager: fresh descriptor pool refused allocation");
                return Err(GpuError::Descriptor(format!(
                    "cannot allocate descriptor set for {types:?}"
                )));
            }
            Err(e) => {
                pool.destroy(driver);
                self.log.error(&format!(
                    "DescriptorManager: failed to allocate descriptor set: {e}"
                ));
                return Err(e);
            }
        };

        self.pools.push(pool);
        Ok(set)
    }

    /// Return a set to its pool. The pool itself stays alive.
    pub fn free_descriptor_set<D: Driver>(&mut self, driver: &D, set: DescriptorSet) -> Result<()> {
        let pool = self
            .pools
            .iter_mut()
            .find(|p| p.handle() == set.pool)
            .ok_or_else(|| {
                GpuError::InvalidState(format!(
                    "descriptor pool {:?} is not owned by this manager",
                    set.pool
                ))
            })?;

        pool.free(driver, set.set)
    }

    /// Destroy every pool.
    pub fn reset<D: Driver>(&mut self, driver: &D) {
        for pool in &mut self.pools {
            pool.destroy(driver);
        }
        self.pools.clear();
    }

    /// Reset, then release the manager itself.
    pub fn free<D: Driver>(mut self, driver: &D) {
        self.log
            .log("DescriptorManager: free descriptor manager...");
        self.reset(driver);
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Sets currently allocated across all pools.
    pub fn allocated_sets(&self) -> usize {
        self.pools.iter().map(DescriptorPool::used).sum()
    }

    pub fn pools(&self) -> &[DescriptorPool] {
        &self.pools
    }
}

impl KernelObject for DescriptorManager {
    fn is_ready(&self) -> bool {
        self.pools.iter().all(KernelObject::is_ready)
    }
}

impl std::fmt::Debug for DescriptorManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorManager")
            .field("pools", &self.pools.len())
            .field("allocated_sets", &self.allocated_sets())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
