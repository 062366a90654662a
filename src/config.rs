//! Allocator parameters that can live in a JSON file.
//!
//! ```
//! use allocstack::config::StackConfig;
//!
//! let config = StackConfig::from_json(r#"{ "pool": { "max_size": 128 } }"#).unwrap();
//! assert_eq!(config.pool.max_size.get(), 128);
//! // Everything left out keeps its default
//! assert_eq!(config.linear, Default::default());
//! ```

use serde::{de::Error as _, Deserialize, Serialize};

use crate::{
    alloc::{
        block::{DecommitPolicy, RawBlockAllocator},
        linear::LinearAllocator,
        pool::{FreeListPolicy, PoolAllocator},
        Allocator,
    },
    os::mem::{page_size, MapError},
    units::{Alignment, Bytes},
};

/// A [`LinearAllocator`] over its own mapping
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearConfig {
    pub capacity: Bytes,
}

impl Default for LinearConfig {
    fn default() -> Self {
        Self {
            capacity: Bytes::mib(1),
        }
    }
}

impl LinearConfig {
    pub fn build(&self) -> Result<LinearAllocator<'static>, MapError> {
        LinearAllocator::new(self.capacity)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_size: Bytes,
    pub max_alignment: Alignment,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: Bytes::new(64),
            max_alignment: Alignment::DEFAULT,
        }
    }
}

impl PoolConfig {
    /// # Panics
    /// - If `max_size` is too small for the free-list policy `P`
    pub fn build<A, P>(&self, upstream: A) -> PoolAllocator<A, P>
    where
        A: Allocator,
        P: FreeListPolicy,
    {
        PoolAllocator::new(upstream, self.max_size, self.max_alignment)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockConfig {
    pub capacity: Bytes,
    pub block_size: Bytes,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            capacity: Bytes::mib(64),
            block_size: Bytes::kib(64),
        }
    }
}

impl BlockConfig {
    /// # Panics
    /// - If `block_size` is not a power of two of at least one page
    pub fn build<D: DecommitPolicy>(&self) -> Result<RawBlockAllocator<D>, MapError> {
        RawBlockAllocator::new(self.capacity, self.block_size)
    }
}

/// Everything needed to stand up a linear arena, a pool and a block allocator
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    pub linear: LinearConfig,
    pub pool: PoolConfig,
    pub block: BlockConfig,
}

impl StackConfig {
    /// Parse and check a configuration, so that the `build()` methods won't
    /// panic on what comes out.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let config: StackConfig = serde_json::from_str(json)?;
        config.validate().map_err(serde_json::Error::custom)?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        // The intrusive free list keeps a pointer in each free block
        let min_pool_block = Bytes::of::<usize>();
        if self.pool.max_size < min_pool_block {
            return Err(format!(
                "pool.max_size is {}, but must be at least {min_pool_block}",
                self.pool.max_size
            ));
        }
        let block_size = self.block.block_size;
        if !block_size.get().is_power_of_two() || block_size < page_size() {
            return Err(format!(
                "block.block_size is {block_size}, but must be a power of two of at least {}",
                page_size()
            ));
        }
        Ok(())
    }
}
