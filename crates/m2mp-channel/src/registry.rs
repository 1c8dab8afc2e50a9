use std::collections::BTreeMap;
use std::sync::Arc;

use m2mp_packet::PacketPool;

use crate::error::{ChannelError, Result};
use crate::null::NullChannel;
use crate::traits::Channel;

/// Builds an external channel that allocates from the given pool.
pub type ChannelConstructor =
    Box<dyn Fn(&Arc<PacketPool>) -> Result<Arc<dyn Channel>> + Send + Sync>;

/// Name-to-constructor table used to pick the external channel at startup.
pub struct ChannelRegistry {
    constructors: BTreeMap<String, ChannelConstructor>,
}

impl ChannelRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// A registry holding the built-in `"null"` channel.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("null", |pool| {
            Ok(Arc::new(NullChannel::new(Arc::clone(pool))) as Arc<dyn Channel>)
        });
        registry
    }

    /// Register (or replace) a constructor under `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(&Arc<PacketPool>) -> Result<Arc<dyn Channel>> + Send + Sync + 'static,
    {
        self.constructors.insert(name.into(), Box::new(constructor));
    }

    /// Construct the channel registered under `name`.
    pub fn create(&self, name: &str, pool: &Arc<PacketPool>) -> Result<Arc<dyn Channel>> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| ChannelError::UnknownChannel(name.to_string()))?;
        constructor(pool)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
