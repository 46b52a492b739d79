//! Registry of resource-group backends, keyed by their config tag.
//!
//! Pool config names each group entry by a short tag ("sfr", "asg", ...);
//! the same tag travels on drain-queue messages as the `Sender` attribute.
//! Backends register a provider here at startup and both the config reload
//! and the termination worker resolve through the table.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use lazy_static::lazy_static;

use crate::errors::ResourceGroupError;
use crate::resource_groups::interface::ResourceGroup;

/// Factory for one backend type.
pub trait ResourceGroupProvider: Send + Sync {
    /// Load every group the backend manages for this cluster/pool, keyed by
    /// group id. `config` is the backend-specific portion of the pool config
    /// entry.
    fn load(
        &self,
        cluster: &str,
        pool: &str,
        config: &serde_yaml::Value,
    ) -> Result<BTreeMap<String, Box<dyn ResourceGroup>>, ResourceGroupError>;

    /// Construct a transient handle to a single group, enough to terminate
    /// instances by id. Used by the termination worker, which only has the
    /// sender tag and group id from the queue message.
    fn attach(&self, group_id: &str) -> Result<Box<dyn ResourceGroup>, ResourceGroupError>;
}

lazy_static! {
    static ref PROVIDERS: RwLock<HashMap<String, Arc<dyn ResourceGroupProvider>>> =
        RwLock::new(HashMap::new());
}

/// Register (or replace) the provider for a backend tag.
pub fn register_resource_group_provider(tag: &str, provider: Arc<dyn ResourceGroupProvider>) {
    PROVIDERS
        .write()
        .expect("resource group registry poisoned")
        .insert(tag.to_string(), provider);
}

/// Look up the provider for a backend tag.
pub fn resource_group_provider(tag: &str) -> Option<Arc<dyn ResourceGroupProvider>> {
    PROVIDERS
        .read()
        .expect("resource group registry poisoned")
        .get(tag)
        .cloned()
}
