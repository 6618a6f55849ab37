//! Plugin registry: registration, order resolution and instantiation.
//!
//! The registry is an ordinary value owned by whoever builds the proxy; there is no global
//! instance, so several isolated proxies can coexist in one process.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::chain::InterceptorChain;
use crate::error::{ProxyError, Result};
use crate::plugin::{Plugin, PluginContext};

struct Registration {
    plugin: Arc<dyn Plugin>,
    seq: u64,
}

/// Plugins keyed by id.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Registration>,
    next_seq: u64,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin.
    ///
    /// Registering an id that already exists replaces the earlier plugin; the replacement is
    /// ordered as if it had just been registered.
    pub fn register(&mut self, plugin: impl Plugin + 'static) {
        self.register_arc(Arc::new(plugin));
    }

    pub fn register_arc(&mut self, plugin: Arc<dyn Plugin>) {
        let id = plugin.id().to_string();
        let seq = self.next_seq;
        self.next_seq += 1;
        if self
            .plugins
            .insert(id.clone(), Registration { plugin, seq })
            .is_some()
        {
            tracing::debug!(plugin = %id, "Replaced registered plugin");
        }
    }

    /// Remove a plugin. Returns whether it was registered.
    pub fn unregister(&mut self, id: &str) -> bool {
        self.plugins.remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(id).map(|r| r.plugin.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.plugins.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Plugins in execution order.
    ///
    /// Ascending priority, ties broken by registration order, and every plugin after its
    /// dependencies. A plugin depending on an unregistered id is left out along with its own
    /// dependents. A dependency cycle is a configuration error.
    pub fn resolve(&self) -> Result<Vec<Arc<dyn Plugin>>> {
        let deps: HashMap<&str, Vec<String>> = self
            .plugins
            .iter()
            .map(|(id, r)| (id.as_str(), r.plugin.dependencies()))
            .collect();

        // Drop plugins with unsatisfiable dependencies until stable
        let mut active: HashSet<&str> = deps.keys().copied().collect();
        loop {
            let missing: Vec<(&str, String)> = active
                .iter()
                .filter_map(|id| {
                    deps[id]
                        .iter()
                        .find(|d| !active.contains(d.as_str()))
                        .map(|d| (*id, d.clone()))
                })
                .collect();
            if missing.is_empty() {
                break;
            }
            for (id, dep) in missing {
                tracing::warn!(
                    plugin = %id,
                    dependency = %dep,
                    "Plugin disabled: missing dependency"
                );
                active.remove(id);
            }
        }

        // Kahn's algorithm, always taking the lowest (priority, seq) among ready plugins
        let mut indegree: HashMap<&str, usize> = active.iter().map(|id| (*id, 0)).collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for id in &active {
            let unique: HashSet<&str> = deps[id].iter().map(String::as_str).collect();
            for dep in unique {
                *indegree.entry(*id).or_default() += 1;
                dependents.entry(dep).or_default().push(*id);
            }
        }

        let key = |id: &str| {
            let r = &self.plugins[id];
            Reverse((r.plugin.priority(), r.seq))
        };
        let mut ready: BinaryHeap<(Reverse<(i32, u64)>, &str)> = indegree
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| (key(*id), *id))
            .collect();

        let mut order = Vec::with_capacity(active.len());
        while let Some((_, id)) = ready.pop() {
            order.push(self.plugins[id].plugin.clone());
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(n) = indegree.get_mut(dependent) {
                    *n -= 1;
                    if *n == 0 {
                        ready.push((key(*dependent), *dependent));
                    }
                }
            }
        }

        if order.len() < active.len() {
            let resolved: HashSet<&str> = order.iter().map(|p| p.id()).collect();
            let cyclic: BTreeSet<&str> = active
                .iter()
                .copied()
                .filter(|id| !resolved.contains(id))
                .collect();
            return Err(ProxyError::Configuration(format!(
                "plugin dependency cycle among: {}",
                cyclic.into_iter().collect::<Vec<_>>().join(", ")
            )));
        }

        Ok(order)
    }

    /// Build the interceptor chain. Plugins whose factory fails are left out.
    pub fn instantiate(
        &self,
        ctx: &PluginContext,
        hook_timeout: Duration,
    ) -> Result<InterceptorChain> {
        let mut chain = InterceptorChain::new(hook_timeout);
        for plugin in self.resolve()? {
            let plugin_ctx = ctx.for_plugin(plugin.id());
            match plugin.create_interceptor(&plugin_ctx) {
                Ok(interceptor) => {
                    tracing::debug!(
                        plugin = %plugin.id(),
                        version = %plugin.version(),
                        priority = plugin.priority(),
                        "Plugin enabled"
                    );
                    chain.push(plugin.id(), interceptor);
                }
                Err(e) => {
                    tracing::warn!(plugin = %plugin.id(), error = %e, "Plugin disabled");
                }
            }
        }
        Ok(chain)
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<&String> = self.plugins.keys().collect();
        ids.sort();
        f.debug_struct("PluginRegistry").field("plugins", &ids).finish()
    }
}
