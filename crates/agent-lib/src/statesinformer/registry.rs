use super::plugins::{
    NodeMetricInformer, NodeInformer, NodeSloInformer, NodeTopoInformer, PodResourcesInformer,
    PodsInformer, PvcInformer,
};
use super::InformerPlugin;
use std::sync::Arc;
use tracing::debug;

/// Informer plugins keyed by name, in start order
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn InformerPlugin>>,
}

impl PluginRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in plugin
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(NodeInformer::new()));
        registry.register(Arc::new(PodsInformer::new()));
        registry.register(Arc::new(NodeTopoInformer::new()));
        registry.register(Arc::new(NodeSloInformer::new()));
        registry.register(Arc::new(NodeMetricInformer::new()));
        registry.register(Arc::new(PvcInformer::new()));
        registry.register(Arc::new(PodResourcesInformer::new()));
        registry
    }

    /// Add a plugin, replacing any registered under the same name
    pub fn register(&mut self, plugin: Arc<dyn InformerPlugin>) -> Option<Arc<dyn InformerPlugin>> {
        debug!(plugin = %plugin.name(), "Registering informer plugin");
        match self.plugins.iter().position(|p| p.name() == plugin.name()) {
            Some(index) => Some(std::mem::replace(&mut self.plugins[index], plugin)),
            None => {
                self.plugins.push(plugin);
                None
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<dyn InformerPlugin>> {
        let index = self.plugins.iter().position(|p| p.name() == name)?;
        Some(self.plugins.remove(index))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn InformerPlugin>> {
        self.plugins.iter().find(|p| p.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub(crate) fn into_plugins(self) -> Vec<Arc<dyn InformerPlugin>> {
        self.plugins
    }
}
