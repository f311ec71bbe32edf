use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Result;
use crate::traits::Layer;
use crate::types::LayerKind;

/// Registry of layer clients, one per backend.
#[derive(Clone, Default)]
pub struct LayerRegistry {
    layers: HashMap<LayerKind, Arc<dyn Layer>>,
}

impl LayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a layer, replacing any previous client for the same kind.
    pub fn register(&mut self, layer: impl Layer) {
        self.register_arc(Arc::new(layer));
    }

    pub fn register_arc(&mut self, layer: Arc<dyn Layer>) {
        self.layers.insert(layer.kind(), layer);
    }

    pub fn get(&self, kind: LayerKind) -> Option<Arc<dyn Layer>> {
        self.layers.get(&kind).cloned()
    }

    /// Registered kinds in a stable order.
    pub fn kinds(&self) -> Vec<LayerKind> {
        let mut kinds: Vec<LayerKind> = self.layers.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Initialize every registered layer, returning each outcome.
    pub async fn initialize_all(&self) -> Vec<(LayerKind, Result<()>)> {
        let mut outcomes = Vec::new();
        for kind in self.kinds() {
            let layer = &self.layers[&kind];
            let result = layer.initialize().await;
            if let Err(ref e) = result {
                warn!(layer = %kind, error = %e, "Layer initialization failed");
            }
            outcomes.push((kind, result));
        }
        outcomes
    }

    /// Snapshot every layer's readiness probe.
    pub fn probe(&self) -> Availability {
        let mut availability = Availability::default();
        for kind in self.kinds() {
            let available = self.layers[&kind].is_available();
            debug!(layer = %kind, available, "Probed layer");
            availability.set(kind, available);
        }
        availability
    }
}

/// Point-in-time readiness of each layer, taken once per run.
///
/// Layers absent from the snapshot count as unavailable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Availability {
    status: BTreeMap<LayerKind, bool>,
}

impl Availability {
    /// Every known layer marked available.
    pub fn all_available() -> Self {
        let mut availability = Self::default();
        for kind in LayerKind::ALL {
            availability.set(kind, true);
        }
        availability
    }

    pub fn set(&mut self, kind: LayerKind, available: bool) {
        self.status.insert(kind, available);
    }

    pub fn with(mut self, kind: LayerKind, available: bool) -> Self {
        self.set(kind, available);
        self
    }

    pub fn is_available(&self, kind: LayerKind) -> bool {
        self.status.get(&kind).copied().unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (LayerKind, bool)> + '_ {
        self.status.iter().map(|(k, v)| (*k, *v))
    }
}
