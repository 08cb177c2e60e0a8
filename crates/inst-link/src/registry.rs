//! Instrument registry
//!
//! Maps instrument ids to how they are reached and which protocol they
//! speak. The driver consults it synchronously on every open.

use std::collections::HashMap;

use inst_protocol::InstrumentKind;
use serde::{Deserialize, Serialize};

use crate::transport::Endpoint;

/// A configured instrument
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Stable id used by `open_port`
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Protocol family
    pub kind: InstrumentKind,
    /// Where to find it
    pub endpoint: Endpoint,
}

impl InstrumentConfig {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            self.kind.name()
        } else {
            &self.name
        }
    }
}

/// Lookup of instrument configurations by id
pub trait InstrumentRegistry: Send + Sync {
    fn lookup(&self, id: &str) -> Option<InstrumentConfig>;
}

/// Registry backed by a fixed table
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    instruments: HashMap<String, InstrumentConfig>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a list; later entries replace earlier ones with the same id
    pub fn from_configs(configs: impl IntoIterator<Item = InstrumentConfig>) -> Self {
        let mut registry = Self::new();
        for config in configs {
            registry.insert(config);
        }
        registry
    }

    pub fn insert(&mut self, config: InstrumentConfig) {
        self.instruments.insert(config.id.clone(), config);
    }

    /// All instruments sorted by id
    pub fn list(&self) -> Vec<&InstrumentConfig> {
        let mut all: Vec<_> = self.instruments.values().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}

impl InstrumentRegistry for StaticRegistry {
    fn lookup(&self, id: &str) -> Option<InstrumentConfig> {
        self.instruments.get(id).cloned()
    }
}
