use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Declared interpretation of a sensor's 32-bit sample value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    U32,
    I32,
    F32,
    Event,
}

impl ValueKind {
    /// Fixed in-sector record size. Event records carry an extra
    /// value-type discriminator byte, padded to keep slots aligned.
    pub fn record_len(self) -> u16 {
        match self {
            ValueKind::Event => 16,
            _ => 12,
        }
    }

    /// On-the-wire record size inside an upload packet group.
    pub fn wire_len(self) -> usize {
        match self {
            ValueKind::Event => 13,
            _ => 12,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorDescriptor {
    pub id: u32,
    pub name: String,
    pub value_type: ValueKind,
    #[serde(default)]
    pub sample_rate_hint: u16,
}

/// The sensor table handed to the engine at startup. Sensors are created at
/// configuration load and live for the process lifetime.
#[derive(Debug, Clone)]
pub struct SensorTable {
    by_id: HashMap<u32, SensorDescriptor>,
    ordered: Vec<u32>,
}

impl SensorTable {
    pub fn from_descriptors(descriptors: Vec<SensorDescriptor>) -> Result<Self> {
        if descriptors.is_empty() {
            bail!("sensor table is empty");
        }
        let mut by_id = HashMap::with_capacity(descriptors.len());
        let mut ordered = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if descriptor.name.trim().is_empty() {
                bail!("sensor {} has an empty name", descriptor.id);
            }
            if by_id.contains_key(&descriptor.id) {
                bail!("duplicate sensor id {}", descriptor.id);
            }
            ordered.push(descriptor.id);
            by_id.insert(descriptor.id, descriptor);
        }
        Ok(Self { by_id, ordered })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read sensor table {}", path.display()))?;
        let descriptors: Vec<SensorDescriptor> =
            serde_json::from_str(&raw).context("parse sensor table")?;
        Self::from_descriptors(descriptors)
    }

    pub fn get(&self, id: u32) -> Option<&SensorDescriptor> {
        self.by_id.get(&id)
    }

    pub fn ids(&self) -> &[u32] {
        &self.ordered
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}
