//! Relation identity models

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one relation instance
pub type RelationId = u32;

/// A relation as seen from the local application
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Relation {
    /// Relation instance id
    pub id: RelationId,
    /// Relation endpoint name (e.g. "certificates")
    pub name: String,
    /// Remote application, if it is known yet
    pub app: Option<String>,
    /// Remote units currently joined
    #[serde(default)]
    pub units: Vec<String>,
}

/// Owner of a relation databag
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase", tag = "kind", content = "name")]
pub enum DatabagOwner {
    /// Per-unit databag, writable by that unit
    Unit(String),
    /// Application databag, writable by the application leader
    App(String),
}

impl DatabagOwner {
    /// Name of the unit or application owning the databag
    pub fn name(&self) -> &str {
        match self {
            DatabagOwner::Unit(name) | DatabagOwner::App(name) => name,
        }
    }
}

impl fmt::Display for DatabagOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabagOwner::Unit(name) => write!(f, "unit {}", name),
            DatabagOwner::App(name) => write!(f, "app {}", name),
        }
    }
}

/// Application name of a unit name such as `requirer/0`
pub fn application_of(unit: &str) -> &str {
    unit.split_once('/').map(|(app, _)| app).unwrap_or(unit)
}
