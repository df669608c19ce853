//! Capability registry: id + semantic version -> implementation.
//!
//! Several versions of one capability id may be registered side by side.
//! Resolution picks the highest version satisfying the node's requirement,
//! or the highest registered version when the node names none.

use std::collections::HashMap;
use std::sync::Arc;

use blockrun_types::plan::CapabilityRef;
use semver::Version;

use super::CapabilityKind;
use super::box_capability::{BoxComputationalCapability, BoxInteractiveCapability};
use super::{ComputationalCapability, InteractiveCapability};

/// Registry lookup failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown capability '{id}'")]
    Unknown { id: String },

    #[error("no version of '{id}' satisfies '{requirement}' (registered: {available})")]
    NoMatchingVersion {
        id: String,
        requirement: String,
        available: String,
    },
}

/// A registered implementation.
#[derive(Clone)]
pub enum Capability {
    Computational(Arc<BoxComputationalCapability>),
    Interactive(Arc<BoxInteractiveCapability>),
}

impl Capability {
    pub fn kind(&self) -> CapabilityKind {
        match self {
            Capability::Computational(_) => CapabilityKind::Computational,
            Capability::Interactive(_) => CapabilityKind::Interactive,
        }
    }
}

/// A resolved registry entry.
#[derive(Clone)]
pub struct ResolvedCapability {
    pub id: String,
    pub version: Version,
    pub capability: Capability,
}

impl ResolvedCapability {
    pub fn kind(&self) -> CapabilityKind {
        self.capability.kind()
    }
}

impl std::fmt::Debug for ResolvedCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedCapability")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("kind", &self.kind())
            .finish()
    }
}

/// Versioned capability registry.
#[derive(Default)]
pub struct CapabilityRegistry {
    entries: HashMap<String, Vec<(Version, Capability)>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a computational capability. Replaces an identical id+version.
    pub fn register_computational<T: ComputationalCapability + 'static>(
        &mut self,
        id: impl Into<String>,
        version: Version,
        capability: T,
    ) {
        self.insert(
            id.into(),
            version,
            Capability::Computational(Arc::new(BoxComputationalCapability::new(capability))),
        );
    }

    /// Register an interactive capability. Replaces an identical id+version.
    pub fn register_interactive<T: InteractiveCapability + 'static>(
        &mut self,
        id: impl Into<String>,
        version: Version,
        capability: T,
    ) {
        self.insert(
            id.into(),
            version,
            Capability::Interactive(Arc::new(BoxInteractiveCapability::new(capability))),
        );
    }

    fn insert(&mut self, id: String, version: Version, capability: Capability) {
        let versions = self.entries.entry(id.clone()).or_default();
        if let Some(existing) = versions.iter_mut().find(|(v, _)| *v == version) {
            tracing::debug!(capability = %id, %version, "replacing registered capability");
            existing.1 = capability;
        } else {
            versions.push((version, capability));
            versions.sort_by(|a, b| a.0.cmp(&b.0));
        }
    }

    /// Resolve a reference to the best matching registered version.
    pub fn resolve(&self, reference: &CapabilityRef) -> Result<ResolvedCapability, RegistryError> {
        let versions = self.entries.get(&reference.id).ok_or_else(|| RegistryError::Unknown {
            id: reference.id.clone(),
        })?;

        let found = versions
            .iter()
            .rev()
            .find(|(v, _)| reference.version.as_ref().is_none_or(|req| req.matches(v)));

        match found {
            Some((version, capability)) => Ok(ResolvedCapability {
                id: reference.id.clone(),
                version: version.clone(),
                capability: capability.clone(),
            }),
            None => Err(RegistryError::NoMatchingVersion {
                id: reference.id.clone(),
                requirement: reference
                    .version
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
                available: versions
                    .iter()
                    .map(|(v, _)| v.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
        }
    }

    /// Registered versions of `id`, ascending.
    pub fn versions(&self, id: &str) -> Vec<Version> {
        self.entries
            .get(id)
            .map(|vs| vs.iter().map(|(v, _)| v.clone()).collect())
            .unwrap_or_default()
    }

    /// All registered ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}
