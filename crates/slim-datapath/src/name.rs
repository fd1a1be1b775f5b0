//! Hierarchical participant names.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{DatapathError, Result};

/// An ordered, non-empty sequence of components plus an optional instance id.
///
/// Without an id the name is a logical address that may match many instances;
/// with an id it addresses exactly one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Name {
    components: Vec<String>,
    id: Option<u64>,
}

impl Name {
    /// Builds a name, rejecting an empty component list or empty components.
    pub fn new<I, S>(components: I, id: Option<u64>) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let components: Vec<String> = components.into_iter().map(Into::into).collect();
        if components.is_empty() {
            return Err(DatapathError::InvalidName(
                "component list is empty".to_string(),
            ));
        }
        if let Some(pos) = components.iter().position(|c| c.is_empty()) {
            return Err(DatapathError::InvalidName(format!(
                "component {} is empty",
                pos
            )));
        }
        Ok(Self { components, id })
    }

    /// Rebuilds a name from table keys that were validated on insertion.
    pub(crate) fn from_parts(components: Vec<String>, id: Option<u64>) -> Self {
        Self { components, id }
    }

    /// Hierarchical components, e.g. `["org", "ns", "svc"]`.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Instance identifier, if any.
    pub fn id(&self) -> Option<u64> {
        self.id
    }

    /// True when an instance identifier is set.
    pub fn has_id(&self) -> bool {
        self.id.is_some()
    }

    /// Same components with instance `id`.
    #[must_use]
    pub fn with_id(&self, id: u64) -> Self {
        Self {
            components: self.components.clone(),
            id: Some(id),
        }
    }

    /// Same components with no instance identifier; matches any instance.
    #[must_use]
    pub fn without_id(&self) -> Self {
        Self {
            components: self.components.clone(),
            id: None,
        }
    }

    /// Stable application identifier: the first eight bytes (big-endian) of
    /// SHA-256 over the components. The instance id does not contribute.
    pub fn app_id(&self) -> u64 {
        let mut hasher = Sha256::new();
        for component in &self.components {
            hasher.update((component.len() as u32).to_be_bytes());
            hasher.update(component.as_bytes());
        }
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(bytes)
    }

    /// True when traffic addressed to `destination` should reach a
    /// subscription on `self`.
    ///
    /// Components must match exactly. A destination with an id matches a
    /// subscription with the same id or with no id; a destination without an
    /// id matches any subscription.
    pub fn matches(&self, destination: &Name) -> bool {
        if self.components != destination.components {
            return false;
        }
        match (destination.id, self.id) {
            (Some(wanted), Some(have)) => wanted == have,
            _ => true,
        }
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.components.join("/"))?;
        if let Some(id) = self.id {
            write!(f, "/0x{:x}", id)?;
        }
        Ok(())
    }
}
