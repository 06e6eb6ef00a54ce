use crate::models::{ImageRef, TrackedImages};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Operator-authored input manifest, read-only to us.
pub const COMPOSE_FILE: &str = "docker-compose.yml";
/// Rewritten manifest the orchestration child actually consumes.
pub const DERIVED_COMPOSE_FILE: &str = "fblaster-docker-compose.yml";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("compose file has no services")]
    NoServices,
    #[error("service '{0}' has no image")]
    MissingImage(String),
    #[error("invalid compose YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// A single service entry. Everything besides `image` is opaque to us and
/// must survive parse/serialize byte-for-byte in meaning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    #[serde(default)]
    pub image: String,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Parsed compose manifest: the `services` mapping plus any other top-level
/// fields carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposeFile {
    pub services: BTreeMap<String, Service>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ComposeFile {
    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        let doc: Value = serde_yaml::from_str(text)?;
        match doc.get("services") {
            Some(Value::Mapping(m)) if !m.is_empty() => {},
            _ => return Err(ManifestError::NoServices),
        }

        let file: ComposeFile = serde_yaml::from_value(doc)?;
        for (name, service) in &file.services {
            if service.image.trim().is_empty() {
                return Err(ManifestError::MissingImage(name.clone()));
            }
        }
        Ok(file)
    }

    pub fn serialize(&self) -> Result<String, ManifestError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Tracked image references in service order, one per `(registry, image)`
    /// pair. Image strings that are not full `registry/image:tag` references
    /// are skipped.
    pub fn extract_tracked(&self, tracked: &TrackedImages) -> Vec<ImageRef> {
        let mut refs = Vec::new();
        let mut seen = HashSet::new();

        for service in self.services.values() {
            let Some(image) = ImageRef::parse(&service.image) else {
                continue;
            };
            if !tracked.matches(&image) {
                continue;
            }
            if seen.insert((image.registry.clone(), image.image.clone())) {
                refs.push(image);
            }
        }
        refs
    }

    /// Copy of the manifest with service images rewritten to the given
    /// references, matched by `(registry, image)`. Idempotent; services with
    /// no matching reference are untouched.
    pub fn merge(&self, refs: &[ImageRef]) -> ComposeFile {
        let mut merged = self.clone();
        for (name, service) in merged.services.iter_mut() {
            if let Some(current) = ImageRef::parse(&service.image)
                && let Some(target) = refs.iter().find(|r| r.same_image(&current))
                && target.tag != current.tag
            {
                debug!("rewriting {} image to {}", name, target);
                service.image = target.to_string();
            }
        }
        merged
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }
}

/// Read and parse the operator's manifest from the working directory.
pub async fn load_base(dir: &Path) -> Result<ComposeFile> {
    let path = dir.join(COMPOSE_FILE);
    let text = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("cannot read {}", path.display()))?;
    Ok(ComposeFile::parse(&text)?)
}

/// Write the derived manifest next to the input manifest.
pub async fn write_derived(dir: &Path, manifest: &ComposeFile) -> Result<()> {
    let path = dir.join(DERIVED_COMPOSE_FILE);
    let text = manifest.serialize()?;
    tokio::fs::write(&path, text)
        .await
        .with_context(|| format!("cannot write {}", path.display()))
}
