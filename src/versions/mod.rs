use crate::models::ImageRef;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// State file recording the latest selected tag per tracked image.
pub const VERSIONS_FILE: &str = "fblaster-versions.yml";

#[derive(Debug, Error)]
pub enum VersionFileError {
    #[error("invalid version file: {0}")]
    Invalid(#[from] serde_yaml::Error),
    #[error("cannot access version file: {0}")]
    Io(#[from] std::io::Error),
}

/// Load the persisted tag set, or `None` when no state file exists yet.
///
/// Every entry must be a `{registry, image, tag}` string triple.
pub async fn load(dir: &Path) -> Result<Option<Vec<ImageRef>>, VersionFileError> {
    let path = dir.join(VERSIONS_FILE);
    let text = match tokio::fs::read_to_string(&path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("no version file at {}", path.display());
            return Ok(None);
        },
        Err(e) => return Err(e.into()),
    };
    let refs: Vec<ImageRef> = serde_yaml::from_str(&text)?;
    Ok(Some(refs))
}

/// Replace initial tags with persisted ones where `(registry, image)`
/// matches. Never introduces images that are not in `initial`.
pub fn reconcile(initial: &[ImageRef], loaded: &[ImageRef]) -> Vec<ImageRef> {
    initial
        .iter()
        .map(|image| {
            match loaded.iter().find(|l| l.same_image(image)) {
                Some(persisted) => persisted.clone(),
                None => image.clone(),
            }
        })
        .collect()
}

/// Atomically replace the state file with the given tag set.
pub async fn save(dir: &Path, refs: &[ImageRef]) -> Result<(), VersionFileError> {
    let path = dir.join(VERSIONS_FILE);
    let tmp = dir.join(format!(".{VERSIONS_FILE}.tmp"));
    let text = serde_yaml::to_string(refs)?;
    tokio::fs::write(&tmp, text).await?;
    tokio::fs::rename(&tmp, &path).await?;
    debug!("persisted {} image versions to {}", refs.len(), path.display());
    Ok(())
}
