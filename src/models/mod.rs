use serde::{Deserialize, Serialize};
use std::fmt;

/// A fully qualified image reference as it appears in a compose manifest.
///
/// Identity is `(registry, image)`; the tag is the part that moves over time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub registry: String,
    pub image: String,
    pub tag: String,
}

impl ImageRef {
    pub fn new(
        registry: impl Into<String>,
        image: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            registry: registry.into(),
            image: image.into(),
            tag: tag.into(),
        }
    }

    /// Parse a canonical `registry/image:tag` string.
    ///
    /// The registry is the segment before the first `/` and must look like a
    /// host (contains `.` or `:`, or is `localhost`), so Docker Hub style
    /// `namespace/image` strings and bare `image:tag` strings yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        let (registry, rest) = s.split_once('/')?;
        if !is_registry_host(registry) {
            return None;
        }
        let (image, tag) = rest.rsplit_once(':')?;
        if image.is_empty() || tag.is_empty() {
            return None;
        }
        Some(Self::new(registry, image, tag))
    }

    /// True when `other` names the same `(registry, image)` pair.
    pub fn same_image(&self, other: &ImageRef) -> bool {
        self.registry == other.registry && self.image == other.image
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.image, self.tag)
    }
}

fn is_registry_host(s: &str) -> bool {
    !s.is_empty() && (s.contains('.') || s.contains(':') || s == "localhost")
}

/// The operator-configured set of images whose tags may be advanced.
///
/// Entries are either `registry/image` or a bare image name matched against
/// the repository path suffix.
#[derive(Debug, Clone, Default)]
pub struct TrackedImages(Vec<String>);

impl TrackedImages {
    pub fn new(entries: Vec<String>) -> Self {
        Self(entries)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, image: &ImageRef) -> bool {
        self.0.iter().any(|entry| {
            entry == &image.image
                || image.image.ends_with(&format!("/{entry}"))
                || *entry == format!("{}/{}", image.registry, image.image)
        })
    }
}
