use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::error::ReplayError;

/// Capability boundary for trace bytes: traces are read through a store and
/// augmented traces are written back through one. Remote stores (object
/// storage, internal blob services) implement this trait; the engine never
/// touches transports directly.
#[async_trait]
pub trait BlobStore: Send + Sync + std::fmt::Debug {
    async fn read(&self, location: &str) -> Result<Vec<u8>>;
    async fn write(&self, location: &str, bytes: &[u8]) -> Result<()>;
}

/// Splits `<scheme>://<rest>`, returning `None` for plain paths.
pub fn split_scheme(location: &str) -> Option<(&str, &str)> {
    location.split_once("://")
}

/// Resolves the store responsible for `location`. Plain paths and `file://`
/// URLs map to the local filesystem; any other scheme is an unknown
/// transport.
pub fn store_for(location: &str) -> Result<Arc<dyn BlobStore>, ReplayError> {
    match split_scheme(location) {
        None | Some(("file", _)) => Ok(Arc::new(LocalFs)),
        Some((scheme, _)) => Err(ReplayError::UnknownTransport(scheme.to_owned())),
    }
}

/// Local-filesystem store. Writes create the parent directory on demand.
#[derive(Debug)]
pub struct LocalFs;

fn local_path(location: &str) -> &Path {
    Path::new(location.strip_prefix("file://").unwrap_or(location))
}

#[async_trait]
impl BlobStore for LocalFs {
    async fn read(&self, location: &str) -> Result<Vec<u8>> {
        tokio::fs::read(local_path(location))
            .await
            .with_context(|| format!("reading {location}"))
    }

    async fn write(&self, location: &str, bytes: &[u8]) -> Result<()> {
        let path = local_path(location);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        tokio::fs::write(path, bytes)
            .await
            .with_context(|| format!("writing {location}"))
    }
}
