//! Artifact storage: deterministic addressing plus the blob-store contract.
//!
//! Every artifact a document produces lives at
//! `{organization_id}/{project_id}/{file_id}/{stage}/{name}`. The address is a
//! pure function of those four inputs, so re-running a stage overwrites the
//! same address instead of accumulating new blobs.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::debug;

use crate::error::StorageError;

/// Which pipeline stage an artifact belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Raw,
    Converted,
    Enriched,
    Chunks,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Raw => "raw",
            ArtifactKind::Converted => "converted",
            ArtifactKind::Enriched => "enriched",
            ArtifactKind::Chunks => "chunks",
        }
    }
}

/// Deterministic artifact address.
pub fn artifact_path(
    organization_id: &str,
    project_id: &str,
    file_id: &str,
    kind: ArtifactKind,
    name: &str,
) -> String {
    format!(
        "{organization_id}/{project_id}/{file_id}/{}/{name}",
        kind.as_str()
    )
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Blob-store contract consumed by the pipeline. Keyed by address string;
/// the concrete backend (cloud bucket, local disk) is interchangeable.
pub trait ArtifactStore: Send + Sync {
    fn upload<'a>(
        &'a self,
        address: &'a str,
        content: &'a [u8],
        content_type: &'a str,
    ) -> BoxFuture<'a, StorageResult<()>>;

    fn download<'a>(&'a self, address: &'a str) -> BoxFuture<'a, StorageResult<Vec<u8>>>;

    fn delete<'a>(&'a self, address: &'a str) -> BoxFuture<'a, StorageResult<()>>;

    fn exists<'a>(&'a self, address: &'a str) -> BoxFuture<'a, StorageResult<bool>>;

    /// A URL a client can fetch the artifact from for a bounded time.
    fn signed_url<'a>(
        &'a self,
        address: &'a str,
        expires_in: Duration,
    ) -> BoxFuture<'a, StorageResult<String>>;
}

/// Artifact store backed by a local directory under the service data dir.
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Resolve an address to a path under the root, rejecting anything that
    /// would escape it.
    fn resolve(&self, address: &str) -> StorageResult<PathBuf> {
        let rel = Path::new(address);
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if address.is_empty() || escapes {
            return Err(StorageError::InvalidAddress {
                address: address.to_string(),
            });
        }
        Ok(self.root.join(rel))
    }
}

impl ArtifactStore for LocalArtifactStore {
    fn upload<'a>(
        &'a self,
        address: &'a str,
        content: &'a [u8],
        _content_type: &'a str,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let path = self.resolve(address)?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StorageError::Io {
                        address: address.to_string(),
                        source: e,
                    })?;
            }
            tokio::fs::write(&path, content)
                .await
                .map_err(|e| StorageError::Io {
                    address: address.to_string(),
                    source: e,
                })?;
            debug!(address = %address, bytes = content.len(), "Artifact uploaded");
            Ok(())
        })
    }

    fn download<'a>(&'a self, address: &'a str) -> BoxFuture<'a, StorageResult<Vec<u8>>> {
        Box::pin(async move {
            let path = self.resolve(address)?;
            match tokio::fs::read(&path).await {
                Ok(bytes) => Ok(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(StorageError::NotFound {
                        address: address.to_string(),
                    })
                }
                Err(e) => Err(StorageError::Io {
                    address: address.to_string(),
                    source: e,
                }),
            }
        })
    }

    fn delete<'a>(&'a self, address: &'a str) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let path = self.resolve(address)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(StorageError::Io {
                    address: address.to_string(),
                    source: e,
                }),
            }
        })
    }

    fn exists<'a>(&'a self, address: &'a str) -> BoxFuture<'a, StorageResult<bool>> {
        Box::pin(async move {
            let path = self.resolve(address)?;
            Ok(tokio::fs::try_exists(&path).await.unwrap_or(false))
        })
    }

    fn signed_url<'a>(
        &'a self,
        address: &'a str,
        _expires_in: Duration,
    ) -> BoxFuture<'a, StorageResult<String>> {
        Box::pin(async move {
            let path = self.resolve(address)?;
            Ok(format!("file://{}", path.display()))
        })
    }
}

#[cfg(test)]
pub(crate) mod memory {
    //! In-memory artifact store for tests.

    use std::time::Duration;

    use dashmap::DashMap;
    use futures::future::BoxFuture;

    use super::{ArtifactStore, StorageResult};
    use crate::error::StorageError;

    #[derive(Default)]
    pub struct MemoryArtifactStore {
        blobs: DashMap<String, Vec<u8>>,
    }

    impl MemoryArtifactStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn addresses(&self) -> Vec<String> {
            let mut addrs: Vec<String> =
                self.blobs.iter().map(|e| e.key().clone()).collect();
            addrs.sort();
            addrs
        }
    }

    impl ArtifactStore for MemoryArtifactStore {
        fn upload<'a>(
            &'a self,
            address: &'a str,
            content: &'a [u8],
            _content_type: &'a str,
        ) -> BoxFuture<'a, StorageResult<()>> {
            Box::pin(async move {
                self.blobs.insert(address.to_string(), content.to_vec());
                Ok(())
            })
        }

        fn download<'a>(&'a self, address: &'a str) -> BoxFuture<'a, StorageResult<Vec<u8>>> {
            Box::pin(async move {
                self.blobs
                    .get(address)
                    .map(|e| e.value().clone())
                    .ok_or_else(|| StorageError::NotFound {
                        address: address.to_string(),
                    })
            })
        }

        fn delete<'a>(&'a self, address: &'a str) -> BoxFuture<'a, StorageResult<()>> {
            Box::pin(async move {
                self.blobs.remove(address);
                Ok(())
            })
        }

        fn exists<'a>(&'a self, address: &'a str) -> BoxFuture<'a, StorageResult<bool>> {
            Box::pin(async move { Ok(self.blobs.contains_key(address)) })
        }

        fn signed_url<'a>(
            &'a self,
            address: &'a str,
            _expires_in: Duration,
        ) -> BoxFuture<'a, StorageResult<String>> {
            Box::pin(async move { Ok(format!("memory://{address}")) })
        }
    }
}
