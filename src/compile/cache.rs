//! Two-tier compiled package cache.
//!
//! The local tier is the compiled package table keyed by (package, stemcell,
//! dependency key). The optional global tier is a shared blobstore keyed by a
//! content hash; a hit there is materialized into a local record so the next
//! lookup never leaves the database.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use crate::compile::task::CompileTask;
use crate::db::{CompiledPackageRecord, Database};
use crate::errors::is_benign_conflict;

/// A compiled artifact fetched from the global tier.
#[derive(Debug, Clone)]
pub struct CachedArtifact {
    pub sha1: String,
    pub blobstore_id: String,
}

/// Shared cross-director cache of compiled packages.
#[async_trait]
pub trait GlobalPackageCache: Send + Sync {
    async fn exists(&self, cache_key: &str) -> anyhow::Result<bool>;
    async fn fetch(&self, cache_key: &str) -> anyhow::Result<Option<CachedArtifact>>;
    async fn store(&self, cache_key: &str, sha1: &str, blobstore_id: &str) -> anyhow::Result<()>;
}

/// Cache facade the scheduler consults before compiling anything.
pub struct ArtifactCache {
    db: Arc<Database>,
    global: Option<Arc<dyn GlobalPackageCache>>,
}

impl ArtifactCache {
    pub fn new(db: Arc<Database>, global: Option<Arc<dyn GlobalPackageCache>>) -> Self {
        Self { db, global }
    }

    /// Look up the local tier only.
    pub fn find_local(&self, task: &CompileTask) -> Option<CompiledPackageRecord> {
        self.db
            .find_compiled_package(task.package.id, task.stemcell.id, &task.dependency_key)
    }

    /// Look up both tiers. A local hit short-circuits; a global hit is
    /// recorded locally before being returned.
    pub async fn find_compiled_package(
        &self,
        task: &CompileTask,
    ) -> anyhow::Result<Option<CompiledPackageRecord>> {
        if let Some(record) = self.find_local(task) {
            debug!(
                package = %task.package.name,
                stemcell = %task.stemcell.name,
                "compiled package found locally"
            );
            return Ok(Some(record));
        }

        let Some(global) = &self.global else {
            return Ok(None);
        };
        let cache_key = task.cache_key();
        let Some(artifact) = global.fetch(&cache_key).await? else {
            return Ok(None);
        };

        info!(
            package = %task.package.name,
            stemcell = %task.stemcell.name,
            "compiled package fetched from global cache"
        );
        let build = self.db.next_build(task.package.id);
        let record = self.db.save_compiled_package(
            task.package.id,
            task.stemcell.id,
            &task.dependency_key,
            build,
            &artifact.sha1,
            &artifact.blobstore_id,
        );
        Ok(Some(record))
    }

    /// Publish a freshly compiled package to the global tier, unless another
    /// director got there first.
    pub async fn save_to_global_cache(
        &self,
        task: &CompileTask,
        record: &CompiledPackageRecord,
    ) -> anyhow::Result<()> {
        let Some(global) = &self.global else {
            return Ok(());
        };
        let cache_key = task.cache_key();
        if global.exists(&cache_key).await? {
            debug!(package = %task.package.name, "global cache already populated");
            return Ok(());
        }
        match global
            .store(&cache_key, &record.sha1, &record.blobstore_id)
            .await
        {
            Ok(()) => Ok(()),
            // Another director can win the race between exists and store;
            // legacy backends report the collision as a "no changes" error.
            Err(err) if is_benign_conflict(&err.to_string()) => {
                debug!(package = %task.package.name, "global cache store raced; keeping existing");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}
