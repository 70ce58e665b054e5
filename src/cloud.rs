//! Cloud infrastructure driver interface.
//!
//! The driver owns actual machine creation and destruction; everything above
//! it only sees opaque cloud identifiers.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Minimal machine lifecycle surface the core needs from a cloud.
#[async_trait]
pub trait CloudDriver: Send + Sync {
    /// Create a machine from a stemcell image and return its cloud id.
    async fn create_vm(
        &self,
        agent_id: &str,
        stemcell_cid: &str,
        cloud_properties: &Value,
        network_settings: &Value,
        disk_ids: Option<&[String]>,
        env: &Value,
    ) -> Result<String>;

    /// Destroy a machine by its cloud id.
    async fn delete_vm(&self, vm_cid: &str) -> Result<()>;
}
