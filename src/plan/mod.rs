//! In-memory deployment plan.
//!
//! A [`DeploymentPlan`] owns every plan entity for the lifetime of one run:
//! catalog specs (releases, templates, packages, stemcells), networks,
//! resource pools, and jobs with their instances. Catalog specs start
//! unbound and are attached to persisted records by the reconciler; the
//! `OnceLock` model slots make "bound exactly once" explicit.

pub mod job;
pub mod pool;

pub use job::{Instance, Job};
pub use pool::{IdleVm, ResourcePool};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use crate::context::CompilationConfig;
use crate::db::{
    Database, DeploymentRecord, DnsDomainRecord, InstanceRecord, MachineRecord, PackageRecord,
    ReleaseRecord, StemcellRecord,
};
use crate::errors::ReconcileError;
use crate::network::Network;

/// A stemcell referenced by the plan, bound to its catalog record.
#[derive(Debug)]
pub struct StemcellSpec {
    pub name: String,
    pub version: String,
    model: OnceLock<StemcellRecord>,
}

impl StemcellSpec {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            model: OnceLock::new(),
        }
    }

    pub fn bind_model(&self, db: &Database) -> Result<(), ReconcileError> {
        let record = db.find_stemcell(&self.name, &self.version).ok_or_else(|| {
            ReconcileError::StemcellNotFound {
                name: self.name.clone(),
                version: self.version.clone(),
            }
        })?;
        let _ = self.model.set(record);
        Ok(())
    }

    pub fn model(&self) -> Result<StemcellRecord, ReconcileError> {
        self.model
            .get()
            .cloned()
            .ok_or_else(|| ReconcileError::Unbound {
                entity: format!("stemcell `{}'", self.name),
            })
    }
}

/// A release referenced by the plan.
#[derive(Debug)]
pub struct ReleaseSpec {
    pub name: String,
    pub version: String,
    model: OnceLock<ReleaseRecord>,
}

impl ReleaseSpec {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            model: OnceLock::new(),
        }
    }

    pub fn bind_model(&self, db: &Database) -> Result<(), ReconcileError> {
        let record = db.find_release(&self.name, &self.version).ok_or_else(|| {
            ReconcileError::ReleaseNotFound {
                name: self.name.clone(),
                version: self.version.clone(),
            }
        })?;
        let _ = self.model.set(record);
        Ok(())
    }

    pub fn model(&self) -> Result<ReleaseRecord, ReconcileError> {
        self.model
            .get()
            .cloned()
            .ok_or_else(|| ReconcileError::Unbound {
                entity: format!("release `{}'", self.name),
            })
    }

    /// Resolve a package of this release by name.
    pub fn get_package(&self, db: &Database, name: &str) -> Result<PackageRecord, ReconcileError> {
        let release = self.model()?;
        db.find_package(release.id, name)
            .ok_or_else(|| ReconcileError::PackageNotFound {
                package: name.to_string(),
                release: self.name.clone(),
            })
    }
}

/// A job template and the packages it references.
#[derive(Debug)]
pub struct TemplateSpec {
    pub name: String,
    pub package_names: Vec<String>,
    packages: OnceLock<Vec<PackageRecord>>,
}

impl TemplateSpec {
    pub fn new(name: &str, package_names: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            package_names: package_names.iter().map(|p| p.to_string()).collect(),
            packages: OnceLock::new(),
        }
    }

    /// Resolve referenced packages within the owning release.
    pub fn bind_packages(
        &self,
        db: &Database,
        release: &ReleaseSpec,
    ) -> Result<(), ReconcileError> {
        let packages = self
            .package_names
            .iter()
            .map(|name| release.get_package(db, name))
            .collect::<Result<Vec<_>, _>>()?;
        let _ = self.packages.set(packages);
        Ok(())
    }

    pub fn packages(&self) -> Result<&[PackageRecord], ReconcileError> {
        self.packages
            .get()
            .map(Vec::as_slice)
            .ok_or_else(|| ReconcileError::Unbound {
                entity: format!("template `{}'", self.name),
            })
    }
}

/// An in-flight job rename carried by the plan.
#[derive(Debug, Clone)]
pub struct JobRename {
    pub old_name: String,
    pub new_name: String,
}

/// Desired state for one deployment run.
pub struct DeploymentPlan {
    pub name: String,
    pub compilation: CompilationConfig,
    model: OnceLock<DeploymentRecord>,
    releases: Vec<Arc<ReleaseSpec>>,
    networks: HashMap<String, Arc<dyn Network>>,
    resource_pools: HashMap<String, Arc<ResourcePool>>,
    jobs: Vec<Arc<Job>>,
    job_rename: Option<JobRename>,
    unneeded_vms: Mutex<Vec<MachineRecord>>,
    unneeded_instances: Mutex<Vec<InstanceRecord>>,
    dns_domain: Mutex<Option<DnsDomainRecord>>,
}

impl DeploymentPlan {
    pub fn new(name: &str, compilation: CompilationConfig) -> Self {
        Self {
            name: name.to_string(),
            compilation,
            model: OnceLock::new(),
            releases: Vec::new(),
            networks: HashMap::new(),
            resource_pools: HashMap::new(),
            jobs: Vec::new(),
            job_rename: None,
            unneeded_vms: Mutex::new(Vec::new()),
            unneeded_instances: Mutex::new(Vec::new()),
            dns_domain: Mutex::new(None),
        }
    }

    // --- construction ---

    pub fn add_release(&mut self, release: Arc<ReleaseSpec>) {
        self.releases.push(release);
    }

    pub fn add_network(&mut self, network: Arc<dyn Network>) {
        self.networks.insert(network.name().to_string(), network);
    }

    pub fn add_resource_pool(&mut self, pool: Arc<ResourcePool>) {
        self.resource_pools.insert(pool.name.clone(), pool);
    }

    pub fn add_job(&mut self, job: Arc<Job>) {
        self.jobs.push(job);
    }

    pub fn set_job_rename(&mut self, old_name: &str, new_name: &str) {
        self.job_rename = Some(JobRename {
            old_name: old_name.to_string(),
            new_name: new_name.to_string(),
        });
    }

    // --- binding ---

    pub fn bind_model(&self, record: DeploymentRecord) {
        let _ = self.model.set(record);
    }

    pub fn model(&self) -> Result<DeploymentRecord, ReconcileError> {
        self.model
            .get()
            .cloned()
            .ok_or_else(|| ReconcileError::Unbound {
                entity: format!("deployment `{}'", self.name),
            })
    }

    // --- lookups ---

    pub fn releases(&self) -> &[Arc<ReleaseSpec>] {
        &self.releases
    }

    pub fn network(&self, name: &str) -> Option<Arc<dyn Network>> {
        self.networks.get(name).cloned()
    }

    pub fn resource_pool(&self, name: &str) -> Option<Arc<ResourcePool>> {
        self.resource_pools.get(name).cloned()
    }

    pub fn resource_pools(&self) -> Vec<Arc<ResourcePool>> {
        self.resource_pools.values().cloned().collect()
    }

    pub fn jobs(&self) -> &[Arc<Job>] {
        &self.jobs
    }

    pub fn job(&self, name: &str) -> Option<Arc<Job>> {
        self.jobs.iter().find(|j| j.name == name).cloned()
    }

    pub fn rename_in_progress(&self) -> bool {
        self.job_rename.is_some()
    }

    /// Map a persisted job name through the in-flight rename, if any.
    pub fn resolve_job_name(&self, name: &str) -> String {
        match &self.job_rename {
            Some(rename) if rename.old_name == name => rename.new_name.clone(),
            _ => name.to_string(),
        }
    }

    // --- pending deletions ---

    /// Schedule a machine for deletion during cleanup.
    pub fn delete_vm(&self, machine: MachineRecord) {
        self.unneeded_vms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(machine);
    }

    /// Schedule an instance for deletion during cleanup.
    pub fn delete_instance(&self, instance: InstanceRecord) {
        self.unneeded_instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(instance);
    }

    pub fn take_unneeded_vms(&self) -> Vec<MachineRecord> {
        std::mem::take(
            &mut *self
                .unneeded_vms
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    pub fn take_unneeded_instances(&self) -> Vec<InstanceRecord> {
        std::mem::take(
            &mut *self
                .unneeded_instances
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    pub fn unneeded_vm_count(&self) -> usize {
        self.unneeded_vms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    // --- dns ---

    pub fn set_dns_domain(&self, domain: DnsDomainRecord) {
        *self
            .dns_domain
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(domain);
    }

    pub fn dns_domain(&self) -> Option<DnsDomainRecord> {
        self.dns_domain
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rename_resolution() {
        let mut plan = DeploymentPlan::new("mycloud", CompilationConfig::new(1, "default"));
        assert_eq!(plan.resolve_job_name("dea"), "dea");
        assert!(!plan.rename_in_progress());

        plan.set_job_rename("dea", "runner");
        assert!(plan.rename_in_progress());
        assert_eq!(plan.resolve_job_name("dea"), "runner");
        assert_eq!(plan.resolve_job_name("router"), "router");
    }

    #[test]
    fn unbound_catalog_entities_report_errors() {
        let stemcell = StemcellSpec::new("ubuntu", "1");
        let err = stemcell.model().unwrap_err();
        assert!(err.to_string().contains("has not been bound"));
    }

    #[test]
    fn template_binding_resolves_packages() {
        let db = Database::new();
        let release_rec = db.create_release("cf", "1");
        db.create_package(release_rec.id, "nginx", "0.1", "fp", &[], "blob", "sha");

        let release = ReleaseSpec::new("cf", "1");
        release.bind_model(&db).unwrap();

        let template = TemplateSpec::new("router", &["nginx"]);
        template.bind_packages(&db, &release).unwrap();
        assert_eq!(template.packages().unwrap()[0].name, "nginx");

        let missing = TemplateSpec::new("broken", &["ghost"]);
        let err = missing.bind_packages(&db, &release).unwrap_err();
        assert!(matches!(err, ReconcileError::PackageNotFound { .. }));
    }
}
