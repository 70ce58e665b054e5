//! Persisted records and the in-memory database.
//!
//! Record structs mirror what the orchestrator persists between runs:
//! deployments, machines, instances, the release/package/stemcell catalog,
//! compiled packages, and DNS rows. [`Database`] keeps them behind one
//! mutex; all methods take and return owned copies so no caller ever holds
//! the lock across an await point.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A persisted deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: u64,
    pub name: String,
}

/// A persisted machine. Created by the cloud driver, destroyed on teardown
/// or reconciliation cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineRecord {
    pub id: u64,
    pub cid: String,
    pub agent_id: String,
    pub deployment_id: u64,
}

/// A persisted job instance, identified by (job name, index) within its
/// deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: u64,
    pub deployment_id: u64,
    pub job: String,
    pub index: u32,
    pub vm_id: Option<u64>,
}

/// A stemcell in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StemcellRecord {
    pub id: u64,
    pub name: String,
    pub version: String,
    pub cid: String,
    pub sha1: String,
}

/// A release version in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRecord {
    pub id: u64,
    pub name: String,
    pub version: String,
}

/// A source package in the catalog. `dependency_names` lists direct
/// dependencies within the same release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub id: u64,
    pub release_id: u64,
    pub name: String,
    pub version: String,
    pub fingerprint: String,
    pub dependency_names: Vec<String>,
    pub blobstore_id: String,
    pub sha1: String,
}

/// Result of compiling a package for a stemcell with a specific dependency
/// key. `build` increases monotonically per package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledPackageRecord {
    pub id: u64,
    pub package_id: u64,
    pub stemcell_id: u64,
    pub dependency_key: String,
    pub build: u32,
    pub sha1: String,
    pub blobstore_id: String,
    pub created_at: DateTime<Utc>,
}

/// A persisted DNS domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsDomainRecord {
    pub id: u64,
    pub name: String,
    pub kind: String,
}

/// A persisted DNS record within a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecordRow {
    pub id: u64,
    pub domain_id: u64,
    pub name: String,
    pub record_type: String,
    pub content: String,
    pub ttl: Option<u32>,
}

#[derive(Debug, Default)]
struct Tables {
    deployments: Vec<DeploymentRecord>,
    machines: Vec<MachineRecord>,
    instances: Vec<InstanceRecord>,
    stemcells: Vec<StemcellRecord>,
    releases: Vec<ReleaseRecord>,
    packages: Vec<PackageRecord>,
    compiled_packages: Vec<CompiledPackageRecord>,
    dns_domains: Vec<DnsDomainRecord>,
    dns_records: Vec<DnsRecordRow>,
    // Highest build handed out per package, including in-flight compiles.
    issued_builds: HashMap<u64, u32>,
    next_id: u64,
}

impl Tables {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory store of every persisted record the core reads and writes.
#[derive(Debug, Default)]
pub struct Database {
    tables: Mutex<Tables>,
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- deployments ---

    pub fn create_deployment(&self, name: &str) -> DeploymentRecord {
        let mut t = self.lock();
        let record = DeploymentRecord {
            id: t.next_id(),
            name: name.to_string(),
        };
        t.deployments.push(record.clone());
        record
    }

    pub fn find_deployment(&self, name: &str) -> Option<DeploymentRecord> {
        self.lock()
            .deployments
            .iter()
            .find(|d| d.name == name)
            .cloned()
    }

    // --- machines ---

    pub fn create_machine(
        &self,
        deployment_id: u64,
        cid: &str,
        agent_id: &str,
    ) -> MachineRecord {
        let mut t = self.lock();
        let record = MachineRecord {
            id: t.next_id(),
            cid: cid.to_string(),
            agent_id: agent_id.to_string(),
            deployment_id,
        };
        t.machines.push(record.clone());
        record
    }

    pub fn machines_for_deployment(&self, deployment_id: u64) -> Vec<MachineRecord> {
        self.lock()
            .machines
            .iter()
            .filter(|m| m.deployment_id == deployment_id)
            .cloned()
            .collect()
    }

    pub fn find_machine(&self, id: u64) -> Option<MachineRecord> {
        self.lock().machines.iter().find(|m| m.id == id).cloned()
    }

    pub fn delete_machine(&self, id: u64) {
        self.lock().machines.retain(|m| m.id != id);
    }

    // --- instances ---

    pub fn create_instance(
        &self,
        deployment_id: u64,
        job: &str,
        index: u32,
        vm_id: Option<u64>,
    ) -> InstanceRecord {
        let mut t = self.lock();
        let record = InstanceRecord {
            id: t.next_id(),
            deployment_id,
            job: job.to_string(),
            index,
            vm_id,
        };
        t.instances.push(record.clone());
        record
    }

    pub fn instance_for_machine(&self, vm_id: u64) -> Option<InstanceRecord> {
        self.lock()
            .instances
            .iter()
            .find(|i| i.vm_id == Some(vm_id))
            .cloned()
    }

    pub fn find_instance(
        &self,
        deployment_id: u64,
        job: &str,
        index: u32,
    ) -> Option<InstanceRecord> {
        self.lock()
            .instances
            .iter()
            .find(|i| i.deployment_id == deployment_id && i.job == job && i.index == index)
            .cloned()
    }

    pub fn update_instance_vm(&self, instance_id: u64, vm_id: Option<u64>) {
        let mut t = self.lock();
        if let Some(instance) = t.instances.iter_mut().find(|i| i.id == instance_id) {
            instance.vm_id = vm_id;
        }
    }

    pub fn delete_instance(&self, id: u64) {
        self.lock().instances.retain(|i| i.id != id);
    }

    // --- catalog ---

    pub fn create_stemcell(
        &self,
        name: &str,
        version: &str,
        cid: &str,
        sha1: &str,
    ) -> StemcellRecord {
        let mut t = self.lock();
        let record = StemcellRecord {
            id: t.next_id(),
            name: name.to_string(),
            version: version.to_string(),
            cid: cid.to_string(),
            sha1: sha1.to_string(),
        };
        t.stemcells.push(record.clone());
        record
    }

    pub fn find_stemcell(&self, name: &str, version: &str) -> Option<StemcellRecord> {
        self.lock()
            .stemcells
            .iter()
            .find(|s| s.name == name && s.version == version)
            .cloned()
    }

    pub fn create_release(&self, name: &str, version: &str) -> ReleaseRecord {
        let mut t = self.lock();
        let record = ReleaseRecord {
            id: t.next_id(),
            name: name.to_string(),
            version: version.to_string(),
        };
        t.releases.push(record.clone());
        record
    }

    pub fn find_release(&self, name: &str, version: &str) -> Option<ReleaseRecord> {
        self.lock()
            .releases
            .iter()
            .find(|r| r.name == name && r.version == version)
            .cloned()
    }

    pub fn create_package(
        &self,
        release_id: u64,
        name: &str,
        version: &str,
        fingerprint: &str,
        dependency_names: &[&str],
        blobstore_id: &str,
        sha1: &str,
    ) -> PackageRecord {
        let mut t = self.lock();
        let record = PackageRecord {
            id: t.next_id(),
            release_id,
            name: name.to_string(),
            version: version.to_string(),
            fingerprint: fingerprint.to_string(),
            dependency_names: dependency_names.iter().map(|d| d.to_string()).collect(),
            blobstore_id: blobstore_id.to_string(),
            sha1: sha1.to_string(),
        };
        t.packages.push(record.clone());
        record
    }

    pub fn find_package(&self, release_id: u64, name: &str) -> Option<PackageRecord> {
        self.lock()
            .packages
            .iter()
            .find(|p| p.release_id == release_id && p.name == name)
            .cloned()
    }

    // --- compiled packages ---

    pub fn find_compiled_package(
        &self,
        package_id: u64,
        stemcell_id: u64,
        dependency_key: &str,
    ) -> Option<CompiledPackageRecord> {
        self.lock()
            .compiled_packages
            .iter()
            .find(|c| {
                c.package_id == package_id
                    && c.stemcell_id == stemcell_id
                    && c.dependency_key == dependency_key
            })
            .cloned()
    }

    pub fn compiled_packages_for(&self, package_id: u64) -> Vec<CompiledPackageRecord> {
        self.lock()
            .compiled_packages
            .iter()
            .filter(|c| c.package_id == package_id)
            .cloned()
            .collect()
    }

    /// Reserve the next build number for a package. Monotonic across
    /// concurrent compiles of the same package on different stemcells.
    pub fn next_build(&self, package_id: u64) -> u32 {
        let mut t = self.lock();
        let persisted_max = t
            .compiled_packages
            .iter()
            .filter(|c| c.package_id == package_id)
            .map(|c| c.build)
            .max()
            .unwrap_or(0);
        let issued = t.issued_builds.get(&package_id).copied().unwrap_or(0);
        let next = persisted_max.max(issued) + 1;
        t.issued_builds.insert(package_id, next);
        next
    }

    pub fn save_compiled_package(
        &self,
        package_id: u64,
        stemcell_id: u64,
        dependency_key: &str,
        build: u32,
        sha1: &str,
        blobstore_id: &str,
    ) -> CompiledPackageRecord {
        let mut t = self.lock();
        let record = CompiledPackageRecord {
            id: t.next_id(),
            package_id,
            stemcell_id,
            dependency_key: dependency_key.to_string(),
            build,
            sha1: sha1.to_string(),
            blobstore_id: blobstore_id.to_string(),
            created_at: Utc::now(),
        };
        t.compiled_packages.push(record.clone());
        record
    }

    // --- dns ---

    pub fn find_or_create_dns_domain(&self, name: &str, kind: &str) -> DnsDomainRecord {
        let mut t = self.lock();
        if let Some(domain) = t
            .dns_domains
            .iter()
            .find(|d| d.name == name && d.kind == kind)
        {
            return domain.clone();
        }
        let record = DnsDomainRecord {
            id: t.next_id(),
            name: name.to_string(),
            kind: kind.to_string(),
        };
        t.dns_domains.push(record.clone());
        record
    }

    /// Find a DNS record by (domain, name, type), creating it with the given
    /// content and ttl if absent. Existing records are reused untouched.
    pub fn find_or_create_dns_record(
        &self,
        domain_id: u64,
        name: &str,
        record_type: &str,
        content: &str,
        ttl: Option<u32>,
    ) -> DnsRecordRow {
        let mut t = self.lock();
        if let Some(record) = t.dns_records.iter().find(|r| {
            r.domain_id == domain_id && r.name == name && r.record_type == record_type
        }) {
            return record.clone();
        }
        let record = DnsRecordRow {
            id: t.next_id(),
            domain_id,
            name: name.to_string(),
            record_type: record_type.to_string(),
            content: content.to_string(),
            ttl,
        };
        t.dns_records.push(record.clone());
        record
    }

    pub fn dns_domain_count(&self) -> usize {
        self.lock().dns_domains.len()
    }

    pub fn dns_records(&self, domain_id: u64) -> Vec<DnsRecordRow> {
        self.lock()
            .dns_records
            .iter()
            .filter(|r| r.domain_id == domain_id)
            .cloned()
            .collect()
    }
}
