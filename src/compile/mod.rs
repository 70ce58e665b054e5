//! Package compilation: task graph, caches, worker pool, and scheduler.

pub mod cache;
pub mod graph;
pub mod scheduler;
pub mod task;
pub mod vm_pool;

pub use cache::{ArtifactCache, CachedArtifact, GlobalPackageCache};
pub use graph::TaskGraph;
pub use scheduler::PackageCompiler;
pub use task::{CompileTask, TaskKey, TaskState, dependency_key};
pub use vm_pool::{VmPool, WorkerHandle};
