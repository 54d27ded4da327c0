//! The function catalog is an external collaborator (§1): it maps function names to
//! kernel/image/vcpu/mem defaults. The core only reads through this narrow
//! interface.

use std::path::PathBuf;

/// Defaults recorded for a single function.
#[derive(Debug, Clone)]
pub struct FunctionSpec {
    pub name: String,
    pub kernel_path: PathBuf,
    pub image_path: PathBuf,
    pub vcpu_count: u32,
    pub mem_size_mib: u64,
}

/// Looks up function defaults by name.
pub trait FunctionCatalog: Send + Sync {
    fn lookup(&self, name: &str) -> Option<FunctionSpec>;
}
