use async_trait::async_trait;

use modproxy_types::{ModulePath, Result, RevInfo, Revision};

/// Upstream version discovery.
///
/// Every method fails with `InvalidModule` when `module` lies below a module
/// root, and with `NotFound` when upstream has never heard of it.
#[async_trait]
pub trait Lister: Send + Sync {
    /// Tagged versions known upstream, in any order.
    async fn list(&self, module: &ModulePath) -> Result<Vec<String>>;

    /// The default-branch head, used when a module has no tags.
    async fn head(&self, module: &ModulePath) -> Result<Revision>;

    /// Revision info for one version, without fetching its artifacts.
    async fn info(&self, module: &ModulePath, version: &str) -> Result<RevInfo>;
}
