//! Tenant-scoped executor management.
//!
//! One executor per registered tenant (plus optionally the tenant-less
//! default), all sharing the pipeline and store. Jobs carry their tenant id,
//! and each executor's acquisition selector filters on it, so one tenant's
//! backlog never starves another's workers.

use std::sync::Arc;

use dashmap::DashMap;

use crate::command::pipeline::CommandPipeline;
use crate::job::executor::JobExecutor;
use crate::storage::StorageBackend;

/// Registry of running per-tenant executors.
pub struct TenantExecutorManager<S: StorageBackend> {
    pipeline: Arc<CommandPipeline<S>>,
    executors: DashMap<Option<String>, Arc<JobExecutor<S>>>,
}

impl<S: StorageBackend> TenantExecutorManager<S> {
    pub fn new(pipeline: Arc<CommandPipeline<S>>) -> Self {
        Self {
            pipeline,
            executors: DashMap::new(),
        }
    }

    /// Register an executor for `tenant_id` (`None` is the default
    /// partition), optionally leaving its acquisition loop stopped until
    /// `start_tenant` is called. Re-adding a registered tenant is a no-op.
    pub async fn add_tenant(&self, tenant_id: Option<String>, start_immediately: bool) {
        if self.executors.contains_key(&tenant_id) {
            return;
        }
        let executor = Arc::new(JobExecutor::new(
            Arc::clone(&self.pipeline),
            tenant_id.clone(),
        ));
        if start_immediately {
            executor.start().await;
        }
        self.executors.insert(tenant_id, executor);
    }

    /// Start the executor for `tenant_id`, registering it first if needed.
    /// Starting an already-running tenant is a no-op.
    pub async fn start_tenant(&self, tenant_id: Option<String>) {
        let existing = self
            .executors
            .get(&tenant_id)
            .map(|entry| Arc::clone(entry.value()));
        match existing {
            Some(executor) => executor.start().await,
            None => self.add_tenant(tenant_id, true).await,
        }
    }

    /// Stop and deregister the executor for `tenant_id`. In-flight jobs of
    /// that tenant drain within the shutdown grace period.
    pub async fn stop_tenant(&self, tenant_id: &Option<String>) {
        if let Some((_, executor)) = self.executors.remove(tenant_id) {
            executor.shutdown().await;
        }
    }

    /// Tenants with a running executor.
    pub fn tenants(&self) -> Vec<Option<String>> {
        self.executors.iter().map(|e| e.key().clone()).collect()
    }

    /// Stop every executor.
    pub async fn shutdown_all(&self) {
        let tenants: Vec<Option<String>> = self.tenants();
        for tenant in tenants {
            self.stop_tenant(&tenant).await;
        }
    }
}
