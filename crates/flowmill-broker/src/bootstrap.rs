//! Process-wide broker bring-up.
//!
//! The broker composes its startup steps from configuration: the disk usage
//! monitor (when enabled), the cluster messaging services, and the embedded
//! gateway (when enabled). A failure during any step unwinds the
//! already-started ones in reverse order, so a half-started broker never
//! stays up.

use crate::config::BrokerConfig;
use crate::disk::{DiskSpaceMonitor, DiskUsageProbe};
use async_trait::async_trait;
use flowmill_core::NodeId;
use flowmill_runtime::{
    ActorScheduler, StartupError, StartupProcess, StartupStep, TaskError,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Cluster membership and messaging, consumed as start/stop futures plus a
/// request/response channel. The concrete implementation is an external
/// collaborator.
#[async_trait]
pub trait ClusterServices: Send + Sync {
    async fn start(&self) -> Result<(), TaskError>;

    async fn stop(&self) -> Result<(), TaskError>;

    async fn send_request(&self, node: NodeId, request: Vec<u8>) -> Result<Vec<u8>, TaskError>;
}

/// The embedded gateway, consumed as start/stop futures only.
#[async_trait]
pub trait EmbeddedGateway: Send + Sync {
    async fn start(&self) -> Result<(), TaskError>;

    async fn stop(&self) -> Result<(), TaskError>;
}

pub struct BrokerStartupContext {
    pub config: BrokerConfig,
    pub scheduler: ActorScheduler,
    pub cluster_services: Arc<dyn ClusterServices>,
    pub gateway: Option<Arc<dyn EmbeddedGateway>>,
    pub disk_probe: Arc<dyn DiskUsageProbe>,
    pub disk_monitor: Option<Arc<DiskSpaceMonitor>>,
}

/// Bound a collaborator's start/stop future; a hung collaborator must not
/// wedge broker bring-up or teardown.
async fn with_timeout<F>(what: &str, limit: Duration, future: F) -> Result<(), TaskError>
where
    F: Future<Output = Result<(), TaskError>> + Send,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(TaskError::Timeout(format!(
            "{what} did not complete within {}ms",
            limit.as_millis()
        ))),
    }
}

/// Starts the disk usage monitor before anything that registers disk-space
/// listeners.
struct DiskSpaceMonitorStep;

#[async_trait]
impl StartupStep<BrokerStartupContext> for DiskSpaceMonitorStep {
    fn name(&self) -> &str {
        "DiskSpaceUsageMonitor"
    }

    async fn startup(&self, ctx: &mut BrokerStartupContext) -> Result<(), TaskError> {
        let control = ctx.scheduler.spawn_actor("DiskSpaceMonitor");
        let monitor = DiskSpaceMonitor::new(
            control,
            Arc::clone(&ctx.disk_probe),
            ctx.config.disk_usage_replication_watermark,
            ctx.config.disk_monitoring_interval,
        );
        monitor.start();
        monitor.check();
        ctx.disk_monitor = Some(monitor);
        Ok(())
    }

    async fn shutdown(&self, ctx: &mut BrokerStartupContext) -> Result<(), TaskError> {
        if let Some(monitor) = ctx.disk_monitor.take() {
            monitor.stop();
        }
        Ok(())
    }
}

struct ClusterServicesStep;

#[async_trait]
impl StartupStep<BrokerStartupContext> for ClusterServicesStep {
    fn name(&self) -> &str {
        "ClusterServices"
    }

    async fn startup(&self, ctx: &mut BrokerStartupContext) -> Result<(), TaskError> {
        with_timeout(
            "cluster services start",
            ctx.config.cluster_request_timeout,
            ctx.cluster_services.start(),
        )
        .await
    }

    async fn shutdown(&self, ctx: &mut BrokerStartupContext) -> Result<(), TaskError> {
        with_timeout(
            "cluster services stop",
            ctx.config.cluster_request_timeout,
            ctx.cluster_services.stop(),
        )
        .await
    }
}

struct EmbeddedGatewayStep;

#[async_trait]
impl StartupStep<BrokerStartupContext> for EmbeddedGatewayStep {
    fn name(&self) -> &str {
        "EmbeddedGateway"
    }

    async fn startup(&self, ctx: &mut BrokerStartupContext) -> Result<(), TaskError> {
        let gateway = ctx.gateway.clone().ok_or_else(|| {
            TaskError::InvariantViolation(
                "gateway_enabled is set but no gateway implementation was provided".to_string(),
            )
        })?;
        with_timeout(
            "embedded gateway start",
            ctx.config.cluster_request_timeout,
            gateway.start(),
        )
        .await
    }

    async fn shutdown(&self, ctx: &mut BrokerStartupContext) -> Result<(), TaskError> {
        if let Some(gateway) = ctx.gateway.clone() {
            with_timeout(
                "embedded gateway stop",
                ctx.config.cluster_request_timeout,
                gateway.stop(),
            )
            .await?;
        }
        Ok(())
    }
}

pub struct BrokerStartupProcess {
    process: StartupProcess<BrokerStartupContext>,
    ctx: tokio::sync::Mutex<BrokerStartupContext>,
}

impl BrokerStartupProcess {
    pub fn new(ctx: BrokerStartupContext) -> Self {
        let mut steps: Vec<Box<dyn StartupStep<BrokerStartupContext>>> = Vec::new();
        if ctx.config.disk_usage_monitoring_enabled {
            // Must start before any disk-space listeners register.
            steps.push(Box::new(DiskSpaceMonitorStep));
        }
        steps.push(Box::new(ClusterServicesStep));
        if ctx.config.gateway_enabled {
            steps.push(Box::new(EmbeddedGatewayStep));
        }

        info!(
            node_id = ctx.config.node_id,
            steps = steps.len(),
            "Broker startup process assembled"
        );
        Self {
            process: StartupProcess::new("Broker", steps),
            ctx: tokio::sync::Mutex::new(ctx),
        }
    }

    pub async fn start(&self) -> Result<(), StartupError> {
        let mut ctx = self.ctx.lock().await;
        self.process.startup(&mut ctx).await
    }

    pub async fn stop(&self) -> Result<(), StartupError> {
        let mut ctx = self.ctx.lock().await;
        self.process.shutdown(&mut ctx).await
    }

    pub async fn disk_monitor(&self) -> Option<Arc<DiskSpaceMonitor>> {
        self.ctx.lock().await.disk_monitor.clone()
    }
}
