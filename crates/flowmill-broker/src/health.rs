//! Aggregate health of a partition's installed components.
//!
//! The monitor holds weak handles to the components it observes, so a torn
//! down service disappears from the aggregate instead of keeping a cycle of
//! strong references alive. Components report their status when polled;
//! failure listeners fire on edges only.

use crate::metrics::PARTITION_HEALTH;
use flowmill_core::PartitionId;
use flowmill_runtime::{ConcurrencyControl, TimerHandle};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Dead,
}

impl HealthStatus {
    /// The worse of two statuses; `Dead` is sticky by construction because a
    /// dead component never reports anything else.
    fn combine(self, other: HealthStatus) -> HealthStatus {
        use HealthStatus::*;
        match (self, other) {
            (Dead, _) | (_, Dead) => Dead,
            (Unhealthy, _) | (_, Unhealthy) => Unhealthy,
            (Healthy, Healthy) => Healthy,
        }
    }

    fn as_gauge_value(self) -> i64 {
        match self {
            HealthStatus::Healthy => 2,
            HealthStatus::Unhealthy => 1,
            HealthStatus::Dead => 0,
        }
    }
}

/// Implemented by services whose health contributes to the partition's.
pub trait HealthMonitorable: Send + Sync {
    fn component_name(&self) -> String;

    fn health_status(&self) -> HealthStatus;
}

/// Notified when the aggregate health changes.
pub trait FailureListener: Send + Sync {
    fn on_failure(&self);

    fn on_recovered(&self);

    fn on_unrecoverable_failure(&self);
}

struct MonitorInner {
    components: HashMap<String, Weak<dyn HealthMonitorable>>,
    listeners: Vec<Arc<dyn FailureListener>>,
    status: HealthStatus,
}

/// Periodically recomputes the aggregate status of its registered
/// components.
pub struct HealthMonitor {
    partition_id: PartitionId,
    control: ConcurrencyControl,
    inner: Mutex<MonitorInner>,
    timer: Mutex<Option<TimerHandle>>,
}

impl HealthMonitor {
    pub fn new(partition_id: PartitionId, control: ConcurrencyControl) -> Arc<Self> {
        Arc::new(Self {
            partition_id,
            control,
            inner: Mutex::new(MonitorInner {
                components: HashMap::new(),
                listeners: Vec::new(),
                status: HealthStatus::Unhealthy,
            }),
            timer: Mutex::new(None),
        })
    }

    /// Begin periodic recomputation on the owning actor.
    pub fn start_monitoring(self: &Arc<Self>, interval: Duration) {
        let monitor = Arc::downgrade(self);
        let handle = self.control.run_at_fixed_rate(interval, move || {
            if let Some(monitor) = monitor.upgrade() {
                monitor.update();
            }
        });
        *self.timer.lock().expect("health timer poisoned") = Some(handle);
    }

    pub fn stop_monitoring(&self) {
        if let Some(mut handle) = self.timer.lock().expect("health timer poisoned").take() {
            handle.cancel();
        }
    }

    pub fn register_component(&self, component: Weak<dyn HealthMonitorable>) {
        if let Some(strong) = component.upgrade() {
            let name = strong.component_name();
            debug!(
                partition_id = self.partition_id,
                component = %name,
                "Registered component for health monitoring"
            );
            self.inner
                .lock()
                .expect("health state poisoned")
                .components
                .insert(name, component);
        }
    }

    pub fn remove_component(&self, name: &str) {
        self.inner
            .lock()
            .expect("health state poisoned")
            .components
            .remove(name);
    }

    pub fn add_failure_listener(&self, listener: Arc<dyn FailureListener>) {
        self.inner
            .lock()
            .expect("health state poisoned")
            .listeners
            .push(listener);
    }

    pub fn health_status(&self) -> HealthStatus {
        self.inner.lock().expect("health state poisoned").status
    }

    /// Recompute the aggregate, dropping components that no longer exist,
    /// and notify listeners when the status crosses an edge.
    pub fn update(&self) {
        let (previous, current, listeners) = {
            let mut inner = self.inner.lock().expect("health state poisoned");
            let previous = inner.status;

            let mut current = HealthStatus::Healthy;
            inner.components.retain(|_, weak| weak.upgrade().is_some());
            for component in inner.components.values() {
                if let Some(component) = component.upgrade() {
                    current = current.combine(component.health_status());
                }
            }

            inner.status = current;
            (previous, current, inner.listeners.clone())
        };

        PARTITION_HEALTH
            .with_label_values(&[&self.partition_id.to_string()])
            .set(current.as_gauge_value());

        if previous == current {
            return;
        }
        match current {
            HealthStatus::Healthy => {
                info!(partition_id = self.partition_id, "Partition became healthy");
                for listener in &listeners {
                    listener.on_recovered();
                }
            }
            HealthStatus::Unhealthy => {
                warn!(partition_id = self.partition_id, "Partition became unhealthy");
                for listener in &listeners {
                    listener.on_failure();
                }
            }
            HealthStatus::Dead => {
                warn!(partition_id = self.partition_id, "Partition died");
                for listener in &listeners {
                    listener.on_unrecoverable_failure();
                }
            }
        }
    }
}

struct PartitionHealthInner {
    services_installed: bool,
    disk_space_available: bool,
    dead: bool,
}

/// The partition's own health signal: healthy while its role services are
/// installed and disk space is available.
pub struct PartitionHealth {
    partition_id: PartitionId,
    inner: Mutex<PartitionHealthInner>,
}

impl PartitionHealth {
    pub fn new(partition_id: PartitionId) -> Arc<Self> {
        Arc::new(Self {
            partition_id,
            inner: Mutex::new(PartitionHealthInner {
                services_installed: false,
                disk_space_available: true,
                dead: false,
            }),
        })
    }

    pub fn set_services_installed(&self, installed: bool) {
        self.inner
            .lock()
            .expect("partition health poisoned")
            .services_installed = installed;
    }

    pub fn set_disk_space_available(&self, available: bool) {
        self.inner
            .lock()
            .expect("partition health poisoned")
            .disk_space_available = available;
    }

    /// Dead is terminal; nothing un-sets it.
    pub fn on_unrecoverable_failure(&self) {
        self.inner.lock().expect("partition health poisoned").dead = true;
    }
}

impl HealthMonitorable for PartitionHealth {
    fn component_name(&self) -> String {
        format!("Partition-{}", self.partition_id)
    }

    fn health_status(&self) -> HealthStatus {
        let inner = self.inner.lock().expect("partition health poisoned");
        if inner.dead {
            HealthStatus::Dead
        } else if inner.services_installed && inner.disk_space_available {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }
}
