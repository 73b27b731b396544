//! Disk usage monitoring.
//!
//! The monitor polls a probe on an interval and compares the used fraction
//! of the data directory's budget against the replication watermark.
//! Listeners are notified on edges only: once when space runs out, once when
//! it comes back.

use flowmill_runtime::{ConcurrencyControl, TimerHandle};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct DiskUsage {
    pub capacity_bytes: u64,
    pub used_bytes: u64,
}

impl DiskUsage {
    pub fn used_fraction(&self) -> f64 {
        if self.capacity_bytes == 0 {
            return 1.0;
        }
        self.used_bytes as f64 / self.capacity_bytes as f64
    }
}

pub trait DiskUsageProbe: Send + Sync {
    fn probe(&self) -> io::Result<DiskUsage>;
}

/// Measures the bytes under the data directory against a configured budget.
pub struct DataDirProbe {
    data_dir: PathBuf,
    capacity_bytes: u64,
}

impl DataDirProbe {
    pub fn new(data_dir: impl Into<PathBuf>, capacity_bytes: u64) -> Self {
        Self {
            data_dir: data_dir.into(),
            capacity_bytes,
        }
    }

    fn directory_size(dir: &Path) -> io::Result<u64> {
        let mut total = 0;
        if !dir.exists() {
            return Ok(0);
        }
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                total += Self::directory_size(&entry.path())?;
            } else if file_type.is_file() {
                total += entry.metadata()?.len();
            }
        }
        Ok(total)
    }
}

impl DiskUsageProbe for DataDirProbe {
    fn probe(&self) -> io::Result<DiskUsage> {
        Ok(DiskUsage {
            capacity_bytes: self.capacity_bytes,
            used_bytes: Self::directory_size(&self.data_dir)?,
        })
    }
}

pub trait DiskSpaceListener: Send + Sync {
    fn on_disk_space_available(&self);

    fn on_disk_space_not_available(&self);
}

struct MonitorInner {
    listeners: Vec<Arc<dyn DiskSpaceListener>>,
    /// `None` until the first successful probe.
    available: Option<bool>,
}

pub struct DiskSpaceMonitor {
    control: ConcurrencyControl,
    probe: Arc<dyn DiskUsageProbe>,
    watermark: f64,
    interval: Duration,
    inner: Arc<Mutex<MonitorInner>>,
    timer: Mutex<Option<TimerHandle>>,
}

impl DiskSpaceMonitor {
    pub fn new(
        control: ConcurrencyControl,
        probe: Arc<dyn DiskUsageProbe>,
        watermark: f64,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            control,
            probe,
            watermark,
            interval,
            inner: Arc::new(Mutex::new(MonitorInner {
                listeners: Vec::new(),
                available: None,
            })),
            timer: Mutex::new(None),
        })
    }

    /// Late subscribers immediately learn the current state.
    pub fn add_listener(&self, listener: Arc<dyn DiskSpaceListener>) {
        let known = {
            let mut inner = self.inner.lock().expect("disk monitor poisoned");
            inner.listeners.push(Arc::clone(&listener));
            inner.available
        };
        match known {
            Some(true) => listener.on_disk_space_available(),
            Some(false) => listener.on_disk_space_not_available(),
            None => {}
        }
    }

    pub fn start(self: &Arc<Self>) {
        let monitor = Arc::downgrade(self);
        let handle = self.control.run_at_fixed_rate(self.interval, move || {
            if let Some(monitor) = monitor.upgrade() {
                monitor.check();
            }
        });
        *self.timer.lock().expect("disk timer poisoned") = Some(handle);
        info!(
            watermark = self.watermark,
            interval_ms = self.interval.as_millis() as u64,
            "Disk space monitor started"
        );
    }

    pub fn stop(&self) {
        if let Some(mut timer) = self.timer.lock().expect("disk timer poisoned").take() {
            timer.cancel();
        }
    }

    /// One probe-and-notify round. Public so tests (and the startup step)
    /// can force a check without waiting out the interval.
    pub fn check(&self) {
        let usage = match self.probe.probe() {
            Ok(usage) => usage,
            Err(err) => {
                warn!(error = %err, "Disk usage probe failed");
                return;
            }
        };

        let available = usage.used_fraction() < self.watermark;
        let (edge, listeners) = {
            let mut inner = self.inner.lock().expect("disk monitor poisoned");
            let edge = inner.available != Some(available);
            inner.available = Some(available);
            (edge, inner.listeners.clone())
        };

        debug!(
            used_bytes = usage.used_bytes,
            capacity_bytes = usage.capacity_bytes,
            available,
            "Disk usage probed"
        );
        if !edge {
            return;
        }

        if available {
            info!(
                used_fraction = usage.used_fraction(),
                "Disk space available again"
            );
            for listener in &listeners {
                listener.on_disk_space_available();
            }
        } else {
            warn!(
                used_fraction = usage.used_fraction(),
                watermark = self.watermark,
                "Disk space exhausted"
            );
            for listener in &listeners {
                listener.on_disk_space_not_available();
            }
        }
    }
}
