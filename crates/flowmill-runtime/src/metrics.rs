use lazy_static::lazy_static;
use prometheus::{HistogramOpts, HistogramVec, Registry};

lazy_static! {
    /// Global metrics registry for the runtime crate.
    pub static ref REGISTRY: Registry = Registry::new();

    /// Duration of each startup/shutdown step, labeled by process, step and
    /// operation ("startup" or "shutdown").
    pub static ref STARTUP_STEP_DURATION: HistogramVec = {
        let histogram = HistogramVec::new(
            HistogramOpts::new(
                "flowmill_startup_step_duration_seconds",
                "Duration of startup process steps in seconds",
            )
            .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
            &["process", "step", "operation"],
        )
        .expect("metric can be created");
        REGISTRY
            .register(Box::new(histogram.clone()))
            .expect("metric can be registered");
        histogram
    };
}
