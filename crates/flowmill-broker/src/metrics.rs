use lazy_static::lazy_static;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
};

lazy_static! {
    /// Global metrics registry for the broker crate.
    pub static ref REGISTRY: Registry = Registry::new();

    /// Partition health: 2 = healthy, 1 = unhealthy, 0 = dead.
    pub static ref PARTITION_HEALTH: IntGaugeVec = register_gauge(
        "flowmill_partition_health",
        "Health of the partition (2 healthy, 1 unhealthy, 0 dead)",
        &["partition"]
    );

    /// Completed role transitions per partition and target role.
    pub static ref ROLE_TRANSITIONS_TOTAL: IntCounterVec = {
        let counter = IntCounterVec::new(
            Opts::new(
                "flowmill_partition_role_transitions_total",
                "Completed partition role transitions",
            ),
            &["partition", "role"],
        )
        .expect("metric can be created");
        REGISTRY
            .register(Box::new(counter.clone()))
            .expect("metric can be registered");
        counter
    };

    /// Time from observing a leader role change to leader services installed.
    pub static ref LEADER_TRANSITION_LATENCY: HistogramVec = register_histogram(
        "flowmill_partition_leader_transition_latency_seconds",
        "Latency of leader transitions in seconds",
        &["partition"]
    );

    /// Duration of snapshot construction, from trigger to persisted.
    pub static ref SNAPSHOT_DURATION: HistogramVec = register_histogram(
        "flowmill_partition_snapshot_duration_seconds",
        "Duration of snapshot construction in seconds",
        &["partition"]
    );

    /// Approximate live entries in the partition's runtime database.
    pub static ref DB_ENTRIES: IntGaugeVec = register_gauge(
        "flowmill_partition_db_entries",
        "Approximate number of live entries in the runtime database",
        &["partition"]
    );
}

fn register_gauge(name: &str, help: &str, labels: &[&str]) -> IntGaugeVec {
    let gauge = IntGaugeVec::new(Opts::new(name, help), labels).expect("metric can be created");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("metric can be registered");
    gauge
}

fn register_histogram(name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let histogram = HistogramVec::new(
        HistogramOpts::new(name, help)
            .buckets(vec![0.005, 0.025, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        labels,
    )
    .expect("metric can be created");
    REGISTRY
        .register(Box::new(histogram.clone()))
        .expect("metric can be registered");
    histogram
}
