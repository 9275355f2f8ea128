//! Prometheus metrics for the One-UI control plane.
//!
//! All metric types use atomics internally (no locks on the hot path).
//! Serving the scrape endpoint is a collaborator concern; this module only
//! owns the registry and the typed collectors.

use prometheus::{
    Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// All Prometheus metrics for the control plane.
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // -- Process & Build --
    pub process_start_time_seconds: Gauge,
    pub build_info: GaugeVec,

    // -- Stats collector --
    pub online_users: IntGauge,
    pub stats_ticks_total: IntCounterVec,
    pub stats_tick_duration_seconds: Histogram,
    pub traffic_bytes_total: IntCounterVec,

    // -- Apply engine --
    pub apply_total: IntCounterVec,

    // -- Update coordinator --
    pub update_actions_total: IntCounterVec,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let process_start_time_seconds =
            Gauge::new("process_start_time_seconds", "Start time of the process").unwrap();
        registry
            .register(Box::new(process_start_time_seconds.clone()))
            .unwrap();

        let build_info = GaugeVec::new(
            Opts::new("oneui_build_info", "Build information"),
            &["version"],
        )
        .unwrap();
        registry.register(Box::new(build_info.clone())).unwrap();

        // Register standard process metrics (RSS, CPU, open FDs on Linux)
        #[cfg(target_os = "linux")]
        {
            let pc = prometheus::process_collector::ProcessCollector::for_self();
            let _ = registry.register(Box::new(pc));
        }

        let online_users = IntGauge::new(
            "oneui_online_users",
            "Users with a positive traffic delta in the last collector tick",
        )
        .unwrap();
        registry.register(Box::new(online_users.clone())).unwrap();

        let stats_ticks_total = IntCounterVec::new(
            Opts::new("oneui_stats_ticks_total", "Collector ticks by result"),
            &["result"],
        )
        .unwrap();
        registry
            .register(Box::new(stats_ticks_total.clone()))
            .unwrap();

        let stats_tick_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "oneui_stats_tick_duration_seconds",
            "Collector tick duration in seconds",
        ))
        .unwrap();
        registry
            .register(Box::new(stats_tick_duration_seconds.clone()))
            .unwrap();

        let traffic_bytes_total = IntCounterVec::new(
            Opts::new(
                "oneui_traffic_bytes_total",
                "Traffic bytes attributed to users, by direction",
            ),
            &["direction"],
        )
        .unwrap();
        registry
            .register(Box::new(traffic_bytes_total.clone()))
            .unwrap();

        let apply_total = IntCounterVec::new(
            Opts::new("oneui_apply_total", "Config apply operations by result"),
            &["result"],
        )
        .unwrap();
        registry.register(Box::new(apply_total.clone())).unwrap();

        let update_actions_total = IntCounterVec::new(
            Opts::new(
                "oneui_update_actions_total",
                "Update coordinator actions by action and result",
            ),
            &["action", "result"],
        )
        .unwrap();
        registry
            .register(Box::new(update_actions_total.clone()))
            .unwrap();

        Self {
            registry,
            process_start_time_seconds,
            build_info,
            online_users,
            stats_ticks_total,
            stats_tick_duration_seconds,
            traffic_bytes_total,
            apply_total,
            update_actions_total,
        }
    }

    /// Render the registry in the Prometheus text format.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
