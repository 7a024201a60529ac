//! Prometheus text exposition format.
//!
//! Renders the controller status for scraping by a Prometheus server or
//! compatible agent.

use std::fmt::Write;

use tilescale_autoscale::ControllerStatus;

/// Render the controller status into Prometheus text format.
pub fn render_prometheus(status: &ControllerStatus) -> String {
    let mut out = String::new();

    gauge(
        &mut out,
        "tilescale_replicas_ready",
        "Replicas admitted by the health gate.",
        status.current_count,
    );
    gauge(
        &mut out,
        "tilescale_replicas_desired",
        "Desired replica count last accepted by the pool.",
        status.desired_count,
    );
    gauge(
        &mut out,
        "tilescale_replicas_total",
        "Replicas launched, ready or not.",
        status.total_count,
    );
    gauge(&mut out, "tilescale_replicas_min", "Lower replica bound.", status.min_count);
    gauge(&mut out, "tilescale_replicas_max", "Upper replica bound.", status.max_count);
    gauge(
        &mut out,
        "tilescale_target_requests_per_replica",
        "Target requests per replica.",
        status.target_requests_per_replica,
    );

    let observed = status
        .last_sample
        .map(|s| s.requests_per_replica)
        .unwrap_or(0.0);
    gauge(
        &mut out,
        "tilescale_requests_per_replica",
        "Requests per replica in the last evaluated sample.",
        observed,
    );

    counter(
        &mut out,
        "tilescale_samples_evaluated_total",
        "Metric samples evaluated.",
        status.samples_evaluated,
    );
    counter(
        &mut out,
        "tilescale_samples_dropped_total",
        "Metric samples rejected as invalid.",
        status.dropped_samples,
    );
    counter(
        &mut out,
        "tilescale_scale_apply_failures_total",
        "Scale commands the pool could not apply.",
        status.failed_applies,
    );

    gauge(
        &mut out,
        "tilescale_last_scale_out_timestamp_seconds",
        "Unix time of the last applied scale-out.",
        status.state.last_scale_out_at.unwrap_or(0),
    );
    gauge(
        &mut out,
        "tilescale_last_scale_in_timestamp_seconds",
        "Unix time of the last applied scale-in.",
        status.state.last_scale_in_at.unwrap_or(0),
    );

    out
}

fn gauge(out: &mut String, name: &str, help: &str, value: impl std::fmt::Display) {
    metric(out, name, help, "gauge", value);
}

fn counter(out: &mut String, name: &str, help: &str, value: impl std::fmt::Display) {
    metric(out, name, help, "counter", value);
}

fn metric(out: &mut String, name: &str, help: &str, kind: &str, value: impl std::fmt::Display) {
    // Writing to a String cannot fail.
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    let _ = writeln!(out, "{name} {value}");
}
