//! Prometheus metrics for huddle.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`
//! and defines the metric names used across the crate.  Recording without
//! an installed recorder is a no-op, so library code and tests never need
//! to care whether metrics are enabled.

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

use crate::monitor::Role;

// -- Metric name constants ----------------------------------------------------

/// Frames decoded by the listener (counter). Labels: kind.
pub const FRAMES_RECEIVED_TOTAL: &str = "huddle_frames_received_total";

/// Inbound connections refused because the worker pool was full (counter).
pub const CONNECTIONS_REJECTED_TOTAL: &str = "huddle_connections_rejected_total";

/// Outbound sends (counter). Labels: outcome.
pub const SENDS_TOTAL: &str = "huddle_sends_total";

/// Peers reported unreachable by a failed send (counter).
pub const UNREACHABLE_REPORTS_TOTAL: &str = "huddle_unreachable_reports_total";

/// Members removed from the local roster (counter). Labels: reason.
pub const MEMBERS_REMOVED_TOTAL: &str = "huddle_members_removed_total";

/// Times this node promoted itself to coordinator (counter).
pub const FAILOVERS_TOTAL: &str = "huddle_failovers_total";

/// Other members in the local roster (gauge).
pub const ROSTER_SIZE: &str = "huddle_roster_size";

/// Current role: 0 member, 1 heir apparent, 2 coordinator (gauge).
pub const ROLE: &str = "huddle_role";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent -- safe to call
/// multiple times. Fails only if another recorder was installed first.
pub fn init_metrics() -> anyhow::Result<&'static PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle))
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(FRAMES_RECEIVED_TOTAL, "Frames decoded by the listener");
    describe_counter!(
        CONNECTIONS_REJECTED_TOTAL,
        "Inbound connections refused at capacity"
    );
    describe_counter!(SENDS_TOTAL, "Outbound sends by outcome");
    describe_counter!(UNREACHABLE_REPORTS_TOTAL, "Peers reported unreachable");
    describe_counter!(MEMBERS_REMOVED_TOTAL, "Members removed by reason");
    describe_counter!(FAILOVERS_TOTAL, "Self-promotions to coordinator");
    describe_gauge!(ROSTER_SIZE, "Other members in the local roster");
    describe_gauge!(ROLE, "0 member, 1 heir apparent, 2 coordinator");
}

/// Render the Prometheus exposition text, if the recorder is installed.
pub fn render() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

// -- Recording helpers ----------------------------------------------------------

pub(crate) fn frame_received(kind: &'static str) {
    counter!(FRAMES_RECEIVED_TOTAL, "kind" => kind).increment(1);
}

pub(crate) fn connection_rejected() {
    counter!(CONNECTIONS_REJECTED_TOTAL).increment(1);
}

pub(crate) fn send_finished(ok: bool) {
    let outcome = if ok { "ok" } else { "failed" };
    counter!(SENDS_TOTAL, "outcome" => outcome).increment(1);
    if !ok {
        counter!(UNREACHABLE_REPORTS_TOTAL).increment(1);
    }
}

pub(crate) fn member_removed(reason: &'static str) {
    counter!(MEMBERS_REMOVED_TOTAL, "reason" => reason).increment(1);
}

pub(crate) fn failover() {
    counter!(FAILOVERS_TOTAL).increment(1);
}

pub(crate) fn set_roster_size(len: usize) {
    gauge!(ROSTER_SIZE).set(len as f64);
}

pub(crate) fn set_role(role: Role) {
    let value = match role {
        Role::Member => 0.0,
        Role::HeirApparent => 1.0,
        Role::Coordinator => 2.0,
    };
    gauge!(ROLE).set(value);
}
