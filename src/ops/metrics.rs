//! Process-wide counters surfaced on the telemetry endpoint.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct SwitchboardMetrics {
    connections_active: AtomicU64,
    connections_total: AtomicU64,
    auth_failures_total: AtomicU64,
    fanout_dropped_total: AtomicU64,
    broadcast_dropped_total: AtomicU64,
    pumps_active: AtomicU64,
    deliveries_confirmed_total: AtomicU64,
    deliveries_timed_out_total: AtomicU64,
    deliveries_skipped_total: AtomicU64,
    pump_reinit_total: AtomicU64,
    unresolved_recipients_total: AtomicU64,
    push_failures_total: AtomicU64,
    archived_total: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_active: u64,
    pub connections_total: u64,
    pub auth_failures_total: u64,
    pub fanout_dropped_total: u64,
    pub broadcast_dropped_total: u64,
    pub pumps_active: u64,
    pub deliveries_confirmed_total: u64,
    pub deliveries_timed_out_total: u64,
    pub deliveries_skipped_total: u64,
    pub pump_reinit_total: u64,
    pub unresolved_recipients_total: u64,
    pub push_failures_total: u64,
    pub archived_total: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn drop_gauge(gauge: &AtomicU64) {
    let _ = gauge.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_sub(1))
    });
}

impl SwitchboardMetrics {
    pub fn connection_opened(&self) {
        bump(&self.connections_active);
        bump(&self.connections_total);
    }

    pub fn connection_closed(&self) {
        drop_gauge(&self.connections_active);
    }

    pub fn auth_failed(&self) {
        bump(&self.auth_failures_total);
    }

    /// A member's outbound queue was full; the frame was dropped for it only.
    pub fn fanout_dropped(&self) {
        bump(&self.fanout_dropped_total);
    }

    /// A broadcast worker queue was full.
    pub fn broadcast_dropped(&self) {
        bump(&self.broadcast_dropped_total);
    }

    pub fn pump_started(&self) {
        bump(&self.pumps_active);
    }

    pub fn pump_stopped(&self) {
        drop_gauge(&self.pumps_active);
    }

    pub fn delivery_confirmed(&self) {
        bump(&self.deliveries_confirmed_total);
    }

    pub fn delivery_timed_out(&self) {
        bump(&self.deliveries_timed_out_total);
    }

    pub fn delivery_skipped(&self) {
        bump(&self.deliveries_skipped_total);
    }

    pub fn pump_reinitialized(&self) {
        bump(&self.pump_reinit_total);
    }

    pub fn recipient_unresolved(&self) {
        bump(&self.unresolved_recipients_total);
    }

    pub fn push_failed(&self) {
        bump(&self.push_failures_total);
    }

    pub fn archived(&self, count: u64) {
        self.archived_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            connections_active: load(&self.connections_active),
            connections_total: load(&self.connections_total),
            auth_failures_total: load(&self.auth_failures_total),
            fanout_dropped_total: load(&self.fanout_dropped_total),
            broadcast_dropped_total: load(&self.broadcast_dropped_total),
            pumps_active: load(&self.pumps_active),
            deliveries_confirmed_total: load(&self.deliveries_confirmed_total),
            deliveries_timed_out_total: load(&self.deliveries_timed_out_total),
            deliveries_skipped_total: load(&self.deliveries_skipped_total),
            pump_reinit_total: load(&self.pump_reinit_total),
            unresolved_recipients_total: load(&self.unresolved_recipients_total),
            push_failures_total: load(&self.push_failures_total),
            archived_total: load(&self.archived_total),
        }
    }
}

impl MetricsSnapshot {
    /// Plain-text exposition, one `name value` pair per line.
    pub fn render(&self) -> String {
        let rows = [
            ("switchboard_connections_active", self.connections_active),
            ("switchboard_connections_total", self.connections_total),
            ("switchboard_auth_failures_total", self.auth_failures_total),
            ("switchboard_fanout_dropped_total", self.fanout_dropped_total),
            (
                "switchboard_broadcast_dropped_total",
                self.broadcast_dropped_total,
            ),
            ("switchboard_pumps_active", self.pumps_active),
            (
                "switchboard_deliveries_confirmed_total",
                self.deliveries_confirmed_total,
            ),
            (
                "switchboard_deliveries_timed_out_total",
                self.deliveries_timed_out_total,
            ),
            (
                "switchboard_deliveries_skipped_total",
                self.deliveries_skipped_total,
            ),
            ("switchboard_pump_reinit_total", self.pump_reinit_total),
            (
                "switchboard_unresolved_recipients_total",
                self.unresolved_recipients_total,
            ),
            ("switchboard_push_failures_total", self.push_failures_total),
            ("switchboard_archived_total", self.archived_total),
        ];
        let mut body = String::new();
        for (name, value) in rows {
            body.push_str(&format!("{name} {value}\n"));
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauges_saturate_at_zero() {
        let metrics = SwitchboardMetrics::default();
        metrics.connection_closed();
        metrics.connection_opened();
        metrics.connection_opened();
        metrics.connection_closed();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_active, 1);
        assert_eq!(snapshot.connections_total, 2);
    }

    #[test]
    fn render_lists_every_counter() {
        let metrics = SwitchboardMetrics::default();
        metrics.archived(3);
        let body = metrics.snapshot().render();
        assert!(body.contains("switchboard_archived_total 3\n"));
        assert_eq!(body.lines().count(), 13);
    }
}
