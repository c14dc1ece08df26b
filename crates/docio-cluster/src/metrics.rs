//! Cluster metrics
//!
//! Plain atomic counters with a Prometheus text exporter.

use serde::Serialize;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ClusterMetrics {
    pub writes_routed: AtomicU64,
    pub writes_failed: AtomicU64,
    pub forwards_total: AtomicU64,
    pub forward_failures: AtomicU64,
    pub leader_elections: AtomicU64,
    pub nodes_lost: AtomicU64,
    pub nodes_joined: AtomicU64,
    pub recoveries_up_to_date: AtomicU64,
    pub peer_syncs: AtomicU64,
    pub full_replications: AtomicU64,
    pub recovery_failures: AtomicU64,
    pub entries_replayed: AtomicU64,
    pub backups_started: AtomicU64,
    pub backups_succeeded: AtomicU64,
    pub backups_failed: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub writes_routed: u64,
    pub writes_failed: u64,
    pub forwards_total: u64,
    pub forward_failures: u64,
    pub leader_elections: u64,
    pub nodes_lost: u64,
    pub nodes_joined: u64,
    pub recoveries_up_to_date: u64,
    pub peer_syncs: u64,
    pub full_replications: u64,
    pub recovery_failures: u64,
    pub entries_replayed: u64,
    pub backups_started: u64,
    pub backups_succeeded: u64,
    pub backups_failed: u64,
}

impl ClusterMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            writes_routed: get(&self.writes_routed),
            writes_failed: get(&self.writes_failed),
            forwards_total: get(&self.forwards_total),
            forward_failures: get(&self.forward_failures),
            leader_elections: get(&self.leader_elections),
            nodes_lost: get(&self.nodes_lost),
            nodes_joined: get(&self.nodes_joined),
            recoveries_up_to_date: get(&self.recoveries_up_to_date),
            peer_syncs: get(&self.peer_syncs),
            full_replications: get(&self.full_replications),
            recovery_failures: get(&self.recovery_failures),
            entries_replayed: get(&self.entries_replayed),
            backups_started: get(&self.backups_started),
            backups_succeeded: get(&self.backups_succeeded),
            backups_failed: get(&self.backups_failed),
        }
    }

    /// Export metrics in Prometheus format
    #[must_use]
    pub fn export_prometheus(&self, cluster: &str) -> String {
        let mut output = String::with_capacity(4 * 1024);
        let s = self.snapshot();

        let counters: [(&str, &str, u64); 10] = [
            ("docio_writes_routed_total", "Writes acknowledged by a shard leader", s.writes_routed),
            ("docio_writes_failed_total", "Writes rejected or failed", s.writes_failed),
            ("docio_forwards_total", "Fan-out forwards to replicas", s.forwards_total),
            ("docio_forward_failures_total", "Fan-out forwards that failed", s.forward_failures),
            ("docio_leader_elections_total", "Shard leader elections", s.leader_elections),
            ("docio_nodes_lost_total", "Nodes marked dead", s.nodes_lost),
            ("docio_nodes_joined_total", "Nodes that (re)joined", s.nodes_joined),
            ("docio_recovery_failures_total", "Replicas that exhausted recovery attempts", s.recovery_failures),
            ("docio_entries_replayed_total", "Update log entries replayed during recovery", s.entries_replayed),
            ("docio_backups_started_total", "Backup jobs started", s.backups_started),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(output, "# HELP {name} {help}");
            let _ = writeln!(output, "# TYPE {name} counter");
            let _ = writeln!(output, "{name}{{cluster=\"{cluster}\"}} {value}");
        }

        // Recoveries by strategy
        let _ = writeln!(
            output,
            "# HELP docio_recoveries_total Completed replica recoveries by strategy"
        );
        let _ = writeln!(output, "# TYPE docio_recoveries_total counter");
        for (strategy, value) in [
            ("up_to_date", s.recoveries_up_to_date),
            ("peer_sync", s.peer_syncs),
            ("full_replication", s.full_replications),
        ] {
            let _ = writeln!(
                output,
                "docio_recoveries_total{{cluster=\"{cluster}\",strategy=\"{strategy}\"}} {value}"
            );
        }

        // Finished backups by status
        let _ = writeln!(
            output,
            "# HELP docio_backups_finished_total Finished backup jobs by status"
        );
        let _ = writeln!(output, "# TYPE docio_backups_finished_total counter");
        for (status, value) in [("success", s.backups_succeeded), ("failed", s.backups_failed)] {
            let _ = writeln!(
                output,
                "docio_backups_finished_total{{cluster=\"{cluster}\",status=\"{status}\"}} {value}"
            );
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = ClusterMetrics::new();
        ClusterMetrics::incr(&metrics.peer_syncs);
        ClusterMetrics::add(&metrics.entries_replayed, 12);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.peer_syncs, 1);
        assert_eq!(snapshot.entries_replayed, 12);
        assert_eq!(snapshot.full_replications, 0);
    }

    #[test]
    fn test_export_prometheus() {
        let metrics = ClusterMetrics::new();
        ClusterMetrics::incr(&metrics.full_replications);
        ClusterMetrics::incr(&metrics.writes_routed);
        let text = metrics.export_prometheus("test");
        assert!(text.contains("# TYPE docio_writes_routed_total counter"));
        assert!(text.contains("docio_writes_routed_total{cluster=\"test\"} 1"));
        assert!(text.contains(
            "docio_recoveries_total{cluster=\"test\",strategy=\"full_replication\"} 1"
        ));
    }
}
