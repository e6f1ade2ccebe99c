//! Memory reporting
//!
//! Counts listener registrations ("referents") held by the well-known
//! manager trees and flags message names with suspiciously many
//! registrations on one node, which usually means a leak.

use std::collections::BTreeMap;
use std::sync::Arc;

use manager_config::ReporterConfig;
use tracing::debug;

use crate::context::ProcessContext;
use crate::node::MessageManager;

/// Registrations found under one tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferentCount {
    pub strong: usize,
    pub weak_alive: usize,
    pub weak_dead: usize,
    /// Message names at or above the threshold on a single node, with their
    /// largest per-node count
    pub suspects: BTreeMap<String, usize>,
}

/// One reported quantity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryReport {
    pub path: String,
    pub amount: usize,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct MessageManagerReporter {
    suspect_threshold: usize,
}

impl MessageManagerReporter {
    pub fn new(suspect_threshold: usize) -> Self {
        Self { suspect_threshold }
    }

    pub fn from_config(config: &ReporterConfig) -> Self {
        Self::new(config.suspect_referent_count)
    }

    pub fn suspect_threshold(&self) -> usize {
        self.suspect_threshold
    }

    /// Walk `root` and its descendants
    pub fn count_referents(&self, root: &Arc<MessageManager>) -> ReferentCount {
        let mut count = ReferentCount::default();
        self.count_into(root, &mut count);
        count
    }

    fn count_into(&self, node: &Arc<MessageManager>, count: &mut ReferentCount) {
        for (name, counts) in node.listener_counts() {
            count.strong += counts.strong;
            count.weak_alive += counts.weak_alive;
            count.weak_dead += counts.weak_dead;

            let total = counts.total();
            if total >= self.suspect_threshold {
                let slot = count.suspects.entry(name.to_string()).or_insert(0);
                *slot = (*slot).max(total);
            }
        }
        for child in node.children() {
            self.count_into(&child, count);
        }
    }

    /// Reports for the global, parent-process and child-process trees
    pub fn collect_reports(&self, context: &ProcessContext) -> Vec<MemoryReport> {
        let roots = [
            ("global-manager", context.global_manager()),
            ("parent-process-manager", context.parent_process_manager()),
            ("child-process-manager", context.child_process_manager()),
        ];

        let mut reports = Vec::new();
        for (kind, root) in roots {
            let Some(root) = root else { continue };
            let count = self.count_referents(&root);
            debug!(
                kind,
                strong = count.strong,
                weak_alive = count.weak_alive,
                weak_dead = count.weak_dead,
                suspects = count.suspects.len(),
                "Counted message manager referents"
            );
            append_reports(&mut reports, kind, &count);
        }
        reports
    }
}

impl Default for MessageManagerReporter {
    fn default() -> Self {
        Self::from_config(&ReporterConfig::default())
    }
}

fn append_reports(reports: &mut Vec<MemoryReport>, kind: &str, count: &ReferentCount) {
    let referent = |suffix: &str, amount: usize, description: &str| MemoryReport {
        path: format!("message-manager/referent/{}/{}", kind, suffix),
        amount,
        description: description.to_string(),
    };
    reports.push(referent(
        "strong",
        count.strong,
        "Strong listener registrations",
    ));
    reports.push(referent(
        "weak/alive",
        count.weak_alive,
        "Weak listener registrations whose listener is alive",
    ));
    reports.push(referent(
        "weak/dead",
        count.weak_dead,
        "Weak listener registrations whose listener is gone",
    ));

    for (name, amount) in &count.suspects {
        reports.push(MemoryReport {
            path: format!("message-manager-suspect/{}/referent(message={})", kind, name),
            amount: *amount,
            description: "A message with a suspicious number of listener registrations on one manager"
                .to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ProcessKind;
    use crate::listeners::listener_fn;
    use manager_config::MessageManagerConfig;

    #[test]
    fn test_counts_strong_weak_and_dead() {
        let ctx = ProcessContext::new(ProcessKind::Parent, MessageManagerConfig::default());
        let global = ctx.create_global_manager().unwrap();
        let window = ctx.create_window_manager().unwrap();

        let kept = listener_fn(|_| Ok(None));
        global.add_message_listener("a", &kept).unwrap();
        window.add_weak_message_listener("b", &kept).unwrap();
        {
            let dropped = listener_fn(|_| Ok(None));
            window.add_weak_message_listener("c", &dropped).unwrap();
        }

        let count = MessageManagerReporter::default().count_referents(&global);
        assert_eq!(count.strong, 1);
        assert_eq!(count.weak_alive, 1);
        assert_eq!(count.weak_dead, 1);
        assert!(count.suspects.is_empty());
    }

    #[test]
    fn test_suspect_threshold() {
        let ctx = ProcessContext::new(ProcessKind::Parent, MessageManagerConfig::default());
        let global = ctx.create_global_manager().unwrap();
        for _ in 0..3 {
            global
                .add_message_listener("leaky", &listener_fn(|_| Ok(None)))
                .unwrap();
        }

        let reports = MessageManagerReporter::new(3).collect_reports(&ctx);
        let suspect = reports
            .iter()
            .find(|r| r.path == "message-manager-suspect/global-manager/referent(message=leaky)")
            .unwrap();
        assert_eq!(suspect.amount, 3);
        assert!(reports
            .iter()
            .any(|r| r.path == "message-manager/referent/global-manager/strong" && r.amount == 3));
    }
}
