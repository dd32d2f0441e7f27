use std::collections::{HashMap, HashSet};

use crate::model::{FailureReason, FailureRecord};

/// Diff the targeted node set against the successfully persisted one and
/// attach a best-effort reason to every unresolved node.
///
/// Reasons come from the failure records the parse/write stages
/// accumulated; a target with no recorded failure (the service never
/// returned a line for it, for example) is classified `unknown`. The
/// result feeds the retry builder unchanged: retries are rebuilt
/// through the normal packaging path, not a special one.
pub fn classify_unresolved(
    targets: &[i64],
    satisfied: &HashSet<i64>,
    records: &[FailureRecord],
) -> Vec<FailureRecord> {
    let mut by_node: HashMap<i64, &FailureRecord> = HashMap::new();
    for record in records {
        by_node.insert(record.node_id, record);
    }

    targets
        .iter()
        .filter(|node_id| !satisfied.contains(node_id))
        .map(|&node_id| match by_node.get(&node_id) {
            Some(record) => (*record).clone(),
            None => FailureRecord {
                node_id,
                reason: FailureReason::Unknown,
                error: "no successful output recorded".to_string(),
            },
        })
        .collect()
}
