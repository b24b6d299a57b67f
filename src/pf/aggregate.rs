use std::collections::BTreeMap;

use tracing::warn;

use super::{PfError, QueueForest, LOAD_FACTOR};

/// Set each declared child's parent, dropping children that do not exist.
pub fn apply_parents(queues: &mut QueueForest) -> Result<(), PfError> {
    let mut claims: BTreeMap<String, String> = BTreeMap::new();

    for (name, queue) in queues.iter() {
        for child in &queue.children {
            if !queues.contains_key(child) {
                continue;
            }
            if let Some(first) = claims.get(child) {
                return Err(PfError::DuplicateParent {
                    child: child.clone(),
                    first: first.clone(),
                    second: name.clone(),
                });
            }
            claims.insert(child.clone(), name.clone());
        }
    }

    let known: Vec<String> = queues.keys().cloned().collect();
    for queue in queues.values_mut() {
        queue.children.retain(|child| {
            let exists = known.binary_search(child).is_ok();
            if !exists {
                warn!(queue = %queue.name, child = %child, "unknown child queue");
            }
            exists
        });
        queue.parent = claims.get(&queue.name).cloned();
    }

    Ok(())
}

/// Ancestors of `name`, nearest first. Fails if the parent chain loops.
fn ancestors(queues: &QueueForest, name: &str) -> Result<Vec<String>, PfError> {
    let mut chain = Vec::new();
    let mut cursor = queues.get(name).and_then(|q| q.parent.clone());

    while let Some(parent) = cursor {
        if parent == name || chain.contains(&parent) || chain.len() > queues.len() {
            return Err(PfError::Cycle { queue: parent });
        }
        cursor = queues.get(&parent).and_then(|q| q.parent.clone());
        chain.push(parent);
    }

    Ok(chain)
}

/// Roll leaf counters into ancestors and average load factors.
///
/// Requires parents to be set by [`apply_parents`]. pfctl reports zeroed
/// counters for parent queues, so every non-load-factor metric of a leaf is
/// added to each ancestor. Then every node with children gets `queue_load_factor = (own + sum of direct children) / child count`,
/// processed deepest first so each node is averaged exactly once.
pub fn summarize_children(queues: &mut QueueForest) -> Result<(), PfError> {
    let mut depths: BTreeMap<String, usize> = BTreeMap::new();
    let mut additions: Vec<(String, String, f64)> = Vec::new();

    for (name, queue) in queues.iter() {
        let chain = ancestors(queues, name)?;
        depths.insert(name.clone(), chain.len());

        if !queue.is_leaf() {
            continue;
        }
        for ancestor in &chain {
            for (metric, value) in queue.metrics.iter().filter(|(m, _)| *m != LOAD_FACTOR) {
                additions.push((ancestor.clone(), metric.clone(), *value));
            }
        }
    }

    for (ancestor, metric, value) in additions {
        if let Some(queue) = queues.get_mut(&ancestor) {
            *queue.metrics.entry(metric).or_insert(0.0) += value;
        }
    }

    let mut interior: Vec<(usize, String)> = queues
        .values()
        .filter(|q| !q.is_leaf())
        .map(|q| (depths.get(&q.name).copied().unwrap_or(0), q.name.clone()))
        .collect();
    interior.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

    for (_, name) in interior {
        let Some(queue) = queues.get(&name) else {
            continue;
        };

        let own = queue.metrics.get(LOAD_FACTOR).copied();
        let from_children: Vec<f64> = queue
            .children
            .iter()
            .filter_map(|child| queues.get(child))
            .filter_map(|child| child.metrics.get(LOAD_FACTOR).copied())
            .collect();

        if own.is_none() && from_children.is_empty() {
            continue;
        }

        let count = queue.children.len() as f64;
        let total = own.unwrap_or(0.0) + from_children.iter().sum::<f64>();

        if let Some(queue) = queues.get_mut(&name) {
            queue.metrics.insert(LOAD_FACTOR.to_string(), total / count);
        }
    }

    Ok(())
}

/// [`apply_parents`] followed by [`summarize_children`].
pub fn aggregate(queues: &mut QueueForest) -> Result<(), PfError> {
    apply_parents(queues)?;
    summarize_children(queues)
}
