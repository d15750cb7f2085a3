use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// One observation of one id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemState {
    Success,
    /// Definitive failure reported by the provider.
    Failed(String),
    /// Visible but not settled yet.
    Pending,
}

/// Partition of a requested id set into settled-success, settled-failed and
/// unknown. Every requested id sits in exactly one of the three lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub success: Vec<String>,
    pub failed: Vec<String>,
    pub unknown: Vec<String>,
    /// Failure reason per failed id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reasons: BTreeMap<String, String>,
}

impl BatchResult {
    /// Classifies observations against `requested`, in requested order.
    ///
    /// Order and duplicates of `observed` do not matter: a failure wins over
    /// a success for the same id, and ids with no settled observation are
    /// unknown. Observations of ids outside `requested` are dropped.
    pub fn collect<I>(requested: &[String], observed: I) -> Self
    where
        I: IntoIterator<Item = (String, ItemState)>,
    {
        let mut seen: HashMap<String, ItemState> = HashMap::new();
        for (id, state) in observed {
            let keep = match (seen.get(&id), &state) {
                (Some(ItemState::Failed(_)), _) => false,
                (Some(ItemState::Success), ItemState::Pending) => false,
                _ => true,
            };
            if keep {
                seen.insert(id, state);
            }
        }

        let mut result = BatchResult::default();
        let mut placed = HashSet::new();
        for id in requested {
            if !placed.insert(id.as_str()) {
                continue;
            }
            match seen.remove(id) {
                Some(ItemState::Success) => result.success.push(id.clone()),
                Some(ItemState::Failed(reason)) => {
                    result.reasons.insert(id.clone(), reason);
                    result.failed.push(id.clone());
                }
                Some(ItemState::Pending) | None => result.unknown.push(id.clone()),
            }
        }
        result
    }

    /// Forces the partition invariant against `requested`: drops foreign
    /// ids and duplicates, and files every unplaced id under unknown.
    pub fn reconcile(&mut self, requested: &[String]) {
        let wanted: HashSet<&str> = requested.iter().map(String::as_str).collect();
        let mut placed: HashSet<String> = HashSet::new();

        let mut keep = |list: &mut Vec<String>| {
            list.retain(|id| wanted.contains(id.as_str()) && placed.insert(id.clone()));
        };
        keep(&mut self.failed);
        keep(&mut self.success);
        keep(&mut self.unknown);

        for id in requested {
            if placed.insert(id.clone()) {
                self.unknown.push(id.clone());
            }
        }
        let failed: HashSet<&String> = self.failed.iter().collect();
        self.reasons.retain(|id, _| failed.contains(id));
    }

    pub fn is_settled(&self) -> bool {
        self.unknown.is_empty()
    }

    pub fn total(&self) -> usize {
        self.success.len() + self.failed.len() + self.unknown.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn failure_wins_and_reasons_are_kept() {
        let requested = ids(&["a", "b", "c"]);
        let result = BatchResult::collect(
            &requested,
            vec![
                ("b".to_string(), ItemState::Success),
                ("a".to_string(), ItemState::Success),
                ("b".to_string(), ItemState::Failed("quota exceeded".into())),
                ("b".to_string(), ItemState::Success),
                ("zzz".to_string(), ItemState::Success),
            ],
        );
        assert_eq!(result.success, ids(&["a"]));
        assert_eq!(result.failed, ids(&["b"]));
        assert_eq!(result.unknown, ids(&["c"]));
        assert_eq!(result.reasons["b"], "quota exceeded");
        assert_eq!(result.total(), 3);
    }

    #[test]
    fn reconcile_restores_partition() {
        let requested = ids(&["a", "b", "c", "d"]);
        let mut result = BatchResult {
            success: ids(&["a", "b", "x"]),
            failed: ids(&["b"]),
            unknown: vec![],
            reasons: BTreeMap::from([("b".to_string(), "gone".to_string())]),
        };
        result.reconcile(&requested);
        assert_eq!(result.failed, ids(&["b"]));
        assert_eq!(result.success, ids(&["a"]));
        assert_eq!(result.unknown, ids(&["c", "d"]));
        assert_eq!(result.total(), requested.len());
    }
}
