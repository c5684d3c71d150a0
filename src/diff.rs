//! Snapshot diffing: repeated ingestion runs become discrete change events.

use std::collections::BTreeSet;

use crate::store::IndKey;

/// Plain set difference: `(added, removed)`.
pub fn diff_sets(old: &BTreeSet<IndKey>, new: &BTreeSet<IndKey>) -> (BTreeSet<IndKey>, BTreeSet<IndKey>) {
    let added = new.difference(old).cloned().collect();
    let removed = old.difference(new).cloned().collect();
    (added, removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(ind: &str, stage: &str) -> IndKey {
        (ind.to_string(), stage.to_string(), None)
    }

    #[test]
    fn stage_move_is_one_add_one_remove() {
        let old: BTreeSet<IndKey> = [key("NSCLC", "Phase 2")].into_iter().collect();
        let new: BTreeSet<IndKey> = [key("NSCLC", "Phase 3"), key("SCLC", "Phase 1")]
            .into_iter()
            .collect();

        let (added, removed) = diff_sets(&old, &new);
        assert_eq!(
            added,
            [key("NSCLC", "Phase 3"), key("SCLC", "Phase 1")].into_iter().collect()
        );
        assert_eq!(removed, [key("NSCLC", "Phase 2")].into_iter().collect());
    }

    #[test]
    fn identical_snapshots_diff_to_nothing() {
        let set: BTreeSet<IndKey> = [key("NMIBC", "Phase 3")].into_iter().collect();
        let (added, removed) = diff_sets(&set, &set.clone());
        assert!(added.is_empty());
        assert!(removed.is_empty());
    }

    #[test]
    fn empty_old_set_means_everything_added() {
        let old = BTreeSet::new();
        let new: BTreeSet<IndKey> = [key("MM", "Registration")].into_iter().collect();
        let (added, removed) = diff_sets(&old, &new);
        assert_eq!(added.len(), 1);
        assert!(removed.is_empty());
    }
}
