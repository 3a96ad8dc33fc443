//! Playlist definitions and the ordered diff against the device copy.

use crate::error::{SyncError, SyncResult};
use bridge_traits::PlaylistOperation;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Desired state of one device playlist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistDefinition {
    pub name: String,
    /// Ordered member fingerprints.
    pub members: Vec<String>,
    /// Monotonic revision supplied by the caller.
    pub revision: u64,
}

impl PlaylistDefinition {
    pub fn new(name: impl Into<String>, members: Vec<String>, revision: u64) -> Self {
        Self {
            name: name.into(),
            members,
            revision,
        }
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.name.trim().is_empty() {
            return Err(SyncError::InvalidDefinition(
                "playlist name must not be empty".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for member in &self.members {
            if member.is_empty() {
                return Err(SyncError::InvalidDefinition(format!(
                    "playlist {} has an empty member fingerprint",
                    self.name
                )));
            }
            if !seen.insert(member.as_str()) {
                return Err(SyncError::InvalidDefinition(format!(
                    "playlist {} lists {} more than once",
                    self.name, member
                )));
            }
        }
        Ok(())
    }
}

/// Result of comparing a definition with the device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaylistDiff {
    /// Operations in application order.
    pub operations: Vec<PlaylistOperation>,
    /// Members left out because the device library does not have them yet.
    pub deferred: Vec<String>,
}

impl PlaylistDiff {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Compute the operations that turn `current` into `target`.
///
/// `current` is `None` when the playlist does not exist on the device. Target
/// members missing from `library` are deferred unless the device playlist
/// already holds them. Members that keep their relative order (the longest
/// increasing run by target position) stay in place; everything else is moved,
/// so the number of moves is minimal.
pub fn diff(
    current: Option<&[String]>,
    target: &[String],
    library: &HashSet<String>,
) -> PlaylistDiff {
    let mut operations = Vec::new();
    let existing: &[String] = match current {
        Some(members) => members,
        None => {
            operations.push(PlaylistOperation::Create);
            &[]
        }
    };
    let on_playlist: HashSet<&str> = existing.iter().map(String::as_str).collect();

    let mut deferred = Vec::new();
    let mut wanted = Vec::new();
    for member in target {
        if library.contains(member) || on_playlist.contains(member.as_str()) {
            wanted.push(member.as_str());
        } else {
            deferred.push(member.clone());
        }
    }
    let position: HashMap<&str, usize> = wanted.iter().enumerate().map(|(i, m)| (*m, i)).collect();

    let mut survivors = Vec::new();
    for member in existing {
        if position.contains_key(member.as_str()) {
            survivors.push(member.as_str());
        } else {
            operations.push(PlaylistOperation::Remove {
                fingerprint: member.clone(),
            });
        }
    }

    let order: Vec<usize> = survivors.iter().map(|m| position[m]).collect();
    let stable: HashSet<&str> = longest_increasing(&order)
        .into_iter()
        .map(|i| survivors[i])
        .collect();
    let present: HashSet<&str> = survivors.iter().copied().collect();

    let mut after: Option<String> = None;
    for member in wanted {
        if !present.contains(member) {
            operations.push(PlaylistOperation::Add {
                fingerprint: member.to_string(),
                after: after.clone(),
            });
        } else if !stable.contains(member) {
            operations.push(PlaylistOperation::Move {
                fingerprint: member.to_string(),
                after: after.clone(),
            });
        }
        after = Some(member.to_string());
    }

    PlaylistDiff {
        operations,
        deferred,
    }
}

/// Indices into `values` of one longest strictly increasing subsequence.
fn longest_increasing(values: &[usize]) -> Vec<usize> {
    // tails[k]: index of the smallest tail of an increasing run of length k + 1
    let mut tails: Vec<usize> = Vec::new();
    let mut previous: Vec<Option<usize>> = vec![None; values.len()];

    for (i, value) in values.iter().enumerate() {
        let slot = tails.partition_point(|&t| values[t] < *value);
        previous[i] = slot.checked_sub(1).map(|s| tails[s]);
        if slot == tails.len() {
            tails.push(i);
        } else {
            tails[slot] = i;
        }
    }

    let mut run = Vec::with_capacity(tails.len());
    let mut cursor = tails.last().copied();
    while let Some(i) = cursor {
        run.push(i);
        cursor = previous[i];
    }
    run.reverse();
    run
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn library(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn apply(current: Option<&[String]>, ops: &[PlaylistOperation]) -> Vec<String> {
        let mut members = current.map(<[String]>::to_vec).unwrap_or_default();
        for op in ops {
            op.apply_to(&mut members).unwrap();
        }
        members
    }

    #[test]
    fn test_create_and_fill_missing_playlist() {
        let target = list(&["a", "b", "c"]);
        let result = diff(None, &target, &library(&["a", "b", "c"]));

        assert_eq!(result.operations[0], PlaylistOperation::Create);
        assert_eq!(result.operations.len(), 4);
        assert_eq!(apply(None, &result.operations), target);
    }

    #[test]
    fn test_in_sync_playlist_needs_no_operations() {
        let current = list(&["a", "b", "c"]);
        let result = diff(Some(&current), &current, &library(&["a", "b", "c"]));

        assert!(result.is_empty());
        assert!(result.deferred.is_empty());
    }

    #[test]
    fn test_reorder_uses_minimal_moves() {
        let current = list(&["c", "a", "b"]);
        let target = list(&["a", "b", "c"]);
        let result = diff(Some(&current), &target, &library(&["a", "b", "c"]));

        assert_eq!(
            result.operations,
            vec![PlaylistOperation::Move {
                fingerprint: "c".into(),
                after: Some("b".into())
            }]
        );
    }

    #[test]
    fn test_mixed_changes_converge() {
        let current = list(&["e", "a", "x", "d", "b", "c"]);
        let target = list(&["a", "b", "c", "d", "e", "f"]);
        let lib = library(&["a", "b", "c", "d", "e", "f", "x"]);

        let result = diff(Some(&current), &target, &lib);
        let applied = apply(Some(&current), &result.operations);
        assert_eq!(applied, target);

        let removes = result
            .operations
            .iter()
            .filter(|op| matches!(op, PlaylistOperation::Remove { .. }))
            .count();
        let moves = result
            .operations
            .iter()
            .filter(|op| matches!(op, PlaylistOperation::Move { .. }))
            .count();
        assert_eq!(removes, 1);
        // a, b, c stay; d and e move.
        assert_eq!(moves, 2);

        assert!(diff(Some(&applied), &target, &lib).is_empty());
    }

    #[test]
    fn test_reversal_converges() {
        let current = list(&["a", "b", "c", "d", "e"]);
        let target = list(&["e", "d", "c", "b", "a"]);
        let result = diff(Some(&current), &target, &library(&["a", "b", "c", "d", "e"]));

        assert_eq!(apply(Some(&current), &result.operations), target);
        assert_eq!(result.operations.len(), 4);
    }

    #[test]
    fn test_members_missing_from_library_are_deferred() {
        let current = list(&["a"]);
        let target = list(&["a", "late", "b"]);
        let result = diff(Some(&current), &target, &library(&["a", "b"]));

        assert_eq!(result.deferred, list(&["late"]));
        assert_eq!(apply(Some(&current), &result.operations), list(&["a", "b"]));
    }

    #[test]
    fn test_member_already_on_playlist_is_never_deferred() {
        let current = list(&["a", "b"]);
        let target = list(&["b", "a"]);
        let result = diff(Some(&current), &target, &library(&["a"]));

        assert!(result.deferred.is_empty());
        assert_eq!(apply(Some(&current), &result.operations), target);
    }

    #[test]
    fn test_longest_increasing_indices() {
        assert_eq!(longest_increasing(&[]), Vec::<usize>::new());
        assert_eq!(longest_increasing(&[2, 0, 1]), vec![1, 2]);
        assert_eq!(longest_increasing(&[0, 4, 1, 2, 3]).len(), 4);
    }

    #[test]
    fn test_validate_rejects_duplicates_and_blank_names() {
        let ok = PlaylistDefinition::new("Road", list(&["a", "b"]), 1);
        assert!(ok.validate().is_ok());

        let duplicate = PlaylistDefinition::new("Road", list(&["a", "a"]), 1);
        assert!(matches!(
            duplicate.validate(),
            Err(SyncError::InvalidDefinition(_))
        ));

        let blank = PlaylistDefinition::new("  ", Vec::new(), 1);
        assert!(matches!(blank.validate(), Err(SyncError::InvalidDefinition(_))));
    }
}
