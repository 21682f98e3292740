use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("unknown obligation type: {0}")]
    UnknownType(Uuid),
    #[error("unknown exclusion group: {0}")]
    UnknownGroup(i32),
}

/// Lookup from obligation type id to its optional exclusion group, in
/// catalog listing order. "First member of a group" means first in this
/// order.
#[derive(Debug, Clone, Default)]
pub struct TypeCatalog {
    entries: Vec<(Uuid, Option<i32>)>,
    by_id: BTreeMap<Uuid, Option<i32>>,
}

impl TypeCatalog {
    pub fn new(entries: impl IntoIterator<Item = (Uuid, Option<i32>)>) -> Self {
        let entries: Vec<_> = entries.into_iter().collect();
        let by_id = entries.iter().copied().collect();
        Self { entries, by_id }
    }

    pub fn group_of(&self, type_id: Uuid) -> Result<Option<i32>, SelectionError> {
        self.by_id
            .get(&type_id)
            .copied()
            .ok_or(SelectionError::UnknownType(type_id))
    }

    pub fn contains(&self, type_id: Uuid) -> bool {
        self.by_id.contains_key(&type_id)
    }

    pub fn members_of_group(&self, group: i32) -> Vec<Uuid> {
        self.entries
            .iter()
            .filter(|(_, g)| *g == Some(group))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn standalone_members(&self) -> Vec<Uuid> {
        self.entries
            .iter()
            .filter(|(_, g)| g.is_none())
            .map(|(id, _)| *id)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToggleOutcome {
    pub selected: bool,
    /// The same-group occupant that had to give way, if any.
    pub displaced: Option<Uuid>,
}

/// Result of loading a persisted type-id set: the normalized state plus
/// whatever the normalization had to drop (unknown ids, or surplus members
/// of an exclusion group beyond the first).
#[derive(Debug, Clone)]
pub struct NormalizedSelection {
    pub state: SelectionState,
    pub dropped: Vec<Uuid>,
}

/// A client's active obligation-type selection. Grouped types live in a
/// per-group slot holding at most one occupant, so the mutual-exclusion
/// invariant cannot be violated by construction; ungrouped types form a
/// plain set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionState {
    selected_by_group: BTreeMap<i32, Uuid>,
    standalone: BTreeSet<Uuid>,
}

impl SelectionState {
    /// Rebuild from persisted ids, keep-first within each exclusion group.
    pub fn from_persisted(catalog: &TypeCatalog, ids: &[Uuid]) -> NormalizedSelection {
        let mut state = SelectionState::default();
        let mut dropped = Vec::new();
        for &id in ids {
            match catalog.group_of(id) {
                Ok(Some(group)) => {
                    if state.selected_by_group.contains_key(&group) {
                        dropped.push(id);
                    } else {
                        state.selected_by_group.insert(group, id);
                    }
                }
                Ok(None) => {
                    state.standalone.insert(id);
                }
                Err(_) => dropped.push(id),
            }
        }
        NormalizedSelection { state, dropped }
    }

    pub fn contains(&self, type_id: Uuid) -> bool {
        self.standalone.contains(&type_id)
            || self.selected_by_group.values().any(|&id| id == type_id)
    }

    pub fn selected_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self
            .selected_by_group
            .values()
            .copied()
            .chain(self.standalone.iter().copied())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.selected_by_group.len() + self.standalone.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selected_by_group.is_empty() && self.standalone.is_empty()
    }

    /// Deselect if selected; otherwise select, displacing the current
    /// occupant of the type's exclusion group.
    pub fn toggle(
        &mut self,
        catalog: &TypeCatalog,
        type_id: Uuid,
    ) -> Result<ToggleOutcome, SelectionError> {
        let group = catalog.group_of(type_id)?;

        if self.contains(type_id) {
            match group {
                Some(g) => {
                    self.selected_by_group.remove(&g);
                }
                None => {
                    self.standalone.remove(&type_id);
                }
            }
            return Ok(ToggleOutcome {
                selected: false,
                displaced: None,
            });
        }

        let displaced = match group {
            Some(g) => self.selected_by_group.insert(g, type_id),
            None => {
                self.standalone.insert(type_id);
                None
            }
        };
        Ok(ToggleOutcome {
            selected: true,
            displaced,
        })
    }

    /// Select the type, displacing a same-group occupant. Selecting an
    /// already-selected type is a no-op.
    pub fn select(
        &mut self,
        catalog: &TypeCatalog,
        type_id: Uuid,
    ) -> Result<ToggleOutcome, SelectionError> {
        if self.contains(type_id) {
            catalog.group_of(type_id)?;
            return Ok(ToggleOutcome {
                selected: true,
                displaced: None,
            });
        }
        self.toggle(catalog, type_id)
    }

    pub fn deselect(&mut self, catalog: &TypeCatalog, type_id: Uuid) -> Result<(), SelectionError> {
        if self.contains(type_id) {
            self.toggle(catalog, type_id)?;
        } else {
            catalog.group_of(type_id)?;
        }
        Ok(())
    }

    /// For an exclusion group: select the first catalog member, and only if
    /// the group currently has no occupant. Never selects more than one.
    pub fn select_all_in_group(
        &mut self,
        catalog: &TypeCatalog,
        group: i32,
    ) -> Result<Vec<Uuid>, SelectionError> {
        let members = catalog.members_of_group(group);
        if members.is_empty() {
            return Err(SelectionError::UnknownGroup(group));
        }
        if self.selected_by_group.contains_key(&group) {
            return Ok(Vec::new());
        }
        let first = members[0];
        self.selected_by_group.insert(group, first);
        Ok(vec![first])
    }

    /// For the ungrouped pool: select every member.
    pub fn select_all_standalone(&mut self, catalog: &TypeCatalog) -> Vec<Uuid> {
        let mut added = Vec::new();
        for id in catalog.standalone_members() {
            if self.standalone.insert(id) {
                added.push(id);
            }
        }
        added
    }

    pub fn deselect_all_in_group(
        &mut self,
        catalog: &TypeCatalog,
        group: i32,
    ) -> Result<Vec<Uuid>, SelectionError> {
        if catalog.members_of_group(group).is_empty() {
            return Err(SelectionError::UnknownGroup(group));
        }
        Ok(self
            .selected_by_group
            .remove(&group)
            .map(|id| vec![id])
            .unwrap_or_default())
    }

    pub fn deselect_all_standalone(&mut self) -> Vec<Uuid> {
        let removed: Vec<Uuid> = self.standalone.iter().copied().collect();
        self.standalone.clear();
        removed
    }

    /// Count of selected members of one exclusion group. By construction
    /// this is 0 or 1; kept as an assertion hook for tests.
    pub fn selected_in_group(&self, group: i32) -> usize {
        usize::from(self.selected_by_group.contains_key(&group))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    /// Catalog: t0, t1 in group 1; t2 in group 2; t3, t4 ungrouped.
    fn catalog(t: &[Uuid]) -> TypeCatalog {
        TypeCatalog::new([
            (t[0], Some(1)),
            (t[1], Some(1)),
            (t[2], Some(2)),
            (t[3], None),
            (t[4], None),
        ])
    }

    #[test]
    fn toggle_into_exclusion_group_displaces_the_occupant() {
        let t = ids(5);
        let cat = catalog(&t);
        let mut state = SelectionState::default();

        let out = state.toggle(&cat, t[0]).unwrap();
        assert!(out.selected);
        assert_eq!(out.displaced, None);

        let out = state.toggle(&cat, t[1]).unwrap();
        assert!(out.selected);
        assert_eq!(out.displaced, Some(t[0]));
        assert_eq!(state.selected_ids(), vec![t[1]]);
        assert_eq!(state.selected_in_group(1), 1);
    }

    #[test]
    fn toggling_a_selected_type_removes_only_it() {
        let t = ids(5);
        let cat = catalog(&t);
        let mut state = SelectionState::default();
        state.toggle(&cat, t[0]).unwrap();
        state.toggle(&cat, t[2]).unwrap();
        state.toggle(&cat, t[3]).unwrap();

        let out = state.toggle(&cat, t[2]).unwrap();
        assert!(!out.selected);
        assert_eq!(out.displaced, None);
        assert!(state.contains(t[0]));
        assert!(state.contains(t[3]));
        assert!(!state.contains(t[2]));
    }

    #[test]
    fn invariant_holds_across_arbitrary_toggle_sequences() {
        let t = ids(5);
        let cat = catalog(&t);
        let mut state = SelectionState::default();

        // Deterministic pseudo-random walk over the catalog.
        let mut seed: u64 = 0x5eed;
        for _ in 0..200 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let pick = t[(seed >> 33) as usize % t.len()];
            state.toggle(&cat, pick).unwrap();
            assert!(state.selected_in_group(1) <= 1);
            assert!(state.selected_in_group(2) <= 1);
        }
    }

    #[test]
    fn ungrouped_types_behave_like_checkboxes() {
        let t = ids(5);
        let cat = catalog(&t);
        let mut state = SelectionState::default();
        state.toggle(&cat, t[3]).unwrap();
        state.toggle(&cat, t[4]).unwrap();
        assert!(state.contains(t[3]) && state.contains(t[4]));
    }

    #[test]
    fn select_all_in_exclusion_group_picks_first_only_when_empty() {
        let t = ids(5);
        let cat = catalog(&t);
        let mut state = SelectionState::default();

        let added = state.select_all_in_group(&cat, 1).unwrap();
        assert_eq!(added, vec![t[0]]);
        assert_eq!(state.selected_in_group(1), 1);

        // Occupied group: no change.
        let added = state.select_all_in_group(&cat, 1).unwrap();
        assert!(added.is_empty());
        assert_eq!(state.selected_ids(), vec![t[0]]);
    }

    #[test]
    fn select_all_standalone_selects_every_member() {
        let t = ids(5);
        let cat = catalog(&t);
        let mut state = SelectionState::default();
        let mut added = state.select_all_standalone(&cat);
        added.sort();
        let mut expected = vec![t[3], t[4]];
        expected.sort();
        assert_eq!(added, expected);
    }

    #[test]
    fn deselect_removes_only_the_named_type() {
        let t = ids(5);
        let cat = catalog(&t);
        let mut state = SelectionState::default();
        state.toggle(&cat, t[0]).unwrap();
        state.toggle(&cat, t[3]).unwrap();

        state.deselect(&cat, t[3]).unwrap();
        assert!(!state.contains(t[3]));
        assert!(state.contains(t[0]));

        // Deselecting an unselected type is a no-op; an unknown one errors.
        state.deselect(&cat, t[4]).unwrap();
        assert_eq!(state.len(), 1);
        let stranger = Uuid::new_v4();
        assert_eq!(
            state.deselect(&cat, stranger).unwrap_err(),
            SelectionError::UnknownType(stranger)
        );
    }

    #[test]
    fn deselect_all_standalone_leaves_grouped_types_alone() {
        let t = ids(5);
        let cat = catalog(&t);
        let mut state = SelectionState::default();
        state.toggle(&cat, t[0]).unwrap();
        state.toggle(&cat, t[3]).unwrap();
        state.toggle(&cat, t[4]).unwrap();

        let mut removed = state.deselect_all_standalone();
        removed.sort();
        let mut expected = vec![t[3], t[4]];
        expected.sort();
        assert_eq!(removed, expected);
        assert_eq!(state.selected_ids(), vec![t[0]]);

        assert!(state.deselect_all_standalone().is_empty());
    }

    #[test]
    fn deselect_all_in_group_empties_the_group() {
        let t = ids(5);
        let cat = catalog(&t);
        let mut state = SelectionState::default();
        state.toggle(&cat, t[1]).unwrap();
        state.toggle(&cat, t[3]).unwrap();

        let removed = state.deselect_all_in_group(&cat, 1).unwrap();
        assert_eq!(removed, vec![t[1]]);
        assert_eq!(state.selected_in_group(1), 0);
        assert!(state.contains(t[3]));
    }

    #[test]
    fn load_normalization_keeps_first_group_member() {
        let t = ids(5);
        let cat = catalog(&t);

        // Persisted state holds both members of group 1 plus a stranger.
        let stranger = Uuid::new_v4();
        let normalized = SelectionState::from_persisted(&cat, &[t[0], t[1], t[3], stranger]);

        assert_eq!(normalized.state.selected_ids().len(), 2);
        assert!(normalized.state.contains(t[0]));
        assert!(!normalized.state.contains(t[1]));
        assert_eq!(normalized.dropped, vec![t[1], stranger]);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let t = ids(5);
        let cat = catalog(&t);
        let mut state = SelectionState::default();
        let stranger = Uuid::new_v4();
        assert_eq!(
            state.toggle(&cat, stranger),
            Err(SelectionError::UnknownType(stranger))
        );
    }

    #[test]
    fn unknown_group_is_rejected() {
        let t = ids(5);
        let cat = catalog(&t);
        let mut state = SelectionState::default();
        assert_eq!(
            state.select_all_in_group(&cat, 9).unwrap_err(),
            SelectionError::UnknownGroup(9)
        );
    }
}
