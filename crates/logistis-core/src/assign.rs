use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::selection::{SelectionError, SelectionState, TypeCatalog};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssignMode {
    Add,
    Replace,
}

impl AssignMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignMode::Add => "add",
            AssignMode::Replace => "replace",
        }
    }

    pub fn parse(value: &str) -> Result<Self, AssignmentError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "add" => Ok(AssignMode::Add),
            "replace" => Ok(AssignMode::Replace),
            other => Err(AssignmentError::UnknownMode(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AssignmentError {
    #[error("no clients selected")]
    NoClients,
    #[error("select at least one obligation type or profile")]
    NoTypesOrProfiles,
    #[error("unsupported mode: {0}")]
    UnknownMode(String),
    #[error(transparent)]
    Selection(#[from] SelectionError),
}

#[derive(Debug, Clone)]
pub struct ClientPlan {
    pub client_id: Uuid,
    pub final_ids: Vec<Uuid>,
    pub added: Vec<Uuid>,
    pub removed: Vec<Uuid>,
}

#[derive(Debug, Clone)]
pub struct BulkPlan {
    pub clients: Vec<ClientPlan>,
    pub selections_created: u64,
    pub selections_removed: u64,
}

impl BulkPlan {
    pub fn clients_processed(&self) -> u64 {
        self.clients.len() as u64
    }
}

/// Compute the per-client outcome of a bulk assignment without touching
/// storage. `requested_type_ids` and `profile_expanded_ids` are merged and
/// deduplicated in request order.
///
/// `add` selects each requested type into the client's existing set; a
/// requested type displaces the current occupant of its exclusion group,
/// the same way an interactive toggle does. `replace` rebuilds the set from
/// the request alone, keep-first within each group.
pub fn plan_bulk_assignment(
    mode: AssignMode,
    requested_type_ids: &[Uuid],
    profile_expanded_ids: &[Uuid],
    existing: &[(Uuid, Vec<Uuid>)],
    catalog: &TypeCatalog,
) -> Result<BulkPlan, AssignmentError> {
    if existing.is_empty() {
        return Err(AssignmentError::NoClients);
    }

    let mut requested: Vec<Uuid> = Vec::new();
    for &id in requested_type_ids.iter().chain(profile_expanded_ids) {
        if !requested.contains(&id) {
            requested.push(id);
        }
    }
    if requested.is_empty() {
        return Err(AssignmentError::NoTypesOrProfiles);
    }
    for &id in &requested {
        if !catalog.contains(id) {
            return Err(SelectionError::UnknownType(id).into());
        }
    }

    let mut clients = Vec::with_capacity(existing.len());
    let mut selections_created = 0u64;
    let mut selections_removed = 0u64;

    for (client_id, current_ids) in existing {
        let current = SelectionState::from_persisted(catalog, current_ids).state;

        let next = match mode {
            AssignMode::Add => {
                let mut state = current.clone();
                for &id in &requested {
                    state.select(catalog, id)?;
                }
                state
            }
            AssignMode::Replace => SelectionState::from_persisted(catalog, &requested).state,
        };

        let added: Vec<Uuid> = next
            .selected_ids()
            .into_iter()
            .filter(|&id| !current.contains(id))
            .collect();
        let removed: Vec<Uuid> = current
            .selected_ids()
            .into_iter()
            .filter(|&id| !next.contains(id))
            .collect();

        selections_created += added.len() as u64;
        selections_removed += removed.len() as u64;
        clients.push(ClientPlan {
            client_id: *client_id,
            final_ids: next.selected_ids(),
            added,
            removed,
        });
    }

    Ok(BulkPlan {
        clients,
        selections_created,
        selections_removed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    fn flat_catalog(t: &[Uuid]) -> TypeCatalog {
        TypeCatalog::new(t.iter().map(|&id| (id, None)))
    }

    #[test]
    fn replace_yields_exactly_the_requested_set() {
        let t = ids(4);
        let cat = flat_catalog(&t);
        let client_a = Uuid::new_v4();
        let client_b = Uuid::new_v4();
        let existing = vec![
            (client_a, vec![t[2], t[3]]),
            (client_b, Vec::new()),
        ];

        let plan =
            plan_bulk_assignment(AssignMode::Replace, &[t[0], t[1]], &[], &existing, &cat).unwrap();

        let mut expected = vec![t[0], t[1]];
        expected.sort();
        for client in &plan.clients {
            assert_eq!(client.final_ids, expected);
        }
        assert_eq!(plan.clients_processed(), 2);
    }

    #[test]
    fn add_unions_without_duplicates() {
        let t = ids(2);
        let cat = flat_catalog(&t);
        let client = Uuid::new_v4();
        let existing = vec![(client, vec![t[0]])];

        let plan = plan_bulk_assignment(AssignMode::Add, &[t[1]], &[], &existing, &cat).unwrap();

        let mut expected = vec![t[0], t[1]];
        expected.sort();
        assert_eq!(plan.clients[0].final_ids, expected);
        assert_eq!(plan.selections_created, 1);
        assert_eq!(plan.selections_removed, 0);
    }

    #[test]
    fn add_of_an_already_assigned_type_changes_nothing() {
        let t = ids(1);
        let cat = flat_catalog(&t);
        let existing = vec![(Uuid::new_v4(), vec![t[0]])];

        let plan = plan_bulk_assignment(AssignMode::Add, &[t[0]], &[], &existing, &cat).unwrap();
        assert_eq!(plan.selections_created, 0);
        assert_eq!(plan.clients[0].final_ids, vec![t[0]]);
    }

    #[test]
    fn add_respects_exclusion_groups() {
        let t = ids(2);
        let cat = TypeCatalog::new([(t[0], Some(7)), (t[1], Some(7))]);
        let existing = vec![(Uuid::new_v4(), vec![t[0]])];

        let plan = plan_bulk_assignment(AssignMode::Add, &[t[1]], &[], &existing, &cat).unwrap();
        assert_eq!(plan.clients[0].final_ids, vec![t[1]]);
        assert_eq!(plan.clients[0].removed, vec![t[0]]);
    }

    #[test]
    fn profile_expansion_merges_with_explicit_types() {
        let t = ids(3);
        let cat = flat_catalog(&t);
        let existing = vec![(Uuid::new_v4(), Vec::new())];

        let plan = plan_bulk_assignment(
            AssignMode::Add,
            &[t[0]],
            &[t[1], t[0], t[2]],
            &existing,
            &cat,
        )
        .unwrap();
        assert_eq!(plan.selections_created, 3);
    }

    #[test]
    fn empty_request_is_rejected_before_any_plan_is_made() {
        let t = ids(1);
        let cat = flat_catalog(&t);
        let existing = vec![(Uuid::new_v4(), vec![t[0]])];

        let err = plan_bulk_assignment(AssignMode::Add, &[], &[], &existing, &cat).unwrap_err();
        assert_eq!(err, AssignmentError::NoTypesOrProfiles);
    }

    #[test]
    fn empty_client_list_is_rejected() {
        let t = ids(1);
        let cat = flat_catalog(&t);
        let err = plan_bulk_assignment(AssignMode::Add, &[t[0]], &[], &[], &cat).unwrap_err();
        assert_eq!(err, AssignmentError::NoClients);
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!(AssignMode::parse("ADD").unwrap(), AssignMode::Add);
        assert_eq!(AssignMode::parse(" replace ").unwrap(), AssignMode::Replace);
        assert!(matches!(
            AssignMode::parse("merge"),
            Err(AssignmentError::UnknownMode(_))
        ));
    }
}
