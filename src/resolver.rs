//! Dependency resolution
//!
//! Orders every migration from every sequence into one global application order.
//! Edges run from a dependency to its dependent. Among migrations whose
//! dependencies are all satisfied, the one from the earliest sequence wins, then
//! the one declared first, so the same input always yields the same order.

use petgraph::algo::kosaraju_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use tracing::debug;

use crate::error::{Result, SchemaError};
use crate::migration::{Migration, MigrationScope, MigrationSequence};
use crate::version::MigrationId;

/// Migrations in application order
#[derive(Debug, Clone, Default)]
pub struct ResolvedMigrations {
    order: Vec<Migration>,
    positions: HashMap<MigrationId, usize>,
}

/// Resolve sequences into a single deterministic order
///
/// Fails on malformed or duplicate ids, on dependencies that name a migration
/// absent from `sequences`, and on dependency cycles.
pub fn resolve(sequences: &[MigrationSequence]) -> Result<ResolvedMigrations> {
    let mut seen_sequences = HashSet::new();
    for sequence in sequences {
        if !seen_sequences.insert(sequence.id.as_str()) {
            return Err(SchemaError::DuplicateSequence(sequence.id.clone()));
        }
    }

    // Flattened in (sequence, declaration) order, which doubles as tiebreak priority
    let mut flat: Vec<Migration> = Vec::new();
    let mut flat_index: HashMap<MigrationId, usize> = HashMap::new();
    for sequence in sequences {
        for migration in sequence.expanded() {
            let id = migration.id().clone();
            id.validate()?;
            if id.namespace() != sequence.id {
                return Err(SchemaError::NamespaceMismatch {
                    sequence: sequence.id.clone(),
                    id,
                });
            }
            if flat_index.insert(id.clone(), flat.len()).is_some() {
                return Err(SchemaError::DuplicateMigrationId(id));
            }
            flat.push(migration);
        }
    }

    let mut graph: DiGraph<usize, ()> = DiGraph::with_capacity(flat.len(), flat.len());
    let nodes: Vec<NodeIndex> = (0..flat.len()).map(|i| graph.add_node(i)).collect();

    for (i, migration) in flat.iter().enumerate() {
        for dep in migration.depends_on() {
            let &d = flat_index
                .get(dep)
                .ok_or_else(|| SchemaError::UnknownMigrationTarget {
                    id: migration.id().clone(),
                    missing: dep.clone(),
                })?;
            graph.update_edge(nodes[d], nodes[i], ());
        }
    }

    let mut in_degree: Vec<usize> = nodes
        .iter()
        .map(|&n| graph.neighbors_directed(n, Direction::Incoming).count())
        .collect();

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, deg)| **deg == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut sorted = Vec::with_capacity(flat.len());
    while let Some(Reverse(i)) = ready.pop() {
        sorted.push(i);
        for next in graph.neighbors_directed(nodes[i], Direction::Outgoing) {
            let j = graph[next];
            in_degree[j] -= 1;
            if in_degree[j] == 0 {
                ready.push(Reverse(j));
            }
        }
    }

    if sorted.len() < flat.len() {
        return Err(SchemaError::CyclicDependency {
            members: find_cycle(&graph, &flat),
        });
    }

    let mut slots: Vec<Option<Migration>> = flat.into_iter().map(Some).collect();
    let order: Vec<Migration> = sorted.into_iter().filter_map(|i| slots[i].take()).collect();
    let positions = order
        .iter()
        .enumerate()
        .map(|(pos, m)| (m.id().clone(), pos))
        .collect();

    debug!(
        sequences = sequences.len(),
        migrations = order.len(),
        "resolved migration order"
    );

    Ok(ResolvedMigrations { order, positions })
}

/// Members of the cycle containing the lowest-priority stuck migration
fn find_cycle(graph: &DiGraph<usize, ()>, flat: &[Migration]) -> Vec<MigrationId> {
    let mut cycles: Vec<Vec<usize>> = kosaraju_scc(graph)
        .into_iter()
        .filter(|component| {
            component.len() > 1 || graph.contains_edge(component[0], component[0])
        })
        .map(|component| {
            let mut members: Vec<usize> = component.into_iter().map(|n| graph[n]).collect();
            members.sort_unstable();
            members
        })
        .collect();
    cycles.sort();

    cycles
        .into_iter()
        .next()
        .unwrap_or_default()
        .into_iter()
        .map(|i| flat[i].id().clone())
        .collect()
}

impl ResolvedMigrations {
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Migrations in application order
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Migration> {
        self.order.iter()
    }

    /// Ids in application order
    pub fn ids(&self) -> Vec<MigrationId> {
        self.order.iter().map(|m| m.id().clone()).collect()
    }

    pub fn get(&self, id: &MigrationId) -> Option<&Migration> {
        self.positions.get(id).map(|&pos| &self.order[pos])
    }

    pub fn contains(&self, id: &MigrationId) -> bool {
        self.positions.contains_key(id)
    }

    /// Index of `id` in application order
    pub fn position(&self, id: &MigrationId) -> Option<usize> {
        self.positions.get(id).copied()
    }

    /// `roots` plus everything they transitively depend on
    pub fn dependency_closure<'a, I>(&self, roots: I) -> HashSet<MigrationId>
    where
        I: IntoIterator<Item = &'a MigrationId>,
    {
        let mut closure = HashSet::new();
        let mut stack: Vec<&MigrationId> = roots.into_iter().collect();
        while let Some(id) = stack.pop() {
            if !closure.insert(id.clone()) {
                continue;
            }
            if let Some(migration) = self.get(id) {
                stack.extend(migration.depends_on());
            }
        }
        closure
    }

    /// First applied migration whose dependency is not applied, if any
    ///
    /// Legacy migrations are exempt: current-format data counts them as applied
    /// without ever having run them or their dependencies.
    pub fn find_unmet_dependency(
        &self,
        applied: &HashSet<MigrationId>,
    ) -> Option<(MigrationId, MigrationId)> {
        self.order
            .iter()
            .filter(|m| m.scope() != MigrationScope::Legacy && applied.contains(m.id()))
            .find_map(|m| {
                m.depends_on()
                    .iter()
                    .find(|dep| !applied.contains(*dep))
                    .map(|dep| (m.id().clone(), dep.clone()))
            })
    }
}
