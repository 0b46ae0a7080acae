//! Stage dependency graph.
//!
//! An edge `A → B` means "B depends on A": A must be terminal before B may
//! start. Cycles are rejected when the edge is inserted. Ordering uses Kahn's
//! algorithm over `BTreeMap`s so every traversal is deterministic.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::graph::error::{GraphError, GraphResult};
use crate::graph::stage::{StageId, StageKind, StageSpec};

/// Directed acyclic graph of [`StageSpec`]s.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    stages: BTreeMap<StageId, StageSpec>,
    /// `dependency → {dependent, ...}`
    downstream: BTreeMap<StageId, BTreeSet<StageId>>,
    /// `dependent → {dependency, ...}`
    upstream: BTreeMap<StageId, BTreeSet<StageId>>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stage. Ids must be unique.
    pub fn add_stage(&mut self, spec: StageSpec) -> GraphResult<()> {
        if self.stages.contains_key(&spec.id) {
            return Err(GraphError::DuplicateStage {
                stage: spec.id.to_string(),
            });
        }
        let id = spec.id.clone();
        self.stages.insert(id.clone(), spec);
        self.downstream.entry(id.clone()).or_default();
        self.upstream.entry(id).or_default();
        Ok(())
    }

    /// Add an edge: `dependent` waits for `dependency`.
    ///
    /// Returns [`GraphError::DependencyCycle`] (and leaves the graph unchanged)
    /// if the edge would close a cycle.
    pub fn add_dependency(&mut self, dependency: &StageId, dependent: &StageId) -> GraphResult<()> {
        for id in [dependency, dependent] {
            if !self.stages.contains_key(id) {
                return Err(GraphError::StageNotFound {
                    stage: id.to_string(),
                });
            }
        }
        if dependency == dependent {
            return Err(GraphError::DependencyCycle {
                stages: vec![dependency.to_string()],
            });
        }

        self.downstream
            .entry(dependency.clone())
            .or_default()
            .insert(dependent.clone());
        self.upstream
            .entry(dependent.clone())
            .or_default()
            .insert(dependency.clone());

        if let Some(cycle) = self.find_cycle_through(dependent) {
            if let Some(set) = self.downstream.get_mut(dependency) {
                set.remove(dependent);
            }
            if let Some(set) = self.upstream.get_mut(dependent) {
                set.remove(dependency);
            }
            return Err(GraphError::DependencyCycle { stages: cycle });
        }
        Ok(())
    }

    pub fn stage(&self, id: &StageId) -> Option<&StageSpec> {
        self.stages.get(id)
    }

    /// All stages in id order.
    pub fn stages(&self) -> impl Iterator<Item = &StageSpec> {
        self.stages.values()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// First stage of the given kind, in id order.
    pub fn stage_of_kind(&self, kind: StageKind) -> Option<&StageSpec> {
        self.stages.values().find(|s| s.kind == kind)
    }

    /// Direct dependencies of `id`.
    pub fn dependencies_of(&self, id: &StageId) -> GraphResult<&BTreeSet<StageId>> {
        self.upstream.get(id).ok_or_else(|| GraphError::StageNotFound {
            stage: id.to_string(),
        })
    }

    /// Direct dependents of `id`.
    pub fn dependents_of(&self, id: &StageId) -> GraphResult<&BTreeSet<StageId>> {
        self.downstream
            .get(id)
            .ok_or_else(|| GraphError::StageNotFound {
                stage: id.to_string(),
            })
    }

    /// Every stage reachable downstream of `id` (BFS), excluding `id`.
    pub fn transitive_dependents_of(&self, id: &StageId) -> GraphResult<BTreeSet<StageId>> {
        self.walk(id, &self.downstream)
    }

    /// Every stage `id` transitively waits for, excluding `id`.
    pub fn transitive_dependencies_of(&self, id: &StageId) -> GraphResult<BTreeSet<StageId>> {
        self.walk(id, &self.upstream)
    }

    /// Stages with no dependencies.
    pub fn roots(&self) -> Vec<&StageSpec> {
        self.stages
            .values()
            .filter(|s| self.upstream.get(&s.id).map_or(true, BTreeSet::is_empty))
            .collect()
    }

    /// Stages nothing depends on.
    pub fn terminals(&self) -> Vec<&StageSpec> {
        self.stages
            .values()
            .filter(|s| self.downstream.get(&s.id).map_or(true, BTreeSet::is_empty))
            .collect()
    }

    /// Stages grouped by Kahn wave: every stage in a level depends only on
    /// stages from earlier levels, so a level's members can run concurrently.
    pub fn levels(&self) -> GraphResult<Vec<Vec<&StageSpec>>> {
        let mut in_degree: BTreeMap<&StageId, usize> = self
            .stages
            .keys()
            .map(|id| (id, self.upstream.get(id).map_or(0, BTreeSet::len)))
            .collect();

        let mut current: Vec<&StageId> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&id, _)| id)
            .collect();

        let mut levels = Vec::new();
        let mut visited = 0usize;

        while !current.is_empty() {
            visited += current.len();
            let mut next: BTreeSet<&StageId> = BTreeSet::new();
            for id in &current {
                if let Some(dependents) = self.downstream.get(*id) {
                    for dep in dependents {
                        if let Some(deg) = in_degree.get_mut(dep) {
                            *deg -= 1;
                            if *deg == 0 {
                                next.insert(dep);
                            }
                        }
                    }
                }
            }
            levels.push(
                current
                    .iter()
                    .filter_map(|id| self.stages.get(*id))
                    .collect(),
            );
            current = next.into_iter().collect();
        }

        if visited != self.stages.len() {
            return Err(GraphError::DependencyCycle {
                stages: self.stages.keys().map(StageId::to_string).collect(),
            });
        }
        Ok(levels)
    }

    /// Stages in topological order (dependencies first, ties by id).
    pub fn topological_order(&self) -> GraphResult<Vec<&StageSpec>> {
        Ok(self.levels()?.into_iter().flatten().collect())
    }

    /// Check the structural invariants of a review graph:
    /// one `fetch_metadata` root, one terminal, one consolidate stage that
    /// every analysis stage feeds, and a post stage (if any) hanging off
    /// consolidate only.
    pub fn validate(&self) -> GraphResult<()> {
        if self.stages.is_empty() {
            return Err(shape("graph has no stages"));
        }
        self.levels()?;

        let roots = self.roots();
        if roots.len() != 1 {
            return Err(shape(format!(
                "expected exactly one root, found {}",
                roots.len()
            )));
        }
        if roots[0].kind != StageKind::FetchMetadata {
            return Err(shape(format!(
                "root must be fetch_metadata, found {}",
                roots[0].kind
            )));
        }

        let terminals = self.terminals();
        if terminals.len() != 1 {
            return Err(shape(format!(
                "expected exactly one terminal stage, found {}",
                terminals.len()
            )));
        }

        let consolidates: Vec<&StageSpec> = self
            .stages
            .values()
            .filter(|s| s.kind == StageKind::Consolidate)
            .collect();
        if consolidates.len() != 1 {
            return Err(shape(format!(
                "expected exactly one consolidate stage, found {}",
                consolidates.len()
            )));
        }
        let consolidate = consolidates[0];
        let feeding = self.transitive_dependencies_of(&consolidate.id)?;

        for spec in self.stages.values() {
            if spec.kind.is_analysis() && !feeding.contains(&spec.id) {
                return Err(shape(format!(
                    "analysis stage {} does not feed consolidate",
                    spec.id
                )));
            }
            if spec.kind == StageKind::PostComments {
                let deps = self.dependencies_of(&spec.id)?;
                if deps.len() != 1 || !deps.contains(&consolidate.id) {
                    return Err(shape("post_comments must depend only on consolidate"));
                }
            }
            if spec.kind == StageKind::FetchMetadata && spec.id != roots[0].id {
                return Err(shape("fetch_metadata may only appear as the root"));
            }
        }
        Ok(())
    }

    fn walk(
        &self,
        id: &StageId,
        edges: &BTreeMap<StageId, BTreeSet<StageId>>,
    ) -> GraphResult<BTreeSet<StageId>> {
        if !self.stages.contains_key(id) {
            return Err(GraphError::StageNotFound {
                stage: id.to_string(),
            });
        }
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::from([id.clone()]);
        while let Some(current) = queue.pop_front() {
            if let Some(next) = edges.get(&current) {
                for n in next {
                    if visited.insert(n.clone()) {
                        queue.push_back(n.clone());
                    }
                }
            }
        }
        Ok(visited)
    }

    fn find_cycle_through(&self, start: &StageId) -> Option<Vec<String>> {
        let mut visited = BTreeSet::new();
        let mut path = Vec::new();
        if self.dfs_cycle(start, &mut visited, &mut path) {
            Some(path.iter().map(StageId::to_string).collect())
        } else {
            None
        }
    }

    fn dfs_cycle(
        &self,
        node: &StageId,
        visited: &mut BTreeSet<StageId>,
        path: &mut Vec<StageId>,
    ) -> bool {
        if path.contains(node) {
            path.push(node.clone());
            return true;
        }
        if !visited.insert(node.clone()) {
            return false;
        }
        path.push(node.clone());
        if let Some(dependents) = self.downstream.get(node) {
            for dep in dependents {
                if self.dfs_cycle(dep, visited, path) {
                    return true;
                }
            }
        }
        path.pop();
        false
    }
}

fn shape(reason: impl Into<String>) -> GraphError {
    GraphError::InvalidShape {
        reason: reason.into(),
    }
}
