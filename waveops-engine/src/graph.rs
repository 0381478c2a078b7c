//! Task dependency graph
//!
//! Tasks and their dependency edges form a DAG held as id-keyed node
//! tables with adjacency sets; nodes hold no references to each other.
//! The graph owns:
//! - construction with missing-target and cycle detection
//! - the per-node state machine
//! - completion propagation (newly-eligible computation)
//! - critical-path, level, and blocking-factor analysis

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::{DependencyViolation, WaveError, WaveResult};

fn default_effort() -> f64 {
    1.0
}

/// An atomic unit of work tracked as a forge issue
///
/// Immutable after plan load except for team reassignment by work
/// stealing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Stable identifier
    pub id: String,
    /// Human-readable title
    pub title: String,
    /// Wave the task belongs to, 1-based
    pub wave: u32,
    /// Owning team
    pub team: String,
    /// Ids this task depends on
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Acceptance criteria, not interpreted by the kernel
    #[serde(default)]
    pub acceptance: Vec<String>,
    /// Skills required to pick the task up
    #[serde(default)]
    pub skills: Vec<String>,
    /// Whether the task sits on the delivery-critical path by decree
    #[serde(default)]
    pub critical: bool,
    /// Estimated effort
    #[serde(default = "default_effort")]
    pub effort: f64,
}

/// Node execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Dependencies not yet satisfied, or not yet scheduled
    Waiting,
    /// Eligible to start
    Ready,
    /// Being worked
    InProgress,
    /// Done; terminal
    Completed,
    /// Stuck on an external condition
    Blocked,
    /// Attempted and failed; may be retried via waiting
    Failed,
}

impl TaskState {
    /// Whether the state machine permits `self -> to`
    pub fn can_transition(self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Waiting, Ready)
                | (Waiting, Blocked)
                | (Ready, InProgress)
                | (Ready, Blocked)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Blocked)
                | (Blocked, Waiting)
                | (Failed, Waiting)
        )
    }
}

/// A task wrapped with its graph bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyNode {
    /// The underlying task
    pub task: Task,
    /// Parents: ids this node depends on
    pub depends_on: BTreeSet<String>,
    /// Children: ids depending on this node (derived)
    pub depended_by: BTreeSet<String>,
    /// Current execution state
    pub state: TaskState,
    /// Count of tasks transitively unblocked by this one
    pub blocking_factor: usize,
    /// Set by analysis when the node lies on the longest effort path
    pub critical_path: bool,
}

/// Output of [`DependencyGraph::analyze`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphAnalysis {
    /// One longest path by effort, in dependency order
    pub critical_path: Vec<String>,
    /// Total effort along the critical path
    pub critical_path_effort: f64,
    /// Task ids grouped by topological depth; tasks within one group
    /// have no ordering constraints between them
    pub parallelizable: Vec<Vec<String>>,
    /// (task id, blocking factor) sorted by factor descending
    pub blocking: Vec<(String, usize)>,
}

/// The task DAG
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: BTreeMap<String, DependencyNode>,
}

impl DependencyGraph {
    /// Build a graph from plan tasks
    ///
    /// Wires both edge directions, rejects unknown dependency targets
    /// and cycles, and computes blocking factors. All nodes start in
    /// `waiting`.
    pub fn build(tasks: Vec<Task>) -> WaveResult<Self> {
        let mut nodes: BTreeMap<String, DependencyNode> = BTreeMap::new();

        for task in tasks {
            if task.wave == 0 {
                return Err(WaveError::Configuration(format!(
                    "task {} has wave 0; waves are 1-based",
                    task.id
                )));
            }
            let depends_on: BTreeSet<String> = task.depends_on.iter().cloned().collect();
            if depends_on.contains(&task.id) {
                return Err(DependencyViolation::Cycle {
                    chain: vec![task.id.clone(), task.id.clone()],
                }
                .into());
            }
            let id = task.id.clone();
            let node = DependencyNode {
                task,
                depends_on,
                depended_by: BTreeSet::new(),
                state: TaskState::Waiting,
                blocking_factor: 0,
                critical_path: false,
            };
            if nodes.insert(id.clone(), node).is_some() {
                return Err(WaveError::Configuration(format!("duplicate task id {}", id)));
            }
        }

        // Derive the reverse edges, rejecting unknown targets.
        let edges: Vec<(String, String)> = nodes
            .values()
            .flat_map(|n| {
                n.depends_on
                    .iter()
                    .map(|dep| (n.task.id.clone(), dep.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (dependent, dependency) in edges {
            match nodes.get_mut(&dependency) {
                Some(target) => {
                    target.depended_by.insert(dependent);
                }
                None => {
                    return Err(DependencyViolation::Missing {
                        task: dependent,
                        dependency,
                    }
                    .into())
                }
            }
        }

        let mut graph = Self { nodes };
        if let Some(chain) = graph.find_cycle() {
            return Err(DependencyViolation::Cycle { chain }.into());
        }
        graph.compute_blocking_factors();
        Ok(graph)
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look up a node
    pub fn get(&self, id: &str) -> Option<&DependencyNode> {
        self.nodes.get(id)
    }

    /// Iterate nodes in id order
    pub fn nodes(&self) -> impl Iterator<Item = &DependencyNode> {
        self.nodes.values()
    }

    /// Tasks owned by a team, in id order
    pub fn tasks_for_team(&self, team: &str) -> Vec<&DependencyNode> {
        self.nodes.values().filter(|n| n.task.team == team).collect()
    }

    /// Move a node through the state machine
    pub fn transition(&mut self, id: &str, to: TaskState) -> WaveResult<()> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| WaveError::Internal(format!("unknown task {}", id)))?;
        if !node.state.can_transition(to) {
            return Err(DependencyViolation::IllegalTransition {
                task: id.to_string(),
                from: node.state,
                to,
            }
            .into());
        }
        node.state = to;
        Ok(())
    }

    /// Mark a task completed and return the newly eligible children
    ///
    /// A child is newly eligible when every one of its parents is now
    /// completed; it stays in `waiting` until an external signal moves
    /// it to `ready`, keeping scheduling explicit. Single pass over the
    /// children; grandchildren are untouched.
    pub fn complete(&mut self, id: &str) -> WaveResult<Vec<String>> {
        self.transition(id, TaskState::Completed)?;

        let children: Vec<String> = match self.nodes.get(id) {
            Some(node) => node.depended_by.iter().cloned().collect(),
            None => Vec::new(),
        };

        let mut eligible = Vec::new();
        for child in children {
            let all_parents_done = match self.nodes.get(&child) {
                Some(node) => node
                    .depends_on
                    .iter()
                    .all(|p| self.state_of(p) == Some(TaskState::Completed)),
                None => false,
            };
            if all_parents_done
                && self.state_of(&child) == Some(TaskState::Waiting)
            {
                eligible.push(child);
            }
        }
        Ok(eligible)
    }

    /// Walk a node through the legal states up to completed
    ///
    /// Used when external evidence (a merged, green pull request)
    /// proves a task finished regardless of the state the coordinator
    /// last saw. Every intermediate hop is a legal transition.
    pub fn advance_to_completed(&mut self, id: &str) -> WaveResult<Vec<String>> {
        loop {
            let state = self
                .state_of(id)
                .ok_or_else(|| WaveError::Internal(format!("unknown task {}", id)))?;
            match state {
                TaskState::Completed => return Ok(Vec::new()),
                TaskState::InProgress => return self.complete(id),
                TaskState::Waiting => self.transition(id, TaskState::Ready)?,
                TaskState::Ready => self.transition(id, TaskState::InProgress)?,
                TaskState::Blocked | TaskState::Failed => {
                    self.transition(id, TaskState::Waiting)?
                }
            }
        }
    }

    /// Current state of a node
    pub fn state_of(&self, id: &str) -> Option<TaskState> {
        self.nodes.get(id).map(|n| n.state)
    }

    /// Reassign a task to another team (work stealing only)
    pub fn reassign(&mut self, id: &str, team: &str) -> WaveResult<()> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| WaveError::Internal(format!("unknown task {}", id)))?;
        node.task.team = team.to_string();
        Ok(())
    }

    /// Critical-path, level, and blocking analysis
    ///
    /// Marks `critical_path` on the nodes along one longest effort
    /// path. An empty graph yields an empty analysis.
    pub fn analyze(&mut self) -> GraphAnalysis {
        if self.nodes.is_empty() {
            return GraphAnalysis::default();
        }

        let order = self.topological_order();

        // Topological depth groups: a node sits one level below its
        // deepest parent.
        let mut level: HashMap<String, usize> = HashMap::new();
        for id in &order {
            let depth = self.nodes[id]
                .depends_on
                .iter()
                .filter_map(|p| level.get(p))
                .max()
                .map(|d| d + 1)
                .unwrap_or(0);
            level.insert(id.clone(), depth);
        }
        let max_level = level.values().copied().max().unwrap_or(0);
        let mut parallelizable = vec![Vec::new(); max_level + 1];
        for id in self.nodes.keys() {
            parallelizable[level[id]].push(id.clone());
        }

        // Longest path by effort with predecessor tracking.
        let mut dist: HashMap<String, f64> = HashMap::new();
        let mut pred: HashMap<String, Option<String>> = HashMap::new();
        for id in &order {
            let node = &self.nodes[id];
            let best_parent = node
                .depends_on
                .iter()
                .filter_map(|p| dist.get(p).map(|d| (p.clone(), *d)))
                .max_by(|a, b| a.1.total_cmp(&b.1));
            let base = best_parent.as_ref().map(|(_, d)| *d).unwrap_or(0.0);
            dist.insert(id.clone(), base + node.task.effort);
            pred.insert(id.clone(), best_parent.map(|(p, _)| p));
        }
        let end = dist
            .iter()
            .max_by(|a, b| a.1.total_cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(id, d)| (id.clone(), *d));

        let mut critical_path = Vec::new();
        let mut critical_path_effort = 0.0;
        if let Some((end_id, total)) = end {
            critical_path_effort = total;
            let mut cursor = Some(end_id);
            while let Some(id) = cursor {
                cursor = pred.get(&id).cloned().flatten();
                critical_path.push(id);
            }
            critical_path.reverse();
        }
        let on_path: BTreeSet<&String> = critical_path.iter().collect();
        for (id, node) in self.nodes.iter_mut() {
            node.critical_path = on_path.contains(id);
        }

        let mut blocking: Vec<(String, usize)> = self
            .nodes
            .values()
            .filter(|n| n.blocking_factor > 0)
            .map(|n| (n.task.id.clone(), n.blocking_factor))
            .collect();
        blocking.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        GraphAnalysis {
            critical_path,
            critical_path_effort,
            parallelizable,
            blocking,
        }
    }

    /// Kahn topological order; the graph is acyclic after `build`
    fn topological_order(&self) -> Vec<String> {
        let mut indegree: BTreeMap<&String, usize> = self
            .nodes
            .iter()
            .map(|(id, n)| (id, n.depends_on.len()))
            .collect();
        let mut queue: VecDeque<&String> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(id) = queue.pop_front() {
            order.push(id.clone());
            for child in &self.nodes[id].depended_by {
                if let Some(d) = indegree.get_mut(child) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(child);
                    }
                }
            }
        }
        order
    }

    /// DFS cycle search; returns the offending chain when found
    fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            White,
            Grey,
            Black,
        }

        let mut marks: HashMap<&String, Mark> =
            self.nodes.keys().map(|id| (id, Mark::White)).collect();

        // Iterative DFS over the dependency edges, keeping the grey
        // stack so a back-edge yields the chain.
        for start in self.nodes.keys() {
            if marks[start] != Mark::White {
                continue;
            }
            let mut stack: Vec<&String> = vec![start];
            let mut path: Vec<&String> = Vec::new();

            while let Some(&id) = stack.last() {
                if marks[id] == Mark::White {
                    marks.insert(id, Mark::Grey);
                    path.push(id);
                    for dep in &self.nodes[id].depends_on {
                        match marks[dep] {
                            Mark::Grey => {
                                // Back-edge: the cycle runs from dep
                                // through the grey path back to dep.
                                let from = path.iter().position(|p| *p == dep).unwrap_or(0);
                                let mut chain: Vec<String> =
                                    path[from..].iter().map(|s| (*s).clone()).collect();
                                chain.push(dep.clone());
                                return Some(chain);
                            }
                            Mark::White => stack.push(dep),
                            Mark::Black => {}
                        }
                    }
                } else {
                    stack.pop();
                    if marks[id] == Mark::Grey {
                        marks.insert(id, Mark::Black);
                        path.pop();
                    }
                }
            }
        }
        None
    }

    /// Blocking factor: size of the reverse transitive closure,
    /// excluding the node itself
    fn compute_blocking_factors(&mut self) {
        let ids: Vec<String> = self.nodes.keys().cloned().collect();
        let mut factors: HashMap<String, usize> = HashMap::new();

        for id in &ids {
            let mut seen: BTreeSet<&String> = BTreeSet::new();
            let mut queue: VecDeque<&String> = self.nodes[id].depended_by.iter().collect();
            while let Some(next) = queue.pop_front() {
                if seen.insert(next) {
                    queue.extend(self.nodes[next].depended_by.iter());
                }
            }
            factors.insert(id.clone(), seen.len());
        }

        for (id, factor) in factors {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.blocking_factor = factor;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, team: &str, deps: &[&str]) -> Task {
        Task {
            id: id.to_string(),
            title: format!("task {}", id),
            wave: 1,
            team: team.to_string(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            acceptance: Vec::new(),
            skills: Vec::new(),
            critical: false,
            effort: 1.0,
        }
    }

    fn task_with_effort(id: &str, deps: &[&str], effort: f64) -> Task {
        Task {
            effort,
            ..task(id, "alpha", deps)
        }
    }

    #[test]
    fn build_wires_both_directions() {
        let graph =
            DependencyGraph::build(vec![task("a", "alpha", &[]), task("b", "beta", &["a"])])
                .unwrap();
        assert!(graph.get("a").unwrap().depended_by.contains("b"));
        assert!(graph.get("b").unwrap().depends_on.contains("a"));
        assert_eq!(graph.get("a").unwrap().state, TaskState::Waiting);
    }

    #[test]
    fn missing_dependency_is_rejected() {
        let err = DependencyGraph::build(vec![task("a", "alpha", &["ghost"])]).unwrap_err();
        match err {
            WaveError::Dependency(DependencyViolation::Missing { task, dependency }) => {
                assert_eq!(task, "a");
                assert_eq!(dependency, "ghost");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn cycle_is_rejected_with_chain() {
        let err = DependencyGraph::build(vec![
            task("a", "alpha", &["c"]),
            task("b", "alpha", &["a"]),
            task("c", "alpha", &["b"]),
        ])
        .unwrap_err();
        match err {
            WaveError::Dependency(DependencyViolation::Cycle { chain }) => {
                assert!(chain.len() >= 3);
                assert_eq!(chain.first(), chain.last());
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let err = DependencyGraph::build(vec![task("a", "alpha", &["a"])]).unwrap_err();
        assert!(matches!(
            err,
            WaveError::Dependency(DependencyViolation::Cycle { .. })
        ));
    }

    #[test]
    fn transition_legality_matrix() {
        use TaskState::*;
        let all = [Waiting, Ready, InProgress, Completed, Blocked, Failed];
        let legal = [
            (Waiting, Ready),
            (Waiting, Blocked),
            (Ready, InProgress),
            (Ready, Blocked),
            (InProgress, Completed),
            (InProgress, Failed),
            (InProgress, Blocked),
            (Blocked, Waiting),
            (Failed, Waiting),
        ];
        for from in all {
            for to in all {
                let expected = legal.contains(&(from, to));
                assert_eq!(
                    from.can_transition(to),
                    expected,
                    "{:?} -> {:?}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn illegal_transition_is_typed() {
        let mut graph = DependencyGraph::build(vec![task("a", "alpha", &[])]).unwrap();
        let err = graph.transition("a", TaskState::Completed).unwrap_err();
        assert!(matches!(
            err,
            WaveError::Dependency(DependencyViolation::IllegalTransition { .. })
        ));
    }

    #[test]
    fn completed_is_terminal() {
        let mut graph = DependencyGraph::build(vec![task("a", "alpha", &[])]).unwrap();
        graph.advance_to_completed("a").unwrap();
        for to in [
            TaskState::Waiting,
            TaskState::Ready,
            TaskState::InProgress,
            TaskState::Blocked,
            TaskState::Failed,
        ] {
            assert!(graph.transition("a", to).is_err());
        }
    }

    #[test]
    fn diamond_propagation() {
        // a -> {b, c} -> d
        let mut graph = DependencyGraph::build(vec![
            task("a", "alpha", &[]),
            task("b", "alpha", &["a"]),
            task("c", "beta", &["a"]),
            task("d", "beta", &["b", "c"]),
        ])
        .unwrap();

        let eligible = graph.advance_to_completed("a").unwrap();
        assert_eq!(eligible, vec!["b".to_string(), "c".to_string()]);

        // Only one arm done: d must not be eligible.
        let eligible = graph.advance_to_completed("b").unwrap();
        assert!(eligible.is_empty());

        let eligible = graph.advance_to_completed("c").unwrap();
        assert_eq!(eligible, vec!["d".to_string()]);
        // Propagation never auto-starts the child.
        assert_eq!(graph.state_of("d"), Some(TaskState::Waiting));
    }

    #[test]
    fn blocking_factors_count_transitive_dependents() {
        let graph = DependencyGraph::build(vec![
            task("a", "alpha", &[]),
            task("b", "alpha", &["a"]),
            task("c", "alpha", &["b"]),
        ])
        .unwrap();
        assert_eq!(graph.get("a").unwrap().blocking_factor, 2);
        assert_eq!(graph.get("b").unwrap().blocking_factor, 1);
        assert_eq!(graph.get("c").unwrap().blocking_factor, 0);
    }

    #[test]
    fn analysis_finds_longest_effort_path() {
        let mut graph = DependencyGraph::build(vec![
            task_with_effort("a", &[], 1.0),
            task_with_effort("b", &["a"], 5.0),
            task_with_effort("c", &["a"], 1.0),
            task_with_effort("d", &["b", "c"], 1.0),
        ])
        .unwrap();
        let analysis = graph.analyze();
        assert_eq!(analysis.critical_path, vec!["a", "b", "d"]);
        assert!((analysis.critical_path_effort - 7.0).abs() < f64::EPSILON);
        assert!(graph.get("b").unwrap().critical_path);
        assert!(!graph.get("c").unwrap().critical_path);
    }

    #[test]
    fn analysis_groups_by_topological_depth() {
        let mut graph = DependencyGraph::build(vec![
            task("a", "alpha", &[]),
            task("b", "alpha", &["a"]),
            task("c", "beta", &["a"]),
            task("d", "beta", &["b", "c"]),
        ])
        .unwrap();
        let analysis = graph.analyze();
        assert_eq!(analysis.parallelizable.len(), 3);
        assert_eq!(analysis.parallelizable[0], vec!["a"]);
        assert_eq!(analysis.parallelizable[1], vec!["b", "c"]);
        assert_eq!(analysis.parallelizable[2], vec!["d"]);
        assert_eq!(analysis.blocking[0], ("a".to_string(), 3));
    }

    #[test]
    fn empty_graph_yields_empty_analysis() {
        let mut graph = DependencyGraph::build(Vec::new()).unwrap();
        assert_eq!(graph.analyze(), GraphAnalysis::default());
    }

    #[test]
    fn reassign_moves_ownership() {
        let mut graph = DependencyGraph::build(vec![task("a", "alpha", &[])]).unwrap();
        graph.reassign("a", "gamma").unwrap();
        assert_eq!(graph.get("a").unwrap().task.team, "gamma");
        assert_eq!(graph.tasks_for_team("alpha").len(), 0);
        assert_eq!(graph.tasks_for_team("gamma").len(), 1);
    }
}
