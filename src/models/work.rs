//! Work tree models
//!
//! Runnable items, the groups that scope their setup/teardown, and the
//! merged tree a run is planned from.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;

/// Dotted identity of an item or group (`pkg.test_math.Arith.adds`)
pub type ItemId = String;

/// Name given to the placeholder item of a suite that failed to load
pub const LOAD_FAILURE_NAME: &str = "<load failure>";

/// Command executed by a case or a fixture
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CaseSpec {
    /// Shell command, run with `sh -c`
    pub run: String,

    /// Watchdog timeout; the command is killed when it expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// A failing command is the expected outcome
    #[serde(default)]
    pub expect_failure: bool,

    /// Skip without running, with this reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<String>,

    /// Extra environment for the command
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl CaseSpec {
    pub fn new(run: impl Into<String>) -> Self {
        Self {
            run: run.into(),
            timeout_secs: None,
            expect_failure: false,
            skip: None,
            env: BTreeMap::new(),
        }
    }

    pub fn expecting_failure(mut self) -> Self {
        self.expect_failure = true;
        self
    }

    pub fn skipped(mut self, reason: impl Into<String>) -> Self {
        self.skip = Some(reason.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// What running an item means
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ItemKind {
    /// A real test case
    Case(CaseSpec),
    /// Stand-in for a suite that could not be loaded
    LoadFailure { message: String },
}

/// Reference to an item as it crosses the process boundary
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemRef {
    pub id: ItemId,
    pub name: String,
    /// Id of the owning group
    pub group: String,
    /// Synthetic entry for a group setup/teardown failure
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fixture: bool,
}

impl ItemRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            group: group.into(),
            fixture: false,
        }
    }

    /// Entry standing for a failed setup or teardown of `group`
    pub fn fixture(group: &str, phase: FixturePhase) -> Self {
        Self {
            id: format!("{group} [{phase}]"),
            name: format!("[{phase}]"),
            group: group.to_string(),
            fixture: true,
        }
    }

    /// Best-effort reference built from a bare id
    pub fn from_id(id: &str) -> Self {
        let (group, name) = id.rsplit_once('.').unwrap_or(("", id));
        Self::new(id, name, group)
    }
}

impl fmt::Display for ItemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Which group fixture ran
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixturePhase {
    Setup,
    Teardown,
}

impl fmt::Display for FixturePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FixturePhase::Setup => write!(f, "setup"),
            FixturePhase::Teardown => write!(f, "teardown"),
        }
    }
}

/// Leaf unit of work
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkItem {
    pub id: ItemId,
    pub name: String,
    pub group: String,
    pub kind: ItemKind,
}

impl WorkItem {
    pub fn item_ref(&self) -> ItemRef {
        ItemRef::new(&self.id, &self.name, &self.group)
    }

    pub fn is_load_failure(&self) -> bool {
        matches!(self.kind, ItemKind::LoadFailure { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupKind {
    /// One suite file
    Module,
    /// A group declared inside a suite
    Group,
}

/// Member of a group, in declaration order
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkNode {
    Item(WorkItem),
    Group(WorkGroup),
}

impl WorkNode {
    pub fn name(&self) -> &str {
        match self {
            WorkNode::Item(item) => &item.name,
            WorkNode::Group(group) => &group.name,
        }
    }
}

/// Ordered items and nested groups sharing one setup/teardown scope
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkGroup {
    pub id: String,
    pub name: String,
    pub kind: GroupKind,
    /// Suite file the group was loaded from
    pub source: PathBuf,
    pub setup: Option<CaseSpec>,
    pub teardown: Option<CaseSpec>,
    pub members: Vec<WorkNode>,
}

impl WorkGroup {
    /// Module group holding a single placeholder for a suite that failed to load
    pub fn load_failure(source: PathBuf, label: &str, message: impl Into<String>) -> Self {
        let item = WorkItem {
            id: format!("{label}.{LOAD_FAILURE_NAME}"),
            name: LOAD_FAILURE_NAME.to_string(),
            group: label.to_string(),
            kind: ItemKind::LoadFailure {
                message: message.into(),
            },
        };
        Self {
            id: label.to_string(),
            name: label.to_string(),
            kind: GroupKind::Module,
            source,
            setup: None,
            teardown: None,
            members: vec![WorkNode::Item(item)],
        }
    }

    pub fn has_fixtures(&self) -> bool {
        self.setup.is_some() || self.teardown.is_some()
    }

    /// All items below this group, depth first in declaration order
    pub fn items(&self) -> Vec<&WorkItem> {
        let mut out = Vec::new();
        self.collect_items(&mut out);
        out
    }

    fn collect_items<'a>(&'a self, out: &mut Vec<&'a WorkItem>) {
        for member in &self.members {
            match member {
                WorkNode::Item(item) => out.push(item),
                WorkNode::Group(group) => group.collect_items(out),
            }
        }
    }

    pub fn item_count(&self) -> usize {
        self.items().len()
    }

    pub fn contains_any(&self, selected: &HashSet<ItemId>) -> bool {
        self.items().iter().any(|item| selected.contains(&item.id))
    }

    /// Resolve a path of member names below this group
    pub fn find(&self, path: &[String]) -> Option<NodeRef<'_>> {
        let Some((first, rest)) = path.split_first() else {
            return Some(NodeRef::Group(self));
        };
        let member = self.members.iter().find(|m| m.name() == first)?;
        match member {
            WorkNode::Item(item) if rest.is_empty() => Some(NodeRef::Item(item)),
            WorkNode::Item(_) => None,
            WorkNode::Group(group) => group.find(rest),
        }
    }

    /// Groups from this one down to (excluding) the node at `path`
    pub fn ancestors(&self, path: &[String]) -> Vec<&WorkGroup> {
        let mut chain = vec![self];
        let mut current = self;
        for name in path.iter().take(path.len().saturating_sub(1)) {
            let next = current.members.iter().find_map(|m| match m {
                WorkNode::Group(g) if &g.name == name => Some(g),
                _ => None,
            });
            match next {
                Some(group) => {
                    chain.push(group);
                    current = group;
                }
                None => break,
            }
        }
        chain
    }

    /// Copy of this group keeping only the branch leading to `path`
    pub fn prune_to(&self, path: &[String]) -> Option<WorkGroup> {
        let Some((first, rest)) = path.split_first() else {
            return Some(self.clone());
        };
        let member = self.members.iter().find(|m| m.name() == first)?;
        let kept = match member {
            WorkNode::Item(item) if rest.is_empty() => WorkNode::Item(item.clone()),
            WorkNode::Item(_) => return None,
            WorkNode::Group(group) => WorkNode::Group(group.prune_to(rest)?),
        };
        Some(WorkGroup {
            members: vec![kept],
            ..self.shallow_clone()
        })
    }

    fn shallow_clone(&self) -> WorkGroup {
        WorkGroup {
            id: self.id.clone(),
            name: self.name.clone(),
            kind: self.kind,
            source: self.source.clone(),
            setup: self.setup.clone(),
            teardown: self.teardown.clone(),
            members: Vec::new(),
        }
    }

    /// Union another copy of the same group into this one
    pub fn absorb(&mut self, other: WorkGroup) {
        for member in other.members {
            match member {
                WorkNode::Item(item) => {
                    let present = self
                        .members
                        .iter()
                        .any(|m| matches!(m, WorkNode::Item(i) if i.id == item.id));
                    if !present {
                        self.members.push(WorkNode::Item(item));
                    }
                }
                WorkNode::Group(group) => {
                    let existing = self.members.iter_mut().find_map(|m| match m {
                        WorkNode::Group(g) if g.id == group.id => Some(g),
                        _ => None,
                    });
                    match existing {
                        Some(existing) => existing.absorb(group),
                        None => self.members.push(WorkNode::Group(group)),
                    }
                }
            }
        }
    }
}

/// Borrowed view of a node found by path
#[derive(Clone, Copy, Debug)]
pub enum NodeRef<'a> {
    Item(&'a WorkItem),
    Group(&'a WorkGroup),
}

/// Everything discovered for a run: one group per suite file
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkTree {
    pub modules: Vec<WorkGroup>,
}

impl WorkTree {
    pub fn new(modules: Vec<WorkGroup>) -> Self {
        Self { modules }
    }

    pub fn is_empty(&self) -> bool {
        self.item_count() == 0
    }

    pub fn item_count(&self) -> usize {
        self.modules.iter().map(WorkGroup::item_count).sum()
    }

    pub fn items(&self) -> Vec<&WorkItem> {
        self.modules.iter().flat_map(|m| m.items()).collect()
    }

    /// Merge another tree, keeping one copy of each module, group and item.
    /// A module whose id is taken by a different suite file is left out and
    /// returned as a collision.
    pub fn merge(&mut self, other: WorkTree) -> Vec<ModuleCollision> {
        let mut collisions = Vec::new();
        for module in other.modules {
            match self.modules.iter_mut().find(|m| m.id == module.id) {
                Some(existing) if existing.source != module.source => {
                    collisions.push(ModuleCollision {
                        id: module.id,
                        kept: existing.source.clone(),
                        rejected: module.source,
                    });
                }
                Some(existing) => existing.absorb(module),
                None => self.modules.push(module),
            }
        }
        collisions
    }
}

/// Two suite files that map to the same module id
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleCollision {
    pub id: String,
    pub kept: PathBuf,
    pub rejected: PathBuf,
}

impl fmt::Display for ModuleCollision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "module {} in {} is already loaded from {}",
            self.id,
            self.rejected.display(),
            self.kept.display()
        )
    }
}

/// Where a worker finds the work of one task
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTarget {
    /// Suite file, absolute
    pub suite: PathBuf,
    /// Module label the suite was discovered under
    pub module: String,
    /// Member names from the module down to the target node
    #[serde(default)]
    pub path: Vec<String>,
}

impl fmt::Display for TaskTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.module)?;
        for part in &self.path {
            write!(f, ".{part}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(group: &str, name: &str) -> WorkNode {
        WorkNode::Item(WorkItem {
            id: format!("{group}.{name}"),
            name: name.to_string(),
            group: group.to_string(),
            kind: ItemKind::Case(CaseSpec::new("true")),
        })
    }

    fn module() -> WorkGroup {
        WorkGroup {
            id: "pkg.test_a".into(),
            name: "pkg.test_a".into(),
            kind: GroupKind::Module,
            source: PathBuf::from("/tmp/pkg/test_a.yaml"),
            setup: None,
            teardown: None,
            members: vec![
                item("pkg.test_a", "one"),
                WorkNode::Group(WorkGroup {
                    id: "pkg.test_a.Inner".into(),
                    name: "Inner".into(),
                    kind: GroupKind::Group,
                    source: PathBuf::from("/tmp/pkg/test_a.yaml"),
                    setup: Some(CaseSpec::new("true")),
                    teardown: None,
                    members: vec![item("pkg.test_a.Inner", "two"), item("pkg.test_a.Inner", "three")],
                }),
            ],
        }
    }

    #[test]
    fn test_items_in_declaration_order() {
        let ids: Vec<_> = module().items().iter().map(|i| i.id.clone()).collect();
        assert_eq!(
            ids,
            vec!["pkg.test_a.one", "pkg.test_a.Inner.two", "pkg.test_a.Inner.three"]
        );
    }

    #[test]
    fn test_find_and_ancestors() {
        let m = module();
        let path = vec!["Inner".to_string(), "two".to_string()];
        assert!(matches!(m.find(&path), Some(NodeRef::Item(i)) if i.name == "two"));
        let chain: Vec<_> = m.ancestors(&path).iter().map(|g| g.id.clone()).collect();
        assert_eq!(chain, vec!["pkg.test_a", "pkg.test_a.Inner"]);
        assert!(m.find(&["missing".to_string()]).is_none());
    }

    #[test]
    fn test_prune_keeps_fixture_chain() {
        let pruned = module()
            .prune_to(&["Inner".to_string(), "three".to_string()])
            .unwrap();
        assert_eq!(pruned.item_count(), 1);
        match &pruned.members[0] {
            WorkNode::Group(g) => assert!(g.setup.is_some()),
            other => panic!("unexpected member {other:?}"),
        }
    }

    #[test]
    fn test_merge_deduplicates() {
        let m = module();
        let left = m.prune_to(&["one".to_string()]).unwrap();
        let right = m.prune_to(&["Inner".to_string()]).unwrap();

        let mut tree = WorkTree::new(vec![left]);
        tree.merge(WorkTree::new(vec![right]));
        tree.merge(WorkTree::new(vec![m.clone()]));

        assert_eq!(tree.modules.len(), 1);
        assert_eq!(tree.item_count(), 3);
    }

    #[test]
    fn test_merge_rejects_same_id_from_other_file() {
        let mut tree = WorkTree::new(vec![module()]);
        let mut other = module();
        other.source = PathBuf::from("/elsewhere/pkg/test_a.yaml");
        other.members.truncate(1);

        let collisions = tree.merge(WorkTree::new(vec![other]));
        assert_eq!(
            collisions,
            vec![ModuleCollision {
                id: "pkg.test_a".into(),
                kept: PathBuf::from("/tmp/pkg/test_a.yaml"),
                rejected: PathBuf::from("/elsewhere/pkg/test_a.yaml"),
            }]
        );
        assert!(collisions[0].to_string().contains("/elsewhere/pkg/test_a.yaml"));
        assert_eq!(tree.modules[0].source, PathBuf::from("/tmp/pkg/test_a.yaml"));
        assert_eq!(tree.item_count(), 3);
    }

    #[test]
    fn test_item_ref_from_id() {
        let r = ItemRef::from_id("pkg.test_a.Inner.two");
        assert_eq!(r.name, "two");
        assert_eq!(r.group, "pkg.test_a.Inner");

        let fixture = ItemRef::fixture("pkg.test_a.Inner", FixturePhase::Setup);
        assert_eq!(fixture.id, "pkg.test_a.Inner [setup]");
        assert!(fixture.fixture);
    }
}
