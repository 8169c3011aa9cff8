//! Task planning
//!
//! Turns a discovered tree into pool tasks. A group with a setup or teardown
//! becomes a single task so its fixtures run once per run; everything else
//! is split into one task per item to spread across workers.

use glob::{Pattern, PatternError};

use crate::models::{ItemRef, TaskTarget, WorkGroup, WorkItem, WorkNode, WorkTree};

/// Item-id filter given with `-k`
#[derive(Clone, Debug)]
pub struct NameFilter {
    raw: String,
    pattern: Pattern,
}

impl NameFilter {
    /// A pattern without wildcards matches as a substring
    pub fn new(raw: &str) -> Result<Self, PatternError> {
        let wildcard = raw.contains(['*', '?', '[']);
        let pattern = if wildcard {
            Pattern::new(raw)?
        } else {
            Pattern::new(&format!("*{}*", Pattern::escape(raw)))?
        };
        Ok(Self {
            raw: raw.to_string(),
            pattern,
        })
    }

    pub fn matches(&self, id: &str) -> bool {
        self.pattern.matches(id)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// One unit to submit to the pool
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedTask {
    pub target: TaskTarget,
    pub items: Vec<ItemRef>,
}

pub fn plan_tasks(tree: &WorkTree, filter: Option<&NameFilter>) -> Vec<PlannedTask> {
    let mut planner = Planner {
        filter,
        tasks: Vec::new(),
    };
    for module in &tree.modules {
        planner.group(module, module, &mut Vec::new());
    }
    planner.tasks
}

/// Total items across planned tasks
pub fn planned_items(tasks: &[PlannedTask]) -> usize {
    tasks.iter().map(|task| task.items.len()).sum()
}

struct Planner<'f> {
    filter: Option<&'f NameFilter>,
    tasks: Vec<PlannedTask>,
}

impl Planner<'_> {
    fn selected(&self, item: &WorkItem) -> bool {
        item.is_load_failure() || self.filter.map_or(true, |f| f.matches(&item.id))
    }

    fn group(&mut self, module: &WorkGroup, group: &WorkGroup, path: &mut Vec<String>) {
        if group.has_fixtures() {
            let items: Vec<ItemRef> = group
                .items()
                .into_iter()
                .filter(|item| self.selected(item))
                .map(WorkItem::item_ref)
                .collect();
            if !items.is_empty() {
                self.push(module, path.clone(), items);
            }
            return;
        }

        for member in &group.members {
            match member {
                WorkNode::Item(item) if self.selected(item) => {
                    let mut item_path = path.clone();
                    item_path.push(item.name.clone());
                    self.push(module, item_path, vec![item.item_ref()]);
                }
                WorkNode::Item(_) => {}
                WorkNode::Group(inner) => {
                    path.push(inner.name.clone());
                    self.group(module, inner, path);
                    path.pop();
                }
            }
        }
    }

    fn push(&mut self, module: &WorkGroup, path: Vec<String>, items: Vec<ItemRef>) {
        self.tasks.push(PlannedTask {
            target: TaskTarget {
                suite: module.source.clone(),
                module: module.id.clone(),
                path,
            },
            items,
        });
    }
}
