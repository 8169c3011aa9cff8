//! Suite file format
//!
//! A suite file is a YAML document describing one module-level group: its
//! fixtures, its cases and its nested groups.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::models::{CaseSpec, GroupKind, ItemKind, WorkGroup, WorkItem, WorkNode};

/// Loader failures: the suite exists but cannot be turned into work
#[derive(Debug, Error)]
pub enum SuiteError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid suite {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid name '{name}' in {}: {reason}", path.display())]
    InvalidName {
        path: PathBuf,
        name: String,
        reason: &'static str,
    },

    #[error("duplicate name '{name}' in group '{group}' of {}", path.display())]
    DuplicateName {
        path: PathBuf,
        group: String,
        name: String,
    },
}

/// Top level of a suite file
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SuiteFile {
    /// Command run once before anything in the file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup: Option<String>,

    /// Command run once after everything in the file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teardown: Option<String>,

    #[serde(default)]
    pub cases: Vec<CaseDef>,

    #[serde(default)]
    pub groups: Vec<GroupDef>,
}

/// Nested group sharing a setup/teardown scope
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct GroupDef {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teardown: Option<String>,

    #[serde(default)]
    pub cases: Vec<CaseDef>,

    #[serde(default)]
    pub groups: Vec<GroupDef>,
}

/// A single test case
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct CaseDef {
    pub name: String,

    #[serde(flatten)]
    pub spec: CaseSpec,
}

impl SuiteFile {
    pub fn parse(path: &Path, content: &str) -> Result<Self, SuiteError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|source| SuiteError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Build the module group for this file under `label`
    pub fn into_group(self, path: &Path, label: &str) -> Result<WorkGroup, SuiteError> {
        let members = build_members(path, label, self.cases, self.groups)?;
        Ok(WorkGroup {
            id: label.to_string(),
            name: label.to_string(),
            kind: GroupKind::Module,
            source: path.to_path_buf(),
            setup: self.setup.map(CaseSpec::new),
            teardown: self.teardown.map(CaseSpec::new),
            members,
        })
    }
}

/// Read and build a suite file
pub fn load_suite(path: &Path, label: &str) -> Result<WorkGroup, SuiteError> {
    let content = std::fs::read_to_string(path).map_err(|source| SuiteError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    SuiteFile::parse(path, &content)?.into_group(path, label)
}

/// JSON schema of the suite format
pub fn suite_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(SuiteFile)
}

fn build_members(
    path: &Path,
    parent: &str,
    cases: Vec<CaseDef>,
    groups: Vec<GroupDef>,
) -> Result<Vec<WorkNode>, SuiteError> {
    let mut seen = HashSet::new();
    let mut members = Vec::with_capacity(cases.len() + groups.len());

    for case in cases {
        check_name(path, parent, &case.name, &mut seen)?;
        members.push(WorkNode::Item(WorkItem {
            id: format!("{parent}.{}", case.name),
            name: case.name,
            group: parent.to_string(),
            kind: ItemKind::Case(case.spec),
        }));
    }

    for group in groups {
        check_name(path, parent, &group.name, &mut seen)?;
        let id = format!("{parent}.{}", group.name);
        let nested = build_members(path, &id, group.cases, group.groups)?;
        members.push(WorkNode::Group(WorkGroup {
            id,
            name: group.name,
            kind: GroupKind::Group,
            source: path.to_path_buf(),
            setup: group.setup.map(CaseSpec::new),
            teardown: group.teardown.map(CaseSpec::new),
            members: nested,
        }));
    }

    Ok(members)
}

fn check_name(
    path: &Path,
    parent: &str,
    name: &str,
    seen: &mut HashSet<String>,
) -> Result<(), SuiteError> {
    let invalid = |reason| SuiteError::InvalidName {
        path: path.to_path_buf(),
        name: name.to_string(),
        reason,
    };
    if name.trim().is_empty() {
        return Err(invalid("names must not be empty"));
    }
    if name.contains('.') {
        return Err(invalid("names must not contain '.'"));
    }
    if name.contains(char::is_whitespace) {
        return Err(invalid("names must not contain whitespace"));
    }
    if !seen.insert(name.to_string()) {
        return Err(SuiteError::DuplicateName {
            path: path.to_path_buf(),
            group: parent.to_string(),
            name: name.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NodeRef;

    const SUITE: &str = r#"
setup: "echo module-up"
cases:
  - name: first
    run: "true"
  - name: slow
    run: "sleep 1"
    timeout_secs: 5
groups:
  - name: Math
    teardown: "echo down"
    cases:
      - name: adds
        run: "test $((1 + 1)) -eq 2"
      - name: known_bug
        run: "false"
        expect_failure: true
      - name: later
        run: "true"
        skip: "not ready"
        env:
          MODE: fast
"#;

    #[test]
    fn test_parse_suite() {
        let path = Path::new("/suites/pkg/test_math.yaml");
        let group = SuiteFile::parse(path, SUITE)
            .unwrap()
            .into_group(path, "pkg.test_math")
            .unwrap();

        assert_eq!(group.kind, GroupKind::Module);
        assert!(group.setup.is_some());
        assert_eq!(group.item_count(), 5);

        let path_to = vec!["Math".to_string(), "later".to_string()];
        match group.find(&path_to) {
            Some(NodeRef::Item(item)) => {
                assert_eq!(item.id, "pkg.test_math.Math.later");
                assert_eq!(item.group, "pkg.test_math.Math");
                match &item.kind {
                    ItemKind::Case(spec) => {
                        assert_eq!(spec.skip.as_deref(), Some("not ready"));
                        assert_eq!(spec.env.get("MODE").map(String::as_str), Some("fast"));
                    }
                    other => panic!("unexpected kind {other:?}"),
                }
            }
            other => panic!("unexpected node {other:?}"),
        }
    }

    #[test]
    fn test_empty_suite_has_no_items() {
        let path = Path::new("/suites/test_empty.yaml");
        let group = SuiteFile::parse(path, "  \n")
            .unwrap()
            .into_group(path, "test_empty")
            .unwrap();
        assert_eq!(group.item_count(), 0);
    }

    #[test]
    fn test_rejects_dotted_names() {
        let path = Path::new("/suites/test_bad.yaml");
        let err = SuiteFile::parse(path, "cases:\n  - name: a.b\n    run: \"true\"\n")
            .unwrap()
            .into_group(path, "test_bad")
            .unwrap_err();
        assert!(matches!(err, SuiteError::InvalidName { .. }));
    }

    #[test]
    fn test_rejects_duplicates() {
        let path = Path::new("/suites/test_dup.yaml");
        let content = "cases:\n  - name: a\n    run: \"true\"\ngroups:\n  - name: a\n";
        let err = SuiteFile::parse(path, content)
            .unwrap()
            .into_group(path, "test_dup")
            .unwrap_err();
        assert!(matches!(err, SuiteError::DuplicateName { .. }));
    }

    #[test]
    fn test_rejects_unknown_fields() {
        let path = Path::new("/suites/test_typo.yaml");
        let err = SuiteFile::parse(path, "setpu: \"true\"\n").unwrap_err();
        assert!(matches!(err, SuiteError::Parse { .. }));
    }

    #[test]
    fn test_schema_mentions_cases() {
        let schema = serde_json::to_string(&suite_schema()).unwrap();
        assert!(schema.contains("cases"));
    }
}
