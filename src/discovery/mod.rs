//! Work discovery
//!
//! Resolves a target string into a work tree. Three strategies are tried in
//! order and the first one producing at least one item wins:
//!
//! 1. directory discovery (path, dotted path, dotted path under a search root)
//! 2. symbol paths (`pkg.test_math.Group.case`)
//! 3. single suite files (`pkg/test_math.yaml`, or without the extension)
//!
//! A failing strategy is logged and the next one is tried.

mod suite;

pub use suite::{load_suite, suite_schema, CaseDef, GroupDef, SuiteError, SuiteFile};

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use glob::Pattern;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::models::{DiscoveryFailure, WorkGroup, WorkTree};
use crate::utils::CwdGuard;

/// Default file name pattern for suite files
pub const DEFAULT_PATTERN: &str = "test*.yaml";

const SUITE_EXTENSIONS: &[&str] = &["yaml", "yml"];
const IGNORED_DIRS: &[&str] = &["target", "node_modules"];

/// Strategy-level failures; never surfaced past `discover`
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("invalid discovery pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("cannot resolve {}: {source}", path.display())]
    Resolve {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

type Strategy = fn(&Discoverer, &str) -> Result<Option<WorkTree>, DiscoveryError>;

/// Resolves targets relative to a fixed base directory
#[derive(Clone, Debug)]
pub struct Discoverer {
    base_dir: PathBuf,
    search_paths: Vec<PathBuf>,
    pattern: Pattern,
}

impl Discoverer {
    pub fn new(base_dir: impl AsRef<Path>, pattern: &str) -> Result<Self, DiscoveryError> {
        let pattern = Pattern::new(pattern).map_err(|source| DiscoveryError::Pattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            base_dir: absolute(base_dir.as_ref()),
            search_paths: Vec::new(),
            pattern,
        })
    }

    /// Extra roots that dotted targets and module labels resolve against
    pub fn with_search_paths(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        let base = self.base_dir.clone();
        self.search_paths = paths
            .into_iter()
            .map(|p| absolute(&base.join(p)))
            .collect();
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolve one target; `None` when no strategy found anything
    pub fn discover(&self, target: &str) -> Option<WorkTree> {
        let _cwd = CwdGuard::capture();

        let strategies: [(&str, Strategy); 3] = [
            ("directory", Discoverer::from_directory),
            ("symbol", Discoverer::from_symbol),
            ("file", Discoverer::from_file),
        ];

        for (name, strategy) in strategies {
            match strategy(self, target) {
                Ok(Some(tree)) if !tree.is_empty() => {
                    debug!(
                        target = target,
                        strategy = name,
                        items = tree.item_count(),
                        "Target resolved"
                    );
                    return Some(tree);
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(target = target, strategy = name, error = %e, "Strategy failed");
                }
            }
        }

        None
    }

    /// Resolve every target and merge the trees
    pub fn discover_all(&self, targets: &[String]) -> (WorkTree, Vec<DiscoveryFailure>) {
        let mut tree = WorkTree::default();
        let mut failures = Vec::new();

        for target in targets {
            match self.discover(target) {
                Some(found) => {
                    for collision in tree.merge(found) {
                        warn!("Skipping suite: {}", collision);
                        failures.push(DiscoveryFailure::with_reason(
                            target.as_str(),
                            collision.to_string(),
                        ));
                    }
                }
                None => {
                    warn!("No runnable items found for '{}'", target);
                    failures.push(DiscoveryFailure::new(target.as_str()));
                }
            }
        }

        info!(
            "Discovered {} items in {} suites",
            tree.item_count(),
            tree.modules.len()
        );
        (tree, failures)
    }

    fn roots(&self) -> impl Iterator<Item = &PathBuf> {
        std::iter::once(&self.base_dir).chain(self.search_paths.iter())
    }

    fn from_directory(&self, target: &str) -> Result<Option<WorkTree>, DiscoveryError> {
        let mut candidates = vec![self.base_dir.join(target)];
        if let Some(relative) = dotted_path(target) {
            candidates.push(self.base_dir.join(&relative));
            candidates.extend(self.search_paths.iter().map(|root| root.join(&relative)));
        }

        for candidate in candidates {
            if !candidate.is_dir() {
                continue;
            }
            let dir = canonical(&candidate)?;
            let tree = self.walk(&dir);
            if !tree.is_empty() {
                return Ok(Some(tree));
            }
        }

        Ok(None)
    }

    fn from_symbol(&self, target: &str) -> Result<Option<WorkTree>, DiscoveryError> {
        if dotted_path(target).is_none() {
            return Ok(None);
        }
        let parts: Vec<&str> = target.split('.').collect();

        for root in self.roots() {
            for n in (1..=parts.len()).rev() {
                let stem: PathBuf = parts[..n].iter().collect();
                for ext in SUITE_EXTENSIONS {
                    let file = root.join(&stem).with_extension(ext);
                    if !file.is_file() {
                        continue;
                    }
                    let module = self.load(&canonical(&file)?);
                    if is_load_failure(&module) {
                        return Ok(Some(WorkTree::new(vec![module])));
                    }
                    let rest: Vec<String> = parts[n..].iter().map(|s| s.to_string()).collect();
                    return Ok(module.prune_to(&rest).map(|m| WorkTree::new(vec![m])));
                }
            }
        }

        Ok(None)
    }

    fn from_file(&self, target: &str) -> Result<Option<WorkTree>, DiscoveryError> {
        let literal = self.base_dir.join(target);
        let mut candidates = vec![literal.clone()];
        for ext in SUITE_EXTENSIONS {
            let mut with_ext = OsString::from(literal.as_os_str());
            with_ext.push(".");
            with_ext.push(ext);
            candidates.push(PathBuf::from(with_ext));
        }

        for candidate in candidates {
            if candidate.is_file() {
                let module = self.load(&canonical(&candidate)?);
                return Ok(Some(WorkTree::new(vec![module])));
            }
        }

        Ok(None)
    }

    fn walk(&self, dir: &Path) -> WorkTree {
        let mut modules = Vec::new();
        let walker = WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_ignored_dir(e));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry under {}: {}", dir.display(), e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if !self.pattern.matches(&name) {
                continue;
            }
            let module = self.load(entry.path());
            if module.item_count() > 0 {
                modules.push(module);
            }
        }

        WorkTree::new(modules)
    }

    /// Load a suite, turning loader failures into a placeholder item
    fn load(&self, path: &Path) -> WorkGroup {
        let label = self.module_label(path);
        match load_suite(path, &label) {
            Ok(group) => group,
            Err(e) => {
                warn!("Cannot load suite {}: {}", path.display(), e);
                WorkGroup::load_failure(path.to_path_buf(), &label, e.to_string())
            }
        }
    }

    /// Dotted module name of a suite file relative to the innermost root holding it
    pub fn module_label(&self, path: &Path) -> String {
        let innermost = self
            .roots()
            .filter_map(|root| path.strip_prefix(root).ok())
            .min_by_key(|relative| relative.components().count());

        if let Some(relative) = innermost {
            let parts: Vec<_> = relative
                .with_extension("")
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            if !parts.is_empty() {
                return parts.join(".");
            }
        }
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string())
    }
}

/// `a.b.c` as `a/b/c`; `None` for relative markers and real paths
fn dotted_path(target: &str) -> Option<PathBuf> {
    if target.is_empty()
        || target.starts_with('.')
        || target.contains(['/', '\\'])
        || target.split('.').any(str::is_empty)
    {
        return None;
    }
    Some(target.split('.').collect())
}

fn is_ignored_dir(entry: &DirEntry) -> bool {
    if !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || IGNORED_DIRS.contains(&name.as_ref())
}

fn is_load_failure(module: &WorkGroup) -> bool {
    let items = module.items();
    items.len() == 1 && items[0].is_load_failure()
}

fn canonical(path: &Path) -> Result<PathBuf, DiscoveryError> {
    path.canonicalize().map_err(|source| DiscoveryError::Resolve {
        path: path.to_path_buf(),
        source,
    })
}

fn absolute(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}
