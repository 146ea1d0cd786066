//! Finding the box that owns a directory.
//!
//! Resolution is a pure read of the filesystem: no locks, no caches between
//! calls. Store indexes are rebuilt on every call from the markers on disk.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::marker::BoxRef;
use super::{
    BoxError, BoxName, DECENTRALIZED_DIR, LayoutMode, Marker, Project, StorePaths,
    is_hidden_entry,
};

/// Health of a store entry, as shown by `box list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryHealth {
    Ok,
    MissingSource,
    Corrupt(String),
}

/// One state directory found in the store.
#[derive(Debug, Clone)]
pub struct StoreEntry {
    pub layout: LayoutMode,
    pub name: String,
    pub state_root: PathBuf,
    pub source_root: Option<PathBuf>,
    pub health: EntryHealth,
}

#[derive(Debug, Clone)]
struct Candidate {
    project: Project,
    marker: Marker,
}

/// Store-held boxes keyed by the source root their marker records.
#[derive(Default)]
struct StoreIndex {
    workset: HashMap<PathBuf, Vec<Candidate>>,
    centralized: HashMap<PathBuf, Vec<Candidate>>,
}

pub struct Resolver {
    store: StorePaths,
}

impl Resolver {
    pub fn new(store: StorePaths) -> Self {
        Self { store }
    }

    /// State root for a box with the given identity.
    pub fn locate(
        &self,
        layout: LayoutMode,
        name: &BoxName,
        source_root: &Path,
    ) -> Result<PathBuf, BoxError> {
        self.store.state_root(layout, name, source_root)
    }

    /// Find the box for `start_dir`, or look one up by name.
    pub fn resolve(
        &self,
        start_dir: &Path,
        name_hint: Option<&BoxName>,
    ) -> Result<Project, BoxError> {
        if let Some(name) = name_hint {
            return self.lookup(name);
        }

        let start = start_dir
            .canonicalize()
            .map_err(|_| BoxError::not_found(start_dir.display()))?;
        let index = self.index()?;

        for dir in start.ancestors() {
            let mut found = Vec::new();
            if let Some(candidate) = decentralized_at(dir)? {
                found.push(candidate);
            }
            if let Some(members) = index.workset.get(dir) {
                found.extend(members.iter().cloned());
            }
            if let Some(boxes) = index.centralized.get(dir) {
                found.extend(boxes.iter().cloned());
            }
            if !found.is_empty() {
                return pick(dir, found);
            }
        }
        Err(BoxError::not_found(start.display()))
    }

    /// Direct lookup of a store-held box by name.
    pub fn lookup(&self, name: &BoxName) -> Result<Project, BoxError> {
        let project = self.find(name)?;
        if !project.source_root.is_dir() {
            return Err(BoxError::corrupt(
                &project.state_root,
                format!(
                    "source root {} no longer exists",
                    project.source_root.display()
                ),
            ));
        }
        debug!(name = %name, state_root = %project.state_root.display(), "resolve:lookup");
        Ok(project)
    }

    /// Like `lookup`, but a box whose project directory is gone is still
    /// returned so it can be remapped or removed.
    pub fn find(&self, name: &BoxName) -> Result<Project, BoxError> {
        let layout = if name.workset().is_some() {
            LayoutMode::Workset
        } else {
            LayoutMode::Centralized
        };
        let state_root = self.store.stored_state_root(name);
        if !state_root.is_dir() {
            return Err(BoxError::not_found(format!("box '{}'", name)));
        }
        let marker = Marker::read(&state_root)?;
        if marker.layout != layout || &marker.name != name {
            return Err(BoxError::corrupt(
                &state_root,
                format!(
                    "marker describes {} box '{}' but lives at the slot for '{}'",
                    marker.layout, marker.name, name
                ),
            ));
        }
        Ok(marker.project(&state_root))
    }

    /// The store-held box whose marker records `source_root`, whether or not
    /// that directory still exists.
    pub fn recorded_at(&self, source_root: &Path) -> Result<Project, BoxError> {
        let key = canonical(source_root);
        let mut index = self.index()?;
        let mut found = index.workset.remove(&key).unwrap_or_default();
        found.extend(index.centralized.remove(&key).unwrap_or_default());
        if found.is_empty() {
            return Err(BoxError::not_found(source_root.display()));
        }
        pick(&key, found)
    }

    /// Boxes of `layout` whose source is `source_root`.
    pub fn bound_to(
        &self,
        layout: LayoutMode,
        source_root: &Path,
    ) -> Result<Vec<Project>, BoxError> {
        let key = canonical(source_root);
        let candidates: Vec<Candidate> = match layout {
            LayoutMode::Decentralized => decentralized_at(&key)?.into_iter().collect(),
            LayoutMode::Centralized => self.index()?.centralized.remove(&key).unwrap_or_default(),
            LayoutMode::Workset => self.index()?.workset.remove(&key).unwrap_or_default(),
        };
        Ok(candidates.into_iter().map(|c| c.project).collect())
    }

    pub fn list_centralized(&self) -> Result<Vec<StoreEntry>, BoxError> {
        let entries = scan(&self.store.boxes_dir(), LayoutMode::Centralized, None)?;
        Ok(entries.into_iter().map(|(entry, _)| entry).collect())
    }

    pub fn list_workset(&self, workset: &str) -> Result<Vec<StoreEntry>, BoxError> {
        let root = self.store.workset_root(workset);
        if !root.is_dir() {
            return Err(BoxError::not_found(format!("workset '{}'", workset)));
        }
        let entries = scan(&root, LayoutMode::Workset, Some(workset))?;
        Ok(entries.into_iter().map(|(entry, _)| entry).collect())
    }

    fn index(&self) -> Result<StoreIndex, BoxError> {
        let mut index = StoreIndex::default();

        for (_, candidate) in scan(&self.store.boxes_dir(), LayoutMode::Centralized, None)? {
            if let Some(c) = candidate {
                index
                    .centralized
                    .entry(canonical(&c.project.source_root))
                    .or_default()
                    .push(c);
            }
        }

        for workset in subdirs(&self.store.worksets_dir())? {
            let Some(ws) = workset.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            for (_, candidate) in scan(&workset, LayoutMode::Workset, Some(ws))? {
                if let Some(c) = candidate {
                    index
                        .workset
                        .entry(canonical(&c.project.source_root))
                        .or_default()
                        .push(c);
                }
            }
        }
        Ok(index)
    }
}

/// The in-tree state directory at `dir`, if there is one.
fn decentralized_at(dir: &Path) -> Result<Option<Candidate>, BoxError> {
    let state_root = dir.join(DECENTRALIZED_DIR);
    if !state_root.is_dir() {
        return Ok(None);
    }
    let marker = Marker::read(&state_root)?;
    if marker.layout != LayoutMode::Decentralized {
        return Err(BoxError::corrupt(
            &state_root,
            format!("in-tree marker records layout {}", marker.layout),
        ));
    }
    if marker.source_root != dir {
        debug!(
            recorded = %marker.source_root.display(),
            actual = %dir.display(),
            "resolve:project tree moved since marker was written"
        );
    }
    let mut project = marker.project(&state_root);
    project.source_root = dir.to_path_buf();
    Ok(Some(Candidate { project, marker }))
}

/// Choose among candidates found at the same directory level.
fn pick(dir: &Path, mut found: Vec<Candidate>) -> Result<Project, BoxError> {
    if found.len() > 1 {
        let superseded: Vec<BoxRef> = found
            .iter()
            .filter_map(|c| c.marker.supersedes.clone())
            .collect();
        found.retain(|c| {
            let stale = superseded.contains(&c.marker.box_ref());
            if stale {
                warn!(
                    name = %c.project.name,
                    layout = %c.project.layout,
                    state_root = %c.project.state_root.display(),
                    "resolve:ignoring superseded box left by an interrupted conversion"
                );
            }
            !stale
        });
    }

    if found.len() == 2 {
        let layouts = (found[0].project.layout, found[1].project.layout);
        let decentralized = match layouts {
            (LayoutMode::Decentralized, LayoutMode::Workset) => Some(0),
            (LayoutMode::Workset, LayoutMode::Decentralized) => Some(1),
            _ => None,
        };
        if let Some(i) = decentralized {
            debug!(dir = %dir.display(), "resolve:in-tree marker wins over workset");
            return Ok(found.swap_remove(i).project);
        }
    }

    match found.len() {
        1 => {
            let project = found.swap_remove(0).project;
            debug!(
                name = %project.name,
                layout = %project.layout,
                dir = %dir.display(),
                "resolve:found"
            );
            Ok(project)
        }
        _ => Err(BoxError::Ambiguous {
            dir: dir.to_path_buf(),
            candidates: found
                .iter()
                .map(|c| format!("{} ({})", c.project.name, c.project.layout))
                .collect(),
        }),
    }
}

/// Read every state directory under `dir`, pairing listing info with a
/// usable candidate when the marker is sound.
fn scan(
    dir: &Path,
    layout: LayoutMode,
    workset: Option<&str>,
) -> Result<Vec<(StoreEntry, Option<Candidate>)>, BoxError> {
    let mut results = Vec::new();
    for state_root in subdirs(dir)? {
        let dir_name = state_root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let display_name = match workset {
            Some(ws) => format!("{}/{}", ws, dir_name),
            None => dir_name.clone(),
        };

        let checked = Marker::read(&state_root).and_then(|marker| {
            let expected = match workset {
                Some(ws) => BoxName::member(ws, &dir_name)?,
                None => BoxName::single(&dir_name)?,
            };
            if marker.layout != layout || marker.name != expected {
                return Err(BoxError::corrupt(
                    &state_root,
                    format!("marker describes {} box '{}'", marker.layout, marker.name),
                ));
            }
            Ok(marker)
        });

        match checked {
            Ok(marker) => {
                let health = if marker.source_root.is_dir() {
                    EntryHealth::Ok
                } else {
                    EntryHealth::MissingSource
                };
                let entry = StoreEntry {
                    layout,
                    name: display_name,
                    state_root: state_root.clone(),
                    source_root: Some(marker.source_root.clone()),
                    health,
                };
                let candidate = Candidate {
                    project: marker.project(&state_root),
                    marker,
                };
                results.push((entry, Some(candidate)));
            }
            Err(e) => {
                warn!(state_root = %state_root.display(), error = %e, "resolve:skipping store entry");
                let entry = StoreEntry {
                    layout,
                    name: display_name,
                    state_root,
                    source_root: None,
                    health: EntryHealth::Corrupt(e.to_string()),
                };
                results.push((entry, None));
            }
        }
    }
    results.sort_by(|a, b| a.0.name.cmp(&b.0.name));
    Ok(results)
}

/// Non-hidden subdirectories of `dir`; a missing `dir` has none.
fn subdirs(dir: &Path) -> Result<Vec<PathBuf>, BoxError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(BoxError::io(dir, e)),
    };
    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| BoxError::io(dir, e))?;
        if is_hidden_entry(&entry.file_name()) {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    Ok(dirs)
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::layout::MARKER_FILE;
    use crate::layout::marker::BoxRef;
    use tempfile::TempDir;

    pub(crate) struct Fixture {
        pub tmp: TempDir,
        pub store: StorePaths,
    }

    impl Fixture {
        pub fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let store = StorePaths::new(tmp.path().join("store"));
            Self { tmp, store }
        }

        /// A canonical source directory under the fixture.
        pub fn source(&self, rel: &str) -> PathBuf {
            let dir = self.tmp.path().join(rel);
            fs::create_dir_all(&dir).unwrap();
            dir.canonicalize().unwrap()
        }

        /// Write a bare state directory with a marker.
        pub fn plant(&self, layout: LayoutMode, name: &str, source: &Path) -> Project {
            let project = Project::new(
                &self.store,
                layout,
                name.parse().unwrap(),
                source.to_path_buf(),
            )
            .unwrap();
            fs::create_dir_all(&project.state_root).unwrap();
            Marker::new(&project, 1).write(&project.state_root).unwrap();
            project
        }

        pub fn resolver(&self) -> Resolver {
            Resolver::new(self.store.clone())
        }
    }

    #[test]
    fn resolves_decentralized_from_subdirectory() {
        let fx = Fixture::new();
        let src = fx.source("work/demo");
        let planted = fx.plant(LayoutMode::Decentralized, "demo", &src);
        let nested = fx.source("work/demo/src/deep");

        let project = fx.resolver().resolve(&nested, None).unwrap();
        assert_eq!(project, planted);
    }

    #[test]
    fn resolves_centralized_by_recorded_source() {
        let fx = Fixture::new();
        let src = fx.source("work/demo");
        let planted = fx.plant(LayoutMode::Centralized, "demo", &src);

        let project = fx.resolver().resolve(&src, None).unwrap();
        assert_eq!(project, planted);
        assert_eq!(project.state_root, fx.store.boxes_dir().join("demo"));
    }

    #[test]
    fn resolves_workset_member() {
        let fx = Fixture::new();
        let src = fx.source("work/api");
        fx.plant(LayoutMode::Workset, "team/api", &src);

        let project = fx.resolver().resolve(&src, None).unwrap();
        assert_eq!(project.layout, LayoutMode::Workset);
        assert_eq!(project.name.to_string(), "team/api");
    }

    #[test]
    fn decentralized_wins_over_workset() {
        let fx = Fixture::new();
        let src = fx.source("work/api");
        fx.plant(LayoutMode::Workset, "team/api", &src);
        fx.plant(LayoutMode::Decentralized, "api", &src);

        let project = fx.resolver().resolve(&src, None).unwrap();
        assert_eq!(project.layout, LayoutMode::Decentralized);
    }

    #[test]
    fn nearest_level_wins() {
        let fx = Fixture::new();
        let outer = fx.source("work");
        let inner = fx.source("work/inner");
        fx.plant(LayoutMode::Centralized, "outer", &outer);
        fx.plant(LayoutMode::Centralized, "inner", &inner);

        let project = fx.resolver().resolve(&inner, None).unwrap();
        assert_eq!(project.name.base(), "inner");
    }

    #[test]
    fn two_centralized_boxes_are_ambiguous() {
        let fx = Fixture::new();
        let src = fx.source("work/demo");
        fx.plant(LayoutMode::Centralized, "demo", &src);
        fx.plant(LayoutMode::Centralized, "demo-copy", &src);

        match fx.resolver().resolve(&src, None) {
            Err(BoxError::Ambiguous { candidates, .. }) => assert_eq!(candidates.len(), 2),
            other => panic!("expected Ambiguous, got {:?}", other),
        }
    }

    #[test]
    fn superseded_candidate_is_dropped() {
        let fx = Fixture::new();
        let src = fx.source("work/demo");
        fx.plant(LayoutMode::Centralized, "demo", &src);
        let target = fx.plant(LayoutMode::Decentralized, "demo", &src);

        let mut marker = Marker::read(&target.state_root).unwrap();
        marker.supersedes = Some(BoxRef {
            layout: LayoutMode::Centralized,
            name: "demo".parse().unwrap(),
        });
        marker.write(&target.state_root).unwrap();

        let project = fx.resolver().resolve(&src, None).unwrap();
        assert_eq!(project.layout, LayoutMode::Decentralized);
    }

    #[test]
    fn broken_in_tree_marker_is_corrupt() {
        let fx = Fixture::new();
        let src = fx.source("work/demo");
        fs::create_dir_all(src.join(DECENTRALIZED_DIR)).unwrap();
        assert!(matches!(
            fx.resolver().resolve(&src, None),
            Err(BoxError::CorruptState { .. })
        ));

        fs::write(src.join(DECENTRALIZED_DIR).join(MARKER_FILE), "{oops").unwrap();
        assert!(matches!(
            fx.resolver().resolve(&src, None),
            Err(BoxError::CorruptState { .. })
        ));
    }

    #[test]
    fn unreadable_store_entries_are_skipped() {
        let fx = Fixture::new();
        let src = fx.source("work/demo");
        fx.plant(LayoutMode::Centralized, "demo", &src);
        fs::create_dir_all(fx.store.boxes_dir().join("broken")).unwrap();
        fs::create_dir_all(fx.store.boxes_dir().join(".agentbox-staging-x")).unwrap();

        let project = fx.resolver().resolve(&src, None).unwrap();
        assert_eq!(project.name.base(), "demo");

        let listed = fx.resolver().list_centralized().unwrap();
        assert_eq!(listed.len(), 2);
        assert!(matches!(listed[0].health, EntryHealth::Corrupt(_)));
        assert_eq!(listed[1].health, EntryHealth::Ok);
    }

    #[test]
    fn name_hint_skips_walk() {
        let fx = Fixture::new();
        let src = fx.source("work/demo");
        let elsewhere = fx.source("elsewhere");
        let planted = fx.plant(LayoutMode::Workset, "team/demo", &src);

        let hint: BoxName = "team/demo".parse().unwrap();
        let project = fx.resolver().resolve(&elsewhere, Some(&hint)).unwrap();
        assert_eq!(project, planted);

        let unknown: BoxName = "ghost".parse().unwrap();
        assert!(matches!(
            fx.resolver().resolve(&elsewhere, Some(&unknown)),
            Err(BoxError::NotFound { .. })
        ));
    }

    #[test]
    fn name_hint_with_vanished_source_is_corrupt() {
        let fx = Fixture::new();
        let src = fx.source("work/demo");
        fx.plant(LayoutMode::Centralized, "demo", &src);
        fs::remove_dir_all(&src).unwrap();

        let hint: BoxName = "demo".parse().unwrap();
        assert!(matches!(
            fx.resolver().resolve(fx.tmp.path(), Some(&hint)),
            Err(BoxError::CorruptState { .. })
        ));
        assert_eq!(
            fx.resolver().list_centralized().unwrap()[0].health,
            EntryHealth::MissingSource
        );
    }

    #[test]
    fn vanished_source_is_still_found_for_repair() {
        let fx = Fixture::new();
        let src = fx.source("work/demo");
        let planted = fx.plant(LayoutMode::Workset, "team/demo", &src);
        fs::remove_dir_all(&src).unwrap();

        let name: BoxName = "team/demo".parse().unwrap();
        assert!(matches!(
            fx.resolver().lookup(&name),
            Err(BoxError::CorruptState { .. })
        ));
        assert_eq!(fx.resolver().find(&name).unwrap(), planted);
        assert_eq!(fx.resolver().recorded_at(&src).unwrap(), planted);
        assert!(matches!(
            fx.resolver().recorded_at(&fx.tmp.path().join("work/other")),
            Err(BoxError::NotFound { .. })
        ));
    }

    #[test]
    fn unowned_directory_is_not_found() {
        let fx = Fixture::new();
        let src = fx.source("work/none");
        assert!(matches!(
            fx.resolver().resolve(&src, None),
            Err(BoxError::NotFound { .. })
        ));
        assert!(matches!(
            fx.resolver().resolve(&src.join("missing"), None),
            Err(BoxError::NotFound { .. })
        ));
    }

    #[test]
    fn locate_matches_state_root_rule() {
        let fx = Fixture::new();
        let src = fx.source("work/demo");
        let name: BoxName = "demo".parse().unwrap();
        assert_eq!(
            fx.resolver()
                .locate(LayoutMode::Decentralized, &name, &src)
                .unwrap(),
            src.join(DECENTRALIZED_DIR)
        );
    }
}
