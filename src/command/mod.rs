pub mod box_cmd;
pub mod vault;
pub mod workset;

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use console::style;
use serde_json::Value;
use tracing::debug;

use crate::config::Config;
use crate::credentials::{ClaudeCredentials, CredentialsManager};
use crate::layout::{
    BoxError, BoxName, Conversion, Converter, LayoutMode, Outcome, Project, Resolver, StorePaths,
};

/// Everything a command needs to find and change boxes.
pub struct Env {
    pub config: Config,
    pub store: StorePaths,
    pub credentials: ClaudeCredentials,
}

impl Env {
    pub fn load() -> Result<Self> {
        let config = Config::load()?;
        let store = config.store_paths()?;
        let credentials = ClaudeCredentials::for_current_user()?;
        debug!(store = %store.root().display(), "command:environment loaded");
        Ok(Self {
            config,
            store,
            credentials,
        })
    }

    pub fn resolver(&self) -> Resolver {
        Resolver::new(self.store.clone())
    }

    pub fn converter(&self) -> Converter<'_> {
        Converter::new(self.store.clone(), &self.credentials)
    }

    /// The box owning `path` (default: the current directory), or the one
    /// named by `name`.
    pub fn resolve(&self, path: Option<&Path>, name: Option<&BoxName>) -> Result<Project> {
        let start = start_dir(path)?;
        let project = self.resolver().resolve(&start, name)?;
        debug!(project = %project, state_root = %project.state_root.display(), "command:resolved");
        Ok(project)
    }
}

fn start_dir(path: Option<&Path>) -> Result<PathBuf> {
    match path {
        Some(path) => Ok(path.to_path_buf()),
        None => std::env::current_dir().context("Failed to determine current directory"),
    }
}

/// Canonical form of a source directory given on the command line.
pub(crate) fn source_dir(path: Option<&Path>) -> Result<PathBuf> {
    let dir = start_dir(path)?;
    Ok(dir
        .canonicalize()
        .map_err(|_| BoxError::not_found(dir.display()))?)
}

/// Name for a box in `layout`, qualifying a bare name with `workset` when
/// the target is a workset member.
pub(crate) fn qualify_name(
    layout: LayoutMode,
    name: Option<BoxName>,
    workset: Option<&str>,
) -> Result<Option<BoxName>, BoxError> {
    match (layout, name, workset) {
        (LayoutMode::Workset, Some(name), Some(ws)) if name.workset().is_none() => {
            BoxName::member(ws, name.base()).map(Some)
        }
        (LayoutMode::Workset, Some(name), Some(ws)) if name.workset() != Some(ws) => {
            Err(BoxError::InvalidName {
                name: name.to_string(),
                reason: format!("name belongs to another workset than '{}'", ws),
            })
        }
        (_, name, _) => Ok(name),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    Ok,
    Unchanged,
    Warning,
}

impl Status {
    fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::Unchanged => "unchanged",
            Status::Warning => "warning",
        }
    }
}

/// The machine-readable line every box command starts its output with.
pub(crate) struct StatusLine<'a> {
    pub status: Status,
    pub layout: LayoutMode,
    pub name: &'a dyn fmt::Display,
    pub state_root: &'a Path,
}

impl fmt::Display for StatusLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "status={} layout={} name={} state_root={}",
            self.status.as_str(),
            self.layout,
            self.name,
            self.state_root.display()
        )
    }
}

pub(crate) fn print_status(status: Status, project: &Project) {
    println!(
        "{}",
        StatusLine {
            status,
            layout: project.layout,
            name: &project.name,
            state_root: &project.state_root,
        }
    );
}

/// Report a conversion: status line, then a short summary.
pub(crate) fn report_conversion(verb: &str, from: &Project, conversion: &Conversion) {
    let project = &conversion.project;
    match &conversion.outcome {
        Outcome::Converted => {
            print_status(Status::Ok, project);
            println!(
                "{} {} {} → {}",
                style("✓").green(),
                verb,
                style(from).bold(),
                style(project).bold()
            );
        }
        Outcome::Unchanged => {
            print_status(Status::Unchanged, project);
            println!("{} is already {}", style(project).bold(), project.layout);
        }
        Outcome::CleanupWarning(detail) => {
            print_status(Status::Warning, project);
            println!(
                "{} {} {} → {}",
                style("✓").green(),
                verb,
                style(from).bold(),
                style(project).bold()
            );
            eprintln!(
                "{} old state at {} was not removed: {}",
                style("warning:").yellow().bold(),
                from.state_root.display(),
                detail
            );
        }
    }
}

/// Ask for confirmation on stdin. Anything but `y` declines.
pub(crate) fn confirm(question: &str) -> Result<bool> {
    print!("{} [y/N] ", question);
    io::stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    io::stdin()
        .read_line(&mut input)
        .context("Failed to read input")?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

/// Copy the host's agent settings, filtered, into the box and push newer
/// box credentials back to the host.
pub(crate) fn sync_settings(credentials: &ClaudeCredentials, state_root: &Path) -> Result<()> {
    let host = credentials.host_settings_path();
    let raw = match fs::read_to_string(&host) {
        Ok(contents) => serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", host.display()))?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => Value::Object(Default::default()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", host.display()));
        }
    };
    let filtered = credentials.filter_settings(raw);
    credentials.writeback(state_root, &filtered)
}
