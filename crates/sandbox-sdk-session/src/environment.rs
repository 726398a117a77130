//! Local replica of one remote environment.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use sandbox_sdk_core::{OutputLog, OutputSource, Template};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Readiness of a running environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentState {
    /// No start has been sent yet.
    Uninitialized,
    /// Start was sent; waiting for the acknowledgement.
    Starting,
    /// The remote acknowledged the start.
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FsNodeType {
    File,
    Dir,
}

impl FsNodeType {
    /// Map a remote node type (`"Directory"` / `"File"`).
    #[must_use]
    pub fn from_remote(node_type: &str) -> Self {
        if sandbox_sdk_transport::protocol::is_directory(node_type) {
            Self::Dir
        } else {
            Self::File
        }
    }
}

/// Entry of a mirrored directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsNode {
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: FsNodeType,
}

impl FsNode {
    #[must_use]
    pub fn new(name: impl Into<String>, node_type: FsNodeType) -> Self {
        Self {
            name: name.into(),
            node_type,
        }
    }
}

/// Mirrored directory listings and file contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filesystem {
    dirs: BTreeMap<String, Vec<FsNode>>,
    files: HashMap<String, String>,
}

impl Filesystem {
    /// Add `node` under `dir`, replacing an entry with the same name.
    pub fn add_node(&mut self, dir: &str, node: FsNode) {
        let entries = self.dirs.entry(dir.to_string()).or_default();
        match entries.iter_mut().find(|n| n.name == node.name) {
            Some(existing) => *existing = node,
            None => entries.push(node),
        }
    }

    /// Remove the entry called `name` from `dir`. Returns whether it existed.
    pub fn remove_node(&mut self, dir: &str, name: &str) -> bool {
        let Some(entries) = self.dirs.get_mut(dir) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|n| n.name != name);
        entries.len() != before
    }

    /// Replace the listing of `dir` wholesale.
    pub fn set_dir(&mut self, dir: &str, content: Vec<FsNode>) {
        self.dirs.insert(dir.to_string(), content);
    }

    /// Listing of `dir`, if known.
    #[must_use]
    pub fn dir(&self, dir: &str) -> Option<&[FsNode]> {
        self.dirs.get(dir).map(Vec::as_slice)
    }

    /// Mirrored directories in path order.
    pub fn dirs(&self) -> impl Iterator<Item = (&str, &[FsNode])> {
        self.dirs.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn set_file_content(&mut self, path: &str, content: impl Into<String>) {
        self.files.insert(path.to_string(), content.into());
    }

    /// Last content received for `path`.
    #[must_use]
    pub fn file_content(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty() && self.files.is_empty()
    }
}

/// One remote environment as seen by an evaluation context.
#[derive(Debug, Clone)]
pub struct RunningEnvironment {
    pub id: String,
    pub template: Template,
    pub state: EnvironmentState,
    pub filesystem: Filesystem,
    /// Environment-level stdout/stderr. Survives restarts.
    pub output: Arc<OutputLog>,
}

impl RunningEnvironment {
    /// New environment with a generated id.
    #[must_use]
    pub fn new(template: Template) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), template)
    }

    #[must_use]
    pub fn with_id(id: impl Into<String>, template: Template) -> Self {
        Self {
            id: id.into(),
            template,
            state: EnvironmentState::Uninitialized,
            filesystem: Filesystem::default(),
            output: Arc::new(OutputLog::new()),
        }
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == EnvironmentState::Ready
    }

    /// The environment after a reconnect: starting again with an empty
    /// filesystem. Id, template and output log carry over.
    #[must_use]
    pub fn restarted(self) -> Self {
        Self {
            state: EnvironmentState::Starting,
            filesystem: Filesystem::default(),
            ..self
        }
    }

    pub fn log_output(&self, message: impl Into<String>, source: OutputSource) {
        self.output.log(message, source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn python() -> Template {
        Template::builtin("python3").unwrap()
    }

    #[test]
    fn test_restart_resets_state_and_filesystem() {
        let mut env = RunningEnvironment::with_id("env-1", python());
        env.state = EnvironmentState::Ready;
        env.filesystem
            .add_node("/code", FsNode::new("main.py", FsNodeType::File));
        env.filesystem.set_file_content("/code/main.py", "print(1)");
        env.log_output("hello", OutputSource::Stdout);

        let env = env.restarted();
        assert_eq!(env.id, "env-1");
        assert_eq!(env.state, EnvironmentState::Starting);
        assert!(env.filesystem.is_empty());
        assert_eq!(env.output.len(), 1);
    }

    #[test]
    fn test_add_node_replaces_same_name() {
        let mut fs = Filesystem::default();
        fs.add_node("/code", FsNode::new("src", FsNodeType::File));
        fs.add_node("/code", FsNode::new("src", FsNodeType::Dir));
        assert_eq!(fs.dir("/code").unwrap(), &[FsNode::new("src", FsNodeType::Dir)]);

        assert!(fs.remove_node("/code", "src"));
        assert!(!fs.remove_node("/code", "src"));
        assert!(!fs.remove_node("/missing", "src"));
    }

    #[test]
    fn test_remote_node_type() {
        assert_eq!(FsNodeType::from_remote("Directory"), FsNodeType::Dir);
        assert_eq!(FsNodeType::from_remote("File"), FsNodeType::File);
    }
}
