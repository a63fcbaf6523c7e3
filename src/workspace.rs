//! Workspace synchronization between a virtual file tree and an environment.
//!
//! Writes are not transactional: a failure midway leaves the files written so
//! far in place and the caller has to sync again.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::provisioner::Provisioner;
use crate::runtime::{EntryKind, TreeEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Folder,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Utf8,
    Base64,
}

/// One node of the virtual file tree exchanged with clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub name: String,
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<Encoding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<FileNode>>,
}

impl FileNode {
    pub fn file(name: &str, content: &str) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::File,
            content: Some(content.into()),
            encoding: None,
            children: None,
        }
    }

    pub fn folder(name: &str, children: Vec<FileNode>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Folder,
            content: None,
            encoding: None,
            children: Some(children),
        }
    }

    fn bytes(&self) -> Result<Vec<u8>> {
        let content = self.content.as_deref().unwrap_or_default();
        match self.encoding.unwrap_or_default() {
            Encoding::Utf8 => Ok(content.as_bytes().to_vec()),
            Encoding::Base64 => BASE64
                .decode(content)
                .map_err(|e| AppError::BadRequest(format!("{}: invalid base64: {e}", self.name))),
        }
    }
}

/// A node name must be exactly one normal path component.
fn validate_name(name: &str) -> Result<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None) if part == name => Ok(()),
        _ => Err(AppError::BadRequest(format!("invalid file name {name:?}"))),
    }
}

enum Op {
    Dir(PathBuf),
    File(PathBuf, Vec<u8>),
}

/// Validate the whole tree up front and flatten it, parents first.
fn plan(nodes: &[FileNode], parent: &Path, ops: &mut Vec<Op>) -> Result<()> {
    for node in nodes {
        validate_name(&node.name)?;
        let path = parent.join(&node.name);
        match node.kind {
            NodeKind::Folder => {
                ops.push(Op::Dir(path.clone()));
                plan(node.children.as_deref().unwrap_or_default(), &path, ops)?;
            }
            NodeKind::File => ops.push(Op::File(path, node.bytes()?)),
        }
    }
    Ok(())
}

/// Materialize `tree` into the session's writable root.
pub async fn write_tree(provisioner: &Provisioner, session_id: &str, tree: &[FileNode]) -> Result<usize> {
    let session = provisioner.live_session(session_id).await?;
    let mut ops = Vec::new();
    plan(tree, Path::new(""), &mut ops)?;

    let backend = provisioner.backend(&session.environment_id);
    let name = session.environment_id.name();
    let mut files = 0;
    for op in &ops {
        let applied = match op {
            Op::Dir(path) => backend.create_dir(name, path).await,
            Op::File(path, content) => {
                files += 1;
                backend.write_file(name, path, content).await
            }
        };
        if let Err(err) = applied {
            return Err(provisioner.runtime_failed(session_id, err).await);
        }
    }
    info!(session_id, files, entries = ops.len(), "workspace synced");
    Ok(files)
}

/// Rebuild the file tree from the live workspace.
pub async fn read_tree(provisioner: &Provisioner, session_id: &str) -> Result<Vec<FileNode>> {
    let session = provisioner.live_session(session_id).await?;
    let entries = match provisioner
        .backend(&session.environment_id)
        .read_tree(session.environment_id.name())
        .await
    {
        Ok(entries) => entries,
        Err(err) => return Err(provisioner.runtime_failed(session_id, err).await),
    };
    debug!(session_id, entries = entries.len(), "workspace read");
    Ok(build_tree(entries))
}

#[derive(Default)]
struct Dir {
    folders: BTreeMap<String, Dir>,
    files: BTreeMap<String, Vec<u8>>,
}

impl Dir {
    fn descend(&mut self, parents: &[String]) -> &mut Dir {
        parents.iter().fold(self, |dir, part| dir.folders.entry(part.clone()).or_default())
    }

    fn into_nodes(self) -> Vec<FileNode> {
        let mut nodes: Vec<FileNode> = self
            .folders
            .into_iter()
            .map(|(name, dir)| FileNode::folder(&name, dir.into_nodes()))
            .collect();
        nodes.extend(self.files.into_iter().map(|(name, bytes)| file_node(name, bytes)));
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
    }
}

fn file_node(name: String, bytes: Vec<u8>) -> FileNode {
    match String::from_utf8(bytes) {
        Ok(text) => FileNode {
            name,
            kind: NodeKind::File,
            content: Some(text),
            encoding: None,
            children: None,
        },
        Err(err) => FileNode {
            name,
            kind: NodeKind::File,
            content: Some(BASE64.encode(err.into_bytes())),
            encoding: Some(Encoding::Base64),
            children: None,
        },
    }
}

/// Fold flat runtime entries into a nested tree sorted by name.
pub fn build_tree(entries: Vec<TreeEntry>) -> Vec<FileNode> {
    let mut root = Dir::default();
    for entry in entries {
        let mut parts: Vec<String> = entry
            .path
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        let Some(leaf) = parts.pop() else {
            continue;
        };
        let dir = root.descend(&parts);
        match entry.kind {
            EntryKind::Folder => {
                dir.folders.entry(leaf).or_default();
            }
            EntryKind::File => {
                dir.files.insert(leaf, entry.content);
            }
        }
    }
    root.into_nodes()
}
