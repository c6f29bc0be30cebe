//! Document state tree: the local folder hierarchy annotated with each
//! file's synchronization state.
//!
//! Nodes live in an arena (`Vec`) addressed by [`NodeId`]; a path index
//! gives O(1) lookup by vault-relative path. Arena order is insertion
//! order, which is the order [`DocumentStateTree::get_all_folders`]
//! reports. Children are kept sorted by name.
//!
//! Every non-root node's parent is present in the index: inserting
//! `a/b/c` into an empty tree synthesizes the folders `a` and `a/b` first.
//! The root has the empty path. Only folders have children: a folder with
//! children is never turned into a file, and a childless file that gains
//! a child becomes a folder.
//!
//! The arena only grows. Removed nodes leave an empty slot behind and ids
//! are never reused, so a stale [`NodeId`] resolves to `None`.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;

use crate::models::{DocumentChunkMetadata, FileState};
use crate::vault::normalize_path;

pub type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Folder,
    File,
}

#[derive(Debug, Clone)]
pub struct TreeNode {
    pub path: String,
    pub name: String,
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    children: BTreeMap<String, NodeId>,
    pub state: Option<FileState>,
    /// Last-known remote metadata, or the synthesized metadata of a new file.
    pub metadata: Option<DocumentChunkMetadata>,
}

impl TreeNode {
    fn new(path: String, kind: NodeKind, parent: Option<NodeId>) -> Self {
        let name = path.rsplit('/').next().unwrap_or_default().to_string();
        Self {
            path,
            name,
            kind,
            parent,
            children: BTreeMap::new(),
            state: None,
            metadata: None,
        }
    }

    pub fn is_folder(&self) -> bool {
        self.kind == NodeKind::Folder
    }

    /// Child ids in name order.
    pub fn child_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.children.values().copied()
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }
}

pub struct DocumentStateTree {
    root_name: String,
    nodes: Vec<Option<TreeNode>>,
    index: HashMap<String, NodeId>,
}

pub const ROOT_ID: NodeId = 0;

fn parent_path(path: &str) -> &str {
    path.rfind('/').map(|i| &path[..i]).unwrap_or("")
}

impl DocumentStateTree {
    /// Empty tree holding only the root folder, rendered as `root_name`.
    pub fn new(root_name: &str) -> Self {
        let root = TreeNode::new(String::new(), NodeKind::Folder, None);
        let mut index = HashMap::new();
        index.insert(String::new(), ROOT_ID);
        Self {
            root_name: root_name.to_string(),
            nodes: vec![Some(root)],
            index,
        }
    }

    pub fn root(&self) -> &TreeNode {
        self.node(ROOT_ID).unwrap_or_else(|| unreachable!("root is never removed"))
    }

    pub fn node(&self, id: NodeId) -> Option<&TreeNode> {
        self.nodes.get(id).and_then(|n| n.as_ref())
    }

    pub fn get_node(&self, path: &str) -> Option<&TreeNode> {
        let id = *self.index.get(&normalize_path(path))?;
        self.node(id)
    }

    pub fn parent(&self, node: &TreeNode) -> Option<&TreeNode> {
        node.parent.and_then(|id| self.node(id))
    }

    pub fn children<'a>(&'a self, node: &'a TreeNode) -> impl Iterator<Item = &'a TreeNode> + 'a {
        node.child_ids().filter_map(move |id| self.node(id))
    }

    /// Number of indexed nodes, root included.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 1
    }

    /// Insert (or update) the node at `path`, synthesizing missing
    /// ancestor folders. Re-adding a non-empty folder as a file leaves it
    /// untouched.
    pub fn add_node(
        &mut self,
        path: &str,
        kind: NodeKind,
        state: Option<FileState>,
        metadata: Option<DocumentChunkMetadata>,
    ) -> NodeId {
        let path = normalize_path(path);
        if path.is_empty() {
            return ROOT_ID;
        }

        if let Some(&id) = self.index.get(&path) {
            if let Some(node) = self.nodes[id].as_mut() {
                if kind == NodeKind::File && !node.children.is_empty() {
                    tracing::warn!(path = %node.path, "refusing to turn a non-empty folder into a file");
                    return id;
                }
                node.kind = kind;
                node.state = state;
                node.metadata = metadata;
            }
            return id;
        }

        let parent = self.ensure_folder(parent_path(&path));
        let id = self.insert(path, kind, parent);
        if let Some(node) = self.nodes[id].as_mut() {
            node.state = state;
            node.metadata = metadata;
        }
        id
    }

    fn ensure_folder(&mut self, path: &str) -> NodeId {
        if let Some(&id) = self.index.get(path) {
            if let Some(node) = self.nodes[id].as_mut() {
                if node.kind == NodeKind::File {
                    tracing::debug!(path, "file node gains children, becoming a folder");
                    node.kind = NodeKind::Folder;
                    node.state = None;
                    node.metadata = None;
                }
            }
            return id;
        }
        tracing::trace!(path, "synthesizing folder node");
        let parent = self.ensure_folder(parent_path(path));
        self.insert(path.to_string(), NodeKind::Folder, parent)
    }

    fn insert(&mut self, path: String, kind: NodeKind, parent: NodeId) -> NodeId {
        let id = self.nodes.len();
        let node = TreeNode::new(path.clone(), kind, Some(parent));
        if let Some(parent_node) = self.nodes[parent].as_mut() {
            parent_node.children.insert(node.name.clone(), id);
        }
        self.nodes.push(Some(node));
        self.index.insert(path, id);
        id
    }

    /// Remove the node at `path` and everything below it. The root cannot
    /// be removed. Returns whether anything was removed.
    pub fn remove_node(&mut self, path: &str) -> bool {
        let path = normalize_path(path);
        if path.is_empty() {
            return false;
        }
        let Some(id) = self.index.get(&path).copied() else {
            return false;
        };

        if let Some(parent_id) = self.node(id).and_then(|n| n.parent) {
            if let Some(parent) = self.nodes[parent_id].as_mut() {
                parent.children.retain(|_, child| *child != id);
            }
        }

        let mut pending = vec![id];
        while let Some(current) = pending.pop() {
            if let Some(node) = self.nodes[current].take() {
                self.index.remove(&node.path);
                pending.extend(node.child_ids());
            }
        }
        true
    }

    /// Folder nodes, root included, in insertion order.
    pub fn get_all_folders(&self) -> Vec<&TreeNode> {
        self.nodes
            .iter()
            .flatten()
            .filter(|n| n.is_folder())
            .collect()
    }

    /// File nodes that carry a state, in insertion order.
    pub fn changed_files(&self) -> Vec<&TreeNode> {
        self.nodes
            .iter()
            .flatten()
            .filter(|n| !n.is_folder() && n.state.is_some())
            .collect()
    }

    /// Indented text rendering, four spaces per level.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_node(self.root(), 0, &mut out);
        out
    }

    fn render_node(&self, node: &TreeNode, depth: usize, out: &mut String) {
        let indent = " ".repeat(depth * 4);
        let name = if node.path.is_empty() {
            self.root_name.as_str()
        } else {
            node.name.as_str()
        };

        let _ = match node.kind {
            NodeKind::Folder => {
                writeln!(out, "{}- [Folder] {} ({} items)", indent, name, node.child_count())
            }
            NodeKind::File => match node.state {
                Some(state) => writeln!(out, "{}- [File] {} [{}]", indent, name, state),
                None => writeln!(out, "{}- [File] {}", indent, name),
            },
        };

        for child in self.children(node) {
            self.render_node(child, depth + 1, out);
        }
    }
}
