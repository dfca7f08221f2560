//! Search node arena
//!
//! Nodes live in an arena addressed by stable integer ids; parent links
//! are ids, never owning references. The file map of a node records only
//! the deltas applied at that node - full file state along a path is the
//! left-fold of deltas from root to node.

use appforge_llm::Message;
use appforge_workspace::Workspace;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// Per-node payload. `context` is immutable and categorizes the node
/// (e.g. "draft", "edit", "frontend", "handler:create_task").
#[derive(Clone)]
pub struct NodeData {
    pub workspace: Workspace,
    pub messages: Vec<Message>,
    pub files: BTreeMap<String, Option<String>>,
    pub should_branch: bool,
    pub context: String,
}

impl NodeData {
    pub fn new(workspace: Workspace, messages: Vec<Message>, context: impl Into<String>) -> Self {
        Self {
            workspace,
            messages,
            files: BTreeMap::new(),
            should_branch: false,
            context: context.into(),
        }
    }

    /// The single assistant message this node was created from.
    pub fn head(&self) -> Option<&Message> {
        match self.messages.first() {
            Some(m) if m.role == appforge_llm::Role::Assistant => Some(m),
            _ => None,
        }
    }
}

struct Node {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    depth: u32,
    data: NodeData,
}

/// Arena of search nodes owned by one sub-agent.
pub struct NodeTree {
    nodes: Vec<Node>,
}

/// Serialized node record: `{ id, parent, data }` with the workspace
/// omitted - loading replays file deltas onto fresh workspace clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDump {
    pub id: u32,
    pub parent: Option<u32>,
    pub messages: Vec<Message>,
    pub files: BTreeMap<String, Option<String>>,
    pub should_branch: bool,
    pub context: String,
}

impl NodeTree {
    pub fn new(root: NodeData) -> Self {
        Self {
            nodes: vec![Node {
                parent: None,
                children: Vec::new(),
                depth: 0,
                data: root,
            }],
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn data(&self, id: NodeId) -> &NodeData {
        &self.nodes[id.0 as usize].data
    }

    pub fn data_mut(&mut self, id: NodeId) -> &mut NodeData {
        &mut self.nodes[id.0 as usize].data
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0 as usize].parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0 as usize].children
    }

    pub fn depth(&self, id: NodeId) -> u32 {
        self.nodes[id.0 as usize].depth
    }

    pub fn is_leaf(&self, id: NodeId) -> bool {
        self.nodes[id.0 as usize].children.is_empty()
    }

    pub fn add_child(&mut self, parent: NodeId, data: NodeData) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        let depth = self.depth(parent) + 1;
        self.nodes.push(Node {
            parent: Some(parent),
            children: Vec::new(),
            depth,
            data,
        });
        self.nodes[parent.0 as usize].children.push(id);
        id
    }

    /// Every node below `id`, in DFS order.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut result = Vec::new();
        let mut stack: Vec<NodeId> = self.children(id).to_vec();
        while let Some(node) = stack.pop() {
            result.push(node);
            stack.extend_from_slice(self.children(node));
        }
        result
    }

    /// Root-to-node path, inclusive.
    pub fn trajectory(&self, id: NodeId) -> Vec<NodeId> {
        let mut path = vec![id];
        let mut current = id;
        while let Some(parent) = self.parent(current) {
            path.push(parent);
            current = parent;
        }
        path.reverse();
        path
    }

    /// Effective message history along the trajectory.
    pub fn trajectory_messages(&self, id: NodeId) -> Vec<Message> {
        self.trajectory(id)
            .into_iter()
            .flat_map(|n| self.data(n).messages.iter().cloned())
            .collect()
    }

    /// Left-fold of file deltas from the root to `id`.
    pub fn trajectory_files(&self, id: NodeId) -> BTreeMap<String, Option<String>> {
        let mut files = BTreeMap::new();
        for node in self.trajectory(id) {
            for (path, content) in &self.data(node).files {
                files.insert(path.clone(), content.clone());
            }
        }
        files
    }

    /// Whether any node along the trajectory carries file deltas.
    pub fn has_modifications(&self, id: NodeId) -> bool {
        self.trajectory(id)
            .into_iter()
            .any(|n| !self.data(n).files.is_empty())
    }

    pub fn dump(&self) -> Vec<NodeDump> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(id, node)| NodeDump {
                id: id as u32,
                parent: node.parent.map(|p| p.0),
                messages: node.data.messages.clone(),
                files: node.data.files.clone(),
                should_branch: node.data.should_branch,
                context: node.data.context.clone(),
            })
            .collect()
    }

    /// Rebuild a tree from its dump. Each node's workspace is a clone of
    /// its parent's with the node's deltas replayed; the root starts from
    /// `workspace`.
    pub fn load(dump: &[NodeDump], workspace: &Workspace) -> Result<Self, String> {
        let mut tree: Option<NodeTree> = None;
        for record in dump {
            let parent_ws = match record.parent {
                None => workspace.clone(),
                Some(parent) => {
                    let tree = tree.as_ref().ok_or("child record before root")?;
                    if parent as usize >= tree.len() {
                        return Err(format!("parent id {} out of range", parent));
                    }
                    tree.data(NodeId(parent)).workspace.clone()
                }
            };
            let mut ws = parent_ws;
            for (path, content) in &record.files {
                match content {
                    Some(content) => ws.seed_file(path, content),
                    None => {
                        let _ = ws.delete_file(path);
                    }
                }
            }
            let data = NodeData {
                workspace: ws,
                messages: record.messages.clone(),
                files: record.files.clone(),
                should_branch: record.should_branch,
                context: record.context.clone(),
            };
            match record.parent {
                None => {
                    if tree.is_some() {
                        return Err("multiple roots in node dump".to_string());
                    }
                    tree = Some(NodeTree::new(data));
                }
                Some(parent) => {
                    let tree = tree.as_mut().ok_or("child record before root")?;
                    let id = tree.add_child(NodeId(parent), data);
                    if id.0 != record.id {
                        return Err(format!(
                            "node dump out of order: expected id {}, got {}",
                            id.0, record.id
                        ));
                    }
                }
            }
        }
        tree.ok_or_else(|| "empty node dump".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appforge_llm::{ContentBlock, Message};
    use appforge_workspace::{BaseImage, DisabledPostgres, ProcessRuntime, Workspace};
    use std::sync::Arc;

    fn workspace() -> Workspace {
        let mut files = BTreeMap::new();
        files.insert("readme.md".to_string(), "hello".to_string());
        Workspace::new(
            Arc::new(BaseImage::from_files("test", files)),
            Arc::new(ProcessRuntime::new()),
            Arc::new(DisabledPostgres),
        )
    }

    fn tree() -> NodeTree {
        NodeTree::new(NodeData::new(
            workspace(),
            vec![Message::user_text("build it")],
            "draft",
        ))
    }

    #[test]
    fn trajectory_folds_deltas_left_to_right() {
        let mut tree = tree();
        let root = tree.root();

        let mut child_data = NodeData::new(
            workspace(),
            vec![Message::assistant(vec![ContentBlock::text("writing")])],
            "draft",
        );
        child_data
            .files
            .insert("a.ts".to_string(), Some("v1".to_string()));
        let child = tree.add_child(root, child_data);

        let mut grandchild_data = NodeData::new(
            workspace(),
            vec![Message::assistant(vec![ContentBlock::text("fixing")])],
            "draft",
        );
        grandchild_data
            .files
            .insert("a.ts".to_string(), Some("v2".to_string()));
        grandchild_data.files.insert("b.ts".to_string(), None);
        let grandchild = tree.add_child(child, grandchild_data);

        let files = tree.trajectory_files(grandchild);
        assert_eq!(files.get("a.ts"), Some(&Some("v2".to_string())));
        assert_eq!(files.get("b.ts"), Some(&None));
        assert_eq!(tree.depth(grandchild), 2);
        assert!(tree.has_modifications(grandchild));
        assert!(!tree.has_modifications(root));
    }

    #[test]
    fn trajectory_messages_concatenate_in_order() {
        let mut tree = tree();
        let root = tree.root();
        let child = tree.add_child(
            root,
            NodeData::new(
                workspace(),
                vec![Message::assistant(vec![ContentBlock::text("step 1")])],
                "draft",
            ),
        );
        tree.data_mut(child)
            .messages
            .push(Message::user_text("feedback"));

        let messages = tree.trajectory_messages(child);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].text(), "build it");
        assert_eq!(messages[2].text(), "feedback");
    }

    #[test]
    fn dump_load_round_trips() {
        let mut tree = tree();
        let root = tree.root();
        let mut data = NodeData::new(
            workspace(),
            vec![Message::assistant(vec![ContentBlock::text("x")])],
            "draft",
        );
        data.files
            .insert("server/src/schema.ts".to_string(), Some("schema".to_string()));
        data.should_branch = true;
        let child = tree.add_child(root, data);
        tree.add_child(
            child,
            NodeData::new(
                workspace(),
                vec![Message::assistant(vec![ContentBlock::text("y")])],
                "draft",
            ),
        );

        let dump = tree.dump();
        let loaded = NodeTree::load(&dump, &workspace()).unwrap();

        assert_eq!(loaded.len(), tree.len());
        assert_eq!(loaded.depth(NodeId(2)), 2);
        assert_eq!(
            loaded.data(child).files.get("server/src/schema.ts"),
            Some(&Some("schema".to_string()))
        );
        assert!(loaded.data(child).should_branch);
        // The replayed workspace sees the delta.
        assert_eq!(
            loaded
                .data(NodeId(2))
                .workspace
                .read_file("server/src/schema.ts")
                .unwrap(),
            "schema"
        );
        assert_eq!(serde_json::to_string(&loaded.dump()).unwrap(), serde_json::to_string(&dump).unwrap());
    }

    #[test]
    fn load_rejects_malformed_dumps() {
        assert!(NodeTree::load(&[], &workspace()).is_err());
        let orphan = NodeDump {
            id: 0,
            parent: Some(7),
            messages: vec![],
            files: BTreeMap::new(),
            should_branch: false,
            context: "draft".into(),
        };
        assert!(NodeTree::load(&[orphan], &workspace()).is_err());
    }
}
