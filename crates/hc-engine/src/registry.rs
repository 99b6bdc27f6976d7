//! Node registry: id-to-node storage for the whole tree.
//!
//! A hash map pre-reserved to `max_num_nodes`, so inserts below the cap
//! never rehash and every operation stays allocation-free on the audio
//! thread. Ids are client-assigned; duplicates are refused.

use std::collections::HashMap;

use hc_proto::{ErrorKind, NodeId};

use crate::error::EngineError;
use crate::node::Node;

pub struct NodeRegistry {
    nodes: HashMap<NodeId, Node>,
    max_num_nodes: usize,
}

impl NodeRegistry {
    pub fn new(max_num_nodes: usize) -> Self {
        Self {
            nodes: HashMap::with_capacity(max_num_nodes),
            max_num_nodes,
        }
    }

    /// Insert a node under its id. Fails on duplicate ids and on a full
    /// registry; the rejected node is handed back so the caller can
    /// release its resources.
    pub fn insert(&mut self, id: NodeId, node: Node) -> std::result::Result<(), (EngineError, Node)> {
        if self.nodes.contains_key(&id) {
            let err = EngineError::with_message(ErrorKind::NodeIdError, "duplicate node id");
            return Err((err, node));
        }
        if self.nodes.len() >= self.max_num_nodes {
            let err = EngineError::with_message(ErrorKind::AllocFailure, "node registry full");
            return Err((err, node));
        }
        self.nodes.insert(id, node);
        Ok(())
    }

    pub fn remove(&mut self, id: NodeId) -> Option<Node> {
        self.nodes.remove(&id)
    }

    pub fn lookup(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn lookup_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_num_nodes
    }
}
