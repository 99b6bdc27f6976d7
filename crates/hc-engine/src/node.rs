//! The node tree: headers, groups, and sibling links.
//!
//! A node is either a group or a synth. Every node carries its id, a weak
//! back-reference to its parent group, and prev/next sibling ids; groups
//! additionally track their first and last child. All links are plain ids
//! resolved through the registry, so tree edits are pointer-free and
//! allocation-free.

use hc_proto::{AddAction, NodeId};

use crate::registry::NodeRegistry;
use crate::synth::Synth;

/// Common state shared by groups and synths.
#[derive(Clone, Copy, Debug)]
pub struct NodeHeader {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub prev: Option<NodeId>,
    pub next: Option<NodeId>,
}

impl NodeHeader {
    pub fn new(id: NodeId, parent: Option<NodeId>) -> Self {
        Self { id, parent, prev: None, next: None }
    }
}

/// A container node whose children process in order.
pub struct Group {
    pub(crate) header: NodeHeader,
    pub(crate) first_child: Option<NodeId>,
    pub(crate) last_child: Option<NodeId>,
}

impl Group {
    pub fn new(id: NodeId, parent: Option<NodeId>) -> Self {
        Self {
            header: NodeHeader::new(id, parent),
            first_child: None,
            last_child: None,
        }
    }

    pub fn first_child(&self) -> Option<NodeId> {
        self.first_child
    }
}

/// A node in the tree.
pub enum Node {
    Group(Group),
    Synth(Synth),
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.header().id
    }

    pub fn header(&self) -> &NodeHeader {
        match self {
            Node::Group(g) => &g.header,
            Node::Synth(s) => &s.header,
        }
    }

    pub fn header_mut(&mut self) -> &mut NodeHeader {
        match self {
            Node::Group(g) => &mut g.header,
            Node::Synth(s) => &mut s.header,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Node::Group(_))
    }

    pub fn as_group(&self) -> Option<&Group> {
        match self {
            Node::Group(g) => Some(g),
            Node::Synth(_) => None,
        }
    }

    pub fn as_group_mut(&mut self) -> Option<&mut Group> {
        match self {
            Node::Group(g) => Some(g),
            Node::Synth(_) => None,
        }
    }

    pub fn as_synth(&self) -> Option<&Synth> {
        match self {
            Node::Synth(s) => Some(s),
            Node::Group(_) => None,
        }
    }

    pub fn as_synth_mut(&mut self) -> Option<&mut Synth> {
        match self {
            Node::Synth(s) => Some(s),
            Node::Group(_) => None,
        }
    }
}

/// Link `node_id` into `group_id`'s child list. The node must already be in
/// the registry with no links.
pub(crate) fn link_node(
    registry: &mut NodeRegistry,
    group_id: NodeId,
    node_id: NodeId,
    action: AddAction,
) {
    let (old_first, old_last) = {
        let group = registry
            .lookup(group_id)
            .and_then(Node::as_group)
            .expect("link target must be a group");
        (group.first_child, group.last_child)
    };

    match action {
        AddAction::Head => {
            if let Some(first) = old_first {
                registry.lookup_mut(first).expect("stale first child").header_mut().prev =
                    Some(node_id);
            }
            let node = registry.lookup_mut(node_id).expect("node to link").header_mut();
            node.parent = Some(group_id);
            node.prev = None;
            node.next = old_first;
            let group =
                registry.lookup_mut(group_id).and_then(Node::as_group_mut).expect("group");
            group.first_child = Some(node_id);
            if old_last.is_none() {
                group.last_child = Some(node_id);
            }
        }
        AddAction::Tail => {
            if let Some(last) = old_last {
                registry.lookup_mut(last).expect("stale last child").header_mut().next =
                    Some(node_id);
            }
            let node = registry.lookup_mut(node_id).expect("node to link").header_mut();
            node.parent = Some(group_id);
            node.prev = old_last;
            node.next = None;
            let group =
                registry.lookup_mut(group_id).and_then(Node::as_group_mut).expect("group");
            group.last_child = Some(node_id);
            if old_first.is_none() {
                group.first_child = Some(node_id);
            }
        }
    }
}

/// Detach `node_id` from its parent's child list. Safe to call on an
/// already-unlinked node.
pub(crate) fn unlink_node(registry: &mut NodeRegistry, node_id: NodeId) {
    let header = match registry.lookup(node_id) {
        Some(node) => *node.header(),
        None => return,
    };

    if let Some(prev) = header.prev {
        if let Some(node) = registry.lookup_mut(prev) {
            node.header_mut().next = header.next;
        }
    }
    if let Some(next) = header.next {
        if let Some(node) = registry.lookup_mut(next) {
            node.header_mut().prev = header.prev;
        }
    }
    if let Some(parent) = header.parent {
        if let Some(group) = registry.lookup_mut(parent).and_then(Node::as_group_mut) {
            if group.first_child == Some(node_id) {
                group.first_child = header.next;
            }
            if group.last_child == Some(node_id) {
                group.last_child = header.prev;
            }
        }
    }

    let node = registry.lookup_mut(node_id).expect("node present").header_mut();
    node.parent = None;
    node.prev = None;
    node.next = None;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_root() -> NodeRegistry {
        let mut reg = NodeRegistry::new(16);
        assert!(reg.insert(0, Node::Group(Group::new(0, None))).is_ok());
        reg
    }

    fn children(reg: &NodeRegistry, group_id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cur = reg.lookup(group_id).and_then(Node::as_group).unwrap().first_child;
        while let Some(id) = cur {
            out.push(id);
            cur = reg.lookup(id).unwrap().header().next;
        }
        out
    }

    #[test]
    fn tail_links_append_in_order() {
        let mut reg = registry_with_root();
        for id in 1..=3 {
            assert!(reg.insert(id, Node::Group(Group::new(id, None))).is_ok());
            link_node(&mut reg, 0, id, AddAction::Tail);
        }
        assert_eq!(children(&reg, 0), vec![1, 2, 3]);
    }

    #[test]
    fn head_links_prepend() {
        let mut reg = registry_with_root();
        for id in 1..=3 {
            assert!(reg.insert(id, Node::Group(Group::new(id, None))).is_ok());
            link_node(&mut reg, 0, id, AddAction::Head);
        }
        assert_eq!(children(&reg, 0), vec![3, 2, 1]);
    }

    #[test]
    fn unlink_middle_preserves_neighbors() {
        let mut reg = registry_with_root();
        for id in 1..=3 {
            assert!(reg.insert(id, Node::Group(Group::new(id, None))).is_ok());
            link_node(&mut reg, 0, id, AddAction::Tail);
        }
        unlink_node(&mut reg, 2);
        assert_eq!(children(&reg, 0), vec![1, 3]);
        let header = reg.lookup(2).unwrap().header();
        assert!(header.parent.is_none() && header.prev.is_none() && header.next.is_none());
    }

    #[test]
    fn unlink_endpoints_updates_group() {
        let mut reg = registry_with_root();
        for id in 1..=2 {
            assert!(reg.insert(id, Node::Group(Group::new(id, None))).is_ok());
            link_node(&mut reg, 0, id, AddAction::Tail);
        }
        unlink_node(&mut reg, 1);
        assert_eq!(children(&reg, 0), vec![2]);
        unlink_node(&mut reg, 2);
        assert_eq!(children(&reg, 0), Vec::<NodeId>::new());
        let group = reg.lookup(0).and_then(Node::as_group).unwrap();
        assert!(group.first_child.is_none() && group.last_child.is_none());
    }
}
