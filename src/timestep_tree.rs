//! Append-only arena tree recording the timestep history shared by co-emitting prefixes.
//!
//! Grounded on `TimestepTreeNode`/`get_history` in
//! `examples/original_source/native_client/ctcdecode/path_trie.cpp`. Nodes are never mutated
//! after being linked in, so a plain index-based arena is enough — no need for `Rc`/`RefCell`
//! graph plumbing.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimestepId(usize);

struct Node {
    timestep: u32,
    parent: Option<TimestepId>,
    children: Vec<TimestepId>,
}

/// Index 0 is always the arena-owned root, with no timestep of its own.
pub struct TimestepTree {
    nodes: Vec<Node>,
}

impl Default for TimestepTree {
    fn default() -> Self {
        Self::new()
    }
}

impl TimestepTree {
    pub fn new() -> Self {
        TimestepTree {
            nodes: vec![Node {
                timestep: 0,
                parent: None,
                children: Vec::new(),
            }],
        }
    }

    pub fn root(&self) -> TimestepId {
        TimestepId(0)
    }

    /// Returns the child of `parent` with payload `timestep`, reusing an existing one if
    /// present so prefixes that co-emit at the same frame share history.
    pub fn add_child(&mut self, parent: TimestepId, timestep: u32) -> TimestepId {
        let existing = self.nodes[parent.0]
            .children
            .iter()
            .find(|&&child| self.nodes[child.0].timestep == timestep)
            .copied();
        if let Some(id) = existing {
            return id;
        }
        let id = TimestepId(self.nodes.len());
        self.nodes.push(Node {
            timestep,
            parent: Some(parent),
            children: Vec::new(),
        });
        self.nodes[parent.0].children.push(id);
        id
    }

    /// Walks from `tail` up to (but excluding) `root`, returning timesteps in forward order.
    pub fn history(&self, tail: TimestepId, root: TimestepId) -> Vec<u32> {
        let mut rev = Vec::new();
        let mut cur = tail;
        while cur.0 != root.0 {
            let node = &self.nodes[cur.0];
            rev.push(node.timestep);
            cur = node
                .parent
                .expect("walked past the tree root while building history");
        }
        rev.reverse();
        rev
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shares_children_with_the_same_timestep() {
        let mut tree = TimestepTree::new();
        let root = tree.root();
        let a = tree.add_child(root, 3);
        let b = tree.add_child(root, 3);
        assert_eq!(a.0, b.0);
        let c = tree.add_child(root, 4);
        assert_ne!(a.0, c.0);
    }

    #[test]
    fn history_walks_to_root_in_forward_order() {
        let mut tree = TimestepTree::new();
        let root = tree.root();
        let a = tree.add_child(root, 0);
        let b = tree.add_child(a, 2);
        let c = tree.add_child(b, 5);
        assert_eq!(tree.history(c, root), vec![0, 2, 5]);
        assert_eq!(tree.history(root, root), Vec::<u32>::new());
    }
}
