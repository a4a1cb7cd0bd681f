//! The per-document revision tree.
//!
//! Persisted as `{"children": [Node...]}` in `<id>.revision_tree.json`.
//! New branches are prepended to their level, so left-most means most
//! recently created.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::revision::{RevisionHistory, RevisionId, RevisionInfo, RevisionStatus};

/// One revision in the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub rev: RevisionId,
    pub status: RevisionStatus,
    #[serde(default)]
    pub children: Vec<Node>,
}

impl Node {
    pub fn new(rev: RevisionId, status: RevisionStatus) -> Self {
        Self {
            rev,
            status,
            children: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Root of a document's revision tree. The root itself carries no revision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionTree {
    #[serde(default)]
    pub children: Vec<Node>,
}

impl RevisionTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Root-to-node path of `rev`, inclusive.
    pub fn path(&self, rev: &RevisionId) -> Option<Vec<&Node>> {
        fn walk<'a>(nodes: &'a [Node], rev: &RevisionId, path: &mut Vec<&'a Node>) -> bool {
            for node in nodes {
                path.push(node);
                if &node.rev == rev || walk(&node.children, rev, path) {
                    return true;
                }
                path.pop();
            }
            false
        }

        let mut path = Vec::new();
        walk(&self.children, rev, &mut path).then_some(path)
    }

    pub fn find(&self, rev: &RevisionId) -> Option<&Node> {
        self.path(rev).and_then(|path| path.last().copied())
    }

    pub fn contains(&self, rev: &RevisionId) -> bool {
        self.find(rev).is_some()
    }

    /// Every node, depth-first, left to right.
    pub fn nodes(&self) -> Vec<&Node> {
        fn walk<'a>(nodes: &'a [Node], out: &mut Vec<&'a Node>) {
            for node in nodes {
                out.push(node);
                walk(&node.children, out);
            }
        }

        let mut out = Vec::new();
        walk(&self.children, &mut out);
        out
    }

    /// Leaves, left to right.
    pub fn leaves(&self) -> Vec<&Node> {
        self.nodes().into_iter().filter(|node| node.is_leaf()).collect()
    }

    pub fn revisions(&self) -> BTreeSet<RevisionId> {
        self.nodes().into_iter().map(|node| node.rev.clone()).collect()
    }

    /// Path to the winning revision: the deepest non-deleted leaf, left-most
    /// on ties.
    pub fn winner(&self) -> Option<Vec<&Node>> {
        fn walk<'a>(nodes: &'a [Node], path: &mut Vec<&'a Node>, best: &mut Option<Vec<&'a Node>>) {
            for node in nodes {
                path.push(node);
                if node.is_leaf() {
                    let deeper = best.as_ref().map_or(true, |b| path.len() > b.len());
                    if node.status != RevisionStatus::Deleted && deeper {
                        *best = Some(path.clone());
                    }
                } else {
                    walk(&node.children, path, best);
                }
                path.pop();
            }
        }

        let mut best = None;
        walk(&self.children, &mut Vec::new(), &mut best);
        best
    }

    /// Non-deleted leaves other than `selected`.
    pub fn conflicts(&self, selected: &RevisionId) -> Vec<RevisionId> {
        self.leaves()
            .into_iter()
            .filter(|leaf| leaf.status != RevisionStatus::Deleted && &leaf.rev != selected)
            .map(|leaf| leaf.rev.clone())
            .collect()
    }

    /// Insert a branch given oldest first.
    ///
    /// The branch is anchored on its newest revision already in the tree,
    /// so a partial history never duplicates a node. Unseen revisions are
    /// prepended to their level. A `missing` node is upgraded when the
    /// branch brings a real status for it. Returns whether the newest
    /// revision of the branch was created.
    pub fn graft(&mut self, branch: &[RevisionInfo]) -> bool {
        let mut full: Vec<RevisionInfo> = Vec::new();
        let rest = match branch.iter().rposition(|info| self.contains(&info.rev)) {
            Some(anchor) => {
                if let Some(path) = self.path(&branch[anchor].rev) {
                    full.extend(path.iter().map(|node| RevisionInfo {
                        rev: node.rev.clone(),
                        status: node.status,
                    }));
                }
                if let Some(last) = full.last_mut() {
                    last.status = branch[anchor].status;
                }
                &branch[anchor + 1..]
            }
            None => branch,
        };
        full.extend_from_slice(rest);

        let mut level = &mut self.children;
        let mut created = false;
        for info in &full {
            let index = match level.iter().position(|node| node.rev == info.rev) {
                Some(i) => {
                    let node = &mut level[i];
                    if node.status == RevisionStatus::Missing && info.status != RevisionStatus::Missing {
                        node.status = info.status;
                    }
                    created = false;
                    i
                }
                None => {
                    level.insert(0, Node::new(info.rev.clone(), info.status));
                    created = true;
                    0
                }
            };
            level = &mut level[index].children;
        }
        created
    }
}

/// `_revisions` for a root-to-node path.
pub fn history(path: &[&Node]) -> RevisionHistory {
    RevisionHistory::from_path(path.iter().map(|node| &node.rev))
}

/// `_revs_info` for a root-to-node path, newest first.
pub fn revs_info(path: &[&Node]) -> Vec<RevisionInfo> {
    path.iter()
        .rev()
        .map(|node| RevisionInfo {
            rev: node.rev.clone(),
            status: node.status,
        })
        .collect()
}
