//! Traversal of the on-flash B+tree index.
//!
//! Index nodes hold sorted branches; level-0 index nodes point at leaves (inodes, directory
//! entries, data), higher levels at other index nodes exactly one level down. A [Range] cursor
//! keeps the path from the root to its current position on an explicit stack, so neither the
//! descent nor the stepping from one subtree to the next recurses.

use super::key::{Key, KeyKind};
use super::node::{decode_at, Branch, IndexNode, Node, NodeBody};
use super::Location;
use crate::error::{Error, Result, Warning};
use crate::image::ImageSource;
use crate::trace::Trace;
use crate::ubi::Volume;

/// Maximum height of the index
pub const MAX_LEVELS: usize = 512;

/// The index of one UBIFS volume, rooted at a known index node
#[derive(Debug)]
pub struct IndexTree<'a, S> {
    volume: Volume<'a, S>,
    root: Location,
    root_len: u32,
}

impl<S> Clone for IndexTree<'_, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for IndexTree<'_, S> {}

impl<'a, S: ImageSource> IndexTree<'a, S> {
    /// `root_len` may be 0 if the length of the root node is not known.
    pub fn new(volume: Volume<'a, S>, root: Location, root_len: u32) -> Self {
        Self {
            volume,
            root,
            root_len,
        }
    }

    pub fn volume(&self) -> Volume<'a, S> {
        self.volume
    }

    pub fn root(&self) -> Location {
        self.root
    }

    /// Read the index node a branch (or the master node) points at, and check it fits the tree:
    /// it must be an index node, of the recorded length, one level below its parent.
    fn read_index(
        &self,
        loc: Location,
        len: u32,
        level: Option<u16>,
        trace: &mut Trace,
    ) -> Result<IndexNode> {
        trace.visit()?;
        let node = decode_at(&self.volume, loc)?;
        check_index_shape(&node, len, level)?;
        match node.body {
            NodeBody::Index(idx) => Ok(idx),
            _ => Err(Error::structural(loc, "index node expected")),
        }
    }

    fn read_root(&self, trace: &mut Trace) -> Result<IndexNode> {
        let root = self.read_index(self.root, self.root_len, None, trace)?;
        if usize::from(root.level) >= MAX_LEVELS {
            return Err(Error::structural(
                self.root,
                format!("index root claims level {}", root.level),
            ));
        }
        Ok(root)
    }

    /// Descend into the child of an index node at `level`
    fn read_child(&self, branch: &Branch, level: u16, trace: &mut Trace) -> Result<IndexNode> {
        if branch.len == 0 {
            return Err(Error::structural(
                branch.loc,
                "zero-length branch to an index node",
            ));
        }
        self.read_index(branch.loc, branch.len, Some(level - 1), trace)
    }

    /// Read the leaf a level-0 branch points at. The leaf must carry the branch's key.
    pub fn read_leaf(&self, branch: &Branch, trace: &mut Trace) -> Result<Node> {
        trace.visit()?;
        let node = decode_at(&self.volume, branch.loc)?;

        if branch.len != 0 && node.header.len != branch.len {
            return Err(Error::structural(
                branch.loc,
                format!(
                    "branch records length {}, node is {}",
                    branch.len, node.header.len
                ),
            ));
        }
        match node.key() {
            Some(key) if key == branch.key => Ok(node),
            Some(key) => Err(Error::structural(
                branch.loc,
                format!("leaf has key {key}, branch says {}", branch.key),
            )),
            None => Err(Error::structural(
                branch.loc,
                format!("{} node where a leaf was expected", node.header.node_type),
            )),
        }
    }

    /// Every leaf branch with key `>= start`, in key order
    pub fn range<'t>(&self, start: Key, trace: &'t mut Trace) -> Range<'a, 't, S> {
        Range {
            tree: *self,
            trace,
            stack: Vec::new(),
            state: State::Unstarted(start),
        }
    }

    /// Every leaf belonging to inode `inum`: its inode node, data, entries
    pub fn children_of<'t>(&self, inum: u32, trace: &'t mut Trace) -> Children<'a, 't, S> {
        Children {
            range: self.range(Key::inode(inum), trace),
            inum,
            kind: None,
        }
    }

    /// The leaves of one kind belonging to inode `inum`
    pub fn entries<'t>(&self, inum: u32, kind: KeyKind, trace: &'t mut Trace) -> Children<'a, 't, S> {
        Children {
            range: self.range(Key::first(inum, kind), trace),
            inum,
            kind: Some(kind),
        }
    }

    /// The leaf branch with exactly this key.
    ///
    /// With colliding keys the first such branch is returned; see [IndexTree::lookup_all].
    pub fn lookup(&self, key: Key, trace: &mut Trace) -> Result<Branch> {
        match self.range(key, trace).next() {
            Some(Ok(branch)) if branch.key == key => Ok(branch),
            Some(Err(e)) => Err(e),
            _ => Err(Error::NotFound(format!("key {key}"))),
        }
    }

    /// Every leaf branch with exactly this key, in index order
    pub fn lookup_all(&self, key: Key, trace: &mut Trace) -> Result<Vec<Branch>> {
        let mut found = Vec::new();
        for branch in self.range(key, trace) {
            let branch = branch?;
            if branch.key != key {
                break;
            }
            found.push(branch);
        }
        Ok(found)
    }

    /// Visit every node reachable from the root, depth first in key order: index nodes before
    /// their children.
    ///
    /// Only the root must be readable. Damaged nodes below it are handed to `visitor` as
    /// warnings (and recorded in `trace`), and their subtrees are skipped.
    pub fn for_each_node<F>(&self, trace: &mut Trace, mut visitor: F) -> Result<()>
    where
        F: FnMut(&Visit),
    {
        let root = self.read_root(trace)?;
        let mut stack = Vec::new();
        push_children(&mut stack, &root, 1);
        visitor(&Visit {
            depth: 0,
            loc: self.root,
            branch: None,
            node: Ok(VisitNode::Index(root)),
        });

        while let Some(Pending {
            depth,
            branch,
            parent_level,
        }) = stack.pop()
        {
            let node = match parent_level {
                0 => self.read_leaf(&branch, trace).map(VisitNode::Leaf),
                level => self
                    .read_child(&branch, level, trace)
                    .map(VisitNode::Index),
            };

            let node = match node {
                Ok(node) => {
                    if let VisitNode::Index(idx) = &node {
                        push_children(&mut stack, idx, depth + 1);
                    }
                    Ok(node)
                }
                Err(e) => {
                    let warning = Warning::from(&e);
                    trace.tolerate(e)?;
                    Err(warning)
                }
            };

            visitor(&Visit {
                depth,
                loc: branch.loc,
                branch: Some(branch),
                node,
            });
        }

        Ok(())
    }
}

/// A branch waiting to be visited by [IndexTree::for_each_node]
struct Pending {
    depth: usize,
    branch: Branch,
    parent_level: u16,
}

/// Queue the children of `idx` so that the first branch is popped first
fn push_children(stack: &mut Vec<Pending>, idx: &IndexNode, depth: usize) {
    stack.extend(idx.branches.iter().rev().map(|&branch| Pending {
        depth,
        branch,
        parent_level: idx.level,
    }));
}

fn check_index_shape(node: &Node, len: u32, level: Option<u16>) -> Result<()> {
    let NodeBody::Index(idx) = &node.body else {
        return Err(Error::structural(
            node.loc,
            format!(
                "{} node where an index node was expected",
                node.header.node_type
            ),
        ));
    };

    if len != 0 && node.header.len != len {
        return Err(Error::structural(
            node.loc,
            format!("branch records length {len}, node is {}", node.header.len),
        ));
    }
    if let Some(level) = level {
        if idx.level != level {
            return Err(Error::structural(
                node.loc,
                format!("index node at level {}, expected {level}", idx.level),
            ));
        }
    }
    Ok(())
}

/// A node seen by [IndexTree::for_each_node]
#[derive(Debug)]
pub struct Visit {
    /// 0 for the root
    pub depth: usize,
    pub loc: Location,

    /// The branch that led here, `None` for the root
    pub branch: Option<Branch>,
    pub node: std::result::Result<VisitNode, Warning>,
}

#[derive(Debug)]
pub enum VisitNode {
    Index(IndexNode),
    Leaf(Node),
}

#[derive(Debug)]
struct Frame {
    node: IndexNode,
    pos: usize,
}

#[derive(Debug)]
enum State {
    Unstarted(Key),
    Running,
    Done,
}

/// Cursor over leaf branches in key order. Fuses after the first error.
#[derive(Debug)]
pub struct Range<'a, 't, S> {
    tree: IndexTree<'a, S>,
    trace: &'t mut Trace,

    /// Root first; every frame but the last is positioned at the branch leading to the next.
    stack: Vec<Frame>,
    state: State,
}

impl<'a, 't, S: ImageSource> Range<'a, 't, S> {
    /// The trace this cursor charges its reads to, so the caller can read leaves with it too
    pub fn trace(&mut self) -> &mut Trace {
        self.trace
    }

    pub fn tree(&self) -> IndexTree<'a, S> {
        self.tree
    }

    fn push(&mut self, node: IndexNode, pos: usize) -> Result<()> {
        if self.stack.len() >= MAX_LEVELS {
            return Err(Error::structural(
                self.tree.root,
                format!("index deeper than {MAX_LEVELS} levels"),
            ));
        }
        self.stack.push(Frame { node, pos });
        Ok(())
    }

    /// Position at the first leaf branch with key `>= key`
    fn seek(&mut self, key: Key) -> Result<()> {
        let root = self.tree.read_root(self.trace)?;
        self.push(root, 0)?;

        loop {
            let Some(top) = self.stack.last_mut() else {
                return Ok(());
            };
            let first_not_below = top.node.branches.partition_point(|b| b.key < key);

            if top.node.level == 0 {
                top.pos = first_not_below;
                break;
            }

            // Keys equal to `key` may end the previous subtree, so descend into the last branch
            // strictly below it
            top.pos = first_not_below.saturating_sub(1);
            let level = top.node.level;
            let branch = top.node.branches[top.pos];

            let child = self.tree.read_child(&branch, level, self.trace)?;
            self.push(child, 0)?;
        }

        self.settle()
    }

    /// Move the cursor forward until the bottom frame is a level-0 node positioned on a branch,
    /// climbing out of exhausted nodes and descending into the leftmost path of the next subtree.
    fn settle(&mut self) -> Result<()> {
        loop {
            let Some(top) = self.stack.last() else {
                return Ok(());
            };

            if top.pos >= top.node.branches.len() {
                self.stack.pop();
                if let Some(parent) = self.stack.last_mut() {
                    parent.pos += 1;
                }
                continue;
            }

            if top.node.level == 0 {
                return Ok(());
            }

            let level = top.node.level;
            let branch = top.node.branches[top.pos];
            let child = self.tree.read_child(&branch, level, self.trace)?;
            self.push(child, 0)?;
        }
    }

    fn step(&mut self) -> Result<Option<Branch>> {
        match std::mem::replace(&mut self.state, State::Running) {
            State::Unstarted(key) => self.seek(key)?,
            State::Running => {
                if let Some(top) = self.stack.last_mut() {
                    top.pos += 1;
                }
                self.settle()?;
            }
            State::Done => {
                self.state = State::Done;
                return Ok(None);
            }
        }

        Ok(self
            .stack
            .last()
            .and_then(|top| top.node.branches.get(top.pos))
            .copied())
    }
}

impl<S: ImageSource> Iterator for Range<'_, '_, S> {
    type Item = Result<Branch>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.step().transpose();
        if !matches!(item, Some(Ok(_))) {
            self.state = State::Done;
        }
        item
    }
}

/// The leaf branches of one inode, optionally of one kind
#[derive(Debug)]
pub struct Children<'a, 't, S> {
    range: Range<'a, 't, S>,
    inum: u32,
    kind: Option<KeyKind>,
}

impl<'a, 't, S: ImageSource> Children<'a, 't, S> {
    pub fn trace(&mut self) -> &mut Trace {
        self.range.trace()
    }

    pub fn tree(&self) -> IndexTree<'a, S> {
        self.range.tree()
    }
}

impl<S: ImageSource> Iterator for Children<'_, '_, S> {
    type Item = Result<Branch>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.range.next()?;
        if let Ok(branch) = &item {
            let belongs = branch.key.inum == self.inum
                && self.kind.map_or(true, |kind| branch.key.kind == kind);
            if !belongs {
                self.range.state = State::Done;
                return None;
            }
        }
        Some(item)
    }
}
