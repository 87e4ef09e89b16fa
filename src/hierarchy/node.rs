//! Tile tree storage.

use crate::config::Refine;
use crate::types::UnitId;
use crate::volume::BoundingVolume;
use std::fmt;

/// Level of detail, LOD3 finest to LOD0 coarsest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lod(u8);

impl Lod {
    pub const LOD0: Lod = Lod(0);
    pub const LOD1: Lod = Lod(1);
    pub const LOD2: Lod = Lod(2);
    pub const LOD3: Lod = Lod(3);

    /// Levels above 3 are clamped.
    pub fn new(level: u8) -> Self {
        Lod(level.min(3))
    }

    pub fn level(self) -> u8 {
        self.0
    }

    /// LOD from a node code: `max` with no content marker, then one level
    /// lower per digit after the `C`, never below `min`.
    pub fn from_code(code: &str, min: Lod, max: Lod) -> Self {
        let depth = code
            .find('C')
            .map(|c| code[c + 1..].chars().filter(char::is_ascii_digit).count())
            .unwrap_or(0);
        let level = (max.0 as usize).saturating_sub(depth) as u8;
        Lod(level.max(min.0).min(max.0))
    }

    /// Lower bound on the geometric error of content at this level, metres.
    pub fn error_floor(self) -> f64 {
        match self.0 {
            3 => 0.0,
            2 => 4.0,
            1 => 16.0,
            _ => 64.0,
        }
    }

    /// Fraction of a shuffled point cell kept at this level.
    pub fn sample_fraction(self) -> f64 {
        match self.0 {
            3 => 1.0,
            2 => 0.5,
            1 => 0.25,
            _ => 0.125,
        }
    }
}

impl fmt::Display for Lod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LOD{}", self.0)
    }
}

/// Index of a node in its [`NodeArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// Units whose geometry is written into one content file.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentRef {
    pub code: String,
    pub lod: Lod,
    pub units: Vec<UnitId>,
    /// Set once the content file has been written.
    pub uri: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub code: String,
    pub parent: Option<NodeId>,
    pub bounding_volume: BoundingVolume,
    pub geometric_error: f64,
    pub refine: Refine,
    pub children: Vec<NodeId>,
    pub content: Option<ContentRef>,
}

impl Node {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Flat node storage; parents are indices and `children` is the only
/// ownership path.
#[derive(Debug, Clone, Default)]
pub struct NodeArena {
    nodes: Vec<Node>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    pub fn get(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    /// Depth-first pre-order walk from `root`.
    pub fn descendants(&self, root: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.get(id).children.iter().rev().copied());
        }
        order
    }
}

/// A built tile tree.
#[derive(Debug, Clone)]
pub struct Tileset {
    pub arena: NodeArena,
    pub root: NodeId,
}

impl Tileset {
    pub fn root(&self) -> &Node {
        self.arena.get(self.root)
    }

    /// Nodes carrying content, in tree order.
    pub fn content_nodes(&self) -> Vec<NodeId> {
        self.arena
            .descendants(self.root)
            .into_iter()
            .filter(|id| self.arena.get(*id).content.is_some())
            .collect()
    }

    pub fn leaves(&self) -> Vec<NodeId> {
        self.arena
            .descendants(self.root)
            .into_iter()
            .filter(|id| self.arena.get(*id).is_leaf())
            .collect()
    }

    /// Greatest depth below the root.
    pub fn depth(&self) -> usize {
        self.leaves()
            .into_iter()
            .map(|mut id| {
                let mut depth = 0;
                while let Some(parent) = self.arena.get(id).parent {
                    depth += 1;
                    id = parent;
                }
                depth
            })
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lod_from_code() {
        let (min, max) = (Lod::LOD0, Lod::LOD3);
        assert_eq!(Lod::from_code("R21", min, max), Lod::LOD3);
        assert_eq!(Lod::from_code("R2C", min, max), Lod::LOD3);
        assert_eq!(Lod::from_code("R2C0", min, max), Lod::LOD2);
        assert_eq!(Lod::from_code("RC31", min, max), Lod::LOD1);
        assert_eq!(Lod::from_code("RC3120", min, max), Lod::LOD0);
        assert_eq!(Lod::from_code("RC31", Lod::LOD2, max), Lod::LOD2);
        assert_eq!(Lod::from_code("RC", min, Lod::LOD2), Lod::LOD2);
    }

    #[test]
    fn test_lod_tables() {
        assert_eq!(Lod::LOD2.error_floor(), 4.0);
        assert_eq!(Lod::LOD0.error_floor(), 64.0);
        assert_eq!(Lod::LOD1.sample_fraction(), 0.25);
        assert_eq!(Lod::new(9), Lod::LOD3);
        assert_eq!(Lod::LOD1.to_string(), "LOD1");
    }

    #[test]
    fn test_arena_walk() {
        let mut arena = NodeArena::new();
        let node = |code: &str, parent| Node {
            code: code.to_string(),
            parent,
            bounding_volume: BoundingVolume::point(0.0, 0.0, 0.0),
            geometric_error: 0.0,
            refine: Refine::Replace,
            children: Vec::new(),
            content: None,
        };
        let root = arena.push(node("R", None));
        let a = arena.push(node("R0", Some(root)));
        let b = arena.push(node("R1", Some(root)));
        let c = arena.push(node("R00", Some(a)));
        arena.get_mut(root).children = vec![a, b];
        arena.get_mut(a).children = vec![c];

        assert_eq!(arena.descendants(root), vec![root, a, c, b]);
        let tileset = Tileset { arena, root };
        assert_eq!(tileset.leaves(), vec![c, b]);
        assert_eq!(tileset.depth(), 2);
    }
}
