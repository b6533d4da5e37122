use std::{fmt, sync::Arc};

use crate::scene::{MeshNode, Renderable};

/// Which geometry stream a node is packed into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Static,
    Skinned,
}

impl StreamKind {
    pub const ALL: [StreamKind; 2] = [StreamKind::Static, StreamKind::Skinned];

    pub fn of(node: &MeshNode) -> Self {
        if node.has_skin() {
            StreamKind::Skinned
        } else {
            StreamKind::Static
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Static => write!(f, "static"),
            StreamKind::Skinned => write!(f, "skinned"),
        }
    }
}

/// Enabled, meshed nodes of a renderable set, split per stream and sorted
/// by name.
#[derive(Clone, Debug, Default)]
pub struct FlatNodes {
    pub static_nodes: Vec<MeshNode>,
    pub skinned_nodes: Vec<MeshNode>,
}

impl FlatNodes {
    pub fn nodes(&self, kind: StreamKind) -> &[MeshNode] {
        match kind {
            StreamKind::Static => &self.static_nodes,
            StreamKind::Skinned => &self.skinned_nodes,
        }
    }

    pub fn len(&self) -> usize {
        self.static_nodes.len() + self.skinned_nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn flatten(renderables: &[Renderable]) -> FlatNodes {
    let mut flat = FlatNodes::default();

    for node in renderables.iter().flat_map(|element| element.nodes.iter()) {
        if !node.enabled || node.mesh.is_none() {
            continue;
        }
        match StreamKind::of(node) {
            StreamKind::Static => flat.static_nodes.push(node.clone()),
            StreamKind::Skinned => flat.skinned_nodes.push(node.clone()),
        }
    }

    // stable: equal names keep insertion order
    flat.static_nodes.sort_by(|a, b| a.name.cmp(&b.name));
    flat.skinned_nodes.sort_by(|a, b| a.name.cmp(&b.name));

    flat
}

/// The renderable set the current buffers were built from.
#[derive(Default)]
pub struct RenderableCache {
    cached: Vec<Renderable>,
}

impl RenderableCache {
    /// True when `renderables` holds the same elements, in the same order,
    /// as the cached set.
    pub fn matches(&self, renderables: &[Renderable]) -> bool {
        self.cached.len() == renderables.len()
            && self
                .cached
                .iter()
                .zip(renderables)
                .all(|(cached, incoming)| Arc::ptr_eq(cached, incoming))
    }

    pub fn store(&mut self, renderables: &[Renderable]) {
        self.cached.clear();
        self.cached.extend(renderables.iter().cloned());
    }

    pub fn clear(&mut self) {
        self.cached.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.cached.is_empty()
    }
}
