use std::collections::HashMap;

use log::warn;
use strata_backend::DrawIndexedIndirectCommand;

use crate::{
    flatten::StreamKind,
    indirect::{CmdRef, IndirectCommandSet},
    scene::{MeshNode, NodeId, SceneSource},
};

/// Frame visibility test over a stream's cached nodes.
///
/// Implementations push the positions of visible nodes into `visible` in
/// the order the nodes are given. Any `FnMut(&MeshNode) -> bool` is a
/// predicate.
pub trait VisibilityPredicate {
    fn select(&mut self, stream: StreamKind, nodes: &[MeshNode], visible: &mut Vec<usize>);
}

impl<F> VisibilityPredicate for F
where
    F: FnMut(&MeshNode) -> bool,
{
    fn select(&mut self, _stream: StreamKind, nodes: &[MeshNode], visible: &mut Vec<usize>) {
        for (i, node) in nodes.iter().enumerate() {
            if (self)(node) {
                visible.push(i);
            }
        }
    }
}

/// Treats every node as visible.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllVisible;

impl VisibilityPredicate for AllVisible {
    fn select(&mut self, _stream: StreamKind, nodes: &[MeshNode], visible: &mut Vec<usize>) {
        visible.extend(0..nodes.len());
    }
}

/// Copies the already built commands of the visible, drawable nodes into
/// the scratch list of their page.
///
/// Nodes are skipped when their owner is disposed or inactive, when their
/// mesh has no geometry, or when no command was built for them. Returns the
/// number of commands gathered; `drawn` receives the ids of their nodes.
pub fn gather_visible(
    nodes: &[MeshNode],
    candidates: &[usize],
    cmd_map: &HashMap<NodeId, CmdRef>,
    command_sets: &[IndirectCommandSet],
    source: &impl SceneSource,
    scratch: &mut [Vec<DrawIndexedIndirectCommand>],
    drawn: &mut Vec<NodeId>,
) -> usize {
    scratch.iter_mut().for_each(Vec::clear);
    drawn.clear();

    for &position in candidates {
        let Some(node) = nodes.get(position) else {
            continue;
        };
        if !source.owner_state(node.owner).is_drawable() {
            continue;
        }
        let has_geometry = node
            .mesh
            .and_then(|mesh| source.mesh(mesh))
            .map_or(false, |mesh| mesh.is_drawable());
        if !has_geometry {
            continue;
        }

        let Some(cmd_ref) = cmd_map.get(&node.id) else {
            warn!("no command built for node '{}', skipping", node.name);
            continue;
        };
        let command = command_sets
            .get(cmd_ref.page)
            .and_then(|set| set.get(cmd_ref.slot));
        let (Some(command), Some(list)) = (command, scratch.get_mut(cmd_ref.page)) else {
            warn!("stale command reference for node '{}', skipping", node.name);
            continue;
        };

        list.push(*command);
        drawn.push(node.id);
    }

    drawn.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mesh::{MeshData, Vertex},
        scene::{MeshId, OwnerId, OwnerState, SceneTables},
    };

    fn command(first_instance: u32) -> DrawIndexedIndirectCommand {
        DrawIndexedIndirectCommand {
            index_count: 3,
            instance_count: 1,
            first_instance,
            ..Default::default()
        }
    }

    struct Fixture {
        nodes: Vec<MeshNode>,
        cmd_map: HashMap<NodeId, CmdRef>,
        command_sets: Vec<IndirectCommandSet>,
        tables: SceneTables,
    }

    // four nodes, two per page, all drawable
    fn fixture() -> Fixture {
        let mut tables = SceneTables::new();
        let mut nodes = Vec::new();
        let mut cmd_map = HashMap::new();

        for i in 0..4u32 {
            tables.insert_mesh(
                MeshId(i),
                MeshData::new(format!("m{i}"), vec![Vertex::default(); 3], vec![0, 1, 2]),
            );
            let node =
                MeshNode::new(NodeId(i as u64), format!("n{i}"), OwnerId(i)).with_mesh(MeshId(i));
            cmd_map.insert(
                node.id,
                CmdRef {
                    page: i as usize / 2,
                    slot: i as usize % 2,
                },
            );
            nodes.push(node);
        }
        let command_sets = vec![
            IndirectCommandSet::from_commands(vec![command(0), command(1)]),
            IndirectCommandSet::from_commands(vec![command(2), command(3)]),
        ];

        Fixture {
            nodes,
            cmd_map,
            command_sets,
            tables,
        }
    }

    fn run(
        f: &Fixture,
        candidates: &[usize],
    ) -> (Vec<Vec<DrawIndexedIndirectCommand>>, Vec<NodeId>) {
        let mut scratch = vec![Vec::new(); f.command_sets.len()];
        let mut drawn = Vec::new();
        gather_visible(
            &f.nodes,
            candidates,
            &f.cmd_map,
            &f.command_sets,
            &f.tables,
            &mut scratch,
            &mut drawn,
        );
        (scratch, drawn)
    }

    #[test]
    fn closures_are_order_preserving_predicates() {
        let f = fixture();
        let mut visible = Vec::new();
        let mut odd = |node: &MeshNode| node.id.0 % 2 == 1;
        odd.select(StreamKind::Static, &f.nodes, &mut visible);
        assert_eq!(visible, vec![1, 3]);

        visible.clear();
        AllVisible.select(StreamKind::Static, &f.nodes, &mut visible);
        assert_eq!(visible, vec![0, 1, 2, 3]);
    }

    #[test]
    fn gathers_commands_per_page() {
        let f = fixture();
        let (scratch, drawn) = run(&f, &[1, 2, 3]);

        assert_eq!(scratch[0], vec![command(1)]);
        assert_eq!(scratch[1], vec![command(2), command(3)]);
        assert_eq!(drawn, vec![NodeId(1), NodeId(2), NodeId(3)]);
    }

    #[test]
    fn skips_owners_that_cannot_draw() {
        let mut f = fixture();
        f.tables.set_owner_state(
            OwnerId(0),
            OwnerState {
                active: true,
                disposed: true,
            },
        );
        f.tables.set_owner_state(
            OwnerId(3),
            OwnerState {
                active: false,
                disposed: false,
            },
        );

        let (_, drawn) = run(&f, &[0, 1, 2, 3]);
        assert_eq!(drawn, vec![NodeId(1), NodeId(2)]);
    }

    #[test]
    fn skips_meshes_that_lost_their_indices() {
        let mut f = fixture();
        f.tables.mesh_mut(MeshId(2)).unwrap().indices.clear();

        let (scratch, drawn) = run(&f, &[0, 1, 2, 3]);
        assert_eq!(drawn.len(), 3);
        assert_eq!(scratch[1], vec![command(3)]);
    }

    #[test]
    fn skips_nodes_without_a_command() {
        let mut f = fixture();
        f.cmd_map.remove(&NodeId(1));
        f.cmd_map.insert(NodeId(2), CmdRef { page: 7, slot: 0 });

        let (_, drawn) = run(&f, &[0, 1, 2, 3, 99]);
        assert_eq!(drawn, vec![NodeId(0), NodeId(3)]);
    }
}
