use std::collections::HashMap;

use log::{info, trace, warn};
use strata_backend::{
    Cmd, DrawIndexedIndirectCommand, GPUBufferUsage, GPUIndexedBufferType, GpuDevice,
};

use crate::{
    buffer_pool::BufferPool,
    config::{IndexAddressing, RendererConfig},
    culling::{gather_visible, VisibilityPredicate},
    error::RenderError,
    flatten::StreamKind,
    growable::GrowableBuffer,
    indirect::{CmdRef, CommandBuilder, IndirectCommandSet, VertexBinding},
    scene::{MeshNode, NodeId, SceneSource},
};

/// Pages, draw commands and visible command buffers of one stream.
pub struct GeometryStream<D: GpuDevice> {
    kind: StreamKind,
    nodes: Vec<MeshNode>,
    pool: BufferPool<D>,
    command_sets: Vec<IndirectCommandSet>,
    /// One per page, indexed like `command_sets`.
    indirect_buffers: Vec<GrowableBuffer<D>>,
    cmd_map: HashMap<NodeId, CmdRef>,
    bindings: HashMap<NodeId, VertexBinding>,
    deferred: Vec<NodeId>,
    scratch: Vec<Vec<DrawIndexedIndirectCommand>>,
    visible: Vec<usize>,
    drawn: Vec<NodeId>,
}

impl<D: GpuDevice> GeometryStream<D> {
    pub fn new(kind: StreamKind, config: &RendererConfig) -> Self {
        GeometryStream {
            kind,
            nodes: Vec::new(),
            pool: BufferPool::new(kind, config.page_vertex_bytes, config.page_index_bytes),
            command_sets: Vec::new(),
            indirect_buffers: Vec::new(),
            cmd_map: HashMap::new(),
            bindings: HashMap::new(),
            deferred: Vec::new(),
            scratch: Vec::new(),
            visible: Vec::new(),
            drawn: Vec::new(),
        }
    }

    /// Repacks `nodes` into fresh pages and rebuilds their draw commands.
    ///
    /// The node at position `i` draws with `first_instance_base + i`. On
    /// error the copies staged so far are flushed and the stream is left
    /// empty.
    pub fn rebuild(
        &mut self,
        device: &D,
        nodes: &[MeshNode],
        first_instance_base: u32,
        source: &impl SceneSource,
        addressing: IndexAddressing,
    ) -> Result<(), RenderError> {
        let result = self.build(device, nodes, first_instance_base, source, addressing);
        if result.is_err() {
            // staged copies still target the pages about to be dropped
            if let Err(err) = device.flush_uploads() {
                warn!("flushing uploads of a failed {} rebuild: {}", self.kind, err);
            }
            self.clear();
        }
        result
    }

    fn build(
        &mut self,
        device: &D,
        nodes: &[MeshNode],
        first_instance_base: u32,
        source: &impl SceneSource,
        addressing: IndexAddressing,
    ) -> Result<(), RenderError> {
        let mut builder = CommandBuilder::new(device, &mut self.pool, self.kind, addressing);
        for (position, node) in nodes.iter().enumerate() {
            let first_instance = u32::try_from(position)
                .ok()
                .and_then(|position| first_instance_base.checked_add(position))
                .ok_or_else(|| RenderError::OffsetOverflow {
                    mesh: node.name.clone(),
                    stream: self.kind,
                })?;
            let mesh = node.mesh.and_then(|mesh| source.mesh(mesh));
            builder.add_node(node, mesh, first_instance)?;
        }
        let built = builder.finish();
        device.flush_uploads()?;

        for (page, set) in built.command_sets.iter().enumerate() {
            if page == self.indirect_buffers.len() {
                self.indirect_buffers.push(GrowableBuffer::new(
                    format!("{}_indirect({})", self.kind, page),
                    GPUBufferUsage::INDIRECT_BUFFER | GPUBufferUsage::STORAGE_BUFFER,
                ));
            }
            self.indirect_buffers[page].write(device, bytemuck::cast_slice(set.commands()))?;
        }

        self.nodes = nodes.to_vec();
        self.scratch = vec![Vec::new(); built.command_sets.len()];
        self.command_sets = built.command_sets;
        self.cmd_map = built.cmd_map;
        self.bindings = built.bindings;
        self.deferred = built.deferred;
        self.visible.clear();
        self.drawn.clear();

        info!(
            "{} stream: {} nodes in {} pages, {} waiting for geometry",
            self.kind,
            self.nodes.len(),
            self.pool.page_count(),
            self.deferred.len()
        );
        Ok(())
    }

    /// True when a node skipped at rebuild now has geometry.
    pub fn has_ready_deferred(&self, source: &impl SceneSource) -> bool {
        !self.deferred.is_empty()
            && self
                .nodes
                .iter()
                .filter(|node| !self.cmd_map.contains_key(&node.id))
                .any(|node| {
                    node.mesh
                        .and_then(|mesh| source.mesh(mesh))
                        .map_or(false, |mesh| mesh.is_drawable())
                })
    }

    /// Runs `predicate` over the cached nodes and writes the visible
    /// commands to the front of each page's indirect buffer.
    ///
    /// Every page's visible count is reset, including pages with nothing
    /// visible. Returns the total visible count.
    pub fn refill_visible<P: VisibilityPredicate + ?Sized>(
        &mut self,
        device: &D,
        predicate: &mut P,
        source: &impl SceneSource,
    ) -> Result<u32, RenderError> {
        self.visible.clear();
        predicate.select(self.kind, &self.nodes, &mut self.visible);

        gather_visible(
            &self.nodes,
            &self.visible,
            &self.cmd_map,
            &self.command_sets,
            source,
            &mut self.scratch,
            &mut self.drawn,
        );

        let mut total = 0;
        for (page, list) in self.scratch.iter().enumerate() {
            self.command_sets[page].set_visible_count(list.len());
            if !list.is_empty() {
                self.indirect_buffers[page].write(device, bytemuck::cast_slice(list))?;
            }
            total += list.len() as u32;
        }

        trace!(
            "{} stream: {} of {} nodes visible",
            self.kind,
            total,
            self.nodes.len()
        );
        Ok(total)
    }

    /// Records one indirect draw per page with visible commands. Returns the
    /// number of draws recorded.
    pub fn draw(&self, device: &D, cmd: Cmd) -> usize {
        let mut draws = 0;
        for (page, set) in self.command_sets.iter().enumerate() {
            if set.visible_count() == 0 {
                continue;
            }
            let (Some(buffers), Some(indirect)) =
                (self.pool.page(page), self.indirect_buffer(page))
            else {
                continue;
            };

            device.bind_vertex_buffer(cmd, buffers.vertex.buffer(), 0);
            device.bind_index_buffer(cmd, buffers.index.buffer(), 0, GPUIndexedBufferType::U32);
            device.draw_indexed_indirect(
                cmd,
                indirect,
                0,
                set.visible_count(),
                DrawIndexedIndirectCommand::STRIDE,
            );
            draws += 1;
        }
        draws
    }

    /// Issues the visible commands of the last refill one indexed draw at a
    /// time, binding each page once. Returns the number of draws recorded.
    pub fn draw_direct(&self, device: &D, cmd: Cmd) -> usize {
        let mut draws = 0;
        for (page, list) in self.scratch.iter().enumerate() {
            if list.is_empty() {
                continue;
            }
            let Some(buffers) = self.pool.page(page) else {
                continue;
            };

            device.bind_vertex_buffer(cmd, buffers.vertex.buffer(), 0);
            device.bind_index_buffer(cmd, buffers.index.buffer(), 0, GPUIndexedBufferType::U32);
            for command in list {
                device.draw_indexed(
                    cmd,
                    command.index_count,
                    command.instance_count,
                    command.first_index,
                    command.vertex_offset,
                    command.first_instance,
                );
            }
            draws += list.len();
        }
        draws
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn nodes(&self) -> &[MeshNode] {
        &self.nodes
    }

    pub fn pool(&self) -> &BufferPool<D> {
        &self.pool
    }

    pub fn command_sets(&self) -> &[IndirectCommandSet] {
        &self.command_sets
    }

    pub fn indirect_buffer(&self, page: usize) -> Option<&D::Buffer> {
        self.indirect_buffers.get(page).and_then(GrowableBuffer::buffer)
    }

    pub fn cmd_ref(&self, node: NodeId) -> Option<CmdRef> {
        self.cmd_map.get(&node).copied()
    }

    pub fn binding(&self, node: NodeId) -> Option<VertexBinding> {
        self.bindings.get(&node).copied()
    }

    /// Nodes whose mesh had no geometry at the last rebuild.
    pub fn deferred(&self) -> &[NodeId] {
        &self.deferred
    }

    /// Nodes whose commands were gathered by the last refill.
    pub fn drawn(&self) -> &[NodeId] {
        &self.drawn
    }

    pub fn visible_count(&self) -> u32 {
        self.command_sets.iter().map(IndirectCommandSet::visible_count).sum()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.pool.clear();
        self.command_sets.clear();
        self.indirect_buffers.clear();
        self.cmd_map.clear();
        self.bindings.clear();
        self.deferred.clear();
        self.scratch.clear();
        self.visible.clear();
        self.drawn.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        culling::AllVisible,
        mesh::{MeshData, Vertex},
        scene::{MeshId, OwnerId, SceneTables},
    };
    use strata_backend::host::HostDevice;

    // pages hold two triangles
    fn setup() -> (HostDevice, SceneTables, Vec<MeshNode>, GeometryStream<HostDevice>) {
        let mut tables = SceneTables::new();
        let mut nodes = Vec::new();
        for i in 0..5u32 {
            tables.insert_mesh(
                MeshId(i),
                MeshData::new(format!("m{i}"), vec![Vertex::default(); 3], vec![0, 1, 2]),
            );
            nodes.push(
                MeshNode::new(NodeId(i as u64), format!("n{i}"), OwnerId(0)).with_mesh(MeshId(i)),
            );
        }
        let config = RendererConfig::default().with_page_size(6 * Vertex::STRIDE, 1024);
        let stream = GeometryStream::new(StreamKind::Static, &config);
        (HostDevice::new(), tables, nodes, stream)
    }

    #[test]
    fn rebuild_prefills_one_indirect_buffer_per_page() {
        let (device, tables, nodes, mut stream) = setup();
        stream
            .rebuild(&device, &nodes, 7, &tables, IndexAddressing::PageRebased)
            .unwrap();

        assert_eq!(stream.pool().page_count(), 3);
        assert_eq!(stream.command_sets().len(), 3);
        let prefilled = stream
            .indirect_buffer(1)
            .unwrap()
            .read::<DrawIndexedIndirectCommand>(0, 2);
        assert_eq!(prefilled, stream.command_sets()[1].commands());
        assert_eq!(prefilled[1].first_instance, 10);
        assert_eq!(device.pending_copies(), 0);
    }

    #[test]
    fn refill_resets_pages_that_lost_their_nodes() {
        let (device, tables, nodes, mut stream) = setup();
        stream
            .rebuild(&device, &nodes, 0, &tables, IndexAddressing::PageRebased)
            .unwrap();

        assert_eq!(stream.refill_visible(&device, &mut AllVisible, &tables).unwrap(), 5);
        let counts: Vec<u32> = stream.command_sets().iter().map(|s| s.visible_count()).collect();
        assert_eq!(counts, vec![2, 2, 1]);

        let mut first_only = |node: &MeshNode| node.id == NodeId(0) || node.id == NodeId(3);
        assert_eq!(stream.refill_visible(&device, &mut first_only, &tables).unwrap(), 2);
        let counts: Vec<u32> = stream.command_sets().iter().map(|s| s.visible_count()).collect();
        assert_eq!(counts, vec![1, 1, 0]);
        assert_eq!(stream.drawn(), &[NodeId(0), NodeId(3)]);

        // node 3 sits in slot 1 of page 1 but is compacted to the front
        let front = stream
            .indirect_buffer(1)
            .unwrap()
            .read::<DrawIndexedIndirectCommand>(0, 1)[0];
        assert_eq!(front.first_instance, 3);
    }

    #[test]
    fn draws_only_pages_with_visible_commands() {
        let (device, tables, nodes, mut stream) = setup();
        stream
            .rebuild(&device, &nodes, 0, &tables, IndexAddressing::PageRebased)
            .unwrap();

        let mut last = |node: &MeshNode| node.id == NodeId(4);
        stream.refill_visible(&device, &mut last, &tables).unwrap();
        assert_eq!(stream.draw(&device, Cmd(0)), 1);

        let draws = device.take_draws();
        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].indirect_buffer, "static_indirect(2)");
        assert_eq!(draws[0].vertex_buffer.as_deref(), Some("static_vertices(2)"));
        assert_eq!(draws[0].index_buffer.as_deref(), Some("static_indices(2)"));
        assert_eq!(draws[0].draw_count, 1);
        assert_eq!(draws[0].stride, 20);
    }

    #[test]
    fn direct_draws_match_the_indirect_commands() {
        let (device, tables, nodes, mut stream) = setup();
        stream
            .rebuild(&device, &nodes, 3, &tables, IndexAddressing::CommandOffset)
            .unwrap();

        let mut skip_n2 = |node: &MeshNode| node.id != NodeId(2);
        stream.refill_visible(&device, &mut skip_n2, &tables).unwrap();
        assert_eq!(stream.draw(&device, Cmd(0)), 3);
        assert_eq!(stream.draw_direct(&device, Cmd(0)), 4);

        let indirect: Vec<DrawIndexedIndirectCommand> = device
            .take_draws()
            .into_iter()
            .flat_map(|draw| draw.commands)
            .collect();
        let direct = device.take_direct_draws();
        let direct_commands: Vec<DrawIndexedIndirectCommand> =
            direct.iter().map(|draw| draw.command).collect();
        assert_eq!(direct_commands, indirect);

        // node 3 is the only visible node of page 1
        assert_eq!(direct[1].vertex_buffer.as_deref(), Some("static_vertices(0)"));
        assert_eq!(direct[2].vertex_buffer.as_deref(), Some("static_vertices(1)"));
        assert_eq!(direct[2].command.first_instance, 6);
        assert_eq!(direct[3].command.vertex_offset, 0);
    }

    #[test]
    fn deferred_nodes_report_when_their_geometry_arrives() {
        let (device, mut tables, nodes, mut stream) = setup();
        tables.mesh_mut(MeshId(2)).unwrap().indices.clear();
        stream
            .rebuild(&device, &nodes, 0, &tables, IndexAddressing::PageRebased)
            .unwrap();

        assert_eq!(stream.deferred(), &[NodeId(2)]);
        assert!(!stream.has_ready_deferred(&tables));

        tables.mesh_mut(MeshId(2)).unwrap().indices = vec![0, 1, 2];
        assert!(stream.has_ready_deferred(&tables));
    }

    #[test]
    fn failed_rebuild_leaves_the_stream_empty() {
        let (device, mut tables, nodes, mut stream) = setup();
        stream
            .rebuild(&device, &nodes, 0, &tables, IndexAddressing::PageRebased)
            .unwrap();

        tables.insert_mesh(
            MeshId(4),
            MeshData::new("huge", vec![Vertex::default(); 7], vec![0, 1, 2]),
        );
        let err = stream.rebuild(&device, &nodes, 0, &tables, IndexAddressing::PageRebased);

        assert!(matches!(err, Err(RenderError::PageCapacity { .. })));
        // nodes 0 to 3 were staged before node 4 failed
        assert_eq!(device.pending_copies(), 0);
        assert!(stream.nodes().is_empty());
        assert_eq!(stream.pool().page_count(), 0);
        assert_eq!(stream.refill_visible(&device, &mut AllVisible, &tables).unwrap(), 0);
    }
}
