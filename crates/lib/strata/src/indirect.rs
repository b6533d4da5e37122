use std::{collections::HashMap, mem};

use log::debug;
use strata_backend::{DrawIndexedIndirectCommand, GpuDevice};

use crate::{
    buffer_pool::{BufferPool, PageRegion},
    config::IndexAddressing,
    error::RenderError,
    flatten::StreamKind,
    mesh::{MeshData, Vertex},
    scene::{MeshNode, NodeId},
};

/// Where a node's draw command lives: page and slot within the page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CmdRef {
    pub page: usize,
    pub slot: usize,
}

/// Where a node's geometry was packed, in elements from the page start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexBinding {
    pub page: usize,
    pub first_vertex: u32,
    pub first_index: u32,
}

/// Draw commands of one page plus how many of them are visible this frame.
#[derive(Clone, Debug, Default)]
pub struct IndirectCommandSet {
    commands: Vec<DrawIndexedIndirectCommand>,
    visible_count: u32,
}

impl IndirectCommandSet {
    pub fn commands(&self) -> &[DrawIndexedIndirectCommand] {
        &self.commands
    }

    pub fn get(&self, slot: usize) -> Option<&DrawIndexedIndirectCommand> {
        self.commands.get(slot)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn visible_count(&self) -> u32 {
        self.visible_count
    }

    #[cfg(test)]
    pub(crate) fn from_commands(commands: Vec<DrawIndexedIndirectCommand>) -> Self {
        IndirectCommandSet {
            commands,
            visible_count: 0,
        }
    }

    fn push(&mut self, command: DrawIndexedIndirectCommand) -> usize {
        self.commands.push(command);
        self.commands.len() - 1
    }

    pub(crate) fn set_visible_count(&mut self, count: usize) {
        debug_assert!(count <= self.commands.len());
        self.visible_count = count.min(self.commands.len()) as u32;
    }
}

/// Everything a stream rebuild produces besides the filled pages.
#[derive(Debug, Default)]
pub struct BuiltCommands {
    /// One set per page, in page order.
    pub command_sets: Vec<IndirectCommandSet>,
    pub cmd_map: HashMap<NodeId, CmdRef>,
    pub bindings: HashMap<NodeId, VertexBinding>,
    /// Nodes whose mesh had no geometry yet.
    pub deferred: Vec<NodeId>,
}

struct PageCursor {
    page: usize,
    vertex_bytes: u64,
    index_bytes: u64,
    vertices: u32,
    indices: u32,
}

impl PageCursor {
    fn new(page: usize) -> Self {
        PageCursor {
            page,
            vertex_bytes: 0,
            index_bytes: 0,
            vertices: 0,
            indices: 0,
        }
    }
}

/// True when `running + count` would not fit in 32 bits.
pub fn offset_overflows(running: u32, count: u32) -> bool {
    running > u32::MAX - count
}

/// True when a command vertex offset covering `running + count` vertices
/// still fits in an `i32`.
fn vertex_offset_fits(running: u32, count: u32) -> bool {
    running
        .checked_add(count)
        .map_or(false, |end| end <= i32::MAX as u32)
}

/// Packs nodes of one stream into pages and emits their draw commands.
///
/// Nodes must be added in flattened order; each one lands in the current
/// page or, if it does not fit, in a freshly opened one.
pub struct CommandBuilder<'a, D: GpuDevice> {
    device: &'a D,
    pool: &'a mut BufferPool<D>,
    stream: StreamKind,
    addressing: IndexAddressing,
    cursor: Option<PageCursor>,
    built: BuiltCommands,
}

impl<'a, D: GpuDevice> CommandBuilder<'a, D> {
    /// Starts a rebuild. Pages left in `pool` are dropped.
    pub fn new(
        device: &'a D,
        pool: &'a mut BufferPool<D>,
        stream: StreamKind,
        addressing: IndexAddressing,
    ) -> Self {
        pool.clear();
        CommandBuilder {
            device,
            pool,
            stream,
            addressing,
            cursor: None,
            built: BuiltCommands::default(),
        }
    }

    /// Packs `mesh` for `node` and records its command.
    ///
    /// Returns `None` when the mesh has no geometry yet; the node is then
    /// remembered as deferred.
    pub fn add_node(
        &mut self,
        node: &MeshNode,
        mesh: Option<&MeshData>,
        first_instance: u32,
    ) -> Result<Option<CmdRef>, RenderError> {
        let mesh = match mesh {
            Some(mesh) if mesh.is_drawable() => mesh,
            _ => {
                debug!("{} node '{}' has no geometry yet", self.stream, node.name);
                self.built.deferred.push(node.id);
                return Ok(None);
            }
        };

        let label = if mesh.name.is_empty() {
            node.name.clone()
        } else {
            mesh.name.clone()
        };
        let stream = self.stream;
        let overflow = || RenderError::OffsetOverflow {
            mesh: label.clone(),
            stream,
        };

        let vertex_bytes = mesh.vertex_bytes();
        let index_bytes = mesh.index_bytes();
        let regions = [
            (PageRegion::Vertex, vertex_bytes),
            (PageRegion::Index, index_bytes),
        ];
        for (region, bytes) in regions {
            let capacity = self.pool.capacity(region);
            if bytes > capacity {
                return Err(RenderError::PageCapacity {
                    mesh: label.clone(),
                    stream,
                    region,
                    bytes,
                    capacity,
                });
            }
        }

        let vertex_count = u32::try_from(mesh.vertices.len()).map_err(|_| overflow())?;
        let index_count = u32::try_from(mesh.indices.len()).map_err(|_| overflow())?;

        let mut cursor = match self.cursor.take() {
            Some(cursor)
                if self.fits(&cursor, vertex_bytes, index_bytes, vertex_count, index_count) =>
            {
                cursor
            }
            _ => {
                let page = self.pool.open_new_page(self.device)?;
                self.built.command_sets.push(IndirectCommandSet::default());
                PageCursor::new(page)
            }
        };

        let rebased: Vec<u32>;
        let (indices, vertex_offset) = match self.addressing {
            IndexAddressing::PageRebased => {
                rebased = mesh
                    .indices
                    .iter()
                    .map(|index| index.checked_add(cursor.vertices))
                    .collect::<Option<Vec<u32>>>()
                    .ok_or_else(overflow)?;
                (rebased.as_slice(), 0)
            }
            IndexAddressing::CommandOffset => (
                mesh.indices.as_slice(),
                i32::try_from(cursor.vertices).map_err(|_| overflow())?,
            ),
        };

        let vertex_offset_bytes = self.pool.append(
            self.device,
            cursor.page,
            PageRegion::Vertex,
            bytemuck::cast_slice(&mesh.vertices),
            cursor.vertex_bytes,
        )?;
        let index_offset_bytes = self.pool.append(
            self.device,
            cursor.page,
            PageRegion::Index,
            bytemuck::cast_slice(indices),
            cursor.index_bytes,
        )?;

        let binding = VertexBinding {
            page: cursor.page,
            first_vertex: (vertex_offset_bytes / Vertex::STRIDE) as u32,
            first_index: (index_offset_bytes / mem::size_of::<u32>() as u64) as u32,
        };

        let command = DrawIndexedIndirectCommand {
            index_count,
            instance_count: 1,
            first_index: cursor.indices,
            vertex_offset,
            first_instance,
        };
        let slot = self.built.command_sets[cursor.page].push(command);
        let cmd_ref = CmdRef {
            page: cursor.page,
            slot,
        };

        self.built.cmd_map.insert(node.id, cmd_ref);
        self.built.bindings.insert(node.id, binding);

        cursor.vertex_bytes += vertex_bytes;
        cursor.index_bytes += index_bytes;
        cursor.vertices += vertex_count;
        cursor.indices += index_count;
        self.cursor = Some(cursor);

        Ok(Some(cmd_ref))
    }

    /// Whether the next mesh can go into the cursor's page without running
    /// out of bytes or 32 bit offsets.
    fn fits(
        &self,
        cursor: &PageCursor,
        vertex_bytes: u64,
        index_bytes: u64,
        vertex_count: u32,
        index_count: u32,
    ) -> bool {
        let pool = &*self.pool;
        let offset_fits = match self.addressing {
            IndexAddressing::PageRebased => true,
            IndexAddressing::CommandOffset => vertex_offset_fits(cursor.vertices, vertex_count),
        };

        offset_fits
            && pool.can_append(cursor.page, PageRegion::Vertex, vertex_bytes, cursor.vertex_bytes)
            && pool.can_append(cursor.page, PageRegion::Index, index_bytes, cursor.index_bytes)
            && !offset_overflows(cursor.vertices, vertex_count)
            && !offset_overflows(cursor.indices, index_count)
    }

    pub fn finish(self) -> BuiltCommands {
        self.built
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{MeshId, OwnerId};
    use rstest::rstest;
    use strata_backend::host::HostDevice;

    fn node(id: u64, name: &str) -> MeshNode {
        MeshNode::new(NodeId(id), name, OwnerId(0)).with_mesh(MeshId(id as u32))
    }

    fn mesh(name: &str, vertices: usize, indices: Vec<u32>) -> MeshData {
        MeshData::new(name, vec![Vertex::default(); vertices], indices)
    }

    fn pool(vertex_capacity: u64, index_capacity: u64) -> BufferPool<HostDevice> {
        BufferPool::new(StreamKind::Static, vertex_capacity, index_capacity)
    }

    fn rebased_builder<'a>(
        device: &'a HostDevice,
        pool: &'a mut BufferPool<HostDevice>,
    ) -> CommandBuilder<'a, HostDevice> {
        CommandBuilder::new(device, pool, StreamKind::Static, IndexAddressing::PageRebased)
    }

    fn triangle(name: &str) -> MeshData {
        mesh(name, 3, vec![0, 1, 2])
    }

    #[test]
    fn rebiases_indices_by_prior_vertices() {
        let device = HostDevice::new();
        let mut pool = pool(4096, 4096);
        let mut builder = rebased_builder(&device, &mut pool);

        builder
            .add_node(&node(0, "a"), Some(&mesh("a", 10, vec![0, 1, 2])), 0)
            .unwrap();
        builder
            .add_node(&node(1, "b"), Some(&mesh("b", 3, vec![0, 1, 2])), 1)
            .unwrap();
        let built = builder.finish();

        let indices = pool.page(0).unwrap().index.buffer().read::<u32>(12, 3);
        assert_eq!(indices, vec![10, 11, 12]);

        let command = built.command_sets[0].commands()[1];
        assert_eq!(command.first_index, 3);
        assert_eq!(command.vertex_offset, 0);
        assert_eq!(command.first_instance, 1);
        assert_eq!(command.instance_count, 1);
    }

    #[test]
    fn command_offset_keeps_raw_indices() {
        let device = HostDevice::new();
        let mut pool = pool(4096, 4096);
        let mut builder = CommandBuilder::new(
            &device,
            &mut pool,
            StreamKind::Static,
            IndexAddressing::CommandOffset,
        );

        builder
            .add_node(&node(0, "a"), Some(&mesh("a", 10, vec![0, 1, 2])), 0)
            .unwrap();
        builder
            .add_node(&node(1, "b"), Some(&mesh("b", 3, vec![0, 1, 2])), 1)
            .unwrap();
        let built = builder.finish();

        let indices = pool.page(0).unwrap().index.buffer().read::<u32>(12, 3);
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(built.command_sets[0].commands()[1].vertex_offset, 10);
    }

    #[test]
    fn bindings_follow_cumulative_counts_per_page() {
        let device = HostDevice::new();
        // room for 5 vertices per page
        let mut pool = pool(5 * Vertex::STRIDE, 4096);
        let mut builder = rebased_builder(&device, &mut pool);

        let sizes = [2usize, 3, 4, 1];
        for (i, count) in sizes.iter().enumerate() {
            let indices = (0..*count as u32).collect();
            builder
                .add_node(&node(i as u64, "n"), Some(&mesh("n", *count, indices)), i as u32)
                .unwrap();
        }
        let built = builder.finish();

        let binding = |id| built.bindings[&NodeId(id)];
        assert_eq!((binding(0).page, binding(0).first_vertex), (0, 0));
        assert_eq!((binding(1).page, binding(1).first_vertex), (0, 2));
        assert_eq!((binding(2).page, binding(2).first_vertex), (1, 0));
        assert_eq!((binding(3).page, binding(3).first_vertex), (1, 4));
        assert_eq!(binding(3).first_index, 4);

        assert_eq!(built.command_sets.len(), 2);
        assert_eq!(built.cmd_map[&NodeId(3)], CmdRef { page: 1, slot: 1 });
        for page in pool.pages() {
            assert!(page.vertex.used() <= page.vertex.capacity());
            assert!(page.index.used() <= page.index.capacity());
        }
    }

    #[test]
    fn index_page_filling_first_also_opens_a_page() {
        let device = HostDevice::new();
        let mut pool = pool(4096, 16);
        let mut builder = rebased_builder(&device, &mut pool);

        builder
            .add_node(&node(0, "a"), Some(&mesh("a", 3, vec![0, 1, 2])), 0)
            .unwrap();
        let placed = builder
            .add_node(&node(1, "b"), Some(&mesh("b", 3, vec![0, 1, 2])), 1)
            .unwrap();

        assert_eq!(placed, Some(CmdRef { page: 1, slot: 0 }));
    }

    #[rstest]
    #[case::vertices(2 * Vertex::STRIDE, 4096, PageRegion::Vertex)]
    #[case::indices(4096, 8, PageRegion::Index)]
    fn oversized_mesh_names_itself(
        #[case] vertex_capacity: u64,
        #[case] index_capacity: u64,
        #[case] expected: PageRegion,
    ) {
        let device = HostDevice::new();
        let mut pool = pool(vertex_capacity, index_capacity);
        let mut builder = rebased_builder(&device, &mut pool);

        let err = builder
            .add_node(&node(0, "rock"), Some(&mesh("boulder", 3, vec![0, 1, 2])), 0)
            .unwrap_err();

        match &err {
            RenderError::PageCapacity { mesh, region, .. } => {
                assert_eq!(mesh, "boulder");
                assert_eq!(*region, expected);
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(err.to_string().contains("boulder"));
    }

    #[test]
    fn meshes_without_geometry_are_deferred() {
        let device = HostDevice::new();
        let mut pool = pool(4096, 4096);
        let mut builder = rebased_builder(&device, &mut pool);

        let loading = mesh("loading", 3, vec![]);
        assert_eq!(builder.add_node(&node(0, "a"), Some(&loading), 0).unwrap(), None);
        assert_eq!(builder.add_node(&node(1, "b"), None, 1).unwrap(), None);
        let built = builder.finish();

        assert_eq!(built.deferred, vec![NodeId(0), NodeId(1)]);
        assert!(built.cmd_map.is_empty());
        assert!(built.command_sets.is_empty());
        assert_eq!(pool.page_count(), 0);
    }

    #[test]
    fn overflow_is_detected_before_wrapping() {
        assert!(!offset_overflows(0, u32::MAX));
        assert!(!offset_overflows(u32::MAX - 3, 3));
        assert!(offset_overflows(u32::MAX - 3, 4));
        assert!(offset_overflows(u32::MAX, 1));
    }

    #[rstest]
    #[case::fits(u32::MAX - 3, CmdRef { page: 0, slot: 1 })]
    #[case::would_wrap(u32::MAX - 2, CmdRef { page: 1, slot: 0 })]
    fn index_offset_near_the_limit_opens_a_page(#[case] running: u32, #[case] expected: CmdRef) {
        let device = HostDevice::new();
        let mut pool = pool(4096, 4096);
        let mut builder = rebased_builder(&device, &mut pool);

        builder.add_node(&node(0, "a"), Some(&triangle("a")), 0).unwrap();
        builder.cursor.as_mut().unwrap().indices = running;
        let placed = builder.add_node(&node(1, "b"), Some(&triangle("b")), 1).unwrap();

        assert_eq!(placed, Some(expected));
        let built = builder.finish();
        let command = built.command_sets[expected.page].commands()[expected.slot];
        let first_index = if expected.page == 0 { running } else { 0 };
        assert_eq!(command.first_index, first_index);
    }

    #[rstest]
    #[case::fits(i32::MAX as u32 - 3, CmdRef { page: 0, slot: 1 }, i32::MAX - 3)]
    #[case::would_go_negative(i32::MAX as u32 - 2, CmdRef { page: 1, slot: 0 }, 0)]
    fn vertex_offset_near_i32_max_opens_a_page(
        #[case] running: u32,
        #[case] expected: CmdRef,
        #[case] vertex_offset: i32,
    ) {
        let device = HostDevice::new();
        let mut pool = pool(4096, 4096);
        let mut builder = CommandBuilder::new(
            &device,
            &mut pool,
            StreamKind::Static,
            IndexAddressing::CommandOffset,
        );

        builder.add_node(&node(0, "a"), Some(&triangle("a")), 0).unwrap();
        builder.cursor.as_mut().unwrap().vertices = running;
        let placed = builder.add_node(&node(1, "b"), Some(&triangle("b")), 1).unwrap();

        assert_eq!(placed, Some(expected));
        let built = builder.finish();
        let command = built.command_sets[expected.page].commands()[expected.slot];
        assert_eq!(command.vertex_offset, vertex_offset);
    }
}
