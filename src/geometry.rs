use ash::vk;
use bytemuck::{Pod, Zeroable};

use crate::{gpu, scene};

/// Where one chunk landed inside the shared geometry buffer.
///
/// Indices are rewritten into the global vertex space at pack time, so
/// `index_byte_offset` is relative to the index region and the values
/// stored there already include `first_vertex`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChunkRange {
    pub first_vertex: u32,
    pub vertex_count: u32,
    pub first_triangle: u32,
    pub triangle_count: u32,
    pub index_byte_offset: u32,
    pub max_vertex: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GeometryLayout {
    pub vertex_count: u32,
    pub index_count: u32,
    /// Byte offset of the index region. The vertex region starts at zero.
    pub index_region_offset: u64,
    pub total_size: u64,
    pub chunks: Vec<ChunkRange>,
}

impl GeometryLayout {
    pub fn plan(chunks: &[scene::GeometryChunk]) -> Self {
        let mut layout = GeometryLayout {
            vertex_count: 0,
            index_count: 0,
            index_region_offset: 0,
            total_size: 0,
            chunks: Vec::with_capacity(chunks.len()),
        };
        for chunk in chunks.iter() {
            let vertex_count = chunk.vertices.len() as u32;
            let triangle_count = chunk.indices.len() as u32 / 3;
            layout.chunks.push(ChunkRange {
                first_vertex: layout.vertex_count,
                vertex_count,
                first_triangle: layout.index_count / 3,
                triangle_count,
                index_byte_offset: layout.index_count * 4,
                max_vertex: layout.vertex_count + vertex_count - 1,
            });
            layout.vertex_count += vertex_count;
            layout.index_count += chunk.indices.len() as u32;
        }
        layout.index_region_offset =
            layout.vertex_count as u64 * std::mem::size_of::<scene::Vertex>() as u64;
        layout.total_size = layout.index_region_offset + layout.index_count as u64 * 4;
        layout
    }
}

/// Per-chunk shading record, one per BLAS geometry. The hit shader picks
/// it by geometry index and resolves the triangle through `first_triangle`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct MaterialRecord {
    pub base_color_texture: u32,
    pub metallic_roughness_texture: u32,
    pub normal_texture: u32,
    pub first_triangle: u32,
}

fn texture_slot(index: i32) -> u32 {
    // Absent textures alias slot 0, which `Scene::validate` guarantees
    // is backed by an image.
    index.max(0) as u32
}

pub fn material_records(scene: &scene::Scene) -> Vec<MaterialRecord> {
    let layout_chunks = GeometryLayout::plan(&scene.chunks);
    scene
        .chunks
        .iter()
        .zip(layout_chunks.chunks.iter())
        .map(|(chunk, range)| {
            let desc = &scene.materials[chunk.material_index as usize];
            MaterialRecord {
                base_color_texture: texture_slot(desc.base_color_texture),
                metallic_roughness_texture: texture_slot(desc.metallic_roughness_texture),
                normal_texture: texture_slot(desc.normal_texture),
                first_triangle: range.first_triangle,
            }
        })
        .collect()
}

pub struct PackedGeometry {
    pub layout: GeometryLayout,
    /// Vertex region followed by the rewritten index region.
    pub contents: Vec<u8>,
    /// One entry of global indices per triangle, padded to 16 bytes for
    /// the std430 array stride.
    pub triangles: Vec<[u32; 4]>,
}

#[profiling::function]
pub fn pack(chunks: &[scene::GeometryChunk]) -> PackedGeometry {
    let layout = GeometryLayout::plan(chunks);
    let mut contents = Vec::with_capacity(layout.total_size as usize);
    let mut triangles = Vec::with_capacity((layout.index_count / 3) as usize);

    for chunk in chunks.iter() {
        contents.extend_from_slice(bytemuck::cast_slice(&chunk.vertices));
    }
    debug_assert_eq!(contents.len() as u64, layout.index_region_offset);

    for (chunk, range) in chunks.iter().zip(layout.chunks.iter()) {
        for triangle in chunk.indices.chunks(3) {
            let global = [
                triangle[0] + range.first_vertex,
                triangle[1] + range.first_vertex,
                triangle[2] + range.first_vertex,
            ];
            contents.extend_from_slice(bytemuck::cast_slice(&global));
            triangles.push([global[0], global[1], global[2], 0]);
        }
    }
    debug_assert_eq!(contents.len() as u64, layout.total_size);

    PackedGeometry {
        layout,
        contents,
        triangles,
    }
}

/// Scene data resident on the device.
pub struct SceneGeometry {
    pub layout: GeometryLayout,
    /// Vertices and indices share one buffer, also consumed by the
    /// acceleration structure build.
    pub buffer: gpu::Buffer,
    pub triangle_buffer: gpu::Buffer,
    pub material_buffer: gpu::Buffer,
}

impl SceneGeometry {
    #[profiling::function]
    pub fn new(context: &gpu::Context, scene: &scene::Scene) -> Self {
        let packed = pack(&scene.chunks);
        let records = material_records(scene);

        let buffer = context.create_buffer_init(
            "geometry",
            vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
            &packed.contents,
        );
        let triangle_buffer = context.create_buffer_init(
            "triangle table",
            vk::BufferUsageFlags::STORAGE_BUFFER,
            bytemuck::cast_slice(&packed.triangles),
        );
        let material_buffer = context.create_buffer_init(
            "materials",
            vk::BufferUsageFlags::STORAGE_BUFFER,
            bytemuck::cast_slice(&records),
        );
        log::info!(
            "Packed {} chunks into {} vertices and {} triangles",
            scene.chunks.len(),
            packed.layout.vertex_count,
            packed.layout.index_count / 3,
        );

        SceneGeometry {
            layout: packed.layout,
            buffer,
            triangle_buffer,
            material_buffer,
        }
    }

    pub fn destroy(self, context: &gpu::Context) {
        context.destroy_buffer(self.buffer);
        context.destroy_buffer(self.triangle_buffer);
        context.destroy_buffer(self.material_buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{GeometryChunk, MaterialDesc, Scene, Vertex};

    fn test_vertex(tag: f32) -> Vertex {
        Vertex {
            position: [tag, 0.0, 0.0],
            uv: [0.0, 0.0],
            normal: [0.0, 1.0, 0.0],
        }
    }

    fn chunk(vertex_count: u32, indices: Vec<u32>, material_index: u32) -> GeometryChunk {
        GeometryChunk {
            vertices: (0..vertex_count).map(|i| test_vertex(i as f32)).collect(),
            indices,
            material_index,
        }
    }

    fn two_chunks() -> Vec<GeometryChunk> {
        vec![
            chunk(4, vec![0, 1, 2, 2, 1, 3], 0),
            chunk(8, vec![0, 1, 2, 2, 3, 0, 4, 5, 6, 6, 7, 4], 1),
        ]
    }

    #[test]
    fn layout_regions_are_contiguous() {
        let layout = GeometryLayout::plan(&two_chunks());
        assert_eq!(layout.vertex_count, 12);
        assert_eq!(layout.index_count, 18);
        assert_eq!(layout.index_region_offset, 12 * 32);
        assert_eq!(layout.total_size, 12 * 32 + 18 * 4);
    }

    #[test]
    fn chunk_ranges_accumulate() {
        let layout = GeometryLayout::plan(&two_chunks());
        assert_eq!(
            layout.chunks[0],
            ChunkRange {
                first_vertex: 0,
                vertex_count: 4,
                first_triangle: 0,
                triangle_count: 2,
                index_byte_offset: 0,
                max_vertex: 3,
            }
        );
        assert_eq!(
            layout.chunks[1],
            ChunkRange {
                first_vertex: 4,
                vertex_count: 8,
                first_triangle: 2,
                triangle_count: 4,
                index_byte_offset: 24,
                max_vertex: 11,
            }
        );
    }

    #[test]
    fn indices_are_rewritten_globally() {
        let packed = pack(&two_chunks());
        // The byte slice may land unaligned, so gather instead of casting.
        let index_region: Vec<u32> = bytemuck::pod_collect_to_vec(
            &packed.contents[packed.layout.index_region_offset as usize..],
        );
        assert_eq!(&index_region[..6], &[0, 1, 2, 2, 1, 3]);
        assert_eq!(&index_region[6..], &[4, 5, 6, 6, 7, 4, 8, 9, 10, 10, 11, 8]);
        assert_eq!(packed.triangles.len(), 6);
        assert_eq!(packed.triangles[2], [4, 5, 6, 0]);
        assert_eq!(packed.triangles[5], [10, 11, 8, 0]);
    }

    #[test]
    fn vertex_region_keeps_chunk_order() {
        let packed = pack(&two_chunks());
        let vertices: Vec<Vertex> = bytemuck::pod_collect_to_vec(
            &packed.contents[..packed.layout.index_region_offset as usize],
        );
        assert_eq!(vertices.len(), 12);
        assert_eq!(vertices[0].position[0], 0.0);
        assert_eq!(vertices[4].position[0], 0.0);
        assert_eq!(vertices[11].position[0], 7.0);
    }

    #[test]
    fn material_records_pick_up_triangle_offsets() {
        let scene = Scene {
            chunks: two_chunks(),
            materials: vec![
                MaterialDesc {
                    base_color_texture: 2,
                    metallic_roughness_texture: -1,
                    normal_texture: 1,
                },
                MaterialDesc {
                    base_color_texture: 0,
                    metallic_roughness_texture: 3,
                    normal_texture: -1,
                },
            ],
            images: Vec::new(),
        };
        let records = material_records(&scene);
        assert_eq!(
            records,
            vec![
                MaterialRecord {
                    base_color_texture: 2,
                    metallic_roughness_texture: 0,
                    normal_texture: 1,
                    first_triangle: 0,
                },
                MaterialRecord {
                    base_color_texture: 0,
                    metallic_roughness_texture: 3,
                    normal_texture: 0,
                    first_triangle: 2,
                },
            ]
        );
    }
}
