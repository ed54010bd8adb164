use bytemuck::{Pod, Zeroable};

/// Interleaved vertex record, matching the layout the hit shader reads.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub uv: [f32; 2],
    pub normal: [f32; 3],
}

/// A contiguous run of triangles sharing one material.
#[derive(Clone, Debug, Default)]
pub struct GeometryChunk {
    pub vertices: Vec<Vertex>,
    /// Indices into this chunk's own vertex list.
    pub indices: Vec<u32>,
    pub material_index: u32,
}

/// Texture slots are indices into `Scene::images`, negative when absent.
#[derive(Clone, Copy, Debug, Default)]
pub struct MaterialDesc {
    pub base_color_texture: i32,
    pub metallic_roughness_texture: i32,
    pub normal_texture: i32,
}

/// Decoded RGBA8 pixels. Decoding happens upstream, the renderer only
/// uploads.
#[derive(Clone, Debug)]
pub struct ImageData {
    pub width: u32,
    pub height: u32,
    pub rgba8: Vec<u8>,
}

#[derive(Clone, Debug, Default)]
pub struct Scene {
    pub chunks: Vec<GeometryChunk>,
    pub materials: Vec<MaterialDesc>,
    pub images: Vec<ImageData>,
}

impl Scene {
    /// Checks the cross-references the GPU side will bake in. Feeding an
    /// inconsistent scene is a caller bug, so failures panic.
    pub fn validate(&self) {
        assert!(!self.chunks.is_empty(), "scene has no geometry");
        // Materials without a texture fall back to image 0, and the hit
        // shader samples the base color unconditionally.
        assert!(!self.images.is_empty(), "scene has no images");
        for (chunk_index, chunk) in self.chunks.iter().enumerate() {
            assert!(
                !chunk.vertices.is_empty() && !chunk.indices.is_empty(),
                "chunk {} is empty",
                chunk_index
            );
            assert_eq!(
                chunk.indices.len() % 3,
                0,
                "chunk {} index count is not a triangle list",
                chunk_index
            );
            for &index in chunk.indices.iter() {
                assert!(
                    (index as usize) < chunk.vertices.len(),
                    "chunk {} indexes past its vertices",
                    chunk_index
                );
            }
            assert!(
                (chunk.material_index as usize) < self.materials.len(),
                "chunk {} references missing material {}",
                chunk_index,
                chunk.material_index
            );
        }
        for (material_index, material) in self.materials.iter().enumerate() {
            for texture in [
                material.base_color_texture,
                material.metallic_roughness_texture,
                material.normal_texture,
            ] {
                assert!(
                    texture < self.images.len() as i32,
                    "material {} references missing image {}",
                    material_index,
                    texture
                );
            }
        }
        for (image_index, image) in self.images.iter().enumerate() {
            assert_eq!(
                image.rgba8.len(),
                image.width as usize * image.height as usize * 4,
                "image {} pixel data does not match its extent",
                image_index
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_triangle() -> GeometryChunk {
        GeometryChunk {
            vertices: vec![
                Vertex {
                    position: [0.0, 0.0, 0.0],
                    uv: [0.0, 0.0],
                    normal: [0.0, 1.0, 0.0],
                },
                Vertex {
                    position: [1.0, 0.0, 0.0],
                    uv: [1.0, 0.0],
                    normal: [0.0, 1.0, 0.0],
                },
                Vertex {
                    position: [0.0, 0.0, 1.0],
                    uv: [0.0, 1.0],
                    normal: [0.0, 1.0, 0.0],
                },
            ],
            indices: vec![0, 1, 2],
            material_index: 0,
        }
    }

    #[test]
    fn vertex_layout_is_tight() {
        assert_eq!(std::mem::size_of::<Vertex>(), 32);
    }

    fn white_pixel() -> ImageData {
        ImageData {
            width: 1,
            height: 1,
            rgba8: vec![255; 4],
        }
    }

    #[test]
    fn valid_scene_passes() {
        let scene = Scene {
            chunks: vec![flat_triangle()],
            materials: vec![MaterialDesc {
                base_color_texture: -1,
                metallic_roughness_texture: -1,
                normal_texture: -1,
            }],
            images: vec![white_pixel()],
        };
        scene.validate();
    }

    #[test]
    #[should_panic(expected = "missing material")]
    fn dangling_material_is_rejected() {
        let scene = Scene {
            chunks: vec![flat_triangle()],
            materials: Vec::new(),
            images: vec![white_pixel()],
        };
        scene.validate();
    }

    #[test]
    #[should_panic(expected = "no images")]
    fn imageless_scene_is_rejected() {
        // Texture-less materials still sample image 0.
        let scene = Scene {
            chunks: vec![flat_triangle()],
            materials: vec![MaterialDesc::default()],
            images: Vec::new(),
        };
        scene.validate();
    }

    #[test]
    #[should_panic(expected = "no geometry")]
    fn empty_scene_is_rejected() {
        Scene::default().validate();
    }
}
