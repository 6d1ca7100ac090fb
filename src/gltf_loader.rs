//! glTF scene import: meshes with their node transforms, PBR materials,
//! punctual lights and base-color images.

use std::path::Path;

use glam::Mat4;
use thiserror::Error;

use pathtracer_shared::{Light, Material};

use crate::scene::{MeshData, SceneImage, SceneState};

#[derive(Debug, Error)]
pub enum GltfError {
    #[error("glTF import failed: {0}")]
    Import(#[from] gltf::Error),
    #[error("primitive in mesh {0:?} has no position attribute")]
    MissingPositions(Option<String>),
}

pub fn load_scene<P: AsRef<Path>>(path: P) -> Result<SceneState, GltfError> {
    let (document, buffers, images) = gltf::import(path)?;

    let mut scene = SceneState::new();
    scene.meshes.clear();
    scene.lights.clear();

    scene.images = images.iter().map(convert_image).collect();
    scene.materials = document.materials().map(convert_material).collect();
    // Primitives without a material fall back to this trailing entry.
    let default_material = scene.materials.len() as i32;
    scene.materials.push(Material::diffuse([0.8, 0.8, 0.8]));

    let root = document
        .default_scene()
        .or_else(|| document.scenes().next());
    if let Some(root) = root {
        for node in root.nodes() {
            visit_node(&node, Mat4::IDENTITY, &buffers, default_material, &mut scene)?;
        }
    }

    if scene.lights.is_empty() {
        // A sceneful of diffuse surfaces with no emitters renders black.
        scene
            .lights
            .push(Light::directional([-0.4, -1.0, -0.3], [1.0, 1.0, 0.95], 2.5));
    }

    Ok(scene)
}

fn visit_node(
    node: &gltf::Node,
    parent: Mat4,
    buffers: &[gltf::buffer::Data],
    default_material: i32,
    scene: &mut SceneState,
) -> Result<(), GltfError> {
    let transform = parent * Mat4::from_cols_array_2d(&node.transform().matrix());

    if let Some(mesh) = node.mesh() {
        for primitive in mesh.primitives() {
            scene.meshes.push(convert_primitive(
                &mesh,
                &primitive,
                transform,
                buffers,
                default_material,
            )?);
        }
    }

    if let Some(light) = node.light() {
        scene.lights.push(convert_light(&light, transform));
    }

    for child in node.children() {
        visit_node(&child, transform, buffers, default_material, scene)?;
    }
    Ok(())
}

fn convert_primitive(
    mesh: &gltf::Mesh,
    primitive: &gltf::Primitive,
    transform: Mat4,
    buffers: &[gltf::buffer::Data],
    default_material: i32,
) -> Result<MeshData, GltfError> {
    let reader = primitive.reader(|buffer| buffers.get(buffer.index()).map(|data| &data.0[..]));

    let vertices: Vec<[f32; 3]> = reader
        .read_positions()
        .ok_or_else(|| GltfError::MissingPositions(mesh.name().map(str::to_owned)))?
        .collect();
    let normals: Vec<[f32; 3]> = reader
        .read_normals()
        .map(|iter| iter.collect())
        .unwrap_or_default();
    let uvs: Vec<[f32; 2]> = reader
        .read_tex_coords(0)
        .map(|coords| coords.into_f32().collect())
        .unwrap_or_default();

    let indices: Vec<u32> = match reader.read_indices() {
        Some(indices) => indices.into_u32().collect(),
        None => (0..vertices.len() as u32).collect(),
    };
    let material = primitive
        .material()
        .index()
        .map(|index| index as i32)
        .unwrap_or(default_material);
    let faces: Vec<[i32; 4]> = indices
        .chunks_exact(3)
        .map(|tri| [tri[0] as i32, tri[1] as i32, tri[2] as i32, material])
        .collect();

    Ok(MeshData {
        vertices,
        normals,
        uvs,
        faces,
        transform: mat4_to_rows_4x3(transform),
    })
}

fn convert_material(material: gltf::Material) -> Material {
    let pbr = material.pbr_metallic_roughness();
    let base = pbr.base_color_factor();
    let emissive = material.emissive_factor();
    let ior = material.ior().unwrap_or(1.5);
    let transmission = material
        .transmission()
        .map(|t| t.transmission_factor())
        .unwrap_or(0.0);

    let mut converted = Material::new(
        [base[0], base[1], base[2]],
        pbr.metallic_factor(),
        pbr.roughness_factor(),
        emissive,
        ior,
        transmission,
    );
    if let Some(info) = pbr.base_color_texture() {
        if let Some(image_index) = texture_image_index(&info.texture()) {
            converted = converted.with_base_color_texture(image_index);
        }
    }
    converted
}

fn texture_image_index(texture: &gltf::Texture) -> Option<u32> {
    Some(texture.source().index() as u32)
}

fn convert_light(light: &gltf::khr_lights_punctual::Light, transform: Mat4) -> Light {
    use gltf::khr_lights_punctual::Kind;

    let color = light.color();
    let intensity = light.intensity();
    match light.kind() {
        Kind::Directional => {
            let direction = (transform * glam::Vec4::new(0.0, 0.0, -1.0, 0.0)).truncate();
            Light::directional(direction.normalize().to_array(), color, intensity)
        }
        // Spot lights are treated as points; the cone is not modeled.
        Kind::Point | Kind::Spot { .. } => {
            let position = (transform * glam::Vec4::new(0.0, 0.0, 0.0, 1.0)).truncate();
            Light::point(position.to_array(), color, intensity * 0.05)
        }
    }
}

fn convert_image(data: &gltf::image::Data) -> SceneImage {
    use gltf::image::Format;

    let pixel_count = (data.width * data.height) as usize;
    let rgba8 = match data.format {
        Format::R8G8B8A8 => data.pixels.clone(),
        Format::R8G8B8 => {
            let mut out = Vec::with_capacity(pixel_count * 4);
            for rgb in data.pixels.chunks_exact(3) {
                out.extend_from_slice(&[rgb[0], rgb[1], rgb[2], 255]);
            }
            out
        }
        Format::R8 => {
            let mut out = Vec::with_capacity(pixel_count * 4);
            for &r in &data.pixels {
                out.extend_from_slice(&[r, r, r, 255]);
            }
            out
        }
        Format::R8G8 => {
            let mut out = Vec::with_capacity(pixel_count * 4);
            for rg in data.pixels.chunks_exact(2) {
                out.extend_from_slice(&[rg[0], rg[1], 0, 255]);
            }
            out
        }
        // 16-bit and float formats are downgraded to opaque white rather
        // than carrying a second decode path.
        _ => vec![255; pixel_count * 4],
    };

    SceneImage {
        width: data.width,
        height: data.height,
        rgba8,
    }
}

fn mat4_to_rows_4x3(matrix: Mat4) -> [[f32; 4]; 3] {
    let m = matrix.to_cols_array_2d();
    [
        [m[0][0], m[1][0], m[2][0], m[3][0]],
        [m[0][1], m[1][1], m[2][1], m[3][1]],
        [m[0][2], m[1][2], m[2][2], m[3][2]],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mat4_rows_carry_translation_in_the_last_column() {
        let rows = mat4_to_rows_4x3(Mat4::from_translation(glam::Vec3::new(1.0, 2.0, 3.0)));
        assert_eq!(rows[0], [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(rows[1], [0.0, 1.0, 0.0, 2.0]);
        assert_eq!(rows[2], [0.0, 0.0, 1.0, 3.0]);
    }
}
