//! Host-side scene state and its GPU tables.
//!
//! Geometry is handed to the intersection oracle; materials, lights, the
//! environment map and base-color textures are flat GPU tables bound to the
//! shading kernel alongside the frame uniforms.

use half::f16;
use wgpu::util::DeviceExt;

use pathtracer_shared::{Camera, Light, Material};

use crate::kernels::KernelLayouts;
use crate::oracle::{AccelHandle, AccelKind, GeometryData, IntersectionOracle, OracleError};

pub const IDENTITY_TRANSFORM: [[f32; 4]; 3] = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
];

/// Decoded RGBA8 image destined for the base-color texture array
pub struct SceneImage {
    pub width: u32,
    pub height: u32,
    pub rgba8: Vec<u8>,
}

/// Equirectangular HDR environment, four floats per texel
pub struct EnvironmentMap {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<f32>,
}

impl EnvironmentMap {
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<Self, image::ImageError> {
        let decoded = image::open(path)?.to_rgba32f();
        let (width, height) = decoded.dimensions();
        Ok(Self {
            width,
            height,
            rgba: decoded.into_raw(),
        })
    }

    /// Simple gradient sky used when no HDR file is supplied
    fn procedural() -> Self {
        let (width, height) = (64u32, 32u32);
        let mut rgba = Vec::with_capacity((width * height * 4) as usize);
        for y in 0..height {
            let v = y as f32 / (height - 1) as f32;
            let (r, g, b) = if v < 0.5 {
                let t = v * 2.0;
                (
                    0.35 + 0.55 * t,
                    0.55 + 0.37 * t,
                    0.95 * (1.0 - t * 0.05),
                )
            } else {
                let t = (v - 0.5) * 2.0;
                (0.9 - 0.7 * t, 0.92 - 0.72 * t, 0.9 - 0.68 * t)
            };
            for _ in 0..width {
                rgba.extend_from_slice(&[r, g, b, 1.0]);
            }
        }
        Self {
            width,
            height,
            rgba,
        }
    }
}

/// One indexed triangle mesh and its instance transform
pub struct MeshData {
    pub vertices: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub uvs: Vec<[f32; 2]>,
    /// v0, v1, v2, material id
    pub faces: Vec<[i32; 4]>,
    pub transform: [[f32; 4]; 3],
}

impl MeshData {
    pub fn geometry(&self) -> GeometryData<'_> {
        GeometryData {
            vertices: &self.vertices,
            normals: &self.normals,
            uvs: &self.uvs,
            faces: &self.faces,
        }
    }
}

/// Scene geometry, tables and camera
pub struct SceneState {
    pub camera: Camera,
    pub meshes: Vec<MeshData>,
    pub materials: Vec<Material>,
    pub lights: Vec<Light>,
    pub images: Vec<SceneImage>,
    pub environment: Option<EnvironmentMap>,
}

impl SceneState {
    /// Built-in box scene: white walls, colored sides, an emissive ceiling
    /// panel, a mirror cube and one point light.
    pub fn new() -> Self {
        let materials = vec![
            Material::diffuse([0.73, 0.73, 0.73]),
            Material::diffuse([0.63, 0.065, 0.05]),
            Material::diffuse([0.14, 0.45, 0.091]),
            Material::emissive([0.78, 0.78, 0.78], [10.0, 10.0, 9.0]),
            Material::new([0.9, 0.9, 0.9], 1.0, 0.05, [0.0; 3], 1.5, 0.0),
        ];

        let mut mesh = MeshData {
            vertices: Vec::new(),
            normals: Vec::new(),
            uvs: Vec::new(),
            faces: Vec::new(),
            transform: IDENTITY_TRANSFORM,
        };

        // Open box interior, facing +z
        quad(
            &mut mesh,
            [
                [-1.5, 0.0, 1.5],
                [1.5, 0.0, 1.5],
                [1.5, 0.0, -1.5],
                [-1.5, 0.0, -1.5],
            ],
            [0.0, 1.0, 0.0],
            0,
        );
        quad(
            &mut mesh,
            [
                [-1.5, 2.8, -1.5],
                [1.5, 2.8, -1.5],
                [1.5, 2.8, 1.5],
                [-1.5, 2.8, 1.5],
            ],
            [0.0, -1.0, 0.0],
            0,
        );
        quad(
            &mut mesh,
            [
                [-1.5, 0.0, -1.5],
                [1.5, 0.0, -1.5],
                [1.5, 2.8, -1.5],
                [-1.5, 2.8, -1.5],
            ],
            [0.0, 0.0, 1.0],
            0,
        );
        quad(
            &mut mesh,
            [
                [-1.5, 0.0, 1.5],
                [-1.5, 0.0, -1.5],
                [-1.5, 2.8, -1.5],
                [-1.5, 2.8, 1.5],
            ],
            [1.0, 0.0, 0.0],
            1,
        );
        quad(
            &mut mesh,
            [
                [1.5, 0.0, -1.5],
                [1.5, 0.0, 1.5],
                [1.5, 2.8, 1.5],
                [1.5, 2.8, -1.5],
            ],
            [-1.0, 0.0, 0.0],
            2,
        );
        // Light panel just below the ceiling
        quad(
            &mut mesh,
            [
                [-0.5, 2.79, -0.5],
                [0.5, 2.79, -0.5],
                [0.5, 2.79, 0.5],
                [-0.5, 2.79, 0.5],
            ],
            [0.0, -1.0, 0.0],
            3,
        );
        cube(&mut mesh, [-0.55, 0.0, -0.4], [0.7, 1.1, 0.7], 4);

        let mut camera = Camera::new();
        camera.position = glam::Vec3::new(0.0, 1.4, 4.2);
        camera.front = glam::Vec3::new(0.0, -0.05, -1.0).normalize();

        Self {
            camera,
            meshes: vec![mesh],
            materials,
            lights: vec![Light::point([0.0, 2.6, 0.0], [1.0, 0.96, 0.88], 6.0)],
            images: Vec::new(),
            environment: None,
        }
    }

    pub fn load_from_gltf<P: AsRef<std::path::Path>>(
        path: P,
    ) -> Result<Self, crate::gltf_loader::GltfError> {
        crate::gltf_loader::load_scene(path)
    }

    pub fn load_from_gltf_or_default<P: AsRef<std::path::Path>>(path: P) -> Self {
        match Self::load_from_gltf(path.as_ref()) {
            Ok(scene) => {
                log::info!(
                    "loaded glTF scene from {:?}: {} meshes, {} materials, {} lights",
                    path.as_ref(),
                    scene.meshes.len(),
                    scene.materials.len(),
                    scene.lights.len()
                );
                scene
            }
            Err(error) => {
                log::warn!(
                    "failed to load glTF scene from {:?} ({error}), using the built-in scene",
                    path.as_ref()
                );
                Self::new()
            }
        }
    }

    /// Hands every mesh to the oracle as a BLAS instanced into one TLAS.
    pub fn populate_oracle(
        &self,
        oracle: &mut dyn IntersectionOracle,
    ) -> Result<AccelHandle, OracleError> {
        let tlas = oracle.create_acceleration_structure(AccelKind::Tlas)?;
        for mesh in &self.meshes {
            let blas = oracle.create_acceleration_structure(AccelKind::Blas)?;
            oracle.add_geometry(blas, &mesh.geometry())?;
            oracle.add_instance(tlas, blas, mesh.transform)?;
        }
        Ok(tlas)
    }
}

impl Default for SceneState {
    fn default() -> Self {
        Self::new()
    }
}

fn quad(mesh: &mut MeshData, corners: [[f32; 3]; 4], normal: [f32; 3], material: i32) {
    let base = mesh.vertices.len() as i32;
    mesh.vertices.extend_from_slice(&corners);
    mesh.normals.extend_from_slice(&[normal; 4]);
    mesh.uvs.extend_from_slice(&[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]]);
    mesh.faces.push([base, base + 1, base + 2, material]);
    mesh.faces.push([base, base + 2, base + 3, material]);
}

fn cube(mesh: &mut MeshData, origin: [f32; 3], size: [f32; 3], material: i32) {
    let [x0, y0, z0] = origin;
    let [x1, y1, z1] = [origin[0] + size[0], origin[1] + size[1], origin[2] + size[2]];
    quad(
        mesh,
        [[x0, y1, z1], [x1, y1, z1], [x1, y1, z0], [x0, y1, z0]],
        [0.0, 1.0, 0.0],
        material,
    );
    quad(
        mesh,
        [[x0, y0, z1], [x1, y0, z1], [x1, y1, z1], [x0, y1, z1]],
        [0.0, 0.0, 1.0],
        material,
    );
    quad(
        mesh,
        [[x1, y0, z0], [x0, y0, z0], [x0, y1, z0], [x1, y1, z0]],
        [0.0, 0.0, -1.0],
        material,
    );
    quad(
        mesh,
        [[x0, y0, z0], [x0, y0, z1], [x0, y1, z1], [x0, y1, z0]],
        [-1.0, 0.0, 0.0],
        material,
    );
    quad(
        mesh,
        [[x1, y0, z1], [x1, y0, z0], [x1, y1, z0], [x1, y1, z1]],
        [1.0, 0.0, 0.0],
        material,
    );
}

/// GPU-resident material/light/texture tables for the shading kernel
pub struct SceneTables {
    pub materials_buffer: wgpu::Buffer,
    pub lights_buffer: wgpu::Buffer,
    pub environment_view: wgpu::TextureView,
    pub base_textures_view: wgpu::TextureView,
    pub sampler: wgpu::Sampler,
    pub light_count: u32,
    // Textures kept alive for the views above
    _environment: wgpu::Texture,
    _base_textures: wgpu::Texture,
}

impl SceneTables {
    pub fn new(device: &wgpu::Device, queue: &wgpu::Queue, scene: &SceneState) -> Self {
        let mut materials = scene.materials.clone();
        if materials.is_empty() {
            materials.push(Material::diffuse([0.8, 0.8, 0.8]));
        }
        let materials_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Materials Buffer"),
            contents: bytemuck::cast_slice(&materials),
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        });

        let light_count = scene.lights.len() as u32;
        let mut lights = scene.lights.clone();
        if lights.is_empty() {
            // Zero-sized buffers cannot be bound; the shader honors
            // light_count.
            lights.push(Light::point([0.0; 3], [0.0; 3], 0.0));
        }
        let lights_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Lights Buffer"),
            contents: bytemuck::cast_slice(&lights),
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        });

        let procedural;
        let environment = match &scene.environment {
            Some(map) => map,
            None => {
                procedural = EnvironmentMap::procedural();
                &procedural
            }
        };
        let (environment_texture, environment_view) = upload_environment(device, queue, environment);
        let (base_textures, base_textures_view) = upload_base_textures(device, queue, &scene.images);

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Scene Sampler"),
            address_mode_u: wgpu::AddressMode::Repeat,
            address_mode_v: wgpu::AddressMode::Repeat,
            address_mode_w: wgpu::AddressMode::Repeat,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        Self {
            materials_buffer,
            lights_buffer,
            environment_view,
            base_textures_view,
            sampler,
            light_count,
            _environment: environment_texture,
            _base_textures: base_textures,
        }
    }

    pub fn bind_group(
        &self,
        device: &wgpu::Device,
        layouts: &KernelLayouts,
        frame_uniforms: &wgpu::Buffer,
    ) -> wgpu::BindGroup {
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Scene Bind Group"),
            layout: &layouts.scene,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: frame_uniforms.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: self.materials_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: self.lights_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(&self.environment_view),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: wgpu::BindingResource::TextureView(&self.base_textures_view),
                },
            ],
        })
    }
}

fn upload_environment(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    map: &EnvironmentMap,
) -> (wgpu::Texture, wgpu::TextureView) {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Environment Map"),
        size: wgpu::Extent3d {
            width: map.width,
            height: map.height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Rgba16Float,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });

    let halves: Vec<u16> = map.rgba.iter().map(|&v| f16::from_f32(v).to_bits()).collect();
    queue.write_texture(
        wgpu::ImageCopyTexture {
            texture: &texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        bytemuck::cast_slice(&halves),
        wgpu::ImageDataLayout {
            offset: 0,
            bytes_per_row: Some(map.width * 8),
            rows_per_image: Some(map.height),
        },
        wgpu::Extent3d {
            width: map.width,
            height: map.height,
            depth_or_array_layers: 1,
        },
    );

    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    (texture, view)
}

fn upload_base_textures(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    images: &[SceneImage],
) -> (wgpu::Texture, wgpu::TextureView) {
    let (width, height) = images
        .iter()
        .fold((1u32, 1u32), |(w, h), image| {
            (w.max(image.width), h.max(image.height))
        });
    let layers = images.len().max(1) as u32;

    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Base Color Textures"),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: layers,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Rgba8UnormSrgb,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });

    if images.is_empty() {
        queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &[255u8; 4],
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(4),
                rows_per_image: Some(1),
            },
            wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
        );
    }

    for (layer, image) in images.iter().enumerate() {
        // All layers of an array share one extent; smaller images are
        // stretched to fit.
        let pixels = if (image.width, image.height) == (width, height) {
            std::borrow::Cow::Borrowed(&image.rgba8)
        } else {
            let source = image::RgbaImage::from_raw(
                image.width,
                image.height,
                image.rgba8.clone(),
            )
            .unwrap_or_else(|| image::RgbaImage::new(image.width, image.height));
            let resized = image::imageops::resize(
                &source,
                width,
                height,
                image::imageops::FilterType::Triangle,
            );
            std::borrow::Cow::Owned(resized.into_raw())
        };
        queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: 0,
                    y: 0,
                    z: layer as u32,
                },
                aspect: wgpu::TextureAspect::All,
            },
            &pixels,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(width * 4),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
    }

    let view = texture.create_view(&wgpu::TextureViewDescriptor {
        dimension: Some(wgpu::TextureViewDimension::D2Array),
        ..Default::default()
    });
    (texture, view)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_scene_geometry_is_valid() {
        let scene = SceneState::new();
        for mesh in &scene.meshes {
            assert!(mesh.geometry().validate().is_ok());
            assert_eq!(mesh.vertices.len(), mesh.normals.len());
            assert_eq!(mesh.vertices.len(), mesh.uvs.len());
        }
    }

    #[test]
    fn default_scene_materials_cover_face_ids() {
        let scene = SceneState::new();
        let material_count = scene.materials.len() as i32;
        for mesh in &scene.meshes {
            for face in &mesh.faces {
                assert!(face[3] >= 0 && face[3] < material_count);
            }
        }
    }

    #[test]
    fn procedural_environment_is_fully_populated() {
        let map = EnvironmentMap::procedural();
        assert_eq!(map.rgba.len(), (map.width * map.height * 4) as usize);
        assert!(map.rgba.iter().all(|v| v.is_finite()));
    }
}
