//! A deliberately structure-free intersection oracle used by the viewer
//! binary and the examples: geometry is flattened into a transformed
//! triangle soup and every query walks all of it.
//!
//! It exists so the orchestrator has a complete collaborator to drive — the
//! accessor/bindings/update-flag protocol is the interesting part, not the
//! traversal. The orchestrator never looks past the
//! [`IntersectionOracle`] contract.

use std::collections::HashMap;

use pathtracer_shared::UpdateFlags;

use crate::kernels::{
    compile_module, INTERSECTION_FORMAT, OCCLUSION_FORMAT, RAY_STATE_FORMAT,
};
use crate::oracle::{
    AccelHandle, AccelKind, BindingResource, BufferRequirements, GeometryData, GeometryId,
    InstanceId, IntersectionOracle, OracleError, RayQuery, ResourceBinding,
};

/// Texels per row of the geometry textures
const GEOMETRY_TEX_WIDTH: u32 = 2048;

struct OwnedGeometry {
    vertices: Vec<[f32; 3]>,
    normals: Vec<[f32; 3]>,
    uvs: Vec<[f32; 2]>,
    faces: Vec<[i32; 4]>,
}

struct Instance {
    blas: AccelHandle,
    transform: [[f32; 4]; 3],
}

enum Structure {
    Blas(Vec<OwnedGeometry>),
    Tlas(Vec<Instance>),
}

/// CPU-side flattened triangle soup, three vertex texels per triangle
struct FlatScene {
    positions: Vec<[f32; 4]>,
    normals: Vec<[f32; 4]>,
    uvs: Vec<[f32; 4]>,
    faces: Vec<[i32; 4]>,
}

impl FlatScene {
    fn triangle_count(&self) -> u32 {
        self.faces.len() as u32
    }
}

struct GeometryTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    rows: u32,
}

struct GpuScene {
    positions: GeometryTexture,
    normals: GeometryTexture,
    uvs: GeometryTexture,
    faces: GeometryTexture,
    info_buffer: wgpu::Buffer,
    geometry_bind_group: wgpu::BindGroup,
    triangle_count: u32,
}

struct OracleKernels {
    isect_rays_layout: wgpu::BindGroupLayout,
    occlusion_rays_layout: wgpu::BindGroupLayout,
    geometry_layout: wgpu::BindGroupLayout,
    empty_bind_group: wgpu::BindGroup,
    intersect_pipeline: wgpu::ComputePipeline,
    occlusion_pipeline: wgpu::ComputePipeline,
}

pub struct LinearOracle {
    next_handle: u32,
    next_geometry: u32,
    next_instance: u32,
    structures: HashMap<u32, Structure>,
    pending: UpdateFlags,
    kernels: Option<OracleKernels>,
    scene: Option<GpuScene>,
}

impl LinearOracle {
    pub fn new() -> Self {
        Self {
            next_handle: 0,
            next_geometry: 0,
            next_instance: 0,
            structures: HashMap::new(),
            // The first update must hand out the full set so the consumer
            // builds its program and bindings once.
            pending: UpdateFlags::ACCESSOR_CODE | UpdateFlags::ACCESSOR_BINDINGS,
            kernels: None,
            scene: None,
        }
    }

    fn blas_mut(&mut self, handle: AccelHandle) -> Result<&mut Vec<OwnedGeometry>, OracleError> {
        match self.structures.get_mut(&handle.0) {
            Some(Structure::Blas(geometries)) => Ok(geometries),
            _ => Err(OracleError::UnknownHandle {
                kind: "BLAS",
                id: handle.0,
            }),
        }
    }

    fn tlas_mut(&mut self, handle: AccelHandle) -> Result<&mut Vec<Instance>, OracleError> {
        match self.structures.get_mut(&handle.0) {
            Some(Structure::Tlas(instances)) => Ok(instances),
            _ => Err(OracleError::UnknownHandle {
                kind: "TLAS",
                id: handle.0,
            }),
        }
    }

    /// Bakes every TLAS instance into one transformed triangle soup.
    fn flatten(&self) -> Result<FlatScene, OracleError> {
        let mut flat = FlatScene {
            positions: Vec::new(),
            normals: Vec::new(),
            uvs: Vec::new(),
            faces: Vec::new(),
        };

        for structure in self.structures.values() {
            let instances = match structure {
                Structure::Tlas(instances) => instances,
                Structure::Blas(_) => continue,
            };
            for instance in instances {
                let geometries = match self.structures.get(&instance.blas.0) {
                    Some(Structure::Blas(geometries)) => geometries,
                    _ => {
                        return Err(OracleError::Rebuild(format!(
                            "instance references unknown BLAS {}",
                            instance.blas.0
                        )))
                    }
                };
                for geometry in geometries {
                    bake_geometry(&mut flat, geometry, &instance.transform);
                }
            }
        }
        Ok(flat)
    }

    fn ensure_kernels(&mut self, device: &wgpu::Device) -> Result<(), OracleError> {
        if self.kernels.is_some() {
            return Ok(());
        }
        self.kernels = Some(OracleKernels::new(device)?);
        Ok(())
    }

    fn upload(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
    ) -> Result<(), OracleError> {
        let flat = self.flatten()?;
        let vertex_rows = rows_for(flat.positions.len());
        let face_rows = rows_for(flat.faces.len());

        let needs_alloc = match &self.scene {
            None => true,
            Some(scene) => {
                scene.positions.rows < vertex_rows || scene.faces.rows < face_rows
            }
        };

        if needs_alloc {
            let kernels = self.kernels.as_ref().ok_or_else(|| {
                OracleError::Rebuild("internal kernels missing during upload".into())
            })?;
            let positions = GeometryTexture::new(
                device,
                "Oracle Positions",
                vertex_rows,
                wgpu::TextureFormat::Rgba32Float,
            );
            let normals = GeometryTexture::new(
                device,
                "Oracle Normals",
                vertex_rows,
                wgpu::TextureFormat::Rgba32Float,
            );
            let uvs = GeometryTexture::new(
                device,
                "Oracle UVs",
                vertex_rows,
                wgpu::TextureFormat::Rgba32Float,
            );
            let faces = GeometryTexture::new(
                device,
                "Oracle Faces",
                face_rows,
                wgpu::TextureFormat::Rgba32Sint,
            );
            let info_buffer = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Oracle Scene Info"),
                size: 16,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let geometry_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Oracle Geometry Bind Group"),
                layout: &kernels.geometry_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(&positions.view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(&normals.view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: wgpu::BindingResource::TextureView(&uvs.view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: wgpu::BindingResource::TextureView(&faces.view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 4,
                        resource: info_buffer.as_entire_binding(),
                    },
                ],
            });
            self.scene = Some(GpuScene {
                positions,
                normals,
                uvs,
                faces,
                info_buffer,
                geometry_bind_group,
                triangle_count: 0,
            });
            // New texture objects mean the consumer must rebind.
            self.pending.insert(UpdateFlags::ACCESSOR_BINDINGS);
        }

        let scene = self
            .scene
            .as_mut()
            .ok_or_else(|| OracleError::Rebuild("geometry upload failed".into()))?;
        scene.triangle_count = flat.triangle_count();
        scene.positions.write(queue, &flat.positions);
        scene.normals.write(queue, &flat.normals);
        scene.uvs.write(queue, &flat.uvs);
        scene.faces.write(queue, &flat.faces);
        queue.write_buffer(
            &scene.info_buffer,
            0,
            bytemuck::cast_slice(&[scene.triangle_count, GEOMETRY_TEX_WIDTH, 0, 0]),
        );
        log::debug!("oracle rebuilt: {} triangles", scene.triangle_count);
        Ok(())
    }

    fn ready(&self) -> Result<(&OracleKernels, &GpuScene), OracleError> {
        match (&self.kernels, &self.scene) {
            (Some(kernels), Some(scene)) => Ok((kernels, scene)),
            _ => Err(OracleError::Query(
                "update() must succeed before queries are dispatched".into(),
            )),
        }
    }

    fn dispatch(
        &self,
        device: &wgpu::Device,
        encoder: &mut wgpu::CommandEncoder,
        query: RayQuery<'_>,
        occlusion: bool,
    ) -> Result<(), OracleError> {
        let (kernels, scene) = self.ready()?;
        let rays_layout = if occlusion {
            &kernels.occlusion_rays_layout
        } else {
            &kernels.isect_rays_layout
        };
        let rays_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Oracle Query Bind Group"),
            layout: rays_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(query.origins),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(query.directions),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(query.output),
                },
            ],
        });

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Oracle Query Pass"),
        });
        pass.set_pipeline(if occlusion {
            &kernels.occlusion_pipeline
        } else {
            &kernels.intersect_pipeline
        });
        pass.set_bind_group(0, &rays_bind_group, &[]);
        pass.set_bind_group(1, &kernels.empty_bind_group, &[]);
        pass.set_bind_group(2, &scene.geometry_bind_group, &[]);
        let dims = [query.dims.0 as i32, query.dims.1 as i32];
        pass.set_push_constants(0, bytemuck::cast_slice(&dims));
        pass.dispatch_workgroups(
            (query.dims.0 + 7) / 8,
            (query.dims.1 + 7) / 8,
            1,
        );
        Ok(())
    }
}

impl Default for LinearOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl IntersectionOracle for LinearOracle {
    fn create_acceleration_structure(
        &mut self,
        kind: AccelKind,
    ) -> Result<AccelHandle, OracleError> {
        let handle = AccelHandle(self.next_handle);
        self.next_handle += 1;
        let structure = match kind {
            AccelKind::Blas => Structure::Blas(Vec::new()),
            AccelKind::Tlas => Structure::Tlas(Vec::new()),
        };
        self.structures.insert(handle.0, structure);
        Ok(handle)
    }

    fn add_geometry(
        &mut self,
        blas: AccelHandle,
        geometry: &GeometryData<'_>,
    ) -> Result<GeometryId, OracleError> {
        geometry.validate()?;
        let owned = OwnedGeometry {
            vertices: geometry.vertices.to_vec(),
            normals: geometry.normals.to_vec(),
            uvs: geometry.uvs.to_vec(),
            faces: geometry.faces.to_vec(),
        };
        self.blas_mut(blas)?.push(owned);
        self.pending.insert(UpdateFlags::INSTANCE_UPDATE);
        let id = GeometryId(self.next_geometry);
        self.next_geometry += 1;
        Ok(id)
    }

    fn add_instance(
        &mut self,
        tlas: AccelHandle,
        blas: AccelHandle,
        transform: [[f32; 4]; 3],
    ) -> Result<InstanceId, OracleError> {
        if !matches!(self.structures.get(&blas.0), Some(Structure::Blas(_))) {
            return Err(OracleError::UnknownHandle {
                kind: "BLAS",
                id: blas.0,
            });
        }
        self.tlas_mut(tlas)?.push(Instance { blas, transform });
        self.pending.insert(UpdateFlags::INSTANCE_UPDATE);
        let id = InstanceId(self.next_instance);
        self.next_instance += 1;
        Ok(id)
    }

    fn update_instance(
        &mut self,
        tlas: AccelHandle,
        instance: InstanceId,
        transform: [[f32; 4]; 3],
    ) -> Result<(), OracleError> {
        let instances = self.tlas_mut(tlas)?;
        let entry = instances
            .get_mut(instance.0 as usize)
            .ok_or(OracleError::UnknownHandle {
                kind: "instance",
                id: instance.0,
            })?;
        entry.transform = transform;
        self.pending.insert(UpdateFlags::INSTANCE_UPDATE);
        Ok(())
    }

    fn update(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
    ) -> Result<UpdateFlags, OracleError> {
        self.ensure_kernels(device)?;
        if self.scene.is_none() || self.pending.contains(UpdateFlags::INSTANCE_UPDATE) {
            self.upload(device, queue)?;
        }
        Ok(self.pending.take())
    }

    fn scene_accessor_source(&self) -> &str {
        ACCESSOR_SRC
    }

    fn resource_bindings(&self) -> Vec<ResourceBinding<'_>> {
        let scene = match &self.scene {
            Some(scene) => scene,
            None => return Vec::new(),
        };
        let float_load = wgpu::TextureSampleType::Float { filterable: false };
        vec![
            ResourceBinding {
                name: "wr_positions",
                resource: BindingResource::Texture2d {
                    view: &scene.positions.view,
                    sample_type: float_load,
                },
            },
            ResourceBinding {
                name: "wr_normals",
                resource: BindingResource::Texture2d {
                    view: &scene.normals.view,
                    sample_type: float_load,
                },
            },
            ResourceBinding {
                name: "wr_uvs",
                resource: BindingResource::Texture2d {
                    view: &scene.uvs.view,
                    sample_type: float_load,
                },
            },
            ResourceBinding {
                name: "wr_faces",
                resource: BindingResource::Texture2d {
                    view: &scene.faces.view,
                    sample_type: wgpu::TextureSampleType::Sint,
                },
            },
            ResourceBinding {
                name: "wr_info",
                resource: BindingResource::UniformBuffer(&scene.info_buffer),
            },
        ]
    }

    fn ray_buffer_requirements(&self, dims: (u32, u32)) -> BufferRequirements {
        BufferRequirements {
            width: dims.0,
            height: dims.1,
            format: RAY_STATE_FORMAT,
        }
    }

    fn intersection_buffer_requirements(&self, dims: (u32, u32)) -> BufferRequirements {
        BufferRequirements {
            width: dims.0,
            height: dims.1,
            format: INTERSECTION_FORMAT,
        }
    }

    fn occlusion_buffer_requirements(&self, dims: (u32, u32)) -> BufferRequirements {
        BufferRequirements {
            width: dims.0,
            height: dims.1,
            format: OCCLUSION_FORMAT,
        }
    }

    fn query_intersection(
        &self,
        device: &wgpu::Device,
        encoder: &mut wgpu::CommandEncoder,
        query: RayQuery<'_>,
    ) -> Result<(), OracleError> {
        self.dispatch(device, encoder, query, false)
    }

    fn query_occlusion(
        &self,
        device: &wgpu::Device,
        encoder: &mut wgpu::CommandEncoder,
        query: RayQuery<'_>,
    ) -> Result<(), OracleError> {
        self.dispatch(device, encoder, query, true)
    }
}

fn rows_for(texels: usize) -> u32 {
    ((texels as u32 + GEOMETRY_TEX_WIDTH - 1) / GEOMETRY_TEX_WIDTH).max(1)
}

fn transform_point(rows: &[[f32; 4]; 3], p: [f32; 3]) -> [f32; 3] {
    [
        rows[0][0] * p[0] + rows[0][1] * p[1] + rows[0][2] * p[2] + rows[0][3],
        rows[1][0] * p[0] + rows[1][1] * p[1] + rows[1][2] * p[2] + rows[1][3],
        rows[2][0] * p[0] + rows[2][1] * p[1] + rows[2][2] * p[2] + rows[2][3],
    ]
}

fn transform_vector(rows: &[[f32; 4]; 3], v: [f32; 3]) -> [f32; 3] {
    [
        rows[0][0] * v[0] + rows[0][1] * v[1] + rows[0][2] * v[2],
        rows[1][0] * v[0] + rows[1][1] * v[1] + rows[1][2] * v[2],
        rows[2][0] * v[0] + rows[2][1] * v[1] + rows[2][2] * v[2],
    ]
}

fn face_normal(a: [f32; 3], b: [f32; 3], c: [f32; 3]) -> [f32; 3] {
    let u = [b[0] - a[0], b[1] - a[1], b[2] - a[2]];
    let v = [c[0] - a[0], c[1] - a[1], c[2] - a[2]];
    let n = [
        u[1] * v[2] - u[2] * v[1],
        u[2] * v[0] - u[0] * v[2],
        u[0] * v[1] - u[1] * v[0],
    ];
    let len = (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]).sqrt();
    if len > 0.0 {
        [n[0] / len, n[1] / len, n[2] / len]
    } else {
        [0.0, 1.0, 0.0]
    }
}

fn bake_geometry(flat: &mut FlatScene, geometry: &OwnedGeometry, transform: &[[f32; 4]; 3]) {
    let has_normals = geometry.normals.len() == geometry.vertices.len();
    let has_uvs = geometry.uvs.len() == geometry.vertices.len();

    for face in &geometry.faces {
        let base = flat.positions.len() as i32;
        let corners = [face[0] as usize, face[1] as usize, face[2] as usize];
        let world: Vec<[f32; 3]> = corners
            .iter()
            .map(|&i| transform_point(transform, geometry.vertices[i]))
            .collect();
        let flat_normal = face_normal(world[0], world[1], world[2]);

        for (slot, &i) in corners.iter().enumerate() {
            let p = world[slot];
            flat.positions.push([p[0], p[1], p[2], 0.0]);
            let n = if has_normals {
                transform_vector(transform, geometry.normals[i])
            } else {
                flat_normal
            };
            flat.normals.push([n[0], n[1], n[2], 0.0]);
            let uv = if has_uvs { geometry.uvs[i] } else { [0.0, 0.0] };
            flat.uvs.push([uv[0], uv[1], 0.0, 0.0]);
        }
        flat.faces.push([base, base + 1, base + 2, face[3]]);
    }
}

impl GeometryTexture {
    fn new(device: &wgpu::Device, label: &str, rows: u32, format: wgpu::TextureFormat) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width: GEOMETRY_TEX_WIDTH,
                height: rows,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self {
            texture,
            view,
            rows,
        }
    }

    /// Uploads `texels`, zero-padded out to the allocated extent.
    fn write<T: bytemuck::Pod + Default + Clone>(&self, queue: &wgpu::Queue, texels: &[T]) {
        let capacity = (GEOMETRY_TEX_WIDTH * self.rows) as usize;
        let mut padded = texels.to_vec();
        padded.resize(capacity, T::default());
        queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(&padded),
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(GEOMETRY_TEX_WIDTH * 16),
                rows_per_image: Some(self.rows),
            },
            wgpu::Extent3d {
                width: GEOMETRY_TEX_WIDTH,
                height: self.rows,
                depth_or_array_layers: 1,
            },
        );
    }
}

impl OracleKernels {
    fn new(device: &wgpu::Device) -> Result<Self, OracleError> {
        let rays_layout = |format: wgpu::TextureFormat, label: &str| {
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(label),
                entries: &[
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Texture {
                            multisampled: false,
                            view_dimension: wgpu::TextureViewDimension::D2,
                            sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Texture {
                            multisampled: false,
                            view_dimension: wgpu::TextureViewDimension::D2,
                            sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 2,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::StorageTexture {
                            access: wgpu::StorageTextureAccess::WriteOnly,
                            format,
                            view_dimension: wgpu::TextureViewDimension::D2,
                        },
                        count: None,
                    },
                ],
            })
        };
        let isect_rays_layout = rays_layout(INTERSECTION_FORMAT, "Oracle Intersect Rays Layout");
        let occlusion_rays_layout = rays_layout(OCCLUSION_FORMAT, "Oracle Occlusion Rays Layout");

        let geometry_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Oracle Geometry Layout"),
            entries: &[
                geometry_texture_entry(0, wgpu::TextureSampleType::Float { filterable: false }),
                geometry_texture_entry(1, wgpu::TextureSampleType::Float { filterable: false }),
                geometry_texture_entry(2, wgpu::TextureSampleType::Float { filterable: false }),
                geometry_texture_entry(3, wgpu::TextureSampleType::Sint),
                wgpu::BindGroupLayoutEntry {
                    binding: 4,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let empty_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Oracle Empty Layout"),
            entries: &[],
        });
        let empty_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Oracle Empty Bind Group"),
            layout: &empty_layout,
            entries: &[],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Oracle Intersect Pipeline Layout"),
            bind_group_layouts: &[&isect_rays_layout, &empty_layout, &geometry_layout],
            push_constant_ranges: &[wgpu::PushConstantRange {
                stages: wgpu::ShaderStages::COMPUTE,
                range: 0..8,
            }],
        });
        let occlusion_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Oracle Occlusion Pipeline Layout"),
                bind_group_layouts: &[&occlusion_rays_layout, &empty_layout, &geometry_layout],
                push_constant_ranges: &[wgpu::PushConstantRange {
                    stages: wgpu::ShaderStages::COMPUTE,
                    range: 0..8,
                }],
            });

        let intersect_source = format!("{ACCESSOR_SRC}\n{INTERSECT_TEMPLATE}");
        let intersect_module = compile_module(device, "Oracle Intersect Module", &intersect_source)
            .map_err(|error| OracleError::Rebuild(error.to_string()))?;
        let intersect_pipeline =
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("Oracle Intersect Pipeline"),
                layout: Some(&pipeline_layout),
                module: &intersect_module,
                entry_point: "main_cs",
            });

        let occlusion_source = format!("{ACCESSOR_SRC}\n{OCCLUSION_TEMPLATE}");
        let occlusion_module = compile_module(device, "Oracle Occlusion Module", &occlusion_source)
            .map_err(|error| OracleError::Rebuild(error.to_string()))?;
        let occlusion_pipeline =
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("Oracle Occlusion Pipeline"),
                layout: Some(&occlusion_pipeline_layout),
                module: &occlusion_module,
                entry_point: "main_cs",
            });

        Ok(Self {
            isect_rays_layout,
            occlusion_rays_layout,
            geometry_layout,
            empty_bind_group,
            intersect_pipeline,
            occlusion_pipeline,
        })
    }
}

fn geometry_texture_entry(
    binding: u32,
    sample_type: wgpu::TextureSampleType,
) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Texture {
            multisampled: false,
            view_dimension: wgpu::TextureViewDimension::D2,
            sample_type,
        },
        count: None,
    }
}

/// Scene-accessor fragment handed to the orchestrator. Bindings live in
/// group 2 per the kernel contract; hit records are (triangle, t, u, v) with
/// the floats bitcast into the integer channels.
const ACCESSOR_SRC: &str = r#"
struct WrSceneInfo {
    triangle_count: u32,
    tex_width: u32,
    pad0: u32,
    pad1: u32,
}

@group(2) @binding(0) var wr_positions: texture_2d<f32>;
@group(2) @binding(1) var wr_normals: texture_2d<f32>;
@group(2) @binding(2) var wr_uvs: texture_2d<f32>;
@group(2) @binding(3) var wr_faces: texture_2d<i32>;
@group(2) @binding(4) var<uniform> wr_info: WrSceneInfo;

fn wr_texel(index: i32) -> vec2<i32> {
    let width = i32(wr_info.tex_width);
    return vec2<i32>(index % width, index / width);
}

fn wr_fetch_position(index: i32) -> vec3<f32> {
    return textureLoad(wr_positions, wr_texel(index), 0).xyz;
}

fn wr_fetch_normal(index: i32) -> vec3<f32> {
    return textureLoad(wr_normals, wr_texel(index), 0).xyz;
}

fn wr_fetch_uv(index: i32) -> vec2<f32> {
    return textureLoad(wr_uvs, wr_texel(index), 0).xy;
}

fn wr_face(triangle: i32) -> vec4<i32> {
    return textureLoad(wr_faces, wr_texel(triangle), 0);
}

fn wr_hit_valid(h: vec4<i32>) -> bool {
    return h.x >= 0;
}

fn wr_hit_distance(h: vec4<i32>) -> f32 {
    return bitcast<f32>(h.y);
}

fn wr_hit_barycentrics(h: vec4<i32>) -> vec2<f32> {
    return vec2<f32>(bitcast<f32>(h.z), bitcast<f32>(h.w));
}

fn wr_hit_normal(h: vec4<i32>) -> vec3<f32> {
    let face = wr_face(h.x);
    let bary = wr_hit_barycentrics(h);
    let n0 = wr_fetch_normal(face.x);
    let n1 = wr_fetch_normal(face.y);
    let n2 = wr_fetch_normal(face.z);
    return normalize(n0 * (1.0 - bary.x - bary.y) + n1 * bary.x + n2 * bary.y);
}

fn wr_hit_uv(h: vec4<i32>) -> vec2<f32> {
    let face = wr_face(h.x);
    let bary = wr_hit_barycentrics(h);
    let uv0 = wr_fetch_uv(face.x);
    let uv1 = wr_fetch_uv(face.y);
    let uv2 = wr_fetch_uv(face.z);
    return uv0 * (1.0 - bary.x - bary.y) + uv1 * bary.x + uv2 * bary.y;
}

fn wr_hit_material(h: vec4<i32>) -> u32 {
    return u32(max(wr_face(h.x).w, 0));
}
"#;

const INTERSECT_TEMPLATE: &str = r#"
struct WrQueryPush {
    dims: vec2<i32>,
}

@group(0) @binding(0) var query_origins: texture_2d<f32>;
@group(0) @binding(1) var query_directions: texture_2d<f32>;
@group(0) @binding(2) var query_hits: texture_storage_2d<rgba32sint, write>;

var<push_constant> qp: WrQueryPush;

@compute @workgroup_size(8, 8, 1)
fn main_cs(@builtin(global_invocation_id) gid: vec3<u32>) {
    let coords = vec2<i32>(i32(gid.x), i32(gid.y));
    if (coords.x >= qp.dims.x || coords.y >= qp.dims.y) {
        return;
    }
    let origin = textureLoad(query_origins, coords, 0).xyz;
    let direction = textureLoad(query_directions, coords, 0).xyz;

    var closest_t = 3.4e38;
    var hit = vec4<i32>(-1, 0, 0, 0);
    for (var tri = 0; tri < i32(wr_info.triangle_count); tri = tri + 1) {
        let face = wr_face(tri);
        let v0 = wr_fetch_position(face.x);
        let e1 = wr_fetch_position(face.y) - v0;
        let e2 = wr_fetch_position(face.z) - v0;
        let p = cross(direction, e2);
        let det = dot(e1, p);
        if (abs(det) < 1e-9) {
            continue;
        }
        let inv_det = 1.0 / det;
        let s = origin - v0;
        let u = dot(s, p) * inv_det;
        if (u < 0.0 || u > 1.0) {
            continue;
        }
        let q = cross(s, e1);
        let v = dot(direction, q) * inv_det;
        if (v < 0.0 || u + v > 1.0) {
            continue;
        }
        let t = dot(e2, q) * inv_det;
        if (t > 1e-4 && t < closest_t) {
            closest_t = t;
            hit = vec4<i32>(tri, bitcast<i32>(t), bitcast<i32>(u), bitcast<i32>(v));
        }
    }
    textureStore(query_hits, coords, hit);
}
"#;

/// Any-hit variant: the ray direction is unnormalized and its length is the
/// occlusion distance, so any hit with t in (0, 1) occludes.
const OCCLUSION_TEMPLATE: &str = r#"
struct WrQueryPush {
    dims: vec2<i32>,
}

@group(0) @binding(0) var query_origins: texture_2d<f32>;
@group(0) @binding(1) var query_directions: texture_2d<f32>;
@group(0) @binding(2) var query_occlusion: texture_storage_2d<r32sint, write>;

var<push_constant> qp: WrQueryPush;

@compute @workgroup_size(8, 8, 1)
fn main_cs(@builtin(global_invocation_id) gid: vec3<u32>) {
    let coords = vec2<i32>(i32(gid.x), i32(gid.y));
    if (coords.x >= qp.dims.x || coords.y >= qp.dims.y) {
        return;
    }
    let origin = textureLoad(query_origins, coords, 0).xyz;
    let direction = textureLoad(query_directions, coords, 0).xyz;

    var occluded = 0;
    for (var tri = 0; tri < i32(wr_info.triangle_count); tri = tri + 1) {
        let face = wr_face(tri);
        let v0 = wr_fetch_position(face.x);
        let e1 = wr_fetch_position(face.y) - v0;
        let e2 = wr_fetch_position(face.z) - v0;
        let p = cross(direction, e2);
        let det = dot(e1, p);
        if (abs(det) < 1e-9) {
            continue;
        }
        let inv_det = 1.0 / det;
        let s = origin - v0;
        let u = dot(s, p) * inv_det;
        if (u < 0.0 || u > 1.0) {
            continue;
        }
        let q = cross(s, e1);
        let v = dot(direction, q) * inv_det;
        if (v < 0.0 || u + v > 1.0) {
            continue;
        }
        let t = dot(e2, q) * inv_det;
        if (t > 1e-4 && t < 1.0) {
            occluded = 1;
            break;
        }
    }
    textureStore(query_occlusion, coords, vec4<i32>(occluded, 0, 0, 0));
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::KernelBuilder;

    fn triangle_geometry() -> (Vec<[f32; 3]>, Vec<[f32; 3]>, Vec<[f32; 2]>, Vec<[i32; 4]>) {
        (
            vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            vec![[0.0, 0.0, 1.0]; 3],
            vec![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]],
            vec![[0, 1, 2, 7]],
        )
    }

    #[test]
    fn accessor_satisfies_the_kernel_contract() {
        assert!(KernelBuilder::new(ACCESSOR_SRC).validate().is_ok());
    }

    #[test]
    fn add_geometry_to_tlas_is_rejected() {
        let mut oracle = LinearOracle::new();
        let tlas = oracle
            .create_acceleration_structure(AccelKind::Tlas)
            .unwrap();
        let (vertices, normals, uvs, faces) = triangle_geometry();
        let result = oracle.add_geometry(
            tlas,
            &GeometryData {
                vertices: &vertices,
                normals: &normals,
                uvs: &uvs,
                faces: &faces,
            },
        );
        assert!(matches!(
            result,
            Err(OracleError::UnknownHandle { kind: "BLAS", .. })
        ));
    }

    #[test]
    fn geometry_without_vertices_is_rejected() {
        let mut oracle = LinearOracle::new();
        let blas = oracle
            .create_acceleration_structure(AccelKind::Blas)
            .unwrap();
        let result = oracle.add_geometry(
            blas,
            &GeometryData {
                vertices: &[],
                normals: &[],
                uvs: &[],
                faces: &[],
            },
        );
        assert!(matches!(result, Err(OracleError::MissingVertices)));
    }

    #[test]
    fn flatten_bakes_instance_transforms() {
        let mut oracle = LinearOracle::new();
        let tlas = oracle
            .create_acceleration_structure(AccelKind::Tlas)
            .unwrap();
        let blas = oracle
            .create_acceleration_structure(AccelKind::Blas)
            .unwrap();
        let (vertices, normals, uvs, faces) = triangle_geometry();
        oracle
            .add_geometry(
                blas,
                &GeometryData {
                    vertices: &vertices,
                    normals: &normals,
                    uvs: &uvs,
                    faces: &faces,
                },
            )
            .unwrap();
        let translate_x = [
            [1.0, 0.0, 0.0, 5.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
        ];
        oracle.add_instance(tlas, blas, translate_x).unwrap();

        let flat = oracle.flatten().unwrap();
        assert_eq!(flat.triangle_count(), 1);
        assert_eq!(flat.positions.len(), 3);
        assert_eq!(flat.positions[0][0], 5.0);
        assert_eq!(flat.positions[1][0], 6.0);
        // Material id rides in the face's fourth component.
        assert_eq!(flat.faces[0][3], 7);
    }

    #[test]
    fn flatten_rejects_dangling_instances() {
        let mut oracle = LinearOracle::new();
        let tlas = oracle
            .create_acceleration_structure(AccelKind::Tlas)
            .unwrap();
        let blas = oracle
            .create_acceleration_structure(AccelKind::Blas)
            .unwrap();
        oracle.add_instance(tlas, blas, crate::scene::IDENTITY_TRANSFORM).unwrap();
        oracle.structures.remove(&blas.0);
        assert!(matches!(oracle.flatten(), Err(OracleError::Rebuild(_))));
    }

    #[test]
    fn scene_edits_raise_the_instance_flag() {
        let mut oracle = LinearOracle::new();
        let tlas = oracle
            .create_acceleration_structure(AccelKind::Tlas)
            .unwrap();
        let blas = oracle
            .create_acceleration_structure(AccelKind::Blas)
            .unwrap();
        let (vertices, normals, uvs, faces) = triangle_geometry();
        oracle
            .add_geometry(
                blas,
                &GeometryData {
                    vertices: &vertices,
                    normals: &normals,
                    uvs: &uvs,
                    faces: &faces,
                },
            )
            .unwrap();
        assert!(oracle.pending.contains(UpdateFlags::INSTANCE_UPDATE));
        // The initial pending set also carries code and bindings bits.
        assert!(oracle.pending.contains(UpdateFlags::ACCESSOR_CODE));
        assert!(oracle.pending.contains(UpdateFlags::ACCESSOR_BINDINGS));
    }

    #[test]
    fn update_instance_requires_a_known_instance() {
        let mut oracle = LinearOracle::new();
        let tlas = oracle
            .create_acceleration_structure(AccelKind::Tlas)
            .unwrap();
        let result =
            oracle.update_instance(tlas, InstanceId(3), crate::scene::IDENTITY_TRANSFORM);
        assert!(matches!(
            result,
            Err(OracleError::UnknownHandle { kind: "instance", .. })
        ));
    }

    #[test]
    fn buffer_requirements_match_kernel_formats() {
        let oracle = LinearOracle::new();
        let rays = oracle.ray_buffer_requirements((256, 256));
        assert_eq!(rays.format, RAY_STATE_FORMAT);
        assert_eq!((rays.width, rays.height), (256, 256));
        assert_eq!(
            oracle.intersection_buffer_requirements((256, 256)).format,
            INTERSECTION_FORMAT
        );
        assert_eq!(
            oracle.occlusion_buffer_requirements((256, 256)).format,
            OCCLUSION_FORMAT
        );
    }
}
