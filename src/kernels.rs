//! Fixed WGSL kernel sources and the builder that splices the oracle's
//! scene-accessor fragment into the shading kernel.
//!
//! The generate/accumulate/post kernels are self-contained and compiled once.
//! The shading kernel is a template: it calls `wr_*` functions the oracle
//! provides, so its final source is assembled per synchronization by
//! [`KernelBuilder`] and validated before any compile is attempted.

use std::borrow::Cow;

use pathtracer_shared::RaytracerConfig;
use thiserror::Error;

/// Bind group index reserved for oracle-reported resources. Accessor sources
/// must declare all of their bindings in this group.
pub const ORACLE_BIND_GROUP: u32 = 2;

pub const RAY_STATE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba32Float;
pub const INTERSECTION_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba32Sint;
pub const OCCLUSION_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::R32Sint;
pub const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba32Float;
/// The preview target is blended into, which rules out 32-bit floats on the
/// base WebGPU feature set.
pub const PREVIEW_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;

/// Functions the scene-accessor fragment must define for the shading kernel
/// to link.
pub const REQUIRED_ACCESSOR_SYMBOLS: [&str; 5] = [
    "wr_hit_valid",
    "wr_hit_distance",
    "wr_hit_normal",
    "wr_hit_uv",
    "wr_hit_material",
];

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("scene accessor source is missing required symbols: {missing:?}")]
    MissingSymbols { missing: Vec<String> },
    #[error("shader compilation failed: {0}")]
    Shader(String),
    #[error("pipeline creation failed: {0}")]
    Pipeline(String),
}

/// Assembles the shading-kernel source from the fixed template and an
/// oracle-supplied accessor fragment. Validation happens before compilation
/// so missing accessor symbols surface as a structured error instead of a
/// shader-compiler diagnostic.
pub struct KernelBuilder<'a> {
    accessor: &'a str,
}

impl<'a> KernelBuilder<'a> {
    pub fn new(accessor: &'a str) -> Self {
        Self { accessor }
    }

    pub fn validate(&self) -> Result<(), CompileError> {
        let missing: Vec<String> = REQUIRED_ACCESSOR_SYMBOLS
            .iter()
            .filter(|symbol| !self.defines_function(symbol))
            .map(|symbol| symbol.to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(CompileError::MissingSymbols { missing })
        }
    }

    fn defines_function(&self, symbol: &str) -> bool {
        self.accessor
            .match_indices("fn ")
            .any(|(at, _)| self.accessor[at + 3..].trim_start().starts_with(symbol))
    }

    /// Returns the complete WGSL source, accessor fragment first.
    pub fn build(&self) -> Result<String, CompileError> {
        self.validate()?;
        Ok(format!("{}\n{}", self.accessor, SHADE_TEMPLATE))
    }
}

/// Compiles a shader module with validation errors captured instead of
/// routed to the uncaptured-error handler.
pub fn compile_module(
    device: &wgpu::Device,
    label: &str,
    source: &str,
) -> Result<wgpu::ShaderModule, CompileError> {
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(source)),
    });
    match pollster::block_on(device.pop_error_scope()) {
        None => Ok(module),
        Some(error) => Err(CompileError::Shader(error.to_string())),
    }
}

/// Bind group layouts shared between the fixed pipelines and the
/// synchronizer-built shading pipeline.
pub struct KernelLayouts {
    /// group(0) of the generate kernel: the four write targets of ray set 0
    pub raygen_rays: wgpu::BindGroupLayout,
    /// group(0) of the shading kernel: read set, hit buffer, write set,
    /// G-buffer aux targets
    pub shade_rays: wgpu::BindGroupLayout,
    /// group(1): frame uniforms plus material/light/environment tables
    pub scene: wgpu::BindGroupLayout,
    /// group(0) of the accumulate pass: the final target
    pub accum_input: wgpu::BindGroupLayout,
    /// group(0) of the present pass: preview plus G-buffer aux
    pub post_input: wgpu::BindGroupLayout,
}

fn storage_write(binding: u32, format: wgpu::TextureFormat) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::StorageTexture {
            access: wgpu::StorageTextureAccess::WriteOnly,
            format,
            view_dimension: wgpu::TextureViewDimension::D2,
        },
        count: None,
    }
}

fn texture_load(
    binding: u32,
    visibility: wgpu::ShaderStages,
    sample_type: wgpu::TextureSampleType,
) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Texture {
            multisampled: false,
            view_dimension: wgpu::TextureViewDimension::D2,
            sample_type,
        },
        count: None,
    }
}

const UNFILTERED: wgpu::TextureSampleType = wgpu::TextureSampleType::Float { filterable: false };

impl KernelLayouts {
    pub fn new(device: &wgpu::Device) -> Self {
        let raygen_rays = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Raygen Rays Layout"),
            entries: &[
                storage_write(0, RAY_STATE_FORMAT),
                storage_write(1, RAY_STATE_FORMAT),
                storage_write(2, RAY_STATE_FORMAT),
                storage_write(3, RAY_STATE_FORMAT),
            ],
        });

        let shade_rays = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Shade Rays Layout"),
            entries: &[
                // Current bounce's ray state, read-only
                texture_load(0, wgpu::ShaderStages::COMPUTE, UNFILTERED),
                texture_load(1, wgpu::ShaderStages::COMPUTE, UNFILTERED),
                texture_load(2, wgpu::ShaderStages::COMPUTE, UNFILTERED),
                texture_load(3, wgpu::ShaderStages::COMPUTE, UNFILTERED),
                // Oracle hit records
                texture_load(4, wgpu::ShaderStages::COMPUTE, wgpu::TextureSampleType::Sint),
                // Next bounce's ray state
                storage_write(5, RAY_STATE_FORMAT),
                storage_write(6, RAY_STATE_FORMAT),
                storage_write(7, RAY_STATE_FORMAT),
                storage_write(8, RAY_STATE_FORMAT),
                // G-buffer aux targets, written at depth 0
                storage_write(9, TARGET_FORMAT),
                storage_write(10, TARGET_FORMAT),
                storage_write(11, TARGET_FORMAT),
            ],
        });

        let scene = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Scene Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                texture_load(
                    3,
                    wgpu::ShaderStages::COMPUTE,
                    wgpu::TextureSampleType::Float { filterable: true },
                ),
                wgpu::BindGroupLayoutEntry {
                    binding: 4,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 5,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        multisampled: false,
                        view_dimension: wgpu::TextureViewDimension::D2Array,
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                    },
                    count: None,
                },
            ],
        });

        let accum_input = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Accumulate Input Layout"),
            entries: &[texture_load(0, wgpu::ShaderStages::FRAGMENT, UNFILTERED)],
        });

        let post_input = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Post Input Layout"),
            entries: &[
                texture_load(0, wgpu::ShaderStages::FRAGMENT, UNFILTERED),
                texture_load(1, wgpu::ShaderStages::FRAGMENT, UNFILTERED),
                texture_load(2, wgpu::ShaderStages::FRAGMENT, UNFILTERED),
                texture_load(3, wgpu::ShaderStages::FRAGMENT, UNFILTERED),
            ],
        });

        Self {
            raygen_rays,
            shade_rays,
            scene,
            accum_input,
            post_input,
        }
    }
}

/// The pipelines whose sources never change at runtime. Only the shading
/// pipeline is rebuilt by the program synchronizer.
pub struct FixedPipelines {
    pub generate: wgpu::ComputePipeline,
    pub accumulate: wgpu::RenderPipeline,
    pub post: wgpu::RenderPipeline,
}

impl FixedPipelines {
    pub fn new(
        device: &wgpu::Device,
        layouts: &KernelLayouts,
        surface_format: wgpu::TextureFormat,
    ) -> Self {
        let generate_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Generate Module"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(GENERATE_SRC)),
        });
        let generate_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Generate Pipeline Layout"),
            bind_group_layouts: &[&layouts.raygen_rays, &layouts.scene],
            push_constant_ranges: &[wgpu::PushConstantRange {
                stages: wgpu::ShaderStages::COMPUTE,
                range: 0..std::mem::size_of::<pathtracer_shared::TilePush>() as u32,
            }],
        });
        let generate = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Generate Pipeline"),
            layout: Some(&generate_layout),
            module: &generate_module,
            entry_point: "main_cs",
        });

        let accum_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Accumulate Module"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(ACCUMULATE_SRC)),
        });
        let accum_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Accumulate Pipeline Layout"),
            bind_group_layouts: &[&layouts.accum_input],
            push_constant_ranges: &[],
        });
        // The blend factor is the runtime accumulation weight, supplied via
        // the pass' blend constant.
        let accumulate = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Accumulate Pipeline"),
            layout: Some(&accum_layout),
            vertex: wgpu::VertexState {
                module: &accum_module,
                entry_point: "main_vs",
                buffers: &[],
            },
            fragment: Some(wgpu::FragmentState {
                module: &accum_module,
                entry_point: "main_fs",
                targets: &[Some(wgpu::ColorTargetState {
                    format: PREVIEW_FORMAT,
                    blend: Some(wgpu::BlendState {
                        color: wgpu::BlendComponent {
                            src_factor: wgpu::BlendFactor::Constant,
                            dst_factor: wgpu::BlendFactor::OneMinusConstant,
                            operation: wgpu::BlendOperation::Add,
                        },
                        alpha: wgpu::BlendComponent {
                            src_factor: wgpu::BlendFactor::Constant,
                            dst_factor: wgpu::BlendFactor::OneMinusConstant,
                            operation: wgpu::BlendOperation::Add,
                        },
                    }),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: fullscreen_primitive(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState {
                count: 1,
                mask: !0,
                alpha_to_coverage_enabled: false,
            },
            multiview: None,
        });

        let post_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Post Module"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(POST_SRC)),
        });
        let post_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Post Pipeline Layout"),
            bind_group_layouts: &[&layouts.post_input],
            push_constant_ranges: &[wgpu::PushConstantRange {
                stages: wgpu::ShaderStages::FRAGMENT,
                range: 0..std::mem::size_of::<pathtracer_shared::PostPush>() as u32,
            }],
        });
        let post = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Post Pipeline"),
            layout: Some(&post_layout),
            vertex: wgpu::VertexState {
                module: &post_module,
                entry_point: "main_vs",
                buffers: &[],
            },
            fragment: Some(wgpu::FragmentState {
                module: &post_module,
                entry_point: "main_fs",
                targets: &[Some(wgpu::ColorTargetState {
                    format: surface_format,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: fullscreen_primitive(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState {
                count: 1,
                mask: !0,
                alpha_to_coverage_enabled: false,
            },
            multiview: None,
        });

        Self {
            generate,
            accumulate,
            post,
        }
    }
}

fn fullscreen_primitive() -> wgpu::PrimitiveState {
    wgpu::PrimitiveState {
        topology: wgpu::PrimitiveTopology::TriangleList,
        strip_index_format: None,
        front_face: wgpu::FrontFace::Ccw,
        cull_mode: None,
        polygon_mode: wgpu::PolygonMode::Fill,
        unclipped_depth: false,
        conservative: false,
    }
}

/// Workgroup count for a clipped tile dimension.
pub fn dispatch_extent(pixels: u32) -> u32 {
    let group = RaytracerConfig::THREAD_GROUP_SIZE.0;
    (pixels + group - 1) / group
}

/// Primary ray generation for one tile: a jittered camera ray per pixel and
/// a fresh payload (full throughput, zero radiance).
pub const GENERATE_SRC: &str = r#"
struct FrameUniforms {
    camera_position: vec4<f32>,
    camera_right: vec4<f32>,
    camera_up: vec4<f32>,
    camera_front: vec4<f32>,
    inv_projection: mat4x4<f32>,
    inv_view: mat4x4<f32>,
    resolution: vec2<f32>,
    frame_index: u32,
    light_count: u32,
}

struct TilePush {
    tile: vec4<i32>,
    seed: vec2<u32>,
    depth: u32,
    max_depth: u32,
}

var<private> rng_state: u32;

fn rng_seed(pixel: vec2<i32>, seed: vec2<u32>, frame_index: u32, depth: u32) {
    rng_state = u32(pixel.x) * 1973u
        + u32(pixel.y) * 9277u
        + frame_index * 26699u
        + seed.x * 30971u
        + seed.y * 13229u
        + depth * 2467u
        + 1u;
}

fn rand_f() -> f32 {
    rng_state = rng_state * 747796405u + 2891336453u;
    let word = ((rng_state >> ((rng_state >> 28u) + 4u)) ^ rng_state) * 277803737u;
    return f32((word >> 22u) ^ word) * 2.3283064e-10;
}

@group(0) @binding(0) var dst_origins: texture_storage_2d<rgba32float, write>;
@group(0) @binding(1) var dst_directions: texture_storage_2d<rgba32float, write>;
@group(0) @binding(2) var dst_radiance: texture_storage_2d<rgba32float, write>;
@group(0) @binding(3) var dst_payload: texture_storage_2d<rgba32float, write>;

@group(1) @binding(0) var<uniform> frame: FrameUniforms;

var<push_constant> pc: TilePush;

@compute @workgroup_size(8, 8, 1)
fn main_cs(@builtin(global_invocation_id) gid: vec3<u32>) {
    let local = vec2<i32>(i32(gid.x), i32(gid.y));
    if (local.x >= pc.tile.z || local.y >= pc.tile.w) {
        return;
    }
    let pixel = vec2<i32>(pc.tile.x, pc.tile.y) + local;
    rng_seed(pixel, pc.seed, frame.frame_index, 0u);

    let jitter = vec2<f32>(rand_f(), rand_f()) - 0.5;
    let uv = (vec2<f32>(pixel) + 0.5 + jitter) / frame.resolution;
    let ndc = vec2<f32>(uv.x * 2.0 - 1.0, 1.0 - uv.y * 2.0);

    var view_target = frame.inv_projection * vec4<f32>(ndc, 1.0, 1.0);
    let view_dir = normalize(view_target.xyz / view_target.w);
    let direction = normalize((frame.inv_view * vec4<f32>(view_dir, 0.0)).xyz);

    textureStore(dst_origins, local, vec4<f32>(frame.camera_position.xyz, 1.0));
    textureStore(dst_directions, local, vec4<f32>(direction, 0.0));
    textureStore(dst_radiance, local, vec4<f32>(0.0, 0.0, 0.0, 0.0));
    textureStore(dst_payload, local, vec4<f32>(1.0, 1.0, 1.0, 1.0));
}
"#;

/// The fixed half of the shading kernel. The scene-accessor fragment supplied
/// by the oracle is prepended by [`KernelBuilder`]; it must define the
/// `wr_hit_*` functions and keep its bindings in group 2.
pub const SHADE_TEMPLATE: &str = r#"
struct FrameUniforms {
    camera_position: vec4<f32>,
    camera_right: vec4<f32>,
    camera_up: vec4<f32>,
    camera_front: vec4<f32>,
    inv_projection: mat4x4<f32>,
    inv_view: mat4x4<f32>,
    resolution: vec2<f32>,
    frame_index: u32,
    light_count: u32,
}

struct TilePush {
    tile: vec4<i32>,
    seed: vec2<u32>,
    depth: u32,
    max_depth: u32,
}

struct Material {
    albedo: vec3<f32>,
    mr: u32,
    emission: vec3<f32>,
    iort: u32,
    base_color_texture: u32,
    pad0: u32,
    pad1: u32,
    pad2: u32,
}

struct Light {
    position: vec3<f32>,
    kind: u32,
    color: vec3<f32>,
    intensity: f32,
}

var<private> rng_state: u32;

fn rng_seed(pixel: vec2<i32>, seed: vec2<u32>, frame_index: u32, depth: u32) {
    rng_state = u32(pixel.x) * 1973u
        + u32(pixel.y) * 9277u
        + frame_index * 26699u
        + seed.x * 30971u
        + seed.y * 13229u
        + depth * 2467u
        + 1u;
}

fn rand_f() -> f32 {
    rng_state = rng_state * 747796405u + 2891336453u;
    let word = ((rng_state >> ((rng_state >> 28u) + 4u)) ^ rng_state) * 277803737u;
    return f32((word >> 22u) ^ word) * 2.3283064e-10;
}

@group(0) @binding(0) var src_origins: texture_2d<f32>;
@group(0) @binding(1) var src_directions: texture_2d<f32>;
@group(0) @binding(2) var src_radiance: texture_2d<f32>;
@group(0) @binding(3) var src_payload: texture_2d<f32>;
@group(0) @binding(4) var hit_records: texture_2d<i32>;
@group(0) @binding(5) var dst_origins: texture_storage_2d<rgba32float, write>;
@group(0) @binding(6) var dst_directions: texture_storage_2d<rgba32float, write>;
@group(0) @binding(7) var dst_radiance: texture_storage_2d<rgba32float, write>;
@group(0) @binding(8) var dst_payload: texture_storage_2d<rgba32float, write>;
@group(0) @binding(9) var gbuffer_position: texture_storage_2d<rgba32float, write>;
@group(0) @binding(10) var gbuffer_normal: texture_storage_2d<rgba32float, write>;
@group(0) @binding(11) var gbuffer_albedo: texture_storage_2d<rgba32float, write>;

@group(1) @binding(0) var<uniform> frame: FrameUniforms;
@group(1) @binding(1) var<storage, read> materials: array<Material>;
@group(1) @binding(2) var<storage, read> lights: array<Light>;
@group(1) @binding(3) var env_map: texture_2d<f32>;
@group(1) @binding(4) var scene_sampler: sampler;
@group(1) @binding(5) var base_textures: texture_2d_array<f32>;

var<push_constant> pc: TilePush;

const PI: f32 = 3.14159265358979;

fn sample_environment(direction: vec3<f32>) -> vec3<f32> {
    let u = atan2(direction.z, direction.x) * 0.15915494 + 0.5;
    let v = acos(clamp(direction.y, -1.0, 1.0)) * 0.31830987;
    return textureSampleLevel(env_map, scene_sampler, vec2<f32>(u, v), 0.0).rgb;
}

fn cosine_hemisphere(n: vec3<f32>, r1: f32, r2: f32) -> vec3<f32> {
    let phi = 2.0 * PI * r1;
    let r = sqrt(r2);
    var tangent_seed = vec3<f32>(1.0, 0.0, 0.0);
    if (abs(n.x) > 0.9) {
        tangent_seed = vec3<f32>(0.0, 1.0, 0.0);
    }
    let b1 = normalize(cross(n, tangent_seed));
    let b2 = cross(n, b1);
    return normalize(b1 * (cos(phi) * r) + b2 * (sin(phi) * r) + n * sqrt(max(0.0, 1.0 - r2)));
}

fn direct_lighting(hit_position: vec3<f32>, n: vec3<f32>) -> vec3<f32> {
    var direct = vec3<f32>(0.0);
    for (var i = 0u; i < frame.light_count; i = i + 1u) {
        let light = lights[i];
        if (light.kind == 0u) {
            let to_light = light.position - hit_position;
            let dist2 = max(dot(to_light, to_light), 1e-4);
            let l = to_light * inverseSqrt(dist2);
            direct = direct + light.color * light.intensity * max(dot(n, l), 0.0) / dist2;
        } else {
            let l = normalize(-light.position);
            direct = direct + light.color * light.intensity * max(dot(n, l), 0.0);
        }
    }
    return direct;
}

@compute @workgroup_size(8, 8, 1)
fn main_cs(@builtin(global_invocation_id) gid: vec3<u32>) {
    let local = vec2<i32>(i32(gid.x), i32(gid.y));
    if (local.x >= pc.tile.z || local.y >= pc.tile.w) {
        return;
    }
    let pixel = vec2<i32>(pc.tile.x, pc.tile.y) + local;
    rng_seed(pixel, pc.seed, frame.frame_index, pc.depth + 1u);

    let origin_in = textureLoad(src_origins, local, 0);
    let direction_in = textureLoad(src_directions, local, 0);
    let radiance_in = textureLoad(src_radiance, local, 0);
    let payload_in = textureLoad(src_payload, local, 0);

    var radiance = radiance_in.rgb;
    var throughput = payload_in.rgb;
    var out_origin = origin_in;
    var out_direction = direction_in;
    var out_alive = 0.0;

    if (payload_in.a > 0.5) {
        let hit = textureLoad(hit_records, local, 0);
        if (!wr_hit_valid(hit)) {
            let env = sample_environment(direction_in.xyz);
            radiance = radiance + throughput * env;
            if (pc.depth == 0u) {
                textureStore(gbuffer_position, pixel, vec4<f32>(0.0));
                textureStore(gbuffer_normal, pixel, vec4<f32>(0.0));
                textureStore(gbuffer_albedo, pixel, vec4<f32>(env, 1.0));
            }
        } else {
            let t = wr_hit_distance(hit);
            let hit_position = origin_in.xyz + direction_in.xyz * t;
            var n = normalize(wr_hit_normal(hit));
            if (dot(n, direction_in.xyz) > 0.0) {
                n = -n;
            }
            let material = materials[wr_hit_material(hit)];
            var albedo = material.albedo;
            if (material.base_color_texture != 0xffffffffu) {
                let uv = wr_hit_uv(hit);
                albedo = albedo
                    * textureSampleLevel(base_textures, scene_sampler, uv,
                        i32(material.base_color_texture), 0.0).rgb;
            }

            radiance = radiance + throughput * material.emission;
            radiance = radiance + throughput * (albedo / PI) * direct_lighting(hit_position, n);

            if (pc.depth == 0u) {
                textureStore(gbuffer_position, pixel, vec4<f32>(hit_position, 1.0));
                textureStore(gbuffer_normal, pixel, vec4<f32>(n, 0.0));
                textureStore(gbuffer_albedo, pixel, vec4<f32>(albedo, 1.0));
            }

            let metallic = unpack2x16float(material.mr).x;
            var bounce: vec3<f32>;
            if (rand_f() < metallic) {
                bounce = reflect(direction_in.xyz, n);
            } else {
                bounce = cosine_hemisphere(n, rand_f(), rand_f());
                throughput = throughput * albedo;
            }
            out_origin = vec4<f32>(hit_position + n * 1e-4, 1.0);
            out_direction = vec4<f32>(bounce, 0.0);
            out_alive = 1.0;
        }
    }

    textureStore(dst_origins, local, out_origin);
    textureStore(dst_directions, local, out_direction);
    textureStore(dst_radiance, local, vec4<f32>(radiance, 1.0));
    textureStore(dst_payload, local, vec4<f32>(throughput, out_alive));
}
"#;

/// Blends the final target into the preview target; the blend constant is
/// the accumulation weight, so a weight of 1 fully replaces the preview.
pub const ACCUMULATE_SRC: &str = r#"
@group(0) @binding(0) var final_target: texture_2d<f32>;

@vertex
fn main_vs(@builtin(vertex_index) vertex_index: u32) -> @builtin(position) vec4<f32> {
    var positions = array<vec2<f32>, 3>(
        vec2<f32>(-1.0, -3.0),
        vec2<f32>(3.0, 1.0),
        vec2<f32>(-1.0, 1.0),
    );
    return vec4<f32>(positions[vertex_index], 0.0, 1.0);
}

@fragment
fn main_fs(@builtin(position) position: vec4<f32>) -> @location(0) vec4<f32> {
    let color = textureLoad(final_target, vec2<i32>(position.xy), 0);
    return vec4<f32>(color.rgb, 1.0);
}
"#;

/// Presents the preview target, with AOV views of the G-buffer aux targets.
pub const POST_SRC: &str = r#"
struct PostPush {
    view_mode: u32,
    exposure: f32,
}

@group(0) @binding(0) var preview_target: texture_2d<f32>;
@group(0) @binding(1) var gbuffer_position: texture_2d<f32>;
@group(0) @binding(2) var gbuffer_normal: texture_2d<f32>;
@group(0) @binding(3) var gbuffer_albedo: texture_2d<f32>;

var<push_constant> pc: PostPush;

@vertex
fn main_vs(@builtin(vertex_index) vertex_index: u32) -> @builtin(position) vec4<f32> {
    var positions = array<vec2<f32>, 3>(
        vec2<f32>(-1.0, -3.0),
        vec2<f32>(3.0, 1.0),
        vec2<f32>(-1.0, 1.0),
    );
    return vec4<f32>(positions[vertex_index], 0.0, 1.0);
}

@fragment
fn main_fs(@builtin(position) position: vec4<f32>) -> @location(0) vec4<f32> {
    let coords = vec2<i32>(position.xy);
    if (pc.view_mode == 1u) {
        return vec4<f32>(textureLoad(gbuffer_position, coords, 0).xyz, 1.0);
    }
    if (pc.view_mode == 2u) {
        return vec4<f32>(textureLoad(gbuffer_normal, coords, 0).xyz * 0.5 + 0.5, 1.0);
    }
    if (pc.view_mode == 3u) {
        return vec4<f32>(textureLoad(gbuffer_albedo, coords, 0).rgb, 1.0);
    }
    var color = textureLoad(preview_target, coords, 0).rgb * pc.exposure;
    color = color / (1.0 + color);
    return vec4<f32>(color, 1.0);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_ACCESSOR: &str = r#"
fn wr_hit_valid(h: vec4<i32>) -> bool { return h.x >= 0; }
fn wr_hit_distance(h: vec4<i32>) -> f32 { return bitcast<f32>(h.y); }
fn wr_hit_normal(h: vec4<i32>) -> vec3<f32> { return vec3<f32>(0.0, 1.0, 0.0); }
fn wr_hit_uv(h: vec4<i32>) -> vec2<f32> { return vec2<f32>(0.0); }
fn wr_hit_material(h: vec4<i32>) -> u32 { return 0u; }
"#;

    #[test]
    fn builder_accepts_complete_accessor() {
        let builder = KernelBuilder::new(VALID_ACCESSOR);
        assert!(builder.validate().is_ok());
    }

    #[test]
    fn builder_reports_all_missing_symbols() {
        let builder = KernelBuilder::new("fn wr_hit_valid(h: vec4<i32>) -> bool { return false; }");
        match builder.validate() {
            Err(CompileError::MissingSymbols { missing }) => {
                assert_eq!(
                    missing,
                    vec![
                        "wr_hit_distance".to_string(),
                        "wr_hit_normal".to_string(),
                        "wr_hit_uv".to_string(),
                        "wr_hit_material".to_string(),
                    ]
                );
            }
            other => panic!("expected MissingSymbols, got {other:?}"),
        }
    }

    #[test]
    fn builder_rejects_symbol_lookalikes() {
        // A call site or comment mentioning the name is not a definition.
        let builder = KernelBuilder::new("// wr_hit_valid wr_hit_distance wr_hit_normal wr_hit_uv wr_hit_material");
        assert!(matches!(
            builder.validate(),
            Err(CompileError::MissingSymbols { .. })
        ));
    }

    #[test]
    fn built_source_splices_accessor_before_template() {
        let source = KernelBuilder::new(VALID_ACCESSOR).build().unwrap();
        let accessor_at = source.find("wr_hit_distance").unwrap();
        let template_at = source.find("@compute").unwrap();
        assert!(accessor_at < template_at);
        assert!(source.contains("dst_radiance"));
    }

    #[test]
    fn build_fails_without_symbols() {
        assert!(KernelBuilder::new("").build().is_err());
    }
}
