//! Types shared between the host orchestrator and its GPU kernels: the
//! uniform/push-constant layouts, the tile decomposition math, and the
//! ping-pong buffer bookkeeping for the bounce loop.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use half::f16;

/// Configuration constants for the path tracer
pub struct RaytracerConfig;

impl RaytracerConfig {
    pub const TILE_SIZE: u32 = 256;
    pub const THREAD_GROUP_SIZE: (u32, u32) = (8, 8);
    /// Bounce depth while the camera is at rest
    pub const REST_DEPTH: u32 = 5;
    /// Reduced bounce depth during camera interaction
    pub const MOVE_DEPTH: u32 = 1;
    pub const CAMERA_MOVE_SPEED: f32 = 0.25;
    pub const CAMERA_ROTATE_SENSITIVITY: f32 = 0.005;
    pub const CAMERA_PITCH_CLAMP: f32 = 1.55;
    pub const DEFAULT_FOV_DEG: f32 = 60.0;
    pub const DEFAULT_ZNEAR: f32 = 0.001;
    pub const DEFAULT_ZFAR: f32 = 100.0;

    pub const MAX_PUSH_CONSTANT_SIZE: u32 = 128;
    pub const PERFORMANCE_STATS_INTERVAL: u64 = 60; // frames
}

/// Update bitmask reported by the intersection oracle once per frame.
///
/// A zero value means nothing changed; any set bit obligates the orchestrator
/// to rebuild the shading program and rebind the oracle's resources before the
/// next dispatch.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct UpdateFlags(u32);

impl UpdateFlags {
    pub const NO_UPDATE: UpdateFlags = UpdateFlags(0);
    /// The oracle's external resource binding layout changed
    pub const ACCESSOR_BINDINGS: UpdateFlags = UpdateFlags(1 << 0);
    /// The generated scene-accessor source changed
    pub const ACCESSOR_CODE: UpdateFlags = UpdateFlags(1 << 1);
    /// Instance transforms or topology changed
    pub const INSTANCE_UPDATE: UpdateFlags = UpdateFlags(1 << 2);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: UpdateFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: UpdateFlags) {
        self.0 |= other.0;
    }

    /// Consumes the accumulated flags, leaving `NO_UPDATE` behind.
    pub fn take(&mut self) -> UpdateFlags {
        std::mem::take(self)
    }
}

impl std::ops::BitOr for UpdateFlags {
    type Output = UpdateFlags;

    fn bitor(self, rhs: UpdateFlags) -> UpdateFlags {
        UpdateFlags(self.0 | rhs.0)
    }
}

/// One rectangular unit of work inside the output framebuffer.
///
/// `offset_x`/`offset_y` are pixel coordinates of the tile's top-left corner;
/// `width`/`height` are clipped against the framebuffer edge so the grid
/// covers it exactly.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Tile {
    pub index_x: u32,
    pub index_y: u32,
    pub offset_x: u32,
    pub offset_y: u32,
    pub width: u32,
    pub height: u32,
}

/// Row-major tile decomposition of a `width`×`height` framebuffer.
#[derive(Copy, Clone, Debug)]
pub struct TileGrid {
    width: u32,
    height: u32,
    tile_width: u32,
    tile_height: u32,
    cursor: u32,
}

impl TileGrid {
    pub fn new(width: u32, height: u32, tile_width: u32, tile_height: u32) -> Self {
        assert!(tile_width > 0 && tile_height > 0);
        Self {
            width,
            height,
            tile_width,
            tile_height,
            cursor: 0,
        }
    }

    pub fn tiles_x(&self) -> u32 {
        (self.width + self.tile_width - 1) / self.tile_width
    }

    pub fn tiles_y(&self) -> u32 {
        (self.height + self.tile_height - 1) / self.tile_height
    }

    pub fn tile_count(&self) -> u32 {
        self.tiles_x() * self.tiles_y()
    }
}

impl Iterator for TileGrid {
    type Item = Tile;

    fn next(&mut self) -> Option<Tile> {
        if self.cursor >= self.tile_count() {
            return None;
        }
        let index_x = self.cursor % self.tiles_x();
        let index_y = self.cursor / self.tiles_x();
        self.cursor += 1;

        let offset_x = index_x * self.tile_width;
        let offset_y = index_y * self.tile_height;
        Some(Tile {
            index_x,
            index_y,
            offset_x,
            offset_y,
            width: self.tile_width.min(self.width - offset_x),
            height: self.tile_height.min(self.height - offset_y),
        })
    }
}

/// The read/write pair of ray-state buffer sets for one bounce step.
///
/// The two sets alternate roles with depth parity; `read` and `write` are
/// always distinct, so a step never sources and targets the same storage.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BounceBuffers {
    pub read: usize,
    pub write: usize,
}

impl BounceBuffers {
    pub fn at_depth(depth: u32) -> Self {
        let read = (depth & 1) as usize;
        Self {
            read,
            write: read ^ 1,
        }
    }

    /// Index of the set holding final per-pixel radiance after `bounces`
    /// iterations of the loop. Ray generation seeds set 0, which depth 0
    /// reads.
    pub fn final_set(bounces: u32) -> usize {
        debug_assert!(bounces > 0);
        Self::at_depth(bounces - 1).write
    }
}

/// Free-flying camera driving primary ray generation.
#[derive(Copy, Clone, Debug)]
pub struct Camera {
    pub position: Vec3,
    pub front: Vec3,
    pub up: Vec3,
    pub fov_y_deg: f32,
    pub znear: f32,
    pub zfar: f32,
}

impl Camera {
    pub fn new() -> Self {
        Self {
            position: Vec3::new(0.0, 1.0, 3.2),
            front: Vec3::new(0.0, 0.0, -1.0),
            up: Vec3::Y,
            fov_y_deg: RaytracerConfig::DEFAULT_FOV_DEG,
            znear: RaytracerConfig::DEFAULT_ZNEAR,
            zfar: RaytracerConfig::DEFAULT_ZFAR,
        }
    }

    pub fn right(&self) -> Vec3 {
        self.front.cross(self.up).normalize()
    }

    pub fn view(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.position + self.front, self.up)
    }

    pub fn projection(&self, aspect: f32) -> Mat4 {
        Mat4::perspective_rh(self.fov_y_deg.to_radians(), aspect, self.znear, self.zfar)
    }

    /// Flattens the camera into the per-frame uniform block consumed by the
    /// generate and shade kernels.
    pub fn frame_uniforms(
        &self,
        resolution: (u32, u32),
        frame_index: u32,
        light_count: u32,
    ) -> FrameUniforms {
        let aspect = resolution.0 as f32 / resolution.1.max(1) as f32;
        let right = self.right();
        let true_up = right.cross(self.front).normalize();
        let half_tan = (self.fov_y_deg.to_radians() * 0.5).tan();
        FrameUniforms {
            camera_position: self.position.extend(1.0).to_array(),
            camera_right: right.extend(aspect).to_array(),
            camera_up: true_up.extend(0.0).to_array(),
            camera_front: self.front.normalize().extend(half_tan).to_array(),
            inv_projection: self.projection(aspect).inverse().to_cols_array_2d(),
            inv_view: self.view().inverse().to_cols_array_2d(),
            resolution: [resolution.0 as f32, resolution.1 as f32],
            frame_index,
            light_count,
        }
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-frame uniform block shared by the generate, shade and post kernels.
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct FrameUniforms {
    pub camera_position: [f32; 4],
    /// xyz: right basis, w: aspect ratio
    pub camera_right: [f32; 4],
    pub camera_up: [f32; 4],
    /// xyz: front basis, w: tan(fov_y / 2)
    pub camera_front: [f32; 4],
    pub inv_projection: [[f32; 4]; 4],
    pub inv_view: [[f32; 4]; 4],
    pub resolution: [f32; 2],
    pub frame_index: u32,
    pub light_count: u32,
}

/// Push constants for the per-tile generate/shade dispatches
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct TilePush {
    /// x, y: pixel offset of the tile; z, w: clipped tile width/height
    pub tile: [i32; 4],
    pub seed: [u32; 2],
    pub depth: u32,
    pub max_depth: u32,
}

impl TilePush {
    pub fn new(tile: &Tile, seed: [u32; 2], depth: u32, max_depth: u32) -> Self {
        Self {
            tile: [
                tile.offset_x as i32,
                tile.offset_y as i32,
                tile.width as i32,
                tile.height as i32,
            ],
            seed,
            depth,
            max_depth,
        }
    }
}

/// Push constants for the present pass
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct PostPush {
    /// 0 = shaded, 1 = positions, 2 = normals, 3 = albedo
    pub view_mode: u32,
    pub exposure: f32,
}

/// PBR material table entry, f16-packed where precision allows
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct Material {
    pub albedo: [f32; 3],
    /// metallic in the low 16 bits, roughness in the high 16, both f16
    pub metallic_roughness_f16: u32,
    pub emission: [f32; 3],
    /// ior in the low 16 bits, transmission in the high 16, both f16
    pub ior_transmission_f16: u32,
    /// Layer into the base-color texture array, `u32::MAX` when untextured
    pub base_color_texture: u32,
    pub _padding: [u32; 3],
}

impl Material {
    fn pack_f16_pair(low: f32, high: f32) -> u32 {
        (f16::from_f32(low).to_bits() as u32) | ((f16::from_f32(high).to_bits() as u32) << 16)
    }

    pub fn new(
        albedo: [f32; 3],
        metallic: f32,
        roughness: f32,
        emission: [f32; 3],
        ior: f32,
        transmission: f32,
    ) -> Self {
        Self {
            albedo,
            metallic_roughness_f16: Self::pack_f16_pair(metallic, roughness),
            emission,
            ior_transmission_f16: Self::pack_f16_pair(ior, transmission),
            base_color_texture: u32::MAX,
            _padding: [0; 3],
        }
    }

    pub fn diffuse(albedo: [f32; 3]) -> Self {
        Self::new(albedo, 0.0, 1.0, [0.0; 3], 1.5, 0.0)
    }

    pub fn emissive(albedo: [f32; 3], emission: [f32; 3]) -> Self {
        Self::new(albedo, 0.0, 1.0, emission, 1.5, 0.0)
    }

    pub fn with_base_color_texture(mut self, layer: u32) -> Self {
        self.base_color_texture = layer;
        self
    }

    /// Returns (metallic, roughness) unpacked to f32
    pub fn unpack_metallic_roughness(&self) -> (f32, f32) {
        let m = f16::from_bits((self.metallic_roughness_f16 & 0xFFFF) as u16);
        let r = f16::from_bits((self.metallic_roughness_f16 >> 16) as u16);
        (m.to_f32(), r.to_f32())
    }
}

/// Light table entry
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct Light {
    pub position: [f32; 3],
    /// 0 = point, 1 = directional
    pub kind: u32,
    pub color: [f32; 3],
    pub intensity: f32,
}

impl Light {
    pub fn point(position: [f32; 3], color: [f32; 3], intensity: f32) -> Self {
        Self {
            position,
            kind: 0,
            color,
            intensity,
        }
    }

    pub fn directional(direction: [f32; 3], color: [f32; 3], intensity: f32) -> Self {
        Self {
            position: direction,
            kind: 1,
            color,
            intensity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_grid_exact_fit() {
        let grid = TileGrid::new(512, 512, 256, 256);
        assert_eq!(grid.tile_count(), 4);
        let tiles: Vec<_> = grid.collect();
        assert_eq!(tiles.len(), 4);
        assert_eq!(tiles[0].offset_x, 0);
        assert_eq!(tiles[0].width, 256);
        assert_eq!(tiles[3].offset_x, 256);
        assert_eq!(tiles[3].offset_y, 256);
        assert_eq!(tiles[3].height, 256);
    }

    #[test]
    fn tile_grid_clips_trailing_tiles() {
        // 300x200 with 256x256 tiles: a 2x1 grid whose second tile keeps
        // only the remaining 44 columns.
        let grid = TileGrid::new(300, 200, 256, 256);
        assert_eq!((grid.tiles_x(), grid.tiles_y()), (2, 1));
        let tiles: Vec<_> = grid.collect();
        assert_eq!(
            tiles[1],
            Tile {
                index_x: 1,
                index_y: 0,
                offset_x: 256,
                offset_y: 0,
                width: 44,
                height: 200,
            }
        );
    }

    #[test]
    fn tile_grid_covers_framebuffer_without_overlap() {
        for &(w, h, tw, th) in &[
            (300u32, 200u32, 256u32, 256u32),
            (1280, 720, 256, 256),
            (33, 17, 16, 16),
            (256, 256, 300, 300),
            (1, 1, 64, 64),
        ] {
            let mut covered = vec![false; (w * h) as usize];
            for tile in TileGrid::new(w, h, tw, th) {
                for y in tile.offset_y..tile.offset_y + tile.height {
                    for x in tile.offset_x..tile.offset_x + tile.width {
                        let idx = (y * w + x) as usize;
                        assert!(!covered[idx], "pixel ({x},{y}) covered twice");
                        covered[idx] = true;
                    }
                }
            }
            assert!(covered.iter().all(|&c| c), "{w}x{h}/{tw}x{th} left gaps");
        }
    }

    #[test]
    fn tile_grid_is_row_major() {
        let tiles: Vec<_> = TileGrid::new(600, 600, 256, 256).collect();
        let indices: Vec<_> = tiles.iter().map(|t| (t.index_x, t.index_y)).collect();
        assert_eq!(
            indices,
            vec![
                (0, 0),
                (1, 0),
                (2, 0),
                (0, 1),
                (1, 1),
                (2, 1),
                (0, 2),
                (1, 2),
                (2, 2)
            ]
        );
    }

    #[test]
    fn bounce_buffers_never_alias() {
        for depth in 0..16 {
            let bb = BounceBuffers::at_depth(depth);
            assert_ne!(bb.read, bb.write);
            assert!(bb.read < 2 && bb.write < 2);
        }
    }

    #[test]
    fn bounce_buffers_alternate_with_depth() {
        assert_eq!(BounceBuffers::at_depth(0), BounceBuffers { read: 0, write: 1 });
        assert_eq!(BounceBuffers::at_depth(1), BounceBuffers { read: 1, write: 0 });
        assert_eq!(BounceBuffers::at_depth(2), BounceBuffers { read: 0, write: 1 });
    }

    #[test]
    fn final_set_follows_last_write() {
        // One bounce: generation fills set 0, depth 0 writes set 1.
        assert_eq!(BounceBuffers::final_set(1), 1);
        assert_eq!(BounceBuffers::final_set(5), BounceBuffers::at_depth(4).write);
    }

    #[test]
    fn update_flags_compose() {
        let mut flags = UpdateFlags::NO_UPDATE;
        assert!(flags.is_empty());
        flags.insert(UpdateFlags::ACCESSOR_CODE);
        flags.insert(UpdateFlags::INSTANCE_UPDATE);
        assert!(!flags.is_empty());
        assert!(flags.contains(UpdateFlags::ACCESSOR_CODE));
        assert!(!flags.contains(UpdateFlags::ACCESSOR_BINDINGS));
        let taken = flags.take();
        assert!(flags.is_empty());
        assert!(taken.contains(UpdateFlags::INSTANCE_UPDATE));
    }

    #[test]
    fn material_packs_f16_pairs() {
        let material = Material::new([0.5, 0.5, 0.5], 0.25, 0.75, [0.0; 3], 1.5, 0.0);
        let (metallic, roughness) = material.unpack_metallic_roughness();
        assert!((metallic - 0.25).abs() < 1e-3);
        assert!((roughness - 0.75).abs() < 1e-3);
    }

    #[test]
    fn frame_uniforms_encode_camera_basis() {
        let camera = Camera::new();
        let uniforms = camera.frame_uniforms((640, 480), 7, 2);
        assert_eq!(uniforms.frame_index, 7);
        assert_eq!(uniforms.light_count, 2);
        assert!((uniforms.camera_right[3] - 640.0 / 480.0).abs() < 1e-6);
        // Basis is orthonormal
        let dot = uniforms.camera_right[0] * uniforms.camera_front[0]
            + uniforms.camera_right[1] * uniforms.camera_front[1]
            + uniforms.camera_right[2] * uniforms.camera_front[2];
        assert!(dot.abs() < 1e-5);
    }
}
