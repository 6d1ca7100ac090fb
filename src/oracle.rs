use pathtracer_shared::UpdateFlags;
use thiserror::Error;

/// Errors surfaced by an intersection oracle. Every variant is frame-fatal
/// for the orchestrator: the current frame is abandoned without touching
/// persistent state and a fresh attempt happens on the next tick.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("geometry is missing its vertex buffer")]
    MissingVertices,
    #[error("face {face} references vertex {index}, but only {count} vertices exist")]
    FaceIndexOutOfBounds {
        face: usize,
        index: i32,
        count: usize,
    },
    #[error("unknown {kind} handle {id}")]
    UnknownHandle { kind: &'static str, id: u32 },
    #[error("scene rebuild failed: {0}")]
    Rebuild(String),
    #[error("ray query failed: {0}")]
    Query(String),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AccelKind {
    /// Top-level structure holding instances of bottom-level geometry
    Tlas,
    /// Bottom-level structure holding triangle geometry
    Blas,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct AccelHandle(pub u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct GeometryId(pub u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct InstanceId(pub u32);

/// Indexed triangle mesh handed to the oracle. The fourth component of every
/// face is the material id it carries through to the hit record.
#[derive(Copy, Clone, Debug)]
pub struct GeometryData<'a> {
    pub vertices: &'a [[f32; 3]],
    pub normals: &'a [[f32; 3]],
    pub uvs: &'a [[f32; 2]],
    pub faces: &'a [[i32; 4]],
}

impl GeometryData<'_> {
    pub fn validate(&self) -> Result<(), OracleError> {
        if self.vertices.is_empty() {
            return Err(OracleError::MissingVertices);
        }
        let count = self.vertices.len();
        for (face, indices) in self.faces.iter().enumerate() {
            for &index in &indices[..3] {
                if index < 0 || index as usize >= count {
                    return Err(OracleError::FaceIndexOutOfBounds { face, index, count });
                }
            }
        }
        Ok(())
    }
}

/// Pixel format and dimensions the orchestrator must allocate for a buffer
/// the oracle reads or writes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufferRequirements {
    pub width: u32,
    pub height: u32,
    pub format: wgpu::TextureFormat,
}

/// One external resource the oracle's accessor source expects bound, in
/// declaration order. The binding index inside the oracle bind group is the
/// position in the `resource_bindings()` list.
pub struct ResourceBinding<'a> {
    pub name: &'a str,
    pub resource: BindingResource<'a>,
}

pub enum BindingResource<'a> {
    UniformBuffer(&'a wgpu::Buffer),
    Texture2d {
        view: &'a wgpu::TextureView,
        sample_type: wgpu::TextureSampleType,
    },
    TextureArray2d {
        view: &'a wgpu::TextureView,
        sample_type: wgpu::TextureSampleType,
    },
}

/// One ray-buffer pair plus the result target for an intersection or
/// occlusion dispatch.
pub struct RayQuery<'a> {
    pub origins: &'a wgpu::TextureView,
    pub directions: &'a wgpu::TextureView,
    pub output: &'a wgpu::TextureView,
    /// Clipped pixel extent of the region holding live rays
    pub dims: (u32, u32),
}

/// The external intersection service the render pipeline is orchestrated
/// around. The orchestrator owns ray buffers and render targets; the oracle
/// owns the scene representation and answers "what does this ray hit".
///
/// `update` must be polled once per frame before any query: its flags drive
/// the shading-program hot-reload protocol, and dispatching against an oracle
/// whose flags were not consumed is a contract violation.
pub trait IntersectionOracle {
    fn create_acceleration_structure(&mut self, kind: AccelKind) -> Result<AccelHandle, OracleError>;

    /// Registers indexed triangle geometry with a BLAS. Fails when the vertex
    /// buffer is absent.
    fn add_geometry(
        &mut self,
        blas: AccelHandle,
        geometry: &GeometryData<'_>,
    ) -> Result<GeometryId, OracleError>;

    /// Places an instance of `blas` into `tlas` with a 4x3 row-major
    /// transform.
    fn add_instance(
        &mut self,
        tlas: AccelHandle,
        blas: AccelHandle,
        transform: [[f32; 4]; 3],
    ) -> Result<InstanceId, OracleError>;

    fn update_instance(
        &mut self,
        tlas: AccelHandle,
        instance: InstanceId,
        transform: [[f32; 4]; 3],
    ) -> Result<(), OracleError>;

    /// Commits pending scene edits and reports what changed since the last
    /// call.
    fn update(&mut self, device: &wgpu::Device, queue: &wgpu::Queue)
        -> Result<UpdateFlags, OracleError>;

    /// WGSL fragment implementing the scene-query functions the shading
    /// kernel links against. Declared bindings must live in
    /// [`crate::kernels::ORACLE_BIND_GROUP`].
    fn scene_accessor_source(&self) -> &str;

    /// Resources that must be bound, in order, for the accessor source to
    /// execute.
    fn resource_bindings(&self) -> Vec<ResourceBinding<'_>>;

    fn ray_buffer_requirements(&self, dims: (u32, u32)) -> BufferRequirements;

    fn intersection_buffer_requirements(&self, dims: (u32, u32)) -> BufferRequirements;

    fn occlusion_buffer_requirements(&self, dims: (u32, u32)) -> BufferRequirements;

    /// Records an intersection dispatch for one ray buffer pair into
    /// `query.output`.
    fn query_intersection(
        &self,
        device: &wgpu::Device,
        encoder: &mut wgpu::CommandEncoder,
        query: RayQuery<'_>,
    ) -> Result<(), OracleError>;

    /// Records an any-hit occlusion dispatch for one ray buffer pair into
    /// `query.output`.
    fn query_occlusion(
        &self,
        device: &wgpu::Device,
        encoder: &mut wgpu::CommandEncoder,
        query: RayQuery<'_>,
    ) -> Result<(), OracleError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_without_vertices_is_rejected() {
        let geometry = GeometryData {
            vertices: &[],
            normals: &[],
            uvs: &[],
            faces: &[[0, 1, 2, 0]],
        };
        assert!(matches!(
            geometry.validate(),
            Err(OracleError::MissingVertices)
        ));
    }

    #[test]
    fn geometry_with_out_of_bounds_face_is_rejected() {
        let vertices = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        let geometry = GeometryData {
            vertices: &vertices,
            normals: &[],
            uvs: &[],
            faces: &[[0, 1, 3, 0]],
        };
        assert!(matches!(
            geometry.validate(),
            Err(OracleError::FaceIndexOutOfBounds { face: 0, index: 3, .. })
        ));
    }

    #[test]
    fn valid_geometry_passes() {
        let vertices = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        let geometry = GeometryData {
            vertices: &vertices,
            normals: &[],
            uvs: &[],
            faces: &[[0, 1, 2, 5]],
        };
        assert!(geometry.validate().is_ok());
    }
}
