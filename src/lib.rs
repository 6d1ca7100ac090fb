//! Progressive, tiled, multi-bounce path-tracing orchestrator over an
//! external intersection oracle.
//!
//! The oracle answers "what does this ray hit" through the
//! [`oracle::IntersectionOracle`] contract; everything else — tile
//! scheduling, the ping-pong bounce buffers, progressive accumulation and
//! the shading-program hot-reload protocol — lives here.

pub mod accum;
pub mod compute;
pub mod driver;
pub mod gltf_loader;
pub mod input;
pub mod kernels;
pub mod linear_oracle;
pub mod oracle;
pub mod renderer;
pub mod scene;
pub mod sync;
pub mod targets;

pub use driver::{FrameError, PathTracer};
pub use linear_oracle::LinearOracle;
pub use oracle::IntersectionOracle;
pub use scene::SceneState;
