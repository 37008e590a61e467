//! Entities module - model records, format parsers and viewer sessions
//!
//! `core` knows nothing about STL or triangles; everything format- or
//! viewer-specific lives here and plugs into `core` through its traits.

pub mod mesh;
pub mod session;
pub mod stl;

pub use mesh::{MeshBounds, Triangle};
pub use session::{SharedContextFlag, ViewerSession};
pub use stl::{StlHeader, StlParser};
