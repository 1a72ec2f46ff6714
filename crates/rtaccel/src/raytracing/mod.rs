//! Ray tracing acceleration structures.
//!
//! Per-object BLAS over triangle geometry, one TLAS over the instance table,
//! and the bookkeeping that ties shader-visible custom indices to object
//! positions.

pub mod acceleration;
pub mod builder;
pub mod geometry;
pub mod instances;
pub mod objects;
pub mod scratch;

#[cfg(test)]
pub(crate) mod mock;

pub use acceleration::{AccelerationStructure, Blas, Tlas};
pub use geometry::{GeometryAddresses, GeometrySource, TriangleGeometry};
pub use instances::{row_major_3x4, InstanceRecord, InstanceTable, RECORD_SIZE};
pub use objects::{BatchReport, ObjectId, ObjectIndex, ObjectRegistry, SkippedObject, MAX_CUSTOM_INDEX};
pub use scratch::ScratchBuffer;
