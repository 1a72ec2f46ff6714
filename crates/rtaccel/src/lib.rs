#![allow(clippy::missing_safety_doc)]
//! Vulkan ray tracing acceleration structure management.
//!
//! An [`AccelerationStructure`] owns one BLAS per registered object, a TLAS
//! over their instance records, and every buffer behind them. Device
//! services are injected through [`AccelBackend`]: the [`vulkan`] module
//! provides implementations over `ash` and `gpu-allocator`, and a renderer
//! can supply its own.
//!
//! ```no_run
//! # use rtaccel::*;
//! # fn scene() -> (Vec<ObjectId>, Box<dyn GeometrySource>) { unimplemented!() }
//! # fn main() -> rtaccel::Result<()> {
//! unsafe {
//!     let ctx = VulkanContext::new(false)?;
//!     let memory = MemoryManager::new(&ctx)?;
//!     let mut commands = CommandManager::new(&ctx)?;
//!     let dispatch = AccelDispatchTable::new(&ctx)?;
//!     let backend = AccelBackend::new(&memory, &commands, &dispatch);
//!
//!     let (objects, geometry) = scene();
//!     let (mut accel, _report) = AccelerationStructure::with_objects(AccelConfig::from_device(&ctx), &objects);
//!     accel.build_blas(&backend, geometry.as_ref())?;
//!     accel.build_tlas(&backend, geometry.as_ref())?;
//!
//!     // per frame
//!     accel.update_blas(&backend, geometry.as_ref(), &objects)?;
//!     accel.update_tlas(&backend, geometry.as_ref(), &objects)?;
//!
//!     accel.destroy(&backend);
//!     commands.destroy();
//! }
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod raytracing;
pub mod vulkan;

pub use backend::{AccelBackend, AccelDispatch, Barrier, BufferProvider, CommandExecutor};
pub use config::AccelConfig;
pub use error::{AccelError, Result};
pub use raytracing::{
    AccelerationStructure, BatchReport, Blas, GeometrySource, InstanceRecord, ObjectId, ObjectIndex, SkippedObject,
    Tlas,
};
pub use vulkan::{AccelDispatchTable, Buffer, CommandManager, MemoryManager, VulkanContext};
