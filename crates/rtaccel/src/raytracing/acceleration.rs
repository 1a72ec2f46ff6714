//! Acceleration structure ownership and lifecycle.
//!
//! An [`AccelerationStructure`] owns every BLAS, the TLAS, their storage
//! buffers, the instance table and the persistent TLAS scratch buffers for
//! one group of objects. Build and update paths live in `builder.rs`.

use ash::vk;

use super::geometry::GeometryAddresses;
use super::instances::{InstanceRecord, InstanceTable};
use super::objects::{BatchReport, ObjectId, ObjectIndex, ObjectRegistry};
use super::scratch::ScratchBuffer;
use crate::backend::AccelBackend;
use crate::config::AccelConfig;
use crate::error::{AccelError, Result};
use crate::vulkan::Buffer;

/// Bottom-level acceleration structure (BLAS) of one object.
pub struct Blas {
    pub(crate) handle: vk::AccelerationStructureKHR,
    pub(crate) buffer: Buffer,
    pub(crate) device_address: vk::DeviceAddress,
    pub(crate) primitive_count: u32,
    pub(crate) vertex_count: u32,
    pub(crate) geometry: GeometryAddresses,
    pub(crate) flags: vk::BuildAccelerationStructureFlagsKHR,
}

impl Blas {
    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.handle
    }

    /// Address referenced by instance records.
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn primitive_count(&self) -> u32 {
        self.primitive_count
    }

    /// Vertex count of the most recent build or update.
    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    /// Geometry addresses of the most recent build or update.
    pub fn geometry(&self) -> GeometryAddresses {
        self.geometry
    }

    pub fn flags(&self) -> vk::BuildAccelerationStructureFlagsKHR {
        self.flags
    }

    /// A BLAS with no triangles is valid but never hit.
    pub fn is_empty(&self) -> bool {
        self.primitive_count == 0
    }

    pub(crate) unsafe fn destroy(self, backend: &AccelBackend<'_>) {
        backend.dispatch.destroy_acceleration_structure(self.handle);
        backend.memory.destroy_buffer(self.buffer);
    }
}

/// Top-level acceleration structure (TLAS).
pub struct Tlas {
    pub(crate) handle: vk::AccelerationStructureKHR,
    pub(crate) buffer: Buffer,
    pub(crate) device_address: vk::DeviceAddress,
    pub(crate) instance_count: u32,
    pub(crate) flags: vk::BuildAccelerationStructureFlagsKHR,
    /// One scratch buffer per frame slot, kept for in-place updates.
    pub(crate) scratch: Vec<ScratchBuffer>,
}

impl Tlas {
    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.handle
    }

    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    pub fn flags(&self) -> vk::BuildAccelerationStructureFlagsKHR {
        self.flags
    }

    pub fn scratch(&self, slot: usize) -> &ScratchBuffer {
        &self.scratch[slot]
    }

    pub(crate) unsafe fn destroy(self, backend: &AccelBackend<'_>) {
        backend.dispatch.destroy_acceleration_structure(self.handle);
        backend.memory.destroy_buffer(self.buffer);
        for scratch in self.scratch {
            scratch.release(backend.memory);
        }
    }
}

/// BLAS set, TLAS and instance table for one group of objects.
pub struct AccelerationStructure {
    pub(crate) config: AccelConfig,
    pub(crate) objects: ObjectRegistry,
    pub(crate) blas: Vec<Blas>,
    pub(crate) blas_built: bool,
    pub(crate) tlas: Option<Tlas>,
    pub(crate) instances: Option<InstanceTable>,
    /// Objects whose BLAS moved and whose instance record must be rewritten.
    pub(crate) stale_instances: Vec<ObjectIndex>,
    pub(crate) generation: u64,
    pub(crate) destroyed: bool,
}

impl AccelerationStructure {
    /// Create an empty structure.
    pub fn new(config: AccelConfig) -> Self {
        Self {
            config,
            objects: ObjectRegistry::new(),
            blas: Vec::new(),
            blas_built: false,
            tlas: None,
            instances: None,
            stale_instances: Vec::new(),
            generation: 0,
            destroyed: false,
        }
    }

    /// Create a structure over an initial object list.
    ///
    /// Duplicates are reported and skipped; list order becomes build order.
    pub fn with_objects(config: AccelConfig, objects: &[ObjectId]) -> (Self, BatchReport) {
        let mut structure = Self::new(config);
        let report = structure.register_all(objects);
        (structure, report)
    }

    /// Register an object before the BLAS set is built.
    pub fn register(&mut self, id: ObjectId) -> Result<ObjectIndex> {
        self.ensure_alive()?;
        if self.blas_built {
            return Err(AccelError::AlreadyBuilt("BLAS set"));
        }
        self.objects.register(id)
    }

    /// Register several objects, skipping and reporting failures.
    pub fn register_all(&mut self, ids: &[ObjectId]) -> BatchReport {
        let mut report = BatchReport::default();
        for &id in ids {
            match self.register(id) {
                Ok(index) => report.processed.push(index),
                Err(e) => report.skip(id, e),
            }
        }
        report
    }

    pub(crate) fn ensure_alive(&self) -> Result<()> {
        if self.destroyed {
            Err(AccelError::Destroyed)
        } else {
            Ok(())
        }
    }

    pub fn config(&self) -> &AccelConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn objects(&self) -> &[ObjectId] {
        self.objects.ids()
    }

    pub fn object_index(&self, id: ObjectId) -> Option<ObjectIndex> {
        self.objects.get(id)
    }

    pub fn is_blas_built(&self) -> bool {
        self.blas_built
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn blas(&self, index: ObjectIndex) -> Option<&Blas> {
        self.blas.get(index.as_usize())
    }

    pub fn blas_for(&self, id: ObjectId) -> Option<&Blas> {
        self.object_index(id).and_then(|index| self.blas(index))
    }

    pub fn blas_list(&self) -> &[Blas] {
        &self.blas
    }

    pub fn tlas(&self) -> Option<&Tlas> {
        self.tlas.as_ref()
    }

    /// TLAS handle for binding to ray tracing descriptors.
    pub fn tlas_handle(&self) -> Option<vk::AccelerationStructureKHR> {
        self.tlas.as_ref().map(Tlas::handle)
    }

    pub fn tlas_address(&self) -> Option<vk::DeviceAddress> {
        self.tlas.as_ref().map(Tlas::device_address)
    }

    pub fn instance_table(&self) -> Option<&InstanceTable> {
        self.instances.as_ref()
    }

    pub fn instance_record(&self, id: ObjectId) -> Option<InstanceRecord> {
        let index = self.object_index(id)?;
        self.instances.as_ref()?.record(index)
    }

    /// Number of completed TLAS builds and updates.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Frame slot the next TLAS build or update will use.
    pub fn active_slot(&self) -> usize {
        (self.generation % self.config.frames_in_flight.max(1) as u64) as usize
    }

    fn owns_resources(&self) -> bool {
        !self.blas.is_empty() || self.tlas.is_some() || self.instances.is_some()
    }

    /// Release every buffer and handle. Calling it again is a no-op.
    pub unsafe fn destroy(&mut self, backend: &AccelBackend<'_>) {
        if self.destroyed {
            return;
        }

        let blas_count = self.blas.len();
        for blas in self.blas.drain(..) {
            blas.destroy(backend);
        }
        if let Some(tlas) = self.tlas.take() {
            tlas.destroy(backend);
        }
        if let Some(instances) = self.instances.take() {
            instances.destroy(backend.memory);
        }
        self.stale_instances.clear();
        self.destroyed = true;

        tracing::debug!(blas = blas_count, "destroyed acceleration structure");
    }
}

impl Drop for AccelerationStructure {
    fn drop(&mut self) {
        if !self.destroyed && self.owns_resources() {
            tracing::error!(
                blas = self.blas.len(),
                tlas = self.tlas.is_some(),
                "acceleration structure dropped without destroy(); GPU resources leaked"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raytracing::mock::{MockDevice, MockScene};

    fn built(device: &MockDevice, counts: &[u32]) -> (AccelerationStructure, MockScene, Vec<ObjectId>) {
        let (scene, ids) = MockScene::with_triangle_counts(counts);
        let (mut accel, report) = AccelerationStructure::with_objects(AccelConfig::default(), &ids);
        assert!(report.is_clean());
        unsafe {
            accel.build_blas(&device.backend(), &scene).unwrap();
            accel.build_tlas(&device.backend(), &scene).unwrap();
        }
        (accel, scene, ids)
    }

    // ============================================================
    // Registration
    // ============================================================

    #[test]
    fn test_with_objects_skips_duplicates() {
        let ids = [ObjectId(1), ObjectId(2), ObjectId(1), ObjectId(3)];
        let (accel, report) = AccelerationStructure::with_objects(AccelConfig::default(), &ids);
        assert_eq!(accel.len(), 3);
        assert_eq!(report.processed.len(), 3);
        assert_eq!(report.skipped.len(), 1);
        assert!(matches!(report.skipped[0].error, AccelError::DuplicateObject(ObjectId(1))));
        assert_eq!(accel.objects(), &[ObjectId(1), ObjectId(2), ObjectId(3)]);
    }

    #[test]
    fn test_register_after_blas_build_rejected() {
        let device = MockDevice::new();
        let (mut accel, _scene, _ids) = built(&device, &[1]);
        assert!(matches!(
            accel.register(ObjectId(99)),
            Err(AccelError::AlreadyBuilt(_))
        ));
        unsafe { accel.destroy(&device.backend()) };
    }

    #[test]
    fn test_empty_structure_has_no_resources() {
        let accel = AccelerationStructure::new(AccelConfig::default());
        assert!(accel.is_empty());
        assert!(accel.tlas_handle().is_none());
        assert!(accel.instance_table().is_none());
        assert_eq!(accel.generation(), 0);
        assert_eq!(accel.active_slot(), 0);
    }

    // ============================================================
    // destroy
    // ============================================================

    #[test]
    fn test_destroy_releases_everything() {
        let device = MockDevice::new();
        let (mut accel, _scene, _ids) = built(&device, &[4, 8, 2]);
        assert!(device.live_buffer_count() > 0);
        assert_eq!(device.live_structure_count(), 4);

        unsafe { accel.destroy(&device.backend()) };

        assert!(accel.is_destroyed());
        assert_eq!(device.live_buffer_count(), 0, "leaked: {:?}", device.live_buffer_names());
        assert_eq!(device.live_structure_count(), 0);
        assert!(accel.tlas_handle().is_none());
        assert!(accel.blas_list().is_empty());
    }

    #[test]
    fn test_destroy_twice_is_noop() {
        let device = MockDevice::new();
        let (mut accel, _scene, _ids) = built(&device, &[3, 3]);

        unsafe {
            accel.destroy(&device.backend());
            accel.destroy(&device.backend());
        }

        assert_eq!(device.double_frees(), 0);
        assert!(accel.is_destroyed());
    }

    #[test]
    fn test_operations_after_destroy_fail() {
        let device = MockDevice::new();
        let (mut accel, scene, ids) = built(&device, &[1]);
        unsafe {
            accel.destroy(&device.backend());
            assert!(matches!(accel.update_tlas(&device.backend(), &scene, &ids), Err(AccelError::Destroyed)));
            assert!(matches!(accel.update_blas(&device.backend(), &scene, &ids), Err(AccelError::Destroyed)));
        }
        assert!(matches!(accel.register(ObjectId(50)), Err(AccelError::Destroyed)));
    }

    #[test]
    fn test_destroy_unbuilt_structure() {
        let device = MockDevice::new();
        let (mut accel, _) = AccelerationStructure::with_objects(AccelConfig::default(), &[ObjectId(1)]);
        unsafe { accel.destroy(&device.backend()) };
        assert!(accel.is_destroyed());
        assert_eq!(device.double_frees(), 0);
    }

    // ============================================================
    // Accessors
    // ============================================================

    #[test]
    fn test_active_slot_cycles_with_generation() {
        let mut accel = AccelerationStructure::new(AccelConfig::default().with_frames_in_flight(3));
        let slots: Vec<_> = (0..6)
            .map(|g| {
                accel.generation = g;
                accel.active_slot()
            })
            .collect();
        assert_eq!(slots, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_blas_for_unknown_object() {
        let device = MockDevice::new();
        let (mut accel, _scene, ids) = built(&device, &[1, 2]);
        assert!(accel.blas_for(ObjectId(999)).is_none());
        assert_eq!(accel.blas_for(ids[1]).unwrap().primitive_count(), 2);
        assert!(accel.instance_record(ObjectId(999)).is_none());
        unsafe { accel.destroy(&device.backend()) };
    }
}
