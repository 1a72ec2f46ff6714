//! BLAS and TLAS build and update paths.
//!
//! Every batch follows the same order: geometry descriptors, size queries,
//! buffer allocation, then one command buffer with a barrier after each
//! build, submitted and waited on. All fallible host work happens before
//! recording starts, so a failed call never leaves a half-recorded command
//! buffer behind.

use ash::vk;

use super::acceleration::{AccelerationStructure, Blas, Tlas};
use super::geometry::{GeometrySource, TriangleGeometry};
use super::instances::{InstanceRecord, InstanceTable};
use super::objects::{BatchReport, ObjectId, ObjectIndex};
use super::scratch::{batch_scratch_size, ScratchBuffer};
use crate::backend::{AccelBackend, Barrier};
use crate::config::AccelConfig;
use crate::error::{AccelError, Result};
use crate::vulkan::Buffer;

/// How `update_blas` refreshes one BLAS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refresh {
    /// Same primitive and vertex counts: refit in place with `src == dst`.
    Update,
    /// Counts changed but the build still fits the storage buffer.
    RebuildInPlace,
    /// Storage outgrown: build into a new buffer and handle.
    Reallocate,
}

/// One BLAS build or update command within a batch.
struct BlasCommand {
    geometry: TriangleGeometry,
    flags: vk::BuildAccelerationStructureFlagsKHR,
    mode: vk::BuildAccelerationStructureModeKHR,
    src: vk::AccelerationStructureKHR,
    dst: vk::AccelerationStructureKHR,
    scratch_size: vk::DeviceSize,
}

/// New storage for a BLAS that outgrew its buffer.
struct Replacement {
    index: ObjectIndex,
    handle: vk::AccelerationStructureKHR,
    buffer: Buffer,
    address: vk::DeviceAddress,
}

impl AccelerationStructure {
    /// Build one BLAS per registered object.
    ///
    /// All builds share a single scratch buffer sized to the largest
    /// requirement in the batch and are submitted together. Objects with no
    /// triangles still get a (degenerate) BLAS.
    #[tracing::instrument(skip_all, fields(objects = self.len()))]
    pub unsafe fn build_blas(&mut self, backend: &AccelBackend<'_>, geometry: &dyn GeometrySource) -> Result<()> {
        self.ensure_alive()?;
        if self.blas_built {
            return Err(AccelError::AlreadyBuilt("BLAS set"));
        }

        if self.objects.is_empty() {
            tracing::debug!("no objects registered, BLAS set is empty");
            self.blas_built = true;
            return Ok(());
        }

        let mut built = Vec::with_capacity(self.objects.len());
        let mut commands = Vec::with_capacity(self.objects.len());

        for (_, id) in self.objects.iter() {
            let triangles = TriangleGeometry::query(geometry, id, self.config.geometry_flags);
            let flags = self.config.blas_flags(geometry.is_dynamic(id));
            let sizes = blas_sizes(backend, &triangles, flags, vk::BuildAccelerationStructureModeKHR::BUILD);

            let created = backend.create_acceleration_structure(
                vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                self.config.buffer_size(sizes.acceleration_structure_size),
                "blas_buffer",
            );
            let (handle, buffer, device_address) = match created {
                Ok(parts) => parts,
                Err(e) => {
                    destroy_blas(backend, built);
                    return Err(e);
                }
            };

            if triangles.primitive_count == 0 {
                tracing::debug!(object = id.0, "object has no triangles, building empty BLAS");
            }

            commands.push(BlasCommand {
                geometry: triangles,
                flags,
                mode: vk::BuildAccelerationStructureModeKHR::BUILD,
                src: vk::AccelerationStructureKHR::null(),
                dst: handle,
                scratch_size: sizes.build_scratch_size,
            });
            built.push(Blas {
                handle,
                buffer,
                device_address,
                primitive_count: triangles.primitive_count,
                vertex_count: triangles.vertex_count,
                geometry: triangles.addresses,
                flags,
            });
        }

        if let Err(e) = submit_blas_batch(backend, &self.config, &commands, "BLAS build") {
            destroy_blas(backend, built);
            return Err(e);
        }

        tracing::debug!(count = built.len(), "built BLAS set");
        self.blas = built;
        self.blas_built = true;
        Ok(())
    }

    /// Refresh the BLAS of `objects` from their current geometry.
    ///
    /// Unknown objects, repeats and objects without a BLAS are skipped and
    /// reported. Each remaining BLAS is refit in place when its primitive
    /// and vertex counts are unchanged, rebuilt into its existing storage
    /// when either changed but the build still fits, and moved to new
    /// storage otherwise. A moved
    /// BLAS has a new device address; its instance record is rewritten by
    /// the next [`AccelerationStructure::update_tlas`].
    #[tracing::instrument(skip_all, fields(requested = objects.len()))]
    pub unsafe fn update_blas(
        &mut self,
        backend: &AccelBackend<'_>,
        geometry: &dyn GeometrySource,
        objects: &[ObjectId],
    ) -> Result<BatchReport> {
        self.ensure_alive()?;

        let mut report = BatchReport::default();
        let resolved = self.objects.resolve(objects, &mut report);

        let mut commands = Vec::with_capacity(resolved.len());
        let mut refreshed = Vec::with_capacity(resolved.len());
        let mut replacements: Vec<Replacement> = Vec::new();

        for (index, id) in resolved {
            let Some(blas) = self.blas.get(index.as_usize()) else {
                report.skip(id, AccelError::BlasNotBuilt(id));
                continue;
            };

            let triangles = TriangleGeometry::query(geometry, id, self.config.geometry_flags);
            // An update must see the same primitive count and max vertex as
            // the build that produced the source structure.
            let refit = triangles.primitive_count == blas.primitive_count
                && triangles.vertex_count == blas.vertex_count
                && blas.flags.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE);

            let (refresh, command) = if refit {
                let sizes = blas_sizes(backend, &triangles, blas.flags, vk::BuildAccelerationStructureModeKHR::UPDATE);
                let command = BlasCommand {
                    geometry: triangles,
                    flags: blas.flags,
                    mode: vk::BuildAccelerationStructureModeKHR::UPDATE,
                    src: blas.handle,
                    dst: blas.handle,
                    scratch_size: sizes.update_scratch_size,
                };
                (Refresh::Update, command)
            } else {
                let flags = self.config.blas_flags(geometry.is_dynamic(id));
                let sizes = blas_sizes(backend, &triangles, flags, vk::BuildAccelerationStructureModeKHR::BUILD);

                let (refresh, dst) = if sizes.acceleration_structure_size <= blas.buffer.size() {
                    (Refresh::RebuildInPlace, blas.handle)
                } else {
                    let created = backend.create_acceleration_structure(
                        vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                        self.config.buffer_size(sizes.acceleration_structure_size),
                        "blas_buffer",
                    );
                    match created {
                        Ok((handle, buffer, address)) => {
                            replacements.push(Replacement { index, handle, buffer, address });
                            (Refresh::Reallocate, handle)
                        }
                        Err(e) => {
                            destroy_replacements(backend, replacements);
                            return Err(e);
                        }
                    }
                };

                let command = BlasCommand {
                    geometry: triangles,
                    flags,
                    mode: vk::BuildAccelerationStructureModeKHR::BUILD,
                    src: vk::AccelerationStructureKHR::null(),
                    dst,
                    scratch_size: sizes.build_scratch_size,
                };
                (refresh, command)
            };

            tracing::trace!(object = id.0, ?refresh, primitives = triangles.primitive_count, "refreshing BLAS");
            refreshed.push((index, command.geometry, command.flags));
            commands.push(command);
        }

        if commands.is_empty() {
            return Ok(report);
        }

        if let Err(e) = submit_blas_batch(backend, &self.config, &commands, "BLAS update") {
            destroy_replacements(backend, replacements);
            return Err(e);
        }

        for (index, triangles, flags) in refreshed {
            let blas = &mut self.blas[index.as_usize()];
            blas.geometry = triangles.addresses;
            blas.primitive_count = triangles.primitive_count;
            blas.vertex_count = triangles.vertex_count;
            blas.flags = flags;
            report.processed.push(index);
        }

        // The batch has completed, so the old storage is no longer referenced.
        for replacement in replacements {
            let blas = &mut self.blas[replacement.index.as_usize()];
            let old_handle = std::mem::replace(&mut blas.handle, replacement.handle);
            let old_buffer = std::mem::replace(&mut blas.buffer, replacement.buffer);
            blas.device_address = replacement.address;

            backend.dispatch.destroy_acceleration_structure(old_handle);
            backend.memory.destroy_buffer(old_buffer);

            if !self.stale_instances.contains(&replacement.index) {
                self.stale_instances.push(replacement.index);
            }
            tracing::debug!(index = replacement.index.get(), "moved BLAS to larger storage");
        }

        Ok(report)
    }

    /// Upload the instance table and build the TLAS.
    ///
    /// Allocates the TLAS storage, one instance buffer and one scratch
    /// buffer per frame in flight, and advances the generation counter.
    #[tracing::instrument(skip_all, fields(objects = self.len()))]
    pub unsafe fn build_tlas(&mut self, backend: &AccelBackend<'_>, geometry: &dyn GeometrySource) -> Result<()> {
        self.ensure_alive()?;
        if self.tlas.is_some() {
            return Err(AccelError::AlreadyBuilt("TLAS"));
        }
        if !self.blas_built {
            return Err(AccelError::NotReady("BLAS set must be built before the TLAS"));
        }

        let records: Vec<_> = self
            .objects
            .iter()
            .map(|(index, id)| instance_for(&self.config, &self.blas[index.as_usize()], geometry, index, id))
            .collect();

        let instances = InstanceTable::new(backend.memory, &records, self.config.frames_in_flight)?;
        let tlas = match create_tlas(backend, &self.config, &instances) {
            Ok(tlas) => tlas,
            Err(e) => {
                instances.destroy(backend.memory);
                return Err(e);
            }
        };

        let slot = self.active_slot();
        let submitted = submit_tlas(
            backend,
            &tlas,
            &instances,
            slot,
            vk::BuildAccelerationStructureModeKHR::BUILD,
            "TLAS build",
        );
        if let Err(e) = submitted {
            tlas.destroy(backend);
            instances.destroy(backend.memory);
            return Err(e);
        }

        tracing::debug!(instances = instances.len(), slot, "built TLAS");
        self.tlas = Some(tlas);
        self.instances = Some(instances);
        self.stale_instances.clear();
        self.generation += 1;
        Ok(())
    }

    /// Rewrite the instance records of `objects`, plus any whose BLAS moved
    /// since the last TLAS update, and refit the TLAS in place.
    ///
    /// Only the changed records are written and flushed; the whole table is
    /// then copied to the instance buffer of the active frame slot.
    #[tracing::instrument(skip_all, fields(requested = objects.len(), generation = self.generation))]
    pub unsafe fn update_tlas(
        &mut self,
        backend: &AccelBackend<'_>,
        geometry: &dyn GeometrySource,
        objects: &[ObjectId],
    ) -> Result<BatchReport> {
        self.ensure_alive()?;

        let slot = self.active_slot();
        let (Some(tlas), Some(instances)) = (self.tlas.as_ref(), self.instances.as_mut()) else {
            return Err(AccelError::NotReady("TLAS must be built before it can be updated"));
        };

        let mut report = BatchReport::default();
        let resolved = self.objects.resolve(objects, &mut report);

        let mut updates = Vec::with_capacity(resolved.len() + self.stale_instances.len());
        for &(index, id) in &resolved {
            let blas = &self.blas[index.as_usize()];
            updates.push((index, instance_for(&self.config, blas, geometry, index, id)));
            report.processed.push(index);
        }
        for &index in &self.stale_instances {
            if resolved.iter().any(|&(resolved_index, _)| resolved_index == index) {
                continue;
            }
            let Some(id) = self.objects.id(index) else {
                continue;
            };
            let blas = &self.blas[index.as_usize()];
            updates.push((index, instance_for(&self.config, blas, geometry, index, id)));
        }

        instances.write_records(backend.memory, &updates)?;
        self.stale_instances.clear();

        let mode = if tlas.flags.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE) {
            vk::BuildAccelerationStructureModeKHR::UPDATE
        } else {
            vk::BuildAccelerationStructureModeKHR::BUILD
        };
        submit_tlas(backend, tlas, instances, slot, mode, "TLAS update")?;

        tracing::trace!(written = updates.len(), slot, "updated TLAS");
        self.generation += 1;
        Ok(report)
    }
}

fn instance_for(
    config: &AccelConfig,
    blas: &Blas,
    geometry: &dyn GeometrySource,
    index: ObjectIndex,
    id: ObjectId,
) -> InstanceRecord {
    InstanceRecord::for_object(&geometry.transform(id), index, blas.device_address, config.default_mask)
}

unsafe fn blas_sizes(
    backend: &AccelBackend<'_>,
    triangles: &TriangleGeometry,
    flags: vk::BuildAccelerationStructureFlagsKHR,
    mode: vk::BuildAccelerationStructureModeKHR,
) -> vk::AccelerationStructureBuildSizesInfoKHR<'static> {
    let geometries = [triangles.to_vk()];
    let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
        .flags(flags)
        .mode(mode)
        .geometries(&geometries);

    backend.dispatch.build_sizes(&build_info, &[triangles.primitive_count])
}

/// Record `commands` through one shared scratch buffer, submit, and wait.
unsafe fn submit_blas_batch(
    backend: &AccelBackend<'_>,
    config: &AccelConfig,
    commands: &[BlasCommand],
    what: &str,
) -> Result<()> {
    let scratch = ScratchBuffer::new(
        backend.memory,
        batch_scratch_size(commands.iter().map(|c| c.scratch_size)),
        config.scratch_alignment,
        "blas_scratch",
    )?;

    let result = record_blas_commands(backend, &scratch, commands, what);
    scratch.release(backend.memory);
    result
}

unsafe fn record_blas_commands(
    backend: &AccelBackend<'_>,
    scratch: &ScratchBuffer,
    commands: &[BlasCommand],
    what: &str,
) -> Result<()> {
    let cmd = backend.commands.begin()?;

    for command in commands {
        let geometries = [command.geometry.to_vk()];
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(command.flags)
            .mode(command.mode)
            .src_acceleration_structure(command.src)
            .dst_acceleration_structure(command.dst)
            .geometries(&geometries)
            .scratch_data(scratch.device_or_host_address());

        let build_ranges: &[vk::AccelerationStructureBuildRangeInfoKHR] = &[command.geometry.build_range()];
        backend.dispatch.cmd_build(cmd, &[build_info], &[build_ranges]);

        // The next build reuses the scratch region.
        backend.commands.insert_barrier(cmd, Barrier::BUILD_TO_BUILD);
    }

    backend.submit(cmd, what)
}

fn instance_geometry(address: vk::DeviceAddress) -> vk::AccelerationStructureGeometryKHR<'static> {
    let instances = vk::AccelerationStructureGeometryInstancesDataKHR::default()
        .array_of_pointers(false)
        .data(vk::DeviceOrHostAddressConstKHR { device_address: address });

    vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .geometry(vk::AccelerationStructureGeometryDataKHR { instances })
}

/// Create the TLAS handle, its storage and one scratch buffer per slot.
unsafe fn create_tlas(backend: &AccelBackend<'_>, config: &AccelConfig, instances: &InstanceTable) -> Result<Tlas> {
    let geometries = [instance_geometry(instances.device_address(0))];
    let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
        .flags(config.tlas_flags)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(&geometries);
    let sizes = backend.dispatch.build_sizes(&build_info, &[instances.len()]);

    let (handle, buffer, device_address) = backend.create_acceleration_structure(
        vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        config.buffer_size(sizes.acceleration_structure_size),
        "tlas_buffer",
    )?;

    let mut tlas = Tlas {
        handle,
        buffer,
        device_address,
        instance_count: instances.len(),
        flags: config.tlas_flags,
        scratch: Vec::with_capacity(instances.slots()),
    };

    // Sized for either mode so any slot can serve a build or an update.
    let scratch_size = sizes.build_scratch_size.max(sizes.update_scratch_size);
    for _ in 0..instances.slots() {
        match ScratchBuffer::new(backend.memory, scratch_size, config.scratch_alignment, "tlas_scratch") {
            Ok(scratch) => tlas.scratch.push(scratch),
            Err(e) => {
                tlas.destroy(backend);
                return Err(e);
            }
        }
    }

    Ok(tlas)
}

/// Upload the instance table into `slot`, then build or refit the TLAS from it.
unsafe fn submit_tlas(
    backend: &AccelBackend<'_>,
    tlas: &Tlas,
    instances: &InstanceTable,
    slot: usize,
    mode: vk::BuildAccelerationStructureModeKHR,
    what: &str,
) -> Result<()> {
    let src = if mode == vk::BuildAccelerationStructureModeKHR::UPDATE {
        tlas.handle
    } else {
        vk::AccelerationStructureKHR::null()
    };

    let geometries = [instance_geometry(instances.device_address(slot))];
    let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
        .flags(tlas.flags)
        .mode(mode)
        .src_acceleration_structure(src)
        .dst_acceleration_structure(tlas.handle)
        .geometries(&geometries)
        .scratch_data(tlas.scratch[slot].device_or_host_address());

    let build_range = vk::AccelerationStructureBuildRangeInfoKHR::default()
        .primitive_count(instances.len())
        .primitive_offset(0)
        .first_vertex(0)
        .transform_offset(0);
    let build_ranges: &[vk::AccelerationStructureBuildRangeInfoKHR] = &[build_range];

    let cmd = backend.commands.begin()?;
    instances.record_upload(backend, cmd, slot);
    backend.dispatch.cmd_build(cmd, &[build_info], &[build_ranges]);
    backend.commands.insert_barrier(cmd, Barrier::BUILD_TO_TRACE);
    backend.submit(cmd, what)
}

unsafe fn destroy_blas(backend: &AccelBackend<'_>, blas: Vec<Blas>) {
    for blas in blas {
        blas.destroy(backend);
    }
}

unsafe fn destroy_replacements(backend: &AccelBackend<'_>, replacements: Vec<Replacement>) {
    for replacement in replacements {
        backend.dispatch.destroy_acceleration_structure(replacement.handle);
        backend.memory.destroy_buffer(replacement.buffer);
    }
}
