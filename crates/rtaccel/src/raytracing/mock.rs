//! Host-memory device used by unit tests.
//!
//! Hands out fake handles and device addresses, backs every buffer with
//! bytes so copies and flushes can be inspected, executes copies at record
//! time, and logs builds, barriers and submissions in order.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ptr::NonNull;

use ash::vk::{self, Handle};
use glam::Mat4;
use gpu_allocator::MemoryLocation;

use super::{GeometrySource, ObjectId};
use crate::backend::{AccelBackend, AccelDispatch, Barrier, BufferProvider, CommandExecutor};
use crate::error::{AccelError, Result};
use crate::vulkan::Buffer;

/// Storage size the mock reports for a structure with `primitives` primitives.
pub fn storage_size(primitives: u32) -> vk::DeviceSize {
    1024 + 256 * primitives as vk::DeviceSize
}

pub fn build_scratch_size(primitives: u32) -> vk::DeviceSize {
    512 + 128 * primitives as vk::DeviceSize
}

pub fn update_scratch_size(primitives: u32) -> vk::DeviceSize {
    256 + 64 * primitives as vk::DeviceSize
}

/// One recorded `vkCmdBuildAccelerationStructuresKHR` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedBuild {
    pub cmd: vk::CommandBuffer,
    pub ty: vk::AccelerationStructureTypeKHR,
    pub mode: vk::BuildAccelerationStructureModeKHR,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    pub src: vk::AccelerationStructureKHR,
    pub dst: vk::AccelerationStructureKHR,
    pub scratch_address: vk::DeviceAddress,
    pub primitive_count: u32,
    pub vertex_address: vk::DeviceAddress,
    pub index_address: vk::DeviceAddress,
    pub instance_address: vk::DeviceAddress,
}

/// Ordered command log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Copy { src: vk::Buffer, dst: vk::Buffer, size: vk::DeviceSize },
    Build(vk::AccelerationStructureTypeKHR, vk::BuildAccelerationStructureModeKHR),
    Barrier(Barrier),
    Submit,
}

struct MockBuffer {
    name: String,
    size: vk::DeviceSize,
    address: Option<vk::DeviceAddress>,
    data: Box<[u8]>,
}

struct MockStructure {
    address: vk::DeviceAddress,
}

#[derive(Default)]
struct MockState {
    next_handle: u64,
    next_address: u64,
    buffers: HashMap<u64, MockBuffer>,
    created: Vec<(String, vk::DeviceSize)>,
    structures: HashMap<u64, MockStructure>,
    structures_created: usize,
    builds: Vec<RecordedBuild>,
    events: Vec<Event>,
    flushes: Vec<(vk::Buffer, vk::DeviceSize, vk::DeviceSize)>,
    submits: usize,
    double_frees: usize,
    fail_flushes: bool,
    fail_submits: bool,
}

impl MockState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

pub struct MockDevice {
    state: RefCell<MockState>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(MockState {
                // Keep addresses off 128-byte boundaries so alignment is exercised.
                next_address: 0x1_0000,
                ..Default::default()
            }),
        }
    }

    pub fn backend(&self) -> AccelBackend<'_> {
        AccelBackend::new(self, self, self)
    }

    pub fn begin_cmd(&self) -> vk::CommandBuffer {
        unsafe { self.begin() }.unwrap()
    }

    pub fn live_buffer_count(&self) -> usize {
        self.state.borrow().buffers.len()
    }

    pub fn live_structure_count(&self) -> usize {
        self.state.borrow().structures.len()
    }

    pub fn structures_created(&self) -> usize {
        self.state.borrow().structures_created
    }

    /// Sizes of every buffer ever created under `name`.
    pub fn buffers_named(&self, name: &str) -> Vec<vk::DeviceSize> {
        self.state
            .borrow()
            .created
            .iter()
            .filter(|(n, _)| n == name)
            .map(|&(_, size)| size)
            .collect()
    }

    /// Names of buffers still alive.
    pub fn live_buffer_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.borrow().buffers.values().map(|b| b.name.clone()).collect();
        names.sort();
        names
    }

    pub fn buffer_bytes(&self, buffer: vk::Buffer) -> Vec<u8> {
        self.state.borrow().buffers[&buffer.as_raw()].data.to_vec()
    }

    pub fn flushes(&self) -> Vec<(vk::Buffer, vk::DeviceSize, vk::DeviceSize)> {
        self.state.borrow().flushes.clone()
    }

    pub fn clear_flushes(&self) {
        self.state.borrow_mut().flushes.clear();
    }

    pub fn fail_flushes(&self, fail: bool) {
        self.state.borrow_mut().fail_flushes = fail;
    }

    pub fn fail_submits(&self, fail: bool) {
        self.state.borrow_mut().fail_submits = fail;
    }

    pub fn builds(&self) -> Vec<RecordedBuild> {
        self.state.borrow().builds.clone()
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.borrow().events.clone()
    }

    pub fn barriers(&self) -> Vec<Barrier> {
        self.state
            .borrow()
            .events
            .iter()
            .filter_map(|e| match e {
                Event::Barrier(b) => Some(*b),
                _ => None,
            })
            .collect()
    }

    /// Forget recorded builds, events and flushes.
    pub fn clear_log(&self) {
        let mut state = self.state.borrow_mut();
        state.builds.clear();
        state.events.clear();
        state.flushes.clear();
    }

    pub fn submits(&self) -> usize {
        self.state.borrow().submits
    }

    pub fn double_frees(&self) -> usize {
        self.state.borrow().double_frees
    }

    /// Host-visible buffer whose memory is not mapped.
    pub fn unmapped_buffer(&self, size: vk::DeviceSize) -> Buffer {
        let mut state = self.state.borrow_mut();
        let raw = state.handle();
        state.buffers.insert(
            raw,
            MockBuffer {
                name: "unmapped".into(),
                size,
                address: None,
                data: vec![0; size as usize].into_boxed_slice(),
            },
        );
        unsafe {
            Buffer::from_raw_parts(
                vk::Buffer::from_raw(raw),
                size,
                vk::BufferUsageFlags::TRANSFER_SRC,
                MemoryLocation::CpuToGpu,
                None,
                None,
            )
        }
    }
}

impl BufferProvider for MockDevice {
    unsafe fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<Buffer> {
        let mut state = self.state.borrow_mut();
        let raw = state.handle();

        let address = usage
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
            .then(|| state.next_address + 64);
        state.next_address += (size + 511) / 256 * 256;

        let mut data = vec![0u8; size.max(1) as usize].into_boxed_slice();
        let mapped = (location != MemoryLocation::GpuOnly).then(|| NonNull::new(data.as_mut_ptr())).flatten();

        state.created.push((name.to_string(), size));
        state.buffers.insert(
            raw,
            MockBuffer {
                name: name.to_string(),
                size,
                address,
                data,
            },
        );

        Ok(Buffer::from_raw_parts(
            vk::Buffer::from_raw(raw),
            size,
            usage,
            location,
            address,
            mapped,
        ))
    }

    unsafe fn destroy_buffer(&self, buffer: Buffer) {
        let mut state = self.state.borrow_mut();
        if state.buffers.remove(&buffer.handle().as_raw()).is_none() {
            state.double_frees += 1;
        }
    }

    unsafe fn flush(&self, buffer: &Buffer, offset: vk::DeviceSize, size: vk::DeviceSize) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.fail_flushes {
            return Err(AccelError::vulkan("vkFlushMappedMemoryRanges", vk::Result::ERROR_OUT_OF_HOST_MEMORY));
        }
        state.flushes.push((buffer.handle(), offset, size));
        Ok(())
    }

    unsafe fn cmd_copy_buffer(
        &self,
        _cmd: vk::CommandBuffer,
        src: &Buffer,
        dst: &Buffer,
        region: vk::BufferCopy,
    ) {
        let mut state = self.state.borrow_mut();
        let (from, to, len) = (region.src_offset as usize, region.dst_offset as usize, region.size as usize);
        let bytes = state.buffers[&src.handle().as_raw()].data[from..from + len].to_vec();
        let target = state.buffers.get_mut(&dst.handle().as_raw()).expect("copy into freed buffer");
        assert!(to + len <= target.size as usize, "copy past end of buffer");
        target.data[to..to + len].copy_from_slice(&bytes);
        state.events.push(Event::Copy {
            src: src.handle(),
            dst: dst.handle(),
            size: region.size,
        });
    }
}

impl CommandExecutor for MockDevice {
    unsafe fn begin(&self) -> Result<vk::CommandBuffer> {
        let mut state = self.state.borrow_mut();
        Ok(vk::CommandBuffer::from_raw(state.handle()))
    }

    unsafe fn submit_and_wait(&self, _cmd: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.fail_submits {
            return Err(AccelError::vulkan("vkQueueSubmit", vk::Result::ERROR_DEVICE_LOST));
        }
        state.submits += 1;
        state.events.push(Event::Submit);
        Ok(())
    }

    unsafe fn insert_barrier(&self, _cmd: vk::CommandBuffer, barrier: Barrier) {
        self.state.borrow_mut().events.push(Event::Barrier(barrier));
    }
}

impl AccelDispatch for MockDevice {
    unsafe fn build_sizes(
        &self,
        _build_info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        max_primitive_counts: &[u32],
    ) -> vk::AccelerationStructureBuildSizesInfoKHR<'static> {
        let primitives = max_primitive_counts.iter().sum();
        vk::AccelerationStructureBuildSizesInfoKHR::default()
            .acceleration_structure_size(storage_size(primitives))
            .build_scratch_size(build_scratch_size(primitives))
            .update_scratch_size(update_scratch_size(primitives))
    }

    unsafe fn create_acceleration_structure(
        &self,
        create_info: &vk::AccelerationStructureCreateInfoKHR<'_>,
    ) -> Result<vk::AccelerationStructureKHR> {
        let mut state = self.state.borrow_mut();
        let backing = &state.buffers[&create_info.buffer.as_raw()];
        assert!(create_info.offset + create_info.size <= backing.size, "structure larger than its buffer");
        let address = backing.address.expect("storage buffer without device address") + create_info.offset;

        let raw = state.handle();
        state.structures.insert(raw, MockStructure { address });
        state.structures_created += 1;
        Ok(vk::AccelerationStructureKHR::from_raw(raw))
    }

    unsafe fn destroy_acceleration_structure(&self, handle: vk::AccelerationStructureKHR) {
        let mut state = self.state.borrow_mut();
        if state.structures.remove(&handle.as_raw()).is_none() {
            state.double_frees += 1;
        }
    }

    unsafe fn acceleration_structure_address(&self, handle: vk::AccelerationStructureKHR) -> vk::DeviceAddress {
        self.state.borrow().structures[&handle.as_raw()].address
    }

    unsafe fn cmd_build(
        &self,
        cmd: vk::CommandBuffer,
        infos: &[vk::AccelerationStructureBuildGeometryInfoKHR<'_>],
        build_range_infos: &[&[vk::AccelerationStructureBuildRangeInfoKHR]],
    ) {
        let mut state = self.state.borrow_mut();
        for (info, ranges) in infos.iter().zip(build_range_infos) {
            assert!(
                state.structures.contains_key(&info.dst_acceleration_structure.as_raw()),
                "build into unknown structure"
            );
            let geometries = std::slice::from_raw_parts(info.p_geometries, info.geometry_count as usize);
            let geometry = geometries[0];

            let mut build = RecordedBuild {
                cmd,
                ty: info.ty,
                mode: info.mode,
                flags: info.flags,
                src: info.src_acceleration_structure,
                dst: info.dst_acceleration_structure,
                scratch_address: info.scratch_data.device_address,
                primitive_count: ranges[0].primitive_count,
                vertex_address: 0,
                index_address: 0,
                instance_address: 0,
            };
            match geometry.geometry_type {
                vk::GeometryTypeKHR::TRIANGLES => {
                    let triangles = geometry.geometry.triangles;
                    build.vertex_address = triangles.vertex_data.device_address;
                    build.index_address = triangles.index_data.device_address;
                }
                vk::GeometryTypeKHR::INSTANCES => {
                    build.instance_address = geometry.geometry.instances.data.device_address;
                }
                _ => {}
            }

            state.events.push(Event::Build(info.ty, info.mode));
            state.builds.push(build);
        }
    }
}

/// One object's geometry in a [`MockScene`].
#[derive(Debug, Clone, Copy)]
pub struct MockMesh {
    pub vertex_address: vk::DeviceAddress,
    pub index_address: vk::DeviceAddress,
    pub vertex_count: u32,
    pub primitive_count: u32,
    pub transform: Mat4,
    pub dynamic: bool,
}

/// Scene geometry keyed by object id.
#[derive(Debug, Default, Clone)]
pub struct MockScene {
    pub meshes: HashMap<ObjectId, MockMesh>,
}

impl MockScene {
    /// Scene with one mesh per triangle count; ids are 1, 2, 3, ...
    pub fn with_triangle_counts(counts: &[u32]) -> (Self, Vec<ObjectId>) {
        let mut scene = Self::default();
        let mut ids = Vec::with_capacity(counts.len());
        for (i, &count) in counts.iter().enumerate() {
            let id = ObjectId(i as u64 + 1);
            scene.meshes.insert(
                id,
                MockMesh {
                    vertex_address: 0x100_0000 + 0x1_0000 * i as u64,
                    index_address: 0x200_0000 + 0x1_0000 * i as u64,
                    vertex_count: count * 3,
                    primitive_count: count,
                    transform: Mat4::IDENTITY,
                    dynamic: false,
                },
            );
            ids.push(id);
        }
        (scene, ids)
    }

    pub fn mesh_mut(&mut self, id: ObjectId) -> &mut MockMesh {
        self.meshes.get_mut(&id).expect("unknown mock mesh")
    }
}

impl GeometrySource for MockScene {
    fn vertex_buffer_address(&self, object: ObjectId) -> vk::DeviceAddress {
        self.meshes[&object].vertex_address
    }

    fn index_buffer_address(&self, object: ObjectId) -> vk::DeviceAddress {
        self.meshes[&object].index_address
    }

    fn vertex_stride(&self) -> vk::DeviceSize {
        12
    }

    fn vertex_count(&self, object: ObjectId) -> u32 {
        self.meshes[&object].vertex_count
    }

    fn primitive_count(&self, object: ObjectId) -> u32 {
        self.meshes[&object].primitive_count
    }

    fn transform(&self, object: ObjectId) -> Mat4 {
        self.meshes[&object].transform
    }

    fn is_dynamic(&self, object: ObjectId) -> bool {
        self.meshes[&object].dynamic
    }
}
