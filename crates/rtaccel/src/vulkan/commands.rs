//! One-shot command buffer recording and blocking submission.

use ash::vk;

use super::VulkanContext;
use crate::backend::{Barrier, CommandExecutor};
use crate::error::{AccelError, Result};

/// Transient command pool bound to the context's compute-capable queue.
///
/// Every acceleration structure batch is recorded into a fresh primary
/// command buffer, submitted, and waited on before returning.
pub struct CommandManager {
    transient_pool: vk::CommandPool,
    queue: vk::Queue,
    device: ash::Device,
}

impl CommandManager {
    /// Create a new command manager.
    pub unsafe fn new(ctx: &VulkanContext) -> Result<Self> {
        let transient_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(ctx.queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        let transient_pool = ctx
            .device
            .create_command_pool(&transient_info, None)
            .map_err(|e| AccelError::vulkan("vkCreateCommandPool", e))?;

        Ok(Self {
            transient_pool,
            queue: ctx.queue,
            device: ctx.device.clone(),
        })
    }

    /// Destroy the command pool.
    pub unsafe fn destroy(&mut self) {
        self.device.destroy_command_pool(self.transient_pool, None);
        self.transient_pool = vk::CommandPool::null();
    }
}

impl CommandExecutor for CommandManager {
    unsafe fn begin(&self) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.transient_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let cmd = self
            .device
            .allocate_command_buffers(&alloc_info)
            .map_err(|e| AccelError::vulkan("vkAllocateCommandBuffers", e))?[0];

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        if let Err(e) = self.device.begin_command_buffer(cmd, &begin_info) {
            self.device.free_command_buffers(self.transient_pool, &[cmd]);
            return Err(AccelError::vulkan("vkBeginCommandBuffer", e));
        }

        Ok(cmd)
    }

    unsafe fn submit_and_wait(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let command_buffers = [cmd];
        let result = (|| {
            self.device
                .end_command_buffer(cmd)
                .map_err(|e| AccelError::vulkan("vkEndCommandBuffer", e))?;

            let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);

            self.device
                .queue_submit(self.queue, &[submit_info], vk::Fence::null())
                .map_err(|e| AccelError::vulkan("vkQueueSubmit", e))?;

            self.device
                .queue_wait_idle(self.queue)
                .map_err(|e| AccelError::vulkan("vkQueueWaitIdle", e))
        })();

        self.device.free_command_buffers(self.transient_pool, &command_buffers);
        result
    }

    unsafe fn insert_barrier(&self, cmd: vk::CommandBuffer, barrier: Barrier) {
        let memory_barrier = vk::MemoryBarrier::default()
            .src_access_mask(barrier.src_access)
            .dst_access_mask(barrier.dst_access);

        self.device.cmd_pipeline_barrier(
            cmd,
            barrier.src_stage,
            barrier.dst_stage,
            vk::DependencyFlags::empty(),
            &[memory_barrier],
            &[],
            &[],
        );
    }
}
