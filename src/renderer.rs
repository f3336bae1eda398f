// Frame orchestrator
//
// Drives the per-frame protocol between the CPU submission thread and the
// asynchronously executing GPU. Each in-flight frame slot owns a command
// buffer, two semaphores and a fence, and walks the state machine
// Idle -> Acquired -> Recording -> Submitted. A slot never re-enters
// Recording before the fence guarding its previous submission is observed
// signaled.

use anyhow::{Context, Result};
use ash::vk;
use glam::Mat4;
use std::path::Path;
use std::sync::Arc;

use crate::backend::command::{CommandBufferId, CommandManager};
use crate::backend::descriptor::{self, DescriptorKind, DescriptorManager};
use crate::backend::pipeline::{Pipeline, Vertex, PUSH_CONSTANT_SIZE};
use crate::backend::render_pass::RenderPass;
use crate::backend::swapchain::Swapchain;
use crate::backend::sync::{FenceId, SemaphoreId, SyncManager};
use crate::backend::{Buffer, DeviceContext};

/// Bounded waits: exceeding either means the GPU appears hung, which this
/// design treats as fatal.
const FENCE_TIMEOUT_NS: u64 = 5_000_000_000;
const ACQUIRE_TIMEOUT_NS: u64 = 5_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    Idle,
    Acquired,
    Recording,
    Submitted,
}

/// Per-in-flight bundle. The number of these equals the number of frames
/// allowed in flight simultaneously, independent of swap-chain image count.
struct Frame {
    commands: CommandBufferId,
    image_available: SemaphoreId,
    render_finished: SemaphoreId,
    fence: FenceId,
    image_index: u32,
    state: FrameState,
}

/// Draw-able mesh handed in by the scene collaborator.
pub struct Mesh {
    pub vertex_buffer: Buffer,
    pub index_buffer: Buffer,
    pub index_count: u32,
}

/// Shader-visible per-frame data.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FrameUniforms {
    pub view_proj: [f32; 16],
}

/// Construction options, typically derived from [`crate::config::Config`].
pub struct RendererOptions {
    pub width: u32,
    pub height: u32,
    pub preferred_present_mode: vk::PresentModeKHR,
    pub clear_color: [f32; 4],
    pub frames_in_flight: usize,
    pub vertex_shader: std::path::PathBuf,
    pub fragment_shader: std::path::PathBuf,
}

pub struct Renderer {
    frames: Vec<Frame>,
    current_frame: usize,
    clear_color: [f32; 4],

    uniform_buffers: Vec<Buffer>,
    uniform_sets: Vec<vk::DescriptorSet>,

    pipeline: Pipeline,
    render_pass: RenderPass,
    swapchain: Swapchain,

    descriptors: DescriptorManager,
    sync: SyncManager,
    commands: CommandManager,

    device: Arc<DeviceContext>,
}

impl Renderer {
    pub fn new(device: Arc<DeviceContext>, options: &RendererOptions) -> Result<Self> {
        anyhow::ensure!(
            options.frames_in_flight > 0,
            "At least one frame in flight is required"
        );

        let swapchain = Swapchain::new(
            device.clone(),
            options.width,
            options.height,
            options.preferred_present_mode,
        )?;
        let render_pass = RenderPass::new(device.clone(), &swapchain)?;

        let mut commands = CommandManager::new(device.clone())?;
        let mut sync = SyncManager::new(device.clone());
        let mut descriptors = DescriptorManager::new(device.clone());

        // One uniform buffer + set per frame slot
        let frame_count = options.frames_in_flight;
        let uniform_pool =
            descriptors.create_pool(DescriptorKind::UniformBuffer, frame_count as u32, false)?;
        let uniform_layout = descriptors.create_layout(&[descriptor::uniform_buffer_binding(
            0,
            vk::ShaderStageFlags::VERTEX,
        )])?;

        let pipeline = Pipeline::new(
            device.clone(),
            &render_pass,
            &options.vertex_shader,
            &options.fragment_shader,
            &[uniform_layout],
        )?;

        let uniform_size = std::mem::size_of::<FrameUniforms>() as vk::DeviceSize;
        let mut uniform_buffers = Vec::with_capacity(frame_count);
        let mut uniform_sets = Vec::with_capacity(frame_count);
        let mut frames = Vec::with_capacity(frame_count);

        for _ in 0..frame_count {
            let uniform_buffer = Buffer::new(
                device.clone(),
                uniform_size,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )?;

            let set = descriptors.allocate_set(uniform_pool, uniform_layout)?;
            descriptors.update_buffer_set(
                set,
                0,
                DescriptorKind::UniformBuffer,
                uniform_buffer.handle(),
                0,
                uniform_size,
            );

            frames.push(Frame {
                commands: commands.allocate_buffer()?,
                image_available: sync.allocate_semaphore()?,
                render_finished: sync.allocate_semaphore()?,
                fence: sync.allocate_fence()?,
                image_index: 0,
                state: FrameState::Idle,
            });

            uniform_buffers.push(uniform_buffer);
            uniform_sets.push(set);
        }

        log::info!(
            "Renderer ready: {} frame slots, {} swapchain images, {} uniform sets",
            frame_count,
            swapchain.image_count(),
            descriptors.allocated_sets(uniform_pool)?
        );

        Ok(Self {
            frames,
            current_frame: 0,
            clear_color: options.clear_color,
            uniform_buffers,
            uniform_sets,
            pipeline,
            render_pass,
            swapchain,
            descriptors,
            sync,
            commands,
            device,
        })
    }

    /// Upload a mesh through the staging path. Blocks until the copy has
    /// completed, so call at setup time.
    pub fn upload_mesh(&mut self, vertices: &[Vertex], indices: &[u32]) -> Result<Mesh> {
        anyhow::ensure!(!vertices.is_empty(), "Mesh needs at least one vertex");
        anyhow::ensure!(!indices.is_empty(), "Mesh needs at least one index");

        let vertex_bytes = unsafe {
            std::slice::from_raw_parts(
                vertices.as_ptr() as *const u8,
                std::mem::size_of_val(vertices),
            )
        };
        let index_bytes = unsafe {
            std::slice::from_raw_parts(
                indices.as_ptr() as *const u8,
                std::mem::size_of_val(indices),
            )
        };

        let vertex_buffer = Buffer::device_local_with_data(
            &self.device,
            &mut self.commands,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            vertex_bytes,
        )?;
        let index_buffer = Buffer::device_local_with_data(
            &self.device,
            &mut self.commands,
            vk::BufferUsageFlags::INDEX_BUFFER,
            index_bytes,
        )?;

        Ok(Mesh {
            vertex_buffer,
            index_buffer,
            index_count: indices.len() as u32,
        })
    }

    /// Idle -> Acquired -> Recording.
    ///
    /// Waits on the slot's fence (retiring the previous use of its command
    /// buffer), resets it, acquires the next swap-chain image, and opens the
    /// render pass with viewport/scissor set to the swap-chain extent.
    pub fn begin_frame(&mut self) -> Result<()> {
        let slot = self.current_frame;
        let (state, fence, image_available, commands_id) = {
            let frame = &self.frames[slot];
            (
                frame.state,
                frame.fence,
                frame.image_available,
                frame.commands,
            )
        };

        match state {
            FrameState::Idle | FrameState::Submitted => {}
            other => anyhow::bail!(
                "begin_frame on frame slot {} in state {:?}; end_frame must run first",
                slot,
                other
            ),
        }

        // Retire the previous submission on this slot
        self.sync.wait_for_fence(fence, FENCE_TIMEOUT_NS)?;
        self.frames[slot].state = FrameState::Idle;
        self.sync.reset_fence(fence)?;

        let semaphore = self.sync.semaphore(image_available)?;
        let (image_index, suboptimal) =
            self.swapchain
                .acquire_next_image(semaphore, vk::Fence::null(), ACQUIRE_TIMEOUT_NS)?;
        if suboptimal {
            log::warn!("Swapchain is suboptimal for the surface");
        }
        self.frames[slot].image_index = image_index;
        self.frames[slot].state = FrameState::Acquired;

        let cmd = self.commands.buffer(commands_id)?;
        self.commands.reset(cmd)?;
        self.commands.begin(cmd)?;

        let extent = self.swapchain.extent;
        self.render_pass
            .begin(cmd, image_index, extent, self.clear_color)?;

        let viewport = vk::Viewport::builder()
            .x(0.0)
            .y(0.0)
            .width(extent.width as f32)
            .height(extent.height as f32)
            .min_depth(0.0)
            .max_depth(1.0)
            .build();
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };

        unsafe {
            self.device.device.cmd_set_viewport(cmd, 0, &[viewport]);
            self.device.device.cmd_set_scissor(cmd, 0, &[scissor]);
        }

        self.pipeline.bind(cmd);
        unsafe {
            self.device.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.layout(),
                0,
                &[self.uniform_sets[slot]],
                &[],
            );
        }

        self.frames[slot].state = FrameState::Recording;
        Ok(())
    }

    /// Rewrite the current slot's uniform buffer. Safe after `begin_frame`,
    /// because the fence wait has retired the GPU's previous read of it.
    pub fn update_uniforms(&mut self, view_proj: Mat4) -> Result<()> {
        let slot = self.current_frame;
        anyhow::ensure!(
            self.frames[slot].state == FrameState::Recording,
            "update_uniforms outside of begin_frame/end_frame"
        );

        let uniforms = FrameUniforms {
            view_proj: view_proj.to_cols_array(),
        };
        let bytes = unsafe {
            std::slice::from_raw_parts(
                (&uniforms as *const FrameUniforms) as *const u8,
                std::mem::size_of::<FrameUniforms>(),
            )
        };
        self.uniform_buffers[slot].upload_bytes(bytes, 0)
    }

    /// Bind and draw one mesh inside the open render pass, transform passed
    /// as a push constant.
    pub fn draw_mesh(&mut self, mesh: &Mesh, transform: Mat4) -> Result<()> {
        let slot = self.current_frame;
        anyhow::ensure!(
            self.frames[slot].state == FrameState::Recording,
            "draw_mesh outside of begin_frame/end_frame"
        );

        let cmd = self.commands.buffer(self.frames[slot].commands)?;
        let matrix = transform.to_cols_array();
        let push_bytes = unsafe {
            std::slice::from_raw_parts(
                matrix.as_ptr() as *const u8,
                PUSH_CONSTANT_SIZE as usize,
            )
        };

        unsafe {
            self.device
                .device
                .cmd_bind_vertex_buffers(cmd, 0, &[mesh.vertex_buffer.handle()], &[0]);
            self.device.device.cmd_bind_index_buffer(
                cmd,
                mesh.index_buffer.handle(),
                0,
                vk::IndexType::UINT32,
            );
            self.device.device.cmd_push_constants(
                cmd,
                self.pipeline.layout(),
                vk::ShaderStageFlags::VERTEX,
                0,
                push_bytes,
            );
            self.device
                .device
                .cmd_draw_indexed(cmd, mesh.index_count, 1, 0, 0, 0);
        }

        Ok(())
    }

    /// Recording -> Submitted.
    ///
    /// Closes the pass and the command buffer, submits waiting on
    /// "image acquired" at the color-attachment-output stage and signaling
    /// "render finished" with the slot's fence guarding reuse, then presents
    /// waiting on "render finished".
    pub fn end_frame(&mut self) -> Result<()> {
        let slot = self.current_frame;
        let frame = &self.frames[slot];
        anyhow::ensure!(
            frame.state == FrameState::Recording,
            "end_frame on frame slot {} in state {:?}; begin_frame must run first",
            slot,
            frame.state
        );

        let cmd = self.commands.buffer(frame.commands)?;
        let image_available = self.sync.semaphore(frame.image_available)?;
        let render_finished = self.sync.semaphore(frame.render_finished)?;
        let fence = self.sync.fence(frame.fence)?;
        let image_index = frame.image_index;

        self.render_pass.end(cmd);
        self.commands.end(cmd)?;

        let wait_semaphores = [image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [cmd];
        let signal_semaphores = [render_finished];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device
                .device
                .queue_submit(self.device.graphics_queue, &[submit_info.build()], fence)
        }
        .context("Failed to submit frame")?;

        self.frames[slot].state = FrameState::Submitted;

        let suboptimal = self.swapchain.present(
            self.device.present_queue,
            image_index,
            &[render_finished],
        )?;
        if suboptimal {
            log::warn!("Swapchain is suboptimal at present");
        }

        // Submitted -> Idle happens implicitly when the next use of this
        // slot observes the fence
        self.current_frame = (self.current_frame + 1) % self.frames.len();
        Ok(())
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }

    // Collaborator surface: overlay renderers initialize their backend from
    // these and append draw calls to the active command buffer before
    // end_frame.

    /// The command buffer currently inside a render pass. Only valid while
    /// the current frame slot is recording.
    pub fn active_command_buffer(&self) -> Result<vk::CommandBuffer> {
        let frame = &self.frames[self.current_frame];
        anyhow::ensure!(
            frame.state == FrameState::Recording,
            "No active command buffer outside of begin_frame/end_frame"
        );
        self.commands.buffer(frame.commands)
    }

    pub fn device(&self) -> &Arc<DeviceContext> {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.device.physical_device
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.device.graphics_queue
    }

    pub fn graphics_queue_family(&self) -> u32 {
        self.device.graphics_queue_family
    }

    pub fn render_pass_handle(&self) -> vk::RenderPass {
        self.render_pass.handle()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        // All slots must retire before any owned resource is destroyed
        let _ = self.device.wait_idle();
    }
}

impl RendererOptions {
    /// Derive options from the loaded configuration.
    pub fn from_config(config: &crate::config::Config, width: u32, height: u32) -> Self {
        let shader_dir: &Path = &config.assets.shader_dir;
        Self {
            width,
            height,
            preferred_present_mode: config.preferred_present_mode(),
            clear_color: config.graphics.clear_color,
            frames_in_flight: config.graphics.max_frames_in_flight,
            vertex_shader: shader_dir.join("triangle.vert.spv"),
            fragment_shader: shader_dir.join("triangle.frag.spv"),
        }
    }
}

#[cfg(test)]
mod tests {
    // Protocol simulation: the frame-pacing discipline is device-independent
    // arithmetic over slot indices and fence observations, so it can be
    // checked without a GPU. A slot's command buffer is "in flight" from
    // submit until the next wait on that slot's fence.

    struct SlotSim {
        in_flight: Vec<bool>,
        waits: usize,
    }

    impl SlotSim {
        fn new(slots: usize) -> Self {
            Self {
                in_flight: vec![false; slots],
                waits: 0,
            }
        }

        // Idle -> Acquired: one fence wait retires the slot's buffer
        fn begin(&mut self, slot: usize) {
            self.waits += 1;
            self.in_flight[slot] = false;
        }

        // Recording: only legal on a retired buffer
        fn record(&self, slot: usize) {
            assert!(
                !self.in_flight[slot],
                "command buffer re-recorded while in flight"
            );
        }

        // Recording -> Submitted
        fn end(&mut self, slot: usize) {
            self.in_flight[slot] = true;
        }
    }

    #[test]
    fn pacing_never_overlaps_in_flight_buffers() {
        for slots in 1..=3 {
            let mut sim = SlotSim::new(slots);
            let mut current = 0;

            for frame in 0..10 * slots {
                // Once the pipeline is warm, every slot has a pending
                // submission when its turn comes around again: the fence
                // wait is load-bearing, not a formality
                if frame >= slots {
                    assert!(sim.in_flight[current]);
                }
                sim.begin(current);
                sim.record(current);
                sim.end(current);
                current = (current + 1) % slots;
            }

            // Exactly one fence wait per frame, never two without an
            // intervening reset+resubmit
            assert_eq!(sim.waits, 10 * slots);
        }
    }

    #[test]
    fn each_slot_is_reused_every_k_frames() {
        let slots = 2;
        let mut current = 0;
        let mut last_seen = vec![None; slots];

        for frame in 0..20usize {
            if let Some(previous) = last_seen[current] {
                assert_eq!(frame - previous, slots);
            }
            last_seen[current] = Some(frame);
            current = (current + 1) % slots;
        }
    }
}
