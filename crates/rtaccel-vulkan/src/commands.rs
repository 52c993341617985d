//! Command submission with fence-tracked completion.
//!
//! Every submission gets its own command buffer from a transient pool and its
//! own fence. Completion can be polled without blocking; the command buffer and
//! fence are released once completion has been observed.
//!
//! Blocking waits happen outside the lock. A submission with threads still
//! blocked on its fence is never retired; the last waiter retires it.

use ash::vk;
use parking_lot::Mutex;
use std::collections::HashMap;

use rtaccel_core::{AccelResult, SubmissionId};

use super::{vk_error, VulkanContext};

struct InFlight {
    cmd: vk::CommandBuffer,
    fence: vk::Fence,
    waiters: u32,
}

struct State {
    pool: vk::CommandPool,
    next_id: u64,
    in_flight: HashMap<SubmissionId, InFlight>,
}

impl State {
    fn insert(&mut self, cmd: vk::CommandBuffer, fence: vk::Fence) -> SubmissionId {
        let id = SubmissionId(self.next_id);
        self.next_id += 1;
        self.in_flight.insert(id, InFlight { cmd, fence, waiters: 0 });
        id
    }

    /// Register a blocking waiter. `None` if the submission already retired.
    fn begin_wait(&mut self, id: SubmissionId) -> Option<vk::Fence> {
        let in_flight = self.in_flight.get_mut(&id)?;
        in_flight.waiters += 1;
        Some(in_flight.fence)
    }

    /// Unregister a waiter. Returns the submission for release when it has
    /// signaled and no other waiter still uses its fence.
    fn end_wait(&mut self, id: SubmissionId, signaled: bool) -> Option<InFlight> {
        let in_flight = self.in_flight.get_mut(&id)?;
        in_flight.waiters = in_flight.waiters.saturating_sub(1);
        if signaled {
            self.take_idle(id)
        } else {
            None
        }
    }

    /// Remove a submission nobody is blocked on.
    fn take_idle(&mut self, id: SubmissionId) -> Option<InFlight> {
        match self.in_flight.get(&id) {
            Some(in_flight) if in_flight.waiters == 0 => self.in_flight.remove(&id),
            _ => None,
        }
    }
}

/// Transient command pool plus the submissions still in flight.
///
/// The pool and queue are externally synchronized objects, so all recording
/// and submission happens under one lock.
pub struct CommandManager {
    state: Mutex<State>,
    queue: vk::Queue,
    device: ash::Device,
}

impl CommandManager {
    /// Create a new command manager on the context's queue.
    pub unsafe fn new(ctx: &VulkanContext) -> AccelResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(ctx.queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        let pool = ctx
            .device
            .create_command_pool(&pool_info, None)
            .map_err(|e| vk_error("create transient pool", e))?;

        Ok(Self {
            state: Mutex::new(State {
                pool,
                next_id: 1,
                in_flight: HashMap::new(),
            }),
            queue: ctx.queue,
            device: ctx.device.clone(),
        })
    }

    /// Record a command buffer with `record` and submit it without waiting.
    pub unsafe fn submit_with<F>(&self, record: F) -> AccelResult<SubmissionId>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        let mut state = self.state.lock();

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(state.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let cmd = self
            .device
            .allocate_command_buffers(&alloc_info)
            .map_err(|e| vk_error("allocate command buffer", e))?[0];

        let begin_info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        if let Err(e) = self.device.begin_command_buffer(cmd, &begin_info) {
            self.device.free_command_buffers(state.pool, &[cmd]);
            return Err(vk_error("begin command buffer", e));
        }

        record(cmd);

        if let Err(e) = self.device.end_command_buffer(cmd) {
            self.device.free_command_buffers(state.pool, &[cmd]);
            return Err(vk_error("end command buffer", e));
        }

        let fence = match self.device.create_fence(&vk::FenceCreateInfo::default(), None) {
            Ok(fence) => fence,
            Err(e) => {
                self.device.free_command_buffers(state.pool, &[cmd]);
                return Err(vk_error("create fence", e));
            }
        };

        let cmds = [cmd];
        let submit_info = vk::SubmitInfo::default().command_buffers(&cmds);

        if let Err(e) = self.device.queue_submit(self.queue, &[submit_info], fence) {
            self.device.destroy_fence(fence, None);
            self.device.free_command_buffers(state.pool, &[cmd]);
            return Err(vk_error("submit command buffer", e));
        }

        let id = state.insert(cmd, fence);

        log::trace!("Submitted {:?} ({} in flight)", id, state.in_flight.len());
        Ok(id)
    }

    /// Non-blocking completion check. Unknown submissions count as complete.
    pub unsafe fn is_complete(&self, id: SubmissionId) -> AccelResult<bool> {
        let mut state = self.state.lock();

        let fence = match state.in_flight.get(&id) {
            Some(in_flight) => in_flight.fence,
            None => return Ok(true),
        };

        let signaled = self
            .device
            .get_fence_status(fence)
            .map_err(|e| vk_error("query fence status", e))?;

        if signaled {
            if let Some(done) = state.take_idle(id) {
                self.release(&state, done);
            }
        }
        Ok(signaled)
    }

    /// Block until the submission has completed. Other submissions can be
    /// recorded and polled meanwhile.
    pub unsafe fn wait(&self, id: SubmissionId) -> AccelResult<()> {
        let fence = match self.state.lock().begin_wait(id) {
            Some(fence) => fence,
            None => return Ok(()),
        };

        let result = self.device.wait_for_fences(&[fence], true, u64::MAX);

        let mut state = self.state.lock();
        if let Some(done) = state.end_wait(id, result.is_ok()) {
            self.release(&state, done);
        }
        result.map_err(|e| vk_error("wait for fence", e))
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    unsafe fn release(&self, state: &State, in_flight: InFlight) {
        self.device.destroy_fence(in_flight.fence, None);
        self.device.free_command_buffers(state.pool, &[in_flight.cmd]);
    }

    /// Wait for everything in flight and destroy the pool.
    pub unsafe fn destroy(&self) {
        let mut state = self.state.lock();

        let fences: Vec<vk::Fence> = state.in_flight.values().map(|f| f.fence).collect();
        if !fences.is_empty() {
            if let Err(e) = self.device.wait_for_fences(&fences, true, u64::MAX) {
                log::warn!("Failed to wait for in-flight builds: {:?}", e);
            }
        }

        let done: Vec<InFlight> = state.in_flight.drain().map(|(_, in_flight)| in_flight).collect();
        for in_flight in done {
            self.release(&state, in_flight);
        }

        self.device.destroy_command_pool(state.pool, None);
        state.pool = vk::CommandPool::null();
    }
}
