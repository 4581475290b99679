use std::collections::HashMap;
use color_eyre::Result;
use glam::Vec4;
use crate::renderer::camera::CameraView;
use crate::renderer::contexts::device_ctx::types::*;
use crate::renderer::contexts::device_ctx::GpuDevice;
use crate::renderer::error::configuration_error;
use crate::renderer::util;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Idle,
    Recording,
    Submitted,
}

/// How a pass opens: what to clear and which part of the target to draw into.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassSetup {
    pub clear_color: Option<Vec4>,
    pub viewport: Viewport,
    pub scissor: ScissorRect,
}

impl PassSetup {
    pub fn from_view(view: &CameraView) -> Self {
        Self {
            clear_color: view.clear_color,
            viewport: view.viewport,
            scissor: view.scissor,
        }
    }

    /// Covers the whole target and clears it to `color`.
    pub fn clear_only(extent: Extent2D, color: Vec4) -> Self {
        Self {
            clear_color: Some(color),
            viewport: Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            },
            scissor: ScissorRect {
                x: 0,
                y: 0,
                width: extent.width,
                height: extent.height,
            },
        }
    }
}

/// Command list and completion signals for one render target, reused every frame.
///
/// Two signals alternate so a pass can wait on this context's previous pass
/// while raising a signal nobody is still waiting on.
pub struct RenderTargetContext {
    target: RenderTarget,
    command_list: CommandListId,
    signals: [SignalId; 2],
    next_signal: usize,
    state: ContextState,
    frame_of_last_use: u32,
}

impl RenderTargetContext {
    pub fn new(dev: &mut dyn GpuDevice, target: RenderTarget, frame: u32) -> Result<Self> {
        let command_list = dev.create_command_list(QueueKind::Graphics)?;
        let signals = [dev.create_signal()?, dev.create_signal()?];
        log::debug!("Created command context for {target:?}");
        Ok(Self {
            target,
            command_list,
            signals,
            next_signal: 0,
            state: ContextState::Idle,
            frame_of_last_use: frame,
        })
    }

    pub fn target(&self) -> RenderTarget {
        self.target
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn frame_of_last_use(&self) -> u32 {
        self.frame_of_last_use
    }

    pub fn owns_signal(&self, signal: SignalId) -> bool {
        self.signals.contains(&signal)
    }

    /// Starts recording and opens the render pass.
    pub fn begin(&mut self, dev: &mut dyn GpuDevice, setup: &PassSetup, depth: bool, frame: u32) -> Result<()> {
        if self.state == ContextState::Recording {
            return Err(configuration_error(
                "begin_camera",
                format!("{:?} is already recording a pass", self.target),
            ));
        }
        dev.begin_commands(self.command_list)?;
        dev.record(
            self.command_list,
            &Command::BeginRenderPass {
                target: self.target,
                clear_color: setup.clear_color.map(|c| c.to_array()),
                clear_depth: depth.then_some(1.0),
            },
        )?;
        dev.record(self.command_list, &Command::SetViewport(setup.viewport))?;
        dev.record(self.command_list, &Command::SetScissor(setup.scissor))?;
        self.state = ContextState::Recording;
        self.frame_of_last_use = frame;
        Ok(())
    }

    pub fn record(&mut self, dev: &mut dyn GpuDevice, command: &Command) -> Result<()> {
        if self.state != ContextState::Recording {
            return Err(configuration_error(
                "draw_mesh",
                format!("{:?} has no pass recording", self.target),
            ));
        }
        dev.record(self.command_list, command)
    }

    /// Closes the pass and submits it behind `wait`, then blocks until the
    /// device is idle. Returns the signal raised on completion.
    pub fn submit(&mut self, dev: &mut dyn GpuDevice, wait: Option<SignalId>) -> Result<SignalId> {
        if self.state != ContextState::Recording {
            return Err(configuration_error(
                "end_camera",
                format!("{:?} has no pass recording", self.target),
            ));
        }
        dev.record(self.command_list, &Command::EndRenderPass)?;
        dev.end_commands(self.command_list)?;

        let signal = self.signals[self.next_signal];
        self.next_signal ^= 1;
        dev.submit(&Submission {
            command_list: Some(self.command_list),
            wait,
            signal: Some(signal),
        })?;
        self.state = ContextState::Submitted;
        dev.wait_idle()?;
        Ok(signal)
    }

    /// Back to `Idle` once the frame that submitted this context has finished.
    pub fn reset(&mut self) {
        if self.state == ContextState::Submitted {
            self.state = ContextState::Idle;
        }
    }

    pub fn destroy(self, dev: &mut dyn GpuDevice) -> Result<()> {
        dev.destroy_command_list(self.command_list)?;
        for signal in self.signals {
            dev.destroy_signal(signal)?;
        }
        Ok(())
    }
}

/// One context per render target, created on first use.
#[derive(Default)]
pub struct RenderTargetRegistry {
    contexts: HashMap<RenderTarget, RenderTargetContext>,
}

impl RenderTargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn get(&self, target: RenderTarget) -> Option<&RenderTargetContext> {
        self.contexts.get(&target)
    }

    pub fn get_mut(&mut self, target: RenderTarget) -> Option<&mut RenderTargetContext> {
        self.contexts.get_mut(&target)
    }

    pub fn get_or_create(
        &mut self,
        dev: &mut dyn GpuDevice,
        target: RenderTarget,
        frame: u32,
    ) -> Result<&mut RenderTargetContext> {
        if !self.contexts.contains_key(&target) {
            let ctx = RenderTargetContext::new(dev, target, frame)?;
            self.contexts.insert(target, ctx);
        }
        self.contexts
            .get_mut(&target)
            .ok_or_else(|| configuration_error("begin_camera", format!("no context for {target:?}")))
    }

    pub fn any_recording(&self) -> bool {
        self.contexts.values().any(|c| c.state == ContextState::Recording)
    }

    pub fn reset_all(&mut self) {
        for ctx in self.contexts.values_mut() {
            ctx.reset();
        }
    }

    pub fn remove(&mut self, dev: &mut dyn GpuDevice, target: RenderTarget) -> Result<bool> {
        match self.contexts.remove(&target) {
            Some(ctx) => {
                ctx.destroy(dev)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Destroys idle contexts untouched for `threshold` frames.
    pub fn sweep(&mut self, dev: &mut dyn GpuDevice, now: u32, threshold: u32) -> Result<usize> {
        let stale: Vec<RenderTarget> = self
            .contexts
            .values()
            .filter(|c| c.state == ContextState::Idle && util::is_stale(now, c.frame_of_last_use, threshold))
            .map(|c| c.target)
            .collect();
        for target in &stale {
            self.remove(dev, *target)?;
        }
        if !stale.is_empty() {
            log::debug!("Evicted {} render target contexts", stale.len());
        }
        Ok(stale.len())
    }

    pub fn destroy_all(&mut self, dev: &mut dyn GpuDevice) -> Result<()> {
        for (_, ctx) in self.contexts.drain() {
            ctx.destroy(dev)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::contexts::device_ctx::soft::{SoftDevice, SoftDeviceDesc};
    use crate::renderer::error::classify;

    fn offscreen(dev: &mut SoftDevice) -> RenderTarget {
        let id = dev
            .create_offscreen_target(&OffscreenTargetDesc {
                label: "test",
                extent: Extent2D::new(2, 2),
                color_format: TextureFormat::Rgba8Unorm,
                depth_format: None,
            })
            .unwrap();
        RenderTarget::Offscreen(id)
    }

    #[test]
    fn walks_idle_recording_submitted_idle() {
        let mut dev = SoftDevice::new(SoftDeviceDesc::default());
        let target = offscreen(&mut dev);
        let mut ctx = RenderTargetContext::new(&mut dev, target, 0).unwrap();
        assert_eq!(ctx.state(), ContextState::Idle);

        let setup = PassSetup::clear_only(Extent2D::new(2, 2), Vec4::ONE);
        ctx.begin(&mut dev, &setup, false, 1).unwrap();
        assert_eq!(ctx.state(), ContextState::Recording);

        let err = ctx.begin(&mut dev, &setup, false, 1).unwrap_err();
        assert!(classify(&err).unwrap().is_configuration());

        let first = ctx.submit(&mut dev, None).unwrap();
        assert_eq!(ctx.state(), ContextState::Submitted);
        ctx.reset();
        assert_eq!(ctx.state(), ContextState::Idle);

        // second pass waits on the first and raises the other signal
        ctx.begin(&mut dev, &setup, false, 2).unwrap();
        let second = ctx.submit(&mut dev, Some(first)).unwrap();
        assert_ne!(first, second);
        assert!(ctx.owns_signal(second));
    }

    #[test]
    fn recording_outside_a_pass_is_rejected() {
        let mut dev = SoftDevice::new(SoftDeviceDesc::default());
        let target = offscreen(&mut dev);
        let mut ctx = RenderTargetContext::new(&mut dev, target, 0).unwrap();
        let err = ctx
            .record(&mut dev, &Command::Draw { vertex_count: 3, first_vertex: 0 })
            .unwrap_err();
        assert!(classify(&err).unwrap().is_configuration());
        assert!(ctx.submit(&mut dev, None).is_err());
    }

    #[test]
    fn registry_sweeps_only_stale_idle_contexts() {
        let mut dev = SoftDevice::new(SoftDeviceDesc::default());
        let a = offscreen(&mut dev);
        let b = offscreen(&mut dev);
        let mut registry = RenderTargetRegistry::new();
        registry.get_or_create(&mut dev, a, 1).unwrap();
        registry.get_or_create(&mut dev, b, 90).unwrap();

        assert_eq!(registry.sweep(&mut dev, 100, 100).unwrap(), 0);
        assert_eq!(registry.sweep(&mut dev, 101, 100).unwrap(), 1);
        assert!(registry.get(a).is_none());
        assert!(registry.get(b).is_some());

        registry.destroy_all(&mut dev).unwrap();
        assert!(registry.is_empty());
    }
}
