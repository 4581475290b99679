pub mod target_ctx;

use color_eyre::Result;
use glam::Vec4;
use crate::renderer::config::RenderConfig;
use crate::renderer::contexts::device_ctx::types::{RenderTarget, SignalId, Submission};
use crate::renderer::contexts::device_ctx::GpuDevice;
use crate::renderer::contexts::frame_ctx::target_ctx::{PassSetup, RenderTargetContext, RenderTargetRegistry};
use crate::renderer::contexts::pipeline_ctx::PipelineCache;
use crate::renderer::contexts::resource_ctx::binding_allocator::BindingSetAllocator;
use crate::renderer::error::configuration_error;

/// Counter and chaining state that lives for the whole renderer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameState {
    counter: u32,
    image_index: Option<u32>,
    /// What the next submission has to wait on.
    previous: Option<SignalId>,
    in_frame: bool,
    surface_drawn: bool,
}

impl FrameState {
    /// The first `begin_frame` moves the counter to `counter + 1`.
    pub fn starting_at(counter: u32) -> Self {
        Self {
            counter,
            image_index: None,
            previous: None,
            in_frame: false,
            surface_drawn: false,
        }
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn image_index(&self) -> Option<u32> {
        self.image_index
    }

    pub fn in_frame(&self) -> bool {
        self.in_frame
    }
}

/// What `end_frame` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameSummary {
    pub frame: u32,
    pub presented: bool,
    pub swept: bool,
    pub evicted_pipelines: usize,
    pub evicted_contexts: usize,
}

/// Responsibilities:
/// - Count frames and acquire/present the surface image
/// - Chain every pass behind the one submitted before it
/// - Run cache and context eviction every `sweep_interval` frames
pub struct RenderFrameContext {
    state: FrameState,
    acquire_signal: SignalId,
    sweep_interval: u32,
    eviction_threshold: u32,
}

impl RenderFrameContext {
    pub fn new(dev: &mut dyn GpuDevice, config: &RenderConfig) -> Result<Self> {
        if config.sweep_interval == 0 {
            return Err(configuration_error("new", "sweep_interval must be at least 1"));
        }
        Ok(Self {
            state: FrameState::starting_at(config.initial_frame),
            acquire_signal: dev.create_signal()?,
            sweep_interval: config.sweep_interval,
            eviction_threshold: config.eviction_threshold,
        })
    }

    pub fn state(&self) -> &FrameState {
        &self.state
    }

    pub fn counter(&self) -> u32 {
        self.state.counter
    }

    pub fn in_frame(&self) -> bool {
        self.state.in_frame
    }

    /// Advances the counter and, with a surface, blocks until an image is available.
    pub fn begin_frame(&mut self, dev: &mut dyn GpuDevice) -> Result<u32> {
        if self.state.in_frame {
            return Err(configuration_error("begin_frame", "previous frame was never ended"));
        }
        self.state.counter = self.state.counter.wrapping_add(1);
        self.state.surface_drawn = false;
        self.state.image_index = None;
        if dev.has_surface() {
            let index = dev.acquire_next_image(self.acquire_signal)?;
            self.state.image_index = Some(index);
            self.state.previous = Some(self.acquire_signal);
        }
        self.state.in_frame = true;
        log::trace!("Frame {} begun (image {:?})", self.state.counter, self.state.image_index);
        Ok(self.state.counter)
    }

    /// Ends the pass recorded in `ctx` and submits it behind the previous one.
    pub fn submit_pass(&mut self, dev: &mut dyn GpuDevice, ctx: &mut RenderTargetContext) -> Result<()> {
        if !self.state.in_frame {
            return Err(configuration_error("end_camera", "no frame in progress"));
        }
        let wait = self.state.previous.take();
        let signal = ctx.submit(dev, wait)?;
        self.state.previous = Some(signal);
        if ctx.target().is_surface() {
            self.state.surface_drawn = true;
        }
        Ok(())
    }

    /// Consumes the pending chain signal if it belongs to `ctx`, so the context can be destroyed.
    pub fn release_context(&mut self, dev: &mut dyn GpuDevice, ctx: &RenderTargetContext) -> Result<()> {
        if let Some(pending) = self.state.previous {
            if ctx.owns_signal(pending) {
                self.drain(dev)?;
            }
        }
        Ok(())
    }

    fn drain(&mut self, dev: &mut dyn GpuDevice) -> Result<()> {
        if let Some(wait) = self.state.previous.take() {
            dev.submit(&Submission {
                command_list: None,
                wait: Some(wait),
                signal: None,
            })?;
            dev.wait_idle()?;
        }
        Ok(())
    }

    /// Presents (or drains the chain when headless), waits for the device,
    /// then sweeps if this frame lands on the sweep interval.
    pub fn end_frame(
        &mut self,
        dev: &mut dyn GpuDevice,
        targets: &mut RenderTargetRegistry,
        cache: &mut PipelineCache,
        bindings: &mut BindingSetAllocator,
    ) -> Result<FrameSummary> {
        if !self.state.in_frame {
            return Err(configuration_error("end_frame", "no frame in progress"));
        }
        if targets.any_recording() {
            return Err(configuration_error("end_frame", "a pass is still recording"));
        }
        let frame = self.state.counter;
        let mut summary = FrameSummary {
            frame,
            ..Default::default()
        };

        match self.state.image_index.take() {
            Some(image_index) => {
                if !self.state.surface_drawn {
                    let extent = dev.target_info(RenderTarget::Surface)?.extent;
                    let ctx = targets.get_or_create(dev, RenderTarget::Surface, frame)?;
                    ctx.begin(dev, &PassSetup::clear_only(extent, Vec4::new(0.0, 0.0, 0.0, 1.0)), false, frame)?;
                    self.submit_pass(dev, ctx)?;
                }
                dev.present(image_index, self.state.previous.take())?;
                summary.presented = true;
            }
            None => self.drain(dev)?,
        }
        dev.wait_idle()?;
        targets.reset_all();
        self.state.in_frame = false;

        if frame % self.sweep_interval == 0 {
            summary.swept = true;
            summary.evicted_pipelines = cache.sweep(dev, bindings, frame)?;
            summary.evicted_contexts = targets.sweep(dev, frame, self.eviction_threshold)?;
        }
        Ok(summary)
    }

    pub fn destroy(&mut self, dev: &mut dyn GpuDevice) -> Result<()> {
        self.drain(dev)?;
        dev.destroy_signal(self.acquire_signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::contexts::device_ctx::soft::{SoftDevice, SoftDeviceDesc};
    use crate::renderer::contexts::device_ctx::types::Extent2D;
    use crate::renderer::contexts::resource_ctx::uploader::Uploader;

    struct Fixture {
        dev: SoftDevice,
        frames: RenderFrameContext,
        targets: RenderTargetRegistry,
        cache: PipelineCache,
        bindings: BindingSetAllocator,
    }

    fn fixture(desc: SoftDeviceDesc, config: RenderConfig) -> Fixture {
        let mut dev = SoftDevice::new(desc);
        let uploader = Uploader::new(&mut dev).unwrap();
        let bindings = BindingSetAllocator::new(&mut dev, &uploader).unwrap();
        let frames = RenderFrameContext::new(&mut dev, &config).unwrap();
        Fixture {
            dev,
            frames,
            targets: RenderTargetRegistry::new(),
            cache: PipelineCache::new(config.eviction_threshold),
            bindings,
        }
    }

    impl Fixture {
        fn end(&mut self) -> FrameSummary {
            self.frames
                .end_frame(&mut self.dev, &mut self.targets, &mut self.cache, &mut self.bindings)
                .unwrap()
        }
    }

    #[test]
    fn headless_frames_count_and_sweep_on_interval() {
        let mut f = fixture(SoftDeviceDesc::default(), RenderConfig::soft().with_sweep_interval(4));
        for expected in 1..=8 {
            assert_eq!(f.frames.begin_frame(&mut f.dev).unwrap(), expected);
            let summary = f.end();
            assert!(!summary.presented);
            assert_eq!(summary.swept, expected % 4 == 0);
        }
        assert_eq!(f.dev.stats().presents, 0);
    }

    #[test]
    fn undrawn_surface_is_cleared_and_presented() {
        let desc = SoftDeviceDesc {
            surface: Some((Extent2D::new(2, 2), 2)),
            ..Default::default()
        };
        let mut f = fixture(desc, RenderConfig::soft());
        for _ in 0..5 {
            f.frames.begin_frame(&mut f.dev).unwrap();
            assert!(f.end().presented);
        }
        assert_eq!(f.dev.stats().presents, 5);
        assert_eq!(f.targets.get(RenderTarget::Surface).unwrap().state(), target_ctx::ContextState::Idle);
    }

    #[test]
    fn counter_wraps() {
        let config = RenderConfig::soft().with_initial_frame(u32::MAX);
        let mut f = fixture(SoftDeviceDesc::default(), config);
        assert_eq!(f.frames.begin_frame(&mut f.dev).unwrap(), 0);
        // frame 0 lands on every sweep interval
        assert!(f.end().swept);
    }

    #[test]
    fn unbalanced_frames_are_rejected() {
        let mut f = fixture(SoftDeviceDesc::default(), RenderConfig::soft());
        assert!(f
            .frames
            .end_frame(&mut f.dev, &mut f.targets, &mut f.cache, &mut f.bindings)
            .is_err());
        f.frames.begin_frame(&mut f.dev).unwrap();
        assert!(f.frames.begin_frame(&mut f.dev).is_err());
    }
}
