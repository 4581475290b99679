/// Which backend implementation the renderer drives. Chosen once, at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Vulkan,
    /// CPU reference device. Needs no GPU; used for tests and headless rendering.
    Soft,
}

/// Contains configuration options for the renderer like the backend, vsync, and cache policy
#[derive(Debug, Clone)]
pub struct RenderConfig {
    pub backend: BackendKind,
    pub vsync: bool,
    pub validation: bool,
    /// Cache and context eviction runs when `frame_counter % sweep_interval == 0`.
    pub sweep_interval: u32,
    /// Entries untouched for at least this many frames are dropped by a sweep.
    pub eviction_threshold: u32,
    /// Size of the simulated presentation ring on the soft backend.
    pub surface_image_count: u32,
    /// Surface size on the soft backend. `None` runs headless.
    pub surface_extent: Option<(u32, u32)>,
    /// First value of the frame counter. Only useful to exercise wraparound.
    pub initial_frame: u32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            vsync: true,
            validation: cfg!(debug_assertions),
            sweep_interval: 60,
            eviction_threshold: 100,
            surface_image_count: 3,
            surface_extent: None,
            initial_frame: 0,
        }
    }
}

impl RenderConfig {
    pub fn soft() -> Self {
        Self {
            backend: BackendKind::Soft,
            validation: false,
            ..Default::default()
        }
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    pub fn with_sweep_interval(mut self, frames: u32) -> Self {
        self.sweep_interval = frames.max(1);
        self
    }

    pub fn with_eviction_threshold(mut self, frames: u32) -> Self {
        self.eviction_threshold = frames;
        self
    }

    pub fn with_surface(mut self, width: u32, height: u32) -> Self {
        self.surface_extent = Some((width, height));
        self
    }

    pub fn with_surface_image_count(mut self, count: u32) -> Self {
        self.surface_image_count = count.max(1);
        self
    }

    pub fn with_initial_frame(mut self, frame: u32) -> Self {
        self.initial_frame = frame;
        self
    }
}
