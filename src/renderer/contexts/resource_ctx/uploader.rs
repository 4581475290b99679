use color_eyre::Result;
use crate::renderer::contexts::device_ctx::types::*;
use crate::renderer::contexts::device_ctx::GpuDevice;
use crate::renderer::error::configuration_error;
use crate::renderer::resources::mesh::{Mesh, MeshData, MeshId, MeshPart};
use crate::renderer::resources::texture::{Texture, TextureData};
use crate::renderer::util;

/// A device-local buffer filled once through a staging copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadedBuffer {
    pub buffer: BufferId,
    pub size: u64,
    pub kind: BufferKind,
}

/// An image whose contents were uploaded and which is ready for sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadedImage {
    pub image: ImageId,
    pub extent: Extent2D,
    pub format: TextureFormat,
    pub mip_levels: u32,
    pub layout: ImageLayout,
}

/// Moves CPU data onto the device. Every call records into a dedicated command
/// list, submits it and blocks until the device is idle, so the resource is
/// usable as soon as the call returns.
pub struct Uploader {
    transfer_list: CommandListId,
    graphics_list: CommandListId,
}

impl Uploader {
    pub fn new(dev: &mut dyn GpuDevice) -> Result<Self> {
        Ok(Self {
            transfer_list: dev.create_command_list(QueueKind::Transfer)?,
            graphics_list: dev.create_command_list(QueueKind::Graphics)?,
        })
    }

    /// Records `func` into a fresh list on `queue`, submits it and waits for completion.
    pub fn immediate_submit<F>(&self, dev: &mut dyn GpuDevice, queue: QueueKind, func: F) -> Result<()>
    where
        F: FnOnce(&mut dyn GpuDevice, CommandListId) -> Result<()>,
    {
        let list = match queue {
            QueueKind::Transfer => self.transfer_list,
            QueueKind::Graphics => self.graphics_list,
        };
        dev.begin_commands(list)?;
        func(&mut *dev, list)?;
        dev.end_commands(list)?;
        dev.submit(&Submission {
            command_list: Some(list),
            wait: None,
            signal: None,
        })?;
        dev.wait_idle()
    }

    fn staging(dev: &mut dyn GpuDevice, label: &str, data: &[u8]) -> Result<BufferId> {
        let staging = dev.create_buffer(&BufferDesc {
            label,
            size: data.len() as u64,
            kind: BufferKind::Staging,
        })?;
        if let Err(e) = dev.write_buffer(staging, 0, data) {
            dev.destroy_buffer(staging)?;
            return Err(e);
        }
        Ok(staging)
    }

    /// Copies `data` into a new device-local buffer of `kind`.
    pub fn upload_buffer(
        &self,
        dev: &mut dyn GpuDevice,
        label: &str,
        kind: BufferKind,
        data: &[u8],
    ) -> Result<UploadedBuffer> {
        if data.is_empty() {
            return Err(configuration_error("upload_buffer", format!("`{label}` has no data")));
        }
        let size = data.len() as u64;
        let buffer = dev.create_buffer(&BufferDesc { label, size, kind })?;
        let staging = match Self::staging(dev, label, data) {
            Ok(staging) => staging,
            Err(e) => {
                dev.destroy_buffer(buffer)?;
                return Err(e);
            }
        };

        let copied = self.immediate_submit(dev, QueueKind::Transfer, |dev, list| {
            dev.record(list, &Command::CopyBuffer {
                src: staging,
                dst: buffer,
                size,
            })
        });
        dev.destroy_buffer(staging)?;
        if let Err(e) = copied {
            dev.destroy_buffer(buffer)?;
            return Err(e);
        }

        log::debug!("Uploaded {size} bytes into `{label}` ({kind:?})");
        Ok(UploadedBuffer { buffer, size, kind })
    }

    /// Uploads level 0 and, if requested, fills the mip chain by repeated downsampling.
    /// The image ends in `ShaderRead` on every level.
    pub fn upload_image(&self, dev: &mut dyn GpuDevice, data: &TextureData) -> Result<UploadedImage> {
        const OP: &str = "upload_image";
        let expected = data.extent.pixel_count() * data.format.bytes_per_pixel() as usize;
        if data.pixels.len() != expected {
            return Err(configuration_error(
                OP,
                format!(
                    "{}x{} {:?} needs {} bytes, got {}",
                    data.extent.width,
                    data.extent.height,
                    data.format,
                    expected,
                    data.pixels.len()
                ),
            ));
        }
        if data.format.is_depth() {
            return Err(configuration_error(OP, "depth formats cannot be uploaded as textures"));
        }

        let mip_levels = if data.generate_mips {
            util::mip_level_count(data.extent.width, data.extent.height)
        } else {
            1
        };
        let mut usage = ImageUsage::SAMPLED | ImageUsage::TRANSFER_DST;
        if mip_levels > 1 {
            usage |= ImageUsage::TRANSFER_SRC;
        }
        let image = dev.create_image(&ImageDesc {
            label: "texture",
            extent: data.extent,
            format: data.format,
            mip_levels,
            usage,
        })?;
        let staging = match Self::staging(dev, "texture staging", &data.pixels) {
            Ok(staging) => staging,
            Err(e) => {
                dev.destroy_image(image)?;
                return Err(e);
            }
        };

        // Blits need the graphics queue
        let queue = if mip_levels > 1 { QueueKind::Graphics } else { QueueKind::Transfer };
        let uploaded = self.immediate_submit(dev, queue, |dev, list| {
            dev.record(list, &Command::TransitionImage {
                image,
                base_mip: 0,
                mip_count: mip_levels,
                layout: ImageLayout::TransferDst,
            })?;
            dev.record(list, &Command::CopyBufferToImage {
                buffer: staging,
                image,
                mip_level: 0,
            })?;
            for level in 1..mip_levels {
                dev.record(list, &Command::TransitionImage {
                    image,
                    base_mip: level - 1,
                    mip_count: 1,
                    layout: ImageLayout::TransferSrc,
                })?;
                dev.record(list, &Command::BlitMip {
                    image,
                    src_level: level - 1,
                })?;
            }
            dev.record(list, &Command::TransitionImage {
                image,
                base_mip: 0,
                mip_count: mip_levels,
                layout: ImageLayout::ShaderRead,
            })
        });
        dev.destroy_buffer(staging)?;
        if let Err(e) = uploaded {
            dev.destroy_image(image)?;
            return Err(e);
        }

        Ok(UploadedImage {
            image,
            extent: data.extent,
            format: data.format,
            mip_levels,
            layout: ImageLayout::ShaderRead,
        })
    }

    pub fn upload_texture(&self, dev: &mut dyn GpuDevice, data: &TextureData) -> Result<Texture> {
        let image = self.upload_image(dev, data)?;
        let sampler = match dev.create_sampler(&data.sampler) {
            Ok(sampler) => sampler,
            Err(e) => {
                dev.destroy_image(image.image)?;
                return Err(e);
            }
        };
        Ok(Texture::new(image, sampler))
    }

    pub fn release_texture(&self, dev: &mut dyn GpuDevice, texture: Texture) -> Result<()> {
        dev.destroy_sampler(texture.sampler())?;
        dev.destroy_image(texture.image().image)
    }

    /// Uploads every vertex stream and index part of `data`. Indices are stored
    /// as 16-bit when every vertex is addressable that way.
    pub fn upload_mesh(&self, dev: &mut dyn GpuDevice, id: MeshId, data: &MeshData) -> Result<Mesh> {
        const OP: &str = "upload_mesh";
        if data.streams.is_empty() || data.vertex_count == 0 {
            return Err(configuration_error(OP, "mesh has no vertices"));
        }
        for (i, stream) in data.streams.iter().enumerate() {
            let needed = stream.layout.stride as usize * data.vertex_count as usize;
            if stream.data.len() < needed {
                return Err(configuration_error(
                    OP,
                    format!("stream {i} holds {} bytes, {} vertices need {needed}", stream.data.len(), data.vertex_count),
                ));
            }
        }
        for (i, part) in data.parts.iter().enumerate() {
            if part.is_empty() {
                return Err(configuration_error(OP, format!("part {i} has no indices")));
            }
            if let Some(bad) = part.iter().find(|&&index| index >= data.vertex_count) {
                return Err(configuration_error(
                    OP,
                    format!("part {i} references vertex {bad}, mesh has {}", data.vertex_count),
                ));
            }
        }

        let mut buffers = Vec::new();
        let result = self.upload_mesh_buffers(dev, data, &mut buffers);
        match result {
            Ok(parts) => {
                let vertex_buffers = buffers[..data.streams.len()].to_vec();
                let layouts = data.streams.iter().map(|s| s.layout.clone()).collect();
                Ok(Mesh::new(id, vertex_buffers, layouts, data.vertex_count, parts, data.topology))
            }
            Err(e) => {
                for buffer in buffers {
                    dev.destroy_buffer(buffer)?;
                }
                Err(e)
            }
        }
    }

    fn upload_mesh_buffers(
        &self,
        dev: &mut dyn GpuDevice,
        data: &MeshData,
        buffers: &mut Vec<BufferId>,
    ) -> Result<Vec<MeshPart>> {
        for stream in &data.streams {
            let uploaded = self.upload_buffer(dev, "vertices", BufferKind::Vertex, &stream.data)?;
            buffers.push(uploaded.buffer);
        }

        let index_format = if data.vertex_count <= u16::MAX as u32 + 1 {
            IndexFormat::Uint16
        } else {
            IndexFormat::Uint32
        };
        let mut parts = Vec::with_capacity(data.parts.len());
        for indices in &data.parts {
            let bytes: Vec<u8> = match index_format {
                IndexFormat::Uint16 => indices
                    .iter()
                    .flat_map(|&i| (i as u16).to_le_bytes())
                    .collect(),
                IndexFormat::Uint32 => bytemuck::cast_slice(indices.as_slice()).to_vec(),
            };
            let uploaded = self.upload_buffer(dev, "indices", BufferKind::Index, &bytes)?;
            buffers.push(uploaded.buffer);
            parts.push(MeshPart {
                index_buffer: uploaded.buffer,
                index_count: indices.len() as u32,
                index_format,
            });
        }
        Ok(parts)
    }

    pub fn release_mesh(&self, dev: &mut dyn GpuDevice, mesh: Mesh) -> Result<()> {
        for buffer in mesh.into_buffers() {
            dev.destroy_buffer(buffer)?;
        }
        Ok(())
    }

    /// Copies mip 0 of `image` back to the host as tightly packed texels.
    pub fn read_image(
        &self,
        dev: &mut dyn GpuDevice,
        image: ImageId,
        extent: Extent2D,
        format: TextureFormat,
    ) -> Result<Vec<u8>> {
        let size = extent.pixel_count() * format.bytes_per_pixel() as usize;
        let readback = dev.create_buffer(&BufferDesc {
            label: "readback",
            size: size as u64,
            kind: BufferKind::Readback,
        })?;
        let copied = self.immediate_submit(dev, QueueKind::Graphics, |dev, list| {
            dev.record(list, &Command::TransitionImage {
                image,
                base_mip: 0,
                mip_count: 1,
                layout: ImageLayout::TransferSrc,
            })?;
            dev.record(list, &Command::CopyImageToBuffer { image, buffer: readback })
        });
        let pixels = copied.and_then(|_| dev.read_buffer(readback, 0, size));
        dev.destroy_buffer(readback)?;
        pixels
    }

    pub fn destroy(&self, dev: &mut dyn GpuDevice) -> Result<()> {
        dev.destroy_command_list(self.transfer_list)?;
        dev.destroy_command_list(self.graphics_list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::contexts::device_ctx::soft::{SoftDevice, SoftDeviceDesc};
    use crate::renderer::config::BackendKind;
    use crate::renderer::error::{classify, driver_error};

    fn setup() -> (SoftDevice, Uploader) {
        let mut dev = SoftDevice::new(SoftDeviceDesc::default());
        let uploader = Uploader::new(&mut dev).unwrap();
        (dev, uploader)
    }

    #[test]
    fn texture_round_trips_through_readback() {
        let (mut dev, uploader) = setup();
        let pixels = vec![10, 20, 30, 255, 40, 50, 60, 255];
        let data = TextureData::from_rgba8(2, 1, pixels.clone())
            .with_format(TextureFormat::Rgba8Unorm)
            .with_mips(false);
        let image = uploader.upload_image(&mut dev, &data).unwrap();
        assert_eq!(image.mip_levels, 1);
        assert_eq!(image.layout, ImageLayout::ShaderRead);

        let read = uploader
            .read_image(&mut dev, image.image, image.extent, image.format)
            .unwrap();
        assert_eq!(read, pixels);
    }

    #[test]
    fn mip_chain_is_generated() {
        let (mut dev, uploader) = setup();
        let data = TextureData::checkerboard(8, 2, [255; 4], [0, 0, 0, 255]).with_format(TextureFormat::Rgba8Unorm);
        let image = uploader.upload_image(&mut dev, &data).unwrap();
        assert_eq!(image.mip_levels, 4);
    }

    #[test]
    fn wrong_pixel_count_is_rejected() {
        let (mut dev, uploader) = setup();
        let data = TextureData::from_rgba8(2, 2, vec![0; 4]);
        let err = uploader.upload_image(&mut dev, &data).unwrap_err();
        assert!(classify(&err).unwrap().is_configuration());
        assert_eq!(dev.stats().live_images, 0);
    }

    #[test]
    fn mesh_upload_uses_short_indices_and_frees_staging() {
        let (mut dev, uploader) = setup();
        let mesh = uploader.upload_mesh(&mut dev, MeshId(1), &MeshData::new_quad()).unwrap();
        assert_eq!(mesh.parts()[0].index_format, IndexFormat::Uint16);
        assert_eq!(mesh.parts()[0].index_count, 6);
        // one vertex buffer plus one index buffer, no staging left behind
        assert_eq!(dev.stats().live_buffers, 2);

        uploader.release_mesh(&mut dev, mesh).unwrap();
        assert_eq!(dev.stats().live_buffers, 0);
    }

    #[test]
    fn out_of_range_indices_are_rejected() {
        let (mut dev, uploader) = setup();
        let mut data = MeshData::new_triangle();
        data.parts = vec![vec![0, 1, 5]];
        assert!(uploader.upload_mesh(&mut dev, MeshId(2), &data).is_err());
    }

    /// A soft device that runs out of host-visible memory: staging buffers cannot be created.
    struct NoStaging(SoftDevice);

    impl GpuDevice for NoStaging {
        fn backend(&self) -> BackendKind {
            self.0.backend()
        }
        fn name(&self) -> &str {
            self.0.name()
        }
        fn limits(&self) -> &DeviceLimits {
            self.0.limits()
        }
        fn format_support(&self) -> &FormatSupport {
            self.0.format_support()
        }
        fn stats(&self) -> DeviceStats {
            self.0.stats()
        }
        fn has_surface(&self) -> bool {
            self.0.has_surface()
        }
        fn request_surface_resize(&mut self) {
            self.0.request_surface_resize()
        }
        fn create_buffer(&mut self, desc: &BufferDesc) -> Result<BufferId> {
            if desc.kind == BufferKind::Staging {
                return Err(driver_error("create_buffer", "out of host memory"));
            }
            self.0.create_buffer(desc)
        }
        fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<()> {
            self.0.write_buffer(buffer, offset, data)
        }
        fn read_buffer(&mut self, buffer: BufferId, offset: u64, len: usize) -> Result<Vec<u8>> {
            self.0.read_buffer(buffer, offset, len)
        }
        fn destroy_buffer(&mut self, buffer: BufferId) -> Result<()> {
            self.0.destroy_buffer(buffer)
        }
        fn create_image(&mut self, desc: &ImageDesc) -> Result<ImageId> {
            self.0.create_image(desc)
        }
        fn destroy_image(&mut self, image: ImageId) -> Result<()> {
            self.0.destroy_image(image)
        }
        fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerId> {
            self.0.create_sampler(desc)
        }
        fn destroy_sampler(&mut self, sampler: SamplerId) -> Result<()> {
            self.0.destroy_sampler(sampler)
        }
        fn create_offscreen_target(&mut self, desc: &OffscreenTargetDesc) -> Result<TargetId> {
            self.0.create_offscreen_target(desc)
        }
        fn destroy_offscreen_target(&mut self, target: TargetId) -> Result<()> {
            self.0.destroy_offscreen_target(target)
        }
        fn target_info(&self, target: RenderTarget) -> Result<TargetInfo> {
            self.0.target_info(target)
        }
        fn create_pipeline(&mut self, desc: &PipelineDesc) -> Result<PipelineId> {
            self.0.create_pipeline(desc)
        }
        fn destroy_pipeline(&mut self, pipeline: PipelineId) -> Result<()> {
            self.0.destroy_pipeline(pipeline)
        }
        fn create_binding_set(&mut self, layout: &BindingLayoutDesc) -> Result<BindingSetId> {
            self.0.create_binding_set(layout)
        }
        fn write_binding_set(&mut self, set: BindingSetId, writes: &[BindingWrite]) -> Result<()> {
            self.0.write_binding_set(set, writes)
        }
        fn destroy_binding_set(&mut self, set: BindingSetId) -> Result<()> {
            self.0.destroy_binding_set(set)
        }
        fn create_command_list(&mut self, queue: QueueKind) -> Result<CommandListId> {
            self.0.create_command_list(queue)
        }
        fn begin_commands(&mut self, list: CommandListId) -> Result<()> {
            self.0.begin_commands(list)
        }
        fn record(&mut self, list: CommandListId, command: &Command) -> Result<()> {
            self.0.record(list, command)
        }
        fn end_commands(&mut self, list: CommandListId) -> Result<()> {
            self.0.end_commands(list)
        }
        fn destroy_command_list(&mut self, list: CommandListId) -> Result<()> {
            self.0.destroy_command_list(list)
        }
        fn create_signal(&mut self) -> Result<SignalId> {
            self.0.create_signal()
        }
        fn destroy_signal(&mut self, signal: SignalId) -> Result<()> {
            self.0.destroy_signal(signal)
        }
        fn submit(&mut self, submission: &Submission) -> Result<()> {
            self.0.submit(submission)
        }
        fn wait_idle(&mut self) -> Result<()> {
            self.0.wait_idle()
        }
        fn acquire_next_image(&mut self, signal: SignalId) -> Result<u32> {
            self.0.acquire_next_image(signal)
        }
        fn present(&mut self, image_index: u32, wait: Option<SignalId>) -> Result<()> {
            self.0.present(image_index, wait)
        }
    }

    #[test]
    fn failed_staging_releases_the_destination() {
        let mut dev = NoStaging(SoftDevice::new(SoftDeviceDesc::default()));
        let uploader = Uploader::new(&mut dev).unwrap();

        let err = uploader
            .upload_buffer(&mut dev, "vertices", BufferKind::Vertex, &[1, 2, 3, 4])
            .unwrap_err();
        assert_eq!(classify(&err).unwrap().operation(), "create_buffer");
        assert_eq!(dev.stats().live_buffers, 0);

        let data = TextureData::from_rgba8(1, 1, vec![255; 4]).with_mips(false);
        assert!(uploader.upload_image(&mut dev, &data).is_err());
        assert_eq!(dev.stats().live_images, 0);
    }
}
