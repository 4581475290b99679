use crate::renderer::contexts::device_ctx::types::{Extent2D, SamplerDesc, SamplerId, TextureFormat};
use crate::renderer::contexts::resource_ctx::uploader::UploadedImage;
use crate::renderer::resources::material::TextureBinding;

/// Pixels for a texture upload.
#[derive(Debug, Clone)]
pub struct TextureData {
    pub extent: Extent2D,
    pub format: TextureFormat,
    pub pixels: Vec<u8>,
    pub generate_mips: bool,
    pub sampler: SamplerDesc,
}

impl TextureData {
    pub fn from_rgba8(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            extent: Extent2D::new(width, height),
            format: TextureFormat::Rgba8Srgb,
            pixels,
            generate_mips: true,
            sampler: SamplerDesc::default(),
        }
    }

    pub fn from_image(image: &image::DynamicImage) -> Self {
        let data = image.to_rgba8().into_raw();
        Self::from_rgba8(image.width(), image.height(), data)
    }

    /// Single texel of the given color, stored linearly.
    pub fn solid(rgba: [u8; 4]) -> Self {
        Self {
            extent: Extent2D::new(1, 1),
            format: TextureFormat::Rgba8Unorm,
            pixels: rgba.to_vec(),
            generate_mips: false,
            sampler: SamplerDesc::default(),
        }
    }

    /// Two-color checkerboard with `cells` squares per side.
    pub fn checkerboard(size: u32, cells: u32, a: [u8; 4], b: [u8; 4]) -> Self {
        let cell = (size / cells.max(1)).max(1);
        let mut pixels = Vec::with_capacity((size * size * 4) as usize);
        for y in 0..size {
            for x in 0..size {
                let texel = if (x / cell + y / cell) % 2 == 0 { a } else { b };
                pixels.extend_from_slice(&texel);
            }
        }
        Self::from_rgba8(size, size, pixels)
    }

    pub fn with_format(mut self, format: TextureFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_mips(mut self, generate_mips: bool) -> Self {
        self.generate_mips = generate_mips;
        self
    }

    pub fn with_sampler(mut self, sampler: SamplerDesc) -> Self {
        self.sampler = sampler;
        self
    }
}

/// An uploaded, shader-readable image plus the sampler it is read with.
#[derive(Debug, Clone)]
pub struct Texture {
    image: UploadedImage,
    sampler: SamplerId,
}

impl Texture {
    pub(crate) fn new(image: UploadedImage, sampler: SamplerId) -> Self {
        Self { image, sampler }
    }

    pub fn image(&self) -> &UploadedImage {
        &self.image
    }

    pub fn sampler(&self) -> SamplerId {
        self.sampler
    }

    pub fn extent(&self) -> Extent2D {
        self.image.extent
    }

    pub fn binding(&self) -> TextureBinding {
        TextureBinding {
            image: self.image.image,
            sampler: self.sampler,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkerboard_alternates_cells() {
        let data = TextureData::checkerboard(4, 2, [255; 4], [0, 0, 0, 255]);
        assert_eq!(data.pixels.len(), 4 * 4 * 4);
        assert_eq!(&data.pixels[0..4], &[255; 4]);
        // third texel of the first row starts the second cell
        assert_eq!(&data.pixels[8..12], &[0, 0, 0, 255]);
    }

    #[test]
    fn decoded_images_become_rgba8() {
        let image = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            2,
            3,
            image::Rgb([10, 20, 30]),
        ));
        let data = TextureData::from_image(&image);
        assert_eq!(data.extent, Extent2D::new(2, 3));
        assert_eq!(&data.pixels[..4], &[10, 20, 30, 255]);
    }
}
