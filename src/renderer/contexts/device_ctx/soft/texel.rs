use glam::Vec4;
use crate::renderer::contexts::device_ctx::types::TextureFormat;

pub fn srgb_to_linear(c: f32) -> f32 {
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

pub fn linear_to_srgb(c: f32) -> f32 {
    if c <= 0.0031308 {
        c * 12.92
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    }
}

fn unorm8(c: f32) -> u8 {
    (c.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Writes a linear color (or depth in `x`) as one texel of `format`.
pub fn encode(format: TextureFormat, color: Vec4, out: &mut [u8]) {
    match format {
        TextureFormat::Rgba8Unorm | TextureFormat::Bgra8Unorm
        | TextureFormat::Rgba8Srgb | TextureFormat::Bgra8Srgb => {
            let mut c = color;
            if format.is_srgb() {
                c = Vec4::new(
                    linear_to_srgb(c.x.clamp(0.0, 1.0)),
                    linear_to_srgb(c.y.clamp(0.0, 1.0)),
                    linear_to_srgb(c.z.clamp(0.0, 1.0)),
                    c.w,
                );
            }
            let (r, b) = if format.is_bgra() { (c.z, c.x) } else { (c.x, c.z) };
            out[0] = unorm8(r);
            out[1] = unorm8(c.y);
            out[2] = unorm8(b);
            out[3] = unorm8(c.w);
        }
        TextureFormat::Rgba16Float => {
            for (i, v) in color.to_array().into_iter().enumerate() {
                out[i * 2..i * 2 + 2].copy_from_slice(&f32_to_f16(v).to_le_bytes());
            }
        }
        TextureFormat::Depth32Float => out[..4].copy_from_slice(&color.x.to_le_bytes()),
    }
}

/// Reads one texel of `format` as a linear color (depth lands in `x`).
pub fn decode(format: TextureFormat, bytes: &[u8]) -> Vec4 {
    match format {
        TextureFormat::Rgba8Unorm | TextureFormat::Bgra8Unorm
        | TextureFormat::Rgba8Srgb | TextureFormat::Bgra8Srgb => {
            let mut c = Vec4::new(
                bytes[0] as f32 / 255.0,
                bytes[1] as f32 / 255.0,
                bytes[2] as f32 / 255.0,
                bytes[3] as f32 / 255.0,
            );
            if format.is_bgra() {
                c = Vec4::new(c.z, c.y, c.x, c.w);
            }
            if format.is_srgb() {
                c = Vec4::new(srgb_to_linear(c.x), srgb_to_linear(c.y), srgb_to_linear(c.z), c.w);
            }
            c
        }
        TextureFormat::Rgba16Float => {
            let mut c = [0.0f32; 4];
            for (i, v) in c.iter_mut().enumerate() {
                *v = f16_to_f32(u16::from_le_bytes([bytes[i * 2], bytes[i * 2 + 1]]));
            }
            Vec4::from_array(c)
        }
        TextureFormat::Depth32Float => {
            Vec4::new(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]), 0.0, 0.0, 1.0)
        }
    }
}

/// Fills every texel of `data` with `color`.
pub fn fill(format: TextureFormat, color: Vec4, data: &mut [u8]) {
    let bpp = format.bytes_per_pixel() as usize;
    let mut texel = [0u8; 8];
    encode(format, color, &mut texel[..bpp]);
    for chunk in data.chunks_exact_mut(bpp) {
        chunk.copy_from_slice(&texel[..bpp]);
    }
}

fn f32_to_f16(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xff) as i32;
    let mantissa = bits & 0x7f_ffff;

    if exp == 0xff {
        let nan = if mantissa != 0 { 0x200 } else { 0 };
        return sign | 0x7c00 | nan;
    }
    let exp = exp - 127 + 15;
    if exp >= 0x1f {
        return sign | 0x7c00;
    }
    if exp <= 0 {
        if exp < -10 {
            return sign;
        }
        let mantissa = (mantissa | 0x80_0000) >> (1 - exp);
        return sign | ((mantissa + 0x1000) >> 13) as u16;
    }
    sign | ((((exp as u32) << 10) | mantissa >> 13) + ((mantissa >> 12) & 1)) as u16
}

fn f16_to_f32(half: u16) -> f32 {
    let sign = ((half & 0x8000) as u32) << 16;
    let exp = ((half >> 10) & 0x1f) as u32;
    let mantissa = (half & 0x3ff) as u32;

    let bits = match (exp, mantissa) {
        (0, 0) => sign,
        (0, mut m) => {
            // Subnormal: renormalize into an f32 exponent
            let mut e = 127 - 15 + 1;
            while m & 0x400 == 0 {
                m <<= 1;
                e -= 1;
            }
            sign | (e << 23) | ((m & 0x3ff) << 13)
        }
        (0x1f, m) => sign | 0x7f80_0000 | (m << 13),
        (e, m) => sign | ((e + 127 - 15) << 23) | (m << 13),
    };
    f32::from_bits(bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unorm_round_trips_primaries() {
        let mut texel = [0u8; 4];
        encode(TextureFormat::Rgba8Unorm, Vec4::new(1.0, 0.0, 0.0, 1.0), &mut texel);
        assert_eq!(texel, [255, 0, 0, 255]);

        encode(TextureFormat::Bgra8Unorm, Vec4::new(1.0, 0.0, 0.0, 1.0), &mut texel);
        assert_eq!(texel, [0, 0, 255, 255]);
        assert_eq!(decode(TextureFormat::Bgra8Unorm, &texel), Vec4::new(1.0, 0.0, 0.0, 1.0));
    }

    #[test]
    fn srgb_encoding_brightens_midtones() {
        let mut texel = [0u8; 4];
        encode(TextureFormat::Rgba8Srgb, Vec4::splat(0.5), &mut texel);
        assert_eq!(texel[0], 188);
        // alpha stays linear
        assert_eq!(texel[3], 128);
        let back = decode(TextureFormat::Rgba8Srgb, &texel);
        assert!((back.x - 0.5).abs() < 0.01);
    }

    #[test]
    fn half_floats_cover_common_values() {
        for v in [0.0f32, 1.0, 0.5, -2.0, 0.25, 65504.0] {
            assert_eq!(f16_to_f32(f32_to_f16(v)), v);
        }
        assert_eq!(f32_to_f16(1.0), 0x3c00);
        assert!(f16_to_f32(f32_to_f16(0.1)) - 0.1 < 1e-3);
        // smallest subnormal
        assert_eq!(f16_to_f32(1), 2.0f32.powi(-24));
    }

    #[test]
    fn fill_repeats_texel() {
        let mut data = vec![0u8; 16];
        fill(TextureFormat::Depth32Float, Vec4::new(1.0, 0.0, 0.0, 0.0), &mut data);
        assert_eq!(decode(TextureFormat::Depth32Float, &data[12..]).x, 1.0);
    }
}
