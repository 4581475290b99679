use glam::Vec3;
use xxhash_rust::xxh3::Xxh3;

/// Frames elapsed from `earlier` to `now` on a wrapping `u32` counter.
///
/// The difference is taken modulo 2^32 and read as signed, so a counter that
/// wrapped past `u32::MAX` still compares correctly. A negative result means
/// `earlier` is ahead of `now` and is reported as zero elapsed frames.
pub fn frames_since(now: u32, earlier: u32) -> u32 {
    let delta = now.wrapping_sub(earlier) as i32;
    delta.max(0) as u32
}

/// True if a resource last used at `last_use` has been idle for at least `threshold` frames.
pub fn is_stale(now: u32, last_use: u32, threshold: u32) -> bool {
    frames_since(now, last_use) >= threshold
}

/// Number of levels in a full mip chain for the given size.
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

pub fn mip_extent(extent: u32, level: u32) -> u32 {
    (extent >> level).max(1)
}

/// Stable 64-bit hasher for fingerprints. Never seeded per process, so
/// fingerprints are comparable across runs.
pub struct Fingerprint(Xxh3);

impl Fingerprint {
    pub fn new() -> Self {
        Self(Xxh3::new())
    }

    pub fn write(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.update(bytes);
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.write(&value.to_le_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.write(&value.to_le_bytes())
    }

    pub fn write_str(&mut self, value: &str) -> &mut Self {
        self.write_u64(value.len() as u64).write(value.as_bytes())
    }

    pub fn finish(&self) -> u64 {
        self.0.digest()
    }
}

impl Default for Fingerprint {
    fn default() -> Self {
        Self::new()
    }
}

pub fn calculate_pitch(forward: Vec3) -> f32 {
    let forward = forward.normalize();
    forward.y.clamp(-1.0, 1.0).asin()
}

pub fn calculate_yaw(forward: Vec3) -> f32 {
    let forward = forward.normalize();
    forward.z.atan2(forward.x)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_since_handles_wraparound() {
        assert_eq!(frames_since(10, 4), 6);
        assert_eq!(frames_since(3, u32::MAX - 1), 5);
        assert_eq!(frames_since(0, u32::MAX), 1);
        // `earlier` ahead of `now`
        assert_eq!(frames_since(4, 10), 0);
    }

    #[test]
    fn staleness_uses_inclusive_threshold() {
        assert!(!is_stale(199, 100, 100));
        assert!(is_stale(200, 100, 100));
        assert!(is_stale(50, u32::MAX - 49, 100));
        assert!(!is_stale(49, u32::MAX - 49, 100));
    }

    #[test]
    fn mip_chain_length() {
        assert_eq!(mip_level_count(1, 1), 1);
        assert_eq!(mip_level_count(2, 1), 2);
        assert_eq!(mip_level_count(256, 256), 9);
        assert_eq!(mip_level_count(300, 17), 9);
        assert_eq!(mip_extent(300, 8), 1);
        assert_eq!(mip_extent(300, 2), 75);
    }

    #[test]
    fn fingerprints_are_order_sensitive() {
        let a = Fingerprint::new().write_u32(1).write_u32(2).finish();
        let b = Fingerprint::new().write_u32(2).write_u32(1).finish();
        let c = Fingerprint::new().write_u32(1).write_u32(2).finish();
        assert_ne!(a, b);
        assert_eq!(a, c);
    }
}
