/// Identity of a scene object (camera, transform) as issued by the arena that owns it.
///
/// Handles stay valid if the arena's storage moves; a released slot is reused
/// with a bumped generation so stale handles never alias new objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SceneHandle {
    index: u32,
    generation: u32,
}

impl SceneHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub(crate) fn to_bits(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }
}

#[derive(Debug, Default)]
pub struct HandleAllocator {
    generations: Vec<u32>,
    live: Vec<bool>,
    free: Vec<u32>,
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self) -> SceneHandle {
        if let Some(index) = self.free.pop() {
            let slot = index as usize;
            self.live[slot] = true;
            return SceneHandle {
                index,
                generation: self.generations[slot],
            };
        }

        let index = self.generations.len() as u32;
        self.generations.push(0);
        self.live.push(true);
        SceneHandle {
            index,
            generation: 0,
        }
    }

    /// Returns false if the handle was already released or never issued here.
    pub fn release(&mut self, handle: SceneHandle) -> bool {
        if !self.is_live(handle) {
            return false;
        }
        let slot = handle.index as usize;
        self.live[slot] = false;
        self.generations[slot] = self.generations[slot].wrapping_add(1);
        self.free.push(handle.index);
        true
    }

    pub fn is_live(&self, handle: SceneHandle) -> bool {
        let slot = handle.index as usize;
        slot < self.generations.len()
            && self.live[slot]
            && self.generations[slot] == handle.generation
    }

    pub fn live_count(&self) -> usize {
        self.live.iter().filter(|live| **live).count()
    }
}

/// Identity of the draw site a cache entry serves: which transform seen through which camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DrawSiteKey {
    pub transform: SceneHandle,
    pub camera: SceneHandle,
}

impl DrawSiteKey {
    pub fn new(transform: SceneHandle, camera: SceneHandle) -> Self {
        Self { transform, camera }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_slots_come_back_with_new_generation() {
        let mut handles = HandleAllocator::new();
        let a = handles.allocate();
        let b = handles.allocate();
        assert_ne!(a, b);

        assert!(handles.release(a));
        assert!(!handles.release(a));
        assert!(!handles.is_live(a));

        let c = handles.allocate();
        assert_eq!(c.index(), a.index());
        assert_ne!(c, a);
        assert!(handles.is_live(c));
        assert!(handles.is_live(b));
        assert_eq!(handles.live_count(), 2);
    }

    #[test]
    fn bits_differ_across_generations() {
        let mut handles = HandleAllocator::new();
        let a = handles.allocate();
        handles.release(a);
        let b = handles.allocate();
        assert_ne!(a.to_bits(), b.to_bits());
    }
}
