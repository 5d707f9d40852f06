//! # Sequence Utilities
//!
//! Wrap-aware sequence arithmetic and the ring-indexed window every channel
//! stores its in-flight state in.
//!
//! All windowing is expressed through [`distance`]: a result `<= 0` means the
//! sequence is stale or a duplicate relative to the reference, `> 0` means it
//! is newer.

/// Signed circular distance from `to` to `from` in a `bits`-wide sequence
/// space (`1..=64`). Positive when `from` is ahead of `to`.
#[inline]
pub fn distance(from: u64, to: u64, bits: u8) -> i64 {
    debug_assert!((1..=64).contains(&bits));
    let shift = 64 - u32::from(bits.clamp(1, 64));
    let from = (from << shift) as i64;
    let to = (to << shift) as i64;
    from.wrapping_sub(to) >> shift
}

/// [`distance`] specialised for the 16-bit channel sequences.
#[inline]
pub fn distance16(from: u16, to: u16) -> i32 {
    i32::from(from.wrapping_sub(to) as i16)
}

// ─── SequenceWindow ─────────────────────────────────────────────────────────

struct Slot<T> {
    sequence: u16,
    item: T,
}

/// Fixed-size ring of entries keyed by 16-bit sequence.
///
/// An entry lives at `sequence % size` and is only visible through the exact
/// sequence it was inserted with. The size is a power of two so the ring stays
/// consistent across the 16-bit wrap.
pub struct SequenceWindow<T> {
    slots: Vec<Option<Slot<T>>>,
    mask: usize,
    len: usize,
}

impl<T> SequenceWindow<T> {
    /// Create a window with `size` rounded up to a power of two (max 32768).
    pub fn new(size: usize) -> Self {
        let size = size.clamp(1, 1 << 15).next_power_of_two();
        let mut slots = Vec::with_capacity(size);
        slots.resize_with(size, || None);
        SequenceWindow {
            slots,
            mask: size - 1,
            len: 0,
        }
    }

    #[inline]
    fn index(&self, sequence: u16) -> usize {
        sequence as usize & self.mask
    }

    /// Number of slots.
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, sequence: u16) -> bool {
        self.get(sequence).is_some()
    }

    pub fn get(&self, sequence: u16) -> Option<&T> {
        match &self.slots[self.index(sequence)] {
            Some(slot) if slot.sequence == sequence => Some(&slot.item),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, sequence: u16) -> Option<&mut T> {
        let index = self.index(sequence);
        match &mut self.slots[index] {
            Some(slot) if slot.sequence == sequence => Some(&mut slot.item),
            _ => None,
        }
    }

    /// Store `item` under `sequence`, returning whatever occupied the slot
    /// (which may belong to a different sequence).
    pub fn insert(&mut self, sequence: u16, item: T) -> Option<T> {
        let index = self.index(sequence);
        let previous = self.slots[index].replace(Slot { sequence, item });
        match previous {
            Some(slot) => Some(slot.item),
            None => {
                self.len += 1;
                None
            }
        }
    }

    pub fn remove(&mut self, sequence: u16) -> Option<T> {
        let index = self.index(sequence);
        match &self.slots[index] {
            Some(slot) if slot.sequence == sequence => {
                self.len -= 1;
                self.slots[index].take().map(|slot| slot.item)
            }
            _ => None,
        }
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.len = 0;
    }

    /// Iterate occupied entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (u16, &T)> {
        self.slots
            .iter()
            .filter_map(|slot| slot.as_ref().map(|s| (s.sequence, &s.item)))
    }

    /// Iterate occupied entries mutably in slot order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u16, &mut T)> {
        self.slots
            .iter_mut()
            .filter_map(|slot| slot.as_mut().map(|s| (s.sequence, &mut s.item)))
    }
}

impl<T> std::fmt::Debug for SequenceWindow<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceWindow")
            .field("size", &self.slots.len())
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_across_wrap() {
        assert_eq!(distance16(0, 65535), 1);
        assert_eq!(distance16(65535, 0), -1);
        assert_eq!(distance16(10, 10), 0);
        assert_eq!(distance16(5, 65530), 11);
    }

    #[test]
    fn distance_generic_bits() {
        assert_eq!(distance(0, 255, 8), 1);
        assert_eq!(distance(255, 0, 8), -1);
        assert_eq!(distance(100, 50, 64), 50);
        assert_eq!(distance(0, u64::MAX, 64), 1);
        assert_eq!(distance(3, 1, 2), -2);
    }

    #[test]
    fn distance_matches_specialisation() {
        for (a, b) in [(0u16, 1u16), (40000, 3), (65535, 32768), (7, 7)] {
            assert_eq!(distance(a as u64, b as u64, 16), distance16(a, b) as i64);
        }
    }

    #[test]
    fn window_rounds_to_power_of_two() {
        let window: SequenceWindow<()> = SequenceWindow::new(100);
        assert_eq!(window.size(), 128);
    }

    #[test]
    fn window_insert_get_remove() {
        let mut window = SequenceWindow::new(8);
        assert!(window.insert(3, "a").is_none());
        assert_eq!(window.get(3), Some(&"a"));
        assert_eq!(window.get(11), None, "same slot, different sequence");
        assert_eq!(window.len(), 1);

        assert_eq!(window.remove(11), None);
        assert_eq!(window.remove(3), Some("a"));
        assert!(window.is_empty());
    }

    #[test]
    fn window_overwrite_returns_previous() {
        let mut window = SequenceWindow::new(4);
        window.insert(1, 10);
        assert_eq!(window.insert(5, 50), Some(10));
        assert_eq!(window.len(), 1);
        assert_eq!(window.get(5), Some(&50));
    }

    #[test]
    fn window_consistent_across_wrap() {
        let mut window = SequenceWindow::new(16);
        for seq in 65530u16..=65535 {
            window.insert(seq, seq);
        }
        for seq in 0u16..6 {
            window.insert(seq, seq);
        }
        assert_eq!(window.len(), 12);
        for seq in (65530u16..=65535).chain(0..6) {
            assert_eq!(window.get(seq), Some(&seq));
        }
    }
}
