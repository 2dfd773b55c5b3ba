//! Deterministic-with-fallback allocation of the `172.18.i.0/24` slot index
//! for a VM.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::{Error, Result};

const MIN_SLOT: u16 = 1;
const MAX_SLOT: u16 = 254;

/// An assigned network slot: one `/24` subnet, keyed by index `1..=254`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot(pub u16);

impl Slot {
    /// Guest IP address for this slot (`172.18.i.2`).
    pub fn guest_ip(&self) -> String {
        format!("172.18.{}.2", self.0)
    }

    /// Gateway IP address for this slot (`172.18.i.1`).
    pub fn gateway_ip(&self) -> String {
        format!("172.18.{}.1", self.0)
    }

    /// CIDR prefix shared by guest and gateway addresses.
    pub fn prefix_len(&self) -> u8 {
        24
    }

    /// A locally-administered MAC address derived from the slot index, so
    /// distinct slots never collide.
    pub fn guest_mac(&self) -> String {
        format!("02:FC:00:00:00:{:02X}", self.0)
    }
}

/// Computes the preferred slot for `vm_id` by a stable hash, then scans
/// forward (wrapping) for the first slot not in `taken`.
///
/// Returns [`Error::NetworkExhausted`] if all 254 slots are occupied.
pub fn allocate(vm_id: &str, taken: &std::collections::HashSet<u16>) -> Result<Slot> {
    let preferred = preferred_slot(vm_id);
    if !taken.contains(&preferred) {
        return Ok(Slot(preferred));
    }

    let span = MAX_SLOT - MIN_SLOT + 1;
    for offset in 1..span {
        let candidate = MIN_SLOT + (preferred - MIN_SLOT + offset) % span;
        if !taken.contains(&candidate) {
            return Ok(Slot(candidate));
        }
    }

    Err(Error::NetworkExhausted)
}

fn preferred_slot(vm_id: &str) -> u16 {
    let mut hasher = DefaultHasher::new();
    vm_id.hash(&mut hasher);
    let span = u64::from(MAX_SLOT - MIN_SLOT + 1);
    MIN_SLOT + (hasher.finish() % span) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn allocation_is_deterministic_for_the_same_id() {
        let taken = HashSet::new();
        assert_eq!(allocate("vm-a", &taken).unwrap(), allocate("vm-a", &taken).unwrap());
    }

    #[test]
    fn falls_forward_when_preferred_slot_is_taken() {
        let preferred = preferred_slot("vm-a");
        let mut taken = HashSet::new();
        taken.insert(preferred);
        let slot = allocate("vm-a", &taken).unwrap();
        assert_ne!(slot.0, preferred);
        assert!((MIN_SLOT..=MAX_SLOT).contains(&slot.0));
    }

    #[test]
    fn exhaustion_is_reported() {
        let taken: HashSet<u16> = (MIN_SLOT..=MAX_SLOT).collect();
        assert!(matches!(allocate("vm-a", &taken), Err(Error::NetworkExhausted)));
    }

    #[test]
    fn wrapping_scan_reaches_slot_one_from_near_the_end() {
        let mut taken: HashSet<u16> = (MIN_SLOT..=MAX_SLOT).collect();
        taken.remove(&MIN_SLOT);
        // Whatever the preferred slot is, every other slot is taken, so the
        // scan must wrap around to find slot 1.
        let slot = allocate("vm-wrap", &taken).unwrap();
        assert_eq!(slot.0, MIN_SLOT);
    }
}
