//! The process-wide table of booked slots.
//!
//! A slot maps a short decimal code to the rendezvous channel its booker is
//! waiting on. The code is the only capability: whoever presents it joins
//! the slot, so codes are picked at random rather than sequentially, and
//! short codes are heavily favoured because users transcribe them by hand.

use std::{
    collections::HashMap,
    fmt,
    sync::Mutex,
};

use rand::Rng;

use crate::rendezvous::{self, Booking, Entry};

/// An allocation band: sample `attempts` times uniformly from `0..range`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Band {
    pub(crate) range: u32,
    pub(crate) attempts: usize,
}

/// The bands tried, in order, by the allocator.
pub(crate) const DEFAULT_BANDS: &[Band] = &[
    // Try a single decimal digit number.
    Band { range: 10, attempts: 3 },
    // Try a single byte number.
    Band { range: 1 << 8, attempts: 64 },
    // Try a 2-byte number.
    Band { range: 1 << 16, attempts: 1024 },
    // Try a 3-byte number.
    Band { range: 1 << 24, attempts: 1024 },
];

/// Every band exhausted its attempt budget without finding a free code.
#[derive(Debug, thiserror::Error)]
#[error("cannot allocate slots")]
pub(crate) struct SlotsExhausted;

/// The mapping from slot code to pending rendezvous.
///
/// All three operations mutate, so there is no separate read path; a single
/// mutex serialises them. The lock is only ever held for the duration of a
/// map lookup, insert or delete, never across channel operations or I/O.
pub(crate) struct SlotTable<T> {
    slots: Mutex<HashMap<String, Entry<T>>>,
    bands: &'static [Band],
}

impl<T> SlotTable<T> {
    pub(crate) fn new() -> Self {
        Self::with_bands(DEFAULT_BANDS)
    }

    pub(crate) fn with_bands(bands: &'static [Band]) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            bands,
        }
    }

    /// Books a new slot: picks a free code and publishes a fresh rendezvous
    /// channel under it, atomically.
    ///
    /// Fails only once every band has exhausted its attempt budget.
    pub(crate) fn reserve(&self) -> Result<(String, Booking<T>), SlotsExhausted> {
        let mut slots = self.slots.lock().expect("poisoned");
        let code = free_slot(&mut rand::thread_rng(), self.bands, &slots).ok_or(SlotsExhausted)?;
        let (booking, entry) = rendezvous::channel();
        slots.insert(code.clone(), entry);
        Ok((code, booking))
    }

    /// Removes and returns the entry for `code`.
    ///
    /// This is the linearisation point for joins: at most one caller ever
    /// observes a given code as present.
    pub(crate) fn take(&self, code: &str) -> Option<Entry<T>> {
        self.slots.lock().expect("poisoned").remove(code)
    }

    /// Releases a booked code. Idempotent.
    ///
    /// Used by the booker to clean up its own reservation on timeout or
    /// error; releasing a code that was already taken is a no-op.
    pub(crate) fn release(&self, code: &str) {
        self.slots.lock().expect("poisoned").remove(code);
    }

    #[cfg(test)]
    fn occupy(&self, code: &str) {
        let (_booking, entry) = rendezvous::channel();
        self.slots
            .lock()
            .expect("poisoned")
            .insert(code.to_string(), entry);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().expect("poisoned").len()
    }
}

impl<T> fmt::Debug for SlotTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotTable")
            .field("booked", &self.slots.lock().expect("poisoned").len())
            .finish()
    }
}

/// Finds an available code, favouring smaller numbers.
///
/// Samples uniformly within each band and escalates once the band's attempt
/// budget is spent. Random sampling keeps peers from inferring aggregate
/// allocation state by guessing "the next slot".
fn free_slot<R: Rng, T>(
    rng: &mut R,
    bands: &[Band],
    slots: &HashMap<String, Entry<T>>,
) -> Option<String> {
    for band in bands {
        for _ in 0..band.attempts {
            let code = rng.gen_range(0..band.range).to_string();
            if !slots.contains_key(&code) {
                return Some(code);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    const TINY_BANDS: &[Band] = &[
        Band { range: 4, attempts: 3 },
        Band { range: 8, attempts: 64 },
    ];

    #[test]
    fn codes_are_decimal_and_unique() {
        let table = SlotTable::<()>::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..500 {
            let (code, _booking) = table.reserve().unwrap();
            assert!(!code.is_empty());
            assert!(code.bytes().all(|b| b.is_ascii_digit()));
            assert!(seen.insert(code), "codes must be unique while booked");
        }
        assert_eq!(table.len(), 500);
    }

    #[test]
    fn empty_table_yields_single_digit() {
        // With nothing booked the very first sample of the first band is
        // free, so the code is always a single digit.
        let table = SlotTable::<()>::new();
        let (code, _booking) = table.reserve().unwrap();
        assert_eq!(code.len(), 1);
    }

    #[test]
    fn allocator_escalates_bands() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut slots = HashMap::new();
        for n in 0..4u32 {
            let (_booking, entry) = rendezvous::channel::<()>();
            slots.insert(n.to_string(), entry);
        }
        // Band one is fully booked; the allocator must fall through to the
        // second band and still find something.
        let code = free_slot(&mut rng, TINY_BANDS, &slots).unwrap();
        let n: u32 = code.parse().unwrap();
        assert!((4..8).contains(&n));
    }

    #[test]
    fn allocator_saturation_is_deterministic() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut slots = HashMap::new();
        for n in 0..8u32 {
            let (_booking, entry) = rendezvous::channel::<()>();
            slots.insert(n.to_string(), entry);
        }
        for _ in 0..16 {
            assert!(free_slot(&mut rng, TINY_BANDS, &slots).is_none());
        }
    }

    #[test]
    fn reserve_reports_exhaustion() {
        let table = SlotTable::<()>::with_bands(TINY_BANDS);
        for n in 0..8u32 {
            table.occupy(&n.to_string());
        }
        assert!(table.reserve().is_err());
        // Freeing any code makes allocation possible again, eventually.
        table.release("3");
        let (code, _booking) = loop {
            if let Ok(reservation) = table.reserve() {
                break reservation;
            }
        };
        assert_eq!(code, "3");
    }

    #[test]
    fn take_is_exclusive() {
        let table = SlotTable::<()>::new();
        let (code, _booking) = table.reserve().unwrap();
        assert!(table.take(&code).is_some());
        assert!(table.take(&code).is_none());
    }

    #[test]
    fn take_missing_code() {
        let table = SlotTable::<()>::new();
        assert!(table.take("12345").is_none());
    }

    #[test]
    fn release_is_idempotent() {
        let table = SlotTable::<()>::new();
        let (code, _booking) = table.reserve().unwrap();
        table.release(&code);
        table.release(&code);
        assert!(table.take(&code).is_none());
    }
}
