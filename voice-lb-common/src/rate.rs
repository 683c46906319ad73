//! Fixed-window admission per source address.
//!
//! A source may send `limit` requests at the tail of one window and another
//! `limit` right after the boundary, so bursts of up to `2 * limit` inside a
//! short interval are expected.
//!
//! Updates are a plain read-modify-write on the shared record. Two cores
//! handling the same source in the same instant can both observe room and
//! both admit, overshooting the limit by at most the number of racing cores.
//! A single core's stream is enforced exactly.

use crate::RateRecord;

/// Storage for per-source records. The kernel implementation is an LRU hash
/// map shared by every core.
pub trait RateTable {
    fn lookup(&mut self, addr: u32) -> Option<&mut RateRecord>;

    /// Creates a record. `false` means the table refused it (e.g. full).
    fn insert(&mut self, addr: u32, record: RateRecord) -> bool;
}

/// Window length and per-window budget.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RateLimit {
    pub limit: u64,
    pub window_ns: u64,
}

/// Returns whether a request from `addr` at `now` (ns) is admitted.
///
/// A refused insert admits without creating a record.
#[inline(always)]
pub fn admit<T: RateTable + ?Sized>(table: &mut T, addr: u32, now: u64, rate: RateLimit) -> bool {
    match table.lookup(addr) {
        Some(record) => {
            if now.saturating_sub(record.window_start) > rate.window_ns {
                record.count = 1;
                record.window_start = now;
                return true;
            }
            if record.count >= rate.limit {
                return false;
            }
            record.count += 1;
            true
        }
        None => {
            let _ = table.insert(
                addr,
                RateRecord {
                    count: 1,
                    window_start: now,
                },
            );
            true
        }
    }
}

/// Whether a record has been idle for more than `idle_windows` windows and
/// can be swept by the control plane.
pub fn is_expired(record: &RateRecord, now: u64, window_ns: u64, idle_windows: u64) -> bool {
    now.saturating_sub(record.window_start) > window_ns.saturating_mul(idle_windows.max(1))
}

#[cfg(test)]
pub(crate) mod tests {
    extern crate std;

    use super::*;
    use std::collections::BTreeMap;

    /// Bounded in-memory table standing in for the kernel map.
    #[derive(Default)]
    pub struct MemTable {
        pub records: BTreeMap<u32, RateRecord>,
        pub capacity: Option<usize>,
    }

    impl RateTable for MemTable {
        fn lookup(&mut self, addr: u32) -> Option<&mut RateRecord> {
            self.records.get_mut(&addr)
        }

        fn insert(&mut self, addr: u32, record: RateRecord) -> bool {
            if self.capacity.is_some_and(|cap| self.records.len() >= cap) {
                return false;
            }
            self.records.insert(addr, record);
            true
        }
    }

    const SRC: u32 = 0xcb00_7105;
    const MS: u64 = 1_000_000;

    fn small() -> RateLimit {
        RateLimit {
            limit: 5,
            window_ns: 1_000 * MS,
        }
    }

    #[test]
    fn first_packet_creates_record() {
        let mut table = MemTable::default();
        assert!(admit(&mut table, SRC, 42, small()));
        assert_eq!(
            table.records[&SRC],
            RateRecord {
                count: 1,
                window_start: 42
            }
        );
    }

    #[test]
    fn denies_past_limit_without_mutating() {
        let mut table = MemTable::default();
        for i in 0..5 {
            assert!(admit(&mut table, SRC, i * MS, small()), "request {i}");
        }
        let before = table.records[&SRC];
        for i in 5..50 {
            assert!(!admit(&mut table, SRC, i * MS, small()), "request {i}");
        }
        assert_eq!(table.records[&SRC], before);
    }

    #[test]
    fn window_expiry_resets_count() {
        let mut table = MemTable::default();
        for _ in 0..5 {
            assert!(admit(&mut table, SRC, 0, small()));
        }
        assert!(!admit(&mut table, SRC, 999 * MS, small()));
        // Exactly one window later is still inside it.
        assert!(!admit(&mut table, SRC, 1_000 * MS, small()));

        assert!(admit(&mut table, SRC, 1_200 * MS, small()));
        assert_eq!(
            table.records[&SRC],
            RateRecord {
                count: 1,
                window_start: 1_200 * MS
            }
        );
    }

    #[test]
    fn boundary_burst_reaches_twice_the_limit() {
        let mut table = MemTable::default();
        let rate = small();
        assert!(admit(&mut table, SRC, 0, rate));
        let mut admitted = 0;
        for _ in 0..10 {
            if admit(&mut table, SRC, 999 * MS, rate) {
                admitted += 1;
            }
        }
        for _ in 0..10 {
            if admit(&mut table, SRC, 1_001 * MS, rate) {
                admitted += 1;
            }
        }
        // 4 left in the first window plus a full second window.
        assert_eq!(admitted, 4 + 5);
    }

    #[test]
    fn sources_are_independent() {
        let mut table = MemTable::default();
        for _ in 0..5 {
            assert!(admit(&mut table, SRC, 0, small()));
        }
        assert!(!admit(&mut table, SRC, 0, small()));
        assert!(admit(&mut table, SRC + 1, 0, small()));
    }

    #[test]
    fn full_table_admits_without_tracking() {
        let mut table = MemTable {
            capacity: Some(1),
            ..Default::default()
        };
        assert!(admit(&mut table, 1, 0, small()));
        for _ in 0..20 {
            assert!(admit(&mut table, 2, 0, small()));
        }
        assert!(!table.records.contains_key(&2));
    }

    #[test]
    fn clock_going_backwards_does_not_reset() {
        let mut table = MemTable::default();
        for _ in 0..5 {
            assert!(admit(&mut table, SRC, 5_000 * MS, small()));
        }
        assert!(!admit(&mut table, SRC, 0, small()));
    }

    #[test]
    fn expiry_for_sweeping() {
        let record = RateRecord {
            count: 9,
            window_start: 0,
        };
        let window = 1_000 * MS;
        assert!(!is_expired(&record, 2_000 * MS, window, 2));
        assert!(is_expired(&record, 2_001 * MS, window, 2));
        assert!(is_expired(&record, 1_001 * MS, window, 0));
    }
}
