//! Maglev lookup tables for the `maglev` selector mode.
//!
//! Each usable slot gets a permutation of the table derived from its
//! address and port, and slots take turns claiming their next free entry
//! until the table is full. The data path only indexes the result.

use voice_lb_common::{Backend, MAGLEV_EMPTY, MAGLEV_TABLE_SIZE};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
const OFFSET_SEED: u64 = 0;
const SKIP_SEED: u64 = 0x9e37_79b9_7f4a_7c15;

fn hash(seed: u64, backend: &Backend) -> u64 {
    let mut h = FNV_OFFSET ^ seed;
    for byte in backend
        .addr
        .to_be_bytes()
        .into_iter()
        .chain(backend.port.to_be_bytes())
    {
        h ^= byte as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    // FNV alone leaves neighbouring addresses correlated in the low bits.
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^ (h >> 33)
}

struct Permutation {
    slot: u32,
    offset: u64,
    skip: u64,
    next: u64,
}

impl Permutation {
    fn new(slot: u32, backend: &Backend) -> Self {
        let m = MAGLEV_TABLE_SIZE as u64;
        Self {
            slot,
            offset: hash(OFFSET_SEED, backend) % m,
            skip: hash(SKIP_SEED, backend) % (m - 1) + 1,
            next: 0,
        }
    }

    fn advance(&mut self) -> usize {
        let m = MAGLEV_TABLE_SIZE as u64;
        let pos = (self.offset + self.next * self.skip) % m;
        self.next += 1;
        pos as usize
    }
}

/// Builds the table for one pool. Every entry names a usable slot, or
/// every entry is `MAGLEV_EMPTY` when the pool has none.
pub fn build_table(backends: &[Backend]) -> Vec<u32> {
    let mut table = vec![MAGLEV_EMPTY; MAGLEV_TABLE_SIZE as usize];
    let mut perms: Vec<Permutation> = backends
        .iter()
        .enumerate()
        .filter(|(_, b)| b.is_usable())
        .map(|(slot, b)| Permutation::new(slot as u32, b))
        .collect();
    if perms.is_empty() {
        return table;
    }

    let mut filled = 0usize;
    'fill: loop {
        for perm in perms.iter_mut() {
            // The table size is prime, so each permutation visits every
            // entry and this always finds a free one while any remain.
            let mut pos = perm.advance();
            while table[pos] != MAGLEV_EMPTY {
                pos = perm.advance();
            }
            table[pos] = perm.slot;
            filled += 1;
            if filled == table.len() {
                break 'fill;
            }
        }
    }
    table
}
