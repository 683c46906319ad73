//! Per-core counter slots.

/// Index into the per-CPU `STATS` array.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Stat {
    Packets = 0,
    Bytes = 1,
    SignalingRequests = 2,
    Dropped = 3,
    Transmitted = 4,
    /// Load-balanced class whose selected slot was empty.
    NoBackend = 5,
}

impl Stat {
    pub const COUNT: u32 = 6;

    pub const ALL: [Stat; Stat::COUNT as usize] = [
        Stat::Packets,
        Stat::Bytes,
        Stat::SignalingRequests,
        Stat::Dropped,
        Stat::Transmitted,
        Stat::NoBackend,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Stat::Packets => "packets",
            Stat::Bytes => "bytes",
            Stat::SignalingRequests => "signaling_requests",
            Stat::Dropped => "dropped",
            Stat::Transmitted => "transmitted",
            Stat::NoBackend => "no_backend",
        }
    }
}

/// Increment-only view of this core's counters.
pub trait StatsSink {
    fn add(&mut self, stat: Stat, n: u64);

    #[inline(always)]
    fn incr(&mut self, stat: Stat) {
        self.add(stat, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_dense() {
        for (i, stat) in Stat::ALL.iter().enumerate() {
            assert_eq!(*stat as u32, i as u32);
        }
    }
}
