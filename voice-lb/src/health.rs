//! TCP reachability checks that take dead backends out of rotation.
//!
//! A backend that fails `unhealthy_after` checks in a row keeps its slot
//! contents but loses `BACKEND_ACTIVE`, so the data path passes its flows
//! instead of steering them at a dead host. `healthy_after` consecutive
//! successes restore the flag.

use std::{
    net::{Ipv4Addr, SocketAddrV4},
    time::Duration,
};

use tokio::{net::TcpStream, task::JoinSet, time};
use tracing::{debug, info, warn};

use voice_lb_common::{BACKEND_ACTIVE, Backend, MAX_BACKENDS};

use crate::backends::SlotTable;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HealthPolicy {
    pub timeout: Duration,
    pub healthy_after: u8,
    pub unhealthy_after: u8,
}

/// Check history for one slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotHealth {
    target: Option<SocketAddrV4>,
    healthy: bool,
    successes: u8,
    failures: u8,
}

impl SlotHealth {
    const UNTRACKED: SlotHealth = SlotHealth {
        target: None,
        healthy: true,
        successes: 0,
        failures: 0,
    };

    fn tracking(target: SocketAddrV4) -> Self {
        Self {
            target: Some(target),
            ..Self::UNTRACKED
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Feeds one check result. Returns the new state when it flips.
    pub fn record(&mut self, ok: bool, policy: &HealthPolicy) -> Option<bool> {
        if ok {
            self.successes = self.successes.saturating_add(1);
            self.failures = 0;
            if !self.healthy && self.successes >= policy.healthy_after {
                self.healthy = true;
                return Some(true);
            }
        } else {
            self.failures = self.failures.saturating_add(1);
            self.successes = 0;
            if self.healthy && self.failures >= policy.unhealthy_after {
                self.healthy = false;
                return Some(false);
            }
        }
        None
    }
}

fn target_of(backend: &Backend) -> Option<SocketAddrV4> {
    (backend.addr != 0).then(|| SocketAddrV4::new(Ipv4Addr::from(backend.addr), backend.port))
}

/// Health of every slot in one pool.
#[derive(Clone, Debug)]
pub struct PoolHealth {
    slots: [SlotHealth; MAX_BACKENDS as usize],
}

impl Default for PoolHealth {
    fn default() -> Self {
        Self {
            slots: [SlotHealth::UNTRACKED; MAX_BACKENDS as usize],
        }
    }
}

impl PoolHealth {
    pub fn slot(&self, slot: u32) -> Option<&SlotHealth> {
        self.slots.get(slot as usize)
    }

    /// Slots worth checking in `table`. A slot whose address changed since the
    /// last pass (edited with `backend set`) starts over as healthy; an
    /// inactive slot this tracker did not disable is left alone.
    pub fn targets(&mut self, table: &SlotTable) -> Vec<(u32, SocketAddrV4)> {
        let mut targets = Vec::new();
        for (slot, (backend, state)) in table.iter().zip(self.slots.iter_mut()).enumerate() {
            let Some(target) = target_of(backend) else {
                *state = SlotHealth::UNTRACKED;
                continue;
            };
            if state.target != Some(target) {
                *state = SlotHealth::tracking(target);
            }
            if backend.flags & BACKEND_ACTIVE == 0 && state.healthy {
                continue;
            }
            targets.push((slot as u32, target));
        }
        targets
    }

    /// Applies check results to `table`. Returns whether any slot flipped.
    pub fn apply(
        &mut self,
        table: &mut SlotTable,
        results: &[(u32, bool)],
        policy: &HealthPolicy,
        pool: &str,
    ) -> bool {
        let mut changed = false;
        for &(slot, ok) in results {
            let (Some(state), Some(backend)) = (
                self.slots.get_mut(slot as usize),
                table.get_mut(slot as usize),
            ) else {
                continue;
            };
            if state.target != target_of(backend) {
                continue;
            }
            match state.record(ok, policy) {
                Some(true) => {
                    backend.flags |= BACKEND_ACTIVE;
                    info!(pool, slot, target = ?state.target, "backend healthy, back in rotation");
                    changed = true;
                }
                Some(false) => {
                    backend.flags &= !BACKEND_ACTIVE;
                    warn!(pool, slot, target = ?state.target, "backend unhealthy, taken out of rotation");
                    changed = true;
                }
                None => {}
            }
        }
        changed
    }
}

/// Whether a TCP connection to `target` completes within `timeout`.
pub async fn check(target: SocketAddrV4, timeout: Duration) -> bool {
    match time::timeout(timeout, TcpStream::connect(target)).await {
        Ok(Ok(_)) => true,
        Ok(Err(err)) => {
            debug!(%target, %err, "health check failed");
            false
        }
        Err(_) => {
            debug!(%target, "health check timed out");
            false
        }
    }
}

/// Checks every target concurrently.
pub async fn check_all(targets: Vec<(u32, SocketAddrV4)>, timeout: Duration) -> Vec<(u32, bool)> {
    let mut set = JoinSet::new();
    for (slot, target) in targets {
        set.spawn(async move { (slot, check(target, timeout).await) });
    }
    let mut results = Vec::with_capacity(set.len());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(err) => debug!(%err, "health check task failed"),
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY: HealthPolicy = HealthPolicy {
        timeout: Duration::from_millis(500),
        healthy_after: 2,
        unhealthy_after: 3,
    };

    fn backend(last: u8, port: u16) -> Backend {
        Backend {
            addr: u32::from(Ipv4Addr::new(10, 0, 0, last)),
            port,
            weight: 100,
            flags: BACKEND_ACTIVE,
            ..Backend::EMPTY
        }
    }

    #[test]
    fn thresholds_gate_state_changes() {
        let mut state = SlotHealth::tracking(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 5060));

        assert_eq!(state.record(false, &POLICY), None);
        assert_eq!(state.record(false, &POLICY), None);
        assert!(state.is_healthy());
        assert_eq!(state.record(false, &POLICY), Some(false));
        assert!(!state.is_healthy());
        assert_eq!(state.record(false, &POLICY), None);

        assert_eq!(state.record(true, &POLICY), None);
        assert_eq!(state.record(true, &POLICY), Some(true));
        assert!(state.is_healthy());
        assert_eq!(state.record(true, &POLICY), None);
    }

    #[test]
    fn a_success_resets_the_failure_streak() {
        let mut state = SlotHealth::tracking(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 5060));
        for _ in 0..10 {
            assert_eq!(state.record(false, &POLICY), None);
            assert_eq!(state.record(false, &POLICY), None);
            assert_eq!(state.record(true, &POLICY), None);
        }
        assert!(state.is_healthy());
    }

    #[test]
    fn unhealthy_backend_keeps_its_entry_but_loses_active() {
        let mut table = [Backend::EMPTY; MAX_BACKENDS as usize];
        table[2] = backend(2, 5060);
        table[5] = backend(5, 5060);
        let mut health = PoolHealth::default();

        for round in 0..3 {
            let targets = health.targets(&table);
            assert_eq!(targets.len(), 2);
            let results: Vec<_> = targets.iter().map(|&(slot, _)| (slot, slot != 5)).collect();
            let changed = health.apply(&mut table, &results, &POLICY, "signaling");
            assert_eq!(changed, round == 2);
        }
        assert!(table[2].is_usable());
        assert!(!table[5].is_usable());
        assert_eq!(table[5].addr, backend(5, 5060).addr);

        // Still checked while down, and restored after two successes.
        for round in 0..2 {
            let targets = health.targets(&table);
            assert!(targets.iter().any(|&(slot, _)| slot == 5));
            let results: Vec<_> = targets.iter().map(|&(slot, _)| (slot, true)).collect();
            let changed = health.apply(&mut table, &results, &POLICY, "signaling");
            assert_eq!(changed, round == 1);
        }
        assert!(table[5].is_usable());
    }

    #[test]
    fn edited_slot_starts_over() {
        let mut table = [Backend::EMPTY; MAX_BACKENDS as usize];
        table[1] = backend(1, 5060);
        let mut health = PoolHealth::default();
        for _ in 0..2 {
            health.targets(&table);
            health.apply(&mut table, &[(1, false)], &POLICY, "api");
        }

        table[1] = backend(9, 5060);
        let targets = health.targets(&table);
        assert_eq!(
            targets,
            vec![(1, SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 9), 5060))]
        );
        // Two earlier failures belonged to the old address.
        assert!(!health.apply(&mut table, &[(1, false)], &POLICY, "api"));
        assert!(table[1].is_usable());
    }

    #[test]
    fn operator_disabled_and_empty_slots_are_skipped() {
        let mut table = [Backend::EMPTY; MAX_BACKENDS as usize];
        table[0] = Backend {
            flags: 0,
            ..backend(3, 5060)
        };
        let mut health = PoolHealth::default();
        assert!(health.targets(&table).is_empty());
        assert_eq!(health.slot(7), Some(&SlotHealth::UNTRACKED));
    }

    #[tokio::test]
    async fn connect_check_sees_listening_and_closed_ports() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = match listener.local_addr().unwrap() {
            std::net::SocketAddr::V4(addr) => addr,
            other => panic!("unexpected address {other}"),
        };

        let closed = {
            let spare = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            match spare.local_addr().unwrap() {
                std::net::SocketAddr::V4(addr) => addr,
                other => panic!("unexpected address {other}"),
            }
        };

        let mut results = check_all(vec![(0, open), (1, closed)], POLICY.timeout).await;
        results.sort_unstable();
        assert_eq!(results, vec![(0, true), (1, false)]);
    }
}
