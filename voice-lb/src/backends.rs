//! Backend slot tables, live or pinned.

use std::{
    borrow::{Borrow, BorrowMut},
    convert::TryFrom,
    fmt,
    net::Ipv4Addr,
    path::Path,
};

use anyhow::{Context, Result, anyhow, ensure};
use aya::Ebpf;
use aya::maps::{Array, Map, MapData};

use voice_lb_common::{Backend, MAGLEV_TABLE_SIZE, MAX_BACKENDS, Pool};

use crate::{config::MacAddr, loader, maglev};

pub type SlotTable = [Backend; MAX_BACKENDS as usize];

pub fn read_pool<T: Borrow<MapData>>(array: &Array<T, Backend>) -> Result<SlotTable> {
    let mut table = [Backend::EMPTY; MAX_BACKENDS as usize];
    for (slot, entry) in table.iter_mut().enumerate() {
        *entry = array
            .get(&(slot as u32), 0)
            .with_context(|| format!("failed to read backend slot {slot}"))?;
    }
    Ok(table)
}

pub fn write_pool<T: BorrowMut<MapData>>(
    array: &mut Array<T, Backend>,
    table: &SlotTable,
) -> Result<()> {
    for (slot, backend) in table.iter().enumerate() {
        array
            .set(slot as u32, backend, 0)
            .with_context(|| format!("failed to write backend slot {slot}"))?;
    }
    Ok(())
}

/// Rebuilds and writes the Maglev table for `table`.
pub fn write_maglev<T: BorrowMut<MapData>>(
    array: &mut Array<T, u32>,
    table: &SlotTable,
) -> Result<()> {
    let entries = maglev::build_table(table);
    ensure!(
        entries.len() == MAGLEV_TABLE_SIZE as usize,
        "maglev table has {} entries, map expects {MAGLEV_TABLE_SIZE}",
        entries.len()
    );
    for (index, slot) in entries.iter().enumerate() {
        array
            .set(index as u32, slot, 0)
            .with_context(|| format!("failed to write maglev entry {index}"))?;
    }
    Ok(())
}

/// Returns `table` with `slot` replaced, or emptied when `backend` is `None`.
pub fn with_slot(table: &SlotTable, slot: u32, backend: Option<Backend>) -> Result<SlotTable> {
    ensure!(
        slot < MAX_BACKENDS,
        "slot {slot} out of range, pools have {MAX_BACKENDS} slots"
    );
    let mut next = *table;
    next[slot as usize] = match backend {
        Some(b) => {
            ensure!(b.addr != 0, "backend address 0.0.0.0 is not allowed");
            b
        }
        None => Backend::EMPTY,
    };
    Ok(next)
}

/// One pool's backend and Maglev maps opened from their pins.
pub struct PinnedPool {
    pub pool: Pool,
    backends: Array<MapData, Backend>,
    maglev: Array<MapData, u32>,
}

impl PinnedPool {
    pub fn open(pin_dir: &Path, pool: Pool) -> Result<Self> {
        let (backends_name, maglev_name) = loader::pool_map_names(pool);
        Ok(Self {
            pool,
            backends: open_array(&pin_dir.join(backends_name))?,
            maglev: open_array(&pin_dir.join(maglev_name))?,
        })
    }

    /// Takes a pool's maps out of a loaded object. They stay pinned.
    pub fn take(bpf: &mut Ebpf, pool: Pool) -> Result<Self> {
        let (backends_name, maglev_name) = loader::pool_map_names(pool);
        let backends = bpf
            .take_map(backends_name)
            .with_context(|| format!("map {backends_name} not found"))?;
        let maglev = bpf
            .take_map(maglev_name)
            .with_context(|| format!("map {maglev_name} not found"))?;
        Ok(Self {
            pool,
            backends: Array::try_from(backends).context("backend map has unexpected type")?,
            maglev: Array::try_from(maglev).context("maglev map has unexpected type")?,
        })
    }

    /// Writes every slot and rebuilds the pool's Maglev table.
    pub fn replace(&mut self, table: &SlotTable) -> Result<()> {
        write_pool(&mut self.backends, table)?;
        write_maglev(&mut self.maglev, table)
    }

    pub fn list(&self) -> Result<SlotTable> {
        read_pool(&self.backends)
    }

    /// Writes one slot and rebuilds the pool's Maglev table.
    pub fn update(&mut self, slot: u32, backend: Option<Backend>) -> Result<()> {
        let current = self.list()?;
        let next = with_slot(&current, slot, backend)?;
        self.backends
            .set(slot, next[slot as usize], 0)
            .with_context(|| format!("failed to write backend slot {slot}"))?;
        write_maglev(&mut self.maglev, &next)
    }
}

fn open_array<V: aya::Pod>(pin: &Path) -> Result<Array<MapData, V>> {
    let map_data = MapData::from_pin(pin)
        .map_err(|e| anyhow!("failed to open pinned map {}: {}", pin.display(), e))?;
    let map_enum = Map::Array(map_data);
    Array::<_, V>::try_from(map_enum).map_err(|e| anyhow!("failed to convert to Array: {}", e))
}

/// Display form of one slot for `backend list`.
pub struct SlotRow<'a> {
    pub slot: usize,
    pub backend: &'a Backend,
}

impl fmt::Display for SlotRow<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.backend;
        if b.addr == 0 {
            return write!(f, "{:>2}  -", self.slot);
        }
        write!(
            f,
            "{:>2}  {}:{}  weight={} connections={}",
            self.slot,
            Ipv4Addr::from(b.addr),
            b.port,
            b.weight,
            b.connections
        )?;
        if let Some(mac) = b.mac() {
            write!(f, " mac={}", MacAddr(mac))?;
        }
        if !b.is_usable() {
            write!(f, " (down)")?;
        }
        Ok(())
    }
}
