//! Control plane for the XDP voice load balancer: configuration, map
//! population, Maglev tables, stats harvesting and rate-table sweeping.

pub mod backends;
pub mod config;
pub mod health;
pub mod loader;
pub mod maglev;
pub mod stats;
pub mod sweep;
