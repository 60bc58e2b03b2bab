//! lansentinel - reachability and occupancy monitoring for shared-computer
//! venues.
//!
//! The library carries the moving parts; the `sentineld` and
//! `sentinel-watch` binaries wire them to a host. Presentation,
//! screenshot encoding, notification payloads, and setup UI are external
//! collaborators behind the traits in [`notify`].

pub mod config;
pub mod monitor;
pub mod notify;
pub mod probe;
pub mod watchdog;
