//! # Osprey
//!
//! Core of a long-running scanner daemon that mediates between an OSP
//! protocol front-end and an external vulnerability-scan engine. The daemon
//! accepts structured scan requests, launches one engine process per scan,
//! continuously harvests intermediate scan state from a shared key-value
//! store, translates it into protocol-level results and progress, and
//! coordinates feed updates that must never race running scans.
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------+
//! |                 protocol front-end (OSP)                |
//! |        start/stop scans, read results & progress        |
//! +---------------------------+-----------------------------+
//!                             |
//!                             v
//! +---------------------------------------------------------+
//! |                        Daemon                           |
//! |  init / check / exec_scan / stop_scan / scheduler       |
//! +------+--------------------+--------------------+--------+
//!        |                    |                    |
//!        v                    v                    v
//! +-------------+     +---------------+     +-------------+
//! | ScanSuper-  |     |  VtCatalog    |     |  FeedLock   |
//! | visor (one  |     |  (db 0 cache, |     |  (advisory  |
//! | per scan)   |     |  filter, hash)|     |  file lock) |
//! +------+------+     +-------+-------+     +-------------+
//!        |                    |
//!        v                    v
//! +---------------------------------------------------------+
//! |        shared key-value store (numbered databases)      |
//! |   main KB per scan  +  per-host KBs claimed by engine   |
//! +---------------------------+-----------------------------+
//!                             |
//!                             v
//!                  engine process (one per scan)
//! ```
//!
//! Every scan owns one *main KB* in the store; the engine claims additional
//! per-host databases beneath it. The supervisor polls those databases,
//! turning `|||`-delimited records into typed results, and releases every
//! claimed database when the scan ends — regardless of how it ends.
//!
//! Feed refreshes are globally exclusive: the scheduler compares the cached
//! feed version against the engine's on-disk `plugin_feed_info.inc` and
//! refreshes under a cross-process file lock, republishing the collection
//! hash and the ready flag together.
//!
//! ## Modules
//!
//! - [`daemon`] — component ownership, init, feed scheduler
//! - [`supervisor`] — per-scan lifecycle loop
//! - [`prefs`] — scan request → engine preference rows
//! - [`catalog`] — VT metadata cache, filter, collection hash
//! - [`registry`] / [`kv`] — database allocation and store access
//! - [`engine`] — engine executable control and liveness
//! - [`results`] — result translation and progress arithmetic
//! - [`lock`] — the cross-process feed lock
//! - [`vtfmt`] — XML fragment formatters for VT metadata
//! - [`cvss`] — CVSS base score computation
//!
//! The key-value store and the engine are reached through the [`kv::KvStore`]
//! and [`engine::EngineControl`] seams; the crate ships in-memory and stub
//! implementations of both, so the whole lifecycle is testable without a
//! redis server or an engine binary.

pub mod catalog;
pub mod cvss;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod kv;
pub mod lock;
pub mod params;
pub mod prefs;
pub mod registry;
pub mod results;
pub mod scan;
pub mod supervisor;
pub mod vtfmt;

pub use daemon::{Daemon, DaemonConfig};
pub use error::{Error, Result};
