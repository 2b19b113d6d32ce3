// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Shardstore Protocol
//!
//! The data-availability layer of a sharded-runtime node: a client for the
//! replicated store a runtime's storage committee operates, and the
//! receipt machinery that lets anyone check that the committee really
//! produced the roots a block header claims.
//!
//! ## Architecture
//!
//! - **common** Addresses, node descriptors and namespaces.
//! - **crypto** Ed25519 keys, BLAKE3 hashes, context-separated signatures.
//! - **roothash** Block headers and storage receipt verification.
//! - **scheduler** Committee stream and the per-runtime committee watcher.
//! - **registry** Node lookup and address resolution.
//! - **storage** The `Backend` trait, the committee client, the local sled
//!   engine, wrappers and the backend selector.
//! - **config** Protocol constants and defaults.
//!
//! ## Flow
//!
//! ```text
//! scheduler ──committees──► CommitteeWatcher ──► StorageClient ──► members
//!                                                     │
//! registry  ──addresses──────────────────────────────┘
//!
//! members ──signed receipts──► Header.storage_signatures ──► verify_receipt
//! ```

pub mod common;
pub mod config;
pub mod crypto;
pub mod registry;
pub mod roothash;
pub mod scheduler;
pub mod storage;
