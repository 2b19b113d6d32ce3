//! # Root Hash
//!
//! Runtime block headers and verification of the storage receipts that
//! attest to their roots.

pub mod header;
pub mod verify;

pub use header::{Header, HeaderType, RoothashMessage};
pub use verify::{verify_receipt, verify_receipt_body, verify_receipt_signatures, ReceiptError};
