//! # Storage Receipt Verification
//!
//! Checks that a storage committee actually attested to the roots a header
//! commits to.
//!
//! Three levels, from cheapest to most complete:
//!
//! 1. [`verify_receipt_body`]: structural comparison of a decoded body
//!    against a header. No cryptography.
//! 2. [`verify_receipt_signatures`]: every signature collected in a header
//!    must be valid over the body the header implies.
//! 3. [`verify_receipt`]: opens a signed receipt, optionally pins the signer
//!    and then runs the structural check.
//!
//! None of these decide *who* is allowed to sign. A header full of valid
//! signatures from the wrong nodes passes level 2; checking membership
//! against the storage committee is the caller's job.

use thiserror::Error;

use super::header::Header;
use crate::config::RECEIPT_SIGNATURE_CONTEXT;
use crate::crypto::PublicKey;
use crate::storage::{Receipt, ReceiptBody};

/// Errors from receipt verification.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReceiptError {
    #[error("receipt signature verification failed")]
    SignatureInvalid,

    #[error("receipt has unexpected namespace")]
    UnexpectedNamespace,

    #[error("receipt has unexpected round: expected {expected}, got {got}")]
    UnexpectedRound { expected: u64, got: u64 },

    #[error("receipt has unexpected number of roots: expected {expected}, got {got}")]
    UnexpectedRootCount { expected: usize, got: usize },

    #[error("receipt has unexpected root at index {index}")]
    RootMismatch { index: usize },

    #[error("receipt signed by unexpected signer {0}")]
    UnexpectedSigner(PublicKey),

    #[error("malformed receipt body: {0}")]
    MalformedBody(String),
}

/// Verifies every storage signature in `header` over the receipt body the
/// header implies.
///
/// The expected body is encoded once and each signature checked against it;
/// the first invalid signature fails the whole header. An empty signature
/// list verifies trivially.
pub fn verify_receipt_signatures(header: &Header) -> Result<(), ReceiptError> {
    let blob = header.receipt_body().encode();
    for bundle in &header.storage_signatures {
        bundle
            .verify(RECEIPT_SIGNATURE_CONTEXT, &blob)
            .map_err(|_| ReceiptError::SignatureInvalid)?;
    }
    Ok(())
}

/// Checks that a decoded receipt body matches `header`.
///
/// Checks run in a fixed order (namespace, round, root count, roots) and
/// the first failure is returned.
pub fn verify_receipt_body(header: &Header, body: &ReceiptBody) -> Result<(), ReceiptError> {
    if body.namespace != header.namespace {
        return Err(ReceiptError::UnexpectedNamespace);
    }

    if body.round != header.round {
        return Err(ReceiptError::UnexpectedRound {
            expected: header.round,
            got: body.round,
        });
    }

    let roots = header.roots_for_receipt();
    if body.roots.len() != roots.len() {
        return Err(ReceiptError::UnexpectedRootCount {
            expected: roots.len(),
            got: body.roots.len(),
        });
    }

    if let Some(index) = roots
        .iter()
        .zip(&body.roots)
        .position(|(expected, got)| expected != got)
    {
        return Err(ReceiptError::RootMismatch { index });
    }

    Ok(())
}

/// Opens `receipt`, checks its signer when `expected_signer` is given, and
/// verifies the body against `header`.
pub fn verify_receipt(
    header: &Header,
    receipt: &Receipt,
    expected_signer: Option<&PublicKey>,
) -> Result<ReceiptBody, ReceiptError> {
    let body = receipt.open()?;
    if let Some(signer) = expected_signer {
        if receipt.signer() != signer {
            return Err(ReceiptError::UnexpectedSigner(*receipt.signer()));
        }
    }
    verify_receipt_body(header, &body)?;
    Ok(body)
}
