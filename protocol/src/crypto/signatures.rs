//! # Digital Signatures
//!
//! Domain-separated Ed25519 signing.
//!
//! Every signature in shardstore is computed over `context || message`, where
//! the context is a fixed byte string naming what is being signed (see
//! [`RECEIPT_SIGNATURE_CONTEXT`](crate::config::RECEIPT_SIGNATURE_CONTEXT)).
//! A storage receipt signature can therefore never be replayed as a
//! signature over some other structure that happens to share an encoding.
//!
//! [`SignatureBundle`] carries the signer's public key next to the
//! signature. Block headers store bundles, so a verifier can check a
//! signature without knowing up front who produced it. Whether that signer
//! was *supposed* to sign is a separate question the caller answers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::keys::{Keypair, PublicKey, Signature};

/// Errors during signature operations.
///
/// Intentionally vague, we don't tell anyone why verification failed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature verification failed")]
    VerificationFailed,
}

/// A signature together with the public key that produced it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureBundle {
    pub public_key: PublicKey,
    pub signature: Signature,
}

impl SignatureBundle {
    /// Signs `message` under `context` and bundles the signer's key.
    pub fn sign(keypair: &Keypair, context: &[u8], message: &[u8]) -> Self {
        Self {
            public_key: keypair.public_key(),
            signature: sign_with_context(keypair, context, message),
        }
    }

    /// Verifies the bundled signature over `context || message`.
    pub fn verify(&self, context: &[u8], message: &[u8]) -> Result<(), SignatureError> {
        verify_with_context(&self.public_key, context, message, &self.signature)
    }
}

fn prefixed(context: &[u8], message: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(context.len() + message.len());
    buf.extend_from_slice(context);
    buf.extend_from_slice(message);
    buf
}

/// Signs `context || message`.
pub fn sign_with_context(keypair: &Keypair, context: &[u8], message: &[u8]) -> Signature {
    keypair.sign(&prefixed(context, message))
}

/// Verifies a signature over `context || message`.
pub fn verify_with_context(
    public_key: &PublicKey,
    context: &[u8],
    message: &[u8],
    signature: &Signature,
) -> Result<(), SignatureError> {
    if public_key.verify(&prefixed(context, message), signature) {
        Ok(())
    } else {
        Err(SignatureError::VerificationFailed)
    }
}
