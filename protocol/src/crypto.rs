//! Record signing and verification
//!
//! Every `Host` record is self-signed: the signature covers the
//! record's canonical bytes and verifies against the public key
//! embedded in the record itself, so any peer can check authenticity
//! without trusting the transport. Verification never fails fatally;
//! a record that does not check out is reported invalid and dropped
//! by the caller.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::error::MeshError;
use crate::model::Host;

/// Base64-encode a verifying key the way it appears in records and
/// network identifiers.
pub fn encode_public_key(key: &VerifyingKey) -> String {
    BASE64.encode(key.as_bytes())
}

/// Decode a base64 public key string back into a verifying key.
pub fn decode_public_key(encoded: &str) -> Result<VerifyingKey, MeshError> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| MeshError::InvalidKey(format!("public key is not valid base64: {e}")))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| MeshError::InvalidKey("public key must be 32 bytes".into()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| MeshError::InvalidKey(format!("not a valid ed25519 point: {e}")))
}

/// Sign a host record in place, populating its `signature` field.
///
/// The record's embedded `public_key` must match the signing key;
/// signing someone else's record is an invariant violation.
pub fn sign_host(host: &mut Host, key: &SigningKey) -> Result<(), MeshError> {
    let expected = encode_public_key(&key.verifying_key());
    if host.public_key != expected {
        return Err(MeshError::InvalidRecord(
            "record public key does not match signing key".into(),
        ));
    }

    let bytes = host.canonical_bytes()?;
    let sig = key.sign(&bytes);
    host.signature = BASE64.encode(sig.to_bytes());
    Ok(())
}

/// Verify a host record's signature against its own embedded public key.
///
/// Any malformed field (bad base64, wrong length, invalid key bytes)
/// yields `false` rather than an error: forged or corrupted records
/// are discarded, not fatal.
pub fn verify_host(host: &Host) -> bool {
    let Ok(public_key) = decode_public_key(&host.public_key) else {
        return false;
    };

    let Ok(sig_bytes) = BASE64.decode(&host.signature) else {
        return false;
    };
    let sig_bytes: [u8; 64] = match sig_bytes.try_into() {
        Ok(b) => b,
        Err(_) => return false,
    };
    let signature = Signature::from_bytes(&sig_bytes);

    let Ok(bytes) = host.canonical_bytes() else {
        return false;
    };

    public_key.verify(&bytes, &signature).is_ok()
}
