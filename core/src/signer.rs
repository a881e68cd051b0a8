//! Nkey/JWT signing adapter seam. The actual cryptography is out of
//! scope for this crate; the seam callers plug a signer into is not.
//!
//! The CONNECT handshake's challenge-response auth (a server-issued
//! nonce signed with the client's Ed25519 nkey) needs a signer; this
//! crate depends only on the trait so the actual key material and
//! signing algorithm live in a caller-supplied adapter.

/// Signs server-issued nonces during the CONNECT handshake.
pub trait Signer: Send + Sync {
    /// Sign `nonce`, returning the base64url-encoded signature expected
    /// in the CONNECT payload's `sig` field.
    fn sign(&self, nonce: &[u8]) -> String;

    /// The public nkey identifying this signer, sent as `CONNECT.nkey`.
    fn public_key(&self) -> String;
}
