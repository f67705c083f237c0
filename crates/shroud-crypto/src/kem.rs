//! Kyber key encapsulation for the per-stream handshake.
//!
//! The producer owns a [`KemKeypair`] and sends its public key to the
//! relay. The relay calls [`encapsulate`] and answers with the ciphertext;
//! the producer recovers the same [`SharedSecret`] via
//! [`KemKeypair::decapsulate`].

use pqc_kyber::{KYBER_CIPHERTEXTBYTES, KYBER_PUBLICKEYBYTES, KYBER_SECRETKEYBYTES, KYBER_SSBYTES};
use rand::rngs::OsRng;
use shroud_common::{KEM_CIPHERTEXT_LEN, KEM_PUBLIC_KEY_LEN};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::aead::AEAD_KEY_LEN;
use crate::error::CryptoError;

/// Length of an encoded public key.
pub const PUBLIC_KEY_LEN: usize = KYBER_PUBLICKEYBYTES;

/// Length of an encapsulation ciphertext.
pub const CIPHERTEXT_LEN: usize = KYBER_CIPHERTEXTBYTES;

/// Length of the shared secret.
pub const SHARED_SECRET_LEN: usize = KYBER_SSBYTES;

const _: () = assert!(SHARED_SECRET_LEN >= AEAD_KEY_LEN);
// The wire layer checks lengths without linking the KEM.
const _: () = assert!(PUBLIC_KEY_LEN == KEM_PUBLIC_KEY_LEN);
const _: () = assert!(CIPHERTEXT_LEN == KEM_CIPHERTEXT_LEN);

/// Secret agreed by a handshake. Wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; SHARED_SECRET_LEN]);

impl SharedSecret {
    pub fn from_bytes(bytes: [u8; SHARED_SECRET_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_LEN] {
        &self.0
    }

    /// AEAD key: the leading [`AEAD_KEY_LEN`] bytes of the secret.
    pub fn aead_key(&self) -> Zeroizing<[u8; AEAD_KEY_LEN]> {
        let mut key = Zeroizing::new([0u8; AEAD_KEY_LEN]);
        key.copy_from_slice(&self.0[..AEAD_KEY_LEN]);
        key
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// Producer-side Kyber keypair.
pub struct KemKeypair {
    public: [u8; PUBLIC_KEY_LEN],
    secret: Zeroizing<[u8; KYBER_SECRETKEYBYTES]>,
}

impl KemKeypair {
    /// Generate a keypair from the OS CSPRNG.
    pub fn generate() -> Result<Self, CryptoError> {
        let keys = pqc_kyber::keypair(&mut OsRng)
            .map_err(|e| CryptoError::Encapsulation(format!("keypair generation: {:?}", e)))?;
        Ok(Self {
            public: keys.public,
            secret: Zeroizing::new(keys.secret),
        })
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public
    }

    /// Recover the shared secret from the relay's ciphertext.
    ///
    /// Kyber uses implicit rejection: a tampered ciphertext of the right
    /// length yields an unrelated secret rather than an error, which then
    /// surfaces as authentication failures on the first frame.
    pub fn decapsulate(&self, ciphertext: &[u8]) -> Result<SharedSecret, CryptoError> {
        if ciphertext.len() != CIPHERTEXT_LEN {
            return Err(CryptoError::InvalidCiphertext {
                expected: CIPHERTEXT_LEN,
                actual: ciphertext.len(),
            });
        }
        let secret = pqc_kyber::decapsulate(ciphertext, &self.secret[..])
            .map_err(|e| CryptoError::Decapsulation(format!("{:?}", e)))?;
        Ok(SharedSecret(secret))
    }
}

impl std::fmt::Debug for KemKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KemKeypair")
            .field("public_len", &self.public.len())
            .finish_non_exhaustive()
    }
}

/// Relay side of the handshake: encapsulate against a producer's public key.
///
/// Returns the ciphertext to send back and the secret to keep.
pub fn encapsulate(public_key: &[u8]) -> Result<(Vec<u8>, SharedSecret), CryptoError> {
    if public_key.len() != PUBLIC_KEY_LEN {
        return Err(CryptoError::InvalidPublicKey {
            expected: PUBLIC_KEY_LEN,
            actual: public_key.len(),
        });
    }
    let (ciphertext, secret) = pqc_kyber::encapsulate(public_key, &mut OsRng)
        .map_err(|e| CryptoError::Encapsulation(format!("{:?}", e)))?;
    Ok((ciphertext.to_vec(), SharedSecret(secret)))
}
