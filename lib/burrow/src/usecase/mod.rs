//! The session layer: authentication, key agreement, session/connection
//! tables and the glue between tunnel interfaces and transports.

pub mod client;
pub mod server;

pub use client::ClientUseCase;
pub use server::ServerUseCase;

use std::sync::Arc;

use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey};

use loam::crypto::{self, Encryptor, Method};
use loam::logging::Logger;

use crate::codec::{Codec, CodecConfig};
use crate::error::{Error, Result};
use crate::message::HEADER_SIZE;

/// Builds a codec whose length accounting matches the configured cipher.
pub(crate) fn build_codec(
    log: &Logger,
    mtu: usize,
    method: Method,
    obfuscate: bool,
) -> Result<Arc<Codec>> {
    // The codec only needs the length function; any key of the right size
    // will do for that.
    let probe = crypto::create(method, &vec![0u8; method.key_size()])?;
    Ok(Arc::new(Codec::new(
        log,
        CodecConfig { mtu, obfuscate },
        Box::new(move |n| probe.cipher_len(n)),
    )))
}

/// One MTU frame's encrypted payload capacity: what remains of a datagram
/// once the encrypted header is accounted for.
pub(crate) fn max_ack_size(mtu: usize, primary: &Arc<dyn Encryptor>) -> usize {
    mtu - primary.cipher_len(HEADER_SIZE)
}

pub(crate) fn ecdh_keypair() -> (EphemeralSecret, PublicKey) {
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret, public)
}

/// Completes the key agreement with the peer's public key, consuming the
/// ephemeral secret.
pub(crate) fn ecdh_shared(secret: EphemeralSecret, peer_key: &[u8]) -> Result<[u8; 32]> {
    if peer_key.len() != 32 {
        return Err(Error::HandshakeFailed);
    }
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(peer_key);
    let peer = PublicKey::from(bytes);
    Ok(*secret.diffie_hellman(&peer).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ecdh_agreement() {
        let (secret_a, public_a) = ecdh_keypair();
        let (secret_b, public_b) = ecdh_keypair();

        let shared_a = ecdh_shared(secret_a, public_b.as_bytes()).unwrap();
        let shared_b = ecdh_shared(secret_b, public_a.as_bytes()).unwrap();

        assert_eq!(shared_a, shared_b);
    }

    #[test]
    fn test_ecdh_rejects_short_key() {
        let (secret, _) = ecdh_keypair();
        assert_eq!(
            ecdh_shared(secret, &[0u8; 16]).unwrap_err(),
            Error::HandshakeFailed
        );
    }

    #[test]
    fn test_max_ack_size() {
        let primary = crypto::create(Method::Aes256Ecb, &crypto::generate_key()).unwrap();
        // 1400 minus the 16-byte encrypted header block.
        assert_eq!(max_ack_size(1400, &primary), 1400 - 16);
    }
}
