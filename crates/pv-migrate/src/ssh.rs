//! SSH key pair generation.
//!
//! Produces a public key in `authorized_keys` form and a matching private key PEM:
//! Ed25519 keys use the `openssh-key-v1` container, RSA keys use PKCS#1.

use base64::Engine;
use ed25519_dalek::SigningKey;
use rand_core::{OsRng, RngCore};
use rsa::pkcs1::{EncodeRsaPrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;

use crate::error::{MigrateError, MigrateResult};
use crate::types::KeyAlgorithm;

/// RSA modulus size in bits.
pub const RSA_KEY_BITS: usize = 2048;

const OPENSSH_MAGIC: &[u8] = b"openssh-key-v1\0";
const OPENSSH_BLOCK_SIZE: usize = 8;
const ED25519_KEY_TYPE: &str = "ssh-ed25519";
const RSA_KEY_TYPE: &str = "ssh-rsa";

/// A freshly generated key pair.
#[derive(Clone)]
pub struct KeyPair {
    /// Algorithm the pair was generated with.
    pub algorithm: KeyAlgorithm,
    /// Public key as a single `authorized_keys` line, newline-terminated.
    pub public_key: String,
    /// Private key PEM.
    pub private_key: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("algorithm", &self.algorithm)
            .field("public_key", &self.public_key.trim_end())
            .finish_non_exhaustive()
    }
}

/// Generates a key pair for the given algorithm.
///
/// # Errors
///
/// Returns [`MigrateError::Key`] if key generation or PEM encoding fails.
pub fn generate(algorithm: KeyAlgorithm) -> MigrateResult<KeyPair> {
    match algorithm {
        KeyAlgorithm::Ed25519 => Ok(generate_ed25519()),
        KeyAlgorithm::Rsa => generate_rsa(),
    }
}

fn generate_ed25519() -> KeyPair {
    let signing_key = SigningKey::generate(&mut OsRng);
    let public = signing_key.verifying_key().to_bytes();

    let mut public_blob = WireWriter::default();
    public_blob.put_string(ED25519_KEY_TYPE.as_bytes());
    public_blob.put_string(&public);
    let public_blob = public_blob.into_inner();

    let check = OsRng.next_u32();
    let mut private_section = WireWriter::default();
    private_section.put_u32(check);
    private_section.put_u32(check);
    private_section.put_string(ED25519_KEY_TYPE.as_bytes());
    private_section.put_string(&public);
    private_section.put_string(&signing_key.to_keypair_bytes());
    private_section.put_string(b"");
    private_section.pad_to_block(OPENSSH_BLOCK_SIZE);

    let mut container = WireWriter::default();
    container.put_raw(OPENSSH_MAGIC);
    container.put_string(b"none");
    container.put_string(b"none");
    container.put_string(b"");
    container.put_u32(1);
    container.put_string(&public_blob);
    container.put_string(&private_section.into_inner());

    KeyPair {
        algorithm: KeyAlgorithm::Ed25519,
        public_key: authorized_key_line(ED25519_KEY_TYPE, &public_blob),
        private_key: encode_pem("OPENSSH PRIVATE KEY", container.into_inner()),
    }
}

fn generate_rsa() -> MigrateResult<KeyPair> {
    let private = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
        .map_err(|e| MigrateError::Key(format!("failed to generate rsa key: {e}")))?;

    let private_pem = private
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| MigrateError::Key(format!("failed to encode rsa key: {e}")))?;

    let mut public_blob = WireWriter::default();
    public_blob.put_string(RSA_KEY_TYPE.as_bytes());
    public_blob.put_mpint(&private.e().to_bytes_be());
    public_blob.put_mpint(&private.n().to_bytes_be());
    let public_blob = public_blob.into_inner();

    Ok(KeyPair {
        algorithm: KeyAlgorithm::Rsa,
        public_key: authorized_key_line(RSA_KEY_TYPE, &public_blob),
        private_key: private_pem.as_str().to_owned(),
    })
}

fn authorized_key_line(key_type: &str, blob: &[u8]) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(blob);
    format!("{key_type} {encoded}\n")
}

fn encode_pem(tag: &str, contents: Vec<u8>) -> String {
    let block = pem::Pem::new(tag, contents);
    pem::encode_config(
        &block,
        pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
    )
}

/// Encoder for the SSH wire format (RFC 4251 §5).
#[derive(Default)]
struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    fn put_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn put_string(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.put_raw(bytes);
    }

    /// Writes an unsigned big-endian integer as an mpint.
    fn put_mpint(&mut self, magnitude: &[u8]) {
        let first_nonzero = magnitude.iter().position(|&b| b != 0);
        let trimmed = first_nonzero.map_or(&[][..], |i| &magnitude[i..]);
        if trimmed.first().is_some_and(|&b| b & 0x80 != 0) {
            self.put_u32(trimmed.len() as u32 + 1);
            self.buf.push(0);
            self.put_raw(trimmed);
        } else {
            self.put_string(trimmed);
        }
    }

    /// Appends 1..=block_size padding bytes of the form 1, 2, 3, ...
    fn pad_to_block(&mut self, block_size: usize) {
        let pad = block_size - self.buf.len() % block_size;
        for i in 1..=pad {
            self.buf.push(i as u8);
        }
    }

    fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}
