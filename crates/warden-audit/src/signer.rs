// signer.rs: Signing capability for audit records.
//
// Decision logic never touches key material directly: it goes through the
// `Signer` trait (sign + verify), so the algorithm can be swapped without
// touching the gate. The shipped implementation is Ed25519 via `ring`.
//
// Key lifecycle:
//   - first run: a PKCS#8 key is generated and written to the configured
//     path with mode 0600, outside the audit log directory tree if the
//     operator configures it that way;
//   - the raw public key is published next to it as `<path>.pub` (base64);
//   - later runs load the same key, so old records keep verifying.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair, UnparsedPublicKey, ED25519};

use crate::error::AuditError;
use crate::hasher;

/// Verification half of the signing capability.
///
/// Integrity validation only needs this half, which lets tooling verify a
/// log with nothing but the published public key.
pub trait SignatureVerifier: Send + Sync {
    /// Short stable identifier of the verifying key.
    fn key_id(&self) -> &str;

    /// Check `signature` over `message`.
    fn verify(&self, message: &[u8], signature: &[u8]) -> bool;

    /// Check a base64-encoded signature. Undecodable input is a failed check.
    fn verify_b64(&self, message: &[u8], signature_b64: &str) -> bool {
        match STANDARD.decode(signature_b64) {
            Ok(sig) => self.verify(message, &sig),
            Err(_) => false,
        }
    }
}

/// Full signing capability held by the audit subsystem.
pub trait Signer: SignatureVerifier {
    /// Algorithm name recorded for operators (e.g. "ed25519").
    fn algorithm(&self) -> &'static str;

    /// Raw public key bytes.
    fn public_key(&self) -> &[u8];

    /// Sign `message`, returning the raw signature.
    fn sign(&self, message: &[u8]) -> Vec<u8>;

    /// Sign `message`, returning a base64-encoded signature.
    fn sign_b64(&self, message: &[u8]) -> String {
        STANDARD.encode(self.sign(message))
    }
}

/// Derive the key id from public key bytes: first 16 hex chars of SHA-256.
pub fn key_id_for(public_key: &[u8]) -> String {
    hasher::hash_bytes(public_key)[..16].to_string()
}

/// Ed25519 signer backed by `ring`.
pub struct Ed25519Signer {
    key_pair: Ed25519KeyPair,
    key_id: String,
}

impl Ed25519Signer {
    /// Generate a fresh in-memory key (nothing is persisted).
    pub fn generate() -> Result<Self, AuditError> {
        let pkcs8 = generate_pkcs8().map_err(|reason| AuditError::SigningKey {
            path: PathBuf::from("<memory>"),
            reason,
        })?;
        Self::from_pkcs8(&pkcs8, Path::new("<memory>"))
    }

    /// Parse a PKCS#8 document. `origin` is only used in error messages.
    pub fn from_pkcs8(pkcs8: &[u8], origin: &Path) -> Result<Self, AuditError> {
        let key_pair = Ed25519KeyPair::from_pkcs8(pkcs8).map_err(|e| AuditError::SigningKey {
            path: origin.to_path_buf(),
            reason: format!("invalid PKCS#8 key: {}", e),
        })?;
        let key_id = key_id_for(key_pair.public_key().as_ref());
        Ok(Self { key_pair, key_id })
    }

    /// Load the key at `path`, generating and persisting it on first run.
    pub fn load_or_generate(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref();
        if path.exists() {
            let bytes = fs::read(path).map_err(|e| AuditError::SigningKey {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
            let signer = Self::from_pkcs8(&bytes, path)?;
            tracing::debug!(key_id = %signer.key_id, "loaded audit signing key");
            return Ok(signer);
        }

        let key_error = |reason: String| AuditError::SigningKey {
            path: path.to_path_buf(),
            reason,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| key_error(e.to_string()))?;
        }
        let pkcs8 = generate_pkcs8().map_err(key_error)?;
        write_private(path, &pkcs8).map_err(|e| key_error(e.to_string()))?;

        let signer = Self::from_pkcs8(&pkcs8, path)?;
        fs::write(
            public_key_path(path),
            STANDARD.encode(signer.public_key()),
        )
        .map_err(|e| key_error(e.to_string()))?;

        tracing::info!(
            key_id = %signer.key_id,
            path = %path.display(),
            "generated new audit signing key"
        );
        Ok(signer)
    }
}

impl SignatureVerifier for Ed25519Signer {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        UnparsedPublicKey::new(&ED25519, self.key_pair.public_key().as_ref())
            .verify(message, signature)
            .is_ok()
    }
}

impl Signer for Ed25519Signer {
    fn algorithm(&self) -> &'static str {
        "ed25519"
    }

    fn public_key(&self) -> &[u8] {
        self.key_pair.public_key().as_ref()
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.key_pair.sign(message).as_ref().to_vec()
    }
}

/// Verifier built from a published public key only.
pub struct PublicKeyVerifier {
    public_key: Vec<u8>,
    key_id: String,
}

impl PublicKeyVerifier {
    pub fn new(public_key: Vec<u8>) -> Self {
        let key_id = key_id_for(&public_key);
        Self { public_key, key_id }
    }

    /// Read a `.pub` file written by [`Ed25519Signer::load_or_generate`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref();
        let encoded = fs::read_to_string(path).map_err(|e| AuditError::SigningKey {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let public_key = STANDARD
            .decode(encoded.trim())
            .map_err(|e| AuditError::SigningKey {
                path: path.to_path_buf(),
                reason: format!("invalid base64 public key: {}", e),
            })?;
        Ok(Self::new(public_key))
    }
}

impl SignatureVerifier for PublicKeyVerifier {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        UnparsedPublicKey::new(&ED25519, &self.public_key)
            .verify(message, signature)
            .is_ok()
    }
}

/// Where the public key for a private key file is published.
pub fn public_key_path(private_key_path: &Path) -> PathBuf {
    let mut name = private_key_path.as_os_str().to_os_string();
    name.push(".pub");
    PathBuf::from(name)
}

fn generate_pkcs8() -> Result<Vec<u8>, String> {
    let rng = SystemRandom::new();
    Ed25519KeyPair::generate_pkcs8(&rng)
        .map(|doc| doc.as_ref().to_vec())
        .map_err(|_| "system randomness unavailable".to_string())
}

/// Write the private key, readable by the owner only.
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
