use blst::min_sig::{PublicKey as BlstPublicKey, SecretKey, Signature as BlstSignature};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Invalid key material: {0}")]
    InvalidKey(String),
    #[error("Invalid hex encoding")]
    InvalidHex,
}

/// SHA-256 digest of arbitrary bytes, rendered as lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

// -----------------------------------------------------------------------------
// BLS keys and signatures (blst::min_sig).
// min_sig: Signatures in G1 (48 bytes), Public Keys in G2 (96 bytes).
// On the wire everything is hex inside JSON documents.
// -----------------------------------------------------------------------------

/// BLS Public Key (96 bytes).
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey(pub BlstPublicKey);

impl PublicKey {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_bytes())
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidHex)?;
        let pk = BlstPublicKey::from_bytes(&bytes)
            .map_err(|e| CryptoError::InvalidKey(format!("{:?}", e)))?;
        Ok(PublicKey(pk))
    }

    /// A validator address is the hex SHA-256 of the public key bytes.
    pub fn address(&self) -> String {
        sha256_hex(&self.0.to_bytes())
    }
}

impl std::hash::Hash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.to_bytes().hash(state);
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        PublicKey::from_hex(&s).map_err(|e| serde::de::Error::custom(format!("{:?}", e)))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pub({})", self.to_hex())
    }
}

impl PartialOrd for PublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PublicKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.to_bytes().cmp(&other.0.to_bytes())
    }
}

/// BLS Private Key.
#[derive(Clone)]
pub struct PrivateKey(pub SecretKey);

impl PrivateKey {
    /// Generate a new random Private Key.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut ikm = [0u8; 32];
        rng.fill_bytes(&mut ikm);
        let sk = SecretKey::key_gen(&ikm, &[]).expect("32 bytes of ikm");
        PrivateKey(sk)
    }

    /// Derive a Private Key from a 32-byte hex seed (node provisioning).
    pub fn from_seed_hex(seed: &str) -> Result<Self, CryptoError> {
        let ikm = hex::decode(seed).map_err(|_| CryptoError::InvalidHex)?;
        if ikm.len() < 32 {
            return Err(CryptoError::InvalidKey("seed shorter than 32 bytes".into()));
        }
        let sk = SecretKey::key_gen(&ikm, &[])
            .map_err(|e| CryptoError::InvalidKey(format!("{:?}", e)))?;
        Ok(PrivateKey(sk))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.sk_to_pk())
    }
}

/// BLS Signature (48 bytes).
#[derive(Clone, PartialEq, Eq)]
pub struct Signature(pub BlstSignature);

impl Signature {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_bytes())
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidHex)?;
        let sig = BlstSignature::from_bytes(&bytes)
            .map_err(|e| CryptoError::InvalidKey(format!("{:?}", e)))?;
        Ok(Signature(sig))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sig({})", self.to_hex())
    }
}

/// Domain separation tag for all validator signatures.
const DST: &[u8] = b"BLS_SIG_BLS12381G1_XMD:SHA-256_SSWU_RO_POP_";

pub fn sign(priv_key: &PrivateKey, message: &[u8]) -> Signature {
    Signature(priv_key.0.sign(message, DST, &[]))
}

pub fn verify(pub_key: &PublicKey, message: &[u8], signature: &Signature) -> bool {
    let err = signature.0.verify(true, message, DST, &[], &pub_key.0, true);
    err == blst::BLST_ERROR::BLST_SUCCESS
}

/// Verify a hex-encoded signature against a hex-encoded public key.
/// Malformed encodings verify as false rather than erroring; the caller
/// treats them as protocol violations either way.
pub fn verify_hex(pub_key_hex: &str, message: &[u8], signature_hex: &str) -> bool {
    let (Ok(pk), Ok(sig)) = (
        PublicKey::from_hex(pub_key_hex),
        Signature::from_hex(signature_hex),
    ) else {
        return false;
    };
    verify(&pk, message, &sig)
}

/// Generate a KeyPair (Public, Private).
pub fn generate_keypair() -> (PublicKey, PrivateKey) {
    let sk = PrivateKey::generate();
    let pk = sk.public_key();
    (pk, sk)
}

/// Generate a KeyPair from a u64 ID (deterministic).
/// Useful for static validator sets and tests where keys are derived from IDs.
pub fn generate_keypair_from_id(id: u64) -> (PublicKey, PrivateKey) {
    let mut ikm = [0u8; 32];
    ikm[24..32].copy_from_slice(&id.to_be_bytes());
    let sk = SecretKey::key_gen(&ikm, &[]).expect("32 bytes of ikm");
    let pk = sk.sk_to_pk();
    (PublicKey(pk), PrivateKey(sk))
}
