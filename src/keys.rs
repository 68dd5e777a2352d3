//! Extended public key helpers: validation against a network, child derivation along
//! unhardened paths, fingerprints, and conversion between the SLIP-132 version prefix
//! families (xpub/ypub/zpub and tpub/upub/vpub).

use miniscript::bitcoin::{
    base58,
    bip32::{self, ChildNumber, DerivationPath, Fingerprint, Xpub},
    hashes::{hash160, Hash},
    secp256k1, Network, NetworkKind, PublicKey,
};

use std::{convert::TryFrom, error, fmt, str::FromStr};

/// Number of base58 characters in the shortest valid extended public key serialization.
pub const XPUB_MIN_LEN: usize = 111;

// The extended public key version prefixes we know of, with whether they encode a
// mainnet key. The SLIP-132 variants (ypub/zpub, upub/vpub) carry the same key material
// as the standard prefix of their network family.
const XPUB_VERSIONS: [(&str, [u8; 4], bool); 6] = [
    ("xpub", [0x04, 0x88, 0xb2, 0x1e], true),
    ("ypub", [0x04, 0x9d, 0x7c, 0xb2], true),
    ("zpub", [0x04, 0xb2, 0x47, 0x46], true),
    ("tpub", [0x04, 0x35, 0x87, 0xcf], false),
    ("upub", [0x04, 0x4a, 0x52, 0x62], false),
    ("vpub", [0x04, 0x5f, 0x1c, 0xf6], false),
];

#[derive(Debug)]
pub enum KeyError {
    /// The extended public key is blank or whitespace.
    Blank,
    TooShort(usize),
    UnknownPrefix(String),
    /// The prefix is a known one, but for the wrong network family.
    WrongNetworkPrefix { prefix: String, network: Network },
    /// The key decodes fine but was encoded for another network.
    NetworkMismatch { expected: Network },
    Base58(base58::Error),
    Bip32(bip32::Error),
    InvalidPath(String),
    /// Deriving a public key through a hardened step is impossible without the
    /// private key. Distinct from a generic derivation failure on purpose.
    HardenedSegment(String),
    CrossNetworkConversion { from: String, to: String },
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Blank => write!(f, "Extended public key cannot be blank."),
            Self::TooShort(len) => write!(
                f,
                "Extended public key is too short: {} characters, need at least {}.",
                len, XPUB_MIN_LEN
            ),
            Self::UnknownPrefix(prefix) => {
                write!(f, "Unknown extended public key prefix '{}'.", prefix)
            }
            Self::WrongNetworkPrefix { prefix, network } => write!(
                f,
                "Extended public key prefix '{}' is not valid for network '{}'.",
                prefix, network
            ),
            Self::NetworkMismatch { expected } => write!(
                f,
                "Extended public key is not encoded for network '{}'.",
                expected
            ),
            Self::Base58(e) => write!(f, "Base58 error: '{}'.", e),
            Self::Bip32(e) => write!(f, "BIP32 error: '{}'.", e),
            Self::InvalidPath(path) => write!(f, "Invalid BIP32 derivation path '{}'.", path),
            Self::HardenedSegment(path) => write!(
                f,
                "Path '{}' contains a hardened segment. Public keys cannot be derived through hardened steps.",
                path
            ),
            Self::CrossNetworkConversion { from, to } => write!(
                f,
                "Cannot convert a '{}' into a '{}': the prefixes encode keys for different networks.",
                from, to
            ),
        }
    }
}

impl error::Error for KeyError {}

fn version_for_prefix(prefix: &str) -> Option<(&'static str, [u8; 4], bool)> {
    XPUB_VERSIONS.iter().find(|(p, _, _)| *p == prefix).copied()
}

/// Validate an extended public key string against a network. SLIP-132 prefixes are
/// accepted and normalized to the standard prefix of their network family before
/// decoding, so the checksum and structure checks always run.
pub fn validate_xpub(xpub: &str, network: Network) -> Result<Xpub, KeyError> {
    let xpub = xpub.trim();
    if xpub.is_empty() {
        return Err(KeyError::Blank);
    }
    if xpub.len() < XPUB_MIN_LEN {
        return Err(KeyError::TooShort(xpub.len()));
    }
    let prefix = xpub
        .get(..4)
        .ok_or_else(|| KeyError::UnknownPrefix(xpub.chars().take(4).collect()))?;
    let (_, _, is_mainnet) =
        version_for_prefix(prefix).ok_or_else(|| KeyError::UnknownPrefix(prefix.to_string()))?;
    if is_mainnet != (NetworkKind::from(network) == NetworkKind::Main) {
        return Err(KeyError::WrongNetworkPrefix {
            prefix: prefix.to_string(),
            network,
        });
    }

    let standard = if is_mainnet { "xpub" } else { "tpub" };
    let normalized = if prefix == standard {
        xpub.to_string()
    } else {
        convert_xpub_prefix(xpub, standard)?
    };
    Xpub::from_str(&normalized).map_err(KeyError::Bip32)
}

/// Re-encode an extended public key under another version prefix of the same network
/// family. Converting across network families (eg xpub to tpub) is refused: the two
/// encodings do not carry the same chain parameters.
pub fn convert_xpub_prefix(xpub: &str, target_prefix: &str) -> Result<String, KeyError> {
    let (target, target_version, target_mainnet) = version_for_prefix(target_prefix)
        .ok_or_else(|| KeyError::UnknownPrefix(target_prefix.to_string()))?;
    let mut data = base58::decode_check(xpub.trim()).map_err(KeyError::Base58)?;
    if data.len() != 78 {
        return Err(KeyError::Bip32(bip32::Error::WrongExtendedKeyLength(
            data.len(),
        )));
    }
    let (current, _, current_mainnet) = XPUB_VERSIONS
        .iter()
        .find(|(_, version, _)| data[..4] == version[..])
        .copied()
        .ok_or_else(|| KeyError::UnknownPrefix(hex::encode(&data[..4])))?;
    if current_mainnet != target_mainnet {
        return Err(KeyError::CrossNetworkConversion {
            from: current.to_string(),
            to: target.to_string(),
        });
    }
    data[..4].copy_from_slice(&target_version);
    Ok(base58::encode_check(&data))
}

/// Parse a BIP32 derivation path, in absolute ("m/48'/0'/0'") or relative ("0/0")
/// form. A path starting with a bare '/' is always refused.
pub fn parse_derivation_path(path: &str) -> Result<DerivationPath, KeyError> {
    if path.is_empty() || path.starts_with('/') || path.ends_with('/') {
        return Err(KeyError::InvalidPath(path.to_string()));
    }
    let relative = if path == "m" {
        ""
    } else if let Some(rest) = path.strip_prefix("m/") {
        rest
    } else {
        path
    };
    if relative.is_empty() {
        return Ok(DerivationPath::master());
    }
    relative
        .split('/')
        .map(|segment| {
            ChildNumber::from_str(segment).map_err(|_| KeyError::InvalidPath(path.to_string()))
        })
        .collect::<Result<Vec<ChildNumber>, KeyError>>()
        .map(DerivationPath::from)
}

/// Like [parse_derivation_path], but additionally refuse hardened segments.
pub fn parse_unhardened_path(path: &str) -> Result<DerivationPath, KeyError> {
    let parsed = parse_derivation_path(path)?;
    if parsed.into_iter().any(|child| child.is_hardened()) {
        return Err(KeyError::HardenedSegment(path.to_string()));
    }
    Ok(parsed)
}

/// Derive a child extended public key along an unhardened path.
pub fn derive_child_xpub(
    xpub: &Xpub,
    path: &str,
    network: Network,
    secp: &secp256k1::Secp256k1<impl secp256k1::Verification>,
) -> Result<Xpub, KeyError> {
    if xpub.network != NetworkKind::from(network) {
        return Err(KeyError::NetworkMismatch { expected: network });
    }
    let path = parse_unhardened_path(path)?;
    xpub.derive_pub(secp, &path).map_err(KeyError::Bip32)
}

/// Derive a child public key along an unhardened path.
pub fn derive_child_pubkey(
    xpub: &Xpub,
    path: &str,
    network: Network,
    secp: &secp256k1::Secp256k1<impl secp256k1::Verification>,
) -> Result<PublicKey, KeyError> {
    derive_child_xpub(xpub, path, network, secp).map(|child| PublicKey::new(child.public_key))
}

/// The BIP32 fingerprint of a public key: the first 4 bytes of its hash160.
pub fn pubkey_fingerprint(key: &PublicKey) -> Fingerprint {
    let digest = hash160::Hash::hash(&key.to_bytes());
    Fingerprint::try_from(&digest.as_byte_array()[..4]).expect("first 4 bytes of a hash160")
}

/// Format a fingerprint as a fixed-length, zero-padded 8-character hex string. Leading
/// zero nibbles are significant to signing devices, never truncate them.
pub fn fingerprint_hex(fingerprint: &Fingerprint) -> String {
    let mut formatted = String::with_capacity(8);
    for byte in fingerprint.as_bytes() {
        formatted.push_str(&format!("{:02x}", byte));
    }
    formatted
}
