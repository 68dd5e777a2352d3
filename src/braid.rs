//! Braids: a group of extended public keys, a quorum, an address type and a chain
//! index, from which every participant derives the same family of multisig addresses.
//!
//! A braid has a canonical JSON encoding so it can be stored, displayed as a QR code or
//! exchanged between coordinators. Derived public keys are sorted lexicographically
//! (BIP67) before the locking script is built, so the script bytes never depend on the
//! order the members were listed in.

use crate::{
    keys::{self, KeyError},
    multisig::{AddressType, Multisig, MultisigError},
};

use miniscript::bitcoin::{
    bip32::{ChildNumber, DerivationPath, Fingerprint, Xpub},
    secp256k1, Network, NetworkKind, PublicKey,
};

use serde::{Deserialize, Serialize};

use std::{
    collections::BTreeMap,
    convert::TryFrom,
    error, fmt,
    str::FromStr,
};

#[derive(Debug)]
pub enum BraidError {
    UnsupportedNetwork(String),
    Key(KeyError),
    Multisig(MultisigError),
    NoMembers,
    ZeroRequiredSigners,
    RequiredSigners { required: usize, total: usize },
    InvalidIndex(String),
    InvalidFingerprint(String),
    /// The path does not start with this braid's chain index.
    OutsideIndex { index: ChildNumber, path: String },
    Json(serde_json::Error),
}

impl fmt::Display for BraidError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UnsupportedNetwork(name) => write!(f, "Unsupported network '{}'.", name),
            Self::Key(e) => write!(f, "Invalid extended public key: {}", e),
            Self::Multisig(e) => write!(f, "Invalid multisig parameters: {}", e),
            Self::NoMembers => write!(f, "A braid requires at least one extended public key."),
            Self::ZeroRequiredSigners => {
                write!(f, "A braid requires at least one required signer.")
            }
            Self::RequiredSigners { required, total } => write!(
                f,
                "Required signers ({}) cannot exceed the number of keys ({}).",
                required, total
            ),
            Self::InvalidIndex(index) => {
                write!(f, "Invalid braid index '{}': must be an unhardened number.", index)
            }
            Self::InvalidFingerprint(fingerprint) => {
                write!(f, "Invalid root fingerprint '{}'.", fingerprint)
            }
            Self::OutsideIndex { index, path } => write!(
                f,
                "Path '{}' is outside this braid: it must start with the braid index {}.",
                path, index
            ),
            Self::Json(e) => write!(f, "Invalid braid encoding: {}", e),
        }
    }
}

impl error::Error for BraidError {}

impl From<KeyError> for BraidError {
    fn from(e: KeyError) -> Self {
        Self::Key(e)
    }
}

impl From<MultisigError> for BraidError {
    fn from(e: MultisigError) -> Self {
        Self::Multisig(e)
    }
}

// The network names used by the canonical JSON encoding.
fn network_name(network: Network) -> &'static str {
    match network {
        Network::Bitcoin => "mainnet",
        Network::Testnet => "testnet",
        Network::Signet => "signet",
        Network::Regtest => "regtest",
        // Braid::new refuses any other network.
        _ => unreachable!("braids are only built for supported networks"),
    }
}

fn network_from_name(name: &str) -> Result<Network, BraidError> {
    match name {
        "mainnet" => Ok(Network::Bitcoin),
        "testnet" => Ok(Network::Testnet),
        "signet" => Ok(Network::Signet),
        "regtest" => Ok(Network::Regtest),
        _ => Err(BraidError::UnsupportedNetwork(name.to_string())),
    }
}

// Absolute display form of a derivation path, the "m/" form signing devices and the
// JSON encoding expect.
pub(crate) fn path_to_string(path: &DerivationPath) -> String {
    let mut formatted = String::from("m");
    for child in path {
        formatted.push('/');
        formatted.push_str(&child.to_string());
    }
    formatted
}

/// One member of a braid: a validated extended public key, optionally with its key
/// origin (the master fingerprint and the hardened path the xpub was derived at).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BraidXpub {
    xpub: Xpub,
    root_fingerprint: Option<Fingerprint>,
    path: Option<DerivationPath>,
}

impl BraidXpub {
    /// Validate a base58 extended public key against a network. SLIP-132 prefixes are
    /// accepted, see [keys::validate_xpub].
    pub fn new(base58: &str, network: Network) -> Result<BraidXpub, KeyError> {
        Ok(BraidXpub {
            xpub: keys::validate_xpub(base58, network)?,
            root_fingerprint: None,
            path: None,
        })
    }

    pub fn from_xpub(xpub: Xpub) -> BraidXpub {
        BraidXpub {
            xpub,
            root_fingerprint: None,
            path: None,
        }
    }

    pub fn with_root_fingerprint(mut self, fingerprint: Fingerprint) -> BraidXpub {
        self.root_fingerprint = Some(fingerprint);
        self
    }

    pub fn with_base_path(mut self, path: DerivationPath) -> BraidXpub {
        self.path = Some(path);
        self
    }

    pub fn xpub(&self) -> &Xpub {
        &self.xpub
    }

    /// The fingerprint of the master key this xpub was derived from, if known.
    pub fn root_fingerprint(&self) -> Option<Fingerprint> {
        self.root_fingerprint
    }

    /// The path this xpub was derived at from the master key, if known.
    pub fn base_path(&self) -> Option<&DerivationPath> {
        self.path.as_ref()
    }
}

/// How one public key inside a multisig script was derived: the master key fingerprint
/// and the full path from the master key. This is the metadata signing devices need to
/// locate their key, it goes into the PSBT BIP32 derivation fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDerivation {
    pub master_fingerprint: Fingerprint,
    pub path: DerivationPath,
    pub pubkey: PublicKey,
}

impl KeyDerivation {
    /// The path in absolute display form, eg "m/48'/1'/0'/2'/0/3".
    pub fn path_string(&self) -> String {
        path_to_string(&self.path)
    }
}

/// Derivation metadata attached to a [Multisig] that was derived from a braid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BraidDetails {
    braid: Braid,
    derivations: Vec<KeyDerivation>,
}

impl BraidDetails {
    pub fn braid(&self) -> &Braid {
        &self.braid
    }

    /// One entry per braid member, in member order (not script order).
    pub fn derivations(&self) -> &[KeyDerivation] {
        &self.derivations
    }

    /// The derivation for a given public key in the script, if any.
    pub fn derivation_for(&self, pubkey: &PublicKey) -> Option<&KeyDerivation> {
        self.derivations.iter().find(|d| &d.pubkey == pubkey)
    }
}

/// A braid. See the crate documentation for the derivation scheme.
///
/// Serialization uses the canonical JSON encoding, so a braid deserialized through
/// serde always went through full validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BraidConfig", into = "BraidConfig")]
pub struct Braid {
    network: Network,
    address_type: AddressType,
    members: Vec<BraidXpub>,
    required_signers: usize,
    index: ChildNumber,
}

impl Braid {
    pub fn new(
        network: Network,
        address_type: AddressType,
        members: Vec<BraidXpub>,
        required_signers: usize,
        index: u32,
    ) -> Result<Braid, BraidError> {
        // Reject early so the JSON encoding can always name the network.
        match network {
            Network::Bitcoin | Network::Testnet | Network::Signet | Network::Regtest => {}
            other => return Err(BraidError::UnsupportedNetwork(other.to_string())),
        }
        if members.is_empty() {
            return Err(BraidError::NoMembers);
        }
        if required_signers == 0 {
            return Err(BraidError::ZeroRequiredSigners);
        }
        if required_signers > members.len() {
            return Err(BraidError::RequiredSigners {
                required: required_signers,
                total: members.len(),
            });
        }
        for member in &members {
            if member.xpub.network != NetworkKind::from(network) {
                return Err(BraidError::Key(KeyError::NetworkMismatch {
                    expected: network,
                }));
            }
        }
        let index = ChildNumber::from_normal_idx(index)
            .map_err(|_| BraidError::InvalidIndex(index.to_string()))?;
        Ok(Braid {
            network,
            address_type,
            members,
            required_signers,
            index,
        })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn address_type(&self) -> AddressType {
        self.address_type
    }

    pub fn members(&self) -> &[BraidXpub] {
        &self.members
    }

    pub fn required_signers(&self) -> usize {
        self.required_signers
    }

    pub fn total_signers(&self) -> usize {
        self.members.len()
    }

    /// The chain index every path derived from this braid starts with.
    pub fn index(&self) -> ChildNumber {
        self.index
    }

    /// Parse and check a derivation path against this braid: it must be unhardened,
    /// non-empty and start with the braid index.
    pub fn validate_path(&self, path: &str) -> Result<DerivationPath, BraidError> {
        let parsed = keys::parse_unhardened_path(path)?;
        match parsed.into_iter().next() {
            Some(first) if *first == self.index => Ok(parsed),
            _ => Err(BraidError::OutsideIndex {
                index: self.index,
                path: path.to_string(),
            }),
        }
    }

    fn member_derivation(
        &self,
        member: &BraidXpub,
        relative: &DerivationPath,
        secp: &secp256k1::Secp256k1<impl secp256k1::Verification>,
    ) -> Result<KeyDerivation, BraidError> {
        let child = member
            .xpub
            .derive_pub(secp, relative)
            .map_err(|e| BraidError::Key(KeyError::Bip32(e)))?;
        let master_fingerprint = member.root_fingerprint.unwrap_or_else(|| {
            log::warn!(
                "No root fingerprint for xpub with fingerprint {}, using a zeroed placeholder.",
                member.xpub.fingerprint()
            );
            Fingerprint::default()
        });
        // Without a known base path the xpub is treated as the root, so the full path
        // is just the relative part.
        let path = match &member.path {
            Some(base) => base.extend(relative),
            None => relative.clone(),
        };
        Ok(KeyDerivation {
            master_fingerprint,
            path,
            pubkey: PublicKey::new(child.public_key),
        })
    }

    /// The derivation of each member's public key at the given path, in member order.
    pub fn bip32_derivations_at_path(
        &self,
        path: &str,
        secp: &secp256k1::Secp256k1<impl secp256k1::Verification>,
    ) -> Result<Vec<KeyDerivation>, BraidError> {
        let relative = self.validate_path(path)?;
        self.members
            .iter()
            .map(|member| self.member_derivation(member, &relative, secp))
            .collect()
    }

    /// The derived public keys at the given path, keyed by their hex encoding.
    pub fn derive_public_keys_at_path(
        &self,
        path: &str,
        secp: &secp256k1::Secp256k1<impl secp256k1::Verification>,
    ) -> Result<BTreeMap<String, KeyDerivation>, BraidError> {
        Ok(self
            .bip32_derivations_at_path(path, secp)?
            .into_iter()
            .map(|derivation| (derivation.pubkey.to_string(), derivation))
            .collect())
    }

    /// Derive the multisig at the given path. Public keys are sorted lexicographically
    /// (BIP67) before the script is built.
    pub fn derive_multisig_at_path(
        &self,
        path: &str,
        secp: &secp256k1::Secp256k1<impl secp256k1::Verification>,
    ) -> Result<Multisig, BraidError> {
        let derivations = self.bip32_derivations_at_path(path, secp)?;
        let mut pubkeys: Vec<PublicKey> = derivations.iter().map(|d| d.pubkey).collect();
        pubkeys.sort_by_key(|key| key.to_bytes());
        let multisig = Multisig::from_public_keys(
            self.network,
            self.address_type,
            self.required_signers,
            &pubkeys,
        )?;
        Ok(multisig.with_braid_details(BraidDetails {
            braid: self.clone(),
            derivations,
        }))
    }

    fn index_path(&self, child_index: u32) -> String {
        format!("{}/{}", self.index, child_index)
    }

    /// Shorthand for [Braid::derive_public_keys_at_path] at "index/child_index".
    pub fn derive_public_keys_at_index(
        &self,
        child_index: u32,
        secp: &secp256k1::Secp256k1<impl secp256k1::Verification>,
    ) -> Result<BTreeMap<String, KeyDerivation>, BraidError> {
        self.derive_public_keys_at_path(&self.index_path(child_index), secp)
    }

    /// Shorthand for [Braid::bip32_derivations_at_path] at "index/child_index".
    pub fn bip32_derivations_at_index(
        &self,
        child_index: u32,
        secp: &secp256k1::Secp256k1<impl secp256k1::Verification>,
    ) -> Result<Vec<KeyDerivation>, BraidError> {
        self.bip32_derivations_at_path(&self.index_path(child_index), secp)
    }

    /// Shorthand for [Braid::derive_multisig_at_path] at "index/child_index".
    pub fn derive_multisig_at_index(
        &self,
        child_index: u32,
        secp: &secp256k1::Secp256k1<impl secp256k1::Verification>,
    ) -> Result<Multisig, BraidError> {
        self.derive_multisig_at_path(&self.index_path(child_index), secp)
    }

    pub fn from_json(json: &str) -> Result<Braid, BraidError> {
        serde_json::from_str(json).map_err(BraidError::Json)
    }

    /// The canonical JSON encoding.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("braid serialization cannot fail")
    }
}

impl fmt::Display for Braid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl FromStr for Braid {
    type Err = BraidError;

    fn from_str(s: &str) -> Result<Braid, Self::Err> {
        Braid::from_json(s)
    }
}

// The JSON shape of a braid member. A bare base58 string is accepted on input for
// members without key origin information, output always uses the record form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum XpubEntry {
    Record {
        #[serde(rename = "base58String")]
        base58: String,
        #[serde(
            rename = "rootFingerprint",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        root_fingerprint: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    Plain(String),
}

// The canonical JSON shape of a braid.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BraidConfig {
    network: String,
    #[serde(rename = "addressType")]
    address_type: AddressType,
    #[serde(rename = "extendedPublicKeys")]
    extended_public_keys: Vec<XpubEntry>,
    #[serde(rename = "requiredSigners")]
    required_signers: usize,
    index: String,
}

impl From<Braid> for BraidConfig {
    fn from(braid: Braid) -> BraidConfig {
        BraidConfig {
            network: network_name(braid.network).to_string(),
            address_type: braid.address_type,
            extended_public_keys: braid
                .members
                .iter()
                .map(|member| XpubEntry::Record {
                    base58: member.xpub.to_string(),
                    root_fingerprint: member
                        .root_fingerprint
                        .as_ref()
                        .map(keys::fingerprint_hex),
                    path: member.path.as_ref().map(path_to_string),
                })
                .collect(),
            required_signers: braid.required_signers,
            index: braid.index.to_string(),
        }
    }
}

impl TryFrom<BraidConfig> for Braid {
    type Error = BraidError;

    fn try_from(config: BraidConfig) -> Result<Braid, BraidError> {
        let network = network_from_name(&config.network)?;
        let BraidConfig {
            address_type,
            extended_public_keys,
            required_signers,
            index,
            ..
        } = config;
        let members = extended_public_keys
            .into_iter()
            .map(|entry| {
                let (base58, fingerprint, path) = match entry {
                    XpubEntry::Plain(base58) => (base58, None, None),
                    XpubEntry::Record {
                        base58,
                        root_fingerprint,
                        path,
                    } => (base58, root_fingerprint, path),
                };
                let mut member = BraidXpub::new(&base58, network)?;
                if let Some(fingerprint) = fingerprint {
                    member = member.with_root_fingerprint(
                        Fingerprint::from_str(&fingerprint)
                            .map_err(|_| BraidError::InvalidFingerprint(fingerprint))?,
                    );
                }
                if let Some(path) = path {
                    member = member.with_base_path(keys::parse_derivation_path(&path)?);
                }
                Ok(member)
            })
            .collect::<Result<Vec<BraidXpub>, BraidError>>()?;
        let index: u32 = index
            .parse()
            .map_err(|_| BraidError::InvalidIndex(index.clone()))?;
        Braid::new(network, address_type, members, required_signers, index)
    }
}
