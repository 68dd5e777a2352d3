//! Construction of m-of-n multisig locking scripts for the three standard script
//! topologies: P2SH, P2SH-wrapped P2WSH and native P2WSH.
//!
//! Keys are embedded in the exact order the caller supplies them. Deterministic
//! (BIP67) ordering is the responsibility of the braid layer, which sorts derived
//! public keys before building a descriptor.

use crate::braid::BraidDetails;

use miniscript::bitcoin::{
    bip32::{ChildNumber, DerivationPath},
    opcodes::all as opcodes,
    script::{Builder, Instruction, PushBytesBuf},
    Address, Network, PublicKey, Script, ScriptBuf,
};

use serde::{Deserialize, Serialize};

use std::{convert::TryFrom, error, fmt, str::FromStr};

/// Maximum number of keys in a bare multisig script.
pub const MAX_PUBKEYS_PER_MULTISIG: usize = 20;

/// The three supported multisig address types. The string form matches the canonical
/// braid JSON encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressType {
    #[serde(rename = "P2SH")]
    P2sh,
    #[serde(rename = "P2SH-P2WSH")]
    P2shP2wsh,
    #[serde(rename = "P2WSH")]
    P2wsh,
}

impl AddressType {
    /// The conventional BIP32 root derivation path for this address type.
    pub fn bip32_root(&self, network: Network) -> DerivationPath {
        let coin = if network == Network::Bitcoin { 0 } else { 1 };
        let hardened =
            |index| ChildNumber::from_hardened_idx(index).expect("constant valid index");
        match self {
            Self::P2sh => vec![hardened(45), hardened(coin), hardened(0)],
            Self::P2shP2wsh => vec![hardened(48), hardened(coin), hardened(0), hardened(1)],
            Self::P2wsh => vec![hardened(48), hardened(coin), hardened(0), hardened(2)],
        }
        .into()
    }

    /// Whether inputs of this type are satisfied through the witness.
    pub fn is_segwit(&self) -> bool {
        !matches!(self, Self::P2sh)
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::P2sh => write!(f, "P2SH"),
            Self::P2shP2wsh => write!(f, "P2SH-P2WSH"),
            Self::P2wsh => write!(f, "P2WSH"),
        }
    }
}

impl FromStr for AddressType {
    type Err = MultisigError;

    fn from_str(s: &str) -> Result<AddressType, Self::Err> {
        match s {
            "P2SH" => Ok(Self::P2sh),
            "P2SH-P2WSH" => Ok(Self::P2shP2wsh),
            "P2WSH" => Ok(Self::P2wsh),
            _ => Err(MultisigError::UnknownAddressType(s.to_string())),
        }
    }
}

#[derive(Debug)]
pub enum MultisigError {
    UnknownAddressType(String),
    /// Required signers must be at least one and at most the number of keys.
    InvalidQuorum { required: usize, total: usize },
    TooManyKeys(usize),
    /// Segwit scripts cannot commit to uncompressed public keys.
    UncompressedKeyInSegwit(PublicKey),
    ScriptHex(hex::FromHexError),
    /// The script is not a bare m-of-n CHECKMULTISIG script.
    NotMultisig,
    InvalidKeyInScript,
}

impl fmt::Display for MultisigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UnknownAddressType(s) => write!(f, "Unknown address type '{}'.", s),
            Self::InvalidQuorum { required, total } => write!(
                f,
                "Invalid quorum: cannot require {} signers out of {} keys.",
                required, total
            ),
            Self::TooManyKeys(n) => write!(
                f,
                "Too many keys: {} is more than the {} a multisig script can hold.",
                n, MAX_PUBKEYS_PER_MULTISIG
            ),
            Self::UncompressedKeyInSegwit(key) => write!(
                f,
                "Key '{}' is uncompressed. Segwit scripts require compressed keys.",
                key
            ),
            Self::ScriptHex(e) => write!(f, "Invalid script hex: '{}'.", e),
            Self::NotMultisig => write!(f, "Script is not a bare multisig script."),
            Self::InvalidKeyInScript => write!(f, "Script contains an invalid public key."),
        }
    }
}

impl error::Error for MultisigError {}

/// The script nesting of a multisig descriptor. The variant is the single source of
/// truth for the address type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultisigScript {
    P2sh { redeem: ScriptBuf },
    P2shP2wsh { redeem: ScriptBuf, witness: ScriptBuf },
    P2wsh { witness: ScriptBuf },
}

/// One concrete multisig locking script instance: an address, its redeem and/or
/// witness script, and the public keys in the exact order they appear in the script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Multisig {
    network: Network,
    required: usize,
    pubkeys: Vec<PublicKey>,
    script: MultisigScript,
    braid_details: Option<BraidDetails>,
}

// The inner m-of-n script: OP_m <key...> OP_n OP_CHECKMULTISIG.
fn bare_multisig_script(required: usize, pubkeys: &[PublicKey]) -> ScriptBuf {
    let mut builder = Builder::new().push_int(required as i64);
    for key in pubkeys {
        builder = builder.push_key(key);
    }
    builder
        .push_int(pubkeys.len() as i64)
        .push_opcode(opcodes::OP_CHECKMULTISIG)
        .into_script()
}

// Decode a small integer as pushed by a multisig script: either an OP_PUSHNUM or, for
// n in 17..=20, a single-byte push.
fn small_int(instruction: &Instruction) -> Option<usize> {
    match instruction {
        Instruction::Op(op) => {
            let value = op.to_u8();
            if (0x51..=0x60).contains(&value) {
                Some((value - 0x50) as usize)
            } else {
                None
            }
        }
        Instruction::PushBytes(bytes) if bytes.len() == 1 => Some(bytes.as_bytes()[0] as usize),
        _ => None,
    }
}

// Extract (required, keys in script order) from a bare multisig script.
fn parse_bare_multisig(script: &Script) -> Result<(usize, Vec<PublicKey>), MultisigError> {
    let instructions: Vec<Instruction> = script
        .instructions()
        .collect::<Result<_, _>>()
        .map_err(|_| MultisigError::NotMultisig)?;
    if instructions.len() < 4 {
        return Err(MultisigError::NotMultisig);
    }
    match instructions.last() {
        Some(Instruction::Op(op)) if *op == opcodes::OP_CHECKMULTISIG => {}
        _ => return Err(MultisigError::NotMultisig),
    }
    let required = small_int(&instructions[0]).ok_or(MultisigError::NotMultisig)?;
    let total =
        small_int(&instructions[instructions.len() - 2]).ok_or(MultisigError::NotMultisig)?;
    let pubkeys = instructions[1..instructions.len() - 2]
        .iter()
        .map(|instruction| match instruction {
            Instruction::PushBytes(bytes) if bytes.len() == 33 || bytes.len() == 65 => {
                PublicKey::from_slice(bytes.as_bytes())
                    .map_err(|_| MultisigError::InvalidKeyInScript)
            }
            _ => Err(MultisigError::NotMultisig),
        })
        .collect::<Result<Vec<PublicKey>, MultisigError>>()?;
    if pubkeys.len() != total || required == 0 || required > total {
        return Err(MultisigError::NotMultisig);
    }
    Ok((required, pubkeys))
}

impl Multisig {
    /// Build a multisig descriptor from public keys, in the order given. The caller is
    /// responsible for any deterministic ordering of the keys.
    pub fn from_public_keys(
        network: Network,
        address_type: AddressType,
        required: usize,
        pubkeys: &[PublicKey],
    ) -> Result<Multisig, MultisigError> {
        if required == 0 || required > pubkeys.len() {
            return Err(MultisigError::InvalidQuorum {
                required,
                total: pubkeys.len(),
            });
        }
        if pubkeys.len() > MAX_PUBKEYS_PER_MULTISIG {
            return Err(MultisigError::TooManyKeys(pubkeys.len()));
        }
        if address_type.is_segwit() {
            if let Some(key) = pubkeys.iter().find(|key| !key.compressed) {
                return Err(MultisigError::UncompressedKeyInSegwit(*key));
            }
        }

        let bare = bare_multisig_script(required, pubkeys);
        let script = match address_type {
            AddressType::P2sh => MultisigScript::P2sh { redeem: bare },
            AddressType::P2shP2wsh => MultisigScript::P2shP2wsh {
                redeem: bare.to_p2wsh(),
                witness: bare,
            },
            AddressType::P2wsh => MultisigScript::P2wsh { witness: bare },
        };
        Ok(Multisig {
            network,
            required,
            pubkeys: pubkeys.to_vec(),
            script,
            braid_details: None,
        })
    }

    /// Rebuild a multisig descriptor from the bare multisig script alone, interpreted
    /// as redeem or witness script according to the address type. Used when
    /// reconstructing a descriptor from on-chain or PSBT data.
    pub fn from_bare_script(
        network: Network,
        address_type: AddressType,
        bare: ScriptBuf,
    ) -> Result<Multisig, MultisigError> {
        let (required, pubkeys) = parse_bare_multisig(&bare)?;
        if address_type.is_segwit() {
            if let Some(key) = pubkeys.iter().find(|key| !key.compressed) {
                return Err(MultisigError::UncompressedKeyInSegwit(*key));
            }
        }
        let script = match address_type {
            AddressType::P2sh => MultisigScript::P2sh { redeem: bare },
            AddressType::P2shP2wsh => MultisigScript::P2shP2wsh {
                redeem: bare.to_p2wsh(),
                witness: bare,
            },
            AddressType::P2wsh => MultisigScript::P2wsh { witness: bare },
        };
        Ok(Multisig {
            network,
            required,
            pubkeys,
            script,
            braid_details: None,
        })
    }

    /// Like [Multisig::from_bare_script], from a hex-encoded script.
    pub fn from_script_hex(
        network: Network,
        address_type: AddressType,
        script_hex: &str,
    ) -> Result<Multisig, MultisigError> {
        let bytes = hex::decode(script_hex).map_err(MultisigError::ScriptHex)?;
        Self::from_bare_script(network, address_type, ScriptBuf::from_bytes(bytes))
    }

    pub(crate) fn with_braid_details(mut self, details: BraidDetails) -> Multisig {
        self.braid_details = Some(details);
        self
    }

    /// The address type, derived from the script nesting shape.
    pub fn address_type(&self) -> AddressType {
        match self.script {
            MultisigScript::P2sh { .. } => AddressType::P2sh,
            MultisigScript::P2shP2wsh { .. } => AddressType::P2shP2wsh,
            MultisigScript::P2wsh { .. } => AddressType::P2wsh,
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn required_signers(&self) -> usize {
        self.required
    }

    pub fn total_signers(&self) -> usize {
        self.pubkeys.len()
    }

    /// The public keys, in the exact order they appear in the script.
    pub fn public_keys(&self) -> &[PublicKey] {
        &self.pubkeys
    }

    /// The bare m-of-n multisig script, wherever it lives in the nesting.
    pub fn bare_script(&self) -> &Script {
        match &self.script {
            MultisigScript::P2sh { redeem } => redeem,
            MultisigScript::P2shP2wsh { witness, .. } => witness,
            MultisigScript::P2wsh { witness } => witness,
        }
    }

    /// The redeem script, if this descriptor has one (None for native P2WSH).
    pub fn redeem_script(&self) -> Option<&Script> {
        match &self.script {
            MultisigScript::P2sh { redeem } => Some(redeem),
            MultisigScript::P2shP2wsh { redeem, .. } => Some(redeem),
            MultisigScript::P2wsh { .. } => None,
        }
    }

    /// The witness script, if this descriptor has one (None for pure P2SH).
    pub fn witness_script(&self) -> Option<&Script> {
        match &self.script {
            MultisigScript::P2sh { .. } => None,
            MultisigScript::P2shP2wsh { witness, .. } => Some(witness),
            MultisigScript::P2wsh { witness } => Some(witness),
        }
    }

    /// The output script locking coins to this descriptor.
    pub fn script_pubkey(&self) -> ScriptBuf {
        match &self.script {
            MultisigScript::P2sh { redeem } => redeem.to_p2sh(),
            MultisigScript::P2shP2wsh { redeem, .. } => redeem.to_p2sh(),
            MultisigScript::P2wsh { witness } => witness.to_p2wsh(),
        }
    }

    /// The address of this descriptor on its network.
    pub fn address(&self) -> Address {
        Address::from_script(&self.script_pubkey(), self.network)
            .expect("p2sh and p2wsh output scripts always encode to an address")
    }

    /// Braid derivation metadata, when this descriptor was derived from a braid.
    pub fn braid_details(&self) -> Option<&BraidDetails> {
        self.braid_details.as_ref()
    }

    // The scriptSig content for a P2SH-P2WSH input: a single push of the redeem script.
    pub(crate) fn segwit_script_sig(&self) -> Option<ScriptBuf> {
        match &self.script {
            MultisigScript::P2shP2wsh { redeem, .. } => {
                let push = PushBytesBuf::try_from(redeem.to_bytes())
                    .expect("a p2wsh output script fits a push");
                Some(Builder::new().push_slice(push).into_script())
            }
            _ => None,
        }
    }
}

impl fmt::Display for Multisig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}-of-{} {} multisig at {}",
            self.required,
            self.pubkeys.len(),
            self.address_type(),
            self.address()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::derived_pubkeys;
    use miniscript::{Legacy, Miniscript, Segwitv0};

    #[test]
    fn address_types() {
        assert_eq!(AddressType::from_str("P2SH").unwrap(), AddressType::P2sh);
        assert_eq!(
            AddressType::from_str("P2SH-P2WSH").unwrap(),
            AddressType::P2shP2wsh
        );
        assert_eq!(AddressType::from_str("P2WSH").unwrap(), AddressType::P2wsh);
        assert!(AddressType::from_str("P2PKH").is_err());
        assert_eq!(AddressType::P2shP2wsh.to_string(), "P2SH-P2WSH");

        assert_eq!(
            crate::braid::path_to_string(&AddressType::P2sh.bip32_root(Network::Bitcoin)),
            "m/45'/0'/0'"
        );
        assert_eq!(
            crate::braid::path_to_string(&AddressType::P2wsh.bip32_root(Network::Testnet)),
            "m/48'/1'/0'/2'"
        );
    }

    #[test]
    fn build_from_public_keys() {
        let pubkeys = derived_pubkeys(3, Network::Testnet, "0/0");
        for &address_type in &[
            AddressType::P2sh,
            AddressType::P2shP2wsh,
            AddressType::P2wsh,
        ] {
            let multisig =
                Multisig::from_public_keys(Network::Testnet, address_type, 2, &pubkeys).unwrap();
            assert_eq!(multisig.address_type(), address_type);
            assert_eq!(multisig.required_signers(), 2);
            assert_eq!(multisig.total_signers(), 3);
            assert_eq!(multisig.public_keys(), &pubkeys[..]);
            // The locking script and the address must always agree.
            assert_eq!(
                multisig.address().script_pubkey(),
                multisig.script_pubkey()
            );
            match address_type {
                AddressType::P2sh => {
                    assert!(multisig.redeem_script().is_some());
                    assert!(multisig.witness_script().is_none());
                    assert_eq!(multisig.redeem_script().unwrap(), multisig.bare_script());
                }
                AddressType::P2shP2wsh => {
                    assert!(multisig.redeem_script().is_some());
                    assert!(multisig.witness_script().is_some());
                    assert_eq!(
                        multisig.redeem_script().unwrap().to_bytes(),
                        multisig.witness_script().unwrap().to_p2wsh().to_bytes()
                    );
                }
                AddressType::P2wsh => {
                    assert!(multisig.redeem_script().is_none());
                    assert!(multisig.witness_script().is_some());
                }
            }
        }
    }

    #[test]
    fn bare_script_is_valid_miniscript() {
        let pubkeys = derived_pubkeys(3, Network::Bitcoin, "0/1");
        let multisig =
            Multisig::from_public_keys(Network::Bitcoin, AddressType::P2wsh, 2, &pubkeys).unwrap();
        // Sanity check our hand-built script against rust-miniscript's decoder.
        let ms = Miniscript::<PublicKey, Segwitv0>::parse(multisig.bare_script()).unwrap();
        assert_eq!(ms.encode().as_bytes(), multisig.bare_script().as_bytes());

        let legacy =
            Multisig::from_public_keys(Network::Bitcoin, AddressType::P2sh, 2, &pubkeys).unwrap();
        let ms = Miniscript::<PublicKey, Legacy>::parse(legacy.bare_script()).unwrap();
        assert_eq!(ms.encode().as_bytes(), legacy.bare_script().as_bytes());
    }

    #[test]
    fn rebuild_from_script_hex() {
        let pubkeys = derived_pubkeys(3, Network::Testnet, "0/0");
        let built =
            Multisig::from_public_keys(Network::Testnet, AddressType::P2shP2wsh, 2, &pubkeys)
                .unwrap();
        let bare_hex = hex::encode(built.bare_script().as_bytes());

        let rebuilt =
            Multisig::from_script_hex(Network::Testnet, AddressType::P2shP2wsh, &bare_hex)
                .unwrap();
        assert_eq!(rebuilt.address(), built.address());
        assert_eq!(rebuilt.public_keys(), built.public_keys());
        assert_eq!(rebuilt.required_signers(), built.required_signers());

        // The same bare script under another address type yields another address.
        let as_p2sh = Multisig::from_script_hex(Network::Testnet, AddressType::P2sh, &bare_hex)
            .unwrap();
        assert_ne!(as_p2sh.address(), built.address());

        assert!(matches!(
            Multisig::from_script_hex(Network::Testnet, AddressType::P2sh, "zz"),
            Err(MultisigError::ScriptHex(..))
        ));
        // A P2PKH script is not a multisig script.
        assert!(matches!(
            Multisig::from_script_hex(
                Network::Testnet,
                AddressType::P2sh,
                "76a914000000000000000000000000000000000000000088ac"
            ),
            Err(MultisigError::NotMultisig)
        ));
    }

    #[test]
    fn quorum_checks() {
        let pubkeys = derived_pubkeys(3, Network::Testnet, "0/0");
        assert!(matches!(
            Multisig::from_public_keys(Network::Testnet, AddressType::P2sh, 4, &pubkeys),
            Err(MultisigError::InvalidQuorum {
                required: 4,
                total: 3
            })
        ));
        assert!(matches!(
            Multisig::from_public_keys(Network::Testnet, AddressType::P2sh, 0, &pubkeys),
            Err(MultisigError::InvalidQuorum { .. })
        ));
        let many = derived_pubkeys(21, Network::Testnet, "0/0");
        assert!(matches!(
            Multisig::from_public_keys(Network::Testnet, AddressType::P2sh, 2, &many),
            Err(MultisigError::TooManyKeys(21))
        ));
    }

    #[test]
    fn uncompressed_keys() {
        let mut pubkeys = derived_pubkeys(3, Network::Bitcoin, "0/0");
        pubkeys[1].compressed = false;
        // Uncompressed keys are tolerated in legacy P2SH but not under segwit.
        assert!(
            Multisig::from_public_keys(Network::Bitcoin, AddressType::P2sh, 2, &pubkeys).is_ok()
        );
        assert!(matches!(
            Multisig::from_public_keys(Network::Bitcoin, AddressType::P2wsh, 2, &pubkeys),
            Err(MultisigError::UncompressedKeyInSegwit(..))
        ));
        assert!(matches!(
            Multisig::from_public_keys(Network::Bitcoin, AddressType::P2shP2wsh, 2, &pubkeys),
            Err(MultisigError::UncompressedKeyInSegwit(..))
        ));
    }
}
