//! Deterministic key material and transaction fixtures shared by the unit tests.

use crate::{
    braid::{Braid, BraidXpub},
    keys,
    multisig::{AddressType, Multisig},
};

use miniscript::bitcoin::{
    absolute,
    bip32::{ChainCode, ChildNumber, Fingerprint, Xpriv, Xpub},
    secp256k1::{self, Secp256k1},
    transaction, Amount, Network, OutPoint, PublicKey, ScriptBuf, Sequence, Transaction, TxIn,
    TxOut, Witness,
};

use std::convert::TryFrom;

// The master key of BIP32 test vector 1, under each version prefix of its family.
pub const TV1_XPUB: &str = "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8";
pub const TV1_YPUB: &str = "ypub6QqdH2c5z7967BioGSfAWFHM1EHzHPBZK7wrND3ZpEWFtzmCqvsD1bgpaE6pSAPkiSKhkuWPCJV6mZTSNMd2tK8xYTcJ48585pZecmSUzWp";
pub const TV1_ZPUB: &str = "zpub6jftahH18ngZxUuv6oSniLNrBCSSE1B4EEU59bwTCEt8x6aS6b2mdfLxbS4QS53g85SWWP6wexqeer516433gYpZQoJie2tcMYdJ1SYYYAL";
pub const TV1_TPUB: &str = "tpubD6NzVbkrYhZ4XgiXtGrdW5XDAPFCL9h7we1vwNCpn8tGbBcgfVYjXyhWo4E1xkh56hjod1RhGjxbaTLV3X4FyWuejifB9jusQ46QzG87VKp";

/// A deterministic account-level extended private key for a test braid member. The
/// seed byte fixes both the private key and the chain code, so every run of the tests
/// derives the same keys.
pub fn member_xpriv(seed: u8, network: Network) -> Xpriv {
    assert!(seed > 0, "a zero seed is not a valid secret key");
    Xpriv {
        network: network.into(),
        depth: 4,
        parent_fingerprint: Fingerprint::default(),
        child_number: ChildNumber::from_hardened_idx(2).expect("valid index"),
        private_key: secp256k1::SecretKey::from_slice(&[seed; 32])
            .expect("a small constant is below the curve order"),
        chain_code: ChainCode::try_from(&[seed; 32][..]).expect("32 bytes"),
    }
}

/// The extended public key of [member_xpriv].
pub fn member_xpub(seed: u8, network: Network) -> Xpub {
    Xpub::from_priv(&Secp256k1::new(), &member_xpriv(seed, network))
}

/// Public keys of members 1..=n derived at the same relative path.
pub fn derived_pubkeys(n: usize, network: Network, path: &str) -> Vec<PublicKey> {
    let secp = Secp256k1::new();
    (1..=n as u8)
        .map(|seed| {
            keys::derive_child_pubkey(&member_xpub(seed, network), path, network, &secp)
                .expect("test keys derive along unhardened paths")
        })
        .collect()
}

/// Braid members 1..=n, with or without key origin information.
pub fn test_members(
    network: Network,
    n: usize,
    address_type: AddressType,
    with_origins: bool,
) -> Vec<BraidXpub> {
    (1..=n as u8)
        .map(|seed| {
            let xpub = member_xpub(seed, network);
            let member = BraidXpub::from_xpub(xpub);
            if with_origins {
                member
                    .with_root_fingerprint(xpub.fingerprint())
                    .with_base_path(address_type.bip32_root(network))
            } else {
                member
            }
        })
        .collect()
}

/// An m-of-n braid over the deterministic members, with key origins.
pub fn test_braid(
    network: Network,
    address_type: AddressType,
    required_signers: usize,
    total_signers: usize,
    index: u32,
) -> Braid {
    Braid::new(
        network,
        address_type,
        test_members(network, total_signers, address_type, true),
        required_signers,
        index,
    )
    .expect("test braid parameters are valid")
}

/// A dummy transaction funding the multisig with `value` at output `vout`.
pub fn funding_tx(multisig: &Multisig, value: Amount, vout: u32) -> Transaction {
    let mut output: Vec<TxOut> = (0..vout)
        .map(|_| TxOut {
            value: Amount::from_sat(1_000),
            script_pubkey: ScriptBuf::new(),
        })
        .collect();
    output.push(TxOut {
        value,
        script_pubkey: multisig.script_pubkey(),
    });
    Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output,
    }
}
