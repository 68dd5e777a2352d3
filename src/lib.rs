//! Braid: multisig derivation and transaction signing for Bitcoin wallets.
//!
//! A braid groups several BIP32 extended public keys with a quorum, an address type and
//! an unhardened derivation index. From a braid the same family of multisig addresses
//! can be derived by every participant, deterministically: derived public keys are
//! sorted lexicographically (BIP67) before the locking script is built, so the exact
//! script bytes never depend on the order the keys were supplied in.
//!
//! On top of braids this crate builds unsigned transactions (both as raw transactions
//! and as BIP174 PSBTs carrying the signing metadata), computes the per-input signature
//! hash appropriate to the address type, validates candidate signatures against the
//! input's public keys and assembles the final scriptSig/witness from out-of-order
//! partial signatures.

pub mod braid;
pub mod explorer;
pub mod fees;
pub mod keys;
pub mod multisig;
pub mod spend;
pub mod validation;

#[cfg(test)]
mod testutils;

pub use miniscript;

pub use crate::{
    braid::{Braid, BraidDetails, BraidError, BraidXpub, KeyDerivation},
    keys::KeyError,
    multisig::{AddressType, Multisig, MultisigError},
    spend::{SpendError, SpendInput, SpendOutput},
    validation::ValidationError,
};
