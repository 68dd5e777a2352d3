//! Building multisig spends: the unsigned transaction (raw or as a PSBT carrying the
//! signing metadata), the per-input signature hash, validation of candidate signatures
//! against an input's public keys, and assembly of the final scriptSig and witness from
//! partial signatures.
//!
//! Inputs are always ordered deterministically (BIP69) so that every participant signs
//! the exact same transaction regardless of the order they listed the coins in.

use crate::{
    braid::BraidError,
    multisig::{AddressType, Multisig},
    validation::{self, ValidationError},
};

use miniscript::bitcoin::{
    absolute,
    bip32::{DerivationPath, Fingerprint, Xpub},
    ecdsa,
    hashes::Hash,
    psbt::{self, Psbt},
    script::{Builder, PushBytesBuf},
    secp256k1::{self, Message},
    sighash::{EcdsaSighashType, SighashCache},
    transaction, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};

use std::{
    collections::{BTreeMap, HashSet},
    convert::TryFrom,
    error, fmt,
};

/// One coin being spent: where it is on chain, its value and the multisig locking it.
#[derive(Debug, Clone)]
pub struct SpendInput {
    pub outpoint: OutPoint,
    pub amount: Amount,
    pub multisig: Multisig,
    /// The full funding transaction. Required for P2SH inputs, where the PSBT must
    /// carry it for signing devices to check the input value.
    pub prev_tx: Option<Transaction>,
    /// Derivation path to record in the PSBT instead of the one the multisig was
    /// derived at. Only meaningful for braid-derived multisigs.
    pub path_override: Option<String>,
}

impl SpendInput {
    pub fn new(outpoint: OutPoint, amount: Amount, multisig: Multisig) -> SpendInput {
        SpendInput {
            outpoint,
            amount,
            multisig,
            prev_tx: None,
            path_override: None,
        }
    }

    pub fn with_prev_tx(mut self, prev_tx: Transaction) -> SpendInput {
        self.prev_tx = Some(prev_tx);
        self
    }
}

/// One payment being made: a destination address and a value. Outputs paying back into
/// a multisig we control (change) can carry the multisig so the PSBT records its
/// scripts and derivations.
#[derive(Debug, Clone)]
pub struct SpendOutput {
    pub address: String,
    pub amount: Amount,
    pub multisig: Option<Multisig>,
}

impl SpendOutput {
    pub fn new(address: String, amount: Amount) -> SpendOutput {
        SpendOutput {
            address,
            amount,
            multisig: None,
        }
    }

    pub fn change(multisig: Multisig, amount: Amount) -> SpendOutput {
        SpendOutput {
            address: multisig.address().to_string(),
            amount,
            multisig: Some(multisig),
        }
    }
}

#[derive(Debug)]
pub enum SpendError {
    NoInputs,
    NoOutputs,
    DuplicateInput(OutPoint),
    /// The input's multisig was built for another network than the transaction's.
    InputNetworkMismatch { index: usize },
    Validation(ValidationError),
    Braid(BraidError),
    /// P2SH inputs must carry their funding transaction.
    MissingPrevTx(usize),
    /// The provided funding transaction does not create the coin being spent.
    PrevTxMismatch(usize),
    Psbt(psbt::Error),
    InputIndexOutOfBounds(usize),
    InvalidSignatureEncoding,
    NoSignatures,
    SignatureListLength {
        list: usize,
        got: usize,
        needed: usize,
    },
    InsufficientSignatures {
        input: usize,
        got: usize,
        needed: usize,
    },
    InvalidSignature { input: usize },
    DuplicateSignature { input: usize },
    /// The input does not spend the same coin as the PSBT's unsigned transaction.
    PsbtInputMismatch { input: usize },
}

impl fmt::Display for SpendError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NoInputs => write!(f, "At least one input is required."),
            Self::NoOutputs => write!(f, "At least one output is required."),
            Self::DuplicateInput(outpoint) => write!(f, "Duplicate input '{}'.", outpoint),
            Self::InputNetworkMismatch { index } => {
                write!(f, "Input {} is locked by a multisig for another network.", index)
            }
            Self::Validation(e) => write!(f, "Invalid output: {}", e),
            Self::Braid(e) => write!(f, "Braid derivation failed: {}", e),
            Self::MissingPrevTx(index) => write!(
                f,
                "Input {} spends a P2SH coin but no funding transaction was provided.",
                index
            ),
            Self::PrevTxMismatch(index) => write!(
                f,
                "The funding transaction for input {} does not create the coin being spent.",
                index
            ),
            Self::Psbt(e) => write!(f, "PSBT error: '{}'.", e),
            Self::InputIndexOutOfBounds(index) => {
                write!(f, "Input index {} is out of bounds.", index)
            }
            Self::InvalidSignatureEncoding => write!(f, "Invalid DER signature encoding."),
            Self::NoSignatures => write!(f, "At least one signature set is required."),
            Self::SignatureListLength { list, got, needed } => write!(
                f,
                "Signature set {} has {} signatures for {} inputs.",
                list, got, needed
            ),
            Self::InsufficientSignatures {
                input,
                got,
                needed,
            } => write!(
                f,
                "Insufficient signatures for input {}: got {}, need {}.",
                input, got, needed
            ),
            Self::InvalidSignature { input } => {
                write!(f, "Invalid signature for input {}.", input)
            }
            Self::DuplicateSignature { input } => {
                write!(f, "Duplicate signature for input {}.", input)
            }
            Self::PsbtInputMismatch { input } => write!(
                f,
                "Input {} does not spend the coin the PSBT spends at that position.",
                input
            ),
        }
    }
}

impl error::Error for SpendError {}

impl From<ValidationError> for SpendError {
    fn from(e: ValidationError) -> Self {
        Self::Validation(e)
    }
}

// The BIP69 input sort key: the txid in display order, then the output index.
fn bip69_input_key(outpoint: &OutPoint) -> ([u8; 32], u32) {
    let mut txid = outpoint.txid.to_byte_array();
    txid.reverse();
    (txid, outpoint.vout)
}

// Check the inputs and outputs and build the unsigned transaction, returning the
// inputs in the deterministic order their TxIns ended up in.
fn build_unsigned<'a>(
    network: miniscript::bitcoin::Network,
    inputs: &'a [SpendInput],
    outputs: &[SpendOutput],
) -> Result<(Transaction, Vec<&'a SpendInput>), SpendError> {
    if inputs.is_empty() {
        return Err(SpendError::NoInputs);
    }
    if outputs.is_empty() {
        return Err(SpendError::NoOutputs);
    }
    let mut seen = HashSet::with_capacity(inputs.len());
    for (index, input) in inputs.iter().enumerate() {
        if !seen.insert(input.outpoint) {
            return Err(SpendError::DuplicateInput(input.outpoint));
        }
        if input.multisig.network() != network {
            return Err(SpendError::InputNetworkMismatch { index });
        }
    }
    let total_input: Amount = inputs.iter().map(|input| input.amount).sum();

    let mut txos = Vec::with_capacity(outputs.len());
    for output in outputs {
        let address = validation::validate_address(&output.address, network)?;
        validation::validate_output_amount(output.amount, Some(total_input))?;
        txos.push(TxOut {
            value: output.amount,
            script_pubkey: address.script_pubkey(),
        });
    }

    let mut sorted: Vec<&SpendInput> = inputs.iter().collect();
    sorted.sort_by_key(|input| bip69_input_key(&input.outpoint));

    let tx = Transaction {
        version: transaction::Version::ONE,
        lock_time: absolute::LockTime::ZERO,
        input: sorted
            .iter()
            .map(|input| TxIn {
                previous_output: input.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: txos,
    };
    Ok((tx, sorted))
}

/// Build the unsigned transaction spending the given coins. Inputs are ordered
/// deterministically (BIP69), outputs are kept in the order given.
pub fn unsigned_transaction(
    network: miniscript::bitcoin::Network,
    inputs: &[SpendInput],
    outputs: &[SpendOutput],
) -> Result<Transaction, SpendError> {
    build_unsigned(network, inputs, outputs).map(|(tx, _)| tx)
}

// Check a funding transaction actually creates the coin being spent.
fn check_prev_tx(input: &SpendInput, prev_tx: &Transaction, index: usize) -> Result<(), SpendError> {
    let vout = input.outpoint.vout as usize;
    if prev_tx.compute_txid() != input.outpoint.txid || vout >= prev_tx.output.len() {
        return Err(SpendError::PrevTxMismatch(index));
    }
    let txo = &prev_tx.output[vout];
    if txo.value != input.amount || txo.script_pubkey != input.multisig.script_pubkey() {
        return Err(SpendError::PrevTxMismatch(index));
    }
    Ok(())
}

/// Build the unsigned transaction as a BIP174 PSBT carrying everything a signing device
/// needs: the spent coin, the redeem and witness scripts, the BIP32 derivation of every
/// key in every input, and the braid members' xpubs as global entries.
pub fn unsigned_psbt(
    network: miniscript::bitcoin::Network,
    inputs: &[SpendInput],
    outputs: &[SpendOutput],
    secp: &secp256k1::Secp256k1<impl secp256k1::Verification>,
) -> Result<Psbt, SpendError> {
    let (tx, sorted) = build_unsigned(network, inputs, outputs)?;
    let mut psbt = Psbt::from_unsigned_tx(tx).map_err(SpendError::Psbt)?;
    let mut global_xpubs: BTreeMap<Xpub, (Fingerprint, DerivationPath)> = BTreeMap::new();

    for (index, input) in sorted.iter().enumerate() {
        let multisig = &input.multisig;
        let psbt_in = &mut psbt.inputs[index];

        match multisig.address_type() {
            AddressType::P2sh => {
                // Legacy signing devices check the input value against the full
                // funding transaction, there is no witness_utxo shortcut.
                let prev_tx = input
                    .prev_tx
                    .clone()
                    .ok_or(SpendError::MissingPrevTx(index))?;
                check_prev_tx(input, &prev_tx, index)?;
                psbt_in.non_witness_utxo = Some(prev_tx);
            }
            AddressType::P2shP2wsh | AddressType::P2wsh => {
                psbt_in.witness_utxo = Some(TxOut {
                    value: input.amount,
                    script_pubkey: multisig.script_pubkey(),
                });
                if let Some(prev_tx) = &input.prev_tx {
                    check_prev_tx(input, prev_tx, index)?;
                    psbt_in.non_witness_utxo = Some(prev_tx.clone());
                }
            }
        }
        psbt_in.redeem_script = multisig.redeem_script().map(|s| s.to_owned());
        psbt_in.witness_script = multisig.witness_script().map(|s| s.to_owned());

        if let Some(details) = multisig.braid_details() {
            let derivations = match &input.path_override {
                Some(path) => details
                    .braid()
                    .bip32_derivations_at_path(path, secp)
                    .map_err(SpendError::Braid)?,
                None => details.derivations().to_vec(),
            };
            for derivation in derivations {
                psbt_in.bip32_derivation.insert(
                    derivation.pubkey.inner,
                    (derivation.master_fingerprint, derivation.path),
                );
            }
            for member in details.braid().members() {
                global_xpubs.insert(
                    *member.xpub(),
                    (
                        member.root_fingerprint().unwrap_or_default(),
                        member
                            .base_path()
                            .cloned()
                            .unwrap_or_else(DerivationPath::master),
                    ),
                );
            }
        }
    }

    for (index, output) in outputs.iter().enumerate() {
        if let Some(multisig) = &output.multisig {
            let psbt_out = &mut psbt.outputs[index];
            psbt_out.redeem_script = multisig.redeem_script().map(|s| s.to_owned());
            psbt_out.witness_script = multisig.witness_script().map(|s| s.to_owned());
            if let Some(details) = multisig.braid_details() {
                for derivation in details.derivations() {
                    psbt_out.bip32_derivation.insert(
                        derivation.pubkey.inner,
                        (derivation.master_fingerprint, derivation.path.clone()),
                    );
                }
            }
        }
    }

    psbt.xpub = global_xpubs;
    Ok(psbt)
}

/// The message to sign for one input of the unsigned transaction: BIP143 over the
/// witness script for segwit inputs, the legacy algorithm over the redeem script for
/// P2SH. Always SIGHASH_ALL.
pub fn signature_hash(
    tx: &Transaction,
    input_index: usize,
    input: &SpendInput,
) -> Result<Message, SpendError> {
    if input_index >= tx.input.len() {
        return Err(SpendError::InputIndexOutOfBounds(input_index));
    }
    let mut cache = SighashCache::new(tx);
    let digest = if let Some(witness_script) = input.multisig.witness_script() {
        let sighash = cache
            .p2wsh_signature_hash(
                input_index,
                witness_script,
                input.amount,
                EcdsaSighashType::All,
            )
            .map_err(|_| SpendError::InputIndexOutOfBounds(input_index))?;
        Message::from_digest_slice(sighash.as_byte_array())
    } else {
        let redeem_script = input
            .multisig
            .redeem_script()
            .expect("a non-segwit multisig always has a redeem script");
        let sighash = cache
            .legacy_signature_hash(input_index, redeem_script, EcdsaSighashType::All.to_u32())
            .map_err(|_| SpendError::InputIndexOutOfBounds(input_index))?;
        Message::from_digest_slice(sighash.as_byte_array())
    };
    Ok(digest.expect("Sighash is always 32 bytes."))
}

// Copy a DER integer into a fixed 32-byte scalar, tolerating the leading zero byte DER
// adds when the high bit is set and left-padding short values.
fn copy_scalar(dest: &mut [u8], mut scalar: &[u8]) -> Result<(), SpendError> {
    if scalar.len() == dest.len() + 1 && scalar[0] == 0 {
        scalar = &scalar[1..];
    }
    if scalar.len() > dest.len() {
        return Err(SpendError::InvalidSignatureEncoding);
    }
    let start = dest.len() - scalar.len();
    dest[start..].copy_from_slice(scalar);
    Ok(())
}

/// Decode a DER-encoded ECDSA signature, with or without a trailing sighash type byte,
/// into its normalized (low-S) form.
pub fn decode_der_signature(raw: &[u8]) -> Result<secp256k1::ecdsa::Signature, SpendError> {
    // Tolerate a trailing sighash byte: present exactly when the declared DER length
    // covers all but the last byte.
    let der = if raw.len() >= 3 && raw[0] == 0x30 && (raw[1] as usize) + 2 == raw.len() - 1 {
        &raw[..raw.len() - 1]
    } else {
        raw
    };
    if der.len() < 8 || der[0] != 0x30 || (der[1] as usize) + 2 != der.len() || der[2] != 0x02 {
        return Err(SpendError::InvalidSignatureEncoding);
    }
    let r_len = der[3] as usize;
    if der.len() < 6 + r_len || der[4 + r_len] != 0x02 {
        return Err(SpendError::InvalidSignatureEncoding);
    }
    let s_len = der[5 + r_len] as usize;
    if der.len() != 6 + r_len + s_len {
        return Err(SpendError::InvalidSignatureEncoding);
    }
    let mut compact = [0u8; 64];
    copy_scalar(&mut compact[..32], &der[4..4 + r_len])?;
    copy_scalar(&mut compact[32..], &der[6 + r_len..])?;
    let mut signature = secp256k1::ecdsa::Signature::from_compact(&compact)
        .map_err(|_| SpendError::InvalidSignatureEncoding)?;
    signature.normalize_s();
    Ok(signature)
}

/// Check a candidate signature over a message against a set of public keys, returning
/// the key it verifies under, if any.
pub fn validate_multisig_signature(
    secp: &secp256k1::Secp256k1<impl secp256k1::Verification>,
    message: &Message,
    raw_signature: &[u8],
    pubkeys: &[miniscript::bitcoin::PublicKey],
) -> Result<Option<miniscript::bitcoin::PublicKey>, SpendError> {
    let signature = decode_der_signature(raw_signature)?;
    Ok(pubkeys
        .iter()
        .find(|key| secp.verify_ecdsa(message, &signature, &key.inner).is_ok())
        .copied())
}

// Match every candidate signature for one input to its public key, then return the
// first `required` signatures in script key order, DER-encoded with the SIGHASH_ALL
// byte appended.
fn input_signatures(
    secp: &secp256k1::Secp256k1<impl secp256k1::Verification>,
    message: &Message,
    input_index: usize,
    multisig: &Multisig,
    candidates: impl Iterator<Item = Vec<u8>>,
) -> Result<Vec<Vec<u8>>, SpendError> {
    // An empty entry means that signer did not sign this input.
    let candidates: Vec<Vec<u8>> = candidates.filter(|c| !c.is_empty()).collect();
    if candidates.len() < multisig.required_signers() {
        return Err(SpendError::InsufficientSignatures {
            input: input_index,
            got: candidates.len(),
            needed: multisig.required_signers(),
        });
    }
    let pubkeys = multisig.public_keys();
    let mut by_key = BTreeMap::new();
    for candidate in candidates {
        let signature = decode_der_signature(&candidate)?;
        let key = pubkeys
            .iter()
            .find(|key| secp.verify_ecdsa(message, &signature, &key.inner).is_ok())
            .ok_or(SpendError::InvalidSignature { input: input_index })?;
        if by_key.insert(*key, signature).is_some() {
            return Err(SpendError::DuplicateSignature { input: input_index });
        }
    }
    Ok(pubkeys
        .iter()
        .filter_map(|key| by_key.get(key))
        .take(multisig.required_signers())
        .map(|signature| {
            let mut encoded = signature.serialize_der().to_vec();
            encoded.push(EcdsaSighashType::All.to_u32() as u8);
            encoded
        })
        .collect())
}

// Splice the finalized signatures into one input of the transaction.
fn splice_signatures(txin: &mut TxIn, multisig: &Multisig, signatures: &[Vec<u8>]) {
    let push = |bytes: Vec<u8>| {
        PushBytesBuf::try_from(bytes).expect("signatures and multisig scripts fit a push")
    };
    match multisig.address_type() {
        AddressType::P2sh => {
            // The extra OP_0 consumed by the off-by-one in OP_CHECKMULTISIG.
            let mut builder = Builder::new().push_int(0);
            for signature in signatures {
                builder = builder.push_slice(push(signature.clone()));
            }
            let redeem_script = multisig
                .redeem_script()
                .expect("a p2sh multisig always has a redeem script");
            txin.script_sig = builder.push_slice(push(redeem_script.to_bytes())).into_script();
        }
        AddressType::P2shP2wsh | AddressType::P2wsh => {
            let mut witness = Witness::new();
            let empty: [u8; 0] = [];
            witness.push(empty);
            for signature in signatures {
                witness.push(signature);
            }
            let witness_script = multisig
                .witness_script()
                .expect("a segwit multisig always has a witness script");
            witness.push(witness_script.as_bytes());
            txin.witness = witness;
            if let Some(script_sig) = multisig.segwit_script_sig() {
                txin.script_sig = script_sig;
            }
        }
    }
}

/// Assemble the fully-signed transaction. `tx_signatures` holds one list per signer,
/// each with one DER signature (trailing sighash byte optional) per input, indexed by
/// the deterministic input order of the unsigned transaction. An empty entry means the
/// signer did not sign that input. Signatures may come from any `required_signers` of
/// the keys, in any order: each is matched to its key by verification and spliced in
/// script key order.
pub fn signed_transaction(
    network: miniscript::bitcoin::Network,
    inputs: &[SpendInput],
    outputs: &[SpendOutput],
    tx_signatures: &[Vec<Vec<u8>>],
    secp: &secp256k1::Secp256k1<impl secp256k1::Verification>,
) -> Result<Transaction, SpendError> {
    if tx_signatures.is_empty() {
        return Err(SpendError::NoSignatures);
    }
    let (mut tx, sorted) = build_unsigned(network, inputs, outputs)?;
    for (list, signatures) in tx_signatures.iter().enumerate() {
        if signatures.len() < sorted.len() {
            return Err(SpendError::SignatureListLength {
                list,
                got: signatures.len(),
                needed: sorted.len(),
            });
        }
    }

    let messages = sorted
        .iter()
        .enumerate()
        .map(|(index, input)| signature_hash(&tx, index, input))
        .collect::<Result<Vec<Message>, SpendError>>()?;

    for (index, input) in sorted.iter().enumerate() {
        let finalized = input_signatures(
            secp,
            &messages[index],
            index,
            &input.multisig,
            tx_signatures.iter().map(|list| list[index].clone()),
        )?;
        splice_signatures(&mut tx.input[index], &input.multisig, &finalized);
    }
    Ok(tx)
}

/// Insert one signer's signatures into a PSBT as partial signatures, matching each to
/// its public key by verification. `signatures` has one entry per input, in the PSBT's
/// input order.
pub fn insert_signatures(
    psbt: &mut Psbt,
    inputs: &[SpendInput],
    signatures: &[Vec<u8>],
    secp: &secp256k1::Secp256k1<impl secp256k1::Verification>,
) -> Result<(), SpendError> {
    let mut sorted: Vec<&SpendInput> = inputs.iter().collect();
    sorted.sort_by_key(|input| bip69_input_key(&input.outpoint));
    if signatures.len() != sorted.len() || sorted.len() != psbt.unsigned_tx.input.len() {
        return Err(SpendError::SignatureListLength {
            list: 0,
            got: signatures.len(),
            needed: psbt.unsigned_tx.input.len(),
        });
    }
    for (index, input) in sorted.iter().enumerate() {
        // Refuse inputs that do not describe the coins the PSBT actually spends,
        // signatures would otherwise be matched against the wrong scripts.
        if input.outpoint != psbt.unsigned_tx.input[index].previous_output {
            return Err(SpendError::PsbtInputMismatch { input: index });
        }
        let message = signature_hash(&psbt.unsigned_tx, index, input)?;
        let signature = decode_der_signature(&signatures[index])?;
        let key = input
            .multisig
            .public_keys()
            .iter()
            .find(|key| secp.verify_ecdsa(&message, &signature, &key.inner).is_ok())
            .copied()
            .ok_or(SpendError::InvalidSignature { input: index })?;
        let previous = psbt.inputs[index].partial_sigs.insert(
            key,
            ecdsa::Signature {
                signature,
                sighash_type: EcdsaSighashType::All,
            },
        );
        if previous.is_some() {
            return Err(SpendError::DuplicateSignature { input: index });
        }
    }
    Ok(())
}
