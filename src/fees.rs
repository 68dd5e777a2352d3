//! Fee estimation and sanity checks for multisig transactions.
//!
//! Estimation is done from the transaction shape alone, before any signature exists,
//! using a conservative 73-byte signature size. All inputs are assumed to be locked by
//! the same address type with the same m-of-n quorum, which is how coordinators use
//! it: estimating the cost of consolidating or spending coins of a single braid.

use crate::multisig::AddressType;

use miniscript::bitcoin::Amount;

use std::{error, fmt};

/// Below this value an output is considered dust and refused.
pub const DUST_OUTPUT_SATS: u64 = 546;

/// An absolute fee above this is assumed to be a mistake.
pub const MAX_FEE_SATS: u64 = 2_500_000;

/// A fee rate above this is assumed to be a mistake.
pub const MAX_FEERATE_SATS_PER_VBYTE: u64 = 1_000;

#[derive(Debug)]
pub enum FeeError {
    ZeroFeeRate,
    ExcessiveFeeRate(u64),
    ExcessiveFee(Amount),
    FeeExceedsInputs { fee: Amount, total: Amount },
}

impl fmt::Display for FeeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ZeroFeeRate => write!(f, "Fee rate must be positive."),
            Self::ExcessiveFeeRate(rate) => write!(
                f,
                "Fee rate of {} sats/vbyte is above the {} sats/vbyte ceiling.",
                rate, MAX_FEERATE_SATS_PER_VBYTE
            ),
            Self::ExcessiveFee(fee) => write!(
                f,
                "Fee of {} sats is above the {} sats ceiling.",
                fee.to_sat(),
                MAX_FEE_SATS
            ),
            Self::FeeExceedsInputs { fee, total } => write!(
                f,
                "Fee of {} sats exceeds the total input amount of {} sats.",
                fee.to_sat(),
                total.to_sat()
            ),
        }
    }
}

impl error::Error for FeeError {}

/// Check a fee rate is positive and below the sanity ceiling.
pub fn validate_feerate(sats_per_vbyte: u64) -> Result<(), FeeError> {
    if sats_per_vbyte == 0 {
        return Err(FeeError::ZeroFeeRate);
    }
    if sats_per_vbyte > MAX_FEERATE_SATS_PER_VBYTE {
        return Err(FeeError::ExcessiveFeeRate(sats_per_vbyte));
    }
    Ok(())
}

/// Check an absolute fee against the sanity ceiling and the total input amount.
pub fn validate_fee(fee: Amount, total_input: Amount) -> Result<(), FeeError> {
    if fee > total_input {
        return Err(FeeError::FeeExceedsInputs {
            fee,
            total: total_input,
        });
    }
    if fee > Amount::from_sat(MAX_FEE_SATS) {
        return Err(FeeError::ExcessiveFee(fee));
    }
    Ok(())
}

// Sizes, in (v)bytes: a signature push with its sighash byte, a compressed key push,
// and the non-witness envelope of a transaction with only multisig inputs.
const SIGNATURE_SIZE: u64 = 73;
const PUBKEY_SIZE: u64 = 34;

fn base_size(per_input: u64, num_inputs: u64, num_outputs: u64) -> u64 {
    per_input * num_inputs + 34 * num_outputs + 30
}

/// Estimate the virtual size of an m-of-n multisig transaction, assuming every input
/// is locked by the same address type and quorum.
pub fn estimate_multisig_transaction_vsize(
    address_type: AddressType,
    num_inputs: u64,
    num_outputs: u64,
    required_signers: u64,
    total_signers: u64,
) -> u64 {
    let (m, n) = (required_signers, total_signers);
    match address_type {
        AddressType::P2sh => {
            // Signatures and the redeem script live in the scriptSig, at full weight.
            let script_sig = num_inputs * (SIGNATURE_SIZE * m + PUBKEY_SIZE * n + 4);
            base_size(41, num_inputs, num_outputs) + script_sig
        }
        AddressType::P2wsh => {
            let witness = num_inputs * (SIGNATURE_SIZE * m + PUBKEY_SIZE * n + 6);
            base_size(41, num_inputs, num_outputs) + (witness + 3) / 4
        }
        AddressType::P2shP2wsh => {
            // The scriptSig push of the redeem script counts at full weight, hence the
            // larger per-input base size.
            let witness = num_inputs * ((SIGNATURE_SIZE - 1) * m + (PUBKEY_SIZE - 1) * n + 6);
            base_size(76, num_inputs, num_outputs) + (witness + 3) / 4
        }
    }
}

/// Estimate the fee of an m-of-n multisig transaction at a given fee rate.
pub fn estimate_multisig_transaction_fee(
    address_type: AddressType,
    num_inputs: u64,
    num_outputs: u64,
    required_signers: u64,
    total_signers: u64,
    sats_per_vbyte: u64,
) -> Amount {
    Amount::from_sat(
        estimate_multisig_transaction_vsize(
            address_type,
            num_inputs,
            num_outputs,
            required_signers,
            total_signers,
        ) * sats_per_vbyte,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vsize_estimates() {
        // 2-of-3, two inputs, two outputs.
        assert_eq!(
            estimate_multisig_transaction_vsize(AddressType::P2sh, 2, 2, 2, 3),
            684
        );
        assert_eq!(
            estimate_multisig_transaction_vsize(AddressType::P2wsh, 2, 2, 2, 3),
            307
        );
        assert_eq!(
            estimate_multisig_transaction_vsize(AddressType::P2shP2wsh, 2, 2, 2, 3),
            375
        );

        // The segwit discount orders the types.
        for &(inputs, outputs, m, n) in &[(1u64, 1u64, 1u64, 2u64), (5, 3, 3, 5), (20, 2, 2, 3)] {
            let p2sh = estimate_multisig_transaction_vsize(AddressType::P2sh, inputs, outputs, m, n);
            let wrapped =
                estimate_multisig_transaction_vsize(AddressType::P2shP2wsh, inputs, outputs, m, n);
            let native =
                estimate_multisig_transaction_vsize(AddressType::P2wsh, inputs, outputs, m, n);
            assert!(native < wrapped && wrapped < p2sh);
        }
    }

    #[test]
    fn fee_estimates() {
        // 2-of-3 P2SH, two inputs and three outputs at 10 sats/vbyte.
        assert_eq!(
            estimate_multisig_transaction_vsize(AddressType::P2sh, 2, 3, 2, 3),
            718
        );
        assert_eq!(
            estimate_multisig_transaction_fee(AddressType::P2sh, 2, 3, 2, 3, 10),
            Amount::from_sat(7_180)
        );
        assert_eq!(
            estimate_multisig_transaction_fee(AddressType::P2sh, 2, 2, 2, 3, 10),
            Amount::from_sat(6_840)
        );
        assert_eq!(
            estimate_multisig_transaction_fee(AddressType::P2wsh, 2, 2, 2, 3, 1),
            Amount::from_sat(307)
        );
    }

    #[test]
    fn feerate_checks() {
        assert!(validate_feerate(1).is_ok());
        assert!(validate_feerate(1_000).is_ok());
        assert!(matches!(validate_feerate(0), Err(FeeError::ZeroFeeRate)));
        assert!(matches!(
            validate_feerate(1_001),
            Err(FeeError::ExcessiveFeeRate(1_001))
        ));
    }

    #[test]
    fn fee_checks() {
        let total = Amount::from_sat(10_000_000);
        assert!(validate_fee(Amount::from_sat(10_000), total).is_ok());
        assert!(validate_fee(Amount::ZERO, total).is_ok());
        assert!(matches!(
            validate_fee(Amount::from_sat(2_500_001), total),
            Err(FeeError::ExcessiveFee(..))
        ));
        assert!(matches!(
            validate_fee(Amount::from_sat(20_000), Amount::from_sat(15_000)),
            Err(FeeError::FeeExceedsInputs { .. })
        ));
    }
}
