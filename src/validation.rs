//! Validation of user-supplied transaction components: addresses, transaction ids and
//! output amounts.

use crate::fees::DUST_OUTPUT_SATS;

use miniscript::bitcoin::{address, Address, Amount, Network, Txid};

use std::{error, fmt, str::FromStr};

#[derive(Debug)]
pub enum ValidationError {
    Address(address::ParseError),
    /// The address parses but belongs to another network.
    WrongAddressNetwork { expected: Network },
    InvalidTxid(String),
    ZeroAmount,
    /// The output value is below the dust threshold.
    DustAmount(Amount),
    AmountExceedsInput { amount: Amount, total: Amount },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Address(e) => write!(f, "Invalid address: '{}'.", e),
            Self::WrongAddressNetwork { expected } => {
                write!(f, "Address is not valid for network '{}'.", expected)
            }
            Self::InvalidTxid(txid) => write!(f, "Invalid transaction id '{}'.", txid),
            Self::ZeroAmount => write!(f, "Output amount must be positive."),
            Self::DustAmount(amount) => write!(
                f,
                "Output amount of {} sats is below the {} sats dust threshold.",
                amount.to_sat(),
                DUST_OUTPUT_SATS
            ),
            Self::AmountExceedsInput { amount, total } => write!(
                f,
                "Output amount of {} sats exceeds the total input amount of {} sats.",
                amount.to_sat(),
                total.to_sat()
            ),
        }
    }
}

impl error::Error for ValidationError {}

/// Parse an address and check it belongs to the given network.
pub fn validate_address(address: &str, network: Network) -> Result<Address, ValidationError> {
    Address::from_str(address.trim())
        .map_err(ValidationError::Address)?
        .require_network(network)
        .map_err(|_| ValidationError::WrongAddressNetwork { expected: network })
}

/// Parse a transaction id from its display (big-endian) hex form.
pub fn validate_txid(txid: &str) -> Result<Txid, ValidationError> {
    let txid = txid.trim();
    if txid.len() != 64 {
        return Err(ValidationError::InvalidTxid(txid.to_string()));
    }
    Txid::from_str(txid).map_err(|_| ValidationError::InvalidTxid(txid.to_string()))
}

/// Check an output amount: positive, above the dust threshold, and when the total
/// input amount is known, not exceeding it.
pub fn validate_output_amount(
    amount: Amount,
    total_input: Option<Amount>,
) -> Result<(), ValidationError> {
    if amount == Amount::ZERO {
        return Err(ValidationError::ZeroAmount);
    }
    if amount < Amount::from_sat(DUST_OUTPUT_SATS) {
        return Err(ValidationError::DustAmount(amount));
    }
    if let Some(total) = total_input {
        if amount > total {
            return Err(ValidationError::AmountExceedsInput { amount, total });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses() {
        // A well-known mainnet P2SH address, with surrounding whitespace tolerated.
        let address =
            validate_address(" 3J98t1WpEZ73CNmQviecrnyiWrnqRhWNLy ", Network::Bitcoin).unwrap();
        assert_eq!(address.to_string(), "3J98t1WpEZ73CNmQviecrnyiWrnqRhWNLy");

        assert!(matches!(
            validate_address("3J98t1WpEZ73CNmQviecrnyiWrnqRhWNLy", Network::Testnet),
            Err(ValidationError::WrongAddressNetwork {
                expected: Network::Testnet
            })
        ));
        assert!(matches!(
            validate_address("notanaddress", Network::Bitcoin),
            Err(ValidationError::Address(..))
        ));
        assert!(matches!(
            validate_address("", Network::Bitcoin),
            Err(ValidationError::Address(..))
        ));
    }

    #[test]
    fn txids() {
        let hex = "d21633ba23f70118185227be58a63527675641ad37967e2aa461559f577aec43";
        let txid = validate_txid(hex).unwrap();
        assert_eq!(txid.to_string(), hex);

        assert!(validate_txid("d21633ba").is_err());
        assert!(validate_txid(&hex[..63]).is_err());
        let mut bad = hex.to_string();
        bad.replace_range(0..1, "z");
        assert!(validate_txid(&bad).is_err());
    }

    #[test]
    fn output_amounts() {
        assert!(validate_output_amount(Amount::from_sat(10_000), None).is_ok());
        assert!(
            validate_output_amount(Amount::from_sat(546), Some(Amount::from_sat(546))).is_ok()
        );
        assert!(matches!(
            validate_output_amount(Amount::ZERO, None),
            Err(ValidationError::ZeroAmount)
        ));
        assert!(matches!(
            validate_output_amount(Amount::from_sat(545), None),
            Err(ValidationError::DustAmount(..))
        ));
        assert!(matches!(
            validate_output_amount(Amount::from_sat(10_001), Some(Amount::from_sat(10_000))),
            Err(ValidationError::AmountExceedsInput { .. })
        ));
    }
}
