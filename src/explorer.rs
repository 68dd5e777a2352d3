//! URLs on a block explorer for the networks braids run on. Mainnet, testnet and
//! signet point at blockstream.info, regtest at a locally-run esplora instance.

use miniscript::bitcoin::{Address, Network, Txid};

/// Base URL of the explorer for a network.
pub fn explorer_url(network: Network) -> &'static str {
    match network {
        Network::Testnet => "https://blockstream.info/testnet",
        Network::Signet => "https://blockstream.info/signet",
        Network::Regtest => "http://localhost:3002",
        _ => "https://blockstream.info",
    }
}

/// Base URL of the explorer's REST API for a network.
pub fn api_url(network: Network) -> String {
    format!("{}/api", explorer_url(network))
}

pub fn transaction_url(network: Network, txid: &Txid) -> String {
    format!("{}/tx/{}", explorer_url(network), txid)
}

pub fn address_url(network: Network, address: &Address) -> String {
    format!("{}/address/{}", explorer_url(network), address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn urls() {
        assert_eq!(explorer_url(Network::Bitcoin), "https://blockstream.info");
        assert_eq!(
            explorer_url(Network::Testnet),
            "https://blockstream.info/testnet"
        );
        assert_eq!(
            explorer_url(Network::Signet),
            "https://blockstream.info/signet"
        );
        assert_eq!(explorer_url(Network::Regtest), "http://localhost:3002");
        assert_eq!(api_url(Network::Bitcoin), "https://blockstream.info/api");

        let txid =
            Txid::from_str("d21633ba23f70118185227be58a63527675641ad37967e2aa461559f577aec43")
                .unwrap();
        assert_eq!(
            transaction_url(Network::Testnet, &txid),
            "https://blockstream.info/testnet/tx/d21633ba23f70118185227be58a63527675641ad37967e2aa461559f577aec43"
        );

        let address = crate::validation::validate_address(
            "3J98t1WpEZ73CNmQviecrnyiWrnqRhWNLy",
            Network::Bitcoin,
        )
        .unwrap();
        assert_eq!(
            address_url(Network::Bitcoin, &address),
            "https://blockstream.info/address/3J98t1WpEZ73CNmQviecrnyiWrnqRhWNLy"
        );
    }
}
