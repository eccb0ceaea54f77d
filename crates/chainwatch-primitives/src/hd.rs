//! Extended public key handling and address derivation.
//!
//! Accounts may be declared in any of the common SLIP-132 encodings
//! (xpub/ypub/zpub on mainnet, tpub/upub/vpub on testnet). The encoding is
//! only a hint about the intended script type; chainwatch stores the key in
//! its canonical xpub/tpub form and carries the script scheme separately.

use crate::Chain;
use bitcoin::base58;
use bitcoin::bip32::{ChildNumber, Xpub};
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{Address, Network, NetworkKind};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

const MAGIC_XPUB: u32 = 0x0488_b21e;
const MAGIC_TPUB: u32 = 0x0435_87cf;
const MAGIC_YPUB: u32 = 0x049d_7cb2;
const MAGIC_UPUB: u32 = 0x044a_5262;
const MAGIC_ZPUB: u32 = 0x04b2_4746;
const MAGIC_VPUB: u32 = 0x045f_1cf6;

/// Flag bit marking an account as locked in the stored scheme code.
const LOCKED: u8 = 1 << 7;

/// Error type for extended key handling.
#[derive(Debug, thiserror::Error)]
pub enum HdError {
    #[error(transparent)]
    Base58(#[from] base58::Error),

    #[error(transparent)]
    Bip32(#[from] bitcoin::bip32::Error),

    #[error("Unknown extended key version bytes: {0:#010x}")]
    UnknownVersion(u32),

    #[error("Extended key does not match network {0}")]
    NetworkMismatch(Network),

    #[error("Unknown derivation scheme code: {0}")]
    UnknownSchemeCode(u8),
}

/// Script scheme used to turn derived public keys into addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivationScheme {
    /// P2PKH addresses (BIP44 wallets).
    Legacy,
    /// P2WPKH nested in P2SH (BIP49 wallets).
    WrappedSegwit,
    /// Native P2WPKH (BIP84 wallets).
    NativeSegwit,
}

impl DerivationScheme {
    /// Decodes the stored scheme code into a scheme and a locked flag.
    pub fn from_code(code: u8) -> Result<(Self, bool), HdError> {
        let locked = code & LOCKED != 0;
        let scheme = match code & !LOCKED {
            0 => DerivationScheme::Legacy,
            1 => DerivationScheme::WrappedSegwit,
            2 => DerivationScheme::NativeSegwit,
            _ => return Err(HdError::UnknownSchemeCode(code)),
        };
        Ok((scheme, locked))
    }

    /// Encodes the scheme and locked flag into the stored code.
    pub fn to_code(self, locked: bool) -> u8 {
        let base = match self {
            DerivationScheme::Legacy => 0,
            DerivationScheme::WrappedSegwit => 1,
            DerivationScheme::NativeSegwit => 2,
        };
        if locked { base | LOCKED } else { base }
    }

    /// Scheme implied by a SLIP-132 encoded key, if the prefix carries one.
    pub fn implied_by_version(version: u32) -> Option<Self> {
        match version {
            MAGIC_XPUB | MAGIC_TPUB => Some(DerivationScheme::Legacy),
            MAGIC_YPUB | MAGIC_UPUB => Some(DerivationScheme::WrappedSegwit),
            MAGIC_ZPUB | MAGIC_VPUB => Some(DerivationScheme::NativeSegwit),
            _ => None,
        }
    }
}

impl std::fmt::Display for DerivationScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DerivationScheme::Legacy => "legacy",
            DerivationScheme::WrappedSegwit => "wrapped-segwit",
            DerivationScheme::NativeSegwit => "native-segwit",
        };
        f.write_str(s)
    }
}

/// An address derived from an HD account at `m/chain/index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedAddress {
    pub address: String,
    pub chain: Chain,
    pub index: u32,
}

/// Scheme implied by the encoding prefix of an extended public key:
/// ypub/upub mean wrapped segwit, zpub/vpub native segwit, xpub/tpub
/// legacy.
pub fn implied_scheme(encoded: &str) -> Result<DerivationScheme, HdError> {
    let data = base58::decode_check(encoded)?;
    if data.len() < 4 {
        return Err(HdError::UnknownVersion(0));
    }
    let version = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    DerivationScheme::implied_by_version(version).ok_or(HdError::UnknownVersion(version))
}

/// Rewrites a SLIP-132 encoded extended public key to its canonical
/// xpub/tpub encoding. Keys already in canonical form pass through.
pub fn normalize_xpub(encoded: &str) -> Result<String, HdError> {
    let mut data = base58::decode_check(encoded)?;
    if data.len() < 4 {
        return Err(HdError::UnknownVersion(0));
    }
    let version = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);

    let target = match version {
        MAGIC_XPUB | MAGIC_TPUB => return Ok(encoded.to_owned()),
        MAGIC_YPUB | MAGIC_ZPUB => MAGIC_XPUB,
        MAGIC_UPUB | MAGIC_VPUB => MAGIC_TPUB,
        other => return Err(HdError::UnknownVersion(other)),
    };

    data[0..4].copy_from_slice(&target.to_be_bytes());
    Ok(base58::encode_check(&data))
}

/// Parses an extended public key in any supported encoding and checks it
/// belongs to the given network.
pub fn parse_xpub(encoded: &str, network: Network) -> Result<Xpub, HdError> {
    let normalized = normalize_xpub(encoded)?;
    let xpub = Xpub::from_str(&normalized)?;
    if xpub.network != NetworkKind::from(network) {
        return Err(HdError::NetworkMismatch(network));
    }
    Ok(xpub)
}

/// Derives addresses for an account at `m/chain/i` for every `i` in
/// `indices`, rendering them with the account's script scheme.
pub fn derive_addresses(
    xpub: &Xpub,
    chain: Chain,
    indices: impl IntoIterator<Item = u32>,
    scheme: DerivationScheme,
    network: Network,
) -> Result<Vec<DerivedAddress>, HdError> {
    let secp = Secp256k1::verification_only();
    let chain_node = xpub.derive_pub(&secp, &[ChildNumber::from_normal_idx(chain.index())?])?;

    indices
        .into_iter()
        .map(|index| {
            let child = chain_node.derive_pub(&secp, &[ChildNumber::from_normal_idx(index)?])?;
            let pk = child.to_pub();
            let address = match scheme {
                DerivationScheme::Legacy => Address::p2pkh(pk.pubkey_hash(), network),
                DerivationScheme::WrappedSegwit => Address::p2shwpkh(&pk, network),
                DerivationScheme::NativeSegwit => Address::p2wpkh(&pk, network),
            };
            Ok(DerivedAddress {
                address: address.to_string(),
                chain,
                index,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const XPUB: &str = "tpubDDDAe7GgFT4fzEzKwWVA4BWo8fiJXQeGEYDTexzo2w6CK1iDoLPYkpEisXo623ieF79GQ3xpcEVN1vcQhX2sysyL8o1XqzBmQb9JReTxQ7w";
    const YPUB: &str = "upub5ELkCsSF68UnAZE7zF9CDztvHeBJiAAhwa4VxEFzZ1CfQRbpy93mkBbUZsqYVpoeEHFwY3fGh9bfftH79ZwbhjUEUBAxQj551TMxVyny4UX";
    const ZPUB: &str = "vpub5ZB1WY7AEp2G1rREpbvpS5zRTcKkenACrgaijd9sw1aYTXR4DoDLNFFcb5o8VjTZdvNkHXFq9oxDZAtfsGMcVy9qLWsNzdtZHBRbtXe87LB";

    const BIP44_VECTORS: &[(u32, u32, &str)] = &[
        (0, 0, "mmZ5FRccGAkwfKme4JkrsmurnimDLdfmNL"),
        (0, 1, "n3yomLicyrSULiNWFKHsK8erntSpJZEPV6"),
        (0, 2, "mvVYLwjmMuYVWbuTyB9UE6LWah9tevLrrE"),
        (0, 3, "n1CrG3NpdTiFWh8KgsnAGUgn6aEF8xvYY2"),
        (0, 4, "mw3JvPz3wdUVrmTD6WugHgahk97QWnD61L"),
        (1, 0, "miYMfmg3F3QpBJ48oVzvSi4NVgi93ykJ1L"),
        (1, 1, "mvEnHm9ZFcdnBa5wNfiJ6yVViex8wReDJJ"),
        (1, 2, "muSWDErhMRUHb6nSQqnVLp3TctqsKjKY4G"),
        (1, 3, "mhxsuiLirgVeRT9Nb9iUVrmCTgNDc1tcNa"),
        (1, 4, "mtj8CDwFPa4cfyK9cgfSCaXvDxdszgFFVU"),
    ];

    const BIP49_VECTORS: &[(u32, u32, &str)] = &[
        (0, 0, "2NCmqrb5eXMYZUxdnY4Dr8h3FKqH6JmWCco"),
        (0, 1, "2NCxTGKxDsv9gyC2wjBev85WHP1GN8LCKfR"),
        (0, 2, "2N7vmdwgKjVxkivSou6F8Zaj37SxH7jASaC"),
        (0, 3, "2NBeYshMWNj5jiMBuk9mfywY2853QKgDJ9k"),
        (0, 4, "2MutR6UcnThCUmFJVUrT2z265pNGQcj6DV3"),
        (1, 0, "2MvSusqGmAB5MNz66dVLndV8AVKBvhidCdS"),
        (1, 1, "2MxCqx15GTdW8wDXAVSsxnmHTjoqQLEEzQt"),
        (1, 2, "2N7megh7h2CiCcGWcXax266BtjxZy5Hovrf"),
        (1, 3, "2N8CrDFMsFA7Gs9phdA7xpm3RrDgvk719ro"),
        (1, 4, "2Msi1iNCJcxsxX5ENiVzzqWw8GuCJG8zfmV"),
    ];

    const BIP84_VECTORS: &[(u32, u32, &str)] = &[
        (0, 0, "tb1qggmkgcrk5zdwm8wlh2nzqv5k7xunv3tqk6w9p0"),
        (0, 1, "tb1q7enwpjlzuc3taq69mkpyqmkwn8d5mtrvmvzl9m"),
        (0, 2, "tb1q53zh56awxvk824msyxhfjtlwg4fwd3s2s5wygh"),
        (0, 3, "tb1q6l6lm298eq5qkwntl42lv2x0vw6yny50ugnuef"),
        (0, 4, "tb1q4fre2as0az62am5eaj30tupv92crqd8yjpu67w"),
        (1, 0, "tb1qyykyu2y9lx6qt2y6j3nur88ssnpuapnug9zuv4"),
        (1, 1, "tb1q59awztrl7dfn7l38a8uvgrkstrw4lf4fwmz2kt"),
        (1, 2, "tb1qnza9973gp8f7rm9k9yc327zwdvz9wl9sa3yvp7"),
        (1, 3, "tb1qrttk0uzx656uupg9w8f39ec6e6c8wwcts4fanj"),
        (1, 4, "tb1qjrnw8u2pvspm6hq3aa83ff93wevq2zyxqczewy"),
    ];

    fn check_vectors(scheme: DerivationScheme, vectors: &[(u32, u32, &str)]) {
        let xpub = parse_xpub(XPUB, Network::Testnet).unwrap();
        for &(chain, index, expected) in vectors {
            let chain = Chain::from_index(chain).unwrap();
            let derived =
                derive_addresses(&xpub, chain, [index], scheme, Network::Testnet).unwrap();
            assert_eq!(derived.len(), 1);
            assert_eq!(derived[0].address, expected);
            assert_eq!(derived[0].chain, chain);
            assert_eq!(derived[0].index, index);
        }
    }

    #[test]
    fn derives_legacy_addresses() {
        check_vectors(DerivationScheme::Legacy, BIP44_VECTORS);
    }

    #[test]
    fn derives_wrapped_segwit_addresses() {
        check_vectors(DerivationScheme::WrappedSegwit, BIP49_VECTORS);
    }

    #[test]
    fn derives_native_segwit_addresses() {
        check_vectors(DerivationScheme::NativeSegwit, BIP84_VECTORS);
    }

    #[test]
    fn normalizes_slip132_encodings() {
        // All three encodings wrap the same key material.
        assert_eq!(normalize_xpub(XPUB).unwrap(), XPUB);
        assert_eq!(normalize_xpub(YPUB).unwrap(), XPUB);
        assert_eq!(normalize_xpub(ZPUB).unwrap(), XPUB);
    }

    #[test]
    fn parses_any_encoding_to_the_same_key() {
        let from_xpub = parse_xpub(XPUB, Network::Testnet).unwrap();
        let from_ypub = parse_xpub(YPUB, Network::Testnet).unwrap();
        let from_zpub = parse_xpub(ZPUB, Network::Testnet).unwrap();
        assert_eq!(from_xpub, from_ypub);
        assert_eq!(from_xpub, from_zpub);
    }

    #[test]
    fn rejects_wrong_network() {
        assert!(matches!(
            parse_xpub(XPUB, Network::Bitcoin),
            Err(HdError::NetworkMismatch(_))
        ));
    }

    #[test]
    fn encoding_prefix_implies_the_scheme() {
        assert_eq!(implied_scheme(XPUB).unwrap(), DerivationScheme::Legacy);
        assert_eq!(
            implied_scheme(YPUB).unwrap(),
            DerivationScheme::WrappedSegwit
        );
        assert_eq!(implied_scheme(ZPUB).unwrap(), DerivationScheme::NativeSegwit);
    }

    #[test]
    fn scheme_codes_round_trip() {
        let cases = [
            (0u8, DerivationScheme::Legacy, false),
            (1, DerivationScheme::WrappedSegwit, false),
            (2, DerivationScheme::NativeSegwit, false),
            (128, DerivationScheme::Legacy, true),
            (129, DerivationScheme::WrappedSegwit, true),
            (130, DerivationScheme::NativeSegwit, true),
        ];
        for (code, scheme, locked) in cases {
            assert_eq!(DerivationScheme::from_code(code).unwrap(), (scheme, locked));
            assert_eq!(scheme.to_code(locked), code);
        }
        assert!(DerivationScheme::from_code(3).is_err());
    }
}
