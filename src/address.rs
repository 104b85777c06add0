//! # Address Validation & Extraction
//!
//! Solana addresses are base-58 strings that decode to exactly 32 bytes. This module
//! validates candidate strings and walks resolved transaction payloads to collect every
//! valid address they mention.
//!
//! ## Extraction roots
//!
//! Only three locations of a `getTransaction` result are visited:
//!
//! - `transaction.message.accountKeys`
//! - `meta.innerInstructions`
//! - `transaction.message` (the mapping itself)
//!
//! Everything reachable from those roots is walked with an explicit stack, so deeply
//! nested payloads cannot overflow the call stack.

use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;

use crate::metrics;

/// Decoded length of a Solana public key.
pub const ADDRESS_LEN: usize = 32;

/// Returns true iff `candidate` base-58 decodes to exactly 32 bytes.
///
/// Never panics; any decode failure is `false`.
pub fn is_valid_address(candidate: &str) -> bool {
    let mut buf = [0u8; ADDRESS_LEN];
    matches!(
        bs58::decode(candidate).onto(&mut buf[..]),
        Ok(len) if len == ADDRESS_LEN
    )
}

/// A string that has passed [`is_valid_address`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TokenAddress(String);

impl TokenAddress {
    pub fn parse(candidate: &str) -> Option<Self> {
        is_valid_address(candidate).then(|| Self(candidate.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TokenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TokenAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<TokenAddress> for String {
    fn from(address: TokenAddress) -> Self {
        address.0
    }
}

impl TryFrom<String> for TokenAddress {
    type Error = InvalidAddress;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if is_valid_address(&value) {
            Ok(Self(value))
        } else {
            Err(InvalidAddress(value))
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("not a 32-byte base-58 address: {0}")]
pub struct InvalidAddress(pub String);

/// Collects the valid addresses mentioned by a resolved transaction.
///
/// Missing or null sections contribute nothing. The result is deduplicated and its
/// order is unspecified.
pub fn extract_token_addresses(transaction: Option<&Value>) -> HashSet<TokenAddress> {
    let mut found = HashSet::new();

    if let Some(tx) = transaction.filter(|v| !v.is_null()) {
        let message = tx.pointer("/transaction/message");
        let roots = [
            message.and_then(|m| m.get("accountKeys")),
            tx.pointer("/meta/innerInstructions"),
            message,
        ];

        for root in roots.into_iter().flatten() {
            collect_addresses(root, &mut found);
        }
    }

    // Every member was built through TokenAddress::parse; re-check anyway before it
    // leaves this module.
    found.retain(|a| is_valid_address(a.as_str()));

    info!("[Extractor] Extracted {} valid token addresses", found.len());
    metrics::increment_addresses_extracted(found.len() as u64);
    found
}

/// Worklist traversal over sequences, mappings and scalars below `root`.
fn collect_addresses(root: &Value, out: &mut HashSet<TokenAddress>) {
    let mut stack: Vec<&Value> = vec![root];

    while let Some(node) = stack.pop() {
        match node {
            Value::String(s) => {
                if let Some(address) = TokenAddress::parse(s) {
                    out.insert(address);
                }
            }
            Value::Array(items) => stack.extend(items.iter()),
            Value::Object(map) => stack.extend(map.values()),
            Value::Null | Value::Bool(_) | Value::Number(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const RAYDIUM_AMM: &str = "675kPX9MHTjS2zt1qfr1NYHuzeLXfQM9H24wFSUt1Mp8";
    const WSOL: &str = "So11111111111111111111111111111111111111112";
    const USDC: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";
    const TOKEN_PROGRAM: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";

    #[test]
    fn test_valid_addresses() {
        assert!(is_valid_address(RAYDIUM_AMM));
        assert!(is_valid_address(WSOL));
        assert!(is_valid_address(USDC));
        assert!(is_valid_address("11111111111111111111111111111111"));
    }

    #[test]
    fn test_invalid_addresses() {
        assert!(!is_valid_address(""));
        // '0', 'O', 'I' and 'l' are not in the base-58 alphabet
        assert!(!is_valid_address("0OIl"));
        // Valid base-58, wrong decoded length
        assert!(!is_valid_address("3yZe7d"));
        assert!(!is_valid_address(&format!("{}{}", USDC, USDC)));
        assert!(!is_valid_address("not an address at all!"));
    }

    #[test]
    fn test_token_address_serde_rejects_invalid() {
        let ok: TokenAddress = serde_json::from_value(json!(WSOL)).unwrap();
        assert_eq!(ok.as_str(), WSOL);
        assert!(serde_json::from_value::<TokenAddress>(json!("abc")).is_err());
    }

    #[test]
    fn test_extract_mixed_nested_payload() {
        let tx = json!({
            "slot": 12345,
            "transaction": {
                "signatures": ["5VERv8NMvzbJMEkV8xnrLkEaWRtSz9CosKDYjCJjBRnbJLgp8uirBgmQpjKhoR4tjF3ZpRzrFmBV6UjKdiSZkQUW"],
                "message": {
                    "accountKeys": [RAYDIUM_AMM, WSOL, "short", 42, null],
                    "recentBlockhash": USDC,
                    "header": { "numRequiredSignatures": 1 },
                    "instructions": [
                        { "programIdIndex": 3, "data": "3Bxs4h24hBtQy9rw", "accounts": [0, 1] }
                    ]
                }
            },
            "meta": {
                "err": null,
                "innerInstructions": [
                    {
                        "index": 0,
                        "instructions": [
                            { "programId": TOKEN_PROGRAM, "parsed": { "info": { "mint": WSOL } } }
                        ]
                    }
                ],
                "logMessages": ["Program log: ignored root"]
            }
        });

        let found = extract_token_addresses(Some(&tx));
        let expected: HashSet<TokenAddress> = [RAYDIUM_AMM, WSOL, USDC, TOKEN_PROGRAM]
            .iter()
            .map(|a| TokenAddress::parse(a).unwrap())
            .collect();
        assert_eq!(found, expected);
    }

    #[test]
    fn test_extract_ignores_other_roots() {
        let tx = json!({
            "meta": { "postTokenBalances": [{ "mint": USDC }] },
            "blockTime": RAYDIUM_AMM
        });
        assert!(extract_token_addresses(Some(&tx)).is_empty());
    }

    #[test]
    fn test_extract_absent_and_partial() {
        assert!(extract_token_addresses(None).is_empty());
        assert!(extract_token_addresses(Some(&Value::Null)).is_empty());
        assert!(extract_token_addresses(Some(&json!({ "transaction": null }))).is_empty());
        assert!(extract_token_addresses(Some(&json!({ "meta": { "innerInstructions": null } }))).is_empty());
    }

    #[test]
    fn test_extract_deep_nesting_does_not_overflow() {
        let mut nested = json!(WSOL);
        for _ in 0..2_000 {
            nested = json!([nested]);
        }
        let tx = json!({ "meta": { "innerInstructions": nested } });
        let found = extract_token_addresses(Some(&tx));
        assert_eq!(found.len(), 1);
    }
}
