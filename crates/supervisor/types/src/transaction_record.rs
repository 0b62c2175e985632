use serde::{Deserialize, Serialize};

/// A decoded function call against a transaction's call data, when a decoder resolves one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedCall {
    /// Resolved function name or signature, e.g. `"transfer(address,uint256)"`.
    pub function: String,
    /// Decoded parameters, keyed by parameter name.
    pub parameters: serde_json::Value,
}

/// One transaction, fully materialized by a `BlockFetcher` and handed to its `ArrowWriter`.
///
/// `value`/`gas` round-trip through either a `0x`-prefixed hex string or a bare number on
/// the wire (see `ekko_serde::quantity`), matching the shape node RPCs actually return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Hash of the block this transaction was included in.
    pub block_hash: String,
    /// Height of the block this transaction was included in.
    pub block_number: u64,
    /// Transaction hash.
    pub tx_hash: String,
    /// Sending address.
    pub from: String,
    /// Receiving address; `None` for contract-creation transactions.
    pub to: Option<String>,
    /// Transferred value, in the chain's native unit.
    #[serde(with = "ekko_serde::quantity")]
    pub value: u128,
    /// Gas used (or gas limit, if the upstream only reports that).
    #[serde(with = "ekko_serde::quantity")]
    pub gas: u64,
    /// Decoded call, when a decoder resolved the call data; `None` on a decoder miss.
    #[serde(default)]
    pub decoded_call: Option<DecodedCall>,
    /// Network component of this transaction's provenance triple.
    pub network: String,
    /// Subnet component of this transaction's provenance triple.
    pub subnet: String,
    /// VM-type component of this transaction's provenance triple, as its canonical string.
    pub vm_type: String,
    /// Id of the node this record was fetched from.
    pub node_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TransactionRecord {
        TransactionRecord {
            block_hash: "0xabc".into(),
            block_number: 10,
            tx_hash: "0x123".into(),
            from: "0xfrom".into(),
            to: Some("0xto".into()),
            value: 1_000_000_000_000_000_000,
            gas: 21_000,
            decoded_call: None,
            network: "ethereum".into(),
            subnet: "mainnet".into(),
            vm_type: "evm".into(),
            node_id: "n1".into(),
        }
    }

    #[test]
    fn value_and_gas_serialize_as_hex_quantities() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(value["value"], "0xde0b6b3a7640000");
        assert_eq!(value["gas"], "0x5208");
    }

    #[test]
    fn accepts_bare_number_quantities_on_read() {
        let mut raw = serde_json::to_value(sample()).unwrap();
        raw["gas"] = serde_json::json!(21000);
        let parsed: TransactionRecord = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.gas, 21_000);
    }
}
