//! `getblocktemplate` response model.

use serde::{Deserialize, Serialize};

/// Response from `getblocktemplate {"rules":["segwit"]}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockTemplate {
    pub version: i32,
    #[serde(rename = "previousblockhash")]
    pub previous_block_hash: String,
    #[serde(default)]
    pub transactions: Vec<TemplateTransaction>,
    #[serde(rename = "coinbasevalue")]
    pub coinbase_value: i64,
    pub target: String,
    #[serde(rename = "curtime")]
    pub cur_time: i64,
    pub bits: String,
    pub height: i64,
    #[serde(rename = "default_witness_commitment", default)]
    pub default_witness_commitment: String,
    #[serde(rename = "mintime", default)]
    pub min_time: i64,
    #[serde(default)]
    pub mutable: Vec<String>,
}

/// A transaction entry inside a block template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateTransaction {
    /// Raw transaction hex, as it must appear in the block.
    pub data: String,
    /// Display-order txid hex.
    pub txid: String,
    /// Display-order wtxid hex.
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub fee: i64,
    #[serde(default)]
    pub weight: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_deserializes_core_fields() {
        let json = r#"{
            "version": 536870912,
            "previousblockhash": "0000000000000003fa0d845513ea5014a7859d411f5f4a91eaab24eb47a18f39",
            "transactions": [
                {"data": "0100", "txid": "aa", "hash": "bb", "fee": 1000, "weight": 400}
            ],
            "coinbasevalue": 5000000000,
            "target": "00000000ffff0000000000000000000000000000000000000000000000000000",
            "curtime": 1700000000,
            "bits": "1d00ffff",
            "height": 800000,
            "default_witness_commitment": "6a24aa21a9ed"
        }"#;

        let tmpl: BlockTemplate = serde_json::from_str(json).unwrap();
        assert_eq!(tmpl.height, 800_000);
        assert_eq!(tmpl.coinbase_value, 5_000_000_000);
        assert_eq!(tmpl.bits, "1d00ffff");
        assert_eq!(tmpl.transactions.len(), 1);
        assert_eq!(tmpl.transactions[0].fee, 1000);
    }

    #[test]
    fn test_template_tolerates_missing_optionals() {
        let json = r#"{
            "version": 1,
            "previousblockhash": "00",
            "coinbasevalue": 1,
            "target": "00",
            "curtime": 0,
            "bits": "1d00ffff",
            "height": 1
        }"#;
        let tmpl: BlockTemplate = serde_json::from_str(json).unwrap();
        assert!(tmpl.transactions.is_empty());
        assert!(tmpl.default_witness_commitment.is_empty());
    }
}
