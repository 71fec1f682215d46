/// Block template as served by the node's `getblocktemplate`

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::difficulty::{difficulty_from_compact, expand_compact, format_target, parse_compact};

/// Hex length of the header prefix that ends with `nBits`
/// (version 4 + prev hash 32 + merkle root 32 + time 4 + bits 4 bytes).
pub const HEADER_THROUGH_BITS_HEX: usize = 152;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockTemplate {
    pub height: u64,
    pub prev_hash: String,
    /// Compact difficulty, 8 hex digits without prefix.
    pub nbits: String,
    /// Full 256-bit block target.
    pub expanded: String,
    /// Serialized candidate block.
    pub blockhex: String,
    /// Unix seconds when the pool received the template.
    pub timestamp: u64,
}

impl BlockTemplate {
    /// Parse from RPC response
    pub fn from_rpc_response(value: &serde_json::Value) -> Result<Self> {
        let str_field = |names: &[&str]| -> Option<String> {
            names
                .iter()
                .find_map(|n| value.get(*n).and_then(|v| v.as_str()))
                .map(|s| s.trim().trim_start_matches("0x").to_lowercase())
        };

        let nbits = str_field(&["nbits", "bits"]).ok_or_else(|| anyhow!("template has no nbits"))?;
        let bits = parse_compact(&nbits).ok_or_else(|| anyhow!("invalid template nbits '{}'", nbits))?;

        let blockhex = str_field(&["blockhex"]).ok_or_else(|| anyhow!("template has no blockhex"))?;
        if blockhex.len() < HEADER_THROUGH_BITS_HEX || !blockhex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(anyhow!("template blockhex is malformed ({} chars)", blockhex.len()));
        }

        let expanded = str_field(&["expanded", "target"])
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format_target(&expand_compact(bits)));

        Ok(Self {
            height: value.get("height").and_then(|v| v.as_u64()).unwrap_or(0),
            prev_hash: str_field(&["previousblockhash", "prev_hash"]).unwrap_or_default(),
            nbits: format!("{:08x}", bits),
            expanded,
            blockhex,
            timestamp: chrono::Utc::now().timestamp().max(0) as u64,
        })
    }

    pub fn compact_bits(&self) -> u32 {
        parse_compact(&self.nbits).unwrap_or(0)
    }

    /// Network difficulty for this template, never below 1.
    pub fn block_difficulty(&self) -> f64 {
        difficulty_from_compact(self.compact_bits())
    }

    /// Job payload: the header prefix through `nBits`.
    pub fn job_data(&self) -> &str {
        &self.blockhex[..HEADER_THROUGH_BITS_HEX.min(self.blockhex.len())]
    }

    /// True when both templates describe the same candidate block.
    pub fn same_work(&self, other: &BlockTemplate) -> bool {
        self.height == other.height && self.prev_hash == other.prev_hash && self.blockhex == other.blockhex
    }
}
