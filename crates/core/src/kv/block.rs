use blis_types::RequestId;
use rustc_hash::FxHasher;
use std::hash::Hasher;

/// Chained content hash of a KV block. Equal hashes mean semantically equal
/// prefixes: `hash(b_i) = H(hash(b_{i-1}) ‖ tokens_i)` with `hash(b_{-1}) = 0`.
pub type BlockHash = u64;

/// Which memory the block currently lives in.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Tier {
    Gpu,
    Cpu,
}

/// Chain the previous block's hash with this block's token content.
pub fn chain_hash(prev: BlockHash, tokens: &[u64]) -> BlockHash {
    let mut hasher = FxHasher::default();
    hasher.write_u64(prev);
    for token in tokens {
        hasher.write_u64(*token);
    }
    hasher.finish()
}

/// Chained hashes for a full input-token sequence, one per block. The final
/// partial block is hashed over its actual content.
pub fn input_block_hashes(tokens: &[u64], block_size: usize) -> Vec<BlockHash> {
    let mut hashes = Vec::with_capacity(tokens.len().div_ceil(block_size));
    let mut prev = 0;
    for chunk in tokens.chunks(block_size) {
        prev = chain_hash(prev, chunk);
        hashes.push(prev);
    }
    hashes
}

/// Hash for a decode-phase block. Decode content is unique to the request,
/// so the chain is extended with the request id and block index; the
/// resulting blocks intern like any other but can never be shared.
pub fn decode_block_hash(prev: BlockHash, request: RequestId, block_index: usize) -> BlockHash {
    chain_hash(prev, &[request.0, block_index as u64])
}

/// The full per-block hash list a request needs to cover `total_tokens`
/// tokens of KV: its input-block hashes up to the prefill boundary, then
/// request-unique decode blocks.
pub fn target_hashes(
    input_hashes: &[BlockHash],
    request: RequestId,
    total_tokens: usize,
    block_size: usize,
) -> Vec<BlockHash> {
    let blocks = total_tokens.div_ceil(block_size);
    let mut hashes = Vec::with_capacity(blocks);
    hashes.extend_from_slice(&input_hashes[..blocks.min(input_hashes.len())]);
    let mut prev = hashes.last().copied().unwrap_or(0);
    for index in hashes.len()..blocks {
        prev = decode_block_hash(prev, request, index);
        hashes.push(prev);
    }
    hashes
}

/// Per-block bookkeeping. A block with `ref_count > 0` is pinned: it can
/// never be an eviction victim.
#[derive(Clone, Debug)]
pub struct BlockMeta {
    pub hash: Option<BlockHash>,
    pub ref_count: u32,
    pub in_use: bool,
    /// Logical LRU stamp; smaller means colder.
    pub last_used: u64,
    pub tier: Tier,
}

impl BlockMeta {
    pub fn blank(tier: Tier) -> Self {
        Self {
            hash: None,
            ref_count: 0,
            in_use: false,
            last_used: 0,
            tier,
        }
    }
}
