//! Test data generators for integration tests.
//!
//! Builds deterministic chains, forks and state tries. Every generated
//! block commits to a real body, real receipts and the state trie root, so
//! honest peers serving this data pass every check the sync core makes.

use ec_network::{
    list_root, receipts_root, Block, BlockBody, Capabilities, Hash, Head, Header, PeerId,
    PeerInfo, Receipt, StateNode, MAX_NODE_CHILDREN,
};
use std::collections::HashMap;

/// Protocol version advertised by generated peers.
pub const TEST_PROTOCOL_VERSION: u32 = 66;

/// Content-addressed state trie.
#[derive(Debug, Clone)]
pub struct StateTrie {
    /// Root hash.
    pub root: Hash,
    /// Encoded nodes by hash.
    pub nodes: HashMap<Hash, Vec<u8>>,
}

impl StateTrie {
    /// Build a trie over `leaves` values with at most `fanout` children per node.
    pub fn build(seed: u64, leaves: usize, fanout: usize) -> Self {
        let fanout = fanout.clamp(2, MAX_NODE_CHILDREN);
        let mut nodes = HashMap::new();
        let mut level: Vec<Hash> = (0..leaves.max(1))
            .map(|i| {
                let node = StateNode {
                    children: vec![],
                    value: format!("leaf-{}-{}", seed, i).into_bytes(),
                };
                let hash = node.hash();
                nodes.insert(hash, node.encode());
                hash
            })
            .collect();

        while level.len() > 1 {
            level = level
                .chunks(fanout)
                .enumerate()
                .map(|(i, children)| {
                    let node = StateNode {
                        children: children.to_vec(),
                        value: format!("branch-{}", i).into_bytes(),
                    };
                    let hash = node.hash();
                    nodes.insert(hash, node.encode());
                    hash
                })
                .collect();
        }

        Self {
            root: level[0],
            nodes,
        }
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the trie has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// A generated chain: blocks and receipts indexed by number.
#[derive(Debug, Clone)]
pub struct TestChain {
    /// Blocks from genesis.
    pub blocks: Vec<Block>,
    /// Receipts per block.
    pub receipts: Vec<Vec<Receipt>>,
    /// State every block commits to.
    pub state: StateTrie,
}

impl TestChain {
    /// Head block number.
    pub fn height(&self) -> u64 {
        self.blocks.len() as u64 - 1
    }

    /// Block at `number`.
    pub fn block(&self, number: u64) -> Option<&Block> {
        self.blocks.get(number as usize)
    }

    /// Block with `hash`.
    pub fn block_by_hash(&self, hash: &Hash) -> Option<&Block> {
        self.blocks.iter().find(|b| b.hash() == *hash)
    }

    /// Receipts of the block with `hash`.
    pub fn receipts_by_hash(&self, hash: &Hash) -> Option<&Vec<Receipt>> {
        self.blocks
            .iter()
            .position(|b| b.hash() == *hash)
            .map(|i| &self.receipts[i])
    }

    /// Head advertised when serving up to `height`.
    pub fn head_at(&self, height: u64) -> Head {
        let header = &self.blocks[height as usize].header;
        header.to_head(total_difficulty(&self.blocks[..=height as usize]))
    }

    /// Copy truncated to `height`.
    pub fn truncated(&self, height: u64) -> TestChain {
        let end = height as usize + 1;
        TestChain {
            blocks: self.blocks[..end].to_vec(),
            receipts: self.receipts[..end].to_vec(),
            state: self.state.clone(),
        }
    }
}

fn total_difficulty(blocks: &[Block]) -> u128 {
    blocks.iter().map(|b| b.header.difficulty).sum()
}

/// Block `number` on top of `parent`.
pub fn make_block(number: u64, parent: Hash, seed: u64, state_root: Hash) -> (Block, Vec<Receipt>) {
    let transactions: Vec<Vec<u8>> = (0..number % 3)
        .map(|i| format!("tx-{}-{}-{}", seed, number, i).into_bytes())
        .collect();
    let receipts: Vec<Receipt> = transactions
        .iter()
        .map(|tx| Receipt {
            data: Hash::digest(tx).0.to_vec(),
        })
        .collect();
    let header = Header {
        number,
        parent_hash: parent,
        difficulty: 1_000 + number as u128,
        state_root,
        tx_root: list_root(&transactions),
        receipt_root: receipts_root(&receipts),
        extra: seed.to_be_bytes().to_vec(),
    };
    (Block::new(header, BlockBody { transactions }), receipts)
}

/// Chain of `height + 1` blocks starting at genesis.
pub fn build_chain(height: u64, seed: u64) -> TestChain {
    let state = StateTrie::build(seed, 40, 4);
    let (genesis, receipts) = make_block(0, Hash::ZERO, 0, state.root);
    let chain = TestChain {
        blocks: vec![genesis],
        receipts: vec![receipts],
        state,
    };
    extend_chain(&chain, 0, height, seed)
}

/// Copy of `base` up to `fork_at`, then new blocks up to `height` built
/// with `seed`.
pub fn extend_chain(base: &TestChain, fork_at: u64, height: u64, seed: u64) -> TestChain {
    let mut chain = base.truncated(fork_at);
    for number in fork_at + 1..=height {
        let parent = chain.blocks[number as usize - 1].hash();
        let (block, receipts) = make_block(number, parent, seed, chain.state.root);
        chain.blocks.push(block);
        chain.receipts.push(receipts);
    }
    chain
}

/// Peer id from a single byte.
pub fn peer_id(n: u8) -> PeerId {
    PeerId::from_bytes(vec![0xEC, n])
}

/// Full-node peer info advertising `chain` at `height`.
pub fn peer_info(n: u8, chain: &TestChain, height: u64) -> PeerInfo {
    peer_info_with(n, chain, height, Capabilities::FULL)
}

/// Peer info with explicit capabilities.
pub fn peer_info_with(n: u8, chain: &TestChain, height: u64, caps: Capabilities) -> PeerInfo {
    PeerInfo::new(peer_id(n), chain.head_at(height), TEST_PROTOCOL_VERSION, caps)
}
