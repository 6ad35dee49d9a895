//! In-memory chain and cluster plumbing shared by the engine tests.

#![allow(dead_code)]

use ibft_engine::Backend;
use ibft_types::{
    crypto, extra, Address, BftConfig, Block, Broadcaster, Bytes, ChainReader, Header, Peer, B256,
};
use secp256k1::SecretKey;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Validator keys sorted by their derived address.
pub fn sorted_keys(n: usize) -> (Vec<SecretKey>, Vec<Address>) {
    let mut keys: Vec<SecretKey> = (0..n)
        .map(|_| SecretKey::new(&mut rand::thread_rng()))
        .collect();
    keys.sort_by_key(crypto::secret_to_address);
    let addresses = keys.iter().map(crypto::secret_to_address).collect();
    (keys, addresses)
}

pub fn genesis_with(validators: &[Address], timestamp: u64) -> Block {
    Block::new(
        Header {
            number: 0,
            timestamp,
            extra: extra::prepare_extra(b"genesis", validators),
            ..Default::default()
        },
        Vec::new(),
    )
}

/// A header sealed by `keys[proposer]` with committed seals from
/// `sealers`, valid on top of `parent`.
pub fn sealed_header(
    parent: &Header,
    validators: &[Address],
    keys: &[SecretKey],
    proposer: usize,
    sealers: &[usize],
    timestamp: u64,
) -> Header {
    let mut header = Header {
        parent_hash: parent.hash(),
        number: parent.number + 1,
        timestamp,
        coinbase: crypto::secret_to_address(&keys[proposer]),
        extra: extra::prepare_extra(&[], validators),
        ..Default::default()
    };

    let seal = crypto::sign_hash(&keys[proposer], extra::sig_hash(&header).unwrap());
    extra::write_seal(&mut header, &seal).unwrap();

    if !sealers.is_empty() {
        let digest = extra::commit_digest(header.hash());
        let seals: Vec<Bytes> = sealers
            .iter()
            .map(|&i| crypto::sign_hash(&keys[i], digest).to_vec().into())
            .collect();
        extra::write_committed_seals(&mut header, &seals).unwrap();
    }
    header
}

/// Append-only canonical chain.
pub struct MockChain {
    blocks: RwLock<Vec<Block>>,
    bad: RwLock<HashSet<B256>>,
}

impl MockChain {
    pub fn new(genesis: Block) -> Arc<Self> {
        Arc::new(Self {
            blocks: RwLock::new(vec![genesis]),
            bad: RwLock::new(HashSet::new()),
        })
    }

    pub fn head(&self) -> Block {
        self.blocks.read().unwrap().last().cloned().unwrap()
    }

    pub fn height(&self) -> u64 {
        self.head().number()
    }

    /// Append a block if it extends the head. Duplicates are ignored.
    pub fn insert(&self, block: Block) -> bool {
        let mut blocks = self.blocks.write().unwrap();
        let head = blocks.last().cloned().unwrap();
        if block.number() == head.number() + 1 && block.header.parent_hash == head.hash() {
            blocks.push(block);
            true
        } else {
            false
        }
    }

    pub fn mark_bad(&self, hash: B256) {
        self.bad.write().unwrap().insert(hash);
    }
}

impl ChainReader for MockChain {
    fn current_block(&self) -> Block {
        self.head()
    }

    fn header(&self, hash: B256, number: u64) -> Option<Header> {
        self.blocks
            .read()
            .unwrap()
            .get(number as usize)
            .map(|block| block.header.clone())
            .filter(|header| header.hash() == hash)
    }

    fn header_by_number(&self, number: u64) -> Option<Header> {
        self.blocks
            .read()
            .unwrap()
            .get(number as usize)
            .map(|block| block.header.clone())
    }

    fn has_bad_block(&self, hash: B256) -> bool {
        self.bad.read().unwrap().contains(&hash)
    }
}

pub struct Node {
    pub secret: SecretKey,
    pub address: Address,
    pub chain: Arc<MockChain>,
    pub backend: Arc<Backend>,
}

#[derive(Default)]
pub struct Registry {
    nodes: RwLock<HashMap<Address, Arc<Node>>>,
}

impl Registry {
    fn get(&self, address: Address) -> Option<Arc<Node>> {
        self.nodes.read().unwrap().get(&address).cloned()
    }
}

/// Peer handle delivering wire payloads straight into the target backend.
struct ClusterPeer {
    src: Address,
    node: Arc<Node>,
}

impl Peer for ClusterPeer {
    fn id(&self) -> String {
        format!("{}", self.node.address)
    }

    fn send(&self, _code: u8, payload: Bytes) -> anyhow::Result<()> {
        self.node.backend.handle_consensus_message(self.src, payload);
        Ok(())
    }
}

/// Broadcaster wired to the cluster registry. `enqueue` plays the fetcher:
/// the finalized block lands in the local chain and the head notification
/// fires.
struct ClusterNet {
    registry: Arc<Registry>,
    local: Address,
}

impl Broadcaster for ClusterNet {
    fn enqueue(&self, _id: &str, block: Block) {
        if let Some(node) = self.registry.get(self.local) {
            if node.chain.insert(block) {
                node.backend.new_chain_head();
            }
        }
    }

    fn find_peers(&self, targets: &[Address]) -> HashMap<Address, Arc<dyn Peer>> {
        let mut peers: HashMap<Address, Arc<dyn Peer>> = HashMap::new();
        for &address in targets {
            if address == self.local {
                continue;
            }
            if let Some(node) = self.registry.get(address) {
                peers.insert(
                    address,
                    Arc::new(ClusterPeer {
                        src: self.local,
                        node,
                    }),
                );
            }
        }
        peers
    }
}

pub struct Cluster {
    pub keys: Vec<SecretKey>,
    pub addresses: Vec<Address>,
    pub nodes: Vec<Arc<Node>>,
    registry: Arc<Registry>,
}

impl Cluster {
    /// Build `n` validator nodes over a shared genesis. Nothing is started.
    pub fn new(n: usize, config: &BftConfig) -> Self {
        let (keys, addresses) = sorted_keys(n);
        let genesis = genesis_with(&addresses, unix_now().saturating_sub(10));
        let registry = Arc::new(Registry::default());

        let nodes: Vec<Arc<Node>> = keys
            .iter()
            .map(|&secret| {
                let chain = MockChain::new(genesis.clone());
                let backend = Backend::new(config.clone(), secret, None);
                backend.set_broadcaster(Arc::new(ClusterNet {
                    registry: Arc::clone(&registry),
                    local: crypto::secret_to_address(&secret),
                }));
                Arc::new(Node {
                    secret,
                    address: crypto::secret_to_address(&secret),
                    chain,
                    backend,
                })
            })
            .collect();

        for node in &nodes {
            registry
                .nodes
                .write()
                .unwrap()
                .insert(node.address, Arc::clone(node));
        }

        Cluster {
            keys,
            addresses,
            nodes,
            registry,
        }
    }

    /// Start every node except the listed ones (offline validators).
    pub async fn start_except(&self, offline: &[usize]) {
        for (index, node) in self.nodes.iter().enumerate() {
            if offline.contains(&index) {
                continue;
            }
            node.backend
                .start(node.chain.clone() as Arc<dyn ChainReader>)
                .await
                .unwrap();
        }
    }

    pub async fn start_all(&self) {
        self.start_except(&[]).await;
    }

    pub async fn stop_all(&self) {
        for node in &self.nodes {
            let _ = node.backend.stop().await;
        }
    }
}

/// Candidate block as a node's miner would assemble it.
pub fn make_candidate(node: &Node) -> Block {
    let head = node.chain.head();
    let mut header = Header {
        parent_hash: head.hash(),
        number: head.number() + 1,
        gas_limit: 8_000_000,
        ..Default::default()
    };
    node.backend.prepare(&*node.chain, &mut header).unwrap();
    node.backend.finalize(&*node.chain, &mut header, Vec::new()).unwrap()
}

/// Poll until `condition` holds or a generous deadline passes.
pub async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}
