//! Shared fixtures: regtest chains, nonce grinding and signing keys

#![allow(dead_code)]

use bitscoin_consensus::block::compute_merkle_root;
use bitscoin_consensus::chainstate::genesis_block;
use bitscoin_consensus::economic::get_block_subsidy;
use bitscoin_consensus::pow::{check_proof_of_work, get_next_work_required};
use bitscoin_consensus::script::{hash160, p2pkh_script, signature_hash, Builder, SIGHASH_ALL};
use bitscoin_consensus::*;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct FixedTime(pub u64);

impl TimeSource for FixedTime {
    fn now(&self) -> u64 {
        self.0
    }
}

/// A clock far enough past genesis that test chains never look future-dated
pub fn clock_for(params: &ChainParams) -> FixedTime {
    FixedTime(params.genesis_timestamp as u64 + 100_000_000)
}

pub struct Key {
    secret: SecretKey,
    pub pubkey: PublicKey,
}

impl Key {
    pub fn new(seed: u8) -> Self {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[seed.max(1); 32]).unwrap();
        let pubkey = PublicKey::from_secret_key(&secp, &secret);
        Self { secret, pubkey }
    }

    pub fn script_pubkey(&self) -> ByteString {
        p2pkh_script(&hash160(&self.pubkey.serialize()))
    }

    /// Fill in a P2PKH unlocking script for input `index`
    pub fn sign_input(&self, tx: &mut Transaction, index: usize) {
        let secp = Secp256k1::new();
        let digest = signature_hash(&self.script_pubkey(), tx, index, SIGHASH_ALL);
        let message = Message::from_digest_slice(&digest).unwrap();
        let mut sig = secp.sign_ecdsa(&message, &self.secret).serialize_der().to_vec();
        sig.push(SIGHASH_ALL as u8);
        tx.inputs[index].script_sig = Builder::new()
            .push_slice(&sig)
            .push_slice(&self.pubkey.serialize())
            .into_script();
    }
}

/// Spend `prevouts` (all locked to `key`) into the given outputs, signed
pub fn signed_spend(key: &Key, prevouts: &[OutPoint], outputs: Vec<TransactionOutput>, sequence: u32) -> Transaction {
    let mut tx = Transaction {
        version: 2,
        inputs: prevouts
            .iter()
            .map(|prevout| TransactionInput { prevout: *prevout, script_sig: vec![], sequence })
            .collect(),
        outputs,
        lock_time: 0,
    };
    for index in 0..tx.inputs.len() {
        key.sign_input(&mut tx, index);
    }
    tx
}

pub fn pay(key: &Key, value: Amount) -> TransactionOutput {
    TransactionOutput { value, script_pubkey: key.script_pubkey() }
}

/// One branch of headers grown from genesis, used to assemble valid blocks
#[derive(Clone)]
pub struct Branch {
    pub params: ChainParams,
    /// Index is height; genesis first
    headers: Vec<BlockHeader>,
    tag: u8,
}

impl Branch {
    pub fn new(params: &ChainParams, tag: u8) -> Self {
        Self { params: params.clone(), headers: vec![genesis_block(params).header], tag }
    }

    /// A new branch sharing this one up to `height`
    pub fn fork_at(&self, height: u64, tag: u8) -> Self {
        let mut headers = self.headers.clone();
        headers.truncate(height as usize + 1);
        Self { params: self.params.clone(), headers, tag }
    }

    pub fn height(&self) -> u64 {
        (self.headers.len() - 1) as u64
    }

    pub fn tip_hash(&self) -> Hash {
        self.headers[self.headers.len() - 1].hash()
    }

    /// Next block paying subsidy plus `fees` to `payout`, ten minutes after the tip
    pub fn next(&mut self, payout: &ByteString, txs: Vec<Transaction>, fees: Amount) -> Block {
        self.next_with(payout, txs, fees, 600)
    }

    pub fn next_with(&mut self, payout: &ByteString, txs: Vec<Transaction>, fees: Amount, spacing: u32) -> Block {
        let height = self.headers.len() as u64;
        let coinbase = coinbase(height, self.tag, payout, get_block_subsidy(height, &self.params) + fees);
        self.assemble(coinbase, txs, spacing)
    }

    /// Assemble and grind a block on top of the tip with an explicit coinbase
    pub fn assemble(&mut self, coinbase: Transaction, txs: Vec<Transaction>, spacing: u32) -> Block {
        let prev_height = self.height();
        let prev = self.headers[prev_height as usize].clone();
        let headers = &self.headers;
        let bits = get_next_work_required(
            prev_height,
            &prev,
            |height| headers.get(height as usize).map(|header| header.timestamp),
            &self.params,
        )
        .unwrap();

        let mut transactions = vec![coinbase];
        transactions.extend(txs);
        let txids: Vec<Hash> = transactions.iter().map(Transaction::txid).collect();
        let mut block = Block {
            header: BlockHeader {
                prev_block_hash: prev.hash(),
                merkle_root: compute_merkle_root(&txids).0,
                timestamp: prev.timestamp + spacing,
                bits,
                nonce: 0,
                version: 1,
            },
            transactions,
        };
        grind(&mut block, &self.params);
        self.headers.push(block.header.clone());
        block
    }

    pub fn extend(&mut self, count: usize, payout: &ByteString) -> Vec<Block> {
        (0..count).map(|_| self.next(payout, vec![], 0)).collect()
    }
}

pub fn coinbase(height: u64, tag: u8, payout: &ByteString, value: Amount) -> Transaction {
    let mut script_sig = height.to_be_bytes().to_vec();
    script_sig.push(tag);
    Transaction {
        version: 1,
        inputs: vec![TransactionInput {
            prevout: OutPoint::null(),
            script_sig,
            sequence: SEQUENCE_FINAL,
        }],
        outputs: vec![TransactionOutput { value, script_pubkey: payout.clone() }],
        lock_time: 0,
    }
}

pub fn grind(block: &mut Block, params: &ChainParams) {
    while check_proof_of_work(&block.hash(), block.header.bits, params).is_err() {
        block.header.nonce += 1;
    }
}

pub fn coinbase_outpoint(block: &Block) -> OutPoint {
    OutPoint::new(block.transactions[0].txid(), 0)
}
