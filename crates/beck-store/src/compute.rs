//! Worker pool for parallel merkle tree construction.
//!
//! A fixed set of workers drains an unbounded job queue. [`ComputePool::compute`]
//! blocks its caller until the tree is complete, internally fanning leaf
//! hashing and large-layer reduction out across the workers. Small inputs
//! skip the pool entirely; queueing costs more than hashing them inline.
//!
//! The pool is shared by every concurrent factory caller and carries no
//! cancellation: a submitted computation runs to completion.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use parking_lot::{Condvar, Mutex};

use beck_core::merkle::{self, MerkleTree};
use beck_core::types::{Block, Hash256};

/// Blocks below this transaction count are hashed on the calling thread.
const PARALLEL_LEAF_THRESHOLD: usize = 128;

/// Layers below this hash count are reduced on the calling thread.
const PARALLEL_NODE_THRESHOLD: usize = 256;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolShared {
    queue: Mutex<VecDeque<Job>>,
    job_ready: Condvar,
    shutdown: AtomicBool,
}

/// Fixed-size worker pool exposing blocking tree computation.
pub struct ComputePool {
    shared: Arc<PoolShared>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl ComputePool {
    /// Spawn a pool with `threads` workers (at least one).
    pub fn new(threads: usize) -> io::Result<Self> {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            job_ready: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(threads.max(1));
        for i in 0..threads.max(1) {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("merkle-compute-{i}"))
                .spawn(move || worker_loop(shared))?;
            workers.push(handle);
        }

        Ok(Self { shared, workers })
    }

    /// Number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Build the merkle tree for `block`, blocking until it is complete.
    pub fn compute(&self, block: &Arc<Block>) -> MerkleTree {
        let count = block.transactions.len();
        if self.workers.len() <= 1 || count < PARALLEL_LEAF_THRESHOLD {
            return MerkleTree::from_leaves(&block.txids());
        }

        let (leaves, leaf_layer) = self.hash_leaves(block);

        let mut layers: Vec<Vec<Hash256>> = Vec::new();
        let mut current = Arc::new(leaf_layer);
        loop {
            let len = current.len();
            let next = if len <= 1 {
                None
            } else if len < PARALLEL_NODE_THRESHOLD {
                Some(merkle::next_layer(&current))
            } else {
                Some(self.reduce_layer(&current))
            };
            // The workers have sent their results, so the Arc is unique here.
            layers.push(Arc::try_unwrap(current).unwrap_or_else(|shared| (*shared).clone()));
            match next {
                Some(layer) => current = Arc::new(layer),
                None => break,
            }
        }

        MerkleTree::from_parts(leaves, layers)
    }

    /// Compute txids and leaf hashes across the workers, in block order.
    fn hash_leaves(&self, block: &Arc<Block>) -> (Vec<Hash256>, Vec<Hash256>) {
        let count = block.transactions.len();
        let chunk = count.div_ceil(self.workers.len());
        let chunks = count.div_ceil(chunk);

        let (sender, receiver) = mpsc::channel();
        for ci in 0..chunks {
            let block = Arc::clone(block);
            let sender = sender.clone();
            self.execute(Box::new(move || {
                let start = ci * chunk;
                let end = (start + chunk).min(block.transactions.len());
                let mut ids = Vec::with_capacity(end - start);
                let mut hashes = Vec::with_capacity(end - start);
                for tx in &block.transactions[start..end] {
                    let id = tx.txid();
                    hashes.push(merkle::leaf_hash(&id));
                    ids.push(id);
                }
                let _ = sender.send((ci, ids, hashes));
            }));
        }
        drop(sender);

        let mut parts: Vec<Option<(Vec<Hash256>, Vec<Hash256>)>> =
            (0..chunks).map(|_| None).collect();
        for _ in 0..chunks {
            let (ci, ids, hashes) = receiver
                .recv()
                .expect("tree computation worker terminated");
            parts[ci] = Some((ids, hashes));
        }

        let mut leaves = Vec::with_capacity(count);
        let mut layer = Vec::with_capacity(count);
        for (ids, hashes) in parts.into_iter().flatten() {
            leaves.extend(ids);
            layer.extend(hashes);
        }
        (leaves, layer)
    }

    /// Reduce one layer to the next across the workers.
    ///
    /// Chunks are split on pair boundaries so only the final pair of the
    /// whole layer can be the odd, self-duplicating one.
    fn reduce_layer(&self, layer: &Arc<Vec<Hash256>>) -> Vec<Hash256> {
        let pairs = layer.len().div_ceil(2);
        let chunk = pairs.div_ceil(self.workers.len());
        let chunks = pairs.div_ceil(chunk);

        let (sender, receiver) = mpsc::channel();
        for ci in 0..chunks {
            let layer = Arc::clone(layer);
            let sender = sender.clone();
            self.execute(Box::new(move || {
                let start = ci * chunk;
                let end = (start + chunk).min(layer.len().div_ceil(2));
                let mut out = Vec::with_capacity(end - start);
                for pair in start..end {
                    let left = &layer[2 * pair];
                    let right = layer.get(2 * pair + 1).unwrap_or(left);
                    out.push(merkle::node_hash(left, right));
                }
                let _ = sender.send((ci, out));
            }));
        }
        drop(sender);

        let mut parts: Vec<Option<Vec<Hash256>>> = (0..chunks).map(|_| None).collect();
        for _ in 0..chunks {
            let (ci, out) = receiver
                .recv()
                .expect("tree computation worker terminated");
            parts[ci] = Some(out);
        }

        let mut next = Vec::with_capacity(pairs);
        for part in parts.into_iter().flatten() {
            next.extend(part);
        }
        next
    }

    fn execute(&self, job: Job) {
        self.shared.queue.lock().push_back(job);
        self.shared.job_ready.notify_one();
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.pop_front() {
                    break job;
                }
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                shared.job_ready.wait(&mut queue);
            }
        };
        job();
    }
}

impl Drop for ComputePool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.job_ready.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}
