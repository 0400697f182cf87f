use crate::ledger::Ledger;
use crate::types::{MAX_MEMPOOL_SIZE, MAX_TX_AGE, Transaction};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Admission rejections. Surfaced to the caller with a reason; never logged
/// at error level.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum MempoolError {
    #[error("Malformed transaction field: {0}")]
    Malformed(&'static str),
    #[error("Transaction already exists")]
    Duplicate,
    #[error("Insufficient balance: have {have}, need {need}")]
    InsufficientBalance { have: u64, need: u64 },
}

#[derive(Clone, Copy, Debug)]
pub struct MempoolConfig {
    pub max_size: usize,
    pub max_age: Duration,
    pub gas_price: u64,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_size: MAX_MEMPOOL_SIZE,
            max_age: MAX_TX_AGE,
            gas_price: crate::types::DEFAULT_GAS_PRICE,
        }
    }
}

#[derive(Default)]
struct Inner {
    txs: HashMap<String, Transaction>,
    admitted: HashMap<String, Instant>,
}

/// Bounded fee-prioritized pool of admitted but unmined transactions.
/// Keyed on the transaction hash; insertion order is irrelevant.
pub struct Mempool {
    cfg: MempoolConfig,
    ledger: Arc<Ledger>,
    inner: RwLock<Inner>,
}

impl Mempool {
    pub fn new(cfg: MempoolConfig, ledger: Arc<Ledger>) -> Self {
        Self {
            cfg,
            ledger,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Admit a transaction. The fee is recomputed from `gasLimit`, never
    /// trusted from the wire. At capacity the lowest fee-density tail is
    /// shed before the admission attempt.
    pub fn add(&self, mut tx: Transaction) -> Result<(), MempoolError> {
        tx.check_shape().map_err(MempoolError::Malformed)?;
        tx.fee = tx.gas_limit.saturating_mul(self.cfg.gas_price);

        let mut inner = self.inner.write().unwrap();
        if inner.txs.contains_key(&tx.hash) {
            return Err(MempoolError::Duplicate);
        }

        let need = tx.amount.saturating_add(tx.fee);
        let have = self.ledger.balance_of(&tx.from);
        if have < need {
            return Err(MempoolError::InsufficientBalance { have, need });
        }

        if inner.txs.len() >= self.cfg.max_size {
            Self::shed(&mut inner);
        }

        inner.admitted.insert(tx.hash.clone(), Instant::now());
        inner.txs.insert(tx.hash.clone(), tx);
        Ok(())
    }

    /// Drop the lowest 10% (ceiling) by fee density.
    fn shed(inner: &mut Inner) {
        let mut ordered: Vec<(String, u64, u64)> = inner
            .txs
            .values()
            .map(|t| (t.hash.clone(), t.fee, t.size))
            .collect();
        ordered.sort_by(|a, b| cmp_fee_density(a.1, a.2, b.1, b.2).then_with(|| a.0.cmp(&b.0)));

        let victims = inner.txs.len().div_ceil(10);
        for (hash, _, _) in ordered.into_iter().take(victims) {
            inner.txs.remove(&hash);
            inner.admitted.remove(&hash);
        }
        log::info!("Mempool full; shed {victims} low-fee transactions");
    }

    /// The `max_n` highest fee-density entries, tie-broken by hash ascending.
    pub fn pick(&self, max_n: usize) -> Vec<Transaction> {
        let inner = self.inner.read().unwrap();
        let mut all: Vec<&Transaction> = inner.txs.values().collect();
        all.sort_by(|a, b| {
            cmp_fee_density(b.fee, b.size, a.fee, a.size).then_with(|| a.hash.cmp(&b.hash))
        });
        all.into_iter().take(max_n).cloned().collect()
    }

    /// Remove entries included in a finalized block.
    pub fn remove(&self, hashes: &[String]) {
        let mut inner = self.inner.write().unwrap();
        for hash in hashes {
            inner.txs.remove(hash);
            inner.admitted.remove(hash);
        }
    }

    /// Evict entries older than the configured age. Idempotent.
    pub fn sweep(&self) -> usize {
        let max_age = self.cfg.max_age;
        let mut inner = self.inner.write().unwrap();
        let expired: Vec<String> = inner
            .admitted
            .iter()
            .filter(|(_, at)| at.elapsed() >= max_age)
            .map(|(h, _)| h.clone())
            .collect();
        for hash in &expired {
            inner.txs.remove(hash);
            inner.admitted.remove(hash);
        }
        if !expired.is_empty() {
            log::info!("Mempool sweep evicted {} aged transactions", expired.len());
        }
        expired.len()
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.inner.read().unwrap().txs.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().txs.is_empty()
    }
}

/// Compare fee densities `a_fee/a_size` vs `b_fee/b_size` without floats.
fn cmp_fee_density(a_fee: u64, a_size: u64, b_fee: u64, b_size: u64) -> Ordering {
    (a_fee as u128 * b_size as u128).cmp(&(b_fee as u128 * a_size as u128))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn test_pool(max_size: usize) -> Mempool {
        let ledger = Arc::new(Ledger::new(Arc::new(MemoryStore::new()), 50, 21_000_000));
        let cfg = MempoolConfig {
            max_size,
            max_age: Duration::from_secs(60),
            gas_price: 10,
        };
        Mempool::new(cfg, ledger)
    }

    async fn funded_pool(max_size: usize, balance: u64) -> Mempool {
        let pool = test_pool(max_size);
        pool.ledger.credit("alice", balance).await.unwrap();
        pool
    }

    fn tx(hash: &str, gas_limit: u64, size: u64) -> Transaction {
        Transaction {
            hash: hash.into(),
            from: "alice".into(),
            to: "bob".into(),
            amount: 1,
            gas_limit,
            size,
            fee: 0,
        }
    }

    #[tokio::test]
    async fn test_add_rejects_duplicates() {
        let pool = funded_pool(100, 1_000_000).await;
        pool.add(tx("aa", 5, 10)).unwrap();
        assert_eq!(pool.add(tx("aa", 5, 10)).unwrap_err(), MempoolError::Duplicate);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_add_rejects_malformed_and_underfunded() {
        let pool = funded_pool(100, 40).await;

        let mut bad = tx("zz-not-hex", 1, 1);
        bad.hash = "nothex!".into();
        assert!(matches!(pool.add(bad), Err(MempoolError::Malformed("hash"))));

        let mut no_to = tx("aa", 1, 1);
        no_to.to = String::new();
        assert!(matches!(pool.add(no_to), Err(MempoolError::Malformed("to"))));

        // amount 1 + fee 100 > balance 40
        assert!(matches!(
            pool.add(tx("bb", 10, 1)),
            Err(MempoolError::InsufficientBalance { have: 40, need: 101 })
        ));
    }

    #[tokio::test]
    async fn test_fee_is_derived_not_trusted() {
        let pool = funded_pool(100, 1_000_000).await;
        let mut t = tx("aa", 7, 1);
        t.fee = 999_999;
        pool.add(t).unwrap();
        let picked = pool.pick(1);
        assert_eq!(picked[0].fee, 70);
    }

    #[tokio::test]
    async fn test_pick_orders_by_fee_density_with_hash_tiebreak() {
        let pool = funded_pool(100, 1_000_000).await;
        pool.add(tx("cc", 10, 10)).unwrap(); // density 10
        pool.add(tx("aa", 30, 10)).unwrap(); // density 30
        pool.add(tx("bb", 30, 10)).unwrap(); // density 30, later hash

        let picked = pool.pick(3);
        let hashes: Vec<&str> = picked.iter().map(|t| t.hash.as_str()).collect();
        assert_eq!(hashes, vec!["aa", "bb", "cc"]);

        assert_eq!(pool.pick(1).len(), 1);
    }

    #[tokio::test]
    async fn test_shedding_drops_ten_percent_then_admits() {
        let pool = funded_pool(20, 1_000_000).await;
        for i in 0..20 {
            // Fee density climbs with i; "t00" and "t01" are cheapest.
            pool.add(tx(&format!("aa{i:02}"), (i + 1) * 10, 10)).unwrap();
        }
        assert_eq!(pool.len(), 20);

        // At capacity: ceil(20 * 0.1) = 2 shed, then the new entry admits.
        pool.add(tx("ff", 500, 10)).unwrap();
        assert_eq!(pool.len(), 19);
        assert!(!pool.contains("aa00"));
        assert!(!pool.contains("aa01"));
        assert!(pool.contains("ff"));
    }

    #[tokio::test]
    async fn test_sweep_removes_aged_entries() {
        let ledger = Arc::new(Ledger::new(Arc::new(MemoryStore::new()), 50, 21_000_000));
        ledger.credit("alice", 1_000_000).await.unwrap();
        let pool = Mempool::new(
            MempoolConfig {
                max_size: 100,
                max_age: Duration::ZERO,
                gas_price: 10,
            },
            ledger,
        );
        pool.add(tx("aa", 5, 10)).unwrap();

        // Zero max age: everything is already expired.
        assert_eq!(pool.sweep(), 1);
        assert!(pool.is_empty());
        assert_eq!(pool.sweep(), 0);
    }
}
