//! Randomized simulations of a cache stack over a deliberately sloppy base
//! view, checked against a naive reference model.

use std::collections::{BTreeMap, BTreeSet};

use emberd_coins::{
    access_coin_by_txid, apply_tx_in_undo, update_tx_coins, Coin, CoinsCache, CoinsMap, CoinsView,
};
use emberd_consensus::{Hash256, NULL_HASH};
use emberd_primitives::script::OP_RETURN;
use emberd_primitives::{OutPoint, Transaction, TxIn, TxOut};
use emberd_storage::StoreError;

struct Lcg {
    state: u64,
}

impl Lcg {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1);
        self.state
    }

    fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    fn bits(&mut self, n: u32) -> u32 {
        ((self.next_u64() >> 33) as u32) & ((1u32 << n) - 1)
    }

    fn gen_range(&mut self, max: usize) -> usize {
        if max == 0 {
            0
        } else {
            ((self.next_u64() >> 11) % max as u64) as usize
        }
    }

    fn random_hash(&mut self) -> Hash256 {
        let mut out = [0u8; 32];
        for chunk in out.chunks_mut(8) {
            chunk.copy_from_slice(&self.next_u64().to_le_bytes());
        }
        out
    }
}

/// Spent coins compare equal regardless of metadata.
fn coins_equal(a: &Coin, b: &Coin) -> bool {
    if a.is_spent() && b.is_spent() {
        return true;
    }
    a.is_coinbase == b.is_coinbase && a.height == b.height && a.out == b.out
}

/// Bottom-of-stack view that mimics an on-disk backend with lax tombstone
/// behavior: stored spent entries are sometimes reported and sometimes not,
/// and batch writes sometimes keep tombstones around.
struct SloppyBase {
    map: BTreeMap<OutPoint, Coin>,
    best_block: Hash256,
    rng: Lcg,
}

impl SloppyBase {
    fn new(seed: u64) -> Self {
        Self {
            map: BTreeMap::new(),
            best_block: NULL_HASH,
            rng: Lcg::new(seed),
        }
    }
}

impl CoinsView for SloppyBase {
    fn coin(&mut self, outpoint: &OutPoint) -> Option<Coin> {
        let coin = self.map.get(outpoint)?.clone();
        if coin.is_spent() && self.rng.next_u64() & 1 == 0 {
            return None;
        }
        Some(coin)
    }

    fn best_block(&mut self) -> Hash256 {
        self.best_block
    }

    fn batch_write(&mut self, map: CoinsMap, best_block: Hash256) -> Result<(), StoreError> {
        for (outpoint, entry) in map {
            if entry.is_dirty() {
                if entry.coin.is_spent() && self.rng.gen_range(3) == 0 {
                    self.map.remove(&outpoint);
                } else {
                    self.map.insert(outpoint, entry.coin);
                }
            }
        }
        if best_block != NULL_HASH {
            self.best_block = best_block;
        }
        Ok(())
    }
}

const SIM_ITERATIONS: usize = 4000;
const MAX_STACK_DEPTH: usize = 4;

#[derive(Default)]
struct Coverage {
    max_depth_reached: usize,
    added_an_entry: bool,
    added_an_unspendable_entry: bool,
    removed_an_entry: bool,
    updated_an_entry: bool,
    found_an_entry: bool,
    missed_an_entry: bool,
    uncached_an_entry: bool,
}

struct SimState {
    rng: Lcg,
    txids: Vec<Hash256>,
    result: BTreeMap<OutPoint, Coin>,
    iterations_left: usize,
    coverage: Coverage,
}

impl SimState {
    fn new(seed: u64, iterations: usize) -> Self {
        let mut rng = Lcg::new(seed);
        let txids = (0..iterations / 8).map(|_| rng.random_hash()).collect();
        Self {
            rng,
            txids,
            result: BTreeMap::new(),
            iterations_left: iterations,
            coverage: Coverage::default(),
        }
    }
}

fn random_modify<V: CoinsView + ?Sized>(sim: &mut SimState, cache: &mut CoinsCache<V>) {
    let txid = sim.txids[sim.rng.gen_range(sim.txids.len())];
    let outpoint = OutPoint::new(txid, 0);

    // have_coin can pull entries in, so exercise it both before and after
    // the access in all combinations.
    let test_have_before = sim.rng.bits(2) == 0;
    let test_have_after = sim.rng.bits(2) == 0;

    let have_before = if test_have_before {
        Some(cache.have_coin(&outpoint))
    } else {
        None
    };

    let entry = if sim.rng.gen_range(500) == 0 {
        access_coin_by_txid(cache, &txid).clone()
    } else {
        cache.access_coin(&outpoint).clone()
    };
    {
        let model = sim
            .result
            .entry(outpoint.clone())
            .or_insert_with(Coin::spent);
        assert!(coins_equal(&entry, model));
    }
    if let Some(have) = have_before {
        assert_eq!(have, !entry.is_spent());
    }
    if test_have_after {
        assert_eq!(cache.have_coin(&outpoint), !entry.is_spent());
    }

    let model_spent = sim.result[&outpoint].is_spent();
    if sim.rng.gen_range(5) == 0 || model_spent {
        let script_len = sim.rng.bits(6) as usize;
        if sim.rng.gen_range(16) == 0 && model_spent {
            // Unspendable outputs are silently dropped by the cache and the
            // model keeps its tombstone.
            let coin = Coin::new(
                TxOut {
                    value: sim.rng.next_u32() as i64,
                    script_pubkey: vec![OP_RETURN; 1 + script_len],
                },
                1,
                false,
            );
            let overwrite = sim.rng.next_u32() & 1 != 0;
            cache.add_coin(&outpoint, coin, overwrite);
            sim.coverage.added_an_unspendable_entry = true;
        } else {
            // Random script sizes exercise the usage accounting.
            let coin = Coin::new(
                TxOut {
                    value: sim.rng.next_u32() as i64,
                    script_pubkey: vec![0u8; script_len],
                },
                1,
                false,
            );
            if model_spent {
                sim.coverage.added_an_entry = true;
            } else {
                sim.coverage.updated_an_entry = true;
            }
            // Overwriting an unspent coin requires permission; a spent slot
            // may take either path.
            let overwrite = !model_spent || sim.rng.next_u32() & 1 != 0;
            sim.result.insert(outpoint.clone(), coin.clone());
            cache.add_coin(&outpoint, coin, overwrite);
        }
    } else {
        sim.coverage.removed_an_entry = true;
        sim.result.get_mut(&outpoint).expect("model entry").clear();
        cache.spend_coin(&outpoint);
    }
}

fn verify_full_state<V: CoinsView + ?Sized>(sim: &mut SimState, cache: &mut CoinsCache<V>) {
    let entries: Vec<(OutPoint, Coin)> = sim
        .result
        .iter()
        .map(|(outpoint, coin)| (outpoint.clone(), coin.clone()))
        .collect();
    for (outpoint, model) in entries {
        let have = cache.have_coin(&outpoint);
        let coin = cache.access_coin(&outpoint).clone();
        assert_eq!(have, !coin.is_spent());
        assert!(coins_equal(&coin, &model));
        if coin.is_spent() {
            sim.coverage.missed_an_entry = true;
        } else {
            assert!(cache.have_coin_in_cache(&outpoint));
            sim.coverage.found_an_entry = true;
        }
    }
    cache.sanity_check();
}

// Stack growth recurses through a trait object so any depth shares one
// instantiation.
fn run_sim_layer(sim: &mut SimState, parent: &mut dyn CoinsView, depth: usize) {
    let mut cache = CoinsCache::new(parent);
    while sim.iterations_left > 0 {
        sim.iterations_left -= 1;
        random_modify(sim, &mut cache);

        if sim.rng.gen_range(10) == 0 {
            let txid = sim.txids[sim.rng.gen_range(sim.txids.len())];
            let outpoint = OutPoint::new(txid, 0);
            cache.uncache(&outpoint);
            if !cache.have_coin_in_cache(&outpoint) {
                sim.coverage.uncached_an_entry = true;
            }
        }

        if sim.rng.gen_range(200) == 0 {
            verify_full_state(sim, &mut cache);
        }

        if sim.rng.gen_range(100) == 0 {
            // Flushing a layer must not change anything a reader observes.
            cache.flush().expect("flush");
            verify_full_state(sim, &mut cache);
        }

        if depth < MAX_STACK_DEPTH && sim.rng.gen_range(20) == 0 {
            if depth + 1 > sim.coverage.max_depth_reached {
                sim.coverage.max_depth_reached = depth + 1;
            }
            run_sim_layer(sim, &mut cache, depth + 1);
        }

        if depth > 1 && sim.rng.gen_range(100) == 0 {
            break;
        }
    }
    verify_full_state(sim, &mut cache);
    cache.flush().expect("final flush");
}

// A large randomized insert/remove/uncache/flush simulation against a stack
// of up to four caches, with txids drawn from a limited pool so entries get
// revisited and overwritten.
#[test]
fn cache_stack_simulation() {
    let mut sim = SimState::new(0x5eed_c0de, SIM_ITERATIONS);
    let mut base = SloppyBase::new(0xbead_cafe);
    run_sim_layer(&mut sim, &mut base, 1);

    // Everything is flushed; the base alone must agree with the model.
    for (outpoint, model) in sim.result.clone() {
        let unspent = base
            .coin(&outpoint)
            .map(|coin| {
                if !coin.is_spent() {
                    assert!(coins_equal(&coin, &model));
                }
                !coin.is_spent()
            })
            .unwrap_or(false);
        assert_eq!(unspent, !model.is_spent());
    }

    assert_eq!(sim.coverage.max_depth_reached, MAX_STACK_DEPTH);
    assert!(sim.coverage.added_an_entry);
    assert!(sim.coverage.added_an_unspendable_entry);
    assert!(sim.coverage.removed_an_entry);
    assert!(sim.coverage.updated_an_entry);
    assert!(sim.coverage.found_an_entry);
    assert!(sim.coverage.missed_an_entry);
    assert!(sim.coverage.uncached_an_entry);
}

fn make_tx(value: i64, script_len: usize) -> Transaction {
    Transaction {
        version: 2,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: Vec::new(),
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value,
            script_pubkey: vec![0u8; script_len],
        }],
        lock_time: 0,
    }
}

fn find_random_from(set: &BTreeSet<OutPoint>, rng: &mut Lcg) -> OutPoint {
    assert!(!set.is_empty());
    let probe = OutPoint::new(rng.random_hash(), 0);
    set.range(probe..)
        .next()
        .or_else(|| set.iter().next())
        .expect("non-empty set")
        .clone()
}

// Exercises update_tx_coins/apply_tx_in_undo over the same kind of stack,
// with duplicate coinbase transactions thrown in: spending a duplicated
// coinbase must not resurrect the overwritten copy at any layer.
#[test]
fn update_coins_simulation() {
    let mut rng = Lcg::new(0x0dd_ba11);
    let mut base = SloppyBase::new(0xf00d_f00d);
    let mut cache = CoinsCache::new(&mut base);

    let mut result: BTreeMap<OutPoint, Coin> = BTreeMap::new();
    // (tx, undo, coin the spent prevout used to hold)
    let mut utxo_data: BTreeMap<OutPoint, (Transaction, emberd_coins::TxUndo, Coin)> =
        BTreeMap::new();
    let mut coinbase_coins: BTreeSet<OutPoint> = BTreeSet::new();
    let mut disconnected_coins: BTreeSet<OutPoint> = BTreeSet::new();
    let mut duplicate_coins: BTreeSet<OutPoint> = BTreeSet::new();
    let mut utxoset: BTreeSet<OutPoint> = BTreeSet::new();

    let mut spent_a_duplicate_coinbase = false;

    for i in 0..SIM_ITERATIONS {
        let randiter = rng.next_u32() as usize;

        if randiter % 20 < 19 {
            // Connect a transaction.
            let mut tx = make_tx(i as i64, rng.bits(6) as usize);
            let height = 1 + (rng.next_u32() >> 2);
            let mut old_coin = Coin::spent();

            if randiter % 20 < 2 || coinbase_coins.len() < 10 {
                // Coinbase, occasionally an exact duplicate of an earlier one.
                if rng.gen_range(10) == 0 && !coinbase_coins.is_empty() {
                    let outpoint = find_random_from(&coinbase_coins, &mut rng);
                    tx = utxo_data[&outpoint].0.clone();
                    // A duplicated coinbase is no longer a reconnection
                    // candidate.
                    disconnected_coins.remove(&outpoint);
                    duplicate_coins.insert(outpoint);
                } else {
                    coinbase_coins.insert(OutPoint::new(tx.txid(), 0));
                }
                assert!(tx.is_coinbase());
            } else {
                let prevout;
                if randiter % 20 == 2 && !disconnected_coins.is_empty() {
                    // Reconnect a previously disconnected transaction. For a
                    // reconnected coinbase the prevout is the null outpoint,
                    // which stays permanently spent in the model.
                    let outpoint = find_random_from(&disconnected_coins, &mut rng);
                    tx = utxo_data[&outpoint].0.clone();
                    prevout = tx.vin[0].prevout.clone();
                    if !tx.is_coinbase() && !utxoset.contains(&prevout) {
                        disconnected_coins.remove(&outpoint);
                        continue;
                    }
                    // Already in the UTXO set means it must be a duplicated
                    // coinbase.
                    if utxoset.contains(&outpoint) {
                        assert!(tx.is_coinbase());
                        assert!(duplicate_coins.contains(&outpoint));
                    }
                    disconnected_coins.remove(&outpoint);
                } else {
                    // Spend a random unspent output.
                    if utxoset.is_empty() {
                        continue;
                    }
                    prevout = find_random_from(&utxoset, &mut rng);
                    tx.vin[0].prevout = prevout.clone();
                    assert!(!tx.is_coinbase());
                }
                old_coin = result
                    .entry(prevout.clone())
                    .or_insert_with(Coin::spent)
                    .clone();
                result.get_mut(&prevout).expect("model entry").clear();
                utxoset.remove(&prevout);
                if duplicate_coins.contains(&prevout) {
                    spent_a_duplicate_coinbase = true;
                }
            }

            let outpoint = OutPoint::new(tx.txid(), 0);
            result.insert(
                outpoint.clone(),
                Coin::new(tx.vout[0].clone(), height, tx.is_coinbase()),
            );
            let undo = update_tx_coins(&mut cache, &tx, height);
            utxoset.insert(outpoint.clone());
            utxo_data.insert(outpoint, (tx, undo, old_coin));
        } else if !utxoset.is_empty() {
            // Disconnect a random transaction.
            let outpoint = find_random_from(&utxoset, &mut rng);
            let (tx, undo, orig_coin) = utxo_data[&outpoint].clone();

            result.get_mut(&outpoint).expect("model entry").clear();
            if !tx.is_coinbase() {
                result.insert(tx.vin[0].prevout.clone(), orig_coin);
            }

            cache.spend_coin(&outpoint);
            if !tx.is_coinbase() {
                let restored = undo.prevouts[0].clone();
                apply_tx_in_undo(restored, &mut cache, &tx.vin[0].prevout);
            }

            disconnected_coins.insert(outpoint.clone());
            utxoset.remove(&outpoint);
            if !tx.is_coinbase() {
                utxoset.insert(tx.vin[0].prevout.clone());
            }
        }

        if rng.gen_range(500) == 0 || i == SIM_ITERATIONS - 1 {
            for (outpoint, model) in &result {
                let have = cache.have_coin(outpoint);
                let coin = cache.access_coin(outpoint).clone();
                assert_eq!(have, !coin.is_spent());
                assert!(coins_equal(&coin, model));
            }
            cache.sanity_check();
        }

        if !utxoset.is_empty() && rng.gen_range(30) == 0 {
            cache.uncache(&find_random_from(&utxoset, &mut rng));
        }
        if !disconnected_coins.is_empty() && rng.gen_range(30) == 0 {
            cache.uncache(&find_random_from(&disconnected_coins, &mut rng));
        }

        if rng.gen_range(100) == 0 {
            cache.flush().expect("flush");
        }
    }

    assert!(spent_a_duplicate_coinbase);
}
