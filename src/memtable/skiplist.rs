//! Skip-list memtable variant.
//!
//! A probabilistic skip list over an index arena: nodes live in a `Vec`
//! and link forward by index, so the structure is safe Rust throughout.
//! Tower heights are drawn from the thread RNG with a 50/50 coin per
//! level up to `max_height`; the head is a sentinel tower of forward
//! links.
//!
//! `search` returns both the match (if any) and the update path — the
//! last tower at each level strictly before the key — which `upsert`
//! reuses to wire a new node in.

use rand::Rng;

use crate::record::Record;

const DEFAULT_MAX_HEIGHT: usize = 16;

/// A tower position: `None` is the head sentinel, `Some(i)` a node index.
type Link = Option<usize>;

#[derive(Debug)]
struct SkipNode {
    record: Record,
    forwards: Vec<Link>,
}

/// Ordered memtable backed by a probabilistic skip list.
#[derive(Debug)]
pub struct SkipListMemtable {
    nodes: Vec<SkipNode>,
    /// Head sentinel forward links, one per level in use.
    head: Vec<Link>,
    max_height: usize,
    total: usize,
    tombstoned: usize,
}

impl SkipListMemtable {
    /// Creates an empty list with the given tower height limit.
    pub fn new(max_height: usize) -> Self {
        let max_height = max_height.clamp(1, 64);
        Self {
            nodes: Vec::new(),
            head: vec![None],
            max_height,
            total: 0,
            tombstoned: 0,
        }
    }

    /// Creates an empty list with the default height limit.
    pub fn with_default_height() -> Self {
        Self::new(DEFAULT_MAX_HEIGHT)
    }

    /// Inserts or replaces `record`, returning the previous record for
    /// the key if one existed.
    pub fn upsert(&mut self, record: Record) -> Option<Record> {
        let (found, update) = self.search(&record.key);

        if let Some(idx) = found {
            let old = std::mem::replace(&mut self.nodes[idx].record, record);
            let new_tombstone = self.nodes[idx].record.tombstone;
            if old.tombstone && !new_tombstone {
                self.tombstoned -= 1;
            } else if !old.tombstone && new_tombstone {
                self.tombstoned += 1;
            }
            return Some(old);
        }

        let height = self.random_height();
        while self.head.len() < height {
            self.head.push(None);
        }

        let tombstone = record.tombstone;
        let new_idx = self.nodes.len();
        let mut forwards = vec![None; height];
        for level in 0..height {
            let prev = update.get(level).copied().flatten();
            forwards[level] = match prev {
                Some(p) if level < self.nodes[p].forwards.len() => {
                    let next = self.nodes[p].forwards[level];
                    self.nodes[p].forwards[level] = Some(new_idx);
                    next
                }
                Some(_) => None,
                None => {
                    let next = self.head[level];
                    self.head[level] = Some(new_idx);
                    next
                }
            };
        }
        self.nodes.push(SkipNode { record, forwards });

        self.total += 1;
        if tombstone {
            self.tombstoned += 1;
        }
        None
    }

    /// Looks up the record for `key`.
    pub fn find(&self, key: &str) -> Option<&Record> {
        let (found, _) = self.search(key);
        found.map(|idx| &self.nodes[idx].record)
    }

    /// Distinct key count.
    pub fn total_entries(&self) -> usize {
        self.total
    }

    /// Tombstoned key count.
    pub fn tombstoned(&self) -> usize {
        self.tombstoned
    }

    /// Every record in ascending key order.
    pub fn sorted_records(&self) -> Vec<Record> {
        let mut out = Vec::with_capacity(self.total);
        let mut cursor = self.head[0];
        while let Some(idx) = cursor {
            out.push(self.nodes[idx].record.clone());
            cursor = self.nodes[idx].forwards[0];
        }
        out
    }

    /// Smallest-keyed record strictly greater than `current`.
    pub fn next_after(&self, current: Option<&str>) -> Option<Record> {
        let idx = match current {
            None => self.head[0]?,
            Some(key) => {
                let (found, update) = self.search(key);
                match found {
                    Some(i) => self.nodes[i].forwards[0]?,
                    None => match update[0] {
                        Some(prev) => self.nodes[prev].forwards[0]?,
                        None => self.head[0]?,
                    },
                }
            }
        };
        Some(self.nodes[idx].record.clone())
    }

    /// Discards every record.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.head = vec![None];
        self.total = 0;
        self.tombstoned = 0;
    }

    // --------------------------------------------------------------------------------------------
    // Internals
    // --------------------------------------------------------------------------------------------

    /// Locates `key`, returning the matching node (if any) and the update
    /// path: at each level, the last tower whose key is strictly smaller.
    fn search(&self, key: &str) -> (Option<usize>, Vec<Link>) {
        let levels = self.head.len();
        let mut update: Vec<Link> = vec![None; levels];
        let mut current: Link = None;

        for level in (0..levels).rev() {
            loop {
                let next = match current {
                    None => self.head[level],
                    Some(i) => self.nodes[i].forwards.get(level).copied().flatten(),
                };
                match next {
                    Some(j) if self.nodes[j].record.key.as_str() < key => current = Some(j),
                    _ => break,
                }
            }
            update[level] = current;
        }

        let candidate = match current {
            None => self.head[0],
            Some(i) => self.nodes[i].forwards[0],
        };
        let found = candidate.filter(|&j| self.nodes[j].record.key == key);
        (found, update)
    }

    /// Coin-flip tower height in `1..=max_height`.
    fn random_height(&mut self) -> usize {
        let mut rng = rand::rng();
        let mut height = 1;
        while height < self.max_height && rng.random_bool(0.5) {
            height += 1;
        }
        height
    }
}
