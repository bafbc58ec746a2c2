use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::FatalError;
use crate::submitter::TargetSystem;

/// Hands out gap-free sequence numbers starting at a base fetched once from the target.
///
/// Allocation is a single atomic increment. Outcomes of submissions are never fed back,
/// so a rejected request still consumes its number.
#[derive(Debug)]
pub struct SequenceAllocator {
    base: u64,
    next: AtomicU64,
}

impl SequenceAllocator {
    pub fn new(base: u64) -> Self {
        Self {
            base,
            next: AtomicU64::new(base),
        }
    }

    /// Ask the target for the sender's next sequence number and start from there.
    pub async fn from_target(
        target: &dyn TargetSystem,
        sender: &str,
    ) -> Result<Self, FatalError> {
        let base = target
            .get_starting_sequence(sender)
            .await
            .map_err(|e| FatalError::StartingSequence {
                sender: sender.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self::new(base))
    }

    /// Reserve the next `n` sequence numbers.
    pub fn next(&self, n: u64) -> Range<u64> {
        let start = self.next.fetch_add(n, Ordering::SeqCst);
        start..start + n
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    /// Number of sequence numbers handed out so far.
    pub fn issued(&self) -> u64 {
        self.next_unused() - self.base
    }

    /// First sequence number not yet handed out.
    pub fn next_unused(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

/// One request's place in the run: which sender sends it and with what sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot {
    /// Position of the request across the whole run, starting at 0
    pub index: u64,
    /// Index into the sender list
    pub sender: usize,
    pub sequence: u64,
}

impl Slot {
    /// Slot of a run with one sender, where the request index tracks the sequence number.
    pub fn single_sender(sequence: u64) -> Self {
        Self {
            index: sequence,
            sender: 0,
            sequence,
        }
    }
}

/// Sequence numbers one sender consumed during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderRange {
    pub sender: String,
    pub start_sequence: u64,
    /// First sequence number not handed out; resume from here
    pub end_sequence: u64,
}

/// Rotates requests across several senders, each with its own allocator.
///
/// Every sender's numbers stay contiguous on their own; the pool only decides
/// which sender the next request goes to.
#[derive(Debug)]
pub struct SenderPool {
    senders: Vec<(String, SequenceAllocator)>,
    cursor: AtomicU64,
}

impl SenderPool {
    pub fn new(senders: impl IntoIterator<Item = (String, u64)>) -> Self {
        Self {
            senders: senders
                .into_iter()
                .map(|(sender, base)| (sender, SequenceAllocator::new(base)))
                .collect(),
            cursor: AtomicU64::new(0),
        }
    }

    /// Fetch the starting sequence of every sender. Fails on the first sender the
    /// target cannot answer for.
    pub async fn from_target(
        target: &dyn TargetSystem,
        senders: &[String],
    ) -> Result<Self, FatalError> {
        let mut allocators = Vec::with_capacity(senders.len());
        for sender in senders {
            allocators.push((
                sender.clone(),
                SequenceAllocator::from_target(target, sender).await?,
            ));
        }
        Ok(Self {
            senders: allocators,
            cursor: AtomicU64::new(0),
        })
    }

    /// Reserve slots for the next `n` requests, round-robin over senders.
    pub fn next(&self, n: u64) -> Vec<Slot> {
        if self.senders.is_empty() {
            return Vec::new();
        }
        let start = self.cursor.fetch_add(n, Ordering::SeqCst);
        (start..start + n)
            .map(|index| {
                let sender = (index % self.senders.len() as u64) as usize;
                Slot {
                    index,
                    sender,
                    sequence: self.senders[sender].1.next(1).start,
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    pub fn sender(&self, idx: usize) -> Option<&str> {
        self.senders.get(idx).map(|(sender, _)| sender.as_str())
    }

    /// Requests issued across all senders.
    pub fn issued(&self) -> u64 {
        self.senders.iter().map(|(_, alloc)| alloc.issued()).sum()
    }

    pub fn ranges(&self) -> Vec<SenderRange> {
        self.senders
            .iter()
            .map(|(sender, alloc)| SenderRange {
                sender: sender.clone(),
                start_sequence: alloc.base(),
                end_sequence: alloc.next_unused(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_next_is_contiguous() {
        let alloc = SequenceAllocator::new(7);
        assert_eq!(alloc.next(3), 7..10);
        assert_eq!(alloc.next(1), 10..11);
        assert_eq!(alloc.next(0), 11..11);
        assert_eq!(alloc.base(), 7);
        assert_eq!(alloc.issued(), 4);
        assert_eq!(alloc.next_unused(), 11);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ranges_do_not_overlap() {
        let alloc = Arc::new(SequenceAllocator::new(100));

        let mut handles = Vec::new();
        for i in 0..16u64 {
            let alloc = alloc.clone();
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                for _ in 0..50 {
                    seen.extend(alloc.next(i % 3 + 1));
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }

        let unique: HashSet<u64> = all.iter().copied().collect();
        assert_eq!(unique.len(), all.len(), "duplicate sequence numbers issued");

        let n = alloc.issued();
        assert_eq!(all.len() as u64, n);
        assert_eq!(unique, (100..100 + n).collect::<HashSet<_>>());
    }

    #[test]
    fn test_pool_rotates_senders() {
        let pool = SenderPool::new([
            ("alice".to_string(), 10),
            ("bob".to_string(), 500),
            ("carol".to_string(), 0),
        ]);

        let slots = pool.next(5);
        let picked: Vec<(usize, u64)> = slots.iter().map(|s| (s.sender, s.sequence)).collect();
        assert_eq!(picked, vec![(0, 10), (1, 500), (2, 0), (0, 11), (1, 501)]);
        assert_eq!(slots.iter().map(|s| s.index).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);

        let slots = pool.next(2);
        assert_eq!((slots[0].sender, slots[0].sequence), (2, 1));
        assert_eq!((slots[1].sender, slots[1].sequence), (0, 12));

        assert_eq!(pool.issued(), 7);
        assert_eq!(pool.sender(1), Some("bob"));
        assert_eq!(
            pool.ranges(),
            vec![
                SenderRange {
                    sender: "alice".into(),
                    start_sequence: 10,
                    end_sequence: 13
                },
                SenderRange {
                    sender: "bob".into(),
                    start_sequence: 500,
                    end_sequence: 502
                },
                SenderRange {
                    sender: "carol".into(),
                    start_sequence: 0,
                    end_sequence: 2
                },
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_keeps_each_sender_contiguous() {
        let pool = Arc::new(SenderPool::new(
            (0..3).map(|i| (format!("sender-{i}"), i * 1_000)),
        ));

        let mut handles = Vec::new();
        for n in 1..=8u64 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                let mut slots = Vec::new();
                for _ in 0..20 {
                    slots.extend(pool.next(n));
                }
                slots
            }));
        }

        let mut per_sender = vec![Vec::new(); 3];
        for h in handles {
            for slot in h.await.unwrap() {
                per_sender[slot.sender].push(slot.sequence);
            }
        }

        for (idx, range) in pool.ranges().iter().enumerate() {
            let mut seen = per_sender[idx].clone();
            seen.sort_unstable();
            assert_eq!(seen, (range.start_sequence..range.end_sequence).collect::<Vec<_>>());
        }
    }
}
