//! Work tickets: claim exactly N units of work across M workers.
//!
//! A ticket channel is filled with one ticket per unit up front and its
//! sender dropped, so the channel can hand out each unit exactly once and
//! then reports itself drained. Workers loop on [`WorkTickets::claim`] and
//! stop when it returns `None`.

use crossbeam_channel::{bounded, Receiver};

/// Claim on one unit of work (a shard index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticket {
    index: usize,
}

impl Ticket {
    pub fn index(self) -> usize {
        self.index
    }
}

/// Shared dispenser of tickets `0..total`. Clones draw from the same pool.
#[derive(Debug, Clone)]
pub struct WorkTickets {
    rx: Receiver<Ticket>,
    total: usize,
}

impl WorkTickets {
    pub fn new(total: usize) -> Self {
        let (tx, rx) = bounded(total.max(1));
        for index in 0..total {
            if tx.send(Ticket { index }).is_err() {
                break;
            }
        }
        Self { rx, total }
    }

    /// Take the next unclaimed ticket, if any. Never blocks.
    pub fn claim(&self) -> Option<Ticket> {
        self.rx.try_recv().ok()
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Tickets not yet claimed.
    pub fn remaining(&self) -> usize {
        self.rx.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_tickets_in_order_then_drained() {
        let tickets = WorkTickets::new(3);
        assert_eq!(tickets.remaining(), 3);
        let claimed: Vec<usize> = std::iter::from_fn(|| tickets.claim())
            .map(|t| t.index())
            .collect();
        assert_eq!(claimed, vec![0, 1, 2]);
        assert!(tickets.claim().is_none());
        assert_eq!(tickets.total(), 3);
    }

    #[test]
    fn test_zero_tickets() {
        let tickets = WorkTickets::new(0);
        assert!(tickets.claim().is_none());
    }

    #[test]
    fn test_each_ticket_claimed_exactly_once_across_workers() {
        let tickets = WorkTickets::new(1000);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tickets = tickets.clone();
                thread::spawn(move || {
                    let mut mine = Vec::new();
                    while let Some(t) = tickets.claim() {
                        mine.push(t.index());
                    }
                    mine
                })
            })
            .collect();

        let mut all = Vec::new();
        for h in handles {
            all.extend(h.join().unwrap());
        }
        assert_eq!(all.len(), 1000);
        let unique: HashSet<usize> = all.into_iter().collect();
        assert_eq!(unique.len(), 1000);
    }
}
