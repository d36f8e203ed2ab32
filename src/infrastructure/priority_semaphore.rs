//! Priority admission controller for outbound requests
//!
//! Bounds the number of in-flight remote calls to a fixed capacity. When no
//! slot is free, callers queue by descending priority (FIFO among equal
//! priorities). A released slot is handed directly to the head waiter through
//! its private wake signal, so a woken waiter never competes for it.
//!
//! The slot table and the waiter list share a single mutex. The waiter list
//! is an index-based doubly linked list stored in an arena; nodes carry a
//! unique key so a stale index can never remove someone else's node.

use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Proof of holding one admission slot. Must be handed back with
/// [`PrioritySemaphore::release`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a ticket must be released or the slot is lost"]
pub struct Ticket {
    slot: usize,
    id: u64,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("admission wait was cancelled")]
pub struct AcquireCancelled;

pub struct PrioritySemaphore {
    capacity: usize,
    state: Mutex<State>,
}

struct State {
    slots: Vec<Option<u64>>,
    next_ticket: u64,
    waiters: WaiterList,
}

impl PrioritySemaphore {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "admission capacity must be positive");
        Self {
            capacity,
            state: Mutex::new(State {
                slots: vec![None; capacity],
                next_ticket: 0,
                waiters: WaiterList::default(),
            }),
        }
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently held
    pub fn in_use(&self) -> usize {
        self.lock().slots.iter().filter(|s| s.is_some()).count()
    }

    /// Number of callers queued for a slot
    pub fn waiting(&self) -> usize {
        self.lock().waiters.len
    }

    /// Wait for a slot with the given priority (larger is more urgent)
    pub async fn acquire(&self, priority: i64) -> Ticket {
        match self.acquire_inner(priority, None).await {
            Ok(ticket) => ticket,
            Err(AcquireCancelled) => unreachable!("an uncancellable wait was cancelled"),
        }
    }

    /// Like [`acquire`](Self::acquire) but gives up when `cancel` fires.
    ///
    /// A cancelled waiter is unlinked before this returns. If a slot was
    /// handed to it in the meantime the slot is passed on to the next waiter.
    pub async fn acquire_cancellable(
        &self,
        priority: i64,
        cancel: &CancellationToken,
    ) -> Result<Ticket, AcquireCancelled> {
        if cancel.is_cancelled() {
            return Err(AcquireCancelled);
        }
        self.acquire_inner(priority, Some(cancel)).await
    }

    /// Free a slot, waking the highest priority waiter if any.
    ///
    /// # Panics
    /// Releasing a ticket this semaphore did not issue (or already took back)
    /// means the slot bookkeeping is broken.
    pub fn release(&self, ticket: Ticket) {
        let mut state = self.lock();
        let held = state.slots.get(ticket.slot).copied().flatten();
        if held != Some(ticket.id) {
            panic!("released a ticket that is not held: {ticket:?}");
        }
        state.hand_over(ticket.slot);
    }

    async fn acquire_inner(
        &self,
        priority: i64,
        cancel: Option<&CancellationToken>,
    ) -> Result<Ticket, AcquireCancelled> {
        let (index, key, rx) = {
            let mut state = self.lock();
            if let Some(slot) = state.slots.iter().position(Option::is_none) {
                return Ok(state.claim(slot));
            }
            let (tx, rx) = oneshot::channel();
            let (index, key) = state.waiters.insert(priority, tx);
            debug!("⏳ Queued for admission (priority {}, {} waiting)", priority, state.waiters.len);
            (index, key, rx)
        };

        let mut pending = PendingAcquire {
            semaphore: self,
            index,
            key,
            rx,
            settled: false,
        };

        let woken = match cancel {
            Some(token) => tokio::select! {
                biased;
                woken = &mut pending.rx => Some(woken),
                () = token.cancelled() => None,
            },
            None => Some((&mut pending.rx).await),
        };

        match woken {
            Some(Ok(ticket)) => {
                pending.settled = true;
                Ok(ticket)
            }
            // the sender only goes away when our own node is unlinked
            Some(Err(_)) => panic!("admission waiter lost its wake signal"),
            None => Err(AcquireCancelled),
        }
    }

    // Called when a waiter leaves without having taken its ticket
    fn abandon(&self, index: usize, key: u64, rx: &mut oneshot::Receiver<Ticket>) {
        let mut state = self.lock();
        if state.waiters.remove(index, key) {
            return;
        }
        // release() already handed us a slot under this lock; pass it on
        match rx.try_recv() {
            Ok(ticket) => state.hand_over(ticket.slot),
            Err(e) => error!("❌ Abandoned waiter has neither a node nor a slot: {}", e),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl State {
    fn claim(&mut self, slot: usize) -> Ticket {
        let id = self.next_ticket;
        self.next_ticket += 1;
        self.slots[slot] = Some(id);
        Ticket { slot, id }
    }

    // Give `slot` to the head waiter, or mark it free when nobody waits
    fn hand_over(&mut self, slot: usize) {
        while let Some(tx) = self.waiters.pop_front() {
            let ticket = self.claim(slot);
            match tx.send(ticket) {
                Ok(()) => return,
                Err(_) => continue,
            }
        }
        self.slots[slot] = None;
    }
}

struct PendingAcquire<'a> {
    semaphore: &'a PrioritySemaphore,
    index: usize,
    key: u64,
    rx: oneshot::Receiver<Ticket>,
    settled: bool,
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.semaphore.abandon(self.index, self.key, &mut self.rx);
        }
    }
}

struct Node {
    key: u64,
    priority: i64,
    tx: oneshot::Sender<Ticket>,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Default)]
struct WaiterList {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
    next_key: u64,
}

impl WaiterList {
    /// Link a waiter after every node of greater or equal priority
    fn insert(&mut self, priority: i64, tx: oneshot::Sender<Ticket>) -> (usize, u64) {
        let key = self.next_key;
        self.next_key += 1;

        let mut before = self.tail;
        while let Some(i) = before {
            let node = self.node(i);
            if node.priority >= priority {
                break;
            }
            before = node.prev;
        }
        let after = match before {
            Some(i) => self.node(i).next,
            None => self.head,
        };

        let node = Node {
            key,
            priority,
            tx,
            prev: before,
            next: after,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.nodes[index] = Some(node);
                index
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };

        match before {
            Some(i) => self.node_mut(i).next = Some(index),
            None => self.head = Some(index),
        }
        match after {
            Some(i) => self.node_mut(i).prev = Some(index),
            None => self.tail = Some(index),
        }
        self.len += 1;
        (index, key)
    }

    fn pop_front(&mut self) -> Option<oneshot::Sender<Ticket>> {
        let head = self.head?;
        self.unlink(head).map(|node| node.tx)
    }

    /// Unlink the node at `index` if it still belongs to `key`
    fn remove(&mut self, index: usize, key: u64) -> bool {
        let owned = matches!(self.nodes.get(index), Some(Some(node)) if node.key == key);
        owned && self.unlink(index).is_some()
    }

    fn unlink(&mut self, index: usize) -> Option<Node> {
        let node = self.nodes.get_mut(index)?.take()?;
        match node.prev {
            Some(p) => self.node_mut(p).next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(n) => self.node_mut(n).prev = node.prev,
            None => self.tail = node.prev,
        }
        self.free.push(index);
        self.len -= 1;
        Some(node)
    }

    fn node(&self, index: usize) -> &Node {
        match &self.nodes[index] {
            Some(node) => node,
            None => panic!("waiter list links a vacant node {index}"),
        }
    }

    fn node_mut(&mut self, index: usize) -> &mut Node {
        match &mut self.nodes[index] {
            Some(node) => node,
            None => panic!("waiter list links a vacant node {index}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    async fn wait_for_waiters(semaphore: &PrioritySemaphore, count: usize) {
        while semaphore.waiting() != count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn free_slots_are_claimed_immediately() {
        let semaphore = PrioritySemaphore::new(2);
        let a = semaphore.acquire(0).await;
        let b = semaphore.acquire(0).await;
        assert_ne!(a, b);
        assert_eq!(semaphore.in_use(), 2);

        semaphore.release(a);
        semaphore.release(b);
        assert_eq!(semaphore.in_use(), 0);
        assert_eq!(semaphore.waiting(), 0);
    }

    #[tokio::test]
    async fn waiters_are_served_by_priority_then_arrival() {
        let semaphore = Arc::new(PrioritySemaphore::new(1));
        let held = semaphore.acquire(0).await;
        let (order_tx, mut order_rx) = mpsc::unbounded_channel();

        for (n, (label, priority)) in [("low", 0), ("high-1", 5), ("mid", 2), ("high-2", 5)].into_iter().enumerate() {
            let task_semaphore = semaphore.clone();
            let order_tx = order_tx.clone();
            tokio::spawn(async move {
                let ticket = task_semaphore.acquire(priority).await;
                order_tx.send(label).unwrap();
                task_semaphore.release(ticket);
            });
            wait_for_waiters(&semaphore, n + 1).await;
        }

        semaphore.release(held);
        let mut order = Vec::new();
        for _ in 0..4 {
            order.push(order_rx.recv().await.unwrap());
        }
        assert_eq!(order, ["high-1", "high-2", "mid", "low"]);
    }

    #[tokio::test]
    async fn cancelled_waiter_is_unlinked() {
        let semaphore = Arc::new(PrioritySemaphore::new(1));
        let held = semaphore.acquire(0).await;
        let token = CancellationToken::new();

        let waiter = {
            let semaphore = semaphore.clone();
            let token = token.clone();
            tokio::spawn(async move { semaphore.acquire_cancellable(3, &token).await })
        };
        wait_for_waiters(&semaphore, 1).await;

        token.cancel();
        assert_eq!(waiter.await.unwrap(), Err(AcquireCancelled));
        assert_eq!(semaphore.waiting(), 0);

        semaphore.release(held);
        assert_eq!(semaphore.in_use(), 0);
    }

    #[tokio::test]
    async fn already_cancelled_token_never_queues() {
        let semaphore = PrioritySemaphore::new(1);
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(semaphore.acquire_cancellable(0, &token).await, Err(AcquireCancelled));
        assert_eq!(semaphore.in_use(), 0);
    }

    #[tokio::test]
    async fn slot_handed_to_a_departing_waiter_is_passed_on() {
        let semaphore = PrioritySemaphore::new(1);
        let held = semaphore.acquire(0).await;
        let token = CancellationToken::new();

        let mut departing = Box::pin(semaphore.acquire_cancellable(9, &token));
        assert!(futures::poll!(departing.as_mut()).is_pending());
        let mut next = Box::pin(semaphore.acquire(1));
        assert!(futures::poll!(next.as_mut()).is_pending());
        assert_eq!(semaphore.waiting(), 2);

        // the slot goes to the departing waiter, which leaves without polling
        semaphore.release(held);
        drop(departing);

        let ticket = next.await;
        assert_eq!(semaphore.in_use(), 1);
        semaphore.release(ticket);
        assert_eq!(semaphore.in_use(), 0);
    }

    #[tokio::test]
    #[should_panic(expected = "not held")]
    async fn releasing_twice_is_fatal() {
        let semaphore = PrioritySemaphore::new(1);
        let ticket = semaphore.acquire(0).await;
        let forged = Ticket {
            slot: ticket.slot,
            id: ticket.id,
        };
        semaphore.release(ticket);
        semaphore.release(forged);
    }

    #[test]
    fn waiter_list_keeps_links_consistent() {
        let mut list = WaiterList::default();
        let mut receivers = Vec::new();
        let mut handles = Vec::new();
        for priority in [1, 3, 2, 3, 0] {
            let (tx, rx) = oneshot::channel();
            receivers.push(rx);
            handles.push(list.insert(priority, tx));
        }
        assert_eq!(list.len, 5);

        // stale key does not remove the node
        let (index, key) = handles[2];
        assert!(!list.remove(index, key + 100));
        assert!(list.remove(index, key));
        assert!(!list.remove(index, key));

        let mut priorities = Vec::new();
        let mut cursor = list.head;
        while let Some(i) = cursor {
            priorities.push(list.node(i).priority);
            cursor = list.node(i).next;
        }
        assert_eq!(priorities, [3, 3, 1, 0]);
        assert_eq!(list.len, 4);
    }
}
