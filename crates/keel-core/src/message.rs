//! Received-message storage.
//!
//! Messages can sit on two queues at once: the owning connection's receive
//! queue, and (for accepted connections) the parent listen socket's
//! aggregate queue.  Each message slot carries two independent link pairs,
//! one per queue kind, threading intrusive doubly-linked lists through an
//! arena of slots.  Removal unlinks a message from *every* queue it is on
//! in O(1) per link and hands ownership to the caller.

use bytes::Bytes;
use keel_proto::Identity;

use crate::Micros;

/// A completed application message, ready for the caller.
#[derive(Debug, Clone)]
pub struct Message {
    /// Identity of the sending peer.
    pub sender: Identity,
    /// Handle of the connection the message arrived on.
    pub connection: u32,
    /// The connection's user data at delivery (or pickup) time.
    pub connection_user_data: i64,
    pub payload: Bytes,
    pub channel: i32,
    pub received_at: Micros,
    /// Per-connection message number, starting at 1.
    pub message_number: i64,
}

/// Which of a slot's two link pairs a queue threads.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum LinkKind {
    Connection = 0,
    Listen = 1,
}

#[derive(Clone, Copy, Default)]
struct Links {
    queue: Option<QueueId>,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Slot {
    msg: Option<Message>,
    links: [Links; 2],
}

/// Handle to one queue inside the arena.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct QueueId(usize);

struct QueueState {
    kind: LinkKind,
    first: Option<usize>,
    last: Option<usize>,
    alive: bool,
}

/// Slab of message slots plus the queues threading them.
#[derive(Default)]
pub struct MessageArena {
    slots: Vec<Slot>,
    free_slots: Vec<usize>,
    queues: Vec<QueueState>,
    free_queues: Vec<usize>,
}

impl MessageArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a queue threading the per-connection link pair.
    pub fn new_connection_queue(&mut self) -> QueueId {
        self.new_queue(LinkKind::Connection)
    }

    /// Create a queue threading the listen-socket aggregate link pair.
    pub fn new_listen_queue(&mut self) -> QueueId {
        self.new_queue(LinkKind::Listen)
    }

    fn new_queue(&mut self, kind: LinkKind) -> QueueId {
        if let Some(idx) = self.free_queues.pop() {
            self.queues[idx] = QueueState {
                kind,
                first: None,
                last: None,
                alive: true,
            };
            return QueueId(idx);
        }
        self.queues.push(QueueState {
            kind,
            first: None,
            last: None,
            alive: true,
        });
        QueueId(self.queues.len() - 1)
    }

    /// Retire an empty queue.
    pub fn free_queue(&mut self, q: QueueId) {
        debug_assert!(self.is_empty(q), "freeing a non-empty queue");
        let state = &mut self.queues[q.0];
        state.alive = false;
        state.first = None;
        state.last = None;
        self.free_queues.push(q.0);
    }

    /// Store a message and link it to the tail of its connection queue and,
    /// when present, the listen-socket aggregate queue.
    pub fn push_message(
        &mut self,
        msg: Message,
        conn_queue: QueueId,
        listen_queue: Option<QueueId>,
    ) {
        let slot = match self.free_slots.pop() {
            Some(idx) => {
                self.slots[idx].msg = Some(msg);
                idx
            }
            None => {
                self.slots.push(Slot {
                    msg: Some(msg),
                    links: [Links::default(); 2],
                });
                self.slots.len() - 1
            }
        };
        self.link_to_tail(slot, conn_queue);
        if let Some(q) = listen_queue {
            self.link_to_tail(slot, q);
        }
    }

    fn link_to_tail(&mut self, slot: usize, q: QueueId) {
        let state = &self.queues[q.0];
        debug_assert!(state.alive);
        let link_idx = state.kind as usize;
        debug_assert!(self.slots[slot].links[link_idx].queue.is_none());

        let old_last = state.last;
        if let Some(prev) = old_last {
            self.slots[prev].links[link_idx].next = Some(slot);
        } else {
            debug_assert!(state.first.is_none());
            self.queues[q.0].first = Some(slot);
        }
        let links = &mut self.slots[slot].links[link_idx];
        links.prev = old_last;
        links.next = None;
        links.queue = Some(q);
        self.queues[q.0].last = Some(slot);
    }

    /// Remove a slot from one queue.  A no-op if it isn't on one of that
    /// kind.
    fn unlink_one(&mut self, slot: usize, link_idx: usize) {
        let links = self.slots[slot].links[link_idx];
        let Some(q) = links.queue else {
            return;
        };
        match links.prev {
            Some(prev) => self.slots[prev].links[link_idx].next = links.next,
            None => self.queues[q.0].first = links.next,
        }
        match links.next {
            Some(next) => self.slots[next].links[link_idx].prev = links.prev,
            None => self.queues[q.0].last = links.prev,
        }
        self.slots[slot].links[link_idx] = Links::default();
    }

    /// Remove the slot from every queue it is on and take the message.
    fn unlink_all(&mut self, slot: usize) -> Message {
        self.unlink_one(slot, LinkKind::Connection as usize);
        self.unlink_one(slot, LinkKind::Listen as usize);
        let msg = self.slots[slot].msg.take().expect("slot occupied");
        self.free_slots.push(slot);
        msg
    }

    /// Pop up to `max` messages from the head, transferring ownership to
    /// the caller.  Each message is unlinked from all queues, including the
    /// one of the other kind.
    pub fn remove_up_to(&mut self, q: QueueId, max: usize) -> Vec<Message> {
        let mut out = Vec::new();
        while out.len() < max {
            let Some(slot) = self.queues[q.0].first else {
                break;
            };
            out.push(self.unlink_all(slot));
            debug_assert_ne!(self.queues[q.0].first, Some(slot));
        }
        out
    }

    /// Drop every message on the queue.
    pub fn purge(&mut self, q: QueueId) {
        while let Some(slot) = self.queues[q.0].first {
            let _ = self.unlink_all(slot);
        }
    }

    pub fn is_empty(&self, q: QueueId) -> bool {
        self.queues[q.0].first.is_none()
    }

    pub fn len(&self, q: QueueId) -> usize {
        let link_idx = self.queues[q.0].kind as usize;
        let mut n = 0;
        let mut cur = self.queues[q.0].first;
        while let Some(slot) = cur {
            n += 1;
            cur = self.slots[slot].links[link_idx].next;
        }
        n
    }

    /// Mutate every message on a queue in order (head to tail).
    pub fn for_each_mut(&mut self, q: QueueId, mut f: impl FnMut(&mut Message)) {
        let link_idx = self.queues[q.0].kind as usize;
        let mut cur = self.queues[q.0].first;
        while let Some(slot) = cur {
            cur = self.slots[slot].links[link_idx].next;
            if let Some(msg) = self.slots[slot].msg.as_mut() {
                f(msg);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(n: i64) -> Message {
        Message {
            sender: Identity::LocalHost,
            connection: 1,
            connection_user_data: -1,
            payload: Bytes::from(format!("m{n}")),
            channel: -1,
            received_at: 0,
            message_number: n,
        }
    }

    /// Walk a queue forward and backward and check the links are inverses.
    fn assert_well_formed(arena: &MessageArena, q: QueueId) {
        let state = &arena.queues[q.0];
        let link_idx = state.kind as usize;
        let mut prev: Option<usize> = None;
        let mut cur = state.first;
        while let Some(slot) = cur {
            assert_eq!(arena.slots[slot].links[link_idx].prev, prev);
            assert_eq!(arena.slots[slot].links[link_idx].queue, Some(q));
            prev = cur;
            cur = arena.slots[slot].links[link_idx].next;
        }
        assert_eq!(state.last, prev);
    }

    #[test]
    fn fifo_order() {
        let mut arena = MessageArena::new();
        let q = arena.new_connection_queue();
        for n in 1..=5 {
            arena.push_message(msg(n), q, None);
        }
        let out = arena.remove_up_to(q, 3);
        assert_eq!(
            out.iter().map(|m| m.message_number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        let out = arena.remove_up_to(q, 10);
        assert_eq!(
            out.iter().map(|m| m.message_number).collect::<Vec<_>>(),
            vec![4, 5]
        );
        assert!(arena.is_empty(q));
    }

    #[test]
    fn dual_queue_membership() {
        let mut arena = MessageArena::new();
        let conn_a = arena.new_connection_queue();
        let conn_b = arena.new_connection_queue();
        let listen = arena.new_listen_queue();

        arena.push_message(msg(1), conn_a, Some(listen));
        arena.push_message(msg(2), conn_b, Some(listen));
        arena.push_message(msg(3), conn_a, Some(listen));

        assert_eq!(arena.len(conn_a), 2);
        assert_eq!(arena.len(conn_b), 1);
        assert_eq!(arena.len(listen), 3);
        assert_well_formed(&arena, conn_a);
        assert_well_formed(&arena, listen);

        // Pulling from one connection also removes from the aggregate.
        let out = arena.remove_up_to(conn_a, 1);
        assert_eq!(out[0].message_number, 1);
        assert_eq!(arena.len(listen), 2);
        assert_well_formed(&arena, listen);
        assert_well_formed(&arena, conn_a);

        // Pulling from the aggregate removes from the connection queue.
        let out = arena.remove_up_to(listen, 2);
        assert_eq!(
            out.iter().map(|m| m.message_number).collect::<Vec<_>>(),
            vec![2, 3]
        );
        assert!(arena.is_empty(conn_a));
        assert!(arena.is_empty(conn_b));
        assert!(arena.is_empty(listen));
    }

    #[test]
    fn aggregate_queue_merge_ordered_by_arrival() {
        let mut arena = MessageArena::new();
        let conn_a = arena.new_connection_queue();
        let conn_b = arena.new_connection_queue();
        let listen = arena.new_listen_queue();

        arena.push_message(msg(10), conn_a, Some(listen));
        arena.push_message(msg(20), conn_b, Some(listen));
        arena.push_message(msg(11), conn_a, Some(listen));

        let out = arena.remove_up_to(listen, 10);
        assert_eq!(
            out.iter().map(|m| m.message_number).collect::<Vec<_>>(),
            vec![10, 20, 11]
        );
    }

    #[test]
    fn purge_drops_everything() {
        let mut arena = MessageArena::new();
        let conn = arena.new_connection_queue();
        let listen = arena.new_listen_queue();
        for n in 1..=4 {
            arena.push_message(msg(n), conn, Some(listen));
        }
        arena.purge(conn);
        assert!(arena.is_empty(conn));
        assert!(arena.is_empty(listen));
        assert_well_formed(&arena, listen);
    }

    #[test]
    fn slot_reuse_after_release() {
        let mut arena = MessageArena::new();
        let q = arena.new_connection_queue();
        arena.push_message(msg(1), q, None);
        let _ = arena.remove_up_to(q, 1);
        arena.push_message(msg(2), q, None);
        // Reused the freed slot rather than growing.
        assert_eq!(arena.slots.len(), 1);
        assert_eq!(arena.remove_up_to(q, 1)[0].message_number, 2);
    }

    #[test]
    fn for_each_mut_updates_in_place() {
        let mut arena = MessageArena::new();
        let q = arena.new_connection_queue();
        for n in 1..=3 {
            arena.push_message(msg(n), q, None);
        }
        arena.for_each_mut(q, |m| m.connection_user_data = 42);
        let out = arena.remove_up_to(q, 3);
        assert!(out.iter().all(|m| m.connection_user_data == 42));
    }
}
