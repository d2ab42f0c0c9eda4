//! Interface to the reliability/reassembly engine.
//!
//! Fragmentation, retransmission and congestion control are a collaborator,
//! not part of this crate.  The connection hands it decrypted packet
//! payloads; the engine hands back completed application messages and
//! reports when its queues have drained (which is what lets a lingering
//! connection finish closing).

use bytes::Bytes;

use crate::Micros;

/// A message the engine finished reassembling.
pub struct CompletedMessage {
    pub payload: Bytes,
    pub message_number: i64,
    pub channel: i32,
}

/// The reliability engine driven by one connection.
pub trait Reliability {
    /// Consume one decrypted packet payload.  Completed messages are pushed
    /// to `out`.  Returning false tells the connection to act as if the
    /// packet was never received (it will not advance the sequence state).
    fn recv_data_chunk(
        &mut self,
        full_seq: i64,
        chunk: &[u8],
        now: Micros,
        out: &mut Vec<CompletedMessage>,
    ) -> bool;

    /// Queue an application message for delivery.  Returns the assigned
    /// message number.
    fn send_message(&mut self, payload: Bytes, flags: i32, now: Micros) -> i64;

    /// True when nothing is queued and no reliable data awaits an ack.
    fn is_drained(&self) -> bool;

    /// Next time the engine wants to run, or `Micros::MAX` for never.
    fn next_think_time(&self, now: Micros) -> Micros;

    /// The connection just reached the connected state.
    fn on_connected(&mut self, _now: Micros) {}

    /// Scheduled wakeup.
    fn think(&mut self, _now: Micros) {}

    /// Drain messages queued for transmission (number, payload).  Hosts
    /// that drive an external wire pull from here.
    fn take_outbound(&mut self) -> Vec<(i64, Bytes)> {
        Vec::new()
    }
}

/// Trivial engine: one packet is one message, nothing is retransmitted.
///
/// Used for loopback pairs and tests; real wires plug in an actual engine.
#[derive(Default)]
pub struct DatagramReliability {
    last_recv_msg_num: i64,
    last_sent_msg_num: i64,
    outbound: Vec<(i64, Bytes)>,
}

impl DatagramReliability {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Reliability for DatagramReliability {
    fn recv_data_chunk(
        &mut self,
        _full_seq: i64,
        chunk: &[u8],
        _now: Micros,
        out: &mut Vec<CompletedMessage>,
    ) -> bool {
        self.last_recv_msg_num += 1;
        out.push(CompletedMessage {
            payload: Bytes::copy_from_slice(chunk),
            message_number: self.last_recv_msg_num,
            channel: -1,
        });
        true
    }

    fn send_message(&mut self, payload: Bytes, _flags: i32, _now: Micros) -> i64 {
        self.last_sent_msg_num += 1;
        self.outbound.push((self.last_sent_msg_num, payload));
        self.last_sent_msg_num
    }

    fn is_drained(&self) -> bool {
        self.outbound.is_empty()
    }

    fn next_think_time(&self, _now: Micros) -> Micros {
        Micros::MAX
    }

    fn take_outbound(&mut self) -> Vec<(i64, Bytes)> {
        std::mem::take(&mut self.outbound)
    }
}
