//! End-to-end link statistics.
//!
//! Per-connection bookkeeping for the sequenced packet flow in both
//! directions: send-side packet numbering, receive-side expansion and
//! duplicate rejection, ping sampling, and the reply-timeout counting the
//! keepalive policy keys off.

use keel_crypto::SequenceTracker;

use crate::Micros;

/// How long we wait for a reply we explicitly requested before counting a
/// reply timeout.
pub const REPLY_TIMEOUT: Micros = crate::MILLION;

/// Smoothed ping estimate.  -1 until the first sample lands.
#[derive(Debug, Clone, Default)]
pub struct PingTracker {
    smoothed_ms: i32,
    samples: u32,
}

impl PingTracker {
    pub fn new() -> Self {
        Self {
            smoothed_ms: -1,
            samples: 0,
        }
    }

    pub fn received_ping(&mut self, ping_ms: i32) {
        self.smoothed_ms = if self.samples == 0 {
            ping_ms
        } else {
            // Standard 3:1 exponential smoothing.
            (self.smoothed_ms * 3 + ping_ms) / 4
        };
        self.samples += 1;
    }

    pub fn smoothed_ping_ms(&self) -> i32 {
        if self.samples == 0 {
            -1
        } else {
            self.smoothed_ms
        }
    }
}

/// Stats and sequencing state for one connection's end-to-end flow.
#[derive(Debug, Clone)]
pub struct EndToEndStats {
    /// Peer protocol version; 0 until we learn it, immutable afterwards.
    pub peer_protocol_version: u32,

    pub ping: PingTracker,
    pub seq: SequenceTracker,

    next_send_seq: i64,
    pub time_last_sent_seq: Micros,

    pub time_last_recv: Micros,
    pub time_last_recv_seq: Micros,

    pub pkts_sent: i64,
    pub bytes_sent: i64,
    pub pkts_recv: i64,
    pub bytes_recv: i64,

    /// Consecutive requested replies that never arrived.
    pub reply_timeouts_since_last_recv: i32,
    /// Deadline of the currently in-flight reply request; 0 when none.
    pub in_flight_reply_timeout: Micros,
    /// When we last sent something expecting an immediate reply.
    pub last_send_expecting_reply: Micros,

    disconnected: bool,
}

impl EndToEndStats {
    pub fn new(start_disconnected: bool) -> Self {
        Self {
            peer_protocol_version: 0,
            ping: PingTracker::new(),
            seq: SequenceTracker::new(),
            next_send_seq: 1,
            time_last_sent_seq: 0,
            time_last_recv: 0,
            time_last_recv_seq: 0,
            pkts_sent: 0,
            bytes_sent: 0,
            pkts_recv: 0,
            bytes_recv: 0,
            reply_timeouts_since_last_recv: 0,
            in_flight_reply_timeout: 0,
            last_send_expecting_reply: 0,
            disconnected: start_disconnected,
        }
    }

    /// Consume the next send sequence number; returns the full value.
    /// The low 16 bits go on the wire.
    pub fn consume_send_packet_number(&mut self, now: Micros) -> i64 {
        self.time_last_sent_seq = now;
        let n = self.next_send_seq;
        self.next_send_seq += 1;
        n
    }

    pub fn next_send_sequence(&self) -> i64 {
        self.next_send_seq
    }

    /// Called for every arriving packet, before it is even decrypted.
    pub fn track_recv_packet(&mut self, packet_bytes: usize, now: Micros) {
        self.pkts_recv += 1;
        self.bytes_recv += packet_bytes as i64;
        self.time_last_recv = now;
        self.in_flight_reply_timeout = 0;
        self.reply_timeouts_since_last_recv = 0;
    }

    /// Called once a sequenced packet has been fully processed.  Must only
    /// be given values vetted by the sequence tracker.
    pub fn track_process_sequenced_packet(&mut self, pkt_num: i64, now: Micros) {
        self.seq.mark_received(pkt_num);
        self.time_last_recv_seq = now;
    }

    pub fn track_sent_packet(&mut self, packet_bytes: usize) {
        self.pkts_sent += 1;
        self.bytes_sent += packet_bytes as i64;
    }

    /// We just sent something that demands a prompt reply.
    pub fn track_sent_ping_request(&mut self, now: Micros) {
        self.in_flight_reply_timeout = now + REPLY_TIMEOUT;
        self.last_send_expecting_reply = now;
    }

    /// The peer acknowledged our outstanding request.
    pub fn peer_acked(&mut self) {
        self.in_flight_reply_timeout = 0;
    }

    pub fn set_disconnected(&mut self, disconnected: bool) {
        self.disconnected = disconnected;
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    /// Periodic upkeep: expire the in-flight reply request.
    pub fn think(&mut self, now: Micros) {
        if self.in_flight_reply_timeout != 0 && now >= self.in_flight_reply_timeout {
            self.in_flight_reply_timeout = 0;
            self.reply_timeouts_since_last_recv += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_sequence_increments() {
        let mut s = EndToEndStats::new(true);
        assert_eq!(s.consume_send_packet_number(10), 1);
        assert_eq!(s.consume_send_packet_number(20), 2);
        assert_eq!(s.next_send_sequence(), 3);
        assert_eq!(s.time_last_sent_seq, 20);
    }

    #[test]
    fn recv_resets_reply_timeouts() {
        let mut s = EndToEndStats::new(false);
        s.track_sent_ping_request(0);
        s.think(REPLY_TIMEOUT + 1);
        assert_eq!(s.reply_timeouts_since_last_recv, 1);

        s.track_sent_ping_request(REPLY_TIMEOUT + 2);
        s.think(2 * REPLY_TIMEOUT + 3);
        assert_eq!(s.reply_timeouts_since_last_recv, 2);

        s.track_recv_packet(100, 3 * REPLY_TIMEOUT);
        assert_eq!(s.reply_timeouts_since_last_recv, 0);
        assert_eq!(s.in_flight_reply_timeout, 0);
    }

    #[test]
    fn ping_smoothing() {
        let mut p = PingTracker::new();
        assert_eq!(p.smoothed_ping_ms(), -1);
        p.received_ping(100);
        assert_eq!(p.smoothed_ping_ms(), 100);
        p.received_ping(0);
        assert_eq!(p.smoothed_ping_ms(), 75);
    }
}
