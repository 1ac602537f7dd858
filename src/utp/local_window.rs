//! Receive-side reorder buffer
//!
//! Payloads are staged by sequence number until every earlier packet has
//! arrived, then appended to the readable stream in order.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};

use super::packet::{SelectiveAck, SELECTIVE_ACK_BITS};

/// Packets farther ahead than this are treated as stale or bogus
pub const MAX_REORDER_DISTANCE: u16 = 0x7FFF;

/// Reorder buffer plus readable byte stream
#[derive(Debug)]
pub struct LocalWindow {
    /// Highest sequence number for which all earlier ones were delivered
    last_seq_nr: u16,

    /// In-order bytes waiting for the reader
    readable: BytesMut,

    /// Out-of-order payloads keyed by sequence number
    staged: BTreeMap<u16, Bytes>,

    /// Sum of staged payload lengths
    staged_bytes: usize,

    /// Total buffer capacity (readable + staged)
    capacity: usize,
}

impl LocalWindow {
    pub fn new(capacity: u32) -> Self {
        Self {
            last_seq_nr: 0,
            readable: BytesMut::new(),
            staged: BTreeMap::new(),
            staged_bytes: 0,
            capacity: capacity as usize,
        }
    }

    pub fn last_seq_nr(&self) -> u16 {
        self.last_seq_nr
    }

    /// Anchor the window at the peer's initial sequence number
    pub fn set_last_seq_nr(&mut self, seq_nr: u16) {
        self.last_seq_nr = seq_nr;
        self.staged.clear();
        self.staged_bytes = 0;
    }

    /// Store a payload; returns how many bytes became readable
    pub fn packet_received(&mut self, seq_nr: u16, payload: &[u8]) -> usize {
        let distance = seq_nr.wrapping_sub(self.last_seq_nr);
        if distance == 0 || distance > MAX_REORDER_DISTANCE {
            // Already delivered
            return 0;
        }

        if self.staged.contains_key(&seq_nr) {
            return 0;
        }

        if self.used() + payload.len() > self.capacity {
            tracing::trace!(
                "uTP: receive buffer full, dropping seq {} ({} bytes)",
                seq_nr,
                payload.len()
            );
            return 0;
        }

        self.staged.insert(seq_nr, Bytes::copy_from_slice(payload));
        self.staged_bytes += payload.len();
        self.deliver_contiguous()
    }

    /// Move the contiguous run after `last_seq_nr` into the readable stream
    fn deliver_contiguous(&mut self) -> usize {
        let mut delivered = 0;
        loop {
            let next = self.last_seq_nr.wrapping_add(1);
            match self.staged.remove(&next) {
                Some(data) => {
                    self.staged_bytes -= data.len();
                    delivered += data.len();
                    self.readable.extend_from_slice(&data);
                    self.last_seq_nr = next;
                }
                None => break,
            }
        }
        delivered
    }

    /// Let a payload-less packet (FIN) consume its sequence number once contiguous
    pub fn advance_past(&mut self, seq_nr: u16) -> bool {
        if seq_nr != self.last_seq_nr.wrapping_add(1) {
            return false;
        }
        self.last_seq_nr = seq_nr;
        self.deliver_contiguous();
        true
    }

    /// Remove up to `max_len` readable bytes
    pub fn read(&mut self, max_len: usize) -> Bytes {
        let len = max_len.min(self.readable.len());
        self.readable.split_to(len).freeze()
    }

    /// Readable bytes
    pub fn fill(&self) -> usize {
        self.readable.len()
    }

    /// No readable bytes left
    pub fn is_empty(&self) -> bool {
        self.readable.is_empty()
    }

    pub fn staged_packets(&self) -> usize {
        self.staged.len()
    }

    fn used(&self) -> usize {
        self.readable.len() + self.staged_bytes
    }

    /// Buffer space advertised in `wnd_size`
    pub fn available_space(&self) -> u32 {
        self.capacity.saturating_sub(self.used()) as u32
    }

    /// Bitmap of staged packets in `last_seq_nr + 2 ..= last_seq_nr + 33`
    pub fn selective_ack(&self) -> Option<SelectiveAck> {
        if self.staged.is_empty() {
            return None;
        }

        let base = self.last_seq_nr.wrapping_add(2);
        let mut sack = SelectiveAck::empty();
        let mut any = false;
        for i in 0..SELECTIVE_ACK_BITS {
            if self.staged.contains_key(&base.wrapping_add(i)) {
                sack.set_acked(i);
                any = true;
            }
        }

        any.then_some(sack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window_at(seq: u16) -> LocalWindow {
        let mut wnd = LocalWindow::new(1024);
        wnd.set_last_seq_nr(seq);
        wnd
    }

    #[test]
    fn test_in_order_delivery() {
        let mut wnd = window_at(1);
        assert_eq!(wnd.packet_received(2, b"hel"), 3);
        assert_eq!(wnd.packet_received(3, b"lo"), 2);
        assert_eq!(wnd.last_seq_nr(), 3);
        assert_eq!(&wnd.read(100)[..], b"hello");
        assert!(wnd.is_empty());
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let mut wnd = window_at(1);
        assert_eq!(wnd.packet_received(4, b"c"), 0);
        assert_eq!(wnd.packet_received(3, b"b"), 0);
        assert_eq!(wnd.staged_packets(), 2);
        assert_eq!(wnd.last_seq_nr(), 1);

        assert_eq!(wnd.packet_received(2, b"a"), 3);
        assert_eq!(wnd.last_seq_nr(), 4);
        assert_eq!(wnd.staged_packets(), 0);
        assert_eq!(&wnd.read(10)[..], b"abc");
    }

    #[test]
    fn test_duplicates_are_ignored() {
        let mut wnd = window_at(1);
        wnd.packet_received(3, b"b");
        assert_eq!(wnd.packet_received(3, b"b"), 0);
        wnd.packet_received(2, b"a");
        assert_eq!(wnd.packet_received(2, b"a"), 0);
        assert_eq!(wnd.packet_received(1, b"old"), 0);
        assert_eq!(&wnd.read(10)[..], b"ab");
    }

    #[test]
    fn test_partial_read_fifo() {
        let mut wnd = window_at(0);
        wnd.packet_received(1, b"abcdef");
        assert_eq!(&wnd.read(2)[..], b"ab");
        assert_eq!(&wnd.read(3)[..], b"cde");
        assert_eq!(wnd.fill(), 1);
        assert_eq!(&wnd.read(10)[..], b"f");
        assert!(wnd.read(10).is_empty());
    }

    #[test]
    fn test_available_space_tracks_buffered_bytes() {
        let mut wnd = LocalWindow::new(10);
        wnd.set_last_seq_nr(0);
        assert_eq!(wnd.available_space(), 10);

        wnd.packet_received(2, b"xyz");
        assert_eq!(wnd.available_space(), 7);

        // Would overflow the buffer
        assert_eq!(wnd.packet_received(1, b"12345678"), 0);
        assert_eq!(wnd.last_seq_nr(), 0);

        wnd.packet_received(1, b"1234");
        assert_eq!(wnd.available_space(), 3);
        wnd.read(7);
        assert_eq!(wnd.available_space(), 10);
    }

    #[test]
    fn test_selective_ack_bitmap() {
        let mut wnd = window_at(10);
        assert!(wnd.selective_ack().is_none());

        wnd.packet_received(12, b"x"); // offset 0
        wnd.packet_received(15, b"y"); // offset 3
        wnd.packet_received(43, b"z"); // offset 31

        let sack = wnd.selective_ack().unwrap();
        assert_eq!(sack.acked_offsets().collect::<Vec<_>>(), vec![0, 3, 31]);
    }

    #[test]
    fn test_selective_ack_outside_range() {
        let mut wnd = window_at(10);
        wnd.packet_received(100, b"far");
        assert_eq!(wnd.staged_packets(), 1);
        assert!(wnd.selective_ack().is_none());
    }

    #[test]
    fn test_wrapping_sequence_numbers() {
        let mut wnd = window_at(65534);
        wnd.packet_received(0, b"c");
        wnd.packet_received(65535, b"b");
        assert_eq!(wnd.last_seq_nr(), 0);
        assert_eq!(&wnd.read(10)[..], b"bc");
    }

    #[test]
    fn test_advance_past_fin() {
        let mut wnd = window_at(5);
        // FIN (seq 7) overtakes the last data packet
        assert!(!wnd.advance_past(7));
        wnd.packet_received(6, b"late");
        assert!(wnd.advance_past(7));
        assert_eq!(wnd.last_seq_nr(), 7);
        assert_eq!(&wnd.read(10)[..], b"late");
    }
}
