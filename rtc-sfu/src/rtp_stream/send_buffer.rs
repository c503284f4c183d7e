//! Retransmission storage for packets sent on a consumer stream.

use super::is_seq_higher_than;
use rtp::packet::Packet;
use shared::error::{Error, Result};
use std::time::Instant;

/// A sent packet kept for retransmission.
#[derive(Debug, Clone)]
pub(crate) struct StoredPacket {
    pub(crate) packet: Packet,
    pub(crate) resent_at: Option<Instant>,
    pub(crate) sent_times: u8,
}

/// Ring of sent packets indexed by output sequence number.
///
/// The ring size is a power of two so that a sequence number maps onto a
/// fixed slot; slots skipped by a sequence gap are cleared.
pub(crate) struct SendBuffer {
    slots: Vec<Option<StoredPacket>>,
    size: u16,
    highest: u16,
    started: bool,
}

impl SendBuffer {
    pub(crate) fn new(size: u16) -> Result<Self> {
        if !size.is_power_of_two() {
            return Err(Error::ErrInvalidSendBufferSize(size));
        }

        Ok(Self {
            slots: vec![None; size as usize],
            size,
            highest: 0,
            started: false,
        })
    }

    fn index(&self, seq: u16) -> usize {
        (seq % self.size) as usize
    }

    pub(crate) fn insert(&mut self, packet: Packet) {
        let seq = packet.header.sequence_number;

        if !self.started {
            self.started = true;
            self.highest = seq;
        } else if is_seq_higher_than(seq, self.highest) {
            let mut i = self.highest.wrapping_add(1);
            while i != seq {
                let idx = self.index(i);
                self.slots[idx] = None;
                i = i.wrapping_add(1);
            }
            self.highest = seq;
        } else if self.highest.wrapping_sub(seq) >= self.size {
            // older than the ring can hold
            return;
        }

        let idx = self.index(seq);
        self.slots[idx] = Some(StoredPacket {
            packet,
            resent_at: None,
            sent_times: 0,
        });
    }

    pub(crate) fn get_mut(&mut self, seq: u16) -> Option<&mut StoredPacket> {
        if !self.started {
            return None;
        }

        let diff = self.highest.wrapping_sub(seq);
        if diff >= (1 << 15) || diff >= self.size {
            return None;
        }

        let idx = self.index(seq);
        self.slots[idx]
            .as_mut()
            .filter(|stored| stored.packet.header.sequence_number == seq)
    }

    pub(crate) fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.started = false;
    }
}
