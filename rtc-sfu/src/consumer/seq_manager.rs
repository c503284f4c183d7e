use crate::rtp_stream::is_seq_higher_than;
use std::collections::BTreeSet;

/// Dropped inputs this far behind the highest input are folded into the base.
const MAX_DROPPED_AGE: u16 = 0x4000;

/// Maps input sequence numbers of a switching source onto a gap-free,
/// monotone output sequence.
///
/// * [`sync`](SeqManager::sync) re-bases so that the input following the
///   given one continues right after the highest output emitted so far.
/// * [`drop`](SeqManager::drop) removes an input from the output sequence.
/// * [`input`](SeqManager::input) maps an input, skipping dropped ones.
#[derive(Debug, Default, Clone)]
pub(crate) struct SeqManager {
    started: bool,
    base: u16,
    max_input: u16,
    max_output: u16,
    dropped: BTreeSet<u16>,
}

impl SeqManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn sync(&mut self, input: u16) {
        self.base = self.max_output.wrapping_sub(input);
        self.max_input = input;
        self.dropped.clear();
    }

    pub(crate) fn drop(&mut self, input: u16) {
        if is_seq_higher_than(input, self.max_input) {
            self.max_input = input;
            self.dropped.insert(input);
        }
    }

    /// Output sequence number for `input`, or `None` if it was dropped.
    pub(crate) fn input(&mut self, input: u16) -> Option<u16> {
        if self.started && is_seq_higher_than(input, self.max_input) {
            self.max_input = input;
        }

        self.fold_old_dropped();

        if self.dropped.contains(&input) {
            return None;
        }

        let dropped_before = self.dropped_in(input.wrapping_sub(0x7fff), input).count() as u16;
        let output = input
            .wrapping_add(self.base)
            .wrapping_sub(dropped_before);

        if !self.started {
            self.started = true;
            self.max_input = input;
            self.max_output = output;
        } else if is_seq_higher_than(output, self.max_output) {
            self.max_output = output;
        }

        Some(output)
    }

    pub(crate) fn max_output(&self) -> u16 {
        self.max_output
    }

    /// Dropped inputs in the circular range `[from, to)`.
    fn dropped_in(&self, from: u16, to: u16) -> impl Iterator<Item = &u16> + '_ {
        if from <= to {
            self.dropped.range(from..to).chain(self.dropped.range(0..0))
        } else {
            self.dropped.range(from..).chain(self.dropped.range(..to))
        }
    }

    fn fold_old_dropped(&mut self) {
        let oldest_kept = self.max_input.wrapping_sub(MAX_DROPPED_AGE - 1);
        let stale: Vec<u16> = self
            .dropped_in(self.max_input.wrapping_add(1), oldest_kept)
            .copied()
            .collect();
        for d in &stale {
            self.dropped.remove(d);
        }
        self.base = self.base.wrapping_sub(stale.len() as u16);
    }
}
