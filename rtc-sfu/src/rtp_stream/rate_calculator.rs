use rtp::packet::Packet;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use util::marshal::MarshalSize;

const DEFAULT_WINDOW: Duration = Duration::from_millis(1000);
/// Converts bytes per millisecond into bits per second.
const DEFAULT_SCALE: f64 = 8000.0;

/// Sliding window byte rate.
#[derive(Debug, Clone)]
pub struct RateCalculator {
    window: Duration,
    scale: f64,
    samples: VecDeque<(Instant, usize)>,
    total: usize,
}

impl Default for RateCalculator {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_SCALE)
    }
}

impl RateCalculator {
    pub fn new(window: Duration, scale: f64) -> Self {
        Self {
            window,
            scale,
            samples: VecDeque::new(),
            total: 0,
        }
    }

    pub fn update(&mut self, size: usize, now: Instant) {
        self.expire(now);
        self.samples.push_back((now, size));
        self.total += size;
    }

    /// Rate over the window ending at `now`.
    pub fn rate(&mut self, now: Instant) -> u32 {
        self.expire(now);
        let window_ms = self.window.as_millis().max(1) as f64;
        (self.total as f64 * self.scale / window_ms) as u32
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&(at, size)) = self.samples.front() {
            if now.saturating_duration_since(at) < self.window {
                break;
            }
            self.samples.pop_front();
            self.total -= size;
        }
    }
}

const RTP_DATA_COUNTER_WINDOW: Duration = Duration::from_millis(2500);

/// Packet and byte counters plus a bitrate estimate for a flow of RTP packets.
#[derive(Debug, Clone)]
pub struct RtpDataCounter {
    packets: usize,
    bytes: usize,
    rate: RateCalculator,
}

impl Default for RtpDataCounter {
    fn default() -> Self {
        Self {
            packets: 0,
            bytes: 0,
            rate: RateCalculator::new(RTP_DATA_COUNTER_WINDOW, DEFAULT_SCALE),
        }
    }
}

impl RtpDataCounter {
    pub fn update(&mut self, packet: &Packet, now: Instant) {
        let size = packet.marshal_size();
        self.packets += 1;
        self.bytes += size;
        self.rate.update(size, now);
    }

    pub fn bitrate(&mut self, now: Instant) -> u32 {
        self.rate.rate(now)
    }

    pub fn packet_count(&self) -> usize {
        self.packets
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}
