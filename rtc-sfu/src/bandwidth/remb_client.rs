use crate::configuration::RembSettings;
use crate::rtp_stream::RtpDataCounter;
use log::{debug, warn};
use rtp::packet::Packet;
use std::time::Instant;

/// Below this fraction of the previous estimate a new REMB is reported
/// immediately instead of waiting for the event interval.
const MAX_BITRATE_DECREMENT_FACTOR: f64 = 0.75;

/// REMB based congestion controller for the outgoing direction.
///
/// Keeps the last estimate reported by the receiver, clamped by the initial
/// and minimum bitrates, and decides how much probation traffic is needed to
/// let the receiver discover more bandwidth.
pub struct RembClient {
    settings: RembSettings,
    initial_available_bitrate_at: Option<Instant>,
    available_bitrate: u32,
    last_event_at: Option<Instant>,
    transmission_counter: RtpDataCounter,
    probation_counter: RtpDataCounter,
    probation_target_bitrate: u32,
}

impl RembClient {
    pub fn new(settings: RembSettings) -> Self {
        Self {
            settings,
            initial_available_bitrate_at: None,
            available_bitrate: settings.initial_available_bitrate,
            last_event_at: None,
            transmission_counter: RtpDataCounter::default(),
            probation_counter: RtpDataCounter::default(),
            probation_target_bitrate: 0,
        }
    }

    /// Feeds a REMB value from the receiver. Returns the new available
    /// bitrate when the caller should redistribute it.
    pub fn receive_remb_feedback(&mut self, now: Instant, remb_bitrate: u32) -> Option<u32> {
        let previous_available_bitrate = self.available_bitrate;

        self.check_status(now);

        self.available_bitrate = remb_bitrate;

        let in_initial_window = self
            .initial_available_bitrate_at
            .map(|at| now.saturating_duration_since(at) <= self.settings.initial_duration)
            .unwrap_or(false);

        if self.available_bitrate < self.settings.initial_available_bitrate && in_initial_window {
            self.available_bitrate = self.settings.initial_available_bitrate;
        } else if self.available_bitrate < self.settings.minimum_available_bitrate {
            debug!(
                "available bitrate [{}] below minimum, using minimum [{}]",
                self.available_bitrate, self.settings.minimum_available_bitrate
            );
            self.available_bitrate = self.settings.minimum_available_bitrate;
        }

        let interval_elapsed = self
            .last_event_at
            .map(|at| now.saturating_duration_since(at) >= self.settings.event_interval)
            .unwrap_or(true);

        let notify = if interval_elapsed {
            true
        } else if (self.available_bitrate as f64)
            < previous_available_bitrate as f64 * MAX_BITRATE_DECREMENT_FACTOR
        {
            warn!(
                "high REMB value decrease detected [previous:{}, now:{}]",
                previous_available_bitrate, self.available_bitrate
            );
            true
        } else {
            false
        };

        let result = if notify {
            debug!(
                "notifying available bitrate [{}]",
                self.available_bitrate
            );
            self.last_event_at = Some(now);
            Some(self.available_bitrate)
        } else {
            None
        };

        self.calculate_probation_target_bitrate(now);

        result
    }

    pub fn sent_rtp_packet(&mut self, now: Instant, packet: &Packet) {
        self.transmission_counter.update(packet, now);
    }

    pub fn sent_probation_rtp_packet(&mut self, now: Instant, packet: &Packet) {
        self.probation_counter.update(packet, now);
    }

    /// Current estimate, reset to the initial bitrate after a long silence.
    pub fn available_bitrate(&mut self, now: Instant) -> u32 {
        self.check_status(now);
        self.available_bitrate
    }

    /// Postpones the next periodic notification by one event interval.
    pub fn reschedule_next_event(&mut self, now: Instant) {
        self.last_event_at = Some(now);
    }

    pub fn is_probation_needed(&mut self, now: Instant) -> bool {
        self.probation_target_bitrate != 0
            && self.probation_counter.bitrate(now) <= self.probation_target_bitrate
    }

    pub fn probation_target_bitrate(&self) -> u32 {
        self.probation_target_bitrate
    }

    fn check_status(&mut self, now: Instant) {
        let expired = self
            .last_event_at
            .map(|at| now.saturating_duration_since(at) > self.settings.max_elapsed)
            .unwrap_or(true);

        if expired {
            self.initial_available_bitrate_at = Some(now);
            self.available_bitrate = self.settings.initial_available_bitrate;
            self.calculate_probation_target_bitrate(now);
        }
    }

    fn calculate_probation_target_bitrate(&mut self, now: Instant) {
        let previous_target = self.probation_target_bitrate;

        self.probation_target_bitrate = 0;

        if self.available_bitrate != 0 {
            let transmission_bitrate = self.transmission_counter.bitrate(now);
            let factor = transmission_bitrate as f64 / self.available_bitrate as f64;

            if (0.8..=1.2).contains(&factor) {
                if self.available_bitrate > transmission_bitrate {
                    self.probation_target_bitrate =
                        2 * (self.available_bitrate - transmission_bitrate);
                } else {
                    self.probation_target_bitrate = transmission_bitrate / 2;
                }
            } else if factor == 0.0 {
                self.probation_target_bitrate = self.available_bitrate;
            }
        }

        if self.probation_target_bitrate != previous_target {
            debug!(
                "probation target bitrate [{}]",
                self.probation_target_bitrate
            );
        }
    }
}
