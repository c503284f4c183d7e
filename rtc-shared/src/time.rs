use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Seconds between the NTP epoch (1900) and the unix epoch (1970).
const NTP_UNIX_OFFSET_SECS: u64 = 0x83AA7E80;

/// Pairs a monotonic [`Instant`] with wall clock time so that monotonic
/// timestamps can be converted into the NTP representation carried by RTCP.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SystemInstant {
    instant: Instant,
    duration_since_unix_epoch: Duration,
}

impl SystemInstant {
    pub fn now() -> Self {
        Self {
            instant: Instant::now(),
            duration_since_unix_epoch: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_else(|_| Duration::from_secs(0)),
        }
    }

    pub fn duration_since_unix_epoch(&self) -> Duration {
        self.duration_since_unix_epoch
    }

    /// Wall clock time at `now`, saturating for instants before the baseline.
    pub fn unix(&self, now: Instant) -> Duration {
        self.duration_since_unix_epoch + now.saturating_duration_since(self.instant)
    }

    /// 64-bit NTP timestamp at `now`.
    pub fn ntp(&self, now: Instant) -> u64 {
        SystemInstant::unix2ntp(self.unix(now))
    }

    /// Middle 32 bits of the NTP timestamp at `now`, as used by the LSR/DLSR fields.
    pub fn compact_ntp(&self, now: Instant) -> u32 {
        (self.ntp(now) >> 16) as u32
    }

    pub fn unix2ntp(duration_since_unix_epoch: Duration) -> u64 {
        let u = duration_since_unix_epoch.as_nanos() as u64;

        let mut s = u / 1_000_000_000;
        s += NTP_UNIX_OFFSET_SECS;
        let mut f = u % 1_000_000_000;
        f <<= 32;
        f /= 1_000_000_000;
        s <<= 32;

        s | f
    }

    pub fn ntp2unix(ntp: u64) -> Duration {
        let s = (ntp >> 32).saturating_sub(NTP_UNIX_OFFSET_SECS);
        let mut f = ntp & 0xFFFFFFFF;
        f *= 1_000_000_000;
        f >>= 32;

        Duration::new(s, f as u32)
    }

    /// Converts a 64-bit NTP timestamp into milliseconds since the NTP epoch.
    pub fn ntp2ms(ntp: u64) -> u64 {
        let s = ntp >> 32;
        let f = ntp & 0xFFFFFFFF;
        s * 1000 + ((f * 1000) >> 32)
    }

    /// Converts a compact (middle 32 bits) NTP value into a duration.
    pub fn compact_ntp2duration(compact: u32) -> Duration {
        let s = (compact >> 16) as u64;
        let f = (compact & 0xFFFF) as u64;
        Duration::from_secs(s) + Duration::from_nanos((f * 1_000_000_000) >> 16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ntp_unix_conversion() {
        let tests = vec![
            ("epoch", Duration::from_secs(0)),
            ("one and a half seconds", Duration::from_millis(1500)),
            ("recent", Duration::from_secs(1_700_000_000)),
        ];

        for (name, unix) in tests {
            let ntp = SystemInstant::unix2ntp(unix);
            let back = SystemInstant::ntp2unix(ntp);
            let diff = back.abs_diff(unix);
            assert!(diff < Duration::from_micros(1), "{name} failed: {diff:?}");
        }
    }

    #[test]
    fn test_ntp2ms() {
        let ntp = SystemInstant::unix2ntp(Duration::from_millis(1500));
        assert_eq!(
            SystemInstant::ntp2ms(ntp),
            NTP_UNIX_OFFSET_SECS * 1000 + 1500
        );
    }

    #[test]
    fn test_compact_ntp2duration() {
        assert_eq!(
            SystemInstant::compact_ntp2duration(0x0001_8000),
            Duration::from_millis(1500)
        );
    }
}
