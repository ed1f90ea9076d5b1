//! 64-bit NTP timestamps and RTT derivation from reception reports.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rtcp::reception_report::ReceptionReport;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const UNIX_TO_NTP_SECONDS: u64 = 2_208_988_800;

/// RFC 3550 64-bit NTP timestamp: seconds since 1900 in the upper 32 bits,
/// fraction of a second in the lower 32.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct NtpTime(pub u64);

impl NtpTime {
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(t: SystemTime) -> Self {
        let since_unix = t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        let seconds = since_unix.as_secs() + UNIX_TO_NTP_SECONDS;
        let fraction = ((since_unix.subsec_nanos() as u64) << 32) / 1_000_000_000;
        NtpTime((seconds << 32) | fraction)
    }

    pub fn to_system_time(self) -> SystemTime {
        let seconds = (self.0 >> 32).saturating_sub(UNIX_TO_NTP_SECONDS);
        let nanos = ((self.0 & 0xFFFF_FFFF) * 1_000_000_000) >> 32;
        UNIX_EPOCH + Duration::new(seconds, nanos as u32)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Middle 32 bits, the compact form carried in LSR fields.
    pub fn middle_32(self) -> u32 {
        (self.0 >> 16) as u32
    }

    /// Signed difference `self - earlier` in seconds.
    pub fn seconds_since(self, earlier: NtpTime) -> f64 {
        (self.0 as i64).wrapping_sub(earlier.0 as i64) as f64 / (1u64 << 32) as f64
    }

    pub fn add_duration(self, d: Duration) -> NtpTime {
        let ticks = (d.as_secs() << 32)
            .wrapping_add(((d.subsec_nanos() as u64) << 32) / 1_000_000_000);
        NtpTime(self.0.wrapping_add(ticks))
    }
}

/// Why an RTT could not be derived from a reception report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RttError {
    /// The report carries no LSR at all.
    #[error("no last sender report")]
    NoLastSenderReport,
    /// The report's LSR does not match the sender report we sent last.
    #[error("not last sender report")]
    NotLastSenderReport,
}

/// Derives the round-trip time in milliseconds from a reception report,
/// given the sender report it acknowledges (RFC 3550: RTT = now - LSR -
/// DLSR, all in 1/65536 second units).
pub fn rtt_from_reception_report(
    rr: &ReceptionReport,
    last_sr_ntp: NtpTime,
    last_sr_at: Instant,
) -> Result<u32, RttError> {
    if rr.last_sender_report == 0 {
        return Err(RttError::NoLastSenderReport);
    }
    if rr.last_sender_report != last_sr_ntp.middle_32() {
        return Err(RttError::NotLastSenderReport);
    }

    // now on the monotonic clock, anchored to the sender report's NTP time
    let now_ntp = last_sr_ntp.add_duration(last_sr_at.elapsed());
    let rtt_units = now_ntp
        .middle_32()
        .wrapping_sub(rr.last_sender_report)
        .wrapping_sub(rr.delay);
    if rtt_units > i32::MAX as u32 {
        // clock skew produced a negative value
        return Ok(0);
    }

    Ok(((rtt_units as u64 * 1000) >> 16) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_through_system_time() {
        let t = UNIX_EPOCH + Duration::new(1_700_000_000, 250_000_000);
        let ntp = NtpTime::from_system_time(t);
        let back = ntp.to_system_time();
        let diff = back
            .duration_since(t)
            .unwrap_or_else(|e| e.duration())
            .as_nanos();
        assert!(diff < 10);
    }

    #[test]
    fn test_seconds_since_is_signed() {
        let a = NtpTime(100u64 << 32);
        let b = NtpTime(98u64 << 32);
        assert!((a.seconds_since(b) - 2.0).abs() < 1e-9);
        assert!((b.seconds_since(a) + 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_middle_32() {
        let ntp = NtpTime(0x1234_5678_9ABC_DEF0);
        assert_eq!(ntp.middle_32(), 0x5678_9ABC);
    }

    #[test]
    fn test_rtt_requires_matching_lsr() {
        let sr_ntp = NtpTime(0x1234_5678_9ABC_DEF0);
        let rr = ReceptionReport {
            last_sender_report: 0,
            ..Default::default()
        };
        assert_eq!(
            rtt_from_reception_report(&rr, sr_ntp, Instant::now()),
            Err(RttError::NoLastSenderReport)
        );

        let rr = ReceptionReport {
            last_sender_report: 1,
            ..Default::default()
        };
        assert_eq!(
            rtt_from_reception_report(&rr, sr_ntp, Instant::now()),
            Err(RttError::NotLastSenderReport)
        );
    }

    #[test]
    fn test_rtt_subtracts_dlsr() {
        let sr_ntp = NtpTime::now();
        let at = Instant::now() - Duration::from_millis(200);
        let rr = ReceptionReport {
            last_sender_report: sr_ntp.middle_32(),
            // subscriber held the report for 100ms: 0.1 * 65536
            delay: 6554,
            ..Default::default()
        };

        let rtt = rtt_from_reception_report(&rr, sr_ntp, at).unwrap();
        assert!((80..=120).contains(&rtt), "rtt = {rtt}");
    }
}
