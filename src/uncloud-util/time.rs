//! Time helpers, mirroring `garage_util::time`: a single `now_msec`
//! used everywhere instead of scattering `SystemTime::now()` calls, plus
//! the NTP-64 fixed point conversion needed to decode SWIM timestamps
//! off the store's admin socket (spec §4.B).

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_msec() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("system clock before 1970")
		.as_millis() as u64
}

/// Convert an NTP-64 timestamp (32-bit seconds, 32-bit fraction) into
/// `(secs, nsecs)` wall-clock, per spec §4.B:
/// `nsecs = (frac * 1e9) >> 32`.
pub fn ntp64_to_wall(ntp64: u64) -> (u64, u32) {
	let secs = ntp64 >> 32;
	let frac = ntp64 & 0xFFFF_FFFF;
	let nsecs = ((frac * 1_000_000_000) >> 32) as u32;
	(secs, nsecs)
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn ntp64_zero_fraction_is_exact_second() {
		let ntp = 100u64 << 32;
		assert_eq!(ntp64_to_wall(ntp), (100, 0));
	}

	#[test]
	fn ntp64_half_fraction_is_half_second() {
		let ntp = (100u64 << 32) | (1u64 << 31);
		let (secs, nsecs) = ntp64_to_wall(ntp);
		assert_eq!(secs, 100);
		assert!((nsecs as i64 - 500_000_000).abs() < 2);
	}

	#[test]
	fn now_msec_increases() {
		let a = now_msec();
		std::thread::sleep(std::time::Duration::from_millis(5));
		let b = now_msec();
		assert!(b >= a);
	}
}
