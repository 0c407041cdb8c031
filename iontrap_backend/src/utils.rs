use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::*;

/// Largest trap-RF control voltage magnitude the DAC may be commanded to, in volts
pub const MAX_TRAP_DEPTH: f64 = 3.;

/// Rejects trap-depth requests outside `[-3, 3]` V. Out-of-range requests are never clamped.
pub fn validate_trap_depth(voltage: f64) -> Result<f64> {
    if !(-MAX_TRAP_DEPTH..=MAX_TRAP_DEPTH).contains(&voltage) {
        return Err(Error::TrapDepthOutOfRange(voltage));
    }
    Ok(voltage)
}

/// Seconds since the Unix epoch; a clock set before 1970 reads as 0.
pub fn unix_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.)
}

// Utility class for time-tracking
pub struct TickTimer {
    pub milis: f64,
}

impl Default for TickTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl TickTimer {
    pub fn new() -> Self {
        Self {
            milis: unix_time() * 1e3,
        }
    }

    /// Milliseconds since the previous tick
    pub fn tick(&mut self) -> f64 {
        let milis = unix_time() * 1e3;
        let diff = milis - self.milis;
        self.milis = milis;
        diff
    }

    pub fn tick_print(&mut self, msg: &str) -> f64 {
        let diff = self.tick();
        log::debug!("{}: {:.3} ms", msg, diff);
        diff
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn trap_depth_bounds() {
        assert_eq!(validate_trap_depth(-3.).unwrap(), -3.);
        assert_eq!(validate_trap_depth(2.5).unwrap(), 2.5);
        assert!(matches!(
            validate_trap_depth(3.2),
            Err(Error::TrapDepthOutOfRange(_))
        ));
        assert!(validate_trap_depth(f64::NAN).is_err());
    }

    #[test]
    fn ticks_are_non_negative() {
        let mut timer = TickTimer::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(timer.tick_print("sleep") >= 1.);
    }
}
