use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::error::*;
use crate::hardware::{HardwareError, HwResult};

/// Number of attempts for a DDS write before the error is surfaced
pub const DDS_WRITE_ATTEMPTS: usize = 3;
/// Wait before the first retry; doubled after every failed attempt
pub const DDS_RETRY_BACKOFF: Duration = Duration::from_millis(20);

/// Runs `op` up to `attempts` times, sleeping `backoff`, `2 backoff`, ... between attempts.
/// Non-transient errors are returned immediately.
pub fn with_retries<T, F>(what: &str, attempts: usize, backoff: Duration, mut op: F) -> HwResult<T>
where
    F: FnMut() -> HwResult<T>,
{
    let mut delay = backoff;
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < attempts => {
                log::warn!("{what} failed (attempt {attempt}/{attempts}): {err}");
                std::thread::sleep(delay);
                delay *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// [`with_retries`] with the DDS retry policy
pub fn dds_write<T, F>(what: &str, op: F) -> HwResult<T>
where
    F: FnMut() -> HwResult<T>,
{
    with_retries(what, DDS_WRITE_ATTEMPTS, DDS_RETRY_BACKOFF, op)
}

/// Converts configured seconds into a `Duration`; negative or non-finite values become zero.
pub fn secs(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds).unwrap_or_default()
}

/// Ownership of the hardware-mutating resources: trap depth, oven/shutter lines and DDS profiles.
///
/// Exactly one [`ControlGuard`] can exist per token at a time. Operations that command those
/// resources take a `&ControlGuard` and check that it was issued by their token.
#[derive(Clone, Default)]
pub struct ControlToken {
    owner: Arc<Mutex<Option<String>>>,
}

impl ControlToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, owner: &str) -> Result<ControlGuard> {
        let mut slot = self.owner.lock();
        if let Some(current) = slot.as_ref() {
            return Err(Error::HardwareBusy {
                owner: current.clone(),
            });
        }
        *slot = Some(owner.to_string());
        log::debug!("Hardware control acquired by {owner}");
        Ok(ControlGuard {
            owner: self.owner.clone(),
            name: owner.to_string(),
        })
    }

    pub fn owner(&self) -> Option<String> {
        self.owner.lock().clone()
    }

    /// Fails unless `guard` was issued by this token
    pub fn check(&self, guard: &ControlGuard) -> Result<()> {
        if Arc::ptr_eq(&self.owner, &guard.owner) {
            Ok(())
        } else {
            Err(Error::HardwareBusy {
                owner: self.owner().unwrap_or_else(|| "nobody".to_string()),
            })
        }
    }
}

pub struct ControlGuard {
    owner: Arc<Mutex<Option<String>>>,
    name: String,
}

impl ControlGuard {
    pub fn owner(&self) -> &str {
        &self.name
    }
}

impl Drop for ControlGuard {
    fn drop(&mut self) {
        *self.owner.lock() = None;
        log::debug!("Hardware control released by {}", self.name);
    }
}

/// Error helper for instruments that hang
pub fn timeout(what: &str, limit: Duration) -> Error {
    Error::Timeout {
        what: what.to_string(),
        seconds: limit.as_secs_f64(),
    }
}

/// Collapses the outcome of a best-effort cleanup step into a log line
pub fn log_cleanup(what: &str, result: HwResult<()>) -> std::result::Result<(), HardwareError> {
    if let Err(err) = &result {
        log::error!("Cleanup step '{what}' failed: {err}");
    }
    result
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn second_owner_is_refused_until_release() {
        let token = ControlToken::new();
        let guard = token.acquire("load").unwrap();
        match token.acquire("manual") {
            Err(Error::HardwareBusy { owner }) => assert_eq!(owner, "load"),
            _ => panic!("expected HardwareBusy"),
        }
        assert!(token.check(&guard).is_ok());
        drop(guard);
        assert_eq!(token.owner(), None);
        assert!(token.acquire("manual").is_ok());
    }

    #[test]
    fn foreign_guard_is_rejected() {
        let token = ControlToken::new();
        let other = ControlToken::new();
        let guard = other.acquire("elsewhere").unwrap();
        assert!(token.check(&guard).is_err());
    }

    #[test]
    fn transient_errors_are_retried() {
        let calls = Cell::new(0);
        let result = with_retries("write", 3, Duration::from_millis(1), || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(HardwareError::Busy("DDS".to_string()))
            } else {
                Ok(calls.get())
            }
        });
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn retries_are_bounded() {
        let calls = Cell::new(0);
        let result: HwResult<()> = with_retries("write", 3, Duration::from_millis(1), || {
            calls.set(calls.get() + 1);
            Err(HardwareError::Busy("DDS".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn rejected_commands_fail_immediately() {
        let calls = Cell::new(0);
        let result: HwResult<()> = with_retries("write", 3, Duration::from_millis(1), || {
            calls.set(calls.get() + 1);
            Err(HardwareError::Rejected {
                device: "DDS".to_string(),
                msg: "bad profile".to_string(),
            })
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }
}
