use std::thread;
use std::time::Duration;

use anyhow::Result;

use crate::error::Error;

/// Default polling budget, in seconds.
pub const DEFAULT_TIMEOUT: u64 = 900;

/// Call `predicate` once a second until it returns true.
///
/// The predicate receives one flag telling it whether this is the last
/// attempt. `predicate(false)` is called up to `timeout` times with a one
/// second wall-clock pause between calls; any true return ends the poll.
/// Once the budget is spent the predicate is called a final time with the
/// flag set, giving it a chance to log diagnostics, and a false return
/// fails with [`Error::Timeout`].
///
/// A predicate error aborts the poll immediately. The `wait_for_unit`
/// family relies on this to turn definitive readings into hard failures.
pub fn retry<F>(mut predicate: F, timeout: u64) -> Result<()>
where
    F: FnMut(bool) -> Result<bool>,
{
    for _ in 0..timeout {
        if predicate(false)? {
            return Ok(());
        }
        thread::sleep(Duration::from_secs(1));
    }

    if !predicate(true)? {
        return Err(Error::Timeout(timeout).into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    #[test]
    fn test_returns_as_soon_as_predicate_holds() {
        let mut attempts = 0;
        retry(
            |last| {
                attempts += 1;
                assert!(!last);
                Ok(attempts == 2)
            },
            10,
        )
        .unwrap();
        assert_eq!(attempts, 2);
    }

    #[test]
    fn test_final_attempt_is_flagged() {
        let mut flags = Vec::new();
        let err = retry(
            |last| {
                flags.push(last);
                Ok(false)
            },
            1,
        )
        .unwrap_err();

        assert_eq!(flags, vec![false, true]);
        match err.downcast_ref::<Error>() {
            Some(Error::Timeout(1)) => (),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_predicate_error_aborts_poll() {
        let mut attempts = 0;
        let err = retry(
            |_| {
                attempts += 1;
                bail!("definitive failure")
            },
            5,
        )
        .unwrap_err();

        assert_eq!(attempts, 1);
        assert!(err.downcast_ref::<Error>().is_none());
    }

    #[test]
    fn test_last_attempt_may_still_succeed() {
        let mut attempts = 0;
        retry(
            |last| {
                attempts += 1;
                Ok(last)
            },
            1,
        )
        .unwrap();
        assert_eq!(attempts, 2);
    }
}
