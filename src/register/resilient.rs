use super::{AlertRegister, RejectionRecord};
use crate::error::RegisterWriteError;
use crate::metrics::{bump, RunCounters};
use crate::retry::ExponentialBackoff;
use std::sync::Arc;

/// Wraps a register so write failures never reach the run loop
///
/// Its operations are infallible: failures are counted in `register_errors`
/// and logged.
///
/// Each failing call is retried with exponential backoff. Once a call
/// exhausts the backoff budget the register is abandoned and records are
/// only logged from then on.
pub struct ResilientRegister {
    inner: Box<dyn AlertRegister>,
    backoff: ExponentialBackoff,
    degraded: bool,
    counters: Arc<RunCounters>,
}

impl ResilientRegister {
    pub fn new(inner: Box<dyn AlertRegister>, backoff: ExponentialBackoff, counters: Arc<RunCounters>) -> Self {
        Self {
            inner,
            backoff,
            degraded: false,
            counters,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    fn attempt<F>(&mut self, what: &str, mut op: F) -> bool
    where
        F: FnMut(&mut dyn AlertRegister) -> Result<(), RegisterWriteError>,
    {
        if self.degraded {
            return false;
        }

        self.backoff.reset();
        let last_error = loop {
            match op(self.inner.as_mut()) {
                Ok(()) => return true,
                Err(e) => {
                    if self.backoff.sleep_blocking().is_err() {
                        break e;
                    }
                }
            }
        };

        bump(&self.counters.register_errors);
        self.degraded = true;
        log::error!(
            "❌ Rejection register {} failed after {} retries, logging only from now on: {}",
            what,
            self.backoff.attempts(),
            last_error
        );
        false
    }
}

impl ResilientRegister {
    /// Writes the record, or only logs it once the register is degraded
    pub fn append(&mut self, record: &RejectionRecord) {
        if !self.attempt("append", |r| r.append(record)) {
            log::warn!(
                "⚠️  Rejected alert {} (stock {}, {}) reason={:?} previously_accepted={}",
                record.alert_id,
                record.stock,
                record.native_id,
                record.reason,
                record.previously_accepted
            );
        }
    }

    /// `false` when the register ran degraded or could not be closed
    pub fn close(&mut self) -> bool {
        self.attempt("close", |r| r.close())
    }

    pub fn backend_type(&self) -> &'static str {
        self.inner.backend_type()
    }
}
