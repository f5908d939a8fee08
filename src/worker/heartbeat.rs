//! Periodic sweep over a worker's controllers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::pool::{ConnectionController, ControllerHooks, ControllerState, PoolShared};
use crate::scheduler::TaskHandle;

/// What one sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Sweep {
    pub(crate) timed_out: usize,
    pub(crate) reopened: usize,
}

/// Drive every controller once: open ones are checked for a response
/// timeout, closed ones are reopened. The rest are left alone.
pub(crate) fn sweep<H: ControllerHooks>(
    controllers: &[Arc<ConnectionController<H>>],
    now: Instant,
) -> Sweep {
    let mut result = Sweep::default();
    for controller in controllers {
        match controller.state() {
            ControllerState::Open => {
                if controller.timeout_check(now) {
                    result.timed_out += 1;
                }
            }
            ControllerState::Closed => {
                if controller.open_server(false) {
                    result.reopened += 1;
                }
            }
            ControllerState::Connecting | ControllerState::Waiting | ControllerState::Dropped => {}
        }
    }
    result
}

/// Schedule the sweep on the pool's scheduler every `period`.
pub(crate) fn start<H: ControllerHooks>(pool: &Arc<PoolShared<H>>, period: Duration) -> TaskHandle {
    let weak = Arc::downgrade(pool);
    pool.scheduler().schedule_at_fixed_rate(
        period,
        period,
        Arc::new(move || {
            if let Some(pool) = weak.upgrade() {
                let result = sweep(&pool.snapshot(), Instant::now());
                trace!(
                    timed_out = result.timed_out,
                    reopened = result.reopened,
                    "heartbeat"
                );
            }
        }),
    )
}
