//! Multi-level feedback queue scheduling.
//!
//! Under MLFQS the user does not choose priorities. Every thread's priority is
//! derived from how much CPU it received recently and from its niceness:
//!
//! ```text
//! priority   = PRI_MAX - recent_cpu / 4 - nice * 2
//! recent_cpu = (2 * load_avg) / (2 * load_avg + 1) * recent_cpu + nice
//! load_avg   = (59 / 60) * load_avg + (1 / 60) * ready_threads
//! ```
//!
//! `recent_cpu` of the running thread grows by one every tick; `load_avg` and
//! every `recent_cpu` are updated once per second, priorities every fourth
//! tick.

use super::{PRI_MAX, PRI_MIN};
use crate::fixed_point::Fixed;

/// Priority of a thread with the given history and niceness.
pub(crate) fn priority(recent_cpu: Fixed, nice: i32) -> i32 {
    (Fixed::from_int(PRI_MAX) - recent_cpu / 4 - nice * 2)
        .trunc()
        .clamp(PRI_MIN, PRI_MAX)
}

/// The next load average, given the number of threads that are ready or
/// running.
pub(crate) fn load_avg(load_avg: Fixed, ready_threads: usize) -> Fixed {
    Fixed::from_int(59) / 60 * load_avg + Fixed::ONE / 60 * ready_threads as i32
}

/// Decay coefficient applied to `recent_cpu` once per second.
pub(crate) fn decay(load_avg: Fixed) -> Fixed {
    let twice = load_avg * 2;
    twice / (twice + 1)
}

pub(crate) fn recent_cpu(recent_cpu: Fixed, decay: Fixed, nice: i32) -> Fixed {
    decay * recent_cpu + nice
}
