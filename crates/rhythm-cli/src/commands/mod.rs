pub mod companion;
pub mod config;
pub mod simulate;
pub mod watch;

use rhythm_core::{MotionPattern, MotionSource, SimulatedMotionSource, UnavailableMotionSource};
use std::time::Duration;

/// Motion for a simulated wearer: one wrist flick per rep unless `still`.
pub fn motion_source(
    still: bool,
    no_sensor: bool,
    rep_interval: Duration,
) -> Box<dyn MotionSource> {
    if no_sensor {
        return Box::new(UnavailableMotionSource);
    }
    let pattern = if still {
        MotionPattern::Still
    } else {
        MotionPattern::Rhythmic {
            period: rep_interval,
        }
    };
    Box::new(SimulatedMotionSource::new(pattern))
}
