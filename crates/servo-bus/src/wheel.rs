//! Switch positional servos into continuous rotation.
//!
//! A servo with both angle limits at zero ignores goal position and follows goal speed.

use crate::context::BusContext;
use crate::error::{Result, ServoError};
use crate::protocol::registers;
use crate::queue::CommandQueue;
use crate::types::DeviceId;

/// Zero both angle limits. Both writes are always queued; the switch only counts as
/// successful when both land.
pub async fn enable_wheel_mode(queue: &CommandQueue<BusContext>, id: DeviceId) -> Result<()> {
    let min = queue.submit("wheel mode: min limit", move |ctx: &mut BusContext| {
        ctx.write_angle_limit(id, registers::MIN_ANGLE_LIMIT, 0)
    });
    let max = queue.submit("wheel mode: max limit", move |ctx: &mut BusContext| {
        ctx.write_angle_limit(id, registers::MAX_ANGLE_LIMIT, 0)
    });
    let (min, max) = (min.await, max.await);
    match (&min, &max) {
        (Ok(_), Ok(_)) => {
            tracing::info!(servo = id, "wheel mode enabled");
            Ok(())
        }
        _ => {
            tracing::warn!(
                servo = id,
                min_ok = min.is_ok(),
                max_ok = max.is_ok(),
                "wheel mode switch incomplete"
            );
            Err(ServoError::WheelMode(id))
        }
    }
}
