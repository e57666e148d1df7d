//! Adaptive minibatch sizing.
//!
//! Each heavy stage is run through [`find_executable_batch_size`]: on a
//! resource-exhaustion failure the stage is retried from the start with half
//! the minibatch size, down to 1. The stage closure must therefore be safe to
//! restart.

use tracing::warn;

use rewardtune_core::{TrainError, TrainResult};

/// Run `stage` with `starting_size`, halving on [`TrainError::ResourceExhausted`].
///
/// Returns the stage result together with the size that succeeded. Any other
/// error, or exhaustion at size 1, is returned unchanged.
pub fn find_executable_batch_size<T, F>(
    starting_size: usize,
    stage_name: &str,
    mut stage: F,
) -> TrainResult<(T, usize)>
where
    F: FnMut(usize) -> TrainResult<T>,
{
    let mut size = starting_size.max(1);
    loop {
        match stage(size) {
            Ok(value) => return Ok((value, size)),
            Err(TrainError::ResourceExhausted(msg)) if size > 1 => {
                let next = size / 2;
                warn!(
                    "{stage_name}: resource exhausted at minibatch size {size}, retrying with {next} ({msg})"
                );
                size = next;
            }
            Err(err) => return Err(err),
        }
    }
}
