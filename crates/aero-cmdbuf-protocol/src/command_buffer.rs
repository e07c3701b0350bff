//! The producer-side view of a command-buffer transport.

use crate::buffer::Buffer;
use crate::shared_state::State;

/// Transport between a command producer and the service consuming its ring buffer.
///
/// Implementations move put offsets to the service and report back the published
/// [`State`]. Both waits must return once the watched value is in range *or* the state
/// carries an error, so a producer never blocks forever on a lost context.
pub trait CommandBuffer {
    /// The most recently observed state, without blocking.
    fn get_last_state(&mut self) -> State;

    /// The most recently observed token, without blocking.
    fn get_last_token(&mut self) -> i32 {
        self.get_last_state().token
    }

    /// Publish a new put offset (in entries).
    fn flush(&mut self, put_offset: i32);

    /// Block until the token is within `[start, end]` (wrapping) or an error is reported.
    fn wait_for_token_in_range(&mut self, start: i32, end: i32) -> State;

    /// Block until get is within `[start, end]` (wrapping) or an error is reported.
    fn wait_for_get_offset_in_range(&mut self, start: i32, end: i32) -> State;

    /// Make the transfer buffer `id` the ring buffer. Resets get and put to 0.
    fn set_get_buffer(&mut self, id: i32);

    /// Create and register a shared-memory transfer buffer. Returns its id (> 0).
    fn create_transfer_buffer(&mut self, size: usize) -> Option<(i32, Buffer)>;

    fn destroy_transfer_buffer(&mut self, id: i32);
}

/// Whether `value` lies in `[start, end]`, where the range wraps when `start > end`.
pub fn in_range(start: i32, end: i32, value: i32) -> bool {
    if start <= end {
        start <= value && value <= end
    } else {
        start <= value || value <= end
    }
}

#[cfg(test)]
mod tests {
    use super::in_range;

    #[test]
    fn plain_range() {
        assert!(in_range(2, 5, 2));
        assert!(in_range(2, 5, 5));
        assert!(!in_range(2, 5, 1));
        assert!(!in_range(2, 5, 6));
    }

    #[test]
    fn wrapped_range() {
        assert!(in_range(6, 1, 7));
        assert!(in_range(6, 1, 0));
        assert!(in_range(6, 1, 1));
        assert!(!in_range(6, 1, 3));
    }
}
