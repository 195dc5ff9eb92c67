//! Call-path capture and formatting
//!
//! - [`capture`]: architecture-specific return-address capture
//! - [`formatter`]: turns captured addresses into report lines
//!
//! [`CallPath`] is the fixed-size, `Copy` value stored in every leak record.
//! It never allocates, so it can be captured inside intercepted calls and
//! copied wholesale while the leak table lock is held.

pub mod capture;
pub mod formatter;

pub use formatter::StackFormatter;

use fdleak_common::DEFAULT_BACKTRACE_FRAMES;
use std::fmt;

/// Bounded sequence of return addresses, most recent first
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CallPath {
    frames: [usize; DEFAULT_BACKTRACE_FRAMES],
    len: usize,
}

impl CallPath {
    pub const EMPTY: CallPath = CallPath { frames: [0; DEFAULT_BACKTRACE_FRAMES], len: 0 };

    /// Capture the current thread's stack
    ///
    /// Always inlined so that the first frame belongs to the function that
    /// calls this, not to `CallPath` itself.
    #[inline(always)]
    #[must_use]
    pub fn capture() -> Self {
        let mut path = Self::EMPTY;
        path.len = capture::capture(&mut path.frames);
        path
    }

    /// Build a path from known addresses, truncated to the frame limit
    #[must_use]
    pub fn from_frames(frames: &[usize]) -> Self {
        let mut path = Self::EMPTY;
        let len = frames.len().min(DEFAULT_BACKTRACE_FRAMES);
        path.frames[..len].copy_from_slice(&frames[..len]);
        path.len = len;
        path
    }

    /// Valid frames
    #[must_use]
    pub fn frames(&self) -> &[usize] {
        &self.frames[..self.len]
    }

    /// Frames after the first `skip` ones
    #[must_use]
    pub fn callers(&self, skip: usize) -> &[usize] {
        self.frames().get(skip..).unwrap_or(&[])
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for CallPath {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Debug for CallPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.frames().iter().map(|ip| format!("{ip:#x}"))).finish()
    }
}
