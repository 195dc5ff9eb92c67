//! Return-address capture for the calling thread
//!
//! Both backends fill a caller-provided buffer, most recent frame first,
//! starting with the function that called [`capture`]. Neither allocates nor
//! takes locks, so capture is safe from inside any intercepted call.
//!
//! - **aarch64**: walks the saved frame-record chain (`x29`/`x30`) directly.
//! - **everything else**: the `backtrace` crate's unwinder.

#![allow(unsafe_code)] // raw frame-record reads and the unsynchronized unwinder

/// Largest accepted gap between two consecutive frame records, in bytes
///
/// A link that points backwards, to itself, or further away than this ends
/// the walk. This bounds the walk on corrupt or missing frame-pointer chains.
pub const MAX_FP_DISTANCE: usize = 2048;

/// Capture return addresses of the current call stack into `frames`
///
/// Returns the number of valid entries. Never fails: a broken chain simply
/// yields fewer (possibly zero) frames.
#[cfg(target_arch = "aarch64")]
#[inline(never)]
pub fn capture(frames: &mut [usize]) -> usize {
    let fp: usize;
    // SAFETY: reading x29 has no side effects.
    unsafe {
        core::arch::asm!("mov {}, x29", out(reg) fp, options(nomem, nostack, preserves_flags));
    }
    // x29 holds this function's own frame record; its saved link register
    // is a return address into our caller.
    // SAFETY: the walk only follows links that stay on this thread's stack.
    unsafe { walk_frame_records(fp as *const usize, frames, AARCH64_INSN_LEN) }
}

/// Capture return addresses of the current call stack into `frames`
///
/// Returns the number of valid entries. Never fails: an unwinder error
/// simply yields fewer (possibly zero) frames.
#[cfg(not(target_arch = "aarch64"))]
#[inline(never)]
pub fn capture(frames: &mut [usize]) -> usize {
    // Room for the unwinder's own frames, which are dropped below.
    const SLACK: usize = 8;
    let mut raw = [0usize; fdleak_common::DEFAULT_BACKTRACE_FRAMES + SLACK];
    let mut raw_len = 0;
    let mut own_frame = None;
    let own_addr = (capture as fn(&mut [usize]) -> usize) as usize;
    let limit = raw.len().min(frames.len() + SLACK);

    // SAFETY: the closure neither panics nor re-enters the unwinder, and no
    // lock is held by this thread while it runs.
    unsafe {
        backtrace::trace_unsynchronized(|frame| {
            let ip = frame.ip() as usize;
            if ip == 0 || raw_len >= limit {
                return false;
            }
            if own_frame.is_none() && frame.symbol_address() as usize == own_addr {
                own_frame = Some(raw_len);
            }
            raw[raw_len] = ip;
            raw_len += 1;
            true
        });
    }

    let first = own_frame.map_or(0, |idx| idx + 1);
    let count = raw_len.saturating_sub(first).min(frames.len());
    frames[..count].copy_from_slice(&raw[first..first + count]);
    count
}

#[cfg(target_arch = "aarch64")]
const AARCH64_INSN_LEN: usize = 4;

/// Follow a chain of `[next_fp, return_address]` frame records
///
/// Each recorded address is the saved return address minus `call_adjust`,
/// i.e. the call instruction itself. The walk stops at a null link, at a
/// link that does not move strictly up the stack within
/// [`MAX_FP_DISTANCE`] bytes, or when `frames` is full.
///
/// # Safety
/// `fp` must be null or point to a readable frame record, and every record
/// reachable through links accepted by the distance check must be readable.
pub unsafe fn walk_frame_records(
    mut fp: *const usize,
    frames: &mut [usize],
    call_adjust: usize,
) -> usize {
    if fp.is_null() {
        return 0;
    }

    let mut depth = 0;
    let mut distance = link_distance(fp);
    while depth < frames.len() && *fp != 0 && distance > 0 && distance < MAX_FP_DISTANCE {
        let return_addr = *fp.add(1);
        frames[depth] = return_addr.wrapping_sub(call_adjust);
        depth += 1;

        fp = *fp as *const usize;
        distance = link_distance(fp);
    }

    depth
}

/// Byte distance from a frame record to the one it links to; 0 if the link
/// does not point strictly upwards
unsafe fn link_distance(fp: *const usize) -> usize {
    let next = *fp;
    let here = fp as usize;
    if next <= here {
        0
    } else {
        next - here
    }
}
