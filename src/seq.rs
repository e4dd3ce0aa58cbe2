/// Wraparound-safe sequence number arithmetic
///
/// Sequence numbers are 32-bit and wrap. Ordering is defined by the signed
/// distance between two values, so `1` is "after" `0xFFFF_FFFF`. The value 0
/// is reserved as the reset marker and is never produced by `successor`.

pub const SEQ_RESET: u32 = 0;

/// Signed distance from `b` to `a`. Positive means `a` is after `b`.
#[inline]
pub fn compare(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

#[inline]
pub fn is_before(a: u32, b: u32) -> bool {
    compare(a, b) < 0
}

#[inline]
pub fn is_before_or_eq(a: u32, b: u32) -> bool {
    compare(a, b) <= 0
}

#[inline]
pub fn is_after(a: u32, b: u32) -> bool {
    compare(a, b) > 0
}

/// Next sequence number, skipping the reset value on wrap
#[inline]
pub fn successor(seq: u32) -> u32 {
    match seq.wrapping_add(1) {
        SEQ_RESET => 1,
        next => next,
    }
}

/// Previous sequence number, skipping the reset value on wrap
#[inline]
pub fn predecessor(seq: u32) -> u32 {
    match seq.wrapping_sub(1) {
        SEQ_RESET => u32::MAX,
        prev => prev,
    }
}
