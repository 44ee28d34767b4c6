//! Wait schedule applied once free retries are used up.

/// Builds the wait sequence (in milliseconds) for the given bounds.
///
/// The first entry is `min_wait`; every following entry is the sum of the two
/// before it, clamped to `max_wait`. The sequence ends with the first entry
/// that reaches `max_wait`, so equal bounds produce a single entry.
pub fn compute(_free_retries: u32, min_wait: u64, max_wait: u64) -> Vec<u64> {
    let mut delays = vec![min_wait];
    while let Some(&last) = delays.last() {
        // A zero minimum never grows; config validation rejects it anyway.
        if last >= max_wait || last == 0 {
            break;
        }
        let before = if delays.len() > 1 {
            delays[delays.len() - 2]
        } else {
            0
        };
        delays.push(last.saturating_add(before).min(max_wait));
    }
    delays
}

/// Lifetime in seconds used when none is configured.
///
/// Long enough for an actor to run through every free retry and the whole
/// schedule once at the maximum wait.
pub fn default_lifetime(free_retries: u32, max_wait: u64, schedule_len: usize) -> u64 {
    let steps = schedule_len as u64 + u64::from(free_retries);
    max_wait.saturating_mul(steps).div_ceil(1000)
}

/// Schedule index for a record that has seen `count` allowed attempts.
///
/// `None` while the actor is still within its free retries.
pub fn delay_index(count: u64, free_retries: u32, schedule_len: usize) -> Option<usize> {
    let free = u64::from(free_retries);
    if count <= free {
        return None;
    }
    let index = count - free - 1;
    let last = schedule_len.saturating_sub(1) as u64;
    Some(index.min(last) as usize)
}
