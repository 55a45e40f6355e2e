//! Printable-ASCII run detection
//!
//! A channel opened at the wrong baud rate produces bytes scattered across
//! the whole 0..=255 range. A genuine location device emits ASCII only, so a
//! long enough run of printable bytes is a strong hint that the rate is right.

/// Lowest byte value counted as part of an ASCII run (line feed)
pub const PRINTABLE_MIN: u8 = 10;

/// Highest byte value counted as part of an ASCII run (`}`)
pub const PRINTABLE_MAX: u8 = 125;

/// Length of the longest run of printable bytes in `data`
///
/// Zero bytes are filler: they neither extend nor break a run. Any other
/// byte outside `PRINTABLE_MIN..=PRINTABLE_MAX` resets the run to zero.
pub fn ascii_run_length(data: &[u8]) -> usize {
    let mut longest = 0;
    let mut current = 0;

    for &byte in data {
        match byte {
            0 => {}
            PRINTABLE_MIN..=PRINTABLE_MAX => {
                current += 1;
                longest = longest.max(current);
            }
            _ => current = 0,
        }
    }

    longest
}

/// Check whether `data` contains at least `min_run` contiguous printable bytes
pub fn has_ascii_run(data: &[u8], min_run: usize) -> bool {
    let mut current = 0;

    for &byte in data {
        match byte {
            0 => {}
            PRINTABLE_MIN..=PRINTABLE_MAX => {
                current += 1;
                if current >= min_run {
                    return true;
                }
            }
            _ => current = 0,
        }
    }

    min_run == 0
}
