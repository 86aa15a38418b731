//! Best-effort failure diagnostics.
//!
//! Nothing in here returns an error or panics: losing part of a backtrace is
//! always preferable to losing the failure it describes.

use std::backtrace::{Backtrace, BacktraceStatus};

/// Default number of frames kept on a failed run.
pub const DEFAULT_BACKTRACE_FRAMES: usize = 20;

/// Captures the current backtrace if `RUST_BACKTRACE`/`RUST_LIB_BACKTRACE` enable it.
pub fn capture_backtrace() -> Option<String> {
    let backtrace = Backtrace::capture();
    match backtrace.status() {
        BacktraceStatus::Captured => Some(backtrace.to_string()),
        _ => None,
    }
}

/// Keeps the first `frames` frames of a rendered backtrace.
///
/// A frame starts at a line of the form `<n>: symbol`; the `at file:line`
/// lines that follow stay attached to it. Text that does not look like a
/// std backtrace is treated one line per frame.
pub fn bounded_backtrace(backtrace: &str, frames: usize) -> String {
    if frames == 0 {
        return String::new();
    }

    let structured = backtrace.lines().any(is_frame_header);
    let mut kept = Vec::new();
    let mut seen = 0usize;

    for line in backtrace.lines() {
        let starts_frame = !structured || is_frame_header(line);
        if starts_frame {
            if seen == frames {
                break;
            }
            seen += 1;
        }
        if seen > 0 {
            kept.push(line);
        }
    }

    kept.join("\n")
}

fn is_frame_header(line: &str) -> bool {
    let trimmed = line.trim_start();
    match trimmed.split_once(':') {
        Some((index, _)) => !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(frames: usize) -> String {
        (0..frames)
            .map(|i| format!("{:>4}: crate::module::fn_{}\n             at ./src/lib.rs:{}:5", i, i, i))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn test_keeps_first_frames_with_locations() {
        let bounded = bounded_backtrace(&rendered(10), 2);
        assert!(bounded.contains("fn_0"));
        assert!(bounded.contains("fn_1"));
        assert!(bounded.contains("./src/lib.rs:1:5"));
        assert!(!bounded.contains("fn_2"));
    }

    #[test]
    fn test_short_backtrace_is_kept_whole() {
        let full = rendered(3);
        assert_eq!(bounded_backtrace(&full, 20), full);
    }

    #[test]
    fn test_unstructured_text_is_line_bounded() {
        let text = "first\nsecond\nthird";
        assert_eq!(bounded_backtrace(text, 2), "first\nsecond");
    }

    #[test]
    fn test_degenerate_inputs_never_panic() {
        assert_eq!(bounded_backtrace("", 5), "");
        assert_eq!(bounded_backtrace(&rendered(4), 0), "");
        let _ = bounded_backtrace(":::\n: \n\u{0}\n9999999999999999999999:", 3);
        let _ = bounded_backtrace("ünïcödé: ☃\n  1: x", 1);
    }
}
