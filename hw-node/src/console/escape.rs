use std::borrow::Cow;

use lazy_static::lazy_static;
use regex::Regex;

// Alternation order matters, the regex crate picks the leftmost-first branch:
// OSC strings, then CSI sequences, then any other ESC sequence, then stray C0 controls (TAB kept).
const TERMINAL_NOISE_REGEX_STR: &str = concat!(
    r"\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)?",
    r"|\x1b\[[0-?]*[ -/]*[@-~]",
    r"|\x1b[ -/]*[0-~]",
    r"|[\x00-\x08\x0a-\x1f\x7f]",
);

lazy_static! {
    static ref TERMINAL_NOISE_REGEX: Regex = Regex::new(TERMINAL_NOISE_REGEX_STR).unwrap();
}

/// Removes terminal escape sequences and control characters from a single console line.
///
/// Text around the sequences is left exactly as it was, so
/// `"16:57:47 \x1b[19;1HSATA"` becomes `"16:57:47 SATA"`.
pub fn strip_escape_sequences(line: &str) -> Cow<'_, str> {
    TERMINAL_NOISE_REGEX.replace_all(line, "")
}

/// A line is worth looking at if anything but whitespace survives stripping.
pub fn is_meaningful(stripped: &str) -> bool {
    !stripped.trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_cursor_positioning() {
        let line = "2020-01-29 16:57:47 \x1b[19;1HSATA\x1b[19;6HPort\x1b[19;11H0: ST1000NM0055";
        assert_eq!(
            strip_escape_sequences(line),
            "2020-01-29 16:57:47 SATAPort0: ST1000NM0055"
        );
    }

    #[test]
    fn strips_colours_and_private_modes() {
        assert_eq!(
            strip_escape_sequences("\x1b[0;1;39mWelcome\x1b[0m \x1b[?25lhome"),
            "Welcome home"
        );
    }

    #[test]
    fn strips_osc_titles_and_charset_selection() {
        assert_eq!(
            strip_escape_sequences("\x1b]0;ses-client-3\x07\x1b(Blogin: "),
            "login: "
        );
    }

    #[test]
    fn strips_carriage_returns_and_stray_escape() {
        assert_eq!(strip_escape_sequences("login: \r"), "login: ");
        assert_eq!(strip_escape_sequences("Port\x1b"), "Port");
    }

    #[test]
    fn keeps_tabs_and_plain_text() {
        let line = "[  OK  ]\tStarted Login Service.";
        assert!(matches!(strip_escape_sequences(line), Cow::Borrowed(_)));
        assert_eq!(strip_escape_sequences(line), line);
    }

    #[test]
    fn caret_notation_is_plain_text() {
        // conman log viewers render ESC as `^[`, that text is not an escape sequence
        assert_eq!(strip_escape_sequences("^[[19;1HSATA"), "^[[19;1HSATA");
    }

    #[test]
    fn whitespace_only_lines_are_not_meaningful() {
        assert!(!is_meaningful(""));
        assert!(!is_meaningful("  \t "));
        assert!(!is_meaningful(&strip_escape_sequences("\x1b[20;1H\x1b[K   \x1b[0m")));
        assert!(is_meaningful("login:"));
    }
}
