use std::sync::LazyLock;

use chrono::NaiveTime;
use regex::Regex;

use crate::monitor::domain::Heartbeat;

static HEARTBEAT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(\d{1,2}):(\d{2}):(\d{2})\.(\d{3})\b.*?\bSLEEPING\s+FOR\s+(\d+)\s+SECONDS?\b",
    )
    .expect("heartbeat pattern is valid")
});

static EXIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bEXITING\b.*?\bWITH\s+EXIT\s+CODE\s*=\s*(-?\d+)")
        .expect("exit pattern is valid")
});

/// Turns subject stdout lines into heartbeats, numbering them in arrival order.
///
/// Anything that does not look like a heartbeat (banners, usage text, the exit
/// announcement) is skipped without complaint.
#[derive(Debug, Default)]
pub struct HeartbeatParser {
    recognized: u32,
}

impl HeartbeatParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse_line(&mut self, raw_line: &str) -> Option<Heartbeat> {
        let caps = HEARTBEAT_RE.captures(raw_line)?;
        let field = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());

        let wall_clock_time =
            NaiveTime::from_hms_milli_opt(field(1)?, field(2)?, field(3)?, field(4)?)?;
        let declared_sleep_seconds = caps.get(5)?.as_str().parse::<u64>().ok()?;

        self.recognized += 1;
        Some(Heartbeat {
            sequence: self.recognized,
            wall_clock_time,
            declared_sleep_seconds,
        })
    }

    pub fn recognized(&self) -> u32 {
        self.recognized
    }
}

/// Extracts the code from an `EXITING ... WITH EXIT CODE = <code>` line.
pub fn parse_exit_line(raw_line: &str) -> Option<i32> {
    EXIT_RE.captures(raw_line)?.get(1)?.as_str().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn time(h: u32, m: u32, s: u32, ms: u32) -> NaiveTime {
        NaiveTime::from_hms_milli_opt(h, m, s, ms).unwrap()
    }

    #[test]
    fn test_parse_canonical_subject_line() {
        let mut parser = HeartbeatParser::new();
        let heartbeat = parser
            .parse_line("14:03:27.045 19-10-2026 TEST APPLICIATION SLEEPING FOR 6 SECONDS")
            .unwrap();

        assert_eq!(
            heartbeat,
            Heartbeat {
                sequence: 1,
                wall_clock_time: time(14, 3, 27, 45),
                declared_sleep_seconds: 6,
            }
        );
    }

    #[test]
    fn test_parse_tolerates_wording_and_case() {
        let mut parser = HeartbeatParser::new();

        let lines = [
            "[subject] 09:00:00.001 worker is sleeping for 1 second",
            "00:00:00.000 Sleeping For 27 Seconds now",
            "\t23:59:59.999\tSLEEPING   FOR 3 SECONDS\r",
        ];
        let sequences: Vec<_> = lines
            .iter()
            .map(|line| parser.parse_line(line).unwrap().sequence)
            .collect();

        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(parser.recognized(), 3);
    }

    #[test]
    fn test_non_heartbeat_lines_are_ignored() {
        let mut parser = HeartbeatParser::new();

        let lines = [
            "This is a basic test application.",
            "It prints the date and time and then sleeps for loopCount * 3",
            "By default it will run 5 loops and exit with exit status 0",
            "EXITING TEST APPLICICATION WITH EXIT CODE = 0",
            "12:00 SLEEPING FOR 3 SECONDS",
            "25:00:00.000 SLEEPING FOR 3 SECONDS",
            "12:61:00.000 SLEEPING FOR 3 SECONDS",
            "12:00:00.000 SLEEPING FOR -3 SECONDS",
            "",
        ];
        for line in lines {
            assert_eq!(parser.parse_line(line), None, "{line:?}");
        }

        // Skipped lines don't consume sequence numbers.
        let heartbeat = parser
            .parse_line("12:00:00.000 SLEEPING FOR 3 SECONDS")
            .unwrap();
        assert_eq!(heartbeat.sequence, 1);
    }

    #[test]
    fn test_parse_exit_line() {
        assert_eq!(
            parse_exit_line("EXITING TEST APPLICICATION WITH EXIT CODE = 2"),
            Some(2)
        );
        assert_eq!(parse_exit_line("exiting subject with exit code=-1"), Some(-1));
        assert_eq!(
            parse_exit_line("12:00:00.000 SLEEPING FOR 3 SECONDS"),
            None
        );
        assert_eq!(parse_exit_line("EXITING soon"), None);
    }
}
