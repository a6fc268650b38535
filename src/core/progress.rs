//! rsync 输出的进度解析
//!
//! 支持两种输出格式：GNU rsync 的 --info=progress2 聚合进度，
//! 以及 --progress / openrsync 的简单百分比。解析不到就返回 None，
//! 普通文件清单行不产生事件。

use regex::Regex;

/// 一条进度事件，仅在内存中流转，从不落库
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    /// 0-100
    pub percent: u8,
    pub bytes_transferred: u64,
    pub transfer_rate: String,
    pub eta: String,
}

/// 行级进度解析器，正则只编译一次
pub struct ProgressParser {
    /// "1,234,567  42%  123.45kB/s  0:00:10" 形式的聚合进度
    aggregate: Regex,
    /// 仅有百分比的简单形式
    simple: Regex,
}

impl Default for ProgressParser {
    fn default() -> Self {
        Self {
            aggregate: Regex::new(r"^\s*([\d,]+)\s+(\d+)%\s+([\d.]+\w+/s)\s+(\d+:\d+:\d+|\d+:\d+)")
                .expect("固定模式"),
            simple: Regex::new(r"^\s*(\d+)%(?:\s|$)").expect("固定模式"),
        }
    }
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// 解析一行输出，非进度行返回 None
    pub fn parse_line(&self, line: &str) -> Option<ProgressEvent> {
        if let Some(caps) = self.aggregate.captures(line) {
            let bytes: u64 = caps[1].replace(',', "").parse().ok()?;
            let percent: u32 = caps[2].parse().ok()?;
            return Some(ProgressEvent {
                percent: percent.min(100) as u8,
                bytes_transferred: bytes,
                transfer_rate: caps[3].to_string(),
                eta: caps[4].to_string(),
            });
        }

        if let Some(caps) = self.simple.captures(line) {
            let percent: u32 = caps[1].parse().ok()?;
            return Some(ProgressEvent {
                percent: percent.min(100) as u8,
                bytes_transferred: 0,
                transfer_rate: String::new(),
                eta: String::new(),
            });
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aggregate_progress() {
        let parser = ProgressParser::new();
        let event = parser
            .parse_line("    1,238,459  99%   14.98MB/s    0:01:23")
            .unwrap();
        assert_eq!(event.percent, 99);
        assert_eq!(event.bytes_transferred, 1_238_459);
        assert_eq!(event.transfer_rate, "14.98MB/s");
        assert_eq!(event.eta, "0:01:23");
    }

    #[test]
    fn test_parse_short_eta() {
        let parser = ProgressParser::new();
        let event = parser
            .parse_line("  4,096  12%  512.00kB/s  0:42")
            .unwrap();
        assert_eq!(event.percent, 12);
        assert_eq!(event.eta, "0:42");
    }

    #[test]
    fn test_parse_simple_percentage() {
        let parser = ProgressParser::new();
        let event = parser.parse_line("   45% ").unwrap();
        assert_eq!(event.percent, 45);
        assert_eq!(event.bytes_transferred, 0);
        assert!(event.transfer_rate.is_empty());
    }

    #[test]
    fn test_non_progress_lines_produce_no_event() {
        let parser = ProgressParser::new();
        assert!(parser.parse_line("sending incremental file list").is_none());
        assert!(parser.parse_line(">f+++++++++ music/track01.flac").is_none());
        assert!(parser.parse_line("").is_none());
        assert!(parser
            .parse_line("sent 1,234 bytes  received 5,678 bytes")
            .is_none());
    }

    #[test]
    fn test_percent_clamped_to_100() {
        let parser = ProgressParser::new();
        let event = parser.parse_line("  120% ").unwrap();
        assert_eq!(event.percent, 100);
    }
}
