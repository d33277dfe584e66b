//! Per-tool progress line parsers
//!
//! A small closed set of grammar variants selected by stage role: the
//! decoder grammar covers `ld-chroma-decoder`'s human-readable stderr lines,
//! the encoder grammar covers ffmpeg's machine-readable `key=value` progress
//! stream. Unrecognized lines are ignored, and numeric fields that fail to
//! parse degrade to unknown instead of discarding the whole update.

use crate::command::StageRole;
use crate::progress::ProgressRecord;

/// Buffers raw bytes until complete lines are available.
///
/// External tools terminate status lines with either `\n` or a bare `\r`
/// (ffmpeg rewrites its stats line in place); both count as terminators.
/// An incomplete trailing fragment stays buffered until the next chunk.
#[derive(Debug, Default)]
pub struct LineAssembler {
    buf: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n' || *b == b'\r') {
            let rest = self.buf.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.buf, rest);
            line.pop(); // terminator
            lines.push(String::from_utf8_lossy(&line).trim().to_string());
        }
        lines
    }

    /// Drain whatever is left after EOF.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.buf).trim().to_string();
        self.buf.clear();
        Some(line)
    }
}

/// Stateful line parser for one stage's diagnostic stream.
#[derive(Debug)]
pub enum LineParser {
    Decoder(DecoderParser),
    Encoder(EncoderParser),
}

impl LineParser {
    /// Select the grammar variant for a stage role.
    pub fn for_role(role: StageRole) -> Self {
        match role {
            StageRole::Decoder | StageRole::ChromaDecoder => {
                LineParser::Decoder(DecoderParser::new(role))
            }
            StageRole::Encoder => LineParser::Encoder(EncoderParser::new()),
        }
    }

    /// Seed the expected total (from the command builder) so records carry a
    /// denominator before the tool announces its own.
    pub fn set_total(&mut self, total: u64) {
        match self {
            LineParser::Decoder(p) => p.record.total_frames = Some(total),
            LineParser::Encoder(p) => p.record.total_frames = Some(total),
        }
    }

    /// Feed one complete line. Returns an updated record when the line
    /// carried progress, `None` when it was unrecognized.
    pub fn parse_line(&mut self, line: &str) -> Option<ProgressRecord> {
        match self {
            LineParser::Decoder(p) => p.parse_line(line),
            LineParser::Encoder(p) => p.parse_line(line),
        }
    }
}

/// Grammar for `ld-chroma-decoder` stderr:
///
/// ```text
/// Info: Processing from start frame # 0 with a length of 1000 frames
/// Info: 200 frames processed - 25.1 FPS
/// Info: Processing complete - 1000 frames in 40.2 seconds ( 24.9 FPS )
/// Warning: Dropout concealment ...
/// ```
#[derive(Debug)]
pub struct DecoderParser {
    record: ProgressRecord,
}

impl DecoderParser {
    fn new(role: StageRole) -> Self {
        Self {
            record: ProgressRecord::new(role),
        }
    }

    fn parse_line(&mut self, line: &str) -> Option<ProgressRecord> {
        if let Some(warning) = line
            .strip_prefix("Warning:")
            .or_else(|| line.strip_prefix("Critical:"))
        {
            self.record.quality.warnings += 1;
            if warning.to_ascii_lowercase().contains("dropout") {
                self.record.quality.dropouts += 1;
            }
            return Some(self.record.clone());
        }

        let info = line.strip_prefix("Info: ")?;

        if let Some(rest) = info.strip_prefix("Processing from start frame #") {
            // "<start> with a length of <count> frames"
            let mut words = rest.split_whitespace();
            let start = words.next().and_then(|w| w.parse::<u64>().ok());
            let length = rest
                .split("length of")
                .nth(1)
                .and_then(|s| s.split_whitespace().next())
                .and_then(|w| w.parse::<u64>().ok());

            if let Some(start) = start {
                self.record.frames = start;
            }
            if length.is_some() {
                self.record.total_frames = length;
            }
            return Some(self.record.clone());
        }

        if let Some((count, rate)) = info.split_once(" frames processed - ") {
            if let Ok(frames) = count.trim().parse::<u64>() {
                self.record.frames = frames;
            }
            self.record.fps = rate
                .trim()
                .strip_suffix("FPS")
                .and_then(|r| r.trim().parse::<f64>().ok())
                .or(self.record.fps);
            return Some(self.record.clone());
        }

        if let Some(rest) = info.strip_prefix("Processing complete - ") {
            if let Some(frames) = rest
                .split_whitespace()
                .next()
                .and_then(|w| w.parse::<u64>().ok())
            {
                self.record.frames = frames;
            }
            return Some(self.record.clone());
        }

        None
    }
}

/// Grammar for ffmpeg's `-progress` stream: one `key=value` pair per line.
#[derive(Debug)]
pub struct EncoderParser {
    record: ProgressRecord,
}

impl EncoderParser {
    fn new() -> Self {
        Self {
            record: ProgressRecord::new(StageRole::Encoder),
        }
    }

    fn parse_line(&mut self, line: &str) -> Option<ProgressRecord> {
        let (key, value) = line.split_once('=')?;
        let value = value.trim();

        match key.trim() {
            "frame" => {
                if let Ok(frames) = value.parse::<u64>() {
                    self.record.frames = frames;
                }
            }
            "fps" => {
                self.record.fps = value.parse::<f64>().ok().or(self.record.fps);
            }
            "bitrate" => {
                self.record.bitrate_kbps = value
                    .strip_suffix("kbits/s")
                    .and_then(|v| v.trim().parse::<f64>().ok())
                    .or(self.record.bitrate_kbps);
            }
            "total_size" => {
                self.record.out_size = value.parse::<u64>().ok().or(self.record.out_size);
            }
            "drop_frames" => {
                if let Ok(n) = value.parse::<u64>() {
                    self.record.quality.dropped_frames = n;
                }
            }
            "dup_frames" => {
                if let Ok(n) = value.parse::<u64>() {
                    self.record.quality.duplicated_frames = n;
                }
            }
            // out_time, speed, progress and friends carry nothing we track
            _ => return None,
        }

        Some(self.record.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembler_buffers_partial_lines() {
        let mut assembler = LineAssembler::new();
        assert!(assembler.push(b"Info: 200 frames pro").is_empty());
        let lines = assembler.push(b"cessed - 25.1 FPS\nInfo: 2");
        assert_eq!(lines, vec!["Info: 200 frames processed - 25.1 FPS"]);
        assert_eq!(assembler.finish().as_deref(), Some("Info: 2"));
        assert!(assembler.finish().is_none());
    }

    #[test]
    fn assembler_splits_on_carriage_returns() {
        let mut assembler = LineAssembler::new();
        let lines = assembler.push(b"frame=1\rframe=2\r");
        assert_eq!(lines, vec!["frame=1", "frame=2"]);
    }

    #[test]
    fn decoder_parses_length_announcement() {
        let mut parser = LineParser::for_role(StageRole::Decoder);
        let record = parser
            .parse_line("Info: Processing from start frame # 0 with a length of 1000 frames")
            .unwrap();
        assert_eq!(record.frames, 0);
        assert_eq!(record.total_frames, Some(1000));
    }

    #[test]
    fn decoder_parses_rate_lines() {
        let mut parser = LineParser::for_role(StageRole::Decoder);
        let record = parser
            .parse_line("Info: 200 frames processed - 25.1 FPS")
            .unwrap();
        assert_eq!(record.frames, 200);
        assert_eq!(record.fps, Some(25.1));

        let record = parser
            .parse_line("Info: Processing complete - 1000 frames in 40.2 seconds ( 24.9 FPS )")
            .unwrap();
        assert_eq!(record.frames, 1000);
    }

    #[test]
    fn decoder_counts_warnings_and_dropouts() {
        let mut parser = LineParser::for_role(StageRole::ChromaDecoder);
        parser.parse_line("Warning: Dropout concealment on field 12");
        let record = parser.parse_line("Critical: sync lost").unwrap();
        assert_eq!(record.quality.warnings, 2);
        assert_eq!(record.quality.dropouts, 1);
    }

    #[test]
    fn unrecognized_lines_are_ignored_not_errors() {
        let mut parser = LineParser::for_role(StageRole::Decoder);
        assert!(parser.parse_line("").is_none());
        assert!(parser.parse_line("random noise").is_none());
        assert!(parser.parse_line("Info: something else entirely").is_none());
        // garbage bytes already went through lossy UTF-8 conversion upstream
        assert!(parser.parse_line("\u{fffd}\u{fffd}").is_none());
    }

    #[test]
    fn partially_numeric_lines_degrade_fields_not_updates() {
        let mut parser = LineParser::for_role(StageRole::Decoder);
        let record = parser
            .parse_line("Info: 200 frames processed - garbage FPS")
            .unwrap();
        // frame count is kept, the unparsable rate stays unknown
        assert_eq!(record.frames, 200);
        assert!(record.fps.is_none());
    }

    #[test]
    fn encoder_parses_progress_pairs() {
        let mut parser = LineParser::for_role(StageRole::Encoder);
        parser.set_total(2000);

        let record = parser.parse_line("frame=123").unwrap();
        assert_eq!(record.frames, 123);
        assert_eq!(record.total_frames, Some(2000));

        let record = parser.parse_line("bitrate=1540.2kbits/s").unwrap();
        assert_eq!(record.bitrate_kbps, Some(1540.2));

        let record = parser.parse_line("total_size=1048576").unwrap();
        assert_eq!(record.out_size, Some(1_048_576));

        let record = parser.parse_line("drop_frames=3").unwrap();
        assert_eq!(record.quality.dropped_frames, 3);

        assert!(parser.parse_line("progress=continue").is_none());
        assert!(parser.parse_line("not a pair").is_none());
    }

    #[test]
    fn encoder_keeps_last_good_value_for_unparsable_fields() {
        let mut parser = LineParser::for_role(StageRole::Encoder);
        parser.parse_line("fps=25.0");
        let record = parser.parse_line("fps=N/A").unwrap();
        assert_eq!(record.fps, Some(25.0));
    }
}
