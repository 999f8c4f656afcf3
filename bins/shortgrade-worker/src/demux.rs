/// Container output demultiplexing.
///
/// The engine multiplexes stdout/stderr on one channel with fixed framing:
/// a selector byte (0 stdin, 1 stdout, 2 stderr), a big-endian payload length,
/// then the payload. Both logical streams are folded into one trace buffer;
/// ordering between the two streams is best-effort.
///
/// Frames may be split across reads. The decoder keeps the incomplete tail and
/// resumes on the next chunk.

use bollard::container::LogOutput;
use std::str::FromStr;

/// Header layout of a multiplexed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLayout {
    /// `[selector, 0, 0, 0, len(u32 BE)]`, the Docker Engine API layout.
    Docker,
    /// `[selector, len(u24 BE)]`
    Compact,
}

impl FrameLayout {
    pub fn header_len(self) -> usize {
        match self {
            FrameLayout::Docker => 8,
            FrameLayout::Compact => 4,
        }
    }

    fn payload_len(self, header: &[u8]) -> usize {
        match self {
            FrameLayout::Docker => u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize,
            FrameLayout::Compact => {
                (header[1] as usize) << 16 | (header[2] as usize) << 8 | header[3] as usize
            }
        }
    }

    /// Header sanity check so a mismatched layout degrades to raw output.
    fn is_valid_header(self, header: &[u8]) -> bool {
        if header[0] > 2 {
            return false;
        }
        match self {
            FrameLayout::Docker => header[1..4] == [0, 0, 0],
            FrameLayout::Compact => true,
        }
    }
}

impl FromStr for FrameLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(FrameLayout::Docker),
            "compact" => Ok(FrameLayout::Compact),
            other => Err(format!("unknown log framing '{}'", other)),
        }
    }
}

#[derive(Debug)]
pub struct FrameDecoder {
    layout: FrameLayout,
    pending: Vec<u8>,
    /// Set once a header fails validation; everything after is passed through.
    raw: bool,
}

impl FrameDecoder {
    pub fn new(layout: FrameLayout) -> Self {
        Self {
            layout,
            pending: Vec::new(),
            raw: false,
        }
    }

    /// Decodes every complete frame in `pending + chunk` into `out`.
    pub fn push(&mut self, chunk: &[u8], out: &mut Vec<u8>) {
        if self.raw {
            out.extend_from_slice(chunk);
            return;
        }
        self.pending.extend_from_slice(chunk);

        let header_len = self.layout.header_len();
        let mut cursor = 0;
        while self.pending.len() - cursor >= header_len {
            let header = &self.pending[cursor..cursor + header_len];
            if !self.layout.is_valid_header(header) {
                self.raw = true;
                out.extend_from_slice(&self.pending[cursor..]);
                self.pending.clear();
                return;
            }
            let len = self.layout.payload_len(header);
            let frame_end = cursor + header_len + len;
            if frame_end > self.pending.len() {
                break;
            }
            out.extend_from_slice(&self.pending[cursor + header_len..frame_end]);
            cursor = frame_end;
        }
        self.pending.drain(..cursor);
    }

    /// Bytes of an incomplete trailing frame, if the stream ended mid-frame.
    pub fn finish(self) -> Vec<u8> {
        self.pending
    }
}

/// Folds container log items into one bounded trace buffer.
#[derive(Debug)]
pub struct OutputCollector {
    buffer: Vec<u8>,
    decoder: FrameDecoder,
    limit: usize,
    truncated: bool,
}

impl OutputCollector {
    pub fn new(layout: FrameLayout, limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            decoder: FrameDecoder::new(layout),
            limit,
            truncated: false,
        }
    }

    /// Demuxed items are appended as-is; raw console chunks go through the frame decoder.
    pub fn push(&mut self, item: LogOutput) {
        match item {
            LogOutput::StdOut { message } | LogOutput::StdErr { message } | LogOutput::StdIn { message } => {
                self.append(&message);
            }
            LogOutput::Console { message } => {
                let mut decoded = Vec::new();
                self.decoder.push(&message, &mut decoded);
                self.append(&decoded);
            }
        }
    }

    fn append(&mut self, bytes: &[u8]) {
        let room = self.limit.saturating_sub(self.buffer.len());
        if bytes.len() > room {
            self.truncated = true;
        }
        self.buffer.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    /// A frame cut off by the end of the stream counts as truncation.
    pub fn into_string(self) -> String {
        let incomplete = !self.decoder.finish().is_empty();
        let mut text = String::from_utf8_lossy(&self.buffer).into_owned();
        if self.truncated || incomplete {
            text.push_str("\n[output truncated]");
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docker_frame(stream: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![stream, 0, 0, 0];
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    fn compact_frame(stream: u8, payload: &[u8]) -> Vec<u8> {
        let len = payload.len();
        let mut frame = vec![stream, (len >> 16) as u8, (len >> 8) as u8, len as u8];
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn test_folds_both_streams() {
        let mut input = docker_frame(1, b"hello ");
        input.extend(docker_frame(2, b"world"));

        let mut decoder = FrameDecoder::new(FrameLayout::Docker);
        let mut out = Vec::new();
        decoder.push(&input, &mut out);
        assert_eq!(out, b"hello world");
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn test_frame_split_across_reads() {
        let mut input = docker_frame(1, b"first frame");
        input.extend(docker_frame(2, b"second"));

        // Split inside the header of the second frame and inside a payload.
        for split in [3, 8, 12, 21, 25] {
            let mut decoder = FrameDecoder::new(FrameLayout::Docker);
            let mut out = Vec::new();
            decoder.push(&input[..split], &mut out);
            decoder.push(&input[split..], &mut out);
            assert_eq!(out, b"first framesecond", "split at {}", split);
        }
    }

    #[test]
    fn test_byte_by_byte() {
        let input = compact_frame(1, b"abc");
        let mut decoder = FrameDecoder::new(FrameLayout::Compact);
        let mut out = Vec::new();
        for byte in &input {
            decoder.push(std::slice::from_ref(byte), &mut out);
        }
        assert_eq!(out, b"abc");
    }

    #[test]
    fn test_incomplete_tail_is_kept() {
        let input = docker_frame(1, b"truncated payload");
        let mut decoder = FrameDecoder::new(FrameLayout::Docker);
        let mut out = Vec::new();
        decoder.push(&input[..12], &mut out);
        assert!(out.is_empty());
        assert_eq!(decoder.finish().len(), 12);
    }

    #[test]
    fn test_unframed_output_passes_through() {
        let mut decoder = FrameDecoder::new(FrameLayout::Docker);
        let mut out = Vec::new();
        decoder.push(b"plain text output", &mut out);
        decoder.push(b" continues", &mut out);
        assert_eq!(out, b"plain text output continues");
    }

    #[test]
    fn test_layout_from_str() {
        assert_eq!("Docker".parse::<FrameLayout>(), Ok(FrameLayout::Docker));
        assert_eq!("compact".parse::<FrameLayout>(), Ok(FrameLayout::Compact));
        assert!("tty".parse::<FrameLayout>().is_err());
    }

    #[test]
    fn test_collector_mixes_demuxed_and_raw() {
        let mut collector = OutputCollector::new(FrameLayout::Docker, 1024);
        collector.push(LogOutput::StdOut { message: "out\n".into() });
        collector.push(LogOutput::StdErr { message: "err\n".into() });
        collector.push(LogOutput::Console { message: docker_frame(1, b"raw\n").into() });
        assert_eq!(collector.into_string(), "out\nerr\nraw\n");
    }

    #[test]
    fn test_collector_truncates() {
        let mut collector = OutputCollector::new(FrameLayout::Docker, 4);
        collector.push(LogOutput::StdOut { message: "abcdefgh".into() });
        assert_eq!(collector.into_string(), "abcd\n[output truncated]");
    }
}
