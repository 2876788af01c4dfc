//! Labelled MJPEG streaming.
//!
//! Each emitted chunk carries the JPEG bytes of one frame plus an `X-Label`
//! header binding it to the actuation state read at emission time:
//!
//! ```text
//! --frame\r\n
//! Content-Type: image/jpeg\r\n
//! X-Label: <seq> <fw> <left> <right> <back> <speed>.jpg\r\n
//! Content-Length: <n>\r\n
//! \r\n
//! <n bytes>\r\n
//! ```
//!
//! The label is read from the state without any synchronisation against the
//! command router. In this crate both run on the same thread so the read is
//! never torn, but the direction reported may have been applied after the
//! frame was exposed.

use crate::error::FrameError;
use crate::frame::{encode_jpeg, FrameSource};
use crate::state::{ActuationState, LabelFlags};
use std::fmt::{self, Write as _};
use std::io::{self, BufRead, BufReader, Read, Write};
use tracing::{debug, info, warn};

pub const BOUNDARY: &str = "frame";
pub const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";
pub const LABEL_HEADER: &str = "X-Label";
/// Largest chunk body the reader accepts.
pub const MAX_CHUNK_BYTES: usize = 4 << 20;

fn oversized(n: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("chunk of {n} bytes exceeds {MAX_CHUNK_BYTES}"),
    )
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LabeledFrameRecord {
    pub sequence: u64,
    pub labels: LabelFlags,
    pub speed: u8,
    pub byte_len: usize,
}

impl fmt::Display for LabeledFrameRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [fw, left, right, back] = self.labels.digits();
        write!(
            f,
            "{} {} {} {} {} {}.jpg",
            self.sequence, fw, left, right, back, self.speed
        )
    }
}

impl LabeledFrameRecord {
    /// Parses a label back into a record. `byte_len` is taken from the
    /// caller since the label does not carry it.
    pub fn parse_label(label: &str, byte_len: usize) -> Option<Self> {
        let stem = label.trim().strip_suffix(".jpg")?;
        let mut parts = stem.split(' ');
        let sequence = parts.next()?.parse().ok()?;
        let mut flag = || match parts.next()? {
            "0" => Some(false),
            "1" => Some(true),
            _ => None,
        };
        let labels = LabelFlags {
            forward: flag()?,
            left: flag()?,
            right: flag()?,
            back: flag()?,
        };
        let speed = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            sequence,
            labels,
            speed,
            byte_len,
        })
    }
}

/// Response head sent once when a client attaches to the stream.
pub fn write_stream_head<W: Write>(w: &mut W) -> io::Result<()> {
    write!(
        w,
        "HTTP/1.1 200 OK\r\nContent-Type: {STREAM_CONTENT_TYPE}\r\nCache-Control: no-store\r\n\r\n"
    )?;
    w.flush()
}

/// Writes one multipart chunk. `header` is scratch space reused across calls.
pub fn write_chunk<W: Write>(
    w: &mut W,
    header: &mut String,
    record: &LabeledFrameRecord,
    jpeg: &[u8],
) -> io::Result<()> {
    header.clear();
    // Writing into a String cannot fail.
    let _ = write!(
        header,
        "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\n{LABEL_HEADER}: {record}\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    );
    w.write_all(header.as_bytes())?;
    w.write_all(jpeg)?;
    w.write_all(b"\r\n")?;
    w.flush()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Streaming,
    Draining,
}

#[derive(Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// No client attached.
    Inactive,
    /// The source had nothing this tick.
    NoFrame,
    /// Capture or encode failed; the tick was skipped.
    Skipped,
    Emitted(LabeledFrameRecord),
    /// The write failed and the client was dropped.
    Disconnected,
}

/// Streaming state machine for a single client.
pub struct FrameLabeler<W> {
    client: Option<W>,
    phase: StreamPhase,
    attach_generation: u64,
    sequence: u64,
    quality: u8,
    jpeg: Vec<u8>,
    header: String,
}

impl<W: Write> FrameLabeler<W> {
    pub fn new(quality: u8) -> Self {
        Self {
            client: None,
            phase: StreamPhase::Idle,
            attach_generation: 0,
            sequence: 0,
            quality,
            jpeg: Vec::new(),
            header: String::new(),
        }
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    /// Sequence number the next emitted frame will carry.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Attaches a client, replacing any previous one. Labels read as zero
    /// until the next direction command so a new session never inherits the
    /// previous session's labels.
    pub fn attach(&mut self, client: W, state: &ActuationState) {
        if self.client.is_some() {
            info!("stream client replaced");
        }
        self.client = Some(client);
        self.phase = StreamPhase::Streaming;
        self.attach_generation = state.generation();
        debug!(generation = self.attach_generation, "stream client attached");
    }

    /// Labels as the stream reports them right now.
    pub fn labels(&self, state: &ActuationState) -> LabelFlags {
        if state.generation() == self.attach_generation {
            LabelFlags::ZERO
        } else {
            state.labels()
        }
    }

    fn fail(&mut self, err: FrameError) -> TickOutcome {
        warn!("stream tick skipped: {err}");
        TickOutcome::Skipped
    }

    /// One streaming period: capture, label, emit.
    pub fn tick<S: FrameSource + ?Sized>(
        &mut self,
        source: &mut S,
        state: &ActuationState,
    ) -> TickOutcome {
        match self.phase {
            StreamPhase::Idle => return TickOutcome::Inactive,
            StreamPhase::Draining => {
                self.client = None;
                self.phase = StreamPhase::Idle;
                debug!("stream drained");
                return TickOutcome::Inactive;
            }
            StreamPhase::Streaming => {}
        }

        let encoded = match source.capture() {
            Ok(Some(frame)) => encode_jpeg(&frame, self.quality, &mut self.jpeg),
            Ok(None) => return TickOutcome::NoFrame,
            Err(e) => return self.fail(e),
        };
        if let Err(e) = encoded {
            return self.fail(e);
        }

        let record = LabeledFrameRecord {
            sequence: self.sequence,
            labels: self.labels(state),
            speed: state.speed(),
            byte_len: self.jpeg.len(),
        };
        let Some(client) = self.client.as_mut() else {
            self.phase = StreamPhase::Idle;
            return TickOutcome::Inactive;
        };
        if let Err(e) = write_chunk(client, &mut self.header, &record, &self.jpeg) {
            info!("stream client gone: {e}");
            self.client = None;
            self.phase = StreamPhase::Draining;
            return TickOutcome::Disconnected;
        }
        debug!(label = %record, bytes = record.byte_len, "frame emitted");
        self.sequence += 1;
        TickOutcome::Emitted(record)
    }
}

/// One chunk read back from a labelled stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub label: Option<String>,
    pub data: Vec<u8>,
}

/// Client-side parser for the labelled multipart stream.
pub struct MultipartReader<R> {
    reader: BufReader<R>,
    at_boundary: bool,
    line: Vec<u8>,
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

impl<R: Read> MultipartReader<R> {
    pub fn new(reader: R) -> Self {
        Self::from_buffered(BufReader::new(reader))
    }

    pub fn from_buffered(reader: BufReader<R>) -> Self {
        Self {
            reader,
            at_boundary: false,
            line: Vec::new(),
        }
    }

    fn read_line(&mut self) -> io::Result<bool> {
        self.line.clear();
        Ok(self.reader.read_until(b'\n', &mut self.line)? > 0)
    }

    /// Next chunk, or `None` at end of stream.
    pub fn next_chunk(&mut self) -> io::Result<Option<StreamChunk>> {
        let marker = format!("--{BOUNDARY}");
        while !self.at_boundary {
            if !self.read_line()? {
                return Ok(None);
            }
            if trim_line(&self.line) == marker.as_bytes() {
                self.at_boundary = true;
            }
        }
        self.at_boundary = false;

        let mut label = None;
        let mut length = None;
        loop {
            if !self.read_line()? {
                return Ok(None);
            }
            let line = String::from_utf8_lossy(trim_line(&self.line)).into_owned();
            if line.is_empty() {
                break;
            }
            if let Some((k, v)) = line.split_once(':') {
                let key = k.trim();
                if key.eq_ignore_ascii_case(LABEL_HEADER) {
                    label = Some(v.trim().to_string());
                } else if key.eq_ignore_ascii_case("content-length") {
                    length = v.trim().parse::<usize>().ok();
                }
            }
        }

        let data = match length {
            Some(n) if n > MAX_CHUNK_BYTES => return Err(oversized(n)),
            Some(n) => {
                let mut data = vec![0u8; n];
                self.reader.read_exact(&mut data)?;
                data
            }
            None => self.read_until_boundary(marker.as_bytes())?,
        };
        Ok(Some(StreamChunk { label, data }))
    }

    fn read_until_boundary(&mut self, marker: &[u8]) -> io::Result<Vec<u8>> {
        let mut data = Vec::new();
        let mut needle = b"\r\n".to_vec();
        needle.extend_from_slice(marker);
        let mut byte = [0u8; 1];
        loop {
            if self.reader.read(&mut byte)? == 0 {
                return Ok(data);
            }
            data.push(byte[0]);
            if data.len() > MAX_CHUNK_BYTES + needle.len() {
                return Err(oversized(data.len()));
            }
            if data.ends_with(&needle) {
                data.truncate(data.len() - needle.len());
                self.at_boundary = true;
                return Ok(data);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Encoding, MemorySource};
    use crate::state::Direction;

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn jpeg_source() -> MemorySource {
        MemorySource::new(2, 2, Encoding::Jpeg).with_frame(vec![0xFF, 0xD8, 1, 2, 0xFF, 0xD9])
    }

    #[test]
    fn label_matches_wire_format() {
        let record = LabeledFrameRecord {
            sequence: 17,
            labels: Direction::ForwardLeft.labels(),
            speed: 200,
            byte_len: 10,
        };
        assert_eq!(record.to_string(), "17 1 1 0 0 200.jpg");
        assert_eq!(
            LabeledFrameRecord::parse_label("17 1 1 0 0 200.jpg", 10),
            Some(record)
        );
        assert_eq!(LabeledFrameRecord::parse_label("17 1 1 0 200.jpg", 0), None);
        assert_eq!(LabeledFrameRecord::parse_label("x 1 1 0 0 200.jpg", 0), None);
    }

    #[test]
    fn idle_labeler_does_nothing() {
        let mut labeler: FrameLabeler<Vec<u8>> = FrameLabeler::new(80);
        let state = ActuationState::default();
        assert_eq!(
            labeler.tick(&mut jpeg_source(), &state),
            TickOutcome::Inactive
        );
    }

    #[test]
    fn attach_masks_previous_labels_until_next_command() {
        let mut state = ActuationState::default();
        state.set_direction(Direction::Forward);
        let mut labeler = FrameLabeler::new(80);
        labeler.attach(Vec::new(), &state);
        let mut src = jpeg_source();
        match labeler.tick(&mut src, &state) {
            TickOutcome::Emitted(r) => assert!(r.labels.is_zero()),
            other => panic!("unexpected {other:?}"),
        }
        state.set_direction(Direction::Forward);
        match labeler.tick(&mut src, &state) {
            TickOutcome::Emitted(r) => {
                assert_eq!(r.labels, Direction::Forward.labels());
                assert_eq!(r.sequence, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_frame_skips_without_counting() {
        let state = ActuationState::default();
        let mut labeler = FrameLabeler::new(80);
        labeler.attach(Vec::new(), &state);
        let mut src = MemorySource::new(2, 2, Encoding::Jpeg).with_gap();
        assert_eq!(labeler.tick(&mut src, &state), TickOutcome::NoFrame);
        assert_eq!(labeler.sequence(), 0);
        assert_eq!(labeler.phase(), StreamPhase::Streaming);
    }

    #[test]
    fn write_failure_drains_then_idles() {
        let state = ActuationState::default();
        let mut labeler = FrameLabeler::new(80);
        labeler.attach(BrokenPipe, &state);
        let mut src = jpeg_source();
        assert_eq!(labeler.tick(&mut src, &state), TickOutcome::Disconnected);
        assert_eq!(labeler.phase(), StreamPhase::Draining);
        assert_eq!(labeler.tick(&mut src, &state), TickOutcome::Inactive);
        assert_eq!(labeler.phase(), StreamPhase::Idle);
        assert_eq!(labeler.sequence(), 0);
    }

    #[test]
    fn emitted_chunks_parse_back() {
        let mut state = ActuationState::default();
        let mut labeler = FrameLabeler::new(80);
        labeler.attach(Vec::new(), &state);
        state.set_direction(Direction::BackwardRight);
        state.set_speed(90);
        let mut src = jpeg_source();
        labeler.tick(&mut src, &state);
        labeler.tick(&mut src, &state);
        let wire = labeler.client.take().unwrap();

        let mut reader = MultipartReader::new(wire.as_slice());
        let first = reader.next_chunk().unwrap().unwrap();
        assert_eq!(first.label.as_deref(), Some("0 0 0 1 1 90.jpg"));
        assert_eq!(first.data, vec![0xFF, 0xD8, 1, 2, 0xFF, 0xD9]);
        let second = reader.next_chunk().unwrap().unwrap();
        assert_eq!(second.label.as_deref(), Some("1 0 0 1 1 90.jpg"));
        assert!(reader.next_chunk().unwrap().is_none());
    }

    #[test]
    fn oversized_content_length_is_an_error() {
        let wire = b"--frame\r\nX-Label: 0 0 0 0 0 1.jpg\r\nContent-Length: 99999999999999999\r\n\r\nabc";
        let mut reader = MultipartReader::new(&wire[..]);
        let err = reader.next_chunk().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn unbounded_chunk_without_length_is_an_error() {
        let mut wire = b"--frame\r\nX-Label: 0 0 0 0 0 1.jpg\r\n\r\n".to_vec();
        wire.resize(wire.len() + MAX_CHUNK_BYTES + 64, 0x55);
        let mut reader = MultipartReader::new(wire.as_slice());
        let err = reader.next_chunk().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn reader_falls_back_to_boundary_search() {
        let wire = b"--frame\r\nX-Label: 3 1 0 0 0 5.jpg\r\n\r\nabc\r\n--frame\r\nX-Label: 4 0 0 0 0 5.jpg\r\n\r\nxyz";
        let mut reader = MultipartReader::new(&wire[..]);
        let a = reader.next_chunk().unwrap().unwrap();
        assert_eq!(a.data, b"abc");
        let b = reader.next_chunk().unwrap().unwrap();
        assert_eq!(b.label.as_deref(), Some("4 0 0 0 0 5.jpg"));
        assert_eq!(b.data, b"xyz");
    }
}
