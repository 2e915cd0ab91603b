//! Reassembly of the vendor notification stream into frames.
//!
//! GATT notifications are bounded by the negotiated MTU, so a single frame
//! may arrive split over several notifications, and one notification may
//! carry the tail of one frame and the head of the next. The [`Framer`]
//! buffers the stream, resynchronises on the start-of-frame byte and
//! validates every frame with a CRC-32 trailer.

use std::time::{Duration, Instant};

use crc32fast::Hasher;
use log::{debug, warn};

use crate::{
   bluetooth::gatt::Packet,
   wearable::protocol::{
      FRAME_CRC_LEN, FRAME_HEADER_LEN, FRAME_SOF, FRAME_VERSION, Frame, MAX_FRAME_LEN,
      MAX_PAYLOAD_LEN,
   },
};

/// A partial frame older than this is dropped when the next chunk arrives,
/// however recently its last piece came in.
pub const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Sequence jumps of this size or more are treated as a device restart.
const SEQ_RESTART_THRESHOLD: u8 = 128;

/// Counters describing the health of the incoming stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramerStats {
   pub frames: u64,
   pub discarded_bytes: u64,
   pub crc_errors: u64,
   pub oversize: u64,
   pub lost_frames: u64,
   pub resets: u64,
}

impl FramerStats {
   pub fn to_json(self) -> serde_json::Value {
      serde_json::json!({
          "frames": self.frames,
          "discarded_bytes": self.discarded_bytes,
          "crc_errors": self.crc_errors,
          "oversize": self.oversize,
          "lost_frames": self.lost_frames,
          "resets": self.resets,
      })
   }
}

/// Incremental frame decoder for one device stream.
#[derive(Debug, Default)]
pub struct Framer {
   buf: Vec<u8>,
   /// When the bytes at the front of `buf` started arriving.
   partial_since: Option<Instant>,
   last_seq: Option<u8>,
   stats: FramerStats,
}

enum Step {
   /// Need more bytes.
   Incomplete,
   /// Drop this many leading bytes and try again.
   Skip(usize),
   /// Header announced a payload above the limit.
   Oversize,
   /// Trailer did not match the frame contents.
   BadCrc,
   /// A valid frame spanning this many bytes.
   Frame(Frame, usize),
}

impl Framer {
   pub fn new() -> Self {
      Self::default()
   }

   pub const fn stats(&self) -> FramerStats {
      self.stats
   }

   #[cfg(test)]
   fn pending(&self) -> usize {
      self.buf.len()
   }

   /// Drops any partial frame and forgets the sequence history.
   pub fn reset(&mut self) {
      if !self.buf.is_empty() {
         self.stats.discarded_bytes += self.buf.len() as u64;
         self.stats.resets += 1;
      }
      self.buf.clear();
      self.last_seq = None;
      self.partial_since = None;
   }

   /// Feeds one notification and returns every frame it completes.
   pub fn push(&mut self, chunk: &[u8], now: Instant) -> Vec<Frame> {
      if !self.buf.is_empty()
         && let Some(since) = self.partial_since
         && now.saturating_duration_since(since) > REASSEMBLY_TIMEOUT
      {
         debug!("Dropping stale partial frame ({} bytes)", self.buf.len());
         self.stats.discarded_bytes += self.buf.len() as u64;
         self.stats.resets += 1;
         self.buf.clear();
         self.partial_since = None;
      }
      self.buf.extend_from_slice(chunk);

      let mut frames = Vec::new();
      let mut cursor = 0;
      loop {
         match Self::step(&self.buf[cursor..]) {
            Step::Incomplete => break,
            Step::Skip(n) => {
               cursor += n;
            },
            Step::Oversize => {
               self.stats.oversize += 1;
               cursor += 1;
            },
            Step::BadCrc => {
               self.stats.crc_errors += 1;
               cursor += 1;
            },
            Step::Frame(frame, n) => {
               cursor += n;
               self.track_seq(frame.seq);
               self.stats.frames += 1;
               frames.push(frame);
            },
         }
      }
      self.account_skipped(cursor, &frames);
      self.buf.drain(..cursor);
      if self.buf.is_empty() {
         self.partial_since = None;
      } else if cursor > 0 || self.partial_since.is_none() {
         self.partial_since = Some(now);
      }

      // A well-formed stream never needs more than one frame of lookahead.
      if self.buf.len() > 2 * MAX_FRAME_LEN {
         warn!("Framer buffer overflow, dropping {} bytes", self.buf.len());
         self.stats.discarded_bytes += self.buf.len() as u64;
         self.stats.resets += 1;
         self.buf.clear();
         self.partial_since = None;
      }
      frames
   }

   fn account_skipped(&mut self, consumed: usize, frames: &[Frame]) {
      let framed: usize = frames
         .iter()
         .map(|f| FRAME_HEADER_LEN + f.payload.len() + FRAME_CRC_LEN)
         .sum();
      self.stats.discarded_bytes += (consumed - framed) as u64;
   }

   fn step(buf: &[u8]) -> Step {
      let Some(start) = buf.iter().position(|&b| b == FRAME_SOF) else {
         return if buf.is_empty() {
            Step::Incomplete
         } else {
            Step::Skip(buf.len())
         };
      };
      if start > 0 {
         return Step::Skip(start);
      }
      if buf.len() < FRAME_HEADER_LEN {
         return Step::Incomplete;
      }
      if buf[1] != FRAME_VERSION {
         return Step::Skip(1);
      }
      let len = u16::from_le_bytes([buf[4], buf[5]]) as usize;
      if len > MAX_PAYLOAD_LEN {
         return Step::Oversize;
      }
      let total = FRAME_HEADER_LEN + len + FRAME_CRC_LEN;
      if buf.len() < total {
         return Step::Incomplete;
      }
      let body_end = FRAME_HEADER_LEN + len;
      let received = u32::from_le_bytes([
         buf[body_end],
         buf[body_end + 1],
         buf[body_end + 2],
         buf[body_end + 3],
      ]);
      if frame_crc(&buf[1..body_end]) != received {
         return Step::BadCrc;
      }
      Step::Frame(
         Frame {
            seq: buf[2],
            kind: buf[3],
            payload: Packet::from_slice(&buf[FRAME_HEADER_LEN..body_end]),
         },
         total,
      )
   }

   fn track_seq(&mut self, seq: u8) {
      if let Some(last) = self.last_seq {
         let gap = seq.wrapping_sub(last).wrapping_sub(1);
         if gap != 0 {
            if gap < SEQ_RESTART_THRESHOLD {
               debug!("Sequence gap: {last} -> {seq} ({gap} lost)");
               self.stats.lost_frames += u64::from(gap);
            } else {
               debug!("Sequence restart: {last} -> {seq}");
            }
         }
      }
      self.last_seq = Some(seq);
   }
}

/// CRC over everything between the SOF byte and the trailer.
fn frame_crc(bytes: &[u8]) -> u32 {
   let mut hasher = Hasher::new();
   hasher.update(bytes);
   hasher.finalize()
}

/// Builds a complete frame: header, payload and CRC trailer.
pub fn encode_frame(seq: u8, kind: u8, payload: &[u8]) -> Packet {
   debug_assert!(payload.len() <= MAX_PAYLOAD_LEN);
   let mut pkt = Packet::new();
   pkt.push(FRAME_SOF);
   pkt.push(FRAME_VERSION);
   pkt.push(seq);
   pkt.push(kind);
   pkt.extend_from_slice(&(payload.len() as u16).to_le_bytes());
   pkt.extend_from_slice(payload);
   let crc = frame_crc(&pkt[1..]);
   pkt.extend_from_slice(&crc.to_le_bytes());
   pkt
}
