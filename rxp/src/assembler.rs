//! File segmentation and reassembly.
//!
//! The send side cuts a byte buffer into fixed [`MAX_PAYLOAD`]-sized
//! [`Segment`]s; the receive side collects payload chunks in the order they
//! were accepted and stitches them back together once the LAST segment has
//! arrived.
//!
//! Reassembly assumes chunks arrive in order with no gaps.  That guarantee is
//! provided by the stop-and-wait acceptance rule in [`crate::receiver`], not
//! here.

use crate::packet::MAX_PAYLOAD;

/// One chunk of file data destined for a single packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub payload: Vec<u8>,
    /// Set only on the final segment.
    pub last: bool,
}

/// Number of segments `len` bytes occupy.  An empty file still needs one.
pub fn segment_count(len: usize) -> usize {
    len.div_ceil(MAX_PAYLOAD).max(1)
}

/// Partition `data` into ordered segments of at most [`MAX_PAYLOAD`] bytes.
///
/// The final segment carries `last = true` and may be shorter than the rest.
/// An empty buffer yields exactly one empty LAST segment.
pub fn split(data: &[u8]) -> Vec<Segment> {
    if data.is_empty() {
        return vec![Segment {
            payload: Vec::new(),
            last: true,
        }];
    }

    let total = segment_count(data.len());
    data.chunks(MAX_PAYLOAD)
        .enumerate()
        .map(|(index, chunk)| Segment {
            payload: chunk.to_vec(),
            last: index + 1 == total,
        })
        .collect()
}

/// Ordered store of received payload chunks.
#[derive(Debug, Default)]
pub struct Reassembly {
    chunks: Vec<Vec<u8>>,
    complete: bool,
}

impl Reassembly {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the next in-order chunk.  `last` marks the end of the file;
    /// chunks pushed after that are ignored.
    pub fn push(&mut self, chunk: &[u8], last: bool) {
        if self.complete {
            return;
        }
        self.chunks.push(chunk.to_vec());
        self.complete = last;
    }

    /// Number of chunks accepted so far.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// `true` once the LAST chunk has been accepted.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Concatenate the chunks into the finished file.
    ///
    /// Every chunk except the last is laid down at a fixed stride of
    /// [`MAX_PAYLOAD`]; the last may be short.  Returns `None` until the LAST
    /// chunk has been accepted.
    pub fn finish(self) -> Option<Vec<u8>> {
        if !self.complete {
            return None;
        }
        let (last, body) = self.chunks.split_last()?;
        let mut file = vec![0u8; body.len() * MAX_PAYLOAD + last.len()];
        for (i, chunk) in body.iter().enumerate() {
            let start = i * MAX_PAYLOAD;
            file[start..start + chunk.len()].copy_from_slice(chunk);
        }
        file[body.len() * MAX_PAYLOAD..].copy_from_slice(last);
        Some(file)
    }
}
