//! Length-prefixed binary framing for the content sub-messages.
//!
//! Every frame is `tag: u8 | len: u32 (big endian) | payload`. Download
//! streams carry `FILE` and `CHUNK` frames; phase-2 uploads carry `CHUNK`,
//! `COMMIT` and `ABORT` frames.

use thiserror::Error;

/// Preferred payload size of one phase-2 request.
pub const PHASE2_TARGET_PAYLOAD: usize = 256 * 1024;
/// A chunk smaller than this is not started at the tail of a request.
pub const PHASE2_MIN_CHUNK: usize = 64 * 1024;
/// Hard ceiling on a single frame.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

const HEADER_LEN: usize = 5;

const TAG_DOWNLOAD_FILE: u8 = 1;
const TAG_DOWNLOAD_CHUNK: u8 = 2;
const TAG_PHASE2_CHUNK: u8 = 3;
const TAG_PHASE2_COMMIT: u8 = 4;
const TAG_PHASE2_ABORT: u8 = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("unknown frame tag {0}")]
    UnknownTag(u8),
    #[error("frame of {0} bytes exceeds the limit")]
    TooLarge(usize),
    #[error("frame payload is truncated")]
    Truncated,
    #[error("commit hash is not valid UTF-8")]
    InvalidHash,
    #[error("stream ended inside a frame")]
    UnexpectedEof,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadMessage {
    /// Announces the next file. `remaining` is less than `total_size` when
    /// the server resumes a partially cached download.
    File {
        inode: u64,
        total_size: u64,
        remaining: u64,
    },
    Chunk(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase2Message {
    Chunk { inode: u64, data: Vec<u8> },
    Commit { inode: u64, hash: String },
    Abort { inode: u64 },
}

impl Phase2Message {
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN
            + match self {
                Phase2Message::Chunk { data, .. } => 8 + data.len(),
                Phase2Message::Commit { hash, .. } => 8 + hash.len(),
                Phase2Message::Abort { .. } => 8,
            }
    }
}

fn put_frame(out: &mut Vec<u8>, tag: u8, payload_len: usize) {
    out.push(tag);
    out.extend_from_slice(&(payload_len as u32).to_be_bytes());
}

pub fn encode_download(message: &DownloadMessage, out: &mut Vec<u8>) {
    match message {
        DownloadMessage::File {
            inode,
            total_size,
            remaining,
        } => {
            put_frame(out, TAG_DOWNLOAD_FILE, 24);
            out.extend_from_slice(&inode.to_be_bytes());
            out.extend_from_slice(&total_size.to_be_bytes());
            out.extend_from_slice(&remaining.to_be_bytes());
        }
        DownloadMessage::Chunk(data) => {
            put_frame(out, TAG_DOWNLOAD_CHUNK, data.len());
            out.extend_from_slice(data);
        }
    }
}

pub fn encode_phase2(message: &Phase2Message, out: &mut Vec<u8>) {
    match message {
        Phase2Message::Chunk { inode, data } => {
            put_frame(out, TAG_PHASE2_CHUNK, 8 + data.len());
            out.extend_from_slice(&inode.to_be_bytes());
            out.extend_from_slice(data);
        }
        Phase2Message::Commit { inode, hash } => {
            put_frame(out, TAG_PHASE2_COMMIT, 8 + hash.len());
            out.extend_from_slice(&inode.to_be_bytes());
            out.extend_from_slice(hash.as_bytes());
        }
        Phase2Message::Abort { inode } => {
            put_frame(out, TAG_PHASE2_ABORT, 8);
            out.extend_from_slice(&inode.to_be_bytes());
        }
    }
}

pub fn encode_phase2_batch(messages: &[Phase2Message]) -> Vec<u8> {
    let mut out = Vec::with_capacity(messages.iter().map(Phase2Message::encoded_len).sum());
    for message in messages {
        encode_phase2(message, &mut out);
    }
    out
}

fn read_u64(payload: &[u8], at: usize) -> Result<u64, FrameError> {
    let bytes: [u8; 8] = payload
        .get(at..at + 8)
        .and_then(|slice| slice.try_into().ok())
        .ok_or(FrameError::Truncated)?;
    Ok(u64::from_be_bytes(bytes))
}

/// Incremental decoder fed with arbitrarily split network buffers.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Call once the underlying stream is exhausted.
    pub fn finish(&self) -> Result<(), FrameError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(FrameError::UnexpectedEof)
        }
    }

    fn next_raw(&mut self) -> Result<Option<(u8, Vec<u8>)>, FrameError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let tag = self.buf[0];
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(len));
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        let payload = self.buf[HEADER_LEN..HEADER_LEN + len].to_vec();
        self.buf.drain(..HEADER_LEN + len);
        Ok(Some((tag, payload)))
    }

    pub fn next_download(&mut self) -> Result<Option<DownloadMessage>, FrameError> {
        let Some((tag, payload)) = self.next_raw()? else {
            return Ok(None);
        };
        match tag {
            TAG_DOWNLOAD_FILE => Ok(Some(DownloadMessage::File {
                inode: read_u64(&payload, 0)?,
                total_size: read_u64(&payload, 8)?,
                remaining: read_u64(&payload, 16)?,
            })),
            TAG_DOWNLOAD_CHUNK => Ok(Some(DownloadMessage::Chunk(payload))),
            other => Err(FrameError::UnknownTag(other)),
        }
    }

    pub fn next_phase2(&mut self) -> Result<Option<Phase2Message>, FrameError> {
        let Some((tag, payload)) = self.next_raw()? else {
            return Ok(None);
        };
        let inode = read_u64(&payload, 0)?;
        match tag {
            TAG_PHASE2_CHUNK => Ok(Some(Phase2Message::Chunk {
                inode,
                data: payload[8..].to_vec(),
            })),
            TAG_PHASE2_COMMIT => {
                let hash =
                    String::from_utf8(payload[8..].to_vec()).map_err(|_| FrameError::InvalidHash)?;
                Ok(Some(Phase2Message::Commit { inode, hash }))
            }
            TAG_PHASE2_ABORT => Ok(Some(Phase2Message::Abort { inode })),
            other => Err(FrameError::UnknownTag(other)),
        }
    }
}

/// Groups phase-2 sub-messages into requests of roughly
/// [`PHASE2_TARGET_PAYLOAD`] bytes.
#[derive(Debug, Default)]
pub struct Phase2Batcher {
    pending: Vec<Phase2Message>,
    pending_len: usize,
}

impl Phase2Batcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many content bytes the next chunk may carry without overflowing
    /// the current request. Zero means the request should be flushed first.
    pub fn chunk_budget(&self) -> usize {
        let room = PHASE2_TARGET_PAYLOAD.saturating_sub(self.pending_len);
        if room < PHASE2_MIN_CHUNK && !self.pending.is_empty() {
            0
        } else {
            room.max(PHASE2_MIN_CHUNK)
        }
    }

    pub fn push(&mut self, message: Phase2Message) {
        self.pending_len += message.encoded_len();
        self.pending.push(message);
    }

    pub fn is_full(&self) -> bool {
        self.pending_len >= PHASE2_TARGET_PAYLOAD
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn take(&mut self) -> Vec<Phase2Message> {
        self.pending_len = 0;
        std::mem::take(&mut self.pending)
    }
}
