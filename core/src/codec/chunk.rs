/// Legacy text chunk format — pipe-delimited ASCII
///
/// Format: `messageId|chunkIndex|totalChunks|isBinary(0|1)|content`
///
/// Kept for the single-fragment fast path and for peers that predate the
/// binary envelope. Content is always last so it may itself contain pipes.

use super::CodecError;

/// How many leading bytes the chunk heuristic inspects
pub const HEURISTIC_WINDOW: usize = 128;

/// Minimum pipe separators a chunk line must show within the window
pub const MIN_PIPES: usize = 4;

/// One pipe-delimited text chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMessage {
    /// Groups chunks of one message
    pub message_id: String,
    /// Position of this chunk (0-based)
    pub index: u16,
    /// Total chunk count for the message
    pub total: u16,
    /// Whether the reassembled content is binary (base64 in content)
    pub is_binary: bool,
    /// Chunk content
    pub content: String,
}

impl ChunkMessage {
    /// Create a chunk, enforcing the index/total invariant
    pub fn new(
        message_id: impl Into<String>,
        index: u16,
        total: u16,
        is_binary: bool,
        content: impl Into<String>,
    ) -> Result<Self, CodecError> {
        if total == 0 {
            return Err(CodecError::ZeroTotal);
        }
        if index >= total {
            return Err(CodecError::IndexOutOfRange { index, total });
        }
        Ok(Self {
            message_id: message_id.into(),
            index,
            total,
            is_binary,
            content: content.into(),
        })
    }

    /// Serialize to the wire line
    pub fn encode(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.message_id,
            self.index,
            self.total,
            if self.is_binary { 1 } else { 0 },
            self.content
        )
    }

    /// Parse a wire line. The content field is everything after the fourth
    /// pipe, pipes included.
    pub fn parse(line: &str) -> Result<Self, CodecError> {
        let mut parts = line.splitn(5, '|');

        let message_id = parts.next().ok_or(CodecError::NotAChunk)?;
        let index = parts.next().ok_or(CodecError::NotAChunk)?;
        let total = parts.next().ok_or(CodecError::NotAChunk)?;
        let is_binary = parts.next().ok_or(CodecError::NotAChunk)?;
        let content = parts.next().ok_or(CodecError::NotAChunk)?;

        if message_id.is_empty() {
            return Err(CodecError::BadChunkField("empty message id".to_string()));
        }

        let index: u16 = index
            .parse()
            .map_err(|_| CodecError::BadChunkField(format!("index: {index:?}")))?;
        let total: u16 = total
            .parse()
            .map_err(|_| CodecError::BadChunkField(format!("total: {total:?}")))?;
        let is_binary = match is_binary {
            "0" => false,
            "1" => true,
            other => {
                return Err(CodecError::BadChunkField(format!("isBinary: {other:?}")))
            }
        };

        Self::new(message_id, index, total, is_binary, content)
    }

    /// Split text into chunks whose encoded lines fit `mtu` bytes.
    ///
    /// Splits on char boundaries; a chunk never cuts a UTF-8 sequence.
    pub fn chunk_text(
        message_id: &str,
        text: &str,
        is_binary: bool,
        mtu: usize,
    ) -> Result<Vec<ChunkMessage>, CodecError> {
        // Worst-case header: id, two 5-digit counters, flag, four pipes
        let overhead = message_id.len() + 4 + 5 + 5 + 1;
        if mtu <= overhead {
            return Err(CodecError::MtuTooSmall(mtu));
        }
        let budget = mtu - overhead;

        let mut pieces: Vec<String> = Vec::new();
        let mut current = String::new();
        for ch in text.chars() {
            if current.len() + ch.len_utf8() > budget && !current.is_empty() {
                pieces.push(std::mem::take(&mut current));
            }
            current.push(ch);
        }
        if !current.is_empty() || pieces.is_empty() {
            pieces.push(current);
        }

        let total = pieces.len();
        if total > u16::MAX as usize {
            return Err(CodecError::TooManyFragments(total));
        }

        pieces
            .into_iter()
            .enumerate()
            .map(|(i, content)| {
                Self::new(message_id, i as u16, total as u16, is_binary, content)
            })
            .collect()
    }
}

/// The legacy chunk heuristic.
///
/// Scans up to the first `HEURISTIC_WINDOW` bytes: every byte must be
/// printable ASCII or TAB/LF/CR, and at least `MIN_PIPES` pipe separators
/// must appear in the window.
pub fn looks_like_chunk(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return false;
    }
    let window = &bytes[..bytes.len().min(HEURISTIC_WINDOW)];

    let mut pipes = 0;
    for &b in window {
        match b {
            b'\t' | b'\n' | b'\r' => {}
            0x20..=0x7E => {
                if b == b'|' {
                    pipes += 1;
                }
            }
            _ => return false,
        }
    }
    pipes >= MIN_PIPES
}
