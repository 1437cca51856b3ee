/// Fragment envelope — binary wire unit for mesh relay
///
/// Format (big-endian multi-byte fields, no padding):
/// [1]  magic (0xD9)
/// [8]  fragment id
/// [2]  index (BE u16)
/// [2]  total (BE u16)
/// [1]  ttl
/// [1]  original payload type
/// [1]  recipient length
/// [N]  recipient (UTF-8, N = recipient length)
/// [..] data

use super::CodecError;

/// Envelope magic byte. Outside printable ASCII, so envelope bytes can
/// never satisfy the legacy chunk heuristic.
pub const ENVELOPE_MAGIC: u8 = 0xD9;

/// A single binary fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentEnvelope {
    /// Groups fragments of one message (8 random bytes)
    pub fragment_id: [u8; 8],
    /// Position of this fragment (0-based)
    pub index: u16,
    /// Total fragment count for the message
    pub total: u16,
    /// Remaining relay hop budget. <= 1 is terminal.
    pub ttl: u8,
    /// What the reassembled payload is (see `codec::payload_type`)
    pub original_type: u8,
    /// Intended recipient id; None/empty means "for whoever reassembles"
    pub recipient: Option<String>,
    /// Fragment data
    pub data: Vec<u8>,
}

impl FragmentEnvelope {
    /// Fixed header size: magic + id + index + total + ttl + type + recipient length
    pub const HEADER_LEN: usize = 1 + 8 + 2 + 2 + 1 + 1 + 1;

    /// Create a fragment, enforcing the index/total invariant
    pub fn new(
        fragment_id: [u8; 8],
        index: u16,
        total: u16,
        ttl: u8,
        original_type: u8,
        recipient: Option<String>,
        data: Vec<u8>,
    ) -> Result<Self, CodecError> {
        if total == 0 {
            return Err(CodecError::ZeroTotal);
        }
        if index >= total {
            return Err(CodecError::IndexOutOfRange { index, total });
        }
        if let Some(r) = &recipient {
            if r.len() > u8::MAX as usize {
                return Err(CodecError::RecipientTooLong(r.len()));
            }
        }
        Ok(Self {
            fragment_id,
            index,
            total,
            ttl,
            original_type,
            recipient,
            data,
        })
    }

    /// Hex rendering of the fragment id, used as the reassembly key
    pub fn id_hex(&self) -> String {
        hex::encode(self.fragment_id)
    }

    /// Serialize to wire bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let recipient = self.recipient.as_deref().unwrap_or("");
        if recipient.len() > u8::MAX as usize {
            return Err(CodecError::RecipientTooLong(recipient.len()));
        }

        let mut buf = Vec::with_capacity(Self::HEADER_LEN + recipient.len() + self.data.len());
        buf.push(ENVELOPE_MAGIC);
        buf.extend_from_slice(&self.fragment_id);
        buf.extend_from_slice(&self.index.to_be_bytes());
        buf.extend_from_slice(&self.total.to_be_bytes());
        buf.push(self.ttl);
        buf.push(self.original_type);
        buf.push(recipient.len() as u8);
        buf.extend_from_slice(recipient.as_bytes());
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    /// Deserialize from wire bytes.
    ///
    /// Short buffers and truncated recipients are errors; callers treat any
    /// error as a silent drop, never as fatal.
    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < Self::HEADER_LEN {
            return Err(CodecError::BufferTooShort {
                need: Self::HEADER_LEN,
                got: data.len(),
            });
        }
        if data[0] != ENVELOPE_MAGIC {
            return Err(CodecError::BadMagic(data[0]));
        }

        let mut offset = 1;

        let mut fragment_id = [0u8; 8];
        fragment_id.copy_from_slice(&data[offset..offset + 8]);
        offset += 8;

        let index = u16::from_be_bytes([data[offset], data[offset + 1]]);
        offset += 2;

        let total = u16::from_be_bytes([data[offset], data[offset + 1]]);
        offset += 2;

        let ttl = data[offset];
        offset += 1;

        let original_type = data[offset];
        offset += 1;

        let recipient_len = data[offset] as usize;
        offset += 1;

        if data.len() < offset + recipient_len {
            return Err(CodecError::BufferTooShort {
                need: offset + recipient_len,
                got: data.len(),
            });
        }

        let recipient = if recipient_len == 0 {
            None
        } else {
            let raw = &data[offset..offset + recipient_len];
            match std::str::from_utf8(raw) {
                Ok(s) => Some(s.to_string()),
                Err(_) => return Err(CodecError::BadRecipient),
            }
        };
        offset += recipient_len;

        if total == 0 {
            return Err(CodecError::ZeroTotal);
        }
        if index >= total {
            return Err(CodecError::IndexOutOfRange { index, total });
        }

        Ok(Self {
            fragment_id,
            index,
            total,
            ttl,
            original_type,
            recipient,
            data: data[offset..].to_vec(),
        })
    }

    /// Copy of this fragment with one hop spent, for relay forwarding
    pub fn decremented(&self) -> Self {
        let mut out = self.clone();
        out.ttl = out.ttl.saturating_sub(1);
        out
    }

    /// Split a payload into envelopes sized for `mtu`-byte writes.
    ///
    /// Every fragment of one message carries the same id, ttl, type, and
    /// recipient, so the per-fragment data budget is the MTU minus the full
    /// header including the recipient.
    pub fn fragment_payload(
        fragment_id: [u8; 8],
        payload: &[u8],
        mtu: usize,
        ttl: u8,
        original_type: u8,
        recipient: Option<&str>,
    ) -> Result<Vec<FragmentEnvelope>, CodecError> {
        let recipient = recipient.filter(|r| !r.is_empty());
        if let Some(r) = recipient {
            if r.len() > u8::MAX as usize {
                return Err(CodecError::RecipientTooLong(r.len()));
            }
        }

        let overhead = Self::HEADER_LEN + recipient.map_or(0, str::len);
        if mtu <= overhead {
            return Err(CodecError::MtuTooSmall(mtu));
        }
        let budget = mtu - overhead;

        let total = if payload.is_empty() {
            1
        } else {
            payload.len().div_ceil(budget)
        };
        if total > u16::MAX as usize {
            return Err(CodecError::TooManyFragments(total));
        }

        let mut out = Vec::with_capacity(total);
        if payload.is_empty() {
            out.push(Self::new(
                fragment_id,
                0,
                1,
                ttl,
                original_type,
                recipient.map(str::to_string),
                Vec::new(),
            )?);
            return Ok(out);
        }

        for (i, part) in payload.chunks(budget).enumerate() {
            out.push(Self::new(
                fragment_id,
                i as u16,
                total as u16,
                ttl,
                original_type,
                recipient.map(str::to_string),
                part.to_vec(),
            )?);
        }
        Ok(out)
    }
}
