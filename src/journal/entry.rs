use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::Rng;

/// SequenceNumber identifies an entry's position in the global journal stream.
///
/// Nonnegative values are assigned serially by the journal writer and never
/// reused. Negative values are reserved for term-start sentinels: a newly
/// elected primary appends a random negative SN to prove it has drained the
/// log of every entry committed under previous terms.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SequenceNumber(i64);

impl SequenceNumber {
    pub fn new(val: i64) -> Self {
        SequenceNumber(val)
    }

    /// Draws a random sentinel SN. Randomness lets two contending primaries
    /// tell their own sentinel apart from the other's without coordination.
    pub fn draw_sentinel() -> Self {
        SequenceNumber(rand::thread_rng().gen_range(i64::MIN..0))
    }

    pub fn val(&self) -> i64 {
        self.0
    }

    pub fn is_sentinel(&self) -> bool {
        self.0 < 0
    }

    pub fn next(&self) -> Self {
        SequenceNumber(self.0 + 1)
    }
}

impl From<i64> for SequenceNumber {
    fn from(val: i64) -> Self {
        SequenceNumber(val)
    }
}

/// JournalEntry is the envelope replicated through the consensus engine.
///
/// The target names the logical journal the payload belongs to; sentinels
/// carry no target and no payload. The payload itself is opaque to this
/// crate, it only has meaning to the master that produced it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct JournalEntry {
    pub sn: SequenceNumber,
    pub target: Option<String>,
    pub payload: Bytes,
}

impl JournalEntry {
    pub fn new(sn: SequenceNumber, target: impl Into<String>, payload: Bytes) -> Self {
        JournalEntry {
            sn,
            target: Some(target.into()),
            payload,
        }
    }

    /// A term-start sentinel entry. Carries nothing but its negative SN.
    pub fn sentinel(sn: SequenceNumber) -> Self {
        JournalEntry {
            sn,
            target: None,
            payload: Bytes::new(),
        }
    }

    /// Wire layout: `sn:i64 | target_len:u16 | target | payload`. A zero
    /// target_len means absent (sentinels).
    pub fn encode(&self) -> Bytes {
        let target = self.target.as_deref().unwrap_or("");
        let mut buf = BytesMut::with_capacity(8 + 2 + target.len() + self.payload.len());
        buf.put_i64(self.sn.val());
        buf.put_u16(target.len() as u16);
        buf.put_slice(target.as_bytes());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut raw: Bytes) -> Result<Self, EntryCodecError> {
        if raw.len() < 10 {
            return Err(EntryCodecError::Truncated { len: raw.len() });
        }
        let sn = SequenceNumber::new(raw.get_i64());
        let target_len = raw.get_u16() as usize;
        if raw.len() < target_len {
            return Err(EntryCodecError::Truncated { len: raw.len() });
        }
        let target = if target_len == 0 {
            None
        } else {
            let target_bytes = raw.split_to(target_len);
            let name = std::str::from_utf8(&target_bytes)
                .map_err(|_| EntryCodecError::BadTargetName)?
                .to_string();
            Some(name)
        };

        Ok(JournalEntry {
            sn,
            target,
            payload: raw,
        })
    }

    /// Encoded size without materializing the envelope.
    pub fn encoded_len(&self) -> usize {
        8 + 2 + self.target.as_deref().map_or(0, str::len) + self.payload.len()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EntryCodecError {
    #[error("journal entry envelope truncated ({len} bytes)")]
    Truncated { len: usize },

    #[error("journal entry target name is not valid UTF-8")]
    BadTargetName,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let entry = JournalEntry::new(
            SequenceNumber::new(42),
            "file-master",
            Bytes::from_static(b"mkdir /a/b"),
        );
        let decoded = JournalEntry::decode(entry.encode()).unwrap();
        assert_eq!(entry, decoded);
    }

    #[test]
    fn sentinel_round_trip() {
        let sn = SequenceNumber::draw_sentinel();
        assert!(sn.is_sentinel());
        let entry = JournalEntry::sentinel(sn);
        let decoded = JournalEntry::decode(entry.encode()).unwrap();
        assert_eq!(decoded.sn, sn);
        assert_eq!(decoded.target, None);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn decode_rejects_truncated_envelope() {
        let err = JournalEntry::decode(Bytes::from_static(&[0u8; 5])).unwrap_err();
        assert!(matches!(err, EntryCodecError::Truncated { len: 5 }));
    }

    #[test]
    fn decode_rejects_short_target() {
        let mut buf = BytesMut::new();
        buf.put_i64(7);
        buf.put_u16(200); // claims a 200 byte target that isn't there
        buf.put_slice(b"abc");
        let err = JournalEntry::decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, EntryCodecError::Truncated { .. }));
    }

    #[test]
    fn encoded_len_matches_encode() {
        let entry = JournalEntry::new(SequenceNumber::new(0), "m", Bytes::from_static(b"xyz"));
        assert_eq!(entry.encoded_len(), entry.encode().len());
    }

    #[test]
    fn sentinel_draws_are_negative() {
        for _ in 0..1000 {
            assert!(SequenceNumber::draw_sentinel().is_sentinel());
        }
    }
}
