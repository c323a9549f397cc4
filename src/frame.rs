//! Wire codec for protocol frames.
//!
//! Every frame starts with a fixed 5-byte header: a type tag, a 16-bit
//! big-endian route key and a 16-bit big-endian session nonce. The payload
//! interpretation depends on the type: MSG and ACK carry a step-tagged
//! payload, SIG carries a step-tagged signal code.

/// Size of the fixed frame prefix in bytes.
pub const HEADER_SIZE: usize = 5;

/// Frame type tag at offset 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[repr(u8)]
pub enum FrameType {
    Open = 0,
    Sig = 1,
    Msg = 2,
    Ack = 3,
}

impl FrameType {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(FrameType::Open),
            1 => Some(FrameType::Sig),
            2 => Some(FrameType::Msg),
            3 => Some(FrameType::Ack),
            _ => None,
        }
    }
}

/// Parsed 5-byte frame prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub struct FrameHeader {
    pub frame_type: FrameType,
    pub key: u16,
    pub nonce: u16,
}

impl FrameHeader {
    /// Serializes the header followed by `payload`.
    pub fn build(&self, payload: &[u8]) -> Vec<u8> {
        use bytes::BufMut as _;

        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len());
        data.put_u8(self.frame_type as u8);
        data.put_u16(self.key);
        data.put_u16(self.nonce);
        data.put_slice(payload);
        data
    }

    /// Parses the prefix of `data`, returning the header and the payload.
    ///
    /// Returns `None` when `data` is shorter than the prefix or the type
    /// tag is unknown.
    pub fn parse(data: &[u8]) -> Option<(Self, &[u8])> {
        use bytes::Buf as _;

        if data.len() < HEADER_SIZE {
            return None;
        }
        let (mut prefix, payload) = data.split_at(HEADER_SIZE);
        let frame_type = FrameType::from_tag(prefix.get_u8())?;
        let key = prefix.get_u16();
        let nonce = prefix.get_u16();
        Some((
            Self {
                frame_type,
                key,
                nonce,
            },
            payload,
        ))
    }
}

/// Header constraint used by filtered receives.
///
/// Every present field must equal the parsed value for the frame to match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FramePattern {
    pub frame_type: Option<FrameType>,
    pub key: Option<u16>,
    pub nonce: Option<u16>,
}

impl FramePattern {
    pub fn matches<'a>(&self, data: &'a [u8]) -> Option<(FrameHeader, &'a [u8])> {
        let (header, payload) = FrameHeader::parse(data)?;
        if let Some(frame_type) = self.frame_type {
            if frame_type != header.frame_type {
                return None;
            }
        }
        if let Some(key) = self.key {
            if key != header.key {
                return None;
            }
        }
        if let Some(nonce) = self.nonce {
            if nonce != header.nonce {
                return None;
            }
        }
        Some((header, payload))
    }
}

/// Prefixes `body` with a 4-byte little-endian step.
pub fn build_step(step: u32, body: &[u8]) -> Vec<u8> {
    use bytes::BufMut as _;

    let mut data = Vec::with_capacity(4 + body.len());
    data.put_u32_le(step);
    data.put_slice(body);
    data
}

/// Parses a step-tagged payload.
///
/// When `expect` is set the parsed step must equal it; otherwise the parsed
/// step is returned as is.
pub fn parse_step(expect: Option<u32>, payload: &[u8]) -> Option<(u32, &[u8])> {
    use bytes::Buf as _;

    if payload.len() < 4 {
        return None;
    }
    let (mut prefix, body) = payload.split_at(4);
    let step = prefix.get_u32_le();
    if let Some(expect) = expect {
        if expect != step {
            return None;
        }
    }
    Some((step, body))
}

/// Session control code carried inside SIG frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[repr(u8)]
pub enum Signal {
    Init = 0,
    Term = 1,
}

impl Signal {
    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Signal::Init),
            1 => Some(Signal::Term),
            _ => None,
        }
    }
}

/// Builds a SIG payload: step prefix followed by the signal code.
pub fn build_signal(step: u32, signal: Signal) -> Vec<u8> {
    build_step(step, &[signal as u8])
}

/// Parses a SIG payload, validating the step when `expect` is set.
pub fn parse_signal(expect: Option<u32>, payload: &[u8]) -> Option<(u32, Signal)> {
    let (step, body) = parse_step(expect, payload)?;
    match body {
        [code] => Some((step, Signal::from_code(*code)?)),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::*;

    #[proptest]
    fn header_build_parse(header: FrameHeader, body: Vec<u8>) {
        let data = header.build(&body);
        let (header2, body2) = FrameHeader::parse(&data).unwrap();
        prop_assert_eq!(header, header2);
        prop_assert_eq!(body.as_slice(), body2);
    }

    #[proptest]
    fn pattern_full_match(header: FrameHeader) {
        let data = header.build(&[]);
        let pattern = FramePattern {
            frame_type: Some(header.frame_type),
            key: Some(header.key),
            nonce: Some(header.nonce),
        };
        prop_assert!(pattern.matches(&data).is_some());
    }

    #[proptest]
    fn pattern_key_mismatch(header: FrameHeader, other_key: u16) {
        prop_assume!(other_key != header.key);
        let data = header.build(&[]);
        let pattern = FramePattern {
            key: Some(other_key),
            ..FramePattern::default()
        };
        prop_assert_eq!(pattern.matches(&data), None);
    }

    #[proptest]
    fn step_build_parse(step: u32, body: Vec<u8>) {
        let payload = build_step(step, &body);
        let (step2, body2) = parse_step(None, &payload).unwrap();
        prop_assert_eq!(step, step2);
        prop_assert_eq!(body.as_slice(), body2);
        prop_assert!(parse_step(Some(step), &payload).is_some());
    }

    #[proptest]
    fn signal_build_parse(step: u32, signal: Signal) {
        let payload = build_signal(step, signal);
        prop_assert_eq!(parse_signal(Some(step), &payload), Some((step, signal)));
    }

    #[test]
    fn unknown_type_tag() {
        let data = [7u8, 0, 0, 0, 0];
        assert_eq!(FrameHeader::parse(&data), None);
    }

    #[test]
    fn truncated_header() {
        assert_eq!(FrameHeader::parse(&[2u8, 0, 1]), None);
    }

    #[test]
    fn msg_wire_exactness() {
        let header = FrameHeader {
            frame_type: FrameType::Msg,
            key: 1,
            nonce: 4,
        };
        let data = header.build(&build_step(1, &[0x00]));
        assert_eq!(
            data,
            vec![0x02, 0x00, 0x01, 0x00, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn init_signal_wire_exactness() {
        let payload = build_signal(0, Signal::Init);
        assert_eq!(payload, vec![0x00, 0x00, 0x00, 0x00, 0x00]);
        let payload = build_signal(2, Signal::Term);
        assert_eq!(payload, vec![0x02, 0x00, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn mismatched_step_rejected() {
        let payload = build_step(7, b"data");
        assert_eq!(parse_step(Some(8), &payload), None);
    }
}
