use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const IN_PROGRESS: &str = "inprogress";

/// `offset: i64 | len: u32 | payload`, big endian.
pub const FRAME_HEADER_LEN: usize = 12;

/// File names inside `<root>/<topic>/`.
///
/// A closed unit is named after its partition and the highest offset it holds,
/// `<partition>.<highest_offset>`. Only the open unit is `<partition>.inprogress`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnitName {
    Closed { partition: i32, highest_offset: i64 },
    InProgress { partition: i32 },
}

impl UnitName {
    pub fn parse(file_name: &str) -> Option<UnitName> {
        let (partition, suffix) = file_name.split_once('.')?;
        let partition = partition.parse::<i32>().ok()?;
        if suffix.eq(IN_PROGRESS) {
            return Some(UnitName::InProgress { partition });
        }
        let highest_offset = suffix.parse::<i64>().ok()?;
        Some(UnitName::Closed {
            partition,
            highest_offset,
        })
    }

    pub fn partition(&self) -> i32 {
        match self {
            UnitName::Closed { partition, .. } => *partition,
            UnitName::InProgress { partition } => *partition,
        }
    }

    pub fn file_name(&self) -> String {
        match self {
            UnitName::Closed {
                partition,
                highest_offset,
            } => format!("{}.{}", partition, highest_offset),
            UnitName::InProgress { partition } => format!("{}.{}", partition, IN_PROGRESS),
        }
    }
}

pub fn frame_len(payload: &[u8]) -> usize {
    FRAME_HEADER_LEN + payload.len()
}

pub fn encode_frame(buffer: &mut BytesMut, offset: i64, payload: &[u8]) {
    buffer.reserve(frame_len(payload));
    buffer.put_i64(offset);
    buffer.put_u32(payload.len() as u32);
    buffer.put_slice(payload);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub offset: i64,
    pub payload: Bytes,
}

/// Result of reading a unit front to back.
#[derive(Clone, Debug, Default)]
pub struct FrameScan {
    pub frames: Vec<Frame>,
    /// Length of the complete frames. Anything past it is a torn tail.
    pub valid_len: usize,
}

impl FrameScan {
    pub fn highest_offset(&self) -> Option<i64> {
        self.frames.iter().map(|x| x.offset).max()
    }
}

pub fn decode_frames(data: Bytes) -> FrameScan {
    let mut scan = FrameScan::default();
    let mut buf = data;
    while buf.remaining() >= FRAME_HEADER_LEN {
        let mut header = &buf[..FRAME_HEADER_LEN];
        let offset = header.get_i64();
        let len = header.get_u32() as usize;
        if buf.remaining() < FRAME_HEADER_LEN + len {
            break;
        }

        buf.advance(FRAME_HEADER_LEN);
        let payload = buf.split_to(len);
        scan.frames.push(Frame { offset, payload });
        scan.valid_len += FRAME_HEADER_LEN + len;
    }
    scan
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut, BytesMut};

    use crate::unit::{decode_frames, encode_frame, UnitName};

    #[test]
    pub fn unit_name_test() {
        assert_eq!(
            UnitName::parse("3.13"),
            Some(UnitName::Closed {
                partition: 3,
                highest_offset: 13
            })
        );
        assert_eq!(
            UnitName::parse("0.inprogress"),
            Some(UnitName::InProgress { partition: 0 })
        );
        assert_eq!(UnitName::parse("readme"), None);
        assert_eq!(UnitName::parse("x.1"), None);
        assert_eq!(UnitName::parse("1.tmp"), None);
        assert_eq!(UnitName::parse("7.8").unwrap().file_name(), "7.8");
    }

    #[test]
    pub fn torn_tail_test() {
        let mut buffer = BytesMut::new();
        encode_frame(&mut buffer, 4, b"abc");
        encode_frame(&mut buffer, 5, b"");
        let complete = buffer.len();
        encode_frame(&mut buffer, 6, b"0123456789");
        buffer.truncate(buffer.len() - 3);
        buffer.put_u8(0xff);

        let scan = decode_frames(buffer.freeze());
        assert_eq!(scan.valid_len, complete);
        assert_eq!(scan.frames.len(), 2);
        assert_eq!(scan.frames[0].payload.as_ref(), b"abc");
        assert_eq!(scan.highest_offset(), Some(5));
    }
}
