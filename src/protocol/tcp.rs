//! TCP header (20-60 bytes depending on data offset).
//!
//!   0                   1                   2                   3
//!   0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |          Source Port          |       Destination Port        |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |                        Sequence Number                        |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |                    Acknowledgment Number                      |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |  Data |           |U|A|P|R|S|F|                               |
//!  | Offset| Reserved  |R|C|S|S|Y|I|            Window             |
//!  |       |           |G|K|H|T|N|N|                               |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+

use super::ParseError;

/// Minimum TCP header length (data offset = 5, no options).
pub const TCP_MIN_HEADER_LEN: usize = 20;

/// Borrowed view over a TCP header.
#[derive(Debug)]
pub struct TcpHeader<'a> {
    data: &'a [u8],
    header_len: usize,
}

impl<'a> TcpHeader<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        if data.len() < TCP_MIN_HEADER_LEN {
            return Err(ParseError::TooShort {
                expected: TCP_MIN_HEADER_LEN,
                actual: data.len(),
            });
        }

        let data_offset = ((data[12] >> 4) & 0x0F) as usize;
        let header_len = data_offset * 4;
        if header_len < TCP_MIN_HEADER_LEN {
            return Err(ParseError::InvalidHeader(format!(
                "TCP data offset below minimum: {}",
                data_offset
            )));
        }
        if data.len() < header_len {
            return Err(ParseError::TooShort {
                expected: header_len,
                actual: data.len(),
            });
        }

        Ok(TcpHeader { data, header_len })
    }

    #[inline]
    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.data[0], self.data[1]])
    }

    #[inline]
    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    #[inline]
    pub fn sequence_number(&self) -> u32 {
        u32::from_be_bytes([self.data[4], self.data[5], self.data[6], self.data[7]])
    }

    #[inline]
    pub fn ack_number(&self) -> u32 {
        u32::from_be_bytes([self.data[8], self.data[9], self.data[10], self.data[11]])
    }

    /// Header length in bytes (data offset * 4); the payload starts here.
    #[inline]
    pub fn header_len(&self) -> usize {
        self.header_len
    }

    #[inline]
    pub fn window_size(&self) -> u16 {
        u16::from_be_bytes([self.data[14], self.data[15]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_syn() -> Vec<u8> {
        let mut pkt = vec![0u8; 20];
        pkt[0..2].copy_from_slice(&55000u16.to_be_bytes());
        pkt[2..4].copy_from_slice(&80u16.to_be_bytes());
        pkt[4..8].copy_from_slice(&1000u32.to_be_bytes());
        pkt[12] = 0x50; // data offset 5
        pkt[13] = 0x02; // SYN
        pkt[14..16].copy_from_slice(&65535u16.to_be_bytes());
        pkt
    }

    #[test]
    fn parse_syn() {
        let pkt = make_syn();
        let hdr = TcpHeader::parse(&pkt).unwrap();
        assert_eq!(hdr.src_port(), 55000);
        assert_eq!(hdr.dst_port(), 80);
        assert_eq!(hdr.sequence_number(), 1000);
        assert_eq!(hdr.ack_number(), 0);
        assert_eq!(hdr.window_size(), 65535);
        assert_eq!(hdr.header_len(), 20);
    }

    #[test]
    fn header_len_honours_data_offset() {
        let mut pkt = make_syn();
        pkt[12] = 0x80; // data offset 8 => 32 bytes
        pkt.extend_from_slice(&[0u8; 12]);
        let hdr = TcpHeader::parse(&pkt).unwrap();
        assert_eq!(hdr.header_len(), 32);
    }

    #[test]
    fn reject_short_header() {
        assert!(TcpHeader::parse(&[0u8; 19]).is_err());
    }

    #[test]
    fn reject_bad_data_offset() {
        let mut pkt = make_syn();
        pkt[12] = 0x20; // data offset 2
        assert!(TcpHeader::parse(&pkt).is_err());
    }

    #[test]
    fn reject_truncated_options() {
        let mut pkt = make_syn();
        pkt[12] = 0x80; // claims 32 bytes, only 20 captured
        assert!(TcpHeader::parse(&pkt).is_err());
    }
}
