//! PCAP capture-file encoding
//!
//! Classic libpcap layout with the IEEE 802.11 link type. Every integer is
//! written least-significant byte first regardless of host endianness.

use bytes::{BufMut, BytesMut};
use std::io::Write;

use crate::Result;

/// libpcap magic number as written on disk (`D4 C3 B2 A1`)
pub const PCAP_MAGIC: u32 = 0xA1B2_C3D4;
pub const PCAP_VERSION_MAJOR: u16 = 2;
pub const PCAP_VERSION_MINOR: u16 = 4;
pub const PCAP_SNAPLEN: u32 = 0xFFFF;

/// LINKTYPE_IEEE802_11
pub const LINKTYPE_IEEE802_11: u32 = 105;

pub const GLOBAL_HEADER_LEN: usize = 24;
pub const RECORD_HEADER_LEN: usize = 16;

/// File header written once per capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcapGlobalHeader {
    pub version_major: u16,
    pub version_minor: u16,
    pub thiszone: i32,
    pub sigfigs: u32,
    pub snaplen: u32,
    pub linktype: u32,
}

impl Default for PcapGlobalHeader {
    fn default() -> Self {
        Self {
            version_major: PCAP_VERSION_MAJOR,
            version_minor: PCAP_VERSION_MINOR,
            thiszone: 0,
            sigfigs: 0,
            snaplen: PCAP_SNAPLEN,
            linktype: LINKTYPE_IEEE802_11,
        }
    }
}

impl PcapGlobalHeader {
    pub fn serialize(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(PCAP_MAGIC);
        buf.put_u16_le(self.version_major);
        buf.put_u16_le(self.version_minor);
        buf.put_i32_le(self.thiszone);
        buf.put_u32_le(self.sigfigs);
        buf.put_u32_le(self.snaplen);
        buf.put_u32_le(self.linktype);
    }

    pub fn to_bytes(&self) -> [u8; GLOBAL_HEADER_LEN] {
        let mut out = [0u8; GLOBAL_HEADER_LEN];
        let mut cursor = &mut out[..];
        self.serialize(&mut cursor);
        out
    }
}

/// Per-record header preceding the raw frame bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcapRecordHeader {
    pub ts_sec: u32,
    pub ts_usec: u32,
    pub incl_len: u32,
    pub orig_len: u32,
}

impl PcapRecordHeader {
    /// Header for a frame of `len` bytes captured `timestamp_ms` after boot.
    /// Frames are never truncated, so both length fields are equal.
    pub fn for_frame(timestamp_ms: u32, len: usize) -> Self {
        let len = len as u32;
        Self {
            ts_sec: timestamp_ms / 1000,
            ts_usec: (timestamp_ms % 1000) * 1000,
            incl_len: len,
            orig_len: len,
        }
    }

    pub fn serialize(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.ts_sec);
        buf.put_u32_le(self.ts_usec);
        buf.put_u32_le(self.incl_len);
        buf.put_u32_le(self.orig_len);
    }

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < RECORD_HEADER_LEN {
            return None;
        }
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Some(Self {
            ts_sec: word(0),
            ts_usec: word(4),
            incl_len: word(8),
            orig_len: word(12),
        })
    }
}

/// A captured frame waiting to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRecord {
    pub timestamp_ms: u32,
    pub data: Vec<u8>,
}

impl CaptureRecord {
    pub fn new(timestamp_ms: u32, data: &[u8]) -> Self {
        Self {
            timestamp_ms,
            data: data.to_vec(),
        }
    }

    pub fn header(&self) -> PcapRecordHeader {
        PcapRecordHeader::for_frame(self.timestamp_ms, self.data.len())
    }

    /// Record header followed by the raw frame
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(RECORD_HEADER_LEN + self.data.len());
        self.header().serialize(&mut buf);
        buf.put_slice(&self.data);
        buf
    }
}

/// Byte-stream writer for one capture session
pub struct PcapWriter<W: Write> {
    sink: W,
    records: u64,
    bytes_written: u64,
}

impl<W: Write> PcapWriter<W> {
    /// Wrap `sink` and write the global header
    pub fn new(mut sink: W) -> Result<Self> {
        let header = PcapGlobalHeader::default().to_bytes();
        sink.write_all(&header)?;
        Ok(Self {
            sink,
            records: 0,
            bytes_written: GLOBAL_HEADER_LEN as u64,
        })
    }

    pub fn write_record(&mut self, record: &CaptureRecord) -> Result<()> {
        let encoded = record.encode();
        self.sink.write_all(&encoded)?;
        self.records += 1;
        self.bytes_written += encoded.len() as u64;
        Ok(())
    }

    /// Push buffered bytes through to the sink
    pub fn flush(&mut self) -> Result<()> {
        self.sink.flush()?;
        Ok(())
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn finish(mut self) -> Result<W> {
        self.sink.flush()?;
        Ok(self.sink)
    }
}

impl<W: Write> std::fmt::Debug for PcapWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcapWriter")
            .field("records", &self.records)
            .field("bytes_written", &self.bytes_written)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_header_layout() {
        let header = PcapGlobalHeader::default().to_bytes();
        assert_eq!(&header[0..4], &[0xD4, 0xC3, 0xB2, 0xA1]);
        assert_eq!(&header[4..8], &[0x02, 0x00, 0x04, 0x00]);
        assert_eq!(&header[8..16], &[0u8; 8]);
        assert_eq!(&header[16..20], &[0xFF, 0xFF, 0x00, 0x00]);
        assert_eq!(&header[20..24], &[105, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_record_timestamp_split() {
        let header = PcapRecordHeader::for_frame(12_345, 26);
        assert_eq!(header.ts_sec, 12);
        assert_eq!(header.ts_usec, 345_000);
        assert_eq!(header.incl_len, 26);
        assert_eq!(header.orig_len, 26);
    }

    #[test]
    fn test_writer_output() {
        let mut writer = PcapWriter::new(Vec::new()).unwrap();
        writer.write_record(&CaptureRecord::new(1_500, &[0x80, 0x00, 0x01])).unwrap();
        writer.write_record(&CaptureRecord::new(2_000, &[0xC0; 26])).unwrap();
        assert_eq!(writer.records(), 2);
        let out = writer.finish().unwrap();

        assert_eq!(out.len(), GLOBAL_HEADER_LEN + 2 * RECORD_HEADER_LEN + 3 + 26);
        assert_eq!(&out[0..4], &[0xD4, 0xC3, 0xB2, 0xA1]);

        let first = PcapRecordHeader::parse(&out[GLOBAL_HEADER_LEN..]).unwrap();
        assert_eq!((first.ts_sec, first.ts_usec), (1, 500_000));
        assert_eq!(first.incl_len, first.orig_len);
        let body = GLOBAL_HEADER_LEN + RECORD_HEADER_LEN;
        assert_eq!(&out[body..body + 3], &[0x80, 0x00, 0x01]);

        let second = PcapRecordHeader::parse(&out[body + 3..]).unwrap();
        assert_eq!(second.incl_len, 26);
        assert_eq!(second.incl_len, second.orig_len);
    }
}
