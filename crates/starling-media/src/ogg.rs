//! Ogg/Opus muxing for segment files.
//!
//! Packets accumulate into the current page and pages are flushed on segment
//! pressure, on explicit flush, and with EOS set on close, so a file is
//! playable by standard Opus tools up to the last flushed granule even while
//! it is still being appended to.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const PAGE_MAGIC: &[u8; 4] = b"OggS";
/// Fixed page header length before the lacing table.
pub const PAGE_HEADER_LEN: usize = 27;

const MAX_PAGE_SEGMENTS: usize = 255;
const FLAG_BOS: u8 = 0x02;
const FLAG_EOS: u8 = 0x04;
const VENDOR: &str = "starling";
/// Samples charged for a packet whose TOC cannot be parsed.
const FALLBACK_PACKET_SAMPLES: u64 = 960;

#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("opus packet of {0} bytes does not fit a single ogg page")]
    PacketTooLarge(usize),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Streaming Ogg/Opus writer. One instance per segment file; the serial is
/// random per stream, sequence numbers start at 0 and the granule counts
/// 48kHz samples across all written packets.
pub struct OggOpusWriter<W: Write> {
    out: W,
    serial: u32,
    sequence: u32,
    granule: u64,
    payload: Vec<u8>,
    lacing: Vec<u8>,
    bytes_written: u64,
}

impl<W: Write> OggOpusWriter<W> {
    /// Create the writer and emit the `OpusHead` + `OpusTags` header pages.
    pub fn new(out: W, channels: u8) -> Result<Self, MuxError> {
        let mut writer = Self {
            out,
            serial: rand::random::<u32>(),
            sequence: 0,
            granule: 0,
            payload: Vec::new(),
            lacing: Vec::new(),
            bytes_written: 0,
        };
        writer.push_lacing(&opus_head(channels))?;
        writer.flush_page(FLAG_BOS)?;
        writer.push_lacing(&opus_tags())?;
        writer.flush_page(0)?;
        Ok(writer)
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Total 48kHz samples written so far.
    pub fn granule(&self) -> u64 {
        self.granule
    }

    pub fn duration_ms(&self) -> u64 {
        self.granule / 48
    }

    /// Bytes pushed to the underlying stream (flushed pages only).
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Append one Opus packet to the current page, flushing first if its
    /// lacing would overflow the 255-segment table.
    pub fn write_packet(&mut self, packet: &[u8]) -> Result<(), MuxError> {
        self.push_lacing(packet)?;
        self.granule += packet_samples(packet, FALLBACK_PACKET_SAMPLES);
        if self.lacing.len() == MAX_PAGE_SEGMENTS {
            self.flush_page(0)?;
        }
        Ok(())
    }

    /// Finalize the current page and push it out, then flush the stream.
    pub fn flush(&mut self) -> Result<(), MuxError> {
        self.flush_page(0)?;
        self.out.flush()?;
        Ok(())
    }

    /// Write the final page with EOS set and hand back the output stream.
    pub fn finalize(mut self) -> Result<W, MuxError> {
        self.flush_page(FLAG_EOS)?;
        self.out.flush()?;
        Ok(self.out)
    }

    fn push_lacing(&mut self, packet: &[u8]) -> Result<(), MuxError> {
        // A length that is an exact multiple of 255 ends with a 0 terminator,
        // so the entry count is always len/255 + 1.
        let entries = packet.len() / 255 + 1;
        if entries > MAX_PAGE_SEGMENTS {
            return Err(MuxError::PacketTooLarge(packet.len()));
        }
        if self.lacing.len() + entries > MAX_PAGE_SEGMENTS {
            self.flush_page(0)?;
        }
        for _ in 0..packet.len() / 255 {
            self.lacing.push(255);
        }
        self.lacing.push((packet.len() % 255) as u8);
        self.payload.extend_from_slice(packet);
        Ok(())
    }

    fn flush_page(&mut self, flags: u8) -> Result<(), MuxError> {
        if self.lacing.is_empty() && flags == 0 {
            return Ok(());
        }
        let mut page =
            Vec::with_capacity(PAGE_HEADER_LEN + self.lacing.len() + self.payload.len());
        page.extend_from_slice(PAGE_MAGIC);
        page.push(0); // stream structure version
        page.push(flags);
        page.extend_from_slice(&self.granule.to_le_bytes());
        page.extend_from_slice(&self.serial.to_le_bytes());
        page.extend_from_slice(&self.sequence.to_le_bytes());
        page.extend_from_slice(&0u32.to_le_bytes()); // checksum placeholder
        page.push(self.lacing.len() as u8);
        page.extend_from_slice(&self.lacing);
        page.extend_from_slice(&self.payload);

        let checksum = ogg_crc32(&page);
        page[22..26].copy_from_slice(&checksum.to_le_bytes());

        self.out.write_all(&page)?;
        self.bytes_written += page.len() as u64;
        self.sequence = self.sequence.wrapping_add(1);
        self.payload.clear();
        self.lacing.clear();
        Ok(())
    }
}

fn opus_head(channels: u8) -> Vec<u8> {
    let mut head = Vec::with_capacity(19);
    head.extend_from_slice(b"OpusHead");
    head.push(1); // version
    head.push(channels);
    head.extend_from_slice(&0u16.to_le_bytes()); // pre-skip
    head.extend_from_slice(&48_000u32.to_le_bytes()); // input sample rate
    head.extend_from_slice(&0u16.to_le_bytes()); // output gain
    head.push(0); // channel mapping family
    head
}

fn opus_tags() -> Vec<u8> {
    let vendor = VENDOR.as_bytes();
    let mut tags = Vec::with_capacity(8 + 4 + vendor.len() + 4);
    tags.extend_from_slice(b"OpusTags");
    tags.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
    tags.extend_from_slice(vendor);
    tags.extend_from_slice(&0u32.to_le_bytes()); // user comment count
    tags
}

/// 48kHz samples contained in one Opus packet, derived from its TOC byte.
pub fn packet_samples(packet: &[u8], fallback: u64) -> u64 {
    let Some(&toc) = packet.first() else {
        return fallback;
    };
    let config = toc >> 3;
    let code = toc & 0x03;
    let frames: u64 = match code {
        0 => 1,
        1 | 2 => 2,
        _ => {
            if packet.len() < 2 {
                return fallback;
            }
            (packet[1] & 0x3f) as u64
        }
    };
    frames * frame_samples(config)
}

fn frame_samples(config: u8) -> u64 {
    if config < 12 {
        // SILK: 10/20/40/60ms
        [480, 960, 1920, 2880][(config % 4) as usize]
    } else if config < 16 {
        // Hybrid: 10/20ms
        if config % 2 == 0 {
            480
        } else {
            960
        }
    } else {
        // CELT: 2.5/5/10/20ms
        [120, 240, 480, 960][((config - 16) % 4) as usize]
    }
}

/// Ogg CRC-32: polynomial 0x04C11DB7, no reflection, zero init, computed
/// over the page with the checksum field zeroed.
pub fn ogg_crc32(data: &[u8]) -> u32 {
    const POLY: u32 = 0x04C1_1DB7;
    let mut crc: u32 = 0;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            if crc & 0x8000_0000 != 0 {
                crc = (crc << 1) ^ POLY;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Raw bytes of the first two pages (`OpusHead` + `OpusTags`) found in the
/// head of a segment file. Used by the live-follow stream to prime a
/// late-joining client.
pub fn header_pages_in(head: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    for _ in 0..2 {
        let start = pos + find_magic(&head[pos..])?;
        if head.len() < start + PAGE_HEADER_LEN {
            return None;
        }
        let nsegs = head[start + 26] as usize;
        let lacing_end = start + PAGE_HEADER_LEN + nsegs;
        if head.len() < lacing_end {
            return None;
        }
        let body_len: usize = head[start + PAGE_HEADER_LEN..lacing_end]
            .iter()
            .map(|&b| b as usize)
            .sum();
        let end = lacing_end + body_len;
        if head.len() < end {
            return None;
        }
        out.extend_from_slice(&head[start..end]);
        pos = end;
    }
    Some(out)
}

/// [`header_pages_in`] over the first 16KiB of a file.
pub fn read_header_pages(path: &Path) -> io::Result<Vec<u8>> {
    let mut head = Vec::new();
    File::open(path)?.take(16 * 1024).read_to_end(&mut head)?;
    header_pages_in(&head).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "ogg header pages not found")
    })
}

/// Granule of the last page found in the final 8KiB of the file. This is how
/// crash recovery reconstructs the duration of an orphaned open segment.
pub fn last_granule(path: &Path) -> io::Result<Option<u64>> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let tail = len.min(8 * 1024);
    file.seek(SeekFrom::End(-(tail as i64)))?;
    let mut buf = Vec::with_capacity(tail as usize);
    file.read_to_end(&mut buf)?;

    if buf.len() < PAGE_HEADER_LEN {
        return Ok(None);
    }
    for start in (0..=buf.len() - PAGE_HEADER_LEN).rev() {
        if &buf[start..start + 4] == PAGE_MAGIC {
            let mut granule = [0u8; 8];
            granule.copy_from_slice(&buf[start + 6..start + 14]);
            return Ok(Some(u64::from_le_bytes(granule)));
        }
    }
    Ok(None)
}

fn find_magic(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == PAGE_MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Page {
        flags: u8,
        granule: u64,
        serial: u32,
        sequence: u32,
        crc: u32,
        lacing: Vec<u8>,
        body: Vec<u8>,
        raw: Vec<u8>,
    }

    fn parse_pages(mut buf: &[u8]) -> Vec<Page> {
        let mut pages = Vec::new();
        while buf.len() >= PAGE_HEADER_LEN {
            assert_eq!(&buf[..4], PAGE_MAGIC);
            let nsegs = buf[26] as usize;
            let lacing = buf[27..27 + nsegs].to_vec();
            let body_len: usize = lacing.iter().map(|&b| b as usize).sum();
            let total = PAGE_HEADER_LEN + nsegs + body_len;
            pages.push(Page {
                flags: buf[5],
                granule: u64::from_le_bytes(buf[6..14].try_into().unwrap()),
                serial: u32::from_le_bytes(buf[14..18].try_into().unwrap()),
                sequence: u32::from_le_bytes(buf[18..22].try_into().unwrap()),
                crc: u32::from_le_bytes(buf[22..26].try_into().unwrap()),
                lacing,
                body: buf[27 + nsegs..total].to_vec(),
                raw: buf[..total].to_vec(),
            });
            buf = &buf[total..];
        }
        assert!(buf.is_empty(), "trailing bytes after last page");
        pages
    }

    /// A fake CELT 20ms packet (config 19, code 0): 960 samples.
    fn packet_960(len: usize) -> Vec<u8> {
        let mut p = vec![0u8; len.max(1)];
        p[0] = 19 << 3;
        p
    }

    #[test]
    fn header_pages_come_first_with_bos() {
        let mut out = Vec::new();
        {
            let w = OggOpusWriter::new(&mut out, 2).unwrap();
            w.finalize().unwrap();
        }
        let pages = parse_pages(&out);
        assert!(pages.len() >= 3);
        assert_eq!(pages[0].flags & FLAG_BOS, FLAG_BOS);
        assert!(pages[0].body.starts_with(b"OpusHead"));
        assert_eq!(pages[0].body.len(), 19);
        assert!(pages[1].body.starts_with(b"OpusTags"));
        assert_eq!(pages.last().unwrap().flags & FLAG_EOS, FLAG_EOS);
    }

    #[test]
    fn sequences_are_gapless_and_serial_constant() {
        let mut out = Vec::new();
        {
            let mut w = OggOpusWriter::new(&mut out, 2).unwrap();
            for _ in 0..600 {
                w.write_packet(&packet_960(100)).unwrap();
            }
            w.finalize().unwrap();
        }
        let pages = parse_pages(&out);
        let serial = pages[0].serial;
        for (i, page) in pages.iter().enumerate() {
            assert_eq!(page.serial, serial);
            assert_eq!(page.sequence, i as u32);
        }
    }

    #[test]
    fn every_page_crc_verifies() {
        let mut out = Vec::new();
        {
            let mut w = OggOpusWriter::new(&mut out, 2).unwrap();
            for i in 0..50 {
                w.write_packet(&packet_960(40 + i)).unwrap();
            }
            w.finalize().unwrap();
        }
        for page in parse_pages(&out) {
            let mut zeroed = page.raw.clone();
            zeroed[22..26].fill(0);
            assert_eq!(ogg_crc32(&zeroed), page.crc);
        }
    }

    #[test]
    fn granule_accumulates_packet_samples() {
        let mut out = Vec::new();
        let mut w = OggOpusWriter::new(&mut out, 2).unwrap();
        for _ in 0..50 {
            w.write_packet(&packet_960(60)).unwrap();
        }
        assert_eq!(w.granule(), 50 * 960);
        assert_eq!(w.duration_ms(), 1000);
    }

    #[test]
    fn flushed_page_carries_cumulative_granule() {
        let mut out = Vec::new();
        {
            let mut w = OggOpusWriter::new(&mut out, 2).unwrap();
            w.write_packet(&packet_960(60)).unwrap();
            w.write_packet(&packet_960(60)).unwrap();
            w.flush().unwrap();
            w.finalize().unwrap();
        }
        let pages = parse_pages(&out);
        // page 0 = head, 1 = tags, 2 = the flushed audio page.
        assert_eq!(pages[2].granule, 1920);
    }

    #[test]
    fn exact_255_byte_packet_gets_trailing_zero_segment() {
        let mut out = Vec::new();
        {
            let mut w = OggOpusWriter::new(&mut out, 2).unwrap();
            w.write_packet(&packet_960(255)).unwrap();
            w.finalize().unwrap();
        }
        let pages = parse_pages(&out);
        assert_eq!(pages[2].lacing, vec![255, 0]);
        assert_eq!(pages[2].body.len(), 255);
    }

    #[test]
    fn page_flushes_before_lacing_overflow() {
        let mut out = Vec::new();
        {
            let mut w = OggOpusWriter::new(&mut out, 2).unwrap();
            // 254 one-segment packets, then one 300-byte packet (2 entries)
            // which must land on a fresh page.
            for _ in 0..254 {
                w.write_packet(&packet_960(10)).unwrap();
            }
            w.write_packet(&packet_960(300)).unwrap();
            w.finalize().unwrap();
        }
        let pages = parse_pages(&out);
        assert_eq!(pages[2].lacing.len(), 254);
        assert_eq!(pages[3].lacing, vec![255, 45]);
    }

    #[test]
    fn oversized_packet_is_rejected() {
        let mut w = OggOpusWriter::new(Vec::new(), 2).unwrap();
        let huge = packet_960(255 * 255);
        assert!(matches!(
            w.write_packet(&huge),
            Err(MuxError::PacketTooLarge(_))
        ));
    }

    #[test]
    fn packet_samples_follows_the_toc_table() {
        // SILK, config 0..3, code 0.
        assert_eq!(packet_samples(&[0 << 3], 960), 480);
        assert_eq!(packet_samples(&[1 << 3], 960), 960);
        assert_eq!(packet_samples(&[2 << 3], 960), 1920);
        assert_eq!(packet_samples(&[3 << 3], 960), 2880);
        // Hybrid even/odd.
        assert_eq!(packet_samples(&[12 << 3], 960), 480);
        assert_eq!(packet_samples(&[13 << 3], 960), 960);
        // CELT.
        assert_eq!(packet_samples(&[16 << 3], 960), 120);
        assert_eq!(packet_samples(&[19 << 3], 960), 960);
        // Code 1 and 2 carry two frames.
        assert_eq!(packet_samples(&[(19 << 3) | 1], 960), 1920);
        assert_eq!(packet_samples(&[(19 << 3) | 2], 960), 1920);
        // Code 3 reads the frame count from the second byte.
        assert_eq!(packet_samples(&[(19 << 3) | 3, 0x03], 960), 3 * 960);
        // Truncated code-3 packet falls back to the configured size.
        assert_eq!(packet_samples(&[(19 << 3) | 3], 960), 960);
        assert_eq!(packet_samples(&[], 960), 960);
    }

    #[test]
    fn header_pages_roundtrip_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.opus");
        {
            let file = std::fs::File::create(&path).unwrap();
            let mut w = OggOpusWriter::new(file, 2).unwrap();
            for _ in 0..10 {
                w.write_packet(&packet_960(80)).unwrap();
            }
            w.finalize().unwrap();
        }
        let header = read_header_pages(&path).unwrap();
        let pages = parse_pages(&header);
        assert_eq!(pages.len(), 2);
        assert!(pages[0].body.starts_with(b"OpusHead"));
        assert!(pages[1].body.starts_with(b"OpusTags"));
    }

    #[test]
    fn last_granule_reads_the_final_page() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.opus");
        {
            let file = std::fs::File::create(&path).unwrap();
            let mut w = OggOpusWriter::new(file, 2).unwrap();
            for _ in 0..2000 {
                w.write_packet(&packet_960(50)).unwrap();
            }
            w.finalize().unwrap();
        }
        assert_eq!(last_granule(&path).unwrap(), Some(2000 * 960));
    }

    #[test]
    fn last_granule_on_empty_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.opus");
        std::fs::write(&path, b"").unwrap();
        assert_eq!(last_granule(&path).unwrap(), None);
    }
}
