//! Streaming Ogg demultiplexer for the transcoder's stdout.
//!
//! ffmpeg is asked for `-f opus`, i.e. Opus in an Ogg container. Ogg pages
//! are self-delimiting, and each Opus packet is exactly one frame, so one
//! call to [`OggPacketReader::next_packet`] yields one complete payload.
//!
//! Pages are parsed by hand without seeking:
//! 1. optionally skip bytes until the first `OggS` capture pattern
//! 2. read the 27-byte page header
//! 3. read the segment (lacing) table and the page body
//! 4. optionally check the page CRC32
//! 5. split the body into packets, carrying a packet that continues onto
//!    the next page

use bytes::Bytes;
use std::collections::VecDeque;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tracing::{trace, warn};

use crate::error::{PlaybackError, Result};

const CAPTURE_PATTERN: &[u8; 4] = b"OggS";
const HEADER_LEN: usize = 27;
const FLAG_CONTINUED: u8 = 0x01;
const FLAG_END_OF_STREAM: u8 = 0x04;

/// Bytes scanned for the first capture pattern before giving up.
const MAX_SYNC_SEARCH: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct OggReaderOptions {
    /// Reject pages whose CRC32 does not match their contents.
    pub validate_crc: bool,
    /// Skip leading bytes until the first `OggS`. Only applies before the
    /// first page; a lost capture pattern later on is an error.
    pub find_sync: bool,
    /// Upper bound for the leading skip when `find_sync` is on.
    pub max_sync_search: usize,
}

impl Default for OggReaderOptions {
    fn default() -> Self {
        Self {
            validate_crc: true,
            find_sync: true,
            max_sync_search: MAX_SYNC_SEARCH,
        }
    }
}

pub struct OggPacketReader<R> {
    reader: BufReader<R>,
    options: OggReaderOptions,
    pending: VecDeque<Bytes>,
    partial: Vec<u8>,
    serial: Option<u32>,
    finished: bool,
    pages: u64,
}

impl<R: AsyncRead + Unpin> OggPacketReader<R> {
    pub fn new(reader: R, options: OggReaderOptions) -> Self {
        Self {
            reader: BufReader::new(reader),
            options,
            pending: VecDeque::new(),
            partial: Vec::new(),
            serial: None,
            finished: false,
            pages: 0,
        }
    }

    /// Next complete packet, or `None` once the stream has ended.
    ///
    /// A closed or broken pipe on a page boundary is a clean end of stream.
    pub async fn next_packet(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(packet) = self.pending.pop_front() {
                return Ok(Some(packet));
            }
            if self.finished {
                return Ok(None);
            }
            self.read_page().await?;
        }
    }

    pub fn pages_read(&self) -> u64 {
        self.pages
    }

    async fn read_page(&mut self) -> Result<()> {
        let mut header = [0u8; HEADER_LEN];

        let filled = if self.pages == 0 && self.options.find_sync {
            if !self.find_sync().await? {
                self.finish();
                return Ok(());
            }
            header[..4].copy_from_slice(CAPTURE_PATTERN);
            4
        } else {
            if !self.read_first(&mut header[..1]).await? {
                self.finish();
                return Ok(());
            }
            1
        };

        self.read_exact(&mut header[filled..], "page header").await?;

        if &header[0..4] != CAPTURE_PATTERN {
            return Err(PlaybackError::Stream("lost Ogg capture pattern".into()));
        }
        if header[4] != 0 {
            return Err(PlaybackError::Stream(format!(
                "unsupported Ogg version {}",
                header[4]
            )));
        }

        let flags = header[5];
        let serial = u32::from_le_bytes([header[14], header[15], header[16], header[17]]);
        match self.serial {
            Some(expected) if expected != serial => {
                return Err(PlaybackError::Stream(format!(
                    "unexpected second logical bitstream {serial:#x}"
                )));
            }
            None => self.serial = Some(serial),
            _ => {}
        }

        let mut lacing = vec![0u8; header[26] as usize];
        self.read_exact(&mut lacing, "segment table").await?;

        let body_len: usize = lacing.iter().map(|&l| l as usize).sum();
        let mut body = vec![0u8; body_len];
        self.read_exact(&mut body, "page body").await?;

        if self.options.validate_crc {
            let expected = u32::from_le_bytes([header[22], header[23], header[24], header[25]]);
            let actual = page_crc(&header, &lacing, &body);
            if actual != expected {
                return Err(PlaybackError::Stream(format!(
                    "Ogg page CRC mismatch: expected {expected:#010x}, got {actual:#010x}"
                )));
            }
        }

        if flags & FLAG_CONTINUED == 0 && !self.partial.is_empty() {
            warn!("🧩 Paquete Ogg incompleto descartado ({} bytes)", self.partial.len());
            self.partial.clear();
        }

        let mut offset = 0;
        for &lace in &lacing {
            let end = offset + lace as usize;
            self.partial.extend_from_slice(&body[offset..end]);
            offset = end;
            if lace < 255 {
                let packet = std::mem::take(&mut self.partial);
                self.pending.push_back(Bytes::from(packet));
            }
        }

        self.pages += 1;
        trace!(
            "Ogg page {} -> {} packets pending",
            self.pages,
            self.pending.len()
        );

        if flags & FLAG_END_OF_STREAM != 0 {
            self.finish();
        }

        Ok(())
    }

    /// Consumes bytes up to and including the first capture pattern.
    ///
    /// `false` when the stream closes before any byte arrives.
    async fn find_sync(&mut self) -> Result<bool> {
        let mut window = [0u8; 4];
        if !self.read_first(&mut window[..1]).await? {
            return Ok(false);
        }
        self.read_exact(&mut window[1..], "stream start").await?;

        let mut skipped = 0usize;
        while &window != CAPTURE_PATTERN {
            if skipped >= self.options.max_sync_search {
                return Err(PlaybackError::Stream(format!(
                    "no Ogg capture pattern in the first {skipped} bytes"
                )));
            }
            let byte = self.reader.read_u8().await.map_err(|e| {
                PlaybackError::Stream(format!("no Ogg capture pattern before end of stream: {e}"))
            })?;
            window.rotate_left(1);
            window[3] = byte;
            skipped += 1;
        }

        if skipped > 0 {
            warn!("🔎 {} bytes descartados antes de la primera página Ogg", skipped);
        }
        Ok(true)
    }

    /// Reads the first byte of a page. `false` on a clean end of stream.
    async fn read_first(&mut self, buf: &mut [u8]) -> Result<bool> {
        match self.reader.read(buf).await {
            Ok(0) => Ok(false),
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(false),
            Err(e) => Err(PlaybackError::Stream(format!("stdout read failed: {e}"))),
        }
    }

    async fn read_exact(&mut self, buf: &mut [u8], what: &str) -> Result<()> {
        self.reader
            .read_exact(buf)
            .await
            .map(|_| ())
            .map_err(|e| PlaybackError::Stream(format!("truncated Ogg {what}: {e}")))
    }

    fn finish(&mut self) {
        self.finished = true;
        self.partial.clear();
    }
}

/// CRC32 of a page as stored in its header, computed with the CRC field zeroed.
fn page_crc(header: &[u8; HEADER_LEN], lacing: &[u8], body: &[u8]) -> u32 {
    let mut zeroed = *header;
    zeroed[22..26].fill(0);
    let crc = crc::update(0, &zeroed);
    let crc = crc::update(crc, lacing);
    crc::update(crc, body)
}

/// Ogg's CRC32: polynomial 0x04c11db7, zero initial value, no final xor.
mod crc {
    const POLYNOMIAL: u32 = 0x04c1_1db7;

    const fn entry(index: u32) -> u32 {
        let mut r = index << 24;
        let mut bit = 0;
        while bit < 8 {
            r = if r & 0x8000_0000 != 0 {
                (r << 1) ^ POLYNOMIAL
            } else {
                r << 1
            };
            bit += 1;
        }
        r
    }

    const fn table() -> [u32; 256] {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            table[i] = entry(i as u32);
            i += 1;
        }
        table
    }

    static TABLE: [u32; 256] = table();

    pub(super) fn update(crc: u32, bytes: &[u8]) -> u32 {
        bytes.iter().fold(crc, |crc, &b| {
            (crc << 8) ^ TABLE[((crc >> 24) ^ b as u32) as usize]
        })
    }
}

/// Builds one Ogg page carrying `packets`. Only used to feed the demuxer in tests.
#[cfg(test)]
pub(crate) fn encode_page(serial: u32, sequence: u32, flags: u8, packets: &[&[u8]]) -> Vec<u8> {
    let mut lacing = Vec::new();
    let mut body = Vec::new();
    for packet in packets {
        let mut remaining = packet.len();
        while remaining >= 255 {
            lacing.push(255u8);
            remaining -= 255;
        }
        lacing.push(remaining as u8);
        body.extend_from_slice(packet);
    }

    let mut page = Vec::with_capacity(HEADER_LEN + lacing.len() + body.len());
    page.extend_from_slice(CAPTURE_PATTERN);
    page.push(0);
    page.push(flags);
    page.extend_from_slice(&0u64.to_le_bytes());
    page.extend_from_slice(&serial.to_le_bytes());
    page.extend_from_slice(&sequence.to_le_bytes());
    page.extend_from_slice(&0u32.to_le_bytes());
    page.push(lacing.len() as u8);
    page.extend_from_slice(&lacing);
    page.extend_from_slice(&body);
    seal_page(&mut page);
    page
}

/// Rewrites the CRC field of a hand-built or hand-edited page.
#[cfg(test)]
pub(crate) fn seal_page(page: &mut [u8]) {
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&page[..HEADER_LEN]);
    let segments = header[26] as usize;
    let (lacing, body) = page[HEADER_LEN..].split_at(segments);
    let crc = page_crc(&header, lacing, body);
    page[22..26].copy_from_slice(&crc.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn collect(bytes: Vec<u8>) -> Result<Vec<Bytes>> {
        collect_with(bytes, OggReaderOptions::default()).await
    }

    async fn collect_with(bytes: Vec<u8>, options: OggReaderOptions) -> Result<Vec<Bytes>> {
        let mut reader = OggPacketReader::new(std::io::Cursor::new(bytes), options);
        let mut out = Vec::new();
        while let Some(packet) = reader.next_packet().await? {
            out.push(packet);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn test_one_packet_per_read() {
        let mut stream = encode_page(7, 0, 0x02, &[b"OpusHead"]);
        stream.extend(encode_page(7, 1, 0, &[b"OpusTags"]));
        stream.extend(encode_page(7, 2, 0, &[b"aaa", b"bb", b"c"]));

        let packets = collect(stream).await.unwrap();
        assert_eq!(
            packets,
            vec![
                Bytes::from_static(b"OpusHead"),
                Bytes::from_static(b"OpusTags"),
                Bytes::from_static(b"aaa"),
                Bytes::from_static(b"bb"),
                Bytes::from_static(b"c"),
            ]
        );
    }

    #[tokio::test]
    async fn test_packet_spanning_pages() {
        let big = vec![0xAB; 600];
        // primera página: 255 + 255 sin terminar; segunda: resto
        let mut stream = Vec::new();
        let mut first = encode_page(1, 0, 0, &[&big[..510]]);
        // quitar el lacing final "0" para que el paquete continúe
        let segments = first[26] as usize;
        first[26] = (segments - 1) as u8;
        first.remove(HEADER_LEN + segments - 1);
        seal_page(&mut first);
        stream.extend(first);
        stream.extend(encode_page(1, 1, FLAG_CONTINUED, &[&big[510..]]));

        let packets = collect(stream).await.unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), 600);
    }

    #[tokio::test]
    async fn test_clean_eof_and_eos_flag() {
        assert!(collect(Vec::new()).await.unwrap().is_empty());

        let mut stream = encode_page(3, 0, FLAG_END_OF_STREAM, &[b"last"]);
        stream.extend(b"trailing garbage");
        let packets = collect(stream).await.unwrap();
        assert_eq!(packets, vec![Bytes::from_static(b"last")]);
    }

    #[tokio::test]
    async fn test_garbage_and_truncation_are_stream_errors() {
        let err = collect(b"NotAnOggPageAtAllxxxxxxxxxxxxxxx".to_vec()).await.unwrap_err();
        assert!(matches!(err, PlaybackError::Stream(_)));

        let mut truncated = encode_page(3, 0, 0, &[b"abcdef"]);
        truncated.truncate(truncated.len() - 2);
        let err = collect(truncated).await.unwrap_err();
        assert!(matches!(err, PlaybackError::Stream(_)));
    }

    #[tokio::test]
    async fn test_rejects_second_bitstream() {
        let mut stream = encode_page(1, 0, 0, &[b"one"]);
        stream.extend(encode_page(2, 0, 0, &[b"two"]));
        let mut reader = OggPacketReader::new(std::io::Cursor::new(stream), OggReaderOptions::default());
        assert_eq!(reader.next_packet().await.unwrap(), Some(Bytes::from_static(b"one")));
        assert!(reader.next_packet().await.is_err());
    }

    #[test]
    fn test_crc_matches_reference_value() {
        // CRC32 de "123456789" con el polinomio de Ogg (sin reflejar, init 0)
        assert_eq!(crc::update(0, b"123456789"), 0x89a1_897f);
    }

    #[tokio::test]
    async fn test_crc_mismatch_is_stream_error() {
        let mut page = encode_page(5, 0, 0, &[b"payload"]);
        let last = page.len() - 1;
        page[last] ^= 0xFF;

        let err = collect(page.clone()).await.unwrap_err();
        assert!(matches!(err, PlaybackError::Stream(ref msg) if msg.contains("CRC")));

        let unchecked = OggReaderOptions {
            validate_crc: false,
            ..Default::default()
        };
        let packets = collect_with(page, unchecked).await.unwrap();
        assert_eq!(packets.len(), 1);
    }

    #[tokio::test]
    async fn test_leading_garbage_is_skipped() {
        let mut stream = b"ffmpeg banner".to_vec();
        stream.extend(encode_page(4, 0, 0, &[b"OpusHead"]));
        stream.extend(encode_page(4, 1, 0, &[b"frame"]));

        let packets = collect(stream.clone()).await.unwrap();
        assert_eq!(
            packets,
            vec![Bytes::from_static(b"OpusHead"), Bytes::from_static(b"frame")]
        );

        let strict = OggReaderOptions {
            find_sync: false,
            ..Default::default()
        };
        assert!(collect_with(stream, strict).await.is_err());
    }

    #[tokio::test]
    async fn test_sync_search_is_bounded() {
        let mut stream = vec![0u8; 64];
        stream.extend(encode_page(4, 0, 0, &[b"OpusHead"]));
        let options = OggReaderOptions {
            max_sync_search: 16,
            ..Default::default()
        };

        let err = collect_with(stream, options).await.unwrap_err();
        assert!(matches!(err, PlaybackError::Stream(ref msg) if msg.contains("first 16 bytes")));
    }
}
