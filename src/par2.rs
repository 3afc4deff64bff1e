//! PAR2 recovery-index parsing for filename recovery
//!
//! Reads fixed-size packet headers (8-byte magic, u64 packet length, MD5
//! packet hash, recovery-set id, packet type) followed by a body sized by
//! the declared length. Only file-description packets are decoded — they
//! carry the authoritative original filename, declared length, and the MD5
//! of the file's first 16 KiB used to match candidates. All other packet
//! types are read to advance the stream and discarded.

use crate::error::{Error, Result};
use crate::streams::ReadStream;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Magic constant opening every PAR2 packet
pub const PACKET_MAGIC: &[u8; 8] = b"PAR2\0PKT";

/// Packet type carrying file descriptions
const FILE_DESCRIPTION_TYPE: &[u8; 16] = b"PAR 2.0\0FileDesc";

/// Size of a packet header on the wire
pub const PACKET_HEADER_SIZE: usize = 64;

/// Minimum body size of a file-description packet (fixed fields)
const FILE_DESCRIPTION_MIN_SIZE: usize = 56;

/// Fixed-size header preceding every packet body
#[derive(Debug, Clone)]
pub struct PacketHeader {
    /// Total packet length including this header
    pub length: u64,
    /// MD5 over the rest of the packet
    pub packet_hash: [u8; 16],
    /// Recovery set this packet belongs to
    pub set_id: [u8; 16],
    /// Packet type tag
    pub packet_type: [u8; 16],
}

/// A decoded file-description packet
#[derive(Debug, Clone)]
pub struct FileDescription {
    /// Unique file id within the recovery set
    pub file_id: [u8; 16],
    /// MD5 of the whole file
    pub file_hash: [u8; 16],
    /// MD5 of the file's first 16 KiB
    pub hash_16k: [u8; 16],
    /// Declared file length in bytes
    pub length: u64,
    /// Original filename
    pub file_name: String,
}

/// Cheap test for PAR2 data: does the buffer open with the packet magic?
pub fn has_par2_magic(bytes: &[u8]) -> bool {
    bytes.len() >= PACKET_MAGIC.len() && &bytes[..PACKET_MAGIC.len()] == PACKET_MAGIC
}

/// Read all file-description packets from a PAR2 stream
///
/// Stops cleanly at end of stream on a packet boundary. A magic mismatch or
/// a truncated packet is a corruption error — the stream is not a valid
/// recovery index past that point.
pub async fn read_file_descriptions<S: ReadStream + ?Sized>(
    stream: &mut S,
    cancel: &CancellationToken,
) -> Result<Vec<FileDescription>> {
    let mut descriptions = Vec::new();

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let Some(header) = read_packet_header(stream).await? else {
            return Ok(descriptions);
        };

        let body_len = header
            .length
            .checked_sub(PACKET_HEADER_SIZE as u64)
            .ok_or_else(|| {
                Error::Corrupt(format!(
                    "PAR2 packet length {} shorter than its header",
                    header.length
                ))
            })?;

        if header.packet_type == *FILE_DESCRIPTION_TYPE {
            let mut body = vec![0u8; body_len as usize];
            read_exact(stream, &mut body).await?;
            descriptions.push(parse_file_description(&body)?);
        } else {
            trace!(
                "Skipping PAR2 packet type {:?} ({} bytes)",
                String::from_utf8_lossy(&header.packet_type),
                body_len
            );
            discard_exact(stream, body_len).await?;
        }
    }
}

/// Read one packet header; `None` at a clean end of stream
async fn read_packet_header<S: ReadStream + ?Sized>(
    stream: &mut S,
) -> Result<Option<PacketHeader>> {
    let mut buf = [0u8; PACKET_HEADER_SIZE];

    // Distinguish end-of-stream from a torn header.
    let first = stream.read(&mut buf).await?;
    if first == 0 {
        return Ok(None);
    }
    let mut filled = first;
    while filled < PACKET_HEADER_SIZE {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(Error::Corrupt("Truncated PAR2 packet header".to_string()));
        }
        filled += n;
    }

    if !has_par2_magic(&buf) {
        return Err(Error::Corrupt("Invalid PAR2 magic constant".to_string()));
    }

    let mut length_bytes = [0u8; 8];
    length_bytes.copy_from_slice(&buf[8..16]);
    let mut packet_hash = [0u8; 16];
    packet_hash.copy_from_slice(&buf[16..32]);
    let mut set_id = [0u8; 16];
    set_id.copy_from_slice(&buf[32..48]);
    let mut packet_type = [0u8; 16];
    packet_type.copy_from_slice(&buf[48..64]);

    Ok(Some(PacketHeader {
        length: u64::from_le_bytes(length_bytes),
        packet_hash,
        set_id,
        packet_type,
    }))
}

/// Decode a file-description packet body
fn parse_file_description(body: &[u8]) -> Result<FileDescription> {
    if body.len() < FILE_DESCRIPTION_MIN_SIZE {
        return Err(Error::Corrupt(format!(
            "PAR2 file-description packet too short: {} bytes",
            body.len()
        )));
    }

    let mut file_id = [0u8; 16];
    file_id.copy_from_slice(&body[0..16]);
    let mut file_hash = [0u8; 16];
    file_hash.copy_from_slice(&body[16..32]);
    let mut hash_16k = [0u8; 16];
    hash_16k.copy_from_slice(&body[32..48]);

    let mut length_bytes = [0u8; 8];
    length_bytes.copy_from_slice(&body[48..56]);
    let length = u64::from_le_bytes(length_bytes);

    let name_bytes = &body[56..];
    let file_name = decode_file_name(name_bytes);

    Ok(FileDescription {
        file_id,
        file_hash,
        hash_16k,
        length,
        file_name,
    })
}

/// Filenames are UTF-8 when well-formed, else legacy Windows-1252; padding
/// NULs are trimmed either way.
fn decode_file_name(bytes: &[u8]) -> String {
    let decoded = match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|&b| cp1252_char(b)).collect(),
    };
    decoded.trim_end_matches('\0').to_string()
}

/// Windows-1252 byte to char; identical to Latin-1 outside 0x80..=0x9F
fn cp1252_char(byte: u8) -> char {
    const HIGH: [char; 32] = [
        '\u{20AC}', '\u{0081}', '\u{201A}', '\u{0192}', '\u{201E}', '\u{2026}', '\u{2020}',
        '\u{2021}', '\u{02C6}', '\u{2030}', '\u{0160}', '\u{2039}', '\u{0152}', '\u{008D}',
        '\u{017D}', '\u{008F}', '\u{0090}', '\u{2018}', '\u{2019}', '\u{201C}', '\u{201D}',
        '\u{2022}', '\u{2013}', '\u{2014}', '\u{02DC}', '\u{2122}', '\u{0161}', '\u{203A}',
        '\u{0153}', '\u{009D}', '\u{017E}', '\u{0178}',
    ];
    match byte {
        0x80..=0x9F => HIGH[(byte - 0x80) as usize],
        _ => byte as char,
    }
}

async fn read_exact<S: ReadStream + ?Sized>(stream: &mut S, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(Error::Corrupt("Truncated PAR2 packet body".to_string()));
        }
        filled += n;
    }
    Ok(())
}

async fn discard_exact<S: ReadStream + ?Sized>(stream: &mut S, count: u64) -> Result<()> {
    let mut scratch = [0u8; 4096];
    let mut remaining = count;
    while remaining > 0 {
        let want = remaining.min(scratch.len() as u64) as usize;
        let n = stream.read(&mut scratch[..want]).await?;
        if n == 0 {
            return Err(Error::Corrupt("Truncated PAR2 packet body".to_string()));
        }
        remaining -= n as u64;
    }
    Ok(())
}

/// Serialize a file-description packet (fixtures and mock posts)
pub fn build_file_description_packet(
    set_id: &[u8; 16],
    hash_16k: &[u8; 16],
    length: u64,
    file_name: &str,
) -> Vec<u8> {
    let mut name_bytes = file_name.as_bytes().to_vec();
    // Pad the body to a multiple of 4 as the spec requires.
    while (FILE_DESCRIPTION_MIN_SIZE + name_bytes.len()) % 4 != 0 {
        name_bytes.push(0);
    }

    let body_len = FILE_DESCRIPTION_MIN_SIZE + name_bytes.len();
    let mut packet = Vec::with_capacity(PACKET_HEADER_SIZE + body_len);
    packet.extend_from_slice(PACKET_MAGIC);
    packet.extend_from_slice(&((PACKET_HEADER_SIZE + body_len) as u64).to_le_bytes());
    packet.extend_from_slice(&[0u8; 16]); // packet hash, unchecked here
    packet.extend_from_slice(set_id);
    packet.extend_from_slice(FILE_DESCRIPTION_TYPE);
    packet.extend_from_slice(&[0u8; 16]); // file id
    packet.extend_from_slice(&[0u8; 16]); // file hash
    packet.extend_from_slice(hash_16k);
    packet.extend_from_slice(&length.to_le_bytes());
    packet.extend_from_slice(&name_bytes);
    packet
}

/// Serialize an opaque packet of the given type (fixtures and mock posts)
pub fn build_opaque_packet(set_id: &[u8; 16], packet_type: &[u8; 16], body: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(PACKET_HEADER_SIZE + body.len());
    packet.extend_from_slice(PACKET_MAGIC);
    packet.extend_from_slice(&((PACKET_HEADER_SIZE + body.len()) as u64).to_le_bytes());
    packet.extend_from_slice(&[0u8; 16]);
    packet.extend_from_slice(set_id);
    packet.extend_from_slice(packet_type);
    packet.extend_from_slice(body);
    packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct CursorStream {
        data: Vec<u8>,
        pos: usize,
    }

    #[async_trait]
    impl ReadStream for CursorStream {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            let n = (self.data.len() - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    fn cursor(data: Vec<u8>) -> CursorStream {
        CursorStream { data, pos: 0 }
    }

    #[test]
    fn test_magic_sniff() {
        assert!(has_par2_magic(b"PAR2\0PKT trailing"));
        assert!(!has_par2_magic(b"PAR2"));
        assert!(!has_par2_magic(b"RAR2\0PKT"));
        assert!(!has_par2_magic(b""));
    }

    #[tokio::test]
    async fn test_reads_file_descriptions_and_skips_others() {
        let set_id = [7u8; 16];
        let mut data = Vec::new();
        data.extend(build_opaque_packet(
            &set_id,
            b"PAR 2.0\0Main\0\0\0\0",
            &[0u8; 12],
        ));
        data.extend(build_file_description_packet(
            &set_id,
            &[1u8; 16],
            5_000_000,
            "movie.mkv",
        ));
        data.extend(build_opaque_packet(
            &set_id,
            b"PAR 2.0\0Creator\0",
            b"unit test creator\0\0\0",
        ));
        data.extend(build_file_description_packet(
            &set_id,
            &[2u8; 16],
            42,
            "sample.nfo",
        ));

        let mut stream = cursor(data);
        let cancel = CancellationToken::new();
        let descriptions = read_file_descriptions(&mut stream, &cancel).await.unwrap();

        assert_eq!(descriptions.len(), 2);
        assert_eq!(descriptions[0].file_name, "movie.mkv");
        assert_eq!(descriptions[0].length, 5_000_000);
        assert_eq!(descriptions[0].hash_16k, [1u8; 16]);
        assert_eq!(descriptions[1].file_name, "sample.nfo");
    }

    #[tokio::test]
    async fn test_magic_mismatch_is_corrupt() {
        let mut data = build_file_description_packet(&[0u8; 16], &[0u8; 16], 1, "a.bin");
        data[0] = b'X';
        let mut stream = cursor(data);
        let cancel = CancellationToken::new();
        let err = read_file_descriptions(&mut stream, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }

    #[tokio::test]
    async fn test_truncated_packet_is_corrupt() {
        let mut data = build_file_description_packet(&[0u8; 16], &[0u8; 16], 1, "a.bin");
        data.truncate(data.len() - 4);
        let mut stream = cursor(data);
        let cancel = CancellationToken::new();
        let err = read_file_descriptions(&mut stream, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }

    #[tokio::test]
    async fn test_empty_stream_yields_nothing() {
        let mut stream = cursor(Vec::new());
        let cancel = CancellationToken::new();
        let descriptions = read_file_descriptions(&mut stream, &cancel).await.unwrap();
        assert!(descriptions.is_empty());
    }

    #[test]
    fn test_cp1252_filename_fallback() {
        // 0x92 is a right single quote in cp1252 and invalid UTF-8.
        let name = decode_file_name(b"it\x92s here.mkv\0\0");
        assert_eq!(name, "it\u{2019}s here.mkv");
    }

    #[test]
    fn test_utf8_filename_preserved() {
        let name = decode_file_name("víde\u{00F3}.mkv".as_bytes());
        assert_eq!(name, "víde\u{00F3}.mkv");
    }
}
