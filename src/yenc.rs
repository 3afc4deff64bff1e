//! yEnc codec for Usenet binary articles
//!
//! Decode-oriented: `=ybegin`/`=ypart`/`=yend` parsing and an incremental
//! line decoder that the network streams feed as article lines arrive.
//! Part CRC32s are verified when the trailer carries one. A line-level
//! encoder is included for producing well-formed article bodies.

use crate::error::{Error, Result};
use std::collections::HashMap;

/// Per-segment yEnc metadata
///
/// `part_offset`/`part_size` place this segment's decoded bytes within the
/// logical file (`=ypart begin` is 1-based inclusive). Single-part posts
/// cover the whole declared size at offset 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YencHeader {
    /// Original filename as seen by the poster
    pub file_name: String,
    /// Declared size of the complete file in bytes
    pub file_size: u64,
    /// Part number for multi-part posts
    pub part: Option<u32>,
    /// Total number of parts for multi-part posts
    pub total: Option<u32>,
    /// Absolute byte offset of this part within the file
    pub part_offset: u64,
    /// Decoded byte length of this part
    pub part_size: u64,
}

impl YencHeader {
    /// Exclusive end offset of this part within the file
    pub fn part_end(&self) -> u64 {
        self.part_offset + self.part_size
    }
}

/// yEnc trailer from the `=yend` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YencTrailer {
    /// Size of the decoded data in bytes
    pub size: u64,
    /// CRC32 of the entire decoded file (single-part posts)
    pub crc32: Option<u32>,
    /// CRC32 of this part only (multi-part posts)
    pub pcrc32: Option<u32>,
}

#[derive(Debug)]
struct YbeginLine {
    file_size: u64,
    file_name: String,
    part: Option<u32>,
    total: Option<u32>,
}

/// Parse yEnc `key=value` parameters; `name` takes the rest of the line
/// because filenames may contain spaces.
fn parse_params(params: &str) -> HashMap<&str, &str> {
    let mut result = HashMap::new();
    let mut rest = params.trim_start();

    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim();
        rest = &rest[eq + 1..];
        if key == "name" {
            result.insert("name", rest.trim_end());
            break;
        }
        let end = rest.find(' ').unwrap_or(rest.len());
        result.insert(key, &rest[..end]);
        rest = rest[end..].trim_start();
    }

    result
}

fn parse_ybegin(line: &str) -> Result<YbeginLine> {
    let params = line
        .strip_prefix("=ybegin ")
        .map(parse_params)
        .ok_or_else(|| Error::InvalidResponse(format!("Invalid yEnc header: {}", line)))?;

    let file_size = params
        .get("size")
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::InvalidResponse("Missing 'size' in =ybegin".to_string()))?;
    let file_name = params
        .get("name")
        .ok_or_else(|| Error::InvalidResponse("Missing 'name' in =ybegin".to_string()))?
        .to_string();

    Ok(YbeginLine {
        file_size,
        file_name,
        part: params.get("part").and_then(|s| s.parse().ok()),
        total: params.get("total").and_then(|s| s.parse().ok()),
    })
}

/// Parse `=ypart begin=N end=M` into a 0-based `(offset, size)` pair
fn parse_ypart(line: &str) -> Result<(u64, u64)> {
    let params = line
        .strip_prefix("=ypart ")
        .map(parse_params)
        .ok_or_else(|| Error::InvalidResponse(format!("Invalid yEnc part header: {}", line)))?;

    let begin: u64 = params
        .get("begin")
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::InvalidResponse("Missing 'begin' in =ypart".to_string()))?;
    let end: u64 = params
        .get("end")
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::InvalidResponse("Missing 'end' in =ypart".to_string()))?;
    if begin == 0 || end < begin {
        return Err(Error::InvalidResponse(format!(
            "Bad =ypart range {}-{}",
            begin, end
        )));
    }

    Ok((begin - 1, end - begin + 1))
}

fn parse_yend(line: &str) -> Result<YencTrailer> {
    let params = line
        .strip_prefix("=yend ")
        .map(parse_params)
        .ok_or_else(|| Error::InvalidResponse(format!("Invalid yEnc trailer: {}", line)))?;

    let size = params
        .get("size")
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::InvalidResponse("Missing 'size' in =yend".to_string()))?;

    Ok(YencTrailer {
        size,
        crc32: params
            .get("crc32")
            .and_then(|s| u32::from_str_radix(s, 16).ok()),
        pcrc32: params
            .get("pcrc32")
            .and_then(|s| u32::from_str_radix(s, 16).ok()),
    })
}

/// Decode one yEnc data line into `output`
///
/// yEnc decoding is `(byte - 42) mod 256`; `=X` escapes decode as
/// `(X - 64 - 42) mod 256`. Stray CRs are skipped.
fn decode_line(line: &[u8], output: &mut Vec<u8>) -> Result<()> {
    let mut i = 0;
    while i < line.len() {
        let byte = line[i];
        if byte == b'\r' {
            i += 1;
            continue;
        }
        if byte == b'=' {
            i += 1;
            let escaped = *line.get(i).ok_or_else(|| {
                Error::InvalidResponse("Incomplete escape sequence at end of line".to_string())
            })?;
            output.push(escaped.wrapping_sub(64).wrapping_sub(42));
        } else {
            output.push(byte.wrapping_sub(42));
        }
        i += 1;
    }
    Ok(())
}

/// Incremental yEnc decoder fed one article line at a time
///
/// Call [`feed_line`](Self::feed_line) for each line of the BODY response;
/// decoded bytes accumulate in the caller's buffer. The header is available
/// once `=ybegin` (and `=ypart`, when the post is multi-part) has been seen.
#[derive(Debug, Default)]
pub struct YencDecoder {
    begin: Option<YbeginLine>,
    part_range: Option<(u64, u64)>,
    trailer: Option<YencTrailer>,
    hasher: crc32fast::Hasher,
}

impl YencDecoder {
    /// Create a decoder awaiting the `=ybegin` line
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether enough metadata arrived to build the [`YencHeader`]
    pub fn header_ready(&self) -> bool {
        match &self.begin {
            Some(begin) => begin.part.is_none() || self.part_range.is_some(),
            None => false,
        }
    }

    /// The parsed header, once [`header_ready`](Self::header_ready)
    pub fn header(&self) -> Option<YencHeader> {
        let begin = self.begin.as_ref()?;
        let (part_offset, part_size) = match begin.part {
            Some(_) => self.part_range?,
            None => (0, begin.file_size),
        };
        Some(YencHeader {
            file_name: begin.file_name.clone(),
            file_size: begin.file_size,
            part: begin.part,
            total: begin.total,
            part_offset,
            part_size,
        })
    }

    /// Whether the `=yend` trailer has been seen
    pub fn finished(&self) -> bool {
        self.trailer.is_some()
    }

    /// Consume one article line, appending decoded bytes to `output`
    pub fn feed_line(&mut self, line: &[u8], output: &mut Vec<u8>) -> Result<()> {
        if self.trailer.is_some() {
            // Trailing junk after =yend is ignored.
            return Ok(());
        }

        if line.starts_with(b"=ybegin ") {
            let text = String::from_utf8_lossy(line);
            self.begin = Some(parse_ybegin(text.trim_end())?);
            return Ok(());
        }
        if line.starts_with(b"=ypart ") {
            let text = String::from_utf8_lossy(line);
            self.part_range = Some(parse_ypart(text.trim_end())?);
            return Ok(());
        }
        if line.starts_with(b"=yend ") {
            let text = String::from_utf8_lossy(line);
            self.trailer = Some(parse_yend(text.trim_end())?);
            return Ok(());
        }

        if self.begin.is_none() {
            // Leading non-yEnc lines are skipped.
            return Ok(());
        }

        let start = output.len();
        decode_line(line, output)?;
        self.hasher.update(&output[start..]);
        Ok(())
    }

    /// Check the part CRC against the trailer, when one was declared
    ///
    /// Returns `Ok(false)` when no CRC was present to verify.
    pub fn verify_crc(&self) -> Result<bool> {
        let Some(trailer) = &self.trailer else {
            return Ok(false);
        };
        let expected = match (trailer.pcrc32, trailer.crc32) {
            (Some(c), _) | (None, Some(c)) => c,
            (None, None) => return Ok(false),
        };
        let actual = self.hasher.clone().finalize();
        if actual != expected {
            return Err(Error::Corrupt(format!(
                "yEnc CRC mismatch: expected {:08x}, got {:08x}",
                expected, actual
            )));
        }
        Ok(true)
    }
}

/// Encode decoded bytes into yEnc article lines (header, data, trailer)
///
/// The inverse of [`YencDecoder`]; escapes the critical byte set and emits a
/// `pcrc32` trailer. Used by mock article servers and fixtures.
pub fn encode(data: &[u8], header: &YencHeader) -> Vec<Vec<u8>> {
    let mut lines: Vec<Vec<u8>> = Vec::new();
    let part = match header.part {
        Some(p) => format!(" part={}", p),
        None => String::new(),
    };
    lines.push(
        format!(
            "=ybegin{} line=128 size={} name={}",
            part, header.file_size, header.file_name
        )
        .into_bytes(),
    );
    if header.part.is_some() {
        lines.push(
            format!(
                "=ypart begin={} end={}",
                header.part_offset + 1,
                header.part_offset + header.part_size
            )
            .into_bytes(),
        );
    }

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    for chunk in data.chunks(128) {
        let mut line = Vec::with_capacity(chunk.len() + 8);
        for (i, &b) in chunk.iter().enumerate() {
            let enc = b.wrapping_add(42);
            let leading_dot = i == 0 && enc == b'.';
            match enc {
                0 | b'\t' | b'\n' | b'\r' | b'=' => {
                    line.push(b'=');
                    line.push(enc.wrapping_add(64));
                }
                _ if leading_dot => {
                    line.push(b'=');
                    line.push(enc.wrapping_add(64));
                }
                _ => line.push(enc),
            }
        }
        lines.push(line);
    }
    lines.push(format!("=yend size={} pcrc32={:08x}", data.len(), hasher.finalize()).into_bytes());
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ybegin_single_part() {
        let begin = parse_ybegin("=ybegin line=128 size=5000 name=my file.bin").unwrap();
        assert_eq!(begin.file_size, 5000);
        assert_eq!(begin.file_name, "my file.bin");
        assert_eq!(begin.part, None);
    }

    #[test]
    fn test_parse_ybegin_multi_part() {
        let begin =
            parse_ybegin("=ybegin part=2 total=4 line=128 size=2000000 name=video.mkv").unwrap();
        assert_eq!(begin.part, Some(2));
        assert_eq!(begin.total, Some(4));
        assert_eq!(begin.file_name, "video.mkv");
    }

    #[test]
    fn test_parse_ypart_offsets() {
        // begin is 1-based inclusive: part 2 of 750000-byte parts.
        let (offset, size) = parse_ypart("=ypart begin=750001 end=1500000").unwrap();
        assert_eq!(offset, 750000);
        assert_eq!(size, 750000);
    }

    #[test]
    fn test_parse_yend() {
        let trailer = parse_yend("=yend size=750000 pcrc32=abcdef12").unwrap();
        assert_eq!(trailer.size, 750000);
        assert_eq!(trailer.pcrc32, Some(0xabcdef12));
        assert_eq!(trailer.crc32, None);
    }

    #[test]
    fn test_decode_line_escapes() {
        let mut out = Vec::new();
        // '=J' decodes to (0x4A - 64 - 42) = 0 (NUL).
        decode_line(b"=J", &mut out).unwrap();
        assert_eq!(out, vec![0]);
    }

    #[test]
    fn test_decoder_round_trip() {
        let data: Vec<u8> = (0u8..=255).cycle().take(1000).collect();
        let header = YencHeader {
            file_name: "test.bin".to_string(),
            file_size: 1000,
            part: None,
            total: None,
            part_offset: 0,
            part_size: 1000,
        };

        let mut decoder = YencDecoder::new();
        let mut out = Vec::new();
        for line in encode(&data, &header) {
            decoder.feed_line(&line, &mut out).unwrap();
        }

        assert!(decoder.finished());
        assert_eq!(out, data);
        assert!(decoder.verify_crc().unwrap());
        let parsed = decoder.header().unwrap();
        assert_eq!(parsed.part_offset, 0);
        assert_eq!(parsed.part_size, 1000);
    }

    #[test]
    fn test_decoder_multi_part_header() {
        let header = YencHeader {
            file_name: "video.mkv".to_string(),
            file_size: 3_000_000,
            part: Some(2),
            total: Some(4),
            part_offset: 750_000,
            part_size: 64,
        };
        let data = vec![0x55u8; 64];

        let mut decoder = YencDecoder::new();
        let mut out = Vec::new();
        let lines = encode(&data, &header);
        decoder.feed_line(&lines[0], &mut out).unwrap();
        assert!(!decoder.header_ready(), "multi-part waits for =ypart");
        decoder.feed_line(&lines[1], &mut out).unwrap();
        assert!(decoder.header_ready());

        let parsed = decoder.header().unwrap();
        assert_eq!(parsed.part_offset, 750_000);
        assert_eq!(parsed.part_end(), 750_064);
    }

    #[test]
    fn test_crc_mismatch_is_corrupt() {
        let mut decoder = YencDecoder::new();
        let mut out = Vec::new();
        decoder
            .feed_line(b"=ybegin line=128 size=4 name=x.bin", &mut out)
            .unwrap();
        decoder.feed_line(b"rsst", &mut out).unwrap();
        decoder
            .feed_line(b"=yend size=4 pcrc32=00000000", &mut out)
            .unwrap();
        assert!(matches!(decoder.verify_crc(), Err(Error::Corrupt(_))));
    }
}
