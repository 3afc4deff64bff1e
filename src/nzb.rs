//! NZB manifest parser
//!
//! NZB is the XML manifest format describing a batch of Usenet posts: each
//! `<file subject="...">` carries ordered `<segment number="n">id</segment>`
//! children, and an optional `<head><meta type="name|title">` suggests a
//! title. The parser tolerates missing metadata and skips files without
//! segments; health decisions belong to the queue manager.
//!
//! Reference: https://sabnzbd.org/wiki/extra/nzb-spec

use crate::client::SegmentId;
use crate::error::{Error, Result};
use quick_xml::Reader;
use quick_xml::events::Event;
use std::collections::HashMap;

/// Parsed NZB manifest
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Nzb {
    /// Metadata from the `<head>` section (title, password, category, ...)
    pub meta: HashMap<String, String>,
    /// Files described in this manifest
    pub files: Vec<NzbFile>,
}

/// One file entry in an NZB
#[derive(Debug, Clone, PartialEq)]
pub struct NzbFile {
    /// Subject line of the posting
    pub subject: String,
    /// Segments in ascending part order
    pub segments: Vec<NzbSegment>,
}

/// One segment (article) of a file
#[derive(Debug, Clone, PartialEq)]
pub struct NzbSegment {
    /// Declared encoded size in bytes
    pub bytes: u64,
    /// Part number (1-based)
    pub number: u32,
    /// Message-id for retrieving this segment
    pub message_id: String,
}

impl Nzb {
    /// Suggested title from head metadata (`name` preferred over `title`)
    pub fn title(&self) -> Option<&str> {
        self.meta
            .get("name")
            .or_else(|| self.meta.get("title"))
            .map(String::as_str)
            .filter(|s| !s.trim().is_empty())
    }
}

impl NzbFile {
    /// Segment identifiers in part order
    pub fn segment_ids(&self) -> Vec<SegmentId> {
        self.segments
            .iter()
            .map(|s| SegmentId::from(s.message_id.as_str()))
            .collect()
    }
}

/// Parse an NZB manifest from its XML text
///
/// # Errors
///
/// [`Error::InvalidNzb`] when the XML cannot be parsed at all. Individual
/// files without a subject or without segments are dropped, not fatal.
///
/// # Example
///
/// ```
/// use nzb_streamer::parse_nzb;
///
/// let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
/// <nzb xmlns="http://www.newzbin.com/DTD/2003/nzb">
///   <head><meta type="title">Example</meta></head>
///   <file subject="Example [1/1] - &quot;example.bin&quot; yEnc (1/1)">
///     <groups><group>alt.binaries.test</group></groups>
///     <segments>
///       <segment bytes="768000" number="1">part1of1@example.com</segment>
///     </segments>
///   </file>
/// </nzb>"#;
///
/// let nzb = parse_nzb(xml).unwrap();
/// assert_eq!(nzb.title(), Some("Example"));
/// assert_eq!(nzb.files[0].segments.len(), 1);
/// ```
pub fn parse_nzb(xml: &str) -> Result<Nzb> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut nzb = Nzb::default();

    let mut in_head = false;
    let mut meta_type: Option<String> = None;
    let mut current_file: Option<NzbFile> = None;
    let mut current_segment: Option<NzbSegment> = None;
    let mut buf = Vec::new();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| Error::InvalidNzb(format!("XML error: {}", e)))?;

        match event {
            Event::Start(ref e) => match e.local_name().as_ref() {
                b"head" => in_head = true,
                b"meta" if in_head => {
                    meta_type = e.attributes().flatten().find_map(|attr| {
                        (attr.key.local_name().as_ref() == b"type")
                            .then(|| String::from_utf8_lossy(&attr.value).into_owned())
                    });
                }
                b"file" => {
                    let mut subject = String::new();
                    for attr in e.attributes().flatten() {
                        if attr.key.local_name().as_ref() == b"subject" {
                            subject = attr
                                .unescape_value()
                                .unwrap_or_default()
                                .into_owned();
                        }
                    }
                    current_file = Some(NzbFile {
                        subject,
                        segments: Vec::new(),
                    });
                }
                b"segment" if current_file.is_some() => {
                    let mut bytes = 0u64;
                    let mut number = 0u32;
                    for attr in e.attributes().flatten() {
                        let value = String::from_utf8_lossy(&attr.value);
                        match attr.key.local_name().as_ref() {
                            b"bytes" => bytes = value.parse().unwrap_or(0),
                            b"number" => number = value.parse().unwrap_or(0),
                            _ => {}
                        }
                    }
                    current_segment = Some(NzbSegment {
                        bytes,
                        number,
                        message_id: String::new(),
                    });
                }
                _ => {}
            },
            Event::Text(ref t) => {
                let text = t
                    .unescape()
                    .unwrap_or_default()
                    .into_owned();
                if let Some(segment) = current_segment.as_mut() {
                    segment.message_id.push_str(text.trim());
                } else if let Some(kind) = meta_type.as_ref() {
                    nzb.meta.insert(kind.clone(), text.trim().to_string());
                }
            }
            Event::End(ref e) => match e.local_name().as_ref() {
                b"head" => in_head = false,
                b"meta" => meta_type = None,
                b"segment" => {
                    if let (Some(file), Some(segment)) =
                        (current_file.as_mut(), current_segment.take())
                        && !segment.message_id.is_empty()
                    {
                        file.segments.push(segment);
                    }
                }
                b"file" => {
                    if let Some(mut file) = current_file.take() {
                        // Manifest order is not authoritative; part numbers are.
                        file.segments.sort_by_key(|s| s.number);
                        if !file.subject.trim().is_empty() && !file.segments.is_empty() {
                            nzb.files.push(file);
                        }
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(nzb)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE nzb PUBLIC "-//newzBin//DTD NZB 1.1//EN" "http://www.newzbin.com/DTD/nzb/nzb-1.1.dtd">
<nzb xmlns="http://www.newzbin.com/DTD/2003/nzb">
  <head>
    <meta type="title">My Show S01E01</meta>
    <meta type="password"></meta>
  </head>
  <file poster="poster@example.com" date="1234567890" subject="My Show [1/2] - &quot;show.part1.rar&quot; yEnc (1/3)">
    <groups><group>alt.binaries.test</group></groups>
    <segments>
      <segment bytes="750000" number="2">p1s2@example.com</segment>
      <segment bytes="750000" number="1">p1s1@example.com</segment>
      <segment bytes="512000" number="3">p1s3@example.com</segment>
    </segments>
  </file>
  <file subject="My Show [2/2] - &quot;show.part2.rar&quot; yEnc (1/1)">
    <segments>
      <segment bytes="400000" number="1">p2s1@example.com</segment>
    </segments>
  </file>
</nzb>"#;

    #[test]
    fn test_parse_sample() {
        let nzb = parse_nzb(SAMPLE).unwrap();
        assert_eq!(nzb.title(), Some("My Show S01E01"));
        assert_eq!(nzb.files.len(), 2);
        assert_eq!(nzb.files[0].subject, r#"My Show [1/2] - "show.part1.rar" yEnc (1/3)"#);
        assert_eq!(nzb.files[1].segments.len(), 1);
    }

    #[test]
    fn test_segments_ordered_by_number() {
        let nzb = parse_nzb(SAMPLE).unwrap();
        let numbers: Vec<u32> = nzb.files[0].segments.iter().map(|s| s.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(nzb.files[0].segments[0].message_id, "p1s1@example.com");
        assert_eq!(nzb.files[0].segments[0].bytes, 750000);
    }

    #[test]
    fn test_segment_ids() {
        let nzb = parse_nzb(SAMPLE).unwrap();
        let ids = nzb.files[1].segment_ids();
        assert_eq!(ids, vec![SegmentId::from("p2s1@example.com")]);
    }

    #[test]
    fn test_file_without_segments_dropped() {
        let xml = r#"<nzb><file subject="empty"><segments/></file></nzb>"#;
        let nzb = parse_nzb(xml).unwrap();
        assert!(nzb.files.is_empty());
    }

    #[test]
    fn test_missing_head_tolerated() {
        let xml = r#"<nzb><file subject="a"><segments>
            <segment bytes="1" number="1">x@y</segment>
        </segments></file></nzb>"#;
        let nzb = parse_nzb(xml).unwrap();
        assert_eq!(nzb.title(), None);
        assert_eq!(nzb.files.len(), 1);
    }

    #[test]
    fn test_invalid_xml_rejected() {
        assert!(matches!(
            parse_nzb("<nzb><file subject="),
            Err(Error::InvalidNzb(_))
        ));
    }
}
