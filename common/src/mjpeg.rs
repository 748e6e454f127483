//! Motion-JPEG over HTTP framing.
//!
//! A stream is a sequence of parts, each laid out as
//! `--frame\r\nContent-Type: image/jpeg\r\n\r\n<jpeg-bytes>\r\n`. Browsers render
//! such a response in an `<img>` tag when it is served with [`CONTENT_TYPE`].
use bytes::Bytes;

use crate::Error;

/// Boundary token separating the parts.
pub const BOUNDARY: &str = "frame";

/// Value of the `Content-Type` header of a streamed response.
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

const PART_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
const PART_TRAILER: &[u8] = b"\r\n";
const NEXT_PART: &[u8] = b"\r\n--frame\r\n";

/// Wrap an encoded JPEG into one part of a multipart stream.
pub fn as_jpeg_stream_item(jpeg: &[u8]) -> Bytes {
    let mut item = Vec::with_capacity(PART_HEADER.len() + jpeg.len() + PART_TRAILER.len());
    item.extend_from_slice(PART_HEADER);
    item.extend_from_slice(jpeg);
    item.extend_from_slice(PART_TRAILER);
    Bytes::from(item)
}

/// One part of a received multipart stream.
#[derive(Debug, Eq, PartialEq)]
pub struct Part {
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Split a complete multipart stream body into its parts.
///
/// The parts carry no length header, so the payload of a part runs until the
/// next `\r\n--frame\r\n` delimiter or, for the last part, until the trailing
/// `\r\n` at the end of the body.
pub fn split_parts(body: &[u8]) -> Result<Vec<Part>, Error> {
    let delimiter = format!("--{BOUNDARY}\r\n");
    let mut parts = vec![];
    let mut rest = body;

    while !rest.is_empty() {
        if !rest.starts_with(delimiter.as_bytes()) {
            return Err(format!("expected boundary at offset {}", body.len() - rest.len()).into());
        }
        rest = &rest[delimiter.len()..];

        let header_end = find(rest, b"\r\n\r\n").ok_or("unterminated part header")?;
        let content_type = std::str::from_utf8(&rest[..header_end])?
            .lines()
            .find_map(|line| {
                line.split_once(':')
                    .filter(|(name, _)| name.eq_ignore_ascii_case("content-type"))
                    .map(|(_, value)| value.trim().to_owned())
            })
            .ok_or("part without content type")?;
        rest = &rest[header_end + 4..];

        match find(rest, NEXT_PART) {
            Some(end) => {
                parts.push(Part {
                    content_type,
                    data: rest[..end].to_vec(),
                });
                // Keep the delimiter minus the leading CRLF for the next round
                rest = &rest[end + PART_TRAILER.len()..];
            }
            None => {
                let data = rest.strip_suffix(PART_TRAILER).ok_or("unterminated last part")?;
                parts.push(Part {
                    content_type,
                    data: data.to_vec(),
                });
                rest = &[];
            }
        }
    }

    Ok(parts)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn test_part_layout_is_byte_exact() {
        let item = as_jpeg_stream_item(&[0xff, 0xd8, 0xff, 0xd9]);
        assert_eq!(
            &item[..],
            b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xff\xd8\xff\xd9\r\n"
        );
    }

    #[test]
    fn test_split_concatenated_parts() -> Result<(), Error> {
        let body: Vec<u8> = [
            as_jpeg_stream_item(b"first"),
            as_jpeg_stream_item(b"second\r\n"),
            as_jpeg_stream_item(b""),
        ]
        .concat();

        let parts = split_parts(&body)?;

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].data, b"first");
        assert_eq!(parts[1].data, b"second\r\n");
        assert!(parts[2].data.is_empty());
        assert!(parts.iter().all(|part| part.content_type == "image/jpeg"));

        Ok(())
    }

    #[test]
    fn test_empty_body_has_no_parts() -> Result<(), Error> {
        assert!(split_parts(b"")?.is_empty());
        Ok(())
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(split_parts(b"Error: No video file provided.").is_err());
    }
}
