//! Request line framing.
//!
//! A line ends at CRLF or a bare LF. A CR not followed by LF is dropped.
//! Control characters other than TAB, and DEL, never reach the line.

use bytes::{BufMut, BytesMut};
use std::io::{self, BufRead, ErrorKind, Write};

const CR: u8 = b'\r';
const LF: u8 = b'\n';
const HT: u8 = b'\t';
const DEL: u8 = 127;

fn is_kept(b: u8) -> bool {
    (b > 31 && b != DEL) || b == HT
}

fn next_byte<R: BufRead + ?Sized>(reader: &mut R) -> io::Result<Option<u8>> {
    loop {
        match reader.fill_buf() {
            Ok([]) => return Ok(None),
            Ok(buf) => {
                let b = buf[0];
                reader.consume(1);
                return Ok(Some(b));
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

fn peek_byte<R: BufRead + ?Sized>(reader: &mut R) -> io::Result<Option<u8>> {
    loop {
        match reader.fill_buf() {
            Ok(buf) => return Ok(buf.first().copied()),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Read one request line of at most `max_len` kept bytes.
///
/// Returns `None` at end of stream when nothing was read. A line longer than
/// `max_len` is returned truncated; the rest is read as the next line.
/// A `max_len` of zero is treated as one.
pub fn read_line<R: BufRead + ?Sized>(
    reader: &mut R,
    max_len: usize,
) -> io::Result<Option<BytesMut>> {
    let max_len = max_len.max(1);
    let mut line = BytesMut::with_capacity(80);
    let mut eof = false;

    while line.len() < max_len {
        match next_byte(reader)? {
            None => {
                eof = true;
                break;
            }
            Some(LF) => break,
            Some(CR) => {
                if peek_byte(reader)? == Some(LF) {
                    reader.consume(1);
                    break;
                }
            }
            Some(b) if is_kept(b) => line.put_u8(b),
            Some(_) => {}
        }
    }

    if eof && line.is_empty() {
        return Ok(None);
    }
    Ok(Some(line))
}

/// Write `text` followed by CRLF.
pub fn write_line<W: Write + ?Sized>(writer: &mut W, text: &str) -> io::Result<()> {
    let mut out = BytesMut::with_capacity(text.len() + 2);
    out.put_slice(text.as_bytes());
    out.put_slice(b"\r\n");
    writer.write_all(&out)
}

/// A parsed request: command name and its argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: String,
    pub argument: String,
}

/// Split a request line on the first space.
///
/// The command is upper-cased, the argument trimmed. A blank line yields
/// the `EMPTY` command.
pub fn parse_request(line: &str) -> Request {
    if line.trim().is_empty() {
        return Request {
            command: crate::protocol::EMPTY.to_string(),
            argument: String::new(),
        };
    }
    let (command, argument) = match line.find(' ') {
        Some(pos) => (&line[..pos], line[pos + 1..].trim()),
        None => (line.trim(), ""),
    };
    Request {
        command: command.trim().to_ascii_uppercase(),
        argument: argument.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn lines(input: &[u8], max: usize) -> Vec<Vec<u8>> {
        let mut reader = Cursor::new(input.to_vec());
        let mut out = Vec::new();
        while let Some(line) = read_line(&mut reader, max).unwrap() {
            out.push(line.to_vec());
        }
        out
    }

    #[test]
    fn test_crlf_and_bare_lf() {
        assert_eq!(
            lines(b"PING\r\nQUIT\nlast", 100),
            vec![b"PING".to_vec(), b"QUIT".to_vec(), b"last".to_vec()]
        );
    }

    #[test]
    fn test_lone_cr_is_dropped() {
        assert_eq!(lines(b"AB\rCD\r\n", 100), vec![b"ABCD".to_vec()]);
    }

    #[test]
    fn test_control_chars_stripped() {
        assert_eq!(
            lines(b"a\x01b\tc\x7fd\r\n", 100),
            vec![b"ab\tcd".to_vec()]
        );
    }

    #[test]
    fn test_blank_line_is_not_eof() {
        assert_eq!(lines(b"\r\n", 100), vec![Vec::<u8>::new()]);
        assert!(lines(b"", 100).is_empty());
    }

    #[test]
    fn test_max_length() {
        assert_eq!(
            lines(b"abcdef\r\n", 4),
            vec![b"abcd".to_vec(), b"ef".to_vec()]
        );
    }

    #[test]
    fn test_zero_max_length_still_consumes() {
        assert_eq!(
            lines(b"ab\r\n", 0),
            vec![b"a".to_vec(), b"b".to_vec(), Vec::new()]
        );
    }

    #[test]
    fn test_parse_request() {
        assert_eq!(
            parse_request("ping  hello world "),
            Request {
                command: "PING".into(),
                argument: "hello world".into()
            }
        );
        assert_eq!(parse_request("quit").command, "QUIT");
        assert_eq!(parse_request("quit").argument, "");
        assert_eq!(parse_request("   ").command, "EMPTY");
    }

    #[test]
    fn test_write_line() {
        let mut out = Vec::new();
        write_line(&mut out, "OK").unwrap();
        assert_eq!(out, b"OK\r\n");
    }
}
