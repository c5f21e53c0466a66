//! Target enumerator: reads `destination[,source]` address lines in
//! presentation form from a file or stdin. A line that fails to parse is a
//! corrupt input source and aborts the run.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::net::IpAddr;

use crate::error::TargetError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Target {
    pub dst: IpAddr,
    /// Per-target source override; absent means the configured source.
    pub src: Option<IpAddr>,
}

pub struct TargetFile {
    reader: Box<dyn BufRead + Send>,
    line_no: usize,
}

impl TargetFile {
    /// `-` means stdin, like the rest of the unix world.
    pub fn open(path: &str) -> io::Result<Self> {
        let reader: Box<dyn BufRead + Send> = if path == "-" {
            Box::new(BufReader::new(io::stdin()))
        } else {
            Box::new(BufReader::new(File::open(path)?))
        };
        Ok(Self { reader, line_no: 0 })
    }

    pub fn from_reader(reader: impl BufRead + Send + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            line_no: 0,
        }
    }

    /// Next target, `Ok(None)` at end of input.
    pub fn next_target(&mut self) -> Result<Option<Target>, TargetError> {
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            self.line_no += 1;

            let text = line.trim();
            if text.is_empty() {
                continue;
            }

            let mut parts = text.splitn(2, ',');
            let dst = self.parse_addr(parts.next().unwrap_or(""), text)?;
            let src = match parts.next() {
                Some(s) => Some(self.parse_addr(s, text)?),
                None => None,
            };
            return Ok(Some(Target { dst, src }));
        }
    }

    fn parse_addr(&self, s: &str, line: &str) -> Result<IpAddr, TargetError> {
        s.trim().parse().map_err(|_| TargetError::Parse {
            line: self.line_no,
            text: line.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_parses_dst_and_optional_src() {
        let input = "2001:db8::1\n\n2001:db8::2,2001:db8::ffff\n192.0.2.1\n";
        let mut tf = TargetFile::from_reader(Cursor::new(input));

        let t = tf.next_target().unwrap().unwrap();
        assert_eq!(t.dst, "2001:db8::1".parse::<IpAddr>().unwrap());
        assert_eq!(t.src, None);

        let t = tf.next_target().unwrap().unwrap();
        assert_eq!(t.dst, "2001:db8::2".parse::<IpAddr>().unwrap());
        assert_eq!(t.src, Some("2001:db8::ffff".parse().unwrap()));

        let t = tf.next_target().unwrap().unwrap();
        assert_eq!(t.dst, "192.0.2.1".parse::<IpAddr>().unwrap());

        assert!(tf.next_target().unwrap().is_none());
    }

    #[test]
    fn test_garbage_line_is_an_error() {
        let mut tf = TargetFile::from_reader(Cursor::new("2001:db8::1\nnot-an-address\n"));
        assert!(tf.next_target().unwrap().is_some());
        let err = tf.next_target().unwrap_err();
        assert!(matches!(err, TargetError::Parse { line: 2, .. }));
    }

    #[test]
    fn test_garbage_source_is_an_error() {
        let mut tf = TargetFile::from_reader(Cursor::new("2001:db8::1,bogus\n"));
        assert!(tf.next_target().is_err());
    }
}
