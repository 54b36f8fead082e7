use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;

/// Concatenates a file's fragments in write order into a single byte
/// stream. Fragments are opened one at a time as the previous one is
/// exhausted, not all up front (spec §4.6: "content is the concatenation
/// of its fragments in write order").
pub struct FragmentReader {
    pending: VecDeque<PathBuf>,
    current: Option<File>,
}

impl FragmentReader {
    pub(crate) fn new(fragments: Vec<PathBuf>) -> Self {
        Self {
            pending: fragments.into(),
            current: None,
        }
    }
}

impl Read for FragmentReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if let Some(file) = self.current.as_mut() {
                let n = file.read(buf)?;
                if n > 0 {
                    return Ok(n);
                }
                self.current = None;
            }
            match self.pending.pop_front() {
                Some(path) => self.current = Some(File::open(path)?),
                None => return Ok(0),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn concatenates_fragments_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        for (i, chunk) in [b"ab".as_slice(), b"cd".as_slice(), b"e".as_slice()].iter().enumerate() {
            let path = dir.path().join(format!("{i:04}"));
            std::fs::File::create(&path).unwrap().write_all(chunk).unwrap();
            paths.push(path);
        }
        let mut reader = FragmentReader::new(paths);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abcde");
    }

    #[test]
    fn empty_fragment_list_reads_as_empty() {
        let mut reader = FragmentReader::new(Vec::new());
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert!(out.is_empty());
    }
}
