//! Reassembles an unframed byte stream into complete text lines.

/// Line terminator emitted by the rig firmware. A preceding `\r` is stripped.
const TERMINATOR: u8 = b'\n';

/// Holds the unterminated tail of the stream between chunks.
///
/// Lines are split on raw bytes and decoded only once complete, so a multi-byte
/// character that straddles two chunks decodes the same as if it had arrived
/// whole. Invalid UTF-8 is replaced rather than rejected.
#[derive(Debug, Default)]
pub struct LineReassembler {
    tail: Vec<u8>,
}

impl LineReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and yields every line it completes, terminator removed.
    ///
    /// The iterator borrows the reassembler; lines are cut lazily as it is
    /// driven. Anything left after the last terminator stays buffered.
    pub fn push<'a>(&'a mut self, chunk: &[u8]) -> impl Iterator<Item = String> + 'a {
        let scan_from = self.tail.len();
        self.tail.extend_from_slice(chunk);
        let mut search = scan_from;

        std::iter::from_fn(move || {
            let offset = self.tail[search..].iter().position(|b| *b == TERMINATOR)?;
            let end = search + offset;
            let mut line: Vec<u8> = self.tail.drain(..=end).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            search = 0;
            Some(String::from_utf8_lossy(&line).into_owned())
        })
    }

    /// Bytes buffered without a terminator yet.
    pub fn pending(&self) -> usize {
        self.tail.len()
    }

    /// Drops the unterminated remainder, returning how many bytes were lost.
    ///
    /// Called when the stream ends: a partial trailing line is never emitted.
    pub fn discard(&mut self) -> usize {
        let lost = self.tail.len();
        self.tail.clear();
        lost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_all(reassembler: &mut LineReassembler, chunks: &[&[u8]]) -> Vec<String> {
        let mut lines = Vec::new();
        for chunk in chunks {
            lines.extend(reassembler.push(chunk));
        }
        lines
    }

    #[test]
    fn test_single_chunk_multiple_lines() {
        let mut r = LineReassembler::new();
        let lines = collect_all(&mut r, &[b"Current: 1.0\nPsi: 2.0\n".as_slice()]);
        assert_eq!(lines, vec!["Current: 1.0", "Psi: 2.0"]);
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn test_line_split_across_chunks() {
        let mut r = LineReassembler::new();
        assert_eq!(r.push(b"Current: 1").count(), 0);
        assert_eq!(r.pending(), 10);
        let lines: Vec<_> = r.push(b"0.0\nPsi").collect();
        assert_eq!(lines, vec!["Current: 10.0"]);
        assert_eq!(r.pending(), 3);
    }

    #[test]
    fn test_crlf_and_empty_lines_are_emitted() {
        let mut r = LineReassembler::new();
        let lines = collect_all(&mut r, &[b"a\r\n\r\n\nb\n".as_slice()]);
        assert_eq!(lines, vec!["a", "", "", "b"]);
    }

    #[test]
    fn test_split_invariance_over_every_partition_point() {
        let stream: &[u8] = b"Current: 12.5\r\nPsi: 30.0\nBus Voltage: 4.98\n\nPower: 1.2\npartial";
        let terminators = stream.iter().filter(|b| **b == b'\n').count();

        let mut whole = LineReassembler::new();
        let expected = collect_all(&mut whole, &[stream]);
        assert_eq!(expected.len(), terminators);

        for i in 0..=stream.len() {
            for j in i..=stream.len() {
                let mut r = LineReassembler::new();
                let got = collect_all(&mut r, &[&stream[..i], &stream[i..j], &stream[j..]]);
                assert_eq!(got, expected, "split at {i}/{j}");
            }
        }
    }

    #[test]
    fn test_byte_at_a_time_multibyte() {
        let stream = "Temp: 21°C\nok\n".as_bytes();
        let mut r = LineReassembler::new();
        let mut lines = Vec::new();
        for b in stream {
            lines.extend(r.push(std::slice::from_ref(b)));
        }
        assert_eq!(lines, vec!["Temp: 21°C", "ok"]);
    }

    #[test]
    fn test_discard_drops_partial_tail() {
        let mut r = LineReassembler::new();
        let _ = r.push(b"Psi: 3").count();
        assert_eq!(r.discard(), 6);
        let lines: Vec<_> = r.push(b"\n").collect();
        assert_eq!(lines, vec![""]);
    }
}
