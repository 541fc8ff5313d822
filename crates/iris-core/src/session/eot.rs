/// Rolling tail of recent output, searched for the end-of-turn marker.
///
/// The tail never grows past twice the marker length (plus one chunk), yet a
/// marker split across several chunks is still found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndOfTurnDetector {
    marker: String,
    tail: String,
}

impl EndOfTurnDetector {
    /// An empty marker disables detection.
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            tail: String::new(),
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    pub fn tail(&self) -> &str {
        &self.tail
    }

    /// Append a chunk; true once the marker has appeared.
    pub fn push(&mut self, chunk: &str) -> bool {
        if self.marker.is_empty() {
            return false;
        }

        self.tail.push_str(chunk);
        if self.tail.contains(self.marker.as_str()) {
            return true;
        }

        if self.tail.len() > self.marker.len() * 2 {
            let mut cut = self.tail.len() / 2;
            while !self.tail.is_char_boundary(cut) {
                cut += 1;
            }
            self.tail.drain(..cut);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_marker_in_one_chunk() {
        let mut d = EndOfTurnDetector::new("<|im_end|>");
        assert!(!d.push("Hello"));
        assert!(d.push(" there<|im_end|>"));
    }

    #[test]
    fn finds_marker_split_across_chunks() {
        let mut d = EndOfTurnDetector::new("<|im_end|>");
        for c in ["ok", "<|", "im", "_e", "nd"] {
            assert!(!d.push(c), "{c}");
        }
        assert!(d.push("|>"));
    }

    #[test]
    fn split_marker_survives_truncation_of_long_output() {
        let mut d = EndOfTurnDetector::new("</s>");
        for _ in 0..200 {
            assert!(!d.push("lorem ipsum "));
        }
        assert!(!d.push("</"));
        assert!(d.push("s>"));
    }

    #[test]
    fn tail_stays_bounded() {
        let mut d = EndOfTurnDetector::new("<eot>");
        for _ in 0..1000 {
            d.push("abc");
            assert!(d.tail().len() <= 2 * 5 + 3);
        }
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut d = EndOfTurnDetector::new("<e>");
        for _ in 0..50 {
            assert!(!d.push("héllo wörld ✓"));
        }
        assert!(d.push("<e>"));
    }

    #[test]
    fn empty_marker_never_matches() {
        let mut d = EndOfTurnDetector::new("");
        assert!(!d.push("anything"));
        assert!(d.tail().is_empty());
    }
}
