// Reverie Engine — JSON Array Streamer
// Yields top-level objects from a JSON array read incrementally, without
// ever holding more than one chunk plus the current partial object in
// memory. A whole-file parse is infeasible on multi-gigabyte exports, and
// only *top-level* element boundaries matter here, so a custom scanner
// beats a full streaming JSON parser.

use crate::atoms::constants::STREAM_CHUNK_SIZE;
use crate::atoms::error::{EngineError, EngineResult};
use serde_json::Value;
use std::io::Read;

#[derive(Debug, Clone, Copy, PartialEq)]
enum ScanState {
    /// Before the opening `[` (optional BOM / whitespace allowed).
    PreArray,
    /// At array level, between elements (whitespace and commas skipped).
    BetweenElements,
    /// Inside a top-level object, tracking brace/bracket depth.
    InElement,
}

/// Incremental scanner over a byte stream encoding a UTF-8 JSON array of
/// objects. Implements `Iterator`, yielding each parsed top-level object.
///
/// The scanner maintains one buffer and a cursor. When depth returns to
/// zero inside an element, the slice `[token_start, cursor]` is handed to
/// serde and yielded; consumed bytes are then drained so memory stays
/// bounded by the chunk size plus the largest single object.
pub struct JsonArrayStream<R: Read> {
    reader: R,
    chunk_size: usize,
    buf: Vec<u8>,
    pos: usize,
    token_start: usize,
    state: ScanState,
    depth: u32,
    in_string: bool,
    escaped: bool,
    eof: bool,
    finished: bool,
}

impl<R: Read> JsonArrayStream<R> {
    pub fn new(reader: R) -> Self {
        Self::with_chunk_size(reader, STREAM_CHUNK_SIZE)
    }

    /// Chunk size must not affect yielded objects; tests run with tiny
    /// chunks to prove it.
    pub fn with_chunk_size(reader: R, chunk_size: usize) -> Self {
        JsonArrayStream {
            reader,
            chunk_size: chunk_size.max(1),
            buf: Vec::new(),
            pos: 0,
            token_start: 0,
            state: ScanState::PreArray,
            depth: 0,
            in_string: false,
            escaped: false,
            eof: false,
            finished: false,
        }
    }

    /// Read one more chunk into the buffer, reclaiming consumed bytes first.
    /// Returns false at end of input.
    fn fill(&mut self) -> EngineResult<bool> {
        if self.eof {
            return Ok(false);
        }
        // Reclaim: when capturing an object keep the bytes from token_start,
        // otherwise drop everything before the cursor.
        let keep_from = if self.state == ScanState::InElement {
            self.token_start
        } else {
            self.pos
        };
        if keep_from > 0 {
            self.buf.drain(..keep_from);
            self.pos -= keep_from;
            self.token_start = self.token_start.saturating_sub(keep_from);
        }

        let mut chunk = vec![0u8; self.chunk_size];
        let n = self.reader.read(&mut chunk)?;
        if n == 0 {
            self.eof = true;
            return Ok(false);
        }
        chunk.truncate(n);
        self.buf.extend_from_slice(&chunk);
        Ok(true)
    }

    fn next_object(&mut self) -> EngineResult<Option<Value>> {
        loop {
            if self.pos >= self.buf.len() {
                if !self.fill()? {
                    return match self.state {
                        ScanState::PreArray => {
                            Err(EngineError::MalformedInput("input is not a JSON array".into()))
                        }
                        ScanState::BetweenElements => Err(EngineError::MalformedInput(
                            "unterminated JSON array (missing ])".into(),
                        )),
                        ScanState::InElement => Err(EngineError::MalformedInput(
                            "stream ended inside a top-level object".into(),
                        )),
                    };
                }
                continue;
            }

            let b = self.buf[self.pos];
            match self.state {
                ScanState::PreArray => {
                    // Skip UTF-8 BOM bytes; they only occur before the array.
                    if matches!(b, 0xEF | 0xBB | 0xBF) {
                        self.pos += 1;
                        continue;
                    }
                    if b.is_ascii_whitespace() {
                        self.pos += 1;
                    } else if b == b'[' {
                        self.pos += 1;
                        self.state = ScanState::BetweenElements;
                    } else {
                        return Err(EngineError::MalformedInput(
                            "input is not a JSON array".into(),
                        ));
                    }
                }
                ScanState::BetweenElements => {
                    if b.is_ascii_whitespace() || b == b',' {
                        self.pos += 1;
                    } else if b == b']' {
                        self.pos += 1;
                        self.finished = true;
                        return Ok(None);
                    } else if b == b'{' {
                        self.state = ScanState::InElement;
                        self.token_start = self.pos;
                        self.depth = 1;
                        self.in_string = false;
                        self.escaped = false;
                        self.pos += 1;
                    } else {
                        return Err(EngineError::MalformedInput(
                            "top-level array element is not an object".into(),
                        ));
                    }
                }
                ScanState::InElement => {
                    if self.in_string {
                        if self.escaped {
                            self.escaped = false;
                        } else if b == b'\\' {
                            self.escaped = true;
                        } else if b == b'"' {
                            self.in_string = false;
                        }
                        self.pos += 1;
                    } else {
                        match b {
                            b'"' => {
                                self.in_string = true;
                                self.pos += 1;
                            }
                            b'{' | b'[' => {
                                self.depth += 1;
                                self.pos += 1;
                            }
                            b'}' | b']' => {
                                self.depth -= 1;
                                self.pos += 1;
                                if self.depth == 0 {
                                    let token = &self.buf[self.token_start..self.pos];
                                    let value: Value = serde_json::from_slice(token).map_err(
                                        |e| {
                                            EngineError::MalformedInput(format!(
                                                "invalid object in array: {e}"
                                            ))
                                        },
                                    )?;
                                    self.state = ScanState::BetweenElements;
                                    // Reclaim consumed bytes eagerly.
                                    self.buf.drain(..self.pos);
                                    self.pos = 0;
                                    self.token_start = 0;
                                    return Ok(Some(value));
                                }
                            }
                            _ => {
                                self.pos += 1;
                            }
                        }
                    }
                }
            }
        }
    }
}

impl<R: Read> Iterator for JsonArrayStream<R> {
    type Item = EngineResult<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_object() {
            Ok(Some(v)) => Some(Ok(v)),
            Ok(None) => None,
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn collect(input: &str, chunk: usize) -> EngineResult<Vec<Value>> {
        JsonArrayStream::with_chunk_size(Cursor::new(input.as_bytes().to_vec()), chunk).collect()
    }

    #[test]
    fn yields_all_objects_regardless_of_chunk_size() {
        let input = r#"[{"a":1},{"b":"x,]}"},{"c":{"nested":[1,2,3]}}]"#;
        for chunk in [1, 2, 7, 64, 4096] {
            let objs = collect(input, chunk).unwrap();
            assert_eq!(objs.len(), 3, "chunk={chunk}");
            assert_eq!(objs[0]["a"], 1);
            assert_eq!(objs[1]["b"], "x,]}");
            assert_eq!(objs[2]["c"]["nested"][2], 3);
        }
    }

    #[test]
    fn memory_stays_bounded_over_many_objects() {
        let mut input = String::from("[");
        for i in 0..10_000 {
            if i > 0 {
                input.push(',');
            }
            input.push_str(&format!(r#"{{"id":{i},"text":"message {i}"}}"#));
        }
        input.push(']');

        let mut stream =
            JsonArrayStream::with_chunk_size(Cursor::new(input.into_bytes()), 512);
        let mut count = 0usize;
        let mut peak = 0usize;
        while let Some(obj) = stream.next() {
            assert!(obj.unwrap().is_object());
            count += 1;
            peak = peak.max(stream.buf.len());
        }
        assert_eq!(count, 10_000);
        // Buffer never grows past one chunk plus the largest single object.
        assert!(peak < 512 + 128, "peak buffer was {peak}");
    }

    #[test]
    fn escaped_quotes_and_braces_inside_strings() {
        let objs = collect(r#"[{"s":"a \" b } ] {"}]"#, 3).unwrap();
        assert_eq!(objs.len(), 1);
        assert_eq!(objs[0]["s"], "a \" b } ] {");
    }

    #[test]
    fn handles_whitespace_and_bom() {
        for chunk in [1, 4, 64] {
            let mut bytes = vec![0xEF, 0xBB, 0xBF];
            bytes.extend_from_slice(b" \n [ {\"a\":1} , {\"b\":2} ] ");
            let stream = JsonArrayStream::with_chunk_size(Cursor::new(bytes), chunk);
            let objs: EngineResult<Vec<Value>> = stream.collect();
            assert_eq!(objs.unwrap().len(), 2);
        }
    }

    #[test]
    fn empty_array_yields_nothing() {
        assert!(collect("[]", 8).unwrap().is_empty());
        assert!(collect("  [\n]\n", 1).unwrap().is_empty());
    }

    #[test]
    fn rejects_non_array_input() {
        assert!(matches!(
            collect(r#"{"a":1}"#, 16).unwrap_err(),
            EngineError::MalformedInput(_)
        ));
    }

    #[test]
    fn rejects_non_object_elements() {
        assert!(matches!(
            collect(r#"[1,2,3]"#, 16).unwrap_err(),
            EngineError::MalformedInput(_)
        ));
    }

    #[test]
    fn rejects_unterminated_object() {
        assert!(matches!(
            collect(r#"[{"a":1"#, 4).unwrap_err(),
            EngineError::MalformedInput(_)
        ));
    }

    #[test]
    fn rejects_missing_closing_bracket() {
        assert!(matches!(
            collect(r#"[{"a":1}"#, 4).unwrap_err(),
            EngineError::MalformedInput(_)
        ));
    }
}
