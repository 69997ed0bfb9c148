// ABOUTME: Named source texts and the line/column tags attached to parsed values

use std::fmt;
use std::rc::Rc;

/// One physical line of a source text, shared by every tag pointing into it.
#[derive(Debug, Clone)]
pub struct Line {
    pub source: Rc<str>,
    pub text: String,
    /// 1-based row.
    pub row: u32,
}

/// A position inside a source text: the owning line plus a 1-based column.
///
/// Tags are attached to parsed values, carried through compilation into the
/// instruction tag arrays, and surface in error diagnostics.
#[derive(Debug, Clone)]
pub struct SourceTag {
    pub line: Rc<Line>,
    pub column: u32,
}

impl SourceTag {
    /// Render the caret diagnostic: the source line with a `~~~^` pointer
    /// under the tagged column.
    pub fn point_to(&self) -> String {
        let pad = "~".repeat(self.column.saturating_sub(1) as usize);
        format!("{}\n{}^", self.line.text, pad)
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.line.source, self.line.row, self.column)
    }
}

/// Byte-offset to line/column mapping for one source text.
pub struct LineMap {
    lines: Vec<Rc<Line>>,
    starts: Vec<usize>,
}

impl LineMap {
    pub fn new(name: &str, text: &str) -> Self {
        let source: Rc<str> = Rc::from(name);
        let mut lines = Vec::new();
        let mut starts = Vec::new();
        let mut offset = 0;
        for raw in text.split_inclusive('\n') {
            starts.push(offset);
            lines.push(Rc::new(Line {
                source: Rc::clone(&source),
                text: raw.trim_end_matches(['\n', '\r']).to_string(),
                row: lines.len() as u32 + 1,
            }));
            offset += raw.len();
        }
        if lines.is_empty() {
            starts.push(0);
            lines.push(Rc::new(Line {
                source,
                text: String::new(),
                row: 1,
            }));
        }
        LineMap { lines, starts }
    }

    /// Tag for a byte offset into the source text.
    pub fn tag_at(&self, offset: usize) -> SourceTag {
        let idx = match self.starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        };
        SourceTag {
            line: Rc::clone(&self.lines[idx]),
            column: (offset - self.starts[idx]) as u32 + 1,
        }
    }
}
