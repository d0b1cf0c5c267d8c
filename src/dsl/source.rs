//! Position mapping for stitched multi-file compilation units.
//!
//! Every file in a unit is preceded by a `#__FILE__ <path>` marker. Offsets in
//! the stitched text are mapped back to a file name and a line relative to
//! that file's first line.

use serde::Serialize;
use ts_rs::TS;

use super::ast::Span;

pub const FILE_MARKER: &str = "#__FILE__ ";

/// Name used for text that appears before any file marker.
pub const UNNAMED_FILE: &str = "<input>";

/// One physical file inside a stitched unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, TS)]
#[ts(export)]
pub struct FileIdent {
    pub name: String,
    /// Stitched line (1-based) directly preceding the file's first line.
    pub start_line: u32,
}

/// A position already re-based onto its owning file. Lines and columns are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, TS)]
#[ts(export)]
pub struct SourcePos {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub end_column: u32,
}

impl std::fmt::Display for SourcePos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = std::path::Path::new(&self.file)
            .file_name()
            .map_or_else(|| self.file.clone(), |n| n.to_string_lossy().into_owned());
        write!(f, "{}:{}:{}", name, self.line, self.column)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SourceMap {
    text: String,
    line_starts: Vec<usize>,
    files: Vec<FileIdent>,
}

/// Lexical state while looking for file markers.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Scan {
    Code,
    LineComment,
    BlockComment,
    Str,
}

impl SourceMap {
    pub fn new(source: &str) -> Self {
        let bytes = source.as_bytes();
        let mut line_starts = vec![0];
        let mut files = Vec::new();
        let mut state = Scan::Code;
        let mut i = 0;
        while let Some(&b) = bytes.get(i) {
            let at_line_start = i == 0 || bytes.get(i - 1) == Some(&b'\n');
            // markers only count where the lexer would read them as code
            if at_line_start && state == Scan::Code {
                if let Some(rest) = source.get(i..).and_then(|r| r.strip_prefix(FILE_MARKER)) {
                    let path = rest.split('\n').next().unwrap_or_default();
                    files.push(FileIdent {
                        name: path.trim_end().to_string(),
                        start_line: line_starts.len() as u32 + 1,
                    });
                    i += FILE_MARKER.len() + path.len();
                    continue;
                }
            }
            let next = bytes.get(i + 1).copied();
            match (state, b) {
                (_, b'\n') => {
                    line_starts.push(i + 1);
                    if state == Scan::LineComment {
                        state = Scan::Code;
                    }
                }
                (Scan::Code, b'/') if next == Some(b'/') => state = Scan::LineComment,
                (Scan::Code, b'/') if next == Some(b'*') => {
                    state = Scan::BlockComment;
                    i += 1;
                }
                // path directives run to end of line, quotes and all
                (Scan::Code, b'#')
                    if source.get(i + 1..).is_some_and(|r| r.starts_with("out ") || r.starts_with("extends ")) =>
                {
                    state = Scan::LineComment;
                }
                (Scan::Code, b'"') => state = Scan::Str,
                (Scan::Str, b'"') => state = Scan::Code,
                (Scan::BlockComment, b'*') if next == Some(b'/') => {
                    state = Scan::Code;
                    i += 1;
                }
                _ => {}
            }
            i += 1;
        }
        Self {
            text: source.to_string(),
            line_starts,
            files,
        }
    }

    /// Stitched 1-based (line, column) of a byte offset. Columns count chars.
    pub fn line_col(&self, offset: usize) -> (u32, u32) {
        let idx = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        };
        let line_start = self.line_starts.get(idx).copied().unwrap_or(0);
        (idx as u32 + 1, self.chars_between(line_start, offset) + 1)
    }

    fn chars_between(&self, start: usize, end: usize) -> u32 {
        match self.text.get(start..end) {
            Some(slice) => slice.chars().count() as u32,
            None => end.saturating_sub(start) as u32,
        }
    }

    /// File owning a stitched line: the last marker at or before it.
    pub fn file_for_line(&self, line: u32) -> Option<&FileIdent> {
        self.files.iter().rev().find(|f| f.start_line <= line + 1)
    }

    pub fn files(&self) -> &[FileIdent] {
        &self.files
    }

    pub fn position(&self, span: Span) -> SourcePos {
        let (line, column) = self.line_col(span.start);
        let width = self.chars_between(span.start, span.end).max(1);
        match self.file_for_line(line) {
            Some(file) => SourcePos {
                file: file.name.clone(),
                line: line.saturating_sub(file.start_line),
                column,
                end_column: column + width,
            },
            None => SourcePos {
                file: UNNAMED_FILE.to_string(),
                line,
                column,
                end_column: column + width,
            },
        }
    }
}

/// Concatenate `(path, content)` pairs into one unit, each behind a file marker.
pub fn stitch<'a, I>(files: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut out = String::new();
    for (path, content) in files {
        out.push_str("\n\n");
        out.push_str(FILE_MARKER);
        out.push_str(path);
        out.push_str("\n\n");
        out.push_str(content);
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_line_col() {
        let map = SourceMap::new("ab\ncd\n\nef");
        assert_eq!(map.line_col(0), (1, 1));
        assert_eq!(map.line_col(1), (1, 2));
        assert_eq!(map.line_col(3), (2, 1));
        assert_eq!(map.line_col(7), (4, 1));
    }

    #[test]
    fn test_stitched_positions_rebase_per_file() {
        let text = stitch([("/x/a.rai", "one\ntwo"), ("/x/b.rai", "three")]);
        let map = SourceMap::new(&text);
        assert_eq!(map.files().len(), 2);

        let two = text.find("two").unwrap();
        let pos = map.position(Span::new(two, two + 3));
        assert_eq!(pos.file, "/x/a.rai");
        assert_eq!(pos.line, 2);
        assert_eq!(pos.column, 1);
        assert_eq!(pos.end_column, 4);

        let three = text.find("three").unwrap();
        let pos = map.position(Span::new(three, three + 5));
        assert_eq!(pos.file, "/x/b.rai");
        assert_eq!(pos.line, 1);
    }

    #[test]
    fn test_markers_inside_strings_and_comments_ignored() {
        let content = "let s = \"\n#__FILE__ fake\n\"\n/*\n#__FILE__ fake\n*/\nx";
        let text = stitch([("/x/a.rai", content)]);
        let map = SourceMap::new(&text);
        assert_eq!(map.files().len(), 1);

        let x = text.rfind('x').unwrap();
        let pos = map.position(Span::new(x, x + 1));
        assert_eq!(pos.file, "/x/a.rai");
        assert_eq!(pos.line, 7);
    }

    #[test]
    fn test_columns_count_chars() {
        let text = "\"héllo\" ab";
        let map = SourceMap::new(text);
        let a = text.find("ab").unwrap();
        let pos = map.position(Span::new(a, a + 2));
        assert_eq!(pos.column, 9);
        assert_eq!(pos.end_column, 11);

        let pos = map.position(Span::new(0, a - 1));
        assert_eq!(pos.end_column, 8);
    }

    #[test]
    fn test_unmarked_text() {
        let map = SourceMap::new("a\nb");
        let pos = map.position(Span::new(2, 3));
        assert_eq!(pos.file, UNNAMED_FILE);
        assert_eq!(pos.line, 2);
    }

    #[test]
    fn test_display_uses_file_name() {
        let pos = SourcePos {
            file: "/dir/main.rai".into(),
            line: 3,
            column: 7,
            end_column: 9,
        };
        assert_eq!(pos.to_string(), "main.rai:3:7");
    }
}
