use std::fmt;

/// A cursor position inside one source file. `line` and `column` are
/// 1-based, `offset` counts bytes from the start of the file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FilePos {
    pub offset: usize,
    pub line: usize,
    pub column: usize,
}

impl FilePos {
    pub fn new(offset: usize, line: usize, column: usize) -> Self {
        Self {
            offset,
            line,
            column,
        }
    }

    pub fn start_of_file() -> Self {
        Self {
            offset: 0,
            line: 1,
            column: 1,
        }
    }
}

impl fmt::Display for FilePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceLocation {
    pub filename: String,
    pub begin: FilePos,
    pub end: FilePos,
}

impl SourceLocation {
    pub fn new(filename: impl Into<String>, begin: FilePos, end: FilePos) -> Self {
        Self {
            filename: filename.into(),
            begin,
            end,
        }
    }

    /// Extends this location to `end` and returns a copy, so parse
    /// functions can write `loc.update(self.end())` when a node is done.
    pub fn update(&mut self, end: FilePos) -> SourceLocation {
        self.end = end;
        self.clone()
    }

    pub fn union(&self, other: &SourceLocation) -> SourceLocation {
        let mut result = self.clone();
        if other.begin.offset < result.begin.offset {
            result.begin = other.begin;
        }
        if other.end.offset > result.end.offset {
            result.end = other.end;
        }
        result
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.filename.is_empty() {
            write!(f, "{}", self.begin)
        } else {
            write!(f, "{}:{}", self.filename, self.begin)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_extends_end() {
        let mut loc = SourceLocation::new("test.flow", FilePos::new(0, 1, 1), FilePos::new(0, 1, 1));
        let updated = loc.update(FilePos::new(10, 2, 3));
        assert_eq!(updated.end, FilePos::new(10, 2, 3));
        assert_eq!(loc.end, FilePos::new(10, 2, 3));
    }

    #[test]
    fn display_includes_filename() {
        let loc = SourceLocation::new("a.flow", FilePos::new(0, 3, 7), FilePos::new(1, 3, 8));
        assert_eq!(loc.to_string(), "a.flow:3:7");
    }
}
