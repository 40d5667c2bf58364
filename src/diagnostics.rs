use crate::language::span::SourceLocation;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiagnosticKind {
    TokenError,
    SyntaxError,
    TypeError,
    Warning,
    LinkError,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DiagnosticKind::TokenError => "TokenError",
            DiagnosticKind::SyntaxError => "SyntaxError",
            DiagnosticKind::TypeError => "TypeError",
            DiagnosticKind::Warning => "Warning",
            DiagnosticKind::LinkError => "LinkError",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, Eq)]
pub struct Message {
    pub kind: DiagnosticKind,
    pub location: SourceLocation,
    pub text: String,
}

impl Message {
    pub fn new(kind: DiagnosticKind, location: SourceLocation, text: impl Into<String>) -> Self {
        Self {
            kind,
            location,
            text: text.into(),
        }
    }
}

/// Equality disregards the filename and end position, so expectations in
/// tests only pin the kind, start position and text.
impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.location.begin == other.location.begin
            && self.text == other.text
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DiagnosticKind::Warning => write!(f, "[{}] {}", self.location, self.text),
            DiagnosticKind::LinkError => write!(f, "{}: {}", self.kind, self.text),
            _ => write!(f, "[{}] {}: {}", self.location, self.kind, self.text),
        }
    }
}

/// Sink for compilation diagnostics. Every pipeline stage reports into one
/// of these; anything but a warning counts as a failure.
pub trait Report {
    fn push(&mut self, message: Message);
    fn contains_failures(&self) -> bool;

    fn token_error(&mut self, location: SourceLocation, text: String) {
        self.push(Message::new(DiagnosticKind::TokenError, location, text));
    }

    fn syntax_error(&mut self, location: SourceLocation, text: String) {
        self.push(Message::new(DiagnosticKind::SyntaxError, location, text));
    }

    fn type_error(&mut self, location: SourceLocation, text: String) {
        self.push(Message::new(DiagnosticKind::TypeError, location, text));
    }

    fn warning(&mut self, location: SourceLocation, text: String) {
        self.push(Message::new(DiagnosticKind::Warning, location, text));
    }

    fn link_error(&mut self, text: String) {
        self.push(Message::new(
            DiagnosticKind::LinkError,
            SourceLocation::default(),
            text,
        ));
    }
}

/// Writes one line per message to stderr, prefixed `Error:` or `Warning:`.
#[derive(Default)]
pub struct ConsoleReport {
    error_count: usize,
}

impl ConsoleReport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Report for ConsoleReport {
    fn push(&mut self, message: Message) {
        if message.kind != DiagnosticKind::Warning {
            self.error_count += 1;
            eprintln!("Error: {}", message);
        } else {
            eprintln!("Warning: {}", message);
        }
    }

    fn contains_failures(&self) -> bool {
        self.error_count != 0
    }
}

/// Collects messages for later inspection; the test harness's sink.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BufferedReport {
    messages: Vec<Message>,
}

impl BufferedReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn contains(&self, message: &Message) -> bool {
        self.messages.iter().any(|m| m == message)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }
}

impl Report for BufferedReport {
    fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    fn contains_failures(&self) -> bool {
        self.messages
            .iter()
            .any(|m| m.kind != DiagnosticKind::Warning)
    }
}

impl fmt::Display for BufferedReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for message in &self.messages {
            if message.kind == DiagnosticKind::Warning {
                writeln!(f, "Warning: {}", message)?;
            } else {
                writeln!(f, "Error: {}", message)?;
            }
        }
        Ok(())
    }
}

/// Messages present only in `first` and only in `second`, for golden-file
/// style comparisons.
pub fn difference(first: &BufferedReport, second: &BufferedReport) -> (Vec<Message>, Vec<Message>) {
    let only_in_first = first
        .iter()
        .filter(|m| !second.contains(m))
        .cloned()
        .collect();
    let only_in_second = second
        .iter()
        .filter(|m| !first.contains(m))
        .cloned()
        .collect();
    (only_in_first, only_in_second)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::span::FilePos;

    fn loc(line: usize, column: usize) -> SourceLocation {
        SourceLocation::new("t", FilePos::new(0, line, column), FilePos::new(0, line, column))
    }

    #[test]
    fn warnings_are_not_failures() {
        let mut report = BufferedReport::new();
        report.warning(loc(1, 1), "beware".into());
        assert!(!report.contains_failures());
        report.type_error(loc(1, 2), "boom".into());
        assert!(report.contains_failures());
    }

    #[test]
    fn message_equality_ignores_filename_and_end() {
        let a = Message::new(
            DiagnosticKind::TypeError,
            SourceLocation::new("a", FilePos::new(0, 1, 1), FilePos::new(5, 1, 6)),
            "boom",
        );
        let b = Message::new(
            DiagnosticKind::TypeError,
            SourceLocation::new("b", FilePos::new(0, 1, 1), FilePos::new(9, 2, 1)),
            "boom",
        );
        assert_eq!(a, b);
    }

    #[test]
    fn difference_reports_both_sides() {
        let mut first = BufferedReport::new();
        let mut second = BufferedReport::new();
        first.type_error(loc(1, 1), "only first".into());
        first.type_error(loc(2, 1), "shared".into());
        second.type_error(loc(2, 1), "shared".into());
        second.syntax_error(loc(3, 1), "only second".into());

        let (a, b) = difference(&first, &second);
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].text, "only first");
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].text, "only second");
    }
}
