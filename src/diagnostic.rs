use crate::span::Span;

/// Stable error categories. Every compile-time failure carries one; the code
/// names what went wrong, the message says where the analyser was.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    // Lexical
    InvalidCharacter,
    UnterminatedComment,
    UnterminatedCharLiteral,
    UnterminatedString,
    BadEscape,
    BadNumber,
    // Syntactic
    NoSemicolon,
    NoRightParen,
    NoRightBrace,
    InvalidDeclaration,
    IncompleteExpression,
    ConditionExpected,
    NeedIdentifier,
    UnsupportedStatement,
    // Semantic
    NotDeclared,
    NotInitialized,
    AssignToConstant,
    DuplicateDeclaration,
    ConstantNeedValue,
    NeedVarType,
    FunctionParams,
    IntegerOverflow,
    Void,
    NeedMain,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidCharacter => "InvalidCharacter",
            ErrorCode::UnterminatedComment => "UnterminatedComment",
            ErrorCode::UnterminatedCharLiteral => "UnterminatedCharLiteral",
            ErrorCode::UnterminatedString => "UnterminatedString",
            ErrorCode::BadEscape => "BadEscape",
            ErrorCode::BadNumber => "BadNumber",
            ErrorCode::NoSemicolon => "NoSemicolon",
            ErrorCode::NoRightParen => "NoRightParen",
            ErrorCode::NoRightBrace => "NoRightBrace",
            ErrorCode::InvalidDeclaration => "InvalidDeclaration",
            ErrorCode::IncompleteExpression => "IncompleteExpression",
            ErrorCode::ConditionExpected => "ConditionExpected",
            ErrorCode::NeedIdentifier => "NeedIdentifier",
            ErrorCode::UnsupportedStatement => "UnsupportedStatement",
            ErrorCode::NotDeclared => "NotDeclared",
            ErrorCode::NotInitialized => "NotInitialized",
            ErrorCode::AssignToConstant => "AssignToConstant",
            ErrorCode::DuplicateDeclaration => "DuplicateDeclaration",
            ErrorCode::ConstantNeedValue => "ConstantNeedValue",
            ErrorCode::NeedVarType => "NeedVarType",
            ErrorCode::FunctionParams => "FunctionParams",
            ErrorCode::IntegerOverflow => "IntegerOverflow",
            ErrorCode::Void => "Void",
            ErrorCode::NeedMain => "NeedMain",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A compiler diagnostic. The first one raised aborts the pass.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub code: ErrorCode,
    pub message: String,
    pub span: Span,
    pub help: Option<String>,
}

impl Diagnostic {
    pub fn error(code: ErrorCode, message: impl Into<String>, span: Span) -> Self {
        Self {
            code,
            message: message.into(),
            span,
            help: None,
        }
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Render the diagnostic to stderr using ariadne.
    pub fn render(&self, filename: &str, source: &str) {
        use ariadne::{Color, Label, Report, ReportKind, Source};

        let mut report = Report::build(ReportKind::Error, filename, self.span.start as usize)
            .with_code(self.code.as_str())
            .with_message(&self.message)
            .with_label(
                Label::new((filename, self.span.start as usize..self.span.end as usize))
                    .with_message(&self.message)
                    .with_color(Color::Red),
            );

        if let Some(help) = &self.help {
            report = report.with_help(help);
        }

        report
            .finish()
            .eprint((filename, Source::from(source)))
            .ok();
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for Diagnostic {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let span = Span::new(10, 15);
        let d = Diagnostic::error(ErrorCode::NotDeclared, "unknown variable 'x'", span);
        assert_eq!(d.code, ErrorCode::NotDeclared);
        assert_eq!(d.message, "unknown variable 'x'");
        assert_eq!(d.span.start, 10);
        assert_eq!(d.span.end, 15);
        assert!(d.help.is_none());
    }

    #[test]
    fn test_with_help() {
        let d = Diagnostic::error(ErrorCode::NoSemicolon, "expected ';'", Span::dummy())
            .with_help("statements end with a semicolon");
        assert_eq!(d.help.as_deref(), Some("statements end with a semicolon"));
    }

    #[test]
    fn test_display_carries_code() {
        let d = Diagnostic::error(ErrorCode::AssignToConstant, "'a' is const", Span::dummy());
        let s = d.to_string();
        assert!(s.contains("AssignToConstant"));
        assert!(s.contains("'a' is const"));
    }

    #[test]
    fn test_render_does_not_panic() {
        let source = "int main() { return x; }\n";
        let d = Diagnostic::error(ErrorCode::NotDeclared, "unknown variable 'x'", Span::new(20, 21))
            .with_help("declare the variable before using it");
        d.render("test.c0", source);
    }
}
