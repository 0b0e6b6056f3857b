use crate::diagnostic::{Diagnostic, ErrorCode};
use crate::lexeme::Lexeme;
use crate::span::{Span, Spanned};

/// Hand-written lexer over the C0 alphabet. The first lexical error aborts
/// the scan.
pub struct Lexer<'src> {
    source: &'src [u8],
    pos: usize,
}

impl<'src> Lexer<'src> {
    pub fn new(source: &'src str) -> Self {
        Self {
            source: source.as_bytes(),
            pos: 0,
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Spanned<Lexeme>>, Diagnostic> {
        let mut tokens = Vec::new();
        loop {
            let tok = self.next_token()?;
            let is_eof = tok.node == Lexeme::Eof;
            tokens.push(tok);
            if is_eof {
                break;
            }
        }
        Ok(tokens)
    }

    fn next_token(&mut self) -> Result<Spanned<Lexeme>, Diagnostic> {
        self.skip_whitespace_and_comments()?;

        if self.pos >= self.source.len() {
            return Ok(self.make_token(Lexeme::Eof, self.pos, self.pos));
        }

        let start = self.pos;
        let ch = self.source[self.pos];

        if ch.is_ascii_alphabetic() {
            return Ok(self.scan_ident_or_keyword());
        }
        if ch.is_ascii_digit() || (ch == b'.' && matches!(self.peek_at(1), Some(c) if c.is_ascii_digit()))
        {
            return self.scan_number();
        }
        if ch == b'\'' {
            return self.scan_char_literal();
        }
        if ch == b'"' {
            return self.scan_string_literal();
        }

        self.scan_symbol(start)
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<(), Diagnostic> {
        loop {
            while self.pos < self.source.len() && self.source[self.pos].is_ascii_whitespace() {
                self.pos += 1;
            }

            if self.pos + 1 < self.source.len() && self.source[self.pos] == b'/' {
                match self.source[self.pos + 1] {
                    b'/' => {
                        while self.pos < self.source.len() && self.source[self.pos] != b'\n' {
                            self.pos += 1;
                        }
                        continue;
                    }
                    b'*' => {
                        let start = self.pos;
                        self.pos += 2;
                        loop {
                            if self.pos + 1 >= self.source.len() {
                                return Err(Diagnostic::error(
                                    ErrorCode::UnterminatedComment,
                                    "unterminated block comment: missing '*/'",
                                    Span::new(start as u32, self.source.len() as u32),
                                )
                                .with_help("every '/*' must be closed with '*/'"));
                            }
                            if self.source[self.pos] == b'*' && self.source[self.pos + 1] == b'/' {
                                self.pos += 2;
                                break;
                            }
                            self.pos += 1;
                        }
                        continue;
                    }
                    _ => {}
                }
            }

            return Ok(());
        }
    }

    fn scan_ident_or_keyword(&mut self) -> Spanned<Lexeme> {
        let start = self.pos;
        while self.pos < self.source.len() && self.source[self.pos].is_ascii_alphanumeric() {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.source[start..self.pos]).unwrap();
        let token = Lexeme::from_keyword(text).unwrap_or_else(|| Lexeme::Ident(text.to_string()));
        self.make_token(token, start, self.pos)
    }

    fn scan_number(&mut self) -> Result<Spanned<Lexeme>, Diagnostic> {
        let start = self.pos;

        // Hexadecimal integer: 0x...
        if self.source[self.pos] == b'0'
            && matches!(self.peek_at(1), Some(b'x') | Some(b'X'))
        {
            self.pos += 2;
            let digits_start = self.pos;
            while self.pos < self.source.len() && self.source[self.pos].is_ascii_hexdigit() {
                self.pos += 1;
            }
            if self.pos == digits_start {
                return Err(self.bad_number(start, "hexadecimal literal needs at least one digit"));
            }
            let text = std::str::from_utf8(&self.source[digits_start..self.pos]).unwrap();
            let value = i64::from_str_radix(text, 16)
                .map_err(|_| self.bad_number(start, "hexadecimal literal is too large"))?;
            self.reject_trailing_ident(start)?;
            return Ok(self.make_token(Lexeme::Integer(value), start, self.pos));
        }

        while self.pos < self.source.len() && self.source[self.pos].is_ascii_digit() {
            self.pos += 1;
        }

        let has_fraction = self.pos < self.source.len() && self.source[self.pos] == b'.';
        let has_exponent = matches!(self.peek_at(0), Some(b'e') | Some(b'E'));

        if has_fraction || has_exponent {
            if has_fraction {
                self.pos += 1; // '.'
                while self.pos < self.source.len() && self.source[self.pos].is_ascii_digit() {
                    self.pos += 1;
                }
            }
            if matches!(self.peek_at(0), Some(b'e') | Some(b'E')) {
                self.pos += 1;
                if matches!(self.peek_at(0), Some(b'+') | Some(b'-')) {
                    self.pos += 1;
                }
                let exp_start = self.pos;
                while self.pos < self.source.len() && self.source[self.pos].is_ascii_digit() {
                    self.pos += 1;
                }
                if self.pos == exp_start {
                    return Err(self.bad_number(start, "exponent needs at least one digit"));
                }
            }
            let text = std::str::from_utf8(&self.source[start..self.pos]).unwrap();
            let value: f64 = text
                .parse()
                .map_err(|_| self.bad_number(start, "malformed floating literal"))?;
            self.reject_trailing_ident(start)?;
            return Ok(self.make_token(Lexeme::Float(value), start, self.pos));
        }

        let text = std::str::from_utf8(&self.source[start..self.pos]).unwrap();
        if text.len() > 1 && text.starts_with('0') {
            return Err(self.bad_number(start, "decimal literal cannot have a leading zero"));
        }
        let value: i64 = text
            .parse()
            .map_err(|_| self.bad_number(start, "integer literal is too large"))?;
        self.reject_trailing_ident(start)?;
        Ok(self.make_token(Lexeme::Integer(value), start, self.pos))
    }

    /// `123abc` is one bad token, not an integer followed by an identifier.
    fn reject_trailing_ident(&mut self, start: usize) -> Result<(), Diagnostic> {
        if self.pos < self.source.len() && self.source[self.pos].is_ascii_alphanumeric() {
            while self.pos < self.source.len() && self.source[self.pos].is_ascii_alphanumeric() {
                self.pos += 1;
            }
            return Err(self.bad_number(start, "identifiers cannot start with a digit"));
        }
        Ok(())
    }

    fn bad_number(&self, start: usize, why: &str) -> Diagnostic {
        Diagnostic::error(
            ErrorCode::BadNumber,
            format!("malformed numeric literal: {}", why),
            Span::new(start as u32, self.pos as u32),
        )
    }

    fn scan_char_literal(&mut self) -> Result<Spanned<Lexeme>, Diagnostic> {
        let start = self.pos;
        self.pos += 1; // opening quote

        let ch = match self.peek_at(0) {
            None | Some(b'\n') | Some(b'\'') => {
                return Err(Diagnostic::error(
                    ErrorCode::UnterminatedCharLiteral,
                    "char literal needs exactly one character",
                    Span::new(start as u32, self.pos as u32 + 1),
                )
                .with_help("char literals look like 'a' or '\\n'"));
            }
            Some(b'\\') => self.scan_escape(start)?,
            Some(c) => {
                self.pos += 1;
                c as char
            }
        };

        if self.peek_at(0) != Some(b'\'') {
            return Err(Diagnostic::error(
                ErrorCode::UnterminatedCharLiteral,
                "unterminated char literal: missing closing quote",
                Span::new(start as u32, self.pos as u32),
            ));
        }
        self.pos += 1;
        Ok(self.make_token(Lexeme::CharLit(ch), start, self.pos))
    }

    fn scan_string_literal(&mut self) -> Result<Spanned<Lexeme>, Diagnostic> {
        let start = self.pos;
        self.pos += 1; // opening quote
        let mut value = String::new();
        loop {
            match self.peek_at(0) {
                None | Some(b'\n') => {
                    return Err(Diagnostic::error(
                        ErrorCode::UnterminatedString,
                        "unterminated string literal: missing closing quote",
                        Span::new(start as u32, self.pos as u32),
                    ));
                }
                Some(b'"') => {
                    self.pos += 1;
                    break;
                }
                Some(b'\\') => value.push(self.scan_escape(start)?),
                Some(c) => {
                    self.pos += 1;
                    value.push(c as char);
                }
            }
        }
        Ok(self.make_token(Lexeme::Str(value), start, self.pos))
    }

    /// Scan `\\`, `\'`, `\"`, `\n`, `\r`, `\t` or `\xNN`. Cursor sits on the
    /// backslash on entry and past the escape on exit.
    fn scan_escape(&mut self, literal_start: usize) -> Result<char, Diagnostic> {
        self.pos += 1; // backslash
        let esc = self.peek_at(0).ok_or_else(|| {
            Diagnostic::error(
                ErrorCode::BadEscape,
                "escape sequence is missing its character",
                Span::new(literal_start as u32, self.pos as u32),
            )
        })?;
        self.pos += 1;
        match esc {
            b'\\' => Ok('\\'),
            b'\'' => Ok('\''),
            b'"' => Ok('"'),
            b'n' => Ok('\n'),
            b'r' => Ok('\r'),
            b't' => Ok('\t'),
            b'x' => {
                let h = self.peek_at(0);
                let l = self.peek_at(1);
                match (h, l) {
                    (Some(h), Some(l)) if h.is_ascii_hexdigit() && l.is_ascii_hexdigit() => {
                        self.pos += 2;
                        let digits = [h, l];
                        let text = std::str::from_utf8(&digits).unwrap();
                        Ok(u8::from_str_radix(text, 16).unwrap() as char)
                    }
                    _ => Err(Diagnostic::error(
                        ErrorCode::BadEscape,
                        "\\x escape needs two hex digits",
                        Span::new(literal_start as u32, self.pos as u32),
                    )),
                }
            }
            other => Err(Diagnostic::error(
                ErrorCode::BadEscape,
                format!("unknown escape sequence '\\{}'", other as char),
                Span::new(literal_start as u32, self.pos as u32),
            )
            .with_help("valid escapes are \\\\ \\' \\\" \\n \\r \\t \\xNN")),
        }
    }

    fn scan_symbol(&mut self, start: usize) -> Result<Spanned<Lexeme>, Diagnostic> {
        let ch = self.source[self.pos];
        self.pos += 1;

        let token = match ch {
            b'(' => Lexeme::LParen,
            b')' => Lexeme::RParen,
            b'{' => Lexeme::LBrace,
            b'}' => Lexeme::RBrace,
            b',' => Lexeme::Comma,
            b';' => Lexeme::Semicolon,
            b'+' => Lexeme::Plus,
            b'-' => Lexeme::Minus,
            b'*' => Lexeme::Star,
            b'/' => Lexeme::Slash,
            b'=' => {
                if self.peek_at(0) == Some(b'=') {
                    self.pos += 1;
                    Lexeme::EqEq
                } else {
                    Lexeme::Assign
                }
            }
            b'<' => {
                if self.peek_at(0) == Some(b'=') {
                    self.pos += 1;
                    Lexeme::Le
                } else {
                    Lexeme::Lt
                }
            }
            b'>' => {
                if self.peek_at(0) == Some(b'=') {
                    self.pos += 1;
                    Lexeme::Ge
                } else {
                    Lexeme::Gt
                }
            }
            b'!' => {
                if self.peek_at(0) == Some(b'=') {
                    self.pos += 1;
                    Lexeme::NotEq
                } else {
                    return Err(Diagnostic::error(
                        ErrorCode::InvalidCharacter,
                        "'!' is only valid as part of '!='",
                        Span::new(start as u32, self.pos as u32),
                    ));
                }
            }
            _ => {
                return Err(Diagnostic::error(
                    ErrorCode::InvalidCharacter,
                    format!("unexpected character '{}' (U+{:04X})", ch as char, ch),
                    Span::new(start as u32, self.pos as u32),
                )
                .with_help("this character is not part of the C0 alphabet"));
            }
        };

        Ok(self.make_token(token, start, self.pos))
    }

    fn peek_at(&self, ahead: usize) -> Option<u8> {
        self.source.get(self.pos + ahead).copied()
    }

    fn make_token(&self, token: Lexeme, start: usize, end: usize) -> Spanned<Lexeme> {
        Spanned::new(token, Span::new(start as u32, end as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(source: &str) -> Vec<Lexeme> {
        Lexer::new(source)
            .tokenize()
            .expect("unexpected lex error")
            .into_iter()
            .map(|t| t.node)
            .collect()
    }

    fn lex_err(source: &str) -> Diagnostic {
        Lexer::new(source).tokenize().expect_err("expected lex error")
    }

    #[test]
    fn test_keywords() {
        let tokens = lex("const int char double void if else while return scan print");
        assert_eq!(
            tokens,
            vec![
                Lexeme::Const,
                Lexeme::Int,
                Lexeme::Char,
                Lexeme::Double,
                Lexeme::Void,
                Lexeme::If,
                Lexeme::Else,
                Lexeme::While,
                Lexeme::Return,
                Lexeme::Scan,
                Lexeme::Print,
                Lexeme::Eof,
            ]
        );
    }

    #[test]
    fn test_reserved_words() {
        let tokens = lex("switch case default do for break continue struct");
        assert!(tokens[..tokens.len() - 1].iter().all(|t| t.is_reserved()));
    }

    #[test]
    fn test_symbols() {
        let tokens = lex("( ) { } , ; = == != < <= > >= + - * /");
        assert_eq!(
            tokens,
            vec![
                Lexeme::LParen,
                Lexeme::RParen,
                Lexeme::LBrace,
                Lexeme::RBrace,
                Lexeme::Comma,
                Lexeme::Semicolon,
                Lexeme::Assign,
                Lexeme::EqEq,
                Lexeme::NotEq,
                Lexeme::Lt,
                Lexeme::Le,
                Lexeme::Gt,
                Lexeme::Ge,
                Lexeme::Plus,
                Lexeme::Minus,
                Lexeme::Star,
                Lexeme::Slash,
                Lexeme::Eof,
            ]
        );
    }

    #[test]
    fn test_integers() {
        let tokens = lex("0 1 42 2147483647 0x1F 0XffffFFFF");
        assert_eq!(
            tokens,
            vec![
                Lexeme::Integer(0),
                Lexeme::Integer(1),
                Lexeme::Integer(42),
                Lexeme::Integer(2147483647),
                Lexeme::Integer(0x1F),
                Lexeme::Integer(0xFFFF_FFFF),
                Lexeme::Eof,
            ]
        );
    }

    #[test]
    fn test_floats() {
        let tokens = lex("0.5 3.  .25 1e3 2.5e-2");
        assert_eq!(
            tokens,
            vec![
                Lexeme::Float(0.5),
                Lexeme::Float(3.0),
                Lexeme::Float(0.25),
                Lexeme::Float(1e3),
                Lexeme::Float(2.5e-2),
                Lexeme::Eof,
            ]
        );
    }

    #[test]
    fn test_char_literals() {
        let tokens = lex(r"'a' '0' '\n' '\\' '\x41'");
        assert_eq!(
            tokens,
            vec![
                Lexeme::CharLit('a'),
                Lexeme::CharLit('0'),
                Lexeme::CharLit('\n'),
                Lexeme::CharLit('\\'),
                Lexeme::CharLit('A'),
                Lexeme::Eof,
            ]
        );
    }

    #[test]
    fn test_string_literal() {
        let tokens = lex(r#""hello\tworld""#);
        assert_eq!(
            tokens,
            vec![Lexeme::Str("hello\tworld".to_string()), Lexeme::Eof]
        );
    }

    #[test]
    fn test_comments() {
        let tokens = lex("foo // line comment\nbar /* block\ncomment */ baz");
        assert_eq!(
            tokens,
            vec![
                Lexeme::Ident("foo".into()),
                Lexeme::Ident("bar".into()),
                Lexeme::Ident("baz".into()),
                Lexeme::Eof,
            ]
        );
    }

    #[test]
    fn test_simple_program() {
        let tokens = lex("int main() { return 0; }");
        assert_eq!(tokens[0], Lexeme::Int);
        assert_eq!(tokens[1], Lexeme::Ident("main".into()));
        assert_eq!(tokens[2], Lexeme::LParen);
        assert_eq!(tokens[3], Lexeme::RParen);
        assert_eq!(tokens[4], Lexeme::LBrace);
    }

    #[test]
    fn test_spans_cover_tokens() {
        let tokens = Lexer::new("int abc").tokenize().unwrap();
        assert_eq!(tokens[0].span, Span::new(0, 3));
        assert_eq!(tokens[1].span, Span::new(4, 7));
    }

    // --- Error path tests ---

    #[test]
    fn test_error_unexpected_character() {
        let d = lex_err("int a @ 3;");
        assert_eq!(d.code, ErrorCode::InvalidCharacter);
        assert!(d.message.contains("'@'"), "got: {}", d.message);
    }

    #[test]
    fn test_error_unterminated_comment() {
        let d = lex_err("int a; /* no end");
        assert_eq!(d.code, ErrorCode::UnterminatedComment);
    }

    #[test]
    fn test_error_leading_zero() {
        let d = lex_err("007");
        assert_eq!(d.code, ErrorCode::BadNumber);
        assert!(d.message.contains("leading zero"), "got: {}", d.message);
    }

    #[test]
    fn test_error_digit_led_identifier() {
        let d = lex_err("int 1abc;");
        assert_eq!(d.code, ErrorCode::BadNumber);
        assert!(
            d.message.contains("start with a digit"),
            "got: {}",
            d.message
        );
    }

    #[test]
    fn test_error_unterminated_string() {
        let d = lex_err("\"no end");
        assert_eq!(d.code, ErrorCode::UnterminatedString);
    }

    #[test]
    fn test_error_empty_char() {
        let d = lex_err("''");
        assert_eq!(d.code, ErrorCode::UnterminatedCharLiteral);
    }

    #[test]
    fn test_error_bad_escape() {
        let d = lex_err(r"'\q'");
        assert_eq!(d.code, ErrorCode::BadEscape);
        assert!(d.help.is_some());
    }

    #[test]
    fn test_error_bare_bang() {
        let d = lex_err("a ! b");
        assert_eq!(d.code, ErrorCode::InvalidCharacter);
        assert!(d.message.contains("'!='"), "got: {}", d.message);
    }
}
