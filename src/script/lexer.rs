/*!
 * Lexer
 * Source text to tokens for the script front-end
 */

use miette::Diagnostic;
use std::rc::Rc;
use thiserror::Error;

/// Malformed source text
#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
#[error("SyntaxError: {message} (line {line})")]
#[diagnostic(code(script::syntax))]
pub struct SyntaxError {
    pub message: String,
    pub line: u32,
}

impl SyntaxError {
    pub fn new(message: impl Into<String>, line: u32) -> Self {
        Self {
            message: message.into(),
            line,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Text(Rc<str>),
    /// Raw source of a `${...}` substitution, parsed separately
    Expr { source: String, line: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Str(Rc<str>),
    Template(Vec<TemplatePart>),
    /// Identifiers and keywords alike; the parser tells them apart
    Ident(Rc<str>),
    Punct(&'static str),
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Lexeme {
    pub token: Token,
    pub line: u32,
    /// A line terminator precedes this token (drives semicolon insertion)
    pub newline_before: bool,
}

/// Longest first so that greedy matching picks the right operator
const PUNCTUATORS: &[&str] = &[
    ">>>=", "...", "===", "!==", "**=", "<<=", ">>=", ">>>", "&&=", "||=", "??=", "=>", "==",
    "!=", "<=", ">=", "&&", "||", "??", "?.", "++", "--", "+=", "-=", "*=", "/=", "%=", "&=",
    "|=", "^=", "**", "<<", ">>", "{", "}", "(", ")", "[", "]", ";", ",", "<", ">", "+", "-",
    "*", "/", "%", "&", "|", "^", "!", "~", "?", ":", "=", ".",
];

pub fn tokenize(source: &str, first_line: u32) -> Result<Vec<Lexeme>, SyntaxError> {
    Lexer {
        src: source,
        pos: 0,
        line: first_line,
    }
    .run()
}

struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    line: u32,
}

impl<'a> Lexer<'a> {
    fn run(mut self) -> Result<Vec<Lexeme>, SyntaxError> {
        let mut out = Vec::new();
        if self.src.starts_with("#!") {
            self.skip_line();
        }
        loop {
            let newline_before = self.skip_trivia()?;
            let line = self.line;
            let Some(c) = self.peek() else {
                out.push(Lexeme {
                    token: Token::Eof,
                    line,
                    newline_before: true,
                });
                return Ok(out);
            };

            let token = if is_ident_start(c) {
                Token::Ident(Rc::from(self.ident()))
            } else if c.is_ascii_digit()
                || (c == '.' && self.peek_at(1).is_some_and(|d| d.is_ascii_digit()))
            {
                Token::Number(self.number()?)
            } else if c == '"' || c == '\'' {
                Token::Str(Rc::from(self.string(c)?))
            } else if c == '`' {
                Token::Template(self.template()?)
            } else {
                Token::Punct(self.punct()?)
            };

            out.push(Lexeme {
                token,
                line,
                newline_before,
            });
        }
    }

    #[inline]
    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    #[inline]
    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn peek_at(&self, n: usize) -> Option<char> {
        self.rest().chars().nth(n)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError::new(message, self.line)
    }

    fn skip_line(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.bump();
        }
    }

    /// Skip whitespace and comments; reports whether a newline was crossed
    fn skip_trivia(&mut self) -> Result<bool, SyntaxError> {
        let start_line = self.line;
        loop {
            let rest = self.rest();
            if rest.starts_with("//") {
                self.skip_line();
            } else if rest.starts_with("/*") {
                let Some(end) = rest[2..].find("*/") else {
                    return Err(self.error("Unterminated comment"));
                };
                let comment = &rest[..end + 4];
                self.line += comment.matches('\n').count() as u32;
                self.pos += comment.len();
            } else if self.peek().is_some_and(char::is_whitespace) {
                self.bump();
            } else {
                return Ok(self.line != start_line);
            }
        }
    }

    fn ident(&mut self) -> &'a str {
        let start = self.pos;
        while self.peek().is_some_and(is_ident_part) {
            self.bump();
        }
        &self.src[start..self.pos]
    }

    fn number(&mut self) -> Result<f64, SyntaxError> {
        let rest = self.rest();
        let radix = match rest.get(..2) {
            Some("0x") | Some("0X") => Some(16),
            Some("0b") | Some("0B") => Some(2),
            Some("0o") | Some("0O") => Some(8),
            _ => None,
        };

        if let Some(radix) = radix {
            self.pos += 2;
            let start = self.pos;
            while self.peek().is_some_and(|c| c.is_digit(radix) || c == '_') {
                self.bump();
            }
            let digits = &self.src[start..self.pos];
            if digits.is_empty() {
                return Err(self.error("Missing digits after radix prefix"));
            }
            return Ok(digits
                .chars()
                .filter_map(|c| c.to_digit(radix))
                .fold(0.0, |acc, d| acc * radix as f64 + d as f64));
        }

        let start = self.pos;
        let mut seen_dot = false;
        let mut seen_exp = false;
        while let Some(c) = self.peek() {
            match c {
                '0'..='9' | '_' => {}
                '.' if !seen_dot && !seen_exp => seen_dot = true,
                'e' | 'E' if !seen_exp => {
                    seen_exp = true;
                    if matches!(self.peek_at(1), Some('+') | Some('-')) {
                        self.bump();
                    }
                }
                _ => break,
            }
            self.bump();
        }
        if self.peek().is_some_and(is_ident_start) {
            return Err(self.error("Identifier starts immediately after numeric literal"));
        }
        let text: String = self.src[start..self.pos].chars().filter(|c| *c != '_').collect();
        text.parse::<f64>()
            .map_err(|_| self.error(format!("Invalid number '{}'", text)))
    }

    fn escape(&mut self, out: &mut String) -> Result<(), SyntaxError> {
        let Some(c) = self.bump() else {
            return Err(self.error("Unterminated escape sequence"));
        };
        match c {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'b' => out.push('\u{8}'),
            'f' => out.push('\u{c}'),
            'v' => out.push('\u{b}'),
            '0' => out.push('\0'),
            '\n' => {}
            'x' => {
                let code = self.hex_digits(2)?;
                out.push(char::from_u32(code).unwrap_or('\u{fffd}'));
            }
            'u' => {
                let code = if self.peek() == Some('{') {
                    self.bump();
                    let start = self.pos;
                    while self.peek().is_some_and(|c| c.is_ascii_hexdigit()) {
                        self.bump();
                    }
                    let digits = &self.src[start..self.pos];
                    if self.bump() != Some('}') {
                        return Err(self.error("Malformed unicode escape"));
                    }
                    u32::from_str_radix(digits, 16)
                        .map_err(|_| self.error("Malformed unicode escape"))?
                } else {
                    self.hex_digits(4)?
                };
                out.push(char::from_u32(code).unwrap_or('\u{fffd}'));
            }
            other => out.push(other),
        }
        Ok(())
    }

    fn hex_digits(&mut self, count: usize) -> Result<u32, SyntaxError> {
        let start = self.pos;
        for _ in 0..count {
            match self.peek() {
                Some(c) if c.is_ascii_hexdigit() => {
                    self.bump();
                }
                _ => return Err(self.error("Malformed hexadecimal escape")),
            }
        }
        u32::from_str_radix(&self.src[start..self.pos], 16)
            .map_err(|_| self.error("Malformed hexadecimal escape"))
    }

    fn string(&mut self, quote: char) -> Result<String, SyntaxError> {
        self.bump();
        let mut out = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => return Err(self.error("Unterminated string literal")),
                Some(c) if c == quote => return Ok(out),
                Some('\\') => self.escape(&mut out)?,
                Some(c) => out.push(c),
            }
        }
    }

    fn template(&mut self) -> Result<Vec<TemplatePart>, SyntaxError> {
        self.bump();
        let mut parts = Vec::new();
        let mut text = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error("Unterminated template literal")),
                Some('`') => {
                    self.bump();
                    break;
                }
                Some('\\') => {
                    self.bump();
                    self.escape(&mut text)?;
                }
                Some('$') if self.peek_at(1) == Some('{') => {
                    self.pos += 2;
                    if !text.is_empty() {
                        parts.push(TemplatePart::Text(Rc::from(std::mem::take(&mut text))));
                    }
                    let line = self.line;
                    let source = self.substitution()?;
                    parts.push(TemplatePart::Expr { source, line });
                }
                Some(c) => {
                    text.push(c);
                    self.bump();
                }
            }
        }
        if !text.is_empty() || parts.is_empty() {
            parts.push(TemplatePart::Text(Rc::from(text)));
        }
        Ok(parts)
    }

    /// Raw text up to the `}` closing a `${`, skipping nested braces and quotes
    fn substitution(&mut self) -> Result<String, SyntaxError> {
        let start = self.pos;
        let mut depth = 0usize;
        loop {
            match self.peek() {
                None => return Err(self.error("Unterminated template substitution")),
                Some('{') => depth += 1,
                Some('}') if depth == 0 => {
                    let source = self.src[start..self.pos].to_string();
                    self.bump();
                    return Ok(source);
                }
                Some('}') => depth -= 1,
                Some(q @ ('"' | '\'')) => {
                    self.string(q)?;
                    continue;
                }
                Some('`') => {
                    self.template()?;
                    continue;
                }
                _ => {}
            }
            self.bump();
        }
    }

    fn punct(&mut self) -> Result<&'static str, SyntaxError> {
        let rest = self.rest();
        for p in PUNCTUATORS {
            if rest.starts_with(p) {
                // `a?.5:b` is a conditional, not optional chaining
                if *p == "?."
                    && rest[2..].chars().next().is_some_and(|c| c.is_ascii_digit())
                {
                    continue;
                }
                self.pos += p.len();
                return Ok(p);
            }
        }
        let c = self.peek().unwrap_or('\0');
        Err(self.error(format!("Unexpected character '{}'", c)))
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_ident_part(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(src: &str) -> Vec<Token> {
        tokenize(src, 1).unwrap().into_iter().map(|l| l.token).collect()
    }

    #[test]
    fn test_basic_tokens() {
        assert_eq!(
            tokens("let x = 0x1F + 2.5e1;"),
            vec![
                Token::Ident("let".into()),
                Token::Ident("x".into()),
                Token::Punct("="),
                Token::Number(31.0),
                Token::Punct("+"),
                Token::Number(25.0),
                Token::Punct(";"),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_longest_punctuator_wins() {
        assert_eq!(
            tokens("a >>>= b ?? c"),
            vec![
                Token::Ident("a".into()),
                Token::Punct(">>>="),
                Token::Ident("b".into()),
                Token::Punct("??"),
                Token::Ident("c".into()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(tokens(r#"'a\nA\x42'"#)[0], Token::Str("a\nAB".into()));
    }

    #[test]
    fn test_template_parts() {
        let Token::Template(parts) = &tokens("`a ${ {x: 1}.x } b`")[0] else {
            panic!("expected template");
        };
        assert_eq!(parts.len(), 3);
        assert!(matches!(&parts[1], TemplatePart::Expr { source, .. } if source.trim() == "{x: 1}.x"));
    }

    #[test]
    fn test_newline_tracking_and_comments() {
        let lexemes = tokenize("a // one\n/* two\n three */ b", 1).unwrap();
        assert!(!lexemes[0].newline_before);
        assert!(lexemes[1].newline_before);
        assert_eq!(lexemes[1].line, 3);
    }

    #[test]
    fn test_unterminated_string_is_error() {
        let err = tokenize("'abc", 1).unwrap_err();
        assert_eq!(err.line, 1);
    }

    #[test]
    fn test_optional_chain_versus_conditional() {
        assert_eq!(tokens("a?.b")[1], Token::Punct("?."));
        assert_eq!(tokens("a?.5:1")[1], Token::Punct("?"));
    }
}
