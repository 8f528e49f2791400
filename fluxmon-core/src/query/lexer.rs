//! Tokenizer for the query language

use crate::QueryError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Number(f64),
    Str(String),
    /// Duration in milliseconds, e.g. `5m` or `1h30m`
    Duration(i64),
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    /// `=` inside label matchers
    Assign,
    Eq,
    Ne,
    RegexMatch,
    RegexNoMatch,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eof,
}

/// A token and the character offset it starts at
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub pos: usize,
}

pub struct Lexer<'a> {
    chars: Vec<char>,
    pos: usize,
    _src: &'a str,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self {
            chars: src.chars().collect(),
            pos: 0,
            _src: src,
        }
    }

    /// Tokenize the whole input; the last token is always `Eof`
    pub fn tokenize(mut self) -> Result<Vec<Token>, QueryError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_whitespace();
            let start = self.pos;
            let Some(c) = self.peek() else {
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    pos: start,
                });
                return Ok(tokens);
            };

            let kind = match c {
                '(' => self.single(TokenKind::LParen),
                ')' => self.single(TokenKind::RParen),
                '{' => self.single(TokenKind::LBrace),
                '}' => self.single(TokenKind::RBrace),
                '[' => self.single(TokenKind::LBracket),
                ']' => self.single(TokenKind::RBracket),
                ',' => self.single(TokenKind::Comma),
                '+' => self.single(TokenKind::Add),
                '-' => self.single(TokenKind::Sub),
                '*' => self.single(TokenKind::Mul),
                '/' => self.single(TokenKind::Div),
                '%' => self.single(TokenKind::Mod),
                '^' => self.single(TokenKind::Pow),
                '=' => {
                    self.pos += 1;
                    match self.peek() {
                        Some('=') => self.single(TokenKind::Eq),
                        Some('~') => self.single(TokenKind::RegexMatch),
                        _ => TokenKind::Assign,
                    }
                }
                '!' => {
                    self.pos += 1;
                    match self.peek() {
                        Some('=') => self.single(TokenKind::Ne),
                        Some('~') => self.single(TokenKind::RegexNoMatch),
                        _ => return Err(QueryError::parse(start, "unexpected character '!'")),
                    }
                }
                '<' => {
                    self.pos += 1;
                    if self.peek() == Some('=') {
                        self.single(TokenKind::Le)
                    } else {
                        TokenKind::Lt
                    }
                }
                '>' => {
                    self.pos += 1;
                    if self.peek() == Some('=') {
                        self.single(TokenKind::Ge)
                    } else {
                        TokenKind::Gt
                    }
                }
                '"' | '\'' => self.string(c)?,
                '`' => self.raw_string()?,
                '#' => {
                    // comment to end of line
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                    continue;
                }
                c if c.is_ascii_digit() || (c == '.' && self.peek_at(1).map_or(false, |d| d.is_ascii_digit())) => {
                    self.number_or_duration()?
                }
                c if c.is_alphabetic() || c == '_' || c == ':' => self.ident(),
                other => {
                    return Err(QueryError::parse(start, format!("unexpected character {:?}", other)));
                }
            };
            tokens.push(Token { kind, pos: start });
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.pos += 1;
        kind
    }

    fn skip_whitespace(&mut self) {
        while self.peek().map_or(false, |c| c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn ident(&mut self) -> TokenKind {
        let start = self.pos;
        while self
            .peek()
            .map_or(false, |c| c.is_alphanumeric() || c == '_' || c == ':')
        {
            self.pos += 1;
        }
        TokenKind::Ident(self.chars[start..self.pos].iter().collect())
    }

    fn string(&mut self, quote: char) -> Result<TokenKind, QueryError> {
        let start = self.pos;
        self.pos += 1;
        let mut out = String::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(QueryError::parse(start, "unterminated quoted string"));
            };
            self.pos += 1;
            match c {
                c if c == quote => return Ok(TokenKind::Str(out)),
                '\\' => {
                    let Some(esc) = self.peek() else {
                        return Err(QueryError::parse(start, "unterminated quoted string"));
                    };
                    self.pos += 1;
                    match esc {
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        '\\' => out.push('\\'),
                        '"' => out.push('"'),
                        '\'' => out.push('\''),
                        // keep regex escapes such as \d intact
                        other => {
                            out.push('\\');
                            out.push(other);
                        }
                    }
                }
                '\n' => return Err(QueryError::parse(start, "unterminated quoted string")),
                c => out.push(c),
            }
        }
    }

    fn raw_string(&mut self) -> Result<TokenKind, QueryError> {
        let start = self.pos;
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(QueryError::parse(start, "unterminated raw string")),
                Some('`') => {
                    self.pos += 1;
                    return Ok(TokenKind::Str(out));
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    /// Numbers, or durations when digits are directly followed by a unit
    fn number_or_duration(&mut self) -> Result<TokenKind, QueryError> {
        let start = self.pos;
        let mut end = self.pos;
        while end < self.chars.len() && self.chars[end].is_ascii_digit() {
            end += 1;
        }
        if end > start && end < self.chars.len() && unit_at(&self.chars, end).is_some() {
            return self.duration(start);
        }

        while let Some(c) = self.peek() {
            let prev = if self.pos > start { self.chars[self.pos - 1] } else { ' ' };
            let exponent_sign = (c == '+' || c == '-') && (prev == 'e' || prev == 'E');
            if c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' || exponent_sign {
                self.pos += 1;
            } else {
                break;
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        text.parse::<f64>()
            .map(TokenKind::Number)
            .map_err(|_| QueryError::parse(start, format!("invalid number {:?}", text)))
    }

    fn duration(&mut self, start: usize) -> Result<TokenKind, QueryError> {
        let mut total: i64 = 0;
        let mut last_unit_ms = i64::MAX;
        loop {
            let digits_start = self.pos;
            while self.peek().map_or(false, |c| c.is_ascii_digit()) {
                self.pos += 1;
            }
            if self.pos == digits_start {
                break;
            }
            let text: String = self.chars[digits_start..self.pos].iter().collect();
            let n: i64 = text
                .parse()
                .map_err(|_| QueryError::parse(start, format!("invalid duration {:?}", text)))?;
            let Some((unit_len, unit_ms)) = unit_at(&self.chars, self.pos) else {
                return Err(QueryError::parse(start, "missing unit in duration"));
            };
            if unit_ms >= last_unit_ms {
                return Err(QueryError::parse(start, "duration units must be ordered largest first"));
            }
            last_unit_ms = unit_ms;
            self.pos += unit_len;
            total = n
                .checked_mul(unit_ms)
                .and_then(|v| total.checked_add(v))
                .ok_or_else(|| QueryError::parse(start, "duration out of range"))?;
        }
        Ok(TokenKind::Duration(total))
    }
}

/// Unit at `pos`: (length, milliseconds)
fn unit_at(chars: &[char], pos: usize) -> Option<(usize, i64)> {
    let c = *chars.get(pos)?;
    let next = chars.get(pos + 1).copied();
    let unit = match (c, next) {
        ('m', Some('s')) => (2, 1),
        ('s', _) => (1, 1_000),
        ('m', _) => (1, 60_000),
        ('h', _) => (1, 3_600_000),
        ('d', _) => (1, 86_400_000),
        ('w', _) => (1, 604_800_000),
        ('y', _) => (1, 31_536_000_000),
        _ => return None,
    };
    // a unit must not run into an identifier, as in `5min`
    match chars.get(pos + unit.0) {
        Some(c) if c.is_alphabetic() || *c == '_' => None,
        _ => Some(unit),
    }
}

/// Parse a standalone duration string such as `5m` or `1h30m`
pub fn parse_duration(s: &str) -> Result<i64, QueryError> {
    let tokens = Lexer::new(s.trim()).tokenize()?;
    match tokens.as_slice() {
        [Token {
            kind: TokenKind::Duration(d),
            ..
        }, Token {
            kind: TokenKind::Eof, ..
        }] => Ok(*d),
        _ => Err(QueryError::parse(0, format!("invalid duration {:?}", s))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::new(src)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_selector_tokens() {
        assert_eq!(
            kinds(r#"rate(http_requests_total{job=~"api|web"}[5m])"#),
            vec![
                TokenKind::Ident("rate".into()),
                TokenKind::LParen,
                TokenKind::Ident("http_requests_total".into()),
                TokenKind::LBrace,
                TokenKind::Ident("job".into()),
                TokenKind::RegexMatch,
                TokenKind::Str("api|web".into()),
                TokenKind::RBrace,
                TokenKind::LBracket,
                TokenKind::Duration(300_000),
                TokenKind::RBracket,
                TokenKind::RParen,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_numbers_and_durations() {
        assert_eq!(kinds("1.5e3")[0], TokenKind::Number(1500.0));
        assert_eq!(kinds(".5")[0], TokenKind::Number(0.5));
        assert_eq!(kinds("1h30m")[0], TokenKind::Duration(5_400_000));
        assert_eq!(kinds("250ms")[0], TokenKind::Duration(250));
        assert_eq!(parse_duration("3d").unwrap(), 259_200_000);
        assert!(parse_duration("30m1h").is_err());
    }

    #[test]
    fn test_error_position() {
        let err = Lexer::new("up{job=\"x").tokenize().unwrap_err();
        assert_eq!(err, QueryError::parse(7, "unterminated quoted string"));
        let err = Lexer::new("up ! 1").tokenize().unwrap_err();
        assert!(matches!(err, QueryError::Parse { position: 3, .. }));
    }
}
