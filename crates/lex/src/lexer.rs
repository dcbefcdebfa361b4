use crate::keywords::to_keyword;
use crate::token::{LiteralKind, Punctuator as P, Span, Token, TokenKind as K};
use diag::{Diag, DiagKind, Result};

pub struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    line: u32,
    col: u32,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }
    fn peek_at(&self, n: usize) -> Option<u8> {
        self.bytes.get(self.pos + n).copied()
    }
    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }
    fn bump_n(&mut self, n: usize) {
        for _ in 0..n {
            let _ = self.bump();
        }
    }
    fn starts_with(&self, s: &str) -> bool {
        self.bytes
            .get(self.pos..)
            .is_some_and(|rest| rest.starts_with(s.as_bytes()))
    }
    fn here(&self) -> Span {
        Span::new(self.line, self.col)
    }

    fn is_ident_start(c: u8) -> bool {
        c == b'_' || c.is_ascii_alphabetic()
    }
    fn is_ident_continue(c: u8) -> bool {
        c == b'_' || c.is_ascii_alphanumeric()
    }

    fn skip_ws_and_comments(&mut self) {
        loop {
            while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n' | 0x0C)) {
                let _ = self.bump();
            }
            if self.starts_with("//") {
                while let Some(c) = self.peek() {
                    if c == b'\n' {
                        break;
                    }
                    let _ = self.bump();
                }
                continue;
            }
            if self.starts_with("/*") {
                self.bump_n(2);
                while self.pos < self.bytes.len() && !self.starts_with("*/") {
                    let _ = self.bump();
                }
                if self.starts_with("*/") {
                    self.bump_n(2);
                }
                continue;
            }
            break;
        }
    }

    fn token(&self, kind: K, start: usize, span: Span) -> Token {
        Token {
            kind,
            lexeme: self.src[start..self.pos].to_string(),
            span,
        }
    }

    pub fn next_token(&mut self) -> Result<Option<Token>> {
        self.skip_ws_and_comments();
        let span = self.here();
        let start = self.pos;
        let c = match self.peek() {
            Some(c) => c,
            None => return Ok(None),
        };

        // Identifier, keyword, or boolean literal
        if Self::is_ident_start(c) {
            let _ = self.bump();
            while let Some(c2) = self.peek() {
                if Self::is_ident_continue(c2) {
                    let _ = self.bump();
                } else {
                    break;
                }
            }
            let lex = &self.src[start..self.pos];
            let kind = match lex {
                "true" => K::Literal(LiteralKind::Bool(true)),
                "false" => K::Literal(LiteralKind::Bool(false)),
                _ => match to_keyword(lex) {
                    Some(kw) => K::Keyword(kw),
                    None => K::Identifier(lex.to_string()),
                },
            };
            return Ok(Some(self.token(kind, start, span)));
        }

        // Numeric literal: hex, decimal, or float
        if c.is_ascii_digit() {
            return self.scan_number(start, span).map(Some);
        }

        // String literal
        if c == b'"' {
            let _ = self.bump();
            let mut decoded = String::new();
            loop {
                match self.peek() {
                    None | Some(b'\n') => {
                        return Err(Diag::new(
                            DiagKind::LexUnterminatedLiteral,
                            span.line,
                            span.col,
                            "unterminated string literal",
                        ));
                    }
                    Some(b'"') => {
                        let _ = self.bump();
                        break;
                    }
                    Some(b'\\') => {
                        let _ = self.bump();
                        let e = self.scan_escape(span)?;
                        decoded.push(e as char);
                    }
                    Some(ch) => {
                        let _ = self.bump();
                        decoded.push(ch as char);
                    }
                }
            }
            return Ok(Some(self.token(
                K::Literal(LiteralKind::Str(decoded)),
                start,
                span,
            )));
        }

        // Character literal
        if c == b'\'' {
            let _ = self.bump();
            let value = match self.peek() {
                None | Some(b'\n') => {
                    return Err(Diag::new(
                        DiagKind::LexUnterminatedLiteral,
                        span.line,
                        span.col,
                        "unterminated character literal",
                    ));
                }
                Some(b'\'') => {
                    return Err(Diag::new(
                        DiagKind::LexBadChar,
                        span.line,
                        span.col,
                        "empty character literal",
                    ));
                }
                Some(b'\\') => {
                    let _ = self.bump();
                    self.scan_escape(span)?
                }
                Some(ch) => {
                    let _ = self.bump();
                    ch
                }
            };
            match self.peek() {
                Some(b'\'') => {
                    let _ = self.bump();
                }
                _ => {
                    return Err(Diag::new(
                        DiagKind::LexUnterminatedLiteral,
                        span.line,
                        span.col,
                        "unterminated character literal",
                    ));
                }
            }
            return Ok(Some(self.token(
                K::Literal(LiteralKind::Char(value)),
                start,
                span,
            )));
        }

        // Punctuators, longest match first
        for (text, p) in [("<<=", P::ShlAssign), (">>=", P::ShrAssign)] {
            if self.starts_with(text) {
                self.bump_n(3);
                return Ok(Some(self.token(K::Punct(p), start, span)));
            }
        }
        for (text, p) in [
            ("->", P::Arrow),
            ("++", P::Inc),
            ("--", P::Dec),
            ("<=", P::Le),
            (">=", P::Ge),
            ("==", P::Eq),
            ("!=", P::Ne),
            ("&&", P::AndAnd),
            ("||", P::OrOr),
            ("+=", P::PlusAssign),
            ("-=", P::MinusAssign),
            ("*=", P::StarAssign),
            ("/=", P::SlashAssign),
            ("%=", P::PercentAssign),
            ("&=", P::AndAssign),
            ("|=", P::OrAssign),
            ("^=", P::XorAssign),
            ("<<", P::Shl),
            (">>", P::Shr),
        ] {
            if self.starts_with(text) {
                self.bump_n(2);
                return Ok(Some(self.token(K::Punct(p), start, span)));
            }
        }

        let ch = self.bump().unwrap();
        let pk = match ch {
            b'(' => P::LParen,
            b')' => P::RParen,
            b'{' => P::LBrace,
            b'}' => P::RBrace,
            b'[' => P::LBracket,
            b']' => P::RBracket,
            b';' => P::Semicolon,
            b',' => P::Comma,
            b'.' => P::Dot,
            b'+' => P::Plus,
            b'-' => P::Minus,
            b'*' => P::Star,
            b'/' => P::Slash,
            b'%' => P::Percent,
            b'&' => P::Amp,
            b'|' => P::Pipe,
            b'^' => P::Caret,
            b'~' => P::Tilde,
            b'!' => P::Bang,
            b':' => P::Colon,
            b'=' => P::Assign,
            b'<' => P::Lt,
            b'>' => P::Gt,
            other => {
                return Err(Diag::new(
                    DiagKind::LexBadChar,
                    span.line,
                    span.col,
                    format!("unknown character: {:?}", other as char),
                ));
            }
        };
        Ok(Some(self.token(K::Punct(pk), start, span)))
    }

    fn scan_number(&mut self, start: usize, span: Span) -> Result<Token> {
        let bad = |msg: &str| Diag::new(DiagKind::LexBadNumber, span.line, span.col, msg.to_string());

        if self.starts_with("0x") || self.starts_with("0X") {
            self.bump_n(2);
            let digits_start = self.pos;
            while let Some(ch) = self.peek() {
                if ch.is_ascii_hexdigit() {
                    let _ = self.bump();
                } else {
                    break;
                }
            }
            if self.pos == digits_start {
                return Err(bad("hex literal without digits"));
            }
            if self.peek().is_some_and(Self::is_ident_start) {
                return Err(bad("trailing characters after hex literal"));
            }
            let value = i64::from_str_radix(&self.src[digits_start..self.pos], 16)
                .map_err(|_| bad("hex literal out of range"))?;
            return Ok(self.token(K::Literal(LiteralKind::Int(value)), start, span));
        }

        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() {
                let _ = self.bump();
            } else {
                break;
            }
        }

        // Float: digits '.' digits ([eE][+-]?digits)?
        let is_float = self.peek() == Some(b'.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit());
        if is_float {
            let _ = self.bump(); // '.'
            while let Some(ch) = self.peek() {
                if ch.is_ascii_digit() {
                    let _ = self.bump();
                } else {
                    break;
                }
            }
            if matches!(self.peek(), Some(b'e' | b'E')) {
                let _ = self.bump();
                if matches!(self.peek(), Some(b'+' | b'-')) {
                    let _ = self.bump();
                }
                let exp_start = self.pos;
                while let Some(ch) = self.peek() {
                    if ch.is_ascii_digit() {
                        let _ = self.bump();
                    } else {
                        break;
                    }
                }
                if self.pos == exp_start {
                    return Err(bad("float exponent without digits"));
                }
            }
            if self.peek().is_some_and(Self::is_ident_start) {
                return Err(bad("trailing characters after float literal"));
            }
            let value: f64 = self.src[start..self.pos]
                .parse()
                .map_err(|_| bad("malformed float literal"))?;
            return Ok(self.token(K::Literal(LiteralKind::Float(value)), start, span));
        }

        if self.peek().is_some_and(Self::is_ident_start) {
            return Err(bad("trailing characters after integer literal"));
        }
        let value: i64 = self.src[start..self.pos]
            .parse()
            .map_err(|_| bad("integer literal out of range"))?;
        Ok(self.token(K::Literal(LiteralKind::Int(value)), start, span))
    }

    /// Scan the escape body after a consumed backslash.
    fn scan_escape(&mut self, span: Span) -> Result<u8> {
        let c = self.bump().ok_or_else(|| {
            Diag::new(
                DiagKind::LexUnterminatedLiteral,
                span.line,
                span.col,
                "unterminated escape sequence",
            )
        })?;
        Ok(match c {
            b'n' => b'\n',
            b't' => b'\t',
            b'r' => b'\r',
            b'0' => 0,
            b'\\' => b'\\',
            b'\'' => b'\'',
            b'"' => b'"',
            b'x' => {
                let mut value: u32 = 0;
                let mut digits = 0;
                while digits < 2 {
                    match self.peek() {
                        Some(h) if h.is_ascii_hexdigit() => {
                            let _ = self.bump();
                            value = (value << 4) | (h as char).to_digit(16).unwrap();
                            digits += 1;
                        }
                        _ => break,
                    }
                }
                if digits == 0 {
                    return Err(Diag::new(
                        DiagKind::LexBadChar,
                        span.line,
                        span.col,
                        "\\x escape without hex digits",
                    ));
                }
                value as u8
            }
            other => {
                return Err(Diag::new(
                    DiagKind::LexBadChar,
                    span.line,
                    span.col,
                    format!("unknown escape sequence: \\{}", other as char),
                ));
            }
        })
    }
}

/// Lex an entire preprocessed source text.
pub fn lex(src: &str) -> Result<Vec<Token>> {
    let mut lx = Lexer::new(src);
    let mut toks = Vec::new();
    while let Some(t) = lx.next_token()? {
        toks.push(t);
    }
    Ok(toks)
}
