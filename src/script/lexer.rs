use super::ast::Span;
use super::diagnostic::Diagnostic;

/// Magnitude of `int.MinValue`; the largest literal the lexer lets through.
pub const INT_MIN_MAGNITUDE: i64 = 1 << 31;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    /// Up to `2^31`, which is only valid directly after a unary minus.
    Int(i64),
    Float(f64),
    String(String),
    True,
    False,
    Null,

    // Identifiers & keywords
    Ident(String),
    Var,
    If,
    Else,
    While,
    For,
    Return,
    Break,
    Continue,
    Throw,
    New,

    // Type names
    IntTy,
    DoubleTy,
    BoolTy,
    StringTy,
    VoidTy,

    // Punctuation
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Dot,
    Colon,
    Semicolon,
    FatArrow,  // =>

    // Operators
    Plus,
    Minus,
    Star,
    StarStar,  // **
    Slash,
    Percent,
    Lt,
    Gt,
    Le,        // <=
    Ge,        // >=
    EqEq,      // ==
    Ne,        // !=
    And,       // &&
    Or,        // ||
    Bang,      // !
    Eq,        // =
    PlusEq,    // +=
    MinusEq,   // -=
    StarEq,    // *=
    SlashEq,   // /=
    PercentEq, // %=
    PlusPlus,  // ++
    MinusMinus, // --
    Question,  // ?

    // Special
    Eof,
}

impl Token {
    /// Human-readable rendering for diagnostics.
    pub fn describe(&self) -> String {
        match self {
            Self::Int(v) => format!("'{v}'"),
            Self::Float(v) => format!("'{v}'"),
            Self::String(_) => "string literal".into(),
            Self::Ident(name) => format!("'{name}'"),
            Self::Eof => "end of input".into(),
            other => format!("'{}'", other.text()),
        }
    }

    fn text(&self) -> &'static str {
        match self {
            Self::True => "true",
            Self::False => "false",
            Self::Null => "null",
            Self::Var => "var",
            Self::If => "if",
            Self::Else => "else",
            Self::While => "while",
            Self::For => "for",
            Self::Return => "return",
            Self::Break => "break",
            Self::Continue => "continue",
            Self::Throw => "throw",
            Self::New => "new",
            Self::IntTy => "int",
            Self::DoubleTy => "double",
            Self::BoolTy => "bool",
            Self::StringTy => "string",
            Self::VoidTy => "void",
            Self::LParen => "(",
            Self::RParen => ")",
            Self::LBrace => "{",
            Self::RBrace => "}",
            Self::Comma => ",",
            Self::Dot => ".",
            Self::Colon => ":",
            Self::Semicolon => ";",
            Self::FatArrow => "=>",
            Self::Plus => "+",
            Self::Minus => "-",
            Self::Star => "*",
            Self::StarStar => "**",
            Self::Slash => "/",
            Self::Percent => "%",
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Le => "<=",
            Self::Ge => ">=",
            Self::EqEq => "==",
            Self::Ne => "!=",
            Self::And => "&&",
            Self::Or => "||",
            Self::Bang => "!",
            Self::Eq => "=",
            Self::PlusEq => "+=",
            Self::MinusEq => "-=",
            Self::StarEq => "*=",
            Self::SlashEq => "/=",
            Self::PercentEq => "%=",
            Self::PlusPlus => "++",
            Self::MinusMinus => "--",
            Self::Question => "?",
            Self::Int(_) | Self::Float(_) | Self::String(_) | Self::Ident(_) | Self::Eof => "",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpannedToken {
    pub token: Token,
    pub span: Span,
}

pub fn lex(source: &str) -> Result<Vec<SpannedToken>, Vec<Diagnostic>> {
    let mut lexer = Lexer::new(source);
    lexer.tokenize()
}

struct Lexer<'a> {
    source: &'a str,
    bytes: &'a [u8],
    pos: usize,
    tokens: Vec<SpannedToken>,
    errors: Vec<Diagnostic>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            bytes: source.as_bytes(),
            pos: 0,
            tokens: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn tokenize(&mut self) -> Result<Vec<SpannedToken>, Vec<Diagnostic>> {
        while self.pos < self.bytes.len() {
            self.skip_whitespace_and_comments();
            if self.pos >= self.bytes.len() {
                break;
            }

            let start = self.pos;
            let ch = self.bytes[self.pos];

            match ch {
                b'(' => self.single(Token::LParen, start),
                b')' => self.single(Token::RParen, start),
                b'{' => self.single(Token::LBrace, start),
                b'}' => self.single(Token::RBrace, start),
                b',' => self.single(Token::Comma, start),
                b'.' => {
                    if self.bytes.get(self.pos + 1).is_some_and(u8::is_ascii_digit) {
                        self.lex_number(start);
                    } else {
                        self.single(Token::Dot, start);
                    }
                }
                b':' => self.single(Token::Colon, start),
                b';' => self.single(Token::Semicolon, start),
                b'?' => self.single(Token::Question, start),
                b'+' => self.operator(start, Token::Plus, &[(b'+', Token::PlusPlus), (b'=', Token::PlusEq)]),
                b'-' => self.operator(start, Token::Minus, &[(b'-', Token::MinusMinus), (b'=', Token::MinusEq)]),
                b'*' => self.operator(start, Token::Star, &[(b'*', Token::StarStar), (b'=', Token::StarEq)]),
                b'/' => self.operator(start, Token::Slash, &[(b'=', Token::SlashEq)]),
                b'%' => self.operator(start, Token::Percent, &[(b'=', Token::PercentEq)]),
                b'<' => self.operator(start, Token::Lt, &[(b'=', Token::Le)]),
                b'>' => self.operator(start, Token::Gt, &[(b'=', Token::Ge)]),
                b'=' => self.operator(start, Token::Eq, &[(b'=', Token::EqEq), (b'>', Token::FatArrow)]),
                b'!' => self.operator(start, Token::Bang, &[(b'=', Token::Ne)]),
                b'|' => {
                    self.pos += 1;
                    if self.peek() == Some(b'|') {
                        self.pos += 1;
                        self.push(Token::Or, start, self.pos);
                    } else {
                        self.errors.push(Diagnostic::lexer(
                            "Expected '||' for logical OR",
                            Span::new(start, self.pos),
                        ));
                    }
                }
                b'&' => {
                    self.pos += 1;
                    if self.peek() == Some(b'&') {
                        self.pos += 1;
                        self.push(Token::And, start, self.pos);
                    } else {
                        self.errors.push(Diagnostic::lexer(
                            "Expected '&&' for logical AND",
                            Span::new(start, self.pos),
                        ));
                    }
                }
                b'"' => {
                    self.pos += 1;
                    self.lex_string(start);
                }
                b'0'..=b'9' => {
                    self.lex_number(start);
                }
                b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                    self.lex_ident(start);
                }
                _ => {
                    // Step over the whole UTF-8 sequence so spans stay on char boundaries.
                    let width = self.source[start..].chars().next().map_or(1, char::len_utf8);
                    self.errors.push(Diagnostic::lexer(
                        format!("Unexpected character: '{}'", &self.source[start..start + width]),
                        Span::new(start, start + width),
                    ));
                    self.pos += width;
                }
            }
        }

        self.tokens.push(SpannedToken {
            token: Token::Eof,
            span: Span::new(self.pos, self.pos),
        });

        if self.errors.is_empty() {
            Ok(std::mem::take(&mut self.tokens))
        } else {
            Err(std::mem::take(&mut self.errors))
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn push(&mut self, token: Token, start: usize, end: usize) {
        self.tokens.push(SpannedToken {
            token,
            span: Span::new(start, end),
        });
    }

    fn single(&mut self, token: Token, start: usize) {
        self.pos += 1;
        self.push(token, start, self.pos);
    }

    /// Lex a one-character operator that may extend to a two-character form.
    fn operator(&mut self, start: usize, base: Token, extended: &[(u8, Token)]) {
        self.pos += 1;
        if let Some(next) = self.peek() {
            if let Some((_, token)) = extended.iter().find(|(b, _)| *b == next) {
                self.pos += 1;
                self.push(token.clone(), start, self.pos);
                return;
            }
        }
        self.push(base, start, self.pos);
    }

    fn skip_whitespace_and_comments(&mut self) {
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                b' ' | b'\t' | b'\n' | b'\r' => self.pos += 1,
                b'/' if self.bytes.get(self.pos + 1) == Some(&b'/') => {
                    while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
                        self.pos += 1;
                    }
                }
                b'/' if self.bytes.get(self.pos + 1) == Some(&b'*') => {
                    let start = self.pos;
                    self.pos += 2;
                    loop {
                        if self.pos + 1 >= self.bytes.len() {
                            self.pos = self.bytes.len();
                            self.errors.push(Diagnostic::lexer(
                                "Unterminated block comment",
                                Span::new(start, self.pos),
                            ));
                            break;
                        }
                        if self.bytes[self.pos] == b'*' && self.bytes[self.pos + 1] == b'/' {
                            self.pos += 2;
                            break;
                        }
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
    }

    fn lex_string(&mut self, start: usize) {
        let mut value = String::new();
        let mut terminated = false;
        while let Some(ch) = self.source[self.pos..].chars().next() {
            match ch {
                '"' => {
                    self.pos += 1;
                    terminated = true;
                    break;
                }
                '\n' => break,
                '\\' => {
                    let esc_start = self.pos;
                    self.pos += 1;
                    let Some(esc) = self.source[self.pos..].chars().next() else {
                        break;
                    };
                    self.pos += esc.len_utf8();
                    match esc {
                        'n' => value.push('\n'),
                        't' => value.push('\t'),
                        'r' => value.push('\r'),
                        '0' => value.push('\0'),
                        '"' => value.push('"'),
                        '\\' => value.push('\\'),
                        other => self.errors.push(Diagnostic::lexer(
                            format!("Unrecognized escape sequence '\\{other}'"),
                            Span::new(esc_start, self.pos),
                        )),
                    }
                }
                other => {
                    value.push(other);
                    self.pos += other.len_utf8();
                }
            }
        }
        if !terminated {
            self.errors.push(Diagnostic::lexer(
                "Unterminated string literal",
                Span::new(start, self.pos),
            ));
        }
        self.push(Token::String(value), start, self.pos);
    }

    fn lex_number(&mut self, start: usize) {
        let mut is_float = false;
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        // Check for decimal point
        if self.pos < self.bytes.len() && self.bytes[self.pos] == b'.'
            && self.bytes.get(self.pos + 1).is_some_and(u8::is_ascii_digit)
        {
            is_float = true;
            self.pos += 1; // skip '.'
            while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
                self.pos += 1;
            }
        }
        // Exponent: 1e3, 2.5E-2
        if matches!(self.peek(), Some(b'e' | b'E')) {
            let mut look = self.pos + 1;
            if matches!(self.bytes.get(look), Some(b'+' | b'-')) {
                look += 1;
            }
            if self.bytes.get(look).is_some_and(u8::is_ascii_digit) {
                is_float = true;
                self.pos = look;
                while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
                    self.pos += 1;
                }
            }
        }

        let text = &self.source[start..self.pos];
        if is_float {
            match text.parse::<f64>() {
                Ok(v) => self.push(Token::Float(v), start, self.pos),
                Err(_) => self.errors.push(Diagnostic::lexer(
                    format!("Invalid real literal: {text}"),
                    Span::new(start, self.pos),
                )),
            }
        } else {
            match text.parse::<i64>() {
                Ok(v) if v <= INT_MIN_MAGNITUDE => self.push(Token::Int(v), start, self.pos),
                _ => self.errors.push(Diagnostic::lexer(
                    format!("Integral constant is too large: {text}"),
                    Span::new(start, self.pos),
                )),
            }
        }
    }

    fn lex_ident(&mut self, start: usize) {
        while self.pos < self.bytes.len()
            && (self.bytes[self.pos].is_ascii_alphanumeric() || self.bytes[self.pos] == b'_')
        {
            self.pos += 1;
        }
        let word = &self.source[start..self.pos];
        let token = match word {
            "var" => Token::Var,
            "if" => Token::If,
            "else" => Token::Else,
            "while" => Token::While,
            "for" => Token::For,
            "return" => Token::Return,
            "break" => Token::Break,
            "continue" => Token::Continue,
            "throw" => Token::Throw,
            "new" => Token::New,
            "true" => Token::True,
            "false" => Token::False,
            "null" => Token::Null,
            "int" => Token::IntTy,
            "double" => Token::DoubleTy,
            "bool" => Token::BoolTy,
            "string" => Token::StringTy,
            "void" => Token::VoidTy,
            _ => Token::Ident(word.to_string()),
        };
        self.push(token, start, self.pos);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn tok(s: &str) -> Vec<Token> {
        lex(s).unwrap().into_iter().map(|t| t.token).collect()
    }

    #[test]
    fn simple_tokens() {
        let tokens = tok("1 + 2.0");
        assert_eq!(tokens, vec![Token::Int(1), Token::Plus, Token::Float(2.0), Token::Eof]);
    }

    #[test]
    fn keywords() {
        let tokens = tok("var if else while for return break continue throw new");
        assert_eq!(tokens, vec![
            Token::Var, Token::If, Token::Else, Token::While, Token::For,
            Token::Return, Token::Break, Token::Continue, Token::Throw, Token::New,
            Token::Eof,
        ]);
    }

    #[test]
    fn type_keywords() {
        let tokens = tok("int double bool string void");
        assert_eq!(tokens, vec![
            Token::IntTy, Token::DoubleTy, Token::BoolTy, Token::StringTy, Token::VoidTy, Token::Eof,
        ]);
    }

    #[test]
    fn operators() {
        let tokens = tok("+ - * / % < > <= >= == != && || !");
        assert_eq!(tokens, vec![
            Token::Plus, Token::Minus, Token::Star, Token::Slash, Token::Percent,
            Token::Lt, Token::Gt, Token::Le, Token::Ge, Token::EqEq, Token::Ne,
            Token::And, Token::Or, Token::Bang, Token::Eof,
        ]);
    }

    #[test]
    fn compound_assignment_and_increment() {
        let tokens = tok("x += 1; y--; ++z; w %= 2");
        assert!(tokens.contains(&Token::PlusEq));
        assert!(tokens.contains(&Token::MinusMinus));
        assert!(tokens.contains(&Token::PlusPlus));
        assert!(tokens.contains(&Token::PercentEq));
    }

    #[test]
    fn integer_literals_stop_at_int_min_magnitude() {
        assert_eq!(tok("2147483648"), vec![Token::Int(2_147_483_648), Token::Eof]);
        let errors = lex("2147483649").unwrap_err();
        assert_eq!(errors[0].message, "Integral constant is too large: 2147483649");
        assert!(lex("99999999999999999999").is_err());
    }

    #[test]
    fn string_escapes() {
        let tokens = tok(r#""a\"b\n""#);
        assert_eq!(tokens, vec![Token::String("a\"b\n".into()), Token::Eof]);
    }

    #[test]
    fn unterminated_string_is_error() {
        let errors = lex("\"abc").unwrap_err();
        assert!(errors[0].message.contains("Unterminated"));
    }

    #[test]
    fn comments_stripped() {
        let tokens = tok("x /* block */ + y // line\n; z");
        assert_eq!(tokens, vec![
            Token::Ident("x".into()), Token::Plus, Token::Ident("y".into()),
            Token::Semicolon, Token::Ident("z".into()), Token::Eof,
        ]);
    }

    #[test]
    fn exponent_literals() {
        assert_eq!(tok("1e3"), vec![Token::Float(1000.0), Token::Eof]);
        assert_eq!(tok("2.5E-1"), vec![Token::Float(0.25), Token::Eof]);
        assert_eq!(tok(".5"), vec![Token::Float(0.5), Token::Eof]);
    }

    #[test]
    fn integer_overflow_is_error() {
        let errors = lex("99999999999").unwrap_err();
        assert!(errors[0].message.contains("too large"));
    }

    #[test]
    fn star_star_vs_star() {
        let tokens = tok("a * b ** c");
        assert_eq!(tokens, vec![
            Token::Ident("a".into()), Token::Star, Token::Ident("b".into()),
            Token::StarStar, Token::Ident("c".into()), Token::Eof,
        ]);
    }

    #[test]
    fn fat_arrow_vs_eq() {
        let tokens = tok("a = b == c => d");
        assert_eq!(tokens, vec![
            Token::Ident("a".into()), Token::Eq, Token::Ident("b".into()),
            Token::EqEq, Token::Ident("c".into()), Token::FatArrow,
            Token::Ident("d".into()), Token::Eof,
        ]);
    }

    #[test]
    fn unexpected_character_reports_span() {
        let errors = lex("x # y").unwrap_err();
        assert_eq!(errors[0].span, Span::new(2, 3));
    }

    #[test]
    fn empty_input_is_just_eof() {
        assert_eq!(tok("   \n\t "), vec![Token::Eof]);
    }
}
