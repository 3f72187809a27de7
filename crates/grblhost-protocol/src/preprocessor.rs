//! Line preprocessor
//!
//! Shared by the feeder and sender paths. Handles two syntactic
//! classes:
//!
//! 1. Directive lines beginning with `%`: `%wait` becomes a short dwell
//!    (the sender additionally holds until the dwell's `ok`); any other
//!    directive is an assignment list (`a=1,b=posx+2`) that mutates the
//!    execution context and suppresses the line.
//! 2. Bracketed expressions inside ordinary G-code: every `[expr]` is
//!    evaluated against the context and replaced with its numeric form.
//!    Unknown identifiers resolve to 0; malformed expressions never
//!    fail the line.
//!
//! Pause semantics for `M0/M1/M2/M30` and `M6` are reported back to the
//! caller, which applies its own hold policy: the feeder holds itself,
//! the sender pauses the workflow. `M6` is additionally rewritten to
//! `(M6)` so the device does not reject the line.

use grblhost_core::machine::ExecutionContext;

/// Dwell spliced in place of a `%wait` directive
pub const WAIT_DWELL: &str = "G4 P0.5 (%wait)";

/// Marker used for `%wait` hold reasons
pub const WAIT: &str = "%wait";

/// Result of preprocessing one line
#[derive(Debug, Clone, PartialEq)]
pub struct Rewritten {
    /// The line to transmit; `None` suppresses the line entirely.
    pub text: Option<String>,
    /// Pause mnemonic (`M0`, `M1`, `M2`, `M30`, `M6`) when the line
    /// carries a program-pause word.
    pub pause: Option<String>,
    /// Whether this line is a `%wait` dwell.
    pub wait: bool,
}

impl Rewritten {
    fn suppressed() -> Self {
        Self {
            text: None,
            pause: None,
            wait: false,
        }
    }
}

/// Preprocess one line against an execution context
pub fn rewrite(line: &str, ctx: &mut ExecutionContext) -> Rewritten {
    let trimmed = line.trim();

    if let Some(directive) = trimmed.strip_prefix('%') {
        return rewrite_directive(directive, ctx);
    }

    let substituted = substitute_expressions(line, ctx);
    let (text, pause) = apply_pause_words(&substituted);
    Rewritten {
        text: Some(text),
        pause,
        wait: false,
    }
}

fn rewrite_directive(directive: &str, ctx: &mut ExecutionContext) -> Rewritten {
    // Strip a trailing comment: `%wait ; let the planner drain`.
    let directive = directive
        .split_once(';')
        .map(|(head, _)| head)
        .unwrap_or(directive)
        .trim();

    if directive == "wait" {
        return Rewritten {
            text: Some(WAIT_DWELL.to_string()),
            pause: None,
            wait: true,
        };
    }

    // Assignment list: name=expr[,name=expr...]. Malformed pieces are
    // skipped; the line is always suppressed.
    for assignment in directive.split(',') {
        let Some((name, expr)) = assignment.split_once('=') else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() || !is_identifier(name) {
            continue;
        }
        let value = eval(expr, ctx);
        ctx.set(name, value);
    }

    Rewritten::suppressed()
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Replace every `[expr]` with its evaluated numeric form
fn substitute_expressions(line: &str, ctx: &ExecutionContext) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;

    while let Some(open) = rest.find('[') {
        let Some(close) = rest[open..].find(']') else {
            break;
        };
        out.push_str(&rest[..open]);
        let expr = &rest[open + 1..open + close];
        out.push_str(&format_number(eval(expr, ctx)));
        rest = &rest[open + close + 1..];
    }
    out.push_str(rest);
    out
}

/// Shortest-round-trip formatting: `10` rather than `10.0`, `10.5` as is
pub fn format_number(value: f64) -> String {
    if value.is_finite() {
        format!("{}", value)
    } else {
        "0".to_string()
    }
}

/// Program-pause detection and the `(M6)` rewrite
fn apply_pause_words(line: &str) -> (String, Option<String>) {
    let mut pause = None;
    let mut words: Vec<String> = Vec::new();

    for word in line.split_whitespace() {
        let upper = word.to_ascii_uppercase();
        match upper.as_str() {
            "M0" | "M00" => {
                pause.get_or_insert_with(|| "M0".to_string());
                words.push(word.to_string());
            }
            "M1" | "M01" => {
                pause.get_or_insert_with(|| "M1".to_string());
                words.push(word.to_string());
            }
            "M2" | "M02" => {
                pause.get_or_insert_with(|| "M2".to_string());
                words.push(word.to_string());
            }
            "M30" => {
                pause.get_or_insert_with(|| "M30".to_string());
                words.push(word.to_string());
            }
            "M6" | "M06" => {
                pause.get_or_insert_with(|| "M6".to_string());
                words.push("(M6)".to_string());
            }
            _ => words.push(word.to_string()),
        }
    }

    if pause.is_none() {
        // No pause word and no M6 rewrite: return the line unchanged,
        // whitespace included.
        return (line.to_string(), None);
    }
    (words.join(" "), pause)
}

// ---------------------------------------------------------------------------
// Expression evaluation
//
// A small recursive-descent evaluator over `+ - * /`, parentheses,
// unary sign, numbers and identifiers. Identifiers resolve through the
// execution context, with missing values coerced to zero. Any parse
// failure yields zero; the preprocessor never fails a line.
// ---------------------------------------------------------------------------

fn eval(expr: &str, ctx: &ExecutionContext) -> f64 {
    let tokens = tokenize(expr);
    let mut parser = ExprParser {
        tokens: &tokens,
        pos: 0,
        ctx,
    };
    let value = parser.expression();
    if parser.pos < parser.tokens.len() {
        // Trailing garbage: degrade to zero rather than guessing.
        return 0.0;
    }
    value.unwrap_or(0.0)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Open,
    Close,
}

fn tokenize(expr: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let bytes = expr.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_digit() || bytes[i] == b'.')
                {
                    i += 1;
                }
                match expr[start..i].parse::<f64>() {
                    Ok(n) => tokens.push(Token::Number(n)),
                    Err(_) => return Vec::new(),
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(expr[start..i].to_string()));
            }
            _ => return Vec::new(),
        }
    }
    tokens
}

struct ExprParser<'a> {
    tokens: &'a [Token],
    pos: usize,
    ctx: &'a ExecutionContext,
}

impl ExprParser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expression(&mut self) -> Option<f64> {
        let mut value = self.term()?;
        while let Some(op) = self.peek() {
            match op {
                Token::Plus => {
                    self.pos += 1;
                    value += self.term()?;
                }
                Token::Minus => {
                    self.pos += 1;
                    value -= self.term()?;
                }
                _ => break,
            }
        }
        Some(value)
    }

    fn term(&mut self) -> Option<f64> {
        let mut value = self.factor()?;
        while let Some(op) = self.peek() {
            match op {
                Token::Star => {
                    self.pos += 1;
                    value *= self.factor()?;
                }
                Token::Slash => {
                    self.pos += 1;
                    value /= self.factor()?;
                }
                _ => break,
            }
        }
        Some(value)
    }

    fn factor(&mut self) -> Option<f64> {
        match self.next()? {
            Token::Number(n) => Some(*n),
            Token::Ident(name) => {
                let name = name.clone();
                Some(self.ctx.get(&name))
            }
            Token::Minus => Some(-self.factor()?),
            Token::Plus => self.factor(),
            Token::Open => {
                let value = self.expression()?;
                match self.next()? {
                    Token::Close => Some(value),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}
