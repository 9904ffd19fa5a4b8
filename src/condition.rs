//! A small boolean expression language evaluated against events.
//!
//! Used by the trigger processor: `values./x/y > 10 && tags.source == "leaf1"`.
//! Selectors address event fields (`name`, `timestamp`, `tags.<key>`,
//! `values.<key>`); comparisons between a missing field and anything are
//! false.

use std::str::FromStr;

use thiserror::Error;

use crate::event::Event;
use crate::value::Value;

#[derive(Debug, Error)]
pub enum Error {
    #[error("empty condition")]
    Empty,

    #[error("unexpected token {found:?} at {pos}")]
    UnexpectedToken { pos: usize, found: String },

    #[error("expected an operand at {pos}")]
    OperandExpected { pos: usize },

    #[error("unterminated string literal at {pos}")]
    UnterminatedString { pos: usize },

    #[error("expected closing parenthesis at {pos}")]
    ExpectClosing { pos: usize },

    #[error("invalid regex {token:?} at {pos}: {err}")]
    InvalidRegex {
        pos: usize,
        token: String,
        err: regex::Error,
    },

    #[error("trailing input at {pos}")]
    TrailingInput { pos: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    Equal,
    NotEqual,
    LessThan,
    LessEqual,
    GreaterThan,
    GreaterEqual,
    Contains,
    Matches,
}

#[derive(Debug)]
enum Expression {
    Bool(bool),
    Number(f64),
    String(String),
    Selector(Selector),
    Compare {
        op: Comparison,
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
    Regex(regex::Regex),
    And(Box<Expression>, Box<Expression>),
    Or(Box<Expression>, Box<Expression>),
    Not(Box<Expression>),
}

#[derive(Debug, PartialEq, Eq)]
enum Selector {
    Name,
    Timestamp,
    Tag(String),
    Value(String),
}

/// One field of an event, resolved at evaluation time.
#[derive(Debug)]
enum Operand {
    Bool(bool),
    Number(f64),
    String(String),
    Missing,
}

/// A compiled condition. Parsing happens once, evaluation is allocation
/// free apart from tag/value lookups.
#[derive(Debug)]
pub struct Condition {
    root: Expression,
}

impl FromStr for Condition {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Error> {
        let tokens = lex(input)?;
        if tokens.is_empty() {
            return Err(Error::Empty);
        }

        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.expr()?;
        if let Some((pos, _)) = parser.peek() {
            return Err(Error::TrailingInput { pos });
        }

        Ok(Condition { root })
    }
}

impl Condition {
    pub fn eval(&self, event: &Event) -> bool {
        eval(&self.root, event)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Not,
    Cmp(Comparison),
    Number(f64),
    Str(String),
    Word(String),
}

fn lex(input: &str) -> Result<Vec<(usize, Token)>, Error> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push((i, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((i, Token::RParen));
                i += 1;
            }
            '&' | '|' => {
                if i + 1 < bytes.len() && bytes[i + 1] as char == c {
                    tokens.push((i, if c == '&' { Token::And } else { Token::Or }));
                    i += 2;
                } else {
                    return Err(Error::UnexpectedToken {
                        pos: i,
                        found: c.to_string(),
                    });
                }
            }
            '=' | '!' | '<' | '>' => {
                let eq = i + 1 < bytes.len() && bytes[i + 1] == b'=';
                let (token, len) = match (c, eq) {
                    ('=', true) => (Token::Cmp(Comparison::Equal), 2),
                    ('!', true) => (Token::Cmp(Comparison::NotEqual), 2),
                    ('<', true) => (Token::Cmp(Comparison::LessEqual), 2),
                    ('>', true) => (Token::Cmp(Comparison::GreaterEqual), 2),
                    ('<', false) => (Token::Cmp(Comparison::LessThan), 1),
                    ('>', false) => (Token::Cmp(Comparison::GreaterThan), 1),
                    ('!', false) => (Token::Not, 1),
                    ('=', false) => {
                        return Err(Error::UnexpectedToken {
                            pos: i,
                            found: c.to_string(),
                        });
                    }
                    _ => unreachable!(),
                };
                tokens.push((i, token));
                i += len;
            }
            '"' | '\'' => {
                let quote = bytes[i];
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end] != quote {
                    end += 1;
                }
                if end == bytes.len() {
                    return Err(Error::UnterminatedString { pos: i });
                }
                tokens.push((i, Token::Str(input[start..end].to_string())));
                i = end + 1;
            }
            _ => {
                // a word: selector, bare literal or word operator. Words may
                // contain slashes, dots and dashes so value paths stay
                // addressable.
                let start = i;
                while i < bytes.len()
                    && !matches!(
                        bytes[i] as char,
                        ' ' | '\t' | '\n' | '\r' | '(' | ')' | '&' | '|' | '=' | '!' | '<' | '>'
                    )
                {
                    i += 1;
                }
                let word = &input[start..i];
                let token = match word {
                    "contains" => Token::Cmp(Comparison::Contains),
                    "matches" => Token::Cmp(Comparison::Matches),
                    _ => match word.parse::<f64>() {
                        Ok(number) => Token::Number(number),
                        Err(_) => Token::Word(word.to_string()),
                    },
                };
                tokens.push((start, token));
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<(usize, &Token)> {
        self.tokens.get(self.pos).map(|(pos, token)| (*pos, token))
    }

    fn next(&mut self) -> Option<(usize, Token)> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expr(&mut self) -> Result<Expression, Error> {
        let mut lhs = self.and()?;
        while matches!(self.peek(), Some((_, Token::Or))) {
            self.next();
            let rhs = self.and()?;
            lhs = Expression::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expression, Error> {
        let mut lhs = self.comparison()?;
        while matches!(self.peek(), Some((_, Token::And))) {
            self.next();
            let rhs = self.comparison()?;
            lhs = Expression::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> Result<Expression, Error> {
        let lhs = self.primary()?;

        let Some((pos, Token::Cmp(op))) = self.peek() else {
            return Ok(lhs);
        };
        let op = *op;
        self.next();

        let rhs = self.primary()?;
        let rhs = if op == Comparison::Matches {
            match rhs {
                Expression::String(pattern) => {
                    let regex =
                        regex::Regex::new(&pattern).map_err(|err| Error::InvalidRegex {
                            pos,
                            token: pattern.clone(),
                            err,
                        })?;
                    Expression::Regex(regex)
                }
                other => other,
            }
        } else {
            rhs
        };

        Ok(Expression::Compare {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn primary(&mut self) -> Result<Expression, Error> {
        let Some((pos, token)) = self.next() else {
            return Err(Error::OperandExpected {
                pos: self.tokens.last().map(|(pos, _)| *pos).unwrap_or(0),
            });
        };

        match token {
            Token::LParen => {
                let inner = self.expr()?;
                match self.next() {
                    Some((_, Token::RParen)) => Ok(inner),
                    _ => Err(Error::ExpectClosing { pos }),
                }
            }
            Token::Not => Ok(Expression::Not(Box::new(self.primary()?))),
            Token::Number(number) => Ok(Expression::Number(number)),
            Token::Str(string) => Ok(Expression::String(string)),
            Token::Word(word) => Ok(match word.as_str() {
                "true" => Expression::Bool(true),
                "false" => Expression::Bool(false),
                "name" => Expression::Selector(Selector::Name),
                "timestamp" => Expression::Selector(Selector::Timestamp),
                _ => {
                    if let Some(key) = word.strip_prefix("tags.") {
                        Expression::Selector(Selector::Tag(key.to_string()))
                    } else if let Some(key) = word.strip_prefix("values.") {
                        Expression::Selector(Selector::Value(key.to_string()))
                    } else {
                        Expression::String(word)
                    }
                }
            }),
            other => Err(Error::UnexpectedToken {
                pos,
                found: format!("{other:?}"),
            }),
        }
    }
}

fn eval(expr: &Expression, event: &Event) -> bool {
    match expr {
        Expression::Bool(b) => *b,
        Expression::And(lhs, rhs) => eval(lhs, event) && eval(rhs, event),
        Expression::Or(lhs, rhs) => eval(lhs, event) || eval(rhs, event),
        Expression::Not(inner) => !eval(inner, event),
        Expression::Compare { op, lhs, rhs } => {
            if *op == Comparison::Matches {
                return match (&**rhs, resolve(lhs, event)) {
                    (Expression::Regex(regex), Operand::String(s)) => regex.is_match(&s),
                    _ => false,
                };
            }

            compare(*op, resolve(lhs, event), resolve(rhs, event))
        }
        Expression::Selector(selector) => match lookup(selector, event) {
            Operand::Bool(b) => b,
            Operand::Number(n) => n != 0.0,
            Operand::String(s) => !s.is_empty(),
            Operand::Missing => false,
        },
        // bare literals in boolean position
        Expression::Number(n) => *n != 0.0,
        Expression::String(s) => !s.is_empty(),
        Expression::Regex(_) => false,
    }
}

fn resolve(expr: &Expression, event: &Event) -> Operand {
    match expr {
        Expression::Bool(b) => Operand::Bool(*b),
        Expression::Number(n) => Operand::Number(*n),
        Expression::String(s) => Operand::String(s.clone()),
        Expression::Selector(selector) => lookup(selector, event),
        Expression::Regex(_) => Operand::Missing,
        _ => Operand::Bool(eval(expr, event)),
    }
}

fn lookup(selector: &Selector, event: &Event) -> Operand {
    match selector {
        Selector::Name => Operand::String(event.name.clone()),
        Selector::Timestamp => Operand::Number(event.timestamp as f64),
        Selector::Tag(key) => match event.tags.get(key) {
            Some(value) => Operand::String(value.clone()),
            None => Operand::Missing,
        },
        Selector::Value(key) => {
            let value = event
                .values
                .get(key)
                .or_else(|| event.values.get(&format!("/{key}")));
            match value {
                Some(Value::Bool(b)) => Operand::Bool(*b),
                Some(value) => match value.as_f64() {
                    Some(number) => Operand::Number(number),
                    None => match value {
                        Value::String(s) | Value::Ascii(s) => Operand::String(s.clone()),
                        _ => Operand::Missing,
                    },
                },
                None => Operand::Missing,
            }
        }
    }
}

fn compare(op: Comparison, lhs: Operand, rhs: Operand) -> bool {
    use Comparison::*;

    match (lhs, rhs) {
        (Operand::Missing, _) | (_, Operand::Missing) => false,
        (Operand::Number(a), Operand::Number(b)) => match op {
            Equal => a == b,
            NotEqual => a != b,
            LessThan => a < b,
            LessEqual => a <= b,
            GreaterThan => a > b,
            GreaterEqual => a >= b,
            Contains | Matches => false,
        },
        (Operand::Bool(a), Operand::Bool(b)) => match op {
            Equal => a == b,
            NotEqual => a != b,
            _ => false,
        },
        (lhs, rhs) => {
            let a = to_string_operand(lhs);
            let b = to_string_operand(rhs);
            match op {
                Equal => a == b,
                NotEqual => a != b,
                Contains => a.contains(&b),
                LessThan => a < b,
                LessEqual => a <= b,
                GreaterThan => a > b,
                GreaterEqual => a >= b,
                Matches => false,
            }
        }
    }
}

fn to_string_operand(op: Operand) -> String {
    match op {
        Operand::String(s) => s,
        Operand::Number(n) => n.to_string(),
        Operand::Bool(b) => b.to_string(),
        Operand::Missing => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn event() -> Event {
        Event {
            name: "ports".into(),
            timestamp: 100,
            tags: BTreeMap::from([
                ("source".to_string(), "leaf1".to_string()),
                ("interface".to_string(), "eth0".to_string()),
            ]),
            values: BTreeMap::from([
                ("/state/in-octets".to_string(), Value::Uint(42)),
                ("x".to_string(), Value::Int(12)),
                ("/state/oper-status".to_string(), Value::String("UP".into())),
            ]),
            deletes: Vec::new(),
        }
    }

    #[test]
    fn literals() {
        assert!("true".parse::<Condition>().unwrap().eval(&event()));
        assert!(!"false".parse::<Condition>().unwrap().eval(&event()));
    }

    #[test]
    fn numeric_comparisons() {
        for (input, expected) in [
            ("values.x > 10", true),
            ("values.x > 12", false),
            ("values.x >= 12", true),
            ("values.x < 12", false),
            ("values.x <= 12", true),
            ("values.x == 12", true),
            ("values.x != 12", false),
            ("values./state/in-octets == 42", true),
            // missing field never matches
            ("values.missing > 0", false),
            ("values.missing <= 0", false),
        ] {
            let condition: Condition = input.parse().unwrap();
            assert_eq!(condition.eval(&event()), expected, "input: {input}");
        }
    }

    #[test]
    fn string_comparisons() {
        for (input, expected) in [
            ("tags.source == \"leaf1\"", true),
            ("tags.source == leaf1", true),
            ("tags.source != leaf2", true),
            ("tags.interface contains th", true),
            ("values./state/oper-status == UP", true),
            ("tags.missing == leaf1", false),
            ("name == ports", true),
            ("tags.interface matches '^eth[0-9]+$'", true),
            ("tags.interface matches '^lo$'", false),
            ("tags.missing matches '.*'", false),
        ] {
            let condition: Condition = input.parse().unwrap();
            assert_eq!(condition.eval(&event()), expected, "input: {input}");
        }
    }

    #[test]
    fn combinators() {
        for (input, expected) in [
            ("values.x > 10 && tags.source == leaf1", true),
            ("values.x > 100 && tags.source == leaf1", false),
            ("values.x > 100 || tags.source == leaf1", true),
            ("!(values.x > 100) && timestamp >= 100", true),
        ] {
            let condition: Condition = input.parse().unwrap();
            assert_eq!(condition.eval(&event()), expected, "input: {input}");
        }
    }

    #[test]
    fn parse_errors() {
        for input in ["", "values.x >", "(values.x > 1", "a = b", "a &"] {
            assert!(input.parse::<Condition>().is_err(), "input: {input}");
        }
    }
}
