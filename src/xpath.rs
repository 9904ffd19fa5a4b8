//! Textual path codec.
//!
//! Parses xpath-style paths of the form `origin:/a/b[k1=v1][k2=v2]/c` into
//! the structured wire [`Path`] and serializes them back. A `\` escapes the
//! following character, which keeps `]`, `[` and `/` usable inside key
//! values.

use thiserror::Error;

use crate::proto::gnmi::{Path, PathElem};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unterminated predicate starting at {0}")]
    UnterminatedPredicate(usize),

    #[error("empty element name at {0}")]
    EmptyElement(usize),

    #[error("predicate without a key at {0}")]
    MissingKey(usize),

    #[error("unexpected '{token}' at {pos}")]
    UnexpectedToken { pos: usize, token: char },
}

pub fn parse(input: &str) -> Result<Path, ParseError> {
    if input.is_empty() {
        return Ok(Path::default());
    }

    let (origin, rest, offset) = split_origin(input);
    let mut path = Path {
        origin: origin.unwrap_or_default().to_string(),
        ..Default::default()
    };

    let mut elem = Vec::new();
    let mut current = PathElem::default();
    let mut name = String::new();
    let mut inside_brackets = false;
    let mut bracket_start = 0;
    let mut key = String::new();
    let mut value = String::new();
    let mut seen_eq = false;
    let mut escaping = false;

    for (index, ch) in rest.char_indices() {
        let pos = offset + index;

        if escaping {
            escaping = false;
            if inside_brackets {
                if seen_eq {
                    value.push(ch);
                } else {
                    key.push(ch);
                }
            } else {
                name.push(ch);
            }
            continue;
        }

        match ch {
            '\\' => escaping = true,
            '/' if !inside_brackets => {
                if index == 0 || (name.is_empty() && current.name.is_empty()) {
                    if index != 0 {
                        return Err(ParseError::EmptyElement(pos));
                    }
                    continue;
                }

                if current.name.is_empty() {
                    current.name = std::mem::take(&mut name);
                }
                elem.push(std::mem::take(&mut current));
            }
            '[' if !inside_brackets => {
                if current.name.is_empty() {
                    if name.is_empty() {
                        return Err(ParseError::EmptyElement(pos));
                    }
                    current.name = std::mem::take(&mut name);
                }

                inside_brackets = true;
                bracket_start = pos;
                seen_eq = false;
            }
            '=' if inside_brackets && !seen_eq => {
                if key.is_empty() {
                    return Err(ParseError::MissingKey(pos));
                }
                seen_eq = true;
            }
            ']' if inside_brackets => {
                if !seen_eq {
                    return Err(ParseError::MissingKey(pos));
                }

                current
                    .key
                    .insert(std::mem::take(&mut key), std::mem::take(&mut value));
                inside_brackets = false;
            }
            ']' | '=' => return Err(ParseError::UnexpectedToken { pos, token: ch }),
            _ => {
                if inside_brackets {
                    if seen_eq {
                        value.push(ch);
                    } else {
                        key.push(ch);
                    }
                } else {
                    name.push(ch);
                }
            }
        }
    }

    if escaping || inside_brackets {
        return Err(ParseError::UnterminatedPredicate(bracket_start));
    }

    if !name.is_empty() {
        if current.name.is_empty() {
            current.name = name;
        } else {
            // text after a closing bracket, e.g. "/a[k=v]b"
            return Err(ParseError::UnexpectedToken {
                pos: offset + rest.len() - name.len(),
                token: name.chars().next().unwrap_or(' '),
            });
        }
    }
    if !current.name.is_empty() {
        elem.push(current);
    }

    path.elem = elem;
    Ok(path)
}

/// Splits an optional `origin:` prefix off the input. The first `:` counts
/// only when it appears before any `/` or `[`.
fn split_origin(input: &str) -> (Option<&str>, &str, usize) {
    for (index, ch) in input.char_indices() {
        match ch {
            ':' => {
                if index == 0 {
                    break;
                }
                return (Some(&input[..index]), &input[index + 1..], index + 1);
            }
            '/' | '[' => break,
            _ => {}
        }
    }

    (None, input, 0)
}

/// Serializes a structured path back to its textual form. Keys are emitted
/// in their stored (sorted) order, so `parse` then `to_string` is a
/// normalizing round trip.
pub fn to_string(path: &Path) -> String {
    let mut out = String::new();

    if !path.origin.is_empty() {
        out.push_str(&path.origin);
        out.push(':');
    }

    for elem in &path.elem {
        out.push('/');
        push_escaped(&mut out, &elem.name);

        for (key, value) in &elem.key {
            out.push('[');
            push_escaped(&mut out, key);
            out.push('=');
            push_escaped(&mut out, value);
            out.push(']');
        }
    }

    out
}

/// The leaf path used as a value key: element names joined by `/`, keys
/// ignored.
pub fn elements_to_string(elems: &[PathElem]) -> String {
    let mut out = String::new();
    for elem in elems {
        out.push('/');
        out.push_str(&elem.name);
    }
    out
}

fn push_escaped(out: &mut String, input: &str) {
    for ch in input.chars() {
        if matches!(ch, '[' | ']' | '=' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
}
