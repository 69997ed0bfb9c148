// ABOUTME: S-expression reader producing source-tagged values

use crate::error::{Error, ErrorKind, Result};
use crate::source::{LineMap, SourceTag};
use crate::value::{Number, Value, ValueKind};
use nom::bytes::complete::{take_while, take_while1};
use nom::character::complete::multispace0;
use nom::{IResult, Parser};

/// One token of anything that is not structure: a number or a symbol.
/// Terminates on whitespace, parens, string quotes and comment starts.
fn symbolish_token(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !c.is_whitespace() && !"()\";".contains(c)).parse(input)
}

/// A run of string characters up to the next escape or closing quote.
fn string_chunk(input: &str) -> IResult<&str, &str> {
    take_while(|c: char| c != '"' && c != '\\').parse(input)
}

/// Incremental reader over one source text. Yields successive top-level
/// values; `NoValue` signals clean exhaustion.
pub struct Reader<'a> {
    full: &'a str,
    rest: &'a str,
    map: LineMap,
}

impl<'a> Reader<'a> {
    pub fn new(name: &str, text: &'a str) -> Reader<'a> {
        Reader {
            full: text,
            rest: text,
            map: LineMap::new(name, text),
        }
    }

    fn offset(&self) -> usize {
        self.full.len() - self.rest.len()
    }

    fn tag(&self) -> SourceTag {
        self.map.tag_at(self.offset())
    }

    fn bump(&mut self, n: usize) {
        self.rest = &self.rest[n..];
    }

    fn peek(&self) -> Option<char> {
        self.rest.chars().next()
    }

    fn eof_error(&self, msg: &str) -> Error {
        Error::new(ErrorKind::Eof(msg.into())).with_tag(Some(self.tag()))
    }

    fn parse_error(&self, msg: String) -> Error {
        Error::new(ErrorKind::Parse(msg)).with_tag(Some(self.tag()))
    }

    /// Skip whitespace and both comment forms.
    fn skip_atmosphere(&mut self) -> Result<()> {
        loop {
            let (rest, _) = multispace0::<&str, nom::error::Error<&str>>(self.rest)
                .map_err(|_| self.parse_error("unreadable input".into()))?;
            self.rest = rest;
            if self.rest.starts_with(';') {
                match self.rest.find('\n') {
                    Some(pos) => self.bump(pos + 1),
                    None => self.rest = "",
                }
            } else if self.rest.starts_with("#|") {
                let open = self.tag();
                match self.rest.find("|#") {
                    Some(pos) => self.bump(pos + 2),
                    None => {
                        return Err(Error::new(ErrorKind::Eof("non-terminated comment".into()))
                            .with_tag(Some(open)))
                    }
                }
            } else {
                return Ok(());
            }
        }
    }

    /// Whether only atmosphere remains. Errors on an unterminated comment.
    pub fn at_end(&mut self) -> Result<bool> {
        self.skip_atmosphere()?;
        Ok(self.rest.is_empty())
    }

    /// The next top-level value, or `NoValue` when the input is exhausted.
    pub fn next_value(&mut self) -> Result<Value> {
        if self.at_end()? {
            return Err(Error::new(ErrorKind::NoValue));
        }
        self.parse_form()
    }

    fn parse_form(&mut self) -> Result<Value> {
        let tag = self.tag();
        match self.peek() {
            Some('(') => self.parse_list(tag),
            Some(')') => Err(self.parse_error("unexpected ')'".into())),
            Some('"') => self.parse_string(tag),
            Some('\'') => {
                self.bump(1);
                self.skip_atmosphere()?;
                if self.rest.is_empty() {
                    return Err(self.eof_error("unexpected EOF"));
                }
                let inner = self.parse_form()?;
                Ok(Value {
                    kind: ValueKind::Quote(Box::new(inner)),
                    tag: Some(tag),
                })
            }
            Some(_) => self.parse_symbolish(tag),
            None => Err(self.eof_error("unexpected EOF")),
        }
    }

    fn parse_list(&mut self, open_tag: SourceTag) -> Result<Value> {
        self.bump(1);
        let mut cells: Vec<(SourceTag, Value)> = Vec::new();
        loop {
            self.skip_atmosphere()?;
            let elem_tag = self.tag();
            match self.peek() {
                None => {
                    return Err(Error::new(ErrorKind::Eof("non-terminated list".into()))
                        .with_tag(Some(elem_tag)))
                }
                Some(')') => {
                    self.bump(1);
                    return Ok(build_list(cells, None, open_tag));
                }
                Some('.') => {
                    if cells.is_empty() {
                        return Err(self.parse_error("weird list".into()));
                    }
                    self.bump(1);
                    self.skip_atmosphere()?;
                    if self.rest.is_empty() {
                        return Err(self.eof_error("non-terminated list"));
                    }
                    let tail = self.parse_form()?;
                    self.skip_atmosphere()?;
                    if self.peek() != Some(')') {
                        return Err(self.parse_error("malformed dot notation".into()));
                    }
                    self.bump(1);
                    return Ok(build_list(cells, Some(tail), open_tag));
                }
                Some(_) => {
                    let value = self.parse_form()?;
                    cells.push((elem_tag, value));
                }
            }
        }
    }

    fn parse_string(&mut self, tag: SourceTag) -> Result<Value> {
        self.bump(1);
        let mut text = String::new();
        loop {
            let (rest, chunk) = string_chunk(self.rest)
                .map_err(|_| self.parse_error("unreadable string".into()))?;
            text.push_str(chunk);
            self.rest = rest;
            match self.peek() {
                None => {
                    return Err(Error::new(ErrorKind::Eof("non-terminated string".into()))
                        .with_tag(Some(tag)))
                }
                Some('"') => {
                    self.bump(1);
                    return Ok(Value {
                        kind: ValueKind::Str(text),
                        tag: Some(tag),
                    });
                }
                Some('\\') => {
                    self.bump(1);
                    match self.peek() {
                        Some('n') => {
                            text.push('\n');
                            self.bump(1);
                        }
                        Some('\\') => {
                            text.push('\\');
                            self.bump(1);
                        }
                        Some(c) => {
                            return Err(
                                self.parse_error(format!("invalid escape character: \\{}", c))
                            )
                        }
                        None => {
                            return Err(Error::new(ErrorKind::Eof(
                                "non-terminated string".into(),
                            ))
                            .with_tag(Some(tag)))
                        }
                    }
                }
                Some(_) => unreachable!("string_chunk stops at quotes and escapes"),
            }
        }
    }

    fn parse_symbolish(&mut self, tag: SourceTag) -> Result<Value> {
        let (rest, token) = symbolish_token(self.rest)
            .map_err(|_| self.parse_error("unexpected character".into()))?;
        self.rest = rest;
        // integer first, float fallback, otherwise a symbol
        let kind = if let Ok(n) = token.parse::<i64>() {
            ValueKind::Number(Number::Int(n))
        } else if let Ok(f) = token.parse::<f64>() {
            ValueKind::Number(Number::Float(f))
        } else {
            ValueKind::Symbol(token.to_string())
        };
        Ok(Value {
            kind,
            tag: Some(tag),
        })
    }
}

fn build_list(
    cells: Vec<(SourceTag, Value)>,
    tail: Option<Value>,
    open_tag: SourceTag,
) -> Value {
    if cells.is_empty() {
        return Value {
            kind: ValueKind::Null,
            tag: Some(open_tag),
        };
    }
    let mut acc = tail.unwrap_or_else(Value::null);
    for (index, (tag, value)) in cells.into_iter().enumerate().rev() {
        let cell_tag = if index == 0 { open_tag.clone() } else { tag };
        acc = Value {
            kind: ValueKind::Pair(Box::new(value), Box::new(acc)),
            tag: Some(cell_tag),
        };
    }
    acc
}

/// Parse exactly one value and reject trailing input.
pub fn parse_one(name: &str, text: &str) -> Result<Value> {
    let mut reader = Reader::new(name, text);
    let value = reader.next_value()?;
    if !reader.at_end()? {
        return Err(reader.parse_error(format!("trailing characters: {}", reader.rest.trim())));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Result<Value> {
        parse_one("test", src)
    }

    fn sexpr(src: &str) -> String {
        parse(src).unwrap().to_string()
    }

    #[test]
    fn test_null() {
        assert_eq!(sexpr("()"), "()");
        assert_eq!(sexpr("(  )"), "()");
        assert_eq!(sexpr("(\n)"), "()");
    }

    #[test]
    fn test_list_simple() {
        assert_eq!(sexpr("(1)"), "(1)");
        assert_eq!(sexpr("(1 2)"), "(1 2)");
    }

    #[test]
    fn test_list_recurse() {
        assert_eq!(sexpr("(1 (2) 3)"), "(1 (2) 3)");
        assert_eq!(sexpr("((1))"), "((1))");
        assert_eq!(sexpr("(1 (2 ()) 3)"), "(1 (2 ()) 3)");
    }

    #[test]
    fn test_list_dot() {
        assert_eq!(sexpr("(1 . 2)"), "(1 . 2)");
        assert_eq!(sexpr("( 1 . 2 )"), "(1 . 2)");
        assert_eq!(sexpr("(1 2 . 3)"), "(1 2 . 3)");
    }

    #[test]
    fn test_list_whitespace() {
        assert_eq!(sexpr("(1 )"), "(1)");
        assert_eq!(sexpr("( 1)"), "(1)");
        assert_eq!(sexpr("(  1   2  )"), "(1 2)");
    }

    #[test]
    fn test_literals() {
        assert!(matches!(
            parse("hello").unwrap().kind,
            ValueKind::Symbol(s) if s == "hello"
        ));
        assert!(matches!(
            parse("\"hello\"").unwrap().kind,
            ValueKind::Str(s) if s == "hello"
        ));
        assert!(matches!(
            parse("2").unwrap().kind,
            ValueKind::Number(Number::Int(2))
        ));
    }

    #[test]
    fn test_numbers() {
        assert_eq!(sexpr("-2"), "-2");
        assert_eq!(sexpr("-0"), "0");
        assert_eq!(sexpr("0.1"), "0.1");
        assert_eq!(sexpr("-0.1"), "-0.1");
    }

    #[test]
    fn test_operator_symbols() {
        for op in ["+", "-", "*", "/", "<", "<=", ">=", "set!", "null?"] {
            assert!(
                matches!(&parse(op).unwrap().kind, ValueKind::Symbol(s) if s == op),
                "expected symbol for {}",
                op
            );
        }
    }

    #[test]
    fn test_quote() {
        assert_eq!(sexpr("'x"), "'x");
        assert_eq!(sexpr("'(1 2)"), "'(1 2)");
        assert_eq!(sexpr("' x"), "'x");
    }

    #[test]
    fn test_strings() {
        assert_eq!(sexpr("\"hei\""), "\"hei\"");
        assert!(matches!(
            parse("\"and\\nor\"").unwrap().kind,
            ValueKind::Str(s) if s == "and\nor"
        ));
        assert!(matches!(
            parse("\"back\\\\slash\"").unwrap().kind,
            ValueKind::Str(s) if s == "back\\slash"
        ));
        assert!(parse("\"bad\\escape\"").is_err());
    }

    #[test]
    fn test_comments() {
        assert_eq!(sexpr("; comment\n42"), "42");
        assert_eq!(sexpr("(1 2 ; comment\n 3)"), "(1 2 3)");
        assert_eq!(sexpr("#| multi\nline |# 7"), "7");
    }

    #[test]
    fn test_error_kinds() {
        assert!(parse("").unwrap_err().is_no_value());
        assert!(parse("#| comment |#").unwrap_err().is_no_value());
        assert!(parse("; only\n").unwrap_err().is_no_value());
        assert!(parse("(list").unwrap_err().is_eof());
        assert!(parse("#| comment").unwrap_err().is_eof());
        assert!(parse("\"string").unwrap_err().is_eof());
    }

    #[test]
    fn test_trailing_input_rejected() {
        assert!(parse("1 2").is_err());
    }

    #[test]
    fn test_tags_track_position() {
        let v = parse("foo").unwrap();
        let tag = v.tag.unwrap();
        assert_eq!(tag.line.row, 1);
        assert_eq!(tag.column, 1);

        let v = parse("(a\n  b)").unwrap();
        let elems = v.list_elements().unwrap();
        let tag = elems[1].tag.clone().unwrap();
        assert_eq!(tag.line.row, 2);
        assert_eq!(tag.column, 3);
    }

    #[test]
    fn test_round_trip_canonical_forms() {
        for src in ["(1 2 (3 . 4))", "'(a b)", "\"s\"", "(a (b) . c)", "()"] {
            let v = parse(src).unwrap();
            let reparsed = parse(&v.to_string()).unwrap();
            assert!(v.equal(&reparsed), "round trip failed for {}", src);
        }
    }

    #[test]
    fn test_reader_yields_successive_forms() {
        let text = "(a) (b)\n(c)";
        let mut reader = Reader::new("test", text);
        assert_eq!(reader.next_value().unwrap().to_string(), "(a)");
        assert_eq!(reader.next_value().unwrap().to_string(), "(b)");
        assert_eq!(reader.next_value().unwrap().to_string(), "(c)");
        assert!(reader.next_value().unwrap_err().is_no_value());
    }
}
