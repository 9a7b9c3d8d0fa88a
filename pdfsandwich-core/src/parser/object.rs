//! PDF object syntax
//!
//! Builds [`PdfObject`] values from the token stream, including the
//! `N G obj ... endobj` indirect wrapper and stream payloads. Stream
//! `/Length` entries that are indirect references are resolved through a
//! caller-supplied lookup; when that fails the payload boundary is
//! recovered by scanning for `endstream`, which is what broken scanner
//! output most often requires.

use super::lexer::{Lexer, Token};
use super::{ParseError, ParseResult};
use crate::objects::{ObjectId, PdfArray, PdfDictionary, PdfName, PdfObject, PdfStream, PdfString};

/// Parses one object at the lexer's current position. Handles the
/// `Integer Integer R` reference form by lookahead.
pub fn parse_object(lexer: &mut Lexer<'_>) -> ParseResult<PdfObject> {
    let token = lexer.next_token()?;
    parse_from_token(lexer, token)
}

fn parse_from_token(lexer: &mut Lexer<'_>, token: Token) -> ParseResult<PdfObject> {
    match token {
        Token::Integer(num) => {
            // Possible reference: "N G R".
            let saved = lexer.position();
            if let (Token::Integer(generation), Token::Keyword(kw)) =
                (next_or_eof(lexer), next_or_eof(lexer))
            {
                if kw == "R" && num >= 0 && (0..=u16::MAX as i64).contains(&generation) {
                    return Ok(PdfObject::Reference(ObjectId::new(
                        num as u32,
                        generation as u16,
                    )));
                }
            }
            lexer.seek(saved);
            Ok(PdfObject::Integer(num))
        }
        Token::Real(r) => Ok(PdfObject::Real(r)),
        Token::String(s) => Ok(PdfObject::String(PdfString(s))),
        Token::Name(n) => Ok(PdfObject::Name(PdfName(n))),
        Token::ArrayStart => parse_array(lexer),
        Token::DictStart => parse_dictionary(lexer).map(PdfObject::Dictionary),
        Token::Keyword(kw) => match kw.as_str() {
            "null" => Ok(PdfObject::Null),
            "true" => Ok(PdfObject::Boolean(true)),
            "false" => Ok(PdfObject::Boolean(false)),
            other => Err(ParseError::UnexpectedToken {
                expected: "PDF object".to_string(),
                found: other.to_string(),
            }),
        },
        Token::Eof => Err(ParseError::UnexpectedEof),
        other => Err(ParseError::UnexpectedToken {
            expected: "PDF object".to_string(),
            found: format!("{other:?}"),
        }),
    }
}

fn next_or_eof(lexer: &mut Lexer<'_>) -> Token {
    lexer.next_token().unwrap_or(Token::Eof)
}

fn parse_array(lexer: &mut Lexer<'_>) -> ParseResult<PdfObject> {
    let mut elements = PdfArray::new();
    loop {
        let token = lexer.next_token()?;
        match token {
            Token::ArrayEnd => break,
            Token::Eof => return Err(ParseError::UnexpectedEof),
            other => elements.push(parse_from_token(lexer, other)?),
        }
    }
    Ok(PdfObject::Array(elements))
}

pub(crate) fn parse_dictionary(lexer: &mut Lexer<'_>) -> ParseResult<PdfDictionary> {
    let mut dict = PdfDictionary::new();
    loop {
        let token = lexer.next_token()?;
        match token {
            Token::DictEnd => break,
            Token::Name(key) => {
                let value = parse_object(lexer)?;
                dict.insert(key, value);
            }
            Token::Eof => return Err(ParseError::UnexpectedEof),
            other => {
                return Err(ParseError::UnexpectedToken {
                    expected: "dictionary key or >>".to_string(),
                    found: format!("{other:?}"),
                })
            }
        }
    }
    Ok(dict)
}

/// Parses an indirect object (`N G obj ... endobj`) at the current
/// position. `resolve_length` maps a `/Length` reference to its value; it
/// may return `None`, in which case the stream extent is recovered by
/// scanning.
pub fn parse_indirect_object(
    lexer: &mut Lexer<'_>,
    resolve_length: &dyn Fn(ObjectId) -> Option<i64>,
) -> ParseResult<(ObjectId, PdfObject)> {
    let id = parse_object_header(lexer)?;
    let body = parse_object(lexer)?;

    // A dictionary may be the prelude of a stream.
    let object = if let PdfObject::Dictionary(dict) = body {
        let saved = lexer.position();
        match lexer.next_token()? {
            Token::Keyword(kw) if kw == "stream" => {
                let data = read_stream_payload(lexer, &dict, resolve_length)?;
                PdfObject::Stream(PdfStream::new(dict, data))
            }
            _ => {
                lexer.seek(saved);
                PdfObject::Dictionary(dict)
            }
        }
    } else {
        body
    };

    // Tolerate a missing endobj; the next object header resynchronizes.
    let saved = lexer.position();
    match lexer.next_token()? {
        Token::Keyword(kw) if kw == "endobj" => {}
        _ => lexer.seek(saved),
    }
    Ok((id, object))
}

fn parse_object_header(lexer: &mut Lexer<'_>) -> ParseResult<ObjectId> {
    let number = match lexer.next_token()? {
        Token::Integer(n) if n >= 0 => n as u32,
        other => {
            return Err(ParseError::UnexpectedToken {
                expected: "object number".to_string(),
                found: format!("{other:?}"),
            })
        }
    };
    let generation = match lexer.next_token()? {
        Token::Integer(g) if (0..=u16::MAX as i64).contains(&g) => g as u16,
        other => {
            return Err(ParseError::UnexpectedToken {
                expected: "generation number".to_string(),
                found: format!("{other:?}"),
            })
        }
    };
    match lexer.next_token()? {
        Token::Keyword(kw) if kw == "obj" => Ok(ObjectId::new(number, generation)),
        other => Err(ParseError::UnexpectedToken {
            expected: "obj".to_string(),
            found: format!("{other:?}"),
        }),
    }
}

fn read_stream_payload(
    lexer: &mut Lexer<'_>,
    dict: &PdfDictionary,
    resolve_length: &dyn Fn(ObjectId) -> Option<i64>,
) -> ParseResult<Vec<u8>> {
    lexer.skip_stream_eol();

    let declared = match dict.get("Length") {
        Some(PdfObject::Integer(len)) if *len >= 0 => Some(*len as usize),
        Some(PdfObject::Reference(id)) => resolve_length(*id).map(|l| l.max(0) as usize),
        _ => None,
    };

    if let Some(len) = declared {
        let saved = lexer.position();
        if let Ok(data) = lexer.read_bytes(len) {
            // The declared length is only trusted when endstream actually
            // follows; scanners with off-by-EOL Lengths are common.
            let check = lexer.position();
            if matches!(lexer.next_token(), Ok(Token::Keyword(kw)) if kw == "endstream") {
                return Ok(data);
            }
            lexer.seek(check);
            if scan_endstream(lexer).is_some() {
                lexer.seek(saved);
            } else {
                return Ok(data);
            }
        } else {
            lexer.seek(saved);
        }
    }

    // Recover the payload by scanning for the closing keyword.
    let start = lexer.position();
    let end = scan_endstream(lexer).ok_or(ParseError::UnexpectedEof)?;
    let mut payload_end = end;
    // Trim the EOL that separates payload from "endstream".
    let data = lexer.read_bytes(end - start)?;
    if payload_end > start && data.last() == Some(&b'\n') {
        payload_end -= 1;
        if payload_end > start && data[payload_end - start - 1] == b'\r' {
            payload_end -= 1;
        }
    } else if payload_end > start && data.last() == Some(&b'\r') {
        payload_end -= 1;
    }
    let trimmed = data[..payload_end - start].to_vec();
    match lexer.next_token()? {
        Token::Keyword(kw) if kw == "endstream" => Ok(trimmed),
        other => Err(ParseError::UnexpectedToken {
            expected: "endstream".to_string(),
            found: format!("{other:?}"),
        }),
    }
}

fn scan_endstream(lexer: &Lexer<'_>) -> Option<usize> {
    lexer.find_forward(b"endstream")
}
