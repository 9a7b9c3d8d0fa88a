//! Content stream parsing
//!
//! Tokenizes page content streams into operator/operand pairs. The
//! analyzer does not interpret most of the graphics model; it needs just
//! enough structure to sample text-showing operators, follow CTM changes
//! for image placements, and spot vector art. Inline images (`BI..ID..EI`)
//! are skipped as opaque blobs but reported as image operators.

use super::lexer::{is_whitespace, Lexer, Token};
use super::object::parse_object;
use super::{ParseError, ParseResult};
use crate::objects::{PdfArray, PdfDictionary, PdfName, PdfObject, PdfString};

/// One content-stream operation: its operands in order, then the operator.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentOp {
    pub operator: String,
    pub operands: Vec<PdfObject>,
}

impl ContentOp {
    pub fn new(operator: impl Into<String>, operands: Vec<PdfObject>) -> Self {
        Self {
            operator: operator.into(),
            operands,
        }
    }

    pub fn class(&self) -> OperatorClass {
        OperatorClass::of(&self.operator)
    }

    /// First operand as a name (e.g. the XObject of a `Do`).
    pub fn name_operand(&self) -> Option<&str> {
        self.operands.first()?.as_name().map(PdfName::as_str)
    }

    /// The six numeric operands of `cm`/`Tm` as a matrix.
    pub fn matrix_operand(&self) -> Option<crate::geometry::Matrix> {
        if self.operands.len() != 6 {
            return None;
        }
        let mut v = [0.0; 6];
        for (slot, operand) in v.iter_mut().zip(&self.operands) {
            *slot = operand.as_real()?;
        }
        Some(crate::geometry::Matrix::new(
            v[0], v[1], v[2], v[3], v[4], v[5],
        ))
    }
}

/// Coarse operator classification; the analyzer dispatches on this rather
/// than on operator spellings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorClass {
    /// Tj, TJ, ', "
    TextShow,
    /// BT, ET, Tf, Tr, Td, TD, Tm, T*, Tc, Tw, Tz, TL, Ts
    TextState,
    /// m, l, c, v, y, re, h
    PathConstruct,
    /// S, s, f, F, f*, B, B*, b, b*, n
    PathPaint,
    /// Do
    XObject,
    /// BI (payload already skipped)
    InlineImage,
    /// q, Q, cm, gs, w, J, j, M, d, ri, i
    GraphicsState,
    Other,
}

impl OperatorClass {
    pub fn of(op: &str) -> Self {
        match op {
            "Tj" | "TJ" | "'" | "\"" => OperatorClass::TextShow,
            "BT" | "ET" | "Tf" | "Tr" | "Td" | "TD" | "Tm" | "T*" | "Tc" | "Tw" | "Tz"
            | "TL" | "Ts" => OperatorClass::TextState,
            "m" | "l" | "c" | "v" | "y" | "re" | "h" => OperatorClass::PathConstruct,
            "S" | "s" | "f" | "F" | "f*" | "B" | "B*" | "b" | "b*" | "n" => {
                OperatorClass::PathPaint
            }
            "Do" => OperatorClass::XObject,
            "BI" => OperatorClass::InlineImage,
            "q" | "Q" | "cm" | "gs" | "w" | "J" | "j" | "M" | "d" | "ri" | "i" => {
                OperatorClass::GraphicsState
            }
            _ => OperatorClass::Other,
        }
    }
}

/// Content stream tokenizer.
pub struct ContentParser;

impl ContentParser {
    /// Parses a (decoded) content stream into its operations. Malformed
    /// trailing bytes end the stream rather than failing it; truncated
    /// content is routine in scanned documents and the analyzer treats
    /// what was readable as best-effort.
    pub fn parse(data: &[u8]) -> ParseResult<Vec<ContentOp>> {
        let mut lexer = Lexer::new(data);
        let mut ops = Vec::new();
        let mut operands: Vec<PdfObject> = Vec::new();

        loop {
            let saved = lexer.position();
            let token = match lexer.next_token() {
                Ok(t) => t,
                Err(_) => break,
            };
            match token {
                Token::Eof => break,
                Token::Keyword(kw) => match kw.as_str() {
                    "true" => operands.push(PdfObject::Boolean(true)),
                    "false" => operands.push(PdfObject::Boolean(false)),
                    "null" => operands.push(PdfObject::Null),
                    "BI" => {
                        let dict = skip_inline_image(&mut lexer)?;
                        ops.push(ContentOp::new("BI", vec![PdfObject::Dictionary(dict)]));
                        operands.clear();
                    }
                    _ => {
                        ops.push(ContentOp::new(kw, std::mem::take(&mut operands)));
                    }
                },
                _ => {
                    lexer.seek(saved);
                    match parse_object(&mut lexer) {
                        Ok(obj) => operands.push(obj),
                        Err(_) => break,
                    }
                }
            }
        }
        Ok(ops)
    }

    /// Serializes operations back into content-stream bytes. Used by the
    /// redo-ocr path after stripping invisible text.
    pub fn serialize(ops: &[ContentOp]) -> Vec<u8> {
        let mut out = Vec::new();
        for op in ops {
            for operand in &op.operands {
                operand.write_to(&mut out);
                out.push(b' ');
            }
            out.extend_from_slice(op.operator.as_bytes());
            out.push(b'\n');
        }
        out
    }
}

/// Consumes an inline image: the parameter dictionary between `BI` and
/// `ID`, then the binary payload up to a whitespace-delimited `EI`.
fn skip_inline_image(lexer: &mut Lexer<'_>) -> ParseResult<PdfDictionary> {
    let mut dict = PdfDictionary::new();
    loop {
        match lexer.next_token()? {
            Token::Keyword(kw) if kw == "ID" => break,
            Token::Name(key) => {
                let value = parse_object(lexer)?;
                dict.insert(key, value);
            }
            Token::Eof => return Err(ParseError::UnexpectedEof),
            _ => {}
        }
    }
    // One whitespace byte separates ID from the payload.
    lexer.seek(lexer.position() + 1);
    loop {
        let Some(ei) = lexer.find_forward(b"EI") else {
            return Err(ParseError::UnexpectedEof);
        };
        let before = if ei == 0 {
            b' '
        } else {
            lexer.byte_at(ei - 1).unwrap_or(b' ')
        };
        let after = lexer.byte_at(ei + 2).unwrap_or(b' ');
        if is_whitespace(before) && is_whitespace(after) {
            lexer.seek(ei + 2);
            return Ok(dict);
        }
        lexer.seek(ei + 2);
    }
}

/// Extracts the byte strings shown by a text operator (`Tj`, `'`, `"`
/// carry one string; `TJ` carries an array interleaved with kerning).
pub fn shown_strings(op: &ContentOp) -> Vec<&PdfString> {
    match op.operator.as_str() {
        "Tj" | "'" | "\"" => op
            .operands
            .iter()
            .filter_map(|o| o.as_string())
            .collect(),
        "TJ" => op
            .operands
            .first()
            .and_then(PdfObject::as_array)
            .map(|a: &PdfArray| a.iter().filter_map(|o| o.as_string()).collect())
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_image_placement() {
        let ops = ContentParser::parse(b"q 300 0 0 400 56 112 cm /Im0 Do Q").unwrap();
        assert_eq!(ops.len(), 4);
        assert_eq!(ops[0].operator, "q");
        let cm = &ops[1];
        assert_eq!(cm.class(), OperatorClass::GraphicsState);
        let m = cm.matrix_operand().unwrap();
        assert_eq!(m.a, 300.0);
        assert_eq!(m.f, 112.0);
        assert_eq!(ops[2].class(), OperatorClass::XObject);
        assert_eq!(ops[2].name_operand(), Some("Im0"));
    }

    #[test]
    fn test_parse_text_block() {
        let ops =
            ContentParser::parse(b"BT /F1 12 Tf 3 Tr 72 720 Td (Hello) Tj [(a) -120 (b)] TJ ET")
                .unwrap();
        let shows: Vec<_> = ops
            .iter()
            .filter(|op| op.class() == OperatorClass::TextShow)
            .collect();
        assert_eq!(shows.len(), 2);
        assert_eq!(shown_strings(shows[0])[0].as_bytes(), b"Hello");
        let tj_strings = shown_strings(shows[1]);
        assert_eq!(tj_strings.len(), 2);
        assert_eq!(tj_strings[1].as_bytes(), b"b");
    }

    #[test]
    fn test_render_mode_operand() {
        let ops = ContentParser::parse(b"3 Tr").unwrap();
        assert_eq!(ops[0].operator, "Tr");
        assert_eq!(ops[0].operands[0].as_integer(), Some(3));
    }

    #[test]
    fn test_truncated_stream_keeps_prefix() {
        let ops = ContentParser::parse(b"q 1 0 0 1 0 0 cm /Im0 Do (unterminated").unwrap();
        assert_eq!(ops.len(), 3);
    }

    #[test]
    fn test_inline_image_is_skipped() {
        let data = b"q BI /W 4 /H 4 /BPC 8 /CS /G ID \x01\x02\x03\x04 EI Q";
        let ops = ContentParser::parse(data).unwrap();
        let classes: Vec<_> = ops.iter().map(ContentOp::class).collect();
        assert!(classes.contains(&OperatorClass::InlineImage));
        assert_eq!(ops.last().unwrap().operator, "Q");
    }

    #[test]
    fn test_serialize_roundtrip() {
        let src = b"q 1 0 0 1 10 20 cm /Im0 Do Q\n";
        let ops = ContentParser::parse(src).unwrap();
        let bytes = ContentParser::serialize(&ops);
        let reparsed = ContentParser::parse(&bytes).unwrap();
        assert_eq!(ops, reparsed);
    }

    #[test]
    fn test_path_paint_classification() {
        let ops = ContentParser::parse(b"0 0 100 100 re f").unwrap();
        assert_eq!(ops[0].class(), OperatorClass::PathConstruct);
        assert_eq!(ops[1].class(), OperatorClass::PathPaint);
    }
}
