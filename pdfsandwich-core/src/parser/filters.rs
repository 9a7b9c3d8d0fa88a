//! Stream filter decoding
//!
//! Decodes the general-purpose filters the pipeline needs to look inside
//! streams: FlateDecode (with PNG and TIFF predictors), ASCIIHexDecode and
//! RunLengthDecode. Image-specific filters (DCTDecode, CCITTFaxDecode,
//! JBIG2Decode, JPXDecode) are deliberately left encoded here; the image
//! optimizer decides whether decoding them is worth it and uses its own
//! codecs.

use super::{ParseError, ParseResult};
use crate::objects::{PdfDictionary, PdfObject, PdfStream};

/// Filters that stay encoded in the object model.
pub const IMAGE_FILTERS: &[&str] = &["DCTDecode", "CCITTFaxDecode", "JBIG2Decode", "JPXDecode"];

/// Decodes a stream's payload by applying its filter chain in order.
/// Stops (successfully) at the first image filter; the caller can see what
/// remains via [`PdfStream::filters`].
pub fn decode_stream(stream: &PdfStream) -> ParseResult<Vec<u8>> {
    let mut data = stream.raw_data().to_vec();
    let parms = decode_parms(&stream.dict);
    for (i, filter) in stream.filters().iter().enumerate() {
        if IMAGE_FILTERS.contains(&filter.as_str()) {
            break;
        }
        let parm = parms.get(i).cloned().flatten();
        data = apply_filter(&data, filter, parm.as_ref())?;
    }
    Ok(data)
}

fn decode_parms(dict: &PdfDictionary) -> Vec<Option<PdfDictionary>> {
    match dict.get("DecodeParms").or_else(|| dict.get("DP")) {
        Some(PdfObject::Dictionary(d)) => vec![Some(d.clone())],
        Some(PdfObject::Array(a)) => a
            .iter()
            .map(|o| match o {
                PdfObject::Dictionary(d) => Some(d.clone()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn apply_filter(
    data: &[u8],
    filter: &str,
    parms: Option<&PdfDictionary>,
) -> ParseResult<Vec<u8>> {
    match filter {
        "FlateDecode" | "Fl" => {
            let inflated = crate::compression::decompress(data)
                .map_err(|e| ParseError::StreamDecode(e.to_string()))?;
            apply_predictor(inflated, parms)
        }
        "ASCIIHexDecode" | "AHx" => decode_ascii_hex(data),
        "RunLengthDecode" | "RL" => decode_run_length(data),
        other => Err(ParseError::UnsupportedFilter(other.to_string())),
    }
}

fn parm_int(parms: Option<&PdfDictionary>, key: &str, default: i64) -> i64 {
    parms
        .and_then(|p| p.get(key))
        .and_then(|o| o.as_integer())
        .unwrap_or(default)
}

/// Undoes the Predictor entry of DecodeParms. Predictor 2 is the TIFF
/// horizontal differencing predictor; 10..=15 are the PNG row filters.
fn apply_predictor(data: Vec<u8>, parms: Option<&PdfDictionary>) -> ParseResult<Vec<u8>> {
    let predictor = parm_int(parms, "Predictor", 1);
    if predictor <= 1 {
        return Ok(data);
    }
    let colors = parm_int(parms, "Colors", 1).max(1) as usize;
    let bpc = parm_int(parms, "BitsPerComponent", 8).max(1) as usize;
    let columns = parm_int(parms, "Columns", 1).max(1) as usize;
    let bpp = (colors * bpc).div_ceil(8).max(1);
    let row_len = (columns * colors * bpc).div_ceil(8);

    if predictor == 2 {
        let mut out = data;
        for row in out.chunks_mut(row_len) {
            for i in bpp..row.len() {
                row[i] = row[i].wrapping_add(row[i - bpp]);
            }
        }
        return Ok(out);
    }

    // PNG predictors prefix every row with a filter-type byte.
    let stride = row_len + 1;
    let mut out = Vec::with_capacity(data.len() / stride * row_len);
    let mut prev_row = vec![0u8; row_len];
    for chunk in data.chunks(stride) {
        if chunk.len() < 2 {
            break;
        }
        let (filter_type, row_in) = (chunk[0], &chunk[1..]);
        let mut row = row_in.to_vec();
        match filter_type {
            0 => {}
            1 => {
                for i in bpp..row.len() {
                    row[i] = row[i].wrapping_add(row[i - bpp]);
                }
            }
            2 => {
                for i in 0..row.len() {
                    row[i] = row[i].wrapping_add(prev_row[i]);
                }
            }
            3 => {
                for i in 0..row.len() {
                    let left = if i >= bpp { row[i - bpp] as u16 } else { 0 };
                    let up = prev_row[i] as u16;
                    row[i] = row[i].wrapping_add(((left + up) / 2) as u8);
                }
            }
            4 => {
                for i in 0..row.len() {
                    let left = if i >= bpp { row[i - bpp] } else { 0 };
                    let up = prev_row[i];
                    let up_left = if i >= bpp { prev_row[i - bpp] } else { 0 };
                    row[i] = row[i].wrapping_add(paeth(left, up, up_left));
                }
            }
            other => {
                return Err(ParseError::StreamDecode(format!(
                    "unknown PNG predictor row filter {other}"
                )))
            }
        }
        out.extend_from_slice(&row);
        prev_row = row;
    }
    Ok(out)
}

fn paeth(a: u8, b: u8, c: u8) -> u8 {
    let p = a as i16 + b as i16 - c as i16;
    let (pa, pb, pc) = (
        (p - a as i16).abs(),
        (p - b as i16).abs(),
        (p - c as i16).abs(),
    );
    if pa <= pb && pa <= pc {
        a
    } else if pb <= pc {
        b
    } else {
        c
    }
}

fn decode_ascii_hex(data: &[u8]) -> ParseResult<Vec<u8>> {
    let mut digits = Vec::new();
    for &b in data {
        match b {
            b'>' => break,
            b if super::lexer::is_whitespace(b) => continue,
            b => {
                let d = (b as char)
                    .to_digit(16)
                    .ok_or_else(|| ParseError::StreamDecode("bad hex digit".to_string()))?;
                digits.push(d as u8);
            }
        }
    }
    if digits.len() % 2 == 1 {
        digits.push(0);
    }
    Ok(digits.chunks_exact(2).map(|c| c[0] * 16 + c[1]).collect())
}

fn decode_run_length(data: &[u8]) -> ParseResult<Vec<u8>> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let len = data[i];
        i += 1;
        match len {
            0..=127 => {
                let count = len as usize + 1;
                if i + count > data.len() {
                    return Err(ParseError::StreamDecode("run length overruns data".into()));
                }
                out.extend_from_slice(&data[i..i + count]);
                i += count;
            }
            128 => break,
            129..=255 => {
                let byte = *data
                    .get(i)
                    .ok_or_else(|| ParseError::StreamDecode("run length overruns data".into()))?;
                out.extend(std::iter::repeat(byte).take(257 - len as usize));
                i += 1;
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::PdfDictionary;

    fn flate_stream(payload: &[u8]) -> PdfStream {
        let mut dict = PdfDictionary::new();
        dict.insert("Filter", PdfObject::name("FlateDecode"));
        PdfStream::new(dict, crate::compression::compress(payload).unwrap())
    }

    #[test]
    fn test_flate_roundtrip() {
        let stream = flate_stream(b"q 612 0 0 792 0 0 cm /Im0 Do Q");
        assert_eq!(decode_stream(&stream).unwrap(), b"q 612 0 0 792 0 0 cm /Im0 Do Q");
    }

    #[test]
    fn test_unfiltered_stream_passes_through() {
        let stream = PdfStream::new(PdfDictionary::new(), b"raw".to_vec());
        assert_eq!(decode_stream(&stream).unwrap(), b"raw");
    }

    #[test]
    fn test_image_filter_stays_encoded() {
        let mut dict = PdfDictionary::new();
        dict.insert("Filter", PdfObject::name("DCTDecode"));
        let stream = PdfStream::new(dict, vec![0xFF, 0xD8, 0xFF]);
        assert_eq!(decode_stream(&stream).unwrap(), vec![0xFF, 0xD8, 0xFF]);
    }

    #[test]
    fn test_ascii_hex() {
        assert_eq!(decode_ascii_hex(b"48 65 6C 6C 6F>").unwrap(), b"Hello");
    }

    #[test]
    fn test_run_length() {
        // Literal run "ab", then 'c' repeated 4 times, then EOD.
        let encoded = [1, b'a', b'b', 253, b'c', 128];
        assert_eq!(decode_run_length(&encoded).unwrap(), b"abcccc");
    }

    #[test]
    fn test_png_up_predictor() {
        // Two rows of 3 bytes, row filter 2 (Up).
        let raw = [2u8, 1, 1, 1, 2, 1, 1, 1];
        let mut parms = PdfDictionary::new();
        parms.insert("Predictor", PdfObject::Integer(12));
        parms.insert("Columns", PdfObject::Integer(3));
        let out = apply_predictor(raw.to_vec(), Some(&parms)).unwrap();
        assert_eq!(out, vec![1, 1, 1, 2, 2, 2]);
    }

    #[test]
    fn test_tiff_predictor() {
        let raw = vec![10u8, 1, 1];
        let mut parms = PdfDictionary::new();
        parms.insert("Predictor", PdfObject::Integer(2));
        parms.insert("Columns", PdfObject::Integer(3));
        let out = apply_predictor(raw, Some(&parms)).unwrap();
        assert_eq!(out, vec![10, 11, 12]);
    }
}
