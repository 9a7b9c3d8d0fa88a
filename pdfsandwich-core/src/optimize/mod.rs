//! Post-OCR image optimization
//!
//! Walks the output document's image XObjects exactly once and re-encodes
//! each where a smaller encoding exists, governed by the 0..=3 level
//! policy: level 0 is off, level 1 allows lossless transforms only,
//! levels 2 and 3 allow increasingly lossy JPEG and palette
//! re-quantization. Monochrome images become JBIG2 when an encoder is
//! wired (grouped page-by-page around a shared symbol dictionary) and
//! CCITT G4 otherwise.
//!
//! Never touched: image masks, soft masks, images referenced from
//! patterns, and images whose decoded size exceeds the configured cap.

pub mod ccitt;

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::process::Command;

use tracing::{debug, info, warn};

use crate::error::{PdfError, Result};
use crate::objects::{ObjectId, PdfArray, PdfDictionary, PdfName, PdfObject, PdfStream, PdfString};
use crate::parser::filters;

/// Palette images with more colors than this cannot stay indexed.
const MAX_PALETTE: usize = 256;

/// Lossy re-encode must shrink by at least this factor to be kept.
const LOSSY_KEEP_RATIO: f64 = 0.9;

#[derive(Debug, Clone)]
pub struct OptimizeOptions {
    pub level: u8,
    /// Images above this decoded size are left alone.
    pub max_image_mpix: f64,
    /// Pages per shared-dictionary JBIG2 group.
    pub jbig2_page_group_size: usize,
    pub jbig2_encoder: Option<PathBuf>,
    pub pngquant: Option<PathBuf>,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        Self {
            level: 1,
            max_image_mpix: 250.0,
            jbig2_page_group_size: 10,
            jbig2_encoder: None,
            pngquant: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimizeReport {
    pub images_examined: usize,
    pub images_replaced: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

impl OptimizeReport {
    pub fn ratio(&self) -> f64 {
        if self.bytes_before == 0 {
            1.0
        } else {
            self.bytes_after as f64 / self.bytes_before as f64
        }
    }
}

/// Re-encodes image XObjects in place. Pages are discovered through the
/// trailer so grouping follows page order; ids for new shared objects
/// (JBIG2 globals) are allocated past the arena's maximum, keeping the
/// pass deterministic.
pub fn optimize_images(
    objects: &mut BTreeMap<ObjectId, PdfObject>,
    trailer: &PdfDictionary,
    options: &OptimizeOptions,
) -> Result<OptimizeReport> {
    let mut report = OptimizeReport::default();
    if options.level == 0 {
        return Ok(report);
    }

    let pages = page_order(objects, trailer);
    let excluded = excluded_ids(objects, &pages);

    // Page-ordered, deduplicated image list.
    let mut seen: HashSet<ObjectId> = HashSet::new();
    let mut per_page: Vec<(usize, Vec<ObjectId>)> = Vec::new();
    for (page_number, page_id) in pages.iter().enumerate() {
        let image_ids: Vec<ObjectId> = page_xobject_ids(objects, *page_id)
            .into_iter()
            .filter(|id| seen.insert(*id))
            .filter(|id| !excluded.contains(id))
            .filter(|id| is_image(objects.get(id)))
            .collect();
        if !image_ids.is_empty() {
            per_page.push((page_number, image_ids));
        }
    }

    let mut mono_by_group: Vec<Vec<(ObjectId, ccitt::Bitmap)>> = Vec::new();
    let group_pages = options.jbig2_page_group_size.max(1);

    for (page_number, image_ids) in &per_page {
        for &id in image_ids {
            let Some(stream) = objects.get(&id).and_then(PdfObject::as_stream).cloned() else {
                continue;
            };
            report.images_examined += 1;
            let before = stream.raw_data().len() as u64;

            let profile = ImageProfile::of(&stream, objects);
            if profile.megapixels() > options.max_image_mpix {
                debug!(image = %id, mpix = profile.megapixels(), "image too large, skipping");
                continue;
            }

            let replacement = match profile.class {
                ImageClass::Mono => {
                    match decode_mono(&stream, &profile) {
                        Some(bitmap) if options.jbig2_encoder.is_some() => {
                            // Deferred: JBIG2 groups are encoded together.
                            let group = page_number / group_pages;
                            while mono_by_group.len() <= group {
                                mono_by_group.push(Vec::new());
                            }
                            mono_by_group[group].push((id, bitmap));
                            None
                        }
                        Some(bitmap) => encode_mono_g4(&stream, &profile, &bitmap),
                        None => None,
                    }
                }
                ImageClass::Indexed => optimize_indexed(&stream, objects, options),
                ImageClass::ContinuousTone => {
                    optimize_continuous(&stream, &profile, options)
                }
                ImageClass::Keep => None,
            };

            if let Some(new_stream) = replacement {
                let after = new_stream.raw_data().len() as u64;
                if after < before {
                    report.images_replaced += 1;
                    report.bytes_before += before;
                    report.bytes_after += after;
                    objects.insert(id, PdfObject::Stream(new_stream));
                } else {
                    debug!(image = %id, before, after, "candidate encoding larger, keeping source");
                }
            }
        }
    }

    if let Some(encoder) = &options.jbig2_encoder {
        encode_jbig2_groups(objects, mono_by_group, encoder, &mut report);
    }

    if report.ratio() > 1.0 {
        warn!(
            ratio = report.ratio(),
            "optimization grew the image data; sources were already efficient"
        );
    }
    info!(
        examined = report.images_examined,
        replaced = report.images_replaced,
        "image optimization finished"
    );
    Ok(report)
}

/// Broad handling class an image falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImageClass {
    Mono,
    Indexed,
    ContinuousTone,
    Keep,
}

struct ImageProfile {
    class: ImageClass,
    width: usize,
    height: usize,
    bits_per_component: u8,
    components: usize,
    gray: bool,
    dct: bool,
}

impl ImageProfile {
    fn of(stream: &PdfStream, objects: &BTreeMap<ObjectId, PdfObject>) -> Self {
        let dict = &stream.dict;
        let width = int_attr(dict, "Width", objects).unwrap_or(0) as usize;
        let height = int_attr(dict, "Height", objects).unwrap_or(0) as usize;
        let bpc = int_attr(dict, "BitsPerComponent", objects).unwrap_or(8) as u8;
        let filters = stream.filters();
        let last_filter = filters.last().map(String::as_str).unwrap_or("");
        let dct = last_filter == "DCTDecode";

        let (class, components, gray) = match resolve_colorspace(dict.get("ColorSpace"), objects) {
            _ if bpc == 1 => (ImageClass::Mono, 1, true),
            ColorFamily::Gray => (ImageClass::ContinuousTone, 1, true),
            ColorFamily::Rgb => (ImageClass::ContinuousTone, 3, false),
            ColorFamily::Indexed => (ImageClass::Indexed, 1, false),
            ColorFamily::CmykOrOther => (ImageClass::Keep, 4, false),
        };
        // JPX and CCITT/JBIG2 sources stay as they are; transcoding them
        // needs decoders this crate does not carry.
        let class = match last_filter {
            "JPXDecode" | "CCITTFaxDecode" | "JBIG2Decode" => ImageClass::Keep,
            _ => class,
        };
        Self {
            class,
            width,
            height,
            bits_per_component: bpc,
            components,
            gray,
            dct,
        }
    }

    fn megapixels(&self) -> f64 {
        (self.width as f64 * self.height as f64) / 1.0e6
    }
}

enum ColorFamily {
    Gray,
    Rgb,
    Indexed,
    CmykOrOther,
}

fn resolve<'a>(
    obj: &'a PdfObject,
    objects: &'a BTreeMap<ObjectId, PdfObject>,
) -> &'a PdfObject {
    match obj {
        PdfObject::Reference(id) => objects.get(id).unwrap_or(&PdfObject::Null),
        other => other,
    }
}

fn int_attr(
    dict: &PdfDictionary,
    key: &str,
    objects: &BTreeMap<ObjectId, PdfObject>,
) -> Option<i64> {
    dict.get(key).map(|o| resolve(o, objects))?.as_integer()
}

fn resolve_colorspace(
    cs: Option<&PdfObject>,
    objects: &BTreeMap<ObjectId, PdfObject>,
) -> ColorFamily {
    let Some(cs) = cs.map(|o| resolve(o, objects)) else {
        return ColorFamily::CmykOrOther;
    };
    match cs {
        PdfObject::Name(n) => match n.as_str() {
            "DeviceGray" | "CalGray" => ColorFamily::Gray,
            "DeviceRGB" | "CalRGB" => ColorFamily::Rgb,
            _ => ColorFamily::CmykOrOther,
        },
        PdfObject::Array(a) => match a.get(0).and_then(|o| o.as_name()).map(PdfName::as_str) {
            Some("Indexed") => ColorFamily::Indexed,
            Some("ICCBased") => {
                let n = a
                    .get(1)
                    .map(|o| resolve(o, objects))
                    .and_then(|o| o.as_dict())
                    .and_then(|d| d.get("N"))
                    .and_then(|o| o.as_integer());
                match n {
                    Some(1) => ColorFamily::Gray,
                    Some(3) => ColorFamily::Rgb,
                    _ => ColorFamily::CmykOrOther,
                }
            }
            _ => ColorFamily::CmykOrOther,
        },
        _ => ColorFamily::CmykOrOther,
    }
}

fn is_image(obj: Option<&PdfObject>) -> bool {
    obj.and_then(PdfObject::as_stream)
        .map(|s| {
            s.dict
                .get("Subtype")
                .and_then(|o| o.as_name())
                .map(|n| n.as_str() == "Image")
                .unwrap_or(false)
        })
        .unwrap_or(false)
}

/// Pages in document order.
fn page_order(
    objects: &BTreeMap<ObjectId, PdfObject>,
    trailer: &PdfDictionary,
) -> Vec<ObjectId> {
    let mut out = Vec::new();
    let Some(root) = trailer.get("Root").map(|o| resolve(o, objects)).and_then(|o| o.as_dict())
    else {
        return out;
    };
    let Some(pages_id) = root.get("Pages").and_then(|o| o.as_reference()) else {
        return out;
    };
    let mut visited = HashSet::new();
    let mut stack = vec![pages_id];
    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        let Some(dict) = objects.get(&id).and_then(PdfObject::as_dict) else {
            continue;
        };
        match dict.get_type() {
            Some("Pages") => {
                if let Some(kids) = dict.get("Kids").map(|o| resolve(o, objects)).and_then(|o| o.as_array()) {
                    // Stack reverses; push kids backwards to keep order.
                    for kid in kids.iter().rev() {
                        if let Some(kid_id) = kid.as_reference() {
                            stack.push(kid_id);
                        }
                    }
                }
            }
            _ => out.push(id),
        }
    }
    out
}

fn page_xobject_ids(
    objects: &BTreeMap<ObjectId, PdfObject>,
    page_id: ObjectId,
) -> Vec<ObjectId> {
    let Some(page) = objects.get(&page_id).and_then(PdfObject::as_dict) else {
        return Vec::new();
    };
    let Some(resources) = page
        .get("Resources")
        .map(|o| resolve(o, objects))
        .and_then(|o| o.as_dict())
    else {
        return Vec::new();
    };
    resources
        .get("XObject")
        .map(|o| resolve(o, objects))
        .and_then(|o| o.as_dict())
        .map(|x| x.iter().filter_map(|(_, v)| v.as_reference()).collect())
        .unwrap_or_default()
}

/// Object ids the optimizer must never rewrite: stencil/image masks, soft
/// mask targets, and anything reachable from a pattern resource.
fn excluded_ids(
    objects: &BTreeMap<ObjectId, PdfObject>,
    pages: &[ObjectId],
) -> HashSet<ObjectId> {
    let mut excluded = HashSet::new();
    for (id, obj) in objects.iter() {
        let Some(stream) = obj.as_stream() else {
            continue;
        };
        if stream
            .dict
            .get("ImageMask")
            .and_then(|o| o.as_bool())
            .unwrap_or(false)
        {
            excluded.insert(*id);
        }
        if let Some(smask) = stream.dict.get("SMask").and_then(|o| o.as_reference()) {
            excluded.insert(smask);
        }
    }
    for page_id in pages {
        let Some(page) = objects.get(page_id).and_then(PdfObject::as_dict) else {
            continue;
        };
        let Some(resources) = page
            .get("Resources")
            .map(|o| resolve(o, objects))
            .and_then(|o| o.as_dict())
        else {
            continue;
        };
        if let Some(patterns) = resources
            .get("Pattern")
            .map(|o| resolve(o, objects))
            .and_then(|o| o.as_dict())
        {
            for (_, pattern) in patterns.iter() {
                if let Some(pattern_dict) = resolve(pattern, objects).as_dict() {
                    if let Some(pattern_resources) = pattern_dict
                        .get("Resources")
                        .map(|o| resolve(o, objects))
                        .and_then(|o| o.as_dict())
                    {
                        if let Some(xobjects) = pattern_resources
                            .get("XObject")
                            .map(|o| resolve(o, objects))
                            .and_then(|o| o.as_dict())
                        {
                            for (_, v) in xobjects.iter() {
                                if let Some(id) = v.as_reference() {
                                    excluded.insert(id);
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    excluded
}

/// Unpacks a 1bpc flate/raw image into a bitmap; other encodings return
/// `None` (already handled as Keep).
fn decode_mono(stream: &PdfStream, profile: &ImageProfile) -> Option<ccitt::Bitmap> {
    let data = filters::decode_stream(stream).ok()?;
    let stride = profile.width.div_ceil(8);
    if data.len() < stride * profile.height {
        return None;
    }
    Some(ccitt::Bitmap {
        width: profile.width,
        height: profile.height,
        rows: data[..stride * profile.height].to_vec(),
    })
}

fn encode_mono_g4(
    stream: &PdfStream,
    profile: &ImageProfile,
    bitmap: &ccitt::Bitmap,
) -> Option<PdfStream> {
    // PDF 1bpc DeviceGray: 0 = black. CCITT default: 0 = white. The G4
    // encoder treats set bits as black, so flip the sample sense.
    let mut inverted = bitmap.rows.clone();
    for b in &mut inverted {
        *b = !*b;
    }
    let flipped = ccitt::Bitmap {
        width: bitmap.width,
        height: bitmap.height,
        rows: inverted,
    };
    let encoded = ccitt::encode_g4(&flipped);

    let mut dict = stream.dict.clone();
    dict.insert("Filter", PdfObject::name("CCITTFaxDecode"));
    let mut parms = PdfDictionary::new();
    parms.insert("K", PdfObject::Integer(-1));
    parms.insert("Columns", PdfObject::Integer(profile.width as i64));
    parms.insert("Rows", PdfObject::Integer(profile.height as i64));
    dict.insert("DecodeParms", PdfObject::Dictionary(parms));
    dict.insert("Length", PdfObject::Integer(encoded.len() as i64));
    Some(PdfStream::new(dict, encoded))
}

/// Lossless deflate recompression at level 1; at level 2+ the palette is
/// re-quantized through pngquant when the tool is wired, and the smaller
/// candidate wins.
fn optimize_indexed(
    stream: &PdfStream,
    objects: &BTreeMap<ObjectId, PdfObject>,
    options: &OptimizeOptions,
) -> Option<PdfStream> {
    let decoded = filters::decode_stream(stream).ok()?;
    let recompressed = crate::compression::compress(&decoded).ok()?;

    let mut dict = stream.dict.clone();
    dict.insert("Filter", PdfObject::name("FlateDecode"));
    dict.remove("DecodeParms");
    dict.insert("Length", PdfObject::Integer(recompressed.len() as i64));
    let mut best = PdfStream::new(dict, recompressed);

    if options.level >= 2 {
        if let Some(encoder) = &options.pngquant {
            let aggressive = options.level >= 3;
            if let Some(candidate) =
                requantize_palette(stream, &decoded, objects, encoder, aggressive)
            {
                if candidate.raw_data().len() < best.raw_data().len() {
                    best = candidate;
                }
            }
        }
    }
    Some(best)
}

/// Expands the indexed image to RGB, runs pngquant over it, and rebuilds
/// an indexed image from the quantized output.
fn requantize_palette(
    stream: &PdfStream,
    indices: &[u8],
    objects: &BTreeMap<ObjectId, PdfObject>,
    encoder: &PathBuf,
    aggressive: bool,
) -> Option<PdfStream> {
    let width = int_attr(&stream.dict, "Width", objects)? as usize;
    let height = int_attr(&stream.dict, "Height", objects)? as usize;
    let palette = indexed_palette(stream.dict.get("ColorSpace"), objects)?;
    if indices.len() < width * height {
        return None;
    }

    let mut rgb = Vec::with_capacity(width * height * 3);
    for &index in &indices[..width * height] {
        let at = index as usize * 3;
        let entry = palette.get(at..at + 3)?;
        rgb.extend_from_slice(entry);
    }
    let image = image::RgbImage::from_raw(width as u32, height as u32, rgb)?;

    let dir = tempfile::tempdir().ok()?;
    let input = dir.path().join("in.png");
    let output = dir.path().join("out.png");
    image
        .save_with_format(&input, image::ImageFormat::Png)
        .ok()?;
    let quality = if aggressive { "40-70" } else { "65-90" };
    let status = Command::new(encoder)
        .arg("--force")
        .arg("--quality")
        .arg(quality)
        .arg("--output")
        .arg(&output)
        .arg(&input)
        .status()
        .ok()?;
    if !status.success() {
        return None;
    }

    let quantized = image::open(&output).ok()?.into_rgb8();
    // Rebuild palette + index plane from the quantized RGB.
    let mut palette: Vec<[u8; 3]> = Vec::new();
    let mut new_indices = Vec::with_capacity(width * height);
    for pixel in quantized.pixels() {
        let rgb = [pixel.0[0], pixel.0[1], pixel.0[2]];
        let index = match palette.iter().position(|&p| p == rgb) {
            Some(i) => i,
            None => {
                if palette.len() >= MAX_PALETTE {
                    return None;
                }
                palette.push(rgb);
                palette.len() - 1
            }
        };
        new_indices.push(index as u8);
    }
    let compressed = crate::compression::compress(&new_indices).ok()?;

    let mut lookup = Vec::with_capacity(palette.len() * 3);
    for entry in &palette {
        lookup.extend_from_slice(entry);
    }
    let mut colorspace = PdfArray::new();
    colorspace.push(PdfObject::name("Indexed"));
    colorspace.push(PdfObject::name("DeviceRGB"));
    colorspace.push(PdfObject::Integer(palette.len() as i64 - 1));
    colorspace.push(PdfObject::String(PdfString::new(lookup)));

    let mut dict = stream.dict.clone();
    dict.insert("ColorSpace", PdfObject::Array(colorspace));
    dict.insert("Filter", PdfObject::name("FlateDecode"));
    dict.remove("DecodeParms");
    dict.insert("BitsPerComponent", PdfObject::Integer(8));
    dict.insert("Length", PdfObject::Integer(compressed.len() as i64));
    Some(PdfStream::new(dict, compressed))
}

/// The RGB lookup table of an `[/Indexed /DeviceRGB hival lookup]`
/// colorspace; other bases are not rebuilt.
fn indexed_palette(
    cs: Option<&PdfObject>,
    objects: &BTreeMap<ObjectId, PdfObject>,
) -> Option<Vec<u8>> {
    let array = resolve(cs?, objects).as_array()?;
    if array.get(0)?.as_name()?.as_str() != "Indexed" {
        return None;
    }
    if resolve(array.get(1)?, objects).as_name()?.as_str() != "DeviceRGB" {
        return None;
    }
    match resolve(array.get(3)?, objects) {
        PdfObject::String(s) => Some(s.as_bytes().to_vec()),
        PdfObject::Stream(s) => filters::decode_stream(s).ok(),
        _ => None,
    }
}

/// Gray/RGB images: recompress losslessly at level 1; at level 2+ try a
/// (re-)DCT at the level's quality and keep whichever is smaller.
fn optimize_continuous(
    stream: &PdfStream,
    profile: &ImageProfile,
    options: &OptimizeOptions,
) -> Option<PdfStream> {
    if profile.bits_per_component != 8 {
        return None;
    }
    let quality = match options.level {
        2 => 75u8,
        3 => 50u8,
        _ => 0,
    };

    if profile.dct {
        // Source is JPEG. Level 1 keeps it; levels 2/3 re-encode and keep
        // the result only on a clear win.
        if quality == 0 {
            return None;
        }
        let image = image::load_from_memory(stream.raw_data()).ok()?;
        let reencoded = encode_jpeg(&image, quality)?;
        if (reencoded.len() as f64) < stream.raw_data().len() as f64 * LOSSY_KEEP_RATIO {
            let mut dict = stream.dict.clone();
            dict.insert("Length", PdfObject::Integer(reencoded.len() as i64));
            return Some(PdfStream::new(dict, reencoded));
        }
        return None;
    }

    // Flate source: always have the lossless recompression candidate.
    let decoded = filters::decode_stream(stream).ok()?;
    let expected = profile.width * profile.height * profile.components;
    if decoded.len() < expected {
        return None;
    }
    let recompressed = crate::compression::compress(&decoded).ok()?;
    let mut best = {
        let mut dict = stream.dict.clone();
        dict.insert("Filter", PdfObject::name("FlateDecode"));
        dict.remove("DecodeParms");
        dict.insert("Length", PdfObject::Integer(recompressed.len() as i64));
        PdfStream::new(dict, recompressed)
    };

    if quality > 0 {
        let image = raw_to_image(&decoded[..expected], profile)?;
        if let Some(jpeg) = encode_jpeg(&image, quality) {
            if jpeg.len() < best.raw_data().len() {
                let mut dict = stream.dict.clone();
                dict.insert("Filter", PdfObject::name("DCTDecode"));
                dict.remove("DecodeParms");
                dict.insert("Length", PdfObject::Integer(jpeg.len() as i64));
                best = PdfStream::new(dict, jpeg);
            }
        }
    }
    Some(best)
}

fn raw_to_image(samples: &[u8], profile: &ImageProfile) -> Option<image::DynamicImage> {
    let (w, h) = (profile.width as u32, profile.height as u32);
    if profile.gray {
        image::GrayImage::from_raw(w, h, samples.to_vec()).map(image::DynamicImage::ImageLuma8)
    } else {
        image::RgbImage::from_raw(w, h, samples.to_vec()).map(image::DynamicImage::ImageRgb8)
    }
}

fn encode_jpeg(image: &image::DynamicImage, quality: u8) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
    encoder.encode_image(image).ok()?;
    Some(out)
}

/// Encodes each group of monochrome bitmaps through the external JBIG2
/// encoder with a shared symbol dictionary, embedding one globals stream
/// per group. A failed group falls back to per-image G4.
fn encode_jbig2_groups(
    objects: &mut BTreeMap<ObjectId, PdfObject>,
    groups: Vec<Vec<(ObjectId, ccitt::Bitmap)>>,
    encoder: &PathBuf,
    report: &mut OptimizeReport,
) {
    let mut next_id = objects.keys().next_back().map(|id| id.number).unwrap_or(0) + 1;

    for group in groups {
        if group.is_empty() {
            continue;
        }
        match run_jbig2_encoder(encoder, &group) {
            Ok((globals, fragments)) => {
                let globals_id = ObjectId::new(next_id, 0);
                next_id += 1;
                let mut globals_dict = PdfDictionary::new();
                globals_dict.insert("Length", PdfObject::Integer(globals.len() as i64));
                objects.insert(globals_id, PdfObject::Stream(PdfStream::new(globals_dict, globals)));

                for ((id, _bitmap), fragment) in group.iter().zip(fragments) {
                    let Some(stream) = objects.get(id).and_then(PdfObject::as_stream) else {
                        continue;
                    };
                    let before = stream.raw_data().len() as u64;
                    if fragment.len() as u64 >= before {
                        continue;
                    }
                    let mut dict = stream.dict.clone();
                    dict.insert("Filter", PdfObject::name("JBIG2Decode"));
                    let mut parms = PdfDictionary::new();
                    parms.insert("JBIG2Globals", PdfObject::Reference(globals_id));
                    dict.insert("DecodeParms", PdfObject::Dictionary(parms));
                    dict.insert("Length", PdfObject::Integer(fragment.len() as i64));
                    report.images_replaced += 1;
                    report.bytes_before += before;
                    report.bytes_after += fragment.len() as u64;
                    objects.insert(*id, PdfObject::Stream(PdfStream::new(dict, fragment)));
                }
            }
            Err(err) => {
                warn!(error = %err, "JBIG2 group failed, falling back to CCITT G4");
                for (id, bitmap) in &group {
                    let Some(stream) = objects.get(id).and_then(PdfObject::as_stream).cloned()
                    else {
                        continue;
                    };
                    let profile = ImageProfile {
                        class: ImageClass::Mono,
                        width: bitmap.width,
                        height: bitmap.height,
                        bits_per_component: 1,
                        components: 1,
                        gray: true,
                        dct: false,
                    };
                    if let Some(new_stream) = encode_mono_g4(&stream, &profile, bitmap) {
                        let before = stream.raw_data().len() as u64;
                        let after = new_stream.raw_data().len() as u64;
                        if after < before {
                            report.images_replaced += 1;
                            report.bytes_before += before;
                            report.bytes_after += after;
                            objects.insert(*id, PdfObject::Stream(new_stream));
                        }
                    }
                }
            }
        }
    }
}

/// Runs `jbig2 -s -p` over the group's bitmaps in a scratch directory and
/// returns the shared globals plus one fragment per input, in order.
fn run_jbig2_encoder(
    encoder: &PathBuf,
    group: &[(ObjectId, ccitt::Bitmap)],
) -> Result<(Vec<u8>, Vec<Vec<u8>>)> {
    let dir = tempfile::tempdir().map_err(PdfError::Io)?;
    let mut inputs = Vec::new();
    for (i, (_, bitmap)) in group.iter().enumerate() {
        let path = dir.path().join(format!("in{i:04}.png"));
        let mut img = image::GrayImage::new(bitmap.width as u32, bitmap.height as u32);
        let stride = bitmap.row_bytes();
        for (y, row) in bitmap.rows.chunks(stride).enumerate() {
            for x in 0..bitmap.width {
                let black = row[x / 8] & (0x80 >> (x % 8)) != 0;
                // In the PDF sample sense 0 is black for these bitmaps.
                img.put_pixel(x as u32, y as u32, image::Luma([if black { 255 } else { 0 }]));
            }
        }
        img.save_with_format(&path, image::ImageFormat::Png)
            .map_err(|e| PdfError::InvalidImage(e.to_string()))?;
        inputs.push(path);
    }

    let output = Command::new(encoder)
        .current_dir(dir.path())
        .arg("-s")
        .arg("-p")
        .args(&inputs)
        .output()
        .map_err(PdfError::Io)?;
    if !output.status.success() {
        return Err(PdfError::InvalidImage(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    let globals = std::fs::read(dir.path().join("output.sym")).map_err(PdfError::Io)?;
    let mut fragments = Vec::new();
    for i in 0..group.len() {
        let fragment =
            std::fs::read(dir.path().join(format!("output.{i:04}"))).map_err(PdfError::Io)?;
        fragments.push(fragment);
    }
    Ok((globals, fragments))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::PdfReader;
    use crate::writer::testing::scanned_page_pdf;

    fn arena() -> (BTreeMap<ObjectId, PdfObject>, PdfDictionary) {
        let reader = PdfReader::from_bytes(scanned_page_pdf(2)).unwrap();
        let (_, _, objects, trailer) = reader.into_parts();
        (objects, trailer)
    }

    fn flate_gray_image(id: u32, width: usize, height: usize) -> (ObjectId, PdfObject) {
        let samples = vec![200u8; width * height];
        let compressed = crate::compression::compress(&samples).unwrap();
        let mut dict = PdfDictionary::new();
        dict.insert("Type", PdfObject::name("XObject"));
        dict.insert("Subtype", PdfObject::name("Image"));
        dict.insert("Width", PdfObject::Integer(width as i64));
        dict.insert("Height", PdfObject::Integer(height as i64));
        dict.insert("ColorSpace", PdfObject::name("DeviceGray"));
        dict.insert("BitsPerComponent", PdfObject::Integer(8));
        dict.insert("Filter", PdfObject::name("FlateDecode"));
        dict.insert("Length", PdfObject::Integer(compressed.len() as i64));
        (
            ObjectId::new(id, 0),
            PdfObject::Stream(PdfStream::new(dict, compressed)),
        )
    }

    #[test]
    fn test_level_zero_is_a_no_op() {
        let (mut objects, trailer) = arena();
        let before = objects.clone();
        let report = optimize_images(
            &mut objects,
            &trailer,
            &OptimizeOptions {
                level: 0,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(report, OptimizeReport::default());
        assert_eq!(objects, before);
    }

    #[test]
    fn test_examines_page_images_once() {
        let (mut objects, trailer) = arena();
        let report =
            optimize_images(&mut objects, &trailer, &OptimizeOptions::default()).unwrap();
        // Fixture has one DCT image per page; level 1 keeps DCT sources.
        assert_eq!(report.images_examined, 2);
        assert_eq!(report.images_replaced, 0);
    }

    #[test]
    fn test_mono_flate_becomes_ccitt() {
        let (mut objects, trailer) = arena();
        // Hand a 1bpc flate image to page 1's resources.
        let width = 512usize;
        let height = 64usize;
        let stride = width / 8;
        let rows = vec![0xFFu8; stride * height]; // all white in PDF sense? 1 = light
        let compressed = crate::compression::compress(&rows).unwrap();
        let mut dict = PdfDictionary::new();
        dict.insert("Type", PdfObject::name("XObject"));
        dict.insert("Subtype", PdfObject::name("Image"));
        dict.insert("Width", PdfObject::Integer(width as i64));
        dict.insert("Height", PdfObject::Integer(height as i64));
        dict.insert("ColorSpace", PdfObject::name("DeviceGray"));
        dict.insert("BitsPerComponent", PdfObject::Integer(1));
        dict.insert("Filter", PdfObject::name("FlateDecode"));
        dict.insert("Length", PdfObject::Integer(compressed.len() as i64));
        let mono_id = ObjectId::new(900, 0);
        objects.insert(mono_id, PdfObject::Stream(PdfStream::new(dict, compressed)));
        attach_to_first_page(&mut objects, &trailer, "ImMono", mono_id);

        optimize_images(&mut objects, &trailer, &OptimizeOptions::default()).unwrap();
        let stream = objects.get(&mono_id).unwrap().as_stream().unwrap();
        assert_eq!(stream.filters(), vec!["CCITTFaxDecode"]);
        let parms = stream.dict.get("DecodeParms").unwrap().as_dict().unwrap();
        assert_eq!(parms.get("K").unwrap().as_integer(), Some(-1));
        assert_eq!(parms.get("Columns").unwrap().as_integer(), Some(512));
    }

    #[test]
    fn test_flate_gray_recompresses_losslessly() {
        let (mut objects, trailer) = arena();
        let (id, obj) = flate_gray_image(901, 64, 64);
        // Store the source uncompressed-in-zlib so recompression has
        // guaranteed headroom.
        let samples = vec![200u8; 64 * 64];
        let weak = {
            use flate2::{write::ZlibEncoder, Compression};
            use std::io::Write;
            let mut e = ZlibEncoder::new(Vec::new(), Compression::none());
            e.write_all(&samples).unwrap();
            e.finish().unwrap()
        };
        let mut stream = obj.as_stream().unwrap().clone();
        stream.data = weak;
        stream
            .dict
            .insert("Length", PdfObject::Integer(stream.data.len() as i64));
        objects.insert(id, PdfObject::Stream(stream));
        attach_to_first_page(&mut objects, &trailer, "ImGray", id);

        let report =
            optimize_images(&mut objects, &trailer, &OptimizeOptions::default()).unwrap();
        assert!(report.images_replaced >= 1);
        assert!(report.ratio() <= 1.0);
        // Lossless invariant: decoded samples unchanged.
        let stream = objects.get(&id).unwrap().as_stream().unwrap();
        assert_eq!(filters::decode_stream(stream).unwrap(), samples);
    }

    #[test]
    fn test_smask_targets_are_excluded() {
        let (mut objects, trailer) = arena();
        let (smask_id, smask_obj) = flate_gray_image(902, 32, 32);
        objects.insert(smask_id, smask_obj);
        let (img_id, img_obj) = flate_gray_image(903, 32, 32);
        let mut stream = img_obj.as_stream().unwrap().clone();
        stream.dict.insert("SMask", PdfObject::Reference(smask_id));
        objects.insert(img_id, PdfObject::Stream(stream));
        attach_to_first_page(&mut objects, &trailer, "ImS", smask_id);

        let before = objects.get(&smask_id).cloned();
        optimize_images(&mut objects, &trailer, &OptimizeOptions::default()).unwrap();
        assert_eq!(objects.get(&smask_id).cloned(), before);
    }

    #[test]
    fn test_oversized_image_is_skipped() {
        let (mut objects, trailer) = arena();
        let (id, obj) = flate_gray_image(904, 64, 64);
        objects.insert(id, obj);
        attach_to_first_page(&mut objects, &trailer, "ImBig", id);
        let before = objects.get(&id).cloned();
        let options = OptimizeOptions {
            max_image_mpix: 0.001,
            ..Default::default()
        };
        optimize_images(&mut objects, &trailer, &options).unwrap();
        assert_eq!(objects.get(&id).cloned(), before);
    }

    fn attach_to_first_page(
        objects: &mut BTreeMap<ObjectId, PdfObject>,
        trailer: &PdfDictionary,
        name: &str,
        image_id: ObjectId,
    ) {
        let page_id = page_order(objects, trailer)[0];
        let mut page = objects
            .get(&page_id)
            .unwrap()
            .as_dict()
            .unwrap()
            .clone();
        let mut resources = page
            .get("Resources")
            .and_then(|o| o.as_dict())
            .cloned()
            .unwrap_or_default();
        let mut xobjects = resources
            .get("XObject")
            .and_then(|o| o.as_dict())
            .cloned()
            .unwrap_or_default();
        xobjects.insert(name, PdfObject::Reference(image_id));
        resources.insert("XObject", PdfObject::Dictionary(xobjects));
        page.insert("Resources", PdfObject::Dictionary(resources));
        objects.insert(page_id, PdfObject::Dictionary(page));
    }
}
