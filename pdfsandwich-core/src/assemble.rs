//! Output assembly
//!
//! The single writer of the pipeline: collects page outcomes (in whatever
//! order workers finish), installs them into the output arena strictly in
//! page-index order, stamps metadata and the language tag, hands the
//! arena to the image optimizer, serializes, optionally converts to PDF/A
//! through the external engine, linearizes for fast web view, and
//! self-checks the result structurally before anyone sees it.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::mpsc::Receiver;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::collaborators::Collaborators;
use crate::document::Document;
use crate::error::{SandwichError, SandwichResult};
use crate::objects::{ObjectId, PdfDictionary, PdfObject, PdfStream, PdfString};
use crate::optimize::{optimize_images, OptimizeOptions, OptimizeReport};
use crate::options::{Options, OutputType};
use crate::pipeline::state::{OutcomeStatus, PageOutcome};
use crate::writer;

/// Counters reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssembleCounts {
    pub grafted: usize,
    pub copied: usize,
    pub soft_failed: usize,
}

/// The collected, pre-serialization output document.
pub struct AssembledDocument {
    pub objects: BTreeMap<ObjectId, PdfObject>,
    pub trailer: PdfDictionary,
    pub version: String,
    /// One entry per page in index order; empty string for pages without
    /// OCR text.
    pub sidecar_pages: Vec<String>,
    pub counts: AssembleCounts,
}

pub struct PdfAssembler<'a> {
    document: &'a Document,
    options: &'a Options,
}

impl<'a> PdfAssembler<'a> {
    pub fn new(document: &'a Document, options: &'a Options) -> Self {
        Self { document, options }
    }

    /// Receives outcomes until every page has reported, applying them in
    /// ascending index order (out-of-order arrivals wait in a buffer, so
    /// the arena only ever mutates in page order).
    pub fn collect(&self, outcomes: Receiver<PageOutcome>) -> SandwichResult<AssembledDocument> {
        let page_count = self.document.page_count();
        let mut objects = self.document.objects().clone();
        let mut sidecar_pages = vec![String::new(); page_count];
        let mut counts = AssembleCounts::default();

        let mut pending: BTreeMap<usize, PageOutcome> = BTreeMap::new();
        let mut next_index = 1usize;
        let mut received = 0usize;

        while received < page_count {
            let outcome = outcomes
                .recv()
                .map_err(|_| SandwichError::Other("pipeline ended before all pages reported".to_string()))?;
            received += 1;
            pending.insert(outcome.index, outcome);

            while let Some(outcome) = pending.remove(&next_index) {
                self.apply(&mut objects, &outcome, &mut counts);
                sidecar_pages[outcome.index - 1] = outcome.sidecar_text;
                next_index += 1;
            }
        }
        debug!(grafted = counts.grafted, copied = counts.copied, "all pages assembled");

        let mut trailer = base_trailer(self.document.trailer());
        self.stamp_metadata(&mut objects, &mut trailer);

        Ok(AssembledDocument {
            objects,
            trailer,
            version: self.document.version().to_string(),
            sidecar_pages,
            counts,
        })
    }

    fn apply(
        &self,
        objects: &mut BTreeMap<ObjectId, PdfObject>,
        outcome: &PageOutcome,
        counts: &mut AssembleCounts,
    ) {
        match &outcome.status {
            OutcomeStatus::Grafted => counts.grafted += 1,
            OutcomeStatus::Copied => counts.copied += 1,
            OutcomeStatus::SoftFailed(reason) => {
                warn!(page = outcome.index, reason = %reason, "page passed through after soft failure");
                counts.soft_failed += 1;
            }
        }
        if let Some(result) = &outcome.result {
            for (id, object) in &result.objects {
                objects.insert(*id, object.clone());
            }
        }
    }

    /// Copies the original metadata forward, stamps the producer and
    /// modification date, sets the catalog language tag, and for PDF/A
    /// targets writes the XMP identification packet the conformance
    /// engine expects to find.
    fn stamp_metadata(
        &self,
        objects: &mut BTreeMap<ObjectId, PdfObject>,
        trailer: &mut PdfDictionary,
    ) {
        let mod_date = self
            .options
            .timestamp
            .clone()
            .unwrap_or_else(|| pdf_date(Utc::now()));

        let existing_info = trailer.get("Info").and_then(|o| o.as_reference());
        let mut info = existing_info
            .and_then(|id| objects.get(&id))
            .and_then(PdfObject::as_dict)
            .cloned()
            .unwrap_or_default();
        info.insert(
            "Producer",
            PdfObject::String(PdfString::new(
                format!("pdfsandwich {}", crate::VERSION).into_bytes(),
            )),
        );
        info.insert("ModDate", PdfObject::String(PdfString::new(mod_date.clone().into_bytes())));

        let next = objects.keys().next_back().map(|id| id.number).unwrap_or(0) + 1;
        // Overwriting an existing Info in place keeps repeated runs over
        // an already-processed file byte-identical.
        let info_id = existing_info.unwrap_or(ObjectId::new(next, 0));
        objects.insert(info_id, PdfObject::Dictionary(info));
        trailer.insert("Info", PdfObject::Reference(info_id));

        // Language tag on the catalog.
        if let Some(root_id) = trailer.get("Root").and_then(|o| o.as_reference()) {
            if let Some(mut catalog) = objects.get(&root_id).and_then(PdfObject::as_dict).cloned()
            {
                let lang = iso_language(self.options.languages.first().map(String::as_str));
                catalog.insert("Lang", PdfObject::String(PdfString::new(lang.into_bytes())));

                if self.options.output_type.is_pdfa() {
                    let xmp = xmp_packet(pdfa_part(self.options.output_type), &mod_date);
                    let mut xmp_dict = PdfDictionary::new();
                    xmp_dict.insert("Type", PdfObject::name("Metadata"));
                    xmp_dict.insert("Subtype", PdfObject::name("XML"));
                    xmp_dict.insert("Length", PdfObject::Integer(xmp.len() as i64));
                    let xmp_id = catalog
                        .get("Metadata")
                        .and_then(|o| o.as_reference())
                        .unwrap_or(ObjectId::new(next + 1, 0));
                    objects.insert(xmp_id, PdfObject::Stream(PdfStream::new(xmp_dict, xmp)));
                    catalog.insert("Metadata", PdfObject::Reference(xmp_id));
                }
                objects.insert(root_id, PdfObject::Dictionary(catalog));
            }
        }
    }
}

/// Serializes, optimizes, converts and checks the assembled document.
/// Returns the final bytes (or `None` for `--output-type none`) plus the
/// optimizer's report.
pub fn finalize(
    mut assembled: AssembledDocument,
    collaborators: &Collaborators,
    options: &Options,
    scratch: &Path,
) -> SandwichResult<(Option<Vec<u8>>, OptimizeReport)> {
    if options.output_type == OutputType::None {
        return Ok((None, OptimizeReport::default()));
    }

    let optimize_options = OptimizeOptions {
        level: options.optimize,
        max_image_mpix: options.max_image_mpix,
        jbig2_page_group_size: options.jbig2_page_group_size,
        jbig2_encoder: collaborators.jbig2_encoder.clone(),
        pngquant: collaborators.pngquant.clone(),
    };
    let report = optimize_images(&mut assembled.objects, &assembled.trailer, &optimize_options)
        .map_err(SandwichError::Pdf)?;

    let mut bytes =
        writer::write_document(&assembled.objects, &assembled.trailer, &assembled.version)
            .map_err(SandwichError::Pdf)?;

    if options.output_type.is_pdfa() {
        let converter = collaborators.pdfa.as_ref().ok_or_else(|| {
            SandwichError::MissingDependency("PDF/A converter not wired".to_string())
        })?;
        let staging_in = scratch.join("assembled.pdf");
        let staging_out = scratch.join("pdfa.pdf");
        std::fs::write(&staging_in, &bytes)?;
        converter.generate_pdfa(&staging_in, &staging_out, pdfa_part(options.output_type))?;
        bytes = std::fs::read(&staging_out)?;
        info!(tool = converter.tool_name(), "PDF/A conversion complete");
    }

    if let Some(threshold) = options.fast_web_view {
        if bytes.len() as u64 > threshold {
            bytes = linearize(&bytes).unwrap_or_else(|err| {
                warn!(error = %err, "linearization failed, keeping unlinearized output");
                bytes
            });
        }
    }

    structural_self_check(&bytes, assembled.sidecar_pages.len())?;
    Ok((Some(bytes), report))
}

/// Reorders the document so the catalog and first page's closure lead the
/// file, then rewrites it.
fn linearize(bytes: &[u8]) -> SandwichResult<Vec<u8>> {
    let reader = crate::parser::PdfReader::from_bytes(bytes.to_vec())
        .map_err(|e| SandwichError::Other(format!("linearize reparse: {e}")))?;
    let (_, version, objects, trailer) = reader.into_parts();

    let mut front = Vec::new();
    if let Some(root) = trailer.get("Root").and_then(|o| o.as_reference()) {
        front.push(root);
        // Pull the first page and everything it references forward.
        if let Some(catalog) = objects.get(&root).and_then(PdfObject::as_dict) {
            if let Some(pages) = catalog.get("Pages").and_then(|o| o.as_reference()) {
                front.push(pages);
                collect_closure(&objects, pages, 2, &mut front);
            }
        }
    }
    let (renumbered, new_trailer) = writer::renumber_for_streaming(&objects, &trailer, &front);
    writer::write_document(&renumbered, &new_trailer, &version).map_err(SandwichError::Pdf)
}

fn collect_closure(
    objects: &BTreeMap<ObjectId, PdfObject>,
    from: ObjectId,
    depth: usize,
    out: &mut Vec<ObjectId>,
) {
    if depth == 0 || out.len() > 64 {
        return;
    }
    let Some(object) = objects.get(&from) else {
        return;
    };
    for id in references_of(object) {
        if !out.contains(&id) {
            out.push(id);
            collect_closure(objects, id, depth - 1, out);
        }
    }
}

fn references_of(object: &PdfObject) -> Vec<ObjectId> {
    let mut out = Vec::new();
    collect_refs(object, &mut out);
    out
}

fn collect_refs(object: &PdfObject, out: &mut Vec<ObjectId>) {
    match object {
        PdfObject::Reference(id) => out.push(*id),
        PdfObject::Array(a) => a.iter().for_each(|o| collect_refs(o, out)),
        PdfObject::Dictionary(d) => d.iter().for_each(|(_, v)| collect_refs(v, out)),
        PdfObject::Stream(s) => s.dict.iter().for_each(|(_, v)| collect_refs(v, out)),
        _ => {}
    }
}

/// Reparses the output and verifies the page count; a file this module
/// produced that cannot be reparsed must never be reported as success.
fn structural_self_check(bytes: &[u8], expected_pages: usize) -> SandwichResult<()> {
    let document = Document::from_bytes(bytes.to_vec())
        .map_err(|e| SandwichError::InvalidOutputPdf(e.to_string()))?;
    if document.page_count() != expected_pages {
        return Err(SandwichError::InvalidOutputPdf(format!(
            "output has {} pages, expected {expected_pages}",
            document.page_count()
        )));
    }
    Ok(())
}

/// Writes the plain-text sidecar: every page's text followed by a form
/// feed; skipped pages contribute only the form feed.
pub fn write_sidecar(path: &Path, pages: &[String]) -> SandwichResult<()> {
    let mut out = String::new();
    for page in pages {
        out.push_str(page);
        if !page.is_empty() {
            out.push('\n');
        }
        out.push('\u{000C}');
    }
    std::fs::write(path, out.as_bytes())?;
    Ok(())
}

fn base_trailer(original: &PdfDictionary) -> PdfDictionary {
    let mut trailer = PdfDictionary::new();
    for key in ["Root", "Info"] {
        if let Some(value) = original.get(key) {
            trailer.insert(key, value.clone());
        }
    }
    trailer
}

fn pdfa_part(output_type: OutputType) -> u8 {
    match output_type {
        OutputType::Pdfa1 => 1,
        OutputType::Pdfa3 => 3,
        _ => 2,
    }
}

/// Maps common OCR language codes onto BCP 47 primary tags.
fn iso_language(code: Option<&str>) -> String {
    match code {
        Some("eng") | None => "en".to_string(),
        Some("deu") => "de".to_string(),
        Some("fra") => "fr".to_string(),
        Some("spa") => "es".to_string(),
        Some("ita") => "it".to_string(),
        Some("por") => "pt".to_string(),
        Some("nld") => "nl".to_string(),
        Some(other) => other.to_string(),
    }
}

fn pdf_date(at: chrono::DateTime<Utc>) -> String {
    at.format("D:%Y%m%d%H%M%SZ").to_string()
}

/// Minimal XMP packet carrying the PDF/A identification schema.
fn xmp_packet(part: u8, mod_date: &str) -> Vec<u8> {
    format!(
        r#"<?xpacket begin="" id="W5M0MpCehiHzreSzNTczkc9d"?>
<x:xmpmeta xmlns:x="adobe:ns:meta/">
 <rdf:RDF xmlns:rdf="http://www.w3.org/1999/02/22-rdf-syntax-ns#">
  <rdf:Description rdf:about=""
    xmlns:pdfaid="http://www.aiim.org/pdfa/ns/id/"
    xmlns:xmp="http://ns.adobe.com/xap/1.0/">
   <pdfaid:part>{part}</pdfaid:part>
   <pdfaid:conformance>B</pdfaid:conformance>
   <xmp:ModifyDate>{mod_date}</xmp:ModifyDate>
  </rdf:Description>
 </rdf:RDF>
</x:xmpmeta>
<?xpacket end="w"?>"#
    )
    .into_bytes()
}
