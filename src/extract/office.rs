//! OOXML documents: docx, pptx and xlsx.
//!
//! Each format is a ZIP of XML parts. Entries are read through
//! [`read_entry`], which caps decompressed size so a crafted archive cannot
//! exhaust memory. Paragraph, slide, row and sheet boundaries are kept as
//! line breaks; structure that does not survive (tables, number formats)
//! becomes a warning on the document.

use std::io::{Cursor, Read};

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;

use super::{ExtractedDocument, FileInput, FormatHandler};
use crate::error::ExtractError;

pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

const XLSX_MAX_SHEETS: usize = 100;
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Decompressed size limit for a single ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

type Archive<'a> = zip::ZipArchive<Cursor<&'a [u8]>>;

pub struct OfficeHandler;

#[async_trait]
impl FormatHandler for OfficeHandler {
    fn name(&self) -> &str {
        "office"
    }

    fn mime_types(&self) -> &[&'static str] {
        &[MIME_DOCX, MIME_PPTX, MIME_XLSX]
    }

    fn extensions(&self) -> &[&'static str] {
        &["docx", "pptx", "xlsx"]
    }

    async fn extract(&self, input: FileInput<'_>) -> Result<ExtractedDocument, ExtractError> {
        let format = match input.mime_type {
            MIME_DOCX => OfficeFormat::Docx,
            MIME_PPTX => OfficeFormat::Pptx,
            MIME_XLSX => OfficeFormat::Xlsx,
            _ => match input.filename.and_then(super::extension).as_deref() {
                Some("docx") => OfficeFormat::Docx,
                Some("pptx") => OfficeFormat::Pptx,
                Some("xlsx") => OfficeFormat::Xlsx,
                _ => return Err(ExtractError::UnsupportedFormat(input.mime_type.to_string())),
            },
        };
        let bytes = input.bytes.to_vec();
        tokio::task::spawn_blocking(move || extract_office(&bytes, format))
            .await
            .map_err(|e| ExtractError::ExtractionFailed(format!("office worker: {}", e)))?
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfficeFormat {
    Docx,
    Pptx,
    Xlsx,
}

/// Synchronous extraction for one OOXML document.
pub fn extract_office(bytes: &[u8], format: OfficeFormat) -> Result<ExtractedDocument, ExtractError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(ooxml)?;
    let mut doc = match format {
        OfficeFormat::Docx => extract_docx(&mut archive)?,
        OfficeFormat::Pptx => extract_pptx(&mut archive)?,
        OfficeFormat::Xlsx => extract_xlsx(&mut archive)?,
    };
    if let Some((title, author)) = read_core_properties(&mut archive) {
        doc.metadata.title = title;
        doc.metadata.author = author;
    }
    Ok(doc)
}

fn ooxml(e: impl std::fmt::Display) -> ExtractError {
    ExtractError::ExtractionFailed(format!("OOXML: {}", e))
}

fn read_entry(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, ExtractError> {
    let entry = archive.by_name(name).map_err(|e| ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(ooxml)?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

/// Entry names under `prefix` ending in `.xml`, ordered by their number.
fn numbered_entries(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

fn push_break(out: &mut String, brk: &str) {
    if !out.is_empty() && !out.ends_with(brk) {
        let trimmed = out.trim_end_matches([' ', '\n', '\t']).len();
        out.truncate(trimmed);
        out.push_str(brk);
    }
}

fn extract_docx(archive: &mut Archive<'_>) -> Result<ExtractedDocument, ExtractError> {
    let xml = read_entry(archive, "word/document.xml")?;
    let mut reader = Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut in_text = false;
    let mut tables = 0usize;
    let mut table_depth = 0usize;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"t" => in_text = true,
                b"tbl" => {
                    table_depth += 1;
                    if table_depth == 1 {
                        tables += 1;
                    }
                }
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => out.push('\t'),
                b"br" | b"cr" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                out.push_str(&te.unescape().map_err(ooxml)?);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => push_break(&mut out, "\n\n"),
                b"tc" => out.push('\t'),
                b"tbl" => table_depth = table_depth.saturating_sub(1),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml(e)),
            _ => {}
        }
        buf.clear();
    }

    let mut doc = ExtractedDocument::new(out.trim_end().to_string());
    if tables > 0 {
        doc.warnings
            .push(format!("{} table(s) flattened to plain text", tables));
    }
    Ok(doc)
}

/// Text of `a:t` runs, one line per `a:p`.
fn drawing_text(xml: &[u8]) -> Result<String, ExtractError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(te)) if in_text => out.push_str(&te.unescape().map_err(ooxml)?),
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => push_break(&mut out, "\n"),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

fn extract_pptx(archive: &mut Archive<'_>) -> Result<ExtractedDocument, ExtractError> {
    let slides = numbered_entries(archive, "ppt/slides/slide");
    let mut out = String::new();
    for name in &slides {
        let xml = read_entry(archive, name)?;
        let text = drawing_text(&xml)?;
        if text.is_empty() {
            continue;
        }
        push_break(&mut out, "\n\n");
        out.push_str(&text);
    }
    let mut doc = ExtractedDocument::new(out);
    if !slides.is_empty() {
        doc.warnings.push(format!(
            "slide layout of {} slide(s) not preserved",
            slides.len()
        ));
    }
    Ok(doc)
}

fn extract_xlsx(archive: &mut Archive<'_>) -> Result<ExtractedDocument, ExtractError> {
    let shared = if archive.index_for_name("xl/sharedStrings.xml").is_some() {
        read_shared_strings(&read_entry(archive, "xl/sharedStrings.xml")?)?
    } else {
        Vec::new()
    };
    let sheets = numbered_entries(archive, "xl/worksheets/sheet");
    let mut doc = ExtractedDocument::default();
    let mut numeric = 0usize;

    if sheets.len() > XLSX_MAX_SHEETS {
        doc.warnings.push(format!(
            "only the first {} of {} sheets extracted",
            XLSX_MAX_SHEETS,
            sheets.len()
        ));
    }
    for name in sheets.iter().take(XLSX_MAX_SHEETS) {
        let xml = read_entry(archive, name)?;
        let sheet = read_sheet(&xml, &shared)?;
        numeric += sheet.numeric_cells;
        if sheet.truncated {
            doc.warnings.push(format!(
                "{}: stopped after {} cells",
                name, XLSX_MAX_CELLS_PER_SHEET
            ));
        }
        if sheet.text.is_empty() {
            continue;
        }
        push_break(&mut doc.text, "\n\n");
        doc.text.push_str(&sheet.text);
    }
    if numeric > 0 {
        doc.warnings.push(format!(
            "{} numeric cell(s) kept as raw values without number formatting",
            numeric
        ));
    }
    Ok(doc)
}

fn read_shared_strings(xml: &[u8]) -> Result<Vec<String>, ExtractError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_text = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&te.unescape().map_err(ooxml)?);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"si" => strings.extend(current.take()),
                b"t" => in_text = false,
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"si" => strings.push(String::new()),
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

struct SheetText {
    text: String,
    numeric_cells: usize,
    truncated: bool,
}

#[derive(Clone, Copy, PartialEq)]
enum CellKind {
    Shared,
    Inline,
    Literal,
    Number,
}

/// Rows become lines, cells are tab separated.
fn read_sheet(xml: &[u8], shared: &[String]) -> Result<SheetText, ExtractError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut lines = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut kind = CellKind::Number;
    let mut value = String::new();
    let mut in_value = false;
    let mut cells = 0usize;
    let mut numeric_cells = 0usize;
    let mut truncated = false;

    loop {
        if cells >= XLSX_MAX_CELLS_PER_SHEET {
            truncated = true;
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    value.clear();
                    kind = CellKind::Number;
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"t" {
                            kind = match attr.value.as_ref() {
                                b"s" => CellKind::Shared,
                                b"inlineStr" => CellKind::Inline,
                                b"str" | b"b" | b"e" => CellKind::Literal,
                                _ => CellKind::Number,
                            };
                        }
                    }
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => value.push_str(&te.unescape().map_err(ooxml)?),
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => {
                    let v = value.trim();
                    if !v.is_empty() {
                        let text = match kind {
                            CellKind::Shared => v
                                .parse::<usize>()
                                .ok()
                                .and_then(|i| shared.get(i).cloned()),
                            CellKind::Number => {
                                numeric_cells += 1;
                                Some(v.to_string())
                            }
                            CellKind::Inline | CellKind::Literal => Some(v.to_string()),
                        };
                        if let Some(text) = text {
                            row.push(text);
                            cells += 1;
                        }
                    }
                }
                b"row" => {
                    if !row.is_empty() {
                        lines.push(row.join("\t"));
                        row.clear();
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml(e)),
            _ => {}
        }
        buf.clear();
    }
    if !row.is_empty() {
        lines.push(row.join("\t"));
    }
    Ok(SheetText {
        text: lines.join("\n"),
        numeric_cells,
        truncated,
    })
}

/// `dc:title` and `dc:creator` from `docProps/core.xml`, when present.
fn read_core_properties(archive: &mut Archive<'_>) -> Option<(Option<String>, Option<String>)> {
    archive.index_for_name("docProps/core.xml")?;
    let xml = read_entry(archive, "docProps/core.xml").ok()?;
    let mut reader = Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut field: Option<&'static str> = None;
    let (mut title, mut author) = (None, None);
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                field = match e.local_name().as_ref() {
                    b"title" => Some("title"),
                    b"creator" => Some("creator"),
                    _ => None,
                }
            }
            Ok(Event::Text(te)) => {
                let text = te.unescape().ok()?.trim().to_string();
                match field {
                    Some("title") if !text.is_empty() => title = Some(text),
                    Some("creator") if !text.is_empty() => author = Some(text),
                    _ => {}
                }
            }
            Ok(Event::End(_)) => field = None,
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    Some((title, author))
}
