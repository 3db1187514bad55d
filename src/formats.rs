//! Built-in document-to-markdown rendering for common intake formats.
//!
//! Dispatch is by file kind (the filename suffix). PDFs go through
//! `pdf-extract`; OOXML documents are read from their ZIP container with
//! `quick-xml`. Unknown or missing suffixes are sniffed by magic bytes, and
//! anything that still looks like text is passed through as UTF-8.

use std::io::Read;
use std::path::Path;

use quick_xml::events::Event;

use crate::convert::ConvertError;

/// Maximum decompressed bytes to read from a single ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
const XLSX_MAX_SHEETS: usize = 100;

const TEXT_KINDS: &[&str] = &["txt", "md", "markdown", "csv", "json", "text"];

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

/// Render the file at `path` as markdown. Blocking; call from a blocking
/// context.
pub fn render_path(path: &Path, kind: &str) -> Result<String, ConvertError> {
    let bytes = std::fs::read(path)?;
    match kind {
        "pdf" => render_pdf(path),
        "docx" | "pptx" | "xlsx" => render_office(&bytes, kind),
        k if TEXT_KINDS.contains(&k) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        other => {
            if bytes.starts_with(b"%PDF") {
                render_pdf(path)
            } else if bytes.starts_with(b"PK\x03\x04") {
                render_office(&bytes, other)
            } else if other.is_empty() {
                Ok(String::from_utf8_lossy(&bytes).into_owned())
            } else {
                Err(ConvertError::Unsupported(other.to_string()))
            }
        }
    }
}

fn render_pdf(path: &Path) -> Result<String, ConvertError> {
    pdf_extract::extract_text(path).map_err(|e| ConvertError::parse("pdf", e.to_string()))
}

fn render_office(bytes: &[u8], kind: &str) -> Result<String, ConvertError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ConvertError::parse(kind, e.to_string()))?;

    if has_entry(&archive, "word/document.xml") {
        render_docx(&mut archive)
    } else if has_prefix(&archive, "ppt/slides/") {
        render_pptx(&mut archive)
    } else if has_prefix(&archive, "xl/worksheets/") {
        render_xlsx(&mut archive)
    } else {
        Err(ConvertError::parse(kind, "not an OOXML document"))
    }
}

fn has_entry(archive: &Archive, name: &str) -> bool {
    archive.file_names().any(|n| n == name)
}

fn has_prefix(archive: &Archive, prefix: &str) -> bool {
    archive.file_names().any(|n| n.starts_with(prefix))
}

fn read_zip_entry_bounded(archive: &mut Archive, name: &str) -> Result<Vec<u8>, ConvertError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ConvertError::parse("ooxml", e.to_string()))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ConvertError::parse("ooxml", e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ConvertError::parse(
            "ooxml",
            format!("ZIP entry {} exceeds size limit ({} bytes)", name, MAX_XML_ENTRY_BYTES),
        ));
    }
    Ok(out)
}

fn render_docx(archive: &mut Archive) -> Result<String, ConvertError> {
    let xml = read_zip_entry_bounded(archive, "word/document.xml")?;
    paragraphs(&xml, b"t", b"p")
}

/// Collect the text of every `text_tag` element, one block per
/// `paragraph_tag`, joined by blank lines.
fn paragraphs(xml: &[u8], text_tag: &[u8], paragraph_tag: &[u8]) -> Result<String, ConvertError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut blocks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == text_tag => in_text = true,
            Ok(Event::End(e)) => {
                let name = e.local_name();
                if name.as_ref() == text_tag {
                    in_text = false;
                } else if name.as_ref() == paragraph_tag {
                    flush_block(&mut blocks, &mut current);
                }
            }
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"tab" => current.push('\t'),
            Ok(Event::Text(te)) if in_text => {
                current.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ConvertError::parse("ooxml", e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    flush_block(&mut blocks, &mut current);
    Ok(blocks.join("\n\n"))
}

fn flush_block(blocks: &mut Vec<String>, current: &mut String) {
    let block = current.trim();
    if !block.is_empty() {
        blocks.push(block.to_string());
    }
    current.clear();
}

fn numbered_entries(archive: &Archive, prefix: &str) -> Vec<String> {
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

fn render_pptx(archive: &mut Archive) -> Result<String, ConvertError> {
    let mut sections = Vec::new();
    for (idx, name) in numbered_entries(archive, "ppt/slides/slide").into_iter().enumerate() {
        let xml = read_zip_entry_bounded(archive, &name)?;
        let text = paragraphs(&xml, b"t", b"p")?;
        sections.push(format!("## Slide {}\n\n{}", idx + 1, text));
    }
    Ok(sections.join("\n\n"))
}

fn render_xlsx(archive: &mut Archive) -> Result<String, ConvertError> {
    let shared = if has_entry(archive, "xl/sharedStrings.xml") {
        let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml")?;
        shared_strings(&xml)?
    } else {
        Vec::new()
    };

    let mut sections = Vec::new();
    let sheets = numbered_entries(archive, "xl/worksheets/sheet");
    for (idx, name) in sheets.into_iter().take(XLSX_MAX_SHEETS).enumerate() {
        let xml = read_zip_entry_bounded(archive, &name)?;
        sections.push(format!("## Sheet {}\n\n{}", idx + 1, sheet_rows(&xml, &shared)?));
    }
    Ok(sections.join("\n\n"))
}

fn shared_strings(xml: &[u8]) -> Result<Vec<String>, ConvertError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"si" => strings.push(std::mem::take(&mut current)),
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                current.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ConvertError::parse("xlsx", e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// One `a | b | c` line per worksheet row.
fn sheet_rows(xml: &[u8], shared: &[String]) -> Result<String, ConvertError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut rows = Vec::new();
    let mut cells: Vec<String> = Vec::new();
    let mut in_value = false;
    let mut shared_cell = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    shared_cell = e.attributes().any(|a| {
                        a.as_ref()
                            .map(|a| a.key.as_ref() == b"t" && a.value.as_ref() == b"s")
                            .unwrap_or(false)
                    });
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                let raw = te.unescape().unwrap_or_default();
                let value = raw.trim();
                let cell = if shared_cell {
                    value
                        .parse::<usize>()
                        .ok()
                        .and_then(|i| shared.get(i).cloned())
                        .unwrap_or_default()
                } else {
                    value.to_string()
                };
                if !cell.is_empty() {
                    cells.push(cell);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => shared_cell = false,
                b"row" => {
                    if !cells.is_empty() {
                        rows.push(cells.join(" | "));
                    }
                    cells.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ConvertError::parse("xlsx", e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(rows.join("\n"))
}
