//! Line-oriented REPL over a converted document.

use std::io::{BufRead, Write};

use colored::*;
use tessera_core::{ConversionResult, Document, OutputFormat};

const HELP: &str = "\
commands:
  pages            list pages
  page N           top-level blocks of page N
  block ID         details of one block
  tree             every block, indented by depth
  render FORMAT    print the md, json, html or chunks output
  help             this message
  quit             leave";

const PREVIEW_CHARS: usize = 60;

enum Reply {
    Continue,
    Quit,
}

/// Reads commands from `input` until `quit` or end of input.
pub fn run<R: BufRead, W: Write>(
    result: &ConversionResult,
    input: R,
    mut out: W,
) -> anyhow::Result<()> {
    let doc = &result.document;
    writeln!(
        out,
        "{} {}: {} page(s), {} block(s). Type `help` for commands.",
        "✓".green().bold(),
        doc.metadata.doc_name,
        doc.pages().len(),
        doc.block_count()
    )?;
    prompt(&mut out)?;
    for line in input.lines() {
        match handle(result, line?.trim(), &mut out)? {
            Reply::Continue => prompt(&mut out)?,
            Reply::Quit => break,
        }
    }
    Ok(())
}

fn prompt<W: Write>(out: &mut W) -> std::io::Result<()> {
    write!(out, "tessera> ")?;
    out.flush()
}

fn handle<W: Write>(result: &ConversionResult, line: &str, out: &mut W) -> anyhow::Result<Reply> {
    let doc = &result.document;
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Ok(Reply::Continue);
    };
    let arg = words.next();
    match (command, arg) {
        ("quit" | "exit" | "q", _) => return Ok(Reply::Quit),
        ("help" | "?", _) => writeln!(out, "{HELP}")?,
        ("pages", _) => {
            for page in doc.pages() {
                writeln!(
                    out,
                    "page {:>3}  {:>6.1} x {:<6.1} {:>4} block(s){}",
                    page.id,
                    page.width,
                    page.height,
                    page.blocks().len(),
                    if page.ocr_applied { "  [ocr]" } else { "" }
                )?;
            }
        }
        ("page", Some(n)) => match n.parse().ok().and_then(|n| doc.page(n).ok()) {
            Some(page) => {
                for &id in page.blocks() {
                    writeln!(out, "{}", summary(doc, id, 0))?;
                }
            }
            None => writeln!(out, "{} no page '{n}'", "✗".red())?,
        },
        ("block", Some(id)) => match id.parse().ok().and_then(|id| doc.block(id).ok()) {
            Some(block) => {
                writeln!(out, "block {} ({})", block.id(), block.kind())?;
                writeln!(out, "  page:     {}", block.page_id())?;
                if let Some(parent) = block.parent() {
                    writeln!(out, "  parent:   {parent}")?;
                }
                let b = block.bbox;
                writeln!(out, "  bbox:     ({:.1}, {:.1}) - ({:.1}, {:.1})", b.x0, b.y0, b.x1, b.y1)?;
                if !block.children().is_empty() {
                    writeln!(out, "  children: {:?}", block.children())?;
                }
                writeln!(out, "  metadata: {}", serde_json::to_string(&block.metadata)?)?;
                writeln!(out, "{}", serde_json::to_string_pretty(block.content())?)?;
            }
            None => writeln!(out, "{} no block '{id}'", "✗".red())?,
        },
        ("tree", _) => {
            for page in doc.pages() {
                writeln!(out, "{}", format!("page {}", page.id).bold())?;
                for (depth, id) in doc.walk_page(page.id)? {
                    writeln!(out, "{}", summary(doc, id, depth + 1))?;
                }
            }
        }
        ("render", Some(format)) => {
            let rendered = format
                .parse::<OutputFormat>()
                .map_err(|e| e.to_string())
                .and_then(|format| {
                    result
                        .outputs
                        .iter()
                        .find(|o| o.format == format)
                        .ok_or_else(|| format!("no {format} output"))
                });
            match rendered {
                Ok(output) => writeln!(out, "{}", output.content.trim_end())?,
                Err(e) => writeln!(out, "{} {e}", "✗".red())?,
            }
        }
        _ => writeln!(out, "{} unknown command '{line}', try `help`", "✗".red())?,
    }
    Ok(Reply::Continue)
}

fn summary(doc: &Document, id: usize, depth: usize) -> String {
    let Ok(block) = doc.block(id) else {
        return format!("{}#{id} <missing>", "  ".repeat(depth));
    };
    let preview: String = block
        .text()
        .map(|t| t.chars().take(PREVIEW_CHARS).collect())
        .unwrap_or_default();
    format!(
        "{}#{:<4} {:<14} {}",
        "  ".repeat(depth),
        id,
        block.kind().to_string(),
        preview.replace('\n', " ")
    )
}
