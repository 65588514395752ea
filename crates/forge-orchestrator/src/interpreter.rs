//! Turns a completed model response into a summary plus an ordered operation list.
//!
//! Two embeddings are understood:
//!
//! * the tagged protocol: `--- COMMANDS ---` / `--- END COMMANDS ---` regions holding
//!   one command per line, plus `--- START OF <path> ---` content blocks anywhere;
//! * the structured protocol: a single `<changes>` container of `<change>` elements.
//!
//! Both are extracted into the same raw change records, validated as a whole and only
//! then materialized. Any problem anywhere degrades to "whole text is the summary".

use std::ops::Range;

use quick_xml::events::Event;
use quick_xml::Reader as XmlReader;
use thiserror::Error;

use forge_types::{FileOperation, ParsedResponse};

pub const COMMANDS_START: &str = "--- COMMANDS ---";
pub const COMMANDS_END: &str = "--- END COMMANDS ---";
const BLOCK_START_PREFIX: &str = "--- START OF ";
const BLOCK_END_BARE: &str = "--- END OF ---";
const BLOCK_END_PREFIX: &str = "--- END OF ";
const MARKER_SUFFIX: &str = " ---";
const HEREDOC_PREFIX: &str = "<<<";
const CONTAINER_OPEN: &str = "<changes";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
enum InterpretError {
    #[error("unterminated {0}")]
    Unterminated(&'static str),
    #[error("unexpected marker on line {0}")]
    StrayMarker(usize),
    #[error("malformed command on line {line}: {reason}")]
    BadCommand { line: usize, reason: String },
    #[error("more than one <changes> container")]
    MultipleContainers,
    #[error("malformed <changes> container: {0}")]
    BadContainer(String),
    #[error("change #{index}: {reason}")]
    InvalidChange { index: usize, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperationKind {
    Write,
    CreateFolder,
    Move,
    Delete,
}

impl OperationKind {
    fn from_name(name: &str) -> Option<Self> {
        match name.trim() {
            "write" | "writeFile" => Some(OperationKind::Write),
            "createFolder" => Some(OperationKind::CreateFolder),
            "move" => Some(OperationKind::Move),
            "delete" => Some(OperationKind::Delete),
            _ => None,
        }
    }
}

/// One change as found in the text, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct RawChange {
    operation: String,
    path: Option<String>,
    content: Option<String>,
    source: Option<String>,
    destination: Option<String>,
    exact_path: bool,
    /// Ordering key: line number for the tagged protocol, element index otherwise.
    position: usize,
}

#[derive(Debug)]
enum ProtocolBlock {
    Tagged(Vec<RawChange>),
    Structured(Vec<RawChange>),
}

impl ProtocolBlock {
    fn name(&self) -> &'static str {
        match self {
            ProtocolBlock::Tagged(_) => "tagged",
            ProtocolBlock::Structured(_) => "structured",
        }
    }

    fn changes(&self) -> &[RawChange] {
        match self {
            ProtocolBlock::Tagged(changes) | ProtocolBlock::Structured(changes) => changes,
        }
    }
}

struct Extraction {
    block: ProtocolBlock,
    summary: String,
}

pub fn parse(text: &str) -> ParsedResponse {
    let extraction = match extract(text) {
        Ok(Some(extraction)) => extraction,
        Ok(None) => return ParsedResponse::summary_only(text),
        Err(err) => {
            tracing::debug!(error = %err, "response rejected during extraction");
            return ParsedResponse::summary_only(text);
        }
    };
    if let Err(err) = validate(extraction.block.changes()) {
        tracing::debug!(protocol = extraction.block.name(), error = %err, "response rejected during validation");
        return ParsedResponse::summary_only(text);
    }
    ParsedResponse {
        summary: extraction.summary,
        operations: materialize(extraction.block.changes()),
    }
}

fn extract(text: &str) -> Result<Option<Extraction>, InterpretError> {
    let spans = tagged_spans(text);
    if let Some(open) = find_container_open(text, 0, &spans) {
        return extract_structured(text, open, &spans).map(Some);
    }
    extract_tagged(text)
}

fn validate(changes: &[RawChange]) -> Result<(), InterpretError> {
    fn present(value: &Option<String>) -> bool {
        value.as_deref().is_some_and(|v| !v.trim().is_empty())
    }
    for (index, change) in changes.iter().enumerate() {
        let invalid = |reason: &str| InterpretError::InvalidChange {
            index,
            reason: reason.to_string(),
        };
        let Some(kind) = OperationKind::from_name(&change.operation) else {
            return Err(invalid(&format!(
                "unrecognized operation `{}`",
                change.operation
            )));
        };
        match kind {
            OperationKind::Write => {
                if !present(&change.path) {
                    return Err(invalid("write needs a path"));
                }
                if change.content.is_none() {
                    return Err(invalid("write needs content"));
                }
            }
            OperationKind::CreateFolder | OperationKind::Delete => {
                if !present(&change.path) {
                    return Err(invalid("operation needs a path"));
                }
            }
            OperationKind::Move => {
                if !present(&change.source) || !present(&change.destination) {
                    return Err(invalid("move needs source and destination"));
                }
            }
        }
    }
    Ok(())
}

/// Only called on validated changes.
fn materialize(changes: &[RawChange]) -> Vec<FileOperation> {
    let field = |value: &Option<String>| value.as_deref().unwrap_or_default().trim().to_string();
    changes
        .iter()
        .filter_map(|change| {
            let operation = match OperationKind::from_name(&change.operation)? {
                OperationKind::Write => FileOperation::WriteFile {
                    path: field(&change.path),
                    content: change.content.clone().unwrap_or_default(),
                    exact_path: change.exact_path,
                },
                OperationKind::CreateFolder => FileOperation::CreateFolder {
                    path: field(&change.path),
                },
                OperationKind::Move => FileOperation::Move {
                    source: field(&change.source),
                    destination: field(&change.destination),
                },
                OperationKind::Delete => FileOperation::Delete {
                    path: field(&change.path),
                },
            };
            Some(operation)
        })
        .collect()
}

/// Joins summary lines, collapsing runs of blank lines into one, then trims.
fn collapse_summary<'a>(lines: impl IntoIterator<Item = &'a str>) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut previous_blank = false;
    for line in lines {
        let blank = line.trim().is_empty();
        if blank && previous_blank {
            continue;
        }
        out.push(if blank { "" } else { line });
        previous_blank = blank;
    }
    out.join("\n").trim().to_string()
}

// ---------------------------------------------------------------------------
// tagged protocol

struct ContentBlock {
    path: String,
    content: String,
    position: usize,
    claimed: bool,
}

fn marker_inner<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    line.strip_prefix(prefix)?
        .strip_suffix(MARKER_SUFFIX)
        .map(str::trim)
}

fn is_block_end(trimmed: &str) -> bool {
    trimmed == BLOCK_END_BARE || marker_inner(trimmed, BLOCK_END_PREFIX).is_some()
}

fn extract_tagged(text: &str) -> Result<Option<Extraction>, InterpretError> {
    let lines = text.lines().collect::<Vec<_>>();
    let mut summary_lines: Vec<&str> = Vec::new();
    let mut commands: Vec<RawChange> = Vec::new();
    let mut blocks: Vec<ContentBlock> = Vec::new();
    let mut found_protocol = false;
    let mut i = 0;

    while i < lines.len() {
        let trimmed = lines[i].trim();
        if trimmed == COMMANDS_START {
            found_protocol = true;
            i = parse_command_region(&lines, i + 1, &mut commands)?;
            continue;
        }
        if let Some(path) = marker_inner(trimmed, BLOCK_START_PREFIX) {
            found_protocol = true;
            if path.is_empty() {
                return Err(InterpretError::BadCommand {
                    line: i + 1,
                    reason: "content block without a path".to_string(),
                });
            }
            let start = i;
            let mut body: Vec<&str> = Vec::new();
            i += 1;
            loop {
                let Some(line) = lines.get(i) else {
                    return Err(InterpretError::Unterminated("content block"));
                };
                let inner = line.trim();
                if is_block_end(inner) {
                    if let Some(end_path) = marker_inner(inner, BLOCK_END_PREFIX) {
                        if !end_path.is_empty() && end_path != path {
                            return Err(InterpretError::StrayMarker(i + 1));
                        }
                    }
                    break;
                }
                body.push(line);
                i += 1;
            }
            blocks.push(ContentBlock {
                path: path.to_string(),
                content: body.join("\n"),
                position: start,
                claimed: false,
            });
            i += 1;
            continue;
        }
        if trimmed == COMMANDS_END || is_block_end(trimmed) {
            return Err(InterpretError::StrayMarker(i + 1));
        }
        summary_lines.push(lines[i]);
        i += 1;
    }

    if !found_protocol {
        return Ok(None);
    }

    for command in commands.iter_mut() {
        if command.operation != "write" || command.content.is_some() {
            continue;
        }
        let Some(path) = command.path.as_deref().map(str::trim) else {
            continue;
        };
        if let Some(block) = blocks.iter_mut().find(|b| !b.claimed && b.path == path) {
            block.claimed = true;
            command.content = Some(block.content.clone());
        }
    }

    let mut changes = commands;
    changes.extend(blocks.into_iter().filter(|b| !b.claimed).map(|b| RawChange {
        operation: "write".to_string(),
        path: Some(b.path),
        content: Some(b.content),
        position: b.position,
        ..RawChange::default()
    }));
    changes.sort_by_key(|c| c.position);

    Ok(Some(Extraction {
        block: ProtocolBlock::Tagged(changes),
        summary: collapse_summary(summary_lines),
    }))
}

/// Parses commands from `start` up to the closing marker; returns the index after it.
fn parse_command_region(
    lines: &[&str],
    start: usize,
    out: &mut Vec<RawChange>,
) -> Result<usize, InterpretError> {
    let mut i = start;
    loop {
        let Some(line) = lines.get(i) else {
            return Err(InterpretError::Unterminated("command region"));
        };
        let trimmed = line.trim();
        if trimmed == COMMANDS_END {
            return Ok(i + 1);
        }
        if trimmed.is_empty() {
            i += 1;
            continue;
        }
        if trimmed == COMMANDS_START || marker_inner(trimmed, BLOCK_START_PREFIX).is_some() {
            return Err(InterpretError::StrayMarker(i + 1));
        }

        let line_no = i + 1;
        let bad = |reason: &str| InterpretError::BadCommand {
            line: line_no,
            reason: reason.to_string(),
        };
        let tokens = tokenize(trimmed).map_err(|reason| bad(&reason))?;
        let Some((name, args)) = tokens.split_first() else {
            i += 1;
            continue;
        };
        let mut change = RawChange {
            position: i,
            ..RawChange::default()
        };
        i += 1;

        match name.as_str() {
            "write" | "write!" => {
                change.operation = "write".to_string();
                change.exact_path = name == "write!";
                change.path = args.first().cloned();
                match args.get(1) {
                    None => {}
                    Some(heredoc) => {
                        let marker = heredoc
                            .strip_prefix(HEREDOC_PREFIX)
                            .filter(|m| !m.is_empty())
                            .ok_or_else(|| bad("expected `<<<MARKER` after the path"))?;
                        if args.len() > 2 {
                            return Err(bad("unexpected arguments after heredoc marker"));
                        }
                        let mut body: Vec<&str> = Vec::new();
                        loop {
                            let Some(content_line) = lines.get(i) else {
                                return Err(InterpretError::Unterminated("heredoc"));
                            };
                            i += 1;
                            if content_line.trim() == marker {
                                break;
                            }
                            body.push(content_line);
                        }
                        change.content = Some(body.join("\n"));
                    }
                }
            }
            "createFolder" | "delete" => {
                if args.len() > 1 {
                    return Err(bad("too many arguments"));
                }
                change.operation = name.clone();
                change.path = args.first().cloned();
            }
            "move" => {
                if args.len() > 2 {
                    return Err(bad("too many arguments"));
                }
                change.operation = name.clone();
                change.source = args.first().cloned();
                change.destination = args.get(1).cloned();
            }
            // left for validation to reject
            other => change.operation = other.to_string(),
        }
        out.push(change);
    }
}

/// Whitespace tokenizer with double-quoted tokens (`\"` and `\\` escapes).
fn tokenize(line: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let mut token = String::new();
        if c == '"' {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '"' => {
                        closed = true;
                        break;
                    }
                    '\\' => match chars.next() {
                        Some(escaped @ ('"' | '\\')) => token.push(escaped),
                        Some(other) => {
                            token.push('\\');
                            token.push(other);
                        }
                        None => return Err("unterminated quote".to_string()),
                    },
                    other => token.push(other),
                }
            }
            if !closed {
                return Err("unterminated quote".to_string());
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                token.push(c);
                chars.next();
            }
        }
        tokens.push(token);
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// structured protocol

/// Byte ranges of tagged command regions and content blocks. An unterminated region
/// runs to the end of the text.
fn tagged_spans(text: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut open: Option<(usize, bool)> = None;
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim();
        match open {
            None if trimmed == COMMANDS_START => open = Some((offset, true)),
            None if marker_inner(trimmed, BLOCK_START_PREFIX).is_some() => {
                open = Some((offset, false))
            }
            None => {}
            Some((start, commands)) => {
                let closed = if commands {
                    trimmed == COMMANDS_END
                } else {
                    is_block_end(trimmed)
                };
                if closed {
                    spans.push(start..offset + line.len());
                    open = None;
                }
            }
        }
        offset += line.len();
    }
    if let Some((start, _)) = open {
        spans.push(start..text.len());
    }
    spans
}

/// Byte offset of the next `<changes` opening tag at or after `from` that is not part
/// of a tagged region.
fn find_container_open(text: &str, from: usize, skip: &[Range<usize>]) -> Option<usize> {
    let mut search = from;
    while let Some(rel) = text.get(search..)?.find(CONTAINER_OPEN) {
        let at = search + rel;
        search = at + CONTAINER_OPEN.len();
        if skip.iter().any(|span| span.contains(&at)) {
            continue;
        }
        let next = text[search..].chars().next();
        if matches!(next, Some(c) if c == '>' || c == '/' || c.is_whitespace()) {
            return Some(at);
        }
    }
    None
}

fn extract_structured(
    text: &str,
    open: usize,
    skip: &[Range<usize>],
) -> Result<Extraction, InterpretError> {
    let (changes, len) = parse_container(&text[open..])?;
    let end = open + len;
    if find_container_open(text, end, skip).is_some() {
        return Err(InterpretError::MultipleContainers);
    }
    let summary = collapse_summary(text[..open].lines().chain(text[end..].lines()));
    Ok(Extraction {
        block: ProtocolBlock::Structured(changes),
        summary,
    })
}

const CHANGE_FIELDS: [&str; 7] = [
    "operation",
    "op",
    "path",
    "content",
    "source",
    "destination",
    "exact_path",
];

#[derive(Default)]
struct FieldValue {
    text: String,
    cdata: String,
    has_cdata: bool,
}

impl FieldValue {
    /// CDATA wins when everything else around it is whitespace.
    fn finish(self) -> String {
        if self.has_cdata && self.text.trim().is_empty() {
            self.cdata
        } else {
            self.text
        }
    }
}

enum Level {
    Outside,
    Container,
    Change(RawChange),
    Field(RawChange, String, FieldValue),
}

fn element_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

fn store_field(change: &mut RawChange, name: &str, value: String) -> Result<(), InterpretError> {
    let duplicate = || InterpretError::BadContainer(format!("duplicate <{name}> element"));
    let slot = match name {
        "operation" | "op" => {
            if !change.operation.is_empty() {
                return Err(duplicate());
            }
            change.operation = value.trim().to_string();
            return Ok(());
        }
        "exact_path" => {
            change.exact_path = match value.trim() {
                "true" => true,
                "false" => false,
                other => {
                    return Err(InterpretError::BadContainer(format!(
                        "exact_path must be true or false, got `{other}`"
                    )))
                }
            };
            return Ok(());
        }
        "path" => &mut change.path,
        "content" => &mut change.content,
        "source" => &mut change.source,
        "destination" => &mut change.destination,
        other => {
            return Err(InterpretError::BadContainer(format!(
                "unknown element <{other}>"
            )))
        }
    };
    if slot.is_some() {
        return Err(duplicate());
    }
    *slot = Some(value);
    Ok(())
}

fn resolve_entity(name: &str) -> Option<char> {
    match name {
        "lt" => Some('<'),
        "gt" => Some('>'),
        "amp" => Some('&'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        _ => {
            let numeric = name.strip_prefix('#')?;
            let code = match numeric.strip_prefix('x') {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => numeric.parse::<u32>().ok()?,
            };
            char::from_u32(code)
        }
    }
}

fn unescape_text(raw: &str) -> Result<String, InterpretError> {
    if !raw.contains('&') {
        return Ok(raw.to_string());
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp + 1..];
        let semi = after
            .find(';')
            .ok_or_else(|| InterpretError::BadContainer("unterminated entity".to_string()))?;
        let entity = resolve_entity(&after[..semi]).ok_or_else(|| {
            InterpretError::BadContainer(format!("unknown entity `&{};`", &after[..semi]))
        })?;
        out.push(entity);
        rest = &after[semi + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn utf8(raw: &[u8]) -> Result<&str, InterpretError> {
    std::str::from_utf8(raw).map_err(|e| InterpretError::BadContainer(e.to_string()))
}

/// Reads one container starting at the beginning of `xml`. Returns its changes and the
/// byte length of the container; whatever follows it is not read.
fn parse_container(xml: &str) -> Result<(Vec<RawChange>, usize), InterpretError> {
    let mut reader = XmlReader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut changes = Vec::new();
    let mut level = Level::Outside;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| InterpretError::BadContainer(e.to_string()))?;
        level = match (level, event) {
            (Level::Outside, Event::Start(e)) if e.name().as_ref() == b"changes" => {
                Level::Container
            }
            (Level::Outside, Event::Empty(e)) if e.name().as_ref() == b"changes" => {
                return Ok((changes, reader.buffer_position() as usize));
            }
            (Level::Container, Event::Start(e)) if e.name().as_ref() == b"change" => {
                Level::Change(RawChange {
                    position: changes.len(),
                    ..RawChange::default()
                })
            }
            (Level::Container, Event::Empty(e)) if e.name().as_ref() == b"change" => {
                changes.push(RawChange {
                    position: changes.len(),
                    ..RawChange::default()
                });
                Level::Container
            }
            (Level::Container, Event::End(_)) => {
                return Ok((changes, reader.buffer_position() as usize));
            }
            (Level::Change(change), Event::Start(e)) => {
                let name = element_name(e.name().as_ref());
                if !CHANGE_FIELDS.contains(&name.as_str()) {
                    return Err(InterpretError::BadContainer(format!(
                        "unknown element <{name}>"
                    )));
                }
                Level::Field(change, name, FieldValue::default())
            }
            (Level::Change(mut change), Event::Empty(e)) => {
                let name = element_name(e.name().as_ref());
                store_field(&mut change, &name, String::new())?;
                Level::Change(change)
            }
            (Level::Change(change), Event::End(_)) => {
                changes.push(change);
                Level::Container
            }
            (Level::Field(mut change, name, value), Event::End(_)) => {
                store_field(&mut change, &name, value.finish())?;
                Level::Change(change)
            }
            (Level::Field(change, name, mut value), Event::Text(t)) => {
                value.text.push_str(&unescape_text(utf8(&t)?)?);
                Level::Field(change, name, value)
            }
            (Level::Field(change, name, mut value), Event::CData(c)) => {
                value.cdata.push_str(utf8(&c)?);
                value.has_cdata = true;
                Level::Field(change, name, value)
            }
            (Level::Field(change, name, mut value), Event::GeneralRef(r)) => {
                let entity = utf8(&r)?;
                let resolved = resolve_entity(entity).ok_or_else(|| {
                    InterpretError::BadContainer(format!("unknown entity `&{entity};`"))
                })?;
                value.text.push(resolved);
                Level::Field(change, name, value)
            }
            (Level::Field(..), Event::Start(e) | Event::Empty(e)) => {
                return Err(InterpretError::BadContainer(format!(
                    "unexpected <{}> inside a field",
                    element_name(e.name().as_ref())
                )))
            }
            (_, Event::Eof) => return Err(InterpretError::Unterminated("<changes> container")),
            (level, Event::Text(t)) => {
                if !utf8(&t)?.trim().is_empty() {
                    return Err(InterpretError::BadContainer(
                        "stray text inside <changes>".to_string(),
                    ));
                }
                level
            }
            (level, Event::Comment(_) | Event::Decl(_) | Event::PI(_)) => level,
            (_, other) => {
                return Err(InterpretError::BadContainer(format!(
                    "unexpected content {other:?}"
                )))
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &str, content: &str) -> FileOperation {
        FileOperation::write(path, content)
    }

    #[test]
    fn structured_single_write_round_trips() {
        let text = "<changes><change><operation>write</operation><path>a.txt</path><content>hi</content></change></changes>";
        let parsed = parse(text);
        assert_eq!(parsed.summary, "");
        assert_eq!(parsed.operations, vec![write("a.txt", "hi")]);
    }

    #[test]
    fn structured_move_missing_destination_rejects_everything() {
        let text = "Moving things.\n<changes>\n  <change><op>write</op><path>b.txt</path><content>x</content></change>\n  <change><op>move</op><source>a.txt</source></change>\n</changes>";
        let parsed = parse(text);
        assert_eq!(parsed.summary, text);
        assert!(parsed.operations.is_empty());
    }

    #[test]
    fn structured_keeps_order_and_summary_around_container() {
        let text = "Here is the plan.\n\n\n\n<changes>\n<change><operation>createFolder</operation><path>src</path></change>\n<change><operation>write</operation><path>src/main.rs</path><content><![CDATA[fn main() { let v: Vec<u8> = vec![]; }]]></content></change>\n<change><operation>move</operation><source>old.rs</source><destination>src/old.rs</destination></change>\n<change><operation>delete</operation><path>tmp</path></change>\n</changes>\n\nDone.";
        let parsed = parse(text);
        assert_eq!(parsed.summary, "Here is the plan.\n\nDone.");
        assert_eq!(
            parsed.operations,
            vec![
                FileOperation::CreateFolder {
                    path: "src".to_string()
                },
                write("src/main.rs", "fn main() { let v: Vec<u8> = vec![]; }"),
                FileOperation::Move {
                    source: "old.rs".to_string(),
                    destination: "src/old.rs".to_string()
                },
                FileOperation::Delete {
                    path: "tmp".to_string()
                },
            ]
        );
    }

    #[test]
    fn structured_unescapes_entities_and_reads_exact_path() {
        let text = "<changes><change><operation>write</operation><path>a.rs</path><content>a &lt; b &amp;&amp; c</content><exact_path>true</exact_path></change></changes>";
        let parsed = parse(text);
        assert_eq!(
            parsed.operations,
            vec![FileOperation::WriteFile {
                path: "a.rs".to_string(),
                content: "a < b && c".to_string(),
                exact_path: true,
            }]
        );
    }

    #[test]
    fn structured_rejects_malformed_containers() {
        for text in [
            "<changes><change><op>delete</op><path>a</path></change>",
            "<changes>stray<change><op>delete</op><path>a</path></change></changes>",
            "<changes><change><op>delete</op><path>a</path></change></changes><changes></changes>",
            "<changes><change><op>delete</op><path>a</path><color>red</color></change></changes>",
            "<changes><change><op>explode</op><path>a</path></change></changes>",
            "<changes><change><op>write</op><path>a</path></change></changes>",
            "<changes><change><op>delete</op><path>a</change></changes>",
        ] {
            let parsed = parse(text);
            assert_eq!(parsed.summary, text, "input: {text}");
            assert!(parsed.operations.is_empty(), "input: {text}");
        }
    }

    #[test]
    fn tagged_commands_with_heredoc_and_blocks() {
        let text = "I refactored the app.\n\n--- COMMANDS ---\ncreateFolder src\nwrite src/lib.rs <<<EOF\npub fn lib() {}\n\nEOF\nwrite src/main.rs\nmove \"old name.txt\" docs/new.txt\n--- END COMMANDS ---\n\n\n--- START OF src/main.rs ---\nfn main() {}\n--- END OF ---\nThat is all.";
        let parsed = parse(text);
        assert_eq!(parsed.summary, "I refactored the app.\n\nThat is all.");
        assert_eq!(
            parsed.operations,
            vec![
                FileOperation::CreateFolder {
                    path: "src".to_string()
                },
                write("src/lib.rs", "pub fn lib() {}\n"),
                write("src/main.rs", "fn main() {}"),
                FileOperation::Move {
                    source: "old name.txt".to_string(),
                    destination: "docs/new.txt".to_string()
                },
            ]
        );
    }

    #[test]
    fn unclaimed_blocks_become_writes_in_position_order() {
        let text = "--- START OF a.txt ---\nA\n--- END OF a.txt ---\n--- COMMANDS ---\ndelete b.txt\n--- END COMMANDS ---\n--- START OF c.txt ---\nC\n--- END OF ---";
        let parsed = parse(text);
        assert_eq!(parsed.summary, "");
        assert_eq!(
            parsed.operations,
            vec![
                write("a.txt", "A"),
                FileOperation::Delete {
                    path: "b.txt".to_string()
                },
                write("c.txt", "C"),
            ]
        );
    }

    #[test]
    fn exact_write_sets_flag() {
        let text = "--- COMMANDS ---\nwrite! old.txt <<<END\nx\nEND\n--- END COMMANDS ---";
        let parsed = parse(text);
        assert_eq!(
            parsed.operations,
            vec![FileOperation::WriteFile {
                path: "old.txt".to_string(),
                content: "x".to_string(),
                exact_path: true,
            }]
        );
    }

    #[test]
    fn tagged_errors_fall_back_to_verbatim_summary() {
        for text in [
            "--- COMMANDS ---\ndelete a.txt",
            "--- COMMANDS ---\nwrite a.txt <<<EOF\nno end\n--- END COMMANDS ---",
            "--- COMMANDS ---\nwrite missing.txt\n--- END COMMANDS ---",
            "--- COMMANDS ---\nrename a b\n--- END COMMANDS ---",
            "--- COMMANDS ---\nmove a.txt\n--- END COMMANDS ---",
            "--- COMMANDS ---\ndelete \"a.txt\n--- END COMMANDS ---",
            "--- START OF a.txt ---\nbody",
            "text\n--- END COMMANDS ---",
        ] {
            let parsed = parse(text);
            assert_eq!(parsed.summary, text, "input: {text}");
            assert!(parsed.operations.is_empty(), "input: {text}");
        }
    }

    #[test]
    fn plain_text_is_returned_verbatim() {
        let text = "  Nothing to change here.\n\n\n";
        let parsed = parse(text);
        assert_eq!(parsed.summary, text);
        assert!(parsed.operations.is_empty());
        assert!(parse("").is_empty());
    }

    #[test]
    fn reparsing_a_summary_is_idempotent() {
        let first = parse("Summary line.\n\n\n\nSecond paragraph.\n--- COMMANDS ---\ndelete x\n--- END COMMANDS ---");
        assert_eq!(first.summary, "Summary line.\n\nSecond paragraph.");
        let second = parse(&first.summary);
        assert_eq!(second.summary, first.summary);
        assert!(second.operations.is_empty());
    }

    #[test]
    fn structured_protocol_takes_precedence_over_tagged_markers() {
        let text = "--- COMMANDS ---\ndelete a\n--- END COMMANDS ---\n<changes><change><op>delete</op><path>b</path></change></changes>";
        let parsed = parse(text);
        assert_eq!(
            parsed.operations,
            vec![FileOperation::Delete {
                path: "b".to_string()
            }]
        );
        assert_eq!(
            parsed.summary,
            "--- COMMANDS ---\ndelete a\n--- END COMMANDS ---"
        );
    }

    #[test]
    fn container_end_is_found_by_the_xml_reader() {
        let text = "Added a parser fixture.\n<changes><change><operation>write</operation><path>fixture.xml</path><content><![CDATA[<changes></changes>]]></content></change></changes>\nClose every </changes> tag you open.";
        let parsed = parse(text);
        assert_eq!(
            parsed.operations,
            vec![write("fixture.xml", "<changes></changes>")]
        );
        assert_eq!(
            parsed.summary,
            "Added a parser fixture.\n\nClose every </changes> tag you open."
        );
    }

    #[test]
    fn xml_inside_tagged_regions_does_not_switch_protocols() {
        let text = "Wrote the fixtures.\n--- COMMANDS ---\nwrite fixture.xml <<<EOF\n<changes>\n  <change/>\n</changes>\nEOF\nwrite other.xml\n--- END COMMANDS ---\n--- START OF other.xml ---\n<changes />\n--- END OF other.xml ---";
        let parsed = parse(text);
        assert_eq!(parsed.summary, "Wrote the fixtures.");
        assert_eq!(
            parsed.operations,
            vec![
                write("fixture.xml", "<changes>\n  <change/>\n</changes>"),
                write("other.xml", "<changes />"),
            ]
        );
    }

    #[test]
    fn tokenizer_handles_quotes_and_escapes() {
        assert_eq!(
            tokenize(r#"move "a \"b\".txt" c"#).expect("tokens"),
            vec!["move".to_string(), "a \"b\".txt".to_string(), "c".to_string()]
        );
        assert!(tokenize("delete \"open").is_err());
    }
}
