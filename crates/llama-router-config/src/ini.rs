// Minimal INI reader for preset files

use crate::error::PresetError;

/// Section used for keys that appear before any header.
pub const DEFAULT_SECTION: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IniEntry {
    pub key: String,
    pub value: String,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IniSection {
    pub name: String,
    pub entries: Vec<IniEntry>,
}

/// Parse INI text into sections, in order of first appearance. A repeated
/// header continues the earlier section; a repeated key keeps the last value.
pub fn parse_ini(text: &str) -> Result<Vec<IniSection>, PresetError> {
    let mut sections: Vec<IniSection> = Vec::new();
    let mut current = DEFAULT_SECTION.to_string();

    for (index, raw) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }

        if let Some(rest) = line.strip_prefix('[') {
            let Some((name, tail)) = rest.split_once(']') else {
                return Err(syntax(line_no, "unterminated section header"));
            };
            if !strip_comment(tail).is_empty() {
                return Err(syntax(line_no, "unexpected text after section header"));
            }
            current = name.trim().to_string();
            section_mut(&mut sections, &current);
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(syntax(line_no, "expected 'key = value'"));
        };
        let key = key.trim();
        if !is_ident(key) {
            return Err(syntax(line_no, &format!("invalid key '{key}'")));
        }
        let value = strip_comment(value).to_string();

        let section = section_mut(&mut sections, &current);
        section.entries.retain(|e| e.key != key);
        section.entries.push(IniEntry {
            key: key.to_string(),
            value,
            line: line_no,
        });
    }

    Ok(sections)
}

fn section_mut<'a>(sections: &'a mut Vec<IniSection>, name: &str) -> &'a mut IniSection {
    let index = match sections.iter().position(|s| s.name == name) {
        Some(index) => index,
        None => {
            sections.push(IniSection {
                name: name.to_string(),
                entries: Vec::new(),
            });
            sections.len() - 1
        }
    };
    &mut sections[index]
}

/// Cut a value at the first `;` or `#` and trim surrounding whitespace.
fn strip_comment(value: &str) -> &str {
    let end = value.find([';', '#']).unwrap_or(value.len());
    value[..end].trim()
}

fn is_ident(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn syntax(line: usize, message: &str) -> PresetError {
    PresetError::Syntax {
        line,
        message: message.to_string(),
    }
}
