//! Batch line edits
//!
//! A batch is validated as a whole before any line is touched, then applied
//! from the bottom of the document upwards so earlier ranges keep their line
//! numbers.

use super::LineEdit;
use crate::{Error, Result};

/// Split content into lines, remembering whether it ended with a newline
fn split_lines(content: &str) -> (Vec<String>, bool) {
    if content.is_empty() {
        return (Vec::new(), false);
    }
    let trailing = content.ends_with('\n');
    let body = if trailing {
        &content[..content.len() - 1]
    } else {
        content
    };
    (body.split('\n').map(str::to_string).collect(), trailing)
}

/// Check every edit against a document of `line_count` lines
pub fn validate_edits(edits: &[LineEdit], line_count: usize) -> Result<()> {
    if edits.is_empty() {
        return Err(Error::InvalidInput("edit batch is empty".into()));
    }

    for edit in edits {
        if edit.start_line == 0 {
            return Err(Error::InvalidInput(format!(
                "line numbers start at 1, got start_line {}",
                edit.start_line
            )));
        }
        if edit.end_line < edit.start_line {
            return Err(Error::InvalidInput(format!(
                "end_line {} is before start_line {}",
                edit.end_line, edit.start_line
            )));
        }
        if edit.end_line > line_count {
            return Err(Error::InvalidInput(format!(
                "range {}-{} is out of bounds for {} lines",
                edit.start_line, edit.end_line, line_count
            )));
        }
    }

    let mut ranges: Vec<(usize, usize)> = edits.iter().map(|e| (e.start_line, e.end_line)).collect();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        let (prev, next) = (pair[0], pair[1]);
        if next.0 <= prev.1 {
            return Err(Error::EditConflict(format!(
                "ranges {}-{} and {}-{} overlap",
                prev.0, prev.1, next.0, next.1
            )));
        }
    }
    Ok(())
}

/// Validate and apply `edits` to `content`, returning the new content
pub fn apply_edits(content: &str, edits: &[LineEdit]) -> Result<String> {
    let (mut lines, trailing) = split_lines(content);
    validate_edits(edits, lines.len())?;

    let mut ordered: Vec<&LineEdit> = edits.iter().collect();
    ordered.sort_by(|a, b| b.start_line.cmp(&a.start_line));

    for edit in ordered {
        let (replacement, _) = split_lines(&edit.new_content);
        lines.splice(edit.start_line - 1..edit.end_line, replacement);
    }

    let mut result = lines.join("\n");
    if trailing && !lines.is_empty() {
        result.push('\n');
    }
    Ok(result)
}
