use crate::error::FsError;
use serde::Deserialize;
use similar::TextDiff;

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditOperation {
	pub old_text: String,
	pub new_text: String,
}

pub struct EditOutcome {
	pub original: String,
	pub updated: String,
	pub diff: String,
}

pub fn normalize_line_endings(text: &str) -> String {
	text.replace("\r\n", "\n")
}

/// Applies `edits` in order to one buffer. Nothing is returned unless every edit matched.
pub fn apply_edits(content: &str, edits: &[EditOperation], label: &str) -> Result<EditOutcome, FsError> {
	let original = normalize_line_endings(content);
	let mut buffer = original.clone();
	for edit in edits {
		let old_text = normalize_line_endings(&edit.old_text);
		let new_text = normalize_line_endings(&edit.new_text);
		if old_text.is_empty() {
			return Err(FsError::invalid("oldText must not be empty"));
		}
		if buffer.contains(&old_text) {
			buffer = buffer.replacen(&old_text, &new_text, 1);
			continue;
		}
		match replace_fuzzy(&buffer, &old_text, &new_text) {
			Some(next) => buffer = next,
			None => return Err(FsError::NoExactMatch(edit.old_text.clone())),
		}
	}
	let diff = make_diff(&original, &buffer, label);
	Ok(EditOutcome {
		original,
		updated: buffer,
		diff
	})
}

/// Line-window match on trimmed lines; the earliest window wins.
fn replace_fuzzy(buffer: &str, old_text: &str, new_text: &str) -> Option<String> {
	let old_lines: Vec<&str> = old_text.split('\n').collect();
	let content_lines: Vec<&str> = buffer.split('\n').collect();
	if old_lines.len() > content_lines.len() {
		return None;
	}
	let start = (0..=content_lines.len() - old_lines.len()).find(
		|&i| {
			old_lines.iter()
				.zip(&content_lines[i..i + old_lines.len()])
				.all(|(old, line)| old.trim() == line.trim())
		})?;
	let original_indent = leading_whitespace(content_lines[start]);
	let replacement: Vec<String> = new_text
		.split('\n')
		.enumerate()
		.map(
			|(j, line)| {
				if j == 0 {
					return format!("{}{}", original_indent, line.trim_start());
				}
				let old_indent = old_lines.get(j).map(|old| leading_whitespace(old)).unwrap_or("");
				let new_indent = leading_whitespace(line);
				// Relative indent only when both sides are indented; otherwise the line is kept verbatim.
				if !old_indent.is_empty() && !new_indent.is_empty() {
					let relative = new_indent.len().saturating_sub(old_indent.len());
					return format!("{}{}{}", original_indent, " ".repeat(relative), line.trim_start());
				}
				line.to_string()
			})
		.collect();
	let mut lines: Vec<String> = content_lines.iter().map(|line| line.to_string()).collect();
	lines.splice(start..start + old_lines.len(), replacement);
	Some(lines.join("\n"))
}

fn leading_whitespace(line: &str) -> &str {
	let trimmed = line.trim_start();
	&line[..line.len() - trimmed.len()]
}

pub fn make_diff(existing: &str, updated: &str, label: &str) -> String {
	let diff = TextDiff::from_lines(existing, updated);
	diff.unified_diff()
		.context_radius(3)
		.header(&format!("a/{}", label), &format!("b/{}", label))
		.to_string()
}

/// Wraps a diff in a fence longer than any backtick run inside it.
pub fn fence_diff(diff: &str) -> String {
	let mut fence = "```".to_string();
	while diff.contains(&fence) {
		fence.push('`');
	}
	format!("{}diff\n{}{}\n\n", fence, diff, fence)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn op(old: &str, new: &str) -> EditOperation {
		EditOperation {
			old_text: old.to_string(),
			new_text: new.to_string()
		}
	}

	#[test]
	fn exact_edit_produces_diff() {
		let outcome = apply_edits("X\nY\n", &[op("X", "Z")], "a.txt").expect("edit");
		assert_eq!(outcome.updated, "Z\nY\n");
		assert!(outcome.diff.lines().any(|line| line == "-X"));
		assert!(outcome.diff.lines().any(|line| line == "+Z"));
	}

	#[test]
	fn only_first_occurrence_is_replaced() {
		let outcome = apply_edits("foo\nfoo\n", &[op("foo", "bar")], "f").expect("edit");
		assert_eq!(outcome.updated, "bar\nfoo\n");
	}

	#[test]
	fn edits_apply_in_order_to_one_buffer() {
		let outcome = apply_edits("a\n", &[op("a", "b"), op("b", "c")], "f").expect("edit");
		assert_eq!(outcome.updated, "c\n");
	}

	#[test]
	fn crlf_is_normalized_before_matching() {
		let outcome = apply_edits("one\r\ntwo\r\n", &[op("one\r\ntwo", "three")], "f").expect("edit");
		assert_eq!(outcome.updated, "three\n");
	}

	#[test]
	fn fuzzy_match_keeps_first_line_indent() {
		let content = "fn main() {\n    let x = 1;\n        call(x);\n}\n";
		let edit = op("let x = 1;\n    call(x);", "let y = 2;\n      call(y);");
		let outcome = apply_edits(content, &[edit], "main.rs").expect("edit");
		assert_eq!(outcome.updated, "fn main() {\n    let y = 2;\n      call(y);\n}\n");
	}

	#[test]
	fn fuzzy_match_keeps_unindented_new_line_verbatim() {
		let content = "  a\n  b\n";
		let outcome = apply_edits(content, &[op("a\nb", "c\n    d")], "f").expect("edit");
		assert_eq!(outcome.updated, "  c\n    d\n");
	}

	#[test]
	fn missing_text_fails_without_partial_result() {
		let err = apply_edits("X\nY\n", &[op("X", "Z"), op("nope", "q")], "f").err().expect("error");
		assert_eq!(err.code(), "NO_EXACT_MATCH");
		assert!(err.to_string().contains("nope"));
	}

	#[test]
	fn empty_old_text_is_rejected() {
		let err = apply_edits("X\n", &[op("", "Z")], "f").err().expect("error");
		assert_eq!(err.code(), "INVALID_ARGUMENT");
	}

	#[test]
	fn fence_grows_past_backtick_runs() {
		assert!(fence_diff("+plain\n").starts_with("```diff\n"));
		let fenced = fence_diff("+````code\n");
		assert!(fenced.starts_with("`````diff\n"));
		assert!(fenced.ends_with("`````\n\n"));
	}
}
