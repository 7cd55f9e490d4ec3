use crate::sandbox::Sandbox;
use anyhow::{anyhow, Result};
use globset::{GlobBuilder, GlobMatcher, GlobSet, GlobSetBuilder};
use ignore::{DirEntry, Walk, WalkBuilder};
use regex::Regex;
use serde::Serialize;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEFAULT_MAX_DEPTH: usize = 2;
pub const DEFAULT_MAX_RESULTS: usize = 10;
pub const DEFAULT_CONTENT_MAX_RESULTS: usize = 50;
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

pub struct TraversalBudget {
	pub max_depth: usize,
	pub max_results: usize,
	pub excludes: Option<ExcludeSet>,
}

impl TraversalBudget {
	pub fn new(max_depth: usize, max_results: usize) -> Self {
		Self {
			max_depth: max_depth.max(1),
			max_results: max_results.max(1),
			excludes: None
		}
	}

	pub fn excluding(mut self, patterns: &[String]) -> Result<Self> {
		self.excludes = ExcludeSet::build(patterns)?;
		Ok(self)
	}
}

// Matched against the path relative to the walk root. A bare name prunes
// the contents of any directory with that name; the entry itself is kept.
#[derive(Clone)]
pub struct ExcludeSet {
	set: GlobSet,
}

impl ExcludeSet {
	pub fn build(patterns: &[String]) -> Result<Option<Self>> {
		let patterns: Vec<&String> = patterns.iter().filter(|p| !p.trim().is_empty()).collect();
		if patterns.is_empty() {
			return Ok(None);
		}
		let mut builder = GlobSetBuilder::new();
		for pattern in patterns {
			let pattern = pattern.trim();
			let glob_text = if pattern.contains('*') {
				pattern.to_string()
			}
			else {
				format!("**/{}/**", pattern.trim_matches('/'))
			};
			let glob = GlobBuilder::new(&glob_text)
				.literal_separator(true)
				.build()
				.map_err(|err| anyhow!("invalid exclude pattern {}: {}", pattern, err))?;
			builder.add(glob);
		}
		Ok(Some(Self {
			set: builder.build().map_err(|err| anyhow!("invalid exclude set: {}", err))?
		}))
	}

	pub fn is_match(&self, relative: &str) -> bool {
		self.set.is_match(relative)
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
	File,
	Dir,
}

pub struct Entry {
	pub path: PathBuf,
	// differs from `path` when a symlink was followed
	pub resolved: PathBuf,
	pub relative: String,
	pub name: String,
	pub kind: EntryKind,
	pub depth: usize,
}

pub trait Visitor {
	type Item;

	fn visit(&mut self, entry: &Entry, out: &mut Vec<Self::Item>);
}

/// Walks `root` depth first in name order and stops once `max_results` items are collected.
pub fn walk<V: Visitor>(sandbox: &Arc<Sandbox>, root: &Path, budget: &TraversalBudget, visitor: &mut V) -> Vec<V::Item> {
	let mut out = Vec::new();
	for entry in entries(sandbox, root, budget) {
		visitor.visit(&entry, &mut out);
		if out.len() >= budget.max_results {
			out.truncate(budget.max_results);
			break;
		}
	}
	out
}

fn walker(sandbox: &Arc<Sandbox>, root: &Path, budget: &TraversalBudget) -> Walk {
	let mut builder = WalkBuilder::new(root);
	builder.standard_filters(false);
	builder.follow_links(true);
	builder.max_depth(Some(budget.max_depth));
	builder.sort_by_file_name(|a, b| a.cmp(b));
	let excludes = budget.excludes.clone();
	let sandbox = sandbox.clone();
	let base = root.to_path_buf();
	builder.filter_entry(
		move |entry| {
			if entry.depth() == 0 {
				return true;
			}
			let relative = relative_display(&base, entry.path());
			if excludes.as_ref().map(|set| set.is_match(&relative)).unwrap_or(false) {
				return false;
			}
			// directories rejected here are never descended into; files are checked in inspect
			if !is_dir_entry(entry) {
				return true;
			}
			match sandbox.validate_absolute(entry.path()) {
				Ok(_) => true,
				Err(err) => {
					debug!(path = %entry.path().display(), error = %err, "pruning directory rejected by sandbox");
					false
				}
			}
		});
	builder.build()
}

fn entries<'a>(sandbox: &'a Arc<Sandbox>, root: &'a Path, budget: &TraversalBudget) -> impl Iterator<Item = Entry> + 'a {
	walker(sandbox, root, budget).filter_map(
		move |result| match result {
			Ok(entry) if entry.depth() == 0 => None,
			Ok(entry) => inspect(sandbox, root, &entry),
			Err(err) => {
				warn!(error = %err, "skipping unreadable entry");
				None
			}
		})
}

fn is_dir_entry(entry: &DirEntry) -> bool {
	entry.file_type().map(|file_type| file_type.is_dir()).unwrap_or(false)
}

fn inspect(sandbox: &Sandbox, root: &Path, entry: &DirEntry) -> Option<Entry> {
	let path = entry.path().to_path_buf();
	let resolved = match sandbox.validate_absolute(&path) {
		Ok(resolved) => resolved,
		Err(err) => {
			debug!(path = %path.display(), error = %err, "skipping entry rejected by sandbox");
			return None;
		}
	};
	let kind = if is_dir_entry(entry) {
		EntryKind::Dir
	}
	else {
		EntryKind::File
	};
	let name = entry.file_name().to_string_lossy().to_string();
	Some(Entry {
		relative: relative_display(root, &path),
		path,
		resolved,
		name,
		kind,
		depth: entry.depth() - 1
	})
}

fn relative_display(root: &Path, path: &Path) -> String {
	if let Ok(rel) = path.strip_prefix(root) {
		return rel.to_string_lossy().to_string();
	}
	path.to_string_lossy().to_string()
}

// case-insensitive substring of the name, files and directories alike
pub struct NameSearch {
	needle: String,
}

impl NameSearch {
	pub fn new(pattern: &str) -> Self {
		Self {
			needle: pattern.to_lowercase()
		}
	}
}

impl Visitor for NameSearch {
	type Item = PathBuf;

	fn visit(&mut self, entry: &Entry, out: &mut Vec<PathBuf>) {
		if entry.name.to_lowercase().contains(&self.needle) {
			out.push(entry.path.clone());
		}
	}
}

pub struct ExtensionSearch {
	extension: String,
}

impl ExtensionSearch {
	pub fn new(extension: &str) -> Self {
		Self {
			extension: extension.trim_start_matches('.').to_lowercase()
		}
	}
}

impl Visitor for ExtensionSearch {
	type Item = PathBuf;

	fn visit(&mut self, entry: &Entry, out: &mut Vec<PathBuf>) {
		if entry.kind != EntryKind::File {
			return;
		}
		let matches = entry.path
			.extension()
			.map(|ext| ext.to_string_lossy().to_lowercase() == self.extension)
			.unwrap_or(false);
		if matches {
			out.push(entry.path.clone());
		}
	}
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LineMatch {
	pub line_number: usize,
	pub line_content: String,
}

#[derive(Debug, Serialize)]
pub struct FileMatches {
	pub path: PathBuf,
	pub matches: Vec<LineMatch>,
}

// one line in memory at a time
pub struct ContentSearch {
	regex: Regex,
	file_glob: Option<GlobMatcher>,
	match_relative: bool,
	max_file_size: u64,
}

impl ContentSearch {
	pub fn new(regex: Regex, file_pattern: &str, max_file_size: u64) -> Result<Self> {
		let file_pattern = file_pattern.trim();
		let file_glob = if file_pattern.is_empty() || file_pattern == "*" {
			None
		}
		else {
			let glob = GlobBuilder::new(file_pattern)
				.literal_separator(true)
				.build()
				.map_err(|err| anyhow!("invalid file pattern: {}", err))?;
			Some(glob.compile_matcher())
		};
		Ok(Self {
			regex,
			file_glob,
			match_relative: file_pattern.contains('/'),
			max_file_size
		})
	}

	fn wants(&self, entry: &Entry) -> bool {
		match &self.file_glob {
			None => true,
			Some(glob) if self.match_relative => glob.is_match(&entry.relative),
			Some(glob) => glob.is_match(&entry.name),
		}
	}

	fn scan(&self, path: &Path) -> std::io::Result<Vec<LineMatch>> {
		let file = std::fs::File::open(path)?;
		let mut reader = std::io::BufReader::new(file);
		let mut buf = Vec::new();
		let mut matches = Vec::new();
		let mut line_number = 0usize;
		loop {
			buf.clear();
			if reader.read_until(b'\n', &mut buf)? == 0 {
				break;
			}
			line_number += 1;
			let line = String::from_utf8_lossy(&buf);
			let line = line.trim_end_matches(['\n', '\r']);
			if self.regex.is_match(line) {
				matches.push(LineMatch {
					line_number,
					line_content: line.to_string()
				});
			}
		}
		Ok(matches)
	}
}

impl Visitor for ContentSearch {
	type Item = FileMatches;

	fn visit(&mut self, entry: &Entry, out: &mut Vec<FileMatches>) {
		if entry.kind != EntryKind::File || !self.wants(entry) {
			return;
		}
		let size = match std::fs::metadata(&entry.resolved) {
			Ok(meta) => meta.len(),
			Err(_) => return,
		};
		if size > self.max_file_size {
			debug!(path = %entry.path.display(), size, limit = self.max_file_size, "skipping large file");
			return;
		}
		match self.scan(&entry.resolved) {
			Ok(matches) if !matches.is_empty() => out.push(FileMatches {
				path: entry.path.clone(),
				matches
			}),
			Ok(_) => {}
			Err(err) => warn!(path = %entry.path.display(), error = %err, "skipping unreadable file"),
		}
	}
}

#[derive(Debug, Serialize)]
pub struct TreeNode {
	pub name: String,
	#[serde(rename = "type")]
	pub kind: &'static str,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub children: Option<Vec<TreeNode>>,
}

/// Nested listing built from the same walk; directories always carry `children`, files never do.
pub fn tree(sandbox: &Arc<Sandbox>, root: &Path, budget: &TraversalBudget) -> Vec<TreeNode> {
	let mut top = Vec::new();
	let mut open: Vec<TreeNode> = Vec::new();
	for entry in entries(sandbox, root, budget) {
		close_to_depth(&mut open, &mut top, entry.depth);
		let node = match entry.kind {
			EntryKind::Dir => TreeNode {
				name: entry.name,
				kind: "directory",
				children: Some(Vec::new())
			},
			EntryKind::File => TreeNode {
				name: entry.name,
				kind: "file",
				children: None
			},
		};
		open.push(node);
	}
	close_to_depth(&mut open, &mut top, 0);
	top
}

// `open` holds the current chain of ancestors, one node per depth.
fn close_to_depth(open: &mut Vec<TreeNode>, top: &mut Vec<TreeNode>, depth: usize) {
	while open.len() > depth {
		let Some(node) = open.pop() else {
			break;
		};
		match open.last_mut() {
			Some(parent) => parent.children.get_or_insert_with(Vec::new).push(node),
			None => top.push(node),
		}
	}
}
