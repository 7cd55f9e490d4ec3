use crate::error::{format_io_error, FsError};
use crate::walk::{Entry, EntryKind, Visitor};
use anyhow::Result;
use rand::seq::SliceRandom;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use serde_json_path::JsonPath;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Reads a whole text file, refusing files above `max_bytes` instead of truncating.
pub fn read_capped(path: &Path, label: &str, max_bytes: usize) -> Result<String> {
	let meta = std::fs::metadata(path).map_err(|err| format_io_error("read", label, err))?;
	if meta.len() > max_bytes as u64 {
		return Err(
			FsError::SizeExceeded {
				path: label.to_string(),
				actual: meta.len(),
				limit: max_bytes as u64,
			}
			.into()
		);
	}
	let text = std::fs::read_to_string(path).map_err(|err| format_io_error("read", label, err))?;
	Ok(text)
}

pub fn read_document(path: &Path, label: &str, max_bytes: usize) -> Result<Value> {
	let text = read_capped(path, label, max_bytes)?;
	let doc = serde_json::from_str(&text).map_err(|err| FsError::invalid(format!("{} is not valid JSON: {}", label, err)))?;
	Ok(doc)
}

/// Splits `items[0].name`, `$.a.b` or `a.b.2` into segments.
fn segments(path: &str) -> Vec<String> {
	let trimmed = path.trim();
	let trimmed = trimmed.strip_prefix('$').unwrap_or(trimmed);
	let mut out = Vec::new();
	let mut current = String::new();
	for c in trimmed.chars() {
		match c {
			'.' | '[' | ']' => {
				if !current.is_empty() {
					out.push(current.trim_matches(|q| q == '\'' || q == '"').to_string());
					current.clear();
				}
			}
			_ => current.push(c),
		}
	}
	if !current.is_empty() {
		out.push(current);
	}
	out
}

pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
	segments(path).iter().try_fold(
		doc,
		|node, segment| match node {
			Value::Object(map) => map.get(segment),
			Value::Array(items) => segment.parse::<usize>().ok().and_then(|index| items.get(index)),
			_ => None,
		})
}

pub fn get_value(doc: &Value, field: &str) -> Result<Value> {
	lookup(doc, field)
		.cloned()
		.ok_or_else(|| FsError::NotFound(format!("field {}", field)).into())
}

// A single match comes back unwrapped; no match is null.
pub fn query(doc: &Value, expression: &str) -> Result<(Value, usize)> {
	let path = JsonPath::parse(expression).map_err(|err| FsError::invalid(format!("invalid JSONPath {}: {}", expression, err)))?;
	let nodes = path.query(doc).all();
	let count = nodes.len();
	let result = match nodes.as_slice() {
		[] => Value::Null,
		[single] => (*single).clone(),
		many => Value::Array(many.iter().map(|node| (*node).clone()).collect()),
	};
	Ok((result, count))
}

fn type_name(value: &Value) -> &'static str {
	match value {
		Value::Null => "null",
		Value::Bool(_) => "boolean",
		Value::Number(_) => "number",
		Value::String(_) => "string",
		Value::Array(_) => "array",
		Value::Object(_) => "object",
	}
}

pub fn structure(doc: &Value, max_depth: usize, detailed_arrays: bool) -> Value {
	match doc {
		Value::Array(_) => json!({
			"type": "array",
			"elements": analyze(doc, 0, max_depth, detailed_arrays),
		}),
		Value::Object(map) => Value::Object(
			map.iter()
				.map(|(key, value)| (key.clone(), analyze(value, 0, max_depth, detailed_arrays)))
				.collect()
		),
		other => analyze(other, 0, max_depth, detailed_arrays),
	}
}

fn analyze(value: &Value, depth: usize, max_depth: usize, detailed_arrays: bool) -> Value {
	match value {
		Value::Array(items) => {
			if items.is_empty() {
				return json!({ "type": "array<empty>" });
			}
			let mut kinds: Vec<String> = Vec::new();
			let sampled = if detailed_arrays {
				&items[..]
			}
			else {
				&items[..1]
			};
			for item in sampled {
				let kind = analyze(item, depth + 1, max_depth, detailed_arrays)["type"]
					.as_str()
					.unwrap_or("unknown")
					.to_string();
				if !kinds.contains(&kind) {
					kinds.push(kind);
				}
			}
			json!({ "type": format!("array<{}>", kinds.join("|")) })
		}
		Value::Object(map) => {
			if depth < max_depth && !map.is_empty() {
				let nested: Map<String, Value> = map
					.iter()
					.map(|(key, value)| (key.clone(), analyze(value, depth + 1, max_depth, detailed_arrays)))
					.collect();
				return json!({ "type": "object", "structure": nested });
			}
			json!({ "type": "object" })
		}
		other => json!({ "type": type_name(other) }),
	}
}

#[derive(Clone, Debug, Deserialize)]
pub struct Condition {
	pub field: String,
	pub operator: String,
	#[serde(default)]
	pub value: Option<Value>,
}

/// The array to operate on: `array_path` if given, else the root array or its only array property.
fn target_array<'a>(doc: &'a Value, array_path: Option<&str>) -> Result<&'a Vec<Value>> {
	if let Some(array_path) = array_path.filter(|p| !p.trim().is_empty() && p.trim() != "$") {
		return match lookup(doc, array_path) {
			Some(Value::Array(items)) => Ok(items),
			_ => Err(FsError::invalid(format!("path {} did not resolve to an array", array_path)).into()),
		};
	}
	match doc {
		Value::Array(items) => Ok(items),
		Value::Object(map) => {
			let arrays: Vec<&Vec<Value>> = map.values().filter_map(Value::as_array).collect();
			match arrays.len() {
				1 => Ok(arrays[0]),
				0 => Err(FsError::invalid("no arrays found in the JSON data; provide arrayPath").into()),
				_ => Err(FsError::invalid("multiple arrays found in the JSON data; provide arrayPath").into()),
			}
		}
		_ => Err(FsError::invalid("the JSON data is not an array or an object containing arrays").into()),
	}
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
	match (left, right) {
		(Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
		(Value::String(a), Value::String(b)) => Some(a.cmp(b)),
		(Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
		_ => None,
	}
}

fn as_text(value: &Value) -> String {
	match value {
		Value::String(text) => text.clone(),
		other => other.to_string(),
	}
}

fn condition_holds(item: &Value, condition: &Condition) -> Result<bool> {
	let found = lookup(item, &condition.field);
	if condition.operator == "exists" {
		return Ok(found.is_some());
	}
	let expected = condition.value.as_ref().unwrap_or(&Value::Null);
	let holds = match (condition.operator.as_str(), found) {
		("eq", found) => found == Some(expected),
		("neq", found) => found != Some(expected),
		("gt", Some(found)) => compare(found, expected) == Some(Ordering::Greater),
		("gte", Some(found)) => matches!(compare(found, expected), Some(Ordering::Greater | Ordering::Equal)),
		("lt", Some(found)) => compare(found, expected) == Some(Ordering::Less),
		("lte", Some(found)) => matches!(compare(found, expected), Some(Ordering::Less | Ordering::Equal)),
		("contains", Some(Value::String(text))) => text.contains(&as_text(expected)),
		("contains", Some(Value::Array(items))) => items.contains(expected),
		("startsWith", Some(Value::String(text))) => text.starts_with(&as_text(expected)),
		("endsWith", Some(Value::String(text))) => text.ends_with(&as_text(expected)),
		("type", found) => found.map(type_name).unwrap_or("undefined") == as_text(expected),
		("gt" | "gte" | "lt" | "lte" | "contains" | "startsWith" | "endsWith", _) => false,
		(other, _) => return Err(FsError::invalid(format!("unknown operator: {}", other)).into()),
	};
	Ok(holds)
}

pub fn filter(doc: &Value, array_path: Option<&str>, conditions: &[Condition], match_any: bool) -> Result<Vec<Value>> {
	let items = target_array(doc, array_path)?;
	let mut kept = Vec::new();
	for item in items {
		let mut results = Vec::with_capacity(conditions.len());
		for condition in conditions {
			results.push(condition_holds(item, condition)?);
		}
		let keep = if match_any {
			results.iter().any(|held| *held)
		}
		else {
			results.iter().all(|held| *held)
		};
		if keep {
			kept.push(item.clone());
		}
	}
	Ok(kept)
}

pub fn sample(doc: &Value, array_path: &str, count: usize, random: bool) -> Result<Vec<Value>> {
	let items = target_array(doc, Some(array_path))?;
	if random {
		let mut rng = rand::thread_rng();
		return Ok(items.choose_multiple(&mut rng, count.min(items.len())).cloned().collect());
	}
	Ok(items.iter().take(count).cloned().collect())
}

#[derive(Clone, Debug, Deserialize)]
pub struct TransformOp {
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(default)]
	pub field: Option<String>,
	#[serde(default)]
	pub order: Option<String>,
	#[serde(default)]
	pub fields: Option<Vec<String>>,
}

pub fn transform(doc: Value, operations: &[TransformOp]) -> Result<Value> {
	operations.iter().try_fold(doc, apply_transform)
}

impl TransformOp {
	fn field(&self) -> Result<&str> {
		self.field
			.as_deref()
			.ok_or_else(|| FsError::invalid(format!("field is required for {} operation", self.kind)).into())
	}

	fn fields(&self) -> Result<&Vec<String>> {
		self.fields
			.as_ref()
			.filter(|fields| !fields.is_empty())
			.ok_or_else(|| FsError::invalid(format!("fields array is required for {} operation", self.kind)).into())
	}

	fn array(&self, doc: Value) -> Result<Vec<Value>> {
		match doc {
			Value::Array(items) => Ok(items),
			_ => Err(FsError::invalid(format!("data must be an array for {} operation", self.kind)).into()),
		}
	}
}

fn apply_transform(doc: Value, op: &TransformOp) -> Result<Value> {
	match op.kind.as_str() {
		"map" => {
			let field = op.field()?;
			let items = op.array(doc)?;
			Ok(Value::Array(
				items.iter()
					.map(|item| lookup(item, field).cloned().unwrap_or(Value::Null))
					.collect()
			))
		}
		"groupBy" => {
			let field = op.field()?;
			let items = op.array(doc)?;
			let mut groups: Map<String, Value> = Map::new();
			for item in items {
				let key = lookup(&item, field)
					.map(as_text)
					.unwrap_or_else(|| "undefined".to_string());
				match groups.entry(key).or_insert_with(|| Value::Array(Vec::new())) {
					Value::Array(members) => members.push(item),
					_ => {}
				}
			}
			Ok(Value::Object(groups))
		}
		"sort" => {
			let field = op.field()?;
			let mut items = op.array(doc)?;
			let descending = op.order.as_deref() == Some("desc");
			items.sort_by(
				|a, b| {
					let ordering = match (lookup(a, field), lookup(b, field)) {
						(Some(a), Some(b)) => compare(a, b).unwrap_or(Ordering::Equal),
						(Some(_), None) => Ordering::Less,
						(None, Some(_)) => Ordering::Greater,
						(None, None) => Ordering::Equal,
					};
					if descending {
						ordering.reverse()
					}
					else {
						ordering
					}
				});
			Ok(Value::Array(items))
		}
		"flatten" => {
			let items = op.array(doc)?;
			let mut flat = Vec::new();
			flatten_into(items, &mut flat);
			Ok(Value::Array(flat))
		}
		"pick" | "omit" => {
			let fields = op.fields()?;
			let keep = op.kind == "pick";
			let project = |item: Value| match item {
				Value::Object(map) => Value::Object(
					map.into_iter()
						.filter(|(key, _)| fields.contains(key) == keep)
						.collect()
				),
				other => other,
			};
			Ok(match doc {
				Value::Array(items) => Value::Array(items.into_iter().map(project).collect()),
				other => project(other),
			})
		}
		other => Err(FsError::invalid(format!("unknown transform operation: {}", other)).into()),
	}
}

fn flatten_into(items: Vec<Value>, out: &mut Vec<Value>) {
	for item in items {
		match item {
			Value::Array(nested) => flatten_into(nested, out),
			other => out.push(other),
		}
	}
}

pub fn validate(doc: &Value, schema: &Value) -> Result<Value> {
	let validator = jsonschema::validator_for(schema).map_err(|err| FsError::invalid(format!("invalid schema: {}", err)))?;
	let errors: Vec<Value> = validator
		.iter_errors(doc)
		.map(
			|err| {
				json!({
					"path": err.instance_path.to_string(),
					"schemaPath": err.schema_path.to_string(),
					"message": err.to_string(),
				})
			})
		.collect();
	Ok(json!({
		"isValid": errors.is_empty(),
		"errors": errors,
	}))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchType {
	Exact,
	Contains,
	StartsWith,
	EndsWith,
}

impl MatchType {
	pub fn parse(text: Option<&str>) -> Result<Self> {
		match text.unwrap_or("exact") {
			"exact" => Ok(MatchType::Exact),
			"contains" => Ok(MatchType::Contains),
			"startsWith" => Ok(MatchType::StartsWith),
			"endsWith" => Ok(MatchType::EndsWith),
			other => Err(FsError::invalid(format!("unknown matchType: {}", other)).into()),
		}
	}
}

#[derive(Debug, serde::Serialize)]
pub struct KvMatches {
	pub file: PathBuf,
	pub matches: Vec<String>,
}

/// Key/value search over `*.json` files; unreadable or invalid files are skipped.
pub struct KvSearch {
	key: String,
	value: Option<Value>,
	match_type: MatchType,
	max_bytes: usize,
}

impl KvSearch {
	pub fn new(key: &str, value: Option<Value>, match_type: MatchType, max_bytes: usize) -> Self {
		Self {
			key: key.to_string(),
			value,
			match_type,
			max_bytes
		}
	}

	fn value_matches(&self, found: &Value) -> bool {
		let Some(expected) = &self.value else {
			return true;
		};
		match (found, expected) {
			(Value::String(found), Value::String(expected)) => match self.match_type {
				MatchType::Exact => found == expected,
				MatchType::Contains => found.contains(expected.as_str()),
				MatchType::StartsWith => found.starts_with(expected.as_str()),
				MatchType::EndsWith => found.ends_with(expected.as_str()),
			},
			_ => found == expected,
		}
	}

	pub fn search(&self, doc: &Value) -> Vec<String> {
		let mut found = Vec::new();
		let mut trail = Vec::new();
		self.search_node(doc, &mut trail, &mut found);
		found
	}

	fn search_node(&self, node: &Value, trail: &mut Vec<String>, found: &mut Vec<String>) {
		match node {
			Value::Object(map) => {
				for (key, value) in map {
					trail.push(key.clone());
					if *key == self.key && self.value_matches(value) {
						found.push(trail.join("."));
					}
					self.search_node(value, trail, found);
					trail.pop();
				}
			}
			Value::Array(items) => {
				for (index, item) in items.iter().enumerate() {
					trail.push(index.to_string());
					self.search_node(item, trail, found);
					trail.pop();
				}
			}
			_ => {}
		}
	}
}

impl Visitor for KvSearch {
	type Item = KvMatches;

	fn visit(&mut self, entry: &Entry, out: &mut Vec<KvMatches>) {
		if entry.kind != EntryKind::File || !entry.name.ends_with(".json") {
			return;
		}
		let doc = match read_document(&entry.resolved, &entry.relative, self.max_bytes) {
			Ok(doc) => doc,
			Err(err) => {
				debug!(path = %entry.path.display(), error = %err, "skipping json file");
				return;
			}
		};
		let matches = self.search(&doc);
		if !matches.is_empty() {
			out.push(KvMatches {
				file: entry.path.clone(),
				matches
			});
		}
	}
}
