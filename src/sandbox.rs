use crate::error::{format_io_error, FsError};
use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

static ENV_REFERENCE: Lazy<Regex> = Lazy::new(|| {
	Regex::new(r"\$\{([^}]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)|%([A-Za-z_][A-Za-z0-9_]*)%").expect("env reference regex")
});

// Both collections only grow: roots at startup, symlink mappings during validation.
pub struct Sandbox {
	roots: RwLock<Vec<PathBuf>>,
	symlinks: Mutex<HashMap<PathBuf, PathBuf>>,
	follow_symlinks: bool,
}

enum Existence {
	Exists(PathBuf),
	Missing,
	Failed(std::io::Error),
}

fn existence(path: &Path) -> Existence {
	match std::fs::canonicalize(path) {
		Ok(real) => Existence::Exists(real),
		Err(err) if err.kind() == std::io::ErrorKind::NotFound => Existence::Missing,
		Err(err) => Existence::Failed(err),
	}
}

impl Sandbox {
	pub fn new(follow_symlinks: bool) -> Self {
		Self {
			roots: RwLock::new(Vec::new()),
			symlinks: Mutex::new(HashMap::new()),
			follow_symlinks
		}
	}

	pub fn follow_symlinks(&self) -> bool {
		self.follow_symlinks
	}

	pub fn add_root(&self, raw: &str, cwd: &Path) -> Result<PathBuf> {
		let expanded = expand_path(raw, cwd)?;
		let candidate = PathBuf::from(expanded);
		let absolute = if candidate.is_absolute() {
			candidate
		}
		else {
			cwd.join(candidate)
		};
		let normalized = normalize_path(&absolute);
		let meta = std::fs::metadata(&normalized).map_err(|err| anyhow!("cannot access root {}: {}", raw, err))?;
		if !meta.is_dir() {
			return Err(anyhow!("root {} is not a directory", raw));
		}
		self.push_root(normalized.clone());
		let real = std::fs::canonicalize(&normalized)?;
		if real != normalized {
			info!(root = %normalized.display(), real = %real.display(), "root is a symlink; allowing its target");
			self.record_symlink(real.clone(), normalized.clone());
			self.push_root(real);
		}
		Ok(normalized)
	}

	fn push_root(&self, root: PathBuf) {
		let mut roots = self.roots.write().expect("roots lock");
		if !roots.contains(&root) {
			roots.push(root);
		}
	}

	pub fn roots(&self) -> Vec<PathBuf> {
		self.roots
			.read()
			.expect("roots lock")
			.clone()
	}

	pub fn is_root(&self, path: &Path) -> bool {
		self.roots
			.read()
			.expect("roots lock")
			.iter()
			.any(|root| root == path)
	}

	pub fn is_within_roots(&self, path: &Path) -> bool {
		self.roots
			.read()
			.expect("roots lock")
			.iter()
			.any(|root| path.starts_with(root))
	}

	fn record_symlink(&self, real: PathBuf, link: PathBuf) {
		let mut table = self.symlinks.lock().expect("symlink table lock");
		if !table.contains_key(&real) {
			debug!(real = %real.display(), link = %link.display(), "recorded symlink");
			table.insert(real, link);
		}
	}

	// longest recorded prefix wins
	fn rewrite_through_symlink(&self, path: &Path) -> Option<PathBuf> {
		let table = self.symlinks.lock().expect("symlink table lock");
		table.iter()
			.filter(|(real, _)| path.starts_with(real))
			.max_by_key(|(real, _)| real.components().count())
			.and_then(
				|(real, link)| {
					path.strip_prefix(real)
						.ok()
						.map(|rest| link.join(rest))
				})
	}

	pub fn validate(&self, requested: &str) -> Result<PathBuf> {
		self.validate_with(requested, true)
	}

	pub fn validate_with(&self, requested: &str, check_parent_exists: bool) -> Result<PathBuf> {
		let absolute = self.lexical(requested)?;
		self.check(requested, absolute, check_parent_exists, true)
	}

	// Expanded and normalized, symlinks untouched. Not a containment check.
	pub fn lexical(&self, requested: &str) -> Result<PathBuf> {
		if requested.trim().is_empty() {
			return Err(FsError::invalid("path is required").into());
		}
		let cwd = std::env::current_dir()?;
		let expanded = expand_path(requested, &cwd)?;
		let candidate = PathBuf::from(expanded);
		let absolute = if candidate.is_absolute() {
			candidate
		}
		else {
			self.first_root()?.join(candidate)
		};
		Ok(normalize_path(&absolute))
	}

	pub fn validate_absolute(&self, path: &Path) -> Result<PathBuf> {
		let label = path.display().to_string();
		self.check(&label, normalize_path(path), true, true)
	}

	fn first_root(&self) -> Result<PathBuf> {
		self.roots
			.read()
			.expect("roots lock")
			.first()
			.cloned()
			.ok_or_else(|| anyhow!("no allowed directories configured"))
	}

	fn check(
		&self,
		label: &str,
		requested: PathBuf,
		check_parent_exists: bool,
		allow_rewrite: bool) -> Result<PathBuf> {
		if !self.is_within_roots(&requested) {
			if allow_rewrite {
				if let Some(rewritten) = self.rewrite_through_symlink(&requested) {
					debug!(from = %requested.display(), to = %rewritten.display(), "rewrote real path through symlink");
					return self.check(label, rewritten, check_parent_exists, false);
				}
			}
			return Err(FsError::access_denied(format!("path outside allowed directories: {}", label)).into());
		}
		match existence(&requested) {
			Existence::Exists(real) => self.check_resolved(label, requested, real),
			Existence::Missing => self.check_missing(label, requested, check_parent_exists),
			Existence::Failed(err) => Err(format_io_error("resolve", label, err)),
		}
	}

	fn check_resolved(&self, label: &str, requested: PathBuf, real: PathBuf) -> Result<PathBuf> {
		if real == requested {
			return Ok(real);
		}
		if !self.is_within_roots(&real) {
			warn!(path = label, "symlink target escapes allowed directories");
			return Err(FsError::access_denied(format!("symlink target outside allowed directories: {}", label)).into());
		}
		self.record_symlink(real.clone(), requested.clone());
		if !self.follow_symlinks {
			return Ok(requested);
		}
		Ok(real)
	}

	fn check_missing(&self, label: &str, requested: PathBuf, check_parent_exists: bool) -> Result<PathBuf> {
		// canonicalize reports a dangling symlink as missing; its target still has to stay inside.
		if let Ok(meta) = std::fs::symlink_metadata(&requested) {
			if meta.file_type().is_symlink() {
				let target = std::fs::read_link(&requested).map_err(|err| format_io_error("resolve", label, err))?;
				let base = requested.parent().unwrap_or(Path::new("/"));
				let resolved = normalize_path(&base.join(target));
				if !self.is_within_roots(&resolved) {
					return Err(FsError::access_denied(format!("symlink target outside allowed directories: {}", label)).into());
				}
			}
		}
		let Some(parent) = requested.parent() else {
			return Ok(requested);
		};
		if check_parent_exists {
			match existence(parent) {
				Existence::Exists(real_parent) => {
					if !self.is_within_roots(&real_parent) {
						return Err(FsError::access_denied(format!("parent directory outside allowed directories: {}", label)).into());
					}
					if !real_parent.is_dir() {
						return Err(FsError::invalid(format!("parent of {} is not a directory", label)).into());
					}
				}
				Existence::Missing => {
					return Err(FsError::ParentMissing(parent.display().to_string()).into());
				}
				Existence::Failed(err) => return Err(format_io_error("resolve", label, err)),
			}
			return Ok(requested);
		}
		let mut ancestor = parent;
		loop {
			match existence(ancestor) {
				Existence::Exists(real) => {
					if !self.is_within_roots(&real) {
						return Err(FsError::access_denied(format!("ancestor directory outside allowed directories: {}", label)).into());
					}
					break;
				}
				Existence::Missing => match ancestor.parent() {
					Some(next) => ancestor = next,
					None => break,
				},
				Existence::Failed(err) => return Err(format_io_error("resolve", label, err)),
			}
		}
		Ok(requested)
	}
}

/// `$CWD`/`$PWD` always name the process cwd.
pub fn expand_path(input: &str, cwd: &Path) -> Result<String, FsError> {
	let homed = if input == "~" || input.starts_with("~/") {
		let home = std::env::var("HOME")
			.or_else(|_| std::env::var("USERPROFILE"))
			.map_err(|_| FsError::UndefinedVariable("HOME".to_string()))?;
		format!("{}{}", home, &input[1..])
	}
	else {
		input.to_string()
	};
	let mut missing: Option<String> = None;
	let expanded = ENV_REFERENCE.replace_all(
		&homed,
		|caps: &Captures| {
			let name = caps.get(1)
				.or_else(|| caps.get(2))
				.or_else(|| caps.get(3))
				.map(|m| m.as_str())
				.unwrap_or("");
			if name == "CWD" || name == "PWD" {
				return cwd.to_string_lossy().to_string();
			}
			match std::env::var(name) {
				Ok(value) if !name.is_empty() => value,
				_ => {
					if missing.is_none() {
						missing = Some(name.to_string());
					}
					String::new()
				}
			}
		}
	);
	if let Some(name) = missing {
		return Err(FsError::UndefinedVariable(name));
	}
	Ok(expanded.into_owned())
}

pub fn normalize_path(path: &Path) -> PathBuf {
	let mut stack: Vec<std::ffi::OsString> = Vec::new();
	let mut prefix: Option<std::ffi::OsString> = None;
	let mut absolute = false;
	for component in path.components() {
		match component {
			Component::Prefix(prefix_component) => {
				prefix = Some(prefix_component.as_os_str().to_os_string());
			}
			Component::RootDir => {
				absolute = true;
				stack.clear();
			}
			Component::CurDir => {}
			Component::ParentDir => {
				if !stack.is_empty() && stack.last().map(|last| last != "..").unwrap_or(false) {
					stack.pop();
				}
				else if !absolute {
					stack.push(std::ffi::OsString::from(".."));
				}
			}
			Component::Normal(part) => stack.push(part.to_os_string()),
		}
	}
	let mut out = PathBuf::new();
	if let Some(prefix) = prefix {
		out.push(prefix);
	}
	if absolute {
		out.push(Path::new("/"));
	}
	for part in stack {
		out.push(part);
	}
	out
}
