use crate::edit::{apply_edits, fence_diff, EditOperation};
use crate::error::{format_io_error, FsError};
use crate::sandbox::Sandbox;
use anyhow::Result;
use filetime::{set_file_times, FileTime};
use serde_json::{json, Value};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub const DEFAULT_MAX_BYTES: usize = 10 * 1024;

pub async fn read_file(path: &Path, label: &str, max_bytes: usize) -> Result<Value> {
	let meta = fs::metadata(path).await.map_err(|err| format_io_error("read", label, err))?;
	if meta.is_dir() {
		return Err(FsError::invalid(format!("{} is a directory", label)).into());
	}
	let file = fs::File::open(path).await.map_err(|err| format_io_error("read", label, err))?;
	let mut bytes = Vec::new();
	file.take(max_bytes as u64)
		.read_to_end(&mut bytes)
		.await
		.map_err(|err| format_io_error("read", label, err))?;
	let content = decode_prefix(bytes).map_err(|err| format_io_error("read", label, err))?;
	let size = meta.len();
	Ok(json!({
		"path": label,
		"content": content,
		"size": size,
		"truncated": (content.len() as u64) < size,
	}))
}

/// Decodes a possibly truncated UTF-8 prefix, dropping a trailing partial character.
fn decode_prefix(bytes: Vec<u8>) -> std::io::Result<String> {
	match String::from_utf8(bytes) {
		Ok(text) => Ok(text),
		Err(err) => {
			let utf8 = err.utf8_error();
			if utf8.error_len().is_some() {
				return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid UTF-8"));
			}
			let valid = utf8.valid_up_to();
			let bytes = err.into_bytes();
			Ok(String::from_utf8_lossy(&bytes[..valid]).into_owned())
		}
	}
}

/// Reads every path concurrently; a failing path yields an inline error entry.
pub async fn read_many(sandbox: Arc<Sandbox>, paths: Vec<String>, max_bytes: usize) -> Vec<Value> {
	let handles: Vec<_> = paths
		.into_iter()
		.map(
			|label| {
				let sandbox = sandbox.clone();
				tokio::spawn(
					async move {
						let requested = label.clone();
						let validated = tokio::task::spawn_blocking(move || sandbox.validate(&requested)).await;
						let outcome = match validated {
							Ok(Ok(path)) => read_file(&path, &label, max_bytes).await,
							Ok(Err(err)) => Err(err),
							Err(err) => Err(err.into()),
						};
						match outcome {
							Ok(value) => value,
							Err(err) => json!({
								"path": label,
								"error": err.to_string(),
								"code": crate::error::error_code(&err),
							}),
						}
					})
			})
		.collect();
	let mut results = Vec::with_capacity(handles.len());
	for handle in handles {
		match handle.await {
			Ok(value) => results.push(value),
			Err(err) => results.push(json!({
				"error": format!("read task failed: {}", err),
				"code": "EXECUTION_ERROR",
			})),
		}
	}
	results
}

pub async fn list_directory(path: &Path, label: &str) -> Result<Vec<Value>> {
	let mut entries = fs::read_dir(path).await.map_err(|err| format_io_error("list", label, err))?;
	let mut listed = Vec::new();
	while let Some(entry) = entries.next_entry().await? {
		let name = entry.file_name().to_string_lossy().to_string();
		let file_type = entry.file_type().await?;
		let is_dir = if file_type.is_symlink() {
			fs::metadata(entry.path())
				.await
				.map(|meta| meta.is_dir())
				.unwrap_or(false)
		}
		else {
			file_type.is_dir()
		};
		listed.push((name, is_dir));
	}
	listed.sort_by(|a, b| a.0.cmp(&b.0));
	Ok(listed
		.into_iter()
		.map(
			|(name, is_dir)| {
				json!({
					"name": name,
					"type": if is_dir { "directory" } else { "file" },
				})
			})
		.collect())
}

// `link` is the requested path before symlink resolution; `path` is what it resolved to.
pub async fn file_info(path: &Path, link: &Path, label: &str) -> Result<Value> {
	let meta = fs::metadata(path).await.map_err(|err| format_io_error("stat", label, err))?;
	let is_symlink = fs::symlink_metadata(link)
		.await
		.map(|meta| meta.file_type().is_symlink())
		.unwrap_or(false);
	Ok(json!({
		"path": label,
		"size": meta.len(),
		"created": epoch_millis(meta.created()),
		"modified": epoch_millis(meta.modified()),
		"accessed": epoch_millis(meta.accessed()),
		"isDirectory": meta.is_dir(),
		"isFile": meta.is_file(),
		"isSymlink": is_symlink,
		"permissions": permission_bits(&meta),
	}))
}

fn epoch_millis(time: std::io::Result<SystemTime>) -> Option<u64> {
	time.ok()
		.and_then(|time| time.duration_since(SystemTime::UNIX_EPOCH).ok())
		.map(|elapsed| elapsed.as_millis() as u64)
}

#[cfg(unix)]
fn permission_bits(meta: &std::fs::Metadata) -> String {
	use std::os::unix::fs::PermissionsExt;
	format!("{:o}", meta.permissions().mode() & 0o777)
}

#[cfg(not(unix))]
fn permission_bits(meta: &std::fs::Metadata) -> String {
	if meta.permissions().readonly() {
		"readonly".to_string()
	}
	else {
		"readwrite".to_string()
	}
}

pub async fn create_file(path: &Path, label: &str, content: &str) -> Result<()> {
	let mut file = fs::OpenOptions::new()
		.write(true)
		.create_new(true)
		.open(path)
		.await
		.map_err(|err| format_io_error("create", label, err))?;
	file.write_all(content.as_bytes()).await?;
	file.flush().await?;
	Ok(())
}

pub async fn modify_file(path: &Path, label: &str, content: &str) -> Result<()> {
	let meta = fs::metadata(path).await.map_err(|err| format_io_error("modify", label, err))?;
	if !meta.is_file() {
		return Err(FsError::invalid(format!("{} is not a file", label)).into());
	}
	fs::write(path, content).await.map_err(|err| format_io_error("modify", label, err))?;
	Ok(())
}

pub async fn edit_file(
	path: &Path,
	label: &str,
	edits: &[EditOperation],
	dry_run: bool,
	max_bytes: usize) -> Result<Value> {
	let meta = fs::metadata(path).await.map_err(|err| format_io_error("edit", label, err))?;
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
	let content = fs::read_to_string(path).await.map_err(|err| format_io_error("edit", label, err))?;
	let outcome = apply_edits(&content, edits, label)?;
	let changed = outcome.original != outcome.updated;
	if !dry_run {
		fs::write(path, &outcome.updated).await.map_err(|err| format_io_error("edit", label, err))?;
	}
	Ok(json!({
		"path": label,
		"dryRun": dry_run,
		"applied": !dry_run,
		"changed": changed,
		"diff": fence_diff(&outcome.diff),
	}))
}

// Creates missing parent directories, then replaces the file wholesale.
pub async fn write_output(path: &Path, label: &str, content: &str) -> Result<()> {
	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent).await.map_err(|err| format_io_error("create directory for", label, err))?;
	}
	fs::write(path, content).await.map_err(|err| format_io_error("write", label, err))?;
	Ok(())
}

pub async fn create_directory(path: &Path, label: &str) -> Result<()> {
	if let Ok(meta) = fs::metadata(path).await {
		if !meta.is_dir() {
			return Err(FsError::AlreadyExists(label.to_string()).into());
		}
		return Ok(());
	}
	fs::create_dir_all(path).await.map_err(|err| format_io_error("create directory", label, err))?;
	Ok(())
}

pub async fn move_path(from: &Path, to: &Path, to_label: &str) -> Result<()> {
	if fs::symlink_metadata(to).await.is_ok() {
		return Err(FsError::AlreadyExists(to_label.to_string()).into());
	}
	match fs::rename(from, to).await {
		Ok(_) => return Ok(()),
		Err(err) => {
			if !is_cross_device(&err) {
				return Err(err.into());
			}
		}
	}
	let meta = fs::symlink_metadata(from).await?;
	if meta.is_dir() {
		copy_dir_recursive(from.to_path_buf(), to.to_path_buf()).await?;
		fs::remove_dir_all(from).await?;
	}
	else if meta.file_type().is_symlink() {
		copy_symlink(from, to).await?;
		fs::remove_file(from).await?;
	}
	else {
		copy_file_with_meta(from, to).await?;
		fs::remove_file(from).await?;
	}
	Ok(())
}

/// `new_name` must be one plain path component.
pub fn renamed_target(path: &Path, new_name: &str) -> Result<PathBuf> {
	let invalid = new_name.is_empty()
		|| new_name == "."
		|| new_name == ".."
		|| new_name.contains('/')
		|| new_name.contains('\\');
	if invalid {
		return Err(FsError::invalid(format!("newName must be a single file name: {}", new_name)).into());
	}
	let parent = path.parent().ok_or_else(|| FsError::invalid("cannot rename a filesystem root"))?;
	Ok(parent.join(new_name))
}

pub async fn delete_file(path: &Path, label: &str) -> Result<()> {
	let meta = fs::symlink_metadata(path).await.map_err(|err| format_io_error("delete", label, err))?;
	if meta.is_dir() {
		return Err(FsError::invalid(format!("{} is a directory; use delete_directory", label)).into());
	}
	fs::remove_file(path).await.map_err(|err| format_io_error("delete", label, err))?;
	Ok(())
}

pub async fn delete_directory(sandbox: &Sandbox, path: &Path, label: &str, recursive: bool) -> Result<()> {
	if sandbox.is_root(path) {
		return Err(FsError::access_denied(format!("refusing to delete allowed directory: {}", label)).into());
	}
	let meta = fs::metadata(path).await.map_err(|err| format_io_error("delete", label, err))?;
	if !meta.is_dir() {
		return Err(FsError::invalid(format!("{} is not a directory; use delete_file", label)).into());
	}
	let outcome = if recursive {
		fs::remove_dir_all(path).await
	}
	else {
		fs::remove_dir(path).await
	};
	outcome.map_err(|err| format_io_error("delete", label, err))?;
	Ok(())
}

async fn copy_file_with_meta(from: &Path, to: &Path) -> Result<()> {
	if let Some(parent) = to.parent() {
		fs::create_dir_all(parent).await?;
	}
	fs::copy(from, to).await?;
	let meta = fs::metadata(from).await?;
	fs::set_permissions(to, meta.permissions()).await?;
	let atime = FileTime::from_last_access_time(&meta);
	let mtime = FileTime::from_last_modification_time(&meta);
	set_file_times(to, atime, mtime)?;
	Ok(())
}

fn copy_dir_recursive(from: PathBuf, to: PathBuf) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
	Box::pin(
		async move {
			fs::create_dir_all(&to).await?;
			let mut entries = fs::read_dir(&from).await?;
			while let Some(entry) = entries.next_entry().await? {
				let src = entry.path();
				let dst = to.join(entry.file_name());
				// never follow links here: a link to outside the roots would be copied in as data
				let file_type = fs::symlink_metadata(&src).await?.file_type();
				if file_type.is_symlink() {
					copy_symlink(&src, &dst).await?;
				}
				else if file_type.is_dir() {
					copy_dir_recursive(src, dst).await?;
				}
				else {
					copy_file_with_meta(&src, &dst).await?;
				}
			}
			let meta = fs::metadata(&from).await?;
			fs::set_permissions(&to, meta.permissions()).await?;
			let atime = FileTime::from_last_access_time(&meta);
			let mtime = FileTime::from_last_modification_time(&meta);
			set_file_times(&to, atime, mtime)?;
			Ok(())
		}
	)
}

#[cfg(unix)]
async fn copy_symlink(from: &Path, to: &Path) -> Result<()> {
	let target = fs::read_link(from).await?;
	fs::symlink(target, to).await?;
	Ok(())
}

#[cfg(not(unix))]
async fn copy_symlink(from: &Path, _to: &Path) -> Result<()> {
	Err(FsError::invalid(format!("cannot move symlink across devices: {}", from.display())).into())
}

fn is_cross_device(err: &std::io::Error) -> bool {
	err.raw_os_error() == Some(libc::EXDEV)
}
