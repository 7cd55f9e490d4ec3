use std::fmt;

/// Failure kinds surfaced to the caller with a stable code.
#[derive(Debug)]
pub enum FsError {
	AccessDenied(String),
	PermissionNotGranted {
		action: &'static str,
		flag: &'static str,
	},
	NotFound(String),
	ParentMissing(String),
	NoExactMatch(String),
	SizeExceeded {
		path: String,
		actual: u64,
		limit: u64,
	},
	AlreadyExists(String),
	NotEmpty(String),
	UndefinedVariable(String),
	InvalidArgument(String),
}

impl FsError {
	pub fn access_denied(message: impl Into<String>) -> Self {
		FsError::AccessDenied(message.into())
	}

	pub fn invalid(message: impl Into<String>) -> Self {
		FsError::InvalidArgument(message.into())
	}

	pub fn code(&self) -> &'static str {
		match self {
			FsError::AccessDenied(_) => "ACCESS_DENIED",
			FsError::PermissionNotGranted { .. } => "PERMISSION_NOT_GRANTED",
			FsError::NotFound(_) => "NOT_FOUND",
			FsError::ParentMissing(_) => "PARENT_MISSING",
			FsError::NoExactMatch(_) => "NO_EXACT_MATCH",
			FsError::SizeExceeded { .. } => "SIZE_EXCEEDED",
			FsError::AlreadyExists(_) => "ALREADY_EXISTS",
			FsError::NotEmpty(_) => "NOT_EMPTY",
			FsError::UndefinedVariable(_) => "UNDEFINED_VARIABLE",
			FsError::InvalidArgument(_) => "INVALID_ARGUMENT",
		}
	}
}

impl fmt::Display for FsError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			FsError::AccessDenied(message) => write!(f, "access denied - {}", message),
			FsError::PermissionNotGranted { action, flag } => write!(
				f,
				"cannot {}: {} permission not granted (requires --allow-{})",
				action, flag, flag
			),
			FsError::NotFound(what) => write!(f, "not found: {}", what),
			FsError::ParentMissing(parent) => write!(f, "parent directory does not exist: {}", parent),
			FsError::NoExactMatch(old_text) => write!(f, "could not find exact match for edit:\n{}", old_text),
			FsError::SizeExceeded { path, actual, limit } => write!(
				f,
				"file size of {} ({} bytes) exceeds the maximum allowed size ({} bytes)",
				path, actual, limit
			),
			FsError::AlreadyExists(path) => write!(f, "already exists: {}", path),
			FsError::NotEmpty(path) => write!(
				f,
				"directory is not empty: {}. Use recursive=true to delete with contents",
				path
			),
			FsError::UndefinedVariable(name) => write!(f, "environment variable not defined: {}", name),
			FsError::InvalidArgument(message) => write!(f, "{}", message),
		}
	}
}

impl std::error::Error for FsError {}

/// Code for any error reaching the dispatch boundary.
pub fn error_code(err: &anyhow::Error) -> &'static str {
	if let Some(fs_err) = err.downcast_ref::<FsError>() {
		return fs_err.code();
	}
	if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
		return match io_err.kind() {
			std::io::ErrorKind::NotFound => "FILE_NOT_FOUND",
			std::io::ErrorKind::PermissionDenied => "PERMISSION_DENIED",
			_ => "IO_ERROR",
		};
	}
	"EXECUTION_ERROR"
}

/// Rewrites a raw io error so the message names the caller's path, not ours.
pub fn format_io_error(action: &str, path: &str, err: std::io::Error) -> anyhow::Error {
	match err.kind() {
		std::io::ErrorKind::NotFound => FsError::NotFound(path.to_string()).into(),
		std::io::ErrorKind::AlreadyExists => FsError::AlreadyExists(path.to_string()).into(),
		std::io::ErrorKind::DirectoryNotEmpty => FsError::NotEmpty(path.to_string()).into(),
		std::io::ErrorKind::PermissionDenied => {
			let message = format!("{} {}: permission denied", action, path);
			anyhow::Error::new(err).context(message)
		}
		std::io::ErrorKind::InvalidData => {
			let message = format!("{} {}: not valid UTF-8 text", action, path);
			anyhow::Error::new(err).context(message)
		}
		_ => {
			let message = format!("{} {}: {}", action, path, err);
			anyhow::Error::new(err).context(message)
		}
	}
}
