use crate::permissions::{PermissionFlags, Permissions};
use crate::sandbox::Sandbox;
use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;

const USAGE: &str = "usage: secure-fs-mcp [options] <allowed-directory>...

options:
  --readonly                 deny every mutating operation
  --full-access              allow every mutating operation (ignored with --readonly)
  --allow-create             allow creating files and directories
  --allow-edit               allow modifying and editing files
  --allow-move               allow moving files and directories
  --allow-rename             allow renaming files and directories
  --allow-delete             allow deleting files and directories
  --no-follow-symlinks       return symlink paths instead of their targets
  --cwd                      add the working directory as an allowed directory
  --config <path>            JSON config file
  --otel-enabled <bool>      export traces over OTLP
  --otel-endpoint <url>      OTLP endpoint (default http://127.0.0.1:4317)
  --otel-service-name <name> service name reported with traces";

#[derive(Clone, Debug)]
pub struct Config {
	pub roots: Vec<String>,
	/// No root was configured, so the working directory stands in.
	pub implicit_cwd: bool,
	pub flags: PermissionFlags,
	pub otel_enabled: bool,
	pub otel_endpoint: String,
	pub otel_service_name: String,
	pub session_id: String,
}

#[derive(Debug, Default)]
struct CliArgs {
	roots: Vec<String>,
	read_only: Option<bool>,
	full_access: Option<bool>,
	allow_create: Option<bool>,
	allow_edit: Option<bool>,
	allow_move: Option<bool>,
	allow_delete: Option<bool>,
	allow_rename: Option<bool>,
	follow_symlinks: Option<bool>,
	config_path: Option<String>,
	otel_enabled: Option<bool>,
	otel_endpoint: Option<String>,
	otel_service_name: Option<String>,
	help: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct FileConfig {
	#[serde(default)]
	roots: Vec<String>,
	read_only: Option<bool>,
	full_access: Option<bool>,
	allow_create: Option<bool>,
	allow_edit: Option<bool>,
	allow_move: Option<bool>,
	allow_delete: Option<bool>,
	allow_rename: Option<bool>,
	follow_symlinks: Option<bool>,
}

fn parse_args<I: IntoIterator<Item = String>>(args: I, cwd: &Path) -> Result<CliArgs> {
	let mut cli = CliArgs::default();
	let mut args = args.into_iter();
	while let Some(arg) = args.next() {
		match arg.as_str() {
			"--readonly" => cli.read_only = Some(true),
			"--full-access" => cli.full_access = Some(true),
			"--allow-create" => cli.allow_create = Some(true),
			"--allow-edit" => cli.allow_edit = Some(true),
			"--allow-move" => cli.allow_move = Some(true),
			"--allow-delete" => cli.allow_delete = Some(true),
			"--allow-rename" => cli.allow_rename = Some(true),
			"--no-follow-symlinks" => cli.follow_symlinks = Some(false),
			"--cwd" => cli.roots.push(cwd.to_string_lossy().to_string()),
			"--config" => {
				let value = args.next().ok_or_else(|| anyhow!("--config requires a value"))?;
				cli.config_path = Some(value);
			}
			"--otel-enabled" => {
				let value = args.next().ok_or_else(|| anyhow!("--otel-enabled requires a value"))?;
				cli.otel_enabled = Some(parse_bool(&value, "--otel-enabled")?);
			}
			"--otel-endpoint" => {
				let value = args.next().ok_or_else(|| anyhow!("--otel-endpoint requires a value"))?;
				cli.otel_endpoint = Some(value);
			}
			"--otel-service-name" => {
				let value = args.next().ok_or_else(|| anyhow!("--otel-service-name requires a value"))?;
				cli.otel_service_name = Some(value);
			}
			"--help" | "-h" => cli.help = true,
			_ if arg.starts_with("--") => return Err(anyhow!("unknown argument: {}", arg)),
			_ => {
				if !arg.trim().is_empty() {
					cli.roots.push(arg);
				}
			}
		}
	}
	Ok(cli)
}

fn env_bool(name: &str) -> Result<Option<bool>> {
	match std::env::var(name) {
		Ok(value) if !value.trim().is_empty() => Ok(Some(parse_bool(&value, name)?)),
		_ => Ok(None),
	}
}

fn env_string(name: &str) -> Option<String> {
	std::env::var(name)
		.ok()
		.filter(|value| !value.trim().is_empty())
}

fn load_file_config(path: &str) -> Result<FileConfig> {
	let content = std::fs::read_to_string(path)
		.map_err(|err| anyhow!("failed to read config {}: {}", path, err))?;
	let value: FileConfig = serde_json::from_str(&content)
		.map_err(|err| anyhow!("failed to parse config {}: {}", path, err))?;
	Ok(value)
}

/// Flags > environment > config file > defaults. Roots from every source are concatenated.
pub fn load_config() -> Result<Config> {
	let cwd = std::env::current_dir()?;
	let cli = parse_args(std::env::args().skip(1), &cwd)?;
	if cli.help {
		println!("{}", USAGE);
		std::process::exit(0);
	}
	let config_path = cli.config_path.clone().or_else(|| env_string("MCP_CONFIG"));
	let file = match config_path {
		Some(path) => load_file_config(&path)?,
		None => FileConfig::default(),
	};
	let mut roots = cli.roots.clone();
	if let Some(env_roots) = env_string("MCP_ALLOWED_ROOTS") {
		roots.extend(
			env_roots.split(',')
				.map(str::trim)
				.filter(|value| !value.is_empty())
				.map(str::to_string)
		);
	}
	roots.extend(file.roots.iter().cloned());
	let implicit_cwd = roots.is_empty();
	if implicit_cwd {
		roots.push(cwd.to_string_lossy().to_string());
	}
	let follow_from_env = env_bool("MCP_NO_FOLLOW_SYMLINKS")?.map(|no_follow| !no_follow);
	let flags = PermissionFlags {
		read_only: cli.read_only
			.or(env_bool("MCP_READONLY")?)
			.or(file.read_only)
			.unwrap_or(false),
		full_access: cli.full_access
			.or(env_bool("MCP_FULL_ACCESS")?)
			.or(file.full_access)
			.unwrap_or(false),
		allow_create: cli.allow_create.or(file.allow_create).unwrap_or(false),
		allow_edit: cli.allow_edit.or(file.allow_edit).unwrap_or(false),
		allow_move: cli.allow_move.or(file.allow_move).unwrap_or(false),
		allow_delete: cli.allow_delete.or(file.allow_delete).unwrap_or(false),
		allow_rename: cli.allow_rename.or(file.allow_rename).unwrap_or(false),
		follow_symlinks: cli.follow_symlinks
			.or(follow_from_env)
			.or(file.follow_symlinks)
			.unwrap_or(true),
	};
	Ok(Config {
		roots,
		implicit_cwd,
		flags,
		otel_enabled: cli.otel_enabled
			.or(env_bool("MCP_OTEL_ENABLED")?)
			.unwrap_or(false),
		otel_endpoint: cli.otel_endpoint
			.or_else(|| env_string("MCP_OTEL_ENDPOINT"))
			.unwrap_or_else(|| String::from("http://127.0.0.1:4317")),
		otel_service_name: cli.otel_service_name
			.or_else(|| env_string("MCP_OTEL_SERVICE_NAME"))
			.unwrap_or_else(|| String::from("secure-fs-mcp")),
		session_id: uuid::Uuid::new_v4().to_string(),
	})
}

impl Config {
	pub fn permissions(&self) -> Permissions {
		Permissions::from_flags(&self.flags)
	}

	/// Registers every root; any missing or non-directory root aborts startup.
	pub fn build_sandbox(&self) -> Result<Sandbox> {
		let cwd = std::env::current_dir()?;
		let sandbox = Sandbox::new(self.flags.follow_symlinks);
		for root in &self.roots {
			sandbox.add_root(root, &cwd)?;
		}
		Ok(sandbox)
	}
}

fn parse_bool(value: &str, label: &str) -> Result<bool> {
	let value = value.trim().to_lowercase();
	match value.as_str() {
		"1" | "true" | "yes" | "on" => Ok(true),
		"0" | "false" | "no" | "off" => Ok(false),
		_ => Err(anyhow!("{} must be a boolean", label)),
	}
}
