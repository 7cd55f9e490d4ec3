use crate::config::Config;
use crate::edit::EditOperation;
use crate::error::{error_code, FsError};
use crate::fs;
use crate::json;
use crate::permissions::{self, Operation, Permissions};
use crate::protocol::{Request, Response};
use crate::sandbox::Sandbox;
use crate::walk::{self, TraversalBudget};
use crate::xml;
use anyhow::Result;
use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace as sdktrace;
use opentelemetry_semantic_conventions::resource as semconv;
use regex::Regex;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, info_span, warn, Instrument, Span};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug)]
struct ProtocolError {
	code: i64,
	message: String,
}

impl ProtocolError {
	fn new(code: i64, message: impl Into<String>) -> Self {
		Self {
			code,
			message: message.into()
		}
	}
}

impl std::fmt::Display for ProtocolError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.message)
	}
}

impl std::error::Error for ProtocolError {}

pub fn init_tracing(config: &Config) {
	let _ = global::set_error_handler(|_| {});
	let resource = Resource::new(
		vec![
		opentelemetry::KeyValue::new(semconv::SERVICE_NAME, config.otel_service_name.clone()),
		opentelemetry::KeyValue::new(semconv::SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
		opentelemetry::KeyValue::new("mcp.session_id", config.session_id.clone()),
		]
	);
	let tracing_layer = if config.otel_enabled {
		let exporter = opentelemetry_otlp::new_exporter().tonic().with_endpoint(config.otel_endpoint.clone());
		let provider = opentelemetry_otlp::new_pipeline()
			.tracing()
			.with_exporter(exporter)
			.with_trace_config(sdktrace::Config::default().with_resource(resource))
			.install_batch(opentelemetry_sdk::runtime::Tokio)
			.ok();
		if let Some(provider) = provider {
			let tracer = provider.tracer(config.otel_service_name.clone());
			global::set_tracer_provider(provider);
			Some(OpenTelemetryLayer::new(tracer))
		}
		else {
			None
		}
	}
	else {
		None
	};
	// stdout carries the protocol.
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let fmt_layer = tracing_subscriber::fmt::layer()
		.with_target(false)
		.with_writer(std::io::stderr);
	let subscriber = tracing_subscriber::registry().with(filter).with(fmt_layer);
	if let Some(layer) = tracing_layer {
		subscriber.with(layer).init();
	}
	else {
		subscriber.init();
	}
}

pub struct Server {
	sandbox: Arc<Sandbox>,
	permissions: Permissions,
	session_id: String,
}

impl Server {
	pub fn new(config: &Config) -> Result<Self> {
		Ok(Self {
			sandbox: Arc::new(config.build_sandbox()?),
			permissions: config.permissions(),
			session_id: config.session_id.clone()
		})
	}

	fn log_startup(&self, config: &Config) {
		if config.implicit_cwd {
			warn!("no allowed directory given; using the working directory");
		}
		for root in self.sandbox.roots() {
			info!(root = %root.display(), "allowed directory");
		}
		if self.permissions.read_only {
			info!("running in read-only mode");
		}
		else if self.permissions.full_access {
			info!("running with full access");
		}
		else {
			let granted = self.permissions.granted();
			if granted.is_empty() {
				info!("no mutating operations granted");
			}
			else {
				info!(granted = %granted.join(", "), "mutating operations granted");
			}
		}
		if !self.sandbox.follow_symlinks() {
			info!("symlink following disabled");
		}
	}
}

pub async fn run(config: Config) -> Result<()> {
	let server = Arc::new(Server::new(&config)?);
	server.log_startup(&config);
	let (tx, mut rx) = mpsc::unbounded_channel::<Response>();
	let writer_task = tokio::spawn(
		async move {
			let mut writer = io::BufWriter::new(io::stdout());
			while let Some(resp) = rx.recv().await {
				write_response(&mut writer, resp).await?;
			}
			Ok::<(), anyhow::Error>(())
		}
	);
	let mut reader = BufReader::new(io::stdin()).lines();
	while let Some(line) = reader.next_line().await? {
		if line.trim().is_empty() {
			continue;
		}
		let req: Request = match serde_json::from_str(&line) {
			Ok(req) => req,
			Err(err) => {
				let _ = tx.send(Response::err(Value::Null, -32700, err.to_string()));
				continue;
			}
		};
		let server = server.clone();
		let tx = tx.clone();
		tokio::spawn(
			async move {
				if let Some(resp) = server.handle_request(req).await {
					let _ = tx.send(resp);
				}
			}
		);
	}
	drop(tx);
	writer_task.await??;
	Ok(())
}

impl Server {
	async fn handle_request(&self, req: Request) -> Option<Response> {
		let method = req.method.clone();
		let tool_name = extract_tool_name(&method, &req.params);
		let span = info_span!(
			"mcp.request",
			"mcp.session_id" = %self.session_id,
			"mcp.method" = %method,
			"mcp.tool_name" = tool_name.as_deref().unwrap_or(""),
			"mcp.is_error" = tracing::field::Empty,
			"mcp.error_code" = tracing::field::Empty,
			"mcp.count" = tracing::field::Empty,
			"mcp.response_bytes" = tracing::field::Empty,
		);
		let outcome = self.route(&req).instrument(span.clone()).await;
		if req.is_notification() {
			return None;
		}
		let id = req.id.unwrap_or(Value::Null);
		match outcome {
			Ok(value) => {
				record_result(&span, &value);
				Some(Response::ok(id, value))
			}
			Err(err) => {
				if let Some(protocol) = err.downcast_ref::<ProtocolError>() {
					Some(Response::err(id, protocol.code, protocol.message.clone()))
				}
				else {
					Some(Response::err(id, -32000, err.to_string()))
				}
			}
		}
	}

	async fn route(&self, req: &Request) -> Result<Value> {
		match req.method.as_str() {
			"initialize" => {
				let version = req.params
					.get("protocolVersion")
					.and_then(Value::as_str)
					.unwrap_or(PROTOCOL_VERSION);
				Ok(json!({
					"protocolVersion": version,
					"serverInfo": {
						"name": "secure-fs-mcp",
						"version": env!("CARGO_PKG_VERSION")
					},
					"capabilities": {
						"tools": { "listChanged": false }
					}
				}))
			}
			"ping" => Ok(json!({})),
			"tools/list" => Ok(json!({
				"tools": self.visible_tools(),
			})),
			"tools/call" => {
				let name = req.params
					.get("name")
					.and_then(Value::as_str)
					.ok_or_else(|| ProtocolError::new(-32602, "name is required"))?;
				if !tool_definitions().iter().any(|def| def["name"] == name) {
					return Err(ProtocolError::new(-32602, format!("unknown tool: {}", name)).into());
				}
				let arguments = req.params
					.get("arguments")
					.cloned()
					.unwrap_or_else(|| json!({}));
				Ok(self.run_tool(name, &arguments).await)
			}
			method if method.starts_with("notifications/") => Ok(Value::Null),
			_ => Err(ProtocolError::new(-32601, "method not found").into()),
		}
	}

	fn visible_tools(&self) -> Vec<Value> {
		tool_definitions()
			.into_iter()
			.filter(
				|def| {
					let name = def["name"].as_str().unwrap_or("");
					match required_operation(name) {
						Some(op) => permissions::is_allowed(op, &self.permissions),
						None => {
							let writes = write_operations(name);
							writes.is_empty() || writes.iter().any(|op| permissions::is_allowed(*op, &self.permissions))
						}
					}
				})
			.collect()
	}

	async fn run_tool(&self, name: &str, args: &Value) -> Value {
		match self.execute_tool(name, args).await {
			Ok(structured) => tool_success(name, structured),
			Err(err) => {
				warn!(tool = name, code = error_code(&err), error = %err, "tool failed");
				tool_error(&err)
			}
		}
	}

	// Filesystem-bound work, path validation included, runs off the async workers inside the request span.
	async fn blocking<T, F>(&self, task: F) -> Result<T>
	where
		F: FnOnce(&Arc<Sandbox>) -> Result<T> + Send + 'static,
		T: Send + 'static, {
		let sandbox = self.sandbox.clone();
		let span = Span::current();
		tokio::task::spawn_blocking(
			move || {
				let _guard = span.enter();
				task(&sandbox)
			})
		.await?
	}

	async fn resolve(&self, path: &str) -> Result<PathBuf> {
		self.resolve_with(path, true).await
	}

	async fn resolve_with(&self, path: &str, check_parent_exists: bool) -> Result<PathBuf> {
		let requested = path.to_string();
		self.blocking(move |sandbox| sandbox.validate_with(&requested, check_parent_exists)).await
	}

	fn gate(&self, op: Operation, action: &'static str) -> Result<()> {
		permissions::require(op, &self.permissions, action)?;
		Ok(())
	}

	async fn execute_tool(&self, name: &str, args: &Value) -> Result<Value> {
		match name {
			"read_file" => {
				let path = required_str(args, "path")?;
				let max_bytes = positive_usize(args, "maxBytes", fs::DEFAULT_MAX_BYTES)?;
				let validated = self.resolve(path).await?;
				fs::read_file(&validated, path, max_bytes).await
			}
			"read_multiple_files" => {
				let paths = required_string_list(args, "paths")?;
				let max_bytes = positive_usize(args, "maxBytesPerFile", fs::DEFAULT_MAX_BYTES)?;
				let files = fs::read_many(self.sandbox.clone(), paths, max_bytes).await;
				let count = files.len();
				Ok(json!({ "files": files, "count": count }))
			}
			"list_directory" => {
				let path = required_str(args, "path")?;
				let validated = self.resolve(path).await?;
				let entries = fs::list_directory(&validated, path).await?;
				let count = entries.len();
				Ok(json!({ "path": path, "entries": entries, "count": count }))
			}
			"directory_tree" => {
				let label = required_str(args, "path")?.to_string();
				let budget = TraversalBudget::new(positive_usize(args, "maxDepth", walk::DEFAULT_MAX_DEPTH)?, usize::MAX)
					.excluding(&optional_string_list(args, "excludePatterns")?)?;
				let root = self.resolve(&label).await?;
				let tree = self.blocking(
					move |sandbox| {
						require_dir(&root, &root.display().to_string())?;
						Ok(walk::tree(sandbox, &root, &budget))
					}).await?;
				Ok(json!({ "path": label, "tree": tree }))
			}
			"search_files" => {
				let label = required_str(args, "path")?.to_string();
				let pattern = required_str(args, "pattern")?.to_string();
				let budget = traversal_budget(args, walk::DEFAULT_MAX_RESULTS)?;
				let root = self.resolve(&label).await?;
				let limit = budget.max_results;
				let mut visitor = walk::NameSearch::new(&pattern);
				let matches = self.blocking(
					move |sandbox| {
						require_dir(&root, &root.display().to_string())?;
						Ok(walk::walk(sandbox, &root, &budget, &mut visitor))
					}).await?;
				Ok(path_matches(&label, matches, limit))
			}
			"find_files_by_extension" => {
				let label = required_str(args, "path")?.to_string();
				let extension = required_str(args, "extension")?.to_string();
				let budget = traversal_budget(args, walk::DEFAULT_MAX_RESULTS)?;
				let root = self.resolve(&label).await?;
				let limit = budget.max_results;
				let mut visitor = walk::ExtensionSearch::new(&extension);
				let matches = self.blocking(
					move |sandbox| {
						require_dir(&root, &root.display().to_string())?;
						Ok(walk::walk(sandbox, &root, &budget, &mut visitor))
					}).await?;
				Ok(path_matches(&label, matches, limit))
			}
			"regex_search_content" => {
				let label = required_str(args, "path")?.to_string();
				let pattern = required_str(args, "regex")?;
				let regex = Regex::new(pattern).map_err(|err| FsError::invalid(format!("invalid regex pattern: {}", err)))?;
				let file_pattern = optional_str(args, "filePattern").unwrap_or("*");
				let max_file_size = positive_usize(args, "maxFileSize", walk::DEFAULT_MAX_FILE_SIZE as usize)? as u64;
				let budget = TraversalBudget::new(
					positive_usize(args, "maxDepth", walk::DEFAULT_MAX_DEPTH)?,
					positive_usize(args, "maxResults", walk::DEFAULT_CONTENT_MAX_RESULTS)?
				);
				let mut visitor = walk::ContentSearch::new(regex, file_pattern, max_file_size)?;
				let root = self.resolve(&label).await?;
				let files = self.blocking(
					move |sandbox| {
						require_dir(&root, &root.display().to_string())?;
						Ok(walk::walk(sandbox, &root, &budget, &mut visitor))
					}).await?;
				let count = files.len();
				Ok(json!({ "path": label, "regex": pattern, "files": files, "count": count }))
			}
			"get_file_info" => {
				let label = required_str(args, "path")?.to_string();
				let requested = label.clone();
				let (link, validated) = self.blocking(move |sandbox| Ok((sandbox.lexical(&requested)?, sandbox.validate(&requested)?))).await?;
				fs::file_info(&validated, &link, &label).await
			}
			"list_allowed_directories" => {
				let roots: Vec<String> = self.sandbox
					.roots()
					.iter()
					.map(|root| root.display().to_string())
					.collect();
				let count = roots.len();
				Ok(json!({ "directories": roots, "count": count }))
			}
			"get_permissions" => {
				let mut value = serde_json::to_value(&self.permissions)?;
				if let Some(obj) = value.as_object_mut() {
					obj.insert("allowedDirectoryCount".to_string(), json!(self.sandbox.roots().len()));
				}
				Ok(value)
			}
			"create_file" => {
				self.gate(Operation::Create, "create file")?;
				let path = required_str(args, "path")?;
				let content = required_str(args, "content")?;
				let validated = self.resolve(path).await?;
				fs::create_file(&validated, path, content).await?;
				Ok(json!({ "path": path, "bytes": content.len() }))
			}
			"modify_file" => {
				self.gate(Operation::Edit, "modify file")?;
				let path = required_str(args, "path")?;
				let content = required_str(args, "content")?;
				let validated = self.resolve(path).await?;
				fs::modify_file(&validated, path, content).await?;
				Ok(json!({ "path": path, "bytes": content.len() }))
			}
			"edit_file" => {
				self.gate(Operation::Edit, "edit file")?;
				let path = required_str(args, "path")?;
				let edits: Vec<EditOperation> = serde_json::from_value(args.get("edits").cloned().unwrap_or(Value::Null))
					.map_err(|err| FsError::invalid(format!("edits must be a list of {{oldText, newText}}: {}", err)))?;
				if edits.is_empty() {
					return Err(FsError::invalid("edits must not be empty").into());
				}
				let dry_run = optional_bool(args, "dryRun", false)?;
				let max_bytes = positive_usize(args, "maxBytes", fs::DEFAULT_MAX_BYTES)?;
				let validated = self.resolve(path).await?;
				fs::edit_file(&validated, path, &edits, dry_run, max_bytes).await
			}
			"create_directory" => {
				self.gate(Operation::Create, "create directory")?;
				let path = required_str(args, "path")?;
				let validated = self.resolve_with(path, false).await?;
				fs::create_directory(&validated, path).await?;
				Ok(json!({ "path": path }))
			}
			"move_file" => {
				self.gate(Operation::Move, "move file")?;
				let source = required_str(args, "source")?;
				let destination = required_str(args, "destination")?;
				let from = self.resolve(source).await?;
				let to = self.resolve(destination).await?;
				self.refuse_root(&from, source)?;
				fs::move_path(&from, &to, destination).await?;
				Ok(json!({ "source": source, "destination": destination }))
			}
			"rename_file" => {
				self.gate(Operation::Rename, "rename file")?;
				let path = required_str(args, "path")?;
				let new_name = required_str(args, "newName")?;
				let from = self.resolve(path).await?;
				self.refuse_root(&from, path)?;
				let target = fs::renamed_target(&from, new_name)?;
				let to = self.blocking(move |sandbox| sandbox.validate_absolute(&target)).await?;
				fs::move_path(&from, &to, new_name).await?;
				Ok(json!({ "path": path, "newName": new_name }))
			}
			"delete_file" => {
				self.gate(Operation::Delete, "delete file")?;
				let path = required_str(args, "path")?;
				let validated = self.resolve(path).await?;
				fs::delete_file(&validated, path).await?;
				Ok(json!({ "path": path }))
			}
			"delete_directory" => {
				self.gate(Operation::Delete, "delete directory")?;
				let path = required_str(args, "path")?;
				let recursive = optional_bool(args, "recursive", false)?;
				let validated = self.resolve(path).await?;
				fs::delete_directory(&self.sandbox, &validated, path, recursive).await?;
				Ok(json!({ "path": path, "recursive": recursive }))
			}
			"json_get_value" => {
				let field = required_str(args, "field")?.to_string();
				let (label, doc) = self.load_json(args).await?;
				let value = json::get_value(&doc, &field)?;
				Ok(json!({ "path": label, "field": field, "value": value }))
			}
			"json_structure" => {
				let max_depth = positive_usize(args, "maxDepth", walk::DEFAULT_MAX_DEPTH)?;
				let detailed = optional_bool(args, "detailedArrayTypes", false)?;
				let (label, doc) = self.load_json(args).await?;
				Ok(json!({ "path": label, "structure": json::structure(&doc, max_depth, detailed) }))
			}
			"json_filter" => {
				let conditions: Vec<json::Condition> = serde_json::from_value(args.get("conditions").cloned().unwrap_or(Value::Null))
					.map_err(|err| FsError::invalid(format!("conditions must be a list of {{field, operator, value}}: {}", err)))?;
				let match_any = match optional_str(args, "match").unwrap_or("all") {
					"all" => false,
					"any" => true,
					other => return Err(FsError::invalid(format!("match must be all or any, got {}", other)).into()),
				};
				let array_path = optional_str(args, "arrayPath").map(str::to_string);
				let (label, doc) = self.load_json(args).await?;
				let items = json::filter(&doc, array_path.as_deref(), &conditions, match_any)?;
				let count = items.len();
				Ok(json!({ "path": label, "result": items, "count": count }))
			}
			"json_sample" => {
				let array_path = required_str(args, "arrayPath")?.to_string();
				let count = positive_usize(args, "count", 1)?;
				let random = match optional_str(args, "method").unwrap_or("first") {
					"first" => false,
					"random" => true,
					other => return Err(FsError::invalid(format!("method must be first or random, got {}", other)).into()),
				};
				let (label, doc) = self.load_json(args).await?;
				let items = json::sample(&doc, &array_path, count, random)?;
				let count = items.len();
				Ok(json!({ "path": label, "result": items, "count": count }))
			}
			"json_transform" => {
				let operations: Vec<json::TransformOp> = serde_json::from_value(args.get("operations").cloned().unwrap_or(Value::Null))
					.map_err(|err| FsError::invalid(format!("operations must be a list of {{type, field?, order?, fields?}}: {}", err)))?;
				let (label, doc) = self.load_json(args).await?;
				let result = json::transform(doc, &operations)?;
				Ok(json!({ "path": label, "result": result }))
			}
			"json_validate" => {
				let schema_label = required_str(args, "schemaPath")?.to_string();
				let max_bytes = positive_usize(args, "maxBytes", fs::DEFAULT_MAX_BYTES)?;
				let schema_path = self.resolve(&schema_label).await?;
				let (label, doc) = self.load_json(args).await?;
				let report = self.blocking(
					move |_| {
						let schema = json::read_document(&schema_path, &schema_label, max_bytes)?;
						json::validate(&doc, &schema)
					}).await?;
				Ok(json!({ "path": label, "isValid": report["isValid"], "errors": report["errors"] }))
			}
			"json_search_kv" => {
				let label = required_str(args, "directoryPath")?.to_string();
				let key = required_str(args, "key")?;
				let value = args.get("value").cloned();
				let match_type = json::MatchType::parse(optional_str(args, "matchType"))?;
				let recursive = optional_bool(args, "recursive", true)?;
				let max_depth = if recursive {
					positive_usize(args, "maxDepth", walk::DEFAULT_MAX_DEPTH)?
				}
				else {
					1
				};
				let budget = TraversalBudget::new(max_depth, positive_usize(args, "maxResults", walk::DEFAULT_MAX_RESULTS)?);
				let max_bytes = positive_usize(args, "maxBytes", fs::DEFAULT_MAX_BYTES)?;
				let mut visitor = json::KvSearch::new(key, value, match_type, max_bytes);
				let root = self.resolve(&label).await?;
				let files = self.blocking(
					move |sandbox| {
						require_dir(&root, &root.display().to_string())?;
						Ok(walk::walk(sandbox, &root, &budget, &mut visitor))
					}).await?;
				let count = files.len();
				Ok(json!({ "path": label, "key": key, "files": files, "count": count }))
			}
			"json_query" => {
				let expression = required_str(args, "query")?.to_string();
				let (label, doc) = self.load_json(args).await?;
				let (result, count) = json::query(&doc, &expression)?;
				Ok(json!({ "path": label, "query": expression, "result": result, "count": count }))
			}
			"xml_query" => {
				let label = required_str(args, "path")?.to_string();
				let expression = optional_str(args, "query").map(str::to_string);
				let structure_only = optional_bool(args, "structureOnly", false)?;
				let include_attributes = optional_bool(args, "includeAttributes", true)?;
				let limit = response_limit(args)?;
				if !structure_only && expression.is_none() {
					return Err(FsError::invalid("either query or structureOnly must be given").into());
				}
				let path = self.resolve(&label).await?;
				let reported = label.clone();
				let mut value = self.blocking(
					move |_| {
						let text = json::read_capped(&path, &label, xml::MAX_SOURCE_BYTES)?;
						let package = xml::parse(&text, &label)?;
						let doc = package.as_document();
						let value = match expression {
							Some(expression) if !structure_only => xml::query(&doc, &expression, include_attributes, limit)?,
							_ => xml::tag_summary(&doc, limit),
						};
						Ok(value)
					}).await?;
				if let Some(obj) = value.as_object_mut() {
					obj.insert("path".to_string(), json!(reported));
				}
				Ok(value)
			}
			"xml_structure" => {
				let label = required_str(args, "path")?.to_string();
				let max_depth = positive_usize(args, "maxDepth", walk::DEFAULT_MAX_DEPTH)?;
				let include_attributes = optional_bool(args, "includeAttributes", true)?;
				let limit = response_limit(args)?;
				let path = self.resolve(&label).await?;
				let reported = label.clone();
				let structure = self.blocking(
					move |_| {
						let text = json::read_capped(&path, &label, xml::MAX_SOURCE_BYTES)?;
						let package = xml::parse(&text, &label)?;
						let structure = xml::structure(&package.as_document(), max_depth, include_attributes, limit)?;
						Ok(structure)
					}).await?;
				Ok(json!({ "path": reported, "structure": structure }))
			}
			"xml_to_json" => {
				let xml_label = required_str(args, "xmlPath")?.to_string();
				let json_label = required_str(args, "jsonPath")?.to_string();
				let max_bytes = positive_usize(args, "maxBytes", fs::DEFAULT_MAX_BYTES)?;
				let options = convert_options(args)?;
				let source = self.resolve(&xml_label).await?;
				let target = self.resolve_with(&json_label, false).await?;
				let exists = tokio::fs::symlink_metadata(&target).await.is_ok();
				if exists {
					self.gate(Operation::Edit, "overwrite JSON file")?;
				}
				else {
					self.gate(Operation::Create, "create JSON file")?;
				}
				let label = xml_label.clone();
				let rendered = self.blocking(
					move |_| {
						let text = json::read_capped(&source, &label, max_bytes)?;
						let package = xml::parse(&text, &label)?;
						let converted = xml::to_json(&package.as_document(), &options);
						xml::render(&converted, &options)
					}).await?;
				fs::write_output(&target, &json_label, &rendered).await?;
				Ok(json!({
					"xmlPath": xml_label,
					"jsonPath": json_label,
					"bytes": rendered.len(),
					"created": !exists,
				}))
			}
			"xml_to_json_string" => {
				let label = required_str(args, "xmlPath")?.to_string();
				let max_bytes = positive_usize(args, "maxBytes", fs::DEFAULT_MAX_BYTES)?;
				let options = convert_options(args)?;
				let source = self.resolve(&label).await?;
				let reported = label.clone();
				let converted = self.blocking(
					move |_| {
						let text = json::read_capped(&source, &label, max_bytes)?;
						let package = xml::parse(&text, &label)?;
						let converted = xml::to_json(&package.as_document(), &options);
						Ok(converted)
					}).await?;
				Ok(json!({ "xmlPath": reported, "result": converted }))
			}
			_ => Err(FsError::invalid(format!("unknown tool: {}", name)).into()),
		}
	}

	/// Validates `path` and parses it as JSON under the `maxBytes` cap.
	async fn load_json(&self, args: &Value) -> Result<(String, Value)> {
		let label = required_str(args, "path")?.to_string();
		let max_bytes = positive_usize(args, "maxBytes", fs::DEFAULT_MAX_BYTES)?;
		let path = self.resolve(&label).await?;
		let reported = label.clone();
		let doc = self.blocking(move |_| json::read_document(&path, &label, max_bytes)).await?;
		Ok((reported, doc))
	}

	fn refuse_root(&self, path: &Path, label: &str) -> Result<()> {
		if self.sandbox.is_root(path) {
			return Err(FsError::access_denied(format!("cannot move or rename an allowed directory: {}", label)).into());
		}
		Ok(())
	}
}

fn required_operation(tool: &str) -> Option<Operation> {
	match tool {
		"create_file" | "create_directory" => Some(Operation::Create),
		"modify_file" | "edit_file" => Some(Operation::Edit),
		"move_file" => Some(Operation::Move),
		"rename_file" => Some(Operation::Rename),
		"delete_file" | "delete_directory" => Some(Operation::Delete),
		_ => None,
	}
}

// Tools whose gate depends on whether the target file already exists: Create for a new file, Edit otherwise.
fn write_operations(tool: &str) -> &'static [Operation] {
	match tool {
		"xml_to_json" => &[Operation::Create, Operation::Edit],
		_ => &[],
	}
}

fn response_limit(args: &Value) -> Result<usize> {
	match args.get("maxResponseBytes") {
		None | Some(Value::Null) => positive_usize(args, "maxBytes", xml::DEFAULT_RESPONSE_BYTES),
		Some(_) => positive_usize(args, "maxResponseBytes", xml::DEFAULT_RESPONSE_BYTES),
	}
}

fn convert_options(args: &Value) -> Result<xml::ConvertOptions> {
	match args.get("options") {
		None | Some(Value::Null) => Ok(xml::ConvertOptions::default()),
		Some(options) => {
			let parsed: xml::ConvertOptions = serde_json::from_value(options.clone())
				.map_err(|err| FsError::invalid(format!("invalid conversion options: {}", err)))?;
			if parsed.indent_size > 16 {
				return Err(FsError::invalid("options.indentSize must be at most 16").into());
			}
			Ok(parsed)
		}
	}
}

fn traversal_budget(args: &Value, default_results: usize) -> Result<TraversalBudget> {
	TraversalBudget::new(
		positive_usize(args, "maxDepth", walk::DEFAULT_MAX_DEPTH)?,
		positive_usize(args, "maxResults", default_results)?
	)
	.excluding(&optional_string_list(args, "excludePatterns")?)
}

fn path_matches(label: &str, matches: Vec<PathBuf>, limit: usize) -> Value {
	let matches: Vec<String> = matches.iter().map(|path| path.display().to_string()).collect();
	let count = matches.len();
	json!({
		"path": label,
		"matches": matches,
		"count": count,
		"limit": limit,
	})
}

fn require_dir(path: &Path, label: &str) -> Result<()> {
	let meta = std::fs::metadata(path).map_err(|err| crate::error::format_io_error("open", label, err))?;
	if !meta.is_dir() {
		return Err(FsError::invalid(format!("{} is not a directory", label)).into());
	}
	Ok(())
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
	args.get(key)
		.and_then(Value::as_str)
		.ok_or_else(|| FsError::invalid(format!("{} is required", key)).into())
}

fn optional_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
	args.get(key).and_then(Value::as_str)
}

fn optional_bool(args: &Value, key: &str, default: bool) -> Result<bool> {
	match args.get(key) {
		None | Some(Value::Null) => Ok(default),
		Some(Value::Bool(value)) => Ok(*value),
		Some(_) => Err(FsError::invalid(format!("{} must be a boolean", key)).into()),
	}
}

fn positive_usize(args: &Value, key: &str, default: usize) -> Result<usize> {
	match args.get(key) {
		None | Some(Value::Null) => Ok(default),
		Some(value) => {
			let parsed = value.as_u64().ok_or_else(|| FsError::invalid(format!("{} must be a positive integer", key)))?;
			if parsed == 0 {
				return Err(FsError::invalid(format!("{} must be at least 1", key)).into());
			}
			Ok(usize::try_from(parsed).unwrap_or(usize::MAX))
		}
	}
}

fn optional_string_list(args: &Value, key: &str) -> Result<Vec<String>> {
	match args.get(key) {
		None | Some(Value::Null) => Ok(Vec::new()),
		Some(Value::Array(items)) => items
			.iter()
			.map(
				|item| {
					item.as_str()
						.map(str::to_string)
						.ok_or_else(|| anyhow::Error::from(FsError::invalid(format!("{} must contain strings", key))))
				})
			.collect(),
		Some(_) => Err(FsError::invalid(format!("{} must be an array of strings", key)).into()),
	}
}

fn required_string_list(args: &Value, key: &str) -> Result<Vec<String>> {
	let items = optional_string_list(args, key)?;
	if items.is_empty() {
		return Err(FsError::invalid(format!("{} must be a non-empty array", key)).into());
	}
	Ok(items)
}

fn tool_success(name: &str, structured: Value) -> Value {
	let message = tool_message(name, &structured);
	json!({
		"structuredContent": structured,
		"content": [
			{
				"type": "text",
				"text": message
			}
		]
	})
}

fn tool_error(err: &anyhow::Error) -> Value {
	json!({
		"isError": true,
		"structuredContent": {
			"code": error_code(err)
		},
		"content": [
			{
				"type": "text",
				"text": format!("Error: {}", err)
			}
		]
	})
}

fn get_str<'a>(value: &'a Value, key: &str) -> &'a str {
	value.get(key).and_then(Value::as_str).unwrap_or("")
}

fn pretty(value: &Value) -> String {
	serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn tool_message(name: &str, structured: &Value) -> String {
	match name {
		"read_file" => {
			let content = get_str(structured, "content");
			if structured["truncated"].as_bool().unwrap_or(false) {
				format!(
					"{}\n[truncated: showing {} of {} bytes]",
					content,
					content.len(),
					structured["size"].as_u64().unwrap_or(0)
				)
			}
			else {
				content.to_string()
			}
		}
		"read_multiple_files" => structured["files"]
			.as_array()
			.map(
				|files| {
					files.iter()
						.map(
							|file| match file.get("error").and_then(Value::as_str) {
								Some(error) => format!("{}: Error - {}", get_str(file, "path"), error),
								None => format!("{}:\n{}", get_str(file, "path"), get_str(file, "content")),
							})
						.collect::<Vec<_>>()
						.join("\n---\n")
				})
			.unwrap_or_default(),
		"list_directory" => {
			let lines: Vec<String> = structured["entries"]
				.as_array()
				.map(
					|entries| {
						entries.iter()
							.map(
								|entry| {
									let tag = if entry["type"] == "directory" {
										"[DIR]"
									}
									else {
										"[FILE]"
									};
									format!("{} {}", tag, get_str(entry, "name"))
								})
							.collect()
					})
				.unwrap_or_default();
			if lines.is_empty() {
				"Directory is empty".to_string()
			}
			else {
				lines.join("\n")
			}
		}
		"directory_tree" => pretty(&structured["tree"]),
		"search_files" | "find_files_by_extension" => {
			let matches: Vec<&str> = structured["matches"]
				.as_array()
				.map(|items| items.iter().filter_map(Value::as_str).collect())
				.unwrap_or_default();
			if matches.is_empty() {
				"No matches found".to_string()
			}
			else {
				matches.join("\n")
			}
		}
		"regex_search_content" => {
			let files = structured["files"].as_array().cloned().unwrap_or_default();
			if files.is_empty() {
				return "No matches found for the given regex pattern.".to_string();
			}
			files.iter()
				.map(
					|file| {
						let lines: Vec<String> = file["matches"]
							.as_array()
							.map(
								|matches| {
									matches.iter()
										.map(
											|m| {
												format!(
													"  Line {}: {}",
													m["lineNumber"].as_u64().unwrap_or(0),
													get_str(m, "lineContent").trim()
												)
											})
										.collect()
								})
							.unwrap_or_default();
						format!("File: {}\n{}", get_str(file, "path"), lines.join("\n"))
					})
				.collect::<Vec<_>>()
				.join("\n\n")
		}
		"get_file_info" => structured
			.as_object()
			.map(
				|obj| {
					obj.iter()
						.map(|(key, value)| format!("{}: {}", key, value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string())))
						.collect::<Vec<_>>()
						.join("\n")
				})
			.unwrap_or_default(),
		"list_allowed_directories" => {
			let roots: Vec<&str> = structured["directories"]
				.as_array()
				.map(|items| items.iter().filter_map(Value::as_str).collect())
				.unwrap_or_default();
			format!("Allowed directories:\n{}", roots.join("\n"))
		}
		"get_permissions" => {
			let flag = |key: &str| structured[key].as_bool().unwrap_or(false);
			let count = structured["allowedDirectoryCount"].as_u64().unwrap_or(0);
			format!(
				"Current permission state:\nreadOnly: {}\nfollowSymlinks: {}\nfullAccess: {}\n\nOperations allowed:\n- create: {}\n- edit: {}\n- move: {}\n- rename: {}\n- delete: {}\n\nServer was started with {} allowed {}.",
				flag("readOnly"),
				flag("followSymlinks"),
				flag("fullAccess"),
				flag("create"),
				flag("edit"),
				flag("move"),
				flag("rename"),
				flag("delete"),
				count,
				if count == 1 { "directory" } else { "directories" }
			)
		}
		"create_file" => format!("Successfully created {}", get_str(structured, "path")),
		"modify_file" => format!("Successfully modified {}", get_str(structured, "path")),
		"edit_file" => get_str(structured, "diff").to_string(),
		"create_directory" => format!("Successfully created directory {}", get_str(structured, "path")),
		"move_file" => format!(
			"Successfully moved {} to {}",
			get_str(structured, "source"),
			get_str(structured, "destination")
		),
		"rename_file" => format!(
			"Successfully renamed {} to {}",
			get_str(structured, "path"),
			get_str(structured, "newName")
		),
		"delete_file" => format!("Successfully deleted {}", get_str(structured, "path")),
		"delete_directory" => format!("Successfully deleted directory {}", get_str(structured, "path")),
		"json_get_value" => pretty(&structured["value"]),
		"json_structure" => pretty(&structured["structure"]),
		"json_filter" | "json_sample" | "json_transform" => pretty(&structured["result"]),
		"json_validate" => pretty(&json!({ "isValid": structured["isValid"], "errors": structured["errors"] })),
		"json_search_kv" => pretty(&structured["files"]),
		_ => pretty(structured),
	}
}

fn tool(name: &str, description: &str, group: &str, properties: Value, required: &[&str]) -> Value {
	json!({
		"name": name,
		"description": description,
		"annotations": {
			"group": group,
			"readOnlyHint": required_operation(name).is_none()
		},
		"inputSchema": {
			"type": "object",
			"properties": properties,
			"required": required,
			"additionalProperties": false
		}
	})
}

fn tool_definitions() -> Vec<Value> {
	let depth = json!({ "type": "integer", "minimum": 1, "description": "Maximum directory depth, counted from the starting directory. Default 2." });
	let excludes = json!({ "type": "array", "items": { "type": "string" }, "description": "Globs matched against paths relative to the starting directory; bare names exclude that name anywhere." });
	let max_bytes = json!({ "type": "integer", "minimum": 1, "description": "Maximum file size in bytes. Default 10240." });
	let response_bytes = json!({ "type": "integer", "minimum": 1, "description": "Cap on the returned content in bytes. Default 204800." });
	let convert_options_schema = json!({
		"type": "object",
		"properties": {
			"ignoreAttributes": { "type": "boolean" },
			"preserveOrder": { "type": "boolean" },
			"format": { "type": "boolean" },
			"indentSize": { "type": "integer", "minimum": 0, "maximum": 16 }
		},
		"additionalProperties": false
	});
	vec![
		tool(
			"read_file",
			"Read a text file. Content beyond maxBytes is cut off and reported as truncated.",
			"filesystem",
			json!({
				"path": { "type": "string" },
				"maxBytes": max_bytes.clone()
			}),
			&["path"]
		),
		tool(
			"read_multiple_files",
			"Read several files at once; a failing path is reported inline without aborting the others.",
			"filesystem",
			json!({
				"paths": { "type": "array", "items": { "type": "string" }, "minItems": 1 },
				"maxBytesPerFile": max_bytes.clone()
			}),
			&["paths"]
		),
		tool(
			"list_directory",
			"List a directory, marking entries [DIR] or [FILE].",
			"filesystem",
			json!({ "path": { "type": "string" } }),
			&["path"]
		),
		tool(
			"directory_tree",
			"Nested JSON tree of a directory. Directories always carry a children array; files never do.",
			"filesystem",
			json!({
				"path": { "type": "string" },
				"maxDepth": depth.clone(),
				"excludePatterns": excludes.clone()
			}),
			&["path"]
		),
		tool(
			"search_files",
			"Find files and directories whose name contains pattern (case-insensitive).",
			"filesystem",
			json!({
				"path": { "type": "string" },
				"pattern": { "type": "string" },
				"excludePatterns": excludes.clone(),
				"maxDepth": depth.clone(),
				"maxResults": { "type": "integer", "minimum": 1, "description": "Default 10." }
			}),
			&["path", "pattern"]
		),
		tool(
			"find_files_by_extension",
			"Find files with the given extension (case-insensitive, leading dot optional).",
			"filesystem",
			json!({
				"path": { "type": "string" },
				"extension": { "type": "string" },
				"excludePatterns": excludes.clone(),
				"maxDepth": depth.clone(),
				"maxResults": { "type": "integer", "minimum": 1, "description": "Default 10." }
			}),
			&["path", "extension"]
		),
		tool(
			"regex_search_content",
			"Search file contents line by line with a regular expression.",
			"filesystem",
			json!({
				"path": { "type": "string" },
				"regex": { "type": "string" },
				"filePattern": { "type": "string", "description": "Glob for files to search. Without '/' it matches the file name, otherwise the path relative to path. Default *." },
				"maxDepth": depth.clone(),
				"maxFileSize": { "type": "integer", "minimum": 1, "description": "Files larger than this are skipped. Default 10 MiB." },
				"maxResults": { "type": "integer", "minimum": 1, "description": "Maximum number of matching files. Default 50." }
			}),
			&["path", "regex"]
		),
		tool(
			"get_file_info",
			"Size, timestamps (epoch milliseconds), type and permissions of a path.",
			"filesystem",
			json!({ "path": { "type": "string" } }),
			&["path"]
		),
		tool(
			"list_allowed_directories",
			"List the directories this server may access.",
			"filesystem",
			json!({}),
			&[]
		),
		tool(
			"get_permissions",
			"Report which operations this server permits.",
			"filesystem",
			json!({}),
			&[]
		),
		tool(
			"create_file",
			"Create a new file. Fails if the file already exists.",
			"filesystem",
			json!({
				"path": { "type": "string" },
				"content": { "type": "string" }
			}),
			&["path", "content"]
		),
		tool(
			"modify_file",
			"Replace the full content of an existing file.",
			"filesystem",
			json!({
				"path": { "type": "string" },
				"content": { "type": "string" }
			}),
			&["path", "content"]
		),
		tool(
			"edit_file",
			"Apply ordered text replacements and return a unified diff. Nothing is written unless every edit matches or when dryRun is set.",
			"filesystem",
			json!({
				"path": { "type": "string" },
				"edits": {
					"type": "array",
					"minItems": 1,
					"items": {
						"type": "object",
						"properties": {
							"oldText": { "type": "string" },
							"newText": { "type": "string" }
						},
						"required": ["oldText", "newText"],
						"additionalProperties": false
					}
				},
				"dryRun": { "type": "boolean" },
				"maxBytes": max_bytes.clone()
			}),
			&["path", "edits"]
		),
		tool(
			"create_directory",
			"Create a directory including missing parents.",
			"filesystem",
			json!({ "path": { "type": "string" } }),
			&["path"]
		),
		tool(
			"move_file",
			"Move a file or directory. Fails if the destination exists.",
			"filesystem",
			json!({
				"source": { "type": "string" },
				"destination": { "type": "string" }
			}),
			&["source", "destination"]
		),
		tool(
			"rename_file",
			"Rename a file or directory within its directory.",
			"filesystem",
			json!({
				"path": { "type": "string" },
				"newName": { "type": "string" }
			}),
			&["path", "newName"]
		),
		tool(
			"delete_file",
			"Delete a file.",
			"filesystem",
			json!({ "path": { "type": "string" } }),
			&["path"]
		),
		tool(
			"delete_directory",
			"Delete a directory. Non-empty directories require recursive.",
			"filesystem",
			json!({
				"path": { "type": "string" },
				"recursive": { "type": "boolean" }
			}),
			&["path"]
		),
		tool(
			"json_get_value",
			"Get the value at a field path such as items[0].name.",
			"json",
			json!({
				"path": { "type": "string" },
				"field": { "type": "string" },
				"maxBytes": max_bytes.clone()
			}),
			&["path", "field"]
		),
		tool(
			"json_structure",
			"Describe the types in a JSON document.",
			"json",
			json!({
				"path": { "type": "string" },
				"maxDepth": { "type": "integer", "minimum": 1, "description": "Object nesting to expand. Default 2." },
				"detailedArrayTypes": { "type": "boolean" },
				"maxBytes": max_bytes.clone()
			}),
			&["path"]
		),
		tool(
			"json_filter",
			"Filter an array by field conditions.",
			"json",
			json!({
				"path": { "type": "string" },
				"arrayPath": { "type": "string" },
				"conditions": {
					"type": "array",
					"items": {
						"type": "object",
						"properties": {
							"field": { "type": "string" },
							"operator": { "type": "string", "enum": ["eq", "neq", "gt", "gte", "lt", "lte", "contains", "startsWith", "endsWith", "exists", "type"] },
							"value": {}
						},
						"required": ["field", "operator"]
					}
				},
				"match": { "type": "string", "enum": ["all", "any"] },
				"maxBytes": max_bytes.clone()
			}),
			&["path", "conditions"]
		),
		tool(
			"json_sample",
			"Take the first or a random sample of array elements.",
			"json",
			json!({
				"path": { "type": "string" },
				"arrayPath": { "type": "string" },
				"count": { "type": "integer", "minimum": 1 },
				"method": { "type": "string", "enum": ["first", "random"] },
				"maxBytes": max_bytes.clone()
			}),
			&["path", "arrayPath", "count"]
		),
		tool(
			"json_transform",
			"Apply map, groupBy, sort, flatten, pick and omit operations in sequence.",
			"json",
			json!({
				"path": { "type": "string" },
				"operations": {
					"type": "array",
					"items": {
						"type": "object",
						"properties": {
							"type": { "type": "string", "enum": ["map", "groupBy", "sort", "flatten", "pick", "omit"] },
							"field": { "type": "string" },
							"order": { "type": "string", "enum": ["asc", "desc"] },
							"fields": { "type": "array", "items": { "type": "string" } }
						},
						"required": ["type"]
					}
				},
				"maxBytes": max_bytes.clone()
			}),
			&["path", "operations"]
		),
		tool(
			"json_validate",
			"Validate a JSON document against a JSON Schema file.",
			"json",
			json!({
				"path": { "type": "string" },
				"schemaPath": { "type": "string" },
				"maxBytes": max_bytes.clone()
			}),
			&["path", "schemaPath"]
		),
		tool(
			"json_search_kv",
			"Find key/value pairs across the .json files under a directory.",
			"json",
			json!({
				"directoryPath": { "type": "string" },
				"key": { "type": "string" },
				"value": {},
				"matchType": { "type": "string", "enum": ["exact", "contains", "startsWith", "endsWith"] },
				"recursive": { "type": "boolean" },
				"maxDepth": depth,
				"maxResults": { "type": "integer", "minimum": 1, "description": "Maximum number of matching files. Default 10." },
				"maxBytes": max_bytes
			}),
			&["directoryPath", "key"]
		),
	]
}

fn extract_tool_name(method: &str, params: &Value) -> Option<String> {
	if method != "tools/call" {
		return None;
	}
	params.get("name")
		.and_then(Value::as_str)
		.map(|value| value.to_string())
}

fn record_result(span: &Span, result: &Value) {
	let response_bytes = serde_json::to_string(result).map(|value| value.as_bytes().len() as u64).ok();
	if let Some(bytes) = response_bytes {
		span.record("mcp.response_bytes", bytes);
	}
	let is_error = result.get("isError")
		.and_then(Value::as_bool)
		.unwrap_or(false);
	span.record("mcp.is_error", is_error);
	if let Some(code) = result.get("structuredContent")
		.and_then(|value| value.get("code"))
		.and_then(Value::as_str) {
		span.record("mcp.error_code", code);
	}
	if let Some(count) = result.get("structuredContent")
		.and_then(|value| value.get("count"))
		.and_then(Value::as_u64) {
		span.record("mcp.count", count);
	}
}

async fn write_response(writer: &mut io::BufWriter<io::Stdout>, resp: Response) -> Result<()> {
	let line = serde_json::to_string(&resp)?;
	writer.write_all(line.as_bytes()).await?;
	writer.write_all(b"\n").await?;
	writer.flush().await?;
	Ok(())
}
