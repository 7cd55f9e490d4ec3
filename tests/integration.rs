use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

struct RpcClient {
	child: Child,
	stdin: ChildStdin,
	stdout: BufReader<ChildStdout>,
	next_id: u64,
}

impl RpcClient {
	fn spawn(root: &Path, flags: &[&str]) -> Self {
		Self::spawn_roots(&[root], flags)
	}

	fn spawn_roots(roots: &[&Path], flags: &[&str]) -> Self {
		let bin = env!("CARGO_BIN_EXE_secure-fs-mcp");
		let mut child = Command::new(bin)
			.args(flags)
			.args(roots)
			.env_remove("MCP_ALLOWED_ROOTS")
			.env_remove("MCP_READONLY")
			.env_remove("MCP_FULL_ACCESS")
			.env_remove("MCP_CONFIG")
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::null())
			.spawn()
			.expect("spawn secure-fs-mcp");
		let stdin = child.stdin
			.take()
			.expect("stdin");
		let stdout = child.stdout
			.take()
			.expect("stdout");
		Self {
			child,
			stdin,
			stdout: BufReader::new(stdout),
			next_id: 1
		}
	}

	fn send(&mut self, method: &str, params: Value) -> Value {
		let id = self.next_id;
		self.next_id += 1;
		let req = json!({
			"jsonrpc": "2.0",
			"id": id,
			"method": method,
			"params": params
		});
		let line = serde_json::to_string(&req).expect("serialize request");
		writeln!(self.stdin, "{}", line).expect("write request");
		self.stdin
			.flush()
			.expect("flush request");
		let mut resp_line = String::new();
		loop {
			resp_line.clear();
			let bytes = self.stdout
				.read_line(&mut resp_line)
				.expect("read response");
			if bytes == 0 {
				panic!("secure-fs-mcp exited unexpectedly");
			}
			let trimmed = resp_line.trim();
			if trimmed.is_empty() {
				continue;
			}
			let parsed: Value = match serde_json::from_str(trimmed) {
				Ok(value) => value,
				Err(_) => continue,
			};
			if parsed.get("id").and_then(Value::as_u64) == Some(id) {
				return parsed;
			}
		}
	}

	fn call(&mut self, name: &str, arguments: Value) -> Value {
		let resp = self.send("tools/call", json!({ "name": name, "arguments": arguments }));
		resp.get("result").cloned().expect("result")
	}

	fn tool_names(&mut self) -> Vec<String> {
		let resp = self.send("tools/list", json!({}));
		resp["result"]["tools"]
			.as_array()
			.expect("tools")
			.iter()
			.filter_map(|tool| tool["name"].as_str().map(str::to_string))
			.collect()
	}
}

impl Drop for RpcClient {
	fn drop(&mut self) {
		let _ = self.child.kill();
	}
}

fn write_text(path: &Path, contents: &str) {
	std::fs::create_dir_all(path.parent().unwrap()).expect("create parent");
	std::fs::write(path, contents).expect("write file");
}

fn error_code(result: &Value) -> &str {
	assert_eq!(result["isError"], true, "expected tool error, got {}", result);
	result["structuredContent"]["code"].as_str().expect("code")
}

#[test]
fn initialize_reports_server_info() {
	let root = tempfile::tempdir().expect("tempdir");
	let mut client = RpcClient::spawn(root.path(), &[]);
	let resp = client.send("initialize", json!({ "protocolVersion": "2024-11-05" }));
	assert_eq!(resp["result"]["serverInfo"]["name"], "secure-fs-mcp");
	assert!(resp["result"]["capabilities"]["tools"].is_object());
	let pong = client.send("ping", json!({}));
	assert!(pong["result"].is_object());
	let missing = client.send("does/not/exist", json!({}));
	assert_eq!(missing["error"]["code"], -32601);
}

#[test]
fn tools_list_hides_ungranted_mutations() {
	let root = tempfile::tempdir().expect("tempdir");
	let mut client = RpcClient::spawn(root.path(), &["--allow-edit"]);
	let names = client.tool_names();
	assert!(names.contains(&"read_file".to_string()));
	assert!(names.contains(&"json_filter".to_string()));
	assert!(names.contains(&"edit_file".to_string()));
	assert!(!names.contains(&"delete_file".to_string()));
	assert!(!names.contains(&"create_file".to_string()));

	let mut readonly = RpcClient::spawn(root.path(), &["--readonly", "--full-access"]);
	let names = readonly.tool_names();
	assert!(!names.contains(&"edit_file".to_string()));
	assert!(!names.contains(&"move_file".to_string()));
}

#[test]
fn delete_without_permission_is_refused() {
	let root = tempfile::tempdir().expect("tempdir");
	let file = root.path().join("keep.txt");
	write_text(&file, "data");
	let mut client = RpcClient::spawn(root.path(), &[]);
	let result = client.call("delete_file", json!({ "path": "keep.txt" }));
	assert_eq!(error_code(&result), "PERMISSION_NOT_GRANTED");
	assert!(file.exists());
}

#[test]
fn edit_file_applies_and_reports_diff() {
	let root = tempfile::tempdir().expect("tempdir");
	let file = root.path().join("f.txt");
	write_text(&file, "X\nY");
	let mut client = RpcClient::spawn(root.path(), &["--allow-edit"]);
	let result = client.call(
		"edit_file",
		json!({
			"path": "f.txt",
			"edits": [{ "oldText": "X", "newText": "Z" }]
		})
	);
	assert!(result.get("isError").is_none(), "{}", result);
	let diff = result["structuredContent"]["diff"].as_str().expect("diff");
	assert!(diff.contains("-X"));
	assert!(diff.contains("+Z"));
	assert_eq!(std::fs::read_to_string(&file).expect("read"), "Z\nY");
}

#[test]
fn edit_file_dry_run_leaves_file() {
	let root = tempfile::tempdir().expect("tempdir");
	let file = root.path().join("f.txt");
	write_text(&file, "alpha\nbeta\n");
	let mut client = RpcClient::spawn(root.path(), &["--allow-edit"]);
	let result = client.call(
		"edit_file",
		json!({
			"path": "f.txt",
			"edits": [{ "oldText": "beta", "newText": "gamma" }],
			"dryRun": true
		})
	);
	assert_eq!(result["structuredContent"]["dryRun"], true);
	assert!(result["structuredContent"]["diff"].as_str().expect("diff").contains("+gamma"));
	assert_eq!(std::fs::read_to_string(&file).expect("read"), "alpha\nbeta\n");
}

#[test]
fn failed_edit_writes_nothing() {
	let root = tempfile::tempdir().expect("tempdir");
	let file = root.path().join("f.txt");
	write_text(&file, "one\ntwo\n");
	let mut client = RpcClient::spawn(root.path(), &["--allow-edit"]);
	let result = client.call(
		"edit_file",
		json!({
			"path": "f.txt",
			"edits": [
				{ "oldText": "one", "newText": "uno" },
				{ "oldText": "three", "newText": "tres" }
			]
		})
	);
	assert_eq!(error_code(&result), "NO_EXACT_MATCH");
	assert_eq!(std::fs::read_to_string(&file).expect("read"), "one\ntwo\n");
}

#[test]
fn read_file_truncates_at_max_bytes() {
	let root = tempfile::tempdir().expect("tempdir");
	write_text(&root.path().join("big.txt"), "hello world");
	let mut client = RpcClient::spawn(root.path(), &[]);
	let result = client.call("read_file", json!({ "path": "big.txt", "maxBytes": 5 }));
	let structured = &result["structuredContent"];
	assert_eq!(structured["content"], "hello");
	assert_eq!(structured["truncated"], true);
	assert_eq!(structured["size"], 11);
}

#[test]
fn read_multiple_files_reports_failures_inline() {
	let root = tempfile::tempdir().expect("tempdir");
	write_text(&root.path().join("a.txt"), "A");
	let mut client = RpcClient::spawn(root.path(), &[]);
	let result = client.call("read_multiple_files", json!({ "paths": ["a.txt", "missing.txt", "/etc/passwd"] }));
	let files = result["structuredContent"]["files"].as_array().expect("files");
	assert_eq!(files.len(), 3);
	assert_eq!(files[0]["content"], "A");
	assert_eq!(files[1]["code"], "NOT_FOUND");
	assert_eq!(files[2]["code"], "ACCESS_DENIED");
}

#[test]
fn paths_outside_roots_are_denied() {
	let root = tempfile::tempdir().expect("tempdir");
	let outside = tempfile::tempdir().expect("tempdir");
	write_text(&outside.path().join("secret.txt"), "secret");
	let mut client = RpcClient::spawn(root.path(), &[]);
	let result = client.call("read_file", json!({ "path": "../secret.txt" }));
	assert_eq!(error_code(&result), "ACCESS_DENIED");
	let target = outside.path().join("secret.txt");
	let result = client.call("read_file", json!({ "path": target.to_str().expect("utf8") }));
	assert_eq!(error_code(&result), "ACCESS_DENIED");
}

#[cfg(unix)]
#[test]
fn symlink_escaping_roots_is_denied() {
	let root = tempfile::tempdir().expect("tempdir");
	let outside = tempfile::tempdir().expect("tempdir");
	write_text(&outside.path().join("secret.txt"), "secret");
	std::os::unix::fs::symlink(outside.path().join("secret.txt"), root.path().join("link.txt")).expect("symlink");
	let mut client = RpcClient::spawn(root.path(), &[]);
	let result = client.call("read_file", json!({ "path": "link.txt" }));
	assert_eq!(error_code(&result), "ACCESS_DENIED");
}

#[cfg(unix)]
#[test]
fn symlinked_root_resolves_to_target() {
	let holder = tempfile::tempdir().expect("tempdir");
	let real = holder.path().join("real");
	write_text(&real.join("inside.txt"), "inside");
	let link = holder.path().join("link");
	std::os::unix::fs::symlink(&real, &link).expect("symlink");
	let mut client = RpcClient::spawn(&link, &[]);
	let result = client.call("read_file", json!({ "path": link.join("inside.txt").to_str().expect("utf8") }));
	assert_eq!(result["structuredContent"]["content"], "inside");
	let result = client.call("list_allowed_directories", json!({}));
	let dirs = result["structuredContent"]["directories"].as_array().expect("dirs");
	let canonical = std::fs::canonicalize(&real).expect("canon");
	assert!(dirs.iter().any(|dir| dir.as_str() == canonical.to_str()));
}

#[test]
fn search_respects_depth_and_result_bounds() {
	let root = tempfile::tempdir().expect("tempdir");
	write_text(&root.path().join("note-1.txt"), "");
	write_text(&root.path().join("note-2.txt"), "");
	write_text(&root.path().join("note-3.txt"), "");
	write_text(&root.path().join("a/b/c/note-deep.txt"), "");
	let mut client = RpcClient::spawn(root.path(), &[]);
	let result = client.call("search_files", json!({ "path": ".", "pattern": "NOTE", "maxResults": 2 }));
	assert_eq!(result["structuredContent"]["count"], 2);
	let result = client.call("search_files", json!({ "path": ".", "pattern": "deep" }));
	assert_eq!(result["structuredContent"]["count"], 0);
	let result = client.call("search_files", json!({ "path": ".", "pattern": "deep", "maxDepth": 4 }));
	assert_eq!(result["structuredContent"]["count"], 1);
	let result = client.call("search_files", json!({ "path": ".", "pattern": "x", "maxDepth": 0 }));
	assert_eq!(error_code(&result), "INVALID_ARGUMENT");
}

#[test]
fn find_by_extension_honors_excludes() {
	let root = tempfile::tempdir().expect("tempdir");
	write_text(&root.path().join("main.RS"), "");
	write_text(&root.path().join("target/out.rs"), "");
	write_text(&root.path().join("readme.md"), "");
	let mut client = RpcClient::spawn(root.path(), &[]);
	let result = client.call(
		"find_files_by_extension",
		json!({ "path": ".", "extension": ".rs", "excludePatterns": ["target"] })
	);
	let matches = result["structuredContent"]["matches"].as_array().expect("matches");
	assert_eq!(matches.len(), 1);
	assert!(matches[0].as_str().expect("path").ends_with("main.RS"));
}

#[test]
fn directory_tree_marks_children() {
	let root = tempfile::tempdir().expect("tempdir");
	write_text(&root.path().join("src/lib.rs"), "");
	write_text(&root.path().join("Cargo.toml"), "");
	std::fs::create_dir_all(root.path().join("empty")).expect("mkdir");
	let mut client = RpcClient::spawn(root.path(), &[]);
	let result = client.call("directory_tree", json!({ "path": "." }));
	let tree = result["structuredContent"]["tree"].as_array().expect("tree");
	let names: Vec<&str> = tree.iter().filter_map(|node| node["name"].as_str()).collect();
	assert_eq!(names, vec!["Cargo.toml", "empty", "src"]);
	assert!(tree[0].get("children").is_none());
	assert_eq!(tree[1]["children"], json!([]));
	assert_eq!(tree[2]["children"][0]["name"], "lib.rs");
}

#[test]
fn regex_search_reports_line_numbers() {
	let root = tempfile::tempdir().expect("tempdir");
	write_text(&root.path().join("a.log"), "ok\nERROR one\nok\nERROR two\n");
	write_text(&root.path().join("b.txt"), "ERROR elsewhere\n");
	let mut client = RpcClient::spawn(root.path(), &[]);
	let result = client.call(
		"regex_search_content",
		json!({ "path": ".", "regex": "^ERROR", "filePattern": "*.log" })
	);
	let files = result["structuredContent"]["files"].as_array().expect("files");
	assert_eq!(files.len(), 1);
	let lines: Vec<u64> = files[0]["matches"]
		.as_array()
		.expect("matches")
		.iter()
		.filter_map(|m| m["lineNumber"].as_u64())
		.collect();
	assert_eq!(lines, vec![2, 4]);
	let bad = client.call("regex_search_content", json!({ "path": ".", "regex": "(" }));
	assert_eq!(error_code(&bad), "INVALID_ARGUMENT");
}

#[test]
fn create_move_rename_delete_lifecycle() {
	let root = tempfile::tempdir().expect("tempdir");
	let mut client = RpcClient::spawn(root.path(), &["--full-access"]);
	let result = client.call("create_directory", json!({ "path": "a/b" }));
	assert!(result.get("isError").is_none(), "{}", result);
	let result = client.call("create_file", json!({ "path": "a/b/one.txt", "content": "1" }));
	assert!(result.get("isError").is_none(), "{}", result);
	let again = client.call("create_file", json!({ "path": "a/b/one.txt", "content": "2" }));
	assert_eq!(error_code(&again), "ALREADY_EXISTS");
	let orphan = client.call("create_file", json!({ "path": "nope/one.txt", "content": "1" }));
	assert_eq!(error_code(&orphan), "PARENT_MISSING");

	let result = client.call("move_file", json!({ "source": "a/b/one.txt", "destination": "a/moved.txt" }));
	assert!(result.get("isError").is_none(), "{}", result);
	assert!(root.path().join("a/moved.txt").exists());
	let result = client.call("rename_file", json!({ "path": "a/moved.txt", "newName": "renamed.txt" }));
	assert!(result.get("isError").is_none(), "{}", result);
	assert!(root.path().join("a/renamed.txt").exists());
	let bad = client.call("rename_file", json!({ "path": "a/renamed.txt", "newName": "../x.txt" }));
	assert_eq!(error_code(&bad), "INVALID_ARGUMENT");

	let result = client.call("delete_directory", json!({ "path": "a" }));
	assert_eq!(error_code(&result), "NOT_EMPTY");
	let result = client.call("delete_directory", json!({ "path": "a", "recursive": true }));
	assert!(result.get("isError").is_none(), "{}", result);
	assert!(!root.path().join("a").exists());
	let root_path = root.path().to_str().expect("utf8");
	let result = client.call("delete_directory", json!({ "path": root_path, "recursive": true }));
	assert_eq!(error_code(&result), "ACCESS_DENIED");
	assert!(root.path().exists());
}

#[test]
fn modify_file_requires_existing_file() {
	let root = tempfile::tempdir().expect("tempdir");
	write_text(&root.path().join("f.txt"), "old");
	let mut client = RpcClient::spawn(root.path(), &["--allow-edit"]);
	let result = client.call("modify_file", json!({ "path": "f.txt", "content": "new" }));
	assert!(result.get("isError").is_none(), "{}", result);
	assert_eq!(std::fs::read_to_string(root.path().join("f.txt")).expect("read"), "new");
	let missing = client.call("modify_file", json!({ "path": "g.txt", "content": "new" }));
	assert_eq!(error_code(&missing), "NOT_FOUND");
}

#[test]
fn get_permissions_reflects_flags() {
	let first = tempfile::tempdir().expect("tempdir");
	let second = tempfile::tempdir().expect("tempdir");
	let mut client = RpcClient::spawn_roots(&[first.path(), second.path()], &["--allow-create", "--no-follow-symlinks"]);
	let result = client.call("get_permissions", json!({}));
	let structured = &result["structuredContent"];
	assert_eq!(structured["create"], true);
	assert_eq!(structured["delete"], false);
	assert_eq!(structured["followSymlinks"], false);
	assert_eq!(structured["allowedDirectoryCount"], 2);
	let text = result["content"][0]["text"].as_str().expect("text");
	assert!(text.contains("2 allowed directories"));
}

#[test]
fn json_tools_query_documents() {
	let root = tempfile::tempdir().expect("tempdir");
	write_text(
		&root.path().join("data.json"),
		r#"{"users": [{"name": "ann", "age": 31}, {"name": "bob", "age": 17}, {"name": "cy", "age": 45}]}"#
	);
	write_text(&root.path().join("people.json"), r#"[{"name": "ann", "age": 31}, {"name": "cy", "age": 45}]"#);
	write_text(
		&root.path().join("schema.json"),
		r#"{"type": "object", "required": ["users"]}"#
	);
	let mut client = RpcClient::spawn(root.path(), &[]);
	let result = client.call("json_get_value", json!({ "path": "data.json", "field": "users[1].name" }));
	assert_eq!(result["structuredContent"]["value"], "bob");
	let result = client.call(
		"json_filter",
		json!({
			"path": "data.json",
			"arrayPath": "users",
			"conditions": [{ "field": "age", "operator": "gte", "value": 30 }]
		})
	);
	assert_eq!(result["structuredContent"]["count"], 2);
	let result = client.call(
		"json_transform",
		json!({
			"path": "people.json",
			"operations": [
				{ "type": "sort", "field": "age", "order": "desc" },
				{ "type": "pick", "fields": ["name"] }
			]
		})
	);
	assert_eq!(result["structuredContent"]["result"][0], json!({ "name": "cy" }));
	let result = client.call("json_validate", json!({ "path": "data.json", "schemaPath": "schema.json" }));
	assert_eq!(result["structuredContent"]["isValid"], true);
	let result = client.call("json_get_value", json!({ "path": "data.json", "field": "users", "maxBytes": 4 }));
	assert_eq!(error_code(&result), "SIZE_EXCEEDED");
}

#[test]
fn json_search_kv_finds_matching_files() {
	let root = tempfile::tempdir().expect("tempdir");
	write_text(&root.path().join("a.json"), r#"{"service": {"name": "api"}}"#);
	write_text(&root.path().join("b.json"), r#"{"name": "web"}"#);
	write_text(&root.path().join("broken.json"), "{");
	let mut client = RpcClient::spawn(root.path(), &[]);
	let result = client.call("json_search_kv", json!({ "directoryPath": ".", "key": "name", "value": "api" }));
	let files = result["structuredContent"]["files"].as_array().expect("files");
	assert_eq!(files.len(), 1);
	assert_eq!(files[0]["matches"], json!(["service.name"]));
}

#[cfg(unix)]
#[test]
fn get_file_info_reports_symlinks() {
	let root = tempfile::tempdir().expect("tempdir");
	write_text(&root.path().join("target.txt"), "t");
	std::os::unix::fs::symlink(root.path().join("target.txt"), root.path().join("link.txt")).expect("symlink");
	let mut client = RpcClient::spawn(root.path(), &[]);
	let result = client.call("get_file_info", json!({ "path": "link.txt" }));
	assert_eq!(result["structuredContent"]["isSymlink"], true);
	assert_eq!(result["structuredContent"]["isFile"], true);
	let result = client.call("get_file_info", json!({ "path": "target.txt" }));
	assert_eq!(result["structuredContent"]["isSymlink"], false);
}

#[cfg(unix)]
#[test]
fn cross_device_move_keeps_escaping_symlink_a_link() {
	use std::os::unix::fs::MetadataExt;
	let shm = Path::new("/dev/shm");
	if !shm.is_dir() {
		return;
	}
	let root = tempfile::tempdir().expect("tempdir");
	let other = match tempfile::tempdir_in(shm) {
		Ok(dir) => dir,
		Err(_) => return,
	};
	let same_device = std::fs::metadata(root.path()).expect("stat").dev() == std::fs::metadata(other.path()).expect("stat").dev();
	if same_device {
		return;
	}
	let outside = tempfile::tempdir().expect("tempdir");
	write_text(&outside.path().join("secret.txt"), "secret");
	write_text(&root.path().join("bundle/plain.txt"), "plain");
	std::os::unix::fs::symlink(outside.path().join("secret.txt"), root.path().join("bundle/leak")).expect("symlink");
	let mut client = RpcClient::spawn_roots(&[root.path(), other.path()], &["--allow-move"]);
	let destination = other.path().join("bundle");
	let result = client.call(
		"move_file",
		json!({
			"source": root.path().join("bundle").to_str().expect("utf8"),
			"destination": destination.to_str().expect("utf8")
		})
	);
	assert!(result.get("isError").is_none(), "{}", result);
	assert!(!root.path().join("bundle").exists());
	assert_eq!(std::fs::read_to_string(destination.join("plain.txt")).expect("read"), "plain");
	let moved = std::fs::symlink_metadata(destination.join("leak")).expect("lstat");
	assert!(moved.file_type().is_symlink());
	let result = client.call("read_file", json!({ "path": destination.join("leak").to_str().expect("utf8") }));
	assert_eq!(error_code(&result), "ACCESS_DENIED");
}

#[test]
fn json_query_evaluates_jsonpath() {
	let root = tempfile::tempdir().expect("tempdir");
	write_text(
		&root.path().join("data.json"),
		r#"{"users": [{"name": "ann", "age": 31}, {"name": "bob", "age": 17}]}"#
	);
	let mut client = RpcClient::spawn(root.path(), &[]);
	let result = client.call("json_query", json!({ "path": "data.json", "query": "$.users[*].name" }));
	assert_eq!(result["structuredContent"]["result"], json!(["ann", "bob"]));
	let result = client.call("json_query", json!({ "path": "data.json", "query": "$.users[?@.age < 18].name" }));
	assert_eq!(result["structuredContent"]["result"], "bob");
	let result = client.call("json_query", json!({ "path": "data.json", "query": "$.users[" }));
	assert_eq!(error_code(&result), "INVALID_ARGUMENT");
	let result = client.call("json_query", json!({ "path": "data.json", "query": "$", "maxBytes": 8 }));
	assert_eq!(error_code(&result), "SIZE_EXCEEDED");
}

#[test]
fn xml_tools_query_and_describe_documents() {
	let root = tempfile::tempdir().expect("tempdir");
	write_text(
		&root.path().join("feed.xml"),
		r#"<feed><entry id="1"><title>one</title></entry><entry id="2"><title>two</title></entry></feed>"#
	);
	let mut client = RpcClient::spawn(root.path(), &[]);
	let result = client.call("xml_query", json!({ "path": "feed.xml", "query": "//entry/title" }));
	let results = result["structuredContent"]["results"].as_array().expect("results");
	assert_eq!(results.len(), 2);
	assert_eq!(results[1], json!({ "type": "element", "name": "title", "value": "two" }));
	let result = client.call("xml_query", json!({ "path": "feed.xml", "structureOnly": true }));
	assert_eq!(result["structuredContent"]["tags"], json!(["feed", "entry", "title"]));
	assert_eq!(result["structuredContent"]["count"], 5);
	let result = client.call("xml_query", json!({ "path": "feed.xml" }));
	assert_eq!(error_code(&result), "INVALID_ARGUMENT");
	let result = client.call("xml_structure", json!({ "path": "feed.xml", "maxDepth": 1 }));
	let structure = &result["structuredContent"]["structure"];
	assert_eq!(structure["rootElement"], "feed");
	assert_eq!(structure["elements"]["entry"], 2);
	assert_eq!(structure["attributes"]["entry@id"], 2);
	assert_eq!(structure["hierarchy"]["children"], json!([{ "name": "entry", "hasChildren": true }]));
	let result = client.call("xml_to_json_string", json!({ "xmlPath": "feed.xml", "options": { "preserveOrder": false } }));
	assert_eq!(result["structuredContent"]["result"]["feed"]["entry"][1]["title"], "two");
	assert_eq!(result["structuredContent"]["result"]["feed"]["entry"][0]["@_id"], "1");
}

#[test]
fn xml_to_json_needs_create_then_edit() {
	let root = tempfile::tempdir().expect("tempdir");
	write_text(&root.path().join("in.xml"), r#"<r><v>1</v></r>"#);
	let mut plain = RpcClient::spawn(root.path(), &[]);
	assert!(!plain.tool_names().contains(&"xml_to_json".to_string()));
	let result = plain.call("xml_to_json", json!({ "xmlPath": "in.xml", "jsonPath": "out/r.json" }));
	assert_eq!(error_code(&result), "PERMISSION_NOT_GRANTED");
	assert!(!root.path().join("out").exists());

	let mut creator = RpcClient::spawn(root.path(), &["--allow-create"]);
	let result = creator.call(
		"xml_to_json",
		json!({ "xmlPath": "in.xml", "jsonPath": "out/r.json", "options": { "preserveOrder": false, "format": false } })
	);
	assert!(result.get("isError").is_none(), "{}", result);
	assert_eq!(result["structuredContent"]["created"], true);
	assert_eq!(std::fs::read_to_string(root.path().join("out/r.json")).expect("read"), r#"{"r":{"v":"1"}}"#);
	let again = creator.call("xml_to_json", json!({ "xmlPath": "in.xml", "jsonPath": "out/r.json" }));
	assert_eq!(error_code(&again), "PERMISSION_NOT_GRANTED");

	let mut editor = RpcClient::spawn(root.path(), &["--allow-edit"]);
	let result = editor.call("xml_to_json", json!({ "xmlPath": "in.xml", "jsonPath": "out/r.json" }));
	assert!(result.get("isError").is_none(), "{}", result);
	assert_eq!(result["structuredContent"]["created"], false);
	let escaped = editor.call("xml_to_json", json!({ "xmlPath": "in.xml", "jsonPath": "../escape.json" }));
	assert_eq!(error_code(&escaped), "ACCESS_DENIED");
}
