use crate::error::FsError;
use serde::Serialize;

/// Mutating operation kinds. Reads never consult the gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
	Create,
	Edit,
	Move,
	Rename,
	Delete,
}

impl Operation {
	pub fn flag(self) -> &'static str {
		match self {
			Operation::Create => "create",
			Operation::Edit => "edit",
			Operation::Move => "move",
			Operation::Rename => "rename",
			Operation::Delete => "delete",
		}
	}
}

/// Flags requested at startup, before readonly/full-access are folded in.
#[derive(Clone, Debug, Default)]
pub struct PermissionFlags {
	pub read_only: bool,
	pub full_access: bool,
	pub allow_create: bool,
	pub allow_edit: bool,
	pub allow_move: bool,
	pub allow_delete: bool,
	pub allow_rename: bool,
	pub follow_symlinks: bool,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Permissions {
	pub create: bool,
	pub edit: bool,
	#[serde(rename = "move")]
	pub relocate: bool,
	pub delete: bool,
	pub rename: bool,
	pub full_access: bool,
	pub read_only: bool,
	pub follow_symlinks: bool,
}

impl Permissions {
	/// readonly wins over everything; full access grants every kind.
	pub fn from_flags(flags: &PermissionFlags) -> Self {
		let granted = |flag: bool| !flags.read_only && (flags.full_access || flag);
		Self {
			create: granted(flags.allow_create),
			edit: granted(flags.allow_edit),
			relocate: granted(flags.allow_move),
			delete: granted(flags.allow_delete),
			rename: granted(flags.allow_rename),
			full_access: !flags.read_only && flags.full_access,
			read_only: flags.read_only,
			follow_symlinks: flags.follow_symlinks,
		}
	}

	pub fn granted(&self) -> Vec<&'static str> {
		[Operation::Create, Operation::Edit, Operation::Move, Operation::Rename, Operation::Delete]
			.into_iter()
			.filter(|op| is_allowed(*op, self))
			.map(Operation::flag)
			.collect()
	}
}

pub fn is_allowed(op: Operation, permissions: &Permissions) -> bool {
	if permissions.read_only {
		return false;
	}
	if permissions.full_access {
		return true;
	}
	match op {
		Operation::Create => permissions.create,
		Operation::Edit => permissions.edit,
		Operation::Move => permissions.relocate,
		Operation::Rename => permissions.rename,
		Operation::Delete => permissions.delete,
	}
}

/// Gate for mutating tools; `action` reads as "cannot {action}".
pub fn require(op: Operation, permissions: &Permissions, action: &'static str) -> Result<(), FsError> {
	if is_allowed(op, permissions) {
		return Ok(());
	}
	Err(FsError::PermissionNotGranted {
		action,
		flag: op.flag(),
	})
}
