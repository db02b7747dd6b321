// Copyright (c) 2025-2026 QX Contributors
//
// SPDX-License-Identifier: Apache-2.0
pub mod approval;
pub mod builtin;
pub mod dispatch;
pub mod permissions;
pub mod registry;
pub mod tool;
pub mod validate;

pub use approval::{ApprovalGate, ApprovalPrompt, ApprovalRequest, ApprovalStatus, ScriptedPrompt};
pub use dispatch::Dispatcher;
pub use permissions::{CommandPermission, CommandPermissions};
pub use registry::{ToolRegistry, ToolSchema};
pub use tool::{schema_for, ConsoleSink, NullSink, Tool, ToolCall, ToolOutput};

pub use builtin::execute_shell::ExecuteShellTool;
pub use builtin::read_file::ReadFileTool;
pub use builtin::web_fetch::WebFetchTool;
pub use builtin::write_file::WriteFileTool;
