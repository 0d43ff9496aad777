//! Bundled workers

pub mod shell_exec;

pub use shell_exec::ShellExec;
