//! Renders the single-file provisioning script uploaded to the build host.
//!
//! Local text files are transcribed into `echo $'...' >> <dest>` lines so the
//! remote shell can rebuild them without a separate file transfer. Inside
//! ANSI-C quoting only backslashes and single quotes need escaping, which
//! keeps the transform lossless for any line of text.

use std::fmt::Write as _;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;
use tracing::debug;

/// Remote directory the script starts in.
pub const DEFAULT_REMOTE_ROOT: &str = "/usr/local/src";

/// Directory (relative to the remote root) that receives the transcribed files.
pub const BOOTSTRAP_DIR: &str = "bootstrap";

/// Entry point executed from the bootstrap directory.
pub const ENTRYPOINT: &str = "main.sh";

/// Local inputs for [`render_script`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScriptInputs {
    /// Folder whose contents become `bootstrap/` on the remote host.
    pub script_folder: Utf8PathBuf,
    /// File copied to `bootstrap/config.sh`.
    pub config_file: Utf8PathBuf,
    /// File copied to `bootstrap/repo.sh`.
    pub repo_file: Utf8PathBuf,
    /// Remote directory the script starts in.
    pub remote_root: String,
}

/// Errors raised while rendering the script.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScriptError {
    /// Raised when a local file or folder cannot be read.
    #[error("failed to read {path}: {message}")]
    Io {
        /// Path that failed.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a path has no usable file name.
    #[error("invalid script input path: {path}")]
    InvalidPath {
        /// Offending path.
        path: Utf8PathBuf,
    },
}

/// Renders the complete provisioning script.
///
/// # Errors
///
/// Returns [`ScriptError`] when any input cannot be read as UTF-8 text.
pub fn render_script(inputs: &ScriptInputs) -> Result<String, ScriptError> {
    let mut out = String::new();
    push_line(&mut out, &format!("cd {}", inputs.remote_root));
    write_folder_commands(&inputs.script_folder, BOOTSTRAP_DIR, &mut out)?;
    write_file_commands(
        &inputs.config_file,
        &format!("{BOOTSTRAP_DIR}/config.sh"),
        true,
        &mut out,
    )?;
    write_file_commands(
        &inputs.repo_file,
        &format!("{BOOTSTRAP_DIR}/repo.sh"),
        true,
        &mut out,
    )?;
    push_line(
        &mut out,
        &format!("cd {}/{BOOTSTRAP_DIR}", inputs.remote_root.trim_end_matches('/')),
    );
    push_line(&mut out, &format!("bash {ENTRYPOINT}"));
    Ok(out)
}

/// Appends commands that recreate the local folder `source` at `dest`.
///
/// Sub-directories and files are visited in name order so the output is
/// deterministic.
///
/// # Errors
///
/// Returns [`ScriptError`] when the folder or one of its files cannot be read.
pub fn write_folder_commands(
    source: &Utf8Path,
    dest: &str,
    out: &mut String,
) -> Result<(), ScriptError> {
    let dir = Dir::open_ambient_dir(source, ambient_authority()).map_err(|err| io_error(source, &err))?;
    push_line(out, &format!("mkdir -p {}", normalise(dest)));
    write_dir_entries(&dir, source, dest, out)
}

fn write_dir_entries(
    dir: &Dir,
    local: &Utf8Path,
    dest: &str,
    out: &mut String,
) -> Result<(), ScriptError> {
    let mut files = Vec::new();
    let mut folders = Vec::new();
    for entry in dir.entries().map_err(|err| io_error(local, &err))? {
        let item = entry.map_err(|err| io_error(local, &err))?;
        let name = item.file_name().map_err(|err| io_error(local, &err))?;
        let kind = item.file_type().map_err(|err| io_error(local, &err))?;
        if kind.is_dir() {
            folders.push(name);
        } else {
            files.push(name);
        }
    }
    files.sort();
    folders.sort();

    for name in &files {
        let contents = dir
            .read_to_string(name)
            .map_err(|err| io_error(&local.join(name), &err))?;
        write_text_commands(&contents, &format!("{dest}/{name}"), true, out);
    }

    for name in &folders {
        let nested_dest = format!("{dest}/{name}");
        push_line(out, &format!("mkdir -p {}", normalise(&nested_dest)));
        let nested = dir
            .open_dir(name)
            .map_err(|err| io_error(&local.join(name), &err))?;
        write_dir_entries(&nested, &local.join(name), &nested_dest, out)?;
    }
    Ok(())
}

/// Appends commands that recreate the local file `source` at `dest`.
///
/// # Errors
///
/// Returns [`ScriptError`] when the file cannot be read as UTF-8 text.
pub fn write_file_commands(
    source: &Utf8Path,
    dest: &str,
    mark_executable: bool,
    out: &mut String,
) -> Result<(), ScriptError> {
    let parent = source.parent().unwrap_or_else(|| Utf8Path::new("."));
    let parent_dir = if parent.as_str().is_empty() {
        Utf8Path::new(".")
    } else {
        parent
    };
    let file_name = source.file_name().ok_or_else(|| ScriptError::InvalidPath {
        path: source.to_path_buf(),
    })?;
    let dir =
        Dir::open_ambient_dir(parent_dir, ambient_authority()).map_err(|err| io_error(parent_dir, &err))?;
    let contents = dir
        .read_to_string(file_name)
        .map_err(|err| io_error(source, &err))?;
    write_text_commands(&contents, dest, mark_executable, out);
    Ok(())
}

/// Appends the `echo` lines for `contents` followed by the bookkeeping
/// commands for `dest`.
pub fn write_text_commands(contents: &str, dest: &str, mark_executable: bool, out: &mut String) {
    let target = normalise(dest);
    debug!(dest = %target, "transcribing file");
    for line in contents.lines() {
        push_line(
            out,
            &format!("echo $'{}' >> {target}", escape_line(line.trim_end())),
        );
    }
    if mark_executable {
        push_line(out, &format!("chmod +x {target}"));
    }
    push_line(out, &format!("echo \"finished writing {target}\""));
    push_line(out, &format!("du -sh {target}"));
}

/// Escapes a line for use inside `$'...'`.
#[must_use]
pub fn escape_line(line: &str) -> String {
    line.replace('\\', "\\\\").replace('\'', "\\'")
}

fn normalise(path: &str) -> String {
    path.replace('\\', "/")
}

fn push_line(out: &mut String, line: &str) {
    // Writing to a String cannot fail.
    writeln!(out, "{line}").ok();
}

fn io_error(path: &Utf8Path, err: &std::io::Error) -> ScriptError {
    ScriptError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}
