// 容器内文件一次性操作：写入走 base64 管道，避免任意文本被 shell 转义破坏。
use crate::runtime::{ContainerRuntime, ExecOutput, RuntimeError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
}

fn expect_ok(output: ExecOutput) -> Result<ExecOutput, RuntimeError> {
    if output.exit_code != 0 {
        return Err(RuntimeError::ExecFailed {
            exit_code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        });
    }
    Ok(output)
}

fn parent_dir(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    if idx == 0 {
        Some("/")
    } else {
        Some(&trimmed[..idx])
    }
}

/// Read: `stat` for existence/size, then `cat` for the bytes.
pub async fn read_file(
    runtime: &dyn ContainerRuntime,
    handle: &str,
    path: &str,
) -> Result<Vec<u8>, RuntimeError> {
    expect_ok(
        runtime
            .exec(
                handle,
                &["stat".into(), "-c".into(), "%s".into(), path.into()],
                None,
            )
            .await?,
    )?;
    let output = expect_ok(
        runtime
            .exec(handle, &["cat".into(), path.into()], None)
            .await?,
    )?;
    Ok(output.stdout.into_bytes())
}

/// Write: ensure the parent exists, then pipe base64 through `base64 -d`
/// into the target. Content never touches a shell-quoted argument.
pub async fn write_file(
    runtime: &dyn ContainerRuntime,
    handle: &str,
    path: &str,
    content: &[u8],
) -> Result<(), RuntimeError> {
    if let Some(parent) = parent_dir(path) {
        expect_ok(
            runtime
                .exec(
                    handle,
                    &["mkdir".into(), "-p".into(), parent.into()],
                    None,
                )
                .await?,
        )?;
    }
    let encoded = BASE64.encode(content);
    let script = format!("base64 -d > {}", shell_quote(path));
    expect_ok(
        runtime
            .exec(
                handle,
                &["sh".into(), "-c".into(), script],
                Some(encoded.as_bytes()),
            )
            .await?,
    )?;
    Ok(())
}

pub async fn delete_file(
    runtime: &dyn ContainerRuntime,
    handle: &str,
    path: &str,
) -> Result<(), RuntimeError> {
    expect_ok(
        runtime
            .exec(handle, &["rm".into(), "-f".into(), path.into()], None)
            .await?,
    )?;
    Ok(())
}

pub async fn rename_file(
    runtime: &dyn ContainerRuntime,
    handle: &str,
    from: &str,
    to: &str,
) -> Result<(), RuntimeError> {
    if let Some(parent) = parent_dir(to) {
        expect_ok(
            runtime
                .exec(
                    handle,
                    &["mkdir".into(), "-p".into(), parent.into()],
                    None,
                )
                .await?,
        )?;
    }
    expect_ok(
        runtime
            .exec(handle, &["mv".into(), from.into(), to.into()], None)
            .await?,
    )?;
    Ok(())
}

/// Directory listing: `find` for the paths, `stat` per entry for type and
/// size. One exec per entry is fine at workspace scale.
pub async fn list_tree(
    runtime: &dyn ContainerRuntime,
    handle: &str,
    root: &str,
) -> Result<Vec<FileEntry>, RuntimeError> {
    let output = expect_ok(
        runtime
            .exec(
                handle,
                &[
                    "find".into(),
                    root.into(),
                    "-type".into(),
                    "f".into(),
                    "-o".into(),
                    "-type".into(),
                    "d".into(),
                ],
                None,
            )
            .await?,
    )?;
    let mut entries = Vec::new();
    for line in output.stdout.lines() {
        let path = line.trim();
        if path.is_empty() || path == root {
            continue;
        }
        let stat = runtime
            .exec(
                handle,
                &["stat".into(), "-c".into(), "%F %s".into(), path.into()],
                None,
            )
            .await?;
        if stat.exit_code != 0 {
            // Entry vanished between find and stat.
            continue;
        }
        let text = stat.stdout.trim();
        let is_dir = text.starts_with("directory");
        let size = text
            .rsplit(' ')
            .next()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0);
        entries.push(FileEntry {
            path: path.to_string(),
            is_dir,
            size,
        });
    }
    Ok(entries)
}

fn shell_quote(path: &str) -> String {
    // Single-quote, escaping embedded single quotes.
    format!("'{}'", path.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_dir_handles_nested_and_root_paths() {
        assert_eq!(parent_dir("/workspace/a/b.txt"), Some("/workspace/a"));
        assert_eq!(parent_dir("/workspace"), Some("/"));
        assert_eq!(parent_dir("relative.txt"), None);
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("/tmp/plain.txt"), "'/tmp/plain.txt'");
        assert_eq!(shell_quote("/tmp/it's.txt"), r"'/tmp/it'\''s.txt'");
    }
}
