use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use codebox_server::files;
use codebox_server::runtime::{
    ContainerRuntime, ContainerState, ExecOutput, ResourceLimits, RuntimeError,
};
use parking_lot::Mutex;
use std::collections::HashMap;

fn ok(stdout: String) -> ExecOutput {
    ExecOutput {
        stdout,
        stderr: String::new(),
        exit_code: 0,
    }
}

fn fail(stderr: &str) -> ExecOutput {
    ExecOutput {
        stdout: String::new(),
        stderr: stderr.to_string(),
        exit_code: 1,
    }
}

/// Interprets the exact command shapes the file layer emits against an
/// in-memory filesystem, so the base64 write path is exercised for real.
#[derive(Default)]
struct ExecFs {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl ExecFs {
    fn interpret(&self, argv: &[String], stdin: Option<&[u8]>) -> ExecOutput {
        let args: Vec<&str> = argv.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["stat", "-c", "%s", path] => match self.files.lock().get(*path) {
                Some(content) => ok(format!("{}\n", content.len())),
                None => fail("stat: No such file or directory"),
            },
            ["stat", "-c", "%F %s", path] => match self.files.lock().get(*path) {
                Some(content) => ok(format!("regular file {}\n", content.len())),
                None => fail("stat: No such file or directory"),
            },
            ["cat", path] => match self.files.lock().get(*path) {
                Some(content) => ok(String::from_utf8_lossy(content).to_string()),
                None => fail("cat: No such file or directory"),
            },
            ["mkdir", "-p", _] => ok(String::new()),
            ["rm", "-f", path] => {
                self.files.lock().remove(*path);
                ok(String::new())
            }
            ["mv", from, to] => {
                let mut files = self.files.lock();
                match files.remove(*from) {
                    Some(content) => {
                        files.insert(to.to_string(), content);
                        ok(String::new())
                    }
                    None => fail("mv: No such file or directory"),
                }
            }
            ["find", root, "-type", "f", "-o", "-type", "d"] => {
                let files = self.files.lock();
                let mut listing: Vec<&String> = files
                    .keys()
                    .filter(|path| path.starts_with(*root))
                    .collect();
                listing.sort();
                ok(listing
                    .into_iter()
                    .map(|path| format!("{path}\n"))
                    .collect())
            }
            ["sh", "-c", script] => {
                // The write path pipes base64 through `base64 -d > '<path>'`.
                let Some(rest) = script.strip_prefix("base64 -d > ") else {
                    return fail("sh: unsupported script");
                };
                let path = rest
                    .trim()
                    .trim_start_matches('\'')
                    .trim_end_matches('\'')
                    .replace(r"'\''", "'");
                let Some(encoded) = stdin else {
                    return fail("sh: missing stdin");
                };
                match BASE64.decode(String::from_utf8_lossy(encoded).trim()) {
                    Ok(decoded) => {
                        self.files.lock().insert(path, decoded);
                        ok(String::new())
                    }
                    Err(_) => fail("base64: invalid input"),
                }
            }
            _ => fail("unsupported command"),
        }
    }
}

#[async_trait]
impl ContainerRuntime for ExecFs {
    async fn ping(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn create_container(
        &self,
        _name: &str,
        _image: &str,
        _limits: ResourceLimits,
        _workdir: &str,
        _uid: u32,
        _env: &HashMap<String, String>,
    ) -> Result<String, RuntimeError> {
        Ok("fs".to_string())
    }

    async fn inspect(&self, handle: &str) -> Result<ContainerState, RuntimeError> {
        Ok(ContainerState {
            id: handle.to_string(),
            running: true,
        })
    }

    async fn exec(
        &self,
        _handle: &str,
        argv: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput, RuntimeError> {
        Ok(self.interpret(argv, stdin))
    }

    async fn stop(&self, _handle: &str, _grace_secs: u64) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn remove(&self, _handle: &str, _with_volumes: bool) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn attach_network(&self, _handle: &str, _network: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn detach_network(&self, _handle: &str, _network: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn ensure_network(&self, _network: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn list_containers(&self, _name_prefix: &str) -> Result<Vec<String>, RuntimeError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn write_then_read_is_byte_identical_for_hostile_text() {
    let fs = ExecFs::default();
    // Quotes, metacharacters, and embedded newlines must survive intact.
    let content = "print('hi $USER')\n# `backticks` \"double\" && ; | > <\nsecond line\n";

    files::write_file(&fs, "fs", "/workspace/app/main.py", content.as_bytes())
        .await
        .unwrap();
    let read = files::read_file(&fs, "fs", "/workspace/app/main.py")
        .await
        .unwrap();
    assert_eq!(read, content.as_bytes());
}

#[tokio::test]
async fn rename_delete_and_tree_reflect_operations() {
    let fs = ExecFs::default();
    files::write_file(&fs, "fs", "/workspace/a.txt", b"one")
        .await
        .unwrap();
    files::write_file(&fs, "fs", "/workspace/sub/b.txt", b"two")
        .await
        .unwrap();

    files::rename_file(&fs, "fs", "/workspace/a.txt", "/workspace/sub/a.txt")
        .await
        .unwrap();
    assert!(files::read_file(&fs, "fs", "/workspace/a.txt").await.is_err());
    assert_eq!(
        files::read_file(&fs, "fs", "/workspace/sub/a.txt")
            .await
            .unwrap(),
        b"one"
    );

    let tree = files::list_tree(&fs, "fs", "/workspace").await.unwrap();
    let paths: Vec<&str> = tree.iter().map(|entry| entry.path.as_str()).collect();
    assert_eq!(paths, vec!["/workspace/sub/a.txt", "/workspace/sub/b.txt"]);
    assert!(tree.iter().all(|entry| !entry.is_dir));

    files::delete_file(&fs, "fs", "/workspace/sub/b.txt")
        .await
        .unwrap();
    assert!(files::read_file(&fs, "fs", "/workspace/sub/b.txt")
        .await
        .is_err());
}
