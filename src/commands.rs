// 命令分类：安装命令识别、文件系统变更判定与 cd 路径跟踪。
// 纯文本启发式，只作为 UI 提示，不参与任何核心不变量。
use regex::Regex;
use std::sync::OnceLock;

/// What a completed command line most likely did to the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsChangeKind {
    CreateDir,
    CreateFile,
    Delete,
    Move,
    Copy,
    Extract,
    Checkout,
}

impl FsChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateDir => "create_dir",
            Self::CreateFile => "create_file",
            Self::Delete => "delete",
            Self::Move => "move",
            Self::Copy => "copy",
            Self::Extract => "extract",
            Self::Checkout => "checkout",
        }
    }
}

/// A package-manager invocation that needs transient network access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallCommand {
    /// Base executable name, used for the in-container completion poll.
    pub base: String,
}

/// Heuristic classifier seam: the bridge only sees this trait, so the
/// regex table can later be swapped for a real filesystem watch.
pub trait CommandClassifier: Send + Sync {
    fn classify_fs_change(&self, line: &str) -> Option<FsChangeKind>;
    fn detect_install(&self, line: &str) -> Option<InstallCommand>;
}

pub struct RegexClassifier;

impl RegexClassifier {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RegexClassifier {
    fn default() -> Self {
        Self::new()
    }
}

fn install_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:sudo\s+)?(pip3?|npm|yarn|pnpm)\s+(?:install|add|i)(?:\s|$)")
            .expect("install pattern")
    })
}

impl CommandClassifier for RegexClassifier {
    fn classify_fs_change(&self, line: &str) -> Option<FsChangeKind> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        let prefix_table: &[(&str, FsChangeKind)] = &[
            ("mkdir", FsChangeKind::CreateDir),
            ("touch", FsChangeKind::CreateFile),
            ("rm ", FsChangeKind::Delete),
            ("rmdir", FsChangeKind::Delete),
            ("mv ", FsChangeKind::Move),
            ("cp ", FsChangeKind::Copy),
            ("tar ", FsChangeKind::Extract),
            ("unzip", FsChangeKind::Extract),
            ("git checkout", FsChangeKind::Checkout),
            ("git clone", FsChangeKind::Checkout),
            ("git pull", FsChangeKind::Checkout),
        ];
        for (prefix, kind) in prefix_table {
            if trimmed.starts_with(prefix) {
                return Some(*kind);
            }
        }
        // Shell redirection creates/overwrites the target file.
        if trimmed.contains(" > ") || trimmed.contains(" >> ") {
            return Some(FsChangeKind::CreateFile);
        }
        None
    }

    fn detect_install(&self, line: &str) -> Option<InstallCommand> {
        let captures = install_pattern().captures(line.trim())?;
        Some(InstallCommand {
            base: captures.get(1)?.as_str().to_string(),
        })
    }
}

/// Best-effort cwd tracking from observed `cd` lines. Returns the new
/// directory if the line is a cd, clamped so it never escapes the
/// workspace root. Approximate by design: no shell integration.
pub fn apply_cd(current: &str, line: &str, workspace_root: &str) -> Option<String> {
    let trimmed = line.trim();
    let rest = if trimmed == "cd" {
        ""
    } else {
        trimmed.strip_prefix("cd ")?.trim()
    };
    // Strip one layer of quoting; paths typed interactively rarely nest.
    let rest = rest.trim_matches('"').trim_matches('\'');
    let target = if rest.is_empty() || rest == "~" {
        workspace_root.to_string()
    } else if let Some(tail) = rest.strip_prefix("~/") {
        format!("{}/{}", workspace_root.trim_end_matches('/'), tail)
    } else if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("{}/{}", current.trim_end_matches('/'), rest)
    };
    Some(clamp_to_root(&normalize_posix(&target), workspace_root))
}

fn normalize_posix(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

fn clamp_to_root(path: &str, workspace_root: &str) -> String {
    let root = workspace_root.trim_end_matches('/');
    let root = if root.is_empty() { "/" } else { root };
    if path == root || path.starts_with(&format!("{root}/")) {
        path.to_string()
    } else {
        root.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: &str = "/workspace";

    #[test]
    fn install_detection_matches_package_managers() {
        let classifier = RegexClassifier::new();
        let cases = [
            ("pip install requests", "pip"),
            ("pip3 install numpy pandas", "pip3"),
            ("npm install", "npm"),
            ("npm i lodash", "npm"),
            ("yarn add react", "yarn"),
            ("pnpm install --frozen-lockfile", "pnpm"),
            ("sudo pip install flask", "pip"),
        ];
        for (line, base) in cases {
            let detected = classifier.detect_install(line).unwrap_or_else(|| {
                panic!("expected install detection for {line:?}");
            });
            assert_eq!(detected.base, base, "base for {line:?}");
        }
        assert!(classifier.detect_install("pip list").is_none());
        assert!(classifier.detect_install("echo npm install").is_none());
        assert!(classifier.detect_install("python app.py").is_none());
    }

    #[test]
    fn fs_change_classification_uses_prefix_table() {
        let classifier = RegexClassifier::new();
        assert_eq!(
            classifier.classify_fs_change("mkdir foo"),
            Some(FsChangeKind::CreateDir)
        );
        assert_eq!(
            classifier.classify_fs_change("rm -rf build"),
            Some(FsChangeKind::Delete)
        );
        assert_eq!(
            classifier.classify_fs_change("git checkout -b feature"),
            Some(FsChangeKind::Checkout)
        );
        assert_eq!(
            classifier.classify_fs_change("echo hi > out.txt"),
            Some(FsChangeKind::CreateFile)
        );
        assert_eq!(classifier.classify_fs_change("ls -la"), None);
        assert_eq!(classifier.classify_fs_change("python main.py"), None);
    }

    #[test]
    fn cd_tracking_handles_relative_absolute_and_home() {
        assert_eq!(
            apply_cd(ROOT, "cd src", ROOT),
            Some("/workspace/src".to_string())
        );
        assert_eq!(
            apply_cd("/workspace/src", "cd ..", ROOT),
            Some("/workspace".to_string())
        );
        assert_eq!(apply_cd("/workspace/src", "cd ~", ROOT), Some(ROOT.to_string()));
        assert_eq!(
            apply_cd(ROOT, "cd ~/projects", ROOT),
            Some("/workspace/projects".to_string())
        );
        assert_eq!(
            apply_cd(ROOT, "cd /workspace/data", ROOT),
            Some("/workspace/data".to_string())
        );
        assert_eq!(apply_cd(ROOT, "ls", ROOT), None);
    }

    #[test]
    fn cd_tracking_never_escapes_workspace_root() {
        assert_eq!(
            apply_cd(ROOT, "cd ../../etc", ROOT),
            Some(ROOT.to_string())
        );
        assert_eq!(apply_cd(ROOT, "cd /etc", ROOT), Some(ROOT.to_string()));
        assert_eq!(
            apply_cd("/workspace/a/b", "cd ../../..", ROOT),
            Some(ROOT.to_string())
        );
    }
}
