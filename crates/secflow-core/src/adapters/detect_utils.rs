use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Locates a tool binary without spawning anything.
///
/// Absolute or relative paths containing a separator are checked as given;
/// bare names are searched in `extra_paths`, then `PATH`, then common install
/// roots for security tooling.
pub(crate) fn which_executable(binary_name: &str, extra_paths: &[&str]) -> Option<PathBuf> {
    let binary_name = binary_name.trim();
    if binary_name.is_empty() {
        return None;
    }

    if binary_name.contains(std::path::MAIN_SEPARATOR) || binary_name.contains('/') {
        let explicit = PathBuf::from(binary_name);
        return is_executable(&explicit).then_some(explicit);
    }

    let mut seen = HashSet::new();
    let mut candidates = Vec::new();

    for extra in extra_paths {
        push_candidate_path(
            Path::new(extra).join(binary_name),
            &mut candidates,
            &mut seen,
        );
    }

    if let Some(path_var) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path_var) {
            push_candidate_path(dir.join(binary_name), &mut candidates, &mut seen);
        }
    }

    for dir in tool_additional_bin_roots() {
        push_candidate_path(dir.join(binary_name), &mut candidates, &mut seen);
    }

    candidates
        .into_iter()
        .find(|candidate| is_executable(candidate))
}

fn push_candidate_path(
    candidate: PathBuf,
    candidates: &mut Vec<PathBuf>,
    seen: &mut HashSet<String>,
) {
    let rendered = candidate.to_string_lossy().to_string();
    if rendered.is_empty() {
        return;
    }

    if seen.insert(rendered) {
        candidates.push(candidate);
    }
}

fn tool_additional_bin_roots() -> Vec<PathBuf> {
    let mut roots = vec![
        PathBuf::from("/usr/local/bin"),
        PathBuf::from("/opt/homebrew/bin"),
        PathBuf::from("/usr/bin"),
        PathBuf::from("/bin"),
        PathBuf::from("/usr/sbin"),
        PathBuf::from("/snap/bin"),
        PathBuf::from("/usr/share/sqlmap"),
        PathBuf::from("/usr/share/nikto"),
    ];

    if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
        roots.push(home.join(".local/bin"));
        roots.push(home.join("go/bin"));
        roots.push(home.join(".pdtm/go/bin"));
    }

    roots
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
