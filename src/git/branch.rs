//! Parsing of git branch output

/// Extract the branch name from `git symbolic-ref refs/remotes/origin/HEAD`
///
/// Output is like `refs/remotes/origin/main`.
pub fn parse_default_branch(symbolic_ref: &str) -> Option<String> {
    let name = symbolic_ref
        .trim()
        .strip_prefix("refs/remotes/")?
        .split_once('/')?
        .1;
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Turn `git branch --remotes --format=%(refname:short)` output into
/// branch names, dropping the remote prefix and the `HEAD` alias.
pub fn parse_remote_branches(output: &str) -> Vec<String> {
    let mut branches: Vec<String> = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| line.split_once('/').map(|(_, name)| name))
        .filter(|name| *name != "HEAD" && !name.is_empty())
        .map(str::to_string)
        .collect();
    branches.sort();
    branches.dedup();
    branches
}
