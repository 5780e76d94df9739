// SPDX-License-Identifier: MIT OR Apache-2.0
//! Remote URL validation.
//!
//! Coding jobs carry their repository URL in attacker-reachable metadata,
//! so the remote is held to a strict allowlist: GitHub over HTTPS or SSH,
//! nothing else. An optional SSH host alias (for per-key `~/.ssh/config`
//! entries) is rewritten to the canonical host before validation.

use crate::GitError;

/// Validate a clone URL and normalize it.
///
/// Accepted shapes:
/// - `https://github.com/<owner>/<repo>[.git]`
/// - `git@github.com:<owner>/<repo>[.git]`
/// - `ssh://git@github.com/<owner>/<repo>[.git]`
///
/// With `ssh_alias = Some("gh-worker")`, `git@gh-worker:owner/repo` is
/// rewritten to `git@github.com:owner/repo` first.
pub fn validate_remote_url(url: &str, ssh_alias: Option<&str>) -> Result<String, GitError> {
    let url = url.trim();
    if url.is_empty() || url.starts_with('-') {
        return Err(GitError::UnsafeRemote(url.to_string()));
    }

    // Alias rewrite before any validation.
    let url = match ssh_alias {
        Some(alias) if !alias.is_empty() => {
            let prefix = format!("git@{alias}:");
            match url.strip_prefix(&prefix) {
                Some(rest) => format!("git@github.com:{rest}"),
                None => url.to_string(),
            }
        }
        _ => url.to_string(),
    };

    let path = if let Some(rest) = url.strip_prefix("https://github.com/") {
        rest
    } else if let Some(rest) = url.strip_prefix("git@github.com:") {
        rest
    } else if let Some(rest) = url.strip_prefix("ssh://git@github.com/") {
        rest
    } else {
        return Err(GitError::UnsafeRemote(url));
    };

    if !valid_repo_path(path) {
        return Err(GitError::UnsafeRemote(url));
    }
    Ok(url)
}

/// `<owner>/<repo>[.git]` with a conservative character set.
fn valid_repo_path(path: &str) -> bool {
    let path = path.strip_suffix(".git").unwrap_or(path);
    let mut parts = path.split('/');
    let (Some(owner), Some(repo), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    let ok = |s: &str| {
        !s.is_empty()
            && !s.starts_with('-')
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    };
    ok(owner) && ok(repo)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_github_https_and_ssh() {
        for url in [
            "https://github.com/acme/widget",
            "https://github.com/acme/widget.git",
            "git@github.com:acme/widget.git",
            "ssh://git@github.com/acme/widget",
        ] {
            assert!(validate_remote_url(url, None).is_ok(), "{url}");
        }
    }

    #[test]
    fn rejects_foreign_hosts_and_schemes() {
        for url in [
            "https://gitlab.com/acme/widget",
            "http://github.com/acme/widget",
            "file:///etc/passwd",
            "ext::sh -c whoami",
            "git@github.com.evil.com:acme/widget",
            "--upload-pack=/bin/sh",
            "",
        ] {
            assert!(validate_remote_url(url, None).is_err(), "{url}");
        }
    }

    #[test]
    fn rejects_path_traversal_shapes() {
        for url in [
            "https://github.com/acme",
            "https://github.com/acme/widget/extra",
            "https://github.com/../secrets",
            "git@github.com:-flag/repo",
        ] {
            assert!(validate_remote_url(url, None).is_err(), "{url}");
        }
    }

    #[test]
    fn ssh_alias_is_rewritten_to_canonical_host() {
        let normalized =
            validate_remote_url("git@gh-worker:acme/widget.git", Some("gh-worker")).unwrap();
        assert_eq!(normalized, "git@github.com:acme/widget.git");
    }

    #[test]
    fn alias_rewrite_does_not_widen_the_allowlist() {
        assert!(validate_remote_url("git@evil.com:acme/widget", Some("gh-worker")).is_err());
    }
}
