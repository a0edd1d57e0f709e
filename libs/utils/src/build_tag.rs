/// Git-derived build identifier, embedded at compile time. Reported by
/// `--version` so a deployed binary can be traced back to the commit (and
/// dirty-tree state) it was built from.
pub const BUILD_TAG: &str = git_version::git_version!(
    prefix = "git:",
    fallback = "unknown",
    args = ["--abbrev=40", "--always", "--dirty=-modified"]
);
