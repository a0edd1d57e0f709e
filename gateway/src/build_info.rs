/// Version string reported by `--version`, combining the crate version
/// with the git-derived build tag.
pub static VERSION_STRING: once_cell::sync::Lazy<String> =
    once_cell::sync::Lazy::new(|| format!("{} ({})", env!("CARGO_PKG_VERSION"), utils::build_tag::BUILD_TAG));
