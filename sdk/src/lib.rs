//! HarmonyOS SDK discovery.
//!
//! Computes the [`SdkPaths`] the ETS backend needs from two roots supplied by
//! the editor: the TypeScript installation and the HarmonyOS SDK. Discovery
//! never fails; missing or unreadable directories contribute no libraries.

use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobMatcher};
use ignore::WalkBuilder;
use lsw_types::SdkPaths;

/// File-name pattern for TypeScript declaration files.
const DECLARATION_GLOB: &str = "*.d.ts";

/// Compile the declaration-file matcher (case-insensitive, matched on file names).
fn declaration_matcher() -> Result<GlobMatcher, globset::Error> {
    Ok(GlobBuilder::new(DECLARATION_GLOB)
        .case_insensitive(true)
        .build()?
        .compile_matcher())
}

/// List every file under `dir` whose file name matches `matcher`.
///
/// Symbolic links are followed and ignore files are not honored: SDK trees are
/// vendor content, not source checkouts. Results are sorted. A missing path or
/// a path that is not a directory yields an empty list.
pub fn files_matching(dir: &Path, matcher: &GlobMatcher, recursive: bool) -> Vec<PathBuf> {
    match std::fs::metadata(dir) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            tracing::warn!(path = %dir.display(), "Path is not a directory");
            return Vec::new();
        }
        Err(e) => {
            tracing::warn!(path = %dir.display(), "Path does not exist: {e}");
            return Vec::new();
        }
    }

    let walker = WalkBuilder::new(dir)
        .standard_filters(false)
        .follow_links(true)
        .max_depth(if recursive { None } else { Some(1) })
        .build();

    let mut files = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(path = %dir.display(), "Skipping unreadable entry: {e}");
                continue;
            }
        };

        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }

        if matcher.is_match(entry.file_name()) {
            files.push(entry.into_path());
        }
    }

    files.sort();
    files
}

/// Recursively list the `.d.ts` files under `dir`.
pub fn declaration_files(dir: &Path) -> Vec<PathBuf> {
    match declaration_matcher() {
        Ok(matcher) => files_matching(dir, &matcher, true),
        Err(e) => {
            tracing::error!("Invalid declaration pattern {DECLARATION_GLOB}: {e}");
            Vec::new()
        }
    }
}

/// Blocking body of [`discover`].
pub fn discover_blocking(ts_root: &Path, sdk_root: &Path) -> SdkPaths {
    let mut paths = SdkPaths::layout(sdk_root);

    let mut libraries = declaration_files(ts_root);
    libraries.extend(declaration_files(&paths.component_path));
    libraries.extend(declaration_files(&paths.loader_declarations()));
    paths.libraries = libraries;

    tracing::debug!(
        sdk = %sdk_root.display(),
        tsdk = %ts_root.display(),
        libraries = paths.libraries.len(),
        "SDK discovery complete"
    );
    paths
}

/// Discover the auxiliary SDK paths for a session.
///
/// The directory traversal runs on the blocking pool so the relay keeps
/// accepting editor input meanwhile.
pub async fn discover(ts_root: &Path, sdk_root: &Path) -> SdkPaths {
    let ts = ts_root.to_path_buf();
    let sdk = sdk_root.to_path_buf();

    match tokio::task::spawn_blocking(move || discover_blocking(&ts, &sdk)).await {
        Ok(paths) => paths,
        Err(e) => {
            tracing::error!("SDK discovery task failed: {e}");
            SdkPaths::layout(sdk_root)
        }
    }
}
