use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
};
use walkdir::WalkDir;

pub fn normalize_mod_name(value: &str) -> String {
    value
        .chars()
        .map(|ch| ch.to_ascii_lowercase())
        .filter(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || *ch == '@')
        .collect()
}

pub fn names_match(left: &str, right: &str) -> bool {
    normalize_mod_name(left) == normalize_mod_name(right)
}

pub fn find_candidates(
    wanted: &BTreeSet<String>,
    locations: &[PathBuf],
    max_depth: usize,
    exclude: &BTreeMap<String, PathBuf>,
) -> BTreeMap<String, Vec<PathBuf>> {
    let keys: Vec<(String, &String)> = wanted
        .iter()
        .map(|name| (normalize_mod_name(name), name))
        .filter(|(key, _)| !key.is_empty())
        .collect();
    let excluded: Vec<PathBuf> = exclude
        .values()
        .map(|path| fs::canonicalize(path).unwrap_or_else(|_| path.clone()))
        .collect();

    let mut found: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for location in locations {
        if !location.is_dir() {
            tracing::debug!(path = ?location, "search location does not exist");
            continue;
        }
        let mut walker = WalkDir::new(location)
            .min_depth(1)
            .max_depth(max_depth)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();
        while let Some(entry) = walker.next() {
            let Ok(entry) = entry else {
                continue;
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            if is_ignored_search_dir(entry.path()) {
                walker.skip_current_dir();
                continue;
            }
            let key = normalize_mod_name(&entry.file_name().to_string_lossy());
            let Some((_, name)) = keys.iter().find(|(wanted_key, _)| *wanted_key == key) else {
                continue;
            };
            walker.skip_current_dir();
            let real = fs::canonicalize(entry.path()).unwrap_or_else(|_| entry.path().to_path_buf());
            if excluded.contains(&real) {
                continue;
            }
            let list = found.entry((*name).clone()).or_default();
            if !list.contains(&real) {
                tracing::info!(mod_name = %name, path = ?real, "found existing copy");
                list.push(real);
            }
        }
    }
    found
}

fn is_ignored_search_dir(path: &Path) -> bool {
    let Some(name) = path.file_name() else {
        return false;
    };
    let part = name.to_string_lossy();
    part.eq_ignore_ascii_case("__MACOSX")
        || part.eq_ignore_ascii_case("$recycle.bin")
        || part.eq_ignore_ascii_case("system volume information")
        || part == ".git"
        || part == ".svn"
}
