//! `jedisos market` subcommand family: a thin CLI skin over
//! [`jedisos_packages::PackageManager`] plus a `validate` step that runs
//! the security checker against a skill's `tool.yaml` before install.

use std::path::{Path, PathBuf};

use jedisos_packages::{PackageManager, PackageType};
use jedisos_security::SecurityChecker;

fn parse_package_type(s: &str) -> Option<PackageType> {
    PackageType::all().into_iter().find(|t| t.dir_name() == s)
}

pub fn list(manager: &PackageManager, type_filter: Option<&str>) -> i32 {
    let filter = type_filter.and_then(parse_package_type);
    let infos = manager.scan();
    let filtered: Vec<_> = infos.into_iter().filter(|i| filter.is_none_or(|t| t == i.metadata.package_type)).collect();
    if filtered.is_empty() {
        println!("no packages installed");
        return 0;
    }
    for info in filtered {
        println!("{}\t{}\t{}\t{}", info.metadata.name, info.metadata.version, info.metadata.package_type.dir_name(), info.metadata.description);
    }
    0
}

pub fn search(manager: &PackageManager, query: &str, type_filter: Option<&str>) -> i32 {
    let filter = type_filter.and_then(parse_package_type);
    let results = manager.search(query, filter);
    if results.is_empty() {
        println!("no matches for '{query}'");
        return 0;
    }
    for info in results {
        println!("{}\t{}\t{}", info.metadata.name, info.metadata.package_type.dir_name(), info.metadata.description);
    }
    0
}

pub fn info(manager: &PackageManager, name: &str) -> i32 {
    match manager.get(name) {
        Some(info) => {
            println!("name: {}", info.metadata.name);
            println!("version: {}", info.metadata.version);
            println!("type: {}", info.metadata.package_type.dir_name());
            println!("license: {}", info.metadata.license);
            println!("author: {}", info.metadata.author);
            println!("tags: {}", info.metadata.tags.join(", "));
            println!("description: {}", info.metadata.description);
            println!("path: {}", info.path.display());
            0
        }
        None => {
            eprintln!("package '{name}' not found");
            1
        }
    }
}

/// Validates a candidate skill directory's `tool.yaml` against the
/// security checker without installing it. Exit code 2 on a failed
/// validation, per the CLI's documented exit-code contract.
pub fn validate(source_dir: &Path, shell_allowed: bool) -> i32 {
    let definition_path = source_dir.join(jedisos_loader::TOOL_DEFINITION_FILE);
    let raw = match std::fs::read_to_string(&definition_path) {
        Ok(raw) => raw,
        Err(err) => {
            eprintln!("cannot read {}: {err}", definition_path.display());
            return 2;
        }
    };
    let checker = SecurityChecker::new(shell_allowed);
    let report = checker.check(&raw);
    for finding in &report.findings {
        println!("[{:?}] {}: {}", finding.severity, finding.check, finding.message);
    }
    if report.passed {
        println!("{} passed validation", source_dir.display());
        0
    } else {
        eprintln!("{} failed validation", source_dir.display());
        2
    }
}

pub fn install(manager: &PackageManager, source_dir: &PathBuf, force: bool) -> i32 {
    match manager.install(source_dir, force) {
        Ok(info) => {
            println!("installed '{}' under {}", info.metadata.name, info.path.display());
            0
        }
        Err(err) => {
            eprintln!("install failed: {err}");
            1
        }
    }
}

pub fn remove(manager: &PackageManager, name: &str) -> i32 {
    match manager.remove(name) {
        Ok(()) => {
            println!("removed '{name}'");
            0
        }
        Err(err) => {
            eprintln!("remove failed: {err}");
            1
        }
    }
}
