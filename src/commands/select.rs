// src/commands/select.rs

//! Select command: preview source selection

use anyhow::Result;
use std::path::Path;
use varimage::select;

use super::Session;

pub fn cmd_select(config: Option<&Path>, repo: &Path, list: bool) -> Result<()> {
    let session = Session::open(config, repo)?;
    let project = &session.project;
    let tree = select(&project.repo_root, &project.whitelist)?;

    println!(
        "Selected {} files from {} ({:?} matching)",
        tree.len(),
        tree.root().display(),
        project.whitelist.matching()
    );
    for prefix in tree.unmatched_prefixes() {
        println!("  warning: prefix '{}' matched nothing", prefix);
    }
    if list {
        for file in tree.files() {
            println!("  {}", file);
        }
    }
    Ok(())
}
