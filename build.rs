// build.rs

use clap::{Arg, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

/// Common argument: variants to process
fn variant_arg() -> Arg {
    Arg::new("variant")
        .short('v')
        .long("variant")
        .value_name("VARIANT")
        .value_delimiter(',')
        .action(clap::ArgAction::Append)
        .help("Variants to process: release, debug, adhoc, coverage (default: all)")
}

/// Common argument: version tag
fn tag_arg() -> Arg {
    Arg::new("tag")
        .short('t')
        .long("tag")
        .value_name("TAG")
        .help("Image tag and artifact version (default: from git)")
}

/// Common argument: parallel jobs
fn jobs_arg() -> Arg {
    Arg::new("jobs")
        .short('j')
        .long("jobs")
        .value_name("N")
        .help("Parallel jobs (default: from config or available CPUs)")
}

fn no_export_arg() -> Arg {
    Arg::new("no_export")
        .long("no-export")
        .action(clap::ArgAction::SetTrue)
        .help("Compose and layer without writing archives")
}

fn build_cli() -> Command {
    Command::new("varimage")
        .version(env!("CARGO_PKG_VERSION"))
        .author("varimage Contributors")
        .about("Build variant matrices and assemble container images")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("Project file (default: <repo>/varimage.toml, else built-in project)"),
        )
        .arg(
            Arg::new("repo")
                .short('r')
                .long("repo")
                .value_name("DIR")
                .default_value(".")
                .global(true)
                .help("Repository root"),
        )
        .subcommand(
            Command::new("plan")
                .about("Show effective variant specs and planned images")
                .arg(variant_arg())
                .arg(tag_arg())
                .arg(jobs_arg())
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(clap::ArgAction::SetTrue)
                        .help("Print as JSON"),
                ),
        )
        .subcommand(
            Command::new("select")
                .about("Show which files the whitelist selects")
                .arg(
                    Arg::new("list")
                        .short('l')
                        .long("list")
                        .action(clap::ArgAction::SetTrue)
                        .help("List every selected file"),
                ),
        )
        .subcommand(
            Command::new("build")
                .about("Build and fix up variants")
                .arg(variant_arg())
                .arg(tag_arg())
                .arg(jobs_arg()),
        )
        .subcommand(
            Command::new("image")
                .about("Package previously built variants into images")
                .arg(variant_arg())
                .arg(tag_arg())
                .arg(jobs_arg())
                .arg(no_export_arg()),
        )
        .subcommand(
            Command::new("run")
                .about("Build, fix up and package variants")
                .arg(variant_arg())
                .arg(tag_arg())
                .arg(jobs_arg())
                .arg(no_export_arg())
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(clap::ArgAction::SetTrue)
                        .help("Print the report as JSON"),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Create man directory - use CARGO_MANIFEST_DIR which is always set by cargo
    let manifest_dir = match env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(e) => {
            println!("cargo:warning=CARGO_MANIFEST_DIR not set: {}", e);
            return;
        }
    };
    let man_dir = manifest_dir.join("man");

    if let Err(e) = fs::create_dir_all(&man_dir) {
        println!("cargo:warning=Failed to create man directory: {}", e);
        return;
    }

    let man = Man::new(build_cli());
    let mut buffer = Vec::new();

    if let Err(e) = man.render(&mut buffer) {
        println!("cargo:warning=Failed to render man page: {}", e);
        return;
    }

    let man_path = man_dir.join("varimage.1");
    if let Err(e) = fs::write(&man_path, buffer) {
        println!("cargo:warning=Failed to write man page: {}", e);
    }
}
