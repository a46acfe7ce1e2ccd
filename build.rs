// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

const DB_PATH: &str = "/srv/conary/repos.db";
const CONTENTS_DIR: &str = "/srv/conary/contents";

fn repo_args(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("db_path")
            .short('d')
            .long("db-path")
            .default_value(DB_PATH)
            .help("Trove database path"),
    )
    .arg(
        Arg::new("contents_dir")
            .short('c')
            .long("contents-dir")
            .default_value(CONTENTS_DIR)
            .help("Content store directory"),
    )
    .arg(
        Arg::new("server_names")
            .short('s')
            .long("server-name")
            .action(ArgAction::Append)
            .help("Host names served by this repository (repeatable)"),
    )
}

fn contents_dir() -> Arg {
    Arg::new("contents_dir")
        .short('c')
        .long("contents-dir")
        .default_value(CONTENTS_DIR)
        .help("Content store directory")
}

fn build_cli() -> Command {
    Command::new("conary-core")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Conary Contributors")
        .about("Conary repository core: versions, changesets and content store")
        .subcommand_required(false)
        .subcommand(
            Command::new("version")
                .about("Inspect and convert version strings")
                .subcommand(
                    Command::new("parse")
                        .about("Parse a version string and describe it")
                        .arg(Arg::new("text").required(true)),
                )
                .subcommand(
                    Command::new("thaw")
                        .about("Show the display form of a frozen version")
                        .arg(Arg::new("frozen").required(true)),
                )
                .subcommand(
                    Command::new("freeze")
                        .about("Splice timestamps into a version string")
                        .arg(Arg::new("text").required(true))
                        .arg(
                            Arg::new("timestamps")
                                .short('t')
                                .long("timestamps")
                                .num_args(1..)
                                .help("One timestamp per revision"),
                        ),
                )
                .subcommand(
                    Command::new("compare")
                        .about("Order two versions and score their closeness")
                        .arg(Arg::new("a").required(true))
                        .arg(Arg::new("b").required(true)),
                ),
        )
        .subcommand(
            Command::new("store")
                .about("Work with a content store directory")
                .subcommand(
                    Command::new("add")
                        .about("Add a file, keyed by its sha256")
                        .arg(Arg::new("file").required(true))
                        .arg(contents_dir()),
                )
                .subcommand(
                    Command::new("cat")
                        .about("Write stored contents to stdout")
                        .arg(Arg::new("hash").required(true))
                        .arg(contents_dir()),
                )
                .subcommand(
                    Command::new("path")
                        .about("Show where a hash is stored")
                        .arg(Arg::new("hash").required(true))
                        .arg(contents_dir()),
                )
                .subcommand(
                    Command::new("remove")
                        .about("Remove stored contents")
                        .arg(Arg::new("hash").required(true))
                        .arg(contents_dir()),
                ),
        )
        .subcommand(
            Command::new("init")
                .about("Initialize the trove database")
                .arg(
                    Arg::new("db_path")
                        .short('d')
                        .long("db-path")
                        .value_name("PATH")
                        .default_value(DB_PATH)
                        .help("Database path"),
                ),
        )
        .subcommand(repo_args(
            Command::new("list")
                .about("List stored troves")
                .arg(Arg::new("name").help("Only troves with this name")),
        ))
        .subcommand(repo_args(
            Command::new("changeset")
                .about("Compute a changeset and print a summary")
                .arg(Arg::new("name").required(true).help("Trove name"))
                .arg(Arg::new("version").required(true).help("Version to change to"))
                .arg(Arg::new("from").long("from").help("Version to change from"))
                .arg(
                    Arg::new("flavor")
                        .long("flavor")
                        .default_value("")
                        .help("Flavor of both versions"),
                )
                .arg(
                    Arg::new("absolute")
                        .long("absolute")
                        .action(ArgAction::SetTrue)
                        .help("Build an absolute changeset"),
                )
                .arg(
                    Arg::new("no_recurse")
                        .long("no-recurse")
                        .action(ArgAction::SetTrue)
                        .help("Do not follow contained troves"),
                )
                .arg(
                    Arg::new("no_contents")
                        .long("no-contents")
                        .action(ArgAction::SetTrue)
                        .help("Leave out file contents"),
                ),
        ))
        .subcommand(
            Command::new("completions")
                .about("Generate shell completion scripts")
                .arg(
                    Arg::new("shell")
                        .required(true)
                        .value_parser(["bash", "elvish", "fish", "powershell", "zsh"])
                        .help("Shell type"),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let out_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("Failed to create man directory");

    let man = Man::new(build_cli());
    let mut buffer = Vec::new();
    man.render(&mut buffer).expect("Failed to render man page");

    let man_path = man_dir.join("conary-core.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");
}
