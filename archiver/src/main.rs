use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use archiver::Archiver;
use archiver::core::Document;
use archiver::format::format_document_text;
use archiver::parse_str;
use archiver::settings::ArchiverSettings;
use archiver::storage::{FsVault, has_markdown_extension};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "archiver",
    about = "Move completed Markdown tasks into a dated archive",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// JSON settings file. Built-in defaults apply when omitted.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Archive the completed tasks of a Markdown file.
    Archive(ArchiveArgs),

    /// Parse a Markdown file and print its outline tree.
    Parse(ParseArgs),

    /// Re-emit a Markdown file through the parser and formatter.
    Format(FormatArgs),

    /// Print the effective settings as JSON.
    Settings,
}

#[derive(Debug, Args)]
struct ArchiveArgs {
    /// The Markdown file to archive tasks from.
    file: PathBuf,
    /// Date used for every date placeholder (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    date: Option<NaiveDate>,
    /// Directory archive file names are resolved against. Defaults to the file's folder.
    #[arg(long)]
    vault: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ParseArgs {
    file: PathBuf,
    /// Emit JSON instead of a debug representation.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct FormatArgs {
    file: PathBuf,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let settings = load_settings(cli.settings.as_deref())?;
    match cli.command {
        Commands::Archive(args) => handle_archive(args, settings),
        Commands::Parse(args) => handle_parse(args, &settings),
        Commands::Format(args) => handle_format(args, &settings),
        Commands::Settings => handle_settings(&settings),
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_settings(path: Option<&Path>) -> Result<ArchiverSettings> {
    let Some(path) = path else {
        return Ok(ArchiverSettings::default());
    };
    let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    let settings =
        ArchiverSettings::from_json(&text).with_context(|| format!("parsing {:?}", path))?;
    settings
        .validate()
        .with_context(|| format!("validating {:?}", path))?;
    debug!(path = ?path, "loaded settings");
    Ok(settings)
}

fn handle_archive(args: ArchiveArgs, settings: ArchiverSettings) -> Result<()> {
    let ArchiveArgs { file, date, vault } = args;
    let (root, active) = split_vault_path(&file, vault.as_deref())?;
    info!(root = ?root, file = ?active, "archiving");

    let vault = FsVault::new(root).with_active(active);
    let today = date.unwrap_or_else(|| Local::now().date_naive());
    let archiver = Archiver::new(vault, settings, today).context("configuring archiver")?;
    let status = archiver
        .archive_tasks_in_active_file()
        .with_context(|| format!("archiving tasks in {:?}", file))?;
    println!("{status}");
    Ok(())
}

/// Split `file` into a vault root and a root-relative document path.
fn split_vault_path(file: &Path, vault: Option<&Path>) -> Result<(PathBuf, PathBuf)> {
    let file = fs::canonicalize(file).with_context(|| format!("resolving {:?}", file))?;
    match vault {
        Some(root) => {
            let root = fs::canonicalize(root).with_context(|| format!("resolving {:?}", root))?;
            let relative = file
                .strip_prefix(&root)
                .with_context(|| format!("{:?} is not inside {:?}", file, root))?
                .to_path_buf();
            Ok((root, relative))
        }
        None => {
            let parent = file
                .parent()
                .with_context(|| format!("{:?} has no parent directory", file))?;
            let name = file
                .file_name()
                .with_context(|| format!("{:?} has no file name", file))?;
            Ok((parent.to_path_buf(), PathBuf::from(name)))
        }
    }
}

fn read_document(path: &Path, settings: &ArchiverSettings) -> Result<Document> {
    if !has_markdown_extension(path) {
        anyhow::bail!("{:?} is not a markdown (.md) file", path);
    }
    let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    Ok(parse_str(&text, &settings.indentation_settings))
}

fn handle_parse(args: ParseArgs, settings: &ArchiverSettings) -> Result<()> {
    let ParseArgs { file, json } = args;
    let doc = read_document(&file, settings).with_context(|| format!("parsing {:?}", file))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else {
        println!("{:#?}", doc);
    }
    Ok(())
}

fn handle_format(args: FormatArgs, settings: &ArchiverSettings) -> Result<()> {
    let FormatArgs { file, in_place } = args;
    let doc = read_document(&file, settings).with_context(|| format!("parsing {:?}", file))?;
    let formatted = format_document_text(&doc, &settings.indentation_settings);

    if in_place {
        fs::write(&file, formatted.as_bytes()).with_context(|| format!("writing {:?}", file))?;
    } else {
        print!("{formatted}");
        if !formatted.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

fn handle_settings(settings: &ArchiverSettings) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(settings)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_vault_path_defaults_to_parent_directory() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("Inbox.md");
        fs::write(&file, "").expect("write");

        let (root, relative) = split_vault_path(&file, None).expect("split");
        assert_eq!(root, fs::canonicalize(tmp.path()).unwrap());
        assert_eq!(relative, PathBuf::from("Inbox.md"));
    }

    #[test]
    fn split_vault_path_keeps_folders_below_vault_root() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("journal");
        fs::create_dir_all(&dir).expect("mkdir");
        let file = dir.join("Inbox.md");
        fs::write(&file, "").expect("write");

        let (_, relative) = split_vault_path(&file, Some(tmp.path())).expect("split");
        assert_eq!(relative, PathBuf::from("journal/Inbox.md"));

        let outside = tempfile::tempdir().expect("tempdir");
        assert!(split_vault_path(&file, Some(outside.path())).is_err());
    }

    #[test]
    fn archive_moves_completed_tasks_on_disk() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("Inbox.md");
        fs::write(&file, "- [x] ship it\n- [ ] review").expect("write");
        let settings = ArchiverSettings {
            archive_to_separate_file: true,
            archive_under_headings: true,
            ..ArchiverSettings::default()
        };

        handle_archive(
            ArchiveArgs {
                file: file.clone(),
                date: NaiveDate::from_ymd_opt(2024, 3, 9),
                vault: None,
            },
            settings,
        )
        .expect("archive");

        assert_eq!(fs::read_to_string(&file).unwrap(), "- [ ] review");
        let archive = fs::read_to_string(tmp.path().join("Inbox (archive).md")).unwrap();
        assert_eq!(archive, "# Archived\n## 2024-03-09\n- [x] ship it");
    }

    #[test]
    fn format_in_place_normalizes_indentation() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("notes.md");
        fs::write(&file, "# Notes\n- a\n\t- b\n").expect("write");

        handle_format(
            FormatArgs {
                file: file.clone(),
                in_place: true,
            },
            &ArchiverSettings::default(),
        )
        .expect("format");

        assert_eq!(fs::read_to_string(&file).unwrap(), "# Notes\n- a\n  - b\n");
    }

    #[test]
    fn non_markdown_files_are_refused() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("notes.txt");
        fs::write(&file, "- [x] a").expect("write");

        let err = read_document(&file, &ArchiverSettings::default()).unwrap_err();
        assert!(err.to_string().contains("not a markdown"));
    }

    #[test]
    fn load_settings_rejects_invalid_values() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("settings.json");
        fs::write(&path, r#"{ "archive_heading_depth": 9 }"#).expect("write");

        assert!(load_settings(Some(&path)).is_err());
        assert_eq!(load_settings(None).unwrap(), ArchiverSettings::default());
    }
}
