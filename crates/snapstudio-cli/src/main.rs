use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use snapstudio_contracts::chat::{parse_intent, STUDIO_HELP_COMMANDS};
use snapstudio_contracts::models::{ModelRegistry, DEFAULT_EDIT_MODELS, DRYRUN_EDIT_MODEL};
use snapstudio_contracts::presets::PRESETS;
use snapstudio_contracts::session::{Session, SessionError};
use snapstudio_engine::{
    default_backend_registry, EditApplied, EditDispatcher, EditError, EditErrorKind, EditStudio,
    StudioError, SwitchableCredential, EDIT_CAPABILITY,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "snapstudio", version, about = "SnapStudio product photo editor")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Edit(EditArgs),
    Studio(StudioArgs),
    Presets,
}

#[derive(Debug, Parser)]
struct EditArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long, conflicts_with = "preset", required_unless_present = "preset")]
    prompt: Option<String>,
    #[arg(long)]
    preset: Option<String>,
    #[arg(long)]
    out: PathBuf,
    #[arg(long = "model")]
    models: Vec<String>,
    #[arg(long)]
    dryrun: bool,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct StudioArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    image: Option<PathBuf>,
    #[arg(long = "model")]
    models: Vec<String>,
    #[arg(long)]
    dryrun: bool,
    #[arg(long)]
    events: Option<PathBuf>,
}

const EXPORT_FILE_STEM: &str = "edited-product";

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("snapstudio error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Edit(args) => run_edit(args),
        Command::Studio(args) => {
            run_studio(args)?;
            Ok(0)
        }
        Command::Presets => {
            for line in preset_table() {
                println!("{line}");
            }
            Ok(0)
        }
    }
}

fn resolve_candidates(models: &[String], dryrun: bool) -> Vec<String> {
    let explicit = models
        .iter()
        .map(|model| model.trim().to_string())
        .filter(|model| !model.is_empty())
        .collect::<Vec<String>>();
    if !explicit.is_empty() {
        return explicit;
    }
    if dryrun {
        return vec![DRYRUN_EDIT_MODEL.to_string()];
    }
    DEFAULT_EDIT_MODELS
        .iter()
        .map(|model| model.to_string())
        .collect()
}

fn build_studio(models: &[String], dryrun: bool, events: Option<PathBuf>) -> Result<EditStudio> {
    let dispatcher = EditDispatcher::new(
        resolve_candidates(models, dryrun),
        ModelRegistry::default(),
        default_backend_registry(),
    )?;
    Ok(EditStudio::new(
        dispatcher,
        SwitchableCredential::default(),
        events,
    ))
}

fn run_edit(args: EditArgs) -> Result<i32> {
    let studio = build_studio(&args.models, args.dryrun, args.events.clone())?;
    studio.load_source_path(&args.image)?;

    let outcome = match (&args.preset, &args.prompt) {
        (Some(preset), _) => studio.apply_preset(preset),
        (None, Some(prompt)) => studio.apply_edit(prompt),
        (None, None) => studio.apply_edit(""),
    };
    match outcome {
        Ok(applied) => {
            let path = studio.export_current(&args.out)?;
            println!(
                "Edited with {} ({} attempt{}) -> {}",
                applied.backend_used,
                applied.attempts,
                if applied.attempts == 1 { "" } else { "s" },
                path.display()
            );
            Ok(0)
        }
        Err(StudioError::Edit(err)) => {
            for line in edit_failure_lines(&err, false) {
                eprintln!("{line}");
            }
            Ok(1)
        }
        Err(err) => Err(err.into()),
    }
}

fn run_studio(args: StudioArgs) -> Result<()> {
    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let studio = build_studio(&args.models, args.dryrun, Some(events_path))?;

    if let Some(image) = args.image.as_deref() {
        let lineage = studio.load_source_path(image)?;
        println!("Loaded {} (lineage {lineage})", image.display());
    }

    let stdin = io::stdin();
    let mut line = String::new();

    println!("SnapStudio started. Type an edit instruction or /help for commands.");

    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim_end_matches(['\n', '\r']);
        let intent = parse_intent(input);
        match intent.action.as_str() {
            "noop" => continue,
            "help" => {
                println!("Commands: {}", STUDIO_HELP_COMMANDS.join(" "));
                println!("Anything else is sent as an edit instruction.");
            }
            "quit" => break,
            "load_source" => {
                let path = intent.arg_str("path");
                if path.is_empty() {
                    println!("/upload requires a path");
                    continue;
                }
                match studio.load_source_path(Path::new(path)) {
                    Ok(lineage) => println!("Loaded {path} (lineage {lineage})"),
                    Err(err) => println!("Upload failed: {err:#}"),
                }
            }
            "edit" => {
                let prompt = intent.prompt.as_deref().unwrap_or_default();
                report_studio_edit(studio.apply_edit(prompt), &args.out)?;
            }
            "apply_preset" => {
                let preset = intent.arg_str("preset");
                if preset.is_empty() {
                    println!("/preset requires an id (see /presets)");
                    continue;
                }
                report_studio_edit(studio.apply_preset(preset), &args.out)?;
            }
            "list_presets" => {
                for line in preset_table() {
                    println!("{line}");
                }
            }
            "show_history" => {
                for line in history_lines(&studio.session()?) {
                    println!("{line}");
                }
            }
            "export" => {
                let session = studio.session()?;
                let Some(current) = session.current() else {
                    println!("No edited image to export.");
                    continue;
                };
                let requested = intent.arg_str("path");
                let path = if requested.is_empty() {
                    args.out
                        .join(format!("{EXPORT_FILE_STEM}.{}", current.extension()))
                } else {
                    PathBuf::from(requested)
                };
                match studio.export_current(&path) {
                    Ok(path) => println!("Exported {}", path.display()),
                    Err(err) => println!("Export failed: {err:#}"),
                }
            }
            "switch_credential" => {
                let value = intent.arg_str("credential");
                if value.is_empty() {
                    studio.switch_credential(None);
                    println!("Credential override cleared; using environment.");
                } else {
                    studio.switch_credential(Some(value.to_string()));
                    println!("Credential switched for subsequent edits.");
                }
            }
            "list_models" => {
                for line in model_lines(studio.dispatcher()) {
                    println!("{line}");
                }
                if studio.credentials().has_override() {
                    println!("Using switched credential.");
                }
            }
            "unknown" => {
                println!(
                    "Unknown command /{}. Type /help for commands.",
                    intent.arg_str("command")
                );
            }
            other => {
                println!("Unhandled action: {other}");
            }
        }
    }

    Ok(())
}

fn report_studio_edit(outcome: Result<EditApplied, StudioError>, out_dir: &Path) -> Result<()> {
    match outcome {
        Ok(applied) => {
            let path = out_dir.join(artifact_file_name(
                applied.lineage,
                applied.history_len,
                applied.image.extension(),
            ));
            match write_artifact(&path, &applied) {
                Ok(()) => println!(
                    "Edited with {} (attempt {}) -> {}",
                    applied.backend_used,
                    applied.attempts,
                    path.display()
                ),
                Err(err) => println!(
                    "Edited with {} but saving the result failed: {err:#}. Use /export to retry.",
                    applied.backend_used
                ),
            }
        }
        Err(StudioError::Edit(err)) => {
            for line in edit_failure_lines(&err, true) {
                println!("{line}");
            }
        }
        Err(StudioError::Session(SessionError::Stale)) => {
            println!("Discarded a result for an image that is no longer loaded.");
        }
        Err(StudioError::Session(SessionError::InvalidState)) => {
            println!("No source image loaded. Use /upload <path> first.");
        }
        Err(StudioError::UnknownPreset(id)) => {
            println!("Unknown preset '{id}'. See /presets.");
        }
        Err(StudioError::Other(err)) => return Err(err),
    }
    Ok(())
}

fn write_artifact(path: &Path, applied: &EditApplied) -> Result<()> {
    fs::write(path, applied.image.decode()?)
        .with_context(|| format!("failed to write {}", path.display()))
}

fn history_lines(session: &Session) -> Vec<String> {
    let mut lines = vec![match session.original() {
        Some(original) => format!("Original: {}", original.mime_type()),
        None => "No source image loaded.".to_string(),
    }];
    let history = session.history();
    if history.is_empty() {
        lines.push("No edits yet.".to_string());
    }
    for (idx, image) in history.iter().enumerate() {
        let marker = if idx + 1 == history.len() {
            " (current)"
        } else {
            ""
        };
        lines.push(format!("  {}. {}{marker}", idx + 1, image.mime_type()));
    }
    lines
}

fn model_lines(dispatcher: &EditDispatcher) -> Vec<String> {
    let registry = dispatcher.registry();
    let candidates = dispatcher.candidates();
    let mut lines = candidates
        .iter()
        .enumerate()
        .map(|(idx, name)| {
            let provider = registry
                .get(name)
                .map(|spec| spec.provider.as_str())
                .unwrap_or("unregistered");
            format!("  {}. {name} ({provider})", idx + 1)
        })
        .collect::<Vec<String>>();
    let others = registry
        .by_capability(EDIT_CAPABILITY)
        .into_iter()
        .map(|spec| spec.name)
        .filter(|name| !candidates.contains(name))
        .collect::<Vec<String>>();
    if !others.is_empty() {
        lines.push(format!("Also available with --model: {}", others.join(", ")));
    }
    lines
}

fn artifact_file_name(lineage: u64, index: usize, extension: &str) -> String {
    format!("edit-{lineage}-{index}.{extension}")
}

fn edit_failure_lines(err: &EditError, interactive: bool) -> Vec<String> {
    let mut lines = vec![format!("Edit failed: {}", err.user_message())];
    if let Some(hint) = err.user_hint() {
        lines.push(hint.to_string());
    }
    if interactive && err.kind == EditErrorKind::BackendQuotaExhausted {
        lines.push("Use /key <credential> to switch, then retry.".to_string());
    }
    lines
}

fn preset_table() -> Vec<String> {
    PRESETS
        .iter()
        .map(|preset| format!("{:<10} {:<20} {}", preset.id, preset.label, preset.prompt))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use clap::Parser;
    use snapstudio_contracts::image::ImageRef;
    use snapstudio_contracts::models::{ModelRegistry, DEFAULT_EDIT_MODELS, DRYRUN_EDIT_MODEL};
    use snapstudio_contracts::session::Session;
    use snapstudio_engine::{
        default_backend_registry, EditApplied, EditDispatcher, EditError, EditErrorKind,
    };

    use super::{
        artifact_file_name, edit_failure_lines, history_lines, model_lines, preset_table,
        report_studio_edit, resolve_candidates, run_edit, Cli, Command, EditArgs,
    };

    const ONE_PIXEL_PNG: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

    #[test]
    fn candidates_prefer_explicit_models_then_dryrun_then_defaults() {
        let explicit = resolve_candidates(&[" model-b ".to_string(), "".to_string()], true);
        assert_eq!(explicit, vec!["model-b"]);
        assert_eq!(resolve_candidates(&[], true), vec![DRYRUN_EDIT_MODEL]);
        assert_eq!(resolve_candidates(&[], false), DEFAULT_EDIT_MODELS.to_vec());
    }

    #[test]
    fn edit_args_require_prompt_or_preset() {
        assert!(Cli::try_parse_from([
            "snapstudio", "edit", "--image", "in.png", "--out", "out.png"
        ])
        .is_err());
        assert!(Cli::try_parse_from([
            "snapstudio", "edit", "--image", "in.png", "--out", "out.png", "--prompt", "a",
            "--preset", "nobg",
        ])
        .is_err());

        let parsed = Cli::try_parse_from([
            "snapstudio", "edit", "--image", "in.png", "--out", "out.png", "--preset", "nobg",
            "--model", "m1", "--model", "m2",
        ]);
        match parsed.map(|cli| cli.command) {
            Ok(Command::Edit(args)) => {
                assert_eq!(args.preset.as_deref(), Some("nobg"));
                assert_eq!(args.models, vec!["m1", "m2"]);
                assert!(!args.dryrun);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn artifact_names_carry_lineage_and_index() {
        assert_eq!(artifact_file_name(2, 3, "webp"), "edit-2-3.webp");
    }

    #[test]
    fn quota_failures_point_to_credential_switch() {
        let err = EditError::new(
            EditErrorKind::BackendQuotaExhausted,
            "429 RESOURCE_EXHAUSTED",
            Some("gemini-3-pro-image-preview"),
            2,
        );
        let lines = edit_failure_lines(&err, true);
        assert_eq!(lines[0], "Edit failed: 429 RESOURCE_EXHAUSTED");
        assert!(lines.iter().any(|line| line.contains("/key")));
        assert!(!edit_failure_lines(&err, false)
            .iter()
            .any(|line| line.contains("/key")));

        let transport = EditError::new(
            EditErrorKind::TransportFailure,
            "error sending request",
            Some("gemini-2.5-flash-image"),
            1,
        );
        assert_eq!(
            edit_failure_lines(&transport, true),
            vec!["Edit failed: Something went wrong while processing the image."]
        );
    }

    #[test]
    fn preset_table_lists_every_preset() {
        let table = preset_table();
        assert_eq!(table.len(), 6);
        assert!(table[0].starts_with("nobg"));
    }

    #[test]
    fn dryrun_edit_writes_output_and_events() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let input = temp.path().join("product.png");
        fs::write(&input, ImageRef::from_base64("image/png", ONE_PIXEL_PNG).decode()?)?;
        let out = temp.path().join("result.png");
        let events = temp.path().join("events.jsonl");

        let code = run_edit(EditArgs {
            image: input,
            prompt: None,
            preset: Some("shadow".to_string()),
            out: out.clone(),
            models: Vec::new(),
            dryrun: true,
            events: Some(events.clone()),
        })?;
        assert_eq!(code, 0);
        assert!(fs::metadata(&out)?.len() > 0);
        let log = fs::read_to_string(events)?;
        assert!(log.contains("\"edit_succeeded\""));
        assert!(log.contains("\"exported\""));
        Ok(())
    }

    #[test]
    fn history_marks_only_latest_entry_current() -> anyhow::Result<()> {
        let mut session = Session::new();
        session.load_source(ImageRef::from_bytes("image/png", b"source"));
        let same = ImageRef::from_bytes("image/png", b"identical");
        session.record_edit(same.clone())?;
        session.record_edit(same)?;

        let lines = history_lines(&session);
        let current = lines
            .iter()
            .filter(|line| line.ends_with("(current)"))
            .collect::<Vec<_>>();
        assert_eq!(current.len(), 1);
        assert!(current[0].starts_with("  2."));
        Ok(())
    }

    #[test]
    fn artifact_write_failure_does_not_end_the_studio() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let applied = EditApplied {
            image: ImageRef::from_bytes("image/png", b"edited"),
            backend_used: DRYRUN_EDIT_MODEL.to_string(),
            attempts: 1,
            lineage: 1,
            history_len: 1,
        };
        let missing_dir = temp.path().join("missing");
        report_studio_edit(Ok(applied.clone()), &missing_dir)?;
        assert!(!missing_dir.exists());

        report_studio_edit(Ok(applied), temp.path())?;
        assert_eq!(fs::read(temp.path().join("edit-1-1.png"))?, b"edited".to_vec());
        Ok(())
    }

    #[test]
    fn model_listing_shows_candidates_and_other_edit_models() -> anyhow::Result<()> {
        let dispatcher = EditDispatcher::new(
            vec![DRYRUN_EDIT_MODEL.to_string()],
            ModelRegistry::default(),
            default_backend_registry(),
        )?;
        let lines = model_lines(&dispatcher);
        assert_eq!(lines[0], format!("  1. {DRYRUN_EDIT_MODEL} (dryrun)"));
        let others = lines.last().cloned().unwrap_or_default();
        for model in DEFAULT_EDIT_MODELS {
            assert!(others.contains(model), "{others}");
        }
        assert!(!others.contains(DRYRUN_EDIT_MODEL));
        Ok(())
    }
}
