use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indexmap::IndexMap;
use sdforge_contracts::config::{
    ChoiceControl, Control, ControlState, FloatControl, IntControl, TextControl, UiConfig,
    UI_CONFIG_FILE,
};
use sdforge_contracts::models::{
    ModelCatalog, ModelReference, SelectionSet, DEFAULT_SELECTION_WEIGHT,
};
use sdforge_contracts::prompt::{adjust, suggest, CompletionTrigger, WeightDirection};
use sdforge_contracts::request::GenerationRequest;
use sdforge_contracts::response::{info_lines, GeneratedImage};
use sdforge_contracts::tags::TagRepository;
use sdforge_engine::{api_url_from_env, spawn_generation, ForgeClient};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sdforge", version, about = "Stable Diffusion Forge client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List vocabulary tags, optionally filtered by prefix.
    Tags(TagsArgs),
    /// Resolve the completion context at a cursor and suggest tags.
    Complete(CompleteArgs),
    /// Step the weight of the selected prompt token.
    Weight(WeightArgs),
    /// Print the txt2img request body without sending it.
    Payload(PayloadArgs),
    /// Submit a txt2img request and save the returned images.
    Generate(GenerateArgs),
}

#[derive(Debug, Parser)]
struct VocabularyArgs {
    /// Tag directory; repeatable. Replaces the default search paths.
    #[arg(long = "dir")]
    dirs: Vec<PathBuf>,
    #[arg(long)]
    app_root: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct TagsArgs {
    #[command(flatten)]
    vocabulary: VocabularyArgs,
    #[arg(long)]
    prefix: Option<String>,
    #[arg(long, default_value_t = 50)]
    limit: usize,
}

#[derive(Debug, Parser)]
struct CompleteArgs {
    #[command(flatten)]
    vocabulary: VocabularyArgs,
    #[arg(long)]
    text: String,
    /// Byte offset of the cursor; defaults to the end of the text.
    #[arg(long)]
    cursor: Option<usize>,
    /// Complete even when the prefix is shorter than the trigger length.
    #[arg(long)]
    force: bool,
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

#[derive(Debug, Parser)]
struct WeightArgs {
    #[arg(long)]
    text: String,
    #[arg(long)]
    start: usize,
    #[arg(long)]
    end: usize,
    #[arg(long)]
    down: bool,
}

#[derive(Debug, Parser)]
struct RequestArgs {
    #[arg(long, default_value = "")]
    prompt: String,
    #[arg(long)]
    negative_prompt: Option<String>,
    #[arg(long)]
    steps: Option<u32>,
    #[arg(long)]
    sampler: Option<String>,
    #[arg(long)]
    scheduler: Option<String>,
    #[arg(long, value_parser = parse_finite_f64)]
    cfg_scale: Option<f64>,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    #[arg(long)]
    batch_size: Option<u32>,
    #[arg(long)]
    batch_count: Option<u32>,
    #[arg(long, allow_negative_numbers = true)]
    seed: Option<i64>,
    #[arg(long, allow_negative_numbers = true)]
    subseed: Option<i64>,
    #[arg(long)]
    clip_skip: Option<u32>,
    #[arg(long)]
    checkpoint: Option<String>,
    #[arg(long)]
    vae: Option<String>,
    #[arg(long)]
    text_encoder: Option<String>,
    /// GPU weight budget in MB.
    #[arg(long)]
    gpu_weight_limit: Option<u64>,
    /// LoRA as NAME or NAME:WEIGHT; repeatable.
    #[arg(long = "lora")]
    loras: Vec<String>,
    #[arg(long)]
    ui_config: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct PayloadArgs {
    #[command(flatten)]
    request: RequestArgs,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[command(flatten)]
    request: RequestArgs,
    #[arg(long)]
    out: PathBuf,
    /// Overrides SDFORGE_API_URL.
    #[arg(long)]
    api_url: Option<String>,
}

const UI_CONFIG_SECTION: &str = "txt2img";
const PROGRESS_POLL_INTERVAL: Duration = Duration::from_millis(1000);

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("sdforge error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Tags(args) => run_tags(args),
        Command::Complete(args) => run_complete(args),
        Command::Weight(args) => run_weight(args),
        Command::Payload(args) => run_payload(args),
        Command::Generate(args) => run_generate(args),
    }
}

fn app_root(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    let exe = env::current_exe().context("failed to locate the sdforge executable")?;
    Ok(exe
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(".")))
}

fn load_vocabulary(args: &VocabularyArgs) -> Result<TagRepository> {
    let repository = if args.dirs.is_empty() {
        TagRepository::from_app_root(&app_root(args.app_root.as_deref())?)
    } else {
        TagRepository::new(args.dirs.clone())
    };
    for diagnostic in repository.diagnostics() {
        warn!(path = %diagnostic.path.display(), "{}", diagnostic.message);
    }
    debug!(
        tags = repository.tags().len(),
        dirs = repository.search_paths().len(),
        "vocabulary loaded"
    );
    Ok(repository)
}

fn run_tags(args: TagsArgs) -> Result<i32> {
    let repository = load_vocabulary(&args.vocabulary)?;
    let tags: Vec<&str> = match args.prefix.as_deref() {
        Some(prefix) => suggest(repository.tags(), prefix, args.limit),
        None => repository
            .tags()
            .iter()
            .take(args.limit)
            .map(String::as_str)
            .collect(),
    };
    for tag in tags {
        println!("{tag}");
    }
    Ok(0)
}

#[derive(Debug, Serialize)]
struct CompletionReport<'a> {
    replace_start: usize,
    prefix: String,
    suggestions: Vec<&'a str>,
    /// Buffer and cursor after accepting the first suggestion.
    accepted: Option<AcceptedCompletion>,
}

#[derive(Debug, Serialize)]
struct AcceptedCompletion {
    text: String,
    cursor: usize,
}

fn run_complete(args: CompleteArgs) -> Result<i32> {
    let repository = load_vocabulary(&args.vocabulary)?;
    let cursor = args.cursor.unwrap_or(args.text.len());
    let Some(context) = CompletionTrigger::default().context(&args.text, cursor, args.force)
    else {
        println!("{}", json!({ "context": Value::Null }));
        return Ok(1);
    };
    let suggestions = suggest(repository.tags(), &context.prefix, args.limit);
    let accepted = suggestions
        .first()
        .and_then(|completion| context.apply(&args.text, completion))
        .map(|(text, cursor)| AcceptedCompletion { text, cursor });
    let report = CompletionReport {
        replace_start: context.replace_start,
        prefix: context.prefix.clone(),
        suggestions,
        accepted,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(0)
}

fn run_weight(args: WeightArgs) -> Result<i32> {
    let direction = if args.down {
        WeightDirection::Decrease
    } else {
        WeightDirection::Increase
    };
    let edit = adjust(&args.text, args.start..args.end, direction.delta());
    let Some((text, selection)) = edit.and_then(|edit| edit.apply(&args.text)) else {
        println!(
            "{}",
            json!({ "changed": false, "text": args.text })
        );
        return Ok(1);
    };
    let report = json!({
        "changed": true,
        "text": text,
        "selection": [selection.start, selection.end],
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(0)
}

fn run_payload(args: PayloadArgs) -> Result<i32> {
    let mut request = GenerationRequest::default();
    apply_ui_config(&mut request, &load_ui_config(&args.request)?, &[]);
    let selections = parse_selections(&args.request.loras, &ModelCatalog::default())?;
    apply_request_args(&mut request, &args.request);
    request.selections = selections.selections();
    println!("{}", serde_json::to_string_pretty(&request.to_payload())?);
    Ok(0)
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let base_url = args.api_url.clone().unwrap_or_else(api_url_from_env);
    let client = ForgeClient::new(&base_url)?;
    info!(base_url = client.base_url(), "connecting to generation service");

    let metadata = client.load_metadata();
    for message in &metadata.errors {
        warn!("{message}");
    }
    let mut request = GenerationRequest::default()
        .with_server_options(&metadata.options, &metadata.samplers);
    apply_ui_config(&mut request, &load_ui_config(&args.request)?, &metadata.samplers);

    let catalog = match client.list_loras() {
        Ok(catalog) => catalog,
        Err(err) => {
            warn!("LoRA listing unavailable: {err}");
            ModelCatalog::default()
        }
    };
    let selections = parse_selections(&args.request.loras, &catalog)?;
    apply_request_args(&mut request, &args.request);
    request.selections = selections.selections();

    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;

    let (worker, outcome) = spawn_generation(client.clone(), request);
    let images = loop {
        match outcome.recv_timeout(PROGRESS_POLL_INTERVAL) {
            Ok(result) => break result,
            Err(RecvTimeoutError::Timeout) => match client.progress() {
                Ok(Some(snapshot)) => eprintln!("{}", snapshot.status_line()),
                Ok(None) => {}
                Err(err) => debug!("progress poll failed: {err}"),
            },
            Err(RecvTimeoutError::Disconnected) => {
                bail!("generation worker exited without a result")
            }
        }
    };
    if worker.join().is_err() {
        warn!("generation worker panicked after reporting");
    }
    let images = match images {
        Ok(images) => images,
        Err(message) => bail!("generation failed: {message}"),
    };
    if images.is_empty() {
        bail!("generation returned no images");
    }

    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S").to_string();
    for (index, image) in images.iter().enumerate() {
        let path = write_image(&args.out, &stamp, index, image)?;
        println!("{}", path.display());
    }
    Ok(0)
}

fn write_image(out_dir: &Path, stamp: &str, index: usize, image: &GeneratedImage) -> Result<PathBuf> {
    let path = out_dir.join(format!("image-{stamp}-{:02}.png", index + 1));
    fs::write(&path, &image.data)
        .with_context(|| format!("failed to write {}", path.display()))?;
    let info_path = path.with_extension("txt");
    fs::write(&info_path, info_lines(image).join("\n") + "\n")
        .with_context(|| format!("failed to write {}", info_path.display()))?;
    Ok(path)
}

fn load_ui_config(args: &RequestArgs) -> Result<UiConfig> {
    let path = match &args.ui_config {
        Some(path) => path.clone(),
        None => app_root(None)?.join(UI_CONFIG_FILE),
    };
    let config = UiConfig::load(path);
    if let Some(error) = config.error() {
        warn!(path = %config.path().display(), "failed to load ui config: {error}");
    }
    Ok(config)
}

fn parse_finite_f64(text: &str) -> Result<f64, String> {
    match text.trim().parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        Ok(_) => Err(format!("`{text}` is not a finite number")),
        Err(err) => Err(err.to_string()),
    }
}

/// Parses `NAME` or `NAME:WEIGHT`. The weight is split at the last colon so
/// names containing colons still work when a weight is given.
fn parse_lora_arg(text: &str) -> Result<(String, f64)> {
    let trimmed = text.trim();
    if let Some((name, weight)) = trimmed.rsplit_once(':') {
        if let Ok(weight) = weight.trim().parse::<f64>() {
            if !weight.is_finite() {
                bail!("--lora weight for `{name}` must be a finite number");
            }
            return Ok((name.trim().to_string(), weight));
        }
    }
    if trimmed.is_empty() {
        bail!("--lora requires a name");
    }
    Ok((trimmed.to_string(), DEFAULT_SELECTION_WEIGHT))
}

/// Resolves `--lora` arguments against the catalog. Unknown names are still
/// sent, under the name given.
fn parse_selections(args: &[String], catalog: &ModelCatalog) -> Result<SelectionSet> {
    let mut selections = SelectionSet::new();
    for arg in args {
        let (name, weight) = parse_lora_arg(arg)?;
        let reference = match catalog.find(&name) {
            Some(reference) => reference,
            None => {
                if !catalog.is_empty() {
                    warn!(name, "LoRA not found in the service listing");
                }
                Arc::new(ModelReference::new(name.as_str())?)
            }
        };
        selections.add_or_update(reference, weight);
    }
    Ok(selections)
}

fn int_control(value: i64, minimum: i64, maximum: i64, step: i64) -> ControlState {
    ControlState::new(Control::Integer(IntControl {
        value: value.clamp(minimum, maximum),
        minimum,
        maximum,
        step,
    }))
}

fn form_controls(request: &GenerationRequest, samplers: &[String]) -> IndexMap<&'static str, ControlState> {
    let mut sampler = ChoiceControl {
        items: samplers.to_vec(),
        current: None,
    };
    sampler.select(&request.sampler);
    let mut scheduler = ChoiceControl::default();
    if let Some(value) = request.scheduler.as_deref() {
        scheduler.select(value);
    }
    IndexMap::from([
        (
            "prompt",
            ControlState::new(Control::Text(TextControl {
                text: request.prompt.clone(),
            })),
        ),
        (
            "negative_prompt",
            ControlState::new(Control::Text(TextControl {
                text: request.negative_prompt.clone(),
            })),
        ),
        ("sampler", ControlState::new(Control::Choice(sampler))),
        ("scheduler", ControlState::new(Control::Choice(scheduler))),
        ("steps", int_control(i64::from(request.steps), 1, 200, 1)),
        (
            "clip_skip",
            int_control(i64::from(request.clip_skip.unwrap_or(0)), 0, 12, 1),
        ),
        (
            "cfg_scale",
            ControlState::new(Control::Float(FloatControl {
                value: request.cfg_scale.clamp(1.0, 30.0),
                minimum: 1.0,
                maximum: 30.0,
                step: 0.5,
            })),
        ),
        ("width", int_control(i64::from(request.width), 64, 2048, 64)),
        ("height", int_control(i64::from(request.height), 64, 2048, 64)),
        ("batch_size", int_control(i64::from(request.batch_size), 1, 8, 1)),
        ("batch_count", int_control(i64::from(request.batch_count), 1, 16, 1)),
        ("seed", int_control(request.seed, -1, 2_147_483_647, 1)),
        (
            "gpu_weight_limit",
            int_control(
                request
                    .gpu_weight_limit
                    .and_then(|value| i64::try_from(value).ok())
                    .unwrap_or(0),
                0,
                32_768,
                1,
            ),
        ),
    ])
}

/// Overlays the `txt2img` section of the ui config onto the request. Hidden
/// or disabled controls keep the value they had.
fn apply_ui_config(request: &mut GenerationRequest, config: &UiConfig, samplers: &[String]) {
    let section = config.section(UI_CONFIG_SECTION);
    if section.is_empty() {
        return;
    }
    let mut controls = form_controls(request, samplers);
    for (name, properties) in &section {
        let key = name.to_lowercase();
        match controls.get_mut(key.as_str()) {
            Some(state) => state.apply_properties(properties),
            None => debug!(control = %name, "ui config names an unknown control"),
        }
    }
    for (name, state) in controls {
        if !state.visible || !state.enabled {
            continue;
        }
        match (name, state.control) {
            ("prompt", Control::Text(control)) => request.prompt = control.text,
            ("negative_prompt", Control::Text(control)) => request.negative_prompt = control.text,
            ("sampler", Control::Choice(control)) => {
                if let Some(text) = control.current_text() {
                    request.sampler = text.to_string();
                }
            }
            ("scheduler", Control::Choice(control)) => {
                request.scheduler = control.current_text().map(str::to_string);
            }
            ("cfg_scale", Control::Float(control)) => request.cfg_scale = control.value,
            ("seed", Control::Integer(control)) => request.seed = control.value,
            ("clip_skip", Control::Integer(control)) => {
                request.clip_skip = u32::try_from(control.value).ok().filter(|value| *value > 0);
            }
            ("gpu_weight_limit", Control::Integer(control)) => {
                request.gpu_weight_limit = u64::try_from(control.value).ok().filter(|value| *value > 0);
            }
            (name, Control::Integer(control)) => {
                let Ok(value) = u32::try_from(control.value) else {
                    continue;
                };
                match name {
                    "steps" => request.steps = value,
                    "width" => request.width = value,
                    "height" => request.height = value,
                    "batch_size" => request.batch_size = value,
                    "batch_count" => request.batch_count = value,
                    _ => {}
                }
            }
            _ => {}
        }
    }
}

fn apply_request_args(request: &mut GenerationRequest, args: &RequestArgs) {
    if !args.prompt.is_empty() {
        request.prompt = args.prompt.clone();
    }
    if let Some(value) = &args.negative_prompt {
        request.negative_prompt = value.clone();
    }
    if let Some(value) = args.steps {
        request.steps = value;
    }
    if let Some(value) = &args.sampler {
        request.sampler = value.clone();
    }
    if let Some(value) = &args.scheduler {
        request.scheduler = Some(value.clone());
    }
    if let Some(value) = args.cfg_scale {
        request.cfg_scale = value;
    }
    if let Some(value) = args.width {
        request.width = value;
    }
    if let Some(value) = args.height {
        request.height = value;
    }
    if let Some(value) = args.batch_size {
        request.batch_size = value;
    }
    if let Some(value) = args.batch_count {
        request.batch_count = value;
    }
    if let Some(value) = args.seed {
        request.seed = value;
    }
    if args.subseed.is_some() {
        request.subseed = args.subseed;
    }
    if let Some(value) = args.clip_skip {
        request.clip_skip = Some(value).filter(|value| *value > 0);
    }
    if let Some(value) = &args.checkpoint {
        request.checkpoint = Some(value.clone());
    }
    if let Some(value) = &args.vae {
        request.vae = Some(value.clone());
    }
    if let Some(value) = &args.text_encoder {
        request.text_encoder = Some(value.clone());
    }
    if let Some(value) = args.gpu_weight_limit {
        request.gpu_weight_limit = Some(value).filter(|value| *value > 0);
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use sdforge_contracts::models::ModelReference;
    use serde_json::json;

    use super::*;

    #[test]
    fn lora_args_split_on_last_colon() -> anyhow::Result<()> {
        assert_eq!(parse_lora_arg("film_grain:0.5")?, ("film_grain".to_string(), 0.5));
        assert_eq!(parse_lora_arg("style:v2:1.25")?, ("style:v2".to_string(), 1.25));
        assert_eq!(
            parse_lora_arg("style:v2")?,
            ("style:v2".to_string(), DEFAULT_SELECTION_WEIGHT)
        );
        assert!(parse_lora_arg("  ").is_err());
        assert!(parse_lora_arg("grain:NaN").is_err());
        Ok(())
    }

    #[test]
    fn non_finite_cfg_scale_is_rejected() -> anyhow::Result<()> {
        for bad in ["NaN", "inf", "-inf"] {
            let parsed = Cli::try_parse_from(["sdforge", "payload", "--cfg-scale", bad]);
            assert!(parsed.is_err(), "{bad} should be rejected");
        }
        let cli = Cli::try_parse_from(["sdforge", "payload", "--cfg-scale", "4.5"])?;
        let Command::Payload(args) = cli.command else {
            anyhow::bail!("expected the payload command");
        };
        assert_eq!(args.request.cfg_scale, Some(4.5));
        Ok(())
    }

    #[test]
    fn non_finite_ui_config_value_keeps_cfg_scale() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join(UI_CONFIG_FILE);
        fs::write(
            &path,
            json!({
                "txt2img/cfg_scale/value": "nan",
                "txt2img/cfg_scale/minimum": "NaN",
            })
            .to_string(),
        )?;
        let mut request = GenerationRequest::default();
        apply_ui_config(&mut request, &UiConfig::load(&path), &[]);
        assert_eq!(request.cfg_scale, 7.0);
        assert_eq!(request.to_payload()["cfg_scale"], json!(7.0));
        Ok(())
    }

    #[test]
    fn selections_resolve_aliases_and_keep_last_weight() -> anyhow::Result<()> {
        let catalog = ModelCatalog::new([ModelReference::new("detail_tweaker_xl")?
            .with_alias(Some("detail"))]);
        let selections = parse_selections(
            &["detail:0.4".to_string(), "detail_tweaker_xl:0.8".to_string(), "other".to_string()],
            &catalog,
        )?;
        assert_eq!(selections.len(), 2);
        assert_eq!(selections.get("detail_tweaker_xl").map(|s| s.weight), Some(0.8));
        assert!(selections.get("other").is_some());
        Ok(())
    }

    #[test]
    fn ui_config_overlays_form_values() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join(UI_CONFIG_FILE);
        fs::write(
            &path,
            json!({
                "txt2img/steps/value": 400,
                "txt2img/Width/value": "768",
                "txt2img/sampler/value": "dpm++ 2m",
                "txt2img/seed/visible": false,
                "txt2img/seed/value": 5,
                "img2img/steps/value": 3,
            })
            .to_string(),
        )?;
        let config = UiConfig::load(&path);
        assert_eq!(config.error(), None);

        let mut request = GenerationRequest::default();
        apply_ui_config(
            &mut request,
            &config,
            &["Euler a".to_string(), "DPM++ 2M".to_string()],
        );
        assert_eq!(request.steps, 200);
        assert_eq!(request.width, 768);
        assert_eq!(request.sampler, "DPM++ 2M");
        assert_eq!(request.seed, -1);
        Ok(())
    }

    #[test]
    fn explicit_args_override_defaults() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "sdforge",
            "payload",
            "--prompt",
            "harbor at dusk",
            "--seed",
            "-1",
            "--steps",
            "30",
            "--clip-skip",
            "0",
            "--lora",
            "grain:0.7",
        ])?;
        let Command::Payload(args) = cli.command else {
            anyhow::bail!("expected the payload command");
        };
        let mut request = GenerationRequest::default();
        apply_request_args(&mut request, &args.request);
        request.selections = parse_selections(&args.request.loras, &ModelCatalog::default())?
            .selections();
        let payload = request.to_payload();
        assert_eq!(payload["steps"], json!(30));
        assert_eq!(payload["prompt"], json!("harbor at dusk\n<lora:grain:0.7>"));
        assert!(payload["override_settings"]
            .get("CLIP_stop_at_last_layers")
            .is_none());
        Ok(())
    }
}
