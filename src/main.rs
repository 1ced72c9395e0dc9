use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::mpsc;
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use testsmith::config::{config_path, AppConfig};
use testsmith::llm::{LlmClient, Provider};
use testsmith::logger;
use testsmith::parser::{select, ObjectLister, PythonLister};
use testsmith::session::Session;
use testsmith::state::{TargetObject, Verdict};
use testsmith::testgen::{Kickoff, Pipeline};
use testsmith::App;

#[derive(Parser)]
#[command(
    name = "testsmith",
    version,
    about = "Generate unit tests for Python code with an LLM, verified in a read-only container."
)]
struct Cli {
    #[arg(long, global = true, default_value = ".", help = "Project root mounted into the sandbox")]
    project: PathBuf,

    #[arg(long, short, global = true, default_value_t = false, help = "Debug logging")]
    verbose: bool,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// List the functions and methods of a module
    Objects { file: PathBuf },
    /// Generate a test for one function or method
    Generate(GenerateArgs),
    /// Inspect or change stored tests
    #[command(subcommand)]
    Records(RecordsCommand),
    /// Coverage accumulated by the accepted tests of an object
    Coverage(TargetArgs),
    /// Token usage per model
    Usage,
    /// Save provider, model and API key to the user config
    Configure(ConfigureArgs),
}

#[derive(Args, Debug, Clone)]
struct TargetArgs {
    #[arg(help = "Module path, relative to the project root")]
    file: PathBuf,

    #[arg(help = "Function or method name")]
    name: String,

    #[arg(long, help = "Class the method belongs to")]
    class: Option<String>,

    #[arg(long, default_value_t = false, help = "Print JSON")]
    json: bool,
}

#[derive(Args, Debug, Clone)]
struct GenerateArgs {
    file: PathBuf,

    name: String,

    #[arg(long, help = "Class the method belongs to")]
    class: Option<String>,

    #[arg(long, help = "Samples per iteration")]
    n_samples: Option<u32>,

    #[arg(long, help = "Maximum number of reprompt iterations")]
    max_iter: Option<u32>,

    #[arg(long, help = "Sampling temperature")]
    temperature: Option<f32>,

    #[arg(long, help = "Model id")]
    model: Option<String>,

    #[arg(long, default_value_t = false, help = "Also store tests that never passed")]
    persist_failures: bool,

    #[arg(long, requires = "instruction", help = "Continue the conversation of a stored test")]
    seed_record: Option<String>,

    #[arg(long, help = "Extra instruction appended as a user message")]
    instruction: Option<String>,

    #[arg(long, default_value_t = false, help = "Print every prompt and response")]
    show_prompts: bool,
}

#[derive(Subcommand)]
enum RecordsCommand {
    /// List stored tests
    List {
        #[arg(long, help = "Only records of this object id")]
        object: Option<String>,
    },
    /// Print a stored test
    Show {
        id: String,
        #[arg(long, default_value_t = false, help = "Print the conversation too")]
        history: bool,
    },
    /// Delete a stored test
    Delete { id: String },
    /// Replace a stored test's source
    Edit {
        id: String,
        #[arg(long, help = "File with the new source, `-` for stdin")]
        from: PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
struct ConfigureArgs {
    #[arg(long, default_value = "openai", help = "openai | anthropic")]
    provider: String,

    #[arg(long)]
    model: Option<String>,

    #[arg(long, help = "API key; read from stdin when omitted")]
    api_key: Option<String>,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    logger::init(cli.verbose);

    match cli.command {
        CliCommand::Objects { file } => list_objects(&cli.project, &file).map(|_| ExitCode::SUCCESS),
        CliCommand::Generate(args) => generate(&cli.project, args),
        CliCommand::Records(cmd) => records(&cli.project, cmd).map(|_| ExitCode::SUCCESS),
        CliCommand::Coverage(args) => coverage(&cli.project, args).map(|_| ExitCode::SUCCESS),
        CliCommand::Usage => usage(&cli.project).map(|_| ExitCode::SUCCESS),
        CliCommand::Configure(args) => configure(args).map(|_| ExitCode::SUCCESS),
    }
}

/* ---------- objects ---------- */

fn list_objects(project: &Path, file: &Path) -> Result<()> {
    let objects = PythonLister.list_objects(project, file)?;
    if objects.is_empty() {
        println!("no functions or methods in {}", file.display());
    }
    for o in objects {
        println!(
            "{:<8} {:<40} lines {}-{}",
            o.kind_label(),
            o.class_name
                .as_ref()
                .map(|c| format!("{c}.{}", o.name))
                .unwrap_or_else(|| o.name.clone()),
            o.span.start,
            o.span.end
        );
    }
    Ok(())
}

fn resolve_target(project: &Path, file: &Path, name: &str, class: Option<&str>) -> Result<TargetObject> {
    let objects = PythonLister.list_objects(project, file)?;
    let known: Vec<String> = objects.iter().map(|o| o.id()).collect();
    select(objects, name, class).ok_or_else(|| {
        anyhow!(
            "no {} `{name}` in {}; known objects:\n  {}",
            if class.is_some() { "method" } else { "function" },
            file.display(),
            known.join("\n  ")
        )
    })
}

/* ---------- generate ---------- */

fn generate(project: &Path, args: GenerateArgs) -> Result<ExitCode> {
    let mut cfg = AppConfig::load()?;
    if let Some(m) = &args.model {
        cfg.llm.model = m.clone();
    }
    if let Some(n) = args.n_samples {
        cfg.generation.n_samples = n;
    }
    if let Some(n) = args.max_iter {
        cfg.generation.max_iter = n;
    }
    if let Some(t) = args.temperature {
        cfg.generation.temperature = t;
    }
    let persist_failures = args.persist_failures || cfg.generation.persist_failures;
    let gen = cfg.generation();
    gen.validate()?;

    let target = resolve_target(project, &args.file, &args.name, args.class.as_deref())?;
    let client = LlmClient::new(cfg.provider())?;

    let app = App::start(cfg, project).context("starting sandbox")?;
    let store = app.store()?;
    let sandbox = app.sandbox().context("sandbox not running")?;

    let mut session = Session::new();
    if let Some(id) = &args.seed_record {
        let record = store.find(id)?;
        if record.object_id != target.id() {
            bail!("record {id} belongs to {}, not {}", record.object_id, target.id());
        }
        session.seed_from(&record);
    }
    let kickoff = match args.instruction {
        Some(text) => Kickoff::FollowUp(text),
        None => Kickoff::Fresh,
    };

    let (tx, rx) = mpsc::channel();
    let pipeline = Pipeline::new(&client, sandbox, gen.clone())?
        .with_store(store)
        .persist_failures(persist_failures)
        .with_events(tx);

    let show_prompts = args.show_prompts;
    let joined = thread::scope(|s| {
        let session = &mut session;
        let target = &target;
        let worker = s.spawn(move || pipeline.run(session, target, kickoff));

        for ev in rx {
            if let Some(line) = logger::render(&ev, show_prompts) {
                eprintln!("{line}");
            }
        }
        worker.join()
    });
    let outcome = match joined.map_err(|_| anyhow!("generation worker panicked"))? {
        Ok(o) => o,
        Err(aborted) => {
            if let Err(e) = store.record_usage(&gen.model_id, aborted.usage) {
                warn!(error = %e, "could not record token usage");
            }
            eprintln!(
                "run aborted in {:?} at iteration {} ({} message(s) kept)",
                aborted.phase,
                aborted.iteration,
                aborted.messages.len()
            );
            return Err(aborted.into());
        }
    };

    store.record_usage(&gen.model_id, outcome.usage)?;
    info!(
        input_tokens = outcome.usage.input_tokens,
        output_tokens = outcome.usage.output_tokens,
        "token usage"
    );

    println!("{}", outcome.test_source);
    let covered = outcome.result.coverage.percent_within(target.span);
    match outcome.verdict {
        Verdict::Accepted => eprintln!(
            "accepted after {} iteration(s), {covered}% of {} covered{}",
            outcome.iterations,
            target.id(),
            if outcome.persisted {
                format!(", stored as {}", outcome.record.id)
            } else {
                String::new()
            }
        ),
        Verdict::Exhausted => eprintln!(
            "no passing test after {} iteration(s){}",
            outcome.iterations,
            if outcome.persisted {
                format!(", stored as {}", outcome.record.id)
            } else {
                String::new()
            }
        ),
    }

    app.shutdown()?;
    Ok(match outcome.verdict {
        Verdict::Accepted => ExitCode::SUCCESS,
        Verdict::Exhausted => ExitCode::from(2),
    })
}

/* ---------- records ---------- */

fn records(project: &Path, cmd: RecordsCommand) -> Result<()> {
    let app: App = App::offline(AppConfig::load()?, project)?;
    let store = app.store()?;

    match cmd {
        RecordsCommand::List { object } => {
            let all = match object {
                Some(o) => store.list(&o)?,
                None => store.list_all()?,
            };
            for r in all {
                println!(
                    "{}  {}  {:<9} iter {}  {} test(s)  {}",
                    r.id,
                    r.created_at.format("%Y-%m-%d %H:%M"),
                    if r.accepted { "accepted" } else { "failed" },
                    r.iteration_count,
                    r.result.tests_run,
                    r.object_id
                );
            }
        }
        RecordsCommand::Show { id, history } => {
            let r = store.find(&id)?;
            if history {
                for m in &r.messages {
                    println!("--- {} ---\n{}\n", m.role.as_str(), m.content);
                }
            } else {
                println!("{}", r.test_source);
            }
        }
        RecordsCommand::Delete { id } => {
            let r = store.find(&id)?;
            store.delete(&r.object_id, &r.id)?;
            eprintln!("deleted {id}");
        }
        RecordsCommand::Edit { id, from } => {
            let source = if from.as_os_str() == "-" {
                let mut buf = String::new();
                io::stdin().read_to_string(&mut buf)?;
                buf
            } else {
                fs::read_to_string(&from).with_context(|| format!("reading {}", from.display()))?
            };
            let r = store.find(&id)?;
            store.update_source(&r.object_id, &r.id, &source)?;
            eprintln!("updated {id}");
        }
    }

    app.shutdown()?;
    Ok(())
}

/* ---------- coverage / usage ---------- */

fn coverage(project: &Path, args: TargetArgs) -> Result<()> {
    let target = resolve_target(project, &args.file, &args.name, args.class.as_deref())?;
    let app: App = App::offline(AppConfig::load()?, project)?;
    let report = app.store()?.coverage(&target)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "{}: {}% covered by {} accepted test(s) ({} run, {} failed)",
            report.object_id, report.percent, report.n_tests, report.tests_run, report.failed
        );
        if !report.missing.is_empty() {
            let missing: Vec<String> = report.missing.iter().map(u32::to_string).collect();
            println!("missing lines: {}", missing.join(", "));
        }
    }

    app.shutdown()?;
    Ok(())
}

fn usage(project: &Path) -> Result<()> {
    let app: App = App::offline(AppConfig::load()?, project)?;
    let usage = app.store()?.usage();
    if usage.is_empty() {
        println!("no usage recorded");
    }
    for (model, u) in usage {
        println!("{model:<24} input {:>10}  output {:>10}", u.input_tokens, u.output_tokens);
    }
    app.shutdown()?;
    Ok(())
}

/* ---------- configure ---------- */

fn configure(args: ConfigureArgs) -> Result<()> {
    let provider = Provider::parse(&args.provider)
        .ok_or_else(|| anyhow!("unknown provider `{}`", args.provider))?;

    let key = match args.api_key {
        Some(k) => k,
        None => {
            eprint!("API key: ");
            let mut line = String::new();
            io::stdin().read_line(&mut line)?;
            line
        }
    };

    let path = config_path();
    AppConfig::configure(&path, provider, args.model, key)?;
    eprintln!("saved {}", path.display());
    Ok(())
}
