//! zen-distill CLI
//!
//! Train GNN teachers, distill them into students, search hyperparameters and
//! inspect dataset splits. Configuration is read from `train.conf.json` and
//! `dataset.conf.json` in the config directory and can be overridden per run
//! with `--set key=value`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use log::info;
use serde_json::{json, Value};

use zen_distill::config::{load_dataset_layer, load_training_layer, presets};
use zen_distill::data::{load_dataset, Dataset, DatasetSource};
use zen_distill::experiment::split_dataset;
use zen_distill::models::ModelKind;
use zen_distill::report::{render_table, split_table};
use zen_distill::{
    gen_variants, run_experiment, save_experiment, ConfigResolver, ConfigTable, ExperimentConfig,
    HyperparameterSearch, ResultTable, TableFormat,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = create_cli().get_matches();
    match matches.subcommand() {
        Some(("train", sub_matches)) => handle_train_command(sub_matches, false),
        Some(("distill", sub_matches)) => handle_train_command(sub_matches, true),
        Some(("search", sub_matches)) => handle_search_command(sub_matches),
        Some(("split", sub_matches)) => handle_split_command(sub_matches),
        _ => {
            println!("Use --help for usage information");
            Ok(())
        }
    }
}

fn common_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("dataset")
                .long("dataset")
                .short('d')
                .value_name("NAME")
                .help("Dataset directory name under --data-dir, or 'synthetic'")
                .default_value("cadets"),
        )
        .arg(
            Arg::new("teacher")
                .long("teacher")
                .short('t')
                .value_name("MODEL")
                .help("Teacher model: GCN, GAT, GraphSAGE, SGC, APPNP or MLP")
                .default_value("GCN"),
        )
        .arg(
            Arg::new("ptype")
                .long("ptype")
                .value_name("TYPE")
                .help("Preset problem type (ind = inductive)")
                .default_value(presets::INDUCTIVE),
        )
        .arg(
            Arg::new("labelrate")
                .long("labelrate")
                .value_name("N")
                .value_parser(value_parser!(usize))
                .help("Train nodes per class; switches to a per-class split with 30 validation nodes per class"),
        )
        .arg(
            Arg::new("config-dir")
                .long("config-dir")
                .value_name("PATH")
                .help("Directory holding train.conf.json and dataset.conf.json")
                .default_value("configs"),
        )
        .arg(
            Arg::new("data-dir")
                .long("data-dir")
                .value_name("PATH")
                .help("Root directory of the datasets")
                .default_value("data"),
        )
        .arg(
            Arg::new("seeds")
                .long("seeds")
                .value_name("SEEDS")
                .value_parser(value_parser!(u64))
                .value_delimiter(',')
                .num_args(1..)
                .help("Comma-separated model seeds; one run per seed"),
        )
        .arg(
            Arg::new("tablefmt")
                .long("tablefmt")
                .value_name("FORMAT")
                .help("Result table format: github, plain or tsv")
                .default_value("github"),
        )
        .arg(
            Arg::new("set")
                .long("set")
                .short('o')
                .value_name("KEY=VALUE")
                .action(ArgAction::Append)
                .help("Override a configuration key (value parsed as JSON when possible)"),
        )
}

fn create_cli() -> Command {
    Command::new("zen-distill")
        .version(zen_distill::VERSION)
        .about("GNN teacher training and knowledge distillation")
        .subcommand_required(true)
        .subcommand(
            common_args(Command::new("train").about("Train a teacher model")).arg(
                Arg::new("output-dir")
                    .long("output-dir")
                    .value_name("PATH")
                    .help("Root of the output tree")
                    .default_value("outputs"),
            ),
        )
        .subcommand(
            common_args(Command::new("distill").about("Train a teacher, then distill it into a student"))
                .arg(
                    Arg::new("output-dir")
                        .long("output-dir")
                        .value_name("PATH")
                        .help("Root of the output tree")
                        .default_value("outputs"),
                )
                .arg(
                    Arg::new("student")
                        .long("student")
                        .short('s')
                        .value_name("MODEL")
                        .help("Student model")
                        .default_value("MLP"),
                )
                .arg(
                    Arg::new("temperature")
                        .long("temperature")
                        .value_name("TAU")
                        .value_parser(value_parser!(f32))
                        .help("Softening temperature")
                        .default_value("1.0"),
                )
                .arg(
                    Arg::new("alpha")
                        .long("alpha")
                        .value_name("ALPHA")
                        .value_parser(value_parser!(f32))
                        .help("Weight of the soft-target loss")
                        .default_value("0.5"),
                ),
        )
        .subcommand(
            common_args(Command::new("search").about("Random hyperparameter search"))
                .arg(
                    Arg::new("ntrials")
                        .long("ntrials")
                        .value_name("N")
                        .value_parser(value_parser!(usize))
                        .help("Number of trials")
                        .default_value("10"),
                )
                .arg(
                    Arg::new("njobs")
                        .long("njobs")
                        .value_name("N")
                        .value_parser(value_parser!(usize))
                        .help("Number of concurrent trials")
                        .default_value("10"),
                ),
        )
        .subcommand(common_args(Command::new("split").about("Print per-class split sizes")))
}

// === SHARED SETUP ===

struct Invocation {
    dataset: String,
    teacher: ModelKind,
    ptype: String,
    labelrate: Option<usize>,
    config_dir: PathBuf,
    data_dir: PathBuf,
    seeds: Vec<u64>,
    tablefmt: TableFormat,
    overrides: Vec<String>,
}

fn string_arg(matches: &ArgMatches, name: &str) -> String {
    matches.get_one::<String>(name).cloned().unwrap_or_default()
}

impl Invocation {
    fn from_matches(matches: &ArgMatches) -> Result<Self> {
        Ok(Self {
            dataset: string_arg(matches, "dataset"),
            teacher: string_arg(matches, "teacher").parse()?,
            ptype: string_arg(matches, "ptype"),
            labelrate: matches.get_one::<usize>("labelrate").copied(),
            config_dir: PathBuf::from(string_arg(matches, "config-dir")),
            data_dir: PathBuf::from(string_arg(matches, "data-dir")),
            seeds: matches
                .get_many::<u64>("seeds")
                .map(|seeds| seeds.copied().collect())
                .unwrap_or_default(),
            tablefmt: string_arg(matches, "tablefmt").parse()?,
            overrides: matches
                .get_many::<String>("set")
                .map(|values| values.cloned().collect())
                .unwrap_or_default(),
        })
    }

    /// Merge preset, config files, the label rate and CLI overrides
    fn table(&self, extra: &[(&str, Value)]) -> Result<ConfigTable> {
        let train_path = self.config_dir.join("train.conf.json");
        let data_path = self.config_dir.join("dataset.conf.json");

        let mut resolver = ConfigResolver::new()
            .with_preset(&self.ptype, self.teacher, &self.dataset)
            .with_training(
                load_training_layer(&train_path, self.teacher)
                    .with_context(|| format!("Failed to read {}", train_path.display()))?,
            )
            .with_dataset(
                load_dataset_layer(&data_path)
                    .with_context(|| format!("Failed to read {}", data_path.display()))?,
            );
        if let Some(rate) = self.labelrate {
            resolver = resolver.with_override(
                "split",
                json!({ "mode": "per_class_count", "train_per_class": rate, "val_per_class": 30 }),
            );
        }
        for (key, value) in extra {
            resolver = resolver.with_override(key, value.clone());
        }

        let mut table = resolver.table();
        for assignment in &self.overrides {
            table.set_override(assignment)?;
        }
        Ok(table)
    }

    fn load(&self, config: &ExperimentConfig) -> Result<Dataset> {
        let source = DatasetSource::locate(&self.data_dir, &self.dataset)?;
        let dataset = load_dataset(&source, &config.load)
            .with_context(|| format!("Failed to load dataset {}", self.dataset))?;
        dataset.log_summary();
        Ok(dataset)
    }

    fn label_rate(&self, config: &ExperimentConfig) -> String {
        self.labelrate
            .map(|rate| rate.to_string())
            .unwrap_or_else(|| config.split.label_rate())
    }
}

// === COMMANDS ===

fn handle_train_command(matches: &ArgMatches, distill: bool) -> Result<()> {
    let invocation = Invocation::from_matches(matches)?;
    let output_root = PathBuf::from(string_arg(matches, "output-dir"));

    let mut extra = Vec::new();
    if distill {
        let student: ModelKind = string_arg(matches, "student").parse()?;
        extra.push(("distill", json!(true)));
        extra.push(("student", json!(student.as_str())));
        if let Some(temperature) = matches.get_one::<f32>("temperature") {
            extra.push(("temperature", json!(temperature)));
        }
        if let Some(alpha) = matches.get_one::<f32>("alpha") {
            extra.push(("distill_alpha", json!(alpha)));
        }
    }
    let table = invocation.table(&extra)?;
    let base = ExperimentConfig::from_table(&table)?;
    info!("Resolved configuration: {}", serde_json::to_string(&base)?);

    let dataset = invocation.load(&base)?;
    let seeds = if invocation.seeds.is_empty() {
        vec![base.seed]
    } else {
        invocation.seeds.clone()
    };

    let mut results = ResultTable::new(&["dataset", "model"]);
    for variant in gen_variants(&[invocation.dataset.clone()], &[invocation.teacher], &seeds) {
        let mut table = table.clone();
        table.set("seed", json!(variant.seed));
        let config = ExperimentConfig::from_table(&table)?;

        let result = run_experiment(&dataset, &config)
            .with_context(|| format!("Run failed for {:?}", variant))?;
        save_experiment(&output_root, &dataset, &result, &config, &invocation.label_rate(&config))?;
        results.record(
            vec![variant.dataset.clone(), result.final_run().model.to_string()],
            result.test_accuracy(),
        );
    }

    println!("\nFinal results:\n\n{}", results.render(invocation.tablefmt));
    Ok(())
}

fn handle_search_command(matches: &ArgMatches) -> Result<()> {
    let invocation = Invocation::from_matches(matches)?;
    let ntrials = matches.get_one::<usize>("ntrials").copied().unwrap_or(10);
    let njobs = matches.get_one::<usize>("njobs").copied().unwrap_or(10);

    let table = invocation.table(&[])?;
    let config = ExperimentConfig::from_table(&table)?;
    let dataset = invocation.load(&config)?;
    let split = split_dataset(&dataset, &config)?;

    let outcome = HyperparameterSearch::new(ntrials, njobs)
        .with_seed(invocation.seeds.first().copied().unwrap_or(config.seed))
        .run(&dataset, &split, &table)?;

    let headers: Vec<String> = [
        "trial", "num_layers", "embed_dim", "dropout", "attn_drop", "lr", "wd", "best_epoch", "val_acc", "test_acc",
    ]
    .iter()
    .map(|h| h.to_string())
    .collect();
    let rows: Vec<Vec<String>> = outcome
        .trials
        .iter()
        .map(|trial| {
            let p = &trial.params;
            vec![
                p.trial.to_string(),
                p.num_layers.to_string(),
                p.embed_dim.to_string(),
                p.dropout.to_string(),
                p.attn_drop.to_string(),
                p.learning_rate.to_string(),
                p.weight_decay.to_string(),
                trial.best_epoch.to_string(),
                format!("{:.4}", trial.best_val_accuracy),
                format!("{:.4}", trial.test_accuracy),
            ]
        })
        .collect();
    println!("\nSearch results:\n\n{}", render_table(&headers, &rows, invocation.tablefmt));
    if outcome.skipped > 0 {
        println!("\n{} trial(s) skipped for invalid configuration", outcome.skipped);
    }
    Ok(())
}

fn handle_split_command(matches: &ArgMatches) -> Result<()> {
    let invocation = Invocation::from_matches(matches)?;
    let config = ExperimentConfig::from_table(&invocation.table(&[])?)?;
    let dataset = invocation.load(&config)?;
    let split = split_dataset(&dataset, &config)?;

    println!(
        "\nSplit of {} (seed {}):\n\n{}",
        dataset.name,
        config.division_seed,
        split_table(&split.class_breakdown(&dataset.labels), invocation.tablefmt)
    );
    Ok(())
}
