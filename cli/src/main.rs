use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use spark_tunnel_runner::prelude::{
    load_scenarios, run, DeploymentArgs, DescriptorBuilder, ResultsStore, RunArgs, RunBatch,
    Scenario,
};

mod table;

use table::{results_table, sort_by_elapsed, RunRow};

#[derive(Parser)]
#[command(name = "spark-tunnel", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every scenario in a configuration file, each on a fresh deployment
    Run {
        /// JSON file listing the scenarios to run
        config: PathBuf,

        #[command(flatten)]
        args: RunArgs,
    },
    /// Check a configuration file and the deployments its scenarios would need
    Validate {
        config: PathBuf,

        #[command(flatten)]
        deployment: DeploymentArgs,
    },
    /// Print the compose document for each scenario, or write them to a directory
    Render {
        config: PathBuf,

        /// Write `<out>/<scenario>/docker-compose.yml` instead of printing
        #[arg(long)]
        out: Option<PathBuf>,

        #[command(flatten)]
        deployment: DeploymentArgs,
    },
    /// Print a table of every run recorded under the results root, fastest first
    Summary {
        #[arg(long, env = "ST_RESULTS_ROOT", default_value = "results")]
        results_root: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run { config, args } => {
            let scenarios = load_scenarios(&config)?;
            let batch = run(&args.to_config(), &scenarios)?;
            print_batch(&batch);
        }
        Command::Validate { config, deployment } => {
            let scenarios = load_scenarios(&config)?;
            let builder = DescriptorBuilder::new(deployment.to_descriptor_config());

            let mut ready = 0;
            for scenario in &scenarios {
                match builder.build(scenario) {
                    Ok(_) => ready += 1,
                    Err(e) => println!("Scenario '{}' cannot be deployed: {e}", scenario.name()),
                }
            }
            println!(
                "{ready} of {} scenario(s) in '{}' are ready to run",
                scenarios.len(),
                config.display()
            );
        }
        Command::Render {
            config,
            out,
            deployment,
        } => {
            let scenarios = load_scenarios(&config)?;
            let builder = DescriptorBuilder::new(deployment.to_descriptor_config());
            match out {
                Some(out) => {
                    for path in write_compose_files(&builder, &scenarios, &out)? {
                        println!("Wrote {}", path.display());
                    }
                }
                None => {
                    for scenario in &scenarios {
                        let document = render_compose(&builder, scenario)?;
                        println!("# {}\n---\n{document}", scenario.name());
                    }
                }
            }
        }
        Command::Summary { results_root } => {
            let batches = ResultsStore::new(&results_root).load_batches()?;
            let mut rows = batches
                .iter()
                .flat_map(|(batch, results)| results.iter().map(|r| RunRow::new(batch, r)))
                .collect::<Vec<_>>();
            sort_by_elapsed(&mut rows);

            if rows.is_empty() {
                println!("No runs recorded under '{}'", results_root.display());
            } else {
                println!("{}", results_table(&rows));
            }
        }
    }

    Ok(())
}

fn print_batch(batch: &RunBatch) {
    println!("\nSummary of batch {}", batch.batch_timestamp);
    let rows = batch
        .results
        .iter()
        .map(|r| RunRow::new(&batch.batch_timestamp, r))
        .collect::<Vec<_>>();
    println!("{}", results_table(&rows));

    for result in batch.results.iter().filter(|r| !r.is_success()) {
        if let Some(detail) = &result.error_detail {
            println!("{}: {detail}", result.scenario_name);
        }
    }

    if !batch.unpersisted.is_empty() {
        log::error!(
            "Results were not saved for: {}",
            batch.unpersisted.join(", ")
        );
    }
}

fn render_compose(builder: &DescriptorBuilder, scenario: &Scenario) -> anyhow::Result<String> {
    let descriptor = builder.build(scenario)?;
    descriptor
        .to_compose_yaml()
        .with_context(|| format!("Failed to render compose file for '{}'", scenario.name()))
}

fn write_compose_files(
    builder: &DescriptorBuilder,
    scenarios: &[Scenario],
    out: &Path,
) -> anyhow::Result<Vec<PathBuf>> {
    let mut written = Vec::with_capacity(scenarios.len());
    for scenario in scenarios {
        let document = render_compose(builder, scenario)?;
        let dir = out.join(scenario.name());
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create '{}'", dir.display()))?;
        let path = dir.join("docker-compose.yml");
        fs::write(&path, document)
            .with_context(|| format!("Failed to write '{}'", path.display()))?;
        written.push(path);
    }
    Ok(written)
}
