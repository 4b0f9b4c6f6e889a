use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use cadenza_core::{
    RenderSnapshot,
    diagnostics::init_tracing,
    export::export_wav,
    fixtures::{fade_project, scale_project},
    generate_parity_report,
    parity::write_parity_report,
};

#[derive(Debug, Parser)]
#[command(name = "cadenza-cli")]
#[command(about = "Headless tools for Cadenza export/parity workflows")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,
}

#[derive(Debug, Subcommand)]
enum Commands {
    DemoExport {
        #[arg(long, default_value = "data/exports")]
        output_dir: PathBuf,

        #[arg(long, value_enum, default_value = "scale")]
        fixture: Fixture,
    },
    ParityReport {
        #[arg(long, default_value = "data/parity/report.json")]
        output: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Fixture {
    Scale,
    Fade,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _telemetry = init_tracing(&cli.log_dir)?;

    match cli.command {
        Commands::DemoExport {
            output_dir,
            fixture,
        } => {
            let project = match fixture {
                Fixture::Scale => scale_project(),
                Fixture::Fade => fade_project(),
            };
            let snapshot = RenderSnapshot::build(&project);
            let file_name = match fixture {
                Fixture::Scale => "scale-demo.wav",
                Fixture::Fade => "fade-demo.wav",
            };
            let report = export_wav(
                &snapshot,
                project.block_size,
                &output_dir.join(file_name),
                None,
            )?;
            tracing::info!(
                path = %report.path.display(),
                duration_seconds = report.duration_seconds,
                "demo export finished"
            );
        }
        Commands::ParityReport { output } => {
            let report = generate_parity_report(&scale_project())?;
            write_parity_report(&output, &report)?;
            tracing::info!(path = %output.display(), "parity report generated");
        }
    }

    Ok(())
}
