use env_logger::Env;
use log::debug;
use std::path::Path;
use std::process;
use unlayer::docker::{locate_layers, ImageUnpacker, UnpackOptions, UnpackSummary};
use unlayer::{cli::*, UnlayerError};

fn main() {
    let cli = Cli::parse_args();

    let level = if cli.command.verbose() { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), UnlayerError> {
    match cli.command {
        Commands::Unpack {
            source,
            output,
            layer_suffix,
            keep_archives,
            report,
            verbose: _,
        } => {
            let output = match output {
                Some(output) => output,
                None => default_output_root(&source)?,
            };
            debug!("Unpacking {} into {}", source.display(), output.display());

            let unpacker = ImageUnpacker::new(UnpackOptions {
                layer_suffix,
                keep_archives,
            });

            let summary = match unpacker.unpack(&source, &output) {
                Ok(summary) => summary,
                Err(UnlayerError::AllLayersFailed(summary)) => {
                    write_report(report.as_deref(), &summary)?;
                    return Err(UnlayerError::AllLayersFailed(summary));
                }
                Err(e) => return Err(e),
            };
            write_report(report.as_deref(), &summary)?;

            println!(
                "Unpacked {} layers into {}: {} succeeded, {} failed, {} skipped",
                summary.layers.len(),
                output.display(),
                summary.succeeded(),
                summary.failed(),
                summary.skipped()
            );
        }

        Commands::List {
            source,
            layer_suffix,
            json,
        } => {
            let layers = locate_layers(&source, &layer_suffix)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&layers)?);
            } else {
                for layer in &layers {
                    match (&layer.link_target, layer.data_index) {
                        (Some(target), _) => {
                            println!("{}\t{} bytes\t-> {}", layer.path, layer.size, target)
                        }
                        (None, Some(_)) => println!("{}\t{} bytes", layer.path, layer.size),
                        (None, None) => println!("{}\t{}, not extractable", layer.path, layer.kind),
                    }
                }
                println!("{} layers found", layers.len());
            }
        }
    }

    Ok(())
}

fn write_report(path: Option<&Path>, summary: &UnpackSummary) -> Result<(), UnlayerError> {
    if let Some(path) = path {
        summary.write_json(path)?;
        debug!("Report written to {}", path.display());
    }
    Ok(())
}
