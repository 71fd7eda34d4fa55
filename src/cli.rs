// ============================================================================
// impasto CLI — headless batch flatten / convert via command-line arguments
// ============================================================================
//
// Usage examples:
//   impasto --input sketch.imp --output flat.png
//   impasto -i photo.jpg -o out.png                  (format inferred from output ext)
//   impasto -i "shots/*.png" --output-dir converted/ --format jpeg --quality 85
//   impasto -i bg.png fg.png --stack --output merged.imp
//
// All processing runs synchronously on the current thread; the only
// parallelism is rayon's row-level data parallelism inside a composite.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;

use crate::canvas::CanvasState;
use crate::io::{self, SaveFormat};

// ============================================================================
// CLI argument definition (clap Derive)
// ============================================================================

/// impasto headless batch processor.
///
/// Flatten layered projects and convert between raster formats — no GUI
/// required.
#[derive(Parser, Debug)]
#[command(
    name = "impasto",
    about = "impasto headless batch image processor",
    long_about = "Flatten layered .imp projects and convert between raster formats.\n\
                  Supports PNG, JPEG, BMP and WEBP input; PNG, JPEG, BMP and IMP output.\n\n\
                  Example:\n  \
                  impasto --input sketch.imp --output flat.png\n  \
                  impasto -i \"*.png\" --output-dir out/ --format jpeg --quality 85"
)]
pub struct CliArgs {
    /// Input file(s). Glob patterns accepted (e.g. "*.png", "shots/*.jpg").
    /// IMP project files retain all layers; other formats load as one layer.
    #[arg(short, long, required = true, num_args = 1..)]
    pub input: Vec<String>,

    /// Output file path. Only valid for single-file input (or --stack).
    /// For batch input use --output-dir instead.
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Output directory for batch processing.
    /// Files are written here with the original stem and the target format's extension.
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Output format: png, jpeg, bmp, imp.
    /// When omitted, inferred from --output's extension, defaulting to png.
    #[arg(short, long, value_name = "FORMAT")]
    pub format: Option<String>,

    /// JPEG quality (1–100, default 90).
    #[arg(short, long, default_value_t = 90, value_name = "1-100")]
    pub quality: u8,

    /// Stack all inputs as layers of a single document (first input is the
    /// background and sets the canvas size) instead of processing each
    /// input separately.
    #[arg(long)]
    pub stack: bool,

    /// Print per-file timing information.
    #[arg(short, long)]
    pub verbose: bool,
}

// ============================================================================
// Public entry point
// ============================================================================

/// Run all CLI processing and return an OS exit code.
/// `0` = all files succeeded, `1` = one or more files failed.
pub fn run(args: CliArgs) -> ExitCode {
    let inputs = resolve_inputs(&args.input);
    if inputs.is_empty() {
        eprintln!("error: no input files matched the given pattern(s).");
        return ExitCode::FAILURE;
    }

    if inputs.len() > 1 && !args.stack && args.output.is_some() && args.output_dir.is_none() {
        eprintln!(
            "error: {} input files given but --output only accepts a single file path.\n\
             Use --output-dir for batch processing, or --stack to merge inputs into one document.",
            inputs.len()
        );
        return ExitCode::FAILURE;
    }

    let format = match parse_format(args.format.as_deref(), args.output.as_deref()) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if args.stack {
        return run_stacked(&inputs, &args, format);
    }

    let mut failures = 0usize;
    for input in &inputs {
        let started = std::time::Instant::now();
        match process_one(input, &args, format) {
            Ok(out_path) => {
                if args.verbose {
                    println!(
                        "{} → {} ({} ms)",
                        input.display(),
                        out_path.display(),
                        started.elapsed().as_millis()
                    );
                }
            }
            Err(e) => {
                eprintln!("error: {}: {}", input.display(), e);
                failures += 1;
            }
        }
    }

    if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Load every input as a layer of one document and write a single output.
fn run_stacked(inputs: &[PathBuf], args: &CliArgs, format: SaveFormat) -> ExitCode {
    let Some(output) = args.output.clone().or_else(|| {
        args.output_dir
            .as_ref()
            .map(|d| d.join(format!("stacked.{}", format.extension())))
    }) else {
        eprintln!("error: --stack requires --output or --output-dir.");
        return ExitCode::FAILURE;
    };

    let mut state: Option<CanvasState> = None;
    for input in inputs {
        let loaded = match io::load_input(input) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("error: {}: {}", input.display(), e);
                return ExitCode::FAILURE;
            }
        };
        match &mut state {
            None => state = Some(loaded),
            Some(doc) => {
                for mut layer in loaded.layers {
                    layer.is_background = false;
                    doc.layers.push(layer);
                }
            }
        }
    }
    let state = state.expect("inputs is non-empty");

    match write_output(&state, &output, format, args.quality) {
        Ok(()) => {
            if args.verbose {
                println!(
                    "stacked {} inputs ({} layers) → {}",
                    inputs.len(),
                    state.layers.len(),
                    output.display()
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {}: {}", output.display(), e);
            ExitCode::FAILURE
        }
    }
}

fn process_one(input: &Path, args: &CliArgs, format: SaveFormat) -> Result<PathBuf, String> {
    let state = io::load_input(input)?;
    let output = output_path_for(input, args, format)?;
    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    write_output(&state, &output, format, args.quality)?;
    Ok(output)
}

fn write_output(
    state: &CanvasState,
    output: &Path,
    format: SaveFormat,
    quality: u8,
) -> Result<(), String> {
    match format {
        SaveFormat::Project => io::save_project(state, output).map_err(|e| e.to_string()),
        raster => {
            let flat = state.flatten();
            io::encode_and_write(&flat, output, raster, quality)
        }
    }
}

fn output_path_for(input: &Path, args: &CliArgs, format: SaveFormat) -> Result<PathBuf, String> {
    if let Some(out) = &args.output {
        return Ok(out.clone());
    }
    let dir = args
        .output_dir
        .clone()
        .ok_or_else(|| "no --output or --output-dir given".to_string())?;
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output");
    Ok(dir.join(format!("{}.{}", stem, format.extension())))
}

/// Expand glob patterns / literal paths into concrete files.
fn resolve_inputs(patterns: &[String]) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for pattern in patterns {
        let mut matched = false;
        if let Ok(paths) = glob::glob(pattern) {
            for path in paths.flatten() {
                if path.is_file() {
                    out.push(path);
                    matched = true;
                }
            }
        }
        // A literal path with no glob hits still counts (error surfaces later)
        if !matched {
            let literal = PathBuf::from(pattern);
            if literal.is_file() {
                out.push(literal);
            }
        }
    }
    out
}

/// Pick the output format from --format, then the output extension,
/// defaulting to PNG.
fn parse_format(flag: Option<&str>, output: Option<&Path>) -> Result<SaveFormat, String> {
    if let Some(name) = flag {
        return SaveFormat::from_extension(name)
            .ok_or_else(|| format!("unknown format '{}' (png, jpeg, bmp, imp)", name));
    }
    if let Some(path) = output
        && let Some(ext) = path.extension().and_then(|e| e.to_str())
        && let Some(format) = SaveFormat::from_extension(ext)
    {
        return Ok(format);
    }
    Ok(SaveFormat::Png)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_resolution_order() {
        assert_eq!(parse_format(Some("jpeg"), None).unwrap(), SaveFormat::Jpeg);
        assert_eq!(
            parse_format(None, Some(Path::new("out.bmp"))).unwrap(),
            SaveFormat::Bmp
        );
        assert_eq!(parse_format(None, None).unwrap(), SaveFormat::Png);
        assert!(parse_format(Some("tga"), None).is_err());
    }

    #[test]
    fn flatten_convert_round_trip_on_disk() {
        let dir = std::env::temp_dir().join("impasto_test_cli");
        std::fs::create_dir_all(&dir).unwrap();
        let input = dir.join("input.png");
        let output = dir.join("output.png");

        let img = image::RgbaImage::from_pixel(5, 5, image::Rgba([0, 128, 255, 255]));
        img.save(&input).unwrap();

        let state = io::load_input(&input).unwrap();
        write_output(&state, &output, SaveFormat::Png, 90).unwrap();

        let reloaded = image::open(&output).unwrap().to_rgba8();
        assert_eq!(reloaded.dimensions(), (5, 5));
        assert_eq!(*reloaded.get_pixel(2, 2), image::Rgba([0, 128, 255, 255]));

        std::fs::remove_file(&input).ok();
        std::fs::remove_file(&output).ok();
    }
}
