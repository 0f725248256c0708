// crates/vidpress-cli/src/report.rs
//
// Terminal and JSON rendering of job results.

use serde_json::{json, Value};

use vidpress_core::helpers::geometry::resolve;
use vidpress_core::helpers::time::{format_duration, format_file_size};
use vidpress_core::{CompressionError, CompressionOutput, QualityTier, SourceAsset};

pub fn print_progress(fraction: f64, message: &str) {
    eprintln!("{:>5.1}%  {message}", fraction * 100.0);
}

pub fn print_done(output: &CompressionOutput, as_json: bool) {
    if as_json {
        println!("{}", done_json(output));
        return;
    }
    println!("{}", output.path.display());
    eprintln!(
        "{} → {} ({}% smaller)",
        format_file_size(output.original_size),
        format_file_size(output.compressed_size),
        output.reduction_percent(),
    );
}

pub fn print_error(error: &CompressionError, as_json: bool) {
    if as_json {
        println!("{}", failure_json(error.kind(), &error.to_string()));
    } else if error.is_cancelled() {
        eprintln!("{}", error.description());
    } else {
        eprintln!("{}: {error}", error.description());
    }
}

pub fn print_estimates(asset: &SourceAsset, as_json: bool) {
    if as_json {
        println!("{}", estimates_json(asset));
        return;
    }
    println!(
        "{}  {}  {}x{}  {}",
        asset.path.display(),
        format_duration(asset.duration_secs),
        asset.natural_size.width,
        asset.natural_size.height,
        format_file_size(asset.file_size),
    );
    for tier in QualityTier::ALL {
        let g = resolve(asset.natural_size, &asset.transform, tier.max_dimension());
        println!(
            "  {:<8} {:>9}x{:<5} ~{:<10} {}",
            tier.label(),
            g.width,
            g.height,
            format_file_size(tier.estimated_size(asset.file_size)),
            tier.description(),
        );
    }
}

pub fn done_json(output: &CompressionOutput) -> Value {
    json!({
        "status":            "ok",
        "path":              output.path,
        "tier":              output.tier,
        "geometry":          output.geometry,
        "original_size":     output.original_size,
        "compressed_size":   output.compressed_size,
        "reduction_percent": output.reduction_percent(),
    })
}

pub fn failure_json(kind: &str, message: &str) -> Value {
    json!({ "status": "error", "kind": kind, "message": message })
}

fn estimates_json(asset: &SourceAsset) -> Value {
    let tiers: Vec<Value> = QualityTier::ALL
        .iter()
        .map(|&tier| {
            json!({
                "tier":           tier,
                "geometry":       resolve(asset.natural_size, &asset.transform, tier.max_dimension()),
                "estimated_size": tier.estimated_size(asset.file_size),
            })
        })
        .collect();
    json!({
        "path":          asset.path,
        "duration_secs": asset.duration_secs,
        "width":         asset.natural_size.width,
        "height":        asset.natural_size.height,
        "rotation":      asset.transform.rotation_degrees(),
        "has_audio":     asset.has_audio,
        "file_size":     asset.file_size,
        "tiers":         tiers,
    })
}
