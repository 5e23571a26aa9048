#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use bfs_harness::{
    load_sparse_fixture, sample_hammer2_image, sample_hammer_image, save_sparse_fixture,
};
use std::env;
use std::fs;
use std::path::Path;

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str);

    match cmd {
        Some("generate") => generate(&args[1..]),
        Some("to-fixture") => {
            let [image, json] = two_paths(&args[1..], "to-fixture <image> <json>")?;
            let bytes =
                fs::read(image).with_context(|| format!("failed to read {}", image.display()))?;
            save_sparse_fixture(json, &bytes)?;
            println!("wrote {} ({} bytes of image)", json.display(), bytes.len());
            Ok(())
        }
        Some("from-fixture") => {
            let [json, image] = two_paths(&args[1..], "from-fixture <json> <image>")?;
            let bytes = load_sparse_fixture(json)?;
            fs::write(image, &bytes)
                .with_context(|| format!("failed to write {}", image.display()))?;
            println!("wrote {} ({} bytes)", image.display(), bytes.len());
            Ok(())
        }
        Some("--help" | "-h" | "help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

fn two_paths<'a>(args: &'a [String], usage: &str) -> Result<[&'a Path; 2]> {
    match args {
        [a, b] => Ok([Path::new(a), Path::new(b)]),
        _ => bail!("usage: bfs-harness {usage}"),
    }
}

fn generate(args: &[String]) -> Result<()> {
    let (format, out) = match args {
        [format, out] => (format.as_str(), Path::new(out)),
        _ => bail!("usage: bfs-harness generate <hammer|hammer2> <out>"),
    };
    let image = match format {
        "hammer" => sample_hammer_image()?,
        "hammer2" => sample_hammer2_image()?,
        other => bail!("unknown format: {other} (expected hammer or hammer2)"),
    };
    fs::write(out, &image).with_context(|| format!("failed to write {}", out.display()))?;
    println!("{format}: wrote {} bytes to {}", image.len(), out.display());
    Ok(())
}

fn print_usage() {
    println!("bfs-harness: synthetic boot volume tooling");
    println!();
    println!("USAGE:");
    println!("  bfs-harness generate <hammer|hammer2> <out>");
    println!("  bfs-harness to-fixture <image> <json>");
    println!("  bfs-harness from-fixture <json> <image>");
}
