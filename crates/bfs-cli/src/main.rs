#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use bootfs::{Attrs, BootFs, DirEntry, FileType, FsOps, OpenOptions};
use serde::Serialize;
use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Serialize)]
#[serde(tag = "filesystem", rename_all = "lowercase")]
enum InspectOutput {
    Hammer {
        label: String,
        version: u32,
        vol_count: i32,
        next_tid: u64,
        root_btree: u64,
    },
    Hammer2 {
        version: u32,
        header_slot: usize,
        mirror_tid: u64,
        volu_size: u64,
        root: u64,
    },
}

#[derive(Debug, Serialize)]
struct ListOutput<'a> {
    path: &'a str,
    entries: Vec<DirEntryOutput>,
}

#[derive(Debug, Serialize)]
struct DirEntryOutput {
    name: String,
    object: u64,
    kind: FileType,
}

impl From<&DirEntry> for DirEntryOutput {
    fn from(entry: &DirEntry) -> Self {
        Self {
            name: entry.name_str(),
            object: entry.object.0,
            kind: entry.kind,
        }
    }
}

/// Flags accepted by every command.
#[derive(Debug, Default)]
struct GlobalArgs {
    json: bool,
    config: Option<PathBuf>,
    positional: Vec<String>,
}

impl GlobalArgs {
    fn parse(args: impl IntoIterator<Item = String>) -> Result<Self> {
        let mut out = Self::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--json" => out.json = true,
                "--config" => {
                    let Some(path) = args.next() else {
                        bail!("--config requires a file argument");
                    };
                    out.config = Some(PathBuf::from(path));
                }
                flag if flag.starts_with("--") => bail!("unknown flag: {flag}"),
                _ => out.positional.push(arg),
            }
        }
        Ok(out)
    }

    fn options(&self) -> Result<OpenOptions> {
        let Some(path) = &self.config else {
            return Ok(OpenOptions::default());
        };
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        OpenOptions::from_json(&text)
            .with_context(|| format!("invalid config {}", path.display()))
    }
}

fn main() {
    install_tracing_subscriber();
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn install_tracing_subscriber() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };
    if matches!(command.as_str(), "--help" | "-h" | "help") {
        print_usage();
        return Ok(());
    }

    let global = GlobalArgs::parse(args)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    dispatch(&command, &global, &mut out)
}

fn dispatch(command: &str, global: &GlobalArgs, out: &mut impl Write) -> Result<()> {
    let (image, path) = match (command, global.positional.as_slice()) {
        ("inspect", [image]) | ("ls", [image]) => (image, "/"),
        ("ls" | "cat" | "stat", [image, path]) => (image, path.as_str()),
        ("inspect" | "ls" | "cat" | "stat", _) => {
            bail!("usage: bfs-cli {command} <image-path>{}", path_hint(command))
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    };

    let opts = global.options()?;
    let fs = BootFs::open(image, &opts)
        .with_context(|| format!("failed to open boot volume {image}"))?;
    debug!(format = %fs.format(), image = %image, "volume opened");

    match command {
        "inspect" => inspect(&fs, global.json, out),
        "ls" => list(&fs, path, global.json, out),
        "cat" => cat(&fs, path, out),
        _ => stat(&fs, path, global.json, out),
    }
}

fn path_hint(command: &str) -> &'static str {
    match command {
        "inspect" => "",
        "ls" => " [path]",
        _ => " <path>",
    }
}

fn print_usage() {
    println!("bfs-cli: read-only HAMMER/HAMMER2 boot volume inspector\n");
    println!("USAGE:");
    println!("  bfs-cli inspect <image-path> [--json]");
    println!("  bfs-cli ls <image-path> [path] [--json]");
    println!("  bfs-cli cat <image-path> <path>");
    println!("  bfs-cli stat <image-path> <path> [--json]");
    println!();
    println!("OPTIONS:");
    println!("  --config <file>   JSON open options (probe_order, cache_lines, hammer, hammer2)");
    println!("  --json            machine-readable output");
    println!();
    println!("Set RUST_LOG (e.g. RUST_LOG=debug) for tracing output on stderr.");
}

fn inspect(fs: &BootFs, json: bool, out: &mut impl Write) -> Result<()> {
    let output = match fs {
        BootFs::Hammer(h) => {
            let header = h.header();
            InspectOutput::Hammer {
                label: header.label.clone(),
                version: header.version,
                vol_count: header.vol_count,
                next_tid: header.next_tid,
                root_btree: header.root_btree,
            }
        }
        BootFs::Hammer2(h2) => {
            let header = h2.header();
            InspectOutput::Hammer2 {
                version: header.version,
                header_slot: h2.header_slot(),
                mirror_tid: header.mirror_tid,
                volu_size: header.volu_size,
                root: h2.root().0,
            }
        }
    };

    if json {
        writeln!(
            out,
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        )?;
        return Ok(());
    }

    writeln!(out, "bootfs inspector")?;
    match output {
        InspectOutput::Hammer {
            label,
            version,
            vol_count,
            next_tid,
            root_btree,
        } => {
            writeln!(out, "filesystem: hammer")?;
            writeln!(out, "label: {label}")?;
            writeln!(out, "version: {version}")?;
            writeln!(out, "vol_count: {vol_count}")?;
            writeln!(out, "next_tid: {next_tid:#x}")?;
            writeln!(out, "root_btree: {root_btree:#x}")?;
        }
        InspectOutput::Hammer2 {
            version,
            header_slot,
            mirror_tid,
            volu_size,
            root,
        } => {
            writeln!(out, "filesystem: hammer2")?;
            writeln!(out, "version: {version}")?;
            writeln!(out, "header_slot: {header_slot}")?;
            writeln!(out, "mirror_tid: {mirror_tid:#x}")?;
            writeln!(out, "volu_size: {volu_size}")?;
            writeln!(out, "root: {root:#x}")?;
        }
    }
    Ok(())
}

fn list(fs: &BootFs, path: &str, json: bool, out: &mut impl Write) -> Result<()> {
    let dir = fs.lookup(path).with_context(|| format!("lookup {path}"))?;
    let entries = fs.list_dir(dir).with_context(|| format!("readdir {path}"))?;

    if json {
        let output = ListOutput {
            path,
            entries: entries.iter().map(DirEntryOutput::from).collect(),
        };
        writeln!(out, "{}", serde_json::to_string_pretty(&output)?)?;
        return Ok(());
    }
    for entry in &entries {
        writeln!(out, "{} {:>18} {}", type_char(entry.kind), entry.object.0, entry.name_str())?;
    }
    Ok(())
}

fn cat(fs: &BootFs, path: &str, out: &mut impl Write) -> Result<()> {
    let obj = fs.lookup(path).with_context(|| format!("lookup {path}"))?;
    let mut buf = vec![0_u8; 64 * 1024];
    let mut offset = 0_u64;
    loop {
        let n = fs
            .read(obj, offset, &mut buf)
            .with_context(|| format!("read {path} at {offset}"))?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
        offset += n as u64;
    }
    Ok(())
}

fn stat(fs: &BootFs, path: &str, json: bool, out: &mut impl Write) -> Result<()> {
    let obj = fs.lookup(path).with_context(|| format!("lookup {path}"))?;
    let attrs: Attrs = fs.stat(obj).with_context(|| format!("stat {path}"))?;

    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(&attrs)?)?;
        return Ok(());
    }
    writeln!(out, "path: {path}")?;
    writeln!(out, "ino: {}", attrs.ino)?;
    writeln!(out, "kind: {:?}", attrs.kind)?;
    writeln!(out, "mode: {:o}", attrs.mode)?;
    writeln!(out, "uid: {}", attrs.uid)?;
    writeln!(out, "gid: {}", attrs.gid)?;
    writeln!(out, "size: {}", attrs.size)?;
    writeln!(out, "nlink: {}", attrs.nlink)?;
    let mtime = attrs
        .mtime
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    writeln!(out, "mtime: {mtime}")?;
    Ok(())
}

fn type_char(kind: FileType) -> char {
    match kind {
        FileType::Directory => 'd',
        FileType::RegularFile => '-',
        FileType::Symlink => 'l',
        FileType::BlockDevice => 'b',
        FileType::CharDevice => 'c',
        FileType::Fifo => 'p',
        FileType::Socket => 's',
        FileType::Unknown => '?',
    }
}
