use std::fs::File;
use std::io::BufReader;
use std::time::Duration;

use clap::{Parser, Subcommand};
use epubdump::{Container, Dumper, DEFAULT_MARKER};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct ActionInfo {
    /// Input .epub path
    #[arg(index = 1)]
    input: String,

    /// AES-128 content key as hex or base64, used to check the encrypted members
    #[arg(short, long)]
    key: Option<String>,
}

#[derive(Parser, Debug)]
struct ActionList {
    /// Input .epub path
    #[arg(index = 1)]
    input: String,

    /// AES-128 content key as hex or base64, used to check the encrypted members
    #[arg(short, long)]
    key: Option<String>,

    /// Only list encrypted members
    #[arg(short, long, default_value = "false")]
    encrypted: bool,
}

#[derive(Parser, Debug)]
struct ActionDump {
    /// Input .epub path
    #[arg(index = 1)]
    input: String,

    /// AES-128 content key as hex or base64
    #[arg(short, long)]
    key: String,

    /// Inserted before the extension of the input to name the output
    #[arg(short, long, default_value = DEFAULT_MARKER)]
    marker: String,

    /// Hide the progress bar
    #[arg(short, long, default_value = "false")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Print .epub info
    Info(ActionInfo),
    /// List .epub members
    List(ActionList),
    /// Write a decrypted copy of the .epub next to it
    Dump(ActionDump),
}

#[derive(Parser, Debug)]
#[command(author, version)]
struct Args {
    /// Enable debug output. RUST_LOG takes precedence
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    action: Action,
}

fn main() -> Result<(), epubdump::Error> {
    let args = Args::parse();

    let level = if args.verbose > 0 { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match args.action {
        Action::Info(args) => info(args),
        Action::List(args) => list(args),
        Action::Dump(args) => dump(args),
    }
}

/// Accepts 32 hex digits or the base64 encoding of 16 bytes.
fn aes_key(key: &str) -> Result<Vec<u8>, epubdump::Error> {
    use base64::{engine::general_purpose, Engine as _};
    let key = key.trim();
    let bytes = if key.len() == 32 && key.bytes().all(|b| b.is_ascii_hexdigit()) {
        hex::decode(key).map_err(|_| epubdump::Error::KeyFormat)?
    } else {
        general_purpose::STANDARD
            .decode(key)
            .map_err(|_| epubdump::Error::KeyFormat)?
    };
    if bytes.len() != epubdump::cipher::AES128_KEY_SIZE {
        return Err(epubdump::Error::KeyFormat);
    }
    Ok(bytes)
}

fn open(input: &str, key: Option<&str>) -> Result<Container<BufReader<File>>, epubdump::Error> {
    let key = key.map(aes_key).transpose()?.unwrap_or_default();
    let file = File::open(input).map_err(|err| epubdump::Error::OpenArchive(err.into()))?;
    Container::open(BufReader::new(file), &key)
}

fn info(args: ActionInfo) -> Result<(), epubdump::Error> {
    let container = open(&args.input, args.key.as_deref())?;
    println!("root file: {}", container.root_file());
    println!("{} members", container.len());
    println!("{} encrypted members", container.manifest().len());
    Ok(())
}

fn list(args: ActionList) -> Result<(), epubdump::Error> {
    let container = open(&args.input, args.key.as_deref())?;
    for index in 0..container.len() {
        if args.encrypted && !container.is_encrypted(index) {
            continue;
        }
        if let Some(name) = container.name(index) {
            println!("{name}");
        }
    }
    Ok(())
}

fn dump(args: ActionDump) -> Result<(), epubdump::Error> {
    let key = aes_key(&args.key)?;

    let bar = if args.quiet {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("[{bar:40.cyan/blue}] {pos}/{len} {wide_msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        bar
    };

    let dumper = {
        let bar = bar.clone();
        Dumper::builder()
            .marker(args.marker)
            .progress(move |progress| {
                bar.set_length(progress.total as u64);
                bar.set_position(progress.index as u64);
                bar.set_message(progress.name.to_owned());
            })
            .build()
    };

    let output = dumper.open(&args.input, &key)?;
    let report = dumper.dump();
    dumper.close();
    let report = report?;
    bar.finish_and_clear();

    println!("{}", output.display());
    println!(
        "{} encrypted members decrypted, {} copied, {} skipped, {} failed",
        report.decrypted, report.copied, report.skipped, report.failed
    );
    if !report.is_complete() {
        return Err(epubdump::Error::Incomplete {
            decrypted: report.decrypted,
            expected: report.expected,
        });
    }
    Ok(())
}
