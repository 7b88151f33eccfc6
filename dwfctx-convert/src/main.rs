// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::ops::Deref;
use std::panic;
use std::path::Path;
use std::str::FromStr;

use dwfctx::*;

use clap::{AppSettings, Arg, Command};
use log::{error, info};
use simplelog::{
    ColorChoice, ConfigBuilder, Level, LevelFilter, TermLogger, TerminalMode, WriteLogger,
};

fn make_app() -> Command<'static> {
    Command::new("dwfctx-convert")
        .version(clap::crate_version!())
        .about("Converts stackwalker crash reports into compact binary context files.")
        .next_line_help(true)
        .setting(AppSettings::DeriveDisplayOrder)
        .override_usage("dwfctx-convert [OPTIONS] --output-file <PATH> <report>")
        .arg(Arg::new("dump").long("dump").long_help(
            "Dump the contents of an existing context file.

With this flag the input is treated as a binary context file instead of a \
stackwalker report, and a human-readable rendition of it is printed to stdout. \
This is most useful for checking what a converted file actually contains, or \
for debugging dwfctx-convert itself.",
        ))
        .arg(
            Arg::new("limit")
                .long("limit")
                .short('l')
                .takes_value(true)
                .allow_hyphen_values(true)
                .default_value("-1")
                .long_help(
                    "The maximum number of threads to encode.

Reports from busy processes can carry hundreds of threads, most of them \
irrelevant to the crash. The report's threads are encoded in order until this \
many have been written and the rest are skipped entirely. A negative value \
means no limit.",
                ),
        )
        .arg(
            Arg::new("output-file")
                .long("output-file")
                .takes_value(true)
                .allow_invalid_utf8(true)
                .required_unless_present("dump")
                .help("Where to write the context file"),
        )
        .arg(
            Arg::new("log-file")
                .long("log-file")
                .takes_value(true)
                .allow_invalid_utf8(true)
                .help("Where to write logs to (if unspecified, stderr is used)"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .possible_values(&["off", "error", "warn", "info", "debug", "trace"])
                .default_value("error")
                .takes_value(true)
                .help("Set the logging level"),
        )
        .arg(
            Arg::new("report")
                .required(true)
                .takes_value(true)
                .allow_invalid_utf8(true)
                .help("Path to the stackwalker report to convert (with --dump, a context file)"),
        )
}

fn main() {
    let matches = make_app().get_matches();

    let log_file = matches
        .value_of_os("log-file")
        .map(|os_str| Path::new(os_str).to_owned());

    let verbosity = match matches.value_of("verbose").unwrap() {
        "off" => LevelFilter::Off,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Error,
    };

    // Init the logger (and make trace logging less noisy)
    if let Some(log_path) = log_file {
        let log_file = File::create(log_path).unwrap();
        let _ = WriteLogger::init(
            verbosity,
            ConfigBuilder::new()
                .set_location_level(LevelFilter::Off)
                .set_time_level(LevelFilter::Off)
                .set_thread_level(LevelFilter::Off)
                .set_target_level(LevelFilter::Off)
                .build(),
            log_file,
        )
        .unwrap();
    } else {
        let _ = TermLogger::init(
            verbosity,
            ConfigBuilder::new()
                .set_location_level(LevelFilter::Off)
                .set_time_level(LevelFilter::Off)
                .set_thread_level(LevelFilter::Off)
                .set_target_level(LevelFilter::Off)
                .set_level_color(Level::Trace, None)
                .build(),
            TerminalMode::Stderr,
            ColorChoice::Auto,
        );
    }

    // Set a panic hook to redirect to the logger
    panic::set_hook(Box::new(|panic_info| {
        let (filename, line) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line()))
            .unwrap_or(("<unknown>", 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref)
            .unwrap_or_else(|| {
                panic_info
                    .payload()
                    .downcast_ref::<&str>()
                    .copied()
                    .unwrap_or("<cause unknown>")
            });
        error!(
            "Panic - A panic occurred at {}:{}: {}",
            filename, line, cause
        );
    }));

    let limit = match i64::from_str(matches.value_of("limit").unwrap()) {
        Ok(limit) if limit < 0 => None,
        Ok(limit) => Some(limit as usize),
        Err(_) => {
            error!("Invalid --limit value (expected an integer)");
            std::process::exit(1);
        }
    };

    let input_path = matches.value_of_os("report").map(Path::new).unwrap();

    if matches.is_present("dump") {
        match ContextFile::read_path(input_path) {
            Ok(context) => {
                let mut stdout = std::io::stdout();
                context.print(&mut stdout).unwrap();
            }
            Err(err) => {
                error!("{} - Error reading context file: {}", err.name(), err);
                std::process::exit(1);
            }
        }
        return;
    }

    // A bad input path must fail before the output file is created.
    let report = match fs::read(input_path) {
        Ok(bytes) => bytes,
        Err(err) => {
            error!(
                "Error reading report file {}: {}",
                input_path.display(),
                err
            );
            std::process::exit(1);
        }
    };
    let context = parse_report(&String::from_utf8_lossy(&report));

    let output_path = matches.value_of_os("output-file").map(Path::new).unwrap();
    let output_f = match File::create(output_path) {
        Ok(f) => f,
        Err(err) => {
            error!(
                "Error creating output file {}: {}",
                output_path.display(),
                err
            );
            std::process::exit(1);
        }
    };

    let mut output = BufWriter::new(output_f);
    let encoded = match context
        .write(&mut output, limit)
        .and_then(|encoded| output.flush().map(|_| encoded))
    {
        Ok(encoded) => encoded,
        Err(err) => {
            error!(
                "Error writing context file {}: {}",
                output_path.display(),
                err
            );
            std::process::exit(1);
        }
    };

    info!(
        "Wrote {} of {} threads to {}",
        encoded,
        context.threads.len(),
        output_path.display()
    );
}
