use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use log::error;
use simplelog::{Config, LevelFilter, TermLogger, TerminalMode};
use structopt::StructOpt;

use sirfmemdump::flash::FlashInfoReport;
use sirfmemdump::host::gps::GpsMode;
use sirfmemdump::host::session::{Reply, Request, Session, SessionConfig};

/// Generous upper bound: a full reprogram at 38400 baud reads and
/// rewrites the whole device.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, StructOpt)]
#[structopt(
    name = "sirfmemdump",
    about = "Dump, erase and reprogram the external NOR flash of SiRF GPS receivers"
)]
struct Options {
    /// Verbosity level (0: errors, 1: progress, 2: debug, 3: raw)
    #[structopt(short = "v", long = "verbosity", default_value = "1")]
    verbosity: u8,

    /// Loader image injected into receiver RAM
    #[structopt(short = "l", long = "loader", default_value = "sirfmemdump.bin")]
    loader: PathBuf,

    /// Serial port
    #[structopt(short = "p", long = "port", default_value = "/dev/ttyp0")]
    port: String,

    /// Do not inject the loader (it is already running)
    #[structopt(short = "n", long = "no-loader")]
    no_loader: bool,

    /// Do not switch from SIRF to internal boot mode (the receiver
    /// is already there)
    #[structopt(short = "i", long = "no-boot-switch")]
    no_boot_switch: bool,

    /// Commands, consumed in order: ping | dump <from> <to> |
    /// exec <f> <r0> <r1> <r2> <r3> | flash-info |
    /// erase-sector <addr> | program-word <addr> <word> |
    /// program <file> | change-flash-mode <mode>
    #[structopt(required = true)]
    commands: Vec<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Ping,
    Dump { from: u32, to: u32 },
    Exec { f: u32, regs: [u32; 4] },
    FlashInfo,
    EraseSector { addr: u32 },
    ProgramWord { addr: u32, word: u16 },
    Program { file: PathBuf },
    ChangeFlashMode { mode: u8 },
}

/// strtoul-style number parsing: 0x hex, leading-0 octal, else
/// decimal.
fn parse_num(s: &str) -> anyhow::Result<u32> {
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else if s.len() > 1 && s.starts_with('0') {
        u32::from_str_radix(&s[1..], 8)
    } else {
        s.parse()
    };
    parsed.with_context(|| format!("malformed number `{}`", s))
}

fn parse_commands(args: &[String]) -> anyhow::Result<Vec<Command>> {
    let mut commands = Vec::new();
    let mut args = args.iter();

    let mut next_num = |what: &str, args: &mut std::slice::Iter<'_, String>| {
        args.next()
            .ok_or_else(|| anyhow!("{} not defined", what))
            .and_then(|s| parse_num(s))
    };

    while let Some(verb) = args.next() {
        let command = match verb.to_ascii_lowercase().as_str() {
            "ping" => Command::Ping,
            "dump" => {
                let from = next_num("src_addr", &mut args)?;
                let to = next_num("dst_addr", &mut args)?;
                if to < from {
                    bail!("dst_addr < src_addr");
                }
                Command::Dump { from, to }
            }
            "exec" => {
                let f = next_num("f_addr", &mut args)?;
                let mut regs = [0u32; 4];
                for (i, reg) in regs.iter_mut().enumerate() {
                    *reg = next_num(&format!("r{}", i), &mut args)?;
                }
                Command::Exec { f, regs }
            }
            "flash-info" => Command::FlashInfo,
            "erase-sector" => {
                let addr = next_num("address", &mut args)?;
                Command::EraseSector { addr }
            }
            "program-word" => {
                let addr = next_num("address", &mut args)?;
                let word = next_num("word", &mut args)?;
                Command::ProgramWord {
                    addr,
                    word: (word & 0xffff) as u16,
                }
            }
            "program" => {
                let file = args
                    .next()
                    .ok_or_else(|| anyhow!("firmware filename not defined"))?;
                Command::Program {
                    file: PathBuf::from(file),
                }
            }
            "change-flash-mode" => {
                let mode = next_num("mode", &mut args)?;
                Command::ChangeFlashMode {
                    mode: (mode & 0xff) as u8,
                }
            }
            other => bail!("unknown command `{}`", other),
        };
        commands.push(command);
    }

    Ok(commands)
}

fn level_filter(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Error,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn run_command(session: &Session, command: Command) -> anyhow::Result<()> {
    let request = match &command {
        Command::Ping => Request::Ping,
        Command::Dump { from, to } => Request::Dump {
            from: *from,
            to: *to,
            file: None,
        },
        Command::Exec { f, regs } => Request::Exec {
            f: *f,
            regs: *regs,
        },
        Command::FlashInfo => Request::FlashInfo,
        Command::EraseSector { addr } => Request::EraseSector { addr: *addr },
        Command::ProgramWord { addr, word } => Request::ProgramWord {
            addr: *addr,
            word: *word,
        },
        Command::Program { file } => Request::ProgramFlash { path: file.clone() },
        Command::ChangeFlashMode { mode } => Request::ChangeFlashMode { mode: *mode },
    };

    match session.run(request, REQUEST_TIMEOUT)? {
        Reply::Done => {}
        Reply::Dump(data) => {
            use std::io::Write;
            std::io::stdout()
                .write_all(&data)
                .context("write to stdout")?;
        }
        Reply::Regs(regs) => {
            println!(
                "R0: {:08x} R1: {:08x} R2: {:08x} R3: {:08x}",
                regs[0], regs[1], regs[2], regs[3]
            );
        }
        Reply::FlashInfo(info) => {
            print!("{}", FlashInfoReport(&info));
        }
        Reply::Program(stats) => {
            println!(
                "{} sectors: {} matched, {} erased, {} programmed",
                stats.sectors, stats.matched, stats.erased, stats.programmed
            );
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let options = Options::from_args();

    TermLogger::init(
        level_filter(options.verbosity),
        Config::default(),
        TerminalMode::Mixed,
    )
    .ok();

    let commands = parse_commands(&options.commands)?;

    let loader = if options.no_loader {
        None
    } else {
        Some(
            std::fs::read(&options.loader)
                .with_context(|| format!("loader image {}", options.loader.display()))?,
        )
    };

    let start_mode = if options.no_loader {
        GpsMode::Memdump
    } else if options.no_boot_switch {
        GpsMode::InternalBoot
    } else {
        GpsMode::Nmea
    };

    let session = Session::open(SessionConfig {
        port: options.port.clone(),
        loader,
        start_mode,
        ..SessionConfig::default()
    })
    .with_context(|| format!("open {}", options.port))?;

    for command in commands {
        let what = format!("{:?}", command);
        if let Err(e) = run_command(&session, command) {
            error!("{}: {:#}", what, e);
            return Err(e);
        }
    }

    Ok(())
}
